use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{open_destination, validate_object_path, BucketProvider, ProviderError, StoreInfo};
use crate::storage::models::Bucket;

const API_BASE: &str = "https://storage.googleapis.com";

/// Google Cloud Storage buckets. Each bucket's `target` is the GCS bucket name;
/// one set of credentials serves all of them.
pub struct GcsProvider {
    client: Client,
    token: RwLock<Option<CachedToken>>,
    credentials_file: Option<String>,
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    token_uri: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: i64,
}

fn default_expiry() -> i64 {
    3600
}

impl GcsProvider {
    pub async fn new(credentials_file: Option<&str>) -> Result<Self, anyhow::Error> {
        let provider = Self {
            client: Client::builder().build()?,
            token: RwLock::new(None),
            credentials_file: credentials_file.map(|s| s.to_string()),
        };

        // Fail at startup rather than on the first upload if credentials are broken.
        provider.access_token().await?;
        Ok(provider)
    }

    /// Current bearer token, refreshed a minute before it expires.
    async fn access_token(&self) -> Result<String, anyhow::Error> {
        if let Some(cached) = self.token.read().await.as_ref() {
            if cached.expires_at > Utc::now() + Duration::seconds(60) {
                return Ok(cached.value.clone());
            }
        }

        let response = match self.credentials_file {
            Some(ref path) => self.token_from_service_account(path).await?,
            None => self.token_from_metadata_server().await?,
        };
        let cached = CachedToken {
            value: response.access_token,
            expires_at: Utc::now() + Duration::seconds(response.expires_in),
        };
        let value = cached.value.clone();
        *self.token.write().await = Some(cached);
        Ok(value)
    }

    async fn bearer(&self) -> Result<String, ProviderError> {
        self.access_token()
            .await
            .map_err(|e| ProviderError::Backend(format!("GCS authentication failed: {e}")))
    }

    async fn token_from_service_account(&self, path: &str) -> Result<TokenResponse, anyhow::Error> {
        let key_json = tokio::fs::read_to_string(path).await?;
        let key: ServiceAccountKey = serde_json::from_str(&key_json)?;

        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": key.client_email,
            "scope": "https://www.googleapis.com/auth/devstorage.read_write",
            "aud": key.token_uri,
            "iat": now,
            "exp": now + 3600,
        });

        let header = base64_url_encode(&serde_json::to_vec(&serde_json::json!({
            "alg": "RS256",
            "typ": "JWT"
        }))?);
        let payload = base64_url_encode(&serde_json::to_vec(&claims)?);
        let unsigned = format!("{header}.{payload}");
        let signature = sign_rs256(unsigned.as_bytes(), &key.private_key)?;
        let jwt = format!("{unsigned}.{}", base64_url_encode(&signature));

        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", &jwt),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    async fn token_from_metadata_server(&self) -> Result<TokenResponse, anyhow::Error> {
        let resp = self
            .client
            .get("http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token")
            .header("Metadata-Flavor", "Google")
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(resp)
    }

    fn upload_url(bucket: &Bucket, key: &str) -> String {
        format!(
            "{API_BASE}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            bucket.target,
            urlencoding::encode(key)
        )
    }

    fn object_url(bucket: &Bucket, key: &str) -> String {
        format!(
            "{API_BASE}/storage/v1/b/{}/o/{}",
            bucket.target,
            urlencoding::encode(key)
        )
    }
}

async fn backend_failure(action: &str, resp: reqwest::Response) -> ProviderError {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    ProviderError::Backend(format!("GCS {action} failed ({status}): {body}"))
}

fn transport(e: reqwest::Error) -> ProviderError {
    ProviderError::Backend(e.to_string())
}

#[async_trait]
impl BucketProvider for GcsProvider {
    async fn store(
        &self,
        bucket: &Bucket,
        source: &Path,
        destination: &str,
        content_type: &str,
    ) -> Result<StoreInfo, ProviderError> {
        validate_object_path(destination)?;
        let data = Bytes::from(tokio::fs::read(source).await?);
        let byte_size = data.len() as u64;
        let token = self.bearer().await?;

        let resp = self
            .client
            .post(Self::upload_url(bucket, destination))
            .bearer_auth(&token)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(transport)?;

        if !resp.status().is_success() {
            return Err(backend_failure("upload", resp).await);
        }

        Ok(StoreInfo { byte_size })
    }

    async fn retrieve(
        &self,
        bucket: &Bucket,
        remote_path: &str,
        destination: &Path,
    ) -> Result<(), ProviderError> {
        validate_object_path(remote_path)?;
        let token = self.bearer().await?;

        let resp = self
            .client
            .get(format!("{}?alt=media", Self::object_url(bucket, remote_path)))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport)?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(ProviderError::NotFound(remote_path.to_string()));
        }
        if !resp.status().is_success() {
            return Err(backend_failure("download", resp).await);
        }

        let data = resp.bytes().await.map_err(transport)?;
        let mut output = open_destination(destination).await?;
        output.write_all(&data).await?;
        output.flush().await?;
        Ok(())
    }

    async fn delete(&self, bucket: &Bucket, remote_path: &str) -> Result<(), ProviderError> {
        validate_object_path(remote_path)?;
        let token = self.bearer().await?;

        let resp = self
            .client
            .delete(Self::object_url(bucket, remote_path))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport)?;

        // 404 is fine -- object already gone
        if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
            return Err(backend_failure("delete", resp).await);
        }

        Ok(())
    }

    async fn exists(&self, bucket: &Bucket, remote_path: &str) -> Result<bool, ProviderError> {
        validate_object_path(remote_path)?;
        let token = self.bearer().await?;

        let resp = self
            .client
            .get(Self::object_url(bucket, remote_path))
            .bearer_auth(&token)
            .send()
            .await
            .map_err(transport)?;

        match resp.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(backend_failure("metadata lookup", resp).await),
        }
    }

    fn public_url(&self, bucket: &Bucket, remote_path: &str) -> Option<String> {
        let base = bucket
            .cdn_url
            .clone()
            .unwrap_or_else(|| format!("{API_BASE}/{}", bucket.target));
        Some(format!("{}/{}", base.trim_end_matches('/'), remote_path))
    }
}

fn base64_url_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(data)
}

fn sign_rs256(data: &[u8], private_key_pem: &str) -> Result<Vec<u8>, anyhow::Error> {
    // Strip PEM armour and decode the PKCS#8 body
    let der_b64: String = private_key_pem
        .lines()
        .filter(|line| !line.starts_with("-----"))
        .collect();
    let der = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, der_b64.trim())?;

    let key_pair = ring::signature::RsaKeyPair::from_pkcs8(&der)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {e}"))?;

    let mut signature = vec![0u8; key_pair.public().modulus_len()];
    key_pair
        .sign(
            &ring::signature::RSA_PKCS1_SHA256,
            &ring::rand::SystemRandom::new(),
            data,
            &mut signature,
        )
        .map_err(|e| anyhow::anyhow!("Failed to sign: {e}"))?;

    Ok(signature)
}
