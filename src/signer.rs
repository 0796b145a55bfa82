//! Short tokens embedded in serving URLs.

use subtle::ConstantTimeEq;

use crate::digest::sha256_hex;

/// Hex characters kept from the digest.
pub const TOKEN_LEN: usize = 4;

/// Derives the token in `/file/<file_id>/<instance>/<token>` URLs.
///
/// A token is the first four hex characters of
/// `SHA-256("<file_id>:<instance>" + secret)`. That is 16 bits: enough to stop
/// URL guessing across file ids and casual edits of the instance segment, far
/// too little to act as access control. Authorization belongs in front of this
/// service. Without a secret the token is a pure function of public values.
#[derive(Debug, Clone, Default)]
pub struct UrlSigner {
    secret: Option<String>,
}

impl UrlSigner {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
        }
    }

    pub fn generate_token(&self, file_id: &str, instance: &str) -> String {
        let mut input = format!("{file_id}:{instance}");
        if let Some(ref secret) = self.secret {
            input.push_str(secret);
        }
        let mut digest = sha256_hex(input.as_bytes());
        digest.truncate(TOKEN_LEN);
        digest
    }

    /// Path segments are percent-encoded; the token is over the raw values.
    pub fn signed_url(&self, file_id: &str, instance: &str) -> String {
        format!(
            "/file/{}/{}/{}",
            urlencoding::encode(file_id),
            urlencoding::encode(instance),
            self.generate_token(file_id, instance)
        )
    }

    /// Compare without short-circuiting on the first differing byte.
    pub fn verify_token(&self, file_id: &str, instance: &str, token: &str) -> bool {
        let expected = self.generate_token(file_id, instance);
        expected.as_bytes().ct_eq(token.as_bytes()).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_is_short_hex_and_deterministic() {
        let signer = UrlSigner::new(Some("s3cret".to_string()));
        let token = signer.generate_token("abc", "thumbnail");
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token, signer.generate_token("abc", "thumbnail"));
    }

    #[test]
    fn test_token_matches_digest_prefix() {
        let signer = UrlSigner::new(Some("k".to_string()));
        assert_eq!(
            signer.generate_token("f1", "original"),
            sha256_hex(b"f1:originalk")[..TOKEN_LEN]
        );

        let unsigned = UrlSigner::new(None);
        assert_eq!(
            unsigned.generate_token("f1", "original"),
            sha256_hex(b"f1:original")[..TOKEN_LEN]
        );
    }

    #[test]
    fn test_empty_secret_counts_as_none() {
        assert_eq!(
            UrlSigner::new(Some(String::new())).generate_token("f", "i"),
            UrlSigner::new(None).generate_token("f", "i")
        );
    }

    #[test]
    fn test_signed_url_round_trips_through_verify() {
        let signer = UrlSigner::new(Some("s3cret".to_string()));
        let url = signer.signed_url("abc", "medium");
        let token = url.rsplit('/').next().unwrap();
        assert!(url.starts_with("/file/abc/medium/"));
        assert!(signer.verify_token("abc", "medium", token));
    }

    #[test]
    fn test_signed_url_encodes_instance_segment() {
        let signer = UrlSigner::new(Some("s3cret".to_string()));
        let url = signer.signed_url("abc", "hero banner?v=2#top");
        let token = signer.generate_token("abc", "hero banner?v=2#top");
        assert_eq!(url, format!("/file/abc/hero%20banner%3Fv%3D2%23top/{token}"));

        let segment = url.split('/').nth(3).unwrap();
        let decoded = urlencoding::decode(segment).unwrap();
        assert!(signer.verify_token("abc", &decoded, &token));
    }

    #[test]
    fn test_verify_rejects_other_tokens() {
        let signer = UrlSigner::new(Some("s3cret".to_string()));
        let token = signer.generate_token("abc", "medium");
        let wrong = if token == "0000" { "0001" } else { "0000" };

        assert!(!signer.verify_token("abc", "medium", wrong));
        assert!(!signer.verify_token("abc", "medium", ""));
        assert!(!signer.verify_token("abc", "medium", &format!("{token}0")));
    }

    #[test]
    fn test_secret_changes_tokens() {
        let inputs = [("a", "original"), ("b", "original"), ("c", "thumbnail"), ("d", "medium")];
        let one = UrlSigner::new(Some("one".to_string()));
        let two = UrlSigner::new(Some("two".to_string()));
        assert!(inputs
            .iter()
            .any(|(f, i)| one.generate_token(f, i) != two.generate_token(f, i)));
    }
}
