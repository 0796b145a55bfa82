use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::handlers;
use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Multipart framing on top of the file itself.
    let upload_limit = state.config.max_upload_size as usize + 64 * 1024;

    let mut router = Router::new()
        // Files
        .route("/files", get(handlers::list_files))
        .route(
            "/files",
            post(handlers::create_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/files/:id", get(handlers::get_file))
        .route("/files/:id", delete(handlers::delete_file))
        .route("/files/:id/variants", post(handlers::generate_variants))
        // Signed content delivery
        .route("/file/:file_id/:instance/:token", get(handlers::serve_file))
        // Live configuration
        .route("/admin/settings", get(handlers::get_settings))
        .route("/admin/settings", put(handlers::put_settings))
        .route("/admin/buckets", get(handlers::list_buckets))
        .route("/admin/buckets/:id", put(handlers::put_bucket))
        .route("/admin/buckets/:id", delete(handlers::delete_bucket))
        .route("/admin/dimensions", get(handlers::get_dimensions))
        .route("/admin/dimensions", put(handlers::put_dimensions))
        // Internal
        .route("/_internal/health", get(handlers::health));

    // Test-only routes
    if state.config.test_mode {
        tracing::warn!("Test mode enabled. The purge route is available.");
        router = router.route("/admin/purge", delete(handlers::admin_purge));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::testutil::test_state;

    const BOUNDARY: &str = "asset-store-test-boundary";

    fn multipart_upload(filename: &str, content_type: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"owner_id\"\r\n\r\nowner-1\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/files")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn get(app: &Router, uri: &str, range: Option<&str>) -> axum::response::Response {
        let mut request = Request::builder().uri(uri);
        if let Some(range) = range {
            request = request.header(header::RANGE, range);
        }
        app.clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    /// Upload `data` and return (file id, signed URL of the original).
    async fn upload(app: &Router, data: &[u8]) -> (String, String) {
        let response = app
            .clone()
            .oneshot(multipart_upload("notes.txt", "text/plain", data))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = json_body(response).await;
        assert_eq!(json["status"], "success");
        assert_eq!(json["data"]["replication"]["succeeded"], 2);
        let id = json["data"]["id"].as_str().unwrap().to_string();
        let url = json["data"]["instances"][0]["url"].as_str().unwrap().to_string();
        (id, url)
    }

    #[tokio::test]
    async fn test_health() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let response = get(&app, "/_internal/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["status"], "ok");
    }

    #[tokio::test]
    async fn test_upload_then_serve_full_body() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        let data = b"0123456789abcdefghij";

        let (id, url) = upload(&app, data).await;
        assert!(url.starts_with(&format!("/file/{id}/original/")));

        let response = get(&app, &url, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert_eq!(headers[header::CONTENT_LENGTH], "20");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert!(headers[header::ETAG].to_str().unwrap().starts_with('"'));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], data);
    }

    #[tokio::test]
    async fn test_serve_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        let (_, url) = upload(&app, b"0123456789abcdefghij").await;

        let response = get(&app, &url, Some("bytes=5-9")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 5-9/20");
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"56789");

        let response = get(&app, &url, Some("bytes=15-")).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"fghij");
    }

    #[tokio::test]
    async fn test_serve_rejects_bad_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        let (_, url) = upload(&app, b"0123456789").await;

        let response = get(&app, &url, Some("bytes=5-50")).await;
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10");

        let response = get(&app, &url, Some("bytes=x-y")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_conditional_get_honours_etag_lists() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        let (_, url) = upload(&app, b"cacheable").await;

        let etag = get(&app, &url, None).await.headers()[header::ETAG]
            .to_str()
            .unwrap()
            .to_string();

        for candidate in [etag.clone(), "*".to_string(), format!("\"stale\", {etag}")] {
            let response = app
                .clone()
                .oneshot(
                    Request::builder()
                        .uri(&url)
                        .header(header::IF_NONE_MATCH, candidate.as_str())
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_MODIFIED, "{candidate}");
            assert_eq!(response.headers()[header::ETAG], etag.as_str());
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(&url)
                    .header(header::IF_NONE_MATCH, "\"stale\"")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_bad_token_is_forbidden_before_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let response = get(&app, "/file/does-not-exist/original/zzzz", None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let (_, url) = upload(&app, b"payload").await;
        let (base, token) = url.rsplit_once('/').unwrap();
        let wrong = if token == "0000" { "0001" } else { "0000" };
        let response = get(&app, &format!("{base}/{wrong}"), None).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_delete_hides_file_and_removes_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(&dir);
        let app = create_router(state.clone());
        let (id, url) = upload(&app, b"short-lived").await;

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/files/{id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["data"]["replicas_deleted"], 2);

        assert_eq!(get(&app, &url, None).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            get(&app, &format!("/files/{id}"), None).await.status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_list_files_filters_by_owner() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));
        upload(&app, b"one").await;
        upload(&app, b"two").await;

        let json = json_body(get(&app, "/files?owner_id=owner-1&limit=1", None).await).await;
        assert_eq!(json["data"]["pagination"]["total"], 2);
        assert_eq!(json["data"]["items"].as_array().unwrap().len(), 1);

        let json = json_body(get(&app, "/files?owner_id=someone-else", None).await).await;
        assert_eq!(json["data"]["pagination"]["total"], 0);

        let json = json_body(get(&app, "/files?file_type=image", None).await).await;
        assert_eq!(json["data"]["pagination"]["total"], 0);
    }

    #[tokio::test]
    async fn test_settings_validate_redundancy() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let put = |body: &'static str| {
            Request::builder()
                .method("PUT")
                .uri("/admin/settings")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body))
                .unwrap()
        };

        let response = app.clone().oneshot(put(r#"{"redundancy_copies": 9}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app.clone().oneshot(put(r#"{"redundancy_copies": 3}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["data"]["redundancy_copies"], 3);
        assert_eq!(json["data"]["auto_generate_variants"], true);
    }

    #[tokio::test]
    async fn test_dimensions_reject_reserved_name() {
        let dir = tempfile::tempdir().unwrap();
        let app = create_router(test_state(&dir));

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/admin/dimensions")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(
                        r#"[{"name": "original", "file_type": "image", "width": 10}]"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
