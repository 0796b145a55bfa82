use std::io::SeekFrom;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

use super::serve_error;
use crate::api::response::ApiError;
use crate::server::{etag_matches, parse_range_header, HeaderOptions, RangeError};
use crate::AppState;

/// Serve instance bytes behind a signed URL.
/// Route: GET /file/:file_id/:instance/:token
pub async fn serve_file(
    State(state): State<Arc<AppState>>,
    Path((file_id, instance, token)): Path<(String, String, String)>,
    request_headers: HeaderMap,
) -> Result<Response, ApiError> {
    // Checked before any lookup so bad tokens reveal nothing about existence.
    if !state.signer.verify_token(&file_id, &instance, &token) {
        return Err(ApiError::forbidden("Invalid token"));
    }

    let resolved = state
        .server
        .get_file_location(&file_id, &instance)
        .map_err(serve_error)?;
    let mut headers = state
        .server
        .http_headers(&resolved.instance, &HeaderOptions::default());

    if let (Some(etag), Some(candidate)) = (
        headers.get(header::ETAG),
        request_headers.get(header::IF_NONE_MATCH),
    ) {
        let matched = match (etag.to_str(), candidate.to_str()) {
            (Ok(etag), Ok(candidate)) => etag_matches(candidate, etag),
            _ => false,
        };
        if matched {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            for name in [header::ETAG, header::CACHE_CONTROL] {
                if let Some(value) = headers.get(&name) {
                    response.headers_mut().insert(name, value.clone());
                }
            }
            return Ok(response);
        }
    }

    let size = resolved.instance.byte_size;
    let range_header = match request_headers.get(header::RANGE) {
        Some(value) => Some(
            value
                .to_str()
                .map_err(|_| ApiError::bad_request(RangeError::Invalid.to_string()))?,
        ),
        None => None,
    };
    let range = match parse_range_header(range_header, size) {
        Ok(range) => range,
        Err(RangeError::OutOfBounds) => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response.headers_mut().insert(header::CONTENT_RANGE, value);
            }
            return Ok(response);
        }
        Err(e @ RangeError::Invalid) => return Err(ApiError::bad_request(e.to_string())),
    };

    let local = state.server.open(&resolved).await.map_err(serve_error)?;
    let mut file = tokio::fs::File::open(&local.path)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to open file: {e}")))?;

    let (status, length) = match range {
        Some(ref range) => {
            file.seek(SeekFrom::Start(range.start))
                .await
                .map_err(|e| ApiError::internal(format!("Failed to seek: {e}")))?;
            if let Ok(value) = HeaderValue::from_str(&range.content_range) {
                headers.insert(header::CONTENT_RANGE, value);
            }
            (StatusCode::PARTIAL_CONTENT, range.len())
        }
        None => (StatusCode::OK, size),
    };
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));

    // The temp copy lives until the stream is dropped.
    let guard = local.path;
    let stream = ReaderStream::new(file.take(length)).map(move |chunk| {
        let _keep = &guard;
        chunk
    });

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    Ok(response)
}
