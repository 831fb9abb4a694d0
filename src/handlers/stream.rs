//! Audio delivery.
//!
//! Local backend ids are proxied verbatim with the caching and range
//! headers preserved in both directions. External song ids are served from
//! the library when present; on a miss the response body is fed directly
//! from the download as it progresses, with range support disabled until
//! the file has landed.

use std::io::SeekFrom;
use std::ops::Bound;
use std::path::Path as FsPath;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use headers::{HeaderMapExt, IfRange, LastModified, Range as RangeHeader};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{client_auth, error_response, ApiError, ApiResponse, AppState};
use crate::errors::CadenzaError;
use crate::models::Quality;
use crate::services::downloads::FetchOutcome;
use crate::services::ids::{decode, DecodedId, IdKind};
use crate::services::paths;

const STREAM_HEADERS: [header::HeaderName; 7] = [
    header::CONTENT_TYPE,
    header::CONTENT_LENGTH,
    header::CONTENT_RANGE,
    header::ACCEPT_RANGES,
    header::ETAG,
    header::LAST_MODIFIED,
    header::CACHE_CONTROL,
];

pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    match decode(&id) {
        DecodedId::Local(local_id) => {
            let Some(backend) = &state.backend else {
                return Err(error_response(&CadenzaError::NotConfigured(
                    "no media backend configured".to_string(),
                )));
            };
            let auth = client_auth(&headers, raw_query.as_deref());
            let upstream = backend
                .stream(&local_id, &headers, &auth)
                .await
                .map_err(|e| error_response(&e))?;
            Ok(proxy_response(upstream))
        }
        DecodedId::External {
            provider,
            kind: IdKind::Song,
            external_id,
        } => serve_external(&state, &provider, &external_id, &headers).await,
        DecodedId::External { .. } => Err(error_response(&CadenzaError::NotFound(
            "only songs can be streamed".to_string(),
        ))),
    }
}

/// Explicit download request: block until the track is in the library and
/// report where it landed.
pub async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let DecodedId::External {
        provider,
        kind: IdKind::Song,
        external_id,
    } = decode(&id)
    else {
        return Err(error_response(&CadenzaError::NotFound(format!(
            "{} is not an external song id",
            id
        ))));
    };

    let path = state
        .downloads
        .fetch(&provider, &external_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ApiResponse::success(path.to_string_lossy().into_owned())))
}

async fn serve_external(
    state: &AppState,
    provider: &str,
    external_id: &str,
    headers: &HeaderMap,
) -> Result<Response, ApiError> {
    let outcome = state
        .downloads
        .fetch_stream(provider, external_id)
        .await
        .map_err(|e| error_response(&e))?;

    match outcome {
        FetchOutcome::Ready(path) => serve_file(&path, headers)
            .await
            .map_err(|e| error_response(&e)),
        FetchOutcome::Streaming(stream) => {
            debug!("serving {}:{} progressively", provider, external_id);
            let extension = expected_extension(state.config.preferred_quality);
            let response = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, paths::mime_for_extension(extension))
                .header(header::ACCEPT_RANGES, "none")
                .body(Body::from_stream(stream))
                .map_err(|e| error_response(&CadenzaError::Internal(e.to_string())))?;
            Ok(response)
        }
    }
}

/// First-play content type is a guess from the configured quality; the
/// file's real extension takes over once it exists.
fn expected_extension(quality: Quality) -> &'static str {
    match quality {
        Quality::Low | Quality::High => "mp3",
        Quality::Lossless | Quality::HiRes => "flac",
    }
}

/// Serve a library file with single-range support.
pub async fn serve_file(path: &FsPath, headers: &HeaderMap) -> crate::errors::Result<Response> {
    let mut file = tokio::fs::File::open(path).await?;
    let metadata = file.metadata().await?;
    let file_size = metadata.len();

    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let content_type = paths::mime_for_extension(&extension);
    let last_modified = metadata.modified().ok().map(LastModified::from);

    // An If-Range validator that no longer matches downgrades the request
    // to the full body.
    let mut range = headers.typed_get::<RangeHeader>();
    if let (Some(if_range), Some(modified)) = (headers.typed_get::<IfRange>(), &last_modified) {
        if if_range.is_modified(None, Some(modified)) {
            range = None;
        }
    }

    let span = match range {
        Some(range) => match range.satisfiable_ranges(file_size).next() {
            Some((start, end)) => Some(resolve_bounds(start, end, file_size)),
            None => {
                return Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", file_size))
                    .body(Body::empty())
                    .map_err(|e| CadenzaError::Internal(e.to_string()));
            }
        },
        None => None,
    };

    let mut response = Response::builder().header(header::CONTENT_TYPE, content_type).header(
        header::ACCEPT_RANGES,
        "bytes",
    );
    if let Some(modified) = last_modified {
        let mut map = HeaderMap::new();
        map.typed_insert(modified);
        if let Some(value) = map.get(header::LAST_MODIFIED) {
            response = response.header(header::LAST_MODIFIED, value.clone());
        }
    }

    let response = match span {
        Some((start, end)) => {
            let length = end - start + 1;
            file.seek(SeekFrom::Start(start)).await?;
            let reader = file.take(length);
            response
                .status(StatusCode::PARTIAL_CONTENT)
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, file_size),
                )
                .header(header::CONTENT_LENGTH, length)
                .body(Body::from_stream(ReaderStream::new(reader)))
        }
        None => response
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, file_size)
            .body(Body::from_stream(ReaderStream::new(file))),
    };

    response.map_err(|e| CadenzaError::Internal(e.to_string()))
}

fn resolve_bounds(start: Bound<u64>, end: Bound<u64>, file_size: u64) -> (u64, u64) {
    let start = match start {
        Bound::Included(n) => n,
        Bound::Excluded(n) => n + 1,
        Bound::Unbounded => 0,
    };
    let end = match end {
        Bound::Included(n) => n.min(file_size.saturating_sub(1)),
        Bound::Excluded(n) => (n.saturating_sub(1)).min(file_size.saturating_sub(1)),
        Bound::Unbounded => file_size.saturating_sub(1),
    };
    (start, end)
}

/// Relay a backend response, keeping status and the streaming-relevant
/// headers intact.
fn proxy_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);

    for name in STREAM_HEADERS {
        if let Some(value) = upstream.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn collect(response: Response) -> (StatusCode, HeaderMap, Vec<u8>) {
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body.to_vec())
    }

    fn range_request(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::RANGE, value.parse().unwrap());
        headers
    }

    #[tokio::test]
    async fn full_file_without_range() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, b"0123456789").unwrap();

        let (status, headers, body) = collect(serve_file(&path, &HeaderMap::new()).await.unwrap()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(headers[header::CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(body, b"0123456789");
    }

    #[tokio::test]
    async fn byte_range_returns_exactly_that_window() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.flac");
        std::fs::write(&path, b"0123456789").unwrap();

        let (status, headers, body) =
            collect(serve_file(&path, &range_request("bytes=2-5")).await.unwrap()).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 2-5/10");
        assert_eq!(headers[header::CONTENT_LENGTH], "4");
        assert_eq!(body, b"2345");
    }

    #[tokio::test]
    async fn open_ended_range_runs_to_eof() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.flac");
        std::fs::write(&path, b"0123456789").unwrap();

        let (status, headers, body) =
            collect(serve_file(&path, &range_request("bytes=7-")).await.unwrap()).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(body, b"789");
    }

    #[tokio::test]
    async fn suffix_range_serves_the_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.flac");
        std::fs::write(&path, b"0123456789").unwrap();

        let (status, headers, body) =
            collect(serve_file(&path, &range_request("bytes=-3")).await.unwrap()).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(body, b"789");
    }

    #[tokio::test]
    async fn unsatisfiable_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("track.flac");
        std::fs::write(&path, b"0123456789").unwrap();

        let (status, headers, _) =
            collect(serve_file(&path, &range_request("bytes=50-60")).await.unwrap()).await;
        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers[header::CONTENT_RANGE], "bytes */10");
    }

    #[test]
    fn expected_extension_follows_quality() {
        assert_eq!(expected_extension(Quality::Lossless), "flac");
        assert_eq!(expected_extension(Quality::Low), "mp3");
    }
}
