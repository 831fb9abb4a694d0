//! Cover image delivery: provider art is proxied, backend art passes
//! through.

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};

use super::{client_auth, error_response, ApiError, AppState};
use crate::errors::CadenzaError;
use crate::services::ids::{decode, DecodedId, IdKind};

pub async fn image(
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
                .image(&local_id, &auth)
                .await
                .map_err(|e| error_response(&e))?;
            Ok(relay(upstream))
        }
        DecodedId::External {
            kind, external_id, ..
        } => {
            let url = cover_url(&state, kind, &external_id)
                .await
                .map_err(|e| error_response(&e))?;
            let upstream = reqwest::get(&url)
                .await
                .map_err(|e| error_response(&CadenzaError::Http(e)))?;
            Ok(relay(upstream))
        }
    }
}

async fn cover_url(
    state: &AppState,
    kind: IdKind,
    external_id: &str,
) -> crate::errors::Result<String> {
    let url = match kind {
        IdKind::Song => {
            let song = state.provider.get_song(external_id).await?;
            song.cover_art_url_large.or(song.cover_art_url)
        }
        IdKind::Album => state.provider.get_album(external_id).await?.cover_art_url,
        IdKind::Artist => state.provider.get_artist(external_id).await?.image_url,
        IdKind::Playlist => state.provider.get_playlist(external_id).await?.cover_url,
    };
    url.ok_or_else(|| CadenzaError::NotFound(format!("no image for {} {}", kind, external_id)))
}

fn relay(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let mut builder = Response::builder().status(status);
    for name in [header::CONTENT_TYPE, header::CONTENT_LENGTH, header::CACHE_CONTROL] {
        if let Some(value) = upstream.headers().get(&name) {
            builder = builder.header(name, value.clone());
        }
    }
    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}
