pub mod favorites;
pub mod images;
pub mod items;
pub mod search;
pub mod stream;

use std::sync::Arc;

use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::Serialize;

use crate::config::Config;
use crate::errors::CadenzaError;
use crate::services::backend::{ClientAuth, MediaBackend};
use crate::services::downloads::DownloadCoordinator;
use crate::services::library::LibraryIndex;
use crate::services::playlists::PlaylistWriter;
use crate::services::providers::MusicProvider;
use crate::services::search::SearchService;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub provider: Arc<dyn MusicProvider>,
    pub backend: Option<Arc<MediaBackend>>,
    pub library: Arc<LibraryIndex>,
    pub downloads: Arc<DownloadCoordinator>,
    pub search: Arc<SearchService>,
    pub playlists: Arc<PlaylistWriter>,
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn error(message: String) -> ApiResponse<()> {
        ApiResponse {
            success: false,
            data: None,
            message: Some(message),
        }
    }
}

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);

pub fn error_response(err: &CadenzaError) -> ApiError {
    (err.status(), Json(ApiResponse::<()>::error(err.to_string())))
}

/// The client's own credentials, replayed verbatim against the backend.
pub fn client_auth(headers: &HeaderMap, raw_query: Option<&str>) -> ClientAuth {
    ClientAuth {
        query: raw_query.unwrap_or("").to_string(),
        authorization: headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string()),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/search", get(search::search))
        .route("/api/songs/{id}", get(items::get_song))
        .route("/api/albums/{id}", get(items::get_album))
        .route("/api/artists/{id}", get(items::get_artist))
        .route("/api/artists/{id}/albums", get(items::get_artist_albums))
        .route("/api/playlists/{id}", get(items::get_playlist))
        .route("/api/playlists/{id}/tracks", get(items::get_playlist_tracks))
        .route("/api/stream/{id}", get(stream::stream))
        .route("/api/download/{id}", post(stream::download))
        .route("/api/images/{id}", get(images::image))
        .route("/api/favorites/{id}", post(favorites::set_favorite))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}
