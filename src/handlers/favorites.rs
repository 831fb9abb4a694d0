//! Favorite toggling.
//!
//! Local favorites pass through to the backend. Favoriting external
//! content materializes it: songs download in the background, albums fan
//! out per track, and playlists additionally collect their tracks into an
//! M3U file as each download lands.

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;
use tracing::{info, warn};

use super::{client_auth, error_response, ApiError, ApiResponse, AppState};
use crate::errors::CadenzaError;
use crate::services::ids::{decode, DecodedId, IdKind};

#[derive(Deserialize)]
pub struct FavoriteQuery {
    /// `false` unfavorites; external unfavoriting is acknowledged without
    /// touching downloaded files.
    pub on: Option<bool>,
}

pub async fn set_favorite(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<FavoriteQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<String>>, ApiError> {
    let on = params.on.unwrap_or(true);

    match decode(&id) {
        DecodedId::Local(local_id) => {
            let Some(backend) = &state.backend else {
                return Err(error_response(&CadenzaError::NotConfigured(
                    "no media backend configured".to_string(),
                )));
            };
            let auth = client_auth(&headers, raw_query.as_deref());
            backend
                .favorite(&local_id, on, &auth)
                .await
                .map_err(|e| error_response(&e))?;
            Ok(Json(ApiResponse::success("ok".to_string())))
        }
        DecodedId::External {
            provider,
            kind,
            external_id,
        } => {
            if !on {
                return Ok(Json(ApiResponse::success("ok".to_string())));
            }
            match kind {
                IdKind::Song => {
                    let downloads = state.downloads.clone();
                    tokio::spawn(async move {
                        if let Err(e) = downloads.fetch(&provider, &external_id).await {
                            warn!("favorite download of {} failed: {}", external_id, e);
                        }
                    });
                    Ok(Json(ApiResponse::success("download queued".to_string())))
                }
                IdKind::Album => {
                    let state = state.clone();
                    tokio::spawn(async move {
                        fetch_album(&state, &provider, &external_id).await;
                    });
                    Ok(Json(ApiResponse::success("album download queued".to_string())))
                }
                IdKind::Playlist => {
                    if !state.config.external_playlists_enabled {
                        return Err(error_response(&CadenzaError::NotConfigured(
                            "external playlists are disabled".to_string(),
                        )));
                    }
                    let state = state.clone();
                    tokio::spawn(async move {
                        fetch_playlist(&state, &provider, &external_id).await;
                    });
                    Ok(Json(ApiResponse::success("playlist download queued".to_string())))
                }
                IdKind::Artist => {
                    info!("favorited external artist {}:{}", provider, external_id);
                    Ok(Json(ApiResponse::success("ok".to_string())))
                }
            }
        }
    }
}

async fn fetch_album(state: &AppState, provider: &str, external_id: &str) {
    let album = match state.provider.get_album(external_id).await {
        Ok(album) => album,
        Err(e) => {
            warn!("favorite album {} lookup failed: {}", external_id, e);
            return;
        }
    };
    info!("downloading favorited album '{}' ({} tracks)", album.title, album.songs.len());
    for song in album.songs {
        let Some(track_id) = song.external_id else { continue };
        if let Err(e) = state.downloads.fetch(provider, &track_id).await {
            warn!("album track {} failed: {}", track_id, e);
        }
    }
}

async fn fetch_playlist(state: &AppState, provider: &str, external_id: &str) {
    let playlist = match state.provider.get_playlist(external_id).await {
        Ok(playlist) => playlist,
        Err(e) => {
            warn!("favorite playlist {} lookup failed: {}", external_id, e);
            return;
        }
    };
    let tracks = match state.provider.get_playlist_tracks(external_id).await {
        Ok(tracks) => tracks,
        Err(e) => {
            warn!("playlist {} track listing failed: {}", external_id, e);
            return;
        }
    };

    info!("downloading favorited playlist '{}' ({} tracks)", playlist.name, tracks.len());
    for song in tracks {
        let Some(track_id) = song.external_id.clone() else { continue };
        match state.downloads.fetch(provider, &track_id).await {
            Ok(path) => {
                if let Err(e) = state.playlists.append(&playlist.name, &song, &path).await {
                    warn!("playlist append for {} failed: {}", track_id, e);
                }
            }
            Err(e) => warn!("playlist track {} failed: {}", track_id, e),
        }
    }
}
