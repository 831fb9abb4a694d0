//! Entity fetch by id: external ids resolve against the provider, local ids
//! pass through to the backend untouched.

use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::response::{Json, Response};

use super::{error_response, ApiError, ApiResponse, AppState};
use crate::errors::CadenzaError;
use crate::services::ids::{decode, DecodedId, IdKind};

fn expect_external(id: &str, want: IdKind) -> Result<(String, String), ApiError> {
    match decode(id) {
        DecodedId::External {
            provider,
            kind,
            external_id,
        } if kind == want => Ok((provider, external_id)),
        DecodedId::External { .. } => Err(error_response(&CadenzaError::NotFound(format!(
            "{} is not a {} id",
            id, want
        )))),
        DecodedId::Local(_) => Err(error_response(&CadenzaError::NotFound(format!(
            "local item {} is served by the backend",
            id
        )))),
    }
}

pub async fn get_song(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, external_id) = expect_external(&id, IdKind::Song)?;
    let mut song = state
        .provider
        .get_song(&external_id)
        .await
        .map_err(|e| error_response(&e))?;

    // A song already materialized on disk reports its local side too.
    if let (Some(provider), Some(external)) =
        (song.external_provider.clone(), song.external_id.clone())
    {
        if let Ok(Some(path)) = state.library.lookup(&provider, &external).await {
            song.local_path = Some(path.to_string_lossy().into_owned());
        }
    }
    Ok(Json(ApiResponse::success(song)).into_response())
}

pub async fn get_album(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, external_id) = expect_external(&id, IdKind::Album)?;
    let mut album = state
        .provider
        .get_album(&external_id)
        .await
        .map_err(|e| error_response(&e))?;
    album.songs.retain(|song| {
        crate::services::search::passes_explicit_filter(song, state.config.explicit_filter)
    });
    Ok(Json(ApiResponse::success(album)).into_response())
}

pub async fn get_artist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, external_id) = expect_external(&id, IdKind::Artist)?;
    let artist = state
        .provider
        .get_artist(&external_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ApiResponse::success(artist)).into_response())
}

pub async fn get_artist_albums(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let (_, external_id) = expect_external(&id, IdKind::Artist)?;
    let albums = state
        .provider
        .get_artist_albums(&external_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ApiResponse::success(albums)).into_response())
}

pub async fn get_playlist(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.config.external_playlists_enabled {
        return Err(error_response(&CadenzaError::NotConfigured(
            "external playlists are disabled".to_string(),
        )));
    }
    let (_, external_id) = expect_external(&id, IdKind::Playlist)?;
    let playlist = state
        .provider
        .get_playlist(&external_id)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ApiResponse::success(playlist)).into_response())
}

pub async fn get_playlist_tracks(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if !state.config.external_playlists_enabled {
        return Err(error_response(&CadenzaError::NotConfigured(
            "external playlists are disabled".to_string(),
        )));
    }
    let (_, external_id) = expect_external(&id, IdKind::Playlist)?;
    let tracks = state
        .provider
        .get_playlist_tracks(&external_id)
        .await
        .map_err(|e| error_response(&e))?;

    let filtered: Vec<_> = tracks
        .into_iter()
        .filter(|song| crate::services::search::passes_explicit_filter(song, state.config.explicit_filter))
        .collect();
    Ok(Json(ApiResponse::success(filtered)).into_response())
}
