use axum::extract::{Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Json;
use serde::Deserialize;

use super::{client_auth, error_response, ApiError, ApiResponse, AppState};
use crate::models::SearchResults;
use crate::services::search::SearchLimits;

#[derive(Deserialize)]
pub struct SearchQuery {
    pub q: String,
    pub song_count: Option<usize>,
    pub album_count: Option<usize>,
    pub artist_count: Option<usize>,
    pub playlist_count: Option<usize>,
    pub offset: Option<usize>,
}

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchQuery>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<SearchResults>>, ApiError> {
    let defaults = SearchLimits::default();
    let limits = SearchLimits {
        songs: params.song_count.unwrap_or(defaults.songs),
        albums: params.album_count.unwrap_or(defaults.albums),
        artists: params.artist_count.unwrap_or(defaults.artists),
        playlists: params.playlist_count.unwrap_or(defaults.playlists),
        offset: params.offset.unwrap_or(0),
    };

    let auth = client_auth(&headers, raw_query.as_deref());
    let results = state
        .search
        .search(&params.q, limits, &auth)
        .await
        .map_err(|e| error_response(&e))?;
    Ok(Json(ApiResponse::success(results)))
}
