use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Audio quality requested from a provider. Providers translate this into
/// their own tier vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    Low,
    High,
    Lossless,
    HiRes,
}

impl FromStr for Quality {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Quality::Low),
            "high" => Ok(Quality::High),
            "lossless" | "flac" => Ok(Quality::Lossless),
            "hi_res" | "hires" => Ok(Quality::HiRes),
            _ => Err(format!(
                "invalid quality '{}'. Valid: low, high, lossless, hi_res",
                s
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExplicitNote {
    #[default]
    Unknown,
    Clean,
    Explicit,
    Edited,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Song {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    /// Defaults to `artist` when the provider has no separate album artist.
    pub album_artist: String,
    pub album_id: Option<String>,
    pub artist_id: Option<String>,
    pub track_number: Option<u32>,
    pub disc_number: u32,
    pub duration_seconds: Option<u32>,
    pub year: Option<i32>,
    pub genre: Option<String>,
    pub bpm: Option<u32>,
    pub isrc: Option<String>,
    pub explicit: ExplicitNote,
    pub cover_art_url: Option<String>,
    pub cover_art_url_large: Option<String>,
    pub is_local: bool,
    pub external_provider: Option<String>,
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<String>,
}

impl Song {
    pub fn external(provider: &str, external_id: &str) -> Self {
        Self {
            id: crate::services::ids::encode(
                provider,
                crate::services::ids::IdKind::Song,
                external_id,
            ),
            disc_number: 1,
            is_local: false,
            external_provider: Some(provider.to_string()),
            external_id: Some(external_id.to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Album {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub artist_id: Option<String>,
    pub year: Option<i32>,
    pub song_count: Option<u32>,
    pub genre: Option<String>,
    pub cover_art_url: Option<String>,
    pub is_local: bool,
    pub external_provider: Option<String>,
    pub external_id: Option<String>,
    /// Populated lazily; at most `song_count` entries when that is known.
    pub songs: Vec<Song>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Artist {
    pub id: String,
    pub name: String,
    pub album_count: Option<u32>,
    pub image_url: Option<String>,
    pub is_local: bool,
    pub external_provider: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalPlaylist {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub curator_name: Option<String>,
    pub provider: String,
    pub external_id: String,
    pub track_count: Option<u32>,
    pub duration_seconds: Option<u32>,
    pub cover_url: Option<String>,
    pub created_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// One catalog search response across all categories.
#[derive(Debug, Clone, Serialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    pub songs: Vec<Song>,
    pub albums: Vec<Album>,
    pub artists: Vec<Artist>,
    pub playlists: Vec<ExternalPlaylist>,
}
