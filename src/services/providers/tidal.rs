//! Keyless provider backed by the public hifi proxy endpoints.
//!
//! No credentials: metadata and download manifests come from an ordered
//! list of community mirrors; transport failures rotate to the next mirror.
//! The download manifest arrives base64-wrapped and carries the short-lived
//! CDN URL. Streams are not encrypted.

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::errors::{CadenzaError, Result};
use crate::models::{Album, Artist, ExplicitNote, ExternalPlaylist, Quality, Song};
use crate::services::http_pool::HttpPool;
use crate::services::ids::{encode, IdKind};
use crate::services::providers::{DownloadSource, MusicProvider, StreamCipher};

const PROVIDER_NAME: &str = "tidal";

const ENDPOINTS: &[&str] = &[
    "https://api.hifi.fm.pm",
    "https://hifi.00004747.xyz",
    "https://tidal.kinzie.cc",
];

pub struct TidalProvider {
    pool: HttpPool,
}

impl Default for TidalProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TidalProvider {
    pub fn new() -> Self {
        Self {
            pool: HttpPool::new(ENDPOINTS.iter().map(|e| e.to_string()).collect()),
        }
    }

    fn quality_tag(quality: Quality) -> &'static str {
        match quality {
            Quality::Low => "LOW",
            Quality::High => "HIGH",
            Quality::Lossless => "LOSSLESS",
            Quality::HiRes => "HI_RES_LOSSLESS",
        }
    }

    fn cover_url(cover: &str, size: u32) -> String {
        format!(
            "https://resources.tidal.com/images/{}/{}x{}.jpg",
            cover.replace('-', "/"),
            size,
            size
        )
    }

    fn song_from_item(item: &TidalTrack) -> Song {
        let external_id = item.id.to_string();
        let artist_name = item
            .artist
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_else(|| "Unknown Artist".to_string());

        let mut song = Song::external(PROVIDER_NAME, &external_id);
        song.title = item.title.clone();
        song.artist = artist_name.clone();
        song.album_artist = artist_name;
        song.album = item
            .album
            .as_ref()
            .map(|a| a.title.clone())
            .unwrap_or_else(|| "Unknown Album".to_string());
        song.album_id = item
            .album
            .as_ref()
            .map(|a| encode(PROVIDER_NAME, IdKind::Album, &a.id.to_string()));
        song.artist_id = item
            .artist
            .as_ref()
            .map(|a| encode(PROVIDER_NAME, IdKind::Artist, &a.id.to_string()));
        song.track_number = item.track_number;
        song.disc_number = item.volume_number.unwrap_or(1);
        song.duration_seconds = item.duration;
        song.isrc = item.isrc.clone();
        song.bpm = item.bpm;
        song.explicit = match item.explicit {
            Some(true) => ExplicitNote::Explicit,
            Some(false) => ExplicitNote::Clean,
            None => ExplicitNote::Unknown,
        };
        if let Some(cover) = item.album.as_ref().and_then(|a| a.cover.as_deref()) {
            song.cover_art_url = Some(Self::cover_url(cover, 640));
            song.cover_art_url_large = Some(Self::cover_url(cover, 1280));
        }
        song
    }

    fn album_from_item(item: &TidalAlbum) -> Album {
        Album {
            id: encode(PROVIDER_NAME, IdKind::Album, &item.id.to_string()),
            title: item.title.clone(),
            artist: item
                .artist
                .as_ref()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| "Unknown Artist".to_string()),
            artist_id: item
                .artist
                .as_ref()
                .map(|a| encode(PROVIDER_NAME, IdKind::Artist, &a.id.to_string())),
            year: item
                .release_date
                .as_deref()
                .and_then(|d| d.split('-').next())
                .and_then(|y| y.parse().ok()),
            song_count: item.number_of_tracks,
            genre: None,
            cover_art_url: item.cover.as_deref().map(|c| Self::cover_url(c, 640)),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(item.id.to_string()),
            songs: Vec::new(),
        }
    }

    fn artist_from_item(item: &TidalArtist) -> Artist {
        Artist {
            id: encode(PROVIDER_NAME, IdKind::Artist, &item.id.to_string()),
            name: item.name.clone(),
            album_count: None,
            image_url: item.picture.as_deref().map(|p| Self::cover_url(p, 640)),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(item.id.to_string()),
        }
    }

    /// The track endpoint answers with a loose array of objects; the one we
    /// want carries either a base64 manifest or a direct track URL.
    fn extract_source(&self, body: &Value, quality: Quality) -> Result<DownloadSource> {
        let entries: Vec<&Value> = match body {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };

        for entry in &entries {
            if let Some(url) = entry.get("OriginalTrackUrl").and_then(Value::as_str) {
                return Ok(DownloadSource {
                    url: url.to_string(),
                    mime_type: "audio/flac".to_string(),
                    quality,
                    cipher: StreamCipher::None,
                });
            }
        }

        for entry in &entries {
            let Some(manifest_b64) = entry.get("manifest").and_then(Value::as_str) else {
                continue;
            };
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(manifest_b64.trim())
                .map_err(|e| CadenzaError::Integrity(format!("manifest not base64: {}", e)))?;
            let manifest: TidalManifest = serde_json::from_slice(&decoded)
                .map_err(|e| CadenzaError::Integrity(format!("manifest not JSON: {}", e)))?;

            let url = manifest
                .urls
                .into_iter()
                .next()
                .ok_or_else(|| CadenzaError::Integrity("manifest has no urls".to_string()))?;
            return Ok(DownloadSource {
                url,
                mime_type: manifest
                    .mime_type
                    .unwrap_or_else(|| "audio/flac".to_string()),
                quality,
                cipher: StreamCipher::None,
            });
        }

        Err(CadenzaError::Integrity(
            "track response carried no manifest or url".to_string(),
        ))
    }
}

#[async_trait]
impl MusicProvider for TidalProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn search_songs(&self, query: &str, limit: u32) -> Result<Vec<Song>> {
        let path = format!("search/?s={}&li={}", urlencoding::encode(query), limit);
        let resp: TidalSearchEnvelope<TidalTrack> = self.pool.get_json(&path).await?;
        Ok(resp.items.iter().map(Self::song_from_item).collect())
    }

    async fn search_albums(&self, query: &str, limit: u32) -> Result<Vec<Album>> {
        let path = format!("search/?al={}&li={}", urlencoding::encode(query), limit);
        let resp: TidalNestedEnvelope<TidalAlbum> = self.pool.get_json(&path).await?;
        Ok(resp
            .into_items()
            .iter()
            .map(Self::album_from_item)
            .collect())
    }

    async fn search_artists(&self, query: &str, limit: u32) -> Result<Vec<Artist>> {
        let path = format!("search/?a={}&li={}", urlencoding::encode(query), limit);
        let resp: TidalNestedEnvelope<TidalArtist> = self.pool.get_json(&path).await?;
        Ok(resp
            .into_items()
            .iter()
            .map(Self::artist_from_item)
            .collect())
    }

    async fn search_playlists(&self, query: &str, limit: u32) -> Result<Vec<ExternalPlaylist>> {
        let path = format!("search/?p={}&li={}", urlencoding::encode(query), limit);
        let resp: TidalNestedEnvelope<TidalPlaylist> = self.pool.get_json(&path).await?;
        Ok(resp
            .into_items()
            .into_iter()
            .map(|p| ExternalPlaylist {
                id: encode(PROVIDER_NAME, IdKind::Playlist, &p.uuid),
                name: p.title,
                description: p.description,
                curator_name: None,
                provider: PROVIDER_NAME.to_string(),
                external_id: p.uuid,
                track_count: p.number_of_tracks,
                duration_seconds: p.duration,
                cover_url: p.square_image.as_deref().map(|c| Self::cover_url(c, 640)),
                created_date: None,
            })
            .collect())
    }

    async fn get_song(&self, external_id: &str) -> Result<Song> {
        let path = format!("track/?id={}", urlencoding::encode(external_id));
        let body: Value = self.pool.get_json(&path).await?;

        // Track metadata rides along in the same loose array as the manifest.
        let entries: Vec<&Value> = match &body {
            Value::Array(items) => items.iter().collect(),
            other => vec![other],
        };
        for entry in entries {
            if entry.get("title").is_some() {
                let item: TidalTrack = serde_json::from_value((*entry).clone())?;
                return Ok(Self::song_from_item(&item));
            }
        }
        Err(CadenzaError::NotFound(format!("track {}", external_id)))
    }

    async fn get_album(&self, external_id: &str) -> Result<Album> {
        let path = format!("album/?id={}", urlencoding::encode(external_id));
        let resp: TidalAlbumResponse = self.pool.get_json(&path).await?;
        let mut album = Self::album_from_item(&resp.album);
        album.songs = resp
            .items
            .iter()
            .map(|wrapped| Self::song_from_item(&wrapped.item))
            .collect();
        Ok(album)
    }

    async fn get_artist(&self, external_id: &str) -> Result<Artist> {
        let path = format!("artist/?id={}", urlencoding::encode(external_id));
        let resp: TidalArtist = self.pool.get_json(&path).await?;
        Ok(Self::artist_from_item(&resp))
    }

    async fn get_artist_albums(&self, external_id: &str) -> Result<Vec<Album>> {
        let path = format!("artist/?f={}", urlencoding::encode(external_id));
        let resp: TidalNestedEnvelope<TidalAlbum> = self.pool.get_json(&path).await?;
        Ok(resp
            .into_items()
            .iter()
            .map(Self::album_from_item)
            .collect())
    }

    async fn get_playlist(&self, external_id: &str) -> Result<ExternalPlaylist> {
        let path = format!("playlist/?id={}", urlencoding::encode(external_id));
        let resp: TidalPlaylistResponse = self.pool.get_json(&path).await?;
        let p = resp.playlist;
        Ok(ExternalPlaylist {
            id: encode(PROVIDER_NAME, IdKind::Playlist, external_id),
            name: p.title,
            description: p.description,
            curator_name: None,
            provider: PROVIDER_NAME.to_string(),
            external_id: external_id.to_string(),
            track_count: p.number_of_tracks,
            duration_seconds: p.duration,
            cover_url: p.square_image.as_deref().map(|c| Self::cover_url(c, 640)),
            created_date: None,
        })
    }

    async fn get_playlist_tracks(&self, external_id: &str) -> Result<Vec<Song>> {
        let path = format!("playlist/?id={}", urlencoding::encode(external_id));
        let resp: TidalPlaylistResponse = self.pool.get_json(&path).await?;
        Ok(resp
            .items
            .iter()
            .map(|wrapped| Self::song_from_item(&wrapped.item))
            .collect())
    }

    async fn resolve_download(
        &self,
        external_id: &str,
        quality: Quality,
    ) -> Result<DownloadSource> {
        let path = format!(
            "track/?id={}&quality={}",
            urlencoding::encode(external_id),
            Self::quality_tag(quality)
        );
        let body: Value = self.pool.get_json(&path).await?;
        self.extract_source(&body, quality)
    }

    async fn is_available(&self) -> bool {
        self.pool.get("search/?s=ping&li=1").await.is_ok()
    }
}

// Proxy response structures.

#[derive(Debug, Deserialize)]
struct TidalSearchEnvelope<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

/// Some mirrors nest category results one level deeper.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TidalNestedEnvelope<T> {
    Flat { items: Vec<T> },
    Nested { items: Vec<TidalSearchEnvelope<T>> },
}

impl<T> TidalNestedEnvelope<T> {
    fn into_items(self) -> Vec<T> {
        match self {
            TidalNestedEnvelope::Flat { items } => items,
            TidalNestedEnvelope::Nested { items } => {
                items.into_iter().flat_map(|e| e.items).collect()
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TidalTrack {
    id: u64,
    title: String,
    duration: Option<u32>,
    explicit: Option<bool>,
    track_number: Option<u32>,
    volume_number: Option<u32>,
    isrc: Option<String>,
    bpm: Option<u32>,
    artist: Option<TidalArtistRef>,
    album: Option<TidalAlbumRef>,
}

#[derive(Debug, Deserialize)]
struct TidalArtistRef {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TidalAlbumRef {
    id: u64,
    title: String,
    cover: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TidalAlbum {
    id: u64,
    title: String,
    cover: Option<String>,
    release_date: Option<String>,
    number_of_tracks: Option<u32>,
    artist: Option<TidalArtistRef>,
}

#[derive(Debug, Deserialize)]
struct TidalArtist {
    id: u64,
    name: String,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TidalPlaylist {
    uuid: String,
    title: String,
    description: Option<String>,
    number_of_tracks: Option<u32>,
    duration: Option<u32>,
    square_image: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TidalTrackWrapper {
    item: TidalTrack,
}

#[derive(Debug, Deserialize)]
struct TidalAlbumResponse {
    album: TidalAlbum,
    #[serde(default = "Vec::new")]
    items: Vec<TidalTrackWrapper>,
}

#[derive(Debug, Deserialize)]
struct TidalPlaylistResponse {
    playlist: TidalPlaylist,
    #[serde(default = "Vec::new")]
    items: Vec<TidalTrackWrapper>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TidalManifest {
    mime_type: Option<String>,
    #[serde(default = "Vec::new")]
    urls: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn manifest_url_is_extracted_from_base64() {
        let provider = TidalProvider::new();
        let manifest = base64::engine::general_purpose::STANDARD.encode(
            json!({"mimeType": "audio/flac", "urls": ["https://cdn.example/a.flac"]}).to_string(),
        );
        let body = json!([{"id": 1, "manifest": manifest}]);

        let source = provider.extract_source(&body, Quality::Lossless).unwrap();
        assert_eq!(source.url, "https://cdn.example/a.flac");
        assert_eq!(source.mime_type, "audio/flac");
        assert_eq!(source.cipher, StreamCipher::None);
    }

    #[test]
    fn direct_track_url_wins_over_manifest() {
        let provider = TidalProvider::new();
        let body = json!([{"OriginalTrackUrl": "https://cdn.example/direct.flac"}]);
        let source = provider.extract_source(&body, Quality::High).unwrap();
        assert_eq!(source.url, "https://cdn.example/direct.flac");
    }

    #[test]
    fn manifest_without_urls_is_an_integrity_error() {
        let provider = TidalProvider::new();
        let manifest = base64::engine::general_purpose::STANDARD
            .encode(json!({"mimeType": "audio/flac", "urls": []}).to_string());
        let body = json!([{"manifest": manifest}]);

        match provider.extract_source(&body, Quality::Lossless) {
            Err(CadenzaError::Integrity(_)) => {}
            other => panic!("expected integrity error, got {:?}", other.map(|s| s.url)),
        }
    }

    #[test]
    fn quality_tags_map_to_provider_vocabulary() {
        assert_eq!(TidalProvider::quality_tag(Quality::Lossless), "LOSSLESS");
        assert_eq!(TidalProvider::quality_tag(Quality::HiRes), "HI_RES_LOSSLESS");
        assert_eq!(TidalProvider::quality_tag(Quality::Low), "LOW");
    }
}
