//! Signed-request provider.
//!
//! Metadata calls need an app id; file URL issuance additionally needs an
//! md5 signature over the request parameters and a shared secret. When no
//! credentials are configured, both are scraped from the public web player
//! bundle at startup. Streams are served in the clear.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::{CadenzaError, Result};
use crate::models::{Album, Artist, ExplicitNote, ExternalPlaylist, Quality, Song};
use crate::services::http_pool::HttpPool;
use crate::services::ids::{encode, IdKind};
use crate::services::providers::{DownloadSource, MusicProvider, StreamCipher};

const PROVIDER_NAME: &str = "qobuz";

const API_BASE: &str = "https://www.qobuz.com/api.json/0.2";
const WEB_PLAYER_URL: &str = "https://play.qobuz.com/login";

#[derive(Debug, Clone)]
struct AppCredentials {
    app_id: String,
    secret: String,
}

pub struct QobuzProvider {
    pool: HttpPool,
    configured: Option<AppCredentials>,
    bundle_url: Option<String>,
    creds: RwLock<Option<AppCredentials>>,
}

impl QobuzProvider {
    pub fn new(
        app_id: Option<String>,
        secret: Option<String>,
        bundle_url: Option<String>,
    ) -> Self {
        let configured = match (app_id, secret) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => {
                Some(AppCredentials { app_id: id, secret })
            }
            _ => None,
        };
        Self {
            pool: HttpPool::new(Vec::new()),
            configured,
            bundle_url,
            creds: RwLock::new(None),
        }
    }

    /// Credentials, scraping the web player bundle on first need.
    async fn credentials(&self) -> Result<AppCredentials> {
        if let Some(creds) = &self.configured {
            return Ok(creds.clone());
        }
        if let Some(creds) = self.creds.read().await.clone() {
            return Ok(creds);
        }

        let creds = self.scrape_bundle().await?;
        info!("obtained app credentials from the web player bundle");
        *self.creds.write().await = Some(creds.clone());
        Ok(creds)
    }

    async fn scrape_bundle(&self) -> Result<AppCredentials> {
        let bundle_url = match &self.bundle_url {
            Some(url) => url.clone(),
            None => {
                let login_page = self.pool.get(WEB_PLAYER_URL).await?.text().await?;
                let path = scan_between(&login_page, "<script src=\"", "\"></script>")
                    .filter(|p| p.contains("bundle"))
                    .ok_or_else(|| {
                        CadenzaError::Integrity("login page carries no bundle script".to_string())
                    })?;
                format!("https://play.qobuz.com{}", path)
            }
        };

        let bundle = self.pool.get(&bundle_url).await?.text().await?;
        let app_id = scan_between(&bundle, "production:{api:{appId:\"", "\"")
            .ok_or_else(|| CadenzaError::Integrity("bundle carries no app id".to_string()))?;
        let secret = scan_between(&bundle, "appSecret:\"", "\"")
            .ok_or_else(|| CadenzaError::Integrity("bundle carries no app secret".to_string()))?;

        Ok(AppCredentials { app_id, secret })
    }

    fn json_value_to_string(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => value.to_string(),
        }
    }

    fn generate_request_signature(
        endpoint: &str,
        params: &HashMap<String, String>,
        timestamp: &str,
        secret: &str,
    ) -> String {
        // The file URL endpoint has a fixed parameter order; everything else
        // concatenates sorted key/value pairs.
        let sig_string = match endpoint {
            "track/getFileUrl" => {
                let default_empty = String::new();
                let default_stream = "stream".to_string();
                let track_id = params.get("track_id").unwrap_or(&default_empty);
                let format_id = params.get("format_id").unwrap_or(&default_empty);
                let intent = params.get("intent").unwrap_or(&default_stream);
                format!(
                    "trackgetFileUrlformat_id{}intent{}track_id{}{}{}",
                    format_id, intent, track_id, timestamp, secret
                )
            }
            _ => {
                let mut sorted_params: Vec<_> = params.iter().collect();
                sorted_params.sort_by_key(|&(k, _)| k);
                let params_string: String = sorted_params
                    .iter()
                    .map(|(k, v)| format!("{}{}", k, v))
                    .collect();
                format!("{}{}{}", endpoint.replace('/', ""), params_string, secret)
            }
        };

        format!("{:x}", md5::compute(sig_string.as_bytes()))
    }

    async fn make_request<T: for<'de> Deserialize<'de>>(
        &self,
        endpoint: &str,
        params: &HashMap<String, String>,
        signed: bool,
    ) -> Result<T> {
        let creds = self.credentials().await?;
        let mut url_params = params.clone();
        url_params.insert("app_id".to_string(), creds.app_id.clone());

        if signed {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| CadenzaError::Internal(format!("clock error: {}", e)))?
                .as_secs()
                .to_string();
            let signature =
                Self::generate_request_signature(endpoint, &url_params, &timestamp, &creds.secret);
            url_params.insert("request_ts".to_string(), timestamp);
            url_params.insert("request_sig".to_string(), signature);
        }

        let url = format!("{}/{}", API_BASE, endpoint);
        let resp = self
            .pool
            .get_with(&url, move |req| req.query(&url_params))
            .await?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(CadenzaError::Unauthenticated(format!(
                "{} rejected our credentials",
                endpoint
            )));
        }
        if !status.is_success() {
            return Err(CadenzaError::Transient(format!(
                "{} returned {}",
                endpoint, status
            )));
        }
        Ok(resp.json::<T>().await?)
    }

    fn format_id(quality: Quality) -> &'static str {
        match quality {
            Quality::Low | Quality::High => "5", // MP3 320
            Quality::Lossless => "6",            // FLAC 16/44.1
            Quality::HiRes => "27",              // FLAC up to 24/192
        }
    }

    fn song_from_item(item: &QobuzTrack) -> Song {
        let external_id = Self::json_value_to_string(&item.id);
        let artist_name = item
            .performer
            .as_ref()
            .map(|p| p.name.clone())
            .unwrap_or_else(|| "Unknown Artist".to_string());

        let mut song = Song::external(PROVIDER_NAME, &external_id);
        song.title = item.title.clone();
        song.artist = artist_name.clone();
        song.album_artist = item
            .album
            .as_ref()
            .and_then(|a| a.artist.as_ref())
            .map(|a| a.name.clone())
            .unwrap_or(artist_name);
        song.album = item
            .album
            .as_ref()
            .map(|a| a.title.clone())
            .unwrap_or_else(|| "Unknown Album".to_string());
        song.album_id = item
            .album
            .as_ref()
            .map(|a| encode(PROVIDER_NAME, IdKind::Album, &Self::json_value_to_string(&a.id)));
        song.artist_id = item.performer.as_ref().map(|p| {
            encode(PROVIDER_NAME, IdKind::Artist, &Self::json_value_to_string(&p.id))
        });
        song.track_number = item.track_number;
        song.disc_number = item.media_number.unwrap_or(1);
        song.duration_seconds = item.duration.and_then(|d| u32::try_from(d).ok());
        song.isrc = item.isrc.clone();
        song.explicit = match item.parental_warning {
            Some(true) => ExplicitNote::Explicit,
            Some(false) => ExplicitNote::Clean,
            None => ExplicitNote::Unknown,
        };
        song.cover_art_url = item
            .album
            .as_ref()
            .and_then(|a| a.image.as_ref())
            .and_then(|i| i.small.clone().or_else(|| i.large.clone()));
        song.cover_art_url_large = item
            .album
            .as_ref()
            .and_then(|a| a.image.as_ref())
            .and_then(|i| i.large.clone());
        song
    }

    fn album_from_item(item: &QobuzAlbum) -> Album {
        let external_id = Self::json_value_to_string(&item.id);
        Album {
            id: encode(PROVIDER_NAME, IdKind::Album, &external_id),
            title: item.title.clone(),
            artist: item
                .artist
                .as_ref()
                .map(|a| a.name.clone())
                .unwrap_or_else(|| "Unknown Artist".to_string()),
            artist_id: item.artist.as_ref().map(|a| {
                encode(PROVIDER_NAME, IdKind::Artist, &Self::json_value_to_string(&a.id))
            }),
            year: item.released_at.and_then(|ts| {
                chrono::DateTime::from_timestamp(ts, 0).map(|d| {
                    use chrono::Datelike;
                    d.year()
                })
            }),
            song_count: item.tracks_count,
            genre: item.genre.as_ref().map(|g| g.name.clone()),
            cover_art_url: item.image.as_ref().and_then(|i| i.large.clone()),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(external_id),
            songs: Vec::new(),
        }
    }

    fn artist_from_item(item: &QobuzArtist) -> Artist {
        let external_id = Self::json_value_to_string(&item.id);
        Artist {
            id: encode(PROVIDER_NAME, IdKind::Artist, &external_id),
            name: item.name.clone(),
            album_count: item.albums_count,
            image_url: item.picture.clone(),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(external_id),
        }
    }
}

#[async_trait]
impl MusicProvider for QobuzProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn search_songs(&self, query: &str, limit: u32) -> Result<Vec<Song>> {
        let mut params = HashMap::new();
        params.insert("query".to_string(), query.to_string());
        params.insert("limit".to_string(), limit.to_string());
        let resp: QobuzSearchResponse = self
            .make_request("catalog/search", &params, false)
            .await?;
        Ok(resp
            .tracks
            .map(|t| t.items.iter().map(Self::song_from_item).collect())
            .unwrap_or_default())
    }

    async fn search_albums(&self, query: &str, limit: u32) -> Result<Vec<Album>> {
        let mut params = HashMap::new();
        params.insert("query".to_string(), query.to_string());
        params.insert("type".to_string(), "albums".to_string());
        params.insert("limit".to_string(), limit.to_string());
        let resp: QobuzSearchResponse = self
            .make_request("catalog/search", &params, false)
            .await?;
        Ok(resp
            .albums
            .map(|a| a.items.iter().map(Self::album_from_item).collect())
            .unwrap_or_default())
    }

    async fn search_artists(&self, query: &str, limit: u32) -> Result<Vec<Artist>> {
        let mut params = HashMap::new();
        params.insert("query".to_string(), query.to_string());
        params.insert("type".to_string(), "artists".to_string());
        params.insert("limit".to_string(), limit.to_string());
        let resp: QobuzSearchResponse = self
            .make_request("catalog/search", &params, false)
            .await?;
        Ok(resp
            .artists
            .map(|a| a.items.iter().map(Self::artist_from_item).collect())
            .unwrap_or_default())
    }

    async fn search_playlists(&self, query: &str, limit: u32) -> Result<Vec<ExternalPlaylist>> {
        let mut params = HashMap::new();
        params.insert("query".to_string(), query.to_string());
        params.insert("type".to_string(), "playlists".to_string());
        params.insert("limit".to_string(), limit.to_string());
        let resp: QobuzSearchResponse = self
            .make_request("catalog/search", &params, false)
            .await?;
        Ok(resp
            .playlists
            .map(|p| {
                p.items
                    .into_iter()
                    .map(|playlist| {
                        let external_id = Self::json_value_to_string(&playlist.id);
                        ExternalPlaylist {
                            id: encode(PROVIDER_NAME, IdKind::Playlist, &external_id),
                            name: playlist.name,
                            description: playlist.description,
                            curator_name: playlist.owner.map(|o| o.name),
                            provider: PROVIDER_NAME.to_string(),
                            external_id,
                            track_count: playlist.tracks_count,
                            duration_seconds: playlist.duration,
                            cover_url: playlist.image_rectangle.and_then(|v| v.into_iter().next()),
                            created_date: None,
                        }
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_song(&self, external_id: &str) -> Result<Song> {
        let mut params = HashMap::new();
        params.insert("track_id".to_string(), external_id.to_string());
        let item: QobuzTrack = self.make_request("track/get", &params, false).await?;
        Ok(Self::song_from_item(&item))
    }

    async fn get_album(&self, external_id: &str) -> Result<Album> {
        let mut params = HashMap::new();
        params.insert("album_id".to_string(), external_id.to_string());
        let item: QobuzAlbumFull = self.make_request("album/get", &params, false).await?;
        let mut album = Self::album_from_item(&item.base);
        album.songs = item
            .tracks
            .map(|t| t.items.iter().map(Self::song_from_item).collect())
            .unwrap_or_default();
        for song in &mut album.songs {
            if song.album == "Unknown Album" {
                song.album = album.title.clone();
            }
            if song.album_id.is_none() {
                song.album_id = Some(album.id.clone());
            }
            if song.artist == "Unknown Artist" {
                song.artist = album.artist.clone();
                song.album_artist = album.artist.clone();
            }
            if song.cover_art_url.is_none() {
                song.cover_art_url = album.cover_art_url.clone();
            }
        }
        Ok(album)
    }

    async fn get_artist(&self, external_id: &str) -> Result<Artist> {
        let mut params = HashMap::new();
        params.insert("artist_id".to_string(), external_id.to_string());
        let item: QobuzArtist = self.make_request("artist/get", &params, false).await?;
        Ok(Self::artist_from_item(&item))
    }

    async fn get_artist_albums(&self, external_id: &str) -> Result<Vec<Album>> {
        let mut params = HashMap::new();
        params.insert("artist_id".to_string(), external_id.to_string());
        params.insert("extra".to_string(), "albums".to_string());
        let item: QobuzArtistWithAlbums = self.make_request("artist/get", &params, false).await?;
        Ok(item
            .albums
            .map(|a| a.items.iter().map(Self::album_from_item).collect())
            .unwrap_or_default())
    }

    async fn get_playlist(&self, external_id: &str) -> Result<ExternalPlaylist> {
        let mut params = HashMap::new();
        params.insert("playlist_id".to_string(), external_id.to_string());
        let playlist: QobuzPlaylist = self.make_request("playlist/get", &params, false).await?;
        let external_id = Self::json_value_to_string(&playlist.id);
        Ok(ExternalPlaylist {
            id: encode(PROVIDER_NAME, IdKind::Playlist, &external_id),
            name: playlist.name,
            description: playlist.description,
            curator_name: playlist.owner.map(|o| o.name),
            provider: PROVIDER_NAME.to_string(),
            external_id,
            track_count: playlist.tracks_count,
            duration_seconds: playlist.duration,
            cover_url: playlist.image_rectangle.and_then(|v| v.into_iter().next()),
            created_date: None,
        })
    }

    async fn get_playlist_tracks(&self, external_id: &str) -> Result<Vec<Song>> {
        let mut params = HashMap::new();
        params.insert("playlist_id".to_string(), external_id.to_string());
        params.insert("extra".to_string(), "tracks".to_string());
        let playlist: QobuzPlaylistWithTracks =
            self.make_request("playlist/get", &params, false).await?;
        Ok(playlist
            .tracks
            .map(|t| {
                t.items
                    .iter()
                    .filter(|track| !track.id.is_null())
                    .map(Self::song_from_item)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn resolve_download(
        &self,
        external_id: &str,
        quality: Quality,
    ) -> Result<DownloadSource> {
        let mut params = HashMap::new();
        params.insert("track_id".to_string(), external_id.to_string());
        params.insert("format_id".to_string(), Self::format_id(quality).to_string());
        params.insert("intent".to_string(), "stream".to_string());

        let resp: QobuzStreamResponse = self
            .make_request("track/getFileUrl", &params, true)
            .await?;

        let Some(url) = resp.url else {
            return Err(CadenzaError::Integrity(
                "file url response carried no url".to_string(),
            ));
        };
        if resp.sample.unwrap_or(false) {
            warn!("received a sample stream for track {}; serving it anyway", external_id);
        }

        Ok(DownloadSource {
            url,
            mime_type: resp
                .mime_type
                .unwrap_or_else(|| "audio/flac".to_string()),
            quality,
            cipher: StreamCipher::None,
        })
    }

    async fn is_available(&self) -> bool {
        self.credentials().await.is_ok()
    }
}

fn scan_between(haystack: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = haystack.find(prefix)? + prefix.len();
    let rest = &haystack[start..];
    let end = rest.find(suffix)?;
    Some(rest[..end].to_string())
}

// API response structures.

#[derive(Debug, Deserialize)]
struct QobuzSearchResponse {
    tracks: Option<QobuzItemList<QobuzTrack>>,
    albums: Option<QobuzItemList<QobuzAlbum>>,
    artists: Option<QobuzItemList<QobuzArtist>>,
    playlists: Option<QobuzItemList<QobuzPlaylist>>,
}

#[derive(Debug, Deserialize)]
struct QobuzItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct QobuzTrack {
    id: serde_json::Value, // Can be string or number
    title: String,
    duration: Option<i64>,
    track_number: Option<u32>,
    media_number: Option<u32>,
    isrc: Option<String>,
    parental_warning: Option<bool>,
    performer: Option<QobuzArtistRef>,
    album: Option<QobuzAlbum>,
}

#[derive(Debug, Deserialize)]
struct QobuzArtistRef {
    id: serde_json::Value,
    name: String,
}

#[derive(Debug, Deserialize)]
struct QobuzAlbum {
    id: serde_json::Value,
    title: String,
    artist: Option<QobuzArtistRef>,
    released_at: Option<i64>, // Can be negative (dates before 1970)
    tracks_count: Option<u32>,
    image: Option<QobuzImage>,
    genre: Option<QobuzGenre>,
}

#[derive(Debug, Deserialize)]
struct QobuzAlbumFull {
    #[serde(flatten)]
    base: QobuzAlbum,
    tracks: Option<QobuzItemList<QobuzTrack>>,
}

#[derive(Debug, Deserialize)]
struct QobuzGenre {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QobuzImage {
    large: Option<String>,
    small: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QobuzArtist {
    id: serde_json::Value,
    name: String,
    albums_count: Option<u32>,
    picture: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QobuzArtistWithAlbums {
    albums: Option<QobuzItemList<QobuzAlbum>>,
}

#[derive(Debug, Deserialize)]
struct QobuzPlaylist {
    id: serde_json::Value,
    name: String,
    description: Option<String>,
    tracks_count: Option<u32>,
    duration: Option<u32>,
    image_rectangle: Option<Vec<String>>,
    owner: Option<QobuzOwner>,
}

#[derive(Debug, Deserialize)]
struct QobuzPlaylistWithTracks {
    tracks: Option<QobuzItemList<QobuzTrack>>,
}

#[derive(Debug, Deserialize)]
struct QobuzOwner {
    name: String,
}

#[derive(Debug, Deserialize)]
struct QobuzStreamResponse {
    url: Option<String>,
    mime_type: Option<String>,
    sample: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_url_signature_uses_fixed_parameter_order() {
        let mut params = HashMap::new();
        params.insert("track_id".to_string(), "123".to_string());
        params.insert("format_id".to_string(), "6".to_string());
        params.insert("intent".to_string(), "stream".to_string());

        let sig =
            QobuzProvider::generate_request_signature("track/getFileUrl", &params, "1700000000", "sekrit");
        let expected = format!(
            "{:x}",
            md5::compute("trackgetFileUrlformat_id6intentstreamtrack_id1231700000000sekrit")
        );
        assert_eq!(sig, expected);
    }

    #[test]
    fn generic_signature_sorts_parameters() {
        let mut params = HashMap::new();
        params.insert("b".to_string(), "2".to_string());
        params.insert("a".to_string(), "1".to_string());

        let sig = QobuzProvider::generate_request_signature("album/get", &params, "0", "s");
        let expected = format!("{:x}", md5::compute("albumgeta1b2s"));
        assert_eq!(sig, expected);
    }

    #[test]
    fn bundle_scan_finds_credentials() {
        let bundle = r#"var x={production:{api:{appId:"123456789",appSecret:"abcdef0123"}}}"#;
        assert_eq!(
            scan_between(bundle, "production:{api:{appId:\"", "\"").unwrap(),
            "123456789"
        );
        assert_eq!(
            scan_between(bundle, "appSecret:\"", "\"").unwrap(),
            "abcdef0123"
        );
    }

    #[test]
    fn quality_maps_to_format_ids() {
        assert_eq!(QobuzProvider::format_id(Quality::High), "5");
        assert_eq!(QobuzProvider::format_id(Quality::Lossless), "6");
        assert_eq!(QobuzProvider::format_id(Quality::HiRes), "27");
    }
}
