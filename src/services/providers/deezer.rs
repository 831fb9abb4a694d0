//! Cookie-authenticated provider.
//!
//! The long-lived ARL cookie buys two short-lived tokens from the gateway:
//! an API token for gateway calls and a license token for media URL
//! issuance. Audio arrives Blowfish-CBC striped; the per-track key is
//! derived from the md5 digest of the track id.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::warn;

use crate::errors::{CadenzaError, Result};
use crate::models::{Album, Artist, ExplicitNote, ExternalPlaylist, Quality, Song};
use crate::services::cipher::derive_track_key;
use crate::services::http_pool::HttpPool;
use crate::services::ids::{encode, IdKind};
use crate::services::providers::{DownloadSource, MusicProvider, StreamCipher};

const PROVIDER_NAME: &str = "deezer";

const API_BASE: &str = "https://api.deezer.com";
const GATEWAY_URL: &str = "https://www.deezer.com/ajax/gw-light.php";
const MEDIA_URL: &str = "https://media.deezer.com/v1/get_url";

const BF_SECRET: &[u8; 16] = b"g4el58wc0zvf9na1";

#[derive(Debug, Clone)]
struct Session {
    api_token: String,
    license_token: String,
    /// The ARL that bought these tokens; the gateway rejects a token sent
    /// with any other account's cookie.
    arl: String,
}

pub struct DeezerProvider {
    pool: HttpPool,
    arl: String,
    arl_fallback: Option<String>,
    session: RwLock<Option<Session>>,
}

impl DeezerProvider {
    pub fn new(arl: String, arl_fallback: Option<String>) -> Self {
        Self {
            pool: HttpPool::new(Vec::new()),
            arl,
            arl_fallback,
            session: RwLock::new(None),
        }
    }

    async fn gateway_call(&self, method: &str, api_token: &str, arl: &str, body: Value) -> Result<Value> {
        let path = format!(
            "{}?method={}&input=3&api_version=1.0&api_token={}",
            GATEWAY_URL, method, api_token
        );
        let cookie = format!("arl={}", arl);
        let resp: GatewayEnvelope = self
            .pool
            .post_json_with(&path, move |req| {
                req.header("Cookie", cookie.clone()).json(&body)
            })
            .await?;

        if let Some(err) = resp.error.as_object() {
            if !err.is_empty() {
                if err.contains_key("VALID_TOKEN_REQUIRED") || err.contains_key("NEED_USER_AUTH") {
                    return Err(CadenzaError::Unauthenticated(format!(
                        "gateway rejected {}: {:?}",
                        method, err
                    )));
                }
                return Err(CadenzaError::Transient(format!(
                    "gateway error on {}: {:?}",
                    method, err
                )));
            }
        }
        Ok(resp.results)
    }

    async fn login_with(&self, arl: &str) -> Result<Session> {
        let results = self
            .gateway_call("deezer.getUserData", "", arl, json!({}))
            .await?;

        let user_id = results
            .pointer("/USER/USER_ID")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if user_id == 0 {
            return Err(CadenzaError::Unauthenticated(
                "ARL cookie was not accepted".to_string(),
            ));
        }

        let api_token = results
            .get("checkForm")
            .and_then(Value::as_str)
            .ok_or_else(|| CadenzaError::Integrity("getUserData missing checkForm".to_string()))?
            .to_string();
        let license_token = results
            .pointer("/USER/OPTIONS/license_token")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CadenzaError::Integrity("getUserData missing license token".to_string())
            })?
            .to_string();

        Ok(Session {
            api_token,
            license_token,
            arl: arl.to_string(),
        })
    }

    /// Log in with the primary ARL, falling back to the secondary one on an
    /// authentication failure. The switch is a warning, not an error.
    async fn ensure_session(&self) -> Result<Session> {
        if let Some(session) = self.session.read().await.clone() {
            return Ok(session);
        }

        let session = match self.login_with(&self.arl).await {
            Ok(s) => s,
            Err(e) if matches!(e, CadenzaError::Unauthenticated(_)) => {
                let Some(fallback) = &self.arl_fallback else {
                    return Err(e);
                };
                warn!("primary ARL rejected, switching to fallback credential");
                self.login_with(fallback).await?
            }
            Err(e) => return Err(e),
        };

        *self.session.write().await = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached tokens so the next call re-authenticates.
    async fn invalidate_session(&self) {
        *self.session.write().await = None;
    }

    fn formats_for(quality: Quality) -> Vec<&'static str> {
        match quality {
            Quality::Low => vec!["MP3_128", "MP3_64"],
            Quality::High => vec!["MP3_320", "MP3_128"],
            // No separate hi-res tier upstream; FLAC is the ceiling.
            Quality::Lossless | Quality::HiRes => vec!["FLAC", "MP3_320", "MP3_128"],
        }
    }

    fn mime_for_format(format: &str) -> &'static str {
        if format.starts_with("FLAC") {
            "audio/flac"
        } else {
            "audio/mpeg"
        }
    }

    fn song_from_item(item: &DeezerTrack) -> Song {
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
        song.track_number = item.track_position;
        song.disc_number = item.disk_number.unwrap_or(1);
        song.duration_seconds = item.duration;
        song.isrc = item.isrc.clone();
        song.bpm = item.bpm.filter(|b| *b > 0.0).map(|b| b.round() as u32);
        song.explicit = match item.explicit_lyrics {
            Some(true) => ExplicitNote::Explicit,
            Some(false) => ExplicitNote::Clean,
            None => ExplicitNote::Unknown,
        };
        song.cover_art_url = item.album.as_ref().and_then(|a| a.cover_medium.clone());
        song.cover_art_url_large = item.album.as_ref().and_then(|a| a.cover_xl.clone());
        song
    }

    fn album_from_item(item: &DeezerAlbum) -> Album {
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
            song_count: item.nb_tracks,
            genre: None,
            cover_art_url: item.cover_medium.clone(),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(item.id.to_string()),
            songs: Vec::new(),
        }
    }

    fn artist_from_item(item: &DeezerArtist) -> Artist {
        Artist {
            id: encode(PROVIDER_NAME, IdKind::Artist, &item.id.to_string()),
            name: item.name.clone(),
            album_count: item.nb_album,
            image_url: item.picture_medium.clone(),
            is_local: false,
            external_provider: Some(PROVIDER_NAME.to_string()),
            external_id: Some(item.id.to_string()),
        }
    }

    fn playlist_from_item(item: &DeezerPlaylist) -> ExternalPlaylist {
        ExternalPlaylist {
            id: encode(PROVIDER_NAME, IdKind::Playlist, &item.id.to_string()),
            name: item.title.clone(),
            description: item.description.clone(),
            curator_name: item.user.as_ref().map(|u| u.name.clone()),
            provider: PROVIDER_NAME.to_string(),
            external_id: item.id.to_string(),
            track_count: item.nb_tracks,
            duration_seconds: item.duration,
            cover_url: item.picture_medium.clone(),
            created_date: None,
        }
    }

    async fn request_media_url(
        &self,
        session: &Session,
        track_token: &str,
        quality: Quality,
    ) -> Result<(String, String)> {
        let formats: Vec<Value> = Self::formats_for(quality)
            .iter()
            .map(|f| json!({"cipher": "BF_CBC_STRIPE", "format": f}))
            .collect();
        let body = json!({
            "license_token": session.license_token,
            "media": [{"type": "FULL", "formats": formats}],
            "track_tokens": [track_token],
        });

        let resp: MediaEnvelope = self
            .pool
            .post_json_with(MEDIA_URL, move |req| req.json(&body))
            .await?;

        let media = resp
            .data
            .into_iter()
            .next()
            .and_then(|d| d.media.into_iter().next())
            .ok_or_else(|| CadenzaError::Integrity("media response carried no media".to_string()))?;
        let format = media.format.clone();
        let url = media
            .sources
            .into_iter()
            .next()
            .map(|s| s.url)
            .ok_or_else(|| CadenzaError::Integrity("media response carried no source url".to_string()))?;
        Ok((url, format))
    }
}

#[async_trait]
impl MusicProvider for DeezerProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn search_songs(&self, query: &str, limit: u32) -> Result<Vec<Song>> {
        let path = format!(
            "{}/search?q={}&limit={}",
            API_BASE,
            urlencoding::encode(query),
            limit
        );
        let resp: DeezerList<DeezerTrack> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::song_from_item).collect())
    }

    async fn search_albums(&self, query: &str, limit: u32) -> Result<Vec<Album>> {
        let path = format!(
            "{}/search/album?q={}&limit={}",
            API_BASE,
            urlencoding::encode(query),
            limit
        );
        let resp: DeezerList<DeezerAlbum> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::album_from_item).collect())
    }

    async fn search_artists(&self, query: &str, limit: u32) -> Result<Vec<Artist>> {
        let path = format!(
            "{}/search/artist?q={}&limit={}",
            API_BASE,
            urlencoding::encode(query),
            limit
        );
        let resp: DeezerList<DeezerArtist> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::artist_from_item).collect())
    }

    async fn search_playlists(&self, query: &str, limit: u32) -> Result<Vec<ExternalPlaylist>> {
        let path = format!(
            "{}/search/playlist?q={}&limit={}",
            API_BASE,
            urlencoding::encode(query),
            limit
        );
        let resp: DeezerList<DeezerPlaylist> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::playlist_from_item).collect())
    }

    async fn get_song(&self, external_id: &str) -> Result<Song> {
        let path = format!("{}/track/{}", API_BASE, urlencoding::encode(external_id));
        let item: DeezerTrack = self.pool.get_json(&path).await?;
        Ok(Self::song_from_item(&item))
    }

    async fn get_album(&self, external_id: &str) -> Result<Album> {
        let path = format!("{}/album/{}", API_BASE, urlencoding::encode(external_id));
        let item: DeezerAlbumFull = self.pool.get_json(&path).await?;
        let mut album = Self::album_from_item(&item.base);
        album.songs = item
            .tracks
            .map(|t| t.data.iter().map(Self::song_from_item).collect())
            .unwrap_or_default();
        // The track list endpoint omits album refs; fill them in from the
        // album we are looking at.
        for song in &mut album.songs {
            if song.album == "Unknown Album" {
                song.album = album.title.clone();
            }
            if song.album_id.is_none() {
                song.album_id = Some(album.id.clone());
            }
            if song.cover_art_url.is_none() {
                song.cover_art_url = album.cover_art_url.clone();
            }
        }
        Ok(album)
    }

    async fn get_artist(&self, external_id: &str) -> Result<Artist> {
        let path = format!("{}/artist/{}", API_BASE, urlencoding::encode(external_id));
        let item: DeezerArtist = self.pool.get_json(&path).await?;
        Ok(Self::artist_from_item(&item))
    }

    async fn get_artist_albums(&self, external_id: &str) -> Result<Vec<Album>> {
        let path = format!(
            "{}/artist/{}/albums",
            API_BASE,
            urlencoding::encode(external_id)
        );
        let resp: DeezerList<DeezerAlbum> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::album_from_item).collect())
    }

    async fn get_playlist(&self, external_id: &str) -> Result<ExternalPlaylist> {
        let path = format!("{}/playlist/{}", API_BASE, urlencoding::encode(external_id));
        let item: DeezerPlaylist = self.pool.get_json(&path).await?;
        Ok(Self::playlist_from_item(&item))
    }

    async fn get_playlist_tracks(&self, external_id: &str) -> Result<Vec<Song>> {
        let path = format!(
            "{}/playlist/{}/tracks",
            API_BASE,
            urlencoding::encode(external_id)
        );
        let resp: DeezerList<DeezerTrack> = self.pool.get_json(&path).await?;
        Ok(resp.data.iter().map(Self::song_from_item).collect())
    }

    async fn resolve_download(
        &self,
        external_id: &str,
        quality: Quality,
    ) -> Result<DownloadSource> {
        let session = self.ensure_session().await?;

        let track_data = match self
            .gateway_call(
                "song.getData",
                &session.api_token,
                &session.arl,
                json!({"SNG_ID": external_id}),
            )
            .await
        {
            Ok(data) => data,
            Err(e) if matches!(e, CadenzaError::Unauthenticated(_)) => {
                // Expired tokens look like an auth failure; one refresh.
                self.invalidate_session().await;
                let session = self.ensure_session().await?;
                self.gateway_call(
                    "song.getData",
                    &session.api_token,
                    &session.arl,
                    json!({"SNG_ID": external_id}),
                )
                .await?
            }
            Err(e) => return Err(e),
        };

        let track_token = track_data
            .get("TRACK_TOKEN")
            .and_then(Value::as_str)
            .ok_or_else(|| CadenzaError::Integrity("song data missing track token".to_string()))?;

        let session = self.ensure_session().await?;
        let (url, format) = self
            .request_media_url(&session, track_token, quality)
            .await?;

        Ok(DownloadSource {
            url,
            mime_type: Self::mime_for_format(&format).to_string(),
            quality,
            cipher: StreamCipher::BlowfishCbcStripe {
                key: derive_track_key(external_id, BF_SECRET),
            },
        })
    }

    async fn is_available(&self) -> bool {
        self.ensure_session().await.is_ok()
    }
}

// Gateway and public API response structures.

#[derive(Debug, Deserialize)]
struct GatewayEnvelope {
    #[serde(default)]
    error: Value,
    #[serde(default)]
    results: Value,
}

#[derive(Debug, Deserialize)]
struct DeezerList<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct DeezerTrack {
    id: u64,
    title: String,
    duration: Option<u32>,
    explicit_lyrics: Option<bool>,
    track_position: Option<u32>,
    disk_number: Option<u32>,
    isrc: Option<String>,
    bpm: Option<f64>,
    artist: Option<DeezerArtistRef>,
    album: Option<DeezerAlbumRef>,
}

#[derive(Debug, Deserialize)]
struct DeezerArtistRef {
    id: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbumRef {
    id: u64,
    title: String,
    cover_medium: Option<String>,
    cover_xl: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbum {
    id: u64,
    title: String,
    release_date: Option<String>,
    nb_tracks: Option<u32>,
    cover_medium: Option<String>,
    artist: Option<DeezerArtistRef>,
}

#[derive(Debug, Deserialize)]
struct DeezerAlbumFull {
    #[serde(flatten)]
    base: DeezerAlbum,
    tracks: Option<DeezerList<DeezerTrack>>,
}

#[derive(Debug, Deserialize)]
struct DeezerArtist {
    id: u64,
    name: String,
    nb_album: Option<u32>,
    picture_medium: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeezerPlaylist {
    id: u64,
    title: String,
    description: Option<String>,
    nb_tracks: Option<u32>,
    duration: Option<u32>,
    picture_medium: Option<String>,
    user: Option<DeezerUserRef>,
}

#[derive(Debug, Deserialize)]
struct DeezerUserRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct MediaEnvelope {
    #[serde(default = "Vec::new")]
    data: Vec<MediaData>,
}

#[derive(Debug, Deserialize)]
struct MediaData {
    #[serde(default = "Vec::new")]
    media: Vec<MediaEntry>,
}

#[derive(Debug, Deserialize)]
struct MediaEntry {
    format: String,
    #[serde(default = "Vec::new")]
    sources: Vec<MediaSource>,
}

#[derive(Debug, Deserialize)]
struct MediaSource {
    url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quality_maps_to_format_preference_order() {
        assert_eq!(
            DeezerProvider::formats_for(Quality::Lossless),
            vec!["FLAC", "MP3_320", "MP3_128"]
        );
        assert_eq!(
            DeezerProvider::formats_for(Quality::Low),
            vec!["MP3_128", "MP3_64"]
        );
    }

    #[test]
    fn format_string_maps_to_mime() {
        assert_eq!(DeezerProvider::mime_for_format("FLAC"), "audio/flac");
        assert_eq!(DeezerProvider::mime_for_format("MP3_320"), "audio/mpeg");
    }

    #[test]
    fn download_source_carries_stripe_cipher_key() {
        let key = derive_track_key("3135556", BF_SECRET);
        let source = DownloadSource {
            url: "https://cdn.example".to_string(),
            mime_type: "audio/flac".to_string(),
            quality: Quality::Lossless,
            cipher: StreamCipher::BlowfishCbcStripe { key },
        };
        match source.cipher {
            StreamCipher::BlowfishCbcStripe { key: k } => {
                assert_eq!(k, derive_track_key("3135556", BF_SECRET));
            }
            StreamCipher::None => panic!("expected stripe cipher"),
        }
    }
}
