//! Client for the local media backend the proxy fronts.
//!
//! The proxy is transparent: the client's own credentials (query parameters
//! or Authorization header) are forwarded verbatim, and backend identifiers
//! pass through untouched. Results are normalized into the same domain
//! objects the providers produce, flagged `is_local`.

use std::time::Duration;

use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::warn;

use crate::config::BackendKind;
use crate::errors::{CadenzaError, Result};
use crate::models::{Album, Artist, SearchResults, Song};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials the client presented to us, replayed to the backend.
#[derive(Debug, Clone, Default)]
pub struct ClientAuth {
    /// Raw query string of the incoming request, minus our own parameters.
    pub query: String,
    pub authorization: Option<String>,
}

pub struct MediaBackend {
    client: Client,
    base_url: String,
    kind: BackendKind,
}

impl MediaBackend {
    pub fn new(base_url: String, kind: BackendKind) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            kind,
        }
    }

    fn url(&self, path: &str, auth: &ClientAuth) -> String {
        let sep = if path.contains('?') { '&' } else { '?' };
        if auth.query.is_empty() {
            format!("{}/{}", self.base_url, path)
        } else {
            format!("{}/{}{}{}", self.base_url, path, sep, auth.query)
        }
    }

    fn apply_auth(&self, mut req: reqwest::RequestBuilder, auth: &ClientAuth) -> reqwest::RequestBuilder {
        if let Some(authorization) = &auth.authorization {
            req = req.header(AUTHORIZATION, authorization);
        }
        req
    }

    fn check_client_auth(status: StatusCode) -> Result<()> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(CadenzaError::Unauthorized(status));
        }
        Ok(())
    }

    /// Reachability probe used during startup validation; a failure degrades
    /// the proxy to provider-only operation rather than aborting it.
    pub async fn probe(&self) -> Result<()> {
        let path = match self.kind {
            BackendKind::Jellyfin => "System/Info/Public".to_string(),
            BackendKind::Subsonic => "rest/ping?f=json".to_string(),
        };
        let url = format!("{}/{}", self.base_url, path);
        let send = self.client.get(&url).send();
        match tokio::time::timeout(PROBE_TIMEOUT, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => Ok(()),
            Ok(Ok(resp)) => Err(CadenzaError::Transient(format!(
                "backend probe returned {}",
                resp.status()
            ))),
            Ok(Err(e)) => Err(CadenzaError::Http(e)),
            Err(_) => Err(CadenzaError::Transient("backend probe timed out".to_string())),
        }
    }

    pub async fn search(
        &self,
        query: &str,
        limit: u32,
        auth: &ClientAuth,
    ) -> Result<SearchResults> {
        match self.kind {
            BackendKind::Subsonic => self.search_subsonic(query, limit, auth).await,
            BackendKind::Jellyfin => self.search_jellyfin(query, limit, auth).await,
        }
    }

    async fn search_subsonic(
        &self,
        query: &str,
        limit: u32,
        auth: &ClientAuth,
    ) -> Result<SearchResults> {
        let path = format!(
            "rest/search3?query={}&songCount={}&albumCount={}&artistCount={}&f=json",
            urlencoding::encode(query),
            limit,
            limit,
            limit
        );
        let resp = self
            .apply_auth(self.client.get(self.url(&path, auth)), auth)
            .send()
            .await?;
        Self::check_client_auth(resp.status())?;
        if !resp.status().is_success() {
            return Err(CadenzaError::Transient(format!(
                "backend search returned {}",
                resp.status()
            )));
        }

        let envelope: SubsonicEnvelope = resp.json().await?;
        let inner = envelope.subsonic_response;
        if inner.status != "ok" {
            // Subsonic reports auth failures inside a 200 envelope: 40-44
            // are credential problems, 50 is a permission problem. All of
            // them must reach the client, never read as an empty catalog.
            if let Some(err) = &inner.error {
                match err.code {
                    40..=49 => return Err(CadenzaError::Unauthorized(StatusCode::UNAUTHORIZED)),
                    50 => return Err(CadenzaError::Unauthorized(StatusCode::FORBIDDEN)),
                    _ => warn!("backend search error {}: {}", err.code, err.message),
                }
            }
            return Ok(SearchResults::default());
        }

        let result = inner.search_result3.unwrap_or_default();
        Ok(SearchResults {
            songs: result.song.into_iter().map(local_song).collect(),
            albums: result.album.into_iter().map(local_album).collect(),
            artists: result.artist.into_iter().map(local_artist).collect(),
            playlists: Vec::new(),
        })
    }

    async fn search_jellyfin(
        &self,
        query: &str,
        limit: u32,
        auth: &ClientAuth,
    ) -> Result<SearchResults> {
        let path = format!(
            "Items?searchTerm={}&IncludeItemTypes=Audio,MusicAlbum,MusicArtist&Recursive=true&limit={}",
            urlencoding::encode(query),
            limit * 3
        );
        let resp = self
            .apply_auth(self.client.get(self.url(&path, auth)), auth)
            .send()
            .await?;
        Self::check_client_auth(resp.status())?;
        if !resp.status().is_success() {
            return Err(CadenzaError::Transient(format!(
                "backend search returned {}",
                resp.status()
            )));
        }

        let envelope: JellyfinItems = resp.json().await?;
        let mut results = SearchResults::default();
        for item in envelope.items {
            match item.item_type.as_str() {
                "Audio" => results.songs.push(jellyfin_song(item)),
                "MusicAlbum" => results.albums.push(jellyfin_album(item)),
                "MusicArtist" => results.artists.push(jellyfin_artist(item)),
                _ => {}
            }
        }
        Ok(results)
    }

    /// Open the backend's stream for a local id, replaying the caching and
    /// range headers from the client request. The response is handed back
    /// with its body unread so the handler can proxy it.
    pub async fn stream(
        &self,
        id: &str,
        headers: &HeaderMap,
        auth: &ClientAuth,
    ) -> Result<Response> {
        let path = match self.kind {
            BackendKind::Subsonic => format!("rest/stream?id={}", urlencoding::encode(id)),
            BackendKind::Jellyfin => {
                format!("Audio/{}/stream?static=true", urlencoding::encode(id))
            }
        };

        let mut req = self.apply_auth(self.client.get(self.url(&path, auth)), auth);
        for name in [
            reqwest::header::RANGE,
            reqwest::header::IF_RANGE,
            reqwest::header::IF_NONE_MATCH,
            reqwest::header::IF_MODIFIED_SINCE,
        ] {
            if let Some(value) = headers.get(&name) {
                req = req.header(name, value.clone());
            }
        }

        let resp = req.send().await?;
        Self::check_client_auth(resp.status())?;
        Ok(resp)
    }

    pub async fn image(&self, id: &str, auth: &ClientAuth) -> Result<Response> {
        let path = match self.kind {
            BackendKind::Subsonic => format!("rest/getCoverArt?id={}", urlencoding::encode(id)),
            BackendKind::Jellyfin => format!("Items/{}/Images/Primary", urlencoding::encode(id)),
        };
        let resp = self
            .apply_auth(self.client.get(self.url(&path, auth)), auth)
            .send()
            .await?;
        Self::check_client_auth(resp.status())?;
        Ok(resp)
    }

    pub async fn favorite(&self, id: &str, on: bool, auth: &ClientAuth) -> Result<()> {
        let resp = match self.kind {
            BackendKind::Subsonic => {
                let verb = if on { "star" } else { "unstar" };
                let path = format!("rest/{}?id={}&f=json", verb, urlencoding::encode(id));
                self.apply_auth(self.client.get(self.url(&path, auth)), auth)
                    .send()
                    .await?
            }
            BackendKind::Jellyfin => {
                let path = format!("UserFavoriteItems/{}", urlencoding::encode(id));
                let req = if on {
                    self.client.post(self.url(&path, auth))
                } else {
                    self.client.delete(self.url(&path, auth))
                };
                self.apply_auth(req, auth).send().await?
            }
        };
        Self::check_client_auth(resp.status())?;
        if !resp.status().is_success() {
            return Err(CadenzaError::Transient(format!(
                "backend favorite returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

fn local_song(item: SubsonicSong) -> Song {
    let artist = item.artist.unwrap_or_else(|| "Unknown Artist".to_string());
    Song {
        id: item.id,
        title: item.title,
        artist: artist.clone(),
        album_artist: artist,
        album: item.album.unwrap_or_else(|| "Unknown Album".to_string()),
        album_id: item.album_id,
        artist_id: item.artist_id,
        track_number: item.track,
        disc_number: item.disc_number.unwrap_or(1),
        duration_seconds: item.duration,
        year: item.year,
        genre: item.genre,
        cover_art_url: item.cover_art,
        is_local: true,
        ..Default::default()
    }
}

fn local_album(item: SubsonicAlbum) -> Album {
    Album {
        id: item.id,
        title: item.name,
        artist: item.artist.unwrap_or_else(|| "Unknown Artist".to_string()),
        artist_id: item.artist_id,
        year: item.year,
        song_count: item.song_count,
        genre: item.genre,
        cover_art_url: item.cover_art,
        is_local: true,
        ..Default::default()
    }
}

fn local_artist(item: SubsonicArtist) -> Artist {
    Artist {
        id: item.id,
        name: item.name,
        album_count: item.album_count,
        image_url: item.cover_art,
        is_local: true,
        ..Default::default()
    }
}

fn jellyfin_song(item: JellyfinItem) -> Song {
    let artist = item
        .artists
        .first()
        .cloned()
        .or(item.album_artist.clone())
        .unwrap_or_else(|| "Unknown Artist".to_string());
    Song {
        id: item.id,
        title: item.name,
        artist: artist.clone(),
        album_artist: item.album_artist.unwrap_or(artist),
        album: item.album.unwrap_or_else(|| "Unknown Album".to_string()),
        album_id: item.album_id,
        track_number: item.index_number,
        disc_number: item.parent_index_number.unwrap_or(1),
        // RunTimeTicks are 100ns units.
        duration_seconds: item.run_time_ticks.map(|t| (t / 10_000_000) as u32),
        year: item.production_year,
        is_local: true,
        ..Default::default()
    }
}

fn jellyfin_album(item: JellyfinItem) -> Album {
    Album {
        id: item.id,
        title: item.name,
        artist: item
            .album_artist
            .or_else(|| item.artists.first().cloned())
            .unwrap_or_else(|| "Unknown Artist".to_string()),
        year: item.production_year,
        song_count: item.child_count,
        is_local: true,
        ..Default::default()
    }
}

fn jellyfin_artist(item: JellyfinItem) -> Artist {
    Artist {
        id: item.id,
        name: item.name,
        is_local: true,
        ..Default::default()
    }
}

// Backend response structures.

#[derive(Debug, Deserialize)]
struct SubsonicEnvelope {
    #[serde(rename = "subsonic-response")]
    subsonic_response: SubsonicInner,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicInner {
    status: String,
    error: Option<SubsonicError>,
    search_result3: Option<SearchResult3>,
}

#[derive(Debug, Deserialize)]
struct SubsonicError {
    code: i32,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct SearchResult3 {
    #[serde(default)]
    artist: Vec<SubsonicArtist>,
    #[serde(default)]
    album: Vec<SubsonicAlbum>,
    #[serde(default)]
    song: Vec<SubsonicSong>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicSong {
    id: String,
    title: String,
    album: Option<String>,
    artist: Option<String>,
    album_id: Option<String>,
    artist_id: Option<String>,
    duration: Option<u32>,
    cover_art: Option<String>,
    track: Option<u32>,
    disc_number: Option<u32>,
    year: Option<i32>,
    genre: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicAlbum {
    id: String,
    name: String,
    artist: Option<String>,
    artist_id: Option<String>,
    cover_art: Option<String>,
    song_count: Option<u32>,
    year: Option<i32>,
    genre: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubsonicArtist {
    id: String,
    name: String,
    cover_art: Option<String>,
    album_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinItems {
    #[serde(default)]
    items: Vec<JellyfinItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct JellyfinItem {
    id: String,
    name: String,
    #[serde(rename = "Type")]
    item_type: String,
    album: Option<String>,
    album_id: Option<String>,
    album_artist: Option<String>,
    #[serde(default)]
    artists: Vec<String>,
    run_time_ticks: Option<u64>,
    index_number: Option<u32>,
    parent_index_number: Option<u32>,
    production_year: Option<i32>,
    child_count: Option<u32>,
}
