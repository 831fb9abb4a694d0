pub mod deezer;
pub mod qobuz;
pub mod tidal;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{Config, ProviderKind};
use crate::errors::Result;
use crate::models::{Album, Artist, ExternalPlaylist, Quality, SearchResults, Song};

/// How the bytes coming off the download URL are protected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCipher {
    None,
    /// Every third 2048-byte block is Blowfish-CBC encrypted with this
    /// track-specific key.
    BlowfishCbcStripe { key: [u8; 16] },
}

/// A resolved, short-lived source for one track's audio.
#[derive(Debug, Clone)]
pub struct DownloadSource {
    pub url: String,
    pub mime_type: String,
    pub quality: Quality,
    pub cipher: StreamCipher,
}

/// The capability set every streaming provider implements.
///
/// "Not found" and unsupported kinds come back as empty lists rather than
/// errors; anything a provider returns is already normalized to domain
/// objects with provider-tagged `ext-…` identifiers.
#[async_trait]
pub trait MusicProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search_songs(&self, query: &str, limit: u32) -> Result<Vec<Song>>;

    async fn search_albums(&self, _query: &str, _limit: u32) -> Result<Vec<Album>> {
        Ok(Vec::new())
    }

    async fn search_artists(&self, _query: &str, _limit: u32) -> Result<Vec<Artist>> {
        Ok(Vec::new())
    }

    async fn search_playlists(&self, _query: &str, _limit: u32) -> Result<Vec<ExternalPlaylist>> {
        Ok(Vec::new())
    }

    async fn get_song(&self, external_id: &str) -> Result<Song>;

    async fn get_album(&self, external_id: &str) -> Result<Album>;

    async fn get_artist(&self, external_id: &str) -> Result<Artist>;

    async fn get_artist_albums(&self, external_id: &str) -> Result<Vec<Album>>;

    async fn get_playlist(&self, _external_id: &str) -> Result<ExternalPlaylist> {
        Err(crate::errors::CadenzaError::NotFound(
            "playlists not supported by this provider".to_string(),
        ))
    }

    async fn get_playlist_tracks(&self, _external_id: &str) -> Result<Vec<Song>> {
        Ok(Vec::new())
    }

    /// Resolve the short-lived CDN URL (and cipher, when the stream is
    /// protected) for one track at the preferred quality.
    async fn resolve_download(&self, external_id: &str, quality: Quality)
        -> Result<DownloadSource>;

    async fn is_available(&self) -> bool;

    /// Convenience fan-in used by the search merger.
    async fn search_all(&self, query: &str, limit: u32) -> SearchResults {
        let (songs, albums, artists, playlists) = tokio::join!(
            self.search_songs(query, limit),
            self.search_albums(query, limit),
            self.search_artists(query, limit),
            self.search_playlists(query, limit),
        );
        SearchResults {
            songs: songs.unwrap_or_default(),
            albums: albums.unwrap_or_default(),
            artists: artists.unwrap_or_default(),
            playlists: playlists.unwrap_or_default(),
        }
    }
}

/// Select the concrete provider at startup; dispatch stays behind the trait
/// from here on.
pub fn create_provider(config: &Config) -> Arc<dyn MusicProvider> {
    match config.provider {
        ProviderKind::Tidal => Arc::new(tidal::TidalProvider::new()),
        ProviderKind::Deezer => Arc::new(deezer::DeezerProvider::new(
            config.deezer_arl.clone().unwrap_or_default(),
            config.deezer_arl_fallback.clone(),
        )),
        ProviderKind::Qobuz => Arc::new(qobuz::QobuzProvider::new(
            config.qobuz_app_id.clone(),
            config.qobuz_secret.clone(),
            config.qobuz_bundle_url.clone(),
        )),
    }
}
