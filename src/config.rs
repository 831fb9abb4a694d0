use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Tidal,
    Deezer,
    Qobuz,
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tidal" => Ok(ProviderKind::Tidal),
            "deezer" => Ok(ProviderKind::Deezer),
            "qobuz" => Ok(ProviderKind::Qobuz),
            _ => Err(format!("invalid provider '{}'. Valid: tidal, deezer, qobuz", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Permanent,
    Cache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExplicitFilter {
    All,
    ExplicitOnly,
    CleanOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Track,
    Album,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Jellyfin,
    Subsonic,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,

    pub library_root: PathBuf,
    pub playlists_dir: PathBuf,
    pub storage_mode: StorageMode,
    pub cache_ttl_hours: u64,

    pub provider: ProviderKind,
    pub preferred_quality: crate::models::Quality,
    pub explicit_filter: ExplicitFilter,
    pub download_mode: DownloadMode,
    pub external_playlists_enabled: bool,

    pub backend_url: Option<String>,
    pub backend_kind: BackendKind,

    pub deezer_arl: Option<String>,
    pub deezer_arl_fallback: Option<String>,
    pub qobuz_app_id: Option<String>,
    pub qobuz_secret: Option<String>,
    pub qobuz_bundle_url: Option<String>,
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl FromStr for StorageMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "permanent" => Ok(StorageMode::Permanent),
            "cache" => Ok(StorageMode::Cache),
            _ => Err(format!("invalid storage mode '{}'. Valid: permanent, cache", s)),
        }
    }
}

impl FromStr for ExplicitFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" => Ok(ExplicitFilter::All),
            "explicit_only" => Ok(ExplicitFilter::ExplicitOnly),
            "clean_only" => Ok(ExplicitFilter::CleanOnly),
            _ => Err(format!(
                "invalid explicit filter '{}'. Valid: all, explicit_only, clean_only",
                s
            )),
        }
    }
}

impl FromStr for DownloadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "track" => Ok(DownloadMode::Track),
            "album" => Ok(DownloadMode::Album),
            _ => Err(format!("invalid download mode '{}'. Valid: track, album", s)),
        }
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jellyfin" => Ok(BackendKind::Jellyfin),
            "subsonic" => Ok(BackendKind::Subsonic),
            _ => Err(format!("invalid backend kind '{}'. Valid: jellyfin, subsonic", s)),
        }
    }
}

impl Config {
    /// Load from the environment. Hard failures here (bad enum values,
    /// missing credentials for the selected provider) bubble up and make
    /// `main` exit non-zero; everything else gets a sane default.
    pub fn from_env() -> Result<Self> {
        let library_root = PathBuf::from(
            env::var("LIBRARY_ROOT").unwrap_or_else(|_| "./library".to_string()),
        );
        let playlists_dir = env::var("PLAYLISTS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| library_root.join("playlists"));

        let provider: ProviderKind = parse_env("PROVIDER", ProviderKind::Tidal)?;

        let config = Self {
            server_host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            server_port: parse_env("SERVER_PORT", 4747u16)?,
            library_root,
            playlists_dir,
            storage_mode: parse_env("STORAGE_MODE", StorageMode::Permanent)?,
            cache_ttl_hours: parse_env("CACHE_TTL_HOURS", 720u64)?,
            provider,
            preferred_quality: parse_env("PREFERRED_QUALITY", crate::models::Quality::Lossless)?,
            explicit_filter: parse_env("EXPLICIT_FILTER", ExplicitFilter::All)?,
            download_mode: parse_env("DOWNLOAD_MODE", DownloadMode::Track)?,
            external_playlists_enabled: parse_env("EXTERNAL_PLAYLISTS_ENABLED", true)?,
            backend_url: env::var("BACKEND_URL").ok(),
            backend_kind: parse_env("BACKEND_KIND", BackendKind::Jellyfin)?,
            deezer_arl: env::var("DEEZER_ARL").ok(),
            deezer_arl_fallback: env::var("DEEZER_ARL_FALLBACK").ok(),
            qobuz_app_id: env::var("QOBUZ_APP_ID").ok(),
            qobuz_secret: env::var("QOBUZ_SECRET").ok(),
            qobuz_bundle_url: env::var("QOBUZ_BUNDLE_URL").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.provider == ProviderKind::Deezer && self.deezer_arl.is_none() {
            return Err(anyhow!("PROVIDER=deezer requires DEEZER_ARL"));
        }
        if self.cache_ttl_hours == 0 && self.storage_mode == StorageMode::Cache {
            return Err(anyhow!("STORAGE_MODE=cache requires CACHE_TTL_HOURS >= 1"));
        }
        if let Some(backend_url) = &self.backend_url {
            url::Url::parse(backend_url)
                .map_err(|e| anyhow!("invalid BACKEND_URL '{}': {}", backend_url, e))?;
        }
        Ok(())
    }

    pub fn provider_name(&self) -> &'static str {
        match self.provider {
            ProviderKind::Tidal => "tidal",
            ProviderKind::Deezer => "deezer",
            ProviderKind::Qobuz => "qobuz",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!("TIDAL".parse::<ProviderKind>().unwrap(), ProviderKind::Tidal);
        assert_eq!("Deezer".parse::<ProviderKind>().unwrap(), ProviderKind::Deezer);
        assert!("napster".parse::<ProviderKind>().is_err());
    }

    #[test]
    fn storage_mode_rejects_unknown_values() {
        assert_eq!("cache".parse::<StorageMode>().unwrap(), StorageMode::Cache);
        assert!("ephemeral".parse::<StorageMode>().is_err());
    }
}
