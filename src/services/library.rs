//! Persistent map from `(provider, external_id)` to the local library file.
//!
//! The whole index lives in one JSON document (`.mappings.json`) under the
//! library root. Every mutation rewrites the document through a temp file
//! and an atomic rename so a crash can never leave a half-written index.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::models::Song;

pub const MAPPINGS_FILE: &str = ".mappings.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryMapping {
    pub local_path: PathBuf,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub downloaded_at: DateTime<Utc>,
    /// Refreshed on every cache hit; drives cache-mode expiry.
    pub last_accessed: DateTime<Utc>,
}

pub struct LibraryIndex {
    root: PathBuf,
    // None until the first operation loads the document.
    mappings: Mutex<Option<HashMap<String, LibraryMapping>>>,
}

fn mapping_key(provider: &str, external_id: &str) -> String {
    format!("{}:{}", provider, external_id)
}

impl LibraryIndex {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            mappings: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn mappings_path(&self) -> PathBuf {
        self.root.join(MAPPINGS_FILE)
    }

    async fn load_if_needed(
        &self,
        guard: &mut Option<HashMap<String, LibraryMapping>>,
    ) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        let path = self.mappings_path();
        let loaded = match fs::read_to_string(&path).await {
            Ok(raw) => match serde_json::from_str::<HashMap<String, LibraryMapping>>(&raw) {
                Ok(map) => map,
                Err(e) => {
                    warn!("mappings file at {} is unreadable ({}), starting empty", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        *guard = Some(loaded);
        Ok(())
    }

    async fn persist(&self, mappings: &HashMap<String, LibraryMapping>) -> Result<()> {
        fs::create_dir_all(&self.root).await?;
        let path = self.mappings_path();
        let tmp = self.root.join(format!("{}.tmp", MAPPINGS_FILE));
        let body = serde_json::to_string_pretty(mappings)?;
        fs::write(&tmp, body).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Returns the mapped path only when the file still exists on disk.
    /// A mapping whose file vanished behaves as absent and is pruned.
    pub async fn lookup(&self, provider: &str, external_id: &str) -> Result<Option<PathBuf>> {
        let key = mapping_key(provider, external_id);
        let mut guard = self.mappings.lock().await;
        self.load_if_needed(&mut guard).await?;
        let map = guard.as_mut().expect("loaded above");

        let Some(mapping) = map.get(&key) else {
            return Ok(None);
        };
        let path = mapping.local_path.clone();
        if fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Some(path));
        }

        debug!("pruning stale mapping {} -> {}", key, path.display());
        map.remove(&key);
        let snapshot = map.clone();
        // Persisted under the lock so concurrent mutations can never write
        // the document out of order.
        self.persist(&snapshot).await?;
        Ok(None)
    }

    /// Idempotent upsert keyed by `(provider, external_id)`. A song without
    /// both halves of the fingerprint is a no-op.
    pub async fn register(&self, song: &Song, local_path: &Path) -> Result<()> {
        let (Some(provider), Some(external_id)) =
            (song.external_provider.as_deref(), song.external_id.as_deref())
        else {
            return Ok(());
        };
        let key = mapping_key(provider, external_id);
        let now = Utc::now();

        let mut guard = self.mappings.lock().await;
        self.load_if_needed(&mut guard).await?;
        let map = guard.as_mut().expect("loaded above");
        map.insert(
            key,
            LibraryMapping {
                local_path: local_path.to_path_buf(),
                title: song.title.clone(),
                artist: song.artist.clone(),
                album: song.album.clone(),
                downloaded_at: now,
                last_accessed: now,
            },
        );
        let snapshot = map.clone();
        self.persist(&snapshot).await
    }

    /// Best-effort removal, used by the cache sweeper.
    pub async fn forget(&self, provider: &str, external_id: &str) -> Result<()> {
        let key = mapping_key(provider, external_id);
        let mut guard = self.mappings.lock().await;
        self.load_if_needed(&mut guard).await?;
        let map = guard.as_mut().expect("loaded above");
        if map.remove(&key).is_none() {
            return Ok(());
        }
        let snapshot = map.clone();
        self.persist(&snapshot).await
    }

    /// Refresh the last-access stamp after a cache hit.
    pub async fn touch(&self, provider: &str, external_id: &str) -> Result<()> {
        let key = mapping_key(provider, external_id);
        let mut guard = self.mappings.lock().await;
        self.load_if_needed(&mut guard).await?;
        let map = guard.as_mut().expect("loaded above");
        let Some(mapping) = map.get_mut(&key) else {
            return Ok(());
        };
        mapping.last_accessed = Utc::now();
        let snapshot = map.clone();
        self.persist(&snapshot).await
    }

    /// Snapshot of every mapping, for the sweeper.
    pub async fn all(&self) -> Result<Vec<(String, LibraryMapping)>> {
        let mut guard = self.mappings.lock().await;
        self.load_if_needed(&mut guard).await?;
        let map = guard.as_ref().expect("loaded above");
        Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn external_song(provider: &str, id: &str, title: &str) -> Song {
        let mut song = Song::external(provider, id);
        song.title = title.to_string();
        song.artist = "Artist".to_string();
        song.album = "Album".to_string();
        song
    }

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let index = LibraryIndex::new(dir.path().to_path_buf());

        let file = dir.path().join("track.flac");
        fs::write(&file, b"audio").await.unwrap();

        let song = external_song("tidal", "42", "Track");
        index.register(&song, &file).await.unwrap();

        assert_eq!(index.lookup("tidal", "42").await.unwrap(), Some(file));
        assert_eq!(index.lookup("tidal", "43").await.unwrap(), None);
    }

    #[tokio::test]
    async fn mappings_survive_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("track.mp3");
        fs::write(&file, b"audio").await.unwrap();

        {
            let index = LibraryIndex::new(dir.path().to_path_buf());
            let song = external_song("deezer", "7", "Seven");
            index.register(&song, &file).await.unwrap();
        }

        // Fresh instance re-reads the JSON document lazily.
        let index = LibraryIndex::new(dir.path().to_path_buf());
        assert_eq!(index.lookup("deezer", "7").await.unwrap(), Some(file));

        let raw = fs::read_to_string(dir.path().join(MAPPINGS_FILE)).await.unwrap();
        assert!(raw.contains("deezer:7"));
    }

    #[tokio::test]
    async fn stale_mapping_reads_as_absent_and_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let index = LibraryIndex::new(dir.path().to_path_buf());

        let file = dir.path().join("gone.flac");
        fs::write(&file, b"audio").await.unwrap();
        index
            .register(&external_song("tidal", "9", "Gone"), &file)
            .await
            .unwrap();

        fs::remove_file(&file).await.unwrap();
        assert_eq!(index.lookup("tidal", "9").await.unwrap(), None);
        // Pruned from the persisted document as well.
        let raw = fs::read_to_string(dir.path().join(MAPPINGS_FILE)).await.unwrap();
        assert!(!raw.contains("tidal:9"));
    }

    #[tokio::test]
    async fn register_without_fingerprint_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let index = LibraryIndex::new(dir.path().to_path_buf());

        let song = Song::default();
        index.register(&song, Path::new("/nowhere")).await.unwrap();
        assert!(index.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn forget_removes_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let index = LibraryIndex::new(dir.path().to_path_buf());
        let file = dir.path().join("t.ogg");
        fs::write(&file, b"x").await.unwrap();

        index
            .register(&external_song("qobuz", "abc", "T"), &file)
            .await
            .unwrap();
        index.forget("qobuz", "abc").await.unwrap();
        assert_eq!(index.lookup("qobuz", "abc").await.unwrap(), None);
    }
}
