//! Cache-mode expiry.
//!
//! When the library acts as a cache, a background task periodically drops
//! files that have not been played within the TTL and prunes their index
//! mappings. Cache hits refresh the last-access stamp, so anything a client
//! keeps playing stays on disk.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use crate::errors::Result;
use crate::services::library::LibraryIndex;

pub struct CacheSweeper {
    library: Arc<LibraryIndex>,
    ttl: chrono::Duration,
}

impl CacheSweeper {
    pub fn new(library: Arc<LibraryIndex>, ttl_hours: u64) -> Self {
        Self {
            library,
            ttl: chrono::Duration::hours(ttl_hours as i64),
        }
    }

    /// Sweep interval: often enough to stay close to the TTL, never more
    /// than hourly.
    fn interval(&self) -> Duration {
        let quarter_ttl = (self.ttl.num_seconds() / 4).max(60) as u64;
        Duration::from_secs(quarter_ttl.min(3600))
    }

    pub fn spawn(self: Arc<Self>) {
        tokio::spawn(async move {
            let interval = self.interval();
            info!(
                "cache sweeper running every {:?} with a {}h TTL",
                interval,
                self.ttl.num_hours()
            );
            loop {
                tokio::time::sleep(interval).await;
                match self.sweep().await {
                    Ok(0) => {}
                    Ok(n) => info!("cache sweep removed {} expired tracks", n),
                    Err(e) => warn!("cache sweep failed: {}", e),
                }
            }
        });
    }

    pub async fn sweep(&self) -> Result<usize> {
        self.sweep_older_than(Utc::now() - self.ttl).await
    }

    /// Remove every track whose last access predates `cutoff`.
    pub async fn sweep_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut removed = 0usize;
        for (key, mapping) in self.library.all().await? {
            if mapping.last_accessed >= cutoff {
                continue;
            }
            let Some((provider, external_id)) = key.split_once(':') else {
                continue;
            };

            if let Err(e) = fs::remove_file(&mapping.local_path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("could not remove {}: {}", mapping.local_path.display(), e);
                    continue;
                }
            }
            self.library.forget(provider, external_id).await?;
            removed += 1;

            // Drop now-empty album/artist directories behind the file.
            if let Some(album_dir) = mapping.local_path.parent() {
                if fs::remove_dir(album_dir).await.is_ok() {
                    if let Some(artist_dir) = album_dir.parent() {
                        let _ = fs::remove_dir(artist_dir).await;
                    }
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Song;

    fn external_song(id: &str) -> Song {
        let mut song = Song::external("tidal", id);
        song.title = format!("Track {}", id);
        song.artist = "Artist".to_string();
        song.album = "Album".to_string();
        song
    }

    #[tokio::test]
    async fn expired_tracks_are_removed_and_forgotten() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(LibraryIndex::new(dir.path().to_path_buf()));

        let track = dir.path().join("Artist").join("Album").join("01 - Track 1.mp3");
        fs::create_dir_all(track.parent().unwrap()).await.unwrap();
        fs::write(&track, b"audio").await.unwrap();
        library.register(&external_song("1"), &track).await.unwrap();

        let sweeper = CacheSweeper::new(library.clone(), 1);

        // Nothing is older than a cutoff in the past.
        let removed = sweeper
            .sweep_older_than(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(removed, 0);
        assert!(track.exists());

        // Everything is older than a cutoff in the future.
        let removed = sweeper
            .sweep_older_than(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!track.exists());
        assert_eq!(library.lookup("tidal", "1").await.unwrap(), None);
        // Empty album and artist directories are cleaned up too.
        assert!(!dir.path().join("Artist").exists());
    }

    #[tokio::test]
    async fn refetch_after_sweep_registers_again() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(LibraryIndex::new(dir.path().to_path_buf()));
        let track = dir.path().join("t.mp3");
        fs::write(&track, b"x").await.unwrap();
        library.register(&external_song("9"), &track).await.unwrap();

        let sweeper = CacheSweeper::new(library.clone(), 1);
        sweeper
            .sweep_older_than(Utc::now() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert_eq!(library.lookup("tidal", "9").await.unwrap(), None);

        // A fresh registration behaves like a first download.
        fs::write(&track, b"x").await.unwrap();
        library.register(&external_song("9"), &track).await.unwrap();
        assert!(library.lookup("tidal", "9").await.unwrap().is_some());
    }

    #[test]
    fn interval_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let library = Arc::new(LibraryIndex::new(dir.path().to_path_buf()));
        assert_eq!(
            CacheSweeper::new(library.clone(), 1).interval(),
            Duration::from_secs(900)
        );
        assert_eq!(
            CacheSweeper::new(library, 1000).interval(),
            Duration::from_secs(3600)
        );
    }
}
