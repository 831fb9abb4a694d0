//! M3U playlist files for favorited external playlists.
//!
//! Playlists live under their own directory and reference tracks by path
//! relative to the library root. Files are created with the `#EXTM3U`
//! header atomically; entries are appended as tracks land, one at a time,
//! under a writer mutex.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::errors::Result;
use crate::models::Song;
use crate::services::paths::sanitize_segment;

pub struct PlaylistWriter {
    dir: PathBuf,
    library_root: PathBuf,
    write_lock: Mutex<()>,
}

impl PlaylistWriter {
    pub fn new(dir: PathBuf, library_root: PathBuf) -> Self {
        Self {
            dir,
            library_root,
            write_lock: Mutex::new(()),
        }
    }

    fn playlist_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.m3u", sanitize_segment(name)))
    }

    /// Append one track entry, creating the playlist file on first touch.
    /// A track already present in the file is not appended twice.
    pub async fn append(&self, name: &str, song: &Song, local_path: &Path) -> Result<()> {
        let _guard = self.write_lock.lock().await;

        let path = self.playlist_path(name);
        if !fs::try_exists(&path).await.unwrap_or(false) {
            fs::create_dir_all(&self.dir).await?;
            let tmp = path.with_extension("m3u.tmp");
            fs::write(&tmp, "#EXTM3U\n").await?;
            fs::rename(&tmp, &path).await?;
        }

        let relative = local_path
            .strip_prefix(&self.library_root)
            .unwrap_or(local_path);
        let relative = relative.to_string_lossy();

        let existing = fs::read_to_string(&path).await?;
        if existing.lines().any(|line| line == relative) {
            return Ok(());
        }

        let entry = format!(
            "#EXTINF:{},{} - {}\n{}\n",
            song.duration_seconds.unwrap_or(0),
            song.artist,
            song.title,
            relative
        );
        let mut file = fs::OpenOptions::new().append(true).open(&path).await?;
        file.write_all(entry.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
