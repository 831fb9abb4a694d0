//! Embedded tag writing for finished downloads.
//!
//! Tags are applied to a scratch copy which replaces the original only after
//! a fully successful write, so a failure can never truncate or corrupt the
//! audio bytes.

use std::fs;
use std::path::{Path, PathBuf};

use lofty::picture::{MimeType, Picture, PictureType};
use lofty::prelude::*;
use lofty::tag::{Tag, TagExt};
use tracing::warn;

use crate::errors::Result;
use crate::models::Song;

pub struct MetadataTagger {
    client: reqwest::Client,
}

impl Default for MetadataTagger {
    fn default() -> Self {
        Self::new()
    }
}

impl MetadataTagger {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Fetch cover art and write the standard tag set. Failures are reported
    /// but the audio file is left exactly as it was.
    pub async fn tag_file(&self, path: &Path, song: &Song) -> Result<()> {
        let cover = self.fetch_cover(song).await;
        let scratch = scratch_path(path);

        fs::copy(path, &scratch)?;
        match apply_tags(&scratch, song, cover) {
            Ok(()) => {
                fs::rename(&scratch, path)?;
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&scratch);
                Err(e)
            }
        }
    }

    async fn fetch_cover(&self, song: &Song) -> Option<(Vec<u8>, MimeType)> {
        let url = song
            .cover_art_url_large
            .as_deref()
            .or(song.cover_art_url.as_deref())?;

        match self.client.get(url).send().await {
            Ok(resp) => match resp.bytes().await {
                Ok(bytes) => {
                    let mime = if url.to_lowercase().ends_with(".png") {
                        MimeType::Png
                    } else {
                        MimeType::Jpeg
                    };
                    Some((bytes.to_vec(), mime))
                }
                Err(e) => {
                    warn!("failed to read cover art body: {}", e);
                    None
                }
            },
            Err(e) => {
                warn!("failed to fetch cover art from {}: {}", url, e);
                None
            }
        }
    }
}

fn scratch_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tagtmp");
    PathBuf::from(os)
}

fn apply_tags(path: &Path, song: &Song, cover: Option<(Vec<u8>, MimeType)>) -> Result<()> {
    let mut tagged_file = lofty::probe::Probe::open(path)
        .map_err(|e| crate::errors::CadenzaError::Internal(e.to_string()))?
        .read()
        .map_err(|e| crate::errors::CadenzaError::Internal(e.to_string()))?;

    let tag_type = tagged_file.primary_tag_type();
    let mut tag = match tagged_file.primary_tag_mut() {
        Some(t) => t.clone(),
        None => Tag::new(tag_type),
    };

    tag.set_title(song.title.clone());
    tag.set_artist(song.artist.clone());
    tag.set_album(song.album.clone());
    tag.insert_text(ItemKey::AlbumArtist, song.album_artist.clone());

    if let Some(track) = song.track_number {
        tag.set_track(track);
    }
    tag.set_disk(song.disc_number);
    if let Some(year) = song.year {
        if year > 0 {
            tag.set_year(year as u32);
        }
    }
    if let Some(genre) = &song.genre {
        tag.set_genre(genre.clone());
    }
    if let Some(bpm) = song.bpm {
        tag.insert_text(ItemKey::Bpm, bpm.to_string());
    }
    if let Some(isrc) = &song.isrc {
        tag.insert_text(ItemKey::Isrc, isrc.clone());
    }

    if let Some((data, mime)) = cover {
        tag.remove_picture_type(PictureType::CoverFront);
        tag.push_picture(Picture::new_unchecked(
            PictureType::CoverFront,
            Some(mime),
            None,
            data,
        ));
    }

    tag.save_to_path(path, lofty::config::WriteOptions::default())
        .map_err(|e| crate::errors::CadenzaError::Internal(e.to_string()))?;
    Ok(())
}
