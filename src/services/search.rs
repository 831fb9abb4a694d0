//! Merged catalog search.
//!
//! Local backend and provider searches run concurrently; results are scored
//! against the cleaned query, sorted per category, and artists that exist on
//! both sides are folded into the local entry. Songs and albums are never
//! folded since the same release legitimately lives in both catalogs.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::warn;

use crate::config::ExplicitFilter;
use crate::errors::{CadenzaError, Result};
use crate::models::{ExplicitNote, SearchResults, Song};
use crate::services::backend::{ClientAuth, MediaBackend};
use crate::services::matching;
use crate::services::providers::MusicProvider;

#[derive(Debug, Clone, Copy)]
pub struct SearchLimits {
    pub songs: usize,
    pub albums: usize,
    pub artists: usize,
    pub playlists: usize,
    pub offset: usize,
}

impl Default for SearchLimits {
    fn default() -> Self {
        Self {
            songs: 20,
            albums: 20,
            artists: 20,
            playlists: 20,
            offset: 0,
        }
    }
}

pub struct SearchService {
    provider: Arc<dyn MusicProvider>,
    backend: Option<Arc<MediaBackend>>,
    explicit_filter: ExplicitFilter,
}

impl SearchService {
    pub fn new(
        provider: Arc<dyn MusicProvider>,
        backend: Option<Arc<MediaBackend>>,
        explicit_filter: ExplicitFilter,
    ) -> Self {
        Self {
            provider,
            backend,
            explicit_filter,
        }
    }

    pub async fn search(
        &self,
        query: &str,
        limits: SearchLimits,
        auth: &ClientAuth,
    ) -> Result<SearchResults> {
        let cleaned = matching::clean_query(query);
        if cleaned.is_empty() {
            return Ok(SearchResults::default());
        }

        let request_limit = limits
            .songs
            .max(limits.albums)
            .max(limits.artists)
            .max(limits.playlists)
            + limits.offset;
        let request_limit = request_limit.min(100) as u32;

        let local_fut = async {
            match &self.backend {
                Some(backend) => backend.search(cleaned, request_limit, auth).await,
                None => Ok(SearchResults::default()),
            }
        };
        let external_fut = self.provider.search_all(cleaned, request_limit);

        let (local, external) = tokio::join!(local_fut, external_fut);
        let local = match local {
            Ok(results) => results,
            // A client credential the backend rejects must surface as-is,
            // never as a silently provider-only result set.
            Err(CadenzaError::Unauthorized(status)) => {
                return Err(CadenzaError::Unauthorized(status))
            }
            Err(e) => {
                warn!("backend search failed, continuing with provider only: {}", e);
                SearchResults::default()
            }
        };

        Ok(merge_results(
            cleaned,
            local,
            external,
            self.explicit_filter,
            limits,
        ))
    }
}

pub fn passes_explicit_filter(song: &Song, filter: ExplicitFilter) -> bool {
    match filter {
        ExplicitFilter::All => true,
        ExplicitFilter::ExplicitOnly => {
            matches!(song.explicit, ExplicitNote::Explicit | ExplicitNote::Unknown)
        }
        ExplicitFilter::CleanOnly => !matches!(song.explicit, ExplicitNote::Explicit),
    }
}

/// Deterministic merge of the two result sets: score, stable sort, dedup
/// artists (local wins), filter, paginate.
pub fn merge_results(
    query: &str,
    local: SearchResults,
    external: SearchResults,
    explicit_filter: ExplicitFilter,
    limits: SearchLimits,
) -> SearchResults {
    let mut songs: Vec<Song> = local
        .songs
        .into_iter()
        .chain(external.songs)
        .filter(|song| passes_explicit_filter(song, explicit_filter))
        .collect();
    let mut albums = local
        .albums
        .into_iter()
        .chain(external.albums)
        .collect::<Vec<_>>();

    // Local artists first so the dedup pass below keeps them over the
    // provider's copy of the same name.
    let mut artists = local
        .artists
        .into_iter()
        .chain(external.artists)
        .collect::<Vec<_>>();
    let mut playlists = external.playlists;

    // Sort key: score first, then an exact-title bit so a perfect match can
    // never tie with a merely substring-matched record. The sort is stable,
    // so remaining ties keep their original position.
    let sort_key = |score: u32, exact: bool| std::cmp::Reverse((score, exact as u8));

    songs.sort_by_key(|song| {
        sort_key(
            matching::rank(
                query,
                &song.title,
                &[&song.title, &song.artist, &song.album],
                !song.is_local,
            ),
            song.title.eq_ignore_ascii_case(query),
        )
    });
    albums.sort_by_key(|album| {
        sort_key(
            matching::rank(
                query,
                &album.title,
                &[&album.title, &album.artist],
                !album.is_local,
            ),
            album.title.eq_ignore_ascii_case(query),
        )
    });
    artists.sort_by_key(|artist| {
        sort_key(
            matching::rank(query, &artist.name, &[&artist.name], !artist.is_local),
            artist.name.eq_ignore_ascii_case(query),
        )
    });
    playlists.sort_by_key(|playlist| {
        sort_key(
            matching::rank(query, &playlist.name, &[&playlist.name], true),
            playlist.name.eq_ignore_ascii_case(query),
        )
    });

    // Case-insensitive artist dedup. The sort above is stable and local
    // entries outrank external ones only via the order they were chained
    // in, so prefer-local needs an explicit pass.
    let mut seen: HashSet<String> = HashSet::new();
    let mut deduped = Vec::with_capacity(artists.len());
    for artist in artists.iter().filter(|a| a.is_local) {
        seen.insert(artist.name.to_lowercase());
    }
    let mut external_seen: HashSet<String> = HashSet::new();
    for artist in artists {
        let key = artist.name.to_lowercase();
        if artist.is_local {
            deduped.push(artist);
        } else if !seen.contains(&key) && external_seen.insert(key) {
            deduped.push(artist);
        }
    }

    SearchResults {
        songs: paginate(songs, limits.offset, limits.songs),
        albums: paginate(albums, limits.offset, limits.albums),
        artists: paginate(deduped, limits.offset, limits.artists),
        playlists: paginate(playlists, limits.offset, limits.playlists),
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Album, Artist};

    fn local_song(title: &str) -> Song {
        Song {
            id: format!("local-{}", title),
            title: title.to_string(),
            artist: "Artist".to_string(),
            album_artist: "Artist".to_string(),
            album: "Album".to_string(),
            is_local: true,
            ..Default::default()
        }
    }

    fn external_song(title: &str) -> Song {
        let mut song = Song::external("tidal", title);
        song.title = title.to_string();
        song.artist = "Artist".to_string();
        song.album = "Album".to_string();
        song
    }

    fn artist(name: &str, local: bool) -> Artist {
        Artist {
            id: if local {
                format!("local-{}", name)
            } else {
                format!("ext-tidal-artist-{}", name)
            },
            name: name.to_string(),
            is_local: local,
            ..Default::default()
        }
    }

    #[test]
    fn exact_title_outranks_substring_title() {
        let local = SearchResults {
            songs: vec![local_song("One More Time (Live at Budokan)")],
            ..Default::default()
        };
        let external = SearchResults {
            songs: vec![external_song("One More Time")],
            ..Default::default()
        };

        let merged = merge_results(
            "One More Time",
            local,
            external,
            ExplicitFilter::All,
            SearchLimits::default(),
        );
        assert_eq!(merged.songs[0].title, "One More Time");
    }

    #[test]
    fn artists_dedup_prefers_the_local_entry() {
        let local = SearchResults {
            artists: vec![artist("Daft Punk", true)],
            ..Default::default()
        };
        let external = SearchResults {
            artists: vec![artist("daft punk", false), artist("Justice", false)],
            ..Default::default()
        };

        let merged = merge_results(
            "daft",
            local,
            external,
            ExplicitFilter::All,
            SearchLimits::default(),
        );
        let daft: Vec<_> = merged
            .artists
            .iter()
            .filter(|a| a.name.eq_ignore_ascii_case("daft punk"))
            .collect();
        assert_eq!(daft.len(), 1);
        assert!(daft[0].is_local);
        assert!(merged.artists.iter().any(|a| a.name == "Justice"));
    }

    #[test]
    fn songs_are_never_folded_across_catalogs() {
        let local = SearchResults {
            songs: vec![local_song("Around the World")],
            ..Default::default()
        };
        let external = SearchResults {
            songs: vec![external_song("Around the World")],
            ..Default::default()
        };

        let merged = merge_results(
            "around",
            local,
            external,
            ExplicitFilter::All,
            SearchLimits::default(),
        );
        assert_eq!(merged.songs.len(), 2);
    }

    #[test]
    fn clean_only_filter_drops_explicit_songs() {
        let mut explicit = external_song("NSFW");
        explicit.explicit = ExplicitNote::Explicit;
        let mut clean = external_song("SFW");
        clean.explicit = ExplicitNote::Clean;

        let merged = merge_results(
            "sfw",
            SearchResults::default(),
            SearchResults {
                songs: vec![explicit, clean],
                ..Default::default()
            },
            ExplicitFilter::CleanOnly,
            SearchLimits::default(),
        );
        assert_eq!(merged.songs.len(), 1);
        assert_eq!(merged.songs[0].title, "SFW");
    }

    #[test]
    fn limits_and_offset_paginate_each_category() {
        let external = SearchResults {
            songs: (0..10).map(|i| external_song(&format!("song {}", i))).collect(),
            ..Default::default()
        };
        let limits = SearchLimits {
            songs: 3,
            offset: 2,
            ..Default::default()
        };
        let merged = merge_results(
            "song",
            SearchResults::default(),
            external,
            ExplicitFilter::All,
            limits,
        );
        assert_eq!(merged.songs.len(), 3);
    }

    #[test]
    fn albums_with_same_title_survive_in_both_catalogs() {
        let local = SearchResults {
            albums: vec![Album {
                id: "local-1".to_string(),
                title: "Discovery".to_string(),
                artist: "Daft Punk".to_string(),
                is_local: true,
                ..Default::default()
            }],
            ..Default::default()
        };
        let external = SearchResults {
            albums: vec![Album {
                id: "ext-tidal-album-1".to_string(),
                title: "Discovery".to_string(),
                artist: "Daft Punk".to_string(),
                is_local: false,
                external_provider: Some("tidal".to_string()),
                external_id: Some("1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let merged = merge_results(
            "discovery",
            local,
            external,
            ExplicitFilter::All,
            SearchLimits::default(),
        );
        assert_eq!(merged.albums.len(), 2);
    }
}
