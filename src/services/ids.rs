//! Typed external identifiers.
//!
//! External catalog entries are addressed as `ext-{provider}-{kind}-{id}`.
//! The legacy two-segment form `ext-{provider}-{id}` is still accepted and
//! reads as a song id.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Song,
    Album,
    Artist,
    Playlist,
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdKind::Song => write!(f, "song"),
            IdKind::Album => write!(f, "album"),
            IdKind::Artist => write!(f, "artist"),
            IdKind::Playlist => write!(f, "playlist"),
        }
    }
}

impl FromStr for IdKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "song" => Ok(IdKind::Song),
            "album" => Ok(IdKind::Album),
            "artist" => Ok(IdKind::Artist),
            "playlist" => Ok(IdKind::Playlist),
            _ => Err(()),
        }
    }
}

/// Decoded form of an incoming identifier. `Local` preserves the original
/// string untouched so it can be forwarded to the backend verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedId {
    Local(String),
    External {
        provider: String,
        kind: IdKind,
        external_id: String,
    },
}

impl DecodedId {
    pub fn is_external(&self) -> bool {
        matches!(self, DecodedId::External { .. })
    }
}

pub fn encode(provider: &str, kind: IdKind, external_id: &str) -> String {
    format!("ext-{}-{}-{}", provider, kind, external_id)
}

/// Total decode: anything that does not match the external schema comes back
/// as `Local` with the input preserved.
pub fn decode(id: &str) -> DecodedId {
    let Some(rest) = id.strip_prefix("ext-") else {
        return DecodedId::Local(id.to_string());
    };

    // provider is the first segment; it must be non-empty lowercase
    // alphanumeric for the id to count as external at all.
    let Some((provider, tail)) = rest.split_once('-') else {
        return DecodedId::Local(id.to_string());
    };
    if provider.is_empty()
        || !provider
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
    {
        return DecodedId::Local(id.to_string());
    }

    match tail.split_once('-') {
        Some((kind_str, external_id)) => match kind_str.parse::<IdKind>() {
            Ok(kind) if !external_id.is_empty() => DecodedId::External {
                provider: provider.to_string(),
                kind,
                external_id: external_id.to_string(),
            },
            // `ext-prov-foo-bar` with an unknown kind segment is the legacy
            // form: everything after the provider is the song id.
            _ => DecodedId::External {
                provider: provider.to_string(),
                kind: IdKind::Song,
                external_id: tail.to_string(),
            },
        },
        None if !tail.is_empty() => DecodedId::External {
            provider: provider.to_string(),
            kind: IdKind::Song,
            external_id: tail.to_string(),
        },
        None => DecodedId::Local(id.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_all_kinds() {
        for kind in [IdKind::Song, IdKind::Album, IdKind::Artist, IdKind::Playlist] {
            let encoded = encode("deezer", kind, "987abc");
            match decode(&encoded) {
                DecodedId::External {
                    provider,
                    kind: k,
                    external_id,
                } => {
                    assert_eq!(provider, "deezer");
                    assert_eq!(k, kind);
                    assert_eq!(external_id, "987abc");
                }
                other => panic!("expected external, got {:?}", other),
            }
        }
    }

    #[test]
    fn legacy_two_segment_form_reads_as_song() {
        assert_eq!(
            decode("ext-tidal-12345"),
            DecodedId::External {
                provider: "tidal".to_string(),
                kind: IdKind::Song,
                external_id: "12345".to_string(),
            }
        );
    }

    #[test]
    fn unknown_kind_folds_into_legacy_song_id() {
        // The external id itself may contain hyphens.
        assert_eq!(
            decode("ext-qobuz-abc-def"),
            DecodedId::External {
                provider: "qobuz".to_string(),
                kind: IdKind::Song,
                external_id: "abc-def".to_string(),
            }
        );
    }

    #[test]
    fn external_id_with_hyphens_survives() {
        match decode("ext-tidal-song-a-b-c") {
            DecodedId::External { external_id, kind, .. } => {
                assert_eq!(kind, IdKind::Song);
                assert_eq!(external_id, "a-b-c");
            }
            other => panic!("expected external, got {:?}", other),
        }
    }

    #[test]
    fn non_matching_inputs_stay_local() {
        for id in ["", "12345", "local-song-1", "ext-", "ext--song-1", "ext-Tidal-song-1", "extra-tidal-song-1"] {
            assert_eq!(decode(id), DecodedId::Local(id.to_string()), "input: {:?}", id);
        }
    }
}
