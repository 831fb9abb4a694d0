//! Library tree layout: `root/Artist/Album/NN - Title.ext`.

use std::path::{Path, PathBuf};

const MAX_SEGMENT_LEN: usize = 100;

/// Replace filesystem-hostile characters, trim, and cap segment length so a
/// provider title can never escape or break the library tree.
pub fn sanitize_segment(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let trimmed = cleaned.trim();
    let mut out: String = trimmed.chars().take(MAX_SEGMENT_LEN).collect();
    // Re-trim in case truncation landed on trailing whitespace.
    while out.ends_with(char::is_whitespace) {
        out.pop();
    }
    if out.is_empty() {
        out.push('_');
    }
    out
}

/// Deterministic target path for a track, before collision resolution.
pub fn track_path(
    root: &Path,
    artist: &str,
    album: &str,
    title: &str,
    track_number: Option<u32>,
    extension: &str,
) -> PathBuf {
    let basename = match track_number {
        Some(n) => format!("{:02} - {}", n, sanitize_segment(title)),
        None => sanitize_segment(title),
    };
    root.join(sanitize_segment(artist))
        .join(sanitize_segment(album))
        .join(format!("{}.{}", basename, extension))
}

/// Append ` (n)` with the smallest n >= 1 that does not exist yet. The
/// unsuffixed path is returned untouched when it is free. `.part` siblings
/// count as occupied so two in-flight downloads never share a target.
pub fn resolve_collision(path: &Path) -> PathBuf {
    if !occupied(path) {
        return path.to_path_buf();
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{} ({}).{}", stem, n, ext));
        if !occupied(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn occupied(path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    partial_path(path).exists()
}

/// Sibling path the coordinator writes to while a download is in flight.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".part");
    PathBuf::from(os)
}

/// Map a media MIME type to the library file extension.
pub fn extension_for_mime(mime: &str) -> &'static str {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence {
        "audio/flac" | "audio/x-flac" => "flac",
        "audio/mpeg" | "audio/mp3" => "mp3",
        "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
        "audio/ogg" | "application/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
        "audio/aac" => "aac",
        _ => "mp3",
    }
}

pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "flac" => "audio/flac",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "aac" => "audio/aac",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn sanitize_replaces_reserved_characters() {
        assert_eq!(sanitize_segment("AC/DC: Back?"), "AC_DC_ Back_");
        assert_eq!(sanitize_segment("  trimmed  "), "trimmed");
        assert_eq!(sanitize_segment("tab\there"), "tab_here");
    }

    #[test]
    fn sanitize_caps_segment_length() {
        let long = "x".repeat(500);
        assert_eq!(sanitize_segment(&long).len(), 100);
    }

    #[test]
    fn track_path_is_deterministic() {
        let root = Path::new("/lib");
        let a = track_path(root, "Daft Punk", "Discovery", "One More Time", Some(1), "flac");
        let b = track_path(root, "Daft Punk", "Discovery", "One More Time", Some(1), "flac");
        assert_eq!(a, b);
        assert_eq!(a, PathBuf::from("/lib/Daft Punk/Discovery/01 - One More Time.flac"));
    }

    #[test]
    fn track_number_is_zero_padded_and_optional() {
        let root = Path::new("/lib");
        let with = track_path(root, "A", "B", "T", Some(7), "mp3");
        assert!(with.to_string_lossy().ends_with("07 - T.mp3"));
        let without = track_path(root, "A", "B", "T", None, "mp3");
        assert!(without.to_string_lossy().ends_with("/T.mp3"));
    }

    #[test]
    fn collision_suffix_only_when_target_exists() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("song.flac");

        assert_eq!(resolve_collision(&target), target);

        fs::write(&target, b"x").unwrap();
        assert_eq!(resolve_collision(&target), dir.path().join("song (1).flac"));

        fs::write(dir.path().join("song (1).flac"), b"x").unwrap();
        assert_eq!(resolve_collision(&target), dir.path().join("song (2).flac"));
    }

    #[test]
    fn partial_sibling_counts_as_occupied() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("song.flac");
        fs::write(partial_path(&target), b"x").unwrap();
        assert_eq!(resolve_collision(&target), dir.path().join("song (1).flac"));
    }

    #[test]
    fn mime_mapping_covers_library_formats() {
        assert_eq!(extension_for_mime("audio/flac"), "flac");
        assert_eq!(extension_for_mime("audio/mpeg; charset=binary"), "mp3");
        assert_eq!(extension_for_mime("audio/x-m4a"), "m4a");
        assert_eq!(extension_for_mime("video/weird"), "mp3");
    }
}
