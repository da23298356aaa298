//! Path utilities for classifying artifact files by name.
//!
//! Artifacts follow `{index:03}_{sanitized title}.{ext}`. Sentinel markers,
//! error markers and in-progress staging files share directories with real
//! artifacts and must never be counted as one.

use crate::types::ArtifactKind;
use std::path::Path;

/// Subtitle extensions produced by the platform downloader.
const SUBTITLE_EXTENSIONS: &[&str] = &["json3", "vtt"];

/// Speech-to-text output extensions.
const TRANSCRIPT_EXTENSIONS: &[&str] = &["srt"];

/// Intermediate audio extensions.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "opus", "webm"];

/// Suffix (including extension) of extracted-content artifacts.
pub const EXTRACTED_SUFFIX: &str = "_extracted.json";

/// Extension appended to a target path while a collaborator is writing it.
pub const STAGING_EXTENSION: &str = "partial";

/// Prefix of the marker recording that no subtitles exist for an item.
pub const NO_SUBS_PREFIX: &str = "NO_SUBS_";

/// Prefix of the marker recording a confirmed absence of content.
pub const NO_CONTENT_PREFIX: &str = "NO_CONTENT_";

/// Prefix of legacy error markers left by earlier tooling.
pub const ERROR_PREFIX: &str = "ERROR";

/// Maximum length of the sanitized title part of a file name.
const MAX_TITLE_LEN: usize = 80;

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

/// Check if a path is a sentinel or error marker rather than an artifact.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use transcriptforge_common::paths::is_marker_file;
///
/// assert!(is_marker_file(Path::new("NO_SUBS_004_abc123.txt")));
/// assert!(is_marker_file(Path::new("ERROR_004.json3")));
/// assert!(!is_marker_file(Path::new("004_Lesson.json3")));
/// ```
pub fn is_marker_file(path: &Path) -> bool {
    let name = file_name(path);
    name.starts_with(NO_SUBS_PREFIX)
        || name.starts_with(NO_CONTENT_PREFIX)
        || name.starts_with(ERROR_PREFIX)
}

/// Check if a path is an in-progress staging file.
pub fn is_staging_file(path: &Path) -> bool {
    has_extension(path, &[STAGING_EXTENSION])
}

/// Check if a path has a subtitle file extension.
pub fn is_subtitle_file(path: &Path) -> bool {
    has_extension(path, SUBTITLE_EXTENSIONS)
}

/// Check if a path has a speech-to-text transcript extension.
pub fn is_transcript_file(path: &Path) -> bool {
    has_extension(path, TRANSCRIPT_EXTENSIONS)
}

/// Check if a path has an audio file extension.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use transcriptforge_common::paths::is_audio_file;
///
/// assert!(is_audio_file(Path::new("012_Tefila.mp3")));
/// assert!(is_audio_file(Path::new("012_Tefila.M4A")));
/// assert!(!is_audio_file(Path::new("012_Tefila.srt")));
/// ```
pub fn is_audio_file(path: &Path) -> bool {
    has_extension(path, AUDIO_EXTENSIONS)
}

/// Check if a path is an extracted-content artifact.
pub fn is_extracted_file(path: &Path) -> bool {
    file_name(path).ends_with(EXTRACTED_SUFFIX)
}

/// Check whether `path` is a countable artifact of `kind`.
///
/// Markers and staging files never match.
pub fn matches_kind(path: &Path, kind: ArtifactKind) -> bool {
    if is_marker_file(path) || is_staging_file(path) {
        return false;
    }
    match kind {
        ArtifactKind::Subtitle => is_subtitle_file(path) && !is_extracted_file(path),
        ArtifactKind::Transcript => is_transcript_file(path),
        ArtifactKind::Audio => is_audio_file(path),
        ArtifactKind::Extracted => is_extracted_file(path),
    }
}

/// Default extension used when writing a new artifact of `kind`.
pub fn default_extension(kind: ArtifactKind) -> &'static str {
    match kind {
        ArtifactKind::Subtitle => SUBTITLE_EXTENSIONS[0],
        ArtifactKind::Transcript => TRANSCRIPT_EXTENSIONS[0],
        ArtifactKind::Audio => AUDIO_EXTENSIONS[0],
        ArtifactKind::Extracted => "json",
    }
}

/// Parse the leading index of a `{index}_{title}.{ext}` file name.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use transcriptforge_common::paths::index_prefix;
///
/// assert_eq!(index_prefix(Path::new("/x/027_Title.json3")), Some(27));
/// assert_eq!(index_prefix(Path::new("Title.json3")), None);
/// ```
pub fn index_prefix(path: &Path) -> Option<u32> {
    let name = file_name(path);
    let (digits, rest) = name.split_once('_')?;
    if digits.is_empty() || rest.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Make a title safe for use in a file name.
///
/// Path separators and characters reserved on common filesystems become `_`,
/// whitespace runs collapse to one space, and the result is capped at 80
/// characters.
///
/// # Examples
///
/// ```
/// use transcriptforge_common::paths::sanitize_title;
///
/// assert_eq!(sanitize_title("Clase 3: ¿Qué es?"), "Clase 3_ ¿Qué es_");
/// assert_eq!(sanitize_title("  a/b\\c  "), "a_b_c");
/// assert_eq!(sanitize_title(""), "untitled");
/// ```
pub fn sanitize_title(title: &str) -> String {
    let replaced: String = title
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    let trimmed: String = collapsed.chars().take(MAX_TITLE_LEN).collect();
    let trimmed = trimmed.trim_end_matches(['.', ' ']).to_string();
    if trimmed.is_empty() {
        "untitled".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_never_match_any_kind() {
        for kind in [
            ArtifactKind::Subtitle,
            ArtifactKind::Transcript,
            ArtifactKind::Audio,
            ArtifactKind::Extracted,
        ] {
            assert!(!matches_kind(Path::new("NO_SUBS_001_abc.txt"), kind));
            assert!(!matches_kind(Path::new("ERROR_001_x.json3"), kind));
            assert!(!matches_kind(Path::new("NO_CONTENT_001_extracted_abc.txt"), kind));
        }
    }

    #[test]
    fn test_staging_files_are_ignored() {
        assert!(!matches_kind(Path::new("001_Lesson.mp3.partial"), ArtifactKind::Audio));
        assert!(!matches_kind(
            Path::new("001_Lesson_extracted.json.partial"),
            ArtifactKind::Extracted
        ));
        assert!(is_staging_file(Path::new("001_Lesson.srt.partial")));
    }

    #[test]
    fn test_matches_kind() {
        assert!(matches_kind(Path::new("001_A.json3"), ArtifactKind::Subtitle));
        assert!(matches_kind(Path::new("001_A.vtt"), ArtifactKind::Subtitle));
        assert!(matches_kind(Path::new("001_A.srt"), ArtifactKind::Transcript));
        assert!(matches_kind(Path::new("001_A.MP3"), ArtifactKind::Audio));
        assert!(matches_kind(Path::new("001_A_extracted.json"), ArtifactKind::Extracted));
        assert!(!matches_kind(Path::new("001_A.json"), ArtifactKind::Extracted));
        assert!(!matches_kind(Path::new("001_A.srt"), ArtifactKind::Subtitle));
    }

    #[test]
    fn test_index_prefix() {
        assert_eq!(index_prefix(Path::new("001_A.json3")), Some(1));
        assert_eq!(index_prefix(Path::new("230_Secretos_del_Zohar.mp3")), Some(230));
        assert_eq!(index_prefix(Path::new("NO_SUBS_001_x.txt")), None);
        assert_eq!(index_prefix(Path::new("_A.json3")), None);
        assert_eq!(index_prefix(Path::new("001_")), None);
        assert_eq!(index_prefix(Path::new("12a_A.json3")), None);
    }

    #[test]
    fn test_sanitize_title_caps_length() {
        let long = "x".repeat(200);
        assert_eq!(sanitize_title(&long).chars().count(), 80);
        assert_eq!(sanitize_title("Title..."), "Title");
        assert_eq!(sanitize_title("a\tb\nc"), "a b c");
    }

    #[test]
    fn test_default_extension() {
        assert_eq!(default_extension(ArtifactKind::Subtitle), "json3");
        assert_eq!(default_extension(ArtifactKind::Transcript), "srt");
        assert_eq!(default_extension(ArtifactKind::Audio), "mp3");
    }
}
