//! Artifact Locator: answers "does storage hold an artifact of kind K for
//! unit U" from file names alone.
//!
//! Nothing here is persisted. Existence is re-derived on every call so the
//! registry can never drift from what is actually on disk.

use crate::config::StorageConfig;
use std::path::{Path, PathBuf};
use transcriptforge_common::paths::{
    default_extension, index_prefix, matches_kind, sanitize_title, NO_CONTENT_PREFIX,
    NO_SUBS_PREFIX, STAGING_EXTENSION,
};
use transcriptforge_common::{ArtifactKind, CollectionName, Result};
use walkdir::WalkDir;

/// An artifact found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub kind: ArtifactKind,
    pub index: u32,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct ArtifactLocator {
    storage: StorageConfig,
}

impl ArtifactLocator {
    pub fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageConfig {
        &self.storage
    }

    pub fn dir(&self, kind: ArtifactKind, collection: &CollectionName) -> PathBuf {
        self.storage.artifact_dir(kind, collection)
    }

    /// Every countable artifact of `kind` in a collection, ordered by index.
    ///
    /// Files without an index prefix, sentinel and error markers, and
    /// in-progress staging files are skipped.
    pub fn scan(&self, collection: &CollectionName, kind: ArtifactKind) -> Result<Vec<ArtifactRef>> {
        let dir = self.dir(kind, collection);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .follow_links(true)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || !matches_kind(path, kind) {
                continue;
            }
            let Some(index) = index_prefix(path) else {
                continue;
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            found.push(ArtifactRef {
                kind,
                index,
                path: path.to_path_buf(),
                size,
            });
        }

        found.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.path.cmp(&b.path)));
        Ok(found)
    }

    /// The first artifact of `kind` for one unit, if any.
    pub fn locate(
        &self,
        collection: &CollectionName,
        index: u32,
        kind: ArtifactKind,
    ) -> Result<Option<ArtifactRef>> {
        Ok(self
            .scan(collection, kind)?
            .into_iter()
            .find(|artifact| artifact.index == index))
    }

    /// Subtitle or speech-to-text transcript for a unit, subtitles first.
    pub fn locate_transcript(
        &self,
        collection: &CollectionName,
        index: u32,
    ) -> Result<Option<ArtifactRef>> {
        if let Some(subtitle) = self.locate(collection, index, ArtifactKind::Subtitle)? {
            return Ok(Some(subtitle));
        }
        self.locate(collection, index, ArtifactKind::Transcript)
    }

    /// Canonical location for a new artifact: `{index:03}_{title}.{ext}`.
    ///
    /// Extracted content is named after the transcript stem with the
    /// `_extracted.json` suffix.
    pub fn artifact_path(
        &self,
        collection: &CollectionName,
        index: u32,
        title: &str,
        kind: ArtifactKind,
        ext: Option<&str>,
    ) -> PathBuf {
        let stem = format!("{:03}_{}", index, sanitize_title(title));
        let name = match kind {
            ArtifactKind::Extracted => format!("{stem}_extracted.json"),
            _ => format!("{stem}.{}", ext.unwrap_or_else(|| default_extension(kind))),
        };
        self.dir(kind, collection).join(name)
    }

    /// `NO_SUBS_{index:03}_{item_id}.txt` in the transcripts directory.
    pub fn no_subs_marker(&self, collection: &CollectionName, index: u32, item_id: &str) -> PathBuf {
        self.dir(ArtifactKind::Subtitle, collection)
            .join(format!("{NO_SUBS_PREFIX}{index:03}_{item_id}.txt"))
    }

    /// `NO_CONTENT_{index:03}_{kind}_{item_id}.txt` beside the missing artifact.
    pub fn no_content_marker(
        &self,
        collection: &CollectionName,
        index: u32,
        kind: ArtifactKind,
        item_id: &str,
    ) -> PathBuf {
        self.dir(kind, collection)
            .join(format!("{NO_CONTENT_PREFIX}{index:03}_{}_{item_id}.txt", kind.as_str()))
    }

    pub fn has_no_subs_marker(&self, collection: &CollectionName, index: u32) -> bool {
        let prefix = format!("{NO_SUBS_PREFIX}{index:03}_");
        !self
            .markers_in(&self.dir(ArtifactKind::Subtitle, collection), &prefix)
            .is_empty()
    }

    /// Any confirmed-absence marker recorded for a unit.
    pub fn find_no_content_marker(&self, collection: &CollectionName, index: u32) -> Option<PathBuf> {
        let prefix = format!("{NO_CONTENT_PREFIX}{index:03}_");
        [ArtifactKind::Transcript, ArtifactKind::Extracted]
            .into_iter()
            .flat_map(|kind| self.markers_in(&self.dir(kind, collection), &prefix))
            .next()
    }

    pub fn write_marker(&self, marker: &Path, reason: &str) -> Result<()> {
        if let Some(parent) = marker.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(marker, format!("{}\n", reason))?;
        Ok(())
    }

    /// Remove every sentinel for a unit. Returns how many were removed.
    pub fn remove_markers(&self, collection: &CollectionName, index: u32) -> Result<usize> {
        let mut removed = 0;
        let subs = format!("{NO_SUBS_PREFIX}{index:03}_");
        let absent = format!("{NO_CONTENT_PREFIX}{index:03}_");
        for kind in [ArtifactKind::Subtitle, ArtifactKind::Extracted] {
            let dir = self.dir(kind, collection);
            for marker in self
                .markers_in(&dir, &subs)
                .into_iter()
                .chain(self.markers_in(&dir, &absent))
            {
                std::fs::remove_file(&marker)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn markers_in(&self, dir: &Path, prefix: &str) -> Vec<PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        let mut markers: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(prefix))
                    .unwrap_or(false)
            })
            .collect();
        markers.sort();
        markers
    }
}

/// Staging location a collaborator writes into before the artifact is promoted.
pub fn staging_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(STAGING_EXTENSION);
    target.with_file_name(name)
}

/// Move a finished staging file onto its counted name.
pub fn promote(staging: &Path, target: &Path) -> Result<()> {
    std::fs::rename(staging, target)?;
    Ok(())
}

/// Make room for a collaborator to write `staging`: the directory exists and
/// no leftover from an interrupted run is in the way.
pub fn prepare_staging(staging: &Path) -> Result<()> {
    if let Some(parent) = staging.parent() {
        std::fs::create_dir_all(parent)?;
    }
    discard_staging(staging);
    Ok(())
}

/// Best-effort removal of a leftover staging file.
pub fn discard_staging(staging: &Path) {
    if staging.exists() {
        if let Err(e) = std::fs::remove_file(staging) {
            tracing::warn!(path = ?staging, "Failed to remove staging file: {}", e);
        }
    }
}
