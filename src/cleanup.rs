//! Cleanup Executor: deletes intermediate audio once a collection verified.

use crate::config::CollectionConfig;
use crate::locator::ArtifactLocator;
use crate::registry::{PhaseOutcome, PhaseRecord, Registry};
use crate::verify::{VerificationGate, VerificationPass};
use serde::Serialize;
use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transcriptforge_common::{ArtifactKind, CollectionName, Phase, Result, UnitState};

#[derive(Debug, Clone, Serialize)]
pub struct CleanupFailure {
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CleanupReport {
    pub collection: CollectionName,
    pub confirmed: bool,
    /// Files deleted, or that would be deleted in a dry run
    pub files: Vec<PathBuf>,
    /// Bytes reclaimed, or reclaimable in a dry run; files that could not be
    /// deleted are not counted
    pub bytes: u64,
    pub deleted: usize,
    pub failures: Vec<CleanupFailure>,
    /// Units moved to `cleaned_up`
    pub cleaned_units: usize,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub struct CleanupExecutor {
    registry: Arc<Registry>,
    locator: ArtifactLocator,
    remove: fn(&Path) -> io::Result<()>,
}

impl CleanupExecutor {
    pub fn new(registry: Arc<Registry>, locator: ArtifactLocator) -> Self {
        Self {
            registry,
            locator,
            remove: |path| std::fs::remove_file(path),
        }
    }

    /// Replace how individual files are deleted.
    #[cfg(test)]
    fn with_remover(mut self, remove: fn(&Path) -> io::Result<()>) -> Self {
        self.remove = remove;
        self
    }

    /// Verify `collection` afresh and clean up only if it passes.
    ///
    /// Fails with [`transcriptforge_common::Error::VerificationFailed`],
    /// naming the first issue, without touching any file otherwise.
    pub fn verify_and_cleanup(
        &self,
        gate: &VerificationGate,
        collection: &CollectionConfig,
        confirmed: bool,
    ) -> Result<CleanupReport> {
        let pass = gate.verify(collection)?.into_pass()?;
        self.cleanup(pass, confirmed)
    }

    /// Delete (or, unless `confirmed`, list) the collection's audio files.
    ///
    /// Per-file failures are collected and reported; the remaining files are
    /// still processed. Afterwards every verified unit whose transcript and
    /// extracted content are still on disk moves to `cleaned_up`.
    pub fn cleanup(&self, pass: VerificationPass, confirmed: bool) -> Result<CleanupReport> {
        let name = pass.collection().clone();
        let audio = self.locator.scan(&name, ArtifactKind::Audio)?;

        let mut report = CleanupReport {
            collection: name.clone(),
            confirmed,
            files: audio.iter().map(|a| a.path.clone()).collect(),
            bytes: audio.iter().map(|a| a.size).sum(),
            deleted: 0,
            failures: Vec::new(),
            cleaned_units: 0,
        };

        if !confirmed {
            tracing::info!(
                collection = %name,
                "Dry run: would delete {} file(s), reclaiming {} bytes",
                report.files.len(),
                report.bytes
            );
            return Ok(report);
        }

        let mut failed_units = BTreeSet::new();
        for artifact in &audio {
            match (self.remove)(&artifact.path) {
                Ok(()) => {
                    report.deleted += 1;
                    tracing::debug!(collection = %name, "Deleted {:?}", artifact.path);
                }
                Err(e) => {
                    tracing::warn!(collection = %name, "Failed to delete {:?}: {}", artifact.path, e);
                    failed_units.insert(artifact.index);
                    report.bytes -= artifact.size;
                    report.failures.push(CleanupFailure {
                        path: artifact.path.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        report.cleaned_units = self.mark_cleaned(&name, pass.units(), &failed_units)?;
        if report.is_complete() {
            self.registry.mark_cleanup_done(&name)?;
        }

        tracing::info!(
            collection = %name,
            "Deleted {} file(s) ({} bytes), {} failure(s), {} unit(s) cleaned up",
            report.deleted,
            report.bytes,
            report.failures.len(),
            report.cleaned_units
        );
        Ok(report)
    }

    /// Move verified units to `cleaned_up`, rechecking their artifacts first.
    fn mark_cleaned(&self, name: &CollectionName, indices: &[u32], skip: &BTreeSet<u32>) -> Result<usize> {
        let session = self.registry.session();
        let mut cleaned = 0;
        for &index in indices {
            if skip.contains(&index) {
                continue;
            }
            let Some(mut unit) = self.registry.unit(name, index)? else {
                continue;
            };
            if unit.state != UnitState::Active(Phase::Verified) {
                continue;
            }

            let transcript = self.locator.locate_transcript(name, index)?;
            let extracted = self.locator.locate(name, index, ArtifactKind::Extracted)?;
            if transcript.is_none() || extracted.is_none() {
                tracing::warn!(
                    collection = %name,
                    index,
                    "Artifacts disappeared after verification; leaving unit at verified"
                );
                continue;
            }

            unit.advance(UnitState::Active(Phase::CleanedUp));
            let record = PhaseRecord::new(session, index, Phase::CleanedUp, PhaseOutcome::CleanedUp);
            self.registry.commit(name, unit, vec![record])?;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExtractionProfile, StorageConfig, VerificationConfig};
    use crate::registry::ContentUnit;
    use assert_matches::assert_matches;
    use serde_json::json;
    use transcriptforge_common::{Error, TranscriptRoute};

    fn collection() -> CollectionConfig {
        CollectionConfig {
            name: "demo".into(),
            display: None,
            total: 2,
            priority: 0,
            catalog: "demo.json".into(),
            audio_fallback: true,
            profile: ExtractionProfile::default(),
        }
    }

    /// Two audio-route units at ai_extracted with their audio still on disk.
    fn seeded(root: &std::path::Path) -> (Arc<Registry>, ArtifactLocator) {
        let storage = StorageConfig::at(root);
        let registry = Arc::new(Registry::open(storage.registry_path()));
        let locator = ArtifactLocator::new(storage);
        let name = collection().name;

        for index in 1..=2 {
            let title = format!("Item {index}");
            for (kind, body) in [
                (ArtifactKind::Audio, "x".repeat(100 * index as usize)),
                (ArtifactKind::Transcript, "1\n00:00:00,000 --> 00:00:01,000\nhi\n".to_string()),
                (
                    ArtifactKind::Extracted,
                    json!({"metadata": {"item_id": format!("vid{index}")}}).to_string(),
                ),
            ] {
                let path = locator.artifact_path(&name, index, &title, kind, None);
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                std::fs::write(path, body).unwrap();
            }
            let mut unit = ContentUnit::new(index, format!("vid{index}"), title);
            unit.route = Some(TranscriptRoute::Audio);
            unit.state = UnitState::Active(Phase::AiExtracted);
            registry.upsert(&name, unit).unwrap();
        }
        (registry, locator)
    }

    #[test]
    fn test_dry_run_lists_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, locator) = seeded(dir.path());
        let gate = VerificationGate::new(registry.clone(), locator.clone(), VerificationConfig::default());
        let executor = CleanupExecutor::new(registry.clone(), locator.clone());

        let first = executor.verify_and_cleanup(&gate, &collection(), false).unwrap();
        let second = executor.verify_and_cleanup(&gate, &collection(), false).unwrap();
        assert_eq!(first.files, second.files);
        assert_eq!(first.bytes, 300);
        assert_eq!(second.bytes, 300);
        assert_eq!(first.deleted, 0);
        assert!(first.files.iter().all(|f| f.exists()));

        let unit = registry.unit(&collection().name, 1).unwrap().unwrap();
        assert_eq!(unit.state, UnitState::Active(Phase::Verified));
    }

    #[test]
    fn test_confirmed_cleanup_moves_units_to_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, locator) = seeded(dir.path());
        let gate = VerificationGate::new(registry.clone(), locator.clone(), VerificationConfig::default());
        let executor = CleanupExecutor::new(registry.clone(), locator.clone());

        let report = executor.verify_and_cleanup(&gate, &collection(), true).unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(report.cleaned_units, 2);
        assert!(report.is_complete());
        assert!(locator.scan(&collection().name, ArtifactKind::Audio).unwrap().is_empty());

        let record = registry.record(&collection().name).unwrap().unwrap();
        assert!(record.stats.cleanup_done);
        assert!(record
            .units
            .values()
            .all(|u| u.state == UnitState::Active(Phase::CleanedUp)));
        assert_eq!(
            record.history.iter().filter(|r| r.outcome == PhaseOutcome::CleanedUp).count(),
            2
        );
    }

    #[test]
    fn test_failed_gate_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, locator) = seeded(dir.path());
        let extracted = locator
            .locate(&collection().name, 2, ArtifactKind::Extracted)
            .unwrap()
            .unwrap();
        std::fs::write(&extracted.path, "[1, 2").unwrap();

        let gate = VerificationGate::new(registry.clone(), locator.clone(), VerificationConfig::default());
        let executor = CleanupExecutor::new(registry, locator.clone());
        let err = executor.verify_and_cleanup(&gate, &collection(), true).unwrap_err();
        assert_matches!(err, Error::VerificationFailed { ref first_issue, .. } if first_issue.contains("unit 002"));
        assert_eq!(locator.scan(&collection().name, ArtifactKind::Audio).unwrap().len(), 2);
    }

    #[test]
    fn test_failed_deletion_is_reported_and_the_rest_continue() {
        let dir = tempfile::tempdir().unwrap();
        let (registry, locator) = seeded(dir.path());
        let gate = VerificationGate::new(registry.clone(), locator.clone(), VerificationConfig::default());
        let executor = CleanupExecutor::new(registry.clone(), locator.clone()).with_remover(|path| {
            if path.to_string_lossy().contains("002_") {
                return Err(io::Error::new(io::ErrorKind::PermissionDenied, "file is locked"));
            }
            std::fs::remove_file(path)
        });
        let name = collection().name;
        let stuck = locator.locate(&name, 2, ArtifactKind::Audio).unwrap().unwrap();

        let report = executor.verify_and_cleanup(&gate, &collection(), true).unwrap();

        assert!(!report.is_complete());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, stuck.path);
        assert!(report.failures[0].error.contains("file is locked"));
        assert_eq!(report.deleted, 1);
        assert_eq!(report.bytes, 100);
        assert_eq!(report.cleaned_units, 1);

        let remaining = locator.scan(&name, ArtifactKind::Audio).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].index, 2);

        let record = registry.record(&name).unwrap().unwrap();
        assert_eq!(record.units[&1].state, UnitState::Active(Phase::CleanedUp));
        assert_eq!(record.units[&2].state, UnitState::Active(Phase::Verified));
        assert!(record.stats.verified);
        assert!(!record.stats.cleanup_done);
    }
}
