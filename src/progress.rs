//! Progress Aggregator: read-only rollup of registry and disk state.

use crate::collaborators::ItemDescriptor;
use crate::config::CollectionConfig;
use crate::locator::ArtifactLocator;
use crate::registry::{ContentUnit, Registry, Stage};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::Arc;
use transcriptforge_common::{ArtifactKind, CollectionName, Phase, Result, UnitState};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CollectionProgress {
    pub name: CollectionName,
    pub display: String,
    pub total: u32,
    pub stage: Stage,
    /// Units per state label, from the registry
    pub per_state: BTreeMap<String, u32>,
    /// Still being worked on, including items never attempted
    pub pending: u32,
    pub no_content: u32,
    pub failed: u32,
    pub transcripts_on_disk: u32,
    pub audio_on_disk: u32,
    pub audio_bytes: u64,
    pub extracted_on_disk: u32,
    /// Units the registry places past extraction whose document is missing
    pub missing_on_disk: u32,
    pub percent_extracted: f64,
    pub verified: bool,
    pub cleanup_done: bool,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressTotals {
    pub total: u32,
    pub pending: u32,
    pub no_content: u32,
    pub failed: u32,
    pub extracted_on_disk: u32,
    pub audio_bytes: u64,
    pub percent_extracted: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressReport {
    pub generated_at: DateTime<Utc>,
    pub collections: Vec<CollectionProgress>,
    pub totals: ProgressTotals,
}

fn percent(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        (f64::from(part) * 1000.0 / f64::from(whole)).round() / 10.0
    }
}

fn distinct_indices(refs: &[crate::locator::ArtifactRef]) -> u32 {
    refs.iter().map(|r| r.index).collect::<BTreeSet<_>>().len() as u32
}

pub struct ProgressAggregator {
    registry: Arc<Registry>,
    locator: ArtifactLocator,
}

impl ProgressAggregator {
    pub fn new(registry: Arc<Registry>, locator: ArtifactLocator) -> Self {
        Self { registry, locator }
    }

    pub fn collection(&self, collection: &CollectionConfig) -> Result<CollectionProgress> {
        let name = &collection.name;
        let record = self.registry.record(name)?.unwrap_or_default();

        let transcripts = {
            let mut refs = self.locator.scan(name, ArtifactKind::Subtitle)?;
            refs.extend(self.locator.scan(name, ArtifactKind::Transcript)?);
            refs
        };
        let audio = self.locator.scan(name, ArtifactKind::Audio)?;
        let extracted = self.locator.scan(name, ArtifactKind::Extracted)?;
        let extracted_indices: BTreeSet<u32> = extracted.iter().map(|r| r.index).collect();

        let mut progress = CollectionProgress {
            name: name.clone(),
            display: collection.display_name().to_string(),
            total: collection.total,
            stage: record.phase,
            transcripts_on_disk: distinct_indices(&transcripts),
            audio_on_disk: distinct_indices(&audio),
            audio_bytes: audio.iter().map(|a| a.size).sum(),
            extracted_on_disk: extracted_indices.len() as u32,
            verified: record.stats.verified,
            cleanup_done: record.stats.cleanup_done,
            last_updated: (!record.units.is_empty() || !record.history.is_empty()).then_some(record.last_updated),
            ..Default::default()
        };

        for unit in record.units.values() {
            *progress.per_state.entry(unit.state.to_string()).or_insert(0) += 1;
            match unit.state {
                UnitState::NoContent(_) => progress.no_content += 1,
                UnitState::FailedPermanent(_) => progress.failed += 1,
                UnitState::Active(phase) if phase < Phase::AiExtracted => progress.pending += 1,
                UnitState::Active(_) => {
                    if !extracted_indices.contains(&unit.index) {
                        progress.missing_on_disk += 1;
                    }
                }
            }
        }

        let untracked = collection.total.saturating_sub(record.units.len() as u32);
        if untracked > 0 {
            *progress
                .per_state
                .entry(UnitState::default().to_string())
                .or_insert(0) += untracked;
            progress.pending += untracked;
        }
        progress.percent_extracted = percent(progress.extracted_on_disk, collection.total);
        Ok(progress)
    }

    pub fn report(&self, collections: &[&CollectionConfig]) -> Result<ProgressReport> {
        let mut report = ProgressReport {
            generated_at: Utc::now(),
            collections: Vec::with_capacity(collections.len()),
            totals: ProgressTotals::default(),
        };
        for collection in collections {
            let progress = self.collection(collection)?;
            let totals = &mut report.totals;
            totals.total += progress.total;
            totals.pending += progress.pending;
            totals.no_content += progress.no_content;
            totals.failed += progress.failed;
            totals.extracted_on_disk += progress.extracted_on_disk;
            totals.audio_bytes += progress.audio_bytes;
            report.collections.push(progress);
        }
        report.totals.percent_extracted = percent(report.totals.extracted_on_disk, report.totals.total);
        Ok(report)
    }

    /// Whether no item of `items` is still waiting for `stage`.
    ///
    /// Items the registry has never seen wait for [`Stage::Download`]. A unit
    /// waiting for the extract stage whose extracted document is already on
    /// disk still counts as waiting; the engine records it as resumed.
    pub fn stage_exhausted(&self, collection: &CollectionConfig, items: &[ItemDescriptor], stage: Stage) -> Result<bool> {
        Ok(self.pending_for(collection, items, stage)?.is_empty())
    }

    /// Items still waiting for `stage`, in ascending index order.
    pub fn pending_for(
        &self,
        collection: &CollectionConfig,
        items: &[ItemDescriptor],
        stage: Stage,
    ) -> Result<Vec<ItemDescriptor>> {
        let units = self.registry.get(&collection.name)?;
        let mut pending: Vec<ItemDescriptor> = items
            .iter()
            .filter(|item| Stage::for_state(units.get(&item.index).map(|u: &ContentUnit| &u.state)) == Some(stage))
            .cloned()
            .collect();
        pending.sort_by_key(|item| item.index);
        Ok(pending)
    }
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Plain-text rendering for the terminal.
pub fn render_text(report: &ProgressReport) -> String {
    let mut out = String::new();
    for c in &report.collections {
        let _ = writeln!(
            out,
            "{} [{}] stage={} {}/{} extracted ({:.1}%)",
            c.display, c.name, c.stage, c.extracted_on_disk, c.total, c.percent_extracted
        );
        let _ = writeln!(
            out,
            "  pending: {}  no content: {}  failed: {}",
            c.pending, c.no_content, c.failed
        );
        let _ = writeln!(
            out,
            "  on disk: {} transcripts, {} audio ({}), {} extracted",
            c.transcripts_on_disk,
            c.audio_on_disk,
            human_bytes(c.audio_bytes),
            c.extracted_on_disk
        );
        if c.missing_on_disk > 0 {
            let _ = writeln!(out, "  missing on disk: {}", c.missing_on_disk);
        }
        for (state, count) in &c.per_state {
            let _ = writeln!(out, "    {:<28} {}", state, count);
        }
        let _ = writeln!(
            out,
            "  verified: {}  cleanup done: {}",
            if c.verified { "yes" } else { "no" },
            if c.cleanup_done { "yes" } else { "no" }
        );
    }
    let t = &report.totals;
    let _ = writeln!(
        out,
        "Total: {}/{} extracted ({:.1}%), {} pending, {} no content, {} failed, {} audio",
        t.extracted_on_disk,
        t.total,
        t.percent_extracted,
        t.pending,
        t.no_content,
        t.failed,
        human_bytes(t.audio_bytes)
    );
    out
}
