//! Phase Transition Engine: moves one unit one step along its route.
//!
//! Before any collaborator call the engine asks the locator whether the next
//! artifact is already on disk (left by an interrupted run) and, if so,
//! advances without calling out. Otherwise it calls the collaborator through
//! the scheduler, writes the artifact via a staging file, and commits the
//! unit together with the records describing the attempt in one registry
//! write.

use crate::collaborators::{Collaborators, ItemDescriptor, SubtitleFetch};
use crate::config::CollectionConfig;
use crate::locator::{self, ArtifactLocator};
use crate::registry::{ContentUnit, PhaseOutcome, PhaseRecord, Registry};
use crate::scheduler::{CallOutcome, CallReport, ErrorClass, RetryScheduler};
use chrono::Utc;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use transcriptforge_common::paths::EXTRACTED_SUFFIX;
use transcriptforge_common::{
    ArtifactKind, Phase, Result, SessionId, TranscriptRoute, UnitKey, UnitState,
};

/// What one call to [`PhaseEngine::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The unit reached `to`; `resumed` when the artifact was already on disk.
    Advanced { to: Phase, resumed: bool },
    /// Confirmed absence; the unit is now `no_content(phase)`.
    NoContent(Phase),
    /// Transient failure; the unit stays where it was.
    Retry { attempts: u32 },
    /// Per-phase budget exhausted.
    FailedPermanent(Phase),
    /// Still rate limited after the allowed pauses.
    Throttled,
    /// An artifact the next step needs has disappeared from disk.
    Blocked(String),
    /// Nothing for the engine to do in the unit's current state.
    Idle,
    Cancelled,
}

impl StepOutcome {
    /// Whether the unit left its pending state.
    pub fn made_progress(&self) -> bool {
        matches!(
            self,
            Self::Advanced { .. } | Self::NoContent(_) | Self::FailedPermanent(_)
        )
    }
}

enum Call<T> {
    Done(T),
    Absent(String),
    Stopped(StepOutcome),
}

/// A unit being worked on plus the records to commit with it.
struct Transition<'a> {
    collection: &'a CollectionConfig,
    item: &'a ItemDescriptor,
    session: SessionId,
    unit: ContentUnit,
    records: Vec<PhaseRecord>,
    /// Phase whose breaker should hear about this step, and whether it went well
    breaker: Option<(Phase, bool)>,
}

impl Transition<'_> {
    fn key(&self) -> UnitKey {
        UnitKey::new(self.collection.name.clone(), self.item.index)
    }

    fn record(&mut self, phase: Phase, outcome: PhaseOutcome, detail: impl Into<String>) {
        self.records.push(
            PhaseRecord::new(self.session, self.unit.index, phase, outcome).with_detail(detail),
        );
    }

    fn reached(&mut self, to: Phase, artifact: &Path, resumed: bool) -> StepOutcome {
        let outcome = if resumed {
            PhaseOutcome::Resumed
        } else {
            PhaseOutcome::Success
        };
        self.record(to, outcome, artifact.display().to_string());
        self.unit.advance(UnitState::Active(to));
        StepOutcome::Advanced { to, resumed }
    }

    fn absent(&mut self, phase: Phase, outcome: PhaseOutcome, reason: &str) -> StepOutcome {
        self.record(phase, outcome, reason);
        self.unit.advance(UnitState::NoContent(phase));
        self.unit.last_error = Some(reason.to_string());
        StepOutcome::NoContent(phase)
    }

    fn blocked(&mut self, reason: &str) -> StepOutcome {
        self.unit.last_error = Some(reason.to_string());
        StepOutcome::Blocked(reason.to_string())
    }
}

pub struct PhaseEngine {
    registry: Arc<Registry>,
    locator: ArtifactLocator,
    scheduler: Arc<RetryScheduler>,
    collaborators: Collaborators,
}

impl PhaseEngine {
    pub fn new(
        registry: Arc<Registry>,
        locator: ArtifactLocator,
        scheduler: Arc<RetryScheduler>,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            registry,
            locator,
            scheduler,
            collaborators,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Drive one transition for `item`, based on the unit's current phase.
    ///
    /// Returns [`transcriptforge_common::Error::CircuitOpen`] when repeated
    /// failures across items halt the collection; the unit's own progress is
    /// committed first.
    pub async fn advance(&self, collection: &CollectionConfig, item: &ItemDescriptor) -> Result<StepOutcome> {
        let original = self.registry.unit(&collection.name, item.index)?;
        let unit = match &original {
            Some(unit) => {
                if unit.item_id != item.item_id {
                    tracing::warn!(
                        collection = %collection.name,
                        index = item.index,
                        "Catalog item id {} differs from registry item id {}; keeping registry",
                        item.item_id,
                        unit.item_id
                    );
                }
                unit.clone()
            }
            None => ContentUnit::new(item.index, &item.item_id, &item.title),
        };

        let mut tx = Transition {
            collection,
            item,
            session: self.registry.session(),
            unit,
            records: Vec::new(),
            breaker: None,
        };

        let outcome = match tx.unit.state {
            UnitState::Active(Phase::NotStarted) => self.acquire(&mut tx).await?,
            UnitState::Active(Phase::AudioAcquired) => self.transcribe(&mut tx).await?,
            UnitState::Active(Phase::Downloaded | Phase::Transcribed) => self.extract(&mut tx).await?,
            _ => return Ok(StepOutcome::Idle),
        };

        let key = tx.key();
        let Transition {
            unit,
            records,
            breaker,
            ..
        } = tx;

        let changed = original.as_ref() != Some(&unit);
        let skip = outcome == StepOutcome::Cancelled && records.is_empty();
        if (changed || !records.is_empty()) && !skip {
            self.registry.commit(&collection.name, unit, records)?;
        }

        match &outcome {
            StepOutcome::Advanced { to, resumed } => {
                tracing::info!(unit = %key, phase = %to, resumed, "Unit advanced")
            }
            StepOutcome::NoContent(phase) => tracing::info!(unit = %key, phase = %phase, "No content"),
            StepOutcome::FailedPermanent(phase) => {
                tracing::warn!(unit = %key, phase = %phase, "Retry budget exhausted")
            }
            StepOutcome::Retry { attempts } => {
                tracing::warn!(unit = %key, attempts, "Transient failure, will retry")
            }
            StepOutcome::Blocked(reason) => tracing::warn!(unit = %key, "Blocked: {}", reason),
            StepOutcome::Throttled => tracing::warn!(unit = %key, "Still rate limited"),
            StepOutcome::Idle | StepOutcome::Cancelled => {}
        }

        match breaker {
            Some((phase, true)) => self.scheduler.record_success(&collection.name, phase),
            Some((phase, false)) => self.scheduler.record_failure(&collection.name, phase).await?,
            None => {}
        }

        Ok(outcome)
    }

    /// `not_started` -> `downloaded` (subtitles) or `audio_acquired` (audio).
    async fn acquire(&self, tx: &mut Transition<'_>) -> Result<StepOutcome> {
        let collection = tx.collection;
        let name = &collection.name;
        let item = tx.item;

        if tx.unit.route != Some(TranscriptRoute::Audio) {
            if let Some(found) = self.locator.locate(name, item.index, ArtifactKind::Subtitle)? {
                tx.unit.route = Some(TranscriptRoute::Subtitles);
                return Ok(tx.reached(Phase::Downloaded, &found.path, true));
            }

            if tx.unit.route.is_none() && self.locator.has_no_subs_marker(name, item.index) {
                if !collection.audio_fallback {
                    return Ok(tx.absent(Phase::Transcribed, PhaseOutcome::Resumed, "no subtitles (sentinel)"));
                }
                tx.unit.route = Some(TranscriptRoute::Audio);
            }
        }

        if tx.unit.route != Some(TranscriptRoute::Audio) {
            if let Some(outcome) = self.over_budget(tx, Phase::Downloaded) {
                return Ok(outcome);
            }

            let target = self
                .locator
                .artifact_path(name, item.index, &item.title, ArtifactKind::Subtitle, None);
            let staging = locator::staging_path(&target);
            locator::prepare_staging(&staging)?;

            let label = format!("{} subtitle", tx.key());
            let downloader = &self.collaborators.downloader;
            let report = self
                .scheduler
                .call(&label, || downloader.fetch_subtitle(item, &staging))
                .await;

            match self.settle(tx, Phase::Downloaded, report) {
                Call::Done(SubtitleFetch::Fetched { extension }) => {
                    let target = self.locator.artifact_path(
                        name,
                        item.index,
                        &item.title,
                        ArtifactKind::Subtitle,
                        Some(&extension),
                    );
                    locator::promote(&staging, &target)?;
                    tx.unit.route = Some(TranscriptRoute::Subtitles);
                    return Ok(tx.reached(Phase::Downloaded, &target, false));
                }
                Call::Done(SubtitleFetch::NoSubtitles) | Call::Absent(_) => {
                    locator::discard_staging(&staging);
                    let marker = self.locator.no_subs_marker(name, item.index, &tx.unit.item_id);
                    self.locator
                        .write_marker(&marker, "no subtitles in any supported language")?;
                    if !collection.audio_fallback {
                        return Ok(tx.absent(Phase::Transcribed, PhaseOutcome::PermanentFailure, "no subtitles"));
                    }
                    tx.record(
                        Phase::Downloaded,
                        PhaseOutcome::PermanentFailure,
                        "no subtitles; switching to audio route",
                    );
                    tx.unit.route = Some(TranscriptRoute::Audio);
                    tx.unit.touch();
                }
                Call::Stopped(outcome) => {
                    locator::discard_staging(&staging);
                    return Ok(outcome);
                }
            }
        }

        self.acquire_audio(tx).await
    }

    async fn acquire_audio(&self, tx: &mut Transition<'_>) -> Result<StepOutcome> {
        let collection = tx.collection;
        let name = &collection.name;
        let item = tx.item;

        if let Some(found) = self.locator.locate(name, item.index, ArtifactKind::Transcript)? {
            return Ok(tx.reached(Phase::Transcribed, &found.path, true));
        }
        if let Some(found) = self.locator.locate(name, item.index, ArtifactKind::Audio)? {
            return Ok(tx.reached(Phase::AudioAcquired, &found.path, true));
        }
        if let Some(marker) = self.locator.find_no_content_marker(name, item.index) {
            let reason = format!("sentinel {}", marker.display());
            return Ok(tx.absent(Phase::Transcribed, PhaseOutcome::Resumed, &reason));
        }
        if let Some(outcome) = self.over_budget(tx, Phase::AudioAcquired) {
            return Ok(outcome);
        }

        let target = self
            .locator
            .artifact_path(name, item.index, &item.title, ArtifactKind::Audio, None);
        let staging = locator::staging_path(&target);
        locator::prepare_staging(&staging)?;

        let label = format!("{} audio", tx.key());
        let downloader = &self.collaborators.downloader;
        let report = self
            .scheduler
            .call(&label, || downloader.fetch_audio(item, &staging))
            .await;

        match self.settle(tx, Phase::AudioAcquired, report) {
            Call::Done(extension) => {
                let target = self.locator.artifact_path(
                    name,
                    item.index,
                    &item.title,
                    ArtifactKind::Audio,
                    Some(&extension),
                );
                locator::promote(&staging, &target)?;
                Ok(tx.reached(Phase::AudioAcquired, &target, false))
            }
            Call::Absent(reason) => {
                locator::discard_staging(&staging);
                self.mark_absent(tx, ArtifactKind::Transcript, Phase::Transcribed, &reason)
            }
            Call::Stopped(outcome) => {
                locator::discard_staging(&staging);
                Ok(outcome)
            }
        }
    }

    /// `audio_acquired` -> `transcribed`.
    async fn transcribe(&self, tx: &mut Transition<'_>) -> Result<StepOutcome> {
        let collection = tx.collection;
        let name = &collection.name;
        let item = tx.item;

        if let Some(found) = self.locator.locate(name, item.index, ArtifactKind::Transcript)? {
            return Ok(tx.reached(Phase::Transcribed, &found.path, true));
        }
        if let Some(marker) = self.locator.find_no_content_marker(name, item.index) {
            let reason = format!("sentinel {}", marker.display());
            return Ok(tx.absent(Phase::Transcribed, PhaseOutcome::Resumed, &reason));
        }
        let Some(audio) = self.locator.locate(name, item.index, ArtifactKind::Audio)? else {
            return Ok(tx.blocked("audio artifact missing"));
        };
        if let Some(outcome) = self.over_budget(tx, Phase::Transcribed) {
            return Ok(outcome);
        }

        let target = self
            .locator
            .artifact_path(name, item.index, &item.title, ArtifactKind::Transcript, None);
        let staging = locator::staging_path(&target);
        locator::prepare_staging(&staging)?;

        let label = format!("{} transcribe", tx.key());
        let transcriber = &self.collaborators.transcriber;
        let report = self
            .scheduler
            .call(&label, || transcriber.transcribe(item, &audio.path, &staging))
            .await;

        match self.settle(tx, Phase::Transcribed, report) {
            Call::Done(()) => {
                locator::promote(&staging, &target)?;
                Ok(tx.reached(Phase::Transcribed, &target, false))
            }
            Call::Absent(reason) => {
                locator::discard_staging(&staging);
                self.mark_absent(tx, ArtifactKind::Transcript, Phase::Transcribed, &reason)
            }
            Call::Stopped(outcome) => {
                locator::discard_staging(&staging);
                Ok(outcome)
            }
        }
    }

    /// `downloaded` | `transcribed` -> `ai_extracted`.
    async fn extract(&self, tx: &mut Transition<'_>) -> Result<StepOutcome> {
        let collection = tx.collection;
        let name = &collection.name;
        let item = tx.item;

        if let Some(found) = self.locator.locate(name, item.index, ArtifactKind::Extracted)? {
            return Ok(tx.reached(Phase::AiExtracted, &found.path, true));
        }
        if let Some(marker) = self.locator.find_no_content_marker(name, item.index) {
            let reason = format!("sentinel {}", marker.display());
            return Ok(tx.absent(Phase::AiExtracted, PhaseOutcome::Resumed, &reason));
        }
        let Some(transcript) = self.locator.locate_transcript(name, item.index)? else {
            return Ok(tx.blocked("transcript artifact missing"));
        };
        if let Some(outcome) = self.over_budget(tx, Phase::AiExtracted) {
            return Ok(outcome);
        }

        let stem = transcript
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{:03}", item.index));
        let target = self
            .locator
            .dir(ArtifactKind::Extracted, name)
            .join(format!("{stem}{EXTRACTED_SUFFIX}"));
        let staging = locator::staging_path(&target);

        let label = format!("{} extract", tx.key());
        let extractor = &self.collaborators.extractor;
        let profile = &collection.profile;
        let report = self
            .scheduler
            .call(&label, || extractor.extract(item, &transcript.path, profile))
            .await;

        match self.settle(tx, Phase::AiExtracted, report) {
            Call::Done(content) => {
                let document = with_metadata(content, tx);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&staging, serde_json::to_string_pretty(&document)?)?;
                locator::promote(&staging, &target)?;
                Ok(tx.reached(Phase::AiExtracted, &target, false))
            }
            Call::Absent(reason) => self.mark_absent(tx, ArtifactKind::Extracted, Phase::AiExtracted, &reason),
            Call::Stopped(outcome) => Ok(outcome),
        }
    }

    fn mark_absent(
        &self,
        tx: &mut Transition<'_>,
        kind: ArtifactKind,
        phase: Phase,
        reason: &str,
    ) -> Result<StepOutcome> {
        let marker = self
            .locator
            .no_content_marker(&tx.collection.name, tx.item.index, kind, &tx.unit.item_id);
        self.locator.write_marker(&marker, reason)?;
        Ok(tx.absent(phase, PhaseOutcome::PermanentFailure, reason))
    }

    fn over_budget(&self, tx: &mut Transition<'_>, target: Phase) -> Option<StepOutcome> {
        let cap = self.scheduler.policy().max_phase_attempts;
        let attempts = tx.unit.attempts_at(target);
        if attempts < cap {
            return None;
        }
        tx.record(target, PhaseOutcome::Exhausted, format!("{} failed attempts", attempts));
        tx.unit.state = UnitState::FailedPermanent(target);
        tx.unit.touch();
        Some(StepOutcome::FailedPermanent(target))
    }

    /// Turn a scheduler report into records, attempt counts and a verdict.
    fn settle<T>(
        &self,
        tx: &mut Transition<'_>,
        target: Phase,
        report: CallReport<T, crate::collaborators::CollaboratorError>,
    ) -> Call<T> {
        for (class, message) in &report.absorbed {
            let outcome = match class {
                ErrorClass::RateLimited { .. } => PhaseOutcome::RateLimited,
                _ => PhaseOutcome::TransientFailure,
            };
            tx.record(target, outcome, message.clone());
        }
        if report.failed_attempts > 0 {
            tx.unit.record_failures(target, report.failed_attempts);
            tx.unit.touch();
        }

        match report.outcome {
            CallOutcome::Success(value) => {
                tx.breaker = Some((target, true));
                Call::Done(value)
            }
            CallOutcome::Permanent(err) => {
                tx.breaker = Some((target, true));
                Call::Absent(err.to_string())
            }
            CallOutcome::Exhausted(err) => {
                tx.breaker = Some((target, false));
                tx.record(target, PhaseOutcome::TransientFailure, err.to_string());
                tx.unit.last_error = Some(err.to_string());
                let attempts = tx.unit.attempts_at(target);
                if attempts >= self.scheduler.policy().max_phase_attempts {
                    tx.record(target, PhaseOutcome::Exhausted, format!("{} failed attempts", attempts));
                    tx.unit.state = UnitState::FailedPermanent(target);
                    return Call::Stopped(StepOutcome::FailedPermanent(target));
                }
                Call::Stopped(StepOutcome::Retry { attempts })
            }
            CallOutcome::Throttled(err) => {
                tx.breaker = Some((target, false));
                tx.record(target, PhaseOutcome::RateLimited, err.to_string());
                tx.unit.last_error = Some(err.to_string());
                tx.unit.touch();
                Call::Stopped(StepOutcome::Throttled)
            }
            CallOutcome::Cancelled => Call::Stopped(StepOutcome::Cancelled),
        }
    }
}

/// Attach identity metadata to extractor output so the gate can check it.
fn with_metadata(content: Value, tx: &Transition<'_>) -> Value {
    let metadata = json!({
        "collection": tx.collection.name.as_str(),
        "index": tx.unit.index,
        "item_id": tx.unit.item_id,
        "title": tx.unit.title,
        "route": tx.unit.route.map(|r| r.to_string()),
        "profile": tx.collection.profile.name(),
        "extracted_at": Utc::now().to_rfc3339(),
    });

    match content {
        Value::Object(mut map) => {
            match map.get_mut("metadata") {
                Some(Value::Object(existing)) => {
                    if let Value::Object(ours) = metadata {
                        existing.extend(ours);
                    }
                }
                _ => {
                    map.insert("metadata".to_string(), metadata);
                }
            }
            Value::Object(map)
        }
        other => json!({ "content": other, "metadata": metadata }),
    }
}
