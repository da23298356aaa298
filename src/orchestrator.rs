//! Orchestrator Loop: drives collections through the pipeline stages.
//!
//! Collections are taken in descending priority, stages in pipeline order,
//! items in ascending index. A stage is left once nothing is waiting for it,
//! the invocation's item limit is spent, or a sweep over every pending item
//! made no progress. Each pass takes the next batch of items not yet tried in
//! the current sweep, so a failing item never holds back the ones after it.

use crate::cleanup::{CleanupExecutor, CleanupReport};
use crate::collaborators::{Collaborators, CommandTools, ItemDescriptor, ManifestCatalog};
use crate::config::{CollectionConfig, Config};
use crate::engine::{PhaseEngine, StepOutcome};
use crate::locator::ArtifactLocator;
use crate::progress::{ProgressAggregator, ProgressReport};
use crate::registry::{ContentUnit, Registry, Stage};
use crate::scheduler::{Clock, RetryScheduler, SystemClock};
use crate::verify::{VerificationGate, VerificationResult};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use transcriptforge_common::{CollectionName, Error, Phase, Result};

/// What one worker process is responsible for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Role {
    /// Every stage, then verification and cleanup.
    #[default]
    All,
    /// Subtitle/audio acquisition and transcription.
    Download,
    /// AI extraction only.
    Extract,
    /// Read-only periodic status.
    Monitor,
}

impl Role {
    pub fn stages(&self) -> &'static [Stage] {
        match self {
            Self::All => &[Stage::Download, Stage::Transcribe, Stage::Extract],
            Self::Download => &[Stage::Download, Stage::Transcribe],
            Self::Extract => &[Stage::Extract],
            Self::Monitor => &[],
        }
    }

    /// Tool commands this role needs for `collections`.
    pub fn required_tools(&self, collections: &[&CollectionConfig]) -> Vec<&'static str> {
        let audio = collections.iter().any(|c| c.audio_fallback);
        let mut tools = Vec::new();
        if matches!(self, Self::All | Self::Download) {
            tools.push("subtitle_command");
            if audio {
                tools.extend(["audio_command", "transcribe_command"]);
            }
        }
        if matches!(self, Self::All | Self::Extract) {
            tools.push("extract_command");
        }
        tools
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub role: Role,
    /// Items to process in this invocation, across all collections
    pub limit: Option<usize>,
    /// Delete audio after a passing verification instead of a dry run
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerificationSummary {
    pub passed: bool,
    pub issues: Vec<String>,
}

impl From<&VerificationResult> for VerificationSummary {
    fn from(result: &VerificationResult) -> Self {
        Self {
            passed: result.passed,
            issues: result.issues.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionSummary {
    pub collection: CollectionName,
    pub advanced: usize,
    pub resumed: usize,
    pub no_content: usize,
    pub failed: usize,
    pub retried: usize,
    pub throttled: usize,
    pub blocked: usize,
    /// Items still waiting for one of the role's stages
    pub remaining: usize,
    pub halted: Option<String>,
    pub verification: Option<VerificationSummary>,
    pub cleanup: Option<CleanupReport>,
}

impl CollectionSummary {
    fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            ..Default::default()
        }
    }

    fn tally(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Advanced { resumed: true, .. } => self.resumed += 1,
            StepOutcome::Advanced { .. } => self.advanced += 1,
            StepOutcome::NoContent(_) => self.no_content += 1,
            StepOutcome::FailedPermanent(_) => self.failed += 1,
            StepOutcome::Retry { .. } => self.retried += 1,
            StepOutcome::Throttled => self.throttled += 1,
            StepOutcome::Blocked(_) => self.blocked += 1,
            StepOutcome::Idle | StepOutcome::Cancelled => {}
        }
    }

    /// Nothing left to do for the role and no halt.
    pub fn is_stable(&self) -> bool {
        self.halted.is_none() && self.remaining == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub collections: Vec<CollectionSummary>,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn is_stable(&self) -> bool {
        !self.cancelled && self.collections.iter().all(CollectionSummary::is_stable)
    }
}

pub struct Orchestrator {
    config: Config,
    engine: PhaseEngine,
    gate: VerificationGate,
    cleanup: CleanupExecutor,
    progress: ProgressAggregator,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let registry = Arc::new(Registry::open(config.storage.registry_path()));
        let locator = ArtifactLocator::new(config.storage.clone());
        let scheduler = Arc::new(RetryScheduler::new(
            config.retry.clone(),
            config.pacing.batch_size,
            clock,
            cancel.clone(),
        ));

        Self {
            gate: VerificationGate::new(registry.clone(), locator.clone(), config.verification.clone()),
            cleanup: CleanupExecutor::new(registry.clone(), locator.clone()),
            progress: ProgressAggregator::new(registry.clone(), locator.clone()),
            engine: PhaseEngine::new(registry, locator, scheduler, collaborators),
            config,
            cancel,
        }
    }

    /// Orchestrator using the manifest catalog, the configured external
    /// programs and the wall clock.
    pub fn from_config(config: Config, cancel: CancellationToken) -> Self {
        let catalog = ManifestCatalog::new(&config.storage.root);
        let tools = CommandTools::new(config.tools.clone(), config.retry.call_timeout());
        let clock = Arc::new(SystemClock::new(cancel.clone()));
        Self::new(config, Collaborators::from_tools(catalog, tools), clock, cancel)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        self.engine.registry()
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    /// Drive the selected collections through the role's stages.
    ///
    /// A collection halted by its circuit breaker is reported in the summary
    /// and the remaining collections still run. Registry failures abort.
    pub async fn run(&self, selector: &str, options: &RunOptions) -> Result<RunSummary> {
        let collections = self.config.select(selector)?;
        let mut budget = options.limit;
        let mut summary = RunSummary::default();

        for (i, collection) in collections.iter().enumerate() {
            if self.cancel.is_cancelled() || budget == Some(0) {
                break;
            }
            if i > 0 {
                self.engine
                    .scheduler()
                    .clock()
                    .sleep(self.config.pacing.collection_delay())
                    .await;
            }

            tracing::info!(
                collection = %collection.name,
                role = ?options.role,
                "Processing {}",
                collection.display_name()
            );
            let result = self.run_collection(collection, options, &mut budget).await?;
            summary.collections.push(result);
        }

        summary.cancelled = self.cancel.is_cancelled();
        Ok(summary)
    }

    async fn run_collection(
        &self,
        collection: &CollectionConfig,
        options: &RunOptions,
        budget: &mut Option<usize>,
    ) -> Result<CollectionSummary> {
        let name = &collection.name;
        let mut summary = CollectionSummary::new(name.clone());

        let items = self.engine.collaborators().catalog.items(collection).await?;
        if items.len() < collection.total as usize {
            tracing::warn!(
                collection = %name,
                "Catalog lists {} of {} items",
                items.len(),
                collection.total
            );
        }

        for &stage in options.role.stages() {
            if self.cancel.is_cancelled() || *budget == Some(0) {
                break;
            }
            match self.drive_stage(collection, &items, stage, budget, &mut summary).await {
                Ok(()) => {}
                Err(e @ Error::CircuitOpen { .. }) => {
                    tracing::error!(collection = %name, "Halting collection: {}", e);
                    summary.halted = Some(e.to_string());
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        let registry = self.registry();
        let record = registry.record(name)?.unwrap_or_default();
        registry.set_stats(name, record.stats.tally(collection.total, record.units.values()))?;

        for &stage in options.role.stages() {
            summary.remaining += self.progress.pending_for(collection, &items, stage)?.len();
        }

        if options.role == Role::All
            && summary.halted.is_none()
            && summary.remaining == 0
            && !self.cancel.is_cancelled()
        {
            self.finish(collection, options.confirm, &mut summary)?;
        }

        tracing::info!(
            collection = %name,
            "Done: {} advanced, {} resumed, {} no content, {} failed, {} retrying, {} remaining",
            summary.advanced,
            summary.resumed,
            summary.no_content,
            summary.failed,
            summary.retried,
            summary.remaining
        );
        Ok(summary)
    }

    async fn drive_stage(
        &self,
        collection: &CollectionConfig,
        items: &[ItemDescriptor],
        stage: Stage,
        budget: &mut Option<usize>,
        summary: &mut CollectionSummary,
    ) -> Result<()> {
        let scheduler = self.engine.scheduler();
        let mut entered = false;
        // Items attempted since the current sweep began
        let mut tried: HashSet<u32> = HashSet::new();
        let mut sweep_progressed = false;

        loop {
            let pending = self.progress.pending_for(collection, items, stage)?;
            if pending.is_empty() {
                tracing::debug!(collection = %collection.name, stage = %stage, "Stage exhausted");
                return Ok(());
            }
            if !entered {
                self.registry().set_phase(&collection.name, stage)?;
                tracing::info!(
                    collection = %collection.name,
                    stage = %stage,
                    "{} item(s) pending",
                    pending.len()
                );
                entered = true;
            }

            let untried: Vec<&ItemDescriptor> = pending.iter().filter(|item| !tried.contains(&item.index)).collect();
            if untried.is_empty() {
                if !sweep_progressed {
                    tracing::info!(
                        collection = %collection.name,
                        stage = %stage,
                        "No progress in a full sweep; moving on"
                    );
                    return Ok(());
                }
                tried.clear();
                sweep_progressed = false;
                continue;
            }

            for item in untried.into_iter().take(scheduler.batch_size()) {
                if self.cancel.is_cancelled() || *budget == Some(0) {
                    return Ok(());
                }

                let outcome = self.engine.advance(collection, item).await?;
                summary.tally(&outcome);
                if outcome == StepOutcome::Cancelled {
                    return Ok(());
                }
                if let Some(left) = budget.as_mut() {
                    *left = left.saturating_sub(1);
                }
                tried.insert(item.index);
                sweep_progressed |= outcome.made_progress();

                let called_out = !matches!(
                    outcome,
                    StepOutcome::Advanced { resumed: true, .. } | StepOutcome::Idle | StepOutcome::Blocked(_)
                );
                if called_out {
                    scheduler.clock().sleep(self.config.pacing.item_delay()).await;
                }
            }
        }
    }

    /// Verification and cleanup once every unit is past extraction.
    fn finish(&self, collection: &CollectionConfig, confirm: bool, summary: &mut CollectionSummary) -> Result<()> {
        let name = &collection.name;
        let result = self.gate.verify(collection)?;
        summary.verification = Some(VerificationSummary::from(&result));
        if !result.passed {
            self.registry().set_phase(name, Stage::Verify)?;
            return Ok(());
        }

        let report = self.cleanup.cleanup(result.into_pass()?, confirm)?;
        let stage = if confirm && report.is_complete() {
            Stage::Complete
        } else {
            Stage::Cleanup
        };
        self.registry().set_phase(name, stage)?;
        summary.cleanup = Some(report);
        Ok(())
    }

    pub fn verify(&self, collection: &CollectionConfig) -> Result<VerificationResult> {
        self.gate.verify(collection)
    }

    /// Fresh verification followed by cleanup, as one operation.
    pub fn cleanup(&self, collection: &CollectionConfig, confirm: bool) -> Result<CleanupReport> {
        let report = self.cleanup.verify_and_cleanup(&self.gate, collection, confirm)?;
        if confirm && report.is_complete() {
            self.registry().set_phase(&collection.name, Stage::Complete)?;
        }
        Ok(report)
    }

    pub fn status(&self, selector: &str) -> Result<ProgressReport> {
        let collections = self.config.select(selector)?;
        self.progress.report(&collections)
    }

    /// Emit a progress report every `interval` until cancelled.
    pub async fn monitor<F>(&self, selector: &str, interval: Duration, mut emit: F) -> Result<()>
    where
        F: FnMut(&ProgressReport),
    {
        let collections = self.config.select(selector)?;
        let clock = self.engine.scheduler().clock();
        while !self.cancel.is_cancelled() {
            emit(&self.progress.report(&collections)?);
            clock.sleep(interval).await;
        }
        Ok(())
    }

    /// Operator re-processing of one unit.
    ///
    /// Removes the unit's sentinels so the next run calls the collaborators
    /// again instead of re-reading the recorded absence.
    pub fn reset(&self, collection: &str, index: u32, to: Phase) -> Result<ContentUnit> {
        if to > Phase::AiExtracted {
            return Err(Error::invalid_input(format!(
                "cannot reset to {}; choose a phase up to {}",
                to,
                Phase::AiExtracted
            )));
        }
        let collection = self.config.collection(collection)?;
        let unit = self.registry().reset_unit(&collection.name, index, to)?;
        let removed = self.engine.locator().remove_markers(&collection.name, index)?;
        tracing::info!(
            collection = %collection.name,
            index,
            "Reset to {} ({} sentinel(s) removed)",
            to,
            removed
        );
        Ok(unit)
    }
}
