use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use transcriptforge_common::{CollectionName, Phase, SessionId, TranscriptRoute, UnitState};

/// One tracked item of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentUnit {
    /// 1-based position in the collection's catalog
    pub index: u32,
    pub item_id: String,
    pub title: String,

    #[serde(default)]
    pub state: UnitState,

    /// Decided the first time the unit is evaluated, never afterwards
    #[serde(default)]
    pub route: Option<TranscriptRoute>,

    /// Failed attempts per phase
    #[serde(default)]
    pub attempts: BTreeMap<Phase, u32>,

    #[serde(default)]
    pub last_error: Option<String>,

    pub last_updated: DateTime<Utc>,
}

impl ContentUnit {
    pub fn new(index: u32, item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            index,
            item_id: item_id.into(),
            title: title.into(),
            state: UnitState::default(),
            route: None,
            attempts: BTreeMap::new(),
            last_error: None,
            last_updated: Utc::now(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    pub fn attempts_at(&self, phase: Phase) -> u32 {
        self.attempts.get(&phase).copied().unwrap_or(0)
    }

    /// Add `count` failed attempts at `phase`, returning the new total.
    pub fn record_failures(&mut self, phase: Phase, count: u32) -> u32 {
        let entry = self.attempts.entry(phase).or_insert(0);
        *entry += count;
        *entry
    }

    /// Move to `state`, clearing the last error.
    pub fn advance(&mut self, state: UnitState) {
        self.state = state;
        self.last_error = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }
}

/// Result of one attempt, as written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseOutcome {
    Success,
    /// The next artifact was already on disk; no collaborator call was made.
    Resumed,
    TransientFailure,
    RateLimited,
    /// Confirmed absence of content; a sentinel was written.
    PermanentFailure,
    /// Retry budget exhausted; the unit is now failed_permanent.
    Exhausted,
    Verified,
    CleanedUp,
    /// Operator-triggered re-processing.
    Reset,
}

impl PhaseOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Resumed => "resumed",
            Self::TransientFailure => "transient_failure",
            Self::RateLimited => "rate_limited",
            Self::PermanentFailure => "permanent_failure",
            Self::Exhausted => "exhausted",
            Self::Verified => "verified",
            Self::CleanedUp => "cleaned_up",
            Self::Reset => "reset",
        }
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable audit-log entry. Appended on every attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub index: u32,
    /// Phase the attempt was made from (or reached, for success records)
    pub phase: Phase,
    pub outcome: PhaseOutcome,
    pub timestamp: DateTime<Utc>,
    pub session: SessionId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl PhaseRecord {
    pub fn new(session: SessionId, index: u32, phase: Phase, outcome: PhaseOutcome) -> Self {
        Self {
            index,
            phase,
            outcome,
            timestamp: Utc::now(),
            session,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Collection-level stage the orchestrator last worked on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Download,
    Transcribe,
    Extract,
    Verify,
    Cleanup,
    Complete,
}

impl Stage {
    /// Stages in processing order, excluding the `Complete` marker.
    pub const PIPELINE: [Stage; 5] = [
        Stage::Download,
        Stage::Transcribe,
        Stage::Extract,
        Stage::Verify,
        Stage::Cleanup,
    ];

    /// The stage that will next act on a unit in `state`, if any.
    ///
    /// Units not yet in the registry belong to `Download`. Terminal units and
    /// cleaned-up units belong to no stage.
    pub fn for_state(state: Option<&UnitState>) -> Option<Stage> {
        match state.copied().unwrap_or_default() {
            UnitState::Active(Phase::NotStarted) => Some(Stage::Download),
            UnitState::Active(Phase::AudioAcquired) => Some(Stage::Transcribe),
            UnitState::Active(Phase::Downloaded | Phase::Transcribed) => Some(Stage::Extract),
            UnitState::Active(Phase::AiExtracted) => Some(Stage::Verify),
            UnitState::Active(Phase::Verified) => Some(Stage::Cleanup),
            UnitState::Active(Phase::CleanedUp) | UnitState::NoContent(_) | UnitState::FailedPermanent(_) => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Transcribe => "transcribe",
            Self::Extract => "extract",
            Self::Verify => "verify",
            Self::Cleanup => "cleanup",
            Self::Complete => "complete",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStats {
    pub total: u32,

    /// Units per state label (`transcribed`, `no_content(transcribed)`, ...)
    #[serde(default)]
    pub per_phase: BTreeMap<String, u32>,

    #[serde(default)]
    pub verified: bool,

    #[serde(default)]
    pub cleanup_done: bool,
}

impl CollectionStats {
    /// Recount units per state, keeping the verification and cleanup flags.
    pub fn tally<'a>(&self, total: u32, units: impl IntoIterator<Item = &'a ContentUnit>) -> Self {
        let mut per_phase = BTreeMap::new();
        for unit in units {
            *per_phase.entry(unit.state.to_string()).or_insert(0) += 1;
        }
        Self {
            total,
            per_phase,
            verified: self.verified,
            cleanup_done: self.cleanup_done,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionRecord {
    #[serde(default)]
    pub phase: Stage,

    #[serde(default)]
    pub stats: CollectionStats,

    #[serde(default)]
    pub units: BTreeMap<u32, ContentUnit>,

    /// Append-only attempt log
    #[serde(default)]
    pub history: Vec<PhaseRecord>,

    pub last_updated: DateTime<Utc>,
}

impl Default for CollectionRecord {
    fn default() -> Self {
        Self {
            phase: Stage::default(),
            stats: CollectionStats::default(),
            units: BTreeMap::new(),
            history: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

impl CollectionRecord {
    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// Attempt log entries for one unit, oldest first.
    pub fn history_for(&self, index: u32) -> impl Iterator<Item = &PhaseRecord> {
        self.history.iter().filter(move |r| r.index == index)
    }
}

/// The whole durable document: one record per collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegistryDocument {
    pub collections: BTreeMap<CollectionName, CollectionRecord>,
}
