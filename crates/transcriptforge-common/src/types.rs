//! Core type definitions for the per-unit state machine and artifacts.
//!
//! All enums serialize in snake_case so the registry document stays readable
//! by hand.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stage of a content unit. Declaration order is the monotonic progress order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Nothing attempted successfully yet.
    NotStarted,
    /// A subtitle track was fetched (subtitle route).
    Downloaded,
    /// The audio track was fetched (audio route).
    AudioAcquired,
    /// Speech-to-text produced a transcript (audio route).
    Transcribed,
    /// Structured content was extracted from the transcript.
    AiExtracted,
    /// The collection-wide verification gate passed for this unit.
    Verified,
    /// Intermediate artifacts were removed.
    CleanedUp,
}

impl Phase {
    /// Every phase, in progress order.
    pub const ALL: [Phase; 7] = [
        Phase::NotStarted,
        Phase::Downloaded,
        Phase::AudioAcquired,
        Phase::Transcribed,
        Phase::AiExtracted,
        Phase::Verified,
        Phase::CleanedUp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Downloaded => "downloaded",
            Self::AudioAcquired => "audio_acquired",
            Self::Transcribed => "transcribed",
            Self::AiExtracted => "ai_extracted",
            Self::Verified => "verified",
            Self::CleanedUp => "cleaned_up",
        }
    }

    /// Whether a transcript-equivalent artifact is expected to exist at this phase.
    pub fn has_transcript(&self) -> bool {
        matches!(self, Self::Downloaded) || *self >= Self::Transcribed
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        Phase::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("Unknown phase: {}", s))
    }
}

/// Current state of a unit: progressing, or parked in a terminal state that
/// remembers the phase it was blocked at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum UnitState {
    Active(Phase),
    /// Confirmed absence of content (a sentinel exists). Not an error.
    NoContent(Phase),
    /// Retry budget exhausted; excluded from automatic retries until reset.
    FailedPermanent(Phase),
}

impl UnitState {
    pub fn phase(&self) -> Phase {
        match self {
            Self::Active(p) | Self::NoContent(p) | Self::FailedPermanent(p) => *p,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active(_))
    }

    pub fn is_active(&self, phase: Phase) -> bool {
        *self == Self::Active(phase)
    }
}

impl Default for UnitState {
    fn default() -> Self {
        Self::Active(Phase::NotStarted)
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active(p) => write!(f, "{}", p),
            Self::NoContent(p) => write!(f, "no_content({})", p),
            Self::FailedPermanent(p) => write!(f, "failed_permanent({})", p),
        }
    }
}

/// How a unit obtains its transcript-equivalent. Decided once per unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscriptRoute {
    /// Platform subtitles are used directly.
    Subtitles,
    /// Audio is fetched and run through speech-to-text.
    Audio,
}

impl fmt::Display for TranscriptRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subtitles => write!(f, "subtitles"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Kind of durable artifact produced by one collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Subtitle track fetched from the hosting platform.
    Subtitle,
    /// Intermediate audio track; the target of cleanup.
    Audio,
    /// Speech-to-text output.
    Transcript,
    /// Structured content extracted by the language model.
    Extracted,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subtitle => "subtitle",
            Self::Audio => "audio",
            Self::Transcript => "transcript",
            Self::Extracted => "extracted",
        }
    }

    /// Whether this kind counts as a transcript-equivalent.
    pub fn is_transcript_equivalent(&self) -> bool {
        matches!(self, Self::Subtitle | Self::Transcript)
    }

    /// The phase a unit reaches when this artifact is produced.
    pub fn produces(&self) -> Phase {
        match self {
            Self::Subtitle => Phase::Downloaded,
            Self::Audio => Phase::AudioAcquired,
            Self::Transcript => Phase::Transcribed,
            Self::Extracted => Phase::AiExtracted,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
