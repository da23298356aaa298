use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use transcriptforge_common::{ArtifactKind, CollectionName};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub pacing: PacingConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub tools: ToolsConfig,

    #[serde(default)]
    pub collections: Vec<CollectionConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Base directory holding the registry and every artifact directory
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Registry document, relative to `root` unless absolute
    #[serde(default = "default_registry_file")]
    pub registry_file: PathBuf,

    #[serde(default = "default_transcripts_dir")]
    pub transcripts_dir: String,

    #[serde(default = "default_audio_dir")]
    pub audio_dir: String,

    #[serde(default = "default_processed_dir")]
    pub processed_dir: String,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_registry_file() -> PathBuf {
    PathBuf::from("processing_state.json")
}

fn default_transcripts_dir() -> String {
    "transcripts".to_string()
}

fn default_audio_dir() -> String {
    "audio".to_string()
}

fn default_processed_dir() -> String {
    "processed".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            registry_file: default_registry_file(),
            transcripts_dir: default_transcripts_dir(),
            audio_dir: default_audio_dir(),
            processed_dir: default_processed_dir(),
        }
    }
}

impl StorageConfig {
    /// Storage root with all defaults at `root`.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.root.join(&self.registry_file)
    }

    /// Directory holding artifacts of `kind` for one collection.
    pub fn artifact_dir(&self, kind: ArtifactKind, collection: &CollectionName) -> PathBuf {
        let base = match kind {
            ArtifactKind::Subtitle | ArtifactKind::Transcript => &self.transcripts_dir,
            ArtifactKind::Audio => &self.audio_dir,
            ArtifactKind::Extracted => &self.processed_dir,
        };
        self.root.join(base).join(collection.as_str())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Attempts per external call before it is reported as a terminal failure
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles per attempt
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,

    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Pause after the collaborator signals throttling
    #[serde(default = "default_rate_limit_pause_secs")]
    pub rate_limit_pause_secs: u64,

    /// Failed attempts a unit may accumulate in one phase before it is marked failed_permanent
    #[serde(default = "default_max_phase_attempts")]
    pub max_phase_attempts: u32,

    /// Consecutive cross-item failures that trip the circuit breaker
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    #[serde(default = "default_circuit_breaker_pause_secs")]
    pub circuit_breaker_pause_secs: u64,

    /// Trips tolerated per session before the collection is halted
    #[serde(default = "default_circuit_breaker_max_trips")]
    pub circuit_breaker_max_trips: u32,

    /// Upper bound for any single external call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    120
}
fn default_rate_limit_pause_secs() -> u64 {
    300
}
fn default_max_phase_attempts() -> u32 {
    5
}
fn default_circuit_breaker_threshold() -> u32 {
    3
}
fn default_circuit_breaker_pause_secs() -> u64 {
    300
}
fn default_circuit_breaker_max_trips() -> u32 {
    2
}
fn default_call_timeout_secs() -> u64 {
    1200
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            rate_limit_pause_secs: default_rate_limit_pause_secs(),
            max_phase_attempts: default_max_phase_attempts(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_pause_secs: default_circuit_breaker_pause_secs(),
            circuit_breaker_max_trips: default_circuit_breaker_max_trips(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_secs(self.base_delay_secs)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn rate_limit_pause(&self) -> Duration {
        Duration::from_secs(self.rate_limit_pause_secs)
    }

    pub fn circuit_breaker_pause(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_pause_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PacingConfig {
    /// Delay between consecutive items hitting an external service
    #[serde(default = "default_item_delay_secs")]
    pub item_delay_secs: u64,

    /// Delay before moving on to the next collection
    #[serde(default = "default_collection_delay_secs")]
    pub collection_delay_secs: u64,

    /// Items per stage pass; halved for the session whenever a rate limit is hit
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

fn default_item_delay_secs() -> u64 {
    3
}
fn default_collection_delay_secs() -> u64 {
    30
}
fn default_batch_size() -> usize {
    50
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            item_delay_secs: default_item_delay_secs(),
            collection_delay_secs: default_collection_delay_secs(),
            batch_size: default_batch_size(),
        }
    }
}

impl PacingConfig {
    pub fn item_delay(&self) -> Duration {
        Duration::from_secs(self.item_delay_secs)
    }

    pub fn collection_delay(&self) -> Duration {
        Duration::from_secs(self.collection_delay_secs)
    }
}

/// How an artifact file is tied to the unit it claims to belong to.
///
/// File names carry an index prefix; extracted content also records the
/// item id it was produced from. When the two disagree (a stale file with a
/// reused index), this policy decides which one wins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityPolicy {
    /// Trust the index prefix alone.
    IndexPrefix,
    /// Trust the recorded item id; the index prefix only locates the file.
    ItemId,
    /// Both must agree; a mismatch is a verification issue.
    #[default]
    Both,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VerificationConfig {
    #[serde(default)]
    pub identity: IdentityPolicy,

    /// Let units with a confirmed absence of content pass the gate
    #[serde(default)]
    pub allow_absent: bool,

    /// Top-level keys every extracted-content document must carry
    #[serde(default = "default_required_fields")]
    pub required_fields: Vec<String>,
}

fn default_required_fields() -> Vec<String> {
    vec!["metadata".to_string()]
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            identity: IdentityPolicy::default(),
            allow_absent: false,
            required_fields: default_required_fields(),
        }
    }
}

/// An external program invocation. Arguments may contain `{item_id}`,
/// `{title}`, `{index}`, `{input}`, `{output}` and `{profile}` placeholders.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandSpec {
    pub program: String,

    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub subtitle_command: Option<CommandSpec>,

    #[serde(default)]
    pub audio_command: Option<CommandSpec>,

    #[serde(default)]
    pub transcribe_command: Option<CommandSpec>,

    #[serde(default)]
    pub extract_command: Option<CommandSpec>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectionConfig {
    pub name: CollectionName,

    #[serde(default)]
    pub display: Option<String>,

    /// Number of items the collection is known to contain
    pub total: u32,

    /// Higher priorities are processed first
    #[serde(default)]
    pub priority: i32,

    /// JSON manifest listing the collection's items
    pub catalog: PathBuf,

    /// Fall back to audio + speech-to-text when an item has no subtitles
    #[serde(default = "default_audio_fallback")]
    pub audio_fallback: bool,

    pub profile: ExtractionProfile,
}

fn default_audio_fallback() -> bool {
    true
}

impl CollectionConfig {
    pub fn display_name(&self) -> &str {
        self.display.as_deref().unwrap_or(self.name.as_str())
    }
}

/// What the extractor should pull out of a collection's transcripts.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExtractionProfile {
    /// Teaching lessons: concepts, key terms and summary.
    Lesson {
        #[serde(default = "default_language")]
        language: String,
    },
    /// Question-and-answer sessions.
    QuestionAnswer {
        #[serde(default = "default_min_questions")]
        min_questions: u32,
    },
    /// Insight/revelation highlights.
    Revelation {
        #[serde(default = "default_max_items")]
        max_items: u32,
    },
    /// Guided meditations.
    Meditation {
        #[serde(default)]
        include_steps: bool,
    },
}

fn default_language() -> String {
    "es".to_string()
}
fn default_min_questions() -> u32 {
    3
}
fn default_max_items() -> u32 {
    10
}

impl ExtractionProfile {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Lesson { .. } => "lesson",
            Self::QuestionAnswer { .. } => "question_answer",
            Self::Revelation { .. } => "revelation",
            Self::Meditation { .. } => "meditation",
        }
    }
}

impl Default for ExtractionProfile {
    fn default() -> Self {
        Self::Lesson {
            language: default_language(),
        }
    }
}
