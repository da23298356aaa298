//! Narrow interfaces to the external collaborators the pipeline drives.
//!
//! The mechanics of fetching subtitles and audio, running speech-to-text and
//! invoking a language model live outside this crate. The engine only sees
//! these traits; the shipped implementations read a JSON manifest and run
//! configured external programs.

mod catalog;
mod command;
mod template;

pub use catalog::ManifestCatalog;
pub use command::CommandTools;
pub use template::TemplateContext;

use crate::config::{CollectionConfig, ExtractionProfile};
use crate::scheduler::{Classify, ErrorClass};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use transcriptforge_common::Error;

/// One entry of a collection's catalog manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemDescriptor {
    /// 1-based position in the collection
    pub index: u32,

    /// Identifier on the hosting platform
    #[serde(alias = "id", alias = "video_id")]
    pub item_id: String,

    #[serde(default)]
    pub title: String,
}

impl ItemDescriptor {
    pub fn new(index: u32, item_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            index,
            item_id: item_id.into(),
            title: title.into(),
        }
    }
}

/// Failure reported by a collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("content absent: {0}")]
    ContentAbsent(String),

    #[error("{0}")]
    Failed(String),
}

impl Classify for CollaboratorError {
    fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Failed(_) => ErrorClass::Transient,
            Self::RateLimited { retry_after } => ErrorClass::RateLimited {
                retry_after: *retry_after,
            },
            Self::ContentAbsent(_) => ErrorClass::Permanent,
        }
    }

    fn timed_out(after: Duration) -> Self {
        Self::Timeout(after)
    }
}

impl From<CollaboratorError> for Error {
    fn from(err: CollaboratorError) -> Self {
        match err {
            CollaboratorError::Network(msg) | CollaboratorError::Failed(msg) => Error::TransientNetwork(msg),
            CollaboratorError::Timeout(after) => Error::Timeout(after),
            CollaboratorError::RateLimited { retry_after } => Error::RateLimited { retry_after },
            CollaboratorError::ContentAbsent(msg) => Error::ContentAbsent(msg),
        }
    }
}

/// Result of asking for a subtitle track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtitleFetch {
    /// Written to the staging path; the track has this extension.
    Fetched { extension: String },
    /// The item has no subtitles in any supported language.
    NoSubtitles,
}

/// Lists the items of a collection.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn items(&self, collection: &CollectionConfig) -> transcriptforge_common::Result<Vec<ItemDescriptor>>;
}

#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch_subtitle(
        &self,
        item: &ItemDescriptor,
        staging: &Path,
    ) -> Result<SubtitleFetch, CollaboratorError>;

    /// Write the audio track to `staging` and return its extension.
    async fn fetch_audio(&self, item: &ItemDescriptor, staging: &Path) -> Result<String, CollaboratorError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        item: &ItemDescriptor,
        audio: &Path,
        staging: &Path,
    ) -> Result<(), CollaboratorError>;
}

#[async_trait]
pub trait Extractor: Send + Sync {
    async fn extract(
        &self,
        item: &ItemDescriptor,
        transcript: &Path,
        profile: &ExtractionProfile,
    ) -> Result<serde_json::Value, CollaboratorError>;
}

/// The full set of collaborators one engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn Catalog>,
    pub downloader: Arc<dyn Downloader>,
    pub transcriber: Arc<dyn Transcriber>,
    pub extractor: Arc<dyn Extractor>,
}

impl Collaborators {
    /// Manifest catalog plus the configured external programs.
    pub fn from_tools(catalog: ManifestCatalog, tools: CommandTools) -> Self {
        let tools = Arc::new(tools);
        Self {
            catalog: Arc::new(catalog),
            downloader: tools.clone(),
            transcriber: tools.clone(),
            extractor: tools,
        }
    }
}
