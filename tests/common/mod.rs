//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which owns a temporary storage root, a config
//! with one `demo` collection, scriptable fake collaborators and a manual
//! clock, and builds an [`Orchestrator`] over them.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use transcriptforge::collaborators::{
    Catalog, CollaboratorError, Collaborators, Downloader, Extractor, ItemDescriptor, SubtitleFetch,
    Transcriber,
};
use transcriptforge::config::{CollectionConfig, Config, ExtractionProfile, StorageConfig};
use transcriptforge::locator::ArtifactLocator;
use transcriptforge::orchestrator::Orchestrator;
use transcriptforge::registry::{ContentUnit, Registry};
use transcriptforge::scheduler::ManualClock;
use transcriptforge_common::{ArtifactKind, CollectionName, Result};

/// Collaborators whose behaviour per item index is set by the test.
#[derive(Default)]
pub struct FakeCollaborators {
    pub items: Mutex<Vec<ItemDescriptor>>,
    /// Items without subtitles
    pub no_subs: Mutex<HashSet<u32>>,
    /// Items whose audio is unavailable
    pub no_audio: Mutex<HashSet<u32>>,
    /// Remaining extraction timeouts per item
    pub extract_timeouts: Mutex<HashMap<u32, u32>>,
    /// Items whose extraction always fails
    pub extract_down: Mutex<HashSet<u32>>,
    /// Every call made, as `"<operation> <index>"`
    pub calls: Mutex<Vec<String>>,
}

impl FakeCollaborators {
    pub fn calls_to(&self, operation: &str) -> Vec<u32> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| c.strip_prefix(operation)?.trim().parse().ok())
            .collect()
    }

    fn log(&self, operation: &str, index: u32) {
        self.calls.lock().push(format!("{} {}", operation, index));
    }
}

fn write(path: &Path, body: impl AsRef<[u8]>) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
}

#[async_trait]
impl Catalog for FakeCollaborators {
    async fn items(&self, _collection: &CollectionConfig) -> Result<Vec<ItemDescriptor>> {
        Ok(self.items.lock().clone())
    }
}

#[async_trait]
impl Downloader for FakeCollaborators {
    async fn fetch_subtitle(
        &self,
        item: &ItemDescriptor,
        staging: &Path,
    ) -> std::result::Result<SubtitleFetch, CollaboratorError> {
        self.log("subtitle", item.index);
        if self.no_subs.lock().contains(&item.index) {
            return Ok(SubtitleFetch::NoSubtitles);
        }
        write(staging, json!({ "events": [{ "segs": [{ "utf8": item.title }] }] }).to_string());
        Ok(SubtitleFetch::Fetched {
            extension: "json3".to_string(),
        })
    }

    async fn fetch_audio(&self, item: &ItemDescriptor, staging: &Path) -> std::result::Result<String, CollaboratorError> {
        self.log("audio", item.index);
        if self.no_audio.lock().contains(&item.index) {
            return Err(CollaboratorError::ContentAbsent("video unavailable".into()));
        }
        write(staging, vec![7u8; 1000]);
        Ok("mp3".to_string())
    }
}

#[async_trait]
impl Transcriber for FakeCollaborators {
    async fn transcribe(
        &self,
        item: &ItemDescriptor,
        _audio: &Path,
        staging: &Path,
    ) -> std::result::Result<(), CollaboratorError> {
        self.log("transcribe", item.index);
        write(staging, format!("1\n00:00:00,000 --> 00:00:02,000\n{}\n", item.title));
        Ok(())
    }
}

#[async_trait]
impl Extractor for FakeCollaborators {
    async fn extract(
        &self,
        item: &ItemDescriptor,
        _transcript: &Path,
        profile: &ExtractionProfile,
    ) -> std::result::Result<Value, CollaboratorError> {
        self.log("extract", item.index);
        if self.extract_down.lock().contains(&item.index) {
            return Err(CollaboratorError::Network("connection refused".into()));
        }
        if let Some(left) = self.extract_timeouts.lock().get_mut(&item.index) {
            if *left > 0 {
                *left -= 1;
                return Err(CollaboratorError::Timeout(Duration::from_secs(1200)));
            }
        }
        Ok(json!({ "summary": format!("summary of {}", item.title), "profile": profile.name() }))
    }
}

pub struct TestHarness {
    pub dir: TempDir,
    pub config: Config,
    pub fake: Arc<FakeCollaborators>,
    pub clock: Arc<ManualClock>,
    pub cancel: CancellationToken,
}

impl TestHarness {
    /// A `demo` collection of `total` items, `vid1..` titled `Lesson 1..`.
    pub fn demo(total: u32, audio_fallback: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.storage = StorageConfig::at(dir.path());
        config.collections.push(CollectionConfig {
            name: "demo".into(),
            display: Some("Demo".into()),
            total,
            priority: 0,
            catalog: "demo.json".into(),
            audio_fallback,
            profile: ExtractionProfile::default(),
        });

        let fake = FakeCollaborators::default();
        *fake.items.lock() = (1..=total)
            .map(|i| ItemDescriptor::new(i, format!("vid{i}"), format!("Lesson {i}")))
            .collect();

        Self {
            dir,
            config,
            fake: Arc::new(fake),
            clock: Arc::new(ManualClock::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// A fresh orchestrator, as a new process invocation would build it.
    pub fn orchestrator(&self) -> Orchestrator {
        let collaborators = Collaborators {
            catalog: self.fake.clone(),
            downloader: self.fake.clone(),
            transcriber: self.fake.clone(),
            extractor: self.fake.clone(),
        };
        Orchestrator::new(self.config.clone(), collaborators, self.clock.clone(), self.cancel.clone())
    }

    pub fn collection(&self) -> &CollectionConfig {
        &self.config.collections[0]
    }

    pub fn name(&self) -> CollectionName {
        self.collection().name.clone()
    }

    pub fn registry(&self) -> Registry {
        Registry::open(self.config.storage.registry_path())
    }

    pub fn locator(&self) -> ArtifactLocator {
        ArtifactLocator::new(self.config.storage.clone())
    }

    pub fn unit(&self, index: u32) -> ContentUnit {
        self.registry().unit(&self.name(), index).unwrap().unwrap()
    }

    pub fn registry_bytes(&self) -> Vec<u8> {
        std::fs::read(self.config.storage.registry_path()).unwrap()
    }

    /// Put an artifact on disk as an earlier run would have left it.
    pub fn seed(&self, index: u32, kind: ArtifactKind, body: &str) -> PathBuf {
        let path = self
            .locator()
            .artifact_path(&self.name(), index, &format!("Lesson {index}"), kind, None);
        write(&path, body);
        path
    }
}
