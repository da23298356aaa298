//! Content Unit Registry: the single durable document holding every unit's
//! phase, attempt counts and audit log.
//!
//! Several worker processes share the document. Every mutation takes an
//! exclusive advisory lock on a sibling `.lock` file, re-reads the document,
//! applies the change and atomically replaces the file, so concurrent workers
//! cannot overwrite each other's progress. An unreadable document is never
//! reinitialized.

mod types;

pub use types::*;

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use transcriptforge_common::{CollectionName, Error, Phase, Result, SessionId, UnitState};

#[cfg(unix)]
type LockGuard = nix::fcntl::Flock<File>;

#[cfg(not(unix))]
type LockGuard = File;

pub struct Registry {
    path: PathBuf,
    lock_path: PathBuf,
    session: SessionId,
    /// Serializes writers within this process; the file lock covers other processes.
    write_lock: Mutex<()>,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);

        Self {
            path,
            lock_path,
            session: SessionId::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Identifier stamped on every record written through this handle.
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Read the whole document. A missing document is an empty registry.
    pub fn load(&self) -> Result<RegistryDocument> {
        if !self.path.exists() {
            return Ok(RegistryDocument::default());
        }

        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| Error::registry_corrupt(&self.path, e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| Error::registry_corrupt(&self.path, e.to_string()))
    }

    /// All units of a collection, keyed by index.
    pub fn get(&self, collection: &CollectionName) -> Result<BTreeMap<u32, ContentUnit>> {
        let mut doc = self.load()?;
        Ok(doc
            .collections
            .remove(collection)
            .map(|record| record.units)
            .unwrap_or_default())
    }

    pub fn unit(&self, collection: &CollectionName, index: u32) -> Result<Option<ContentUnit>> {
        Ok(self.get(collection)?.remove(&index))
    }

    pub fn record(&self, collection: &CollectionName) -> Result<Option<CollectionRecord>> {
        Ok(self.load()?.collections.remove(collection))
    }

    pub fn collection_names(&self) -> Result<Vec<CollectionName>> {
        Ok(self.load()?.collections.into_keys().collect())
    }

    pub fn upsert(&self, collection: &CollectionName, unit: ContentUnit) -> Result<()> {
        self.commit(collection, unit, Vec::new())
    }

    pub fn append_phase_record(&self, collection: &CollectionName, record: PhaseRecord) -> Result<()> {
        self.mutate(|doc| {
            let entry = doc.collections.entry(collection.clone()).or_default();
            entry.history.push(record);
            entry.touch();
            Ok(())
        })
    }

    /// Write a unit together with the records describing how it got there.
    ///
    /// Both land in the same document write or neither does. A unit whose
    /// phase would go backwards is rejected; only [`Registry::reset_unit`]
    /// may lower a phase.
    pub fn commit(
        &self,
        collection: &CollectionName,
        unit: ContentUnit,
        records: Vec<PhaseRecord>,
    ) -> Result<()> {
        self.mutate(|doc| {
            let entry = doc.collections.entry(collection.clone()).or_default();
            if let Some(existing) = entry.units.get(&unit.index) {
                if unit.phase() < existing.phase() {
                    return Err(Error::invalid_input(format!(
                        "{}#{:03}: phase would regress from {} to {}",
                        collection,
                        unit.index,
                        existing.phase(),
                        unit.phase()
                    )));
                }
                if *existing == unit && records.is_empty() {
                    return Ok(());
                }
            }
            entry.units.insert(unit.index, unit);
            entry.history.extend(records);
            entry.touch();
            Ok(())
        })
    }

    pub fn set_stats(&self, collection: &CollectionName, stats: CollectionStats) -> Result<()> {
        self.update_record(collection, |record| {
            if record.stats == stats {
                return false;
            }
            record.stats = stats;
            true
        })
    }

    pub fn set_phase(&self, collection: &CollectionName, stage: Stage) -> Result<()> {
        self.update_record(collection, |record| {
            if record.phase == stage {
                return false;
            }
            record.phase = stage;
            true
        })
    }

    pub fn mark_verified(&self, collection: &CollectionName, verified: bool) -> Result<()> {
        self.update_record(collection, |record| {
            if record.stats.verified == verified {
                return false;
            }
            record.stats.verified = verified;
            true
        })
    }

    pub fn mark_cleanup_done(&self, collection: &CollectionName) -> Result<()> {
        self.update_record(collection, |record| {
            if record.stats.cleanup_done {
                return false;
            }
            record.stats.cleanup_done = true;
            true
        })
    }

    /// Operator re-processing: put a unit back to `Active(to)`.
    ///
    /// Clears attempt counts from `to` onwards, drops the collection's
    /// verification and cleanup flags and logs a `reset` record.
    pub fn reset_unit(&self, collection: &CollectionName, index: u32, to: Phase) -> Result<ContentUnit> {
        let session = self.session;
        self.mutate(|doc| {
            let entry = doc
                .collections
                .get_mut(collection)
                .ok_or_else(|| Error::UnknownCollection(collection.to_string()))?;
            let unit = entry.units.get_mut(&index).ok_or_else(|| {
                Error::invalid_input(format!("{}#{:03} is not in the registry", collection, index))
            })?;

            let from = unit.state;
            unit.state = UnitState::Active(to);
            unit.attempts.retain(|phase, _| *phase < to);
            if to == Phase::NotStarted {
                unit.route = None;
            }
            unit.last_error = None;
            unit.touch();
            let unit = unit.clone();

            entry.history.push(
                PhaseRecord::new(session, index, to, PhaseOutcome::Reset)
                    .with_detail(format!("from {}", from)),
            );
            entry.stats.verified = false;
            entry.stats.cleanup_done = false;
            if entry.phase > Stage::Download {
                entry.phase = Stage::Download;
            }
            entry.touch();
            Ok(unit)
        })
    }

    fn update_record(
        &self,
        collection: &CollectionName,
        f: impl FnOnce(&mut CollectionRecord) -> bool,
    ) -> Result<()> {
        self.mutate(|doc| {
            let entry = doc.collections.entry(collection.clone()).or_default();
            if f(entry) {
                entry.touch();
            }
            Ok(())
        })
    }

    /// Lock, re-read, apply, and replace the document if anything changed.
    fn mutate<R>(&self, f: impl FnOnce(&mut RegistryDocument) -> Result<R>) -> Result<R> {
        let _local = self.write_lock.lock();
        let _guard = self.acquire_lock()?;

        let before = self.load()?;
        let mut doc = before.clone();
        let result = f(&mut doc)?;

        if doc != before {
            self.write_document(&doc)?;
            tracing::trace!(path = ?self.path, "Registry document written");
        }

        Ok(result)
    }

    fn write_document(&self, doc: &RegistryDocument) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let json = serde_json::to_string_pretty(doc)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(json.as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    #[cfg(unix)]
    fn acquire_lock(&self) -> Result<LockGuard> {
        use nix::fcntl::{Flock, FlockArg};

        let file = self.open_lock_file()?;
        Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| Error::Io(errno.into()))
    }

    #[cfg(not(unix))]
    fn acquire_lock(&self) -> Result<LockGuard> {
        self.open_lock_file()
    }

    fn open_lock_file(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?)
    }
}
