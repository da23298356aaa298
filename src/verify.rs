//! Verification Gate: the all-or-nothing check that guards cleanup.
//!
//! Nothing is trusted from the registry except which units exist and where
//! they claim to be. Every artifact is looked up and parsed again, and every
//! issue is reported rather than stopping at the first one.

use crate::config::{CollectionConfig, IdentityPolicy, VerificationConfig};
use crate::locator::{ArtifactLocator, ArtifactRef};
use crate::registry::{ContentUnit, PhaseOutcome, PhaseRecord, Registry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use transcriptforge_common::{ArtifactKind, CollectionName, Error, Phase, Result, UnitState};

/// Outcome of one gate evaluation. Lives only for the invocation that
/// produced it.
#[derive(Debug, Serialize)]
pub struct VerificationResult {
    pub collection: CollectionName,
    pub passed: bool,
    /// Ordered by unit index
    pub issues: Vec<String>,
    #[serde(skip)]
    units: Vec<u32>,
}

impl VerificationResult {
    /// Exchange a passing result for the token cleanup requires.
    pub fn into_pass(self) -> Result<VerificationPass> {
        if !self.passed {
            return Err(Error::VerificationFailed {
                collection: self.collection.to_string(),
                first_issue: self
                    .issues
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| "verification did not pass".to_string()),
            });
        }
        Ok(VerificationPass {
            collection: self.collection,
            units: self.units,
            verified_at: Utc::now(),
        })
    }
}

/// Proof that the gate passed for a collection in this invocation.
///
/// Can only be obtained from [`VerificationResult::into_pass`] and is
/// consumed by cleanup.
#[derive(Debug)]
pub struct VerificationPass {
    collection: CollectionName,
    units: Vec<u32>,
    verified_at: DateTime<Utc>,
}

impl VerificationPass {
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Indices of the units whose artifacts were checked.
    pub fn units(&self) -> &[u32] {
        &self.units
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }
}

/// What the same underlying file or item looks like, regardless of name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Identity {
    Path(PathBuf),
    #[cfg(unix)]
    Inode(u64, u64),
    ItemId(String),
}

fn file_identities(path: &Path) -> Vec<Identity> {
    let mut ids = Vec::new();
    if let Ok(canonical) = std::fs::canonicalize(path) {
        ids.push(Identity::Path(canonical));
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        if let Ok(meta) = std::fs::metadata(path) {
            ids.push(Identity::Inode(meta.dev(), meta.ino()));
        }
    }
    ids
}

pub struct VerificationGate {
    registry: Arc<Registry>,
    locator: ArtifactLocator,
    config: VerificationConfig,
}

impl VerificationGate {
    pub fn new(registry: Arc<Registry>, locator: ArtifactLocator, config: VerificationConfig) -> Self {
        Self {
            registry,
            locator,
            config,
        }
    }

    /// Re-derive completeness of a collection from disk.
    ///
    /// Writes the collection's `verified` flag. On a pass, units at
    /// `ai_extracted` move to `verified`.
    pub fn verify(&self, collection: &CollectionConfig) -> Result<VerificationResult> {
        let name = &collection.name;
        let units = self.registry.get(name)?;
        let mut issues: Vec<(u32, String)> = Vec::new();

        for index in 1..=collection.total {
            if !units.contains_key(&index) {
                issues.push((index, format!("unit {:03}: not processed yet", index)));
            }
        }

        let by_item_id = match self.config.identity {
            IdentityPolicy::ItemId => self.extracted_by_item_id(name)?,
            _ => HashMap::new(),
        };

        let mut seen: HashMap<Identity, u32> = HashMap::new();
        let mut checked = Vec::new();
        let mut sound = BTreeSet::new();

        for unit in units.values() {
            let label = format!("unit {:03} ({})", unit.index, unit.item_id);
            match unit.state {
                UnitState::Active(phase) if phase < Phase::AiExtracted => {
                    issues.push((unit.index, format!("{}: still pending at {}", label, phase)));
                    continue;
                }
                UnitState::FailedPermanent(phase) => {
                    let reason = unit.last_error.as_deref().unwrap_or("retry budget exhausted");
                    issues.push((unit.index, format!("{}: failed permanently at {}: {}", label, phase, reason)));
                    continue;
                }
                UnitState::NoContent(_) if self.config.allow_absent => {
                    checked.push(unit.index);
                    continue;
                }
                _ => {}
            }

            checked.push(unit.index);
            let before = issues.len();
            let mut identities = Vec::new();

            match self.locator.locate_transcript(name, unit.index)? {
                Some(transcript) => identities.extend(file_identities(&transcript.path)),
                None => issues.push((unit.index, format!("{}: no transcript-equivalent artifact", label))),
            }

            let extracted = match self.config.identity {
                IdentityPolicy::ItemId => by_item_id.get(&unit.item_id).cloned(),
                _ => self.locator.locate(name, unit.index, ArtifactKind::Extracted)?,
            };
            match extracted {
                Some(extracted) => {
                    identities.extend(file_identities(&extracted.path));
                    match self.check_extracted(unit, &extracted) {
                        Ok(item_id) => {
                            if self.config.identity != IdentityPolicy::IndexPrefix {
                                identities.push(Identity::ItemId(item_id));
                            }
                        }
                        Err(reason) => issues.push((unit.index, format!("{}: {}", label, reason))),
                    }
                }
                None => issues.push((unit.index, format!("{}: no extracted-content artifact", label))),
            }

            for identity in identities {
                if let Some(other) = seen.get(&identity) {
                    if *other != unit.index {
                        issues.push((
                            unit.index,
                            format!("{}: shares an artifact with unit {:03} ({:?})", label, other, identity),
                        ));
                    }
                } else {
                    seen.insert(identity, unit.index);
                }
            }

            if issues.len() == before {
                sound.insert(unit.index);
            }
        }

        for audio in self.locator.scan(name, ArtifactKind::Audio)? {
            if !sound.contains(&audio.index) {
                issues.push((
                    audio.index,
                    format!(
                        "audio file {} does not belong to a verified unit",
                        audio.path.display()
                    ),
                ));
            }
        }

        issues.sort_by_key(|(index, _)| *index);
        let passed = issues.is_empty();

        self.registry.mark_verified(name, passed)?;
        if passed {
            self.promote_verified(name, &units)?;
            tracing::info!(collection = %name, units = checked.len(), "Verification passed");
        } else {
            tracing::warn!(
                collection = %name,
                "Verification failed with {} issue(s); first: {}",
                issues.len(),
                issues[0].1
            );
        }

        Ok(VerificationResult {
            collection: name.clone(),
            passed,
            issues: issues.into_iter().map(|(_, issue)| issue).collect(),
            units: checked,
        })
    }

    /// Parse an extracted document and return the item id it records.
    fn check_extracted(&self, unit: &ContentUnit, extracted: &ArtifactRef) -> std::result::Result<String, String> {
        let content = std::fs::read_to_string(&extracted.path)
            .map_err(|e| format!("cannot read {}: {}", extracted.path.display(), e))?;
        let doc: Value = serde_json::from_str(&content)
            .map_err(|e| format!("{} is not valid JSON: {}", extracted.path.display(), e))?;
        let Some(object) = doc.as_object() else {
            return Err(format!("{} is not a JSON object", extracted.path.display()));
        };

        for field in &self.config.required_fields {
            if !object.contains_key(field) {
                return Err(format!("{} lacks required field '{}'", extracted.path.display(), field));
            }
        }

        let Some(item_id) = doc
            .get("metadata")
            .and_then(|m| m.get("item_id"))
            .and_then(|id| id.as_str())
        else {
            return Err(format!("{} lacks metadata.item_id", extracted.path.display()));
        };

        if self.config.identity == IdentityPolicy::Both && item_id != unit.item_id {
            return Err(format!(
                "{} records item {} but the unit is item {}",
                extracted.path.display(),
                item_id,
                unit.item_id
            ));
        }
        Ok(item_id.to_string())
    }

    /// Extracted documents keyed by the item id they record.
    fn extracted_by_item_id(&self, name: &CollectionName) -> Result<HashMap<String, ArtifactRef>> {
        let mut map = HashMap::new();
        for artifact in self.locator.scan(name, ArtifactKind::Extracted)? {
            let item_id = std::fs::read_to_string(&artifact.path)
                .ok()
                .and_then(|s| serde_json::from_str::<Value>(&s).ok())
                .and_then(|doc| doc.pointer("/metadata/item_id").and_then(|v| v.as_str()).map(String::from));
            if let Some(item_id) = item_id {
                map.entry(item_id).or_insert(artifact);
            }
        }
        Ok(map)
    }

    fn promote_verified(
        &self,
        name: &CollectionName,
        units: &std::collections::BTreeMap<u32, ContentUnit>,
    ) -> Result<()> {
        let session = self.registry.session();
        for unit in units.values() {
            if unit.state != UnitState::Active(Phase::AiExtracted) {
                continue;
            }
            let mut unit = unit.clone();
            unit.advance(UnitState::Active(Phase::Verified));
            let record = PhaseRecord::new(session, unit.index, Phase::Verified, PhaseOutcome::Verified);
            self.registry.commit(name, unit, vec![record])?;
        }
        Ok(())
    }
}
