use super::{Catalog, ItemDescriptor};
use crate::config::CollectionConfig;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use transcriptforge_common::{Error, Result};

/// Reads a collection's items from the JSON manifest named by its `catalog`.
///
/// The manifest is an array of `{ "index", "item_id", "title" }` objects.
/// Relative paths resolve against the storage root.
#[derive(Debug, Clone)]
pub struct ManifestCatalog {
    root: PathBuf,
}

impl ManifestCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn manifest_path(&self, collection: &CollectionConfig) -> PathBuf {
        if collection.catalog.is_absolute() {
            collection.catalog.clone()
        } else {
            self.root.join(&collection.catalog)
        }
    }

    /// Parse and check a manifest: indices must be 1-based, unique and
    /// within the collection's declared total.
    pub fn load(path: &Path, total: u32) -> Result<Vec<ItemDescriptor>> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::invalid_input(format!("cannot read catalog {:?}: {}", path, e)))?;
        let mut items: Vec<ItemDescriptor> = serde_json::from_str(&content)
            .map_err(|e| Error::invalid_input(format!("invalid catalog {:?}: {}", path, e)))?;

        let mut seen = HashSet::new();
        for item in &items {
            if item.index == 0 || item.index > total {
                return Err(Error::invalid_input(format!(
                    "catalog {:?}: index {} outside 1..={}",
                    path, item.index, total
                )));
            }
            if !seen.insert(item.index) {
                return Err(Error::invalid_input(format!(
                    "catalog {:?}: index {} listed twice",
                    path, item.index
                )));
            }
            if item.item_id.trim().is_empty() {
                return Err(Error::invalid_input(format!(
                    "catalog {:?}: index {} has an empty item_id",
                    path, item.index
                )));
            }
        }

        items.sort_by_key(|item| item.index);
        Ok(items)
    }
}

#[async_trait]
impl Catalog for ManifestCatalog {
    async fn items(&self, collection: &CollectionConfig) -> Result<Vec<ItemDescriptor>> {
        let path = self.manifest_path(collection);
        let items = Self::load(&path, collection.total)?;
        tracing::debug!(
            collection = %collection.name,
            "Loaded {} catalog items from {:?}",
            items.len(),
            path
        );
        Ok(items)
    }
}
