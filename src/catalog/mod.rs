//! Source catalog: enumerates tags and opens their state datasets.
//!
//! The accumulator only talks to the [`SourceCatalog`] trait; the
//! directory-backed implementation expects one sub-directory per tag
//! holding a `states.zarr` store.

use crate::error::{PipelineError, PipelineResult};
use crate::models::{SourceDataset, Tag};
use crate::store;
use std::path::PathBuf;
use tracing::debug;
use walkdir::WalkDir;

/// Name of the per-tag array store.
pub const STATES_STORE: &str = "states.zarr";

/// Capability to enumerate tags and load their datasets.
pub trait SourceCatalog {
    /// All known tags, in a stable order.
    fn list_tags(&self) -> PipelineResult<Vec<Tag>>;

    /// Whether the tag has a states dataset.
    fn has_states(&self, tag: &Tag) -> bool;

    /// Load the tag's dataset. Only valid when [`has_states`](Self::has_states) is true.
    fn open_dataset(&self, tag: &Tag) -> PipelineResult<SourceDataset>;
}

/// Catalog rooted at a directory of `<tag>/states.zarr` stores.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    root: PathBuf,
}

impl DirectoryCatalog {
    /// Create a catalog over the given root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Location of a tag's states store.
    pub fn states_path(&self, tag: &Tag) -> PathBuf {
        self.root.join(tag.as_str()).join(STATES_STORE)
    }
}

impl SourceCatalog for DirectoryCatalog {
    fn list_tags(&self) -> PipelineResult<Vec<Tag>> {
        if !self.root.is_dir() {
            return Err(PipelineError::Config(format!(
                "Catalog root is not a directory: {}",
                self.root.display()
            )));
        }

        let mut tags = Vec::new();
        for entry in WalkDir::new(&self.root)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| PipelineError::Io(e.into()))?;
            if !entry.file_type().is_dir() {
                continue;
            }

            let name = entry.file_name().to_string_lossy();
            // Skip hidden directories
            if name.starts_with('.') {
                continue;
            }
            tags.push(Tag::new(name.as_ref()));
        }

        debug!("Found {} tags under {}", tags.len(), self.root.display());
        Ok(tags)
    }

    fn has_states(&self, tag: &Tag) -> bool {
        self.states_path(tag).is_dir()
    }

    fn open_dataset(&self, tag: &Tag) -> PipelineResult<SourceDataset> {
        store::read_source_dataset(&self.states_path(tag), tag)
    }
}

/// In-memory catalog for tests; `None` marks a tag without states.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    entries: Vec<(Tag, Option<SourceDataset>)>,
}

#[cfg(test)]
impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, dataset: SourceDataset) -> Self {
        self.entries.push((dataset.tag.clone(), Some(dataset)));
        self
    }

    pub fn with_absent(mut self, tag: &str) -> Self {
        self.entries.push((Tag::from(tag), None));
        self
    }
}

#[cfg(test)]
impl SourceCatalog for MemoryCatalog {
    fn list_tags(&self) -> PipelineResult<Vec<Tag>> {
        Ok(self.entries.iter().map(|(tag, _)| tag.clone()).collect())
    }

    fn has_states(&self, tag: &Tag) -> bool {
        self.entries
            .iter()
            .any(|(t, dataset)| t == tag && dataset.is_some())
    }

    fn open_dataset(&self, tag: &Tag) -> PipelineResult<SourceDataset> {
        self.entries
            .iter()
            .find(|(t, _)| t == tag)
            .and_then(|(_, dataset)| dataset.clone())
            .ok_or_else(|| PipelineError::malformed(format!("tag {}", tag), "no states dataset"))
    }
}
