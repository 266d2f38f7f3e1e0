//! Image shard planning
//!
//! Partitions a flat image directory into disjoint shards keyed by the
//! leading characters of each image's file name. Planning is pure: the
//! output directories are created separately by the job runner.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::ImageId;

/// Errors raised while scanning a corpus
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Corpus directory not readable: {}: {source}", .path.display())]
    CorpusUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Image id '{image_id}' is shared by {} and {}", .first.display(), .second.display())]
    DuplicateImageId {
        image_id: ImageId,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Image file name is not valid UTF-8: {}", .path.display())]
    NonUtf8Name { path: PathBuf },
}

/// Result type for planning
pub type PlanResult<T> = Result<T, PlanError>;

/// One image of the corpus
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRecord {
    /// File stem; also the id the collaborator reports back
    pub image_id: ImageId,
    pub path: PathBuf,
}

impl ImageRecord {
    pub fn new(image_id: impl Into<ImageId>, path: impl Into<PathBuf>) -> Self {
        Self {
            image_id: image_id.into(),
            path: path.into(),
        }
    }

    /// Shard key this image falls under, if any
    pub fn shard_key<'a>(&self, keys: &'a [String]) -> Option<&'a str> {
        let name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&self.image_id);
        keys.iter()
            .map(String::as_str)
            .find(|k| name.starts_with(k))
    }
}

/// Images sharing one shard key
#[derive(Debug, Clone, Serialize)]
pub struct Shard {
    pub key: String,
    pub images: Vec<ImageRecord>,
}

impl Shard {
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Partial result file for this shard inside a run directory
    pub fn output_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(format!("shard_{}.json", self.key))
    }

    /// Status file sitting next to the output
    pub fn status_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(format!("shard_{}.status.json", self.key))
    }

    /// File listing this shard's images, one path per line
    pub fn image_list_path(&self, run_dir: &Path) -> PathBuf {
        run_dir.join(format!("image_list_{}.txt", self.key))
    }

    /// File-name glob for the collaborator, e.g. `/data/val/a*`
    pub fn image_glob(&self, corpus_dir: &Path) -> String {
        format!("{}/{}*", corpus_dir.display(), self.key)
    }
}

/// A full partition of the corpus
#[derive(Debug, Clone, Serialize)]
pub struct ShardPlan {
    /// One shard per key, in key order
    pub shards: Vec<Shard>,
    /// Images whose name starts with none of the keys
    pub unassigned: Vec<ImageRecord>,
}

impl ShardPlan {
    pub fn total_images(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    /// All assigned image ids in canonical (shard key, then name) order
    pub fn image_ids(&self) -> Vec<ImageId> {
        self.shards
            .iter()
            .flat_map(|s| s.images.iter().map(|i| i.image_id.clone()))
            .collect()
    }

    pub fn shard(&self, key: &str) -> Option<&Shard> {
        self.shards.iter().find(|s| s.key == key)
    }
}

/// Scans a corpus directory and partitions it
#[derive(Debug, Clone)]
pub struct ShardPlanner {
    corpus_dir: PathBuf,
    keys: Vec<String>,
    extensions: Vec<String>,
}

impl ShardPlanner {
    pub fn new(corpus_dir: impl Into<PathBuf>, keys: Vec<String>, extensions: Vec<String>) -> Self {
        Self {
            corpus_dir: corpus_dir.into(),
            keys,
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn from_config(config: &crate::config::SweepConfig) -> Self {
        Self::new(
            config.corpus_dir.clone(),
            config.shard_keys.clone(),
            config.image_extensions.clone(),
        )
    }

    /// Scan the corpus and build the plan
    pub fn plan(&self) -> PlanResult<ShardPlan> {
        let images = scan_corpus(&self.corpus_dir, &self.extensions)?;
        let plan = plan_shards(images, &self.keys);
        if !plan.unassigned.is_empty() {
            warn!(
                count = plan.unassigned.len(),
                first = %plan.unassigned[0].image_id,
                "Images match no shard key and will not be processed"
            );
        }
        debug!(
            shards = plan.shards.len(),
            images = plan.total_images(),
            "Shard plan built"
        );
        Ok(plan)
    }
}

/// List image files directly under `dir`, sorted by image id.
///
/// Hidden files and subdirectories are ignored. An empty `extensions` list
/// accepts every file. An accepted file whose name is not UTF-8 fails the scan.
pub fn scan_corpus(dir: &Path, extensions: &[String]) -> PlanResult<Vec<ImageRecord>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PlanError::CorpusUnreadable {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let mut by_id: HashMap<ImageId, PathBuf> = HashMap::new();
    for entry in entries {
        let entry = entry.map_err(|e| PlanError::CorpusUnreadable {
            path: dir.to_path_buf(),
            source: e,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        if name.to_string_lossy().starts_with('.') {
            continue;
        }
        if !extensions.is_empty() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .unwrap_or_default();
            if !extensions.contains(&ext) {
                continue;
            }
        }
        // The id must round-trip through JSON, so an unrepresentable name
        // cannot be captioned
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            return Err(PlanError::NonUtf8Name { path });
        };

        if let Some(first) = by_id.get(stem) {
            return Err(PlanError::DuplicateImageId {
                image_id: stem.to_string(),
                first: first.clone(),
                second: path,
            });
        }
        by_id.insert(stem.to_string(), path);
    }

    let mut images: Vec<ImageRecord> = by_id
        .into_iter()
        .map(|(id, path)| ImageRecord::new(id, path))
        .collect();
    images.sort_by(|a, b| a.image_id.cmp(&b.image_id));
    Ok(images)
}

/// Partition images by key. Keys with no images yield empty shards.
pub fn plan_shards(images: Vec<ImageRecord>, keys: &[String]) -> ShardPlan {
    let mut shards: Vec<Shard> = keys
        .iter()
        .map(|k| Shard {
            key: k.clone(),
            images: Vec::new(),
        })
        .collect();
    let mut unassigned = Vec::new();

    for image in images {
        match image
            .shard_key(keys)
            .and_then(|k| keys.iter().position(|key| key == k))
        {
            Some(idx) => shards[idx].images.push(image),
            None => unassigned.push(image),
        }
    }

    ShardPlan { shards, unassigned }
}
