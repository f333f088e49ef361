//! Dataset configuration.

use crate::buckets::BucketSpec;
use crate::types::{BucketDatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Base training resolution; bucket areas are bounded by `resolution²`.
    pub resolution: u32,
    /// Candidate bucket enumeration policy.
    pub bucket: BucketSpec,
    /// Randomly flip images horizontally (p = 0.5).
    pub hflip: bool,
    /// Shuffle comma-separated caption tags on every access. Disables caption id caching.
    pub shuffle_tags: bool,
    /// Wrap caption clauses in explicit bos/eos tokens and tag words with `</w>`.
    pub strict_tokens: bool,
    /// Normalize each image with its own mean/std instead of 0.5/0.5.
    pub dynamic_img_norm: bool,
    /// Pad token ids to the longest sequence instead of the model max length.
    pub not_pad_tokens: bool,
    /// Encode dual-stack prompts in windows covering this many tokens instead of truncating.
    #[serde(default)]
    pub max_token_length: Option<usize>,
    /// Replace artifacts with inspectable markers and disable all randomization.
    pub debug_dataset: bool,
    /// Directory holding `image_cache_{resolution}.safetensors`.
    pub cache_dir: PathBuf,
    /// Seed for reproducible shuffles, reference draws and flips.
    pub seed: Option<u64>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            resolution: 512,
            bucket: BucketSpec::default(),
            hflip: false,
            shuffle_tags: false,
            strict_tokens: false,
            dynamic_img_norm: false,
            not_pad_tokens: false,
            max_token_length: None,
            debug_dataset: false,
            cache_dir: PathBuf::from("cache"),
            seed: None,
        }
    }
}

impl DatasetConfig {
    pub fn for_model_dir(model_dir: &Path, resolution: u32) -> Self {
        Self {
            resolution,
            cache_dir: model_dir.join("cache"),
            ..Self::default()
        }
    }

    pub fn with_env_overrides(mut self) -> Self {
        if let Some(seed) = std::env::var("BUCKET_DATASET_SEED")
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            self.seed = Some(seed);
        }
        if let Some(debug) = std::env::var("BUCKET_DATASET_DEBUG")
            .ok()
            .map(|v| v.trim().to_ascii_lowercase())
        {
            self.debug_dataset = debug == "1" || debug == "true" || debug == "on";
        }
        if let Some(dir) = std::env::var("BUCKET_DATASET_CACHE_DIR")
            .ok()
            .filter(|s| !s.trim().is_empty())
        {
            self.cache_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn flip_prob(&self) -> f32 {
        if self.hflip {
            0.5
        } else {
            0.0
        }
    }

    pub fn validate(&self) -> DatasetResult<()> {
        if self.resolution == 0 {
            return Err(BucketDatasetError::Configuration(
                "resolution must be positive".to_string(),
            ));
        }
        if self.max_token_length == Some(0) {
            return Err(BucketDatasetError::Configuration(
                "max_token_length must be positive".to_string(),
            ));
        }
        self.bucket.validate()
    }
}
