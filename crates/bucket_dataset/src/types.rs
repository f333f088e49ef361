//! Core types, error definitions, and data structures for bucket_dataset.

use burn::tensor::TensorData;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, BucketDatasetError>;

#[derive(Debug, Error)]
pub enum BucketDatasetError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json parse error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    /// Computing an artifact for one sample failed; recovered by the materializer.
    #[error("failed to process sample {path}: {reason}")]
    Sample { path: PathBuf, reason: String },
    #[error("malformed latent cache {path}: {msg}")]
    CacheFormat { path: PathBuf, msg: String },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("no cached {artifact} for {path}")]
    MissingArtifact { path: PathBuf, artifact: &'static str },
    #[error("index {index} out of range for dataset of {len} samples")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("bucket {0} has no pairing list")]
    UnknownBucket(BucketKey),
    #[error("tensor error: {0}")]
    Tensor(String),
    #[error("{0}")]
    Other(String),
}

impl BucketDatasetError {
    pub(crate) fn sample(path: impl Into<PathBuf>, err: anyhow::Error) -> Self {
        BucketDatasetError::Sample {
            path: path.into(),
            reason: format!("{err:#}"),
        }
    }
}

/// Partition identity: target resolution plus the concept/group a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BucketKey {
    pub width: u32,
    pub height: u32,
    pub group_id: usize,
}

impl BucketKey {
    pub fn new(width: u32, height: u32, group_id: usize) -> Self {
        Self {
            width,
            height,
            group_id,
        }
    }

    pub fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl std::fmt::Display for BucketKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.width, self.height, self.group_id)
    }
}

/// One sample as stored in a bucket table, the pairing lists and the flattened sample cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketEntry {
    pub path: PathBuf,
    pub caption: String,
    pub is_reference: bool,
}

/// Extra conditioning consumed next to the prompt embeddings by dual-encoder models.
#[derive(Debug, Clone)]
pub struct AddedConditioning {
    /// Pooled embedding of the final text encoder, shape `[1, dim]`.
    pub text_embeds: TensorData,
    /// `[orig_w, orig_h, crop_top, crop_left, target_w, target_h]`, shape `[1, 6]`.
    pub time_ids: TensorData,
}

/// Output of a text encoder for one tokenized prompt.
#[derive(Debug, Clone)]
pub struct TextEncoding {
    /// Shape `[1, seq, dim]`.
    pub sequence: TensorData,
    /// Shape `[1, dim]`.
    pub pooled: TensorData,
}

#[derive(Debug, Clone)]
pub enum ExampleImage {
    Latent(TensorData),
    /// Normalized CHW pixels, used when latents are not cached.
    Pixels(TensorData),
    /// Debug inspection marker: the sample path with its extension stripped.
    Marker { stem: PathBuf, extension: String },
}

#[derive(Debug, Clone)]
pub enum ExampleText {
    TokenIds(TensorData),
    /// Dual-encoder prompt embeddings, shape `[1, seq, dim]`.
    Conditioning(TensorData),
    /// No tokenizer configured; the raw caption is passed through.
    Caption(String),
    /// Debug inspection: the caption fed to the tokenizer and its decoded round trip.
    Inspect { caption: String, rebuilt: String },
}

/// One retrievable training example.
#[derive(Debug, Clone)]
pub struct Example {
    pub image: ExampleImage,
    pub text: ExampleText,
    pub added_conditioning: Option<AddedConditioning>,
    pub resolution: (u32, u32),
    pub is_reference: bool,
}

/// Per-bucket breakdown emitted by the materializer and the planning dry run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSummary {
    pub key: BucketKey,
    pub instances: usize,
    pub references: usize,
    pub examples: usize,
}

impl BucketSummary {
    pub fn new(key: BucketKey, instances: usize, references: usize) -> Self {
        Self {
            key,
            instances,
            references,
            examples: example_len(instances, references),
        }
    }
}

/// One reference slot per instance: references never inflate the count beyond `2 * instances`.
pub fn example_len(instances: usize, references: usize) -> usize {
    if references == 0 {
        instances
    } else {
        instances * 2
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializeTotals {
    pub instances: usize,
    pub references: usize,
    pub examples: usize,
    pub buckets: usize,
}
