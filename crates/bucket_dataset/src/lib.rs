//! Aspect-ratio bucketed datasets for generative fine-tuning.
//!
//! This crate provides utilities for:
//! - Scanning instance/reference samples into a registry
//! - Assigning samples to resolution buckets per concept group
//! - Caching latents, caption ids and text conditioning, with a safetensors snapshot on disk
//! - Balanced instance/reference pairing with a per-bucket cyclic cursor
//! - Burn-compatible batch collation

// Module declarations
pub mod aug;
pub mod batch;
pub mod buckets;
pub mod cache;
pub mod captions;
pub mod conditioning;
pub mod config;
pub mod dataset;
pub mod interfaces;
pub mod materialize;
pub mod progress;
pub mod registry;
pub mod sampler;
pub mod store;
pub mod tensor;
pub mod types;

// Re-export public API
pub use aug::{FitCropLoader, ImageTransform, Normalization};
pub use batch::{collate, BucketBatch, BucketBatchSampler};
pub use buckets::{
    assign_bucket, build_tables, closest_resolution, make_bucket_resolutions, plan_buckets,
    BucketSpec, BucketTable,
};
pub use cache::{ArtifactCache, ShardedMap};
pub use captions::CaptionOptions;
pub use config::DatasetConfig;
pub use dataset::BucketDataset;
pub use interfaces::{ImageEncoder, ImageLoader, Padding, TextBranch, TextEncoder, TextStack, Tokenizer};
pub use materialize::{ArtifactPipeline, BucketMaterializer, Materialized};
pub use progress::{NullProgress, ProgressSink, TracingProgress};
pub use registry::{scan_directory, RegistrySummary, SampleDescriptor, SampleRegistry};
pub use sampler::BalancedSampler;
pub use store::{config_fingerprint, LatentCacheFile};
pub use types::*;
