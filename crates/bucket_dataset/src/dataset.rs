//! The indexable dataset consumed by a training loop.

use crate::aug::FitCropLoader;
use crate::buckets::make_bucket_resolutions;
use crate::cache::ArtifactCache;
use crate::config::DatasetConfig;
use crate::interfaces::{ImageEncoder, ImageLoader, TextStack};
use crate::materialize::{ArtifactPipeline, BucketMaterializer, Materialized};
use crate::progress::{ProgressSink, TracingProgress};
use crate::registry::SampleRegistry;
use crate::sampler::BalancedSampler;
use crate::store::LatentCacheFile;
use crate::tensor::{i64_values, squeeze_batch};
use crate::types::{
    BucketDatasetError, BucketEntry, BucketKey, DatasetResult, Example, ExampleImage,
    ExampleText, MaterializeTotals,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct BucketDataset {
    config: DatasetConfig,
    registry: SampleRegistry,
    pipeline: ArtifactPipeline,
    store: LatentCacheFile,
    progress: Arc<dyn ProgressSink>,
    sampler: BalancedSampler,
    materialized: Materialized,
    resolutions: Vec<BucketKey>,
    active_resolution: (u32, u32),
    rng: Mutex<StdRng>,
}

impl BucketDataset {
    pub fn new(
        config: DatasetConfig,
        registry: SampleRegistry,
        text: Option<TextStack>,
        loader: Arc<dyn ImageLoader>,
        progress: Arc<dyn ProgressSink>,
    ) -> DatasetResult<Self> {
        config.validate()?;
        if text.is_none() {
            let needs_tokenizer = [
                (config.shuffle_tags, "shuffle_tags"),
                (config.strict_tokens, "strict_tokens"),
                (config.debug_dataset, "debug_dataset"),
            ];
            if let Some((_, flag)) = needs_tokenizer.iter().find(|(on, _)| *on) {
                return Err(BucketDatasetError::Configuration(format!(
                    "{flag} requires a tokenizer"
                )));
            }
        }
        if let Some(stack) = text.as_ref().filter(|s| s.is_dual()) {
            if !config.debug_dataset && stack.branches().iter().any(|b| b.encoder.is_none()) {
                return Err(BucketDatasetError::Configuration(
                    "a dual text stack needs an encoder on both branches".to_string(),
                ));
            }
        }

        let pipeline = ArtifactPipeline::new(&config, Arc::new(ArtifactCache::new()), text, loader);
        let store = LatentCacheFile::for_config(&config);
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Ok(Self {
            sampler: BalancedSampler::new(config.seed, config.debug_dataset),
            active_resolution: (config.resolution, config.resolution),
            config,
            registry,
            pipeline,
            store,
            progress,
            materialized: Materialized::default(),
            resolutions: Vec::new(),
            rng: Mutex::new(rng),
        })
    }

    /// Registry-only dataset with the default loader and tracing progress.
    pub fn with_defaults(
        config: DatasetConfig,
        registry: SampleRegistry,
        text: Option<TextStack>,
    ) -> DatasetResult<Self> {
        Self::new(
            config,
            registry,
            text,
            Arc::new(FitCropLoader),
            Arc::new(TracingProgress::default()),
        )
    }

    /// Bucket every sample and compute its artifacts. With an image encoder,
    /// latents are cached and reconciled with the on-disk snapshot.
    pub fn make_buckets_with_caching(
        &mut self,
        image_encoder: Option<Arc<dyn ImageEncoder>>,
    ) -> MaterializeTotals {
        let state = format!(
            "Preparing Dataset ({})",
            if image_encoder.is_some() {
                "With Caching"
            } else {
                "Without Caching"
            }
        );
        self.progress.set_stage(&state);
        self.pipeline.set_image_encoder(image_encoder);

        let candidates = make_bucket_resolutions(self.config.resolution, &self.config.bucket);
        let materializer =
            BucketMaterializer::new(&self.pipeline, &self.store, self.progress.as_ref());
        self.materialized = materializer.materialize(
            &self.registry.instance,
            &self.registry.reference,
            &candidates,
        );
        self.resolutions = self.materialized.bucket_sizes.keys().copied().collect();
        self.progress.reset(0);
        self.materialized.totals
    }

    /// Rebuild the per-bucket pairings for a new epoch.
    pub fn shuffle_buckets(&mut self) {
        self.sampler.shuffle(
            &self.materialized.instance_table,
            &self.materialized.reference_table,
        );
    }

    /// Next flattened index from `key`'s pairing, and whether the bucket just wrapped.
    pub fn get_example(&mut self, key: BucketKey) -> DatasetResult<(usize, bool)> {
        self.active_resolution = key.resolution();
        self.sampler.next(&key, &self.materialized.sample_index)
    }

    pub fn get_item(&self, index: usize) -> DatasetResult<Example> {
        let samples = &self.materialized.samples;
        let entry = samples
            .get(index)
            .ok_or(BucketDatasetError::IndexOutOfRange {
                index,
                len: samples.len(),
            })?;
        if self.config.debug_dataset {
            return self.inspect_item(entry);
        }

        let path = entry.path.as_path();
        let resolution = self.active_resolution;
        let image = if self.pipeline.caches_latents() {
            let latent = self
                .pipeline
                .cache()
                .latents
                .get(path)
                .ok_or_else(|| missing(path, "latent"))?;
            ExampleImage::Latent(latent)
        } else {
            let pixels = self
                .pipeline
                .load_pixels(path, resolution)
                .map_err(|e| BucketDatasetError::sample(path, e))?;
            ExampleImage::Pixels(pixels)
        };

        let mut added_conditioning = None;
        let text = if self.pipeline.uses_conditioning() {
            let (embeds, added) = self
                .pipeline
                .cache()
                .conditioning
                .get(path)
                .ok_or_else(|| missing(path, "conditioning"))?;
            added_conditioning = Some(added);
            ExampleText::Conditioning(embeds)
        } else if self.pipeline.text().is_some() {
            let ids = if self.config.shuffle_tags {
                let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                self.pipeline
                    .get_or_compute_caption_ids(path, &entry.caption, &mut *rng)
                    .map_err(|e| BucketDatasetError::sample(path, e))?
            } else {
                self.pipeline
                    .cache()
                    .caption_ids
                    .get(path)
                    .ok_or_else(|| missing(path, "caption ids"))?
            };
            ExampleText::TokenIds(ids)
        } else {
            ExampleText::Caption(entry.caption.clone())
        };

        Ok(Example {
            image,
            text,
            added_conditioning,
            resolution,
            is_reference: entry.is_reference,
        })
    }

    fn inspect_item(&self, entry: &BucketEntry) -> DatasetResult<Example> {
        let path = entry.path.as_path();
        let stack = self.pipeline.text().ok_or_else(|| {
            BucketDatasetError::Configuration("debug_dataset requires a tokenizer".to_string())
        })?;
        let tokenized = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            self.pipeline
                .tokenize_fresh(&entry.caption, &mut *rng)
                .map_err(|e| BucketDatasetError::sample(path, e))?
        };
        let ids = i64_values(&squeeze_batch(tokenized.ids))?;
        let rebuilt = stack
            .primary_tokenizer()
            .decode(&ids)
            .map_err(|e| BucketDatasetError::sample(path, e))?;
        let extension = path
            .extension()
            .map(|ext| format!(".{}", ext.to_string_lossy()))
            .unwrap_or_default();
        Ok(Example {
            image: ExampleImage::Marker {
                stem: path.with_extension(""),
                extension,
            },
            text: ExampleText::Inspect {
                caption: tokenized.caption,
                rebuilt,
            },
            added_conditioning: None,
            resolution: self.active_resolution,
            is_reference: entry.is_reference,
        })
    }

    /// Sum of per-bucket example counts from the last materialization.
    pub fn len(&self) -> usize {
        self.materialized.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bucket keys visited by the last materialization, in visiting order.
    pub fn resolutions(&self) -> &[BucketKey] {
        &self.resolutions
    }

    /// Bucket keys in this epoch's order (after [`Self::shuffle_buckets`]).
    pub fn bucket_order(&self) -> Vec<BucketKey> {
        self.sampler.keys()
    }

    pub fn pairing(&self, key: &BucketKey) -> Option<&[BucketEntry]> {
        self.sampler.pairing(key)
    }

    pub fn set_active_resolution(&mut self, resolution: (u32, u32)) {
        self.active_resolution = resolution;
    }

    pub fn active_resolution(&self) -> (u32, u32) {
        self.active_resolution
    }

    /// Flattened sample list; indices into it are what [`Self::get_item`] takes.
    pub fn samples(&self) -> &[BucketEntry] {
        &self.materialized.samples
    }

    pub fn materialized(&self) -> &Materialized {
        &self.materialized
    }

    pub fn cache(&self) -> &ArtifactCache {
        self.pipeline.cache()
    }

    pub fn cache_file(&self) -> &LatentCacheFile {
        &self.store
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn registry(&self) -> &SampleRegistry {
        &self.registry
    }
}

fn missing(path: &Path, artifact: &'static str) -> BucketDatasetError {
    BucketDatasetError::MissingArtifact {
        path: path.to_path_buf(),
        artifact,
    }
}
