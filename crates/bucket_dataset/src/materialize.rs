//! Artifact computation for every bucketed sample, with disk reconciliation.

use crate::aug::{sample_rng, ImageTransform};
use crate::buckets::{assign_bucket, BucketTable};
use crate::cache::ArtifactCache;
use crate::captions::{tokenize_caption, CaptionOptions, TokenizedCaption};
use crate::conditioning::compute_conditioning;
use crate::config::DatasetConfig;
use crate::interfaces::{ImageEncoder, ImageLoader, TextStack};
use crate::progress::ProgressSink;
use crate::registry::SampleDescriptor;
use crate::store::LatentCacheFile;
use crate::tensor::squeeze_batch;
use crate::types::{
    example_len, AddedConditioning, BucketEntry, BucketKey, BucketSummary, MaterializeTotals,
};
use anyhow::Context;
use burn::tensor::TensorData;
use indexmap::IndexMap;
use rayon::prelude::*;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// The three memoized artifact computations over the shared cache and collaborators.
pub struct ArtifactPipeline {
    cache: Arc<ArtifactCache>,
    text: Option<TextStack>,
    loader: Arc<dyn ImageLoader>,
    image_encoder: Option<Arc<dyn ImageEncoder>>,
    transform: ImageTransform,
    caption_opts: CaptionOptions,
    debug: bool,
    seed: Option<u64>,
}

impl ArtifactPipeline {
    pub fn new(
        cfg: &DatasetConfig,
        cache: Arc<ArtifactCache>,
        text: Option<TextStack>,
        loader: Arc<dyn ImageLoader>,
    ) -> Self {
        Self {
            cache,
            text,
            loader,
            image_encoder: None,
            transform: ImageTransform::from_config(cfg),
            caption_opts: CaptionOptions {
                shuffle_tags: cfg.shuffle_tags,
                strict_tokens: cfg.strict_tokens,
                not_pad_tokens: cfg.not_pad_tokens,
                max_token_length: cfg.max_token_length,
            },
            debug: cfg.debug_dataset,
            seed: cfg.seed,
        }
    }

    pub fn set_image_encoder(&mut self, encoder: Option<Arc<dyn ImageEncoder>>) {
        self.image_encoder = encoder;
    }

    /// Latents are only produced outside debug mode and with an encoder attached.
    pub fn caches_latents(&self) -> bool {
        self.image_encoder.is_some() && !self.debug
    }

    /// Dual stacks replace caption ids with precomputed conditioning.
    pub fn uses_conditioning(&self) -> bool {
        self.text.as_ref().is_some_and(TextStack::is_dual) && !self.debug
    }

    pub fn cache(&self) -> &ArtifactCache {
        &self.cache
    }

    pub fn text(&self) -> Option<&TextStack> {
        self.text.as_ref()
    }

    pub fn caption_options(&self) -> &CaptionOptions {
        &self.caption_opts
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Decode, fit and transform without touching the cache. Shape `[3, H, W]`.
    pub fn load_pixels(&self, path: &Path, resolution: (u32, u32)) -> anyhow::Result<TensorData> {
        let img = self.loader.load_and_fit(path, resolution)?;
        Ok(self.transform.apply(img, path))
    }

    pub fn get_or_compute_latent(
        &self,
        path: &Path,
        resolution: (u32, u32),
    ) -> anyhow::Result<TensorData> {
        self.cache.latents.get_or_try_insert_with(path, || {
            let encoder = self
                .image_encoder
                .as_ref()
                .context("no image encoder configured")?;
            let mut pixels = self.load_pixels(path, resolution)?;
            let mut shape = vec![1];
            shape.extend_from_slice(&pixels.shape);
            pixels.shape = shape;
            let latent = encoder
                .encode(&pixels)
                .with_context(|| format!("image encoder failed on {}", path.display()))?;
            Ok(squeeze_batch(latent))
        })
    }

    /// Tokenize without consulting or filling the cache.
    pub fn tokenize_fresh(
        &self,
        caption: &str,
        rng: &mut dyn rand::RngCore,
    ) -> anyhow::Result<TokenizedCaption> {
        let stack = self.text.as_ref().context("no tokenizer configured")?;
        tokenize_caption(
            stack.primary_tokenizer().as_ref(),
            caption,
            &self.caption_opts,
            rng,
        )
    }

    /// Shuffled tags change on every access, so those ids are never memoized.
    pub fn get_or_compute_caption_ids(
        &self,
        path: &Path,
        caption: &str,
        rng: &mut dyn rand::RngCore,
    ) -> anyhow::Result<TensorData> {
        if self.caption_opts.shuffle_tags {
            return Ok(self.tokenize_fresh(caption, rng)?.ids);
        }
        self.cache
            .caption_ids
            .get_or_try_insert_with(path, || Ok(self.tokenize_fresh(caption, rng)?.ids))
    }

    pub fn get_or_compute_conditioning(
        &self,
        path: &Path,
        resolution: (u32, u32),
        caption: &str,
        rng: &mut dyn rand::RngCore,
    ) -> anyhow::Result<(TensorData, AddedConditioning)> {
        let stack = self
            .text
            .as_ref()
            .filter(|s| s.is_dual())
            .context("conditioning requires a dual text stack")?;
        self.cache.conditioning.get_or_try_insert_with(path, || {
            compute_conditioning(stack, resolution, caption, &self.caption_opts, rng)
        })
    }

    /// Compute everything one sample needs for the current configuration.
    fn process(
        &self,
        entry: &BucketEntry,
        resolution: (u32, u32),
        staging: &HashMap<PathBuf, TensorData>,
    ) -> anyhow::Result<()> {
        let path = entry.path.as_path();
        if self.caches_latents() {
            match staging.get(path) {
                Some(latent) if !self.cache.latents.contains(path) => {
                    self.cache.latents.insert(path.to_path_buf(), latent.clone());
                }
                Some(_) => {}
                None => {
                    self.get_or_compute_latent(path, resolution)?;
                }
            }
        }
        let mut rng = sample_rng(self.seed, path, 0);
        if self.uses_conditioning() {
            self.get_or_compute_conditioning(path, resolution, &entry.caption, &mut rng)?;
        }
        if self.text.is_some() && !self.caption_opts.shuffle_tags {
            self.get_or_compute_caption_ids(path, &entry.caption, &mut rng)?;
        }
        Ok(())
    }
}

/// Result of one materialization pass.
#[derive(Debug, Clone, Default)]
pub struct Materialized {
    /// Flattened samples in processing order.
    pub samples: Vec<BucketEntry>,
    /// Path → first index in `samples`.
    pub sample_index: HashMap<PathBuf, usize>,
    pub instance_table: BucketTable,
    pub reference_table: BucketTable,
    /// Example count per bucket, in visiting order.
    pub bucket_sizes: IndexMap<BucketKey, usize>,
    pub total_len: usize,
    pub totals: MaterializeTotals,
    /// Paths that failed and were evicted.
    pub failed: Vec<PathBuf>,
}

impl Materialized {
    pub fn summaries(&self) -> Vec<BucketSummary> {
        self.instance_table
            .iter()
            .map(|(key, entries)| {
                let refs = self.reference_table.get(key).map(Vec::len).unwrap_or(0);
                BucketSummary::new(*key, entries.len(), refs)
            })
            .collect()
    }
}

pub struct BucketMaterializer<'a> {
    pipeline: &'a ArtifactPipeline,
    store: &'a LatentCacheFile,
    progress: &'a dyn ProgressSink,
}

impl<'a> BucketMaterializer<'a> {
    pub fn new(
        pipeline: &'a ArtifactPipeline,
        store: &'a LatentCacheFile,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        Self {
            pipeline,
            store,
            progress,
        }
    }

    pub fn materialize(
        &self,
        instance: &[SampleDescriptor],
        reference: &[SampleDescriptor],
        resolutions: &[(u32, u32)],
    ) -> Materialized {
        let t0 = Instant::now();
        let mut failed: HashSet<PathBuf> = HashSet::new();
        let mut instance_table = BucketTable::new();
        let mut reference_table = BucketTable::new();
        for (samples, table) in [
            (instance, &mut instance_table),
            (reference, &mut reference_table),
        ] {
            for sample in samples {
                match assign_bucket(sample, resolutions) {
                    Ok(key) => table.entry(key).or_default().push(BucketEntry {
                        path: sample.path.clone(),
                        caption: sample.caption.clone(),
                        is_reference: sample.is_reference,
                    }),
                    Err(e) => {
                        tracing::warn!("skipping {}: {e}", sample.path.display());
                        failed.insert(sample.path.clone());
                    }
                }
            }
        }

        let staging = self.load_staging();
        let stage = if self.pipeline.caches_latents() {
            "Caching latents..."
        } else {
            "Processing images..."
        };
        self.progress.set_stage(stage);
        // References in buckets without instances are never visited.
        let planned: usize = instance_table
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, entries)| entries.len() + reference_table.get(key).map_or(0, Vec::len))
            .sum();
        self.progress.reset(planned);

        let mut samples: Vec<BucketEntry> = Vec::new();
        for (key, entries) in instance_table.iter() {
            if entries.is_empty() {
                continue;
            }
            let resolution = key.resolution();
            let refs = reference_table.get(key).map(Vec::as_slice).unwrap_or(&[]);
            for bucket in [entries.as_slice(), refs] {
                let mut results: Vec<(usize, anyhow::Result<()>)> = bucket
                    .par_iter()
                    .enumerate()
                    .map(|(i, entry)| {
                        let res = self.pipeline.process(entry, resolution, &staging);
                        self.progress.advance(1);
                        (i, res)
                    })
                    .collect();
                results.sort_by_key(|(i, _)| *i);
                for (i, res) in results {
                    let entry = &bucket[i];
                    match res {
                        Ok(()) => samples.push(entry.clone()),
                        Err(e) => {
                            tracing::warn!(
                                "Exception caching: {}: {e:#}",
                                entry.path.display()
                            );
                            failed.insert(entry.path.clone());
                        }
                    }
                }
            }
        }

        for path in &failed {
            self.pipeline.cache().evict(path);
        }
        samples.retain(|s| !failed.contains(&s.path));
        for table in [&mut instance_table, &mut reference_table] {
            for entries in table.values_mut() {
                entries.retain(|e| !failed.contains(&e.path));
            }
            table.retain(|_, entries| !entries.is_empty());
        }

        let mut sample_index = HashMap::with_capacity(samples.len());
        for (i, s) in samples.iter().enumerate() {
            sample_index.entry(s.path.clone()).or_insert(i);
        }

        let mut bucket_sizes = IndexMap::new();
        let mut totals = MaterializeTotals::default();
        for (key, entries) in instance_table.iter() {
            let refs = reference_table.get(key).map(Vec::len).unwrap_or(0);
            let examples = example_len(entries.len(), refs);
            bucket_sizes.insert(*key, examples);
            totals.instances += entries.len();
            totals.references += refs;
            totals.examples += examples;
        }
        totals.buckets = bucket_sizes.len();
        self.write_breakdown(&instance_table, &reference_table, &bucket_sizes, &totals);

        if self.pipeline.caches_latents() {
            self.persist(&staging);
        }

        let mut failed: Vec<PathBuf> = failed.into_iter().collect();
        failed.sort();
        tracing::info!(
            "Total images / batch: {}, {} failed, pass took {} ms",
            totals.examples,
            failed.len(),
            t0.elapsed().as_millis()
        );
        Materialized {
            samples,
            sample_index,
            instance_table,
            reference_table,
            total_len: totals.examples,
            bucket_sizes,
            totals,
            failed,
        }
    }

    fn load_staging(&self) -> HashMap<PathBuf, TensorData> {
        if !self.pipeline.caches_latents() || !self.store.exists() {
            return HashMap::new();
        }
        tracing::info!("Loading cached latents...");
        match self.store.load() {
            Ok(staging) => staging,
            Err(e) => {
                tracing::warn!(
                    "could not read latent cache {}, starting cold: {e}",
                    self.store.path().display()
                );
                HashMap::new()
            }
        }
    }

    fn persist(&self, staging: &HashMap<PathBuf, TensorData>) {
        let live = self.pipeline.cache().latents.keys();
        if live.is_empty() {
            return;
        }
        let staged: HashSet<PathBuf> = staging.keys().cloned().collect();
        if live == staged {
            tracing::debug!(
                "latent cache {} unchanged, skipping write",
                self.store.path().display()
            );
            return;
        }
        tracing::info!("Saving cache!");
        let entries = self.pipeline.cache().latents.entries();
        if let Err(e) = self.store.save(&entries) {
            tracing::warn!(
                "failed to write latent cache {}: {e}",
                self.store.path().display()
            );
        }
    }

    fn write_breakdown(
        &self,
        instance_table: &BucketTable,
        reference_table: &BucketTable,
        bucket_sizes: &IndexMap<BucketKey, usize>,
        totals: &MaterializeTotals,
    ) {
        let idx_w = bucket_sizes.len().to_string().len();
        let inst_w = totals.instances.to_string().len();
        let ref_w = totals.references.to_string().len();
        let ex_w = totals.examples.to_string().len();
        for (i, (key, examples)) in bucket_sizes.iter().enumerate() {
            let instances = instance_table.get(key).map(Vec::len).unwrap_or(0);
            let references = reference_table.get(key).map(Vec::len).unwrap_or(0);
            self.progress.write_line(&format!(
                "Bucket {i:>idx_w$} {key} - Instance Images: {instances:>inst_w$} | Class Images: {references:>ref_w$} | Max Examples/batch: {examples:>ex_w$}"
            ));
        }
        self.progress.write_line(&format!(
            "Total Buckets {:>idx_w$} - Instance Images: {:>inst_w$} | Class Images: {:>ref_w$} | Max Examples/batch: {:>ex_w$}",
            totals.buckets, totals.instances, totals.references, totals.examples
        ));
    }
}
