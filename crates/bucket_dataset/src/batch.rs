//! Bucket-at-a-time batch drawing and collation into Burn tensors.

use crate::dataset::BucketDataset;
use crate::tensor::{cat_rows, cat_rows_i64, stack};
use crate::types::{BucketDatasetError, BucketKey, DatasetResult, Example, ExampleImage, ExampleText};
use burn::tensor::backend::Backend;
use burn::tensor::{Int, Tensor, TensorData};

/// Draws fixed-size batches from one bucket at a time via the cyclic cursor.
///
/// A bucket is left once a batch wrapped its pairing list; the epoch ends when
/// every bucket has wrapped.
pub struct BucketBatchSampler {
    batch_size: usize,
    order: Vec<BucketKey>,
    current: usize,
    batches: usize,
}

impl BucketBatchSampler {
    pub fn new(batch_size: usize) -> DatasetResult<Self> {
        if batch_size == 0 {
            return Err(BucketDatasetError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        Ok(Self {
            batch_size,
            order: Vec::new(),
            current: 0,
            batches: 0,
        })
    }

    /// Reshuffle the dataset's pairings and restart from the first bucket.
    pub fn start_epoch(&mut self, dataset: &mut BucketDataset) {
        dataset.shuffle_buckets();
        self.order = dataset.bucket_order();
        self.current = 0;
        self.batches = 0;
    }

    pub fn batches_drawn(&self) -> usize {
        self.batches
    }

    /// Flattened indices of the next batch and the bucket they came from.
    pub fn next_indices(
        &mut self,
        dataset: &mut BucketDataset,
    ) -> DatasetResult<Option<(BucketKey, Vec<usize>)>> {
        let Some(&key) = self.order.get(self.current) else {
            return Ok(None);
        };
        let mut indices = Vec::with_capacity(self.batch_size);
        let mut wrapped_any = false;
        for _ in 0..self.batch_size {
            let (index, wrapped) = dataset.get_example(key)?;
            indices.push(index);
            wrapped_any |= wrapped;
        }
        if wrapped_any {
            self.current += 1;
        }
        self.batches += 1;
        Ok(Some((key, indices)))
    }

    pub fn next_batch(&mut self, dataset: &mut BucketDataset) -> DatasetResult<Option<Vec<Example>>> {
        let Some((key, indices)) = self.next_indices(dataset)? else {
            return Ok(None);
        };
        dataset.set_active_resolution(key.resolution());
        let examples = indices
            .into_iter()
            .map(|i| dataset.get_item(i))
            .collect::<DatasetResult<Vec<_>>>()?;
        Ok(Some(examples))
    }
}

pub struct BucketBatch<B: Backend> {
    /// Latents or normalized pixels, `[batch, C, H, W]`.
    pub images: Tensor<B, 4>,
    pub input_ids: Option<Tensor<B, 2, Int>>,
    /// Dual-encoder prompt embeddings, `[batch, seq, dim]`.
    pub prompt_embeds: Option<Tensor<B, 3>>,
    pub text_embeds: Option<Tensor<B, 2>>,
    pub time_ids: Option<Tensor<B, 2>>,
    /// Raw captions when no tokenizer is configured.
    pub captions: Vec<String>,
    pub is_reference: Vec<bool>,
    pub resolution: (u32, u32),
}

/// Stack same-bucket examples into batch tensors.
pub fn collate<B: Backend>(examples: &[Example], device: &B::Device) -> DatasetResult<BucketBatch<B>> {
    let first = examples
        .first()
        .ok_or_else(|| BucketDatasetError::Other("cannot collate an empty batch".to_string()))?;

    let images = examples
        .iter()
        .map(|ex| match &ex.image {
            ExampleImage::Latent(t) | ExampleImage::Pixels(t) => Ok(t),
            ExampleImage::Marker { .. } => Err(BucketDatasetError::Other(
                "debug inspection examples cannot be collated".to_string(),
            )),
        })
        .collect::<DatasetResult<Vec<&TensorData>>>()?;
    let images = stack(&images)?;
    if images.shape.len() != 4 {
        return Err(BucketDatasetError::Tensor(format!(
            "expected [C, H, W] images, got batch shape {:?}",
            images.shape
        )));
    }

    let mut token_ids = Vec::new();
    let mut embeds = Vec::new();
    let mut captions = Vec::new();
    for ex in examples {
        match &ex.text {
            ExampleText::TokenIds(t) => token_ids.push(t),
            ExampleText::Conditioning(t) => embeds.push(t),
            ExampleText::Caption(c) => captions.push(c.clone()),
            ExampleText::Inspect { .. } => {
                return Err(BucketDatasetError::Other(
                    "debug inspection examples cannot be collated".to_string(),
                ))
            }
        }
    }
    let kinds = [!token_ids.is_empty(), !embeds.is_empty(), !captions.is_empty()];
    if kinds.iter().filter(|k| **k).count() > 1 {
        return Err(BucketDatasetError::Other(
            "batch mixes token ids, embeddings and raw captions".to_string(),
        ));
    }

    let input_ids = if token_ids.is_empty() {
        None
    } else {
        Some(Tensor::<B, 2, Int>::from_data(cat_rows_i64(&token_ids)?, device))
    };
    let prompt_embeds = if embeds.is_empty() {
        None
    } else {
        Some(Tensor::<B, 3>::from_data(cat_rows(&embeds)?, device))
    };

    let added: Vec<_> = examples
        .iter()
        .filter_map(|ex| ex.added_conditioning.as_ref())
        .collect();
    let (text_embeds, time_ids) = if added.len() == examples.len() {
        let pooled: Vec<_> = added.iter().map(|a| &a.text_embeds).collect();
        let times: Vec<_> = added.iter().map(|a| &a.time_ids).collect();
        (
            Some(Tensor::<B, 2>::from_data(cat_rows(&pooled)?, device)),
            Some(Tensor::<B, 2>::from_data(cat_rows(&times)?, device)),
        )
    } else {
        (None, None)
    };

    Ok(BucketBatch {
        images: Tensor::<B, 4>::from_data(images, device),
        input_ids,
        prompt_embeds,
        text_embeds,
        time_ids,
        captions,
        is_reference: examples.iter().map(|ex| ex.is_reference).collect(),
        resolution: first.resolution,
    })
}
