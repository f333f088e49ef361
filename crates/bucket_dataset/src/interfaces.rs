//! Contracts for the external collaborators the dataset drives.

use crate::types::TextEncoding;
use burn::tensor::TensorData;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    /// Pad every sequence to the model max length.
    MaxLength,
    /// Pad to the longest sequence in the batch (a single prompt: no padding).
    Longest,
}

pub trait Tokenizer: Send + Sync {
    fn tokenize(
        &self,
        text: &str,
        padding: Padding,
        truncation: bool,
        add_special_tokens: bool,
    ) -> anyhow::Result<Vec<i64>>;
    fn decode(&self, ids: &[i64]) -> anyhow::Result<String>;
    fn model_max_length(&self) -> usize;
    fn bos_token(&self) -> &str;
    fn eos_token(&self) -> &str;
    fn bos_token_id(&self) -> i64;
    fn eos_token_id(&self) -> i64;
    fn pad_token_id(&self) -> i64 {
        self.eos_token_id()
    }
}

/// Token ids `[1, n]` → sequence and pooled embeddings.
pub trait TextEncoder: Send + Sync {
    fn encode(&self, token_ids: &TensorData) -> anyhow::Result<TextEncoding>;
}

/// Normalized image `[1, 3, H, W]` → latent.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, image: &TensorData) -> anyhow::Result<TensorData>;
}

/// Decodes an image and fits it (resize + crop) to the bucket resolution.
pub trait ImageLoader: Send + Sync {
    fn load_and_fit(&self, path: &Path, resolution: (u32, u32)) -> anyhow::Result<image::RgbImage>;
}

#[derive(Clone)]
pub struct TextBranch {
    pub tokenizer: Arc<dyn Tokenizer>,
    pub encoder: Option<Arc<dyn TextEncoder>>,
}

impl TextBranch {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            encoder: None,
        }
    }

    pub fn with_encoder(mut self, encoder: Arc<dyn TextEncoder>) -> Self {
        self.encoder = Some(encoder);
        self
    }
}

/// One tokenizer/encoder pair, or two whose embeddings are combined into conditioning tensors.
#[derive(Clone)]
pub enum TextStack {
    Single(TextBranch),
    Dual(TextBranch, TextBranch),
}

impl TextStack {
    /// Tokenizer used for caption ids and debug round trips.
    pub fn primary_tokenizer(&self) -> &Arc<dyn Tokenizer> {
        match self {
            TextStack::Single(branch) | TextStack::Dual(branch, _) => &branch.tokenizer,
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, TextStack::Dual(..))
    }

    pub fn branches(&self) -> Vec<&TextBranch> {
        match self {
            TextStack::Single(branch) => vec![branch],
            TextStack::Dual(first, second) => vec![first, second],
        }
    }
}
