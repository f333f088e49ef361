//! Fake collaborators shared by the integration tests.
#![allow(dead_code)]

use bucket_dataset::{
    BucketSpec, DatasetConfig, ImageEncoder, ImageLoader, Padding, SampleDescriptor,
    TextEncoder, TextEncoding, Tokenizer,
};
use burn::tensor::TensorData;
use image::{Rgb, RgbImage};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const PAD: i64 = 0;
pub const BOS: i64 = 1;
pub const EOS: i64 = 2;

/// Whitespace tokenizer with a growing vocabulary, so decode round-trips.
pub struct WordTokenizer {
    vocab: Mutex<Vec<String>>,
    max_len: usize,
}

impl WordTokenizer {
    pub fn new(max_len: usize) -> Self {
        Self {
            vocab: Mutex::new(Vec::new()),
            max_len,
        }
    }

    fn id_of(&self, word: &str) -> i64 {
        let mut vocab = self.vocab.lock().unwrap();
        let pos = match vocab.iter().position(|w| w == word) {
            Some(pos) => pos,
            None => {
                vocab.push(word.to_string());
                vocab.len() - 1
            }
        };
        pos as i64 + 3
    }
}

impl Tokenizer for WordTokenizer {
    fn tokenize(
        &self,
        text: &str,
        padding: Padding,
        truncation: bool,
        add_special_tokens: bool,
    ) -> anyhow::Result<Vec<i64>> {
        let mut ids: Vec<i64> = Vec::new();
        if add_special_tokens {
            ids.push(BOS);
        }
        ids.extend(text.split_whitespace().map(|w| self.id_of(w)));
        if add_special_tokens {
            ids.push(EOS);
        }
        if truncation && ids.len() > self.max_len {
            ids.truncate(self.max_len - 1);
            ids.push(EOS);
        }
        if padding == Padding::MaxLength {
            while ids.len() < self.max_len {
                ids.push(PAD);
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[i64]) -> anyhow::Result<String> {
        let vocab = self.vocab.lock().unwrap();
        let words: Vec<&str> = ids
            .iter()
            .filter(|id| **id > EOS)
            .map(|id| vocab[(*id - 3) as usize].as_str())
            .collect();
        Ok(words.join(" "))
    }

    fn model_max_length(&self) -> usize {
        self.max_len
    }

    fn bos_token(&self) -> &str {
        "<s>"
    }

    fn eos_token(&self) -> &str {
        "</s>"
    }

    fn bos_token_id(&self) -> i64 {
        BOS
    }

    fn eos_token_id(&self) -> i64 {
        EOS
    }

    fn pad_token_id(&self) -> i64 {
        PAD
    }
}

/// Embeds every token id as a constant row of width `dim`.
pub struct ConstTextEncoder {
    pub dim: usize,
}

impl TextEncoder for ConstTextEncoder {
    fn encode(&self, token_ids: &TensorData) -> anyhow::Result<TextEncoding> {
        let ids = token_ids.to_vec::<i64>().map_err(|e| anyhow::anyhow!("{e:?}"))?;
        let n = ids.len();
        let sequence: Vec<f32> = ids
            .iter()
            .flat_map(|id| std::iter::repeat(*id as f32).take(self.dim))
            .collect();
        Ok(TextEncoding {
            sequence: TensorData::new(sequence, [1, n, self.dim]),
            pooled: TensorData::new(vec![n as f32; self.dim], [1, self.dim]),
        })
    }
}

/// Refuses prompts with more than `max_tokens` non-pad ids.
pub struct RefusingTextEncoder {
    pub max_tokens: usize,
    pub dim: usize,
}

impl TextEncoder for RefusingTextEncoder {
    fn encode(&self, token_ids: &TensorData) -> anyhow::Result<TextEncoding> {
        let ids = token_ids.to_vec::<i64>().map_err(|e| anyhow::anyhow!("{e:?}"))?;
        let used = ids.iter().filter(|id| **id != PAD).count();
        if used > self.max_tokens {
            anyhow::bail!("prompt of {used} tokens exceeds {}", self.max_tokens);
        }
        ConstTextEncoder { dim: self.dim }.encode(token_ids)
    }
}

/// `[1, 3, H, W]` → `[1, 4, H/8, W/8]`, counting calls.
#[derive(Default)]
pub struct CountingImageEncoder {
    pub calls: AtomicUsize,
}

impl CountingImageEncoder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEncoder for CountingImageEncoder {
    fn encode(&self, image: &TensorData) -> anyhow::Result<TensorData> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (h, w) = (image.shape[2] / 8, image.shape[3] / 8);
        Ok(TensorData::new(vec![0.25f32; 4 * h * w], [1, 4, h, w]))
    }
}

/// Solid-color images at the requested size; paths containing "corrupt" fail to decode.
pub struct SolidLoader;

impl ImageLoader for SolidLoader {
    fn load_and_fit(&self, path: &Path, resolution: (u32, u32)) -> anyhow::Result<RgbImage> {
        if path.to_string_lossy().contains("corrupt") {
            anyhow::bail!("unsupported image data in {}", path.display());
        }
        Ok(RgbImage::from_pixel(resolution.0, resolution.1, Rgb([128, 64, 32])))
    }
}

pub fn sample(name: &str, w: u32, h: u32, caption: &str) -> SampleDescriptor {
    SampleDescriptor {
        path: PathBuf::from(name),
        caption: caption.to_string(),
        native_resolution: (w, h),
        group_id: 0,
        is_reference: false,
    }
}

/// Small buckets: (128, 128) for squares, (192, 64) for 3:1 images.
pub fn small_config(cache_dir: &Path) -> DatasetConfig {
    DatasetConfig {
        resolution: 128,
        bucket: BucketSpec {
            min_size: 64,
            max_size: 256,
            divisible: 64,
        },
        cache_dir: cache_dir.to_path_buf(),
        seed: Some(7),
        ..DatasetConfig::default()
    }
}
