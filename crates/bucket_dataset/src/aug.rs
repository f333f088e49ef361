//! Image decode/fit and the fixed transform applied before encoding.

use crate::config::DatasetConfig;
use crate::interfaces::ImageLoader;
use crate::tensor::mean_std;
use anyhow::Context;
use burn::tensor::TensorData;
use image::imageops::FilterType;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Rng for one draw on one sample. Seeded runs hash `(seed, path, draw)` with
/// sha256, so the stream is stable across runs and toolchains.
pub(crate) fn sample_rng(seed: Option<u64>, path: &Path, draw: u64) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = Sha256::new();
            hasher.update(seed.to_le_bytes());
            hasher.update(path.to_string_lossy().as_bytes());
            hasher.update(draw.to_le_bytes());
            let mut bytes = [0u8; 32];
            bytes.copy_from_slice(&hasher.finalize());
            StdRng::from_seed(bytes)
        }
        None => StdRng::from_rng(&mut rand::rng()),
    }
}

/// Default loader: decode, resize to cover the bucket, center crop.
#[derive(Debug, Clone, Copy, Default)]
pub struct FitCropLoader;

impl ImageLoader for FitCropLoader {
    fn load_and_fit(&self, path: &Path, resolution: (u32, u32)) -> anyhow::Result<image::RgbImage> {
        let img = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?
            .to_rgb8();
        Ok(fit_crop(&img, resolution.0, resolution.1))
    }
}

/// Scale so the image covers `target_w x target_h`, then crop the center.
pub fn fit_crop(img: &image::RgbImage, target_w: u32, target_h: u32) -> image::RgbImage {
    let (w, h) = img.dimensions();
    if (w, h) == (target_w, target_h) {
        return img.clone();
    }
    let scale = f32::max(target_w as f32 / w as f32, target_h as f32 / h as f32);
    let new_w = ((w as f32 * scale).round() as u32).max(target_w);
    let new_h = ((h as f32 * scale).round() as u32).max(target_h);
    let resized = image::imageops::resize(img, new_w, new_h, FilterType::Triangle);
    let x0 = (new_w - target_w) / 2;
    let y0 = (new_h - target_h) / 2;
    image::imageops::crop_imm(&resized, x0, y0, target_w, target_h).to_image()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// `(x - mean) / std` with fixed per-image constants.
    Fixed { mean: f32, std: f32 },
    /// Mean/std computed from the image itself.
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct ImageTransform {
    pub flip_horizontal_prob: f32,
    pub normalization: Normalization,
    pub seed: Option<u64>,
    /// Accesses per path, so seeded flips change between epochs.
    draws: Arc<Mutex<HashMap<PathBuf, u64>>>,
}

impl Default for ImageTransform {
    fn default() -> Self {
        Self {
            flip_horizontal_prob: 0.0,
            normalization: Normalization::Fixed {
                mean: 0.5,
                std: 0.5,
            },
            seed: None,
            draws: Arc::default(),
        }
    }
}

impl ImageTransform {
    pub fn from_config(cfg: &DatasetConfig) -> Self {
        Self {
            flip_horizontal_prob: if cfg.debug_dataset {
                0.0
            } else {
                cfg.flip_prob()
            },
            normalization: if cfg.dynamic_img_norm {
                Normalization::Dynamic
            } else {
                Normalization::Fixed {
                    mean: 0.5,
                    std: 0.5,
                }
            },
            seed: cfg.seed,
            draws: Arc::default(),
        }
    }

    /// Flip (maybe), convert to CHW in [0, 1] and normalize. Output shape `[3, H, W]`.
    pub fn apply(&self, img: image::RgbImage, path: &Path) -> TensorData {
        let mut img = img;
        let draw = {
            let mut draws = self.draws.lock().unwrap_or_else(|p| p.into_inner());
            let count = draws.entry(path.to_path_buf()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let mut rng = sample_rng(self.seed, path, draw);
        maybe_hflip(&mut img, self.flip_horizontal_prob, &mut rng);

        let (width, height) = img.dimensions();
        let plane = (width * height) as usize;
        let mut chw = vec![0.0f32; plane * 3];
        for (x, y, pixel) in img.enumerate_pixels() {
            let base = (y * width + x) as usize;
            chw[base] = pixel[0] as f32 / 255.0;
            chw[plane + base] = pixel[1] as f32 / 255.0;
            chw[2 * plane + base] = pixel[2] as f32 / 255.0;
        }

        let (mean, std) = match self.normalization {
            Normalization::Fixed { mean, std } => (mean, std),
            Normalization::Dynamic => mean_std(&chw),
        };
        let std = if std.abs() < f32::EPSILON { 1.0 } else { std };
        for v in chw.iter_mut() {
            *v = (*v - mean) / std;
        }
        TensorData::new(chw, [3, height as usize, width as usize])
    }
}

pub(crate) fn maybe_hflip(img: &mut image::RgbImage, prob: f32, rng: &mut dyn rand::RngCore) {
    if prob <= 0.0 {
        return;
    }
    if rng.random_range(0.0..1.0) < prob {
        image::imageops::flip_horizontal_in_place(img);
    }
}
