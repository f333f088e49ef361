//! On-disk latent cache: one safetensors file per base resolution.
//!
//! Each tensor is keyed by its sample path; `__metadata__` carries a format tag
//! and the settings fingerprint. Files are only ever written whole (temp file +
//! rename), so a reader never observes a partially written snapshot.

use crate::config::DatasetConfig;
use crate::types::{BucketDatasetError, DatasetResult};
use burn::tensor::{DType, TensorData};
use memmap2::MmapOptions;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensorError, SafeTensors};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::Instant;

const FORMAT_TAG: &str = "bucket_dataset.latents";

/// Latents keep half precision when they arrive in it; everything else is stored as F32.
fn stored_dtype(dtype: DType) -> Dtype {
    match dtype {
        DType::F16 => Dtype::F16,
        DType::BF16 => Dtype::BF16,
        _ => Dtype::F32,
    }
}

/// sha256 over everything that changes what a cached latent looks like.
pub fn config_fingerprint(cfg: &DatasetConfig) -> String {
    #[derive(Serialize)]
    struct FingerprintTuple<'a> {
        resolution: u32,
        bucket: &'a crate::buckets::BucketSpec,
        hflip: bool,
        dynamic_img_norm: bool,
        code_version: &'a str,
    }
    let tuple = FingerprintTuple {
        resolution: cfg.resolution,
        bucket: &cfg.bucket,
        hflip: cfg.hflip,
        dynamic_img_norm: cfg.dynamic_img_norm,
        code_version: env!("CARGO_PKG_VERSION"),
    };
    let bytes = serde_json::to_vec(&tuple).unwrap_or_default();
    use sha2::Digest;
    let hash = sha2::Sha256::digest(bytes);
    format!("{:x}", hash)
}

#[derive(Debug, Clone)]
pub struct LatentCacheFile {
    path: PathBuf,
    fingerprint: String,
}

impl LatentCacheFile {
    pub fn for_resolution(cache_dir: &Path, resolution: u32, fingerprint: String) -> Self {
        Self {
            path: cache_dir.join(format!("image_cache_{resolution}.safetensors")),
            fingerprint,
        }
    }

    pub fn for_config(cfg: &DatasetConfig) -> Self {
        Self::for_resolution(&cfg.cache_dir, cfg.resolution, config_fingerprint(cfg))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read every cached latent. A missing file, or one written under a
    /// different fingerprint, yields an empty map.
    pub fn load(&self) -> DatasetResult<HashMap<PathBuf, TensorData>> {
        if !self.exists() {
            return Ok(HashMap::new());
        }
        let t0 = Instant::now();
        let file = File::open(&self.path).map_err(|e| BucketDatasetError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| BucketDatasetError::Io {
                    path: self.path.clone(),
                    source: std::io::Error::other(e.to_string()),
                })?
        };

        let (_, header) = SafeTensors::read_metadata(&mmap).map_err(|e| self.format_err(e))?;
        let metadata = header.metadata().clone().unwrap_or_default();
        if metadata.get("format").map(String::as_str) != Some(FORMAT_TAG) {
            return Err(self.format_err("missing or unknown format tag"));
        }
        if metadata.get("fingerprint") != Some(&self.fingerprint) {
            tracing::warn!(
                "latent cache {} was written with different settings; ignoring it",
                self.path.display()
            );
            return Ok(HashMap::new());
        }

        let tensors = SafeTensors::deserialize(&mmap).map_err(|e| self.format_err(e))?;
        let mut latents = HashMap::new();
        for (name, view) in tensors.tensors() {
            let tensor = self.decode_view(&name, &view)?;
            latents.insert(PathBuf::from(name), tensor);
        }
        tracing::debug!(
            "loaded {} cached latents from {} in {} ms",
            latents.len(),
            self.path.display(),
            t0.elapsed().as_millis()
        );
        Ok(latents)
    }

    /// Replace the file with a snapshot of `entries`. Empty snapshots are never written.
    pub fn save(&self, entries: &[(PathBuf, TensorData)]) -> DatasetResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let encoded = entries
            .iter()
            .map(|(path, tensor)| {
                let dtype = stored_dtype(tensor.dtype);
                Ok((
                    path.to_string_lossy().into_owned(),
                    dtype,
                    tensor.shape.clone(),
                    encode_tensor(tensor, dtype)?,
                ))
            })
            .collect::<DatasetResult<Vec<_>>>()?;
        let views = encoded
            .iter()
            .map(|(name, dtype, shape, bytes)| {
                TensorView::new(*dtype, shape.clone(), bytes)
                    .map(|view| (name.clone(), view))
                    .map_err(|e| self.format_err(e))
            })
            .collect::<DatasetResult<Vec<_>>>()?;
        let metadata = HashMap::from([
            ("format".to_string(), FORMAT_TAG.to_string()),
            ("fingerprint".to_string(), self.fingerprint.clone()),
        ]);

        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| BucketDatasetError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let tmp = self.path.with_extension("safetensors.tmp");
        safetensors::serialize_to_file(views, &Some(metadata), &tmp).map_err(|e| match e {
            SafeTensorError::IoError(source) => BucketDatasetError::Io {
                path: tmp.clone(),
                source,
            },
            other => self.format_err(other),
        })?;
        File::open(&tmp)
            .and_then(|f| f.sync_all())
            .map_err(|e| BucketDatasetError::Io {
                path: tmp.clone(),
                source: e,
            })?;
        fs::rename(&tmp, &self.path).map_err(|e| BucketDatasetError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        tracing::debug!(
            "wrote {} latents to {}",
            entries.len(),
            self.path.display()
        );
        Ok(())
    }

    fn decode_view(&self, name: &str, view: &TensorView<'_>) -> DatasetResult<TensorData> {
        let raw = view.data();
        let shape = view.shape().to_vec();
        Ok(match view.dtype() {
            Dtype::F32 => TensorData::new(
                raw.chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<_>>(),
                shape,
            ),
            Dtype::F16 => TensorData::new(
                raw.chunks_exact(2)
                    .map(|c| half::f16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<_>>(),
                shape,
            ),
            Dtype::BF16 => TensorData::new(
                raw.chunks_exact(2)
                    .map(|c| half::bf16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<_>>(),
                shape,
            ),
            other => {
                return Err(self.format_err(format!("{name}: unsupported dtype {other:?}")));
            }
        })
    }

    fn format_err(&self, msg: impl std::fmt::Display) -> BucketDatasetError {
        BucketDatasetError::CacheFormat {
            path: self.path.clone(),
            msg: msg.to_string(),
        }
    }
}

fn encode_tensor(tensor: &TensorData, dtype: Dtype) -> DatasetResult<Vec<u8>> {
    let tensor_err = |e| BucketDatasetError::Tensor(format!("{e:?}"));
    Ok(match dtype {
        Dtype::F16 => tensor
            .to_vec::<half::f16>()
            .map_err(tensor_err)?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        Dtype::BF16 => tensor
            .to_vec::<half::bf16>()
            .map_err(tensor_err)?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
        _ => crate::tensor::f32_values(tensor)?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect(),
    })
}
