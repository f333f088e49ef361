//! Sample registry: instance and reference descriptors loaded once per dataset.

use crate::types::{BucketDatasetError, DatasetResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "bmp"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleDescriptor {
    pub path: PathBuf,
    pub caption: String,
    /// Native (width, height) of the source image.
    pub native_resolution: (u32, u32),
    /// Concept/prompt group; samples of different groups never share a bucket.
    #[serde(default)]
    pub group_id: usize,
    #[serde(default)]
    pub is_reference: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleRegistry {
    pub instance: Vec<SampleDescriptor>,
    pub reference: Vec<SampleDescriptor>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
    pub instances: usize,
    pub references: usize,
    /// group id → (instances, references)
    pub groups: BTreeMap<usize, (usize, usize)>,
    pub empty_captions: usize,
}

impl SampleRegistry {
    pub fn new(instance: Vec<SampleDescriptor>, reference: Vec<SampleDescriptor>) -> Self {
        let mut instance = instance;
        let mut reference = reference;
        instance.iter_mut().for_each(|s| s.is_reference = false);
        reference.iter_mut().for_each(|s| s.is_reference = true);
        Self {
            instance,
            reference,
        }
    }

    /// Load a JSON array of descriptors; `is_reference` splits the populations.
    pub fn from_manifest(path: &Path) -> DatasetResult<Self> {
        let raw = fs::read(path).map_err(|e| BucketDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let samples: Vec<SampleDescriptor> =
            serde_json::from_slice(&raw).map_err(|e| BucketDatasetError::Json {
                path: path.to_path_buf(),
                source: e,
            })?;
        let (reference, instance): (Vec<_>, Vec<_>) =
            samples.into_iter().partition(|s| s.is_reference);
        Ok(Self {
            instance,
            reference,
        })
    }

    pub fn save_manifest(&self, path: &Path) -> DatasetResult<()> {
        let all: Vec<&SampleDescriptor> = self.instance.iter().chain(&self.reference).collect();
        let data = serde_json::to_vec_pretty(&all).map_err(|e| BucketDatasetError::Json {
            path: path.to_path_buf(),
            source: e,
        })?;
        fs::write(path, data).map_err(|e| BucketDatasetError::Io {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn summary(&self) -> RegistrySummary {
        let mut summary = RegistrySummary {
            instances: self.instance.len(),
            references: self.reference.len(),
            ..Default::default()
        };
        for s in self.instance.iter().chain(&self.reference) {
            let entry = summary.groups.entry(s.group_id).or_default();
            if s.is_reference {
                entry.1 += 1;
            } else {
                entry.0 += 1;
            }
            if s.caption.trim().is_empty() {
                summary.empty_captions += 1;
            }
        }
        summary
    }
}

/// Scan a directory of images with optional sibling `.txt` captions.
///
/// Unreadable images are skipped with a warning; the result is sorted by path.
pub fn scan_directory(
    dir: &Path,
    group_id: usize,
    is_reference: bool,
) -> DatasetResult<Vec<SampleDescriptor>> {
    let entries = fs::read_dir(dir).map_err(|e| BucketDatasetError::Io {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut samples = Vec::new();
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let is_image = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            .unwrap_or(false);
        if !is_image {
            continue;
        }
        let native_resolution = match image::image_dimensions(&path) {
            Ok(dims) => dims,
            Err(e) => {
                tracing::warn!("skipping unreadable image {}: {e}", path.display());
                continue;
            }
        };
        let caption_path = path.with_extension("txt");
        let caption = if caption_path.exists() {
            fs::read_to_string(&caption_path)
                .map_err(|e| BucketDatasetError::Io {
                    path: caption_path.clone(),
                    source: e,
                })?
                .trim()
                .to_string()
        } else {
            String::new()
        };
        samples.push(SampleDescriptor {
            path,
            caption,
            native_resolution,
            group_id,
            is_reference,
        });
    }
    samples.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(samples)
}
