//! Aspect-ratio bucket enumeration and sample assignment.

use crate::registry::SampleDescriptor;
use crate::types::{BucketDatasetError, BucketEntry, BucketKey, BucketSummary, DatasetResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Bucket key → samples, in insertion order until an explicit shuffle.
pub type BucketTable = IndexMap<BucketKey, Vec<BucketEntry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpec {
    /// Smallest side length a bucket may have.
    pub min_size: u32,
    /// Largest side length a bucket may have.
    pub max_size: u32,
    /// Every side is a multiple of this.
    pub divisible: u32,
}

impl Default for BucketSpec {
    fn default() -> Self {
        Self {
            min_size: 256,
            max_size: 1024,
            divisible: 64,
        }
    }
}

impl BucketSpec {
    pub fn validate(&self) -> DatasetResult<()> {
        if self.divisible == 0 {
            return Err(BucketDatasetError::Configuration(
                "bucket divisible step must be positive".to_string(),
            ));
        }
        if self.min_size > self.max_size {
            return Err(BucketDatasetError::Configuration(format!(
                "bucket min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Enumerate candidate bucket resolutions whose area stays within `base²`.
///
/// The result is sorted and deduplicated so enumeration order is stable across runs.
pub fn make_bucket_resolutions(base: u32, spec: &BucketSpec) -> Vec<(u32, u32)> {
    let div = spec.divisible.max(1) as u64;
    let max_area = base as u64 * base as u64;
    let max_size = spec.max_size.max(base) as u64;
    let min_size = spec.min_size as u64;

    let mut resos = BTreeSet::new();
    let square = (base as u64 / div) * div;
    if square > 0 {
        resos.insert((square as u32, square as u32));
    }

    let mut width = min_size.max(div).div_ceil(div) * div;
    while width <= max_size {
        let height = max_size.min((max_area / width / div) * div);
        if height >= min_size && height > 0 {
            resos.insert((width as u32, height as u32));
            resos.insert((height as u32, width as u32));
        }
        width += div;
    }
    resos.into_iter().collect()
}

/// Pick the candidate whose aspect ratio is closest to `width / height` (log space).
///
/// Ties resolve to the first candidate in enumeration order.
pub fn closest_resolution(
    width: u32,
    height: u32,
    candidates: &[(u32, u32)],
) -> DatasetResult<(u32, u32)> {
    if width == 0 || height == 0 {
        return Err(BucketDatasetError::Other(format!(
            "cannot bucket a {width}x{height} image"
        )));
    }
    let target = (width as f64 / height as f64).ln();
    let mut best: Option<((u32, u32), f64)> = None;
    for &(cw, ch) in candidates {
        let dist = ((cw as f64 / ch as f64).ln() - target).abs();
        match best {
            Some((_, d)) if dist >= d => {}
            _ => best = Some(((cw, ch), dist)),
        }
    }
    best.map(|(reso, _)| reso)
        .ok_or_else(|| BucketDatasetError::Other("no bucket resolutions available".to_string()))
}

pub fn assign_bucket(
    sample: &SampleDescriptor,
    candidates: &[(u32, u32)],
) -> DatasetResult<BucketKey> {
    let (w, h) = sample.native_resolution;
    let (bw, bh) = closest_resolution(w, h, candidates)?;
    Ok(BucketKey::new(bw, bh, sample.group_id))
}

pub fn sort_into_table(
    samples: &[SampleDescriptor],
    candidates: &[(u32, u32)],
    table: &mut BucketTable,
) -> DatasetResult<()> {
    for sample in samples {
        let key = assign_bucket(sample, candidates)?;
        table.entry(key).or_default().push(BucketEntry {
            path: sample.path.clone(),
            caption: sample.caption.clone(),
            is_reference: sample.is_reference,
        });
    }
    Ok(())
}

/// Partition both populations; returns `(instance_table, reference_table)`.
pub fn build_tables(
    instance: &[SampleDescriptor],
    reference: &[SampleDescriptor],
    candidates: &[(u32, u32)],
) -> DatasetResult<(BucketTable, BucketTable)> {
    let mut instance_table = BucketTable::new();
    let mut reference_table = BucketTable::new();
    sort_into_table(instance, candidates, &mut instance_table)?;
    sort_into_table(reference, candidates, &mut reference_table)?;
    Ok((instance_table, reference_table))
}

/// Dry-run breakdown of the buckets a materialization pass would visit.
pub fn plan_buckets(
    instance: &[SampleDescriptor],
    reference: &[SampleDescriptor],
    candidates: &[(u32, u32)],
) -> DatasetResult<Vec<BucketSummary>> {
    let (instance_table, reference_table) = build_tables(instance, reference, candidates)?;
    Ok(instance_table
        .iter()
        .filter(|(_, entries)| !entries.is_empty())
        .map(|(key, entries)| {
            let refs = reference_table.get(key).map(Vec::len).unwrap_or(0);
            BucketSummary::new(*key, entries.len(), refs)
        })
        .collect())
}
