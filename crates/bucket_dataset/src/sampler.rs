//! Per-bucket instance/reference pairing and the cyclic cursor over it.

use crate::buckets::BucketTable;
use crate::types::{BucketDatasetError, BucketEntry, BucketKey, DatasetResult};
use indexmap::IndexMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::path::PathBuf;

pub struct BalancedSampler {
    rng: StdRng,
    deterministic: bool,
    pairings: IndexMap<BucketKey, Vec<BucketEntry>>,
    positions: HashMap<BucketKey, usize>,
}

impl BalancedSampler {
    /// `deterministic` disables every shuffle and draws references round-robin.
    pub fn new(seed: Option<u64>, deterministic: bool) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        Self {
            rng,
            deterministic,
            pairings: IndexMap::new(),
            positions: HashMap::new(),
        }
    }

    /// Rebuild every pairing list and rewind all cursors.
    ///
    /// Each instance entry is followed by one reference entry drawn with
    /// replacement from the same key, when that key has references.
    pub fn shuffle(&mut self, instance_table: &BucketTable, reference_table: &BucketTable) {
        let mut keys: Vec<BucketKey> = instance_table
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(key, _)| *key)
            .collect();
        if !self.deterministic {
            keys.shuffle(&mut self.rng);
        }

        let mut pairings = IndexMap::with_capacity(keys.len());
        for key in keys {
            let mut instances = instance_table[&key].clone();
            if !self.deterministic {
                instances.shuffle(&mut self.rng);
            }
            let references = reference_table
                .get(&key)
                .filter(|refs| !refs.is_empty());
            let mut pairing = Vec::with_capacity(instances.len() * 2);
            for (i, instance) in instances.into_iter().enumerate() {
                pairing.push(instance);
                if let Some(refs) = references {
                    let pick = if self.deterministic {
                        i % refs.len()
                    } else {
                        self.rng.random_range(0..refs.len())
                    };
                    pairing.push(refs[pick].clone());
                }
            }
            pairings.insert(key, pairing);
        }
        self.pairings = pairings;
        self.positions.clear();
    }

    /// Keys with a pairing list, in this epoch's visiting order.
    pub fn keys(&self) -> Vec<BucketKey> {
        self.pairings.keys().copied().collect()
    }

    pub fn pairing(&self, key: &BucketKey) -> Option<&[BucketEntry]> {
        self.pairings.get(key).map(Vec::as_slice)
    }

    pub fn position(&self, key: &BucketKey) -> usize {
        self.positions.get(key).copied().unwrap_or(0)
    }

    /// Resolve the entry under the cursor of `key` to its flattened index and
    /// advance. The second value is true when this call completed a cycle.
    pub fn next(
        &mut self,
        key: &BucketKey,
        sample_index: &HashMap<PathBuf, usize>,
    ) -> DatasetResult<(usize, bool)> {
        let pairing = self
            .pairings
            .get(key)
            .filter(|p| !p.is_empty())
            .ok_or(BucketDatasetError::UnknownBucket(*key))?;
        let position = self.positions.entry(*key).or_insert(0);
        if *position >= pairing.len() {
            *position = 0;
        }
        let entry = &pairing[*position];
        let index = *sample_index
            .get(&entry.path)
            .ok_or_else(|| BucketDatasetError::MissingArtifact {
                path: entry.path.clone(),
                artifact: "flattened sample",
            })?;
        *position += 1;
        let wrapped = *position == pairing.len();
        if wrapped {
            *position = 0;
        }
        Ok((index, wrapped))
    }
}
