//! In-memory artifact caches keyed by sample path.

use crate::types::AddedConditioning;
use burn::tensor::TensorData;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SHARDS: usize = 16;

/// Path-keyed map split over independently locked shards, so concurrent
/// workers only contend when their paths hash to the same shard.
pub struct ShardedMap<V> {
    shards: Vec<Mutex<HashMap<PathBuf, V>>>,
}

impl<V> Default for ShardedMap<V> {
    fn default() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }
}

impl<V: Clone> ShardedMap<V> {
    fn shard(&self, path: &Path) -> MutexGuard<'_, HashMap<PathBuf, V>> {
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        // A poisoned shard still holds consistent entries: values are inserted whole.
        self.shards[idx]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &Path) -> Option<V> {
        self.shard(path).get(path).cloned()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.shard(path).contains_key(path)
    }

    pub fn insert(&self, path: PathBuf, value: V) {
        let mut shard = self.shard(&path);
        shard.insert(path, value);
    }

    pub fn remove(&self, path: &Path) -> Option<V> {
        self.shard(path).remove(path)
    }

    /// Return the cached value or compute it outside the lock and store it.
    pub fn get_or_try_insert_with<E>(
        &self,
        path: &Path,
        compute: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        if let Some(v) = self.get(path) {
            return Ok(v);
        }
        let value = compute()?;
        self.insert(path.to_path_buf(), value.clone());
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().map(|m| m.len()).unwrap_or_else(|p| p.into_inner().len()))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> HashSet<PathBuf> {
        let mut keys = HashSet::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(|p| p.into_inner());
            keys.extend(guard.keys().cloned());
        }
        keys
    }

    /// Snapshot of every entry, sorted by path.
    pub fn entries(&self) -> Vec<(PathBuf, V)> {
        let mut out = Vec::new();
        for shard in &self.shards {
            let guard = shard.lock().unwrap_or_else(|p| p.into_inner());
            out.extend(guard.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

/// The three independent per-sample artifact maps.
#[derive(Default)]
pub struct ArtifactCache {
    pub latents: ShardedMap<TensorData>,
    pub caption_ids: ShardedMap<TensorData>,
    pub conditioning: ShardedMap<(TensorData, AddedConditioning)>,
}

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every artifact of `path`, leaving nothing partial behind.
    pub fn evict(&self, path: &Path) {
        self.latents.remove(path);
        self.caption_ids.remove(path);
        self.conditioning.remove(path);
    }

    pub fn contains_any(&self, path: &Path) -> bool {
        self.latents.contains(path)
            || self.caption_ids.contains(path)
            || self.conditioning.contains(path)
    }
}
