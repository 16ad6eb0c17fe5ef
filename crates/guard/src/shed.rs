//! Deterministic cache eviction, plus the weighted memory-tier entries the
//! shedder prunes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use vigil_store::Store;

use crate::MemoryGuardian;

/// KV key holding the weighted memory-tier entries.
pub const MEMORY_TIERS_KEY: &str = "memory-tiers";
/// Prefix for disposable test artifacts.
const TEST_ARTIFACT_PREFIX: &str = "test-";
/// Prefix for scheduled-briefing cache entries.
const BRIEFING_CACHE_PREFIX: &str = "briefing-cache:";
/// Briefing cache entries kept after a shed.
const BRIEFING_KEEP: usize = 3;
/// Any unprotected blob bigger than this is dropped during a shed.
const OVERSIZED_BYTES: usize = 100 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierLevel {
    T1,
    T2,
    T3,
}

/// One weighted entry in the `memory-tiers` blob.  Weight decays on neglect
/// and boosts on confirmation; the shedder prunes from the bottom.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryTierEntry {
    pub fingerprint: String,
    pub kind: String,
    pub weight: f64,
    pub tags: Vec<String>,
    pub access_count: u64,
    pub mention_count: u64,
    pub tier: TierLevel,
    pub last_seen: i64,
}

impl MemoryTierEntry {
    /// Multiplicative decay toward zero for entries that go unmentioned.
    pub fn decay(&mut self) {
        self.weight = (self.weight * 0.9).max(0.0);
    }

    /// Confirmation nudges the weight back up, capped at 1.
    pub fn boost(&mut self) {
        self.weight = (self.weight + 0.15).min(1.0);
        self.mention_count += 1;
    }
}

/// Stable identity for tracked content: SHA-256 of the lowercased, trimmed
/// prefix (at most 120 chars), hex-encoded and truncated.
pub fn fingerprint(content: &str) -> String {
    let normalized: String = content.trim().to_lowercase().chars().take(120).collect();
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let digest = hasher.finalize();
    format!("{digest:x}")[..16].to_string()
}

impl MemoryGuardian {
    /// Evict caches in a fixed order, returning how many keys were removed
    /// or trimmed:
    ///
    /// 1. hint the allocator (no collector to force in this runtime);
    /// 2. delete test-artifact keys;
    /// 3. drop old scheduled-briefing cache keys, keeping the newest three;
    /// 4. trim any oversized unprotected key, pruning `memory-tiers` down to
    ///    its lowest-weight entries instead of deleting it.
    pub fn shed_cache(&self, store: &Store) -> usize {
        let mut freed = 0;

        // Step 1: nothing to force in Rust; the drop traffic below is the
        // real release.
        debug!("cache shed pass starting");

        match store.kv_delete_prefix(TEST_ARTIFACT_PREFIX) {
            Ok(n) => freed += n,
            Err(err) => warn!(%err, "failed to delete test artifacts"),
        }

        match store.kv_keys_with_prefix(BRIEFING_CACHE_PREFIX) {
            Ok(keys) if keys.len() > BRIEFING_KEEP => {
                for key in &keys[..keys.len() - BRIEFING_KEEP] {
                    match store.kv_delete(key) {
                        Ok(true) => freed += 1,
                        Ok(false) => {}
                        Err(err) => warn!(%err, key, "failed to delete briefing cache key"),
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!(%err, "failed to list briefing cache keys"),
        }

        let sizes = match store.kv_sizes() {
            Ok(sizes) => sizes,
            Err(err) => {
                warn!(%err, "failed to read kv sizes");
                return freed;
            }
        };
        for (key, size) in sizes {
            if size <= OVERSIZED_BYTES || self.is_protected(&key) {
                continue;
            }
            if key == MEMORY_TIERS_KEY {
                freed += self.prune_memory_tiers(store);
                continue;
            }
            match store.kv_delete(&key) {
                Ok(true) => {
                    debug!(key, size, "oversized cache key dropped");
                    freed += 1;
                }
                Ok(false) => {}
                Err(err) => warn!(%err, key, "failed to drop oversized key"),
            }
        }

        freed
    }

    fn is_protected(&self, key: &str) -> bool {
        self.protected_key_list().iter().any(|p| p == key)
    }

    pub(crate) fn protected_key_list(&self) -> &[String] {
        &self.protected_keys
    }

    pub(crate) fn max_tracked(&self) -> usize {
        self.max_tracked_tiers
    }

    /// Keep only the heaviest entries, up to the configured tracked maximum.
    fn prune_memory_tiers(&self, store: &Store) -> usize {
        let Ok(Some(mut entries)) = store.kv_get::<Vec<MemoryTierEntry>>(MEMORY_TIERS_KEY) else {
            return 0;
        };
        let max = self.max_tracked();
        if entries.len() <= max {
            return 0;
        }
        entries.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        let pruned = entries.len() - max;
        entries.truncate(max);
        if let Err(err) = store.kv_set(MEMORY_TIERS_KEY, &entries) {
            warn!(%err, "failed to write pruned memory tiers");
            return 0;
        }
        debug!(pruned, kept = max, "memory-tiers pruned to heaviest entries");
        pruned
    }
}
