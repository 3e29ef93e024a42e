//! Deduplication and deterministic per-group sampling of service identifiers.
//!
//! Identifiers are deduplicated and sorted, grouped by scheduled-arrival
//! hour (the origin and destination are fixed per task), and every group
//! larger than the cap is reduced with Algorithm R. The reservoir's
//! generator is seeded from SHA-256 of the task key and the group, so a
//! re-run selects exactly the same subset.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::api::RidRef;

/// Fixed-size uniform sample over a stream (Algorithm R).
#[derive(Debug, Clone)]
pub struct ReservoirSampler<T> {
    reservoir: Vec<T>,
    capacity: usize,
    seen: u64,
    rng_state: u64,
}

impl<T> ReservoirSampler<T> {
    /// Sampler keeping at most `capacity` items, driven by `seed`.
    #[must_use]
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Self {
            reservoir: Vec::with_capacity(capacity),
            capacity,
            seen: 0,
            rng_state: seed,
        }
    }

    pub fn observe(&mut self, item: T) {
        self.seen += 1;
        if self.reservoir.len() < self.capacity {
            self.reservoir.push(item);
        } else if self.capacity > 0 {
            let j = self.next_u64() % self.seen;
            if j < self.capacity as u64 {
                self.reservoir[j as usize] = item;
            }
        }
    }

    #[must_use]
    pub fn seen(&self) -> u64 {
        self.seen
    }

    #[must_use]
    pub fn into_sample(self) -> Vec<T> {
        self.reservoir
    }

    /// SplitMix64 step.
    fn next_u64(&mut self) -> u64 {
        self.rng_state = self.rng_state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.rng_state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }
}

/// First eight bytes of SHA-256 over `parts`, joined by `|`.
#[must_use]
pub fn stable_seed(parts: &[&str]) -> u64 {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update(b"|");
        }
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Result of narrowing identifiers down for detail lookups.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RidSelection {
    /// Selected identifiers, sorted.
    pub rids: Vec<RidRef>,
    pub before_dedup: usize,
    pub after_dedup: usize,
}

impl RidSelection {
    #[must_use]
    pub fn after_cap(&self) -> usize {
        self.rids.len()
    }
}

/// Deduplicate `refs` and cap each hour group at `cap` (0 disables the cap).
///
/// When an identifier appears with several hours, the first known hour wins.
#[must_use]
pub fn select_rids(refs: Vec<RidRef>, cap: usize, task_key: &str) -> RidSelection {
    let before_dedup = refs.len();

    let mut unique: BTreeMap<String, Option<u8>> = BTreeMap::new();
    for RidRef { rid, hour } in refs {
        let rid = rid.trim().to_string();
        if rid.is_empty() {
            continue;
        }
        let slot = unique.entry(rid).or_insert(hour);
        if slot.is_none() {
            *slot = hour;
        }
    }
    let after_dedup = unique.len();

    let mut groups: BTreeMap<Option<u8>, Vec<RidRef>> = BTreeMap::new();
    for (rid, hour) in unique {
        groups.entry(hour).or_default().push(RidRef { rid, hour });
    }

    let mut rids = Vec::with_capacity(after_dedup);
    for (hour, members) in groups {
        if cap == 0 || members.len() <= cap {
            rids.extend(members);
            continue;
        }
        let group = hour.map_or_else(|| "unknown".to_string(), |h| format!("{h:02}"));
        let mut sampler = ReservoirSampler::with_seed(cap, stable_seed(&[task_key, &group]));
        for member in members {
            sampler.observe(member);
        }
        rids.extend(sampler.into_sample());
    }
    rids.sort();

    RidSelection {
        rids,
        before_dedup,
        after_dedup,
    }
}
