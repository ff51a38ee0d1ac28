//! Shard planning.
//!
//! Partitions one entity kind's key order into disjoint, gap-free
//! ranges. Boundaries are sampled existing keys, so every range is
//! `(after, until]`: exclusive below (which is also how cursors resume)
//! and closed exactly at its boundary key above. The first range is
//! unbounded below, the last unbounded above, hence the union covers
//! the whole domain regardless of concurrent inserts at the edges.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{EntityStore, StoreError};

/// One shard's slice of the scan domain. Transient: built by the
/// planner, serialized into the task payload, consumed by one scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    /// Shard index within the job, `0..shard_count`.
    pub index: u32,

    /// Exclusive lower bound; `None` = unbounded.
    pub after: Option<String>,

    /// Inclusive upper bound; `None` = unbounded.
    pub until: Option<String>,
}

impl ShardDescriptor {
    /// A descriptor that scans zero rows, used to pad small domains up
    /// to the requested shard count.
    #[must_use]
    pub const fn empty(index: u32) -> Self {
        Self {
            index,
            after: Some(String::new()),
            until: Some(String::new()),
        }
    }

    /// Whether `name` falls inside this shard's range.
    #[must_use]
    pub fn covers(&self, name: &str) -> bool {
        let above = self.after.as_deref().is_none_or(|a| name > a);
        let below = self.until.as_deref().is_none_or(|u| name <= u);
        above && below
    }
}

/// Planning failures. Fatal: the job moves to `Failed` with no shards
/// dispatched.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PlanError {
    /// The store failed while sampling split points.
    #[error("cannot partition domain: {0}")]
    Store(#[from] StoreError),

    /// A job with zero shards is meaningless.
    #[error("shard count must be at least 1")]
    ZeroShards,
}

/// Partition `kind`'s domain into exactly `shard_count` descriptors.
///
/// Returns an empty vec for an empty domain (the job skips straight to
/// finalizing). Domains smaller than `shard_count` get trailing empty
/// descriptors — a no-op to scan, not an error.
///
/// # Errors
///
/// Returns [`PlanError::ZeroShards`] for `shard_count == 0` and
/// propagates store failures.
pub fn plan_shards(
    store: &dyn EntityStore,
    kind: &str,
    shard_count: u32,
) -> Result<Vec<ShardDescriptor>, PlanError> {
    if shard_count == 0 {
        return Err(PlanError::ZeroShards);
    }
    if store.scan(kind, None, None, 1)?.is_empty() {
        return Ok(Vec::new());
    }

    let want = (shard_count - 1) as usize;
    let mut boundaries = store.sample_keys(kind, want)?;
    boundaries.dedup();
    boundaries.truncate(want);

    let mut shards = Vec::with_capacity(shard_count as usize);
    let mut after: Option<String> = None;
    for boundary in boundaries {
        shards.push(ShardDescriptor {
            index: u32::try_from(shards.len()).unwrap_or(u32::MAX),
            after: after.take(),
            until: Some(boundary.clone()),
        });
        after = Some(boundary);
    }
    shards.push(ShardDescriptor {
        index: u32::try_from(shards.len()).unwrap_or(u32::MAX),
        after,
        until: None,
    });
    while shards.len() < shard_count as usize {
        shards.push(ShardDescriptor::empty(
            u32::try_from(shards.len()).unwrap_or(u32::MAX),
        ));
    }
    Ok(shards)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{Entity, Key};

    fn seeded(count: usize) -> InMemoryStore {
        let store = InMemoryStore::new();
        let entities: Vec<Entity> = (0..count)
            .map(|i| Entity::new(Key::new("m", format!("k{i:05}"))))
            .collect();
        store.put_many(&entities).unwrap();
        store
    }

    #[test]
    fn empty_domain_plans_no_shards() {
        let store = InMemoryStore::new();
        assert!(plan_shards(&store, "m", 10).unwrap().is_empty());
    }

    #[test]
    fn zero_shard_count_is_an_error() {
        let store = seeded(3);
        assert!(matches!(
            plan_shards(&store, "m", 0),
            Err(PlanError::ZeroShards)
        ));
    }

    #[test]
    fn small_domain_pads_with_empty_descriptors() {
        let store = seeded(5);
        let shards = plan_shards(&store, "m", 10).unwrap();
        assert_eq!(shards.len(), 10);

        // Every entity is covered by exactly one shard.
        for i in 0..5 {
            let name = format!("k{i:05}");
            let covering = shards.iter().filter(|s| s.covers(&name)).count();
            assert_eq!(covering, 1, "entity {name} covered {covering} times");
        }
    }

    #[test]
    fn empty_descriptor_covers_nothing() {
        let empty = ShardDescriptor::empty(7);
        assert!(!empty.covers("anything"));
        assert!(!empty.covers(""));
    }

    #[test]
    fn boundaries_are_ordered_and_contiguous() {
        let store = seeded(100);
        let shards = plan_shards(&store, "m", 4).unwrap();
        assert_eq!(shards.len(), 4);
        assert_eq!(shards[0].after, None);
        assert_eq!(shards[3].until, None);
        for pair in shards.windows(2) {
            assert_eq!(pair[0].until, pair[1].after);
        }
    }

    proptest! {
        #[test]
        fn every_key_covered_exactly_once(
            domain_size in 0usize..200,
            shard_count in 1u32..16,
        ) {
            let store = seeded(domain_size);
            let shards = plan_shards(&store, "m", shard_count).unwrap();

            if domain_size == 0 {
                prop_assert!(shards.is_empty());
            } else {
                prop_assert_eq!(shards.len(), shard_count as usize);
                for i in 0..domain_size {
                    let name = format!("k{i:05}");
                    let covering = shards.iter().filter(|s| s.covers(&name)).count();
                    prop_assert_eq!(covering, 1);
                }
            }
        }
    }
}
