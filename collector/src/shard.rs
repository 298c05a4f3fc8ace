//! Partitioning of the feed set across horizontally scaled instances.
//!
//! Every instance sees the full feed list and independently decides which
//! feeds it owns. The hash is MD5 over the UTF-8 feed id, read as a
//! big-endian 128-bit integer, modulo the shard count. This is stable across
//! builds and platforms, and matches instances that compute the same integer
//! from the hex digest.

use crate::types::FeedDescriptor;

#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ShardError {
    #[error("total_shards must be at least 1")]
    NoShards,
    #[error("shard_index ({index}) must be less than total_shards ({total})")]
    IndexOutOfRange { index: u32, total: u32 },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShardAssignment {
    index: u32,
    total: u32,
}

impl ShardAssignment {
    pub fn new(index: u32, total: u32) -> Result<Self, ShardError> {
        if total == 0 {
            return Err(ShardError::NoShards);
        }
        if index >= total {
            return Err(ShardError::IndexOutOfRange { index, total });
        }
        Ok(ShardAssignment { index, total })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn owns(&self, feed_id: &str) -> bool {
        owns(feed_id, self.index, self.total)
    }

    /// Keeps only the feeds owned by this shard, preserving order.
    pub fn filter(&self, feeds: Vec<FeedDescriptor>) -> Vec<FeedDescriptor> {
        feeds.into_iter().filter(|f| self.owns(&f.id)).collect()
    }
}

pub fn shard_of(feed_id: &str, total_shards: u32) -> u32 {
    if total_shards <= 1 {
        return 0;
    }
    let digest = md5::compute(feed_id.as_bytes());
    (u128::from_be_bytes(digest.0) % u128::from(total_shards)) as u32
}

pub fn owns(feed_id: &str, shard_index: u32, total_shards: u32) -> bool {
    shard_of(feed_id, total_shards) == shard_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn feed_ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("agency-{i}-vehicle-positions")).collect()
    }

    #[test]
    fn test_single_shard_owns_everything() {
        for id in feed_ids(50) {
            assert!(owns(&id, 0, 1));
        }
    }

    #[test]
    fn test_known_assignment() {
        // Pinned values: int(md5(id).hexdigest(), 16) % n
        let cases = [
            ("bart-vehicle-positions", [1, 0, 5]),
            ("septa-bus-trip-updates", [1, 1, 2]),
            ("mta-subway-service-alerts", [0, 1, 3]),
        ];
        for (id, [two, three, seven]) in cases {
            assert_eq!(shard_of(id, 2), two, "{id}");
            assert_eq!(shard_of(id, 3), three, "{id}");
            assert_eq!(shard_of(id, 7), seven, "{id}");
        }
    }

    #[test]
    fn test_exactly_one_owner() {
        let ids = feed_ids(200);
        for total in 1..=7 {
            let mut seen = HashSet::new();
            for index in 0..total {
                let shard = ShardAssignment::new(index, total).unwrap();
                for id in ids.iter().filter(|id| shard.owns(id)) {
                    // No overlaps
                    assert!(seen.insert(id.clone()), "{id} owned twice");
                }
            }
            // No gaps
            assert_eq!(seen.len(), ids.len());
        }
    }

    #[test]
    fn test_distribution_is_not_degenerate() {
        let ids = feed_ids(300);
        for index in 0..3 {
            let owned = ids.iter().filter(|id| owns(id, index, 3)).count();
            assert!(owned > 50, "shard {index} only owns {owned} feeds");
        }
    }

    #[test]
    fn test_invalid_assignment() {
        assert_eq!(ShardAssignment::new(0, 0), Err(ShardError::NoShards));
        assert_eq!(
            ShardAssignment::new(3, 3),
            Err(ShardError::IndexOutOfRange { index: 3, total: 3 })
        );
        assert!(ShardAssignment::new(2, 3).is_ok());
    }
}
