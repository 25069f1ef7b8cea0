use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::ops::Range;

use crate::storage::types::PartitionId;

/// Maps routing keys to partitions.
#[derive(Debug, Clone)]
pub struct Partitioner {
    num_partitions: u32,
}

impl Partitioner {
    pub fn new(num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
        }
    }

    pub fn get_partition(&self, key: &str) -> PartitionId {
        if self.num_partitions == 1 {
            return 0;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_partitions
    }

    pub fn num_partitions(&self) -> u32 {
        self.num_partitions
    }

    pub fn partitions(&self) -> Range<PartitionId> {
        0..self.num_partitions
    }
}

impl Default for Partitioner {
    /// A single partition: every key routes to partition `0`.
    fn default() -> Self {
        Self::new(1)
    }
}
