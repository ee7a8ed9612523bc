//! Disk usage and shard size inputs to allocation

use crate::cluster::{ShardId, ShardRouting};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskUsage {
    pub node_id: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

impl DiskUsage {
    pub fn new(node_id: impl Into<String>, total_bytes: u64, free_bytes: u64) -> Self {
        Self {
            node_id: node_id.into(),
            total_bytes,
            free_bytes: free_bytes.min(total_bytes),
        }
    }

    pub fn used_bytes(&self) -> u64 {
        self.total_bytes - self.free_bytes
    }

    /// 0.0 for a zero-sized disk
    pub fn used_fraction(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes() as f64 / self.total_bytes as f64
        }
    }
}

/// Point-in-time disk and shard size information
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub disk_usages: BTreeMap<String, DiskUsage>,
    /// Keyed by `ShardRouting::shard_key`
    pub shard_sizes: BTreeMap<String, u64>,
}

impl ClusterInfo {
    pub fn node_disk_usage(&self, node_id: &str) -> Option<&DiskUsage> {
        self.disk_usages.get(node_id)
    }

    pub fn shard_size(&self, shard: &ShardRouting) -> Option<u64> {
        self.shard_sizes.get(&shard.shard_key()).copied()
    }

    /// Mean used fraction across nodes with known usage
    pub fn average_used_fraction(&self) -> f64 {
        if self.disk_usages.is_empty() {
            return 0.0;
        }
        self.disk_usages.values().map(DiskUsage::used_fraction).sum::<f64>()
            / self.disk_usages.len() as f64
    }
}

/// Sizes of shards being restored from snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotShardSizeInfo {
    sizes: BTreeMap<ShardId, u64>,
}

impl SnapshotShardSizeInfo {
    pub fn with_size(mut self, shard_id: ShardId, size: u64) -> Self {
        self.sizes.insert(shard_id, size);
        self
    }

    pub fn shard_size(&self, shard: &ShardRouting) -> Option<u64> {
        if shard.primary && shard.unassigned() {
            self.sizes.get(&shard.shard_id).copied()
        } else {
            None
        }
    }
}

pub trait ClusterInfoService: Send + Sync {
    fn cluster_info(&self) -> ClusterInfo;
}

pub trait SnapshotsInfoService: Send + Sync {
    fn snapshot_shard_sizes(&self) -> SnapshotShardSizeInfo;
}

/// Holds whatever was last reported to it
#[derive(Debug, Default)]
pub struct InMemoryClusterInfoService {
    info: RwLock<ClusterInfo>,
}

impl InMemoryClusterInfoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_disk_usage(&self, usage: DiskUsage) {
        self.info.write().disk_usages.insert(usage.node_id.clone(), usage);
    }

    pub fn remove_node(&self, node_id: &str) {
        self.info.write().disk_usages.remove(node_id);
    }

    pub fn set_shard_size(&self, shard: &ShardRouting, size: u64) {
        self.info.write().shard_sizes.insert(shard.shard_key(), size);
    }
}

impl ClusterInfoService for InMemoryClusterInfoService {
    fn cluster_info(&self) -> ClusterInfo {
        self.info.read().clone()
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotsInfoService {
    sizes: RwLock<SnapshotShardSizeInfo>,
}

impl InMemorySnapshotsInfoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_snapshot_shard_size(&self, shard_id: ShardId, size: u64) {
        self.sizes.write().sizes.insert(shard_id, size);
    }
}

impl SnapshotsInfoService for InMemorySnapshotsInfoService {
    fn snapshot_shard_sizes(&self) -> SnapshotShardSizeInfo {
        self.sizes.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{UnassignedInfo, UnassignedReason};

    #[test]
    fn test_disk_usage_fraction() {
        let usage = DiskUsage::new("n1", 100, 25);
        assert_eq!(usage.used_bytes(), 75);
        assert!((usage.used_fraction() - 0.75).abs() < f64::EPSILON);
        assert_eq!(DiskUsage::new("n2", 0, 0).used_fraction(), 0.0);
        // free can never exceed total
        assert_eq!(DiskUsage::new("n3", 10, 50).used_bytes(), 0);
    }

    #[test]
    fn test_services_report_updates() {
        let service = InMemoryClusterInfoService::new();
        service.set_disk_usage(DiskUsage::new("n1", 100, 50));
        let shard = ShardRouting::new_unassigned(
            ShardId::new("logs", 0),
            true,
            UnassignedInfo::new(UnassignedReason::IndexCreated, None),
        );
        service.set_shard_size(&shard, 42);

        let info = service.cluster_info();
        assert_eq!(info.shard_size(&shard), Some(42));
        assert!((info.average_used_fraction() - 0.5).abs() < f64::EPSILON);

        let snapshots = InMemorySnapshotsInfoService::new();
        snapshots.set_snapshot_shard_size(ShardId::new("logs", 0), 7);
        assert_eq!(snapshots.snapshot_shard_sizes().shard_size(&shard), Some(7));
    }
}
