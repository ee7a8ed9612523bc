//! Disk watermarks
//!
//! Above the low watermark a node takes no new shards except brand new
//! primaries. Above the high watermark nothing is allocated to it and
//! shards already there are moved away. Usage accounts for shards still
//! recovering onto the node.

use super::AllocationDecider;
use crate::allocation::cluster_info::DiskUsage;
use crate::allocation::decision::Decision;
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::{ShardRouting, UnassignedReason};
use crate::common::{format_bytes, format_percent};

pub struct DiskThresholdDecider;

impl DiskThresholdDecider {
    pub const NAME: &'static str = "disk_threshold";

    fn usage<'r>(node: &RoutingNode, allocation: &'r RoutingAllocation<'_>) -> Result<&'r DiskUsage, Decision> {
        if !allocation.settings().disk_threshold_enabled {
            return Err(Decision::yes(Self::NAME, "the disk threshold decider is disabled"));
        }
        match allocation.cluster_info().node_disk_usage(node.node_id()) {
            Some(usage) if usage.total_bytes > 0 => Ok(usage),
            _ => Err(Decision::yes(
                Self::NAME,
                "disk usages are unavailable for this node",
            )),
        }
    }

    fn size_of(shard: &ShardRouting, allocation: &RoutingAllocation<'_>) -> u64 {
        shard
            .expected_shard_size
            .or_else(|| allocation.shard_size(shard))
            .unwrap_or(0)
    }

    /// Bytes still to arrive on the node, optionally minus bytes leaving it
    fn relocating_bytes(node: &RoutingNode, allocation: &RoutingAllocation<'_>, subtract_leaving: bool) -> i128 {
        node.shards()
            .iter()
            .map(|s| {
                if s.initializing() {
                    Self::size_of(s, allocation) as i128
                } else if subtract_leaving && s.relocating() {
                    -(Self::size_of(s, allocation) as i128)
                } else {
                    0
                }
            })
            .sum()
    }

    fn fraction(used: i128, total: u64) -> f64 {
        used.max(0) as f64 / total as f64
    }
}

impl AllocationDecider for DiskThresholdDecider {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let usage = match Self::usage(node, allocation) {
            Ok(usage) => usage,
            Err(decision) => return decision,
        };
        let settings = allocation.settings();
        let used = usage.used_bytes() as i128 + Self::relocating_bytes(node, allocation, false);
        let used_fraction = Self::fraction(used, usage.total_bytes);

        let fresh_primary = shard.primary
            && shard.unassigned()
            && shard
                .unassigned_info
                .as_ref()
                .map(|i| i.reason == UnassignedReason::IndexCreated)
                .unwrap_or(false);

        if used_fraction >= settings.watermark_low && !fresh_primary {
            return Decision::no(
                Self::NAME,
                format!(
                    "the node is above the low watermark [{}], having used [{}] of its disk",
                    format_percent(settings.watermark_low),
                    format_percent(used_fraction)
                ),
            );
        }
        if used_fraction >= settings.watermark_high {
            return Decision::no(
                Self::NAME,
                format!(
                    "the node is above the high watermark [{}], having used [{}] of its disk",
                    format_percent(settings.watermark_high),
                    format_percent(used_fraction)
                ),
            );
        }

        let shard_size = Self::size_of(shard, allocation);
        let after = Self::fraction(used + shard_size as i128, usage.total_bytes);
        if after >= settings.watermark_high {
            return Decision::no(
                Self::NAME,
                format!(
                    "allocating the shard to this node will bring the node above the high watermark [{}], the shard is [{}] and the node would use [{}] of its disk",
                    format_percent(settings.watermark_high),
                    format_bytes(shard_size),
                    format_percent(after)
                ),
            );
        }
        Decision::yes(
            Self::NAME,
            format!(
                "enough disk for shard on node, free: [{}], shard size: [{}], free after allocating shard: [{}]",
                format_bytes(usage.total_bytes.saturating_sub(used.max(0) as u64)),
                format_bytes(shard_size),
                format_bytes(
                    usage
                        .total_bytes
                        .saturating_sub(used.max(0) as u64)
                        .saturating_sub(shard_size)
                )
            ),
        )
    }

    fn can_remain(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let usage = match Self::usage(node, allocation) {
            Ok(usage) => usage,
            Err(decision) => return decision,
        };
        let high = allocation.settings().watermark_high;
        let used = usage.used_bytes() as i128 + Self::relocating_bytes(node, allocation, true);
        let used_fraction = Self::fraction(used, usage.total_bytes);
        if used_fraction > high {
            return Decision::no(
                Self::NAME,
                format!(
                    "the shard cannot remain on this node because it is above the high watermark [{}] and there is less than the required free space on the node, having used [{}] of its disk",
                    format_percent(high),
                    format_percent(used_fraction)
                ),
            );
        }
        Decision::yes(
            Self::NAME,
            format!(
                "there is enough disk on this node for the shard to remain, used: [{}]",
                format_percent(used_fraction)
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::cluster_info::ClusterInfo;
    use crate::allocation::deciders::test_support::*;
    use crate::allocation::deciders::AllocationDeciders;
    use crate::allocation::decision::DebugMode;
    use crate::cluster::IndexMetadata;
    use crate::common::AllocationConfig;

    fn info(usages: &[(&str, u64, u64)]) -> ClusterInfo {
        let mut info = ClusterInfo::default();
        for (node, total, free) in usages {
            info.disk_usages
                .insert(node.to_string(), DiskUsage::new(*node, *total, *free));
        }
        info
    }

    #[test]
    fn test_low_watermark_blocks_replicas_only() {
        let state = state_with(
            vec![data_node("full"), data_node("empty")],
            vec![IndexMetadata::new("logs", 1, 1)],
        );
        let deciders = AllocationDeciders::new(vec![]);
        // 87% used: between the default watermarks
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            info(&[("full", 100, 13), ("empty", 100, 90)]),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        let full = allocation.routing_nodes().node("full").unwrap();
        let empty = allocation.routing_nodes().node("empty").unwrap();
        for shard in allocation.routing_nodes().unassigned() {
            let on_full = DiskThresholdDecider.can_allocate(shard, full, &allocation);
            assert_eq!(on_full.is_yes(), shard.primary, "{}", on_full);
            assert!(DiskThresholdDecider.can_allocate(shard, empty, &allocation).is_yes());
        }
    }

    #[test]
    fn test_cannot_remain_above_high_watermark() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 1, 0)]);
        let deciders = AllocationDeciders::new(vec![]);
        let mut allocation = RoutingAllocation::new(
            &deciders,
            &state,
            info(&[("n1", 100, 5)]),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let init = allocation
            .routing_nodes_mut()
            .initialize_shard(&shard, "n1", None)
            .unwrap();
        let node = allocation.routing_nodes().node("n1").unwrap();
        assert!(DiskThresholdDecider.can_remain(&init, node, &allocation).is_no());
    }

    #[test]
    fn test_disabled_or_unknown_is_yes() {
        let state = state_with(vec![data_node("n1")], vec![IndexMetadata::new("logs", 1, 0)]);
        let deciders = AllocationDeciders::new(vec![]);
        let allocation = RoutingAllocation::new(
            &deciders,
            &state,
            ClusterInfo::default(),
            Default::default(),
            AllocationConfig::default(),
            DebugMode::Off,
        );
        let shard = allocation.routing_nodes().unassigned()[0].clone();
        let node = allocation.routing_nodes().node("n1").unwrap();
        assert!(DiskThresholdDecider.can_allocate(&shard, node, &allocation).is_yes());
    }
}
