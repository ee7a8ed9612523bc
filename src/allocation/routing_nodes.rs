//! Per-round mutable view of the routing table, grouped by node
//!
//! Built from an immutable cluster state at the start of a round and turned
//! back into a [`RoutingTable`] at the end. Relocation targets only exist in
//! this view, as INITIALIZING copies on the target node.

use crate::cluster::{
    AllocationStatus, ClusterState, DiscoveryNodes, RoutingTable, ShardId, ShardRouting,
    UnassignedInfo, UnassignedReason,
};
use crate::common::{Error, Result};
use std::collections::BTreeMap;

/// Shards held by one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingNode {
    node_id: String,
    shards: Vec<ShardRouting>,
}

impl RoutingNode {
    fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            shards: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn get_by_shard_id(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| &s.shard_id == shard_id)
    }

    /// Shards that will stay here; relocation sources are leaving
    pub fn owned_shard_count(&self) -> usize {
        self.shards.iter().filter(|s| !s.relocating()).count()
    }

    pub fn owned_shard_count_for_index(&self, index: &str) -> usize {
        self.shards
            .iter()
            .filter(|s| !s.relocating() && s.shard_id.index == index)
            .count()
    }

    /// Replicas and relocation targets recovering onto this node
    pub fn incoming_recoveries(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.initializing() && (!s.primary || s.is_relocation_target()))
            .count()
    }

    /// New primaries initializing here (not relocations)
    pub fn initializing_primaries(&self) -> usize {
        self.shards
            .iter()
            .filter(|s| s.initializing() && s.primary && !s.is_relocation_target())
            .count()
    }

    fn add(&mut self, shard: ShardRouting) -> Result<()> {
        if let Some(existing) = self.get_by_shard_id(&shard.shard_id) {
            return Err(Error::InvalidState(format!(
                "node [{}] already holds {} when adding {}",
                self.node_id, existing, shard
            )));
        }
        self.shards.push(shard);
        Ok(())
    }

    fn remove(&mut self, shard_id: &ShardId) -> Option<ShardRouting> {
        let pos = self.shards.iter().position(|s| &s.shard_id == shard_id)?;
        Some(self.shards.remove(pos))
    }

    fn replace(&mut self, shard: ShardRouting) -> Result<()> {
        match self.shards.iter_mut().find(|s| s.shard_id == shard.shard_id) {
            Some(slot) => {
                *slot = shard;
                Ok(())
            }
            None => Err(Error::InvalidState(format!(
                "node [{}] holds no copy of {}",
                self.node_id, shard.shard_id
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingNodes {
    nodes: BTreeMap<String, RoutingNode>,
    unassigned: Vec<ShardRouting>,
    /// Unassigned copies the allocator gave up on this round
    ignored: Vec<ShardRouting>,
}

impl RoutingNodes {
    /// Fresh working copy; shares nothing with `state`
    pub fn from_state(state: &ClusterState) -> Self {
        let mut nodes: BTreeMap<String, RoutingNode> = state
            .nodes
            .data_nodes()
            .map(|n| (n.id().to_string(), RoutingNode::new(n.id())))
            .collect();
        let mut unassigned = Vec::new();

        for shard in state.routing_table.all_shards() {
            match shard.current_node_id() {
                Some(node_id) => {
                    nodes
                        .entry(node_id.to_string())
                        .or_insert_with(|| RoutingNode::new(node_id))
                        .shards
                        .push(shard.clone());
                    if let (true, Some(target)) = (shard.relocating(), shard.relocating_node_id()) {
                        if let Ok(target_copy) = shard.target_relocating_shard() {
                            nodes
                                .entry(target.to_string())
                                .or_insert_with(|| RoutingNode::new(target))
                                .shards
                                .push(target_copy);
                        }
                    }
                }
                None => unassigned.push(shard.clone()),
            }
        }

        Self {
            nodes,
            unassigned,
            ignored: Vec::new(),
        }
    }

    pub fn node(&self, node_id: &str) -> Option<&RoutingNode> {
        self.nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn unassigned(&self) -> &[ShardRouting] {
        &self.unassigned
    }

    pub fn ignored(&self) -> &[ShardRouting] {
        &self.ignored
    }

    pub fn has_unassigned_shards(&self) -> bool {
        !self.unassigned.is_empty() || !self.ignored.is_empty()
    }

    pub fn has_unassigned_primaries(&self) -> bool {
        self.unassigned.iter().chain(self.ignored.iter()).any(|s| s.primary)
    }

    pub fn has_inactive_primaries(&self) -> bool {
        self.has_unassigned_primaries()
            || self
                .all_assigned()
                .any(|s| s.primary && s.initializing() && !s.is_relocation_target())
    }

    pub fn has_inactive_shards(&self) -> bool {
        self.all_assigned().any(|s| s.initializing())
    }

    fn all_assigned(&self) -> impl Iterator<Item = &ShardRouting> {
        self.nodes.values().flat_map(|n| n.shards.iter())
    }

    /// Every assigned copy of a shard, relocation targets included
    pub fn assigned_shards(&self, shard_id: &ShardId) -> Vec<&ShardRouting> {
        self.all_assigned().filter(|s| &s.shard_id == shard_id).collect()
    }

    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.all_assigned()
            .find(|s| &s.shard_id == shard_id && s.primary && s.active())
    }

    /// Every expected copy exists and is active
    pub fn all_copies_active(&self, shard_id: &ShardId, expected_copies: usize) -> bool {
        let active = self
            .all_assigned()
            .filter(|s| &s.shard_id == shard_id && s.active())
            .count();
        active >= expected_copies
    }

    /// Number of shards currently relocating, counted once per move
    pub fn relocating_shards(&self) -> usize {
        self.all_assigned().filter(|s| s.relocating()).count()
    }

    /// Started copies, ordered by index, shard id, primary first
    pub fn started_shards(&self) -> Vec<ShardRouting> {
        let mut started: Vec<ShardRouting> =
            self.all_assigned().filter(|s| s.started()).cloned().collect();
        started.sort_by(|a, b| (&a.shard_id, !a.primary).cmp(&(&b.shard_id, !b.primary)));
        started
    }

    fn node_mut(&mut self, node_id: &str) -> Result<&mut RoutingNode> {
        self.nodes
            .get_mut(node_id)
            .ok_or_else(|| Error::UnknownNode(node_id.to_string()))
    }

    fn take_unassigned(&mut self, shard: &ShardRouting) -> Result<ShardRouting> {
        let pos = self
            .unassigned
            .iter()
            .position(|s| s == shard)
            .ok_or_else(|| Error::InvalidState(format!("{} is not in the unassigned list", shard)))?;
        Ok(self.unassigned.remove(pos))
    }

    /// Assigns an unassigned copy to `node_id`
    pub fn initialize_shard(
        &mut self,
        shard: &ShardRouting,
        node_id: &str,
        expected_shard_size: Option<u64>,
    ) -> Result<ShardRouting> {
        if !self.nodes.contains_key(node_id) {
            return Err(Error::UnknownNode(node_id.to_string()));
        }
        let unassigned = self.take_unassigned(shard)?;
        let initialized = unassigned.initialize(node_id, expected_shard_size)?;
        self.node_mut(node_id)?.add(initialized.clone())?;
        Ok(initialized)
    }

    /// Starts moving a started copy; returns the initializing target
    pub fn relocate_shard(
        &mut self,
        shard: &ShardRouting,
        target_node_id: &str,
        expected_shard_size: Option<u64>,
    ) -> Result<ShardRouting> {
        let source_node = shard
            .current_node_id()
            .ok_or_else(|| Error::InvalidState(format!("cannot relocate unassigned {}", shard)))?
            .to_string();
        let relocating = shard.relocate(target_node_id, expected_shard_size)?;
        let target = relocating.target_relocating_shard()?;
        self.node_mut(target_node_id)?.add(target.clone())?;
        self.node_mut(&source_node)?.replace(relocating)?;
        Ok(target)
    }

    /// Marks an initializing copy started, completing a relocation if it was a target
    pub fn start_shard(&mut self, shard: &ShardRouting) -> Result<ShardRouting> {
        let node_id = shard
            .current_node_id()
            .ok_or_else(|| Error::InvalidState(format!("cannot start unassigned {}", shard)))?
            .to_string();
        let current = self
            .node(&node_id)
            .and_then(|n| n.get_by_shard_id(&shard.shard_id))
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("{} not found on node [{}]", shard, node_id)))?;

        if let Some(source_node) = current.relocating_node_id().map(str::to_string) {
            if current.initializing() {
                if let Ok(node) = self.node_mut(&source_node) {
                    node.remove(&current.shard_id);
                }
            }
        }
        let started = current.move_to_started()?;
        self.node_mut(&node_id)?.replace(started.clone())?;
        Ok(started)
    }

    /// Fails an assigned copy. A failed primary is replaced by the active
    /// replica on the newest node, if any.
    pub fn fail_shard(
        &mut self,
        shard: &ShardRouting,
        info: UnassignedInfo,
        nodes: &DiscoveryNodes,
    ) -> Result<()> {
        let node_id = shard
            .current_node_id()
            .ok_or_else(|| Error::InvalidState(format!("cannot fail unassigned {}", shard)))?
            .to_string();
        let current = self
            .node(&node_id)
            .and_then(|n| n.get_by_shard_id(&shard.shard_id))
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("{} not found on node [{}]", shard, node_id)))?;

        let mut info = info;
        if info.reason == UnassignedReason::AllocationFailed {
            info.failed_allocations = current
                .unassigned_info
                .as_ref()
                .map(|i| i.failed_allocations)
                .unwrap_or(0)
                + 1;
        }

        if current.is_relocation_target() {
            self.node_mut(&node_id)?.remove(&current.shard_id);
            if let Some(source_node) = current.relocating_node_id() {
                let node = self.node_mut(source_node)?;
                if let Some(source) = node.get_by_shard_id(&current.shard_id).cloned() {
                    node.replace(source.cancel_relocation()?)?;
                }
            }
            return Ok(());
        }

        if current.relocating() {
            if let Some(target_node) = current.relocating_node_id() {
                if let Ok(node) = self.node_mut(target_node) {
                    node.remove(&current.shard_id);
                }
            }
        }

        self.node_mut(&node_id)?.remove(&current.shard_id);

        if !current.primary {
            self.unassigned.push(current.move_to_unassigned(info));
            return Ok(());
        }

        // replicas recovering from the failed primary cannot finish
        let orphaned: Vec<ShardRouting> = self
            .assigned_shards(&current.shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.initializing() && !s.is_relocation_target())
            .cloned()
            .collect();
        for replica in orphaned {
            if let Some(replica_node) = replica.current_node_id() {
                self.node_mut(replica_node)?.remove(&replica.shard_id);
            }
            self.unassigned.push(replica.move_to_unassigned(UnassignedInfo::new(
                UnassignedReason::PrimaryFailed,
                Some(format!("primary failed while replica initializing on [{}]", node_id)),
            )));
        }

        let unassigned_primary = current.move_to_unassigned(info);
        match self.best_active_replica(&current.shard_id, nodes) {
            Some(replica) => {
                tracing::debug!(shard = %replica.shard_id, node = ?replica.current_node_id(), "promoting replica to primary");
                if let Some(replica_node) = replica.current_node_id() {
                    self.node_mut(replica_node)?.replace(replica.promote_to_primary())?;
                }
                if let (true, Some(target_node)) = (replica.relocating(), replica.relocating_node_id()) {
                    let node = self.node_mut(target_node)?;
                    if let Some(target) = node.get_by_shard_id(&replica.shard_id).cloned() {
                        node.replace(target.promote_to_primary())?;
                    }
                }
                self.unassigned.push(unassigned_primary.demote_to_replica());
            }
            None => self.unassigned.push(unassigned_primary),
        }
        Ok(())
    }

    /// Active replica on the node with the highest version, ties by node id
    fn best_active_replica(&self, shard_id: &ShardId, nodes: &DiscoveryNodes) -> Option<ShardRouting> {
        self.assigned_shards(shard_id)
            .into_iter()
            .filter(|s| !s.primary && s.active())
            .max_by(|a, b| {
                let version = |s: &ShardRouting| {
                    s.current_node_id()
                        .and_then(|id| nodes.get(id))
                        .map(|n| n.version().clone())
                };
                version(a)
                    .cmp(&version(b))
                    .then_with(|| b.current_node_id().cmp(&a.current_node_id()))
            })
            .cloned()
    }

    /// Leaves an unassigned copy unassigned for this round, recording why
    pub fn ignore_shard(&mut self, shard: &ShardRouting, status: AllocationStatus) -> Result<()> {
        let mut ignored = self.take_unassigned(shard)?;
        if let Some(info) = ignored.unassigned_info.as_mut() {
            info.last_allocation_status = status;
        }
        self.ignored.push(ignored);
        Ok(())
    }

    pub fn to_routing_table(&self) -> RoutingTable {
        RoutingTable::from_shards(
            self.all_assigned()
                .filter(|s| !s.is_relocation_target())
                .chain(self.unassigned.iter())
                .chain(self.ignored.iter())
                .cloned(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ClusterStateDiff, DiscoveryNode, IndexMetadata, NodeRole, ShardRoutingState};

    fn state(nodes: &[&str], index: IndexMetadata) -> ClusterState {
        let base = ClusterState::empty("test");
        let diff = nodes.iter().fold(ClusterStateDiff::new(&base), |d, id| {
            d.add_node(DiscoveryNode::new(*id, *id, format!("{}:9300", id), [NodeRole::Data]))
        });
        diff.upsert_index(index).apply(&base, 1, 1).unwrap()
    }

    fn unassigned_info(reason: UnassignedReason) -> UnassignedInfo {
        UnassignedInfo::new(reason, None)
    }

    #[test]
    fn test_round_trip_preserves_table() {
        let state = state(&["n1", "n2"], IndexMetadata::new("logs", 2, 1));
        let routing_nodes = RoutingNodes::from_state(&state);
        assert_eq!(routing_nodes.unassigned().len(), 4);
        assert_eq!(routing_nodes.to_routing_table(), state.routing_table);
    }

    #[test]
    fn test_initialize_start_relocate() {
        let state = state(&["n1", "n2"], IndexMetadata::new("logs", 1, 0));
        let mut rn = RoutingNodes::from_state(&state);
        let primary = rn.unassigned()[0].clone();

        let init = rn.initialize_shard(&primary, "n1", None).unwrap();
        assert_eq!(rn.node("n1").unwrap().initializing_primaries(), 1);
        let started = rn.start_shard(&init).unwrap();

        let target = rn.relocate_shard(&started, "n2", None).unwrap();
        assert!(target.is_relocation_target());
        assert_eq!(rn.relocating_shards(), 1);
        assert_eq!(rn.node("n1").unwrap().owned_shard_count(), 0);
        assert_eq!(rn.node("n2").unwrap().incoming_recoveries(), 1);

        // the table only carries the source
        let table = rn.to_routing_table();
        assert_eq!(table.all_shards().count(), 1);
        assert_eq!(table.shards_with_state(ShardRoutingState::Relocating).len(), 1);

        rn.start_shard(&target).unwrap();
        assert!(rn.node("n1").unwrap().is_empty());
        assert!(rn.node("n2").unwrap().shards()[0].started());
    }

    #[test]
    fn test_failed_primary_promotes_replica() {
        let state = state(&["n1", "n2"], IndexMetadata::new("logs", 1, 1));
        let mut rn = RoutingNodes::from_state(&state);
        let primary = rn.unassigned().iter().find(|s| s.primary).unwrap().clone();
        let p = rn.initialize_shard(&primary, "n1", None).unwrap();
        rn.start_shard(&p).unwrap();
        let replica = rn.unassigned()[0].clone();
        let r = rn.initialize_shard(&replica, "n2", None).unwrap();
        let r = rn.start_shard(&r).unwrap();

        let p = rn.node("n1").unwrap().shards()[0].clone();
        rn.fail_shard(&p, unassigned_info(UnassignedReason::NodeLeft), &state.nodes)
            .unwrap();

        let promoted = rn.node("n2").unwrap().get_by_shard_id(&r.shard_id).unwrap();
        assert!(promoted.primary);
        assert_eq!(rn.unassigned().len(), 1);
        assert!(!rn.unassigned()[0].primary);
        rn.to_routing_table().validate(&state.metadata).unwrap();
    }

    #[test]
    fn test_failed_relocation_target_cancels_move() {
        let state = state(&["n1", "n2"], IndexMetadata::new("logs", 1, 0));
        let mut rn = RoutingNodes::from_state(&state);
        let primary = rn.unassigned()[0].clone();
        let init = rn.initialize_shard(&primary, "n1", None).unwrap();
        let started = rn.start_shard(&init).unwrap();
        let target = rn.relocate_shard(&started, "n2", None).unwrap();

        rn.fail_shard(&target, unassigned_info(UnassignedReason::AllocationFailed), &state.nodes)
            .unwrap();
        assert!(rn.node("n2").unwrap().is_empty());
        assert!(rn.node("n1").unwrap().shards()[0].started());
        assert!(rn.unassigned().is_empty());
    }

    #[test]
    fn test_failed_allocation_counts_attempts() {
        let state = state(&["n1"], IndexMetadata::new("logs", 1, 0));
        let mut rn = RoutingNodes::from_state(&state);
        let primary = rn.unassigned()[0].clone();
        let init = rn.initialize_shard(&primary, "n1", None).unwrap();
        rn.fail_shard(&init, unassigned_info(UnassignedReason::AllocationFailed), &state.nodes)
            .unwrap();
        let again = rn.unassigned()[0].clone();
        assert_eq!(again.unassigned_info.as_ref().unwrap().failed_allocations, 1);

        let init = rn.initialize_shard(&again, "n1", None).unwrap();
        rn.fail_shard(&init, unassigned_info(UnassignedReason::AllocationFailed), &state.nodes)
            .unwrap();
        assert_eq!(rn.unassigned()[0].unassigned_info.as_ref().unwrap().failed_allocations, 2);
    }

    #[test]
    fn test_ignore_records_status() {
        let state = state(&["n1"], IndexMetadata::new("logs", 1, 0));
        let mut rn = RoutingNodes::from_state(&state);
        let primary = rn.unassigned()[0].clone();
        rn.ignore_shard(&primary, AllocationStatus::DecidersThrottled).unwrap();
        assert!(rn.unassigned().is_empty());
        assert_eq!(
            rn.ignored()[0].unassigned_info.as_ref().unwrap().last_allocation_status,
            AllocationStatus::DecidersThrottled
        );
        assert!(rn.has_unassigned_primaries());
    }
}
