//! Balanced shards allocator
//!
//! A round has three phases: allocate unassigned copies, move copies that
//! may no longer remain where they are, then rebalance each index. Node
//! weights only count shards that will stay on a node (relocation sources
//! are excluded, targets included), so a second run over the output of a
//! round finds nothing to do.

use crate::allocation::cluster_info::DiskUsage;
use crate::allocation::decision::{
    AllocateUnassignedDecision, AllocationDecision, Decision, MoveDecision, NodeAllocationResult,
    ShardAllocationDecision,
};
use crate::allocation::routing_allocation::RoutingAllocation;
use crate::allocation::routing_nodes::RoutingNode;
use crate::cluster::{AllocationStatus, ShardId, ShardRouting};
use crate::common::{hrw_weight, AllocationConfig, Result};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Places shard copies on nodes
pub trait ShardsAllocator: Send + Sync {
    /// Runs one round, mutating only the allocation's routing nodes
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>) -> Result<()>;

    /// What a round would do with `shard`, without doing it
    fn decide_shard_allocation(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> ShardAllocationDecision;
}

/// Weight of a node for an index: positive means more loaded than average
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightFunction {
    theta_shard: f64,
    theta_index: f64,
    disk_balance: f64,
}

impl WeightFunction {
    pub fn new(settings: &AllocationConfig) -> Self {
        let index_balance = settings.index_balance.max(0.0) as f64;
        let shard_balance = settings.shard_balance.max(0.0) as f64;
        let sum = index_balance + shard_balance;
        let (theta_shard, theta_index) = if sum > 0.0 {
            (shard_balance / sum, index_balance / sum)
        } else {
            (0.5, 0.5)
        };
        Self {
            theta_shard,
            theta_index,
            disk_balance: settings.disk_balance.max(0.0) as f64,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BalancedShardsAllocator;

impl BalancedShardsAllocator {
    pub fn new() -> Self {
        Self
    }

    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) -> Result<()> {
        let mut shards = allocation.routing_nodes().unassigned().to_vec();
        shards.sort_by(|a, b| (!a.primary, &a.shard_id).cmp(&(!b.primary, &b.shard_id)));

        // once one copy is given up on, later copies of that shard follow
        let mut ignored: BTreeMap<ShardId, AllocationStatus> = BTreeMap::new();
        for shard in shards {
            if let Some(status) = ignored.get(&shard.shard_id).copied() {
                allocation.routing_nodes_mut().ignore_shard(&shard, status)?;
                continue;
            }
            let decision = Balancer::new(allocation).decide_allocate_unassigned(&shard);
            let target = decision.target_node.clone().filter(|_| decision.is_yes());
            match target {
                Some(target) => {
                    let size = allocation.shard_size(&shard);
                    let initialized = allocation
                        .routing_nodes_mut()
                        .initialize_shard(&shard, &target, size)?;
                    tracing::debug!(shard = %initialized, "allocated unassigned shard");
                }
                None => {
                    let status = decision
                        .allocation_status
                        .unwrap_or(AllocationStatus::DecidersNo);
                    tracing::debug!(shard = %shard, ?status, "leaving shard unassigned");
                    allocation.routing_nodes_mut().ignore_shard(&shard, status)?;
                    ignored.insert(shard.shard_id.clone(), status);
                }
            }
        }
        Ok(())
    }

    fn move_shards(&self, allocation: &mut RoutingAllocation<'_>) -> Result<()> {
        let started = allocation.routing_nodes().started_shards();
        for shard in started {
            let decision = Balancer::new(allocation).decide_move(&shard);
            if !decision.force_move() {
                if !decision.can_remain() {
                    tracing::debug!(shard = %shard, decision = ?decision.final_decision, "shard cannot remain but has nowhere to go");
                }
                continue;
            }
            if let Some(target) = decision.target_node {
                let size = allocation.shard_size(&shard);
                allocation.routing_nodes_mut().relocate_shard(&shard, &target, size)?;
                tracing::info!(shard = %shard, target = %target, "moving shard that cannot remain");
            }
        }
        Ok(())
    }

    fn rebalance(&self, allocation: &mut RoutingAllocation<'_>) -> Result<()> {
        let decision = allocation.deciders().can_rebalance_cluster(allocation);
        if !decision.is_yes() {
            tracing::debug!(%decision, "skipping rebalance");
            return Ok(());
        }

        let indices: Vec<String> = allocation.metadata().indices.keys().cloned().collect();
        for index in indices {
            let mut budget = {
                let shards = allocation
                    .index_metadata(&index)
                    .map(|m| m.number_of_shards as usize * m.copies_per_shard())
                    .unwrap_or(0);
                shards * allocation.data_node_ids().len().max(1)
            };
            while budget > 0 {
                budget -= 1;
                let found = Balancer::new(allocation).find_rebalance_move(&index);
                let Some((shard, target)) = found else {
                    break;
                };
                let size = allocation.shard_size(&shard);
                allocation.routing_nodes_mut().relocate_shard(&shard, &target, size)?;
                tracing::info!(shard = %shard, target = %target, "rebalancing shard");
            }
        }
        Ok(())
    }
}

impl ShardsAllocator for BalancedShardsAllocator {
    fn allocate(&self, allocation: &mut RoutingAllocation<'_>) -> Result<()> {
        if allocation.data_node_ids().is_empty() {
            tracing::debug!("no data nodes, nothing to allocate");
        }
        self.allocate_unassigned(allocation)?;
        self.move_shards(allocation)?;
        self.rebalance(allocation)
    }

    fn decide_shard_allocation(
        &self,
        shard: &ShardRouting,
        allocation: &RoutingAllocation<'_>,
    ) -> ShardAllocationDecision {
        let balancer = Balancer::new(allocation);
        if shard.unassigned() {
            return ShardAllocationDecision {
                allocate_decision: Some(balancer.decide_allocate_unassigned(shard)),
                move_decision: None,
            };
        }
        if !shard.started() {
            return ShardAllocationDecision::NOT_TAKEN;
        }
        let decision = balancer.decide_move(shard);
        let move_decision = match decision.can_remain_decision.clone() {
            Some(can_remain) if decision.can_remain() => balancer.decide_rebalance(shard, can_remain),
            _ => decision,
        };
        ShardAllocationDecision {
            allocate_decision: None,
            move_decision: Some(move_decision),
        }
    }
}

/// A node under consideration: id, weight used for ordering, decider answer
struct Candidate {
    node_id: String,
    weight: f64,
    decision: Decision,
}

/// Read-only weight model over one allocation snapshot
struct Balancer<'r, 'a> {
    allocation: &'r RoutingAllocation<'a>,
    weights: WeightFunction,
    threshold: f64,
    node_ids: Vec<String>,
    avg_shards: f64,
    avg_disk: f64,
}

impl<'r, 'a> Balancer<'r, 'a> {
    fn new(allocation: &'r RoutingAllocation<'a>) -> Self {
        let settings = allocation.settings();
        let node_ids: Vec<String> = allocation
            .data_node_ids()
            .into_iter()
            .filter(|id| allocation.routing_nodes().node(id).is_some())
            .collect();
        let total: usize = allocation
            .metadata()
            .indices
            .values()
            .map(|m| m.number_of_shards as usize * m.copies_per_shard())
            .sum();
        let avg_shards = total as f64 / node_ids.len().max(1) as f64;
        Self {
            allocation,
            weights: WeightFunction::new(settings),
            threshold: settings.balance_threshold.max(0.0) as f64,
            node_ids,
            avg_shards,
            avg_disk: allocation.cluster_info().average_used_fraction(),
        }
    }

    fn avg_index_shards(&self, index: &str) -> f64 {
        let shards = self
            .allocation
            .index_metadata(index)
            .map(|m| m.number_of_shards as usize * m.copies_per_shard())
            .unwrap_or(0);
        shards as f64 / self.node_ids.len().max(1) as f64
    }

    /// Weight of `node_id` for `index` after adding `delta` shards of it
    fn weight(&self, node_id: &str, index: &str, delta: f64) -> f64 {
        let node = self.allocation.routing_nodes().node(node_id);
        let shards = node.map_or(0, RoutingNode::owned_shard_count) as f64 + delta;
        let index_shards = node.map_or(0, |n| n.owned_shard_count_for_index(index)) as f64 + delta;
        let disk = self
            .allocation
            .cluster_info()
            .node_disk_usage(node_id)
            .map_or(self.avg_disk, DiskUsage::used_fraction);
        self.weights.theta_shard * (shards - self.avg_shards)
            + self.weights.theta_index * (index_shards - self.avg_index_shards(index))
            + self.weights.disk_balance * (disk - self.avg_disk)
    }

    /// Lower weight first; equal weights ordered by rendezvous hash of the
    /// shard, then node id
    fn compare(key: &str, a: (&str, f64), b: (&str, f64)) -> Ordering {
        a.1.total_cmp(&b.1)
            .then_with(|| hrw_weight(key, b.0).cmp(&hrw_weight(key, a.0)))
            .then_with(|| a.0.cmp(b.0))
    }

    fn sort_candidates(key: &str, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| Self::compare(key, (&a.node_id, a.weight), (&b.node_id, b.weight)));
    }

    /// Evaluates `can_allocate` on every data node except `skip`
    fn candidates(&self, shard: &ShardRouting, skip: Option<&str>) -> Vec<Candidate> {
        let deciders = self.allocation.deciders();
        let mut candidates: Vec<Candidate> = self
            .node_ids
            .iter()
            .filter(|id| Some(id.as_str()) != skip)
            .filter_map(|id| {
                let node = self.allocation.routing_nodes().node(id)?;
                Some(Candidate {
                    node_id: id.clone(),
                    weight: self.weight(id, &shard.shard_id.index, 1.0),
                    decision: deciders.can_allocate(shard, node, self.allocation),
                })
            })
            .collect();
        Self::sort_candidates(&shard.shard_id.to_string(), &mut candidates);
        candidates
    }

    fn node_results(
        &self,
        candidates: &[Candidate],
        node_decision: impl Fn(&Candidate) -> AllocationDecision,
    ) -> Option<Vec<NodeAllocationResult>> {
        if !self.allocation.debug_decision() {
            return None;
        }
        let results = candidates
            .iter()
            .enumerate()
            .filter_map(|(rank, c)| {
                let node = self.allocation.nodes().get(&c.node_id)?;
                Some(NodeAllocationResult::new(
                    node,
                    node_decision(c),
                    Some(c.decision.clone()),
                    rank + 1,
                ))
            })
            .collect();
        Some(results)
    }

    fn decide_allocate_unassigned(&self, shard: &ShardRouting) -> AllocateUnassignedDecision {
        let candidates = self.candidates(shard, None);
        let node_decisions = self.node_results(&candidates, |c| {
            AllocationDecision::from_decision_type(c.decision.decision_type())
        });
        match candidates.iter().find(|c| c.decision.is_yes()) {
            Some(best) => AllocateUnassignedDecision::yes(&best.node_id, node_decisions),
            None => {
                let status = if candidates.iter().any(|c| c.decision.is_throttle()) {
                    AllocationStatus::DecidersThrottled
                } else {
                    AllocationStatus::DecidersNo
                };
                AllocateUnassignedDecision::no(status, node_decisions)
            }
        }
    }

    fn decide_move(&self, shard: &ShardRouting) -> MoveDecision {
        let Some(node) = shard
            .current_node_id()
            .and_then(|id| self.allocation.routing_nodes().node(id))
        else {
            return MoveDecision::stay(Decision::ALWAYS);
        };
        let can_remain = self
            .allocation
            .deciders()
            .can_remain(shard, node, self.allocation);
        if !can_remain.is_no() {
            return MoveDecision::stay(can_remain);
        }

        let candidates = self.candidates(shard, Some(node.node_id()));
        let node_decisions = self.node_results(&candidates, |c| {
            AllocationDecision::from_decision_type(c.decision.decision_type())
        });
        let target = candidates.iter().find(|c| c.decision.is_yes());
        let (final_decision, explanation) = match target {
            Some(_) => (
                AllocationDecision::Yes,
                "shard cannot remain on this node and is forced to move to another node",
            ),
            None if candidates.iter().any(|c| c.decision.is_throttle()) => (
                AllocationDecision::Throttled,
                "shard cannot remain on this node but is throttled on moving to another node",
            ),
            None => (
                AllocationDecision::No,
                "cannot move shard to another node, even though it is not allowed to remain on its current node",
            ),
        };
        MoveDecision {
            can_remain_decision: Some(can_remain),
            can_rebalance_cluster_decision: None,
            final_decision,
            target_node: target.map(|c| c.node_id.clone()),
            node_decisions,
            current_node_ranking: 0,
            explanation: explanation.to_string(),
        }
    }

    fn decide_rebalance(&self, shard: &ShardRouting, can_remain: Decision) -> MoveDecision {
        let can_rebalance = self.allocation.deciders().can_rebalance(shard, self.allocation);
        let mut decision = MoveDecision::stay(can_remain);
        decision.can_rebalance_cluster_decision = Some(can_rebalance.clone());
        if !can_rebalance.is_yes() {
            decision.final_decision = AllocationDecision::from_decision_type(can_rebalance.decision_type());
            decision.explanation = if can_rebalance.is_throttle() {
                "rebalancing is throttled".to_string()
            } else {
                "rebalancing is not allowed".to_string()
            };
            return decision;
        }

        let Some(current) = shard.current_node_id() else {
            return decision;
        };
        let index = &shard.shard_id.index;
        let key = shard.shard_id.to_string();
        let current_weight = self.weight(current, index, 0.0);
        let current_after = self.weight(current, index, -1.0);

        let mut ranking: Vec<(&str, f64)> = self
            .node_ids
            .iter()
            .map(|id| (id.as_str(), self.weight(id, index, 0.0)))
            .collect();
        ranking.sort_by(|a, b| Self::compare(&key, *a, *b));
        decision.current_node_ranking = ranking
            .iter()
            .position(|(id, _)| *id == current)
            .map_or(0, |p| p + 1);

        let candidates = self.candidates(shard, Some(current));
        let improves = |c: &Candidate| {
            let delta = current_weight - self.weight(&c.node_id, index, 0.0);
            delta > self.threshold && (c.weight - current_after).abs() < delta
        };
        let node_decision = |c: &Candidate| {
            if c.decision.is_yes() && !improves(c) {
                AllocationDecision::WorseBalance
            } else {
                AllocationDecision::from_decision_type(c.decision.decision_type())
            }
        };
        decision.node_decisions = self.node_results(&candidates, &node_decision);

        let target = candidates
            .iter()
            .find(|&c| node_decision(c) == AllocationDecision::Yes);
        match target {
            Some(target) => {
                decision.final_decision = AllocationDecision::Yes;
                decision.target_node = Some(target.node_id.clone());
                decision.explanation =
                    "can rebalance shard to a node that improves the cluster balance".to_string();
            }
            None if candidates.iter().any(|c| c.decision.is_throttle() && improves(c)) => {
                decision.final_decision = AllocationDecision::Throttled;
                decision.explanation =
                    "rebalancing to a better node is throttled".to_string();
            }
            None => {
                decision.final_decision = AllocationDecision::No;
                decision.explanation = "cannot rebalance as no target node exists that can both allocate this shard and improve the cluster balance".to_string();
            }
        }
        decision
    }

    /// Highest-weight node first, lowest-weight partner first; returns the
    /// first copy whose move shrinks the gap and that every decider allows
    fn find_rebalance_move(&self, index: &str) -> Option<(ShardRouting, String)> {
        let mut nodes: Vec<(&str, f64)> = self
            .node_ids
            .iter()
            .map(|id| (id.as_str(), self.weight(id, index, 0.0)))
            .collect();
        nodes.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        for high in (0..nodes.len()).rev() {
            for low in 0..high {
                let delta = nodes[high].1 - nodes[low].1;
                if delta <= self.threshold {
                    break;
                }
                let after = (self.weight(nodes[low].0, index, 1.0)
                    - self.weight(nodes[high].0, index, -1.0))
                .abs();
                if after >= delta {
                    continue;
                }
                if let Some(shard) = self.try_relocate(nodes[high].0, nodes[low].0, index) {
                    return Some((shard, nodes[low].0.to_string()));
                }
            }
        }
        None
    }

    fn try_relocate(&self, from: &str, to: &str, index: &str) -> Option<ShardRouting> {
        let routing_nodes = self.allocation.routing_nodes();
        let (source, target) = (routing_nodes.node(from)?, routing_nodes.node(to)?);
        let deciders = self.allocation.deciders();

        let mut shards: Vec<&ShardRouting> = source
            .shards()
            .iter()
            .filter(|s| s.shard_id.index == index && s.started())
            .collect();
        // replicas first, they are cheaper to move than primaries
        shards.sort_by(|a, b| (a.primary, &a.shard_id).cmp(&(b.primary, &b.shard_id)));

        shards
            .into_iter()
            .filter(|s| target.get_by_shard_id(&s.shard_id).is_none())
            .find(|s| {
                deciders.can_rebalance(s, self.allocation).is_yes()
                    && deciders.can_allocate(s, target, self.allocation).is_yes()
            })
            .cloned()
    }
}
