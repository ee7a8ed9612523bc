//! Voting configuration maintenance as master-eligible nodes come and go

use crate::cluster::{DiscoveryNodes, VotingConfiguration};
use std::collections::BTreeSet;

/// Smallest configuration size kept once a cluster has grown to it
const MIN_RESILIENT_SIZE: usize = 3;

/// Chooses the voting configuration for the given live nodes.
///
/// The result has odd size, always contains the leader, prefers live nodes
/// already in the configuration, and never drops below three members once
/// the current configuration has three or more. When there are too few live
/// nodes for that, current members that are gone are kept.
pub fn reconfigure(
    nodes: &DiscoveryNodes,
    exclusions: &BTreeSet<String>,
    leader_id: &str,
    current: &VotingConfiguration,
) -> VotingConfiguration {
    let live: BTreeSet<&str> = nodes
        .master_eligible_nodes()
        .map(|n| n.id())
        .filter(|id| !exclusions.contains(*id))
        .collect();

    let min_size = if current.len() >= MIN_RESILIENT_SIZE {
        MIN_RESILIENT_SIZE
    } else {
        1
    };
    let live_odd = if live.len() % 2 == 0 {
        live.len().saturating_sub(1)
    } else {
        live.len()
    };
    let target = live_odd.max(min_size);

    // leader, live current members, other live nodes, then departed members
    let mut ordered: Vec<&str> = vec![leader_id];
    ordered.extend(live.iter().copied().filter(|id| current.contains(id)));
    ordered.extend(live.iter().copied().filter(|id| !current.contains(id)));
    ordered.extend(
        current
            .node_ids()
            .filter(|id| !live.contains(id) && !exclusions.contains(*id)),
    );

    let mut chosen: Vec<&str> = Vec::with_capacity(target);
    for id in ordered {
        if chosen.len() == target {
            break;
        }
        if !chosen.contains(&id) {
            chosen.push(id);
        }
    }
    if chosen.len() % 2 == 0 {
        chosen.pop();
    }

    let next = VotingConfiguration::new(chosen);
    if &next != current {
        tracing::info!(from = %current, to = %next, "reconfiguring voting configuration");
    }
    next
}
