//! Join validation and joiner back-off

use crate::cluster::{ClusterState, DiscoveryNode};
use crate::common::{Error, Result};
use std::sync::Arc;
use std::time::Duration;

/// Checks a node may join the cluster described by `state`
pub trait JoinValidator: Send + Sync {
    fn name(&self) -> &str;

    /// `Err(JoinRejected)` with a reason when the node must not join
    fn validate_join(&self, node: &DiscoveryNode, state: &ClusterState) -> Result<()>;
}

/// Single-node discovery: only the local node may ever be a member
pub struct SingleNodeJoinValidator {
    local_node_id: String,
}

impl SingleNodeJoinValidator {
    pub fn new(local_node_id: impl Into<String>) -> Self {
        Self {
            local_node_id: local_node_id.into(),
        }
    }
}

impl JoinValidator for SingleNodeJoinValidator {
    fn name(&self) -> &str {
        "single_node"
    }

    fn validate_join(&self, node: &DiscoveryNode, _state: &ClusterState) -> Result<()> {
        if node.id() != self.local_node_id {
            return Err(Error::JoinRejected(format!(
                "single-node discovery is enabled, cannot join foreign node {}",
                node
            )));
        }
        Ok(())
    }
}

/// Once every member runs major N, nodes of an older major cannot join
pub struct MajorVersionBarrier;

impl JoinValidator for MajorVersionBarrier {
    fn name(&self) -> &str {
        "major_version_barrier"
    }

    fn validate_join(&self, node: &DiscoveryNode, state: &ClusterState) -> Result<()> {
        if let Some(min) = state.nodes.min_version() {
            if node.version().major < min.major {
                return Err(Error::JoinRejected(format!(
                    "node version [{}] may not join a cluster comprising only nodes of version [{}] or greater",
                    node.version(),
                    min
                )));
            }
        }
        Ok(())
    }
}

/// Wire compatibility: majors at most one apart
pub fn is_wire_compatible(a: &semver::Version, b: &semver::Version) -> bool {
    a.major.abs_diff(b.major) <= 1
}

/// The joining node must be able to talk to the oldest and newest member
pub struct NodeVersionCompatibility;

impl JoinValidator for NodeVersionCompatibility {
    fn name(&self) -> &str {
        "node_version"
    }

    fn validate_join(&self, node: &DiscoveryNode, state: &ClusterState) -> Result<()> {
        for member_version in [state.nodes.min_version(), state.nodes.max_version()]
            .into_iter()
            .flatten()
        {
            if !is_wire_compatible(node.version(), member_version) {
                return Err(Error::JoinRejected(format!(
                    "node version [{}] is not supported, cluster has a node of version [{}]",
                    node.version(),
                    member_version
                )));
            }
        }
        Ok(())
    }
}

/// An address already used by a member with a different id
pub struct DuplicateAddressValidator;

impl JoinValidator for DuplicateAddressValidator {
    fn name(&self) -> &str {
        "duplicate_address"
    }

    fn validate_join(&self, node: &DiscoveryNode, state: &ClusterState) -> Result<()> {
        if let Some(existing) = state.nodes.find_by_address(node.address()) {
            if existing.id() != node.id() {
                return Err(Error::JoinRejected(format!(
                    "found existing node {} with the same address as joining node {}",
                    existing, node
                )));
            }
        }
        Ok(())
    }
}

/// Built-in validators, in the order they run
pub fn builtin_join_validators(
    single_node: bool,
    local_node_id: &str,
) -> Vec<Arc<dyn JoinValidator>> {
    let mut validators: Vec<Arc<dyn JoinValidator>> = Vec::new();
    if single_node {
        validators.push(Arc::new(SingleNodeJoinValidator::new(local_node_id)));
    }
    validators.push(Arc::new(MajorVersionBarrier));
    validators.push(Arc::new(NodeVersionCompatibility));
    validators.push(Arc::new(DuplicateAddressValidator));
    validators
}

pub fn validate_join(
    validators: &[Arc<dyn JoinValidator>],
    node: &DiscoveryNode,
    state: &ClusterState,
) -> Result<()> {
    for validator in validators {
        if let Err(e) = validator.validate_join(node, state) {
            tracing::info!(node = %node, validator = validator.name(), error = %e, "join rejected");
            return Err(match e {
                Error::JoinRejected(_) => e,
                other => Error::JoinRejected(other.to_string()),
            });
        }
    }
    Ok(())
}

/// Exponential back-off for a rejected joiner: doubles on every rejection, capped
#[derive(Debug, Clone)]
pub struct JoinBackoff {
    initial: Duration,
    max: Duration,
    next: Duration,
}

impl JoinBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            next: initial,
        }
    }

    /// Delay to wait before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}
