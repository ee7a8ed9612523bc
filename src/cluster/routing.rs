//! Routing table: where every shard copy lives
//!
//! A relocating copy is stored once, as its source (`RELOCATING`, with both
//! node ids). The initializing copy on the target node only exists in the
//! per-round `RoutingNodes` view, so copies per shard never exceed
//! `1 + number_of_replicas` here.

use crate::cluster::metadata::{IndexMetadata, Metadata};
use crate::common::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Identifies one shard of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub id: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, id: u32) -> Self {
        Self {
            index: index.into(),
            id,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

impl std::fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Why a shard copy is unassigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnassignedReason {
    IndexCreated,
    ReplicaAdded,
    NodeLeft,
    AllocationFailed,
    PrimaryFailed,
    Reinitialized,
}

/// Outcome of the last allocation attempt for an unassigned copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    NoAttempt,
    DecidersNo,
    DecidersThrottled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub message: Option<String>,
    pub at: DateTime<Utc>,
    pub failed_allocations: u32,
    pub last_allocation_status: AllocationStatus,
}

impl UnassignedInfo {
    pub fn new(reason: UnassignedReason, message: Option<String>) -> Self {
        Self {
            reason,
            message,
            at: Utc::now(),
            failed_allocations: 0,
            last_allocation_status: AllocationStatus::NoAttempt,
        }
    }
}

/// One copy of a shard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub current_node_id: Option<String>,
    pub relocating_node_id: Option<String>,
    pub primary: bool,
    pub state: ShardRoutingState,
    pub unassigned_info: Option<UnassignedInfo>,
    /// Size hint carried while initializing or relocating
    pub expected_shard_size: Option<u64>,
}

impl ShardRouting {
    pub fn new_unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            current_node_id: None,
            relocating_node_id: None,
            primary,
            state: ShardRoutingState::Unassigned,
            unassigned_info: Some(info),
            expected_shard_size: None,
        }
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// Started or relocating: holds a full copy of the data
    pub fn active(&self) -> bool {
        self.started() || self.relocating()
    }

    pub fn assigned_to_node(&self) -> bool {
        self.current_node_id.is_some()
    }

    /// The initializing half of a relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node_id.is_some()
    }

    pub fn current_node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    pub fn relocating_node_id(&self) -> Option<&str> {
        self.relocating_node_id.as_deref()
    }

    /// Key used for shard size lookups, e.g. `[logs][0][p]`
    pub fn shard_key(&self) -> String {
        shard_size_key(&self.shard_id, self.primary)
    }

    /// Same copy: same shard, same role, same node
    pub fn is_same_copy(&self, other: &ShardRouting) -> bool {
        self.shard_id == other.shard_id
            && self.primary == other.primary
            && self.current_node_id == other.current_node_id
    }

    pub fn initialize(&self, node_id: &str, expected_shard_size: Option<u64>) -> Result<ShardRouting> {
        if !self.unassigned() {
            return Err(self.illegal_transition("initialize"));
        }
        Ok(ShardRouting {
            current_node_id: Some(node_id.to_string()),
            state: ShardRoutingState::Initializing,
            expected_shard_size,
            ..self.clone()
        })
    }

    pub fn move_to_started(&self) -> Result<ShardRouting> {
        if !self.initializing() {
            return Err(self.illegal_transition("start"));
        }
        Ok(ShardRouting {
            relocating_node_id: None,
            state: ShardRoutingState::Started,
            unassigned_info: None,
            expected_shard_size: None,
            ..self.clone()
        })
    }

    pub fn relocate(&self, target_node_id: &str, expected_shard_size: Option<u64>) -> Result<ShardRouting> {
        if !self.started() {
            return Err(self.illegal_transition("relocate"));
        }
        if self.current_node_id.as_deref() == Some(target_node_id) {
            return Err(Error::InvalidState(format!(
                "{} cannot relocate to its own node [{}]",
                self.shard_id, target_node_id
            )));
        }
        Ok(ShardRouting {
            relocating_node_id: Some(target_node_id.to_string()),
            state: ShardRoutingState::Relocating,
            expected_shard_size,
            ..self.clone()
        })
    }

    pub fn cancel_relocation(&self) -> Result<ShardRouting> {
        if !self.relocating() {
            return Err(self.illegal_transition("cancel relocation"));
        }
        Ok(ShardRouting {
            relocating_node_id: None,
            state: ShardRoutingState::Started,
            expected_shard_size: None,
            ..self.clone()
        })
    }

    /// The initializing copy on the relocation target
    pub fn target_relocating_shard(&self) -> Result<ShardRouting> {
        match (self.state, &self.current_node_id, &self.relocating_node_id) {
            (ShardRoutingState::Relocating, Some(source), Some(target)) => Ok(ShardRouting {
                shard_id: self.shard_id.clone(),
                current_node_id: Some(target.clone()),
                relocating_node_id: Some(source.clone()),
                primary: self.primary,
                state: ShardRoutingState::Initializing,
                unassigned_info: None,
                expected_shard_size: self.expected_shard_size,
            }),
            _ => Err(self.illegal_transition("derive relocation target")),
        }
    }

    pub fn move_to_unassigned(&self, info: UnassignedInfo) -> ShardRouting {
        ShardRouting {
            shard_id: self.shard_id.clone(),
            current_node_id: None,
            relocating_node_id: None,
            primary: self.primary,
            state: ShardRoutingState::Unassigned,
            unassigned_info: Some(info),
            expected_shard_size: None,
        }
    }

    pub fn promote_to_primary(&self) -> ShardRouting {
        ShardRouting {
            primary: true,
            ..self.clone()
        }
    }

    pub fn demote_to_replica(&self) -> ShardRouting {
        ShardRouting {
            primary: false,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        let ok = match self.state {
            ShardRoutingState::Unassigned => {
                self.current_node_id.is_none()
                    && self.relocating_node_id.is_none()
                    && self.unassigned_info.is_some()
            }
            ShardRoutingState::Initializing => self.current_node_id.is_some(),
            ShardRoutingState::Started => {
                self.current_node_id.is_some() && self.relocating_node_id.is_none()
            }
            ShardRoutingState::Relocating => match (&self.current_node_id, &self.relocating_node_id) {
                (Some(source), Some(target)) => source != target,
                _ => false,
            },
        };
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidState(format!("inconsistent shard routing {}", self)))
        }
    }

    fn illegal_transition(&self, action: &str) -> Error {
        Error::InvalidState(format!("cannot {} shard {}", action, self))
    }
}

impl std::fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, node[{}], {}[{}], s[{}]",
            self.shard_id,
            self.current_node_id.as_deref().unwrap_or("null"),
            match &self.relocating_node_id {
                Some(_) => "relocating ",
                None => "",
            },
            if self.primary { "P" } else { "R" },
            self.state
        )?;
        if let Some(target) = &self.relocating_node_id {
            write!(f, ", relocating_node[{}]", target)?;
        }
        Ok(())
    }
}

pub fn shard_size_key(shard_id: &ShardId, primary: bool) -> String {
    format!("{}[{}]", shard_id, if primary { "p" } else { "r" })
}

/// All copies of one shard, primary first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    copies: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    /// Copies are kept in a canonical order: primary first, then assigned
    /// copies by node id, then unassigned ones
    pub fn new(shard_id: ShardId, mut copies: Vec<ShardRouting>) -> Self {
        copies.sort_by(|a, b| {
            (!a.primary, a.current_node_id.is_none(), &a.current_node_id)
                .cmp(&(!b.primary, b.current_node_id.is_none(), &b.current_node_id))
        });
        Self { shard_id, copies }
    }

    pub fn copies(&self) -> &[ShardRouting] {
        &self.copies
    }

    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.copies.iter().find(|c| c.primary)
    }

    pub fn replica_shards(&self) -> Vec<&ShardRouting> {
        self.copies.iter().filter(|c| !c.primary).collect()
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.copies.iter().filter(|c| c.active())
    }

    pub fn all_started(&self) -> bool {
        self.copies.iter().all(|c| c.started())
    }
}

/// Routing of every shard of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    /// All copies unassigned, as for a new index
    pub fn new_unassigned(metadata: &IndexMetadata, reason: UnassignedReason) -> Self {
        let shards = (0..metadata.number_of_shards)
            .map(|id| {
                let shard_id = ShardId::new(&metadata.name, id);
                let copies = (0..metadata.copies_per_shard())
                    .map(|copy| {
                        ShardRouting::new_unassigned(
                            shard_id.clone(),
                            copy == 0,
                            UnassignedInfo::new(reason, None),
                        )
                    })
                    .collect();
                (id, IndexShardRoutingTable::new(shard_id, copies))
            })
            .collect();
        Self {
            index: metadata.name.clone(),
            shards,
        }
    }

    pub fn shard(&self, id: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&id)
    }

    pub fn shards(&self) -> impl Iterator<Item = &IndexShardRoutingTable> {
        self.shards.values()
    }

    pub fn all_primaries_active(&self) -> bool {
        self.shards
            .values()
            .all(|s| s.primary_shard().map(|p| p.active()).unwrap_or(false))
    }
}

/// Index name -> shard id -> copies
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a flat list of copies; indices without copies are dropped
    pub fn from_shards(shards: impl IntoIterator<Item = ShardRouting>) -> Self {
        let mut grouped: BTreeMap<String, BTreeMap<u32, Vec<ShardRouting>>> = BTreeMap::new();
        for shard in shards {
            grouped
                .entry(shard.shard_id.index.clone())
                .or_default()
                .entry(shard.shard_id.id)
                .or_default()
                .push(shard);
        }
        let indices = grouped
            .into_iter()
            .map(|(index, shards)| {
                let shards = shards
                    .into_iter()
                    .map(|(id, copies)| {
                        (id, IndexShardRoutingTable::new(ShardId::new(&index, id), copies))
                    })
                    .collect();
                (index.clone(), IndexRoutingTable { index, shards })
            })
            .collect();
        Self { indices }
    }

    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn shard_routing_table(&self, index: &str, shard: u32) -> Result<&IndexShardRoutingTable> {
        self.indices
            .get(index)
            .ok_or_else(|| Error::IndexNotFound(index.to_string()))?
            .shard(shard)
            .ok_or_else(|| Error::ShardNotFound {
                index: index.to_string(),
                shard,
            })
    }

    /// Every copy, ordered by index, shard id, primary first
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices
            .values()
            .flat_map(|i| i.shards.values())
            .flat_map(|s| s.copies.iter())
    }

    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.all_shards().filter(|s| s.state == state).collect()
    }

    pub fn add_as_new(&mut self, metadata: &IndexMetadata) {
        self.indices.insert(
            metadata.name.clone(),
            IndexRoutingTable::new_unassigned(metadata, UnassignedReason::IndexCreated),
        );
    }

    /// Brings every shard of the index to `number_of_replicas` replicas.
    /// New replicas start unassigned; surplus ones are dropped least
    /// recovered first (unassigned, initializing, relocating, started).
    pub fn update_number_of_replicas(&mut self, metadata: &IndexMetadata) {
        let Some(index_routing) = self.indices.get_mut(&metadata.name) else {
            return;
        };
        let wanted = metadata.number_of_replicas as usize;
        for shard_table in index_routing.shards.values_mut() {
            let (primaries, mut replicas): (Vec<ShardRouting>, Vec<ShardRouting>) =
                shard_table.copies.drain(..).partition(|c| c.primary);
            if replicas.len() < wanted {
                let message = format!("number_of_replicas raised to {}", wanted);
                for _ in replicas.len()..wanted {
                    replicas.push(ShardRouting::new_unassigned(
                        shard_table.shard_id.clone(),
                        false,
                        UnassignedInfo::new(UnassignedReason::ReplicaAdded, Some(message.clone())),
                    ));
                }
            } else if replicas.len() > wanted {
                // stable sort, so ties drop the copies later in canonical order
                replicas.sort_by_key(|c| match c.state {
                    ShardRoutingState::Started => 0,
                    ShardRoutingState::Relocating => 1,
                    ShardRoutingState::Initializing => 2,
                    ShardRoutingState::Unassigned => 3,
                });
                replicas.truncate(wanted);
            }
            *shard_table = IndexShardRoutingTable::new(
                shard_table.shard_id.clone(),
                primaries.into_iter().chain(replicas).collect(),
            );
        }
    }

    pub fn remove_index(&mut self, name: &str) -> Option<IndexRoutingTable> {
        self.indices.remove(name)
    }

    /// Checks the routing invariants against the index metadata
    pub fn validate(&self, metadata: &Metadata) -> Result<()> {
        for (name, index_routing) in &self.indices {
            let index_meta = metadata.index(name).ok_or_else(|| {
                Error::InvalidState(format!("routing table has unknown index [{}]", name))
            })?;
            if index_routing.shards.len() != index_meta.number_of_shards as usize {
                return Err(Error::InvalidState(format!(
                    "index [{}] has {} shards in routing table, metadata says {}",
                    name,
                    index_routing.shards.len(),
                    index_meta.number_of_shards
                )));
            }
            for shard_table in index_routing.shards.values() {
                let primaries = shard_table.copies.iter().filter(|c| c.primary).count();
                if primaries != 1 {
                    return Err(Error::InvalidState(format!(
                        "shard {} has {} primaries",
                        shard_table.shard_id, primaries
                    )));
                }
                if shard_table.copies.len() > index_meta.copies_per_shard() {
                    return Err(Error::InvalidState(format!(
                        "shard {} has {} copies, at most {} allowed",
                        shard_table.shard_id,
                        shard_table.copies.len(),
                        index_meta.copies_per_shard()
                    )));
                }
                let mut nodes = BTreeSet::new();
                for copy in &shard_table.copies {
                    copy.validate()?;
                    if copy.shard_id != shard_table.shard_id {
                        return Err(Error::InvalidState(format!(
                            "copy {} filed under shard {}",
                            copy, shard_table.shard_id
                        )));
                    }
                    for node in copy.current_node_id.iter().chain(copy.relocating_node_id.iter()) {
                        if !nodes.insert(node.as_str()) {
                            return Err(Error::InvalidState(format!(
                                "shard {} has two copies on node [{}]",
                                shard_table.shard_id, node
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata_with(index: IndexMetadata) -> Metadata {
        let mut metadata = Metadata::default();
        metadata.indices.insert(index.name.clone(), index);
        metadata
    }

    #[test]
    fn test_new_index_is_unassigned() {
        let index = IndexMetadata::new("logs", 2, 1);
        let mut table = RoutingTable::new();
        table.add_as_new(&index);

        assert_eq!(table.all_shards().count(), 4);
        assert_eq!(table.shards_with_state(ShardRoutingState::Unassigned).len(), 4);
        let shard0 = table.shard_routing_table("logs", 0).unwrap();
        assert!(shard0.primary_shard().unwrap().primary);
        assert_eq!(shard0.replica_shards().len(), 1);
        table.validate(&metadata_with(index)).unwrap();
    }

    #[test]
    fn test_lifecycle_transitions() {
        let shard = ShardRouting::new_unassigned(
            ShardId::new("logs", 0),
            true,
            UnassignedInfo::new(UnassignedReason::IndexCreated, None),
        );
        let init = shard.initialize("n1", None).unwrap();
        assert!(init.initializing());
        assert!(init.move_to_started().unwrap().started());
        assert!(shard.move_to_started().is_err());

        let started = init.move_to_started().unwrap();
        let relocating = started.relocate("n2", Some(10)).unwrap();
        relocating.validate().unwrap();
        assert_eq!(relocating.relocating_node_id(), Some("n2"));

        let target = relocating.target_relocating_shard().unwrap();
        assert!(target.is_relocation_target());
        assert_eq!(target.current_node_id(), Some("n2"));
        assert_eq!(target.relocating_node_id(), Some("n1"));

        assert!(started.relocate("n1", None).is_err());
        assert!(relocating.cancel_relocation().unwrap().started());
    }

    #[test]
    fn test_validate_rejects_two_primaries() {
        let index = IndexMetadata::new("logs", 1, 1);
        let shard_id = ShardId::new("logs", 0);
        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
        let table = RoutingTable::from_shards(vec![
            ShardRouting::new_unassigned(shard_id.clone(), true, info.clone()),
            ShardRouting::new_unassigned(shard_id, true, info),
        ]);
        assert!(table.validate(&metadata_with(index)).is_err());
    }

    #[test]
    fn test_validate_rejects_too_many_copies() {
        let index = IndexMetadata::new("logs", 1, 0);
        let shard_id = ShardId::new("logs", 0);
        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
        let table = RoutingTable::from_shards(vec![
            ShardRouting::new_unassigned(shard_id.clone(), true, info.clone()),
            ShardRouting::new_unassigned(shard_id, false, info),
        ]);
        assert!(table.validate(&metadata_with(index)).is_err());
    }

    #[test]
    fn test_validate_rejects_copies_sharing_a_node() {
        let index = IndexMetadata::new("logs", 1, 1);
        let shard_id = ShardId::new("logs", 0);
        let info = UnassignedInfo::new(UnassignedReason::IndexCreated, None);
        let primary = ShardRouting::new_unassigned(shard_id.clone(), true, info.clone())
            .initialize("n1", None)
            .unwrap();
        let replica = ShardRouting::new_unassigned(shard_id, false, info)
            .initialize("n1", None)
            .unwrap();
        let table = RoutingTable::from_shards(vec![primary, replica]);
        assert!(table.validate(&metadata_with(index)).is_err());
    }

    #[test]
    fn test_lookup_errors() {
        let mut table = RoutingTable::new();
        table.add_as_new(&IndexMetadata::new("logs", 1, 0));
        assert_eq!(
            table.shard_routing_table("nope", 0).unwrap_err(),
            Error::IndexNotFound("nope".into())
        );
        assert!(matches!(
            table.shard_routing_table("logs", 5).unwrap_err(),
            Error::ShardNotFound { .. }
        ));
    }
}
