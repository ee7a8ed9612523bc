//! Cluster blocks
//!
//! A block disables a class of operations, either cluster-wide or for a
//! single index.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBlockLevel {
    Read,
    Write,
    MetadataRead,
    MetadataWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: String,
    pub levels: BTreeSet<ClusterBlockLevel>,
    pub retryable: bool,
}

impl ClusterBlock {
    pub fn new(
        id: u32,
        description: impl Into<String>,
        retryable: bool,
        levels: impl IntoIterator<Item = ClusterBlockLevel>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            levels: levels.into_iter().collect(),
            retryable,
        }
    }

    /// Installed while no leader is known
    pub fn no_leader() -> Self {
        Self::new(
            2,
            "no leader",
            true,
            [ClusterBlockLevel::Write, ClusterBlockLevel::MetadataWrite],
        )
    }

    pub fn read_only() -> Self {
        Self::new(
            6,
            "cluster read-only",
            false,
            [ClusterBlockLevel::Write, ClusterBlockLevel::MetadataWrite],
        )
    }

    pub fn contains(&self, level: ClusterBlockLevel) -> bool {
        self.levels.contains(&level)
    }
}

impl std::fmt::Display for ClusterBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.id, self.description)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: Vec<ClusterBlock>,
    indices: BTreeMap<String, Vec<ClusterBlock>>,
}

impl ClusterBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global_block(mut self, block: ClusterBlock) -> Self {
        self.add_global_block(block);
        self
    }

    pub fn with_index_block(mut self, index: impl Into<String>, block: ClusterBlock) -> Self {
        self.add_index_block(index, block);
        self
    }

    pub fn add_global_block(&mut self, block: ClusterBlock) {
        if !self.global.iter().any(|b| b.id == block.id) {
            self.global.push(block);
        }
    }

    pub fn remove_global_block(&mut self, id: u32) {
        self.global.retain(|b| b.id != id);
    }

    pub fn add_index_block(&mut self, index: impl Into<String>, block: ClusterBlock) {
        let blocks = self.indices.entry(index.into()).or_default();
        if !blocks.iter().any(|b| b.id == block.id) {
            blocks.push(block);
        }
    }

    pub fn remove_index(&mut self, index: &str) {
        self.indices.remove(index);
    }

    pub fn global(&self) -> &[ClusterBlock] {
        &self.global
    }

    pub fn global_blocked(&self, level: ClusterBlockLevel) -> bool {
        self.global.iter().any(|b| b.contains(level))
    }

    pub fn index_blocked(&self, level: ClusterBlockLevel, index: &str) -> bool {
        self.global_blocked(level)
            || self
                .indices
                .get(index)
                .map(|blocks| blocks.iter().any(|b| b.contains(level)))
                .unwrap_or(false)
    }

    /// `ClusterBlocked` naming every global block at `level`
    pub fn global_block_error(&self, level: ClusterBlockLevel) -> Result<()> {
        let blocking: Vec<String> = self
            .global
            .iter()
            .filter(|b| b.contains(level))
            .map(ToString::to_string)
            .collect();
        if blocking.is_empty() {
            Ok(())
        } else {
            Err(Error::ClusterBlocked(blocking.join(", ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_and_index_levels() {
        let blocks = ClusterBlocks::new()
            .with_global_block(ClusterBlock::no_leader())
            .with_index_block(
                "logs",
                ClusterBlock::new(8, "index read-only", false, [ClusterBlockLevel::Write]),
            );

        assert!(blocks.global_blocked(ClusterBlockLevel::MetadataWrite));
        assert!(!blocks.global_blocked(ClusterBlockLevel::MetadataRead));
        assert!(blocks.index_blocked(ClusterBlockLevel::Write, "logs"));
        assert!(!blocks.index_blocked(ClusterBlockLevel::Read, "logs"));
        assert!(blocks.global_block_error(ClusterBlockLevel::Read).is_ok());
    }

    #[test]
    fn test_block_error_lists_blocks() {
        let blocks = ClusterBlocks::new().with_global_block(ClusterBlock::new(
            1,
            "state not recovered",
            true,
            [ClusterBlockLevel::MetadataRead],
        ));
        assert_eq!(
            blocks.global_block_error(ClusterBlockLevel::MetadataRead),
            Err(Error::ClusterBlocked("1/state not recovered".into()))
        );
    }

    #[test]
    fn test_duplicate_block_ids_ignored() {
        let mut blocks = ClusterBlocks::new();
        blocks.add_global_block(ClusterBlock::read_only());
        blocks.add_global_block(ClusterBlock::read_only());
        assert_eq!(blocks.global().len(), 1);
        blocks.remove_global_block(6);
        assert!(blocks.global().is_empty());
    }
}
