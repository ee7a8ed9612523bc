//! Holder of the locally applied cluster state
//!
//! Readers get an `Arc` snapshot and never observe a half-applied state.
//! Appliers are notified through a watch channel.

use crate::cluster::state::ClusterState;
use crate::common::{Error, Result};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Applied state plus whether it may be out of date
#[derive(Debug, Clone)]
pub struct ClusterStateView {
    pub local_node_id: String,
    pub state: Arc<ClusterState>,
    /// Set while this node has no leader (e.g. on the minority side of a partition)
    pub stale: bool,
}

pub struct ClusterStateHolder {
    local_node_id: String,
    current: ArcSwap<ClusterState>,
    stale: AtomicBool,
    tx: watch::Sender<Arc<ClusterState>>,
}

impl ClusterStateHolder {
    pub fn new(local_node_id: impl Into<String>, initial: ClusterState) -> Self {
        let initial = Arc::new(initial);
        let (tx, _rx) = watch::channel(initial.clone());
        Self {
            local_node_id: local_node_id.into(),
            current: ArcSwap::new(initial),
            stale: AtomicBool::new(true),
            tx,
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_node_id
    }

    pub fn current(&self) -> Arc<ClusterState> {
        self.current.load_full()
    }

    pub fn view(&self) -> ClusterStateView {
        ClusterStateView {
            local_node_id: self.local_node_id.clone(),
            state: self.current(),
            stale: self.is_stale(),
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::Release);
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }

    /// Replace the applied state. Only strictly newer states are accepted.
    pub fn apply(&self, state: Arc<ClusterState>) -> Result<()> {
        let current = self.current();
        if !state.supersedes(&current) {
            return Err(Error::CoordinationStateRejected(format!(
                "state term {} version {} does not supersede applied term {} version {}",
                state.term, state.version, current.term, current.version
            )));
        }
        tracing::debug!(
            node = %self.local_node_id,
            term = state.term,
            version = state.version,
            "applying cluster state"
        );
        self.current.store(state.clone());
        self.tx.send_replace(state);
        Ok(())
    }
}
