//! Durable coordination state: current term and last accepted cluster state

use crate::cluster::ClusterState;
use crate::common::Result;
use parking_lot::Mutex;
use std::sync::Arc;

/// What must survive a restart for the election rules to stay safe
pub trait PersistedState: Send + Sync {
    fn current_term(&self) -> u64;

    fn last_accepted_state(&self) -> Arc<ClusterState>;

    fn set_current_term(&self, term: u64) -> Result<()>;

    fn set_last_accepted_state(&self, state: Arc<ClusterState>) -> Result<()>;
}

pub struct InMemoryPersistedState {
    inner: Mutex<(u64, Arc<ClusterState>)>,
}

impl InMemoryPersistedState {
    pub fn new(current_term: u64, accepted: ClusterState) -> Self {
        Self {
            inner: Mutex::new((current_term, Arc::new(accepted))),
        }
    }
}

impl PersistedState for InMemoryPersistedState {
    fn current_term(&self) -> u64 {
        self.inner.lock().0
    }

    fn last_accepted_state(&self) -> Arc<ClusterState> {
        self.inner.lock().1.clone()
    }

    fn set_current_term(&self, term: u64) -> Result<()> {
        self.inner.lock().0 = term;
        Ok(())
    }

    fn set_last_accepted_state(&self, state: Arc<ClusterState>) -> Result<()> {
        self.inner.lock().1 = state;
        Ok(())
    }
}
