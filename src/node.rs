//! One cluster member, fully wired
//!
//! Owns the coordinator, the allocation service, the management executor and
//! the explain service of a single process, and exposes the operations a
//! caller needs: reading the applied state, proposing changes, index
//! lifecycle, shard lifecycle reports and allocation explanations.

use crate::allocation::cluster_info::{InMemoryClusterInfoService, InMemorySnapshotsInfoService};
use crate::allocation::management::ManagementExecutor;
use crate::allocation::service::{AllocationService, FailedShard};
use crate::cluster::{
    ClusterBlockLevel, ClusterState, ClusterStateDiff, ClusterStateView, DiscoveryNode, IndexMetadata,
    ShardRouting,
};
use crate::common::{Config, Error, Result};
use crate::coordinator::{Coordinator, InMemoryPersistedState, LocalTransport, Mode};
use crate::discovery::{DiscoveryModule, DiscoveryPlugin};
use crate::explain::{ClusterAllocationExplainRequest, ClusterAllocationExplainService, ClusterAllocationExplanation};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

pub struct ClusterNode {
    local_node: DiscoveryNode,
    transport: LocalTransport,
    coordinator: Arc<Coordinator>,
    allocation: Arc<AllocationService>,
    executor: ManagementExecutor,
    explain: ClusterAllocationExplainService,
    cluster_info: Arc<InMemoryClusterInfoService>,
    snapshots: Arc<InMemorySnapshotsInfoService>,
    executor_task: Mutex<Option<JoinHandle<()>>>,
}

/// Builds the local node's identity from configuration. A node without a
/// configured id gets a random one.
pub fn local_node_from_config(config: &Config) -> Result<DiscoveryNode> {
    let node = &config.node;
    let id = node
        .id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
    let version = semver::Version::parse(&node.version)
        .map_err(|e| Error::InvalidConfig(format!("node.version [{}]: {}", node.version, e)))?;
    Ok(DiscoveryNode::new(id, node.name.clone(), node.address.clone(), node.roles.iter().copied())
        .with_attributes(node.attributes.clone())
        .with_version(version))
}

impl ClusterNode {
    /// Starts a node on `transport` with the built-in discovery components
    pub async fn start(config: Config, transport: &LocalTransport) -> Result<Self> {
        Self::start_with_plugins(config, transport, &[]).await
    }

    /// Fails with a configuration error before anything is spawned if the
    /// discovery settings or plugins do not resolve
    pub async fn start_with_plugins(
        config: Config,
        transport: &LocalTransport,
        plugins: &[Arc<dyn DiscoveryPlugin>],
    ) -> Result<Self> {
        config.validate()?;
        let discovery = DiscoveryModule::new(&config, plugins)?;
        let local_node = local_node_from_config(&config)?;

        let cluster_info = Arc::new(InMemoryClusterInfoService::new());
        let snapshots = Arc::new(InMemorySnapshotsInfoService::new());
        let allocation = Arc::new(AllocationService::new(
            config.allocation.clone(),
            cluster_info.clone(),
            snapshots.clone(),
        ));

        let persisted = Arc::new(InMemoryPersistedState::new(
            0,
            ClusterState::empty(config.cluster.name.clone()),
        ));
        let coordinator = Coordinator::new(
            local_node.clone(),
            &config,
            &discovery,
            Arc::new(transport.channel(local_node.address())),
            persisted,
            allocation.clone(),
        );

        let (executor, executor_task) = ManagementExecutor::start(
            coordinator.clone(),
            allocation.clone(),
            config.cluster.reroute_max_attempts,
            coordinator.subscribe_shutdown(),
        );
        coordinator.set_reroute_service(Arc::new(executor.clone()));

        transport.register(local_node.address(), coordinator.clone());
        if let Err(e) = coordinator.start() {
            transport.unregister(local_node.address());
            coordinator.shutdown().await;
            return Err(e);
        }

        tracing::info!(
            node = %local_node,
            cluster = %config.cluster.name,
            discovery_type = %discovery.discovery_type(),
            election_strategy = discovery.election_strategy_name(),
            "node started"
        );

        Ok(Self {
            local_node,
            transport: transport.clone(),
            coordinator,
            explain: ClusterAllocationExplainService::new(allocation.clone()),
            allocation,
            executor,
            cluster_info,
            snapshots,
            executor_task: Mutex::new(Some(executor_task)),
        })
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn allocation_service(&self) -> &Arc<AllocationService> {
        &self.allocation
    }

    /// Disk usage and shard sizes seen by the allocation deciders
    pub fn cluster_info_service(&self) -> &Arc<InMemoryClusterInfoService> {
        &self.cluster_info
    }

    pub fn snapshots_info_service(&self) -> &Arc<InMemorySnapshotsInfoService> {
        &self.snapshots
    }

    pub fn mode(&self) -> Mode {
        self.coordinator.mode()
    }

    pub fn is_leader(&self) -> bool {
        self.coordinator.is_leader()
    }

    pub fn current_state(&self) -> Arc<ClusterState> {
        self.coordinator.state_holder().current()
    }

    /// Applied state plus whether this node currently lacks a leader
    pub fn current_state_view(&self) -> ClusterStateView {
        self.coordinator.state_holder().view()
    }

    pub async fn propose_state_change(&self, diff: ClusterStateDiff) -> Result<Arc<ClusterState>> {
        self.coordinator.propose_state_change(diff).await
    }

    pub fn explain_allocation(
        &self,
        request: &ClusterAllocationExplainRequest,
    ) -> Result<ClusterAllocationExplanation> {
        let state = self.current_state();
        self.explain.explain(&state, request)
    }

    /// Adds an index and waits for the allocation round that places it
    pub async fn create_index(&self, index: IndexMetadata) -> Result<Arc<ClusterState>> {
        let state = self.current_state();
        state.blocks.global_block_error(ClusterBlockLevel::MetadataWrite)?;
        if state.metadata.has_index(&index.name) {
            return Err(Error::InvalidState(format!("index [{}] already exists", index.name)));
        }
        let name = index.name.clone();
        let diff = ClusterStateDiff::new(&state).upsert_index(index);
        let committed = self.propose_state_change(diff).await?;
        tracing::info!(index = %name, version = committed.version, "created index");

        self.executor.reroute_and_wait(&format!("api: create index [{}]", name)).await?;
        Ok(self.current_state())
    }

    pub async fn delete_index(&self, name: &str) -> Result<Arc<ClusterState>> {
        let state = self.current_state();
        state.blocks.global_block_error(ClusterBlockLevel::MetadataWrite)?;
        if !state.metadata.has_index(name) {
            return Err(Error::IndexNotFound(name.to_string()));
        }
        let committed = self
            .propose_state_change(ClusterStateDiff::new(&state).remove_index(name))
            .await?;
        tracing::info!(index = %name, version = committed.version, "deleted index");

        self.executor.reroute_and_wait(&format!("api: delete index [{}]", name)).await?;
        Ok(self.current_state())
    }

    /// Reports copies that finished recovering. Leader only.
    pub async fn shards_started(&self, shards: Vec<ShardRouting>) -> Result<()> {
        self.executor.shards_started(shards).await
    }

    pub async fn shards_failed(&self, shards: Vec<FailedShard>) -> Result<()> {
        self.executor.shards_failed(shards).await
    }

    pub async fn reroute(&self, reason: &str) -> Result<()> {
        self.executor.reroute_and_wait(reason).await
    }

    /// Waits until the applied state satisfies `predicate`
    pub async fn wait_for_state(
        &self,
        timeout: Duration,
        predicate: impl Fn(&ClusterState) -> bool,
    ) -> Result<Arc<ClusterState>> {
        let mut rx = self.coordinator.state_holder().subscribe();
        let wait = async {
            loop {
                let state = rx.borrow_and_update().clone();
                if predicate(&state) {
                    return Ok(state);
                }
                if rx.changed().await.is_err() {
                    return Err(Error::ShuttingDown(self.local_node.to_string()));
                }
            }
        };
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(Error::Other(format!(
                "timed out after {:?} waiting for cluster state on {}",
                timeout, self.local_node
            ))),
        }
    }

    pub async fn shutdown(&self) {
        self.transport.unregister(self.local_node.address());
        self.coordinator.shutdown().await;
        let task = self.executor_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!(node = %self.local_node, "node stopped");
    }
}
