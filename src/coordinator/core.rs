//! The coordinator: elections, publication and membership
//!
//! Every node runs one. Candidates discover peers, pre-vote, and start an
//! election by asking peers to join a new term. The winner publishes cluster
//! states in two phases (publish to all, commit once a quorum accepted) and
//! checks its followers; followers watch for the leader going quiet.
//!
//! Synchronous bookkeeping lives behind a `parking_lot` mutex that is never
//! held across an await. Publications are serialized by an async lock.

use crate::allocation::management::{RerouteService, StateProposer};
use crate::allocation::service::AllocationService;
use crate::cluster::{
    ClusterBlock, ClusterState, ClusterStateDiff, ClusterStateHolder, DiscoveryNode,
    VotingConfiguration,
};
use crate::common::{ClusterConfig, Config, Error, Result};
use crate::coordinator::coordination_state::CoordinationState;
use crate::coordinator::join::{builtin_join_validators, validate_join, JoinBackoff, JoinValidator};
use crate::coordinator::messages::{
    ApplyCommitRequest, FollowerCheckRequest, JoinRequest, PeersRequest, PeersResponse,
    PreVoteRequest, PreVoteResponse, PublishRequest, PublishResponse, StartJoinRequest,
    TransportRequest, TransportResponse,
};
use crate::coordinator::persisted::PersistedState;
use crate::coordinator::reconfigurator::reconfigure;
use crate::coordinator::transport::{Transport, TransportHandler};
use crate::discovery::{DefaultHostsResolver, DiscoveryModule, SeedHostsProvider, VoteCollection};
use async_trait::async_trait;
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mode {
    Candidate,
    Leader,
    Follower,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Candidate => write!(f, "candidate"),
            Mode::Leader => write!(f, "leader"),
            Mode::Follower => write!(f, "follower"),
        }
    }
}

struct Inner {
    mode: Mode,
    coordination: CoordinationState,
    leader: Option<DiscoveryNode>,
    last_leader_contact: Instant,
    election_attempts: u64,
    /// Consecutive failed checks per follower
    follower_failures: BTreeMap<String, u32>,
    /// Followers with a removal in flight
    removing: BTreeSet<String>,
    /// Consecutive check rounds without a quorum of acks
    lease_failures: u32,
    join_backoff: JoinBackoff,
    next_join_attempt: Instant,
    /// Peers learned from discovery rounds and incoming peer requests
    discovered: BTreeMap<String, DiscoveryNode>,
}

/// Result of one discovery round
struct Discovered {
    /// Responding nodes plus the local node, by id
    nodes: BTreeMap<String, DiscoveryNode>,
    /// Leader reported by a peer, with the highest term seen
    leader: Option<(u64, DiscoveryNode)>,
}

pub struct Coordinator {
    local_node: DiscoveryNode,
    settings: ClusterConfig,
    single_node: bool,
    initial_voting_nodes: Vec<String>,
    transport: Arc<dyn Transport>,
    seed_hosts: Arc<dyn SeedHostsProvider>,
    hosts_resolver: DefaultHostsResolver,
    join_validators: Vec<Arc<dyn JoinValidator>>,
    holder: Arc<ClusterStateHolder>,
    allocation: Arc<AllocationService>,
    reroute: RwLock<Option<Arc<dyn RerouteService>>>,
    inner: Mutex<Inner>,
    publication_lock: tokio::sync::Mutex<()>,
    shutdown: broadcast::Sender<()>,
    stopped: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    pub fn new(
        local_node: DiscoveryNode,
        config: &Config,
        discovery: &DiscoveryModule,
        transport: Arc<dyn Transport>,
        persisted: Arc<dyn PersistedState>,
        allocation: Arc<AllocationService>,
    ) -> Arc<Self> {
        let single_node = discovery.discovery_type().is_single_node();
        let mut join_validators = builtin_join_validators(single_node, local_node.id());
        join_validators.extend(discovery.join_validators().iter().cloned());

        let holder = Arc::new(ClusterStateHolder::new(
            local_node.id(),
            ClusterState::empty(config.cluster.name.clone()),
        ));
        let coordination = CoordinationState::new(
            local_node.clone(),
            persisted,
            discovery.election_strategy(),
        );
        let now = Instant::now();
        let (shutdown, _) = broadcast::channel(1);

        Arc::new(Self {
            settings: config.cluster.clone(),
            single_node,
            initial_voting_nodes: config.discovery.initial_voting_nodes.clone(),
            transport,
            seed_hosts: discovery.seed_hosts_provider(),
            hosts_resolver: DefaultHostsResolver::default(),
            join_validators,
            holder,
            allocation,
            reroute: RwLock::new(None),
            inner: Mutex::new(Inner {
                mode: Mode::Candidate,
                coordination,
                leader: None,
                last_leader_contact: now,
                election_attempts: 0,
                follower_failures: BTreeMap::new(),
                removing: BTreeSet::new(),
                lease_failures: 0,
                join_backoff: JoinBackoff::new(
                    Duration::from_millis(config.cluster.join_retry_delay_ms),
                    Duration::from_millis(config.cluster.join_retry_max_delay_ms),
                ),
                next_join_attempt: now,
                discovered: BTreeMap::new(),
            }),
            publication_lock: tokio::sync::Mutex::new(()),
            shutdown,
            stopped: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            local_node,
        })
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn state_holder(&self) -> &Arc<ClusterStateHolder> {
        &self.holder
    }

    pub fn mode(&self) -> Mode {
        self.inner.lock().mode
    }

    pub fn is_leader(&self) -> bool {
        self.mode() == Mode::Leader
    }

    pub fn leader(&self) -> Option<DiscoveryNode> {
        self.inner.lock().leader.clone()
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().coordination.current_term()
    }

    /// Where reroutes go after elections and joins. Set once the management
    /// executor exists, since it needs the coordinator to propose through.
    pub fn set_reroute_service(&self, service: Arc<dyn RerouteService>) {
        *self.reroute.write() = Some(service);
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    /// Bootstraps single-node clusters and spawns the background loops
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.single_node {
            let mut inner = self.inner.lock();
            if inner.coordination.last_accepted_config().is_empty() {
                let config = VotingConfiguration::new([self.local_node.id()]);
                bootstrap(&mut inner.coordination, config)?;
            }
        }
        tracing::info!(
            node = %self.local_node,
            single_node = self.single_node,
            "starting coordinator"
        );

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.clone().run_election_scheduler(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(self.clone().run_checkers(self.shutdown.subscribe())));
        Ok(())
    }

    /// Stops the background loops; in-flight requests are answered with
    /// `ShuttingDown` from here on
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }
        {
            let mut inner = self.inner.lock();
            inner.mode = Mode::Candidate;
            inner.leader = None;
        }
        self.holder.set_stale(true);
        tracing::info!(node = %self.local_node, "coordinator stopped");
    }

    /// Explicit step-down, or loss of the leader
    pub fn step_down(&self, reason: &str) {
        let mut inner = self.inner.lock();
        self.become_candidate(&mut inner, reason);
    }

    fn become_candidate(&self, inner: &mut Inner, reason: &str) {
        if inner.mode == Mode::Candidate {
            return;
        }
        tracing::warn!(
            node = %self.local_node,
            mode = %inner.mode,
            term = inner.coordination.current_term(),
            reason,
            "becoming candidate"
        );
        inner.mode = Mode::Candidate;
        inner.leader = None;
        inner.follower_failures.clear();
        inner.lease_failures = 0;
        inner.election_attempts = 0;
        self.holder.set_stale(true);
    }

    fn become_follower(&self, inner: &mut Inner, leader: &DiscoveryNode) {
        let changed = inner.mode != Mode::Follower
            || inner.leader.as_ref().map(|l| l.id()) != Some(leader.id());
        if changed {
            tracing::info!(
                node = %self.local_node,
                leader = %leader,
                term = inner.coordination.current_term(),
                "following leader"
            );
        }
        inner.mode = Mode::Follower;
        inner.leader = Some(leader.clone());
        inner.last_leader_contact = Instant::now();
        inner.election_attempts = 0;
        inner.join_backoff.reset();
        self.holder.set_stale(false);
    }

    fn request_reroute(&self, reason: &str) {
        let service = self.reroute.read().clone();
        match service {
            Some(service) => service.reroute(reason),
            None => tracing::debug!(reason, "no reroute service registered"),
        }
    }

    // === Background loops ===

    async fn run_election_scheduler(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let delay = self.election_delay();
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if self.mode() != Mode::Candidate {
                continue;
            }
            if let Err(e) = self.join_or_elect().await {
                tracing::debug!(node = %self.local_node, error = %e, "election attempt failed");
            }
        }
    }

    /// Random delay below a bound that grows with every failed attempt
    fn election_delay(&self) -> Duration {
        let attempts = self.inner.lock().election_attempts;
        let bound = self
            .settings
            .election_initial_timeout_ms
            .saturating_add(attempts.saturating_mul(self.settings.election_back_off_ms))
            .min(self.settings.election_max_timeout_ms)
            .max(1);
        Duration::from_millis(1 + rand::random::<u64>() % bound)
    }

    async fn run_checkers(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let interval = self.settings.follower_check_interval();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            match self.mode() {
                Mode::Leader => self.check_followers().await,
                Mode::Follower => self.check_leader_timeout(),
                Mode::Candidate => {}
            }
        }
    }

    fn check_leader_timeout(&self) {
        let mut inner = self.inner.lock();
        if inner.mode == Mode::Follower
            && inner.last_leader_contact.elapsed() > self.settings.leader_timeout()
        {
            self.become_candidate(&mut inner, "no contact from leader within leader timeout");
        }
    }

    /// One round of follower checks. Followers failing too many rounds in a
    /// row are removed; without a quorum of acks for too many rounds the
    /// leader steps down.
    async fn check_followers(self: &Arc<Self>) {
        let state = self.holder.current();
        let term = self.current_term();
        let followers: Vec<DiscoveryNode> = state
            .nodes
            .iter()
            .filter(|n| n.id() != self.local_node.id())
            .cloned()
            .collect();
        let request = TransportRequest::FollowerCheck(FollowerCheckRequest {
            source: self.local_node.clone(),
            term,
        });
        let results = self
            .send_all(followers, request, self.settings.follower_check_timeout())
            .await;

        let mut acks = VoteCollection::new();
        acks.add_vote(self.local_node.clone());
        let mut to_remove = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.mode != Mode::Leader || inner.coordination.current_term() != term {
                return;
            }
            for (node, result) in results {
                match result {
                    Ok(_) => {
                        inner.follower_failures.remove(node.id());
                        acks.add_vote(node);
                    }
                    Err(e) => {
                        let failures = inner
                            .follower_failures
                            .entry(node.id().to_string())
                            .or_insert(0);
                        *failures += 1;
                        tracing::debug!(follower = %node, failures = *failures, error = %e, "follower check failed");
                        if *failures >= self.settings.follower_check_retry_count
                            && inner.removing.insert(node.id().to_string())
                        {
                            to_remove.push(node.id().to_string());
                        }
                    }
                }
            }

            if inner.coordination.is_publish_quorum(&acks) {
                inner.lease_failures = 0;
            } else {
                inner.lease_failures += 1;
                tracing::warn!(
                    acks = acks.len(),
                    rounds = inner.lease_failures,
                    "follower checks did not reach a quorum"
                );
                if inner.lease_failures >= self.settings.leader_check_retry_count {
                    self.become_candidate(inner, "leader lease expired");
                    return;
                }
            }
        }

        if !to_remove.is_empty() {
            let coordinator = self.clone();
            tokio::spawn(async move {
                let result = coordinator
                    .remove_nodes(&to_remove, "followers check retry count exceeded")
                    .await;
                let mut inner = coordinator.inner.lock();
                for id in &to_remove {
                    inner.removing.remove(id);
                    if result.is_ok() {
                        inner.follower_failures.remove(id);
                    }
                }
                if let Err(e) = result {
                    tracing::warn!(nodes = ?to_remove, error = %e, "failed to remove nodes");
                }
            });
        }
    }

    // === Discovery and elections ===

    async fn join_or_elect(self: &Arc<Self>) -> Result<()> {
        self.inner.lock().election_attempts += 1;
        let discovered = self.discover_peers().await;

        if let Some((_, leader)) = &discovered.leader {
            if leader.id() != self.local_node.id() {
                return self.join_leader(leader).await;
            }
        }
        if !self.local_node.is_master_eligible() {
            return Ok(());
        }

        self.maybe_bootstrap(&discovered.nodes)?;
        if self.inner.lock().coordination.last_accepted_config().is_empty() {
            tracing::debug!(node = %self.local_node, "waiting for an initial voting configuration");
            return Ok(());
        }

        let max_term = self.pre_vote(&discovered.nodes).await?;
        self.start_election(max_term, &discovered.nodes).await
    }

    async fn discover_peers(&self) -> Discovered {
        let mut addresses: BTreeSet<String> = self
            .seed_hosts
            .seed_addresses(&self.hosts_resolver)
            .into_iter()
            .collect();
        let known_peers: Vec<DiscoveryNode> = {
            let inner = self.inner.lock();
            let mut known: BTreeMap<String, DiscoveryNode> = inner.discovered.clone();
            for node in inner.coordination.last_accepted_state().nodes.iter() {
                known.insert(node.id().to_string(), node.clone());
            }
            known.into_values().collect()
        };
        addresses.extend(known_peers.iter().map(|n| n.address().to_string()));
        addresses.remove(self.local_node.address());

        let request = TransportRequest::Peers(PeersRequest {
            source: self.local_node.clone(),
            known_peers,
        });
        let timeout = self.settings.follower_check_timeout();
        let mut pending: FuturesUnordered<_> = addresses
            .into_iter()
            .map(|address| {
                let transport = self.transport.clone();
                let request = request.clone();
                async move { tokio::time::timeout(timeout, transport.send(&address, request)).await }
            })
            .collect();

        let mut discovered = Discovered {
            nodes: BTreeMap::from([(self.local_node.id().to_string(), self.local_node.clone())]),
            leader: None,
        };
        let mut learned = Vec::new();
        while let Some(result) = pending.next().await {
            let Ok(Ok(TransportResponse::Peers(response))) = result else {
                continue;
            };
            let PeersResponse {
                node,
                leader,
                known_peers,
                current_term,
            } = response;
            if let Some(leader) = leader {
                let newer = discovered
                    .leader
                    .as_ref()
                    .map(|(term, _)| current_term > *term)
                    .unwrap_or(true);
                if newer {
                    discovered.leader = Some((current_term, leader));
                }
            }
            learned.extend(known_peers);
            learned.push(node.clone());
            discovered.nodes.insert(node.id().to_string(), node);
        }

        let mut inner = self.inner.lock();
        for node in learned {
            if node.id() != self.local_node.id() {
                inner.discovered.insert(node.id().to_string(), node);
            }
        }
        discovered
    }

    /// Seeds the first voting configuration from `initial_voting_nodes` once
    /// every listed node has been discovered
    fn maybe_bootstrap(&self, discovered: &BTreeMap<String, DiscoveryNode>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.coordination.last_accepted_config().is_empty() || self.initial_voting_nodes.is_empty() {
            return Ok(());
        }
        let lists_local = self
            .initial_voting_nodes
            .iter()
            .any(|entry| entry == self.local_node.id() || entry == self.local_node.name());
        if !lists_local {
            return Ok(());
        }

        let mut ids = Vec::with_capacity(self.initial_voting_nodes.len());
        for entry in &self.initial_voting_nodes {
            let found = discovered
                .values()
                .find(|n| n.id() == entry || n.name() == entry);
            match found {
                Some(node) => ids.push(node.id().to_string()),
                None => {
                    tracing::debug!(missing = %entry, "initial voting node not discovered yet");
                    return Ok(());
                }
            }
        }
        bootstrap(&mut inner.coordination, VotingConfiguration::new(ids))
    }

    async fn join_leader(&self, leader: &DiscoveryNode) -> Result<()> {
        let term = {
            let inner = self.inner.lock();
            if Instant::now() < inner.next_join_attempt {
                return Ok(());
            }
            inner.coordination.current_term()
        };
        tracing::debug!(node = %self.local_node, leader = %leader, "sending join request");
        let request = TransportRequest::Join(JoinRequest {
            source: self.local_node.clone(),
            term,
        });
        let publish_timeout = self.settings.publish_timeout();
        let result = match tokio::time::timeout(publish_timeout, self.transport.send(leader.address(), request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ConsensusTimeout(self.settings.publish_timeout_ms)),
        };

        let mut inner = self.inner.lock();
        match result {
            Ok(_) => {
                inner.join_backoff.reset();
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::JoinRejected(_)) {
                    let delay = inner.join_backoff.next_delay();
                    inner.next_join_attempt = Instant::now() + delay;
                    tracing::warn!(leader = %leader, error = %e, retry_in = ?delay, "join rejected");
                }
                Err(e)
            }
        }
    }

    /// Asks peers whether they would vote for us; returns the highest term
    /// seen. Keeps a partitioned node from disrupting a healthy leader.
    async fn pre_vote(&self, discovered: &BTreeMap<String, DiscoveryNode>) -> Result<u64> {
        let request = {
            let inner = self.inner.lock();
            PreVoteRequest {
                source: self.local_node.clone(),
                current_term: inner.coordination.current_term(),
                last_accepted_term: inner.coordination.last_accepted_term(),
                last_accepted_version: inner.coordination.last_accepted_version(),
            }
        };
        let mut max_term = request.current_term;
        let peers: Vec<DiscoveryNode> = discovered
            .values()
            .filter(|n| n.id() != self.local_node.id() && n.is_master_eligible())
            .cloned()
            .collect();
        let results = self
            .send_all(peers, TransportRequest::PreVote(request), self.settings.follower_check_timeout())
            .await;

        let mut votes = VoteCollection::new();
        votes.add_vote(self.local_node.clone());
        for (node, result) in results {
            if let Ok(TransportResponse::PreVote(PreVoteResponse { granted, current_term })) = result {
                max_term = max_term.max(current_term);
                if granted {
                    votes.add_vote(node);
                }
            }
        }

        if !self.inner.lock().coordination.is_election_quorum(&votes) {
            return Err(Error::CoordinationStateRejected(format!(
                "pre-vote reached {} of the voting configuration",
                votes.len()
            )));
        }
        Ok(max_term)
    }

    async fn start_election(
        self: &Arc<Self>,
        max_term: u64,
        discovered: &BTreeMap<String, DiscoveryNode>,
    ) -> Result<()> {
        let request = {
            let mut inner = self.inner.lock();
            if inner.mode != Mode::Candidate {
                return Ok(());
            }
            let term = inner.coordination.current_term().max(max_term) + 1;
            let request = StartJoinRequest {
                source: self.local_node.clone(),
                term,
            };
            let own = inner.coordination.handle_start_join(&request)?;
            inner.coordination.start_join_sent();
            inner.coordination.handle_join(&own)?;
            request
        };
        tracing::info!(node = %self.local_node, term = request.term, "starting election");

        let won = self.inner.lock().coordination.election_won();
        if !won {
            let peers: Vec<DiscoveryNode> = discovered
                .values()
                .filter(|n| n.id() != self.local_node.id() && n.is_master_eligible())
                .cloned()
                .collect();
            let timeout = self.settings.follower_check_timeout();
            let mut pending: FuturesUnordered<_> = peers
                .into_iter()
                .map(|node| {
                    let transport = self.transport.clone();
                    let request = TransportRequest::StartJoin(request.clone());
                    async move { tokio::time::timeout(timeout, transport.send(node.address(), request)).await }
                })
                .collect();
            while let Some(result) = pending.next().await {
                let Ok(Ok(TransportResponse::Join(join))) = result else {
                    continue;
                };
                let mut inner = self.inner.lock();
                let accepted = inner.coordination.last_accepted_state();
                if accepted.nodes.get(join.source.id()) != Some(&join.source) {
                    if let Err(e) = validate_join(&self.join_validators, &join.source, &accepted) {
                        tracing::debug!(voter = %join.source, error = %e, "ignoring vote from rejected joiner");
                        continue;
                    }
                }
                if let Err(e) = inner.coordination.handle_join(&join) {
                    tracing::debug!(voter = %join.source, error = %e, "ignoring join");
                }
                if inner.coordination.election_won() {
                    break;
                }
            }
        }

        let state = {
            let mut inner = self.inner.lock();
            if inner.mode != Mode::Candidate
                || !inner.coordination.election_won()
                || inner.coordination.current_term() != request.term
            {
                return Err(Error::CoordinationStateRejected(format!(
                    "election for term {} not won",
                    request.term
                )));
            }
            inner.mode = Mode::Leader;
            inner.leader = Some(self.local_node.clone());
            inner.election_attempts = 0;
            inner.follower_failures.clear();
            inner.lease_failures = 0;
            self.first_leader_state(&inner)
        };
        tracing::info!(node = %self.local_node, term = request.term, "elected as leader");
        self.holder.set_stale(false);

        let _guard = self.publication_lock.lock().await;
        match self.publish(state).await {
            Ok(state) => {
                tracing::info!(node = %self.local_node, state = %state, "published first state as leader");
                self.request_reroute("elected-as-leader");
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                self.become_candidate(&mut inner, "failed to publish first state as leader");
                Err(e)
            }
        }
    }

    /// The accepted state plus every voter that passes the join validators,
    /// led by this node
    fn first_leader_state(&self, inner: &Inner) -> ClusterState {
        let accepted = inner.coordination.last_accepted_state();
        let applied = self.holder.current();
        let version = accepted
            .version
            .max(applied.version)
            .max(inner.coordination.last_published_version())
            + 1;
        let mut state = accepted.next(inner.coordination.current_term(), version);
        for voter in inner.coordination.join_votes().nodes() {
            if voter.id() == self.local_node.id() || state.nodes.get(voter.id()) == Some(voter) {
                continue;
            }
            match validate_join(&self.join_validators, voter, &state) {
                Ok(()) => state.nodes.add(voter.clone()),
                Err(e) => {
                    tracing::warn!(voter = %voter, error = %e, "voter not admitted to the cluster");
                }
            }
        }
        state.nodes.add(self.local_node.clone());
        state.nodes.set_leader(Some(self.local_node.id().to_string()));
        state.blocks.remove_global_block(ClusterBlock::no_leader().id);
        maybe_reconfigure(&mut state, self.local_node.id());
        state
    }

    // === Publication ===

    /// Publishes `diff` and resolves once it is committed. Leader only.
    pub async fn propose_state_change(&self, diff: ClusterStateDiff) -> Result<Arc<ClusterState>> {
        let _guard = self.publication_lock.lock().await;
        let base = self.holder.current();
        let state = self.build_state(&base, &diff)?;
        self.publish(state).await
    }

    /// Builds the diff against the latest applied state under the
    /// publication lock, so it cannot go stale. `None` means nothing to do.
    async fn update_state(
        &self,
        source: &str,
        build: impl FnOnce(&ClusterState) -> Result<Option<ClusterStateDiff>>,
    ) -> Result<Arc<ClusterState>> {
        let _guard = self.publication_lock.lock().await;
        let base = self.holder.current();
        let Some(diff) = build(&base)? else {
            return Ok(base);
        };
        tracing::debug!(source, "updating cluster state");
        let state = self.build_state(&base, &diff)?;
        self.publish(state).await
    }

    fn build_state(&self, base: &ClusterState, diff: &ClusterStateDiff) -> Result<ClusterState> {
        let inner = self.inner.lock();
        if inner.mode != Mode::Leader {
            let leader = inner
                .leader
                .as_ref()
                .map(|l| l.id().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(leader));
        }
        let accepted = inner.coordination.last_accepted_state();
        let version = base
            .version
            .max(accepted.version)
            .max(inner.coordination.last_published_version())
            + 1;
        let mut state = diff.apply(base, inner.coordination.current_term(), version)?;
        if !diff.nodes_added.is_empty() || !diff.nodes_removed.is_empty() {
            maybe_reconfigure(&mut state, self.local_node.id());
        }
        state.validate()?;
        Ok(state)
    }

    /// Two-phase publication of `state`; the caller holds the publication lock
    async fn publish(&self, state: ClusterState) -> Result<Arc<ClusterState>> {
        let (term, version) = (state.term, state.version);
        let targets: Vec<DiscoveryNode> = state.nodes.iter().cloned().collect();
        let request = self.inner.lock().coordination.handle_client_value(state)?;

        let publish_timeout = self.settings.publish_timeout();
        let commit = match tokio::time::timeout(publish_timeout, self.collect_publish_quorum(&targets, request)).await
        {
            Ok(commit) => commit?,
            Err(_) => {
                tracing::warn!(term, version, "publication timed out, abandoning it");
                return Err(Error::ConsensusTimeout(self.settings.publish_timeout_ms));
            }
        };

        let committed = self.apply_commit(&commit)?;
        let others: Vec<DiscoveryNode> = targets
            .into_iter()
            .filter(|n| n.id() != self.local_node.id())
            .collect();
        for (node, result) in self
            .send_all(others, TransportRequest::Commit(commit), self.settings.follower_check_timeout())
            .await
        {
            if let Err(e) = result {
                tracing::debug!(node = %node, error = %e, "failed to deliver commit");
            }
        }
        tracing::debug!(term, version, "committed cluster state");
        Ok(committed)
    }

    async fn collect_publish_quorum(
        &self,
        targets: &[DiscoveryNode],
        request: PublishRequest,
    ) -> Result<ApplyCommitRequest> {
        let (term, version) = (request.term(), request.version());
        let mut pending: FuturesUnordered<_> = targets
            .iter()
            .cloned()
            .map(|node| {
                let transport = self.transport.clone();
                let request = TransportRequest::Publish(request.clone());
                async move {
                    let result = transport.send(node.address(), request).await;
                    (node, result)
                }
            })
            .collect();

        while let Some((node, result)) = pending.next().await {
            match result {
                Ok(TransportResponse::Publish(response)) => {
                    let outcome = self
                        .inner
                        .lock()
                        .coordination
                        .handle_publish_response(&node, &response);
                    match outcome {
                        Ok(Some(commit)) => return Ok(commit),
                        Ok(None) => {}
                        Err(e) => tracing::debug!(node = %node, error = %e, "ignoring publish response"),
                    }
                }
                Ok(other) => tracing::debug!(node = %node, response = ?other, "unexpected publish response"),
                Err(e) => tracing::debug!(node = %node, error = %e, "publish request failed"),
            }
        }
        Err(Error::PublicationFailed(format!(
            "no publish quorum for term {} version {}",
            term, version
        )))
    }

    fn apply_commit(&self, commit: &ApplyCommitRequest) -> Result<Arc<ClusterState>> {
        let committed = {
            let mut inner = self.inner.lock();
            let committed = inner.coordination.handle_commit(commit)?;
            if commit.source.id() != self.local_node.id() {
                inner.last_leader_contact = Instant::now();
            }
            committed
        };
        if committed.supersedes(&self.holder.current()) {
            self.holder.apply(committed.clone())?;
        }
        Ok(committed)
    }

    // === Membership ===

    /// Removes nodes, fails their shards, promotes replicas and reroutes
    pub async fn remove_nodes(&self, node_ids: &[String], reason: &str) -> Result<Arc<ClusterState>> {
        let allocation = self.allocation.clone();
        let state = self
            .update_state(reason, |state| {
                let present: Vec<&String> = node_ids.iter().filter(|id| state.nodes.contains(id)).collect();
                if present.is_empty() {
                    return Ok(None);
                }
                let diff = present
                    .into_iter()
                    .fold(ClusterStateDiff::new(state), |diff, id| diff.remove_node(id.clone()));
                let without = diff.apply(state, state.term, state.version)?;
                let routing_table = allocation.disassociate_dead_nodes(&without, true, reason)?;
                Ok(Some(diff.with_routing_table(routing_table)))
            })
            .await?;
        tracing::info!(nodes = ?node_ids, reason, "removed nodes");
        Ok(state)
    }

    async fn handle_join_request(&self, request: JoinRequest) -> Result<TransportResponse> {
        if !self.is_leader() {
            let leader = self
                .leader()
                .map(|l| l.id().to_string())
                .unwrap_or_else(|| "unknown".to_string());
            return Err(Error::NotLeader(leader));
        }
        let joining = request.source;
        let validators = &self.join_validators;
        let mut added = false;
        self.update_state("node-join", |state| {
            if state.nodes.get(joining.id()) == Some(&joining) {
                return Ok(None);
            }
            validate_join(validators, &joining, state)?;
            let mut diff = ClusterStateDiff::new(state);
            if state.nodes.contains(joining.id()) {
                diff = diff.remove_node(joining.id());
            }
            added = true;
            Ok(Some(diff.add_node(joining.clone())))
        })
        .await?;

        if added {
            tracing::info!(node = %joining, "node joined");
            self.request_reroute("node-join");
        }
        Ok(TransportResponse::Ack)
    }

    // === Request handlers ===

    fn handle_peers(&self, request: PeersRequest) -> PeersResponse {
        let applied = self.holder.current();
        let mut inner = self.inner.lock();
        if request.source.id() != self.local_node.id() {
            inner
                .discovered
                .insert(request.source.id().to_string(), request.source.clone());
        }
        let leader = match inner.mode {
            Mode::Leader => Some(self.local_node.clone()),
            Mode::Follower => inner.leader.clone(),
            Mode::Candidate => None,
        };
        let mut known: BTreeMap<String, DiscoveryNode> = inner.discovered.clone();
        for node in applied.nodes.iter() {
            known.insert(node.id().to_string(), node.clone());
        }
        PeersResponse {
            node: self.local_node.clone(),
            leader,
            known_peers: known.into_values().collect(),
            current_term: inner.coordination.current_term(),
        }
    }

    fn handle_pre_vote(&self, request: &PreVoteRequest) -> PreVoteResponse {
        let inner = self.inner.lock();
        let has_leader = match inner.mode {
            Mode::Leader => true,
            Mode::Follower => inner.last_leader_contact.elapsed() < self.settings.leader_timeout(),
            Mode::Candidate => false,
        };
        let ours = (
            inner.coordination.last_accepted_term(),
            inner.coordination.last_accepted_version(),
        );
        let theirs = (request.last_accepted_term, request.last_accepted_version);
        PreVoteResponse {
            granted: !has_leader && theirs >= ours,
            current_term: inner.coordination.current_term(),
        }
    }

    fn handle_start_join(&self, request: &StartJoinRequest) -> Result<crate::coordinator::messages::Join> {
        let mut inner = self.inner.lock();
        let join = inner.coordination.handle_start_join(request)?;
        self.become_candidate(&mut inner, "joined the term of another candidate");
        Ok(join)
    }

    fn handle_publish(&self, request: &PublishRequest) -> Result<PublishResponse> {
        let mut inner = self.inner.lock();
        let from_leader = request.source.id() != self.local_node.id();
        if from_leader && request.term() > inner.coordination.current_term() {
            inner.coordination.handle_start_join(&StartJoinRequest {
                source: request.source.clone(),
                term: request.term(),
            })?;
        }
        let response = inner.coordination.handle_publish_request(request)?;
        if from_leader {
            self.become_follower(&mut inner, &request.source);
        }
        Ok(response)
    }

    fn handle_follower_check(&self, request: &FollowerCheckRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        let term = inner.coordination.current_term();
        if request.term < term {
            return Err(Error::CoordinationStateRejected(format!(
                "follower check from term {} but current term is {}",
                request.term, term
            )));
        }
        if request.term > term {
            inner.coordination.handle_start_join(&StartJoinRequest {
                source: request.source.clone(),
                term: request.term,
            })?;
        } else if inner.mode == Mode::Leader {
            return Err(Error::CoordinationStateRejected(format!(
                "leader of term {} received a follower check from {}",
                term, request.source
            )));
        }
        self.become_follower(&mut inner, &request.source);
        Ok(())
    }

    /// Sends `request` to every node, each bounded by `timeout`
    async fn send_all(
        &self,
        targets: Vec<DiscoveryNode>,
        request: TransportRequest,
        timeout: Duration,
    ) -> Vec<(DiscoveryNode, Result<TransportResponse>)> {
        let pending: FuturesUnordered<_> = targets
            .into_iter()
            .map(|node| {
                let transport = self.transport.clone();
                let request = request.clone();
                async move {
                    let result = match tokio::time::timeout(timeout, transport.send(node.address(), request)).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::ConnectionFailed(format!(
                            "{} did not answer within {:?}",
                            node, timeout
                        ))),
                    };
                    (node, result)
                }
            })
            .collect();
        pending.collect().await
    }
}

fn bootstrap(coordination: &mut CoordinationState, config: VotingConfiguration) -> Result<()> {
    let mut state = (*coordination.last_accepted_state()).clone();
    state.metadata.coordination.last_committed_config = config.clone();
    state.metadata.coordination.last_accepted_config = config;
    coordination.set_initial_state(state)
}

/// Reconfigures unless a previous reconfiguration is still uncommitted
fn maybe_reconfigure(state: &mut ClusterState, leader_id: &str) {
    let coordination = &state.metadata.coordination;
    if coordination.last_committed_config != coordination.last_accepted_config {
        return;
    }
    let next = reconfigure(
        &state.nodes,
        &coordination.voting_exclusions,
        leader_id,
        &coordination.last_accepted_config,
    );
    state.metadata.coordination.last_accepted_config = next;
}

#[async_trait]
impl TransportHandler for Coordinator {
    async fn handle(&self, request: TransportRequest) -> Result<TransportResponse> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::ShuttingDown(self.local_node.to_string()));
        }
        match request {
            TransportRequest::Peers(request) => Ok(TransportResponse::Peers(self.handle_peers(request))),
            TransportRequest::PreVote(request) => Ok(TransportResponse::PreVote(self.handle_pre_vote(&request))),
            TransportRequest::StartJoin(request) => self.handle_start_join(&request).map(TransportResponse::Join),
            TransportRequest::Join(request) => self.handle_join_request(request).await,
            TransportRequest::Publish(request) => self.handle_publish(&request).map(TransportResponse::Publish),
            TransportRequest::Commit(request) => self.apply_commit(&request).map(|_| TransportResponse::Ack),
            TransportRequest::FollowerCheck(request) => {
                self.handle_follower_check(&request).map(|_| TransportResponse::Ack)
            }
        }
    }
}

#[async_trait]
impl StateProposer for Coordinator {
    fn applied_state(&self) -> Arc<ClusterState> {
        self.holder.current()
    }

    fn is_leader(&self) -> bool {
        Coordinator::is_leader(self)
    }

    async fn propose(&self, diff: ClusterStateDiff) -> Result<Arc<ClusterState>> {
        self.propose_state_change(diff).await
    }
}
