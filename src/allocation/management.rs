//! Management executor
//!
//! All allocation rounds of a node run on one tokio task fed by an mpsc
//! channel. Tasks queued while a proposal is in flight are batched into the
//! next round. The task never awaits the network itself: each proposal runs
//! on its own spawned task and reports back with a `ProposalDone` event. A
//! round rejected as stale is re-queued against the newer state, up to a
//! bounded number of attempts.

use crate::allocation::service::{AllocationService, FailedShard};
use crate::cluster::{ClusterState, ClusterStateDiff, ShardRouting};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Where allocation results go: the coordinator, or a stand-in in tests
#[async_trait]
pub trait StateProposer: Send + Sync {
    fn applied_state(&self) -> Arc<ClusterState>;

    fn is_leader(&self) -> bool;

    /// Publishes and commits `diff`; resolves with the committed state
    async fn propose(&self, diff: ClusterStateDiff) -> Result<Arc<ClusterState>>;
}

/// Fire-and-forget reroute requests
pub trait RerouteService: Send + Sync {
    fn reroute(&self, reason: &str);
}

pub type Completion = oneshot::Sender<Result<()>>;

pub enum AllocationTask {
    Reroute {
        reason: String,
        done: Option<Completion>,
    },
    ShardsStarted {
        shards: Vec<ShardRouting>,
        done: Option<Completion>,
    },
    ShardsFailed {
        shards: Vec<FailedShard>,
        done: Option<Completion>,
    },
}

impl AllocationTask {
    fn source(&self) -> String {
        match self {
            AllocationTask::Reroute { reason, .. } => reason.clone(),
            AllocationTask::ShardsStarted { shards, .. } => format!("{} shard(s) started", shards.len()),
            AllocationTask::ShardsFailed { shards, .. } => format!("{} shard(s) failed", shards.len()),
        }
    }

    fn complete(self, result: Result<()>) {
        let done = match self {
            AllocationTask::Reroute { done, .. }
            | AllocationTask::ShardsStarted { done, .. }
            | AllocationTask::ShardsFailed { done, .. } => done,
        };
        if let Some(done) = done {
            let _ = done.send(result);
        }
    }
}

struct Pending {
    task: AllocationTask,
    attempt: u32,
}

enum Event {
    Submit(Pending),
    ProposalDone {
        batch: Vec<Pending>,
        result: Result<Arc<ClusterState>>,
    },
}

/// Handle to the executor task; cheap to clone
#[derive(Clone)]
pub struct ManagementExecutor {
    tx: mpsc::UnboundedSender<Event>,
}

impl ManagementExecutor {
    /// Spawns the executor task. It stops when `shutdown` fires.
    pub fn start(
        proposer: Arc<dyn StateProposer>,
        service: Arc<AllocationService>,
        max_attempts: u32,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            proposer,
            service,
            max_attempts: max_attempts.max(1),
            tx: tx.clone(),
            queue: VecDeque::new(),
            in_flight: false,
        };
        let handle = tokio::spawn(worker.run(rx, shutdown));
        (Self { tx }, handle)
    }

    pub fn submit(&self, task: AllocationTask) {
        if let Err(mpsc::error::SendError(Event::Submit(pending))) =
            self.tx.send(Event::Submit(Pending { task, attempt: 1 }))
        {
            pending
                .task
                .complete(Err(Error::ShuttingDown("management executor".into())));
        }
    }

    async fn submit_and_wait(&self, make: impl FnOnce(Completion) -> AllocationTask) -> Result<()> {
        let (done, rx) = oneshot::channel();
        self.submit(make(done));
        rx.await
            .map_err(|_| Error::ShuttingDown("management executor".into()))?
    }

    pub async fn reroute_and_wait(&self, reason: &str) -> Result<()> {
        self.submit_and_wait(|done| AllocationTask::Reroute {
            reason: reason.to_string(),
            done: Some(done),
        })
        .await
    }

    pub async fn shards_started(&self, shards: Vec<ShardRouting>) -> Result<()> {
        self.submit_and_wait(|done| AllocationTask::ShardsStarted {
            shards,
            done: Some(done),
        })
        .await
    }

    pub async fn shards_failed(&self, shards: Vec<FailedShard>) -> Result<()> {
        self.submit_and_wait(|done| AllocationTask::ShardsFailed {
            shards,
            done: Some(done),
        })
        .await
    }
}

impl RerouteService for ManagementExecutor {
    fn reroute(&self, reason: &str) {
        self.submit(AllocationTask::Reroute {
            reason: reason.to_string(),
            done: None,
        });
    }
}

struct Worker {
    proposer: Arc<dyn StateProposer>,
    service: Arc<AllocationService>,
    max_attempts: u32,
    tx: mpsc::UnboundedSender<Event>,
    queue: VecDeque<Pending>,
    in_flight: bool,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>, mut shutdown: broadcast::Receiver<()>) {
        tracing::debug!("management executor started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = rx.recv() => match event {
                    Some(Event::Submit(pending)) => self.queue.push_back(pending),
                    Some(Event::ProposalDone { batch, result }) => {
                        self.in_flight = false;
                        self.on_proposal_done(batch, result);
                    }
                    None => break,
                },
            }
            // pick up everything already queued before starting a round
            while let Ok(event) = rx.try_recv() {
                match event {
                    Event::Submit(pending) => self.queue.push_back(pending),
                    Event::ProposalDone { batch, result } => {
                        self.in_flight = false;
                        self.on_proposal_done(batch, result);
                    }
                }
            }
            if !self.in_flight && !self.queue.is_empty() {
                self.run_round();
            }
        }

        for pending in self.queue.drain(..) {
            pending
                .task
                .complete(Err(Error::ShuttingDown("management executor".into())));
        }
        tracing::debug!("management executor stopped");
    }

    fn run_round(&mut self) {
        let batch: Vec<Pending> = self.queue.drain(..).collect();

        if !self.proposer.is_leader() {
            tracing::debug!(tasks = batch.len(), "not the leader, dropping allocation tasks");
            let leader = self
                .proposer
                .applied_state()
                .nodes
                .leader_node_id()
                .unwrap_or("unknown")
                .to_string();
            for pending in batch {
                pending.task.complete(Err(Error::NotLeader(leader.clone())));
            }
            return;
        }

        let state = self.proposer.applied_state();
        let mut started = Vec::new();
        let mut failed = Vec::new();
        let mut sources = Vec::new();
        for pending in &batch {
            sources.push(pending.task.source());
            match &pending.task {
                AllocationTask::ShardsStarted { shards, .. } => started.extend(shards.iter().cloned()),
                AllocationTask::ShardsFailed { shards, .. } => failed.extend(shards.iter().cloned()),
                AllocationTask::Reroute { .. } => {}
            }
        }
        let reason = sources.join(", ");

        let routing_table = match self.service.execute_round(&state, &started, &failed, &reason) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, reason = %reason, "allocation round failed");
                for pending in batch {
                    pending.task.complete(Err(e.clone()));
                }
                return;
            }
        };
        if routing_table == state.routing_table {
            tracing::trace!(reason = %reason, "allocation round changed nothing");
            for pending in batch {
                pending.task.complete(Ok(()));
            }
            return;
        }

        let diff = ClusterStateDiff::new(&state).with_routing_table(routing_table);
        let proposer = self.proposer.clone();
        let tx = self.tx.clone();
        self.in_flight = true;
        tracing::debug!(reason = %reason, term = state.term, version = state.version, "proposing routing table");
        tokio::spawn(async move {
            let result = proposer.propose(diff).await;
            let _ = tx.send(Event::ProposalDone { batch, result });
        });
    }

    fn on_proposal_done(&mut self, batch: Vec<Pending>, result: Result<Arc<ClusterState>>) {
        match result {
            Ok(state) => {
                tracing::debug!(term = state.term, version = state.version, "routing table committed");
                for pending in batch {
                    pending.task.complete(Ok(()));
                }
            }
            Err(e @ Error::StaleState { .. }) => {
                for mut pending in batch.into_iter().rev() {
                    if pending.attempt >= self.max_attempts {
                        tracing::warn!(error = %e, attempts = pending.attempt, "giving up on allocation task");
                        pending.task.complete(Err(e.clone()));
                    } else {
                        pending.attempt += 1;
                        self.queue.push_front(pending);
                    }
                }
                tracing::debug!(error = %e, "state moved on, retrying allocation round");
            }
            Err(e) => {
                tracing::warn!(error = %e, "routing table proposal failed");
                for pending in batch {
                    pending.task.complete(Err(e.clone()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocation::cluster_info::{InMemoryClusterInfoService, InMemorySnapshotsInfoService};
    use crate::allocation::deciders::test_support::*;
    use crate::cluster::{IndexMetadata, ShardRoutingState};
    use crate::common::AllocationConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct FakeProposer {
        state: Mutex<Arc<ClusterState>>,
        leader: AtomicBool,
        stale_replies: AtomicU32,
        proposals: AtomicU32,
    }

    impl FakeProposer {
        fn new(state: ClusterState) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(Arc::new(state)),
                leader: AtomicBool::new(true),
                stale_replies: AtomicU32::new(0),
                proposals: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl StateProposer for FakeProposer {
        fn applied_state(&self) -> Arc<ClusterState> {
            self.state.lock().clone()
        }

        fn is_leader(&self) -> bool {
            self.leader.load(Ordering::SeqCst)
        }

        async fn propose(&self, diff: ClusterStateDiff) -> Result<Arc<ClusterState>> {
            self.proposals.fetch_add(1, Ordering::SeqCst);
            let mut current = self.state.lock();
            if self.stale_replies.load(Ordering::SeqCst) > 0 {
                self.stale_replies.fetch_sub(1, Ordering::SeqCst);
                // someone else committed in between
                let bumped = Arc::new(current.next(current.term, current.version + 1));
                *current = bumped;
            }
            let next = Arc::new(diff.apply(&current, current.term, current.version + 1)?);
            *current = next.clone();
            Ok(next)
        }
    }

    fn service() -> Arc<AllocationService> {
        Arc::new(AllocationService::new(
            AllocationConfig::default(),
            Arc::new(InMemoryClusterInfoService::new()),
            Arc::new(InMemorySnapshotsInfoService::new()),
        ))
    }

    #[tokio::test]
    async fn test_reroute_commits_routing_table() {
        let proposer = FakeProposer::new(state_with(
            vec![data_node("n1")],
            vec![IndexMetadata::new("logs", 2, 0)],
        ));
        let (_tx, shutdown) = broadcast::channel(1);
        let (executor, _handle) = ManagementExecutor::start(proposer.clone(), service(), 3, shutdown);

        executor.reroute_and_wait("test").await.unwrap();
        let state = proposer.applied_state();
        assert_eq!(state.routing_table.shards_with_state(ShardRoutingState::Initializing).len(), 2);

        // nothing left to do: no second proposal
        executor.reroute_and_wait("again").await.unwrap();
        assert_eq!(proposer.proposals.load(Ordering::SeqCst), 1);

        let initializing: Vec<ShardRouting> = proposer
            .applied_state()
            .routing_table
            .shards_with_state(ShardRoutingState::Initializing)
            .into_iter()
            .cloned()
            .collect();
        executor.shards_started(initializing).await.unwrap();
        assert_eq!(
            proposer.applied_state().routing_table.shards_with_state(ShardRoutingState::Started).len(),
            2
        );
    }

    #[tokio::test]
    async fn test_stale_round_is_retried() {
        let proposer = FakeProposer::new(state_with(
            vec![data_node("n1")],
            vec![IndexMetadata::new("logs", 1, 0)],
        ));
        proposer.stale_replies.store(1, Ordering::SeqCst);
        let (_tx, shutdown) = broadcast::channel(1);
        let (executor, _handle) = ManagementExecutor::start(proposer.clone(), service(), 3, shutdown);

        executor.reroute_and_wait("test").await.unwrap();
        assert_eq!(proposer.proposals.load(Ordering::SeqCst), 2);
        assert_eq!(
            proposer.applied_state().routing_table.shards_with_state(ShardRoutingState::Initializing).len(),
            1
        );
    }

    #[tokio::test]
    async fn test_follower_rejects_tasks_and_shutdown_stops() {
        let proposer = FakeProposer::new(state_with(vec![data_node("n1")], vec![]));
        proposer.leader.store(false, Ordering::SeqCst);
        let (tx, shutdown) = broadcast::channel(1);
        let (executor, handle) = ManagementExecutor::start(proposer.clone(), service(), 3, shutdown);

        let err = executor.reroute_and_wait("test").await.unwrap_err();
        assert!(matches!(err, Error::NotLeader(_)));

        tx.send(()).unwrap();
        handle.await.unwrap();
        let err = executor.reroute_and_wait("late").await.unwrap_err();
        assert!(matches!(err, Error::ShuttingDown(_)));
    }
}
