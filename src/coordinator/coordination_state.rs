//! The safety core of the coordination protocol
//!
//! Pure bookkeeping over a [`PersistedState`]: which term this node is in,
//! which joins it has collected, what it has published and accepted. No I/O
//! and no timers; every rule violation is `CoordinationStateRejected`.

use crate::cluster::{ClusterState, DiscoveryNode, VotingConfiguration};
use crate::common::{Error, Result};
use crate::coordinator::messages::{
    ApplyCommitRequest, Join, PublishRequest, PublishResponse, StartJoinRequest,
};
use crate::coordinator::persisted::PersistedState;
use crate::discovery::{ElectionStrategy, VoteCollection};
use std::sync::Arc;

fn rejected(message: String) -> Error {
    tracing::debug!(reason = %message, "coordination state rejected message");
    Error::CoordinationStateRejected(message)
}

pub struct CoordinationState {
    local_node: DiscoveryNode,
    persisted: Arc<dyn PersistedState>,
    election_strategy: Arc<dyn ElectionStrategy>,

    join_votes: VoteCollection,
    start_join_sent: bool,
    election_won: bool,
    last_published_version: u64,
    last_published_config: VotingConfiguration,
    publish_votes: VoteCollection,
}

impl CoordinationState {
    pub fn new(
        local_node: DiscoveryNode,
        persisted: Arc<dyn PersistedState>,
        election_strategy: Arc<dyn ElectionStrategy>,
    ) -> Self {
        let last_published_config = persisted.last_accepted_state().last_accepted_config().clone();
        Self {
            local_node,
            persisted,
            election_strategy,
            join_votes: VoteCollection::new(),
            start_join_sent: false,
            election_won: false,
            last_published_version: 0,
            last_published_config,
            publish_votes: VoteCollection::new(),
        }
    }

    pub fn local_node(&self) -> &DiscoveryNode {
        &self.local_node
    }

    pub fn current_term(&self) -> u64 {
        self.persisted.current_term()
    }

    pub fn last_accepted_state(&self) -> Arc<ClusterState> {
        self.persisted.last_accepted_state()
    }

    pub fn last_accepted_term(&self) -> u64 {
        self.last_accepted_state().term
    }

    pub fn last_accepted_version(&self) -> u64 {
        self.last_accepted_state().version
    }

    pub fn last_committed_config(&self) -> VotingConfiguration {
        self.last_accepted_state().last_committed_config().clone()
    }

    pub fn last_accepted_config(&self) -> VotingConfiguration {
        self.last_accepted_state().last_accepted_config().clone()
    }

    pub fn last_published_version(&self) -> u64 {
        self.last_published_version
    }

    pub fn election_won(&self) -> bool {
        self.election_won
    }

    pub fn join_votes(&self) -> &VoteCollection {
        &self.join_votes
    }

    pub fn contains_join_vote_for(&self, node_id: &str) -> bool {
        self.join_votes.contains(node_id)
    }

    /// Installs the first voting configuration. Only possible while none is set.
    pub fn set_initial_state(&mut self, state: ClusterState) -> Result<()> {
        let current = self.last_accepted_state();
        if !current.last_accepted_config().is_empty() {
            return Err(rejected("initial state already set".to_string()));
        }
        if state.last_accepted_config().is_empty() || state.last_committed_config().is_empty() {
            return Err(rejected("initial state must carry a voting configuration".to_string()));
        }
        tracing::info!(config = %state.last_accepted_config(), "setting initial voting configuration");
        self.last_published_config = state.last_accepted_config().clone();
        self.persisted.set_last_accepted_state(Arc::new(state))
    }

    /// Moves to the candidate's term and returns this node's vote. A term can
    /// only be joined once, so at most one candidate gets this node's vote per term.
    pub fn handle_start_join(&mut self, start_join: &StartJoinRequest) -> Result<Join> {
        let current_term = self.current_term();
        if start_join.term <= current_term {
            return Err(rejected(format!(
                "incoming term {} not greater than current term {}",
                start_join.term, current_term
            )));
        }
        tracing::debug!(
            term = start_join.term,
            candidate = %start_join.source,
            "joining term"
        );
        self.persisted.set_current_term(start_join.term)?;
        self.join_votes = VoteCollection::new();
        self.election_won = false;
        self.start_join_sent = false;
        self.publish_votes = VoteCollection::new();
        self.last_published_version = 0;
        self.last_published_config = self.last_accepted_config();

        let accepted = self.last_accepted_state();
        Ok(Join {
            source: self.local_node.clone(),
            target: start_join.source.clone(),
            term: start_join.term,
            last_accepted_term: accepted.term,
            last_accepted_version: accepted.version,
        })
    }

    /// Marks that this node asked for joins in its current term
    pub fn start_join_sent(&mut self) {
        self.start_join_sent = true;
    }

    /// Tallies a vote; returns whether it was new. Joins from nodes whose
    /// accepted state is ahead of ours are refused.
    pub fn handle_join(&mut self, join: &Join) -> Result<bool> {
        if join.target.id() != self.local_node.id() {
            return Err(rejected(format!(
                "join targets {} instead of local node {}",
                join.target, self.local_node
            )));
        }
        let current_term = self.current_term();
        if join.term != current_term {
            return Err(rejected(format!(
                "incoming term {} does not match current term {}",
                join.term, current_term
            )));
        }
        if !self.start_join_sent {
            return Err(rejected("ignored join as term has not been increased yet".to_string()));
        }
        let accepted = self.last_accepted_state();
        if join.last_accepted_term > accepted.term {
            return Err(rejected(format!(
                "incoming last accepted term {} greater than current last accepted term {}",
                join.last_accepted_term, accepted.term
            )));
        }
        if join.last_accepted_term == accepted.term && join.last_accepted_version > accepted.version {
            return Err(rejected(format!(
                "incoming last accepted version {} greater than current last accepted version {} in term {}",
                join.last_accepted_version, accepted.version, accepted.term
            )));
        }
        if accepted.last_accepted_config().is_empty() {
            return Err(rejected("cannot win election without a voting configuration".to_string()));
        }

        let added = self.join_votes.add_vote(join.source.clone());
        let won = self.election_strategy.is_election_quorum(
            &self.local_node,
            current_term,
            accepted.term,
            accepted.version,
            accepted.last_committed_config(),
            accepted.last_accepted_config(),
            &self.join_votes,
        );
        if won && !self.election_won {
            tracing::info!(term = current_term, votes = self.join_votes.len(), "election won");
            self.last_published_version = accepted.version;
        }
        self.election_won = won;
        Ok(added)
    }

    /// Leader side: turns a new state into a publish request. A change of
    /// voting configuration is only allowed once the previous one committed.
    pub fn handle_client_value(&mut self, state: ClusterState) -> Result<PublishRequest> {
        if !self.election_won {
            return Err(rejected("election not won".to_string()));
        }
        let current_term = self.current_term();
        if state.term != current_term {
            return Err(rejected(format!(
                "incoming term {} does not match current term {}",
                state.term, current_term
            )));
        }
        if state.version <= self.last_published_version {
            return Err(rejected(format!(
                "incoming version {} not greater than last published version {}",
                state.version, self.last_published_version
            )));
        }
        let accepted = self.last_accepted_state();
        if state.last_accepted_config() != accepted.last_accepted_config()
            && accepted.last_committed_config() != accepted.last_accepted_config()
        {
            return Err(rejected(
                "only allow reconfiguration while not already reconfiguring".to_string(),
            ));
        }
        if state.last_committed_config() != accepted.last_committed_config() {
            return Err(rejected("last committed configuration should not change".to_string()));
        }

        self.last_published_version = state.version;
        self.last_published_config = state.last_accepted_config().clone();
        self.publish_votes = VoteCollection::new();
        tracing::trace!(term = state.term, version = state.version, "publishing");
        Ok(PublishRequest {
            source: self.local_node.clone(),
            state,
        })
    }

    /// Accepts a published state from the leader of the current term
    pub fn handle_publish_request(&mut self, request: &PublishRequest) -> Result<PublishResponse> {
        let current_term = self.current_term();
        if request.term() != current_term {
            return Err(rejected(format!(
                "incoming term {} does not match current term {}",
                request.term(),
                current_term
            )));
        }
        let accepted = self.last_accepted_state();
        if request.term() == accepted.term && request.version() <= accepted.version {
            return Err(rejected(format!(
                "incoming version {} lower or equal to current version {}",
                request.version(),
                accepted.version
            )));
        }
        self.persisted
            .set_last_accepted_state(Arc::new(request.state.clone()))?;
        Ok(PublishResponse {
            term: request.term(),
            version: request.version(),
        })
    }

    /// Leader side: tallies an acknowledgement and returns the commit once a
    /// publish quorum of both configurations has accepted
    pub fn handle_publish_response(
        &mut self,
        source: &DiscoveryNode,
        response: &PublishResponse,
    ) -> Result<Option<ApplyCommitRequest>> {
        if !self.election_won {
            return Err(rejected("election not won".to_string()));
        }
        let current_term = self.current_term();
        if response.term != current_term {
            return Err(rejected(format!(
                "incoming term {} does not match current term {}",
                response.term, current_term
            )));
        }
        if response.version != self.last_published_version {
            return Err(rejected(format!(
                "incoming version {} does not match last published version {}",
                response.version, self.last_published_version
            )));
        }
        self.publish_votes.add_vote(source.clone());
        let committed = self.last_committed_config();
        if self
            .election_strategy
            .is_publish_quorum(&self.publish_votes, &committed, &self.last_published_config)
        {
            return Ok(Some(ApplyCommitRequest {
                source: self.local_node.clone(),
                term: current_term,
                version: self.last_published_version,
            }));
        }
        Ok(None)
    }

    /// Marks the accepted state committed. Its accepted configuration becomes
    /// the committed one.
    pub fn handle_commit(&mut self, commit: &ApplyCommitRequest) -> Result<Arc<ClusterState>> {
        let current_term = self.current_term();
        if commit.term != current_term {
            return Err(rejected(format!(
                "incoming term {} does not match current term {}",
                commit.term, current_term
            )));
        }
        let accepted = self.last_accepted_state();
        if commit.term != accepted.term || commit.version != accepted.version {
            return Err(rejected(format!(
                "commit of term {} version {} does not match last accepted term {} version {}",
                commit.term, commit.version, accepted.term, accepted.version
            )));
        }
        let committed = if accepted.last_committed_config() != accepted.last_accepted_config() {
            let mut state = (*accepted).clone();
            state.metadata.coordination.last_committed_config =
                state.metadata.coordination.last_accepted_config.clone();
            let state = Arc::new(state);
            self.persisted.set_last_accepted_state(state.clone())?;
            state
        } else {
            accepted
        };
        Ok(committed)
    }

    pub fn is_election_quorum(&self, votes: &VoteCollection) -> bool {
        let accepted = self.last_accepted_state();
        self.election_strategy.is_election_quorum(
            &self.local_node,
            self.current_term(),
            accepted.term,
            accepted.version,
            accepted.last_committed_config(),
            accepted.last_accepted_config(),
            votes,
        )
    }

    pub fn is_publish_quorum(&self, votes: &VoteCollection) -> bool {
        let accepted = self.last_accepted_state();
        self.election_strategy.is_publish_quorum(
            votes,
            accepted.last_committed_config(),
            accepted.last_accepted_config(),
        )
    }
}
