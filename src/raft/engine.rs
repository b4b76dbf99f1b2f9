//! The consensus engine of a single node.
//!
//! Owns the durable state, the current role (candidate or leader) and every
//! state transition. Lock order is the storage write lock first, then any
//! in-memory lock. A transition holds the storage lock for its whole
//! duration, so it never interleaves with a durable mutation.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock, Weak};

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::RaftConfig;
use crate::error::{RaftError, Result};
use crate::raft::candidate::Candidate;
use crate::raft::leader::{Leader, TopologyChange};
use crate::raft::state::{
    CommitPoint, EntryFlags, LogEntry, NodeState, StateSnapshot, StateTransition,
};
use crate::raft::timer::ElectionTimer;
use crate::state_machine::StateMachine;
use crate::storage::{self, log, term, topology as topology_store, RaftStorage};
use crate::topology::{ClusterTopology, TopologyModification, INITIAL_TAG};
use crate::transport::{RemoteConnection, Transport};

/// Why an election is being started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionKind {
    /// Regular election, preceded by a trial round.
    Timeout,
    /// Skips the trial round and asks voters to ignore a live leader.
    Forced,
}

/// Condition awaited by [`ConsensusEngine::wait_for_commit_index_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitIndexModification {
    GreaterOrEqual,
    AnyChange,
}

/// Resources owned by the current state, released on the next transition.
#[derive(Clone)]
pub(crate) enum RoleHandle {
    Candidate(Arc<Candidate>),
    Leader(Arc<Leader>),
}

impl RoleHandle {
    fn dispose(&self) {
        match self {
            RoleHandle::Candidate(candidate) => candidate.dispose(),
            RoleHandle::Leader(leader) => leader.dispose(),
        }
    }
}

pub struct ConsensusEngine {
    pub(super) config: RaftConfig,
    pub(super) storage: RaftStorage,
    pub(super) state_machine: Arc<dyn StateMachine>,
    pub(super) transport: Arc<dyn Transport>,
    pub(super) timer: Arc<ElectionTimer>,
    tag: RwLock<String>,
    leader_tag: RwLock<Option<String>>,
    role: Mutex<Option<RoleHandle>>,
    history: Mutex<VecDeque<StateTransition>>,
    state_tx: watch::Sender<StateSnapshot>,
    topology_tx: watch::Sender<Arc<ClusterTopology>>,
    commit_tx: watch::Sender<CommitPoint>,
    pub(super) cancel: CancellationToken,
    pub(super) tasks: TaskTracker,
    self_ref: Weak<ConsensusEngine>,
}

impl ConsensusEngine {
    /// Open the node's storage and restore its durable state. The engine
    /// stays Passive until [`start`](Self::start) is called.
    pub fn open(
        config: RaftConfig,
        state_machine: Arc<dyn StateMachine>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let storage = match &config.db_path {
            Some(path) => RaftStorage::open(path)?,
            None => RaftStorage::open_in_memory()?,
        };
        let (current_term, topology, commit, tag) = storage.with_read(|conn| {
            Ok((
                term::current_term(conn)?,
                topology_store::get_topology(conn)?,
                term::last_commit(conn)?,
                term::tag(conn)?,
            ))
        })?;
        state_machine.initialize(commit)?;

        tracing::info!(
            url = %config.url,
            tag = %tag,
            term = current_term,
            commit_index = commit.index,
            passive = topology.is_passive(),
            "Opened consensus engine"
        );

        let (state_tx, _) = watch::channel(StateSnapshot {
            state: NodeState::Passive,
            term: current_term,
        });
        let (topology_tx, _) = watch::channel(Arc::new(topology));
        let (commit_tx, _) = watch::channel(commit);
        let timer = Arc::new(ElectionTimer::new(config.election_timeout_ms));

        Ok(Arc::new_cyclic(|self_ref| Self {
            config,
            storage,
            state_machine,
            transport,
            timer,
            tag: RwLock::new(tag),
            leader_tag: RwLock::new(None),
            role: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            state_tx,
            topology_tx,
            commit_tx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            self_ref: self_ref.clone(),
        }))
    }

    /// Spawn the election timer and rejoin the cluster as a follower when
    /// this node is part of the persisted topology.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        let timer = self.timer.clone();
        let engine = Arc::downgrade(self);
        let cancel = self.cancel.clone();
        self.tasks.spawn(async move {
            timer
                .run(cancel, move || {
                    if let Some(engine) = engine.upgrade() {
                        engine.on_election_timeout();
                    }
                })
                .await;
        });

        if self.topology().contains(&self.tag()) {
            self.set_new_state(NodeState::Follower, None, "engine started")?;
        }
        Ok(())
    }

    /// Cancel every role task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.timer.disable();
        {
            let _conn = self.storage.write();
            if let Some(role) = self.role.lock().expect("role mutex poisoned").take() {
                role.dispose();
            }
        }
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(tag = %self.tag(), "Consensus engine shut down");
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    pub fn tag(&self) -> String {
        self.tag.read().expect("tag lock poisoned").clone()
    }

    pub fn current_state(&self) -> NodeState {
        self.state_tx.borrow().state
    }

    pub fn current_term(&self) -> u64 {
        self.state_tx.borrow().term
    }

    pub fn voted_for(&self) -> Result<Option<String>> {
        self.storage.with_read(|conn| term::voted_for(conn))
    }

    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.topology_tx.borrow().clone()
    }

    pub fn last_commit(&self) -> CommitPoint {
        *self.commit_tx.borrow()
    }

    pub fn commit_index(&self) -> u64 {
        self.commit_tx.borrow().index
    }

    /// Tag of the node currently believed to lead, this node included.
    pub fn leader_tag(&self) -> Option<String> {
        if self.current_state().is_leader_like() {
            return Some(self.tag());
        }
        self.leader_tag.read().expect("leader lock poisoned").clone()
    }

    pub(crate) fn set_leader_tag(&self, leader: Option<String>) {
        *self.leader_tag.write().expect("leader lock poisoned") = leader;
    }

    /// Most recent transitions, oldest first.
    pub fn state_history(&self) -> Vec<StateTransition> {
        self.history
            .lock()
            .expect("history mutex poisoned")
            .iter()
            .cloned()
            .collect()
    }

    /// Matched log index per peer, while this node leads.
    pub fn follower_match_indexes(&self) -> Option<BTreeMap<String, u64>> {
        self.current_leader().ok().map(|leader| leader.match_indexes())
    }

    /// Vote status per peer, while this node is a candidate.
    pub fn election_status(&self) -> Vec<(String, String)> {
        match &*self.role.lock().expect("role mutex poisoned") {
            Some(RoleHandle::Candidate(candidate)) => candidate.ambassador_statuses(),
            _ => Vec::new(),
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<StateSnapshot> {
        self.state_tx.subscribe()
    }

    pub(crate) fn self_arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(RaftError::ShuttingDown)
    }

    fn on_election_timeout(&self) {
        if self.current_state() != NodeState::Follower {
            return;
        }
        tracing::info!(
            tag = %self.tag(),
            term = self.current_term(),
            elapsed_ms = self.timer.since_last_reset().as_millis() as u64,
            "Election timeout, starting election"
        );
        match self.switch_to_candidate_state("election timeout", false) {
            Ok(()) => {}
            Err(RaftError::InvalidOperation(reason)) => {
                tracing::debug!(reason = %reason, "Not running for office");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to start candidacy"),
        }
    }

    // ----- state transitions -----

    /// Move to a state that owns no role (`Passive` or `Follower`). When
    /// `expected_term` is set and the term moved meanwhile, nothing changes
    /// and a concurrency error is returned.
    pub fn set_new_state(
        &self,
        state: NodeState,
        expected_term: Option<u64>,
        reason: &str,
    ) -> Result<()> {
        if !matches!(state, NodeState::Passive | NodeState::Follower) {
            return Err(RaftError::InvalidOperation(format!(
                "{state} must be entered through an election"
            )));
        }
        self.transition(state, None, expected_term, reason)
    }

    pub(crate) fn transition(
        &self,
        state: NodeState,
        role: Option<RoleHandle>,
        expected_term: Option<u64>,
        reason: &str,
    ) -> Result<()> {
        let conn = self.storage.write();
        let current = *self.state_tx.borrow();
        let rejection = match expected_term {
            Some(expected) if expected != current.term => Some(format!(
                "cannot move to {state} ({reason}): expected term {expected}, term is {}",
                current.term
            )),
            _ if state == NodeState::LeaderElect && current.state != NodeState::Candidate => {
                Some(format!(
                    "cannot move to {state} ({reason}): no longer a candidate, now {}",
                    current.state
                ))
            }
            _ => None,
        };
        if let Some(message) = rejection {
            if let Some(role) = &role {
                role.dispose();
            }
            return Err(RaftError::Concurrency(message));
        }
        self.apply_transition(current.term, state, role, reason);
        drop(conn);
        Ok(())
    }

    /// Caller holds the storage write lock.
    fn apply_transition(
        &self,
        term: u64,
        state: NodeState,
        role: Option<RoleHandle>,
        reason: &str,
    ) {
        let arm_timer = state != NodeState::Passive && role.is_none();
        let previous = std::mem::replace(&mut *self.role.lock().expect("role mutex poisoned"), role);
        if let Some(previous) = previous {
            previous.dispose();
        }
        if arm_timer {
            self.timer.reset();
        } else {
            self.timer.disable();
        }
        if !state.is_leader_like() {
            self.set_leader_tag(None);
        }
        let from = self.state_tx.send_replace(StateSnapshot { state, term }).state;
        self.record_transition(from, state, term, reason);
    }

    fn record_transition(&self, from: NodeState, to: NodeState, term: u64, reason: &str) {
        {
            let mut history = self.history.lock().expect("history mutex poisoned");
            history.push_back(StateTransition {
                from,
                to,
                term,
                reason: reason.to_string(),
                when: Utc::now(),
            });
            while history.len() > self.config.state_history_len {
                history.pop_front();
            }
        }
        tracing::info!(tag = %self.tag(), %from, %to, term, reason, "State changed");
    }

    /// Adopt a newer term and clear the vote. Returns `false` when `new_term`
    /// is not newer than the current term.
    ///
    /// A Candidate, LeaderElect or Leader also reverts to Follower in the
    /// same step, under the same storage lock, so no role ever runs in a term
    /// it does not own. Passive and Follower nodes keep their state. Callers
    /// need no separate transition.
    pub fn found_about_higher_term(&self, new_term: u64, reason: &str) -> Result<bool> {
        let mut conn = self.storage.write();
        let changed =
            storage::commit_with(&mut conn, |tx| term::found_about_higher_term(tx, new_term))?;
        if !changed {
            return Ok(false);
        }
        tracing::info!(tag = %self.tag(), term = new_term, reason, "Found about higher term");
        match self.current_state() {
            NodeState::Passive | NodeState::Follower => {
                self.state_tx.send_modify(|snapshot| snapshot.term = new_term);
            }
            _ => self.apply_transition(new_term, NodeState::Follower, None, reason),
        }
        Ok(true)
    }

    /// Persist a vote for `voted_for` in a strictly newer `term`.
    pub fn cast_vote_in_term(&self, new_term: u64, voted_for: &str, reason: &str) -> Result<()> {
        let mut conn = self.storage.write();
        storage::commit_with(&mut conn, |tx| term::cast_vote_in_term(tx, new_term, voted_for))?;
        self.state_tx.send_modify(|snapshot| snapshot.term = new_term);
        tracing::info!(tag = %self.tag(), term = new_term, voted_for, reason, "Cast vote");
        Ok(())
    }

    /// Vote for another node and become its follower in one step.
    pub(crate) fn grant_vote(&self, new_term: u64, candidate: &str, reason: &str) -> Result<()> {
        let mut conn = self.storage.write();
        storage::commit_with(&mut conn, |tx| term::cast_vote_in_term(tx, new_term, candidate))?;
        if self.current_state() == NodeState::Passive {
            self.state_tx.send_modify(|snapshot| snapshot.term = new_term);
        } else {
            self.apply_transition(new_term, NodeState::Follower, None, reason);
        }
        Ok(())
    }

    /// LeaderElect becomes Leader once the first entry of its term commits.
    /// Outside LeaderElect this does nothing and returns `false`, so a late
    /// or repeated call is harmless.
    pub fn take_office(&self) -> Result<bool> {
        let _conn = self.storage.write();
        let current = *self.state_tx.borrow();
        if current.state != NodeState::LeaderElect {
            tracing::debug!(
                tag = %self.tag(),
                state = %current.state,
                term = current.term,
                "Not leader elect, ignoring take office"
            );
            return Ok(false);
        }
        self.state_tx.send_replace(StateSnapshot {
            state: NodeState::Leader,
            term: current.term,
        });
        self.record_transition(current.state, NodeState::Leader, current.term, "took office");
        Ok(true)
    }

    pub fn trigger_election(&self, kind: ElectionKind) -> Result<()> {
        let state = self.current_state();
        if state == NodeState::Passive {
            return Err(RaftError::InvalidOperation(
                "a passive node cannot run for office".into(),
            ));
        }
        if state.is_leader_like() {
            tracing::debug!(tag = %self.tag(), "Election requested while already leading");
            return Ok(());
        }
        let forced = kind == ElectionKind::Forced;
        let reason = if forced { "forced election" } else { "election requested" };
        self.switch_to_candidate_state(reason, forced)
    }

    pub(crate) fn switch_to_candidate_state(&self, reason: &str, forced: bool) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RaftError::ShuttingDown);
        }
        let tag = self.tag();
        if !self.topology().is_voter(&tag) {
            return Err(RaftError::InvalidOperation(format!(
                "{tag} is not a voter and cannot run for office"
            )));
        }
        let term = self.current_term();
        let candidate = Candidate::new(self.self_arc()?, forced);
        self.transition(
            NodeState::Candidate,
            Some(RoleHandle::Candidate(candidate.clone())),
            Some(term),
            reason,
        )?;
        candidate.start();
        Ok(())
    }

    pub(crate) fn switch_to_leader_state(
        &self,
        election_term: u64,
        connections: Vec<Arc<dyn RemoteConnection>>,
        reason: &str,
    ) -> Result<()> {
        let leader = Leader::new(self.self_arc()?, election_term, connections);
        self.transition(
            NodeState::LeaderElect,
            Some(RoleHandle::Leader(leader.clone())),
            Some(election_term),
            reason,
        )?;
        leader.start();
        Ok(())
    }

    /// Voluntarily give up leadership and let the cluster elect again.
    pub fn step_down(&self, reason: &str) -> Result<()> {
        let current = *self.state_tx.borrow();
        if !current.state.is_leader_like() {
            return Err(RaftError::NotLeading {
                leader: self.leader_tag(),
            });
        }
        self.transition(NodeState::Follower, None, Some(current.term), reason)
    }

    /// Forget the cluster entirely: empty log, watermarks at zero, initial
    /// tag and a passive topology. The term is kept.
    pub fn hard_reset_to_passive(&self, reason: &str) -> Result<()> {
        let mut conn = self.storage.write();
        let passive = ClusterTopology::new_passive();
        storage::commit_with(&mut conn, |tx| {
            log::clear_log_entries_and_set_last_truncate(tx, 0, 0)?;
            term::reset_last_commit(tx, 0, 0)?;
            term::set_tag(tx, INITIAL_TAG)?;
            topology_store::set_topology(tx, &passive)
        })?;
        tracing::warn!(tag = %self.tag(), reason, "Hard reset to passive");
        *self.tag.write().expect("tag lock poisoned") = INITIAL_TAG.to_string();
        self.topology_tx.send_replace(Arc::new(passive));
        self.commit_tx.send_replace(CommitPoint::default());
        let term = self.current_term();
        self.apply_transition(term, NodeState::Passive, None, reason);
        Ok(())
    }

    // ----- topology -----

    /// Turn a passive node into the single voter of a new cluster. The node
    /// starts an election right away and wins it alone.
    pub fn bootstrap(&self, url: &str) -> Result<()> {
        {
            let mut conn = self.storage.write();
            let current = topology_store::get_topology(&conn)?;
            if let Some(id) = &current.topology_id {
                return Err(RaftError::InvalidOperation(format!(
                    "already part of cluster {id}"
                )));
            }
            let mut tag = term::tag(&conn)?;
            if tag == INITIAL_TAG {
                tag = "A".to_string();
            }
            let topology = ClusterTopology::bootstrap(&tag, url);
            storage::commit_with(&mut conn, |tx| {
                term::set_tag(tx, &tag)?;
                topology_store::set_topology(tx, &topology)
            })?;
            tracing::info!(
                tag = %tag,
                url,
                topology_id = ?topology.topology_id,
                "Bootstrapped new cluster"
            );
            *self.tag.write().expect("tag lock poisoned") = tag;
            self.topology_tx.send_replace(Arc::new(topology));
        }
        self.switch_to_candidate_state("bootstrapped a new cluster", false)
    }

    /// Replace the topology, durably, and publish it.
    pub fn set_topology(&self, topology: ClusterTopology) -> Result<()> {
        let mut conn = self.storage.write();
        storage::commit_with(&mut conn, |tx| topology_store::set_topology(tx, &topology))?;
        self.topology_tx.send_replace(Arc::new(topology));
        Ok(())
    }

    /// Adopt the tag a cluster assigned to this passive node.
    pub(crate) fn update_node_tag(&self, tag: &str) -> Result<()> {
        let mut conn = self.storage.write();
        storage::commit_with(&mut conn, |tx| term::set_tag(tx, tag))?;
        tracing::info!(old = %self.tag(), new = tag, "Adopted node tag");
        *self.tag.write().expect("tag lock poisoned") = tag.to_string();
        Ok(())
    }

    /// Add the node listening on `url` in the given role, or change the role
    /// of an existing node. Returns the node's tag once the change commits.
    pub async fn add_to_cluster(
        &self,
        url: &str,
        tag: Option<&str>,
        kind: TopologyModification,
    ) -> Result<String> {
        if kind == TopologyModification::Remove {
            return Err(RaftError::InvalidOperation(
                "use remove_from_cluster to remove a node".into(),
            ));
        }
        self.modify_topology(tag, Some(url), kind).await
    }

    pub async fn remove_from_cluster(&self, tag: &str) -> Result<()> {
        self.modify_topology(Some(tag), None, TopologyModification::Remove)
            .await
            .map(|_| ())
    }

    async fn modify_topology(
        &self,
        tag: Option<&str>,
        url: Option<&str>,
        kind: TopologyModification,
    ) -> Result<String> {
        let deadline = Instant::now() + self.config.operation_timeout();
        loop {
            let leader = self.current_leader()?;
            match leader.try_modify_topology(tag, url, kind)? {
                TopologyChange::Applied { index, tag } => {
                    self.wait_for_leader_commit(&leader, index, deadline).await?;
                    tracing::info!(tag = %tag, %kind, index, "Topology change committed");
                    return Ok(tag);
                }
                TopologyChange::AlreadyApplied { tag } => return Ok(tag),
                TopologyChange::TryAgain { wait_for_index } => {
                    tracing::debug!(wait_for_index, "Topology change pending, retrying later");
                    self.wait_for_leader_commit(&leader, wait_for_index, deadline)
                        .await?;
                }
            }
        }
    }

    async fn wait_for_leader_commit(
        &self,
        leader: &Leader,
        index: u64,
        deadline: Instant,
    ) -> Result<()> {
        let wait = async {
            tokio::select! {
                result = self.wait_for_commit_index_change(CommitIndexModification::GreaterOrEqual, index) => result,
                _ = leader.deposed() => Err(RaftError::NotLeading { leader: self.leader_tag() }),
            }
        };
        match tokio::time::timeout_at(deadline, wait).await {
            Ok(result) => result,
            Err(_) => Err(RaftError::Timeout(format!(
                "index {index} was not committed in time"
            ))),
        }
    }

    pub(crate) fn current_leader(&self) -> Result<Arc<Leader>> {
        let role = self.role.lock().expect("role mutex poisoned").clone();
        match role {
            Some(RoleHandle::Leader(leader)) if self.current_state().is_leader_like() => Ok(leader),
            _ => Err(RaftError::NotLeading {
                leader: self.leader_tag(),
            }),
        }
    }

    /// Replicate `payload` and return its index together with the state
    /// machine's result once it has been committed and applied.
    pub async fn put(&self, payload: Vec<u8>) -> Result<(u64, Vec<u8>)> {
        let leader = self.current_leader()?;
        let (index, result_rx) = leader.append_command(payload)?;
        match tokio::time::timeout(self.config.operation_timeout(), result_rx).await {
            Ok(Ok(result)) => result.map(|value| (index, value)),
            Ok(Err(_)) => Err(RaftError::NotLeading {
                leader: self.leader_tag(),
            }),
            Err(_) => Err(RaftError::Timeout(format!(
                "entry {index} was not applied in time"
            ))),
        }
    }

    // ----- log -----

    /// Append to the log of a leader, in its current term.
    pub fn insert_to_leader_log(&self, entry: Vec<u8>, flags: EntryFlags) -> Result<u64> {
        self.insert_to_leader_log_at(self.current_term(), entry, flags)
    }

    pub(crate) fn insert_to_leader_log_at(
        &self,
        leader_term: u64,
        entry: Vec<u8>,
        flags: EntryFlags,
    ) -> Result<u64> {
        let mut conn = self.storage.write();
        self.ensure_leading(leader_term)?;
        storage::commit_with(&mut conn, |tx| {
            log::insert_to_leader_log(tx, leader_term, entry, flags)
        })
    }

    /// Append a topology entry and adopt the topology in one transaction.
    pub(crate) fn append_topology_entry(
        &self,
        leader_term: u64,
        topology: ClusterTopology,
    ) -> Result<u64> {
        let payload = serde_json::to_vec(&topology)?;
        let mut conn = self.storage.write();
        self.ensure_leading(leader_term)?;
        let index = storage::commit_with(&mut conn, |tx| {
            let index =
                log::insert_to_leader_log(tx, leader_term, payload, EntryFlags::Topology)?;
            topology_store::set_topology(tx, &topology)?;
            Ok(index)
        })?;
        self.topology_tx.send_replace(Arc::new(topology));
        Ok(index)
    }

    /// Caller holds the storage write lock.
    fn ensure_leading(&self, leader_term: u64) -> Result<()> {
        let current = *self.state_tx.borrow();
        if !current.state.is_leader_like() || current.term != leader_term {
            return Err(RaftError::Concurrency(format!(
                "leadership of term {leader_term} is over, now {} in term {}",
                current.state, current.term
            )));
        }
        Ok(())
    }

    pub fn append_to_log(&self, entries: &[LogEntry]) -> Result<Option<LogEntry>> {
        self.storage.with_write(|conn| log::append_to_log(conn, entries))
    }

    pub fn get_entry(&self, index: u64) -> Result<Option<LogEntry>> {
        self.storage.with_read(|conn| log::get_entry(conn, index))
    }

    pub fn get_entries(&self, from: u64, take: usize) -> Result<Vec<LogEntry>> {
        self.storage.with_read(|conn| log::get_entries(conn, from, take))
    }

    pub fn get_term_for(&self, index: u64) -> Result<Option<u64>> {
        self.storage.with_read(|conn| log::get_term_for(conn, index))
    }

    pub fn get_log_entries_range(&self) -> Result<(u64, u64)> {
        self.storage.with_read(log::get_log_entries_range)
    }

    pub fn get_first_entry_index(&self) -> Result<u64> {
        self.storage.with_read(log::get_first_entry_index)
    }

    pub fn get_last_entry_index(&self) -> Result<u64> {
        self.storage.with_read(log::get_last_entry_index)
    }

    /// `(index, term)` of the last log entry.
    pub fn last_log_entry(&self) -> Result<(u64, u64)> {
        self.storage.with_read(log::get_last_entry)
    }

    pub(crate) fn last_topology_entry_between(
        &self,
        after: u64,
        upto: u64,
    ) -> Result<Option<LogEntry>> {
        self.storage
            .with_read(|conn| log::last_topology_entry_between(conn, after, upto))
    }

    pub fn last_truncated(&self) -> Result<(u64, u64)> {
        self.storage.with_read(term::last_truncated)
    }

    pub fn truncate_log_before(&self, upto: u64) -> Result<()> {
        self.storage.with_write(|conn| log::truncate_log_before(conn, upto))
    }

    pub fn clear_log_entries_and_set_last_truncate(&self, index: u64, term: u64) -> Result<()> {
        self.storage
            .with_write(|conn| log::clear_log_entries_and_set_last_truncate(conn, index, term))
    }

    /// Move the commit watermark without applying anything.
    pub fn set_last_commit_index(&self, index: u64, term_at: u64) -> Result<()> {
        let mut conn = self.storage.write();
        storage::commit_with(&mut conn, |tx| term::set_last_commit_index(tx, index, term_at))?;
        self.commit_tx.send_replace(CommitPoint {
            index,
            term: term_at,
        });
        Ok(())
    }

    /// Skip ahead to `(index, term)`: the log is emptied and both watermarks
    /// move there.
    pub(crate) fn install_snapshot(
        &self,
        index: u64,
        term_at: u64,
        topology: &ClusterTopology,
    ) -> Result<()> {
        let mut conn = self.storage.write();
        let commit = term::last_commit(&conn)?;
        if index <= commit.index {
            return Ok(());
        }
        storage::commit_with(&mut conn, |tx| {
            log::clear_log_entries_and_set_last_truncate(tx, index, term_at)?;
            term::reset_last_commit(tx, index, term_at)?;
            topology_store::set_topology(tx, topology)
        })?;
        self.state_machine.on_snapshot_installed(index, term_at)?;
        self.commit_tx.send_replace(CommitPoint {
            index,
            term: term_at,
        });
        self.topology_tx.send_replace(Arc::new(topology.clone()));
        tracing::info!(tag = %self.tag(), index, term = term_at, "Installed snapshot marker");
        Ok(())
    }

    /// Commit up to `upto` (clamped to the last entry) and apply the newly
    /// committed `Normal` entries, in one transaction. Returns the state
    /// machine's result per applied index.
    pub(crate) fn commit_and_apply(&self, upto: u64) -> Result<Vec<(u64, Result<Vec<u8>>)>> {
        let mut results = Vec::new();
        let commit = {
            let mut conn = self.storage.write();
            let current = term::last_commit(&conn)?;
            let upto = upto.min(log::get_last_entry_index(&conn)?);
            if upto <= current.index {
                return Ok(results);
            }
            let batch_size = self.config.max_append_entries_batch.max(1);
            let commit = storage::commit_with(&mut conn, |tx| {
                let mut point = current;
                while point.index < upto {
                    let take = ((upto - point.index) as usize).min(batch_size);
                    let batch = log::get_entries(tx, point.index + 1, take)?;
                    if batch.is_empty() {
                        break;
                    }
                    for entry in batch {
                        if entry.flags == EntryFlags::Normal {
                            let result = self.state_machine.apply(&entry);
                            if let Err(e) = &result {
                                tracing::warn!(index = entry.index, error = %e, "State machine rejected entry");
                            }
                            results.push((entry.index, result));
                        }
                        point = CommitPoint {
                            index: entry.index,
                            term: entry.term,
                        };
                    }
                }
                term::set_last_commit_index(tx, point.index, point.term)?;
                Ok(point)
            })?;
            self.commit_tx.send_replace(commit);
            commit
        };
        tracing::debug!(tag = %self.tag(), commit_index = commit.index, term = commit.term, "Committed entries");

        if self.state_machine.should_snapshot(commit.index, commit.term) {
            self.truncate_log_before(commit.index)?;
        }
        Ok(results)
    }

    // ----- waiting -----

    pub async fn wait_for_state(&self, state: NodeState) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        self.wait_on(&mut rx, |snapshot| snapshot.state == state).await
    }

    /// Resolves once the node is no longer in `state` at `term`.
    pub async fn wait_for_leave_state(&self, state: NodeState, term: u64) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        self.wait_on(&mut rx, |snapshot| {
            snapshot.state != state || snapshot.term != term
        })
        .await
    }

    /// Resolves once `tag` (this node when `None`) holds the role named by
    /// `modification`; `Remove` waits until it is gone.
    pub async fn wait_for_topology(
        &self,
        modification: TopologyModification,
        tag: Option<&str>,
    ) -> Result<()> {
        let mut rx = self.topology_tx.subscribe();
        self.wait_on(&mut rx, |topology| {
            let tag = tag.map(str::to_string).unwrap_or_else(|| self.tag());
            topology.role_of(&tag) == modification
        })
        .await
    }

    pub async fn wait_for_commit_index_change(
        &self,
        modification: CommitIndexModification,
        value: u64,
    ) -> Result<()> {
        let mut rx = self.commit_tx.subscribe();
        self.wait_on(&mut rx, |commit| match modification {
            CommitIndexModification::GreaterOrEqual => commit.index >= value,
            CommitIndexModification::AnyChange => commit.index != value,
        })
        .await
    }

    /// Sample the current value, then suspend until a newer one satisfies
    /// `done`. Subscribing before sampling means no change is missed.
    async fn wait_on<T>(
        &self,
        rx: &mut watch::Receiver<T>,
        mut done: impl FnMut(&T) -> bool,
    ) -> Result<()> {
        loop {
            if done(&rx.borrow_and_update()) {
                return Ok(());
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RaftError::ShuttingDown);
                    }
                }
                _ = self.cancel.cancelled() => return Err(RaftError::ShuttingDown),
            }
        }
    }
}
