//! Leadership: replication to every peer, commit advancement and
//! membership changes.
//!
//! A new leader first appends a `Noop` in its own term. It stays
//! LeaderElect until that entry commits, and only entries of its own term
//! are ever committed by counting replicas.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::{RaftError, Result};
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::{AppendEntries, Hello, InitialMessageType, SnapshotMarker};
use crate::raft::state::{EntryFlags, NodeState};
use crate::topology::TopologyModification;
use crate::transport::RemoteConnection;

/// Outcome of a membership change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TopologyChange {
    /// Appended at `index`; done once it commits.
    Applied { index: u64, tag: String },
    /// The topology already reads as requested.
    AlreadyApplied { tag: String },
    /// Another change (or the leader's first entry) is uncommitted.
    TryAgain { wait_for_index: u64 },
}

type PendingResult = oneshot::Sender<Result<Vec<u8>>>;

pub(crate) struct Leader {
    engine: Arc<ConsensusEngine>,
    term: u64,
    cancel: CancellationToken,
    /// Last index appended by this leader; followers' ambassadors wake on it.
    appended: watch::Sender<u64>,
    ambassadors: Mutex<HashMap<String, Arc<FollowerAmbassador>>>,
    seed_connections: Mutex<HashMap<String, Arc<dyn RemoteConnection>>>,
    pending: Mutex<BTreeMap<u64, PendingResult>>,
    topology_in_flight: Mutex<Option<u64>>,
    noop_index: AtomicU64,
    office_taken: AtomicBool,
    elected_at: Instant,
}

impl Leader {
    pub(crate) fn new(
        engine: Arc<ConsensusEngine>,
        term: u64,
        connections: Vec<Arc<dyn RemoteConnection>>,
    ) -> Arc<Self> {
        let cancel = engine.cancel.child_token();
        let (appended, _) = watch::channel(0);
        let seed_connections = connections
            .into_iter()
            .map(|connection| (connection.peer_tag().to_string(), connection))
            .collect();
        Arc::new(Self {
            engine,
            term,
            cancel,
            appended,
            ambassadors: Mutex::new(HashMap::new()),
            seed_connections: Mutex::new(seed_connections),
            pending: Mutex::new(BTreeMap::new()),
            topology_in_flight: Mutex::new(None),
            noop_index: AtomicU64::new(0),
            office_taken: AtomicBool::new(false),
            elected_at: Instant::now(),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let leader = self.clone();
        self.engine.tasks.spawn(async move { leader.run().await });
    }

    pub(crate) fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Resolves once this leadership is over.
    pub(crate) async fn deposed(&self) {
        self.cancel.cancelled().await
    }

    async fn run(self: Arc<Self>) {
        match self
            .engine
            .insert_to_leader_log_at(self.term, Vec::new(), EntryFlags::Noop)
        {
            Ok(index) => {
                self.noop_index.store(index, Ordering::Release);
                self.appended.send_replace(index);
                tracing::debug!(term = self.term, index, "Appended leadership noop");
            }
            Err(e) => {
                tracing::warn!(term = self.term, error = %e, "Could not start leading");
                self.drain();
                return;
            }
        }
        self.refresh_ambassadors();
        self.advance_commit();

        let mut ticker = tokio::time::interval(self.engine.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.refresh_ambassadors();
                    if !self.has_quorum() {
                        tracing::warn!(
                            tag = %self.engine.tag(),
                            term = self.term,
                            "Lost contact with a majority of voters, stepping down"
                        );
                        if let Err(e) = self.engine.set_new_state(
                            NodeState::Follower,
                            Some(self.term),
                            "lost contact with a majority of voters",
                        ) {
                            tracing::debug!(error = %e, "Step down raced with another transition");
                        }
                        break;
                    }
                }
            }
        }
        self.drain();
    }

    /// Fail every pending command and release unused connections.
    fn drain(&self) {
        let pending = std::mem::take(&mut *self.pending.lock().expect("leader mutex poisoned"));
        for (_, result_tx) in pending {
            let _ = result_tx.send(Err(RaftError::NotLeading { leader: None }));
        }
        let seeds = std::mem::take(&mut *self.seed_connections.lock().expect("leader mutex poisoned"));
        for connection in seeds.values() {
            connection.close();
        }
    }

    fn has_quorum(&self) -> bool {
        let window = self.engine.config.election_timeout();
        if self.elected_at.elapsed() < window {
            return true;
        }
        let topology = self.engine.topology();
        let self_tag = self.engine.tag();
        let ambassadors = self.ambassadors.lock().expect("leader mutex poisoned");
        let alive = topology
            .members
            .keys()
            .filter(|tag| {
                **tag == self_tag
                    || ambassadors
                        .get(*tag)
                        .is_some_and(|ambassador| ambassador.heard_within(window))
            })
            .count();
        alive >= topology.majority()
    }

    /// Start replicating to new nodes and schedule removed ones for retirement.
    fn refresh_ambassadors(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        let topology = self.engine.topology();
        let self_tag = self.engine.tag();
        let nodes = topology.all_nodes();
        let last_index = self.engine.get_last_entry_index().unwrap_or(0);

        let mut ambassadors = self.ambassadors.lock().expect("leader mutex poisoned");
        for (tag, url) in &nodes {
            if *tag == self_tag || ambassadors.contains_key(tag) {
                continue;
            }
            let seed = self
                .seed_connections
                .lock()
                .expect("leader mutex poisoned")
                .remove(tag);
            let ambassador = Arc::new(FollowerAmbassador::new(tag.clone(), url.clone(), seed));
            ambassadors.insert(tag.clone(), ambassador.clone());
            self.engine.tasks.spawn(ambassador.run(self.clone()));
            tracing::debug!(peer = %tag, url = %url, "Started replicating to peer");
        }
        for (tag, ambassador) in ambassadors.iter() {
            if !nodes.contains_key(tag) {
                ambassador.retire_after(last_index);
            }
        }
    }

    fn ambassador_exited(&self, ambassador: &Arc<FollowerAmbassador>) {
        let mut ambassadors = self.ambassadors.lock().expect("leader mutex poisoned");
        if ambassadors
            .get(&ambassador.tag)
            .is_some_and(|current| Arc::ptr_eq(current, ambassador))
        {
            ambassadors.remove(&ambassador.tag);
        }
    }

    /// Matched index of every peer with an ambassador.
    pub(crate) fn match_indexes(&self) -> BTreeMap<String, u64> {
        self.ambassadors
            .lock()
            .expect("leader mutex poisoned")
            .iter()
            .map(|(tag, ambassador)| (tag.clone(), ambassador.matched()))
            .collect()
    }

    /// Commit the highest index stored on a majority of voters, provided it
    /// belongs to this leader's term.
    fn advance_commit(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let topology = self.engine.topology();
        let self_tag = self.engine.tag();
        let last_index = match self.engine.get_last_entry_index() {
            Ok(index) => index,
            Err(e) => {
                tracing::warn!(error = %e, "Could not read the log");
                return;
            }
        };

        let mut replicated: Vec<u64> = {
            let ambassadors = self.ambassadors.lock().expect("leader mutex poisoned");
            topology
                .members
                .keys()
                .map(|tag| {
                    if *tag == self_tag {
                        last_index
                    } else {
                        ambassadors.get(tag).map_or(0, |ambassador| ambassador.matched())
                    }
                })
                .collect()
        };
        if replicated.is_empty() {
            return;
        }
        replicated.sort_unstable_by(|a, b| b.cmp(a));
        let majority_index = replicated[topology.majority() - 1];

        if majority_index > self.engine.commit_index() {
            match self.engine.get_term_for(majority_index) {
                Ok(Some(term)) if term == self.term => match self.engine.commit_and_apply(majority_index) {
                    Ok(results) => self.complete_pending(results),
                    Err(e) => {
                        tracing::warn!(index = majority_index, error = %e, "Failed to commit");
                        return;
                    }
                },
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(index = majority_index, error = %e, "Could not read term");
                    return;
                }
            }
        }
        self.maybe_take_office();
    }

    fn complete_pending(&self, results: Vec<(u64, Result<Vec<u8>>)>) {
        let mut pending = self.pending.lock().expect("leader mutex poisoned");
        for (index, result) in results {
            if let Some(result_tx) = pending.remove(&index) {
                let _ = result_tx.send(result);
            }
        }
    }

    fn maybe_take_office(&self) {
        if self.office_taken.load(Ordering::Acquire) {
            return;
        }
        let noop_index = self.noop_index.load(Ordering::Acquire);
        if noop_index == 0 || self.engine.commit_index() < noop_index {
            return;
        }
        match self.engine.take_office() {
            Ok(true) => {
                self.office_taken.store(true, Ordering::Release);
                tracing::info!(tag = %self.engine.tag(), term = self.term, "Took office");
            }
            Ok(false) => {}
            Err(e) => tracing::debug!(error = %e, "Could not take office"),
        }
    }

    fn on_follower_progress(self: &Arc<Self>, tag: &str, matched: u64) {
        self.advance_commit();
        if !self.office_taken.load(Ordering::Acquire) {
            return;
        }
        let topology = self.engine.topology();
        if topology.role_of(tag) != TopologyModification::Promotable
            || matched < self.engine.commit_index()
        {
            return;
        }
        match self.try_modify_topology(Some(tag), None, TopologyModification::Voter) {
            Ok(TopologyChange::Applied { index, .. }) => {
                tracing::info!(peer = %tag, index, "Promoting caught-up node to voter");
            }
            Ok(_) => {}
            Err(e) => tracing::debug!(peer = %tag, error = %e, "Promotion postponed"),
        }
    }

    /// Append a command; the receiver yields the state machine's result once
    /// the entry is committed and applied.
    pub(crate) fn append_command(
        self: &Arc<Self>,
        payload: Vec<u8>,
    ) -> Result<(u64, oneshot::Receiver<Result<Vec<u8>>>)> {
        let (result_tx, result_rx) = oneshot::channel();
        let index = {
            let mut pending = self.pending.lock().expect("leader mutex poisoned");
            if self.cancel.is_cancelled() {
                return Err(self.not_leading());
            }
            let index = self
                .engine
                .insert_to_leader_log_at(self.term, payload, EntryFlags::Normal)
                .map_err(|e| self.leadership_lost(e))?;
            pending.insert(index, result_tx);
            index
        };
        self.appended.send_replace(index);
        self.advance_commit();
        Ok((index, result_rx))
    }

    /// Apply one membership change. Only one change may be uncommitted at a
    /// time, and none before the leader's noop commits.
    pub(crate) fn try_modify_topology(
        self: &Arc<Self>,
        tag: Option<&str>,
        url: Option<&str>,
        kind: TopologyModification,
    ) -> Result<TopologyChange> {
        if self.cancel.is_cancelled() {
            return Err(self.not_leading());
        }
        if !self.office_taken.load(Ordering::Acquire) {
            return Ok(TopologyChange::TryAgain {
                wait_for_index: self.noop_index.load(Ordering::Acquire).max(1),
            });
        }

        let mut in_flight = self.topology_in_flight.lock().expect("leader mutex poisoned");
        if let Some(index) = *in_flight {
            if index > self.engine.commit_index() {
                return Ok(TopologyChange::TryAgain {
                    wait_for_index: index,
                });
            }
        }

        let topology = self.engine.topology();
        let self_tag = self.engine.tag();
        let (tag, url) = if kind == TopologyModification::Remove {
            let tag = tag.ok_or_else(|| {
                RaftError::InvalidOperation("a tag is required to remove a node".into())
            })?;
            if tag == self_tag {
                return Err(RaftError::InvalidOperation(format!(
                    "{tag} is leading and cannot remove itself, step down first"
                )));
            }
            let Some(url) = topology.get_url_from_tag(tag) else {
                return Ok(TopologyChange::AlreadyApplied {
                    tag: tag.to_string(),
                });
            };
            (tag.to_string(), url.to_string())
        } else {
            let registered = url.and_then(|url| topology.has_url(url));
            let tag = match (tag, registered) {
                (Some(requested), Some(registered)) if requested != registered => {
                    return Err(RaftError::InvalidOperation(format!(
                        "{} is already registered as {registered}",
                        url.unwrap_or_default()
                    )));
                }
                (Some(requested), _) => requested.to_string(),
                (None, Some(registered)) => registered,
                (None, None) => topology.next_tag(),
            };
            let Some(url) = url.or_else(|| topology.get_url_from_tag(&tag)) else {
                return Err(RaftError::InvalidOperation(format!("no url known for {tag}")));
            };
            if topology.role_of(&tag) == kind && topology.get_url_from_tag(&tag) == Some(url) {
                return Ok(TopologyChange::AlreadyApplied { tag });
            }
            if tag == self_tag && kind != TopologyModification::Voter {
                return Err(RaftError::InvalidOperation(format!(
                    "{tag} is leading and must stay a voter"
                )));
            }
            (tag, url.to_string())
        };

        let next = topology.with_modification(&tag, &url, kind);
        let index = self
            .engine
            .append_topology_entry(self.term, next)
            .map_err(|e| self.leadership_lost(e))?;
        *in_flight = Some(index);
        drop(in_flight);

        tracing::info!(tag = %tag, url = %url, %kind, index, "Appended topology change");
        self.refresh_ambassadors();
        self.appended.send_replace(index);
        self.advance_commit();
        Ok(TopologyChange::Applied { index, tag })
    }

    fn not_leading(&self) -> RaftError {
        RaftError::NotLeading {
            leader: self.engine.leader_tag(),
        }
    }

    fn leadership_lost(&self, error: RaftError) -> RaftError {
        match error {
            RaftError::Concurrency(_) => self.not_leading(),
            other => other,
        }
    }

    /// Build the next request for a follower whose next index is
    /// `next_index`. Returns the request and the last index it carries.
    fn build_append_entries(&self, next_index: u64) -> Result<(AppendEntries, u64)> {
        let engine = &self.engine;
        let (truncated_index, truncated_term) = engine.last_truncated()?;
        let (prev_log_index, prev_log_term, snapshot) = if next_index <= truncated_index {
            // the follower needs history this node no longer has
            let marker = SnapshotMarker {
                last_included_index: truncated_index,
                last_included_term: truncated_term,
                topology: (*engine.topology()).clone(),
            };
            (truncated_index, truncated_term, Some(marker))
        } else {
            let prev = next_index - 1;
            let prev_term = engine.get_term_for(prev)?.ok_or_else(|| {
                RaftError::InvalidOperation(format!("no term known for index {prev}"))
            })?;
            (prev, prev_term, None)
        };

        let entries = engine.get_entries(prev_log_index + 1, engine.config.max_append_entries_batch)?;
        let last_sent = prev_log_index + entries.len() as u64;
        let request = AppendEntries {
            term: self.term,
            leader_tag: engine.tag(),
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: engine.commit_index(),
            snapshot,
        };
        Ok((request, last_sent))
    }
}

/// What a replication attempt left to do.
enum Progress {
    MoreToSend,
    UpToDate,
    Deposed,
}

struct FollowerAmbassador {
    tag: String,
    url: String,
    connection: Mutex<Option<Arc<dyn RemoteConnection>>>,
    next_index: AtomicU64,
    matched: AtomicU64,
    /// Index of the entry that removed the peer, zero while it is a member.
    retire_at: AtomicU64,
    /// Highest `leader_commit` the peer accepted.
    acked_commit: AtomicU64,
    last_contact: Mutex<Option<Instant>>,
}

impl FollowerAmbassador {
    fn new(tag: String, url: String, seed: Option<Arc<dyn RemoteConnection>>) -> Self {
        Self {
            tag,
            url,
            connection: Mutex::new(seed),
            next_index: AtomicU64::new(1),
            matched: AtomicU64::new(0),
            retire_at: AtomicU64::new(0),
            acked_commit: AtomicU64::new(0),
            last_contact: Mutex::new(None),
        }
    }

    fn matched(&self) -> u64 {
        self.matched.load(Ordering::Acquire)
    }

    fn heard_within(&self, window: Duration) -> bool {
        self.last_contact
            .lock()
            .expect("ambassador mutex poisoned")
            .is_some_and(|at| at.elapsed() < window)
    }

    fn retire_after(&self, index: u64) {
        let _ = self
            .retire_at
            .compare_exchange(0, index.max(1), Ordering::AcqRel, Ordering::Acquire);
    }

    /// A removed peer is dropped once it was told the entry removing it is
    /// committed, or once that entry committed and the peer stopped answering.
    fn should_retire(&self, engine: &ConsensusEngine) -> bool {
        let retire_at = self.retire_at.load(Ordering::Acquire);
        if retire_at == 0 {
            return false;
        }
        (self.matched() >= retire_at && self.acked_commit.load(Ordering::Acquire) >= retire_at)
            || (engine.commit_index() >= retire_at
                && !self.heard_within(engine.config.election_timeout()))
    }

    fn current_connection(&self) -> Option<Arc<dyn RemoteConnection>> {
        self.connection
            .lock()
            .expect("ambassador mutex poisoned")
            .clone()
    }

    fn drop_connection(&self) {
        if let Some(connection) = self.connection.lock().expect("ambassador mutex poisoned").take() {
            connection.close();
        }
    }

    async fn run(self: Arc<Self>, leader: Arc<Leader>) {
        let engine = leader.engine.clone();
        let heartbeat = engine.config.heartbeat_interval();
        let mut appended = leader.appended.subscribe();
        self.next_index.store(
            engine.get_last_entry_index().unwrap_or(0) + 1,
            Ordering::Release,
        );

        while !leader.cancel.is_cancelled() {
            if self.should_retire(&engine) {
                tracing::info!(peer = %self.tag, "Stopped replicating to removed node");
                break;
            }
            appended.borrow_and_update();
            match self.replicate_once(&leader).await {
                Ok(Progress::MoreToSend) => continue,
                Ok(Progress::UpToDate) => {}
                Ok(Progress::Deposed) => break,
                Err(e) => {
                    self.drop_connection();
                    tracing::debug!(peer = %self.tag, error = %e, "Replication attempt failed");
                }
            }
            tokio::select! {
                _ = appended.changed() => {}
                _ = tokio::time::sleep(heartbeat) => {}
                _ = leader.cancel.cancelled() => break,
            }
        }

        self.drop_connection();
        leader.ambassador_exited(&self);
    }

    async fn replicate_once(&self, leader: &Arc<Leader>) -> Result<Progress> {
        let engine = &leader.engine;
        let connection = match self.current_connection() {
            Some(connection) => connection,
            None => self.connect(engine).await?,
        };

        let next_index = self.next_index.load(Ordering::Acquire);
        let (request, last_sent) = leader.build_append_entries(next_index)?;
        let leader_commit = request.leader_commit.min(last_sent);
        let response = connection.append_entries(request).await?;

        if response.current_term > leader.term {
            engine.found_about_higher_term(
                response.current_term,
                &format!("{} is at term {}", self.tag, response.current_term),
            )?;
            return Ok(Progress::Deposed);
        }
        *self.last_contact.lock().expect("ambassador mutex poisoned") = Some(Instant::now());

        if response.success {
            self.matched.fetch_max(last_sent, Ordering::AcqRel);
            self.acked_commit.fetch_max(leader_commit, Ordering::AcqRel);
            self.next_index.store(last_sent + 1, Ordering::Release);
            leader.on_follower_progress(&self.tag, last_sent);
            let last_index = engine.get_last_entry_index()?;
            return Ok(if last_sent < last_index {
                Progress::MoreToSend
            } else {
                Progress::UpToDate
            });
        }

        let next = (response.last_log_index + 1)
            .min(next_index.saturating_sub(1))
            .max(1);
        tracing::debug!(
            peer = %self.tag,
            next_index = next,
            reason = %response.message,
            "Follower rejected entries, backing off"
        );
        self.next_index.store(next, Ordering::Release);
        Ok(if next < next_index {
            Progress::MoreToSend
        } else {
            Progress::UpToDate
        })
    }

    async fn connect(&self, engine: &ConsensusEngine) -> Result<Arc<dyn RemoteConnection>> {
        let connection = engine.transport.connect(&self.tag, &self.url).await?;
        let hello = Hello {
            topology_id: engine.topology().topology_id.clone(),
            source_tag: engine.tag(),
            destination_tag: self.tag.clone(),
            destination_url: self.url.clone(),
            initial_message_type: InitialMessageType::AppendEntries,
        };
        if let Err(e) = connection.hello(hello).await {
            connection.close();
            return Err(e);
        }
        *self.connection.lock().expect("ambassador mutex poisoned") = Some(connection.clone());
        tracing::debug!(peer = %self.tag, "Connected to follower");
        Ok(connection)
    }
}
