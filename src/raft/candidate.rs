//! Candidacy: trial rounds, real rounds and vote counting.
//!
//! Every round is published on a watch channel. One ambassador per voting
//! peer follows the channel, asks for the vote and reports back through
//! `progress`. A trial round runs at `term + 1` without persisting anything;
//! only a trial majority lets the candidate bump its term and vote for
//! itself.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::raft::ambassador::CandidateAmbassador;
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::ElectionResult;
use crate::raft::timer::random_election_timeout;
use crate::transport::RemoteConnection;

/// One round of voting, as seen by the ambassadors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ElectionRound {
    pub term: u64,
    pub trial: bool,
    pub forced: bool,
    /// Zero until the first round starts. Bumped on every new round.
    pub generation: u64,
}

pub(crate) struct Candidate {
    pub(super) engine: Arc<ConsensusEngine>,
    forced: AtomicBool,
    run_real_election_at_term: AtomicU64,
    pub(super) round: watch::Sender<ElectionRound>,
    pub(super) progress: Notify,
    pub(super) cancel: CancellationToken,
    ambassadors: Mutex<Vec<Arc<CandidateAmbassador>>>,
    result: Mutex<Option<ElectionResult>>,
    won_term: AtomicU64,
}

impl Candidate {
    pub(crate) fn new(engine: Arc<ConsensusEngine>, forced: bool) -> Arc<Self> {
        let cancel = engine.cancel.child_token();
        let (round, _) = watch::channel(ElectionRound::default());
        Arc::new(Self {
            engine,
            forced: AtomicBool::new(forced),
            run_real_election_at_term: AtomicU64::new(0),
            round,
            progress: Notify::new(),
            cancel,
            ambassadors: Mutex::new(Vec::new()),
            result: Mutex::new(None),
            won_term: AtomicU64::new(0),
        })
    }

    pub(crate) fn start(self: &Arc<Self>) {
        let candidate = self.clone();
        self.engine.tasks.spawn(async move { candidate.run().await });
    }

    /// End the candidacy. Ambassadors send the closing message and exit.
    pub(crate) fn dispose(&self) {
        self.result
            .lock()
            .expect("candidate mutex poisoned")
            .get_or_insert(ElectionResult::Lost);
        self.cancel.cancel();
    }

    pub(crate) fn result(&self) -> ElectionResult {
        self.result
            .lock()
            .expect("candidate mutex poisoned")
            .unwrap_or(ElectionResult::Lost)
    }

    /// Term this candidacy won, zero when it did not.
    pub(crate) fn won_term(&self) -> u64 {
        self.won_term.load(Ordering::Acquire)
    }

    pub(crate) fn is_forced(&self) -> bool {
        self.forced.load(Ordering::Acquire)
    }

    async fn run(self: Arc<Self>) {
        let engine = self.engine.clone();
        let topology = engine.topology();
        let self_tag = engine.tag();
        let majority = topology.majority();

        {
            let mut ambassadors = self.ambassadors.lock().expect("candidate mutex poisoned");
            for (tag, url) in topology.members.iter().filter(|(tag, _)| **tag != self_tag) {
                let ambassador = Arc::new(CandidateAmbassador::new(tag.clone(), url.clone()));
                ambassadors.push(ambassador.clone());
                engine.tasks.spawn(ambassador.run(self.clone()));
            }
        }

        if self.is_forced() {
            let term = engine.current_term() + 1;
            match engine.cast_vote_in_term(term, &self_tag, "forced election") {
                Ok(()) => self.run_real_election_at_term.store(term, Ordering::Release),
                Err(e) => {
                    tracing::debug!(error = %e, "Forced election fell back to a regular one");
                    self.forced.store(false, Ordering::Release);
                }
            }
        }

        let mut generation = 0;
        while !self.cancel.is_cancelled() {
            let current_term = engine.current_term();
            let forced = self.is_forced();
            let skip_trial =
                forced && self.run_real_election_at_term.load(Ordering::Acquire) == current_term;

            let election_term = if skip_trial {
                current_term
            } else {
                let trial_term = current_term + 1;
                generation += 1;
                self.publish_round(trial_term, true, false, generation);
                tracing::debug!(tag = %self_tag, term = trial_term, "Running trial election");
                if !self.wait_for_majority(trial_term, true, majority).await {
                    continue;
                }
                if let Err(e) = engine.cast_vote_in_term(trial_term, &self_tag, "won trial election")
                {
                    tracing::debug!(error = %e, "Term moved during trial election");
                    continue;
                }
                self.run_real_election_at_term
                    .store(trial_term, Ordering::Release);
                trial_term
            };

            generation += 1;
            self.publish_round(election_term, false, forced, generation);
            tracing::info!(tag = %self_tag, term = election_term, forced, "Running election");
            if self.wait_for_majority(election_term, false, majority).await {
                self.declare_victory(election_term);
                return;
            }
            // a forced round gets one shot, later rounds are regular
            self.forced.store(false, Ordering::Release);
        }
    }

    fn publish_round(&self, term: u64, trial: bool, forced: bool, generation: u64) {
        self.round.send_replace(ElectionRound {
            term,
            trial,
            forced,
            generation,
        });
    }

    /// Count votes (our own included) until a majority, a timeout or the end
    /// of the candidacy.
    async fn wait_for_majority(&self, term: u64, trial: bool, majority: usize) -> bool {
        let deadline = Instant::now() + random_election_timeout(self.engine.config.election_timeout_ms);
        loop {
            let notified = self.progress.notified();
            if self.cancel.is_cancelled() {
                return false;
            }
            let votes = 1 + self
                .ambassadors
                .lock()
                .expect("candidate mutex poisoned")
                .iter()
                .filter(|ambassador| ambassador.has_vote(term, trial))
                .count();
            if votes >= majority {
                tracing::debug!(term, trial, votes, majority, "Reached majority");
                return true;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::debug!(term, trial, votes, majority, "Election round timed out");
                    return false;
                }
                _ = self.cancel.cancelled() => return false,
            }
        }
    }

    fn declare_victory(&self, term: u64) {
        *self.result.lock().expect("candidate mutex poisoned") = Some(ElectionResult::Won);
        self.won_term.store(term, Ordering::Release);
        let connections: Vec<Arc<dyn RemoteConnection>> = self
            .ambassadors
            .lock()
            .expect("candidate mutex poisoned")
            .iter()
            .filter(|ambassador| ambassador.has_vote(term, false))
            .filter_map(|ambassador| ambassador.connection())
            .collect();

        match self
            .engine
            .switch_to_leader_state(term, connections, "won election")
        {
            Ok(()) => tracing::info!(tag = %self.engine.tag(), term, "Won election"),
            Err(e) => {
                *self.result.lock().expect("candidate mutex poisoned") = Some(ElectionResult::Lost);
                self.won_term.store(0, Ordering::Release);
                tracing::warn!(term, error = %e, "Won election but could not take over");
            }
        }
    }

    /// Per-peer status line, for diagnostics.
    pub(crate) fn ambassador_statuses(&self) -> Vec<(String, String)> {
        self.ambassadors
            .lock()
            .expect("candidate mutex poisoned")
            .iter()
            .map(|ambassador| (ambassador.tag().to_string(), ambassador.status()))
            .collect()
    }
}
