//! Per-peer vote solicitation on behalf of a candidate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use crate::error::{RaftError, Result};
use crate::raft::candidate::{Candidate, ElectionRound};
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::{ElectionResult, Hello, InitialMessageType, RequestVote};
use crate::transport::RemoteConnection;

pub(crate) struct CandidateAmbassador {
    tag: String,
    url: String,
    trial_won_at: AtomicU64,
    real_won_at: AtomicU64,
    connection: Mutex<Option<Arc<dyn RemoteConnection>>>,
    status: Mutex<String>,
}

impl CandidateAmbassador {
    pub(crate) fn new(tag: String, url: String) -> Self {
        Self {
            tag,
            url,
            trial_won_at: AtomicU64::new(0),
            real_won_at: AtomicU64::new(0),
            connection: Mutex::new(None),
            status: Mutex::new("started".to_string()),
        }
    }

    pub(crate) fn tag(&self) -> &str {
        &self.tag
    }

    pub(crate) fn status(&self) -> String {
        self.status.lock().expect("ambassador mutex poisoned").clone()
    }

    fn set_status(&self, status: impl Into<String>) {
        *self.status.lock().expect("ambassador mutex poisoned") = status.into();
    }

    /// Whether the peer granted its vote for `term` in the given kind of round.
    pub(crate) fn has_vote(&self, term: u64, trial: bool) -> bool {
        let won_at = if trial {
            &self.trial_won_at
        } else {
            &self.real_won_at
        };
        won_at.load(Ordering::Acquire) == term
    }

    pub(crate) fn connection(&self) -> Option<Arc<dyn RemoteConnection>> {
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

    pub(crate) async fn run(self: Arc<Self>, candidate: Arc<Candidate>) {
        let mut rounds = candidate.round.subscribe();
        if let Err(e) = self.campaign(&candidate, &mut rounds).await {
            self.set_status(format!("stopped: {e}"));
            tracing::debug!(peer = %self.tag, error = %e, "Ambassador stopped campaigning");
        }
        self.finish(&candidate).await;
    }

    async fn campaign(
        &self,
        candidate: &Candidate,
        rounds: &mut watch::Receiver<ElectionRound>,
    ) -> Result<()> {
        let engine = &candidate.engine;
        let retry_delay = engine.config.heartbeat_interval();

        while !candidate.cancel.is_cancelled() {
            let round = *rounds.borrow_and_update();
            if round.generation == 0 || self.has_vote(round.term, round.trial) {
                if !next_round(candidate, rounds, None).await {
                    break;
                }
                continue;
            }

            let connection = match self.connection() {
                Some(connection) => connection,
                None => match self.connect(engine).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        self.set_status(format!("cannot connect: {e}"));
                        tracing::debug!(peer = %self.tag, error = %e, "Failed to connect to voter");
                        if !next_round(candidate, rounds, Some(retry_delay)).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let (last_log_index, last_log_term) = engine.last_log_entry()?;
            let request = RequestVote {
                source: engine.tag(),
                term: round.term,
                is_forced_election: round.forced,
                is_trial_election: round.trial,
                last_log_index,
                last_log_term,
                election_result: None,
            };
            let response = match connection.request_vote(request).await {
                Ok(response) => response,
                Err(e) => {
                    self.drop_connection();
                    self.set_status(format!("request failed: {e}"));
                    tracing::debug!(peer = %self.tag, error = %e, "Vote request failed");
                    if !next_round(candidate, rounds, Some(retry_delay)).await {
                        break;
                    }
                    continue;
                }
            };

            // the candidate itself is still at term - 1 during a trial round
            let candidate_term = if round.trial { round.term - 1 } else { round.term };
            if response.term > candidate_term {
                if candidate.cancel.is_cancelled() {
                    break;
                }
                self.set_status(format!("peer is at term {}", response.term));
                engine.found_about_higher_term(
                    response.term,
                    &format!("{} responded with term {}", self.tag, response.term),
                )?;
                return Err(RaftError::Concurrency(format!(
                    "{} is at term {}, ahead of candidate term {candidate_term}",
                    self.tag, response.term
                )));
            }

            if response.vote_granted {
                let won_at = if round.trial {
                    &self.trial_won_at
                } else {
                    &self.real_won_at
                };
                won_at.store(round.term, Ordering::Release);
                self.set_status(format!("vote granted for term {}", round.term));
                candidate.progress.notify_one();
            } else if response.not_in_topology {
                self.set_status("candidate is not in the peer's topology");
                tracing::warn!(peer = %self.tag, reason = %response.message, "Voter does not know us");
            } else {
                self.set_status(format!("vote denied: {}", response.message));
                tracing::debug!(
                    peer = %self.tag,
                    term = round.term,
                    trial = round.trial,
                    reason = %response.message,
                    "Vote denied"
                );
            }

            if !next_round(candidate, rounds, None).await {
                break;
            }
        }
        Ok(())
    }

    async fn connect(&self, engine: &ConsensusEngine) -> Result<Arc<dyn RemoteConnection>> {
        let connection = engine.transport.connect(&self.tag, &self.url).await?;
        let hello = Hello {
            topology_id: engine.topology().topology_id.clone(),
            source_tag: engine.tag(),
            destination_tag: self.tag.clone(),
            destination_url: self.url.clone(),
            initial_message_type: InitialMessageType::RequestVote,
        };
        if let Err(e) = connection.hello(hello).await {
            connection.close();
            return Err(e);
        }
        *self.connection.lock().expect("ambassador mutex poisoned") = Some(connection.clone());
        Ok(connection)
    }

    /// Tell the peer how the candidacy ended. The connection stays open only
    /// when it was handed to the new leader.
    async fn finish(&self, candidate: &Candidate) {
        let Some(connection) = self.connection() else {
            return;
        };
        let engine = &candidate.engine;
        let result = candidate.result();
        let won_term = candidate.won_term();
        let handed_over = result == ElectionResult::Won && self.has_vote(won_term, false);

        let (last_log_index, last_log_term) = engine.last_log_entry().unwrap_or((0, 0));
        let closing = RequestVote {
            source: engine.tag(),
            term: if won_term > 0 { won_term } else { engine.current_term() },
            is_forced_election: false,
            is_trial_election: false,
            last_log_index,
            last_log_term,
            election_result: Some(result),
        };
        if let Err(e) = connection.request_vote(closing).await {
            tracing::debug!(peer = %self.tag, error = %e, "Could not send election result");
        }
        if !handed_over {
            self.drop_connection();
        }
    }
}

/// Wait for the next round, or `delay` when set. False once the candidacy
/// is over.
async fn next_round(
    candidate: &Candidate,
    rounds: &mut watch::Receiver<ElectionRound>,
    delay: Option<Duration>,
) -> bool {
    let sleep = async {
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        changed = rounds.changed() => changed.is_ok(),
        _ = sleep => true,
        _ = candidate.cancel.cancelled() => false,
    }
}
