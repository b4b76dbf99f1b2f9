//! Voter side of elections: connection handshake and vote requests.

use crate::error::{RaftError, Result};
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::{ElectionResult, Hello, RequestVote, RequestVoteResponse};
use crate::raft::state::NodeState;

impl ConsensusEngine {
    /// Validate the first message of an incoming connection. A passive node
    /// adopts the tag the cluster addresses it by.
    pub fn handle_hello(&self, hello: &Hello) -> Result<()> {
        let topology = self.topology();
        if let Some(local) = &topology.topology_id {
            // a sender without an id belongs to no cluster, so it cannot speak for ours
            let remote = hello.topology_id.as_deref().unwrap_or("none");
            if local != remote {
                tracing::warn!(
                    source = %hello.source_tag,
                    local = %local,
                    remote = %remote,
                    "Rejected connection from another cluster"
                );
                return Err(RaftError::TopologyMismatch {
                    local: local.clone(),
                    remote: remote.to_string(),
                });
            }
        }

        let tag = self.tag();
        if hello.destination_tag != tag {
            if !topology.is_passive() {
                return Err(RaftError::InvalidOperation(format!(
                    "connection for {} reached {tag}",
                    hello.destination_tag
                )));
            }
            self.update_node_tag(&hello.destination_tag)?;
        }

        tracing::debug!(
            source = %hello.source_tag,
            kind = ?hello.initial_message_type,
            "Accepted connection"
        );
        Ok(())
    }

    pub fn handle_request_vote(&self, request: &RequestVote) -> Result<RequestVoteResponse> {
        let current_term = self.current_term();

        if let Some(result) = request.election_result {
            self.note_election_result(request, result)?;
            return Ok(RequestVoteResponse::denied(
                self.current_term(),
                format!("noted that {} {:?} term {}", request.source, result, request.term),
            ));
        }

        let topology = self.topology();
        if !topology.is_voter(&request.source) {
            return Ok(RequestVoteResponse {
                term: current_term,
                vote_granted: false,
                not_in_topology: true,
                message: format!("{} is not a voter in my topology", request.source),
            });
        }

        if !request.is_forced_election {
            if let Some(leader) = self.live_leader() {
                return Ok(RequestVoteResponse::denied(
                    current_term,
                    format!("leader {leader} is still alive"),
                ));
            }
        }

        let (last_index, last_term) = self.last_log_entry()?;
        let log_up_to_date = request.last_log_term > last_term
            || (request.last_log_term == last_term && request.last_log_index >= last_index);

        if request.is_trial_election {
            if request.term <= current_term {
                return Ok(RequestVoteResponse::denied(
                    current_term,
                    format!("trial term {} is not above my term {current_term}", request.term),
                ));
            }
            if !log_up_to_date {
                return Ok(log_behind(current_term, request, last_index, last_term));
            }
            return Ok(RequestVoteResponse::granted(
                current_term,
                "would vote for you",
            ));
        }

        if request.term < current_term {
            return Ok(RequestVoteResponse::denied(
                current_term,
                format!("term {} is behind my term {current_term}", request.term),
            ));
        }

        if request.term == current_term {
            return Ok(match self.voted_for()? {
                Some(voted) if voted == request.source => {
                    self.timer.reset();
                    RequestVoteResponse::granted(current_term, "already voted for you")
                }
                Some(voted) => RequestVoteResponse::denied(
                    current_term,
                    format!("already voted for {voted} in term {current_term}"),
                ),
                None => RequestVoteResponse::denied(
                    current_term,
                    format!("term {current_term} already started without you"),
                ),
            });
        }

        if !log_up_to_date {
            return Ok(log_behind(current_term, request, last_index, last_term));
        }

        let reason = format!("voted for {} in term {}", request.source, request.term);
        match self.grant_vote(request.term, &request.source, &reason) {
            Ok(()) => Ok(RequestVoteResponse::granted(request.term, reason)),
            // lost a race with another request for the same term
            Err(RaftError::Concurrency(message)) => Ok(RequestVoteResponse::denied(
                self.current_term(),
                message,
            )),
            Err(e) => Err(e),
        }
    }

    /// The closing message of a candidacy is bookkeeping only.
    fn note_election_result(&self, request: &RequestVote, result: ElectionResult) -> Result<()> {
        tracing::debug!(
            source = %request.source,
            term = request.term,
            ?result,
            "Received election result"
        );
        if result != ElectionResult::Won || request.source == self.tag() {
            return Ok(());
        }
        if request.term < self.current_term() {
            return Ok(());
        }
        self.found_about_higher_term(
            request.term,
            &format!("{} won term {}", request.source, request.term),
        )?;
        self.set_leader_tag(Some(request.source.clone()));
        if self.current_state() == NodeState::Follower {
            self.timer.reset();
        }
        Ok(())
    }

    /// The leader this node heard from within the last election timeout,
    /// or this node itself while it leads.
    fn live_leader(&self) -> Option<String> {
        match self.current_state() {
            NodeState::LeaderElect | NodeState::Leader => Some(self.tag()),
            NodeState::Follower => {
                let leader = self.leader_tag()?;
                (self.timer.since_last_reset() < self.timer.base()).then_some(leader)
            }
            _ => None,
        }
    }
}

fn log_behind(
    current_term: u64,
    request: &RequestVote,
    last_index: u64,
    last_term: u64,
) -> RequestVoteResponse {
    RequestVoteResponse::denied(
        current_term,
        format!(
            "my log ({last_index}, term {last_term}) is ahead of yours ({}, term {})",
            request.last_log_index, request.last_log_term
        ),
    )
}
