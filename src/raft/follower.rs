//! Follower side of replication.

use crate::error::{RaftError, Result};
use crate::raft::engine::ConsensusEngine;
use crate::raft::rpc::{AppendEntries, AppendEntriesResponse};
use crate::raft::state::{LogEntry, NodeState};
use crate::topology::ClusterTopology;

impl ConsensusEngine {
    pub fn handle_append_entries(&self, request: &AppendEntries) -> Result<AppendEntriesResponse> {
        let current_term = self.current_term();
        if request.term < current_term {
            return Ok(AppendEntriesResponse {
                current_term,
                success: false,
                last_log_index: self.get_last_entry_index()?,
                message: format!("term {} is behind my term {current_term}", request.term),
            });
        }

        let reason = format!("{} is leading term {}", request.leader_tag, request.term);
        if request.term > current_term {
            self.found_about_higher_term(request.term, &reason)?;
        }
        match self.current_state() {
            NodeState::Passive | NodeState::Follower => {}
            _ => self.set_new_state(NodeState::Follower, Some(request.term), &reason)?,
        }
        if self.current_state() == NodeState::Follower {
            self.timer.reset();
        }
        self.set_leader_tag(Some(request.leader_tag.clone()));

        if let Some(snapshot) = &request.snapshot {
            self.install_snapshot(
                snapshot.last_included_index,
                snapshot.last_included_term,
                &snapshot.topology,
            )?;
            if self.adopt_topology(snapshot.topology.clone(), true)? == TopologyOutcome::Removed {
                return Ok(removed_response(self.current_term(), request.prev_log_index));
            }
        }

        // anything at or below our commit index is committed, and a leader's
        // log holds every committed entry
        if request.prev_log_index > self.commit_index() {
            let matches = self.get_term_for(request.prev_log_index)? == Some(request.prev_log_term);
            if !matches {
                let last = self.get_last_entry_index()?;
                let hint = if request.prev_log_index > last {
                    last
                } else {
                    request.prev_log_index - 1
                };
                tracing::debug!(
                    leader = %request.leader_tag,
                    prev_log_index = request.prev_log_index,
                    prev_log_term = request.prev_log_term,
                    hint,
                    "Log does not match leader"
                );
                return Ok(AppendEntriesResponse {
                    current_term: self.current_term(),
                    success: false,
                    last_log_index: hint,
                    message: format!(
                        "no entry {} with term {}",
                        request.prev_log_index, request.prev_log_term
                    ),
                });
            }
        }

        let last_new = request.prev_log_index + request.entries.len() as u64;
        let written = match self.append_to_log(&request.entries) {
            Ok(written) => written,
            Err(e @ RaftError::FatalInvariant { .. }) => {
                tracing::error!(
                    tag = %self.tag(),
                    leader = %request.leader_tag,
                    term = request.term,
                    error = %e,
                    "Leader attempted to rewrite committed history, aborting"
                );
                std::process::abort();
            }
            Err(e) => return Err(e),
        };

        if let Some(entry) = written {
            let topology: ClusterTopology = serde_json::from_slice(&entry.entry)?;
            self.adopt_topology(topology, false)?;
        }

        let previous_commit = self.commit_index();
        let commit_upto = request.leader_commit.min(last_new);
        if commit_upto > previous_commit {
            // looked up before committing, a snapshot may discard the entry
            let committed_topology = self.last_topology_entry_between(previous_commit, commit_upto)?;
            self.commit_and_apply(commit_upto)?;
            if let Some(entry) = committed_topology {
                if self.adopt_committed_topology(&entry)? == TopologyOutcome::Removed {
                    return Ok(removed_response(self.current_term(), last_new));
                }
            }
        }

        Ok(AppendEntriesResponse {
            current_term: self.current_term(),
            success: true,
            last_log_index: last_new,
            message: String::new(),
        })
    }

    /// Apply a topology received from the leader. A passive node joins once
    /// it finds itself in the topology. A member missing from it keeps its
    /// log until the removal is committed, as a new leader may overwrite it.
    fn adopt_topology(&self, topology: ClusterTopology, committed: bool) -> Result<TopologyOutcome> {
        let tag = self.tag();
        let state = self.current_state();
        if topology.contains(&tag) {
            self.set_topology(topology)?;
            if state == NodeState::Passive {
                self.set_new_state(NodeState::Follower, None, "joined cluster")?;
            }
            return Ok(TopologyOutcome::Member);
        }
        if state == NodeState::Passive {
            // history from before this node was added
            return Ok(TopologyOutcome::NotYetMember);
        }
        if !committed {
            tracing::info!(
                tag = %tag,
                "Removed by an uncommitted topology entry, waiting for it to commit"
            );
            return Ok(TopologyOutcome::RemovalPending);
        }
        self.hard_reset_to_passive("removed from the cluster")?;
        Ok(TopologyOutcome::Removed)
    }

    /// Only a removal is acted on: membership and roles were already adopted
    /// when the entry was appended. A later topology entry that lists this
    /// node (its own join, say) supersedes the committed one.
    fn adopt_committed_topology(&self, entry: &LogEntry) -> Result<TopologyOutcome> {
        let tag = self.tag();
        let topology: ClusterTopology = serde_json::from_slice(&entry.entry)?;
        if topology.contains(&tag) {
            return Ok(TopologyOutcome::Member);
        }
        let last = self.get_last_entry_index()?;
        if let Some(later) = self.last_topology_entry_between(entry.index, last)? {
            let later: ClusterTopology = serde_json::from_slice(&later.entry)?;
            if later.contains(&tag) {
                return Ok(TopologyOutcome::Member);
            }
        }
        self.adopt_topology(topology, true)
    }
}

fn removed_response(current_term: u64, last_log_index: u64) -> AppendEntriesResponse {
    AppendEntriesResponse {
        current_term,
        success: true,
        last_log_index,
        message: "removed from the cluster".to_string(),
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TopologyOutcome {
    Member,
    NotYetMember,
    RemovalPending,
    Removed,
}
