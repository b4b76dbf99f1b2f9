//! Messages exchanged between nodes. Transport-agnostic; every type is
//! serde-serializable so a network transport can frame them as it likes.

use serde::{Deserialize, Serialize};

use crate::raft::state::LogEntry;
use crate::topology::ClusterTopology;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialMessageType {
    RequestVote,
    AppendEntries,
}

/// First message on every new connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub topology_id: Option<String>,
    pub source_tag: String,
    pub destination_tag: String,
    pub destination_url: String,
    pub initial_message_type: InitialMessageType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ElectionResult {
    Won,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVote {
    pub source: String,
    pub term: u64,
    pub is_forced_election: bool,
    pub is_trial_election: bool,
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// Set on the closing message of a candidacy, for the peer's bookkeeping.
    pub election_result: Option<ElectionResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: u64,
    pub vote_granted: bool,
    pub not_in_topology: bool,
    pub message: String,
}

impl RequestVoteResponse {
    pub fn denied(term: u64, message: impl Into<String>) -> Self {
        Self {
            term,
            vote_granted: false,
            not_in_topology: false,
            message: message.into(),
        }
    }

    pub fn granted(term: u64, message: impl Into<String>) -> Self {
        Self {
            term,
            vote_granted: true,
            not_in_topology: false,
            message: message.into(),
        }
    }
}

/// Lets a follower skip history the leader no longer has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMarker {
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub topology: ClusterTopology,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntries {
    pub term: u64,
    pub leader_tag: String,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
    pub snapshot: Option<SnapshotMarker>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub current_term: u64,
    pub success: bool,
    /// Follower's last index after processing, used as the match/next hint.
    pub last_log_index: u64,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::state::EntryFlags;

    #[test]
    fn request_vote_json_shape() {
        let rv = RequestVote {
            source: "A".into(),
            term: 3,
            is_forced_election: false,
            is_trial_election: true,
            last_log_index: 7,
            last_log_term: 2,
            election_result: None,
        };
        let json = serde_json::to_value(&rv).unwrap();
        assert_eq!(json["is_trial_election"], true);
        assert_eq!(json["election_result"], serde_json::Value::Null);
        let back: RequestVote = serde_json::from_value(json).unwrap();
        assert_eq!(back, rv);
    }

    #[test]
    fn append_entries_carries_entries_and_flags() {
        let ae = AppendEntries {
            term: 2,
            leader_tag: "A".into(),
            prev_log_index: 1,
            prev_log_term: 1,
            entries: vec![LogEntry::new(2, 2, vec![1, 2, 3], EntryFlags::Topology)],
            leader_commit: 1,
            snapshot: None,
        };
        let raw = serde_json::to_vec(&ae).unwrap();
        let back: AppendEntries = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.entries[0].flags, EntryFlags::Topology);
    }

    #[test]
    fn vote_response_helpers() {
        assert!(RequestVoteResponse::granted(4, "ok").vote_granted);
        let denied = RequestVoteResponse::denied(4, "stale");
        assert!(!denied.vote_granted);
        assert!(!denied.not_in_topology);
        assert_eq!(denied.message, "stale");
    }
}
