use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consensus role of the local node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Not part of any cluster yet (no topology id).
    Passive,
    Candidate,
    Follower,
    /// Won an election, office not taken until its first entry commits.
    LeaderElect,
    Leader,
}

impl NodeState {
    pub fn is_leader_like(self) -> bool {
        matches!(self, NodeState::LeaderElect | NodeState::Leader)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Passive => write!(f, "passive"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Follower => write!(f, "follower"),
            NodeState::LeaderElect => write!(f, "leader-elect"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// Semantic flag stored next to every log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EntryFlags {
    Invalid = 0,
    /// Opaque command for the state machine.
    Normal = 1,
    /// Payload is a serialized `ClusterTopology`.
    Topology = 2,
    /// Appended by a new leader to commit entries of earlier terms.
    Noop = 3,
}

impl EntryFlags {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => EntryFlags::Normal,
            2 => EntryFlags::Topology,
            3 => EntryFlags::Noop,
            _ => EntryFlags::Invalid,
        }
    }
}

/// A single entry in the Raft log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub entry: Vec<u8>,
    pub flags: EntryFlags,
}

impl LogEntry {
    pub fn new(index: u64, term: u64, entry: Vec<u8>, flags: EntryFlags) -> Self {
        Self {
            index,
            term,
            entry,
            flags,
        }
    }
}

/// One recorded state change, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from: NodeState,
    pub to: NodeState,
    pub term: u64,
    pub reason: String,
    pub when: DateTime<Utc>,
}

/// Snapshot published on every state or term change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub state: NodeState,
    pub term: u64,
}

/// `(index, term)` pair of the last committed entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitPoint {
    pub index: u64,
    pub term: u64,
}
