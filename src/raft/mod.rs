mod ambassador;
mod candidate;
mod elector;
pub mod engine;
mod follower;
mod leader;
pub mod rpc;
pub mod state;
pub mod timer;

pub use engine::{CommitIndexModification, ConsensusEngine, ElectionKind};
pub use state::{CommitPoint, EntryFlags, LogEntry, NodeState, StateSnapshot, StateTransition};
