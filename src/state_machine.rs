//! Capability implemented by the application that consumes committed entries.

use crate::error::Result;
use crate::raft::state::{CommitPoint, LogEntry};

pub trait StateMachine: Send + Sync + 'static {
    /// Called once when the engine opens, with the last committed point.
    fn initialize(&self, _last_commit: CommitPoint) -> Result<()> {
        Ok(())
    }

    /// Apply a committed `Normal` entry, in index order, exactly once.
    fn apply(&self, entry: &LogEntry) -> Result<Vec<u8>>;

    /// Asked after each applied batch. Returning `true` lets the engine
    /// discard log history up to `index`.
    fn should_snapshot(&self, _index: u64, _term: u64) -> bool {
        false
    }

    /// The leader skipped this node ahead to `(index, term)`.
    fn on_snapshot_installed(&self, _index: u64, _term: u64) -> Result<()> {
        Ok(())
    }
}

/// Discards every command. Handy when only membership is replicated.
#[derive(Debug, Default)]
pub struct NoopStateMachine;

impl StateMachine for NoopStateMachine {
    fn apply(&self, _entry: &LogEntry) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}
