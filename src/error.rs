use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    /// Term or state moved under the caller. Always safe to retry.
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    #[error("Not the leader, current leader is {leader:?}")]
    NotLeading { leader: Option<String> },

    #[error(
        "Attempted to rewrite committed history at index {index} (term {term}), \
         committed index {commit_index} (term {commit_term}): {message}"
    )]
    FatalInvariant {
        index: u64,
        term: u64,
        commit_index: u64,
        commit_term: u64,
        message: String,
    },

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Topology mismatch: local topology {local}, remote topology {remote}")]
    TopologyMismatch { local: String, remote: String },

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("State machine failed to apply entry: {0}")]
    StateMachine(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl RaftError {
    /// Errors a caller may retry after the cluster settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RaftError::Concurrency(_) | RaftError::Connection(_) | RaftError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;
