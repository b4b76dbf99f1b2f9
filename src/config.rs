use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a single consensus engine.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Url other nodes use to reach this one.
    pub url: String,
    /// SQLite database file. `None` keeps the state in memory.
    pub db_path: Option<PathBuf>,
    /// Base election timeout. The effective timeout is drawn uniformly
    /// from `[2/3 * base, base]` every time the timer is armed.
    pub election_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Maximum number of entries shipped in a single AppendEntries.
    pub max_append_entries_batch: usize,
    /// Upper bound for topology changes and `put` round trips.
    pub operation_timeout_ms: u64,
    /// Number of state transitions kept for diagnostics.
    pub state_history_len: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            url: "local://node".to_string(),
            db_path: None,
            election_timeout_ms: 300,
            heartbeat_interval_ms: 50,
            max_append_entries_batch: 128,
            operation_timeout_ms: 15_000,
            state_history_len: 32,
        }
    }
}

impl RaftConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = Some(path.into());
        self
    }

    pub fn with_election_timeout_ms(mut self, ms: u64) -> Self {
        self.election_timeout_ms = ms;
        self
    }

    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    pub fn with_operation_timeout_ms(mut self, ms: u64) -> Self {
        self.operation_timeout_ms = ms;
        self
    }

    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.election_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}
