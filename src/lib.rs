pub mod config;
pub mod error;
pub mod raft;
pub mod state_machine;
pub mod storage;
pub mod topology;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, Result};
pub use raft::{ConsensusEngine, NodeState};
pub use state_machine::StateMachine;
pub use topology::{ClusterTopology, TopologyModification};
