//! # raft-core
//!
//! why: implement the core raft consensus algorithm in pure, portable rust
//! relations: driven by raft-kv (timers, transport, persistence), persisted via raft-storage
//! what: role state machine, election logic, log replication, commit and snapshot bookkeeping

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod node;
pub mod snapshot;
pub mod state_machine;
pub mod status;

pub use config::RaftConfig;
pub use error::RaftError;
pub use log::{Command, LogEntry, Operation};
pub use message::RaftMessage;
pub use node::{AppendOutcome, HardState, InstallOutcome, LogChange, NodeId, NodeState, RaftNode};
pub use snapshot::Snapshot;
pub use state_machine::{apply_entry, ApplyResult, MemoryStateMachine, StateMachine};
pub use status::NodeStatus;
