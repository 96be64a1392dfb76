//! # raft-kv
//!
//! why: run raft-core as a replicated key-value service
//! relations: drives raft-core, persists through raft-storage, talks to peers over transport/
//! what: Node runtime (elections, replication, apply), transports, node config, kv-node binary

mod apply;
pub mod config;
mod election;
pub mod error;
pub mod node;
mod replication;
pub mod timer;
pub mod transport;

pub use config::{parse_peers, NodeConfig, PeerConfig};
pub use error::{KvError, Result, TransportError};
pub use node::{Node, NodeBuilder};
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
