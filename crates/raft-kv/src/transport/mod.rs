//! # transport
//!
//! why: carry raft rpcs between nodes without the node knowing how
//! relations: called by node.rs for every outgoing rpc; incoming requests reach Node::handle_message
//! what: Transport trait, in-process MemoryNetwork, TCP transport and server
//!
//! a transport never holds a reference to the node it serves. responses travel
//! back through the call that sent the request.

pub mod memory;
pub mod tcp;

use async_trait::async_trait;
use raft_core::{NodeId, RaftMessage};

use crate::error::TransportError;

pub use memory::{Envelope, Mailbox, MemoryNetwork, MemoryTransport};
pub use tcp::{Frame, FrameReply, TcpTransport};

/// Point-to-point request/response delivery
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a request to `peer` and wait for its answer
    async fn send(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError>;

    /// Stop sending; later calls fail with `TransportError::Closed`
    async fn close(&self);
}
