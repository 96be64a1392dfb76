//! # memory transport
//!
//! why: run whole clusters inside one process, with partitions on demand
//! relations: implements Transport; tests pair it with Node::serve_mailbox
//! what: MemoryNetwork router, MemoryTransport handle, Mailbox of incoming envelopes

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use raft_core::{NodeId, RaftMessage};
use tokio::sync::{mpsc, oneshot};

use super::Transport;
use crate::error::TransportError;

const MAILBOX_CAPACITY: usize = 256;

/// A request delivered to a node, with the channel its answer goes back on
#[derive(Debug)]
pub struct Envelope {
    pub from: NodeId,
    pub message: RaftMessage,
    pub reply: oneshot::Sender<RaftMessage>,
}

pub type Mailbox = mpsc::Receiver<Envelope>;

#[derive(Default)]
struct Routes {
    mailboxes: HashMap<NodeId, mpsc::Sender<Envelope>>,
    isolated: HashSet<NodeId>,
}

/// In-process router between nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id` to the network, replacing any earlier registration (a restart)
    pub fn register(&self, id: NodeId) -> (Arc<MemoryTransport>, Mailbox) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        self.lock().mailboxes.insert(id, tx);
        let transport = MemoryTransport {
            id,
            network: self.clone(),
            closed: AtomicBool::new(false),
        };
        (Arc::new(transport), rx)
    }

    /// Cut `id` off: everything it sends or is sent fails as unreachable
    pub fn isolate(&self, id: NodeId) {
        self.lock().isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        self.lock().isolated.remove(&id);
    }

    pub fn is_isolated(&self, id: NodeId) -> bool {
        self.lock().isolated.contains(&id)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<mpsc::Sender<Envelope>, TransportError> {
        let routes = self.lock();
        if routes.isolated.contains(&from) || routes.isolated.contains(&to) {
            return Err(TransportError::Unreachable(to));
        }
        routes
            .mailboxes
            .get(&to)
            .cloned()
            .ok_or(TransportError::UnknownPeer(to))
    }
}

/// One node's handle on a MemoryNetwork
pub struct MemoryTransport {
    id: NodeId,
    network: MemoryNetwork,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let mailbox = self.network.route(self.id, peer)?;
        let (reply, response) = oneshot::channel();
        let envelope = Envelope {
            from: self.id,
            message,
            reply,
        };
        mailbox
            .send(envelope)
            .await
            .map_err(|_| TransportError::Unreachable(peer))?;
        let answer = response.await.map_err(|_| TransportError::Unreachable(peer))?;

        // the partition may have started while the request was in flight
        if self.network.route(self.id, peer).is_err() {
            return Err(TransportError::Unreachable(peer));
        }
        Ok(answer)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
