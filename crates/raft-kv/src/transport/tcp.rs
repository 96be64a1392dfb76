//! # tcp transport
//!
//! why: connect nodes (and clients) running as separate processes
//! relations: implements Transport for node.rs; serve() feeds incoming frames to Node
//! what: length-delimited JSON frames, TcpTransport with one cached connection per peer, serve, request

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use raft_core::{ApplyResult, Command, NodeId, NodeStatus, RaftMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::Transport;
use crate::error::{KvError, TransportError};
use crate::node::Node;

pub type FramedStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Everything that can arrive on a node's listening socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// peer rpc
    Raft(RaftMessage),
    /// client proposal
    Propose(Command),
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameReply {
    Raft(RaftMessage),
    Applied(ApplyResult),
    NotLeader {
        leader_hint: Option<NodeId>,
        leader_addr: Option<String>,
    },
    Failed(String),
    Status(NodeStatus),
}

pub async fn write_frame<T: Serialize>(framed: &mut FramedStream, value: &T) -> Result<(), TransportError> {
    let bytes = serde_json::to_vec(value)?;
    framed.send(Bytes::from(bytes)).await?;
    Ok(())
}

/// Next frame, or None once the other side hung up
pub async fn read_frame<T: DeserializeOwned>(
    framed: &mut FramedStream,
) -> Result<Option<T>, TransportError> {
    match framed.next().await {
        None => Ok(None),
        Some(Ok(buf)) => Ok(Some(serde_json::from_slice(&buf)?)),
        Some(Err(e)) => Err(e.into()),
    }
}

async fn connect(addr: &str) -> io::Result<FramedStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(stream, LengthDelimitedCodec::new()))
}

/// One-shot client exchange, used by the kv-node client commands
pub async fn request(addr: &str, frame: &Frame) -> Result<FrameReply, TransportError> {
    let mut framed = connect(addr).await?;
    write_frame(&mut framed, frame).await?;
    read_frame(&mut framed).await?.ok_or(TransportError::Closed)
}

pub struct TcpTransport {
    addrs: HashMap<NodeId, String>,
    /// None while disconnected or while a request is in flight
    connections: HashMap<NodeId, Mutex<Option<FramedStream>>>,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(addrs: HashMap<NodeId, String>) -> Self {
        let connections = addrs.keys().map(|&id| (id, Mutex::new(None))).collect();
        Self {
            addrs,
            connections,
            closed: AtomicBool::new(false),
        }
    }

    async fn exchange(&self, peer: NodeId, frame: &Frame) -> Result<FrameReply, TransportError> {
        let (addr, slot) = self
            .addrs
            .get(&peer)
            .zip(self.connections.get(&peer))
            .ok_or(TransportError::UnknownPeer(peer))?;

        let mut slot = slot.lock().await;
        // taken out for the duration of the exchange: a cancelled call drops the
        // connection instead of leaving an unread reply on it
        let mut framed = match slot.take() {
            Some(framed) => framed,
            None => connect(addr)
                .await
                .map_err(|_| TransportError::Unreachable(peer))?,
        };
        write_frame(&mut framed, frame).await?;
        let reply = read_frame(&mut framed)
            .await?
            .ok_or(TransportError::Unreachable(peer))?;
        *slot = Some(framed);
        Ok(reply)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        match self.exchange(peer, &Frame::Raft(message)).await? {
            FrameReply::Raft(answer) => Ok(answer),
            FrameReply::Failed(reason) => Err(TransportError::UnexpectedResponse(reason)),
            other => Err(TransportError::UnexpectedResponse(format!("{other:?}"))),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in self.connections.values() {
            slot.lock().await.take();
        }
    }
}

// -- server side --

/// Accept peers and clients until `shutdown` fires
///
/// `peer_addrs` lets a follower turn its leader hint into an address for clients
pub async fn serve(
    listener: TcpListener,
    node: Node,
    peer_addrs: HashMap<NodeId, String>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let peer_addrs = Arc::new(peer_addrs);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                debug!(%remote, "connection accepted");
                tokio::spawn(handle_connection(
                    stream,
                    node.clone(),
                    peer_addrs.clone(),
                    shutdown.clone(),
                ));
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    node: Node,
    peer_addrs: Arc<HashMap<NodeId, String>>,
    shutdown: CancellationToken,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
    loop {
        let frame: Frame = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = read_frame(&mut framed) => match read {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "dropping connection");
                    break;
                }
            },
        };
        let reply = dispatch(&node, &peer_addrs, frame).await;
        if let Err(e) = write_frame(&mut framed, &reply).await {
            debug!(error = %e, "reply not delivered");
            break;
        }
    }
}

async fn dispatch(node: &Node, peer_addrs: &HashMap<NodeId, String>, frame: Frame) -> FrameReply {
    match frame {
        Frame::Raft(message) => match node.handle_message(message).await {
            Ok(answer) => FrameReply::Raft(answer),
            Err(e) => FrameReply::Failed(e.to_string()),
        },
        Frame::Propose(command) => match node.propose(command).await {
            Ok(result) => FrameReply::Applied(result),
            Err(KvError::NotLeader { leader_hint }) => FrameReply::NotLeader {
                leader_hint,
                leader_addr: leader_hint.and_then(|id| peer_addrs.get(&id).cloned()),
            },
            Err(e) => FrameReply::Failed(e.to_string()),
        },
        Frame::Status => FrameReply::Status(node.status()),
    }
}
