//! # error
//!
//! why: one error surface for clients of a running node
//! relations: wraps raft-core's RaftError, storage io errors and transport failures
//! what: KvError, TransportError, Result alias

use std::io;

use raft_core::{NodeId, RaftError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvError {
    /// proposal reached a node that is not the leader
    #[error("not the leader, last known leader is {leader_hint:?}")]
    NotLeader { leader_hint: Option<NodeId> },

    /// replication could not reach a majority or leadership was lost;
    /// the entry may still commit later
    #[error("consensus error: {0}")]
    Consensus(String),

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("raft error: {0}")]
    Raft(#[from] RaftError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is shutting down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, KvError>;

/// Failure to get a response from a peer; always non-fatal to the caller's node
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("no address known for node {0}")]
    UnknownPeer(NodeId),

    #[error("node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("request to node {0} timed out")]
    Timeout(NodeId),

    #[error("io error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("transport closed")]
    Closed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Codec(err.to_string())
    }
}
