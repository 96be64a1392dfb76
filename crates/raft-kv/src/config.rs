//! # config
//!
//! why: describe one node of a cluster: who it is, where it listens, who its peers are
//! relations: built by the kv-node binary, consumed by NodeBuilder and the tcp transport
//! what: NodeConfig, PeerConfig, parse_peers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use raft_core::{NodeId, RaftConfig};

use crate::error::{KvError, Result};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    /// directory holding meta.json, log.jsonl and snapshot.json
    pub data_dir: PathBuf,
    /// upper bound for a single peer rpc
    pub rpc_timeout_ms: u64,
    pub raft: RaftConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub node_id: NodeId,
    pub addr: String, // host:port, hostnames allowed
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7001)),
            peers: Vec::new(),
            data_dir: PathBuf::from("data"),
            rpc_timeout_ms: 100,
            raft: RaftConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: NodeId, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: NodeId, addr: impl Into<String>) -> Self {
        self.peers.push(PeerConfig {
            node_id,
            addr: addr.into(),
        });
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn peer_ids(&self) -> Vec<NodeId> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    pub fn peer_addrs(&self) -> HashMap<NodeId, String> {
        self.peers
            .iter()
            .map(|p| (p.node_id, p.addr.clone()))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.raft.validate()?;
        if self.rpc_timeout_ms == 0 {
            return Err(KvError::Config("rpc_timeout_ms must be positive".to_string()));
        }
        let mut seen = vec![self.node_id];
        for peer in &self.peers {
            if seen.contains(&peer.node_id) {
                return Err(KvError::Config(format!(
                    "node id {} appears more than once",
                    peer.node_id
                )));
            }
            seen.push(peer.node_id);
        }
        Ok(())
    }
}

/// Parse `"2=127.0.0.1:7002,3=node3:7003"` into peer entries
pub fn parse_peers(spec: &str) -> Result<Vec<PeerConfig>> {
    spec.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (id, addr) = part
                .split_once('=')
                .ok_or_else(|| KvError::Config(format!("expected id=host:port, got {part:?}")))?;
            let node_id = id
                .trim()
                .parse()
                .map_err(|_| KvError::Config(format!("invalid node id in {part:?}")))?;
            let addr = addr.trim();
            if !addr.contains(':') {
                return Err(KvError::Config(format!("missing port in {part:?}")));
            }
            Ok(PeerConfig {
                node_id,
                addr: addr.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_config_default() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.node_id, 1);
        assert_eq!(cfg.rpc_timeout_ms, 100);
        assert_eq!(cfg.raft, RaftConfig::default());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn node_config_with_peer() {
        let cfg = NodeConfig::default()
            .with_peer(2, "127.0.0.1:7002")
            .with_peer(3, "127.0.0.1:7003");
        assert_eq!(cfg.peer_ids(), vec![2, 3]);
        assert_eq!(cfg.peer_addrs()[&3], "127.0.0.1:7003");
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let cfg = NodeConfig::default().with_peer(1, "127.0.0.1:7002");
        assert!(matches!(cfg.validate(), Err(KvError::Config(_))));
    }

    #[test]
    fn parse_peer_list() {
        let peers = parse_peers("2=127.0.0.1:7002, 3=node3:7003").unwrap();
        assert_eq!(
            peers,
            vec![
                PeerConfig {
                    node_id: 2,
                    addr: "127.0.0.1:7002".to_string()
                },
                PeerConfig {
                    node_id: 3,
                    addr: "node3:7003".to_string()
                },
            ]
        );
    }

    #[test]
    fn parse_empty_peer_list() {
        assert!(parse_peers("").unwrap().is_empty());
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        assert!(parse_peers("2:127.0.0.1:7002").is_err());
        assert!(parse_peers("x=127.0.0.1:7002").is_err());
        assert!(parse_peers("2=localhost").is_err());
    }
}
