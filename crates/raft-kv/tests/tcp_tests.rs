//! # tcp tests
//!
//! why: verify nodes and clients talk correctly over real sockets
//! relations: exercises raft-kv's tcp transport and server
//! what: frame exchange, client requests, leader redirects, peer rpc over tcp

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use raft_core::{ApplyResult, Command, NodeId, NodeState, RaftConfig, RaftMessage};
use raft_kv::transport::tcp::{self, read_frame, write_frame, Frame, FrameReply};
use raft_kv::{Node, TcpTransport, Transport, TransportError};
use tokio::net::TcpListener;
use tokio::time::{sleep, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn fast_config() -> RaftConfig {
    RaftConfig {
        election_timeout_min: 150,
        election_timeout_max: 300,
        heartbeat_interval: 20,
        snapshot_threshold: 1000,
    }
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (listener, addr)
}

async fn wait_for_role(node: &Node, role: NodeState) {
    let deadline = Instant::now() + WAIT;
    while node.status().role != role {
        assert!(Instant::now() < deadline, "node {} never became {role}", node.id());
        sleep(Duration::from_millis(10)).await;
    }
}

// =============================================================================
// SECTION 1: FRAMING TESTS
// =============================================================================

mod framing {
    use super::*;

    #[tokio::test]
    async fn request_gets_the_server_reply() {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let frame: Frame = read_frame(&mut framed).await.unwrap().unwrap();
            assert_eq!(frame, Frame::Propose(Command::put("k", "v")));
            write_frame(&mut framed, &FrameReply::Applied(ApplyResult::Ok))
                .await
                .unwrap();
        });

        let reply = tcp::request(&addr, &Frame::Propose(Command::put("k", "v")))
            .await
            .unwrap();
        assert_eq!(reply, FrameReply::Applied(ApplyResult::Ok));
    }

    #[tokio::test]
    async fn server_hanging_up_is_reported_as_closed() {
        let (listener, addr) = bind().await;
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
            let _: Option<Frame> = read_frame(&mut framed).await.unwrap();
            drop(framed);
        });

        assert_eq!(
            tcp::request(&addr, &Frame::Status).await,
            Err(TransportError::Closed)
        );
    }

    #[tokio::test]
    async fn unknown_peer_and_unreachable_peer() {
        let (listener, addr) = bind().await;
        drop(listener);
        let transport = TcpTransport::new(HashMap::from([(2, addr)]));
        let heartbeat = RaftMessage::AppendEntries {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };

        assert_eq!(
            transport.send(9, heartbeat.clone()).await,
            Err(TransportError::UnknownPeer(9))
        );
        assert_eq!(
            transport.send(2, heartbeat.clone()).await,
            Err(TransportError::Unreachable(2))
        );

        transport.close().await;
        assert_eq!(transport.send(2, heartbeat).await, Err(TransportError::Closed));
    }
}

// =============================================================================
// SECTION 2: SERVER TESTS
// =============================================================================

mod server {
    use super::*;

    #[tokio::test]
    async fn single_node_serves_clients() {
        let (listener, addr) = bind().await;
        let transport = Arc::new(TcpTransport::new(HashMap::new()));
        let node = Node::builder(1, vec![])
            .raft_config(fast_config())
            .start(transport)
            .unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(tcp::serve(listener, node.clone(), HashMap::new(), shutdown.clone()));
        wait_for_role(&node, NodeState::Leader).await;

        let put = tcp::request(&addr, &Frame::Propose(Command::put("x", "1")))
            .await
            .unwrap();
        assert_eq!(put, FrameReply::Applied(ApplyResult::Ok));

        let get = tcp::request(&addr, &Frame::Propose(Command::get("x")))
            .await
            .unwrap();
        assert_eq!(get, FrameReply::Applied(ApplyResult::Value(Some("1".to_string()))));

        match tcp::request(&addr, &Frame::Status).await.unwrap() {
            FrameReply::Status(status) => {
                assert_eq!(status.role, NodeState::Leader);
                assert_eq!(status.commit_index, 2);
            }
            other => panic!("expected status, got {other:?}"),
        }

        shutdown.cancel();
        node.shutdown().await;
    }

    #[tokio::test]
    async fn three_node_cluster_over_tcp() {
        let members: [NodeId; 3] = [1, 2, 3];
        let mut listeners = Vec::new();
        let mut addrs = HashMap::new();
        for &id in &members {
            let (listener, addr) = bind().await;
            listeners.push(listener);
            addrs.insert(id, addr);
        }

        let shutdown = CancellationToken::new();
        let mut nodes = Vec::new();
        for (&id, listener) in members.iter().zip(listeners) {
            let peer_addrs: HashMap<NodeId, String> = addrs
                .iter()
                .filter(|(peer, _)| **peer != id)
                .map(|(&peer, addr)| (peer, addr.clone()))
                .collect();
            let node = Node::builder(id, peer_addrs.keys().copied().collect())
                .raft_config(fast_config())
                .rpc_timeout(Duration::from_millis(200))
                .start(Arc::new(TcpTransport::new(peer_addrs.clone())))
                .unwrap();
            tokio::spawn(tcp::serve(listener, node.clone(), peer_addrs, shutdown.clone()));
            nodes.push(node);
        }

        let deadline = Instant::now() + WAIT;
        let leader = loop {
            let leaders: Vec<&Node> = nodes
                .iter()
                .filter(|n| n.status().role == NodeState::Leader)
                .collect();
            if let [leader] = leaders.as_slice() {
                break (*leader).clone();
            }
            assert!(Instant::now() < deadline, "no leader over tcp");
            sleep(Duration::from_millis(10)).await;
        };
        let follower = nodes.iter().find(|n| n.id() != leader.id()).unwrap();
        while follower.status().current_leader != Some(leader.id()) {
            assert!(Instant::now() < deadline, "follower never learned the leader");
            sleep(Duration::from_millis(10)).await;
        }

        let frame = Frame::Propose(Command::put("x", "1"));
        match tcp::request(&addrs[&follower.id()], &frame).await.unwrap() {
            FrameReply::NotLeader {
                leader_hint,
                leader_addr,
            } => {
                assert_eq!(leader_hint, Some(leader.id()));
                assert_eq!(leader_addr.as_ref(), Some(&addrs[&leader.id()]));
            }
            other => panic!("expected redirect, got {other:?}"),
        }

        let reply = tcp::request(&addrs[&leader.id()], &frame).await.unwrap();
        assert_eq!(reply, FrameReply::Applied(ApplyResult::Ok));

        for node in &nodes {
            let deadline = Instant::now() + WAIT;
            while node.local_get("x").await.as_deref() != Some("1") {
                assert!(Instant::now() < deadline, "node {} missed the write", node.id());
                sleep(Duration::from_millis(10)).await;
            }
        }

        shutdown.cancel();
        for node in &nodes {
            node.shutdown().await;
        }
    }
}
