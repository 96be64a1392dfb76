//! # timer
//!
//! why: drive elections and heartbeats from wall-clock time
//! relations: spawned by node.rs; calls back into election.rs and replication.rs
//! what: random_election_timeout, election loop, heartbeat loop

use std::time::Duration;

use rand::Rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::node::Node;

/// Generates a random election timeout within the configured range
pub fn random_election_timeout(min_ms: u64, max_ms: u64) -> Duration {
    let mut rng = rand::thread_rng();
    let timeout_ms = rng.gen_range(min_ms..=max_ms);
    Duration::from_millis(timeout_ms)
}

/// Single election timer, restarted by `Node::reset_election_timer`
pub(crate) async fn run_election_timer(node: Node) {
    let config = node.raft_config();
    let shutdown = node.shutdown_token();
    loop {
        let timeout = random_election_timeout(config.election_timeout_min, config.election_timeout_max);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = node.election_reset() => continue,
            _ = tokio::time::sleep(timeout) => node.on_election_timeout().await,
        }
    }
    trace!(node_id = node.id(), "election timer stopped");
}

/// Leader heartbeats; the first tick fires at once to announce the new leader
pub(crate) async fn run_heartbeat(node: Node, token: CancellationToken) {
    let period = Duration::from_millis(node.raft_config().heartbeat_interval);
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => node.send_heartbeats().await,
        }
    }
    trace!(node_id = node.id(), "heartbeat stopped");
}
