//! # replication
//!
//! why: get a leader's log onto a majority and keep followers in step
//! relations: proposals come from the tcp server or embedding code; heartbeats from timer.rs
//! what: propose, per-peer replication loop, heartbeats, background catch-up
//!
//! a proposal is answered only once its entry is applied locally. a follower that
//! rejects a heartbeat, or lags behind the leader's log, gets a catch-up task that
//! walks next_index back (or ships the snapshot) until it matches.

use raft_core::{ApplyResult, Command, NodeId, RaftMessage};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::error::{KvError, Result};
use crate::node::{Node, Pending, Shared};

/// Highest index a request covers once the peer accepts it
fn sent_through(message: &RaftMessage) -> u64 {
    match message {
        RaftMessage::AppendEntries {
            prev_log_index,
            entries,
            ..
        } => prev_log_index + entries.len() as u64,
        RaftMessage::InstallSnapshot {
            last_included_index,
            ..
        } => *last_included_index,
        _ => 0,
    }
}

impl Node {
    /// Submit a command and wait until it is committed and applied
    ///
    /// fails with `NotLeader` on followers; the hint names the known leader
    pub async fn propose(&self, command: Command) -> Result<ApplyResult> {
        if self.shutdown_token().is_cancelled() {
            return Err(KvError::Shutdown);
        }

        let (index, waiter) = {
            let mut shared = self.lock().await;
            let Some(entry) = shared.raft.append_entry(command) else {
                return Err(KvError::NotLeader {
                    leader_hint: shared.raft.leader_id,
                });
            };
            if let Err(e) = shared.storage.append_entries(std::slice::from_ref(&entry)) {
                shared.raft.log.pop();
                error!(node_id = self.id(), index = entry.index, error = %e, "could not persist proposal");
                return Err(e.into());
            }
            debug!(
                node_id = self.id(),
                index = entry.index,
                term = entry.term,
                operation = %entry.command.operation,
                key = %entry.command.key,
                "proposal appended"
            );

            let (tx, rx) = oneshot::channel();
            shared.pending.insert(
                entry.index,
                Pending {
                    term: entry.term,
                    tx,
                },
            );
            // a lone node is its own majority
            if shared.raft.advance_commit_index() {
                self.apply_or_halt(&mut shared);
            }
            self.finish(&mut shared);
            (entry.index, rx)
        };

        if !self.peers().is_empty() {
            if let Err(e) = self.await_majority(index).await {
                self.lock().await.pending.remove(&index);
                return Err(e);
            }
        }

        let shutdown = self.shutdown_token();
        tokio::select! {
            _ = shutdown.cancelled() => Err(KvError::Shutdown),
            answer = waiter => answer.unwrap_or_else(|_| {
                Err(KvError::Consensus(format!("proposal {index} was dropped")))
            }),
        }
    }

    /// Replicate through `index` to every peer; Ok once a majority (with us) holds it
    async fn await_majority(&self, index: u64) -> Result<()> {
        let peers = self.peers();
        let needed = (peers.len() + 1) / 2;
        let (tx, mut rx) = mpsc::channel(peers.len());
        for &peer in peers {
            let node = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let outcome = node.replicate_to_peer(peer, index).await;
                let _ = tx.send((peer, outcome)).await;
            });
        }
        drop(tx);

        let (mut acks, mut failures) = (0, 0);
        while let Some((peer, outcome)) = rx.recv().await {
            match outcome {
                Ok(()) => {
                    acks += 1;
                    if acks >= needed {
                        return Ok(());
                    }
                }
                Err(e) => {
                    failures += 1;
                    debug!(node_id = self.id(), peer_id = peer, index, error = %e, "replication failed");
                    if let KvError::NotLeader { .. } = e {
                        return Err(e);
                    }
                    if failures > peers.len() - needed {
                        return Err(KvError::Consensus(format!(
                            "entry {index} reached {acks} of the {needed} peers it needs"
                        )));
                    }
                }
            }
        }
        Err(KvError::Consensus(format!("entry {index} was not replicated")))
    }

    /// Send to `peer` until its match index reaches `target`
    pub(crate) async fn replicate_to_peer(&self, peer: NodeId, target: u64) -> Result<()> {
        loop {
            let request = {
                let shared = self.lock().await;
                if !shared.raft.is_leader() {
                    return Err(KvError::NotLeader {
                        leader_hint: shared.raft.leader_id,
                    });
                }
                if shared.raft.match_index.get(&peer).copied().unwrap_or(0) >= target {
                    return Ok(());
                }
                next_request(&shared, peer)?
            };
            let last_sent = sent_through(&request);

            let reply = self.call(peer, request).await?;

            let mut shared = self.lock().await;
            self.record_reply(&mut shared, peer, last_sent, reply);
            if !shared.raft.is_leader() {
                return Err(KvError::NotLeader {
                    leader_hint: shared.raft.leader_id,
                });
            }
        }
    }

    /// Feed a peer's answer to AppendEntries or InstallSnapshot into the leader
    ///
    /// returns whether the peer accepted the request
    fn record_reply(&self, shared: &mut Shared, peer: NodeId, last_sent: u64, reply: RaftMessage) -> bool {
        let (accepted, commit_advanced) = match reply {
            RaftMessage::AppendEntriesResponse { term, success } => {
                let advanced = shared
                    .raft
                    .handle_append_entries_response(term, success, peer, last_sent);
                (success, advanced)
            }
            RaftMessage::InstallSnapshotResponse { term } => {
                let accepted = term == shared.raft.current_term;
                let advanced = shared
                    .raft
                    .handle_install_snapshot_response(term, peer, last_sent);
                if accepted {
                    debug!(node_id = self.id(), peer_id = peer, last_sent, "snapshot installed on peer");
                }
                (accepted, advanced)
            }
            other => {
                warn!(node_id = self.id(), peer_id = peer, kind = other.kind(), "unexpected replication reply");
                return false;
            }
        };

        if let Err(e) = shared.sync_hard_state() {
            self.halt(shared, "could not persist a newer term", &KvError::from(e));
            self.finish(shared);
            return false;
        }
        if commit_advanced {
            debug!(node_id = self.id(), commit_index = shared.raft.commit_index, "commit advanced");
            self.apply_or_halt(shared);
        }
        self.finish(shared);
        accepted && shared.raft.is_leader()
    }

    /// One heartbeat round; peers behind the snapshot get it shipped instead
    pub(crate) async fn send_heartbeats(&self) {
        let batch: Vec<(NodeId, RaftMessage)> = {
            let mut shared = self.lock().await;
            if !shared.raft.is_leader() {
                return;
            }
            let mut batch = Vec::with_capacity(self.peers().len());
            for &peer in self.peers() {
                if shared.raft.needs_snapshot(peer) {
                    self.spawn_catch_up(&mut shared, peer);
                } else if let Some(heartbeat) = shared.raft.create_heartbeat(peer) {
                    batch.push((peer, heartbeat));
                }
            }
            batch
        };
        trace!(node_id = self.id(), peers = batch.len(), "heartbeat");

        for (peer, heartbeat) in batch {
            let node = self.clone();
            tokio::spawn(async move { node.heartbeat_peer(peer, heartbeat).await });
        }
    }

    async fn heartbeat_peer(&self, peer: NodeId, heartbeat: RaftMessage) {
        let prev_log_index = sent_through(&heartbeat);
        let reply = match self.call(peer, heartbeat).await {
            Ok(reply) => reply,
            Err(e) => {
                trace!(node_id = self.id(), peer_id = peer, error = %e, "heartbeat dropped");
                return;
            }
        };

        let mut shared = self.lock().await;
        let accepted = self.record_reply(&mut shared, peer, prev_log_index, reply);
        if !shared.raft.is_leader() {
            return;
        }
        let last_log_index = shared.raft.last_log_index();
        let behind = shared
            .raft
            .next_index
            .get(&peer)
            .map_or(false, |&next| next <= last_log_index);
        if !accepted || behind {
            self.spawn_catch_up(&mut shared, peer);
        }
    }

    /// Background replication to one lagging peer; at most one per peer
    fn spawn_catch_up(&self, shared: &mut Shared, peer: NodeId) {
        if !shared.catching_up.insert(peer) {
            return;
        }
        let target = shared.raft.last_log_index();
        let node = self.clone();
        tokio::spawn(async move {
            match node.replicate_to_peer(peer, target).await {
                Ok(()) => debug!(node_id = node.id(), peer_id = peer, target, "peer caught up"),
                Err(e) => debug!(node_id = node.id(), peer_id = peer, error = %e, "catch-up stopped"),
            }
            node.lock().await.catching_up.remove(&peer);
        });
    }
}

/// InstallSnapshot when the peer needs a compacted entry, AppendEntries otherwise
fn next_request(shared: &Shared, peer: NodeId) -> Result<RaftMessage> {
    let not_leader = || KvError::NotLeader {
        leader_hint: shared.raft.leader_id,
    };
    if shared.raft.needs_snapshot(peer) {
        let snapshot = shared
            .latest_snapshot
            .as_ref()
            .ok_or_else(|| KvError::Consensus(format!("peer {peer} needs a snapshot but none exists")))?;
        shared.raft.create_install_snapshot(snapshot).ok_or_else(not_leader)
    } else {
        shared.raft.create_append_entries(peer).ok_or_else(not_leader)
    }
}
