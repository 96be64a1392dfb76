//! # node
//!
//! why: run a raft-core state machine as a live cluster member
//! relations: owns raft-core's RaftNode, raft-storage backends and a Transport;
//!            election.rs, replication.rs and apply.rs extend Node
//! what: Node handle, NodeBuilder, crash recovery, incoming rpc handlers, status, shutdown
//!
//! every mutation happens under one lock and ends with `finish`, which starts or
//! stops the heartbeat, fails orphaned proposals and publishes the new status.
//! the lock is never held across a network call.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use raft_core::{
    ApplyResult, HardState, LogChange, LogEntry, MemoryStateMachine, NodeId, NodeStatus,
    RaftConfig, RaftMessage, RaftNode, Snapshot, StateMachine,
};
use raft_storage::{
    FileSnapshotStore, FileStorage, InMemorySnapshotStore, InMemoryStorage, SnapshotStore, Storage,
};
use tokio::sync::futures::Notified;
use tokio::sync::{oneshot, watch, Mutex, MutexGuard, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::NodeConfig;
use crate::error::{KvError, Result, TransportError};
use crate::timer::{run_election_timer, run_heartbeat};
use crate::transport::{Mailbox, Transport};

/// A proposal waiting for its entry to be applied
pub(crate) struct Pending {
    pub(crate) term: u64,
    pub(crate) tx: oneshot::Sender<Result<ApplyResult>>,
}

/// Everything guarded by the node lock
pub(crate) struct Shared {
    pub(crate) raft: RaftNode,
    pub(crate) storage: Box<dyn Storage>,
    pub(crate) snapshots: Box<dyn SnapshotStore>,
    pub(crate) machine: Box<dyn StateMachine + Send>,
    /// image shipped to peers that fell behind the compacted prefix
    pub(crate) latest_snapshot: Option<Snapshot>,
    /// keyed by log index
    pub(crate) pending: HashMap<u64, Pending>,
    pub(crate) heartbeat: Option<CancellationToken>,
    pub(crate) catching_up: HashSet<NodeId>,
    persisted: HardState,
}

impl Shared {
    /// Write (term, vote) if it changed since the last write
    pub(crate) fn sync_hard_state(&mut self) -> io::Result<()> {
        let current = self.raft.hard_state();
        if current != self.persisted {
            self.storage
                .save_term_and_vote(current.current_term, current.voted_for)?;
            self.persisted = current;
        }
        Ok(())
    }

    pub(crate) fn fail_pending(&mut self, reason: impl Fn() -> KvError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.tx.send(Err(reason()));
        }
    }
}

struct NodeInner {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    rpc_timeout: Duration,
    transport: Arc<dyn Transport>,
    shared: Mutex<Shared>,
    election_reset: Notify,
    shutdown: CancellationToken,
    status: watch::Sender<NodeStatus>,
}

/// Handle on a running node; clones share the same node
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

/// Collects a node's collaborators before it starts
pub struct NodeBuilder {
    id: NodeId,
    peers: Vec<NodeId>,
    config: RaftConfig,
    rpc_timeout: Duration,
    storage: Box<dyn Storage>,
    snapshots: Box<dyn SnapshotStore>,
    machine: Box<dyn StateMachine + Send>,
}

impl NodeBuilder {
    /// In-memory storage, snapshots and state machine until told otherwise
    pub fn new(id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            id,
            peers,
            config: RaftConfig::default(),
            rpc_timeout: Duration::from_millis(100),
            storage: Box::new(InMemoryStorage::new()),
            snapshots: Box::new(InMemorySnapshotStore::new()),
            machine: Box::new(MemoryStateMachine::new()),
        }
    }

    /// File-backed node described by `config`
    pub fn from_config(config: &NodeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(config.node_id, config.peer_ids())
            .raft_config(config.raft)
            .rpc_timeout(config.rpc_timeout())
            .storage(FileStorage::new(&config.data_dir)?)
            .snapshots(FileSnapshotStore::new(&config.data_dir)?))
    }

    pub fn raft_config(mut self, config: RaftConfig) -> Self {
        self.config = config;
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn storage(mut self, storage: impl Storage + 'static) -> Self {
        self.storage = Box::new(storage);
        self
    }

    pub fn snapshots(mut self, snapshots: impl SnapshotStore + 'static) -> Self {
        self.snapshots = Box::new(snapshots);
        self
    }

    pub fn state_machine(mut self, machine: impl StateMachine + Send + 'static) -> Self {
        self.machine = Box::new(machine);
        self
    }

    /// Recover persisted state and start the election timer
    ///
    /// must be called from within a tokio runtime
    pub fn start(self, transport: Arc<dyn Transport>) -> Result<Node> {
        self.config.validate()?;
        let mut seen = HashSet::new();
        for &peer in &self.peers {
            if peer == self.id {
                return Err(KvError::Config(format!("node {peer} lists itself as a peer")));
            }
            if !seen.insert(peer) {
                return Err(KvError::Config(format!("peer {peer} is listed twice")));
            }
        }

        let mut cluster = self.peers;
        cluster.push(self.id);
        let raft = RaftNode::with_config(self.id, cluster, self.config);
        let peers: Vec<NodeId> = raft.peers().collect();

        let mut shared = Shared {
            raft,
            storage: self.storage,
            snapshots: self.snapshots,
            machine: self.machine,
            latest_snapshot: None,
            pending: HashMap::new(),
            heartbeat: None,
            catching_up: HashSet::new(),
            persisted: HardState::default(),
        };
        recover(&mut shared)?;

        let (status, _) = watch::channel(shared.raft.status());
        let node = Node {
            inner: Arc::new(NodeInner {
                id: self.id,
                peers,
                config: self.config,
                rpc_timeout: self.rpc_timeout,
                transport,
                shared: Mutex::new(shared),
                election_reset: Notify::new(),
                shutdown: CancellationToken::new(),
                status,
            }),
        };

        tokio::spawn(run_election_timer(node.clone()));
        info!(node_id = node.id(), peers = ?node.inner.peers, "node started");
        Ok(node)
    }
}

/// Rebuild state from storage: (term, vote), snapshot, log, then committed entries
fn recover(shared: &mut Shared) -> Result<()> {
    let (current_term, voted_for) = shared.storage.load_term_and_vote()?;
    shared.raft.restore_hard_state(HardState {
        current_term,
        voted_for,
    });
    shared.persisted = shared.raft.hard_state();

    if let Some(snapshot) = shared.snapshots.load()? {
        snapshot.restore_into(shared.machine.as_mut());
        shared
            .raft
            .restore_snapshot(snapshot.last_included_index, snapshot.last_included_term);
        shared.latest_snapshot = Some(snapshot);
    }

    let persisted_log = shared.storage.load_log()?;
    let on_disk = persisted_log.len();
    let loaded = shared.raft.load_log(persisted_log);
    if loaded < on_disk {
        debug!(
            node_id = shared.raft.id,
            skipped = on_disk - loaded,
            "ignored log entries covered by the snapshot or past a gap"
        );
    }

    let commit_index = shared.storage.load_commit_index()?;
    shared.raft.restore_commit_index(commit_index);
    shared.apply_committed()?;

    info!(
        node_id = shared.raft.id,
        term = shared.raft.current_term,
        snapshot_index = shared.raft.snapshot_index,
        last_log_index = shared.raft.last_log_index(),
        commit_index = shared.raft.commit_index,
        "recovered persisted state"
    );
    Ok(())
}

impl Node {
    pub fn builder(id: NodeId, peers: Vec<NodeId>) -> NodeBuilder {
        NodeBuilder::new(id, peers)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn peers(&self) -> &[NodeId] {
        &self.inner.peers
    }

    pub fn raft_config(&self) -> RaftConfig {
        self.inner.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Latest published status; never waits on the node lock
    pub fn status(&self) -> NodeStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NodeStatus> {
        self.inner.status.subscribe()
    }

    /// Read straight from the local state machine, without consensus (may be stale)
    pub async fn local_get(&self, key: &str) -> Option<String> {
        self.lock().await.machine.get(key)
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner.shared.lock().await
    }

    pub(crate) fn election_reset(&self) -> Notified<'_> {
        self.inner.election_reset.notified()
    }

    pub(crate) fn reset_election_timer(&self) {
        self.inner.election_reset.notify_one();
    }

    /// One rpc to `peer`, bounded by the rpc timeout
    pub(crate) async fn call(
        &self,
        peer: NodeId,
        message: RaftMessage,
    ) -> std::result::Result<RaftMessage, TransportError> {
        let send = self.inner.transport.send(peer, message);
        match tokio::time::timeout(self.inner.rpc_timeout, send).await {
            Ok(reply) => reply,
            Err(_) => Err(TransportError::Timeout(peer)),
        }
    }

    /// End of every critical section: heartbeat on/off, orphaned proposals, status
    pub(crate) fn finish(&self, shared: &mut Shared) {
        if shared.raft.is_leader() {
            if shared.heartbeat.is_none() {
                let token = self.inner.shutdown.child_token();
                shared.heartbeat = Some(token.clone());
                tokio::spawn(run_heartbeat(self.clone(), token));
            }
        } else {
            if let Some(token) = shared.heartbeat.take() {
                token.cancel();
            }
            if !shared.pending.is_empty() {
                let leader_hint = shared.raft.leader_id;
                shared.fail_pending(|| {
                    KvError::Consensus(format!("leadership lost, new leader {leader_hint:?}"))
                });
            }
        }

        let status = shared.raft.status();
        let previous = self.inner.status.borrow().role;
        if previous != status.role {
            info!(
                node_id = self.id(),
                term = status.current_term,
                from = %previous,
                to = %status.role,
                "role changed"
            );
        }
        self.inner.status.send_replace(status);
    }

    /// Apply newly committed entries; a failure here means the log is unusable
    pub(crate) fn apply_or_halt(&self, shared: &mut Shared) {
        if let Err(e) = shared.apply_committed() {
            self.halt(shared, "cannot apply committed entries", &e);
        }
    }

    /// Stop the node for good: memory has moved past what storage holds
    pub(crate) fn halt(&self, shared: &mut Shared, what: &str, cause: &KvError) {
        error!(node_id = self.id(), error = %cause, "{what}, halting node");
        let reason = format!("{what}: {cause}");
        shared.fail_pending(|| KvError::Consensus(reason.clone()));
        if let Some(token) = shared.heartbeat.take() {
            token.cancel();
        }
        self.inner.shutdown.cancel();
    }

    // -- incoming rpcs --

    /// Answer a peer's request
    pub async fn handle_message(&self, message: RaftMessage) -> Result<RaftMessage> {
        if self.inner.shutdown.is_cancelled() {
            return Err(KvError::Shutdown);
        }
        match message {
            RaftMessage::VoteRequest {
                term,
                candidate_id,
                last_log_index,
                last_log_term,
            } => {
                self.handle_vote_request(term, candidate_id, last_log_index, last_log_term)
                    .await
            }
            RaftMessage::AppendEntries {
                term,
                leader_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit,
            } => {
                self.handle_append_entries(
                    term,
                    leader_id,
                    prev_log_index,
                    prev_log_term,
                    entries,
                    leader_commit,
                )
                .await
            }
            RaftMessage::InstallSnapshot {
                term,
                leader_id,
                last_included_index,
                last_included_term,
                entries,
            } => {
                self.handle_install_snapshot(
                    term,
                    leader_id,
                    last_included_index,
                    last_included_term,
                    entries,
                )
                .await
            }
            other => Err(TransportError::UnexpectedResponse(format!(
                "{} is not a request",
                other.kind()
            ))
            .into()),
        }
    }

    async fn handle_vote_request(
        &self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> Result<RaftMessage> {
        let mut shared = self.lock().await;
        let (response, granted) =
            shared
                .raft
                .handle_vote_request(term, candidate_id, last_log_index, last_log_term);
        // the vote must be durable before the candidate hears about it
        let persisted = shared.sync_hard_state();
        self.finish(&mut shared);
        persisted?;

        debug!(
            node_id = self.id(),
            candidate_id,
            term = shared.raft.current_term,
            granted,
            "vote request"
        );
        if granted {
            self.reset_election_timer();
        }
        Ok(response)
    }

    async fn handle_append_entries(
        &self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> Result<RaftMessage> {
        let mut shared = self.lock().await;
        let outcome = shared.raft.handle_append_entries(
            term,
            leader_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        );
        if outcome.reset_timer {
            self.reset_election_timer();
        }

        // the entries are already in the in-memory log, so a failed write cannot be retried
        if let Err(e) = persist_append(&mut shared, outcome.log_change) {
            self.halt(&mut shared, "could not persist appended entries", &e);
            self.finish(&mut shared);
            return Err(e);
        }
        if outcome.commit_advanced {
            debug!(
                node_id = self.id(),
                commit_index = shared.raft.commit_index,
                "follower commit advanced"
            );
            self.apply_or_halt(&mut shared);
        }
        self.finish(&mut shared);
        if self.inner.shutdown.is_cancelled() {
            return Err(KvError::Shutdown);
        }
        Ok(outcome.response)
    }

    async fn handle_install_snapshot(
        &self,
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        entries: Vec<LogEntry>,
    ) -> Result<RaftMessage> {
        let mut shared = self.lock().await;
        let outcome = shared.raft.handle_install_snapshot(
            term,
            leader_id,
            last_included_index,
            last_included_term,
        );
        if outcome.reset_timer {
            self.reset_election_timer();
        }

        let persisted = shared.sync_hard_state().map_err(KvError::from).and_then(|_| {
            if outcome.installed {
                install_snapshot(&mut shared, entries, last_included_index, last_included_term)
            } else {
                Ok(())
            }
        });
        // the commit index already covers the snapshot, a retry would be taken as stale
        if let Err(e) = persisted {
            self.halt(&mut shared, "could not persist installed snapshot", &e);
            self.finish(&mut shared);
            return Err(e);
        }
        self.finish(&mut shared);
        Ok(outcome.response)
    }

    /// Deliver requests from a MemoryNetwork mailbox until shutdown
    pub fn serve_mailbox(&self, mut mailbox: Mailbox) -> JoinHandle<()> {
        let node = self.clone();
        tokio::spawn(async move {
            let shutdown = node.shutdown_token();
            loop {
                let envelope = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    envelope = mailbox.recv() => match envelope {
                        Some(envelope) => envelope,
                        None => break,
                    },
                };
                let node = node.clone();
                tokio::spawn(async move {
                    let from = envelope.from;
                    match node.handle_message(envelope.message).await {
                        Ok(answer) => {
                            let _ = envelope.reply.send(answer);
                        }
                        Err(e) => {
                            debug!(node_id = node.id(), peer_id = from, error = %e, "request failed")
                        }
                    }
                });
            }
        })
    }

    /// Stop timers and heartbeats, fail waiting proposals and close the transport
    ///
    /// also finishes the cleanup of a node that halted itself
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        {
            let mut shared = self.lock().await;
            if let Some(token) = shared.heartbeat.take() {
                token.cancel();
            }
            shared.fail_pending(|| KvError::Shutdown);
        }
        self.inner.transport.close().await;
        info!(node_id = self.id(), "node stopped");
    }
}

/// Write what handle_append_entries changed: term/vote first, then the log
fn persist_append(shared: &mut Shared, change: Option<LogChange>) -> Result<()> {
    shared.sync_hard_state()?;
    match change {
        Some(LogChange::Appended { from_index }) => {
            let appended = shared.raft.get_entries_from(from_index);
            shared.storage.append_entries(&appended)?;
        }
        Some(LogChange::Rewritten) => {
            let log = shared.raft.log.clone();
            shared.storage.overwrite_log(&log)?;
        }
        None => {}
    }
    Ok(())
}

/// Replace local state with a snapshot received from the leader
fn install_snapshot(
    shared: &mut Shared,
    entries: Vec<LogEntry>,
    last_included_index: u64,
    last_included_term: u64,
) -> Result<()> {
    let snapshot = shared
        .snapshots
        .save(entries, last_included_index, last_included_term)?;
    snapshot.restore_into(shared.machine.as_mut());

    let log = shared.raft.log.clone();
    shared.storage.overwrite_log(&log)?;
    shared.storage.save_commit_index(shared.raft.commit_index)?;
    info!(
        node_id = shared.raft.id,
        last_included_index,
        last_included_term,
        kept_entries = log.len(),
        "installed snapshot from leader"
    );
    shared.latest_snapshot = Some(snapshot);
    Ok(())
}
