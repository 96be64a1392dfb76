//! # election
//!
//! why: turn an election timeout into a vote round
//! relations: triggered by timer.rs, mutates the node through node.rs
//! what: on_election_timeout, request_votes

use futures::stream::{FuturesUnordered, StreamExt};
use raft_core::{NodeState, RaftMessage};
use tracing::{debug, error, info, warn};

use crate::error::KvError;
use crate::node::Node;

impl Node {
    /// Become a candidate and ask every peer for its vote
    pub(crate) async fn on_election_timeout(&self) {
        let request = {
            let mut shared = self.lock().await;
            if shared.raft.is_leader() {
                return;
            }
            let request = shared.raft.start_election();
            info!(
                node_id = self.id(),
                term = shared.raft.current_term,
                "election timeout, starting election"
            );

            if let Err(e) = shared.sync_hard_state() {
                // without a durable self-vote the candidacy cannot stand
                error!(node_id = self.id(), error = %e, "could not persist candidacy");
                let term = shared.raft.current_term;
                shared.raft.become_follower(term);
                self.finish(&mut shared);
                return;
            }
            self.finish(&mut shared);
            if shared.raft.is_leader() {
                return;
            }
            request
        };

        let node = self.clone();
        tokio::spawn(async move { node.request_votes(request).await });
    }

    async fn request_votes(&self, request: RaftMessage) {
        let term = request.term();
        let mut replies: FuturesUnordered<_> = self
            .peers()
            .iter()
            .map(|&peer| {
                let request = request.clone();
                async move { (peer, self.call(peer, request).await) }
            })
            .collect();

        while let Some((peer, reply)) = replies.next().await {
            match reply {
                Ok(RaftMessage::VoteResponse {
                    term: reply_term,
                    vote_granted,
                }) => {
                    let mut shared = self.lock().await;
                    debug!(
                        node_id = self.id(),
                        peer_id = peer,
                        term = reply_term,
                        granted = vote_granted,
                        "vote response"
                    );
                    if shared.raft.handle_vote_response(reply_term, vote_granted, peer) {
                        info!(node_id = self.id(), term, "won election");
                    }
                    if let Err(e) = shared.sync_hard_state() {
                        self.halt(&mut shared, "could not persist a newer term", &KvError::from(e));
                        self.finish(&mut shared);
                        break;
                    }
                    self.finish(&mut shared);

                    let campaigning =
                        shared.raft.state == NodeState::Candidate && shared.raft.current_term == term;
                    if !campaigning {
                        break;
                    }
                }
                Ok(other) => warn!(
                    node_id = self.id(),
                    peer_id = peer,
                    kind = other.kind(),
                    "unexpected reply to VoteRequest"
                ),
                Err(e) => debug!(node_id = self.id(), peer_id = peer, error = %e, "vote request dropped"),
            }
        }
    }
}
