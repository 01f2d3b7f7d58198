use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::connection::PeerConnection;
use crate::signaling::{IceCandidate, PeerId};

/// Remote candidates that arrived before their peer's remote description.
#[derive(Debug)]
pub struct IceCandidateBuffer {
    queues: HashMap<PeerId, VecDeque<IceCandidate>>,
    max_per_peer: usize,
}

impl IceCandidateBuffer {
    pub fn new(max_per_peer: usize) -> Self {
        Self {
            queues: HashMap::new(),
            max_per_peer,
        }
    }

    /// Appends in arrival order. Returns false if the peer's queue is full.
    pub fn enqueue(&mut self, peer_id: &str, candidate: IceCandidate) -> bool {
        let queue = self.queues.entry(peer_id.to_string()).or_default();
        if queue.len() >= self.max_per_peer {
            warn!(peer_id, limit = self.max_per_peer, "candidate buffer full, dropping candidate");
            return false;
        }
        debug!(peer_id, queued = queue.len() + 1, "buffering ICE candidate (remote description not set yet)");
        queue.push_back(candidate);
        true
    }

    pub fn pending(&self, peer_id: &str) -> usize {
        self.queues.get(peer_id).map_or(0, VecDeque::len)
    }

    /// Applies the queued candidates in order and forgets them. A candidate the
    /// connection rejects is logged and skipped. Returns how many were applied.
    pub async fn flush(&mut self, peer_id: &str, connection: &dyn PeerConnection) -> usize {
        let Some(queue) = self.queues.remove(peer_id) else {
            return 0;
        };
        debug!(peer_id, count = queue.len(), "adding buffered ICE candidates");
        let mut applied = 0;
        for candidate in queue {
            match connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => warn!(peer_id, error = %e, "error adding buffered ICE candidate"),
            }
        }
        applied
    }

    pub fn discard(&mut self, peer_id: &str) {
        self.queues.remove(peer_id);
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}
