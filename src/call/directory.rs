//! Roster of reachable participants, as last broadcast by signaling.

use super::{Peer, PeerId};

#[derive(Debug, Default)]
pub struct PeerDirectory {
    self_id: Option<PeerId>,
    peers: Vec<Peer>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set our own id; we never list ourselves. Returns whether the list changed.
    pub fn set_self(&mut self, id: PeerId) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.id != id);
        self.self_id = Some(id);
        before != self.peers.len()
    }

    pub fn self_id(&self) -> Option<&PeerId> {
        self.self_id.as_ref()
    }

    /// Replace the roster with a snapshot. Duplicate ids keep the last
    /// entry. Returns whether the visible list changed.
    pub fn apply_roster(&mut self, roster: Vec<Peer>) -> bool {
        let mut next: Vec<Peer> = Vec::with_capacity(roster.len());
        for peer in roster {
            if Some(&peer.id) == self.self_id.as_ref() {
                continue;
            }
            match next.iter_mut().find(|p| p.id == peer.id) {
                Some(existing) => *existing = peer,
                None => next.push(peer),
            }
        }
        if next == self.peers {
            return false;
        }
        self.peers = next;
        true
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn get(&self, id: &PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.id == id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.get(id).is_some()
    }

    /// Case-insensitive substring match on handles. An empty term matches everyone.
    pub fn search(&self, term: &str) -> Vec<Peer> {
        let term = term.trim().to_lowercase();
        self.peers
            .iter()
            .filter(|p| p.handle.to_lowercase().contains(&term))
            .cloned()
            .collect()
    }

    /// Forget everyone (signaling went away). Returns whether anything was listed.
    pub fn clear(&mut self) -> bool {
        let had = !self.peers.is_empty();
        self.peers.clear();
        had
    }
}
