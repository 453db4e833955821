//! Peer bookkeeping for a sync session. Transport identity is opaque; the
//! pool only tracks availability and a coarse score.

use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

const INITIAL_SCORE: i32 = 0;
const DOWNGRADE_PENALTY: i32 = -10;
const BAN_THRESHOLD: i32 = -30;

#[derive(Debug, Clone)]
struct PeerInfo {
    score: i32,
    busy: bool,
}

#[derive(Debug, Default)]
pub struct PeerPool {
    peers: BTreeMap<PeerId, PeerInfo>,
}

impl PeerPool {
    pub fn insert(&mut self, peer: PeerId) {
        self.peers.entry(peer).or_insert(PeerInfo {
            score: INITIAL_SCORE,
            busy: false,
        });
    }

    pub fn remove(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// An idle, non-banned peer not present in `exclude`.
    pub fn idle_peer(&self, exclude: &[PeerId]) -> Option<PeerId> {
        self.peers
            .iter()
            .filter(|(id, info)| {
                !info.busy && info.score > BAN_THRESHOLD && !exclude.contains(id)
            })
            .max_by_key(|(_, info)| info.score)
            .map(|(id, _)| *id)
    }

    pub fn mark_busy(&mut self, peer: &PeerId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.busy = true;
        }
    }

    pub fn mark_idle(&mut self, peer: &PeerId) {
        if let Some(info) = self.peers.get_mut(peer) {
            info.busy = false;
        }
    }

    /// Penalize a misbehaving peer; returns true when the peer crossed the
    /// ban threshold and should be disconnected.
    pub fn downgrade(&mut self, peer: &PeerId) -> bool {
        if let Some(info) = self.peers.get_mut(peer) {
            info.score += DOWNGRADE_PENALTY;
            info.busy = false;
            info.score <= BAN_THRESHOLD
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn idle_selection_skips_busy_and_excluded() {
        let mut pool = PeerPool::default();
        pool.insert(PeerId(1));
        pool.insert(PeerId(2));
        pool.mark_busy(&PeerId(1));
        assert_eq!(pool.idle_peer(&[]), Some(PeerId(2)));
        assert_eq!(pool.idle_peer(&[PeerId(2)]), None);
        pool.mark_idle(&PeerId(1));
        assert_eq!(pool.idle_peer(&[PeerId(2)]), Some(PeerId(1)));
    }

    #[test]
    fn repeated_downgrades_ban() {
        let mut pool = PeerPool::default();
        pool.insert(PeerId(7));
        assert!(!pool.downgrade(&PeerId(7)));
        assert!(!pool.downgrade(&PeerId(7)));
        assert!(pool.downgrade(&PeerId(7)));
        assert_eq!(pool.idle_peer(&[]), None);
    }
}
