//! Multi-peer range sync session.
//!
//! The session is a sans-IO state machine: the owner injects peer events
//! (`add_peer`, `on_block_response`, `on_tick`, `on_batch_processed`) and
//! drains [`SyncEvent`]s telling it what to send and which blocks to feed
//! into the state transition. Batches commit strictly in slot order.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tracing::{debug, warn};

use eth2_beacon_consensus::types::{Epoch, Hash256, SignedBeaconBlock, Slot};

use crate::batch::Batch;
use crate::peer::{PeerId, PeerPool};
use crate::rpc::{BlocksByRangeRequest, GoodbyeReason};

pub type RequestId = u64;
pub type BatchIndex = u64;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Slots per batch.
    pub batch_size: u64,
    pub max_inflight: usize,
    pub request_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_inflight: 4,
            request_timeout_ms: 30_000,
        }
    }
}

/// The chain one or more peers claim to be on.
#[derive(Debug, Clone)]
pub struct TargetChain {
    pub head_root: Hash256,
    pub head_slot: Slot,
    pub finalized_epoch: Epoch,
    pub claimed_by: PeerId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    SendRequest {
        peer: PeerId,
        request_id: RequestId,
        request: BlocksByRangeRequest,
    },
    /// Hand a confirmed batch to the state transition, in slot order.
    ProcessBatch {
        batch_index: BatchIndex,
        blocks: Vec<SignedBeaconBlock>,
    },
    DowngradePeer {
        peer: PeerId,
        reason: String,
    },
    SendGoodbye {
        peer: PeerId,
        reason: GoodbyeReason,
    },
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Syncing,
    Paused,
    Completed,
}

#[derive(Debug)]
struct InFlight {
    peer: PeerId,
    batch_index: BatchIndex,
    deadline_ms: u64,
}

pub struct SyncSession {
    config: SyncConfig,
    target: TargetChain,
    batches: BTreeMap<BatchIndex, Batch>,
    batch_count: u64,
    /// Index of the next batch to hand off for processing.
    next_handoff: BatchIndex,
    /// Number of batches acknowledged as applied by the owner.
    acked: u64,
    requests: HashMap<RequestId, InFlight>,
    next_request_id: RequestId,
    peers: PeerPool,
    events: VecDeque<SyncEvent>,
    state: SessionState,
    local_finalized_epoch: Epoch,
    now_ms: u64,
}

impl SyncSession {
    /// Span `(start_slot, target.head_slot]` with fixed-size batches.
    pub fn new(
        start_slot: Slot,
        local_finalized_epoch: Epoch,
        target: TargetChain,
        config: SyncConfig,
    ) -> Self {
        let first = start_slot + 1;
        let total_slots = target.head_slot.saturating_sub(start_slot);
        let batch_count = total_slots.div_ceil(config.batch_size);
        let mut batches = BTreeMap::new();
        for index in 0..batch_count {
            let batch_start = first + index * config.batch_size;
            let count = config.batch_size.min(target.head_slot - batch_start + 1);
            batches.insert(index, Batch::new(batch_start, count, 1));
        }
        Self {
            config,
            target,
            batches,
            batch_count,
            next_handoff: 0,
            acked: 0,
            requests: HashMap::new(),
            next_request_id: 0,
            peers: PeerPool::default(),
            events: VecDeque::new(),
            state: SessionState::Syncing,
            local_finalized_epoch,
            now_ms: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn batch_count(&self) -> u64 {
        self.batch_count
    }

    pub fn poll_event(&mut self) -> Option<SyncEvent> {
        self.events.pop_front()
    }

    pub fn add_peer(&mut self, peer: PeerId) {
        self.peers.insert(peer);
        if self.state == SessionState::Paused {
            self.state = SessionState::Syncing;
        }
        self.allocate();
    }

    pub fn remove_peer(&mut self, peer: &PeerId) {
        self.peers.remove(peer);
        let stale: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, inflight)| inflight.peer == *peer)
            .map(|(id, _)| *id)
            .collect();
        for request_id in stale {
            if let Some(inflight) = self.requests.remove(&request_id) {
                if let Some(batch) = self.batches.get_mut(&inflight.batch_index) {
                    batch.reset_for_refetch();
                }
            }
        }
        self.allocate();
    }

    pub fn on_tick(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        let expired: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, inflight)| inflight.deadline_ms <= now_ms)
            .map(|(id, _)| *id)
            .collect();
        for request_id in expired {
            let inflight = self.requests.remove(&request_id).expect("collected above");
            warn!(peer = %inflight.peer, batch = inflight.batch_index, "request timed out");
            self.peers.mark_idle(&inflight.peer);
            if let Some(batch) = self.batches.get_mut(&inflight.batch_index) {
                // Remember the peer so the refetch goes elsewhere.
                batch.served_by.push(inflight.peer);
                batch.reset_for_refetch();
            }
        }
        self.allocate();
    }

    /// One streamed block (`Some`) or end-of-stream (`None`).
    pub fn on_block_response(
        &mut self,
        request_id: RequestId,
        block: Option<SignedBeaconBlock>,
    ) {
        let Some(inflight) = self.requests.get(&request_id) else {
            return; // Stale response after a timeout or reset.
        };
        let peer = inflight.peer;
        let batch_index = inflight.batch_index;

        match block {
            Some(block) => {
                let Some(batch) = self.batches.get_mut(&batch_index) else {
                    return;
                };
                if let Err(error) = batch.on_block(block) {
                    debug!(peer = %peer, batch = batch_index, %error, "discarding batch");
                    self.requests.remove(&request_id);
                    let batch = self.batches.get_mut(&batch_index).expect("present");
                    batch.served_by.push(peer);
                    batch.reset_for_refetch();
                    self.punish(peer, error.to_string());
                    self.allocate();
                }
            }
            None => {
                self.requests.remove(&request_id);
                self.peers.mark_idle(&peer);
                if let Some(batch) = self.batches.get_mut(&batch_index) {
                    batch.served_by.push(peer);
                    batch.on_stream_end();
                }
                self.try_handoff();
                self.allocate();
            }
        }
    }

    /// Owner feedback after running a handed-off batch through the state
    /// transition.
    pub fn on_batch_processed(&mut self, batch_index: BatchIndex, ok: bool) {
        if ok {
            self.acked = self.acked.max(batch_index + 1);
            self.maybe_complete();
            return;
        }
        // The peer served blocks that fail consensus checks.
        if let Some(batch) = self.batches.get_mut(&batch_index) {
            let offender = batch.served_by.last().copied();
            batch.reset_for_refetch();
            self.next_handoff = self.next_handoff.min(batch_index);
            if let Some(peer) = offender {
                self.punish(peer, "served blocks failing state transition".to_owned());
            }
        }
        self.allocate();
    }

    /// Cancel every in-flight request, telling each peer the stream closed
    /// because we are going away.
    pub fn cancel_all(&mut self) {
        for (_, inflight) in self.requests.drain() {
            self.peers.mark_idle(&inflight.peer);
            if let Some(batch) = self.batches.get_mut(&inflight.batch_index) {
                batch.reset_for_refetch();
            }
            self.events.push_back(SyncEvent::SendGoodbye {
                peer: inflight.peer,
                reason: GoodbyeReason::ClientShutdown,
            });
        }
    }

    /// The local finalized checkpoint moved.
    pub fn on_finalized(&mut self, epoch: Epoch) {
        self.local_finalized_epoch = self.local_finalized_epoch.max(epoch);
        self.maybe_complete();
    }

    fn punish(&mut self, peer: PeerId, reason: String) {
        let banned = self.peers.downgrade(&peer);
        self.events.push_back(SyncEvent::DowngradePeer { peer, reason });
        if banned {
            self.events.push_back(SyncEvent::SendGoodbye {
                peer,
                reason: GoodbyeReason::FaultError,
            });
            self.peers.remove(&peer);
        }
    }

    /// Hand complete, cross-confirmed batches to the owner in order.
    fn try_handoff(&mut self) {
        while self.next_handoff < self.batch_count {
            let index = self.next_handoff;
            let Some(batch) = self.batches.get(&index) else {
                return;
            };
            if !batch.flags.complete {
                return;
            }

            if index > 0 {
                let previous = self.batches.get(&(index - 1)).expect("allocated");
                let link_ok = match (previous.last_block_root(), batch.first_parent_root()) {
                    (Some(tip), Some(parent)) => parent == tip,
                    // An empty neighbour leaves nothing to cross-check.
                    _ => true,
                };
                if !link_ok {
                    self.handle_contested(index);
                    return;
                }
                let previous = self.batches.get_mut(&(index - 1)).expect("allocated");
                previous.flags.last_confirmed = true;
            }

            let batch = self.batches.get_mut(&index).expect("present");
            batch.flags.first_confirmed = true;
            let blocks = batch.blocks.clone();
            self.events.push_back(SyncEvent::ProcessBatch {
                batch_index: index,
                blocks,
            });
            self.next_handoff += 1;
        }
    }

    /// Two peers disagree about a range boundary. The later batch is
    /// refetched from a peer that served neither side; that answer wins.
    fn handle_contested(&mut self, index: BatchIndex) {
        let previous_servers: Vec<PeerId> = self
            .batches
            .get(&(index - 1))
            .map(|b| b.served_by.clone())
            .unwrap_or_default();

        let batch = self.batches.get_mut(&index).expect("present");
        let already_contested = batch.flags.contested;
        batch.flags.contested = true;
        if let Some(previous) = self.batches.get_mut(&(index - 1)) {
            previous.flags.contested = true;
        }

        if already_contested {
            // The tie-breaker answer still disagrees: the earlier batch is
            // the suspect now.
            let previous = self.batches.get_mut(&(index - 1)).expect("present");
            let offender = previous.served_by.last().copied();
            previous.reset_for_refetch();
            self.next_handoff = index - 1;
            if let Some(peer) = offender {
                self.punish(peer, "lost a contested range tie-break".to_owned());
            }
            self.allocate();
            return;
        }

        let batch = self.batches.get_mut(&index).expect("present");
        for peer in previous_servers {
            if !batch.served_by.contains(&peer) {
                batch.served_by.push(peer);
            }
        }
        batch.reset_for_refetch();

        if self.peers.idle_peer(&batch.served_by).is_none() {
            debug!(batch = index, "contested range with no tie-break peer");
            self.state = SessionState::Paused;
            self.events.push_back(SyncEvent::Paused);
            return;
        }
        self.allocate();
    }

    fn maybe_complete(&mut self) {
        if self.state == SessionState::Completed || self.acked < self.batch_count {
            return;
        }
        if self.local_finalized_epoch < self.target.finalized_epoch {
            // The advertised finality never materialized.
            self.events.push_back(SyncEvent::SendGoodbye {
                peer: self.target.claimed_by,
                reason: GoodbyeReason::FaultError,
            });
        }
        self.state = SessionState::Completed;
        self.events.push_back(SyncEvent::Completed);
    }

    /// Assign awaiting batches to idle peers, bounded by `max_inflight`.
    fn allocate(&mut self) {
        if self.state != SessionState::Syncing {
            return;
        }
        let indices: Vec<BatchIndex> = self.batches.keys().copied().collect();
        for index in indices {
            if self.requests.len() >= self.config.max_inflight {
                return;
            }
            let batch = self.batches.get(&index).expect("iterating keys");
            if !batch.flags.awaiting || index < self.next_handoff {
                continue;
            }
            let Some(peer) = self.peers.idle_peer(&batch.served_by) else {
                continue;
            };
            let request_id = self.next_request_id;
            self.next_request_id += 1;
            self.peers.mark_busy(&peer);

            let batch = self.batches.get_mut(&index).expect("present");
            batch.flags.awaiting = false;
            let request = batch.to_request();
            self.requests.insert(
                request_id,
                InFlight {
                    peer,
                    batch_index: index,
                    deadline_ms: self.now_ms + self.config.request_timeout_ms,
                },
            );
            self.events.push_back(SyncEvent::SendRequest {
                peer,
                request_id,
                request,
            });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use eth2_beacon_consensus::testing::empty_body;
    use eth2_beacon_consensus::types::BeaconBlock;

    fn block(slot: Slot, parent_root: Hash256) -> SignedBeaconBlock {
        SignedBeaconBlock {
            message: BeaconBlock {
                slot,
                proposer_index: 0,
                parent_root,
                state_root: Hash256::ZERO,
                body: empty_body(),
            },
            signature: vec![0u8; 96].into(),
        }
    }

    /// Dense chain over `1..=head`, indexable by slot.
    fn chain(head: Slot) -> Vec<SignedBeaconBlock> {
        let mut parent = Hash256::ZERO;
        (1..=head)
            .map(|slot| {
                let b = block(slot, parent);
                parent = b.canonical_root();
                b
            })
            .collect()
    }

    fn session(head_slot: Slot, batch_size: u64) -> SyncSession {
        SyncSession::new(
            0,
            0,
            TargetChain {
                head_root: Hash256::repeat_byte(0xaa),
                head_slot,
                finalized_epoch: 0,
                claimed_by: PeerId(1),
            },
            SyncConfig {
                batch_size,
                max_inflight: 2,
                request_timeout_ms: 1_000,
            },
        )
    }

    fn drain(session: &mut SyncSession) -> Vec<SyncEvent> {
        std::iter::from_fn(|| session.poll_event()).collect()
    }

    fn requests_of(events: &[SyncEvent]) -> Vec<(PeerId, RequestId, BlocksByRangeRequest)> {
        events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::SendRequest {
                    peer,
                    request_id,
                    request,
                } => Some((*peer, *request_id, *request)),
                _ => None,
            })
            .collect()
    }

    fn serve(
        session: &mut SyncSession,
        request_id: RequestId,
        blocks: impl IntoIterator<Item = SignedBeaconBlock>,
    ) {
        for b in blocks {
            session.on_block_response(request_id, Some(b));
        }
        session.on_block_response(request_id, None);
    }

    #[test]
    fn batches_span_the_target_range() {
        let session = session(70, 32);
        assert_eq!(session.batch_count(), 3);
    }

    #[test]
    fn two_peer_happy_path_hands_off_in_order() {
        let mut session = session(8, 4);
        let blocks = chain(8);
        session.add_peer(PeerId(1));
        session.add_peer(PeerId(2));

        let events = drain(&mut session);
        let requests = requests_of(&events);
        assert_eq!(requests.len(), 2);
        assert_ne!(requests[0].0, requests[1].0);
        assert_eq!(requests[0].2.start_slot, 1);
        assert_eq!(requests[1].2.start_slot, 5);

        // Serve the second batch first: nothing is handed off out of order.
        serve(&mut session, requests[1].1, blocks[4..8].to_vec());
        assert!(drain(&mut session).iter().all(|e| !matches!(e, SyncEvent::ProcessBatch { .. })));

        serve(&mut session, requests[0].1, blocks[0..4].to_vec());
        let events = drain(&mut session);
        let handed: Vec<BatchIndex> = events
            .iter()
            .filter_map(|e| match e {
                SyncEvent::ProcessBatch { batch_index, .. } => Some(*batch_index),
                _ => None,
            })
            .collect();
        assert_eq!(handed, vec![0, 1]);

        session.on_batch_processed(0, true);
        session.on_batch_processed(1, true);
        let events = drain(&mut session);
        assert!(events.contains(&SyncEvent::Completed));
        assert!(!events
            .iter()
            .any(|e| matches!(e, SyncEvent::SendGoodbye { .. })));
    }

    #[test]
    fn out_of_order_response_downgrades_and_refetches_elsewhere() {
        let mut session = session(4, 4);
        session.add_peer(PeerId(1));
        let requests = requests_of(&drain(&mut session));
        assert_eq!(requests.len(), 1);

        session.add_peer(PeerId(2));
        // Slot 3 first: violates the expected position.
        session.on_block_response(requests[0].1, Some(block(3, Hash256::ZERO)));
        let events = drain(&mut session);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::DowngradePeer { peer, .. } if *peer == requests[0].0)));
        let refetch = requests_of(&events);
        assert_eq!(refetch.len(), 1);
        assert_ne!(refetch[0].0, requests[0].0);
    }

    #[test]
    fn contested_boundary_resolved_by_a_third_peer() {
        let mut session = session(4, 2);
        let blocks = chain(4);
        session.add_peer(PeerId(1));
        session.add_peer(PeerId(2));
        let requests = requests_of(&drain(&mut session));

        serve(&mut session, requests[0].1, blocks[0..2].to_vec());
        // Peer 2 serves a second batch that does not chain from batch 0.
        let bogus_parent = Hash256::repeat_byte(0x66);
        let mut forged = vec![block(3, bogus_parent)];
        forged.push(block(4, forged[0].canonical_root()));
        serve(&mut session, requests[1].1, forged);

        let events = drain(&mut session);
        // Batch 0 was handed off; batch 1 went contested and is refetched.
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ProcessBatch { batch_index: 0, .. })));
        assert!(events
            .iter()
            .all(|e| !matches!(e, SyncEvent::ProcessBatch { batch_index: 1, .. })));
        assert!(matches!(session.state(), SessionState::Paused));
        assert!(events.contains(&SyncEvent::Paused));

        // A third peer arrives and its answer settles the range.
        session.add_peer(PeerId(3));
        let retry = requests_of(&drain(&mut session));
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].0, PeerId(3));
        serve(&mut session, retry[0].1, blocks[2..4].to_vec());
        let events = drain(&mut session);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::ProcessBatch { batch_index: 1, .. })));
    }

    #[test]
    fn timeouts_move_the_batch_to_another_peer() {
        let mut session = session(4, 4);
        session.add_peer(PeerId(1));
        session.add_peer(PeerId(2));
        let requests = requests_of(&drain(&mut session));
        assert_eq!(requests.len(), 1);

        session.on_tick(5_000);
        let retry = requests_of(&drain(&mut session));
        assert_eq!(retry.len(), 1);
        assert_ne!(retry[0].0, requests[0].0);
    }

    #[test]
    fn false_finality_claim_earns_a_goodbye() {
        let mut session = SyncSession::new(
            0,
            0,
            TargetChain {
                head_root: Hash256::repeat_byte(0xaa),
                head_slot: 2,
                finalized_epoch: 9,
                claimed_by: PeerId(1),
            },
            SyncConfig {
                batch_size: 4,
                max_inflight: 1,
                request_timeout_ms: 1_000,
            },
        );
        let blocks = chain(2);
        session.add_peer(PeerId(1));
        let requests = requests_of(&drain(&mut session));
        serve(&mut session, requests[0].1, blocks);
        drain(&mut session);
        // The whole range applied cleanly but finality never reached the
        // advertised epoch.
        session.on_batch_processed(0, true);
        let events = drain(&mut session);
        assert!(events.contains(&SyncEvent::SendGoodbye {
            peer: PeerId(1),
            reason: GoodbyeReason::FaultError,
        }));
        assert!(events.contains(&SyncEvent::Completed));
    }

    #[test]
    fn cancellation_says_goodbye_to_every_pending_peer() {
        let mut session = session(8, 4);
        session.add_peer(PeerId(1));
        session.add_peer(PeerId(2));
        let requests = requests_of(&drain(&mut session));
        assert_eq!(requests.len(), 2);

        session.cancel_all();
        let events = drain(&mut session);
        for (peer, _, _) in requests {
            assert!(events.contains(&SyncEvent::SendGoodbye {
                peer,
                reason: GoodbyeReason::ClientShutdown,
            }));
        }
    }

    #[test]
    fn failed_processing_downgrades_and_refetches() {
        let mut session = session(2, 4);
        let blocks = chain(2);
        session.add_peer(PeerId(1));
        session.add_peer(PeerId(2));
        let requests = requests_of(&drain(&mut session));
        serve(&mut session, requests[0].1, blocks);
        drain(&mut session);

        session.on_batch_processed(0, false);
        let events = drain(&mut session);
        assert!(events
            .iter()
            .any(|e| matches!(e, SyncEvent::DowngradePeer { peer, .. } if *peer == PeerId(1))));
        let retry = requests_of(&events);
        assert_eq!(retry.len(), 1);
        assert_eq!(retry[0].0, PeerId(2));
    }
}
