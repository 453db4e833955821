//! The event thread. One task owns every piece of mutable consensus state
//! (driver, fork choice, sync session, pending-block queue); everything
//! else reaches it through the inbox. The thread itself never blocks:
//! decode and storage work runs on the worker pool.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

use eth2_beacon_consensus::bls::BlsVerifier;
use eth2_beacon_consensus::state::BeaconState;
use eth2_beacon_consensus::transition::{
    AttestationError, BlockError, ConsensusDriver, StateProvider,
};
use eth2_beacon_consensus::types::{Attestation, Hash256, SignedBeaconBlock, Slot};
use eth2_beacon_store::{Store, StoreError, StoreOp};
use eth2_beacon_sync::peer::PeerId;
use eth2_beacon_sync::range::{
    RequestId, SyncConfig, SyncEvent, SyncSession, TargetChain,
};
use eth2_beacon_sync::rpc::{BlocksByRangeRequest, GoodbyeReason, StatusMessage};

use crate::metrics::NodeMetrics;
use crate::work::WorkOutcome;

/// Maximum children parked per unknown parent.
const PENDING_PER_PARENT: usize = 16;

#[derive(Debug)]
pub enum NodeEvent {
    PeerConnected { peer: PeerId, status: StatusMessage },
    PeerDisconnected(PeerId),
    BlockResponse {
        request_id: RequestId,
        block: Option<SignedBeaconBlock>,
    },
    GossipBlock(SignedBeaconBlock),
    GossipAttestation(Attestation),
    WorkCompleted(WorkOutcome),
    Tick { now_ms: u64 },
    Shutdown,
}

/// Outbound half of the wire; the transport lives outside this crate.
pub trait NetworkSender: Send {
    fn send_blocks_by_range(
        &mut self,
        peer: PeerId,
        request_id: RequestId,
        request: BlocksByRangeRequest,
    );
    fn send_goodbye(&mut self, peer: PeerId, reason: GoodbyeReason);
}

/// Discards outbound messages; stands in where no transport is wired.
#[derive(Debug, Default)]
pub struct NetworkStub;

impl NetworkSender for NetworkStub {
    fn send_blocks_by_range(
        &mut self,
        peer: PeerId,
        request_id: RequestId,
        request: BlocksByRangeRequest,
    ) {
        debug!(%peer, request_id, ?request, "dropping outbound request (no transport)");
    }

    fn send_goodbye(&mut self, peer: PeerId, reason: GoodbyeReason) {
        debug!(%peer, ?reason, "dropping outbound goodbye (no transport)");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Idle,
    Running,
    Stopped,
}

/// Write-through provider over the hot store with an in-memory overlay for
/// the states fork choice touches often.
pub struct StoreBackedProvider {
    store: Arc<Store>,
    state_cache: HashMap<Hash256, BeaconState>,
}

impl StoreBackedProvider {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            state_cache: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }
}

impl StateProvider for StoreBackedProvider {
    fn block(&self, root: &Hash256) -> Option<SignedBeaconBlock> {
        self.store.hot_block(root).ok().flatten()
    }

    fn state(&self, block_root: &Hash256) -> Option<BeaconState> {
        if let Some(state) = self.state_cache.get(block_root) {
            return Some(state.clone());
        }
        self.store.hot_state(block_root).ok().flatten()
    }

    fn put_block(&mut self, root: Hash256, block: SignedBeaconBlock) {
        let slot = block.slot();
        if let Err(error) = self.store.commit(vec![
            StoreOp::PutHotBlock(root, block),
            StoreOp::IndexHotBySlot(slot, root),
        ]) {
            warn!(%root, %error, "hot block write failed");
        }
    }

    fn put_state(&mut self, block_root: Hash256, state: BeaconState) {
        if let Err(error) = self
            .store
            .commit(vec![StoreOp::PutHotState(block_root, state.clone())])
        {
            warn!(%block_root, %error, "hot state write failed");
        }
        self.state_cache.insert(block_root, state);
    }
}

pub struct NodeService<N: NetworkSender, V: BlsVerifier> {
    state: ServiceState,
    driver: ConsensusDriver<StoreBackedProvider, V>,
    sync: Option<SyncSession>,
    pending_blocks: HashMap<Hash256, Vec<SignedBeaconBlock>>,
    network: N,
    metrics: Arc<NodeMetrics>,
    inbox: UnboundedReceiver<NodeEvent>,
    handle: UnboundedSender<NodeEvent>,
    now_ms: u64,
}

impl<N: NetworkSender, V: BlsVerifier> NodeService<N, V> {
    pub fn new(
        driver: ConsensusDriver<StoreBackedProvider, V>,
        network: N,
        metrics: Arc<NodeMetrics>,
    ) -> (Self, UnboundedSender<NodeEvent>) {
        let (handle, inbox) = tokio::sync::mpsc::unbounded_channel();
        let service = Self {
            state: ServiceState::Idle,
            driver,
            sync: None,
            pending_blocks: HashMap::new(),
            network,
            metrics,
            inbox,
            handle: handle.clone(),
            now_ms: 0,
        };
        (service, handle)
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn driver(&self) -> &ConsensusDriver<StoreBackedProvider, V> {
        &self.driver
    }

    pub fn event_handle(&self) -> UnboundedSender<NodeEvent> {
        self.handle.clone()
    }

    /// Run until shutdown, then drain whatever is already queued.
    pub async fn run(mut self) {
        self.state = ServiceState::Running;
        info!("consensus service running");
        while let Some(event) = self.inbox.recv().await {
            if matches!(event, NodeEvent::Shutdown) {
                break;
            }
            self.handle_event(event);
        }
        // Drain in-flight work, close open requests, then refuse the rest.
        while let Ok(event) = self.inbox.try_recv() {
            self.handle_event(event);
        }
        if let Some(sync) = self.sync.as_mut() {
            sync.cancel_all();
        }
        self.drain_sync_events();
        self.state = ServiceState::Stopped;
        info!("consensus service stopped");
    }

    pub fn start(&mut self) {
        if self.state == ServiceState::Idle {
            self.state = ServiceState::Running;
        }
    }

    pub fn stop(&mut self) {
        self.state = ServiceState::Stopped;
    }

    pub fn handle_event(&mut self, event: NodeEvent) {
        if self.state == ServiceState::Stopped {
            debug!("event dropped after shutdown");
            return;
        }
        match event {
            NodeEvent::PeerConnected { peer, status } => self.on_peer_connected(peer, status),
            NodeEvent::PeerDisconnected(peer) => {
                self.metrics.connected_peers.dec();
                if let Some(sync) = self.sync.as_mut() {
                    sync.remove_peer(&peer);
                }
                self.drain_sync_events();
            }
            NodeEvent::BlockResponse { request_id, block } => {
                if let Some(sync) = self.sync.as_mut() {
                    sync.on_block_response(request_id, block);
                }
                self.drain_sync_events();
            }
            NodeEvent::GossipBlock(block) => {
                self.import_block(block);
            }
            NodeEvent::GossipAttestation(attestation) => {
                self.on_attestation(&attestation);
            }
            NodeEvent::WorkCompleted(outcome) => self.on_work_completed(outcome),
            NodeEvent::Tick { now_ms } => self.on_tick(now_ms),
            NodeEvent::Shutdown => self.state = ServiceState::Stopped,
        }
    }

    fn on_peer_connected(&mut self, peer: PeerId, status: StatusMessage) {
        self.metrics.connected_peers.inc();
        let local_finalized = self.driver.finalized_checkpoint();
        let needs_sync = status.finalized_epoch > local_finalized.epoch
            || status.head_slot > self.driver.current_slot();

        if self.sync.is_none() && needs_sync {
            let start_slot = self
                .driver
                .spec()
                .start_slot_of_epoch(local_finalized.epoch)
                .max(self.driver.current_slot());
            info!(
                %peer,
                target_head = status.head_slot,
                target_finalized = status.finalized_epoch,
                "starting range sync"
            );
            let mut session = SyncSession::new(
                start_slot,
                local_finalized.epoch,
                TargetChain {
                    head_root: status.head_root,
                    head_slot: status.head_slot,
                    finalized_epoch: status.finalized_epoch,
                    claimed_by: peer,
                },
                SyncConfig::default(),
            );
            session.on_tick(self.now_ms);
            self.sync = Some(session);
        }
        if let Some(sync) = self.sync.as_mut() {
            sync.add_peer(peer);
        }
        self.drain_sync_events();
    }

    fn on_tick(&mut self, now_ms: u64) {
        self.now_ms = now_ms;
        let seconds_per_slot = self.driver.spec().seconds_per_slot;
        self.driver.on_tick(now_ms / 1000 / seconds_per_slot);
        if let Some(sync) = self.sync.as_mut() {
            sync.on_tick(now_ms);
        }
        self.drain_sync_events();
    }

    fn on_work_completed(&mut self, outcome: WorkOutcome) {
        match outcome {
            WorkOutcome::BlockDecoded { request_id, result } => match result {
                Ok(block) => {
                    if let Some(sync) = self.sync.as_mut() {
                        sync.on_block_response(request_id, block);
                    }
                    self.drain_sync_events();
                }
                Err(reason) => {
                    warn!(request_id, reason, "undecodable block response");
                }
            },
            WorkOutcome::AttestationDecoded { result } => match result {
                Ok(attestation) => self.on_attestation(&attestation),
                Err(reason) => warn!(reason, "undecodable attestation"),
            },
        }
    }

    fn on_attestation(&mut self, attestation: &Attestation) {
        match self.driver.on_attestation(attestation) {
            Ok(()) => {
                self.metrics.attestations_processed.inc();
            }
            Err(AttestationError::UnknownBlock(root)) => {
                debug!(%root, "attestation for unknown block dropped");
            }
            Err(error) => {
                debug!(%error, "attestation rejected");
            }
        }
    }

    /// Import a block, parking it when the parent has not arrived yet and
    /// replaying any parked children once it succeeds.
    fn import_block(&mut self, block: SignedBeaconBlock) -> bool {
        let block_root = block.canonical_root();
        match self.driver.on_block(block.clone()) {
            Ok(outcome) => {
                self.metrics.blocks_imported.inc();
                self.metrics.head_slot.set(
                    self.driver
                        .fork_choice()
                        .block_slot(&outcome.head_root)
                        .unwrap_or_default() as i64,
                );
                if outcome.finalized_advanced {
                    let finalized = self.driver.finalized_checkpoint();
                    self.metrics.finalized_epoch.set(finalized.epoch as i64);
                    if let Some(sync) = self.sync.as_mut() {
                        sync.on_finalized(finalized.epoch);
                    }
                    self.persist_finalized(finalized.root);
                }
                // Children waiting on this block can now proceed.
                if let Some(children) = self.pending_blocks.remove(&block_root) {
                    for child in children {
                        self.import_block(child);
                    }
                }
                true
            }
            Err(BlockError::UnknownParent(parent)) => {
                debug!(%block_root, %parent, "block parked until its parent arrives");
                let queue = self.pending_blocks.entry(parent).or_default();
                if queue.len() < PENDING_PER_PARENT {
                    queue.push(block);
                }
                false
            }
            Err(error) => {
                self.metrics.blocks_rejected.inc();
                warn!(%block_root, %error, "block rejected");
                false
            }
        }
    }

    /// Move the finalized segment of the canonical chain into the
    /// finalized column families.
    fn persist_finalized(&mut self, finalized_root: Hash256) {
        let split = match self.driver.provider().store().split_slot() {
            Ok(slot) => slot,
            Err(error) => {
                warn!(%error, "cannot read the store split point");
                return;
            }
        };
        let mut segment: Vec<(Slot, Hash256)> = Vec::new();
        let mut root = finalized_root;
        while let Some(block) = self.driver.provider().block(&root) {
            if block.slot() <= split {
                break;
            }
            segment.push((block.slot(), root));
            root = block.parent_root();
        }
        segment.reverse();
        if segment.is_empty() {
            return;
        }
        match self.driver.provider().store().finalize_segment(&segment) {
            Ok(()) => debug!(batches = segment.len(), "finalized segment persisted"),
            Err(StoreError::UnknownBlock(root)) => {
                warn!(%root, "finalized segment references a missing hot block")
            }
            Err(error) => warn!(%error, "finalized segment persistence failed"),
        }
    }

    fn drain_sync_events(&mut self) {
        loop {
            let Some(event) = self.sync.as_mut().and_then(|s| s.poll_event()) else {
                return;
            };
            match event {
                SyncEvent::SendRequest {
                    peer,
                    request_id,
                    request,
                } => self.network.send_blocks_by_range(peer, request_id, request),
                SyncEvent::ProcessBatch {
                    batch_index,
                    blocks,
                } => {
                    let mut ok = true;
                    for block in blocks {
                        if !self.import_block(block) {
                            ok = false;
                            break;
                        }
                    }
                    if ok {
                        self.metrics.sync_batches_completed.inc();
                    }
                    if let Some(sync) = self.sync.as_mut() {
                        sync.on_batch_processed(batch_index, ok);
                    }
                }
                SyncEvent::DowngradePeer { peer, reason } => {
                    self.metrics.peers_downgraded.inc();
                    debug!(%peer, reason, "peer downgraded");
                }
                SyncEvent::SendGoodbye { peer, reason } => {
                    self.network.send_goodbye(peer, reason);
                }
                SyncEvent::Paused => {
                    info!("sync paused: waiting for more peers");
                }
                SyncEvent::Completed => {
                    info!("range sync complete");
                    self.sync = None;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use eth2_beacon_consensus::bls::AcceptAllSignatures;
    use eth2_beacon_consensus::chain_spec::{ChainSpec, ForkName};
    use eth2_beacon_consensus::testing;
    use eth2_beacon_store::StoreConfig;

    #[derive(Default)]
    struct RecordingNetwork {
        requests: Vec<(PeerId, RequestId, BlocksByRangeRequest)>,
        goodbyes: Vec<(PeerId, GoodbyeReason)>,
    }

    impl NetworkSender for RecordingNetwork {
        fn send_blocks_by_range(
            &mut self,
            peer: PeerId,
            request_id: RequestId,
            request: BlocksByRangeRequest,
        ) {
            self.requests.push((peer, request_id, request));
        }

        fn send_goodbye(&mut self, peer: PeerId, reason: GoodbyeReason) {
            self.goodbyes.push((peer, reason));
        }
    }

    struct Harness {
        service: NodeService<RecordingNetwork, AcceptAllSignatures>,
        genesis_state: BeaconState,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let spec = Arc::new(ChainSpec::minimal());
        let store = Arc::new(
            Store::open(
                dir.path(),
                StoreConfig::default(),
                spec.clone(),
                ForkName::Altair,
            )
            .unwrap(),
        );
        let (genesis_state, anchor) = testing::genesis(ForkName::Altair, spec, 8);
        let driver = ConsensusDriver::from_anchor(
            StoreBackedProvider::new(store),
            AcceptAllSignatures,
            anchor,
            genesis_state.clone(),
        )
        .unwrap();
        let (_registry, metrics) = crate::metrics::setup_prometheus("test");
        let (mut service, _handle) =
            NodeService::new(driver, RecordingNetwork::default(), Arc::new(metrics));
        service.start();
        Harness {
            service,
            genesis_state,
            _dir: dir,
        }
    }

    fn status(head_slot: u64) -> StatusMessage {
        StatusMessage {
            fork_digest: vec![0, 0, 0, 0].into(),
            finalized_root: Hash256::ZERO,
            finalized_epoch: 0,
            head_root: Hash256::repeat_byte(0xaa),
            head_slot,
        }
    }

    #[test]
    fn service_lifecycle_refuses_events_after_stop() {
        let mut h = harness();
        assert_eq!(h.service.state(), ServiceState::Running);
        h.service.handle_event(NodeEvent::Shutdown);
        assert_eq!(h.service.state(), ServiceState::Stopped);

        h.service.handle_event(NodeEvent::PeerConnected {
            peer: PeerId(1),
            status: status(64),
        });
        assert!(h.service.network.requests.is_empty());
    }

    #[test]
    fn a_peer_ahead_of_us_starts_a_sync_session() {
        let mut h = harness();
        h.service.handle_event(NodeEvent::PeerConnected {
            peer: PeerId(1),
            status: status(6),
        });
        assert!(h.service.sync.is_some());
        assert_eq!(h.service.network.requests.len(), 1);
        let (_, _, request) = h.service.network.requests[0];
        assert_eq!(request.start_slot, 1);
        assert_eq!(request.step, 1);
    }

    #[test]
    fn synced_blocks_flow_through_to_the_head() {
        let mut h = harness();
        let (blocks, _) = testing::extend_chain(&h.genesis_state, 1..=4).unwrap();
        let tip = blocks.last().unwrap().canonical_root();

        h.service.handle_event(NodeEvent::PeerConnected {
            peer: PeerId(1),
            status: status(4),
        });
        let (_, request_id, _) = h.service.network.requests[0];
        for block in blocks {
            h.service.handle_event(NodeEvent::BlockResponse {
                request_id,
                block: Some(block),
            });
        }
        h.service.handle_event(NodeEvent::BlockResponse {
            request_id,
            block: None,
        });

        // Session finished and the head follows the synced chain.
        assert!(h.service.sync.is_none());
        let head = h.service.driver.head().unwrap();
        assert_eq!(head, tip);
    }

    #[test]
    fn out_of_order_gossip_blocks_park_until_the_parent_lands() {
        let mut h = harness();
        let (blocks, _) = testing::extend_chain(&h.genesis_state, [1, 2]).unwrap();
        let parent = blocks[0].clone();
        let child = blocks[1].clone();
        let child_root = child.canonical_root();

        h.service.handle_event(NodeEvent::GossipBlock(child));
        assert_eq!(h.service.pending_blocks.len(), 1);

        h.service.handle_event(NodeEvent::GossipBlock(parent));
        assert!(h.service.pending_blocks.is_empty());
        assert_eq!(h.service.driver.head().unwrap(), child_root);
    }
}
