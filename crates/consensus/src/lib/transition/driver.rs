//! Drives blocks and attestations through the state transition and anchors
//! the results in the fork-choice store.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::bls::BlsVerifier;
use crate::chain_spec::ChainSpec;
use crate::fork_choice::{Block as ProtoBlock, ForkChoice};
use crate::state::BeaconState;
use crate::types::{
    compute_signing_root, Attestation, Checkpoint, Hash256, SignedBeaconBlock, Slot,
};

use super::per_block;
use super::per_slot;
use super::{AttestationError, BlockError};

/// Block and state lookup used by the driver. Backed by the hot store in
/// production and by a map in tests.
pub trait StateProvider {
    fn block(&self, root: &Hash256) -> Option<SignedBeaconBlock>;
    fn state(&self, block_root: &Hash256) -> Option<BeaconState>;
    fn put_block(&mut self, root: Hash256, block: SignedBeaconBlock);
    fn put_state(&mut self, block_root: Hash256, state: BeaconState);
}

#[derive(Default)]
pub struct InMemoryProvider {
    blocks: HashMap<Hash256, SignedBeaconBlock>,
    states: HashMap<Hash256, BeaconState>,
}

impl StateProvider for InMemoryProvider {
    fn block(&self, root: &Hash256) -> Option<SignedBeaconBlock> {
        self.blocks.get(root).cloned()
    }

    fn state(&self, block_root: &Hash256) -> Option<BeaconState> {
        self.states.get(block_root).cloned()
    }

    fn put_block(&mut self, root: Hash256, block: SignedBeaconBlock) {
        self.blocks.insert(root, block);
    }

    fn put_state(&mut self, block_root: Hash256, state: BeaconState) {
        self.states.insert(block_root, state);
    }
}

#[derive(Debug, Clone)]
pub struct BlockOutcome {
    pub block_root: Hash256,
    pub head_root: Hash256,
    pub finalized_advanced: bool,
}

pub struct ConsensusDriver<P: StateProvider, V: BlsVerifier> {
    spec: Arc<ChainSpec>,
    provider: P,
    bls: V,
    fork_choice: ForkChoice,
    current_slot: Slot,
}

impl<P: StateProvider, V: BlsVerifier> ConsensusDriver<P, V> {
    /// Boot from a trusted anchor pair (normally the finalized block and
    /// its post-state); the anchor itself is not re-verified.
    pub fn from_anchor(
        mut provider: P,
        bls: V,
        anchor_block: SignedBeaconBlock,
        anchor_state: BeaconState,
    ) -> Result<Self, BlockError> {
        let spec = anchor_state.spec().clone();
        let anchor_root = anchor_block.canonical_root();
        let checkpoint = Checkpoint {
            epoch: anchor_state.current_epoch()?,
            root: anchor_root,
        };
        let fork_choice = ForkChoice::from_anchor(
            ProtoBlock {
                slot: anchor_block.slot(),
                root: anchor_root,
                parent_root: None,
                state_root: anchor_block.message.state_root,
                justified_epoch: checkpoint.epoch,
                finalized_epoch: checkpoint.epoch,
            },
            checkpoint,
            checkpoint,
        );
        let current_slot = anchor_block.slot();
        provider.put_block(anchor_root, anchor_block);
        provider.put_state(anchor_root, anchor_state);
        Ok(Self {
            spec,
            provider,
            bls,
            fork_choice,
            current_slot,
        })
    }

    pub fn spec(&self) -> &Arc<ChainSpec> {
        &self.spec
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn fork_choice(&self) -> &ForkChoice {
        &self.fork_choice
    }

    pub fn justified_checkpoint(&self) -> Checkpoint {
        self.fork_choice.justified_checkpoint()
    }

    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.fork_choice.finalized_checkpoint()
    }

    pub fn current_slot(&self) -> Slot {
        self.current_slot
    }

    /// Clock moves forward only.
    pub fn on_tick(&mut self, slot: Slot) {
        self.current_slot = self.current_slot.max(slot);
    }

    pub fn on_block(&mut self, signed_block: SignedBeaconBlock) -> Result<BlockOutcome, BlockError> {
        let block = &signed_block.message;
        let block_root = signed_block.canonical_root();

        let finalized = self.fork_choice.finalized_checkpoint();
        let finalized_slot = self.spec.start_slot_of_epoch(finalized.epoch);
        if block.slot <= finalized_slot {
            return Err(BlockError::BlockFromFinalizedEpoch {
                block_slot: block.slot,
                finalized_slot,
            });
        }

        let pre_state = self
            .provider
            .state(&block.parent_root)
            .ok_or(BlockError::UnknownParent(block.parent_root))?;

        let advanced = per_slot::process_slots(&pre_state, block.slot)?;

        let proposer = advanced.validator(block.proposer_index)?;
        let domain = per_block::domain_at(
            &advanced,
            crate::chain_spec::DOMAIN_BEACON_PROPOSER,
            advanced.current_epoch()?,
        )?;
        let signing_root = compute_signing_root(block.canonical_root(), domain);
        if !self
            .bls
            .verify(&proposer.pubkey, signing_root, &signed_block.signature)
        {
            return Err(BlockError::InvalidSignature);
        }

        let post_state = per_block::process_block(&advanced, block, &self.bls)?;

        let computed = post_state.hash_tree_root();
        if computed != block.state_root {
            return Err(BlockError::StateRootMismatch {
                expected: block.state_root,
                computed,
            });
        }

        let justified = post_state.current_justified_checkpoint()?;
        let block_finalized = post_state.finalized_checkpoint()?;
        let block_slot = block.slot;
        let block_parent_root = block.parent_root;
        let block_state_root = block.state_root;
        self.provider.put_state(block_root, post_state);
        self.fork_choice.on_block(ProtoBlock {
            slot: block_slot,
            root: block_root,
            parent_root: Some(block_parent_root),
            state_root: block_state_root,
            justified_epoch: justified.epoch,
            finalized_epoch: block_finalized.epoch,
        })?;
        self.provider.put_block(block_root, signed_block);

        let mut finalized_advanced = false;
        let mut store_justified = self.fork_choice.justified_checkpoint();
        let mut store_finalized = self.fork_choice.finalized_checkpoint();
        if justified.epoch > store_justified.epoch {
            store_justified = justified;
        }
        if block_finalized.epoch > store_finalized.epoch {
            store_finalized = block_finalized;
            finalized_advanced = true;
        }
        self.fork_choice
            .update_checkpoints(store_justified, store_finalized);
        if finalized_advanced && self.fork_choice.contains_block(&store_finalized.root) {
            self.fork_choice.maybe_prune(&store_finalized.root)?;
            info!(
                epoch = store_finalized.epoch,
                root = %store_finalized.root,
                "finalized checkpoint advanced"
            );
        }

        self.current_slot = self.current_slot.max(block_slot);
        let head_root = self.recompute_head()?;
        debug!(slot = block_slot, root = %block_root, head = %head_root, "block imported");

        Ok(BlockOutcome {
            block_root,
            head_root,
            finalized_advanced,
        })
    }

    pub fn on_attestation(&mut self, attestation: &Attestation) -> Result<(), AttestationError> {
        let data = &attestation.data;
        let current_epoch = self.spec.epoch_at_slot(self.current_slot);
        if data.target.epoch + 1 < current_epoch || data.target.epoch > current_epoch + 1 {
            return Err(AttestationError::AttestationFromFuturePastEpoch {
                target_epoch: data.target.epoch,
                current_epoch,
            });
        }
        if !self.fork_choice.contains_block(&data.beacon_block_root) {
            return Err(AttestationError::UnknownBlock(data.beacon_block_root));
        }
        let committee_state = self
            .provider
            .state(&data.target.root)
            .or_else(|| self.provider.state(&data.beacon_block_root))
            .ok_or(AttestationError::UnknownBlock(data.target.root))?;

        let attesters = per_block::attesting_indices(&committee_state, attestation)
            .map_err(|e| AttestationError::BadCommittee(e.to_string()))?;

        let mut pubkeys = Vec::with_capacity(attesters.len());
        for index in &attesters {
            pubkeys.push(committee_state.validator(*index)?.pubkey);
        }
        let domain = per_block::domain_at(
            &committee_state,
            crate::chain_spec::DOMAIN_BEACON_ATTESTER,
            data.target.epoch,
        )?;
        let signing_root = compute_signing_root(
            tree_hash::TreeHash::tree_hash_root(data),
            domain,
        );
        if !self
            .bls
            .fast_aggregate_verify(&pubkeys, signing_root, &attestation.signature)
        {
            return Err(AttestationError::InvalidSignature);
        }

        for index in attesters {
            self.fork_choice
                .process_attestation(index, data.beacon_block_root, data.target.epoch);
        }
        Ok(())
    }

    /// Canonical head under the current checkpoints and votes.
    pub fn head(&mut self) -> Result<Hash256, BlockError> {
        self.recompute_head()
    }

    pub fn head_state(&mut self) -> Result<Option<BeaconState>, BlockError> {
        let head = self.recompute_head()?;
        Ok(self.provider.state(&head))
    }

    fn recompute_head(&mut self) -> Result<Hash256, BlockError> {
        let justified = self.fork_choice.justified_checkpoint();
        let balances = match self.provider.state(&justified.root) {
            Some(state) => state.effective_balances()?,
            None => Vec::new(),
        };
        Ok(self.fork_choice.find_head(&balances)?)
    }
}
