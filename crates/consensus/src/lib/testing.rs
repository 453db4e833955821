//! Deterministic chain-building helpers shared by the test suites of the
//! crates sitting on top of the consensus core.

use std::sync::Arc;

use crate::bls::AcceptAllSignatures;
use crate::chain_spec::{ChainSpec, ForkName, FAR_FUTURE_EPOCH};
use crate::state::BeaconState;
use crate::transition::{per_block, per_slot, BlockError};
use crate::types::{
    BeaconBlock, BeaconBlockBody, BeaconBlockHeader, Eth1Data, Hash256, SignedBeaconBlock, Slot,
    Validator,
};

pub fn test_validator(byte: u8) -> Validator {
    Validator {
        pubkey: vec![byte; 48].into(),
        withdrawal_credentials: Hash256::repeat_byte(byte),
        effective_balance: 32_000_000_000,
        slashed: false,
        activation_eligibility_epoch: 0,
        activation_epoch: 0,
        exit_epoch: FAR_FUTURE_EPOCH,
        withdrawable_epoch: FAR_FUTURE_EPOCH,
    }
}

pub fn empty_body() -> BeaconBlockBody {
    BeaconBlockBody {
        randao_reveal: vec![0u8; 96].into(),
        eth1_data: Eth1Data {
            deposit_root: Hash256::ZERO,
            deposit_count: 0,
            block_hash: Hash256::ZERO,
        },
        graffiti: Hash256::ZERO,
        proposer_slashings: Default::default(),
        attester_slashings: Default::default(),
        attestations: Default::default(),
        deposits: Default::default(),
        voluntary_exits: Default::default(),
    }
}

/// Genesis state plus the matching anchor block: the state's latest header
/// commits to the block body, the block commits to the state root.
pub fn genesis(
    fork: ForkName,
    spec: Arc<ChainSpec>,
    validator_count: u8,
) -> (BeaconState, SignedBeaconBlock) {
    let body = empty_body();
    let header = BeaconBlockHeader {
        slot: 0,
        proposer_index: 0,
        parent_root: Hash256::ZERO,
        state_root: Hash256::ZERO,
        body_root: tree_hash::TreeHash::tree_hash_root(&body),
    };
    let state = BeaconState::new_default(fork, spec)
        .update(|writer| {
            writer.set_latest_block_header(&header)?;
            for i in 0..validator_count {
                writer.push_validator(&test_validator(i))?;
                writer.push_balance(32_000_000_000)?;
                if fork == ForkName::Altair {
                    writer.push_participation(0)?;
                    writer.push_inactivity_score(0)?;
                }
            }
            Ok(())
        })
        .expect("genesis construction is infallible");

    let block = BeaconBlock {
        slot: 0,
        proposer_index: 0,
        parent_root: Hash256::ZERO,
        state_root: state.hash_tree_root(),
        body,
    };
    let signed = SignedBeaconBlock {
        message: block,
        signature: vec![0u8; 96].into(),
    };
    (state, signed)
}

/// Build the valid empty block for `slot` on top of `parent_state` and
/// return it with its post-state.
pub fn produce_block(
    parent_state: &BeaconState,
    slot: Slot,
) -> Result<(SignedBeaconBlock, BeaconState), BlockError> {
    let advanced = per_slot::process_slots(parent_state, slot)?;
    let mut block = BeaconBlock {
        slot,
        proposer_index: per_block::beacon_proposer_index(&advanced)?,
        parent_root: advanced.latest_block_header()?.canonical_root(),
        state_root: Hash256::ZERO,
        body: empty_body(),
    };
    let post = per_block::process_block(&advanced, &block, &AcceptAllSignatures)?;
    block.state_root = post.hash_tree_root();
    Ok((
        SignedBeaconBlock {
            message: block,
            signature: vec![0u8; 96].into(),
        },
        post,
    ))
}

/// Extend the chain with empty blocks through `slots`, returning each
/// signed block and the tip state.
pub fn extend_chain(
    from_state: &BeaconState,
    slots: impl IntoIterator<Item = Slot>,
) -> Result<(Vec<SignedBeaconBlock>, BeaconState), BlockError> {
    let mut state = from_state.clone();
    let mut blocks = Vec::new();
    for slot in slots {
        let (block, post) = produce_block(&state, slot)?;
        blocks.push(block);
        state = post;
    }
    Ok((blocks, state))
}
