//! Block application: header, RANDAO, eth1 voting and the five operation
//! lists, in the prescribed order. Every check is a typed outcome; the
//! first failure aborts the block.

use ethereum_hashing::{hash32_concat, hash_fixed};
use tree_hash::TreeHash;
use typenum::Unsigned;

use crate::bls::BlsVerifier;
use crate::chain_spec::{
    DOMAIN_BEACON_ATTESTER, DOMAIN_BEACON_PROPOSER, DOMAIN_DEPOSIT, DOMAIN_RANDAO,
    DOMAIN_VOLUNTARY_EXIT, FAR_FUTURE_EPOCH,
};
use crate::shuffling;
use crate::state::{BeaconState, StateError};
use crate::types::{
    compute_signing_root, Attestation, AttestationData, BeaconBlock, Deposit, DepositMessage,
    Epoch, Hash256, IndexedAttestation, PendingAttestation, Slot, Validator, ValidatorIndex,
    Version,
};

use super::per_epoch::{TIMELY_HEAD_FLAG, TIMELY_SOURCE_FLAG, TIMELY_TARGET_FLAG};
use super::{BlockError, OperationKind, Verification};

fn version_bytes(version: &Version) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(&version.to_vec());
    out
}

/// Signing domain for `epoch`, picking the fork version active then.
pub fn domain_at(
    state: &BeaconState,
    domain_type: [u8; 4],
    epoch: Epoch,
) -> Result<Hash256, StateError> {
    let fork = state.fork()?;
    let version = if epoch < fork.epoch {
        version_bytes(&fork.previous_version)
    } else {
        version_bytes(&fork.current_version)
    };
    Ok(state
        .spec()
        .compute_domain(domain_type, version, state.genesis_validators_root()?))
}

/// Committee `index` at `slot`, expanded from the shuffled active set of
/// the slot's epoch.
pub fn beacon_committee(
    state: &BeaconState,
    slot: Slot,
    index: u64,
) -> Result<Vec<ValidatorIndex>, StateError> {
    let spec = state.spec();
    let epoch = spec.epoch_at_slot(slot);
    let active = state.active_validator_indices(epoch)?;
    let committees_per_slot = shuffling::committee_count_per_slot(active.len() as u64, spec);
    let seed = state.seed(epoch, DOMAIN_BEACON_ATTESTER)?;
    let committees_per_epoch = committees_per_slot * spec.slots_per_epoch;
    let committee_index = (slot % spec.slots_per_epoch) * committees_per_slot + index;
    Ok(shuffling::compute_committee(
        &active,
        &seed,
        committee_index,
        committees_per_epoch,
        spec,
    ))
}

pub fn committee_count_at_slot(state: &BeaconState, slot: Slot) -> Result<u64, StateError> {
    let epoch = state.spec().epoch_at_slot(slot);
    let active = state.active_validator_indices(epoch)?;
    Ok(shuffling::committee_count_per_slot(
        active.len() as u64,
        state.spec(),
    ))
}

/// Proposer for the state's current slot.
pub fn beacon_proposer_index(state: &BeaconState) -> Result<ValidatorIndex, StateError> {
    let spec = state.spec();
    let epoch = state.current_epoch()?;
    let base_seed = state.seed(epoch, DOMAIN_BEACON_PROPOSER)?;
    let mut preimage = Vec::with_capacity(40);
    preimage.extend_from_slice(base_seed.as_slice());
    preimage.extend_from_slice(&state.slot()?.to_le_bytes());
    let seed = Hash256::from(hash_fixed(&preimage));

    let active = state.active_validator_indices(epoch)?;
    let mut effective = vec![0u64; state.validators_len()? as usize];
    for index in &active {
        effective[*index as usize] = state.validator(*index)?.effective_balance;
    }
    shuffling::compute_proposer_index(&active, &effective, &seed, spec)
        .ok_or(StateError::UnknownValidator(0))
}

pub fn process_block<V: BlsVerifier>(
    state: &BeaconState,
    block: &BeaconBlock,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let state = process_block_header(state, block)?;
    let state = process_randao(&state, block, bls)?;
    let state = process_eth1_data(&state, block)?;
    process_operations(&state, block, bls)
}

fn process_block_header(
    state: &BeaconState,
    block: &BeaconBlock,
) -> Result<BeaconState, BlockError> {
    let header = state.latest_block_header()?;
    let expected_proposer = beacon_proposer_index(state)?;
    let proposer = state.validator(block.proposer_index)?;

    Verification::require(
        block.slot == state.slot()?,
        OperationKind::Header,
        format!("block slot {} does not match state slot", block.slot),
    )
    .and_then(|| {
        Verification::require(
            block.slot > header.slot,
            OperationKind::Header,
            "block is not newer than the latest header",
        )
    })
    .and_then(|| {
        Verification::require(
            block.proposer_index == expected_proposer,
            OperationKind::Header,
            format!(
                "proposer {} is not the expected {expected_proposer}",
                block.proposer_index
            ),
        )
    })
    .and_then(|| {
        Verification::require(
            block.parent_root == header.canonical_root(),
            OperationKind::Header,
            "parent root does not match the latest header",
        )
    })
    .and_then(|| {
        Verification::require(!proposer.slashed, OperationKind::Header, "proposer slashed")
    })
    .into_result()?;

    Ok(state.update(|writer| writer.set_latest_block_header(&block.temporary_block_header()))?)
}

fn process_randao<V: BlsVerifier>(
    state: &BeaconState,
    block: &BeaconBlock,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let epoch = state.current_epoch()?;
    let proposer = state.validator(block.proposer_index)?;
    let domain = domain_at(state, DOMAIN_RANDAO, epoch)?;
    let signing_root = compute_signing_root(epoch.tree_hash_root(), domain);

    Verification::require(
        bls.verify(&proposer.pubkey, signing_root, &block.body.randao_reveal),
        OperationKind::Randao,
        "randao reveal rejected",
    )
    .into_result()?;

    let mix = state.randao_mix(epoch)?;
    let reveal_digest = hash_fixed(&block.body.randao_reveal.to_vec());
    let mut mixed = [0u8; 32];
    for (i, byte) in mixed.iter_mut().enumerate() {
        *byte = mix.as_slice()[i] ^ reveal_digest[i];
    }
    Ok(state.update(|writer| writer.set_randao_mix(epoch, Hash256::from(mixed)))?)
}

fn process_eth1_data(state: &BeaconState, block: &BeaconBlock) -> Result<BeaconState, BlockError> {
    let vote = &block.body.eth1_data;
    let mut tally = 1u64;
    for i in 0..state.eth1_data_votes_len()? {
        if state.eth1_data_vote(i)? == *vote {
            tally += 1;
        }
    }
    let period_slots =
        state.spec().epochs_per_eth1_voting_period * state.spec().slots_per_epoch;
    Ok(state.update(|writer| {
        writer.push_eth1_data_vote(vote)?;
        if tally * 2 > period_slots {
            writer.set_eth1_data(vote)?;
        }
        Ok(())
    })?)
}

fn process_operations<V: BlsVerifier>(
    state: &BeaconState,
    block: &BeaconBlock,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let expected_deposits = state
        .eth1_data()?
        .deposit_count
        .saturating_sub(state.eth1_deposit_index()?)
        .min(crate::eth_spec::MaxDeposits::to_u64());
    Verification::require(
        block.body.deposits.len() as u64 == expected_deposits,
        OperationKind::Deposit,
        format!(
            "block carries {} deposits, expected {expected_deposits}",
            block.body.deposits.len()
        ),
    )
    .into_result()?;

    let mut state = state.clone();
    for slashing in block.body.proposer_slashings.iter() {
        state = process_proposer_slashing(&state, slashing, bls)?;
    }
    for slashing in block.body.attester_slashings.iter() {
        state = process_attester_slashing(&state, slashing, bls)?;
    }
    for attestation in block.body.attestations.iter() {
        state = process_attestation(&state, attestation, block.proposer_index, bls)?;
    }
    for deposit in block.body.deposits.iter() {
        state = process_deposit(&state, deposit, bls)?;
    }
    for exit in block.body.voluntary_exits.iter() {
        state = process_voluntary_exit(&state, exit, bls)?;
    }
    Ok(state)
}

fn slash_validator(
    state: &BeaconState,
    slashed_index: ValidatorIndex,
    whistleblower: ValidatorIndex,
) -> Result<BeaconState, BlockError> {
    let spec = state.spec().clone();
    let epoch = state.current_epoch()?;
    let validator = state.validator(slashed_index)?;
    let effective = validator.effective_balance;
    let slashings_index = epoch % spec.epochs_per_slashings_vector;
    let accumulated = state.slashing(slashings_index)?;

    let state = state.update(|writer| {
        writer.update_validator(slashed_index, |v| {
            v.slashed = true;
            v.withdrawable_epoch = v
                .withdrawable_epoch
                .max(epoch + spec.epochs_per_slashings_vector);
        })?;
        writer.set_slashing(slashings_index, accumulated.saturating_add(effective))?;
        writer.decrease_balance(slashed_index, effective / spec.min_slashing_penalty_quotient)?;
        writer.increase_balance(whistleblower, effective / spec.whistleblower_reward_quotient)
    })?;
    state
        .update(|writer| writer.initiate_validator_exit(slashed_index))
        .map_err(Into::into)
}

fn process_proposer_slashing<V: BlsVerifier>(
    state: &BeaconState,
    slashing: &crate::types::ProposerSlashing,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let header_1 = &slashing.signed_header_1.message;
    let header_2 = &slashing.signed_header_2.message;
    let epoch = state.current_epoch()?;
    let proposer = state.validator(header_1.proposer_index)?;

    Verification::require(
        header_1.slot == header_2.slot,
        OperationKind::ProposerSlashing,
        "headers are from different slots",
    )
    .and_then(|| {
        Verification::require(
            header_1.proposer_index == header_2.proposer_index,
            OperationKind::ProposerSlashing,
            "headers are from different proposers",
        )
    })
    .and_then(|| {
        Verification::require(
            header_1 != header_2,
            OperationKind::ProposerSlashing,
            "headers are identical",
        )
    })
    .and_then(|| {
        Verification::require(
            proposer.is_slashable_at(epoch),
            OperationKind::ProposerSlashing,
            "proposer is not slashable",
        )
    })
    .into_result()?;

    for signed in [&slashing.signed_header_1, &slashing.signed_header_2] {
        let domain = domain_at(
            state,
            DOMAIN_BEACON_PROPOSER,
            state.spec().epoch_at_slot(signed.message.slot),
        )?;
        let signing_root = compute_signing_root(signed.message.canonical_root(), domain);
        Verification::require(
            bls.verify(&proposer.pubkey, signing_root, &signed.signature),
            OperationKind::ProposerSlashing,
            "header signature rejected",
        )
        .into_result()?;
    }

    slash_validator(state, header_1.proposer_index, header_1.proposer_index)
}

fn is_slashable_attestation_data(a: &AttestationData, b: &AttestationData) -> bool {
    // Double vote or surround vote.
    (a != b && a.target.epoch == b.target.epoch)
        || (a.source.epoch < b.source.epoch && b.target.epoch < a.target.epoch)
}

fn validate_indexed_attestation<V: BlsVerifier>(
    state: &BeaconState,
    indexed: &IndexedAttestation,
    bls: &V,
    kind: OperationKind,
) -> Result<(), BlockError> {
    let indices: Vec<u64> = indexed.attesting_indices.iter().copied().collect();
    Verification::require(
        !indices.is_empty(),
        kind,
        "attesting indices are empty",
    )
    .and_then(|| {
        Verification::require(
            indices.windows(2).all(|pair| pair[0] < pair[1]),
            kind,
            "attesting indices are not sorted and unique",
        )
    })
    .into_result()?;

    let mut pubkeys = Vec::with_capacity(indices.len());
    for index in &indices {
        pubkeys.push(state.validator(*index)?.pubkey);
    }
    let domain = domain_at(state, DOMAIN_BEACON_ATTESTER, indexed.data.target.epoch)?;
    let signing_root = compute_signing_root(indexed.data.tree_hash_root(), domain);
    Verification::require(
        bls.fast_aggregate_verify(&pubkeys, signing_root, &indexed.signature),
        kind,
        "aggregate signature rejected",
    )
    .into_result()
}

fn process_attester_slashing<V: BlsVerifier>(
    state: &BeaconState,
    slashing: &crate::types::AttesterSlashing,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let attestation_1 = &slashing.attestation_1;
    let attestation_2 = &slashing.attestation_2;

    Verification::require(
        is_slashable_attestation_data(&attestation_1.data, &attestation_2.data),
        OperationKind::AttesterSlashing,
        "attestations are not slashable together",
    )
    .into_result()?;
    validate_indexed_attestation(state, attestation_1, bls, OperationKind::AttesterSlashing)?;
    validate_indexed_attestation(state, attestation_2, bls, OperationKind::AttesterSlashing)?;

    let set_1: std::collections::BTreeSet<u64> =
        attestation_1.attesting_indices.iter().copied().collect();
    let epoch = state.current_epoch()?;
    let mut state = state.clone();
    let mut slashed_any = false;
    for index in attestation_2.attesting_indices.iter() {
        if set_1.contains(index) && state.validator(*index)?.is_slashable_at(epoch) {
            state = slash_validator(&state, *index, *index)?;
            slashed_any = true;
        }
    }
    Verification::require(
        slashed_any,
        OperationKind::AttesterSlashing,
        "no validator was slashable",
    )
    .into_result()?;
    Ok(state)
}

/// Committee members voting in `attestation`, in committee order.
pub fn attesting_indices(
    state: &BeaconState,
    attestation: &Attestation,
) -> Result<Vec<ValidatorIndex>, BlockError> {
    let committee = beacon_committee(state, attestation.data.slot, attestation.data.index)?;
    Verification::require(
        attestation.aggregation_bits.len() == committee.len(),
        OperationKind::Attestation,
        format!(
            "aggregation bits cover {} members, committee has {}",
            attestation.aggregation_bits.len(),
            committee.len()
        ),
    )
    .into_result()?;
    Ok(committee
        .iter()
        .enumerate()
        .filter(|(position, _)| {
            attestation
                .aggregation_bits
                .get(*position)
                .unwrap_or(false)
        })
        .map(|(_, index)| *index)
        .collect())
}

fn process_attestation<V: BlsVerifier>(
    state: &BeaconState,
    attestation: &Attestation,
    proposer_index: ValidatorIndex,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let spec = state.spec().clone();
    let data = &attestation.data;
    let current_epoch = state.current_epoch()?;
    let previous_epoch = state.previous_epoch()?;
    let slot = state.slot()?;

    Verification::require(
        data.target.epoch == current_epoch || data.target.epoch == previous_epoch,
        OperationKind::Attestation,
        format!("target epoch {} is not current or previous", data.target.epoch),
    )
    .and_then(|| {
        Verification::require(
            data.target.epoch == spec.epoch_at_slot(data.slot),
            OperationKind::Attestation,
            "target epoch does not match the attestation slot",
        )
    })
    .and_then(|| {
        Verification::require(
            data.slot + spec.min_attestation_inclusion_delay <= slot
                && slot <= data.slot + spec.slots_per_epoch,
            OperationKind::Attestation,
            "attestation outside its inclusion window",
        )
    })
    .into_result()?;

    let committees = committee_count_at_slot(state, data.slot)?;
    Verification::require(
        data.index < committees,
        OperationKind::Attestation,
        format!("committee index {} of {committees} does not exist", data.index),
    )
    .into_result()?;

    let attesters = attesting_indices(state, attestation)?;
    let indexed = IndexedAttestation {
        attesting_indices: attesters.clone().into(),
        data: data.clone(),
        signature: attestation.signature.clone(),
    };
    validate_indexed_attestation(state, &indexed, bls, OperationKind::Attestation)?;

    let is_current = data.target.epoch == current_epoch;
    let expected_source = if is_current {
        state.current_justified_checkpoint()?
    } else {
        state.previous_justified_checkpoint()?
    };
    Verification::require(
        data.source == expected_source,
        OperationKind::Attestation,
        "source checkpoint does not match the justified checkpoint",
    )
    .into_result()?;

    match state {
        BeaconState::Phase0(_) => {
            let pending = PendingAttestation {
                aggregation_bits: attestation.aggregation_bits.clone(),
                data: data.clone(),
                inclusion_delay: slot - data.slot,
                proposer_index,
            };
            Ok(state.update(|writer| {
                if is_current {
                    writer.push_current_epoch_attestation(&pending)
                } else {
                    writer.push_previous_epoch_attestation(&pending)
                }
            })?)
        }
        BeaconState::Altair(_) => {
            let target_matches = data.target.root
                == state.block_root_at_slot(spec.start_slot_of_epoch(data.target.epoch))?;
            let head_matches =
                target_matches && data.beacon_block_root == state.block_root_at_slot(data.slot)?;
            let timely_head = head_matches
                && slot - data.slot == spec.min_attestation_inclusion_delay;

            let mut flags = TIMELY_SOURCE_FLAG;
            if target_matches {
                flags |= TIMELY_TARGET_FLAG;
            }
            if timely_head {
                flags |= TIMELY_HEAD_FLAG;
            }

            Ok(state.update(|writer| {
                for index in &attesters {
                    let existing = writer.participation_flags(*index, is_current)?;
                    writer.set_participation_flags(*index, is_current, existing | flags)?;
                }
                Ok(())
            })?)
        }
    }
}

fn is_valid_merkle_branch(
    leaf: Hash256,
    branch: &[Hash256],
    depth: u64,
    index: u64,
    root: Hash256,
) -> bool {
    let mut value = leaf;
    for (i, node) in branch.iter().enumerate().take(depth as usize) {
        value = if (index >> i) & 1 == 1 {
            hash32_concat(node.as_slice(), value.as_slice()).into()
        } else {
            hash32_concat(value.as_slice(), node.as_slice()).into()
        };
    }
    value == root
}

fn process_deposit<V: BlsVerifier>(
    state: &BeaconState,
    deposit: &Deposit,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let spec = state.spec().clone();
    let deposit_index = state.eth1_deposit_index()?;
    let branch: Vec<Hash256> = deposit.proof.iter().copied().collect();

    Verification::require(
        is_valid_merkle_branch(
            deposit.data.tree_hash_root(),
            &branch,
            crate::eth_spec::DepositProofLength::to_u64(),
            deposit_index,
            state.eth1_data()?.deposit_root,
        ),
        OperationKind::Deposit,
        format!("merkle branch for deposit {deposit_index} rejected"),
    )
    .into_result()?;

    let state = state.update(|writer| writer.set_eth1_deposit_index(deposit_index + 1))?;

    let mut existing = None;
    for index in 0..state.validators_len()? {
        if state.validator(index)?.pubkey == deposit.data.pubkey {
            existing = Some(index);
            break;
        }
    }

    if let Some(index) = existing {
        return Ok(state.update(|writer| writer.increase_balance(index, deposit.data.amount))?);
    }

    // New key: the deposit signature stands alone, outside any fork.
    let domain = spec.compute_domain(
        DOMAIN_DEPOSIT,
        spec.genesis_fork_version,
        Hash256::ZERO,
    );
    let message = DepositMessage::from(&deposit.data);
    let signing_root = compute_signing_root(message.tree_hash_root(), domain);
    if !bls.verify(&deposit.data.pubkey, signing_root, &deposit.data.signature) {
        // Invalid key material burns the deposit without failing the block.
        return Ok(state);
    }

    let amount = deposit.data.amount;
    let effective =
        (amount - amount % spec.effective_balance_increment).min(spec.max_effective_balance);
    let validator = Validator {
        pubkey: deposit.data.pubkey.clone(),
        withdrawal_credentials: deposit.data.withdrawal_credentials,
        effective_balance: effective,
        slashed: false,
        activation_eligibility_epoch: FAR_FUTURE_EPOCH,
        activation_epoch: FAR_FUTURE_EPOCH,
        exit_epoch: FAR_FUTURE_EPOCH,
        withdrawable_epoch: FAR_FUTURE_EPOCH,
    };
    Ok(state.update(|writer| {
        writer.push_validator(&validator)?;
        writer.push_balance(amount)?;
        if writer.fork_name() == crate::chain_spec::ForkName::Altair {
            writer.push_participation(0)?;
            writer.push_inactivity_score(0)?;
        }
        Ok(())
    })?)
}

fn process_voluntary_exit<V: BlsVerifier>(
    state: &BeaconState,
    signed_exit: &crate::types::SignedVoluntaryExit,
    bls: &V,
) -> Result<BeaconState, BlockError> {
    let exit = &signed_exit.message;
    let spec = state.spec().clone();
    let current_epoch = state.current_epoch()?;
    let validator = state.validator(exit.validator_index)?;

    Verification::require(
        validator.is_active_at(current_epoch),
        OperationKind::VoluntaryExit,
        "validator is not active",
    )
    .and_then(|| {
        Verification::require(
            validator.exit_epoch == FAR_FUTURE_EPOCH,
            OperationKind::VoluntaryExit,
            "exit already initiated",
        )
    })
    .and_then(|| {
        Verification::require(
            current_epoch >= exit.epoch,
            OperationKind::VoluntaryExit,
            "exit epoch is in the future",
        )
    })
    .and_then(|| {
        Verification::require(
            current_epoch >= validator.activation_epoch + spec.shard_committee_period,
            OperationKind::VoluntaryExit,
            "validator has not been active long enough",
        )
    })
    .into_result()?;

    let domain = domain_at(state, DOMAIN_VOLUNTARY_EXIT, exit.epoch)?;
    let signing_root = compute_signing_root(exit.tree_hash_root(), domain);
    Verification::require(
        bls.verify(&validator.pubkey, signing_root, &signed_exit.signature),
        OperationKind::VoluntaryExit,
        "exit signature rejected",
    )
    .into_result()?;

    Ok(state.update(|writer| writer.initiate_validator_exit(exit.validator_index))?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bls::{AcceptAllSignatures, RejectAllSignatures};
    use crate::chain_spec::{ChainSpec, ForkName};
    use crate::types::{BeaconBlockBody, Eth1Data};
    use std::sync::Arc;

    fn stake() -> u64 {
        32_000_000_000
    }

    fn validator(byte: u8) -> Validator {
        Validator {
            pubkey: vec![byte; 48].into(),
            withdrawal_credentials: Hash256::repeat_byte(byte),
            effective_balance: stake(),
            slashed: false,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        }
    }

    fn genesis_state(fork: ForkName) -> BeaconState {
        let spec = Arc::new(ChainSpec::minimal());
        BeaconState::new_default(fork, spec)
            .update(|writer| {
                for i in 0..8u8 {
                    writer.push_validator(&validator(i))?;
                    writer.push_balance(stake())?;
                    if fork == ForkName::Altair {
                        writer.push_participation(0)?;
                        writer.push_inactivity_score(0)?;
                    }
                }
                Ok(())
            })
            .unwrap()
    }

    fn empty_body() -> BeaconBlockBody {
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

    fn block_on(state: &BeaconState) -> BeaconBlock {
        BeaconBlock {
            slot: state.slot().unwrap(),
            proposer_index: beacon_proposer_index(state).unwrap(),
            parent_root: state.latest_block_header().unwrap().canonical_root(),
            state_root: Hash256::ZERO,
            body: empty_body(),
        }
    }

    fn advance(state: &BeaconState, slot: u64) -> BeaconState {
        super::super::per_slot::process_slots(state, slot).unwrap()
    }

    #[test]
    fn empty_block_applies() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let block = block_on(&state);
        let post = process_block(&state, &block, &AcceptAllSignatures).unwrap();
        assert_eq!(post.latest_block_header().unwrap().slot, 1);
        // Eth1 vote recorded.
        assert_eq!(post.eth1_data_votes_len().unwrap(), 1);
    }

    #[test]
    fn wrong_parent_root_fails_the_header_check() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let mut block = block_on(&state);
        block.parent_root = Hash256::repeat_byte(0xee);
        let result = process_block(&state, &block, &AcceptAllSignatures);
        assert!(matches!(
            result,
            Err(BlockError::OperationInvalid {
                kind: OperationKind::Header,
                ..
            })
        ));
    }

    #[test]
    fn wrong_proposer_fails_the_header_check() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let mut block = block_on(&state);
        block.proposer_index = (block.proposer_index + 1) % 8;
        let result = process_block(&state, &block, &AcceptAllSignatures);
        assert!(matches!(
            result,
            Err(BlockError::OperationInvalid {
                kind: OperationKind::Header,
                ..
            })
        ));
    }

    #[test]
    fn rejected_randao_reveal_aborts_the_block() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let block = block_on(&state);
        let result = process_block(&state, &block, &RejectAllSignatures);
        assert!(matches!(
            result,
            Err(BlockError::OperationInvalid {
                kind: OperationKind::Randao,
                ..
            })
        ));
    }

    #[test]
    fn randao_mix_changes_after_the_block() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let epoch = state.current_epoch().unwrap();
        let block = block_on(&state);
        let post = process_block(&state, &block, &AcceptAllSignatures).unwrap();
        assert_ne!(
            post.randao_mix(epoch).unwrap(),
            state.randao_mix(epoch).unwrap()
        );
    }

    #[test]
    fn unexpected_deposit_count_fails() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let state = state
            .update(|writer| {
                writer.set_eth1_data(&Eth1Data {
                    deposit_root: Hash256::repeat_byte(1),
                    deposit_count: 3,
                    block_hash: Hash256::ZERO,
                })
            })
            .unwrap();
        let block = block_on(&state); // carries zero deposits
        let result = process_block(&state, &block, &AcceptAllSignatures);
        assert!(matches!(
            result,
            Err(BlockError::OperationInvalid {
                kind: OperationKind::Deposit,
                ..
            })
        ));
    }

    #[test]
    fn voluntary_exit_initiates_an_exit() {
        let spec = ChainSpec::minimal();
        let exit_ready_slot = (spec.shard_committee_period + 1) * spec.slots_per_epoch;
        let state = advance(&genesis_state(ForkName::Altair), exit_ready_slot + 1);
        let mut block = block_on(&state);
        block.body.voluntary_exits = vec![crate::types::SignedVoluntaryExit {
            message: crate::types::VoluntaryExit {
                epoch: 0,
                validator_index: 3,
            },
            signature: vec![0u8; 96].into(),
        }]
        .into();

        let post = process_block(&state, &block, &AcceptAllSignatures).unwrap();
        assert_ne!(post.validator(3).unwrap().exit_epoch, FAR_FUTURE_EPOCH);
    }

    #[test]
    fn proposer_slashing_burns_and_ejects() {
        let state = advance(&genesis_state(ForkName::Altair), 1);
        let offender = 5u64;
        let header = |byte: u8| crate::types::SignedBeaconBlockHeader {
            message: crate::types::BeaconBlockHeader {
                slot: 0,
                proposer_index: offender,
                parent_root: Hash256::repeat_byte(byte),
                state_root: Hash256::ZERO,
                body_root: Hash256::ZERO,
            },
            signature: vec![0u8; 96].into(),
        };
        let mut block = block_on(&state);
        block.body.proposer_slashings = vec![crate::types::ProposerSlashing {
            signed_header_1: header(1),
            signed_header_2: header(2),
        }]
        .into();

        let post = process_block(&state, &block, &AcceptAllSignatures).unwrap();
        let slashed = post.validator(offender).unwrap();
        assert!(slashed.slashed);
        assert!(post.balance(offender).unwrap() < stake());
    }
}
