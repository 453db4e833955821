//! Epoch-boundary processing: justification and finalization, registry
//! churn, balance hysteresis, ring resets and accumulator rotation.

use std::collections::BTreeSet;

use ethereum_hashing::hash32_concat;

use crate::chain_spec::FAR_FUTURE_EPOCH;
use crate::state::{BeaconState, StateError};
use crate::types::{Checkpoint, Epoch, Gwei, Hash256, PendingAttestation, ValidatorIndex};

use super::per_block::beacon_committee;

pub const TIMELY_SOURCE_FLAG: u8 = 1 << 0;
pub const TIMELY_TARGET_FLAG: u8 = 1 << 1;
pub const TIMELY_HEAD_FLAG: u8 = 1 << 2;

pub fn process_epoch(state: &BeaconState) -> Result<BeaconState, StateError> {
    let summary = participation_summary(state)?;
    let state = process_justification_and_finalization(state, &summary)?;
    let state = process_registry_updates(&state)?;
    let state = process_effective_balance_updates(&state)?;
    process_resets_and_rotation(&state)
}

/// Effective balances voting for the previous and current epoch targets.
#[derive(Debug, Clone, Copy)]
pub struct ParticipationSummary {
    pub total_active: Gwei,
    pub previous_target: Gwei,
    pub current_target: Gwei,
}

fn participation_summary(state: &BeaconState) -> Result<ParticipationSummary, StateError> {
    let current_epoch = state.current_epoch()?;
    let previous_epoch = state.previous_epoch()?;
    let total_active = state.total_active_balance(current_epoch)?;

    let (previous_target, current_target) = match state {
        BeaconState::Altair(_) => {
            let mut previous = 0u64;
            let mut current = 0u64;
            for index in 0..state.validators_len()? {
                let validator = state.validator(index)?;
                if validator.slashed {
                    continue;
                }
                if validator.is_active_at(previous_epoch)
                    && state.previous_epoch_participation(index)? & TIMELY_TARGET_FLAG != 0
                {
                    previous = previous.saturating_add(validator.effective_balance);
                }
                if validator.is_active_at(current_epoch)
                    && state.current_epoch_participation(index)? & TIMELY_TARGET_FLAG != 0
                {
                    current = current.saturating_add(validator.effective_balance);
                }
            }
            (previous, current)
        }
        BeaconState::Phase0(_) => {
            let previous =
                pending_target_balance(state, previous_epoch, PendingSource::Previous)?;
            let current = pending_target_balance(state, current_epoch, PendingSource::Current)?;
            (previous, current)
        }
    };

    Ok(ParticipationSummary {
        total_active,
        previous_target,
        current_target,
    })
}

enum PendingSource {
    Previous,
    Current,
}

/// Expand target-matching pending attestations back into validators and
/// sum their effective balances.
fn pending_target_balance(
    state: &BeaconState,
    epoch: Epoch,
    source: PendingSource,
) -> Result<Gwei, StateError> {
    let target_root = state.block_root_at_slot(state.spec().start_slot_of_epoch(epoch))?;
    let count = match source {
        PendingSource::Previous => state.previous_epoch_attestations_len()?,
        PendingSource::Current => state.current_epoch_attestations_len()?,
    };

    let mut attesters: BTreeSet<ValidatorIndex> = BTreeSet::new();
    for i in 0..count {
        let pending: PendingAttestation = match source {
            PendingSource::Previous => state.previous_epoch_attestation(i)?,
            PendingSource::Current => state.current_epoch_attestation(i)?,
        };
        if pending.data.target.root != target_root {
            continue;
        }
        let committee = beacon_committee(state, pending.data.slot, pending.data.index)?;
        for (position, validator) in committee.iter().enumerate() {
            if pending
                .aggregation_bits
                .get(position)
                .unwrap_or(false)
            {
                attesters.insert(*validator);
            }
        }
    }

    let mut balance = 0u64;
    for index in attesters {
        let validator = state.validator(index)?;
        if !validator.slashed {
            balance = balance.saturating_add(validator.effective_balance);
        }
    }
    Ok(balance)
}

fn checkpoint_at(state: &BeaconState, epoch: Epoch) -> Result<Checkpoint, StateError> {
    Ok(Checkpoint {
        epoch,
        root: state.block_root_at_slot(state.spec().start_slot_of_epoch(epoch))?,
    })
}

fn process_justification_and_finalization(
    state: &BeaconState,
    summary: &ParticipationSummary,
) -> Result<BeaconState, StateError> {
    let current_epoch = state.current_epoch()?;
    if current_epoch <= 1 {
        return Ok(state.clone());
    }
    let previous_epoch = current_epoch - 1;

    let old_previous_justified = state.previous_justified_checkpoint()?;
    let old_current_justified = state.current_justified_checkpoint()?;

    let mut bits = [
        false,
        state.justification_bit(0)?,
        state.justification_bit(1)?,
        state.justification_bit(2)?,
    ];
    let mut new_current_justified = old_current_justified;

    if summary.previous_target.saturating_mul(3) >= summary.total_active.saturating_mul(2) {
        new_current_justified = checkpoint_at(state, previous_epoch)?;
        bits[1] = true;
    }
    if summary.current_target.saturating_mul(3) >= summary.total_active.saturating_mul(2) {
        new_current_justified = checkpoint_at(state, current_epoch)?;
        bits[0] = true;
    }

    let mut new_finalized = state.finalized_checkpoint()?;
    // The 2nd/3rd/4th most recent epochs are justified and chain to the
    // candidate, in the four standard patterns.
    if bits[1] && bits[2] && bits[3] && old_previous_justified.epoch + 3 == current_epoch {
        new_finalized = old_previous_justified;
    }
    if bits[1] && bits[2] && old_previous_justified.epoch + 2 == current_epoch {
        new_finalized = old_previous_justified;
    }
    if bits[0] && bits[1] && bits[2] && old_current_justified.epoch + 2 == current_epoch {
        new_finalized = old_current_justified;
    }
    if bits[0] && bits[1] && old_current_justified.epoch + 1 == current_epoch {
        new_finalized = old_current_justified;
    }

    state.update(|writer| {
        writer.set_previous_justified_checkpoint(&old_current_justified)?;
        writer.set_current_justified_checkpoint(&new_current_justified)?;
        writer.set_finalized_checkpoint(&new_finalized)?;
        for (i, bit) in bits.iter().enumerate() {
            writer.set_justification_bit(i as u64, *bit)?;
        }
        Ok(())
    })
}

fn process_registry_updates(state: &BeaconState) -> Result<BeaconState, StateError> {
    let spec = state.spec().clone();
    let current_epoch = state.current_epoch()?;
    let finalized_epoch = state.finalized_checkpoint()?.epoch;

    let mut newly_eligible = Vec::new();
    let mut ejections = Vec::new();
    let mut activation_queue = Vec::new();
    for index in 0..state.validators_len()? {
        let validator = state.validator(index)?;
        if validator.activation_eligibility_epoch == FAR_FUTURE_EPOCH
            && validator.effective_balance == spec.max_effective_balance
        {
            newly_eligible.push(index);
        }
        if validator.is_active_at(current_epoch)
            && validator.effective_balance <= spec.ejection_balance
        {
            ejections.push(index);
        }
        if validator.activation_epoch == FAR_FUTURE_EPOCH
            && validator.activation_eligibility_epoch != FAR_FUTURE_EPOCH
            && validator.activation_eligibility_epoch <= finalized_epoch
        {
            activation_queue.push((validator.activation_eligibility_epoch, index));
        }
    }
    activation_queue.sort_unstable();
    let churn = spec.churn_limit(state.active_validator_indices(current_epoch)?.len() as u64);
    activation_queue.truncate(churn as usize);
    let activation_epoch = spec.activation_exit_epoch(current_epoch);

    state.update(|writer| {
        for index in newly_eligible {
            writer.update_validator(index, |v| {
                v.activation_eligibility_epoch = current_epoch + 1;
            })?;
        }
        for index in ejections {
            writer.initiate_validator_exit(index)?;
        }
        for (_, index) in activation_queue {
            writer.update_validator(index, |v| v.activation_epoch = activation_epoch)?;
        }
        Ok(())
    })
}

fn process_effective_balance_updates(state: &BeaconState) -> Result<BeaconState, StateError> {
    let spec = state.spec().clone();
    let hysteresis_increment = spec.effective_balance_increment / spec.hysteresis_quotient;
    let downward = hysteresis_increment * spec.hysteresis_downward_multiplier;
    let upward = hysteresis_increment * spec.hysteresis_upward_multiplier;

    let mut changes = Vec::new();
    for index in 0..state.validators_len()? {
        let validator = state.validator(index)?;
        let balance = state.balance(index)?;
        if balance + downward < validator.effective_balance
            || validator.effective_balance + upward < balance
        {
            let effective = (balance - balance % spec.effective_balance_increment)
                .min(spec.max_effective_balance);
            changes.push((index, effective));
        }
    }
    if changes.is_empty() {
        return Ok(state.clone());
    }
    state.update(|writer| {
        for (index, effective) in changes {
            writer.update_validator(index, |v| v.effective_balance = effective)?;
        }
        Ok(())
    })
}

fn process_resets_and_rotation(state: &BeaconState) -> Result<BeaconState, StateError> {
    let spec = state.spec().clone();
    let current_epoch = state.current_epoch()?;
    let next_epoch = current_epoch + 1;
    let current_mix = state.randao_mix(current_epoch)?;

    let accumulate_history =
        (next_epoch * spec.slots_per_epoch) % spec.slots_per_historical_root == 0;
    let historical_root: Option<Hash256> = if accumulate_history {
        let block_roots = state.view().field(crate::state::field::BLOCK_ROOTS)?;
        let state_roots = state.view().field(crate::state::field::STATE_ROOTS)?;
        Some(
            hash32_concat(
                block_roots.hash_tree_root().as_slice(),
                state_roots.hash_tree_root().as_slice(),
            )
            .into(),
        )
    } else {
        None
    };

    state.update(|writer| {
        writer.set_slashing(next_epoch % spec.epochs_per_slashings_vector, 0)?;
        writer.set_randao_mix(next_epoch, current_mix)?;
        if next_epoch % spec.epochs_per_eth1_voting_period == 0 {
            writer.clear_eth1_data_votes()?;
        }
        if let Some(root) = historical_root {
            writer.push_historical_root(root)?;
        }
        match writer.fork_name() {
            crate::chain_spec::ForkName::Phase0 => writer.rotate_epoch_attestations(),
            crate::chain_spec::ForkName::Altair => writer.rotate_participation(),
        }
    })
}
