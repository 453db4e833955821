//! Per-slot processing: root caching and epoch-boundary hand-off.

use crate::state::{BeaconState, StateError};
use crate::types::{Hash256, Slot};

use super::per_epoch;

/// Advance `state` to `target_slot`, applying per-slot caching and epoch
/// processing at each boundary. Re-running from the same pre-state yields
/// the same post-state.
pub fn process_slots(state: &BeaconState, target_slot: Slot) -> Result<BeaconState, StateError> {
    let mut state = state.clone();
    while state.slot()? < target_slot {
        state = process_slot(&state)?;
        let next_slot = state.slot()? + 1;
        if next_slot % state.spec().slots_per_epoch == 0 {
            state = per_epoch::process_epoch(&state)?;
        }
        state = state.update(|writer| writer.set_slot(next_slot))?;
    }
    Ok(state)
}

/// Cache the previous state root and block root into the ring vectors,
/// filling the header's state root on first touch.
pub fn process_slot(state: &BeaconState) -> Result<BeaconState, StateError> {
    let previous_state_root = state.hash_tree_root();
    let slot = state.slot()?;
    let cache_index = slot % state.spec().slots_per_historical_root;

    state.update(|writer| {
        writer.set_state_root(cache_index, previous_state_root)?;
        let mut header = writer.latest_block_header()?;
        if header.state_root == Hash256::ZERO {
            header.state_root = previous_state_root;
            writer.set_latest_block_header(&header)?;
        }
        writer.set_block_root(cache_index, header.canonical_root())
    })
}
