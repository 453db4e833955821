//! Hot/finalized storage flow: atomic batches, finalization migration and
//! replay-based state reconstruction.

use std::sync::Arc;

use eth2_beacon_consensus::chain_spec::{ChainSpec, ForkName};
use eth2_beacon_consensus::testing;
use eth2_beacon_consensus::types::{Hash256, Slot};
use eth2_beacon_store::{Store, StoreConfig, StoreOp};

fn open_store(dir: &std::path::Path, frequency: u64) -> Store {
    Store::open(
        dir,
        StoreConfig {
            state_storage_frequency: frequency,
        },
        Arc::new(ChainSpec::minimal()),
        ForkName::Altair,
    )
    .unwrap()
}

#[test]
fn hot_writes_commit_together_and_read_back() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 32);

    let spec = Arc::new(ChainSpec::minimal());
    let (state, anchor) = testing::genesis(ForkName::Altair, spec, 4);
    let root = anchor.canonical_root();

    store
        .commit(vec![
            StoreOp::PutHotBlock(root, anchor.clone()),
            StoreOp::PutHotState(root, state.clone()),
            StoreOp::IndexHotBySlot(0, root),
        ])
        .unwrap();

    let block = store.hot_block(&root).unwrap().unwrap();
    assert_eq!(block.canonical_root(), root);
    let stored_state = store.hot_state(&root).unwrap().unwrap();
    assert_eq!(stored_state.hash_tree_root(), state.hash_tree_root());
    assert_eq!(store.hot_root_at_slot(0).unwrap(), Some(root));
    assert_eq!(store.hot_block(&Hash256::repeat_byte(9)).unwrap(), None);
}

#[test]
fn finalization_migrates_hot_data_and_replay_fills_the_gaps() {
    let dir = tempfile::tempdir().unwrap();
    let frequency = 4;
    let store = open_store(dir.path(), frequency);

    let spec = Arc::new(ChainSpec::minimal());
    let (genesis_state, anchor) = testing::genesis(ForkName::Altair, spec, 4);
    let anchor_root = anchor.canonical_root();

    // Build a short canonical chain and store it hot, tracking each
    // post-state alongside its block.
    let mut ops = vec![
        StoreOp::PutHotBlock(anchor_root, anchor),
        StoreOp::PutHotState(anchor_root, genesis_state.clone()),
    ];
    let mut chain: Vec<(Slot, Hash256)> = vec![(0, anchor_root)];
    let mut states = vec![genesis_state.clone()];
    let mut state = genesis_state;
    for slot in 1..=6 {
        let (block, post) = testing::produce_block(&state, slot).unwrap();
        let root = block.canonical_root();
        ops.push(StoreOp::PutHotBlock(root, block));
        ops.push(StoreOp::PutHotState(root, post.clone()));
        chain.push((slot, root));
        states.push(post.clone());
        state = post;
    }
    store.commit(ops).unwrap();

    store.finalize_segment(&chain).unwrap();

    // Hot entries are gone, cold blocks are indexed by slot.
    for (slot, root) in &chain {
        assert!(store.hot_block(root).unwrap().is_none());
        let cold = store.cold_block(*slot).unwrap().unwrap();
        assert_eq!(cold.canonical_root(), *root);
        assert_eq!(store.slot_of_block(root).unwrap(), Some(*slot));
    }
    assert_eq!(store.split_slot().unwrap(), 6);

    // Slot 4 sits on the storage frequency: direct snapshot.
    let on_frequency = store.cold_state(4).unwrap().unwrap();
    assert_eq!(on_frequency.hash_tree_root(), states[4].hash_tree_root());

    // Slot 6 does not: replayed from the slot-4 snapshot.
    let replayed = store.cold_state(6).unwrap().unwrap();
    assert_eq!(replayed.hash_tree_root(), states[6].hash_tree_root());
}

#[test]
fn missing_snapshot_yields_none_rather_than_garbage() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), 4);
    assert!(store.cold_state(12).unwrap().is_none());
}
