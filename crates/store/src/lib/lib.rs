//! On-disk storage for blocks and states.
//!
//! Two logical families: *hot* data keyed by root for everything at or
//! beyond the finalized checkpoint, and *finalized* data keyed by slot,
//! with full states only every `state_storage_frequency` slots and the
//! gaps reconstructed by replay. All multi-key writes go through a single
//! RocksDB write batch, so a crash mid-commit leaves the previous view.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use fs2::FileExt;
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use ssz::{Decode, Encode};
use thiserror::Error;
use tracing::{debug, info};

use eth2_beacon_consensus::bls::AcceptAllSignatures;
use eth2_beacon_consensus::chain_spec::{ChainSpec, ForkName};
use eth2_beacon_consensus::state::{BeaconState, StateError};
use eth2_beacon_consensus::transition::{per_block, per_slot, BlockError};
use eth2_beacon_consensus::types::{Hash256, SignedBeaconBlock, Slot};

pub const SCHEMA_VERSION: u64 = 1;
const LOCK_FILE: &str = "LOCK";
const VERSION_KEY: &[u8] = b"schema_version";
const SPLIT_KEY: &[u8] = b"split_slot";

/// Column families with stable integer identifiers. The integers are the
/// on-disk contract; renames are free, renumbering is a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbColumn {
    HotBlock = 0,
    HotState = 1,
    HotIndex = 2,
    ColdBlock = 3,
    ColdState = 4,
    BlockSlots = 5,
    StateSlots = 6,
    Meta = 7,
}

impl DbColumn {
    pub fn all() -> [DbColumn; 8] {
        [
            DbColumn::HotBlock,
            DbColumn::HotState,
            DbColumn::HotIndex,
            DbColumn::ColdBlock,
            DbColumn::ColdState,
            DbColumn::BlockSlots,
            DbColumn::StateSlots,
            DbColumn::Meta,
        ]
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            DbColumn::HotBlock => "0:hot_block",
            DbColumn::HotState => "1:hot_state",
            DbColumn::HotIndex => "2:hot_index",
            DbColumn::ColdBlock => "3:cold_block",
            DbColumn::ColdState => "4:cold_state",
            DbColumn::BlockSlots => "5:block_slots",
            DbColumn::StateSlots => "6:state_slots",
            DbColumn::Meta => "7:meta",
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(String),
    #[error("another process holds the store lock")]
    LockHeld,
    #[error("on-disk schema {on_disk} is newer than supported {supported}")]
    SchemaMismatch { on_disk: u64, supported: u64 },
    #[error("storage corruption: {0}")]
    StorageCorruption(String),
    #[error("unknown block {0}")]
    UnknownBlock(Hash256),
    #[error("slot {0} is before the oldest stored snapshot")]
    Pruned(Slot),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("replay failed: {0}")]
    Replay(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(error: rocksdb::Error) -> Self {
        StoreError::Db(error.to_string())
    }
}

impl From<StateError> for StoreError {
    fn from(error: StateError) -> Self {
        StoreError::StorageCorruption(error.to_string())
    }
}

impl From<BlockError> for StoreError {
    fn from(error: BlockError) -> Self {
        StoreError::Replay(error.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Store a full finalized state every Nth slot; everything between is
    /// reconstructed by replay.
    pub state_storage_frequency: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_storage_frequency: 32,
        }
    }
}

/// One entry of an atomic write batch.
#[derive(Debug, Clone)]
pub enum StoreOp {
    PutHotBlock(Hash256, SignedBeaconBlock),
    PutHotState(Hash256, BeaconState),
    IndexHotBySlot(Slot, Hash256),
    DeleteHotBlock(Hash256),
    DeleteHotState(Hash256),
    PutColdBlock(Slot, SignedBeaconBlock),
    PutColdState(Slot, BeaconState),
    PutBlockSlot(Hash256, Slot),
    PutStateSlot(Hash256, Slot),
    SetSplitSlot(Slot),
}

pub struct Store {
    db: DB,
    _lock: File,
    config: StoreConfig,
    spec: Arc<ChainSpec>,
    fork: ForkName,
}

fn slot_key(slot: Slot) -> [u8; 8] {
    slot.to_be_bytes()
}

fn state_bytes(state: &BeaconState) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    out.push(match state.fork_name() {
        ForkName::Phase0 => 0u8,
        ForkName::Altair => 1u8,
    });
    out.extend_from_slice(&state.as_ssz_bytes()?);
    Ok(out)
}

impl Store {
    /// Acquire the directory lock, open the column families and bring the
    /// schema up to date.
    pub fn open(
        path: &Path,
        config: StoreConfig,
        spec: Arc<ChainSpec>,
        fork: ForkName,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path.join(LOCK_FILE))?;
        lock.try_lock_exclusive().map_err(|_| StoreError::LockHeld)?;

        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let descriptors: Vec<ColumnFamilyDescriptor> = DbColumn::all()
            .into_iter()
            .map(|column| ColumnFamilyDescriptor::new(column.name(), Options::default()))
            .collect();
        let db = DB::open_cf_descriptors(&options, path.join("db"), descriptors)?;

        let store = Self {
            db,
            _lock: lock,
            config,
            spec,
            fork,
        };
        store.migrate()?;
        Ok(store)
    }

    fn cf(&self, column: DbColumn) -> &rocksdb::ColumnFamily {
        self.db
            .cf_handle(column.name())
            .expect("all column families are opened at startup")
    }

    fn get(&self, column: DbColumn, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.db.get_cf(self.cf(column), key)?)
    }

    pub fn schema_version(&self) -> Result<u64, StoreError> {
        match self.get(DbColumn::Meta, VERSION_KEY)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    StoreError::StorageCorruption("schema version marker truncated".into())
                })?;
                Ok(u64::from_be_bytes(raw))
            }
            None => Ok(0),
        }
    }

    /// Run pending migrations in ascending order. A database written by a
    /// newer schema is refused.
    fn migrate(&self) -> Result<(), StoreError> {
        let mut version = self.schema_version()?;
        if version > SCHEMA_VERSION {
            return Err(StoreError::SchemaMismatch {
                on_disk: version,
                supported: SCHEMA_VERSION,
            });
        }
        while version < SCHEMA_VERSION {
            match version {
                // 0 -> 1: initial layout, nothing to rewrite.
                0 => {}
                other => {
                    return Err(StoreError::StorageCorruption(format!(
                        "no migration path from schema {other}"
                    )))
                }
            }
            version += 1;
            info!(version, "store schema migrated");
        }
        self.db.put_cf(
            self.cf(DbColumn::Meta),
            VERSION_KEY,
            SCHEMA_VERSION.to_be_bytes(),
        )?;
        Ok(())
    }

    /// Apply every operation in one atomic write.
    pub fn commit(&self, ops: Vec<StoreOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                StoreOp::PutHotBlock(root, block) => {
                    batch.put_cf(self.cf(DbColumn::HotBlock), root, block.as_ssz_bytes());
                }
                StoreOp::PutHotState(root, state) => {
                    batch.put_cf(self.cf(DbColumn::HotState), root, state_bytes(&state)?);
                }
                StoreOp::IndexHotBySlot(slot, root) => {
                    batch.put_cf(self.cf(DbColumn::HotIndex), slot_key(slot), root);
                }
                StoreOp::DeleteHotBlock(root) => {
                    batch.delete_cf(self.cf(DbColumn::HotBlock), root);
                }
                StoreOp::DeleteHotState(root) => {
                    batch.delete_cf(self.cf(DbColumn::HotState), root);
                }
                StoreOp::PutColdBlock(slot, block) => {
                    batch.put_cf(self.cf(DbColumn::ColdBlock), slot_key(slot), block.as_ssz_bytes());
                }
                StoreOp::PutColdState(slot, state) => {
                    batch.put_cf(self.cf(DbColumn::ColdState), slot_key(slot), state_bytes(&state)?);
                }
                StoreOp::PutBlockSlot(root, slot) => {
                    batch.put_cf(self.cf(DbColumn::BlockSlots), root, slot_key(slot));
                }
                StoreOp::PutStateSlot(root, slot) => {
                    batch.put_cf(self.cf(DbColumn::StateSlots), root, slot_key(slot));
                }
                StoreOp::SetSplitSlot(slot) => {
                    batch.put_cf(self.cf(DbColumn::Meta), SPLIT_KEY, slot_key(slot));
                }
            }
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn decode_block(&self, bytes: &[u8]) -> Result<SignedBeaconBlock, StoreError> {
        SignedBeaconBlock::from_ssz_bytes(bytes)
            .map_err(|e| StoreError::StorageCorruption(format!("block record rejected: {e:?}")))
    }

    fn decode_state(&self, bytes: &[u8]) -> Result<BeaconState, StoreError> {
        let (tag, body) = bytes
            .split_first()
            .ok_or_else(|| StoreError::StorageCorruption("empty state record".into()))?;
        let fork = match tag {
            0 => ForkName::Phase0,
            1 => ForkName::Altair,
            other => {
                return Err(StoreError::StorageCorruption(format!(
                    "unknown state fork tag {other}"
                )))
            }
        };
        Ok(BeaconState::from_ssz_bytes(fork, self.spec.clone(), body)?)
    }

    pub fn hot_block(&self, root: &Hash256) -> Result<Option<SignedBeaconBlock>, StoreError> {
        self.get(DbColumn::HotBlock, root.as_slice())?
            .map(|bytes| self.decode_block(&bytes))
            .transpose()
    }

    pub fn hot_state(&self, root: &Hash256) -> Result<Option<BeaconState>, StoreError> {
        self.get(DbColumn::HotState, root.as_slice())?
            .map(|bytes| self.decode_state(&bytes))
            .transpose()
    }

    pub fn hot_root_at_slot(&self, slot: Slot) -> Result<Option<Hash256>, StoreError> {
        Ok(self
            .get(DbColumn::HotIndex, &slot_key(slot))?
            .map(|bytes| Hash256::from_slice(&bytes)))
    }

    pub fn cold_block(&self, slot: Slot) -> Result<Option<SignedBeaconBlock>, StoreError> {
        self.get(DbColumn::ColdBlock, &slot_key(slot))?
            .map(|bytes| self.decode_block(&bytes))
            .transpose()
    }

    pub fn slot_of_block(&self, root: &Hash256) -> Result<Option<Slot>, StoreError> {
        Ok(self
            .get(DbColumn::BlockSlots, root.as_slice())?
            .map(|bytes| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw)
            }))
    }

    /// Hot/finalized boundary; hot data below it has been migrated.
    pub fn split_slot(&self) -> Result<Slot, StoreError> {
        Ok(self
            .get(DbColumn::Meta, SPLIT_KEY)?
            .map(|bytes| {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&bytes);
                u64::from_be_bytes(raw)
            })
            .unwrap_or(0))
    }

    /// Finalized state at `slot`: the stored snapshot when the slot is on
    /// the storage frequency, otherwise the nearest earlier snapshot
    /// replayed forward through the stored blocks.
    pub fn cold_state(&self, slot: Slot) -> Result<Option<BeaconState>, StoreError> {
        let frequency = self.config.state_storage_frequency;
        let mut snapshot_slot = slot - slot % frequency;
        let snapshot = loop {
            match self.get(DbColumn::ColdState, &slot_key(snapshot_slot))? {
                Some(bytes) => break self.decode_state(&bytes)?,
                None if snapshot_slot == 0 => return Ok(None),
                None => snapshot_slot -= frequency.min(snapshot_slot),
            }
        };
        if snapshot_slot == slot {
            return Ok(Some(snapshot));
        }

        let mut state = snapshot;
        for replay_slot in snapshot_slot + 1..=slot {
            if let Some(block) = self.cold_block(replay_slot)? {
                state = per_slot::process_slots(&state, replay_slot)?;
                state = per_block::process_block(&state, &block.message, &AcceptAllSignatures)?;
            }
        }
        if state.slot()? < slot {
            state = per_slot::process_slots(&state, slot)?;
        }
        debug!(slot, from = snapshot_slot, "state reconstructed by replay");
        Ok(Some(state))
    }

    /// Migrate a finalized canonical chain segment out of the hot family.
    /// `chain` is (slot, block root) pairs in ascending slot order.
    pub fn finalize_segment(&self, chain: &[(Slot, Hash256)]) -> Result<(), StoreError> {
        let frequency = self.config.state_storage_frequency;
        let mut ops = Vec::new();
        for (slot, root) in chain {
            let block = self
                .hot_block(root)?
                .ok_or(StoreError::UnknownBlock(*root))?;
            ops.push(StoreOp::PutColdBlock(*slot, block));
            ops.push(StoreOp::PutBlockSlot(*root, *slot));
            if slot % frequency == 0 {
                if let Some(state) = self.hot_state(root)? {
                    ops.push(StoreOp::PutStateSlot(state.hash_tree_root(), *slot));
                    ops.push(StoreOp::PutColdState(*slot, state));
                }
            }
            ops.push(StoreOp::DeleteHotBlock(*root));
            ops.push(StoreOp::DeleteHotState(*root));
        }
        if let Some((slot, _)) = chain.last() {
            ops.push(StoreOp::SetSplitSlot(*slot));
        }
        self.commit(ops)
    }

    pub fn fork(&self) -> ForkName {
        self.fork
    }

    pub fn spec(&self) -> &Arc<ChainSpec> {
        &self.spec
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn open_store(dir: &Path) -> Store {
        Store::open(
            dir,
            StoreConfig::default(),
            Arc::new(ChainSpec::minimal()),
            ForkName::Altair,
        )
        .unwrap()
    }

    #[test]
    fn fresh_store_lands_on_the_current_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
        assert_eq!(store.split_slot().unwrap(), 0);
    }

    #[test]
    fn schema_version_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        drop(open_store(dir.path()));
        let store = open_store(dir.path());
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn a_newer_on_disk_schema_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = open_store(dir.path());
            store
                .db
                .put_cf(
                    store.cf(DbColumn::Meta),
                    VERSION_KEY,
                    (SCHEMA_VERSION + 5).to_be_bytes(),
                )
                .unwrap();
        }
        let result = Store::open(
            dir.path(),
            StoreConfig::default(),
            Arc::new(ChainSpec::minimal()),
            ForkName::Altair,
        );
        assert!(matches!(
            result,
            Err(StoreError::SchemaMismatch { on_disk, .. }) if on_disk == SCHEMA_VERSION + 5
        ));
    }

    #[test]
    fn the_directory_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let _held = open_store(dir.path());
        let second = Store::open(
            dir.path(),
            StoreConfig::default(),
            Arc::new(ChainSpec::minimal()),
            ForkName::Altair,
        );
        assert!(matches!(second, Err(StoreError::LockHeld)));
    }
}
