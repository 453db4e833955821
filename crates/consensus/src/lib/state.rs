//! Tree-backed beacon state.
//!
//! The state is a named-field container over the hash-consed tree, with one
//! variant per fork. Reads go through cheap immutable views; `update`
//! stages writes on a copy-on-write view and commits them as one batched
//! tree update, so readers holding the previous state never observe
//! partial mutations.

use std::sync::Arc;

use ethereum_hashing::hash_fixed;
use ssz::{Decode, Encode};
use thiserror::Error;
use typenum::Unsigned;

use crate::chain_spec::{ChainSpec, ForkName, FAR_FUTURE_EPOCH};
use crate::codec;
use crate::schema::SszSchema;
use crate::tree::Node;
use crate::types::{
    BeaconBlockHeader, Checkpoint, Epoch, Eth1Data, Fork, Gwei, Hash256, PendingAttestation,
    Slot, Validator, ValidatorIndex,
};
use crate::view::{MutView, View, ViewError};

#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    View(#[from] ViewError),
    #[error("operation requires the {wanted} fork")]
    WrongFork { wanted: &'static str },
    #[error("value codec round trip failed: {0}")]
    ValueCodec(String),
    #[error("unknown validator {0}")]
    UnknownValidator(ValidatorIndex),
}

/// Field positions shared by every fork; 15 and 16 are repurposed by
/// Altair and 21 exists only there.
pub mod field {
    pub const GENESIS_TIME: usize = 0;
    pub const GENESIS_VALIDATORS_ROOT: usize = 1;
    pub const SLOT: usize = 2;
    pub const FORK: usize = 3;
    pub const LATEST_BLOCK_HEADER: usize = 4;
    pub const BLOCK_ROOTS: usize = 5;
    pub const STATE_ROOTS: usize = 6;
    pub const HISTORICAL_ROOTS: usize = 7;
    pub const ETH1_DATA: usize = 8;
    pub const ETH1_DATA_VOTES: usize = 9;
    pub const ETH1_DEPOSIT_INDEX: usize = 10;
    pub const VALIDATORS: usize = 11;
    pub const BALANCES: usize = 12;
    pub const RANDAO_MIXES: usize = 13;
    pub const SLASHINGS: usize = 14;
    pub const PREVIOUS_EPOCH_ATTESTATIONS: usize = 15;
    pub const CURRENT_EPOCH_ATTESTATIONS: usize = 16;
    pub const PREVIOUS_EPOCH_PARTICIPATION: usize = 15;
    pub const CURRENT_EPOCH_PARTICIPATION: usize = 16;
    pub const JUSTIFICATION_BITS: usize = 17;
    pub const PREVIOUS_JUSTIFIED_CHECKPOINT: usize = 18;
    pub const CURRENT_JUSTIFIED_CHECKPOINT: usize = 19;
    pub const FINALIZED_CHECKPOINT: usize = 20;
    pub const INACTIVITY_SCORES: usize = 21;
}

pub fn checkpoint_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("epoch", SszSchema::uint64()),
        ("root", SszSchema::bytes32()),
    ])
}

pub fn fork_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("previous_version", SszSchema::byte_vector(4)),
        ("current_version", SszSchema::byte_vector(4)),
        ("epoch", SszSchema::uint64()),
    ])
}

pub fn block_header_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("slot", SszSchema::uint64()),
        ("proposer_index", SszSchema::uint64()),
        ("parent_root", SszSchema::bytes32()),
        ("state_root", SszSchema::bytes32()),
        ("body_root", SszSchema::bytes32()),
    ])
}

pub fn eth1_data_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("deposit_root", SszSchema::bytes32()),
        ("deposit_count", SszSchema::uint64()),
        ("block_hash", SszSchema::bytes32()),
    ])
}

pub fn validator_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("pubkey", SszSchema::byte_vector(48)),
        ("withdrawal_credentials", SszSchema::bytes32()),
        ("effective_balance", SszSchema::uint64()),
        ("slashed", SszSchema::boolean()),
        ("activation_eligibility_epoch", SszSchema::uint64()),
        ("activation_epoch", SszSchema::uint64()),
        ("exit_epoch", SszSchema::uint64()),
        ("withdrawable_epoch", SszSchema::uint64()),
    ])
}

fn attestation_data_schema() -> Arc<SszSchema> {
    SszSchema::container(vec![
        ("slot", SszSchema::uint64()),
        ("index", SszSchema::uint64()),
        ("beacon_block_root", SszSchema::bytes32()),
        ("source", checkpoint_schema()),
        ("target", checkpoint_schema()),
    ])
}

fn pending_attestation_schema(spec: &ChainSpec) -> Arc<SszSchema> {
    SszSchema::container(vec![
        (
            "aggregation_bits",
            SszSchema::bitlist(spec.max_validators_per_committee),
        ),
        ("data", attestation_data_schema()),
        ("inclusion_delay", SszSchema::uint64()),
        ("proposer_index", SszSchema::uint64()),
    ])
}

pub fn beacon_state_schema(fork: ForkName, spec: &ChainSpec) -> Arc<SszSchema> {
    let epoch_attestation_limit =
        crate::eth_spec::MaxAttestations::to_u64() * spec.slots_per_epoch;
    let mut fields = vec![
        ("genesis_time", SszSchema::uint64()),
        ("genesis_validators_root", SszSchema::bytes32()),
        ("slot", SszSchema::uint64()),
        ("fork", fork_schema()),
        ("latest_block_header", block_header_schema()),
        (
            "block_roots",
            SszSchema::vector(SszSchema::bytes32(), spec.slots_per_historical_root),
        ),
        (
            "state_roots",
            SszSchema::vector(SszSchema::bytes32(), spec.slots_per_historical_root),
        ),
        (
            "historical_roots",
            SszSchema::list(SszSchema::bytes32(), spec.historical_roots_limit),
        ),
        ("eth1_data", eth1_data_schema()),
        (
            "eth1_data_votes",
            SszSchema::list(
                eth1_data_schema(),
                spec.epochs_per_eth1_voting_period * spec.slots_per_epoch,
            ),
        ),
        ("eth1_deposit_index", SszSchema::uint64()),
        (
            "validators",
            SszSchema::list(validator_schema(), spec.validator_registry_limit),
        ),
        (
            "balances",
            SszSchema::list(SszSchema::uint64(), spec.validator_registry_limit),
        ),
        (
            "randao_mixes",
            SszSchema::vector(SszSchema::bytes32(), spec.epochs_per_historical_vector),
        ),
        (
            "slashings",
            SszSchema::vector(SszSchema::uint64(), spec.epochs_per_slashings_vector),
        ),
    ];
    match fork {
        ForkName::Phase0 => {
            fields.push((
                "previous_epoch_attestations",
                SszSchema::list(pending_attestation_schema(spec), epoch_attestation_limit),
            ));
            fields.push((
                "current_epoch_attestations",
                SszSchema::list(pending_attestation_schema(spec), epoch_attestation_limit),
            ));
        }
        ForkName::Altair => {
            fields.push((
                "previous_epoch_participation",
                SszSchema::list(SszSchema::uint8(), spec.validator_registry_limit),
            ));
            fields.push((
                "current_epoch_participation",
                SszSchema::list(SszSchema::uint8(), spec.validator_registry_limit),
            ));
        }
    }
    fields.push(("justification_bits", SszSchema::bitvector(4)));
    fields.push(("previous_justified_checkpoint", checkpoint_schema()));
    fields.push(("current_justified_checkpoint", checkpoint_schema()));
    fields.push(("finalized_checkpoint", checkpoint_schema()));
    if fork == ForkName::Altair {
        fields.push((
            "inactivity_scores",
            SszSchema::list(SszSchema::uint64(), spec.validator_registry_limit),
        ));
    }
    SszSchema::container(fields)
}

fn value_view<T: Encode>(schema: Arc<SszSchema>, value: &T) -> Result<View, StateError> {
    Ok(View::from_ssz_bytes(schema, &value.as_ssz_bytes())?)
}

fn view_value<T: Decode>(view: &View) -> Result<T, StateError> {
    T::from_ssz_bytes(&view.serialize()?).map_err(|e| StateError::ValueCodec(format!("{e:?}")))
}

/// Fork-shared body of a beacon state.
#[derive(Debug, Clone)]
pub struct StateView {
    spec: Arc<ChainSpec>,
    view: View,
}

#[derive(Debug, Clone)]
pub enum BeaconState {
    Phase0(StateView),
    Altair(StateView),
}

impl BeaconState {
    pub fn new_default(fork: ForkName, spec: Arc<ChainSpec>) -> Self {
        let schema = beacon_state_schema(fork, &spec);
        let inner = StateView {
            spec,
            view: View::new_default(schema),
        };
        match fork {
            ForkName::Phase0 => BeaconState::Phase0(inner),
            ForkName::Altair => BeaconState::Altair(inner),
        }
    }

    pub fn from_ssz_bytes(
        fork: ForkName,
        spec: Arc<ChainSpec>,
        bytes: &[u8],
    ) -> Result<Self, StateError> {
        let schema = beacon_state_schema(fork, &spec);
        let view = View::from_ssz_bytes(schema, bytes)?;
        let inner = StateView { spec, view };
        Ok(match fork {
            ForkName::Phase0 => BeaconState::Phase0(inner),
            ForkName::Altair => BeaconState::Altair(inner),
        })
    }

    pub fn as_ssz_bytes(&self) -> Result<Vec<u8>, StateError> {
        Ok(self.inner().view.serialize()?)
    }

    pub fn fork_name(&self) -> ForkName {
        match self {
            BeaconState::Phase0(_) => ForkName::Phase0,
            BeaconState::Altair(_) => ForkName::Altair,
        }
    }

    fn inner(&self) -> &StateView {
        match self {
            BeaconState::Phase0(inner) | BeaconState::Altair(inner) => inner,
        }
    }

    pub fn spec(&self) -> &Arc<ChainSpec> {
        &self.inner().spec
    }

    pub fn view(&self) -> &View {
        &self.inner().view
    }

    pub fn hash_tree_root(&self) -> Hash256 {
        self.inner().view.hash_tree_root()
    }

    /// Apply `mutator` on a write view and commit into a fresh state.
    pub fn update<F>(&self, mutator: F) -> Result<BeaconState, StateError>
    where
        F: FnOnce(&mut StateWriter) -> Result<(), StateError>,
    {
        let mut writer = StateWriter {
            fork: self.fork_name(),
            spec: self.inner().spec.clone(),
            inner: MutView::new(&self.inner().view),
        };
        mutator(&mut writer)?;
        let view = writer.inner.commit()?;
        let inner = StateView {
            spec: self.inner().spec.clone(),
            view,
        };
        Ok(match self.fork_name() {
            ForkName::Phase0 => BeaconState::Phase0(inner),
            ForkName::Altair => BeaconState::Altair(inner),
        })
    }

    // Versioning

    pub fn genesis_time(&self) -> Result<u64, StateError> {
        Ok(self.view().field(field::GENESIS_TIME)?.as_u64()?)
    }

    pub fn genesis_validators_root(&self) -> Result<Hash256, StateError> {
        Ok(self
            .view()
            .field(field::GENESIS_VALIDATORS_ROOT)?
            .as_hash256()?)
    }

    pub fn slot(&self) -> Result<Slot, StateError> {
        Ok(self.view().field(field::SLOT)?.as_u64()?)
    }

    pub fn fork(&self) -> Result<Fork, StateError> {
        view_value(&self.view().field(field::FORK)?)
    }

    pub fn current_epoch(&self) -> Result<Epoch, StateError> {
        Ok(self.spec().epoch_at_slot(self.slot()?))
    }

    pub fn previous_epoch(&self) -> Result<Epoch, StateError> {
        Ok(self.current_epoch()?.saturating_sub(1))
    }

    // History

    pub fn latest_block_header(&self) -> Result<BeaconBlockHeader, StateError> {
        view_value(&self.view().field(field::LATEST_BLOCK_HEADER)?)
    }

    pub fn block_root_at_index(&self, index: u64) -> Result<Hash256, StateError> {
        Ok(self
            .view()
            .field(field::BLOCK_ROOTS)?
            .element(index)?
            .as_hash256()?)
    }

    pub fn block_root_at_slot(&self, slot: Slot) -> Result<Hash256, StateError> {
        self.block_root_at_index(slot % self.spec().slots_per_historical_root)
    }

    pub fn state_root_at_index(&self, index: u64) -> Result<Hash256, StateError> {
        Ok(self
            .view()
            .field(field::STATE_ROOTS)?
            .element(index)?
            .as_hash256()?)
    }

    pub fn historical_roots_len(&self) -> Result<u64, StateError> {
        Ok(self.view().field(field::HISTORICAL_ROOTS)?.list_len()?)
    }

    // Eth1

    pub fn eth1_data(&self) -> Result<Eth1Data, StateError> {
        view_value(&self.view().field(field::ETH1_DATA)?)
    }

    pub fn eth1_data_votes_len(&self) -> Result<u64, StateError> {
        Ok(self.view().field(field::ETH1_DATA_VOTES)?.list_len()?)
    }

    pub fn eth1_data_vote(&self, index: u64) -> Result<Eth1Data, StateError> {
        view_value(&self.view().field(field::ETH1_DATA_VOTES)?.element(index)?)
    }

    pub fn eth1_deposit_index(&self) -> Result<u64, StateError> {
        Ok(self.view().field(field::ETH1_DEPOSIT_INDEX)?.as_u64()?)
    }

    // Registry

    pub fn validators_len(&self) -> Result<u64, StateError> {
        Ok(self.view().field(field::VALIDATORS)?.list_len()?)
    }

    pub fn validator(&self, index: ValidatorIndex) -> Result<Validator, StateError> {
        if index >= self.validators_len()? {
            return Err(StateError::UnknownValidator(index));
        }
        view_value(&self.view().field(field::VALIDATORS)?.element(index)?)
    }

    pub fn balance(&self, index: ValidatorIndex) -> Result<Gwei, StateError> {
        Ok(self.view().field(field::BALANCES)?.element_u64(index)?)
    }

    pub fn active_validator_indices(&self, epoch: Epoch) -> Result<Vec<ValidatorIndex>, StateError> {
        let mut active = Vec::new();
        for index in 0..self.validators_len()? {
            if self.validator(index)?.is_active_at(epoch) {
                active.push(index);
            }
        }
        Ok(active)
    }

    pub fn total_active_balance(&self, epoch: Epoch) -> Result<Gwei, StateError> {
        let mut total = 0u64;
        for index in self.active_validator_indices(epoch)? {
            total = total.saturating_add(self.validator(index)?.effective_balance);
        }
        Ok(total.max(self.spec().effective_balance_increment))
    }

    pub fn effective_balances(&self) -> Result<Vec<Gwei>, StateError> {
        let epoch = self.current_epoch()?;
        let mut balances = Vec::with_capacity(self.validators_len()? as usize);
        for index in 0..self.validators_len()? {
            let validator = self.validator(index)?;
            balances.push(if validator.is_active_at(epoch) {
                validator.effective_balance
            } else {
                0
            });
        }
        Ok(balances)
    }

    // Randomness

    pub fn randao_mix(&self, epoch: Epoch) -> Result<Hash256, StateError> {
        let index = epoch % self.spec().epochs_per_historical_vector;
        Ok(self
            .view()
            .field(field::RANDAO_MIXES)?
            .element(index)?
            .as_hash256()?)
    }

    /// Shuffling seed for `epoch`: domain, epoch and a historical mix.
    pub fn seed(&self, epoch: Epoch, domain_type: [u8; 4]) -> Result<Hash256, StateError> {
        let spec = self.spec();
        let lookback =
            epoch + spec.epochs_per_historical_vector - spec.min_seed_lookahead - 1;
        let mix = self.randao_mix(lookback)?;
        let mut preimage = Vec::with_capacity(44);
        preimage.extend_from_slice(&domain_type);
        preimage.extend_from_slice(&epoch.to_le_bytes());
        preimage.extend_from_slice(mix.as_slice());
        Ok(Hash256::from(hash_fixed(&preimage)))
    }

    // Slashings

    pub fn slashing(&self, index: u64) -> Result<Gwei, StateError> {
        Ok(self.view().field(field::SLASHINGS)?.element_u64(index)?)
    }

    // Finality

    pub fn justification_bit(&self, index: u64) -> Result<bool, StateError> {
        Ok(self.view().field(field::JUSTIFICATION_BITS)?.bit(index)?)
    }

    pub fn previous_justified_checkpoint(&self) -> Result<Checkpoint, StateError> {
        view_value(&self.view().field(field::PREVIOUS_JUSTIFIED_CHECKPOINT)?)
    }

    pub fn current_justified_checkpoint(&self) -> Result<Checkpoint, StateError> {
        view_value(&self.view().field(field::CURRENT_JUSTIFIED_CHECKPOINT)?)
    }

    pub fn finalized_checkpoint(&self) -> Result<Checkpoint, StateError> {
        view_value(&self.view().field(field::FINALIZED_CHECKPOINT)?)
    }

    // Phase 0 attestation accumulators

    pub fn previous_epoch_attestations_len(&self) -> Result<u64, StateError> {
        match self {
            BeaconState::Phase0(inner) => Ok(inner
                .view
                .field(field::PREVIOUS_EPOCH_ATTESTATIONS)?
                .list_len()?),
            _ => Err(StateError::WrongFork { wanted: "phase0" }),
        }
    }

    pub fn previous_epoch_attestation(
        &self,
        index: u64,
    ) -> Result<PendingAttestation, StateError> {
        match self {
            BeaconState::Phase0(inner) => view_value(
                &inner
                    .view
                    .field(field::PREVIOUS_EPOCH_ATTESTATIONS)?
                    .element(index)?,
            ),
            _ => Err(StateError::WrongFork { wanted: "phase0" }),
        }
    }

    pub fn current_epoch_attestations_len(&self) -> Result<u64, StateError> {
        match self {
            BeaconState::Phase0(inner) => Ok(inner
                .view
                .field(field::CURRENT_EPOCH_ATTESTATIONS)?
                .list_len()?),
            _ => Err(StateError::WrongFork { wanted: "phase0" }),
        }
    }

    pub fn current_epoch_attestation(&self, index: u64) -> Result<PendingAttestation, StateError> {
        match self {
            BeaconState::Phase0(inner) => view_value(
                &inner
                    .view
                    .field(field::CURRENT_EPOCH_ATTESTATIONS)?
                    .element(index)?,
            ),
            _ => Err(StateError::WrongFork { wanted: "phase0" }),
        }
    }

    // Altair participation

    pub fn previous_epoch_participation(&self, index: ValidatorIndex) -> Result<u8, StateError> {
        match self {
            BeaconState::Altair(inner) => Ok(inner
                .view
                .field(field::PREVIOUS_EPOCH_PARTICIPATION)?
                .element_u64(index)? as u8),
            _ => Err(StateError::WrongFork { wanted: "altair" }),
        }
    }

    pub fn current_epoch_participation(&self, index: ValidatorIndex) -> Result<u8, StateError> {
        match self {
            BeaconState::Altair(inner) => Ok(inner
                .view
                .field(field::CURRENT_EPOCH_PARTICIPATION)?
                .element_u64(index)? as u8),
            _ => Err(StateError::WrongFork { wanted: "altair" }),
        }
    }

    pub fn inactivity_score(&self, index: ValidatorIndex) -> Result<u64, StateError> {
        match self {
            BeaconState::Altair(inner) => Ok(inner
                .view
                .field(field::INACTIVITY_SCORES)?
                .element_u64(index)?),
            _ => Err(StateError::WrongFork { wanted: "altair" }),
        }
    }
}

/// Single-owner writer handed to `update` mutators.
pub struct StateWriter {
    fork: ForkName,
    spec: Arc<ChainSpec>,
    inner: MutView,
}

impl StateWriter {
    pub fn spec(&self) -> &Arc<ChainSpec> {
        &self.spec
    }

    pub fn fork_name(&self) -> ForkName {
        self.fork
    }

    fn require_fork(&self, fork: ForkName, wanted: &'static str) -> Result<(), StateError> {
        if self.fork == fork {
            Ok(())
        } else {
            Err(StateError::WrongFork { wanted })
        }
    }

    pub fn set_genesis_time(&mut self, value: u64) -> Result<(), StateError> {
        Ok(self.inner.set_field_u64(field::GENESIS_TIME, value)?)
    }

    pub fn set_genesis_validators_root(&mut self, value: Hash256) -> Result<(), StateError> {
        Ok(self
            .inner
            .set_field_hash256(field::GENESIS_VALIDATORS_ROOT, value)?)
    }

    pub fn set_slot(&mut self, value: Slot) -> Result<(), StateError> {
        Ok(self.inner.set_field_u64(field::SLOT, value)?)
    }

    pub fn set_fork(&mut self, value: &Fork) -> Result<(), StateError> {
        let view = value_view(fork_schema(), value)?;
        Ok(self.inner.set_field(field::FORK, &view)?)
    }

    pub fn latest_block_header(&self) -> Result<BeaconBlockHeader, StateError> {
        view_value(&self.inner.field(field::LATEST_BLOCK_HEADER)?)
    }

    pub fn set_latest_block_header(&mut self, value: &BeaconBlockHeader) -> Result<(), StateError> {
        let view = value_view(block_header_schema(), value)?;
        Ok(self.inner.set_field(field::LATEST_BLOCK_HEADER, &view)?)
    }

    fn set_root_in(&mut self, which: usize, index: u64, value: Hash256) -> Result<(), StateError> {
        let roots = self.inner.field(which)?;
        let mut writer = MutView::new(&roots);
        writer.set_element(index, &View::from_node(SszSchema::bytes32(), Node::leaf(value)))?;
        let roots = writer.commit()?;
        Ok(self.inner.set_field(which, &roots)?)
    }

    pub fn set_block_root(&mut self, index: u64, value: Hash256) -> Result<(), StateError> {
        self.set_root_in(field::BLOCK_ROOTS, index, value)
    }

    pub fn set_state_root(&mut self, index: u64, value: Hash256) -> Result<(), StateError> {
        self.set_root_in(field::STATE_ROOTS, index, value)
    }

    pub fn push_historical_root(&mut self, value: Hash256) -> Result<(), StateError> {
        let list = self.inner.field(field::HISTORICAL_ROOTS)?;
        let mut writer = MutView::new(&list);
        writer.push(&View::from_node(SszSchema::bytes32(), Node::leaf(value)))?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::HISTORICAL_ROOTS, &list)?)
    }

    pub fn set_eth1_data(&mut self, value: &Eth1Data) -> Result<(), StateError> {
        let view = value_view(eth1_data_schema(), value)?;
        Ok(self.inner.set_field(field::ETH1_DATA, &view)?)
    }

    pub fn push_eth1_data_vote(&mut self, value: &Eth1Data) -> Result<(), StateError> {
        let list = self.inner.field(field::ETH1_DATA_VOTES)?;
        let mut writer = MutView::new(&list);
        writer.push(&value_view(eth1_data_schema(), value)?)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::ETH1_DATA_VOTES, &list)?)
    }

    pub fn clear_eth1_data_votes(&mut self) -> Result<(), StateError> {
        let list = self.inner.field(field::ETH1_DATA_VOTES)?;
        let mut writer = MutView::new(&list);
        writer.clear_list()?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::ETH1_DATA_VOTES, &list)?)
    }

    pub fn set_eth1_deposit_index(&mut self, value: u64) -> Result<(), StateError> {
        Ok(self.inner.set_field_u64(field::ETH1_DEPOSIT_INDEX, value)?)
    }

    pub fn validators_len(&self) -> Result<u64, StateError> {
        Ok(self.inner.field(field::VALIDATORS)?.list_len()?)
    }

    pub fn validator(&self, index: ValidatorIndex) -> Result<Validator, StateError> {
        if index >= self.validators_len()? {
            return Err(StateError::UnknownValidator(index));
        }
        view_value(&self.inner.field(field::VALIDATORS)?.element(index)?)
    }

    pub fn push_validator(&mut self, value: &Validator) -> Result<(), StateError> {
        let list = self.inner.field(field::VALIDATORS)?;
        let mut writer = MutView::new(&list);
        writer.push(&value_view(validator_schema(), value)?)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::VALIDATORS, &list)?)
    }

    pub fn set_validator(
        &mut self,
        index: ValidatorIndex,
        value: &Validator,
    ) -> Result<(), StateError> {
        if index >= self.validators_len()? {
            return Err(StateError::UnknownValidator(index));
        }
        let list = self.inner.field(field::VALIDATORS)?;
        let mut writer = MutView::new(&list);
        writer.set_element(index, &value_view(validator_schema(), value)?)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::VALIDATORS, &list)?)
    }

    /// Read-modify-write on one validator record.
    pub fn update_validator<F>(
        &mut self,
        index: ValidatorIndex,
        mutate: F,
    ) -> Result<(), StateError>
    where
        F: FnOnce(&mut Validator),
    {
        let mut validator = self.validator(index)?;
        mutate(&mut validator);
        self.set_validator(index, &validator)
    }

    pub fn balance(&self, index: ValidatorIndex) -> Result<Gwei, StateError> {
        Ok(self.inner.field(field::BALANCES)?.element_u64(index)?)
    }

    pub fn push_balance(&mut self, value: Gwei) -> Result<(), StateError> {
        let list = self.inner.field(field::BALANCES)?;
        let mut writer = MutView::new(&list);
        writer.push_u64(value)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::BALANCES, &list)?)
    }

    pub fn set_balance(&mut self, index: ValidatorIndex, value: Gwei) -> Result<(), StateError> {
        let list = self.inner.field(field::BALANCES)?;
        let mut writer = MutView::new(&list);
        writer.set_element_u64(index, value)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::BALANCES, &list)?)
    }

    pub fn increase_balance(
        &mut self,
        index: ValidatorIndex,
        delta: Gwei,
    ) -> Result<(), StateError> {
        let balance = self.balance(index)?;
        self.set_balance(index, balance.saturating_add(delta))
    }

    pub fn decrease_balance(
        &mut self,
        index: ValidatorIndex,
        delta: Gwei,
    ) -> Result<(), StateError> {
        let balance = self.balance(index)?;
        self.set_balance(index, balance.saturating_sub(delta))
    }

    pub fn set_randao_mix(&mut self, epoch: Epoch, value: Hash256) -> Result<(), StateError> {
        let index = epoch % self.spec.epochs_per_historical_vector;
        let mixes = self.inner.field(field::RANDAO_MIXES)?;
        let mut writer = MutView::new(&mixes);
        writer.set_element(index, &View::from_node(SszSchema::bytes32(), Node::leaf(value)))?;
        let mixes = writer.commit()?;
        Ok(self.inner.set_field(field::RANDAO_MIXES, &mixes)?)
    }

    pub fn randao_mix(&self, epoch: Epoch) -> Result<Hash256, StateError> {
        let index = epoch % self.spec.epochs_per_historical_vector;
        Ok(self
            .inner
            .field(field::RANDAO_MIXES)?
            .element(index)?
            .as_hash256()?)
    }

    pub fn set_slashing(&mut self, index: u64, value: Gwei) -> Result<(), StateError> {
        let slashings = self.inner.field(field::SLASHINGS)?;
        let mut writer = MutView::new(&slashings);
        writer.set_element_u64(index, value)?;
        let slashings = writer.commit()?;
        Ok(self.inner.set_field(field::SLASHINGS, &slashings)?)
    }

    pub fn slashing(&self, index: u64) -> Result<Gwei, StateError> {
        Ok(self.inner.field(field::SLASHINGS)?.element_u64(index)?)
    }

    pub fn justification_bit(&self, index: u64) -> Result<bool, StateError> {
        Ok(self.inner.field(field::JUSTIFICATION_BITS)?.bit(index)?)
    }

    pub fn set_justification_bit(&mut self, index: u64, value: bool) -> Result<(), StateError> {
        let bits = self.inner.field(field::JUSTIFICATION_BITS)?;
        let mut writer = MutView::new(&bits);
        writer.set_bit(index, value)?;
        let bits = writer.commit()?;
        Ok(self.inner.set_field(field::JUSTIFICATION_BITS, &bits)?)
    }

    /// Shift the justification window one epoch: bit 0 becomes free, the
    /// rest move up, the oldest falls off.
    pub fn shift_justification_bits(&mut self) -> Result<(), StateError> {
        let old = [
            self.justification_bit(0)?,
            self.justification_bit(1)?,
            self.justification_bit(2)?,
        ];
        self.set_justification_bit(0, false)?;
        for (i, bit) in old.into_iter().enumerate() {
            self.set_justification_bit(i as u64 + 1, bit)?;
        }
        Ok(())
    }

    pub fn set_previous_justified_checkpoint(
        &mut self,
        value: &Checkpoint,
    ) -> Result<(), StateError> {
        let view = value_view(checkpoint_schema(), value)?;
        Ok(self
            .inner
            .set_field(field::PREVIOUS_JUSTIFIED_CHECKPOINT, &view)?)
    }

    pub fn set_current_justified_checkpoint(
        &mut self,
        value: &Checkpoint,
    ) -> Result<(), StateError> {
        let view = value_view(checkpoint_schema(), value)?;
        Ok(self
            .inner
            .set_field(field::CURRENT_JUSTIFIED_CHECKPOINT, &view)?)
    }

    pub fn set_finalized_checkpoint(&mut self, value: &Checkpoint) -> Result<(), StateError> {
        let view = value_view(checkpoint_schema(), value)?;
        Ok(self.inner.set_field(field::FINALIZED_CHECKPOINT, &view)?)
    }

    // Phase 0 attestation accumulators

    pub fn push_current_epoch_attestation(
        &mut self,
        value: &PendingAttestation,
    ) -> Result<(), StateError> {
        self.require_fork(ForkName::Phase0, "phase0")?;
        let list = self.inner.field(field::CURRENT_EPOCH_ATTESTATIONS)?;
        let mut writer = MutView::new(&list);
        writer.push(&value_view(pending_attestation_schema(&self.spec), value)?)?;
        let list = writer.commit()?;
        Ok(self
            .inner
            .set_field(field::CURRENT_EPOCH_ATTESTATIONS, &list)?)
    }

    pub fn push_previous_epoch_attestation(
        &mut self,
        value: &PendingAttestation,
    ) -> Result<(), StateError> {
        self.require_fork(ForkName::Phase0, "phase0")?;
        let list = self.inner.field(field::PREVIOUS_EPOCH_ATTESTATIONS)?;
        let mut writer = MutView::new(&list);
        writer.push(&value_view(pending_attestation_schema(&self.spec), value)?)?;
        let list = writer.commit()?;
        Ok(self
            .inner
            .set_field(field::PREVIOUS_EPOCH_ATTESTATIONS, &list)?)
    }

    /// Epoch rollover: current attestations become previous, current empties.
    pub fn rotate_epoch_attestations(&mut self) -> Result<(), StateError> {
        self.require_fork(ForkName::Phase0, "phase0")?;
        let current = self.inner.field(field::CURRENT_EPOCH_ATTESTATIONS)?;
        self.inner
            .set_field(field::PREVIOUS_EPOCH_ATTESTATIONS, &current)?;
        let mut writer = MutView::new(&current);
        writer.clear_list()?;
        let emptied = writer.commit()?;
        Ok(self
            .inner
            .set_field(field::CURRENT_EPOCH_ATTESTATIONS, &emptied)?)
    }

    // Altair participation

    pub fn participation_flags(&self, index: ValidatorIndex, current: bool) -> Result<u8, StateError> {
        self.require_fork(ForkName::Altair, "altair")?;
        let which = if current {
            field::CURRENT_EPOCH_PARTICIPATION
        } else {
            field::PREVIOUS_EPOCH_PARTICIPATION
        };
        Ok(self.inner.field(which)?.element_u64(index)? as u8)
    }

    pub fn set_participation_flags(
        &mut self,
        index: ValidatorIndex,
        current: bool,
        flags: u8,
    ) -> Result<(), StateError> {
        self.require_fork(ForkName::Altair, "altair")?;
        let which = if current {
            field::CURRENT_EPOCH_PARTICIPATION
        } else {
            field::PREVIOUS_EPOCH_PARTICIPATION
        };
        let list = self.inner.field(which)?;
        let mut writer = MutView::new(&list);
        writer.set_element_u64(index, flags as u64)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(which, &list)?)
    }

    pub fn push_participation(&mut self, flags: u8) -> Result<(), StateError> {
        self.require_fork(ForkName::Altair, "altair")?;
        for which in [
            field::PREVIOUS_EPOCH_PARTICIPATION,
            field::CURRENT_EPOCH_PARTICIPATION,
        ] {
            let list = self.inner.field(which)?;
            let mut writer = MutView::new(&list);
            writer.push_u64(flags as u64)?;
            let list = writer.commit()?;
            self.inner.set_field(which, &list)?;
        }
        Ok(())
    }

    /// Epoch rollover: current participation becomes previous, current
    /// resets to zero flags for every validator.
    pub fn rotate_participation(&mut self) -> Result<(), StateError> {
        self.require_fork(ForkName::Altair, "altair")?;
        let current = self.inner.field(field::CURRENT_EPOCH_PARTICIPATION)?;
        self.inner
            .set_field(field::PREVIOUS_EPOCH_PARTICIPATION, &current)?;
        let length = current.list_len()?;
        let schema = current.schema().clone();
        let zeroed = View::from_node(
            schema.clone(),
            Node::branch(Node::zero(schema.depth() - 1), codec::length_leaf(length)),
        );
        Ok(self
            .inner
            .set_field(field::CURRENT_EPOCH_PARTICIPATION, &zeroed)?)
    }

    pub fn push_inactivity_score(&mut self, value: u64) -> Result<(), StateError> {
        self.require_fork(ForkName::Altair, "altair")?;
        let list = self.inner.field(field::INACTIVITY_SCORES)?;
        let mut writer = MutView::new(&list);
        writer.push_u64(value)?;
        let list = writer.commit()?;
        Ok(self.inner.set_field(field::INACTIVITY_SCORES, &list)?)
    }

    /// Exit the validator through the churn-limited exit queue.
    pub fn initiate_validator_exit(&mut self, index: ValidatorIndex) -> Result<(), StateError> {
        let validator = self.validator(index)?;
        if validator.exit_epoch != FAR_FUTURE_EPOCH {
            return Ok(());
        }
        let current_epoch = self.spec.epoch_at_slot(self.inner.field(field::SLOT)?.as_u64()?);
        let mut exit_queue_epoch = self.spec.activation_exit_epoch(current_epoch);
        let mut exit_queue_churn = 0u64;
        let mut active = 0u64;
        for i in 0..self.validators_len()? {
            let v = self.validator(i)?;
            if v.is_active_at(current_epoch) {
                active += 1;
            }
            if v.exit_epoch != FAR_FUTURE_EPOCH {
                if v.exit_epoch > exit_queue_epoch {
                    exit_queue_epoch = v.exit_epoch;
                    exit_queue_churn = 0;
                }
                if v.exit_epoch == exit_queue_epoch {
                    exit_queue_churn += 1;
                }
            }
        }
        if exit_queue_churn >= self.spec.churn_limit(active) {
            exit_queue_epoch += 1;
        }
        let withdrawable = exit_queue_epoch + self.spec.min_validator_withdrawability_delay;
        self.update_validator(index, |v| {
            v.exit_epoch = exit_queue_epoch;
            v.withdrawable_epoch = withdrawable;
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_validator(index: u64) -> Validator {
        Validator {
            pubkey: vec![index as u8; 48].into(),
            withdrawal_credentials: Hash256::repeat_byte(index as u8),
            effective_balance: 32_000_000_000,
            slashed: false,
            activation_eligibility_epoch: 0,
            activation_epoch: 0,
            exit_epoch: FAR_FUTURE_EPOCH,
            withdrawable_epoch: FAR_FUTURE_EPOCH,
        }
    }

    fn fresh_state(fork: ForkName) -> BeaconState {
        let spec = Arc::new(ChainSpec::minimal());
        let state = BeaconState::new_default(fork, spec);
        state
            .update(|writer| {
                for i in 0..4 {
                    writer.push_validator(&test_validator(i))?;
                    writer.push_balance(32_000_000_000)?;
                    if fork == ForkName::Altair {
                        writer.push_participation(0)?;
                        writer.push_inactivity_score(0)?;
                    }
                }
                Ok(())
            })
            .unwrap()
    }

    #[test]
    fn update_returns_a_new_snapshot() {
        let state = fresh_state(ForkName::Phase0);
        let updated = state
            .update(|writer| {
                writer.set_slot(9)?;
                writer.set_balance(1, 7)?;
                Ok(())
            })
            .unwrap();

        assert_eq!(state.slot().unwrap(), 0);
        assert_eq!(updated.slot().unwrap(), 9);
        assert_eq!(state.balance(1).unwrap(), 32_000_000_000);
        assert_eq!(updated.balance(1).unwrap(), 7);
        assert_ne!(state.hash_tree_root(), updated.hash_tree_root());
    }

    #[test]
    fn validators_round_trip_through_the_tree() {
        let state = fresh_state(ForkName::Phase0);
        assert_eq!(state.validators_len().unwrap(), 4);
        let validator = state.validator(2).unwrap();
        assert_eq!(validator.withdrawal_credentials, Hash256::repeat_byte(2));
        assert!(validator.is_active_at(0));
        assert!(matches!(
            state.validator(9),
            Err(StateError::UnknownValidator(9))
        ));
    }

    #[test]
    fn fork_specific_accessors_guard_their_fork() {
        let phase0 = fresh_state(ForkName::Phase0);
        assert!(matches!(
            phase0.current_epoch_participation(0),
            Err(StateError::WrongFork { wanted: "altair" })
        ));

        let altair = fresh_state(ForkName::Altair);
        assert!(matches!(
            altair.current_epoch_attestations_len(),
            Err(StateError::WrongFork { wanted: "phase0" })
        ));
        assert_eq!(altair.current_epoch_participation(1).unwrap(), 0);
    }

    #[test]
    fn participation_rotation_moves_current_to_previous() {
        let state = fresh_state(ForkName::Altair);
        let state = state
            .update(|writer| writer.set_participation_flags(2, true, 0b111))
            .unwrap();
        let rotated = state
            .update(|writer| writer.rotate_participation())
            .unwrap();

        assert_eq!(rotated.previous_epoch_participation(2).unwrap(), 0b111);
        assert_eq!(rotated.current_epoch_participation(2).unwrap(), 0);
        // Rotation keeps the list length in step with the registry.
        let grown = rotated
            .update(|writer| writer.set_participation_flags(3, true, 1))
            .unwrap();
        assert_eq!(grown.current_epoch_participation(3).unwrap(), 1);
    }

    #[test]
    fn justification_bits_shift() {
        let state = fresh_state(ForkName::Phase0);
        let state = state
            .update(|writer| {
                writer.set_justification_bit(0, true)?;
                writer.set_justification_bit(2, true)
            })
            .unwrap();
        let shifted = state
            .update(|writer| writer.shift_justification_bits())
            .unwrap();
        assert!(!shifted.justification_bit(0).unwrap());
        assert!(shifted.justification_bit(1).unwrap());
        assert!(!shifted.justification_bit(2).unwrap());
        assert!(shifted.justification_bit(3).unwrap());
    }

    #[test]
    fn state_round_trips_through_ssz() {
        let state = fresh_state(ForkName::Altair);
        let bytes = state.as_ssz_bytes().unwrap();
        let decoded =
            BeaconState::from_ssz_bytes(ForkName::Altair, state.spec().clone(), &bytes).unwrap();
        assert_eq!(decoded.hash_tree_root(), state.hash_tree_root());
        assert_eq!(decoded.validators_len().unwrap(), 4);
    }

    #[test]
    fn exit_queue_orders_exits() {
        let state = fresh_state(ForkName::Phase0);
        let exited = state
            .update(|writer| {
                writer.initiate_validator_exit(0)?;
                writer.initiate_validator_exit(1)
            })
            .unwrap();
        let v0 = exited.validator(0).unwrap();
        let v1 = exited.validator(1).unwrap();
        assert_ne!(v0.exit_epoch, FAR_FUTURE_EPOCH);
        assert_eq!(v0.exit_epoch, v1.exit_epoch);
        assert_eq!(
            v0.withdrawable_epoch,
            v0.exit_epoch + exited.spec().min_validator_withdrawability_delay
        );
    }
}
