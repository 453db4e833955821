use derive_more::Debug;
use serde::{Deserialize, Serialize};
use ssz_derive::{Decode, Encode};
pub use ssz_types::{typenum, typenum::Unsigned, BitList, BitVector, FixedVector, VariableList};
use tree_hash::TreeHash;
use tree_hash_derive::TreeHash;

use crate::eth_spec;

pub type Hash256 = alloy_primitives::B256;
pub type Root = Hash256;
pub type Slot = u64;
pub type Epoch = u64;
pub type CommitteeIndex = u64;
pub type ValidatorIndex = u64;
pub type Gwei = u64;
pub type WithdrawalCredentials = Hash256;

pub type BlsPublicKey = FixedVector<u8, typenum::U48>;
pub type BlsSignature = FixedVector<u8, typenum::U96>;
pub type Version = FixedVector<u8, typenum::U4>;
pub type ForkDigest = FixedVector<u8, typenum::U4>;
pub type ParticipationFlags = u8;
pub type Graffiti = Hash256;

pub type DepositProof = FixedVector<Hash256, eth_spec::DepositProofLength>;

pub const GENESIS_EPOCH: Epoch = 0;
pub const GENESIS_SLOT: Slot = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Fork {
    pub previous_version: Version,
    pub current_version: Version,
    pub epoch: Epoch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Checkpoint {
    pub epoch: Epoch,
    pub root: Root,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockHeader {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body_root: Root,
}

impl BeaconBlockHeader {
    pub fn canonical_root(&self) -> Root {
        self.tree_hash_root()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBeaconBlockHeader {
    pub message: BeaconBlockHeader,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Eth1Data {
    pub deposit_root: Root,
    pub deposit_count: u64,
    pub block_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Validator {
    #[debug("{:#?}", hex::encode(pubkey.to_vec()))]
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: WithdrawalCredentials,
    pub effective_balance: Gwei,
    pub slashed: bool,
    pub activation_eligibility_epoch: Epoch,
    pub activation_epoch: Epoch,
    pub exit_epoch: Epoch,
    pub withdrawable_epoch: Epoch,
}

impl Validator {
    pub fn is_active_at(&self, epoch: Epoch) -> bool {
        self.activation_epoch <= epoch && epoch < self.exit_epoch
    }

    pub fn is_slashable_at(&self, epoch: Epoch) -> bool {
        !self.slashed && self.activation_epoch <= epoch && epoch < self.withdrawable_epoch
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttestationData {
    pub slot: Slot,
    pub index: CommitteeIndex,
    pub beacon_block_root: Root,
    pub source: Checkpoint,
    pub target: Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct IndexedAttestation {
    pub attesting_indices: VariableList<ValidatorIndex, eth_spec::MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Attestation {
    pub aggregation_bits: BitList<eth_spec::MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct PendingAttestation {
    pub aggregation_bits: BitList<eth_spec::MaxValidatorsPerCommittee>,
    pub data: AttestationData,
    pub inclusion_delay: Slot,
    pub proposer_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct DepositData {
    #[debug("{:#?}", hex::encode(pubkey.to_vec()))]
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: WithdrawalCredentials,
    pub amount: Gwei,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct Deposit {
    pub proof: DepositProof,
    pub data: DepositData,
}

/// The signed portion of a deposit.
#[derive(Debug, Clone, PartialEq, Encode, Decode, TreeHash)]
pub struct DepositMessage {
    pub pubkey: BlsPublicKey,
    pub withdrawal_credentials: WithdrawalCredentials,
    pub amount: Gwei,
}

impl From<&DepositData> for DepositMessage {
    fn from(data: &DepositData) -> Self {
        Self {
            pubkey: data.pubkey.clone(),
            withdrawal_credentials: data.withdrawal_credentials,
            amount: data.amount,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct ProposerSlashing {
    pub signed_header_1: SignedBeaconBlockHeader,
    pub signed_header_2: SignedBeaconBlockHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct AttesterSlashing {
    pub attestation_1: IndexedAttestation,
    pub attestation_2: IndexedAttestation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct VoluntaryExit {
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedVoluntaryExit {
    pub message: VoluntaryExit,
    pub signature: BlsSignature,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlockBody {
    pub randao_reveal: BlsSignature,
    pub eth1_data: Eth1Data,
    pub graffiti: Graffiti,
    pub proposer_slashings: VariableList<ProposerSlashing, eth_spec::MaxProposerSlashings>,
    pub attester_slashings: VariableList<AttesterSlashing, eth_spec::MaxAttesterSlashings>,
    pub attestations: VariableList<Attestation, eth_spec::MaxAttestations>,
    pub deposits: VariableList<Deposit, eth_spec::MaxDeposits>,
    pub voluntary_exits: VariableList<SignedVoluntaryExit, eth_spec::MaxVoluntaryExits>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct BeaconBlock {
    pub slot: Slot,
    pub proposer_index: ValidatorIndex,
    pub parent_root: Root,
    pub state_root: Root,
    pub body: BeaconBlockBody,
}

impl BeaconBlock {
    pub fn canonical_root(&self) -> Root {
        self.tree_hash_root()
    }

    /// Header form with the body collapsed to its root.
    pub fn block_header(&self) -> BeaconBlockHeader {
        BeaconBlockHeader {
            slot: self.slot,
            proposer_index: self.proposer_index,
            parent_root: self.parent_root,
            state_root: self.state_root,
            body_root: self.body.tree_hash_root(),
        }
    }

    /// Header form used while the state root is not yet known.
    pub fn temporary_block_header(&self) -> BeaconBlockHeader {
        BeaconBlockHeader {
            state_root: Hash256::ZERO,
            ..self.block_header()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode, TreeHash)]
pub struct SignedBeaconBlock {
    pub message: BeaconBlock,
    pub signature: BlsSignature,
}

impl SignedBeaconBlock {
    pub fn canonical_root(&self) -> Root {
        self.message.canonical_root()
    }

    pub fn slot(&self) -> Slot {
        self.message.slot
    }

    pub fn parent_root(&self) -> Root {
        self.message.parent_root
    }
}

/// Pair hashed to produce a signing root: the object root mixed with the
/// domain separating fork and message kind.
#[derive(Debug, Clone, PartialEq, Encode, Decode, TreeHash)]
pub struct SigningData {
    pub object_root: Root,
    pub domain: Hash256,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode, TreeHash)]
pub struct ForkData {
    pub current_version: Version,
    pub genesis_validators_root: Root,
}

pub fn compute_signing_root(object_root: Root, domain: Hash256) -> Root {
    SigningData { object_root, domain }.tree_hash_root()
}

pub fn compute_fork_data_root(current_version: &Version, genesis_validators_root: Root) -> Root {
    ForkData {
        current_version: current_version.clone(),
        genesis_validators_root,
    }
    .tree_hash_root()
}

pub fn compute_fork_digest(current_version: &Version, genesis_validators_root: Root) -> ForkDigest {
    let root = compute_fork_data_root(current_version, genesis_validators_root);
    FixedVector::from(root.as_slice()[..4].to_vec())
}
