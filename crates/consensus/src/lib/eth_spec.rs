//! Compile-time bounds for wire-level containers.
//!
//! These cap the SSZ collections carried inside blocks and attestations and
//! are identical across presets; everything that differs between the minimal
//! and mainnet configurations lives in [`crate::chain_spec::ChainSpec`].

pub use ssz_types::typenum::*;

// https://github.com/ethereum/consensus-specs/blob/dev/specs/phase0/beacon-chain.md#misc
const MAX_VALIDATORS_PER_COMMITTEE: u64 = 2_u64.pow(11);
pub type MaxValidatorsPerCommittee = U2048;

// https://github.com/ethereum/consensus-specs/blob/dev/specs/phase0/beacon-chain.md#max-operations-per-block
const MAX_PROPOSER_SLASHINGS: u64 = 2_u64.pow(4);
pub type MaxProposerSlashings = U16;
const MAX_ATTESTER_SLASHINGS: u64 = 2_u64.pow(1);
pub type MaxAttesterSlashings = U2;
const MAX_ATTESTATIONS: u64 = 2_u64.pow(7);
pub type MaxAttestations = U128;
const MAX_DEPOSITS: u64 = 2_u64.pow(4);
pub type MaxDeposits = U16;
const MAX_VOLUNTARY_EXITS: u64 = 2_u64.pow(4);
pub type MaxVoluntaryExits = U16;

// The deposit contract tree is 32 levels deep; branches carry one extra
// node for the length mix-in.
const DEPOSIT_CONTRACT_TREE_DEPTH: u64 = 2_u64.pow(5);
pub type DepositContractTreeDepth = U32;
pub type DepositProofLength = U33;

pub type JustificationBitsLength = U4;

// Caps for the wire request/response containers.
const MAX_REQUEST_BLOCKS: u64 = 2_u64.pow(10);
pub type MaxRequestBlocks = U1024;
pub type AttestationSubnetCount = U64;
