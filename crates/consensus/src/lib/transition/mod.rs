//! State transition: slot advancement, epoch accounting, block and
//! attestation application, and the driver that anchors results in the
//! fork-choice store.

pub mod driver;
pub mod per_block;
pub mod per_epoch;
pub mod per_slot;
pub mod verification;

use thiserror::Error;

use crate::fork_choice::ForkChoiceError;
use crate::state::StateError;
use crate::types::{Epoch, Hash256, Slot};

pub use driver::{BlockOutcome, ConsensusDriver, InMemoryProvider, StateProvider};
pub use verification::{OperationKind, Verification};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block at slot {block_slot} is not after the finalized slot {finalized_slot}")]
    BlockFromFinalizedEpoch {
        block_slot: Slot,
        finalized_slot: Slot,
    },
    #[error("parent {0} is unknown")]
    UnknownParent(Hash256),
    #[error("block signature rejected")]
    InvalidSignature,
    #[error("{kind:?} operation invalid: {reason}")]
    OperationInvalid { kind: OperationKind, reason: String },
    #[error("computed state root {computed} does not match block state root {expected}")]
    StateRootMismatch {
        expected: Hash256,
        computed: Hash256,
    },
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    ForkChoice(#[from] ForkChoiceError),
}

#[derive(Debug, Error)]
pub enum AttestationError {
    #[error("target epoch {target_epoch} outside the window around {current_epoch}")]
    AttestationFromFuturePastEpoch {
        target_epoch: Epoch,
        current_epoch: Epoch,
    },
    #[error("attestation references unknown block {0}")]
    UnknownBlock(Hash256),
    #[error("aggregate signature rejected")]
    InvalidSignature,
    #[error("committee expansion failed: {0}")]
    BadCommittee(String),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    ForkChoice(#[from] ForkChoiceError),
}
