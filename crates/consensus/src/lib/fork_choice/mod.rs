//! Fork-choice store: proto-array arena plus latest-vote tracking.

pub mod proto_array;

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{Checkpoint, Epoch, Gwei, Hash256, Slot, ValidatorIndex};

pub use proto_array::{Block, ProtoArray, ProtoNode};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ForkChoiceError {
    #[error("parent {parent_root} of block {block_root} is not in the arena")]
    UnknownParent {
        block_root: Hash256,
        parent_root: Hash256,
    },
    #[error("justified root {0} is not in the arena")]
    UnknownJustifiedRoot(Hash256),
    #[error("finalized root {0} is not in the arena")]
    UnknownFinalizedRoot(Hash256),
    #[error("node index {0} is out of bounds")]
    InvalidNodeIndex(usize),
    #[error("delta batch of {deltas} does not match {nodes} nodes")]
    InvalidDeltaLength { deltas: usize, nodes: usize },
    #[error("vote bookkeeping corrupted: weight overflow at node {index}")]
    WeightOverflow { index: usize },
    #[error("best node {head_root} is not viable for justified epoch {justified_epoch}")]
    InvalidBestNode {
        head_root: Hash256,
        justified_epoch: Epoch,
    },
}

/// Latest attestation bookkeeping for one validator. `current` is what the
/// weights reflect, `next` what the next head computation folds in.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VoteTracker {
    pub current_root: Hash256,
    pub next_root: Hash256,
    pub next_epoch: Epoch,
}

#[derive(Debug, Clone)]
pub struct ForkChoice {
    proto_array: ProtoArray,
    votes: Vec<VoteTracker>,
    balances: Vec<Gwei>,
    justified_checkpoint: Checkpoint,
    finalized_checkpoint: Checkpoint,
}

impl ForkChoice {
    /// Boot from the anchor (usually the last finalized block).
    pub fn from_anchor(
        anchor: Block,
        justified_checkpoint: Checkpoint,
        finalized_checkpoint: Checkpoint,
    ) -> Self {
        let proto_array = ProtoArray::new(
            anchor,
            justified_checkpoint.epoch,
            finalized_checkpoint.epoch,
        );
        Self {
            proto_array,
            votes: Vec::new(),
            balances: Vec::new(),
            justified_checkpoint,
            finalized_checkpoint,
        }
    }

    pub fn justified_checkpoint(&self) -> Checkpoint {
        self.justified_checkpoint
    }

    pub fn finalized_checkpoint(&self) -> Checkpoint {
        self.finalized_checkpoint
    }

    pub fn contains_block(&self, root: &Hash256) -> bool {
        self.proto_array.contains_block(root)
    }

    pub fn block_slot(&self, root: &Hash256) -> Option<Slot> {
        self.proto_array.node_by_root(root).map(|n| n.slot)
    }

    pub fn on_block(&mut self, block: Block) -> Result<(), ForkChoiceError> {
        self.proto_array.on_block(block)
    }

    /// Record the latest vote of `validator`. Weight moves when the next
    /// head computation runs.
    pub fn process_attestation(
        &mut self,
        validator: ValidatorIndex,
        block_root: Hash256,
        target_epoch: Epoch,
    ) {
        let index = validator as usize;
        if index >= self.votes.len() {
            self.votes.resize(index + 1, VoteTracker::default());
        }
        let vote = &mut self.votes[index];
        if target_epoch > vote.next_epoch || *vote == VoteTracker::default() {
            vote.next_root = block_root;
            vote.next_epoch = target_epoch;
        }
    }

    pub fn update_checkpoints(
        &mut self,
        justified_checkpoint: Checkpoint,
        finalized_checkpoint: Checkpoint,
    ) {
        self.justified_checkpoint = justified_checkpoint;
        self.finalized_checkpoint = finalized_checkpoint;
    }

    /// Fold pending votes into weights with the justified-state balances
    /// and return the canonical head.
    pub fn find_head(&mut self, new_balances: &[Gwei]) -> Result<Hash256, ForkChoiceError> {
        let deltas = compute_deltas(
            &self.proto_array.indices(),
            &mut self.votes,
            &self.balances,
            new_balances,
        )?;
        self.proto_array.apply_score_changes(
            deltas,
            self.justified_checkpoint.epoch,
            self.finalized_checkpoint.epoch,
        )?;
        self.balances = new_balances.to_vec();
        self.proto_array.find_head(&self.justified_checkpoint.root)
    }

    pub fn maybe_prune(&mut self, finalized_root: &Hash256) -> Result<(), ForkChoiceError> {
        self.proto_array.maybe_prune(finalized_root)
    }

    pub fn proto_array(&self) -> &ProtoArray {
        &self.proto_array
    }
}

impl ProtoArray {
    fn indices(&self) -> HashMap<Hash256, usize> {
        self.indices.clone()
    }
}

/// Per-node weight deltas from vote movements and balance changes. Commits
/// `next` votes to `current` as a side effect.
fn compute_deltas(
    indices: &HashMap<Hash256, usize>,
    votes: &mut [VoteTracker],
    old_balances: &[Gwei],
    new_balances: &[Gwei],
) -> Result<Vec<i64>, ForkChoiceError> {
    let mut deltas = vec![0i64; indices.len()];

    for (validator, vote) in votes.iter_mut().enumerate() {
        if vote.current_root == Hash256::ZERO && vote.next_root == Hash256::ZERO {
            continue;
        }
        let old_balance = old_balances.get(validator).copied().unwrap_or(0);
        let new_balance = new_balances.get(validator).copied().unwrap_or(0);

        if vote.current_root != vote.next_root || old_balance != new_balance {
            if let Some(index) = indices.get(&vote.current_root) {
                deltas[*index] = deltas[*index]
                    .checked_sub(old_balance as i64)
                    .ok_or(ForkChoiceError::WeightOverflow { index: *index })?;
            }
            if let Some(index) = indices.get(&vote.next_root) {
                deltas[*index] = deltas[*index]
                    .checked_add(new_balance as i64)
                    .ok_or(ForkChoiceError::WeightOverflow { index: *index })?;
            }
            vote.current_root = vote.next_root;
        }
    }
    Ok(deltas)
}
