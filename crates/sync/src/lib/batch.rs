//! One contiguous slot range requested from a single peer.

use thiserror::Error;

use eth2_beacon_consensus::types::{Hash256, SignedBeaconBlock, Slot};

use crate::peer::PeerId;
use crate::rpc::BlocksByRangeRequest;

/// Response-ordering violations. Every variant marks the serving peer as
/// having produced an out-of-order response.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BatchError {
    #[error("slot {slot} outside the requested range [{start}, {end}]")]
    SlotOutOfRange { slot: Slot, start: Slot, end: Slot },
    #[error("slot {slot} does not sit on the request stride")]
    StepMismatch { slot: Slot },
    #[error("expected the next block at slot {expected}, got {got}")]
    OutOfOrder { expected: Slot, got: Slot },
    #[error("block at slot {slot} does not chain from its predecessor")]
    BrokenParentChain { slot: Slot },
    #[error("batch already complete")]
    AlreadyComplete,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchFlags {
    pub complete: bool,
    pub contested: bool,
    pub first_confirmed: bool,
    pub last_confirmed: bool,
    pub empty: bool,
    pub awaiting: bool,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
    pub blocks: Vec<SignedBeaconBlock>,
    pub flags: BatchFlags,
    pub attempts: u8,
    /// Peers that served (or failed to serve) this range, oldest first.
    pub served_by: Vec<PeerId>,
}

impl Batch {
    pub fn new(start_slot: Slot, count: u64, step: u64) -> Self {
        Self {
            start_slot,
            count,
            step,
            blocks: Vec::new(),
            flags: BatchFlags {
                awaiting: true,
                ..BatchFlags::default()
            },
            attempts: 0,
            served_by: Vec::new(),
        }
    }

    pub fn to_request(&self) -> BlocksByRangeRequest {
        BlocksByRangeRequest {
            start_slot: self.start_slot,
            count: self.count,
            step: self.step,
        }
    }

    pub fn end_slot(&self) -> Slot {
        self.start_slot + self.count * self.step
    }

    /// Validate and append one streamed block.
    pub fn on_block(&mut self, block: SignedBeaconBlock) -> Result<(), BatchError> {
        if self.flags.complete {
            return Err(BatchError::AlreadyComplete);
        }
        let slot = block.slot();
        if slot < self.start_slot || slot > self.end_slot() {
            return Err(BatchError::SlotOutOfRange {
                slot,
                start: self.start_slot,
                end: self.end_slot(),
            });
        }
        if (slot - self.start_slot) % self.step != 0 {
            return Err(BatchError::StepMismatch { slot });
        }
        let expected = self.start_slot + self.blocks.len() as u64 * self.step;
        if slot != expected {
            return Err(BatchError::OutOfOrder {
                expected,
                got: slot,
            });
        }
        if self.step == 1 {
            if let Some(previous) = self.blocks.last() {
                if block.parent_root() != previous.canonical_root() {
                    return Err(BatchError::BrokenParentChain { slot });
                }
            }
        }
        self.blocks.push(block);
        Ok(())
    }

    /// The peer closed the stream; the batch is whatever arrived.
    pub fn on_stream_end(&mut self) {
        self.flags.complete = true;
        self.flags.awaiting = false;
        self.flags.empty = self.blocks.is_empty();
    }

    /// Throw away the received blocks and queue for a refetch.
    pub fn reset_for_refetch(&mut self) {
        self.blocks.clear();
        self.attempts = self.attempts.saturating_add(1);
        self.flags = BatchFlags {
            awaiting: true,
            contested: self.flags.contested,
            ..BatchFlags::default()
        };
    }

    pub fn first_parent_root(&self) -> Option<Hash256> {
        self.blocks.first().map(|b| b.parent_root())
    }

    pub fn last_block_root(&self) -> Option<Hash256> {
        self.blocks.last().map(|b| b.canonical_root())
    }
}
