//! Blocking worker pool. Decode and storage work runs off the event
//! thread; results come back as typed outcomes on the event inbox, never
//! as panics across threads.

use ssz::Decode;
use tokio::sync::mpsc::UnboundedSender;

use eth2_beacon_consensus::types::{Attestation, SignedBeaconBlock};
use eth2_beacon_sync::range::RequestId;

use crate::service::NodeEvent;

#[derive(Debug)]
pub enum WorkTask {
    DecodeBlock {
        request_id: RequestId,
        bytes: Option<Vec<u8>>,
    },
    DecodeAttestation {
        bytes: Vec<u8>,
    },
}

#[derive(Debug)]
pub enum WorkOutcome {
    BlockDecoded {
        request_id: RequestId,
        result: Result<Option<SignedBeaconBlock>, String>,
    },
    AttestationDecoded {
        result: Result<Attestation, String>,
    },
}

#[derive(Clone)]
pub struct WorkerPool {
    inbox: UnboundedSender<NodeEvent>,
}

impl WorkerPool {
    pub fn new(inbox: UnboundedSender<NodeEvent>) -> Self {
        Self { inbox }
    }

    /// Run `task` on a blocking worker and post the outcome back to the
    /// event thread.
    pub fn submit(&self, task: WorkTask) {
        let inbox = self.inbox.clone();
        tokio::task::spawn_blocking(move || {
            let outcome = run_task(task);
            // The receiver disappearing just means the service stopped.
            let _ = inbox.send(NodeEvent::WorkCompleted(outcome));
        });
    }
}

pub fn run_task(task: WorkTask) -> WorkOutcome {
    match task {
        WorkTask::DecodeBlock { request_id, bytes } => {
            let result = match bytes {
                None => Ok(None),
                Some(bytes) => SignedBeaconBlock::from_ssz_bytes(&bytes)
                    .map(Some)
                    .map_err(|e| format!("malformed block: {e:?}")),
            };
            WorkOutcome::BlockDecoded { request_id, result }
        }
        WorkTask::DecodeAttestation { bytes } => WorkOutcome::AttestationDecoded {
            result: Attestation::from_ssz_bytes(&bytes)
                .map_err(|e| format!("malformed attestation: {e:?}")),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ssz::Encode;

    #[test]
    fn decode_outcomes_carry_errors_instead_of_panicking() {
        let outcome = run_task(WorkTask::DecodeBlock {
            request_id: 3,
            bytes: Some(vec![1, 2, 3]),
        });
        match outcome {
            WorkOutcome::BlockDecoded { request_id, result } => {
                assert_eq!(request_id, 3);
                assert!(result.is_err());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn stream_terminators_pass_through() {
        let outcome = run_task(WorkTask::DecodeBlock {
            request_id: 9,
            bytes: None,
        });
        assert!(matches!(
            outcome,
            WorkOutcome::BlockDecoded {
                request_id: 9,
                result: Ok(None),
            }
        ));
    }

    #[test]
    fn valid_attestations_decode() {
        use eth2_beacon_consensus::types::{AttestationData, Checkpoint, Hash256};
        let attestation = Attestation {
            aggregation_bits: ssz_types_bits(),
            data: AttestationData {
                slot: 4,
                index: 0,
                beacon_block_root: Hash256::repeat_byte(2),
                source: Checkpoint::default(),
                target: Checkpoint::default(),
            },
            signature: vec![0u8; 96].into(),
        };
        let outcome = run_task(WorkTask::DecodeAttestation {
            bytes: attestation.as_ssz_bytes(),
        });
        match outcome {
            WorkOutcome::AttestationDecoded { result } => {
                assert_eq!(result.unwrap(), attestation);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    fn ssz_types_bits() -> eth2_beacon_consensus::types::BitList<
        eth2_beacon_consensus::eth_spec::MaxValidatorsPerCommittee,
    > {
        let mut bits =
            eth2_beacon_consensus::types::BitList::with_capacity(4).unwrap();
        bits.set(1, true).unwrap();
        bits
    }
}
