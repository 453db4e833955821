//! Opaque signature-verification capability.
//!
//! The state transition never touches curve arithmetic; it asks this trait
//! whether a signature stands. Production wiring supplies a real backend,
//! tests pick one of the stubs.

use crate::types::{BlsPublicKey, BlsSignature, Hash256};

pub trait BlsVerifier: Send + Sync {
    fn verify(&self, pubkey: &BlsPublicKey, message: Hash256, signature: &BlsSignature) -> bool;

    /// Aggregate signature by all `pubkeys` over one message.
    fn fast_aggregate_verify(
        &self,
        pubkeys: &[BlsPublicKey],
        message: Hash256,
        signature: &BlsSignature,
    ) -> bool;
}

/// Treats every signature as valid. For tests and trusted replay.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllSignatures;

impl BlsVerifier for AcceptAllSignatures {
    fn verify(&self, _pubkey: &BlsPublicKey, _message: Hash256, _signature: &BlsSignature) -> bool {
        true
    }

    fn fast_aggregate_verify(
        &self,
        _pubkeys: &[BlsPublicKey],
        _message: Hash256,
        _signature: &BlsSignature,
    ) -> bool {
        true
    }
}

/// Treats every signature as invalid. For rejection-path tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAllSignatures;

impl BlsVerifier for RejectAllSignatures {
    fn verify(&self, _pubkey: &BlsPublicKey, _message: Hash256, _signature: &BlsSignature) -> bool {
        false
    }

    fn fast_aggregate_verify(
        &self,
        _pubkeys: &[BlsPublicKey],
        _message: Hash256,
        _signature: &BlsSignature,
    ) -> bool {
        false
    }
}
