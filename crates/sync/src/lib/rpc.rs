//! Eth2 RPC wire messages and the response chunk framing.
//!
//! A response chunk is one status byte, an unsigned LEB128 length prefix of
//! at most ten bytes, then the SSZ-encoded payload.

use serde::{Deserialize, Serialize};
use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};
use thiserror::Error;

use eth2_beacon_consensus::eth_spec::{AttestationSubnetCount, MaxRequestBlocks};
use eth2_beacon_consensus::types::{BitVector, Epoch, ForkDigest, Hash256, Slot, VariableList};

/// Hard cap on a single chunk payload.
pub const MAX_CHUNK_BYTES: u64 = 10 * 1024 * 1024;
pub const MAX_VARINT_BYTES: usize = 10;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RpcError {
    #[error("malformed rpc: {0}")]
    MalformedRpc(String),
    #[error("length prefix runs past {MAX_VARINT_BYTES} bytes")]
    OversizedVarint,
    #[error("unexpected end of chunk")]
    UnexpectedEof,
    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),
    #[error("chunk of {got} bytes exceeds the {limit}-byte limit")]
    ChunkTooLarge { got: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseCode {
    Success,
    InvalidRequest,
    ServerError,
    ResourceUnavailable,
}

impl ResponseCode {
    pub fn as_u8(self) -> u8 {
        match self {
            ResponseCode::Success => 0,
            ResponseCode::InvalidRequest => 1,
            ResponseCode::ServerError => 2,
            ResponseCode::ResourceUnavailable => 3,
        }
    }

    pub fn from_u8(byte: u8) -> Result<Self, RpcError> {
        match byte {
            0 => Ok(ResponseCode::Success),
            1 => Ok(ResponseCode::InvalidRequest),
            2 => Ok(ResponseCode::ServerError),
            3 => Ok(ResponseCode::ResourceUnavailable),
            other => Err(RpcError::UnknownResponseCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodbyeReason {
    ClientShutdown,
    IrrelevantNetwork,
    FaultError,
    Unknown(u64),
}

impl From<u64> for GoodbyeReason {
    fn from(value: u64) -> Self {
        match value {
            1 => GoodbyeReason::ClientShutdown,
            2 => GoodbyeReason::IrrelevantNetwork,
            3 => GoodbyeReason::FaultError,
            other => GoodbyeReason::Unknown(other),
        }
    }
}

impl From<GoodbyeReason> for u64 {
    fn from(reason: GoodbyeReason) -> u64 {
        match reason {
            GoodbyeReason::ClientShutdown => 1,
            GoodbyeReason::IrrelevantNetwork => 2,
            GoodbyeReason::FaultError => 3,
            GoodbyeReason::Unknown(other) => other,
        }
    }
}

impl Encode for GoodbyeReason {
    fn is_ssz_fixed_len() -> bool {
        <u64 as Encode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u64 as Encode>::ssz_fixed_len()
    }

    fn ssz_bytes_len(&self) -> usize {
        u64::from(*self).ssz_bytes_len()
    }

    fn ssz_append(&self, buf: &mut Vec<u8>) {
        u64::from(*self).ssz_append(buf)
    }
}

impl Decode for GoodbyeReason {
    fn is_ssz_fixed_len() -> bool {
        <u64 as Decode>::is_ssz_fixed_len()
    }

    fn ssz_fixed_len() -> usize {
        <u64 as Decode>::ssz_fixed_len()
    }

    fn from_ssz_bytes(bytes: &[u8]) -> Result<Self, ssz::DecodeError> {
        u64::from_ssz_bytes(bytes).map(Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct StatusMessage {
    pub fork_digest: ForkDigest,
    pub finalized_root: Hash256,
    pub finalized_epoch: Epoch,
    pub head_root: Hash256,
    pub head_slot: Slot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BlocksByRangeRequest {
    pub start_slot: Slot,
    pub count: u64,
    pub step: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct BlocksByRootRequest {
    pub block_roots: VariableList<Hash256, MaxRequestBlocks>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Ping {
    pub data: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct MetaData {
    pub seq_number: u64,
    pub attnets: BitVector<AttestationSubnetCount>,
}

pub fn write_uvarint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub fn read_uvarint(input: &[u8]) -> Result<(u64, usize), RpcError> {
    let mut value = 0u64;
    for (i, byte) in input.iter().enumerate() {
        if i >= MAX_VARINT_BYTES {
            return Err(RpcError::OversizedVarint);
        }
        // The tenth byte may only carry the final bit of a u64.
        if i == MAX_VARINT_BYTES - 1 && *byte > 1 {
            return Err(RpcError::OversizedVarint);
        }
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(RpcError::UnexpectedEof)
}

/// Frame one response chunk.
pub fn write_chunk<T: Encode>(out: &mut Vec<u8>, code: ResponseCode, payload: &T) {
    out.push(code.as_u8());
    let bytes = payload.as_ssz_bytes();
    write_uvarint(out, bytes.len() as u64);
    out.extend_from_slice(&bytes);
}

/// Parse one chunk off the front of `input`, returning the code, the raw
/// payload and the bytes consumed.
pub fn read_chunk(input: &[u8]) -> Result<(ResponseCode, &[u8], usize), RpcError> {
    let code = ResponseCode::from_u8(*input.first().ok_or(RpcError::UnexpectedEof)?)?;
    let (length, varint_len) = read_uvarint(&input[1..])?;
    if length > MAX_CHUNK_BYTES {
        return Err(RpcError::ChunkTooLarge {
            got: length,
            limit: MAX_CHUNK_BYTES,
        });
    }
    let payload_start = 1 + varint_len;
    let payload_end = payload_start + length as usize;
    if input.len() < payload_end {
        return Err(RpcError::UnexpectedEof);
    }
    Ok((code, &input[payload_start..payload_end], payload_end))
}

/// Parse a chunk and decode its SSZ payload (successful chunks only).
pub fn read_payload_chunk<T: Decode>(input: &[u8]) -> Result<(T, usize), RpcError> {
    let (code, payload, consumed) = read_chunk(input)?;
    if code != ResponseCode::Success {
        return Err(RpcError::MalformedRpc(format!(
            "expected a success chunk, got code {}",
            code.as_u8()
        )));
    }
    let value = T::from_ssz_bytes(payload)
        .map_err(|e| RpcError::MalformedRpc(format!("payload rejected: {e:?}")))?;
    Ok((value, consumed))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn uvarint_round_trips_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_uvarint(&mut out, value);
            assert!(out.len() <= MAX_VARINT_BYTES);
            let (back, consumed) = read_uvarint(&out).unwrap();
            assert_eq!(back, value);
            assert_eq!(consumed, out.len());
        }
    }

    #[test]
    fn uvarint_rejects_eleven_byte_prefixes() {
        let bytes = [0x80u8; 11];
        assert_eq!(read_uvarint(&bytes), Err(RpcError::OversizedVarint));
    }

    #[test]
    fn uvarint_rejects_u64_overflow() {
        // Ten continuation-heavy bytes encoding more than 64 bits.
        let mut bytes = vec![0xffu8; 9];
        bytes.push(0x7f);
        assert_eq!(read_uvarint(&bytes), Err(RpcError::OversizedVarint));
    }

    #[test]
    fn status_chunk_round_trips() {
        let status = StatusMessage {
            fork_digest: vec![1, 2, 3, 4].into(),
            finalized_root: Hash256::repeat_byte(9),
            finalized_epoch: 7,
            head_root: Hash256::repeat_byte(3),
            head_slot: 250,
        };
        let mut wire = Vec::new();
        write_chunk(&mut wire, ResponseCode::Success, &status);
        assert_eq!(wire[0], 0);

        let (decoded, consumed): (StatusMessage, usize) = read_payload_chunk(&wire).unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(decoded, status);
    }

    #[test]
    fn error_chunks_surface_their_code() {
        let mut wire = Vec::new();
        write_chunk(&mut wire, ResponseCode::ResourceUnavailable, &Ping { data: 0 });
        let (code, _, _) = read_chunk(&wire).unwrap();
        assert_eq!(code, ResponseCode::ResourceUnavailable);
        assert!(matches!(
            read_payload_chunk::<Ping>(&wire),
            Err(RpcError::MalformedRpc(_))
        ));
    }

    #[test]
    fn truncated_chunks_are_rejected() {
        let mut wire = Vec::new();
        write_chunk(&mut wire, ResponseCode::Success, &Ping { data: 77 });
        wire.truncate(wire.len() - 2);
        assert_eq!(read_chunk(&wire).unwrap_err(), RpcError::UnexpectedEof);
    }

    #[test]
    fn unknown_status_byte_is_rejected() {
        assert_eq!(
            read_chunk(&[9, 0]).unwrap_err(),
            RpcError::UnknownResponseCode(9)
        );
    }

    #[test]
    fn goodbye_codes_map_to_the_wire_values() {
        for (reason, value) in [
            (GoodbyeReason::ClientShutdown, 1u64),
            (GoodbyeReason::IrrelevantNetwork, 2),
            (GoodbyeReason::FaultError, 3),
        ] {
            assert_eq!(u64::from(reason), value);
            let bytes = reason.as_ssz_bytes();
            assert_eq!(GoodbyeReason::from_ssz_bytes(&bytes).unwrap(), reason);
        }
    }
}
