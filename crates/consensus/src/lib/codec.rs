//! Canonical serialization between schema-typed trees and byte strings.
//!
//! The wire layout is the standard fixed/variable split: fixed-size values
//! inline, variable-size values behind 4-byte offsets into a trailing
//! region. Decoders verify every offset before touching the payload.

use std::sync::Arc;

use thiserror::Error;

use crate::schema::{SszSchema, BYTES_PER_CHUNK, BYTES_PER_LENGTH_OFFSET};
use crate::tree::{self, Node, TreeError};
use crate::types::Hash256;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    #[error("malformed ssz: {reason}")]
    MalformedSsz { reason: String },
    #[error(transparent)]
    Tree(#[from] TreeError),
}

fn malformed(reason: impl Into<String>) -> CodecError {
    CodecError::MalformedSsz {
        reason: reason.into(),
    }
}

pub fn serialize(schema: &SszSchema, node: &Arc<Node>) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    serialize_into(schema, node, &mut out)?;
    Ok(out)
}

fn serialize_into(
    schema: &SszSchema,
    node: &Arc<Node>,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    match schema {
        SszSchema::Uint { bytes } => {
            let leaf = node.leaf_bytes(1)?;
            out.extend_from_slice(&leaf[..*bytes]);
        }
        SszSchema::Bool => {
            let leaf = node.leaf_bytes(1)?;
            out.push(leaf[0]);
        }
        SszSchema::ByteVector { length } => {
            gather_packed(node, schema.depth(), *length, BYTES_PER_CHUNK, out)?;
        }
        SszSchema::Bitvector { length } => {
            gather_packed(node, schema.depth(), length.div_ceil(8), BYTES_PER_CHUNK, out)?;
        }
        SszSchema::Bitlist { max_length } => {
            let bits = read_length(node)?;
            if bits > *max_length {
                return Err(malformed(format!(
                    "bitlist length {bits} exceeds bound {max_length}"
                )));
            }
            let data = tree::get(node, schema.data_index())?;
            let data_depth = schema.depth() - 1;
            let start = out.len();
            gather_packed(&data, data_depth, (bits as usize).div_ceil(8), BYTES_PER_CHUNK, out)?;
            // Sentinel bit one past the data.
            if bits % 8 == 0 {
                out.push(1);
            } else {
                let last = out.len() - 1;
                out[last] |= 1 << (bits % 8);
            }
            debug_assert_eq!(out.len() - start, (bits / 8 + 1) as usize);
        }
        SszSchema::Vector { elem, length } => match elem.basic_size() {
            Some(size) => {
                gather_packed(node, schema.depth(), size * *length as usize, size, out)?
            }
            None => serialize_composites(elem, node, 1 << schema.depth(), *length, out)?,
        },
        SszSchema::List { elem, max_length } => {
            let len = read_length(node)?;
            if len > *max_length {
                return Err(malformed(format!(
                    "list length {len} exceeds bound {max_length}"
                )));
            }
            let data = tree::get(node, schema.data_index())?;
            let data_depth = schema.depth() - 1;
            match elem.basic_size() {
                Some(size) => gather_packed(&data, data_depth, size * len as usize, size, out)?,
                None => serialize_composites(elem, &data, 1 << data_depth, len, out)?,
            }
        }
        SszSchema::Container { fields } => {
            let fixed_len: usize = fields.iter().map(|(_, f)| f.fixed_portion_len()).sum();
            let mut fixed = Vec::with_capacity(fixed_len);
            let mut variable = Vec::new();
            for (i, (_, field)) in fields.iter().enumerate() {
                let child = tree::get(node, (1 << schema.depth()) + i as u64)?;
                if field.is_variable_size() {
                    let offset = fixed_len + variable.len();
                    fixed.extend_from_slice(&(offset as u32).to_le_bytes());
                    serialize_into(field, &child, &mut variable)?;
                } else {
                    serialize_into(field, &child, &mut fixed)?;
                }
            }
            out.extend_from_slice(&fixed);
            out.extend_from_slice(&variable);
        }
    }
    Ok(())
}

fn serialize_composites(
    elem: &Arc<SszSchema>,
    parent: &Arc<Node>,
    base: u64,
    count: u64,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if elem.is_variable_size() {
        let mut parts: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
        for i in 0..count {
            let child = tree::get(parent, base + i)?;
            parts.push(serialize(elem, &child)?);
        }
        let mut offset = BYTES_PER_LENGTH_OFFSET * count as usize;
        for part in &parts {
            out.extend_from_slice(&(offset as u32).to_le_bytes());
            offset += part.len();
        }
        for part in parts {
            out.extend_from_slice(&part);
        }
    } else {
        for i in 0..count {
            let child = tree::get(parent, base + i)?;
            serialize_into(elem, &child, out)?;
        }
    }
    Ok(())
}

/// Read `total` bytes of packed element data out of a subtree.
fn gather_packed(
    node: &Arc<Node>,
    depth: usize,
    total: usize,
    elem_size: usize,
    out: &mut Vec<u8>,
) -> Result<(), CodecError> {
    if total == 0 {
        return Ok(());
    }
    if node.is_zero() {
        out.extend(std::iter::repeat(0u8).take(total));
        return Ok(());
    }
    if elem_size << depth <= BYTES_PER_CHUNK {
        let leaf = node.leaf_bytes(1)?;
        out.extend_from_slice(&leaf[..total]);
        return Ok(());
    }
    match &**node {
        Node::Branch { left, right, .. } => {
            let half = elem_size << (depth - 1);
            gather_packed(left, depth - 1, total.min(half), elem_size, out)?;
            if total > half {
                gather_packed(right, depth - 1, total - half, elem_size, out)?;
            }
            Ok(())
        }
        _ => Err(malformed("packed data interrupted by a foreign node")),
    }
}

/// Length half of a `{data, length}` pair.
pub fn read_length(node: &Arc<Node>) -> Result<u64, CodecError> {
    let leaf = tree::get(node, 3)?.leaf_bytes(3)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&leaf[..8]);
    Ok(u64::from_le_bytes(raw))
}

pub fn length_leaf(length: u64) -> Arc<Node> {
    Node::packed(length.to_le_bytes().to_vec(), 0, 8)
}

/// Build the subtree for a packed run of basic elements.
pub fn packed_subtree(data: &[u8], elem_size: usize, depth: usize) -> Arc<Node> {
    if data.is_empty() {
        return Node::zero(depth);
    }
    if elem_size << depth <= BYTES_PER_CHUNK {
        return Node::packed(data.to_vec(), depth, elem_size);
    }
    let half = elem_size << (depth - 1);
    let split = data.len().min(half);
    Node::branch(
        packed_subtree(&data[..split], elem_size, depth - 1),
        packed_subtree(&data[split..], elem_size, depth - 1),
    )
}

/// Build the subtree holding `nodes` as its leftmost positions.
pub fn subtree_from_nodes(nodes: &[Arc<Node>], depth: usize) -> Arc<Node> {
    if nodes.is_empty() {
        return Node::zero(depth);
    }
    if depth == 0 {
        return nodes[0].clone();
    }
    let half = 1usize << (depth - 1);
    let split = nodes.len().min(half);
    Node::branch(
        subtree_from_nodes(&nodes[..split], depth - 1),
        subtree_from_nodes(&nodes[split..], depth - 1),
    )
}

pub fn deserialize(schema: &SszSchema, bytes: &[u8]) -> Result<Arc<Node>, CodecError> {
    match schema {
        SszSchema::Uint { bytes: width } => {
            if bytes.len() != *width {
                return Err(malformed(format!(
                    "uint{} needs {width} bytes, got {}",
                    width * 8,
                    bytes.len()
                )));
            }
            Ok(Node::packed(bytes.to_vec(), 0, *width))
        }
        SszSchema::Bool => match bytes {
            [0] | [1] => Ok(Node::packed(bytes.to_vec(), 0, 1)),
            [b] => Err(malformed(format!("bool byte {b} out of range"))),
            _ => Err(malformed("bool needs exactly one byte")),
        },
        SszSchema::ByteVector { length } => {
            if bytes.len() != *length {
                return Err(malformed(format!(
                    "byte vector needs {length} bytes, got {}",
                    bytes.len()
                )));
            }
            Ok(packed_subtree(bytes, BYTES_PER_CHUNK, schema.depth()))
        }
        SszSchema::Bitvector { length } => {
            if bytes.len() != length.div_ceil(8) {
                return Err(malformed("bitvector byte length mismatch"));
            }
            if length % 8 != 0 {
                let excess = bytes[bytes.len() - 1] >> (length % 8);
                if excess != 0 {
                    return Err(malformed("bitvector has bits past its length"));
                }
            }
            Ok(packed_subtree(bytes, BYTES_PER_CHUNK, schema.depth()))
        }
        SszSchema::Bitlist { max_length } => {
            let last = *bytes
                .last()
                .ok_or_else(|| malformed("bitlist needs a sentinel byte"))?;
            if last == 0 {
                return Err(malformed("bitlist sentinel bit missing"));
            }
            let sentinel = 7 - last.leading_zeros() as u64;
            let bits = (bytes.len() as u64 - 1) * 8 + sentinel;
            if bits > *max_length {
                return Err(malformed(format!(
                    "bitlist length {bits} exceeds bound {max_length}"
                )));
            }
            let mut data = bytes.to_vec();
            let last_index = data.len() - 1;
            data[last_index] &= !(1u8 << sentinel);
            if bits % 8 == 0 {
                data.pop();
            }
            Ok(Node::branch(
                packed_subtree(&data, BYTES_PER_CHUNK, schema.depth() - 1),
                length_leaf(bits),
            ))
        }
        SszSchema::Vector { elem, length } => match elem.basic_size() {
            Some(size) => {
                if bytes.len() != size * *length as usize {
                    return Err(malformed("vector byte length mismatch"));
                }
                Ok(packed_subtree(bytes, size, schema.depth()))
            }
            None => {
                let nodes = deserialize_composites(elem, bytes, Some(*length))?;
                Ok(subtree_from_nodes(&nodes, schema.depth()))
            }
        },
        SszSchema::List { elem, max_length } => {
            let data_depth = schema.depth() - 1;
            match elem.basic_size() {
                Some(size) => {
                    if bytes.len() % size != 0 {
                        return Err(malformed("list bytes not a whole number of elements"));
                    }
                    let length = (bytes.len() / size) as u64;
                    if length > *max_length {
                        return Err(malformed(format!(
                            "list length {length} exceeds bound {max_length}"
                        )));
                    }
                    Ok(Node::branch(
                        packed_subtree(bytes, size, data_depth),
                        length_leaf(length),
                    ))
                }
                None => {
                    let nodes = deserialize_composites(elem, bytes, None)?;
                    let length = nodes.len() as u64;
                    if length > *max_length {
                        return Err(malformed(format!(
                            "list length {length} exceeds bound {max_length}"
                        )));
                    }
                    Ok(Node::branch(
                        subtree_from_nodes(&nodes, data_depth),
                        length_leaf(length),
                    ))
                }
            }
        }
        SszSchema::Container { fields } => {
            let fixed_len: usize = fields.iter().map(|(_, f)| f.fixed_portion_len()).sum();
            if bytes.len() < fixed_len {
                return Err(malformed(format!(
                    "container needs a {fixed_len}-byte fixed prefix, got {}",
                    bytes.len()
                )));
            }
            if !schema.is_variable_size() && bytes.len() != fixed_len {
                return Err(malformed("fixed container has trailing bytes"));
            }

            let mut cursor = 0usize;
            let mut offsets: Vec<(usize, usize)> = Vec::new(); // (field index, offset)
            let mut nodes: Vec<Option<Arc<Node>>> = vec![None; fields.len()];
            for (i, (_, field)) in fields.iter().enumerate() {
                let width = field.fixed_portion_len();
                let slice = &bytes[cursor..cursor + width];
                if field.is_variable_size() {
                    let mut raw = [0u8; 4];
                    raw.copy_from_slice(slice);
                    offsets.push((i, u32::from_le_bytes(raw) as usize));
                } else {
                    nodes[i] = Some(deserialize(field, slice)?);
                }
                cursor += width;
            }

            if let Some(&(_, first)) = offsets.first() {
                if first != fixed_len {
                    return Err(malformed(format!(
                        "first offset {first} does not point at the variable region ({fixed_len})"
                    )));
                }
            }
            for window in offsets.windows(2) {
                if window[1].1 < window[0].1 {
                    return Err(malformed("offsets decrease"));
                }
            }
            if let Some(&(_, last)) = offsets.last() {
                if last > bytes.len() {
                    return Err(malformed("offset past the end of input"));
                }
            }
            for (slot, window) in offsets.iter().enumerate() {
                let (i, start) = *window;
                let end = offsets
                    .get(slot + 1)
                    .map(|(_, o)| *o)
                    .unwrap_or(bytes.len());
                if end > bytes.len() || start > end {
                    return Err(malformed("offset past the end of input"));
                }
                nodes[i] = Some(deserialize(&fields[i].1, &bytes[start..end])?);
            }

            let nodes: Vec<Arc<Node>> = nodes.into_iter().map(|n| n.expect("filled")).collect();
            Ok(subtree_from_nodes(&nodes, schema.depth()))
        }
    }
}

fn deserialize_composites(
    elem: &Arc<SszSchema>,
    bytes: &[u8],
    expected: Option<u64>,
) -> Result<Vec<Arc<Node>>, CodecError> {
    if elem.is_variable_size() {
        if bytes.is_empty() {
            return match expected {
                Some(0) | None => Ok(Vec::new()),
                Some(n) => Err(malformed(format!("expected {n} elements, got none"))),
            };
        }
        if bytes.len() < BYTES_PER_LENGTH_OFFSET {
            return Err(malformed("truncated offset table"));
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&bytes[..4]);
        let first = u32::from_le_bytes(raw) as usize;
        if first % BYTES_PER_LENGTH_OFFSET != 0 || first == 0 {
            return Err(malformed("first offset does not cover the offset table"));
        }
        let count = first / BYTES_PER_LENGTH_OFFSET;
        if let Some(n) = expected {
            if count as u64 != n {
                return Err(malformed(format!("expected {n} elements, got {count}")));
            }
        }
        if bytes.len() < first {
            return Err(malformed("offset table past the end of input"));
        }
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let mut raw = [0u8; 4];
            raw.copy_from_slice(&bytes[i * 4..i * 4 + 4]);
            offsets.push(u32::from_le_bytes(raw) as usize);
        }
        for window in offsets.windows(2) {
            if window[1] < window[0] {
                return Err(malformed("offsets decrease"));
            }
        }
        if *offsets.last().expect("count > 0") > bytes.len() {
            return Err(malformed("offset past the end of input"));
        }
        let mut nodes = Vec::with_capacity(count);
        for (i, start) in offsets.iter().enumerate() {
            let end = offsets.get(i + 1).copied().unwrap_or(bytes.len());
            if *start > end {
                return Err(malformed("offset past the end of input"));
            }
            nodes.push(deserialize(elem, &bytes[*start..end])?);
        }
        Ok(nodes)
    } else {
        let width = elem.fixed_portion_len();
        if bytes.len() % width != 0 {
            return Err(malformed("input not a whole number of elements"));
        }
        let count = bytes.len() / width;
        if let Some(n) = expected {
            if count as u64 != n {
                return Err(malformed(format!("expected {n} elements, got {count}")));
            }
        }
        bytes
            .chunks(width)
            .map(|chunk| deserialize(elem, chunk))
            .collect()
    }
}

/// Root of a schema-typed tree. Length mix-ins for lists and bitlists fall
/// out of the `{data, length}` pairing.
pub fn hash_tree_root(node: &Arc<Node>) -> Hash256 {
    node.hash_tree_root()
}

#[cfg(test)]
mod test {
    use super::*;
    use ethereum_hashing::hash32_concat;

    fn uint64_list_node(values: &[u64], max: u64) -> (Arc<SszSchema>, Arc<Node>) {
        let schema = SszSchema::list(SszSchema::uint64(), max);
        let mut bytes = Vec::new();
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let node = deserialize(&schema, &bytes).unwrap();
        (schema, node)
    }

    #[test]
    fn uint64_round_trip() {
        let schema = SszSchema::uint64();
        let node = deserialize(&schema, &42u64.to_le_bytes()).unwrap();
        assert_eq!(serialize(&schema, &node).unwrap(), 42u64.to_le_bytes());
    }

    #[test]
    fn list_mixes_length_into_root() {
        let (_, node) = uint64_list_node(&[1, 2, 3], 4);

        let chunk = |v: u64| {
            let mut c = [0u8; 32];
            c[..8].copy_from_slice(&v.to_le_bytes());
            Hash256::from(c)
        };
        let h01: Hash256 = hash32_concat(chunk(1).as_slice(), chunk(2).as_slice()).into();
        let h23: Hash256 = hash32_concat(chunk(3).as_slice(), chunk(0).as_slice()).into();
        let data_root: Hash256 = hash32_concat(h01.as_slice(), h23.as_slice()).into();
        let mut len_chunk = [0u8; 32];
        len_chunk[..8].copy_from_slice(&3u64.to_le_bytes());
        let expected: Hash256 = hash32_concat(data_root.as_slice(), &len_chunk).into();

        assert_eq!(node.hash_tree_root(), expected);
    }

    #[test]
    fn list_round_trips_and_reads_length() {
        let (schema, node) = uint64_list_node(&[5, 6, 7, 8, 9], 32);
        assert_eq!(read_length(&node).unwrap(), 5);
        let bytes = serialize(&schema, &node).unwrap();
        let again = deserialize(&schema, &bytes).unwrap();
        assert_eq!(node.hash_tree_root(), again.hash_tree_root());
    }

    #[test]
    fn list_rejects_overflow() {
        let schema = SszSchema::list(SszSchema::uint64(), 2);
        let mut bytes = Vec::new();
        for v in [1u64, 2, 3] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        assert!(matches!(
            deserialize(&schema, &bytes),
            Err(CodecError::MalformedSsz { .. })
        ));
    }

    #[test]
    fn bitlist_round_trips_with_sentinel() {
        let schema = SszSchema::bitlist(16);
        // Ten bits: 1,0,0,1,0,0,0,1 | 0,1 then the sentinel at bit 2.
        let bytes = vec![0b1000_1001u8, 0b0000_0110];
        let node = deserialize(&schema, &bytes).unwrap();
        assert_eq!(read_length(&node).unwrap(), 10);
        assert_eq!(serialize(&schema, &node).unwrap(), bytes);
    }

    #[test]
    fn bitlist_without_sentinel_is_rejected() {
        let schema = SszSchema::bitlist(16);
        assert!(matches!(
            deserialize(&schema, &[0b0000_0001, 0]),
            Err(CodecError::MalformedSsz { .. })
        ));
    }

    #[test]
    fn container_round_trips_mixed_fields() {
        let schema = SszSchema::container(vec![
            ("slot", SszSchema::uint64()),
            ("values", SszSchema::list(SszSchema::uint64(), 8)),
            ("root", SszSchema::bytes32()),
            ("tail", SszSchema::list(SszSchema::uint8(), 64)),
        ]);
        // Fixed prefix: 8 (slot) + 4 (offset) + 32 (root) + 4 (offset).
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&48u32.to_le_bytes()); // values offset
        let root = [0xabu8; 32];
        bytes.extend_from_slice(&root);
        bytes.extend_from_slice(&64u32.to_le_bytes()); // tail offset
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&2u64.to_le_bytes());
        bytes.extend_from_slice(&[9, 9, 9]);

        let node = deserialize(&schema, &bytes).unwrap();
        assert_eq!(serialize(&schema, &node).unwrap(), bytes);
    }

    #[test]
    fn container_rejects_bad_first_offset() {
        let schema = SszSchema::container(vec![
            ("slot", SszSchema::uint64()),
            ("values", SszSchema::list(SszSchema::uint8(), 8)),
        ]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&13u32.to_le_bytes()); // should be 12
        bytes.push(1);
        assert!(matches!(
            deserialize(&schema, &bytes),
            Err(CodecError::MalformedSsz { .. })
        ));
    }

    #[test]
    fn container_rejects_decreasing_offsets() {
        let schema = SszSchema::container(vec![
            ("a", SszSchema::list(SszSchema::uint8(), 8)),
            ("b", SszSchema::list(SszSchema::uint8(), 8)),
        ]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&[0, 0, 0]);
        assert!(matches!(
            deserialize(&schema, &bytes),
            Err(CodecError::MalformedSsz { .. })
        ));
    }

    #[test]
    fn container_rejects_offset_past_end() {
        let schema = SszSchema::container(vec![
            ("a", SszSchema::uint64()),
            ("b", SszSchema::list(SszSchema::uint8(), 8)),
        ]);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&7u64.to_le_bytes());
        bytes.extend_from_slice(&99u32.to_le_bytes());
        assert!(matches!(
            deserialize(&schema, &bytes),
            Err(CodecError::MalformedSsz { .. })
        ));
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn uint64_lists_round_trip(values in proptest::collection::vec(any::<u64>(), 0..32)) {
                let schema = SszSchema::list(SszSchema::uint64(), 32);
                let mut bytes = Vec::new();
                for v in &values {
                    bytes.extend_from_slice(&v.to_le_bytes());
                }
                let node = deserialize(&schema, &bytes).unwrap();
                prop_assert_eq!(read_length(&node).unwrap(), values.len() as u64);
                prop_assert_eq!(serialize(&schema, &node).unwrap(), bytes);
            }

            #[test]
            fn bitlists_round_trip(bits in proptest::collection::vec(any::<bool>(), 0..64)) {
                let schema = SszSchema::bitlist(64);
                let mut bytes = vec![0u8; bits.len() / 8 + 1];
                for (i, bit) in bits.iter().enumerate() {
                    if *bit {
                        bytes[i / 8] |= 1 << (i % 8);
                    }
                }
                bytes[bits.len() / 8] |= 1 << (bits.len() % 8);

                let node = deserialize(&schema, &bytes).unwrap();
                prop_assert_eq!(read_length(&node).unwrap(), bits.len() as u64);
                prop_assert_eq!(serialize(&schema, &node).unwrap(), bytes);
            }
        }
    }

    #[test]
    fn variable_list_of_containers_round_trips() {
        let inner = SszSchema::container(vec![
            ("x", SszSchema::uint64()),
            ("bits", SszSchema::bitlist(8)),
        ]);
        let schema = SszSchema::list(inner, 4);

        // Two elements, each: x inline, bits behind an offset.
        let mut elem1 = Vec::new();
        elem1.extend_from_slice(&1u64.to_le_bytes());
        elem1.extend_from_slice(&12u32.to_le_bytes());
        elem1.push(0b101); // two bits + sentinel
        let mut elem2 = Vec::new();
        elem2.extend_from_slice(&2u64.to_le_bytes());
        elem2.extend_from_slice(&12u32.to_le_bytes());
        elem2.push(0b1); // empty

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&8u32.to_le_bytes());
        bytes.extend_from_slice(&(8 + elem1.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&elem1);
        bytes.extend_from_slice(&elem2);

        let node = deserialize(&schema, &bytes).unwrap();
        assert_eq!(read_length(&node).unwrap(), 2);
        assert_eq!(serialize(&schema, &node).unwrap(), bytes);
    }
}
