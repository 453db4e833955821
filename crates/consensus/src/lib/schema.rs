//! Runtime SSZ shape descriptors.
//!
//! A schema knows its tree depth, its default (all-zero) tree, how child
//! values are addressed with generalized indices, and its serialization
//! layout. Schemas are built once per configuration context and shared
//! behind `Arc`.

use std::sync::Arc;

use thiserror::Error;

use crate::tree::{GeneralizedIndex, Node};

pub const BYTES_PER_CHUNK: usize = 32;
pub const BITS_PER_CHUNK: usize = 256;
pub const BYTES_PER_LENGTH_OFFSET: usize = 4;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SchemaError {
    #[error("child {index} out of bounds for {kind} of length {length}")]
    OutOfBounds {
        kind: &'static str,
        index: u64,
        length: u64,
    },
    #[error("no field named {0}")]
    UnknownField(String),
    #[error("{kind} does not support {op}")]
    UnsupportedAccess { kind: &'static str, op: &'static str },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SszSchema {
    /// Little-endian unsigned integer of 1, 2, 4, 8 or 32 bytes.
    Uint { bytes: usize },
    Bool,
    /// Opaque byte blob of fixed length, chunk-granular.
    ByteVector { length: usize },
    /// Packed bits, 256 per chunk position.
    Bitvector { length: usize },
    /// Packed bits with a length mix-in; serialized with a sentinel bit.
    Bitlist { max_length: u64 },
    /// Homogeneous fixed-length collection, one tree position per element.
    Vector { elem: Arc<SszSchema>, length: u64 },
    /// Homogeneous bounded collection backed by `{data, length}`.
    List { elem: Arc<SszSchema>, max_length: u64 },
    /// Heterogeneous named fields.
    Container {
        fields: Vec<(&'static str, Arc<SszSchema>)>,
    },
}

/// Where a child of a node lives: its own subtree, a byte range inside a
/// packed leaf, or a bit inside a chunk.
#[derive(Debug, Clone)]
pub enum Chase {
    Subtree {
        index: GeneralizedIndex,
        schema: Arc<SszSchema>,
    },
    PackedValue {
        index: GeneralizedIndex,
        offset: usize,
        size: usize,
        /// Levels of the subtree the packed leaf stands for.
        leaf_depth: usize,
    },
    PackedBit {
        index: GeneralizedIndex,
        bit: usize,
    },
}

fn ceil_log2(n: u64) -> usize {
    if n <= 1 {
        0
    } else {
        64 - (n - 1).leading_zeros() as usize
    }
}

fn chunks_for_bits(bits: u64) -> u64 {
    bits.div_ceil(BITS_PER_CHUNK as u64)
}

impl SszSchema {
    pub fn uint8() -> Arc<Self> {
        Arc::new(SszSchema::Uint { bytes: 1 })
    }

    pub fn uint16() -> Arc<Self> {
        Arc::new(SszSchema::Uint { bytes: 2 })
    }

    pub fn uint32() -> Arc<Self> {
        Arc::new(SszSchema::Uint { bytes: 4 })
    }

    pub fn uint64() -> Arc<Self> {
        Arc::new(SszSchema::Uint { bytes: 8 })
    }

    pub fn uint256() -> Arc<Self> {
        Arc::new(SszSchema::Uint { bytes: 32 })
    }

    pub fn boolean() -> Arc<Self> {
        Arc::new(SszSchema::Bool)
    }

    pub fn byte_vector(length: usize) -> Arc<Self> {
        Arc::new(SszSchema::ByteVector { length })
    }

    pub fn bytes32() -> Arc<Self> {
        Self::byte_vector(32)
    }

    pub fn bitvector(length: usize) -> Arc<Self> {
        Arc::new(SszSchema::Bitvector { length })
    }

    pub fn bitlist(max_length: u64) -> Arc<Self> {
        Arc::new(SszSchema::Bitlist { max_length })
    }

    pub fn vector(elem: Arc<Self>, length: u64) -> Arc<Self> {
        Arc::new(SszSchema::Vector { elem, length })
    }

    pub fn list(elem: Arc<Self>, max_length: u64) -> Arc<Self> {
        Arc::new(SszSchema::List { elem, max_length })
    }

    pub fn container(fields: Vec<(&'static str, Arc<Self>)>) -> Arc<Self> {
        Arc::new(SszSchema::Container { fields })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SszSchema::Uint { .. } => "uint",
            SszSchema::Bool => "bool",
            SszSchema::ByteVector { .. } => "byte_vector",
            SszSchema::Bitvector { .. } => "bitvector",
            SszSchema::Bitlist { .. } => "bitlist",
            SszSchema::Vector { .. } => "vector",
            SszSchema::List { .. } => "list",
            SszSchema::Container { .. } => "container",
        }
    }

    /// Byte width for basic (packable) values.
    pub fn basic_size(&self) -> Option<usize> {
        match self {
            SszSchema::Uint { bytes } => Some(*bytes),
            SszSchema::Bool => Some(1),
            _ => None,
        }
    }

    /// Levels between this node's root and its child positions.
    pub fn depth(&self) -> usize {
        match self {
            SszSchema::Uint { .. } | SszSchema::Bool => 0,
            SszSchema::ByteVector { length } => {
                ceil_log2((*length as u64).div_ceil(BYTES_PER_CHUNK as u64))
            }
            SszSchema::Bitvector { length } => ceil_log2(chunks_for_bits(*length as u64)),
            SszSchema::Bitlist { max_length } => 1 + ceil_log2(chunks_for_bits(*max_length)),
            SszSchema::Vector { length, .. } => ceil_log2(*length),
            SszSchema::List { max_length, .. } => 1 + ceil_log2(*max_length),
            SszSchema::Container { fields } => ceil_log2(fields.len() as u64),
        }
    }

    /// The default value is the all-zero tree of this schema's shape.
    pub fn default_tree(&self) -> Arc<Node> {
        Node::zero(self.depth())
    }

    pub fn field_count(&self) -> Option<usize> {
        match self {
            SszSchema::Container { fields } => Some(fields.len()),
            _ => None,
        }
    }

    pub fn field_index(&self, name: &str) -> Result<usize, SchemaError> {
        match self {
            SszSchema::Container { fields } => fields
                .iter()
                .position(|(n, _)| *n == name)
                .ok_or_else(|| SchemaError::UnknownField(name.to_owned())),
            _ => Err(SchemaError::UnsupportedAccess {
                kind: self.kind_name(),
                op: "field lookup",
            }),
        }
    }

    /// Generalized index of the `{data, length}` halves backing lists.
    pub fn data_index(&self) -> GeneralizedIndex {
        2
    }

    pub fn length_index(&self) -> GeneralizedIndex {
        3
    }

    /// The vector schema holding a list's elements.
    pub fn list_data_schema(&self) -> Result<Arc<SszSchema>, SchemaError> {
        match self {
            SszSchema::List { elem, max_length } => {
                Ok(SszSchema::vector(elem.clone(), *max_length))
            }
            SszSchema::Bitlist { max_length } => {
                // Bit positions are chunk-granular; the data half behaves
                // like a chunk vector.
                Ok(Arc::new(SszSchema::Bitvector {
                    length: *max_length as usize,
                }))
            }
            _ => Err(SchemaError::UnsupportedAccess {
                kind: self.kind_name(),
                op: "list data access",
            }),
        }
    }

    /// Locate child `i` relative to this schema's root.
    pub fn child(&self, i: u64) -> Result<Chase, SchemaError> {
        match self {
            SszSchema::Container { fields } => {
                let count = fields.len() as u64;
                if i >= count {
                    return Err(SchemaError::OutOfBounds {
                        kind: "container",
                        index: i,
                        length: count,
                    });
                }
                let base = 1u64 << self.depth();
                Ok(Chase::Subtree {
                    index: base + i,
                    schema: fields[i as usize].1.clone(),
                })
            }
            SszSchema::Vector { elem, length } => {
                if i >= *length {
                    return Err(SchemaError::OutOfBounds {
                        kind: "vector",
                        index: i,
                        length: *length,
                    });
                }
                let depth = self.depth();
                let position = (1u64 << depth) + i;
                match elem.basic_size() {
                    Some(size) => {
                        let pack = ceil_log2((BYTES_PER_CHUNK / size) as u64);
                        let shift = pack.min(depth);
                        Ok(Chase::PackedValue {
                            index: position >> shift,
                            offset: (i as usize & ((1 << shift) - 1)) * size,
                            size,
                            leaf_depth: shift,
                        })
                    }
                    None => Ok(Chase::Subtree {
                        index: position,
                        schema: elem.clone(),
                    }),
                }
            }
            SszSchema::Bitvector { length } => {
                if i >= *length as u64 {
                    return Err(SchemaError::OutOfBounds {
                        kind: "bitvector",
                        index: i,
                        length: *length as u64,
                    });
                }
                let chunk = i / BITS_PER_CHUNK as u64;
                Ok(Chase::PackedBit {
                    index: (1u64 << self.depth()) + chunk,
                    bit: (i % BITS_PER_CHUNK as u64) as usize,
                })
            }
            SszSchema::ByteVector { length } => {
                let chunks = (*length as u64).div_ceil(BYTES_PER_CHUNK as u64);
                if i >= chunks {
                    return Err(SchemaError::OutOfBounds {
                        kind: "byte_vector",
                        index: i,
                        length: chunks,
                    });
                }
                Ok(Chase::PackedValue {
                    index: (1u64 << self.depth()) + i,
                    offset: 0,
                    size: BYTES_PER_CHUNK,
                    leaf_depth: 0,
                })
            }
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => {
                // Children of lists are addressed through the data half.
                Err(SchemaError::UnsupportedAccess {
                    kind: self.kind_name(),
                    op: "direct child access",
                })
            }
            SszSchema::Uint { .. } | SszSchema::Bool => Err(SchemaError::UnsupportedAccess {
                kind: self.kind_name(),
                op: "child access",
            }),
        }
    }

    /// Whether the serialized form has variable length.
    pub fn is_variable_size(&self) -> bool {
        match self {
            SszSchema::Uint { .. }
            | SszSchema::Bool
            | SszSchema::ByteVector { .. }
            | SszSchema::Bitvector { .. } => false,
            SszSchema::Bitlist { .. } | SszSchema::List { .. } => true,
            SszSchema::Vector { elem, .. } => elem.is_variable_size(),
            SszSchema::Container { fields } => {
                fields.iter().any(|(_, f)| f.is_variable_size())
            }
        }
    }

    /// Serialized length of fixed-size schemas; the offset width for
    /// variable ones (their footprint inside a fixed prefix).
    pub fn fixed_portion_len(&self) -> usize {
        if self.is_variable_size() {
            return BYTES_PER_LENGTH_OFFSET;
        }
        match self {
            SszSchema::Uint { bytes } => *bytes,
            SszSchema::Bool => 1,
            SszSchema::ByteVector { length } => *length,
            SszSchema::Bitvector { length } => length.div_ceil(8),
            SszSchema::Vector { elem, length } => elem.fixed_portion_len() * *length as usize,
            SszSchema::Container { fields } => {
                fields.iter().map(|(_, f)| f.fixed_portion_len()).sum()
            }
            SszSchema::Bitlist { .. } | SszSchema::List { .. } => unreachable!(),
        }
    }
}

/// Splice a child path onto a parent path.
pub fn concat_index(parent: GeneralizedIndex, child: GeneralizedIndex) -> GeneralizedIndex {
    let child_depth = 63 - child.leading_zeros();
    (parent << child_depth) | (child - (1 << child_depth))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn depths_follow_element_counts() {
        assert_eq!(SszSchema::uint64().depth(), 0);
        assert_eq!(SszSchema::vector(SszSchema::uint64(), 8).depth(), 3);
        assert_eq!(SszSchema::vector(SszSchema::uint64(), 5).depth(), 3);
        assert_eq!(SszSchema::list(SszSchema::uint64(), 4).depth(), 3);
        assert_eq!(SszSchema::bytes32().depth(), 0);
        assert_eq!(SszSchema::byte_vector(48).depth(), 1);
        assert_eq!(SszSchema::bitvector(4).depth(), 0);
        assert_eq!(
            SszSchema::container(vec![
                ("a", SszSchema::uint64()),
                ("b", SszSchema::uint64()),
                ("c", SszSchema::bytes32()),
            ])
            .depth(),
            2
        );
    }

    #[test]
    fn container_fields_sit_after_the_padded_base() {
        let schema = SszSchema::container(vec![
            ("a", SszSchema::uint64()),
            ("b", SszSchema::bytes32()),
            ("c", SszSchema::uint64()),
        ]);
        match schema.child(2).unwrap() {
            Chase::Subtree { index, .. } => assert_eq!(index, 6),
            other => panic!("expected subtree, got {other:?}"),
        }
    }

    #[test]
    fn packed_vector_elements_share_leaves() {
        let schema = SszSchema::vector(SszSchema::uint64(), 8);
        // Elements 0..4 live in the left leaf, 4..8 in the right.
        for (element, expected_index, expected_offset) in
            [(0, 2, 0), (3, 2, 24), (4, 3, 0), (7, 3, 24)]
        {
            match schema.child(element).unwrap() {
                Chase::PackedValue {
                    index,
                    offset,
                    size,
                    leaf_depth,
                } => {
                    assert_eq!(
                        (index, offset, size, leaf_depth),
                        (expected_index, expected_offset, 8, 2)
                    );
                }
                other => panic!("expected packed value, got {other:?}"),
            }
        }
    }

    #[test]
    fn small_vector_packs_at_the_root() {
        let schema = SszSchema::vector(SszSchema::uint64(), 2);
        match schema.child(1).unwrap() {
            Chase::PackedValue {
                index,
                offset,
                size,
                leaf_depth,
            } => assert_eq!((index, offset, size, leaf_depth), (1, 8, 8, 1)),
            other => panic!("expected packed value, got {other:?}"),
        }
    }

    #[test]
    fn out_of_bounds_children_are_rejected() {
        let schema = SszSchema::vector(SszSchema::uint64(), 4);
        assert!(matches!(
            schema.child(4),
            Err(SchemaError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn concat_builds_nested_paths() {
        // Field 2 of a 4-field container, then element 1 of a 2-slot
        // vector: 6 then 3 composes to 13.
        assert_eq!(concat_index(6, 3), 13);
        assert_eq!(concat_index(1, 5), 5);
        assert_eq!(concat_index(2, 2), 4);
    }
}
