//! Persistent binary Merkle tree addressed by generalized indices.
//!
//! Nodes are immutable and shared through `Arc`; every mutation returns a
//! new tree that reuses all subtrees off the update path. Branch roots are
//! memoized on first computation, all-zero subtrees of any depth collapse
//! into a single tagged node, and runs of small basic values are held in
//! packed super-leaves carrying the raw little-endian bytes.

use std::sync::{Arc, OnceLock};

use ethereum_hashing::{hash32_concat, ZERO_HASHES};
use thiserror::Error;

use crate::types::Hash256;

/// Path from the root: 1 is the root, `2i` / `2i+1` the left/right child
/// of node `i`.
pub type GeneralizedIndex = u64;

pub const MAX_TREE_DEPTH: usize = 62;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TreeError {
    #[error("generalized index {0} does not address a node in this tree")]
    InvalidIndex(GeneralizedIndex),
    #[error("update at {index} grafts a subtree where a packed leaf lives")]
    MixedKinds { index: GeneralizedIndex },
    #[error("updates at {0} and {1} overlap")]
    OverlappingUpdates(GeneralizedIndex, GeneralizedIndex),
    #[error("zero subtree depth {0} exceeds the precomputed table")]
    DepthOutOfRange(usize),
}

#[derive(Debug, PartialEq)]
pub enum Node {
    /// 32 bytes, stored verbatim.
    Leaf(Hash256),
    /// Super-leaf for up to `2^depth` basic elements of `elem_size` bytes.
    /// `data` holds the occupied prefix; the rest of the span is zero.
    Packed {
        data: Vec<u8>,
        depth: usize,
        elem_size: usize,
    },
    Branch {
        left: Arc<Node>,
        right: Arc<Node>,
        root: OnceLock<Hash256>,
    },
    /// All-zero subtree of the given depth, shared process-wide.
    Zero(usize),
}

pub fn zero_hash(depth: usize) -> Result<Hash256, TreeError> {
    ZERO_HASHES
        .get(depth)
        .map(|h| Hash256::from_slice(h.as_slice()))
        .ok_or(TreeError::DepthOutOfRange(depth))
}

impl Node {
    pub fn leaf(value: Hash256) -> Arc<Node> {
        Arc::new(Node::Leaf(value))
    }

    pub fn packed(data: Vec<u8>, depth: usize, elem_size: usize) -> Arc<Node> {
        debug_assert!(elem_size << depth <= 32);
        debug_assert!(data.len() <= elem_size << depth);
        Arc::new(Node::Packed {
            data,
            depth,
            elem_size,
        })
    }

    pub fn branch(left: Arc<Node>, right: Arc<Node>) -> Arc<Node> {
        Arc::new(Node::Branch {
            left,
            right,
            root: OnceLock::new(),
        })
    }

    pub fn zero(depth: usize) -> Arc<Node> {
        Arc::new(Node::Zero(depth))
    }

    pub fn is_zero(&self) -> bool {
        matches!(self, Node::Zero(_))
    }

    /// Bytes of a bottom-layer node, zero-extended to 32.
    pub fn leaf_bytes(&self, at: GeneralizedIndex) -> Result<[u8; 32], TreeError> {
        let mut out = [0u8; 32];
        match self {
            Node::Leaf(h) => out.copy_from_slice(h.as_slice()),
            Node::Packed { data, .. } => out[..data.len()].copy_from_slice(data),
            Node::Zero(0) => {}
            _ => return Err(TreeError::InvalidIndex(at)),
        }
        Ok(out)
    }

    pub fn hash_tree_root(&self) -> Hash256 {
        match self {
            Node::Leaf(h) => *h,
            Node::Zero(depth) => {
                // Construction keeps depths inside the precomputed table.
                zero_hash(*depth).unwrap_or(Hash256::ZERO)
            }
            Node::Packed {
                data,
                depth,
                elem_size,
            } => packed_root(data, *depth, *elem_size),
            Node::Branch { left, right, root } => *root.get_or_init(|| {
                hash32_concat(
                    left.hash_tree_root().as_slice(),
                    right.hash_tree_root().as_slice(),
                )
                .into()
            }),
        }
    }

    /// Children of an interior node; zero subtrees materialize lazily.
    fn split(&self, at: GeneralizedIndex) -> Result<(Arc<Node>, Arc<Node>), TreeError> {
        match self {
            Node::Branch { left, right, .. } => Ok((left.clone(), right.clone())),
            Node::Zero(depth) if *depth > 0 => Ok((Node::zero(depth - 1), Node::zero(depth - 1))),
            Node::Packed { .. } => Err(TreeError::MixedKinds { index: at }),
            _ => Err(TreeError::InvalidIndex(at)),
        }
    }
}

/// Root of a packed byte span covering `2^depth` elements, each element a
/// zero-padded 32-byte chunk at the bottom of the recursion.
fn packed_root(data: &[u8], depth: usize, elem_size: usize) -> Hash256 {
    if data.is_empty() {
        return zero_hash(depth).unwrap_or(Hash256::ZERO);
    }
    if depth == 0 {
        let mut chunk = [0u8; 32];
        chunk[..data.len()].copy_from_slice(data);
        return Hash256::from(chunk);
    }
    let half_span = elem_size << (depth - 1);
    let split = std::cmp::min(data.len(), half_span);
    let left = packed_root(&data[..split], depth - 1, elem_size);
    let right = packed_root(&data[split..], depth - 1, elem_size);
    hash32_concat(left.as_slice(), right.as_slice()).into()
}

fn depth_of(index: GeneralizedIndex) -> u32 {
    63 - index.leading_zeros()
}

/// Walk the bits of `index` below its leading one, MSB first.
pub fn get(tree: &Arc<Node>, index: GeneralizedIndex) -> Result<Arc<Node>, TreeError> {
    if index < 1 {
        return Err(TreeError::InvalidIndex(index));
    }
    let mut current = tree.clone();
    for bit in (0..depth_of(index)).rev() {
        let (left, right) = current.split(index)?;
        current = if (index >> bit) & 1 == 1 { right } else { left };
    }
    Ok(current)
}

/// Structural update: rebuild the path from `index` to the root, sharing
/// everything else with the input tree.
pub fn set(
    tree: &Arc<Node>,
    index: GeneralizedIndex,
    value: Arc<Node>,
) -> Result<Arc<Node>, TreeError> {
    if index < 1 {
        return Err(TreeError::InvalidIndex(index));
    }
    set_at(tree, index, depth_of(index), value)
}

fn set_at(
    node: &Arc<Node>,
    index: GeneralizedIndex,
    bits_left: u32,
    value: Arc<Node>,
) -> Result<Arc<Node>, TreeError> {
    if bits_left == 0 {
        return Ok(value);
    }
    let (left, right) = node.split(index)?;
    let bit = bits_left - 1;
    let node = if (index >> bit) & 1 == 1 {
        Node::branch(left, set_at(&right, index, bit, value)?)
    } else {
        Node::branch(set_at(&left, index, bit, value)?, right)
    };
    Ok(node)
}

/// Apply many updates in a single pass so that each shared ancestor is
/// rebuilt exactly once. Indices must address disjoint subtrees.
pub fn batch_update(
    tree: &Arc<Node>,
    updates: &[(GeneralizedIndex, Arc<Node>)],
) -> Result<Arc<Node>, TreeError> {
    for (index, _) in updates {
        if *index < 1 {
            return Err(TreeError::InvalidIndex(*index));
        }
    }
    update_range(tree, updates, 0)
}

fn update_range(
    node: &Arc<Node>,
    updates: &[(GeneralizedIndex, Arc<Node>)],
    consumed_bits: u32,
) -> Result<Arc<Node>, TreeError> {
    match updates {
        [] => Ok(node.clone()),
        [(index, value)] if depth_of(*index) == consumed_bits => Ok(value.clone()),
        _ => {
            // A whole-subtree replacement cannot coexist with deeper edits.
            if let Some((index, _)) = updates.iter().find(|(i, _)| depth_of(*i) == consumed_bits) {
                let (other, _) = updates.iter().find(|(i, _)| i != index).expect("len > 1");
                return Err(TreeError::OverlappingUpdates(*index, *other));
            }
            let anchor = updates[0].0;
            let (left, right) = node.split(anchor)?;
            let mut left_updates = Vec::new();
            let mut right_updates = Vec::new();
            for (index, value) in updates {
                let bit = depth_of(*index) - consumed_bits - 1;
                if (index >> bit) & 1 == 1 {
                    right_updates.push((*index, value.clone()));
                } else {
                    left_updates.push((*index, value.clone()));
                }
            }
            Ok(Node::branch(
                update_range(&left, &left_updates, consumed_bits + 1)?,
                update_range(&right, &right_updates, consumed_bits + 1)?,
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn leaf(byte: u8) -> Arc<Node> {
        Node::leaf(Hash256::repeat_byte(byte))
    }

    #[test]
    fn zero_vector_of_eight_uint64_roots_to_depth_three() {
        // Eight element positions, three levels of zero subtrees.
        let tree = Node::zero(3);
        assert_eq!(tree.hash_tree_root(), zero_hash(3).unwrap());

        let z0 = Hash256::ZERO;
        let z1: Hash256 = hash32_concat(z0.as_slice(), z0.as_slice()).into();
        let z2: Hash256 = hash32_concat(z1.as_slice(), z1.as_slice()).into();
        let z3: Hash256 = hash32_concat(z2.as_slice(), z2.as_slice()).into();
        assert_eq!(tree.hash_tree_root(), z3);
    }

    #[test]
    fn get_root_returns_tree() {
        let tree = leaf(7);
        assert_eq!(get(&tree, 1).unwrap().hash_tree_root(), tree.hash_tree_root());
    }

    #[test]
    fn get_rejects_index_zero_and_descent_into_leaves() {
        let tree = Node::branch(leaf(1), leaf(2));
        assert_eq!(get(&tree, 0), Err(TreeError::InvalidIndex(0)));
        assert_eq!(get(&tree, 4), Err(TreeError::InvalidIndex(4)));
    }

    #[test]
    fn set_then_get_returns_value() {
        let tree = Node::zero(3);
        let value = leaf(0xab);
        let updated = set(&tree, 13, value.clone()).unwrap();
        assert_eq!(
            get(&updated, 13).unwrap().hash_tree_root(),
            value.hash_tree_root()
        );
        // Off-path subtrees are untouched and stay shared with the input.
        assert_eq!(get(&updated, 8).unwrap().hash_tree_root(), Hash256::ZERO);
        assert!(get(&updated, 4).unwrap().is_zero());
    }

    #[test]
    fn set_into_zero_materializes_only_the_path() {
        let tree = Node::zero(2);
        let updated = set(&tree, 5, leaf(1)).unwrap();
        assert!(get(&updated, 4).unwrap().is_zero());
        assert!(get(&updated, 3).unwrap().is_zero());
        assert!(!get(&updated, 2).unwrap().is_zero());
    }

    #[test]
    fn set_rejects_descent_into_packed() {
        let tree = Node::branch(Node::packed(vec![1, 0, 0, 0], 2, 8), Node::zero(2));
        assert_eq!(
            set(&tree, 4, leaf(1)),
            Err(TreeError::MixedKinds { index: 4 })
        );
    }

    #[test]
    fn batch_update_matches_sequential_sets() {
        let tree = Node::zero(4);
        let updates = vec![
            (17, leaf(1)),
            (19, leaf(2)),
            (24, leaf(3)),
            (31, leaf(4)),
        ];
        let mut sequential = tree.clone();
        for (index, value) in &updates {
            sequential = set(&sequential, *index, value.clone()).unwrap();
        }
        let batched = batch_update(&tree, &updates).unwrap();
        assert_eq!(batched.hash_tree_root(), sequential.hash_tree_root());
    }

    #[test]
    fn batch_update_rejects_overlap() {
        let tree = Node::zero(3);
        let result = batch_update(&tree, &[(2, Node::zero(2)), (9, leaf(1))]);
        assert!(matches!(result, Err(TreeError::OverlappingUpdates(_, _))));
    }

    #[test]
    fn packed_root_splits_by_element() {
        // [1u64, 2, 3] in a four-element span: merkleize the four padded
        // chunks, the absent fourth being all-zero.
        let mut data = Vec::new();
        for v in [1u64, 2, 3] {
            data.extend_from_slice(&v.to_le_bytes());
        }
        let node = Node::packed(data, 2, 8);

        let chunk = |v: u64| {
            let mut c = [0u8; 32];
            c[..8].copy_from_slice(&v.to_le_bytes());
            Hash256::from(c)
        };
        let h01: Hash256 =
            hash32_concat(chunk(1).as_slice(), chunk(2).as_slice()).into();
        let h23: Hash256 =
            hash32_concat(chunk(3).as_slice(), Hash256::ZERO.as_slice()).into();
        let expected: Hash256 = hash32_concat(h01.as_slice(), h23.as_slice()).into();
        assert_eq!(node.hash_tree_root(), expected);
    }

    #[test]
    fn zero_hash_table_matches_the_known_constants() {
        use hex_literal::hex;
        assert_eq!(zero_hash(0).unwrap(), Hash256::ZERO);
        assert_eq!(
            zero_hash(1).unwrap(),
            Hash256::from(hex!(
                "f5a5fd42d16a20302798ef6ed309979b43003d2320d9f0e8ea9831a92759fb4b"
            ))
        );
        assert_eq!(
            zero_hash(2).unwrap(),
            Hash256::from(hex!(
                "db56114e00fdd4c1f85c892bf35ac9a89289aaecb1ebd0a96cde606a748b5d71"
            ))
        );
        assert_eq!(
            zero_hash(3).unwrap(),
            Hash256::from(hex!(
                "c78009fdf07fc56a11f122370658a353aaa542ed63e44c4bc15ff4cd105ab33c"
            ))
        );
    }

    #[test]
    fn branch_root_is_memoized_and_stable() {
        let tree = Node::branch(leaf(1), leaf(2));
        let first = tree.hash_tree_root();
        assert_eq!(tree.hash_tree_root(), first);
        let expected: Hash256 = hash32_concat(
            Hash256::repeat_byte(1).as_slice(),
            Hash256::repeat_byte(2).as_slice(),
        )
        .into();
        assert_eq!(first, expected);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        const DEPTH: u32 = 6;

        fn arb_leaf_index() -> impl Strategy<Value = GeneralizedIndex> {
            (1u64 << DEPTH)..(1u64 << (DEPTH + 1))
        }

        proptest! {
            #[test]
            fn set_then_get_returns_the_written_leaf(
                index in arb_leaf_index(),
                byte in any::<u8>(),
            ) {
                let tree = Node::zero(DEPTH as usize);
                let value = leaf(byte);
                let updated = set(&tree, index, value.clone()).unwrap();
                prop_assert_eq!(
                    get(&updated, index).unwrap().hash_tree_root(),
                    value.hash_tree_root()
                );
            }

            #[test]
            fn updates_leave_every_other_leaf_untouched(
                writes in proptest::collection::btree_map(arb_leaf_index(), any::<u8>(), 1..12),
                probe in arb_leaf_index(),
            ) {
                let tree = Node::zero(DEPTH as usize);
                let mut updated = tree.clone();
                for (index, byte) in &writes {
                    updated = set(&updated, *index, leaf(*byte)).unwrap();
                }
                let expected = match writes.get(&probe) {
                    Some(byte) => Hash256::repeat_byte(*byte),
                    None => Hash256::ZERO,
                };
                prop_assert_eq!(get(&updated, probe).unwrap().hash_tree_root(), expected);
            }

            #[test]
            fn batched_and_sequential_updates_agree(
                writes in proptest::collection::btree_map(arb_leaf_index(), any::<u8>(), 1..16),
            ) {
                let tree = Node::zero(DEPTH as usize);
                let updates: Vec<(GeneralizedIndex, std::sync::Arc<Node>)> = writes
                    .iter()
                    .map(|(index, byte)| (*index, leaf(*byte)))
                    .collect();

                let mut sequential = tree.clone();
                for (index, value) in &updates {
                    sequential = set(&sequential, *index, value.clone()).unwrap();
                }
                let batched = batch_update(&tree, &updates).unwrap();
                prop_assert_eq!(batched.hash_tree_root(), sequential.hash_tree_root());
            }
        }
    }
}
