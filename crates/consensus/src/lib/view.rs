//! Typed views over schema-shaped trees.
//!
//! A [`View`] binds a schema to a node and is immutable, thread-safe and
//! cheap to clone. A [`MutView`] buffers writes as pending subtree
//! replacements and collapses them through a single batched tree update on
//! `commit`, so concurrent readers keep the previous snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::schema::{concat_index, Chase, SchemaError, SszSchema, BYTES_PER_CHUNK};
use crate::tree::{self, GeneralizedIndex, Node, TreeError};
use crate::types::Hash256;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ViewError {
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("view of {kind} cannot be read as {wanted}")]
    TypeMismatch {
        kind: &'static str,
        wanted: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct View {
    schema: Arc<SszSchema>,
    node: Arc<Node>,
}

impl View {
    pub fn new_default(schema: Arc<SszSchema>) -> Self {
        let node = schema.default_tree();
        Self { schema, node }
    }

    pub fn from_node(schema: Arc<SszSchema>, node: Arc<Node>) -> Self {
        Self { schema, node }
    }

    pub fn from_ssz_bytes(schema: Arc<SszSchema>, bytes: &[u8]) -> Result<Self, ViewError> {
        let node = codec::deserialize(&schema, bytes)?;
        Ok(Self { schema, node })
    }

    pub fn schema(&self) -> &Arc<SszSchema> {
        &self.schema
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn hash_tree_root(&self) -> Hash256 {
        self.node.hash_tree_root()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, ViewError> {
        Ok(codec::serialize(&self.schema, &self.node)?)
    }

    fn mismatch(&self, wanted: &'static str) -> ViewError {
        ViewError::TypeMismatch {
            kind: self.schema.kind_name(),
            wanted,
        }
    }

    pub fn as_u64(&self) -> Result<u64, ViewError> {
        match &*self.schema {
            SszSchema::Uint { bytes } if *bytes <= 8 => {
                let leaf = self.node.leaf_bytes(1)?;
                let mut raw = [0u8; 8];
                raw[..*bytes].copy_from_slice(&leaf[..*bytes]);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(self.mismatch("u64")),
        }
    }

    pub fn as_bool(&self) -> Result<bool, ViewError> {
        match &*self.schema {
            SszSchema::Bool => Ok(self.node.leaf_bytes(1)?[0] != 0),
            _ => Err(self.mismatch("bool")),
        }
    }

    pub fn as_hash256(&self) -> Result<Hash256, ViewError> {
        match &*self.schema {
            SszSchema::ByteVector { length: 32 } | SszSchema::Uint { bytes: 32 } => {
                Ok(Hash256::from(self.node.leaf_bytes(1)?))
            }
            _ => Err(self.mismatch("hash256")),
        }
    }

    pub fn as_bytes(&self) -> Result<Vec<u8>, ViewError> {
        match &*self.schema {
            SszSchema::ByteVector { .. } => self.serialize(),
            _ => Err(self.mismatch("bytes")),
        }
    }

    pub fn field(&self, i: usize) -> Result<View, ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => Ok(View {
                schema,
                node: tree::get(&self.node, index)?,
            }),
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn field_by_name(&self, name: &str) -> Result<View, ViewError> {
        let index = self.schema.field_index(name)?;
        self.field(index)
    }

    /// Element position resolved through the data half for lists.
    fn locate(&self, i: u64) -> Result<Chase, ViewError> {
        match &*self.schema {
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => {
                let data = self.schema.list_data_schema()?;
                Ok(reparent(data.child(i)?, self.schema.data_index()))
            }
            _ => Ok(self.schema.child(i)?),
        }
    }

    pub fn element(&self, i: u64) -> Result<View, ViewError> {
        match self.locate(i)? {
            Chase::Subtree { index, schema } => Ok(View {
                schema,
                node: tree::get(&self.node, index)?,
            }),
            _ => Err(self.mismatch("composite element")),
        }
    }

    pub fn element_u64(&self, i: u64) -> Result<u64, ViewError> {
        match self.locate(i)? {
            Chase::PackedValue {
                index,
                offset,
                size,
                ..
            } => {
                let leaf = tree::get(&self.node, index)?.leaf_bytes(index)?;
                let width = size.min(8);
                let mut raw = [0u8; 8];
                raw[..width].copy_from_slice(&leaf[offset..offset + width]);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(self.mismatch("packed element")),
        }
    }

    pub fn bit(&self, i: u64) -> Result<bool, ViewError> {
        match self.locate(i)? {
            Chase::PackedBit { index, bit } => {
                let leaf = tree::get(&self.node, index)?.leaf_bytes(index)?;
                Ok(leaf[bit / 8] >> (bit % 8) & 1 == 1)
            }
            _ => Err(self.mismatch("bit")),
        }
    }

    pub fn list_len(&self) -> Result<u64, ViewError> {
        match &*self.schema {
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => {
                Ok(codec::read_length(&self.node)?)
            }
            _ => Err(self.mismatch("length")),
        }
    }
}

fn reparent(chase: Chase, parent: GeneralizedIndex) -> Chase {
    match chase {
        Chase::Subtree { index, schema } => Chase::Subtree {
            index: concat_index(parent, index),
            schema,
        },
        Chase::PackedValue {
            index,
            offset,
            size,
            leaf_depth,
        } => Chase::PackedValue {
            index: concat_index(parent, index),
            offset,
            size,
            leaf_depth,
        },
        Chase::PackedBit { index, bit } => Chase::PackedBit {
            index: concat_index(parent, index),
            bit,
        },
    }
}

fn index_depth(index: GeneralizedIndex) -> u32 {
    63 - index.leading_zeros()
}

/// `descendant` expressed relative to `ancestor`, when it is one.
fn relative_index(
    ancestor: GeneralizedIndex,
    descendant: GeneralizedIndex,
) -> Option<GeneralizedIndex> {
    let shift = index_depth(descendant).checked_sub(index_depth(ancestor))?;
    if shift == 0 || descendant >> shift != ancestor {
        return None;
    }
    Some((1 << shift) | (descendant & ((1u64 << shift) - 1)))
}

/// Single-owner write view. Writes stage whole-subtree replacements keyed
/// by generalized index; `commit` runs them through one batched update.
#[derive(Debug)]
pub struct MutView {
    schema: Arc<SszSchema>,
    base: Arc<Node>,
    pending: HashMap<GeneralizedIndex, Arc<Node>>,
}

impl MutView {
    pub fn new(view: &View) -> Self {
        Self {
            schema: view.schema.clone(),
            base: view.node.clone(),
            pending: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<SszSchema> {
        &self.schema
    }

    /// Node at `index` as this writer currently sees it.
    fn current(&self, index: GeneralizedIndex) -> Result<Arc<Node>, ViewError> {
        if let Some(node) = self.pending.get(&index) {
            return Ok(node.clone());
        }
        for (staged, node) in &self.pending {
            if let Some(rel) = relative_index(*staged, index) {
                return Ok(tree::get(node, rel)?);
            }
        }
        Ok(tree::get(&self.base, index)?)
    }

    fn stage(&mut self, index: GeneralizedIndex, node: Arc<Node>) -> Result<(), ViewError> {
        let ancestor = self
            .pending
            .keys()
            .copied()
            .find(|staged| relative_index(*staged, index).is_some());
        if let Some(staged) = ancestor {
            let rel = relative_index(staged, index).expect("checked above");
            let merged = tree::set(&self.pending[&staged], rel, node)?;
            self.pending.insert(staged, merged);
            return Ok(());
        }
        // A wider write supersedes anything staged beneath it.
        self.pending
            .retain(|staged, _| relative_index(index, *staged).is_none());
        self.pending.insert(index, node);
        Ok(())
    }

    fn mismatch(&self, wanted: &'static str) -> ViewError {
        ViewError::TypeMismatch {
            kind: self.schema.kind_name(),
            wanted,
        }
    }

    fn locate(&self, i: u64) -> Result<Chase, ViewError> {
        match &*self.schema {
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => {
                let data = self.schema.list_data_schema()?;
                Ok(reparent(data.child(i)?, self.schema.data_index()))
            }
            _ => Ok(self.schema.child(i)?),
        }
    }

    pub fn set_field(&mut self, i: usize, value: &View) -> Result<(), ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => {
                if *schema != *value.schema().as_ref() {
                    return Err(self.mismatch("matching field schema"));
                }
                self.stage(index, value.node().clone())
            }
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn set_field_u64(&mut self, i: usize, value: u64) -> Result<(), ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => match &*schema {
                SszSchema::Uint { bytes } if *bytes <= 8 => {
                    let data = value.to_le_bytes()[..*bytes].to_vec();
                    self.stage(index, Node::packed(data, 0, *bytes))
                }
                _ => Err(self.mismatch("uint field")),
            },
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn set_field_bool(&mut self, i: usize, value: bool) -> Result<(), ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => match &*schema {
                SszSchema::Bool => self.stage(index, Node::packed(vec![value as u8], 0, 1)),
                _ => Err(self.mismatch("bool field")),
            },
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn set_field_hash256(&mut self, i: usize, value: Hash256) -> Result<(), ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => match &*schema {
                SszSchema::ByteVector { length: 32 } | SszSchema::Uint { bytes: 32 } => {
                    self.stage(index, Node::leaf(value))
                }
                _ => Err(self.mismatch("32-byte field")),
            },
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn set_element(&mut self, i: u64, value: &View) -> Result<(), ViewError> {
        match self.locate(i)? {
            Chase::Subtree { index, schema } => {
                if *schema != *value.schema().as_ref() {
                    return Err(self.mismatch("matching element schema"));
                }
                self.stage(index, value.node().clone())
            }
            _ => Err(self.mismatch("composite element")),
        }
    }

    pub fn set_element_u64(&mut self, i: u64, value: u64) -> Result<(), ViewError> {
        match self.locate(i)? {
            Chase::PackedValue {
                index,
                offset,
                size,
                leaf_depth,
            } => {
                let span = size << leaf_depth;
                let mut data = vec![0u8; span];
                let existing = self.current(index)?.leaf_bytes(index)?;
                data.copy_from_slice(&existing[..span]);
                let width = size.min(8);
                data[offset..offset + width].copy_from_slice(&value.to_le_bytes()[..width]);
                self.stage(index, Node::packed(data, leaf_depth, size))
            }
            _ => Err(self.mismatch("packed element")),
        }
    }

    pub fn set_bit(&mut self, i: u64, value: bool) -> Result<(), ViewError> {
        match self.locate(i)? {
            Chase::PackedBit { index, bit } => {
                let mut data = self.current(index)?.leaf_bytes(index)?.to_vec();
                if value {
                    data[bit / 8] |= 1 << (bit % 8);
                } else {
                    data[bit / 8] &= !(1 << (bit % 8));
                }
                self.stage(index, Node::packed(data, 0, BYTES_PER_CHUNK))
            }
            _ => Err(self.mismatch("bit")),
        }
    }

    pub fn element_u64(&self, i: u64) -> Result<u64, ViewError> {
        match self.locate(i)? {
            Chase::PackedValue {
                index,
                offset,
                size,
                ..
            } => {
                let leaf = self.current(index)?.leaf_bytes(index)?;
                let width = size.min(8);
                let mut raw = [0u8; 8];
                raw[..width].copy_from_slice(&leaf[offset..offset + width]);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(self.mismatch("packed element")),
        }
    }

    pub fn element(&self, i: u64) -> Result<View, ViewError> {
        match self.locate(i)? {
            Chase::Subtree { index, schema } => Ok(View {
                schema,
                node: self.current(index)?,
            }),
            _ => Err(self.mismatch("composite element")),
        }
    }

    pub fn field(&self, i: usize) -> Result<View, ViewError> {
        match self.schema.child(i as u64)? {
            Chase::Subtree { index, schema } => Ok(View {
                schema,
                node: self.current(index)?,
            }),
            _ => Err(self.mismatch("field subtree")),
        }
    }

    pub fn list_len(&self) -> Result<u64, ViewError> {
        match &*self.schema {
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => {
                let leaf = self
                    .current(self.schema.length_index())?
                    .leaf_bytes(self.schema.length_index())?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&leaf[..8]);
                Ok(u64::from_le_bytes(raw))
            }
            _ => Err(self.mismatch("length")),
        }
    }

    fn set_list_len(&mut self, length: u64) -> Result<(), ViewError> {
        self.stage(self.schema.length_index(), codec::length_leaf(length))
    }

    pub fn push(&mut self, value: &View) -> Result<(), ViewError> {
        let length = self.list_len()?;
        self.set_element(length, value)?;
        self.set_list_len(length + 1)
    }

    pub fn push_u64(&mut self, value: u64) -> Result<(), ViewError> {
        let length = self.list_len()?;
        self.set_element_u64(length, value)?;
        self.set_list_len(length + 1)
    }

    pub fn push_bit(&mut self, value: bool) -> Result<(), ViewError> {
        let length = self.list_len()?;
        match &*self.schema {
            SszSchema::Bitlist { max_length } if length < *max_length => {}
            SszSchema::Bitlist { .. } => {
                return Err(self.mismatch("bitlist capacity"));
            }
            _ => return Err(self.mismatch("bitlist")),
        }
        self.set_bit(length, value)?;
        self.set_list_len(length + 1)
    }

    /// Truncate a list to empty, dropping the data subtree.
    pub fn clear_list(&mut self) -> Result<(), ViewError> {
        let data_depth = match &*self.schema {
            SszSchema::List { .. } | SszSchema::Bitlist { .. } => self.schema.depth() - 1,
            _ => return Err(self.mismatch("list")),
        };
        self.stage(self.schema.data_index(), Node::zero(data_depth))?;
        self.set_list_len(0)
    }

    /// Collapse pending writes into a fresh read view.
    pub fn commit(self) -> Result<View, ViewError> {
        let mut updates: Vec<(GeneralizedIndex, Arc<Node>)> = self.pending.into_iter().collect();
        updates.sort_by(|(a, _), (b, _)| path_order(*a, *b));
        let node = tree::batch_update(&self.base, &updates)?;
        Ok(View {
            schema: self.schema,
            node,
        })
    }
}

/// Order indices by their root-to-node paths so sibling updates group
/// under shared ancestors.
fn path_order(a: GeneralizedIndex, b: GeneralizedIndex) -> std::cmp::Ordering {
    let da = index_depth(a);
    let db = index_depth(b);
    let deepest = da.max(db);
    (a << (deepest - da))
        .cmp(&(b << (deepest - db)))
        .then(da.cmp(&db))
}
