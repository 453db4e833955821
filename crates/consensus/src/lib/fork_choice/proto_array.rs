//! Dense arena for the block DAG used by LMD-GHOST head selection.
//!
//! Nodes are appended in insertion order, so a parent always sits at a
//! lower index than its children. Weights move through signed deltas
//! applied in one reverse pass that also refreshes the best-child and
//! best-descendant links.

use std::collections::HashMap;

use crate::types::{Epoch, Hash256, Slot};

use super::ForkChoiceError;

#[derive(Debug, Clone, PartialEq)]
pub struct ProtoNode {
    pub slot: Slot,
    pub root: Hash256,
    pub state_root: Hash256,
    pub parent: Option<usize>,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
    pub weight: u64,
    pub best_child: Option<usize>,
    pub best_descendant: Option<usize>,
}

/// Block description handed to the arena on import.
#[derive(Debug, Clone)]
pub struct Block {
    pub slot: Slot,
    pub root: Hash256,
    pub parent_root: Option<Hash256>,
    pub state_root: Hash256,
    pub justified_epoch: Epoch,
    pub finalized_epoch: Epoch,
}

#[derive(Debug, Clone)]
pub struct ProtoArray {
    pub(crate) justified_epoch: Epoch,
    pub(crate) finalized_epoch: Epoch,
    pub(crate) nodes: Vec<ProtoNode>,
    pub(crate) indices: HashMap<Hash256, usize>,
}

impl ProtoArray {
    pub fn new(anchor: Block, justified_epoch: Epoch, finalized_epoch: Epoch) -> Self {
        let mut array = Self {
            justified_epoch,
            finalized_epoch,
            nodes: Vec::new(),
            indices: HashMap::new(),
        };
        array.indices.insert(anchor.root, 0);
        array.nodes.push(ProtoNode {
            slot: anchor.slot,
            root: anchor.root,
            state_root: anchor.state_root,
            parent: None,
            justified_epoch,
            finalized_epoch,
            weight: 0,
            best_child: None,
            best_descendant: None,
        });
        array
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains_block(&self, root: &Hash256) -> bool {
        self.indices.contains_key(root)
    }

    pub fn node_by_root(&self, root: &Hash256) -> Option<&ProtoNode> {
        self.indices.get(root).map(|i| &self.nodes[*i])
    }

    /// Append a block. Re-imports of known roots are no-ops; a missing
    /// parent is the caller's cue to queue the block.
    pub fn on_block(&mut self, block: Block) -> Result<(), ForkChoiceError> {
        if self.indices.contains_key(&block.root) {
            return Ok(());
        }
        let parent = match block.parent_root {
            Some(parent_root) => Some(*self.indices.get(&parent_root).ok_or(
                ForkChoiceError::UnknownParent {
                    block_root: block.root,
                    parent_root,
                },
            )?),
            None => None,
        };

        let index = self.nodes.len();
        self.indices.insert(block.root, index);
        self.nodes.push(ProtoNode {
            slot: block.slot,
            root: block.root,
            state_root: block.state_root,
            parent,
            justified_epoch: block.justified_epoch,
            finalized_epoch: block.finalized_epoch,
            weight: 0,
            best_child: None,
            best_descendant: None,
        });

        if let Some(parent) = parent {
            self.maybe_update_best_child_and_descendant(parent, index)?;
        }
        Ok(())
    }

    /// Fold a delta batch into node weights, bubbling each node's delta up
    /// to its parent, then refresh the best links bottom-up.
    pub fn apply_score_changes(
        &mut self,
        mut deltas: Vec<i64>,
        justified_epoch: Epoch,
        finalized_epoch: Epoch,
    ) -> Result<(), ForkChoiceError> {
        if deltas.len() != self.nodes.len() {
            return Err(ForkChoiceError::InvalidDeltaLength {
                deltas: deltas.len(),
                nodes: self.nodes.len(),
            });
        }
        if justified_epoch != self.justified_epoch || finalized_epoch != self.finalized_epoch {
            self.justified_epoch = justified_epoch;
            self.finalized_epoch = finalized_epoch;
        }

        for index in (0..self.nodes.len()).rev() {
            let delta = deltas[index];
            let node = &mut self.nodes[index];
            let weight = (node.weight as i128) + (delta as i128);
            node.weight = u64::try_from(weight)
                .map_err(|_| ForkChoiceError::WeightOverflow { index })?;
            if let Some(parent) = node.parent {
                deltas[parent] = deltas[parent]
                    .checked_add(delta)
                    .ok_or(ForkChoiceError::WeightOverflow { index })?;
            }
        }
        for index in (0..self.nodes.len()).rev() {
            if let Some(parent) = self.nodes[index].parent {
                self.maybe_update_best_child_and_descendant(parent, index)?;
            }
        }
        Ok(())
    }

    /// Walk best descendants from the justified root.
    pub fn find_head(&self, justified_root: &Hash256) -> Result<Hash256, ForkChoiceError> {
        let justified_index = *self
            .indices
            .get(justified_root)
            .ok_or(ForkChoiceError::UnknownJustifiedRoot(*justified_root))?;
        let justified_node = self
            .nodes
            .get(justified_index)
            .ok_or(ForkChoiceError::InvalidNodeIndex(justified_index))?;
        let best_index = justified_node.best_descendant.unwrap_or(justified_index);
        let best_node = self
            .nodes
            .get(best_index)
            .ok_or(ForkChoiceError::InvalidNodeIndex(best_index))?;
        if !self.node_is_viable_for_head(best_node) {
            return Err(ForkChoiceError::InvalidBestNode {
                head_root: best_node.root,
                justified_epoch: self.justified_epoch,
            });
        }
        Ok(best_node.root)
    }

    /// Drop everything that does not descend from the new finalized root
    /// and renumber the arena so the finalized node becomes index 0.
    pub fn maybe_prune(&mut self, finalized_root: &Hash256) -> Result<(), ForkChoiceError> {
        let finalized_index = *self
            .indices
            .get(finalized_root)
            .ok_or(ForkChoiceError::UnknownFinalizedRoot(*finalized_root))?;
        if finalized_index == 0 {
            return Ok(());
        }

        // Parents precede children, so one forward pass marks the keepers.
        let mut keep = vec![false; self.nodes.len()];
        keep[finalized_index] = true;
        for index in finalized_index + 1..self.nodes.len() {
            if let Some(parent) = self.nodes[index].parent {
                keep[index] = keep[parent];
            }
        }

        let mut remap: Vec<Option<usize>> = vec![None; self.nodes.len()];
        let mut kept = 0usize;
        for (index, keep) in keep.iter().enumerate() {
            if *keep {
                remap[index] = Some(kept);
                kept += 1;
            }
        }

        let old_nodes = std::mem::take(&mut self.nodes);
        self.indices.clear();
        for (index, mut node) in old_nodes.into_iter().enumerate() {
            if remap[index].is_none() {
                continue;
            }
            node.parent = node.parent.and_then(|p| remap[p]);
            node.best_child = node.best_child.and_then(|c| remap[c]);
            node.best_descendant = node.best_descendant.and_then(|d| remap[d]);
            self.indices.insert(node.root, self.nodes.len());
            self.nodes.push(node);
        }
        Ok(())
    }

    /// Re-evaluate whether `child` should be its parent's best child, and
    /// keep the parent's best descendant consistent with the answer.
    fn maybe_update_best_child_and_descendant(
        &mut self,
        parent_index: usize,
        child_index: usize,
    ) -> Result<(), ForkChoiceError> {
        let child = self
            .nodes
            .get(child_index)
            .ok_or(ForkChoiceError::InvalidNodeIndex(child_index))?;
        let child_leads_to_viable_head = self.node_leads_to_viable_head(child)?;
        let child_best_descendant = child.best_descendant.unwrap_or(child_index);
        let (child_weight, child_root) = (child.weight, child.root);

        let parent = self
            .nodes
            .get(parent_index)
            .ok_or(ForkChoiceError::InvalidNodeIndex(parent_index))?;

        let new_links = match parent.best_child {
            Some(best_child_index) if best_child_index == child_index => {
                if child_leads_to_viable_head {
                    Some((Some(child_index), Some(child_best_descendant)))
                } else {
                    // The incumbent stopped being viable.
                    Some((None, None))
                }
            }
            Some(best_child_index) => {
                let best_child = self
                    .nodes
                    .get(best_child_index)
                    .ok_or(ForkChoiceError::InvalidNodeIndex(best_child_index))?;
                let best_child_viable = self.node_leads_to_viable_head(best_child)?;
                let challenger_wins = child_weight > best_child.weight
                    || (child_weight == best_child.weight && child_root > best_child.root);
                if child_leads_to_viable_head && (!best_child_viable || challenger_wins) {
                    Some((Some(child_index), Some(child_best_descendant)))
                } else if !child_leads_to_viable_head && best_child_viable {
                    None
                } else if !child_leads_to_viable_head && !best_child_viable {
                    Some((None, None))
                } else {
                    None
                }
            }
            None => {
                if child_leads_to_viable_head {
                    Some((Some(child_index), Some(child_best_descendant)))
                } else {
                    None
                }
            }
        };

        if let Some((best_child, best_descendant)) = new_links {
            let parent = &mut self.nodes[parent_index];
            parent.best_child = best_child;
            parent.best_descendant = best_descendant;
        }
        Ok(())
    }

    fn node_leads_to_viable_head(&self, node: &ProtoNode) -> Result<bool, ForkChoiceError> {
        if let Some(best_descendant) = node.best_descendant {
            let descendant = self
                .nodes
                .get(best_descendant)
                .ok_or(ForkChoiceError::InvalidNodeIndex(best_descendant))?;
            Ok(self.node_is_viable_for_head(descendant))
        } else {
            Ok(self.node_is_viable_for_head(node))
        }
    }

    /// A node can be the head only if it agrees with the store's
    /// checkpoints; genesis-epoch checkpoints accept everything.
    fn node_is_viable_for_head(&self, node: &ProtoNode) -> bool {
        (node.justified_epoch == self.justified_epoch || self.justified_epoch == 0)
            && (node.finalized_epoch == self.finalized_epoch || self.finalized_epoch == 0)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn root(byte: u8) -> Hash256 {
        Hash256::repeat_byte(byte)
    }

    fn block(slot: Slot, root_byte: u8, parent_byte: Option<u8>) -> Block {
        Block {
            slot,
            root: root(root_byte),
            parent_root: parent_byte.map(root),
            state_root: root(root_byte),
            justified_epoch: 1,
            finalized_epoch: 1,
        }
    }

    fn new_array() -> ProtoArray {
        ProtoArray::new(
            Block {
                slot: 0,
                root: root(0),
                parent_root: None,
                state_root: root(0),
                justified_epoch: 1,
                finalized_epoch: 1,
            },
            1,
            1,
        )
    }

    #[test]
    fn unknown_parent_is_reported() {
        let mut array = new_array();
        let result = array.on_block(block(1, 1, Some(9)));
        assert!(matches!(
            result,
            Err(ForkChoiceError::UnknownParent { .. })
        ));
    }

    #[test]
    fn duplicate_import_is_a_noop() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        array.on_block(block(1, 1, Some(0))).unwrap();
        assert_eq!(array.len(), 2);
    }

    #[test]
    fn weightier_child_wins_the_head() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        array.on_block(block(1, 2, Some(0))).unwrap();

        array.apply_score_changes(vec![0, 5, 3], 1, 1).unwrap();
        assert_eq!(array.find_head(&root(0)).unwrap(), root(1));

        // Votes move: the other branch takes over.
        array.apply_score_changes(vec![0, -5, 4], 1, 1).unwrap();
        assert_eq!(array.find_head(&root(0)).unwrap(), root(2));
    }

    #[test]
    fn equal_weights_tie_break_on_descending_root() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        array.on_block(block(1, 2, Some(0))).unwrap();
        array.apply_score_changes(vec![0, 7, 7], 1, 1).unwrap();
        // 0x02.. > 0x01.. bytewise.
        assert_eq!(array.find_head(&root(0)).unwrap(), root(2));
    }

    #[test]
    fn head_follows_the_deep_chain() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        array.on_block(block(2, 2, Some(1))).unwrap();
        array.on_block(block(3, 3, Some(2))).unwrap();
        array.apply_score_changes(vec![0, 0, 0, 2], 1, 1).unwrap();
        assert_eq!(array.find_head(&root(0)).unwrap(), root(3));
    }

    #[test]
    fn negative_total_weight_is_fatal() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        let result = array.apply_score_changes(vec![0, -3], 1, 1);
        assert!(matches!(
            result,
            Err(ForkChoiceError::WeightOverflow { .. })
        ));
    }

    #[test]
    fn prune_keeps_descendants_and_renumbers() {
        let mut array = new_array();
        array.on_block(block(1, 1, Some(0))).unwrap();
        array.on_block(block(1, 2, Some(0))).unwrap();
        array.on_block(block(2, 3, Some(1))).unwrap();
        array.on_block(block(3, 4, Some(3))).unwrap();
        array.apply_score_changes(vec![0, 6, 1, 6, 6], 1, 1).unwrap();
        let head_before = array.find_head(&root(1)).unwrap();

        array.maybe_prune(&root(1)).unwrap();
        assert!(!array.contains_block(&root(0)));
        assert!(!array.contains_block(&root(2)));
        assert_eq!(array.indices[&root(1)], 0);
        // Head is preserved for a justified root that survives the prune.
        assert_eq!(array.find_head(&root(1)).unwrap(), head_before);
        assert_eq!(head_before, root(4));
    }
}
