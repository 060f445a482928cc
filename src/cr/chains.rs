//! Folding a branch's ops into per-node chains.
//!
//! A chain collects every op that touched one logical node, linked by
//! following block updates (the ref of step k is the unref of step k+1).
//! The chain's original pointer is the node's identity at the common
//! ancestor; the final pointer is its newest block.

use std::collections::HashMap;

use crate::core::block::{BlockId, BlockPointer};
use crate::core::identity::WriterInfo;
use crate::core::ops::Op;
use crate::core::revision::Revision;

/// Every op that touched one node, in commit order.
#[derive(Clone, Debug)]
pub struct OpChain {
    pub original: BlockPointer,
    pub most_recent: BlockPointer,
    /// `(op, effective writer)`: the op's own writer when it was frozen
    /// locally, else the writer of the revision that carried it.
    pub ops: Vec<(Op, WriterInfo)>,
}

impl OpChain {
    pub fn has_sync(&self) -> bool {
        self.ops.iter().any(|(op, _)| matches!(op, Op::Sync(_)))
    }
}

/// All chains of one revision range.
pub struct ChainSet {
    chains: Vec<OpChain>,
    by_original: HashMap<BlockId, usize>,
    /// Any pointer id seen in a lineage, mapped to the lineage's original.
    alias: HashMap<BlockId, BlockId>,
}

impl ChainSet {
    pub fn build(revisions: &[Revision]) -> ChainSet {
        let mut set = ChainSet {
            chains: Vec::new(),
            by_original: HashMap::new(),
            alias: HashMap::new(),
        };
        for rev in revisions {
            for op in &rev.ops {
                let writer = op
                    .common()
                    .writer
                    .clone()
                    .unwrap_or_else(|| rev.writer.clone());
                for update in op.all_updates() {
                    if !update.is_complete() {
                        continue;
                    }
                    let idx = set.chain_index_for(&update.unref);
                    let chain = &mut set.chains[idx];
                    chain.most_recent = update.new_ref.clone();
                    let original = chain.original.id;
                    set.alias.insert(update.new_ref.id, original);
                }
                // attach the op to the node its primary slots identify
                let mut attached: Vec<usize> = Vec::new();
                for slot in op.primary_slots() {
                    if !slot.is_set() {
                        continue;
                    }
                    let idx = set.chain_index_for(&slot.unref);
                    if !attached.contains(&idx) {
                        set.chains[idx].ops.push((op.clone(), writer.clone()));
                        attached.push(idx);
                    }
                }
            }
        }
        set
    }

    fn chain_index_for(&mut self, ptr: &BlockPointer) -> usize {
        let original = self.alias.get(&ptr.id).copied().unwrap_or(ptr.id);
        if let Some(idx) = self.by_original.get(&original) {
            return *idx;
        }
        let idx = self.chains.len();
        self.chains.push(OpChain {
            original: ptr.clone(),
            most_recent: ptr.clone(),
            ops: Vec::new(),
        });
        self.by_original.insert(original, idx);
        self.alias.insert(ptr.id, original);
        idx
    }

    /// Resolve any lineage pointer to the node's original id.
    pub fn original_of(&self, id: BlockId) -> BlockId {
        self.alias.get(&id).copied().unwrap_or(id)
    }

    pub fn chain_for(&self, id: BlockId) -> Option<&OpChain> {
        let original = self.original_of(id);
        self.by_original.get(&original).map(|idx| &self.chains[*idx])
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpChain> {
        self.chains.iter()
    }

    /// Did this branch write content to the node?
    pub fn wrote_node(&self, id: BlockId) -> bool {
        self.chain_for(id).map(OpChain::has_sync).unwrap_or(false)
    }

    /// Did this branch touch the node at all?
    pub fn touched_node(&self, id: BlockId) -> bool {
        self.chain_for(id)
            .map(|c| !c.ops.is_empty() || c.most_recent != c.original)
            .unwrap_or(false)
    }

    /// Did this branch rename the node with the given original id?
    pub fn renamed_node(&self, id: BlockId) -> bool {
        let original = self.original_of(id);
        self.chains.iter().any(|chain| {
            chain.ops.iter().any(|(op, _)| {
                matches!(op, Op::Rename(inner) if self.original_of(inner.renamed.id) == original)
            })
        })
    }

    /// Did this branch remove the node with the given original id?
    pub fn removed_node(&self, id: BlockId) -> bool {
        let original = self.original_of(id);
        self.chains.iter().any(|chain| {
            chain.ops.iter().any(|(op, _)| {
                matches!(op, Op::Rm(_))
                    && op
                        .common()
                        .unref_blocks
                        .iter()
                        .any(|u| self.original_of(u.id) == original)
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{fake_pointer, EntryType};
    use crate::core::identity::{Branch, DeviceName, WriterName};
    use crate::core::ops::{CreateOp, SyncOp};
    use crate::core::revision::RevisionNumber;
    use crate::core::wire::UnknownFields;

    fn writer_info() -> WriterInfo {
        WriterInfo::new(
            WriterName::new("u1").unwrap(),
            DeviceName::new("dev1").unwrap(),
            1000,
        )
    }

    fn rev_with(ops: Vec<Op>) -> Revision {
        Revision {
            prev: None,
            revision: RevisionNumber::INITIAL,
            branch: Branch::Master,
            ops,
            new_root: fake_pointer(99),
            writer: writer_info(),
            signature: None,
            unknown: UnknownFields::default(),
        }
    }

    #[test]
    fn chains_link_through_successive_updates() {
        let p0 = fake_pointer(1);
        let p1 = fake_pointer(2);
        let p2 = fake_pointer(3);

        // two ops rewriting the same directory: p0 -> p1 -> p2
        let mut op1 = Op::Create(CreateOp::new("a", p0.clone(), EntryType::File));
        op1.add_update(p0.clone(), p1.clone());
        let mut op2 = Op::Create(CreateOp::new("b", p1.clone(), EntryType::File));
        op2.add_update(p1.clone(), p2.clone());

        let set = ChainSet::build(&[rev_with(vec![op1]), rev_with(vec![op2])]);
        let chain = set.chain_for(p0.id).expect("chain exists");
        assert_eq!(chain.original, p0);
        assert_eq!(chain.most_recent, p2);
        assert_eq!(chain.ops.len(), 2);
        assert_eq!(set.original_of(p2.id), p0.id);
        assert_eq!(set.original_of(p1.id), p0.id);
    }

    #[test]
    fn wrote_node_sees_syncs_through_the_lineage() {
        let f0 = fake_pointer(10);
        let f1 = fake_pointer(11);
        let mut sync = Op::Sync(SyncOp::new(f0.clone()));
        sync.add_update(f0.clone(), f1.clone());
        let set = ChainSet::build(&[rev_with(vec![sync])]);
        assert!(set.wrote_node(f0.id));
        assert!(set.wrote_node(f1.id));
        assert!(!set.wrote_node(fake_pointer(12).id));
    }

    #[test]
    fn ops_attach_once_per_chain() {
        let d0 = fake_pointer(20);
        let d1 = fake_pointer(21);
        let mut rename = Op::Rename(crate::core::ops::RenameOp::new(
            "a",
            d0.clone(),
            "b",
            d0.clone(),
            fake_pointer(22),
            EntryType::File,
        ));
        rename.add_update(d0.clone(), d1.clone());
        let set = ChainSet::build(&[rev_with(vec![rename])]);
        let chain = set.chain_for(d0.id).unwrap();
        assert_eq!(chain.ops.len(), 1);
    }
}
