//! Typed filesystem operations with block-pointer update accounting.
//!
//! Every mutation is recorded as one op. Ops carry three kinds of pointer
//! bookkeeping: `ref_blocks` (pointers newly brought into existence),
//! `unref_blocks` (pointers freed), and `updates` (pointer replacements).
//! Updates whose unref side matches an op's primary slot (the directory or
//! file the op mutates) fold into that slot instead of the generic list.

use std::fmt;

use super::block::{BlockPointer, EntryType};
use super::identity::WriterInfo;
use super::revision::RevisionNumber;
use super::wire::UnknownFields;

/// A pointer replacement: the block at `unref` is superseded by `new_ref`.
///
/// Either side may be the zero pointer while the op is still being built.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BlockUpdate {
    pub unref: BlockPointer,
    pub new_ref: BlockPointer,
}

impl BlockUpdate {
    pub fn new(unref: BlockPointer) -> Self {
        Self {
            unref,
            new_ref: BlockPointer::default(),
        }
    }

    /// True once the unref side is a real pointer.
    pub fn is_set(&self) -> bool {
        self.unref.is_initialized()
    }

    /// True once both sides are real pointers.
    pub fn is_complete(&self) -> bool {
        self.unref.is_initialized() && self.new_ref.is_initialized()
    }

    /// The newest pointer this update knows for the node.
    pub fn most_recent(&self) -> &BlockPointer {
        if self.new_ref.is_initialized() {
            &self.new_ref
        } else {
            &self.unref
        }
    }

    pub fn reversed(&self) -> BlockUpdate {
        BlockUpdate {
            unref: self.new_ref.clone(),
            new_ref: self.unref.clone(),
        }
    }
}

/// One dirty byte range of a file; `len == 0` means truncate-to-`off`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
    pub unknown: UnknownFields,
}

impl WriteRange {
    pub fn write(off: u64, len: u64) -> Self {
        Self {
            off,
            len,
            unknown: UnknownFields::default(),
        }
    }

    pub fn truncate(off: u64) -> Self {
        Self::write(off, 0)
    }

    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte affected. Offsets are unsigned and do not wrap.
    pub fn end(&self) -> u64 {
        self.off + self.len
    }
}

impl fmt::Display for WriteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_truncate() {
            write!(f, "trunc@{}", self.off)
        } else {
            write!(f, "{}+{}", self.off, self.len)
        }
    }
}

/// Pointer accounting shared by every op kind.
///
/// `writer` and `final_path` are local bookkeeping: set when the op is
/// frozen, never serialized.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OpCommon {
    pub ref_blocks: Vec<BlockPointer>,
    pub unref_blocks: Vec<BlockPointer>,
    pub updates: Vec<BlockUpdate>,
    pub unknown: UnknownFields,
    pub writer: Option<WriterInfo>,
    pub final_path: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CreateOp {
    pub common: OpCommon,
    pub new_name: String,
    pub dir: BlockUpdate,
    pub entry_type: EntryType,
    pub sym_path: Option<String>,
}

impl CreateOp {
    pub fn new(new_name: impl Into<String>, old_dir: BlockPointer, entry_type: EntryType) -> Self {
        Self {
            common: OpCommon::default(),
            new_name: new_name.into(),
            dir: BlockUpdate::new(old_dir),
            entry_type,
            sym_path: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RmOp {
    pub common: OpCommon,
    pub old_name: String,
    pub dir: BlockUpdate,
    pub removed_dir: bool,
}

impl RmOp {
    pub fn new(old_name: impl Into<String>, old_dir: BlockPointer) -> Self {
        Self {
            common: OpCommon::default(),
            old_name: old_name.into(),
            dir: BlockUpdate::new(old_dir),
            removed_dir: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RenameOp {
    pub common: OpCommon,
    pub old_name: String,
    pub old_dir: BlockUpdate,
    pub new_name: String,
    /// Stays unset when the rename happens within one directory; only the
    /// old-dir slot carries the change then.
    pub new_dir: BlockUpdate,
    pub renamed: BlockPointer,
    pub renamed_type: EntryType,
}

impl RenameOp {
    pub fn new(
        old_name: impl Into<String>,
        old_dir: BlockPointer,
        new_name: impl Into<String>,
        new_dir: BlockPointer,
        renamed: BlockPointer,
        renamed_type: EntryType,
    ) -> Self {
        let new_dir_update = if new_dir == old_dir {
            BlockUpdate::default()
        } else {
            BlockUpdate::new(new_dir)
        };
        Self {
            common: OpCommon::default(),
            old_name: old_name.into(),
            old_dir: BlockUpdate::new(old_dir),
            new_name: new_name.into(),
            new_dir: new_dir_update,
            renamed,
            renamed_type,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncOp {
    pub common: OpCommon,
    pub file: BlockUpdate,
    pub writes: Vec<WriteRange>,
}

impl SyncOp {
    pub fn new(old_file: BlockPointer) -> Self {
        Self {
            common: OpCommon::default(),
            file: BlockUpdate::new(old_file),
            writes: Vec::new(),
        }
    }

    /// Record a write as issued; no merging happens at this stage.
    pub fn add_write(&mut self, off: u64, len: u64) {
        self.writes.push(WriteRange::write(off, len));
    }

    /// Record a truncate as issued.
    pub fn add_truncate(&mut self, off: u64) {
        self.writes.push(WriteRange::truncate(off));
    }

    /// Fold this op's writes onto `prior` (the collapsed ranges of earlier
    /// syncs in the same branch), producing the minimal dirty-byte set.
    pub fn collapse_write_range(&self, prior: Vec<WriteRange>) -> Vec<WriteRange> {
        let mut acc = prior;
        for w in &self.writes {
            acc = coalesce_writes(&acc, w);
        }
        acc
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttrKind {
    Mtime,
    Exec,
}

impl AttrKind {
    pub(crate) fn code(&self) -> u8 {
        match self {
            AttrKind::Mtime => 0,
            AttrKind::Exec => 1,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(AttrKind::Mtime),
            1 => Some(AttrKind::Exec),
            _ => None,
        }
    }
}

impl fmt::Display for AttrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrKind::Mtime => write!(f, "mtime"),
            AttrKind::Exec => write!(f, "exec"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SetAttrOp {
    pub common: OpCommon,
    pub name: String,
    pub dir: BlockUpdate,
    pub attr: AttrKind,
    pub file: BlockPointer,
}

impl SetAttrOp {
    pub fn new(
        name: impl Into<String>,
        old_dir: BlockPointer,
        attr: AttrKind,
        file: BlockPointer,
    ) -> Self {
        Self {
            common: OpCommon::default(),
            name: name.into(),
            dir: BlockUpdate::new(old_dir),
            attr,
            file,
        }
    }
}

/// Marker stamped on the revision a resolution publishes; its common fields
/// summarize the net block delta of the merge.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolutionOp {
    pub common: OpCommon,
}

impl ResolutionOp {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RekeyOp {
    pub common: OpCommon,
}

impl RekeyOp {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct GcOp {
    pub common: OpCommon,
    /// Everything up to and including this revision has been collected.
    pub latest_rev: RevisionNumber,
}

impl GcOp {
    pub fn new(latest_rev: RevisionNumber) -> Self {
        Self {
            common: OpCommon::default(),
            latest_rev,
        }
    }
}

/// A recorded filesystem mutation. Closed set; every consumer matches
/// exhaustively.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    Create(CreateOp),
    Rm(RmOp),
    Rename(RenameOp),
    Sync(SyncOp),
    SetAttr(SetAttrOp),
    Resolution(ResolutionOp),
    Rekey(RekeyOp),
    Gc(GcOp),
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Create(_) => "create",
            Op::Rm(_) => "rm",
            Op::Rename(_) => "rename",
            Op::Sync(_) => "sync",
            Op::SetAttr(_) => "set_attr",
            Op::Resolution(_) => "resolution",
            Op::Rekey(_) => "rekey",
            Op::Gc(_) => "gc",
        }
    }

    pub fn common(&self) -> &OpCommon {
        match self {
            Op::Create(op) => &op.common,
            Op::Rm(op) => &op.common,
            Op::Rename(op) => &op.common,
            Op::Sync(op) => &op.common,
            Op::SetAttr(op) => &op.common,
            Op::Resolution(op) => &op.common,
            Op::Rekey(op) => &op.common,
            Op::Gc(op) => &op.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut OpCommon {
        match self {
            Op::Create(op) => &mut op.common,
            Op::Rm(op) => &mut op.common,
            Op::Rename(op) => &mut op.common,
            Op::Sync(op) => &mut op.common,
            Op::SetAttr(op) => &mut op.common,
            Op::Resolution(op) => &mut op.common,
            Op::Rekey(op) => &mut op.common,
            Op::Gc(op) => &mut op.common,
        }
    }

    pub(crate) fn primary_slots(&self) -> Vec<&BlockUpdate> {
        match self {
            Op::Create(op) => vec![&op.dir],
            Op::Rm(op) => vec![&op.dir],
            Op::Rename(op) => vec![&op.old_dir, &op.new_dir],
            Op::Sync(op) => vec![&op.file],
            Op::SetAttr(op) => vec![&op.dir],
            Op::Resolution(_) | Op::Rekey(_) | Op::Gc(_) => Vec::new(),
        }
    }

    fn primary_slots_mut(&mut self) -> Vec<&mut BlockUpdate> {
        match self {
            Op::Create(op) => vec![&mut op.dir],
            Op::Rm(op) => vec![&mut op.dir],
            Op::Rename(op) => vec![&mut op.old_dir, &mut op.new_dir],
            Op::Sync(op) => vec![&mut op.file],
            Op::SetAttr(op) => vec![&mut op.dir],
            Op::Resolution(_) | Op::Rekey(_) | Op::Gc(_) => Vec::new(),
        }
    }

    /// Record that the block at `old` was rewritten as `new`. Folds into a
    /// matching primary slot, else appends to the generic update list.
    pub fn add_update(&mut self, old: BlockPointer, new: BlockPointer) {
        for slot in self.primary_slots_mut() {
            if slot.is_set() && slot.unref == old {
                slot.new_ref = new;
                return;
            }
        }
        self.common_mut().updates.push(BlockUpdate {
            unref: old,
            new_ref: new,
        });
    }

    /// Record a pointer newly brought into existence by this op.
    pub fn add_ref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().ref_blocks.push(ptr);
    }

    /// Record a pointer freed by this op.
    pub fn add_unref_block(&mut self, ptr: BlockPointer) {
        self.common_mut().unref_blocks.push(ptr);
    }

    /// Every update this op carries: set primary slots first, then the
    /// generic list.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut out: Vec<BlockUpdate> = self
            .primary_slots()
            .into_iter()
            .filter(|u| u.is_set())
            .cloned()
            .collect();
        out.extend(self.common().updates.iter().cloned());
        out
    }

    pub fn set_writer(&mut self, writer: WriterInfo) {
        self.common_mut().writer = Some(writer);
    }

    pub fn set_final_path(&mut self, path: Vec<String>) {
        self.common_mut().final_path = path;
    }

    /// Ref and unref lists must never overlap within one op.
    pub fn check_valid(&self) -> bool {
        let c = self.common();
        !c.ref_blocks
            .iter()
            .any(|r| c.unref_blocks.iter().any(|u| u == r))
    }

    /// The logical inverse used for local-notification replay.
    ///
    /// create ↔ rm (the inverse create carries `File` so the pair
    /// round-trips), rename swaps ends, sync keeps its writes, set_attr
    /// keeps name and attr. Resolution, rekey and gc replay as themselves.
    pub fn invert(&self) -> Op {
        let mut inv = match self {
            Op::Create(op) => {
                let mut rm = RmOp::new(op.new_name.clone(), op.dir.most_recent().clone());
                rm.removed_dir = op.entry_type.is_dir();
                Op::Rm(rm)
            }
            Op::Rm(op) => Op::Create(CreateOp::new(
                op.old_name.clone(),
                op.dir.most_recent().clone(),
                EntryType::File,
            )),
            Op::Rename(op) => {
                let inv_old_dir = if op.new_dir.is_set() {
                    &op.new_dir
                } else {
                    &op.old_dir
                };
                Op::Rename(RenameOp::new(
                    op.new_name.clone(),
                    inv_old_dir.most_recent().clone(),
                    op.old_name.clone(),
                    op.old_dir.most_recent().clone(),
                    op.renamed.clone(),
                    op.renamed_type,
                ))
            }
            Op::Sync(op) => {
                let mut sync = SyncOp::new(op.file.most_recent().clone());
                sync.writes = op.writes.clone();
                Op::Sync(sync)
            }
            Op::SetAttr(op) => Op::SetAttr(SetAttrOp::new(
                op.name.clone(),
                op.dir.most_recent().clone(),
                op.attr,
                op.file.clone(),
            )),
            Op::Resolution(_) | Op::Rekey(_) | Op::Gc(_) => return self.clone(),
        };
        for u in self.all_updates() {
            if u.is_complete() {
                inv.add_update(u.new_ref, u.unref);
            }
        }
        inv
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Create(op) => write!(f, "create {} ({})", op.new_name, op.entry_type),
            Op::Rm(op) => write!(f, "rm {}", op.old_name),
            Op::Rename(op) => write!(f, "rename {} -> {}", op.old_name, op.new_name),
            Op::Sync(op) => {
                write!(f, "sync [")?;
                for (i, w) in op.writes.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{}", w)?;
                }
                write!(f, "]")
            }
            Op::SetAttr(op) => write!(f, "set_attr {} on {}", op.attr, op.name),
            Op::Resolution(_) => write!(f, "resolution"),
            Op::Rekey(_) => write!(f, "rekey"),
            Op::Gc(op) => write!(f, "gc through {}", op.latest_rev),
        }
    }
}

/// Fold one incoming write or truncate into a canonical range list.
///
/// The canonical form is sorted and minimal: overlapping or touching writes
/// merge; at most one truncate entry survives, always last. A truncate at
/// `T` clips dirty bytes at or past `T`; a later write past `T` reopens the
/// sparse tail and moves the truncate point to the write's end.
pub fn coalesce_writes(existing: &[WriteRange], incoming: &WriteRange) -> Vec<WriteRange> {
    if incoming.is_truncate() {
        let t = incoming.off;
        let mut out = Vec::with_capacity(existing.len() + 1);
        for w in existing {
            if w.is_truncate() || w.off >= t {
                continue;
            }
            if w.end() > t {
                out.push(WriteRange::write(w.off, t - w.off));
            } else {
                out.push(w.clone());
            }
        }
        out.push(WriteRange::truncate(t));
        return out;
    }

    let mut merged = WriteRange::write(incoming.off, incoming.len);
    let mut truncate_at: Option<u64> = None;
    let mut out = Vec::with_capacity(existing.len() + 1);
    for w in existing {
        if w.is_truncate() {
            truncate_at = Some(w.off);
            continue;
        }
        if w.end() >= merged.off && merged.end() >= w.off {
            let off = w.off.min(merged.off);
            let end = w.end().max(merged.end());
            merged = WriteRange::write(off, end - off);
        } else {
            out.push(w.clone());
        }
    }
    let pos = out
        .iter()
        .position(|w| w.off > merged.off)
        .unwrap_or(out.len());
    out.insert(pos, merged.clone());
    if let Some(t) = truncate_at {
        out.push(WriteRange::truncate(t.max(merged.end())));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::{fake_block_id, fake_pointer};

    fn with_id(mut ptr: BlockPointer, n: u8) -> BlockPointer {
        ptr.id = fake_block_id(n);
        ptr
    }

    #[test]
    fn create_op_custom_update() {
        let old_dir = fake_pointer(1);
        let mut co = Op::Create(CreateOp::new("name", old_dir.clone(), EntryType::Exec));
        let new_dir = with_id(old_dir.clone(), 42);
        co.add_update(old_dir.clone(), new_dir.clone());
        assert!(co.common().updates.is_empty());
        let Op::Create(inner) = &co else { unreachable!() };
        assert_eq!(inner.dir.unref, old_dir);
        assert_eq!(inner.dir.new_ref, new_dir);
    }

    #[test]
    fn rm_op_custom_update() {
        let old_dir = fake_pointer(1);
        let mut ro = Op::Rm(RmOp::new("name", old_dir.clone()));
        let new_dir = with_id(old_dir.clone(), 42);
        ro.add_update(old_dir.clone(), new_dir.clone());
        assert!(ro.common().updates.is_empty());
        let Op::Rm(inner) = &ro else { unreachable!() };
        assert_eq!(inner.dir.unref, old_dir);
        assert_eq!(inner.dir.new_ref, new_dir);
    }

    #[test]
    fn rename_op_custom_update_within_dir() {
        let old_dir = fake_pointer(1);
        let renamed = with_id(old_dir.clone(), 42);
        let mut ro = Op::Rename(RenameOp::new(
            "old name",
            old_dir.clone(),
            "new name",
            old_dir.clone(),
            renamed,
            EntryType::Exec,
        ));
        {
            let Op::Rename(inner) = &ro else { unreachable!() };
            assert_eq!(inner.old_dir, BlockUpdate::new(old_dir.clone()));
            assert_eq!(inner.new_dir, BlockUpdate::default());
        }

        let new_dir = with_id(old_dir.clone(), 43);
        ro.add_update(old_dir.clone(), new_dir.clone());
        assert!(ro.common().updates.is_empty());
        let Op::Rename(inner) = &ro else { unreachable!() };
        assert_eq!(inner.old_dir.unref, old_dir);
        assert_eq!(inner.old_dir.new_ref, new_dir);
        assert_eq!(inner.new_dir, BlockUpdate::default());
    }

    #[test]
    fn rename_op_custom_update_across_dirs() {
        let old_old_dir = fake_pointer(1);
        let old_new_dir = with_id(old_old_dir.clone(), 42);
        let renamed = with_id(old_old_dir.clone(), 43);
        let mut ro = Op::Rename(RenameOp::new(
            "old name",
            old_old_dir.clone(),
            "new name",
            old_new_dir.clone(),
            renamed,
            EntryType::Exec,
        ));

        let new_old_dir = with_id(old_old_dir.clone(), 44);
        ro.add_update(old_old_dir.clone(), new_old_dir.clone());
        assert!(ro.common().updates.is_empty());

        let new_new_dir = with_id(old_new_dir.clone(), 45);
        ro.add_update(old_new_dir.clone(), new_new_dir.clone());
        assert!(ro.common().updates.is_empty());

        let Op::Rename(inner) = &ro else { unreachable!() };
        assert_eq!(inner.old_dir.unref, old_old_dir);
        assert_eq!(inner.old_dir.new_ref, new_old_dir);
        assert_eq!(inner.new_dir.unref, old_new_dir);
        assert_eq!(inner.new_dir.new_ref, new_new_dir);
    }

    #[test]
    fn sync_op_custom_update() {
        let old_file = fake_pointer(1);
        let mut so = Op::Sync(SyncOp::new(old_file.clone()));
        let new_file = with_id(old_file.clone(), 42);
        so.add_update(old_file.clone(), new_file.clone());
        assert!(so.common().updates.is_empty());
        let Op::Sync(inner) = &so else { unreachable!() };
        assert_eq!(inner.file.unref, old_file);
        assert_eq!(inner.file.new_ref, new_file);
    }

    #[test]
    fn set_attr_op_custom_update() {
        let old_dir = fake_pointer(1);
        let file = with_id(old_dir.clone(), 42);
        let mut sao = Op::SetAttr(SetAttrOp::new("name", old_dir.clone(), AttrKind::Mtime, file));
        let new_dir = with_id(old_dir.clone(), 43);
        sao.add_update(old_dir.clone(), new_dir.clone());
        assert!(sao.common().updates.is_empty());
        let Op::SetAttr(inner) = &sao else { unreachable!() };
        assert_eq!(inner.dir.unref, old_dir);
        assert_eq!(inner.dir.new_ref, new_dir);
    }

    #[test]
    fn non_primary_update_appends() {
        let old_dir = fake_pointer(1);
        let mut co = Op::Create(CreateOp::new("name", old_dir, EntryType::File));
        let other_old = fake_pointer(7);
        let other_new = fake_pointer(8);
        co.add_update(other_old.clone(), other_new.clone());
        assert_eq!(
            co.common().updates,
            vec![BlockUpdate {
                unref: other_old,
                new_ref: other_new
            }]
        );
    }

    #[test]
    fn op_inversion() {
        let old_ptr1 = fake_pointer(42);
        let new_ptr1 = fake_pointer(82);
        let old_ptr2 = fake_pointer(43);
        let new_ptr2 = fake_pointer(83);
        let file_ptr = fake_pointer(44);

        // create <-> rm
        let mut cop = Op::Create(CreateOp::new("test1", old_ptr1.clone(), EntryType::File));
        cop.add_update(old_ptr1.clone(), new_ptr1.clone());
        cop.add_update(old_ptr2.clone(), new_ptr2.clone());
        let mut expected = Op::Rm(RmOp::new("test1", new_ptr1.clone()));
        expected.add_update(new_ptr1.clone(), old_ptr1.clone());
        expected.add_update(new_ptr2.clone(), old_ptr2.clone());
        let iop1 = cop.invert();
        assert_eq!(iop1, expected);
        // converts back because the inversion picks File as the type
        assert_eq!(iop1.invert(), cop);

        // rename across dirs
        let mut rop = Op::Rename(RenameOp::new(
            "old",
            old_ptr1.clone(),
            "new",
            old_ptr2.clone(),
            file_ptr.clone(),
            EntryType::File,
        ));
        rop.add_update(old_ptr1.clone(), new_ptr1.clone());
        rop.add_update(old_ptr2.clone(), new_ptr2.clone());
        let mut expected3 = Op::Rename(RenameOp::new(
            "new",
            new_ptr2.clone(),
            "old",
            new_ptr1.clone(),
            file_ptr.clone(),
            EntryType::File,
        ));
        expected3.add_update(new_ptr1.clone(), old_ptr1.clone());
        expected3.add_update(new_ptr2.clone(), old_ptr2.clone());
        assert_eq!(rop.invert(), expected3);
        assert_eq!(rop.invert().invert(), rop);

        // sync keeps its writes
        let mut sop = Op::Sync(SyncOp::new(old_ptr1.clone()));
        sop.add_update(old_ptr1.clone(), new_ptr1.clone());
        {
            let Op::Sync(inner) = &mut sop else { unreachable!() };
            inner.add_write(2, 3);
            inner.add_truncate(100);
            inner.add_write(10, 12);
        }
        let isop = sop.invert();
        let Op::Sync(isync) = &isop else { unreachable!() };
        assert_eq!(isync.file.unref, new_ptr1);
        assert_eq!(isync.file.new_ref, old_ptr1);
        let Op::Sync(orig_sync) = &sop else { unreachable!() };
        assert_eq!(isync.writes, orig_sync.writes);

        // set_attr keeps name and attr
        let mut saop = Op::SetAttr(SetAttrOp::new(
            "name",
            old_ptr1.clone(),
            AttrKind::Mtime,
            file_ptr.clone(),
        ));
        saop.add_update(old_ptr1.clone(), new_ptr1.clone());
        let mut expected5 = Op::SetAttr(SetAttrOp::new(
            "name",
            new_ptr1.clone(),
            AttrKind::Mtime,
            file_ptr,
        ));
        expected5.add_update(new_ptr1, old_ptr1);
        assert_eq!(saop.invert(), expected5);
        assert_eq!(saop.invert().invert(), saop);
    }

    #[test]
    fn same_dir_rename_inverts_to_same_dir() {
        let old_dir = fake_pointer(1);
        let new_dir = with_id(old_dir.clone(), 2);
        let renamed = fake_pointer(3);
        let mut rop = Op::Rename(RenameOp::new(
            "a",
            old_dir.clone(),
            "b",
            old_dir.clone(),
            renamed,
            EntryType::File,
        ));
        rop.add_update(old_dir.clone(), new_dir.clone());
        let inv = rop.invert();
        let Op::Rename(inner) = &inv else { unreachable!() };
        assert_eq!(inner.old_name, "b");
        assert_eq!(inner.new_name, "a");
        assert_eq!(inner.old_dir.unref, new_dir);
        assert_eq!(inner.old_dir.new_ref, old_dir);
        assert_eq!(inner.new_dir, BlockUpdate::default());
    }

    #[test]
    fn coalesce_writes_merges_overlaps() {
        let existing = vec![
            WriteRange::write(7, 5),
            WriteRange::write(18, 10),
            WriteRange::write(98, 10),
        ];
        let out = coalesce_writes(&existing, &WriteRange::write(5, 100));
        assert_eq!(out, vec![WriteRange::write(5, 103)]);
    }

    #[test]
    fn coalesce_writes_with_old_truncate() {
        let existing = vec![
            WriteRange::write(7, 5),
            WriteRange::write(18, 10),
            WriteRange::truncate(98),
        ];
        let out = coalesce_writes(&existing, &WriteRange::write(5, 100));
        assert_eq!(
            out,
            vec![WriteRange::write(5, 100), WriteRange::truncate(105)]
        );
    }

    #[test]
    fn coalesce_truncate_clips_writes() {
        let existing = vec![WriteRange::write(5, 10), WriteRange::write(20, 10)];
        let out = coalesce_writes(&existing, &WriteRange::truncate(8));
        assert_eq!(out, vec![WriteRange::write(5, 3), WriteRange::truncate(8)]);
    }

    #[test]
    fn collapse_is_idempotent() {
        let mut so = SyncOp::default();
        so.add_write(2, 3);
        so.add_truncate(50);
        so.add_write(10, 12);
        let once = so.collapse_write_range(Vec::new());
        let twice = so.collapse_write_range(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn collapse_write_range_matches_byte_oracle() {
        use rand::Rng;
        const FILE_SIZE: u64 = 1000;
        const NUM_WRITES: usize = 25;
        const MAX_WRITE_SIZE: u64 = 50;
        let mut rng = rand::rng();

        for _ in 0..200 {
            // a "file" where dirty bytes are trues
            let mut file = [false; FILE_SIZE as usize];
            let mut last_byte = 0u64;
            let mut last_byte_is_truncate = false;
            let mut sync_ops: Vec<SyncOp> = Vec::new();

            for _ in 0..NUM_WRITES {
                if sync_ops.is_empty() || rng.random_range(0..5) == 0 {
                    sync_ops.push(SyncOp::default());
                }
                let op = sync_ops.last_mut().unwrap();
                let off = rng.random_range(0..FILE_SIZE);
                if rng.random_range(0..5) > 0 {
                    let mut max_len = (FILE_SIZE - off).min(MAX_WRITE_SIZE);
                    max_len = max_len.saturating_sub(1).max(1);
                    let len = rng.random_range(0..max_len) + 1;
                    op.add_write(off, len);
                    for k in off..off + len {
                        file[k as usize] = true;
                    }
                    if last_byte < off + len {
                        last_byte = off + len;
                    }
                } else {
                    op.add_truncate(off);
                    for k in off..FILE_SIZE {
                        file[k as usize] = false;
                    }
                    last_byte = off;
                    last_byte_is_truncate = true;
                }
            }

            let mut computed = Vec::new();
            for op in &sync_ops {
                computed = op.collapse_write_range(computed);
            }

            let mut expected: Vec<WriteRange> = Vec::new();
            let mut in_write = false;
            for j in 0..last_byte {
                if !in_write && file[j as usize] {
                    in_write = true;
                    expected.push(WriteRange::write(j, 0));
                } else if in_write && !file[j as usize] {
                    in_write = false;
                    let last = expected.last_mut().unwrap();
                    last.len = j - last.off;
                }
            }
            if in_write {
                let last = expected.last_mut().unwrap();
                last.len = last_byte - last.off;
            }
            if last_byte_is_truncate {
                expected.push(WriteRange::truncate(last_byte));
            }

            assert_eq!(
                computed.len(),
                expected.len(),
                "range lengths differ: {:?} vs {:?}",
                computed,
                expected
            );
            for (c, e) in computed.iter().zip(expected.iter()) {
                assert_eq!((c.off, c.len), (e.off, e.len));
            }
        }
    }

    #[test]
    fn op_display() {
        let op = Op::Create(CreateOp::new("a", fake_pointer(1), EntryType::Dir));
        assert_eq!(op.to_string(), "create a (dir)");
        let mut so = SyncOp::new(fake_pointer(2));
        so.add_write(0, 4);
        so.add_truncate(9);
        assert_eq!(Op::Sync(so).to_string(), "sync [0+4 trunc@9]");
    }

    #[test]
    fn check_valid_rejects_overlap() {
        let mut op = Op::Create(CreateOp::new("a", fake_pointer(1), EntryType::File));
        op.add_ref_block(fake_pointer(9));
        assert!(op.check_valid());
        op.add_unref_block(fake_pointer(9));
        assert!(!op.check_valid());
    }
}
