//! Core domain types, in dependency order:
//! - time: wall clocks and conflict-date formatting
//! - identity: folders, writers, devices, branches
//! - block: content-addressed blocks and pointers
//! - ops: the typed operation log
//! - wire: the canonical CBOR envelope
//! - revision: signed hash-chained metadata

pub mod block;
pub mod identity;
pub mod ops;
pub mod revision;
pub mod time;
pub mod wire;

pub use block::{
    content_hash, Block, BlockCommon, BlockContext, BlockId, BlockPointer, BlockType, ContentHash,
    DirBlock, DirEntry, EntryType, FileBlock, IndirectFilePtr, RefNonce,
};
pub use identity::{
    Branch, BranchId, DataVer, DeviceName, InvalidId, KeyGen, TlfHandle, TlfId, WriterInfo,
    WriterName,
};
pub use ops::{
    coalesce_writes, AttrKind, BlockUpdate, CreateOp, GcOp, Op, OpCommon, RekeyOp, RenameOp,
    ResolutionOp, RmOp, SetAttrOp, SyncOp, WriteRange,
};
pub use revision::{Revision, RevisionHash, RevisionNumber, Signature};
pub use time::{format_conflict_date, system_clock, Clock, FixedClock, SystemClock};
pub use wire::{
    decode_block, decode_op, decode_revision, encode_block, encode_op, encode_revision,
    DecodeError, EncodeError, UnknownFields,
};
