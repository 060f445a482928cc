//! Canonical CBOR envelope for ops, blocks, and revisions.
//!
//! Every struct encodes as a definite-length map whose text keys are emitted
//! in lexicographic order, so equal values always produce identical bytes
//! (revisions are signed over this encoding). Unknown keys survive decoding
//! in an [`UnknownFields`] slot and are re-emitted verbatim, merged back
//! into the sorted key sequence. The decoder accepts canonical input only:
//! definite lengths, strictly increasing keys, no trailing bytes.

use std::collections::BTreeMap;

use bytes::Bytes;
use minicbor::data::Type;
use minicbor::{Decoder, Encoder};
use thiserror::Error;

use super::block::{
    Block, BlockId, BlockPointer, BlockType, DirBlock, DirEntry, EntryType, FileBlock,
    IndirectFilePtr, RefNonce,
};
use super::identity::{Branch, BranchId, DataVer, DeviceName, KeyGen, WriterInfo, WriterName};
use super::ops::{
    AttrKind, BlockUpdate, CreateOp, GcOp, Op, OpCommon, RekeyOp, RenameOp, ResolutionOp, RmOp,
    SetAttrOp, SyncOp, WriteRange,
};
use super::revision::{Revision, RevisionHash, RevisionNumber, Signature};
use crate::config::Limits;

/// Op kind discriminants; a closed set.
pub const CREATE_OP_CODE: u32 = 1;
pub const RM_OP_CODE: u32 = 2;
pub const RENAME_OP_CODE: u32 = 3;
pub const SYNC_OP_CODE: u32 = 4;
pub const SET_ATTR_OP_CODE: u32 = 5;
pub const RESOLUTION_OP_CODE: u32 = 6;
pub const REKEY_OP_CODE: u32 = 7;
pub const GC_OP_CODE: u32 = 8;

const FILE_BLOCK_CODE: u32 = 1;
const DIR_BLOCK_CODE: u32 = 2;

/// Raw CBOR values for map keys this decoder did not recognize.
///
/// Populated by the decoder, re-emitted verbatim by the encoder.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct UnknownFields(BTreeMap<String, Bytes>);

impl UnknownFields {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn insert(&mut self, key: String, raw: Bytes) {
        self.0.insert(key, raw);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Bytes)> {
        self.0.iter()
    }
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("cbor encode: {0}")]
    Cbor(#[from] minicbor::encode::Error<std::convert::Infallible>),
    #[error("ops batch of {ops} exceeds max {max}")]
    TooManyOps { ops: usize, max: usize },
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode limit exceeded: {0}")]
    DecodeLimit(&'static str),
    #[error("indefinite-length CBOR not allowed")]
    IndefiniteLength,
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },
    #[error("unsupported op code: {0}")]
    UnsupportedOpCode(u32),
    #[error("unsupported block code: {0}")]
    UnsupportedBlockCode(u32),
    #[error("map keys out of canonical order at {0:?}")]
    NonCanonicalKeyOrder(String),
    #[error("trailing bytes after value")]
    TrailingBytes,
    #[error("cbor decode: {0}")]
    Cbor(#[from] minicbor::decode::Error),
}

// ---- encoding ----

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).str(s)?;
    Ok(())
}

fn put_u32(out: &mut Vec<u8>, v: u32) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).u32(v)?;
    Ok(())
}

fn put_u64(out: &mut Vec<u8>, v: u64) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).u64(v)?;
    Ok(())
}

fn put_bool(out: &mut Vec<u8>, v: bool) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).bool(v)?;
    Ok(())
}

fn put_raw_bytes(out: &mut Vec<u8>, v: &[u8]) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).bytes(v)?;
    Ok(())
}

fn put_array_header(out: &mut Vec<u8>, len: u64) -> Result<(), EncodeError> {
    Encoder::new(&mut *out).array(len)?;
    Ok(())
}

/// Assembles one canonical map: known fields plus preserved unknowns, keys
/// sorted, then emitted with a definite length.
struct MapBuilder {
    entries: Vec<(String, Vec<u8>)>,
}

impl MapBuilder {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn field<F>(&mut self, key: &str, f: F) -> Result<(), EncodeError>
    where
        F: FnOnce(&mut Vec<u8>) -> Result<(), EncodeError>,
    {
        let mut buf = Vec::new();
        f(&mut buf)?;
        self.entries.push((key.to_string(), buf));
        Ok(())
    }

    /// Unknown keys never shadow known ones.
    fn unknown(&mut self, unknown: &UnknownFields) {
        for (k, v) in unknown.iter() {
            if !self.entries.iter().any(|(ek, _)| ek == k) {
                self.entries.push((k.clone(), v.to_vec()));
            }
        }
    }

    fn finish_into(mut self, out: &mut Vec<u8>) -> Result<(), EncodeError> {
        self.entries.sort_by(|a, b| a.0.cmp(&b.0));
        debug_assert!(
            self.entries.windows(2).all(|w| w[0].0 < w[1].0),
            "duplicate canonical map key"
        );
        Encoder::new(&mut *out).map(self.entries.len() as u64)?;
        for (k, v) in &self.entries {
            put_str(out, k)?;
            out.extend_from_slice(v);
        }
        Ok(())
    }
}

fn put_pointer(out: &mut Vec<u8>, ptr: &BlockPointer) -> Result<(), EncodeError> {
    let ctx = &ptr.context;
    let mut mb = MapBuilder::new();
    if ctx.block_type != BlockType::Data {
        mb.field("bt", |o| put_u32(o, 1))?;
    }
    if let Some(creator) = &ctx.creator {
        mb.field("cr", |o| put_str(o, creator.as_str()))?;
    }
    if ptr.data_ver.0 != 0 {
        mb.field("dv", |o| put_u32(o, ptr.data_ver.0))?;
    }
    mb.field("id", |o| put_raw_bytes(o, ptr.id.as_bytes()))?;
    if ptr.key_gen.0 != 0 {
        mb.field("kg", |o| put_u32(o, ptr.key_gen.0))?;
    }
    if !ctx.ref_nonce.is_zero() {
        mb.field("rn", |o| put_raw_bytes(o, &ctx.ref_nonce.0))?;
    }
    if let Some(writer) = &ctx.writer {
        mb.field("wr", |o| put_str(o, writer.as_str()))?;
    }
    mb.finish_into(out)
}

fn put_pointer_array(out: &mut Vec<u8>, ptrs: &[BlockPointer]) -> Result<(), EncodeError> {
    put_array_header(out, ptrs.len() as u64)?;
    for ptr in ptrs {
        put_pointer(out, ptr)?;
    }
    Ok(())
}

fn put_update(out: &mut Vec<u8>, update: &BlockUpdate) -> Result<(), EncodeError> {
    let mut mb = MapBuilder::new();
    if update.new_ref.is_initialized() {
        mb.field("r", |o| put_pointer(o, &update.new_ref))?;
    }
    if update.unref.is_initialized() {
        mb.field("u", |o| put_pointer(o, &update.unref))?;
    }
    mb.finish_into(out)
}

fn put_update_array(out: &mut Vec<u8>, updates: &[BlockUpdate]) -> Result<(), EncodeError> {
    put_array_header(out, updates.len() as u64)?;
    for u in updates {
        put_update(out, u)?;
    }
    Ok(())
}

fn put_write_range(out: &mut Vec<u8>, w: &WriteRange) -> Result<(), EncodeError> {
    let mut mb = MapBuilder::new();
    if w.len != 0 {
        mb.field("l", |o| put_u64(o, w.len))?;
    }
    if w.off != 0 {
        mb.field("o", |o| put_u64(o, w.off))?;
    }
    mb.unknown(&w.unknown);
    mb.finish_into(out)
}

fn put_writer_info(out: &mut Vec<u8>, wi: &WriterInfo) -> Result<(), EncodeError> {
    let mut mb = MapBuilder::new();
    mb.field("d", |o| put_str(o, wi.device.as_str()))?;
    mb.field("t", |o| put_u64(o, wi.local_time_ms))?;
    mb.field("w", |o| put_str(o, wi.writer.as_str()))?;
    mb.finish_into(out)
}

fn put_dir_entry(out: &mut Vec<u8>, entry: &DirEntry) -> Result<(), EncodeError> {
    let mut mb = MapBuilder::new();
    mb.field("et", |o| put_u32(o, u32::from(entry.entry_type.code())))?;
    if entry.mtime_ms != 0 {
        mb.field("mt", |o| put_u64(o, entry.mtime_ms))?;
    }
    mb.field("p", |o| put_pointer(o, &entry.ptr))?;
    if let Some(sym) = &entry.sym_path {
        mb.field("sp", |o| put_str(o, sym))?;
    }
    if entry.size != 0 {
        mb.field("sz", |o| put_u64(o, entry.size))?;
    }
    mb.unknown(&entry.unknown);
    mb.finish_into(out)
}

fn op_code(op: &Op) -> u32 {
    match op {
        Op::Create(_) => CREATE_OP_CODE,
        Op::Rm(_) => RM_OP_CODE,
        Op::Rename(_) => RENAME_OP_CODE,
        Op::Sync(_) => SYNC_OP_CODE,
        Op::SetAttr(_) => SET_ATTR_OP_CODE,
        Op::Resolution(_) => RESOLUTION_OP_CODE,
        Op::Rekey(_) => REKEY_OP_CODE,
        Op::Gc(_) => GC_OP_CODE,
    }
}

fn put_op_common(mb: &mut MapBuilder, common: &OpCommon) -> Result<(), EncodeError> {
    if !common.ref_blocks.is_empty() {
        mb.field("rb", |o| put_pointer_array(o, &common.ref_blocks))?;
    }
    if !common.unref_blocks.is_empty() {
        mb.field("ub", |o| put_pointer_array(o, &common.unref_blocks))?;
    }
    if !common.updates.is_empty() {
        mb.field("up", |o| put_update_array(o, &common.updates))?;
    }
    Ok(())
}

fn put_op(out: &mut Vec<u8>, op: &Op) -> Result<(), EncodeError> {
    put_array_header(out, 2)?;
    put_u32(out, op_code(op))?;

    let mut mb = MapBuilder::new();
    put_op_common(&mut mb, op.common())?;
    match op {
        Op::Create(inner) => {
            if inner.dir != BlockUpdate::default() {
                mb.field("dd", |o| put_update(o, &inner.dir))?;
            }
            mb.field("et", |o| put_u32(o, u32::from(inner.entry_type.code())))?;
            mb.field("nm", |o| put_str(o, &inner.new_name))?;
            if let Some(sym) = &inner.sym_path {
                mb.field("sp", |o| put_str(o, sym))?;
            }
        }
        Op::Rm(inner) => {
            if inner.dir != BlockUpdate::default() {
                mb.field("dd", |o| put_update(o, &inner.dir))?;
            }
            mb.field("nm", |o| put_str(o, &inner.old_name))?;
            if inner.removed_dir {
                mb.field("rd", |o| put_bool(o, true))?;
            }
        }
        Op::Rename(inner) => {
            if inner.new_dir != BlockUpdate::default() {
                mb.field("nd", |o| put_update(o, &inner.new_dir))?;
            }
            mb.field("nn", |o| put_str(o, &inner.new_name))?;
            if inner.old_dir != BlockUpdate::default() {
                mb.field("od", |o| put_update(o, &inner.old_dir))?;
            }
            mb.field("on", |o| put_str(o, &inner.old_name))?;
            mb.field("rp", |o| put_pointer(o, &inner.renamed))?;
            mb.field("rt", |o| put_u32(o, u32::from(inner.renamed_type.code())))?;
        }
        Op::Sync(inner) => {
            if inner.file != BlockUpdate::default() {
                mb.field("ff", |o| put_update(o, &inner.file))?;
            }
            if !inner.writes.is_empty() {
                mb.field("w", |o| {
                    put_array_header(o, inner.writes.len() as u64)?;
                    for w in &inner.writes {
                        put_write_range(o, w)?;
                    }
                    Ok(())
                })?;
            }
        }
        Op::SetAttr(inner) => {
            mb.field("at", |o| put_u32(o, u32::from(inner.attr.code())))?;
            if inner.dir != BlockUpdate::default() {
                mb.field("dd", |o| put_update(o, &inner.dir))?;
            }
            mb.field("fp", |o| put_pointer(o, &inner.file))?;
            mb.field("nm", |o| put_str(o, &inner.name))?;
        }
        Op::Resolution(_) | Op::Rekey(_) => {}
        Op::Gc(inner) => {
            mb.field("lr", |o| put_u64(o, inner.latest_rev.get()))?;
        }
    }
    mb.unknown(&op.common().unknown);
    mb.finish_into(out)
}

/// Canonical encoding of one op.
pub fn encode_op(op: &Op) -> Result<Bytes, EncodeError> {
    let mut out = Vec::new();
    put_op(&mut out, op)?;
    Ok(Bytes::from(out))
}

fn put_block(out: &mut Vec<u8>, block: &Block) -> Result<(), EncodeError> {
    put_array_header(out, 2)?;
    match block {
        Block::File(fb) => {
            put_u32(out, FILE_BLOCK_CODE)?;
            let mut mb = MapBuilder::new();
            if !fb.contents.is_empty() {
                mb.field("c", |o| put_raw_bytes(o, &fb.contents))?;
            }
            if !fb.children.is_empty() {
                mb.field("i", |o| {
                    put_array_header(o, fb.children.len() as u64)?;
                    for child in &fb.children {
                        let mut cb = MapBuilder::new();
                        if child.off != 0 {
                            cb.field("o", |co| put_u64(co, child.off))?;
                        }
                        cb.field("p", |co| put_pointer(co, &child.ptr))?;
                        cb.finish_into(o)?;
                    }
                    Ok(())
                })?;
            }
            if fb.common.is_indirect {
                mb.field("ind", |o| put_bool(o, true))?;
            }
            mb.unknown(&fb.common.unknown);
            mb.finish_into(out)
        }
        Block::Dir(db) => {
            put_u32(out, DIR_BLOCK_CODE)?;
            let mut mb = MapBuilder::new();
            if !db.children.is_empty() {
                mb.field("ch", |o| {
                    Encoder::new(&mut *o).map(db.children.len() as u64)?;
                    for (name, entry) in &db.children {
                        put_str(o, name)?;
                        put_dir_entry(o, entry)?;
                    }
                    Ok(())
                })?;
            }
            if db.common.is_indirect {
                mb.field("ind", |o| put_bool(o, true))?;
            }
            mb.unknown(&db.common.unknown);
            mb.finish_into(out)
        }
    }
}

/// Canonical encoding of one block. The caller stamps the returned length
/// into the block's `encoded_size` once the ciphertext is final.
pub fn encode_block(block: &Block) -> Result<Bytes, EncodeError> {
    let mut out = Vec::new();
    put_block(&mut out, block)?;
    Ok(Bytes::from(out))
}

/// Canonical encoding of a revision; `include_sig` selects the full image or
/// the signable prefix form.
pub fn encode_revision(
    rev: &Revision,
    limits: &Limits,
    include_sig: bool,
) -> Result<Bytes, EncodeError> {
    if rev.ops.len() > limits.max_ops_per_revision {
        return Err(EncodeError::TooManyOps {
            ops: rev.ops.len(),
            max: limits.max_ops_per_revision,
        });
    }
    let mut mb = MapBuilder::new();
    if let Branch::Unmerged(id) = rev.branch {
        mb.field("br", |o| put_raw_bytes(o, id.as_bytes()))?;
    }
    mb.field("op", |o| {
        put_array_header(o, rev.ops.len() as u64)?;
        for op in &rev.ops {
            put_op(o, op)?;
        }
        Ok(())
    })?;
    if let Some(prev) = &rev.prev {
        mb.field("pr", |o| put_raw_bytes(o, &prev.0))?;
    }
    mb.field("rt", |o| put_pointer(o, &rev.new_root))?;
    mb.field("rv", |o| put_u64(o, rev.revision.get()))?;
    if include_sig {
        if let Some(sig) = &rev.signature {
            mb.field("sg", |o| put_raw_bytes(o, &sig.0))?;
        }
    }
    mb.field("wi", |o| put_writer_info(o, &rev.writer))?;
    mb.unknown(&rev.unknown);
    let mut out = Vec::new();
    mb.finish_into(&mut out)?;
    Ok(Bytes::from(out))
}

// ---- decoding ----

fn decode_text<'b>(dec: &mut Decoder<'b>, limits: &Limits) -> Result<&'b str, DecodeError> {
    if dec.datatype()? == Type::StringIndef {
        return Err(DecodeError::IndefiniteLength);
    }
    let s = dec.str()?;
    if s.len() > limits.max_cbor_text_len {
        return Err(DecodeError::DecodeLimit("max_cbor_text_len"));
    }
    Ok(s)
}

fn decode_byte_slice<'b>(dec: &mut Decoder<'b>, limits: &Limits) -> Result<&'b [u8], DecodeError> {
    if dec.datatype()? == Type::BytesIndef {
        return Err(DecodeError::IndefiniteLength);
    }
    let b = dec.bytes()?;
    if b.len() > limits.max_cbor_bytes_len {
        return Err(DecodeError::DecodeLimit("max_cbor_bytes_len"));
    }
    Ok(b)
}

fn decode_fixed_bytes<const N: usize>(
    dec: &mut Decoder<'_>,
    limits: &Limits,
    field: &'static str,
) -> Result<[u8; N], DecodeError> {
    let b = decode_byte_slice(dec, limits)?;
    if b.len() != N {
        return Err(DecodeError::InvalidField {
            field,
            reason: format!("expected {} bytes, got {}", N, b.len()),
        });
    }
    let mut out = [0u8; N];
    out.copy_from_slice(b);
    Ok(out)
}

fn decode_array_len(dec: &mut Decoder<'_>, limits: &Limits) -> Result<u64, DecodeError> {
    let Some(n) = dec.array()? else {
        return Err(DecodeError::IndefiniteLength);
    };
    if n > limits.max_cbor_array_entries as u64 {
        return Err(DecodeError::DecodeLimit("max_cbor_array_entries"));
    }
    Ok(n)
}

/// Walks one canonical map: definite length, strictly increasing keys.
struct MapReader<'b> {
    remaining: u64,
    last_key: Option<&'b str>,
}

impl<'b> MapReader<'b> {
    fn begin(dec: &mut Decoder<'b>, limits: &Limits) -> Result<Self, DecodeError> {
        let Some(n) = dec.map()? else {
            return Err(DecodeError::IndefiniteLength);
        };
        if n > limits.max_cbor_map_entries as u64 {
            return Err(DecodeError::DecodeLimit("max_cbor_map_entries"));
        }
        Ok(Self {
            remaining: n,
            last_key: None,
        })
    }

    fn next_key(
        &mut self,
        dec: &mut Decoder<'b>,
        limits: &Limits,
    ) -> Result<Option<&'b str>, DecodeError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let key = decode_text(dec, limits)?;
        if let Some(prev) = self.last_key {
            if key <= prev {
                return Err(DecodeError::NonCanonicalKeyOrder(key.to_string()));
            }
        }
        self.last_key = Some(key);
        Ok(Some(key))
    }
}

fn skip_value(dec: &mut Decoder<'_>, limits: &Limits, depth: usize) -> Result<(), DecodeError> {
    if depth > limits.max_cbor_depth {
        return Err(DecodeError::DecodeLimit("max_cbor_depth"));
    }
    let ty = dec.datatype()?;
    match ty {
        Type::Bool => {
            let _ = dec.bool()?;
        }
        Type::Null => {
            dec.null()?;
        }
        Type::Undefined => {
            dec.undefined()?;
        }
        Type::U8 | Type::U16 | Type::U32 | Type::U64 => {
            let _ = dec.u64()?;
        }
        Type::I8 | Type::I16 | Type::I32 | Type::I64 | Type::Int => {
            let _ = dec.i64()?;
        }
        Type::F16 | Type::F32 | Type::F64 => {
            let _ = dec.f64()?;
        }
        Type::Simple => {
            let _ = dec.simple()?;
        }
        Type::Bytes => {
            let _ = decode_byte_slice(dec, limits)?;
        }
        Type::String => {
            let _ = decode_text(dec, limits)?;
        }
        Type::BytesIndef | Type::StringIndef | Type::ArrayIndef | Type::MapIndef | Type::Break => {
            return Err(DecodeError::IndefiniteLength);
        }
        Type::Array => {
            let n = decode_array_len(dec, limits)?;
            for _ in 0..n {
                skip_value(dec, limits, depth + 1)?;
            }
        }
        Type::Map => {
            let Some(n) = dec.map()? else {
                return Err(DecodeError::IndefiniteLength);
            };
            if n > limits.max_cbor_map_entries as u64 {
                return Err(DecodeError::DecodeLimit("max_cbor_map_entries"));
            }
            for _ in 0..n {
                skip_value(dec, limits, depth + 1)?;
                skip_value(dec, limits, depth + 1)?;
            }
        }
        Type::Tag => {
            return Err(DecodeError::InvalidField {
                field: "value",
                reason: "tags not allowed".into(),
            });
        }
        Type::Unknown(_) => {
            return Err(minicbor::decode::Error::message(format!("unknown cbor type {ty}")).into());
        }
    }
    Ok(())
}

/// Skips one value and returns its raw byte image.
fn capture_value<'b>(
    input: &'b [u8],
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<&'b [u8], DecodeError> {
    let start = dec.position();
    skip_value(dec, limits, 0)?;
    Ok(&input[start..dec.position()])
}

fn read_writer_name(dec: &mut Decoder<'_>, limits: &Limits) -> Result<WriterName, DecodeError> {
    let raw = decode_text(dec, limits)?;
    WriterName::new(raw).map_err(|e| DecodeError::InvalidField {
        field: "writer",
        reason: e.to_string(),
    })
}

fn read_pointer(dec: &mut Decoder<'_>, limits: &Limits) -> Result<BlockPointer, DecodeError> {
    let mut ptr = BlockPointer::default();
    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match key {
            "bt" => {
                ptr.context.block_type = match dec.u32()? {
                    0 => BlockType::Data,
                    1 => BlockType::Archive,
                    other => {
                        return Err(DecodeError::InvalidField {
                            field: "bt",
                            reason: format!("unknown block type {}", other),
                        })
                    }
                };
            }
            "cr" => ptr.context.creator = Some(read_writer_name(dec, limits)?),
            "dv" => ptr.data_ver = DataVer(dec.u32()?),
            "id" => ptr.id = BlockId::new(decode_fixed_bytes::<32>(dec, limits, "id")?),
            "kg" => ptr.key_gen = KeyGen(dec.u32()?),
            "rn" => ptr.context.ref_nonce = RefNonce(decode_fixed_bytes::<8>(dec, limits, "rn")?),
            "wr" => ptr.context.writer = Some(read_writer_name(dec, limits)?),
            _ => skip_value(dec, limits, 0)?,
        }
    }
    Ok(ptr)
}

fn read_pointer_array(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<Vec<BlockPointer>, DecodeError> {
    let n = decode_array_len(dec, limits)?;
    let mut out = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        out.push(read_pointer(dec, limits)?);
    }
    Ok(out)
}

fn read_update(dec: &mut Decoder<'_>, limits: &Limits) -> Result<BlockUpdate, DecodeError> {
    let mut update = BlockUpdate::default();
    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match key {
            "r" => update.new_ref = read_pointer(dec, limits)?,
            "u" => update.unref = read_pointer(dec, limits)?,
            _ => skip_value(dec, limits, 0)?,
        }
    }
    Ok(update)
}

fn read_update_array(
    dec: &mut Decoder<'_>,
    limits: &Limits,
) -> Result<Vec<BlockUpdate>, DecodeError> {
    let n = decode_array_len(dec, limits)?;
    let mut out = Vec::with_capacity(n.min(1024) as usize);
    for _ in 0..n {
        out.push(read_update(dec, limits)?);
    }
    Ok(out)
}

fn read_write_range<'b>(
    input: &'b [u8],
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<WriteRange, DecodeError> {
    let mut w = WriteRange::default();
    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match key {
            "l" => w.len = dec.u64()?,
            "o" => w.off = dec.u64()?,
            _ => {
                let raw = capture_value(input, dec, limits)?;
                w.unknown.insert(key.to_string(), Bytes::copy_from_slice(raw));
            }
        }
    }
    Ok(w)
}

fn read_writer_info(dec: &mut Decoder<'_>, limits: &Limits) -> Result<WriterInfo, DecodeError> {
    let mut device = None;
    let mut time_ms = None;
    let mut writer = None;
    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match key {
            "d" => {
                let raw = decode_text(dec, limits)?;
                device = Some(DeviceName::new(raw).map_err(|e| DecodeError::InvalidField {
                    field: "d",
                    reason: e.to_string(),
                })?);
            }
            "t" => time_ms = Some(dec.u64()?),
            "w" => writer = Some(read_writer_name(dec, limits)?),
            _ => skip_value(dec, limits, 0)?,
        }
    }
    Ok(WriterInfo {
        writer: writer.ok_or(DecodeError::MissingField("w"))?,
        device: device.ok_or(DecodeError::MissingField("d"))?,
        local_time_ms: time_ms.ok_or(DecodeError::MissingField("t"))?,
    })
}

fn read_dir_entry<'b>(
    input: &'b [u8],
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<DirEntry, DecodeError> {
    let mut entry = DirEntry::new(BlockPointer::default(), EntryType::File);
    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match key {
            "et" => {
                let code = dec.u32()?;
                entry.entry_type = u8::try_from(code)
                    .ok()
                    .and_then(EntryType::from_code)
                    .ok_or_else(|| DecodeError::InvalidField {
                        field: "et",
                        reason: format!("unknown entry type {}", code),
                    })?;
            }
            "mt" => entry.mtime_ms = dec.u64()?,
            "p" => entry.ptr = read_pointer(dec, limits)?,
            "sp" => entry.sym_path = Some(decode_text(dec, limits)?.to_string()),
            "sz" => entry.size = dec.u64()?,
            _ => {
                let raw = capture_value(input, dec, limits)?;
                entry
                    .unknown
                    .insert(key.to_string(), Bytes::copy_from_slice(raw));
            }
        }
    }
    Ok(entry)
}

fn read_entry_type(dec: &mut Decoder<'_>, field: &'static str) -> Result<EntryType, DecodeError> {
    let code = dec.u32()?;
    u8::try_from(code)
        .ok()
        .and_then(EntryType::from_code)
        .ok_or_else(|| DecodeError::InvalidField {
            field,
            reason: format!("unknown entry type {}", code),
        })
}

fn read_op<'b>(
    input: &'b [u8],
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<Op, DecodeError> {
    let n = decode_array_len(dec, limits)?;
    if n != 2 {
        return Err(DecodeError::InvalidField {
            field: "op",
            reason: format!("envelope must have 2 elements, got {}", n),
        });
    }
    let code = dec.u32()?;
    match code {
        CREATE_OP_CODE
        | RM_OP_CODE
        | RENAME_OP_CODE
        | SYNC_OP_CODE
        | SET_ATTR_OP_CODE
        | RESOLUTION_OP_CODE
        | REKEY_OP_CODE
        | GC_OP_CODE => {}
        other => return Err(DecodeError::UnsupportedOpCode(other)),
    }

    let mut common = OpCommon::default();
    let mut name: Option<String> = None;
    let mut old_name: Option<String> = None;
    let mut new_name: Option<String> = None;
    let mut dir_update = BlockUpdate::default();
    let mut old_dir = BlockUpdate::default();
    let mut new_dir = BlockUpdate::default();
    let mut file_update = BlockUpdate::default();
    let mut entry_type: Option<EntryType> = None;
    let mut renamed_type: Option<EntryType> = None;
    let mut sym_path: Option<String> = None;
    let mut removed_dir = false;
    let mut renamed: Option<BlockPointer> = None;
    let mut writes: Vec<WriteRange> = Vec::new();
    let mut attr: Option<AttrKind> = None;
    let mut file_ptr: Option<BlockPointer> = None;
    let mut latest_rev: Option<RevisionNumber> = None;

    let mut mr = MapReader::begin(dec, limits)?;
    while let Some(key) = mr.next_key(dec, limits)? {
        match (code, key) {
            (_, "rb") => common.ref_blocks = read_pointer_array(dec, limits)?,
            (_, "ub") => common.unref_blocks = read_pointer_array(dec, limits)?,
            (_, "up") => common.updates = read_update_array(dec, limits)?,
            (CREATE_OP_CODE, "dd") | (RM_OP_CODE, "dd") | (SET_ATTR_OP_CODE, "dd") => {
                dir_update = read_update(dec, limits)?;
            }
            (CREATE_OP_CODE, "et") => entry_type = Some(read_entry_type(dec, "et")?),
            (CREATE_OP_CODE, "nm") => new_name = Some(decode_text(dec, limits)?.to_string()),
            (CREATE_OP_CODE, "sp") => sym_path = Some(decode_text(dec, limits)?.to_string()),
            (RM_OP_CODE, "nm") => old_name = Some(decode_text(dec, limits)?.to_string()),
            (RM_OP_CODE, "rd") => removed_dir = dec.bool()?,
            (RENAME_OP_CODE, "nd") => new_dir = read_update(dec, limits)?,
            (RENAME_OP_CODE, "nn") => new_name = Some(decode_text(dec, limits)?.to_string()),
            (RENAME_OP_CODE, "od") => old_dir = read_update(dec, limits)?,
            (RENAME_OP_CODE, "on") => old_name = Some(decode_text(dec, limits)?.to_string()),
            (RENAME_OP_CODE, "rp") => renamed = Some(read_pointer(dec, limits)?),
            (RENAME_OP_CODE, "rt") => renamed_type = Some(read_entry_type(dec, "rt")?),
            (SYNC_OP_CODE, "ff") => file_update = read_update(dec, limits)?,
            (SYNC_OP_CODE, "w") => {
                let n = decode_array_len(dec, limits)?;
                for _ in 0..n {
                    writes.push(read_write_range(input, dec, limits)?);
                }
            }
            (SET_ATTR_OP_CODE, "at") => {
                let raw = dec.u32()?;
                attr = Some(
                    u8::try_from(raw)
                        .ok()
                        .and_then(AttrKind::from_code)
                        .ok_or_else(|| DecodeError::InvalidField {
                            field: "at",
                            reason: format!("unknown attr kind {}", raw),
                        })?,
                );
            }
            (SET_ATTR_OP_CODE, "fp") => file_ptr = Some(read_pointer(dec, limits)?),
            (SET_ATTR_OP_CODE, "nm") => name = Some(decode_text(dec, limits)?.to_string()),
            (GC_OP_CODE, "lr") => {
                let raw = dec.u64()?;
                latest_rev =
                    Some(
                        RevisionNumber::from_u64(raw).ok_or(DecodeError::InvalidField {
                            field: "lr",
                            reason: "revision cannot be zero".to_string(),
                        })?,
                    );
            }
            _ => {
                let raw = capture_value(input, dec, limits)?;
                common
                    .unknown
                    .insert(key.to_string(), Bytes::copy_from_slice(raw));
            }
        }
    }

    let op = match code {
        CREATE_OP_CODE => Op::Create(CreateOp {
            common,
            new_name: new_name.ok_or(DecodeError::MissingField("nm"))?,
            dir: dir_update,
            entry_type: entry_type.ok_or(DecodeError::MissingField("et"))?,
            sym_path,
        }),
        RM_OP_CODE => Op::Rm(RmOp {
            common,
            old_name: old_name.ok_or(DecodeError::MissingField("nm"))?,
            dir: dir_update,
            removed_dir,
        }),
        RENAME_OP_CODE => Op::Rename(RenameOp {
            common,
            old_name: old_name.ok_or(DecodeError::MissingField("on"))?,
            old_dir,
            new_name: new_name.ok_or(DecodeError::MissingField("nn"))?,
            new_dir,
            renamed: renamed.ok_or(DecodeError::MissingField("rp"))?,
            renamed_type: renamed_type.ok_or(DecodeError::MissingField("rt"))?,
        }),
        SYNC_OP_CODE => Op::Sync(SyncOp {
            common,
            file: file_update,
            writes,
        }),
        SET_ATTR_OP_CODE => Op::SetAttr(SetAttrOp {
            common,
            name: name.ok_or(DecodeError::MissingField("nm"))?,
            dir: dir_update,
            attr: attr.ok_or(DecodeError::MissingField("at"))?,
            file: file_ptr.ok_or(DecodeError::MissingField("fp"))?,
        }),
        RESOLUTION_OP_CODE => Op::Resolution(ResolutionOp { common }),
        REKEY_OP_CODE => Op::Rekey(RekeyOp { common }),
        GC_OP_CODE => Op::Gc(GcOp {
            common,
            latest_rev: latest_rev.ok_or(DecodeError::MissingField("lr"))?,
        }),
        _ => unreachable!("op code validated above"),
    };
    Ok(op)
}

/// Decode one op; the input must contain exactly one envelope.
pub fn decode_op(input: &[u8], limits: &Limits) -> Result<Op, DecodeError> {
    if input.len() > limits.max_message_bytes {
        return Err(DecodeError::DecodeLimit("max_message_bytes"));
    }
    let mut dec = Decoder::new(input);
    let op = read_op(input, &mut dec, limits)?;
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(op)
}

fn read_block<'b>(
    input: &'b [u8],
    dec: &mut Decoder<'b>,
    limits: &Limits,
) -> Result<Block, DecodeError> {
    let n = decode_array_len(dec, limits)?;
    if n != 2 {
        return Err(DecodeError::InvalidField {
            field: "block",
            reason: format!("envelope must have 2 elements, got {}", n),
        });
    }
    let code = dec.u32()?;
    match code {
        FILE_BLOCK_CODE => {
            let mut fb = FileBlock::new();
            let mut mr = MapReader::begin(dec, limits)?;
            while let Some(key) = mr.next_key(dec, limits)? {
                match key {
                    "c" => fb.contents = decode_byte_slice(dec, limits)?.to_vec(),
                    "i" => {
                        let n = decode_array_len(dec, limits)?;
                        for _ in 0..n {
                            let mut off = 0;
                            let mut ptr = BlockPointer::default();
                            let mut inner = MapReader::begin(dec, limits)?;
                            while let Some(ckey) = inner.next_key(dec, limits)? {
                                match ckey {
                                    "o" => off = dec.u64()?,
                                    "p" => ptr = read_pointer(dec, limits)?,
                                    _ => skip_value(dec, limits, 0)?,
                                }
                            }
                            fb.children.push(IndirectFilePtr { ptr, off });
                        }
                    }
                    "ind" => fb.common.is_indirect = dec.bool()?,
                    _ => {
                        let raw = capture_value(input, dec, limits)?;
                        fb.common
                            .unknown
                            .insert(key.to_string(), Bytes::copy_from_slice(raw));
                    }
                }
            }
            Ok(Block::File(fb))
        }
        DIR_BLOCK_CODE => {
            let mut db = DirBlock::new();
            let mut mr = MapReader::begin(dec, limits)?;
            while let Some(key) = mr.next_key(dec, limits)? {
                match key {
                    "ch" => {
                        let mut names = MapReader::begin(dec, limits)?;
                        while let Some(child_name) = names.next_key(dec, limits)? {
                            if child_name.len() > limits.max_name_len {
                                return Err(DecodeError::DecodeLimit("max_name_len"));
                            }
                            let entry = read_dir_entry(input, dec, limits)?;
                            db.children.insert(child_name.to_string(), entry);
                        }
                    }
                    "ind" => db.common.is_indirect = dec.bool()?,
                    _ => {
                        let raw = capture_value(input, dec, limits)?;
                        db.common
                            .unknown
                            .insert(key.to_string(), Bytes::copy_from_slice(raw));
                    }
                }
            }
            Ok(Block::Dir(db))
        }
        other => Err(DecodeError::UnsupportedBlockCode(other)),
    }
}

/// Decode one block and stamp its `encoded_size` with the envelope length.
pub fn decode_block(input: &[u8], limits: &Limits) -> Result<Block, DecodeError> {
    if input.len() > limits.max_message_bytes {
        return Err(DecodeError::DecodeLimit("max_message_bytes"));
    }
    let mut dec = Decoder::new(input);
    let mut block = read_block(input, &mut dec, limits)?;
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }
    block.common_mut().set_encoded_size(input.len() as u32);
    Ok(block)
}

/// Decode one revision; the input must contain exactly one revision map.
pub fn decode_revision(input: &[u8], limits: &Limits) -> Result<Revision, DecodeError> {
    if input.len() > limits.max_message_bytes {
        return Err(DecodeError::DecodeLimit("max_message_bytes"));
    }
    let mut dec = Decoder::new(input);

    let mut branch = Branch::Master;
    let mut ops: Vec<Op> = Vec::new();
    let mut prev: Option<RevisionHash> = None;
    let mut new_root = BlockPointer::default();
    let mut revision: Option<RevisionNumber> = None;
    let mut signature: Option<Signature> = None;
    let mut writer: Option<WriterInfo> = None;
    let mut unknown = UnknownFields::default();

    let mut mr = MapReader::begin(&mut dec, limits)?;
    while let Some(key) = mr.next_key(&mut dec, limits)? {
        match key {
            "br" => {
                branch = Branch::Unmerged(BranchId::from_bytes(decode_fixed_bytes::<16>(
                    &mut dec, limits, "br",
                )?));
            }
            "op" => {
                let n = decode_array_len(&mut dec, limits)?;
                if n > limits.max_ops_per_revision as u64 {
                    return Err(DecodeError::DecodeLimit("max_ops_per_revision"));
                }
                for _ in 0..n {
                    ops.push(read_op(input, &mut dec, limits)?);
                }
            }
            "pr" => {
                prev = Some(RevisionHash(decode_fixed_bytes::<32>(
                    &mut dec, limits, "pr",
                )?));
            }
            "rt" => new_root = read_pointer(&mut dec, limits)?,
            "rv" => {
                let raw = dec.u64()?;
                revision =
                    Some(
                        RevisionNumber::from_u64(raw).ok_or(DecodeError::InvalidField {
                            field: "rv",
                            reason: "revision cannot be zero".to_string(),
                        })?,
                    );
            }
            "sg" => {
                signature = Some(Signature(Bytes::copy_from_slice(decode_byte_slice(
                    &mut dec, limits,
                )?)));
            }
            "wi" => writer = Some(read_writer_info(&mut dec, limits)?),
            _ => {
                let raw = capture_value(input, &mut dec, limits)?;
                unknown.insert(key.to_string(), Bytes::copy_from_slice(raw));
            }
        }
    }
    if dec.datatype().is_ok() {
        return Err(DecodeError::TrailingBytes);
    }

    Ok(Revision {
        prev,
        revision: revision.ok_or(DecodeError::MissingField("rv"))?,
        branch,
        ops,
        new_root,
        writer: writer.ok_or(DecodeError::MissingField("wi"))?,
        signature,
        unknown,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::fake_pointer;
    use crate::core::identity::{DeviceName, WriterName};

    fn limits() -> Limits {
        Limits::default()
    }

    fn sample_ops() -> Vec<Op> {
        let mut create = Op::Create(CreateOp::new("test1", fake_pointer(42), EntryType::File));
        create.add_ref_block(fake_pointer(50));
        create.add_update(fake_pointer(60), fake_pointer(61));
        let rm = Op::Rm(RmOp::new("test2", fake_pointer(43)));
        let mut rename = Op::Rename(RenameOp::new(
            "old",
            fake_pointer(1),
            "new",
            fake_pointer(2),
            fake_pointer(3),
            EntryType::Exec,
        ));
        rename.add_unref_block(fake_pointer(70));
        let mut sync = Op::Sync(SyncOp::new(fake_pointer(4)));
        {
            let Op::Sync(inner) = &mut sync else {
                unreachable!()
            };
            inner.add_write(5, 10);
            inner.add_truncate(100);
        }
        let set_attr = Op::SetAttr(SetAttrOp::new(
            "name",
            fake_pointer(5),
            AttrKind::Exec,
            fake_pointer(6),
        ));
        let resolution = Op::Resolution(ResolutionOp::new());
        let rekey = Op::Rekey(RekeyOp::new());
        let gc = Op::Gc(GcOp::new(RevisionNumber::from_u64(100).unwrap()));
        vec![create, rm, rename, sync, set_attr, resolution, rekey, gc]
    }

    #[test]
    fn op_round_trips() {
        for op in sample_ops() {
            let bytes = encode_op(&op).unwrap();
            let decoded = decode_op(&bytes, &limits()).unwrap();
            assert_eq!(decoded, op, "round trip failed for {}", op.name());
            let re = encode_op(&decoded).unwrap();
            assert_eq!(re, bytes, "re-encode not byte-identical for {}", op.name());
        }
    }

    #[test]
    fn unknown_fields_round_trip_every_op() {
        for mut op in sample_ops() {
            let mut raw = Vec::new();
            put_u64(&mut raw, 12345).unwrap();
            op.common_mut()
                .unknown
                .insert("zz_future".to_string(), Bytes::from(raw));
            let bytes = encode_op(&op).unwrap();
            let decoded = decode_op(&bytes, &limits()).unwrap();
            assert_eq!(decoded, op);
            assert_eq!(encode_op(&decoded).unwrap(), bytes);
        }
    }

    #[test]
    fn write_range_unknown_fields_round_trip() {
        let mut op = Op::Sync(SyncOp::new(fake_pointer(1)));
        {
            let Op::Sync(inner) = &mut op else {
                unreachable!()
            };
            inner.add_write(5, 10);
            let mut raw = Vec::new();
            put_str(&mut raw, "future").unwrap();
            inner.writes[0]
                .unknown
                .insert("x_new".to_string(), Bytes::from(raw));
        }
        let bytes = encode_op(&op).unwrap();
        let decoded = decode_op(&bytes, &limits()).unwrap();
        assert_eq!(decoded, op);
        assert_eq!(encode_op(&decoded).unwrap(), bytes);
    }

    #[test]
    fn equal_ops_encode_identically() {
        let a = Op::Create(CreateOp::new("x", fake_pointer(9), EntryType::Dir));
        let b = Op::Create(CreateOp::new("x", fake_pointer(9), EntryType::Dir));
        assert_eq!(encode_op(&a).unwrap(), encode_op(&b).unwrap());
    }

    #[test]
    fn dir_block_round_trips_with_entries() {
        let mut db = DirBlock::new();
        let mut entry = DirEntry::new(fake_pointer(7), EntryType::File);
        entry.size = 42;
        entry.mtime_ms = 1000;
        db.children.insert("a".to_string(), entry);
        db.children
            .insert("b".to_string(), DirEntry::new(fake_pointer(8), EntryType::Dir));
        let block = Block::Dir(db);
        let bytes = encode_block(&block).unwrap();
        let decoded = decode_block(&bytes, &limits()).unwrap();
        assert_eq!(decoded.common().encoded_size(), bytes.len() as u32);
        let Block::Dir(decoded_dir) = &decoded else {
            panic!("expected dir block");
        };
        assert_eq!(decoded_dir.children.len(), 2);
        assert_eq!(decoded_dir.children["a"].size, 42);
        // re-encode ignores encoded_size, so bytes stay identical
        assert_eq!(encode_block(&decoded).unwrap(), bytes);
    }

    #[test]
    fn file_block_round_trips() {
        let block = Block::File(FileBlock::with_contents(vec![1, 2, 3, 4, 5]));
        let bytes = encode_block(&block).unwrap();
        let decoded = decode_block(&bytes, &limits()).unwrap();
        let Block::File(fb) = &decoded else {
            panic!("expected file block");
        };
        assert_eq!(fb.contents, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn decoder_rejects_trailing_bytes() {
        let op = Op::Rekey(RekeyOp::new());
        let mut bytes = encode_op(&op).unwrap().to_vec();
        bytes.push(0x00);
        assert!(matches!(
            decode_op(&bytes, &limits()),
            Err(DecodeError::TrailingBytes)
        ));
    }

    #[test]
    fn decoder_rejects_unsorted_keys() {
        // [1, {"nm": "x", "et": 0}] -- keys out of order
        let mut bytes = Vec::new();
        put_array_header(&mut bytes, 2).unwrap();
        put_u32(&mut bytes, CREATE_OP_CODE).unwrap();
        Encoder::new(&mut bytes).map(2).unwrap();
        put_str(&mut bytes, "nm").unwrap();
        put_str(&mut bytes, "x").unwrap();
        put_str(&mut bytes, "et").unwrap();
        put_u32(&mut bytes, 0).unwrap();
        assert!(matches!(
            decode_op(&bytes, &limits()),
            Err(DecodeError::NonCanonicalKeyOrder(_))
        ));
    }

    #[test]
    fn decoder_rejects_indefinite_maps() {
        let mut bytes = Vec::new();
        put_array_header(&mut bytes, 2).unwrap();
        put_u32(&mut bytes, REKEY_OP_CODE).unwrap();
        Encoder::new(&mut bytes).begin_map().unwrap();
        Encoder::new(&mut bytes).end().unwrap();
        assert!(matches!(
            decode_op(&bytes, &limits()),
            Err(DecodeError::IndefiniteLength)
        ));
    }

    #[test]
    fn decoder_rejects_unknown_op_code() {
        let mut bytes = Vec::new();
        put_array_header(&mut bytes, 2).unwrap();
        put_u32(&mut bytes, 99).unwrap();
        Encoder::new(&mut bytes).map(0).unwrap();
        assert!(matches!(
            decode_op(&bytes, &limits()),
            Err(DecodeError::UnsupportedOpCode(99))
        ));
    }

    #[test]
    fn revision_round_trips_and_signable_excludes_sig() {
        let rev = Revision {
            prev: Some(RevisionHash::of(b"previous")),
            revision: RevisionNumber::from_u64(7).unwrap(),
            branch: Branch::Unmerged(BranchId::from_bytes([9; 16])),
            ops: sample_ops(),
            new_root: fake_pointer(12),
            writer: WriterInfo::new(
                WriterName::new("u1").unwrap(),
                DeviceName::new("dev1").unwrap(),
                5000,
            ),
            signature: Some(Signature(Bytes::from_static(b"signature-bytes"))),
            unknown: UnknownFields::default(),
        };
        let l = limits();
        let full = encode_revision(&rev, &l, true).unwrap();
        let signable = encode_revision(&rev, &l, false).unwrap();
        assert_ne!(full, signable);

        let decoded = decode_revision(&full, &l).unwrap();
        assert_eq!(decoded, rev);
        assert_eq!(encode_revision(&decoded, &l, true).unwrap(), full);

        let unsigned = decode_revision(&signable, &l).unwrap();
        assert!(unsigned.signature.is_none());
        assert_eq!(unsigned.signable_bytes(&l).unwrap(), signable);
    }
}
