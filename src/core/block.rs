//! Content-addressed blocks and the pointers that reference them.

use std::collections::BTreeMap;
use std::fmt;

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::identity::{DataVer, KeyGen, WriterName};
use super::wire::UnknownFields;

/// Content hash of a block's ciphertext. Equality implies byte-identical
/// ciphertext.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BlockId([u8; 32]);

impl BlockId {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash ciphertext into its id.
    pub fn hash_of(ciphertext: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(ciphertext);
        let out = hasher.finalize();
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        Self(buf)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockId({})", self)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Hash of a direct file block's plaintext contents, for deduplication.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ContentHash(pub [u8; 32]);

pub fn content_hash(data: &[u8]) -> ContentHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&out);
    ContentHash(buf)
}

/// Disambiguates multiple logical references to one block id.
///
/// The zero nonce is the canonical first reference.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RefNonce(pub [u8; 8]);

impl RefNonce {
    pub const ZERO: RefNonce = RefNonce([0u8; 8]);

    pub fn random() -> Self {
        let mut buf = [0u8; 8];
        rand::rng().fill_bytes(&mut buf);
        Self(buf)
    }

    /// Deterministic nonce for resolution-minted references, so re-running a
    /// resolution over the same inputs yields identical ops.
    pub fn derived(seed: &[u8], id: &BlockId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(seed);
        hasher.update(id.as_bytes());
        let out = hasher.finalize();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&out[..8]);
        Self(buf)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }
}

impl fmt::Debug for RefNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RefNonce(")?;
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// How a reference participates in garbage collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlockType {
    #[default]
    Data,
    /// Reference held only so a future gc op can reclaim the block.
    Archive,
}

/// Provenance of one logical reference to a block.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockContext {
    pub creator: Option<WriterName>,
    pub writer: Option<WriterName>,
    pub ref_nonce: RefNonce,
    pub block_type: BlockType,
}

impl BlockContext {
    pub fn for_writer(writer: WriterName) -> Self {
        Self {
            creator: Some(writer.clone()),
            writer: Some(writer),
            ref_nonce: RefNonce::ZERO,
            block_type: BlockType::Data,
        }
    }

    pub fn with_nonce(mut self, nonce: RefNonce) -> Self {
        self.ref_nonce = nonce;
        self
    }
}

/// Full handle to one logical reference of an encrypted block.
///
/// Two pointers are equal iff every field matches; `same_block` compares ids
/// only.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct BlockPointer {
    pub id: BlockId,
    pub key_gen: KeyGen,
    pub data_ver: DataVer,
    pub context: BlockContext,
}

impl BlockPointer {
    pub fn new(id: BlockId, key_gen: KeyGen, data_ver: DataVer, context: BlockContext) -> Self {
        Self {
            id,
            key_gen,
            data_ver,
            context,
        }
    }

    pub fn is_initialized(&self) -> bool {
        !self.id.is_zero()
    }

    pub fn same_block(&self, other: &BlockPointer) -> bool {
        self.id == other.id
    }

    pub fn ref_nonce(&self) -> RefNonce {
        self.context.ref_nonce
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{:02x}", self.id, self.context.ref_nonce.0[0])
    }
}

/// Type of a directory entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryType {
    #[default]
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryType {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryType::Dir)
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            EntryType::File => 0,
            EntryType::Exec => 1,
            EntryType::Dir => 2,
            EntryType::Sym => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(EntryType::File),
            1 => Some(EntryType::Exec),
            2 => Some(EntryType::Dir),
            3 => Some(EntryType::Sym),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::File => "file",
            EntryType::Exec => "exec",
            EntryType::Dir => "dir",
            EntryType::Sym => "sym",
        };
        write!(f, "{}", s)
    }
}

/// One child of a directory block.
#[derive(Clone, Debug, PartialEq)]
pub struct DirEntry {
    pub ptr: BlockPointer,
    pub entry_type: EntryType,
    pub size: u64,
    pub mtime_ms: u64,
    pub sym_path: Option<String>,
    pub unknown: UnknownFields,
}

impl DirEntry {
    pub fn new(ptr: BlockPointer, entry_type: EntryType) -> Self {
        Self {
            ptr,
            entry_type,
            size: 0,
            mtime_ms: 0,
            sym_path: None,
            unknown: UnknownFields::default(),
        }
    }
}

/// Header shared by file and directory blocks.
///
/// `encoded_size` is local bookkeeping set at serialization time and is not
/// part of the wire image.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BlockCommon {
    pub is_indirect: bool,
    encoded_size: u32,
    pub unknown: UnknownFields,
}

impl BlockCommon {
    pub fn encoded_size(&self) -> u32 {
        self.encoded_size
    }

    pub fn set_encoded_size(&mut self, size: u32) {
        self.encoded_size = size;
    }
}

/// Indirect child of a file block: pointer plus the byte offset it covers.
#[derive(Clone, Debug, PartialEq)]
pub struct IndirectFilePtr {
    pub ptr: BlockPointer,
    pub off: u64,
}

/// Leaf bytes, or an indirect list of children when `common.is_indirect`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FileBlock {
    pub common: BlockCommon,
    pub contents: Vec<u8>,
    pub children: Vec<IndirectFilePtr>,
}

impl FileBlock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_contents(contents: Vec<u8>) -> Self {
        Self {
            contents,
            ..Self::default()
        }
    }

    /// Dedup hash over the plaintext leaf contents. Indirect blocks are not
    /// candidates for content dedup.
    pub fn content_hash(&self) -> Option<ContentHash> {
        if self.common.is_indirect {
            None
        } else {
            Some(content_hash(&self.contents))
        }
    }
}

/// Mapping from child name to entry.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DirBlock {
    pub common: BlockCommon,
    pub children: BTreeMap<String, DirEntry>,
}

impl DirBlock {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A decrypted block.
#[derive(Clone, Debug, PartialEq)]
pub enum Block {
    File(FileBlock),
    Dir(DirBlock),
}

impl Block {
    pub fn common(&self) -> &BlockCommon {
        match self {
            Block::File(b) => &b.common,
            Block::Dir(b) => &b.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut BlockCommon {
        match self {
            Block::File(b) => &mut b.common,
            Block::Dir(b) => &mut b.common,
        }
    }

    pub fn as_file(&self) -> Option<&FileBlock> {
        match self {
            Block::File(b) => Some(b),
            Block::Dir(_) => None,
        }
    }

    pub fn as_dir(&self) -> Option<&DirBlock> {
        match self {
            Block::Dir(b) => Some(b),
            Block::File(_) => None,
        }
    }

    /// Bytes this block charges against the cache byte budget: the encoded
    /// size when known, else the leaf content length.
    pub fn cache_size(&self) -> u64 {
        let encoded = self.common().encoded_size();
        if encoded > 0 {
            return u64::from(encoded);
        }
        match self {
            Block::File(b) => b.contents.len() as u64,
            Block::Dir(_) => 0,
        }
    }
}

#[cfg(test)]
pub(crate) fn fake_block_id(n: u8) -> BlockId {
    BlockId::new([n; 32])
}

#[cfg(test)]
pub(crate) fn fake_pointer(n: u8) -> BlockPointer {
    BlockPointer {
        id: fake_block_id(n),
        key_gen: KeyGen::FIRST,
        data_ver: DataVer::FIRST,
        context: BlockContext::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pointer_equality_is_all_fields() {
        let a = fake_pointer(1);
        let mut b = a.clone();
        assert_eq!(a, b);
        b.context.ref_nonce = RefNonce([1, 0, 0, 0, 0, 0, 0, 0]);
        assert_ne!(a, b);
        assert!(a.same_block(&b));
    }

    #[test]
    fn zero_pointer_uninitialized() {
        let zero = BlockPointer::default();
        assert!(!zero.is_initialized());
        assert!(fake_pointer(1).is_initialized());
    }

    #[test]
    fn cache_size_prefers_encoded() {
        let mut b = Block::File(FileBlock::with_contents(vec![0u8; 4]));
        assert_eq!(b.cache_size(), 4);
        b.common_mut().set_encoded_size(7);
        assert_eq!(b.cache_size(), 7);
        assert_eq!(Block::Dir(DirBlock::new()).cache_size(), 0);
    }

    #[test]
    fn indirect_blocks_skip_content_hash() {
        let mut fb = FileBlock::with_contents(vec![1, 2, 3]);
        assert!(fb.content_hash().is_some());
        fb.common.is_indirect = true;
        assert!(fb.content_hash().is_none());
    }

    #[test]
    fn derived_nonce_is_stable() {
        let id = fake_block_id(9);
        let a = RefNonce::derived(b"branch", &id);
        let b = RefNonce::derived(b"branch", &id);
        assert_eq!(a, b);
        assert_ne!(a, RefNonce::derived(b"other", &id));
    }
}
