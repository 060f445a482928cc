#![forbid(unsafe_code)]

//! Core of a distributed, end-to-end-encrypted, multi-writer folder store.
//!
//! Each top-level folder (TLF) is an append-only chain of signed metadata
//! revisions over an immutable, content-addressed block graph. Multiple
//! devices mutate a folder concurrently; a rejected write forks the device
//! onto a private unmerged branch, and conflict resolution later replays
//! both histories into a single resolution revision. The crate speaks no
//! network protocol and persists nothing: block storage, metadata storage,
//! and cryptography arrive as injected capabilities.

pub mod cache;
pub mod config;
pub mod core;
pub mod cr;
pub mod error;
pub mod folder;
pub mod notify;
pub mod server;
pub mod task;

pub use error::{Effect, Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working set at the crate root for convenience
pub use crate::cache::{BlockCache, CacheError, CacheLifetime};
pub use crate::config::{CacheConfig, Config, Limits};
pub use crate::core::{
    coalesce_writes, decode_block, decode_op, decode_revision, encode_block, encode_op,
    encode_revision, format_conflict_date, AttrKind, Block, BlockId, BlockPointer, BlockUpdate,
    Branch, BranchId, Clock, DeviceName, DirBlock, DirEntry, EntryType, FileBlock, FixedClock, Op,
    RefNonce, Revision, RevisionHash, RevisionNumber, Signature, SystemClock, TlfHandle, TlfId,
    UnknownFields, WriteRange, WriterInfo, WriterName,
};
pub use crate::cr::{conflict_name, ChainSet, OpChain};
pub use crate::folder::{ChainError, FolderConfig, FolderOps, FolderStatus};
pub use crate::notify::{changes_from_ops, NodeChange, Notifier, Observer};
pub use crate::server::{
    memory, BlockServer, Crypter, CryptoError, MdServer, PutOutcome, RekeyQueue, ServerError,
};
pub use crate::task::{put_blocks, retry_transient, CancelFlag, PutGroupError};
