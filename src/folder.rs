//! Per-folder operations: mutations, sync, branch state, and update intake.
//!
//! All mutations to one folder's chain serialize under its writer lock. A
//! mutation edits blocks copy-on-write in the cache (dirty, under the
//! working branch) and appends a pending op; `sync` freezes the dirty tree
//! into content-addressed blocks, packages the pending ops into a signed
//! revision, and submits it. A master-branch conflict forks the folder onto
//! a device-private unmerged branch; resolution later rejoins master.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::{BlockCache, CacheError, CacheLifetime};
use crate::config::Config;
use crate::core::block::{
    Block, BlockContext, BlockId, BlockPointer, DirBlock, DirEntry, EntryType, FileBlock, RefNonce,
};
use crate::core::identity::{
    Branch, BranchId, DataVer, DeviceName, KeyGen, TlfHandle, TlfId, WriterInfo, WriterName,
};
use crate::core::ops::{
    AttrKind, CreateOp, GcOp, Op, RekeyOp, RenameOp, RmOp, SetAttrOp, SyncOp, WriteRange,
};
use crate::core::revision::{Revision, RevisionHash, RevisionNumber};
use crate::core::time::Clock;
use crate::core::wire::{self, DecodeError, EncodeError, UnknownFields};
use crate::notify::{changes_from_ops, Notifier};
use crate::server::{BlockServer, Crypter, CryptoError, MdServer, PutOutcome, RekeyQueue, ServerError};
use crate::task::{put_blocks, retry_transient, CancelFlag};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("folder {0} is read-only")]
    ReadOnly(TlfId),
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("entry already exists: {0}")]
    Exists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("not a file: {0}")]
    NotAFile(String),
    #[error("directory not empty: {0}")]
    DirNotEmpty(String),
    #[error("name too long: {0}")]
    NameTooLong(String),
    #[error("invalid ops batch: {0}")]
    InvalidBatch(&'static str),
    #[error("chain linkage broken at revision {0}")]
    ChainBroken(RevisionNumber),
    #[error("resolution on {0} kept losing the publish race")]
    ResolutionStuck(TlfId),
    #[error("revision signature invalid at {0}")]
    SignatureInvalid(RevisionNumber),
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl ChainError {
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ChainError::Cancelled | ChainError::Server(ServerError::Cancelled)
        )
    }
}

/// Everything a folder needs from the outside world.
#[derive(Clone)]
pub struct FolderConfig {
    pub config: Config,
    pub cache: Arc<BlockCache>,
    pub block_server: Arc<dyn BlockServer>,
    pub md_server: Arc<dyn MdServer>,
    pub crypter: Arc<dyn Crypter>,
    pub rekey_queue: Arc<dyn RekeyQueue>,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<Notifier>,
}

/// Caller-visible snapshot of a folder's chain position.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FolderStatus {
    pub staged: bool,
    pub head_writer: Option<WriterName>,
    pub revision: Option<RevisionNumber>,
}

pub(crate) struct FolderState {
    pub(crate) branch: Branch,
    /// Working root: committed root plus any dirty edits layered on top.
    pub(crate) root: BlockPointer,
    pub(crate) committed_root: BlockPointer,
    pub(crate) head: Option<RevisionNumber>,
    pub(crate) head_hash: Option<RevisionHash>,
    pub(crate) head_writer: Option<WriterName>,
    /// Master position at the fork point while unmerged.
    pub(crate) fork_master_head: Option<RevisionNumber>,
    pub(crate) fork_master_root: BlockPointer,
    pub(crate) unmerged_revs: Vec<Revision>,
    pub(crate) pending: Vec<Op>,
    pub(crate) temp_ids: HashSet<BlockId>,
    pub(crate) temp_owner: HashMap<BlockId, usize>,
    pub(crate) gc_pending: Vec<BlockPointer>,
    pub(crate) updates_paused: bool,
    pub(crate) read_only: bool,
    #[allow(dead_code)]
    pub(crate) updates_rx: Option<Receiver<RevisionNumber>>,
}

impl FolderState {
    fn empty() -> Self {
        Self {
            branch: Branch::Master,
            root: BlockPointer::default(),
            committed_root: BlockPointer::default(),
            head: None,
            head_hash: None,
            head_writer: None,
            fork_master_head: None,
            fork_master_root: BlockPointer::default(),
            unmerged_revs: Vec::new(),
            pending: Vec::new(),
            temp_ids: HashSet::new(),
            temp_owner: HashMap::new(),
            gc_pending: Vec::new(),
            updates_paused: false,
            read_only: false,
            updates_rx: None,
        }
    }
}

/// Handle to one folder on one device.
pub struct FolderOps {
    pub(crate) tlf: TlfId,
    pub(crate) handle: TlfHandle,
    pub(crate) writer: WriterName,
    pub(crate) device: DeviceName,
    pub(crate) cfg: FolderConfig,
    pub(crate) state: Mutex<FolderState>,
}

/// Accumulated output of freezing a dirty tree into final blocks.
#[derive(Default)]
pub(crate) struct FreezeOut {
    /// `(pointer, ciphertext)` pairs that must reach the block server.
    pub(crate) uploads: Vec<(BlockPointer, Bytes)>,
    /// Dedup hits: existing server blocks gaining one more reference.
    pub(crate) ref_adds: Vec<BlockPointer>,
    /// `(old, new)` for rewrites of previously committed blocks.
    pub(crate) replaced: Vec<(BlockPointer, BlockPointer)>,
    /// `(temp old, final new)` for blocks minted since the last sync.
    pub(crate) created: Vec<(BlockPointer, BlockPointer)>,
    /// `(old ptr, new ptr, block)` for cache promotion after acceptance.
    pub(crate) promoted: Vec<(BlockPointer, BlockPointer, Block)>,
}

impl FolderOps {
    /// Open a folder, recovering committed state and any unmerged branch
    /// this device left behind.
    pub fn open(
        cfg: FolderConfig,
        tlf: TlfId,
        handle: TlfHandle,
        writer: WriterName,
        device: DeviceName,
    ) -> Result<Arc<FolderOps>, ChainError> {
        let folder = Arc::new(FolderOps {
            tlf,
            handle,
            writer,
            device,
            cfg,
            state: Mutex::new(FolderState::empty()),
        });
        folder.bootstrap()?;
        Ok(folder)
    }

    fn bootstrap(&self) -> Result<(), ChainError> {
        let mut state = self.lock();
        if let Some(head) = self.cfg.md_server.head(self.tlf, Branch::Master)? {
            let revs = self.fetch_and_verify(Branch::Master, RevisionNumber::INITIAL, head, None)?;
            if let Some(last) = revs.last() {
                state.head = Some(last.revision);
                state.head_hash = Some(last.hash(&self.cfg.config.limits)?);
                state.head_writer = Some(last.writer.writer.clone());
                state.root = last.new_root.clone();
                state.committed_root = last.new_root.clone();
            }
            // resume a staged fork left by this device
            if let Some(unmerged) =
                self.cfg
                    .md_server
                    .unmerged_for_device(self.tlf, &self.writer, &self.device)?
            {
                if let (Some(first), Some(last)) = (unmerged.first(), unmerged.last()) {
                    state.branch = last.branch;
                    state.fork_master_head = first.revision.prev();
                    state.fork_master_root = first
                        .revision
                        .prev()
                        .and_then(|n| revs.iter().find(|r| r.revision == n))
                        .map(|r| r.new_root.clone())
                        .unwrap_or_default();
                    state.head = Some(last.revision);
                    state.head_hash = Some(last.hash(&self.cfg.config.limits)?);
                    state.root = last.new_root.clone();
                    state.committed_root = last.new_root.clone();
                    state.unmerged_revs = unmerged;
                    debug!(tlf = %self.tlf, branch = %state.branch, "resumed staged fork");
                }
            }
        }
        state.updates_rx = Some(self.cfg.md_server.register_for_updates(self.tlf));
        Ok(())
    }

    pub fn tlf(&self) -> TlfId {
        self.tlf
    }

    pub fn handle(&self) -> &TlfHandle {
        &self.handle
    }

    pub fn notifier(&self) -> &Arc<Notifier> {
        &self.cfg.notifier
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FolderState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> FolderStatus {
        let state = self.lock();
        FolderStatus {
            staged: !state.branch.is_master(),
            head_writer: state.head_writer.clone(),
            revision: state.head,
        }
    }

    pub fn pause_updates(&self) {
        self.lock().updates_paused = true;
    }

    pub fn resume_updates(&self) {
        self.lock().updates_paused = false;
    }

    fn writer_info(&self) -> WriterInfo {
        WriterInfo::new(
            self.writer.clone(),
            self.device.clone(),
            self.cfg.clock.now_ms(),
        )
    }

    fn mint_temp_ptr(&self) -> BlockPointer {
        let mut raw = [0u8; 32];
        use rand::RngCore;
        rand::rng().fill_bytes(&mut raw);
        BlockPointer {
            id: BlockId::new(raw),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            context: BlockContext::for_writer(self.writer.clone()),
        }
    }

    /// Load a block for the working branch: dirty first, then clean cache,
    /// then the block server.
    pub(crate) fn load_block(
        &self,
        ptr: &BlockPointer,
        branch: Branch,
    ) -> Result<Arc<Block>, ChainError> {
        match self.cfg.cache.get(ptr, branch) {
            Ok(block) => Ok(block),
            Err(CacheError::NoSuchBlock(_)) => {
                let limits = &self.cfg.config.limits;
                let ciphertext = retry_transient(
                    limits.max_fetch_retries,
                    std::time::Duration::from_millis(limits.fetch_retry_base_ms),
                    &CancelFlag::new(),
                    || self.cfg.block_server.get(self.tlf, ptr.id),
                )?;
                let plaintext = self.cfg.crypter.decrypt(self.tlf, ptr.key_gen, &ciphertext)?;
                let block = wire::decode_block(&plaintext, &self.cfg.config.limits)?;
                self.cfg
                    .cache
                    .put(ptr, self.tlf, block.clone(), CacheLifetime::Transient);
                Ok(Arc::new(block))
            }
        }
    }

    fn load_dir(&self, ptr: &BlockPointer, branch: Branch) -> Result<DirBlock, ChainError> {
        match self.load_block(ptr, branch)?.as_ref() {
            Block::Dir(db) => Ok(db.clone()),
            Block::File(_) => Err(ChainError::NotADirectory(ptr.to_string())),
        }
    }

    fn load_file(&self, ptr: &BlockPointer, branch: Branch) -> Result<FileBlock, ChainError> {
        match self.load_block(ptr, branch)?.as_ref() {
            Block::File(fb) => Ok(fb.clone()),
            Block::Dir(_) => Err(ChainError::NotAFile(ptr.to_string())),
        }
    }

    /// Ensure the folder has a root directory, minting a dirty one for a
    /// brand-new folder.
    fn ensure_root(&self, state: &mut FolderState) -> BlockPointer {
        if state.root.is_initialized() {
            return state.root.clone();
        }
        let ptr = self.mint_temp_ptr();
        state.temp_ids.insert(ptr.id);
        self.cfg
            .cache
            .put_dirty(&ptr, state.branch, Block::Dir(DirBlock::new()));
        state.root = ptr.clone();
        ptr
    }

    /// Walk to the directory at `path`, returning the pointer chain from the
    /// root inclusive.
    fn walk_dirs(
        &self,
        state: &FolderState,
        path: &[&str],
    ) -> Result<Vec<(BlockPointer, String)>, ChainError> {
        let mut chain = vec![(state.root.clone(), String::new())];
        let mut current = state.root.clone();
        for component in path {
            let dir = self.load_dir(&current, state.branch)?;
            let entry = dir
                .children
                .get(*component)
                .ok_or_else(|| ChainError::NotFound((*component).to_string()))?;
            if entry.entry_type != EntryType::Dir {
                return Err(ChainError::NotADirectory((*component).to_string()));
            }
            current = entry.ptr.clone();
            chain.push((current.clone(), (*component).to_string()));
        }
        Ok(chain)
    }

    fn split_path<'p>(&self, path: &'p [&'p str]) -> Result<(&'p [&'p str], &'p str), ChainError> {
        let (name, parent) = path
            .split_last()
            .ok_or_else(|| ChainError::NotFound("<root>".to_string()))?;
        if name.len() > self.cfg.config.limits.max_name_len {
            return Err(ChainError::NameTooLong((*name).to_string()));
        }
        Ok((parent, name))
    }

    fn check_writable(&self, state: &FolderState) -> Result<(), ChainError> {
        if state.read_only {
            return Err(ChainError::ReadOnly(self.tlf));
        }
        Ok(())
    }

    fn create_entry(
        &self,
        path: &[&str],
        entry_type: EntryType,
        sym_target: Option<String>,
    ) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (parent_path, name) = self.split_path(path)?;
        self.ensure_root(&mut state);
        let chain = self.walk_dirs(&state, parent_path)?;
        let (parent_ptr, _) = chain.last().expect("chain includes root").clone();
        let mut parent = self.load_dir(&parent_ptr, state.branch)?;
        if parent.children.contains_key(name) {
            return Err(ChainError::Exists(name.to_string()));
        }

        let mut entry_ptr = BlockPointer::default();
        if entry_type != EntryType::Sym {
            entry_ptr = self.mint_temp_ptr();
            state.temp_ids.insert(entry_ptr.id);
            let block = match entry_type {
                EntryType::Dir => Block::Dir(DirBlock::new()),
                _ => Block::File(FileBlock::new()),
            };
            self.cfg.cache.put_dirty(&entry_ptr, state.branch, block);
        }
        let mut entry = DirEntry::new(entry_ptr.clone(), entry_type);
        entry.mtime_ms = self.cfg.clock.now_ms();
        entry.sym_path = sym_target.clone();
        parent.children.insert(name.to_string(), entry);
        self.cfg
            .cache
            .put_dirty(&parent_ptr, state.branch, Block::Dir(parent));

        let mut op = Op::Create(CreateOp::new(name, parent_ptr, entry_type));
        if let Op::Create(inner) = &mut op {
            inner.sym_path = sym_target;
        }
        op.set_final_path(parent_path.iter().map(|s| s.to_string()).collect());
        let idx = state.pending.len();
        state.pending.push(op);
        if entry_ptr.is_initialized() {
            state.temp_owner.insert(entry_ptr.id, idx);
        }
        debug!(tlf = %self.tlf, name, %entry_type, "created entry");
        Ok(())
    }

    pub fn create_dir(&self, path: &[&str]) -> Result<(), ChainError> {
        self.create_entry(path, EntryType::Dir, None)
    }

    pub fn create_file(&self, path: &[&str], exec: bool) -> Result<(), ChainError> {
        let entry_type = if exec { EntryType::Exec } else { EntryType::File };
        self.create_entry(path, entry_type, None)
    }

    pub fn create_symlink(&self, path: &[&str], target: &str) -> Result<(), ChainError> {
        self.create_entry(path, EntryType::Sym, Some(target.to_string()))
    }

    fn file_entry(
        &self,
        state: &FolderState,
        path: &[&str],
    ) -> Result<(BlockPointer, DirEntry, String), ChainError> {
        if !state.root.is_initialized() {
            return Err(ChainError::NotFound(path.join("/")));
        }
        let (parent_path, name) = self.split_path(path)?;
        let chain = self.walk_dirs(state, parent_path)?;
        let (parent_ptr, _) = chain.last().expect("chain includes root").clone();
        let parent = self.load_dir(&parent_ptr, state.branch)?;
        let entry = parent
            .children
            .get(name)
            .ok_or_else(|| ChainError::NotFound(name.to_string()))?
            .clone();
        Ok((parent_ptr, entry, name.to_string()))
    }

    /// Overlay bytes at `off`, extending the file with zeros if needed.
    pub fn write_file(&self, path: &[&str], off: u64, data: &[u8]) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (_, entry, _) = self.file_entry(&state, path)?;
        if !matches!(entry.entry_type, EntryType::File | EntryType::Exec) {
            return Err(ChainError::NotAFile(path.join("/")));
        }
        let mut file = self.load_file(&entry.ptr, state.branch)?;
        let end = off as usize + data.len();
        if file.contents.len() < end {
            file.contents.resize(end, 0);
        }
        file.contents[off as usize..end].copy_from_slice(data);
        self.cfg
            .cache
            .put_dirty(&entry.ptr, state.branch, Block::File(file));

        let full_path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.append_write(&mut state, &entry.ptr, &full_path, |sync_op| {
            sync_op.add_write(off, data.len() as u64)
        });
        drop(state);
        self.cfg.notifier.local_change(
            self.tlf,
            &path.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &WriteRange::write(off, data.len() as u64),
        );
        Ok(())
    }

    /// Truncate (or sparse-extend) a file to `size` bytes.
    pub fn truncate_file(&self, path: &[&str], size: u64) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (_, entry, _) = self.file_entry(&state, path)?;
        if !matches!(entry.entry_type, EntryType::File | EntryType::Exec) {
            return Err(ChainError::NotAFile(path.join("/")));
        }
        let mut file = self.load_file(&entry.ptr, state.branch)?;
        file.contents.resize(size as usize, 0);
        self.cfg
            .cache
            .put_dirty(&entry.ptr, state.branch, Block::File(file));

        let full_path: Vec<String> = path.iter().map(|s| s.to_string()).collect();
        self.append_write(&mut state, &entry.ptr, &full_path, |sync_op| {
            sync_op.add_truncate(size)
        });
        drop(state);
        self.cfg.notifier.local_change(
            self.tlf,
            &path.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &WriteRange::truncate(size),
        );
        Ok(())
    }

    /// Route a write into the open sync op for this file, or start one.
    fn append_write<F>(
        &self,
        state: &mut FolderState,
        file_ptr: &BlockPointer,
        full_path: &[String],
        record: F,
    ) where
        F: FnOnce(&mut SyncOp),
    {
        for op in state.pending.iter_mut().rev() {
            if let Op::Sync(sync_op) = op {
                if sync_op.file.unref == *file_ptr {
                    record(sync_op);
                    return;
                }
            }
        }
        let mut sync_op = SyncOp::new(file_ptr.clone());
        record(&mut sync_op);
        let mut op = Op::Sync(sync_op);
        op.set_final_path(full_path.to_vec());
        state.pending.push(op);
    }

    pub fn remove(&self, path: &[&str]) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (parent_path, name) = self.split_path(path)?;
        let chain = self.walk_dirs(&state, parent_path)?;
        let (parent_ptr, _) = chain.last().expect("chain includes root").clone();
        let mut parent = self.load_dir(&parent_ptr, state.branch)?;
        let entry = parent
            .children
            .get(name)
            .ok_or_else(|| ChainError::NotFound(name.to_string()))?
            .clone();
        if entry.entry_type == EntryType::Dir {
            let dir = self.load_dir(&entry.ptr, state.branch)?;
            if !dir.children.is_empty() {
                return Err(ChainError::DirNotEmpty(name.to_string()));
            }
        }
        parent.children.remove(name);
        self.cfg
            .cache
            .put_dirty(&parent_ptr, state.branch, Block::Dir(parent));

        let mut op = Op::Rm(RmOp::new(name, parent_ptr));
        if let Op::Rm(inner) = &mut op {
            inner.removed_dir = entry.entry_type == EntryType::Dir;
        }
        op.set_final_path(parent_path.iter().map(|s| s.to_string()).collect());
        if entry.ptr.is_initialized() {
            if state.temp_ids.remove(&entry.ptr.id) {
                // never synced; nothing to unref
                state.temp_owner.remove(&entry.ptr.id);
                self.cfg.cache.delete_dirty(&entry.ptr, state.branch);
            } else {
                op.add_unref_block(entry.ptr.clone());
            }
        }
        state.pending.push(op);
        Ok(())
    }

    pub fn rename(&self, old_path: &[&str], new_path: &[&str]) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (old_parent_path, old_name) = self.split_path(old_path)?;
        let (new_parent_path, new_name) = self.split_path(new_path)?;
        let old_chain = self.walk_dirs(&state, old_parent_path)?;
        let new_chain = self.walk_dirs(&state, new_parent_path)?;
        let (old_parent_ptr, _) = old_chain.last().expect("chain includes root").clone();
        let (new_parent_ptr, _) = new_chain.last().expect("chain includes root").clone();
        let same_dir = old_parent_ptr == new_parent_ptr;

        let mut old_parent = self.load_dir(&old_parent_ptr, state.branch)?;
        let entry = old_parent
            .children
            .remove(old_name)
            .ok_or_else(|| ChainError::NotFound(old_name.to_string()))?;
        let renamed_ptr = entry.ptr.clone();
        let renamed_type = entry.entry_type;

        let mut op = Op::Rename(RenameOp::new(
            old_name,
            old_parent_ptr.clone(),
            new_name,
            new_parent_ptr.clone(),
            renamed_ptr,
            renamed_type,
        ));
        if same_dir {
            if let Some(displaced) = old_parent.children.insert(new_name.to_string(), entry) {
                if displaced.ptr.is_initialized() {
                    op.add_unref_block(displaced.ptr);
                }
            }
            self.cfg
                .cache
                .put_dirty(&old_parent_ptr, state.branch, Block::Dir(old_parent));
        } else {
            self.cfg
                .cache
                .put_dirty(&old_parent_ptr, state.branch, Block::Dir(old_parent));
            let mut new_parent = self.load_dir(&new_parent_ptr, state.branch)?;
            if let Some(displaced) = new_parent.children.insert(new_name.to_string(), entry) {
                if displaced.ptr.is_initialized() {
                    op.add_unref_block(displaced.ptr);
                }
            }
            self.cfg
                .cache
                .put_dirty(&new_parent_ptr, state.branch, Block::Dir(new_parent));
        }
        op.set_final_path(old_parent_path.iter().map(|s| s.to_string()).collect());
        state.pending.push(op);
        Ok(())
    }

    fn set_attr(&self, path: &[&str], attr: AttrKind, value: u64) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        let (parent_path, name) = self.split_path(path)?;
        let chain = self.walk_dirs(&state, parent_path)?;
        let (parent_ptr, _) = chain.last().expect("chain includes root").clone();
        let mut parent = self.load_dir(&parent_ptr, state.branch)?;
        let entry = parent
            .children
            .get_mut(name)
            .ok_or_else(|| ChainError::NotFound(name.to_string()))?;
        match attr {
            AttrKind::Mtime => entry.mtime_ms = value,
            AttrKind::Exec => {
                entry.entry_type = if value != 0 {
                    EntryType::Exec
                } else {
                    EntryType::File
                };
            }
        }
        let file_ptr = entry.ptr.clone();
        self.cfg
            .cache
            .put_dirty(&parent_ptr, state.branch, Block::Dir(parent));

        let mut op = Op::SetAttr(SetAttrOp::new(name, parent_ptr, attr, file_ptr));
        op.set_final_path(path.iter().map(|s| s.to_string()).collect());
        state.pending.push(op);
        Ok(())
    }

    pub fn set_mtime(&self, path: &[&str], mtime_ms: u64) -> Result<(), ChainError> {
        self.set_attr(path, AttrKind::Mtime, mtime_ms)
    }

    pub fn set_exec(&self, path: &[&str], exec: bool) -> Result<(), ChainError> {
        self.set_attr(path, AttrKind::Exec, u64::from(exec))
    }

    /// Queue a rekey op and kick the rekey queue.
    pub fn rekey(&self) -> Result<(), ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        state.pending.push(Op::Rekey(RekeyOp::new()));
        drop(state);
        self.cfg.rekey_queue.enqueue(self.tlf);
        Ok(())
    }

    pub fn read_file(&self, path: &[&str]) -> Result<Vec<u8>, ChainError> {
        let state = self.lock();
        let (_, entry, _) = self.file_entry(&state, path)?;
        if !matches!(entry.entry_type, EntryType::File | EntryType::Exec) {
            return Err(ChainError::NotAFile(path.join("/")));
        }
        Ok(self.load_file(&entry.ptr, state.branch)?.contents)
    }

    pub fn list_dir(&self, path: &[&str]) -> Result<BTreeMap<String, EntryType>, ChainError> {
        let state = self.lock();
        if !state.root.is_initialized() {
            if path.is_empty() {
                return Ok(BTreeMap::new());
            }
            return Err(ChainError::NotFound(path.join("/")));
        }
        let chain = self.walk_dirs(&state, path)?;
        let (ptr, _) = chain.last().expect("chain includes root").clone();
        let dir = self.load_dir(&ptr, state.branch)?;
        Ok(dir
            .children
            .iter()
            .map(|(name, entry)| (name.clone(), entry.entry_type))
            .collect())
    }

    /// Freeze the working tree rooted at `ptr`: every dirty block (and every
    /// ancestor of one) is encoded, encrypted, and assigned its final
    /// content-addressed pointer. Traversal order is deterministic.
    pub(crate) fn freeze_tree(
        &self,
        branch: Branch,
        ptr: &BlockPointer,
        temp_ids: &HashSet<BlockId>,
        writer: &WriterInfo,
        nonce_seed: Option<&[u8]>,
        out: &mut FreezeOut,
    ) -> Result<(BlockPointer, bool, u64), ChainError> {
        let dirty = self.cfg.cache.is_dirty(ptr, branch);
        let block = if dirty {
            self.cfg.cache.get(ptr, branch)?
        } else {
            match self.load_block(ptr, branch) {
                Ok(block) => block,
                // A clean leaf we cannot load cannot hide dirty descendants.
                Err(ChainError::Server(ServerError::NoSuchBlock(_))) => {
                    return Ok((ptr.clone(), false, 0))
                }
                Err(err) => return Err(err),
            }
        };

        let (finished, size) = match block.as_ref() {
            Block::File(fb) => {
                if !dirty {
                    return Ok((ptr.clone(), false, 0));
                }
                (Block::File(fb.clone()), fb.contents.len() as u64)
            }
            Block::Dir(db) => {
                let mut db = db.clone();
                let mut changed = dirty;
                for (_, entry) in db.children.iter_mut() {
                    if !entry.ptr.is_initialized() {
                        continue;
                    }
                    let (child_ptr, child_changed, child_size) = self.freeze_tree(
                        branch,
                        &entry.ptr,
                        temp_ids,
                        writer,
                        nonce_seed,
                        out,
                    )?;
                    if child_changed {
                        entry.ptr = child_ptr;
                        if matches!(entry.entry_type, EntryType::File | EntryType::Exec) {
                            entry.size = child_size;
                            entry.mtime_ms = writer.local_time_ms;
                        }
                        changed = true;
                    }
                }
                if !changed {
                    return Ok((ptr.clone(), false, 0));
                }
                (Block::Dir(db), 0)
            }
        };

        let mut finished = finished;
        let encoded = wire::encode_block(&finished)?;
        finished.common_mut().set_encoded_size(encoded.len() as u32);

        // content dedup for direct file blocks
        if let Block::File(fb) = &finished {
            let known = self.cfg.cache.check_for_known_ptr(self.tlf, fb);
            if known.is_initialized() && !temp_ids.contains(&known.id) {
                let nonce = match nonce_seed {
                    Some(seed) => RefNonce::derived(seed, &known.id),
                    None => RefNonce::random(),
                };
                let mut new_ptr = known;
                new_ptr.context.ref_nonce = nonce;
                out.ref_adds.push(new_ptr.clone());
                if temp_ids.contains(&ptr.id) {
                    out.created.push((ptr.clone(), new_ptr.clone()));
                } else {
                    out.replaced.push((ptr.clone(), new_ptr.clone()));
                }
                out.promoted.push((ptr.clone(), new_ptr.clone(), finished));
                return Ok((new_ptr, true, size));
            }
        }

        let ciphertext = self.cfg.crypter.encrypt(self.tlf, KeyGen::FIRST, &encoded)?;
        let id = BlockId::hash_of(&ciphertext);
        let nonce = match nonce_seed {
            Some(seed) => RefNonce::derived(seed, &id),
            None => RefNonce::ZERO,
        };
        let new_ptr = BlockPointer {
            id,
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            context: BlockContext::for_writer(writer.writer.clone()).with_nonce(nonce),
        };
        out.uploads.push((new_ptr.clone(), ciphertext));
        if temp_ids.contains(&ptr.id) {
            out.created.push((ptr.clone(), new_ptr.clone()));
        } else {
            out.replaced.push((ptr.clone(), new_ptr.clone()));
        }
        out.promoted.push((ptr.clone(), new_ptr.clone(), finished));
        Ok((new_ptr, true, size))
    }

    /// Map every entry pointer id under `root` to its path. Blocks that
    /// cannot be loaded are skipped, so a partial cache degrades the map
    /// instead of failing the caller.
    pub(crate) fn collect_tree_paths(
        &self,
        root: &BlockPointer,
        prefix: &mut Vec<String>,
        out: &mut HashMap<BlockId, Vec<String>>,
    ) {
        let Ok(block) = self.load_block(root, Branch::Master) else {
            return;
        };
        let Block::Dir(dir) = block.as_ref() else {
            return;
        };
        for (name, entry) in &dir.children {
            if !entry.ptr.is_initialized() {
                continue;
            }
            prefix.push(name.clone());
            out.insert(entry.ptr.id, prefix.clone());
            if entry.entry_type == EntryType::Dir {
                self.collect_tree_paths(&entry.ptr, prefix, out);
            }
            prefix.pop();
        }
    }

    /// Re-derive each op's affected path from the revision's committed
    /// tree. The wire format carries no path bookkeeping, so this is the
    /// only way a device that did not author the revision can name what
    /// changed. An op whose anchor block is no longer in the tree keeps
    /// whatever path it already carries.
    pub(crate) fn ops_with_paths(&self, revision: &Revision) -> Vec<Op> {
        let mut paths: HashMap<BlockId, Vec<String>> = HashMap::new();
        paths.insert(revision.new_root.id, Vec::new());
        self.collect_tree_paths(&revision.new_root, &mut Vec::new(), &mut paths);

        // pointer lineage within the batch: an op's anchor may have been
        // rewritten again by a later op in the same revision
        let mut newer: HashMap<BlockId, BlockId> = HashMap::new();
        for op in &revision.ops {
            for update in op.all_updates() {
                if update.is_complete() {
                    newer.insert(update.unref.id, update.new_ref.id);
                }
            }
        }

        let mut ops = revision.ops.clone();
        for op in ops.iter_mut() {
            let anchor = match &*op {
                Op::Create(o) => o.dir.most_recent().id,
                Op::Rm(o) => o.dir.most_recent().id,
                Op::Rename(o) => o.old_dir.most_recent().id,
                Op::SetAttr(o) => o.dir.most_recent().id,
                Op::Sync(o) => o.file.most_recent().id,
                Op::Resolution(_) | Op::Rekey(_) | Op::Gc(_) => continue,
            };
            let mut id = anchor;
            let mut hops = 0;
            while !paths.contains_key(&id) && hops < 64 {
                match newer.get(&id) {
                    Some(next) => {
                        id = *next;
                        hops += 1;
                    }
                    None => break,
                }
            }
            if let Some(path) = paths.get(&id) {
                op.set_final_path(path.clone());
            }
        }
        ops
    }

    /// Revision-level invariants: per-op ref/unref disjointness and no two
    /// updates sharing one unref.
    pub(crate) fn validate_batch(ops: &[Op]) -> Result<(), ChainError> {
        let mut seen_unrefs: HashSet<BlockPointer> = HashSet::new();
        for op in ops {
            if !op.check_valid() {
                return Err(ChainError::InvalidBatch("ref and unref lists overlap"));
            }
            for update in op.all_updates() {
                if update.is_complete() && !seen_unrefs.insert(update.unref.clone()) {
                    return Err(ChainError::InvalidBatch("two updates share one unref"));
                }
            }
        }
        Ok(())
    }

    /// Package pending ops into a signed revision and submit it. A master
    /// conflict forks onto an unmerged branch; the caller never sees it.
    pub fn sync(&self, cancel: &CancelFlag) -> Result<Option<RevisionNumber>, ChainError> {
        let mut state = self.lock();
        self.check_writable(&state)?;
        if state.pending.is_empty() && state.gc_pending.is_empty() {
            return Ok(state.head);
        }
        cancel.check()?;

        let branch = state.branch;
        let writer_info = self.writer_info();
        for op in state.pending.iter_mut() {
            op.set_writer(writer_info.clone());
        }

        let mut out = FreezeOut::default();
        let root = state.root.clone();
        let temp_ids = state.temp_ids.clone();
        let new_root = if root.is_initialized() {
            let (new_root, _, _) =
                self.freeze_tree(branch, &root, &temp_ids, &writer_info, None, &mut out)?;
            new_root
        } else {
            root
        };

        if let Err(group_err) = put_blocks(
            self.cfg.block_server.as_ref(),
            self.tlf,
            &out.uploads,
            self.cfg.config.limits.max_parallel_block_puts,
            cancel,
        ) {
            state.gc_pending.extend(group_err.uploaded);
            warn!(tlf = %self.tlf, error = %group_err.cause, "sync aborted during block upload");
            return Err(ChainError::Server(group_err.cause));
        }
        for ptr in &out.ref_adds {
            self.cfg
                .block_server
                .add_reference(self.tlf, ptr.id, ptr.ref_nonce())?;
        }

        // weave the new pointers into the pending ops
        let mut ops = std::mem::take(&mut state.pending);
        if !ops.is_empty() {
            for (old, new) in &out.replaced {
                let idx = ops
                    .iter()
                    .position(|op| {
                        op.primary_slots()
                            .iter()
                            .any(|s| s.is_set() && s.unref == *old)
                    })
                    .unwrap_or(ops.len() - 1);
                ops[idx].add_update(old.clone(), new.clone());
            }
            for (old, new) in &out.created {
                let idx = state
                    .temp_owner
                    .get(&old.id)
                    .copied()
                    .unwrap_or(ops.len() - 1);
                let idx = idx.min(ops.len() - 1);
                ops[idx].add_ref_block(new.clone());
                // fold the temp-to-final pointer change into the one op whose
                // primary slot tracks this block, so chains stay linked
                if let Some(idx) = ops.iter().position(|op| {
                    op.primary_slots()
                        .iter()
                        .any(|s| s.is_set() && s.unref == *old)
                }) {
                    ops[idx].add_update(old.clone(), new.clone());
                }
            }
        }
        if !state.gc_pending.is_empty() {
            // a retried sync reproduces the same content-addressed ids, so
            // blocks this revision references must not be collected
            let live: HashSet<BlockId> = out
                .uploads
                .iter()
                .map(|(ptr, _)| ptr.id)
                .chain(out.ref_adds.iter().map(|ptr| ptr.id))
                .collect();
            state.gc_pending.retain(|ptr| !live.contains(&ptr.id));
        }
        if !state.gc_pending.is_empty() {
            let mut gc = Op::Gc(GcOp::new(state.head.unwrap_or(RevisionNumber::INITIAL)));
            for ptr in state.gc_pending.drain(..) {
                gc.add_unref_block(ptr);
            }
            gc.set_writer(writer_info.clone());
            ops.push(gc);
        }
        if ops.is_empty() {
            return Ok(state.head);
        }
        Self::validate_batch(&ops)?;

        let revision = Revision {
            prev: state.head_hash,
            revision: state.head.map(RevisionNumber::next).unwrap_or(RevisionNumber::INITIAL),
            branch,
            ops,
            new_root: new_root.clone(),
            writer: writer_info.clone(),
            signature: None,
            unknown: UnknownFields::default(),
        };
        let revision = self.sign(revision)?;

        match branch {
            Branch::Master => match self.cfg.md_server.put(self.tlf, revision.clone())? {
                PutOutcome::Accepted => {
                    self.commit_local(&mut state, revision.clone(), branch, &out);
                }
                PutOutcome::Conflict { head } => {
                    let branch_id = BranchId::generate();
                    warn!(
                        tlf = %self.tlf,
                        server_head = %head,
                        branch = %branch_id,
                        "master moved; continuing on unmerged branch"
                    );
                    let mut forked = revision;
                    forked.branch = Branch::Unmerged(branch_id);
                    let forked = self.sign(forked)?;
                    self.cfg.md_server.put_unmerged(self.tlf, forked.clone())?;
                    state.fork_master_head = state.head;
                    state.fork_master_root = state.committed_root.clone();
                    state.branch = Branch::Unmerged(branch_id);
                    state.unmerged_revs.push(forked.clone());
                    self.commit_local(&mut state, forked, branch, &out);
                }
            },
            Branch::Unmerged(_) => {
                self.cfg.md_server.put_unmerged(self.tlf, revision.clone())?;
                state.unmerged_revs.push(revision.clone());
                self.commit_local(&mut state, revision, branch, &out);
            }
        }
        Ok(state.head)
    }

    pub(crate) fn sign(&self, mut revision: Revision) -> Result<Revision, ChainError> {
        let signable = revision.signable_bytes(&self.cfg.config.limits)?;
        revision.signature = Some(self.cfg.crypter.sign(&signable)?);
        Ok(revision)
    }

    fn commit_local(
        &self,
        state: &mut FolderState,
        revision: Revision,
        sync_branch: Branch,
        out: &FreezeOut,
    ) {
        let old_root = state.committed_root.clone();
        for (old, new, block) in &out.promoted {
            self.cfg.cache.delete_dirty(old, sync_branch);
            let lifetime = if *new == revision.new_root {
                CacheLifetime::Permanent
            } else {
                CacheLifetime::Transient
            };
            self.cfg.cache.put(new, self.tlf, block.clone(), lifetime);
        }
        if old_root.is_initialized() && old_root.id != revision.new_root.id {
            self.cfg.cache.delete_permanent(old_root.id);
        }
        state.temp_ids.clear();
        state.temp_owner.clear();
        state.head = Some(revision.revision);
        state.head_hash = revision.hash(&self.cfg.config.limits).ok();
        state.head_writer = Some(revision.writer.writer.clone());
        state.root = revision.new_root.clone();
        state.committed_root = revision.new_root.clone();
        debug!(tlf = %self.tlf, revision = %revision.revision, branch = %revision.branch, "committed revision");
        self.cfg
            .notifier
            .batch_changes(self.tlf, &changes_from_ops(&self.ops_with_paths(&revision)));
    }

    /// Fetch and verify a revision range: contiguous numbering, chain-hash
    /// linkage, and a valid signature on every revision.
    pub(crate) fn fetch_and_verify(
        &self,
        branch: Branch,
        from: RevisionNumber,
        to: RevisionNumber,
        prev_hash: Option<RevisionHash>,
    ) -> Result<Vec<Revision>, ChainError> {
        let revs = self.cfg.md_server.get_range(self.tlf, branch, from, to)?;
        let limits = &self.cfg.config.limits;
        let mut expected = from;
        let mut prev = prev_hash;
        for rev in &revs {
            if rev.revision != expected {
                return Err(ChainError::ChainBroken(rev.revision));
            }
            if prev.is_some() && rev.prev != prev {
                return Err(ChainError::ChainBroken(rev.revision));
            }
            let Some(signature) = &rev.signature else {
                return Err(ChainError::SignatureInvalid(rev.revision));
            };
            let signable = rev.signable_bytes(limits)?;
            self.cfg
                .crypter
                .verify(&signable, signature, &rev.writer.writer)
                .map_err(|_| ChainError::SignatureInvalid(rev.revision))?;
            prev = Some(rev.hash(limits)?);
            expected = expected.next();
        }
        Ok(revs)
    }

    /// Apply committed master updates. While staged, only notes how far
    /// master has moved; conflict resolution owns the rejoin.
    pub fn poll_updates(&self, cancel: &CancelFlag) -> Result<usize, ChainError> {
        let needs_resolution = {
            let mut state = self.lock();
            if state.updates_paused {
                return Ok(0);
            }
            if !state.branch.is_master() {
                let master_head = self.cfg.md_server.head(self.tlf, Branch::Master)?;
                master_head > state.fork_master_head
            } else {
                let Some(server_head) = self.cfg.md_server.head(self.tlf, Branch::Master)? else {
                    return Ok(0);
                };
                let from = state
                    .head
                    .map(RevisionNumber::next)
                    .unwrap_or(RevisionNumber::INITIAL);
                if server_head.get() < from.get() {
                    return Ok(0);
                }
                let revs =
                    match self.fetch_and_verify(Branch::Master, from, server_head, state.head_hash)
                    {
                        Ok(revs) => revs,
                        Err(err @ (ChainError::ChainBroken(_) | ChainError::SignatureInvalid(_))) => {
                            state.read_only = true;
                            return Err(err);
                        }
                        Err(err) => return Err(err),
                    };
                let applied = revs.len();
                // replay each revision's ops against its own committed tree
                let mut changes = Vec::new();
                for rev in &revs {
                    changes.extend(changes_from_ops(&self.ops_with_paths(rev)));
                }
                if let Some(last) = revs.last() {
                    state.head = Some(last.revision);
                    state.head_hash = Some(last.hash(&self.cfg.config.limits)?);
                    state.head_writer = Some(last.writer.writer.clone());
                    state.root = last.new_root.clone();
                    state.committed_root = last.new_root.clone();
                }
                drop(state);
                self.cfg.notifier.batch_changes(self.tlf, &changes);
                return Ok(applied);
            }
        };
        if needs_resolution {
            self.resolve_conflicts(cancel)?;
            return Ok(1);
        }
        Ok(0)
    }

    /// Abandon this device's unmerged branch and rejoin master as-is.
    pub fn unstage(&self) -> Result<(), ChainError> {
        let mut state = self.lock();
        let Branch::Unmerged(branch_id) = state.branch else {
            return Ok(());
        };
        warn!(tlf = %self.tlf, branch = %branch_id, "unstaging local branch");
        self.cfg.cache.drop_dirty_branch(state.branch);
        self.cfg.md_server.prune_unmerged(self.tlf, branch_id)?;
        state.branch = Branch::Master;
        state.pending.clear();
        state.temp_ids.clear();
        state.temp_owner.clear();
        state.unmerged_revs.clear();
        state.fork_master_head = None;
        state.fork_master_root = BlockPointer::default();

        // rewind to master and re-apply the server's view
        let head = self.cfg.md_server.head(self.tlf, Branch::Master)?;
        state.head = None;
        state.head_hash = None;
        state.root = BlockPointer::default();
        state.committed_root = BlockPointer::default();
        if let Some(head) = head {
            let revs = self.fetch_and_verify(Branch::Master, RevisionNumber::INITIAL, head, None)?;
            if let Some(last) = revs.last() {
                state.head = Some(last.revision);
                state.head_hash = Some(last.hash(&self.cfg.config.limits)?);
                state.head_writer = Some(last.writer.writer.clone());
                state.root = last.new_root.clone();
                state.committed_root = last.new_root.clone();
            }
        }
        Ok(())
    }

    /// Run conflict resolution if this folder is staged.
    pub fn resolve_conflicts(&self, cancel: &CancelFlag) -> Result<(), ChainError> {
        crate::cr::resolve(self, cancel)
    }
}
