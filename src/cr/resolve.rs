//! The resolution pass: action selection, replay, and publish.

use std::collections::{HashMap, HashSet};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::chains::ChainSet;
use crate::cache::CacheLifetime;
use crate::core::block::{
    Block, BlockContext, BlockId, BlockPointer, DirBlock, DirEntry, EntryType, FileBlock,
};
use crate::core::identity::{Branch, BranchId, DataVer, DeviceName, KeyGen, WriterInfo, WriterName};
use crate::core::ops::{
    AttrKind, CreateOp, Op, RekeyOp, RenameOp, ResolutionOp, RmOp, SetAttrOp, SyncOp, WriteRange,
};
use crate::core::revision::{Revision, RevisionNumber};
use crate::core::time::format_conflict_date;
use crate::core::wire::UnknownFields;
use crate::folder::{ChainError, FolderOps, FreezeOut};
use crate::server::PutOutcome;
use crate::task::{put_blocks, CancelFlag};

/// The canonical conflicted-copy name, with an integer suffix on repeat
/// collisions within one resolution.
pub fn conflict_name(
    base: &str,
    writer: &WriterName,
    device: &DeviceName,
    date_ms: u64,
    taken: impl Fn(&str) -> bool,
) -> String {
    let stem = format!(
        "{} (conflicted copy from {} {} on {})",
        base,
        writer,
        device,
        format_conflict_date(date_ms)
    );
    if !taken(&stem) {
        return stem;
    }
    let mut n = 2u64;
    loop {
        let candidate = format!("{} {}", stem, n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

enum Outcome {
    Done,
    NotStaged,
    Retry,
}

/// Run conflict resolution until the folder rejoins master, retrying when
/// master advances mid-publish.
pub fn resolve(folder: &FolderOps, cancel: &CancelFlag) -> Result<(), ChainError> {
    for attempt in 0..folder.cfg.config.limits.max_resolution_attempts {
        match resolve_once(folder, cancel)? {
            Outcome::Done => {
                if attempt > 0 {
                    debug!(tlf = %folder.tlf(), attempt, "resolution succeeded after retry");
                }
                return Ok(());
            }
            Outcome::NotStaged => return Ok(()),
            Outcome::Retry => continue,
        }
    }
    Err(ChainError::ResolutionStuck(folder.tlf()))
}

/// Copy-on-write view of the resolved tree: the master head tree plus dirty
/// overlays keyed under the unmerged branch.
struct Scratch<'a> {
    folder: &'a FolderOps,
    branch: Branch,
    branch_id: BranchId,
    root: BlockPointer,
    temp_ids: HashSet<BlockId>,
    unrefs: Vec<BlockPointer>,
    minted: u64,
}

impl<'a> Scratch<'a> {
    fn new(folder: &'a FolderOps, branch_id: BranchId, root: BlockPointer) -> Self {
        Self {
            folder,
            branch: Branch::Unmerged(branch_id),
            branch_id,
            root,
            temp_ids: HashSet::new(),
            unrefs: Vec::new(),
            minted: 0,
        }
    }

    /// Scratch block ids derive from the branch id, so a re-run mints the
    /// same sequence.
    fn mint_temp(&mut self) -> BlockPointer {
        self.minted += 1;
        let mut hasher = Sha256::new();
        hasher.update(b"resolution-temp");
        hasher.update(self.branch_id.as_bytes());
        hasher.update(self.minted.to_be_bytes());
        let out = hasher.finalize();
        let mut raw = [0u8; 32];
        raw.copy_from_slice(&out);
        let ptr = BlockPointer {
            id: BlockId::new(raw),
            key_gen: KeyGen::FIRST,
            data_ver: DataVer::FIRST,
            context: BlockContext::for_writer(self.folder.writer.clone()),
        };
        self.temp_ids.insert(ptr.id);
        ptr
    }

    fn load_dir(&self, ptr: &BlockPointer) -> Result<DirBlock, ChainError> {
        match self.folder.load_block(ptr, self.branch)?.as_ref() {
            Block::Dir(db) => Ok(db.clone()),
            Block::File(_) => Err(ChainError::NotADirectory(ptr.to_string())),
        }
    }

    fn put_dir(&self, ptr: &BlockPointer, dir: DirBlock) {
        self.folder
            .cfg
            .cache
            .put_dirty(ptr, self.branch, Block::Dir(dir));
    }

    /// Pointer chain from the root to the directory at `path`, creating any
    /// directory the merged branch deleted along the way.
    fn walk_dirs(&mut self, path: &[String]) -> Result<Vec<BlockPointer>, ChainError> {
        let mut chain = vec![self.root.clone()];
        let mut current = self.root.clone();
        for component in path {
            let mut dir = self.load_dir(&current)?;
            let entry_ptr = match dir.children.get(component) {
                Some(entry) if entry.entry_type == EntryType::Dir => entry.ptr.clone(),
                Some(_) => return Err(ChainError::NotADirectory(component.clone())),
                None => {
                    // merged deleted a directory the unmerged side still
                    // writes into; recreate it
                    let ptr = self.mint_temp();
                    self.folder
                        .cfg
                        .cache
                        .put_dirty(&ptr, self.branch, Block::Dir(DirBlock::new()));
                    let entry = DirEntry::new(ptr.clone(), EntryType::Dir);
                    dir.children.insert(component.clone(), entry);
                    self.put_dir(&current, dir);
                    ptr
                }
            };
            current = entry_ptr;
            chain.push(current.clone());
        }
        Ok(chain)
    }

    fn get_entry(&mut self, dir_path: &[String], name: &str) -> Result<Option<DirEntry>, ChainError> {
        let chain = self.walk_dirs(dir_path)?;
        let dir = self.load_dir(chain.last().expect("chain includes root"))?;
        Ok(dir.children.get(name).cloned())
    }

    fn insert_entry(
        &mut self,
        dir_path: &[String],
        name: &str,
        entry: DirEntry,
    ) -> Result<(), ChainError> {
        let chain = self.walk_dirs(dir_path)?;
        let ptr = chain.last().expect("chain includes root").clone();
        let mut dir = self.load_dir(&ptr)?;
        if let Some(displaced) = dir.children.insert(name.to_string(), entry) {
            if displaced.ptr.is_initialized() && !self.temp_ids.contains(&displaced.ptr.id) {
                self.unrefs.push(displaced.ptr);
            }
        }
        self.put_dir(&ptr, dir);
        Ok(())
    }

    fn remove_entry(
        &mut self,
        dir_path: &[String],
        name: &str,
    ) -> Result<Option<DirEntry>, ChainError> {
        let chain = self.walk_dirs(dir_path)?;
        let ptr = chain.last().expect("chain includes root").clone();
        let mut dir = self.load_dir(&ptr)?;
        let removed = dir.children.remove(name);
        if removed.is_some() {
            self.put_dir(&ptr, dir);
        }
        Ok(removed)
    }

    /// Create a node with the given content; returns its scratch pointer.
    fn create_node(
        &mut self,
        dir_path: &[String],
        name: &str,
        entry_type: EntryType,
        contents: Vec<u8>,
        sym_path: Option<String>,
        mtime_ms: u64,
    ) -> Result<BlockPointer, ChainError> {
        let mut ptr = BlockPointer::default();
        if entry_type != EntryType::Sym {
            ptr = self.mint_temp();
            let block = match entry_type {
                EntryType::Dir => Block::Dir(DirBlock::new()),
                _ => Block::File(FileBlock::with_contents(contents)),
            };
            self.folder.cfg.cache.put_dirty(&ptr, self.branch, block);
        }
        let mut entry = DirEntry::new(ptr.clone(), entry_type);
        entry.mtime_ms = mtime_ms;
        entry.sym_path = sym_path;
        self.insert_entry(dir_path, name, entry)?;
        Ok(ptr)
    }

    /// Replace the content of an existing file entry.
    fn write_file(
        &mut self,
        dir_path: &[String],
        name: &str,
        contents: Vec<u8>,
    ) -> Result<BlockPointer, ChainError> {
        let entry = self
            .get_entry(dir_path, name)?
            .ok_or_else(|| ChainError::NotFound(name.to_string()))?;
        self.folder.cfg.cache.put_dirty(
            &entry.ptr,
            self.branch,
            Block::File(FileBlock::with_contents(contents)),
        );
        Ok(entry.ptr)
    }

    fn dir_names(&mut self, dir_path: &[String]) -> Result<HashSet<String>, ChainError> {
        let chain = self.walk_dirs(dir_path)?;
        let dir = self.load_dir(chain.last().expect("chain includes root"))?;
        Ok(dir.children.keys().cloned().collect())
    }

    fn update_entry(
        &mut self,
        dir_path: &[String],
        name: &str,
        apply: impl FnOnce(&mut DirEntry),
    ) -> Result<(), ChainError> {
        let chain = self.walk_dirs(dir_path)?;
        let ptr = chain.last().expect("chain includes root").clone();
        let mut dir = self.load_dir(&ptr)?;
        let entry = dir
            .children
            .get_mut(name)
            .ok_or_else(|| ChainError::NotFound(name.to_string()))?;
        apply(entry);
        self.put_dir(&ptr, dir);
        Ok(())
    }
}

/// Where an unmerged node lives in the resolved tree.
#[derive(Clone, Debug)]
struct NodeTarget {
    path: Vec<String>,
    /// The node's identity in the merged chains, when both branches can see
    /// it; drives conflict checks.
    merged_id: Option<BlockId>,
}

struct NodeMap {
    map: HashMap<BlockId, NodeTarget>,
    root_original: BlockId,
}

impl NodeMap {
    fn record(&mut self, unmerged_chains: &ChainSet, id: BlockId, target: NodeTarget) {
        self.map.insert(unmerged_chains.original_of(id), target);
    }

    fn target_for(
        &self,
        unmerged_chains: &ChainSet,
        merged_chains: &ChainSet,
        master_paths: &HashMap<BlockId, Vec<String>>,
        id: BlockId,
    ) -> Option<NodeTarget> {
        let original = unmerged_chains.original_of(id);
        if original == self.root_original {
            return Some(NodeTarget {
                path: Vec::new(),
                merged_id: Some(original),
            });
        }
        if let Some(target) = self.map.get(&original) {
            return Some(target.clone());
        }
        // base node: find it in the master head tree, following any merged
        // rename of its lineage
        let merged_final = merged_chains
            .chain_for(original)
            .map(|c| c.most_recent.id)
            .unwrap_or(original);
        master_paths.get(&merged_final).map(|path| NodeTarget {
            path: path.clone(),
            merged_id: Some(original),
        })
    }
}

fn split_target(path: &[String]) -> (Vec<String>, String) {
    let mut dir = path.to_vec();
    let name = dir.pop().unwrap_or_default();
    (dir, name)
}

/// Pick a conflicted-copy name that is free both in the resolved directory
/// and among names already minted this resolution.
fn pick_conflict_name(
    scratch: &mut Scratch<'_>,
    minted: &mut HashSet<(Vec<String>, String)>,
    dir_path: &[String],
    base: &str,
    attribution: &WriterInfo,
) -> Result<String, ChainError> {
    let existing = scratch.dir_names(dir_path)?;
    let name = conflict_name(
        base,
        &attribution.writer,
        &attribution.device,
        attribution.local_time_ms,
        |candidate| {
            existing.contains(candidate)
                || minted.contains(&(dir_path.to_vec(), candidate.to_string()))
        },
    );
    minted.insert((dir_path.to_vec(), name.clone()));
    Ok(name)
}

/// A rewritten name-level op; primary slots stay empty, the resolution op
/// carries the pointer delta.
fn rewritten_create(name: String, entry_type: EntryType, parent_path: &[String]) -> Op {
    let mut op = Op::Create(CreateOp::new(name, BlockPointer::default(), entry_type));
    op.set_final_path(parent_path.to_vec());
    op
}

fn same_category(a: EntryType, b: EntryType) -> bool {
    a == b
}

fn resolve_once(folder: &FolderOps, cancel: &CancelFlag) -> Result<Outcome, ChainError> {
    let mut state = folder.lock();
    let Branch::Unmerged(branch_id) = state.branch else {
        return Ok(Outcome::NotStaged);
    };
    cancel.check()?;
    let limits = folder.cfg.config.limits.clone();
    let tlf = folder.tlf();

    let unmerged_revs = state.unmerged_revs.clone();
    if unmerged_revs.is_empty() {
        drop(state);
        folder.unstage()?;
        return Ok(Outcome::Done);
    }
    let fork_head = state.fork_master_head;

    // master tail since the fork
    let master_head = folder.cfg.md_server.head(tlf, Branch::Master)?;
    let merged_revs: Vec<Revision> = match (fork_head, master_head) {
        (Some(fork), Some(head)) if head > fork => {
            folder.fetch_and_verify(Branch::Master, fork.next(), head, None)?
        }
        (None, Some(head)) => {
            folder.fetch_and_verify(Branch::Master, RevisionNumber::INITIAL, head, None)?
        }
        _ => Vec::new(),
    };
    let Some(master_head) = master_head else {
        // cannot be staged without a master; treat as already resolved
        return Ok(Outcome::NotStaged);
    };
    let (master_root, master_prev_hash) = match merged_revs.last() {
        Some(last) => (last.new_root.clone(), last.hash(&limits)?),
        None => {
            let head_rev = folder
                .cfg
                .md_server
                .get_range(tlf, Branch::Master, master_head, master_head)?
                .pop()
                .ok_or(ChainError::ChainBroken(master_head))?;
            (head_rev.new_root.clone(), head_rev.hash(&limits)?)
        }
    };

    info!(
        %tlf,
        branch = %branch_id,
        unmerged = unmerged_revs.len(),
        merged = merged_revs.len(),
        "resolving conflict"
    );

    let unmerged_chains = ChainSet::build(&unmerged_revs);
    let merged_chains = ChainSet::build(&merged_revs);
    let last_unmerged = unmerged_revs.last().expect("checked non-empty");
    let root_original =
        unmerged_chains.original_of(last_unmerged.new_root.id);

    let mut master_paths = HashMap::new();
    folder.collect_tree_paths(&master_root, &mut Vec::new(), &mut master_paths);

    let mut scratch = Scratch::new(folder, branch_id, master_root.clone());
    let mut node_map = NodeMap {
        map: HashMap::new(),
        root_original,
    };

    // conflict-copy attribution: the writer info of the first op the
    // unmerged branch synced
    let cr_writer = unmerged_revs[0].writer.clone();
    // deterministic timestamps for frozen blocks, so re-runs are identical
    let freeze_writer = WriterInfo::new(
        folder.writer.clone(),
        folder.device.clone(),
        last_unmerged.writer.local_time_ms,
    );

    // collapse every file's writes across the branch's syncs up front
    let mut file_writes: HashMap<BlockId, Vec<WriteRange>> = HashMap::new();
    for rev in &unmerged_revs {
        for op in &rev.ops {
            if let Op::Sync(sync_op) = op {
                let original = unmerged_chains.original_of(sync_op.file.unref.id);
                let prior = file_writes.remove(&original).unwrap_or_default();
                file_writes.insert(original, sync_op.collapse_write_range(prior));
            }
        }
    }

    let mut rewritten: Vec<Op> = Vec::new();
    let mut synced_files: HashSet<BlockId> = HashSet::new();
    let mut minted_names: HashSet<(Vec<String>, String)> = HashSet::new();
    let mut unmerged_has_rekey = false;

    let unmerged_ops: Vec<&Op> = unmerged_revs.iter().flat_map(|r| r.ops.iter()).collect();
    for op in &unmerged_ops {
        cancel.check()?;
        match op {
            Op::Create(inner) => {
                let parent = node_map
                    .target_for(
                        &unmerged_chains,
                        &merged_chains,
                        &master_paths,
                        inner.dir.unref.id,
                    )
                    .or_else(|| {
                        // the merged branch deleted the parent directory;
                        // recreate it along the path the op recorded
                        let recorded = &inner.common.final_path;
                        (!recorded.is_empty()).then(|| NodeTarget {
                            path: recorded.clone(),
                            merged_id: None,
                        })
                    });
                let Some(parent) = parent else {
                    continue;
                };
                let name = inner.new_name.clone();
                let node_path = {
                    let mut p = parent.path.clone();
                    p.push(name.clone());
                    p
                };
                let existing = scratch.get_entry(&parent.path, &name)?;
                match existing {
                    None => {
                        scratch.create_node(
                            &parent.path,
                            &name,
                            inner.entry_type,
                            Vec::new(),
                            inner.sym_path.clone(),
                            freeze_writer.local_time_ms,
                        )?;
                        for r in &inner.common.ref_blocks {
                            node_map.record(
                                &unmerged_chains,
                                r.id,
                                NodeTarget {
                                    path: node_path.clone(),
                                    merged_id: None,
                                },
                            );
                        }
                        let mut new_op =
                            rewritten_create(name.clone(), inner.entry_type, &parent.path);
                        if let Op::Create(c) = &mut new_op {
                            c.sym_path = inner.sym_path.clone();
                        }
                        rewritten.push(new_op);
                    }
                    Some(entry) if same_category(entry.entry_type, inner.entry_type) => {
                        // both branches created the same name with the same
                        // type: one node survives, unmerged edits flow into it
                        for r in &inner.common.ref_blocks {
                            node_map.record(
                                &unmerged_chains,
                                r.id,
                                NodeTarget {
                                    path: node_path.clone(),
                                    merged_id: Some(merged_chains.original_of(entry.ptr.id)),
                                },
                            );
                        }
                    }
                    Some(_) => {
                        // same name, different type: merged keeps the name
                        let cname = pick_conflict_name(
                            &mut scratch,
                            &mut minted_names,
                            &parent.path,
                            &name,
                            &cr_writer,
                        )?;
                        scratch.create_node(
                            &parent.path,
                            &cname,
                            inner.entry_type,
                            Vec::new(),
                            inner.sym_path.clone(),
                            freeze_writer.local_time_ms,
                        )?;
                        let renamed_path = {
                            let mut p = parent.path.clone();
                            p.push(cname.clone());
                            p
                        };
                        for r in &inner.common.ref_blocks {
                            node_map.record(
                                &unmerged_chains,
                                r.id,
                                NodeTarget {
                                    path: renamed_path.clone(),
                                    merged_id: None,
                                },
                            );
                        }
                        rewritten.push(rewritten_create(cname, inner.entry_type, &parent.path));
                    }
                }
            }
            Op::Sync(inner) => {
                let original = unmerged_chains.original_of(inner.file.unref.id);
                if !synced_files.insert(original) {
                    continue;
                }
                let Some(target) = node_map.target_for(
                    &unmerged_chains,
                    &merged_chains,
                    &master_paths,
                    original,
                ) else {
                    continue;
                };
                let final_ptr = unmerged_chains
                    .chain_for(original)
                    .map(|c| c.most_recent.clone())
                    .unwrap_or_else(|| inner.file.unref.clone());
                let contents = match folder
                    .load_block(&final_ptr, Branch::Unmerged(branch_id))?
                    .as_ref()
                {
                    Block::File(fb) => fb.contents.clone(),
                    Block::Dir(_) => continue,
                };
                let writes = file_writes.remove(&original).unwrap_or_default();
                let (dir_path, name) = split_target(&target.path);
                let merged_wrote = target
                    .merged_id
                    .map(|m| merged_chains.wrote_node(m))
                    .unwrap_or(false);
                if merged_wrote {
                    // both wrote: merged keeps the name, unmerged content
                    // lands in a conflicted-copy sibling
                    let cname = pick_conflict_name(
                        &mut scratch,
                        &mut minted_names,
                        &dir_path,
                        &name,
                        &cr_writer,
                    )?;
                    let entry_type = scratch
                        .get_entry(&dir_path, &name)?
                        .map(|e| e.entry_type)
                        .unwrap_or(EntryType::File);
                    let ptr = scratch.create_node(
                        &dir_path,
                        &cname,
                        entry_type,
                        contents,
                        None,
                        freeze_writer.local_time_ms,
                    )?;
                    let mut conflicted_path = dir_path.clone();
                    conflicted_path.push(cname.clone());
                    node_map.record(
                        &unmerged_chains,
                        original,
                        NodeTarget {
                            path: conflicted_path.clone(),
                            merged_id: None,
                        },
                    );
                    rewritten.push(rewritten_create(cname, entry_type, &dir_path));
                    let mut sync_op = SyncOp::new(ptr);
                    sync_op.writes = writes;
                    let mut sync_op = Op::Sync(sync_op);
                    sync_op.set_final_path(conflicted_path);
                    rewritten.push(sync_op);
                } else {
                    let ptr = scratch.write_file(&dir_path, &name, contents)?;
                    let mut sync_op = SyncOp::new(ptr);
                    sync_op.writes = writes;
                    let mut sync_op = Op::Sync(sync_op);
                    sync_op.set_final_path(target.path.clone());
                    rewritten.push(sync_op);
                }
            }
            Op::Rm(inner) => {
                let removed_id = op
                    .common()
                    .unref_blocks
                    .first()
                    .map(|p| unmerged_chains.original_of(p.id));
                if let Some(id) = removed_id {
                    if merged_chains.touched_node(id) {
                        // modified remotely; the delete loses
                        continue;
                    }
                }
                let Some(parent) = node_map.target_for(
                    &unmerged_chains,
                    &merged_chains,
                    &master_paths,
                    inner.dir.unref.id,
                ) else {
                    continue;
                };
                if let Some(removed) = scratch.remove_entry(&parent.path, &inner.old_name)? {
                    if removed.ptr.is_initialized() && !scratch.temp_ids.contains(&removed.ptr.id) {
                        scratch.unrefs.push(removed.ptr);
                    }
                    let mut new_op =
                        Op::Rm(RmOp::new(inner.old_name.clone(), BlockPointer::default()));
                    if let Op::Rm(r) = &mut new_op {
                        r.removed_dir = inner.removed_dir;
                    }
                    new_op.set_final_path(parent.path.clone());
                    rewritten.push(new_op);
                }
            }
            Op::Rename(inner) => {
                let original = unmerged_chains.original_of(inner.renamed.id);
                let dest_slot = if inner.new_dir.is_set() {
                    &inner.new_dir
                } else {
                    &inner.old_dir
                };
                let Some(dest_parent) = node_map.target_for(
                    &unmerged_chains,
                    &merged_chains,
                    &master_paths,
                    dest_slot.unref.id,
                ) else {
                    continue;
                };
                let source = node_map.target_for(
                    &unmerged_chains,
                    &merged_chains,
                    &master_paths,
                    original,
                );

                if merged_chains.renamed_node(original) {
                    // merged renamed it too; merged wins, our rename becomes
                    // a copy under a conflicted destination name
                    let Some(source) = source else { continue };
                    let (src_dir, src_name) = split_target(&source.path);
                    let Some(entry) = scratch.get_entry(&src_dir, &src_name)? else {
                        continue;
                    };
                    let cname = pick_conflict_name(
                        &mut scratch,
                        &mut minted_names,
                        &dest_parent.path,
                        &inner.new_name,
                        &cr_writer,
                    )?;
                    scratch.insert_entry(&dest_parent.path, &cname, entry)?;
                    rewritten.push(rewritten_create(cname, inner.renamed_type, &dest_parent.path));
                    continue;
                }

                let missing = match &source {
                    None => true,
                    Some(target) => {
                        let (src_dir, src_name) = split_target(&target.path);
                        scratch.get_entry(&src_dir, &src_name)?.is_none()
                    }
                };
                if missing || merged_chains.removed_node(original) {
                    // rename wins over delete: the entry survives under its
                    // new name, rebuilt from the unmerged content
                    let final_ptr = unmerged_chains
                        .chain_for(original)
                        .map(|c| c.most_recent.clone())
                        .unwrap_or_else(|| inner.renamed.clone());
                    let contents = match inner.renamed_type {
                        EntryType::Dir | EntryType::Sym => Vec::new(),
                        _ => match folder
                            .load_block(&final_ptr, Branch::Unmerged(branch_id))?
                            .as_ref()
                        {
                            Block::File(fb) => fb.contents.clone(),
                            Block::Dir(_) => Vec::new(),
                        },
                    };
                    scratch.create_node(
                        &dest_parent.path,
                        &inner.new_name,
                        inner.renamed_type,
                        contents,
                        None,
                        freeze_writer.local_time_ms,
                    )?;
                    let mut new_path = dest_parent.path.clone();
                    new_path.push(inner.new_name.clone());
                    node_map.record(
                        &unmerged_chains,
                        original,
                        NodeTarget {
                            path: new_path,
                            merged_id: None,
                        },
                    );
                    rewritten.push(rewritten_create(
                        inner.new_name.clone(),
                        inner.renamed_type,
                        &dest_parent.path,
                    ));
                    continue;
                }

                // plain move
                let source = source.expect("checked above");
                let (src_dir, src_name) = split_target(&source.path);
                let Some(entry) = scratch.remove_entry(&src_dir, &src_name)? else {
                    continue;
                };
                let final_name = if scratch.get_entry(&dest_parent.path, &inner.new_name)?.is_some()
                {
                    pick_conflict_name(
                        &mut scratch,
                        &mut minted_names,
                        &dest_parent.path,
                        &inner.new_name,
                        &cr_writer,
                    )?
                } else {
                    inner.new_name.clone()
                };
                scratch.insert_entry(&dest_parent.path, &final_name, entry)?;
                let mut new_path = dest_parent.path.clone();
                new_path.push(final_name.clone());
                node_map.record(
                    &unmerged_chains,
                    original,
                    NodeTarget {
                        path: new_path,
                        merged_id: source.merged_id,
                    },
                );
                let mut new_op = Op::Rename(RenameOp::new(
                    src_name,
                    BlockPointer::default(),
                    final_name,
                    BlockPointer::default(),
                    inner.renamed.clone(),
                    inner.renamed_type,
                ));
                new_op.set_final_path(src_dir);
                rewritten.push(new_op);
            }
            Op::SetAttr(inner) => {
                let original = unmerged_chains.original_of(inner.file.id);
                let Some(target) = node_map.target_for(
                    &unmerged_chains,
                    &merged_chains,
                    &master_paths,
                    original,
                ) else {
                    continue;
                };
                let our_writer = op
                    .common()
                    .writer
                    .clone()
                    .unwrap_or_else(|| cr_writer.clone());
                // latest attribute wins; ties go to the greater device name
                let merged_wins = target
                    .merged_id
                    .and_then(|m| merged_chains.chain_for(m))
                    .map(|chain| {
                        chain.ops.iter().any(|(merged_op, merged_writer)| {
                            matches!(merged_op, Op::SetAttr(sa) if sa.attr == inner.attr)
                                && (merged_writer.local_time_ms, &merged_writer.device)
                                    > (our_writer.local_time_ms, &our_writer.device)
                        })
                    })
                    .unwrap_or(false);
                if merged_wins {
                    continue;
                }
                // copy the final attribute value from the unmerged parent
                let final_dir_ptr = unmerged_chains
                    .chain_for(inner.dir.unref.id)
                    .map(|c| c.most_recent.clone())
                    .unwrap_or_else(|| inner.dir.most_recent().clone());
                let attr_entry = match folder
                    .load_block(&final_dir_ptr, Branch::Unmerged(branch_id))?
                    .as_ref()
                {
                    Block::Dir(db) => db.children.get(&inner.name).cloned(),
                    Block::File(_) => None,
                };
                let Some(attr_entry) = attr_entry else { continue };
                let (dir_path, name) = split_target(&target.path);
                scratch.update_entry(&dir_path, &name, |entry| match inner.attr {
                    AttrKind::Mtime => entry.mtime_ms = attr_entry.mtime_ms,
                    AttrKind::Exec => entry.entry_type = attr_entry.entry_type,
                })?;
                let mut new_op = Op::SetAttr(SetAttrOp::new(
                    name,
                    BlockPointer::default(),
                    inner.attr,
                    inner.file.clone(),
                ));
                new_op.set_final_path(target.path.clone());
                rewritten.push(new_op);
            }
            Op::Rekey(_) => unmerged_has_rekey = true,
            Op::Resolution(_) | Op::Gc(_) => {}
        }
    }

    let merged_has_rekey = merged_revs
        .iter()
        .flat_map(|r| r.ops.iter())
        .any(|op| matches!(op, Op::Rekey(_)));
    if unmerged_has_rekey && !merged_has_rekey {
        rewritten.push(Op::Rekey(RekeyOp::new()));
    }

    // freeze the resolved tree into final content-addressed blocks
    let mut out = FreezeOut::default();
    let (new_root, _, _) = folder.freeze_tree(
        Branch::Unmerged(branch_id),
        &scratch.root,
        &scratch.temp_ids,
        &freeze_writer,
        Some(branch_id.as_bytes()),
        &mut out,
    )?;

    if let Err(group_err) = put_blocks(
        folder.cfg.block_server.as_ref(),
        tlf,
        &out.uploads,
        limits.max_parallel_block_puts,
        cancel,
    ) {
        state.gc_pending.extend(group_err.uploaded);
        warn!(%tlf, error = %group_err.cause, "resolution aborted during block upload");
        return Err(ChainError::Server(group_err.cause));
    }
    for ptr in &out.ref_adds {
        folder
            .cfg
            .block_server
            .add_reference(tlf, ptr.id, ptr.ref_nonce())?;
    }

    let mut resolution = Op::Resolution(ResolutionOp::new());
    for (old, new) in &out.replaced {
        resolution.add_update(old.clone(), new.clone());
    }
    for (_, new) in &out.created {
        resolution.add_ref_block(new.clone());
    }
    for ptr in scratch.unrefs.drain(..) {
        resolution.add_unref_block(ptr);
    }

    let mut batch: Vec<Op> = merged_revs.iter().flat_map(|r| r.ops.clone()).collect();
    batch.extend(rewritten.iter().cloned());
    batch.push(resolution);
    FolderOps::validate_batch(&batch)?;

    let revision = Revision {
        prev: Some(master_prev_hash),
        revision: master_head.next(),
        branch: Branch::Master,
        ops: batch,
        new_root: new_root.clone(),
        writer: WriterInfo::new(
            folder.writer.clone(),
            folder.device.clone(),
            folder.cfg.clock.now_ms(),
        ),
        signature: None,
        unknown: UnknownFields::default(),
    };
    let revision = folder.sign(revision)?;

    match folder.cfg.md_server.put(tlf, revision.clone())? {
        PutOutcome::Accepted => {
            for (old, new, block) in &out.promoted {
                folder
                    .cfg
                    .cache
                    .delete_dirty(old, Branch::Unmerged(branch_id));
                let lifetime = if *new == new_root {
                    CacheLifetime::Permanent
                } else {
                    CacheLifetime::Transient
                };
                folder.cfg.cache.put(new, tlf, block.clone(), lifetime);
            }
            folder.cfg.cache.drop_dirty_branch(Branch::Unmerged(branch_id));
            folder.cfg.md_server.prune_unmerged(tlf, branch_id)?;
            if state.committed_root.is_initialized() && state.committed_root.id != new_root.id {
                folder.cfg.cache.delete_permanent(state.committed_root.id);
            }

            state.branch = Branch::Master;
            state.head = Some(revision.revision);
            state.head_hash = revision.hash(&limits).ok();
            state.head_writer = Some(revision.writer.writer.clone());
            state.root = new_root.clone();
            state.committed_root = new_root;
            state.unmerged_revs.clear();
            state.fork_master_head = None;
            state.fork_master_root = BlockPointer::default();
            state.temp_ids.clear();
            state.temp_owner.clear();
            drop(state);

            if unmerged_has_rekey || merged_has_rekey {
                folder.cfg.rekey_queue.enqueue(tlf);
            }

            // observers see the merged ops as-is, and the unmerged ops
            // inverted: "my edits were moved aside". Paths come from the
            // resolved tree; the rewritten slice keeps its replay paths.
            let merged_count: usize = merged_revs.iter().map(|r| r.ops.len()).sum();
            let annotated = folder.ops_with_paths(&revision);
            let mut note_ops: Vec<Op> = annotated[..merged_count].to_vec();
            for op in &annotated[merged_count..merged_count + rewritten.len()] {
                let mut inverted = op.invert();
                inverted.set_final_path(op.common().final_path.clone());
                note_ops.push(inverted);
            }
            folder
                .cfg
                .notifier
                .batch_changes(tlf, &crate::notify::changes_from_ops(&note_ops));
            info!(%tlf, revision = %revision.revision, "resolution published");
            Ok(Outcome::Done)
        }
        PutOutcome::Conflict { head } => {
            // master advanced again mid-publish; uploaded blocks may be
            // orphaned if the next pass produces different content
            state
                .gc_pending
                .extend(out.uploads.iter().map(|(ptr, _)| ptr.clone()));
            warn!(%tlf, server_head = %head, "master moved during resolution; retrying");
            Ok(Outcome::Retry)
        }
    }
}
