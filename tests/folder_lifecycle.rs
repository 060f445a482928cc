//! Single-device folder behavior: mutations, sync, reads, and observers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cofferfs::{
    Branch, CancelFlag, ChainError, EntryType, MdServer, NodeChange, Observer, RevisionNumber,
    TlfHandle, TlfId, WriteRange,
};
use common::Env;

#[test]
fn create_write_read_round_trip() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    device.folder.create_dir(&["docs"]).unwrap();
    device.folder.create_file(&["docs", "notes"], false).unwrap();
    device
        .folder
        .write_file(&["docs", "notes"], 0, b"hello")
        .unwrap();
    device.folder.sync(&cancel).unwrap();

    assert_eq!(
        device.folder.read_file(&["docs", "notes"]).unwrap(),
        b"hello".to_vec()
    );
    let listing = device.folder.list_dir(&["docs"]).unwrap();
    assert_eq!(listing.get("notes"), Some(&EntryType::File));

    // reads survive a sync boundary and another write
    device
        .folder
        .write_file(&["docs", "notes"], 5, b" world")
        .unwrap();
    device.folder.sync(&cancel).unwrap();
    assert_eq!(
        device.folder.read_file(&["docs", "notes"]).unwrap(),
        b"hello world".to_vec()
    );
}

#[test]
fn truncate_shrinks_and_extends() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    device.folder.create_file(&["f"], false).unwrap();
    device.folder.write_file(&["f"], 0, &[1, 2, 3, 4, 5]).unwrap();
    device.folder.truncate_file(&["f"], 3).unwrap();
    device.folder.sync(&cancel).unwrap();
    assert_eq!(device.folder.read_file(&["f"]).unwrap(), vec![1, 2, 3]);

    device.folder.truncate_file(&["f"], 6).unwrap();
    device.folder.sync(&cancel).unwrap();
    assert_eq!(
        device.folder.read_file(&["f"]).unwrap(),
        vec![1, 2, 3, 0, 0, 0]
    );
}

#[test]
fn rename_and_remove() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    device.folder.create_dir(&["a"]).unwrap();
    device.folder.create_dir(&["b"]).unwrap();
    device.folder.create_file(&["a", "f"], false).unwrap();
    device.folder.write_file(&["a", "f"], 0, &[42]).unwrap();
    device.folder.sync(&cancel).unwrap();

    device.folder.rename(&["a", "f"], &["b", "g"]).unwrap();
    device.folder.sync(&cancel).unwrap();
    assert!(device.folder.list_dir(&["a"]).unwrap().is_empty());
    assert_eq!(device.folder.read_file(&["b", "g"]).unwrap(), vec![42]);

    device.folder.remove(&["b", "g"]).unwrap();
    device.folder.sync(&cancel).unwrap();
    assert!(device.folder.list_dir(&["b"]).unwrap().is_empty());

    // removing a non-empty directory is refused
    device.folder.create_file(&["a", "x"], false).unwrap();
    assert!(matches!(
        device.folder.remove(&["a"]),
        Err(ChainError::DirNotEmpty(_))
    ));
}

#[test]
fn exec_bit_round_trips() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    device.folder.create_file(&["run"], false).unwrap();
    device.folder.set_exec(&["run"], true).unwrap();
    device.folder.sync(&cancel).unwrap();
    let listing = device.folder.list_dir(&[]).unwrap();
    assert_eq!(listing.get("run"), Some(&EntryType::Exec));

    device.folder.set_exec(&["run"], false).unwrap();
    device.folder.sync(&cancel).unwrap();
    let listing = device.folder.list_dir(&[]).unwrap();
    assert_eq!(listing.get("run"), Some(&EntryType::File));
}

#[test]
fn symlinks_record_their_target() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    device.folder.create_file(&["target"], false).unwrap();
    device.folder.create_symlink(&["link"], "target").unwrap();
    device.folder.sync(&cancel).unwrap();
    let listing = device.folder.list_dir(&[]).unwrap();
    assert_eq!(listing.get("link"), Some(&EntryType::Sym));
}

#[test]
fn duplicate_create_is_refused() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");

    device.folder.create_file(&["a"], false).unwrap();
    assert!(matches!(
        device.folder.create_file(&["a"], false),
        Err(ChainError::Exists(_))
    ));
}

#[test]
fn empty_sync_is_a_no_op() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    assert_eq!(device.folder.sync(&cancel).unwrap(), None);
    device.folder.create_file(&["a"], false).unwrap();
    assert_eq!(
        device.folder.sync(&cancel).unwrap(),
        RevisionNumber::from_u64(1)
    );
    assert_eq!(
        device.folder.sync(&cancel).unwrap(),
        RevisionNumber::from_u64(1)
    );
}

#[derive(Default)]
struct RecordingObserver {
    locals: AtomicUsize,
    batches: AtomicUsize,
}

impl Observer for RecordingObserver {
    fn local_change(&self, _tlf: TlfId, _path: &[String], _write: &WriteRange) {
        self.locals.fetch_add(1, Ordering::SeqCst);
    }

    fn batch_changes(&self, _tlf: TlfId, _changes: &[NodeChange]) {
        self.batches.fetch_add(1, Ordering::SeqCst);
    }

    fn tlf_handle_change(&self, _tlf: TlfId, _handle: &TlfHandle) {}
}

#[derive(Default)]
struct ChangeCollector {
    changes: Mutex<Vec<NodeChange>>,
}

impl Observer for ChangeCollector {
    fn local_change(&self, _tlf: TlfId, _path: &[String], _write: &WriteRange) {}

    fn batch_changes(&self, _tlf: TlfId, changes: &[NodeChange]) {
        self.changes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(changes);
    }

    fn tlf_handle_change(&self, _tlf: TlfId, _handle: &TlfHandle) {}
}

/// Remote-originated changes arrive over the wire with no path bookkeeping
/// on the ops; paths must be re-derived from the committed tree.
#[test]
fn remote_changes_resolve_paths_from_the_tree() {
    let env = Env::new(&["u1", "u2"]);
    let alice = env.device("u1", "dev1");
    let bob = env.device("u2", "dev1");
    let cancel = CancelFlag::new();

    let observer = Arc::new(ChangeCollector::default());
    bob.folder.notifier().register(env.tlf, observer.clone());

    alice.folder.create_dir(&["docs"]).unwrap();
    alice.folder.create_file(&["docs", "notes"], false).unwrap();
    alice.folder.write_file(&["docs", "notes"], 0, b"hi").unwrap();
    alice.folder.sync(&cancel).unwrap();

    // the server hands back the wire image only
    let head = RevisionNumber::INITIAL;
    let fetched = env
        .md_server
        .get_range(env.tlf, Branch::Master, head, head)
        .unwrap();
    assert!(fetched[0]
        .ops
        .iter()
        .all(|op| op.common().final_path.is_empty()));

    bob.folder.poll_updates(&cancel).unwrap();
    let changes = observer
        .changes
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clone();
    assert!(changes.contains(&NodeChange::Dir {
        path: vec![],
        affected: vec!["docs".to_string()],
    }));
    assert!(changes.contains(&NodeChange::Dir {
        path: vec!["docs".to_string()],
        affected: vec!["notes".to_string()],
    }));
    assert!(changes.iter().any(|change| matches!(
        change,
        NodeChange::File { path, .. }
            if path == &["docs".to_string(), "notes".to_string()]
    )));
}

/// A write notifies observers immediately; the batch lands after sync.
#[test]
fn observers_see_local_then_committed_changes() {
    let env = Env::new(&["u1"]);
    let device = env.device("u1", "dev1");
    let cancel = CancelFlag::new();

    let observer = Arc::new(RecordingObserver::default());
    device
        .folder
        .notifier()
        .register(env.tlf, observer.clone());

    device.folder.create_file(&["a"], false).unwrap();
    device.folder.write_file(&["a"], 0, &[1, 2]).unwrap();
    assert_eq!(observer.locals.load(Ordering::SeqCst), 1);
    assert_eq!(observer.batches.load(Ordering::SeqCst), 0);

    device.folder.sync(&cancel).unwrap();
    assert_eq!(observer.batches.load(Ordering::SeqCst), 1);
}
