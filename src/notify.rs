//! Observer registry and op-to-notification replay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::identity::{TlfHandle, TlfId};
use crate::core::ops::{Op, WriteRange};

/// One observer-visible effect of a committed op.
#[derive(Clone, Debug, PartialEq)]
pub enum NodeChange {
    File {
        path: Vec<String>,
        writes: Vec<WriteRange>,
    },
    Dir {
        path: Vec<String>,
        affected: Vec<String>,
    },
}

/// Callbacks a folder consumer registers. Observers are held strongly by the
/// registry; teardown is registry-owned unregister.
pub trait Observer: Send + Sync {
    /// Pre-sync, intra-process change to one node.
    fn local_change(&self, tlf: TlfId, path: &[String], write: &WriteRange);

    /// Post-commit batch, delivered in commit order within a branch.
    fn batch_changes(&self, tlf: TlfId, changes: &[NodeChange]);

    /// The folder was renamed or its writer set changed.
    fn tlf_handle_change(&self, tlf: TlfId, handle: &TlfHandle);
}

#[derive(Default)]
pub struct Notifier {
    observers: Mutex<HashMap<TlfId, Vec<Arc<dyn Observer>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, tlf: TlfId, observer: Arc<dyn Observer>) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        observers.entry(tlf).or_default().push(observer);
    }

    pub fn unregister(&self, tlf: TlfId, observer: &Arc<dyn Observer>) {
        let mut observers = self.observers.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = observers.get_mut(&tlf) {
            list.retain(|o| !Arc::ptr_eq(o, observer));
        }
    }

    fn snapshot(&self, tlf: TlfId) -> Vec<Arc<dyn Observer>> {
        self.observers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&tlf)
            .cloned()
            .unwrap_or_default()
    }

    pub fn local_change(&self, tlf: TlfId, path: &[String], write: &WriteRange) {
        for observer in self.snapshot(tlf) {
            observer.local_change(tlf, path, write);
        }
    }

    pub fn batch_changes(&self, tlf: TlfId, changes: &[NodeChange]) {
        if changes.is_empty() {
            return;
        }
        for observer in self.snapshot(tlf) {
            observer.batch_changes(tlf, changes);
        }
    }

    pub fn tlf_handle_change(&self, tlf: TlfId, handle: &TlfHandle) {
        for observer in self.snapshot(tlf) {
            observer.tlf_handle_change(tlf, handle);
        }
    }
}

/// Replay committed ops into observer-visible changes.
///
/// Paths are whatever the caller stamped on the ops: the folder re-derives
/// them from the committed block tree before replay, because the wire
/// format carries no path bookkeeping. An op whose path could not be
/// resolved replays with an empty one.
pub fn changes_from_ops(ops: &[Op]) -> Vec<NodeChange> {
    let mut out = Vec::new();
    for op in ops {
        let path = op.common().final_path.clone();
        match op {
            Op::Create(inner) => out.push(NodeChange::Dir {
                path,
                affected: vec![inner.new_name.clone()],
            }),
            Op::Rm(inner) => out.push(NodeChange::Dir {
                path,
                affected: vec![inner.old_name.clone()],
            }),
            Op::Rename(inner) => out.push(NodeChange::Dir {
                path,
                affected: vec![inner.old_name.clone(), inner.new_name.clone()],
            }),
            Op::Sync(inner) => out.push(NodeChange::File {
                path,
                writes: inner.writes.clone(),
            }),
            Op::SetAttr(inner) => out.push(NodeChange::Dir {
                path,
                affected: vec![inner.name.clone()],
            }),
            Op::Resolution(_) | Op::Rekey(_) | Op::Gc(_) => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block::fake_pointer;
    use crate::core::identity::WriterName;
    use crate::core::ops::{CreateOp, SyncOp};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingObserver {
        locals: AtomicUsize,
        batches: AtomicUsize,
        handles: AtomicUsize,
    }

    impl Observer for CountingObserver {
        fn local_change(&self, _tlf: TlfId, _path: &[String], _write: &WriteRange) {
            self.locals.fetch_add(1, Ordering::SeqCst);
        }

        fn batch_changes(&self, _tlf: TlfId, _changes: &[NodeChange]) {
            self.batches.fetch_add(1, Ordering::SeqCst);
        }

        fn tlf_handle_change(&self, _tlf: TlfId, _handle: &TlfHandle) {
            self.handles.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tlf() -> TlfId {
        TlfId::new([5; 16])
    }

    #[test]
    fn registry_fans_out_and_unregisters() {
        let notifier = Notifier::new();
        let obs: Arc<CountingObserver> = Arc::new(CountingObserver::default());
        let as_observer: Arc<dyn Observer> = obs.clone();
        notifier.register(tlf(), as_observer.clone());

        notifier.local_change(tlf(), &[], &WriteRange::write(0, 1));
        notifier.batch_changes(
            tlf(),
            &[NodeChange::Dir {
                path: vec![],
                affected: vec!["a".to_string()],
            }],
        );
        let handle = TlfHandle::new(vec![WriterName::new("u1").unwrap()]);
        notifier.tlf_handle_change(tlf(), &handle);

        assert_eq!(obs.locals.load(Ordering::SeqCst), 1);
        assert_eq!(obs.batches.load(Ordering::SeqCst), 1);
        assert_eq!(obs.handles.load(Ordering::SeqCst), 1);

        notifier.unregister(tlf(), &as_observer);
        notifier.local_change(tlf(), &[], &WriteRange::write(0, 1));
        assert_eq!(obs.locals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn empty_batches_are_not_delivered() {
        let notifier = Notifier::new();
        let obs: Arc<CountingObserver> = Arc::new(CountingObserver::default());
        notifier.register(tlf(), obs.clone());
        notifier.batch_changes(tlf(), &[]);
        assert_eq!(obs.batches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn ops_replay_to_changes() {
        let mut create = Op::Create(CreateOp::new(
            "a",
            fake_pointer(1),
            crate::core::block::EntryType::File,
        ));
        create.set_final_path(vec![]);
        let mut sync = Op::Sync(SyncOp::new(fake_pointer(2)));
        {
            let Op::Sync(inner) = &mut sync else {
                unreachable!()
            };
            inner.add_write(0, 5);
        }
        sync.set_final_path(vec!["a".to_string()]);

        let changes = changes_from_ops(&[create, sync]);
        assert_eq!(changes.len(), 2);
        assert_eq!(
            changes[0],
            NodeChange::Dir {
                path: vec![],
                affected: vec!["a".to_string()]
            }
        );
        assert_eq!(
            changes[1],
            NodeChange::File {
                path: vec!["a".to_string()],
                writes: vec![WriteRange::write(0, 5)]
            }
        );
    }
}
