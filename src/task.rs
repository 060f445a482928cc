//! Cooperative cancellation and the bounded block-upload task group.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use crossbeam::channel;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::block::BlockPointer;
use crate::core::identity::TlfId;
use crate::server::{BlockServer, ServerError};

/// Shared cancellation token threaded through every I/O-bearing call.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), ServerError> {
        if self.is_cancelled() {
            Err(ServerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Retry a transient-prone server call with exponential backoff. Permanent
/// errors and cancellation return immediately; the cause chain of the last
/// transient failure is preserved.
pub fn retry_transient<T>(
    attempts: usize,
    base_delay: std::time::Duration,
    cancel: &CancelFlag,
    mut call: impl FnMut() -> Result<T, ServerError>,
) -> Result<T, ServerError> {
    let mut delay = base_delay;
    let mut attempt = 0;
    loop {
        match call() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < attempts.max(1) => {
                if cancel.is_cancelled() {
                    return Err(ServerError::Cancelled);
                }
                debug!(attempt, error = %err, "transient server failure; backing off");
                std::thread::sleep(delay);
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A block-upload group failed or was cancelled. `uploaded` lists pointers
/// that made it to the server before the group stopped; the caller must hand
/// them to the next gc op so no revision-less blocks linger server-side.
#[derive(Debug, Error)]
#[error("block upload group failed after {} puts: {cause}", uploaded.len())]
pub struct PutGroupError {
    #[source]
    pub cause: ServerError,
    pub uploaded: Vec<BlockPointer>,
}

/// Upload blocks with a bounded worker fan-out. The first failure (or a
/// cancellation) stops every sibling before its next put, then all workers
/// join before this returns, so the server's reference state is settled
/// either way.
pub fn put_blocks(
    server: &dyn BlockServer,
    tlf: TlfId,
    blocks: &[(BlockPointer, Bytes)],
    max_parallel: usize,
    cancel: &CancelFlag,
) -> Result<(), PutGroupError> {
    if blocks.is_empty() {
        return Ok(());
    }
    let (tx, rx) = channel::unbounded::<&(BlockPointer, Bytes)>();
    for item in blocks {
        tx.send(item).expect("queue is open");
    }
    drop(tx);

    let abort = AtomicBool::new(false);
    let uploaded: Mutex<Vec<BlockPointer>> = Mutex::new(Vec::new());
    let first_err: Mutex<Option<ServerError>> = Mutex::new(None);
    let workers = max_parallel.clamp(1, blocks.len());

    thread::scope(|scope| {
        let abort = &abort;
        let uploaded = &uploaded;
        let first_err = &first_err;
        for _ in 0..workers {
            let rx = rx.clone();
            scope.spawn(move || {
                while let Ok((ptr, ciphertext)) = rx.recv() {
                    if abort.load(Ordering::SeqCst) || cancel.is_cancelled() {
                        break;
                    }
                    match server.put(tlf, ptr.id, &ptr.context, ciphertext.clone()) {
                        Ok(()) => {
                            uploaded
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .push(ptr.clone());
                        }
                        Err(err) => {
                            warn!(block = %ptr.id, error = %err, "block put failed; cancelling siblings");
                            abort.store(true, Ordering::SeqCst);
                            first_err
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .get_or_insert(err);
                            break;
                        }
                    }
                }
            });
        }
    });

    let uploaded = uploaded.into_inner().unwrap_or_else(|e| e.into_inner());
    let first_err = first_err.into_inner().unwrap_or_else(|e| e.into_inner());
    if cancel.is_cancelled() {
        debug!(uploaded = uploaded.len(), "block upload group cancelled");
        return Err(PutGroupError {
            cause: ServerError::Cancelled,
            uploaded,
        });
    }
    if let Some(cause) = first_err {
        return Err(PutGroupError { cause, uploaded });
    }
    Ok(())
}
