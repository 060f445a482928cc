//! Capabilities the core consumes: block storage, metadata storage,
//! cryptography, and the rekey queue. The core never speaks a network
//! protocol; these traits are its only view of the outside world.

pub mod memory;

use bytes::Bytes;
use crossbeam::channel::Receiver;
use thiserror::Error;

use crate::core::block::{BlockContext, BlockId, RefNonce};
use crate::core::identity::{Branch, BranchId, DeviceName, TlfId, WriterName};
use crate::core::revision::{Revision, RevisionNumber, Signature};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("block {0} not on server")]
    NoSuchBlock(BlockId),
    #[error("no such revision range {from}..={to}")]
    NoSuchRevision {
        from: RevisionNumber,
        to: RevisionNumber,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error("transient server failure: {0}")]
    Transient(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ServerError {
    pub fn transient<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transient(Box::new(source))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ServerError::Transient(_))
    }
}

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("this device needs a rekey for {0}")]
    NeedSelfRekey(TlfId),
    #[error("another device must rekey {0}")]
    NeedOtherRekey(TlfId),
    #[error("signature did not verify")]
    BadSignature,
}

/// Content-addressed block storage. `put` must be idempotent: storing the
/// same id twice is a no-op, not an error.
pub trait BlockServer: Send + Sync {
    fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
        ciphertext: Bytes,
    ) -> Result<(), ServerError>;

    fn get(&self, tlf: TlfId, id: BlockId) -> Result<Bytes, ServerError>;

    fn add_reference(&self, tlf: TlfId, id: BlockId, nonce: RefNonce) -> Result<(), ServerError>;

    fn remove_reference(&self, tlf: TlfId, id: BlockId, nonce: RefNonce)
        -> Result<(), ServerError>;
}

/// Outcome of a master-branch revision put.
#[derive(Debug)]
pub enum PutOutcome {
    Accepted,
    /// The branch moved; the server head is returned so the writer can fork.
    Conflict { head: RevisionNumber },
}

/// Append-only metadata storage, one chain per folder per branch.
pub trait MdServer: Send + Sync {
    fn get_range(
        &self,
        tlf: TlfId,
        branch: Branch,
        from: RevisionNumber,
        to: RevisionNumber,
    ) -> Result<Vec<Revision>, ServerError>;

    fn head(&self, tlf: TlfId, branch: Branch) -> Result<Option<RevisionNumber>, ServerError>;

    fn put(&self, tlf: TlfId, revision: Revision) -> Result<PutOutcome, ServerError>;

    fn put_unmerged(&self, tlf: TlfId, revision: Revision) -> Result<(), ServerError>;

    /// The unmerged branch this device left behind, if any; lets a restarted
    /// device resume a staged fork.
    fn unmerged_for_device(
        &self,
        tlf: TlfId,
        writer: &WriterName,
        device: &DeviceName,
    ) -> Result<Option<Vec<Revision>>, ServerError>;

    /// Discard a resolved or abandoned unmerged branch.
    fn prune_unmerged(&self, tlf: TlfId, branch: BranchId) -> Result<(), ServerError>;

    /// Stream of head revision numbers committed to master by any device.
    fn register_for_updates(&self, tlf: TlfId) -> Receiver<RevisionNumber>;
}

/// Cryptography capability. The core treats keys, ciphers, and signature
/// schemes as opaque.
pub trait Crypter: Send + Sync {
    fn encrypt(
        &self,
        tlf: TlfId,
        key_gen: crate::core::identity::KeyGen,
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    fn decrypt(
        &self,
        tlf: TlfId,
        key_gen: crate::core::identity::KeyGen,
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError>;

    fn sign(&self, bytes: &[u8]) -> Result<Signature, CryptoError>;

    fn verify(
        &self,
        bytes: &[u8],
        signature: &Signature,
        writer: &WriterName,
    ) -> Result<(), CryptoError>;
}

/// Hook into the rekey scheduler. A surviving rekey op must always kick this
/// queue so new devices gain access after a merge.
pub trait RekeyQueue: Send + Sync {
    fn enqueue(&self, tlf: TlfId);
}
