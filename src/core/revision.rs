//! Signed, hash-chained metadata revisions.

use std::fmt;
use std::num::NonZeroU64;

use bytes::Bytes;
use sha2::{Digest, Sha256};

use super::block::BlockPointer;
use super::identity::{Branch, WriterInfo};
use super::ops::Op;
use super::wire::{encode_revision, EncodeError, UnknownFields};
use crate::config::Limits;

/// Position of a revision in its branch. The first revision of a folder is 1.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevisionNumber(NonZeroU64);

impl RevisionNumber {
    pub const INITIAL: RevisionNumber = RevisionNumber(NonZeroU64::MIN);

    pub fn from_u64(value: u64) -> Option<Self> {
        NonZeroU64::new(value).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }

    pub fn next(self) -> RevisionNumber {
        let next = self
            .0
            .get()
            .checked_add(1)
            .expect("revision number overflow");
        RevisionNumber(NonZeroU64::new(next).expect("revision cannot be zero"))
    }

    pub fn prev(self) -> Option<RevisionNumber> {
        self.0
            .get()
            .checked_sub(1)
            .and_then(NonZeroU64::new)
            .map(RevisionNumber)
    }
}

impl fmt::Debug for RevisionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionNumber({})", self.0)
    }
}

impl fmt::Display for RevisionNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// SHA-256 over a revision's full canonical encoding; links the chain.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RevisionHash(pub [u8; 32]);

impl RevisionHash {
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let out = hasher.finalize();
        let mut buf = [0u8; 32];
        buf.copy_from_slice(&out);
        Self(buf)
    }
}

impl fmt::Debug for RevisionHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevisionHash(")?;
        for b in &self.0[..8] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Detached signature over a revision's signable bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Signature(pub Bytes);

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({} bytes)", self.0.len())
    }
}

/// One immutable link in a folder's metadata chain.
#[derive(Clone, Debug, PartialEq)]
pub struct Revision {
    /// Hash of the previous revision's canonical bytes; `None` only for the
    /// first revision of the folder.
    pub prev: Option<RevisionHash>,
    pub revision: RevisionNumber,
    pub branch: Branch,
    pub ops: Vec<Op>,
    pub new_root: BlockPointer,
    pub writer: WriterInfo,
    pub signature: Option<Signature>,
    pub unknown: UnknownFields,
}

impl Revision {
    /// The bytes the signature covers: canonical encoding with the signature
    /// slot omitted.
    pub fn signable_bytes(&self, limits: &Limits) -> Result<Bytes, EncodeError> {
        encode_revision(self, limits, false)
    }

    /// Full canonical encoding, signature included.
    pub fn encoded(&self, limits: &Limits) -> Result<Bytes, EncodeError> {
        encode_revision(self, limits, true)
    }

    /// Chain hash of this revision.
    pub fn hash(&self, limits: &Limits) -> Result<RevisionHash, EncodeError> {
        Ok(RevisionHash::of(&self.encoded(limits)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_numbers_count_from_one() {
        assert_eq!(RevisionNumber::INITIAL.get(), 1);
        assert_eq!(RevisionNumber::INITIAL.next().get(), 2);
        assert_eq!(RevisionNumber::INITIAL.prev(), None);
        assert_eq!(
            RevisionNumber::from_u64(5).unwrap().prev(),
            RevisionNumber::from_u64(4)
        );
        assert_eq!(RevisionNumber::from_u64(0), None);
    }

    #[test]
    fn hash_is_stable() {
        let a = RevisionHash::of(b"abc");
        let b = RevisionHash::of(b"abc");
        assert_eq!(a, b);
        assert_ne!(a, RevisionHash::of(b"abd"));
    }
}
