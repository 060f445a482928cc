//! In-memory capability implementations: the backends tests and local-only
//! folders run against.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;

use bytes::Bytes;
use crossbeam::channel::{unbounded, Receiver, Sender};
use sha2::{Digest, Sha256};

use super::{BlockServer, Crypter, CryptoError, MdServer, PutOutcome, RekeyQueue, ServerError};
use crate::config::Limits;
use crate::core::block::{BlockContext, BlockId, RefNonce};
use crate::core::identity::{Branch, BranchId, DeviceName, KeyGen, TlfId, WriterName};
use crate::core::revision::{Revision, RevisionNumber, Signature};
use crate::core::wire::{decode_revision, encode_revision};

#[derive(Default)]
struct BlockData {
    ciphertext: Bytes,
    refs: BTreeSet<RefNonce>,
}

/// Block server backed by a map; `put` is idempotent on id.
#[derive(Default)]
pub struct MemoryBlockServer {
    blocks: Mutex<HashMap<(TlfId, BlockId), BlockData>>,
}

impl MemoryBlockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks stored for a folder; used to check gc accounting.
    pub fn block_count(&self, tlf: TlfId) -> usize {
        self.blocks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(t, _)| *t == tlf)
            .count()
    }
}

impl BlockServer for MemoryBlockServer {
    fn put(
        &self,
        tlf: TlfId,
        id: BlockId,
        context: &BlockContext,
        ciphertext: Bytes,
    ) -> Result<(), ServerError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        let data = blocks.entry((tlf, id)).or_default();
        if data.ciphertext.is_empty() {
            data.ciphertext = ciphertext;
        }
        data.refs.insert(context.ref_nonce);
        Ok(())
    }

    fn get(&self, tlf: TlfId, id: BlockId) -> Result<Bytes, ServerError> {
        let blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        blocks
            .get(&(tlf, id))
            .map(|d| d.ciphertext.clone())
            .ok_or(ServerError::NoSuchBlock(id))
    }

    fn add_reference(&self, tlf: TlfId, id: BlockId, nonce: RefNonce) -> Result<(), ServerError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        let data = blocks
            .get_mut(&(tlf, id))
            .ok_or(ServerError::NoSuchBlock(id))?;
        data.refs.insert(nonce);
        Ok(())
    }

    fn remove_reference(
        &self,
        tlf: TlfId,
        id: BlockId,
        nonce: RefNonce,
    ) -> Result<(), ServerError> {
        let mut blocks = self.blocks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(data) = blocks.get_mut(&(tlf, id)) {
            data.refs.remove(&nonce);
            if data.refs.is_empty() {
                blocks.remove(&(tlf, id));
            }
        }
        Ok(())
    }
}

#[derive(Default)]
struct MdState {
    master: HashMap<TlfId, Vec<Revision>>,
    unmerged: HashMap<(TlfId, BranchId), Vec<Revision>>,
    subscribers: HashMap<TlfId, Vec<Sender<RevisionNumber>>>,
}

/// Metadata server backed by per-folder revision vectors. Validates only
/// revision numbering; chain hashes and signatures are the client's job.
///
/// Every stored revision is normalized through the wire codec, because a
/// network server only ever sees the wire image: local-only bookkeeping on
/// ops does not survive a round trip through this store.
#[derive(Default)]
pub struct MemoryMdServer {
    state: Mutex<MdState>,
    limits: Limits,
}

impl MemoryMdServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(&self, revision: Revision) -> Result<Revision, ServerError> {
        let bytes =
            encode_revision(&revision, &self.limits, true).map_err(ServerError::transient)?;
        decode_revision(&bytes, &self.limits).map_err(ServerError::transient)
    }
}

impl MdServer for MemoryMdServer {
    fn get_range(
        &self,
        tlf: TlfId,
        branch: Branch,
        from: RevisionNumber,
        to: RevisionNumber,
    ) -> Result<Vec<Revision>, ServerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let chain = match branch {
            Branch::Master => state.master.get(&tlf),
            Branch::Unmerged(id) => state.unmerged.get(&(tlf, id)),
        };
        let Some(chain) = chain else {
            return Err(ServerError::NoSuchRevision { from, to });
        };
        let out: Vec<Revision> = chain
            .iter()
            .filter(|r| r.revision >= from && r.revision <= to)
            .cloned()
            .collect();
        if out.is_empty() {
            return Err(ServerError::NoSuchRevision { from, to });
        }
        Ok(out)
    }

    fn head(&self, tlf: TlfId, branch: Branch) -> Result<Option<RevisionNumber>, ServerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let chain = match branch {
            Branch::Master => state.master.get(&tlf),
            Branch::Unmerged(id) => state.unmerged.get(&(tlf, id)),
        };
        Ok(chain.and_then(|c| c.last()).map(|r| r.revision))
    }

    fn put(&self, tlf: TlfId, revision: Revision) -> Result<PutOutcome, ServerError> {
        let revision = self.normalize(revision)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let chain = state.master.entry(tlf).or_default();
        let expected = chain
            .last()
            .map(|r| r.revision.next())
            .unwrap_or(RevisionNumber::INITIAL);
        if revision.revision != expected {
            let head = chain
                .last()
                .map(|r| r.revision)
                .unwrap_or(RevisionNumber::INITIAL);
            return Ok(PutOutcome::Conflict { head });
        }
        let number = revision.revision;
        chain.push(revision);
        if let Some(subs) = state.subscribers.get_mut(&tlf) {
            subs.retain(|tx| tx.send(number).is_ok());
        }
        Ok(PutOutcome::Accepted)
    }

    fn put_unmerged(&self, tlf: TlfId, revision: Revision) -> Result<(), ServerError> {
        let revision = self.normalize(revision)?;
        let Branch::Unmerged(branch_id) = revision.branch else {
            return Err(ServerError::transient(std::io::Error::other(
                "unmerged put requires an unmerged branch",
            )));
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .unmerged
            .entry((tlf, branch_id))
            .or_default()
            .push(revision);
        Ok(())
    }

    fn unmerged_for_device(
        &self,
        tlf: TlfId,
        writer: &WriterName,
        device: &DeviceName,
    ) -> Result<Option<Vec<Revision>>, ServerError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for ((t, _), chain) in state.unmerged.iter() {
            if *t != tlf {
                continue;
            }
            let Some(first) = chain.first() else { continue };
            if first.writer.writer == *writer && first.writer.device == *device {
                return Ok(Some(chain.clone()));
            }
        }
        Ok(None)
    }

    fn prune_unmerged(&self, tlf: TlfId, branch: BranchId) -> Result<(), ServerError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.unmerged.remove(&(tlf, branch));
        Ok(())
    }

    fn register_for_updates(&self, tlf: TlfId) -> Receiver<RevisionNumber> {
        let (tx, rx) = unbounded();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.subscribers.entry(tlf).or_default().push(tx);
        rx
    }
}

/// Keystream cipher for tests: deterministic, invertible, shared per folder
/// and key generation. Not a real cipher.
pub struct XorCrypter {
    writer: WriterName,
}

impl XorCrypter {
    pub fn new(writer: WriterName) -> Self {
        Self { writer }
    }

    fn keystream(tlf: TlfId, key_gen: KeyGen, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut counter = 0u64;
        while out.len() < len {
            let mut hasher = Sha256::new();
            hasher.update(b"cofferfs-keystream");
            hasher.update(tlf.as_bytes());
            hasher.update(key_gen.0.to_be_bytes());
            hasher.update(counter.to_be_bytes());
            out.extend_from_slice(&hasher.finalize());
            counter += 1;
        }
        out.truncate(len);
        out
    }

    fn signature_for(writer: &WriterName, bytes: &[u8]) -> Signature {
        let mut hasher = Sha256::new();
        hasher.update(b"cofferfs-sig");
        hasher.update(writer.as_str().as_bytes());
        hasher.update(bytes);
        Signature(Bytes::copy_from_slice(&hasher.finalize()))
    }
}

impl Crypter for XorCrypter {
    fn encrypt(
        &self,
        tlf: TlfId,
        key_gen: KeyGen,
        plaintext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        let stream = Self::keystream(tlf, key_gen, plaintext.len());
        let out: Vec<u8> = plaintext
            .iter()
            .zip(stream.iter())
            .map(|(p, k)| p ^ k)
            .collect();
        Ok(Bytes::from(out))
    }

    fn decrypt(
        &self,
        tlf: TlfId,
        key_gen: KeyGen,
        ciphertext: &[u8],
    ) -> Result<Bytes, CryptoError> {
        self.encrypt(tlf, key_gen, ciphertext)
    }

    fn sign(&self, bytes: &[u8]) -> Result<Signature, CryptoError> {
        Ok(Self::signature_for(&self.writer, bytes))
    }

    fn verify(
        &self,
        bytes: &[u8],
        signature: &Signature,
        writer: &WriterName,
    ) -> Result<(), CryptoError> {
        if Self::signature_for(writer, bytes) == *signature {
            Ok(())
        } else {
            Err(CryptoError::BadSignature)
        }
    }
}

/// Rekey queue that records what was enqueued; tests assert against it.
#[derive(Default)]
pub struct RecordingRekeyQueue {
    pending: Mutex<Vec<TlfId>>,
}

impl RecordingRekeyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Vec<TlfId> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl RekeyQueue for RecordingRekeyQueue {
    fn enqueue(&self, tlf: TlfId) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tlf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlf() -> TlfId {
        TlfId::new([3; 16])
    }

    #[test]
    fn block_put_is_idempotent() {
        let server = MemoryBlockServer::new();
        let id = BlockId::hash_of(b"cipher");
        let ctx = BlockContext::default();
        server.put(tlf(), id, &ctx, Bytes::from_static(b"cipher")).unwrap();
        server.put(tlf(), id, &ctx, Bytes::from_static(b"cipher")).unwrap();
        assert_eq!(server.get(tlf(), id).unwrap(), Bytes::from_static(b"cipher"));
        assert_eq!(server.block_count(tlf()), 1);
    }

    #[test]
    fn remove_last_reference_drops_block() {
        let server = MemoryBlockServer::new();
        let id = BlockId::hash_of(b"x");
        let nonce = RefNonce([1; 8]);
        let ctx = BlockContext::default().with_nonce(nonce);
        server.put(tlf(), id, &ctx, Bytes::from_static(b"x")).unwrap();
        server.remove_reference(tlf(), id, nonce).unwrap();
        assert!(matches!(
            server.get(tlf(), id),
            Err(ServerError::NoSuchBlock(_))
        ));
    }

    #[test]
    fn stored_revisions_only_keep_the_wire_image() {
        use crate::core::block::{BlockId as Id, BlockPointer, EntryType};
        use crate::core::identity::WriterInfo;
        use crate::core::ops::{CreateOp, Op};
        use crate::core::wire::UnknownFields;

        let server = MemoryMdServer::new();
        let root = BlockPointer {
            id: Id::hash_of(b"root"),
            ..BlockPointer::default()
        };
        let writer = WriterInfo::new(
            WriterName::new("u1").unwrap(),
            DeviceName::new("dev1").unwrap(),
            1000,
        );
        let mut op = Op::Create(CreateOp::new("a", root.clone(), EntryType::File));
        op.set_final_path(vec!["docs".to_string()]);
        op.set_writer(writer.clone());
        let revision = Revision {
            prev: None,
            revision: RevisionNumber::INITIAL,
            branch: Branch::Master,
            ops: vec![op],
            new_root: root,
            writer,
            signature: Some(Signature(Bytes::from_static(b"sig"))),
            unknown: UnknownFields::default(),
        };
        assert!(matches!(
            server.put(tlf(), revision).unwrap(),
            PutOutcome::Accepted
        ));

        let fetched = server
            .get_range(
                tlf(),
                Branch::Master,
                RevisionNumber::INITIAL,
                RevisionNumber::INITIAL,
            )
            .unwrap();
        // local-only bookkeeping does not survive the store
        assert!(fetched[0].ops[0].common().final_path.is_empty());
        assert!(fetched[0].ops[0].common().writer.is_none());
        // wire-visible fields do
        assert_eq!(fetched[0].writer.writer.as_str(), "u1");
        assert!(fetched[0].signature.is_some());
    }

    #[test]
    fn xor_crypter_round_trips() {
        let crypter = XorCrypter::new(WriterName::new("u1").unwrap());
        let ct = crypter.encrypt(tlf(), KeyGen::FIRST, b"hello world").unwrap();
        assert_ne!(&ct[..], b"hello world");
        let pt = crypter.decrypt(tlf(), KeyGen::FIRST, &ct).unwrap();
        assert_eq!(&pt[..], b"hello world");
    }

    #[test]
    fn signatures_verify_per_writer() {
        let u1 = WriterName::new("u1").unwrap();
        let u2 = WriterName::new("u2").unwrap();
        let crypter = XorCrypter::new(u1.clone());
        let sig = crypter.sign(b"payload").unwrap();
        assert!(crypter.verify(b"payload", &sig, &u1).is_ok());
        assert!(matches!(
            crypter.verify(b"payload", &sig, &u2),
            Err(CryptoError::BadSignature)
        ));
        assert!(matches!(
            crypter.verify(b"other", &sig, &u1),
            Err(CryptoError::BadSignature)
        ));
    }
}
