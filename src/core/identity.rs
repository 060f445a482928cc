//! Identity atoms: folders, writers, devices, branches.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidId {
    #[error("invalid writer name {raw:?}: {reason}")]
    Writer { raw: String, reason: String },
    #[error("invalid device name {raw:?}: {reason}")]
    Device { raw: String, reason: String },
}

/// Top-level folder identifier.
///
/// Opaque 16 bytes assigned by the metadata service; the core never derives
/// meaning from its contents.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TlfId([u8; 16]);

impl TlfId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlfId({})", self)
    }
}

impl fmt::Display for TlfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Writer username - non-empty string.
///
/// Usernames come from the identity service; no validation beyond non-empty.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WriterName(String);

impl WriterName {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::Writer {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for WriterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WriterName({:?})", self.0)
    }
}

impl fmt::Display for WriterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Device name - non-empty string, unique per writer.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceName(String);

impl DeviceName {
    pub fn new(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        if s.is_empty() {
            Err(InvalidId::Device {
                raw: s,
                reason: "empty".into(),
            })
        } else {
            Ok(Self(s))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceName({:?})", self.0)
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attribution for a frozen op or a signed revision.
///
/// `local_time_ms` is the wall clock at freeze time; it arbitrates attribute
/// conflicts (latest wins, tie broken by the greater device name).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriterInfo {
    pub writer: WriterName,
    pub device: DeviceName,
    pub local_time_ms: u64,
}

impl WriterInfo {
    pub fn new(writer: WriterName, device: DeviceName, local_time_ms: u64) -> Self {
        Self {
            writer,
            device,
            local_time_ms,
        }
    }
}

/// Identifier of a device-private unmerged branch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BranchId(Uuid);

impl BranchId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BranchId({})", self.0.simple())
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// A revision branch: the shared master or a device-private fork.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Branch {
    #[default]
    Master,
    Unmerged(BranchId),
}

impl Branch {
    pub fn is_master(&self) -> bool {
        matches!(self, Branch::Master)
    }

    pub fn branch_id(&self) -> Option<BranchId> {
        match self {
            Branch::Master => None,
            Branch::Unmerged(id) => Some(*id),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Branch::Master => write!(f, "master"),
            Branch::Unmerged(id) => write!(f, "unmerged:{}", id),
        }
    }
}

/// Key generation for a folder; bumped by rekey.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyGen(pub u32);

impl KeyGen {
    pub const FIRST: KeyGen = KeyGen(1);
}

/// Version of the block wire format a pointer's target was written with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DataVer(pub u32);

impl DataVer {
    pub const FIRST: DataVer = DataVer(1);
}

/// Resolved folder handle: sorted writer set plus display name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlfHandle {
    pub name: String,
    pub writers: Vec<WriterName>,
}

impl TlfHandle {
    pub fn new(writers: Vec<WriterName>) -> Self {
        let mut writers = writers;
        writers.sort();
        writers.dedup();
        let name = writers
            .iter()
            .map(WriterName::as_str)
            .collect::<Vec<_>>()
            .join(",");
        Self { name, writers }
    }
}
