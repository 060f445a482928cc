//! Shared two-device harness: one in-memory server pair, one folder, any
//! number of devices with private caches.
#![allow(dead_code)]

use std::sync::Arc;

use cofferfs::memory::{MemoryBlockServer, MemoryMdServer, RecordingRekeyQueue, XorCrypter};
use cofferfs::{
    BlockCache, Config, DeviceName, FixedClock, FolderConfig, FolderOps, Notifier, TlfHandle,
    TlfId, WriterName,
};

// 2016-03-14 00:00:00 UTC
pub const TEST_TIME_MS: u64 = 1_457_913_600_000;
pub const TEST_DATE: &str = "2016-03-14";

pub struct Env {
    pub tlf: TlfId,
    pub handle: TlfHandle,
    pub block_server: Arc<MemoryBlockServer>,
    pub md_server: Arc<MemoryMdServer>,
}

impl Env {
    pub fn new(writers: &[&str]) -> Env {
        let handle = TlfHandle::new(
            writers
                .iter()
                .map(|w| WriterName::new(*w).unwrap())
                .collect(),
        );
        Env {
            tlf: TlfId::new([7; 16]),
            handle,
            block_server: Arc::new(MemoryBlockServer::new()),
            md_server: Arc::new(MemoryMdServer::new()),
        }
    }
}

pub struct Device {
    pub folder: Arc<FolderOps>,
    pub rekey_queue: Arc<RecordingRekeyQueue>,
}

impl Env {
    /// Attach a device with its own cache, clock, and notifier.
    pub fn device(&self, writer: &str, device: &str) -> Device {
        let writer = WriterName::new(writer).unwrap();
        let rekey_queue = Arc::new(RecordingRekeyQueue::new());
        let cfg = FolderConfig {
            config: Config::default(),
            cache: Arc::new(BlockCache::new(&Config::default().cache)),
            block_server: self.block_server.clone(),
            md_server: self.md_server.clone(),
            crypter: Arc::new(XorCrypter::new(writer.clone())),
            rekey_queue: rekey_queue.clone(),
            clock: Arc::new(FixedClock(TEST_TIME_MS)),
            notifier: Arc::new(Notifier::new()),
        };
        let folder = FolderOps::open(
            cfg,
            self.tlf,
            self.handle.clone(),
            writer,
            DeviceName::new(device).unwrap(),
        )
        .expect("folder opens");
        Device {
            folder,
            rekey_queue,
        }
    }
}
