#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};
use async_trait::async_trait;
use lazy_static::lazy_static;

use vmb_api_types::{BackupConfig, Region};
use vmb_datastore::{CryptoProvider, Keyring, MemoryStore, MetadataStore, ObjectStore, VolumeLayout};
use vmb_tools::crypt_config::CryptConfig;

use vmbackup::disk::{DiskAccess, MemoryDisk};
use vmbackup::{AbortHandle, BackupJob, BackupOutcome, BackupRequest};

pub const BLOCK_SIZE: u64 = 4096;

lazy_static! {
    static ref TEST_KEY: [u8; 32] = {
        let mut key = [0u8; 32];
        for (i, byte) in key.iter_mut().enumerate() {
            *byte = (i * 7 + 3) as u8;
        }
        key
    };
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn test_config() -> BackupConfig {
    BackupConfig {
        block_size: BLOCK_SIZE,
        pool_capacity: 3,
        worker_threads: 2,
        max_retries: 2,
        retry_delay_ms: 1,
        watchdog_timeout_ms: None,
        compress: false,
    }
}

pub fn keyring() -> Result<Arc<dyn CryptoProvider>, Error> {
    let mut keyring = Keyring::new();
    keyring.insert("test-key", CryptConfig::new(*TEST_KEY)?)?;
    Ok(Arc::new(keyring))
}

pub fn layout() -> Result<VolumeLayout, Error> {
    VolumeLayout::new("client1", "vol1")
}

/// Block data that differs between blocks and generations.
pub fn block_data(seed: u8) -> Vec<u8> {
    (0..BLOCK_SIZE as usize)
        .map(|i| (i as u8).wrapping_mul(31) ^ seed.wrapping_mul(101).wrapping_add(1))
        .collect()
}

/// Eight blocks, block 2 explicitly zeroed, block 5 never written.
pub fn eight_block_disk() -> Result<Arc<MemoryDisk>, Error> {
    let disk = MemoryDisk::with_name("vm-100-disk-0", 8 * BLOCK_SIZE);
    for index in [0u64, 1, 3, 4, 6, 7] {
        disk.write_at(index * BLOCK_SIZE, &block_data(index as u8))?;
    }
    disk.write_at(2 * BLOCK_SIZE, &vec![0u8; BLOCK_SIZE as usize])?;
    Ok(Arc::new(disk))
}

pub async fn run_backup(
    disk: Arc<dyn DiskAccess>,
    metadata: &MetadataStore,
    crypto: Arc<dyn CryptoProvider>,
    request: BackupRequest,
) -> Result<BackupOutcome, Error> {
    let mut job = BackupJob::new(disk, metadata.clone(), crypto, test_config())?;
    job.run(request).await
}

pub fn request(backup_id: &str, incremental: bool, key_ref: &str) -> BackupRequest {
    BackupRequest {
        backup_id: Some(backup_id.to_string()),
        incremental,
        key_ref: key_ref.to_string(),
    }
}

fn is_block_key(key: &str) -> bool {
    key.contains("/blockdata/")
}

/// Counts block uploads on top of a memory store.
pub struct CountingStore {
    pub inner: Arc<MemoryStore>,
    uploads: AtomicUsize,
}

impl CountingStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            uploads: AtomicUsize::new(0),
        }
    }

    /// Block uploads since the last call.
    pub fn take_uploads(&self) -> usize {
        self.uploads.swap(0, Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for CountingStore {
    fn name(&self) -> &str {
        "counting"
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error> {
        if is_block_key(key) {
            self.uploads.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.put(bucket, key, data).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(bucket, key).await
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        self.inner.list_keys(bucket, prefix).await
    }
}

/// Block uploads fail or never finish, metadata goes through.
pub struct FaultyStore {
    pub inner: Arc<MemoryStore>,
    hang: bool,
    attempts: AtomicUsize,
}

impl FaultyStore {
    pub fn failing(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            hang: false,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn hanging(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            hang: true,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for FaultyStore {
    fn name(&self) -> &str {
        "faulty"
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error> {
        if is_block_key(key) {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            bail!("connection reset by peer");
        }
        self.inner.put(bucket, key, data).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(bucket, key).await
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        self.inner.list_keys(bucket, prefix).await
    }
}

/// Requests an abort once block `abort_at` is read.
pub struct AbortingDisk {
    pub inner: Arc<MemoryDisk>,
    pub abort: AbortHandle,
    pub abort_at: u64,
}

impl DiskAccess for AbortingDisk {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn capacity(&self) -> u64 {
        self.inner.capacity()
    }

    fn query_allocated_regions(&self) -> Result<Vec<Region>, Error> {
        self.inner.query_allocated_regions()
    }

    fn query_changed_regions(&self, since_ref: &str) -> Result<Vec<Region>, Error> {
        self.inner.query_changed_regions(since_ref)
    }

    fn begin_snapshot(&self) -> Result<Option<String>, Error> {
        self.inner.begin_snapshot()
    }

    fn read(&self, region: &Region) -> Result<Vec<u8>, Error> {
        if region.offset / BLOCK_SIZE == self.abort_at {
            self.abort.abort();
        }
        self.inner.read(region)
    }

    fn write(&self, region: &Region, data: &[u8]) -> Result<(), Error> {
        self.inner.write(region, data)
    }
}

/// Fails the `fail_at`-th write of a restore task record (counting from 1).
pub struct TaskWriteStore {
    pub inner: Arc<MemoryStore>,
    fail_at: usize,
    writes: AtomicUsize,
}

impl TaskWriteStore {
    pub fn failing_at(inner: Arc<MemoryStore>, fail_at: usize) -> Self {
        Self {
            inner,
            fail_at,
            writes: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ObjectStore for TaskWriteStore {
    fn name(&self) -> &str {
        "task-write"
    }

    async fn put(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), Error> {
        if key.starts_with("restores/") {
            let count = self.writes.fetch_add(1, Ordering::SeqCst) + 1;
            if count == self.fail_at {
                bail!("no space left on device");
            }
        }
        self.inner.put(bucket, key, data).await
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>, Error> {
        self.inner.get(bucket, key).await
    }

    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, Error> {
        self.inner.list_keys(bucket, prefix).await
    }
}
