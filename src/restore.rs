//! Restore orchestration
//!
//! Writes every block of a completed backup back to a disk. Data blocks are
//! fetched from the blob of the backup owning them, decoded, checked against
//! the recorded fingerprint and written; empty blocks are zero filled without
//! touching the store. The outcome is recorded in a [RestoreTaskRecord].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use proxmox_human_byte::HumanByte;

use vmb_api_types::{
    block_region, BackupConfig, BackupError, BackupRecord, BackupStatus, BlockIndex, Fingerprint,
    Region, RestoreStatus, RestoreTaskRecord,
};
use vmb_datastore::layout::{check_id, generate_id};
use vmb_datastore::{CryptoProvider, MetadataStore, ObjectStore, VolumeLayout};
use vmb_tools::retry::retry;
use vmb_tools::{fingerprint, BufferPool, ParallelHandler};

use crate::abort::AbortHandle;
use crate::disk::DiskAccess;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RestoreState {
    Init,
    Restoring,
    Complete,
    Error,
}

#[derive(Clone, Debug, Default)]
pub struct RestoreRequest {
    /// Generated from the start time if not set.
    pub restore_id: Option<String>,
    pub backup_id: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RestoreStats {
    pub total_blocks: u64,
    pub fetched_blocks: u64,
    pub empty_blocks: u64,
    /// Bytes written to the target disk.
    pub written_bytes: u64,
    /// Stored size of all fetched blobs.
    pub fetched_bytes: u64,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct RestoreOutcome {
    pub task: RestoreTaskRecord,
    pub stats: RestoreStats,
}

pub struct RestoreJob {
    metadata: MetadataStore,
    crypto: Arc<dyn CryptoProvider>,
    config: BackupConfig,
    abort: AbortHandle,
    state: RestoreState,
}

impl RestoreJob {
    pub fn new(
        metadata: MetadataStore,
        crypto: Arc<dyn CryptoProvider>,
        config: BackupConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            metadata,
            crypto,
            config,
            abort: AbortHandle::new(),
            state: RestoreState::Init,
        })
    }

    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> RestoreState {
        self.state
    }

    fn set_state(&mut self, state: RestoreState) {
        log::debug!("restore state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Restore `request.backup_id` onto `target`.
    ///
    /// Fails with [BackupError::NotFound] before anything is recorded if the
    /// backup does not exist.
    pub async fn run(
        &mut self,
        target: Arc<dyn DiskAccess>,
        request: RestoreRequest,
    ) -> Result<RestoreOutcome, Error> {
        let start = Instant::now();
        self.set_state(RestoreState::Init);

        let record = self.metadata.get_backup_record(&request.backup_id).await?;
        if record.status != BackupStatus::Complete {
            bail!(
                "backup '{}' is not restorable - status {}",
                record.backup_id,
                record.status
            );
        }
        record.check_consistency()?;

        if target.capacity() < record.disk_size {
            bail!(
                "target disk {} is too small for backup '{}' ({} < {})",
                target.name(),
                record.backup_id,
                HumanByte::from(target.capacity()),
                HumanByte::from(record.disk_size),
            );
        }

        let ctime = proxmox_time::epoch_i64();
        let restore_id = match request.restore_id {
            Some(id) => id,
            None => generate_id("restore", ctime)?,
        };
        check_id("restore id", &restore_id)?;

        let mut task = RestoreTaskRecord {
            restore_id,
            backup_id: record.backup_id.clone(),
            status: RestoreStatus::Running,
            encryption_key_ref: record.encryption_key_ref.clone(),
            ctime,
        };
        self.metadata.put_restore_task(&task).await?;

        log::info!(
            "restore '{}': writing backup '{}' to {}",
            task.restore_id,
            record.backup_id,
            target.name()
        );

        self.set_state(RestoreState::Restoring);
        let result = match self.restore_blocks(target, Arc::new(record)).await {
            Ok(stats) => {
                task.status = RestoreStatus::Complete;
                self.metadata.put_restore_task(&task).await.map(|()| stats)
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(mut stats) => {
                self.set_state(RestoreState::Complete);

                stats.duration = start.elapsed();
                log::info!(
                    "restore '{}': wrote {} ({} blocks fetched, {} empty) in {:.2}s",
                    task.restore_id,
                    HumanByte::from(stats.written_bytes),
                    stats.fetched_blocks,
                    stats.empty_blocks,
                    stats.duration.as_secs_f64()
                );
                Ok(RestoreOutcome { task, stats })
            }
            Err(err) => {
                self.set_state(RestoreState::Error);
                log::error!("restore '{}' failed - {}", task.restore_id, err);
                task.status = RestoreStatus::Error;
                if let Err(put_err) = self.metadata.put_restore_task(&task).await {
                    log::warn!(
                        "unable to store error state of restore '{}' - {}",
                        task.restore_id,
                        put_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn restore_blocks(
        &self,
        target: Arc<dyn DiskAccess>,
        record: Arc<BackupRecord>,
    ) -> Result<RestoreStats, Error> {
        let block_count = record.block_count()?;

        let pool = BufferPool::new(self.config.pool_capacity, self.config.block_size as usize);
        self.abort.attach(&pool);

        let context = Arc::new(RestoreContext {
            runtime: tokio::runtime::Handle::current(),
            store: Arc::clone(self.metadata.store()),
            bucket: self.metadata.layout().bucket().to_string(),
            crypto: Arc::clone(&self.crypto),
            target,
            record,
            pool,
            abort: self.abort.clone(),
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay(),
            fetched_blocks: AtomicU64::new(0),
            fetched_bytes: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
        });

        let threads = self.config.worker_threads;
        let worker_context = Arc::clone(&context);
        let result = tokio::task::spawn_blocking(move || {
            let worker = Arc::clone(&worker_context);
            let handler = ParallelHandler::new("restore block worker", threads, move |index| {
                worker.restore_block(index)
            })?;

            let mut send_result = Ok(());
            for index in 0..block_count {
                if let Err(err) = handler.send(index) {
                    send_result = Err(err);
                    break;
                }
            }
            handler.complete()?;
            send_result
        })
        .await
        .map_err(|err| format_err!("block restore task failed - {}", err))?;

        if self.abort.is_aborted() {
            return Err(BackupError::Aborted.into());
        }
        result?;

        let fetched_blocks = context.fetched_blocks.load(Ordering::SeqCst);
        Ok(RestoreStats {
            total_blocks: block_count as u64,
            fetched_blocks,
            empty_blocks: block_count as u64 - fetched_blocks,
            written_bytes: context.written_bytes.load(Ordering::SeqCst),
            fetched_bytes: context.fetched_bytes.load(Ordering::SeqCst),
            duration: Duration::default(),
        })
    }
}

struct RestoreContext {
    runtime: tokio::runtime::Handle,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    crypto: Arc<dyn CryptoProvider>,
    target: Arc<dyn DiskAccess>,
    record: Arc<BackupRecord>,
    pool: Arc<BufferPool>,
    abort: AbortHandle,
    max_retries: usize,
    retry_delay: Duration,
    fetched_blocks: AtomicU64,
    fetched_bytes: AtomicU64,
    written_bytes: AtomicU64,
}

impl RestoreContext {
    fn restore_block(&self, index: BlockIndex) -> Result<(), Error> {
        self.abort.check()?;

        let record = &self.record;
        let region = block_region(index, record.block_size, record.disk_size)?;

        match record.block_table.get(&index) {
            Some(expected) => {
                // bounds the number of blocks held in memory
                let mut buffer = self.pool.acquire()?;
                let key = VolumeLayout::block_key(record.blob_owner(index), index);
                retry(
                    &format!("restore of block {}", index),
                    self.max_retries,
                    self.retry_delay,
                    || self.fetch_block(index, &key, &region, *expected, &mut buffer),
                )?;
                self.write_block(index, &region, &buffer)?;
                self.fetched_blocks.fetch_add(1, Ordering::SeqCst);
            }
            None if record.empty_blocks.contains(&index) => {
                let zero = vec![0u8; region.length as usize];
                self.write_block(index, &region, &zero)?;
            }
            None => bail!(
                "backup '{}' has no entry for block {}",
                record.backup_id,
                index
            ),
        }
        Ok(())
    }

    fn fetch_block(
        &self,
        index: BlockIndex,
        key: &str,
        region: &Region,
        expected: Fingerprint,
        buffer: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let raw = self
            .runtime
            .block_on(self.store.get(&self.bucket, key))
            .map_err(|err| BackupError::Io {
                index,
                msg: format!("fetching '{}' failed - {}", key, err),
            })?
            .ok_or_else(|| BackupError::not_found("block blob", key))?;
        self.fetched_bytes
            .fetch_add(raw.len() as u64, Ordering::SeqCst);

        let data = self
            .crypto
            .decrypt(&self.record.encryption_key_ref, raw)
            .map_err(|err| format_err!("unable to decode block {} - {}", index, err))?;

        if data.len() as u64 != region.length {
            bail!(
                "block {} has {} bytes, expected {}",
                index,
                data.len(),
                region.length
            );
        }
        let digest = fingerprint(&data);
        if digest != expected {
            bail!(
                "block {} fingerprint mismatch ({} != {})",
                index,
                digest,
                expected
            );
        }

        buffer.clear();
        buffer.extend_from_slice(&data);
        Ok(())
    }

    fn write_block(&self, index: BlockIndex, region: &Region, data: &[u8]) -> Result<(), Error> {
        retry(
            &format!("write of block {}", index),
            self.max_retries,
            self.retry_delay,
            || {
                self.target.write(region, data).map_err(|err| {
                    BackupError::Io {
                        index,
                        msg: err.to_string(),
                    }
                    .into()
                })
            },
        )?;
        self.written_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);
        Ok(())
    }
}
