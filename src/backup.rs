//! Backup orchestration
//!
//! A run walks through [BackupState]: `Init` resolves the baseline and takes
//! the disk snapshot, `Enumerating` decides which blocks need to be read,
//! `Processing` reads, fingerprints, encrypts and uploads them on a
//! [ParallelHandler], and `Finalizing` waits until every buffer is back in
//! the pool before the record is published.
//!
//! A failed run leaves a record with status `error` behind and is never added
//! to the volume chain, so the next incremental run cannot pick it up as a
//! baseline.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};

use proxmox_human_byte::HumanByte;

use vmb_api_types::{
    backup_error, block_region, BackupConfig, BackupError, BackupRecord, BackupStatus, BlockIndex,
    Region,
};
use vmb_datastore::file_formats::ENCRYPTED_BLOB_HEADER_SIZE;
use vmb_datastore::layout::{check_id, generate_id};
use vmb_datastore::{CryptoProvider, MetadataStore, VolumeLayout};
use vmb_tools::retry::retry;
use vmb_tools::{fingerprint, is_zero_block, BufferPool, LivenessQueue, ParallelHandler};

use crate::abort::AbortHandle;
use crate::disk::DiskAccess;
use crate::uploader::Uploader;
use crate::watchdog::Watchdog;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackupState {
    Init,
    Enumerating,
    Processing,
    Finalizing,
    Complete,
    Error,
}

/// What to back up.
#[derive(Clone, Debug, Default)]
pub struct BackupRequest {
    /// Generated from the start time if not set.
    pub backup_id: Option<String>,
    /// Only read blocks changed since the latest backup of the volume.
    pub incremental: bool,
    /// Key reference used to encrypt the blocks, empty for plain blobs.
    pub key_ref: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BackupStats {
    pub total_blocks: u64,
    pub read_blocks: u64,
    pub uploaded_blocks: u64,
    pub reused_blocks: u64,
    pub empty_blocks: u64,
    /// Bytes covered by the disk.
    pub size: u64,
    pub read_bytes: u64,
    /// Plain size of all uploaded blocks.
    pub dirty_bytes: u64,
    /// Stored (encoded) size of all uploaded blocks.
    pub uploaded_bytes: u64,
    pub reused_bytes: u64,
    pub duration: Duration,
}

#[derive(Debug)]
pub struct BackupOutcome {
    pub record: BackupRecord,
    pub stats: BackupStats,
}

pub struct BackupJob {
    disk: Arc<dyn DiskAccess>,
    metadata: MetadataStore,
    crypto: Arc<dyn CryptoProvider>,
    config: BackupConfig,
    abort: AbortHandle,
    state: BackupState,
}

impl BackupJob {
    pub fn new(
        disk: Arc<dyn DiskAccess>,
        metadata: MetadataStore,
        crypto: Arc<dyn CryptoProvider>,
        config: BackupConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        Ok(Self {
            disk,
            metadata,
            crypto,
            config,
            abort: AbortHandle::new(),
            state: BackupState::Init,
        })
    }

    /// Use an externally created abort handle.
    pub fn with_abort_handle(mut self, abort: AbortHandle) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    fn set_state(&mut self, state: BackupState) {
        log::debug!("backup state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    pub async fn run(&mut self, request: BackupRequest) -> Result<BackupOutcome, Error> {
        let start = Instant::now();
        self.set_state(BackupState::Init);

        let ctime = proxmox_time::epoch_i64();
        let backup_id = match &request.backup_id {
            Some(id) => id.clone(),
            None => generate_id("backup", ctime)?,
        };
        check_id("backup id", &backup_id)?;

        match self.metadata.get_backup_record(&backup_id).await {
            Ok(_) => bail!("backup '{}' already exists", backup_id),
            Err(err) if matches!(backup_error(&err), Some(BackupError::NotFound { .. })) => (),
            Err(err) => return Err(err),
        }

        let mut record = BackupRecord::new(
            &backup_id,
            self.metadata.layout().volume_id(),
            &request.key_ref,
            self.disk.capacity(),
            self.config.block_size,
        );
        record.ctime = ctime;

        log::info!(
            "starting {} backup '{}' of {} ({})",
            if request.incremental { "incremental" } else { "full" },
            backup_id,
            self.disk.name(),
            HumanByte::from(record.disk_size),
        );

        match self.execute(&mut record, &request, start).await {
            Ok(stats) => {
                self.set_state(BackupState::Complete);
                Ok(BackupOutcome { record, stats })
            }
            Err(err) => {
                self.set_state(BackupState::Error);
                log::error!("backup '{}' failed - {}", backup_id, err);
                record.status = BackupStatus::Error;
                if let Err(put_err) = self.metadata.put_backup_record(&record).await {
                    log::warn!(
                        "unable to store error state of backup '{}' - {}",
                        backup_id,
                        put_err
                    );
                }
                Err(err)
            }
        }
    }

    async fn execute(
        &mut self,
        record: &mut BackupRecord,
        request: &BackupRequest,
        start: Instant,
    ) -> Result<BackupStats, Error> {
        self.abort.check()?;

        let block_count = record.block_count()?;
        let baseline = if request.incremental {
            let volume_id = record.volume_id.clone();
            match self.metadata.get_latest_backup_for(&volume_id).await? {
                Some(baseline) => {
                    check_baseline(&baseline, record)?;
                    Some(Arc::new(baseline))
                }
                None => {
                    return Err(BackupError::not_found("baseline of volume", &volume_id).into());
                }
            }
        } else {
            None
        };

        record.snapshot_ref = self.disk.begin_snapshot()?;
        self.metadata.put_backup_record(record).await?;

        self.set_state(BackupState::Enumerating);
        let to_read = self.enumerate(record, baseline.as_deref(), block_count)?;
        log::debug!(
            "backup '{}': {} of {} blocks need to be read",
            record.backup_id,
            to_read.len(),
            block_count
        );

        let mut stats = BackupStats {
            total_blocks: block_count as u64,
            size: record.disk_size,
            ..Default::default()
        };
        for index in 0..block_count {
            if to_read.contains(&index) {
                continue;
            }
            if record.empty_blocks.contains(&index) {
                stats.empty_blocks += 1;
            } else if record.block_table.contains_key(&index) {
                stats.reused_blocks += 1;
                let region = block_region(index, record.block_size, record.disk_size)?;
                stats.reused_bytes += region.length;
            }
        }

        self.set_state(BackupState::Processing);
        let processed = self.process(record, baseline, to_read, &mut stats).await;

        self.set_state(BackupState::Finalizing);
        processed?;

        if record.block_table.len() + record.empty_blocks.len() != block_count as usize {
            bail!(
                "backup '{}' covers {} of {} blocks",
                record.backup_id,
                record.block_table.len() + record.empty_blocks.len(),
                block_count
            );
        }
        record.check_consistency()?;

        record.status = BackupStatus::Complete;
        self.metadata.put_backup_record(record).await?;
        self.metadata.append_backup(&record.backup_id).await?;

        stats.duration = start.elapsed();
        log_stats(&record.backup_id, &stats);

        Ok(stats)
    }

    // Decide which blocks are read. Blocks not returned are already settled in
    // `record` (empty or inherited from the baseline).
    fn enumerate(
        &self,
        record: &mut BackupRecord,
        baseline: Option<&BackupRecord>,
        block_count: BlockIndex,
    ) -> Result<BTreeSet<BlockIndex>, Error> {
        let since = baseline.and_then(|baseline| baseline.snapshot_ref.as_deref());

        if let (Some(baseline), Some(since)) = (baseline, since) {
            let changed = self.disk.query_changed_regions(since)?;
            let mut to_read = blocks_of(&changed, record.block_size, block_count)?;
            for index in 0..block_count {
                if !to_read.contains(&index) && !record.inherit_block(baseline, index) {
                    // unknown to the baseline or resized with the disk
                    to_read.insert(index);
                }
            }
            return Ok(to_read);
        }

        if baseline.is_some() {
            log::info!("baseline has no snapshot reference, reading all allocated blocks");
        }

        let allocated = self.disk.query_allocated_regions()?;
        let to_read = blocks_of(&allocated, record.block_size, block_count)?;
        for index in 0..block_count {
            if !to_read.contains(&index) {
                record.set_empty(index);
            }
        }
        Ok(to_read)
    }

    async fn process(
        &self,
        record: &mut BackupRecord,
        baseline: Option<Arc<BackupRecord>>,
        to_read: BTreeSet<BlockIndex>,
        stats: &mut BackupStats,
    ) -> Result<(), Error> {
        let pool = BufferPool::new(
            self.config.pool_capacity,
            self.config.block_size as usize + ENCRYPTED_BLOB_HEADER_SIZE,
        );
        self.abort.attach(&pool);

        let mut uploader = Uploader::new(
            tokio::runtime::Handle::current(),
            Arc::clone(self.metadata.store()),
            self.metadata.layout().bucket(),
            self.config.max_retries,
            self.config.retry_delay(),
        );
        let watchdog_timeout = self.config.watchdog_timeout();
        let progress = Arc::new(LivenessQueue::new());
        if watchdog_timeout.is_some() {
            uploader = uploader.with_progress(Arc::clone(&progress));
        }
        let uploader = Arc::new(uploader);

        let watchdog = match watchdog_timeout {
            Some(timeout) => Some(Watchdog::start(
                progress,
                Arc::clone(&pool),
                Arc::clone(&uploader),
                timeout,
            )?),
            None => None,
        };

        let context = Arc::new(BlockContext {
            disk: Arc::clone(&self.disk),
            crypto: Arc::clone(&self.crypto),
            record: Mutex::new(record.clone()),
            baseline,
            pool: Arc::clone(&pool),
            uploader: Arc::clone(&uploader),
            abort: self.abort.clone(),
            max_retries: self.config.max_retries,
            retry_delay: self.config.retry_delay(),
            counters: ProcessCounters::default(),
        });

        let threads = self.config.worker_threads;
        let worker_context = Arc::clone(&context);
        let result = tokio::task::spawn_blocking(move || {
            let result = run_workers(&worker_context, to_read, threads);
            // all uploads are done once every buffer is back
            worker_context.pool.wait_idle();
            result
        })
        .await
        .map_err(|err| format_err!("block processing task failed - {}", err));

        if let Some(watchdog) = watchdog {
            if watchdog.stop() {
                log::debug!("watchdog stopped the upload pipeline");
            }
        }

        let upload_error = uploader.take_error();
        let result = result.and_then(|result| result);

        if self.abort.is_aborted() {
            return Err(BackupError::Aborted.into());
        }
        if let Some(err) = upload_error {
            return Err(err);
        }
        result?;

        *record = context.record.lock().unwrap().clone();

        let counters = &context.counters;
        stats.read_blocks = counters.read_blocks.load(Ordering::SeqCst);
        stats.read_bytes = counters.read_bytes.load(Ordering::SeqCst);
        stats.reused_blocks += counters.reused_blocks.load(Ordering::SeqCst);
        stats.reused_bytes += counters.reused_bytes.load(Ordering::SeqCst);
        stats.empty_blocks += counters.empty_blocks.load(Ordering::SeqCst);
        stats.dirty_bytes = counters.dirty_bytes.load(Ordering::SeqCst);
        stats.uploaded_blocks = uploader.uploaded_blocks();
        stats.uploaded_bytes = uploader.uploaded_bytes();

        Ok(())
    }
}

#[derive(Default)]
struct ProcessCounters {
    read_blocks: AtomicU64,
    read_bytes: AtomicU64,
    reused_blocks: AtomicU64,
    reused_bytes: AtomicU64,
    empty_blocks: AtomicU64,
    dirty_bytes: AtomicU64,
}

// Shared by all block workers of one run.
struct BlockContext {
    disk: Arc<dyn DiskAccess>,
    crypto: Arc<dyn CryptoProvider>,
    record: Mutex<BackupRecord>,
    baseline: Option<Arc<BackupRecord>>,
    pool: Arc<BufferPool>,
    uploader: Arc<Uploader>,
    abort: AbortHandle,
    max_retries: usize,
    retry_delay: Duration,
    counters: ProcessCounters,
}

impl BlockContext {
    fn process_block(&self, index: BlockIndex) -> Result<(), Error> {
        self.abort.check()?;
        self.uploader.check_abort()?;

        let (backup_id, key_ref, region) = {
            let record = self.record.lock().unwrap();
            (
                record.backup_id.clone(),
                record.encryption_key_ref.clone(),
                block_region(index, record.block_size, record.disk_size)?,
            )
        };

        let data = self.read_block(index, &region)?;
        self.counters.read_blocks.fetch_add(1, Ordering::SeqCst);
        self.counters
            .read_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);

        if is_zero_block(&data) {
            log::trace!("block {} is empty", index);
            self.record.lock().unwrap().set_empty(index);
            self.counters.empty_blocks.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }

        let digest = fingerprint(&data);

        if let Some(baseline) = &self.baseline {
            if baseline.block_table.get(&index) == Some(&digest)
                && self.record.lock().unwrap().inherit_block(baseline, index)
            {
                log::trace!("block {} unchanged ({})", index, digest);
                self.counters.reused_blocks.fetch_add(1, Ordering::SeqCst);
                self.counters
                    .reused_bytes
                    .fetch_add(data.len() as u64, Ordering::SeqCst);
                return Ok(());
            }
        }

        let mut buffer = self.pool.acquire()?;
        retry(
            &format!("encryption of block {}", index),
            self.max_retries,
            self.retry_delay,
            || self.crypto.encrypt_into(&key_ref, &data, &mut buffer),
        )?;

        log::trace!("upload block {} ({}, {} bytes)", index, digest, buffer.len());
        self.record.lock().unwrap().set_block(index, digest, None);
        self.counters
            .dirty_bytes
            .fetch_add(data.len() as u64, Ordering::SeqCst);

        self.uploader
            .submit(index, VolumeLayout::block_key(&backup_id, index), buffer)
    }

    fn read_block(&self, index: BlockIndex, region: &Region) -> Result<Vec<u8>, Error> {
        retry(
            &format!("read of block {}", index),
            self.max_retries,
            self.retry_delay,
            || {
                let data = self.disk.read(region).map_err(|err| BackupError::Io {
                    index,
                    msg: err.to_string(),
                })?;
                if data.len() as u64 != region.length {
                    return Err(BackupError::Io {
                        index,
                        msg: format!("short read ({} of {} bytes)", data.len(), region.length),
                    }
                    .into());
                }
                Ok(data)
            },
        )
    }
}

fn run_workers(
    context: &Arc<BlockContext>,
    to_read: BTreeSet<BlockIndex>,
    threads: usize,
) -> Result<(), Error> {
    let worker = Arc::clone(context);
    let handler = ParallelHandler::new("backup block worker", threads, move |index| {
        worker.process_block(index)
    })?;

    let mut send_result = Ok(());
    for index in to_read {
        if let Err(err) = handler.send(index) {
            send_result = Err(err);
            break;
        }
    }

    // the handler error keeps its type, prefer it over the send failure
    handler.complete()?;
    send_result
}

fn check_baseline(baseline: &BackupRecord, record: &BackupRecord) -> Result<(), Error> {
    let mismatch = |msg: String| -> Error {
        BackupError::DedupMismatch {
            backup_id: baseline.backup_id.clone(),
            msg,
        }
        .into()
    };

    if baseline.block_size != record.block_size {
        return Err(mismatch(format!(
            "block size {} differs from {}",
            baseline.block_size, record.block_size
        )));
    }
    if baseline.encryption_key_ref != record.encryption_key_ref {
        return Err(mismatch(format!(
            "encrypted with key '{}' instead of '{}'",
            baseline.encryption_key_ref, record.encryption_key_ref
        )));
    }
    baseline
        .check_consistency()
        .map_err(|err| mismatch(err.to_string()))?;

    if baseline.disk_size != record.disk_size {
        // blocks with another length are read again, see inherit_block
        let resized: Vec<BlockIndex> = baseline
            .block_table
            .keys()
            .chain(baseline.empty_blocks.iter())
            .filter(|index| baseline.block_length(**index) != record.block_length(**index))
            .copied()
            .collect();
        log::info!(
            "disk size changed from {} to {} bytes since '{}', re-reading blocks {:?}",
            baseline.disk_size,
            record.disk_size,
            baseline.backup_id,
            resized
        );
    }
    Ok(())
}

// Indices of all blocks touched by `regions`.
fn blocks_of(
    regions: &[Region],
    block_size: u64,
    block_count: BlockIndex,
) -> Result<BTreeSet<BlockIndex>, Error> {
    let mut list = BTreeSet::new();
    for region in regions {
        for index in region.block_range(block_size) {
            if index >= block_count as u64 {
                bail!("region {} is outside of the disk", region);
            }
            list.insert(index as BlockIndex);
        }
    }
    Ok(list)
}

fn log_stats(backup_id: &str, stats: &BackupStats) {
    let size: HumanByte = stats.size.into();
    let size_dirty: HumanByte = stats.dirty_bytes.into();
    let size_uploaded: HumanByte = stats.uploaded_bytes.into();
    log::info!(
        "{}: had to backup {} of {} (stored {}) in {:.2}s",
        backup_id,
        size_dirty,
        size,
        size_uploaded,
        stats.duration.as_secs_f64()
    );

    let micros = stats.duration.as_micros().max(1) as u64;
    let speed: HumanByte = ((stats.read_bytes * 1_000_000) / micros).into();
    log::info!("{}: average read speed: {}/s", backup_id, speed);

    if stats.reused_bytes > 0 && stats.size > 0 {
        let reused_percent = stats.reused_bytes as f64 * 100. / stats.size as f64;
        let reused: HumanByte = stats.reused_bytes.into();
        log::info!(
            "{}: backup was done incrementally, reused {} ({:.1}%)",
            backup_id,
            reused,
            reused_percent
        );
    }
    log::debug!(
        "{}: {} blocks, {} uploaded, {} reused, {} empty",
        backup_id,
        stats.total_blocks,
        stats.uploaded_blocks,
        stats.reused_blocks,
        stats.empty_blocks
    );
}
