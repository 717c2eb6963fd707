//! Asynchronous block uploads
//!
//! Workers hand encoded blocks to the [Uploader] inside a pool
//! [BufferHandle]. The upload task owns the handle until the object store
//! is done with the data, then drops it, which returns the buffer to the
//! pool. The pool draining back to full capacity therefore proves that no
//! upload is left.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Error};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use vmb_api_types::{BackupError, BlockIndex};
use vmb_datastore::ObjectStore;
use vmb_tools::retry::retry_async;
use vmb_tools::{BufferHandle, LivenessQueue};

/// Completion notice pushed to the progress queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadDone {
    pub index: BlockIndex,
    pub ok: bool,
}

pub struct Uploader {
    runtime: Handle,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    max_retries: usize,
    retry_delay: Duration,
    error: Mutex<Option<Error>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    progress: Option<Arc<LivenessQueue<UploadDone>>>,
    uploaded_blocks: AtomicU64,
    uploaded_bytes: AtomicU64,
}

impl Uploader {
    pub fn new(
        runtime: Handle,
        store: Arc<dyn ObjectStore>,
        bucket: &str,
        max_retries: usize,
        retry_delay: Duration,
    ) -> Self {
        Self {
            runtime,
            store,
            bucket: bucket.to_string(),
            max_retries,
            retry_delay,
            error: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            progress: None,
            uploaded_blocks: AtomicU64::new(0),
            uploaded_bytes: AtomicU64::new(0),
        }
    }

    /// Report every finished upload to `queue`.
    pub fn with_progress(mut self, queue: Arc<LivenessQueue<UploadDone>>) -> Self {
        self.progress = Some(queue);
        self
    }

    /// Remember the first fatal error of the run.
    pub fn record_error(&self, err: Error) {
        let mut guard = self.error.lock().unwrap();
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    /// Fails if an upload (or the watchdog) already reported a fatal error.
    pub fn check_abort(&self) -> Result<(), Error> {
        if let Some(err) = &*self.error.lock().unwrap() {
            return Err(format_err!("{}", err));
        }
        Ok(())
    }

    /// Returns the recorded error, keeping its type.
    pub fn take_error(&self) -> Option<Error> {
        self.error.lock().unwrap().take()
    }

    pub fn uploaded_blocks(&self) -> u64 {
        self.uploaded_blocks.load(Ordering::SeqCst)
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.uploaded_bytes.load(Ordering::SeqCst)
    }

    /// Submit an asynchronous upload of `buffer` to `key`.
    ///
    /// Takes ownership of the buffer. It is returned to its pool when the
    /// upload task finished, successful or not.
    pub fn submit(
        self: &Arc<Self>,
        index: BlockIndex,
        key: String,
        buffer: BufferHandle,
    ) -> Result<(), Error> {
        self.check_abort()?;

        let uploader = Arc::clone(self);
        let task = self.runtime.spawn(async move {
            let what = format!("upload of block {} to {}", index, key);
            let result = retry_async(&what, uploader.max_retries, uploader.retry_delay, || {
                let uploader = &uploader;
                let key = &key;
                let data = buffer.as_slice();
                async move {
                    uploader
                        .store
                        .put(&uploader.bucket, key, data)
                        .await
                        .map_err(|err| {
                            Error::from(BackupError::Upload {
                                key: key.to_string(),
                                msg: err.to_string(),
                            })
                        })
                }
            })
            .await;

            let ok = match result {
                Ok(()) => {
                    log::trace!("uploaded block {} ({} bytes)", index, buffer.len());
                    uploader.uploaded_blocks.fetch_add(1, Ordering::SeqCst);
                    uploader
                        .uploaded_bytes
                        .fetch_add(buffer.len() as u64, Ordering::SeqCst);
                    true
                }
                Err(err) => {
                    log::error!("{} failed - {}", what, err);
                    uploader.record_error(err);
                    false
                }
            };

            // the store is done with the data, give the buffer back
            drop(buffer);

            if let Some(progress) = &uploader.progress {
                progress.push(UploadDone { index, ok });
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|task| !task.is_finished());
        // cancel_all may have run between check_abort and spawn
        if self.error.lock().unwrap().is_some() {
            task.abort();
        } else {
            tasks.push(task);
        }

        Ok(())
    }

    /// Cancel all unfinished uploads. Their buffers return to the pool when
    /// the tasks are dropped.
    pub fn cancel_all(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let mut count = 0;
        for task in tasks {
            if !task.is_finished() {
                task.abort();
                count += 1;
            }
        }
        if count > 0 {
            log::warn!("cancelled {} unfinished uploads", count);
        }
    }
}
