//! Upload pipeline watchdog
//!
//! Declares the run stalled if buffers are out but no upload finished
//! within the timeout. Waiting uses the edge-triggered
//! [LivenessQueue::wait_for_new_item], so completions that happened before
//! a wait started are never mistaken for progress.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{format_err, Error};

use vmb_api_types::BackupError;
use vmb_tools::{BufferPool, LivenessQueue};

use crate::uploader::{UploadDone, Uploader};

pub struct Watchdog {
    queue: Arc<LivenessQueue<UploadDone>>,
    handle: Option<JoinHandle<bool>>,
}

impl Watchdog {
    /// Start watching. The uploader must push its completions to `queue`.
    pub fn start(
        queue: Arc<LivenessQueue<UploadDone>>,
        pool: Arc<BufferPool>,
        uploader: Arc<Uploader>,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let watched = Arc::clone(&queue);
        let handle = std::thread::Builder::new()
            .name("upload watchdog".to_string())
            .spawn(move || {
                loop {
                    match watched.wait_for_new_item(timeout) {
                        Some(done) => {
                            log::trace!("watchdog: upload of block {} finished", done.index);
                        }
                        None if watched.is_closed() => return false,
                        None if pool.outstanding() == 0 => {
                            // nothing in flight, workers are busy elsewhere
                        }
                        None => {
                            log::error!(
                                "no upload finished within {:?}, {} still outstanding",
                                timeout,
                                pool.outstanding()
                            );
                            uploader.record_error(BackupError::Stalled(timeout).into());
                            pool.close();
                            uploader.cancel_all();
                            return true;
                        }
                    }
                }
            })
            .map_err(|err| format_err!("unable to start watchdog thread - {}", err))?;

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Stop the watchdog. Returns true if it declared the run stalled.
    pub fn stop(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        self.queue.close();
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or(false),
            None => false,
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}
