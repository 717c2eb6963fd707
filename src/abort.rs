use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Error;

use vmb_api_types::BackupError;
use vmb_tools::BufferPool;

#[derive(Default)]
struct AbortState {
    aborted: AtomicBool,
    pools: Mutex<Vec<Arc<BufferPool>>>,
}

/// Asks a running backup or restore to stop.
///
/// Aborting closes the buffer pool of the run, so producers blocked on it
/// wake up. Uploads already submitted still complete before the run
/// reports [BackupError::Aborted].
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortState>,
}

impl AbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn abort(&self) {
        if self.inner.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("abort requested");
        for pool in self.inner.pools.lock().unwrap().iter() {
            pool.close();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.aborted.load(Ordering::SeqCst)
    }

    /// Fails with [BackupError::Aborted] once [abort](Self::abort) was called.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_aborted() {
            return Err(BackupError::Aborted.into());
        }
        Ok(())
    }

    pub(crate) fn attach(&self, pool: &Arc<BufferPool>) {
        let mut pools = self.inner.pools.lock().unwrap();
        pools.push(Arc::clone(pool));
        if self.is_aborted() {
            pool.close();
        }
    }
}
