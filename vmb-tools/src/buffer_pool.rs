//! Bounded pool of reusable staging buffers
//!
//! Producers [acquire](BufferPool::acquire) a buffer, fill it and hand the
//! [BufferHandle] to an asynchronous consumer. The buffer goes back into the
//! pool when the consumer releases (or drops) the handle. Since the handle
//! owns the buffer memory, a buffer can never be handed out again while the
//! consumer still reads from it.
//!
//! The pool capacity bounds both memory usage and the number of consumers
//! working at the same time. [wait_idle](BufferPool::wait_idle) blocks until
//! every buffer has been returned, which is the barrier proving that no
//! asynchronous work is left.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Error;

use vmb_api_types::BackupError;

struct PoolState {
    free: Vec<(usize, Vec<u8>)>,
    closed: bool,
}

pub struct BufferPool {
    state: Mutex<PoolState>,
    available: Condvar,
    idle: Condvar,
    capacity: usize,
    buffer_size: usize,
}

/// Exclusive ownership token for one pool buffer.
///
/// Dereferences to the buffer contents. Dropping the handle returns the
/// buffer to its pool.
pub struct BufferHandle {
    pool: Arc<BufferPool>,
    index: usize,
    data: Vec<u8>,
}

impl BufferHandle {
    /// Arena index of the buffer inside its pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Deref for BufferHandle {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for BufferHandle {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.pool.put_back(self.index, data);
    }
}

impl BufferPool {
    /// Create a pool of `capacity` buffers, each able to hold `buffer_size`
    /// bytes without reallocation.
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        let free = (0..capacity)
            .rev()
            .map(|index| (index, Vec::with_capacity(buffer_size)))
            .collect();

        Arc::new(Self {
            state: Mutex::new(PoolState {
                free,
                closed: false,
            }),
            available: Condvar::new(),
            idle: Condvar::new(),
            capacity,
            buffer_size,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Get a free buffer, blocking until one is available.
    ///
    /// Fails with [BackupError::PoolClosed] once the pool is closed.
    pub fn acquire(self: &Arc<Self>) -> Result<BufferHandle, Error> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(BackupError::PoolClosed.into());
            }
            if let Some((index, data)) = state.free.pop() {
                return Ok(BufferHandle {
                    pool: Arc::clone(self),
                    index,
                    data,
                });
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Like [acquire](Self::acquire), but gives up after `timeout`.
    pub fn acquire_timeout(
        self: &Arc<Self>,
        timeout: Duration,
    ) -> Result<Option<BufferHandle>, Error> {
        let state = self.state.lock().unwrap();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |state| {
                !state.closed && state.free.is_empty()
            })
            .unwrap();

        if state.closed {
            return Err(BackupError::PoolClosed.into());
        }
        Ok(state.free.pop().map(|(index, data)| BufferHandle {
            pool: Arc::clone(self),
            index,
            data,
        }))
    }

    /// Return a buffer to the pool.
    ///
    /// Must only be called once the consumer is completely done with the
    /// buffer memory, which is guaranteed by taking the handle by value.
    pub fn release(&self, handle: BufferHandle) {
        debug_assert!(std::ptr::eq(self, Arc::as_ptr(&handle.pool)));
        drop(handle);
    }

    fn put_back(&self, index: usize, mut data: Vec<u8>) {
        data.clear();
        let mut state = self.state.lock().unwrap();
        state.free.push((index, data));
        let idle = state.free.len() == self.capacity;
        drop(state);

        self.available.notify_one();
        if idle {
            self.idle.notify_all();
        }
    }

    /// Wake up all waiting producers. Further `acquire` calls fail.
    ///
    /// Buffers still out are returned as usual.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    /// Number of buffers currently handed out.
    pub fn outstanding(&self) -> usize {
        self.capacity - self.state.lock().unwrap().free.len()
    }

    /// Block until every buffer is back in the pool.
    pub fn wait_idle(&self) {
        let state = self.state.lock().unwrap();
        let _state = self
            .idle
            .wait_while(state, |state| state.free.len() < self.capacity)
            .unwrap();
    }
}
