//! Fixed-size frame buffer pool.
//!
//! Buffers are pre-allocated for one frame shape and handed out as
//! [`BufferHandle`]s. Dropping a handle gives its buffer back, so a buffer
//! returns to the pool on every exit path: normal completion, a failed
//! inference call, or a cancelled job.
//!
//! The pool may grow past its capacity up to `capacity * overflow_factor`.
//! Buffers allocated beyond capacity are retired when released.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::metrics;

/// Dimensions of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32, channels: u32) -> Self {
        Self {
            width,
            height,
            channels,
        }
    }

    /// Byte length of one frame (8 bits per channel).
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    pub max_allocated: usize,
    /// Buffers currently allocated (free + in use)
    pub allocated: usize,
    pub free: usize,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub allocated_beyond_capacity: usize,
    /// Buffers dropped by shrink or retirement
    pub retired: u64,
    /// Acquisitions refused because the ceiling was reached
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Vec<u8>>,
    allocated: usize,
    in_use: usize,
    peak_in_use: usize,
    retired: u64,
    exhausted: u64,
}

#[derive(Debug)]
struct PoolInner {
    shape: FrameShape,
    capacity: usize,
    max_allocated: usize,
    state: Mutex<PoolState>,
    released: Notify,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn give_back(&self, buffer: Vec<u8>) {
        let mut state = self.state();
        state.in_use = state.in_use.saturating_sub(1);

        if buffer.len() != self.shape.byte_len() {
            warn!(
                expected = self.shape.byte_len(),
                actual = buffer.len(),
                "Retiring frame buffer with unexpected length"
            );
            state.allocated = state.allocated.saturating_sub(1);
            state.retired += 1;
            metrics::record_pool_retired(1);
        } else if state.allocated > self.capacity {
            state.allocated -= 1;
            state.retired += 1;
            metrics::record_pool_retired(1);
        } else {
            state.free.push(buffer);
        }

        publish(&state, self.capacity);
        drop(state);
        self.released.notify_one();
    }
}

fn publish(state: &PoolState, capacity: usize) {
    metrics::record_pool_state(
        state.free.len(),
        state.in_use,
        state.allocated.saturating_sub(capacity),
    );
}

/// Pool of equally sized frame buffers. Cloning shares the pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool and pre-allocate `capacity` buffers of `shape`.
    pub fn new(shape: FrameShape, capacity: usize, overflow_factor: f64) -> Self {
        let capacity = capacity.max(1);
        let max_allocated = ((capacity as f64 * overflow_factor.max(1.0)).ceil() as usize)
            .max(capacity);
        let byte_len = shape.byte_len();

        let free = (0..capacity).map(|_| vec![0u8; byte_len]).collect();
        let state = PoolState {
            free,
            allocated: capacity,
            ..Default::default()
        };

        debug!(
            width = shape.width,
            height = shape.height,
            capacity,
            max_allocated,
            "Frame buffer pool allocated"
        );

        Self {
            inner: Arc::new(PoolInner {
                shape,
                capacity,
                max_allocated,
                state: Mutex::new(state),
                released: Notify::new(),
            }),
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.inner.shape
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Take a free buffer, allocating a new one while under the ceiling.
    pub fn acquire(&self) -> Result<BufferHandle, PoolError> {
        let mut state = self.inner.state();

        let buffer = if let Some(buffer) = state.free.pop() {
            buffer
        } else if state.allocated < self.inner.max_allocated {
            state.allocated += 1;
            vec![0u8; self.inner.shape.byte_len()]
        } else {
            state.exhausted += 1;
            metrics::record_pool_exhausted();
            return Err(PoolError::Exhausted {
                allocated: state.allocated,
                max_allocated: self.inner.max_allocated,
            });
        };

        state.in_use += 1;
        state.peak_in_use = state.peak_in_use.max(state.in_use);
        publish(&state, self.inner.capacity);

        Ok(BufferHandle {
            buffer: Some(buffer),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Acquire a buffer, waiting up to `wait` for one to be released.
    pub async fn acquire_timeout(&self, wait: Duration) -> Result<BufferHandle, PoolError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.acquire() {
                Ok(handle) => return Ok(handle),
                Err(err) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(err);
                    }
                }
            }
        }
    }

    /// Return a buffer to the pool. Equivalent to dropping the handle.
    pub fn release(&self, handle: BufferHandle) {
        drop(handle);
    }

    /// Drop up to `count` free buffers. Buffers in use are never touched.
    pub fn shrink(&self, count: usize) -> usize {
        let mut state = self.inner.state();
        let removed = count.min(state.free.len());
        let keep = state.free.len() - removed;
        state.free.truncate(keep);
        state.allocated -= removed;
        state.retired += removed as u64;
        publish(&state, self.inner.capacity);

        if removed > 0 {
            metrics::record_pool_retired(removed);
            debug!(removed, remaining = keep, "Frame buffer pool shrunk");
        }
        removed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state();
        PoolStats {
            capacity: self.inner.capacity,
            max_allocated: self.inner.max_allocated,
            allocated: state.allocated,
            free: state.free.len(),
            in_use: state.in_use,
            peak_in_use: state.peak_in_use,
            allocated_beyond_capacity: state.allocated.saturating_sub(self.inner.capacity),
            retired: state.retired,
            exhausted: state.exhausted,
        }
    }
}

/// Exclusive ownership of one pooled buffer.
#[derive(Debug)]
pub struct BufferHandle {
    buffer: Option<Vec<u8>>,
    pool: Arc<PoolInner>,
}

impl BufferHandle {
    pub fn shape(&self) -> FrameShape {
        self.pool.shape
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or(&mut [])
    }

    /// Direct access to the backing vector. A buffer whose length no longer
    /// matches the pool's frame shape is retired on release.
    #[cfg(test)]
    pub(crate) fn storage_mut(&mut self) -> &mut Vec<u8> {
        self.buffer.get_or_insert_with(Vec::new)
    }

    /// Whether the buffer still holds exactly one frame of the pool's shape.
    pub fn is_well_formed(&self) -> bool {
        self.as_slice().len() == self.pool.shape.byte_len()
    }
}

impl Deref for BufferHandle {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for BufferHandle {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            self.pool.give_back(buffer);
        }
    }
}
