use crate::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Default number of buffers that may be leased at the same time.
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// A bounded pool of fixed-size scratch buffers.
///
/// Buffers are allocated lazily, up to `capacity` outstanding leases. Once the
/// bound is reached, [`BufferPool::acquire`] waits until a lease is returned.
/// Cloning the pool is cheap and every clone shares the same buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    buffer_size: usize,
    capacity: usize,
    acquire_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool of at most `capacity` buffers of `buffer_size` bytes.
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self::with_timeout(buffer_size, capacity, None)
    }

    /// Creates a pool whose [`acquire`](Self::acquire) gives up with
    /// [`Error::PoolExhausted`] after waiting `acquire_timeout`.
    pub fn with_timeout(
        buffer_size: usize,
        capacity: usize,
        acquire_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                buffer_size,
                capacity,
                acquire_timeout,
                permits: Arc::new(Semaphore::new(capacity)),
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Leases a buffer, waiting for one to be returned if the pool is at
    /// capacity.
    ///
    /// Fails with [`Error::AcquireCanceled`] as soon as `cancel` fires, and with
    /// [`Error::PoolExhausted`] if the configured timeout elapses first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<BufferLease, Error> {
        let permits = self.inner.permits.clone();
        let timeout = self.inner.acquire_timeout;
        let wait = async move {
            match timeout {
                Some(timeout) => tokio::time::timeout(timeout, permits.acquire_owned())
                    .await
                    .map_err(|_| Error::PoolExhausted)?
                    .map_err(|_| Error::PoolExhausted),
                None => permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::PoolExhausted),
            }
        };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::AcquireCanceled),
            permit = wait => permit?,
        };
        Ok(self.lease(permit))
    }

    /// Leases a buffer without waiting.
    pub fn try_acquire(&self) -> Result<BufferLease, Error> {
        match self.inner.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(self.lease(permit)),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(Error::PoolExhausted)
            }
        }
    }

    fn lease(&self, permit: OwnedSemaphorePermit) -> BufferLease {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let buf = match reused {
            Some(buf) => buf,
            None => {
                trace!(size = self.inner.buffer_size, "allocating pool buffer");
                Vec::with_capacity(self.inner.buffer_size)
            }
        };
        BufferLease {
            buf,
            pool: self.inner.clone(),
            _permit: permit,
        }
    }

    /// Size in bytes of every buffer handed out by this pool.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Maximum number of buffers leased at the same time.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of leases currently held.
    pub fn outstanding(&self) -> usize {
        self.inner.capacity - self.available()
    }

    /// Number of leases that can be granted without waiting.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Number of allocated buffers sitting in the pool, ready for reuse.
    pub fn idle(&self) -> usize {
        self.inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.inner.buffer_size)
            .field("capacity", &self.inner.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer exclusively leased from a [`BufferPool`].
///
/// The lease goes back to the pool when it is dropped or passed to
/// [`release`](Self::release), so it is returned exactly once. It never grows
/// beyond the pool's buffer size.
pub struct BufferLease {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
    // dropped after `Drop::drop` has put the buffer back
    _permit: OwnedSemaphorePermit,
}

impl BufferLease {
    /// Appends `data` if it fits in the remaining space. Returns false, leaving
    /// the buffer untouched, if it does not.
    pub fn try_extend(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining() {
            return false;
        }
        self.buf.extend_from_slice(data);
        true
    }

    /// The bytes written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing was written yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Total size of the buffer.
    pub fn capacity(&self) -> usize {
        self.pool.buffer_size
    }

    /// Bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.capacity() - self.buf.len()
    }

    /// Returns the buffer to its pool.
    pub fn release(self) {}
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        let mut idle = self
            .pool
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.pool.capacity {
            idle.push(buf);
        }
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferLease")
            .field("len", &self.buf.len())
            .field("capacity", &self.pool.buffer_size)
            .finish()
    }
}
