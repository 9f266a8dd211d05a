//! Fixed-size byte-slab pool.
//!
//! Stream chunks rent slabs here instead of allocating per write. A rented
//! slab may carry a semaphore permit from its stream's back-pressure bound;
//! dropping the slab returns it to the free list and releases the permit,
//! which is what resumes a producer suspended in `enqueue`.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::OwnedSemaphorePermit;

/// Default slab size for stream chunks.
pub const CHUNK_SIZE: usize = 8192;

/// Pool of equally sized byte slabs, scoped to a connection or socket
/// context. Rent never blocks: an empty free list allocates.
pub struct BufferPool {
    free: Mutex<Vec<Box<[u8]>>>,
    chunk_size: usize,
    max_cached: usize,
}

impl BufferPool {
    pub fn new(chunk_size: usize, max_cached: usize) -> Arc<Self> {
        Arc::new(Self {
            free: Mutex::new(Vec::new()),
            chunk_size,
            max_cached,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn rent(self: &Arc<Self>) -> PooledBuf {
        let slab = self
            .free
            .lock()
            .expect("pool lock")
            .pop()
            .unwrap_or_else(|| vec![0u8; self.chunk_size].into_boxed_slice());
        PooledBuf {
            slab: Some(slab),
            pool: Arc::downgrade(self),
            permit: None,
        }
    }

    fn give_back(&self, slab: Box<[u8]>) {
        let mut free = self.free.lock().expect("pool lock");
        if free.len() < self.max_cached {
            free.push(slab);
        }
    }

    #[cfg(test)]
    fn cached(&self) -> usize {
        self.free.lock().expect("pool lock").len()
    }
}

/// A rented slab. Returned to its pool on drop.
pub struct PooledBuf {
    slab: Option<Box<[u8]>>,
    pool: Weak<BufferPool>,
    permit: Option<OwnedSemaphorePermit>,
}

impl PooledBuf {
    /// Tie a back-pressure permit to this slab's lifetime.
    pub fn attach_permit(&mut self, permit: OwnedSemaphorePermit) {
        self.permit = Some(permit);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.slab.as_deref().expect("slab present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.slab.as_deref_mut().expect("slab present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let (Some(slab), Some(pool)) = (self.slab.take(), self.pool.upgrade()) {
            pool.give_back(slab);
        }
        // permit (if any) drops here, waking a suspended producer
    }
}

impl core::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.slab.as_ref().map_or(0, |s| s.len()))
            .finish()
    }
}
