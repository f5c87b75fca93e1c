//! Offset-tracked buffer pool for moving large feature vectors between
//! extraction workers and the index writer without a fresh allocation per
//! vector.
//!
//! Regions are handed out first-fit from a free list kept sorted by offset.
//! Freed regions merge with adjacent free neighbours. Backing storage is only
//! given back to the allocator by `compact`, and only when nothing is live.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Buffer pool exhausted: requested {requested} slots, largest free region is {largest}")]
    Exhausted { requested: usize, largest: usize },

    #[error("Zero-length buffer requested")]
    EmptyRequest,

    #[error("Stale or unknown buffer handle at offset {offset}")]
    InvalidHandle { offset: usize },

    #[error("Write of {actual} values into a buffer of {expected}")]
    LengthMismatch { expected: usize, actual: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle {
    offset: usize,
    len: usize,
    generation: u64,
}

impl BufferHandle {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    offset: usize,
    len: usize,
}

#[derive(Debug)]
pub struct BufferPool {
    storage: Vec<f32>,
    capacity: usize,
    free: Vec<Region>,
    live: BTreeMap<usize, (usize, u64)>,
    next_generation: u64,
}

impl BufferPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            storage: Vec::new(),
            capacity,
            free: vec![Region {
                offset: 0,
                len: capacity,
            }],
            live: BTreeMap::new(),
            next_generation: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn live_regions(&self) -> usize {
        self.live.len()
    }

    pub fn free_slots(&self) -> usize {
        self.free.iter().map(|r| r.len).sum()
    }

    pub fn largest_free(&self) -> usize {
        self.free.iter().map(|r| r.len).max().unwrap_or(0)
    }

    /// Slots currently backed by memory.
    pub fn resident_slots(&self) -> usize {
        self.storage.len()
    }

    pub fn allocate(&mut self, len: usize) -> Result<BufferHandle, PoolError> {
        if len == 0 {
            return Err(PoolError::EmptyRequest);
        }
        let Some(slot) = self.free.iter().position(|r| r.len >= len) else {
            return Err(PoolError::Exhausted {
                requested: len,
                largest: self.largest_free(),
            });
        };

        let region = self.free[slot];
        if region.len == len {
            self.free.remove(slot);
        } else {
            self.free[slot] = Region {
                offset: region.offset + len,
                len: region.len - len,
            };
        }

        let end = region.offset + len;
        if self.storage.len() < end {
            self.storage.resize(end, 0.0);
        }

        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert(region.offset, (len, generation));

        Ok(BufferHandle {
            offset: region.offset,
            len,
            generation,
        })
    }

    pub fn write(&mut self, handle: &BufferHandle, data: &[f32]) -> Result<(), PoolError> {
        self.check(handle)?;
        if data.len() != handle.len {
            return Err(PoolError::LengthMismatch {
                expected: handle.len,
                actual: data.len(),
            });
        }
        self.storage[handle.offset..handle.offset + handle.len].copy_from_slice(data);
        Ok(())
    }

    pub fn read(&self, handle: &BufferHandle) -> Result<&[f32], PoolError> {
        self.check(handle)?;
        Ok(&self.storage[handle.offset..handle.offset + handle.len])
    }

    /// Copies the region out and releases it.
    pub fn take(&mut self, handle: BufferHandle) -> Result<Vec<f32>, PoolError> {
        let data = self.read(&handle)?.to_vec();
        self.release(handle)?;
        Ok(data)
    }

    pub fn release(&mut self, handle: BufferHandle) -> Result<(), PoolError> {
        self.check(&handle)?;
        self.live.remove(&handle.offset);

        let position = self.free.partition_point(|r| r.offset < handle.offset);
        self.free.insert(
            position,
            Region {
                offset: handle.offset,
                len: handle.len,
            },
        );

        // Merge with the following region, then the preceding one
        if position + 1 < self.free.len() {
            let (current, next) = (self.free[position], self.free[position + 1]);
            if current.offset + current.len == next.offset {
                self.free[position].len += next.len;
                self.free.remove(position + 1);
            }
        }
        if position > 0 {
            let (prev, current) = (self.free[position - 1], self.free[position]);
            if prev.offset + prev.len == current.offset {
                self.free[position - 1].len += current.len;
                self.free.remove(position);
            }
        }
        Ok(())
    }

    /// Drops backing storage when every region is free. Returns whether it did.
    pub fn compact(&mut self) -> bool {
        if !self.live.is_empty() {
            return false;
        }
        self.storage = Vec::new();
        self.free = vec![Region {
            offset: 0,
            len: self.capacity,
        }];
        true
    }

    fn check(&self, handle: &BufferHandle) -> Result<(), PoolError> {
        match self.live.get(&handle.offset) {
            Some(&(len, generation)) if len == handle.len && generation == handle.generation => {
                Ok(())
            }
            _ => Err(PoolError::InvalidHandle {
                offset: handle.offset,
            }),
        }
    }
}

/// A vector in transit: either owned inline or parked in the shared pool.
#[derive(Debug)]
pub enum VectorPayload {
    Inline(Vec<f32>),
    Pooled(PooledVector),
}

/// A live pool region. Dropping it without `materialize` hands the region
/// back, so abandoned results never pin pool space.
#[derive(Debug)]
pub struct PooledVector {
    handle: BufferHandle,
    pool: Arc<Mutex<BufferPool>>,
    released: bool,
}

impl PooledVector {
    pub fn handle(&self) -> BufferHandle {
        self.handle
    }

    fn into_vec(mut self) -> Result<Vec<f32>, PoolError> {
        self.released = true;
        lock_pool(&self.pool).take(self.handle)
    }
}

impl Drop for PooledVector {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = lock_pool(&self.pool).release(self.handle) {
            log::warn!("Failed to return abandoned vector to the pool: {}", e);
        }
    }
}

/// Thread-safe handle to a `BufferPool` used for cross-task vector transfer.
#[derive(Debug, Clone)]
pub struct SharedBufferPool {
    pool: Arc<Mutex<BufferPool>>,
    min_pooled_len: usize,
}

impl SharedBufferPool {
    pub fn new(capacity: usize, min_pooled_len: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(BufferPool::with_capacity(capacity))),
            min_pooled_len,
        }
    }

    /// Parks `vector` in the pool when it is large enough and space allows,
    /// otherwise keeps it inline.
    pub fn stage(&self, vector: Vec<f32>) -> VectorPayload {
        if vector.len() < self.min_pooled_len {
            return VectorPayload::Inline(vector);
        }
        let mut pool = self.lock();
        match pool.allocate(vector.len()) {
            Ok(handle) => match pool.write(&handle, &vector) {
                Ok(()) => VectorPayload::Pooled(PooledVector {
                    handle,
                    pool: self.pool.clone(),
                    released: false,
                }),
                Err(e) => {
                    log::warn!("Buffer pool write failed, keeping vector inline: {}", e);
                    let _ = pool.release(handle);
                    VectorPayload::Inline(vector)
                }
            },
            Err(e) => {
                log::debug!("Buffer pool full, keeping vector inline: {}", e);
                VectorPayload::Inline(vector)
            }
        }
    }

    pub fn materialize(&self, payload: VectorPayload) -> Result<Vec<f32>, PoolError> {
        match payload {
            VectorPayload::Inline(vector) => Ok(vector),
            VectorPayload::Pooled(pooled) => pooled.into_vec(),
        }
    }

    pub fn compact(&self) -> bool {
        self.lock().compact()
    }

    pub fn resident_bytes(&self) -> usize {
        self.lock().resident_slots() * std::mem::size_of::<f32>()
    }

    pub fn live_regions(&self) -> usize {
        self.lock().live_regions()
    }

    fn lock(&self) -> MutexGuard<'_, BufferPool> {
        lock_pool(&self.pool)
    }
}

fn lock_pool(pool: &Mutex<BufferPool>) -> MutexGuard<'_, BufferPool> {
    pool.lock().unwrap_or_else(PoisonError::into_inner)
}
