//! Thread registry: a bounded table of per-thread cache slots.
//!
//! Where the slots live is a [`SlotTable`] strategy. Both provided tables map
//! their memory straight from the OS, so registering a thread never
//! allocates.

use core::{
  mem::size_of,
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
};

use thiserror::Error;

use crate::{
  block::BlockSignature,
  cache::{CacheContext, CacheStats, ThreadCache},
  platform,
  sync::SpinLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
  #[error("thread limit of {max} reached")]
  ThreadLimit { max: usize },
  #[error("could not map memory for thread slot {index}")]
  SlotReserve { index: usize },
}

/// One registered thread. All-zero is an inactive slot with an empty cache.
pub struct ThreadSlot {
  active: AtomicBool,
  pub(crate) cache: ThreadCache,
}

impl ThreadSlot {
  #[inline]
  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }

  pub fn cache_stats(&self) -> CacheStats {
    self.cache.stats()
  }
}

/// Backing storage for thread slots.
///
/// # Safety
///
/// Every slot returned must be zero-initialised on first use and stay at the
/// same address until the table is dropped.
pub unsafe trait SlotTable: Send + Sync + Sized + 'static {
  fn with_capacity(max_threads: usize) -> Result<Self, RegistryError>;

  fn capacity(&self) -> usize;

  /// Slot `index`, mapping its backing memory if needed. Called under the
  /// registry lock.
  fn reserve(&self, index: usize) -> Option<&ThreadSlot>;

  /// Slot `index` if its memory has been mapped.
  fn get(&self, index: usize) -> Option<&ThreadSlot>;
}

/// All slots in one up-front reservation.
pub struct FixedSlots {
  base: *mut ThreadSlot,
  capacity: usize,
}

unsafe impl Send for FixedSlots {}
unsafe impl Sync for FixedSlots {}

impl FixedSlots {
  fn bytes(capacity: usize) -> usize {
    capacity * size_of::<ThreadSlot>()
  }
}

unsafe impl SlotTable for FixedSlots {
  fn with_capacity(max_threads: usize) -> Result<Self, RegistryError> {
    let base = unsafe { platform::os_mmap(Self::bytes(max_threads).max(1)) };
    if base.is_null() {
      return Err(RegistryError::SlotReserve { index: 0 });
    }
    Ok(Self {
      base: base.cast(),
      capacity: max_threads,
    })
  }

  fn capacity(&self) -> usize {
    self.capacity
  }

  fn reserve(&self, index: usize) -> Option<&ThreadSlot> {
    self.get(index)
  }

  #[inline]
  fn get(&self, index: usize) -> Option<&ThreadSlot> {
    (index < self.capacity).then(|| unsafe { &*self.base.add(index) })
  }
}

impl Drop for FixedSlots {
  fn drop(&mut self) {
    unsafe { platform::os_munmap(self.base.cast(), Self::bytes(self.capacity).max(1)) };
  }
}

const CHUNK_SLOTS: usize = 64;
const MAX_CHUNKS: usize = 1024;

/// Slots mapped 64 at a time as threads arrive.
pub struct ChunkedSlots {
  chunks: [AtomicPtr<ThreadSlot>; MAX_CHUNKS],
  capacity: usize,
}

impl ChunkedSlots {
  pub const MAX_THREADS: usize = CHUNK_SLOTS * MAX_CHUNKS;

  const CHUNK_BYTES: usize = CHUNK_SLOTS * size_of::<ThreadSlot>();

  #[inline]
  fn split(index: usize) -> (usize, usize) {
    (index / CHUNK_SLOTS, index % CHUNK_SLOTS)
  }

  pub fn mapped_chunks(&self) -> usize {
    self
      .chunks
      .iter()
      .filter(|c| !c.load(Ordering::Relaxed).is_null())
      .count()
  }
}

unsafe impl SlotTable for ChunkedSlots {
  fn with_capacity(max_threads: usize) -> Result<Self, RegistryError> {
    Ok(Self {
      chunks: [const { AtomicPtr::new(null_mut()) }; MAX_CHUNKS],
      capacity: max_threads.min(Self::MAX_THREADS),
    })
  }

  fn capacity(&self) -> usize {
    self.capacity
  }

  fn reserve(&self, index: usize) -> Option<&ThreadSlot> {
    if index >= self.capacity {
      return None;
    }
    let (chunk, offset) = Self::split(index);
    let mut base = self.chunks[chunk].load(Ordering::Acquire);
    if base.is_null() {
      base = unsafe { platform::os_mmap(Self::CHUNK_BYTES) }.cast();
      if base.is_null() {
        return None;
      }
      self.chunks[chunk].store(base, Ordering::Release);
    }
    Some(unsafe { &*base.add(offset) })
  }

  #[inline]
  fn get(&self, index: usize) -> Option<&ThreadSlot> {
    if index >= self.capacity {
      return None;
    }
    let (chunk, offset) = Self::split(index);
    let base = self.chunks[chunk].load(Ordering::Acquire);
    (!base.is_null()).then(|| unsafe { &*base.add(offset) })
  }
}

impl Drop for ChunkedSlots {
  fn drop(&mut self) {
    for chunk in &self.chunks {
      let base = chunk.load(Ordering::Relaxed);
      if !base.is_null() {
        unsafe { platform::os_munmap(base.cast(), Self::CHUNK_BYTES) };
      }
    }
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RegistryStats {
  pub active: usize,
  pub high_water: usize,
  pub registrations: usize,
  pub max_threads: usize,
}

pub struct ThreadList<T: SlotTable> {
  slots: T,
  lock: SpinLock,
  /// Slots `[0, high_water)` have been handed out at least once.
  high_water: AtomicUsize,
  active: AtomicUsize,
  registrations: AtomicUsize,
}

impl<T: SlotTable> ThreadList<T> {
  pub fn new(max_threads: usize) -> Result<Self, RegistryError> {
    Ok(Self {
      slots: T::with_capacity(max_threads)?,
      lock: SpinLock::new(),
      high_water: AtomicUsize::new(0),
      active: AtomicUsize::new(0),
      registrations: AtomicUsize::new(0),
    })
  }

  pub fn max_threads(&self) -> usize {
    self.slots.capacity()
  }

  /// Claims a slot, preferring one a departed thread left behind.
  pub fn register(&self) -> Result<usize, RegistryError> {
    let _guard = self.lock.lock();
    let high_water = self.high_water.load(Ordering::Relaxed);

    let reused = (0..high_water).find(|&i| self.slots.get(i).is_some_and(|s| !s.is_active()));
    let index = match reused {
      Some(index) => index,
      None if high_water < self.slots.capacity() => high_water,
      None => {
        return Err(RegistryError::ThreadLimit {
          max: self.slots.capacity(),
        });
      }
    };

    let slot = self.slots.reserve(index).ok_or(RegistryError::SlotReserve { index })?;
    slot.cache.reset_counters();
    slot.active.store(true, Ordering::Release);
    if index == high_water {
      self.high_water.store(high_water + 1, Ordering::Release);
    }
    self.active.fetch_add(1, Ordering::Relaxed);
    self.registrations.fetch_add(1, Ordering::Relaxed);
    Ok(index)
  }

  /// Drains the slot's cache into the pool and frees the slot for reuse.
  ///
  /// Must be called by the thread that owns the slot, or after it is gone.
  pub fn unregister<S: BlockSignature>(&self, index: usize, ctx: &CacheContext<'_, S>) {
    let Some(slot) = self.slots.get(index) else {
      return;
    };
    if !slot.is_active() {
      return;
    }
    slot.cache.drain(ctx);
    let _guard = self.lock.lock();
    slot.active.store(false, Ordering::Release);
    self.active.fetch_sub(1, Ordering::Relaxed);
  }

  #[inline]
  pub fn cache(&self, index: usize) -> Option<&ThreadCache> {
    self.slots.get(index).map(|slot| &slot.cache)
  }

  pub fn for_each_active(&self, mut f: impl FnMut(usize, &ThreadSlot)) {
    let high_water = self.high_water.load(Ordering::Acquire);
    for index in 0..high_water {
      if let Some(slot) = self.slots.get(index).filter(|s| s.is_active()) {
        f(index, slot);
      }
    }
  }

  /// Sum of every active thread's cache statistics.
  pub fn cache_totals(&self) -> CacheStats {
    let mut totals = CacheStats::default();
    self.for_each_active(|_, slot| totals.merge(&slot.cache_stats()));
    totals
  }

  pub fn stats(&self) -> RegistryStats {
    RegistryStats {
      active: self.active.load(Ordering::Relaxed),
      high_water: self.high_water.load(Ordering::Relaxed),
      registrations: self.registrations.load(Ordering::Relaxed),
      max_threads: self.max_threads(),
    }
  }
}
