//! Per-thread block cache.
//!
//! Only the owning thread mutates a cache; the lists are atomics so that
//! `info` and the registry can read lengths and counters from any thread. All
//! owner-side accesses are `Relaxed`.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
  block::{self, BlockSignature},
  chain::FreeChain,
  pool::GlobalPool,
  segment::Segment,
  size_class::{NUM_SIZE_CLASSES, SizeClass},
};

pub const DEFAULT_THREAD_CACHE_LIMIT: usize = 64 << 10;

/// Upper bound on blocks pulled from the pool per miss.
const MAX_REFILL: usize = 64;

/// Shared state a cache works against.
pub struct CacheContext<'a, S: BlockSignature> {
  pub pool: &'a GlobalPool<S>,
  pub segment: &'a Segment,
  /// Total bytes this cache may hold.
  pub limit: usize,
}

impl<S: BlockSignature> CacheContext<'_, S> {
  #[inline]
  fn bypasses(&self, class: SizeClass) -> bool {
    class.size() > self.limit
  }

  /// Bytes one class list may hold.
  #[inline]
  fn class_capacity(&self, class: SizeClass) -> usize {
    (self.limit / 2).max(class.size())
  }
}

#[derive(Clone, Copy, Debug)]
pub struct CacheStats {
  pub cached_bytes: usize,
  pub hits: usize,
  pub misses: usize,
  pub spills: usize,
  pub bypassed: usize,
  pub blocks: [u32; NUM_SIZE_CLASSES],
}

impl Default for CacheStats {
  fn default() -> Self {
    Self {
      cached_bytes: 0,
      hits: 0,
      misses: 0,
      spills: 0,
      bypassed: 0,
      blocks: [0; NUM_SIZE_CLASSES],
    }
  }
}

impl CacheStats {
  pub fn merge(&mut self, other: &CacheStats) {
    self.cached_bytes += other.cached_bytes;
    self.hits += other.hits;
    self.misses += other.misses;
    self.spills += other.spills;
    self.bypassed += other.bypassed;
    for (dst, src) in self.blocks.iter_mut().zip(&other.blocks) {
      *dst += src;
    }
  }
}

/// Valid when all-zero, so slot tables can hand out fresh mappings directly.
pub struct ThreadCache {
  heads: [AtomicPtr<u8>; NUM_SIZE_CLASSES],
  lens: [AtomicU32; NUM_SIZE_CLASSES],
  cached_bytes: AtomicUsize,
  hits: AtomicUsize,
  misses: AtomicUsize,
  spills: AtomicUsize,
  bypassed: AtomicUsize,
}

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      heads: [const { AtomicPtr::new(null_mut()) }; NUM_SIZE_CLASSES],
      lens: [const { AtomicU32::new(0) }; NUM_SIZE_CLASSES],
      cached_bytes: AtomicUsize::new(0),
      hits: AtomicUsize::new(0),
      misses: AtomicUsize::new(0),
      spills: AtomicUsize::new(0),
      bypassed: AtomicUsize::new(0),
    }
  }

  #[inline]
  fn bump(counter: &AtomicUsize) {
    counter.store(counter.load(Ordering::Relaxed) + 1, Ordering::Relaxed);
  }

  #[inline]
  fn add_bytes(&self, delta: isize) {
    let bytes = self.cached_bytes.load(Ordering::Relaxed);
    self.cached_bytes.store(bytes.wrapping_add_signed(delta), Ordering::Relaxed);
  }

  #[inline]
  fn len(&self, class: SizeClass) -> usize {
    self.lens[class.index()].load(Ordering::Relaxed) as usize
  }

  #[inline]
  fn install<S: BlockSignature>(&self, class: SizeClass, chain: &FreeChain<S>) {
    self.heads[class.index()].store(chain.head(), Ordering::Relaxed);
    self.lens[class.index()].store(chain.len() as u32, Ordering::Relaxed);
  }

  #[inline]
  fn detach<S: BlockSignature>(&self, class: SizeClass) -> FreeChain<S> {
    let head = self.heads[class.index()].swap(null_mut(), Ordering::Relaxed);
    let len = self.lens[class.index()].swap(0, Ordering::Relaxed) as usize;
    self.add_bytes(-((len * class.size()) as isize));
    unsafe { FreeChain::from_raw(head, len) }
  }

  /// A free block of `class`: from this cache if it has one, else from the
  /// pool. `None` only when the segment is exhausted.
  ///
  /// Must only be called by the owning thread.
  pub fn pop<S: BlockSignature>(&self, class: SizeClass, ctx: &CacheContext<'_, S>) -> Option<NonNull<u8>> {
    let i = class.index();
    let head = self.heads[i].load(Ordering::Relaxed);
    if !head.is_null() {
      self.heads[i].store(unsafe { block::next::<S>(head) }, Ordering::Relaxed);
      self.lens[i].store(self.lens[i].load(Ordering::Relaxed) - 1, Ordering::Relaxed);
      self.add_bytes(-(class.size() as isize));
      Self::bump(&self.hits);
      return NonNull::new(head);
    }

    if ctx.bypasses(class) {
      Self::bump(&self.bypassed);
      return ctx.pool.take(class, ctx.segment);
    }

    Self::bump(&self.misses);
    let room = ctx
      .limit
      .saturating_sub(self.cached_bytes.load(Ordering::Relaxed))
      .min(ctx.class_capacity(class) / 2);
    let want = (room / class.size()).clamp(1, MAX_REFILL);
    let mut batch = ctx.pool.take_batch(class, want, ctx.segment);
    let block = batch.pop()?;
    self.add_bytes((batch.len() * class.size()) as isize);
    self.install(class, &batch);
    NonNull::new(block)
  }

  /// Caches a free block, spilling to the pool when over capacity.
  ///
  /// # Safety
  ///
  /// `block` must be a block of `class` marked free and referenced nowhere
  /// else. Must only be called by the owning thread.
  pub unsafe fn push<S: BlockSignature>(&self, class: SizeClass, block: NonNull<u8>, ctx: &CacheContext<'_, S>) {
    if ctx.bypasses(class) {
      Self::bump(&self.bypassed);
      unsafe { ctx.pool.give(class, block, ctx.segment) };
      return;
    }

    let i = class.index();
    unsafe { block::set_next::<S>(block.as_ptr(), self.heads[i].load(Ordering::Relaxed)) };
    self.heads[i].store(block.as_ptr(), Ordering::Relaxed);
    self.lens[i].store(self.lens[i].load(Ordering::Relaxed) + 1, Ordering::Relaxed);
    self.add_bytes(class.size() as isize);

    let capacity = ctx.class_capacity(class);
    if self.len(class) * class.size() > capacity {
      self.spill(class, capacity / class.size() / 2, ctx);
    }
    if self.cached_bytes.load(Ordering::Relaxed) > ctx.limit {
      self.trim(class, ctx);
    }
  }

  /// Flushes whole class lists, largest first, until the cache fits its limit
  /// again. `keep` is left alone.
  fn trim<S: BlockSignature>(&self, keep: SizeClass, ctx: &CacheContext<'_, S>) {
    for class in SizeClass::all().rev() {
      if self.cached_bytes.load(Ordering::Relaxed) <= ctx.limit {
        return;
      }
      if class != keep && self.len(class) != 0 {
        Self::bump(&self.spills);
        let chain = self.detach::<S>(class);
        ctx.pool.give_chain(class, chain, ctx.segment);
      }
    }
  }

  /// Keeps the newest `keep` blocks of `class` and hands the rest to the pool
  /// in one chain.
  fn spill<S: BlockSignature>(&self, class: SizeClass, keep: usize, ctx: &CacheContext<'_, S>) {
    Self::bump(&self.spills);
    let mut all = self.detach::<S>(class);
    let kept = all.split_front(keep);
    self.add_bytes((kept.len() * class.size()) as isize);
    self.install(class, &kept);
    ctx.pool.give_chain(class, all, ctx.segment);
  }

  /// Returns every cached block to the pool.
  pub fn drain<S: BlockSignature>(&self, ctx: &CacheContext<'_, S>) {
    for class in SizeClass::all() {
      if self.len(class) != 0 {
        let chain = self.detach::<S>(class);
        ctx.pool.give_chain(class, chain, ctx.segment);
      }
    }
  }

  /// Clears the hit/miss counters for a new owner. The lists must be empty.
  pub(crate) fn reset_counters(&self) {
    debug_assert_eq!(self.cached_bytes.load(Ordering::Relaxed), 0);
    for counter in [&self.hits, &self.misses, &self.spills, &self.bypassed] {
      counter.store(0, Ordering::Relaxed);
    }
  }

  pub fn stats(&self) -> CacheStats {
    let mut stats = CacheStats {
      cached_bytes: self.cached_bytes.load(Ordering::Relaxed),
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      spills: self.spills.load(Ordering::Relaxed),
      bypassed: self.bypassed.load(Ordering::Relaxed),
      blocks: [0; NUM_SIZE_CLASSES],
    };
    for (dst, len) in stats.blocks.iter_mut().zip(&self.lens) {
      *dst = len.load(Ordering::Relaxed);
    }
    stats
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}
