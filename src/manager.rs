//! The allocator façade.
//!
//! A [`MemoryManager`] ties one segment, one pool and one thread registry
//! together. Threads bind to a manager lazily on their first call; the binding
//! lives in thread-local storage and its destructor drains the thread's cache
//! back into the pool.

use core::{
  cell::{Cell, UnsafeCell},
  fmt,
  ptr::{self, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use thiserror::Error;

use crate::{
  block::{BlockSignature, BlockState, BoundsCheck, MemBlock},
  cache::{CacheContext, CacheStats, ThreadCache},
  config::{Config, ConfigError, SegmentLogConfig},
  diag::{crash, diag},
  platform::align_up,
  pool::{GlobalPool, PoolStats},
  registry::{FixedSlots, RegistryError, RegistryStats, SlotTable, ThreadList},
  segment::{Segment, SegmentStats},
  size_class::{self, MIN_ALIGN, SizeClass},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InitError {
  #[error("allocator already initialised")]
  AlreadyInitialized,
  #[error("thread slot table: {0}")]
  SlotTable(#[from] RegistryError),
  #[error("configuration: {0}")]
  Config(#[from] ConfigError),
}

/// Point-in-time counters of one manager.
#[derive(Clone, Copy, Debug)]
pub struct Stats {
  pub segment: SegmentStats,
  pub pool: PoolStats,
  pub threads: RegistryStats,
  /// Sum over all registered threads.
  pub caches: CacheStats,
}

// =============================================================================
// Thread bindings
// =============================================================================

/// Called from the thread-local destructor of a bound thread.
trait ThreadHook: Sync {
  fn quit_thread(&self, slot: usize);
}

const MAX_BINDINGS: usize = 16;

#[derive(Clone, Copy)]
struct Binding {
  manager: usize,
  slot: usize,
  hook: &'static dyn ThreadHook,
}

struct Bindings {
  entries: [Option<Binding>; MAX_BINDINGS],
}

impl Bindings {
  const fn new() -> Self {
    Self {
      entries: [None; MAX_BINDINGS],
    }
  }

  fn find(&self, manager: usize) -> Option<usize> {
    self
      .entries
      .iter()
      .flatten()
      .find(|b| b.manager == manager)
      .map(|b| b.slot)
  }

  fn has_room(&self) -> bool {
    self.entries.iter().any(Option::is_none)
  }

  fn insert(&mut self, binding: Binding) {
    if let Some(entry) = self.entries.iter_mut().find(|e| e.is_none()) {
      *entry = Some(binding);
    }
  }

  fn remove(&mut self, manager: usize) -> Option<Binding> {
    self
      .entries
      .iter_mut()
      .find(|e| e.is_some_and(|b| b.manager == manager))?
      .take()
  }
}

impl Drop for Bindings {
  fn drop(&mut self) {
    for entry in &mut self.entries {
      if let Some(binding) = entry.take() {
        binding.hook.quit_thread(binding.slot);
      }
    }
  }
}

thread_local! {
  static BINDINGS: UnsafeCell<Bindings> = const { UnsafeCell::new(Bindings::new()) };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// Held while a thread is inside the allocator. A nested call (for instance
/// from registering the `BINDINGS` destructor) finds the flag set and takes
/// the lock-protected pool path instead.
struct ReentryGuard;

impl ReentryGuard {
  #[inline]
  fn enter() -> Option<Self> {
    IN_ALLOC.try_with(|flag| !flag.replace(true)).ok()?.then_some(ReentryGuard)
  }
}

impl Drop for ReentryGuard {
  #[inline]
  fn drop(&mut self) {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
}

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

// =============================================================================
// MemoryManager
// =============================================================================

pub struct MemoryManager<S: BlockSignature = BoundsCheck, T: SlotTable = FixedSlots> {
  id: usize,
  double_delete_log_level: AtomicUsize,
  invalid_mem_log_level: AtomicUsize,
  pr_alloc_limit: AtomicUsize,
  thread_cache_limit: AtomicUsize,
  fill: Option<u8>,
  segment: Segment,
  pool: GlobalPool<S>,
  threads: ThreadList<T>,
}

impl<S: BlockSignature, T: SlotTable> ThreadHook for MemoryManager<S, T> {
  fn quit_thread(&self, slot: usize) {
    self.threads.unregister(slot, &self.ctx());
  }
}

impl<S: BlockSignature, T: SlotTable> MemoryManager<S, T> {
  pub fn new(config: &Config) -> Result<Self, InitError> {
    Ok(Self {
      id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
      double_delete_log_level: AtomicUsize::new(config.double_delete_log_level),
      invalid_mem_log_level: AtomicUsize::new(config.invalid_mem_log_level),
      pr_alloc_limit: AtomicUsize::new(config.pr_alloc_limit),
      thread_cache_limit: AtomicUsize::new(config.thread_cache_limit),
      fill: config.fill,
      segment: Segment::new(&config.segment_log),
      pool: GlobalPool::new(config.always_reuse_limit),
      threads: ThreadList::new(config.max_threads)?,
    })
  }

  #[inline]
  fn ctx(&self) -> CacheContext<'_, S> {
    CacheContext {
      pool: &self.pool,
      segment: &self.segment,
      limit: self.thread_cache_limit.load(Ordering::Relaxed),
    }
  }

  /// Slot of the calling thread, binding it first when `bind` is set.
  fn current_slot(&'static self, bindings: &UnsafeCell<Bindings>, bind: bool) -> Result<Option<usize>, RegistryError> {
    let bindings = unsafe { &mut *bindings.get() };
    if let Some(slot) = bindings.find(self.id) {
      return Ok(Some(slot));
    }
    if !bind || !bindings.has_room() {
      return Ok(None);
    }
    let slot = self.threads.register()?;
    bindings.insert(Binding {
      manager: self.id,
      slot,
      hook: self,
    });
    Ok(Some(slot))
  }

  /// Runs `f` with the calling thread's cache, or with `None` when it cannot
  /// have one right now.
  #[inline]
  fn with_cache<R>(&'static self, f: impl FnOnce(Option<&ThreadCache>) -> R) -> R {
    let Some(_guard) = ReentryGuard::enter() else {
      return f(None);
    };
    let slot = match BINDINGS.try_with(|b| self.current_slot(b, true)) {
      Ok(Ok(slot)) => slot,
      Ok(Err(RegistryError::ThreadLimit { max })) => {
        diag!("more than {} threads; raise SEGMALLOC_MAX_THREADS", max);
        crash()
      }
      Ok(Err(RegistryError::SlotReserve { .. })) | Err(_) => None,
    };
    f(slot.and_then(|slot| self.threads.cache(slot)))
  }

  #[inline]
  fn take_block(&'static self, class: SizeClass) -> Option<MemBlock<S>> {
    let block = self.with_cache(|cache| match cache {
      Some(cache) => cache.pop(class, &self.ctx()),
      None => self.pool.take(class, &self.segment),
    })?;
    Some(unsafe { MemBlock::from_block(block, class) })
  }

  #[inline]
  fn release_block(&'static self, mem: &MemBlock<S>) {
    let (class, block) = (mem.class(), mem.block());
    self.with_cache(|cache| unsafe {
      match cache {
        Some(cache) => cache.push(class, block, &self.ctx()),
        None => self.pool.give(class, block, &self.segment),
      }
    });
  }

  /// Class of the block holding `ptr`, crashing when it is not a live block
  /// of ours.
  fn owned_class(&self, ptr: *mut u8) -> SizeClass {
    if let Some(class) = self.segment.size_class_of(ptr) {
      return class;
    }
    if let Some(class) = self.segment.returned_class_of(ptr) {
      let mem = unsafe { MemBlock::<S>::from_user(ptr, class) };
      self.report(&self.double_delete_log_level, "Already deleted", &mem);
      crash()
    }
    if self.invalid_mem_log_level.load(Ordering::Relaxed) > 0 {
      diag!("{:p} not allocated here, can not be freed", ptr);
    }
    crash()
  }

  fn report(&self, level: &AtomicUsize, what: &str, mem: &MemBlock<S>) {
    let level = level.load(Ordering::Relaxed);
    if level == 0 {
      return;
    }
    diag!("{} {:p}({}).", what, mem.ptr(), mem.exact());
    if level >= 2 {
      self.dump(mem);
    }
  }

  fn dump(&self, mem: &MemBlock<S>) {
    diag!(
      "  block {:p}: exact {} bytes, thread {}, class {} ({} bytes)",
      mem.block(),
      mem.exact(),
      mem.thread(),
      mem.class().index(),
      mem.class().size()
    );
  }

  #[cold]
  fn corrupt(&self, mem: &MemBlock<S>) -> ! {
    match mem.state() {
      BlockState::Free => self.report(&self.double_delete_log_level, "Already deleted", mem),
      _ => self.report(
        &self.invalid_mem_log_level,
        "Someone has tampered with the signatures of memory block",
        mem,
      ),
    }
    crash()
  }

  #[cold]
  fn tampered_after_free(&self, mem: &MemBlock<S>) -> ! {
    let level = self.invalid_mem_log_level.load(Ordering::Relaxed);
    if level > 0 {
      diag!("Memory {:p}({}) has been tampered with after free.", mem.ptr(), mem.exact());
    }
    if level >= 2 {
      self.dump(mem);
    }
    crash()
  }

  #[inline]
  fn mark_allocated(&self, mem: &MemBlock<S>, exact: usize) {
    mem.set_exact(exact);
    let internal = MemBlock::<S>::adjust_size(exact).unwrap_or(usize::MAX);
    mem.alloc(internal >= self.pr_alloc_limit.load(Ordering::Relaxed));
  }

  /// Null when `size` is past the largest class or memory is exhausted.
  pub fn malloc(&'static self, size: usize) -> *mut u8 {
    let Some(class) = size_class::class_for::<S>(size) else {
      return null_mut();
    };
    let Some(mem) = self.take_block(class) else {
      return null_mut();
    };
    if !mem.valid_free(self.fill) {
      self.tampered_after_free(&mem);
    }
    self.mark_allocated(&mem, size);
    mem.ptr()
  }

  /// # Safety
  ///
  /// `ptr` must be null or a live pointer returned by this manager.
  /// Anything else is detected where possible and aborts the process.
  pub unsafe fn free(&'static self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let mem = unsafe { MemBlock::<S>::from_user(ptr, self.owned_class(ptr)) };
    if !mem.valid_alloc() {
      self.corrupt(&mem);
    }
    mem.free(self.fill);
    self.release_block(&mem);
  }

  /// `free` with the size the block was requested with.
  ///
  /// # Safety
  ///
  /// As for [`MemoryManager::free`].
  pub unsafe fn free_sized(&'static self, ptr: *mut u8, size: usize) {
    if self.segment.size_class_of(ptr).is_some() && size > self.usable_size(ptr) {
      if self.invalid_mem_log_level.load(Ordering::Relaxed) > 0 {
        diag!("{:p} freed as {} bytes, larger than its block", ptr, size);
      }
      crash();
    }
    unsafe { self.free(ptr) }
  }

  /// # Safety
  ///
  /// As for [`MemoryManager::free`].
  pub unsafe fn realloc(&'static self, ptr: *mut u8, size: usize) -> *mut u8 {
    if ptr.is_null() {
      return self.malloc(size);
    }
    let mem = unsafe { MemBlock::<S>::from_user(ptr, self.owned_class(ptr)) };
    if !mem.valid_alloc() {
      self.corrupt(&mem);
    }

    let offset = ptr as usize - mem.ptr() as usize;
    if size <= mem.usable() - offset {
      self.mark_allocated(&mem, size + offset);
      return ptr;
    }

    let fresh = self.malloc(size);
    if fresh.is_null() {
      return null_mut();
    }
    let keep = mem.exact().saturating_sub(offset).min(size);
    unsafe {
      ptr::copy_nonoverlapping(ptr, fresh, keep);
      self.free(ptr);
    }
    fresh
  }

  /// Zeroed `count * size` bytes; null when the product overflows.
  pub fn calloc(&'static self, count: usize, size: usize) -> *mut u8 {
    let Some(total) = count.checked_mul(size) else {
      return null_mut();
    };
    let ptr = self.malloc(total);
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, total) };
    }
    ptr
  }

  /// `size` bytes aligned to `align`, a power of two.
  pub fn memalign(&'static self, align: usize, size: usize) -> *mut u8 {
    if !align.is_power_of_two() {
      return null_mut();
    }
    if align <= MIN_ALIGN {
      return self.malloc(size);
    }
    let Some(padded) = size.checked_add(size_class::min_alignment_padding::<S>(align, size)) else {
      return null_mut();
    };
    let ptr = self.malloc(padded);
    if ptr.is_null() {
      return ptr;
    }
    align_up(ptr as usize, align) as *mut u8
  }

  /// Bytes usable from `ptr` to the end of its block; 0 for foreign pointers.
  pub fn usable_size(&self, ptr: *mut u8) -> usize {
    let Some(class) = self.segment.size_class_of(ptr) else {
      return 0;
    };
    let mem = unsafe { MemBlock::<S>::from_user(ptr, class) };
    (mem.ptr() as usize + mem.usable()).saturating_sub(ptr as usize)
  }

  pub fn size_class_of(&self, ptr: *const u8) -> Option<SizeClass> {
    self.segment.size_class_of(ptr)
  }

  /// Binds the calling thread now instead of on its first allocation.
  pub fn register_thread(&'static self) -> Result<usize, RegistryError> {
    let _guard = ReentryGuard::enter();
    match BINDINGS.try_with(|b| self.current_slot(b, true)) {
      Ok(Ok(Some(slot))) => Ok(slot),
      Ok(Err(err)) => Err(err),
      Ok(Ok(None)) | Err(_) => Err(RegistryError::ThreadLimit { max: MAX_BINDINGS }),
    }
  }

  /// Drains the calling thread's cache and releases its slot.
  pub fn unregister_thread(&'static self) {
    let _guard = ReentryGuard::enter();
    let binding = BINDINGS
      .try_with(|b| unsafe { &mut *b.get() }.remove(self.id))
      .ok()
      .flatten();
    if let Some(binding) = binding {
      self.quit_thread(binding.slot);
    }
  }

  /// Cache counters of the calling thread, `None` if it is not bound.
  pub fn thread_cache_stats(&'static self) -> Option<CacheStats> {
    let _guard = ReentryGuard::enter();
    let slot = BINDINGS.try_with(|b| self.current_slot(b, false)).ok()?.ok()??;
    self.threads.cache(slot).map(ThreadCache::stats)
  }

  pub fn max_threads(&self) -> usize {
    self.threads.max_threads()
  }

  pub fn set_params(&self, always_reuse_limit: usize, thread_cache_limit: usize) {
    self.pool.set_always_reuse_limit(always_reuse_limit);
    self.thread_cache_limit.store(thread_cache_limit, Ordering::Relaxed);
  }

  pub fn setup_log(&self, double_delete_log_level: usize, invalid_mem_log_level: usize, pr_alloc_limit: usize) {
    self.double_delete_log_level.store(double_delete_log_level, Ordering::Relaxed);
    self.invalid_mem_log_level.store(invalid_mem_log_level, Ordering::Relaxed);
    self.pr_alloc_limit.store(pr_alloc_limit, Ordering::Relaxed);
  }

  pub fn setup_segment_log(&self, config: &SegmentLogConfig) {
    self.segment.setup_log(config);
  }

  pub fn stats(&self) -> Stats {
    Stats {
      segment: self.segment.stats(),
      pool: self.pool.stats(),
      threads: self.threads.stats(),
      caches: self.threads.cache_totals(),
    }
  }

  /// Human-readable counters. Level 1 adds a per-class table, level 2 a line
  /// per registered thread.
  pub fn info(&self, out: &mut dyn fmt::Write, level: usize) -> fmt::Result {
    let stats = self.stats();
    let (seg, pool, threads, caches) = (&stats.segment, &stats.pool, &stats.threads, &stats.caches);

    writeln!(
      out,
      "segment: {} regions, {} bytes reserved, {} bytes carved, {} bytes returned, {} free spans, {} out-of-memory events",
      seg.regions, seg.reserved_bytes, seg.carved_bytes, seg.returned_bytes, seg.free_spans, seg.no_mem_events
    )?;
    writeln!(
      out,
      "pool: {} bytes free, always-reuse limit {} bytes",
      pool.free_bytes(),
      pool.always_reuse_limit
    )?;
    writeln!(
      out,
      "threads: {} active, {} slots used of {}, {} registrations",
      threads.active, threads.high_water, threads.max_threads, threads.registrations
    )?;
    writeln!(
      out,
      "caches: {} bytes cached, {} hits, {} misses, {} spills, {} bypassed, limit {} bytes",
      caches.cached_bytes,
      caches.hits,
      caches.misses,
      caches.spills,
      caches.bypassed,
      self.thread_cache_limit.load(Ordering::Relaxed)
    )?;

    if level >= 1 {
      for class in SizeClass::all() {
        let i = class.index();
        let p = &pool.classes[i];
        if seg.carves[i] == 0 && p.takes == 0 && p.gives == 0 {
          continue;
        }
        writeln!(
          out,
          "  class {:2} {:>10} B: carves {} pool-free {} takes {} gives {} refills {} returned {} cached {}",
          i,
          class.size(),
          seg.carves[i],
          p.free_blocks,
          p.takes,
          p.gives,
          p.refills,
          p.returned,
          caches.blocks[i]
        )?;
      }
    }

    if level >= 2 {
      let mut result = Ok(());
      self.threads.for_each_active(|slot, thread| {
        let c = thread.cache_stats();
        if result.is_ok() {
          result = writeln!(
            out,
            "  thread slot {}: {} bytes cached, {} hits, {} misses, {} spills, {} bypassed",
            slot, c.cached_bytes, c.hits, c.misses, c.spills, c.bypassed
          );
        }
      });
      result?;
    }
    Ok(())
  }
}
