//! Address segment: the reserved regions every block is carved from.
//!
//! Each region is a 1GB, 1GB-aligned reservation split into 64KB spans. Span 0
//! of a region holds one class tag per span; the remaining spans are handed out
//! in naturally aligned runs by a per-region buddy allocator. The class of any
//! address is therefore `tags[(addr - base) >> SPAN_SHIFT]`, with no per-block
//! header involved.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicU8, AtomicUsize, Ordering},
};

use crate::{
  config::SegmentLogConfig,
  diag::diag,
  platform,
  size_class::{NUM_SIZE_CLASSES, SPAN_SHIFT, SPAN_SIZE, SizeClass},
  sync::{Locked, SpinLock},
};

const REGION_SHIFT: u32 = 30;
pub const REGION_SIZE: usize = 1 << REGION_SHIFT; // 1GB
const SPANS_PER_REGION: usize = REGION_SIZE / SPAN_SIZE;
pub const MAX_REGIONS: usize = 64;

/// Span 0 is the tag table, so the largest free run is half a region.
const BUDDY_MAX_ORDER: usize = SPANS_PER_REGION.trailing_zeros() as usize - 1;

const UNTAGGED: u8 = 0;
/// Set on the tags of a run handed back to the buddy, over the tag of the
/// class it last served, until the spans are carved again.
const RETURNED: u8 = 0x80;

const _: () = assert!(REGION_SIZE.is_power_of_two());
const _: () = assert!(SPANS_PER_REGION <= SPAN_SIZE);
const _: () = assert!(NUM_SIZE_CLASSES < RETURNED as usize);
const _: () = assert!(SPAN_SHIFT as usize + BUDDY_MAX_ORDER == crate::size_class::MAX_CLASS_SHIFT as usize);

// =============================================================================
// Buddy allocator (one per region)
// =============================================================================

#[repr(C)]
struct FreeRun {
  next: *mut FreeRun,
}

struct FreeRuns {
  head: *mut FreeRun,
  count: usize,
}

unsafe impl Send for FreeRuns {}

impl FreeRuns {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      count: 0,
    }
  }

  fn push(&mut self, run: *mut FreeRun) {
    unsafe { (*run).next = self.head };
    self.head = run;
    self.count += 1;
  }

  fn pop(&mut self) -> Option<*mut FreeRun> {
    let run = self.head;
    if run.is_null() {
      return None;
    }
    self.head = unsafe { (*run).next };
    self.count -= 1;
    Some(run)
  }

  fn remove(&mut self, target: *mut FreeRun) -> bool {
    if self.head == target {
      self.head = unsafe { (*target).next };
      self.count -= 1;
      return true;
    }

    let mut prev = self.head;
    while !prev.is_null() {
      let next = unsafe { (*prev).next };
      if next == target {
        unsafe { (*prev).next = (*target).next };
        self.count -= 1;
        return true;
      }
      prev = next;
    }

    false
  }
}

/// Free span runs per buddy order, each list behind its own lock.
struct Buddy {
  orders: [Locked<FreeRuns>; BUDDY_MAX_ORDER + 1],
}

impl Buddy {
  const fn new() -> Self {
    Self {
      orders: [const { Locked::new(FreeRuns::new()) }; BUDDY_MAX_ORDER + 1],
    }
  }

  #[inline]
  fn run(base: usize, idx: usize) -> *mut FreeRun {
    (base + (idx << SPAN_SHIFT)) as *mut FreeRun
  }

  #[inline]
  fn idx(base: usize, run: *mut FreeRun) -> usize {
    (run as usize - base) >> SPAN_SHIFT
  }

  /// Seeds a fresh region: spans `[2^o, 2^(o+1))` form one free run of order `o`.
  fn seed(&self, base: usize) {
    for order in 0..=BUDDY_MAX_ORDER {
      self.orders[order].lock().push(Self::run(base, 1 << order));
    }
  }

  /// Takes a run of `2^order` spans, splitting a larger run if needed.
  fn alloc(&self, base: usize, order: usize) -> Option<usize> {
    if let Some(run) = self.orders[order].lock().pop() {
      return Some(Self::idx(base, run));
    }

    for o in (order + 1)..=BUDDY_MAX_ORDER {
      let popped = self.orders[o].lock().pop();
      if let Some(run) = popped {
        let idx = Self::idx(base, run);
        for split in (order..o).rev() {
          self.orders[split].lock().push(Self::run(base, idx + (1 << split)));
        }
        return Some(idx);
      }
    }

    None
  }

  /// Returns a run, coalescing with free buddies. The lock of an order is held
  /// from the buddy lookup to the push, so sibling runs freed concurrently
  /// always meet.
  fn free(&self, base: usize, mut idx: usize, mut order: usize) {
    loop {
      let mut list = self.orders[order].lock();
      let buddy_idx = idx ^ (1 << order);
      if order == BUDDY_MAX_ORDER || buddy_idx == 0 || !list.remove(Self::run(base, buddy_idx)) {
        list.push(Self::run(base, idx));
        return;
      }
      drop(list);
      idx = idx.min(buddy_idx);
      order += 1;
    }
  }

  fn free_spans(&self) -> usize {
    (0..=BUDDY_MAX_ORDER)
      .map(|order| self.orders[order].lock().count << order)
      .sum()
  }
}

// =============================================================================
// Regions
// =============================================================================

struct Region {
  /// 0 until reserved.
  base: AtomicUsize,
  buddy: Buddy,
}

impl Region {
  const fn new() -> Self {
    Self {
      base: AtomicUsize::new(0),
      buddy: Buddy::new(),
    }
  }

  #[inline]
  fn tags(base: usize) -> &'static [AtomicU8] {
    unsafe { core::slice::from_raw_parts(base as *const AtomicU8, SPANS_PER_REGION) }
  }
}

// =============================================================================
// Diagnostics
// =============================================================================

struct SegmentLog {
  no_mem_level: AtomicUsize,
  big_mem_level: AtomicUsize,
  big_limit: AtomicUsize,
  big_increment: AtomicUsize,
  sample_every: AtomicUsize,
  no_mem_events: AtomicUsize,
  big_events: AtomicUsize,
}

impl SegmentLog {
  fn new(config: &SegmentLogConfig) -> Self {
    let log = Self {
      no_mem_level: AtomicUsize::new(0),
      big_mem_level: AtomicUsize::new(0),
      big_limit: AtomicUsize::new(0),
      big_increment: AtomicUsize::new(0),
      sample_every: AtomicUsize::new(1),
      no_mem_events: AtomicUsize::new(0),
      big_events: AtomicUsize::new(0),
    };
    log.apply(config);
    log
  }

  fn apply(&self, config: &SegmentLogConfig) {
    self.no_mem_level.store(config.no_mem_log_level, Ordering::Relaxed);
    self.big_mem_level.store(config.big_mem_log_level, Ordering::Relaxed);
    self.big_limit.store(config.big_limit, Ordering::Relaxed);
    self.big_increment.store(config.big_increment.max(1), Ordering::Relaxed);
    self.sample_every.store(config.sample_every.max(1), Ordering::Relaxed);
  }

  /// Counts an event and says whether this one is reported.
  fn sampled(&self, events: &AtomicUsize) -> bool {
    let n = events.fetch_add(1, Ordering::Relaxed);
    n % self.sample_every.load(Ordering::Relaxed) == 0
  }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SegmentStats {
  pub regions: usize,
  pub reserved_bytes: usize,
  pub carved_bytes: usize,
  pub returned_bytes: usize,
  pub free_spans: usize,
  pub no_mem_events: usize,
  pub carves: [usize; NUM_SIZE_CLASSES],
}

// =============================================================================
// Segment
// =============================================================================

pub struct Segment {
  regions: [Region; MAX_REGIONS],
  region_count: AtomicUsize,
  grow_lock: SpinLock,
  /// Bytes currently assigned to a class.
  carved_bytes: AtomicUsize,
  returned_bytes: AtomicUsize,
  carves: [AtomicUsize; NUM_SIZE_CLASSES],
  log: SegmentLog,
}

impl Segment {
  pub fn new(log: &SegmentLogConfig) -> Self {
    Self {
      regions: [const { Region::new() }; MAX_REGIONS],
      region_count: AtomicUsize::new(0),
      grow_lock: SpinLock::new(),
      carved_bytes: AtomicUsize::new(0),
      returned_bytes: AtomicUsize::new(0),
      carves: [const { AtomicUsize::new(0) }; NUM_SIZE_CLASSES],
      log: SegmentLog::new(log),
    }
  }

  pub fn setup_log(&self, config: &SegmentLogConfig) {
    self.log.apply(config);
  }

  /// `(index, base)` of the region containing `addr`.
  #[inline]
  fn region_of(&self, addr: usize) -> Option<(usize, usize)> {
    let count = self.region_count.load(Ordering::Acquire);
    self.regions[..count].iter().enumerate().find_map(|(i, region)| {
      let base = region.base.load(Ordering::Relaxed);
      (addr.wrapping_sub(base) < REGION_SIZE).then_some((i, base))
    })
  }

  /// Tag of the span holding `ptr`; `UNTAGGED` outside every region and on
  /// tag tables.
  #[inline]
  fn tag_of(&self, ptr: *const u8) -> u8 {
    let addr = ptr as usize;
    let Some((_, base)) = self.region_of(addr) else {
      return UNTAGGED;
    };
    match (addr - base) >> SPAN_SHIFT {
      0 => UNTAGGED,
      span => Region::tags(base)[span].load(Ordering::Acquire),
    }
  }

  /// Class of the block containing `ptr`, `None` if this segment never handed
  /// it out or has taken it back.
  #[inline]
  pub fn size_class_of(&self, ptr: *const u8) -> Option<SizeClass> {
    match self.tag_of(ptr) {
      UNTAGGED => None,
      tag if tag & RETURNED != 0 => None,
      tag => SizeClass::new(tag as usize - 1),
    }
  }

  /// Class of a block whose run went back to the segment and has not been
  /// carved since.
  pub fn returned_class_of(&self, ptr: *const u8) -> Option<SizeClass> {
    match self.tag_of(ptr) {
      tag if tag & RETURNED != 0 => SizeClass::new((tag & !RETURNED) as usize - 1),
      _ => None,
    }
  }

  /// Assigns a fresh block (a span to split, or a whole run) to `class`.
  pub fn carve(&self, class: SizeClass) -> Option<NonNull<u8>> {
    let order = class.span_order();
    loop {
      let count = self.region_count.load(Ordering::Acquire);
      for region in self.regions[..count].iter().rev() {
        let base = region.base.load(Ordering::Relaxed);
        if let Some(idx) = region.buddy.alloc(base, order) {
          return Some(self.assign(base, idx, order, class));
        }
      }

      let _guard = self.grow_lock.lock();
      if self.region_count.load(Ordering::Acquire) != count {
        continue;
      }
      if !self.grow(count) {
        self.report_no_mem(class);
        return None;
      }
    }
  }

  /// Reserves region `count`. Caller holds the grow lock.
  fn grow(&self, count: usize) -> bool {
    if count == MAX_REGIONS {
      return false;
    }
    let base = unsafe { platform::os_mmap_aligned(REGION_SIZE, REGION_SIZE) };
    if base.is_null() {
      return false;
    }
    let region = &self.regions[count];
    region.base.store(base as usize, Ordering::Relaxed);
    region.buddy.seed(base as usize);
    self.region_count.store(count + 1, Ordering::Release);
    true
  }

  fn assign(&self, base: usize, idx: usize, order: usize, class: SizeClass) -> NonNull<u8> {
    let tag = class.index() as u8 + 1;
    for tag_slot in &Region::tags(base)[idx..idx + (1 << order)] {
      tag_slot.store(tag, Ordering::Release);
    }
    let bytes = SPAN_SIZE << order;
    let carved = self.carved_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
    self.carves[class.index()].fetch_add(1, Ordering::Relaxed);
    self.check_growth(carved);
    unsafe { NonNull::new_unchecked((base + (idx << SPAN_SHIFT)) as *mut u8) }
  }

  /// Hands a span-backed block back; its run becomes free for any class.
  ///
  /// # Safety
  ///
  /// `block` must be a free block of `class` carved by this segment and no
  /// longer referenced anywhere.
  pub unsafe fn return_block(&self, class: SizeClass, block: NonNull<u8>) {
    debug_assert!(class.is_span_backed());
    let addr = block.as_ptr() as usize;
    let Some((region, base)) = self.region_of(addr) else {
      return;
    };
    let order = class.span_order();
    let idx = (addr - base) >> SPAN_SHIFT;
    let tag = RETURNED | (class.index() as u8 + 1);
    for tag_slot in &Region::tags(base)[idx..idx + (1 << order)] {
      tag_slot.store(tag, Ordering::Release);
    }
    let bytes = SPAN_SIZE << order;
    #[cfg(feature = "release-mem")]
    unsafe {
      platform::os_release(block.as_ptr(), bytes)
    };
    self.carved_bytes.fetch_sub(bytes, Ordering::Relaxed);
    self.returned_bytes.fetch_add(bytes, Ordering::Relaxed);
    self.regions[region].buddy.free(base, idx, order);
  }

  fn check_growth(&self, carved: usize) {
    let limit = self.log.big_limit.load(Ordering::Relaxed);
    if carved < limit {
      return;
    }
    let next = carved.saturating_add(self.log.big_increment.load(Ordering::Relaxed));
    if self
      .log
      .big_limit
      .compare_exchange(limit, next, Ordering::Relaxed, Ordering::Relaxed)
      .is_err()
    {
      return;
    }
    let sampled = self.log.sampled(&self.log.big_events);
    if sampled && self.log.big_mem_level.load(Ordering::Relaxed) > 0 {
      diag!(
        "segment grew to {} bytes in {} regions, next report at {} bytes",
        carved,
        self.region_count.load(Ordering::Relaxed),
        next
      );
    }
  }

  fn report_no_mem(&self, class: SizeClass) {
    let sampled = self.log.sampled(&self.log.no_mem_events);
    if sampled && self.log.no_mem_level.load(Ordering::Relaxed) > 0 {
      diag!(
        "out of memory carving class {} ({} bytes): {} regions, {} bytes carved",
        class.index(),
        class.size(),
        self.region_count.load(Ordering::Relaxed),
        self.carved_bytes.load(Ordering::Relaxed)
      );
    }
  }

  pub fn stats(&self) -> SegmentStats {
    let regions = self.region_count.load(Ordering::Acquire);
    let mut stats = SegmentStats {
      regions,
      reserved_bytes: regions * REGION_SIZE,
      carved_bytes: self.carved_bytes.load(Ordering::Relaxed),
      returned_bytes: self.returned_bytes.load(Ordering::Relaxed),
      free_spans: self.regions[..regions].iter().map(|r| r.buddy.free_spans()).sum(),
      no_mem_events: self.log.no_mem_events.load(Ordering::Relaxed),
      carves: [0; NUM_SIZE_CLASSES],
    };
    for (dst, src) in stats.carves.iter_mut().zip(&self.carves) {
      *dst = src.load(Ordering::Relaxed);
    }
    stats
  }
}
