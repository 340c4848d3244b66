//! Global pool: the shared per-class free lists every thread cache refills
//! from and spills into.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
  block::BlockSignature,
  chain::FreeChain,
  segment::Segment,
  size_class::{NUM_SIZE_CLASSES, SizeClass},
  sync::Locked,
};

pub const DEFAULT_ALWAYS_REUSE_LIMIT: usize = 16 << 20;

#[derive(Clone, Copy, Debug, Default)]
pub struct PoolClassStats {
  pub free_blocks: usize,
  pub takes: usize,
  pub gives: usize,
  pub refills: usize,
  pub returned: usize,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStats {
  pub classes: [PoolClassStats; NUM_SIZE_CLASSES],
  pub always_reuse_limit: usize,
}

impl PoolStats {
  pub fn free_bytes(&self) -> usize {
    SizeClass::all()
      .map(|class| self.classes[class.index()].free_blocks * class.size())
      .sum()
  }
}

#[derive(Default)]
struct ClassCounters {
  takes: AtomicUsize,
  gives: AtomicUsize,
  refills: AtomicUsize,
  returned: AtomicUsize,
}

pub struct GlobalPool<S: BlockSignature> {
  lists: [Locked<FreeChain<S>>; NUM_SIZE_CLASSES],
  counters: [ClassCounters; NUM_SIZE_CLASSES],
  always_reuse_limit: AtomicUsize,
}

impl<S: BlockSignature> GlobalPool<S> {
  pub fn new(always_reuse_limit: usize) -> Self {
    Self {
      lists: [const { Locked::new(FreeChain::new()) }; NUM_SIZE_CLASSES],
      counters: core::array::from_fn(|_| ClassCounters::default()),
      always_reuse_limit: AtomicUsize::new(always_reuse_limit),
    }
  }

  pub fn set_always_reuse_limit(&self, limit: usize) {
    self.always_reuse_limit.store(limit, Ordering::Relaxed);
  }

  pub fn always_reuse_limit(&self) -> usize {
    self.always_reuse_limit.load(Ordering::Relaxed)
  }

  /// Pops one free block, carving fresh memory when the class list is empty.
  pub fn take(&self, class: SizeClass, segment: &Segment) -> Option<NonNull<u8>> {
    let mut chain = self.take_batch(class, 1, segment);
    chain.pop().map(|b| unsafe { NonNull::new_unchecked(b) })
  }

  /// Takes up to `n` free blocks. Returns fewer only when the segment is
  /// exhausted.
  pub(crate) fn take_batch(&self, class: SizeClass, n: usize, segment: &Segment) -> FreeChain<S> {
    let counters = &self.counters[class.index()];
    let mut batch = self.lists[class.index()].lock().split_front(n);

    while batch.len() < n {
      let Some(fresh) = self.carve(class, segment) else {
        break;
      };
      counters.refills.fetch_add(1, Ordering::Relaxed);
      let mut fresh = fresh;
      let wanted = n - batch.len();
      let mine = fresh.split_front(wanted);
      batch.prepend(mine);
      if !fresh.is_empty() {
        self.lists[class.index()].lock().prepend(fresh);
      }
    }

    counters.takes.fetch_add(batch.len(), Ordering::Relaxed);
    batch
  }

  /// Carves one span (or run) and signs every block in it as free.
  fn carve(&self, class: SizeClass, segment: &Segment) -> Option<FreeChain<S>> {
    let base = segment.carve(class)?.as_ptr();
    let mut chain = FreeChain::new();
    for i in (0..class.blocks_per_carve()).rev() {
      let block = unsafe { base.add(i << class.shift()) };
      unsafe {
        S::init_free(block);
        chain.push(block);
      }
    }
    Some(chain)
  }

  /// Returns one free block.
  ///
  /// # Safety
  ///
  /// `block` must be a block of `class` marked free and referenced nowhere else.
  pub unsafe fn give(&self, class: SizeClass, block: NonNull<u8>, segment: &Segment) {
    let mut chain = FreeChain::new();
    unsafe { chain.push(block.as_ptr()) };
    self.give_chain(class, chain, segment);
  }

  /// Returns a whole chain of free blocks under a single lock acquisition.
  pub(crate) fn give_chain(&self, class: SizeClass, chain: FreeChain<S>, segment: &Segment) {
    if chain.is_empty() {
      return;
    }
    let counters = &self.counters[class.index()];
    counters.gives.fetch_add(chain.len(), Ordering::Relaxed);

    let surplus = {
      let mut list = self.lists[class.index()].lock();
      list.prepend(chain);
      if class.is_span_backed() {
        let keep = self.always_reuse_limit() / class.size();
        let excess = list.len().saturating_sub(keep);
        list.split_front(excess)
      } else {
        FreeChain::new()
      }
    };

    if surplus.is_empty() {
      return;
    }
    counters.returned.fetch_add(surplus.len(), Ordering::Relaxed);
    let mut surplus = surplus;
    while let Some(block) = surplus.pop() {
      unsafe { segment.return_block(class, NonNull::new_unchecked(block)) };
    }
  }

  pub fn stats(&self) -> PoolStats {
    let mut stats = PoolStats {
      classes: [PoolClassStats::default(); NUM_SIZE_CLASSES],
      always_reuse_limit: self.always_reuse_limit(),
    };
    for class in SizeClass::all() {
      let i = class.index();
      let counters = &self.counters[i];
      stats.classes[i] = PoolClassStats {
        free_blocks: self.lists[i].lock().len(),
        takes: counters.takes.load(Ordering::Relaxed),
        gives: counters.gives.load(Ordering::Relaxed),
        refills: counters.refills.load(Ordering::Relaxed),
        returned: counters.returned.load(Ordering::Relaxed),
      };
    }
    stats
  }
}
