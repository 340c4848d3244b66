//! Block descriptors and the signature schemes that back them.
//!
//! A [`MemBlock`] is a transient view over one block; it owns nothing and only
//! ever rewrites the block's own metadata bytes. What those bytes are is chosen
//! at compile time through [`BlockSignature`].

use core::{marker::PhantomData, ptr::NonNull};

use crate::{
  diag::diag,
  platform,
  size_class::{self, SizeClass},
};

/// Per-block metadata scheme.
///
/// # Safety
///
/// Implementations must keep all metadata and the free-list link inside
/// `[block, block + class size)` for every class whose usable size is reported
/// by [`BlockSignature::un_adjust_size`].
pub unsafe trait BlockSignature: Send + Sync + 'static {
  /// Offset from block start to the pointer handed to the caller.
  const USER_OFFSET: usize;
  /// Offset from block start to the free-list link of a free block.
  const LINK_OFFSET: usize;

  /// Internal size needed to serve `requested` bytes.
  fn adjust_size(requested: usize) -> Option<usize>;

  /// Usable bytes in an internal block of `internal` bytes.
  fn un_adjust_size(internal: usize) -> usize;

  /// Request size that leaves room for an `align`-aligned `size`-byte region.
  fn min_size_for_alignment(align: usize, size: usize) -> usize;

  /// Signs a freshly carved block as free. A fresh block carries no fill.
  unsafe fn init_free(block: *mut u8);

  unsafe fn set_exact(block: *mut u8, exact: usize);

  unsafe fn exact(block: *mut u8, usable: usize) -> usize;

  unsafe fn set_thread(block: *mut u8, thread: u32);

  unsafe fn thread(block: *mut u8) -> u32;

  unsafe fn mark_alloc(block: *mut u8);

  /// Signs the block free, overwriting its payload with `fill` if set.
  unsafe fn mark_free(block: *mut u8, fill: Option<u8>);

  unsafe fn valid_alloc(block: *mut u8, usable: usize) -> bool;

  /// With `fill` set, the payload written by `mark_free` must be intact too.
  unsafe fn valid_free(block: *mut u8, usable: usize, fill: Option<u8>) -> bool;
}

/// Header-and-tail signatures.
///
/// ```text
/// block: [exact: u64][thread: u32][seal: u32][user bytes ... exact][tail: u32]
/// ```
///
/// `seal` mixes the state magic with the block address and the exact size, so a
/// stray write to either the header or the size is caught as well as a write to
/// the tail. A free block may also carry a fill pattern over
/// `[link + 8, exact)`, which catches writes into the payload after free.
pub struct BoundsCheck;

const ALLOC_MAGIC: u32 = 0xF1E2_D3C4;
const FREE_MAGIC: u32 = 0x6324_2367;
const TAIL_MAGIC: u32 = 0x1A2B_3C4D;

const HEADER_SIZE: usize = 16;
const TAIL_SIZE: usize = 4;
const LINK_SIZE: usize = core::mem::size_of::<*mut u8>();

impl BoundsCheck {
  #[inline]
  fn seal(block: *mut u8, exact: u64, magic: u32) -> u32 {
    magic ^ ((block as usize >> 4) as u32) ^ (exact as u32).rotate_left(13) ^ ((exact >> 32) as u32)
  }

  #[inline]
  unsafe fn exact_raw(block: *mut u8) -> u64 {
    unsafe { (block as *const u64).read() }
  }

  #[inline]
  unsafe fn seal_raw(block: *mut u8) -> u32 {
    unsafe { (block.add(12) as *const u32).read() }
  }

  #[inline]
  unsafe fn write_tail(block: *mut u8, exact: usize) {
    unsafe { (block.add(HEADER_SIZE + exact) as *mut u32).write_unaligned(TAIL_MAGIC) };
  }

  #[inline]
  unsafe fn valid_as(block: *mut u8, usable: usize, magic: u32) -> bool {
    let exact = unsafe { Self::exact_raw(block) };
    if exact > usable as u64 {
      return false;
    }
    unsafe {
      Self::seal_raw(block) == Self::seal(block, exact, magic)
        && (block.add(HEADER_SIZE + exact as usize) as *const u32).read_unaligned() == TAIL_MAGIC
    }
  }

  /// Payload bytes of a free block that are not the link word.
  #[inline]
  unsafe fn fill_range<'a>(block: *mut u8) -> &'a mut [u8] {
    unsafe {
      let exact = Self::exact_raw(block) as usize;
      let start = HEADER_SIZE + LINK_SIZE;
      core::slice::from_raw_parts_mut(block.add(start), (HEADER_SIZE + exact).saturating_sub(start))
    }
  }

  #[inline]
  unsafe fn reseal(block: *mut u8, magic: u32) {
    unsafe {
      let exact = Self::exact_raw(block);
      (block.add(12) as *mut u32).write(Self::seal(block, exact, magic));
    }
  }
}

unsafe impl BlockSignature for BoundsCheck {
  const USER_OFFSET: usize = HEADER_SIZE;
  const LINK_OFFSET: usize = HEADER_SIZE;

  #[inline]
  fn adjust_size(requested: usize) -> Option<usize> {
    requested.checked_add(HEADER_SIZE + TAIL_SIZE)
  }

  #[inline]
  fn un_adjust_size(internal: usize) -> usize {
    internal - HEADER_SIZE - TAIL_SIZE
  }

  #[inline]
  fn min_size_for_alignment(align: usize, size: usize) -> usize {
    size.saturating_add(align)
  }

  unsafe fn init_free(block: *mut u8) {
    unsafe {
      (block as *mut u64).write(LINK_SIZE as u64);
      (block.add(8) as *mut u32).write(0);
      Self::write_tail(block, LINK_SIZE);
      Self::reseal(block, FREE_MAGIC);
    }
  }

  #[inline]
  unsafe fn set_exact(block: *mut u8, exact: usize) {
    unsafe {
      (block as *mut u64).write(exact as u64);
      Self::write_tail(block, exact);
    }
  }

  #[inline]
  unsafe fn exact(block: *mut u8, _usable: usize) -> usize {
    unsafe { Self::exact_raw(block) as usize }
  }

  #[inline]
  unsafe fn set_thread(block: *mut u8, thread: u32) {
    unsafe { (block.add(8) as *mut u32).write(thread) };
  }

  #[inline]
  unsafe fn thread(block: *mut u8) -> u32 {
    unsafe { (block.add(8) as *const u32).read() }
  }

  #[inline]
  unsafe fn mark_alloc(block: *mut u8) {
    unsafe { Self::reseal(block, ALLOC_MAGIC) };
  }

  #[inline]
  unsafe fn mark_free(block: *mut u8, fill: Option<u8>) {
    unsafe {
      // The link word sits right after the header; keep the tail clear of it.
      let exact = Self::exact_raw(block) as usize;
      if exact < LINK_SIZE {
        Self::set_exact(block, LINK_SIZE);
      }
      if let Some(byte) = fill {
        Self::fill_range(block).fill(byte);
      }
      Self::reseal(block, FREE_MAGIC);
    }
  }

  #[inline]
  unsafe fn valid_alloc(block: *mut u8, usable: usize) -> bool {
    unsafe { Self::valid_as(block, usable, ALLOC_MAGIC) }
  }

  #[inline]
  unsafe fn valid_free(block: *mut u8, usable: usize, fill: Option<u8>) -> bool {
    unsafe {
      Self::valid_as(block, usable, FREE_MAGIC)
        && fill.is_none_or(|byte| Self::fill_range(block).iter().all(|&b| b == byte))
    }
  }
}

/// No metadata at all: zero overhead and no corruption detection.
pub struct Plain;

unsafe impl BlockSignature for Plain {
  const USER_OFFSET: usize = 0;
  const LINK_OFFSET: usize = 0;

  #[inline]
  fn adjust_size(requested: usize) -> Option<usize> {
    Some(requested)
  }

  #[inline]
  fn un_adjust_size(internal: usize) -> usize {
    internal
  }

  #[inline]
  fn min_size_for_alignment(align: usize, size: usize) -> usize {
    size.max(align)
  }

  unsafe fn init_free(_block: *mut u8) {}

  unsafe fn set_exact(_block: *mut u8, _exact: usize) {}

  #[inline]
  unsafe fn exact(_block: *mut u8, usable: usize) -> usize {
    usable
  }

  unsafe fn set_thread(_block: *mut u8, _thread: u32) {}

  unsafe fn thread(_block: *mut u8) -> u32 {
    0
  }

  unsafe fn mark_alloc(_block: *mut u8) {}

  unsafe fn mark_free(_block: *mut u8, _fill: Option<u8>) {}

  unsafe fn valid_alloc(_block: *mut u8, _usable: usize) -> bool {
    true
  }

  unsafe fn valid_free(_block: *mut u8, _usable: usize, _fill: Option<u8>) -> bool {
    true
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BlockState {
  Allocated,
  Free,
  Corrupt,
}

/// Stack-held view over one block of a known class.
pub struct MemBlock<S: BlockSignature> {
  block: NonNull<u8>,
  class: SizeClass,
  _sig: PhantomData<S>,
}

impl<S: BlockSignature> MemBlock<S> {
  /// # Safety
  ///
  /// `block` must be the start of a block of `class` owned by the allocator.
  #[inline]
  pub unsafe fn from_block(block: NonNull<u8>, class: SizeClass) -> Self {
    Self {
      block,
      class,
      _sig: PhantomData,
    }
  }

  /// View over the block containing the caller pointer `ptr`.
  ///
  /// # Safety
  ///
  /// `ptr` must point inside a block of `class` owned by the allocator.
  #[inline]
  pub unsafe fn from_user(ptr: *mut u8, class: SizeClass) -> Self {
    let start = class.block_start(ptr as usize) as *mut u8;
    unsafe { Self::from_block(NonNull::new_unchecked(start), class) }
  }

  #[inline]
  pub fn adjust_size(requested: usize) -> Option<usize> {
    S::adjust_size(requested)
  }

  #[inline]
  pub fn class(&self) -> SizeClass {
    self.class
  }

  #[inline]
  pub fn block(&self) -> NonNull<u8> {
    self.block
  }

  /// Pointer handed to the caller.
  #[inline]
  pub fn ptr(&self) -> *mut u8 {
    unsafe { self.block.as_ptr().add(S::USER_OFFSET) }
  }

  /// Largest exact size this block can record.
  #[inline]
  pub fn usable(&self) -> usize {
    size_class::max_size_for::<S>(self.class)
  }

  #[inline]
  pub fn exact(&self) -> usize {
    unsafe { S::exact(self.block.as_ptr(), self.usable()) }
  }

  #[inline]
  pub fn thread(&self) -> u32 {
    unsafe { S::thread(self.block.as_ptr()) }
  }

  #[inline]
  pub fn set_exact(&self, requested: usize) {
    debug_assert!(requested <= self.usable());
    unsafe { S::set_exact(self.block.as_ptr(), requested) }
  }

  /// Marks the block allocated by the calling thread.
  #[inline]
  pub fn alloc(&self, log_if_oversized: bool) {
    unsafe {
      S::set_thread(self.block.as_ptr(), platform::thread_id());
      S::mark_alloc(self.block.as_ptr());
    }
    if log_if_oversized {
      self.log_big_block();
    }
  }

  #[inline]
  pub fn free(&self, fill: Option<u8>) {
    unsafe { S::mark_free(self.block.as_ptr(), fill) }
  }

  #[inline]
  pub fn valid_alloc(&self) -> bool {
    unsafe { S::valid_alloc(self.block.as_ptr(), self.usable()) }
  }

  #[inline]
  pub fn valid_free(&self, fill: Option<u8>) -> bool {
    unsafe { S::valid_free(self.block.as_ptr(), self.usable(), fill) }
  }

  /// Classifies the block by its seal alone.
  pub fn state(&self) -> BlockState {
    if self.valid_alloc() {
      BlockState::Allocated
    } else if self.valid_free(None) {
      BlockState::Free
    } else {
      BlockState::Corrupt
    }
  }

  #[cold]
  #[inline(never)]
  fn log_big_block(&self) {
    diag!(
      "allocated {:p}: exact {} bytes, internal {} bytes, thread {}",
      self.ptr(),
      self.exact(),
      self.class.size(),
      self.thread()
    );
  }
}

#[inline]
pub(crate) unsafe fn next<S: BlockSignature>(block: *mut u8) -> *mut u8 {
  unsafe { (block.add(S::LINK_OFFSET) as *const *mut u8).read() }
}

#[inline]
pub(crate) unsafe fn set_next<S: BlockSignature>(block: *mut u8, next: *mut u8) {
  unsafe { (block.add(S::LINK_OFFSET) as *mut *mut u8).write(next) }
}
