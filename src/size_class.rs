//! Size-class table.
//!
//! Classes are the powers of two from 32 bytes to 512 MiB. Classes smaller than
//! a span are carved by splitting one span into equal blocks; larger classes
//! take a naturally aligned run of `2^k` spans per block. Either way a block is
//! aligned to its own size, which is what lets `free` find the block start of
//! any pointer from the class alone.

use crate::block::BlockSignature;

pub const SPAN_SHIFT: u32 = 16;
pub const SPAN_SIZE: usize = 1 << SPAN_SHIFT; // 64KB

pub const MIN_CLASS_SHIFT: u32 = 5;
pub const MAX_CLASS_SHIFT: u32 = 29;
pub const NUM_SIZE_CLASSES: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;

/// Smallest class size; also the largest alignment every block gets for free.
pub const MIN_CLASS_SIZE: usize = 1 << MIN_CLASS_SHIFT;
pub const MAX_CLASS_SIZE: usize = 1 << MAX_CLASS_SHIFT;

/// Alignment every pointer handed out by `malloc` satisfies.
pub const MIN_ALIGN: usize = 16;

const _: () = assert!(MIN_CLASS_SIZE >= MIN_ALIGN);
const _: () = assert!(NUM_SIZE_CLASSES < u8::MAX as usize);
const _: () = assert!(MIN_CLASS_SHIFT < SPAN_SHIFT && SPAN_SHIFT <= MAX_CLASS_SHIFT);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SizeClass(u8);

impl SizeClass {
  #[inline]
  pub const fn new(index: usize) -> Option<Self> {
    if index < NUM_SIZE_CLASSES {
      Some(Self(index as u8))
    } else {
      None
    }
  }

  /// Smallest class whose size is at least `internal` bytes.
  #[inline]
  pub const fn for_size(internal: usize) -> Option<Self> {
    if internal <= MIN_CLASS_SIZE {
      return Some(Self(0));
    }
    let shift = usize::BITS - (internal - 1).leading_zeros();
    Self::new((shift - MIN_CLASS_SHIFT) as usize)
  }

  #[inline]
  pub const fn index(self) -> usize {
    self.0 as usize
  }

  #[inline]
  pub const fn shift(self) -> u32 {
    self.0 as u32 + MIN_CLASS_SHIFT
  }

  /// Internal block size of this class.
  #[inline]
  pub const fn size(self) -> usize {
    1 << self.shift()
  }

  /// Whether a block of this class is a run of whole spans.
  #[inline]
  pub const fn is_span_backed(self) -> bool {
    self.shift() >= SPAN_SHIFT
  }

  /// Buddy order of the span run this class is carved from.
  #[inline]
  pub const fn span_order(self) -> usize {
    if self.is_span_backed() {
      (self.shift() - SPAN_SHIFT) as usize
    } else {
      0
    }
  }

  /// Blocks produced by one carve.
  #[inline]
  pub const fn blocks_per_carve(self) -> usize {
    if self.is_span_backed() {
      1
    } else {
      SPAN_SIZE >> self.shift()
    }
  }

  /// Block start for any address inside a block of this class.
  #[inline]
  pub const fn block_start(self, addr: usize) -> usize {
    addr & !(self.size() - 1)
  }

  pub fn all() -> impl DoubleEndedIterator<Item = SizeClass> {
    (0..NUM_SIZE_CLASSES).map(|i| SizeClass(i as u8))
  }
}

/// Class serving a request of `requested` bytes, `None` past the largest class.
#[inline]
pub fn class_for<S: BlockSignature>(requested: usize) -> Option<SizeClass> {
  SizeClass::for_size(S::adjust_size(requested)?)
}

/// Largest request a block of `class` can hold.
#[inline]
pub fn max_size_for<S: BlockSignature>(class: SizeClass) -> usize {
  S::un_adjust_size(class.size())
}

/// Extra bytes to request so that an `align`-aligned `size`-byte region fits in
/// the block, given that blocks are aligned to their class size.
#[inline]
pub fn min_alignment_padding<S: BlockSignature>(align: usize, size: usize) -> usize {
  S::min_size_for_alignment(align, size).saturating_sub(size)
}
