use core::{marker::PhantomData, ptr::null_mut};

use crate::block::{self, BlockSignature};

/// Intrusive singly-linked list of free blocks of one class, linked through
/// each block's link word.
pub(crate) struct FreeChain<S: BlockSignature> {
  head: *mut u8,
  tail: *mut u8,
  len: usize,
  _sig: PhantomData<S>,
}

unsafe impl<S: BlockSignature> Send for FreeChain<S> {}

impl<S: BlockSignature> FreeChain<S> {
  pub(crate) const fn new() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      len: 0,
      _sig: PhantomData,
    }
  }

  #[inline]
  pub(crate) fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub(crate) fn is_empty(&self) -> bool {
    self.len == 0
  }

  #[inline]
  pub(crate) fn head(&self) -> *mut u8 {
    self.head
  }

  /// # Safety
  ///
  /// `block` must be a free block not linked anywhere else.
  #[inline]
  pub(crate) unsafe fn push(&mut self, block: *mut u8) {
    unsafe { block::set_next::<S>(block, self.head) };
    if self.head.is_null() {
      self.tail = block;
    }
    self.head = block;
    self.len += 1;
  }

  #[inline]
  pub(crate) fn pop(&mut self) -> Option<*mut u8> {
    if self.head.is_null() {
      return None;
    }
    let block = self.head;
    self.head = unsafe { block::next::<S>(block) };
    self.len -= 1;
    if self.head.is_null() {
      self.tail = null_mut();
    }
    Some(block)
  }

  /// Moves all of `other` in front of this chain.
  pub(crate) fn prepend(&mut self, mut other: FreeChain<S>) {
    if other.is_empty() {
      return;
    }
    unsafe { block::set_next::<S>(other.tail, self.head) };
    if self.head.is_null() {
      self.tail = other.tail;
    }
    self.head = other.head;
    self.len += other.len;
    other.head = null_mut();
    other.tail = null_mut();
    other.len = 0;
  }

  /// Detaches up to `n` blocks from the front.
  pub(crate) fn split_front(&mut self, n: usize) -> FreeChain<S> {
    if n >= self.len {
      return core::mem::replace(self, FreeChain::new());
    }
    let mut front = FreeChain::new();
    if n == 0 {
      return front;
    }
    let mut last = self.head;
    for _ in 1..n {
      last = unsafe { block::next::<S>(last) };
    }
    front.head = self.head;
    front.tail = last;
    front.len = n;
    self.head = unsafe { block::next::<S>(last) };
    self.len -= n;
    unsafe { block::set_next::<S>(last, null_mut()) };
    front
  }

  /// Rebuilds a chain of `len` blocks starting at `head`, as published by a
  /// thread cache list.
  ///
  /// # Safety
  ///
  /// `head` must start a well-formed list of exactly `len` blocks.
  pub(crate) unsafe fn from_raw(head: *mut u8, len: usize) -> Self {
    let mut chain = FreeChain::new();
    if len == 0 {
      return chain;
    }
    let mut tail = head;
    for _ in 1..len {
      tail = unsafe { block::next::<S>(tail) };
    }
    chain.head = head;
    chain.tail = tail;
    chain.len = len;
    chain
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::block::Plain;

  #[repr(C, align(32))]
  struct Slots([[u8; 32]; 8]);

  fn ptrs(slots: &mut Slots) -> Vec<*mut u8> {
    slots.0.iter_mut().map(|s| s.as_mut_ptr()).collect()
  }

  #[test]
  fn push_pop_is_lifo() {
    let mut slots = Slots([[0; 32]; 8]);
    let p = ptrs(&mut slots);
    let mut chain = FreeChain::<Plain>::new();
    unsafe {
      chain.push(p[0]);
      chain.push(p[1]);
    }
    assert_eq!(chain.len(), 2);
    assert_eq!(chain.pop(), Some(p[1]));
    assert_eq!(chain.pop(), Some(p[0]));
    assert_eq!(chain.pop(), None);
    assert!(chain.is_empty());
  }

  #[test]
  fn split_and_prepend_preserve_every_block() {
    let mut slots = Slots([[0; 32]; 8]);
    let p = ptrs(&mut slots);
    let mut chain = FreeChain::<Plain>::new();
    for &b in &p {
      unsafe { chain.push(b) };
    }

    let front = chain.split_front(3);
    assert_eq!(front.len(), 3);
    assert_eq!(chain.len(), 5);
    assert_eq!(front.head(), p[7]);
    assert_eq!(chain.head(), p[4]);

    let mut rebuilt = unsafe { FreeChain::<Plain>::from_raw(chain.head(), chain.len()) };
    rebuilt.prepend(front);
    let mut seen = Vec::new();
    while let Some(b) = rebuilt.pop() {
      seen.push(b);
    }
    let mut expected = p.clone();
    expected.reverse();
    assert_eq!(seen, expected);
  }

  #[test]
  fn split_more_than_len_takes_everything() {
    let mut slots = Slots([[0; 32]; 8]);
    let p = ptrs(&mut slots);
    let mut chain = FreeChain::<Plain>::new();
    unsafe { chain.push(p[0]) };
    let all = chain.split_front(10);
    assert_eq!(all.len(), 1);
    assert!(chain.is_empty());
    assert!(chain.split_front(0).is_empty());
  }
}
