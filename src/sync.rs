use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-test-and-set lock. Never allocates and never parks, so it is safe to
/// take from inside the allocator.
pub(crate) struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub(crate) const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_> {
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        hint::spin_loop();
      }
    }
    SpinGuard { lock: self }
  }
}

pub(crate) struct SpinGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}

/// Data guarded by a [`SpinLock`].
pub(crate) struct Locked<T> {
  lock: SpinLock,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Locked<T> {}
unsafe impl<T: Send> Send for Locked<T> {}

impl<T> Locked<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      lock: SpinLock::new(),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> LockedGuard<'_, T> {
    let guard = self.lock.lock();
    LockedGuard {
      _guard: guard,
      value: unsafe { &mut *self.value.get() },
    }
  }
}

pub(crate) struct LockedGuard<'a, T> {
  _guard: SpinGuard<'a>,
  value: &'a mut T,
}

impl<T> Deref for LockedGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    self.value
  }
}

impl<T> DerefMut for LockedGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    self.value
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn locked_counter_is_exclusive() {
    let counter = Arc::new(Locked::new(0usize));
    let handles: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
          for _ in 0..10_000 {
            *counter.lock() += 1;
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
  }
}
