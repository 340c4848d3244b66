use core::{
  ptr::null_mut,
  sync::atomic::{AtomicU32, Ordering},
};

/// Reserves `size` bytes of read/write anonymous memory. Pages are committed lazily.
pub(crate) unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Reserves `size` bytes aligned to `align` (a power of two), trimming the slop.
pub(crate) unsafe fn os_mmap_aligned(size: usize, align: usize) -> *mut u8 {
  let Some(total) = size.checked_add(align) else {
    return null_mut();
  };
  let raw = unsafe { os_mmap(total) };
  if raw.is_null() {
    return raw;
  }

  let start = raw as usize;
  let aligned = align_up(start, align);
  let head = aligned - start;
  let tail = total - head - size;
  unsafe {
    if head != 0 {
      os_munmap(raw, head);
    }
    if tail != 0 {
      os_munmap((aligned + size) as *mut u8, tail);
    }
  }
  aligned as *mut u8
}

/// Gives the physical pages of a free run back to the kernel; the range stays reserved.
#[cfg(feature = "release-mem")]
pub(crate) unsafe fn os_release(ptr: *mut u8, size: usize) {
  unsafe { libc::madvise(ptr.cast(), size, libc::MADV_DONTNEED) };
}

/// Process-unique id of the calling thread, 0 once thread-local storage is gone.
pub(crate) fn thread_id() -> u32 {
  thread_local! {
    static TID: u32 = {
      static CTR: AtomicU32 = AtomicU32::new(1);
      CTR.fetch_add(1, Ordering::Relaxed)
    };
  }
  TID.try_with(|&id| id).unwrap_or(0)
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn aligned_reservation_honours_alignment() {
    let align = 1 << 24;
    let ptr = unsafe { os_mmap_aligned(1 << 20, align) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % align, 0);
    unsafe {
      ptr.write(7);
      assert_eq!(ptr.read(), 7);
      os_munmap(ptr, 1 << 20);
    }
  }

  #[test]
  fn thread_ids_differ_across_threads() {
    let here = thread_id();
    let there = std::thread::spawn(thread_id).join().unwrap();
    assert_ne!(here, 0);
    assert_ne!(here, there);
    assert_eq!(here, thread_id());
  }

  #[test]
  fn align_up_rounds_to_power_of_two() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(17, 64), 64);
  }
}
