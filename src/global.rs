//! The process-wide allocator: one immortal [`MemoryManager`] behind
//! [`GlobalAlloc`] and, with the `c_api` feature, the C allocation symbols.

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr,
};
use std::sync::OnceLock;

use crate::{
  config::Config,
  diag::{crash, diag},
  manager::{InitError, MemoryManager},
  size_class::MIN_ALIGN,
};

static GLOBAL: OnceLock<MemoryManager> = OnceLock::new();

/// Initialises the process-wide allocator with `config`. Must run before the
/// first allocation to take effect; afterwards it fails with
/// [`InitError::AlreadyInitialized`].
pub fn init(config: Config) -> Result<&'static MemoryManager, InitError> {
  if GLOBAL.get().is_some() {
    return Err(InitError::AlreadyInitialized);
  }
  let manager = MemoryManager::new(&config)?;
  GLOBAL.set(manager).map_err(|_| InitError::AlreadyInitialized)?;
  GLOBAL.get().ok_or(InitError::AlreadyInitialized)
}

/// The process-wide allocator, configured from the environment on first use.
#[inline]
pub fn global() -> &'static MemoryManager {
  GLOBAL.get_or_init(|| {
    match Config::from_env()
      .map_err(InitError::from)
      .and_then(|config| MemoryManager::new(&config))
    {
      Ok(manager) => manager,
      Err(err) => {
        diag!("cannot start: {}", err);
        crash()
      }
    }
  })
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// `#[global_allocator]` handle for the process-wide manager.
pub struct SegMalloc;

unsafe impl GlobalAlloc for SegMalloc {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      global().malloc(layout.size())
    } else {
      global().memalign(layout.align(), layout.size())
    }
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    unsafe { global().free_sized(ptr, layout.size()) }
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return global().calloc(1, layout.size());
    }
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
    }
    ptr
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= MIN_ALIGN {
      return unsafe { global().realloc(ptr, new_size) };
    }

    let m = global();
    if new_size <= m.usable_size(ptr) {
      return unsafe { m.realloc(ptr, new_size) };
    }
    let fresh = m.memalign(layout.align(), new_size);
    if !fresh.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, fresh, layout.size().min(new_size));
        m.free(ptr);
      }
    }
    fresh
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
mod c_api {
  use core::{ffi::c_int, ptr::null_mut};

  use super::global;
  use crate::diag::StderrWriter;

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
    global().malloc(size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn free(ptr: *mut u8) {
    unsafe { global().free(ptr) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn calloc(count: usize, size: usize) -> *mut u8 {
    global().calloc(count, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    unsafe { global().realloc(ptr, size) }
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> c_int {
    if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
      return libc::EINVAL;
    }
    let ptr = global().memalign(alignment, size);
    if ptr.is_null() {
      return libc::ENOMEM;
    }
    unsafe { *memptr = ptr };
    0
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
    global().memalign(alignment, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
    global().memalign(alignment, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn valloc(size: usize) -> *mut u8 {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page <= 0 {
      return null_mut();
    }
    global().memalign(page as usize, size)
  }

  #[unsafe(no_mangle)]
  pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    global().usable_size(ptr)
  }

  /// Writes the allocator counters to stderr.
  #[unsafe(no_mangle)]
  pub extern "C" fn segmalloc_info(level: usize) {
    let mut out = StderrWriter::new();
    let _ = global().info(&mut out, level);
  }
}
