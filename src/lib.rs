#![allow(clippy::missing_safety_doc)]
//! Size-classed, thread-caching memory allocator.
//!
//! Memory comes from a few 1GB reserved regions split into 64KB spans. Every
//! span carries a class tag, so `free` needs no size and no per-block pointer
//! back to its owner. Each thread keeps a bounded cache of free blocks per
//! class on top of a shared, lock-protected pool. With the default
//! [`BoundsCheck`] signatures every block is sealed on allocate and on free,
//! and a double free, a foreign pointer or an overwritten header or tail
//! aborts the process with a diagnostic.
//!
//! ```no_run
//! #[global_allocator]
//! static ALLOC: segmalloc::SegMalloc = segmalloc::SegMalloc;
//! ```

mod block;
mod cache;
mod chain;
mod config;
mod diag;
mod global;
mod manager;
mod platform;
mod pool;
mod registry;
mod segment;
mod size_class;
mod sync;

pub use block::{BlockSignature, BlockState, BoundsCheck, MemBlock, Plain};
pub use cache::{CacheStats, DEFAULT_THREAD_CACHE_LIMIT};
pub use config::{Config, ConfigError, DEFAULT_MAX_THREADS, MAX_THREADS_CEILING, SegmentLogConfig};
pub use diag::StderrWriter;
pub use global::{SegMalloc, global, init};
pub use manager::{InitError, MemoryManager, Stats};
pub use pool::{DEFAULT_ALWAYS_REUSE_LIMIT, PoolClassStats, PoolStats};
pub use registry::{ChunkedSlots, FixedSlots, RegistryError, RegistryStats, SlotTable, ThreadSlot};
pub use segment::{MAX_REGIONS, REGION_SIZE, SegmentStats};
pub use size_class::{
  MAX_CLASS_SIZE, MIN_ALIGN, MIN_CLASS_SIZE, NUM_SIZE_CLASSES, SPAN_SIZE, SizeClass, class_for, max_size_for, min_alignment_padding,
};
