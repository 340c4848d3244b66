//! Allocator configuration.
//!
//! Everything here is plain data. [`Config::from_env`] reads `SEGMALLOC_*`
//! variables through `getenv(3)` and parses them in place, so it can run while
//! the process is servicing its very first allocation.

use core::ffi::CStr;

use thiserror::Error;

use crate::{cache::DEFAULT_THREAD_CACHE_LIMIT, pool::DEFAULT_ALWAYS_REUSE_LIMIT};

pub const DEFAULT_MAX_THREADS: usize = 1024;
pub const MAX_THREADS_CEILING: usize = 1 << 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
  #[error("{name} is not a number")]
  InvalidNumber { name: &'static str },
  #[error("{name}={value} is outside {min}..={max}")]
  OutOfRange {
    name: &'static str,
    value: usize,
    min: usize,
    max: usize,
  },
}

/// Reporting knobs of the address segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentLogConfig {
  /// Report failed carves when > 0.
  pub no_mem_log_level: usize,
  /// Report segment growth past `big_limit` when > 0.
  pub big_mem_log_level: usize,
  pub big_limit: usize,
  /// How far the growth watermark moves after each report.
  pub big_increment: usize,
  /// Report one event in `sample_every`.
  pub sample_every: usize,
}

impl Default for SegmentLogConfig {
  fn default() -> Self {
    Self {
      no_mem_log_level: 1,
      big_mem_log_level: 0,
      big_limit: 1 << 30,
      big_increment: 1 << 30,
      sample_every: 1,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
  pub max_threads: usize,
  pub always_reuse_limit: usize,
  pub thread_cache_limit: usize,
  pub double_delete_log_level: usize,
  pub invalid_mem_log_level: usize,
  /// Allocations of at least this many internal bytes are reported.
  pub pr_alloc_limit: usize,
  /// Byte written over the payload of every freed block and checked when the
  /// block is handed out again. Off by default.
  pub fill: Option<u8>,
  pub segment_log: SegmentLogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      max_threads: DEFAULT_MAX_THREADS,
      always_reuse_limit: DEFAULT_ALWAYS_REUSE_LIMIT,
      thread_cache_limit: DEFAULT_THREAD_CACHE_LIMIT,
      double_delete_log_level: 1,
      invalid_mem_log_level: 1,
      pr_alloc_limit: usize::MAX,
      fill: None,
      segment_log: SegmentLogConfig::default(),
    }
  }
}

const VARS: &[(&str, &CStr)] = &[
  ("SEGMALLOC_MAX_THREADS", c"SEGMALLOC_MAX_THREADS"),
  ("SEGMALLOC_ALWAYS_REUSE_LIMIT", c"SEGMALLOC_ALWAYS_REUSE_LIMIT"),
  ("SEGMALLOC_THREAD_CACHE_LIMIT", c"SEGMALLOC_THREAD_CACHE_LIMIT"),
  ("SEGMALLOC_DOUBLE_DELETE_LOG_LEVEL", c"SEGMALLOC_DOUBLE_DELETE_LOG_LEVEL"),
  ("SEGMALLOC_INVALID_MEM_LOG_LEVEL", c"SEGMALLOC_INVALID_MEM_LOG_LEVEL"),
  ("SEGMALLOC_PR_ALLOC_LIMIT", c"SEGMALLOC_PR_ALLOC_LIMIT"),
  ("SEGMALLOC_FILL", c"SEGMALLOC_FILL"),
  ("SEGMALLOC_NO_MEM_LOG_LEVEL", c"SEGMALLOC_NO_MEM_LOG_LEVEL"),
  ("SEGMALLOC_BIG_MEM_LOG_LEVEL", c"SEGMALLOC_BIG_MEM_LOG_LEVEL"),
  ("SEGMALLOC_BIG_LIMIT", c"SEGMALLOC_BIG_LIMIT"),
  ("SEGMALLOC_BIG_INCREMENT", c"SEGMALLOC_BIG_INCREMENT"),
  ("SEGMALLOC_SAMPLE_EVERY", c"SEGMALLOC_SAMPLE_EVERY"),
];

/// Parses a decimal count with an optional `k`, `m` or `g` binary suffix.
fn parse_size(name: &'static str, raw: &[u8]) -> Result<usize, ConfigError> {
  let invalid = ConfigError::InvalidNumber { name };
  let text = core::str::from_utf8(raw).map_err(|_| invalid)?.trim();
  let (digits, shift) = match text.as_bytes().last() {
    Some(b'k' | b'K') => (&text[..text.len() - 1], 10),
    Some(b'm' | b'M') => (&text[..text.len() - 1], 20),
    Some(b'g' | b'G') => (&text[..text.len() - 1], 30),
    _ => (text, 0),
  };
  let value: usize = digits.parse().map_err(|_| invalid)?;
  value.checked_mul(1 << shift).ok_or(invalid)
}

impl Config {
  pub fn with_max_threads(mut self, max_threads: usize) -> Self {
    self.max_threads = max_threads;
    self
  }

  pub fn with_always_reuse_limit(mut self, bytes: usize) -> Self {
    self.always_reuse_limit = bytes;
    self
  }

  pub fn with_thread_cache_limit(mut self, bytes: usize) -> Self {
    self.thread_cache_limit = bytes;
    self
  }

  pub fn with_log_levels(mut self, double_delete: usize, invalid_mem: usize) -> Self {
    self.double_delete_log_level = double_delete;
    self.invalid_mem_log_level = invalid_mem;
    self
  }

  pub fn with_pr_alloc_limit(mut self, bytes: usize) -> Self {
    self.pr_alloc_limit = bytes;
    self
  }

  pub fn with_fill(mut self, fill: Option<u8>) -> Self {
    self.fill = fill;
    self
  }

  pub fn with_segment_log(mut self, segment_log: SegmentLogConfig) -> Self {
    self.segment_log = segment_log;
    self
  }

  /// Reads the `SEGMALLOC_*` environment variables over the defaults.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::parse_with(|name| {
      let (_, key) = VARS.iter().find(|(n, _)| *n == name)?;
      let value = unsafe { libc::getenv(key.as_ptr()) };
      if value.is_null() {
        None
      } else {
        Some(unsafe { CStr::from_ptr(value) }.to_bytes())
      }
    })
  }

  /// Same as [`Config::from_env`] over an arbitrary variable lookup.
  pub fn parse_with<'a>(lookup: impl Fn(&'static str) -> Option<&'a [u8]>) -> Result<Self, ConfigError> {
    let mut config = Self::default();
    let read = |name: &'static str, slot: &mut usize, min: usize, max: usize| -> Result<(), ConfigError> {
      let Some(raw) = lookup(name) else {
        return Ok(());
      };
      let value = parse_size(name, raw)?;
      if value < min || value > max {
        return Err(ConfigError::OutOfRange { name, value, min, max });
      }
      *slot = value;
      Ok(())
    };

    read("SEGMALLOC_MAX_THREADS", &mut config.max_threads, 1, MAX_THREADS_CEILING)?;
    read("SEGMALLOC_ALWAYS_REUSE_LIMIT", &mut config.always_reuse_limit, 0, usize::MAX)?;
    read("SEGMALLOC_THREAD_CACHE_LIMIT", &mut config.thread_cache_limit, 0, usize::MAX)?;
    read("SEGMALLOC_DOUBLE_DELETE_LOG_LEVEL", &mut config.double_delete_log_level, 0, 2)?;
    read("SEGMALLOC_INVALID_MEM_LOG_LEVEL", &mut config.invalid_mem_log_level, 0, 2)?;
    read("SEGMALLOC_PR_ALLOC_LIMIT", &mut config.pr_alloc_limit, 0, usize::MAX)?;
    let mut fill = usize::MAX;
    read("SEGMALLOC_FILL", &mut fill, 0, u8::MAX as usize)?;
    config.fill = u8::try_from(fill).ok();

    let log = &mut config.segment_log;
    read("SEGMALLOC_NO_MEM_LOG_LEVEL", &mut log.no_mem_log_level, 0, 2)?;
    read("SEGMALLOC_BIG_MEM_LOG_LEVEL", &mut log.big_mem_log_level, 0, 2)?;
    read("SEGMALLOC_BIG_LIMIT", &mut log.big_limit, 0, usize::MAX)?;
    read("SEGMALLOC_BIG_INCREMENT", &mut log.big_increment, 1, usize::MAX)?;
    read("SEGMALLOC_SAMPLE_EVERY", &mut log.sample_every, 1, usize::MAX)?;
    Ok(config)
  }
}
