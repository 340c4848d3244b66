//! Allocation-free diagnostics.
//!
//! Nothing here may touch the heap: a message is formatted into a stack buffer
//! and pushed to fd 2 with `write(2)`.

use core::fmt;

const BUF_LEN: usize = 512;

/// `core::fmt::Write` sink that buffers on the stack and flushes to stderr.
pub struct StderrWriter {
  buf: [u8; BUF_LEN],
  len: usize,
}

impl StderrWriter {
  pub const fn new() -> Self {
    Self {
      buf: [0; BUF_LEN],
      len: 0,
    }
  }

  pub fn flush(&mut self) {
    write_all(libc::STDERR_FILENO, &self.buf[..self.len]);
    self.len = 0;
  }
}

impl Default for StderrWriter {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Write for StderrWriter {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let mut bytes = s.as_bytes();
    while !bytes.is_empty() {
      if self.len == BUF_LEN {
        self.flush();
      }
      let n = bytes.len().min(BUF_LEN - self.len);
      self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
      self.len += n;
      bytes = &bytes[n..];
    }
    Ok(())
  }
}

impl Drop for StderrWriter {
  fn drop(&mut self) {
    if self.len != 0 {
      self.flush();
    }
  }
}

fn write_all(fd: libc::c_int, mut bytes: &[u8]) {
  while !bytes.is_empty() {
    let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
    if n < 0 {
      if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
        continue;
      }
      return;
    }
    if n == 0 {
      return;
    }
    bytes = &bytes[n as usize..];
  }
}

/// Writes one `segmalloc: `-prefixed line to stderr.
macro_rules! diag {
  ($($arg:tt)*) => {{
    use ::core::fmt::Write as _;
    let mut w = $crate::diag::StderrWriter::new();
    let _ = w.write_str("segmalloc: ");
    let _ = ::core::write!(w, $($arg)*);
    let _ = w.write_str("\n");
  }};
}

pub(crate) use diag;

/// The corruption-terminal state: no safe continuation exists.
#[cold]
#[inline(never)]
pub fn crash() -> ! {
  write_all(
    libc::STDERR_FILENO,
    b"segmalloc detected unrecoverable error.\n",
  );
  unsafe { libc::abort() }
}

#[cfg(test)]
mod tests {
  use super::*;
  use core::fmt::Write;

  #[test]
  fn long_lines_are_flushed_in_pieces() {
    let mut w = StderrWriter::new();
    let line = "x".repeat(BUF_LEN * 2 + 7);
    w.write_str(&line).unwrap();
    assert_eq!(w.len, 7);
    w.len = 0;
  }

  #[test]
  fn formatting_does_not_need_the_heap() {
    let mut w = StderrWriter::new();
    write!(w, "{:p} {} {}", 0x1000 as *const u8, 42usize, "ok").unwrap();
    assert!(w.len > 0);
    assert!(w.len < BUF_LEN);
    w.len = 0;
  }
}
