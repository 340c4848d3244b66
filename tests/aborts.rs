//! Heap misuse must end the process. Each test re-runs itself in a child
//! process, lets the child misbehave, and checks how it died.

mod common;

use std::os::unix::process::ExitStatusExt;

use common::{is_child, manager, run_child};
use segmalloc::{Config, SPAN_SIZE};

fn assert_aborted(test: &str, expected: &[&str]) {
  let (status, stderr) = run_child(test);
  assert_eq!(status.signal(), Some(libc::SIGABRT), "stderr: {stderr}");
  for line in expected {
    assert!(stderr.contains(line), "missing {line:?} in {stderr}");
  }
  assert!(stderr.contains("segmalloc detected unrecoverable error."));
}

#[test]
fn double_free_aborts() {
  if is_child("double_free_aborts") {
    let m = manager(Config::default());
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      m.free(p);
    }
    unreachable!();
  }
  assert_aborted("double_free_aborts", &["segmalloc: Already deleted 0x"]);
}

#[test]
fn double_free_dump_at_level_two() {
  if is_child("double_free_dump_at_level_two") {
    let m = manager(Config::default().with_log_levels(2, 1));
    let p = m.malloc(100);
    unsafe {
      m.free(p);
      m.free(p);
    }
    unreachable!();
  }
  assert_aborted(
    "double_free_dump_at_level_two",
    &["Already deleted", "exact 100 bytes", "class 2 (128 bytes)"],
  );
}

#[test]
fn silent_double_free_still_aborts() {
  if is_child("silent_double_free_still_aborts") {
    let m = manager(Config::default().with_log_levels(0, 0));
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      m.free(p);
    }
    unreachable!();
  }
  let (status, stderr) = run_child("silent_double_free_still_aborts");
  assert_eq!(status.signal(), Some(libc::SIGABRT));
  assert!(!stderr.contains("Already deleted"));
}

#[test]
fn foreign_pointer_aborts() {
  if is_child("foreign_pointer_aborts") {
    let m = manager(Config::default());
    let mut local = [0u8; 64];
    unsafe { m.free(local.as_mut_ptr()) };
    unreachable!();
  }
  assert_aborted("foreign_pointer_aborts", &["not allocated here, can not be freed"]);
}

#[test]
fn double_free_of_a_run_given_back_to_the_segment() {
  if is_child("double_free_of_a_run_given_back_to_the_segment") {
    let m = manager(Config::default());
    let p = m.malloc(32 << 20);
    unsafe {
      m.free(p);
      assert!(m.size_class_of(p).is_none());
      m.free(p);
    }
    unreachable!();
  }
  let (status, stderr) = run_child("double_free_of_a_run_given_back_to_the_segment");
  assert_eq!(status.signal(), Some(libc::SIGABRT), "stderr: {stderr}");
  assert!(stderr.contains("segmalloc: Already deleted 0x"), "stderr: {stderr}");
  assert!(!stderr.contains("not allocated here"));
}

#[test]
fn returned_run_double_free_follows_its_log_level() {
  if is_child("returned_run_double_free_follows_its_log_level") {
    let m = manager(Config::default().with_log_levels(0, 1).with_always_reuse_limit(0));
    let p = m.malloc(SPAN_SIZE * 2);
    unsafe {
      m.free(p);
      m.free(p);
    }
    unreachable!();
  }
  let (status, stderr) = run_child("returned_run_double_free_follows_its_log_level");
  assert_eq!(status.signal(), Some(libc::SIGABRT));
  assert!(!stderr.contains("Already deleted"));
  assert!(!stderr.contains("not allocated here"));
  assert!(stderr.contains("segmalloc detected unrecoverable error."));
}

#[test]
fn silent_foreign_pointer_still_aborts() {
  if is_child("silent_foreign_pointer_still_aborts") {
    let m = manager(Config::default().with_log_levels(1, 0));
    let mut local = [0u8; 64];
    unsafe { m.free(local.as_mut_ptr()) };
    unreachable!();
  }
  let (status, stderr) = run_child("silent_foreign_pointer_still_aborts");
  assert_eq!(status.signal(), Some(libc::SIGABRT));
  assert!(!stderr.contains("not allocated here"));
  assert!(stderr.contains("segmalloc detected unrecoverable error."));
}

#[test]
fn overrun_past_the_end_aborts() {
  if is_child("overrun_past_the_end_aborts") {
    let m = manager(Config::default());
    let p = m.malloc(24);
    unsafe {
      p.add(24).write(0x5A);
      m.free(p);
    }
    unreachable!();
  }
  assert_aborted("overrun_past_the_end_aborts", &["tampered with the signatures of memory block"]);
}

#[test]
fn write_after_free_aborts_on_reuse() {
  if is_child("write_after_free_aborts_on_reuse") {
    let m = manager(Config::default());
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      p.sub(16).write_bytes(0xEE, 8);
    }
    m.malloc(64);
    unreachable!();
  }
  assert_aborted("write_after_free_aborts_on_reuse", &["has been tampered with after free."]);
}

#[test]
fn payload_write_after_free_aborts_with_fill() {
  if is_child("payload_write_after_free_aborts_with_fill") {
    let m = manager(Config::default().with_fill(Some(0xA5)));
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      p.add(16).write_bytes(0xEE, 32);
    }
    m.malloc(64);
    unreachable!();
  }
  assert_aborted("payload_write_after_free_aborts_with_fill", &["has been tampered with after free."]);
}

#[test]
fn silent_write_after_free_still_aborts() {
  if is_child("silent_write_after_free_still_aborts") {
    let m = manager(Config::default().with_fill(Some(0)).with_log_levels(1, 0));
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      p.add(16).write(1);
    }
    m.malloc(64);
    unreachable!();
  }
  let (status, stderr) = run_child("silent_write_after_free_still_aborts");
  assert_eq!(status.signal(), Some(libc::SIGABRT));
  assert!(!stderr.contains("tampered with after free"));
}

#[test]
fn free_sized_larger_than_the_block_aborts() {
  if is_child("free_sized_larger_than_the_block_aborts") {
    let m = manager(Config::default());
    let p = m.malloc(100);
    let usable = m.usable_size(p);
    unsafe { m.free_sized(p, usable + 1) };
    unreachable!();
  }
  assert_aborted("free_sized_larger_than_the_block_aborts", &["bytes, larger than its block"]);
}

#[test]
fn realloc_of_freed_block_aborts() {
  if is_child("realloc_of_freed_block_aborts") {
    let m = manager(Config::default());
    let p = m.malloc(64);
    unsafe {
      m.free(p);
      m.realloc(p, 128);
    }
    unreachable!();
  }
  assert_aborted("realloc_of_freed_block_aborts", &["Already deleted"]);
}

#[test]
fn exceeding_the_thread_limit_aborts() {
  if is_child("exceeding_the_thread_limit_aborts") {
    let m = manager(Config::default().with_max_threads(1));
    let p = m.malloc(8);
    let _ = std::thread::spawn(move || m.malloc(8) as usize).join();
    unsafe { m.free(p) };
    unreachable!();
  }
  assert_aborted("exceeding_the_thread_limit_aborts", &["more than 1 threads"]);
}
