//! Report lines that do not end the process. They go straight to fd 2, so
//! each test runs itself in a child process and reads the child's stderr.

mod common;

use common::{is_child, manager, run_child};
use segmalloc::{BoundsCheck, Config, MAX_REGIONS, NUM_SIZE_CLASSES, SegmentLogConfig, SizeClass, max_size_for};

fn child_stderr(test: &str) -> String {
  let (status, stderr) = run_child(test);
  assert!(status.success(), "{status}: {stderr}");
  stderr
}

#[test]
fn allocations_past_the_report_limit_are_logged() {
  if is_child("allocations_past_the_report_limit_are_logged") {
    let m = manager(Config::default().with_pr_alloc_limit(4096));
    let big = m.malloc(5000);
    let small = m.malloc(100);
    unsafe {
      m.free(big);
      m.free(small);
    }
    return;
  }
  let stderr = child_stderr("allocations_past_the_report_limit_are_logged");
  assert!(stderr.contains("exact 5000 bytes, internal 8192 bytes"), "{stderr}");
  assert!(!stderr.contains("exact 100 bytes"));
}

#[test]
fn segment_growth_is_reported_once_per_increment() {
  if is_child("segment_growth_is_reported_once_per_increment") {
    let m = manager(Config::default());
    m.setup_segment_log(&SegmentLogConfig {
      big_mem_log_level: 1,
      big_limit: 1 << 20,
      big_increment: 1 << 20,
      ..SegmentLogConfig::default()
    });
    let big = m.malloc(2 << 20);
    let small = m.malloc(100);
    assert!(!big.is_null() && !small.is_null());
    return;
  }
  let stderr = child_stderr("segment_growth_is_reported_once_per_increment");
  assert!(
    stderr.contains("segment grew to 4194304 bytes in 1 regions, next report at 5242880 bytes"),
    "{stderr}"
  );
  assert_eq!(stderr.matches("segment grew").count(), 1);
}

#[test]
fn growth_is_silent_by_default() {
  if is_child("growth_is_silent_by_default") {
    let m = manager(Config::default());
    assert!(!m.malloc(2 << 20).is_null());
    return;
  }
  let stderr = child_stderr("growth_is_silent_by_default");
  assert!(!stderr.contains("segment grew"));
}

#[test]
fn exhausted_segment_returns_null_and_samples_its_reports() {
  if is_child("exhausted_segment_returns_null_and_samples_its_reports") {
    let m = manager(Config::default().with_segment_log(SegmentLogConfig {
      no_mem_log_level: 1,
      sample_every: 2,
      ..SegmentLogConfig::default()
    }));
    let top = SizeClass::new(NUM_SIZE_CLASSES - 1).unwrap();
    let size = max_size_for::<BoundsCheck>(top);
    let served = (0..=2 * MAX_REGIONS).take_while(|_| !m.malloc(size).is_null()).count();
    assert_eq!(served, MAX_REGIONS);
    assert!(m.malloc(size).is_null());
    assert!(m.malloc(size).is_null());

    let segment = m.stats().segment;
    assert_eq!(segment.regions, MAX_REGIONS);
    assert_eq!(segment.no_mem_events, 3);
    assert!(!m.malloc(64).is_null());
    return;
  }
  let stderr = child_stderr("exhausted_segment_returns_null_and_samples_its_reports");
  assert_eq!(stderr.matches("out of memory carving class 24").count(), 2, "{stderr}");
}
