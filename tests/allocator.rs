use segmalloc::{Config, MAX_CLASS_SIZE, MemoryManager, SPAN_SIZE, SizeClass};

fn manager(config: Config) -> &'static MemoryManager {
  Box::leak(Box::new(MemoryManager::new(&config).unwrap()))
}

#[test]
fn free_returns_the_block_to_this_threads_cache() {
  let m = manager(Config::default());
  for size in [0, 1, 12, 13, 44, 45, 1000, 4076, 4077, 20_000] {
    let p = m.malloc(size);
    assert!(!p.is_null(), "malloc({size})");
    let class = m.size_class_of(p).unwrap();
    let before = m.thread_cache_stats().unwrap().blocks[class.index()];
    unsafe { m.free(p) };
    let after = m.thread_cache_stats().unwrap().blocks[class.index()];
    assert_eq!(after, before + 1, "size {size}");
  }
}

#[test]
fn usable_size_is_never_below_the_request() {
  let m = manager(Config::default());
  let mut live = Vec::new();
  for size in (0..10_000).step_by(37) {
    let p = m.malloc(size);
    assert!(m.usable_size(p) >= size);
    assert_eq!(p as usize % segmalloc::MIN_ALIGN, 0);
    live.push(p);
  }
  for p in live {
    unsafe { m.free(p) };
  }
}

#[test]
fn realloc_grows_in_place_then_moves_with_the_contents() {
  let m = manager(Config::default());
  unsafe {
    let p = m.realloc(std::ptr::null_mut(), 10);
    assert!(!p.is_null());
    for i in 0..10 {
      p.add(i).write(i as u8);
    }

    let usable = m.usable_size(p);
    let same = m.realloc(p, usable);
    assert_eq!(same, p);

    let moved = m.realloc(p, usable * 4);
    assert_ne!(moved, p);
    for i in 0..10 {
      assert_eq!(moved.add(i).read(), i as u8);
    }
    assert!(m.usable_size(moved) >= usable * 4);
    m.free(moved);
  }
}

#[test]
fn realloc_failure_keeps_the_old_block() {
  let m = manager(Config::default());
  unsafe {
    let p = m.malloc(64);
    p.write(42);
    assert!(m.realloc(p, MAX_CLASS_SIZE).is_null());
    assert_eq!(p.read(), 42);
    m.free(p);
  }
}

#[test]
fn calloc_zeroes_recycled_memory() {
  let m = manager(Config::default());
  let p = m.malloc(256);
  unsafe {
    p.write_bytes(0xFF, 256);
    m.free(p);
  }
  let q = m.calloc(8, 32);
  assert_eq!(q, p);
  let bytes = unsafe { std::slice::from_raw_parts(q, 256) };
  assert!(bytes.iter().all(|&b| b == 0));
  unsafe { m.free(q) };
}

#[test]
fn calloc_overflow_and_oversized_requests_return_null() {
  let m = manager(Config::default());
  assert!(m.calloc(usize::MAX, 2).is_null());
  assert!(m.calloc(1 << 40, 1 << 40).is_null());
  assert!(m.malloc(MAX_CLASS_SIZE * 2).is_null());
  assert!(m.malloc(usize::MAX).is_null());
}

#[test]
fn the_largest_class_is_served() {
  let m = manager(Config::default());
  let size = segmalloc::max_size_for::<segmalloc::BoundsCheck>(SizeClass::new(segmalloc::NUM_SIZE_CLASSES - 1).unwrap());
  let p = m.malloc(size);
  assert!(!p.is_null());
  unsafe {
    p.write(1);
    p.add(size - 1).write(2);
    m.free(p);
  }
}

#[test]
fn cross_thread_free_lands_in_the_freeing_threads_cache() {
  let m = manager(Config::default());
  let addr = std::thread::spawn(move || m.malloc(64) as usize).join().unwrap();

  let p = addr as *mut u8;
  let class = m.size_class_of(p).unwrap();
  unsafe { m.free(p) };
  let cached = m.thread_cache_stats().unwrap().blocks[class.index()];
  assert_eq!(cached, 1);
  assert_eq!(m.malloc(64), p);
}

#[test]
fn thread_exit_drains_its_cache_into_the_pool() {
  let m = manager(Config::default());
  std::thread::spawn(move || {
    let blocks: Vec<_> = (0..100).map(|_| m.malloc(48) as usize).collect();
    for p in blocks {
      unsafe { m.free(p as *mut u8) };
    }
    assert!(m.thread_cache_stats().unwrap().cached_bytes > 0);
  })
  .join()
  .unwrap();

  let stats = m.stats();
  assert_eq!(stats.threads.active, 0);
  assert_eq!(stats.caches.cached_bytes, 0);
  let class = SizeClass::for_size(48 + 20).unwrap().index();
  let pool = &stats.pool.classes[class];
  assert_eq!(pool.takes, pool.gives);
}

#[test]
fn exited_threads_give_their_slot_back() {
  let m = manager(Config::default().with_max_threads(2));
  for _ in 0..10 {
    std::thread::spawn(move || unsafe { m.free(m.malloc(8)) })
      .join()
      .unwrap();
  }
  let threads = m.stats().threads;
  assert_eq!(threads.registrations, 10);
  assert_eq!(threads.high_water, 1);
}

#[test]
fn big_free_runs_are_recycled_across_classes() {
  let m = manager(Config::default().with_always_reuse_limit(0).with_thread_cache_limit(0));
  let big = m.malloc(SPAN_SIZE * 8);
  let carved = m.stats().segment.carved_bytes;
  unsafe { m.free(big) };
  let stats = m.stats().segment;
  assert!(stats.carved_bytes < carved);
  assert!(m.size_class_of(big).is_none());

  let small = m.malloc(SPAN_SIZE * 2);
  assert!(!small.is_null());
  assert_eq!(m.stats().segment.regions, 1);
  unsafe { m.free(small) };
}

#[test]
fn runtime_knobs_take_effect() {
  let m = manager(Config::default());
  m.set_params(1 << 20, 0);
  let p = m.malloc(64);
  unsafe { m.free(p) };
  assert_eq!(m.thread_cache_stats().unwrap().cached_bytes, 0);
  assert_eq!(m.stats().pool.always_reuse_limit, 1 << 20);
}

#[test]
fn info_covers_segment_pool_and_threads() {
  let m = manager(Config::default());
  let p = m.malloc(5000);
  let mut out = String::new();
  m.info(&mut out, 0).unwrap();
  assert!(out.starts_with("segment: 1 regions"));
  assert!(out.contains("pool: "));
  assert!(out.contains("threads: 1 active"));
  assert!(out.contains("caches: "));
  assert!(!out.contains("class "));

  out.clear();
  m.info(&mut out, 1).unwrap();
  assert!(out.contains("8192 B: carves 1"));
  unsafe { m.free(p) };
}
