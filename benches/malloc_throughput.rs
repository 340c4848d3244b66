use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

const OPS: u64 = 100_000;

/// segmalloc alloc/free throughput.
fn segmalloc_malloc_free(size: usize) {
  let m = segmalloc::global();
  for _ in 0..OPS {
    unsafe {
      let ptr = m.malloc(size);
      black_box(ptr);
      m.free(ptr);
    }
  }
}

/// Same loop without signatures.
fn plain_malloc_free(m: &'static segmalloc::MemoryManager<segmalloc::Plain>, size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = m.malloc(size);
      black_box(ptr);
      m.free(ptr);
    }
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_malloc_throughput(c: &mut Criterion) {
  let plain: &'static segmalloc::MemoryManager<segmalloc::Plain> = Box::leak(Box::new(
    segmalloc::MemoryManager::new(&segmalloc::Config::default()).unwrap(),
  ));
  let mut group = c.benchmark_group("malloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("segmalloc", size), &size, |b, &size| {
      b.iter(|| segmalloc_malloc_free(size))
    });

    group.bench_with_input(BenchmarkId::new("segmalloc-plain", size), &size, |b, &size| {
      b.iter(|| plain_malloc_free(plain, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

criterion_group!(benches, benchmark_malloc_throughput);
criterion_main!(benches);
