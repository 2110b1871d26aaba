use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::hint::black_box;

use cellar::{Config, Context};

const OPS: u64 = 100_000;

/// cellar alloc/free throughput.
fn cellar_alloc_free(ctx: &Context, size: usize) {
  for _ in 0..OPS {
    let ptr = ctx.alloc_bytes(size, 0);
    black_box(ptr);
    unsafe { ctx.free_bytes(ptr) };
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

fn benchmark_alloc_throughput(c: &mut Criterion) {
  let ctx = Context::new(Config { reserve_size: 1 << 30, ..Config::default() })
    .expect("reserve failed");

  let mut group = c.benchmark_group("alloc_throughput");

  for size in [16, 64, 256, 1024, 4096, 64 * 1024] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("cellar", size), &size, |b, &size| {
      b.iter(|| cellar_alloc_free(&ctx, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

fn benchmark_batch_throughput(c: &mut Criterion) {
  let ctx = Context::new(Config { reserve_size: 1 << 30, ..Config::default() })
    .expect("reserve failed");

  let mut group = c.benchmark_group("batch_throughput");
  group.throughput(Throughput::Elements(64));

  group.bench_function("alloc_batch_64x64", |b| {
    let mut ptrs = [core::ptr::null_mut(); 64];
    b.iter(|| {
      let filled = ctx.alloc_batch(64, 0, &mut ptrs);
      black_box(&ptrs);
      unsafe { ctx.free_batch(&ptrs[..filled]) };
    })
  });

  group.finish();
}

criterion_group!(benches, benchmark_alloc_throughput, benchmark_batch_throughput);
criterion_main!(benches);
