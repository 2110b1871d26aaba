//! End-to-end scenarios: full round trips over every tier, with balance
//! checks against the stats counters (and the budget when compiled in).

use cellar::{Config, Context};

#[test]
fn write_free_balance() {
  let ctx = Context::new(Config { reserve_size: 64 * 1024 * 1024, ..Config::default() })
    .expect("reserve failed");

  let p = ctx.alloc_bytes(32 * 1024, 0);
  assert!(!p.is_null());
  unsafe {
    core::ptr::write_bytes(p, 0xAA, 32 * 1024);
    for i in 0..32 * 1024 {
      assert_eq!(*p.add(i), 0xAA);
    }
    ctx.free_bytes(p);
  }

  #[cfg(feature = "budget")]
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn every_tier_round_trips_to_zero() {
  let ctx = Context::new(Config { reserve_size: 256 * 1024 * 1024, ..Config::default() })
    .expect("reserve failed");

  // A spread of sizes across the slab, whole-cell, buddy, and large tiers.
  let sizes = [
    1usize, 16, 17, 64, 100, 128, 1000, 4096, 8192, 8193, 16 * 1024, 40 * 1024, 512 * 1024,
    2 * 1024 * 1024, 5 * 1024 * 1024,
  ];

  let mut live = Vec::new();
  for (i, &size) in sizes.iter().cycle().take(200).enumerate() {
    let p = ctx.alloc_bytes(size, (i % 250) as u8);
    assert!(!p.is_null(), "size {size}");
    let fill = (i % 251) as u8;
    unsafe { core::ptr::write_bytes(p, fill, size) };
    live.push((p, size, fill));
  }

  let cell = ctx.alloc_cell(1);
  assert!(!cell.is_null());

  // Verify contents survived neighboring writes, then free everything.
  for (p, size, fill) in live {
    unsafe {
      for i in (0..size).step_by(size / 8 + 1) {
        assert_eq!(*p.add(i), fill, "size {size} corrupted");
      }
      ctx.free_bytes(p);
    }
  }
  unsafe { ctx.free_cell(cell) };

  ctx.trim();
  let stats = ctx.stats();
  assert_eq!(stats.live_cells, 0, "cells leaked");
  assert_eq!(stats.live_buddy_blocks, 0, "buddy blocks leaked");
  assert_eq!(stats.live_large, 0, "large mappings leaked");
  #[cfg(feature = "budget")]
  assert_eq!(ctx.get_budget_current(), 0, "budget did not balance");
}

#[test]
fn realloc_chain_preserves_a_growing_prefix() {
  let ctx = Context::new(Config { reserve_size: 128 * 1024 * 1024, ..Config::default() })
    .expect("reserve failed");

  // Walk one allocation up through every tier, checking the prefix each
  // time: slab -> slab -> buddy -> large -> back down to slab.
  let mut size = 64usize;
  let mut p = ctx.alloc_bytes(size, 0);
  assert!(!p.is_null());
  unsafe { core::ptr::write_bytes(p, 0xD7, size) };

  for new_size in [4096usize, 40 * 1024, 4 * 1024 * 1024, 128] {
    let q = unsafe { ctx.realloc_bytes(p, new_size, 0) };
    assert!(!q.is_null(), "realloc to {new_size} failed");
    let check = size.min(new_size).min(64);
    unsafe {
      for i in 0..check {
        assert_eq!(*q.add(i), 0xD7, "prefix lost at realloc to {new_size}");
      }
    }
    p = q;
    size = new_size;
  }

  unsafe { ctx.free_bytes(p) };
  ctx.trim();
  #[cfg(feature = "budget")]
  assert_eq!(ctx.get_budget_current(), 0);
}

#[test]
fn exhaustion_surfaces_as_null() {
  // A deliberately tiny reservation: the cell region runs out quickly and
  // the failure channel is a null pointer, not a panic.
  let ctx = Context::new(Config { reserve_size: 2 * 1024 * 1024, ..Config::default() })
    .expect("reserve failed");

  let mut count = 0usize;
  loop {
    let p = ctx.alloc_cell(0);
    if p.is_null() {
      break;
    }
    count += 1;
    assert!(count < 1024, "reservation should have been exhausted");
  }
  assert!(count > 0, "some cells should fit");
}
