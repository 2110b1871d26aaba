//! Bump arena over context memory.
//!
//! Linear allocation out of a chain of whole cells (oversized requests get
//! a dedicated chunk from the context's bigger tiers). Individual frees do
//! not exist; `reset` returns every chunk to its tier at once, and scopes
//! checkpoint/restore the bump state LIFO-fashion.

use core::ptr::null_mut;

use crate::config::{CELL_PAYLOAD_SIZE, align_up};
use crate::context::Context;

struct Chunk {
  base: *mut u8,
  capacity: usize,
}

/// A bump allocator borrowing a [`Context`].
///
/// Pointers stay valid until the arena is reset, dropped, or the enclosing
/// [`ArenaScope`] ends.
pub struct Arena<'ctx> {
  ctx: &'ctx Context,
  chunks: Vec<Chunk>,
  /// Bump offset within the last chunk.
  cursor: usize,
  tag: u8,
}

impl<'ctx> Arena<'ctx> {
  pub fn new(ctx: &'ctx Context, tag: u8) -> Self {
    Self { ctx, chunks: Vec::new(), cursor: 0, tag }
  }

  /// Allocates `size` bytes at the given power-of-two alignment. Null when
  /// the underlying context is out of memory.
  pub fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
    if size == 0 || !align.is_power_of_two() {
      return null_mut();
    }
    let align = align.max(8);

    if let Some(ptr) = self.bump(size, align) {
      return ptr;
    }

    // New chunk. Chunks are strictly appended so scopes can rewind by
    // truncating; an oversized request gets a dedicated chunk from the
    // context's bigger tiers and consumes it whole.
    let (base, capacity) = if size + align > CELL_PAYLOAD_SIZE {
      (self.ctx.alloc_aligned(size, align, self.tag), size)
    } else {
      (self.ctx.alloc_cell(self.tag), CELL_PAYLOAD_SIZE)
    };
    if base.is_null() {
      return null_mut();
    }
    self.chunks.push(Chunk { base, capacity });
    self.cursor = 0;
    // A fresh chunk always satisfies the request that created it.
    self.bump(size, align).unwrap_or(null_mut())
  }

  fn bump(&mut self, size: usize, align: usize) -> Option<*mut u8> {
    let chunk = self.chunks.last()?;
    let aligned = align_up(chunk.base as usize + self.cursor, align) - chunk.base as usize;
    if aligned + size > chunk.capacity {
      return None;
    }
    self.cursor = aligned + size;
    Some(unsafe { chunk.base.add(aligned) })
  }

  /// Returns every chunk to its tier. All arena pointers become invalid.
  pub fn reset(&mut self) {
    for chunk in self.chunks.drain(..) {
      unsafe { self.ctx.free_bytes(chunk.base) };
    }
    self.cursor = 0;
  }

  /// Opens a checkpoint scope; allocations made inside are released when
  /// the scope drops.
  pub fn scope(&mut self) -> ArenaScope<'_, 'ctx> {
    let chunks_len = self.chunks.len();
    let cursor = self.cursor;
    ArenaScope { arena: self, chunks_len, cursor }
  }

  /// Bytes allocated across all chunks (capacity, not requests).
  pub fn chunk_bytes(&self) -> usize {
    self.chunks.iter().map(|c| c.capacity).sum()
  }
}

impl Drop for Arena<'_> {
  fn drop(&mut self) {
    self.reset();
  }
}

/// A LIFO checkpoint over an [`Arena`]. Dropping it frees chunks acquired
/// inside the scope and rewinds the bump cursor.
pub struct ArenaScope<'a, 'ctx> {
  arena: &'a mut Arena<'ctx>,
  chunks_len: usize,
  cursor: usize,
}

impl ArenaScope<'_, '_> {
  pub fn alloc(&mut self, size: usize, align: usize) -> *mut u8 {
    self.arena.alloc(size, align)
  }
}

impl Drop for ArenaScope<'_, '_> {
  fn drop(&mut self) {
    for chunk in self.arena.chunks.drain(self.chunks_len..) {
      unsafe { self.arena.ctx.free_bytes(chunk.base) };
    }
    self.arena.cursor = self.cursor;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn ctx() -> Context {
    Context::new(Config { reserve_size: 64 * 1024 * 1024, ..Config::default() })
      .expect("reserve failed")
  }

  #[test]
  fn linear_allocations_do_not_overlap() {
    let ctx = ctx();
    let mut arena = Arena::new(&ctx, 1);
    let mut ptrs: Vec<usize> = (0..1000)
      .map(|_| {
        let p = arena.alloc(64, 8) as usize;
        assert!(p != 0);
        p
      })
      .collect();
    ptrs.sort_unstable();
    for pair in ptrs.windows(2) {
      assert!(pair[0] + 64 <= pair[1]);
    }
    arena.reset();
    ctx.trim();
    assert_eq!(ctx.stats().live_cells, 0);
  }

  #[test]
  fn alignment_is_honored() {
    let ctx = ctx();
    let mut arena = Arena::new(&ctx, 0);
    for align in [8usize, 16, 64, 256, 1024] {
      let p = arena.alloc(24, align);
      assert!(!p.is_null());
      assert_eq!(p as usize % align, 0);
    }
  }

  #[test]
  fn oversized_requests_get_dedicated_chunks() {
    let ctx = ctx();
    let mut arena = Arena::new(&ctx, 0);
    let small = arena.alloc(64, 8);
    let big = arena.alloc(100 * 1024, 8);
    let small2 = arena.alloc(64, 8);
    assert!(!small.is_null() && !big.is_null() && !small2.is_null());
    let big_range = big as usize..big as usize + 100 * 1024;
    assert!(!big_range.contains(&(small as usize)));
    assert!(!big_range.contains(&(small2 as usize)));
    assert!(arena.chunk_bytes() >= 100 * 1024 + CELL_PAYLOAD_SIZE);
  }

  #[test]
  fn scopes_restore_lifo() {
    let ctx = ctx();
    let mut arena = Arena::new(&ctx, 0);
    let outer = arena.alloc(128, 8);
    assert!(!outer.is_null());
    let bytes_before = arena.chunk_bytes();

    {
      let mut scope = arena.scope();
      for _ in 0..2000 {
        assert!(!scope.alloc(64, 8).is_null());
      }
    }

    assert_eq!(arena.chunk_bytes(), bytes_before);
    // The next allocation lands right where the scope started.
    let after = arena.alloc(128, 8);
    assert_eq!(after as usize, outer as usize + 128);
  }

  #[test]
  fn drop_returns_everything() {
    let ctx = ctx();
    {
      let mut arena = Arena::new(&ctx, 0);
      for _ in 0..100 {
        arena.alloc(1024, 8);
      }
    }
    ctx.trim();
    assert_eq!(ctx.stats().live_cells, 0);
    #[cfg(feature = "budget")]
    assert_eq!(ctx.get_budget_current(), 0);
  }
}
