//! Typed object pool.
//!
//! Fixed-element allocation with batched refill and release, so one bin
//! lock acquisition amortizes over [`POOL_BATCH`] elements instead of one.

use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::ptr::{NonNull, null_mut};

use crate::config::size_class_for;
use crate::context::Context;

/// Elements moved per refill or release batch.
const POOL_BATCH: usize = 32;

/// A pool of uninitialized `T` slots backed by a [`Context`].
///
/// The pool hands out raw capacity; constructing and dropping `T` values
/// in the slots is the caller's business.
pub struct Pool<'ctx, T> {
  ctx: &'ctx Context,
  free: Vec<*mut u8>,
  tag: u8,
  _marker: PhantomData<T>,
}

impl<'ctx, T> Pool<'ctx, T> {
  pub fn new(ctx: &'ctx Context, tag: u8) -> Self {
    Self { ctx, free: Vec::new(), tag, _marker: PhantomData }
  }

  /// Slot size: covers the element and its alignment, so the size class
  /// chosen for it is naturally aligned for `T`.
  const fn slot_size() -> usize {
    let size = if size_of::<T>() > align_of::<T>() { size_of::<T>() } else { align_of::<T>() };
    if size < 16 { 16 } else { size }
  }

  /// Takes a slot, refilling from the context in a batch when empty.
  pub fn alloc(&mut self) -> Option<NonNull<T>> {
    if self.free.is_empty() {
      let mut batch = [null_mut::<u8>(); POOL_BATCH];
      let filled = self.ctx.alloc_batch(Self::slot_size(), self.tag, &mut batch);
      self.free.extend_from_slice(&batch[..filled]);
    }
    self.free.pop().and_then(|p| NonNull::new(p as *mut T))
  }

  /// Returns a slot to the pool.
  ///
  /// # Safety
  /// `ptr` must come from [`alloc`](Self::alloc) on this pool, with any `T`
  /// inside already dropped; it must not be used afterwards.
  pub unsafe fn free(&mut self, ptr: NonNull<T>) {
    self.free.push(ptr.as_ptr() as *mut u8);
    if self.free.len() >= 2 * POOL_BATCH {
      self.release(POOL_BATCH);
    }
  }

  /// Cached free slots.
  pub fn cached(&self) -> usize {
    self.free.len()
  }

  fn release(&mut self, count: usize) {
    let start = self.free.len() - count;
    if size_class_for(Self::slot_size(), 8).is_some() {
      unsafe { self.ctx.free_batch(&self.free[start..]) };
    } else {
      // Oversized elements were allocated one by one.
      for &p in &self.free[start..] {
        unsafe { self.ctx.free_bytes(p) };
      }
    }
    self.free.truncate(start);
  }
}

impl<T> Drop for Pool<'_, T> {
  fn drop(&mut self) {
    let len = self.free.len();
    if len > 0 {
      self.release(len);
    }
  }
}
