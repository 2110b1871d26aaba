//! Standard-container allocator shim.
//!
//! Adapts a [`Context`] to the `allocator-api2` [`Allocator`] trait so
//! standard containers can live inside context memory on stable Rust. The
//! shim is the one place where a null return is translated into the
//! protocol's error value.

use core::alloc::Layout;
use core::ptr::NonNull;

use allocator_api2::alloc::{AllocError, Allocator};

use crate::context::Context;

/// Tag-carrying [`Allocator`] over a borrowed [`Context`].
///
/// ```no_run
/// use allocator_api2::vec::Vec;
/// use cellar::{Config, Context, ContextAlloc};
///
/// let ctx = Context::new(Config::default())?;
/// let mut numbers: Vec<u32, _> = Vec::new_in(ContextAlloc::new(&ctx, 1));
/// numbers.push(42);
/// # Ok::<(), cellar::Error>(())
/// ```
#[derive(Clone, Copy)]
pub struct ContextAlloc<'ctx> {
  ctx: &'ctx Context,
  tag: u8,
}

impl<'ctx> ContextAlloc<'ctx> {
  pub fn new(ctx: &'ctx Context, tag: u8) -> Self {
    Self { ctx, tag }
  }
}

unsafe impl Allocator for ContextAlloc<'_> {
  fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
    if layout.size() == 0 {
      // Aligned dangling pointer; zero-sized layouts never hit the context.
      let dangling = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
      return Ok(NonNull::slice_from_raw_parts(dangling, 0));
    }
    let ptr = self.ctx.alloc_aligned(layout.size(), layout.align().max(8), self.tag);
    match NonNull::new(ptr) {
      Some(ptr) => Ok(NonNull::slice_from_raw_parts(ptr, layout.size())),
      None => Err(AllocError),
    }
  }

  unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
    if layout.size() != 0 {
      unsafe { self.ctx.free_bytes(ptr.as_ptr()) };
    }
  }
}
