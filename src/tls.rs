//! Per-thread bin caches for the hottest size classes.
//!
//! Each thread keeps a fixed-capacity stack of free blocks for the first
//! [`TLS_BIN_COUNT`] bins of every context it allocates from. The fast path
//! takes no lock; refill and flush move blocks in batches under the shared
//! bin lock. On thread exit the whole cache drains back into the owning
//! context (the only point where thread-termination ordering matters).
//! Entries hold a `Weak` owner, so a context that died first just
//! invalidates its blocks.

use core::ptr::null_mut;
use std::cell::RefCell;
use std::sync::{Arc, Weak};

use crate::config::{TLS_BIN_CACHE_CAPACITY, TLS_BIN_COUNT};
use crate::context::ContextInner;

/// Fixed-capacity stack of free blocks of one size class.
pub(crate) struct BinCache {
  pub(crate) blocks: [*mut u8; TLS_BIN_CACHE_CAPACITY],
  pub(crate) len: usize,
}

impl BinCache {
  const fn new() -> Self {
    Self { blocks: [null_mut(); TLS_BIN_CACHE_CAPACITY], len: 0 }
  }

  #[inline(always)]
  pub(crate) fn is_full(&self) -> bool {
    self.len == TLS_BIN_CACHE_CAPACITY
  }

  #[inline(always)]
  pub(crate) fn pop(&mut self) -> *mut u8 {
    if self.len == 0 {
      return null_mut();
    }
    self.len -= 1;
    self.blocks[self.len]
  }

  #[inline(always)]
  pub(crate) fn push(&mut self, block: *mut u8) {
    debug_assert!(!self.is_full());
    self.blocks[self.len] = block;
    self.len += 1;
  }

  /// Removes the top `count` blocks and returns them for flushing.
  pub(crate) fn take_top(&mut self, count: usize) -> &[*mut u8] {
    debug_assert!(count <= self.len);
    self.len -= count;
    &self.blocks[self.len..self.len + count]
  }
}

struct TlsEntry {
  ctx_id: u64,
  owner: Weak<ContextInner>,
  bins: [BinCache; TLS_BIN_COUNT],
}

struct TlsState {
  entries: Vec<TlsEntry>,
}

impl TlsState {
  fn entry_for(&mut self, inner: &Arc<ContextInner>) -> &mut TlsEntry {
    // Dead contexts leave stale entries behind; drop them as we pass.
    self.entries.retain(|e| e.owner.strong_count() > 0);

    let id = inner.id();
    if let Some(index) = self.entries.iter().position(|e| e.ctx_id == id) {
      return &mut self.entries[index];
    }
    self.entries.push(TlsEntry {
      ctx_id: id,
      owner: Arc::downgrade(inner),
      bins: [const { BinCache::new() }; TLS_BIN_COUNT],
    });
    let last = self.entries.len() - 1;
    &mut self.entries[last]
  }
}

impl Drop for TlsState {
  fn drop(&mut self) {
    for entry in &mut self.entries {
      if let Some(inner) = entry.owner.upgrade() {
        inner.drain_thread_caches(&mut entry.bins);
      }
      // Owner gone: the reservation was released, the blocks with it.
    }
  }
}

thread_local! {
  static CACHES: RefCell<TlsState> = RefCell::new(TlsState { entries: Vec::new() });
}

/// Runs `f` over this thread's caches for `inner`. Returns `None` during
/// thread teardown, when the TLS slot is no longer usable; callers fall
/// back to the shared slab.
#[inline]
pub(crate) fn with_caches<R>(
  inner: &Arc<ContextInner>,
  f: impl FnOnce(&mut [BinCache; TLS_BIN_COUNT]) -> R,
) -> Option<R> {
  CACHES
    .try_with(|state| {
      let mut state = state.borrow_mut();
      f(&mut state.entry_for(inner).bins)
    })
    .ok()
}
