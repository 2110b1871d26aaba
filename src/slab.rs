//! Sub-cell slab: size bins, partial-cell lists and the warm reserve.
//!
//! Callers hold the bin lock around every function here; cells flow to and
//! from the cell allocator outside that lock. The partial list is a LIFO
//! stack of cells with at least one free block, so the most recently
//! touched cell is preferred.

use core::ptr::null_mut;

use crate::cell::{
  self, CellHeader, FreeBlock, block_start, header_of, mark_alive, mark_freed, meta_of,
};
use crate::config::{SIZE_CLASSES, WARM_CELLS_PER_BIN, blocks_per_cell};

/// Per-size-class state. Protected by the owning context's bin lock.
pub struct SizeBin {
  /// Head of the partial cell list.
  pub partial_head: *mut CellHeader,
  /// Fully-empty cells retained in the partial list as cold reserve.
  pub warm_cells: usize,
  /// Blocks ever allocated from this bin.
  pub total_allocated: u64,
  /// Blocks currently live.
  pub current_allocated: u64,
}

unsafe impl Send for SizeBin {}

impl SizeBin {
  pub const fn new() -> Self {
    Self {
      partial_head: null_mut(),
      warm_cells: 0,
      total_allocated: 0,
      current_allocated: 0,
    }
  }
}

/// Prepares a fresh cell for `bin`: writes the header, threads every block
/// into the cell-local free list in ascending address order.
///
/// # Safety
/// `raw` must be a committed, exclusively-owned cell.
pub unsafe fn init_cell_for_bin(raw: *mut u8, bin: usize, tag: u8) -> *mut CellHeader {
  let header = raw as *mut CellHeader;
  let num_blocks = blocks_per_cell(bin);
  let class = SIZE_CLASSES[bin];

  unsafe {
    (*header).tag = tag;
    (*header).size_class = bin as u8;
    (*header).free_count = num_blocks as u16;
    mark_alive(header);

    let meta = meta_of(header);
    (*meta).next_partial = null_mut();

    // Thread blocks back to front so the chain ends up ascending.
    let start = block_start(header, bin);
    let mut prev: *mut FreeBlock = null_mut();
    for i in (0..num_blocks).rev() {
      let block = start.add(i * class) as *mut FreeBlock;
      (*block).next = prev;
      prev = block;
    }
    (*meta).free_list = prev;
  }

  header
}

/// Pops one block from the head partial cell, unlinking the cell when it
/// becomes full. Returns null when the bin has no partial cells.
///
/// # Safety
/// Caller holds the bin lock for `bin`.
pub unsafe fn try_alloc_from_partial(state: &mut SizeBin, bin: usize) -> *mut u8 {
  let header = state.partial_head;
  if header.is_null() {
    return null_mut();
  }

  unsafe {
    let meta = meta_of(header);

    // Taking a block out of a fully-empty cell consumes a warm reserve.
    if (*header).free_count as usize == blocks_per_cell(bin) {
      state.warm_cells = state.warm_cells.saturating_sub(1);
    }

    let block = (*meta).free_list;
    debug_assert!(!block.is_null(), "partial cell {header:p} has no free blocks");
    (*meta).free_list = (*block).next;
    (*header).free_count -= 1;

    if (*header).free_count == 0 {
      state.partial_head = (*meta).next_partial;
      (*meta).next_partial = null_mut();
    }

    state.total_allocated += 1;
    state.current_allocated += 1;
    block as *mut u8
  }
}

/// Takes the first block out of a freshly initialized cell and links the
/// cell into the partial list if blocks remain.
///
/// # Safety
/// Caller holds the bin lock; `header` came from [`init_cell_for_bin`] and
/// is not yet visible to any other thread.
pub unsafe fn adopt_fresh_cell(state: &mut SizeBin, header: *mut CellHeader) -> *mut u8 {
  unsafe {
    let meta = meta_of(header);
    let block = (*meta).free_list;
    debug_assert!(!block.is_null());
    (*meta).free_list = (*block).next;
    (*header).free_count -= 1;

    if (*header).free_count > 0 {
      (*meta).next_partial = state.partial_head;
      state.partial_head = header;
    }

    state.total_allocated += 1;
    state.current_allocated += 1;
    block as *mut u8
  }
}

/// Pushes a block back onto its cell's free list. When this empties the
/// cell, the cell is either retained as warm reserve or unlinked and handed
/// back to the caller for release to the cell allocator.
///
/// # Safety
/// Caller holds the bin lock; `ptr` is a live block of `header`'s class and
/// `header == header_of(ptr)`.
pub unsafe fn free_to_bin(
  state: &mut SizeBin,
  ptr: *mut u8,
  header: *mut CellHeader,
) -> Option<*mut CellHeader> {
  unsafe {
    let bin = (*header).size_class as usize;
    let class = SIZE_CLASSES[bin];
    let meta = meta_of(header);

    cell::poison(ptr, class);

    let was_full = (*header).free_count == 0;

    let block = ptr as *mut FreeBlock;
    (*block).next = (*meta).free_list;
    (*meta).free_list = block;
    (*header).free_count += 1;

    state.current_allocated -= 1;

    let max_blocks = blocks_per_cell(bin);
    if (*header).free_count as usize == max_blocks {
      // Cell is now completely empty.
      if state.warm_cells < WARM_CELLS_PER_BIN {
        state.warm_cells += 1;
        if was_full {
          (*meta).next_partial = state.partial_head;
          state.partial_head = header;
        }
        return None;
      }

      // Over the warm cap: unlink and hand back. The walk only runs on the
      // empty transition and empty cells are the minority.
      if !was_full {
        unlink_from_partial(state, header);
      }
      (*meta).next_partial = null_mut();
      mark_freed(header);
      return Some(header);
    }

    if was_full {
      // Cell was full, now has space again.
      (*meta).next_partial = state.partial_head;
      state.partial_head = header;
    }
    None
  }
}

/// Pops up to `out.len()` blocks from partial cells. Never requests fresh
/// cells; returns how many slots were filled.
///
/// # Safety
/// Caller holds the bin lock for `bin`.
pub unsafe fn pop_batch(state: &mut SizeBin, bin: usize, out: &mut [*mut u8]) -> usize {
  let mut filled = 0;
  while filled < out.len() {
    let block = unsafe { try_alloc_from_partial(state, bin) };
    if block.is_null() {
      break;
    }
    out[filled] = block;
    filled += 1;
  }
  filled
}

/// Returns a batch of same-class blocks, collecting cells that emptied past
/// the warm cap into `released` for the caller to free outside the lock.
///
/// # Safety
/// Caller holds the bin lock; every block belongs to this bin.
pub unsafe fn push_batch(
  state: &mut SizeBin,
  blocks: &[*mut u8],
  released: &mut Vec<*mut CellHeader>,
) {
  for &ptr in blocks {
    let header = header_of(ptr);
    if let Some(cell) = unsafe { free_to_bin(state, ptr, header) } {
      released.push(cell);
    }
  }
}

/// Unlinks every fully-empty cell and resets the warm counter. Used by
/// `Context::trim`.
///
/// # Safety
/// Caller holds the bin lock for `bin`.
pub unsafe fn drain_warm_cells(
  state: &mut SizeBin,
  bin: usize,
  released: &mut Vec<*mut CellHeader>,
) {
  let max_blocks = blocks_per_cell(bin);
  unsafe {
    let mut link: *mut *mut CellHeader = &mut state.partial_head;
    while !(*link).is_null() {
      let header = *link;
      let meta = meta_of(header);
      if (*header).free_count as usize == max_blocks {
        *link = (*meta).next_partial;
        (*meta).next_partial = null_mut();
        mark_freed(header);
        released.push(header);
      } else {
        link = &mut (*meta).next_partial;
      }
    }
  }
  state.warm_cells = 0;
}

unsafe fn unlink_from_partial(state: &mut SizeBin, header: *mut CellHeader) {
  unsafe {
    let mut link: *mut *mut CellHeader = &mut state.partial_head;
    while !(*link).is_null() && *link != header {
      link = &mut (*meta_of(*link)).next_partial;
    }
    debug_assert!(!(*link).is_null(), "cell {header:p} not found in partial list");
    if *link == header {
      *link = (*meta_of(header)).next_partial;
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{CELL_SIZE, blocks_per_cell};
  use std::alloc::{Layout, alloc, dealloc};

  struct RawCell(*mut u8);

  impl RawCell {
    fn new() -> Self {
      let layout = Layout::from_size_align(CELL_SIZE, CELL_SIZE).unwrap();
      RawCell(unsafe { alloc(layout) })
    }
  }

  impl Drop for RawCell {
    fn drop(&mut self) {
      let layout = Layout::from_size_align(CELL_SIZE, CELL_SIZE).unwrap();
      unsafe { dealloc(self.0, layout) };
    }
  }

  #[test]
  fn cell_init_builds_an_ascending_chain() {
    let raw = RawCell::new();
    let bin = 2; // 64 B
    let header = unsafe { init_cell_for_bin(raw.0, bin, 7) };

    unsafe {
      assert_eq!((*header).size_class, bin as u8);
      assert_eq!((*header).tag, 7);
      assert_eq!((*header).free_count as usize, blocks_per_cell(bin));

      let mut node = (*meta_of(header)).free_list;
      let mut prev_addr = 0usize;
      let mut count = 0usize;
      while !node.is_null() {
        assert!(node as usize > prev_addr);
        prev_addr = node as usize;
        node = (*node).next;
        count += 1;
      }
      assert_eq!(count, blocks_per_cell(bin));
    }
  }

  #[test]
  fn alloc_free_round_trip_through_one_cell() {
    let raw = RawCell::new();
    let bin = 3; // 128 B
    let mut state = SizeBin::new();
    let header = unsafe { init_cell_for_bin(raw.0, bin, 0) };

    let first = unsafe { adopt_fresh_cell(&mut state, header) };
    assert!(!first.is_null());
    assert_eq!(state.partial_head, header);

    let capacity = blocks_per_cell(bin);
    let mut blocks = vec![first];
    for _ in 1..capacity {
      let b = unsafe { try_alloc_from_partial(&mut state, bin) };
      assert!(!b.is_null());
      blocks.push(b);
    }

    // Cell is full: it left the partial list.
    assert!(state.partial_head.is_null());
    assert_eq!(unsafe { (*header).free_count }, 0);
    assert_eq!(state.current_allocated, capacity as u64);

    // Freeing everything keeps the (now empty) cell as warm reserve.
    for &b in &blocks {
      let released = unsafe { free_to_bin(&mut state, b, header) };
      assert!(released.is_none());
    }
    assert_eq!(state.warm_cells, 1);
    assert_eq!(state.partial_head, header);
    assert_eq!(state.current_allocated, 0);

    // The warm cell serves the next allocation and gives its reserve back.
    let again = unsafe { try_alloc_from_partial(&mut state, bin) };
    assert!(!again.is_null());
    assert_eq!(state.warm_cells, 0);
  }

  #[test]
  fn warm_cap_bounds_retained_cells() {
    let bin = 0;
    let cells: Vec<RawCell> = (0..WARM_CELLS_PER_BIN + 2).map(|_| RawCell::new()).collect();
    let mut state = SizeBin::new();

    let mut live: Vec<(*mut u8, *mut CellHeader)> = Vec::new();
    for raw in &cells {
      let header = unsafe { init_cell_for_bin(raw.0, bin, 0) };
      let block = unsafe { adopt_fresh_cell(&mut state, header) };
      live.push((block, header));
    }

    let mut released = 0usize;
    for (block, header) in live {
      if unsafe { free_to_bin(&mut state, block, header) }.is_some() {
        released += 1;
      }
      assert!(state.warm_cells <= WARM_CELLS_PER_BIN);
    }
    assert_eq!(released, 2);
    assert_eq!(state.warm_cells, WARM_CELLS_PER_BIN);
  }
}
