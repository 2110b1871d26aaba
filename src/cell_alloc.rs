//! OS-backed cell allocator.
//!
//! Carves the cell region of the reservation into cell-aligned chunks.
//! Returned cells sit on an intrusive free list; fresh cells come from a
//! high-water cursor and are committed outside the lock. Once the free list
//! grows past [`CELL_FREE_HIGH_WATER`] incoming cells are decommitted, so
//! idle contexts give physical pages back to the OS.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicUsize, Ordering};

use log::trace;
use parking_lot::Mutex;

use crate::config::{CELL_FREE_HIGH_WATER, CELL_SIZE};
use crate::os;

#[repr(C)]
struct FreeCell {
  next: *mut FreeCell,
}

struct CellState {
  /// Next never-handed-out cell.
  cursor: *mut u8,
  /// End of the cell region (exclusive).
  region_end: *mut u8,
  /// Intrusive list of returned cells.
  free_head: *mut FreeCell,
}

unsafe impl Send for CellState {}

pub struct CellAllocator {
  state: Mutex<CellState>,
  free_count: AtomicUsize,
  outstanding: AtomicUsize,
}

impl CellAllocator {
  /// Manages `[base, region_end)`, which must be cell-aligned on both ends
  /// and lie inside a reservation.
  pub fn new(base: *mut u8, region_end: *mut u8) -> Self {
    debug_assert_eq!(base as usize % CELL_SIZE, 0);
    debug_assert_eq!(region_end as usize % CELL_SIZE, 0);
    Self {
      state: Mutex::new(CellState { cursor: base, region_end, free_head: null_mut() }),
      free_count: AtomicUsize::new(0),
      outstanding: AtomicUsize::new(0),
    }
  }

  /// Returns a cell-aligned, committed region of `CELL_SIZE` bytes, or null
  /// when the reservation is exhausted. Contents are unspecified.
  pub fn alloc(&self) -> *mut u8 {
    let (ptr, fresh) = {
      let mut state = self.state.lock();
      if !state.free_head.is_null() {
        let cell = state.free_head;
        state.free_head = unsafe { (*cell).next };
        self.free_count.fetch_sub(1, Ordering::Relaxed);
        (cell as *mut u8, false)
      } else if state.cursor < state.region_end {
        let ptr = state.cursor;
        state.cursor = unsafe { ptr.add(CELL_SIZE) };
        (ptr, true)
      } else {
        return null_mut();
      }
    };

    // Fresh cells need their pages committed; recycled cells are already
    // mapped read-write (decommit keeps the protection).
    if fresh && !unsafe { os::commit(ptr, CELL_SIZE) } {
      let mut state = self.state.lock();
      // Retract the cursor if nobody advanced it past us, else the cell's
      // address range is abandoned until teardown.
      if state.cursor == unsafe { ptr.add(CELL_SIZE) } {
        state.cursor = ptr;
      }
      return null_mut();
    }

    self.outstanding.fetch_add(1, Ordering::Relaxed);
    ptr
  }

  /// Returns a cell to the pool.
  ///
  /// # Safety
  /// `cell` must have been obtained from [`alloc`](Self::alloc) on this
  /// allocator and must not be referenced afterwards.
  pub unsafe fn free(&self, cell: *mut u8) {
    debug_assert_eq!(cell as usize % CELL_SIZE, 0);

    // Over the high-water mark, give the physical pages back before the
    // cell joins the list. The link write below faults one zero page in.
    if self.free_count.load(Ordering::Relaxed) >= CELL_FREE_HIGH_WATER {
      unsafe { os::decommit(cell, CELL_SIZE) };
      trace!("decommitted cell {cell:p}");
    }

    let node = cell as *mut FreeCell;
    let mut state = self.state.lock();
    unsafe { (*node).next = state.free_head };
    state.free_head = node;
    self.free_count.fetch_add(1, Ordering::Relaxed);
    self.outstanding.fetch_sub(1, Ordering::Relaxed);
  }

  /// Cells currently handed out.
  pub fn outstanding(&self) -> usize {
    self.outstanding.load(Ordering::Relaxed)
  }
}
