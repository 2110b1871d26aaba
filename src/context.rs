//! The context: a memory environment owning a reserved address range.
//!
//! Every public request is dispatched to exactly one tier. Allocation
//! classifies by rounded size (slab, then buddy, then large); free
//! classifies by address: pointers inside the cell region resolve their
//! header with one mask, pointers inside the buddy region read the inline
//! block header, everything else is looked up in the large registry.
//!
//! Lock discipline: a bin lock may be followed by the cell-allocator lock;
//! the buddy and large locks stand alone; no lock spans an OS call; no two
//! bin locks are ever held together.

use core::ptr::null_mut;
use core::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

#[cfg(feature = "budget")]
use crate::budget::{Budget, BudgetCallback};
use crate::buddy::{self, BuddyAllocator};
use crate::cell::{self, CellHeader, header_of};
use crate::cell_alloc::CellAllocator;
use crate::config::{
  BLOCK_START_OFFSET, CELL_PAYLOAD_SIZE, CELL_SIZE, Config, FULL_CELL_MARKER, NUM_SIZE_BINS,
  SIZE_CLASSES, TLS_BIN_COUNT, TLS_REFILL_BATCH, TLS_FLUSH_BATCH, align_down, align_up,
  size_class_for,
};
use crate::large::LargeRegistry;
use crate::os;
use crate::slab::{self, SizeBin};
use crate::tls::{self, BinCache};

/// Construction failure. Allocation paths never surface errors; they
/// return null.
#[derive(Debug, Error)]
pub enum Error {
  #[error("failed to reserve {size} bytes of address space")]
  ReserveFailed { size: usize },
}

/// Outstanding resource counts, mostly useful for leak checks in tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
  /// Cells handed out by the cell allocator (dedicated, whole, and warm
  /// reserves still held by bins).
  pub live_cells: usize,
  /// Live buddy blocks.
  pub live_buddy_blocks: usize,
  /// Live direct OS mappings.
  pub live_large: usize,
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A memory environment owning a reserved virtual address range.
///
/// Dropping the context releases the reservation and invalidates every
/// pointer it ever handed out.
pub struct Context {
  inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
  id: u64,
  raw_base: *mut u8,
  raw_size: usize,
  base: *mut u8,
  /// End of the cell region; the buddy region (if any) starts here.
  cell_region_end: *mut u8,
  cells: CellAllocator,
  bins: [Mutex<SizeBin>; NUM_SIZE_BINS],
  buddy: Option<BuddyAllocator>,
  large: LargeRegistry,
  #[cfg(feature = "budget")]
  budget: Budget,
}

unsafe impl Send for ContextInner {}
unsafe impl Sync for ContextInner {}

enum Tier {
  Sub(usize),
  Buddy,
  Large,
}

impl Context {
  /// Creates a new memory environment. Reserves address space only;
  /// physical pages are committed as allocations touch them.
  pub fn new(config: Config) -> Result<Self, Error> {
    let reserve_size = align_up(config.reserve_size.max(CELL_SIZE), CELL_SIZE);

    // Over-reserve one cell so the base can be trimmed up to alignment.
    let raw_size = reserve_size + CELL_SIZE;
    let raw = os::reserve(raw_size);
    if raw.is_null() {
      return Err(Error::ReserveFailed { size: raw_size });
    }
    let base = align_up(raw as usize, CELL_SIZE) as *mut u8;

    let region_size = buddy::region_size_for(reserve_size);
    let (buddy_alloc, cell_region_end) = if region_size != 0 {
      let buddy_base =
        align_down(base as usize + reserve_size - region_size, region_size) as *mut u8;
      (Some(BuddyAllocator::new(buddy_base, region_size)), buddy_base)
    } else {
      (None, (base as usize + reserve_size) as *mut u8)
    };

    let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
    debug!("context {id}: reserved {reserve_size} bytes at {base:p}");

    Ok(Self {
      inner: Arc::new(ContextInner {
        id,
        raw_base: raw,
        raw_size,
        base,
        cell_region_end,
        cells: CellAllocator::new(base, cell_region_end),
        bins: std::array::from_fn(|_| Mutex::new(SizeBin::new())),
        buddy: buddy_alloc,
        large: LargeRegistry::new(),
        #[cfg(feature = "budget")]
        budget: Budget::new(config.memory_budget, config.budget_callback),
      }),
    })
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  /// Allocates `size` bytes at 8-byte alignment. Null on failure.
  pub fn alloc_bytes(&self, size: usize, tag: u8) -> *mut u8 {
    self.alloc_with_alignment(size, 8, tag)
  }

  /// Allocates `size` bytes at the given power-of-two alignment.
  pub fn alloc_aligned(&self, size: usize, align: usize, tag: u8) -> *mut u8 {
    if !align.is_power_of_two() {
      debug_assert!(false, "alignment {align} is not a power of two");
      return null_mut();
    }
    self.alloc_with_alignment(size, align.max(8), tag)
  }

  fn alloc_with_alignment(&self, size: usize, align: usize, tag: u8) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let inner = &self.inner;

    match inner.tier_for(size, align) {
      Tier::Sub(bin) => {
        let rounded = SIZE_CLASSES[bin];
        if !inner.charge(size, rounded) {
          return null_mut();
        }
        let ptr = if bin < TLS_BIN_COUNT {
          self.alloc_small_cached(bin, tag)
        } else {
          inner.alloc_small_slow(bin, tag)
        };
        if ptr.is_null() {
          inner.refund(rounded);
        }
        ptr
      }
      Tier::Buddy => {
        // tier_for only picks the buddy tier when the request fits it.
        let Some(buddy) = inner.buddy.as_ref() else {
          return null_mut();
        };
        let Some(rounded) = buddy.rounded_block_size(size, align) else {
          return null_mut();
        };
        if !inner.charge(size, rounded) {
          return null_mut();
        }
        let ptr = buddy.alloc(size, align, tag);
        if ptr.is_null() {
          inner.refund(rounded);
        }
        ptr
      }
      Tier::Large => {
        let Some(rounded) = inner.large.rounded_map_size(size, align) else {
          return null_mut();
        };
        if !inner.charge(size, rounded) {
          return null_mut();
        }
        let ptr = inner.large.alloc(size, align, tag);
        if ptr.is_null() {
          inner.refund(rounded);
        }
        ptr
      }
    }
  }

  fn alloc_small_cached(&self, bin: usize, tag: u8) -> *mut u8 {
    let inner = &self.inner;
    let cached = tls::with_caches(inner, |caches| {
      let cache = &mut caches[bin];
      let ptr = cache.pop();
      if !ptr.is_null() {
        return ptr;
      }
      inner.refill_cache(bin, cache);
      cache.pop()
    });
    match cached {
      Some(ptr) if !ptr.is_null() => ptr,
      // TLS teardown, or no partial cells to refill from.
      _ => inner.alloc_small_slow(bin, tag),
    }
  }

  // ===========================================================================
  // Free
  // ===========================================================================

  /// Frees any pointer previously returned by this context. Null-safe.
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation of this context; it must not
  /// be used afterwards.
  pub unsafe fn free_bytes(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    let inner = &self.inner;

    if inner.in_cell_region(ptr) {
      let header = header_of(ptr);
      unsafe { cell::assert_alive(header) };
      let class = unsafe { (*header).size_class };
      if class == FULL_CELL_MARKER {
        unsafe { inner.free_whole_cell(header) };
        inner.refund(CELL_SIZE);
      } else {
        let bin = class as usize;
        debug_assert!(bin < NUM_SIZE_BINS, "corrupt cell header at {header:p}");
        if bin < TLS_BIN_COUNT {
          self.free_small_cached(ptr, header, bin);
        } else {
          inner.free_small_slow(ptr, header);
        }
        inner.refund(SIZE_CLASSES[bin]);
      }
      return;
    }

    if let Some(b) = inner.buddy.as_ref()
      && b.contains(ptr)
    {
      let rounded = unsafe { b.free(ptr) };
      inner.refund(rounded);
      return;
    }

    if let Some(rounded) = inner.large.free(ptr) {
      inner.refund(rounded);
      return;
    }

    debug_assert!(false, "free_bytes: {ptr:p} was not allocated by this context");
  }

  fn free_small_cached(&self, ptr: *mut u8, header: *mut CellHeader, bin: usize) {
    let inner = &self.inner;
    unsafe { cell::poison(ptr, SIZE_CLASSES[bin]) };
    let pushed = tls::with_caches(inner, |caches| {
      let cache = &mut caches[bin];
      if cache.is_full() {
        inner.flush_cache(bin, cache);
      }
      cache.push(ptr);
    });
    if pushed.is_none() {
      inner.free_small_slow(ptr, header);
    }
  }

  // ===========================================================================
  // Realloc
  // ===========================================================================

  /// Resizes an allocation, preserving `min(old, new)` bytes. A null `ptr`
  /// acts as `alloc_bytes`; `new_size == 0` acts as `free_bytes` and
  /// returns null. On failure the original allocation is untouched.
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation of this context. On success
  /// the old pointer must not be used again.
  pub unsafe fn realloc_bytes(&self, ptr: *mut u8, new_size: usize, tag: u8) -> *mut u8 {
    if ptr.is_null() {
      return self.alloc_bytes(new_size, tag);
    }
    if new_size == 0 {
      unsafe { self.free_bytes(ptr) };
      return null_mut();
    }
    let inner = &self.inner;

    let old_usable: usize;
    if inner.in_cell_region(ptr) {
      let header = header_of(ptr);
      unsafe { cell::assert_alive(header) };
      let class = unsafe { (*header).size_class };
      if class == FULL_CELL_MARKER {
        old_usable = CELL_PAYLOAD_SIZE;
        // Whole cells stay put while a medium request still fits.
        if new_size <= CELL_PAYLOAD_SIZE && size_class_for(new_size, 8).is_none() {
          return ptr;
        }
      } else {
        let bin = class as usize;
        old_usable = SIZE_CLASSES[bin];
        if size_class_for(new_size, 8) == Some(bin) {
          return ptr;
        }
      }
    } else if let Some(b) = inner.buddy.as_ref().filter(|b| b.contains(ptr)) {
      old_usable = unsafe { b.usable_size(ptr) };
      if matches!(inner.tier_for(new_size, 8), Tier::Buddy) {
        let old_rounded = unsafe { b.rounded_size(ptr) };
        if let Some(new_rounded) = unsafe { b.prospective_block_size(ptr, new_size) } {
          if new_rounded > old_rounded {
            if inner.charge(new_size, new_rounded - old_rounded) {
              if unsafe { b.try_realloc_in_place(ptr, new_size) }.is_some() {
                return ptr;
              }
              inner.refund(new_rounded - old_rounded);
            }
            // Denied or neighbor is live: fall back to the move path.
          } else if let Some((old_r, new_r)) =
            unsafe { b.try_realloc_in_place(ptr, new_size) }
          {
            if old_r > new_r {
              inner.refund(old_r - new_r);
            }
            return ptr;
          }
        }
      }
    } else if let Some(usable) = inner.large.usable_size(ptr) {
      old_usable = usable;
      if matches!(inner.tier_for(new_size, 8), Tier::Large)
        && inner.large.try_resize_in_place(ptr, new_size)
      {
        return ptr;
      }
    } else {
      debug_assert!(false, "realloc_bytes: {ptr:p} was not allocated by this context");
      return null_mut();
    }

    // Cross-tier (or failed in-place) path: allocate, copy the overlap,
    // free the old block. Never copy more than the old allocation held.
    let new_ptr = self.alloc_bytes(new_size, tag);
    if new_ptr.is_null() {
      return null_mut();
    }
    unsafe {
      core::ptr::copy_nonoverlapping(ptr, new_ptr, old_usable.min(new_size));
      self.free_bytes(ptr);
    }
    new_ptr
  }

  // ===========================================================================
  // Forced tiers and batch operations
  // ===========================================================================

  /// Allocates directly from the large tier regardless of size.
  pub fn alloc_large(&self, size: usize, tag: u8) -> *mut u8 {
    if size == 0 {
      return null_mut();
    }
    let inner = &self.inner;
    let Some(rounded) = inner.large.rounded_map_size(size, 8) else {
      return null_mut();
    };
    if !inner.charge(size, rounded) {
      return null_mut();
    }
    let ptr = inner.large.alloc(size, 8, tag);
    if ptr.is_null() {
      inner.refund(rounded);
    }
    ptr
  }

  /// Frees a pointer obtained from [`alloc_large`](Self::alloc_large).
  ///
  /// # Safety
  /// `ptr` must be null or a live large allocation of this context.
  pub unsafe fn free_large(&self, ptr: *mut u8) {
    if ptr.is_null() {
      return;
    }
    match self.inner.large.free(ptr) {
      Some(rounded) => self.inner.refund(rounded),
      None => debug_assert!(false, "free_large: {ptr:p} is not a large allocation"),
    }
  }

  /// Allocates a whole cell and returns a pointer to its payload
  /// ([`CELL_PAYLOAD_SIZE`] usable bytes). The cell header stays intact so
  /// [`free_bytes`](Self::free_bytes) can classify the pointer.
  pub fn alloc_cell(&self, tag: u8) -> *mut u8 {
    let inner = &self.inner;
    if !inner.charge(CELL_SIZE, CELL_SIZE) {
      return null_mut();
    }
    let raw = inner.cells.alloc();
    if raw.is_null() {
      inner.refund(CELL_SIZE);
      return null_mut();
    }
    let header = raw as *mut CellHeader;
    unsafe {
      (*header).tag = tag;
      (*header).size_class = FULL_CELL_MARKER;
      (*header).free_count = 0;
      cell::mark_alive(header);
      raw.add(BLOCK_START_OFFSET)
    }
  }

  /// Returns a whole cell.
  ///
  /// # Safety
  /// `ptr` must be null or a pointer from [`alloc_cell`](Self::alloc_cell).
  pub unsafe fn free_cell(&self, ptr: *mut u8) {
    unsafe { self.free_bytes(ptr) };
  }

  /// Fills `out` with allocations of `size` bytes, amortizing lock
  /// acquisitions for slab sizes. Returns how many slots were filled.
  pub fn alloc_batch(&self, size: usize, tag: u8, out: &mut [*mut u8]) -> usize {
    let want = out.len();
    if want == 0 || size == 0 {
      return 0;
    }
    let inner = &self.inner;

    let Some(bin) = size_class_for(size, 8) else {
      // Not a slab size: no batching to be had.
      let mut filled = 0;
      for slot in out.iter_mut() {
        let ptr = self.alloc_bytes(size, tag);
        if ptr.is_null() {
          break;
        }
        *slot = ptr;
        filled += 1;
      }
      return filled;
    };

    let rounded = SIZE_CLASSES[bin];
    if !inner.charge(size, rounded * want) {
      return 0;
    }

    let mut filled = {
      let mut state = inner.bins[bin].lock();
      unsafe { slab::pop_batch(&mut state, bin, out) }
    };
    while filled < want {
      let raw = inner.cells.alloc();
      if raw.is_null() {
        break;
      }
      let header = unsafe { slab::init_cell_for_bin(raw, bin, tag) };
      let mut state = inner.bins[bin].lock();
      out[filled] = unsafe { slab::adopt_fresh_cell(&mut state, header) };
      filled += 1;
      filled += unsafe { slab::pop_batch(&mut state, bin, &mut out[filled..want]) };
    }

    if filled < want {
      inner.refund(rounded * (want - filled));
    }
    filled
  }

  /// Frees a batch of same-class sub-cell allocations under one bin lock.
  ///
  /// # Safety
  /// Every pointer must be a live sub-cell allocation of this context, and
  /// all of them must share one size class. Mixing classes is undefined
  /// behavior (diagnosed in debug builds). Pointers must not be used
  /// afterwards.
  pub unsafe fn free_batch(&self, ptrs: &[*mut u8]) {
    if ptrs.is_empty() {
      return;
    }
    let inner = &self.inner;

    let first = ptrs[0];
    debug_assert!(inner.in_cell_region(first), "free_batch takes sub-cell pointers");
    let bin = unsafe { (*header_of(first)).size_class } as usize;
    debug_assert!(bin < NUM_SIZE_BINS, "free_batch takes sub-cell pointers");

    #[cfg(debug_assertions)]
    for &ptr in ptrs {
      let header = header_of(ptr);
      unsafe { cell::assert_alive(header) };
      debug_assert!(
        inner.in_cell_region(ptr) && unsafe { (*header).size_class } as usize == bin,
        "free_batch: heterogeneous size classes",
      );
    }

    let mut released = Vec::new();
    {
      let mut state = inner.bins[bin].lock();
      unsafe { slab::push_batch(&mut state, ptrs, &mut released) };
    }
    for cell_ptr in released {
      unsafe { inner.cells.free(cell_ptr as *mut u8) };
    }
    inner.refund(SIZE_CLASSES[bin] * ptrs.len());
  }

  // ===========================================================================
  // Introspection and maintenance
  // ===========================================================================

  /// Bytes usable through `ptr` (the tier's rounded capacity).
  ///
  /// # Safety
  /// `ptr` must be null or a live allocation of this context.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    if ptr.is_null() {
      return 0;
    }
    let inner = &self.inner;
    if inner.in_cell_region(ptr) {
      let class = unsafe { (*header_of(ptr)).size_class };
      return if class == FULL_CELL_MARKER {
        CELL_PAYLOAD_SIZE
      } else {
        SIZE_CLASSES[class as usize]
      };
    }
    if let Some(b) = inner.buddy.as_ref()
      && b.contains(ptr)
    {
      return unsafe { b.usable_size(ptr) };
    }
    inner.large.usable_size(ptr).unwrap_or(0)
  }

  /// Releases warm-reserve cells from every bin and drains the calling
  /// thread's bin caches. After freeing every allocation, a trim brings
  /// [`ContextStats::live_cells`] to zero.
  pub fn trim(&self) {
    let inner = &self.inner;
    let _ = tls::with_caches(inner, |caches| inner.drain_thread_caches(caches));
    for bin in 0..NUM_SIZE_BINS {
      let mut released = Vec::new();
      {
        let mut state = inner.bins[bin].lock();
        unsafe { slab::drain_warm_cells(&mut state, bin, &mut released) };
      }
      for cell_ptr in released {
        unsafe { inner.cells.free(cell_ptr as *mut u8) };
      }
    }
  }

  /// Outstanding resource counts.
  pub fn stats(&self) -> ContextStats {
    ContextStats {
      live_cells: self.inner.cells.outstanding(),
      live_buddy_blocks: self.inner.buddy.as_ref().map_or(0, BuddyAllocator::live_blocks),
      live_large: self.inner.large.live_count(),
    }
  }
}

#[cfg(feature = "budget")]
impl Context {
  /// Changes the budget limit; 0 disables enforcement. Lowering it below
  /// current usage blocks further allocation until frees catch up.
  pub fn set_budget(&self, bytes: usize) {
    self.inner.budget.set_limit(bytes);
  }

  pub fn get_budget(&self) -> usize {
    self.inner.budget.limit()
  }

  /// Currently charged bytes (rounded tier sizes).
  pub fn get_budget_current(&self) -> usize {
    self.inner.budget.current()
  }

  pub fn set_budget_callback(&self, callback: Option<BudgetCallback>) {
    self.inner.budget.set_callback(callback);
  }
}

impl ContextInner {
  pub(crate) fn id(&self) -> u64 {
    self.id
  }

  #[inline]
  fn in_cell_region(&self, ptr: *mut u8) -> bool {
    let addr = ptr as usize;
    addr >= self.base as usize && addr < self.cell_region_end as usize
  }

  fn tier_for(&self, size: usize, align: usize) -> Tier {
    if let Some(bin) = size_class_for(size, align) {
      return Tier::Sub(bin);
    }
    if let Some(b) = &self.buddy
      && b.rounded_block_size(size, align).is_some()
    {
      return Tier::Buddy;
    }
    Tier::Large
  }

  fn alloc_small_slow(&self, bin: usize, tag: u8) -> *mut u8 {
    {
      let mut state = self.bins[bin].lock();
      let ptr = unsafe { slab::try_alloc_from_partial(&mut state, bin) };
      if !ptr.is_null() {
        return ptr;
      }
    }

    // No partial cells: dedicate a fresh one. The cell is private until it
    // is linked under the lock below.
    let raw = self.cells.alloc();
    if raw.is_null() {
      return null_mut();
    }
    let header = unsafe { slab::init_cell_for_bin(raw, bin, tag) };
    let mut state = self.bins[bin].lock();
    unsafe { slab::adopt_fresh_cell(&mut state, header) }
  }

  fn free_small_slow(&self, ptr: *mut u8, header: *mut CellHeader) {
    let bin = unsafe { (*header).size_class } as usize;
    let released = {
      let mut state = self.bins[bin].lock();
      unsafe { slab::free_to_bin(&mut state, ptr, header) }
    };
    if let Some(cell_ptr) = released {
      unsafe { self.cells.free(cell_ptr as *mut u8) };
    }
  }

  pub(crate) fn refill_cache(&self, bin: usize, cache: &mut BinCache) {
    let mut batch = [null_mut(); TLS_REFILL_BATCH];
    let filled = {
      let mut state = self.bins[bin].lock();
      unsafe { slab::pop_batch(&mut state, bin, &mut batch) }
    };
    for &ptr in &batch[..filled] {
      cache.push(ptr);
    }
  }

  pub(crate) fn flush_cache(&self, bin: usize, cache: &mut BinCache) {
    let mut released = Vec::new();
    {
      let mut state = self.bins[bin].lock();
      let blocks = cache.take_top(TLS_FLUSH_BATCH);
      unsafe { slab::push_batch(&mut state, blocks, &mut released) };
    }
    for cell_ptr in released {
      unsafe { self.cells.free(cell_ptr as *mut u8) };
    }
  }

  pub(crate) fn drain_thread_caches(&self, caches: &mut [BinCache; TLS_BIN_COUNT]) {
    for (bin, cache) in caches.iter_mut().enumerate() {
      if cache.len == 0 {
        continue;
      }
      let mut released = Vec::new();
      {
        let mut state = self.bins[bin].lock();
        let count = cache.len;
        let blocks = cache.take_top(count);
        unsafe { slab::push_batch(&mut state, blocks, &mut released) };
      }
      for cell_ptr in released {
        unsafe { self.cells.free(cell_ptr as *mut u8) };
      }
    }
  }

  unsafe fn free_whole_cell(&self, header: *mut CellHeader) {
    unsafe {
      cell::mark_freed(header);
      self.cells.free(header as *mut u8);
    }
  }

  #[cfg(feature = "budget")]
  #[inline]
  fn charge(&self, requested: usize, rounded: usize) -> bool {
    self.budget.charge(requested, rounded)
  }

  #[cfg(not(feature = "budget"))]
  #[inline]
  fn charge(&self, _requested: usize, _rounded: usize) -> bool {
    true
  }

  #[cfg(feature = "budget")]
  #[inline]
  fn refund(&self, rounded: usize) {
    self.budget.refund(rounded);
  }

  #[cfg(not(feature = "budget"))]
  #[inline]
  fn refund(&self, _rounded: usize) {}
}

impl Drop for ContextInner {
  fn drop(&mut self) {
    self.large.release_all();
    debug!("context {}: releasing reservation at {:p}", self.id, self.raw_base);
    unsafe { os::release(self.raw_base, self.raw_size) };
  }
}
