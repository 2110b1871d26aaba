//! Large registry: direct OS mappings above the buddy ceiling.
//!
//! Each live large pointer maps to its mapping record. Mappings live
//! outside the context reservation, so the router's address classifier can
//! treat "not in any region" as "look it up here". `mmap`/`munmap` always
//! run outside the registry lock.

use core::ptr::null_mut;
use std::collections::HashMap;

use log::trace;
use parking_lot::Mutex;

use crate::config::{PAGE_SIZE, align_up};
use crate::os;

#[derive(Clone, Copy)]
struct LargeAlloc {
  map_base: usize,
  map_size: usize,
  tag: u8,
}

pub struct LargeRegistry {
  map: Mutex<HashMap<usize, LargeAlloc>>,
}

impl LargeRegistry {
  pub fn new() -> Self {
    Self { map: Mutex::new(HashMap::new()) }
  }

  /// Bytes a request would occupy. Deterministic, so callers can charge
  /// budgets before mapping.
  pub fn rounded_map_size(&self, size: usize, align: usize) -> Option<usize> {
    if align <= PAGE_SIZE {
      size.checked_add(PAGE_SIZE - 1).map(align_down_page)
    } else {
      size.checked_add(align).map(|s| align_up(s, PAGE_SIZE))
    }
  }

  /// Maps `size` bytes with at least the requested alignment. Mappings are
  /// page-aligned; larger alignments over-allocate and adjust.
  pub fn alloc(&self, size: usize, align: usize, tag: u8) -> *mut u8 {
    let Some(map_size) = self.rounded_map_size(size, align) else {
      return null_mut();
    };

    let base = os::map_committed(map_size);
    if base.is_null() {
      return null_mut();
    }

    let user = if align <= PAGE_SIZE {
      base
    } else {
      align_up(base as usize, align) as *mut u8
    };
    debug_assert!(user as usize + size <= base as usize + map_size);

    let record = LargeAlloc { map_base: base as usize, map_size, tag };
    self.map.lock().insert(user as usize, record);
    trace!("large map: {map_size} bytes, user {user:p}");
    user
  }

  /// Releases a large allocation; returns the mapped size, or `None` when
  /// the pointer is unknown.
  pub fn free(&self, user: *mut u8) -> Option<usize> {
    let record = self.map.lock().remove(&(user as usize))?;
    unsafe { os::unmap(record.map_base as *mut u8, record.map_size) };
    trace!("large unmap: {} bytes, user {user:p}", record.map_size);
    Some(record.map_size)
  }

  /// Whether `user` can absorb a resize to `new_size` without remapping:
  /// the page-rounded size is unchanged and the pointer is unadjusted.
  pub fn try_resize_in_place(&self, user: *mut u8, new_size: usize) -> bool {
    let map = self.map.lock();
    let Some(record) = map.get(&(user as usize)) else {
      return false;
    };
    user as usize == record.map_base
      && self.rounded_map_size(new_size, 8) == Some(record.map_size)
  }

  /// Bytes usable through `user`, or `None` when the pointer is unknown.
  pub fn usable_size(&self, user: *mut u8) -> Option<usize> {
    let map = self.map.lock();
    let record = map.get(&(user as usize))?;
    Some(record.map_base + record.map_size - user as usize)
  }

  /// Tag recorded for `user`.
  pub fn tag(&self, user: *mut u8) -> Option<u8> {
    self.map.lock().get(&(user as usize)).map(|r| r.tag)
  }

  /// Whether `user` is a live large allocation.
  pub fn contains(&self, user: *mut u8) -> bool {
    self.map.lock().contains_key(&(user as usize))
  }

  /// Live large allocations.
  pub fn live_count(&self) -> usize {
    self.map.lock().len()
  }

  /// Unmaps every outstanding mapping. Called at context teardown.
  pub fn release_all(&self) {
    let drained: Vec<LargeAlloc> = self.map.lock().drain().map(|(_, r)| r).collect();
    for record in drained {
      unsafe { os::unmap(record.map_base as *mut u8, record.map_size) };
    }
  }
}

#[inline(always)]
fn align_down_page(x: usize) -> usize {
  x & !(PAGE_SIZE - 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rounding_is_page_granular() {
    let reg = LargeRegistry::new();
    assert_eq!(reg.rounded_map_size(1, 8), Some(PAGE_SIZE));
    assert_eq!(reg.rounded_map_size(PAGE_SIZE, 8), Some(PAGE_SIZE));
    assert_eq!(reg.rounded_map_size(PAGE_SIZE + 1, 8), Some(2 * PAGE_SIZE));
    assert_eq!(
      reg.rounded_map_size(PAGE_SIZE, 2 * PAGE_SIZE),
      Some(3 * PAGE_SIZE)
    );
  }

  #[test]
  fn map_free_round_trip() {
    let reg = LargeRegistry::new();
    let p = reg.alloc(3 * 1024 * 1024, 8, 5);
    assert!(!p.is_null());
    assert!(reg.contains(p));
    assert_eq!(reg.tag(p), Some(5));
    assert!(reg.usable_size(p).unwrap() >= 3 * 1024 * 1024);
    assert_eq!(reg.live_count(), 1);

    unsafe { core::ptr::write_bytes(p, 0xCC, 3 * 1024 * 1024) };

    assert_eq!(reg.free(p), Some(align_up(3 * 1024 * 1024, PAGE_SIZE)));
    assert_eq!(reg.live_count(), 0);
    assert_eq!(reg.free(p), None);
  }

  #[test]
  fn oversized_alignment_adjusts_the_user_pointer() {
    let reg = LargeRegistry::new();
    let align = 64 * PAGE_SIZE;
    let p = reg.alloc(PAGE_SIZE, align, 0);
    assert!(!p.is_null());
    assert_eq!(p as usize % align, 0);
    assert!(reg.free(p).is_some());
  }
}
