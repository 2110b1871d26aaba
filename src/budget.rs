//! Budget accountant.
//!
//! A monotonic counter of charged bytes with a runtime-adjustable limit.
//! Charges and refunds always use the rounded size a tier actually
//! occupies, so the counter returns to zero after balanced lifetimes.
//! Admission is a compare-and-swap; no lock is held on the hot path.

use core::sync::atomic::{AtomicUsize, Ordering};

use log::warn;
use parking_lot::Mutex;

/// Invoked with `(requested, budget, current)` when a request is denied.
pub type BudgetCallback = fn(requested: usize, budget: usize, current: usize);

pub struct Budget {
  /// 0 means unlimited.
  limit: AtomicUsize,
  current: AtomicUsize,
  callback: Mutex<Option<BudgetCallback>>,
}

impl Budget {
  pub fn new(limit: usize, callback: Option<BudgetCallback>) -> Self {
    Self {
      limit: AtomicUsize::new(limit),
      current: AtomicUsize::new(0),
      callback: Mutex::new(callback),
    }
  }

  /// Admits and charges `rounded` bytes. On denial the callback fires with
  /// the caller's requested size and a consistent `current <= budget`
  /// snapshot, and nothing is charged.
  pub fn charge(&self, requested: usize, rounded: usize) -> bool {
    loop {
      let current = self.current.load(Ordering::Relaxed);
      let limit = self.limit.load(Ordering::Relaxed);
      if limit != 0 && current.saturating_add(rounded) > limit {
        warn!("budget denied: requested {requested}, rounded {rounded}, {current}/{limit} used");
        let callback = *self.callback.lock();
        if let Some(callback) = callback {
          callback(requested, limit, current);
        }
        return false;
      }
      if self
        .current
        .compare_exchange_weak(current, current + rounded, Ordering::Relaxed, Ordering::Relaxed)
        .is_ok()
      {
        return true;
      }
    }
  }

  /// Refunds a previously charged rounded size.
  pub fn refund(&self, rounded: usize) {
    let previous = self.current.fetch_sub(rounded, Ordering::Relaxed);
    debug_assert!(previous >= rounded, "budget refund underflow: {previous} - {rounded}");
  }

  /// Changes the limit. Lowering it below current usage is permitted and
  /// simply blocks further allocation until frees catch up.
  pub fn set_limit(&self, limit: usize) {
    self.limit.store(limit, Ordering::Relaxed);
  }

  pub fn limit(&self) -> usize {
    self.limit.load(Ordering::Relaxed)
  }

  pub fn current(&self) -> usize {
    self.current.load(Ordering::Relaxed)
  }

  pub fn set_callback(&self, callback: Option<BudgetCallback>) {
    *self.callback.lock() = callback;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize as TestCounter, Ordering as TestOrdering};

  #[test]
  fn charges_and_refunds_balance() {
    let budget = Budget::new(1024, None);
    assert!(budget.charge(500, 512));
    assert!(budget.charge(500, 512));
    assert!(!budget.charge(100, 128));
    budget.refund(512);
    assert!(budget.charge(100, 128));
    budget.refund(512);
    budget.refund(128);
    assert_eq!(budget.current(), 0);
  }

  #[test]
  fn zero_limit_is_unlimited() {
    let budget = Budget::new(0, None);
    for _ in 0..100 {
      assert!(budget.charge(1 << 20, 1 << 20));
    }
  }

  static DENIALS: TestCounter = TestCounter::new(0);

  fn count_denial(_requested: usize, _budget: usize, _current: usize) {
    DENIALS.fetch_add(1, TestOrdering::Relaxed);
  }

  #[test]
  fn callback_fires_on_denial_only() {
    let budget = Budget::new(100, Some(count_denial));
    DENIALS.store(0, TestOrdering::Relaxed);
    assert!(budget.charge(64, 64));
    assert_eq!(DENIALS.load(TestOrdering::Relaxed), 0);
    assert!(!budget.charge(64, 64));
    assert_eq!(DENIALS.load(TestOrdering::Relaxed), 1);
  }

  #[test]
  fn lowering_below_usage_blocks_until_frees() {
    let budget = Budget::new(1024, None);
    assert!(budget.charge(512, 512));
    budget.set_limit(256);
    assert!(!budget.charge(16, 16));
    budget.refund(512);
    assert!(budget.charge(16, 16));
  }
}
