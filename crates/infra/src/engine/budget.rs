//! Concurrency budget: the shared ceiling on concurrently active units.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

/// Fixed ceiling on concurrently running units.
///
/// Clones share the same counter, so one budget can be handed to several
/// engines that draw from the same platform pool.
#[derive(Debug, Clone)]
pub struct ConcurrencyBudget {
    ceiling: usize,
    in_use: Arc<AtomicUsize>,
}

/// Point-in-time budget usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BudgetUsage {
    pub in_use: usize,
    pub ceiling: usize,
}

impl ConcurrencyBudget {
    pub fn new(ceiling: usize) -> Self {
        Self {
            ceiling,
            in_use: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn usage(&self) -> BudgetUsage {
        BudgetUsage {
            in_use: self.in_use.load(Ordering::SeqCst),
            ceiling: self.ceiling,
        }
    }

    /// Take one slot, or `None` when the ceiling is reached.
    pub fn try_acquire(&self) -> Option<BudgetPermit> {
        let mut current = self.in_use.load(Ordering::SeqCst);
        loop {
            if current >= self.ceiling {
                return None;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(BudgetPermit {
                        in_use: self.in_use.clone(),
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// One held slot; returned to the budget on drop.
#[derive(Debug)]
pub struct BudgetPermit {
    in_use: Arc<AtomicUsize>,
}

impl Drop for BudgetPermit {
    fn drop(&mut self) {
        self.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permits_are_bounded_and_returned() {
        let budget = ConcurrencyBudget::new(2);
        let a = budget.try_acquire().unwrap();
        let _b = budget.try_acquire().unwrap();
        assert!(budget.try_acquire().is_none());
        assert_eq!(budget.usage(), BudgetUsage { in_use: 2, ceiling: 2 });

        drop(a);
        assert!(budget.try_acquire().is_some());
    }

    #[test]
    fn clones_share_the_ceiling() {
        let budget = ConcurrencyBudget::new(1);
        let other = budget.clone();
        let _held = budget.try_acquire().unwrap();
        assert!(other.try_acquire().is_none());
    }

    #[test]
    fn concurrent_acquisition_never_overshoots() {
        let budget = ConcurrencyBudget::new(3);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let budget = budget.clone();
                std::thread::spawn(move || budget.try_acquire())
            })
            .collect();
        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 3);
    }
}
