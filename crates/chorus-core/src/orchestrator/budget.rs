//! Cost budget tracking for one orchestration run.
//!
//! `CostBudget` counts spent and reserved cost in integer micro-units so
//! concurrent agents in a parallel stage can check and reserve without a
//! lock. A call reserves its estimated cost before it starts and settles
//! the real cost when it finishes. The 80% warning fires exactly once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const MICROS_PER_UNIT: f64 = 1_000_000.0;

fn to_micros(cost: f64) -> u64 {
    if cost.is_finite() && cost > 0.0 {
        (cost * MICROS_PER_UNIT).round() as u64
    } else {
        0
    }
}

fn from_micros(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_UNIT
}

/// Status returned after settling a call's cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetStatus {
    /// Under the warning threshold (< 80%).
    Ok,
    /// Just crossed the 80% threshold. Returned exactly once per budget.
    Warning,
    /// At or over 100% of the budget.
    Exhausted,
}

/// The projected cost of the next call would exceed the budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BudgetExceeded {
    pub projected: f64,
    pub limit: f64,
}

/// Cost held for an in-flight call. Settle or release it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Reservation {
    micros: u64,
}

/// Atomic cost budget shared by every agent call in a run.
#[derive(Debug, Clone)]
pub struct CostBudget {
    limit: u64,
    spent: Arc<AtomicU64>,
    reserved: Arc<AtomicU64>,
    completed_calls: Arc<AtomicU64>,
    warning_emitted: Arc<AtomicBool>,
}

impl CostBudget {
    pub fn new(limit: f64) -> Self {
        Self {
            limit: to_micros(limit),
            spent: Arc::new(AtomicU64::new(0)),
            reserved: Arc::new(AtomicU64::new(0)),
            completed_calls: Arc::new(AtomicU64::new(0)),
            warning_emitted: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn limit(&self) -> f64 {
        from_micros(self.limit)
    }

    pub fn spent(&self) -> f64 {
        from_micros(self.spent.load(Ordering::SeqCst))
    }

    /// Unspent fraction of the budget in `[0, 1]`.
    pub fn remaining_fraction(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        let spent = self.spent.load(Ordering::SeqCst).min(self.limit);
        (self.limit - spent) as f64 / self.limit as f64
    }

    /// Mean cost of the calls settled so far.
    pub fn mean_call_cost(&self) -> Option<f64> {
        let calls = self.completed_calls.load(Ordering::SeqCst);
        (calls > 0).then(|| self.spent() / calls as f64)
    }

    /// Estimate for the next call: the larger of `worst_case` and the mean
    /// settled cost. `worst_case` is the prompt cost plus a full reply of
    /// `max_tokens`, so parallel calls that start before anything settles
    /// still hold enough to cover themselves.
    pub fn next_call_estimate(&self, worst_case: f64) -> f64 {
        self.mean_call_cost()
            .map_or(worst_case, |mean| mean.max(worst_case))
    }

    /// Reserve `estimate` if `spent + reserved + estimate` stays within the limit.
    pub fn try_reserve(&self, estimate: f64) -> Result<Reservation, BudgetExceeded> {
        let micros = to_micros(estimate);
        let mut reserved = self.reserved.load(Ordering::SeqCst);
        loop {
            let projected = self
                .spent
                .load(Ordering::SeqCst)
                .saturating_add(reserved)
                .saturating_add(micros);
            if projected > self.limit {
                return Err(BudgetExceeded {
                    projected: from_micros(projected),
                    limit: self.limit(),
                });
            }
            match self.reserved.compare_exchange(
                reserved,
                reserved + micros,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(Reservation { micros }),
                Err(current) => reserved = current,
            }
        }
    }

    /// Charge `actual` for a finished call and drop its reservation.
    pub fn settle(&self, reservation: Reservation, actual: f64) -> BudgetStatus {
        let micros = to_micros(actual);
        // Add before releasing so a concurrent check never undercounts.
        let prev = self.spent.fetch_add(micros, Ordering::SeqCst);
        self.reserved.fetch_sub(reservation.micros, Ordering::SeqCst);
        self.completed_calls.fetch_add(1, Ordering::SeqCst);

        let new_total = prev.saturating_add(micros);
        if self.limit > 0 && new_total >= self.limit {
            return BudgetStatus::Exhausted;
        }

        let threshold = self.limit / 100 * 80;
        if prev < threshold
            && new_total >= threshold
            && self
                .warning_emitted
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return BudgetStatus::Warning;
        }
        BudgetStatus::Ok
    }

    /// Drop a reservation without charging (the call failed or never ran).
    pub fn release(&self, reservation: Reservation) {
        self.reserved.fetch_sub(reservation.micros, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_calls_of_fifty_stop_after_two() {
        let budget = CostBudget::new(100.0);

        let first = budget.try_reserve(budget.next_call_estimate(0.0)).unwrap();
        assert_eq!(budget.settle(first, 50.0), BudgetStatus::Ok);

        let second = budget.try_reserve(budget.next_call_estimate(0.0)).unwrap();
        assert_eq!(budget.settle(second, 50.0), BudgetStatus::Exhausted);

        let third = budget.try_reserve(budget.next_call_estimate(0.0));
        assert!(third.is_err());
        assert!(budget.spent() <= 100.0);
    }

    #[test]
    fn reservations_count_against_the_limit() {
        let budget = CostBudget::new(1.0);
        let a = budget.try_reserve(0.6).unwrap();
        assert!(budget.try_reserve(0.6).is_err());
        budget.release(a);
        assert!(budget.try_reserve(0.6).is_ok());
    }

    #[test]
    fn warning_fires_once() {
        let budget = CostBudget::new(10.0);
        let r = budget.try_reserve(0.0).unwrap();
        assert_eq!(budget.settle(r, 7.0), BudgetStatus::Ok);
        let r = budget.try_reserve(0.0).unwrap();
        assert_eq!(budget.settle(r, 1.0), BudgetStatus::Warning);
        let r = budget.try_reserve(0.0).unwrap();
        assert_eq!(budget.settle(r, 1.0), BudgetStatus::Ok);
    }

    #[test]
    fn mean_and_remaining_fraction() {
        let budget = CostBudget::new(4.0);
        assert_eq!(budget.mean_call_cost(), None);
        assert_eq!(budget.next_call_estimate(0.25), 0.25);
        let r = budget.try_reserve(0.0).unwrap();
        let _ = budget.settle(r, 1.0);
        let r = budget.try_reserve(0.0).unwrap();
        let _ = budget.settle(r, 2.0);
        assert_eq!(budget.mean_call_cost(), Some(1.5));
        assert_eq!(budget.next_call_estimate(0.25), 1.5);
        assert_eq!(budget.next_call_estimate(3.0), 3.0);
        assert!((budget.remaining_fraction() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn worst_case_reservations_block_unsettled_parallel_calls() {
        let budget = CostBudget::new(100.0);
        let a = budget.try_reserve(budget.next_call_estimate(50.0)).unwrap();
        let b = budget.try_reserve(budget.next_call_estimate(50.0)).unwrap();
        assert!(budget.try_reserve(budget.next_call_estimate(50.0)).is_err());
        let _ = budget.settle(a, 50.0);
        let _ = budget.settle(b, 50.0);
        assert!(budget.spent() <= 100.0);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_overcommit() {
        let budget = CostBudget::new(10.0);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let b = budget.clone();
            handles.push(tokio::spawn(async move { b.try_reserve(1.0).is_ok() }));
        }
        let mut granted = 0;
        for h in handles {
            if h.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 10);
    }
}
