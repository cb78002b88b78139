//! Decode-error accounting for the readout loop.

use tracing::warn;

/// Counts decode errors against a maximum.
///
/// The budget is exceeded once more than `max` errors were recorded, so
/// `max = 0` stops on the first error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorBudget {
    max: u64,
    count: u64,
}

impl ErrorBudget {
    pub fn new(max: u64) -> Self {
        Self { max, count: 0 }
    }

    /// Record one error and return the running count
    pub fn record_error(&mut self) -> u64 {
        self.count = self.count.saturating_add(1);
        if self.count == self.max.saturating_add(1) {
            warn!("Decode error budget of {} exhausted", self.max);
        }
        self.count
    }

    pub fn exceeded(&self) -> bool {
        self.count > self.max
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    /// Errors still tolerated before the budget is exceeded
    pub fn remaining(&self) -> u64 {
        self.max.saturating_add(1).saturating_sub(self.count)
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_budget_stops_on_first_error() {
        let mut budget = ErrorBudget::new(0);
        assert!(!budget.exceeded());
        assert_eq!(budget.remaining(), 1);
        assert_eq!(budget.record_error(), 1);
        assert!(budget.exceeded());
        assert_eq!(budget.remaining(), 0);
    }

    #[test]
    fn test_budget_counts_monotonically() {
        let mut budget = ErrorBudget::new(2);
        assert_eq!(budget.record_error(), 1);
        assert_eq!(budget.record_error(), 2);
        assert!(!budget.exceeded());
        assert_eq!(budget.record_error(), 3);
        assert!(budget.exceeded());

        budget.reset();
        assert_eq!(budget.count(), 0);
        assert!(!budget.exceeded());
    }
}
