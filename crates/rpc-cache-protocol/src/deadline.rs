//! Request deadlines.
//!
//! A deadline is fixed when a request arrives; forwarded and replicated
//! sub-requests carry the remaining budget in milliseconds so the receiving
//! node inherits whatever time is left.

use std::time::Duration;
use tokio::time::Instant;

/// Point in time by which a request must complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// Deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Deadline from a propagated millisecond budget.
    pub fn from_budget_ms(budget_ms: u64) -> Self {
        Self::after(Duration::from_millis(budget_ms))
    }

    /// Deadline from an optional caller budget, capped by the server default.
    pub fn from_request(timeout_ms: Option<u64>, default: Duration) -> Self {
        match timeout_ms {
            Some(ms) => Self::after(Duration::from_millis(ms).min(default)),
            None => Self::after(default),
        }
    }

    /// Time left, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Remaining budget for propagation to a peer.
    pub fn budget_ms(&self) -> u64 {
        self.remaining().as_millis().min(u64::MAX as u128) as u64
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    /// The earlier of this deadline and `now + cap`.
    pub fn capped(&self, cap: Duration) -> Self {
        let capped = Instant::now() + cap;
        Self {
            at: self.at.min(capped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_remaining_counts_down() {
        let deadline = Deadline::after(Duration::from_secs(2));
        assert_eq!(deadline.budget_ms(), 2000);
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert_eq!(deadline.budget_ms(), 500);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(deadline.is_expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_budget_capped_by_default() {
        let deadline = Deadline::from_request(Some(60_000), Duration::from_secs(5));
        assert_eq!(deadline.budget_ms(), 5000);
        let deadline = Deadline::from_request(None, Duration::from_secs(5));
        assert_eq!(deadline.budget_ms(), 5000);
        let deadline = Deadline::from_request(Some(100), Duration::from_secs(5));
        assert_eq!(deadline.budget_ms(), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capped_takes_earlier() {
        let deadline = Deadline::after(Duration::from_secs(10));
        assert_eq!(deadline.capped(Duration::from_secs(1)).budget_ms(), 1000);
        assert_eq!(deadline.capped(Duration::from_secs(60)).budget_ms(), 10_000);
    }
}
