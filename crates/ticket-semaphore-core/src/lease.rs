use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::store::Ticket;

/// Computes and checks ticket leases.
///
/// A lease is fixed when the ticket is inserted: `expiration_time = now +
/// validity`. There is no renewal, so a holder that outlives its validity is
/// treated as abandoned by waiters even while it is still running.
#[derive(Debug, Clone)]
pub struct LeaseTracker {
    clock: Arc<dyn Clock>,
}

impl LeaseTracker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    /// Current unix time in seconds.
    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    /// Expiration timestamp for a ticket claimed now with the given validity.
    /// Sub-second validity is truncated.
    pub fn expiration_for(&self, validity: Duration) -> i64 {
        let secs = i64::try_from(validity.as_secs()).unwrap_or(i64::MAX);
        self.now().saturating_add(secs)
    }

    /// A lease has lapsed once the clock is strictly past its expiration.
    pub fn is_expired(&self, ticket: &Ticket) -> bool {
        self.now() > ticket.expiration_time
    }

    /// Time left on the lease, zero once expired.
    pub fn remaining(&self, ticket: &Ticket) -> Duration {
        let left = ticket.expiration_time.saturating_sub(self.now());
        Duration::from_secs(u64::try_from(left).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn tracker(start: i64) -> (LeaseTracker, ManualClock) {
        let clock = ManualClock::new(start);
        (LeaseTracker::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn test_expiration_is_now_plus_validity() {
        let (lease, _clock) = tracker(1_000);
        assert_eq!(lease.expiration_for(Duration::from_secs(10)), 1_010);
        assert_eq!(lease.expiration_for(Duration::from_millis(1_900)), 1_001);
    }

    #[test]
    fn test_expired_only_strictly_after_expiration() {
        let (lease, clock) = tracker(1_000);
        let ticket = Ticket::new("jobs", 0, lease.expiration_for(Duration::from_secs(1)));

        assert!(!lease.is_expired(&ticket));
        clock.advance(1);
        assert!(!lease.is_expired(&ticket));
        assert_eq!(lease.remaining(&ticket), Duration::ZERO);
        clock.advance(1);
        assert!(lease.is_expired(&ticket));
    }

    #[test]
    fn test_remaining() {
        let (lease, clock) = tracker(500);
        let ticket = Ticket::new("jobs", 3, 510);
        assert_eq!(lease.remaining(&ticket), Duration::from_secs(10));
        clock.advance(20);
        assert_eq!(lease.remaining(&ticket), Duration::ZERO);
    }
}
