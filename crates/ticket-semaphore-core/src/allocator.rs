use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::SemaphoreError;
use crate::lease::LeaseTracker;
use crate::store::{Ticket, TicketStore};

/// Maximum number of index collisions tolerated by a single claim.
pub const MAX_CLAIM_ATTEMPTS: u32 = 10;

/// Claims the next free ticket index for a semaphore name.
///
/// The next index is `max(existing) + 1`, or 0 for an empty queue. Two
/// allocators racing for the same index are serialized by the store's unique
/// key: the loser sees [`StoreError::DuplicateKey`](crate::StoreError::DuplicateKey),
/// recomputes, and tries again.
pub struct TicketAllocator {
    store: Arc<dyn TicketStore>,
    lease: LeaseTracker,
    max_attempts: u32,
}

impl std::fmt::Debug for TicketAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketAllocator")
            .field("backend", &self.store.backend_name())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl TicketAllocator {
    pub fn new(store: Arc<dyn TicketStore>, lease: LeaseTracker) -> Self {
        Self {
            store,
            lease,
            max_attempts: MAX_CLAIM_ATTEMPTS,
        }
    }

    /// Next index to try for `name`.
    pub async fn next_index(&self, name: &str) -> Result<u64, SemaphoreError> {
        let max = self.store.max_index(name).await?;
        Ok(max.map_or(0, |index| index.saturating_add(1)))
    }

    /// Insert a new ticket for `name` expiring `validity` from now.
    ///
    /// Only key collisions are retried. Any other store failure is returned
    /// as-is.
    #[instrument(skip(self), level = "debug")]
    pub async fn claim(&self, name: &str, validity: Duration) -> Result<Ticket, SemaphoreError> {
        for attempt in 1..=self.max_attempts {
            let index = self.next_index(name).await?;
            let ticket = Ticket::new(name, index, self.lease.expiration_for(validity));

            match self.store.insert_unique(&ticket).await {
                Ok(()) => {
                    debug!(
                        "Claimed ticket {}#{} on attempt {} (expires at {})",
                        name, index, attempt, ticket.expiration_time
                    );
                    return Ok(ticket);
                }
                Err(e) if e.is_duplicate_key() => {
                    debug!(
                        "Ticket {}#{} taken by a concurrent claim (attempt {}/{})",
                        name, index, attempt, self.max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            "Giving up on semaphore '{}' after {} colliding claims",
            name, self.max_attempts
        );
        Err(SemaphoreError::Acquisition {
            name: name.to_string(),
            attempts: self.max_attempts,
        })
    }
}
