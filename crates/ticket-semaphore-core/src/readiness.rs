use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::lease::LeaseTracker;
use crate::store::{Ticket, TicketStore};

/// Decides whether a claimed ticket currently holds its semaphore.
///
/// A ticket is ready when no ticket of the same name with a smaller index is
/// still live (`expiration_time >= now`). Released tickets are gone from the
/// store and expired ones are ignored, so a crashed holder blocks the queue
/// for at most its validity.
pub struct ReadinessChecker {
    store: Arc<dyn TicketStore>,
    lease: LeaseTracker,
}

impl std::fmt::Debug for ReadinessChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessChecker")
            .field("backend", &self.store.backend_name())
            .finish_non_exhaustive()
    }
}

impl ReadinessChecker {
    pub fn new(store: Arc<dyn TicketStore>, lease: LeaseTracker) -> Self {
        Self { store, lease }
    }

    /// Single readiness check against the store.
    pub async fn is_ready(&self, ticket: &Ticket) -> Result<bool, StoreError> {
        let ahead = self
            .store
            .count_live_before(&ticket.name, ticket.index, self.lease.now())
            .await?;
        Ok(ahead == 0)
    }

    /// Poll until `ticket` is ready, sleeping `refresh_interval` between checks.
    ///
    /// There is no upper bound on the number of polls. Store errors end the
    /// loop and are returned to the caller.
    #[instrument(
        skip(self, ticket),
        level = "debug",
        fields(name = %ticket.name, index = ticket.index)
    )]
    pub async fn wait(
        &self,
        ticket: &Ticket,
        refresh_interval: Duration,
    ) -> Result<(), StoreError> {
        let mut polls: u64 = 0;
        loop {
            polls += 1;
            if self.is_ready(ticket).await? {
                debug!(
                    "Ticket {}#{} ready after {} polls",
                    ticket.name, ticket.index, polls
                );
                return Ok(());
            }
            if polls == 1 {
                debug!(
                    "Ticket {}#{} queued, rechecking every {:?}",
                    ticket.name, ticket.index, refresh_interval
                );
            }
            tokio::time::sleep(refresh_interval).await;
        }
    }
}
