use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use crate::error::SemaphoreError;
use crate::lease::LeaseTracker;
use crate::store::{Ticket, TicketStore};

/// Proof of acquisition returned by [`SemaphoreService::wait`](crate::SemaphoreService::wait).
///
/// Call [`signal`](Self::signal) when the critical section is done. Dropping
/// the handle instead leaves its ticket in the store until the lease expires.
pub struct SemaphoreHandle {
    ticket: Ticket,
    validity: Duration,
    store: Arc<dyn TicketStore>,
    lease: LeaseTracker,
    settled: bool,
}

impl std::fmt::Debug for SemaphoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreHandle")
            .field("ticket", &self.ticket)
            .field("validity", &self.validity)
            .finish_non_exhaustive()
    }
}

impl SemaphoreHandle {
    pub(crate) fn new(
        ticket: Ticket,
        validity: Duration,
        store: Arc<dyn TicketStore>,
        lease: LeaseTracker,
    ) -> Self {
        Self {
            ticket,
            validity,
            store,
            lease,
            settled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.ticket.name
    }

    pub fn index(&self) -> u64 {
        self.ticket.index
    }

    pub fn validity(&self) -> Duration {
        self.validity
    }

    pub fn expiration_time(&self) -> i64 {
        self.ticket.expiration_time
    }

    pub fn ticket(&self) -> &Ticket {
        &self.ticket
    }

    /// Lease time left before other waiters stop honoring this ticket.
    pub fn remaining(&self) -> Duration {
        self.lease.remaining(&self.ticket)
    }

    pub fn is_expired(&self) -> bool {
        self.lease.is_expired(&self.ticket)
    }

    /// Release the semaphore so the next ticket in line becomes ready.
    ///
    /// Fails with [`SemaphoreError::Expired`] once the lease has lapsed; the
    /// row is then left in place and the critical section must be assumed to
    /// have run unprotected past its lease.
    #[instrument(
        skip(self),
        level = "debug",
        fields(name = %self.ticket.name, index = self.ticket.index)
    )]
    pub async fn signal(mut self) -> Result<(), SemaphoreError> {
        self.settled = true;

        if self.lease.is_expired(&self.ticket) {
            warn!(
                "Semaphore '{}' ticket {} signaled after its lease expired at {}",
                self.ticket.name, self.ticket.index, self.ticket.expiration_time
            );
            return Err(SemaphoreError::Expired {
                name: self.ticket.name.clone(),
                index: self.ticket.index,
                expiration_time: self.ticket.expiration_time,
            });
        }

        let removed = self
            .store
            .delete(&self.ticket.name, self.ticket.index)
            .await?;
        debug!(
            "Released semaphore '{}' ticket {} (row existed: {})",
            self.ticket.name, self.ticket.index, removed
        );
        Ok(())
    }
}

impl Drop for SemaphoreHandle {
    fn drop(&mut self) {
        if !self.settled {
            warn!(
                "Semaphore '{}' ticket {} dropped without signal; it blocks the queue until {}",
                self.ticket.name, self.ticket.index, self.ticket.expiration_time
            );
        }
    }
}
