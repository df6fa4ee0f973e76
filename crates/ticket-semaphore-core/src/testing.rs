//! Fault-injecting store wrappers shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::memory::MemoryStore;
use crate::store::{Ticket, TicketStore};

/// Wraps a [`MemoryStore`] and injects failures on demand.
#[derive(Debug, Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    /// Number of upcoming inserts to reject as key collisions.
    pub collisions: AtomicU32,
    /// Total inserts attempted.
    pub insert_attempts: AtomicU32,
    /// When set, inserts fail with an I/O error.
    pub fail_inserts: AtomicBool,
    /// When set, readiness counts fail with an I/O error.
    pub fail_counts: AtomicBool,
    /// When set, deletes fail with an I/O error.
    pub fail_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn with_collisions(collisions: u32) -> Self {
        let store = Self::default();
        store.collisions.store(collisions, Ordering::SeqCst);
        store
    }

    pub fn attempts(&self) -> u32 {
        self.insert_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketStore for FlakyStore {
    fn backend_name(&self) -> &'static str {
        "flaky"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.inner.ensure_schema().await
    }

    async fn insert_unique(&self, ticket: &Ticket) -> Result<(), StoreError> {
        self.insert_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("connection reset".to_string()));
        }
        let collided = self
            .collisions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if collided {
            return Err(StoreError::DuplicateKey {
                name: ticket.name.clone(),
                index: ticket.index,
            });
        }
        self.inner.insert_unique(ticket).await
    }

    async fn delete(&self, name: &str, index: u64) -> Result<bool, StoreError> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StoreError::Io("connection reset".to_string()));
        }
        self.inner.delete(name, index).await
    }

    async fn count_live_before(
        &self,
        name: &str,
        index_less_than: u64,
        expiration_at_or_after: i64,
    ) -> Result<u64, StoreError> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(StoreError::Io("connection reset".to_string()));
        }
        self.inner
            .count_live_before(name, index_less_than, expiration_at_or_after)
            .await
    }

    async fn max_index(&self, name: &str) -> Result<Option<u64>, StoreError> {
        self.inner.max_index(name).await
    }

    async fn list(&self, name: &str) -> Result<Vec<Ticket>, StoreError> {
        self.inner.list(name).await
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        self.inner.names().await
    }

    async fn purge_expired(&self, name: &str, before: i64) -> Result<u64, StoreError> {
        self.inner.purge_expired(name, before).await
    }
}
