use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Version of the ticket relation layout.
///
/// Backends record it in [`TicketStore::ensure_schema`] and reprovision
/// when the stored marker differs.
pub const SCHEMA_VERSION: &str = "0.0.2";

/// One claim on a named semaphore.
///
/// The `(name, index)` pair is unique within a store. `expiration_time` is a
/// unix timestamp in seconds and never changes after the row is inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub name: String,
    pub index: u64,
    pub expiration_time: i64,
}

impl Ticket {
    pub fn new(name: impl Into<String>, index: u64, expiration_time: i64) -> Self {
        Self {
            name: name.into(),
            index,
            expiration_time,
        }
    }

    /// A ticket still counts against later tickets while `now <= expiration_time`.
    pub fn is_live_at(&self, now: i64) -> bool {
        self.expiration_time >= now
    }
}

/// Shared persistent relation of tickets keyed by `(name, index)`.
///
/// Every method is a single atomic statement against the backing store.
/// No operation spans multiple rows transactionally, and implementations must
/// be safe to use from independent processes pointing at the same store.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "file").
    fn backend_name(&self) -> &'static str;

    /// Provision the ticket relation. Idempotent across repeated calls.
    async fn ensure_schema(&self) -> Result<(), StoreError>;

    /// Insert a ticket if its `(name, index)` key is absent.
    ///
    /// Fails with [`StoreError::DuplicateKey`] when the key is taken.
    async fn insert_unique(&self, ticket: &Ticket) -> Result<(), StoreError>;

    /// Delete the ticket with the given key. Returns whether a row was removed.
    async fn delete(&self, name: &str, index: u64) -> Result<bool, StoreError>;

    /// Count tickets for `name` with `index < index_less_than` and
    /// `expiration_time >= expiration_at_or_after`.
    async fn count_live_before(
        &self,
        name: &str,
        index_less_than: u64,
        expiration_at_or_after: i64,
    ) -> Result<u64, StoreError>;

    /// Highest index currently present for `name`, if any.
    async fn max_index(&self, name: &str) -> Result<Option<u64>, StoreError>;

    /// All tickets for `name`, ordered by index.
    async fn list(&self, name: &str) -> Result<Vec<Ticket>, StoreError>;

    /// Names that currently have at least one ticket.
    async fn names(&self) -> Result<Vec<String>, StoreError>;

    /// Delete tickets for `name` whose `expiration_time < before`.
    /// Returns the number of rows removed.
    async fn purge_expired(&self, name: &str, before: i64) -> Result<u64, StoreError>;
}
