use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::StoreError;
use crate::store::{Ticket, TicketStore};

/// In-process ticket store.
///
/// Rows live in a `BTreeMap` keyed by `(name, index)` behind a mutex, so each
/// trait call is atomic with respect to the others. Useful for tasks sharing a
/// single process and as the reference backend in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tickets: Mutex<BTreeMap<(String, u64), i64>>,
    provisioned: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows across all names.
    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    /// Whether [`TicketStore::ensure_schema`] has run.
    pub fn is_provisioned(&self) -> bool {
        self.provisioned.load(Ordering::SeqCst)
    }

    fn table(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, u64), i64>> {
        self.tickets.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn range_for<'a>(
        table: &'a BTreeMap<(String, u64), i64>,
        name: &str,
    ) -> impl Iterator<Item = (u64, i64)> + 'a {
        table
            .range((name.to_string(), 0)..=(name.to_string(), u64::MAX))
            .map(|((_, index), expiration)| (*index, *expiration))
    }
}

#[async_trait]
impl TicketStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        self.provisioned.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn insert_unique(&self, ticket: &Ticket) -> Result<(), StoreError> {
        let mut table = self.table();
        let key = (ticket.name.clone(), ticket.index);
        if table.contains_key(&key) {
            return Err(StoreError::DuplicateKey {
                name: ticket.name.clone(),
                index: ticket.index,
            });
        }
        table.insert(key, ticket.expiration_time);
        debug!("Inserted ticket {}#{}", ticket.name, ticket.index);
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete(&self, name: &str, index: u64) -> Result<bool, StoreError> {
        let removed = self.table().remove(&(name.to_string(), index)).is_some();
        debug!("Deleted ticket {}#{} (existed: {})", name, index, removed);
        Ok(removed)
    }

    async fn count_live_before(
        &self,
        name: &str,
        index_less_than: u64,
        expiration_at_or_after: i64,
    ) -> Result<u64, StoreError> {
        let table = self.table();
        let count = Self::range_for(&table, name)
            .filter(|(index, expiration)| {
                *index < index_less_than && *expiration >= expiration_at_or_after
            })
            .count();
        Ok(count as u64)
    }

    async fn max_index(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let table = self.table();
        Ok(Self::range_for(&table, name).map(|(index, _)| index).last())
    }

    async fn list(&self, name: &str) -> Result<Vec<Ticket>, StoreError> {
        let table = self.table();
        Ok(Self::range_for(&table, name)
            .map(|(index, expiration)| Ticket::new(name, index, expiration))
            .collect())
    }

    async fn names(&self) -> Result<Vec<String>, StoreError> {
        let table = self.table();
        let mut names: Vec<String> = table.keys().map(|(name, _)| name.clone()).collect();
        names.dedup();
        Ok(names)
    }

    #[instrument(skip(self), level = "debug")]
    async fn purge_expired(&self, name: &str, before: i64) -> Result<u64, StoreError> {
        let mut table = self.table();
        let stale: Vec<u64> = Self::range_for(&table, name)
            .filter(|(_, expiration)| *expiration < before)
            .map(|(index, _)| index)
            .collect();
        for index in &stale {
            table.remove(&(name.to_string(), *index));
        }
        debug!("Purged {} expired tickets for {}", stale.len(), name);
        Ok(stale.len() as u64)
    }
}
