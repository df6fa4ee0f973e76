use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::allocator::TicketAllocator;
use crate::clock::{Clock, SystemClock};
use crate::error::SemaphoreError;
use crate::handle::SemaphoreHandle;
use crate::lease::LeaseTracker;
use crate::options::SemaphoreOptions;
use crate::readiness::ReadinessChecker;
use crate::store::{Ticket, TicketStore};

/// Entry point for acquiring named semaphores over a shared [`TicketStore`].
///
/// Each process builds its own service around a store client; processes never
/// talk to each other, only to the store.
pub struct SemaphoreService {
    store: Arc<dyn TicketStore>,
    lease: LeaseTracker,
    allocator: TicketAllocator,
    readiness: ReadinessChecker,
}

impl std::fmt::Debug for SemaphoreService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SemaphoreService")
            .field("backend", &self.store.backend_name())
            .finish_non_exhaustive()
    }
}

impl SemaphoreService {
    /// Create a service using the system clock.
    pub fn new(store: Arc<dyn TicketStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn TicketStore>, clock: Arc<dyn Clock>) -> Self {
        let lease = LeaseTracker::new(clock);
        Self {
            allocator: TicketAllocator::new(store.clone(), lease.clone()),
            readiness: ReadinessChecker::new(store.clone(), lease.clone()),
            lease,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn TicketStore> {
        &self.store
    }

    /// Provision the store. Safe to call on every process start.
    pub async fn init(&self) -> Result<(), SemaphoreError> {
        self.store.ensure_schema().await?;
        info!("Semaphore store ready (backend: {})", self.store.backend_name());
        Ok(())
    }

    /// Claim a ticket for `name` and block until it is first in line.
    ///
    /// The wait has no timeout of its own. It is bounded by the leases of the
    /// tickets ahead in the queue.
    #[instrument(skip(self), level = "debug")]
    pub async fn wait(
        &self,
        name: &str,
        options: SemaphoreOptions,
    ) -> Result<SemaphoreHandle, SemaphoreError> {
        let ticket = self.allocator.claim(name, options.validity()).await?;

        if let Err(e) = self.readiness.wait(&ticket, options.refresh_interval()).await {
            self.withdraw(&ticket).await;
            return Err(e.into());
        }

        debug!("Acquired semaphore '{}' with ticket {}", name, ticket.index);
        Ok(self.handle(ticket, options))
    }

    /// Like [`wait`](Self::wait), but gives up when `cancel` completes first.
    ///
    /// On cancellation the claimed ticket is withdrawn from the store and
    /// [`SemaphoreError::Cancelled`] is returned.
    #[instrument(skip(self, cancel), level = "debug")]
    pub async fn wait_until<F>(
        &self,
        name: &str,
        options: SemaphoreOptions,
        cancel: F,
    ) -> Result<SemaphoreHandle, SemaphoreError>
    where
        F: Future<Output = ()>,
    {
        let ticket = self.allocator.claim(name, options.validity()).await?;

        tokio::select! {
            ready = self.readiness.wait(&ticket, options.refresh_interval()) => {
                if let Err(e) = ready {
                    self.withdraw(&ticket).await;
                    return Err(e.into());
                }
                debug!("Acquired semaphore '{}' with ticket {}", name, ticket.index);
                Ok(self.handle(ticket, options))
            }
            () = cancel => {
                info!(
                    "Wait on semaphore '{}' cancelled, withdrawing ticket {}",
                    name, ticket.index
                );
                self.withdraw(&ticket).await;
                Err(SemaphoreError::Cancelled {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Tickets currently stored for `name`, in queue order.
    pub async fn tickets(&self, name: &str) -> Result<Vec<Ticket>, SemaphoreError> {
        Ok(self.store.list(name).await?)
    }

    /// Delete expired tickets for `name`, or for every name when `None`.
    ///
    /// Readiness already ignores expired rows, so this only reclaims space.
    /// Nothing calls it implicitly.
    #[instrument(skip(self), level = "debug")]
    pub async fn reap_expired(&self, name: Option<&str>) -> Result<u64, SemaphoreError> {
        let names = match name {
            Some(name) => vec![name.to_string()],
            None => self.store.names().await?,
        };

        let now = self.lease.now();
        let mut purged = 0;
        for name in &names {
            purged += self.store.purge_expired(name, now).await?;
        }
        info!("Reaped {} expired tickets across {} names", purged, names.len());
        Ok(purged)
    }

    fn handle(&self, ticket: Ticket, options: SemaphoreOptions) -> SemaphoreHandle {
        SemaphoreHandle::new(
            ticket,
            options.validity(),
            self.store.clone(),
            self.lease.clone(),
        )
    }

    /// Best-effort removal of a ticket that will never be handed out.
    async fn withdraw(&self, ticket: &Ticket) {
        if let Err(e) = self.store.delete(&ticket.name, ticket.index).await {
            warn!(
                "Failed to withdraw ticket {}#{} ({}); it lapses at {}",
                ticket.name, ticket.index, e, ticket.expiration_time
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::StoreError;
    use crate::memory::MemoryStore;
    use crate::testing::FlakyStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast() -> SemaphoreOptions {
        SemaphoreOptions::default().with_refresh_interval(Duration::from_millis(2))
    }

    fn service_at(store: Arc<dyn TicketStore>, clock: &ManualClock) -> SemaphoreService {
        SemaphoreService::with_clock(store, Arc::new(clock.clone()))
    }

    #[tokio::test]
    async fn test_wait_and_signal() {
        let store = Arc::new(MemoryStore::new());
        let service = SemaphoreService::new(store.clone());
        service.init().await.unwrap();
        assert!(store.is_provisioned());
        assert_eq!(service.store().backend_name(), "memory");

        let handle = service.wait("jobs", fast()).await.unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(handle.validity(), Duration::from_secs(10));
        assert_eq!(service.tickets("jobs").await.unwrap().len(), 1);

        handle.signal().await.unwrap();
        assert!(service.tickets("jobs").await.unwrap().is_empty());

        // Released indices are reused only once the queue is empty again
        let next = service.wait("jobs", fast()).await.unwrap();
        assert_eq!(next.index(), 0);
        next.signal().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_unblocks_next() {
        let clock = ManualClock::new(1_000);
        let store: Arc<dyn TicketStore> = Arc::new(MemoryStore::new());
        let first = service_at(store.clone(), &clock)
            .wait("jobs", fast())
            .await
            .unwrap();
        assert_eq!(first.index(), 0);

        let waiter = {
            let service = service_at(store.clone(), &clock);
            tokio::spawn(async move { service.wait("jobs", fast()).await })
        };

        // Second ticket is queued but not ready while the first is held
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        assert_eq!(store.list("jobs").await.unwrap().len(), 2);

        first.signal().await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("release should unblock the next ticket")
            .unwrap()
            .unwrap();
        assert_eq!(second.index(), 1);
        // No lease time elapsed on the manual clock
        assert_eq!(clock.now(), 1_000);
        second.signal().await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_expiry_unblocks_next_without_delete() {
        let clock = ManualClock::new(1_000);
        let store: Arc<dyn TicketStore> = Arc::new(MemoryStore::new());
        let options = fast().with_validity(Duration::from_secs(1));

        let abandoned = service_at(store.clone(), &clock)
            .wait("jobs", options)
            .await
            .unwrap();

        let waiter = {
            let service = service_at(store.clone(), &clock);
            tokio::spawn(async move { service.wait("jobs", options).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        // Live through its expiration second, stale after
        clock.advance(1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        clock.advance(1);

        let second = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("expired head should stop blocking")
            .unwrap()
            .unwrap();
        assert_eq!(second.index(), 1);

        let indices: Vec<u64> = store
            .list("jobs")
            .await
            .unwrap()
            .iter()
            .map(|t| t.index)
            .collect();
        assert_eq!(indices, vec![0, 1]);

        drop(abandoned);
    }

    #[tokio::test]
    async fn test_expired_release_rejected() {
        let store = Arc::new(MemoryStore::new());
        let service = SemaphoreService::new(store.clone());
        let handle = service
            .wait("jobs", fast().with_validity(Duration::from_secs(1)))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        let err = handle.signal().await.unwrap_err();
        assert!(matches!(err, SemaphoreError::Expired { .. }));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_collision_retry_then_success() {
        let store = Arc::new(FlakyStore::with_collisions(9));
        let service = SemaphoreService::new(store.clone());

        let handle = service.wait("jobs", fast()).await.unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(store.attempts(), 10);
        handle.signal().await.unwrap();
    }

    #[tokio::test]
    async fn test_collision_exhaustion_fails_wait() {
        let store = Arc::new(FlakyStore::with_collisions(10));
        let service = SemaphoreService::new(store.clone());

        let err = service.wait("jobs", fast()).await.unwrap_err();
        assert!(matches!(err, SemaphoreError::Acquisition { attempts: 10, .. }));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_readiness_store_error_propagates_and_withdraws() {
        let store = Arc::new(FlakyStore::default());
        store.fail_counts.store(true, Ordering::SeqCst);
        let service = SemaphoreService::new(store.clone());

        let err = tokio::time::timeout(Duration::from_secs(2), service.wait("jobs", fast()))
            .await
            .expect("store errors must end the wait")
            .unwrap_err();
        assert!(matches!(err, SemaphoreError::Store(StoreError::Io(_))));
        assert!(store.inner.is_empty());
    }

    #[tokio::test]
    async fn test_wait_until_cancel_withdraws_ticket() {
        let store: Arc<dyn TicketStore> = Arc::new(MemoryStore::new());
        let service = SemaphoreService::new(store.clone());
        let holder = service.wait("jobs", fast()).await.unwrap();

        let err = service
            .wait_until(
                "jobs",
                fast(),
                tokio::time::sleep(Duration::from_millis(30)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SemaphoreError::Cancelled { ref name } if name == "jobs"));

        let remaining: Vec<u64> = store
            .list("jobs")
            .await
            .unwrap()
            .iter()
            .map(|t| t.index)
            .collect();
        assert_eq!(remaining, vec![0]);
        holder.signal().await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_until_acquires_when_ready() {
        let store: Arc<dyn TicketStore> = Arc::new(MemoryStore::new());
        let service = SemaphoreService::new(store);

        let handle = service
            .wait_until("jobs", fast(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(handle.index(), 0);
        handle.signal().await.unwrap();
    }

    #[tokio::test]
    async fn test_reap_expired() {
        let clock = ManualClock::new(1_000);
        let store = Arc::new(MemoryStore::new());
        store.insert_unique(&Ticket::new("jobs", 0, 990)).await.unwrap();
        store.insert_unique(&Ticket::new("jobs", 1, 1_000)).await.unwrap();
        store.insert_unique(&Ticket::new("mail", 4, 500)).await.unwrap();
        let service = service_at(store.clone(), &clock);

        assert_eq!(service.reap_expired(Some("jobs")).await.unwrap(), 1);
        assert_eq!(store.len(), 2);
        assert_eq!(service.reap_expired(None).await.unwrap(), 1);
        assert_eq!(store.list("jobs").await.unwrap(), vec![Ticket::new("jobs", 1, 1_000)]);
        assert!(store.list("mail").await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion_across_services() {
        use tokio::sync::Barrier;

        const NUM_TASKS: usize = 6;
        let store: Arc<dyn TicketStore> = Arc::new(MemoryStore::new());
        let barrier = Arc::new(Barrier::new(NUM_TASKS));
        let inside = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..NUM_TASKS)
            .map(|_| {
                // One service per task, as independent processes would have
                let service = SemaphoreService::new(store.clone());
                let barrier = Arc::clone(&barrier);
                let inside = Arc::clone(&inside);
                let completed = Arc::clone(&completed);
                tokio::spawn(async move {
                    barrier.wait().await;
                    let options = SemaphoreOptions::default()
                        .with_validity(Duration::from_secs(30))
                        .with_refresh_interval(Duration::from_millis(1));
                    let handle = loop {
                        match service.wait("shared", options).await {
                            Ok(handle) => break handle,
                            Err(SemaphoreError::Acquisition { .. }) => continue,
                            Err(e) => panic!("unexpected error: {e}"),
                        }
                    };

                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    completed.fetch_add(1, Ordering::SeqCst);

                    handle.signal().await.unwrap();
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.expect("task panicked");
        }
        assert_eq!(completed.load(Ordering::SeqCst), NUM_TASKS);
        assert!(store.list("shared").await.unwrap().is_empty());
    }
}
