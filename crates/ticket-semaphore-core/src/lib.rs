//! Lease-based ticket semaphore over a shared persistent store.
//!
//! Independent processes coordinate through nothing but a [`TicketStore`]:
//! - `TicketAllocator`: claims the next `(name, index)` ticket, retrying on key collisions
//! - `LeaseTracker`: stamps each ticket with a fixed expiration time
//! - `ReadinessChecker`: polls until no live ticket with a smaller index remains
//! - `SemaphoreService` / `SemaphoreHandle`: `wait` for a semaphore, `signal` to release it

mod allocator;
mod clock;
mod error;
mod handle;
mod lease;
mod memory;
mod options;
mod readiness;
mod service;
mod store;
#[cfg(test)]
mod testing;

pub use allocator::{TicketAllocator, MAX_CLAIM_ATTEMPTS};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{SemaphoreError, StoreError};
pub use handle::SemaphoreHandle;
pub use lease::LeaseTracker;
pub use memory::MemoryStore;
pub use options::{SemaphoreOptions, DEFAULT_REFRESH_INTERVAL_MICROS, DEFAULT_VALIDITY_SECS};
pub use readiness::ReadinessChecker;
pub use service::SemaphoreService;
pub use store::{Ticket, TicketStore, SCHEMA_VERSION};
