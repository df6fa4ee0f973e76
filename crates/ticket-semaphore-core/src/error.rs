use thiserror::Error;

/// Errors raised by a [`TicketStore`](crate::TicketStore) backend.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The `(name, index)` key is already taken by another ticket.
    #[error("Ticket {name}#{index} already exists")]
    DuplicateKey { name: String, index: u64 },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this error is a uniqueness collision on the ticket key.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, StoreError::DuplicateKey { .. })
    }
}

/// Errors surfaced by [`SemaphoreService::wait`](crate::SemaphoreService::wait)
/// and [`SemaphoreHandle::signal`](crate::SemaphoreHandle::signal).
#[derive(Error, Debug)]
pub enum SemaphoreError {
    /// No unique ticket index could be claimed within the retry budget.
    #[error("Could not acquire semaphore lock '{name}' after {attempts} attempts")]
    Acquisition { name: String, attempts: u32 },

    /// The handle's lease lapsed before it was signaled.
    #[error("Semaphore '{name}' expired (ticket {index} expired at {expiration_time})")]
    Expired {
        name: String,
        index: u64,
        expiration_time: i64,
    },

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    /// The wait was abandoned through a cancellation future.
    #[error("Wait on semaphore '{name}' was cancelled")]
    Cancelled { name: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}
