//! Domain error kinds shared across the archival and indexing pipelines.
//!
//! Application code uses `anyhow::Result` end to end; the variants here are
//! the sentinel kinds that callers need to distinguish (via
//! `err.downcast_ref::<ArchiveError>()`) because they change control flow:
//! a missing record routes an entry to the failure queue, a non-indexable
//! payload is skipped silently, and a too-demanding query outside night
//! hours simply yields the cached value.

/// Error kinds with distinguished handling policies.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ArchiveError {
    /// The requested record exists in neither the key-value store nor the
    /// archive. Queue entries hitting this are pushed to the failure queue
    /// and never retried automatically.
    #[error("record not found")]
    RecordNotFound,

    /// The payload's query supertype is recognized but unsupported (e.g. a
    /// shuffle-stage operation), or the payload lacks a usable form. Skipped
    /// without raising an error; counted separately from failures.
    #[error("record is not indexable")]
    NotIndexable,

    /// The archive refused an unbounded statistics query outside night
    /// hours. Callers fall back to the cached value.
    #[error("too demanding query")]
    TooDemandingQuery,

    /// A payload decoded to JSON but its structure does not match any known
    /// query-form layout.
    #[error("unexpected record structure")]
    RecordStructure,

    /// Opening the fulltext index did not finish within the startup
    /// budget, typically because a stale writer lock from a dead instance
    /// is still held. Fatal; the process exits with a distinct code.
    #[error("timed out opening fulltext index")]
    IndexOpenTimeout,
}

/// True if the error chain bottoms out in [`ArchiveError::RecordNotFound`].
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::RecordNotFound)
    )
}

/// True if the error chain bottoms out in [`ArchiveError::NotIndexable`].
pub fn is_not_indexable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ArchiveError>(),
        Some(ArchiveError::NotIndexable)
    )
}
