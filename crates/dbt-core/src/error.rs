//! Recoverable error types.
//!
//! Per `spec.md` §7 almost everything in this crate is either converted into
//! guest-visible behavior (the `ExceptionRaised` callback) or is host-fatal
//! (an assertion). The cases here are the ones that occur strictly before any
//! guest code has run — arena construction, exception-handler installation,
//! and configuration validation — where a `Result` is the idiomatic shape.

/// Errors that can occur setting up the translation-cache address space.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `code_cache_size` exceeds the host's supported cap (128 MiB on an
    /// AArch64 host, per `spec.md` §4.A).
    #[error("code_cache_size {requested} exceeds the {max} cap for this host")]
    CodeCacheSizeTooLarge {
        /// The size that was requested.
        requested: usize,
        /// The host's cap.
        max: usize,
    },

    /// `code_cache_size` was zero or not large enough to hold a prelude.
    #[error("code_cache_size {requested} is too small to hold the prelude")]
    CodeCacheSizeTooSmall {
        /// The size that was requested.
        requested: usize,
    },

    /// Reserving the host memory region for the arena failed.
    #[error("failed to reserve executable memory: {0}")]
    ArenaAllocation(#[source] region::Error),

    /// Flipping arena protection (W^X enforcement) failed.
    #[error("failed to change code cache protection: {0}")]
    Protection(#[source] region::Error),

    /// Installing the process-wide fault handler failed.
    #[error("failed to install exception handler: {0}")]
    ExceptionHandlerInstall(String),

    /// `processor_id` named a processor beyond the monitor's configured
    /// `processor_count`.
    #[error("processor_id {processor_id} out of range for ExclusiveMonitor of size {processor_count}")]
    ProcessorIdOutOfRange {
        /// The out-of-range id.
        processor_id: usize,
        /// The monitor's configured processor count.
        processor_count: usize,
    },
}

/// Convenience alias for fallible setup operations.
pub type Result<T> = std::result::Result<T, Error>;
