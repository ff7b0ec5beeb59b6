//! Custom error types for the library.
//!
//! This module defines the primary error type, `TsError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different failures that can occur while resolving processed records, from
//! pipeline definition problems to an unreachable result store.
//!
//! ## Error Hierarchy
//!
//! `TsError` consolidates the following kinds of failure:
//!
//! - **`UnregisteredLabel`** / **`InvalidLabel`**: A pipeline references a processing label
//!   that was never defined, or a label definition is malformed. These abort the request
//!   for a single station only.
//! - **`StoreUnavailable`** / **`Database`**: The durable store is closed or the backend
//!   failed. These abort the bulk request being served and are surfaced to the caller,
//!   never retried automatically.
//! - **`IndexInconsistency`**: The incident index references a fingerprint that the flat
//!   store does not hold. It is logged and degraded to an empty result.
//! - **`Processing`**: A numeric kernel rejected its input (e.g. a cutoff above Nyquist).
//!
//! A station lacking data for an incident is not an error at all: it is reported as
//! `Ok(None)` by the resolver.
//!
//! By using `#[from]`, `TsError` can be created from the underlying backend errors,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TsError>;

/// Errors raised by the cache, the index and the processing pipeline.
#[derive(Error, Debug)]
pub enum TsError {
    /// A pipeline names a label that was never added.
    #[error("Processing label '{0}' is not registered")]
    UnregisteredLabel(String),

    /// A label definition is missing or misnames a hyperparameter.
    #[error("Invalid processing label '{label}': {reason}")]
    InvalidLabel {
        /// Label name as given
        label: String,
        /// What is wrong with it
        reason: String,
    },

    /// The store is closed or its lock is poisoned.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// An index entry points at a value that is no longer stored.
    #[error("Incident index for '{incident}' references missing cache entry {fingerprint}")]
    IndexInconsistency {
        /// Incident the entry is filed under
        incident: String,
        /// Hex fingerprint of the missing value
        fingerprint: String,
    },

    /// A kernel rejected its input.
    #[error("Signal processing error: {0}")]
    Processing(String),

    /// No loaded or indexed incident has this name.
    #[error("Unknown incident: {0}")]
    UnknownIncident(String),

    /// An incident of this name is already loaded.
    #[error("Incident '{0}' already exists in the project")]
    DuplicateIncident(String),

    /// Malformed arguments to an extraction call.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Latitude or longitude out of range.
    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    /// Unreadable `description.txt`.
    #[error("Incident description error: {0}")]
    Description(String),

    /// Invalid or unreadable settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// SQLite failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored record could not be encoded or decoded.
    #[error("Record codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TsError {
    /// Returns true when the failure concerns the shared store rather than one station.
    ///
    /// Batch operations stop at the first fatal error and hand it back to the caller;
    /// every other error is isolated to the station being resolved.
    pub fn is_batch_fatal(&self) -> bool {
        matches!(self, TsError::StoreUnavailable(_) | TsError::Database(_))
    }
}

impl From<figment::Error> for TsError {
    fn from(err: figment::Error) -> Self {
        TsError::Config(err.to_string())
    }
}
