//! Error types and result handling for cdc-relay.
//!
//! This module defines the main error type [`Error`], the closed
//! [`ErrorKind`] enum reported by subscription status, and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! # Example
//!
//! ```rust
//! use cdc_relay::{Error, Result};
//!
//! fn connect_to_datastore() -> Result<()> {
//!     // Simulating a connection error
//!     Err(Error::Connection("Failed to connect".to_string()))
//! }
//!
//! match connect_to_datastore() {
//!     Ok(()) => println!("Connected"),
//!     Err(e) if e.is_transient() => eprintln!("Will retry: {}", e),
//!     Err(e) => eprintln!("Other error: {}", e),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::event::SequenceNumber;

/// The main error type for cdc-relay operations.
///
/// The first group of variants is the replication taxonomy surfaced to
/// operators; the rest are ambient failures from drivers, I/O and
/// configuration.
#[derive(Error, Debug)]
pub enum Error {
    /// Transient connection failure, retried with exponential backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Mapping does not fit the source or target schema. Fatal before activation.
    #[error("Schema mismatch for {table}: {message}")]
    SchemaMismatch {
        /// Table the mapping refers to
        table: String,
        /// What did not match
        message: String,
    },

    /// The change log no longer holds events after the checkpoint.
    ///
    /// Capture cannot resume safely; the subscription needs a re-snapshot.
    #[error("Log gap on {table} after {checkpoint}: {message}")]
    LogGap {
        /// Table whose log was truncated
        table: String,
        /// Last acknowledged position
        checkpoint: SequenceNumber,
        /// Description of the gap
        message: String,
    },

    /// Target row was modified independently of the source.
    #[error("Apply conflict on {table}: {message}")]
    ApplyConflict {
        /// Target table
        table: String,
        /// Description of the conflict
        message: String,
    },

    /// Writing to the target failed after the configured retries.
    #[error("Apply failure: {message} (after {attempts} attempts)")]
    ApplyFailure {
        /// Description of the last failure
        message: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Configuration error, from the file, the environment or cross references.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client or producer error.
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding events or state files.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, typically from checkpoint file operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A named datastore, channel, subscription or table does not exist.
    #[error("{what} not found: {name}")]
    NotFound {
        /// Kind of object looked up
        what: &'static str,
        /// Name that was looked up
        name: String,
    },

    /// A name is already registered.
    #[error("{what} already exists: {name}")]
    AlreadyExists {
        /// Kind of object registered
        what: &'static str,
        /// Duplicate name
        name: String,
    },

    /// The subscription state machine rejected a command.
    #[error("Invalid transition: cannot {command} while {state}")]
    InvalidTransition {
        /// Current state
        state: String,
        /// Rejected command
        command: String,
    },

    /// Invalid or malformed change log message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },

    /// The datastore driver does not support the requested operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Operation timeout.
    #[error("Timeout error: {message}")]
    Timeout {
        /// Description of what timed out
        message: String,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error mechanism
    /// to cleanly exit the capture and apply loops.
    #[error("Shutdown requested")]
    Shutdown,
}

/// Closed classification of errors, reported by subscription status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Connection,
    SchemaMismatch,
    LogGap,
    ApplyConflict,
    ApplyFailure,
    Config,
    Driver,
    Io,
    NotFound,
    InvalidTransition,
    Unsupported,
    Timeout,
    Shutdown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Connection => "ConnectionError",
            ErrorKind::SchemaMismatch => "SchemaMismatchError",
            ErrorKind::LogGap => "LogGapError",
            ErrorKind::ApplyConflict => "ApplyConflictError",
            ErrorKind::ApplyFailure => "ApplyFailure",
            ErrorKind::Config => "ConfigError",
            ErrorKind::Driver => "DriverError",
            ErrorKind::Io => "IoError",
            ErrorKind::NotFound => "NotFoundError",
            ErrorKind::InvalidTransition => "InvalidTransition",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Shutdown => "Shutdown",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Classifies the error for status reporting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Connection(_) => ErrorKind::Connection,
            Error::SchemaMismatch { .. } => ErrorKind::SchemaMismatch,
            Error::LogGap { .. } => ErrorKind::LogGap,
            Error::ApplyConflict { .. } => ErrorKind::ApplyConflict,
            Error::ApplyFailure { .. } => ErrorKind::ApplyFailure,
            Error::Config(_) => ErrorKind::Config,
            Error::Postgres(_) | Error::Kafka(_) | Error::InvalidMessage { .. } => {
                ErrorKind::Driver
            }
            Error::Serialization(_) | Error::Io(_) => ErrorKind::Io,
            Error::NotFound { .. } | Error::AlreadyExists { .. } => ErrorKind::NotFound,
            Error::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Shutdown => ErrorKind::Shutdown,
        }
    }

    /// Whether the error may succeed on retry.
    ///
    /// Schema mismatches, log gaps and exhausted retries are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Timeout { .. } | Error::Io(_) => true,
            Error::Postgres(e) => e.is_closed() || e.code().is_none(),
            Error::Kafka(_) => true,
            _ => false,
        }
    }

    /// Errors that must stop a subscription instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::SchemaMismatch { .. }
                | Error::LogGap { .. }
                | Error::ApplyFailure { .. }
                | Error::Config(_)
        )
    }

    pub(crate) fn not_found(what: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            what,
            name: name.into(),
        }
    }

    pub(crate) fn schema_mismatch(table: impl fmt::Display, message: impl Into<String>) -> Self {
        Error::SchemaMismatch {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

/// A convenient Result type alias for cdc-relay operations.
///
/// This is equivalent to `std::result::Result<T, cdc_relay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
