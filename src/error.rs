//! Error types for the storage controller
//!
//! Provides structured error types for all controller components including
//! the access control engine, the transactional object model, entity
//! factories, and device-layer providers.

use thiserror::Error;

use crate::security::AccessType;

/// Unified error type for the controller
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Access Control Errors
    // =========================================================================
    #[error(
        "Access of type '{requested}' denied: no rule grants access of type {requested} \
         to a subject in security domain {subject_domain} for an object of security type \
         {object_type}"
    )]
    AccessDenied {
        subject_domain: String,
        object_type: String,
        requested: AccessType,
    },

    #[error("Subject in security domain {subject_domain} lacks required privileges: {required}")]
    MissingPrivileges {
        subject_domain: String,
        required: String,
    },

    // =========================================================================
    // Object Model Errors
    // =========================================================================
    #[error("Object already exists: {kind}/{name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Object not found: {kind}/{name}")]
    NotFound { kind: &'static str, name: String },

    #[error("Operation rejected, object is marked for deletion: {kind}/{name}")]
    DeletedObject { kind: &'static str, name: String },

    #[error("{kind} {value} is out of range [{min} - {max}]")]
    OutOfRange {
        kind: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("Invalid name '{value}': {reason}")]
    InvalidName { value: String, reason: &'static str },

    // =========================================================================
    // Persistence Errors
    // =========================================================================
    #[error("Persistence failure: {0}")]
    Persistence(String),

    // =========================================================================
    // Storage Backend Errors
    // =========================================================================
    #[error("Storage backend failure: {details}")]
    Storage {
        details: String,
        /// The external command or request that produced the failure, when known
        command: Option<String>,
    },

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a backend failure without an associated external command
    pub fn storage(details: impl Into<String>) -> Self {
        Error::Storage {
            details: details.into(),
            command: None,
        }
    }

    /// Build a backend failure carrying the external command that produced it
    pub fn storage_cmd(details: impl Into<String>, command: impl Into<String>) -> Self {
        Error::Storage {
            details: details.into(),
            command: Some(command.into()),
        }
    }

    /// Check whether this error is a refusal rather than a fault.
    ///
    /// Refusals (access denials, privilege failures) are surfaced to the
    /// caller as-is and are never retried.
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Error::AccessDenied { .. } | Error::MissingPrivileges { .. }
        )
    }

    /// Check whether this error is a conflict with existing state
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::AlreadyExists { .. })
    }

    /// Check whether this error is an input validation failure detected
    /// before any state mutation
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::OutOfRange { .. } | Error::InvalidName { .. } | Error::Configuration(_)
        )
    }

    /// Check whether this error requires rolling back the enclosing
    /// transaction context
    pub fn requires_rollback(&self) -> bool {
        matches!(self, Error::Persistence(_))
    }
}

/// Result type alias for the controller
pub type Result<T> = std::result::Result<T, Error>;
