//! Error types for the Scribe controller
//!
//! Errors are structured with fields to aid debugging in production.
//! Configuration errors carry the name of the ReplicationSource and, when
//! known, the offending field path so the condition message points the user
//! at what to fix.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Scribe operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The ReplicationSource spec (or a resource it references) is unusable
    #[error("{message}")]
    Configuration {
        /// Name of the ReplicationSource with invalid configuration
        source_name: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.rclone.rcloneConfig")
        field: Option<String>,
    },

    /// A user-managed object named in the spec does not exist
    ///
    /// Such objects are not owned by the ReplicationSource, so creating them
    /// produces no watch event for it.
    #[error("{kind} {name} referenced by {field} not found")]
    MissingReference {
        /// Name of the ReplicationSource holding the reference
        source_name: String,
        /// The referencing field path (e.g., "spec.rclone.rcloneConfig")
        field: String,
        /// Referenced resource kind
        kind: String,
        /// Referenced resource name
        name: String,
    },

    /// A resource the pass depends on does not exist (yet)
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind (e.g., "PersistentVolumeClaim")
        kind: String,
        /// Resource name
        name: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "keygen", "reconciler")
        context: String,
    },
}

impl Error {
    /// Create a configuration error with the given message
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration {
            source_name: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error for a named ReplicationSource
    pub fn configuration_for(source_name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Configuration {
            source_name: source_name.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a configuration error with source context and field path
    pub fn configuration_for_field(
        source_name: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Configuration {
            source_name: source_name.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a not-found error for a referenced resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an error for a user-managed object the spec names but that is absent
    pub fn missing_reference(
        source_name: impl Into<String>,
        field: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::MissingReference {
            source_name: source_name.into(),
            field: field.into(),
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Attach the ReplicationSource name to a configuration error raised without one
    pub fn with_source_name(self, name: impl Into<String>) -> Self {
        match self {
            Error::Configuration {
                source_name,
                message,
                field,
            } if source_name == UNKNOWN_CONTEXT => Error::Configuration {
                source_name: name.into(),
                message,
                field,
            },
            other => other,
        }
    }

    /// Check if this error is retryable
    ///
    /// Configuration and serialization errors need a spec change before a
    /// retry can succeed. Kubernetes errors are transient unless the API
    /// server rejected the request as malformed or forbidden.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if matches!(ae.code, 400 | 403 | 422)
            ),
            Error::Configuration { .. } => false,
            Error::MissingReference { .. } => false,
            Error::NotFound { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when the API server rejected a write because the object changed underneath us
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// True when the pass waits on an object the user has yet to create
    pub fn awaits_reference(&self) -> bool {
        matches!(self, Error::MissingReference { .. })
    }

    /// Get the ReplicationSource name if this error is associated with one
    pub fn source_name(&self) -> Option<&str> {
        match self {
            Error::Configuration { source_name, .. }
            | Error::MissingReference { source_name, .. } => Some(source_name),
            _ => None,
        }
    }

    /// Get the field path for configuration errors
    pub fn field(&self) -> Option<&str> {
        match self {
            Error::Configuration { field, .. } => field.as_deref(),
            Error::MissingReference { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Returns true if a kube error is a 404 Not Found
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Propagation Through a Reconcile Pass
    // ==========================================================================

    /// Story: a misconfigured source surfaces its message verbatim
    ///
    /// The Reconciled condition copies the error text as-is, so configuration
    /// errors must not be wrapped in a prefix the user did not write.
    #[test]
    fn story_configuration_error_message_is_verbatim() {
        let err = Error::configuration_for("db-backup", "only a single replication method can be provided");
        assert_eq!(
            err.to_string(),
            "only a single replication method can be provided"
        );
        assert_eq!(err.source_name(), Some("db-backup"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn story_configuration_error_points_at_field() {
        let err = Error::configuration_for_field(
            "db-backup",
            "spec.rclone.rcloneConfig",
            "unable to get rclone config secret name",
        );
        assert_eq!(err.field(), Some("spec.rclone.rcloneConfig"));
        assert_eq!(Error::configuration("x").field(), None);
        assert_eq!(
            Error::configuration("x").with_source_name("db").source_name(),
            Some("db")
        );
        assert_eq!(
            err.with_source_name("other").source_name(),
            Some("db-backup")
        );
    }

    /// Story: store-level races are retried on the next pass
    #[test]
    fn story_conflicts_and_not_found_are_transient() {
        let conflict: Error = api_error(409).into();
        assert!(conflict.is_conflict());
        assert!(conflict.is_retryable());

        let missing: Error = api_error(404).into();
        assert!(missing.is_retryable());
        assert!(!missing.is_conflict());

        let pvc = Error::not_found("PersistentVolumeClaim", "data");
        assert_eq!(pvc.to_string(), "PersistentVolumeClaim data not found");
        assert!(pvc.is_retryable());
    }

    /// Story: a secret the user has not created yet is not a transient race
    #[test]
    fn story_missing_reference_names_the_field() {
        let err = Error::missing_reference("db", "spec.restic.repository", "Secret", "restic-config");
        assert_eq!(
            err.to_string(),
            "Secret restic-config referenced by spec.restic.repository not found"
        );
        assert_eq!(err.source_name(), Some("db"));
        assert_eq!(err.field(), Some("spec.restic.repository"));
        assert!(err.awaits_reference());
        assert!(!err.is_retryable());
        assert!(!Error::not_found("Secret", "x").awaits_reference());
    }

    #[test]
    fn story_rejected_requests_are_not_retried() {
        for code in [400, 403, 422] {
            let err: Error = api_error(code).into();
            assert!(!err.is_retryable(), "code {} should not retry", code);
        }
    }

    #[test]
    fn test_serialization_and_internal_errors() {
        let err = Error::serialization_for_kind("Job", "bad json");
        assert!(err.to_string().contains("bad json"));
        assert!(!err.is_retryable());

        let err = Error::internal_with_context("keygen", "rng failure");
        assert_eq!(err.to_string(), "internal error [keygen]: rng failure");
        assert!(err.is_retryable());
        assert_eq!(Error::internal("x").source_name(), None);
    }

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found(&api_error(404)));
        assert!(!is_not_found(&api_error(409)));
    }
}
