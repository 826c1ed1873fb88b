//! Error types for the outbound sync pipeline
//!
//! Errors are split into run-scoped failures (abort the whole run) and
//! resource-scoped failures (recorded, remaining resources continue).

use thiserror::Error;

/// Error that can occur during an outbound sync run.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Token acquisition failed after retries, or the token endpoint
    /// returned a non-retryable status or an unparseable body.
    #[error("token acquisition failed: {message}")]
    Auth {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transient HTTP failure (5xx, 429, connect/timeout). Retried by the
    /// retry policy; only surfaced once attempts are exhausted.
    #[error("transient http failure{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    TransientHttp {
        status: Option<u16>,
        message: String,
    },

    /// Non-retryable HTTP status while fetching a resource. Fatal for that
    /// resource only.
    #[error("fetch failed for {resource}: status {status}")]
    Fetch { resource: String, status: u16 },

    /// Page body could not be reduced to a record array even after repair.
    /// The payload is quarantined and the resource fails.
    #[error("unrepairable payload for {resource}: {detail}")]
    Payload { resource: String, detail: String },

    /// The mapping dictionary has no rows for the destination table.
    #[error("no column mappings found for table {table}")]
    Mapping { table: String },

    /// Insertion failed mid-page. Carries the table and a truncated payload
    /// sample for diagnostics.
    #[error("insert into {table} failed: {message}")]
    Ingest {
        table: String,
        message: String,
        payload: String,
    },

    /// Catalogue store lookup failed (access info or resource list).
    #[error("catalogue lookup failed: {message}")]
    Catalog {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Invalid or missing configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Could not connect to the remote file endpoint. The remote side's
    /// availability is a precondition for the whole handshake.
    #[error("handshake connection to {host} failed: {message}")]
    HandshakeConnect { host: String, message: String },

    /// The remote never cleared its busy marker within the wait window.
    #[error("remote busy marker still present after {waited_secs}s")]
    HandshakeTimeout { waited_secs: u64 },

    /// A marker upload or delete failed, leaving the protocol state
    /// indeterminate. Fatal for the handoff phase.
    #[error("handshake marker operation on {marker} failed: {message}")]
    HandshakeMarker { marker: String, message: String },

    /// A single data file failed to upload. Logged and skipped; does not
    /// abort the handshake.
    #[error("upload of {file} failed: {message}")]
    HandshakeUpload { file: String, message: String },

    /// Notification send failed. Logged, never escalated.
    #[error("notification failed: {message}")]
    Notify { message: String },

    /// The run-wide deadline expired.
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

impl SyncError {
    /// Run-scoped errors abort the entire run; everything else is scoped to
    /// one resource or logged in place.
    pub fn is_run_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Auth { .. }
                | SyncError::Catalog { .. }
                | SyncError::Config { .. }
                | SyncError::HandshakeConnect { .. }
                | SyncError::HandshakeTimeout { .. }
                | SyncError::HandshakeMarker { .. }
                | SyncError::DeadlineExceeded
        )
    }

    /// Whether the retry policy may try this error again.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::TransientHttp { .. })
    }

    /// Short stage label used in log lines and notification subjects.
    pub fn stage(&self) -> &'static str {
        match self {
            SyncError::Auth { .. } => "auth",
            SyncError::TransientHttp { .. } | SyncError::Fetch { .. } => "fetch",
            SyncError::Payload { .. } => "payload",
            SyncError::Mapping { .. } => "mapping",
            SyncError::Ingest { .. } => "ingest",
            SyncError::Catalog { .. } => "catalogue",
            SyncError::Config { .. } => "config",
            SyncError::HandshakeConnect { .. }
            | SyncError::HandshakeTimeout { .. }
            | SyncError::HandshakeMarker { .. }
            | SyncError::HandshakeUpload { .. } => "handshake",
            SyncError::Notify { .. } => "notify",
            SyncError::DeadlineExceeded => "deadline",
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        SyncError::Auth {
            message: message.into(),
            source: None,
        }
    }

    pub fn auth_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Auth {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        SyncError::TransientHttp {
            status,
            message: message.into(),
        }
    }

    pub fn catalog(message: impl Into<String>) -> Self {
        SyncError::Catalog {
            message: message.into(),
            source: None,
        }
    }

    pub fn catalog_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        SyncError::Catalog {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        SyncError::Config {
            message: message.into(),
        }
    }
}

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
