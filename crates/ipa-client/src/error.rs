//! FreeIPA client errors

use thiserror::Error;

/// FreeIPA JSON-RPC error code for an entry that already exists.
pub const DUPLICATE_ENTRY: i64 = 4002;

/// FreeIPA JSON-RPC error code for a missing entry.
pub const NOT_FOUND: i64 = 4001;

/// Errors that can occur when talking to the FreeIPA API
#[derive(Debug, Error)]
pub enum IpaError {
    /// HTTP transport error (connect, TLS, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The per-call timeout elapsed before the server answered
    #[error("Request to {0} timed out")]
    Timeout(String),

    /// The server answered with a 5xx status
    #[error("Server error from {server}: {status}")]
    Server {
        /// Server that failed
        server: String,
        /// HTTP status returned
        status: u16,
    },

    /// Login was refused (bad credentials, expired password, ...)
    #[error("Authentication failed against {server}: {message}")]
    Authentication {
        /// Server that refused the login
        server: String,
        /// Message returned by the server
        message: String,
    },

    /// An authenticated command was rejected by FreeIPA
    #[error("FreeIPA rejected {method}: {name} ({code}): {message}")]
    Rejected {
        /// JSON-RPC method that failed
        method: String,
        /// FreeIPA error code
        code: i64,
        /// FreeIPA error class name (e.g. "ValidationError")
        name: String,
        /// Human-readable message
        message: String,
    },

    /// DNS discovery and the static fallback produced no servers
    #[error("No FreeIPA servers found, check the DNS SRV records or the static host list")]
    NoEndpoints,

    /// Every server in the candidate list failed at the transport level
    #[error("All FreeIPA servers failed: {}", .0.join("; "))]
    AllEndpointsFailed(Vec<String>),

    /// DNS resolver could not be built or queried
    #[error("DNS error: {0}")]
    Dns(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Response did not have the expected shape
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl IpaError {
    /// Whether the error is a transport-level condition that should move the
    /// call on to the next server in the candidate list.
    ///
    /// Authenticated rejections are terminal: another replica would answer
    /// the same way.
    #[must_use]
    pub fn is_failover(&self) -> bool {
        matches!(
            self,
            IpaError::Http(_)
                | IpaError::Timeout(_)
                | IpaError::Server { .. }
                | IpaError::Authentication { .. }
                | IpaError::InvalidResponse(_)
        )
    }

    /// Returns true for a FreeIPA `DuplicateEntry` rejection.
    #[must_use]
    pub fn is_duplicate(&self) -> bool {
        matches!(self, IpaError::Rejected { code, .. } if *code == DUPLICATE_ENTRY)
    }

    /// Returns true for a FreeIPA `NotFound` rejection.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, IpaError::Rejected { code, .. } if *code == NOT_FOUND)
    }
}
