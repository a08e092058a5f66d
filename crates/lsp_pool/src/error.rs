use std::{io, time::Duration};

use serde_json::Value;
use thiserror::Error;

/// Errors surfaced while supervising language servers or issuing queries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no usable server for `{language}`: {reason}")]
    BackendUnavailable {
        language: String,
        reason: String,
        /// Earliest point at which a retry may be admitted, when the
        /// language is inside its restart backoff window.
        retry_after: Option<Duration>,
    },
    #[error("server for `{language}` is not ready yet")]
    WorkspaceNotReady { language: String },
    #[error("request queue for `{language}` is full")]
    RateLimited { language: String },
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("server returned JSON-RPC error {code}: {message}")]
    Lsp {
        code: i64,
        message: String,
        data: Option<Value>,
    },
    #[error("stdio transport closed unexpectedly")]
    TransportClosed,
    #[error("malformed message from server: {0}")]
    Protocol(String),
    #[error("server closed its output stream")]
    Eof,
    #[error("request was cancelled")]
    Cancelled,
    #[error("supervisor is shutting down")]
    Shutdown,
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("server did not complete the initialize handshake: {0}")]
    Handshake(String),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub(crate) fn backend_unavailable(language: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            language: language.into(),
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub(crate) fn backoff_gated(
        language: impl Into<String>,
        retry_after: Duration,
    ) -> Self {
        Error::BackendUnavailable {
            language: language.into(),
            reason: format!("restart gated for another {retry_after:?}"),
            retry_after: Some(retry_after),
        }
    }

    /// True when the failure should count against a process's
    /// consecutive-failure threshold.
    pub(crate) fn counts_as_failure(&self) -> bool {
        matches!(self, Error::Lsp { .. } | Error::Timeout(_))
    }
}
