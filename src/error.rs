//! Error domain shared by every component in this crate.
//!
//! The variants here are a direct transcription of the error kinds the
//! runtime's callers are contractually allowed to observe: validation
//! failures, serialization failures, backend (KV) failures, registration
//! failures, election failures, and RPC failures. Heartbeat and watcher
//! errors are deliberately *not* represented as a variant that bubbles up to
//! user code — per the propagation policy, those are logged and retried
//! internally and never returned from a public API.

use std::fmt;

/// Stable classification of an RPC failure, carried on [`Error::Rpc`] and
/// mirrored onto the wire in `RpcResponse::error_code`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    /// The target instance is not the current leader of its sticky-active
    /// group. Retryable: the caller should invalidate discovery, re-resolve
    /// the active instance, and retry direct-to-instance.
    NotActive,
    /// No reply arrived within the caller-supplied timeout.
    Timeout,
    /// The handler itself returned or raised an error.
    HandlerError,
    /// Request parameters failed validation before the handler ran.
    ValidationError,
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RpcErrorCode::NotActive => "NOT_ACTIVE",
            RpcErrorCode::Timeout => "TIMEOUT",
            RpcErrorCode::HandlerError => "HANDLER_ERROR",
            RpcErrorCode::ValidationError => "VALIDATION_ERROR",
        };
        f.write_str(s)
    }
}

/// Backend-level failure subtype for KV operations (§4.3).
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KvErrorKind {
    #[error("key already exists")]
    KeyExists,
    #[error("revision mismatch: expected {expected}, found {found:?}")]
    RevisionMismatch { expected: u64, found: Option<u64> },
    #[error("key not found")]
    NotFound,
    /// Catch-all for adapter-reported failures (connection loss, backend
    /// timeout, etc) that aren't one of the structured cases above.
    #[error("backend error: {0}")]
    Backend(String),
}

/// The crate-wide error type. Every fallible public operation returns
/// `Result<T, Error>`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid identifier `{value}`: {reason}")]
    InvalidIdentifier { value: String, reason: &'static str },

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("kv store error on `{key}`: {kind}")]
    KvError { key: String, kind: KvErrorKind },

    #[error("failed to register service `{service_name}`: {source}")]
    RegistrationError {
        service_name: String,
        #[source]
        source: Box<Error>,
    },

    #[error("unrecoverable election error for group `{group_id}`: {message}")]
    ElectionError { group_id: String, message: String },

    #[error("rpc call to `{target}` failed: {code}")]
    RpcError {
        target: String,
        code: RpcErrorCode,
        message: String,
    },
}

impl Error {
    pub fn invalid_identifier(value: impl Into<String>, reason: &'static str) -> Self {
        Error::InvalidIdentifier {
            value: value.into(),
            reason,
        }
    }

    pub fn kv(key: impl Into<String>, kind: KvErrorKind) -> Self {
        Error::KvError {
            key: key.into(),
            kind,
        }
    }

    pub fn registration(service_name: impl Into<String>, source: Error) -> Self {
        Error::RegistrationError {
            service_name: service_name.into(),
            source: Box::new(source),
        }
    }

    pub fn rpc(target: impl Into<String>, code: RpcErrorCode, message: impl Into<String>) -> Self {
        Error::RpcError {
            target: target.into(),
            code,
            message: message.into(),
        }
    }

    /// The `RpcErrorCode` this error maps to, if it is (or wraps) an RPC
    /// failure. Used by `call_rpc` to decide whether a retry is warranted.
    pub fn rpc_code(&self) -> Option<RpcErrorCode> {
        match self {
            Error::RpcError { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
