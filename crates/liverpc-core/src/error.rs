//! Error types for liverpc.
//!
//! `RpcError` is the in-process error used by the engines. `RemoteError` is the
//! serializable `{kind, message}` form that crosses a transport and is what
//! callers of a remote procedure or publication observe.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Main error type for the liverpc engines.
#[derive(Debug, Error)]
pub enum RpcError {
    // Invocation errors
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("No resolver bound for {name}")]
    NotImplemented { name: String },

    #[error("Resolver error: {message}")]
    Resolver { message: String },

    #[error("Rate limit exceeded for {name}, retry after {retry_after_ms}ms")]
    RateLimitExceeded { name: String, retry_after_ms: u64 },

    // Lookup and binding errors
    #[error("Not found: {name}")]
    NotFound { name: String },

    #[error("Resolver {name} is not defined")]
    UndefinedResolver { name: String },

    #[error("Name already registered: {name}")]
    DuplicateName { name: String },

    #[error("Name uses the reserved prefix: {name}")]
    ReservedName { name: String },

    #[error("Resolver type does not match the declaration of {name}")]
    ResolverTypeMismatch { name: String },

    // Transport errors
    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for liverpc operations.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Boxed error returned by resolvers and hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        RpcError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl RpcError {
    /// Convert a resolver or hook failure.
    ///
    /// An `RpcError` raised from inside a resolver keeps its kind; anything
    /// else becomes `Resolver`.
    pub fn from_boxed(err: BoxError) -> Self {
        match err.downcast::<RpcError>() {
            Ok(rpc) => *rpc,
            Err(other) => RpcError::Resolver {
                message: other.to_string(),
            },
        }
    }

    /// Caller-visible classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Validation { .. } => ErrorKind::Validation,
            RpcError::NotImplemented { .. } => ErrorKind::NotImplemented,
            RpcError::Resolver { .. } => ErrorKind::Resolver,
            RpcError::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            RpcError::NotFound { .. } => ErrorKind::NotFound,
            RpcError::UndefinedResolver { .. } => ErrorKind::UndefinedResolver,
            RpcError::DuplicateName { .. }
            | RpcError::ReservedName { .. }
            | RpcError::ResolverTypeMismatch { .. } => ErrorKind::Configuration,
            RpcError::Transport { .. } | RpcError::Io { .. } => ErrorKind::Transport,
            RpcError::Json { .. } | RpcError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Convert to a JSON-RPC error code.
    ///
    /// Standard JSON-RPC error codes:
    /// - -32700: Parse error
    /// - -32601: Method not found
    /// - -32602: Invalid params
    /// - -32603: Internal error
    ///
    /// Application codes (-32000 to -32099) are listed on [`ErrorKind::rpc_code`].
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            RpcError::Json { .. } => -32700,
            other => other.kind().rpc_code(),
        }
    }
}

/// Classification carried by a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotImplemented,
    Resolver,
    RateLimitExceeded,
    NotFound,
    UndefinedResolver,
    Configuration,
    Transport,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotImplemented => "not_implemented",
            ErrorKind::Resolver => "resolver",
            ErrorKind::RateLimitExceeded => "rate_limit_exceeded",
            ErrorKind::NotFound => "not_found",
            ErrorKind::UndefinedResolver => "undefined_resolver",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Transport => "transport",
            ErrorKind::Internal => "internal",
        }
    }

    /// JSON-RPC code used when this kind crosses a JSON-RPC transport.
    ///
    /// - -32000: Rate limit exceeded
    /// - -32001: No resolver bound
    /// - -32002: Resolver failed
    /// - -32003: Registry or module misconfiguration
    /// - -32004: Transport failure
    pub fn rpc_code(&self) -> i32 {
        match self {
            ErrorKind::Validation => -32602,
            ErrorKind::NotFound => -32601,
            ErrorKind::RateLimitExceeded => -32000,
            ErrorKind::NotImplemented => -32001,
            ErrorKind::Resolver => -32002,
            ErrorKind::UndefinedResolver | ErrorKind::Configuration => -32003,
            ErrorKind::Transport => -32004,
            ErrorKind::Internal => -32603,
        }
    }

    /// Best-effort inverse of [`ErrorKind::rpc_code`] for peers that omit the kind.
    pub fn from_rpc_code(code: i32) -> Self {
        match code {
            -32602 => ErrorKind::Validation,
            -32601 => ErrorKind::NotFound,
            -32000 => ErrorKind::RateLimitExceeded,
            -32001 => ErrorKind::NotImplemented,
            -32002 => ErrorKind::Resolver,
            -32003 => ErrorKind::Configuration,
            -32004 => ErrorKind::Transport,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error observed by the caller of a remote procedure or publication.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct RemoteError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for a transport-level failure.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transport, message)
    }

    pub fn is_kind(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl From<&RpcError> for RemoteError {
    fn from(err: &RpcError) -> Self {
        RemoteError::new(err.kind(), err.to_string())
    }
}

impl From<RpcError> for RemoteError {
    fn from(err: RpcError) -> Self {
        RemoteError::from(&err)
    }
}

impl From<serde_json::Error> for RemoteError {
    fn from(err: serde_json::Error) -> Self {
        RemoteError::new(ErrorKind::Internal, format!("JSON error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::NotImplemented {
            name: "math.sum".into(),
        };
        assert_eq!(err.to_string(), "No resolver bound for math.sum");
    }

    #[test]
    fn test_rpc_error_codes() {
        assert_eq!(
            RpcError::Validation {
                message: "bad".into()
            }
            .to_rpc_error_code(),
            -32602
        );
        assert_eq!(
            RpcError::NotFound {
                name: "nope".into()
            }
            .to_rpc_error_code(),
            -32601
        );
        assert_eq!(RpcError::Other("x".into()).to_rpc_error_code(), -32603);
    }

    #[test]
    fn test_rpc_code_inverse() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::NotImplemented,
            ErrorKind::Resolver,
            ErrorKind::RateLimitExceeded,
            ErrorKind::NotFound,
            ErrorKind::Transport,
            ErrorKind::Internal,
        ] {
            assert_eq!(ErrorKind::from_rpc_code(kind.rpc_code()), kind);
        }
    }

    #[test]
    fn test_boxed_rpc_error_keeps_kind() {
        let boxed: BoxError = Box::new(RpcError::NotFound {
            name: "task".into(),
        });
        assert_eq!(RpcError::from_boxed(boxed).kind(), ErrorKind::NotFound);

        let boxed: BoxError = "division by zero".into();
        let err = RpcError::from_boxed(boxed);
        assert_eq!(err.kind(), ErrorKind::Resolver);
        assert!(err.to_string().contains("division by zero"));
    }

    #[test]
    fn test_remote_error_wire_shape() {
        let remote = RemoteError::from(RpcError::UndefinedResolver {
            name: "sum".into(),
        });
        let json = serde_json::to_value(&remote).unwrap();
        assert_eq!(json["kind"], "undefined_resolver");
        assert_eq!(json["message"], "Resolver sum is not defined");
    }
}
