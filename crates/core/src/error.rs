//! Error types shared across the protodist crates.
//!
//! The error surface is a closed sum: every failure an operation can report
//! maps to exactly one [`ErrorKind`]. The resolver's strategy ladder and the
//! retry layer dispatch on kinds, never on error message text.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias for protodist operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The closed set of failure categories.
///
/// Kinds are stable: callers may match exhaustively to decide whether to
/// retry, fall through to another acquisition strategy, or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Repository, reference, tool, or file absent.
    NotFound,
    /// No credential available for a registry that demands one.
    AuthRequired,
    /// A credential was presented and rejected.
    AuthFailed,
    /// Computed digest differs from the recorded digest.
    IntegrityMismatch,
    /// Network, DNS, or TLS failure.
    TransportFailed,
    /// Malformed manifest, unsupported schema, or bad wire data.
    ProtocolError,
    /// A bounded operation exceeded its deadline.
    Timeout,
    /// A publish-side precondition did not hold.
    PreconditionFailed,
    /// A package-manager install ran and failed.
    InstallFailed,
    /// Invalid configuration or arguments.
    ConfigInvalid,
    /// Everything else: I/O, serialization, logic errors.
    Internal,
}

impl ErrorKind {
    /// Whether an error of this kind may be retried within the same strategy.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::TransportFailed | Self::Timeout)
    }

    /// Stable lowercase name, used in logs and metrics labels.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::AuthRequired => "auth-required",
            Self::AuthFailed => "auth-failed",
            Self::IntegrityMismatch => "integrity-mismatch",
            Self::TransportFailed => "transport-failed",
            Self::ProtocolError => "protocol-error",
            Self::Timeout => "timeout",
            Self::PreconditionFailed => "precondition-failed",
            Self::InstallFailed => "install-failed",
            Self::ConfigInvalid => "config-invalid",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during protodist operations.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Repository, reference, tool, or file absent.
    #[error("Not found: {what}")]
    #[diagnostic(code(protodist::not_found))]
    NotFound {
        /// Description of what was looked up.
        what: String,
    },

    /// No credential available for a registry that demands one.
    #[error("Authentication required for registry '{registry}'")]
    #[diagnostic(
        code(protodist::auth_required),
        help("Set credentials for registry {registry} and retry")
    )]
    AuthRequired {
        /// The registry host.
        registry: String,
    },

    /// A credential was presented and rejected.
    #[error("Authentication failed for registry '{registry}': {message}")]
    #[diagnostic(
        code(protodist::auth_failed),
        help("Check that the token for {registry} is valid and not expired")
    )]
    AuthFailed {
        /// The registry host.
        registry: String,
        /// Reason reported by the registry.
        message: String,
    },

    /// Computed digest differs from the recorded digest.
    #[error("Integrity mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(protodist::integrity_mismatch),
        help("The upstream payload does not match its pinned digest; do not retry blindly")
    )]
    IntegrityMismatch {
        /// The digest that was expected.
        expected: String,
        /// The digest that was computed.
        actual: String,
    },

    /// Network, DNS, or TLS failure.
    #[error("Transport failure: {message}")]
    #[diagnostic(code(protodist::transport))]
    Transport {
        /// Description of the failure.
        message: String,
    },

    /// Malformed manifest, unsupported schema, or bad wire data.
    #[error("Protocol error: {message}")]
    #[diagnostic(code(protodist::protocol))]
    Protocol {
        /// Description of the malformation.
        message: String,
    },

    /// A bounded operation exceeded its deadline.
    #[error("Timed out after {seconds}s: {operation}")]
    #[diagnostic(code(protodist::timeout))]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline that was exceeded.
        seconds: u64,
    },

    /// A publish-side precondition did not hold.
    #[error("Precondition failed: {message}")]
    #[diagnostic(code(protodist::precondition))]
    PreconditionFailed {
        /// Description of the violated precondition.
        message: String,
    },

    /// A package-manager install ran and failed.
    #[error("Install failed for '{tool}': {message}")]
    #[diagnostic(code(protodist::install_failed))]
    InstallFailed {
        /// The tool being installed.
        tool: String,
        /// Installer output or reason.
        message: String,
    },

    /// Invalid configuration or arguments.
    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(protodist::config))]
    ConfigInvalid {
        /// Description of the invalid input.
        message: String,
    },

    /// Wrapped I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(protodist::io))]
    Io(#[from] std::io::Error),

    /// Wrapped JSON error.
    #[error("JSON error: {0}")]
    #[diagnostic(code(protodist::json))]
    Json(#[from] serde_json::Error),

    /// Everything else.
    #[error("Internal error: {message}")]
    #[diagnostic(code(protodist::internal))]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl Error {
    /// Create a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create an auth-required error.
    #[must_use]
    pub fn auth_required(registry: impl Into<String>) -> Self {
        Self::AuthRequired {
            registry: registry.into(),
        }
    }

    /// Create an auth-failed error.
    #[must_use]
    pub fn auth_failed(registry: impl Into<String>, message: impl Into<String>) -> Self {
        Self::AuthFailed {
            registry: registry.into(),
            message: message.into(),
        }
    }

    /// Create an integrity-mismatch error.
    #[must_use]
    pub fn integrity_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::IntegrityMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a transport error.
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a protocol error.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    #[must_use]
    pub fn timeout(operation: impl Into<String>, seconds: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            seconds,
        }
    }

    /// Create a precondition-failed error.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    /// Create an install-failed error.
    #[must_use]
    pub fn install_failed(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InstallFailed {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a config-invalid error.
    #[must_use]
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The [`ErrorKind`] this error belongs to.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AuthRequired { .. } => ErrorKind::AuthRequired,
            Self::AuthFailed { .. } => ErrorKind::AuthFailed,
            Self::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            Self::Transport { .. } => ErrorKind::TransportFailed,
            Self::Protocol { .. } => ErrorKind::ProtocolError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::PreconditionFailed { .. } => ErrorKind::PreconditionFailed,
            Self::InstallFailed { .. } => ErrorKind::InstallFailed,
            Self::ConfigInvalid { .. } => ErrorKind::ConfigInvalid,
            Self::Io(_) | Self::Json(_) | Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether this error may be retried within the current strategy.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Process exit code for this error.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::ConfigInvalid => crate::exit::USAGE,
            ErrorKind::Timeout => crate::exit::TIMEOUT,
            _ => crate::exit::FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::not_found("x").kind(), ErrorKind::NotFound);
        assert_eq!(Error::auth_required("r").kind(), ErrorKind::AuthRequired);
        assert_eq!(
            Error::integrity_mismatch("a", "b").kind(),
            ErrorKind::IntegrityMismatch
        );
        assert_eq!(Error::transport("t").kind(), ErrorKind::TransportFailed);
        assert_eq!(Error::timeout("pull", 30).kind(), ErrorKind::Timeout);
        assert_eq!(Error::internal("i").kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(Error::transport("connection reset").is_retryable());
        assert!(Error::timeout("pull", 300).is_retryable());
        assert!(!Error::not_found("missing").is_retryable());
        assert!(!Error::auth_required("reg").is_retryable());
        assert!(!Error::integrity_mismatch("a", "b").is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Error::config_invalid("bad flag").exit_code(), 2);
        assert_eq!(Error::timeout("push", 600).exit_code(), 124);
        assert_eq!(Error::not_found("ref").exit_code(), 1);
        assert_eq!(Error::transport("dns").exit_code(), 1);
    }

    #[test]
    fn test_display_contains_context() {
        let err = Error::auth_failed("oras.birb.homes", "token rejected");
        assert!(err.to_string().contains("oras.birb.homes"));
        assert!(err.to_string().contains("token rejected"));

        let err = Error::integrity_mismatch("sha256:aa", "sha256:bb");
        assert!(err.to_string().contains("sha256:aa"));
        assert!(err.to_string().contains("sha256:bb"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: Error = io_err.into();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(ErrorKind::NotFound.as_str(), "not-found");
        assert_eq!(ErrorKind::TransportFailed.as_str(), "transport-failed");
        assert_eq!(ErrorKind::PreconditionFailed.as_str(), "precondition-failed");
    }
}
