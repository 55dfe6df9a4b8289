//! Error types for the context chain subsystem

use std::fmt;

use flowctl_election::ElectionError;

/// Result type for context chain operations
pub type ContextResult<T> = Result<T, Error>;

/// Main error type for the context chain subsystem
#[derive(Debug)]
pub struct Error {
    /// Error kind
    kind: ErrorKind,
    /// Error context
    context: ErrorContext,
}

impl Error {
    /// Create a new error
    pub fn new(kind: ErrorKind, context: ErrorContext) -> Self {
        Self { kind, context }
    }

    /// Create error with string context
    pub fn with_context(kind: ErrorKind, context: impl Into<String>) -> Self {
        Self {
            kind,
            context: ErrorContext::Message(context.into()),
        }
    }

    /// Get error kind
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Create a not found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::NotFound, what)
    }

    /// Create an invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::InvalidState, msg)
    }

    /// Create a startup failure error
    pub fn startup_failed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::StartupFailed, msg)
    }

    /// Create a shutdown failure error
    pub fn shutdown_failed(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::ShutdownFailed, msg)
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Configuration, msg)
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_context(ErrorKind::Internal, msg)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            ErrorContext::Message(msg) => write!(f, "{}: {}", self.kind, msg),
            ErrorContext::Chain { message, source } => {
                write!(f, "{}: {} (caused by: {})", self.kind, message, source)
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.context {
            ErrorContext::Chain { source, .. } => Some(source.as_ref()),
            ErrorContext::Message(_) => None,
        }
    }
}

/// Error kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Resource not found
    NotFound,
    /// Invalid state for operation
    InvalidState,
    /// A sub-service failed to start
    StartupFailed,
    /// A sub-service failed to stop
    ShutdownFailed,
    /// Configuration error
    Configuration,
    /// Election framework error
    Election,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::InvalidState => write!(f, "Invalid state"),
            ErrorKind::StartupFailed => write!(f, "Startup failed"),
            ErrorKind::ShutdownFailed => write!(f, "Shutdown failed"),
            ErrorKind::Configuration => write!(f, "Configuration error"),
            ErrorKind::Election => write!(f, "Election error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

/// Error context
#[derive(Debug)]
pub enum ErrorContext {
    /// Simple message
    Message(String),
    /// Error chain with source
    Chain {
        /// Error message
        message: String,
        /// Source error
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl From<ElectionError> for Error {
    fn from(err: ElectionError) -> Self {
        Self {
            kind: ErrorKind::Election,
            context: ErrorContext::Chain {
                message: "election framework error".to_string(),
                source: Box::new(err),
            },
        }
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Self {
            kind: ErrorKind::Internal,
            context: ErrorContext::Chain {
                message: "task join error".to_string(),
                source: Box::new(err),
            },
        }
    }
}
