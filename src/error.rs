//! Error types and error handling strategy for the engine.
//!
//! Errors are explicit and typed. The taxonomy separates three tiers:
//!
//! - **Speculation outcomes** (`SpeculationFailed`): expected and
//!   recoverable. A mismatched guess or a continuation's self-detected
//!   inconsistency always triggers abort and retry, never a hard error.
//! - **Terminal call failures** (`RetryExhausted`, `Transport`): fatal for
//!   the affected top-level call and surfaced to the application through its
//!   final-result cell.
//! - **Usage errors** (`InvalidContinuation`, `Rebind`, `UnknownParent`):
//!   programming mistakes, fatal to the call attempting the violation and
//!   never retried.
//!
//! Ledger-internal invariant violations are defects, not user-recoverable
//! conditions; the ledger panics on them rather than attempting partial
//! recovery.

use crate::types::CallId;
use core::fmt;
use thiserror::Error as ThisError;

/// The kind of engine error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A guess mismatched the real reply, or a continuation detected an
    /// inconsistency during its run.
    SpeculationFailed,
    /// The retry bound was exceeded for a call chain.
    RetryExhausted,
    /// The transport failed to produce a real reply (includes timeouts).
    Transport,
    /// The continuation is already bound to another live call.
    InvalidContinuation,
    /// The continuation was bound to a different facade.
    Rebind,
    /// The named parent call does not exist or is not pending.
    UnknownParent,
    /// Internal engine defect.
    Internal,
}

impl ErrorKind {
    /// Returns the recoverability classification for this error kind.
    ///
    /// Retry logic uses this to decide whether re-execution makes sense.
    #[must_use]
    pub const fn recoverability(&self) -> Recoverability {
        match self {
            Self::SpeculationFailed => Recoverability::Transient,
            Self::RetryExhausted
            | Self::Transport
            | Self::InvalidContinuation
            | Self::Rebind
            | Self::UnknownParent
            | Self::Internal => Recoverability::Permanent,
        }
    }

    /// Returns a short string for tracing and diagnostics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SpeculationFailed => "speculation_failed",
            Self::RetryExhausted => "retry_exhausted",
            Self::Transport => "transport",
            Self::InvalidContinuation => "invalid_continuation",
            Self::Rebind => "rebind",
            Self::UnknownParent => "unknown_parent",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an error is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverability {
    /// Temporary condition; the retry coordinator may re-execute.
    Transient,
    /// Unrecoverable; surfaced to the application as-is.
    Permanent,
}

/// An engine error with optional call attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    kind: ErrorKind,
    call: Option<CallId>,
    transport: Option<TransportError>,
    detail: Option<String>,
}

impl Error {
    /// Creates an error of the given kind with no attribution.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            call: None,
            transport: None,
            detail: None,
        }
    }

    /// A speculation failure attributed to a call.
    #[must_use]
    pub const fn speculation_failed(call: CallId) -> Self {
        Self {
            kind: ErrorKind::SpeculationFailed,
            call: Some(call),
            transport: None,
            detail: None,
        }
    }

    /// Retry bound exceeded for a call chain.
    #[must_use]
    pub const fn retry_exhausted(call: CallId) -> Self {
        Self {
            kind: ErrorKind::RetryExhausted,
            call: Some(call),
            transport: None,
            detail: None,
        }
    }

    /// A transport failure attributed to a call.
    #[must_use]
    pub const fn transport(call: CallId, cause: TransportError) -> Self {
        Self {
            kind: ErrorKind::Transport,
            call: Some(call),
            transport: Some(cause),
            detail: None,
        }
    }

    /// A usage error with a human-readable detail.
    #[must_use]
    pub fn usage(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            call: None,
            transport: None,
            detail: Some(detail.into()),
        }
    }

    /// Attributes this error to a call.
    #[must_use]
    pub const fn with_call(mut self, call: CallId) -> Self {
        self.call = Some(call);
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the call this error is attributed to, if any.
    #[must_use]
    pub const fn call(&self) -> Option<CallId> {
        self.call
    }

    /// Returns the underlying transport failure, if this is one.
    #[must_use]
    pub const fn transport_cause(&self) -> Option<&TransportError> {
        self.transport.as_ref()
    }

    /// Returns true if this is a recoverable speculation failure.
    #[must_use]
    pub const fn is_speculation_failure(&self) -> bool {
        matches!(self.kind, ErrorKind::SpeculationFailed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(call) = self.call {
            write!(f, " ({call})")?;
        }
        if let Some(cause) = &self.transport {
            write!(f, ": {cause}")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.transport
            .as_ref()
            .map(|t| t as &(dyn std::error::Error + 'static))
    }
}

/// A convenient result alias for engine operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures reported by a transport implementation.
///
/// The engine treats any of these as inequality with the recorded guess: the
/// affected subtree is aborted, and since no authoritative value exists the
/// top-level call fails with [`ErrorKind::Transport`].
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum TransportError {
    /// No real reply arrived within the configured per-call timeout.
    #[error("timed out waiting for reply")]
    Timeout,

    /// The connection was lost before a reply arrived.
    #[error("connection lost")]
    ConnectionLost,

    /// The remote endpoint refused the connection.
    #[error("connection refused")]
    ConnectionRefused,

    /// The remote endpoint reported an error or violated the protocol.
    #[error("protocol error: {details}")]
    Protocol {
        /// Details about the violation.
        details: String,
    },
}
