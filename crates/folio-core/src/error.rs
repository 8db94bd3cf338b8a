//! Error types for folio-core.

use std::time::Duration;

use thiserror::Error;

use crate::ipc::JobId;

/// Result type for folio-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can settle a render job.
#[derive(Debug, Error)]
pub enum Error {
    /// The renderer process could not be started.
    #[error("failed to spawn renderer '{program}': {message}")]
    SpawnFailure { program: String, message: String },

    /// The renderer exited or failed while a job was in flight.
    #[error("renderer crashed: {reason}{}", diagnostic.as_ref().map(|d| format!(" ({})", d.trim())).unwrap_or_default())]
    WorkerCrash {
        reason: String,
        /// Text the renderer wrote to its error stream, if any.
        diagnostic: Option<String>,
    },

    /// The renderer answered in a way that breaks the line protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The job exceeded its deadline. The renderer was killed.
    #[error("render job {id} timed out after {after:?}")]
    Timeout { id: JobId, after: Duration },

    /// No renderer binary could be located.
    #[error("renderer not found: {0}")]
    RendererNotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The renderer was shut down before the job settled.
    #[error("renderer has been shut down")]
    ShutDown,
}

/// Violations of the response protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A completion arrived for a different job than the one in flight.
    #[error("protocol error: expected response for job {expected}, got {received}")]
    CorrelationMismatch { expected: JobId, received: JobId },

    /// A completion envelope could not be decoded.
    #[error("protocol error: malformed completion envelope ({reason}): {line}")]
    MalformedEnvelope { reason: String, line: String },
}

/// Coarse classification of [`Error`], convenient for matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SpawnFailure,
    WorkerCrash,
    Protocol,
    Timeout,
    Configuration,
    Io,
    ShutDown,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SpawnFailure { .. } => ErrorKind::SpawnFailure,
            Self::WorkerCrash { .. } => ErrorKind::WorkerCrash,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::RendererNotFound(_) => ErrorKind::Configuration,
            Self::Serialization(_) | Self::Io(_) => ErrorKind::Io,
            Self::ShutDown => ErrorKind::ShutDown,
        }
    }

    /// Whether the renderer process was lost because of this error.
    pub fn is_fatal_to_worker(&self) -> bool {
        matches!(self.kind(), ErrorKind::WorkerCrash | ErrorKind::Timeout)
    }

    /// Recovery hint for the user, if there is a useful one.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::SpawnFailure { .. } | Self::RendererNotFound(_) => {
                Some("pass --renderer or set FOLIO_RENDERER_PATH to a working renderer binary")
            }
            Self::WorkerCrash { .. } => {
                Some("the renderer is restarted for the next job; check its diagnostic output")
            }
            Self::Protocol(_) => Some("the renderer must echo the job id it was given"),
            Self::Timeout { .. } => Some("raise the job timeout or check the document for slow resources"),
            _ => None,
        }
    }

    /// Error message with the recovery hint appended.
    pub fn with_hint(&self) -> String {
        match self.hint() {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}
