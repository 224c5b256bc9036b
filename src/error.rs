use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Coarse failure category, independent of the variant that carries details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Startup,
    Communication,
    SecurityViolation,
    Install,
    Session,
    Io,
    Protocol,
    Config,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("worker failed to start: {0}")]
    Startup(String),
    #[error("communication with worker failed after {attempts} attempts: {message}")]
    Communication { attempts: usize, message: String },
    #[error("code rejected by static scan: {}", .issues.join("; "))]
    SecurityViolation { issues: Vec<String> },
    #[error("path escapes the sandbox directory: {}", .path.display())]
    Confinement { path: PathBuf },
    #[error("package installation failed: {message}")]
    Install {
        message: String,
        stdout: String,
        stderr: String,
    },
    #[error("session {0} has been cleaned up")]
    Closed(String),
    #[error("session {0} has expired")]
    Expired(String),
    #[error("session {0} already exists")]
    DuplicateId(String),
    #[error("source does not exist: {}", .0.display())]
    SourceMissing(PathBuf),
    #[error("destination already exists: {}", .0.display())]
    TargetExists(PathBuf),
    #[error("unexpected worker response: {0}")]
    UnexpectedResponse(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Startup(_) => ErrorKind::Startup,
            SessionError::Communication { .. } => ErrorKind::Communication,
            SessionError::SecurityViolation { .. } | SessionError::Confinement { .. } => {
                ErrorKind::SecurityViolation
            }
            SessionError::Install { .. } => ErrorKind::Install,
            SessionError::Closed(_) | SessionError::Expired(_) | SessionError::DuplicateId(_) => {
                ErrorKind::Session
            }
            SessionError::SourceMissing(_) | SessionError::TargetExists(_) | SessionError::Io(_) => {
                ErrorKind::Io
            }
            SessionError::UnexpectedResponse(_) => ErrorKind::Protocol,
            SessionError::Config(_) => ErrorKind::Config,
        }
    }
}

/// Failures talking to a single worker process. Never leaves the crate: the
/// session turns these into retries, `Startup`, or `Communication`.
#[derive(Debug, Error)]
pub(crate) enum WorkerError {
    #[error("worker io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("worker protocol error: {0}")]
    Protocol(String),
    #[error("worker response timed out after {} ms", .0.as_millis())]
    Timeout(Duration),
    #[error("worker exited: {0}")]
    Exited(String),
    #[error("{0}")]
    Startup(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}
