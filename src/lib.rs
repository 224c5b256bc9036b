//! Persistent, sandboxed Python execution sessions.
//!
//! A [`Session`] owns one long-lived Python worker process and a private
//! working directory. Variables, imports, and installed packages survive
//! across calls; a worker that crashes or hangs is replaced transparently.
//! A [`SessionRegistry`] hands out sessions and evicts the idle ones.

#[cfg(not(unix))]
compile_error!("pysandbox supervises workers with POSIX process groups and rlimits");

pub mod cleanup;
pub mod config;
pub mod confined_fs;
pub mod error;
pub mod event_log;
pub mod packages;
mod payloads;
pub mod protocol;
pub mod registry;
pub mod scan;
pub mod session;
mod timeouts;
mod timers;
mod venv;
mod worker_process;

pub use cleanup::CleanupTracker;
pub use config::{RegistryOptions, SessionConfig};
pub use confined_fs::{ConfinedFs, ImportOptions};
pub use error::{ConfigError, ErrorKind, SessionError};
pub use registry::{RegistryStats, SessionRegistry, SessionSummary};
pub use scan::{ScanIssue, ScanReport, scan};
pub use session::{
    CodeOutput, EvalOutcome, InstallOutcome, MAX_SEND_ATTEMPTS, Session, SessionInfo,
    SessionStatus, ShellOutput,
};
