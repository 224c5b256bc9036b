#![allow(dead_code)]

use std::error::Error;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use pysandbox::{CleanupTracker, Session, SessionConfig};

pub type TestResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub fn python_program() -> Option<&'static str> {
    static PROGRAM: OnceLock<Option<&'static str>> = OnceLock::new();
    *PROGRAM.get_or_init(|| {
        ["python3", "python"].into_iter().find(|program| {
            Command::new(program)
                .args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 8) else 1)"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .map(|status| status.success())
                .unwrap_or(false)
        })
    })
}

pub fn python_available() -> bool {
    python_program().is_some()
}

/// Returns false, after saying so, when no interpreter is installed.
pub fn require_python() -> bool {
    if python_available() {
        true
    } else {
        eprintln!("python not available; skipping");
        false
    }
}

/// Config rooted in `root` that uses the base interpreter directly, so tests
/// do not pay for virtualenv creation.
pub fn test_config(root: &Path) -> SessionConfig {
    SessionConfig {
        work_dir_root: root.to_path_buf(),
        isolated_env: false,
        wall_time_limit_secs: 60,
        idle_timeout: Duration::from_secs(10 * 60),
        ..SessionConfig::default()
    }
}

pub struct TestSession {
    pub root: tempfile::TempDir,
    pub session: Arc<Session>,
}

pub fn start_session(name: &str) -> TestResult<Option<TestSession>> {
    start_session_with(name, |config| config)
}

pub fn start_session_with(
    name: &str,
    adjust: impl FnOnce(SessionConfig) -> SessionConfig,
) -> TestResult<Option<TestSession>> {
    if !require_python() {
        return Ok(None);
    }
    let root = tempfile::tempdir()?;
    let session = Session::create(name, adjust(test_config(root.path())))?;
    Ok(Some(TestSession { root, session }))
}

pub fn private_tracker() -> Arc<CleanupTracker> {
    Arc::new(CleanupTracker::new())
}
