use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::WorkerError;

const VENV_DIR_NAME: &str = "venv";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A per-session virtual environment living inside the work directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PackageEnv {
    root: PathBuf,
}

impl PackageEnv {
    pub(crate) fn location(work_dir: &Path) -> PathBuf {
        work_dir.join(VENV_DIR_NAME)
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    pub(crate) fn python(&self) -> PathBuf {
        self.bin_dir().join("python")
    }

    /// Reuses an existing environment or creates one with `base_python -m venv`.
    pub(crate) fn provision(
        base_python: &Path,
        work_dir: &Path,
        timeout: Duration,
    ) -> Result<Self, WorkerError> {
        let env = Self {
            root: Self::location(work_dir),
        };
        if env.python().is_file() {
            debug!(path = %env.root.display(), "reusing virtual environment");
            return Ok(env);
        }

        info!(path = %env.root.display(), "creating virtual environment");
        let mut child = Command::new(base_python)
            .arg("-m")
            .arg("venv")
            .arg(&env.root)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let deadline = Instant::now() + timeout;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WorkerError::Startup(format!(
                    "virtual environment creation timed out after {} s",
                    timeout.as_secs()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        };

        if !status.success() {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = std::io::Read::read_to_string(&mut pipe, &mut stderr);
            }
            return Err(WorkerError::Startup(format!(
                "`{} -m venv` failed with {status}: {}",
                base_python.display(),
                stderr.trim()
            )));
        }
        if !env.python().is_file() {
            return Err(WorkerError::Startup(format!(
                "virtual environment at {} has no interpreter",
                env.root.display()
            )));
        }
        Ok(env)
    }
}
