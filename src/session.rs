use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::cleanup::{self, CleanupTracker};
use crate::config::SessionConfig;
use crate::confined_fs::{ConfinedFs, ImportOptions};
use crate::error::SessionError;
use crate::event_log;
use crate::packages::{PackageBudget, package_name};
use crate::payloads::{self, ENVIRONMENT_REPORT, ShellPayload};
use crate::protocol::{Command, CommandBody, ErrorBody, Response};
use crate::scan;
use crate::timeouts::{
    self, DEFAULT_COMMAND_TIMEOUT, EXIT_GRACE, INSTALL_TIMEOUT, PING_TIMEOUT, REFRESH_TIMEOUT,
    SHELL_ALARM_MARGIN, STARTUP_TIMEOUT, TERMINATE_GRACE, VENV_TIMEOUT,
};
use crate::timers::IdleTimers;
use crate::venv::PackageEnv;
use crate::worker_process::{WorkerProcess, WorkerSpec};

/// Attempts per command, each after a fresh worker start.
pub const MAX_SEND_ATTEMPTS: usize = 3;

const WORK_DIR_PREFIX: &str = "sandbox_session_";

/// Outcome of `run_code` and of other EXEC-backed operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CodeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub returncode: i32,
    pub error: Option<String>,
    pub error_type: Option<String>,
    pub traceback: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShellOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvalOutcome {
    pub success: bool,
    pub result: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallOutcome {
    pub success: bool,
    pub message: String,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub global_variables: Vec<String>,
    pub imported_modules: Vec<String>,
    pub total_modules: usize,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
    /// `None` when the session never idles out.
    pub remaining: Option<Duration>,
    pub memory_budget_bytes: u64,
    pub worker_rss_bytes: Option<u64>,
}

/// Snapshot that never talks to the worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub work_dir: PathBuf,
    pub created_at: SystemTime,
    pub last_used: SystemTime,
    pub idle_timeout: Duration,
    pub remaining: Option<Duration>,
    pub active: bool,
    pub has_venv: bool,
    /// `None` while a command holds the worker.
    pub worker_running: Option<bool>,
    pub worker_spawns: u64,
    pub memory_budget_bytes: u64,
    pub installed_packages: Vec<String>,
}

#[derive(Debug)]
enum EnvState {
    Pending,
    Ready(PackageEnv),
    Unavailable,
}

impl EnvState {
    fn env(&self) -> Option<&PackageEnv> {
        match self {
            EnvState::Ready(env) => Some(env),
            EnvState::Pending | EnvState::Unavailable => None,
        }
    }
}

struct Supervisor {
    worker: Option<WorkerProcess>,
    env: EnvState,
    command_counter: u64,
    spawns: u64,
}

struct Activity {
    active: bool,
    last_accessed: Instant,
    last_used: SystemTime,
    idle_timeout: Duration,
    completed_ops: u64,
    installed_packages: BTreeSet<String>,
}

/// One persistent interpreter plus its private working directory.
///
/// Commands are serialized through the supervisor lock. A worker that dies or
/// stops answering is replaced transparently; the namespace it held is lost.
pub struct Session {
    id: String,
    config: SessionConfig,
    work_dir: PathBuf,
    fs: ConfinedFs,
    created_at: SystemTime,
    tracker: Arc<CleanupTracker>,
    timers: Option<Arc<IdleTimers>>,
    supervisor: Mutex<Supervisor>,
    activity: Mutex<Activity>,
    memory_budget_bytes: AtomicU64,
    in_use: AtomicUsize,
    /// Held for the whole teardown so concurrent callers return only once
    /// the work dir is gone. `true` after the first teardown.
    torn_down: Mutex<bool>,
}

/// Marks an operation in flight. Dropping it records the use.
struct OpGuard<'a> {
    session: &'a Session,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let single_use = {
            let mut activity = self.session.activity();
            activity.completed_ops += 1;
            activity.idle_timeout.is_zero()
        };
        self.session.touch();
        self.session.in_use.fetch_sub(1, Ordering::SeqCst);
        if single_use && let Some(timers) = self.session.timers.as_ref() {
            // Spent: due right away rather than at the next periodic sweep.
            timers.schedule(&self.session.id, Instant::now());
        }
    }
}

impl Session {
    /// Standalone session tracked by the process-wide cleanup tracker.
    pub fn create(id: impl Into<String>, config: SessionConfig) -> Result<Arc<Self>, SessionError> {
        Self::create_with(id.into(), config, CleanupTracker::global(), None)
    }

    pub(crate) fn create_with(
        id: String,
        config: SessionConfig,
        tracker: Arc<CleanupTracker>,
        timers: Option<Arc<IdleTimers>>,
    ) -> Result<Arc<Self>, SessionError> {
        config.validate()?;
        std::fs::create_dir_all(&config.work_dir_root)?;
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("{WORK_DIR_PREFIX}{id}_"))
            .tempdir_in(&config.work_dir_root)?
            .keep();
        tracker.track(&work_dir);
        let fs = ConfinedFs::new(&work_dir)?;

        let now = Instant::now();
        let session = Arc::new(Self {
            memory_budget_bytes: AtomicU64::new(config.memory_limit_bytes()),
            activity: Mutex::new(Activity {
                active: true,
                last_accessed: now,
                last_used: SystemTime::now(),
                idle_timeout: config.idle_timeout,
                completed_ops: 0,
                installed_packages: BTreeSet::new(),
            }),
            supervisor: Mutex::new(Supervisor {
                worker: None,
                env: EnvState::Pending,
                command_counter: 0,
                spawns: 0,
            }),
            id,
            config,
            work_dir,
            fs,
            created_at: SystemTime::now(),
            tracker,
            timers,
            in_use: AtomicUsize::new(0),
            torn_down: Mutex::new(false),
        });
        session.touch();

        info!(session = %session.id, work_dir = %session.work_dir.display(), "session created");
        event_log::log(
            "session_created",
            json!({
                "session_id": session.id,
                "work_dir": session.work_dir.display().to_string(),
                "idle_timeout_secs": session.config.idle_timeout.as_secs(),
                "memory_limit_mb": session.config.memory_limit_mb,
            }),
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn last_used(&self) -> SystemTime {
        self.activity().last_used
    }

    pub fn memory_budget_bytes(&self) -> u64 {
        self.memory_budget_bytes.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.activity().active
    }

    pub fn is_expired(&self) -> bool {
        let activity = self.activity();
        self.expired_locked(&activity)
    }

    /// Idle time left before eviction.
    pub fn remaining(&self) -> Option<Duration> {
        let activity = self.activity();
        if self.expired_locked(&activity) {
            return Some(Duration::ZERO);
        }
        if !self.config.auto_cleanup || activity.idle_timeout.is_zero() {
            return None;
        }
        Some(
            activity
                .idle_timeout
                .saturating_sub(activity.last_accessed.elapsed()),
        )
    }

    /// Resets the idle clock and reschedules the idle timer.
    pub fn touch(&self) {
        let deadline = {
            let mut activity = self.activity();
            activity.last_accessed = Instant::now();
            activity.last_used = SystemTime::now();
            (activity.active && self.config.auto_cleanup && !activity.idle_timeout.is_zero())
                .then(|| activity.last_accessed + activity.idle_timeout)
        };
        if let (Some(timers), Some(at)) = (self.timers.as_ref(), deadline) {
            timers.schedule(&self.id, at);
        }
    }

    /// Lengthens the idle timeout by `minutes` and restarts the idle clock.
    pub fn extend_timeout(&self, minutes: u64) -> Result<Duration, SessionError> {
        let idle_timeout = {
            let mut activity = self.activity();
            if !activity.active {
                return Err(SessionError::Closed(self.id.clone()));
            }
            activity.idle_timeout = activity
                .idle_timeout
                .saturating_add(Duration::from_secs(minutes.saturating_mul(60)));
            activity.idle_timeout
        };
        self.touch();
        debug!(session = %self.id, idle_timeout_secs = idle_timeout.as_secs(), "idle timeout extended");
        Ok(idle_timeout)
    }

    pub fn run_code(&self, code: &str, requirements: &[String]) -> Result<CodeOutput, SessionError> {
        reject_unsafe(code)?;
        let _op = self.begin()?;
        self.install_required(requirements)?;
        let response = self.send_command(
            CommandBody::Exec {
                code: code.to_string(),
            },
            self.wall_time(),
        )?;
        code_output(response)
    }

    pub fn evaluate_expression(&self, expression: &str) -> Result<EvalOutcome, SessionError> {
        reject_unsafe(expression)?;
        let _op = self.begin()?;
        let response = self.send_command(
            CommandBody::Eval {
                code: expression.to_string(),
            },
            DEFAULT_COMMAND_TIMEOUT,
        )?;
        match response {
            Response::Result { value, .. } => Ok(EvalOutcome {
                success: true,
                result: value,
                error: None,
            }),
            Response::Error(body) | Response::FatalError(body) => Ok(EvalOutcome {
                success: false,
                result: String::new(),
                error: Some(describe_error(&body)),
            }),
            other => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Runs `command` with bash (or `/bin/sh`) in the work directory, via the
    /// worker so the same resource limits apply.
    pub fn exec_bash(
        &self,
        command: &str,
        timeout_secs: u64,
        requirements: &[String],
    ) -> Result<ShellOutput, SessionError> {
        let _op = self.begin()?;
        self.install_required(requirements)?;
        let timeout_secs = timeout_secs.max(1);

        let mut supervisor = self.supervisor();
        self.ensure_worker(&mut supervisor)?;
        let venv = supervisor
            .env
            .env()
            .map(|env| env.root().to_string_lossy().into_owned());
        let payload = ShellPayload::new(
            command,
            timeout_secs,
            &self.fs.root().to_string_lossy(),
            venv.as_deref(),
        );
        let response = self.send_locked(
            &mut supervisor,
            CommandBody::Exec {
                code: payload.code.clone(),
            },
            Duration::from_secs(timeout_secs) + SHELL_ALARM_MARGIN,
        )?;
        drop(supervisor);

        match response {
            Response::Success { stdout, stderr, .. } => match payload.extract(&stdout) {
                Some(result) => Ok(ShellOutput {
                    success: result.success,
                    stdout: result.stdout,
                    stderr: if stderr.is_empty() {
                        result.stderr
                    } else {
                        format!("{stderr}{}", result.stderr)
                    },
                    exit_code: result.exit_code,
                    error: result.error,
                }),
                None => Ok(ShellOutput {
                    success: false,
                    stdout,
                    stderr,
                    exit_code: -1,
                    error: Some("shell result markers missing from output".to_string()),
                }),
            },
            Response::Error(body) | Response::FatalError(body) => Ok(ShellOutput {
                success: false,
                error: Some(describe_error(&body)),
                stdout: body.stdout,
                stderr: body.stderr,
                exit_code: -1,
            }),
            other => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    pub fn install_packages(&self, packages: &[String]) -> Result<InstallOutcome, SessionError> {
        let _op = self.begin()?;
        self.install(packages)
    }

    pub fn get_status(&self) -> Result<SessionStatus, SessionError> {
        let _op = self.begin()?;
        let response = self.send_command(CommandBody::Status, DEFAULT_COMMAND_TIMEOUT)?;
        let (global_variables, imported_modules, total_modules) = match response {
            Response::Status {
                global_variables,
                imported_modules,
                total_modules,
                ..
            } => (global_variables, imported_modules, total_modules),
            other => return Err(SessionError::UnexpectedResponse(other.kind().to_string())),
        };
        let worker_rss_bytes = self
            .supervisor()
            .worker
            .as_ref()
            .and_then(WorkerProcess::resident_bytes);
        let remaining = self.remaining();
        let activity = self.activity();
        Ok(SessionStatus {
            global_variables,
            imported_modules,
            total_modules,
            created_at: self.created_at,
            last_used: activity.last_used,
            remaining,
            memory_budget_bytes: self.memory_budget_bytes(),
            worker_rss_bytes,
        })
    }

    /// Round-trips a PING; returns the worker's clock.
    pub fn ping(&self) -> Result<f64, SessionError> {
        let _op = self.begin()?;
        match self.send_command(CommandBody::Ping, PING_TIMEOUT)? {
            Response::Pong { timestamp, .. } => Ok(timestamp),
            other => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    /// Interpreter, virtual environment, and installed package summary.
    pub fn environment_info(&self) -> Result<CodeOutput, SessionError> {
        let _op = self.begin()?;
        let response = self.send_command(
            CommandBody::Exec {
                code: ENVIRONMENT_REPORT.to_string(),
            },
            DEFAULT_COMMAND_TIMEOUT,
        )?;
        code_output(response)
    }

    pub fn save_file(&self, relative: impl AsRef<Path>, contents: &str) -> Result<PathBuf, SessionError> {
        let _op = self.begin()?;
        self.fs.write(relative, contents)
    }

    pub fn read_file(&self, relative: impl AsRef<Path>) -> Result<String, SessionError> {
        let _op = self.begin()?;
        self.fs.read_to_string(relative)
    }

    /// Copies one host file or directory into the sandbox.
    pub fn put_into_sandbox(
        &self,
        source: impl AsRef<Path>,
        dest: impl AsRef<Path>,
        add_to_sys_path: bool,
    ) -> Result<Vec<PathBuf>, SessionError> {
        let options = ImportOptions {
            add_to_sys_path,
            ..ImportOptions::default()
        };
        self.put_many_into_sandbox(&[source.as_ref()], dest, &options)
    }

    /// Copies host files and directories into the sandbox, then lets a
    /// running worker see them without a restart.
    pub fn put_many_into_sandbox<P: AsRef<Path>>(
        &self,
        sources: &[P],
        dest: impl AsRef<Path>,
        options: &ImportOptions,
    ) -> Result<Vec<PathBuf>, SessionError> {
        let _op = self.begin()?;
        let dest = dest.as_ref();
        let copied = self.fs.import(sources, dest, options)?;
        info!(session = %self.id, count = copied.len(), dest = %dest.display(), "imported host files");

        let sys_path_entry = if options.add_to_sys_path {
            let target = self.fs.resolve(dest)?;
            let dir = if target.is_dir() {
                target
            } else {
                target.parent().map(Path::to_path_buf).unwrap_or(target)
            };
            Some(dir.to_string_lossy().into_owned())
        } else {
            None
        };
        self.refresh_imports(sys_path_entry.as_deref());
        Ok(copied)
    }

    /// Replaces the worker; the Python namespace is lost.
    pub fn restart_worker(&self) -> Result<(), SessionError> {
        if !self.is_active() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let mut supervisor = self.supervisor();
        self.discard_worker(&mut supervisor, "requested");
        self.ensure_worker(&mut supervisor)?;
        Ok(())
    }

    pub fn worker_pid(&self) -> Option<u32> {
        self.supervisor().worker.as_ref().map(WorkerProcess::pid)
    }

    pub fn info(&self) -> SessionInfo {
        let (worker_running, worker_spawns, has_venv) = match self.supervisor.try_lock() {
            Ok(mut supervisor) => {
                let running = supervisor.worker.as_mut().is_some_and(WorkerProcess::is_running);
                (Some(running), supervisor.spawns, supervisor.env.env().is_some())
            }
            Err(_) => (None, 0, PackageEnv::location(&self.work_dir).is_dir()),
        };
        let remaining = self.remaining();
        let activity = self.activity();
        SessionInfo {
            id: self.id.clone(),
            work_dir: self.work_dir.clone(),
            created_at: self.created_at,
            last_used: activity.last_used,
            idle_timeout: activity.idle_timeout,
            remaining,
            active: activity.active,
            has_venv,
            worker_running,
            worker_spawns,
            memory_budget_bytes: self.memory_budget_bytes(),
            installed_packages: activity.installed_packages.iter().cloned().collect(),
        }
    }

    /// Stops the worker and deletes the work directory. Safe to call twice.
    pub fn cleanup(&self) {
        let mut torn_down = self.torn_down.lock().unwrap_or_else(PoisonError::into_inner);
        if *torn_down {
            return;
        }
        *torn_down = true;
        self.activity().active = false;

        if let Some(worker) = self.supervisor().worker.take() {
            worker.shutdown_graceful(EXIT_GRACE, TERMINATE_GRACE);
        }
        match cleanup::remove_path(&self.work_dir) {
            Ok(_) => {
                self.tracker.release(&self.work_dir);
            }
            Err(err) => warn!(
                session = %self.id,
                path = %self.work_dir.display(),
                error = %err,
                "failed to remove work directory; leaving it for exit cleanup"
            ),
        }
        info!(session = %self.id, "session cleaned up");
        event_log::log("session_cleaned", json!({ "session_id": self.id }));
    }

    /// Raises the address-space budget for heavy packages. Takes effect at
    /// the next worker start.
    pub(crate) fn raise_memory_budget(&self, packages: &[String]) -> bool {
        let Some(required) = PackageBudget.required_bytes(packages) else {
            return false;
        };
        let previous = self.memory_budget_bytes.fetch_max(required, Ordering::SeqCst);
        if required <= previous {
            return false;
        }
        info!(
            session = %self.id,
            from_mb = previous / (1024 * 1024),
            to_mb = required / (1024 * 1024),
            "raised memory budget for heavy packages"
        );
        event_log::log(
            "memory_budget_raised",
            json!({ "session_id": self.id, "bytes": required }),
        );
        true
    }

    fn begin(&self) -> Result<OpGuard<'_>, SessionError> {
        {
            let activity = self.activity();
            if !activity.active {
                return Err(SessionError::Closed(self.id.clone()));
            }
            if self.expired_locked(&activity) {
                return Err(SessionError::Expired(self.id.clone()));
            }
            self.in_use.fetch_add(1, Ordering::SeqCst);
        }
        self.touch();
        Ok(OpGuard { session: self })
    }

    fn expired_locked(&self, activity: &Activity) -> bool {
        if !activity.active {
            return true;
        }
        if self.in_use.load(Ordering::SeqCst) > 0 {
            return false;
        }
        if activity.idle_timeout.is_zero() {
            return activity.completed_ops > 0;
        }
        if !self.config.auto_cleanup {
            return false;
        }
        activity.last_accessed.elapsed() >= activity.idle_timeout
    }

    fn wall_time(&self) -> Duration {
        Duration::from_secs(self.config.wall_time_limit_secs)
    }

    fn install_required(&self, requirements: &[String]) -> Result<(), SessionError> {
        if requirements.is_empty() {
            return Ok(());
        }
        let outcome = self.install(requirements)?;
        if outcome.success {
            return Ok(());
        }
        Err(SessionError::Install {
            message: outcome.message,
            stdout: outcome.stdout,
            stderr: outcome.stderr,
        })
    }

    fn install(&self, packages: &[String]) -> Result<InstallOutcome, SessionError> {
        if packages.is_empty() {
            return Ok(InstallOutcome {
                success: true,
                message: "no packages requested".to_string(),
                ..InstallOutcome::default()
            });
        }
        self.raise_memory_budget(packages);
        let response = self.send_command(
            CommandBody::Install {
                packages: packages.to_vec(),
            },
            INSTALL_TIMEOUT,
        )?;
        match response {
            Response::InstallSuccess {
                message,
                stdout,
                stderr,
                ..
            } => {
                self.activity()
                    .installed_packages
                    .extend(packages.iter().map(|p| package_name(p)));
                info!(session = %self.id, packages = ?packages, "packages installed");
                Ok(InstallOutcome {
                    success: true,
                    message,
                    stdout,
                    stderr,
                })
            }
            Response::InstallError {
                error,
                stdout,
                stderr,
                ..
            } => {
                warn!(session = %self.id, packages = ?packages, error = %error, "package installation failed");
                Ok(InstallOutcome {
                    success: false,
                    message: error,
                    stdout,
                    stderr,
                })
            }
            Response::Error(body) | Response::FatalError(body) => Ok(InstallOutcome {
                success: false,
                message: describe_error(&body),
                stdout: body.stdout,
                stderr: body.stderr,
            }),
            other => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
        }
    }

    fn refresh_imports(&self, sys_path_entry: Option<&str>) {
        let mut supervisor = self.supervisor();
        let running = supervisor
            .worker
            .as_mut()
            .is_some_and(WorkerProcess::is_running);
        if !running {
            // The next worker starts with a fresh import system.
            return;
        }
        let code = payloads::refresh_imports(sys_path_entry);
        match self.send_locked(&mut supervisor, CommandBody::Exec { code }, REFRESH_TIMEOUT) {
            Ok(Response::Success { .. }) => {
                debug!(session = %self.id, path = ?sys_path_entry, "refreshed worker imports")
            }
            Ok(other) => warn!(session = %self.id, response = other.kind(), "import refresh failed"),
            Err(err) => warn!(session = %self.id, error = %err, "import refresh failed"),
        }
    }

    fn send_command(&self, body: CommandBody, timeout: Duration) -> Result<Response, SessionError> {
        let mut supervisor = self.supervisor();
        self.send_locked(&mut supervisor, body, timeout)
    }

    fn send_locked(
        &self,
        supervisor: &mut Supervisor,
        body: CommandBody,
        timeout: Duration,
    ) -> Result<Response, SessionError> {
        let wait = timeouts::response_wait(timeout);
        let wire_timeout = timeouts::wire_seconds(timeout);
        let mut last_error = String::new();

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            if !self.is_active() {
                return Err(SessionError::Closed(self.id.clone()));
            }
            supervisor.command_counter += 1;
            let command = Command::new(
                format!("cmd_{}", supervisor.command_counter),
                wire_timeout,
                body.clone(),
            );
            debug!(session = %self.id, id = %command.id, kind = command.body.name(), attempt, "sending command");

            let result = self.ensure_worker(supervisor)?.round_trip(&command, wait);
            match result {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!(
                        session = %self.id,
                        id = %command.id,
                        attempt,
                        error = %err,
                        "worker communication failed"
                    );
                    last_error = err.to_string();
                    self.discard_worker(supervisor, &last_error);
                }
            }
        }

        event_log::log(
            "communication_error",
            json!({
                "session_id": self.id,
                "attempts": MAX_SEND_ATTEMPTS,
                "error": last_error,
            }),
        );
        Err(SessionError::Communication {
            attempts: MAX_SEND_ATTEMPTS,
            message: last_error,
        })
    }

    fn ensure_worker<'a>(
        &self,
        supervisor: &'a mut Supervisor,
    ) -> Result<&'a mut WorkerProcess, SessionError> {
        let alive = supervisor
            .worker
            .as_mut()
            .is_some_and(WorkerProcess::is_running);
        if !alive {
            if let Some(dead) = supervisor.worker.take() {
                dead.terminate(TERMINATE_GRACE);
            }
            let spec = self.worker_spec(supervisor);
            let mut worker =
                WorkerProcess::spawn(&spec).map_err(|err| SessionError::Startup(err.to_string()))?;
            if let Err(err) = worker.wait_ready(STARTUP_TIMEOUT) {
                worker.terminate(TERMINATE_GRACE);
                event_log::log(
                    "worker_startup_failed",
                    json!({ "session_id": self.id, "error": err.to_string() }),
                );
                return Err(SessionError::Startup(err.to_string()));
            }
            supervisor.spawns += 1;
            info!(
                session = %self.id,
                pid = worker.pid(),
                python = %spec.python.display(),
                memory_mb = spec.memory_bytes / (1024 * 1024),
                "worker started"
            );
            event_log::log(
                "worker_spawned",
                json!({
                    "session_id": self.id,
                    "pid": worker.pid(),
                    "spawns": supervisor.spawns,
                    "memory_bytes": spec.memory_bytes,
                }),
            );
            supervisor.worker = Some(worker);
        }
        supervisor
            .worker
            .as_mut()
            .ok_or_else(|| SessionError::Startup("worker unavailable".to_string()))
    }

    fn worker_spec(&self, supervisor: &mut Supervisor) -> WorkerSpec {
        let base = WorkerProcess::resolve_python_program(self.config.python.as_deref());
        if matches!(supervisor.env, EnvState::Pending) {
            supervisor.env = if self.config.isolated_env {
                match PackageEnv::provision(&base, &self.work_dir, VENV_TIMEOUT) {
                    Ok(env) => EnvState::Ready(env),
                    Err(err) => {
                        warn!(
                            session = %self.id,
                            error = %err,
                            "virtual environment unavailable; using the base interpreter"
                        );
                        EnvState::Unavailable
                    }
                }
            } else {
                EnvState::Unavailable
            };
        }
        let env = supervisor.env.env();
        WorkerSpec {
            session_id: self.id.clone(),
            python: env.map(PackageEnv::python).unwrap_or(base),
            work_dir: self.fs.root().to_path_buf(),
            venv: env.map(|env| env.root().to_path_buf()),
            memory_bytes: self.memory_budget_bytes(),
            cpu_secs: self.config.cpu_time_limit_secs,
            default_timeout_secs: self.config.wall_time_limit_secs,
            debug: self.config.debug,
        }
    }

    fn discard_worker(&self, supervisor: &mut Supervisor, reason: &str) {
        let Some(worker) = supervisor.worker.take() else {
            return;
        };
        let pid = worker.pid();
        worker.terminate(TERMINATE_GRACE);
        event_log::log(
            "worker_restarted",
            json!({ "session_id": self.id, "pid": pid, "reason": reason }),
        );
    }

    fn supervisor(&self) -> MutexGuard<'_, Supervisor> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cleanup();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("work_dir", &self.work_dir)
            .finish_non_exhaustive()
    }
}

fn reject_unsafe(code: &str) -> Result<(), SessionError> {
    let report = scan::scan(code);
    if report.is_safe() {
        return Ok(());
    }
    Err(SessionError::SecurityViolation {
        issues: report.messages(),
    })
}

fn describe_error(body: &ErrorBody) -> String {
    if body.error_type.is_empty() {
        body.error.clone()
    } else {
        format!("{}: {}", body.error_type, body.error)
    }
}

fn code_output(response: Response) -> Result<CodeOutput, SessionError> {
    match response {
        Response::Success { stdout, stderr, .. } => Ok(CodeOutput {
            success: true,
            stdout,
            stderr,
            returncode: 0,
            ..CodeOutput::default()
        }),
        Response::Error(body) | Response::FatalError(body) => {
            let non_empty = |s: String| (!s.is_empty()).then_some(s);
            Ok(CodeOutput {
                success: false,
                stdout: body.stdout,
                stderr: if body.stderr.is_empty() {
                    body.traceback.clone()
                } else {
                    body.stderr
                },
                returncode: 1,
                error: Some(body.error),
                error_type: non_empty(body.error_type),
                traceback: non_empty(body.traceback),
            })
        }
        other => Err(SessionError::UnexpectedResponse(other.kind().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(idle: Duration) -> (tempfile::TempDir, Arc<CleanupTracker>, Arc<Session>) {
        let root = tempfile::tempdir().expect("tempdir");
        let tracker = Arc::new(CleanupTracker::new());
        let config = SessionConfig {
            idle_timeout: idle,
            work_dir_root: root.path().to_path_buf(),
            isolated_env: false,
            ..SessionConfig::default()
        };
        let session = Session::create_with("unit".to_string(), config, tracker.clone(), None)
            .expect("create session");
        (root, tracker, session)
    }

    #[test]
    fn work_dir_is_created_tracked_and_removed() {
        let (_root, tracker, session) = session(Duration::from_secs(60));
        let work_dir = session.work_dir().to_path_buf();
        assert!(work_dir.is_dir());
        assert!(
            work_dir
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("sandbox_session_unit_"))
        );
        assert!(tracker.is_tracked(&work_dir));

        session.cleanup();
        session.cleanup();
        assert!(!work_dir.exists());
        assert!(!tracker.is_tracked(&work_dir));
        assert!(matches!(
            session.read_file("x.txt"),
            Err(SessionError::Closed(_))
        ));
    }

    #[test]
    fn file_operations_stay_inside_work_dir() {
        let (_root, _tracker, session) = session(Duration::from_secs(60));
        session.save_file("data/out.txt", "hello").expect("save");
        assert_eq!(session.read_file("data/out.txt").expect("read"), "hello");
        assert!(matches!(
            session.save_file("../escape.txt", "x"),
            Err(SessionError::Confinement { .. })
        ));
    }

    #[test]
    fn single_use_session_expires_after_first_operation() {
        let (_root, _tracker, session) = session(Duration::ZERO);
        assert!(!session.is_expired());
        session.save_file("a.txt", "1").expect("first use");
        assert!(session.is_expired());
        assert!(matches!(
            session.read_file("a.txt"),
            Err(SessionError::Expired(_))
        ));
        assert_eq!(session.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn idle_expiry_and_extension() {
        let (_root, _tracker, session) = session(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(80));
        assert!(session.is_expired());
        session.extend_timeout(1).expect("extend");
        assert!(!session.is_expired());
        let remaining = session.remaining().expect("idle countdown");
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn disabled_auto_cleanup_never_idles_out() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig {
            idle_timeout: Duration::from_millis(10),
            auto_cleanup: false,
            work_dir_root: root.path().to_path_buf(),
            isolated_env: false,
            ..SessionConfig::default()
        };
        let session = Session::create_with(
            "keep".to_string(),
            config,
            Arc::new(CleanupTracker::new()),
            None,
        )
        .expect("create");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!session.is_expired());
        assert_eq!(session.remaining(), None);
    }

    #[test]
    fn heavy_packages_only_raise_the_budget() {
        let (_root, _tracker, session) = session(Duration::from_secs(60));
        let base = session.memory_budget_bytes();
        assert_eq!(base, 512 * 1024 * 1024);
        assert!(!session.raise_memory_budget(&["requests".to_string()]));
        assert!(session.raise_memory_budget(&["pandas>=2".to_string()]));
        assert_eq!(session.memory_budget_bytes(), 2048 * 1024 * 1024);
        assert!(!session.raise_memory_budget(&["numpy".to_string()]));
        assert_eq!(session.memory_budget_bytes(), 2048 * 1024 * 1024);
    }

    #[test]
    fn unsafe_code_is_rejected_before_any_worker_starts() {
        let (_root, _tracker, session) = session(Duration::ZERO);
        let err = session
            .run_code("x = eval('1 + 1')", &[])
            .expect_err("eval call must be rejected");
        assert!(matches!(err, SessionError::SecurityViolation { .. }));
        assert!(session.worker_pid().is_none());
        // A rejected submission does not consume a single-use session.
        assert!(!session.is_expired());
    }

    #[test]
    fn invalid_config_is_refused() {
        let root = tempfile::tempdir().expect("tempdir");
        let config = SessionConfig {
            memory_limit_mb: 0,
            work_dir_root: root.path().to_path_buf(),
            ..SessionConfig::default()
        };
        let err = Session::create_with("bad".to_string(), config, Arc::new(CleanupTracker::new()), None)
            .expect_err("zero memory limit");
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn error_responses_become_failed_output() {
        let output = code_output(Response::Error(ErrorBody {
            id: "cmd_1".to_string(),
            error: "division by zero".to_string(),
            error_type: "ZeroDivisionError".to_string(),
            traceback: "Traceback ...".to_string(),
            ..ErrorBody::default()
        }))
        .expect("error output");
        assert!(!output.success);
        assert_eq!(output.returncode, 1);
        assert_eq!(output.stderr, "Traceback ...");
        assert_eq!(output.error_type.as_deref(), Some("ZeroDivisionError"));
    }
}
