use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::WorkerError;
use crate::protocol::{Command as WireCommand, EXIT_LINE, Response};
use crate::timeouts::STDIN_WRITE_TIMEOUT;

const WORKER_SCRIPT: &str = include_str!("../python/worker.py");
const PYTHON_PROGRAM: &str = "python3";
const PYTHON_PROGRAM_FALLBACK: &str = "python";
const STDERR_TAIL_LINES: usize = 20;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const MB: u64 = 1024 * 1024;
/// Headroom between the soft and hard address-space limits.
const ADDRESS_SPACE_HEADROOM: u64 = 512 * MB;
const CPU_HARD_HEADROOM_SECS: u64 = 5;
const NOFILE_SOFT: u64 = 128;
const NOFILE_HARD: u64 = 256;

/// Everything needed to start one worker.
#[derive(Debug, Clone)]
pub(crate) struct WorkerSpec {
    pub session_id: String,
    pub python: PathBuf,
    pub work_dir: PathBuf,
    /// Virtual environment to activate, if any.
    pub venv: Option<PathBuf>,
    pub memory_bytes: u64,
    pub cpu_secs: u64,
    pub default_timeout_secs: u64,
    pub debug: bool,
}

enum StdinCommand {
    Write {
        payload: Vec<u8>,
        reply: mpsc::Sender<Result<(), WorkerError>>,
    },
    Close {
        reply: mpsc::Sender<Result<(), WorkerError>>,
    },
}

/// One running worker interpreter and the threads pumping its pipes.
pub(crate) struct WorkerProcess {
    child: Child,
    session_id: String,
    stdin_tx: mpsc::Sender<StdinCommand>,
    stdout_rx: mpsc::Receiver<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    exit_status: Option<ExitStatus>,
}

impl WorkerProcess {
    pub(crate) fn resolve_python_program(configured: Option<&Path>) -> PathBuf {
        fn find_program_on_path(name: &str) -> Option<PathBuf> {
            use std::os::unix::fs::PermissionsExt;

            let path = std::env::var_os("PATH")?;
            for dir in std::env::split_paths(&path) {
                let candidate = dir.join(name);
                if !candidate.is_file() {
                    continue;
                }
                if let Ok(meta) = std::fs::metadata(&candidate)
                    && meta.permissions().mode() & 0o111 != 0
                {
                    return Some(candidate);
                }
            }
            None
        }

        configured
            .map(Path::to_path_buf)
            .or_else(|| find_program_on_path(PYTHON_PROGRAM))
            .or_else(|| find_program_on_path(PYTHON_PROGRAM_FALLBACK))
            .unwrap_or_else(|| PathBuf::from(PYTHON_PROGRAM))
    }

    pub(crate) fn spawn(spec: &WorkerSpec) -> Result<Self, WorkerError> {
        let mut command = Command::new(&spec.python);
        command
            .arg("-u")
            .arg("-c")
            .arg(WORKER_SCRIPT)
            .current_dir(&spec.work_dir)
            .env_remove("VIRTUAL_ENV")
            .env_remove("CONDA_DEFAULT_ENV")
            .env_remove("PYTHONHOME")
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .env("MALLOC_ARENA_MAX", "2")
            .env("SANDBOX_SESSION_ID", &spec.session_id)
            .env("SANDBOX_WORK_DIR", &spec.work_dir)
            .env("SANDBOX_DEFAULT_TIMEOUT", spec.default_timeout_secs.to_string())
            .env("SANDBOX_WORKER_DEBUG", if spec.debug { "1" } else { "0" })
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(venv) = spec.venv.as_ref() {
            let bin = venv.join("bin");
            let path = std::env::var_os("PATH").unwrap_or_default();
            let joined = std::env::join_paths(
                std::iter::once(bin).chain(std::env::split_paths(&path)),
            )
            .map_err(|err| WorkerError::Startup(format!("invalid PATH: {err}")))?;
            command.env("VIRTUAL_ENV", venv).env("PATH", joined);
        }

        let limits = ResourceLimits::for_spec(spec);
        unsafe {
            command.pre_exec(move || {
                // Own process group so signals reach everything the worker starts.
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                limits.apply();
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|err| {
            WorkerError::Startup(format!("failed to launch {}: {err}", spec.python.display()))
        })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| WorkerError::Startup("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| WorkerError::Startup("worker stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| WorkerError::Startup("worker stderr unavailable".to_string()))?;

        let stdin_tx = spawn_stdin_writer(stdin, &spec.session_id);
        let stdout_rx = spawn_stdout_reader(stdout, &spec.session_id);
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        spawn_stderr_reader(stderr, spec.session_id.clone(), stderr_tail.clone());

        debug!(session = %spec.session_id, pid = child.id(), "worker spawned");
        Ok(Self {
            child,
            session_id: spec.session_id.clone(),
            stdin_tx,
            stdout_rx,
            stderr_tail,
            exit_status: None,
        })
    }

    /// Blocks until the unsolicited READY line arrives.
    pub(crate) fn wait_ready(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        let deadline = Instant::now() + timeout;
        match self.read_response(deadline, timeout) {
            Ok(Response::Ready { .. }) => Ok(()),
            Ok(other) => Err(WorkerError::Startup(format!(
                "expected READY, got {}",
                other.kind()
            ))),
            Err(err) => {
                let tail = self.stderr_tail();
                let mut message = match err {
                    WorkerError::Timeout(_) => {
                        format!("no READY within {} s", timeout.as_secs())
                    }
                    other => other.to_string(),
                };
                if !tail.is_empty() {
                    message.push('\n');
                    message.push_str(&tail);
                }
                Err(WorkerError::Startup(message))
            }
        }
    }

    /// One command, one response. Any error leaves the worker in an unknown
    /// state and the caller must not reuse it.
    pub(crate) fn round_trip(
        &mut self,
        command: &WireCommand,
        wait: Duration,
    ) -> Result<Response, WorkerError> {
        let deadline = Instant::now() + wait;
        let line = command
            .to_line()
            .map_err(|err| WorkerError::Protocol(format!("failed to encode command: {err}")))?;
        self.send_stdin_payload(Some(line.into_bytes()), STDIN_WRITE_TIMEOUT.min(wait))?;
        let response = self.read_response(deadline, wait)?;
        if let Some(id) = response.id()
            && !id.is_empty()
            && id != command.id
        {
            warn!(
                session = %self.session_id,
                expected = %command.id,
                got = %id,
                "worker reply carries an unexpected id"
            );
        }
        Ok(response)
    }

    fn read_response(&mut self, deadline: Instant, wait: Duration) -> Result<Response, WorkerError> {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WorkerError::Timeout(wait));
            }
            match self.stdout_rx.recv_timeout(remaining) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if !trimmed.starts_with('{') {
                        if !trimmed.is_empty() {
                            debug!(session = %self.session_id, line = %trimmed, "ignoring non-protocol output");
                        }
                        continue;
                    }
                    return Response::parse(trimmed).map_err(|err| {
                        WorkerError::Protocol(format!("malformed response: {err}"))
                    });
                }
                Err(mpsc::RecvTimeoutError::Timeout) => return Err(WorkerError::Timeout(wait)),
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(WorkerError::Exited(self.exit_description()));
                }
            }
        }
    }

    fn send_stdin_payload(
        &mut self,
        payload: Option<Vec<u8>>,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let command = match payload {
            Some(payload) => StdinCommand::Write {
                payload,
                reply: reply_tx,
            },
            None => StdinCommand::Close { reply: reply_tx },
        };
        self.stdin_tx
            .send(command)
            .map_err(|_| WorkerError::Protocol("worker stdin unavailable".to_string()))?;
        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WorkerError::Timeout(timeout)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(WorkerError::Protocol(
                "worker stdin thread exited unexpectedly".to_string(),
            )),
        }
    }

    pub(crate) fn pid(&self) -> u32 {
        self.child.id()
    }

    pub(crate) fn is_running(&mut self) -> bool {
        if self.exit_status.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.exit_status = Some(status);
                warn!(session = %self.session_id, "{}", format_exit_status(&status));
                false
            }
            Ok(None) => true,
            Err(_) => false,
        }
    }

    /// Resident memory of the worker and its descendants.
    pub(crate) fn resident_bytes(&self) -> Option<u64> {
        let mut system = System::new();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let tree = process_tree(&system, self.pid());
        let total: u64 = tree
            .iter()
            .filter_map(|pid| system.process(*pid))
            .map(|process| process.memory())
            .sum();
        (total > 0).then_some(total)
    }

    fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().unwrap_or_else(PoisonError::into_inner);
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    fn exit_description(&mut self) -> String {
        // The pipe closes slightly before the process is reapable.
        let deadline = Instant::now() + Duration::from_millis(500);
        while self.exit_status.is_none() && Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                self.exit_status = Some(status);
                break;
            }
            thread::sleep(POLL_INTERVAL);
        }
        match self.exit_status.as_ref() {
            Some(status) => format_exit_status(status),
            None => "worker closed its output".to_string(),
        }
    }

    /// Ask the worker to exit, then escalate to SIGTERM and SIGKILL.
    pub(crate) fn shutdown_graceful(mut self, grace: Duration, term_grace: Duration) {
        if self.is_running() {
            let _ = self.send_stdin_payload(
                Some(format!("{EXIT_LINE}\n").into_bytes()),
                Duration::from_millis(200),
            );
            let _ = self.send_stdin_payload(None, Duration::from_millis(200));
            if self.wait_for_exit(grace) {
                debug!(session = %self.session_id, "worker exited gracefully");
                // Subprocesses it started may still hold the group.
                let _ = self.send_signal(libc::SIGKILL);
                return;
            }
        }
        self.terminate(term_grace);
    }

    /// SIGTERM the process group, then SIGKILL after `grace`.
    pub(crate) fn terminate(mut self, grace: Duration) {
        if !self.is_running() {
            let _ = self.child.wait();
            return;
        }
        if self.send_signal(libc::SIGTERM).is_err() {
            self.kill_process_tree_scan(libc::SIGTERM);
        }
        if !self.wait_for_exit(grace) {
            self.kill_now();
        }
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    self.exit_status = Some(status);
                    return true;
                }
                Ok(None) => {}
                Err(_) => return false,
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn kill_now(&mut self) {
        if self.send_signal(libc::SIGKILL).is_err() {
            self.kill_process_tree_scan(libc::SIGKILL);
        }
        if let Ok(status) = self.child.wait() {
            self.exit_status = Some(status);
        }
    }

    fn send_signal(&self, signal: i32) -> Result<(), WorkerError> {
        let pid = self.child.id() as i32;
        let result = unsafe { libc::kill(-pid, signal) };
        if result == 0 {
            Ok(())
        } else {
            let err = std::io::Error::last_os_error();
            // Group already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(WorkerError::Io(err))
        }
    }

    fn kill_process_tree_scan(&self, signal: i32) {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);
        for pid in process_tree(&system, self.child.id()) {
            let _ = unsafe { libc::kill(pid.as_u32() as i32, signal) };
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.exit_status.is_none() && matches!(self.child.try_wait(), Ok(None)) {
            self.kill_now();
        }
    }
}

/// `root` and all of its descendants.
fn process_tree(system: &System, root: u32) -> HashSet<Pid> {
    let root = Pid::from_u32(root);
    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (proc_pid, process) in system.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*proc_pid);
        }
    }

    let mut stack = vec![root];
    let mut seen: HashSet<Pid> = HashSet::new();
    while let Some(current) = stack.pop() {
        if !seen.insert(current) {
            continue;
        }
        if let Some(kids) = children.get(&current) {
            stack.extend(kids.iter().filter(|kid| !seen.contains(*kid)).copied());
        }
    }
    seen
}

/// rlimits applied in the child between fork and exec.
#[derive(Debug, Clone, Copy)]
struct ResourceLimits {
    cpu_soft: libc::rlim_t,
    cpu_hard: libc::rlim_t,
    memory_soft: libc::rlim_t,
    memory_hard: libc::rlim_t,
}

// Clamps to the inherited hard limit: an unprivileged process cannot raise it,
// and a failed setrlimit must not abort the spawn.
macro_rules! apply_limit {
    ($resource:expr, $soft:expr, $hard:expr) => {{
        let mut current = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit($resource, &mut current) == 0 {
            let ceiling = current.rlim_max;
            let clamp = |value: libc::rlim_t| {
                if ceiling == libc::RLIM_INFINITY {
                    value
                } else {
                    value.min(ceiling)
                }
            };
            let limit = libc::rlimit {
                rlim_cur: clamp($soft),
                rlim_max: clamp($hard),
            };
            libc::setrlimit($resource, &limit);
        }
    }};
}

impl ResourceLimits {
    fn for_spec(spec: &WorkerSpec) -> Self {
        Self {
            cpu_soft: spec.cpu_secs as libc::rlim_t,
            cpu_hard: spec.cpu_secs.saturating_add(CPU_HARD_HEADROOM_SECS) as libc::rlim_t,
            memory_soft: spec.memory_bytes as libc::rlim_t,
            memory_hard: spec.memory_bytes.saturating_add(ADDRESS_SPACE_HEADROOM) as libc::rlim_t,
        }
    }

    /// Only async-signal-safe calls: runs in the forked child.
    unsafe fn apply(&self) {
        unsafe {
            apply_limit!(libc::RLIMIT_CPU, self.cpu_soft, self.cpu_hard);
            apply_limit!(
                libc::RLIMIT_NOFILE,
                NOFILE_SOFT as libc::rlim_t,
                NOFILE_HARD as libc::rlim_t
            );
            #[cfg(not(target_os = "macos"))]
            {
                apply_limit!(libc::RLIMIT_AS, self.memory_soft, self.memory_hard);
                apply_limit!(libc::RLIMIT_DATA, self.memory_soft, self.memory_hard);
            }
        }
    }
}

fn spawn_stdin_writer(stdin: ChildStdin, session_id: &str) -> mpsc::Sender<StdinCommand> {
    let (tx, rx) = mpsc::channel::<StdinCommand>();
    let spawned = thread::Builder::new()
        .name(format!("worker-stdin-{session_id}"))
        .spawn(move || {
            let mut writer = std::io::BufWriter::new(stdin);
            for command in rx {
                match command {
                    StdinCommand::Write { payload, reply } => {
                        let result = writer
                            .write_all(&payload)
                            .and_then(|_| writer.flush())
                            .map_err(WorkerError::Io);
                        let _ = reply.send(result);
                    }
                    StdinCommand::Close { reply } => {
                        let result = writer.flush().map_err(WorkerError::Io);
                        let _ = reply.send(result);
                        break;
                    }
                }
            }
        });
    if let Err(err) = spawned {
        warn!(session = %session_id, error = %err, "failed to start stdin writer");
    }
    tx
}

fn spawn_stdout_reader<R>(stdout: R, session_id: &str) -> mpsc::Receiver<String>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let spawned = thread::Builder::new()
        .name(format!("worker-stdout-{session_id}"))
        .spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.send(line).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    if let Err(err) = spawned {
        warn!(session = %session_id, error = %err, "failed to start stdout reader");
    }
    rx
}

fn spawn_stderr_reader<R>(stderr: R, session_id: String, tail: Arc<Mutex<VecDeque<String>>>)
where
    R: Read + Send + 'static,
{
    let name = format!("worker-stderr-{session_id}");
    let spawned = thread::Builder::new().name(name).spawn(move || {
        let reader = BufReader::new(stderr);
        for line in reader.lines() {
            let Ok(line) = line else {
                break;
            };
            debug!(session = %session_id, "worker stderr: {line}");
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start stderr reader");
    }
}

fn format_exit_status(status: &ExitStatus) -> String {
    if let Some(signal) = status.signal() {
        return format!("worker exited with signal {signal}");
    }
    match status.code() {
        Some(code) => format!("worker exited with status {code}"),
        None => "worker exited with unknown status".to_string(),
    }
}
