//! Optional JSONL stream of lifecycle events, for post-mortem debugging of
//! sessions and worker restarts. Disabled unless a directory is configured.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::{Value as JsonValue, json};

pub const DEBUG_EVENTS_DIR_ENV: &str = "PYSANDBOX_DEBUG_EVENTS_DIR";

static LOGGER: OnceLock<Option<Arc<EventLogger>>> = OnceLock::new();

#[derive(Debug)]
struct EventLogger {
    file: Mutex<File>,
    file_path: PathBuf,
    startup_epoch: Instant,
    instance_id: String,
    pid: u32,
    seq: AtomicU64,
}

impl EventLogger {
    fn new(dir: &Path) -> std::io::Result<Self> {
        fs::create_dir_all(dir)?;
        let unix_ms = unix_ms_now();
        let pid = std::process::id();
        let (file, file_path) = create_unique_log_file(dir, unix_ms, pid)?;
        Ok(Self {
            file: Mutex::new(file),
            file_path,
            startup_epoch: Instant::now(),
            instance_id: format!("{unix_ms}-{pid}"),
            pid,
            seq: AtomicU64::new(0),
        })
    }

    fn write_event(&self, event: &str, payload: JsonValue) -> std::io::Result<()> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let line = json!({
            "ts_unix_ms": unix_ms_now(),
            "uptime_ms": self.startup_epoch.elapsed().as_millis(),
            "seq": seq,
            "instance_id": self.instance_id,
            "pid": self.pid,
            "event": event,
            "payload": payload,
        });
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(file, "{line}")?;
        file.flush()
    }
}

/// Enables the log in `dir`, or in `$PYSANDBOX_DEBUG_EVENTS_DIR` when `dir`
/// is `None`. Only the first call has any effect.
pub fn initialize(dir: Option<PathBuf>) -> std::io::Result<Option<PathBuf>> {
    if let Some(existing) = LOGGER.get() {
        return Ok(existing.as_ref().map(|logger| logger.file_path.clone()));
    }
    let logger = match resolve_debug_dir(dir) {
        Some(dir) => {
            let logger = Arc::new(EventLogger::new(&dir)?);
            logger.write_event("startup", startup_payload(&logger.file_path))?;
            Some(logger)
        }
        None => None,
    };
    let path = logger.as_ref().map(|logger| logger.file_path.clone());
    let _ = LOGGER.set(logger);
    Ok(path)
}

pub fn log(event: &str, payload: JsonValue) {
    let Some(logger) = LOGGER.get().and_then(|entry| entry.clone()) else {
        return;
    };
    let _ = logger.write_event(event, payload);
}

fn resolve_debug_dir(dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = dir
        && !path.as_os_str().is_empty()
    {
        return Some(path);
    }
    std::env::var_os(DEBUG_EVENTS_DIR_ENV)
        .filter(|raw| !raw.is_empty())
        .map(PathBuf::from)
}

fn startup_payload(file_path: &Path) -> JsonValue {
    let cwd = std::env::current_dir()
        .ok()
        .map(|path| path.to_string_lossy().to_string());
    json!({
        "cwd": cwd,
        "argv": std::env::args().collect::<Vec<_>>(),
        "log_file": file_path.to_string_lossy().to_string(),
        "version": env!("CARGO_PKG_VERSION"),
    })
}

fn create_unique_log_file(dir: &Path, unix_ms: u128, pid: u32) -> std::io::Result<(File, PathBuf)> {
    for suffix in 0u32..1_000u32 {
        let name = if suffix == 0 {
            format!("pysandbox-{unix_ms}-{pid}.jsonl")
        } else {
            format!("pysandbox-{unix_ms}-{pid}-{suffix}.jsonl")
        };
        let path = dir.join(name);
        match OpenOptions::new().create_new(true).append(true).open(&path) {
            Ok(file) => return Ok((file, path)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(std::io::Error::other(
        "failed to allocate unique event log filename after 1000 attempts",
    ))
}

fn unix_ms_now() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_writes_jsonl_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let logger = EventLogger::new(temp.path()).expect("create logger");
        logger
            .write_event("session_created", json!({"session": "p1_abc_def"}))
            .expect("write event");
        logger
            .write_event("session_cleaned", json!({"session": "p1_abc_def"}))
            .expect("write event");
        let text = std::fs::read_to_string(&logger.file_path).expect("read event log");
        let lines: Vec<JsonValue> = text
            .lines()
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "session_created");
        assert_eq!(lines[1]["seq"], 2);
        assert_eq!(lines[1]["payload"]["session"], "p1_abc_def");
    }

    #[test]
    fn create_unique_log_file_uses_incrementing_suffix_on_collision() {
        let temp = tempfile::tempdir().expect("tempdir");
        let first_path = temp.path().join("pysandbox-123-456.jsonl");
        std::fs::write(&first_path, "{}\n").expect("seed first path");

        let (_file, second_path) =
            create_unique_log_file(temp.path(), 123, 456).expect("allocate second path");
        assert_eq!(
            second_path.file_name().and_then(|name| name.to_str()),
            Some("pysandbox-123-456-1.jsonl")
        );
    }
}
