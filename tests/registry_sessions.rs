mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{TestResult, private_tracker, require_python, test_config};
use pysandbox::{RegistryOptions, SessionConfig, SessionError, SessionRegistry};

fn registry() -> SessionRegistry {
    SessionRegistry::with_options(
        std::process::id(),
        RegistryOptions {
            sweep_interval: Duration::from_secs(60),
            tracker: Some(private_tracker()),
        },
    )
}

#[test]
fn run_isolated_leaves_nothing_behind() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let registry = registry();
    let out = registry.run_isolated(
        test_config(root.path()),
        "import os\nprint(os.getcwd() != '')",
        &[],
    )?;
    assert!(out.success, "{out:?}");
    assert_eq!(out.stdout, "True\n");
    assert_eq!(registry.stats().total, 0);
    assert_eq!(std::fs::read_dir(root.path())?.count(), 0);
    Ok(())
}

#[test]
fn single_use_session_serves_exactly_one_operation() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let registry = registry();
    let config = SessionConfig {
        idle_timeout: Duration::ZERO,
        ..test_config(root.path())
    };
    let session = registry.create_session(config)?;
    let id = session.id().to_string();
    assert!(session.run_code("print('one')", &[])?.success);
    // Spent at once; the sweeper may already have closed it.
    assert!(matches!(
        session.run_code("print('two')", &[]),
        Err(SessionError::Expired(_) | SessionError::Closed(_))
    ));
    drop(session);
    assert!(registry.get_session(&id).is_none());
    Ok(())
}

#[test]
fn single_use_session_releases_worker_without_lookup() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let registry = registry();
    let config = SessionConfig {
        idle_timeout: Duration::ZERO,
        ..test_config(root.path())
    };
    let session = registry.create_session(config)?;
    assert!(session.run_code("print(1)", &[])?.success);
    let pid = session.worker_pid();
    let work_dir = session.work_dir().to_path_buf();
    drop(session);

    // The periodic sweep is a minute away; only the idle timer can do this.
    let deadline = Instant::now() + Duration::from_secs(10);
    while (registry.stats().total > 0 || work_dir.exists()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(registry.stats().total, 0);
    assert!(!work_dir.exists());
    if let Some(pid) = pid {
        // Reaped by the graceful shutdown, so the pid no longer answers.
        assert_ne!(unsafe { libc::kill(pid as i32, 0) }, 0);
    }
    Ok(())
}

#[test]
fn exec_bash_runs_in_work_dir() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let registry = registry();
    let session = registry.create_session(test_config(root.path()))?;
    let id = session.id().to_string();

    let out = registry.exec_bash(&id, "echo hello; pwd; echo oops >&2", 10, &[])?;
    assert!(out.success, "{out:?}");
    assert_eq!(out.exit_code, 0);
    let mut lines = out.stdout.lines();
    assert_eq!(lines.next(), Some("hello"));
    let cwd = std::path::PathBuf::from(lines.next().ok_or("missing pwd")?);
    assert_eq!(cwd.canonicalize()?, session.work_dir().canonicalize()?);
    assert!(out.stderr.contains("oops"));

    let failed = registry.exec_bash(&id, "exit 3", 10, &[])?;
    assert!(!failed.success);
    assert_eq!(failed.exit_code, 3);

    let slow = registry.exec_bash(&id, "sleep 5", 1, &[])?;
    assert!(!slow.success);
    assert!(
        slow.error.as_deref().is_some_and(|e| e.contains("timed out")),
        "{slow:?}"
    );

    // Files written by the shell are visible to Python and vice versa.
    registry.exec_bash(&id, "echo from-shell > shell.txt", 10, &[])?;
    let out = session.run_code("print(open('shell.txt').read().strip())", &[])?;
    assert_eq!(out.stdout, "from-shell\n");
    Ok(())
}

#[test]
fn idle_sessions_are_evicted_with_their_workers() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let root = tempfile::tempdir()?;
    let registry = registry();
    let config = SessionConfig {
        idle_timeout: Duration::from_millis(300),
        ..test_config(root.path())
    };
    let session = registry.create_session(config)?;
    session.run_code("x = 1", &[])?;
    let work_dir = session.work_dir().to_path_buf();
    let id = session.id().to_string();
    drop(session);

    let deadline = Instant::now() + Duration::from_secs(15);
    while (registry.stats().total > 0 || work_dir.exists()) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(registry.stats().total, 0);
    assert!(!work_dir.exists());
    assert!(registry.get_session(&id).is_none());
    Ok(())
}

#[test]
fn ids_are_unique_and_listed() -> TestResult<()> {
    let root = tempfile::tempdir()?;
    let registry = registry();
    let ids: Vec<String> = (0..5)
        .map(|_| registry.create_session(test_config(root.path())))
        .collect::<Result<Vec<_>, _>>()?
        .iter()
        .map(|session| session.id().to_string())
        .collect();
    let prefix = format!("p{}_", std::process::id());
    assert!(ids.iter().all(|id| id.starts_with(&prefix)));

    let mut listed: Vec<String> = registry.list_sessions().into_iter().map(|s| s.id).collect();
    let mut expected = ids.clone();
    listed.sort();
    expected.sort();
    expected.dedup();
    assert_eq!(listed, expected);
    assert_eq!(listed.len(), 5);
    Ok(())
}
