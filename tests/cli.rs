mod common;

use std::path::PathBuf;
use std::process::Command;

use common::{TestResult, require_python};

fn pysandbox() -> Command {
    Command::new(PathBuf::from(env!("CARGO_BIN_EXE_pysandbox")))
}

#[test]
fn run_prints_output_and_propagates_failure() -> TestResult<()> {
    if !require_python() {
        return Ok(());
    }
    let temp = tempfile::tempdir()?;
    let ok_file = temp.path().join("ok.py");
    let bad_file = temp.path().join("bad.py");
    std::fs::write(&ok_file, "total = sum(range(5))\nprint(total)\n")?;
    std::fs::write(&bad_file, "raise ValueError('nope')\n")?;
    let roots = temp.path().join("sessions");

    let ok = pysandbox()
        .args(["--no-venv", "--work-dir-root"])
        .arg(&roots)
        .arg("run")
        .arg(&ok_file)
        .output()?;
    assert!(ok.status.success(), "stderr: {}", String::from_utf8_lossy(&ok.stderr));
    assert_eq!(String::from_utf8(ok.stdout)?, "10\n");

    let bad = pysandbox()
        .args(["--no-venv", "--work-dir-root"])
        .arg(&roots)
        .arg("run")
        .arg(&bad_file)
        .output()?;
    assert_eq!(bad.status.code(), Some(1));
    let stderr = String::from_utf8(bad.stderr)?;
    assert!(stderr.contains("ValueError: nope"), "stderr: {stderr}");

    // Single-use sessions leave no work directories behind.
    assert_eq!(std::fs::read_dir(&roots)?.count(), 0);
    Ok(())
}

#[test]
fn invalid_limits_are_reported() -> TestResult<()> {
    let output = pysandbox()
        .args(["--memory-mb", "0", "run", "missing.py"])
        .output()?;
    assert!(!output.status.success());
    let stderr = String::from_utf8(output.stderr)?;
    assert!(stderr.contains("memory_limit_mb"), "stderr: {stderr}");
    Ok(())
}
