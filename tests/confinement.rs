mod common;

use std::fs;

use common::{TestResult, start_session};
use pysandbox::{ImportOptions, SessionError};

#[test]
fn python_open_is_confined_to_work_dir() -> TestResult<()> {
    let Some(t) = start_session("open")? else {
        return Ok(());
    };
    let inside = t
        .session
        .run_code("with open('notes/../inside.txt', 'w') as f:\n    f.write('hi')", &[])?;
    assert!(inside.success, "{inside:?}");
    assert_eq!(t.session.read_file("inside.txt")?, "hi");

    let outside = t.root.path().join("escape.txt");
    for target in ["../escape.txt".to_string(), outside.display().to_string()] {
        let code = format!("open({target:?}, 'w').write('x')");
        let out = t.session.run_code(&code, &[])?;
        assert!(!out.success, "{target} should be refused");
        assert_eq!(out.error_type.as_deref(), Some("PermissionError"));
    }
    assert!(!outside.exists());
    Ok(())
}

#[test]
fn host_side_file_helpers_reject_escapes() -> TestResult<()> {
    let Some(t) = start_session("helpers")? else {
        return Ok(());
    };
    let saved = t.session.save_file("data/input.csv", "a,b\n1,2\n")?;
    assert!(saved.starts_with(t.session.work_dir().canonicalize()?));

    let out = t
        .session
        .run_code("print(open('data/input.csv').read().splitlines()[1])", &[])?;
    assert_eq!(out.stdout, "1,2\n");

    assert!(matches!(
        t.session.save_file("../../outside.txt", "x"),
        Err(SessionError::Confinement { .. })
    ));
    assert!(matches!(
        t.session.read_file("/etc/hostname"),
        Err(SessionError::Confinement { .. })
    ));
    Ok(())
}

#[test]
fn imported_package_is_importable_without_restart() -> TestResult<()> {
    let Some(t) = start_session("import")? else {
        return Ok(());
    };
    let host = tempfile::tempdir()?;
    let pkg = host.path().join("helpers");
    fs::create_dir_all(pkg.join("__pycache__"))?;
    fs::write(pkg.join("sandbox_helper_mod.py"), "VALUE = 7\n")?;
    fs::write(pkg.join("__pycache__/junk.pyc"), "")?;

    // Start the worker first so the refresh path is exercised.
    t.session.run_code("import sys", &[])?;
    let pid = t.session.worker_pid();

    let copied = t.session.put_into_sandbox(&pkg, "libs", true)?;
    assert_eq!(copied.len(), 1);
    assert!(copied[0].join("sandbox_helper_mod.py").is_file());
    assert!(!copied[0].join("__pycache__").exists());

    let out = t
        .session
        .run_code("import sandbox_helper_mod\nprint(sandbox_helper_mod.VALUE)", &[])?;
    assert!(out.success, "{out:?}");
    assert_eq!(out.stdout, "7\n");
    assert_eq!(t.session.worker_pid(), pid);
    Ok(())
}

#[test]
fn put_many_lands_inside_destination() -> TestResult<()> {
    let Some(t) = start_session("many")? else {
        return Ok(());
    };
    let host = tempfile::tempdir()?;
    let a = host.path().join("a.txt");
    let b = host.path().join("b.txt");
    fs::write(&a, "A")?;
    fs::write(&b, "B")?;

    let copied = t
        .session
        .put_many_into_sandbox(&[&a, &b], "inbox", &ImportOptions::default())?;
    assert_eq!(copied.len(), 2);
    assert_eq!(t.session.read_file("inbox/a.txt")?, "A");
    assert_eq!(t.session.read_file("inbox/b.txt")?, "B");

    let keep = ImportOptions {
        overwrite: false,
        ..ImportOptions::default()
    };
    fs::write(&a, "changed")?;
    assert!(matches!(
        t.session.put_many_into_sandbox(&[&a], "inbox/a.txt", &keep),
        Err(SessionError::TargetExists(_))
    ));
    assert!(matches!(
        t.session.put_into_sandbox(host.path().join("missing"), "x", false),
        Err(SessionError::SourceMissing(_))
    ));
    assert!(matches!(
        t.session.put_into_sandbox(&a, "../a.txt", false),
        Err(SessionError::Confinement { .. })
    ));
    Ok(())
}
