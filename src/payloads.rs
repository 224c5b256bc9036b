//! Python snippets the session sends as EXEC commands on its own behalf.
//! Values are embedded as JSON literals, which are valid Python literals, so
//! no hand escaping is involved.

use serde::Deserialize;
use uuid::Uuid;

const SHELL_TEMPLATE: &str = r#"def __sandbox_shell():
    import json, os, shutil, subprocess
    venv = __VENV__
    env = dict(os.environ)
    if venv and os.path.isdir(venv):
        env["VIRTUAL_ENV"] = venv
        env["PATH"] = os.path.join(venv, "bin") + os.pathsep + env.get("PATH", "")
        env.pop("PYTHONHOME", None)
    env["PYTHONPATH"] = __WORK_DIR__
    shell = shutil.which("bash") or "/bin/sh"
    try:
        done = subprocess.run(
            [shell, "-c", __COMMAND__],
            capture_output=True,
            text=True,
            timeout=__TIMEOUT__,
            env=env,
            cwd=__WORK_DIR__,
            stdin=subprocess.DEVNULL,
        )
        result = {"success": done.returncode == 0, "stdout": done.stdout, "stderr": done.stderr, "exit_code": done.returncode}
    except subprocess.TimeoutExpired:
        result = {"success": False, "stdout": "", "stderr": "", "exit_code": -1, "error": "command timed out after %s seconds" % __TIMEOUT__}
    except Exception as exc:
        result = {"success": False, "stdout": "", "stderr": "", "exit_code": -1, "error": str(exc)}
    print(__BEGIN__)
    print(json.dumps(result))
    print(__END__)
try:
    __sandbox_shell()
finally:
    del __sandbox_shell
"#;

const REFRESH_TEMPLATE: &str = r#"def __sandbox_refresh():
    import importlib, sys
    path = __PATH__
    if path is not None and path not in sys.path:
        sys.path.insert(0, path)
    importlib.invalidate_caches()
try:
    __sandbox_refresh()
finally:
    del __sandbox_refresh
"#;

pub(crate) const ENVIRONMENT_REPORT: &str = r#"def __sandbox_environment():
    import os, subprocess, sys
    print("Python executable: %s" % sys.executable)
    print("Virtual env: %s" % os.environ.get("VIRTUAL_ENV", "not set"))
    print("Working directory: %s" % os.getcwd())
    try:
        pip = subprocess.run([sys.executable, "-m", "pip", "--version"], capture_output=True, text=True, stdin=subprocess.DEVNULL)
        print("Pip: %s" % (pip.stdout.strip() or "unavailable"))
        listing = subprocess.run([sys.executable, "-m", "pip", "list", "--format=freeze"], capture_output=True, text=True, stdin=subprocess.DEVNULL)
        packages = [line for line in listing.stdout.splitlines() if line.strip()]
        print("Installed packages: %d" % len(packages))
        for line in packages[:5]:
            print("  - %s" % line)
    except Exception as exc:
        print("Package check failed: %s" % exc)
try:
    __sandbox_environment()
finally:
    del __sandbox_environment
"#;

fn literal<T: serde::Serialize + ?Sized>(value: &T) -> String {
    // Strings, numbers, and null serialize infallibly.
    serde_json::to_string(value).unwrap_or_else(|_| "None".to_string())
}

/// An EXEC payload running `command` through a shell, with its result
/// framed between two random markers in the captured stdout.
#[derive(Debug, Clone)]
pub(crate) struct ShellPayload {
    pub code: String,
    begin: String,
    end: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub(crate) struct ShellResult {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub error: Option<String>,
}

impl ShellPayload {
    pub(crate) fn new(command: &str, timeout_secs: u64, work_dir: &str, venv: Option<&str>) -> Self {
        let token = Uuid::new_v4().simple().to_string();
        let begin = format!("__SANDBOX_SHELL_BEGIN_{token}__");
        let end = format!("__SANDBOX_SHELL_END_{token}__");
        let code = SHELL_TEMPLATE
            .replace("__VENV__", &venv.map(literal).unwrap_or_else(|| "None".to_string()))
            .replace("__WORK_DIR__", &literal(work_dir))
            .replace("__TIMEOUT__", &timeout_secs.to_string())
            .replace("__BEGIN__", &literal(&begin))
            .replace("__END__", &literal(&end))
            // Last, so placeholder-like text inside the command survives.
            .replace("__COMMAND__", &literal(command));
        Self { code, begin, end }
    }

    /// Pulls the framed result out of the EXEC stdout.
    pub(crate) fn extract(&self, stdout: &str) -> Option<ShellResult> {
        let start = stdout.find(&self.begin)? + self.begin.len();
        let length = stdout[start..].find(&self.end)?;
        serde_json::from_str(stdout[start..start + length].trim()).ok()
    }
}

pub(crate) fn refresh_imports(sys_path_entry: Option<&str>) -> String {
    let path = sys_path_entry.map(literal).unwrap_or_else(|| "None".to_string());
    REFRESH_TEMPLATE.replace("__PATH__", &path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_payload_embeds_command_as_literal() {
        let payload = ShellPayload::new("echo \"hi\" 'there'\nls", 30, "/tmp/w", None);
        assert!(payload.code.contains(r#"[shell, "-c", "echo \"hi\" 'there'\nls"]"#));
        assert!(payload.code.contains("venv = None"));
        assert!(payload.code.contains("timeout=30,"));
        assert!(!payload.code.contains("__COMMAND__"));
        assert!(!payload.code.contains("__TIMEOUT__"));
    }

    #[test]
    fn markers_are_unique_per_payload() {
        let a = ShellPayload::new("true", 1, "/w", None);
        let b = ShellPayload::new("true", 1, "/w", None);
        assert_ne!(a.begin, b.begin);
    }

    #[test]
    fn extracts_framed_result_among_other_output() {
        let payload = ShellPayload::new("ls", 5, "/w", Some("/w/venv"));
        let stdout = format!(
            "noise before\n{}\n{}\n{}\ntrailing\n",
            payload.begin,
            r#"{"success": true, "stdout": "a.txt\n", "stderr": "", "exit_code": 0}"#,
            payload.end
        );
        let result = payload.extract(&stdout).expect("framed result");
        assert!(result.success);
        assert_eq!(result.stdout, "a.txt\n");
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.error, None);
    }

    #[test]
    fn missing_or_foreign_markers_yield_none() {
        let payload = ShellPayload::new("ls", 5, "/w", None);
        let other = ShellPayload::new("ls", 5, "/w", None);
        assert!(payload.extract("nothing here").is_none());
        let stdout = format!("{}\n{{}}\n{}\n", other.begin, other.end);
        assert!(payload.extract(&stdout).is_none());
    }

    #[test]
    fn refresh_payload_inserts_path_only_when_given() {
        assert!(refresh_imports(Some("/w/libs")).contains(r#"path = "/w/libs""#));
        assert!(refresh_imports(None).contains("path = None"));
    }
}
