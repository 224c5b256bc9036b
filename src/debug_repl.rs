use std::io::{self, BufRead, Write};
use std::sync::Arc;

use serde::Serialize;

use pysandbox::{CodeOutput, Session, SessionConfig, SessionError, SessionRegistry, ShellOutput};

const DEFAULT_BASH_TIMEOUT_SECS: u64 = 60;

pub(crate) fn run(
    registry: &SessionRegistry,
    config: SessionConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    // Lives until EOF rather than idling out under the user.
    let config = SessionConfig {
        auto_cleanup: false,
        ..config
    };
    let session = registry.create_session(config)?;
    eprintln!(
        "debug repl: session {} | end code with END | commands: STATUS, PING, RESTART, INFO, ENV, BASH <cmd>, EVAL <expr>, INSTALL <pkgs> | Ctrl-D to exit",
        session.id()
    );

    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    let stdin = io::stdin();
    let mut stdin = stdin.lock();

    loop {
        let Some(line) = read_line(&mut stdin)? else {
            break;
        };
        let trimmed = line.trim_end_matches(['\n', '\r']);

        if let Some(result) = run_command(&session, trimmed, &mut stdout, &mut stderr) {
            if let Err(err) = result {
                report_error(&err, &mut stderr)?;
            }
            continue;
        }

        let (chunk, done) = split_end_marker(&line);
        let mut input = chunk;
        if !done {
            loop {
                let Some(next) = read_line(&mut stdin)? else {
                    return Err("EOF reached while reading input; expected END".into());
                };
                let (chunk, done) = split_end_marker(&next);
                input.push_str(&chunk);
                if done {
                    break;
                }
            }
        }
        if input.trim().is_empty() {
            continue;
        }

        match session.run_code(&input, &[]) {
            Ok(output) => render_code_output(&output, &mut stdout, &mut stderr)?,
            Err(err) => report_error(&err, &mut stderr)?,
        }
    }

    registry.remove_session(session.id());
    Ok(())
}

/// Handles one exact-line command. `None` means the line is code.
fn run_command(
    session: &Arc<Session>,
    line: &str,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> Option<Result<(), SessionError>> {
    let (command, argument) = match line.split_once(' ') {
        Some((command, argument)) => (command, argument.trim()),
        None => (line, ""),
    };
    let result = match (command, argument.is_empty()) {
        ("STATUS", true) => session
            .get_status()
            .and_then(|status| render_json(&status, stdout)),
        ("INFO", true) => render_json(&session.info(), stdout),
        ("PING", true) => session
            .ping()
            .and_then(|timestamp| writeln!(stdout, "PONG {timestamp:.3}").map_err(SessionError::Io)),
        ("RESTART", true) => session
            .restart_worker()
            .and_then(|()| writeln!(stderr, "[pysandbox] worker restarted").map_err(SessionError::Io)),
        ("ENV", true) => session
            .environment_info()
            .and_then(|output| render_code_output(&output, stdout, stderr).map_err(SessionError::Io)),
        ("BASH", false) => session
            .exec_bash(argument, DEFAULT_BASH_TIMEOUT_SECS, &[])
            .and_then(|output| render_shell_output(&output, stdout, stderr).map_err(SessionError::Io)),
        ("EVAL", false) => session.evaluate_expression(argument).and_then(|outcome| {
            let written = match outcome.error {
                Some(error) => writeln!(stderr, "[pysandbox] error: {error}"),
                None => writeln!(stdout, "{}", outcome.result),
            };
            written.map_err(SessionError::Io)
        }),
        ("INSTALL", false) => {
            let packages: Vec<String> = argument.split_whitespace().map(str::to_string).collect();
            session.install_packages(&packages).and_then(|outcome| {
                let written = if outcome.success {
                    writeln!(stderr, "[pysandbox] {}", outcome.message)
                } else {
                    writeln!(stderr, "[pysandbox] install failed: {}\n{}", outcome.message, outcome.stderr)
                };
                written.map_err(SessionError::Io)
            })
        }
        _ => return None,
    };
    Some(result)
}

fn read_line(reader: &mut impl BufRead) -> io::Result<Option<String>> {
    let mut line = String::new();
    let bytes = reader.read_line(&mut line)?;
    if bytes == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

fn split_end_marker(line: &str) -> (String, bool) {
    let (body, newline) = split_line_ending(line);
    if let Some(prefix) = body.strip_suffix("END") {
        return (prefix.to_string(), true);
    }
    (format!("{body}{newline}"), false)
}

fn split_line_ending(line: &str) -> (&str, &str) {
    if let Some(stripped) = line.strip_suffix("\r\n") {
        (stripped, "\n")
    } else if let Some(stripped) = line.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (line, "")
    }
}

fn render_json<T: Serialize>(value: &T, stdout: &mut impl Write) -> Result<(), SessionError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| SessionError::Io(io::Error::other(err)))?;
    writeln!(stdout, "{text}")?;
    Ok(())
}

pub(crate) fn render_code_output(
    output: &CodeOutput,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> io::Result<()> {
    stdout.write_all(output.stdout.as_bytes())?;
    stderr.write_all(output.stderr.as_bytes())?;
    if !output.success {
        match (&output.error_type, &output.error) {
            (Some(kind), Some(error)) => writeln!(stderr, "[pysandbox] error: {kind}: {error}")?,
            (None, Some(error)) => writeln!(stderr, "[pysandbox] error: {error}")?,
            _ => writeln!(stderr, "[pysandbox] error")?,
        }
    }
    stdout.flush()?;
    stderr.flush()
}

fn render_shell_output(
    output: &ShellOutput,
    stdout: &mut impl Write,
    stderr: &mut impl Write,
) -> io::Result<()> {
    stdout.write_all(output.stdout.as_bytes())?;
    stderr.write_all(output.stderr.as_bytes())?;
    if let Some(error) = &output.error {
        writeln!(stderr, "[pysandbox] error: {error}")?;
    } else if output.exit_code != 0 {
        writeln!(stderr, "[pysandbox] exit code {}", output.exit_code)?;
    }
    stdout.flush()?;
    stderr.flush()
}

pub(crate) fn report_error(err: &SessionError, stderr: &mut impl Write) -> io::Result<()> {
    writeln!(stderr, "[pysandbox] {:?} error: {err}", err.kind())?;
    stderr.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_marker_terminates_a_block() {
        assert_eq!(split_end_marker("print(1)END\n"), ("print(1)".to_string(), true));
        assert_eq!(split_end_marker("END\r\n"), (String::new(), true));
        assert_eq!(split_end_marker("x = 1\r\n"), ("x = 1\n".to_string(), false));
    }

    #[test]
    fn failed_output_reports_error_type() {
        let output = CodeOutput {
            success: false,
            stderr: "Traceback\n".to_string(),
            returncode: 1,
            error: Some("boom".to_string()),
            error_type: Some("ValueError".to_string()),
            ..CodeOutput::default()
        };
        let mut out = Vec::new();
        let mut err = Vec::new();
        render_code_output(&output, &mut out, &mut err).expect("render");
        assert!(out.is_empty());
        assert_eq!(
            String::from_utf8(err).expect("utf8"),
            "Traceback\n[pysandbox] error: ValueError: boom\n"
        );
    }
}
