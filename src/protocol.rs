//! Line-oriented JSON protocol spoken between a session and its worker.
//!
//! Every command is one JSON object on one line of the worker's stdin. The
//! worker answers each with exactly one JSON line, and emits a single
//! unsolicited `READY` line after startup.

use serde::{Deserialize, Serialize};

/// Sent as a bare line (not JSON) to request a graceful shutdown.
pub const EXIT_LINE: &str = "EXIT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(flatten)]
    pub body: CommandBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandBody {
    Exec { code: String },
    Eval { code: String },
    Install { packages: Vec<String> },
    Status,
    Ping,
}

impl CommandBody {
    pub fn name(&self) -> &'static str {
        match self {
            CommandBody::Exec { .. } => "EXEC",
            CommandBody::Eval { .. } => "EVAL",
            CommandBody::Install { .. } => "INSTALL",
            CommandBody::Status => "STATUS",
            CommandBody::Ping => "PING",
        }
    }

    /// STATUS and PING carry no execution deadline on the wire.
    fn carries_timeout(&self) -> bool {
        !matches!(self, CommandBody::Status | CommandBody::Ping)
    }
}

impl Command {
    pub fn new(id: impl Into<String>, timeout_secs: u64, body: CommandBody) -> Self {
        let timeout = body.carries_timeout().then_some(timeout_secs);
        Self {
            id: id.into(),
            timeout,
            body,
        }
    }

    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_type: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub traceback: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Response {
    Ready {
        #[serde(default)]
        session_id: String,
    },
    Success {
        #[serde(default)]
        id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    Error(ErrorBody),
    FatalError(ErrorBody),
    Result {
        #[serde(default)]
        id: String,
        #[serde(default)]
        value: String,
    },
    InstallSuccess {
        #[serde(default)]
        id: String,
        #[serde(default)]
        message: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    InstallError {
        #[serde(default)]
        id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
    },
    Status {
        #[serde(default)]
        id: String,
        #[serde(default)]
        global_variables: Vec<String>,
        #[serde(default)]
        imported_modules: Vec<String>,
        #[serde(default)]
        total_modules: usize,
    },
    Pong {
        #[serde(default)]
        id: String,
        #[serde(default)]
        timestamp: f64,
    },
    Exit {
        #[serde(default)]
        session_id: String,
    },
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Ready { .. } => "READY",
            Response::Success { .. } => "SUCCESS",
            Response::Error(_) => "ERROR",
            Response::FatalError(_) => "FATAL_ERROR",
            Response::Result { .. } => "RESULT",
            Response::InstallSuccess { .. } => "INSTALL_SUCCESS",
            Response::InstallError { .. } => "INSTALL_ERROR",
            Response::Status { .. } => "STATUS",
            Response::Pong { .. } => "PONG",
            Response::Exit { .. } => "EXIT",
        }
    }

    /// Correlation id of the command this answers, if the reply carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Response::Ready { .. } | Response::Exit { .. } => None,
            Response::Error(body) | Response::FatalError(body) => Some(&body.id),
            Response::Success { id, .. }
            | Response::Result { id, .. }
            | Response::InstallSuccess { id, .. }
            | Response::InstallError { id, .. }
            | Response::Status { id, .. }
            | Response::Pong { id, .. } => Some(id),
        }
    }

    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_command_wire_format() {
        let command = Command::new(
            "cmd_1",
            30,
            CommandBody::Exec {
                code: "print('hi')\n".to_string(),
            },
        );
        let line = command.to_line().expect("serialize");
        insta::assert_snapshot!(line.trim_end(), @r#"{"id":"cmd_1","timeout":30,"type":"EXEC","code":"print('hi')\n"}"#);
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn status_and_ping_omit_timeout() {
        let line = Command::new("cmd_2", 30, CommandBody::Status)
            .to_line()
            .expect("serialize");
        insta::assert_snapshot!(line.trim_end(), @r#"{"id":"cmd_2","type":"STATUS"}"#);
        let line = Command::new("cmd_3", 5, CommandBody::Ping)
            .to_line()
            .expect("serialize");
        insta::assert_snapshot!(line.trim_end(), @r#"{"id":"cmd_3","type":"PING"}"#);
    }

    #[test]
    fn install_command_lists_packages() {
        let command = Command::new(
            "cmd_4",
            300,
            CommandBody::Install {
                packages: vec!["numpy".into(), "requests==2.31".into()],
            },
        );
        let value: serde_json::Value =
            serde_json::from_str(&command.to_line().expect("serialize")).expect("json");
        assert_eq!(value["type"], "INSTALL");
        assert_eq!(value["timeout"], 300);
        assert_eq!(value["packages"][1], "requests==2.31");
    }

    #[test]
    fn parses_every_response_kind() {
        let cases = [
            (r#"{"type":"READY","session_id":"s1"}"#, "READY"),
            (r#"{"type":"SUCCESS","id":"cmd_1","stdout":"1\n","stderr":""}"#, "SUCCESS"),
            (
                r#"{"type":"ERROR","id":"cmd_1","error":"boom","error_type":"ValueError","stdout":"","stderr":"","traceback":"tb"}"#,
                "ERROR",
            ),
            (r#"{"type":"FATAL_ERROR","id":"cmd_1","error":"bad"}"#, "FATAL_ERROR"),
            (r#"{"type":"RESULT","id":"cmd_1","value":"2"}"#, "RESULT"),
            (r#"{"type":"INSTALL_SUCCESS","id":"cmd_1","message":"ok"}"#, "INSTALL_SUCCESS"),
            (r#"{"type":"INSTALL_ERROR","id":"cmd_1","error":"no net"}"#, "INSTALL_ERROR"),
            (
                r#"{"type":"STATUS","id":"cmd_1","global_variables":["x"],"imported_modules":["os"]}"#,
                "STATUS",
            ),
            (r#"{"type":"PONG","id":"cmd_1","timestamp":1700000000.5}"#, "PONG"),
            (r#"{"type":"EXIT","session_id":"s1"}"#, "EXIT"),
        ];
        for (line, kind) in cases {
            let response = Response::parse(line).unwrap_or_else(|err| panic!("{line}: {err}"));
            assert_eq!(response.kind(), kind);
        }
    }

    #[test]
    fn error_response_keeps_details() {
        let response = Response::parse(
            r#"{"type":"ERROR","id":"cmd_7","error":"name 'y' is not defined","error_type":"NameError","stdout":"partial\n","stderr":"","traceback":"Traceback..."}"#,
        )
        .expect("parse");
        let Response::Error(body) = response else {
            panic!("expected ERROR");
        };
        assert_eq!(body.id, "cmd_7");
        assert_eq!(body.error_type, "NameError");
        assert_eq!(body.stdout, "partial\n");
    }

    #[test]
    fn unknown_type_is_rejected() {
        assert!(Response::parse(r#"{"type":"MYSTERY","id":"x"}"#).is_err());
        assert!(Response::parse("not json").is_err());
    }

    #[test]
    fn ready_has_no_correlation_id() {
        let response = Response::parse(r#"{"type":"READY","session_id":"s"}"#).expect("parse");
        assert_eq!(response.id(), None);
        let response = Response::parse(r#"{"type":"PONG","id":"cmd_9","timestamp":1.0}"#).expect("parse");
        assert_eq!(response.id(), Some("cmd_9"));
    }
}
