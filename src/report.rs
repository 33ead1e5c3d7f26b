//! Per-host failures collected over a run, and the JSON summary

use crate::error::{FlotillaError, Result};
use serde::ser::{Serialize, SerializeStruct, Serializer};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};

/// Exit code recorded for hosts that never connected
pub const CONNECT_EXIT_CODE: i32 = -1;

/// Phase a host failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Conn,
    Run,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Conn => write!(f, "conn"),
            ErrorKind::Run => write!(f, "run"),
        }
    }
}

/// One recorded host failure
#[derive(Debug)]
pub struct ClientError {
    pub host: String,
    pub kind: ErrorKind,
    pub error: FlotillaError,
    pub exit_code: i32,
}

/// Summary form: `error` holds the phase-qualified message, e.g. `run: ...`
impl Serialize for ClientError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("ClientError", 4)?;
        state.serialize_field("host", &self.host)?;
        state.serialize_field("type", &self.kind)?;
        state.serialize_field("error", &self.to_string())?;
        state.serialize_field("exit_code", &self.exit_code)?;
        state.end()
    }
}

impl ClientError {
    /// Connection phase failure
    pub fn conn(host: impl Into<String>, error: FlotillaError) -> Self {
        Self {
            host: host.into(),
            kind: ErrorKind::Conn,
            error,
            exit_code: CONNECT_EXIT_CODE,
        }
    }

    /// Failure of a started command. Errors without an exit code count as 1.
    pub fn run(host: impl Into<String>, error: FlotillaError) -> Self {
        let exit_code = error.process_exit_code().unwrap_or(1);
        Self {
            host: host.into(),
            kind: ErrorKind::Run,
            error,
            exit_code,
        }
    }
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.error)
    }
}

/// Every failure recorded during a run, in the order it happened
#[derive(Debug, Default)]
pub struct RunReport {
    errors: Vec<ClientError>,
}

impl RunReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, error: ClientError) {
        debug!("Recording {} error for {}", error.kind, error.host);
        self.errors.push(error);
    }

    pub fn extend(&mut self, errors: impl IntoIterator<Item = ClientError>) {
        for error in errors {
            self.record(error);
        }
    }

    pub fn errors(&self) -> &[ClientError] {
        &self.errors
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// 0 unless some failure happened after connecting
    pub fn exit_code(&self) -> i32 {
        if self.errors.iter().any(|e| e.kind != ErrorKind::Conn) {
            1
        } else {
            0
        }
    }

    /// Append the recorded errors to `path` as one JSON array
    pub fn write_summary(&self, path: &Path) -> Result<()> {
        let summary_error = |message: String| FlotillaError::Summary {
            path: path.display().to_string(),
            message,
        };

        let json = serde_json::to_string_pretty(&self.errors)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| summary_error(e.to_string()))?;
        writeln!(file, "{}", json).map_err(|e| summary_error(e.to_string()))?;

        info!(
            "Wrote {} errors to summary {}",
            self.errors.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn test_client_error_codes() {
        let conn = ClientError::conn(
            "web1",
            FlotillaError::Connect {
                host: "web1:22".to_string(),
                message: "refused".to_string(),
            },
        );
        assert_eq!(conn.exit_code, -1);
        assert_eq!(conn.kind, ErrorKind::Conn);

        let run = ClientError::run("web2", FlotillaError::Exit { code: 4 });
        assert_eq!(run.exit_code, 4);

        let lost = ClientError::run(
            "web3",
            FlotillaError::Ssh {
                host: "web3".to_string(),
                message: "channel closed".to_string(),
            },
        );
        assert_eq!(lost.exit_code, 1);
    }

    #[test]
    fn test_exit_code_ignores_conn_errors() {
        let mut report = RunReport::new();
        assert_eq!(report.exit_code(), 0);

        report.record(ClientError::conn(
            "badhost",
            FlotillaError::Connect {
                host: "badhost:22".to_string(),
                message: "no route".to_string(),
            },
        ));
        assert_eq!(report.exit_code(), 0);

        report.record(ClientError::run("web1", FlotillaError::Exit { code: 7 }));
        assert_eq!(report.exit_code(), 1);
    }

    #[test]
    fn test_serialized_shape() {
        let error = ClientError::run("web1", FlotillaError::Exit { code: 1 });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["host"], "web1");
        assert_eq!(value["type"], "run");
        assert_eq!(value["error"], "run: Process exited with status 1");
        assert_eq!(value["exit_code"], 1);

        let conn = ClientError::conn(
            "web2",
            FlotillaError::Connect {
                host: "web2:22".to_string(),
                message: "refused".to_string(),
            },
        );
        let value = serde_json::to_value(&conn).unwrap();
        assert_eq!(value["error"], "conn: connecting to web2:22 failed: refused");
        assert_eq!(value["exit_code"], -1);
    }

    #[test]
    fn test_write_summary_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");

        let mut report = RunReport::new();
        report.record(ClientError::run("web1", FlotillaError::Exit { code: 2 }));
        report.write_summary(&path).unwrap();
        report.write_summary(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let arrays: Vec<Value> = serde_json::Deserializer::from_str(&content)
            .into_iter::<Value>()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(arrays.len(), 2);
        assert_eq!(arrays[0].as_array().unwrap().len(), 1);
        assert_eq!(arrays[1][0]["exit_code"], 2);
    }

    #[test]
    fn test_write_summary_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("summary.json");

        let err = RunReport::new().write_summary(&path).unwrap_err();
        assert!(matches!(err, FlotillaError::Summary { .. }));
        assert_eq!(err.exit_code(), 2);
    }
}
