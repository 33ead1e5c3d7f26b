//! End-to-end tests for a full run
//!
//! Covers the flow: config parsing → fan-out connect → task execution →
//! error collection and summary.

use async_trait::async_trait;
use flotilla::endpoints::{Endpoint, TaskScript};
use flotilla::error::{FlotillaError, Result};
use flotilla::executor::TaskExecutor;
use flotilla::models::{EnvList, FailurePolicy};
use flotilla::output::{max_width, Console, Prefix, SharedBuffer};
use flotilla::parser::{parse_config_yaml, resolve_commands, resolve_network};
use flotilla::report::ErrorKind;
use flotilla::runner::{run_environment, RunOptions, Runner};
use flotilla::signal::Interrupts;
use flotilla::tasks::{CommandTranslator, Task};
use std::io::{Cursor, Read, Write};
use std::net::TcpListener;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Endpoint with canned output and exit status
struct FakeEndpoint {
    host: String,
    prefix: Prefix,
    output: Vec<u8>,
    exit_code: Option<i32>,
    fail_start: bool,
    stdout: Mutex<Option<Vec<u8>>>,
}

impl FakeEndpoint {
    fn build(label: &str, output: &str, exit_code: Option<i32>, fail_start: bool) -> Arc<Self> {
        Arc::new(Self {
            host: label.to_string(),
            prefix: Prefix::new(label, None),
            output: output.as_bytes().to_vec(),
            exit_code,
            fail_start,
            stdout: Mutex::new(None),
        })
    }

    fn new(label: &str, output: &str, exit_code: Option<i32>) -> Arc<Self> {
        Self::build(label, output, exit_code, false)
    }

    fn failing_start(label: &str) -> Arc<Self> {
        Self::build(label, "", None, true)
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn host(&self) -> &str {
        &self.host
    }

    fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    async fn start(&self, _script: &TaskScript) -> Result<()> {
        if self.fail_start {
            return Err(FlotillaError::Ssh {
                host: self.host.clone(),
                message: "channel refused".to_string(),
            });
        }
        *self.stdout.lock().unwrap() = Some(self.output.clone());
        Ok(())
    }

    fn stdin(&self) -> Option<Box<dyn Write + Send>> {
        None
    }

    fn stdout(&self) -> Option<Box<dyn Read + Send>> {
        self.stdout
            .lock()
            .unwrap()
            .take()
            .map(|bytes| Box::new(Cursor::new(bytes)) as Box<dyn Read + Send>)
    }

    fn stderr(&self) -> Option<Box<dyn Read + Send>> {
        None
    }

    fn interrupt(&self) -> Result<()> {
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        match self.exit_code {
            Some(code) => Err(FlotillaError::Exit { code }),
            None => Ok(()),
        }
    }

    fn write_close(&self) {}

    async fn close(&self) {}
}

fn captured_console() -> (Console, SharedBuffer, SharedBuffer) {
    let stdout = SharedBuffer::new();
    let stderr = SharedBuffer::new();
    (Console::new(stdout.clone(), stderr.clone()), stdout, stderr)
}

/// A loopback address nothing listens on
fn refused_host() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("tester@127.0.0.1:{}", port)
}

#[tokio::test]
async fn test_localhost_echo() {
    let yaml = r#"
networks:
  local:
    hosts: [localhost]
commands:
  hello:
    run: echo hi
"#;
    let config = parse_config_yaml(yaml).unwrap();
    let network = resolve_network(&config, "local").unwrap();
    let commands = resolve_commands(&config, &["hello".to_string()]).unwrap();
    let env = run_environment(&config, network, &EnvList::new());

    let (console, stdout, stderr) = captured_console();
    let runner = Runner::new(RunOptions::default(), CommandTranslator::new()).with_console(console);
    let report = runner.run(network, &env, &commands).await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert!(report.is_empty());

    let out = stdout.to_string_lossy();
    let line = out.lines().next().unwrap();
    assert!(line.contains("@localhost | "));
    assert!(line.ends_with("hi"));
    assert!(stderr.to_string_lossy().is_empty());
}

#[tokio::test]
async fn test_host_environment_is_exported() {
    let yaml = r#"
env:
  GREETING: hello
networks:
  local:
    hosts: [localhost]
commands:
  show:
    run: echo "$GREETING $FLOTILLA_HOST $FLOTILLA_NETWORK"
"#;
    let config = parse_config_yaml(yaml).unwrap();
    let network = resolve_network(&config, "local").unwrap();
    let commands = resolve_commands(&config, &["show".to_string()]).unwrap();
    let env = run_environment(&config, network, &EnvList::new());

    let (console, stdout, _) = captured_console();
    let options = RunOptions {
        prefix: false,
        ..Default::default()
    };
    Runner::new(options, CommandTranslator::new())
        .with_console(console)
        .run(network, &env, &commands)
        .await
        .unwrap();

    assert_eq!(stdout.to_string_lossy(), "hello localhost local\n");
}

#[tokio::test]
async fn test_unreachable_host_aborts_before_commands() {
    let temp_dir = TempDir::new().unwrap();
    let marker = temp_dir.path().join("ran");

    let yaml = format!(
        r#"
networks:
  broken:
    hosts: ["{}"]
    bastion: ""
commands:
  touch:
    run: touch {}
"#,
        refused_host(),
        marker.display()
    );
    let config = parse_config_yaml(&yaml).unwrap();
    let network = resolve_network(&config, "broken").unwrap();
    let commands = resolve_commands(&config, &["touch".to_string()]).unwrap();

    let (console, _, _) = captured_console();
    let err = Runner::new(RunOptions::default(), CommandTranslator::new())
        .with_console(console)
        .run(network, &EnvList::new(), &commands)
        .await
        .unwrap_err();

    assert!(matches!(err, FlotillaError::Connect { .. }));
    assert_eq!(err.exit_code(), 1);
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_tolerant_run_with_summary() {
    let temp_dir = TempDir::new().unwrap();
    let summary = temp_dir.path().join("summary.json");
    let lock = temp_dir.path().join("lock");

    // Whichever host creates the lock first fails; the other succeeds
    let yaml = format!(
        r#"
networks:
  pair:
    hosts: [localhost, localhost]
commands:
  race:
    run: mkdir {} 2>/dev/null && exit 1; echo survived
"#,
        lock.display()
    );
    let config = parse_config_yaml(&yaml).unwrap();
    let network = resolve_network(&config, "pair").unwrap();
    let commands = resolve_commands(&config, &["race".to_string()]).unwrap();

    let (console, stdout, stderr) = captured_console();
    let options = RunOptions {
        policy: FailurePolicy::Tolerant,
        summary: Some(summary.clone()),
        ..Default::default()
    };
    let report = Runner::new(options, CommandTranslator::new())
        .with_console(console)
        .run(network, &EnvList::new(), &commands)
        .await
        .unwrap();

    assert_eq!(report.exit_code(), 1);
    assert!(stdout.to_string_lossy().contains("survived"));
    assert!(stderr
        .to_string_lossy()
        .contains("Process exited with status 1"));

    let content = std::fs::read_to_string(&summary).unwrap();
    let errors: serde_json::Value = serde_json::from_str(&content).unwrap();
    let errors = errors.as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0]["host"], "localhost");
    assert_eq!(errors[0]["type"], "run");
    assert_eq!(errors[0]["exit_code"], 1);
}

#[tokio::test]
async fn test_tolerant_conn_errors_do_not_fail_the_run() {
    let temp_dir = TempDir::new().unwrap();
    let summary = temp_dir.path().join("summary.json");
    let yaml = format!(
        r#"
networks:
  mixed:
    hosts: [localhost, "{}"]
commands:
  ok:
    run: echo fine
"#,
        refused_host()
    );
    let config = parse_config_yaml(&yaml).unwrap();
    let network = resolve_network(&config, "mixed").unwrap();
    let commands = resolve_commands(&config, &["ok".to_string()]).unwrap();

    let (console, stdout, _) = captured_console();
    let options = RunOptions {
        policy: FailurePolicy::Tolerant,
        summary: Some(summary.clone()),
        ..Default::default()
    };
    let report = Runner::new(options, CommandTranslator::new())
        .with_console(console)
        .run(network, &EnvList::new(), &commands)
        .await
        .unwrap();

    assert_eq!(report.errors().len(), 1);
    assert_eq!(report.errors()[0].kind, ErrorKind::Conn);
    assert_eq!(report.exit_code(), 0);
    assert!(stdout.to_string_lossy().contains("fine"));

    let errors: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&summary).unwrap()).unwrap();
    assert_eq!(errors[0]["type"], "conn");
    assert_eq!(errors[0]["exit_code"], -1);
}

#[tokio::test]
async fn test_prefixes_align_to_widest_host() {
    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        FakeEndpoint::new("abc", "one\n", None),
        FakeEndpoint::new("abcdefg", "two\n", None),
        FakeEndpoint::new("abcde", "three\n", None),
    ];
    let width = max_width(endpoints.iter().map(|e| e.prefix()));
    assert_eq!(width, 7);

    let (console, stdout, _) = captured_console();
    let executor = TaskExecutor::new(FailurePolicy::FailFast, console, Interrupts::new())
        .with_prefix(true, width);
    let errors = executor
        .execute(Task {
            script: TaskScript::new("noop"),
            endpoints,
            input: None,
        })
        .await
        .unwrap();
    assert!(errors.is_empty());

    let out = stdout.to_string_lossy();
    let mut lines: Vec<&str> = out.lines().collect();
    lines.sort();
    assert_eq!(lines, vec!["    abcone", "  abcdethree", "abcdefgtwo"]);
}

#[tokio::test]
async fn test_start_failure_is_fatal_even_when_tolerant() {
    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        FakeEndpoint::new("ok | ", "", None),
        FakeEndpoint::failing_start("broken | "),
    ];

    let (console, _, _) = captured_console();
    let executor = TaskExecutor::new(FailurePolicy::Tolerant, console, Interrupts::new())
        .with_prefix(true, 9);
    let err = executor
        .execute(Task {
            script: TaskScript::new("noop"),
            endpoints,
            input: None,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, FlotillaError::Start { .. }));
    assert!(err.to_string().starts_with("broken | task failed:"));
    assert_eq!(err.exit_code(), 1);
}

#[tokio::test]
async fn test_one_outcome_per_endpoint() {
    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        FakeEndpoint::new("a", "", Some(2)),
        FakeEndpoint::new("b", "", None),
        FakeEndpoint::new("c", "", Some(15)),
        FakeEndpoint::new("d", "", Some(9)),
    ];

    let (console, _, stderr) = captured_console();
    let executor = TaskExecutor::new(FailurePolicy::Tolerant, console, Interrupts::new());
    let errors = executor
        .execute(Task {
            script: TaskScript::new("noop"),
            endpoints,
            input: None,
        })
        .await
        .unwrap();

    let recorded: Vec<(&str, i32)> = errors
        .iter()
        .map(|e| (e.host.as_str(), e.exit_code))
        .collect();
    assert_eq!(recorded, vec![("a", 2), ("c", 15), ("d", 9)]);
    assert_eq!(stderr.to_string_lossy().lines().count(), 3);
}

#[tokio::test]
async fn test_interrupt_exit_code_does_not_abort_fail_fast() {
    let endpoints: Vec<Arc<dyn Endpoint>> = vec![
        FakeEndpoint::new("a", "partial\n", Some(15)),
        FakeEndpoint::new("b", "done\n", None),
    ];

    let (console, stdout, stderr) = captured_console();
    let executor = TaskExecutor::new(FailurePolicy::FailFast, console, Interrupts::new());
    let errors = executor
        .execute(Task {
            script: TaskScript::new("noop"),
            endpoints,
            input: None,
        })
        .await
        .unwrap();

    assert!(errors.is_empty());
    assert!(stdout.to_string_lossy().contains("partial"));
    assert!(stderr.to_string_lossy().contains("status 15"));
}
