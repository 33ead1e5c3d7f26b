//! Local endpoint: runs commands through `bash -c` on this machine

use crate::endpoints::{host_preamble, signal_name, Endpoint, TaskScript};
use crate::error::{FlotillaError, Result};
use crate::models::LOCALHOST;
use crate::output::Prefix;
use async_trait::async_trait;
use std::io::{Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Endpoint backed by local subprocesses
pub struct LocalEndpoint {
    host: String,
    env: String,
    prefix: Prefix,
    state: Mutex<LocalState>,
}

#[derive(Default)]
struct LocalState {
    /// Present between `start` and `wait`
    child: Option<Child>,
    /// Present until the command has been reaped
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl LocalEndpoint {
    /// Create a local endpoint. `env` is the run-level export preamble.
    pub fn connect(env: &str, color: Option<&str>) -> Result<Self> {
        let user = whoami::username();
        let prefix = Prefix::new(&format!("{}@{} | ", user, LOCALHOST), color);
        debug!("Local endpoint ready for {}", user);

        Ok(Self {
            host: LOCALHOST.to_string(),
            env: host_preamble(env, LOCALHOST),
            prefix,
            state: Mutex::new(LocalState::default()),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Map a finished process onto the endpoint outcome
fn classify_status(status: ExitStatus) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(FlotillaError::Exit { code });
    }
    let signal = status.signal().unwrap_or(libc::SIGTERM);
    Err(FlotillaError::Signaled {
        signal: signal_name(signal),
        number: signal,
    })
}

/// Signal the process group led by `pid`
fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    // SAFETY: kill(2) has no memory-safety preconditions; the group is led by
    // a child we spawned and have not reaped yet.
    let rc = unsafe { libc::kill(-(pid as libc::pid_t), signal) };
    if rc == -1 {
        return Err(FlotillaError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[async_trait]
impl Endpoint for LocalEndpoint {
    fn host(&self) -> &str {
        &self.host
    }

    fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    async fn start(&self, script: &TaskScript) -> Result<()> {
        let mut state = self.state();
        if state.pid.is_some() {
            return Err(FlotillaError::Validation(format!(
                "{}: a command is already running",
                self.host
            )));
        }

        info!("Starting local command");
        debug!("Local script: {}", script.body);

        let mut child = Command::new("bash")
            .arg("-c")
            .arg(format!("{}{}", self.env, script.body))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()?;

        state.pid = Some(child.id());
        state.stdin = child.stdin.take();
        state.stdout = child.stdout.take();
        state.stderr = child.stderr.take();
        state.child = Some(child);
        Ok(())
    }

    fn stdin(&self) -> Option<Box<dyn Write + Send>> {
        self.state()
            .stdin
            .take()
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn stdout(&self) -> Option<Box<dyn Read + Send>> {
        self.state()
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn stderr(&self) -> Option<Box<dyn Read + Send>> {
        self.state()
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn interrupt(&self) -> Result<()> {
        let pid = self
            .state()
            .pid
            .ok_or_else(|| FlotillaError::NotRunning(self.host.clone()))?;
        debug!("Sending SIGINT to local pid {}", pid);
        send_signal(pid, libc::SIGINT)
    }

    async fn wait(&self) -> Result<()> {
        let mut child = self
            .state()
            .child
            .take()
            .ok_or_else(|| FlotillaError::NotRunning(self.host.clone()))?;

        let status = tokio::task::spawn_blocking(move || child.wait())
            .await
            .map_err(|e| FlotillaError::Io(std::io::Error::other(e)))??;

        let mut state = self.state();
        state.pid = None;
        state.stdin = None;
        drop(state);

        debug!("Local command finished with {}", status);
        classify_status(status)
    }

    fn write_close(&self) {
        self.state().stdin = None;
    }

    async fn close(&self) {
        let mut state = self.state();
        state.stdin = None;
        state.stdout = None;
        state.stderr = None;

        if let Some(mut child) = state.child.take() {
            if let Some(pid) = state.pid.take() {
                if let Err(e) = send_signal(pid, libc::SIGKILL) {
                    warn!("Killing local command failed: {}", e);
                }
            }
            let _ = child.wait();
        } else if let Some(pid) = state.pid.take() {
            // Someone is still blocked in wait(); let the process go
            if let Err(e) = send_signal(pid, libc::SIGTERM) {
                debug!("Terminating local pid {} failed: {}", pid, e);
            }
        }
    }
}
