//! Execution endpoints: connected handles that run one command at a time

pub mod local;
mod pump;
pub mod ssh;

use crate::error::{FlotillaError, Result};
use crate::output::Prefix;
use async_trait::async_trait;
use std::io::{Read, Write};

pub use local::LocalEndpoint;
pub use pump::{ChannelReader, ChannelWriter};
pub use ssh::{RemoteEndpoint, SshOptions};

/// What an endpoint is asked to run for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskScript {
    /// Shell script body, executed after the endpoint's env preamble
    pub body: String,
    /// Request a pseudo-terminal (remote endpoints only)
    pub tty: bool,
}

impl TaskScript {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            tty: false,
        }
    }
}

/// Capability set the task executor needs from a host.
///
/// An endpoint is connected once and then reused by every task of the run.
/// `start` returns as soon as the command is launched; its streams can be
/// taken afterwards and `wait` resolves when it terminates.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Host identifier as written in the network
    fn host(&self) -> &str;

    /// Display prefix assigned at connect time
    fn prefix(&self) -> &Prefix;

    /// Launch a command without waiting for it
    async fn start(&self, script: &TaskScript) -> Result<()>;

    /// Take the running command's stdin. `None` once taken.
    fn stdin(&self) -> Option<Box<dyn Write + Send>>;

    /// Take the running command's stdout. `None` once taken.
    fn stdout(&self) -> Option<Box<dyn Read + Send>>;

    /// Take the running command's stderr. `None` once taken.
    fn stderr(&self) -> Option<Box<dyn Read + Send>>;

    /// Forward an interrupt to the running command. Best effort.
    fn interrupt(&self) -> Result<()>;

    /// Block until the running command terminates
    async fn wait(&self) -> Result<()>;

    /// Close the command's stdin if this endpoint still holds it
    fn write_close(&self);

    /// Tear down the connection. Safe to call more than once.
    async fn close(&self);
}

/// Parsed `[ssh://][user@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub user: String,
    pub host: String,
    pub port: u16,
}

pub const DEFAULT_SSH_PORT: u16 = 22;

impl Address {
    /// Parse a host identifier.
    ///
    /// The user is taken from the text before the last `@`, then
    /// `default_user`, then the current OS user.
    pub fn parse(input: &str, default_user: Option<&str>) -> Result<Self> {
        let invalid = |message: &str| FlotillaError::Connect {
            host: input.to_string(),
            message: message.to_string(),
        };

        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix("ssh://").unwrap_or(trimmed);

        let (user, rest) = match trimmed.rfind('@') {
            Some(at) => (Some(&trimmed[..at]), &trimmed[at + 1..]),
            None => (None, trimmed),
        };

        if rest.contains('/') {
            return Err(invalid("unexpected slash in the host URL"));
        }

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match tail.strip_prefix(':') {
                Some(port) => parse_port(port).ok_or_else(|| invalid("invalid port"))?,
                None if tail.is_empty() => DEFAULT_SSH_PORT,
                None => return Err(invalid("unexpected text after IPv6 address")),
            };
            (host, port)
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, parse_port(port).ok_or_else(|| invalid("invalid port"))?)
        } else {
            (rest, DEFAULT_SSH_PORT)
        };

        if host.is_empty() {
            return Err(invalid("empty host"));
        }

        let user = user
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .or_else(|| default_user.filter(|u| !u.is_empty()).map(str::to_string))
            .unwrap_or_else(whoami::username);

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn parse_port(port: &str) -> Option<u16> {
    port.parse().ok().filter(|p| *p != 0)
}

/// Signals a relayed interrupt can end a command with. SSH sessions torn
/// down without a terminal see HUP.
pub const RELAYED_SIGNALS: [i32; 3] = [libc::SIGHUP, libc::SIGINT, libc::SIGTERM];

/// Conventional number for a signal name as reported by SSH (`TERM`, `INT`, ...).
/// Unknown names map to 0.
pub fn signal_code(name: &str) -> i32 {
    match name.trim_start_matches("SIG") {
        "HUP" => 1,
        "INT" => 2,
        "QUIT" => 3,
        "ABRT" => 6,
        "KILL" => 9,
        "USR1" => 10,
        "SEGV" => 11,
        "USR2" => 12,
        "PIPE" => 13,
        "ALRM" => 14,
        "TERM" => 15,
        _ => 0,
    }
}

/// Signal name for a number, the inverse of [`signal_code`]
pub fn signal_name(code: i32) -> String {
    let name = match code {
        1 => "HUP",
        2 => "INT",
        3 => "QUIT",
        6 => "ABRT",
        9 => "KILL",
        10 => "USR1",
        11 => "SEGV",
        12 => "USR2",
        13 => "PIPE",
        14 => "ALRM",
        15 => "TERM",
        other => return format!("SIG{}", other),
    };
    name.to_string()
}

/// Env preamble for one host: run-level exports plus the host variable
pub fn host_preamble(env: &str, host: &str) -> String {
    format!(
        "{}{}",
        env,
        crate::models::export_line(crate::models::HOST_ENV_VAR, host)
    )
}
