//! SSH endpoint for remote command execution
//!
//! Sessions are opened once per host and reused for every task of the run.
//! Authentication is key based only: the ssh-agent first, then the default
//! identity files under `~/.ssh`.
//!
//! Hosts behind a bastion are reached by opening a `direct-tcpip` channel on
//! the bastion session and handing the target session one end of a local
//! socket pair; a tunnel thread shuttles bytes between the two.

use crate::endpoints::pump::{self, retry_again, PumpHandles};
use crate::endpoints::{host_preamble, Address, Endpoint, TaskScript};
use crate::error::{FlotillaError, Result};
use crate::output::Prefix;
use async_trait::async_trait;
use ssh2::{Channel, Session};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default per-host connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

/// Identity files tried after the agent, in order
const DEFAULT_IDENTITIES: &[&str] = &["id_ed25519", "id_ecdsa", "id_rsa"];

/// Connection options shared by every SSH endpoint of a run
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Endpoint backed by an SSH session
pub struct RemoteEndpoint {
    host: String,
    address: Address,
    env: String,
    prefix: Prefix,
    session: Mutex<Option<Session>>,
    run: Mutex<Option<RemoteRun>>,
}

/// Handles for the command currently running on this endpoint
struct RemoteRun {
    stdin: Option<pump::ChannelWriter>,
    stdout: Option<pump::ChannelReader>,
    stderr: Option<pump::ChannelReader>,
    interrupt: std::sync::mpsc::Sender<()>,
    done: Option<JoinHandle<Result<()>>>,
}

impl RemoteEndpoint {
    /// Dial `host` directly.
    ///
    /// `env` is the run-level export preamble; `user` is the network's
    /// default user, overridden by a `user@` in `host`.
    pub async fn connect(
        host: &str,
        user: Option<&str>,
        env: &str,
        color: Option<&str>,
        options: &SshOptions,
    ) -> Result<Self> {
        let address = Address::parse(host, user)?;
        let timeout = options.connect_timeout;
        let target = address.clone();

        let session = tokio::task::spawn_blocking(move || {
            let tcp = dial(&target, timeout)?;
            open_session(tcp, &target, timeout)
        })
        .await
        .map_err(|e| connect_error(&address, e))??;

        info!("SSH session established to {}", address.endpoint());
        Ok(Self::from_session(host, address, env, color, session))
    }

    /// Dial `host` through an already connected bastion.
    pub async fn connect_through(
        host: &str,
        user: Option<&str>,
        env: &str,
        color: Option<&str>,
        options: &SshOptions,
        bastion: &Arc<RemoteEndpoint>,
    ) -> Result<Self> {
        let address = Address::parse(host, user)?;
        let timeout = options.connect_timeout;
        let target = address.clone();
        let bastion = Arc::clone(bastion);

        let session = tokio::task::spawn_blocking(move || {
            let channel = bastion.open_tunnel(&target)?;
            let (local, remote) = UnixStream::pair()?;
            pump::spawn_tunnel_pump(target.endpoint(), channel, remote)?;
            open_session(local, &target, timeout)
        })
        .await
        .map_err(|e| connect_error(&address, e))??;

        info!("SSH session established to {} via bastion", address.endpoint());
        Ok(Self::from_session(host, address, env, color, session))
    }

    /// Dial a bastion. Its session stays in non-blocking mode so that many
    /// tunnels can share it.
    pub async fn connect_bastion(
        host: &str,
        user: Option<&str>,
        options: &SshOptions,
    ) -> Result<Self> {
        let bastion = Self::connect(host, user, "", None, options).await?;
        if let Some(session) = bastion.session().as_ref() {
            session.set_blocking(false);
        }
        Ok(bastion)
    }

    fn from_session(
        host: &str,
        address: Address,
        env: &str,
        color: Option<&str>,
        session: Session,
    ) -> Self {
        let prefix = Prefix::new(&format!("{}@{} | ", address.user, address.endpoint()), color);
        Self {
            host: host.to_string(),
            env: host_preamble(env, host),
            address,
            prefix,
            session: Mutex::new(Some(session)),
            run: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    fn session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self) -> MutexGuard<'_, Option<RemoteRun>> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ssh_error(&self, message: impl std::fmt::Display) -> FlotillaError {
        FlotillaError::Ssh {
            host: self.address.endpoint(),
            message: message.to_string(),
        }
    }

    /// Open a `direct-tcpip` channel to `target` on this (bastion) session
    fn open_tunnel(&self, target: &Address) -> Result<Channel> {
        let session = self
            .session()
            .clone()
            .ok_or_else(|| self.ssh_error("bastion connection is closed"))?;
        debug!("Opening tunnel to {} via {}", target.endpoint(), self.address.endpoint());
        retry_again(|| session.channel_direct_tcpip(&target.host, target.port, None)).map_err(
            |e| FlotillaError::Connect {
                host: target.endpoint(),
                message: format!("tunnel through bastion failed: {}", e),
            },
        )
    }
}

fn connect_error(address: &Address, err: impl std::fmt::Display) -> FlotillaError {
    FlotillaError::Connect {
        host: address.endpoint(),
        message: err.to_string(),
    }
}

/// Resolve and TCP-connect with a timeout, trying every resolved address
fn dial(address: &Address, timeout: Duration) -> Result<TcpStream> {
    let addrs = (address.host.as_str(), address.port)
        .to_socket_addrs()
        .map_err(|e| connect_error(address, format!("resolving host failed: {}", e)))?;

    let mut last_error = None;
    for addr in addrs {
        debug!("Dialing {}", addr);
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => return Ok(tcp),
            Err(e) => last_error = Some(e),
        }
    }

    Err(connect_error(
        address,
        match last_error {
            Some(e) => format!("failed to connect: {}", e),
            None => "host resolved to no addresses".to_string(),
        },
    ))
}

/// Handshake and authenticate over an already connected byte stream
fn open_session<S: 'static + AsRawFd>(stream: S, address: &Address, timeout: Duration) -> Result<Session> {
    let mut session = Session::new().map_err(|e| connect_error(address, e))?;
    session.set_tcp_stream(stream);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| connect_error(address, format!("SSH handshake failed: {}", e)))?;

    authenticate(&session, address)?;

    // Commands may run for as long as they like
    session.set_timeout(0);
    Ok(session)
}

fn authenticate(session: &Session, address: &Address) -> Result<()> {
    match session.userauth_agent(&address.user) {
        Ok(()) if session.authenticated() => {
            debug!("Authenticated {} via ssh-agent", address.user);
            return Ok(());
        }
        Ok(()) => {}
        Err(e) => debug!("ssh-agent authentication failed: {}", e),
    }

    for key in default_identities() {
        if !key.exists() {
            continue;
        }
        debug!("Authenticating with key: {}", key.display());
        match session.userauth_pubkey_file(&address.user, None, &key, None) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(e) => debug!("Key {} rejected: {}", key.display(), e),
        }
    }

    Err(connect_error(
        address,
        format!("authentication failed for user {}", address.user),
    ))
}

fn default_identities() -> Vec<PathBuf> {
    match std::env::var("HOME") {
        Ok(home) => DEFAULT_IDENTITIES
            .iter()
            .map(|name| PathBuf::from(&home).join(".ssh").join(name))
            .collect(),
        Err(_) => Vec::new(),
    }
}

#[async_trait]
impl Endpoint for RemoteEndpoint {
    fn host(&self) -> &str {
        &self.host
    }

    fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    async fn start(&self, script: &TaskScript) -> Result<()> {
        if self.run().is_some() {
            return Err(self.ssh_error("a command is already running"));
        }
        let session = self
            .session()
            .clone()
            .ok_or_else(|| self.ssh_error("connection is closed"))?;

        let command = format!("{}{}", self.env, script.body);
        let tty = script.tty;
        let endpoint = self.address.endpoint();
        debug!("Starting remote command on {}: {}", endpoint, script.body);

        let handles: PumpHandles = tokio::task::spawn_blocking(move || {
            let ssh = |what: &str, e: ssh2::Error| FlotillaError::Ssh {
                host: endpoint.clone(),
                message: format!("{}: {}", what, e),
            };

            session.set_blocking(true);
            let mut channel = session
                .channel_session()
                .map_err(|e| ssh("failed to open channel", e))?;
            if tty {
                channel
                    .request_pty("xterm", None, None)
                    .map_err(|e| ssh("failed to request pty", e))?;
            }
            channel
                .exec(&command)
                .map_err(|e| ssh("failed to execute command", e))?;
            session.set_blocking(false);

            pump::spawn_command_pump(endpoint.clone(), channel, tty)
        })
        .await
        .map_err(|e| self.ssh_error(e))??;

        *self.run() = Some(RemoteRun {
            stdin: Some(handles.stdin),
            stdout: Some(handles.stdout),
            stderr: Some(handles.stderr),
            interrupt: handles.interrupt,
            done: Some(handles.done),
        });
        Ok(())
    }

    fn stdin(&self) -> Option<Box<dyn Write + Send>> {
        self.run()
            .as_mut()
            .and_then(|run| run.stdin.take())
            .map(|s| Box::new(s) as Box<dyn Write + Send>)
    }

    fn stdout(&self) -> Option<Box<dyn Read + Send>> {
        self.run()
            .as_mut()
            .and_then(|run| run.stdout.take())
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn stderr(&self) -> Option<Box<dyn Read + Send>> {
        self.run()
            .as_mut()
            .and_then(|run| run.stderr.take())
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn interrupt(&self) -> Result<()> {
        let run = self.run();
        let run = run
            .as_ref()
            .ok_or_else(|| FlotillaError::NotRunning(self.address.endpoint()))?;
        run.interrupt
            .send(())
            .map_err(|_| FlotillaError::NotRunning(self.address.endpoint()))
    }

    async fn wait(&self) -> Result<()> {
        let done = self
            .run()
            .as_mut()
            .and_then(|run| run.done.take())
            .ok_or_else(|| FlotillaError::NotRunning(self.address.endpoint()))?;

        let result = tokio::task::spawn_blocking(move || done.join())
            .await
            .map_err(|e| self.ssh_error(e))?
            .unwrap_or_else(|_| Err(self.ssh_error("I/O pump panicked")));

        *self.run() = None;
        result
    }

    fn write_close(&self) {
        if let Some(run) = self.run().as_mut() {
            run.stdin = None;
        }
    }

    async fn close(&self) {
        self.run().take();
        let Some(session) = self.session().take() else {
            return;
        };
        let endpoint = self.address.endpoint();

        let closed = tokio::task::spawn_blocking(move || {
            session.set_blocking(true);
            session.disconnect(None, "bye", None)
        })
        .await;

        match closed {
            Ok(Ok(())) => debug!("Disconnected from {}", endpoint),
            Ok(Err(e)) => warn!("Disconnecting from {} failed: {}", endpoint, e),
            Err(e) => warn!("Disconnecting from {} failed: {}", endpoint, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = SshOptions::default();
        assert_eq!(options.connect_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_default_identities_under_home() {
        if std::env::var("HOME").is_ok() {
            let keys = default_identities();
            assert_eq!(keys.len(), DEFAULT_IDENTITIES.len());
            assert!(keys.iter().all(|k| k.to_string_lossy().contains(".ssh")));
        }
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Grab a free port, then close it so nothing is listening
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let options = SshOptions {
            connect_timeout: Duration::from_secs(2),
        };

        let result = RemoteEndpoint::connect(
            &format!("tester@127.0.0.1:{}", port),
            None,
            "",
            None,
            &options,
        )
        .await;

        match result {
            Err(FlotillaError::Connect { host, .. }) => {
                assert_eq!(host, format!("127.0.0.1:{}", port))
            }
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address() {
        let result =
            RemoteEndpoint::connect("web1/evil", None, "", None, &SshOptions::default()).await;
        assert!(matches!(result, Err(FlotillaError::Connect { .. })));
    }
}
