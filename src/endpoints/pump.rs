//! Background I/O pumps for non-blocking ssh2 channels.
//!
//! libssh2 serializes every call on a session, so a blocking read on stdout
//! would starve stdin writes and stderr reads. Each running command instead
//! gets one thread that polls the channel in non-blocking mode and bridges
//! it to plain `Read`/`Write` handles backed by in-process channels.

use crate::endpoints::signal_code;
use crate::error::{FlotillaError, Result};
use ssh2::{Channel, ErrorCode};
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::thread;
use std::time::Duration;
use tracing::debug;

/// Idle delay between polls when nothing moved
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// libssh2 "would block" in non-blocking mode
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

/// Pending stdin chunks buffered between the writer and the pump
const STDIN_QUEUE: usize = 32;

const ETX: u8 = 0x03;

pub(crate) fn is_again(err: &ssh2::Error) -> bool {
    matches!(err.code(), ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

/// Repeat a non-blocking libssh2 call until it stops reporting EAGAIN.
pub(crate) fn retry_again<T>(
    mut op: impl FnMut() -> std::result::Result<T, ssh2::Error>,
) -> std::result::Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(e) if is_again(&e) => thread::sleep(POLL_INTERVAL),
            other => return other,
        }
    }
}

/// Read half fed by a pump thread. EOF once the pump drops its sender.
pub struct ChannelReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    fn new(rx: Receiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = out.len().min(self.chunk.len() - self.pos);
        out[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Write half drained by a pump thread. Dropping it sends EOF to the remote.
pub struct ChannelWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote command finished"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handles for one command running behind a pump thread
pub(crate) struct PumpHandles {
    pub stdin: ChannelWriter,
    pub stdout: ChannelReader,
    pub stderr: ChannelReader,
    pub interrupt: Sender<()>,
    pub done: thread::JoinHandle<Result<()>>,
}

/// Spawn the pump for a command whose channel is already exec'd and whose
/// session is in non-blocking mode.
pub(crate) fn spawn_command_pump(
    host: String,
    channel: Channel,
    tty: bool,
) -> Result<PumpHandles> {
    let (stdin_tx, stdin_rx) = mpsc::sync_channel(STDIN_QUEUE);
    let (stdout_tx, stdout_rx) = mpsc::channel();
    let (stderr_tx, stderr_rx) = mpsc::channel();
    let (interrupt_tx, interrupt_rx) = mpsc::channel();

    let pump = CommandPump {
        host: host.clone(),
        channel,
        tty,
        stdin: stdin_rx,
        stdout: stdout_tx,
        stderr: stderr_tx,
        interrupts: interrupt_rx,
    };

    let done = thread::Builder::new()
        .name(format!("pump-{}", host))
        .spawn(move || pump.run())?;

    Ok(PumpHandles {
        stdin: ChannelWriter { tx: stdin_tx },
        stdout: ChannelReader::new(stdout_rx),
        stderr: ChannelReader::new(stderr_rx),
        interrupt: interrupt_tx,
        done,
    })
}

struct CommandPump {
    host: String,
    channel: Channel,
    tty: bool,
    stdin: Receiver<Vec<u8>>,
    stdout: Sender<Vec<u8>>,
    stderr: Sender<Vec<u8>>,
    interrupts: Receiver<()>,
}

impl CommandPump {
    fn ssh_error(&self, message: impl std::fmt::Display) -> FlotillaError {
        FlotillaError::Ssh {
            host: self.host.clone(),
            message: message.to_string(),
        }
    }

    fn run(mut self) -> Result<()> {
        let mut buf = vec![0u8; 16 * 1024];
        let mut pending: Vec<u8> = Vec::new();
        let mut input_closed = false;
        let mut eof_sent = false;
        let mut stdout_done = false;
        let mut stderr_done = false;

        loop {
            let mut progress = false;

            while self.interrupts.try_recv().is_ok() {
                progress = true;
                if self.tty && !eof_sent {
                    debug!("{}: forwarding ^C", self.host);
                    pending.insert(0, ETX);
                } else {
                    // Without a terminal the only lever is tearing the channel down
                    debug!("{}: closing channel on interrupt", self.host);
                    if let Err(e) = self.channel.close() {
                        if !is_again(&e) {
                            debug!("{}: close on interrupt failed: {}", self.host, e);
                        }
                    }
                }
            }

            while !input_closed {
                match self.stdin.try_recv() {
                    Ok(chunk) => {
                        pending.extend_from_slice(&chunk);
                        progress = true;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => input_closed = true,
                }
            }

            if !pending.is_empty() && !eof_sent {
                match self.channel.write(&pending) {
                    Ok(n) => {
                        pending.drain(..n);
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => {
                        debug!("{}: dropping stdin after write error: {}", self.host, e);
                        pending.clear();
                        input_closed = true;
                    }
                }
            }

            if input_closed && pending.is_empty() && !eof_sent {
                match self.channel.send_eof() {
                    Ok(()) => eof_sent = true,
                    Err(e) if is_again(&e) => {}
                    Err(e) => {
                        debug!("{}: send_eof failed: {}", self.host, e);
                        eof_sent = true;
                    }
                }
            }

            if !stdout_done {
                match self.channel.read(&mut buf) {
                    Ok(0) => stdout_done = self.channel.eof(),
                    Ok(n) => {
                        let _ = self.stdout.send(buf[..n].to_vec());
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.ssh_error(format!("reading STDOUT failed: {}", e))),
                }
            }

            if !stderr_done {
                match self.channel.stderr().read(&mut buf) {
                    Ok(0) => stderr_done = self.channel.eof(),
                    Ok(n) => {
                        let _ = self.stderr.send(buf[..n].to_vec());
                        progress = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                    Err(e) => return Err(self.ssh_error(format!("reading STDERR failed: {}", e))),
                }
            }

            if stdout_done && stderr_done {
                break;
            }

            if !progress {
                thread::sleep(POLL_INTERVAL);
            }
        }

        // Readers see EOF before the exit status is known
        let CommandPump {
            host,
            mut channel,
            stdout,
            stderr,
            ..
        } = self;
        drop(stdout);
        drop(stderr);

        retry_again(|| channel.wait_close()).map_err(|e| FlotillaError::Ssh {
            host: host.clone(),
            message: format!("waiting for channel close failed: {}", e),
        })?;

        let exit_signal = channel.exit_signal().map_err(|e| FlotillaError::Ssh {
            host: host.clone(),
            message: format!("reading exit signal failed: {}", e),
        })?;
        if let Some(signal) = exit_signal.exit_signal {
            return Err(FlotillaError::Signaled {
                number: signal_code(&signal),
                signal,
            });
        }

        let code = channel.exit_status().map_err(|e| FlotillaError::Ssh {
            host: host.clone(),
            message: format!("reading exit status failed: {}", e),
        })?;
        debug!("{}: remote command exited with {}", host, code);

        if code == 0 {
            Ok(())
        } else {
            Err(FlotillaError::Exit { code })
        }
    }
}

/// Relay bytes between a `direct-tcpip` channel on the bastion and one end
/// of a socket pair whose other end carries the target's SSH session.
pub(crate) fn spawn_tunnel_pump(
    target: String,
    channel: Channel,
    socket: UnixStream,
) -> io::Result<thread::JoinHandle<()>> {
    socket.set_nonblocking(true)?;
    thread::Builder::new()
        .name(format!("tunnel-{}", target))
        .spawn(move || pump_tunnel(&target, channel, socket))
}

fn pump_tunnel(target: &str, mut channel: Channel, mut socket: UnixStream) {
    let mut buf = vec![0u8; 32 * 1024];
    let mut upstream: Vec<u8> = Vec::new();
    let mut downstream: Vec<u8> = Vec::new();

    loop {
        let mut progress = false;

        if downstream.is_empty() {
            match channel.read(&mut buf) {
                Ok(0) if channel.eof() => break,
                Ok(0) => {}
                Ok(n) => {
                    downstream.extend_from_slice(&buf[..n]);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("tunnel to {}: bastion read failed: {}", target, e);
                    break;
                }
            }
        }

        if !downstream.is_empty() {
            match socket.write(&downstream) {
                Ok(n) => {
                    downstream.drain(..n);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("tunnel to {}: local write failed: {}", target, e);
                    break;
                }
            }
        }

        if upstream.is_empty() {
            match socket.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    upstream.extend_from_slice(&buf[..n]);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("tunnel to {}: local read failed: {}", target, e);
                    break;
                }
            }
        }

        if !upstream.is_empty() {
            match channel.write(&upstream) {
                Ok(n) => {
                    upstream.drain(..n);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    debug!("tunnel to {}: bastion write failed: {}", target, e);
                    break;
                }
            }
        }

        if !progress {
            thread::sleep(POLL_INTERVAL);
        }
    }

    if let Err(e) = retry_again(|| channel.close()) {
        debug!("tunnel to {}: closing bastion channel failed: {}", target, e);
    }
    debug!("tunnel to {} closed", target);
}
