//! Operator input shared by every task of a run
//!
//! A single reader thread drains the source for the whole run. Chunks go to
//! the task that is currently subscribed; chunks read while no task listens
//! are held for the next subscriber. Dropping the subscription ends the
//! task's reader, so a task's input pump can be joined when the task is done.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tracing::{debug, warn};

const CHUNK_SIZE: usize = 8 * 1024;

/// Handle to the run's operator input. Cheap to clone.
#[derive(Clone)]
pub struct OperatorInput {
    inner: Arc<Inner>,
}

struct Inner {
    /// Taken by the reader thread on first subscription
    source: Mutex<Option<Box<dyn Read + Send>>>,
    state: Mutex<HubState>,
}

#[derive(Default)]
struct HubState {
    active: Option<(u64, Sender<Vec<u8>>)>,
    held: Vec<Vec<u8>>,
    eof: bool,
    next_id: u64,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn deliver(&self, chunk: Vec<u8>) {
        let mut state = self.state();
        match state.active.take() {
            Some((id, tx)) => match tx.send(chunk) {
                Ok(()) => state.active = Some((id, tx)),
                Err(mpsc::SendError(chunk)) => {
                    debug!("Input subscriber {} went away, holding chunk", id);
                    state.held.push(chunk);
                }
            },
            None => state.held.push(chunk),
        }
    }

    fn finish(&self) {
        let mut state = self.state();
        state.eof = true;
        state.active = None;
    }
}

impl OperatorInput {
    pub fn new<R: Read + Send + 'static>(source: R) -> Self {
        Self {
            inner: Arc::new(Inner {
                source: Mutex::new(Some(Box::new(source))),
                state: Mutex::new(HubState::default()),
            }),
        }
    }

    /// The process's standard input
    pub fn stdin() -> Self {
        Self::new(io::stdin())
    }

    /// Become the receiver of operator input until the subscription drops.
    ///
    /// Input held from before the call is delivered first. A newer
    /// subscription replaces an older one.
    pub fn subscribe(&self) -> io::Result<(InputSubscription, InputReader)> {
        let (tx, rx) = mpsc::channel();
        let stopped = Arc::new(AtomicBool::new(false));

        let id = {
            let mut state = self.inner.state();
            for chunk in state.held.drain(..) {
                // rx is alive in this scope
                let _ = tx.send(chunk);
            }
            let id = state.next_id;
            state.next_id += 1;
            if !state.eof {
                if let Some((old, _)) = state.active.replace((id, tx)) {
                    debug!("Input subscription {} replaced by {}", old, id);
                }
            }
            id
        };
        self.start_reader()?;

        Ok((
            InputSubscription {
                inner: Arc::clone(&self.inner),
                id,
                stopped: Arc::clone(&stopped),
            },
            InputReader {
                rx,
                chunk: Vec::new(),
                pos: 0,
                stopped,
            },
        ))
    }

    fn start_reader(&self) -> io::Result<()> {
        let source = self
            .inner
            .source
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut source) = source else {
            return Ok(());
        };

        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name("operator-input".to_string())
            .spawn(move || {
                let mut buf = vec![0u8; CHUNK_SIZE];
                loop {
                    match source.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => inner.deliver(buf[..n].to_vec()),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("Reading operator input failed: {}", e);
                            break;
                        }
                    }
                }
                debug!("Operator input reached EOF");
                inner.finish();
            })?;
        Ok(())
    }
}

impl std::fmt::Debug for OperatorInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("OperatorInput")
            .field("held", &state.held.len())
            .field("eof", &state.eof)
            .finish()
    }
}

/// Keeps a task subscribed to operator input. Dropping it ends the paired
/// [`InputReader`] with EOF.
pub struct InputSubscription {
    inner: Arc<Inner>,
    id: u64,
    stopped: Arc<AtomicBool>,
}

impl Drop for InputSubscription {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
        let mut state = self.inner.state();
        if matches!(state.active, Some((id, _)) if id == self.id) {
            state.active = None;
        }
    }
}

/// Blocking reader over one subscription's share of operator input
pub struct InputReader {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
    stopped: Arc<AtomicBool>,
}

impl Read for InputReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            if self.stopped.load(Ordering::Acquire) {
                return Ok(0);
            }
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
