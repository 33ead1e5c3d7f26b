//! Interrupt fan-out from the operator to the endpoints of the active task
//!
//! The process-wide SIGINT listener raises on [`Interrupts`]; each task
//! subscribes a [`SignalRelay`] for its endpoints while it runs and drops it
//! once every endpoint has finished waiting. An interrupt that finds no relay
//! cancels the run instead.

use crate::endpoints::Endpoint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Interrupts buffered for a relay that has not caught up yet
const INTERRUPT_BUFFER: usize = 16;

/// In-process interrupt source shared by the CLI listener and task relays
#[derive(Clone)]
pub struct Interrupts {
    tx: broadcast::Sender<()>,
    relays: Arc<AtomicUsize>,
    cancel: Arc<watch::Sender<bool>>,
}

impl Interrupts {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(INTERRUPT_BUFFER);
        let (cancel, _) = watch::channel(false);
        Self {
            tx,
            relays: Arc::new(AtomicUsize::new(0)),
            cancel: Arc::new(cancel),
        }
    }

    /// Deliver an interrupt to every subscribed relay, or cancel the run
    /// when none is subscribed.
    ///
    /// Returns the number of relays that were subscribed.
    pub fn raise(&self) -> usize {
        let active = self.active_relays();
        if active > 0 {
            debug!("Raising interrupt for {} relays", active);
            let _ = self.tx.send(());
        } else {
            info!("Interrupt with no command running, cancelling run");
            self.cancel.send_replace(true);
        }
        active
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the run has been cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        // The sender lives in self, so the channel cannot close here
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn active_relays(&self) -> usize {
        self.relays.load(Ordering::SeqCst)
    }

    /// Forward interrupts to `endpoints` until the returned relay is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn relay(&self, endpoints: Vec<Arc<dyn Endpoint>>) -> SignalRelay {
        let mut rx = self.tx.subscribe();
        self.relays.fetch_add(1, Ordering::SeqCst);

        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(()) => forward(&endpoints),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!("Relay skipped {} queued interrupts", missed);
                        forward(&endpoints);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        SignalRelay {
            relays: Arc::clone(&self.relays),
            forwarder,
        }
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

fn forward(endpoints: &[Arc<dyn Endpoint>]) {
    info!("Forwarding interrupt to {} hosts", endpoints.len());
    for endpoint in endpoints {
        if let Err(e) = endpoint.interrupt() {
            warn!("Interrupting {} failed: {}", endpoint.host(), e);
        }
    }
}

/// Subscription of one task's endpoints to [`Interrupts`]
pub struct SignalRelay {
    relays: Arc<AtomicUsize>,
    forwarder: JoinHandle<()>,
}

impl Drop for SignalRelay {
    fn drop(&mut self) {
        self.forwarder.abort();
        self.relays.fetch_sub(1, Ordering::SeqCst);
    }
}
