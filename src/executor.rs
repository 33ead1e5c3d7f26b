//! Task executor: runs one task across its endpoints
//!
//! A task moves through Starting, Streaming, Draining, Waiting and Done.
//! Output copies for every endpoint run on blocking worker threads; the
//! executor joins all of them before it waits for exit statuses, so every
//! byte a host printed reaches the console before its outcome is judged.

use crate::broadcast::{BroadcastWriter, Destination, WritePolicy};
use crate::endpoints::{Endpoint, RELAYED_SIGNALS};
use crate::error::{FlotillaError, Result};
use crate::input::{InputSubscription, OperatorInput};
use crate::models::FailurePolicy;
use crate::output::{copy_prefixed, Console, Stream};
use crate::report::ClientError;
use crate::signal::Interrupts;
use crate::tasks::Task;
use futures::future::join_all;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Exit status a command reports after being stopped by a relayed interrupt
pub const INTERRUPTED_EXIT_CODE: i32 = 15;

/// Whether a wait failure is the expected result of a relayed interrupt.
///
/// Only exit status 15 and deaths by the signals a relay delivers qualify;
/// a crash (SEGV, ABRT, KILL, ...) is an ordinary failure.
pub fn is_interrupt(error: &FlotillaError) -> bool {
    match error {
        FlotillaError::Host { source, .. } => is_interrupt(source),
        FlotillaError::Signaled { number, .. } => RELAYED_SIGNALS.contains(number),
        other => other.process_exit_code() == Some(INTERRUPTED_EXIT_CODE),
    }
}

/// Input pump of a running task
struct InputPump {
    subscription: InputSubscription,
    handle: JoinHandle<()>,
}

impl InputPump {
    /// Stop feeding the task and wait for the pump thread to exit
    async fn finish(self) {
        drop(self.subscription);
        let handle = self.handle;
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(())) => debug!("Input pump joined"),
            Ok(Err(_)) => warn!("Input pump panicked"),
            Err(e) => warn!("Joining input pump failed: {}", e),
        }
    }
}

fn stream_name(stream: Stream) -> &'static str {
    match stream {
        Stream::Stdout => "STDOUT",
        Stream::Stderr => "STDERR",
    }
}

/// Runs tasks one at a time under a run-wide failure policy
pub struct TaskExecutor {
    policy: FailurePolicy,
    prefixing: bool,
    width: usize,
    console: Console,
    interrupts: Interrupts,
}

impl TaskExecutor {
    pub fn new(policy: FailurePolicy, console: Console, interrupts: Interrupts) -> Self {
        Self {
            policy,
            prefixing: true,
            width: 0,
            console,
            interrupts,
        }
    }

    /// Enable or disable host prefixes. `width` is the widest prefix of the run.
    pub fn with_prefix(mut self, enabled: bool, width: usize) -> Self {
        self.prefixing = enabled;
        self.width = width;
        self
    }

    fn label(&self, endpoint: &dyn Endpoint) -> String {
        if self.prefixing {
            endpoint.prefix().aligned(self.width)
        } else {
            String::new()
        }
    }

    /// Run `task` to completion.
    ///
    /// Returns the failures recorded for this task. Fatal failures (any
    /// start error, and run errors under fail-fast) are returned as `Err`.
    pub async fn execute(&self, task: Task) -> Result<Vec<ClientError>> {
        let Task {
            script,
            endpoints,
            input,
        } = task;

        info!("Running task on {} hosts", endpoints.len());
        debug!("Task script: {}", script.body);

        let relay = self.interrupts.relay(endpoints.clone());

        for endpoint in &endpoints {
            if let Err(e) = endpoint.start(&script).await {
                return Err(FlotillaError::Start {
                    prefix: self.label(endpoint.as_ref()),
                    source: Box::new(e),
                });
            }
        }

        let copies = self.spawn_copies(&endpoints);

        let pump = match input {
            Some(input) => Some(self.spawn_input_pump(&input, &endpoints)?),
            None => {
                endpoints.iter().for_each(|e| e.write_close());
                None
            }
        };

        for copy in join_all(copies).await {
            if let Err(e) = copy {
                warn!("Output copy worker failed: {}", e);
            }
        }

        let outcomes = join_all(endpoints.iter().map(|endpoint| async move {
            (endpoint, endpoint.wait().await)
        }))
        .await;
        drop(relay);
        if let Some(pump) = pump {
            pump.finish().await;
        }

        let mut errors = Vec::new();
        for (endpoint, outcome) in outcomes {
            let Err(error) = outcome else {
                debug!("{} finished successfully", endpoint.host());
                continue;
            };

            let prefix = self.label(endpoint.as_ref());
            let interrupted = is_interrupt(&error);

            if !self.policy.is_tolerant() && !interrupted {
                return Err(FlotillaError::Host {
                    prefix,
                    source: Box::new(error),
                });
            }

            self.console.error_line(&prefix, &error);
            if interrupted {
                info!("{} stopped by interrupt: {}", endpoint.host(), error);
            }
            if self.policy.is_tolerant() {
                errors.push(ClientError::run(endpoint.host(), error));
            }
        }

        Ok(errors)
    }

    fn spawn_copies(
        &self,
        endpoints: &[Arc<dyn Endpoint>],
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let mut copies = Vec::with_capacity(endpoints.len() * 2);

        for endpoint in endpoints {
            let prefix = self.label(endpoint.as_ref());
            let streams = [
                (Stream::Stdout, endpoint.stdout()),
                (Stream::Stderr, endpoint.stderr()),
            ];

            for (stream, reader) in streams {
                let Some(reader) = reader else {
                    continue;
                };
                let console = self.console.clone();
                let prefix = prefix.clone();
                let host = endpoint.host().to_string();

                copies.push(tokio::task::spawn_blocking(move || {
                    if let Err(e) = copy_prefixed(reader, &console, stream, &prefix) {
                        warn!("Copying {} of {} failed: {}", stream_name(stream), host, e);
                        console.error_line(
                            &prefix,
                            format!("reading {} failed: {}", stream_name(stream), e),
                        );
                    }
                }));
            }
        }

        copies
    }

    /// Feed operator input to every endpoint's stdin, then half-close them.
    ///
    /// The pump runs until input reaches EOF or the task is done, whichever
    /// comes first. Operator input may never reach EOF, so the task ends the
    /// subscription once its commands have exited.
    fn spawn_input_pump(
        &self,
        input: &OperatorInput,
        endpoints: &[Arc<dyn Endpoint>],
    ) -> Result<InputPump> {
        let (subscription, mut reader) = input.subscribe()?;
        let destinations: Vec<Destination> = endpoints
            .iter()
            .filter_map(|e| e.stdin())
            .map(Destination::from)
            .collect();
        let policy = if self.policy.is_tolerant() {
            WritePolicy::Silent
        } else {
            WritePolicy::FailFast
        };
        let targets = endpoints.to_vec();
        let console = self.console.clone();

        let handle = thread::Builder::new()
            .name("stdin-pump".to_string())
            .spawn(move || {
                let mut writer = BroadcastWriter::new(destinations, policy);
                match io::copy(&mut reader, &mut writer) {
                    Ok(n) => debug!("Broadcast {} bytes of input", n),
                    Err(e) => {
                        warn!("Broadcasting input failed: {}", e);
                        console.error_line("", format!("writing STDIN failed: {}", e));
                    }
                }
                drop(writer);
                for target in &targets {
                    target.write_close();
                }
            })?;

        Ok(InputPump {
            subscription,
            handle,
        })
    }
}
