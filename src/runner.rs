//! Orchestration driver: connect, run every command, clean up, report

use crate::connect::{connect_network, Fleet};
use crate::endpoints::SshOptions;
use crate::error::{FlotillaError, Result};
use crate::executor::TaskExecutor;
use crate::models::{Command, EnvList, FailurePolicy, FleetConfig, Network};
use crate::output::{max_width, Console};
use crate::report::RunReport;
use crate::signal::Interrupts;
use crate::tasks::TaskTranslator;
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Run-wide settings taken from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub policy: FailurePolicy,
    /// Prefix every output line with its host
    pub prefix: bool,
    /// Append the recorded errors here as JSON when the run ends
    pub summary: Option<PathBuf>,
    pub ssh: SshOptions,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::FailFast,
            prefix: true,
            summary: None,
            ssh: SshOptions::default(),
        }
    }
}

/// Build the run-level environment.
///
/// Later sources win: config `env`, network `env`, the `FLOTILLA_*`
/// variables, then `overrides` from the command line.
pub fn run_environment(config: &FleetConfig, network: &Network, overrides: &EnvList) -> EnvList {
    let mut env = EnvList::new();
    env.extend(&config.env);
    env.extend(&network.env);
    env.set("FLOTILLA_NETWORK", network.name.as_str());
    env.set(
        "FLOTILLA_USER",
        network.user.clone().unwrap_or_else(whoami::username),
    );
    env.set("FLOTILLA_TIME", chrono::Local::now().to_rfc3339());
    env.extend(overrides);
    env
}

/// Drives a whole run over one network
pub struct Runner {
    options: RunOptions,
    translator: Box<dyn TaskTranslator>,
    console: Console,
    interrupts: Interrupts,
}

impl Runner {
    pub fn new(options: RunOptions, translator: impl TaskTranslator + 'static) -> Self {
        Self {
            options,
            translator: Box::new(translator),
            console: Console::stdio(),
            interrupts: Interrupts::new(),
        }
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    pub fn with_interrupts(mut self, interrupts: Interrupts) -> Self {
        self.interrupts = interrupts;
        self
    }

    /// Interrupt source task relays subscribe to
    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    /// Run `commands` in order on every host of `network`.
    ///
    /// Returns the report of a run that went to the end. A fatal error
    /// (fail-fast failure, start failure, summary failure, cancellation) is
    /// returned as `Err` after endpoints are closed and the summary is written.
    pub async fn run(
        &self,
        network: &Network,
        env: &EnvList,
        commands: &[Command],
    ) -> Result<RunReport> {
        info!(
            "Running {} commands on network '{}'",
            commands.len(),
            network.name
        );

        let mut report = RunReport::new();
        let outcome = self.drive(network, env, commands, &mut report).await;

        if let Some(path) = self.options.summary.as_ref().filter(|_| !report.is_empty()) {
            if let Err(e) = report.write_summary(path) {
                if let Err(fatal) = outcome {
                    error!("{}", e);
                    return Err(fatal);
                }
                return Err(e);
            }
        }

        outcome?;
        info!("Run finished with {} recorded errors", report.errors().len());
        Ok(report)
    }

    async fn drive(
        &self,
        network: &Network,
        env: &EnvList,
        commands: &[Command],
        report: &mut RunReport,
    ) -> Result<()> {
        let env = env.as_export();
        let connecting = connect_network(
            network,
            &env,
            self.options.policy,
            &self.options.ssh,
            &self.console,
        );
        let mut fleet = tokio::select! {
            fleet = connecting => fleet?,
            _ = self.interrupts.cancelled() => {
                warn!("Interrupted while connecting");
                return Err(FlotillaError::Cancelled);
            }
        };
        report.extend(std::mem::take(&mut fleet.errors));

        let outcome = self.run_commands(&fleet, &env, commands, report).await;
        fleet.close().await;
        outcome
    }

    async fn run_commands(
        &self,
        fleet: &Fleet,
        env: &str,
        commands: &[Command],
        report: &mut RunReport,
    ) -> Result<()> {
        let width = max_width(fleet.endpoints.iter().map(|e| e.prefix()));
        let executor = TaskExecutor::new(
            self.options.policy,
            self.console.clone(),
            self.interrupts.clone(),
        )
        .with_prefix(self.options.prefix, width);

        for command in commands {
            info!("Running command '{}'", command.name);
            let tasks = self
                .translator
                .create_tasks(command, &fleet.endpoints, env)?;
            if tasks.is_empty() {
                warn!("Command '{}' produced no tasks", command.name);
            }

            for task in tasks {
                if self.interrupts.is_cancelled() {
                    warn!("Interrupted before '{}' ran", command.name);
                    return Err(FlotillaError::Cancelled);
                }
                let errors = executor.execute(task).await?;
                report.extend(errors);
            }
        }

        Ok(())
    }
}
