//! CLI interface for Flotilla

use crate::endpoints::SshOptions;
use crate::logging::{init_logging, LogConfig};
use crate::models::{EnvList, FailurePolicy, FleetConfig};
use crate::parser::{filter_hosts, find_config_file, parse_config_file, resolve_commands, resolve_network};
use crate::runner::{run_environment, RunOptions, Runner};
use crate::signal::Interrupts;
use crate::tasks::CommandTranslator;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

/// Flotilla - run shell commands on a fleet of hosts in parallel
#[derive(Parser, Debug)]
#[command(name = "flotilla")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run shell commands on a fleet of hosts in parallel", long_about = None)]
pub struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, default_value = "warn", global = true)]
    pub log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    pub log_format: String,

    /// Config file (defaults to ./Flotillafile or ./Flotillafile.yml)
    #[arg(short = 'f', long = "file", global = true)]
    pub file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run commands or targets on every host of a network
    Run(RunArgs),

    /// List networks, commands and targets from the config file
    List,
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Network to run on
    pub network: String,

    /// Commands or targets, run in order
    #[arg(required = true)]
    pub commands: Vec<String>,

    /// Set an environment variable (KEY=VALUE), may be repeated
    #[arg(short = 'e', long = "env", value_parser = parse_env_pair)]
    pub env: Vec<(String, String)>,

    /// Only run on hosts matching this regex
    #[arg(long)]
    pub only: Option<String>,

    /// Skip hosts matching this regex
    #[arg(long)]
    pub except: Option<String>,

    /// Trace scripts with `set -x`
    #[arg(short = 'D', long)]
    pub debug: bool,

    /// Do not prefix output lines with the host
    #[arg(long)]
    pub disable_prefix: bool,

    /// Record failures and keep going instead of stopping at the first
    #[arg(long)]
    pub ignore_errors: bool,

    /// Append a JSON summary of failures to this file
    #[arg(long)]
    pub summary: Option<PathBuf>,

    /// SSH connect timeout in seconds
    #[arg(long, default_value = "20")]
    pub ssh_timeout: u64,
}

fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{}'", s));
    }
    Ok((key.to_string(), value.to_string()))
}

impl Cli {
    /// Initialize logging based on CLI arguments
    pub fn init_logging(&self) -> anyhow::Result<()> {
        init_logging(&LogConfig::from_args(&self.log_level, &self.log_format))
    }

    /// Execute the CLI command, returning the process exit status
    pub async fn execute(&self) -> anyhow::Result<i32> {
        match &self.command {
            Commands::Run(args) => self.run(args).await,
            Commands::List => {
                self.list()?;
                Ok(0)
            }
        }
    }

    fn config_path(&self) -> anyhow::Result<PathBuf> {
        match &self.file {
            Some(path) => Ok(path.clone()),
            None => Ok(find_config_file(Path::new("."))?),
        }
    }

    fn load_config(&self) -> anyhow::Result<(PathBuf, FleetConfig)> {
        let path = self.config_path()?;
        info!("Loading config from: {:?}", path);
        let config = parse_config_file(&path)?;
        Ok((path, config))
    }

    async fn run(&self, args: &RunArgs) -> anyhow::Result<i32> {
        let (path, config) = self.load_config()?;

        let network = resolve_network(&config, &args.network)?;
        let network = filter_hosts(network, args.only.as_deref(), args.except.as_deref())?;
        let commands = resolve_commands(&config, &args.commands)?;

        let mut overrides = EnvList::new();
        for (key, value) in &args.env {
            overrides.set(key.as_str(), value.as_str());
        }
        let env = run_environment(&config, &network, &overrides);

        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."))
            .to_path_buf();
        let translator = CommandTranslator::new()
            .with_debug(args.debug)
            .with_base_dir(base_dir);

        let options = RunOptions {
            policy: FailurePolicy::from_ignore_errors(args.ignore_errors),
            prefix: !args.disable_prefix,
            summary: args.summary.clone(),
            ssh: SshOptions {
                connect_timeout: Duration::from_secs(args.ssh_timeout),
            },
        };
        let runner = Runner::new(options, translator);

        let listener = tokio::spawn(relay_sigint(runner.interrupts().clone()));
        let result = runner.run(&network, &env, &commands).await;
        listener.abort();

        Ok(result?.exit_code())
    }

    fn list(&self) -> anyhow::Result<()> {
        let (_, config) = self.load_config()?;

        println!("Networks:");
        for (name, network) in &config.networks {
            println!("  {:<16} {}", name, network.hosts.join(", "));
            if let Some(bastion) = network.bastion() {
                println!("  {:<16} via {}", "", bastion);
            }
        }

        println!();
        println!("Commands:");
        for (name, command) in &config.commands {
            println!("  {:<16} {}", name, command.desc.as_deref().unwrap_or(""));
        }

        if !config.targets.is_empty() {
            println!();
            println!("Targets:");
            for (name, commands) in &config.targets {
                println!("  {:<16} {}", name, commands.join(" "));
            }
        }

        Ok(())
    }
}

/// Raise every SIGINT on `interrupts` until aborted
async fn relay_sigint(interrupts: Interrupts) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(sigint) => sigint,
        Err(e) => {
            warn!("Cannot listen for SIGINT: {}", e);
            return;
        }
    };
    while sigint.recv().await.is_some() {
        let relays = interrupts.raise();
        debug!("SIGINT delivered to {} relays", relays);
    }
}
