//! Error types for Flotilla

use thiserror::Error;

/// Exit status of a run cancelled by the operator
pub const INTERRUPT_EXIT_CODE: i32 = 128 + libc::SIGINT;

/// Flotilla error types
#[derive(Error, Debug)]
pub enum FlotillaError {
    /// YAML parsing errors
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    /// Config file exceeded size limit
    #[error("Config file exceeds 1MB limit (size: {0} bytes)")]
    ConfigSizeExceeded(usize),

    /// Invalid network, command or target name
    #[error("Invalid name '{name}': only alphanumeric, underscore, and dash allowed")]
    InvalidName { name: String },

    /// Network not present in the config
    #[error("Unknown network '{0}'")]
    UnknownNetwork(String),

    /// Neither a command nor a target
    #[error("Unknown command or target '{0}'")]
    UnknownCommand(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Host could not be reached or authenticated
    #[error("connecting to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// SSH protocol errors on an established connection
    #[error("SSH error on {host}: {message}")]
    Ssh { host: String, message: String },

    /// Command could not be launched on a connected endpoint
    #[error("{prefix}task failed: {source}")]
    Start {
        prefix: String,
        #[source]
        source: Box<FlotillaError>,
    },

    /// Command failed on a host; carries the host's display prefix
    #[error("{prefix}{source}")]
    Host {
        prefix: String,
        #[source]
        source: Box<FlotillaError>,
    },

    /// Command ran and exited non-zero
    #[error("Process exited with status {code}")]
    Exit { code: i32 },

    /// Command was terminated by a signal
    #[error("Process terminated by signal {signal}")]
    Signaled { signal: String, number: i32 },

    /// Endpoint has no running command
    #[error("{0}: no command running")]
    NotRunning(String),

    /// Summary file could not be written
    #[error("could not write summary file '{path}': {message}")]
    Summary { path: String, message: String },

    /// Nothing to do
    #[error("no commands to be run")]
    NoCommands,

    /// Operator interrupted while no command was running
    #[error("interrupted")]
    Cancelled,
}

impl FlotillaError {
    /// Process exit status this error should terminate the run with.
    pub fn exit_code(&self) -> i32 {
        match self {
            FlotillaError::Exit { code } => *code,
            FlotillaError::Signaled { number, .. } => 128 + *number,
            FlotillaError::Start { source, .. } | FlotillaError::Host { source, .. } => {
                source.exit_code()
            }
            FlotillaError::Summary { .. } | FlotillaError::Json(_) => 2,
            FlotillaError::Cancelled => INTERRUPT_EXIT_CODE,
            _ => 1,
        }
    }

    /// Exit code carried by a finished command, if any.
    pub fn process_exit_code(&self) -> Option<i32> {
        match self {
            FlotillaError::Exit { code } => Some(*code),
            FlotillaError::Signaled { number, .. } => Some(128 + *number),
            FlotillaError::Host { source, .. } => source.process_exit_code(),
            _ => None,
        }
    }
}

/// Result type alias using FlotillaError
pub type Result<T> = std::result::Result<T, FlotillaError>;
