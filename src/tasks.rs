//! Translation of configured commands into executable tasks

use crate::endpoints::{Endpoint, LocalEndpoint, TaskScript};
use crate::error::{FlotillaError, Result};
use crate::input::OperatorInput;
use crate::models::Command;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// One command bound to the endpoints it runs on
pub struct Task {
    pub script: TaskScript,
    pub endpoints: Vec<Arc<dyn Endpoint>>,
    /// Operator input broadcast to every endpoint's stdin
    pub input: Option<OperatorInput>,
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("script", &self.script)
            .field(
                "endpoints",
                &self.endpoints.iter().map(|e| e.host()).collect::<Vec<_>>(),
            )
            .field("input", &self.input.is_some())
            .finish()
    }
}

/// Turns a command into the tasks that execute it
pub trait TaskTranslator: Send + Sync {
    fn create_tasks(
        &self,
        command: &Command,
        endpoints: &[Arc<dyn Endpoint>],
        env: &str,
    ) -> Result<Vec<Task>>;
}

/// Default translator for [`Command`] entries from the config file
pub struct CommandTranslator {
    debug: bool,
    base_dir: PathBuf,
    input: OperatorInput,
}

impl CommandTranslator {
    pub fn new() -> Self {
        Self {
            debug: false,
            base_dir: PathBuf::from("."),
            input: OperatorInput::stdin(),
        }
    }

    /// Prefix every script with `set -x;`
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Directory `script:` paths are resolved against
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Input shared by every `stdin: true` task of the run
    pub fn with_input(mut self, input: OperatorInput) -> Self {
        self.input = input;
        self
    }

    fn script(&self, body: String, command: &Command) -> TaskScript {
        let body = if self.debug {
            format!("set -x;{}", body)
        } else {
            body
        };
        TaskScript {
            body,
            tty: command.tty,
        }
    }

    fn input_for(&self, command: &Command) -> Option<OperatorInput> {
        command.stdin.then(|| self.input.clone())
    }
}

impl Default for CommandTranslator {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskTranslator for CommandTranslator {
    fn create_tasks(
        &self,
        command: &Command,
        endpoints: &[Arc<dyn Endpoint>],
        env: &str,
    ) -> Result<Vec<Task>> {
        if let Some(local) = &command.local {
            let endpoint: Arc<dyn Endpoint> = Arc::new(LocalEndpoint::connect(env, None)?);
            return Ok(vec![Task {
                script: self.script(local.clone(), command),
                endpoints: vec![endpoint],
                input: self.input_for(command),
            }]);
        }

        let body = match (&command.run, &command.script) {
            (Some(run), _) => run.clone(),
            (None, Some(script)) => {
                let path = self.base_dir.join(script);
                debug!("Reading script {}", path.display());
                fs::read_to_string(&path).map_err(|e| {
                    FlotillaError::Validation(format!(
                        "Command '{}': cannot read script {}: {}",
                        command.name,
                        path.display(),
                        e
                    ))
                })?
            }
            (None, None) => {
                return Err(FlotillaError::Validation(format!(
                    "Command '{}' has nothing to run",
                    command.name
                )))
            }
        };

        if endpoints.is_empty() {
            warn!("Command '{}' has no connected hosts to run on", command.name);
            return Ok(Vec::new());
        }

        let groups: Vec<Vec<Arc<dyn Endpoint>>> = if command.once {
            vec![vec![Arc::clone(&endpoints[0])]]
        } else if command.serial > 0 {
            endpoints
                .chunks(command.serial)
                .map(|chunk| chunk.to_vec())
                .collect()
        } else {
            vec![endpoints.to_vec()]
        };

        Ok(groups
            .into_iter()
            .map(|endpoints| Task {
                script: self.script(body.clone(), command),
                endpoints,
                input: self.input_for(command),
            })
            .collect())
    }
}
