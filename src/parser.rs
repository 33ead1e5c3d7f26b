//! YAML parser with validation for fleet configurations

use crate::error::{FlotillaError, Result};
use crate::models::*;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};

/// Config file names tried, in order, when no path is given
pub const DEFAULT_CONFIG_FILES: &[&str] = &["Flotillafile", "Flotillafile.yml"];

/// Locate the config file in `dir` using [`DEFAULT_CONFIG_FILES`].
pub fn find_config_file(dir: &Path) -> Result<PathBuf> {
    DEFAULT_CONFIG_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| {
            FlotillaError::Validation(format!(
                "no {} found in {}",
                DEFAULT_CONFIG_FILES.join(" or "),
                dir.display()
            ))
        })
}

/// Parse a fleet configuration from a YAML file.
///
/// # Errors
///
/// * `FlotillaError::Io` - If file cannot be read
/// * `FlotillaError::ConfigSizeExceeded` - If file exceeds 1MB
/// * `FlotillaError::YamlParse` - If YAML is malformed
/// * `FlotillaError::InvalidName` - If a network, command or target name is invalid
/// * `FlotillaError::Validation` - If a network or command is incomplete
pub fn parse_config_file<P: AsRef<Path>>(path: P) -> Result<FleetConfig> {
    let content = fs::read_to_string(path)?;
    parse_config_yaml(&content)
}

/// Parse a fleet configuration from a YAML string.
///
/// # Example
///
/// ```
/// use flotilla::parser::parse_config_yaml;
///
/// let yaml = r#"
/// networks:
///   local:
///     hosts: [localhost]
/// commands:
///   hello:
///     run: echo hi
/// "#;
///
/// let config = parse_config_yaml(yaml)?;
/// assert_eq!(config.networks["local"].hosts, vec!["localhost"]);
/// # Ok::<(), flotilla::error::FlotillaError>(())
/// ```
pub fn parse_config_yaml(content: &str) -> Result<FleetConfig> {
    if content.len() > MAX_CONFIG_SIZE {
        return Err(FlotillaError::ConfigSizeExceeded(content.len()));
    }

    let mut config: FleetConfig = serde_yaml::from_str(content)?;

    for (name, network) in config.networks.iter_mut() {
        validate_name(name)?;
        if network.hosts.is_empty() {
            return Err(FlotillaError::Validation(format!(
                "Network '{}' has no hosts",
                name
            )));
        }
        network.name = name.clone();
    }

    for (name, command) in config.commands.iter_mut() {
        validate_name(name)?;
        validate_command(name, command)?;
        command.name = name.clone();
    }

    for (name, commands) in &config.targets {
        validate_name(name)?;
        if config.commands.contains_key(name) {
            return Err(FlotillaError::Validation(format!(
                "Target '{}' shadows a command of the same name",
                name
            )));
        }
        for command in commands {
            if !config.commands.contains_key(command) {
                return Err(FlotillaError::Validation(format!(
                    "Target '{}' refers to unknown command '{}'",
                    name, command
                )));
            }
        }
    }

    Ok(config)
}

/// Validate network, command and target names
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name.len() > MAX_NAME_LEN
        || !name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    {
        return Err(FlotillaError::InvalidName {
            name: name.to_string(),
        });
    }
    Ok(())
}

/// Exactly one of `run`, `script` and `local` must be set
fn validate_command(name: &str, command: &Command) -> Result<()> {
    let bodies = [&command.run, &command.script, &command.local]
        .iter()
        .filter(|b| b.is_some())
        .count();

    if bodies != 1 {
        return Err(FlotillaError::Validation(format!(
            "Command '{}' must define exactly one of run, script or local",
            name
        )));
    }

    if command.once && command.serial > 0 {
        return Err(FlotillaError::Validation(format!(
            "Command '{}' cannot be both once and serial",
            name
        )));
    }

    Ok(())
}

/// Look up a network by name.
pub fn resolve_network<'a>(config: &'a FleetConfig, name: &str) -> Result<&'a Network> {
    config
        .networks
        .get(name)
        .ok_or_else(|| FlotillaError::UnknownNetwork(name.to_string()))
}

/// Expand command and target names into the ordered command list.
pub fn resolve_commands(config: &FleetConfig, names: &[String]) -> Result<Vec<Command>> {
    let mut commands = Vec::new();

    for name in names {
        if let Some(command) = config.commands.get(name) {
            commands.push(command.clone());
        } else if let Some(target) = config.targets.get(name) {
            for command_name in target {
                // Checked at parse time
                if let Some(command) = config.commands.get(command_name) {
                    commands.push(command.clone());
                }
            }
        } else {
            return Err(FlotillaError::UnknownCommand(name.to_string()));
        }
    }

    if commands.is_empty() {
        return Err(FlotillaError::NoCommands);
    }

    Ok(commands)
}

/// Narrow a network's host list with `--only` / `--except` patterns.
pub fn filter_hosts(network: &Network, only: Option<&str>, except: Option<&str>) -> Result<Network> {
    let compile = |pattern: &str| {
        Regex::new(pattern)
            .map_err(|e| FlotillaError::Validation(format!("Invalid host pattern '{}': {}", pattern, e)))
    };

    let mut filtered = network.clone();

    if let Some(pattern) = only {
        let re = compile(pattern)?;
        filtered.hosts.retain(|host| re.is_match(host));
        if filtered.hosts.is_empty() {
            return Err(FlotillaError::Validation(format!(
                "no hosts match --only '{}'",
                pattern
            )));
        }
    }

    if let Some(pattern) = except {
        let re = compile(pattern)?;
        filtered.hosts.retain(|host| !re.is_match(host));
        if filtered.hosts.is_empty() {
            return Err(FlotillaError::Validation(format!(
                "no hosts left after --except '{}'",
                pattern
            )));
        }
    }

    Ok(filtered)
}
