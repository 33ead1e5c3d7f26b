//! Core data models for the fleet configuration

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;

// Input validation limits
pub const MAX_CONFIG_SIZE: usize = 1_048_576; // 1 MB
pub const MAX_NAME_LEN: usize = 64;

/// Host identifier that selects a local endpoint instead of SSH
pub const LOCALHOST: &str = "localhost";

/// Variable exported to every command naming the host it runs on
pub const HOST_ENV_VAR: &str = "FLOTILLA_HOST";

/// Fleet configuration parsed from YAML
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub env: EnvList,
    #[serde(default)]
    pub networks: BTreeMap<String, Network>,
    #[serde(default)]
    pub commands: BTreeMap<String, Command>,
    #[serde(default)]
    pub targets: BTreeMap<String, Vec<String>>,
}

/// A named group of hosts sharing a user and an optional bastion
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Network {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub bastion: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub env: EnvList,
}

impl Network {
    /// Bastion address, treating an empty string as absent
    pub fn bastion(&self) -> Option<&str> {
        self.bastion.as_deref().filter(|b| !b.trim().is_empty())
    }
}

/// A unit of work: exactly one of `run`, `script` or `local`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Command {
    #[serde(skip)]
    pub name: String,
    #[serde(default)]
    pub desc: Option<String>,
    #[serde(default)]
    pub run: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub local: Option<String>,
    /// Forward the operator's stdin to every target
    #[serde(default)]
    pub stdin: bool,
    /// Run on the first host only
    #[serde(default)]
    pub once: bool,
    /// Run in batches of this many hosts (0 = all at once)
    #[serde(default)]
    pub serial: usize,
    /// Allocate a pseudo-terminal on remote hosts
    #[serde(default)]
    pub tty: bool,
}

/// Run-wide failure policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The first error aborts the run
    #[default]
    FailFast,
    /// Errors are recorded and the run continues
    Tolerant,
}

impl FailurePolicy {
    pub fn from_ignore_errors(ignore: bool) -> Self {
        if ignore {
            FailurePolicy::Tolerant
        } else {
            FailurePolicy::FailFast
        }
    }

    pub fn is_tolerant(self) -> bool {
        self == FailurePolicy::Tolerant
    }
}

/// Single environment variable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub key: String,
    pub value: String,
}

/// Ordered list of environment variables.
///
/// Order is preserved from the config file so later values may refer to
/// earlier ones (`PATH: $HOME/bin:$PATH`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvList(Vec<EnvVar>);

impl EnvList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a variable, replacing an existing one in place
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|v| v.key == key) {
            Some(existing) => existing.value = value,
            None => self.0.push(EnvVar { key, value }),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// Merge `other` on top of this list
    pub fn extend(&mut self, other: &EnvList) {
        for var in &other.0 {
            self.set(var.key.clone(), var.value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnvVar> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Render as a shell preamble: `export KEY="VALUE";` per variable
    pub fn as_export(&self) -> String {
        self.0
            .iter()
            .map(|v| export_line(&v.key, &v.value))
            .collect()
    }
}

/// Render one `export` statement. Only double quotes are escaped so `$VAR`
/// references still expand on the target.
pub fn export_line(key: &str, value: &str) -> String {
    format!("export {}=\"{}\";", key, value.replace('"', "\\\""))
}

impl<'de> Deserialize<'de> for EnvList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EnvVisitor;

        impl<'de> Visitor<'de> for EnvVisitor {
            type Value = EnvList;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of environment variables")
            }

            fn visit_unit<E: de::Error>(self) -> Result<EnvList, E> {
                Ok(EnvList::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<EnvList, A::Error> {
                let mut env = EnvList::new();
                while let Some((key, value)) = map.next_entry::<String, serde_yaml::Value>()? {
                    let value = match value {
                        serde_yaml::Value::Null => String::new(),
                        serde_yaml::Value::Bool(b) => b.to_string(),
                        serde_yaml::Value::Number(n) => n.to_string(),
                        serde_yaml::Value::String(s) => s,
                        _ => {
                            return Err(de::Error::custom(format!(
                                "env variable '{}' must be a scalar",
                                key
                            )))
                        }
                    };
                    env.set(key, value);
                }
                Ok(env)
            }
        }

        deserializer.deserialize_any(EnvVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_list_preserves_order() {
        let yaml = r#"
B: two
A: one
C: 3
D: true
"#;
        let env: EnvList = serde_yaml::from_str(yaml).unwrap();
        let keys: Vec<_> = env.iter().map(|v| v.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A", "C", "D"]);
        assert_eq!(env.get("C"), Some("3"));
        assert_eq!(env.get("D"), Some("true"));
    }

    #[test]
    fn test_env_set_replaces_in_place() {
        let mut env = EnvList::new();
        env.set("A", "1");
        env.set("B", "2");
        env.set("A", "3");
        assert_eq!(env.len(), 2);
        assert_eq!(env.as_export(), "export A=\"3\";export B=\"2\";");
    }

    #[test]
    fn test_export_escapes_quotes() {
        assert_eq!(
            export_line("MSG", r#"say "hi" to $USER"#),
            r#"export MSG="say \"hi\" to $USER";"#
        );
    }

    #[test]
    fn test_network_empty_bastion_is_absent() {
        let yaml = r#"
hosts: [web1, web2]
bastion: ""
"#;
        let network: Network = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(network.hosts.len(), 2);
        assert!(network.bastion().is_none());

        let network = Network {
            bastion: Some("jump.example.com".to_string()),
            ..Default::default()
        };
        assert_eq!(network.bastion(), Some("jump.example.com"));
    }

    #[test]
    fn test_command_defaults() {
        let yaml = r#"
run: uptime
"#;
        let command: Command = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(command.run.as_deref(), Some("uptime"));
        assert!(!command.stdin);
        assert!(!command.once);
        assert_eq!(command.serial, 0);
        assert!(!command.tty);
    }

    #[test]
    fn test_failure_policy() {
        assert_eq!(FailurePolicy::default(), FailurePolicy::FailFast);
        assert!(FailurePolicy::from_ignore_errors(true).is_tolerant());
        assert!(!FailurePolicy::from_ignore_errors(false).is_tolerant());
    }
}
