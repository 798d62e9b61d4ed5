//! Configuration management for burrow-admin.
//!
//! Handles loading and saving configuration from the platform config
//! directory (`burrow-admin/config.toml`), or an explicit `--config` path.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::protocol::ForwardSpec;

const DEFAULT_ADDRESS: &str = "127.0.0.1:9000";
const DEFAULT_LISTEN: &str = "0.0.0.0:9000";
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Canned services available to `burrow-admin tunnel <name>`
const DEFAULT_SERVICES: &[(&str, &str)] = &[
    ("postgres", "127.0.0.1:5432:postgres:5432"),
    ("redis", "127.0.0.1:6379:redis:6379"),
    ("api", "127.0.0.1:8080:api:8080"),
    ("search", "127.0.0.1:9200:search:9200"),
];

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub server: ServerConfig,
    /// Extra or overriding service definitions (name -> forward spec)
    #[serde(default)]
    pub services: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub address: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: Option<String>,
    pub dial_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub max_session_secs: Option<u64>,
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "burrow-admin")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }

    /// Resolve the management server address: CLI/env > config > default
    pub fn client_address(&self, cli: Option<String>) -> String {
        cli.or_else(|| self.client.address.clone())
            .unwrap_or_else(|| DEFAULT_ADDRESS.to_string())
    }

    pub fn client_timeout(&self, cli: Option<u64>) -> Duration {
        Duration::from_secs(
            cli.or(self.client.timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn server_listen(&self, cli: Option<String>) -> String {
        cli.or_else(|| self.server.listen.clone())
            .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
    }

    pub fn dial_timeout(&self, cli: Option<u64>) -> Duration {
        Duration::from_secs(
            cli.or(self.server.dial_timeout_secs)
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(
            self.server
                .handshake_timeout_secs
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
        )
    }

    /// Zero disables the limit
    pub fn max_session(&self, cli: Option<u64>) -> Option<Duration> {
        cli.or(self.server.max_session_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Built-in services merged with the `[services]` table
    pub fn service_table(&self) -> Result<ServiceTable> {
        let mut table = ServiceTable::default();
        for (name, spec) in &self.services {
            let spec: ForwardSpec = spec
                .parse()
                .with_context(|| format!("Invalid definition for service '{}'", name))?;
            table.insert(name.clone(), spec);
        }
        Ok(table)
    }
}

/// Named forwarding rules, passed explicitly into the tunnel client
#[derive(Debug, Clone)]
pub struct ServiceTable {
    services: BTreeMap<String, ForwardSpec>,
}

impl Default for ServiceTable {
    fn default() -> Self {
        let services = DEFAULT_SERVICES
            .iter()
            .filter_map(|(name, spec)| spec.parse().ok().map(|s| (name.to_string(), s)))
            .collect();
        Self { services }
    }
}

impl ServiceTable {
    pub fn insert(&mut self, name: String, spec: ForwardSpec) {
        self.services.insert(name, spec);
    }

    pub fn get(&self, name: &str) -> Option<&ForwardSpec> {
        self.services.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ForwardSpec)> {
        self.services.iter()
    }

    /// Look up every name, failing on the first unknown one
    pub fn resolve<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<ForwardSpec>> {
        names
            .iter()
            .map(|name| {
                let name = name.as_ref();
                self.get(name).cloned().with_context(|| {
                    let known: Vec<&str> = self.services.keys().map(String::as_str).collect();
                    format!("Unknown service '{}' (known: {})", name, known.join(", "))
                })
            })
            .collect()
    }
}
