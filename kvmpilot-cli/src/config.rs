//! Configuration management for the kvmpilot CLI.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use kvmpilot_hypervisor::{Connection, HypervisorConfig, LocalConnection, SshConnection};

use crate::cli::Args;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/kvmpilot/kvmpilot.yaml";

const DEFAULT_SSH_PORT: u16 = 22;

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// How to reach the managed host
    pub connection: ConnectionConfig,
    /// Log level or filter directive
    pub log_level: String,
    pub log_json: bool,
    /// Facade tunables
    pub hypervisor: HypervisorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::Local,
            log_level: "info".to_string(),
            log_json: false,
            hypervisor: HypervisorConfig::default(),
        }
    }
}

/// Transport to the managed host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    /// Run commands on this machine
    Local,
    /// Run commands through the system ssh client
    Ssh {
        host: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(default = "default_ssh_port")]
        port: u16,
    },
}

fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

impl ConnectionConfig {
    pub fn connect(&self) -> Arc<dyn Connection> {
        match self {
            Self::Local => Arc::new(LocalConnection::new()),
            Self::Ssh { host, user, port } => {
                let mut ssh = SshConnection::new(host.clone()).with_port(*port);
                if let Some(user) = user {
                    ssh = ssh.with_user(user.clone());
                }
                Arc::new(ssh)
            }
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .hypervisor
            .validate()
            .with_context(|| format!("Invalid hypervisor section in {}", path.display()))?;

        Ok(config)
    }

    /// Configuration for a run: the explicit `--config` file must load, the
    /// default file is optional. CLI overrides are applied last.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.log_level = level.clone();
        }

        if args.log_json {
            self.log_json = true;
        }

        if let Some(ref host) = args.host {
            let (user, port) = match &self.connection {
                ConnectionConfig::Ssh { user, port, .. } => (user.clone(), *port),
                ConnectionConfig::Local => (None, DEFAULT_SSH_PORT),
            };
            self.connection = ConnectionConfig::Ssh {
                host: host.clone(),
                user,
                port,
            };
        }

        if let ConnectionConfig::Ssh { user, port, .. } = &mut self.connection {
            if let Some(ref u) = args.user {
                *user = Some(u.clone());
            }
            if let Some(p) = args.port {
                *port = p;
            }
        }

        self
    }

    /// Log where the run is pointed at.
    pub fn log_summary(&self) {
        match &self.connection {
            ConnectionConfig::Local => info!("Managing local host"),
            ConnectionConfig::Ssh { host, user, port } => info!(
                host = %host,
                user = user.as_deref().unwrap_or("<default>"),
                port = port,
                "Managing remote host over ssh"
            ),
        }
    }
}
