//! Configuration management for the lanes server.
//!
//! The TOML file has three tables: `[server]` picks the network and listen
//! address, `[engine]` is the dispatch engine's own [`ServerConfig`], and
//! `[logging]` controls the subscriber.

use crate::cli::CliArgs;
use lane_server::network::split_websocket_addr;
use lane_server::{Network, ServerConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerSettings,
    #[serde(default)]
    pub engine: ServerConfig,
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Listener selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network kind, e.g. "tcp" or "websocket"
    pub network: String,
    /// Listen address; a host-less ":9000" listens on every interface
    pub listen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter. Unset means "info", or "warn" in production mode.
    pub level: Option<String>,
    /// Whether to output logs in JSON format
    #[serde(default)]
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                network: Network::Tcp.to_string(),
                listen: ":9000".to_string(),
            },
            engine: ServerConfig::default().with_core(num_cpus::get()),
            logging: LoggingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file, writing the defaults to `path`
    /// first when it does not exist.
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            Ok(toml::from_str(&content)?)
        } else {
            let default_config = AppConfig::default();
            tokio::fs::write(path, toml::to_string_pretty(&default_config)?).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(network) = &args.network {
            self.server.network = network.clone();
        }
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(cores) = args.cores {
            self.engine.core = cores;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = Some(level.clone());
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if args.prod {
            self.engine.prod = true;
        }
    }

    /// The parsed network kind. Only valid after [`validate`](Self::validate).
    pub fn network(&self) -> anyhow::Result<Network> {
        Ok(self.server.network.parse()?)
    }

    /// Log level in effect once production mode is taken into account.
    pub fn log_level(&self) -> &str {
        match &self.logging.level {
            Some(level) => level,
            None if self.engine.prod => "warn",
            None => "info",
        }
    }

    /// Checks the network kind, listen address and log level.
    pub fn validate(&self) -> Result<(), String> {
        let network: Network = self
            .server
            .network
            .parse()
            .map_err(|_| format!("Invalid network: {}", self.server.network))?;
        if network == Network::Rpc {
            return Err("The rpc network needs an rpc service and cannot be served standalone".to_string());
        }
        if self.engine.multiple {
            return Err("engine.multiple is for embedding several servers in one process".to_string());
        }

        validate_listen(network, &self.server.listen)?;

        let level = self.log_level();
        if !VALID_LEVELS.contains(&level) {
            return Err(format!(
                "Invalid log level: {level}. Must be one of: {VALID_LEVELS:?}"
            ));
        }

        Ok(())
    }
}

fn validate_listen(network: Network, listen: &str) -> Result<(), String> {
    if listen.is_empty() {
        return Err("Listen address cannot be empty".to_string());
    }
    if network == Network::Unix {
        return Ok(());
    }

    let host_port = if network == Network::Websocket {
        split_websocket_addr(listen).0
    } else {
        listen.to_string()
    };
    match host_port.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => Ok(()),
        _ => Err(format!("Invalid listen address: {listen}")),
    }
}
