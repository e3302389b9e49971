use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use vmq_engine::BrokerConfig;

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "vmq-server", about = "Persistent message queue broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the broker
    Serve(ServeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Path to the TOML config file
    #[arg(long, default_value = "config.toml", env = "VMQ_CONFIG")]
    pub config: String,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub engine: BrokerConfig,
    /// How long background tasks get to stop before they are aborted.
    #[serde(default = "default_shutdown_drain_ms")]
    pub shutdown_drain_ms: u64,
}

fn default_listen() -> String {
    "0.0.0.0:9200".to_string()
}
fn default_shutdown_drain_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    #[default]
    File,
    Memory,
}

/// `[storage]`: `kind` picks the backend, every other key is handed to the
/// backend's factory as JSON.
#[derive(Debug, Default, Deserialize)]
pub struct StorageSection {
    #[serde(default)]
    pub kind: StorageKind,
    #[serde(flatten)]
    pub options: toml::Table,
}

const DEFAULT_DATA_DIR: &str = "data";

impl StorageSection {
    pub fn config_json(&self) -> Result<String, ServerError> {
        let mut options = self.options.clone();
        if self.kind == StorageKind::File && !options.contains_key("data_dir") {
            options.insert("data_dir".into(), DEFAULT_DATA_DIR.into());
        }
        serde_json::to_string(&options).map_err(|e| ServerError::Config {
            context: "storage",
            detail: e.to_string(),
        })
    }
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path).map_err(|e| ServerError::Config {
            context: "read",
            detail: format!("'{path}': {e}"),
        })?;
        Self::parse(&content).map_err(|e| match e {
            ServerError::Config { context, detail } => ServerError::Config {
                context,
                detail: format!("'{path}': {detail}"),
            },
            other => other,
        })
    }

    pub fn parse(toml_str: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ServerError::Config {
            context: "parse",
            detail: e.to_string(),
        })?;
        config.engine.validate().map_err(|e| ServerError::Config {
            context: "engine",
            detail: e.to_string(),
        })?;
        Ok(config)
    }
}
