//! Layered configuration: an embedded `default.toml`, optionally overlaid by
//! a user-supplied file, overlaid by `NODE__`-prefixed environment variables.

use std::collections::{HashMap, HashSet};

use config::builder::DefaultState;
use config::{
    Config as ConfigRaw,
    ConfigBuilder,
    ConfigError,
    Environment,
    File,
    FileFormat,
};
use serde::Deserialize;
use valuable::Valuable;

/// A named service this process can host. A single node binary hosts the
/// union of roles listed under `[main] roles` in its config; which services
/// actually bind a listener and join the module tree depends on this set.
#[derive(Debug, Valuable, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Gateway,
    Scheduler,
    Dispatcher,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MainConfig {
    pub node_id: u64,
    pub roles: HashSet<Role>,
    pub advertise_address: String,
    pub rpc_port: u16,
    pub prometheus_address: String,
    pub prometheus_port: u16,
    /// Seed peers for the static `DiscoverySource`: node id to RPC address.
    pub peers: HashMap<u64, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub address: String,
    pub port: u16,
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    pub max_triggers_per_tick: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherConfig {
    pub worker_threads: usize,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub main: MainConfig,
    pub gateway: GatewayConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug)]
pub struct ConfigLoader {
    builder: ConfigBuilder<DefaultState>,
}

impl ConfigLoader {
    /// Loads a fresh copy of the configuration from source.
    pub fn load(&self) -> Result<Config, ConfigError> {
        Self::deserialize(self.builder.build_cloned()?)
    }

    /// Creates a new loader configured to load the embedded defaults and
    /// overlay the user-supplied config, if any.
    ///
    /// * `config_file`: path of an optional config file to overlay.
    pub fn from_path(path: &Option<String>) -> ConfigLoader {
        let raw = include_str!("default.toml");
        let mut builder = ConfigRaw::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .add_source(
                Environment::with_prefix("NODE")
                    .try_parsing(true)
                    .separator("__")
                    .list_separator(","),
            );
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path));
        }
        ConfigLoader { builder }
    }

    fn deserialize(config: ConfigRaw) -> Result<Config, ConfigError> {
        config.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_embedded_defaults() {
        let loader = ConfigLoader::from_path(&None);
        let config = loader.load().expect("default.toml must deserialize");
        assert!(config.main.node_id > 0 || config.main.node_id == 0);
        assert!(!config.main.roles.is_empty());
    }
}
