//! Configuration file structures for chain-vm.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ContractEntry`]: Contract bytecode to deploy at startup

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// chain_id = "chain1"
///
/// [runtime.execution]
/// gas_limit = 10_000_000_000
/// max_call_depth = 5
///
/// [runtime.pool]
/// min_size = 10
/// max_size = 1000
/// grow_step = 10
///
/// [[contracts]]
/// name = "counter"
/// version = "1.0.0"
/// path = "./contracts/counter.wasm"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Identifier of the chain this VM serves.
    #[serde(default = "defaults::chain_id")]
    pub chain_id: String,

    /// Runtime configuration (engine, execution and pool settings).
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Contracts deployed into the in-memory ledger at startup.
    #[serde(default)]
    pub contracts: Vec<ContractEntry>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            chain_id: defaults::chain_id(),
            runtime: RuntimeConfig::default(),
            contracts: Vec::new(),
        }
    }
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// A contract deployed at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContractEntry {
    /// Contract name.
    pub name: String,

    /// Contract version.
    pub version: String,

    /// Path to the WebAssembly bytecode.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    pub fn chain_id() -> String {
        "chain1".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert_eq!(config.chain_id, "chain1");
        assert_eq!(config.runtime.pool.min_size, 10);
        assert!(config.contracts.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            chain_id = "chain2"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.chain_id, "chain2");
        // Defaults applied
        assert_eq!(config.runtime.execution.max_call_depth, 5);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            chain_id = "testchain"

            [runtime.engine]
            pooling_allocator = false

            [runtime.execution]
            gas_limit = 5_000_000
            max_call_depth = 3

            [runtime.pool]
            min_size = 2
            max_size = 8
            grow_step = 2
            refresh_interval_secs = 60

            [[contracts]]
            name = "counter"
            version = "1.0.0"
            path = "./counter.wasm"

            [[contracts]]
            name = "assets"
            version = "2.0.0"
            path = "./assets.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.chain_id, "testchain");
        assert!(!config.runtime.engine.pooling_allocator);
        assert_eq!(config.runtime.execution.gas_limit, 5_000_000);
        assert_eq!(config.runtime.execution.max_call_depth, 3);
        assert_eq!(config.runtime.pool.min_size, 2);
        assert_eq!(config.runtime.pool.max_size, 8);
        assert_eq!(config.runtime.pool.refresh_interval_secs, 60);
        assert_eq!(config.contracts.len(), 2);
        assert_eq!(config.contracts[0].name, "counter");
        assert_eq!(config.contracts[1].path, "./assets.wasm");
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }
}
