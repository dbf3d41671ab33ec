//! Configuration structures for chain-vm.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling allocator)
//! - [`ExecutionConfig`]: Per-invocation limits (gas, call depth, memory)
//! - [`PoolConfig`]: Adaptive instance pool sizing policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::RuntimeError;

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the contract VM.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-invocation execution configuration.
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Instance pool sizing policy.
    #[serde(default)]
    pub pool: PoolConfig,
}

impl RuntimeConfig {
    /// Check the configuration for inconsistent values.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        self.pool.validate()?;
        if self.execution.gas_limit == 0 {
            return Err(RuntimeError::invalid_config("gas_limit must be positive"));
        }
        Ok(())
    }
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior,
/// including the memory allocation strategy.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for high-performance instance creation.
    ///
    /// When enabled, memory slots are pre-reserved for every instance the
    /// engine may hold at once.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances across all contract pools.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
        }
    }
}

impl EngineConfig {
    /// Memory per instance slot in bytes.
    pub fn instance_memory_bytes(&self) -> usize {
        (self.instance_memory_mb as usize) * 1024 * 1024
    }
}

/// Per-invocation execution configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Global gas limit shared by a top-level call and all nested calls.
    ///
    /// Gas is metered as Wasmtime fuel.
    #[serde(default = "defaults::gas_limit")]
    pub gas_limit: u64,

    /// Maximum depth of nested cross-contract calls.
    #[serde(default = "defaults::max_call_depth")]
    pub max_call_depth: u32,

    /// Maximum linear memory per instance in megabytes.
    #[serde(default = "defaults::max_memory_mb")]
    pub max_memory_mb: u32,

    /// Fuel consumed between yields back to the async executor.
    ///
    /// A running guest can only be cancelled at a yield point. Zero never
    /// yields.
    #[serde(default = "defaults::fuel_yield_interval")]
    pub fuel_yield_interval: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            gas_limit: defaults::gas_limit(),
            max_call_depth: defaults::max_call_depth(),
            max_memory_mb: defaults::max_memory_mb(),
            fuel_yield_interval: defaults::fuel_yield_interval(),
        }
    }
}

impl ExecutionConfig {
    /// Maximum linear memory in bytes.
    pub fn max_memory_bytes(&self) -> usize {
        (self.max_memory_mb as usize) * 1024 * 1024
    }
}

/// Sizing policy for per-contract instance pools.
///
/// A pool grows by `grow_step` when it is below `min_size`, or when there
/// is room below `max_size` and either the number of blocked acquisitions
/// exceeds `apply_threshold` or the average wait exceeds
/// `delay_tolerance_ms`. It shrinks only on the refresh timer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Minimum number of instances kept ready.
    #[serde(default = "defaults::min_size")]
    pub min_size: u32,

    /// Upper bound on instances owned by one pool.
    #[serde(default = "defaults::max_size")]
    pub max_size: u32,

    /// Instances added or removed per sizing decision.
    #[serde(default = "defaults::grow_step")]
    pub grow_step: u32,

    /// Period of the grow/shrink evaluation timer, in seconds.
    #[serde(default = "defaults::refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Average acquire delay above which the pool grows, in milliseconds.
    #[serde(default = "defaults::delay_tolerance_ms")]
    pub delay_tolerance_ms: u64,

    /// Pending growth requests above which the pool grows.
    #[serde(default = "defaults::apply_threshold")]
    pub apply_threshold: u32,

    /// Consecutive failures after which an instance is discarded.
    #[serde(default = "defaults::discard_threshold")]
    pub discard_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: defaults::min_size(),
            max_size: defaults::max_size(),
            grow_step: defaults::grow_step(),
            refresh_interval_secs: defaults::refresh_interval_secs(),
            delay_tolerance_ms: defaults::delay_tolerance_ms(),
            apply_threshold: defaults::apply_threshold(),
            discard_threshold: defaults::discard_threshold(),
        }
    }
}

impl PoolConfig {
    /// Get the refresh interval as a `Duration`.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    /// Check the sizing bounds.
    pub fn validate(&self) -> Result<(), RuntimeError> {
        if self.max_size == 0 {
            return Err(RuntimeError::invalid_config("pool max_size must be positive"));
        }
        if self.min_size > self.max_size {
            return Err(RuntimeError::invalid_config(format!(
                "pool min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }
        if self.grow_step == 0 {
            return Err(RuntimeError::invalid_config("pool grow_step must be positive"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(RuntimeError::invalid_config(
                "pool refresh_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        true
    }

    pub const fn max_instances() -> u32 {
        1000
    }

    pub const fn instance_memory_mb() -> u32 {
        64
    }

    pub const fn gas_limit() -> u64 {
        10_000_000_000
    }

    pub const fn max_call_depth() -> u32 {
        5
    }

    pub const fn max_memory_mb() -> u32 {
        64
    }

    pub const fn fuel_yield_interval() -> u64 {
        1_000_000
    }

    pub const fn min_size() -> u32 {
        10
    }

    pub const fn max_size() -> u32 {
        1000
    }

    pub const fn grow_step() -> u32 {
        10
    }

    pub const fn refresh_interval_secs() -> u64 {
        12 * 60 * 60
    }

    pub const fn delay_tolerance_ms() -> u64 {
        10
    }

    pub const fn apply_threshold() -> u32 {
        100
    }

    pub const fn discard_threshold() -> u32 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 1000);
        assert_eq!(config.engine.instance_memory_mb, 64);

        assert_eq!(config.execution.gas_limit, 10_000_000_000);
        assert_eq!(config.execution.max_call_depth, 5);
        assert_eq!(config.execution.fuel_yield_interval, 1_000_000);

        assert_eq!(config.pool.min_size, 10);
        assert_eq!(config.pool.max_size, 1000);
        assert_eq!(config.pool.grow_step, 10);
        assert_eq!(config.pool.delay_tolerance_ms, 10);
        assert_eq!(config.pool.apply_threshold, 100);
        assert_eq!(config.pool.discard_threshold, 10);
        assert_eq!(config.pool.refresh_interval(), Duration::from_secs(43_200));
        tokio_test::assert_ok!(config.validate());
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(config.pool.max_size, deserialized.pool.max_size);
        assert_eq!(config.execution.gas_limit, deserialized.execution.gas_limit);
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"pool": {"min_size": 2, "max_size": 4}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.pool.min_size, 2);
        assert_eq!(config.pool.max_size, 4);
        // Defaults for unspecified fields
        assert_eq!(config.pool.grow_step, 10);
        assert_eq!(config.execution.max_call_depth, 5);
    }

    #[test]
    fn test_pool_validation() {
        let config = PoolConfig {
            min_size: 20,
            max_size: 10,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());

        let config = PoolConfig {
            grow_step: 0,
            ..Default::default()
        };
        tokio_test::assert_err!(config.validate());
    }

    #[test]
    fn test_zero_gas_limit_rejected() {
        let mut config = RuntimeConfig::default();
        config.execution.gas_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_memory_bytes() {
        let config = ExecutionConfig {
            max_memory_mb: 2,
            ..Default::default()
        };
        assert_eq!(config.max_memory_bytes(), 2 * 1024 * 1024);
    }
}
