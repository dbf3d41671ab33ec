//! The Wasmtime engine shared by every contract pool of a chain.
//!
//! Every node on a chain must compute the same result and charge the same
//! gas for the same call. [`WasmEngine`] therefore fixes the compiler
//! settings that could otherwise differ between hosts:
//!
//! - fuel metering is always on, and one unit of fuel is one unit of gas
//! - NaN results of float operations are canonicalized
//! - relaxed SIMD instructions use their deterministic lowering
//!
//! Async support is always on as well: `call_contract` awaits a nested
//! invocation from inside a host function, and a long-running guest yields
//! to the executor between fuel slices.

use std::sync::Arc;

use tracing::info;
use wasmtime::{Config, Engine, InstanceAllocationStrategy, OptLevel, PoolingAllocationConfig};

use chain_vm_common::{EngineConfig, RuntimeError};

/// Compiler and allocator settings for contract code.
///
/// Cheap to clone; clones share the underlying engine.
#[derive(Clone)]
pub struct WasmEngine {
    engine: Arc<Engine>,
    config: EngineConfig,
}

impl WasmEngine {
    /// Build the engine.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InvalidConfig`] if Wasmtime rejects the
    /// settings, for example when the pooling allocator cannot reserve its
    /// slots.
    pub fn new(config: &EngineConfig) -> Result<Self, RuntimeError> {
        let engine = Engine::new(&Self::wasmtime_config(config)).map_err(|e| {
            RuntimeError::invalid_config(format!("contract engine rejected its settings: {e}"))
        })?;

        info!(
            pooling_allocator = config.pooling_allocator,
            max_instances = config.max_instances,
            instance_memory_mb = config.instance_memory_mb,
            "Contract engine ready"
        );

        Ok(Self {
            engine: Arc::new(engine),
            config: config.clone(),
        })
    }

    fn wasmtime_config(config: &EngineConfig) -> Config {
        let mut wasmtime_config = Config::new();

        // Metering and re-entrancy.
        wasmtime_config.consume_fuel(true);
        wasmtime_config.async_support(true);

        // Same bits on every node.
        wasmtime_config.cranelift_nan_canonicalization(true);
        wasmtime_config.relaxed_simd_deterministic(true);
        wasmtime_config.cranelift_opt_level(OptLevel::Speed);

        if config.pooling_allocator {
            wasmtime_config.allocation_strategy(InstanceAllocationStrategy::Pooling(
                Self::slot_config(config),
            ));
        }

        wasmtime_config
    }

    /// One slot per instance the whole chain may hold at once, across all
    /// of its contract pools.
    fn slot_config(config: &EngineConfig) -> PoolingAllocationConfig {
        let mut slots = PoolingAllocationConfig::default();
        slots
            .total_core_instances(config.max_instances)
            .total_memories(config.max_instances)
            .total_tables(config.max_instances)
            .max_memory_size(config.instance_memory_bytes());
        slots
    }

    /// The Wasmtime engine.
    pub fn inner(&self) -> &Engine {
        &self.engine
    }

    /// Settings this engine was built with.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether instance memory comes from pre-reserved slots.
    pub fn is_pooling_enabled(&self) -> bool {
        self.config.pooling_allocator
    }
}

impl std::fmt::Debug for WasmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmEngine")
            .field("pooling_allocator", &self.config.pooling_allocator)
            .field("max_instances", &self.config.max_instances)
            .finish_non_exhaustive()
    }
}
