//! Per-instance store state and gas accounting.
//!
//! This module provides:
//! - [`InstanceState`]: Data attached to every instance's [`Store`],
//!   reachable from host functions through [`wasmtime::Caller`]
//! - [`create_store`]: Store construction with memory limits and fuel
//! - Fuel helpers translating between gas and Wasmtime fuel

use wasmtime::{Store, StoreLimits, StoreLimitsBuilder};

use crate::WasmEngine;
use chain_vm_common::{ExecutionConfig, RuntimeError};

/// Store data of one VM instance.
///
/// An instance outlives many invocations. The only per-invocation field is
/// the bound context handle, set while the instance runs on behalf of an
/// invocation and cleared when it goes back to its pool.
pub struct InstanceState {
    /// Unique instance identifier for tracing.
    instance_id: String,

    /// Handle of the invocation currently using this instance.
    bound_handle: Option<i32>,

    /// Memory and table growth limits.
    limits: StoreLimits,
}

impl InstanceState {
    /// Create state for a fresh instance.
    pub fn new(instance_id: String, config: &ExecutionConfig) -> Self {
        let limits = StoreLimitsBuilder::new()
            .memory_size(config.max_memory_bytes())
            .build();

        Self {
            instance_id,
            bound_handle: None,
            limits,
        }
    }

    /// Get the instance identifier.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Handle of the invocation this instance currently serves.
    pub fn bound_handle(&self) -> Option<i32> {
        self.bound_handle
    }

    /// Bind the instance to an invocation handle.
    pub fn bind(&mut self, handle: i32) {
        self.bound_handle = Some(handle);
    }

    /// Clear the invocation binding.
    pub fn unbind(&mut self) {
        self.bound_handle = None;
    }
}

impl std::fmt::Debug for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceState")
            .field("instance_id", &self.instance_id)
            .field("bound_handle", &self.bound_handle)
            .finish_non_exhaustive()
    }
}

/// Create a new Wasmtime store for an instance.
///
/// The store starts with the full gas limit as fuel so that instantiation
/// (data segments, start function) can run. Calls yield to the executor
/// every `fuel_yield_interval` units of fuel, so a spinning guest can be
/// cancelled by dropping its future. Each invocation replaces the
/// fuel with its own remaining budget before calling into the guest.
///
/// # Errors
///
/// Returns an error if fuel cannot be set on the store.
pub fn create_store(
    engine: &WasmEngine,
    config: &ExecutionConfig,
    instance_id: String,
) -> Result<Store<InstanceState>, RuntimeError> {
    let state = InstanceState::new(instance_id, config);
    let mut store = Store::new(engine.inner(), state);

    store.limiter(|state| &mut state.limits);

    set_gas(&mut store, config.gas_limit)?;

    if config.fuel_yield_interval > 0 {
        store
            .fuel_async_yield_interval(Some(config.fuel_yield_interval))
            .map_err(|e| {
                RuntimeError::invalid_config(format!("Failed to set fuel yield interval: {e}"))
            })?;
    }

    Ok(store)
}

/// Replace the remaining fuel of a store.
///
/// # Errors
///
/// Returns an error if fuel metering is not enabled on the engine.
pub fn set_gas<T>(store: &mut Store<T>, gas: u64) -> Result<(), RuntimeError> {
    store
        .set_fuel(gas)
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to set fuel: {e}")))
}

/// Get remaining fuel from a store, zero if metering is unavailable.
pub fn remaining_gas<T>(store: &Store<T>) -> u64 {
    store.get_fuel().unwrap_or(0)
}

/// Calculate gas consumed since the store held `initial` fuel.
pub fn gas_consumed<T>(initial: u64, store: &Store<T>) -> u64 {
    initial.saturating_sub(remaining_gas(store))
}
