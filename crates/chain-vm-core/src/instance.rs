//! Reusable contract instances.
//!
//! A [`VmInstance`] is one instantiated copy of a contract module together
//! with its store. Pools hand instances out to invocations and take them
//! back afterwards; the per-invocation protocol is:
//!
//! 1. Bind the invocation handle and set the gas budget
//! 2. Check the runtime type
//! 3. Write the parameter blob through the guest allocator
//! 4. Call the requested method
//! 5. Unbind and return the instance to its pool

use std::time::Instant;

use tracing::{debug, instrument, warn};
use wasmtime::{Extern, Instance, Linker, Memory, Store, Trap, Val};

use crate::store::{InstanceState, create_store, remaining_gas, set_gas};
use crate::{CompiledModule, WasmEngine};
use chain_vm_common::abi::{ALLOCATE_METHOD, DEALLOCATE_METHOD, MEMORY_EXPORT, RUNTIME_TYPE_METHOD};
use chain_vm_common::{ExecutionConfig, RuntimeError};

/// Fuel granted to the `deallocate` call made during teardown.
const TEARDOWN_GAS: u64 = 1_000_000;

/// One instantiated contract module and its store.
pub struct VmInstance {
    id: String,
    store: Store<InstanceState>,
    instance: Instance,
    created_at: Instant,
    last_used: Instant,
    error_count: u32,
    epoch: u64,
    detached: bool,
}

impl VmInstance {
    /// Instantiate a module into a fresh store.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::InstantiationFailed`] if imports cannot be
    /// resolved or the start function traps.
    #[instrument(skip_all, fields(module = %module.code_hash()))]
    pub async fn instantiate(
        engine: &WasmEngine,
        linker: &Linker<InstanceState>,
        module: &CompiledModule,
        config: &ExecutionConfig,
    ) -> Result<Self, RuntimeError> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut store = create_store(engine, config, id.clone())?;

        let instance = linker
            .instantiate_async(&mut store, module.as_module())
            .await
            .map_err(|e| RuntimeError::instantiation_failed(format!("{e:#}")))?;

        debug!(instance_id = %id, "Instance created");

        let now = Instant::now();
        Ok(Self {
            id,
            store,
            instance,
            created_at: now,
            last_used: now,
            error_count: 0,
            epoch: 0,
            detached: false,
        })
    }

    /// Get the instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the instance was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When the instance was last handed out.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Consecutive failed invocations on this instance.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Record a failed invocation.
    pub fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    /// Reset the consecutive error counter after a successful invocation.
    pub fn clear_errors(&mut self) {
        self.error_count = 0;
    }

    /// Pool generation the instance was created in.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(crate) fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Returns `true` if the instance was created outside of any pool.
    pub fn is_detached(&self) -> bool {
        self.detached
    }

    pub(crate) fn mark_detached(&mut self) {
        self.detached = true;
    }

    /// Bind the instance to an invocation handle.
    pub fn bind(&mut self, handle: i32) {
        self.store.data_mut().bind(handle);
    }

    /// Clear the invocation binding.
    pub fn unbind(&mut self) {
        self.store.data_mut().unbind();
    }

    /// Handle of the invocation currently bound, if any.
    pub fn bound_handle(&self) -> Option<i32> {
        self.store.data().bound_handle()
    }

    /// Replace the remaining gas of this instance.
    pub fn set_gas(&mut self, gas: u64) -> Result<(), RuntimeError> {
        set_gas(&mut self.store, gas)
    }

    /// Gas left in the store.
    pub fn remaining_gas(&self) -> u64 {
        remaining_gas(&self.store)
    }

    /// Returns `true` if the module exports a function with this name.
    pub fn has_export(&mut self, name: &str) -> bool {
        self.instance.get_func(&mut self.store, name).is_some()
    }

    fn memory(&mut self) -> Result<Memory, RuntimeError> {
        self.instance
            .get_export(&mut self.store, MEMORY_EXPORT)
            .and_then(Extern::into_memory)
            .ok_or_else(|| RuntimeError::export_not_found(MEMORY_EXPORT))
    }

    /// Ask the guest which runtime type it was built for.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExportNotFound`] if the export is missing, or
    /// a trap error if it fails.
    pub async fn runtime_type(&mut self) -> Result<i32, RuntimeError> {
        let func = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, RUNTIME_TYPE_METHOD)
            .map_err(|_| RuntimeError::export_not_found(RUNTIME_TYPE_METHOD))?;

        func.call_async(&mut self.store, ())
            .await
            .map_err(|e| trap_error(&e))
    }

    /// Copy the parameter blob into guest memory.
    ///
    /// Space is obtained from the guest's `allocate` export. Returns the
    /// guest pointer of the copied bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `allocate` or `memory` is not exported, the
    /// allocator traps, or the returned region lies outside memory.
    pub async fn write_params(&mut self, params: &[u8]) -> Result<i32, RuntimeError> {
        let allocate = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, ALLOCATE_METHOD)
            .map_err(|_| RuntimeError::export_not_found(ALLOCATE_METHOD))?;

        let len = i32::try_from(params.len())
            .map_err(|_| RuntimeError::trap(format!("parameter blob too large: {}", params.len())))?;

        let ptr = allocate
            .call_async(&mut self.store, len)
            .await
            .map_err(|e| trap_error(&e))?;

        let offset = usize::try_from(ptr)
            .map_err(|_| RuntimeError::trap(format!("allocate returned negative pointer {ptr}")))?;

        let memory = self.memory()?;
        memory
            .write(&mut self.store, offset, params)
            .map_err(|e| RuntimeError::trap(format!("write parameters at {ptr}: {e}")))?;

        Ok(ptr)
    }

    /// Call an exported contract method.
    ///
    /// Methods take no arguments; they read their parameters through
    /// syscalls. Any return values are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::ExportNotFound`] if the method is not
    /// exported, or [`RuntimeError::Trap`] if execution traps (including
    /// running out of fuel).
    #[instrument(skip(self), fields(instance_id = %self.id))]
    pub async fn call_method(&mut self, method: &str) -> Result<(), RuntimeError> {
        let func = self
            .instance
            .get_func(&mut self.store, method)
            .ok_or_else(|| RuntimeError::export_not_found(method))?;

        let result_count = func.ty(&self.store).results().len();
        let mut results = vec![Val::I32(0); result_count];

        func.call_async(&mut self.store, &[], &mut results)
            .await
            .map_err(|e| {
                if is_out_of_fuel(&e) {
                    warn!(method, "Execution terminated: fuel exhausted");
                } else {
                    debug!(method, error = %e, "Execution trapped");
                }
                trap_error(&e)
            })
    }

    /// Release guest resources and drop the instance.
    ///
    /// Calls the guest's `deallocate` export, if any, before the store is
    /// dropped. Failures are logged and otherwise ignored.
    pub async fn teardown(mut self) {
        if let Ok(deallocate) = self
            .instance
            .get_typed_func::<i32, ()>(&mut self.store, DEALLOCATE_METHOD)
        {
            if self.store.set_fuel(TEARDOWN_GAS).is_ok() {
                if let Err(e) = deallocate.call_async(&mut self.store, 0).await {
                    debug!(instance_id = %self.id, error = %e, "deallocate failed during teardown");
                }
            }
        }

        debug!(instance_id = %self.id, "Instance torn down");
    }
}

impl std::fmt::Debug for VmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmInstance")
            .field("id", &self.id)
            .field("error_count", &self.error_count)
            .field("epoch", &self.epoch)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// Convert a Wasmtime call error into a trap error with a readable message.
fn trap_error(error: &wasmtime::Error) -> RuntimeError {
    let message = match error.downcast_ref::<Trap>() {
        Some(trap) => format!("{error:#} ({trap:?})"),
        None => format!("{error:#}"),
    };
    RuntimeError::trap(message)
}

/// Check if an error is due to fuel exhaustion.
fn is_out_of_fuel(error: &wasmtime::Error) -> bool {
    error
        .downcast_ref::<Trap>()
        .is_some_and(|trap| *trap == Trap::OutOfFuel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_vm_common::EngineConfig;

    const GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $next (mut i32) (i32.const 1024))
            (func (export "runtime_type") (result i32) (i32.const 2))
            (func (export "allocate") (param i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $next))
                (global.set $next (i32.add (global.get $next) (local.get 0)))
                (local.get $ptr))
            (func (export "first_byte") (result i32)
                (i32.load8_u (i32.const 1024)))
            (func (export "spin")
                (loop $l (br $l)))
            (func (export "boom") unreachable)
        )
    "#;

    async fn instance() -> VmInstance {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        let module = CompiledModule::from_wat(engine.inner(), GUEST).unwrap();
        let linker = Linker::new(engine.inner());

        VmInstance::instantiate(&engine, &linker, &module, &ExecutionConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_runtime_type_reported() {
        let mut vm = instance().await;
        assert_eq!(vm.runtime_type().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_write_params_uses_guest_allocator() {
        let mut vm = instance().await;

        let ptr = vm.write_params(&[7, 8, 9]).await.unwrap();
        assert_eq!(ptr, 1024);

        let second = vm.write_params(&[1]).await.unwrap();
        assert_eq!(second, 1027);
    }

    #[tokio::test]
    async fn test_call_missing_method() {
        let mut vm = instance().await;

        let err = vm.call_method("increase").await.unwrap_err();
        assert_eq!(err.to_string(), "method [increase] not export");
    }

    #[tokio::test]
    async fn test_call_method_ignores_results() {
        let mut vm = instance().await;
        vm.write_params(&[5]).await.unwrap();

        tokio_test::assert_ok!(vm.call_method("first_byte").await);
    }

    #[tokio::test]
    async fn test_out_of_gas_drains_fuel() {
        let mut vm = instance().await;
        vm.set_gas(10_000).unwrap();

        let err = vm.call_method("spin").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Trap { .. }));
        assert_eq!(vm.remaining_gas(), 0);
    }

    #[tokio::test]
    async fn test_trap_is_reported() {
        let mut vm = instance().await;

        let err = vm.call_method("boom").await.unwrap_err();
        assert!(matches!(err, RuntimeError::Trap { .. }));
        assert!(vm.remaining_gas() > 0);
    }

    #[tokio::test]
    async fn test_binding_and_errors() {
        let mut vm = instance().await;

        vm.bind(7);
        assert_eq!(vm.bound_handle(), Some(7));
        vm.unbind();
        assert_eq!(vm.bound_handle(), None);

        vm.record_error();
        vm.record_error();
        assert_eq!(vm.error_count(), 2);
        vm.clear_errors();
        assert_eq!(vm.error_count(), 0);

        vm.teardown().await;
    }
}
