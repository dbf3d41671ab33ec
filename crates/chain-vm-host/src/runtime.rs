//! Contract invocation.
//!
//! [`Runtime`] ties the pieces together: it owns the instance manager, the
//! context registry and the linker with every host function registered.
//! One invocation goes through these steps:
//!
//! ```text
//! select instance ──▶ inject gas ──▶ call ──▶ reconcile ──▶ release
//!   depth 0: pooled     limit minus    type check, gas used,      unbind,
//!   depth > 0: fresh    caller chain   params,     faults,        release or
//!                                      method      events         tear down
//! ```
//!
//! Faults inside the guest, including panics in host code it calls into,
//! never escape [`Runtime::invoke`]: they become failure results. Dropping
//! an `invoke` future part way still unregisters its context; the instance
//! it held is discarded rather than returned to the pool.

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{debug, error, info, instrument, warn};
use wasmtime::Linker;

use crate::context::InvocationContext;
use crate::crypto::{CryptoProvider, UnsupportedCrypto};
use crate::ledger::TxContext;
use crate::linker::register_all;
use crate::registry::ContextRegistry;
use crate::syscall::SyscallDispatcher;
use chain_vm_common::abi::{CONTEXT_PTR_PARAM, INIT_METHOD, RUNTIME_TYPE_ID};
use chain_vm_common::{
    ContractId, ContractResult, ExecOrderTxType, KvCodec, RuntimeConfig, RuntimeError,
};
use chain_vm_core::{InstanceManager, InstancePool, VmInstance, WasmEngine};

/// One contract call.
#[derive(Clone)]
pub struct InvokeRequest {
    /// Contract to call.
    pub contract: ContractId,
    /// Its bytecode, used to create the pool on first use.
    pub bytecode: Arc<[u8]>,
    /// Exported method to call.
    pub method: String,
    /// Input parameters.
    pub params: BTreeMap<String, Vec<u8>>,
    /// Transaction the call runs in.
    pub tx: Arc<dyn TxContext>,
    /// Gas already consumed by the caller chain.
    pub gas_used: u64,
    /// Cross-contract call depth, zero for a top-level call.
    pub depth: u32,
}

impl InvokeRequest {
    /// A top-level call with no parameters.
    pub fn new(
        contract: ContractId,
        bytecode: impl Into<Arc<[u8]>>,
        method: impl Into<String>,
        tx: Arc<dyn TxContext>,
    ) -> Self {
        Self {
            contract,
            bytecode: bytecode.into(),
            method: method.into(),
            params: BTreeMap::new(),
            tx,
            gas_used: 0,
            depth: 0,
        }
    }

    /// Add a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

impl std::fmt::Debug for InvokeRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvokeRequest")
            .field("contract", &self.contract)
            .field("method", &self.method)
            .field("tx_id", &self.tx.tx_id())
            .field("gas_used", &self.gas_used)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

/// Contract runtime of one chain.
///
/// Cheap to clone; clones share pools and registry. Invocation contexts
/// carry a clone so that cross-contract calls can re-enter the runtime.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

struct RuntimeInner {
    config: RuntimeConfig,
    manager: InstanceManager,
    registry: Arc<ContextRegistry>,
}

impl Runtime {
    /// Create a runtime without crypto support.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine
    /// cannot be created.
    pub fn new(chain_id: impl Into<String>, config: RuntimeConfig) -> Result<Self, RuntimeError> {
        Self::with_crypto(chain_id, config, Arc::new(UnsupportedCrypto))
    }

    /// Create a runtime whose crypto syscalls go to `crypto`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine
    /// cannot be created.
    pub fn with_crypto(
        chain_id: impl Into<String>,
        config: RuntimeConfig,
        crypto: Arc<dyn CryptoProvider>,
    ) -> Result<Self, RuntimeError> {
        config.validate()?;

        let engine = WasmEngine::new(&config.engine)?;
        let registry = Arc::new(ContextRegistry::new());
        let dispatcher = Arc::new(SyscallDispatcher::new(Arc::clone(&registry), crypto));

        let mut linker = Linker::new(engine.inner());
        register_all(&mut linker, dispatcher)?;

        let manager = InstanceManager::new(
            chain_id,
            engine,
            Arc::new(linker),
            config.execution.clone(),
            config.pool.clone(),
        );

        info!(
            chain_id = %manager.chain_id(),
            gas_limit = config.execution.gas_limit,
            max_call_depth = config.execution.max_call_depth,
            "Contract runtime created"
        );

        Ok(Self {
            inner: Arc::new(RuntimeInner {
                config,
                manager,
                registry,
            }),
        })
    }

    /// The configuration this runtime was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    /// Gas budget of one top-level invocation, shared by its nested calls.
    pub fn gas_limit(&self) -> u64 {
        self.inner.config.execution.gas_limit
    }

    /// The pools of this runtime.
    pub fn manager(&self) -> &InstanceManager {
        &self.inner.manager
    }

    /// Invocations currently running.
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.inner.registry
    }

    /// Invoke a contract method.
    ///
    /// Guest failures are reported in the returned result, not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the call is nested too deeply, the contract
    /// cannot be compiled or instantiated, or its pool is closed.
    #[instrument(
        skip_all,
        fields(
            contract = %request.contract,
            method = %request.method,
            tx_id = %request.tx.tx_id(),
            depth = request.depth
        )
    )]
    pub async fn invoke(&self, request: InvokeRequest) -> Result<ContractResult, RuntimeError> {
        let started = Instant::now();
        let max_depth = self.inner.config.execution.max_call_depth;
        if request.depth > max_depth {
            return Err(RuntimeError::CallDepthExceeded {
                depth: request.depth,
                max: max_depth,
            });
        }

        let pool = self
            .inner
            .manager
            .get_or_create_pool(&request.contract, &request.bytecode)
            .await?;

        let detached = request.depth > 0;
        let acquired = if detached {
            pool.spawn_detached().await?
        } else {
            pool.acquire().await?
        };
        let mut lease = Lease {
            pool,
            registry: Arc::clone(&self.inner.registry),
            handle: None,
            instance: None,
        };
        let instance = lease.instance.insert(acquired);

        let InvokeRequest {
            contract,
            method,
            params,
            tx,
            gas_used,
            depth,
            ..
        } = request;
        let tx_id = tx.tx_id().to_string();

        let ctx = InvocationContext::new(contract.clone(), method.as_str(), tx, depth, params)
            .with_runtime(self.clone())
            .with_instance_id(instance.id());
        let ctx = match self.inner.registry.register(ctx) {
            Ok(ctx) => ctx,
            Err(e) => {
                lease.finish().await;
                return Err(e);
            }
        };
        lease.handle = Some(ctx.handle());
        instance.bind(ctx.handle());

        let limit = self.gas_limit();
        let budget = limit.saturating_sub(gas_used);
        debug!(handle = ctx.handle(), instance_id = %instance.id(), budget, "Invocation started");

        let outcome = AssertUnwindSafe(call_guest(instance, &ctx, budget))
            .catch_unwind()
            .await;

        let (fault, panicked) = match outcome {
            Ok(Ok(())) => (None, false),
            Ok(Err(e)) => (Some(e.to_string()), false),
            Err(panic) => (
                Some(format!("host panic: {}", panic_message(panic.as_ref()))),
                true,
            ),
        };

        // Reconcile.
        let remaining = instance.remaining_gas();
        let used = limit.saturating_sub(remaining);
        let fault = if remaining == 0 {
            Some(RuntimeError::OutOfGas { used, limit }.to_string())
        } else {
            fault
        };

        let mut result = ctx.take_result();
        result.gas_used = used;
        if panicked {
            result.special_tx_type = ExecOrderTxType::Normal;
        }

        let close_pool = match &fault {
            Some(reason) => {
                result.code = ContractResult::FAILURE;
                result.message = format!("contract invoke failed, {reason}, tx: {tx_id}");
                result.events.clear();
                error!(gas_used = used, "{}", result.message);

                if method == INIT_METHOD {
                    true
                } else {
                    instance.record_error();
                    false
                }
            }
            None => {
                instance.clear_errors();
                false
            }
        };

        // Release.
        drop(ctx);
        lease.finish().await;

        if close_pool {
            warn!("Initialization failed, closing contract pool");
            self.inner.manager.close_pool(&contract).await;
        }

        #[allow(clippy::cast_possible_truncation)]
        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            code = result.code,
            gas_used = used,
            elapsed_ms,
            "Invocation finished"
        );

        Ok(result)
    }

    /// Invoke from inside a syscall.
    ///
    /// Boxed so that an invocation may be awaited from within another.
    pub(crate) fn invoke_nested(
        &self,
        request: InvokeRequest,
    ) -> BoxFuture<'static, Result<ContractResult, RuntimeError>> {
        let runtime = self.clone();
        async move { runtime.invoke(request).await }.boxed()
    }

    /// Close every pool.
    pub async fn shutdown(&self) {
        self.inner.manager.close_all().await;
        info!(chain_id = %self.inner.manager.chain_id(), "Contract runtime shut down");
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("chain_id", &self.inner.manager.chain_id())
            .field("live_invocations", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

/// An instance checked out for one invocation, and the handle of the
/// context registered for it.
///
/// A lease dropped before [`finish`](Self::finish), as when the invoking
/// future is cancelled mid-call, unregisters the context and discards the
/// instance.
struct Lease {
    pool: InstancePool,
    registry: Arc<ContextRegistry>,
    handle: Option<i32>,
    instance: Option<VmInstance>,
}

impl Lease {
    /// Unregister the context and return the instance.
    async fn finish(mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.remove(handle);
        }
        if let Some(mut instance) = self.instance.take() {
            instance.unbind();
            if instance.is_detached() {
                self.pool.close_instance(instance).await;
            } else {
                self.pool.release(instance);
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.registry.remove(handle);
        }
        if let Some(instance) = self.instance.take() {
            self.pool.discard(instance);
        }
    }
}

/// Check the runtime type, marshal parameters and call the method.
async fn call_guest(
    instance: &mut VmInstance,
    ctx: &InvocationContext,
    budget: u64,
) -> Result<(), RuntimeError> {
    instance.set_gas(budget)?;

    let runtime_type = instance.runtime_type().await?;
    if runtime_type != RUNTIME_TYPE_ID {
        return Err(RuntimeError::RuntimeTypeMismatch {
            expected: RUNTIME_TYPE_ID,
            actual: runtime_type,
        });
    }

    let params = KvCodec::with_params(CONTEXT_PTR_PARAM, ctx.handle(), ctx.params()).encode();
    instance.write_params(&params).await?;

    instance.call_method(ctx.method()).await
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");

        let payload: Box<dyn Any + Send> = Box::new(7);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = RuntimeConfig::default();
        config.execution.gas_limit = 0;

        assert!(Runtime::new("chain1", config).is_err());
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let config = RuntimeConfig::default();
        let max = config.execution.max_call_depth;
        let runtime = Runtime::new("chain1", config).unwrap();

        let mut request = InvokeRequest::new(
            ContractId::new("counter", "1.0.0"),
            Vec::<u8>::new(),
            "increase",
            crate::ledger::MemoryLedger::new().begin("tx1"),
        );
        request.depth = max + 1;

        let err = runtime.invoke(request).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CallDepthExceeded { .. }));
    }
}
