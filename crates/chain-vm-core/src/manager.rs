//! Registry of instance pools, one per contract version.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument, warn};
use wasmtime::Linker;

use crate::pool::{InstanceFactory, InstancePool};
use crate::store::InstanceState;
use crate::{CompiledModule, WasmEngine};
use chain_vm_common::{ContractId, ExecutionConfig, PoolConfig, RuntimeError};

/// Owns the instance pools of one chain.
///
/// Pools are created lazily on the first invocation of a contract version
/// and keyed by `name_version`. Concurrent first invocations create exactly
/// one pool.
pub struct InstanceManager {
    chain_id: String,
    engine: WasmEngine,
    linker: Arc<Linker<InstanceState>>,
    execution: ExecutionConfig,
    pool_config: PoolConfig,
    pools: RwLock<HashMap<String, InstancePool>>,
}

impl InstanceManager {
    /// Create an empty manager.
    pub fn new(
        chain_id: impl Into<String>,
        engine: WasmEngine,
        linker: Arc<Linker<InstanceState>>,
        execution: ExecutionConfig,
        pool_config: PoolConfig,
    ) -> Self {
        Self {
            chain_id: chain_id.into(),
            engine,
            linker,
            execution,
            pool_config,
            pools: RwLock::new(HashMap::new()),
        }
    }

    /// Chain this manager serves.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// The engine all pools compile against.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Get the pool of a contract version, creating it from `bytecode` if
    /// none exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the contract descriptor is incomplete or the
    /// bytecode cannot be compiled or instantiated.
    #[instrument(skip(self, bytecode), fields(chain_id = %self.chain_id, contract = %contract))]
    pub async fn get_or_create_pool(
        &self,
        contract: &ContractId,
        bytecode: &[u8],
    ) -> Result<InstancePool, RuntimeError> {
        let key = contract.key();

        if let Some(pool) = self.pools.read().await.get(&key) {
            return Ok(pool.clone());
        }

        let mut pools = self.pools.write().await;
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }

        if !contract.is_complete() {
            return Err(RuntimeError::invalid_contract(format!(
                "contract name or version missing: {contract:?}"
            )));
        }
        if bytecode.is_empty() {
            return Err(RuntimeError::invalid_contract(format!(
                "no bytecode for contract {contract}"
            )));
        }

        let module = CompiledModule::from_bytes(self.engine.inner(), bytecode)?;
        let missing = module.missing_exports();
        if !missing.is_empty() {
            warn!(?missing, "Contract lacks calling-convention exports, its calls will fail");
        }
        let factory = InstanceFactory::new(
            self.engine.clone(),
            Arc::clone(&self.linker),
            module,
            self.execution.clone(),
        );
        let pool = InstancePool::new(contract.clone(), factory, self.pool_config.clone()).await?;

        pools.insert(key, pool.clone());
        info!(pools = pools.len(), "Contract pool registered");

        Ok(pool)
    }

    /// Get the pool of a contract version, if one exists.
    pub async fn get_pool(&self, contract: &ContractId) -> Option<InstancePool> {
        self.pools.read().await.get(&contract.key()).cloned()
    }

    /// Keys of all registered pools.
    pub async fn pool_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.pools.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Shut down and forget the pool of a contract version.
    ///
    /// The next invocation of that version creates a fresh pool.
    pub async fn close_pool(&self, contract: &ContractId) {
        let removed = self.pools.write().await.remove(&contract.key());
        if let Some(pool) = removed {
            pool.shutdown().await;
            info!(contract = %contract, "Contract pool closed");
        }
    }

    /// Shut down and forget every pool.
    pub async fn close_all(&self) {
        let drained: Vec<InstancePool> = self.pools.write().await.drain().map(|(_, p)| p).collect();
        for pool in drained {
            pool.shutdown().await;
        }
        info!(chain_id = %self.chain_id, "All contract pools closed");
    }

    /// Reset the pool of a contract version, if one exists.
    pub async fn reset_pool(&self, contract: &ContractId) {
        if let Some(pool) = self.get_pool(contract).await {
            pool.reset().await;
        }
    }

    /// Reset every pool.
    pub async fn reset_all(&self) {
        let pools: Vec<InstancePool> = self.pools.read().await.values().cloned().collect();
        for pool in pools {
            pool.reset().await;
        }
    }
}

impl std::fmt::Debug for InstanceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceManager")
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}
