//! Adaptive per-contract instance pools.
//!
//! An [`InstancePool`] keeps a queue of ready [`VmInstance`]s for one
//! contract version and resizes itself based on demand:
//!
//! - Callers that find the queue empty wait, and signal a growth request
//! - A control task owns all size decisions. It grows on requests and
//!   periodically grows or shrinks based on the observed acquisition delay
//! - Instances that keep failing are discarded and replaced
//!
//! ```text
//!   acquire ──► ready queue ◄── release
//!      │            ▲
//!      │ Grow       │ spawn / teardown
//!      ▼            │
//!   signals ──► control task ◄── refresh timer
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use wasmtime::Linker;

use crate::store::InstanceState;
use crate::{CompiledModule, VmInstance, WasmEngine};
use chain_vm_common::{ContractId, ExecutionConfig, PoolConfig, RuntimeError};

/// Requests handled by a pool's control task.
#[derive(Debug)]
enum PoolSignal {
    /// A caller found the ready queue empty.
    Grow,
    /// Spawn one replacement instance.
    Add,
    /// An instance left the pool for good.
    Remove,
    /// Tear down every ready instance and regrow to the minimum size.
    Reset(oneshot::Sender<()>),
    /// Tear down every ready instance and stop.
    Shutdown(oneshot::Sender<()>),
}

/// Everything needed to create instances of one contract version.
#[derive(Clone)]
pub struct InstanceFactory {
    engine: WasmEngine,
    linker: Arc<Linker<InstanceState>>,
    module: CompiledModule,
    execution: ExecutionConfig,
}

impl InstanceFactory {
    /// Create a factory for a compiled module.
    pub fn new(
        engine: WasmEngine,
        linker: Arc<Linker<InstanceState>>,
        module: CompiledModule,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            engine,
            linker,
            module,
            execution,
        }
    }

    /// Instantiate one new instance.
    pub async fn spawn(&self) -> Result<VmInstance, RuntimeError> {
        VmInstance::instantiate(&self.engine, &self.linker, &self.module, &self.execution).await
    }

    /// The compiled module instances are created from.
    pub fn module(&self) -> &CompiledModule {
        &self.module
    }
}

/// State shared between pool handles and the control task.
struct PoolShared {
    contract: ContractId,
    factory: InstanceFactory,
    config: PoolConfig,

    ready: Mutex<VecDeque<VmInstance>>,
    /// One permit per instance in `ready`. Closed on shutdown.
    available: Semaphore,

    current_size: AtomicU32,
    use_count: AtomicU32,
    total_delay_ms: AtomicU64,
    epoch: AtomicU64,
    closed: AtomicBool,
}

impl PoolShared {
    fn push_ready(&self, instance: VmInstance) {
        self.ready.lock().push_back(instance);
        self.available.add_permits(1);
    }

    /// Take a ready instance without waiting.
    fn try_take(&self) -> Option<VmInstance> {
        let permit = self.available.try_acquire().ok()?;
        permit.forget();
        self.ready.lock().pop_front()
    }

    /// Remove the ready instances no waiter has claimed.
    ///
    /// A waiter that already holds a permit is owed one queued instance, so
    /// only as many instances are taken as permits can be retired. Once the
    /// semaphore is closed no claim is honoured and everything is taken.
    fn drain_ready(&self) -> Vec<VmInstance> {
        let mut ready = self.ready.lock();
        let mut drained = Vec::with_capacity(ready.len());
        while !ready.is_empty() {
            match self.available.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(TryAcquireError::Closed) => {}
                Err(TryAcquireError::NoPermits) => break,
            }
            if let Some(instance) = ready.pop_front() {
                drained.push(instance);
            }
        }
        drained
    }

    fn average_delay_ms(&self) -> u64 {
        let uses = u64::from(self.use_count.load(Ordering::Relaxed));
        if uses == 0 {
            return 0;
        }
        self.total_delay_ms.load(Ordering::Relaxed) / uses
    }

    fn should_grow(&self, apply_grow_count: u32) -> bool {
        let size = self.current_size.load(Ordering::Relaxed);
        if size < self.config.min_size {
            return true;
        }
        if size + self.config.grow_step > self.config.max_size {
            return false;
        }
        apply_grow_count > self.config.apply_threshold
            || self.average_delay_ms() > self.config.delay_tolerance_ms
    }

    fn should_shrink(&self) -> bool {
        let size = self.current_size.load(Ordering::Relaxed);
        size > self.config.min_size
            && size > self.config.grow_step
            && self.average_delay_ms() <= self.config.delay_tolerance_ms
    }

    fn reset_counters(&self) {
        self.use_count.store(0, Ordering::Relaxed);
        self.total_delay_ms.store(0, Ordering::Relaxed);
    }

    async fn spawn_one(&self) -> Result<VmInstance, RuntimeError> {
        let mut instance = self.factory.spawn().await?;
        instance.set_epoch(self.epoch.load(Ordering::Acquire));
        Ok(instance)
    }

    /// Add `count` instances, spawning at most one grow step at a time.
    async fn grow(self: &Arc<Self>, count: u32) {
        let step = self.config.grow_step.max(1);
        let mut remaining = count;

        while remaining > 0 {
            let batch = remaining.min(step);
            remaining -= batch;

            let mut tasks = JoinSet::new();
            for _ in 0..batch {
                let shared = Arc::clone(self);
                tasks.spawn(async move {
                    match shared.spawn_one().await {
                        Ok(instance) => {
                            shared.current_size.fetch_add(1, Ordering::AcqRel);
                            shared.push_ready(instance);
                        }
                        Err(e) => {
                            error!(contract = %shared.contract, error = %e, "Failed to spawn instance");
                        }
                    }
                });
            }
            while tasks.join_next().await.is_some() {}
        }

        debug!(
            contract = %self.contract,
            size = self.current_size.load(Ordering::Relaxed),
            "Pool grown"
        );
    }

    /// Tear down up to `count` instances, waiting for them to become ready.
    async fn shrink(&self, count: u32) {
        for _ in 0..count {
            let Ok(permit) = self.available.acquire().await else {
                return;
            };
            permit.forget();
            let Some(instance) = self.ready.lock().pop_front() else {
                continue;
            };
            self.current_size.fetch_sub(1, Ordering::AcqRel);
            instance.teardown().await;
        }

        debug!(
            contract = %self.contract,
            size = self.current_size.load(Ordering::Relaxed),
            "Pool shrunk"
        );
    }

    async fn teardown_ready(&self) {
        let drained = self.drain_ready();
        let count = u32::try_from(drained.len()).unwrap_or(u32::MAX);
        self.current_size.fetch_sub(count, Ordering::AcqRel);
        for instance in drained {
            instance.teardown().await;
        }
    }
}

/// Handle to the adaptive instance pool of one contract version.
///
/// Handles are cheap to clone; all clones refer to the same pool.
#[derive(Clone)]
pub struct InstancePool {
    shared: Arc<PoolShared>,
    signals: mpsc::UnboundedSender<PoolSignal>,
}

impl InstancePool {
    /// Create a pool, verify the contract can be instantiated, pre-grow it
    /// to the minimum size and start its control task.
    ///
    /// # Errors
    ///
    /// Returns an error if the trial instantiation fails.
    #[instrument(skip_all, fields(contract = %contract))]
    pub async fn new(
        contract: ContractId,
        factory: InstanceFactory,
        config: PoolConfig,
    ) -> Result<Self, RuntimeError> {
        let trial = factory.spawn().await?;
        trial.teardown().await;

        let shared = Arc::new(PoolShared {
            contract,
            factory,
            config,
            ready: Mutex::new(VecDeque::new()),
            available: Semaphore::new(0),
            current_size: AtomicU32::new(0),
            use_count: AtomicU32::new(0),
            total_delay_ms: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        shared.grow(shared.config.min_size).await;

        let (signals, receiver) = mpsc::unbounded_channel();
        tokio::spawn(control_loop(Arc::clone(&shared), receiver));

        info!(
            size = shared.current_size.load(Ordering::Relaxed),
            "Instance pool created"
        );

        Ok(Self { shared, signals })
    }

    /// The contract this pool serves.
    pub fn contract(&self) -> &ContractId {
        &self.shared.contract
    }

    /// The compiled contract this pool instantiates.
    pub fn module(&self) -> &CompiledModule {
        self.shared.factory.module()
    }

    /// Take a ready instance, waiting for one if the queue is empty.
    ///
    /// Waiting callers request growth and their wait time feeds the pool's
    /// sizing decisions.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::PoolClosed`] if the pool is shut down.
    pub async fn acquire(&self) -> Result<VmInstance, RuntimeError> {
        let shared = &self.shared;

        if shared.closed.load(Ordering::Acquire) {
            return Err(self.closed_error());
        }

        let mut instance = match shared.try_take() {
            Some(instance) => {
                shared.use_count.fetch_add(1, Ordering::Relaxed);
                instance
            }
            None => {
                let _ = self.signals.send(PoolSignal::Grow);
                let start = Instant::now();
                let instance = self.wait_ready().await?;
                let delay = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
                shared.total_delay_ms.fetch_add(delay, Ordering::Relaxed);
                shared.use_count.fetch_add(1, Ordering::Relaxed);
                instance
            }
        };

        instance.touch();
        Ok(instance)
    }

    async fn wait_ready(&self) -> Result<VmInstance, RuntimeError> {
        loop {
            let permit = self
                .shared
                .available
                .acquire()
                .await
                .map_err(|_| self.closed_error())?;
            permit.forget();
            if let Some(instance) = self.shared.ready.lock().pop_front() {
                return Ok(instance);
            }
        }
    }

    /// Return an instance after an invocation.
    ///
    /// Instances over the error threshold are discarded and replaced.
    /// Instances from before a reset, detached instances, and anything
    /// returned after shutdown are torn down.
    pub fn release(&self, mut instance: VmInstance) {
        let shared = &self.shared;
        instance.unbind();

        if instance.is_detached() {
            warn!(instance_id = %instance.id(), "Detached instance released to pool");
            tokio::spawn(instance.teardown());
            return;
        }

        if shared.closed.load(Ordering::Acquire) {
            shared.current_size.fetch_sub(1, Ordering::AcqRel);
            tokio::spawn(instance.teardown());
            return;
        }

        if instance.epoch() != shared.epoch.load(Ordering::Acquire) {
            let _ = self.signals.send(PoolSignal::Remove);
            let _ = self.signals.send(PoolSignal::Add);
            tokio::spawn(instance.teardown());
            return;
        }

        if instance.error_count() > shared.config.discard_threshold {
            info!(
                contract = %shared.contract,
                instance_id = %instance.id(),
                errors = instance.error_count(),
                "Discarding failing instance"
            );
            let _ = self.signals.send(PoolSignal::Remove);
            let _ = self.signals.send(PoolSignal::Add);
            tokio::spawn(instance.teardown());
            return;
        }

        shared.push_ready(instance);

        // Lost a race with shutdown.
        if shared.closed.load(Ordering::Acquire) {
            let stranded = shared.drain_ready();
            let count = u32::try_from(stranded.len()).unwrap_or(u32::MAX);
            shared.current_size.fetch_sub(count, Ordering::AcqRel);
            tokio::spawn(async move {
                for instance in stranded {
                    instance.teardown().await;
                }
            });
        }
    }

    /// Drop an instance whose call was interrupted.
    ///
    /// Its guest state is not trusted, so `deallocate` is not run and the
    /// instance never reaches the ready queue. A pooled instance is replaced
    /// by a fresh one. Safe to call outside a Tokio runtime.
    pub fn discard(&self, instance: VmInstance) {
        let shared = &self.shared;
        warn!(
            contract = %shared.contract,
            instance_id = %instance.id(),
            detached = instance.is_detached(),
            "Discarding interrupted instance"
        );

        if !instance.is_detached() {
            if shared.closed.load(Ordering::Acquire) {
                shared.current_size.fetch_sub(1, Ordering::AcqRel);
            } else {
                let _ = self.signals.send(PoolSignal::Remove);
                let _ = self.signals.send(PoolSignal::Add);
            }
        }

        drop(instance);
    }

    /// Create an instance that is not tracked by the pool.
    ///
    /// Used for nested invocations, which must not wait on the pool their
    /// caller may have drained.
    pub async fn spawn_detached(&self) -> Result<VmInstance, RuntimeError> {
        let mut instance = self.shared.factory.spawn().await?;
        instance.mark_detached();
        Ok(instance)
    }

    /// Tear down an instance obtained from [`spawn_detached`](Self::spawn_detached).
    pub async fn close_instance(&self, instance: VmInstance) {
        instance.teardown().await;
    }

    /// Tear down all ready instances and regrow to the minimum size.
    ///
    /// Instances checked out at the time are torn down when released.
    pub async fn reset(&self) {
        let (ack, done) = oneshot::channel();
        if self.signals.send(PoolSignal::Reset(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Stop the control task and tear down all ready instances.
    ///
    /// Waiting callers fail with [`RuntimeError::PoolClosed`]. Instances
    /// checked out at the time are torn down when released.
    pub async fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.available.close();

        let (ack, done) = oneshot::channel();
        if self.signals.send(PoolSignal::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Returns `true` once the pool is shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Instances owned by the pool, ready or checked out.
    pub fn current_size(&self) -> u32 {
        self.shared.current_size.load(Ordering::Acquire)
    }

    /// Instances currently waiting in the ready queue.
    pub fn ready_count(&self) -> usize {
        self.shared.ready.lock().len()
    }

    /// Acquisitions since the last refresh.
    pub fn use_count(&self) -> u32 {
        self.shared.use_count.load(Ordering::Relaxed)
    }

    /// Total acquisition wait since the last refresh.
    pub fn total_delay_ms(&self) -> u64 {
        self.shared.total_delay_ms.load(Ordering::Relaxed)
    }

    /// Average acquisition wait since the last refresh.
    pub fn average_delay_ms(&self) -> u64 {
        self.shared.average_delay_ms()
    }

    fn closed_error(&self) -> RuntimeError {
        RuntimeError::PoolClosed {
            contract: self.shared.contract.key(),
        }
    }
}

impl std::fmt::Debug for InstancePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstancePool")
            .field("contract", &self.shared.contract)
            .field("current_size", &self.current_size())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Control task of one pool. The only place the pool grows or shrinks.
async fn control_loop(shared: Arc<PoolShared>, mut signals: mpsc::UnboundedReceiver<PoolSignal>) {
    let period = shared.config.refresh_interval();
    let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut apply_grow_count: u32 = 0;

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Some(PoolSignal::Grow) => {
                    apply_grow_count = apply_grow_count.saturating_add(1);
                    if shared.should_grow(apply_grow_count) {
                        shared.grow(shared.config.grow_step).await;
                        apply_grow_count = 0;
                        info!(
                            contract = %shared.contract,
                            size = shared.current_size.load(Ordering::Relaxed),
                            "Pool grown on demand"
                        );
                    }
                }
                Some(PoolSignal::Add) => shared.grow(1).await,
                Some(PoolSignal::Remove) => {
                    shared.current_size.fetch_sub(1, Ordering::AcqRel);
                }
                Some(PoolSignal::Reset(ack)) => {
                    shared.epoch.fetch_add(1, Ordering::AcqRel);
                    shared.teardown_ready().await;
                    let size = shared.current_size.load(Ordering::Acquire);
                    shared.grow(shared.config.min_size.saturating_sub(size)).await;
                    shared.reset_counters();
                    apply_grow_count = 0;
                    info!(contract = %shared.contract, "Pool reset");
                    let _ = ack.send(());
                }
                Some(PoolSignal::Shutdown(ack)) => {
                    shared.teardown_ready().await;
                    info!(contract = %shared.contract, "Pool shut down");
                    let _ = ack.send(());
                    return;
                }
                None => {
                    shared.teardown_ready().await;
                    return;
                }
            },
            _ = refresh.tick() => {
                if shared.should_grow(apply_grow_count) {
                    shared.grow(shared.config.grow_step).await;
                } else if shared.should_shrink() {
                    shared.shrink(shared.config.grow_step).await;
                }
                debug!(
                    contract = %shared.contract,
                    size = shared.current_size.load(Ordering::Relaxed),
                    uses = shared.use_count.load(Ordering::Relaxed),
                    average_delay_ms = shared.average_delay_ms(),
                    "Pool refreshed"
                );
                shared.reset_counters();
                apply_grow_count = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_vm_common::EngineConfig;

    const GUEST: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "runtime_type") (result i32) (i32.const 2))
            (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        )
    "#;

    async fn pool(min_size: u32) -> InstancePool {
        let engine = WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap();
        let module = CompiledModule::from_wat(engine.inner(), GUEST).unwrap();
        let linker: Linker<InstanceState> = Linker::new(engine.inner());
        let factory =
            InstanceFactory::new(engine, Arc::new(linker), module, ExecutionConfig::default());
        let config = PoolConfig {
            min_size,
            max_size: 10,
            grow_step: 1,
            ..Default::default()
        };
        InstancePool::new(ContractId::new("counter", "1.0.0"), factory, config)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_drain_leaves_claimed_instances() {
        let pool = pool(3).await;
        let shared = &pool.shared;
        assert_eq!(shared.available.available_permits(), 3);

        // A waiter holding a permit, about to pop.
        shared.available.try_acquire().unwrap().forget();

        let drained = shared.drain_ready();
        assert_eq!(drained.len(), 2);
        assert_eq!(shared.available.available_permits(), 0);
        assert_eq!(shared.ready.lock().len(), 1);

        // The waiter still finds its instance.
        assert!(shared.ready.lock().pop_front().is_some());

        for instance in drained {
            instance.teardown().await;
        }
    }

    #[tokio::test]
    async fn test_drain_after_close_takes_everything() {
        let pool = pool(2).await;
        let shared = &pool.shared;

        shared.available.close();
        let drained = shared.drain_ready();

        assert_eq!(drained.len(), 2);
        assert!(shared.ready.lock().is_empty());
        for instance in drained {
            instance.teardown().await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_permits_match_queue_after_reset_under_load() {
        let pool = pool(2).await;

        let mut workers = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            workers.push(tokio::spawn(async move {
                for _ in 0..20 {
                    let instance = pool.acquire().await.unwrap();
                    tokio::task::yield_now().await;
                    pool.release(instance);
                }
            }));
        }
        for _ in 0..5 {
            pool.reset().await;
            tokio::task::yield_now().await;
        }
        for worker in workers {
            worker.await.unwrap();
        }

        // Let the control task finish replacing pre-reset instances.
        for _ in 0..100 {
            if pool.current_size() as usize == pool.ready_count() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        let shared = &pool.shared;
        assert_eq!(shared.available.available_permits(), shared.ready.lock().len());
        assert_eq!(pool.current_size() as usize, pool.ready_count());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_discard_replaces_pooled_instance() {
        let pool = pool(2).await;

        let instance = pool.acquire().await.unwrap();
        let id = instance.id().to_string();
        pool.discard(instance);

        for _ in 0..100 {
            if pool.ready_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        assert_eq!(pool.current_size(), 2);
        assert_eq!(pool.ready_count(), 2);
        let ids: Vec<String> = pool.shared.ready.lock().iter().map(|i| i.id().to_string()).collect();
        assert!(!ids.contains(&id));

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_discard_detached_leaves_size() {
        let pool = pool(1).await;

        let instance = pool.spawn_detached().await.unwrap();
        pool.discard(instance);
        tokio::task::yield_now().await;

        assert_eq!(pool.current_size(), 1);
        assert_eq!(pool.ready_count(), 1);

        pool.shutdown().await;
    }
}
