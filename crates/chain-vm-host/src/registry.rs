//! Handle-keyed registry of in-flight invocations.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use tracing::debug;

use crate::context::InvocationContext;
use chain_vm_common::RuntimeError;

/// Handles wrap around at this value.
pub const HANDLE_LIMIT: i32 = 100_000_000;

/// Maps handles to the invocations currently running.
///
/// Guests receive the handle in their parameter blob and send it back on
/// every syscall. A handle is never shared by two live invocations:
/// allocation skips handles that are still registered.
#[derive(Debug)]
pub struct ContextRegistry {
    contexts: DashMap<i32, Arc<InvocationContext>>,
    counter: Mutex<i32>,
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// Create an empty registry whose first handle follows `last`.
    pub fn starting_after(last: i32) -> Self {
        Self {
            contexts: DashMap::new(),
            counter: Mutex::new(last.rem_euclid(HANDLE_LIMIT)),
        }
    }

    /// Register a context under a fresh handle.
    ///
    /// # Errors
    ///
    /// Fails only if every handle is in use.
    pub fn register(&self, mut ctx: InvocationContext) -> Result<Arc<InvocationContext>, RuntimeError> {
        let mut counter = self.counter.lock();

        for _ in 0..HANDLE_LIMIT {
            *counter = (*counter + 1) % HANDLE_LIMIT;
            let handle = *counter;

            if let Entry::Vacant(slot) = self.contexts.entry(handle) {
                ctx.set_handle(handle);
                let ctx = Arc::new(ctx);
                slot.insert(Arc::clone(&ctx));
                debug!(handle, contract = %ctx.contract(), "Invocation context registered");
                return Ok(ctx);
            }
        }

        Err(RuntimeError::trap("no free invocation handle"))
    }

    /// Look up a live context.
    pub fn get(&self, handle: i32) -> Option<Arc<InvocationContext>> {
        self.contexts.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a context. Later lookups of the handle fail.
    pub fn remove(&self, handle: i32) -> Option<Arc<InvocationContext>> {
        self.contexts.remove(&handle).map(|(_, ctx)| ctx)
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    /// Returns `true` if no invocation is running.
    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}
