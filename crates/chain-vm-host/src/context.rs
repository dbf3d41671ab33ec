//! Per-invocation state reachable from syscalls.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::ledger::{ResultSet, StateIterator, TxContext};
use crate::runtime::Runtime;
use chain_vm_common::{ContractEvent, ContractId, ContractResult, ExecOrderTxType, SyscallError};

/// State of one contract invocation.
///
/// Created by the invoker, registered in the
/// [`ContextRegistry`](crate::ContextRegistry) under a handle for the
/// duration of the call, and looked up by the syscall dispatcher whenever
/// the guest calls back into the host. Mutable parts sit behind a mutex:
/// the guest is single threaded, so the lock is never contended.
pub struct InvocationContext {
    handle: i32,
    contract: ContractId,
    method: String,
    tx: Arc<dyn TxContext>,
    depth: u32,
    instance_id: String,
    params: BTreeMap<String, Vec<u8>>,
    runtime: Option<Runtime>,
    state: Mutex<ContextState>,
}

#[derive(Default)]
struct ContextState {
    result: ContractResult,
    /// Bytes produced by the last length call, waiting to be fetched.
    cache: Option<Vec<u8>>,
    iterators: HashMap<i32, Box<dyn StateIterator>>,
    result_sets: HashMap<i32, Box<dyn ResultSet>>,
    next_cursor: i32,
    logs: Vec<String>,
}

impl InvocationContext {
    /// Create a context for calling `method` on `contract`.
    pub fn new(
        contract: ContractId,
        method: impl Into<String>,
        tx: Arc<dyn TxContext>,
        depth: u32,
        params: BTreeMap<String, Vec<u8>>,
    ) -> Self {
        Self {
            handle: 0,
            contract,
            method: method.into(),
            tx,
            depth,
            instance_id: String::new(),
            params,
            runtime: None,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Attach the runtime used for cross-contract calls.
    #[must_use]
    pub fn with_runtime(mut self, runtime: Runtime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Record which instance runs this invocation.
    #[must_use]
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    pub(crate) fn set_handle(&mut self, handle: i32) {
        self.handle = handle;
    }

    /// Registry handle of this invocation.
    pub fn handle(&self) -> i32 {
        self.handle
    }

    /// The contract being invoked.
    pub fn contract(&self) -> &ContractId {
        &self.contract
    }

    /// The method being invoked.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The transaction this invocation runs in.
    pub fn tx(&self) -> &Arc<dyn TxContext> {
        &self.tx
    }

    /// Cross-contract call depth, zero for a top-level call.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Identifier of the instance running this invocation.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Input parameters.
    pub fn params(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.params
    }

    /// Runtime used for cross-contract calls, if attached.
    pub fn runtime(&self) -> Option<&Runtime> {
        self.runtime.as_ref()
    }

    // ---- result -----------------------------------------------------------

    /// Mark the invocation failed and append `msg` to the result message.
    pub fn record_error(&self, msg: &str) {
        self.state.lock().result.record_error(msg);
    }

    /// Set the success payload. Returns `false` if the invocation already
    /// failed.
    pub fn set_success(&self, result: Vec<u8>) -> bool {
        let mut state = self.state.lock();
        if !state.result.is_success() {
            return false;
        }
        state.result.result = result;
        true
    }

    /// Mark the invocation failed with a message supplied by the contract.
    pub fn set_error(&self, msg: &str) {
        let mut state = self.state.lock();
        let message = &mut state.result.message;
        if message.is_empty() {
            message.push_str("contract message: ");
        } else {
            message.push_str(". contract message: ");
        }
        message.push_str(msg);
        state.result.code = ContractResult::FAILURE;
    }

    /// Fold a scheduling class into this invocation's.
    pub fn merge_tx_type(&self, tx_type: ExecOrderTxType) {
        let mut state = self.state.lock();
        state.result.special_tx_type = state.result.special_tx_type.merge(tx_type);
    }

    /// Current scheduling class.
    pub fn tx_type(&self) -> ExecOrderTxType {
        self.state.lock().result.special_tx_type
    }

    /// Current result code.
    pub fn result_code(&self) -> u32 {
        self.state.lock().result.code
    }

    /// Add emitted events.
    pub fn push_events(&self, events: impl IntoIterator<Item = ContractEvent>) {
        self.state.lock().result.events.extend(events);
    }

    /// Take the result record, leaving an empty one behind.
    pub fn take_result(&self) -> ContractResult {
        std::mem::take(&mut self.state.lock().result)
    }

    // ---- length-probe cache -------------------------------------------------

    /// Store bytes for the following fetch call, replacing any pending ones.
    /// Returns their length.
    pub fn cache_result(&self, bytes: Vec<u8>) -> usize {
        let len = bytes.len();
        self.state.lock().cache = Some(bytes);
        len
    }

    /// Take the pending bytes, clearing the cache. Empty if nothing was
    /// cached.
    pub fn take_cached(&self) -> Vec<u8> {
        self.state.lock().cache.take().unwrap_or_default()
    }

    /// Drop any pending bytes.
    pub fn clear_cache(&self) {
        self.state.lock().cache = None;
    }

    /// Returns `true` if bytes are waiting to be fetched.
    pub fn has_cached(&self) -> bool {
        self.state.lock().cache.is_some()
    }

    // ---- iterators and result sets -----------------------------------------

    /// Keep an iterator open and return its index.
    pub fn open_iterator(&self, iter: Box<dyn StateIterator>) -> i32 {
        let mut state = self.state.lock();
        let index = state.next_cursor;
        state.next_cursor = state.next_cursor.wrapping_add(1);
        state.iterators.insert(index, iter);
        index
    }

    /// Run `f` on an open iterator.
    pub fn with_iterator<R>(
        &self,
        index: i32,
        f: impl FnOnce(&mut dyn StateIterator) -> R,
    ) -> Result<R, SyscallError> {
        let mut state = self.state.lock();
        let iter = state
            .iterators
            .get_mut(&index)
            .ok_or(SyscallError::UnknownIterator { index })?;
        Ok(f(iter.as_mut()))
    }

    /// Close an iterator.
    pub fn close_iterator(&self, index: i32) -> Result<(), SyscallError> {
        self.state
            .lock()
            .iterators
            .remove(&index)
            .map(|_| ())
            .ok_or(SyscallError::UnknownIterator { index })
    }

    /// Keep a result set open and return its index.
    pub fn open_result_set(&self, rs: Box<dyn ResultSet>) -> i32 {
        let mut state = self.state.lock();
        let index = state.next_cursor;
        state.next_cursor = state.next_cursor.wrapping_add(1);
        state.result_sets.insert(index, rs);
        index
    }

    /// Run `f` on an open result set.
    pub fn with_result_set<R>(
        &self,
        index: i32,
        f: impl FnOnce(&mut dyn ResultSet) -> R,
    ) -> Result<R, SyscallError> {
        let mut state = self.state.lock();
        let rs = state
            .result_sets
            .get_mut(&index)
            .ok_or(SyscallError::UnknownIterator { index })?;
        Ok(f(rs.as_mut()))
    }

    /// Close a result set.
    pub fn close_result_set(&self, index: i32) -> Result<(), SyscallError> {
        self.state
            .lock()
            .result_sets
            .remove(&index)
            .map(|_| ())
            .ok_or(SyscallError::UnknownIterator { index })
    }

    // ---- guest logs ---------------------------------------------------------

    /// Record a guest log line.
    pub fn push_log(&self, line: String) {
        self.state.lock().logs.push(line);
    }

    /// Guest log lines recorded so far.
    pub fn logs(&self) -> Vec<String> {
        self.state.lock().logs.clone()
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("handle", &self.handle)
            .field("contract", &self.contract)
            .field("method", &self.method)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, VecStateIterator};

    fn context() -> InvocationContext {
        let ledger = MemoryLedger::new();
        InvocationContext::new(
            ContractId::new("counter", "1.0.0"),
            "increase",
            ledger.begin("tx1"),
            0,
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_cache_is_one_shot() {
        let ctx = context();

        assert_eq!(ctx.cache_result(vec![1, 2, 3]), 3);
        assert!(ctx.has_cached());
        assert_eq!(ctx.take_cached(), vec![1, 2, 3]);
        assert!(!ctx.has_cached());
        assert!(ctx.take_cached().is_empty());
    }

    #[test]
    fn test_contract_messages_are_separated() {
        let ctx = context();

        ctx.set_error("bad amount");
        ctx.set_error("bad owner");

        let result = ctx.take_result();
        assert_eq!(result.code, 1);
        assert_eq!(
            result.message,
            "contract message: bad amount. contract message: bad owner"
        );
    }

    #[test]
    fn test_tx_type_sticks_once_iterator() {
        let ctx = context();
        assert_eq!(ctx.tx_type(), ExecOrderTxType::Normal);

        ctx.merge_tx_type(ExecOrderTxType::Iterator);
        ctx.merge_tx_type(ExecOrderTxType::Normal);

        assert_eq!(ctx.take_result().special_tx_type, ExecOrderTxType::Iterator);
    }

    #[test]
    fn test_success_after_error_is_rejected() {
        let ctx = context();

        assert!(ctx.set_success(b"ok".to_vec()));
        ctx.record_error("boom");
        assert!(!ctx.set_success(b"late".to_vec()));

        let result = ctx.take_result();
        assert_eq!(result.code, 1);
        assert_eq!(result.result, b"ok");
        assert_eq!(result.message, "error message: boom");
    }

    #[test]
    fn test_iterator_lifecycle() {
        let ctx = context();
        let index = ctx.open_iterator(Box::new(VecStateIterator::new(vec![(
            b"k".to_vec(),
            b"v".to_vec(),
        )])));

        assert!(ctx.with_iterator(index, |it| it.has_next()).unwrap());
        ctx.close_iterator(index).unwrap();
        assert!(ctx.with_iterator(index, |it| it.has_next()).is_err());
        assert!(ctx.close_iterator(index).is_err());
    }
}
