//! Dispatch of guest requests made through `env.sys_call`.
//!
//! # Request format
//!
//! The guest passes two regions of its memory:
//! - a header, a key-value blob with `ctx_ptr` (the invocation handle) and
//!   `method` (the host operation)
//! - a body, whose layout depends on the method
//!
//! The return value is `0` on success and `1` on failure. Failures are never
//! raised as traps; the reason is appended to the invocation's result
//! message instead.
//!
//! # Length-probe protocol
//!
//! Operations returning variable-sized data come in pairs. The `*_len` call
//! runs the operation, keeps the bytes on the invocation context and writes
//! their length (i32, little endian) at the guest's `value_ptr`. The guest
//! allocates a buffer and makes the data call, which copies the kept bytes to
//! `value_ptr` and clears them.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, error, warn};
use wasmtime::{Caller, Extern, Memory};

use crate::context::InvocationContext;
use crate::crypto::CryptoProvider;
use crate::ledger::{Row, TxContext};
use crate::logging::LoggingHost;
use crate::registry::ContextRegistry;
use crate::runtime::InvokeRequest;
use chain_vm_common::abi::{
    HEADER_CTX_PTR, HEADER_METHOD, MEMORY_EXPORT, SIGNAL_FAIL, SIGNAL_SUCCESS, methods,
};
use chain_vm_common::{ContractEvent, ExecOrderTxType, KeyType, KvCodec, SyscallError, Value};
use chain_vm_core::InstanceState;

/// Separator between key and field in stored state keys.
pub const FIELD_SEPARATOR: u8 = b'#';

/// Maximum length of an event topic.
pub const EVENT_TOPIC_MAX_LEN: usize = 255;

/// Maximum number of data entries in one event.
pub const EVENT_DATA_MAX_COUNT: usize = 16;

/// What a handler hands back to the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Success, nothing to write.
    Done,
    /// Success, copy `bytes` into guest memory at `ptr`.
    Write {
        /// Guest destination.
        ptr: i32,
        /// Bytes to copy.
        bytes: Vec<u8>,
    },
    /// Failure signal without an error message.
    Rejected,
}

impl Reply {
    fn int32(ptr: i32, value: i32) -> Self {
        Self::Write {
            ptr,
            bytes: value.to_le_bytes().to_vec(),
        }
    }

    fn length(ptr: i32, len: usize) -> Self {
        Self::int32(ptr, i32::try_from(len).unwrap_or(i32::MAX))
    }
}

/// Routes guest syscalls to host operations.
pub struct SyscallDispatcher {
    registry: Arc<ContextRegistry>,
    crypto: Arc<dyn CryptoProvider>,
}

impl SyscallDispatcher {
    /// Create a dispatcher over a context registry.
    pub fn new(registry: Arc<ContextRegistry>, crypto: Arc<dyn CryptoProvider>) -> Self {
        Self { registry, crypto }
    }

    /// The registry contexts are looked up in.
    pub fn registry(&self) -> &Arc<ContextRegistry> {
        &self.registry
    }

    /// Handle one `env.sys_call` from the guest.
    pub async fn sys_call(
        &self,
        caller: &mut Caller<'_, InstanceState>,
        header_ptr: i32,
        header_len: i32,
        body_ptr: i32,
        body_len: i32,
    ) -> i32 {
        if header_len == 0 {
            warn!("sys_call with empty request header");
            return SIGNAL_FAIL;
        }

        let (header, body) = match read_request(caller, header_ptr, header_len, body_ptr, body_len)
        {
            Ok(regions) => regions,
            Err(e) => {
                warn!(error = %e, "sys_call request outside guest memory");
                return SIGNAL_FAIL;
            }
        };

        let (handle, method) = match decode_header(&header) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "sys_call header undecodable");
                return SIGNAL_FAIL;
            }
        };

        let bound = caller.data().bound_handle();
        if bound != Some(handle) {
            warn!(handle, ?bound, method = %method, "sys_call handle not bound to calling instance");
            return SIGNAL_FAIL;
        }

        let Some(ctx) = self.registry.get(handle) else {
            let e = SyscallError::ContextNotFound { handle };
            warn!(error = %e, method = %method, "sys_call rejected");
            return SIGNAL_FAIL;
        };

        debug!(handle, method = %method, "Entering syscall");

        let outcome = match method.as_str() {
            methods::CALL_CONTRACT_LEN => call_contract(caller, &ctx, &body).await,
            _ => self.handle(&ctx, &method, &body),
        };

        let signal = match outcome.and_then(|reply| apply_reply(caller, reply)) {
            Ok(signal) => signal,
            Err(e) => {
                let msg = e.to_string();
                error!(
                    handle,
                    contract = %ctx.contract(),
                    method = %method,
                    error = %msg,
                    "Syscall failed"
                );
                ctx.record_error(&msg);
                SIGNAL_FAIL
            }
        };

        debug!(handle, method = %method, signal, "Leaving syscall");
        signal
    }

    /// Run a host operation that does not re-enter the VM.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown methods, malformed bodies and failed
    /// ledger or crypto operations.
    pub fn handle(
        &self,
        ctx: &InvocationContext,
        method: &str,
        body: &[u8],
    ) -> Result<Reply, SyscallError> {
        match method {
            methods::LOG_MESSAGE => {
                LoggingHost::log(ctx, &String::from_utf8_lossy(body));
                return Ok(Reply::Done);
            }
            methods::SUCCESS_RESULT => {
                return Ok(if ctx.set_success(body.to_vec()) {
                    Reply::Done
                } else {
                    Reply::Rejected
                });
            }
            methods::ERROR_RESULT => {
                ctx.set_error(&String::from_utf8_lossy(body));
                return Ok(Reply::Done);
            }
            m if !methods::ALL.contains(&m) => {
                return Err(SyscallError::UnknownMethod {
                    method: m.to_string(),
                });
            }
            _ => {}
        }

        let body = KvCodec::decode(body)?;
        let tx = ctx.tx();
        let contract = ctx.contract().name.as_str();

        match method {
            // ---- state ----
            methods::GET_STATE_LEN => {
                let key = state_key(&body, "key", "field")?;
                let value = tx.get(contract, &key)?.unwrap_or_default();
                let len = ctx.cache_result(value);
                Ok(Reply::length(value_ptr(&body)?, len))
            }
            methods::PUT_STATE => {
                let key = state_key(&body, "key", "field")?;
                tx.put(contract, &key, &body.get_bytes("value")?)?;
                Ok(Reply::Done)
            }
            methods::DELETE_STATE => {
                let key = state_key(&body, "key", "field")?;
                tx.delete(contract, &key)?;
                Ok(Reply::Done)
            }
            methods::KV_ITERATOR => {
                ctx.merge_tx_type(ExecOrderTxType::Iterator);
                let start = state_key(&body, "start_key", "start_field")?;
                let limit = state_key(&body, "limit_key", "limit_field")?;
                let iter = tx.select(contract, &start, &limit)?;
                Ok(Reply::int32(value_ptr(&body)?, ctx.open_iterator(iter)))
            }
            methods::KV_PRE_ITERATOR => {
                ctx.merge_tx_type(ExecOrderTxType::Iterator);
                let prefix = state_key(&body, "prefix", "field")?;
                let iter = tx.select_prefix(contract, &prefix)?;
                Ok(Reply::int32(value_ptr(&body)?, ctx.open_iterator(iter)))
            }
            methods::KV_ITERATOR_HAS_NEXT => {
                let index = body.get_i32("rs_index")?;
                let has_next = ctx.with_iterator(index, |it| it.has_next())?;
                Ok(Reply::int32(value_ptr(&body)?, i32::from(has_next)))
            }
            methods::KV_ITERATOR_NEXT_LEN => {
                let index = body.get_i32("rs_index")?;
                let (key, value) = ctx
                    .with_iterator(index, |it| it.next_pair())?
                    .ok_or_else(|| exhausted(index))?;
                let len = ctx.cache_result(encode_pair(&key, value));
                Ok(Reply::length(value_ptr(&body)?, len))
            }
            methods::KV_ITERATOR_CLOSE => {
                ctx.close_iterator(body.get_i32("rs_index")?)?;
                Ok(Reply::Done)
            }

            // ---- relational ----
            methods::EXECUTE_UPDATE => {
                let affected = tx.execute_update(contract, body.get_string("sql")?)?;
                Ok(Reply::int32(value_ptr(&body)?, affected))
            }
            methods::EXECUTE_DDL => {
                tx.execute_ddl(contract, body.get_string("sql")?)?;
                Ok(Reply::Done)
            }
            methods::EXECUTE_QUERY => {
                let rs = tx.query(contract, body.get_string("sql")?)?;
                Ok(Reply::int32(value_ptr(&body)?, ctx.open_result_set(rs)))
            }
            methods::EXECUTE_QUERY_ONE_LEN => {
                let row = tx.query_one(contract, body.get_string("sql")?)?;
                let len = ctx.cache_result(encode_row(&row.unwrap_or_default()));
                Ok(Reply::length(value_ptr(&body)?, len))
            }
            methods::RS_HAS_NEXT => {
                let index = body.get_i32("rs_index")?;
                let has_next = ctx.with_result_set(index, |rs| rs.has_next())?;
                Ok(Reply::int32(value_ptr(&body)?, i32::from(has_next)))
            }
            methods::RS_NEXT_LEN => {
                let index = body.get_i32("rs_index")?;
                let row = ctx
                    .with_result_set(index, |rs| rs.next_row())?
                    .ok_or_else(|| exhausted(index))?;
                let len = ctx.cache_result(encode_row(&row));
                Ok(Reply::length(value_ptr(&body)?, len))
            }
            methods::RS_CLOSE => {
                ctx.close_result_set(body.get_i32("rs_index")?)?;
                Ok(Reply::Done)
            }

            // ---- events ----
            methods::EMIT_EVENT => {
                let event = build_event(ctx, tx.as_ref(), &body)?;
                ctx.push_events([event]);
                Ok(Reply::Done)
            }

            // ---- crypto ----
            methods::GET_PAILLIER_RESULT_LEN => {
                let out = self.crypto.paillier(body.get_string("op")?, &body)?;
                let len = ctx.cache_result(out);
                Ok(Reply::length(value_ptr(&body)?, len))
            }
            methods::GET_BULLETPROOFS_RESULT_LEN => {
                let out = self.crypto.bulletproofs(body.get_string("op")?, &body)?;
                let len = ctx.cache_result(out);
                Ok(Reply::length(value_ptr(&body)?, len))
            }

            // ---- fetch halves of the length-probe pairs ----
            methods::GET_STATE
            | methods::KV_ITERATOR_NEXT
            | methods::EXECUTE_QUERY_ONE
            | methods::RS_NEXT
            | methods::CALL_CONTRACT
            | methods::GET_PAILLIER_RESULT
            | methods::GET_BULLETPROOFS_RESULT => Ok(Reply::Write {
                ptr: value_ptr(&body)?,
                bytes: ctx.take_cached(),
            }),

            other => Err(SyscallError::UnknownMethod {
                method: other.to_string(),
            }),
        }
    }
}

impl std::fmt::Debug for SyscallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyscallDispatcher")
            .field("live_contexts", &self.registry.len())
            .finish_non_exhaustive()
    }
}

/// Run a nested contract call and keep its result for the fetch call.
///
/// The callee is charged against the caller's remaining gas, and whatever it
/// consumed is taken from the caller when it returns.
async fn call_contract(
    caller: &mut Caller<'_, InstanceState>,
    ctx: &InvocationContext,
    body: &[u8],
) -> Result<Reply, SyscallError> {
    let body = KvCodec::decode(body)?;
    let ptr = value_ptr(&body)?;

    let runtime = ctx
        .runtime()
        .cloned()
        .ok_or_else(|| SyscallError::call_contract("cross-contract calls are not available"))?;

    let name = body.get_string("contract_name")?;
    let method = body.get_string("method")?;
    if name.is_empty() || method.is_empty() {
        return Err(SyscallError::invalid_argument(
            "contract_name and method are required",
        ));
    }
    let params = match body.get("param") {
        Some(_) => KvCodec::decode(&body.get_bytes("param")?)?.to_map(),
        None => BTreeMap::new(),
    };

    let (contract, bytecode) = ctx.tx().get_contract(name)?;

    let limit = runtime.gas_limit();
    let remaining = caller.get_fuel().unwrap_or(0);
    let request = InvokeRequest {
        contract,
        bytecode,
        method: method.to_string(),
        params,
        tx: Arc::clone(ctx.tx()),
        gas_used: limit.saturating_sub(remaining),
        depth: ctx.depth() + 1,
    };

    let result = runtime
        .invoke_nested(request)
        .await
        .map_err(|e| SyscallError::call_contract(e.to_string()))?;

    caller
        .set_fuel(limit.saturating_sub(result.gas_used))
        .map_err(|e| SyscallError::call_contract(format!("gas accounting failed: {e}")))?;

    ctx.merge_tx_type(result.special_tx_type);
    if !result.is_success() {
        ctx.clear_cache();
        return Err(SyscallError::call_contract(result.message));
    }

    ctx.push_events(result.events);
    let len = ctx.cache_result(result.result);
    Ok(Reply::length(ptr, len))
}

fn decode_header(header: &[u8]) -> Result<(i32, String), SyscallError> {
    let header = KvCodec::decode(header)?;
    let handle = header.get_i32(HEADER_CTX_PTR)?;
    let method = header.get_string(HEADER_METHOD)?.to_string();
    Ok((handle, method))
}

fn value_ptr(body: &KvCodec) -> Result<i32, SyscallError> {
    Ok(body.get_i32("value_ptr")?)
}

fn exhausted(index: i32) -> SyscallError {
    SyscallError::invalid_argument(format!("cursor {index} has no next element"))
}

/// Compose a stored key from a key item and an optional field item.
fn state_key(body: &KvCodec, key: &str, field: &str) -> Result<Vec<u8>, SyscallError> {
    let key = body.get_string(key)?;
    let field = body.get_string_or_default(field)?;
    Ok(join_key(key, field))
}

/// `key#field`, or `key` when the field is empty.
pub fn join_key(key: &str, field: &str) -> Vec<u8> {
    let mut out = key.as_bytes().to_vec();
    if !field.is_empty() {
        out.push(FIELD_SEPARATOR);
        out.extend_from_slice(field.as_bytes());
    }
    out
}

/// Split a stored key at the first separator.
pub fn split_key(stored: &[u8]) -> (String, String) {
    match stored.iter().position(|b| *b == FIELD_SEPARATOR) {
        Some(pos) => (
            String::from_utf8_lossy(&stored[..pos]).into_owned(),
            String::from_utf8_lossy(&stored[pos + 1..]).into_owned(),
        ),
        None => (String::from_utf8_lossy(stored).into_owned(), String::new()),
    }
}

fn encode_pair(stored_key: &[u8], value: Vec<u8>) -> Vec<u8> {
    let (key, field) = split_key(stored_key);
    let mut codec = KvCodec::new();
    codec
        .push_string(KeyType::User, "key", key)
        .push_string(KeyType::User, "field", field)
        .push_bytes(KeyType::User, "value", value);
    codec.encode()
}

fn encode_row(row: &Row) -> Vec<u8> {
    KvCodec::from_map(row).encode()
}

fn build_event(
    ctx: &InvocationContext,
    tx: &dyn TxContext,
    body: &KvCodec,
) -> Result<ContractEvent, SyscallError> {
    let topic = body.get_string("topic")?;
    if topic.is_empty() || topic.len() > EVENT_TOPIC_MAX_LEN {
        return Err(SyscallError::invalid_argument(format!(
            "event topic length must be 1..={EVENT_TOPIC_MAX_LEN}, got {}",
            topic.len()
        )));
    }

    let data: Vec<String> = body
        .items()
        .iter()
        .filter(|item| item.key != "topic")
        .filter_map(|item| match &item.value {
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    if data.len() > EVENT_DATA_MAX_COUNT {
        return Err(SyscallError::invalid_argument(format!(
            "event data count must be at most {EVENT_DATA_MAX_COUNT}, got {}",
            data.len()
        )));
    }

    Ok(ContractEvent {
        topic: topic.to_string(),
        tx_id: tx.tx_id().to_string(),
        contract_name: ctx.contract().name.clone(),
        contract_version: ctx.contract().version.clone(),
        data,
    })
}

// ---- guest memory ------------------------------------------------------------

fn guest_memory(caller: &mut Caller<'_, InstanceState>) -> Result<Memory, SyscallError> {
    caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
        .ok_or(SyscallError::MemoryNotExported)
}

/// Bounds-check a guest region, returning it as a byte range.
fn checked_range(ptr: i32, len: i32, memory_size: usize) -> Result<std::ops::Range<usize>, SyscallError> {
    let out_of_bounds = || SyscallError::MemoryOutOfBounds {
        offset: i64::from(ptr),
        len: i64::from(len),
        memory_size,
    };

    let start = usize::try_from(ptr).map_err(|_| out_of_bounds())?;
    let len = usize::try_from(len).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > memory_size {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}

fn read_request(
    caller: &mut Caller<'_, InstanceState>,
    header_ptr: i32,
    header_len: i32,
    body_ptr: i32,
    body_len: i32,
) -> Result<(Vec<u8>, Vec<u8>), SyscallError> {
    let memory = guest_memory(caller)?;
    let data = memory.data(&*caller);

    let header = checked_range(header_ptr, header_len, data.len())?;
    let body = checked_range(body_ptr, body_len, data.len())?;

    Ok((data[header].to_vec(), data[body].to_vec()))
}

fn write_guest(
    caller: &mut Caller<'_, InstanceState>,
    ptr: i32,
    bytes: &[u8],
) -> Result<(), SyscallError> {
    let memory = guest_memory(caller)?;
    let len = i32::try_from(bytes.len()).unwrap_or(i32::MAX);
    let range = checked_range(ptr, len, memory.data_size(&*caller))?;
    memory.data_mut(&mut *caller)[range].copy_from_slice(bytes);
    Ok(())
}

fn apply_reply(caller: &mut Caller<'_, InstanceState>, reply: Reply) -> Result<i32, SyscallError> {
    match reply {
        Reply::Done => Ok(SIGNAL_SUCCESS),
        Reply::Rejected => Ok(SIGNAL_FAIL),
        Reply::Write { ptr, bytes } => {
            write_guest(caller, ptr, &bytes)?;
            Ok(SIGNAL_SUCCESS)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::UnsupportedCrypto;
    use crate::ledger::{MemoryLedger, MemoryTxContext, ResultSet, StateIterator, VecResultSet};
    use chain_vm_common::{ContractId, LedgerError};

    fn dispatcher() -> SyscallDispatcher {
        SyscallDispatcher::new(Arc::new(ContextRegistry::new()), Arc::new(UnsupportedCrypto))
    }

    fn context(tx: Arc<dyn TxContext>) -> InvocationContext {
        InvocationContext::new(
            ContractId::new("counter", "1.0.0"),
            "increase",
            tx,
            0,
            BTreeMap::new(),
        )
    }

    fn memory_context() -> (Arc<MemoryTxContext>, InvocationContext) {
        let tx = MemoryLedger::new().begin("tx1");
        let ctx = context(tx.clone());
        (tx, ctx)
    }

    fn body(build: impl FnOnce(&mut KvCodec)) -> Vec<u8> {
        let mut codec = KvCodec::new();
        build(&mut codec);
        codec.encode()
    }

    fn written(reply: Reply) -> Vec<u8> {
        match reply {
            Reply::Write { bytes, .. } => bytes,
            other => panic!("expected a write, got {other:?}"),
        }
    }

    #[test]
    fn test_join_and_split_key() {
        assert_eq!(join_key("count", "test_key"), b"count#test_key");
        assert_eq!(join_key("count", ""), b"count");
        assert_eq!(split_key(b"count#test_key"), ("count".into(), "test_key".into()));
        assert_eq!(split_key(b"a#b#c"), ("a".into(), "b#c".into()));
        assert_eq!(split_key(b"plain"), ("plain".into(), String::new()));
    }

    #[test]
    fn test_checked_range() {
        assert_eq!(checked_range(0, 4, 8).unwrap(), 0..4);
        assert_eq!(checked_range(4, 4, 8).unwrap(), 4..8);
        assert!(checked_range(5, 4, 8).is_err());
        assert!(checked_range(-1, 4, 8).is_err());
        assert!(checked_range(0, -4, 8).is_err());
        assert!(checked_range(i32::MAX, i32::MAX, usize::MAX).is_ok());
    }

    #[test]
    fn test_put_then_len_and_fetch() {
        let dispatcher = dispatcher();
        let (tx, ctx) = memory_context();

        let put = body(|b| {
            b.push_string(KeyType::User, "key", "count")
                .push_string(KeyType::User, "field", "test_key")
                .push_bytes(KeyType::User, "value", vec![1, 0, 0, 0]);
        });
        assert_eq!(dispatcher.handle(&ctx, methods::PUT_STATE, &put).unwrap(), Reply::Done);
        assert_eq!(tx.get("counter", b"count#test_key").unwrap(), Some(vec![1, 0, 0, 0]));

        let get = body(|b| {
            b.push_string(KeyType::User, "key", "count")
                .push_string(KeyType::User, "field", "test_key")
                .push_int32(KeyType::User, "value_ptr", 64);
        });
        let len_reply = dispatcher.handle(&ctx, methods::GET_STATE_LEN, &get).unwrap();
        assert_eq!(len_reply, Reply::Write { ptr: 64, bytes: 4i32.to_le_bytes().to_vec() });

        let fetch = dispatcher.handle(&ctx, methods::GET_STATE, &get).unwrap();
        assert_eq!(fetch, Reply::Write { ptr: 64, bytes: vec![1, 0, 0, 0] });

        // The cache is one-shot; a second fetch copies nothing.
        let again = dispatcher.handle(&ctx, methods::GET_STATE, &get).unwrap();
        assert_eq!(again, Reply::Write { ptr: 64, bytes: Vec::new() });
    }

    #[test]
    fn test_fetch_with_empty_cache_copies_nothing() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let fetch = body(|b| {
            b.push_int32(KeyType::User, "value_ptr", 32);
        });
        for method in [methods::GET_STATE, methods::CALL_CONTRACT, methods::RS_NEXT] {
            assert_eq!(
                dispatcher.handle(&ctx, method, &fetch).unwrap(),
                Reply::Write { ptr: 32, bytes: Vec::new() }
            );
        }
        assert_eq!(ctx.take_result().code, 0);
    }

    #[test]
    fn test_missing_state_reads_as_empty() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let get = body(|b| {
            b.push_string(KeyType::User, "key", "nothing")
                .push_int32(KeyType::User, "value_ptr", 8);
        });
        let len_reply = dispatcher.handle(&ctx, methods::GET_STATE_LEN, &get).unwrap();
        assert_eq!(written(len_reply), 0i32.to_le_bytes());
        assert_eq!(written(dispatcher.handle(&ctx, methods::GET_STATE, &get).unwrap()), b"");
    }

    #[test]
    fn test_delete_state() {
        let dispatcher = dispatcher();
        let (tx, ctx) = memory_context();
        tx.put("counter", b"k", b"v").unwrap();

        let del = body(|b| {
            b.push_string(KeyType::User, "key", "k");
        });
        dispatcher.handle(&ctx, methods::DELETE_STATE, &del).unwrap();

        assert_eq!(tx.get("counter", b"k").unwrap(), None);
    }

    #[test]
    fn test_prefix_iterator_walk() {
        let dispatcher = dispatcher();
        let (tx, ctx) = memory_context();
        tx.put("counter", b"user#alice", b"1").unwrap();
        tx.put("counter", b"user#bob", b"2").unwrap();
        tx.put("counter", b"other", b"3").unwrap();

        let open = body(|b| {
            b.push_string(KeyType::User, "prefix", "user")
                .push_int32(KeyType::User, "value_ptr", 0);
        });
        let index = i32::from_le_bytes(
            written(dispatcher.handle(&ctx, methods::KV_PRE_ITERATOR, &open).unwrap())
                .try_into()
                .unwrap(),
        );

        let cursor = body(|b| {
            b.push_int32(KeyType::User, "rs_index", index)
                .push_int32(KeyType::User, "value_ptr", 0);
        });

        let mut seen = Vec::new();
        loop {
            let has_next = written(
                dispatcher
                    .handle(&ctx, methods::KV_ITERATOR_HAS_NEXT, &cursor)
                    .unwrap(),
            );
            if has_next == 0i32.to_le_bytes() {
                break;
            }
            dispatcher
                .handle(&ctx, methods::KV_ITERATOR_NEXT_LEN, &cursor)
                .unwrap();
            let pair = written(dispatcher.handle(&ctx, methods::KV_ITERATOR_NEXT, &cursor).unwrap());
            let pair = KvCodec::decode(&pair).unwrap();
            seen.push((
                pair.get_string("field").unwrap().to_string(),
                pair.get_bytes("value").unwrap(),
            ));
        }
        assert_eq!(
            seen,
            vec![("alice".to_string(), b"1".to_vec()), ("bob".to_string(), b"2".to_vec())]
        );

        let err = dispatcher
            .handle(&ctx, methods::KV_ITERATOR_NEXT_LEN, &cursor)
            .unwrap_err();
        assert!(err.to_string().contains("no next element"));

        dispatcher.handle(&ctx, methods::KV_ITERATOR_CLOSE, &cursor).unwrap();
        assert!(dispatcher.handle(&ctx, methods::KV_ITERATOR_HAS_NEXT, &cursor).is_err());
    }

    #[test]
    fn test_range_iterator() {
        let dispatcher = dispatcher();
        let (tx, ctx) = memory_context();
        for key in ["a", "b", "c"] {
            tx.put("counter", key.as_bytes(), b"x").unwrap();
        }

        let open = body(|b| {
            b.push_string(KeyType::User, "start_key", "a")
                .push_string(KeyType::User, "limit_key", "c")
                .push_int32(KeyType::User, "value_ptr", 0);
        });
        let reply = dispatcher.handle(&ctx, methods::KV_ITERATOR, &open).unwrap();
        let index = i32::from_le_bytes(written(reply).try_into().unwrap());

        let mut count = 0;
        while ctx.with_iterator(index, |it| it.has_next()).unwrap() {
            ctx.with_iterator(index, |it| it.next_pair()).unwrap();
            count += 1;
        }
        assert_eq!(count, 2);
        assert_eq!(ctx.tx_type(), ExecOrderTxType::Iterator);
    }

    #[test]
    fn test_point_access_keeps_tx_normal() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let put = body(|b| {
            b.push_string(KeyType::User, "key", "k")
                .push_bytes(KeyType::User, "value", b"v".to_vec());
        });
        dispatcher.handle(&ctx, methods::PUT_STATE, &put).unwrap();
        assert_eq!(ctx.tx_type(), ExecOrderTxType::Normal);

        let open = body(|b| {
            b.push_string(KeyType::User, "prefix", "k")
                .push_int32(KeyType::User, "value_ptr", 0);
        });
        dispatcher.handle(&ctx, methods::KV_PRE_ITERATOR, &open).unwrap();
        assert_eq!(ctx.tx_type(), ExecOrderTxType::Iterator);
    }

    #[test]
    fn test_results_and_logs() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        dispatcher.handle(&ctx, methods::LOG_MESSAGE, b"hello").unwrap();
        assert_eq!(ctx.logs(), vec!["hello".to_string()]);

        assert_eq!(
            dispatcher.handle(&ctx, methods::SUCCESS_RESULT, b"42").unwrap(),
            Reply::Done
        );
        dispatcher.handle(&ctx, methods::ERROR_RESULT, b"bad input").unwrap();
        assert_eq!(
            dispatcher.handle(&ctx, methods::SUCCESS_RESULT, b"43").unwrap(),
            Reply::Rejected
        );

        let result = ctx.take_result();
        assert_eq!(result.code, 1);
        assert_eq!(result.result, b"42");
        assert_eq!(result.message, "contract message: bad input");
    }

    #[test]
    fn test_emit_event() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let event = body(|b| {
            b.push_string(KeyType::User, "topic", "transfer")
                .push_string(KeyType::User, "from", "alice")
                .push_string(KeyType::User, "to", "bob");
        });
        dispatcher.handle(&ctx, methods::EMIT_EVENT, &event).unwrap();

        let empty_topic = body(|b| {
            b.push_string(KeyType::User, "topic", "");
        });
        assert!(dispatcher.handle(&ctx, methods::EMIT_EVENT, &empty_topic).is_err());

        let result = ctx.take_result();
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].topic, "transfer");
        assert_eq!(result.events[0].tx_id, "tx1");
        assert_eq!(result.events[0].data, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_unknown_method_and_bad_body() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let err = dispatcher.handle(&ctx, "self_destruct", b"").unwrap_err();
        assert!(matches!(err, SyscallError::UnknownMethod { .. }));

        // The method is checked before the body is decoded.
        let err = dispatcher
            .handle(&ctx, "self_destruct", &[1, 0, 0])
            .unwrap_err();
        assert!(matches!(err, SyscallError::UnknownMethod { .. }));

        let err = dispatcher
            .handle(&ctx, methods::PUT_STATE, &[1, 0, 0])
            .unwrap_err();
        assert!(matches!(err, SyscallError::Codec(_)));
    }

    #[test]
    fn test_crypto_unsupported_by_default() {
        let dispatcher = dispatcher();
        let (_tx, ctx) = memory_context();

        let req = body(|b| {
            b.push_string(KeyType::User, "op", "AddCiphertext")
                .push_int32(KeyType::User, "value_ptr", 0);
        });
        let err = dispatcher
            .handle(&ctx, methods::GET_PAILLIER_RESULT_LEN, &req)
            .unwrap_err();
        assert!(matches!(err, SyscallError::Crypto { .. }));
        assert!(!ctx.has_cached());
    }

    /// Ledger double answering SQL with canned rows.
    struct SqlTx {
        inner: Arc<MemoryTxContext>,
    }

    impl TxContext for SqlTx {
        fn tx_id(&self) -> &str {
            self.inner.tx_id()
        }
        fn get(&self, c: &str, k: &[u8]) -> Result<Option<Vec<u8>>, LedgerError> {
            self.inner.get(c, k)
        }
        fn put(&self, c: &str, k: &[u8], v: &[u8]) -> Result<(), LedgerError> {
            self.inner.put(c, k, v)
        }
        fn delete(&self, c: &str, k: &[u8]) -> Result<(), LedgerError> {
            self.inner.delete(c, k)
        }
        fn select(&self, c: &str, s: &[u8], l: &[u8]) -> Result<Box<dyn StateIterator>, LedgerError> {
            self.inner.select(c, s, l)
        }
        fn select_prefix(&self, c: &str, p: &[u8]) -> Result<Box<dyn StateIterator>, LedgerError> {
            self.inner.select_prefix(c, p)
        }
        fn execute_update(&self, _c: &str, _sql: &str) -> Result<i32, LedgerError> {
            Ok(3)
        }
        fn query(&self, _c: &str, _sql: &str) -> Result<Box<dyn ResultSet>, LedgerError> {
            Ok(Box::new(VecResultSet::new(vec![row("1"), row("2")])))
        }
        fn query_one(&self, _c: &str, _sql: &str) -> Result<Option<Row>, LedgerError> {
            Ok(Some(row("1")))
        }
        fn get_contract(&self, name: &str) -> Result<(ContractId, Arc<[u8]>), LedgerError> {
            self.inner.get_contract(name)
        }
        fn write_set(&self) -> Vec<crate::ledger::WriteEntry> {
            self.inner.write_set()
        }
    }

    fn row(id: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), id.as_bytes().to_vec());
        row
    }

    #[test]
    fn test_sql_routes() {
        let dispatcher = dispatcher();
        let tx = Arc::new(SqlTx {
            inner: MemoryLedger::new().begin("tx1"),
        });
        let ctx = context(tx);

        let sql = body(|b| {
            b.push_string(KeyType::User, "sql", "select * from t")
                .push_int32(KeyType::User, "value_ptr", 16);
        });

        let affected = written(dispatcher.handle(&ctx, methods::EXECUTE_UPDATE, &sql).unwrap());
        assert_eq!(affected, 3i32.to_le_bytes());

        // DDL is unsupported by the double's defaults.
        assert!(dispatcher.handle(&ctx, methods::EXECUTE_DDL, &sql).is_err());

        dispatcher
            .handle(&ctx, methods::EXECUTE_QUERY_ONE_LEN, &sql)
            .unwrap();
        let one = written(dispatcher.handle(&ctx, methods::EXECUTE_QUERY_ONE, &sql).unwrap());
        assert_eq!(KvCodec::decode(&one).unwrap().get_bytes("id").unwrap(), b"1");

        let index = i32::from_le_bytes(
            written(dispatcher.handle(&ctx, methods::EXECUTE_QUERY, &sql).unwrap())
                .try_into()
                .unwrap(),
        );
        let cursor = body(|b| {
            b.push_int32(KeyType::User, "rs_index", index)
                .push_int32(KeyType::User, "value_ptr", 16);
        });
        let mut ids = Vec::new();
        while written(dispatcher.handle(&ctx, methods::RS_HAS_NEXT, &cursor).unwrap())
            == 1i32.to_le_bytes()
        {
            dispatcher.handle(&ctx, methods::RS_NEXT_LEN, &cursor).unwrap();
            let row = written(dispatcher.handle(&ctx, methods::RS_NEXT, &cursor).unwrap());
            ids.push(KvCodec::decode(&row).unwrap().get_bytes("id").unwrap());
        }
        assert_eq!(ids, vec![b"1".to_vec(), b"2".to_vec()]);
        dispatcher.handle(&ctx, methods::RS_CLOSE, &cursor).unwrap();
    }
}
