//! Names and constants of the contract ABI.
//!
//! These values are shared with deployed contracts and their SDKs.

/// Runtime type identifier a guest must report from [`RUNTIME_TYPE_METHOD`].
pub const RUNTIME_TYPE_ID: i32 = 2;

/// Export probing the guest's runtime type.
pub const RUNTIME_TYPE_METHOD: &str = "runtime_type";

/// Export allocating guest memory: `allocate(len: i32) -> i32`.
pub const ALLOCATE_METHOD: &str = "allocate";

/// Export releasing guest memory before teardown: `deallocate(ptr: i32)`.
pub const DEALLOCATE_METHOD: &str = "deallocate";

/// Exported linear memory.
pub const MEMORY_EXPORT: &str = "memory";

/// Contract initialization method. Failures here close the contract's pool.
pub const INIT_METHOD: &str = "init_contract";

/// Parameter key carrying the invocation handle.
pub const CONTEXT_PTR_PARAM: &str = "__context_ptr__";

/// Header key carrying the invocation handle.
pub const HEADER_CTX_PTR: &str = "ctx_ptr";

/// Header key carrying the syscall method name.
pub const HEADER_METHOD: &str = "method";

/// Signal returned to the guest when a syscall succeeds.
pub const SIGNAL_SUCCESS: i32 = 0;

/// Signal returned to the guest when a syscall fails.
pub const SIGNAL_FAIL: i32 = 1;

/// Syscall method names carried in the request header.
pub mod methods {
    pub const LOG_MESSAGE: &str = "log_message";
    pub const SUCCESS_RESULT: &str = "success_result";
    pub const ERROR_RESULT: &str = "error_result";

    pub const GET_STATE_LEN: &str = "get_state_len";
    pub const GET_STATE: &str = "get_state";
    pub const PUT_STATE: &str = "put_state";
    pub const DELETE_STATE: &str = "delete_state";
    pub const KV_ITERATOR: &str = "kv_iterator";
    pub const KV_PRE_ITERATOR: &str = "kv_pre_iterator";
    pub const KV_ITERATOR_HAS_NEXT: &str = "kv_iterator_has_next";
    pub const KV_ITERATOR_NEXT_LEN: &str = "kv_iterator_next_len";
    pub const KV_ITERATOR_NEXT: &str = "kv_iterator_next";
    pub const KV_ITERATOR_CLOSE: &str = "kv_iterator_close";

    pub const EXECUTE_UPDATE: &str = "execute_update";
    pub const EXECUTE_DDL: &str = "execute_ddl";
    pub const EXECUTE_QUERY: &str = "execute_query";
    pub const EXECUTE_QUERY_ONE_LEN: &str = "execute_query_one_len";
    pub const EXECUTE_QUERY_ONE: &str = "execute_query_one";
    pub const RS_HAS_NEXT: &str = "rs_has_next";
    pub const RS_NEXT_LEN: &str = "rs_next_len";
    pub const RS_NEXT: &str = "rs_next";
    pub const RS_CLOSE: &str = "rs_close";

    pub const CALL_CONTRACT_LEN: &str = "call_contract_len";
    pub const CALL_CONTRACT: &str = "call_contract";

    pub const EMIT_EVENT: &str = "emit_event";

    pub const GET_PAILLIER_RESULT_LEN: &str = "get_paillier_result_len";
    pub const GET_PAILLIER_RESULT: &str = "get_paillier_result";
    pub const GET_BULLETPROOFS_RESULT_LEN: &str = "get_bulletproofs_result_len";
    pub const GET_BULLETPROOFS_RESULT: &str = "get_bulletproofs_result";

    /// Every method the host serves.
    pub const ALL: [&str; 29] = [
        LOG_MESSAGE,
        SUCCESS_RESULT,
        ERROR_RESULT,
        GET_STATE_LEN,
        GET_STATE,
        PUT_STATE,
        DELETE_STATE,
        KV_ITERATOR,
        KV_PRE_ITERATOR,
        KV_ITERATOR_HAS_NEXT,
        KV_ITERATOR_NEXT_LEN,
        KV_ITERATOR_NEXT,
        KV_ITERATOR_CLOSE,
        EXECUTE_UPDATE,
        EXECUTE_DDL,
        EXECUTE_QUERY,
        EXECUTE_QUERY_ONE_LEN,
        EXECUTE_QUERY_ONE,
        RS_HAS_NEXT,
        RS_NEXT_LEN,
        RS_NEXT,
        RS_CLOSE,
        CALL_CONTRACT_LEN,
        CALL_CONTRACT,
        EMIT_EVENT,
        GET_PAILLIER_RESULT_LEN,
        GET_PAILLIER_RESULT,
        GET_BULLETPROOFS_RESULT_LEN,
        GET_BULLETPROOFS_RESULT,
    ];
}
