//! Error types for chain-vm.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`RuntimeError`]: Setup and invocation errors surfaced to the node
//! - [`SyscallError`]: Failures of host operations requested by guest code
//! - [`LedgerError`]: Failures reported by the external state store
//! - [`CodecError`]: Malformed key-value blobs crossing the guest boundary

use thiserror::Error;

/// Top-level runtime errors.
///
/// These errors represent failures that can occur during the lifecycle of
/// a contract invocation, from bytecode validation to reconciliation.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The contract descriptor or its bytecode is unusable.
    #[error("Invalid contract: {reason}")]
    InvalidContract {
        /// Description of what is wrong with the contract.
        reason: String,
    },

    /// WebAssembly validation or compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// A compiled module could not be instantiated.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The instance pool for a contract has been shut down.
    #[error("Instance pool closed: {contract}")]
    PoolClosed {
        /// Key of the contract whose pool is closed.
        contract: String,
    },

    /// A required export is missing from the guest module.
    #[error("method [{name}] not export")]
    ExportNotFound {
        /// Name of the missing export.
        name: String,
    },

    /// The guest reported a runtime type this engine does not serve.
    #[error("runtime type error, expect rust:[{expected}], but got {actual}")]
    RuntimeTypeMismatch {
        /// Runtime type identifier of this engine.
        expected: i32,
        /// Runtime type reported by the guest.
        actual: i32,
    },

    /// The invocation consumed all of its gas.
    #[error("out of gas {used}/{limit}")]
    OutOfGas {
        /// Gas consumed, including the caller chain.
        used: u64,
        /// Global gas limit.
        limit: u64,
    },

    /// A cross-contract call nested deeper than allowed.
    #[error("call depth {depth} exceeds maximum {max}")]
    CallDepthExceeded {
        /// Requested call depth.
        depth: u32,
        /// Maximum allowed depth.
        max: u32,
    },

    /// A WebAssembly trap or guest abort occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// A host operation failed.
    #[error("Syscall error: {0}")]
    Syscall(#[from] SyscallError),

    /// The ledger interface failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host operations dispatched through `sys_call`.
///
/// None of these abort the guest: the dispatcher records the message on the
/// invocation result and returns the failure signal.
#[derive(Error, Debug)]
pub enum SyscallError {
    /// Invalid argument was passed by the guest.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// A guest pointer/length pair falls outside linear memory.
    #[error("memory access out of bounds: offset {offset}, len {len}, memory size {memory_size}")]
    MemoryOutOfBounds {
        /// Start offset requested by the guest.
        offset: i64,
        /// Length requested by the guest.
        len: i64,
        /// Current linear memory size in bytes.
        memory_size: usize,
    },

    /// The guest module exports no linear memory.
    #[error("memory export not found")]
    MemoryNotExported,

    /// The request header carried no usable context handle.
    #[error("invocation context not found for handle {handle}")]
    ContextNotFound {
        /// Handle carried in the request header.
        handle: i32,
    },

    /// The request header named no known host operation.
    #[error("unknown syscall method: {method}")]
    UnknownMethod {
        /// Method name carried in the request header.
        method: String,
    },

    /// The guest referenced an iterator or result set that is not open.
    #[error("no open iterator or result set with index {index}")]
    UnknownIterator {
        /// Index supplied by the guest.
        index: i32,
    },

    /// A nested contract call failed.
    #[error("call contract failed: {reason}")]
    CallContract {
        /// Description of the failure.
        reason: String,
    },

    /// A cryptographic operation failed.
    #[error("crypto operation failed: {reason}")]
    Crypto {
        /// Description of the failure.
        reason: String,
    },

    /// The request body could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The ledger interface failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Errors reported by the external ledger interface.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// The requested contract is not deployed.
    #[error("contract not found: {name}")]
    ContractNotFound {
        /// Name of the contract.
        name: String,
    },

    /// The ledger does not support the requested operation.
    #[error("unsupported ledger operation: {operation}")]
    Unsupported {
        /// Name of the operation.
        operation: String,
    },
}

/// Errors decoding or encoding key-value blobs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended in the middle of an item.
    #[error("truncated input at offset {offset}")]
    Truncated {
        /// Byte offset where more data was expected.
        offset: usize,
    },

    /// A length field is negative or above the codec limit.
    #[error("invalid length {len} at offset {offset}")]
    InvalidLength {
        /// The offending length.
        len: i64,
        /// Byte offset of the length field.
        offset: usize,
    },

    /// A key or string value is not valid UTF-8.
    #[error("invalid utf-8 at offset {offset}")]
    InvalidUtf8 {
        /// Byte offset of the field.
        offset: usize,
    },

    /// Unknown key type tag.
    #[error("unknown key type {0}")]
    UnknownKeyType(i32),

    /// Unknown value type tag.
    #[error("unknown value type {0}")]
    UnknownValueType(i32),

    /// Too many items in one blob.
    #[error("too many items: {count}")]
    TooManyItems {
        /// Number of items seen.
        count: usize,
    },

    /// A required key is absent.
    #[error("missing key: {key}")]
    MissingKey {
        /// The key that was looked up.
        key: String,
    },

    /// A key exists with a different value type.
    #[error("key {key} is not of type {expected}")]
    TypeMismatch {
        /// The key that was looked up.
        key: String,
        /// The expected value type.
        expected: &'static str,
    },
}

impl RuntimeError {
    /// Create a new `InvalidContract` error.
    pub fn invalid_contract(reason: impl Into<String>) -> Self {
        Self::InvalidContract {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` for errors raised before any instance ran.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidContract { .. }
                | Self::CompilationFailed { .. }
                | Self::InstantiationFailed { .. }
        )
    }

    /// Returns `true` if the invocation ran out of gas.
    pub fn is_out_of_gas(&self) -> bool {
        matches!(self, Self::OutOfGas { .. })
    }
}

impl SyscallError {
    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Create a new `CallContract` error.
    pub fn call_contract(reason: impl Into<String>) -> Self {
        Self::CallContract {
            reason: reason.into(),
        }
    }
}
