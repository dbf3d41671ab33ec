//! Host side of chain-vm.
//!
//! This crate connects running contract instances to the node:
//!
//! - [`runtime`]: the invoker, entry point for contract calls
//! - [`registry`]: handle-keyed lookup of in-flight invocations
//! - [`context`]: per-invocation result, cache and cursors
//! - [`syscall`]: routing of `env.sys_call` requests to host operations
//! - [`ledger`]: the transaction interface contracts read and write through
//! - [`crypto`]: pluggable Paillier and bulletproofs operations
//! - [`linker`]: registration of every host import
//! - [`logging`]: guest log capture
//!
//! # Isolation
//!
//! Guests never see host memory. Every request is copied out of guest
//! memory with bounds checks, and every syscall must carry the handle of the
//! invocation bound to the calling instance.

pub mod context;
pub mod crypto;
pub mod ledger;
pub mod linker;
pub mod logging;
pub mod registry;
pub mod runtime;
pub mod syscall;

pub use context::InvocationContext;
pub use crypto::{CryptoProvider, UnsupportedCrypto};
pub use ledger::{MemoryLedger, MemoryTxContext, ResultSet, Row, StateIterator, TxContext, WriteEntry};
pub use logging::LoggingHost;
pub use registry::ContextRegistry;
pub use runtime::{InvokeRequest, Runtime};
pub use syscall::SyscallDispatcher;
