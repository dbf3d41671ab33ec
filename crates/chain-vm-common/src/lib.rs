//! Common types, errors, and utilities for chain-vm.
//!
//! This crate provides shared functionality used across the chain-vm workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine, execution and pool settings
//! - The key-value codec and ABI constants shared with contracts
//! - Contract descriptors and invocation results

pub mod abi;
pub mod codec;
pub mod config;
pub mod config_file;
pub mod error;
pub mod types;

pub use codec::{KeyType, KvCodec, Value};
pub use config::{EngineConfig, ExecutionConfig, PoolConfig, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ContractEntry};
pub use error::{CodecError, LedgerError, RuntimeError, SyscallError};
pub use types::{ContractEvent, ContractId, ContractResult, ExecOrderTxType};
