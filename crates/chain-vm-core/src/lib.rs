//! Core Wasmtime runtime for chain-vm.
//!
//! This crate provides contract execution capabilities below the syscall
//! layer:
//! - [`WasmEngine`]: Configured Wasmtime engine with fuel metering
//! - [`CompiledModule`]: Compiled contract module wrapper
//! - [`VmInstance`]: A reusable instance and its store
//! - [`InstancePool`]: Adaptive pool of instances for one contract version
//! - [`InstanceManager`]: Pools of every contract version on a chain
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   InstanceManager                       │
//! │  (One per chain, pools keyed by name_version)           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    InstancePool                         │
//! │  (One per contract version)                             │
//! │  - Ready queue                                          │
//! │  - Control task: grow, shrink, discard, reset           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          VmInstance = Store<InstanceState> + Instance   │
//! │  (Reused across invocations)                            │
//! │  - Fuel as gas                                          │
//! │  - Linear memory                                        │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod engine;
pub mod instance;
pub mod manager;
pub mod module;
pub mod pool;
pub mod store;

pub use engine::WasmEngine;
pub use instance::VmInstance;
pub use manager::InstanceManager;
pub use module::CompiledModule;
pub use pool::{InstanceFactory, InstancePool};
pub use store::InstanceState;
