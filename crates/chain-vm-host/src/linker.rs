//! Host function registration for Wasmtime linkers.
//!
//! Contracts import:
//! - `env.sys_call(header_ptr, header_len, body_ptr, body_len) -> i32`, the
//!   single entry point for every host operation
//! - `env.log_message(ptr, len)`, plain text logging outside the syscall
//!   protocol
//! - `wasi_unstable.fd_read|fd_write|fd_close|fd_seek(i32, i32, i32, i32) -> i32`,
//!   accepted and ignored
//! - `wasi_snapshot_preview1.proc_exit(i32)`, which aborts the call

use std::sync::Arc;

use tracing::warn;
use wasmtime::{Caller, Extern, Linker};

use crate::logging::LoggingHost;
use crate::registry::ContextRegistry;
use crate::syscall::SyscallDispatcher;
use chain_vm_common::RuntimeError;
use chain_vm_common::abi::MEMORY_EXPORT;
use chain_vm_core::InstanceState;

const WASI_UNSTABLE: &str = "wasi_unstable";
const WASI_PREVIEW1: &str = "wasi_snapshot_preview1";
const WASI_FD_STUBS: [&str; 4] = ["fd_read", "fd_write", "fd_close", "fd_seek"];

/// Register all host functions on a linker.
///
/// # Errors
///
/// Returns an error if function registration fails.
pub fn register_all(
    linker: &mut Linker<InstanceState>,
    dispatcher: Arc<SyscallDispatcher>,
) -> Result<(), RuntimeError> {
    register_logging(linker, Arc::clone(dispatcher.registry()))?;
    register_sys_call(linker, dispatcher)?;
    register_wasi_stubs(linker)?;
    Ok(())
}

/// Register `env.sys_call`.
pub fn register_sys_call(
    linker: &mut Linker<InstanceState>,
    dispatcher: Arc<SyscallDispatcher>,
) -> Result<(), RuntimeError> {
    linker
        .func_wrap_async(
            "env",
            "sys_call",
            move |mut caller: Caller<'_, InstanceState>,
                  (header_ptr, header_len, body_ptr, body_len): (i32, i32, i32, i32)| {
                let dispatcher = Arc::clone(&dispatcher);
                Box::new(async move {
                    dispatcher
                        .sys_call(&mut caller, header_ptr, header_len, body_ptr, body_len)
                        .await
                })
            },
        )
        .map_err(|e| RuntimeError::invalid_config(format!("Failed to register sys_call: {e}")))?;

    Ok(())
}

/// Register `env.log_message(ptr: i32, len: i32)`.
///
/// The line goes to the invocation bound to the calling instance, or to the
/// instance's own trace output when none is bound.
pub fn register_logging(
    linker: &mut Linker<InstanceState>,
    registry: Arc<ContextRegistry>,
) -> Result<(), RuntimeError> {
    linker
        .func_wrap(
            "env",
            "log_message",
            move |mut caller: Caller<'_, InstanceState>, ptr: i32, len: i32| {
                let Some(message) = read_text(&mut caller, ptr, len) else {
                    return;
                };
                let state = caller.data();
                match state.bound_handle().and_then(|h| registry.get(h)) {
                    Some(ctx) => LoggingHost::log(&ctx, &message),
                    None => LoggingHost::log_unbound(state.instance_id(), &message),
                }
            },
        )
        .map_err(|e| {
            RuntimeError::invalid_config(format!("Failed to register log function: {e}"))
        })?;

    Ok(())
}

/// Register the WASI imports contract toolchains pull in.
///
/// `wasi_unstable.fd_read`, `fd_write`, `fd_close` and `fd_seek` all take
/// four `i32`s and return `0`, the shape deployed contracts import them
/// with. `wasi_snapshot_preview1.proc_exit` aborts the call.
pub fn register_wasi_stubs(linker: &mut Linker<InstanceState>) -> Result<(), RuntimeError> {
    let fail = |e: wasmtime::Error| {
        RuntimeError::invalid_config(format!("Failed to register WASI stub: {e}"))
    };

    for name in WASI_FD_STUBS {
        linker
            .func_wrap(WASI_UNSTABLE, name, |_: i32, _: i32, _: i32, _: i32| -> i32 { 0 })
            .map_err(fail)?;
    }

    linker
        .func_wrap(WASI_PREVIEW1, "proc_exit", |code: i32| -> wasmtime::Result<()> {
            Err(wasmtime::Error::msg(format!(
                "guest aborted with exit code {code}"
            )))
        })
        .map_err(fail)?;

    Ok(())
}

/// Read a UTF-8 string out of guest memory, logging why if it cannot.
fn read_text(caller: &mut Caller<'_, InstanceState>, ptr: i32, len: i32) -> Option<String> {
    if ptr < 0 || len < 0 {
        warn!(ptr, len, "Invalid pointer or length (negative value)");
        return None;
    }

    let Some(memory) = caller
        .get_export(MEMORY_EXPORT)
        .and_then(Extern::into_memory)
    else {
        warn!("Memory export not found in guest module");
        return None;
    };

    let data = memory.data(&*caller);
    #[allow(clippy::cast_sign_loss)]
    let start = ptr as usize;
    #[allow(clippy::cast_sign_loss)]
    let Some(end) = start.checked_add(len as usize) else {
        warn!(ptr, len, "Pointer + length overflow");
        return None;
    };

    if end > data.len() {
        warn!(
            start,
            end,
            memory_size = data.len(),
            "Memory access out of bounds"
        );
        return None;
    }

    Some(String::from_utf8_lossy(&data[start..end]).into_owned())
}
