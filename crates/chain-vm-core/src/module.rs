//! Contract bytecode, compiled once per contract version.
//!
//! A contract is a core WebAssembly module. Besides one function export per
//! callable method it has to provide the calling convention the runtime
//! relies on:
//!
//! | Export | Type | Used for |
//! |--------|------|----------|
//! | `memory` | memory | parameter blobs and syscall buffers |
//! | `runtime_type` | `() -> i32` | checked before every call |
//! | `allocate` | `(i32) -> i32` | space for the parameter blob |
//! | `deallocate` | `(i32) -> ()` | optional, called on teardown |
//!
//! Missing calling-convention exports are not a compile error: the call
//! that needs one fails instead. [`CompiledModule::missing_exports`] reports
//! them up front.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, Module, ValType};

use chain_vm_common::RuntimeError;
use chain_vm_common::abi::{ALLOCATE_METHOD, DEALLOCATE_METHOD, MEMORY_EXPORT, RUNTIME_TYPE_METHOD};

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// A compiled contract version, shared by every instance in its pool.
///
/// Cheap to clone.
#[derive(Clone)]
pub struct CompiledModule {
    inner: Module,
    code_hash: String,
    compiled_at: Instant,
}

impl CompiledModule {
    /// Validate and compile contract bytecode.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the bytes are not a
    /// WebAssembly binary or fail validation or compilation.
    #[instrument(skip(engine, bytecode), fields(bytecode_len = bytecode.len()))]
    pub fn from_bytes(engine: &Engine, bytecode: &[u8]) -> Result<Self, RuntimeError> {
        let start = Instant::now();

        check_magic(bytecode)?;

        Module::validate(engine, bytecode).map_err(|e| {
            RuntimeError::compilation_failed(format!("byte code validation failed: {e}"))
        })?;
        let inner = Module::new(engine, bytecode).map_err(|e| {
            RuntimeError::compilation_failed(format!("byte code compile failed: {e}"))
        })?;

        let module = Self {
            inner,
            code_hash: code_hash(bytecode),
            compiled_at: Instant::now(),
        };

        info!(
            code_hash = %module.code_hash,
            methods = module.methods().len(),
            duration_ms = start.elapsed().as_millis(),
            "Contract compiled"
        );

        Ok(module)
    }

    /// Compile a contract written in WebAssembly text.
    ///
    /// # Errors
    ///
    /// Returns [`RuntimeError::CompilationFailed`] if the text does not
    /// parse or compile.
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, RuntimeError> {
        let inner = Module::new(engine, wat).map_err(|e| {
            RuntimeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        Ok(Self {
            inner,
            code_hash: code_hash(wat.as_bytes()),
            compiled_at: Instant::now(),
        })
    }

    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// Hash of the bytecode, for logs.
    pub fn code_hash(&self) -> &str {
        &self.code_hash
    }

    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Returns `true` if the module exports a function with this name.
    pub fn exports_function(&self, name: &str) -> bool {
        self.inner
            .get_export(name)
            .is_some_and(|ty| ty.func().is_some())
    }

    /// Callable contract methods: every function export that is not part
    /// of the calling convention, sorted by name.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self
            .inner
            .exports()
            .filter(|export| export.ty().func().is_some())
            .map(|export| export.name())
            .filter(|name| {
                ![RUNTIME_TYPE_METHOD, ALLOCATE_METHOD, DEALLOCATE_METHOD].contains(name)
            })
            .map(str::to_string)
            .collect();
        methods.sort();
        methods
    }

    /// Calling-convention exports that are absent or have the wrong type.
    pub fn missing_exports(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();

        if !matches!(self.inner.get_export(MEMORY_EXPORT), Some(ExternType::Memory(_))) {
            missing.push(MEMORY_EXPORT);
        }
        if !self.func_matches(RUNTIME_TYPE_METHOD, &[], &[ValType::I32]) {
            missing.push(RUNTIME_TYPE_METHOD);
        }
        if !self.func_matches(ALLOCATE_METHOD, &[ValType::I32], &[ValType::I32]) {
            missing.push(ALLOCATE_METHOD);
        }

        missing
    }

    fn func_matches(&self, name: &str, params: &[ValType], results: &[ValType]) -> bool {
        let Some(ExternType::Func(ty)) = self.inner.get_export(name) else {
            return false;
        };
        same_types(ty.params(), params) && same_types(ty.results(), results)
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("code_hash", &self.code_hash)
            .finish_non_exhaustive()
    }
}

fn same_types(actual: impl ExactSizeIterator<Item = ValType>, expected: &[ValType]) -> bool {
    actual.len() == expected.len()
        && actual
            .zip(expected)
            .all(|(a, e)| ValType::eq(&a, e))
}

fn check_magic(bytecode: &[u8]) -> Result<(), RuntimeError> {
    if bytecode.len() < 8 {
        return Err(RuntimeError::compilation_failed(
            "contract bytecode too short for a wasm header",
        ));
    }
    if &bytecode[0..4] != WASM_MAGIC {
        return Err(RuntimeError::compilation_failed(
            "contract bytecode is not wasm: bad magic number",
        ));
    }
    Ok(())
}

fn code_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WasmEngine;
    use chain_vm_common::EngineConfig;

    const EMPTY_MODULE: &[u8] = &[0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    const CONTRACT: &str = r#"
        (module
            (memory (export "memory") 1)
            (func (export "runtime_type") (result i32) (i32.const 2))
            (func (export "allocate") (param i32) (result i32) (i32.const 1024))
            (func (export "deallocate") (param i32))
            (func (export "increase"))
            (func (export "init_contract"))
        )
    "#;

    fn engine() -> WasmEngine {
        WasmEngine::new(&EngineConfig {
            pooling_allocator: false,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_magic_checked_before_compiling() {
        tokio_test::assert_ok!(check_magic(EMPTY_MODULE));
        tokio_test::assert_err!(check_magic(&[0x00, 0x61]));
        tokio_test::assert_err!(check_magic(&[0, 0, 0, 0, 1, 0, 0, 0]));
    }

    #[test]
    fn test_code_hash_follows_bytes() {
        assert_eq!(code_hash(b"counter"), code_hash(b"counter"));
        assert_ne!(code_hash(b"counter"), code_hash(b"relay"));
        assert_eq!(code_hash(b"counter").len(), 16);
    }

    #[test]
    fn test_contract_methods_exclude_calling_convention() {
        let engine = engine();
        let module = CompiledModule::from_wat(engine.inner(), CONTRACT).unwrap();

        assert_eq!(module.methods(), vec!["increase", "init_contract"]);
        assert!(module.missing_exports().is_empty());
        assert!(module.exports_function("increase"));
        assert!(!module.exports_function("memory"));
    }

    #[test]
    fn test_empty_module_misses_everything() {
        let engine = engine();
        let module = CompiledModule::from_bytes(engine.inner(), EMPTY_MODULE).unwrap();

        assert!(module.methods().is_empty());
        assert_eq!(
            module.missing_exports(),
            vec![MEMORY_EXPORT, RUNTIME_TYPE_METHOD, ALLOCATE_METHOD]
        );
    }

    #[test]
    fn test_wrong_allocate_signature_reported() {
        let engine = engine();
        let module = CompiledModule::from_wat(
            engine.inner(),
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "runtime_type") (result i32) (i32.const 2))
                (func (export "allocate") (param i64) (result i32) (i32.const 0)))
            "#,
        )
        .unwrap();

        assert_eq!(module.missing_exports(), vec![ALLOCATE_METHOD]);
    }

    #[test]
    fn test_invalid_body_fails_validation() {
        let engine = engine();
        let mut bytes = EMPTY_MODULE.to_vec();
        bytes.extend_from_slice(&[0xff, 0xff, 0xff]);

        let err = CompiledModule::from_bytes(engine.inner(), &bytes).unwrap_err();
        assert!(matches!(err, RuntimeError::CompilationFailed { .. }));
    }
}
