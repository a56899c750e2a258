//! WASM engine configuration.
//!
//! One engine compiles the base form once; every session created from it
//! instantiates the same compiled code into its own store.

use wasmtime::{Config, Engine, Module};

use crate::{HostConfig, RuntimeError};

/// Create an engine with the feature toggles of `config`.
pub fn build(config: &HostConfig) -> Result<Engine, RuntimeError> {
    let mut wasm = Config::new();
    wasm.wasm_simd(config.enable_simd)
        .wasm_reference_types(config.enable_reference_types)
        .wasm_bulk_memory(config.enable_bulk_memory)
        .max_wasm_stack(config.stack_size);

    Engine::new(&wasm).map_err(|e| RuntimeError::CompilationError(format!("engine: {:#}", e)))
}

/// Compile the base form (binary or text).
pub fn compile_base(engine: &Engine, bytes: &[u8]) -> Result<Module, RuntimeError> {
    let module = Module::new(engine, bytes)
        .map_err(|e| RuntimeError::CompilationError(format!("{:#}", e)))?;
    log::debug!(
        "compiled base form: {} imports, {} exports",
        module.imports().len(),
        module.exports().len()
    );
    Ok(module)
}
