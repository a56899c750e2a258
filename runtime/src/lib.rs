//! wasmrepl runtime
//!
//! This crate hosts a read-eval-print loop whose evaluator is a compiler: every
//! submitted expression becomes a fresh WebAssembly unit that is linked into the
//! running program, next to every unit linked before it. Memory and the
//! indirect-call table are shared by all units and only ever grow.
//!
//! # Architecture
//!
//! - `bridge`: Byte channel between host strings and the program's linear memory
//! - `host`: Host import surface (console, groups, marks, results, `compile_init`)
//! - `linker`: Incremental linker (import object, growth, two-phase entry)
//! - `program`: Program / unit bookkeeping (append-only, owned)
//! - `session`: Session host state machine (`Loading → Ready ⇄ Evaluating`)
//! - `replicator`: Isolated sessions sharing one compiled base form
//! - `engine`: Wasmtime engine construction from [`HostConfig`]

pub mod bridge;
pub mod engine;
pub mod host;
pub mod linker;
pub mod program;
pub mod replicator;
pub mod session;

use hashbrown::HashMap;
use serde::Deserialize;

use host::{HostCall, Namespace};

pub use replicator::{Replicator, SessionHandle};
pub use session::{Response, Session, SessionState};

/// Runtime error types.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    // ── Byte channel ─────────────────────────────────────────────────

    /// A byte range does not fit inside the current linear memory.
    #[error("out of bounds: {count} bytes at {address} exceed memory of {memory_size} bytes")]
    OutOfBounds {
        address: u64,
        count: u64,
        memory_size: usize,
    },

    // ── Host import surface ──────────────────────────────────────────

    /// `group_end` was called with no open group.
    #[error("unbalanced group: group_end called at depth 0")]
    UnbalancedGroup,

    /// A unit reported an unrecoverable evaluator failure via `panic_error`.
    #[error("{0}")]
    Fatal(String),

    // ── Linking ──────────────────────────────────────────────────────

    /// A unit's static initializer returned a non-zero code.
    #[error("static initialization of unit {unit} failed with code {code}")]
    StaticInit { unit: usize, code: i32 },

    /// Malformed or unresolvable unit bytes.
    #[error("instantiation failed: {0}")]
    InstantiationError(String),

    /// The base form could not be compiled.
    #[error("compilation failed: {0}")]
    CompilationError(String),

    /// A link asked for an offset below the previous unit's.
    #[error("{region} base {requested} is below the previous unit's base {previous}")]
    OffsetRegression {
        region: &'static str,
        requested: i64,
        previous: u32,
    },

    /// Growing memory or the table would exceed the configured limit.
    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// A required export is missing or has the wrong signature.
    #[error("missing export `{name}`: {reason}")]
    MissingExport { name: String, reason: String },

    /// Wasm code trapped.
    #[error("execution failed: {0}")]
    ExecutionError(String),

    // ── Session ──────────────────────────────────────────────────────

    /// A host entry point ran before the base form finished loading.
    #[error("program not loaded")]
    ProgramNotLoaded,

    /// The session cannot accept a submission in its current state.
    #[error("session is {0:?}, not Ready")]
    NotReady(SessionState),

    /// The session's thread is gone.
    #[error("session closed")]
    SessionClosed,

    /// The OS refused to start a session thread.
    #[error("failed to start session thread: {0}")]
    ThreadSpawn(String),
}

impl RuntimeError {
    /// Recover a runtime error carried through wasm frames by a host function,
    /// or describe the trap if the failure originated elsewhere.
    pub fn from_wasm(err: &wasmtime::Error) -> Self {
        match err.downcast_ref::<RuntimeError>() {
            Some(inner) => inner.clone(),
            None => RuntimeError::ExecutionError(format!("{:#}", err)),
        }
    }
}

/// Host configuration.
///
/// Engine toggles apply when a [`Replicator`] compiles the base form; the
/// remaining fields are read by every session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum linear memory (in pages, 64KB each).
    pub max_memory_pages: u64,
    /// Maximum table size.
    pub max_table_size: u32,
    /// Enable SIMD instructions.
    pub enable_simd: bool,
    /// Enable reference types.
    pub enable_reference_types: bool,
    /// Enable bulk memory operations.
    pub enable_bulk_memory: bool,
    /// Stack size for WASM execution.
    pub stack_size: usize,
    /// ABI names shared by the base form and units.
    pub abi: AbiNames,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            max_memory_pages: 256, // 16 MB
            max_table_size: 10000,
            enable_simd: true,
            enable_reference_types: true,
            enable_bulk_memory: true,
            stack_size: 1024 * 1024, // 1 MB
            abi: AbiNames::default(),
        }
    }
}

/// Import namespaces and export names the host relies on.
///
/// Every namespace defaults to `env`, so a unit may import everything from
/// one module; evaluators that split the host surface, the shared system
/// objects and the published symbols across several modules set them here.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AbiNames {
    /// Namespace of the console entry points (`log` .. `group_end`).
    pub console_module: String,
    /// Namespace of `mark`.
    pub performance_module: String,
    /// Namespace of `compile_init`, `post_output`, `post_error` and the
    /// surface version global.
    pub env_module: String,
    /// Namespace of the shared memory, table and the two base globals.
    pub system_module: String,
    /// Namespace under which base and unit exports are published.
    pub exports_module: String,
    /// Import name of the shared memory in the system namespace.
    pub import_memory: String,
    /// Import name of the shared table in the system namespace.
    pub import_table: String,
    /// Import name of the unit's memory base global.
    pub memory_base: String,
    /// Import name of the unit's table base global.
    pub table_base: String,
    /// Import names replacing the default name of a host entry point, keyed
    /// by the default name (`log = "_console_log"`).
    pub host_calls: HashMap<String, String>,
    /// Base export: shared linear memory.
    pub memory: String,
    /// Base export: shared indirect-call table.
    pub table: String,
    /// Base export: global-state initializer, `() -> ()`.
    pub initialize: String,
    /// Base export: evaluator entry point, `(address, count) -> ()`.
    pub evaluate: String,
    /// Base export: result renderer, `(value) -> ()`.
    pub report_result: String,
    /// Unit export: static initializer, `() -> i32` (zero on success).
    pub static_init: String,
    /// Unit export: main entry point, `() -> i32`.
    pub main: String,
}

impl AbiNames {
    /// Namespace `call` is imported from.
    pub fn host_module(&self, call: HostCall) -> &str {
        match call.namespace() {
            Namespace::Console => &self.console_module,
            Namespace::Performance => &self.performance_module,
            Namespace::Env => &self.env_module,
        }
    }

    /// Import name of `call`.
    pub fn host_name(&self, call: HostCall) -> &str {
        self.host_calls
            .get(call.name())
            .map(String::as_str)
            .unwrap_or(call.name())
    }
}

impl Default for AbiNames {
    fn default() -> Self {
        AbiNames {
            console_module: "env".into(),
            performance_module: "env".into(),
            env_module: "env".into(),
            system_module: "env".into(),
            exports_module: "env".into(),
            import_memory: "memory".into(),
            import_table: "__indirect_function_table".into(),
            memory_base: "__memory_base".into(),
            table_base: "__table_base".into(),
            host_calls: HashMap::new(),
            memory: "memory".into(),
            table: "__indirect_function_table".into(),
            initialize: "initialize".into(),
            evaluate: "evaluate".into(),
            report_result: "report_result".into(),
            static_init: "static_init".into(),
            main: "main".into(),
        }
    }
}
