//! Program and unit bookkeeping.
//!
//! A [`Program`] is the evolving executable state of one session: the base
//! instance, the shared memory and table it exports, every linked [`Unit`]
//! and the symbol table later units resolve their imports against. Units are
//! owned by the program for its whole lifetime and never removed.

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashMap;
use wasmtime::{
    AsContextMut, Extern, Instance, Linker, Memory, Module, Table, TypedFunc, WasmParams,
    WasmResults,
};

use crate::host::{self, Console};
use crate::session::Response;
use crate::{AbiNames, HostConfig, RuntimeError};

bitflags::bitflags! {
    /// Two-phase readiness of a unit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct UnitState: u8 {
        /// Static initializer returned zero.
        const INITIALIZED = 1 << 0;
        /// Main entry point returned.
        const EXECUTED = 1 << 1;
        /// Static initializer failed; the unit is retained but non-functional.
        const FAILED = 1 << 2;
    }
}

/// One compiled artifact linked into a program.
pub struct Unit {
    /// Position in link order.
    index: usize,
    /// Raw binary form, copied out of linear memory.
    bytes: Vec<u8>,
    /// Compiled module.
    module: Module,
    /// Live instance inside the session store.
    instance: Instance,
    /// Memory base the unit was linked at.
    memory_base: u32,
    /// Table base the unit was linked at.
    table_base: u32,
    /// Names of the unit's function and global exports.
    exports: Vec<String>,
    /// Readiness flags.
    state: UnitState,
    /// Value returned by the main entry point.
    result: Option<i32>,
}

impl Unit {
    pub(crate) fn new(
        bytes: Vec<u8>,
        module: Module,
        instance: Instance,
        memory_base: u32,
        table_base: u32,
        exports: Vec<String>,
    ) -> Self {
        Unit {
            index: 0,
            bytes,
            module,
            instance,
            memory_base,
            table_base,
            exports,
            state: UnitState::empty(),
            result: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn instance(&self) -> Instance {
        self.instance
    }

    pub fn memory_base(&self) -> u32 {
        self.memory_base
    }

    pub fn table_base(&self) -> u32 {
        self.table_base
    }

    pub fn exports(&self) -> &[String] {
        &self.exports
    }

    pub fn state(&self) -> UnitState {
        self.state
    }

    pub fn result(&self) -> Option<i32> {
        self.result
    }

    /// Whether the unit ran both entry phases.
    pub fn is_functional(&self) -> bool {
        self.state.contains(UnitState::INITIALIZED | UnitState::EXECUTED)
            && !self.state.contains(UnitState::FAILED)
    }

    pub(crate) fn mark(&mut self, state: UnitState) {
        self.state |= state;
    }

    pub(crate) fn set_result(&mut self, value: i32) {
        self.result = Some(value);
    }

    /// Plain copy of the unit's bookkeeping, detached from the store.
    pub fn summary(&self) -> UnitSummary {
        UnitSummary {
            index: self.index,
            byte_len: self.bytes.len(),
            memory_base: self.memory_base,
            table_base: self.table_base,
            exports: self.exports.clone(),
            state: self.state,
            result: self.result,
        }
    }
}

/// Store-independent view of a [`Unit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSummary {
    pub index: usize,
    pub byte_len: usize,
    pub memory_base: u32,
    pub table_base: u32,
    pub exports: Vec<String>,
    pub state: UnitState,
    pub result: Option<i32>,
}

/// Byte-for-byte copy of a program's observable state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSnapshot {
    /// Linear memory contents.
    pub memory: Vec<u8>,
    /// Linear memory size in pages.
    pub memory_pages: u64,
    /// Table size in elements.
    pub table_size: u32,
    /// Linked units in link order.
    pub units: Vec<UnitSummary>,
    /// Console group depth.
    pub group_depth: u32,
}

/// The linked executable state of one session.
pub struct Program {
    /// Base form instance.
    base: Instance,
    /// Shared linear memory (exported by the base).
    memory: Memory,
    /// Shared indirect-call table (exported by the base).
    table: Table,
    /// Linked units, append-only.
    units: Vec<Unit>,
    /// Published exports, most recent definition per name.
    symbols: HashMap<String, Extern>,
}

impl Program {
    pub(crate) fn new(base: Instance, memory: Memory, table: Table) -> Self {
        Program {
            base,
            memory,
            table,
            units: Vec::new(),
            symbols: HashMap::new(),
        }
    }

    pub fn base(&self) -> Instance {
        self.base
    }

    pub fn memory(&self) -> Memory {
        self.memory
    }

    pub fn table(&self) -> Table {
        self.table
    }

    pub fn units(&self) -> &[Unit] {
        &self.units
    }

    /// Look up the current definition of a published symbol.
    pub fn resolve(&self, name: &str) -> Option<&Extern> {
        self.symbols.get(name)
    }

    pub(crate) fn symbols(&self) -> impl Iterator<Item = (&str, &Extern)> {
        self.symbols.iter().map(|(name, item)| (name.as_str(), item))
    }

    /// Memory and table base of the most recently linked unit.
    pub fn last_offsets(&self) -> Option<(u32, u32)> {
        self.units.last().map(|u| (u.memory_base, u.table_base))
    }

    /// Publish exports; a later definition replaces an earlier one of the
    /// same name. Host-reserved names are never published.
    pub(crate) fn publish(&mut self, exports: Vec<(String, Extern)>, abi: &AbiNames) {
        for (name, item) in exports {
            if host::is_reserved(&name, abi) {
                log::debug!("not publishing reserved name `{}`", name);
                continue;
            }
            if self.symbols.insert(name.clone(), item).is_some() {
                log::debug!("`{}` shadows an earlier definition", name);
            }
        }
    }

    /// Append a unit, returning its index.
    pub(crate) fn push_unit(&mut self, mut unit: Unit) -> usize {
        let index = self.units.len();
        unit.index = index;
        self.units.push(unit);
        index
    }
}

/// Store data of a session.
pub struct ProgramState {
    /// Host configuration.
    pub(crate) config: Arc<HostConfig>,
    /// Linked program, present once the base form is instantiated.
    pub(crate) program: Option<Program>,
    /// Host surface plus shared memory and table; cloned for every link.
    pub(crate) surface: Option<Linker<ProgramState>>,
    /// Console group stack and transcript.
    pub(crate) console: Console,
    /// Result posted for the current submission.
    pending: Option<Response>,
    /// Session start, origin for timing marks.
    started: Instant,
}

impl ProgramState {
    pub fn new(config: Arc<HostConfig>) -> Self {
        ProgramState {
            config,
            program: None,
            surface: None,
            console: Console::default(),
            pending: None,
            started: Instant::now(),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    pub fn program(&self) -> Result<&Program, RuntimeError> {
        self.program.as_ref().ok_or(RuntimeError::ProgramNotLoaded)
    }

    pub(crate) fn program_mut(&mut self) -> Result<&mut Program, RuntimeError> {
        self.program.as_mut().ok_or(RuntimeError::ProgramNotLoaded)
    }

    pub(crate) fn surface(&self) -> Result<&Linker<ProgramState>, RuntimeError> {
        self.surface.as_ref().ok_or(RuntimeError::ProgramNotLoaded)
    }

    /// Linked units, empty until the base form is loaded.
    pub fn units(&self) -> &[Unit] {
        self.program.as_ref().map(|p| p.units()).unwrap_or(&[])
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    /// Resolve the current submission. Only the first result counts.
    pub(crate) fn post(&mut self, response: Response) {
        match self.pending {
            Some(_) => log::warn!("ignoring extra result for this submission: {:?}", response),
            None => self.pending = Some(response),
        }
    }

    pub(crate) fn take_response(&mut self) -> Option<Response> {
        self.pending.take()
    }
}

/// Collect the function and global exports of an instance.
pub(crate) fn collect_exports(
    mut store: impl AsContextMut<Data = ProgramState>,
    instance: &Instance,
) -> Vec<(String, Extern)> {
    instance
        .exports(&mut store)
        .filter_map(|export| {
            let name = export.name().to_string();
            match export.into_extern() {
                item @ (Extern::Func(_) | Extern::Global(_)) => Some((name, item)),
                _ => None,
            }
        })
        .collect()
}

/// Fetch a typed export, reporting a missing or mistyped one.
pub(crate) fn typed_export<Params, Results>(
    instance: &Instance,
    store: impl AsContextMut,
    name: &str,
) -> Result<TypedFunc<Params, Results>, RuntimeError>
where
    Params: WasmParams,
    Results: WasmResults,
{
    instance
        .get_typed_func::<Params, Results>(store, name)
        .map_err(|e| RuntimeError::MissingExport {
            name: name.to_string(),
            reason: format!("{:#}", e),
        })
}
