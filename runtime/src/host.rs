//! Host import surface.
//!
//! The fixed set of entry points a compiled unit (or the base form) may import:
//! console output, structured groups, timing marks, result reporting and the
//! `compile_init` linking entry point. The set is closed and versioned; see
//! [`HostCall`].

use std::time::Duration;

use wasmtime::{AsContextMut, Caller, Global, GlobalType, Linker, Mutability, Val, ValType};

use crate::bridge;
use crate::linker::{self, LinkRequest};
use crate::program::ProgramState;
use crate::session::Response;
use crate::{AbiNames, RuntimeError};

/// Version of the host import surface.
pub const SURFACE_VERSION: i32 = 1;

/// Global holding [`SURFACE_VERSION`], defined in the env namespace.
pub const SURFACE_VERSION_GLOBAL: &str = "__surface_version";

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Host entry points available to units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCall {
    /// `log(address, count)`
    Log,
    /// `warn(address, count)`
    Warn,
    /// `error(address, count)`
    Error,
    /// `panic_error(address, count)`: unwind groups, then fail fatally.
    PanicError,
    /// `group(address, count)`
    Group,
    /// `group_end()`
    GroupEnd,
    /// `mark(address, count)`
    Mark,
    /// `compile_init(address, count, memory_base, table_base)`
    CompileInit,
    /// `post_output(address, count)`
    PostOutput,
    /// `post_error(address, count)`
    PostError,
}

impl HostCall {
    /// Every entry point, in registration order.
    pub const ALL: [HostCall; 10] = [
        HostCall::Log,
        HostCall::Warn,
        HostCall::Error,
        HostCall::PanicError,
        HostCall::Group,
        HostCall::GroupEnd,
        HostCall::Mark,
        HostCall::CompileInit,
        HostCall::PostOutput,
        HostCall::PostError,
    ];

    /// Import name of the entry point.
    pub fn name(self) -> &'static str {
        match self {
            HostCall::Log => "log",
            HostCall::Warn => "warn",
            HostCall::Error => "error",
            HostCall::PanicError => "panic_error",
            HostCall::Group => "group",
            HostCall::GroupEnd => "group_end",
            HostCall::Mark => "mark",
            HostCall::CompileInit => "compile_init",
            HostCall::PostOutput => "post_output",
            HostCall::PostError => "post_error",
        }
    }

    /// Look up an entry point by its default import name.
    pub fn from_name(name: &str) -> Option<Self> {
        HostCall::ALL.into_iter().find(|call| call.name() == name)
    }

    /// Namespace category the entry point is imported from.
    pub fn namespace(self) -> Namespace {
        match self {
            HostCall::Log
            | HostCall::Warn
            | HostCall::Error
            | HostCall::PanicError
            | HostCall::Group
            | HostCall::GroupEnd => Namespace::Console,
            HostCall::Mark => Namespace::Performance,
            HostCall::CompileInit | HostCall::PostOutput | HostCall::PostError => Namespace::Env,
        }
    }
}

/// Import namespace category of a [`HostCall`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Console,
    Performance,
    Env,
}

/// Whether the host itself defines `name` in the namespace exports are
/// published under, so that no export may shadow it.
pub fn is_reserved(name: &str, abi: &AbiNames) -> bool {
    let exports = abi.exports_module.as_str();
    let host_call = HostCall::ALL
        .into_iter()
        .any(|call| abi.host_module(call) == exports && abi.host_name(call) == name);
    let version = abi.env_module == exports && name == SURFACE_VERSION_GLOBAL;
    let system = abi.system_module == exports
        && [&abi.import_memory, &abi.import_table, &abi.memory_base, &abi.table_base]
            .into_iter()
            .any(|reserved| reserved == name);
    host_call || version || system
}

/// Create a linker holding the host surface and the version global.
pub fn surface_linker(
    mut store: impl AsContextMut<Data = ProgramState>,
    abi: &AbiNames,
) -> wasmtime::Result<Linker<ProgramState>> {
    let mut linker = Linker::new(store.as_context().engine());
    define_surface(&mut linker, abi)?;

    let version = const_i32(&mut store, SURFACE_VERSION)?;
    linker.define(&store, &abi.env_module, SURFACE_VERSION_GLOBAL, version)?;
    Ok(linker)
}

/// Create an immutable i32 global.
pub fn const_i32(
    store: impl AsContextMut<Data = ProgramState>,
    value: i32,
) -> wasmtime::Result<Global> {
    Global::new(
        store,
        GlobalType::new(ValType::I32, Mutability::Const),
        Val::I32(value),
    )
}

/// Register every [`HostCall`] under its configured namespace and name.
pub fn define_surface(linker: &mut Linker<ProgramState>, abi: &AbiNames) -> wasmtime::Result<()> {
    for call in HostCall::ALL {
        let module = abi.host_module(call);
        let name = abi.host_name(call);
        match call {
            HostCall::Log => {
                linker.func_wrap(module, name, |c: Caller<'_, ProgramState>, a: i32, n: i32| {
                    message(c, a, n, Channel::Log)
                })?;
            }
            HostCall::Warn => {
                linker.func_wrap(module, name, |c: Caller<'_, ProgramState>, a: i32, n: i32| {
                    message(c, a, n, Channel::Warn)
                })?;
            }
            HostCall::Error => {
                linker.func_wrap(module, name, |c: Caller<'_, ProgramState>, a: i32, n: i32| {
                    message(c, a, n, Channel::Error)
                })?;
            }
            HostCall::PanicError => {
                linker.func_wrap(module, name, panic_error)?;
            }
            HostCall::Group => {
                linker.func_wrap(module, name, group)?;
            }
            HostCall::GroupEnd => {
                linker.func_wrap(module, name, group_end)?;
            }
            HostCall::Mark => {
                linker.func_wrap(module, name, mark)?;
            }
            HostCall::CompileInit => {
                linker.func_wrap(module, name, compile_init)?;
            }
            HostCall::PostOutput => {
                linker.func_wrap(module, name, |c: Caller<'_, ProgramState>, a: i32, n: i32| {
                    post(c, a, n, Response::Output)
                })?;
            }
            HostCall::PostError => {
                linker.func_wrap(module, name, |c: Caller<'_, ProgramState>, a: i32, n: i32| {
                    post(c, a, n, Response::Error)
                })?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

fn decode(caller: &Caller<'_, ProgramState>, address: i32, count: i32) -> Result<String, RuntimeError> {
    let memory = caller.data().program()?.memory();
    let (address, count) = bridge::wasm_range(address, count);
    bridge::read(&memory, caller, address, count)
}

fn message(
    mut caller: Caller<'_, ProgramState>,
    address: i32,
    count: i32,
    channel: Channel,
) -> wasmtime::Result<()> {
    let text = decode(&caller, address, count)?;
    caller.data_mut().console.message(channel, text);
    Ok(())
}

fn panic_error(mut caller: Caller<'_, ProgramState>, address: i32, count: i32) -> wasmtime::Result<()> {
    let decoded = decode(&caller, address, count);
    let console = &mut caller.data_mut().console;
    console.unwind();
    let text = decoded?;
    console.message(Channel::Error, text.clone());
    Err(RuntimeError::Fatal(text).into())
}

fn group(mut caller: Caller<'_, ProgramState>, address: i32, count: i32) -> wasmtime::Result<()> {
    let label = decode(&caller, address, count)?;
    caller.data_mut().console.open_group(label);
    Ok(())
}

fn group_end(mut caller: Caller<'_, ProgramState>) -> wasmtime::Result<()> {
    caller.data_mut().console.close_group()?;
    Ok(())
}

/// Observational only: a bad range is logged, never returned to the caller.
fn mark(mut caller: Caller<'_, ProgramState>, address: i32, count: i32) -> wasmtime::Result<()> {
    match decode(&caller, address, count) {
        Ok(name) => {
            let elapsed = caller.data().started().elapsed();
            caller.data_mut().console.mark(name, elapsed);
        }
        Err(e) => log::warn!("mark ignored: {}", e),
    }
    Ok(())
}

fn post(
    mut caller: Caller<'_, ProgramState>,
    address: i32,
    count: i32,
    wrap: fn(String) -> Response,
) -> wasmtime::Result<()> {
    let text = decode(&caller, address, count)?;
    caller.data_mut().post(wrap(text));
    Ok(())
}

fn compile_init(
    mut caller: Caller<'_, ProgramState>,
    address: i32,
    count: i32,
    memory_base: i32,
    table_base: i32,
) -> wasmtime::Result<()> {
    let (address, count) = bridge::wasm_range(address, count);
    let request = LinkRequest {
        address,
        count,
        memory_base,
        table_base,
    };
    match linker::link(&mut caller, request) {
        Ok(index) => {
            log::debug!("compile_init linked unit {}", index);
            Ok(())
        }
        Err(e) => {
            log::debug!("compile_init failed: {}", e);
            Err(e.into())
        }
    }
}

// ---------------------------------------------------------------------------
// Console
// ---------------------------------------------------------------------------

/// Output channel of a console message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Log,
    Warn,
    Error,
}

/// One entry of the console transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleEvent {
    /// A message emitted at the given group depth.
    Message {
        channel: Channel,
        depth: u32,
        text: String,
    },
    /// A group opened; `depth` is the depth of the new group's parent.
    GroupOpen { depth: u32, label: String },
    /// A group closed; `depth` is the depth after closing.
    GroupClose { depth: u32 },
    /// A named timing marker, relative to session start.
    Mark { name: String, elapsed: Duration },
}

/// Console group stack and transcript of one program.
#[derive(Debug, Default)]
pub struct Console {
    /// Number of open groups.
    depth: u32,
    /// Events since the last drain.
    events: Vec<ConsoleEvent>,
}

impl Console {
    /// Current group depth.
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Events recorded since the last drain.
    pub fn events(&self) -> &[ConsoleEvent] {
        &self.events
    }

    /// Take the recorded events.
    pub fn drain(&mut self) -> Vec<ConsoleEvent> {
        core::mem::take(&mut self.events)
    }

    pub fn message(&mut self, channel: Channel, text: String) {
        let indent = "  ".repeat(self.depth as usize);
        match channel {
            Channel::Log => log::info!(target: "console", "{}{}", indent, text),
            Channel::Warn => log::warn!(target: "console", "{}{}", indent, text),
            Channel::Error => log::error!(target: "console", "{}{}", indent, text),
        }
        self.events.push(ConsoleEvent::Message {
            channel,
            depth: self.depth,
            text,
        });
    }

    pub fn open_group(&mut self, label: String) {
        log::info!(target: "console", "{}▸ {}", "  ".repeat(self.depth as usize), label);
        self.events.push(ConsoleEvent::GroupOpen {
            depth: self.depth,
            label,
        });
        self.depth += 1;
    }

    /// Close the innermost group.
    pub fn close_group(&mut self) -> Result<(), RuntimeError> {
        if self.depth == 0 {
            return Err(RuntimeError::UnbalancedGroup);
        }
        self.depth -= 1;
        self.events.push(ConsoleEvent::GroupClose { depth: self.depth });
        Ok(())
    }

    /// Close groups until the depth is at most `depth`, returning how many
    /// were closed.
    pub fn close_to(&mut self, depth: u32) -> u32 {
        let mut closed = 0;
        while self.depth > depth {
            self.depth -= 1;
            self.events.push(ConsoleEvent::GroupClose { depth: self.depth });
            closed += 1;
        }
        closed
    }

    /// Close every open group, returning how many were closed.
    pub fn unwind(&mut self) -> u32 {
        let open = self.close_to(0);
        if open > 0 {
            log::debug!("unwound {} console groups", open);
        }
        open
    }

    pub fn mark(&mut self, name: String, elapsed: Duration) {
        log::debug!(target: "console", "mark `{}` at {:?}", name, elapsed);
        self.events.push(ConsoleEvent::Mark { name, elapsed });
    }
}
