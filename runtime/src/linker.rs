//! Incremental linker.
//!
//! Turns a freshly compiled unit into running state inside an existing
//! program without disturbing any unit linked before it.
//!
//! # Steps
//!
//! 1. Copy the unit bytes out of linear memory (they may be overwritten by the
//!    next submission before we are done).
//! 2. Compile them and check the requested memory/table bases never move
//!    backwards.
//! 3. Grow the shared memory and table to what the unit's imports declare.
//! 4. Build a fresh import object: the session's host surface (which already
//!    holds the shared memory and table), the two base globals and every
//!    published symbol.
//! 5. Instantiate, run `static_init` then `main`, each inside its own console
//!    group, and append the unit.
//! 6. Hand `main`'s value to the base's result export.
//!
//! Growth performed in step 3 is kept even if a later step fails.

use wasmtime::{Caller, ExternType, Linker, Module, Val};

use crate::bridge;
use crate::host::{self, Channel};
use crate::program::{self, ProgramState, Unit, UnitState};
use crate::{AbiNames, HostConfig, RuntimeError};

/// Arguments of a `compile_init` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkRequest {
    /// Address of the unit bytes in linear memory.
    pub address: u64,
    /// Length of the unit bytes.
    pub count: u64,
    /// Where the unit's private memory region begins.
    pub memory_base: i32,
    /// Where the unit's private table region begins.
    pub table_base: i32,
}

/// Link the unit described by `request` into the caller's program.
///
/// Returns the index of the new unit.
pub fn link(caller: &mut Caller<'_, ProgramState>, request: LinkRequest) -> Result<usize, RuntimeError> {
    let config = caller.data().config.clone();
    let (memory, previous) = {
        let program = caller.data().program()?;
        (program.memory(), program.last_offsets())
    };

    let bytes = bridge::read_bytes(&memory, &*caller, request.address, request.count)?;
    let module = Module::new(caller.engine(), &bytes)
        .map_err(|e| RuntimeError::InstantiationError(format!("{:#}", e)))?;
    let (memory_base, table_base) = check_offsets(&request, previous)?;

    grow_to_fit(caller, &module, &config)?;

    let linker = import_object(caller, &config.abi, memory_base, table_base)?;
    let instance = linker
        .instantiate(&mut *caller, &module)
        .map_err(|e| RuntimeError::InstantiationError(format!("{:#}", e)))?;

    let static_init =
        program::typed_export::<(), i32>(&instance, &mut *caller, &config.abi.static_init)?;
    let main = program::typed_export::<(), i32>(&instance, &mut *caller, &config.abi.main)?;

    let exports = program::collect_exports(&mut *caller, &instance);
    let names = exports.iter().map(|(name, _)| name.clone()).collect();
    let mut unit = Unit::new(bytes, module, instance, memory_base, table_base, names);
    let next = caller.data().units().len();

    let abi = &config.abi;
    let init = in_phase(caller, format!("unit {} {}", next, abi.static_init), |caller| {
        let outcome = static_init.call(&mut *caller, ());
        if let Ok(code) = outcome {
            if code != 0 {
                caller.data_mut().console.message(
                    Channel::Error,
                    format!("assertion failed: {} returned {}, expected 0", abi.static_init, code),
                );
            }
        }
        outcome
    });
    let code = match init {
        Ok(code) => code,
        Err(e) => {
            unit.mark(UnitState::FAILED);
            let index = append(caller, unit)?;
            log::warn!("unit {} trapped during static initialization", index);
            return Err(RuntimeError::from_wasm(&e));
        }
    };
    if code != 0 {
        unit.mark(UnitState::FAILED);
        let index = append(caller, unit)?;
        return Err(RuntimeError::StaticInit { unit: index, code });
    }
    unit.mark(UnitState::INITIALIZED);

    let run = in_phase(caller, format!("unit {} {}", next, abi.main), |caller| {
        main.call(&mut *caller, ())
    });
    let value = match run {
        Ok(value) => value,
        Err(e) => {
            let index = append(caller, unit)?;
            log::warn!("unit {} trapped in main", index);
            return Err(RuntimeError::from_wasm(&e));
        }
    };
    unit.mark(UnitState::EXECUTED);
    unit.set_result(value);

    let index = {
        let program = caller.data_mut().program_mut()?;
        program.publish(exports, &config.abi);
        program.push_unit(unit)
    };
    log::debug!(
        "linked unit {} at memory base {} / table base {}",
        index,
        memory_base,
        table_base
    );

    let base = caller.data().program()?.base();
    let report = program::typed_export::<i32, ()>(&base, &mut *caller, &config.abi.report_result)?;
    report
        .call(&mut *caller, value)
        .map_err(|e| RuntimeError::from_wasm(&e))?;

    Ok(index)
}

fn append(caller: &mut Caller<'_, ProgramState>, unit: Unit) -> Result<usize, RuntimeError> {
    Ok(caller.data_mut().program_mut()?.push_unit(unit))
}

/// Run one entry phase inside a console group labelled `label`.
///
/// Groups the phase leaves open are closed with it, trap or not.
fn in_phase<R>(
    caller: &mut Caller<'_, ProgramState>,
    label: String,
    phase: impl FnOnce(&mut Caller<'_, ProgramState>) -> R,
) -> R {
    let depth = caller.data().console().depth();
    caller.data_mut().console.open_group(label);
    let result = phase(&mut *caller);
    caller.data_mut().console.close_to(depth);
    result
}

/// Validate the requested bases against the previous unit's.
fn check_offsets(
    request: &LinkRequest,
    previous: Option<(u32, u32)>,
) -> Result<(u32, u32), RuntimeError> {
    let (memory_floor, table_floor) = previous.unwrap_or((0, 0));
    let memory_base = check_offset("memory", request.memory_base, memory_floor)?;
    let table_base = check_offset("table", request.table_base, table_floor)?;
    Ok((memory_base, table_base))
}

fn check_offset(region: &'static str, requested: i32, floor: u32) -> Result<u32, RuntimeError> {
    if requested < 0 || (requested as u32) < floor {
        return Err(RuntimeError::OffsetRegression {
            region,
            requested: requested as i64,
            previous: floor,
        });
    }
    Ok(requested as u32)
}

/// Grow the shared memory and table to the minimums the unit imports them with.
fn grow_to_fit(
    caller: &mut Caller<'_, ProgramState>,
    module: &Module,
    config: &HostConfig,
) -> Result<(), RuntimeError> {
    let (memory, table) = {
        let program = caller.data().program()?;
        (program.memory(), program.table())
    };

    for import in module.imports() {
        if import.module() != config.abi.system_module {
            continue;
        }
        match import.ty() {
            ExternType::Memory(ty) if import.name() == config.abi.import_memory => {
                let current = memory.size(&*caller);
                let wanted = ty.minimum();
                if wanted <= current {
                    continue;
                }
                if wanted > config.max_memory_pages {
                    return Err(RuntimeError::ResourceLimit(format!(
                        "unit needs {} memory pages, limit is {}",
                        wanted, config.max_memory_pages
                    )));
                }
                memory
                    .grow(&mut *caller, wanted - current)
                    .map_err(|e| RuntimeError::ResourceLimit(format!("memory.grow: {:#}", e)))?;
                log::debug!("memory grown {} -> {} pages", current, wanted);
            }
            ExternType::Table(ty) if import.name() == config.abi.import_table => {
                let current = table.size(&*caller);
                let wanted = ty.minimum();
                if wanted <= current {
                    continue;
                }
                if wanted > config.max_table_size {
                    return Err(RuntimeError::ResourceLimit(format!(
                        "unit needs {} table slots, limit is {}",
                        wanted, config.max_table_size
                    )));
                }
                table
                    .grow(&mut *caller, wanted - current, Val::FuncRef(None))
                    .map_err(|e| RuntimeError::ResourceLimit(format!("table.grow: {:#}", e)))?;
                log::debug!("table grown {} -> {} slots", current, wanted);
            }
            _ => {}
        }
    }
    Ok(())
}

/// Build the import object for one unit.
fn import_object(
    caller: &mut Caller<'_, ProgramState>,
    abi: &AbiNames,
    memory_base: u32,
    table_base: u32,
) -> Result<Linker<ProgramState>, RuntimeError> {
    let instantiation = |e: wasmtime::Error| RuntimeError::InstantiationError(format!("{:#}", e));

    let mut linker = caller.data().surface()?.clone();
    let memory_base = host::const_i32(&mut *caller, memory_base as i32).map_err(instantiation)?;
    let table_base = host::const_i32(&mut *caller, table_base as i32).map_err(instantiation)?;
    linker
        .define(&*caller, &abi.system_module, &abi.memory_base, memory_base)
        .and_then(|l| l.define(&*caller, &abi.system_module, &abi.table_base, table_base))
        .map_err(instantiation)?;

    let program = caller.data().program()?;
    for (name, item) in program.symbols() {
        linker
            .define(&*caller, &abi.exports_module, name, item.clone())
            .map_err(instantiation)?;
    }
    Ok(linker)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(memory_base: i32, table_base: i32) -> LinkRequest {
        LinkRequest {
            address: 0,
            count: 0,
            memory_base,
            table_base,
        }
    }

    #[test]
    fn test_first_unit_accepts_any_offsets() {
        assert_eq!(check_offsets(&request(1024, 3), None), Ok((1024, 3)));
    }

    #[test]
    fn test_equal_offsets_are_allowed() {
        assert_eq!(
            check_offsets(&request(1024, 3), Some((1024, 3))),
            Ok((1024, 3))
        );
    }

    #[test]
    fn test_memory_regression_rejected() {
        assert_eq!(
            check_offsets(&request(512, 3), Some((1024, 3))),
            Err(RuntimeError::OffsetRegression {
                region: "memory",
                requested: 512,
                previous: 1024,
            })
        );
    }

    #[test]
    fn test_table_regression_rejected() {
        assert!(matches!(
            check_offsets(&request(2048, 1), Some((1024, 3))),
            Err(RuntimeError::OffsetRegression { region: "table", .. })
        ));
    }

    #[test]
    fn test_negative_offset_rejected() {
        assert!(matches!(
            check_offsets(&request(-4, 0), None),
            Err(RuntimeError::OffsetRegression { region: "memory", requested: -4, .. })
        ));
    }
}
