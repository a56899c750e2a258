//! Session host.
//!
//! A session owns exactly one program and turns submitted text into exactly
//! one [`Response`]. Its lifecycle:
//!
//! ```text
//! Loading ──► Ready ──submit──► Evaluating ──► Ready ...
//!    │
//!    └──► Failed (base form did not instantiate)
//! ```

use std::sync::Arc;

use wasmtime::{Engine, Memory, Module, Store, Table, TypedFunc};

use crate::bridge;
use crate::host::{self, ConsoleEvent};
use crate::program::{self, Program, ProgramSnapshot, ProgramState, UnitSummary};
use crate::{HostConfig, RuntimeError};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Base form is being instantiated.
    Loading,
    /// Idle, accepting submissions.
    Ready,
    /// A submission is being evaluated.
    Evaluating,
    /// The base form failed to instantiate.
    Failed,
}

/// Result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Rendered evaluation result.
    Output(String),
    /// Evaluation failure, reported by the evaluator or caught by the host.
    Error(String),
}

impl Response {
    pub fn is_output(&self) -> bool {
        matches!(self, Response::Output(_))
    }

    pub fn text(&self) -> &str {
        match self {
            Response::Output(text) | Response::Error(text) => text,
        }
    }
}

/// One submitted input and what it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub input: String,
    pub response: Response,
}

/// A running program plus its submission protocol.
pub struct Session {
    /// Store holding the program and host-side state.
    store: Store<ProgramState>,
    /// Base evaluator entry point.
    evaluate: TypedFunc<(i32, i32), ()>,
    /// Shared linear memory.
    memory: Memory,
    /// Shared indirect-call table.
    table: Table,
    /// Lifecycle state.
    state: SessionState,
    /// Submissions in order.
    history: Vec<HistoryEntry>,
}

impl Session {
    /// Instantiate `base` into a fresh store and run its initializer.
    pub fn load(engine: &Engine, base: &Module, config: Arc<HostConfig>) -> Result<Self, RuntimeError> {
        let abi = config.abi.clone();
        let mut store = Store::new(engine, ProgramState::new(config));

        let mut linker = host::surface_linker(&mut store, &abi)
            .map_err(|e| RuntimeError::InstantiationError(format!("{:#}", e)))?;
        let instance = linker
            .instantiate(&mut store, base)
            .map_err(|e| RuntimeError::InstantiationError(format!("{:#}", e)))?;

        let memory = instance
            .get_memory(&mut store, &abi.memory)
            .ok_or_else(|| RuntimeError::MissingExport {
                name: abi.memory.clone(),
                reason: "base form must export its linear memory".into(),
            })?;
        let table = instance
            .get_table(&mut store, &abi.table)
            .ok_or_else(|| RuntimeError::MissingExport {
                name: abi.table.clone(),
                reason: "base form must export its indirect-call table".into(),
            })?;
        let initialize = program::typed_export::<(), ()>(&instance, &mut store, &abi.initialize)?;
        let evaluate = program::typed_export::<(i32, i32), ()>(&instance, &mut store, &abi.evaluate)?;
        program::typed_export::<i32, ()>(&instance, &mut store, &abi.report_result)?;

        linker
            .define(&store, &abi.system_module, &abi.import_memory, memory)
            .and_then(|l| l.define(&store, &abi.system_module, &abi.import_table, table))
            .map_err(|e| RuntimeError::InstantiationError(format!("{:#}", e)))?;
        store.data_mut().surface = Some(linker);

        let exports = program::collect_exports(&mut store, &instance);
        let mut linked = Program::new(instance, memory, table);
        linked.publish(exports, &abi);
        store.data_mut().program = Some(linked);

        initialize
            .call(&mut store, ())
            .map_err(|e| RuntimeError::from_wasm(&e))?;
        if let Some(stale) = store.data_mut().take_response() {
            log::warn!("discarding result posted during initialization: {:?}", stale);
        }
        log::info!(
            "session ready: {} memory pages, {} table slots",
            memory.size(&store),
            table.size(&store)
        );

        Ok(Session {
            store,
            evaluate,
            memory,
            table,
            state: SessionState::Ready,
            history: Vec::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Evaluate `text`, producing exactly one response.
    ///
    /// Every failure raised while the evaluator runs becomes
    /// [`Response::Error`]; `Err` is only returned when the session is not
    /// [`SessionState::Ready`].
    pub fn submit(&mut self, text: &str) -> Result<Response, RuntimeError> {
        if self.state != SessionState::Ready {
            return Err(RuntimeError::NotReady(self.state));
        }
        self.state = SessionState::Evaluating;
        let response = self.evaluate_text(text);
        self.state = SessionState::Ready;

        log::debug!("submission {} -> {:?}", self.history.len(), response);
        self.history.push(HistoryEntry {
            input: text.to_string(),
            response: response.clone(),
        });
        Ok(response)
    }

    fn evaluate_text(&mut self, text: &str) -> Response {
        let len = match bridge::write(&self.memory, &mut self.store, text) {
            Ok(len) => len,
            Err(e) => return Response::Error(e.to_string()),
        };

        let outcome = self
            .evaluate
            .call(&mut self.store, (bridge::SCRATCH_OFFSET as i32, len as i32));
        let posted = self.store.data_mut().take_response();

        let err = match outcome {
            Ok(()) => {
                return posted.unwrap_or_else(|| {
                    Response::Error("evaluation finished without posting a result".into())
                })
            }
            Err(e) => RuntimeError::from_wasm(&e),
        };

        // A trapped evaluation cannot close the groups it opened.
        self.store.data_mut().console.unwind();
        match (err, posted) {
            (RuntimeError::Fatal(message), _) => Response::Error(message),
            (err, Some(posted)) => {
                log::warn!("evaluation failed after posting a result: {}", err);
                posted
            }
            (err, None) => Response::Error(err.to_string()),
        }
    }

    /// Submissions so far, oldest first.
    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Take the console transcript recorded since the last drain.
    pub fn drain_console(&mut self) -> Vec<ConsoleEvent> {
        self.store.data_mut().console.drain()
    }

    pub fn group_depth(&self) -> u32 {
        self.store.data().console().depth()
    }

    pub fn units(&self) -> Vec<UnitSummary> {
        self.store.data().units().iter().map(|u| u.summary()).collect()
    }

    pub fn memory_pages(&self) -> u64 {
        self.memory.size(&self.store)
    }

    pub fn table_size(&self) -> u32 {
        self.table.size(&self.store)
    }

    /// Copy of the program's observable state.
    pub fn snapshot(&self) -> ProgramSnapshot {
        ProgramSnapshot {
            memory: self.memory.data(&self.store).to_vec(),
            memory_pages: self.memory_pages(),
            table_size: self.table_size(),
            units: self.units(),
            group_depth: self.group_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine;
    use crate::host::Channel;
    use crate::program::UnitState;

    const BASE: &str = include_str!("../tests/fixtures/base.wat");

    fn session() -> Session {
        session_from(BASE)
    }

    fn session_from(base: &str) -> Session {
        let config = HostConfig::default();
        let engine = engine::build(&config).unwrap();
        let base = engine::compile_base(&engine, base.as_bytes()).unwrap();
        Session::load(&engine, &base, Arc::new(config)).unwrap()
    }

    fn unit(main_body: &str) -> String {
        format!(
            r#"(module
                 (import "env" "memory" (memory 1))
                 (import "env" "__memory_base" (global $mb i32))
                 (import "env" "log" (func $log (param i32 i32)))
                 (import "env" "group" (func $group (param i32 i32)))
                 (import "env" "group_end" (func $group_end))
                 (import "env" "panic_error" (func $panic (param i32 i32)))
                 (data (global.get $mb) "boom")
                 (func (export "static_init") (result i32) (i32.const 0))
                 (func (export "main") (result i32) {}))"#,
            main_body
        )
    }

    #[test]
    fn test_load_reaches_ready() {
        let session = session();
        assert_eq!(session.state(), SessionState::Ready);
        assert!(session.units().is_empty());
        assert_eq!(session.group_depth(), 0);
    }

    #[test]
    fn test_submit_renders_main_result() {
        let mut session = session();
        let response = session.submit(&unit("(i32.const 42)")).unwrap();
        assert_eq!(response, Response::Output("42".into()));
        assert_eq!(session.state(), SessionState::Ready);

        let units = session.units();
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].result, Some(42));
        assert!(units[0].state.contains(UnitState::INITIALIZED | UnitState::EXECUTED));
    }

    #[test]
    fn test_negative_result_rendered() {
        let mut session = session();
        let response = session.submit(&unit("(i32.const -17)")).unwrap();
        assert_eq!(response, Response::Output("-17".into()));
    }

    #[test]
    fn test_malformed_unit_reports_error() {
        let mut session = session();
        let response = session.submit("(module (func").unwrap();
        assert!(matches!(response, Response::Error(msg) if msg.contains("instantiation failed")));
        assert!(session.units().is_empty());
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_log_reaches_console() {
        let mut session = session();
        let main = "(call $log (global.get $mb) (i32.const 4)) (i32.const 0)";
        session.submit(&unit(main)).unwrap();
        let events = session.drain_console();
        assert!(events.iter().any(|e| matches!(
            e,
            ConsoleEvent::Message { text, depth: 1, .. } if text == "boom"
        )));
    }

    #[test]
    fn test_entry_phases_run_in_groups() {
        let mut session = session();
        let main = "(call $log (global.get $mb) (i32.const 4)) (i32.const 0)";
        session.submit(&unit(main)).unwrap();
        assert_eq!(
            session.drain_console(),
            vec![
                ConsoleEvent::GroupOpen { depth: 0, label: "unit 0 static_init".into() },
                ConsoleEvent::GroupClose { depth: 0 },
                ConsoleEvent::GroupOpen { depth: 0, label: "unit 0 main".into() },
                ConsoleEvent::Message { channel: Channel::Log, depth: 1, text: "boom".into() },
                ConsoleEvent::GroupClose { depth: 0 },
            ]
        );
        assert_eq!(session.group_depth(), 0);
    }

    #[test]
    fn test_failed_static_init_asserts_in_its_group() {
        let mut session = session();
        let failing = r#"(module
            (func (export "static_init") (result i32) (i32.const 3))
            (func (export "main") (result i32) (i32.const 0)))"#;
        let response = session.submit(failing).unwrap();
        assert!(matches!(
            response,
            Response::Error(msg) if msg.contains("static initialization of unit 0 failed with code 3")
        ));
        assert_eq!(
            session.drain_console(),
            vec![
                ConsoleEvent::GroupOpen { depth: 0, label: "unit 0 static_init".into() },
                ConsoleEvent::Message {
                    channel: Channel::Error,
                    depth: 1,
                    text: "assertion failed: static_init returned 3, expected 0".into(),
                },
                ConsoleEvent::GroupClose { depth: 0 },
            ]
        );
    }

    #[test]
    fn test_trap_in_main_closes_phase_group() {
        let mut session = session();
        let main = "(call $group (global.get $mb) (i32.const 4)) unreachable";
        let response = session.submit(&unit(main)).unwrap();
        assert!(matches!(response, Response::Error(msg) if msg.contains("unreachable")));
        assert_eq!(session.group_depth(), 0);
        let events = session.drain_console();
        assert_eq!(events.last(), Some(&ConsoleEvent::GroupClose { depth: 0 }));
    }

    #[test]
    fn test_result_posted_by_initializer_is_discarded() {
        let base = r#"(module
            (import "env" "post_output" (func $post_output (param i32 i32)))
            (memory (export "memory") 1)
            (table (export "__indirect_function_table") 1 funcref)
            (data (i32.const 60000) "stale!fresh")
            (func (export "initialize")
              (call $post_output (i32.const 60000) (i32.const 6)))
            (func (export "evaluate") (param i32 i32)
              (call $post_output (i32.const 60006) (i32.const 5)))
            (func (export "report_result") (param i32)))"#;
        let mut session = session_from(base);
        assert_eq!(session.submit("x").unwrap(), Response::Output("fresh".into()));
        assert_eq!(session.submit("y").unwrap(), Response::Output("fresh".into()));
    }

    #[test]
    fn test_panic_unwinds_groups() {
        let mut session = session();
        let main = "(call $group (global.get $mb) (i32.const 4))
                    (call $group (global.get $mb) (i32.const 4))
                    (call $panic (global.get $mb) (i32.const 4))
                    (i32.const 0)";
        let response = session.submit(&unit(main)).unwrap();
        assert_eq!(response, Response::Error("boom".into()));
        assert_eq!(session.group_depth(), 0);
    }

    #[test]
    fn test_unbalanced_group_end() {
        let mut session = session();
        // The first call closes the group `main` runs in.
        let main = "(call $group_end) (call $group_end) (i32.const 0)";
        let response = session.submit(&unit(main)).unwrap();
        assert!(matches!(response, Response::Error(msg) if msg.contains("unbalanced group")));
        assert_eq!(session.group_depth(), 0);
    }

    #[test]
    fn test_oversized_input_is_an_error() {
        let mut session = session();
        let huge = " ".repeat(70_000);
        let response = session.submit(&huge).unwrap();
        assert!(matches!(response, Response::Error(msg) if msg.contains("out of bounds")));
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_history_records_every_submission() {
        let mut session = session();
        session.submit(&unit("(i32.const 1)")).unwrap();
        session.submit("garbage").unwrap();
        let history = session.history();
        assert_eq!(history.len(), 2);
        assert!(history[0].response.is_output());
        assert!(!history[1].response.is_output());
        assert_eq!(history[1].input, "garbage");
    }
}
