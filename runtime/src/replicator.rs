//! Isolated session replicator.
//!
//! Compiles a base form once and starts any number of sessions from it. Each
//! session lives on its own thread with its own store, so sessions share the
//! compiled code and nothing else.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use spin::Mutex;
use wasmtime::{Engine, Module};

use crate::engine;
use crate::host::ConsoleEvent;
use crate::program::ProgramSnapshot;
use crate::session::{HistoryEntry, Response, Session, SessionState};
use crate::{HostConfig, RuntimeError};

/// Messages understood by a session thread.
enum Request {
    Submit(String, Sender<Result<Response, RuntimeError>>),
    Snapshot(Sender<ProgramSnapshot>),
    DrainConsole(Sender<Vec<ConsoleEvent>>),
    History(Sender<Vec<HistoryEntry>>),
}

/// Factory for sessions sharing one compiled base form.
pub struct Replicator {
    engine: Engine,
    base: Module,
    config: Arc<HostConfig>,
    next_id: u64,
}

impl Replicator {
    /// Build the engine and compile `base` under `config`.
    pub fn new(config: HostConfig, base: &[u8]) -> Result<Self, RuntimeError> {
        let engine = engine::build(&config)?;
        let len = base.len();
        let base = engine::compile_base(&engine, base)?;
        log::info!("base form compiled ({} bytes)", len);
        Ok(Replicator {
            engine,
            base,
            config: Arc::new(config),
            next_id: 0,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn base(&self) -> &Module {
        &self.base
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Start a session with the replicator's configuration.
    ///
    /// Blocks until the session has loaded. A base form that fails to load
    /// still yields a handle, in state [`SessionState::Failed`].
    pub fn spawn(&mut self) -> Result<SessionHandle, RuntimeError> {
        let config = self.config.clone();
        self.start(config)
    }

    /// Start a session with its own configuration.
    ///
    /// Engine toggles in `config` are ignored; the base form is already
    /// compiled.
    pub fn spawn_with(&mut self, config: HostConfig) -> Result<SessionHandle, RuntimeError> {
        self.start(Arc::new(config))
    }

    /// Start `count` independent sessions.
    pub fn spawn_many(&mut self, count: usize) -> Result<Vec<SessionHandle>, RuntimeError> {
        (0..count).map(|_| self.spawn()).collect()
    }

    fn start(&mut self, config: Arc<HostConfig>) -> Result<SessionHandle, RuntimeError> {
        let id = self.next_id;
        self.next_id += 1;

        let state = Arc::new(Mutex::new(SessionState::Loading));
        let (requests, inbox) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();

        let engine = self.engine.clone();
        let base = self.base.clone();
        let worker_state = state.clone();
        let worker = thread::Builder::new()
            .name(format!("session-{}", id))
            .spawn(move || run(id, engine, base, config, worker_state, ready_tx, inbox))
            .map_err(|e| RuntimeError::ThreadSpawn(e.to_string()))?;

        let load_error = match ready_rx.recv() {
            Ok(outcome) => outcome.err(),
            Err(_) => Some(RuntimeError::SessionClosed),
        };
        if load_error.is_some() {
            *state.lock() = SessionState::Failed;
        }

        Ok(SessionHandle {
            id,
            state,
            requests: load_error.is_none().then_some(requests),
            load_error,
            worker: Some(worker),
        })
    }
}

/// Session thread body.
fn run(
    id: u64,
    engine: Engine,
    base: Module,
    config: Arc<HostConfig>,
    state: Arc<Mutex<SessionState>>,
    ready: Sender<Result<(), RuntimeError>>,
    inbox: Receiver<Request>,
) {
    let mut session = match Session::load(&engine, &base, config) {
        Ok(session) => session,
        Err(e) => {
            log::error!("session {} failed to load: {}", id, e);
            *state.lock() = SessionState::Failed;
            let _ = ready.send(Err(e));
            return;
        }
    };
    *state.lock() = SessionState::Ready;
    let _ = ready.send(Ok(()));
    log::info!("session {} ready", id);

    for request in inbox {
        match request {
            Request::Submit(text, reply) => {
                *state.lock() = SessionState::Evaluating;
                let response = session.submit(&text);
                *state.lock() = session.state();
                let _ = reply.send(response);
            }
            Request::Snapshot(reply) => {
                let _ = reply.send(session.snapshot());
            }
            Request::DrainConsole(reply) => {
                let _ = reply.send(session.drain_console());
            }
            Request::History(reply) => {
                let _ = reply.send(session.history().to_vec());
            }
        }
    }
    log::info!("session {} closed", id);
}

/// Owner-side end of a running session.
pub struct SessionHandle {
    id: u64,
    state: Arc<Mutex<SessionState>>,
    requests: Option<Sender<Request>>,
    load_error: Option<RuntimeError>,
    worker: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Why the session failed to load, if it did.
    pub fn load_error(&self) -> Option<&RuntimeError> {
        self.load_error.as_ref()
    }

    /// Submit text and wait for its response.
    pub fn submit(&mut self, text: &str) -> Result<Response, RuntimeError> {
        let text = text.to_string();
        self.call(|reply| Request::Submit(text, reply))?
    }

    pub fn snapshot(&self) -> Result<ProgramSnapshot, RuntimeError> {
        self.call(Request::Snapshot)
    }

    pub fn drain_console(&self) -> Result<Vec<ConsoleEvent>, RuntimeError> {
        self.call(Request::DrainConsole)
    }

    pub fn history(&self) -> Result<Vec<HistoryEntry>, RuntimeError> {
        self.call(Request::History)
    }

    fn call<T>(&self, request: impl FnOnce(Sender<T>) -> Request) -> Result<T, RuntimeError> {
        if self.load_error.is_some() {
            return Err(RuntimeError::NotReady(SessionState::Failed));
        }
        let requests = self.requests.as_ref().ok_or(RuntimeError::SessionClosed)?;
        let (reply, response) = mpsc::channel();
        requests
            .send(request(reply))
            .map_err(|_| RuntimeError::SessionClosed)?;
        response.recv().map_err(|_| RuntimeError::SessionClosed)
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("session {} thread panicked", self.id);
            }
        }
    }
}
