use std::path::PathBuf;
use std::process::ExitCode;

use wasmrepl_runtime::RuntimeError;

/// All errors produced by the wasmrepl binary.
///
/// - **Setup errors** (exit code 2): unreadable base form or config file
/// - **Session errors** (exit code 1): the base form loaded badly or the
///   session died
#[derive(thiserror::Error, Debug)]
pub enum ReplError {
    // ── Setup errors (exit code 2) ───────────────────────────────────

    #[error("Base form not readable: {path}: {source}")]
    BaseNotReadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ── Session errors (exit code 1) ─────────────────────────────────

    #[error("Line editor error: {0}")]
    Editor(#[from] rustyline::error::ReadlineError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

impl ReplError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            ReplError::BaseNotReadable { .. } | ReplError::ConfigParse(_) | ReplError::Io(_) => {
                ExitCode::from(2)
            }
            ReplError::Editor(_) | ReplError::Runtime(_) => ExitCode::from(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_error_is_transparent() {
        let e: ReplError = RuntimeError::SessionClosed.into();
        assert_eq!(e.to_string(), "session closed");
    }

    #[test]
    fn test_missing_base_message() {
        let e = ReplError::BaseNotReadable {
            path: PathBuf::from("base.wasm"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        assert_eq!(e.to_string(), "Base form not readable: base.wasm: gone");
    }
}
