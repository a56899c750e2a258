//! Host configuration loading.
//!
//! Defaults, then an optional TOML file, then command-line overrides.

use std::fs;
use std::path::Path;

use wasmrepl_runtime::HostConfig;

use crate::cli::Cli;
use crate::error::ReplError;

/// Read `path` as TOML, or fall back to the defaults when no file is given.
pub fn load(path: Option<&Path>) -> Result<HostConfig, ReplError> {
    let Some(path) = path else {
        return Ok(HostConfig::default());
    };
    let text = fs::read_to_string(path)?;
    let config = toml::from_str(&text)?;
    log::debug!("loaded host configuration from {}", path.display());
    Ok(config)
}

/// Apply command-line overrides.
pub fn apply_overrides(config: &mut HostConfig, cli: &Cli) {
    if let Some(pages) = cli.max_memory_pages {
        config.max_memory_pages = pages;
    }
    if let Some(size) = cli.max_table_size {
        config.max_table_size = size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_no_file_gives_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.max_memory_pages, 256);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_memory_pages = 4").unwrap();
        writeln!(file, "[abi]").unwrap();
        writeln!(file, "evaluate = \"eval\"").unwrap();

        let config = load(Some(file.path())).unwrap();
        assert_eq!(config.max_memory_pages, 4);
        assert_eq!(config.max_table_size, 10000);
        assert_eq!(config.abi.evaluate, "eval");
        assert_eq!(config.abi.memory, "memory");
    }

    #[test]
    fn test_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_memory_pages = \"lots\"").unwrap();
        assert!(matches!(
            load(Some(file.path())),
            Err(ReplError::ConfigParse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ReplError::Io(_))));
    }

    #[test]
    fn test_cli_overrides_file() {
        let cli = Cli::try_parse_from(["wasmrepl", "base.wat", "--max-table-size", "64"]).unwrap();
        let mut config = HostConfig::default();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.max_table_size, 64);
        assert_eq!(config.max_memory_pages, 256);
    }
}
