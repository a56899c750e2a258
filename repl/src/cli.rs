use std::path::PathBuf;

use clap::Parser;

/// Interactive loop over an incremental module host session.
#[derive(Parser, Debug)]
#[command(name = "wasmrepl", version)]
#[command(about = "Evaluate expressions by linking compiled WebAssembly units into a live program")]
pub struct Cli {
    /// Base form: a WebAssembly module (binary or text) exporting the evaluator
    pub base: PathBuf,

    /// TOML file with host configuration
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the linear memory limit, in 64 KiB pages
    #[arg(long)]
    pub max_memory_pages: Option<u64>,

    /// Override the indirect-call table limit
    #[arg(long)]
    pub max_table_size: Option<u32>,

    /// Do not print the console transcript after each response
    #[arg(long, short)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_overrides() {
        let cli = Cli::try_parse_from([
            "wasmrepl",
            "base.wasm",
            "--max-memory-pages",
            "8",
            "-q",
        ])
        .unwrap();
        assert_eq!(cli.base, PathBuf::from("base.wasm"));
        assert_eq!(cli.max_memory_pages, Some(8));
        assert_eq!(cli.max_table_size, None);
        assert!(cli.quiet);
    }

    #[test]
    fn test_base_is_required() {
        assert!(Cli::try_parse_from(["wasmrepl"]).is_err());
    }
}
