//! Line-editor loop over one session.

use std::fs;
use std::path::PathBuf;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use wasmrepl_runtime::host::{Channel, ConsoleEvent};
use wasmrepl_runtime::{Response, SessionHandle};

use crate::error::ReplError;

/// Colon commands understood by the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `:units`: list linked units.
    Units,
    /// `:history`: list past submissions.
    History,
    /// `:memory`: memory and table sizes.
    Memory,
    /// `:load <path>`: submit the contents of a file.
    Load(PathBuf),
    /// `:quit`
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        let rest = input.strip_prefix(':')?;
        let mut words = rest.split_whitespace();
        let name = words.next().unwrap_or_default();
        let command = match name {
            "units" | "u" => Command::Units,
            "history" | "h" => Command::History,
            "memory" | "m" => Command::Memory,
            "quit" | "q" => Command::Quit,
            "load" | "l" => match words.next() {
                Some(path) => Command::Load(PathBuf::from(path)),
                None => Command::Unknown("load needs a path".into()),
            },
            other => Command::Unknown(other.to_string()),
        };
        Some(command)
    }
}

/// Whether every opened bracket is closed, ignoring string contents.
pub fn parens_balanced(input: &str) -> bool {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escape = false;
    for ch in input.chars() {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
        } else {
            match ch {
                '"' => in_string = true,
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth -= 1,
                _ => {}
            }
        }
    }
    depth <= 0
}

/// Run until end of input or `:quit`.
pub fn run(mut session: SessionHandle, quiet: bool) -> Result<(), ReplError> {
    let mut rl = DefaultEditor::new()?;
    let mut input_buf = String::new();

    loop {
        let prompt = if input_buf.is_empty() { "wasm> " } else { "  ... " };
        let line = match rl.readline(prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                input_buf.clear();
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        input_buf.push_str(&line);
        input_buf.push('\n');

        if !parens_balanced(&input_buf) {
            continue;
        }

        let input = input_buf.trim().to_string();
        input_buf.clear();

        if input.is_empty() {
            continue;
        }
        let _ = rl.add_history_entry(input.as_str());

        let text = match Command::parse(&input) {
            Some(Command::Quit) => break,
            Some(Command::Load(path)) => match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(e) => {
                    eprintln!("; cannot read {}: {}", path.display(), e);
                    continue;
                }
            },
            Some(command) => {
                handle_command(&session, command)?;
                continue;
            }
            None => input,
        };

        let response = session.submit(&text)?;
        if !quiet {
            print_console(&session.drain_console()?);
        }
        match response {
            Response::Output(text) => println!("{}", text),
            Response::Error(text) => eprintln!("; error: {}", text),
        }
    }
    Ok(())
}

fn handle_command(session: &SessionHandle, command: Command) -> Result<(), ReplError> {
    match command {
        Command::Units => {
            let snapshot = session.snapshot()?;
            if snapshot.units.is_empty() {
                println!("; no units linked");
            }
            for unit in &snapshot.units {
                println!(
                    "#{:<3} {:>6} bytes  memory@{:<8} table@{:<5} {:?} {}",
                    unit.index,
                    unit.byte_len,
                    unit.memory_base,
                    unit.table_base,
                    unit.state,
                    unit.exports.join(" ")
                );
            }
        }
        Command::History => {
            for (i, entry) in session.history()?.iter().enumerate() {
                let marker = if entry.response.is_output() { "=>" } else { "!!" };
                let first_line = entry.input.lines().next().unwrap_or_default();
                println!("{:>3}  {}  {} {}", i, first_line, marker, entry.response.text());
            }
        }
        Command::Memory => {
            let snapshot = session.snapshot()?;
            println!(
                "; memory: {} pages ({} bytes), table: {} slots, open groups: {}",
                snapshot.memory_pages,
                snapshot.memory.len(),
                snapshot.table_size,
                snapshot.group_depth
            );
        }
        Command::Unknown(name) => eprintln!("; unknown command :{}", name),
        Command::Load(_) | Command::Quit => {}
    }
    Ok(())
}

fn print_console(events: &[ConsoleEvent]) {
    for event in events {
        match event {
            ConsoleEvent::Message { channel, depth, text } => {
                let indent = "  ".repeat(*depth as usize);
                match channel {
                    Channel::Log => println!("{}{}", indent, text),
                    Channel::Warn => eprintln!("{}warning: {}", indent, text),
                    Channel::Error => eprintln!("{}error: {}", indent, text),
                }
            }
            ConsoleEvent::GroupOpen { depth, label } => {
                println!("{}▸ {}", "  ".repeat(*depth as usize), label);
            }
            ConsoleEvent::GroupClose { .. } => {}
            ConsoleEvent::Mark { name, elapsed } => println!("; {} at {:?}", name, elapsed),
        }
    }
}
