//! QuarryDB - interactive shell
//!
//! Reads statements in their log-text form (`begin transaction`, `commit`, or
//! one JSON object per line) and runs them through one session.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use quarrydb::catalog::Manager;
use quarrydb::{Config, Row, SessionId, Statement};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::{fmt, EnvFilter};

/// Print welcome banner
fn print_banner(root: &Path) {
    println!(
        r#"
 QuarryDB - a transactional table store
 Data root: {}
 Type '.help' for help, '.quit' to exit
"#,
        root.display()
    );
}

/// Print help message
fn print_help() {
    println!(
        r#"
Commands:
  .help              Show this help message
  .quit              Persist everything and exit
  .tables            List tables of the current database
  .schema <table>    Show table schema

Statements:
  begin transaction
  commit
  {{"op":"create_database","name":"shop"}}
  {{"op":"use_database","name":"shop"}}
  {{"op":"create_table","table":"t","columns":[{{"name":"id","column_type":"Int","primary":true}},{{"name":"name","column_type":"String","max_length":10}}]}}
  {{"op":"insert","table":"t","rows":[[{{"Int":1}},{{"String":"a"}}]]}}
  {{"op":"select","table":"t"}}
  {{"op":"delete","table":"t","keys":[{{"Int":1}}]}}
"#
    );
}

/// Format query results as a table
fn format_results(columns: &[String], rows: &[Row]) -> String {
    if columns.is_empty() && rows.is_empty() {
        return String::new();
    }

    // Calculate column widths
    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    let rendered: Vec<Vec<String>> = rows.iter().map(|r| r.to_strings()).collect();
    for row in &rendered {
        for (i, value) in row.iter().enumerate() {
            if i < widths.len() {
                widths[i] = widths[i].max(value.len());
            }
        }
    }

    let mut output = String::new();

    let separator: String = widths
        .iter()
        .map(|w| "-".repeat(*w + 2))
        .collect::<Vec<_>>()
        .join("+");
    let separator = format!("+{}+\n", separator);

    // Header
    output.push_str(&separator);
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(c, w)| format!(" {:^width$} ", c, width = *w))
        .collect::<Vec<_>>()
        .join("|");
    output.push_str(&format!("|{}|\n", header));
    output.push_str(&separator);

    // Rows
    for row in &rendered {
        let row_str: String = row
            .iter()
            .zip(&widths)
            .map(|(v, w)| format!(" {:>width$} ", v, width = *w))
            .collect::<Vec<_>>()
            .join("|");
        output.push_str(&format!("|{}|\n", row_str));
    }

    if !rows.is_empty() {
        output.push_str(&separator);
    }

    output.push_str(&format!("{} row(s) returned\n", rows.len()));
    output
}

/// Execute one statement line
fn execute_line(line: &str, manager: &Manager, session: SessionId) {
    let statement = match Statement::from_log_text(line) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            return;
        }
    };

    match manager.execute(session, statement) {
        Ok(result) => {
            if !result.columns.is_empty() || !result.rows.is_empty() {
                print!("{}", format_results(&result.columns, &result.rows));
            } else if let Some(msg) = result.message {
                println!("{}", msg);
            } else if result.affected_rows > 0 {
                println!("{} row(s) affected", result.affected_rows);
            }
        }
        Err(e) => eprintln!("Execution error ({:?}): {}", e.kind(), e),
    }
}

/// Handle special dot commands. Returns false when the shell should exit.
fn handle_special_command(cmd: &str, manager: &Manager) -> bool {
    let parts: Vec<&str> = cmd.split_whitespace().collect();

    match parts.first().copied() {
        Some(".help") => print_help(),
        Some(".quit") | Some(".exit") => return false,
        Some(".tables") => match manager.current_database() {
            Some(db) => {
                let tables = db.table_names();
                if tables.is_empty() {
                    println!("No tables found.");
                } else {
                    println!("Tables in '{}':", db.name());
                    for table in tables {
                        println!("  {}", table);
                    }
                }
            }
            None => eprintln!("No database selected."),
        },
        Some(".schema") => {
            let Some(db) = manager.current_database() else {
                eprintln!("No database selected.");
                return true;
            };
            let names = match parts.get(1) {
                Some(name) => vec![name.to_string()],
                None => db.table_names(),
            };
            for name in names {
                match db.get(&name) {
                    Ok(table) => {
                        println!("{}", name);
                        for column in table.columns() {
                            println!("  {}", column.representation());
                        }
                    }
                    Err(e) => eprintln!("Error: {}", e),
                }
            }
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            eprintln!("Type '.help' for available commands.");
        }
        None => {}
    }
    true
}

fn parse_root() -> anyhow::Result<PathBuf> {
    let args: Vec<String> = env::args().collect();
    let mut root = PathBuf::from(".");
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--root" | "-r" => {
                let Some(dir) = args.get(i + 1) else {
                    bail!("--root needs a directory");
                };
                root = PathBuf::from(dir);
                i += 2;
            }
            other => bail!("unknown argument '{}'", other),
        }
    }
    Ok(root)
}

/// Main REPL loop
fn run_repl(manager: &Manager, session: SessionId) -> anyhow::Result<()> {
    let mut editor = DefaultEditor::new().context("failed to start line editor")?;

    loop {
        let line = match editor.readline("quarrydb> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e).context("failed to read input"),
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(trimmed);

        if trimmed.starts_with('.') {
            if !handle_special_command(trimmed, manager) {
                break;
            }
            continue;
        }
        execute_line(trimmed, manager, session);
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,quarrydb=debug"));
    fmt().with_env_filter(filter).with_target(true).init();

    let root = parse_root()?;
    let config = Config::builder().root_dir(root.clone()).build();
    let manager = Manager::open(config)
        .with_context(|| format!("failed to open data root {}", root.display()))?;
    let session = manager.connect();

    print_banner(&root);
    let repl = run_repl(&manager, session);

    manager.disconnect(session).context("failed to end session")?;
    manager.quit().context("failed to persist state")?;
    println!("Goodbye!");
    repl
}
