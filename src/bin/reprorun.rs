//! reprorun - reproducible computation CLI
//!
//! Runs one formula document and prints the run record.
//!
//! ## Usage
//!
//! ```sh
//! reprorun run <formula.yaml|formula.json>
//! reprorun hash <formula.yaml>         # print the formula's conjecture hash
//! ```
//!
//! ## Exit codes
//!
//! | Code | Meaning                                   |
//! |------|-------------------------------------------|
//! | 0    | action ran and exited zero                |
//! | 1    | action ran and exited nonzero             |
//! | 2    | configuration or validation error         |
//! | 3    | no warehouse available                    |
//! | 4    | input hash mismatch                       |
//! | 5    | internal error                            |

use reprorun::executor::{default_workspace, run_formula, ChrootExecutor};
use reprorun::formula::Formula;
use reprorun::Error;
use std::process::ExitCode;

#[derive(Debug)]
enum Command {
    Run { formula: String },
    Hash { formula: String },
    Help,
}

fn parse_args() -> Result<Command, String> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => match args.get(2) {
            Some(path) => Ok(Command::Run {
                formula: path.clone(),
            }),
            None => Err("run requires a formula path".to_string()),
        },
        Some("hash") => match args.get(2) {
            Some(path) => Ok(Command::Hash {
                formula: path.clone(),
            }),
            None => Err("hash requires a formula path".to_string()),
        },
        Some("help") | Some("--help") | Some("-h") | None => Ok(Command::Help),
        Some(other) => Err(format!("unknown command {other:?}")),
    }
}

fn print_help() {
    println!("reprorun - reproducible computation engine");
    println!();
    println!("USAGE:");
    println!("  reprorun run <formula.yaml>    run a formula, print its run record");
    println!("  reprorun hash <formula.yaml>   print a formula's conjecture hash");
    println!();
    println!("ENVIRONMENT:");
    println!("  REPRORUN_WORKSPACE   workspace root (default: <tmp>/reprorun)");
}

fn load_formula(path: &str) -> Result<Formula, Error> {
    let doc = std::fs::read(path).map_err(|e| Error::ConfigParsing {
        msg: format!("cannot read formula file {path:?}: {e}"),
    })?;
    Formula::from_document(&doc)
}

/// Maps an engine failure to the documented exit code table.
fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::ConfigParsing { .. } | Error::ConfigValidation { .. } => 2,
        Error::WarehouseUnavailable { .. } | Error::WareDne { .. } => 3,
        Error::HashMismatch { .. } => 4,
        _ => 5,
    }
}

async fn cmd_run(path: &str) -> ExitCode {
    let formula = match load_formula(path) {
        Ok(formula) => formula,
        Err(e) => {
            eprintln!("reprorun: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let executor = match ChrootExecutor::new(default_workspace()) {
        Ok(executor) => executor,
        Err(e) => {
            eprintln!("reprorun: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let sinks = (
        Box::new(std::io::stdout()) as Box<dyn std::io::Write + Send>,
        Box::new(std::io::stderr()) as Box<dyn std::io::Write + Send>,
    );
    let outcome = match run_formula(&executor, formula, Some(sinks)).await {
        Ok(outcome) => outcome,
        Err(e) => {
            eprintln!("reprorun: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    match outcome.record.encode() {
        Ok(bytes) => println!("{}", String::from_utf8_lossy(&bytes)),
        Err(e) => {
            eprintln!("reprorun: {e}");
            return ExitCode::from(5);
        }
    }

    match &outcome.record.failure {
        Some(failure) => ExitCode::from(exit_code_for(failure)),
        None if outcome.exit_code == 0 => ExitCode::SUCCESS,
        None => ExitCode::from(1),
    }
}

fn cmd_hash(path: &str) -> ExitCode {
    match load_formula(path).and_then(|f| reprorun::hashing::formula_hid(&f)) {
        Ok(hid) => {
            println!("{hid}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("reprorun: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match parse_args() {
        Ok(Command::Run { formula }) => cmd_run(&formula).await,
        Ok(Command::Hash { formula }) => cmd_hash(&formula),
        Ok(Command::Help) => {
            print_help();
            ExitCode::SUCCESS
        }
        Err(msg) => {
            eprintln!("reprorun: {msg}");
            print_help();
            ExitCode::from(2)
        }
    }
}
