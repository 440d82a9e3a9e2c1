use std::{
    env, fs,
    io::{self, BufRead as _, Write as _},
    process::ExitCode,
};

use cmel::{CmelError, Runner, StdPrint};

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE_ERROR: u8 = 65;
const EXIT_RUNTIME_ERROR: u8 = 70;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => repl(),
        2 => run_file(&args[1]),
        _ => {
            eprintln!("Usage: cmel [script]");
            ExitCode::from(EXIT_USAGE)
        }
    }
}

fn run_file(path: &str) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read '{path}': {err}");
            return ExitCode::from(EXIT_USAGE);
        }
    };
    let mut runner = Runner::new();
    match runner.run(&source, &mut StdPrint) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{error}");
            match error {
                CmelError::Compile(_) => ExitCode::from(EXIT_COMPILE_ERROR),
                CmelError::Runtime(_) => ExitCode::from(EXIT_RUNTIME_ERROR),
            }
        }
    }
}

/// Reads one line at a time; globals and loaded modules persist across
/// lines. EOF (ctrl-d) exits.
fn repl() -> ExitCode {
    let mut runner = Runner::new();
    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => {
                println!();
                return ExitCode::SUCCESS;
            }
            Ok(_) => {}
        }
        if let Err(error) = runner.run(&line, &mut StdPrint) {
            eprintln!("{error}");
        }
    }
}
