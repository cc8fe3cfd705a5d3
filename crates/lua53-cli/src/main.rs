//! Thin driver around [`lua53`]: parse argv, read a script (path, `-e`
//! string, or stdin), compile and run it, and report errors the way the
//! reference interpreter does (`source:line: message` on stderr).

use std::env;
use std::fs;
use std::io::{self, Read};
use std::process::ExitCode;

struct Options {
    execute: Vec<String>,
    script: Option<String>,
    read_stdin: bool,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options { execute: Vec::new(), script: None, read_stdin: false };
    let mut i = 1;
    let mut stop_options = false;

    while i < args.len() {
        let arg = &args[i];
        if !stop_options && arg.starts_with('-') && arg != "-" {
            match arg.as_str() {
                "-e" => {
                    i += 1;
                    let stat = args.get(i).ok_or("'-e' needs argument")?;
                    opts.execute.push(stat.clone());
                }
                "--" => stop_options = true,
                other => return Err(format!("unrecognized option '{other}'")),
            }
        } else if arg == "-" {
            opts.read_stdin = true;
            stop_options = true;
        } else {
            opts.script = Some(arg.clone());
            break;
        }
        i += 1;
    }
    Ok(opts)
}

fn main() -> ExitCode {
    let opts = match parse_args() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("lua53: {e}");
            return ExitCode::FAILURE;
        }
    };

    let state = lua53::vm::state::LuaState::new();
    lua53::stdlib::install(&state);

    for stat in &opts.execute {
        if let Err(e) = lua53::run_in(&state, stat, "=(command line)") {
            eprintln!("lua53: {e}");
            return ExitCode::FAILURE;
        }
    }

    if let Some(path) = &opts.script {
        let source = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("lua53: cannot open {path}: {e}");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = lua53::run_in(&state, &source, path) {
            eprintln!("lua53: {e}");
            return ExitCode::FAILURE;
        }
        return ExitCode::SUCCESS;
    }

    if opts.read_stdin || opts.execute.is_empty() {
        let mut source = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut source) {
            eprintln!("lua53: error reading stdin: {e}");
            return ExitCode::FAILURE;
        }
        if let Err(e) = lua53::run_in(&state, &source, "=stdin") {
            eprintln!("lua53: {e}");
            return ExitCode::FAILURE;
        }
    }

    ExitCode::SUCCESS
}
