//! Command-line runner for civet scripts.
//!
//! `civet [-d] [-e STRING] [-h] [FILE args...]`: `-e` wraps the string in
//! `function main(){ ...; }` and runs it; a script file runs its `main`
//! with `[filename, ...args]` as the single argument. A numeric return
//! value becomes the process exit code.

use std::{env, process::ExitCode};

use civet::{Error, Program, Value};

fn print_usage(progname: &str) {
    println!("USAGE: {progname} [options] [filename [args...]]");
    println!();
    println!("options:");
    println!();
    println!("  -e STRING    execute STRING");
    println!("  -d           dump bytecode before execution");
    println!("  -h           display this help");
}

/// `gc()`: run a full collection now.
fn native_gc(prog: &mut Program, _args: &[Value]) -> Result<Value, Error> {
    prog.collect_garbage();
    Ok(Value::Null)
}

fn run_string(prog: &mut Program, dump_bytecode: bool, code: &str) -> Result<Value, Error> {
    let wrapped = format!("function main(){{{code};}}");
    prog.compile_str("<command line>", &wrapped)?;
    if dump_bytecode {
        print!("{}", prog.dump_bytecode());
    }
    prog.call("main", &[])
}

fn run_script_file(
    prog: &mut Program,
    dump_bytecode: bool,
    filename: &str,
    args: &[String],
) -> Result<Value, Error> {
    prog.compile_file(filename)?;
    if dump_bytecode {
        print!("{}", prog.dump_bytecode());
    }

    let script_args = prog.new_array();
    let name = prog.new_string(filename);
    prog.array_push(script_args, name)?;
    for arg in args {
        let v = prog.new_string(arg);
        prog.array_push(script_args, v)?;
    }
    prog.call("main", &[script_args])
}

fn main() -> ExitCode {
    let argv: Vec<String> = env::args().collect();
    let progname = argv.first().map_or("civet", String::as_str);

    let mut execute_code: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut script_args: &[String] = &[];
    let mut dump_bytecode = false;

    let mut i = 1;
    while i < argv.len() {
        let arg = &argv[i];
        if !arg.starts_with('-') {
            filename = Some(arg.clone());
            script_args = &argv[i + 1..];
            break;
        }
        match arg.as_str() {
            "-h" => {
                print_usage(progname);
                return ExitCode::SUCCESS;
            }
            "-d" => dump_bytecode = true,
            "-e" => {
                i += 1;
                let Some(code) = argv.get(i) else {
                    println!("{progname}: option '-e' requires an argument");
                    return ExitCode::FAILURE;
                };
                execute_code = Some(code.clone());
            }
            _ => {
                println!("{progname}: unknown option '{arg}'");
                return ExitCode::FAILURE;
            }
        }
        i += 1;
    }

    if filename.is_none() && execute_code.is_none() {
        print_usage(progname);
        return ExitCode::SUCCESS;
    }

    let mut prog = Program::new();
    prog.register_native("gc", native_gc);

    let result = match (&execute_code, &filename) {
        (Some(code), _) => run_string(&mut prog, dump_bytecode, code),
        (None, Some(file)) => run_script_file(&mut prog, dump_bytecode, file, script_args),
        (None, None) => unreachable!("handled above"),
    };

    match result {
        Ok(ret) => match ret.as_number() {
            #[expect(clippy::cast_possible_truncation, reason = "exit codes wrap to a byte")]
            #[expect(clippy::cast_sign_loss, reason = "exit codes wrap to a byte")]
            Some(n) => ExitCode::from((n as i64 & 0xff) as u8),
            None => ExitCode::SUCCESS,
        },
        Err(err) => {
            println!("ERROR: {err}");
            ExitCode::FAILURE
        }
    }
}
