use argon::vm::{disasm, extract_pkg_name, Vm};
use std::env;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;

const USAGE: &str = "\
usage: argon [options] [command] <file>

Running `argon` with no arguments starts the REPL.

commands:
  run <file>    compile and execute a source file (the default)
  dism <file>   compile a source file and print its bytecode

options:
  -h, --help     print this message
  -v, --version  print the version number";

fn main() -> ExitCode {
    let args = env::args().skip(1).collect::<Vec<String>>();
    let use_color = std::io::stderr().is_terminal();

    let (cmd, path) = match args.first().map(String::as_str) {
        None => {
            if let Err(e) = argon::repl::run(use_color) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
            return ExitCode::SUCCESS;
        }
        Some("-h") | Some("--help") => {
            println!("{}", USAGE);
            return ExitCode::SUCCESS;
        }
        Some("-v") | Some("--version") => {
            println!("argon {}", env!("CARGO_PKG_VERSION"));
            return ExitCode::SUCCESS;
        }
        Some(cmd @ ("run" | "dism")) => match args.get(1) {
            Some(path) => (cmd, path.clone()),
            None => {
                eprintln!("expected a file argument\n{}", USAGE);
                return ExitCode::FAILURE;
            }
        },
        Some(path) => ("run", path.to_string()),
    };

    let path = Path::new(&path);
    match cmd {
        "run" => {
            let mut vm = Vm::new();
            if let Err(err) = vm.run_file(path) {
                err.print(use_color);
                return ExitCode::FAILURE;
            }
        }
        "dism" => {
            let mut vm = Vm::new();
            let result = extract_pkg_name(path)
                .ok_or_else(|| {
                    argon::Error::parse(format!(
                        "invalid package name from file path `{}`",
                        path.display()
                    ))
                })
                .and_then(|name| {
                    let code = std::fs::read_to_string(path).map_err(|_| {
                        argon::Error::parse(format!("failed to open file `{}`", path.display()))
                    })?;
                    let pkg = vm.new_pkg(name);
                    vm.parse(pkg, Some(path), &code)
                });
            match result {
                Ok(()) => print!("{}", disasm::disassemble(&vm)),
                Err(err) => {
                    err.print(use_color);
                    return ExitCode::FAILURE;
                }
            }
        }
        _ => unreachable!(),
    }
    ExitCode::SUCCESS
}
