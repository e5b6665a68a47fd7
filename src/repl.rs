// The interactive REPL. Every submitted line runs inside one anonymous
// package's main function, so state on the runtime stack survives from
// line to line.

use crate::vm::{Vm, ANON_PKG_NAME};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

pub fn run(use_color: bool) -> Result<(), String> {
    let mut rl =
        DefaultEditor::new().map_err(|e| format!("failed to create line editor: {}", e))?;

    let history_path = dirs::home_dir()
        .map(|h| h.join(".argon_history"))
        .unwrap_or_else(|| std::path::PathBuf::from(".argon_history"));
    if history_path.exists() {
        let _ = rl.load_history(&history_path);
    }

    let mut vm = Vm::new();
    let pkg = vm.new_pkg(ANON_PKG_NAME);

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                if line.trim().is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(&line);
                if let Err(err) = vm.run_string(pkg, &line) {
                    err.print(use_color);
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C clears the line.
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => return Err(format!("readline error: {}", err)),
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}
