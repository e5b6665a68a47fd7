// The compilation and execution core of the Argon scripting language.
//
// Source text is compiled in a single pass (no AST) to a compact
// register-based bytecode and executed by an interpreter with hot-loop
// profiling; hot loops are recorded into SSA IR by a tracing JIT and
// lowered to x86-64 machine code.
//
// A typical embedding:
//
//   let mut vm = argon::Vm::new();
//   let pkg = vm.new_pkg_named("demo");
//   vm.run_string(pkg, "let a = 1 + 2")?;

pub mod bytecode;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod repl;
pub mod value;
pub mod vm;

pub use error::{Error, ErrorKind};
pub use value::Value;
pub use vm::Vm;
