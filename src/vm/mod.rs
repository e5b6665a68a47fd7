// The VM owns everything: there's no global state anywhere in the crate.
// Multiple VMs are completely independent.

pub mod disasm;
pub mod jit;
pub mod machine;

use crate::bytecode::Ins;
use crate::error::Error;
use crate::lexer::hash_ident;
use crate::parser;
use crate::value::{Value, VAL_NIL};
use std::path::Path;

/// The number of stack slots available to a single function scope. Slot
/// references must fit into an 8 bit instruction argument.
pub const MAX_LOCALS_IN_FN: usize = 255;

/// The maximum number of constants on a VM; constant indices must fit into a
/// 16 bit instruction argument.
pub const MAX_CONSTS: usize = u16::MAX as usize;

/// Size of the runtime value stack, in slots.
pub const STACK_SIZE: usize = 1024;

/// The package name used for anonymous packages (e.g. the REPL's), which
/// can't be imported.
pub const ANON_PKG_NAME: u64 = !0;

/// A package is a named collection of function definitions.
///
/// Names extracted from source code are stored as FNV-1a hashes rather than
/// strings; see the note on the lexer.
#[derive(Debug)]
pub struct Package {
    pub name: u64,

    /// Each package has a "main" function holding the bytecode for any top
    /// level code outside of an explicit function definition.
    pub main_fn: usize,
}

/// A function definition stores its parsed bytecode.
#[derive(Debug)]
pub struct Function {
    /// The index of the package this function belongs to.
    pub pkg: usize,

    /// The number of arguments the function takes (varargs aren't a thing
    /// yet).
    pub args_count: u8,

    pub ins: Vec<Ins>,
}

impl Function {
    /// Appends a bytecode instruction, returning its index.
    pub fn emit(&mut self, ins: Ins) -> usize {
        self.ins.push(ins);
        self.ins.len() - 1
    }
}

/// A finished JIT trace: the machine code compiled for one hot loop,
/// remembered by the loop's anchor so the loop is only compiled once.
#[derive(Debug)]
pub struct CompiledTrace {
    pub fn_idx: usize,
    /// Bytecode index of the loop header the trace was recorded from.
    pub anchor: usize,
    pub chunk: jit::assembler::McodeChunk,
}

#[derive(Debug)]
pub struct Vm {
    /// All loaded packages. A package that's already loaded is never loaded
    /// twice.
    pub(crate) pkgs: Vec<Package>,

    /// One global function table rather than a per-package one, so a
    /// bytecode instruction can refer to a function with a single 16 bit
    /// index.
    pub(crate) fns: Vec<Function>,

    /// Global, deduplicated list of number constants.
    pub(crate) consts: Vec<Value>,

    /// The runtime value stack. Persisted across `run_*` calls so the REPL
    /// can keep state alive.
    pub(crate) stack: Vec<Value>,

    /// Machine code produced by the JIT, one entry per compiled hot loop.
    pub(crate) traces: Vec<CompiledTrace>,
}

impl Vm {
    /// Creates a new virtual machine instance.
    pub fn new() -> Vm {
        Vm {
            pkgs: Vec::new(),
            fns: Vec::new(),
            consts: Vec::new(),
            stack: vec![VAL_NIL; STACK_SIZE],
            traces: Vec::new(),
        }
    }

    /// Creates a new package with an already-hashed name, returning its
    /// index. The package's main function is created along with it.
    pub fn new_pkg(&mut self, name: u64) -> usize {
        let pkg_idx = self.pkgs.len();
        let main_fn = self.new_fn(pkg_idx);
        self.pkgs.push(Package { name, main_fn });
        pkg_idx
    }

    /// Creates a new package named after a string.
    pub fn new_pkg_named(&mut self, name: &str) -> usize {
        self.new_pkg(hash_ident(name))
    }

    /// Creates a new function associated with a package, returning its index
    /// in the global function table.
    pub fn new_fn(&mut self, pkg: usize) -> usize {
        self.fns.push(Function {
            pkg,
            args_count: 0,
            ins: Vec::new(),
        });
        self.fns.len() - 1
    }

    /// Adds a constant number to the VM's constants list, returning its
    /// index. Constants are deduplicated by bit pattern.
    pub(crate) fn add_const(&mut self, num: f64) -> Result<u16, Error> {
        let value = Value::num(num);
        if let Some(idx) = self.consts.iter().position(|c| c.bits() == value.bits()) {
            return Ok(idx as u16);
        }
        if self.consts.len() >= MAX_CONSTS {
            return Err(Error::parse("too many constants"));
        }
        self.consts.push(value);
        Ok((self.consts.len() - 1) as u16)
    }

    /// Parses some source code into a package. Top level code is appended to
    /// the package's main function; functions defined in the code are created
    /// on the VM and associated with the package.
    ///
    /// On failure the function and constant tables are NOT rolled back;
    /// definitions that finished parsing before the error stay usable.
    pub fn parse(
        &mut self,
        pkg: usize,
        path: Option<&Path>,
        code: &str,
    ) -> Result<(), Error> {
        parser::parse(self, pkg, path, code)
    }

    /// Parses and executes some code inside the package's main function. The
    /// code can use anything an earlier `run_string` on the same package
    /// defined; this is what the REPL is built on.
    pub fn run_string(&mut self, pkg: usize, code: &str) -> Result<(), Error> {
        let main_fn = self.pkgs[pkg].main_fn;

        // Drop the RET that terminated the previously parsed chunk, so the
        // new code continues the main function where the old code stopped.
        let resume = {
            let f = &mut self.fns[main_fn];
            if f.ins.last().map(|i| i.op()) == Some(crate::bytecode::Opcode::Ret) {
                f.ins.pop();
            }
            f.ins.len()
        };

        self.parse(pkg, None, code)?;
        machine::run(self, main_fn, resume)
    }

    /// Executes a file. A new package named after the file is created for
    /// it, which later code can import.
    pub fn run_file(&mut self, path: &Path) -> Result<(), Error> {
        let name = extract_pkg_name(path).ok_or_else(|| {
            Error::parse(format!(
                "invalid package name from file path `{}`",
                path.display()
            ))
        })?;

        let code = std::fs::read_to_string(path).map_err(|_| {
            Error::parse(format!("failed to open file `{}`", path.display()))
        })?;

        let pkg = self.new_pkg(name);
        self.parse(pkg, Some(path), &code)?;

        let main_fn = self.pkgs[pkg].main_fn;
        machine::run(self, main_fn, 0).map_err(|mut e| {
            e.set_file(path);
            e
        })
    }

    // Read-only views for embedders, the disassembler, and tests.

    pub fn package_main(&self, pkg: usize) -> usize {
        self.pkgs[pkg].main_fn
    }

    pub fn function(&self, idx: usize) -> &Function {
        &self.fns[idx]
    }

    pub fn function_count(&self) -> usize {
        self.fns.len()
    }

    pub fn consts(&self) -> &[Value] {
        &self.consts
    }

    /// Reads a slot off the bottom frame of the runtime stack.
    pub fn stack_slot(&self, slot: usize) -> Value {
        self.stack[slot]
    }

    pub fn trace_count(&self) -> usize {
        self.traces.len()
    }

    pub fn traces(&self) -> &[CompiledTrace] {
        &self.traces
    }
}

impl Default for Vm {
    fn default() -> Vm {
        Vm::new()
    }
}

/// Extracts the name of a package from its file path and returns the name's
/// hash, or `None` if the path has no usable stem.
pub fn extract_pkg_name(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() {
        return None;
    }
    Some(hash_ident(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_deduplicated() {
        let mut vm = Vm::new();
        let a = vm.add_const(3.0).unwrap();
        let b = vm.add_const(4.0).unwrap();
        let c = vm.add_const(3.0).unwrap();
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(c, 0);
        assert_eq!(vm.consts().len(), 2);
    }

    #[test]
    fn zero_signs_are_distinct_constants() {
        let mut vm = Vm::new();
        let pos = vm.add_const(0.0).unwrap();
        let neg = vm.add_const(-0.0).unwrap();
        assert_ne!(pos, neg);
    }

    #[test]
    fn packages_get_a_main_function() {
        let mut vm = Vm::new();
        let a = vm.new_pkg_named("a");
        let b = vm.new_pkg(ANON_PKG_NAME);
        assert_ne!(vm.package_main(a), vm.package_main(b));
        assert_eq!(vm.function(vm.package_main(a)).pkg, a);
        assert_eq!(vm.function(vm.package_main(b)).pkg, b);
    }

    #[test]
    fn pkg_name_from_path() {
        assert!(extract_pkg_name(Path::new("scripts/loops.ar")).is_some());
        assert_eq!(
            extract_pkg_name(Path::new("a/b/demo.ar")),
            Some(hash_ident("demo"))
        );
        assert_eq!(extract_pkg_name(Path::new("/")), None);
    }

    #[test]
    fn vms_are_independent() {
        let mut a = Vm::new();
        let mut b = Vm::new();
        a.new_pkg_named("one");
        assert_eq!(b.pkgs.len(), 0);
        b.add_const(1.0).unwrap();
        assert_eq!(a.consts().len(), 0);
    }
}
