// Bytecode disassembler.

use super::{Function, Vm};
use crate::bytecode::{Ins, Opcode, JMP_BIAS};
use std::fmt::Write as _;

/// Renders one instruction; jumps show their decoded offset and resolved
/// target index.
fn write_ins(out: &mut String, idx: usize, ins: Ins) {
    match ins.op() {
        Opcode::Jmp | Opcode::Loop => {
            let offset = ins.arg24() as i64 - JMP_BIAS as i64 + 1;
            let target = idx as i64 + offset;
            let _ = writeln!(out, "  {:04}  {}  {:+}  => {:04}", idx, ins.op(), offset, target);
        }
        Opcode::Mov | Opcode::SetN | Opcode::SetP | Opcode::SetF | Opcode::Neg => {
            let _ = writeln!(out, "  {:04}  {}  {}  {}", idx, ins.op(), ins.arg1(), ins.arg16());
        }
        _ => {
            let _ = writeln!(
                out,
                "  {:04}  {}  {}  {}  {}",
                idx,
                ins.op(),
                ins.arg1(),
                ins.arg2(),
                ins.arg3()
            );
        }
    }
}

/// Dumps the bytecode of a single function.
pub fn disassemble_fn(f: &Function, idx: usize) -> String {
    let mut out = format!("---- fn {} (args: {}) ----\n", idx, f.args_count);
    for (i, &ins) in f.ins.iter().enumerate() {
        write_ins(&mut out, i, ins);
    }
    out
}

/// Dumps the bytecode of every function on the VM.
pub fn disassemble(vm: &Vm) -> String {
    let mut out = String::new();
    for (idx, f) in vm.fns.iter().enumerate() {
        out.push_str(&disassemble_fn(f, idx));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_resolves_jump_targets() {
        let mut vm = Vm::new();
        let pkg = vm.new_pkg_named("test");
        vm.parse(pkg, None, "let a = 0 while a < 10 { a += 1 }").unwrap();

        let listing = disassemble(&vm);
        assert!(listing.contains("SET_N  0  0"));
        assert!(listing.contains("GE_LN"));
        // The loop's back edge resolves to the comparison at index 1.
        assert!(listing.contains("LOOP  -3  => 0001"));
        assert!(listing.contains("JMP  +3  => 0005"));
        assert!(listing.contains("RET"));
    }
}
