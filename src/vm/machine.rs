// The bytecode executor.
//
// One tight dispatch loop, running in two modes: the baseline interpreter,
// and a recording mode where every fetched instruction is first fed to the
// JIT trace recorder and then executed as normal. The mode switch happens
// at LOOP instructions, which count iterations per loop and hand dispatch
// to the recorder once a loop crosses the hot threshold.
//
// Comparison handlers implement the inverted-condition convention the
// parser relies on: a comparison SKIPS the following JMP when its condition
// is false, so the jump is taken on truth and the false path falls through
// it.

use super::jit::{self, Action, Trace, JIT_THRESHOLD};
use super::{CompiledTrace, Vm, MAX_LOCALS_IN_FN};
use crate::bytecode::{Opcode, JMP_BIAS};
use crate::error::Error;
use crate::value::{Value, TAG_PRIM, VAL_NIL};

/// Size of the loop iteration counter table. Power of two; collisions just
/// mean a loop heats up a little early.
const HOT_COUNTER_SLOTS: usize = 1024;

/// Maximum call depth.
const MAX_FRAMES: usize = 256;

/// A suspended caller, restored when the callee returns.
struct Frame {
    fn_idx: usize,
    ip: usize,
    base: usize,
}

fn as_num(value: Value) -> Result<f64, Error> {
    if value.is_num() {
        Ok(value.as_num())
    } else {
        Err(Error::runtime(
            "attempt to perform arithmetic on a non-number value",
        ))
    }
}

/// Executes bytecode starting at an instruction index within a function.
/// Returns any runtime error that occurs.
pub fn run(vm: &mut Vm, fn_idx: usize, start: usize) -> Result<(), Error> {
    if start >= vm.fns[fn_idx].ins.len() {
        return Ok(());
    }

    let mut fnid = fn_idx;
    let mut ip = start;
    let mut base = 0usize;
    let mut frames: Vec<Frame> = Vec::new();

    // Per-loop iteration counts, keyed by a hash of the loop's location.
    let mut counters = [0u8; HOT_COUNTER_SLOTS];

    // The in-progress JIT trace, if dispatch is in recording mode.
    let mut trace: Option<Trace> = None;

    // Left operand of a binary instruction, resolved per shape.
    macro_rules! arith {
        ($ins:expr, $op:tt, ll) => {{
            let l = as_num(vm.stack[base + $ins.arg2() as usize])?;
            let r = as_num(vm.stack[base + $ins.arg3() as usize])?;
            vm.stack[base + $ins.arg1() as usize] = Value::num(l $op r);
        }};
        ($ins:expr, $op:tt, ln) => {{
            let l = as_num(vm.stack[base + $ins.arg2() as usize])?;
            let r = vm.consts[$ins.arg3() as usize].as_num();
            vm.stack[base + $ins.arg1() as usize] = Value::num(l $op r);
        }};
        ($ins:expr, $op:tt, nl) => {{
            let l = vm.consts[$ins.arg2() as usize].as_num();
            let r = as_num(vm.stack[base + $ins.arg3() as usize])?;
            vm.stack[base + $ins.arg1() as usize] = Value::num(l $op r);
        }};
    }

    // Ordered comparison: skip the following JMP when the condition is
    // false.
    macro_rules! cmp_ord {
        ($ins:expr, $op:tt, ll) => {{
            let l = as_num(vm.stack[base + $ins.arg1() as usize])?;
            let r = as_num(vm.stack[base + $ins.arg2() as usize])?;
            if !(l $op r) {
                ip += 1;
            }
        }};
        ($ins:expr, $op:tt, ln) => {{
            let l = as_num(vm.stack[base + $ins.arg1() as usize])?;
            let r = vm.consts[$ins.arg2() as usize].as_num();
            if !(l $op r) {
                ip += 1;
            }
        }};
    }

    loop {
        let ins = vm.fns[fnid].ins[ip];

        // In recording mode, mirror the instruction into the trace before
        // executing it.
        if let Some(t) = trace.as_mut() {
            match t.record(ins, ip, &vm.stack[base..], &vm.consts) {
                Action::Continue => {}
                // Aborts are silent: the interpreter just keeps going.
                Action::Abort => trace = None,
                Action::Finish => {
                    if let Some(mut done) = trace.take() {
                        if let Some(chunk) = jit::compile(&mut done) {
                            vm.traces.push(CompiledTrace {
                                fn_idx: done.fn_idx(),
                                anchor: done.anchor(),
                                chunk,
                            });
                        }
                    }
                }
            }
        }

        ip += 1;
        match ins.op() {
            // **** Stores ****
            Opcode::Mov => {
                vm.stack[base + ins.arg1() as usize] = vm.stack[base + ins.arg16() as usize];
            }
            Opcode::SetN => {
                vm.stack[base + ins.arg1() as usize] = vm.consts[ins.arg16() as usize];
            }
            Opcode::SetP => {
                vm.stack[base + ins.arg1() as usize] =
                    Value::from_bits(TAG_PRIM | ins.arg16() as u64);
            }
            Opcode::SetF => {
                vm.stack[base + ins.arg1() as usize] = Value::fn_ref(ins.arg16());
            }

            // **** Arithmetic ****
            Opcode::AddLL => arith!(ins, +, ll),
            Opcode::AddLN => arith!(ins, +, ln),
            Opcode::SubLL => arith!(ins, -, ll),
            Opcode::SubLN => arith!(ins, -, ln),
            Opcode::SubNL => arith!(ins, -, nl),
            Opcode::MulLL => arith!(ins, *, ll),
            Opcode::MulLN => arith!(ins, *, ln),
            Opcode::DivLL => arith!(ins, /, ll),
            Opcode::DivLN => arith!(ins, /, ln),
            Opcode::DivNL => arith!(ins, /, nl),
            Opcode::ModLL => arith!(ins, %, ll),
            Opcode::ModLN => arith!(ins, %, ln),
            Opcode::ModNL => arith!(ins, %, nl),
            Opcode::Neg => {
                let v = as_num(vm.stack[base + ins.arg16() as usize])?;
                vm.stack[base + ins.arg1() as usize] = Value::num(-v);
            }

            // **** Relational operators ****
            Opcode::EqLL => {
                let l = vm.stack[base + ins.arg1() as usize];
                let r = vm.stack[base + ins.arg2() as usize];
                if !l.equals(r) {
                    ip += 1;
                }
            }
            Opcode::EqLN => {
                let l = vm.stack[base + ins.arg1() as usize];
                let r = vm.consts[ins.arg2() as usize];
                if !l.equals(r) {
                    ip += 1;
                }
            }
            Opcode::EqLP => {
                let l = vm.stack[base + ins.arg1() as usize];
                if l.bits() != (TAG_PRIM | ins.arg2() as u64) {
                    ip += 1;
                }
            }
            Opcode::NeqLL => {
                let l = vm.stack[base + ins.arg1() as usize];
                let r = vm.stack[base + ins.arg2() as usize];
                if l.equals(r) {
                    ip += 1;
                }
            }
            Opcode::NeqLN => {
                let l = vm.stack[base + ins.arg1() as usize];
                let r = vm.consts[ins.arg2() as usize];
                if l.equals(r) {
                    ip += 1;
                }
            }
            Opcode::NeqLP => {
                let l = vm.stack[base + ins.arg1() as usize];
                if l.bits() == (TAG_PRIM | ins.arg2() as u64) {
                    ip += 1;
                }
            }
            Opcode::LtLL => cmp_ord!(ins, <, ll),
            Opcode::LtLN => cmp_ord!(ins, <, ln),
            Opcode::LeLL => cmp_ord!(ins, <=, ll),
            Opcode::LeLN => cmp_ord!(ins, <=, ln),
            Opcode::GtLL => cmp_ord!(ins, >, ll),
            Opcode::GtLN => cmp_ord!(ins, >, ln),
            Opcode::GeLL => cmp_ord!(ins, >=, ll),
            Opcode::GeLN => cmp_ord!(ins, >=, ln),

            // **** Control flow ****
            Opcode::Jmp => {
                ip = (ip as i64 + ins.arg24() as i64 - JMP_BIAS as i64) as usize;
            }
            Opcode::Loop => {
                let target = (ip as i64 + ins.arg24() as i64 - JMP_BIAS as i64) as usize;
                if trace.is_none() {
                    // Count this loop's iterations. The key mixes the
                    // function index in so loops at the same offset in
                    // different functions mostly get their own counter;
                    // collisions are harmless.
                    let key = ((ip - 1) ^ (fnid << 5)) & (HOT_COUNTER_SLOTS - 1);
                    counters[key] += 1;
                    if counters[key] >= JIT_THRESHOLD {
                        counters[key] = 0;
                        let already = vm
                            .traces
                            .iter()
                            .any(|t| t.fn_idx == fnid && t.anchor == target);
                        if !already {
                            trace = Some(Trace::new(fnid, target, vm.consts.len()));
                        }
                    }
                }
                ip = target;
            }
            Opcode::Call => {
                let fn_slot = ins.arg1() as usize;
                let first_arg = ins.arg2() as usize;
                let args_count = ins.arg3();

                let callee_val = vm.stack[base + fn_slot];
                if !callee_val.is_fn() {
                    return Err(Error::runtime("attempt to call a non-function value"));
                }
                let callee = callee_val.fn_index() as usize;
                let expected = vm.fns[callee].args_count;
                if expected != args_count {
                    return Err(Error::runtime(format!(
                        "wrong number of arguments (expected {}, found {})",
                        expected, args_count
                    )));
                }

                let new_base = base + first_arg;
                if frames.len() >= MAX_FRAMES || new_base + MAX_LOCALS_IN_FN > vm.stack.len() {
                    return Err(Error::runtime("stack overflow"));
                }

                frames.push(Frame {
                    fn_idx: fnid,
                    ip,
                    base,
                });
                fnid = callee;
                base = new_base;
                ip = 0;
            }
            Opcode::Ret => match frames.pop() {
                None => return Ok(()),
                Some(frame) => {
                    // The callee slot just below the frame receives the
                    // call's value; always nil for now.
                    vm.stack[base - 1] = VAL_NIL;
                    fnid = frame.fn_idx;
                    ip = frame.ip;
                    base = frame.base;
                }
            },
        }
    }
}
