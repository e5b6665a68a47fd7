// The tracing JIT.
//
// When the interpreter notices a hot loop it starts recording: every
// executed bytecode instruction is fed through the matching `rec_*` hook
// here, which both mirrors the instruction into SSA IR and keeps the trace
// state up to date. Recording ends when the loop's back edge is crossed
// again (the trace is closed, register-allocated and assembled) or when
// something untraceable shows up (the trace is aborted and thrown away;
// the interpreter just carries on).
//
// Trace state is built around two index tables:
//
// * `last_modified[slot]` - the IR instruction whose result currently lives
//   in that stack slot. This is what makes the IR SSA: reading a slot reuses
//   the defining instruction instead of re-loading.
// * `const_loads[idx]` - the IR load for a VM constant, if one was emitted,
//   so each constant is loaded once per trace.

pub mod assembler;
pub mod ir;
pub mod x64;

use crate::bytecode::{Ins, Opcode, JMP_BIAS};
use crate::value::Value;
use assembler::McodeChunk;
use ir::{IrIns, IrOp, IrRef, IR_NONE};
use std::fmt::Write as _;

/// Number of iterations a loop has to run before we trigger the JIT.
pub const JIT_THRESHOLD: u8 = 50;

/// The maximum number of IR instructions in a trace.
pub const MAX_IR_INS: usize = 2048;

/// What the interpreter should do after recording one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep recording.
    Continue,
    /// The trace closed; compile it and switch dispatch back.
    Finish,
    /// The trace can't continue; discard it and switch dispatch back.
    Abort,
}

/// Which shape of operands a recorded arithmetic/comparison instruction
/// carries.
#[derive(Clone, Copy)]
enum Shape {
    LL,
    LN,
    NL,
}

/// State for one in-progress JIT trace.
pub struct Trace {
    fn_idx: usize,

    /// Bytecode index of the loop header the trace starts at. A LOOP
    /// jumping back here closes the trace.
    anchor: usize,

    /// The recorded IR. Index 0 is a filler so references start at 1.
    pub(crate) ir: Vec<IrIns>,

    /// Most recent IR instruction producing the value in each stack slot.
    last_modified: [IrRef; 256],

    /// The LOAD_STACK that read each slot's loop-entry value, for pairing
    /// with the final value in a PHI when the trace closes.
    initial_load: [IrRef; 256],

    /// IR reference of the load for each VM constant, or none.
    const_loads: Vec<IrRef>,
}

impl Trace {
    /// Creates a new trace anchored at a loop header.
    pub fn new(fn_idx: usize, anchor: usize, consts_count: usize) -> Trace {
        Trace {
            fn_idx,
            anchor,
            ir: vec![IrIns::NONE],
            last_modified: [IR_NONE; 256],
            initial_load: [IR_NONE; 256],
            const_loads: vec![IR_NONE; consts_count],
        }
    }

    pub fn fn_idx(&self) -> usize {
        self.fn_idx
    }

    pub fn anchor(&self) -> usize {
        self.anchor
    }

    pub fn ir(&self) -> &[IrIns] {
        &self.ir
    }

    /// Records one bytecode instruction about to be executed. `stack` is the
    /// current frame's slice of the runtime stack and `ip` the instruction's
    /// own index.
    pub fn record(&mut self, ins: Ins, ip: usize, stack: &[Value], consts: &[Value]) -> Action {
        match self.record_ins(ins, ip, stack, consts) {
            Some(action) => action,
            // IR buffer exhaustion or an untraceable operand.
            None => Action::Abort,
        }
    }

    fn record_ins(
        &mut self,
        ins: Ins,
        ip: usize,
        stack: &[Value],
        consts: &[Value],
    ) -> Option<Action> {
        match ins.op() {
            // Stores. A MOV is a pure alias update; no IR is emitted.
            Opcode::Mov => {
                let src = self.load_stack(ins.arg16() as u8)?;
                self.last_modified[ins.arg1() as usize] = src;
            }
            Opcode::SetN => {
                let load = self.load_const(ins.arg16())?;
                self.last_modified[ins.arg1() as usize] = load;
            }
            Opcode::SetP | Opcode::SetF => return Some(Action::Abort),

            // Arithmetic
            Opcode::AddLL => self.rec_arith(IrOp::Add, ins, Shape::LL)?,
            Opcode::AddLN => self.rec_arith(IrOp::Add, ins, Shape::LN)?,
            Opcode::SubLL => self.rec_arith(IrOp::Sub, ins, Shape::LL)?,
            Opcode::SubLN => self.rec_arith(IrOp::Sub, ins, Shape::LN)?,
            Opcode::SubNL => self.rec_arith(IrOp::Sub, ins, Shape::NL)?,
            Opcode::MulLL => self.rec_arith(IrOp::Mul, ins, Shape::LL)?,
            Opcode::MulLN => self.rec_arith(IrOp::Mul, ins, Shape::LN)?,
            Opcode::DivLL => self.rec_arith(IrOp::Div, ins, Shape::LL)?,
            Opcode::DivLN => self.rec_arith(IrOp::Div, ins, Shape::LN)?,
            Opcode::DivNL => self.rec_arith(IrOp::Div, ins, Shape::NL)?,
            // No SSE lowering for these yet.
            Opcode::ModLL | Opcode::ModLN | Opcode::ModNL | Opcode::Neg => {
                return Some(Action::Abort)
            }

            // Comparisons become guards asserting the outcome that was
            // taken while recording.
            Opcode::EqLL => self.rec_cmp(IrOp::GuardEq, ins, Shape::LL, stack, consts)?,
            Opcode::EqLN => self.rec_cmp(IrOp::GuardEq, ins, Shape::LN, stack, consts)?,
            Opcode::NeqLL => self.rec_cmp(IrOp::GuardNe, ins, Shape::LL, stack, consts)?,
            Opcode::NeqLN => self.rec_cmp(IrOp::GuardNe, ins, Shape::LN, stack, consts)?,
            Opcode::LtLL => self.rec_cmp(IrOp::GuardLt, ins, Shape::LL, stack, consts)?,
            Opcode::LtLN => self.rec_cmp(IrOp::GuardLt, ins, Shape::LN, stack, consts)?,
            Opcode::LeLL => self.rec_cmp(IrOp::GuardLe, ins, Shape::LL, stack, consts)?,
            Opcode::LeLN => self.rec_cmp(IrOp::GuardLe, ins, Shape::LN, stack, consts)?,
            Opcode::GtLL => self.rec_cmp(IrOp::GuardGt, ins, Shape::LL, stack, consts)?,
            Opcode::GtLN => self.rec_cmp(IrOp::GuardGt, ins, Shape::LN, stack, consts)?,
            Opcode::GeLL => self.rec_cmp(IrOp::GuardGe, ins, Shape::LL, stack, consts)?,
            Opcode::GeLN => self.rec_cmp(IrOp::GuardGe, ins, Shape::LN, stack, consts)?,
            // Primitive comparisons aren't number-typed; untraceable.
            Opcode::EqLP | Opcode::NeqLP => return Some(Action::Abort),

            // We don't bother compiling JMPs: the recorder just follows
            // them, and guards take over for the conditional ones.
            Opcode::Jmp => {}

            Opcode::Loop => {
                let target = (ip as i64 + 1 + ins.arg24() as i64 - JMP_BIAS as i64) as usize;
                if target == self.anchor {
                    self.close()?;
                    return Some(Action::Finish);
                }
                // A different (nested) loop; give up.
                return Some(Action::Abort);
            }

            // Calls would make the trace non-linear.
            Opcode::Call | Opcode::Ret => return Some(Action::Abort),
        }
        Some(Action::Continue)
    }

    /// Appends an IR instruction, returning a reference to it. Fails when
    /// the buffer limit is hit.
    fn emit(&mut self, ins: IrIns) -> Option<IrRef> {
        if self.ir.len() >= MAX_IR_INS {
            return None;
        }
        self.ir.push(ins);
        Some((self.ir.len() - 1) as IrRef)
    }

    /// Returns the IR value currently in a stack slot, emitting a
    /// LOAD_STACK the first time the slot is touched on this trace.
    fn load_stack(&mut self, slot: u8) -> Option<IrRef> {
        if self.last_modified[slot as usize] == IR_NONE {
            let load = self.emit(IrIns::new1(IrOp::LoadStack, slot as u32))?;
            self.last_modified[slot as usize] = load;
            self.initial_load[slot as usize] = load;
        }
        Some(self.last_modified[slot as usize])
    }

    /// Returns the cached load for a constant, emitting a LOAD_CONST the
    /// first time the constant is used on this trace.
    fn load_const(&mut self, idx: u16) -> Option<IrRef> {
        if self.const_loads[idx as usize] == IR_NONE {
            let load = self.emit(IrIns::new1(IrOp::LoadConst, idx as u32))?;
            self.const_loads[idx as usize] = load;
        }
        Some(self.const_loads[idx as usize])
    }

    fn rec_arith(&mut self, op: IrOp, ins: Ins, shape: Shape) -> Option<()> {
        let (left, right) = match shape {
            Shape::LL => (self.load_stack(ins.arg2())?, self.load_stack(ins.arg3())?),
            Shape::LN => (
                self.load_stack(ins.arg2())?,
                self.load_const(ins.arg3() as u16)?,
            ),
            Shape::NL => (
                self.load_const(ins.arg2() as u16)?,
                self.load_stack(ins.arg3())?,
            ),
        };
        let result = self.emit(IrIns::new2(op, left, right))?;
        self.last_modified[ins.arg1() as usize] = result;
        Some(())
    }

    fn rec_cmp(
        &mut self,
        op: IrOp,
        ins: Ins,
        shape: Shape,
        stack: &[Value],
        consts: &[Value],
    ) -> Option<()> {
        let left_val = stack[ins.arg1() as usize];
        let right_val = match shape {
            Shape::LL => stack[ins.arg2() as usize],
            _ => consts[ins.arg2() as usize],
        };
        // Guards compare doubles in machine code.
        if !left_val.is_num() || !right_val.is_num() {
            return None;
        }
        let (l, r) = (left_val.as_num(), right_val.as_num());
        let holds = match op {
            IrOp::GuardEq => l == r,
            IrOp::GuardNe => l != r,
            IrOp::GuardLt => l < r,
            IrOp::GuardLe => l <= r,
            IrOp::GuardGt => l > r,
            IrOp::GuardGe => l >= r,
            _ => unreachable!("rec_cmp is only called with guard opcodes"),
        };
        // The trace follows the branch that was taken; the guard has to
        // assert that exact outcome, so a failed comparison records its
        // negation.
        let guard = if holds { op } else { negate_guard(op) };

        let left = self.load_stack(ins.arg1())?;
        let right = match shape {
            Shape::LL => self.load_stack(ins.arg2())?,
            _ => self.load_const(ins.arg2() as u16)?,
        };
        self.emit(IrIns::new2(guard, left, right))?;
        Some(())
    }

    /// Closes the trace at its back edge: every stack slot whose value
    /// changed during the loop body gets a PHI pairing the loop-entry load
    /// with the final value.
    fn close(&mut self) -> Option<()> {
        for slot in 0..self.last_modified.len() {
            let initial = self.initial_load[slot];
            let last = self.last_modified[slot];
            if initial != IR_NONE && last != initial {
                self.emit(IrIns::new2(IrOp::Phi, initial, last))?;
            }
        }
        Some(())
    }

    /// Pretty prints the recorded IR.
    pub fn dump(&self) -> String {
        let mut out = String::from("---- trace ----\n");
        for (i, ins) in self.ir.iter().enumerate().skip(1) {
            if ins.is_load() {
                let _ = writeln!(out, "  {:04}  {}  {}", i, ins.op(), ins.arg32());
            } else {
                let _ = writeln!(
                    out,
                    "  {:04}  {}  {}  {}",
                    i,
                    ins.op(),
                    ins.arg1(),
                    ins.arg2()
                );
            }
        }
        out
    }
}

fn negate_guard(op: IrOp) -> IrOp {
    match op {
        IrOp::GuardEq => IrOp::GuardNe,
        IrOp::GuardNe => IrOp::GuardEq,
        IrOp::GuardLt => IrOp::GuardGe,
        IrOp::GuardLe => IrOp::GuardGt,
        IrOp::GuardGt => IrOp::GuardLe,
        IrOp::GuardGe => IrOp::GuardLt,
        _ => unreachable!("not a guard opcode"),
    }
}

/// Compiles a closed trace: register allocation followed by machine code
/// emission. `None` means the trace couldn't be compiled (e.g. it would
/// need register spilling); the caller discards it silently.
pub fn compile(trace: &mut Trace) -> Option<McodeChunk> {
    x64::allocate_registers(&mut trace.ir)?;
    Some(x64::assemble(&trace.ir))
}
