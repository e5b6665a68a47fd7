// Register allocation and x86-64 machine code emission for traces.
//
// Doubles live in XMM registers; SSE2 or later is assumed, giving 16
// registers. Allocation is a linear scan over the IR: a reverse walk finds
// each instruction's last use, then a forward walk hands every result the
// lowest-numbered free register.
//
// The emitted chunk is a loop. The ABI hands the frame's stack base in RDI
// and the constants base in RSI (the first two SysV argument registers).
// All loads are hoisted into a prologue: a load reads loop-entry state, and
// the values it feeds circulate in registers, so the loop body must restart
// after the loads. PHI moves shuffle the loop-carried values back into
// their entry registers at the back edge. Guards exit to a common stub.

use super::assembler::McodeChunk;
use super::ir::{IrIns, IrOp, IrRef, IR_NONE, PREFIX_GUARD, PREFIX_PHI};

/// XMM registers available for allocation.
pub const NUM_REGS: usize = 16;

// GPR numbers of the bases handed in by the chunk ABI.
const RDI: u8 = 7;
const RSI: u8 = 6;

/// Computes the live range of each IR instruction's result: the index of
/// the last instruction that uses it.
fn live_ranges(ir: &[IrIns]) -> Vec<IrRef> {
    let mut ranges = vec![IR_NONE; ir.len()];
    let end = (ir.len() - 1) as IrRef;

    // Walk in reverse; the first use seen is the last use (a property of
    // SSA form, since nothing is ever redefined).
    for i in (1..ir.len()).rev() {
        let ins = ir[i];
        if ins.is_load() {
            // Loaded values are re-read on every iteration of the compiled
            // loop, so they stay live to the end of the trace.
            ranges[i] = end;
        } else {
            for arg in [ins.arg1(), ins.arg2()] {
                if ranges[arg as usize] == IR_NONE {
                    ranges[arg as usize] = i as IrRef;
                }
            }
        }
    }
    ranges
}

/// Allocates a register to the result of every value-producing IR
/// instruction, writing it into the instruction's register field. Returns
/// `None` when the trace needs more than `NUM_REGS` values live at once
/// (spilling isn't implemented; the caller discards the trace).
pub fn allocate_registers(ir: &mut [IrIns]) -> Option<()> {
    let ranges = live_ranges(ir);

    // When each register is next free again.
    let mut reg_end = [IR_NONE; NUM_REGS];

    for idx in 1..ir.len() {
        // Free every register whose live range ends here.
        for end in reg_end.iter_mut() {
            if *end == idx as IrRef {
                *end = IR_NONE;
            }
        }

        // Guards and PHIs produce no value: they only read their operands'
        // registers, and nothing ever reads theirs. They get no register.
        if matches!(ir[idx].prefix(), PREFIX_GUARD | PREFIX_PHI) {
            continue;
        }

        // A non-commutative operation computes into its destination after
        // copying the left operand there, so the destination must not alias
        // the right operand.
        let avoid = match ir[idx].op() {
            IrOp::Sub | IrOp::Div => Some(ir[ir[idx].arg2() as usize].reg()),
            _ => None,
        };

        let mut chosen = None;
        for reg in 0..NUM_REGS {
            if reg_end[reg] == IR_NONE && Some(reg as u16) != avoid {
                chosen = Some(reg);
                break;
            }
        }
        let reg = chosen?;

        ir[idx].set_reg(reg as u16);
        // A result nothing consumes dies right here: leaving the end at
        // IR_NONE hands the register straight back on the next iteration.
        reg_end[reg] = ranges[idx];
    }
    Some(())
}

// ---- Instruction encoding ---------------------------------------------------

fn modrm(mode: u8, reg: u16, rm: u16) -> u8 {
    mode << 6 | ((reg & 7) as u8) << 3 | (rm & 7) as u8
}

/// Emits a REX prefix if either register needs the extension bit.
fn rex(chunk: &mut McodeChunk, reg: u16, rm: u16) {
    if reg >= 8 || rm >= 8 {
        chunk.append_u8(0x40 | ((reg >= 8) as u8) << 2 | (rm >= 8) as u8);
    }
}

/// movsd xmm<dst>, [<base> + disp]
fn movsd_load(chunk: &mut McodeChunk, dst: u16, base: u8, disp: u32) {
    chunk.append_u8(0xf2);
    rex(chunk, dst, 0);
    chunk.append_u8(0x0f);
    chunk.append_u8(0x10);
    if disp == 0 {
        chunk.append_u8(modrm(0b00, dst, base.into()));
    } else if disp < 0x80 {
        chunk.append_u8(modrm(0b01, dst, base.into()));
        chunk.append_u8(disp as u8);
    } else {
        chunk.append_u8(modrm(0b10, dst, base.into()));
        chunk.append_u32(disp);
    }
}

/// movsd xmm<dst>, xmm<src>
fn movsd_reg(chunk: &mut McodeChunk, dst: u16, src: u16) {
    chunk.append_u8(0xf2);
    rex(chunk, dst, src);
    chunk.append_u8(0x0f);
    chunk.append_u8(0x10);
    chunk.append_u8(modrm(0b11, dst, src));
}

/// addsd/subsd/mulsd/divsd xmm<dst>, xmm<src>
fn sse_arith(chunk: &mut McodeChunk, op: u8, dst: u16, src: u16) {
    chunk.append_u8(0xf2);
    rex(chunk, dst, src);
    chunk.append_u8(0x0f);
    chunk.append_u8(op);
    chunk.append_u8(modrm(0b11, dst, src));
}

/// ucomisd xmm<left>, xmm<right>
fn ucomisd(chunk: &mut McodeChunk, left: u16, right: u16) {
    chunk.append_u8(0x66);
    rex(chunk, left, right);
    chunk.append_u8(0x0f);
    chunk.append_u8(0x2e);
    chunk.append_u8(modrm(0b11, left, right));
}

/// The Jcc condition byte that EXITS the trace when the guarded comparison
/// no longer holds. ucomisd sets the flags like an unsigned compare.
fn exit_cc(op: IrOp) -> u8 {
    match op {
        IrOp::GuardEq => 0x85, // jne
        IrOp::GuardNe => 0x84, // je
        IrOp::GuardLt => 0x83, // jae
        IrOp::GuardLe => 0x87, // ja
        IrOp::GuardGt => 0x86, // jbe
        IrOp::GuardGe => 0x82, // jb
        _ => unreachable!("not a guard opcode"),
    }
}

/// Assembles a register-allocated trace into machine code.
pub fn assemble(ir: &[IrIns]) -> McodeChunk {
    let mut chunk = McodeChunk::new();

    // Prologue: all loads, hoisted. LOAD_STACK reads the frame slot off
    // RDI, LOAD_CONST the constant off RSI.
    for ins in &ir[1..] {
        match ins.op() {
            IrOp::LoadStack => movsd_load(&mut chunk, ins.reg(), RDI, ins.arg32() * 8),
            IrOp::LoadConst => movsd_load(&mut chunk, ins.reg(), RSI, ins.arg32() * 8),
            _ => {}
        }
    }

    let loop_start = chunk.len();
    let mut guard_fixups: Vec<usize> = Vec::new();

    for ins in &ir[1..] {
        match ins.op() {
            IrOp::LoadStack | IrOp::LoadConst => {}

            IrOp::Add | IrOp::Sub | IrOp::Mul | IrOp::Div => {
                let dst = ins.reg();
                let left = ir[ins.arg1() as usize].reg();
                let right = ir[ins.arg2() as usize].reg();
                if dst != left {
                    movsd_reg(&mut chunk, dst, left);
                }
                let op = match ins.op() {
                    IrOp::Add => 0x58,
                    IrOp::Sub => 0x5c,
                    IrOp::Mul => 0x59,
                    IrOp::Div => 0x5e,
                    _ => unreachable!(),
                };
                sse_arith(&mut chunk, op, dst, right);
            }

            IrOp::GuardEq
            | IrOp::GuardNe
            | IrOp::GuardLt
            | IrOp::GuardLe
            | IrOp::GuardGt
            | IrOp::GuardGe => {
                let left = ir[ins.arg1() as usize].reg();
                let right = ir[ins.arg2() as usize].reg();
                ucomisd(&mut chunk, left, right);
                chunk.append_u8(0x0f);
                chunk.append_u8(exit_cc(ins.op()));
                guard_fixups.push(chunk.len());
                chunk.append_u32(0);
            }

            // The PHIs sit at the end of the IR: move each loop-carried
            // value back into its entry register for the next iteration.
            IrOp::Phi => {
                let dst = ir[ins.arg1() as usize].reg();
                let src = ir[ins.arg2() as usize].reg();
                if dst != src {
                    movsd_reg(&mut chunk, dst, src);
                }
            }
        }
    }

    // Back edge: jmp rel32 to the first instruction after the loads.
    chunk.append_u8(0xe9);
    let at = chunk.len();
    chunk.append_u32(0);
    chunk.patch_u32(at, (loop_start as i64 - (at as i64 + 4)) as i32 as u32);

    // Common side exit. Restoring interpreter state is the caller's
    // problem; the stub just returns.
    let exit = chunk.len();
    for fix in guard_fixups {
        chunk.patch_u32(fix, (exit as i64 - (fix as i64 + 4)) as i32 as u32);
    }
    chunk.append_u8(0xc3);

    chunk
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(op: IrOp, arg: u32) -> IrIns {
        IrIns::new1(op, arg)
    }

    fn ins2(op: IrOp, a: IrRef, b: IrRef) -> IrIns {
        IrIns::new2(op, a, b)
    }

    // A small trace of `a = a + 1` closed with a PHI.
    fn sample_trace() -> Vec<IrIns> {
        vec![
            IrIns::NONE,
            load(IrOp::LoadStack, 0),
            load(IrOp::LoadConst, 1),
            ins2(IrOp::Add, 1, 2),
            ins2(IrOp::Phi, 1, 3),
        ]
    }

    #[test]
    fn live_ranges_pin_loads_to_the_end() {
        let ir = sample_trace();
        let ranges = live_ranges(&ir);
        assert_eq!(ranges[1], 4);
        assert_eq!(ranges[2], 4);
        // The add's result is last used by the PHI.
        assert_eq!(ranges[3], 4);
    }

    #[test]
    fn allocation_uses_lowest_free_register() {
        let mut ir = sample_trace();
        allocate_registers(&mut ir).unwrap();
        assert_eq!(ir[1].reg(), 0);
        assert_eq!(ir[2].reg(), 1);
        assert_eq!(ir[3].reg(), 2);
    }

    #[test]
    fn no_overlapping_live_ranges_share_a_register() {
        // A deeper trace with values dying at different points.
        let mut ir = vec![
            IrIns::NONE,
            load(IrOp::LoadStack, 0),
            load(IrOp::LoadStack, 1),
            load(IrOp::LoadConst, 0),
            ins2(IrOp::Add, 1, 2),
            ins2(IrOp::Mul, 4, 3),
            ins2(IrOp::GuardLt, 5, 3),
            ins2(IrOp::Sub, 5, 1),
            ins2(IrOp::Phi, 1, 7),
        ];
        allocate_registers(&mut ir).unwrap();
        let ranges = live_ranges(&ir);

        // Guards and PHIs hold no register, so only value-producing
        // instructions participate.
        let holds_a_register =
            |ins: IrIns| !matches!(ins.prefix(), PREFIX_GUARD | PREFIX_PHI);
        for a in 1..ir.len() {
            for b in (a + 1)..ir.len() {
                if !holds_a_register(ir[a]) || !holds_a_register(ir[b]) {
                    continue;
                }
                if ir[a].reg() != ir[b].reg() {
                    continue;
                }
                // b starts after a; they overlap if a is still live when b
                // is defined.
                assert!(
                    ranges[a] == IR_NONE || (ranges[a] as usize) <= b,
                    "instructions {} and {} share register {} but overlap",
                    a,
                    b,
                    ir[a].reg()
                );
            }
        }
    }

    #[test]
    fn guards_and_phis_need_no_registers() {
        // All 16 registers are pinned by loads; the guards and PHIs a
        // comparison-heavy loop records must still allocate instead of
        // spuriously exhausting the register file.
        let mut ir = vec![IrIns::NONE];
        for slot in 0..16 {
            ir.push(load(IrOp::LoadStack, slot));
        }
        for i in 0..8u16 {
            ir.push(ins2(IrOp::GuardLt, 1 + 2 * i, 2 + 2 * i));
        }
        for i in 0..8u16 {
            ir.push(ins2(IrOp::Phi, 1 + 2 * i, 2 + 2 * i));
        }
        allocate_registers(&mut ir).unwrap();

        for slot in 0..16 {
            assert_eq!(ir[1 + slot].reg(), slot as u16);
        }
        // The guards and PHIs left their register fields untouched.
        for ins in &ir[17..] {
            assert_eq!(ins.reg(), 0);
        }
    }

    #[test]
    fn sub_never_lands_on_its_right_operand() {
        // Both intermediate adds die at the sub, so their registers free up
        // right as the sub's result is assigned. The lowest free register
        // is the right operand's; the sub must skip it (the emitted
        // `movsd dst, left` would clobber the right operand first).
        let mut ir = vec![
            IrIns::NONE,
            load(IrOp::LoadStack, 0),
            load(IrOp::LoadStack, 1),
            ins2(IrOp::Add, 1, 2),
            ins2(IrOp::Add, 1, 2),
            ins2(IrOp::Sub, 4, 3),
            ins2(IrOp::Phi, 1, 5),
        ];
        allocate_registers(&mut ir).unwrap();
        assert_eq!(ir[3].reg(), 2);
        assert_eq!(ir[4].reg(), 3);
        assert_ne!(ir[5].reg(), ir[3].reg());
    }

    #[test]
    fn allocation_fails_instead_of_spilling() {
        // 17 loads all live to the end exhausts the 16 registers.
        let mut ir = vec![IrIns::NONE];
        for slot in 0..17 {
            ir.push(load(IrOp::LoadStack, slot));
        }
        ir.push(ins2(IrOp::Add, 1, 2));
        assert!(allocate_registers(&mut ir).is_none());
    }

    #[test]
    fn emits_the_documented_encodings() {
        let mut ir = sample_trace();
        allocate_registers(&mut ir).unwrap();
        let chunk = assemble(&ir);
        let code = chunk.code();

        // movsd xmm0, [rdi]
        assert_eq!(&code[0..4], &[0xf2, 0x0f, 0x10, 0x07]);
        // movsd xmm1, [rsi + 8]
        assert_eq!(&code[4..9], &[0xf2, 0x0f, 0x10, 0x4e, 0x08]);
        // movsd xmm2, xmm0; addsd xmm2, xmm1
        assert_eq!(&code[9..13], &[0xf2, 0x0f, 0x10, 0xd0]);
        assert_eq!(&code[13..17], &[0xf2, 0x0f, 0x58, 0xd1]);
        // phi: movsd xmm0, xmm2
        assert_eq!(&code[17..21], &[0xf2, 0x0f, 0x10, 0xc2]);
        // jmp rel32 back to the loop start (after the two loads at 9)
        assert_eq!(code[21], 0xe9);
        let rel = i32::from_ne_bytes(code[22..26].try_into().unwrap());
        assert_eq!(26i64 + rel as i64, 9);
        // side exit stub
        assert_eq!(code[26], 0xc3);
    }

    #[test]
    fn guards_jump_to_the_side_exit() {
        let mut ir = vec![
            IrIns::NONE,
            load(IrOp::LoadStack, 0),
            load(IrOp::LoadConst, 0),
            ins2(IrOp::GuardLt, 1, 2),
            ins2(IrOp::Add, 1, 2),
            ins2(IrOp::Phi, 1, 4),
        ];
        allocate_registers(&mut ir).unwrap();
        let chunk = assemble(&ir);
        let code = chunk.code();

        // Prologue is two 4-byte loads ([rdi] and [rsi], both disp 0).
        let loop_start = 8;
        // ucomisd xmm0, xmm1
        assert_eq!(&code[8..12], &[0x66, 0x0f, 0x2e, 0xc1]);
        // jae rel32 to the exit
        assert_eq!(&code[12..14], &[0x0f, 0x83]);
        let rel = i32::from_ne_bytes(code[14..18].try_into().unwrap());
        let exit = 18i64 + rel as i64;
        assert_eq!(code[exit as usize], 0xc3);
        // the back edge lands on the ucomisd
        let jmp_at = code.len() - 1 - 5;
        assert_eq!(code[jmp_at], 0xe9);
        let rel = i32::from_ne_bytes(code[jmp_at + 1..jmp_at + 5].try_into().unwrap());
        assert_eq!(jmp_at as i64 + 5 + rel as i64, loop_start as i64);
    }

    #[test]
    fn high_registers_get_a_rex_prefix() {
        let mut chunk = McodeChunk::new();
        movsd_reg(&mut chunk, 9, 2);
        // REX.R for xmm9
        assert_eq!(chunk.code(), &[0xf2, 0x44, 0x0f, 0x10, 0xca]);

        let mut chunk = McodeChunk::new();
        movsd_reg(&mut chunk, 1, 12);
        // REX.B for xmm12
        assert_eq!(chunk.code(), &[0xf2, 0x41, 0x0f, 0x10, 0xcc]);
    }
}
