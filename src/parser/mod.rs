// A single-pass parser that emits bytecode directly; no AST is ever built.
//
// A new `Parser` is created for each piece of source code handed to the VM.
// A `FnScope` is pushed for each function definition, stacked for nested
// definitions:
//
//   fn outer() {
//     let a = fn() { /* ... */ }
//   }
//
// The inner-most scope is at the top of the stack, and all bytecode is
// emitted into the function it refers to. An initial scope is created for
// the top level of the package, which compiles into the package's "main"
// function.
//
// Each function body is parsed as a series of statements. Statements that
// contain nested blocks (`if`, `while`, `loop`) parse them recursively.
//
// Named local variables across all active function scopes live in the
// parser's single flat `locals` list. A local's runtime stack slot is its
// position relative to the first local of its function scope:
//
//   fn example() {   // slot 0 in the package's main function
//     let a = 3      // slot 0 in `example`
//     let c = fn() { // slot 1 in `example`
//       let d = 5    // slot 0 in the anonymous function
//     }
//   }
//
// Named locals occupy a scope's low slots; temporaries created while
// compiling expressions live above them and are reclaimed as soon as the
// value is consumed. Leaving a block destroys the locals created inside it.

mod expr;

use crate::bytecode::{Ins, Opcode, JMP_BIAS};
use crate::error::Error;
use crate::lexer::{Lexer, Tk};
use crate::vm::{Vm, MAX_LOCALS_IN_FN};
use expr::{BinOp, JmpList, Node};
use std::path::Path;

/// The name of a local variable created in some function scope.
struct Local {
    name: u64,
}

/// A function definition scope. All bytecode is emitted to the function of
/// the scope at the top of the parser's scope stack.
struct FnScope {
    /// Index of the function in the VM's function table.
    fn_idx: usize,

    /// Index into the parser's flat locals list of the first local defined
    /// in this scope.
    first_local: usize,

    /// The next free runtime stack slot, counting both named locals and
    /// temporaries.
    next_slot: usize,
}

/// Converts a stream of tokens from the lexer into bytecode.
pub struct Parser<'vm, 'src> {
    vm: &'vm mut Vm,

    /// Supplies the stream of tokens we're parsing.
    lex: Lexer<'src>,

    /// The package the parsed functions belong to.
    pkg: usize,

    /// Stack of function definition scopes; the inner-most is last.
    scopes: Vec<FnScope>,

    /// All named locals in all active function scopes.
    locals: Vec<Local>,
}

/// Parses some source code into a package's functions. Top level code is
/// appended to the package's main function.
///
/// On failure parsing stops at the first error; the parser's own state is
/// torn down on unwind, but functions and constants already added to the VM
/// stay where they are.
pub fn parse(vm: &mut Vm, pkg: usize, path: Option<&Path>, code: &str) -> Result<(), Error> {
    let mut psr = Parser {
        vm,
        lex: Lexer::new(code),
        pkg,
        scopes: Vec::new(),
        locals: Vec::new(),
    };
    psr.parse_main().map_err(|mut e| {
        if let Some(p) = path {
            e.set_file(p);
        }
        e
    })
}

impl<'vm, 'src> Parser<'vm, 'src> {
    fn parse_main(&mut self) -> Result<(), Error> {
        self.lex.next()?;
        let main_fn = self.vm.pkgs[self.pkg].main_fn;
        self.scopes.push(FnScope {
            fn_idx: main_fn,
            first_local: 0,
            next_slot: 0,
        });
        self.block_body(None)?;
        self.emit(Ins::new3(Opcode::Ret, 0, 0, 0));
        self.scopes.pop();
        Ok(())
    }

    // ---- Token helpers -----------------------------------------------------

    fn cur(&self) -> Tk {
        self.lex.tk.tk
    }

    fn next(&mut self) -> Result<(), Error> {
        self.lex.next()
    }

    /// Creates a parse error at the current token's line.
    fn err(&self, desc: impl Into<String>) -> Error {
        Error::parse(desc).at_line(self.lex.tk.line)
    }

    /// Errors unless the current token is the expected one, then advances.
    fn expect(&mut self, tk: Tk) -> Result<(), Error> {
        if self.cur() != tk {
            return Err(self.err(format!("expected `{}`, found `{}`", tk, self.cur())));
        }
        self.next()
    }

    /// Consumes an identifier token, returning its name hash and its source
    /// text (for error messages).
    fn expect_ident(&mut self) -> Result<(u64, String), Error> {
        match self.cur() {
            Tk::Ident(name) => {
                let text = self.lex.slice().to_string();
                self.next()?;
                Ok((name, text))
            }
            tk => Err(self.err(format!("expected identifier, found `{}`", tk))),
        }
    }

    // ---- Scope and slot management -----------------------------------------

    fn scope(&self) -> &FnScope {
        self.scopes.last().expect("an active function scope")
    }

    fn scope_mut(&mut self) -> &mut FnScope {
        self.scopes.last_mut().expect("an active function scope")
    }

    /// The number of named locals in the current function scope. Slots at or
    /// above this are temporaries.
    fn nameds(&self) -> usize {
        self.locals.len() - self.scope().first_local
    }

    /// Claims the next free stack slot.
    fn reserve_slot(&mut self) -> Result<u8, Error> {
        if self.scope().next_slot >= MAX_LOCALS_IN_FN {
            return Err(self.err("too many locals in function"));
        }
        let scope = self.scope_mut();
        let slot = scope.next_slot;
        scope.next_slot += 1;
        Ok(slot as u8)
    }

    /// Releases a slot if it's a temporary sitting on top of the stack.
    /// Named locals are never released this way.
    fn free_slot(&mut self, slot: u8) {
        if (slot as usize) >= self.nameds() {
            let scope = self.scope_mut();
            scope.next_slot -= 1;
            debug_assert_eq!(scope.next_slot, slot as usize);
        }
    }

    /// Finds the stack slot of a named local in the current function scope.
    fn resolve_local(&self, name: u64) -> Option<u8> {
        let first = self.scope().first_local;
        self.locals[first..]
            .iter()
            .rposition(|l| l.name == name)
            .map(|pos| pos as u8)
    }

    /// Errors if `name` is already defined in the current function scope.
    fn check_unused(&self, name: u64, text: &str) -> Result<(), Error> {
        if self.resolve_local(name).is_some() {
            return Err(self.err(format!("variable `{}` is already defined", text)));
        }
        Ok(())
    }

    // ---- Bytecode emission -------------------------------------------------

    /// The index the next emitted instruction will have.
    fn pc(&self) -> usize {
        self.vm.fns[self.scope().fn_idx].ins.len()
    }

    fn emit(&mut self, ins: Ins) -> usize {
        let fn_idx = self.scope().fn_idx;
        self.vm.fns[fn_idx].emit(ins)
    }

    fn ins_at(&self, pc: usize) -> Ins {
        self.vm.fns[self.scope().fn_idx].ins[pc]
    }

    fn ins_at_mut(&mut self, pc: usize) -> &mut Ins {
        let fn_idx = self.scope().fn_idx;
        &mut self.vm.fns[fn_idx].ins[pc]
    }

    /// Emits a LOOP instruction jumping back to `start`.
    fn emit_loop(&mut self, start: usize) {
        let pc = self.pc();
        let stored = (JMP_BIAS as i64 + start as i64 - (pc as i64 + 1)) as u32;
        self.emit(Ins::new1(Opcode::Loop, stored));
    }

    // ---- Statements --------------------------------------------------------

    /// Parses statements until the terminator (or end of input) is reached.
    /// The terminator itself isn't consumed.
    fn block_body(&mut self, term: Option<Tk>) -> Result<(), Error> {
        loop {
            while self.cur() == Tk::Semi {
                self.next()?;
            }
            if self.cur() == Tk::Eof || Some(self.cur()) == term {
                return Ok(());
            }
            self.statement()?;
            // Any temporaries a statement leaked are dead now.
            let nameds = self.nameds();
            self.scope_mut().next_slot = nameds;
        }
    }

    /// Parses a braced block. Locals created inside it are destroyed on
    /// exit, releasing their stack slots.
    fn block(&mut self) -> Result<(), Error> {
        self.expect(Tk::LBrace)?;
        let saved_locals = self.locals.len();
        let saved_next_slot = self.scope().next_slot;
        self.block_body(Some(Tk::RBrace))?;
        self.expect(Tk::RBrace)?;
        self.locals.truncate(saved_locals);
        self.scope_mut().next_slot = saved_next_slot;
        Ok(())
    }

    fn statement(&mut self) -> Result<(), Error> {
        match self.cur() {
            Tk::Let => self.let_stmt(),
            Tk::If => self.if_stmt(),
            Tk::While => self.while_stmt(),
            Tk::Loop => self.loop_stmt(),
            Tk::Fn => self.fn_stmt(),
            Tk::Ident(_) => self.ident_stmt(),
            _ => self.expr_stmt(),
        }
    }

    /// `let name = expr`
    fn let_stmt(&mut self) -> Result<(), Error> {
        self.next()?;
        let (name, text) = self.expect_ident()?;
        self.check_unused(name, &text)?;
        self.expect(Tk::Assign)?;
        let node = self.expr_full()?;
        self.to_next_slot(node)?;
        self.locals.push(Local { name });
        Ok(())
    }

    /// A statement starting with an identifier: an assignment, an augmented
    /// assignment, or a plain expression statement. One token of lookahead
    /// (via lexer save/restore) decides which.
    fn ident_stmt(&mut self) -> Result<(), Error> {
        let name = match self.cur() {
            Tk::Ident(name) => name,
            _ => unreachable!("ident_stmt called on a non-identifier"),
        };
        let text = self.lex.slice().to_string();
        let saved = self.lex.save();
        self.next()?;

        let aug = match self.cur() {
            Tk::Assign => None,
            Tk::AddAssign => Some(BinOp::Add),
            Tk::SubAssign => Some(BinOp::Sub),
            Tk::MulAssign => Some(BinOp::Mul),
            Tk::DivAssign => Some(BinOp::Div),
            Tk::ModAssign => Some(BinOp::Mod),
            _ => {
                // Not an assignment after all; back up and reparse the
                // identifier as the start of an expression statement.
                self.lex.restore(saved);
                return self.expr_stmt();
            }
        };
        self.next()?;

        let slot = self
            .resolve_local(name)
            .ok_or_else(|| self.err(format!("undefined variable `{}`", text)))?;

        let node = self.expr_full()?;
        let node = match aug {
            Some(op) => self.emit_arith(op, Node::Local(slot), node)?,
            None => node,
        };
        self.to_slot(node, slot)?;
        if let Node::NonReloc(s) = node {
            self.free_slot(s);
        }
        Ok(())
    }

    /// An expression evaluated for its side effects; the value is discarded.
    fn expr_stmt(&mut self) -> Result<(), Error> {
        let node = self.expr_full()?;
        match node {
            // Give relocatable results a (temporary) destination so their
            // emitted instruction doesn't clobber slot 0.
            Node::Reloc(_) | Node::Jmp { .. } => {
                let slot = self.to_any_slot(node)?;
                self.free_slot(slot);
            }
            Node::NonReloc(slot) => self.free_slot(slot),
            _ => {}
        }
        Ok(())
    }

    /// `if cond { ... } elseif cond { ... } else { ... }`
    fn if_stmt(&mut self) -> Result<(), Error> {
        self.next()?;
        let cond = self.expr_full()?;
        let mut false_list = self.cond_true_falls_through(cond)?;
        self.block()?;

        // Thread of end-of-branch jumps that all land after the statement.
        let mut end_jumps: JmpList = None;
        loop {
            match self.cur() {
                Tk::Elseif => {
                    let j = self.emit_jmp();
                    self.jmp_append(&mut end_jumps, j);
                    self.patch_here(false_list);
                    self.next()?;
                    let cond = self.expr_full()?;
                    false_list = self.cond_true_falls_through(cond)?;
                    self.block()?;
                }
                Tk::Else => {
                    let j = self.emit_jmp();
                    self.jmp_append(&mut end_jumps, j);
                    self.patch_here(false_list);
                    false_list = None;
                    self.next()?;
                    self.block()?;
                    break;
                }
                _ => break,
            }
        }
        self.patch_here(false_list);
        self.patch_here(end_jumps);
        Ok(())
    }

    /// `while cond { ... }`
    fn while_stmt(&mut self) -> Result<(), Error> {
        self.next()?;
        let start = self.pc();
        let cond = self.expr_full()?;
        let false_list = self.cond_true_falls_through(cond)?;
        self.block()?;
        self.emit_loop(start);
        self.patch_here(false_list);
        Ok(())
    }

    /// `loop { ... }`, an infinite loop.
    fn loop_stmt(&mut self) -> Result<(), Error> {
        self.next()?;
        let start = self.pc();
        self.block()?;
        self.emit_loop(start);
        Ok(())
    }

    /// `fn name(params) { ... }`, or - if no name follows the keyword - an
    /// anonymous function expression statement.
    fn fn_stmt(&mut self) -> Result<(), Error> {
        let saved = self.lex.save();
        self.next()?;
        if !matches!(self.cur(), Tk::Ident(_)) {
            self.lex.restore(saved);
            return self.expr_stmt();
        }
        let (name, text) = self.expect_ident()?;
        self.check_unused(name, &text)?;
        let fn_idx = self.function_body()?;
        let slot = self.reserve_slot()?;
        self.emit(Ins::new2(Opcode::SetF, slot, fn_idx));
        self.locals.push(Local { name });
        Ok(())
    }

    /// Parses `(params) { body }` into a fresh function on the VM, returning
    /// the new function's index.
    fn function_body(&mut self) -> Result<u16, Error> {
        let fn_idx = self.vm.new_fn(self.pkg);
        if fn_idx > u16::MAX as usize {
            return Err(self.err("too many functions"));
        }
        self.scopes.push(FnScope {
            fn_idx,
            first_local: self.locals.len(),
            next_slot: 0,
        });

        self.expect(Tk::LParen)?;
        let mut args_count: usize = 0;
        if self.cur() != Tk::RParen {
            loop {
                let (pname, ptext) = self.expect_ident()?;
                self.check_unused(pname, &ptext)?;
                self.reserve_slot()?;
                self.locals.push(Local { name: pname });
                args_count += 1;
                if self.cur() == Tk::Comma {
                    self.next()?;
                } else {
                    break;
                }
            }
        }
        self.expect(Tk::RParen)?;
        self.vm.fns[fn_idx].args_count = args_count as u8;

        self.block()?;
        self.emit(Ins::new3(Opcode::Ret, 0, 0, 0));

        let first_local = self.scope().first_local;
        self.scopes.pop();
        self.locals.truncate(first_local);
        Ok(fn_idx as u16)
    }
}
