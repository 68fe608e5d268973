//! The AST-to-bytecode compiler.
//!
//! Single pass per function, with a stack of function states for nested
//! function literals. Each state owns a 256-entry register map (locals and
//! scratch temporaries, allocated first-free), the code builder, the
//! upvalue descriptors accumulated for the function, and the loop contexts
//! needed to patch `break` and resolve `continue`.
//!
//! Scope handling snapshots the register map at block entry and restores it
//! at exit; registers captured by inner closures are counted so every jump
//! that leaves their scope carries a close-upvalues count for the VM.
//!
//! Top-level functions compile in two passes: first every function is
//! registered as an empty shell (with a zero-upvalue closure), then each
//! body is compiled and the shell replaced, so bodies can reference
//! functions defined later in the file.

use crate::{
    ast::{Ast, Block, Expr, ExprKind, FuncExpr, Stmt, StmtKind},
    bytecode::{
        builder::CodeBuilder,
        code::{FuncDef, UpvalDef},
        op::{Instr, MAX_FUNC_REGS, Opcode, const_operand, operand_is_const},
    },
    error::{Error, ErrorKind, SrcLoc},
    heap::{Closure, Heap, HeapData, HeapId},
    intern::SymbolId,
    operator::{BinOp, UnOp},
    program::GlobalFunc,
    value::NativeId,
};

/// Compiles a parse unit, returning the newly defined top-level functions.
///
/// `globals` are functions from earlier compilations and `native_names`
/// the registered native functions; bodies may reference both. Nothing is
/// attached to the program on failure.
pub(crate) fn compile(
    ast: &Ast,
    heap: &mut Heap,
    globals: &[GlobalFunc],
    native_names: &[String],
    files: &[String],
) -> Result<Vec<GlobalFunc>, Error> {
    let compiler = Compiler {
        ast,
        heap,
        globals,
        native_names,
        files,
        new_funcs: Vec::new(),
        states: Vec::new(),
    };
    compiler.run()
}

#[derive(Debug, Clone)]
struct RegInfo {
    var: Option<SymbolId>,
    alloc: bool,
    /// Set when an inner closure captures this register; scope-exit jumps
    /// must close the cell.
    captured: bool,
}

#[derive(Debug)]
struct LoopCtx {
    continue_target: usize,
    break_addrs: Vec<usize>,
    /// Register map at loop entry, for computing how many captured
    /// registers a `break`/`continue` abandons.
    entry_regs: Vec<RegInfo>,
}

#[derive(Debug)]
struct FuncState {
    builder: CodeBuilder,
    regs: Vec<RegInfo>,
    num_regs: usize,
    n_params: usize,
    upvals: Vec<(UpvalDef, SymbolId)>,
    loops: Vec<LoopCtx>,
}

impl FuncState {
    fn new(n_params: usize) -> Self {
        Self {
            builder: CodeBuilder::new(),
            regs: Vec::new(),
            num_regs: 0,
            n_params,
            upvals: Vec::new(),
            loops: Vec::new(),
        }
    }
}

/// Captured registers released when unwinding from the current map back to
/// `saved`: allocated now, marked captured, and not the same variable in
/// the saved map.
fn count_captures(regs: &[RegInfo], saved: &[RegInfo]) -> u32 {
    let mut count = 0;
    for (i, r) in regs.iter().enumerate() {
        if r.alloc && r.captured {
            let survives = saved.get(i).is_some_and(|s| s.alloc && s.var == r.var);
            if !survives {
                count += 1;
            }
        }
    }
    count
}

fn expr_is_simple(e: &Expr) -> bool {
    matches!(e.kind, ExprKind::Var(_) | ExprKind::Number(_) | ExprKind::Str(_))
}

/// A one-operator expression over simple operands compiles without
/// intermediate jumps, so it may build directly into the assigned
/// variable's register. Short-circuit operators are excluded.
fn expr_is_simple_op(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Bin { op, left, right } if !matches!(op, BinOp::And | BinOp::Or) => {
            expr_is_simple(left) && expr_is_simple(right)
        }
        ExprKind::Un { arg, .. } => expr_is_simple(arg),
        _ => false,
    }
}

fn is_cmp(op: BinOp) -> bool {
    matches!(op, BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge)
}

/// Compare opcode and invert bit; `>` and `>=` invert `<=` and `<`.
fn cmp_opcode(op: BinOp) -> (Opcode, u32) {
    match op {
        BinOp::Lt => (Opcode::CmpLt, 0),
        BinOp::Gt => (Opcode::CmpLe, 1),
        BinOp::Le => (Opcode::CmpLe, 0),
        BinOp::Ge => (Opcode::CmpLt, 1),
        BinOp::Eq => (Opcode::CmpEq, 0),
        BinOp::Ne => (Opcode::CmpEq, 1),
        _ => unreachable!("not a comparison operator"),
    }
}

fn arith_opcode(op: BinOp) -> Option<Opcode> {
    match op {
        BinOp::Add => Some(Opcode::Add),
        BinOp::Sub => Some(Opcode::Sub),
        BinOp::Mul => Some(Opcode::Mul),
        BinOp::Div => Some(Opcode::Div),
        BinOp::Mod => Some(Opcode::Mod),
        _ => None,
    }
}

struct Compiler<'a> {
    ast: &'a Ast,
    heap: &'a mut Heap,
    globals: &'a [GlobalFunc],
    native_names: &'a [String],
    files: &'a [String],
    /// Functions of this unit: name symbol, program entry, FuncDef shell.
    new_funcs: Vec<(SymbolId, GlobalFunc, HeapId)>,
    states: Vec<FuncState>,
}

impl<'a> Compiler<'a> {
    fn run(mut self) -> Result<Vec<GlobalFunc>, Error> {
        let ast = self.ast;

        // pass 1: register shells so bodies can reference any top-level name
        for f in &ast.funcs {
            let name = ast.symbols.name(f.name).to_owned();
            let name_id = self.heap.new_str(&name);
            let fd_id = self
                .heap
                .allocate(HeapData::FuncDef(FuncDef::shell(Some(name_id), f.func.params.len())));
            let closure_id = self.heap.allocate(HeapData::Closure(Closure {
                func_def: fd_id,
                upvals: Vec::new(),
            }));
            self.new_funcs.push((
                f.name,
                GlobalFunc { name, closure: closure_id },
                fd_id,
            ));
        }

        // pass 2: compile bodies into the shells
        for (i, f) in ast.funcs.iter().enumerate() {
            let fd_id = self.new_funcs[i].2;
            let name_id = match self.heap.get(fd_id) {
                HeapData::FuncDef(shell) => shell.name,
                _ => None,
            };
            let mut fd = self.compile_func(&f.func)?;
            fd.name = name_id;
            if !self.states.is_empty() {
                return Err(self.err(f.loc, "function state stack not empty after compilation"));
            }
            *self.heap.get_mut(fd_id) = HeapData::FuncDef(fd);
        }

        Ok(self.new_funcs.into_iter().map(|(_, g, _)| g).collect())
    }

    fn file_name(&self, loc: SrcLoc) -> &str {
        self.files.get(loc.file as usize).map_or("<unknown>", String::as_str)
    }

    fn err(&self, loc: SrcLoc, message: impl std::fmt::Display) -> Error {
        Error::at(ErrorKind::Compile, self.file_name(loc), loc, message)
    }

    fn cur(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("no current function state")
    }

    // ---- register allocation -------------------------------------------

    fn alloc_reg(&mut self, loc: SrcLoc, var: Option<SymbolId>) -> Result<usize, Error> {
        let st = self.states.last_mut().expect("no current function state");
        let reg = match st.regs.iter().position(|r| !r.alloc) {
            Some(reg) => reg,
            None => {
                let reg = st.regs.len();
                if reg >= MAX_FUNC_REGS as usize {
                    return Err(self.err(loc, "too many registers used"));
                }
                st.regs.push(RegInfo { var: None, alloc: false, captured: false });
                reg
            }
        };
        let slot = &mut st.regs[reg];
        slot.var = var;
        slot.alloc = true;
        slot.captured = false;
        st.num_regs = st.num_regs.max(reg + 1);
        Ok(reg)
    }

    /// Allocates `n` contiguous scratch registers past the highest
    /// allocated one; call windows need the callee and its arguments
    /// adjacent.
    fn alloc_n_regs(&mut self, loc: SrcLoc, n: usize) -> Result<usize, Error> {
        let st = self.states.last_mut().expect("no current function state");
        let first = st.regs.iter().rposition(|r| r.alloc).map_or(0, |i| i + 1);
        if first + n > MAX_FUNC_REGS as usize {
            return Err(self.err(loc, "too many registers used"));
        }
        let st = self.states.last_mut().expect("no current function state");
        for reg in first..first + n {
            if st.regs.len() <= reg {
                st.regs.push(RegInfo { var: None, alloc: false, captured: false });
            }
            let slot = &mut st.regs[reg];
            slot.var = None;
            slot.alloc = true;
            slot.captured = false;
        }
        st.num_regs = st.num_regs.max(first + n);
        Ok(first)
    }

    fn free_reg(&mut self, reg: usize) {
        if let Some(slot) = self.cur().regs.get_mut(reg) {
            slot.alloc = false;
        }
    }

    fn free_tmp_regs(&mut self) {
        for slot in &mut self.cur().regs {
            if slot.alloc && slot.var.is_none() {
                slot.alloc = false;
            }
        }
    }

    fn set_reg_var(&mut self, reg: usize, var: SymbolId) {
        if let Some(slot) = self.cur().regs.get_mut(reg) {
            slot.var = Some(var);
        }
    }

    fn find_var_reg(&mut self, var: SymbolId) -> Option<usize> {
        self.cur().regs.iter().rposition(|r| r.alloc && r.var == Some(var))
    }

    // ---- upvalue promotion ---------------------------------------------

    /// Resolves `sym` against enclosing function states, threading upvalue
    /// descriptors down to the current function. Returns the upvalue index
    /// in the current function, or `None` if no enclosing scope defines it.
    fn resolve_upval(&mut self, loc: SrcLoc, sym: SymbolId) -> Result<Option<usize>, Error> {
        let depth = self.states.len();
        if depth < 2 {
            return Ok(None);
        }
        let mut found = None;
        for lvl in (0..depth - 1).rev() {
            if let Some(reg) = self.states[lvl].regs.iter().rposition(|r| r.alloc && r.var == Some(sym)) {
                found = Some((lvl, reg));
                break;
            }
        }
        let Some((lvl, reg)) = found else { return Ok(None) };

        self.states[lvl].regs[reg].captured = true;
        #[expect(clippy::cast_possible_truncation, reason = "register indices fit u8")]
        let mut idx = self
            .add_upval(lvl + 1, UpvalDef::Reg(reg as u8), sym)
            .map_err(|e| self.err(loc, e))?;
        for l in lvl + 2..depth {
            #[expect(clippy::cast_possible_truncation, reason = "upvalue indices are capped at 256")]
            let def = UpvalDef::Upval(idx as u8);
            idx = self.add_upval(l, def, sym).map_err(|e| self.err(loc, e))?;
        }
        Ok(Some(idx))
    }

    fn add_upval(&mut self, level: usize, def: UpvalDef, sym: SymbolId) -> Result<usize, String> {
        let st = &mut self.states[level];
        if let Some(i) = st.upvals.iter().position(|(d, _)| *d == def) {
            return Ok(i);
        }
        if st.upvals.len() >= 256 {
            return Err("too many upvalues in function".to_owned());
        }
        st.upvals.push((def, sym));
        Ok(st.upvals.len() - 1)
    }

    // ---- scopes ---------------------------------------------------------

    /// Restores the register map saved at scope entry, merging capture
    /// marks for variables that outlive the scope, and returns how many
    /// captured registers the scope releases.
    fn leave_scope(&mut self, mut saved: Vec<RegInfo>) -> u32 {
        let st = self.states.last_mut().expect("no current function state");
        let closes = count_captures(&st.regs, &saved);
        for (i, s) in saved.iter_mut().enumerate() {
            if let Some(now) = st.regs.get(i)
                && s.alloc
                && now.alloc
                && s.var == now.var
            {
                s.captured |= now.captured;
            }
        }
        st.regs = saved;
        closes
    }

    fn compile_block(&mut self, block: &'a Block) -> Result<(), Error> {
        let saved = self.cur().regs.clone();
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        let closes = self.leave_scope(saved);
        if closes > 0 {
            self.cur().builder.emit(Instr::op_as(Opcode::Jmp, closes, 0));
        }
        Ok(())
    }

    // ---- functions ------------------------------------------------------

    fn compile_func(&mut self, func: &'a FuncExpr) -> Result<FuncDef, Error> {
        self.states.push(FuncState::new(func.params.len()));
        self.cur().builder.set_loc(func.loc);
        for &param in &func.params {
            self.alloc_reg(func.loc, Some(param))?;
        }

        let result = self.compile_block(&func.body);
        if let Err(e) = result {
            self.states.pop();
            return Err(e);
        }

        let ends_with_return = matches!(func.body.stmts.last(), Some(Stmt { kind: StmtKind::Return(_), .. }));
        if !ends_with_return {
            self.cur().builder.emit(Instr::op_ab(Opcode::Ret, 0, 0));
        }

        let st = self.states.pop().expect("no current function state");
        let upvals = st.upvals.iter().map(|(d, _)| *d).collect();
        Ok(st
            .builder
            .finish(None, st.n_params, st.num_regs.max(st.n_params), upvals))
    }

    // ---- statements -----------------------------------------------------

    fn compile_stmt(&mut self, stmt: &'a Stmt) -> Result<(), Error> {
        self.cur().builder.set_loc(stmt.loc);
        match &stmt.kind {
            StmtKind::Empty => Ok(()),
            StmtKind::VarDecl { var, val } => {
                let reg = self.alloc_reg(stmt.loc, None)?;
                if let Some(e) = val {
                    self.compile_expr_into(e, reg)?;
                } else {
                    #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                    self.cur().builder.emit(Instr::op_a(Opcode::LdNull, reg as u32));
                }
                self.set_reg_var(reg, *var);
                self.free_tmp_regs();
                Ok(())
            }
            StmtKind::Expr(e) => {
                self.compile_expr(e, None)?;
                self.free_tmp_regs();
                Ok(())
            }
            StmtKind::Block(block) => self.compile_block(block),
            StmtKind::Return(val) => {
                if let Some(e) = val {
                    let operand = self.expr_operand(e)?;
                    self.cur().builder.emit(Instr::op_ab(Opcode::Ret, 1, operand));
                } else {
                    self.cur().builder.emit(Instr::op_ab(Opcode::Ret, 0, 0));
                }
                self.free_tmp_regs();
                Ok(())
            }
            StmtKind::If { test, then, els } => self.compile_if(stmt.loc, test, then, els.as_deref()),
            StmtKind::While { test, body } => self.compile_while(stmt.loc, test, body),
            StmtKind::Break => self.compile_break(stmt.loc),
            StmtKind::Continue => self.compile_continue(stmt.loc),
        }
    }

    fn compile_if(
        &mut self,
        loc: SrcLoc,
        test: &'a Expr,
        then: &'a Stmt,
        els: Option<&'a Stmt>,
    ) -> Result<(), Error> {
        self.compile_test(test, false)?;
        self.free_tmp_regs();
        let j_false = self.cur().builder.emit_jump(0);
        self.compile_stmt(then)?;
        if let Some(els) = els {
            let j_end = self.cur().builder.emit_jump(0);
            let here = self.cur().builder.addr();
            self.patch(loc, j_false, here)?;
            self.compile_stmt(els)?;
            let end = self.cur().builder.addr();
            self.patch(loc, j_end, end)?;
        } else {
            let here = self.cur().builder.addr();
            self.patch(loc, j_false, here)?;
        }
        Ok(())
    }

    fn compile_while(&mut self, loc: SrcLoc, test: &'a Expr, body: &'a Stmt) -> Result<(), Error> {
        let entry_regs = self.cur().regs.clone();
        let continue_target = self.cur().builder.addr();
        self.cur().loops.push(LoopCtx {
            continue_target,
            break_addrs: Vec::new(),
            entry_regs,
        });

        self.compile_test(test, false)?;
        self.free_tmp_regs();
        let j_end = self.cur().builder.emit_jump(0);
        self.compile_stmt(body)?;
        self.free_tmp_regs();
        let disp = self
            .cur()
            .builder
            .displacement_to(continue_target)
            .map_err(|e| self.err(loc, e))?;
        self.cur().builder.emit(Instr::op_as(Opcode::Jmp, 0, disp));

        let end = self.cur().builder.addr();
        self.patch(loc, j_end, end)?;
        let ctx = self.cur().loops.pop().expect("loop context missing");
        for addr in ctx.break_addrs {
            self.patch(loc, addr, end)?;
        }
        Ok(())
    }

    fn compile_break(&mut self, loc: SrcLoc) -> Result<(), Error> {
        let st = self.states.last_mut().expect("no current function state");
        let Some(ctx) = st.loops.last() else {
            return Err(self.err(loc, "'break' not inside 'while'"));
        };
        let closes = count_captures(&st.regs, &ctx.entry_regs);
        let addr = st.builder.emit_jump(closes);
        st.loops.last_mut().expect("loop context missing").break_addrs.push(addr);
        Ok(())
    }

    fn compile_continue(&mut self, loc: SrcLoc) -> Result<(), Error> {
        let st = self.states.last_mut().expect("no current function state");
        let Some(ctx) = st.loops.last() else {
            return Err(self.err(loc, "'continue' not inside 'while'"));
        };
        let closes = count_captures(&st.regs, &ctx.entry_regs);
        let target = ctx.continue_target;
        let disp = match st.builder.displacement_to(target) {
            Ok(d) => d,
            Err(e) => return Err(self.err(loc, e)),
        };
        st.builder.emit(Instr::op_as(Opcode::Jmp, closes, disp));
        Ok(())
    }

    fn patch(&mut self, loc: SrcLoc, addr: usize, target: usize) -> Result<(), Error> {
        match self.cur().builder.patch_jump(addr, target) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.err(loc, e)),
        }
    }

    // ---- tests and conditions -------------------------------------------

    /// Compiles a condition, emitting either a fused compare or a `TEST`;
    /// the caller emits the conditional `JMP` right after. `!` prefixes
    /// fold into the invert bit.
    fn compile_test(&mut self, test: &'a Expr, invert: bool) -> Result<(), Error> {
        let mut invert = invert;
        let mut test = test;
        while let ExprKind::Un { op: UnOp::Not, arg } = &test.kind {
            invert = !invert;
            test = arg;
        }
        self.cur().builder.set_loc(test.loc);
        if let ExprKind::Bin { op, left, right } = &test.kind
            && is_cmp(*op)
        {
            let l = self.expr_operand(left)?;
            let r = self.expr_operand(right)?;
            let (opc, inv) = cmp_opcode(*op);
            self.cur().builder.emit(Instr::op_abc(opc, inv ^ u32::from(invert), l, r));
            return Ok(());
        }
        let operand = self.expr_operand(test)?;
        self.cur().builder.emit(Instr::op_ab(Opcode::Test, u32::from(invert), operand));
        Ok(())
    }

    // ---- expressions ----------------------------------------------------

    /// Compiles `expr` into `dest`.
    fn compile_expr_into(&mut self, expr: &'a Expr, dest: usize) -> Result<(), Error> {
        self.compile_expr(expr, Some(dest)).map(|_| ())
    }

    /// Compiles `expr` and returns the register holding the result; with
    /// `req` the result is forced into that register.
    fn compile_expr(&mut self, expr: &'a Expr, req: Option<usize>) -> Result<usize, Error> {
        self.cur().builder.set_loc(expr.loc);
        match &expr.kind {
            ExprKind::Null => {
                let dest = self.dest_or_temp(expr.loc, req)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_a(Opcode::LdNull, dest as u32));
                Ok(dest)
            }
            ExprKind::Bool(b) => {
                let k = self.const_bool(expr.loc, *b)?;
                self.load_const(expr.loc, k, req)
            }
            ExprKind::Number(n) => {
                let k = self.const_number(expr.loc, *n)?;
                self.load_const(expr.loc, k, req)
            }
            ExprKind::Str(id) => {
                let k = self.const_string(expr.loc, self.ast.string(*id))?;
                self.load_const(expr.loc, k, req)
            }
            ExprKind::Var(sym) => self.compile_var(expr.loc, *sym, req),
            ExprKind::Bin { op, left, right } => self.compile_bin_op(expr.loc, *op, left, right, req),
            ExprKind::Un { op, arg } => {
                let operand = self.expr_operand(arg)?;
                let dest = self.dest_or_temp(expr.loc, req)?;
                let opc = match op {
                    UnOp::Neg => Opcode::Neg,
                    UnOp::Not => Opcode::Not,
                };
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_ab(opc, dest as u32, operand));
                Ok(dest)
            }
            ExprKind::Index { container, index } => {
                let c = self.expr_operand(container)?;
                let i = self.expr_operand(index)?;
                let dest = self.dest_or_temp(expr.loc, req)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_abc(Opcode::GetEl, dest as u32, c, i));
                Ok(dest)
            }
            ExprKind::Call { func, args } => self.compile_call(expr.loc, func, args, req),
            ExprKind::ArrayLit(elems) => {
                let base = self.alloc_n_regs(expr.loc, elems.len() + 1)?;
                for (i, e) in elems.iter().enumerate() {
                    self.compile_expr_into(e, base + 1 + i)?;
                }
                #[expect(clippy::cast_possible_truncation, reason = "element counts fit u32")]
                self.cur()
                    .builder
                    .emit(Instr::op_au(Opcode::NewArray, base as u32, elems.len() as u32));
                for i in 1..=elems.len() {
                    self.free_reg(base + i);
                }
                self.finish_dest(base, req)
            }
            ExprKind::MapLit(pairs) => {
                let n = pairs.len() * 2;
                let base = self.alloc_n_regs(expr.loc, n + 1)?;
                for (i, (k, v)) in pairs.iter().enumerate() {
                    self.compile_expr_into(k, base + 1 + 2 * i)?;
                    self.compile_expr_into(v, base + 2 + 2 * i)?;
                }
                #[expect(clippy::cast_possible_truncation, reason = "element counts fit u32")]
                self.cur().builder.emit(Instr::op_au(Opcode::NewMap, base as u32, n as u32));
                for i in 1..=n {
                    self.free_reg(base + i);
                }
                self.finish_dest(base, req)
            }
            ExprKind::Func(func) => {
                let fd = self.compile_func(func)?;
                let fd_id = self.heap.allocate(HeapData::FuncDef(fd));
                let k = self.const_ref(expr.loc, fd_id)?;
                let b = self.operand_for_const(expr.loc, k)?;
                let dest = self.dest_or_temp(expr.loc, req)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_ab(Opcode::Closure, dest as u32, b));
                Ok(dest)
            }
        }
    }

    fn dest_or_temp(&mut self, loc: SrcLoc, req: Option<usize>) -> Result<usize, Error> {
        match req {
            Some(d) => Ok(d),
            None => self.alloc_reg(loc, None),
        }
    }

    /// Moves `reg` into the required destination, releasing `reg` when it
    /// was scratch.
    fn finish_dest(&mut self, reg: usize, req: Option<usize>) -> Result<usize, Error> {
        match req {
            None => Ok(reg),
            Some(d) if d == reg => Ok(d),
            Some(d) => {
                self.free_reg(reg);
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_ab(Opcode::Mov, d as u32, reg as u32));
                Ok(d)
            }
        }
    }

    fn load_const(&mut self, loc: SrcLoc, k: usize, req: Option<usize>) -> Result<usize, Error> {
        let dest = self.dest_or_temp(loc, req)?;
        #[expect(clippy::cast_possible_truncation, reason = "constant index is range checked")]
        self.cur().builder.emit(Instr::op_au(Opcode::Ldc, dest as u32, k as u32));
        Ok(dest)
    }

    fn const_number(&mut self, loc: SrcLoc, n: f64) -> Result<usize, Error> {
        let st = self.states.last_mut().expect("no current function state");
        match st.builder.const_number(n) {
            Ok(k) => Ok(k),
            Err(e) => Err(self.err(loc, e)),
        }
    }

    fn const_bool(&mut self, loc: SrcLoc, b: bool) -> Result<usize, Error> {
        let st = self.states.last_mut().expect("no current function state");
        match st.builder.const_bool(b) {
            Ok(k) => Ok(k),
            Err(e) => Err(self.err(loc, e)),
        }
    }

    fn const_string(&mut self, loc: SrcLoc, text: &str) -> Result<usize, Error> {
        if let Some(k) = self.cur().builder.lookup_string(text) {
            return Ok(k);
        }
        let id = self.heap.new_str(text);
        let st = self.states.last_mut().expect("no current function state");
        match st.builder.const_string(text, id) {
            Ok(k) => Ok(k),
            Err(e) => Err(self.err(loc, e)),
        }
    }

    fn const_ref(&mut self, loc: SrcLoc, id: HeapId) -> Result<usize, Error> {
        let st = self.states.last_mut().expect("no current function state");
        match st.builder.const_ref(id) {
            Ok(k) => Ok(k),
            Err(e) => Err(self.err(loc, e)),
        }
    }

    /// Reg-or-const operand for pool entry `k`, spilling through `LDC`
    /// into a scratch register when the index exceeds the 9-bit field.
    fn operand_for_const(&mut self, loc: SrcLoc, k: usize) -> Result<u32, Error> {
        if let Some(op) = const_operand(k) {
            return Ok(op);
        }
        let tmp = self.alloc_reg(loc, None)?;
        #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
        let tmp32 = tmp as u32;
        #[expect(clippy::cast_possible_truncation, reason = "constant index is range checked")]
        self.cur().builder.emit(Instr::op_au(Opcode::Ldc, tmp32, k as u32));
        Ok(tmp32)
    }

    /// Compiles an expression for a reg-or-const operand position:
    /// literals become constant operands, locals are used in place, and
    /// everything else compiles into a scratch register.
    fn expr_operand(&mut self, expr: &'a Expr) -> Result<u32, Error> {
        match &expr.kind {
            ExprKind::Number(n) => {
                let k = self.const_number(expr.loc, *n)?;
                self.operand_for_const(expr.loc, k)
            }
            ExprKind::Str(id) => {
                let k = self.const_string(expr.loc, self.ast.string(*id))?;
                self.operand_for_const(expr.loc, k)
            }
            ExprKind::Bool(b) => {
                let k = self.const_bool(expr.loc, *b)?;
                self.operand_for_const(expr.loc, k)
            }
            ExprKind::Var(sym) => {
                if let Some(reg) = self.find_var_reg(*sym) {
                    #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                    return Ok(reg as u32);
                }
                let reg = self.compile_var(expr.loc, *sym, None)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                Ok(reg as u32)
            }
            _ => {
                let reg = self.compile_expr(expr, None)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                Ok(reg as u32)
            }
        }
    }

    fn compile_var(&mut self, loc: SrcLoc, sym: SymbolId, req: Option<usize>) -> Result<usize, Error> {
        if let Some(reg) = self.find_var_reg(sym) {
            return match req {
                None => Ok(reg),
                Some(d) if d == reg => Ok(d),
                Some(d) => {
                    #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                    self.cur().builder.emit(Instr::op_ab(Opcode::Mov, d as u32, reg as u32));
                    Ok(d)
                }
            };
        }
        if let Some(uv) = self.resolve_upval(loc, sym)? {
            let dest = self.dest_or_temp(loc, req)?;
            #[expect(clippy::cast_possible_truncation, reason = "register and upvalue indices fit u32")]
            self.cur()
                .builder
                .emit(Instr::op_ab(Opcode::GetUpval, dest as u32, uv as u32));
            return Ok(dest);
        }
        if let Some(k) = self.global_const(loc, sym)? {
            return self.load_const(loc, k, req);
        }
        let name = self.ast.symbols.name(sym);
        Err(self.err(loc, format!("unknown variable or function '{name}'")))
    }

    /// Constant-pool entry for a global function or native with this name,
    /// if one exists. Functions of the current unit win over earlier
    /// compilations, which win over natives.
    fn global_const(&mut self, loc: SrcLoc, sym: SymbolId) -> Result<Option<usize>, Error> {
        if let Some(closure) = self.new_funcs.iter().find(|(s, _, _)| *s == sym).map(|(_, g, _)| g.closure) {
            return self.const_ref(loc, closure).map(Some);
        }
        let name = self.ast.symbols.name(sym);
        if let Some(closure) = self.globals.iter().find(|g| g.name == name).map(|g| g.closure) {
            return self.const_ref(loc, closure).map(Some);
        }
        if let Some(i) = self.native_names.iter().position(|n| n == name) {
            #[expect(clippy::cast_possible_truncation, reason = "native registry is far below u32::MAX")]
            let id = NativeId(i as u32);
            let st = self.states.last_mut().expect("no current function state");
            return match st.builder.const_native(id) {
                Ok(k) => Ok(Some(k)),
                Err(e) => Err(self.err(loc, e)),
            };
        }
        Ok(None)
    }

    fn compile_bin_op(
        &mut self,
        loc: SrcLoc,
        op: BinOp,
        left: &'a Expr,
        right: &'a Expr,
        req: Option<usize>,
    ) -> Result<usize, Error> {
        match op {
            BinOp::Assign => self.compile_assign(loc, left, right, req),
            BinOp::And | BinOp::Or => {
                let dest = self.dest_or_temp(loc, req)?;
                self.compile_expr_into(left, dest)?;
                let invert = u32::from(op == BinOp::Or);
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_ab(Opcode::Test, invert, dest as u32));
                let j = self.cur().builder.emit_jump(0);
                self.compile_expr_into(right, dest)?;
                let here = self.cur().builder.addr();
                self.patch(loc, j, here)?;
                Ok(dest)
            }
            _ if is_cmp(op) => {
                let l = self.expr_operand(left)?;
                let r = self.expr_operand(right)?;
                let dest = self.dest_or_temp(loc, req)?;
                let (opc, inv) = cmp_opcode(op);
                let kt = self.const_bool(loc, true)?;
                let kf = self.const_bool(loc, false)?;
                #[expect(clippy::cast_possible_truncation, reason = "register and constant indices are range checked")]
                {
                    let b = &mut self.states.last_mut().expect("no current function state").builder;
                    b.emit(Instr::op_abc(opc, inv, l, r));
                    b.emit(Instr::op_as(Opcode::Jmp, 0, 2));
                    b.emit(Instr::op_au(Opcode::Ldc, dest as u32, kt as u32));
                    b.emit(Instr::op_as(Opcode::Jmp, 0, 1));
                    b.emit(Instr::op_au(Opcode::Ldc, dest as u32, kf as u32));
                }
                Ok(dest)
            }
            _ => {
                let opc = arith_opcode(op).ok_or_else(|| {
                    let name: &'static str = op.into();
                    self.err(loc, format!("compilation of operator '{name}' is not implemented"))
                })?;
                let l = self.expr_operand(left)?;
                let r = self.expr_operand(right)?;
                let dest = self.dest_or_temp(loc, req)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_abc(opc, dest as u32, l, r));
                Ok(dest)
            }
        }
    }

    fn compile_assign(
        &mut self,
        loc: SrcLoc,
        left: &'a Expr,
        right: &'a Expr,
        req: Option<usize>,
    ) -> Result<usize, Error> {
        match &left.kind {
            ExprKind::Var(sym) => {
                if let Some(left_reg) = self.find_var_reg(*sym) {
                    // Compile straight into the variable's register unless
                    // the right side reads the variable mid-expression.
                    if expr_is_simple(right) || expr_is_simple_op(right) || !right.contains_var(*sym) {
                        self.compile_expr_into(right, left_reg)?;
                        return match req {
                            None => Ok(left_reg),
                            Some(d) if d == left_reg => Ok(d),
                            Some(d) => {
                                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                                self.cur()
                                    .builder
                                    .emit(Instr::op_ab(Opcode::Mov, d as u32, left_reg as u32));
                                Ok(d)
                            }
                        };
                    }
                    let tmp = self.compile_expr(right, req)?;
                    if tmp != left_reg {
                        #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                        self.cur()
                            .builder
                            .emit(Instr::op_ab(Opcode::Mov, left_reg as u32, tmp as u32));
                    }
                    return Ok(req.unwrap_or(left_reg));
                }
                if let Some(uv) = self.resolve_upval(loc, *sym)? {
                    let operand = self.expr_operand(right)?;
                    #[expect(clippy::cast_possible_truncation, reason = "upvalue indices fit u32")]
                    self.cur()
                        .builder
                        .emit(Instr::op_ab(Opcode::SetUpval, uv as u32, operand));
                    return self.materialize(loc, operand, req);
                }
                let name = self.ast.symbols.name(*sym);
                Err(self.err(loc, format!("undeclared variable '{name}'")))
            }
            ExprKind::Index { container, index } => {
                let cont = self.compile_expr(container, None)?;
                let idx = self.expr_operand(index)?;
                let val = self.expr_operand(right)?;
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur()
                    .builder
                    .emit(Instr::op_abc(Opcode::SetEl, cont as u32, idx, val));
                self.materialize(loc, val, req)
            }
            _ => Err(self.err(loc, "invalid assignment")),
        }
    }

    /// Ensures a reg-or-const operand ends up in a register, for an
    /// assignment used as an expression.
    fn materialize(&mut self, loc: SrcLoc, operand: u32, req: Option<usize>) -> Result<usize, Error> {
        if operand_is_const(operand) {
            let dest = self.dest_or_temp(loc, req)?;
            #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
            self.cur().builder.emit(Instr::op_ab(Opcode::Mov, dest as u32, operand));
            return Ok(dest);
        }
        let reg = operand as usize;
        match req {
            None => Ok(reg),
            Some(d) if d == reg => Ok(d),
            Some(d) => {
                #[expect(clippy::cast_possible_truncation, reason = "register indices fit u32")]
                self.cur().builder.emit(Instr::op_ab(Opcode::Mov, d as u32, operand));
                Ok(d)
            }
        }
    }

    fn compile_call(
        &mut self,
        loc: SrcLoc,
        func: &'a Expr,
        args: &'a [Expr],
        req: Option<usize>,
    ) -> Result<usize, Error> {
        let func_reg = self.alloc_n_regs(loc, args.len() + 1)?;
        self.compile_expr_into(func, func_reg)?;
        for (i, a) in args.iter().enumerate() {
            self.compile_expr_into(a, func_reg + 1 + i)?;
        }
        self.cur().builder.set_loc(loc);
        #[expect(clippy::cast_possible_truncation, reason = "register indices and arity fit u32")]
        self.cur()
            .builder
            .emit(Instr::op_ab(Opcode::Call, func_reg as u32, args.len() as u32));
        for i in 1..=args.len() {
            self.free_reg(func_reg + i);
        }
        self.finish_dest(func_reg, req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bytecode::code::dump_func,
        parser::{self, Source},
        Value,
    };

    #[derive(Debug)]
    struct Compiled {
        heap: Heap,
        funcs: Vec<GlobalFunc>,
    }

    impl Compiled {
        fn func_def(&self, name: &str) -> &FuncDef {
            let g = self.funcs.iter().find(|f| f.name == name).expect("function not compiled");
            let HeapData::Closure(c) = self.heap.get(g.closure) else {
                panic!("not a closure");
            };
            match self.heap.get(c.func_def) {
                HeapData::FuncDef(fd) => fd,
                _ => panic!("not a func def"),
            }
        }

        fn dump(&self, name: &str) -> String {
            let mut out = String::new();
            dump_func(&mut out, &self.heap, self.func_def(name));
            out
        }
    }

    fn compile_src(src: &str) -> Result<Compiled, Error> {
        let mut files = Vec::new();
        let ast = parser::parse(
            &mut files,
            Source::Str { name: "test.cv".to_owned(), text: src.to_owned() },
        )?;
        let mut heap = Heap::new();
        let natives = vec!["print".to_owned()];
        let funcs = compile(&ast, &mut heap, &[], &natives, &files)?;
        Ok(Compiled { heap, funcs })
    }

    #[test]
    fn literals_become_constant_operands() {
        let c = compile_src("function f(a) { return a + 2; }").unwrap();
        let dump = c.dump("f");
        assert!(dump.contains("ADD"), "{dump}");
        assert!(dump.contains("k0"), "operand should reference the constant pool:\n{dump}");
    }

    #[test]
    fn number_constants_are_deduplicated() {
        let c = compile_src("function f() { return 5 + 5 + 5; }").unwrap();
        let fd = c.func_def("f");
        assert_eq!(fd.consts.iter().filter(|v| matches!(v, Value::Number(n) if *n == 5.0)).count(), 1);
    }

    #[test]
    fn block_locals_release_their_registers() {
        let c = compile_src(
            "function f() {
               { var a = 1; print(a); }
               { var b = 2; print(b); }
             }",
        )
        .unwrap();
        // a and b occupy the same register once the first block closes,
        // alongside the call window
        let fd = c.func_def("f");
        assert!(fd.n_regs <= 3, "register map should be reused, got {}", fd.n_regs);
    }

    #[test]
    fn inner_function_captures_are_recorded() {
        let c = compile_src(
            "function outer() {
               var n = 0;
               return function() { n = n + 1; return n; };
             }",
        )
        .unwrap();
        let outer = c.func_def("outer");
        // the inner FuncDef is a constant of the outer one
        let inner = outer
            .consts
            .iter()
            .find_map(|v| match v {
                Value::Ref(id) => match c.heap.get(*id) {
                    HeapData::FuncDef(fd) => Some(fd),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant missing");
        assert_eq!(inner.upvals.len(), 1);
        assert!(matches!(inner.upvals[0], UpvalDef::Reg(0)));
        let dump = c.dump("outer");
        assert!(dump.contains("CLOSURE"), "{dump}");
    }

    #[test]
    fn two_level_captures_chain_through_the_middle_function() {
        let c = compile_src(
            "function outer(x) {
               return function() { return function() { return x; }; };
             }",
        )
        .unwrap();
        let outer = c.func_def("outer");
        let middle = outer
            .consts
            .iter()
            .find_map(|v| match v {
                Value::Ref(id) => match c.heap.get(*id) {
                    HeapData::FuncDef(fd) => Some(fd),
                    _ => None,
                },
                _ => None,
            })
            .expect("middle function constant missing");
        assert!(matches!(middle.upvals[0], UpvalDef::Reg(0)));
        let inner = middle
            .consts
            .iter()
            .find_map(|v| match v {
                Value::Ref(id) => match c.heap.get(*id) {
                    HeapData::FuncDef(fd) => Some(fd),
                    _ => None,
                },
                _ => None,
            })
            .expect("inner function constant missing");
        assert!(matches!(inner.upvals[0], UpvalDef::Upval(0)));
    }

    #[test]
    fn scope_exit_jumps_carry_close_counts() {
        let c = compile_src(
            "function f() {
               var i = 0;
               while (1) {
                 var x = i;
                 print(function() { return x; });
                 if (i == 3) break;
                 i = i + 1;
               }
             }",
        )
        .unwrap();
        let fd = c.func_def("f");
        let closing_jumps = fd
            .code
            .iter()
            .filter(|&&w| {
                let i = Instr(w);
                i.op() == Some(Opcode::Jmp) && i.a() > 0
            })
            .count();
        // one for the break, one for the block exit at the loop bottom
        assert!(closing_jumps >= 2, "expected closing jumps:\n{}", c.dump("f"));
    }

    #[test]
    fn test_contexts_fuse_comparisons() {
        let c = compile_src("function f(a, b) { if (!(a < b)) return 1; return 2; }").unwrap();
        let dump = c.dump("f");
        // the ! folds into the invert bit: CMP_LT 1, r0, r1
        assert!(dump.contains("CMP_LT    1, r0, r1"), "{dump}");
        assert!(!dump.contains("NOT"), "{dump}");
    }

    #[test]
    fn greater_than_swaps_to_inverted_less_equal() {
        let c = compile_src("function f(a, b) { if (a > b) return 1; return 2; }").unwrap();
        let dump = c.dump("f");
        assert!(dump.contains("CMP_LE    1, r0, r1"), "{dump}");
    }

    #[test]
    fn undefined_function_reference_fails() {
        let err = compile_src("function f() { return g(); }").unwrap_err();
        assert!(err.message.contains("unknown variable or function 'g'"), "{}", err.message);
    }

    #[test]
    fn forward_references_between_functions_compile() {
        let c = compile_src(
            "function first() { return second(); }
             function second() { return 1; }",
        )
        .unwrap();
        assert_eq!(c.funcs.len(), 2);
    }

    #[test]
    fn natives_resolve_after_script_functions() {
        let c = compile_src(
            "function print() { return 1; }
             function f() { return print(); }",
        )
        .unwrap();
        let fd = c.func_def("f");
        assert!(
            fd.consts.iter().all(|v| !matches!(v, Value::Native(_))),
            "script function should shadow the native"
        );
    }

    #[test]
    fn functions_end_with_an_implicit_return() {
        let c = compile_src("function f() { var a = 1; print(a); }").unwrap();
        let fd = c.func_def("f");
        let last = Instr(*fd.code.last().unwrap());
        assert_eq!(last.op(), Some(Opcode::Ret));
        assert_eq!(last.a(), 0, "implicit return yields null");
    }
}
