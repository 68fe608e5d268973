//! The abstract syntax tree.
//!
//! A parse produces an [`Ast`]: a list of named functions plus the symbol
//! table and string-literal pool they reference. Every node carries the
//! source location of its first token.
//!
//! The pretty printer prints a fully parenthesized form that reparses to a
//! structurally identical tree; `same_shape` comparisons ignore locations.

#[cfg(test)]
use std::fmt::Write as _;

#[cfg(test)]
use crate::value::fmt_number;
use crate::{
    error::SrcLoc,
    intern::{SymbolId, Symbols},
    operator::{BinOp, UnOp},
};

/// Index into the AST's string-literal pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StrId(pub(crate) u32);

/// One parse unit: functions in file order, plus the names and literals
/// they use.
#[derive(Debug, Default)]
pub(crate) struct Ast {
    pub funcs: Vec<NamedFunc>,
    pub symbols: Symbols,
    strings: Vec<Box<str>>,
}

impl Ast {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_string(&mut self, s: &str) -> StrId {
        let id = StrId(u32::try_from(self.strings.len()).unwrap_or(u32::MAX));
        self.strings.push(s.into());
        id
    }

    pub(crate) fn string(&self, id: StrId) -> &str {
        &self.strings[id.0 as usize]
    }
}

#[derive(Debug)]
pub(crate) struct NamedFunc {
    pub name: SymbolId,
    pub loc: SrcLoc,
    pub func: FuncExpr,
}

/// A function literal: parameters and a body block.
#[derive(Debug)]
pub(crate) struct FuncExpr {
    pub params: Vec<SymbolId>,
    pub body: Block,
    pub loc: SrcLoc,
}

#[derive(Debug, Default)]
pub(crate) struct Block {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug)]
pub(crate) struct Stmt {
    pub kind: StmtKind,
    pub loc: SrcLoc,
}

#[derive(Debug)]
pub(crate) enum StmtKind {
    Empty,
    VarDecl { var: SymbolId, val: Option<Box<Expr>> },
    Expr(Box<Expr>),
    Block(Block),
    Return(Option<Box<Expr>>),
    If { test: Box<Expr>, then: Box<Stmt>, els: Option<Box<Stmt>> },
    While { test: Box<Expr>, body: Box<Stmt> },
    Break,
    Continue,
}

#[derive(Debug)]
pub(crate) struct Expr {
    pub kind: ExprKind,
    pub loc: SrcLoc,
}

#[derive(Debug)]
pub(crate) enum ExprKind {
    Null,
    Bool(bool),
    Number(f64),
    Str(StrId),
    Var(SymbolId),
    Bin { op: BinOp, left: Box<Expr>, right: Box<Expr> },
    Un { op: UnOp, arg: Box<Expr> },
    Index { container: Box<Expr>, index: Box<Expr> },
    Call { func: Box<Expr>, args: Vec<Expr> },
    ArrayLit(Vec<Expr>),
    MapLit(Vec<(Expr, Expr)>),
    Func(Box<FuncExpr>),
}

impl Expr {
    /// True if the expression references `var` anywhere. The compiler uses
    /// this to decide whether an assignment can build its result directly
    /// in the destination register.
    pub(crate) fn contains_var(&self, var: SymbolId) -> bool {
        match &self.kind {
            ExprKind::Var(v) => *v == var,
            ExprKind::Null | ExprKind::Bool(_) | ExprKind::Number(_) | ExprKind::Str(_) => false,
            ExprKind::Bin { left, right, .. } => left.contains_var(var) || right.contains_var(var),
            ExprKind::Un { arg, .. } => arg.contains_var(var),
            ExprKind::Index { container, index } => container.contains_var(var) || index.contains_var(var),
            ExprKind::Call { func, args } => func.contains_var(var) || args.iter().any(|a| a.contains_var(var)),
            ExprKind::ArrayLit(elems) => elems.iter().any(|e| e.contains_var(var)),
            ExprKind::MapLit(pairs) => pairs.iter().any(|(k, v)| k.contains_var(var) || v.contains_var(var)),
            // an inner function sees the variable through an upvalue, which
            // still observes writes; treat it as a reference
            ExprKind::Func(_) => true,
        }
    }
}

// ---- structural comparison (test support) ------------------------------

impl Ast {
    #[cfg(test)]
    pub(crate) fn same_shape(&self, other: &Self) -> bool {
        self.funcs.len() == other.funcs.len()
            && self.funcs.iter().zip(&other.funcs).all(|(a, b)| {
                self.symbols.name(a.name) == other.symbols.name(b.name) && self.func_eq(&a.func, other, &b.func)
            })
    }

    #[cfg(test)]
    fn func_eq(&self, a: &FuncExpr, o: &Self, b: &FuncExpr) -> bool {
        a.params.len() == b.params.len()
            && a.params
                .iter()
                .zip(&b.params)
                .all(|(x, y)| self.symbols.name(*x) == o.symbols.name(*y))
            && self.block_eq(&a.body, o, &b.body)
    }

    #[cfg(test)]
    fn block_eq(&self, a: &Block, o: &Self, b: &Block) -> bool {
        a.stmts.len() == b.stmts.len() && a.stmts.iter().zip(&b.stmts).all(|(x, y)| self.stmt_eq(x, o, y))
    }

    #[cfg(test)]
    fn stmt_eq(&self, a: &Stmt, o: &Self, b: &Stmt) -> bool {
        use StmtKind as S;
        match (&a.kind, &b.kind) {
            (S::Empty, S::Empty) | (S::Break, S::Break) | (S::Continue, S::Continue) => true,
            (S::VarDecl { var: v1, val: e1 }, S::VarDecl { var: v2, val: e2 }) => {
                self.symbols.name(*v1) == o.symbols.name(*v2)
                    && match (e1, e2) {
                        (None, None) => true,
                        (Some(x), Some(y)) => self.expr_eq(x, o, y),
                        _ => false,
                    }
            }
            (S::Expr(x), S::Expr(y)) => self.expr_eq(x, o, y),
            (S::Block(x), S::Block(y)) => self.block_eq(x, o, y),
            (S::Return(None), S::Return(None)) => true,
            (S::Return(Some(x)), S::Return(Some(y))) => self.expr_eq(x, o, y),
            (S::If { test: t1, then: th1, els: e1 }, S::If { test: t2, then: th2, els: e2 }) => {
                self.expr_eq(t1, o, t2)
                    && self.stmt_eq(th1, o, th2)
                    && match (e1, e2) {
                        (None, None) => true,
                        (Some(x), Some(y)) => self.stmt_eq(x, o, y),
                        _ => false,
                    }
            }
            (S::While { test: t1, body: b1 }, S::While { test: t2, body: b2 }) => {
                self.expr_eq(t1, o, t2) && self.stmt_eq(b1, o, b2)
            }
            _ => false,
        }
    }

    #[cfg(test)]
    fn expr_eq(&self, a: &Expr, o: &Self, b: &Expr) -> bool {
        use ExprKind as E;
        match (&a.kind, &b.kind) {
            (E::Null, E::Null) => true,
            (E::Bool(x), E::Bool(y)) => x == y,
            (E::Number(x), E::Number(y)) => x == y,
            (E::Str(x), E::Str(y)) => self.string(*x) == o.string(*y),
            (E::Var(x), E::Var(y)) => self.symbols.name(*x) == o.symbols.name(*y),
            (E::Bin { op: o1, left: l1, right: r1 }, E::Bin { op: o2, left: l2, right: r2 }) => {
                o1 == o2 && self.expr_eq(l1, o, l2) && self.expr_eq(r1, o, r2)
            }
            (E::Un { op: o1, arg: a1 }, E::Un { op: o2, arg: a2 }) => o1 == o2 && self.expr_eq(a1, o, a2),
            (E::Index { container: c1, index: i1 }, E::Index { container: c2, index: i2 }) => {
                self.expr_eq(c1, o, c2) && self.expr_eq(i1, o, i2)
            }
            (E::Call { func: f1, args: a1 }, E::Call { func: f2, args: a2 }) => {
                self.expr_eq(f1, o, f2)
                    && a1.len() == a2.len()
                    && a1.iter().zip(a2).all(|(x, y)| self.expr_eq(x, o, y))
            }
            (E::ArrayLit(a1), E::ArrayLit(a2)) => {
                a1.len() == a2.len() && a1.iter().zip(a2).all(|(x, y)| self.expr_eq(x, o, y))
            }
            (E::MapLit(p1), E::MapLit(p2)) => {
                p1.len() == p2.len()
                    && p1
                        .iter()
                        .zip(p2)
                        .all(|((k1, v1), (k2, v2))| self.expr_eq(k1, o, k2) && self.expr_eq(v1, o, v2))
            }
            (E::Func(f1), E::Func(f2)) => self.func_eq(f1, o, f2),
            _ => false,
        }
    }
}

// ---- pretty printer (round-trip test support) ---------------------------

#[cfg(test)]
fn escape_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            _ => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
impl Ast {
    /// Prints the whole parse unit in a form that reparses to the same
    /// shape. Binary and unary expressions are fully parenthesized so no
    /// precedence information is lost.
    pub(crate) fn pretty(&self) -> String {
        let mut out = String::new();
        for f in &self.funcs {
            let _ = write!(out, "function {}", self.symbols.name(f.name));
            self.pretty_func_tail(&mut out, &f.func);
            out.push('\n');
        }
        out
    }

    fn pretty_func_tail(&self, out: &mut String, f: &FuncExpr) {
        out.push('(');
        for (i, p) in f.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(self.symbols.name(*p));
        }
        out.push_str(") ");
        self.pretty_block(out, &f.body);
    }

    fn pretty_block(&self, out: &mut String, block: &Block) {
        out.push_str("{ ");
        for stmt in &block.stmts {
            self.pretty_stmt(out, stmt);
            out.push(' ');
        }
        out.push('}');
    }

    fn pretty_stmt(&self, out: &mut String, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Empty => out.push(';'),
            StmtKind::VarDecl { var, val } => {
                let _ = write!(out, "var {}", self.symbols.name(*var));
                if let Some(e) = val {
                    out.push_str(" = ");
                    self.pretty_expr(out, e);
                }
                out.push(';');
            }
            StmtKind::Expr(e) => {
                self.pretty_expr(out, e);
                out.push(';');
            }
            StmtKind::Block(b) => self.pretty_block(out, b),
            StmtKind::Return(val) => {
                out.push_str("return");
                if let Some(e) = val {
                    out.push(' ');
                    self.pretty_expr(out, e);
                }
                out.push(';');
            }
            StmtKind::If { test, then, els } => {
                out.push_str("if (");
                self.pretty_expr(out, test);
                out.push_str(") ");
                self.pretty_stmt(out, then);
                if let Some(e) = els {
                    out.push_str(" else ");
                    self.pretty_stmt(out, e);
                }
            }
            StmtKind::While { test, body } => {
                out.push_str("while (");
                self.pretty_expr(out, test);
                out.push_str(") ");
                self.pretty_stmt(out, body);
            }
            StmtKind::Break => out.push_str("break;"),
            StmtKind::Continue => out.push_str("continue;"),
        }
    }

    fn pretty_expr(&self, out: &mut String, expr: &Expr) {
        match &expr.kind {
            ExprKind::Null => out.push_str("null"),
            ExprKind::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            ExprKind::Number(n) => out.push_str(&fmt_number(*n)),
            ExprKind::Str(id) => escape_string(out, self.string(*id)),
            ExprKind::Var(sym) => out.push_str(self.symbols.name(*sym)),
            ExprKind::Bin { op, left, right } => {
                out.push('(');
                self.pretty_expr(out, left);
                let name: &'static str = (*op).into();
                let _ = write!(out, " {name} ");
                self.pretty_expr(out, right);
                out.push(')');
            }
            ExprKind::Un { op, arg } => {
                out.push('(');
                let name: &'static str = (*op).into();
                out.push_str(name);
                self.pretty_expr(out, arg);
                out.push(')');
            }
            ExprKind::Index { container, index } => {
                self.pretty_expr(out, container);
                out.push('[');
                self.pretty_expr(out, index);
                out.push(']');
            }
            ExprKind::Call { func, args } => {
                self.pretty_expr(out, func);
                out.push('(');
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.pretty_expr(out, a);
                }
                out.push(')');
            }
            ExprKind::ArrayLit(elems) => {
                out.push('[');
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.pretty_expr(out, e);
                }
                out.push(']');
            }
            ExprKind::MapLit(pairs) => {
                out.push('{');
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.pretty_expr(out, k);
                    out.push_str(": ");
                    self.pretty_expr(out, v);
                }
                out.push('}');
            }
            ExprKind::Func(f) => {
                out.push_str("function ");
                self.pretty_func_tail(out, f);
            }
        }
    }
}
