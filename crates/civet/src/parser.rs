//! The parser.
//!
//! The top level is a sequence of `function NAME(params) { ... }`
//! declarations and `include "file"` directives. Statements are parsed by
//! recursive descent; expressions use explicit operand and operator stacks
//! driven by the operator table's precedences and a stop-character set,
//! which makes the same routine reusable for argument lists, array
//! elements and map entries.
//!
//! An include pushes a new tokenizer onto a stack; end-of-file in a nested
//! source pops it silently. Relative include paths resolve against the
//! directory of the including file.

use std::path::PathBuf;

use crate::{
    ast::{Ast, Block, Expr, ExprKind, FuncExpr, NamedFunc, Stmt, StmtKind},
    error::{Error, ErrorKind, SrcLoc},
    lexer::{Keyword, Lexer, Token, TokenKind},
    operator::{self, Assoc, BinOp, FUNC_CALL_PREC, Operator, UnOp},
};

/// What to parse: a script file or in-memory text.
#[derive(Debug)]
pub(crate) enum Source {
    File(PathBuf),
    Str { name: String, text: String },
}

/// Maximum formal parameters per function.
const MAX_PARAMS: usize = 64;

/// Parses one source into an AST, registering file names (the main source
/// and every include) into the program-wide file table.
pub(crate) fn parse(files: &mut Vec<String>, source: Source) -> Result<Ast, Error> {
    let mut parser = Parser {
        files,
        ast: Ast::new(),
        lexers: Vec::new(),
        saved: None,
        last_loc: SrcLoc::default(),
    };
    parser.push_source(source, SrcLoc::default())?;
    parser.parse_top_level()?;
    Ok(parser.ast)
}

#[derive(Debug, Clone, Copy)]
enum OprEntry {
    Bin(&'static Operator<BinOp>),
    Un(&'static Operator<UnOp>),
}

struct Parser<'a> {
    files: &'a mut Vec<String>,
    ast: Ast,
    lexers: Vec<Lexer>,
    saved: Option<Token>,
    last_loc: SrcLoc,
}

impl Parser<'_> {
    fn file_name(&self, loc: SrcLoc) -> &str {
        self.files.get(loc.file as usize).map_or("<unknown>", String::as_str)
    }

    fn error(&self, loc: SrcLoc, message: impl std::fmt::Display) -> Error {
        Error::at(ErrorKind::Parse, self.file_name(loc), loc, message)
    }

    fn error_expected(&self, loc: SrcLoc, expected: &str) -> Error {
        self.error(loc, format!("expected {expected}"))
    }

    fn push_source(&mut self, source: Source, loc: SrcLoc) -> Result<(), Error> {
        let (name, path, text) = match source {
            Source::File(path) => {
                let name = path.display().to_string();
                let text = std::fs::read_to_string(&path)
                    .map_err(|_| self.error(loc, format!("can't open file '{name}'")))?;
                (name, Some(path), text)
            }
            Source::Str { name, text } => (name, None, text),
        };
        let file_id = u16::try_from(self.files.len())
            .map_err(|_| self.error(loc, "too many source files"))?;
        self.files.push(name.clone());
        self.lexers.push(Lexer::new(file_id, name, path, &text));
        Ok(())
    }

    fn next_token(&mut self) -> Result<Token, Error> {
        if let Some(tok) = self.saved.take() {
            self.last_loc = tok.loc;
            return Ok(tok);
        }
        loop {
            let Some(lx) = self.lexers.last_mut() else {
                return Ok(Token {
                    kind: TokenKind::Eof,
                    loc: self.last_loc,
                });
            };
            let tok = lx.read_token(&mut self.ast)?;
            if tok.is_eof() {
                self.lexers.pop();
                if self.lexers.is_empty() {
                    return Ok(tok);
                }
                continue;
            }
            self.last_loc = tok.loc;
            return Ok(tok);
        }
    }

    fn unget(&mut self, tok: Token) {
        debug_assert!(self.saved.is_none(), "token pushback buffer full");
        self.saved = Some(tok);
    }

    // ---- top level -----------------------------------------------------

    fn parse_top_level(&mut self) -> Result<(), Error> {
        loop {
            let tok = self.next_token()?;
            if tok.is_eof() {
                return Ok(());
            }
            if tok.is_keyword(Keyword::Include) {
                self.process_include()?;
                continue;
            }
            if tok.is_keyword(Keyword::Function) {
                let func = self.parse_named_func(tok.loc)?;
                self.ast.funcs.push(func);
                continue;
            }
            return Err(self.error(tok.loc, format!("unexpected '{}'", tok.describe(&self.ast))));
        }
    }

    fn process_include(&mut self) -> Result<(), Error> {
        let tok = self.next_token()?;
        let TokenKind::Str(id) = tok.kind else {
            return Err(self.error_expected(tok.loc, "string"));
        };
        let name = self.ast.string(id).to_owned();
        let mut path = PathBuf::from(&name);
        if path.is_relative()
            && let Some(dir) = self.lexers.last().and_then(|lx| lx.path.as_ref()).and_then(|p| p.parent())
        {
            path = dir.join(&path);
        }
        self.push_source(Source::File(path), tok.loc)
    }

    fn parse_named_func(&mut self, loc: SrcLoc) -> Result<NamedFunc, Error> {
        let tok = self.next_token()?;
        let TokenKind::Symbol(name) = tok.kind else {
            return Err(self.error_expected(tok.loc, "function name"));
        };
        let func = self.parse_func(loc)?;
        Ok(NamedFunc { name, loc, func })
    }

    /// Parses `( params ) { body }`, after the `function` keyword (and any
    /// name) has been consumed.
    fn parse_func(&mut self, loc: SrcLoc) -> Result<FuncExpr, Error> {
        let tok = self.next_token()?;
        if !tok.is_punct(b'(') {
            return Err(self.error_expected(tok.loc, "'('"));
        }
        let mut params = Vec::new();
        let mut tok = self.next_token()?;
        if !tok.is_punct(b')') {
            loop {
                let TokenKind::Symbol(sym) = tok.kind else {
                    return Err(self.error_expected(tok.loc, "name"));
                };
                if params.len() >= MAX_PARAMS {
                    return Err(self.error(tok.loc, "too many parameters"));
                }
                params.push(sym);
                tok = self.next_token()?;
                if tok.is_punct(b')') {
                    break;
                }
                if !tok.is_punct(b',') {
                    return Err(self.error_expected(tok.loc, "')' or ','"));
                }
                tok = self.next_token()?;
            }
        }
        let body = self.parse_block()?;
        Ok(FuncExpr { params, body, loc })
    }

    // ---- statements ----------------------------------------------------

    fn parse_block(&mut self) -> Result<Block, Error> {
        let tok = self.next_token()?;
        if !tok.is_punct(b'{') {
            return Err(self.error_expected(tok.loc, "'{'"));
        }
        let mut stmts = Vec::new();
        loop {
            let tok = self.next_token()?;
            if tok.is_punct(b'}') {
                return Ok(Block { stmts });
            }
            self.unget(tok);
            stmts.push(self.parse_stmt()?);
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, Error> {
        let tok = self.next_token()?;
        let loc = tok.loc;

        if tok.is_keyword(Keyword::If) {
            return self.parse_stmt_if(loc);
        }
        if tok.is_keyword(Keyword::While) {
            return self.parse_stmt_while(loc);
        }
        if tok.is_punct(b';') {
            return Ok(Stmt { kind: StmtKind::Empty, loc });
        }
        if tok.is_keyword(Keyword::Break) {
            self.expect_semicolon()?;
            return Ok(Stmt { kind: StmtKind::Break, loc });
        }
        if tok.is_keyword(Keyword::Continue) {
            self.expect_semicolon()?;
            return Ok(Stmt { kind: StmtKind::Continue, loc });
        }
        if tok.is_keyword(Keyword::Var) {
            let tok = self.next_token()?;
            let TokenKind::Symbol(var) = tok.kind else {
                return Err(self.error_expected(tok.loc, "variable name"));
            };
            let tok = self.next_token()?;
            let val = if tok.is_punct(b';') {
                None
            } else if tok.kind == TokenKind::Op("=") {
                Some(Box::new(self.parse_expr(true, b";")?))
            } else {
                return Err(self.error_expected(tok.loc, "'=' or ';'"));
            };
            return Ok(Stmt { kind: StmtKind::VarDecl { var, val }, loc });
        }
        if tok.is_punct(b'{') {
            self.unget(tok);
            let block = self.parse_block()?;
            return Ok(Stmt { kind: StmtKind::Block(block), loc });
        }
        if tok.is_keyword(Keyword::Return) {
            let tok = self.next_token()?;
            let val = if tok.is_punct(b';') {
                None
            } else {
                self.unget(tok);
                Some(Box::new(self.parse_expr(true, b";")?))
            };
            return Ok(Stmt { kind: StmtKind::Return(val), loc });
        }

        self.unget(tok);
        let expr = self.parse_expr(true, b";")?;
        Ok(Stmt { kind: StmtKind::Expr(Box::new(expr)), loc })
    }

    fn expect_semicolon(&mut self) -> Result<(), Error> {
        let tok = self.next_token()?;
        if tok.is_punct(b';') { Ok(()) } else { Err(self.error_expected(tok.loc, "';'")) }
    }

    fn parse_stmt_if(&mut self, loc: SrcLoc) -> Result<Stmt, Error> {
        let tok = self.next_token()?;
        if !tok.is_punct(b'(') {
            return Err(self.error_expected(tok.loc, "'('"));
        }
        let test = Box::new(self.parse_expr(true, b")")?);
        let then = Box::new(self.parse_stmt()?);
        let tok = self.next_token()?;
        let els = if tok.is_keyword(Keyword::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            self.unget(tok);
            None
        };
        Ok(Stmt { kind: StmtKind::If { test, then, els }, loc })
    }

    fn parse_stmt_while(&mut self, loc: SrcLoc) -> Result<Stmt, Error> {
        let tok = self.next_token()?;
        if !tok.is_punct(b'(') {
            return Err(self.error_expected(tok.loc, "'('"));
        }
        let test = Box::new(self.parse_expr(true, b")")?);
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt { kind: StmtKind::While { test, body }, loc })
    }

    // ---- expressions ---------------------------------------------------

    /// Reduces the operator stack while its top has precedence at or above
    /// `stop_prec` (right-associative operators reduce one step later).
    fn resolve_stack(
        &self,
        opns: &mut Vec<Expr>,
        oprs: &mut Vec<(OprEntry, SrcLoc)>,
        stop_prec: i32,
        loc: SrcLoc,
    ) -> Result<(), Error> {
        while let Some(&(entry, op_loc)) = oprs.last() {
            let (prec, assoc) = match entry {
                OprEntry::Bin(o) => (o.prec, o.assoc),
                OprEntry::Un(o) => (o.prec, o.assoc),
            };
            let effective = if assoc == Assoc::Right { prec - 1 } else { prec };
            if effective < stop_prec {
                return Ok(());
            }
            oprs.pop();
            match entry {
                OprEntry::Bin(o) => {
                    let right = opns.pop().ok_or_else(|| self.error(loc, "syntax error"))?;
                    let left = opns.pop().ok_or_else(|| self.error(loc, "syntax error"))?;
                    opns.push(Expr {
                        kind: ExprKind::Bin { op: o.op, left: Box::new(left), right: Box::new(right) },
                        loc: op_loc,
                    });
                }
                OprEntry::Un(o) => {
                    let arg = opns.pop().ok_or_else(|| self.error(loc, "syntax error"))?;
                    opns.push(Expr {
                        kind: ExprKind::Un { op: o.op, arg: Box::new(arg) },
                        loc: op_loc,
                    });
                }
            }
        }
        Ok(())
    }

    /// Parses one expression up to a stop character.
    ///
    /// The stop token is consumed when `consume_stop` is set, pushed back
    /// otherwise. On the stop, all pending operators reduce and exactly one
    /// operand must remain.
    fn parse_expr(&mut self, consume_stop: bool, stops: &[u8]) -> Result<Expr, Error> {
        let mut opns: Vec<Expr> = Vec::new();
        let mut oprs: Vec<(OprEntry, SrcLoc)> = Vec::new();
        let mut expect_opn = true;

        loop {
            let tok = self.next_token()?;

            // ( grouped expression or call
            if tok.is_punct(b'(') {
                if expect_opn {
                    let expr = self.parse_expr(true, b")")?;
                    opns.push(expr);
                    expect_opn = false;
                } else {
                    self.resolve_stack(&mut opns, &mut oprs, FUNC_CALL_PREC, tok.loc)?;
                    let func = opns
                        .pop()
                        .ok_or_else(|| self.error(tok.loc, "syntax error (no function on stack)"))?;
                    let args = self.parse_call_args()?;
                    let loc = func.loc;
                    opns.push(Expr {
                        kind: ExprKind::Call { func: Box::new(func), args },
                        loc,
                    });
                }
                continue;
            }

            // stop character
            if let TokenKind::Punct(p) = tok.kind
                && stops.contains(&p)
            {
                if !consume_stop {
                    self.unget(tok);
                }
                self.resolve_stack(&mut opns, &mut oprs, i32::MIN, tok.loc)?;
                if opns.len() > 1 {
                    return Err(self.error(tok.loc, "syntax error (operands left on stack)"));
                }
                return opns
                    .pop()
                    .ok_or_else(|| self.error(tok.loc, format!("unexpected '{}'", tok.describe(&self.ast))));
            }

            // .name index sugar
            if tok.is_punct(b'.') {
                if expect_opn {
                    return Err(self.error(tok.loc, "unexpected '.'"));
                }
                let tok = self.next_token()?;
                let TokenKind::Symbol(sym) = tok.kind else {
                    return Err(self.error_expected(tok.loc, "name"));
                };
                let key = self.ast.symbols.name(sym).to_owned();
                let str_id = self.ast.add_string(&key);
                self.resolve_stack(&mut opns, &mut oprs, FUNC_CALL_PREC, tok.loc)?;
                let container = opns
                    .pop()
                    .ok_or_else(|| self.error(tok.loc, "syntax error (no container on stack)"))?;
                let loc = container.loc;
                opns.push(Expr {
                    kind: ExprKind::Index {
                        container: Box::new(container),
                        index: Box::new(Expr { kind: ExprKind::Str(str_id), loc: tok.loc }),
                    },
                    loc,
                });
                continue;
            }

            // [ array literal or index
            if tok.is_punct(b'[') {
                if expect_opn {
                    let elems = self.parse_array_literal()?;
                    opns.push(Expr { kind: ExprKind::ArrayLit(elems), loc: tok.loc });
                    expect_opn = false;
                } else {
                    self.resolve_stack(&mut opns, &mut oprs, FUNC_CALL_PREC, tok.loc)?;
                    let container = opns
                        .pop()
                        .ok_or_else(|| self.error(tok.loc, "syntax error (no container on stack)"))?;
                    let index = self.parse_expr(true, b"]")?;
                    let loc = container.loc;
                    opns.push(Expr {
                        kind: ExprKind::Index { container: Box::new(container), index: Box::new(index) },
                        loc,
                    });
                }
                continue;
            }

            // { map literal
            if tok.is_punct(b'{') {
                if !expect_opn {
                    return Err(self.error(tok.loc, "unexpected '{'"));
                }
                let pairs = self.parse_map_literal()?;
                opns.push(Expr { kind: ExprKind::MapLit(pairs), loc: tok.loc });
                expect_opn = false;
                continue;
            }

            // operator
            if let TokenKind::Op(name) = tok.kind {
                if expect_opn {
                    let Some(op) = operator::prefix_op(name) else {
                        return Err(self.error(tok.loc, format!("unexpected '{name}'")));
                    };
                    oprs.push((OprEntry::Un(op), tok.loc));
                } else {
                    let Some(op) = operator::binary_op(name) else {
                        return Err(self.error_expected(tok.loc, "'(' or binary operator"));
                    };
                    self.resolve_stack(&mut opns, &mut oprs, op.prec, tok.loc)?;
                    oprs.push((OprEntry::Bin(op), tok.loc));
                    expect_opn = true;
                }
                continue;
            }

            // number
            if let TokenKind::Number(n) = tok.kind {
                if !expect_opn {
                    return Err(self.error_expected(tok.loc, "'(' or operator"));
                }
                opns.push(Expr { kind: ExprKind::Number(n), loc: tok.loc });
                expect_opn = false;
                continue;
            }

            // string
            if let TokenKind::Str(id) = tok.kind {
                if !expect_opn {
                    return Err(self.error_expected(tok.loc, "'(' or operator"));
                }
                opns.push(Expr { kind: ExprKind::Str(id), loc: tok.loc });
                expect_opn = false;
                continue;
            }

            // symbol, or the null/true/false literals
            if let TokenKind::Symbol(sym) = tok.kind {
                if !expect_opn {
                    return Err(self.error_expected(tok.loc, "'(' or operator"));
                }
                let kind = match self.ast.symbols.name(sym) {
                    "null" => ExprKind::Null,
                    "true" => ExprKind::Bool(true),
                    "false" => ExprKind::Bool(false),
                    _ => ExprKind::Var(sym),
                };
                opns.push(Expr { kind, loc: tok.loc });
                expect_opn = false;
                continue;
            }

            // anonymous function
            if tok.is_keyword(Keyword::Function) {
                if !expect_opn {
                    return Err(self.error_expected(tok.loc, "'(' or operator"));
                }
                let func = self.parse_func(tok.loc)?;
                opns.push(Expr { kind: ExprKind::Func(Box::new(func)), loc: tok.loc });
                expect_opn = false;
                continue;
            }

            return Err(self.error(tok.loc, format!("unexpected '{}'", tok.describe(&self.ast))));
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, Error> {
        let tok = self.next_token()?;
        if tok.is_punct(b')') {
            return Ok(Vec::new());
        }
        self.unget(tok);
        let mut args = Vec::new();
        loop {
            args.push(self.parse_expr(false, b",)")?);
            let tok = self.next_token()?;
            if tok.is_punct(b')') {
                return Ok(args);
            }
            if !tok.is_punct(b',') {
                return Err(self.error_expected(tok.loc, "',' or ')'"));
            }
        }
    }

    fn parse_array_literal(&mut self) -> Result<Vec<Expr>, Error> {
        let tok = self.next_token()?;
        if tok.is_punct(b']') {
            return Ok(Vec::new());
        }
        self.unget(tok);
        let mut elems = Vec::new();
        loop {
            elems.push(self.parse_expr(false, b",]")?);
            let tok = self.next_token()?;
            if tok.is_punct(b']') {
                return Ok(elems);
            }
            if !tok.is_punct(b',') {
                return Err(self.error_expected(tok.loc, "',' or ']'"));
            }
            // trailing comma
            let tok = self.next_token()?;
            if tok.is_punct(b']') {
                return Ok(elems);
            }
            self.unget(tok);
        }
    }

    fn parse_map_literal(&mut self) -> Result<Vec<(Expr, Expr)>, Error> {
        let tok = self.next_token()?;
        if tok.is_punct(b'}') {
            return Ok(Vec::new());
        }
        self.unget(tok);
        let mut pairs = Vec::new();
        loop {
            let key = self.parse_expr(true, b":")?;
            let value = self.parse_expr(false, b",}")?;
            pairs.push((key, value));
            let tok = self.next_token()?;
            if tok.is_punct(b'}') {
                return Ok(pairs);
            }
            if !tok.is_punct(b',') {
                return Err(self.error_expected(tok.loc, "',' or '}'"));
            }
            // trailing comma
            let tok = self.next_token()?;
            if tok.is_punct(b'}') {
                return Ok(pairs);
            }
            self.unget(tok);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse_str(text: &str) -> Result<Ast, Error> {
        let mut files = Vec::new();
        parse(
            &mut files,
            Source::Str { name: "test.cv".to_owned(), text: text.to_owned() },
        )
    }

    #[test]
    fn precedence_shapes() {
        let ast = parse_str("function f() { return 1 + 2 * 3 < 4 && 5; }").unwrap();
        let expected = parse_str("function f() { return (((1 + (2 * 3)) < 4) && 5); }").unwrap();
        assert!(ast.same_shape(&expected));
    }

    #[test]
    fn right_associative_assignment() {
        let ast = parse_str("function f(a, b) { a = b = 1; }").unwrap();
        let expected = parse_str("function f(a, b) { (a = (b = 1)); }").unwrap();
        assert!(ast.same_shape(&expected));
    }

    #[test]
    fn dot_is_string_index() {
        let ast = parse_str("function f(m) { return m.key; }").unwrap();
        let expected = parse_str("function f(m) { return m[\"key\"]; }").unwrap();
        assert!(ast.same_shape(&expected));
    }

    #[test]
    fn calls_indexing_and_literals() {
        let ast = parse_str(
            "function f(g, a) { return g(a[0], [1, 2,], { \"k\": 3, 4: g, })[1]; }",
        );
        assert!(ast.is_ok(), "{ast:?}");
    }

    #[test]
    fn unary_binds_tighter_than_binary() {
        let ast = parse_str("function f(a, b) { return -a + !b; }").unwrap();
        let expected = parse_str("function f(a, b) { return ((-a) + (!b)); }").unwrap();
        assert!(ast.same_shape(&expected));
    }

    #[test]
    fn pretty_print_round_trips() {
        let src = "
            function make_counter() {
              var n = 0;
              return function() { n = n + 1; return n; };
            }
            function main(args) {
              var total = 0; var i = 0;
              var m = { \"a\": [1, 2, 3], 2: \"two\" };
              while (i < len(m.a)) {
                if (m.a[i] > 1) total = total + m.a[i]; else { total = total - 1; continue; }
                i = i + 1;
                if (!(total < 100)) break;
              }
              return total * -1;
            }
        ";
        let ast = parse_str(src).unwrap();
        let printed = ast.pretty();
        let reparsed = parse_str(&printed).unwrap_or_else(|e| panic!("pretty output failed to parse: {e}\n{printed}"));
        assert!(ast.same_shape(&reparsed), "round-trip changed the tree:\n{printed}");
        // printing is a fixpoint after one round
        assert_eq!(printed, reparsed.pretty());
    }

    #[test]
    fn anonymous_function_call() {
        let ast = parse_str("function f() { return (function(x) { return x; })(7); }");
        assert!(ast.is_ok(), "{ast:?}");
    }

    #[test]
    fn error_messages_carry_locations() {
        let err = parse_str("function f() { var 1; }").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Parse);
        assert!(err.message.starts_with("test.cv:1:"), "{}", err.message);
        assert!(err.message.contains("expected variable name"));
    }

    #[test]
    fn expected_token_hints() {
        assert!(parse_str("function f( { }").unwrap_err().message.contains("expected name"));
        assert!(parse_str("function f() { if 1; }").unwrap_err().message.contains("expected '('"));
        assert!(parse_str("function f() { break }").unwrap_err().message.contains("expected ';'"));
        assert!(parse_str("var x;").unwrap_err().message.contains("unexpected 'var'"));
        assert!(parse_str("function f() { return 1 + ; }").unwrap_err().message.contains("unexpected"));
    }

    #[test]
    fn too_many_parameters() {
        let params: Vec<String> = (0..65).map(|i| format!("p{i}")).collect();
        let src = format!("function f({}) {{ }}", params.join(", "));
        let err = parse_str(&src).unwrap_err();
        assert!(err.message.contains("too many parameters"), "{}", err.message);
    }

    #[test]
    fn empty_operand_positions_are_errors() {
        assert!(parse_str("function f() { ; }").is_ok());
        assert!(parse_str("function f() { (); }").is_err());
        assert!(parse_str("function f(g) { g(,); }").is_err());
    }
}
