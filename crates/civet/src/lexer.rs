//! The tokenizer.
//!
//! One token at a time from an in-memory source. Skips whitespace and
//! `#`-to-end-of-line comments; recognizes string literals with escapes,
//! decimal numbers with a single optional dot, identifiers and reserved
//! words, single-character punctuation, and multi-character operators
//! greedily matched against the operator table. Each token carries the
//! source location of its first byte.

use std::path::PathBuf;

use crate::{
    ast::{Ast, StrId},
    error::{Error, ErrorKind, SrcLoc},
    intern::SymbolId,
    operator,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Keyword {
    Include,
    Function,
    Return,
    Var,
    If,
    Else,
    While,
    Break,
    Continue,
}

const KEYWORDS: &[(&str, Keyword)] = &[
    ("include", Keyword::Include),
    ("function", Keyword::Function),
    ("return", Keyword::Return),
    ("var", Keyword::Var),
    ("if", Keyword::If),
    ("else", Keyword::Else),
    ("while", Keyword::While),
    ("break", Keyword::Break),
    ("continue", Keyword::Continue),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum TokenKind {
    Eof,
    Keyword(Keyword),
    Symbol(SymbolId),
    Str(StrId),
    Number(f64),
    Op(&'static str),
    Punct(u8),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub loc: SrcLoc,
}

impl Token {
    pub(crate) fn is_punct(&self, p: u8) -> bool {
        self.kind == TokenKind::Punct(p)
    }

    pub(crate) fn is_keyword(&self, kw: Keyword) -> bool {
        self.kind == TokenKind::Keyword(kw)
    }

    pub(crate) fn is_eof(&self) -> bool {
        self.kind == TokenKind::Eof
    }

    /// Short display form for "unexpected ..." diagnostics.
    pub(crate) fn describe(&self, ast: &Ast) -> String {
        match self.kind {
            TokenKind::Eof => "<end-of-file>".to_owned(),
            TokenKind::Keyword(kw) => KEYWORDS
                .iter()
                .find(|(_, k)| *k == kw)
                .map_or_else(String::new, |(name, _)| (*name).to_owned()),
            TokenKind::Symbol(sym) => ast.symbols.name(sym).to_owned(),
            TokenKind::Str(id) => format!("\"{}\"", ast.string(id)),
            TokenKind::Number(n) => crate::value::fmt_number(n),
            TokenKind::Op(name) => name.to_owned(),
            TokenKind::Punct(p) => char::from(p).to_string(),
        }
    }
}

fn is_alpha(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_alnum(c: u8) -> bool {
    is_alpha(c) || c.is_ascii_digit()
}

/// Tokenizer over one source; the parser keeps a stack of these, one per
/// active include.
#[derive(Debug)]
pub(crate) struct Lexer {
    src: Vec<u8>,
    pos: usize,
    /// Directory-bearing path of this source, used to resolve relative
    /// includes; in-memory sources have none.
    pub path: Option<PathBuf>,
    file_name: String,
    loc: SrcLoc,
}

impl Lexer {
    pub(crate) fn new(file_id: u16, file_name: String, path: Option<PathBuf>, text: &str) -> Self {
        Self {
            src: text.as_bytes().to_vec(),
            pos: 0,
            path,
            file_name,
            loc: SrcLoc::new(file_id, 1, 0),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        if b == b'\n' {
            self.loc.line = self.loc.line.saturating_add(1);
            self.loc.col = 0;
        } else {
            self.loc.col = self.loc.col.saturating_add(1);
        }
        Some(b)
    }

    fn error(&self, loc: SrcLoc, message: impl std::fmt::Display) -> Error {
        Error::at(ErrorKind::Lex, &self.file_name, loc, message)
    }

    /// Reads the next token, interning identifiers and string literals into
    /// the AST.
    pub(crate) fn read_token(&mut self, ast: &mut Ast) -> Result<Token, Error> {
        // skip whitespace and comments
        let c = loop {
            let Some(c) = self.bump() else {
                return Ok(Token {
                    kind: TokenKind::Eof,
                    loc: self.loc,
                });
            };
            match c {
                b' ' | b'\r' | b'\n' | b'\t' => {}
                b'#' => {
                    while let Some(c) = self.bump() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => break c,
            }
        };

        let loc = self.loc;

        // string literal
        if c == b'"' {
            let mut bytes = Vec::new();
            loop {
                let Some(c) = self.bump() else {
                    return Err(self.error(loc, "unterminated string"));
                };
                match c {
                    b'"' => break,
                    b'\\' => {
                        let esc_loc = self.loc;
                        let Some(e) = self.bump() else {
                            return Err(self.error(loc, "unterminated string"));
                        };
                        bytes.push(match e {
                            b'"' => b'"',
                            b'\\' => b'\\',
                            b'\'' => b'\'',
                            b'e' => 0x1b,
                            b'n' => b'\n',
                            b't' => b'\t',
                            b'r' => b'\r',
                            _ => return Err(self.error(esc_loc, "bad escape sequence")),
                        });
                    }
                    _ => bytes.push(c),
                }
            }
            let Ok(text) = std::str::from_utf8(&bytes) else {
                return Err(self.error(loc, "invalid utf-8 string"));
            };
            let id = ast.add_string(text);
            return Ok(Token {
                kind: TokenKind::Str(id),
                loc,
            });
        }

        // number: digits with at most one dot
        if c.is_ascii_digit() {
            let mut text = String::new();
            text.push(char::from(c));
            let mut got_point = false;
            while let Some(c) = self.peek() {
                if c == b'.' {
                    if got_point {
                        break;
                    }
                    got_point = true;
                } else if !c.is_ascii_digit() {
                    break;
                }
                text.push(char::from(c));
                self.bump();
            }
            let Ok(num) = text.parse::<f64>() else {
                return Err(self.error(loc, "invalid number"));
            };
            return Ok(Token {
                kind: TokenKind::Number(num),
                loc,
            });
        }

        // keyword or identifier
        if is_alpha(c) {
            let mut text = String::new();
            text.push(char::from(c));
            while let Some(c) = self.peek() {
                if !is_alnum(c) {
                    break;
                }
                text.push(char::from(c));
                self.bump();
            }
            if let Some((_, kw)) = KEYWORDS.iter().find(|(name, _)| *name == text) {
                return Ok(Token {
                    kind: TokenKind::Keyword(*kw),
                    loc,
                });
            }
            let sym = ast.symbols.intern(&text);
            return Ok(Token {
                kind: TokenKind::Symbol(sym),
                loc,
            });
        }

        // punctuation
        if matches!(c, b',' | b'.' | b';' | b':' | b'(' | b')' | b'[' | b']' | b'{' | b'}') {
            return Ok(Token {
                kind: TokenKind::Punct(c),
                loc,
            });
        }

        // operator: consume greedily while the text can still become an
        // operator spelling, then require an exact match
        let mut text = String::new();
        text.push(char::from(c));
        while text.len() < 3 {
            let Some(next) = self.peek() else { break };
            let mut longer = text.clone();
            longer.push(char::from(next));
            if !operator::is_op_prefix(&longer) {
                break;
            }
            self.bump();
            text = longer;
        }
        if operator::is_op(&text) {
            // the table owns the spellings; re-borrow the static name
            let name = operator::binary_op(&text)
                .map(|o| o.name)
                .or_else(|| operator::prefix_op(&text).map(|o| o.name))
                .unwrap_or("?");
            return Ok(Token {
                kind: TokenKind::Op(name),
                loc,
            });
        }

        if (32..127).contains(&c) {
            Err(self.error(loc, format!("invalid character: '{}'", char::from(c))))
        } else {
            Err(self.error(loc, format!("invalid byte: 0x{c:02x}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(text: &str) -> Result<Vec<TokenKind>, Error> {
        let mut ast = Ast::new();
        let mut lx = Lexer::new(0, "test.cv".to_owned(), None, text);
        let mut out = Vec::new();
        loop {
            let tok = lx.read_token(&mut ast)?;
            if tok.is_eof() {
                return Ok(out);
            }
            out.push(tok.kind);
        }
    }

    #[test]
    fn basic_tokens() {
        let toks = lex_all("var x = 1.5; # comment\nx").unwrap();
        assert_eq!(toks.len(), 6);
        assert_eq!(toks[0], TokenKind::Keyword(Keyword::Var));
        assert_eq!(toks[2], TokenKind::Op("="));
        assert_eq!(toks[3], TokenKind::Number(1.5));
        assert_eq!(toks[4], TokenKind::Punct(b';'));
        assert_eq!(toks[1], toks[5], "same identifier interns to the same symbol");
    }

    #[test]
    fn greedy_operator_matching() {
        let toks = lex_all("a<=b == c<d >= !e && f || g").unwrap();
        let ops: Vec<_> = toks
            .iter()
            .filter_map(|t| match t {
                TokenKind::Op(name) => Some(*name),
                _ => None,
            })
            .collect();
        assert_eq!(ops, ["<=", "==", "<", ">=", "!", "&&", "||"]);
    }

    #[test]
    fn string_escapes() {
        let mut ast = Ast::new();
        let mut lx = Lexer::new(0, "test.cv".to_owned(), None, r#""a\tb\n\"q\"\e""#);
        let tok = lx.read_token(&mut ast).unwrap();
        let TokenKind::Str(id) = tok.kind else {
            panic!("expected string, got {tok:?}")
        };
        assert_eq!(ast.string(id), "a\tb\n\"q\"\x1b");
    }

    #[test]
    fn token_locations() {
        let mut ast = Ast::new();
        let mut lx = Lexer::new(0, "test.cv".to_owned(), None, "ab\n  cd");
        let t1 = lx.read_token(&mut ast).unwrap();
        let t2 = lx.read_token(&mut ast).unwrap();
        assert_eq!((t1.loc.line, t1.loc.col), (1, 1));
        assert_eq!((t2.loc.line, t2.loc.col), (2, 3));
    }

    #[test]
    fn failure_modes() {
        assert!(lex_all("\"abc").unwrap_err().message.contains("unterminated string"));
        assert!(lex_all(r#""a\q""#).unwrap_err().message.contains("bad escape"));
        assert!(lex_all("a @ b").unwrap_err().message.contains("invalid character: '@'"));
        assert!(lex_all("a & b").unwrap_err().message.contains("invalid character: '&'"));
        let err = lex_all("\"\\xff\"").unwrap_err();
        assert!(err.message.contains("bad escape"), "{}", err.message);
    }

    #[test]
    fn invalid_utf8_in_string() {
        let mut ast = Ast::new();
        // build a source with a raw 0xff byte inside a string literal
        let mut src = Vec::new();
        src.extend_from_slice(b"\"a");
        src.push(0xff);
        src.extend_from_slice(b"b\"");
        let mut lx = Lexer::new(0, "test.cv".to_owned(), None, "");
        lx.src = src;
        let err = lx.read_token(&mut Ast::new()).unwrap_err();
        assert!(err.message.contains("invalid utf-8 string"), "{}", err.message);
    }

    #[test]
    fn number_with_two_dots_stops_at_second() {
        let toks = lex_all("1.5.2").unwrap();
        assert_eq!(toks[0], TokenKind::Number(1.5));
        assert_eq!(toks[1], TokenKind::Punct(b'.'));
        assert_eq!(toks[2], TokenKind::Number(2.0));
    }
}
