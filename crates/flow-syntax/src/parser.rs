//! Recursive-descent parser producing the block tree.

use serde_json::Value;

use crate::ast::{Attribute, Block, File, Stmt};
use crate::token::{lex, line_col, Token, TokenKind};

/// An unevaluated expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal value.
    Literal(Value),
    /// A dotted reference to a scope variable, e.g. `counter.c.out`.
    Reference(Vec<String>),
    /// An array of expressions.
    Array(Vec<Expr>),
}

/// Parse errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// The lexer hit an invalid character or literal.
    #[error("{what} at {line}:{column}")]
    Lex {
        /// Description of the invalid input.
        what: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },

    /// A string or comment was not terminated.
    #[error("unterminated {what} starting at {line}:{column}")]
    Unterminated {
        /// What was left open.
        what: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },

    /// The parser expected something else.
    #[error("expected {expected} at {line}:{column}")]
    Unexpected {
        /// What was expected instead.
        expected: String,
        /// 1-based line.
        line: usize,
        /// 1-based column.
        column: usize,
    },
}

/// Parse a full source file into a block tree.
///
/// # Errors
///
/// Returns a [`ParseError`] describing the first malformed construct; no
/// partial tree is produced.
pub fn parse_file(src: &str) -> Result<File, ParseError> {
    let tokens = lex(src)?;
    let mut parser = Parser { src, tokens, pos: 0 };
    let body = parser.parse_body(true)?;
    Ok(File { body })
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn peek_at(&self, n: usize) -> &TokenKind {
        self.tokens
            .get(self.pos + n)
            .map_or(&TokenKind::Eof, |t| &t.kind)
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        let (line, column) = line_col(self.src, self.peek().offset);
        ParseError::Unexpected { expected: expected.to_string(), line, column }
    }

    /// Parse statements until `}` (or EOF when `top_level`).
    fn parse_body(&mut self, top_level: bool) -> Result<Vec<Stmt>, ParseError> {
        let mut body = Vec::new();
        loop {
            match &self.peek().kind {
                TokenKind::Eof => {
                    if top_level {
                        return Ok(body);
                    }
                    return Err(self.unexpected("`}`"));
                }
                TokenKind::RCurly if !top_level => return Ok(body),
                TokenKind::Ident(_) => body.push(self.parse_stmt()?),
                _ => return Err(self.unexpected("attribute or block")),
            }
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        // Both attributes and blocks start with an identifier; one token of
        // lookahead disambiguates.
        if *self.peek_at(1) == TokenKind::Assign {
            let token = self.bump();
            let TokenKind::Ident(name) = token.kind else {
                return Err(self.unexpected("attribute name"));
            };
            self.bump(); // `=`
            let value = self.parse_expr()?;
            return Ok(Stmt::Attribute(Attribute { name, value, offset: token.offset }));
        }
        self.parse_block().map(Stmt::Block)
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        let first = self.bump();
        let TokenKind::Ident(head) = first.kind else {
            return Err(self.unexpected("block name"));
        };
        let mut name = vec![head];
        while self.peek().kind == TokenKind::Dot {
            self.bump();
            match self.bump().kind {
                TokenKind::Ident(segment) => name.push(segment),
                _ => return Err(self.unexpected("name segment after `.`")),
            }
        }

        let label = match &self.peek().kind {
            TokenKind::Str(label) => {
                let label = label.clone();
                self.bump();
                Some(label)
            }
            _ => None,
        };

        if self.peek().kind != TokenKind::LCurly {
            return Err(self.unexpected("`{`"));
        }
        let lcurly = self.bump().offset;
        let body = self.parse_body(false)?;
        if self.peek().kind != TokenKind::RCurly {
            return Err(self.unexpected("`}`"));
        }
        let rcurly = self.bump().offset;

        Ok(Block { name, label, body, lcurly, rcurly, offset: first.offset })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        match self.peek().kind.clone() {
            TokenKind::Minus => {
                self.bump();
                match self.bump().kind {
                    TokenKind::Int(v) => Ok(Expr::Literal(Value::from(-v))),
                    TokenKind::Float(v) => Ok(Expr::Literal(Value::from(-v))),
                    _ => Err(self.unexpected("numeric literal after `-`")),
                }
            }
            TokenKind::Int(v) => {
                self.bump();
                Ok(Expr::Literal(Value::from(v)))
            }
            TokenKind::Float(v) => {
                self.bump();
                Ok(Expr::Literal(Value::from(v)))
            }
            TokenKind::Str(v) => {
                self.bump();
                Ok(Expr::Literal(Value::from(v)))
            }
            TokenKind::Bool(v) => {
                self.bump();
                Ok(Expr::Literal(Value::from(v)))
            }
            TokenKind::Null => {
                self.bump();
                Ok(Expr::Literal(Value::Null))
            }
            TokenKind::LBracket => {
                self.bump();
                let mut items = Vec::new();
                loop {
                    if self.peek().kind == TokenKind::RBracket {
                        self.bump();
                        break;
                    }
                    items.push(self.parse_expr()?);
                    match self.peek().kind {
                        TokenKind::Comma => {
                            self.bump();
                        }
                        TokenKind::RBracket => {}
                        _ => return Err(self.unexpected("`,` or `]`")),
                    }
                }
                Ok(Expr::Array(items))
            }
            TokenKind::Ident(head) => {
                self.bump();
                let mut path = vec![head];
                while self.peek().kind == TokenKind::Dot {
                    self.bump();
                    match self.bump().kind {
                        TokenKind::Ident(segment) => path.push(segment),
                        _ => return Err(self.unexpected("reference segment after `.`")),
                    }
                }
                Ok(Expr::Reference(path))
            }
            _ => Err(self.unexpected("expression")),
        }
    }
}
