//! The parser: recursive descent over the token stream from `front::lex`
//! producing the AST of `front::ast`. Grammar (see `SPEC_FULL.md` §4.0):
//!
//! ```text
//! program   := stmt*
//! stmt      := "PRINT" expr
//!            | "LET" VAR "=" expr
//!            | "IF" cond stmt* ("ELSE" stmt*)? "END" "IF"
//!            | "WHILE" cond stmt* "END" "WHILE"
//! cond      := expr ("<" | "=" | ">") expr
//! expr      := term (("+" | "-") term)*
//! term      := unary (("*" | "/") unary)*
//! unary     := "-" unary | primary
//! primary   := NUMBER | VAR | "(" expr ")"
//! ```
//!
//! Statements are separated by one or more newline tokens.

use thiserror::Error;

use super::ast::*;
use super::lex::{LexError, Lexer, Token, TokenKind};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("{0}")]
    Lex(#[from] LexError),
    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },
    #[error("unexpected token '{found}', expected {expected}")]
    UnexpectedToken { found: String, expected: &'static str },
}

pub fn parse(input: &str) -> Result<Program, ParseError> {
    let tokens = Lexer::tokenize(input)?;
    let mut parser = Parser::new(&tokens);
    let stmts = parser.parse_stmt_list(&[])?;
    parser.expect_eof()?;
    Ok(Program { stmts })
}

struct Parser<'t, 'src> {
    tokens: &'t [Token<'src>],
    pos: usize,
}

impl<'t, 'src> Parser<'t, 'src> {
    fn new(tokens: &'t [Token<'src>]) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token<'src>> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn advance(&mut self) -> Option<Token<'src>> {
        let tok = self.tokens.get(self.pos).copied();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, kind: TokenKind, expected: &'static str) -> Result<Token<'src>, ParseError> {
        match self.advance() {
            Some(tok) if tok.kind == kind => Ok(tok),
            Some(tok) => Err(ParseError::UnexpectedToken {
                found: tok.text.to_string(),
                expected,
            }),
            None => Err(ParseError::UnexpectedEof { expected }),
        }
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        self.skip_newlines();
        match self.peek() {
            None => Ok(()),
            Some(tok) => Err(ParseError::UnexpectedToken {
                found: tok.text.to_string(),
                expected: "end of input",
            }),
        }
    }

    fn skip_newlines(&mut self) {
        while matches!(self.peek_kind(), Some(TokenKind::Newline)) {
            self.pos += 1;
        }
    }

    /// Parse statements until EOF or until a token in `stop` is the next
    /// non-newline token (the stop token itself is left unconsumed).
    fn parse_stmt_list(&mut self, stop: &[TokenKind]) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        loop {
            self.skip_newlines();
            match self.peek_kind() {
                None => break,
                Some(k) if stop.contains(&k) => break,
                _ => {}
            }
            stmts.push(self.parse_stmt()?);
            match self.peek_kind() {
                None => break,
                Some(k) if stop.contains(&k) => break,
                Some(TokenKind::Newline) => self.skip_newlines(),
                Some(_) => {
                    // Allow a statement to be immediately followed by a stop
                    // token with no newline in between (e.g. `END IF` right
                    // after a single-statement branch).
                }
            }
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            Some(TokenKind::Print) => {
                self.advance();
                let expr = self.parse_expr()?;
                Ok(Stmt::Print(expr))
            }
            Some(TokenKind::Let) => {
                self.advance();
                let var_tok = self.expect(TokenKind::Var, "a variable (A-Z)")?;
                let name = var_tok
                    .text
                    .chars()
                    .next()
                    .expect("Var token text is one char");
                self.expect(TokenKind::Eq, "'='")?;
                let expr = self.parse_expr()?;
                Ok(Stmt::Let(name, expr))
            }
            Some(TokenKind::If) => {
                self.advance();
                let cond = self.parse_cond()?;
                let if_branch = self.parse_stmt_list(&[TokenKind::Else, TokenKind::End])?;
                let else_branch = if matches!(self.peek_kind(), Some(TokenKind::Else)) {
                    self.advance();
                    Some(self.parse_stmt_list(&[TokenKind::End])?)
                } else {
                    None
                };
                self.expect(TokenKind::End, "'END'")?;
                self.expect(TokenKind::If, "'IF' after 'END'")?;
                Ok(Stmt::If {
                    cond,
                    if_branch,
                    else_branch,
                })
            }
            Some(TokenKind::While) => {
                self.advance();
                let cond = self.parse_cond()?;
                let body = self.parse_stmt_list(&[TokenKind::End])?;
                self.expect(TokenKind::End, "'END'")?;
                self.expect(TokenKind::While, "'WHILE' after 'END'")?;
                Ok(Stmt::While { cond, body })
            }
            Some(_) => {
                let tok = self.advance().unwrap();
                Err(ParseError::UnexpectedToken {
                    found: tok.text.to_string(),
                    expected: "a statement (PRINT, LET, IF, or WHILE)",
                })
            }
            None => Err(ParseError::UnexpectedEof {
                expected: "a statement (PRINT, LET, IF, or WHILE)",
            }),
        }
    }

    fn parse_cond(&mut self) -> Result<Cond, ParseError> {
        let lhs = self.parse_expr()?;
        let op = match self.advance() {
            Some(Token {
                kind: TokenKind::Lt, ..
            }) => CmpOp::Lt,
            Some(Token {
                kind: TokenKind::Eq, ..
            }) => CmpOp::Eq,
            Some(Token {
                kind: TokenKind::Gt, ..
            }) => CmpOp::Gt,
            Some(tok) => {
                return Err(ParseError::UnexpectedToken {
                    found: tok.text.to_string(),
                    expected: "a comparison operator ('<', '=', or '>')",
                })
            }
            None => {
                return Err(ParseError::UnexpectedEof {
                    expected: "a comparison operator ('<', '=', or '>')",
                })
            }
        };
        let rhs = self.parse_expr()?;
        Ok(Cond { op, lhs, rhs })
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_term()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Plus) => ArithOp::Add,
                Some(TokenKind::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_term()?;
            lhs = Expr::bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek_kind() {
                Some(TokenKind::Mul) => ArithOp::Mul,
                Some(TokenKind::Div) => ArithOp::Div,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::bin(op, lhs, rhs);
        }
        Ok(lhs)
    }

    /// `- unary | primary`. A literal negative number folds directly to a
    /// negative `Num` leaf (so the folder always sees e.g. `Num(-1)` rather
    /// than a `Sub` tree, matching `compile.c`'s assumption that constant
    /// negation has already happened by the time the AST reaches the
    /// optimizer); negating a non-literal desugars to `0 - expr`, since the
    /// AST has no dedicated negation node (`spec.md` §3).
    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if matches!(self.peek_kind(), Some(TokenKind::Minus)) {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(match inner {
                Expr::Num(v) => Expr::Num(v.wrapping_neg()),
                other => Expr::bin(ArithOp::Sub, Expr::Num(0), other),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.advance() {
            Some(Token {
                kind: TokenKind::Num,
                text,
            }) => {
                let v: i64 = text.parse().map_err(|_| ParseError::UnexpectedToken {
                    found: text.to_string(),
                    expected: "a number literal that fits in 64 bits",
                })?;
                Ok(Expr::Num(v))
            }
            Some(Token {
                kind: TokenKind::Var,
                text,
            }) => Ok(Expr::Var(text.chars().next().expect("one char"))),
            Some(Token {
                kind: TokenKind::LParen,
                ..
            }) => {
                let inner = self.parse_expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            Some(tok) => Err(ParseError::UnexpectedToken {
                found: tok.text.to_string(),
                expected: "a number, a variable, or '('",
            }),
            None => Err(ParseError::UnexpectedEof {
                expected: "a number, a variable, or '('",
            }),
        }
    }
}
