//! The lexer.

use derive_more::Display;
use regex::Regex;
use thiserror::Error;

/// Tokens in the program.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display)]
#[display("kind: '{kind}', part of input: '{text}'")]
pub struct Token<'src> {
    /// What token class this token belongs to.
    pub kind: TokenKind,
    /// What part of the input this token carries.
    pub text: &'src str,
}

/// Token classes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Display, Debug)]
pub enum TokenKind {
    #[display("var")]
    Var,
    #[display("num")]
    Num,
    #[display("PRINT")]
    Print,
    #[display("LET")]
    Let,
    #[display("IF")]
    If,
    #[display("ELSE")]
    Else,
    #[display("END")]
    End,
    #[display("WHILE")]
    While,
    #[display("=")]
    Eq,
    #[display("<")]
    Lt,
    #[display(">")]
    Gt,
    #[display("+")]
    Plus,
    #[display("-")]
    Minus,
    #[display("*")]
    Mul,
    #[display("/")]
    Div,
    #[display("(")]
    LParen,
    #[display(")")]
    RParen,
    #[display("newline")]
    Newline,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("unexpected character {1:?} at offset {0}")]
pub struct LexError(pub usize, pub char);

pub struct Lexer<'input> {
    input: &'input str,
    pos: usize,
    whitespace: Regex,
    matchers: Vec<(Regex, TokenKind)>,
}

impl<'input> Lexer<'input> {
    pub fn new(input: &'input str) -> Self {
        // Order matters: keywords must be tried before the single-letter
        // `Var` pattern so `PRINT` isn't lexed as five one-letter variable
        // references, and `\b` after every alphabetic pattern keeps
        // multi-letter garbage (e.g. `PRINTX`) from silently matching a
        // keyword prefix.
        let matchers = vec![
            (Regex::new(r"\A\n").unwrap(), TokenKind::Newline),
            (Regex::new(r"\APRINT\b").unwrap(), TokenKind::Print),
            (Regex::new(r"\ALET\b").unwrap(), TokenKind::Let),
            (Regex::new(r"\AIF\b").unwrap(), TokenKind::If),
            (Regex::new(r"\AELSE\b").unwrap(), TokenKind::Else),
            (Regex::new(r"\AEND\b").unwrap(), TokenKind::End),
            (Regex::new(r"\AWHILE\b").unwrap(), TokenKind::While),
            (Regex::new(r"\A[0-9]+").unwrap(), TokenKind::Num),
            (Regex::new(r"\A[A-Z]\b").unwrap(), TokenKind::Var),
            (Regex::new(r"\A=").unwrap(), TokenKind::Eq),
            (Regex::new(r"\A<").unwrap(), TokenKind::Lt),
            (Regex::new(r"\A>").unwrap(), TokenKind::Gt),
            (Regex::new(r"\A\+").unwrap(), TokenKind::Plus),
            (Regex::new(r"\A-").unwrap(), TokenKind::Minus),
            (Regex::new(r"\A\*").unwrap(), TokenKind::Mul),
            (Regex::new(r"\A/").unwrap(), TokenKind::Div),
            (Regex::new(r"\A\(").unwrap(), TokenKind::LParen),
            (Regex::new(r"\A\)").unwrap(), TokenKind::RParen),
        ];
        Lexer {
            input,
            pos: 0,
            // Newlines are significant (they separate statements), so they
            // are excluded from the whitespace class, unlike the teacher's
            // original whitespace regex.
            whitespace: Regex::new(r"\A(?:[ \t\r]|(?://[^\n]*))*").unwrap(),
            matchers,
        }
    }

    /// Has the lexer reached the end of input?
    pub fn end_of_input(&self) -> bool {
        self.pos == self.input.len()
    }

    // Skip comments and whitespace (not newlines).
    fn skip_whitespace(&mut self) {
        if let Some(m) = self.whitespace.find(&self.input[self.pos..]) {
            self.pos += m.end()
        }
    }

    /// Get the next token if possible.
    ///
    /// The return type distinguishes between end-of-input and lexer error.
    pub fn next(&mut self) -> Result<Option<Token<'input>>, LexError> {
        self.skip_whitespace();
        if self.end_of_input() {
            return Ok(None);
        }

        let rest = &self.input[self.pos..];
        for (re, kind) in &self.matchers {
            if let Some(m) = re.find(rest) {
                let text = m.as_str();
                self.pos += text.len();
                return Ok(Some(Token { kind: *kind, text }));
            }
        }

        let bad = rest.chars().next().expect("not end of input");
        Err(LexError(self.pos, bad))
    }

    /// Tokenize the whole input eagerly; used by the `--emit tokens` CLI
    /// mode and by the parser, which needs lookahead.
    pub fn tokenize(input: &'input str) -> Result<Vec<Token<'input>>, LexError> {
        let mut lexer = Lexer::new(input);
        let mut out = Vec::new();
        while let Some(tok) = lexer.next()? {
            out.push(tok);
        }
        Ok(out)
    }
}
