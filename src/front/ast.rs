//! The abstract syntax tree.
//!
//! A `Program` is a sequence of statements. Unlike the original C
//! implementation (`node_t` tagged union with `if_branch`/`else_branch`
//! pointers to a single child statement), a statement sequence is just a
//! `Vec<Stmt>` here: the "Sequence" node of `spec.md` §3 has no separate
//! representation, it *is* the `Vec`. An empty `Vec` plays the role the
//! original gives an explicit empty `SEQUENCE` node (e.g. a `WHILE` body
//! that folds away entirely is replaced with an empty `Vec`, never deleted).

use crate::common::Var;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    pub stmts: Vec<Stmt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stmt {
    Print(Expr),
    Let(Var, Expr),
    If {
        cond: Cond,
        if_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },
    While {
        cond: Cond,
        body: Vec<Stmt>,
    },
}

/// An arithmetic expression tree. Mixes `Num`, `Var`, and arithmetic
/// `BinOp` only (`spec.md` §3's invariant that a `BinaryOp` used as an
/// expression must carry an arithmetic operator, never a comparator).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expr {
    Num(i64),
    Var(Var),
    BinOp {
        op: ArithOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl ArithOp {
    pub fn as_char(self) -> char {
        match self {
            ArithOp::Add => '+',
            ArithOp::Sub => '-',
            ArithOp::Mul => '*',
            ArithOp::Div => '/',
        }
    }

    /// Evaluate under two's-complement wrapping arithmetic with truncated
    /// (C-style) division, matching `perform_op` in `ast_optimizer.c`.
    pub fn apply(self, a: i64, b: i64) -> i64 {
        match self {
            ArithOp::Add => a.wrapping_add(b),
            ArithOp::Sub => a.wrapping_sub(b),
            ArithOp::Mul => a.wrapping_mul(b),
            ArithOp::Div => a.wrapping_div(b),
        }
    }
}

/// A comparator, legal only in the condition slot of an `If`/`While`
/// (`spec.md` §3's second invariant). Kept as its own type, distinct from
/// [`ArithOp`], rather than the original's unified `char op` field, so the
/// type system enforces the invariant instead of a runtime check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cond {
    pub op: CmpOp,
    pub lhs: Expr,
    pub rhs: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Eq,
    Gt,
}

impl CmpOp {
    pub fn as_char(self) -> char {
        match self {
            CmpOp::Lt => '<',
            CmpOp::Eq => '=',
            CmpOp::Gt => '>',
        }
    }

    pub fn flip(self) -> CmpOp {
        match self {
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Eq => CmpOp::Eq,
        }
    }

    pub fn apply(self, a: i64, b: i64) -> bool {
        match self {
            CmpOp::Lt => a < b,
            CmpOp::Eq => a == b,
            CmpOp::Gt => a > b,
        }
    }
}

impl Expr {
    pub fn num(v: i64) -> Expr {
        Expr::Num(v)
    }

    pub fn bin(op: ArithOp, lhs: Expr, rhs: Expr) -> Expr {
        Expr::BinOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn as_num(&self) -> Option<i64> {
        match self {
            Expr::Num(v) => Some(*v),
            _ => None,
        }
    }
}

impl Cond {
    /// Swap sides, flipping `<`/`>` so the condition keeps its original
    /// truth value. Mirrors `switch_bnode` in `compile.c`, which the
    /// emitter also uses on conditions to normalize operand placement.
    pub fn swap(&mut self) {
        std::mem::swap(&mut self.lhs, &mut self.rhs);
        self.op = self.op.flip();
    }
}
