//! The statement optimizer: taint-tracking constant propagation, dead
//! branch elimination, and dead-store elimination (`spec.md` §4.2).
//!
//! Phase A (`predict`) walks the program once, front to back, maintaining
//! one [`VarState`] per variable: a variable starts untracked, becomes
//! *in scope* with a known `value` on its first `Let`, and becomes
//! permanently *tainted* the moment its value can no longer be determined
//! statically (an `If`/`While` that can't be resolved at compile time, or a
//! `Let` whose right-hand side depends on a tainted variable). A `Let` whose
//! folded value exactly repeats the variable's current tracked value is a
//! no-op and is dropped outright.
//!
//! `While` is the awkward case: a loop might assign a variable on its first
//! iteration only, so a single linear pass over the body would under-taint.
//! Before partially evaluating a loop, a read-only *taint discovery* pass
//! runs to a fixed point over the (unmodified) body, tainting every
//! variable the loop could possibly ever assign, before the real
//! partial-evaluation pass proceeds with that more conservative state.
//!
//! The original runs taint discovery over a disposable clone of the body,
//! because its discovery routine doubles as a general expression evaluator
//! that destructively rewrites nodes in place as a side effect; cloning
//! keeps that rewriting from corrupting the real AST. `discover` here only
//! *reads* whether a condition is decidable (see [`const_cond`]) and never
//! mutates anything, so there is nothing to protect the real body from —
//! the clone-and-discard step is dropped as unnecessary ceremony once the
//! two concerns (probing vs. rewriting) are pulled apart.
//!
//! Phase B (`strip_unnecessary_let_statements`) then removes every `Let`
//! whose variable is never read anywhere else in the program.

use tracing::{debug, trace};

use crate::common::{var_index, Var, NUM_VARS};
use crate::front::ast::{Cond, Expr, Program, Stmt};

use super::fold;

#[derive(Debug, Clone, Copy, Default)]
struct VarState {
    tainted: bool,
    in_scope: bool,
    value: i64,
}

type VarTable = [VarState; NUM_VARS];

pub fn optimize_program(program: &mut Program) {
    fold::fold_program(program);

    let mut state: VarTable = [VarState::default(); NUM_VARS];
    let stmts = std::mem::take(&mut program.stmts);
    let predicted = predict_stmts(stmts, &mut state);

    let mut refs = [0usize; NUM_VARS];
    count_refs_stmts(&predicted, &mut refs);
    program.stmts = strip_stmts(predicted, &refs);
}

// ---------------------------------------------------------------------
// Phase A: constant propagation and dead branch elimination.
// ---------------------------------------------------------------------

enum Predicted {
    Keep(Stmt),
    /// The statement folded away to the (already-predicted) contents of
    /// one branch; splice those statements directly into the parent list
    /// rather than keeping them nested under the now-pointless `If`.
    Splice(Vec<Stmt>),
    Delete,
}

fn predict_stmts(stmts: Vec<Stmt>, state: &mut VarTable) -> Vec<Stmt> {
    let mut out = Vec::with_capacity(stmts.len());
    for stmt in stmts {
        match predict_stmt(stmt, state) {
            Predicted::Keep(s) => out.push(s),
            Predicted::Splice(mut spliced) => out.append(&mut spliced),
            Predicted::Delete => {}
        }
    }
    out
}

fn predict_stmt(stmt: Stmt, state: &mut VarTable) -> Predicted {
    match stmt {
        Stmt::Let(name, value) => predict_let(name, value, state),
        Stmt::Print(expr) => Predicted::Keep(Stmt::Print(evaluate_expr(expr, state))),
        Stmt::If {
            cond,
            if_branch,
            else_branch,
        } => predict_if(cond, if_branch, else_branch, state),
        Stmt::While { cond, body } => predict_while(cond, body, state),
    }
}

fn predict_let(name: Var, value: Expr, state: &mut VarTable) -> Predicted {
    let idx = var_index(name);
    if state[idx].tainted {
        return Predicted::Keep(Stmt::Let(name, value));
    }

    let value = evaluate_expr(value, state);
    match value.as_num() {
        Some(k) => {
            if state[idx].in_scope && state[idx].value == k {
                trace!(var = %name, %k, "dropping redundant let");
                return Predicted::Delete;
            }
            state[idx].value = k;
        }
        None => {
            debug!(var = %name, "tainting (non-constant let)");
            state[idx].tainted = true;
        }
    }
    state[idx].in_scope = true;
    Predicted::Keep(Stmt::Let(name, value))
}

fn predict_if(
    cond: Cond,
    if_branch: Vec<Stmt>,
    else_branch: Option<Vec<Stmt>>,
    state: &mut VarTable,
) -> Predicted {
    let cond = evaluate_cond(cond, state);
    match folded_cond_result(&cond) {
        Some(true) => {
            debug!("if condition statically true, inlining taken branch");
            Predicted::Splice(predict_stmts(if_branch, state))
        }
        Some(false) => match else_branch {
            Some(eb) => {
                debug!("if condition statically false, inlining else branch");
                Predicted::Splice(predict_stmts(eb, state))
            }
            None => {
                debug!("if condition statically false with no else, dropping");
                Predicted::Delete
            }
        },
        None => {
            let if_branch = predict_stmts(if_branch, state);
            let else_branch = else_branch.map(|eb| predict_stmts(eb, state));
            Predicted::Keep(Stmt::If {
                cond,
                if_branch,
                else_branch,
            })
        }
    }
}

fn predict_while(cond: Cond, body: Vec<Stmt>, state: &mut VarTable) -> Predicted {
    let mut passes = 0;
    while discover_stmts(&body, state) {
        passes += 1;
        trace!(passes, "while taint discovery pass found a new taint");
    }

    let cond = evaluate_cond(cond, state);
    if let Some(false) = folded_cond_result(&cond) {
        debug!("while condition statically false, dropping loop");
        return Predicted::Delete;
    }

    let body = predict_stmts(body, state);
    Predicted::Keep(Stmt::While { cond, body })
}

/// Partially evaluate an expression: substitute every untainted in-scope
/// variable with its known constant, then fold any resulting constant
/// arithmetic.
fn evaluate_expr(expr: Expr, state: &VarTable) -> Expr {
    match expr {
        Expr::Num(v) => Expr::Num(v),
        Expr::Var(name) => {
            let vdata = state[var_index(name)];
            if vdata.tainted || !vdata.in_scope {
                Expr::Var(name)
            } else {
                Expr::Num(vdata.value)
            }
        }
        Expr::BinOp { op, lhs, rhs } => {
            let lhs = evaluate_expr(*lhs, state);
            let rhs = evaluate_expr(*rhs, state);
            match (&lhs, &rhs) {
                (Expr::Num(a), Expr::Num(b)) => Expr::Num(op.apply(*a, *b)),
                _ => Expr::bin(op, lhs, rhs),
            }
        }
    }
}

fn evaluate_cond(cond: Cond, state: &VarTable) -> Cond {
    Cond {
        op: cond.op,
        lhs: evaluate_expr(cond.lhs, state),
        rhs: evaluate_expr(cond.rhs, state),
    }
}

/// Whether a `Cond` that has already been through [`evaluate_expr`] on both
/// sides turned out to be fully constant, and if so, its value.
fn folded_cond_result(cond: &Cond) -> Option<bool> {
    match (&cond.lhs, &cond.rhs) {
        (Expr::Num(a), Expr::Num(b)) => Some(cond.op.apply(*a, *b)),
        _ => None,
    }
}

/// Read-only probe: is this expression fully determined by the current
/// variable state? Used only by taint discovery, which must not mutate the
/// real body while scanning it.
fn const_value(expr: &Expr, state: &VarTable) -> Option<i64> {
    match expr {
        Expr::Num(v) => Some(*v),
        Expr::Var(name) => {
            let vdata = state[var_index(*name)];
            if vdata.tainted || !vdata.in_scope {
                None
            } else {
                Some(vdata.value)
            }
        }
        Expr::BinOp { op, lhs, rhs } => {
            let a = const_value(lhs, state)?;
            let b = const_value(rhs, state)?;
            Some(op.apply(a, b))
        }
    }
}

fn const_cond(cond: &Cond, state: &VarTable) -> Option<bool> {
    let a = const_value(&cond.lhs, state)?;
    let b = const_value(&cond.rhs, state)?;
    Some(cond.op.apply(a, b))
}

/// A single pass of taint discovery: taint the first as-yet-untainted `Let`
/// target found (in program order) and stop, returning `true`. Returns
/// `false` once a full pass finds nothing new to taint, i.e. a fixed point.
fn discover_stmts(stmts: &[Stmt], state: &mut VarTable) -> bool {
    stmts.iter().any(|stmt| discover_stmt(stmt, state))
}

fn discover_stmt(stmt: &Stmt, state: &mut VarTable) -> bool {
    match stmt {
        Stmt::Print(_) => false,
        Stmt::Let(name, _) => {
            let idx = var_index(*name);
            if state[idx].tainted {
                false
            } else {
                trace!(var = %name, "tainting in while discovery");
                state[idx].tainted = true;
                true
            }
        }
        Stmt::If {
            cond,
            if_branch,
            else_branch,
        } => match const_cond(cond, state) {
            Some(true) => discover_stmts(if_branch, state),
            Some(false) => else_branch
                .as_ref()
                .is_some_and(|eb| discover_stmts(eb, state)),
            None => {
                discover_stmts(if_branch, state)
                    || else_branch
                        .as_ref()
                        .is_some_and(|eb| discover_stmts(eb, state))
            }
        },
        Stmt::While { body, .. } => discover_stmts(body, state),
    }
}

// ---------------------------------------------------------------------
// Phase B: dead-store elimination.
// ---------------------------------------------------------------------

fn count_refs_stmts(stmts: &[Stmt], refs: &mut [usize; NUM_VARS]) {
    for stmt in stmts {
        count_refs_stmt(stmt, refs);
    }
}

fn count_refs_stmt(stmt: &Stmt, refs: &mut [usize; NUM_VARS]) {
    match stmt {
        Stmt::Print(expr) => count_refs_expr(expr, refs, None),
        Stmt::Let(name, value) => count_refs_expr(value, refs, Some(*name)),
        Stmt::If {
            cond,
            if_branch,
            else_branch,
        } => {
            count_refs_expr(&cond.lhs, refs, None);
            count_refs_expr(&cond.rhs, refs, None);
            count_refs_stmts(if_branch, refs);
            if let Some(eb) = else_branch {
                count_refs_stmts(eb, refs);
            }
        }
        Stmt::While { cond, body } => {
            count_refs_expr(&cond.lhs, refs, None);
            count_refs_expr(&cond.rhs, refs, None);
            count_refs_stmts(body, refs);
        }
    }
}

/// `ignore` excludes one variable name from being counted as a reference —
/// used so a `Let v = v + 1` doesn't count its own self-reference as a use
/// that would keep an otherwise-dead store alive.
fn count_refs_expr(expr: &Expr, refs: &mut [usize; NUM_VARS], ignore: Option<Var>) {
    match expr {
        Expr::Num(_) => {}
        Expr::Var(name) => {
            if Some(*name) != ignore {
                refs[var_index(*name)] += 1;
            }
        }
        Expr::BinOp { lhs, rhs, .. } => {
            count_refs_expr(lhs, refs, ignore);
            count_refs_expr(rhs, refs, ignore);
        }
    }
}

fn strip_stmts(stmts: Vec<Stmt>, refs: &[usize; NUM_VARS]) -> Vec<Stmt> {
    stmts
        .into_iter()
        .filter_map(|stmt| strip_stmt(stmt, refs))
        .collect()
}

fn strip_stmt(stmt: Stmt, refs: &[usize; NUM_VARS]) -> Option<Stmt> {
    match stmt {
        Stmt::Let(name, value) => {
            if refs[var_index(name)] == 0 {
                debug!(var = %name, "removing dead store");
                None
            } else {
                Some(Stmt::Let(name, value))
            }
        }
        Stmt::Print(expr) => Some(Stmt::Print(expr)),
        Stmt::If {
            cond,
            if_branch,
            else_branch,
        } => {
            let if_branch = strip_stmts(if_branch, refs);
            match else_branch {
                Some(eb) => {
                    let eb = strip_stmts(eb, refs);
                    if if_branch.is_empty() && eb.is_empty() {
                        None
                    } else {
                        Some(Stmt::If {
                            cond,
                            if_branch,
                            else_branch: Some(eb),
                        })
                    }
                }
                None if if_branch.is_empty() => None,
                None => Some(Stmt::If {
                    cond,
                    if_branch,
                    else_branch: None,
                }),
            }
        }
        Stmt::While { cond, body } => {
            // An empty body is kept (not deleted): the loop's infinite-ness
            // may be the point.
            let body = strip_stmts(body, refs);
            Some(Stmt::While { cond, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::front::ast::{ArithOp, CmpOp};

    fn num(v: i64) -> Expr {
        Expr::Num(v)
    }

    #[test]
    fn redundant_let_is_dropped() {
        let program = Program {
            stmts: vec![
                Stmt::Let('X', num(5)),
                Stmt::Let('X', num(5)),
                Stmt::Print(Expr::Var('X')),
            ],
        };
        let mut program = program;
        optimize_program(&mut program);
        assert_eq!(
            program.stmts,
            vec![Stmt::Let('X', num(5)), Stmt::Print(num(5))]
        );
    }

    #[test]
    fn dead_store_is_removed() {
        let mut program = Program {
            stmts: vec![Stmt::Let('X', num(1)), Stmt::Print(num(2))],
        };
        optimize_program(&mut program);
        assert_eq!(program.stmts, vec![Stmt::Print(num(2))]);
    }

    #[test]
    fn constant_if_inlines_taken_branch() {
        let mut program = Program {
            stmts: vec![Stmt::If {
                cond: Cond {
                    op: CmpOp::Eq,
                    lhs: num(1),
                    rhs: num(1),
                },
                if_branch: vec![Stmt::Print(num(7))],
                else_branch: Some(vec![Stmt::Print(num(9))]),
            }],
        };
        optimize_program(&mut program);
        assert_eq!(program.stmts, vec![Stmt::Print(num(7))]);
    }

    #[test]
    fn while_taints_body_writes_before_partial_eval() {
        // X starts at 2; the loop writes X = X + 1 every iteration, so the
        // PRINT inside must NOT be folded to a constant.
        let mut program = Program {
            stmts: vec![
                Stmt::Let('X', num(2)),
                Stmt::While {
                    cond: Cond {
                        op: CmpOp::Lt,
                        lhs: Expr::Var('X'),
                        rhs: num(10),
                    },
                    body: vec![
                        Stmt::Print(Expr::Var('X')),
                        Stmt::Let('X', Expr::bin(ArithOp::Add, Expr::Var('X'), num(1))),
                    ],
                },
            ],
        };
        optimize_program(&mut program);
        let Stmt::While { body, .. } = &program.stmts[1] else {
            panic!("expected a While statement");
        };
        assert_eq!(body[0], Stmt::Print(Expr::Var('X')));
    }

    #[test]
    fn if_inside_constant_while_keeps_its_shape() {
        // The outer While's condition is undecidable (X is tainted by the
        // loop body), so predict_while must leave the nested If alone rather
        // than resolving it against the loop's pre-entry state. Multi-field
        // mismatches here are easy to misread as a single changed byte, so
        // this is exactly the kind of comparison pretty_assertions is for.
        let mut program = Program {
            stmts: vec![
                Stmt::Let('X', num(0)),
                Stmt::While {
                    cond: Cond {
                        op: CmpOp::Lt,
                        lhs: Expr::Var('X'),
                        rhs: num(10),
                    },
                    body: vec![
                        Stmt::If {
                            cond: Cond {
                                op: CmpOp::Eq,
                                lhs: Expr::Var('X'),
                                rhs: num(0),
                            },
                            if_branch: vec![Stmt::Print(num(100))],
                            else_branch: None,
                        },
                        Stmt::Let('X', Expr::bin(ArithOp::Add, Expr::Var('X'), num(1))),
                    ],
                },
            ],
        };
        optimize_program(&mut program);
        let expected_body = vec![
            Stmt::If {
                cond: Cond {
                    op: CmpOp::Eq,
                    lhs: Expr::Var('X'),
                    rhs: num(0),
                },
                if_branch: vec![Stmt::Print(num(100))],
                else_branch: None,
            },
            Stmt::Let('X', Expr::bin(ArithOp::Add, Expr::Var('X'), num(1))),
        ];
        let Stmt::While { body, .. } = &program.stmts[1] else {
            panic!("expected a While statement");
        };
        pretty_assertions::assert_eq!(body, &expected_body);
    }
}
