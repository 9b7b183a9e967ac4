//! The optimizer: folds constants and algebraic identities out of
//! expressions, then tracks which variables are statically known so dead
//! stores can be dropped.

pub mod fold;
pub mod optimize;

pub use fold::fold_expr;
pub use optimize::optimize_program;
