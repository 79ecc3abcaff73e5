//! Symbolic expressions: canonical trees, calculus, parsing and evaluation.

mod calculus;
pub mod eval;
mod expr;
pub mod parse;

pub use expr::{Expr, Function, IndexSlot, Indexed};
pub use parse::{parse, Ast, Resolver};
