//! Rendering of expressions and loop scaffolding as backend source text.

use crate::index::AbstractIndex;
use crate::storage::{offset_text, OffsetTerm};
use crate::symbolic::{Expr, Function, IndexSlot, Indexed};

/// Language-specific spelling of expressions and control flow.
pub trait Printer: Send + Sync {
    fn name(&self) -> &str;

    fn render(&self, expr: &Expr) -> String;

    /// Opens a loop running the decorated variable of `index` over its range.
    fn loop_open(&self, index: &AbstractIndex) -> String;

    fn loop_close(&self) -> String;

    /// `condition ? then : otherwise`
    fn ternary(&self, condition: &str, then: &str, otherwise: &str) -> String;

    fn less_than(&self, variable: &str, bound: usize) -> String;

    fn at_least(&self, variable: &str, bound: usize) -> String;

    fn conjunction(&self, conditions: &[String]) -> String {
        conditions.join(" && ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Sum,
    Product,
    Unary,
    Atom,
}

/// Printer for the C family (C++, OpenCL C, CUDA C).
#[derive(Debug, Clone, PartialEq)]
pub struct CStylePrinter {
    pub name: String,
    pub pow_function: String,
    /// Prepended to every function name, e.g. `std::`.
    pub function_prefix: String,
    /// Appended to every real literal, e.g. `f` for single precision.
    pub literal_suffix: String,
    pub loop_index_type: String,
}

impl Default for CStylePrinter {
    fn default() -> Self {
        Self {
            name: "c".to_string(),
            pow_function: "pow".to_string(),
            function_prefix: String::new(),
            literal_suffix: String::new(),
            loop_index_type: "unsigned int".to_string(),
        }
    }
}

fn wrap((text, prec): (String, Precedence), min: Precedence) -> String {
    if prec < min {
        format!("({})", text)
    } else {
        text
    }
}

fn is_negative(term: &Expr) -> bool {
    match term {
        Expr::Number(n) => *n < 0.0,
        Expr::Mul(factors) => matches!(factors.first(), Some(Expr::Number(n)) if *n < 0.0),
        _ => false,
    }
}

fn negate_raw(term: &Expr) -> Expr {
    match term {
        Expr::Number(n) => Expr::Number(-n),
        Expr::Mul(factors) => {
            let mut factors = factors.clone();
            if let Some(Expr::Number(n)) = factors.first_mut() {
                *n = -*n;
            }
            if matches!(factors.first(), Some(Expr::Number(n)) if *n == 1.0) && factors.len() > 1 {
                factors.remove(0);
            }
            if factors.len() == 1 {
                factors.remove(0)
            } else {
                Expr::Mul(factors)
            }
        }
        other => other.clone(),
    }
}

impl CStylePrinter {
    pub fn literal(&self, value: f64) -> String {
        format!("{:?}{}", value, self.literal_suffix)
    }

    fn indexed(&self, indexed: &Indexed) -> String {
        let terms: Vec<OffsetTerm> = indexed
            .slots
            .iter()
            .map(|slot| match slot {
                IndexSlot::Fixed(v) => OffsetTerm::Value(*v),
                bound => OffsetTerm::Runtime(bound.runtime_text()),
            })
            .collect();
        format!("{}[{}]", indexed.array, offset_text(&indexed.ranges, &terms))
    }

    fn function(&self, function: Function, arg: String) -> String {
        format!("{}{}({})", self.function_prefix, function.name(), arg)
    }

    fn print(&self, expr: &Expr) -> (String, Precedence) {
        match expr {
            Expr::Number(n) if *n < 0.0 => (format!("-{}", self.literal(-n)), Precedence::Unary),
            Expr::Number(n) => (self.literal(*n), Precedence::Atom),
            Expr::Symbol(s) => (s.clone(), Precedence::Atom),
            Expr::Indexed(indexed) => (self.indexed(indexed), Precedence::Atom),
            Expr::Delta(a, b) => (
                format!(
                    "({} == {} ? {} : {})",
                    a.runtime_text(),
                    b.runtime_text(),
                    self.literal(1.0),
                    self.literal(0.0)
                ),
                Precedence::Atom,
            ),
            Expr::Func(function, arg) => (self.function(*function, self.render(arg)), Precedence::Atom),
            Expr::Pow(base, exp) => self.power(base, exp),
            Expr::Mul(factors) => self.product(factors),
            Expr::Add(terms) => {
                let mut text = String::new();
                for (i, term) in terms.iter().enumerate() {
                    if i == 0 {
                        text.push_str(&wrap(self.print(term), Precedence::Sum));
                    } else if is_negative(term) {
                        text.push_str(" - ");
                        text.push_str(&wrap(self.print(&negate_raw(term)), Precedence::Product));
                    } else {
                        text.push_str(" + ");
                        text.push_str(&wrap(self.print(term), Precedence::Product));
                    }
                }
                (text, Precedence::Sum)
            }
        }
    }

    fn power(&self, base: &Expr, exp: &Expr) -> (String, Precedence) {
        match exp.as_number() {
            Some(e) if e == 0.5 => (
                self.function(Function::Sqrt, self.render(base)),
                Precedence::Atom,
            ),
            Some(e) if e < 0.0 => {
                let positive = self.power(base, &Expr::Number(-e));
                (
                    format!("{}/{}", self.literal(1.0), wrap(positive, Precedence::Atom)),
                    Precedence::Product,
                )
            }
            Some(e) if e == 1.0 => self.print(base),
            _ => (
                format!(
                    "{}{}({}, {})",
                    self.function_prefix,
                    self.pow_function,
                    self.render(base),
                    self.render(exp)
                ),
                Precedence::Atom,
            ),
        }
    }

    fn product(&self, factors: &[Expr]) -> (String, Precedence) {
        let mut coefficient = 1.0;
        let mut numerator = Vec::new();
        let mut denominator = Vec::new();
        for (i, factor) in factors.iter().enumerate() {
            match factor {
                Expr::Number(n) if i == 0 => coefficient = *n,
                Expr::Pow(base, exp) if exp.as_number().map(|e| e < 0.0).unwrap_or(false) => {
                    let e = exp.as_number().unwrap_or(-1.0);
                    denominator.push(self.power(base, &Expr::Number(-e)));
                }
                other => numerator.push(self.print(other)),
            }
        }

        let negative = coefficient < 0.0;
        let magnitude = coefficient.abs();
        let mut parts: Vec<String> = Vec::new();
        if magnitude != 1.0 || numerator.is_empty() {
            parts.push(self.literal(magnitude));
        }
        parts.extend(numerator.into_iter().map(|p| wrap(p, Precedence::Unary)));
        let mut text = parts.join("*");

        if !denominator.is_empty() {
            let den = if denominator.len() == 1 {
                wrap(denominator.remove(0), Precedence::Atom)
            } else {
                format!(
                    "({})",
                    denominator
                        .into_iter()
                        .map(|d| wrap(d, Precedence::Unary))
                        .collect::<Vec<_>>()
                        .join("*")
                )
            };
            text = format!("{}/{}", text, den);
        }

        if negative {
            (format!("-{}", text), Precedence::Unary)
        } else {
            (text, Precedence::Product)
        }
    }
}

impl Printer for CStylePrinter {
    fn name(&self) -> &str {
        &self.name
    }

    fn render(&self, expr: &Expr) -> String {
        self.print(expr).0
    }

    fn loop_open(&self, index: &AbstractIndex) -> String {
        let var = index.decorated();
        format!(
            "for({} {} = 0; {} < {}; ++{}) {{",
            self.loop_index_type,
            var,
            var,
            index.numeric_range(),
            var
        )
    }

    fn loop_close(&self) -> String {
        "}".to_string()
    }

    fn ternary(&self, condition: &str, then: &str, otherwise: &str) -> String {
        format!("({} ? {} : {})", condition, then, otherwise)
    }

    fn less_than(&self, variable: &str, bound: usize) -> String {
        format!("{} < {}", variable, bound)
    }

    fn at_least(&self, variable: &str, bound: usize) -> String {
        format!("{} >= {}", variable, bound)
    }
}
