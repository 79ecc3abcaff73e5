use num_traits::{One, Zero};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// Unary functions understood by the algebra and every printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Function {
    Sin,
    Cos,
    Tan,
    Exp,
    Log,
    Sqrt,
    Sinh,
    Cosh,
    Tanh,
}

impl Function {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "sin" => Function::Sin,
            "cos" => Function::Cos,
            "tan" => Function::Tan,
            "exp" => Function::Exp,
            "log" | "ln" => Function::Log,
            "sqrt" => Function::Sqrt,
            "sinh" => Function::Sinh,
            "cosh" => Function::Cosh,
            "tanh" => Function::Tanh,
            _ => return None,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Function::Sin => "sin",
            Function::Cos => "cos",
            Function::Tan => "tan",
            Function::Exp => "exp",
            Function::Log => "log",
            Function::Sqrt => "sqrt",
            Function::Sinh => "sinh",
            Function::Cosh => "cosh",
            Function::Tanh => "tanh",
        }
    }

    pub fn apply<T: num_traits::Float>(&self, x: T) -> T {
        match self {
            Function::Sin => x.sin(),
            Function::Cos => x.cos(),
            Function::Tan => x.tan(),
            Function::Exp => x.exp(),
            Function::Log => x.ln(),
            Function::Sqrt => x.sqrt(),
            Function::Sinh => x.sinh(),
            Function::Cosh => x.cosh(),
            Function::Tanh => x.tanh(),
        }
    }
}

/// Position inside an indexed reference: either resolved, or a loop variable
/// shifted by a constant (momenta of species `a` live at `a + fields`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexSlot {
    Fixed(usize),
    Bound {
        label: char,
        name: String,
        offset: isize,
    },
}

impl IndexSlot {
    pub fn bound(label: char, name: impl Into<String>) -> Self {
        IndexSlot::Bound {
            label,
            name: name.into(),
            offset: 0,
        }
    }

    pub fn shifted(&self, by: isize) -> Self {
        match self {
            IndexSlot::Fixed(v) => IndexSlot::Fixed((*v as isize + by) as usize),
            IndexSlot::Bound {
                label,
                name,
                offset,
            } => IndexSlot::Bound {
                label: *label,
                name: name.clone(),
                offset: offset + by,
            },
        }
    }

    /// Text of this slot in generated code.
    pub fn runtime_text(&self) -> String {
        match self {
            IndexSlot::Fixed(v) => v.to_string(),
            IndexSlot::Bound { name, offset, .. } if *offset == 0 => name.clone(),
            IndexSlot::Bound { name, offset, .. } => format!("({}{:+})", name, offset),
        }
    }
}

/// Reference to a component of a runtime array, e.g. `__dV[a]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Indexed {
    pub array: String,
    pub slots: Vec<IndexSlot>,
    pub ranges: Vec<usize>,
}

/// Symbolic expression tree.
///
/// The constructors (`Expr::add`, `Expr::mul`, `Expr::pow`, ...) keep trees in
/// canonical form: sums and products are flat, numbers folded, like terms and
/// like factors collected, operands sorted by the structural order. Building
/// the variants directly bypasses this; `is_canonical` detects such trees.
#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    Symbol(String),
    Indexed(Indexed),
    Delta(IndexSlot, IndexSlot),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, Box<Expr>),
    Func(Function, Box<Expr>),
}

impl Expr {
    pub fn num(value: f64) -> Expr {
        // -0.0 and 0.0 must compare equal structurally.
        Expr::Number(if value == 0.0 { 0.0 } else { value })
    }

    pub fn symbol(name: impl Into<String>) -> Expr {
        Expr::Symbol(name.into())
    }

    pub fn indexed(array: impl Into<String>, slots: Vec<IndexSlot>, ranges: Vec<usize>) -> Expr {
        Expr::Indexed(Indexed {
            array: array.into(),
            slots,
            ranges,
        })
    }

    pub fn delta(a: IndexSlot, b: IndexSlot) -> Expr {
        match (&a, &b) {
            (IndexSlot::Fixed(x), IndexSlot::Fixed(y)) => Expr::num(if x == y { 1.0 } else { 0.0 }),
            _ if a == b => Expr::num(1.0),
            _ if a <= b => Expr::Delta(a, b),
            _ => Expr::Delta(b, a),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_number(&self, value: f64) -> bool {
        matches!(self, Expr::Number(n) if *n == value)
    }

    /// Bare symbols, numbers and array references are atoms.
    pub fn is_atom(&self) -> bool {
        matches!(
            self,
            Expr::Number(_) | Expr::Symbol(_) | Expr::Indexed(_) | Expr::Delta(_, _)
        )
    }

    pub fn add(terms: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(terms.len());
        for term in terms {
            match term {
                Expr::Add(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        let mut constant = 0.0;
        let mut collected: BTreeMap<Expr, f64> = BTreeMap::new();
        for term in flat {
            match term {
                Expr::Number(n) => constant += n,
                other => {
                    let (coefficient, rest) = split_coefficient(other);
                    *collected.entry(rest).or_insert(0.0) += coefficient;
                }
            }
        }

        let mut out = Vec::with_capacity(collected.len() + 1);
        if constant != 0.0 {
            out.push(Expr::num(constant));
        }
        for (rest, coefficient) in collected {
            if coefficient == 0.0 {
                continue;
            }
            out.push(attach_coefficient(coefficient, rest));
        }

        match out.len() {
            0 => Expr::num(0.0),
            1 => out.remove(0),
            _ => Expr::Add(out),
        }
    }

    pub fn mul(factors: Vec<Expr>) -> Expr {
        let mut flat = Vec::with_capacity(factors.len());
        for factor in factors {
            match factor {
                Expr::Mul(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }

        let mut coefficient = 1.0;
        let mut powers: BTreeMap<Expr, Vec<Expr>> = BTreeMap::new();
        for factor in flat {
            match factor {
                Expr::Number(n) => coefficient *= n,
                Expr::Pow(base, exp) => powers.entry(*base).or_default().push(*exp),
                other => powers.entry(other).or_default().push(Expr::num(1.0)),
            }
        }
        if coefficient == 0.0 {
            return Expr::num(0.0);
        }

        let mut rebuilt = Vec::with_capacity(powers.len());
        let mut needs_refold = false;
        for (base, exps) in powers {
            let factor = Expr::pow(base, Expr::add(exps));
            match factor {
                Expr::Number(n) => coefficient *= n,
                Expr::Mul(_) => {
                    needs_refold = true;
                    rebuilt.push(factor);
                }
                other => rebuilt.push(other),
            }
        }
        if needs_refold {
            rebuilt.push(Expr::num(coefficient));
            return Expr::mul(rebuilt);
        }
        if coefficient == 0.0 {
            return Expr::num(0.0);
        }

        if rebuilt.is_empty() {
            return Expr::num(coefficient);
        }
        if coefficient != 1.0 {
            rebuilt.insert(0, Expr::num(coefficient));
        }
        if rebuilt.len() == 1 {
            rebuilt.remove(0)
        } else {
            Expr::Mul(rebuilt)
        }
    }

    pub fn pow(base: Expr, exp: Expr) -> Expr {
        if exp.is_number(0.0) {
            return Expr::num(1.0);
        }
        if exp.is_number(1.0) {
            return base;
        }
        if base.is_number(1.0) {
            return Expr::num(1.0);
        }
        let integer_exp = exp
            .as_number()
            .filter(|e| e.fract() == 0.0 && e.abs() <= 64.0);
        match (base, integer_exp) {
            (Expr::Number(b), Some(e)) if b != 0.0 || e > 0.0 => Expr::num(b.powi(e as i32)),
            (Expr::Pow(inner, inner_exp), Some(_)) => {
                Expr::pow(*inner, Expr::mul(vec![*inner_exp, exp]))
            }
            (Expr::Mul(factors), Some(_)) => Expr::mul(
                factors
                    .into_iter()
                    .map(|f| Expr::pow(f, exp.clone()))
                    .collect(),
            ),
            (base, _) => Expr::Pow(Box::new(base), Box::new(exp)),
        }
    }

    pub fn func(function: Function, arg: Expr) -> Expr {
        if let Some(x) = arg.as_number() {
            let folded = function.apply(x);
            if folded.is_finite() && (folded.fract() == 0.0 || x.fract() != 0.0) {
                return Expr::num(folded);
            }
        }
        Expr::Func(function, Box::new(arg))
    }

    pub fn sqrt(arg: Expr) -> Expr {
        Expr::func(Function::Sqrt, arg)
    }

    pub fn recip(self) -> Expr {
        Expr::pow(self, Expr::num(-1.0))
    }

    pub fn square(self) -> Expr {
        Expr::pow(self, Expr::num(2.0))
    }

    /// Number of nodes in the tree.
    pub fn size(&self) -> usize {
        let mut total = 1;
        self.for_each_child(|c| total += c.size());
        total
    }

    pub fn for_each_child<F: FnMut(&Expr)>(&self, mut f: F) {
        match self {
            Expr::Number(_) | Expr::Symbol(_) | Expr::Indexed(_) | Expr::Delta(_, _) => {}
            Expr::Add(items) | Expr::Mul(items) => items.iter().for_each(f),
            Expr::Pow(base, exp) => {
                f(base);
                f(exp);
            }
            Expr::Func(_, arg) => f(arg),
        }
    }

    /// Rebuilds the node with transformed children, keeping its exact shape.
    pub fn map_children_raw<F: FnMut(&Expr) -> Expr>(&self, mut f: F) -> Expr {
        match self {
            Expr::Number(_) | Expr::Symbol(_) | Expr::Indexed(_) | Expr::Delta(_, _) => {
                self.clone()
            }
            Expr::Add(items) => Expr::Add(items.iter().map(f).collect()),
            Expr::Mul(items) => Expr::Mul(items.iter().map(f).collect()),
            Expr::Pow(base, exp) => Expr::Pow(Box::new(f(base)), Box::new(f(exp))),
            Expr::Func(function, arg) => Expr::Func(*function, Box::new(f(arg))),
        }
    }

    /// Rebuilds the node with transformed children through the canonical
    /// constructors.
    pub fn map_children<F: FnMut(&Expr) -> Expr>(&self, mut f: F) -> Expr {
        match self {
            Expr::Number(_) | Expr::Symbol(_) | Expr::Indexed(_) | Expr::Delta(_, _) => {
                self.clone()
            }
            Expr::Add(items) => Expr::add(items.iter().map(f).collect()),
            Expr::Mul(items) => Expr::mul(items.iter().map(f).collect()),
            Expr::Pow(base, exp) => Expr::pow(f(base), f(exp)),
            Expr::Func(function, arg) => Expr::func(*function, f(arg)),
        }
    }

    /// Re-runs every canonical constructor bottom-up.
    pub fn canonicalize(&self) -> Expr {
        match self {
            Expr::Number(n) => Expr::num(*n),
            Expr::Delta(a, b) => Expr::delta(a.clone(), b.clone()),
            _ => self.map_children(|c| c.canonicalize()),
        }
    }

    /// True when the tree is exactly what the canonical constructors would
    /// produce and every number is finite.
    pub fn is_canonical(&self) -> bool {
        self.all_numbers_finite() && *self == self.canonicalize()
    }

    fn all_numbers_finite(&self) -> bool {
        match self {
            Expr::Number(n) => n.is_finite(),
            _ => {
                let mut ok = true;
                self.for_each_child(|c| ok = ok && c.all_numbers_finite());
                ok
            }
        }
    }

    fn variant_rank(&self) -> u8 {
        match self {
            Expr::Number(_) => 0,
            Expr::Symbol(_) => 1,
            Expr::Indexed(_) => 2,
            Expr::Delta(_, _) => 3,
            Expr::Func(_, _) => 4,
            Expr::Pow(_, _) => 5,
            Expr::Mul(_) => 6,
            Expr::Add(_) => 7,
        }
    }
}

fn split_coefficient(term: Expr) -> (f64, Expr) {
    match term {
        Expr::Mul(mut factors) => match factors.first() {
            Some(Expr::Number(c)) => {
                let c = *c;
                factors.remove(0);
                let rest = if factors.len() == 1 {
                    factors.remove(0)
                } else {
                    Expr::Mul(factors)
                };
                (c, rest)
            }
            _ => (1.0, Expr::Mul(factors)),
        },
        other => (1.0, other),
    }
}

fn attach_coefficient(coefficient: f64, rest: Expr) -> Expr {
    if coefficient == 1.0 {
        return rest;
    }
    match rest {
        Expr::Mul(mut factors) => {
            factors.insert(0, Expr::num(coefficient));
            Expr::Mul(factors)
        }
        other => Expr::Mul(vec![Expr::num(coefficient), other]),
    }
}

impl Ord for Expr {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.variant_rank().cmp(&other.variant_rank()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (self, other) {
            (Expr::Number(a), Expr::Number(b)) => a.total_cmp(b),
            (Expr::Symbol(a), Expr::Symbol(b)) => a.cmp(b),
            (Expr::Indexed(a), Expr::Indexed(b)) => a.cmp(b),
            (Expr::Delta(a1, a2), Expr::Delta(b1, b2)) => (a1, a2).cmp(&(b1, b2)),
            (Expr::Func(fa, a), Expr::Func(fb, b)) => fa.cmp(fb).then_with(|| a.cmp(b)),
            (Expr::Pow(ab, ae), Expr::Pow(bb, be)) => ab.cmp(bb).then_with(|| ae.cmp(be)),
            (Expr::Mul(a), Expr::Mul(b)) | (Expr::Add(a), Expr::Add(b)) => a.cmp(b),
            _ => Ordering::Equal,
        }
    }
}

impl PartialOrd for Expr {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.variant_rank().hash(state);
        match self {
            Expr::Number(n) => n.to_bits().hash(state),
            Expr::Symbol(s) => s.hash(state),
            Expr::Indexed(i) => i.hash(state),
            Expr::Delta(a, b) => {
                a.hash(state);
                b.hash(state);
            }
            Expr::Func(f, a) => {
                f.hash(state);
                a.hash(state);
            }
            Expr::Pow(b, e) => {
                b.hash(state);
                e.hash(state);
            }
            Expr::Mul(items) | Expr::Add(items) => items.hash(state),
        }
    }
}

impl From<f64> for Expr {
    fn from(value: f64) -> Self {
        Expr::num(value)
    }
}

impl Add for Expr {
    type Output = Expr;
    fn add(self, rhs: Expr) -> Expr {
        Expr::add(vec![self, rhs])
    }
}

impl Sub for Expr {
    type Output = Expr;
    fn sub(self, rhs: Expr) -> Expr {
        Expr::add(vec![self, -rhs])
    }
}

impl Mul for Expr {
    type Output = Expr;
    fn mul(self, rhs: Expr) -> Expr {
        Expr::mul(vec![self, rhs])
    }
}

impl Div for Expr {
    type Output = Expr;
    fn div(self, rhs: Expr) -> Expr {
        Expr::mul(vec![self, rhs.recip()])
    }
}

impl Neg for Expr {
    type Output = Expr;
    fn neg(self) -> Expr {
        Expr::mul(vec![Expr::num(-1.0), self])
    }
}

impl Zero for Expr {
    fn zero() -> Self {
        Expr::num(0.0)
    }
    fn is_zero(&self) -> bool {
        self.is_number(0.0)
    }
}

impl One for Expr {
    fn one() -> Self {
        Expr::num(1.0)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Symbol(s) => f.write_str(s),
            Expr::Indexed(i) => {
                let slots: Vec<String> = i.slots.iter().map(|s| s.runtime_text()).collect();
                write!(f, "{}[{}]", i.array, slots.join(","))
            }
            Expr::Delta(a, b) => write!(f, "delta({},{})", a.runtime_text(), b.runtime_text()),
            Expr::Add(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "({})", parts.join(" + "))
            }
            Expr::Mul(items) => {
                let parts: Vec<String> = items.iter().map(|i| i.to_string()).collect();
                write!(f, "{}", parts.join("*"))
            }
            Expr::Pow(b, e) => write!(f, "({})^({})", b, e),
            Expr::Func(func, a) => write!(f, "{}({})", func.name(), a),
        }
    }
}
