//! Differentiation, substitution and index-slot instantiation.

use super::expr::{Expr, Function, IndexSlot, Indexed};
use crate::error::ConfigurationError;
use std::collections::{BTreeSet, HashMap};

impl Expr {
    /// Derivative with respect to the symbol `name`.
    ///
    /// Array references and deltas are runtime constants and differentiate to
    /// zero.
    pub fn diff(&self, name: &str) -> Expr {
        match self {
            Expr::Number(_) | Expr::Indexed(_) | Expr::Delta(_, _) => Expr::num(0.0),
            Expr::Symbol(s) => Expr::num(if s == name { 1.0 } else { 0.0 }),
            Expr::Add(terms) => Expr::add(terms.iter().map(|t| t.diff(name)).collect()),
            Expr::Mul(factors) => {
                let mut terms = Vec::with_capacity(factors.len());
                for (i, factor) in factors.iter().enumerate() {
                    let d = factor.diff(name);
                    if d.is_number(0.0) {
                        continue;
                    }
                    let mut product = Vec::with_capacity(factors.len());
                    for (j, other) in factors.iter().enumerate() {
                        product.push(if i == j { d.clone() } else { other.clone() });
                    }
                    terms.push(Expr::mul(product));
                }
                Expr::add(terms)
            }
            Expr::Pow(base, exp) => {
                let db = base.diff(name);
                if !exp.depends_on(name) {
                    // d(b^e) = e b^(e-1) b'
                    return Expr::mul(vec![
                        (**exp).clone(),
                        Expr::pow((**base).clone(), Expr::add(vec![(**exp).clone(), Expr::num(-1.0)])),
                        db,
                    ]);
                }
                // d(b^e) = b^e (e' ln b + e b' / b)
                let de = exp.diff(name);
                Expr::mul(vec![
                    self.clone(),
                    Expr::add(vec![
                        Expr::mul(vec![de, Expr::func(Function::Log, (**base).clone())]),
                        Expr::mul(vec![(**exp).clone(), db, (**base).clone().recip()]),
                    ]),
                ])
            }
            Expr::Func(function, arg) => {
                let inner = arg.diff(name);
                if inner.is_number(0.0) {
                    return Expr::num(0.0);
                }
                let a = (**arg).clone();
                let outer = match function {
                    Function::Sin => Expr::func(Function::Cos, a),
                    Function::Cos => -Expr::func(Function::Sin, a),
                    Function::Tan => Expr::num(1.0) + Expr::func(Function::Tan, a).square(),
                    Function::Exp => self.clone(),
                    Function::Log => a.recip(),
                    Function::Sqrt => Expr::num(0.5) * self.clone().recip(),
                    Function::Sinh => Expr::func(Function::Cosh, a),
                    Function::Cosh => Expr::func(Function::Sinh, a),
                    Function::Tanh => Expr::num(1.0) - Expr::func(Function::Tanh, a).square(),
                };
                outer * inner
            }
        }
    }

    pub fn depends_on(&self, name: &str) -> bool {
        match self {
            Expr::Symbol(s) => s == name,
            _ => {
                let mut found = false;
                self.for_each_child(|c| found = found || c.depends_on(name));
                found
            }
        }
    }

    pub fn free_symbols(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_symbols(&mut out);
        out
    }

    fn collect_symbols(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Symbol(s) => {
                out.insert(s.clone());
            }
            _ => self.for_each_child(|c| c.collect_symbols(out)),
        }
    }

    /// Replaces symbols and re-canonicalises the result.
    pub fn subs(&self, bindings: &HashMap<String, Expr>) -> Expr {
        if bindings.is_empty() {
            return self.clone();
        }
        match self {
            Expr::Symbol(s) => bindings.get(s).cloned().unwrap_or_else(|| self.clone()),
            _ => self.map_children(|c| c.subs(bindings)),
        }
    }

    /// Replaces symbols while keeping every other node exactly as it is.
    pub fn substitute_raw(&self, bindings: &HashMap<String, Expr>) -> Expr {
        match self {
            Expr::Symbol(s) => bindings.get(s).cloned().unwrap_or_else(|| self.clone()),
            _ => self.map_children_raw(|c| c.substitute_raw(bindings)),
        }
    }

    /// Rewrites every index slot and re-canonicalises the result.
    pub fn map_slots<F: Fn(&IndexSlot) -> IndexSlot>(&self, f: &F) -> Expr {
        match self {
            Expr::Indexed(indexed) => Expr::Indexed(Indexed {
                array: indexed.array.clone(),
                slots: indexed.slots.iter().map(f).collect(),
                ranges: indexed.ranges.clone(),
            }),
            Expr::Delta(a, b) => Expr::delta(f(a), f(b)),
            Expr::Number(_) | Expr::Symbol(_) => self.clone(),
            _ => self.map_children(|c| c.map_slots(f)),
        }
    }

    /// Resolves bound index slots to concrete values. Deltas between resolved
    /// slots collapse to 0 or 1 and the tree is re-canonicalised.
    pub fn instantiate(&self, values: &HashMap<char, usize>) -> Result<Expr, ConfigurationError> {
        match self {
            Expr::Indexed(indexed) => {
                let slots = indexed
                    .slots
                    .iter()
                    .map(|s| resolve_slot(s, values))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::Indexed(Indexed {
                    array: indexed.array.clone(),
                    slots,
                    ranges: indexed.ranges.clone(),
                }))
            }
            Expr::Delta(a, b) => Ok(Expr::delta(resolve_slot(a, values)?, resolve_slot(b, values)?)),
            Expr::Number(_) | Expr::Symbol(_) => Ok(self.clone()),
            _ => {
                let mut failure = None;
                let rebuilt = self.map_children(|c| match c.instantiate(values) {
                    Ok(e) => e,
                    Err(err) => {
                        failure.get_or_insert(err);
                        Expr::num(0.0)
                    }
                });
                match failure {
                    Some(err) => Err(err),
                    None => Ok(rebuilt),
                }
            }
        }
    }
}

fn resolve_slot(slot: &IndexSlot, values: &HashMap<char, usize>) -> Result<IndexSlot, ConfigurationError> {
    match slot {
        IndexSlot::Fixed(_) => Ok(slot.clone()),
        IndexSlot::Bound { label, offset, .. } => match values.get(label) {
            Some(v) => {
                let shifted = *v as isize + offset;
                if shifted < 0 {
                    return Err(ConfigurationError::IndexOutOfRange {
                        position: 0,
                        value: *v,
                        range: offset.unsigned_abs(),
                    });
                }
                Ok(IndexSlot::Fixed(shifted as usize))
            }
            None => Ok(slot.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn sym(name: &str) -> Expr {
        Expr::symbol(name)
    }

    fn eval_at(e: &Expr, x: f64) -> f64 {
        let env: HashMap<String, f64> = [("x".to_string(), x)].into_iter().collect();
        e.evaluate(&env).expect("evaluates")
    }

    #[test]
    fn polynomial_derivative() {
        let x = sym("x");
        let e = Expr::num(3.0) * x.clone().square() + Expr::num(2.0) * x.clone() + Expr::num(1.0);
        assert_eq!(e.diff("x"), Expr::num(6.0) * x + Expr::num(2.0));
        assert!(e.diff("y").is_number(0.0));
    }

    #[test]
    fn chain_rule_matches_finite_difference() {
        let x = sym("x");
        let e = Expr::func(Function::Sin, x.clone().square()) * Expr::func(Function::Exp, x.clone())
            / (Expr::num(1.0) + x.clone().square());
        let d = e.diff("x");
        for &x0 in &[0.3, 1.1, -0.7] {
            let h = 1e-6;
            let numeric = (eval_at(&e, x0 + h) - eval_at(&e, x0 - h)) / (2.0 * h);
            assert!((eval_at(&d, x0) - numeric).abs() < 1e-6, "x0 = {x0}");
        }
    }

    #[test]
    fn variable_exponent_derivative() {
        let x = sym("x");
        let e = Expr::pow(x.clone(), x.clone());
        let d = e.diff("x");
        let x0: f64 = 1.7;
        let expected = x0.powf(x0) * (x0.ln() + 1.0);
        assert!((eval_at(&d, x0) - expected).abs() < 1e-9);
    }

    #[test]
    fn subs_recanonicalises() {
        let e = sym("x") + sym("y");
        let bindings: HashMap<String, Expr> = [("y".to_string(), sym("x"))].into_iter().collect();
        assert_eq!(e.subs(&bindings), Expr::num(2.0) * sym("x"));
    }

    #[test]
    fn substitute_raw_keeps_shape() {
        let e = Expr::Add(vec![sym("t"), sym("t")]);
        let bindings: HashMap<String, Expr> = [("t".to_string(), sym("x"))].into_iter().collect();
        assert_eq!(e.substitute_raw(&bindings), Expr::Add(vec![sym("x"), sym("x")]));
    }

    #[test]
    fn instantiate_resolves_slots_and_deltas() {
        let a = IndexSlot::bound('a', "__a");
        let b = IndexSlot::bound('b', "__b");
        let e = Expr::indexed("__x", vec![a.shifted(2)], vec![4]) * Expr::delta(a, b);
        let same: HashMap<char, usize> = [('a', 1), ('b', 1)].into_iter().collect();
        let different: HashMap<char, usize> = [('a', 1), ('b', 0)].into_iter().collect();
        assert_eq!(
            e.instantiate(&same).expect("resolves"),
            Expr::indexed("__x", vec![IndexSlot::Fixed(3)], vec![4])
        );
        assert!(e.instantiate(&different).expect("resolves").is_number(0.0));
    }

    #[test]
    fn negative_slot_is_rejected() {
        let a = IndexSlot::bound('A', "__A").shifted(-2);
        let e = Expr::indexed("__dV", vec![a], vec![2]);
        let values: HashMap<char, usize> = [('A', 1)].into_iter().collect();
        assert!(e.instantiate(&values).is_err());
    }
}
