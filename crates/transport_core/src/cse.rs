//! Common subexpression elimination.
//!
//! Subexpressions are matched structurally. A non-atomic subexpression is
//! pulled out into a temporary when it occurs at least twice across all
//! targets, or when it occurs once but is larger than the complexity
//! threshold. Occurrences inside a repeated subexpression count once, so a
//! node living only inside one temporary's definition is not extracted on its
//! own. Extraction is post-order, so every temporary's definition only refers
//! to temporaries defined before it.
//!
//! Rewriting keeps the exact shape of every node, which makes
//! [`CseMap::back_substitute`] reproduce the original targets exactly.

use crate::printer::Printer;
use crate::settings::TranslatorSettings;
use crate::symbolic::Expr;
use log::{debug, warn};
use std::cell::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

/// A target the engine declined to factor. It is emitted unfactored.
#[derive(Debug, Clone, PartialEq)]
pub struct AlgebraicDegeneracy {
    pub target: usize,
    pub reason: String,
}

/// Extraction engine. The temporary counter persists across runs so that
/// several maps emitted into one scope never reuse a name.
#[derive(Debug, Clone)]
pub struct Cse {
    enabled: bool,
    prefix: String,
    threshold: usize,
    counter: usize,
}

impl Cse {
    pub fn new(prefix: impl Into<String>, threshold: usize) -> Self {
        Self {
            enabled: true,
            prefix: prefix.into(),
            threshold,
            counter: 0,
        }
    }

    pub fn from_settings(settings: &TranslatorSettings) -> Self {
        Self {
            enabled: settings.cse,
            ..Self::new(settings.temporary_prefix.clone(), settings.complexity_threshold)
        }
    }

    /// Counts the occurrences of every non-atomic subtree. A subtree seen
    /// before is not descended into again: its children are counted once,
    /// inside the single definition it will get.
    fn count(expr: &Expr, counts: &mut HashMap<Expr, usize>) {
        if expr.is_atom() {
            return;
        }
        let seen = counts.entry(expr.clone()).or_insert(0);
        *seen += 1;
        if *seen == 1 {
            expr.for_each_child(|c| Self::count(c, counts));
        }
    }

    fn rewrite(
        &mut self,
        expr: &Expr,
        root: bool,
        counts: &HashMap<Expr, usize>,
        names: &mut HashMap<Expr, String>,
        temporaries: &mut Vec<(String, Expr)>,
    ) -> Expr {
        if expr.is_atom() {
            return expr.clone();
        }
        if let Some(name) = names.get(expr) {
            return Expr::symbol(name.clone());
        }
        let rebuilt = expr.map_children_raw(|c| self.rewrite(c, false, counts, names, temporaries));

        let occurrences = counts.get(expr).copied().unwrap_or(0);
        let extract = occurrences >= 2 || (!root && expr.size() > self.threshold);
        if !extract {
            return rebuilt;
        }
        let name = format!("{}{}", self.prefix, self.counter);
        self.counter += 1;
        names.insert(expr.clone(), name.clone());
        temporaries.push((name.clone(), rebuilt));
        Expr::symbol(name)
    }

    /// Runs elimination over `targets`, rendering through `printer`.
    pub fn run(&mut self, targets: Vec<Expr>, printer: Arc<dyn Printer>) -> CseMap {
        let mut degeneracies = Vec::new();
        let mut counts = HashMap::new();
        for (i, target) in targets.iter().enumerate() {
            if target.is_canonical() {
                Self::count(target, &mut counts);
            } else {
                let reason = "expression is not in canonical form".to_string();
                warn!("CSE skipped target {}: {}", i, reason);
                degeneracies.push(AlgebraicDegeneracy { target: i, reason });
            }
        }

        let mut names = HashMap::new();
        let mut temporaries = Vec::new();
        let rewritten: Vec<Expr> = targets
            .iter()
            .enumerate()
            .map(|(i, target)| {
                let degenerate = degeneracies.iter().any(|d| d.target == i);
                if degenerate || !self.enabled {
                    target.clone()
                } else {
                    self.rewrite(target, true, &counts, &mut names, &mut temporaries)
                }
            })
            .collect();

        debug!(
            "CSE over {} target(s): {} temporaries, {} degenerate",
            targets.len(),
            temporaries.len(),
            degeneracies.len()
        );
        CseMap::new(temporaries, rewritten, degeneracies, printer)
    }
}

/// Result of one elimination run.
///
/// Rendered text is produced on first access and memoised; callers only ever
/// receive shared string slices.
pub struct CseMap {
    temporaries: Vec<(String, Expr)>,
    targets: Vec<Expr>,
    degeneracies: Vec<AlgebraicDegeneracy>,
    printer: Arc<dyn Printer>,
    rendered_targets: Vec<OnceCell<String>>,
    rendered_temporaries: Vec<OnceCell<String>>,
}

impl std::fmt::Debug for CseMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CseMap")
            .field("temporaries", &self.temporaries)
            .field("targets", &self.targets)
            .field("degeneracies", &self.degeneracies)
            .field("printer", &self.printer.name())
            .finish()
    }
}

impl CseMap {
    fn new(
        temporaries: Vec<(String, Expr)>,
        targets: Vec<Expr>,
        degeneracies: Vec<AlgebraicDegeneracy>,
        printer: Arc<dyn Printer>,
    ) -> Self {
        Self {
            rendered_targets: targets.iter().map(|_| OnceCell::new()).collect(),
            rendered_temporaries: temporaries.iter().map(|_| OnceCell::new()).collect(),
            temporaries,
            targets,
            degeneracies,
            printer,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Rendered text of target `i`, in terms of the temporaries.
    pub fn get(&self, i: usize) -> Option<&str> {
        let expr = self.targets.get(i)?;
        let cell = self.rendered_targets.get(i)?;
        Some(cell.get_or_init(|| self.printer.render(expr)).as_str())
    }

    /// Rendered definition of temporary `i`, paired with its symbol.
    pub fn temporary(&self, i: usize) -> Option<(&str, &str)> {
        let (name, expr) = self.temporaries.get(i)?;
        let cell = self.rendered_temporaries.get(i)?;
        Some((name.as_str(), cell.get_or_init(|| self.printer.render(expr)).as_str()))
    }

    pub fn temporaries(&self) -> &[(String, Expr)] {
        &self.temporaries
    }

    pub fn targets(&self) -> &[Expr] {
        &self.targets
    }

    pub fn degeneracies(&self) -> &[AlgebraicDegeneracy] {
        &self.degeneracies
    }

    /// Target `i` with every temporary expanded back into its definition.
    pub fn back_substitute(&self, i: usize) -> Option<Expr> {
        let mut expanded: HashMap<String, Expr> = HashMap::new();
        for (name, definition) in &self.temporaries {
            let full = definition.substitute_raw(&expanded);
            expanded.insert(name.clone(), full);
        }
        self.targets.get(i).map(|t| t.substitute_raw(&expanded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::printer::CStylePrinter;
    use crate::symbolic::Function;
    use std::collections::BTreeSet;
    use test_log::test;

    fn printer() -> Arc<dyn Printer> {
        Arc::new(CStylePrinter::default())
    }

    fn s(name: &str) -> Expr {
        Expr::symbol(name)
    }

    fn targets() -> Vec<Expr> {
        let shared = Expr::func(Function::Sin, s("x") * s("y"));
        vec![
            shared.clone() + s("z"),
            shared.clone() * s("w"),
            Expr::func(Function::Exp, shared),
        ]
    }

    #[test]
    fn repeated_subexpression_gets_one_symbol() {
        let mut cse = Cse::new("__t_", 100);
        let map = cse.run(targets(), printer());
        // x*y only ever appears inside sin(x*y), so it stays in that definition.
        assert_eq!(map.temporaries().len(), 1);
        let (name, definition) = &map.temporaries()[0];
        assert_eq!(name, "__t_0");
        assert_eq!(definition, &Expr::func(Function::Sin, s("x") * s("y")));
        for target in map.targets() {
            assert!(target.free_symbols().contains(name.as_str()));
            assert!(!target.free_symbols().contains("x"));
        }
    }

    #[test]
    fn inner_node_repeated_elsewhere_is_still_shared() {
        let mut cse = Cse::new("__t_", 100);
        let mut with_product = targets();
        with_product.push(s("x") * s("y") + s("q"));
        let map = cse.run(with_product, printer());
        assert_eq!(map.temporaries().len(), 2);
        assert_eq!(map.temporaries()[0].1, s("x") * s("y"));
        assert_eq!(map.temporaries()[1].1, Expr::Func(Function::Sin, Box::new(s("__t_0"))));
    }

    #[test]
    fn large_single_occurrences_split_but_roots_stay() {
        let mut cse = Cse::new("__t_", 2);
        let target = Expr::func(Function::Cos, s("a") * s("b")) + s("c");
        let map = cse.run(vec![target.clone()], printer());
        // a*b (size 3) and cos(a*b) (size 4) exceed the threshold; the root does too
        // but is never replaced by a temporary.
        assert_eq!(map.temporaries().len(), 2);
        assert_eq!(map.temporaries()[0].1, s("a") * s("b"));
        assert_eq!(map.temporaries()[1].1, Expr::Func(Function::Cos, Box::new(s("__t_0"))));
        let symbols = map.targets()[0].free_symbols();
        assert!(symbols.contains("__t_1"));
        assert!(symbols.contains("c"));
        assert!(!symbols.contains("a"));
        assert_eq!(map.back_substitute(0), Some(target.clone()));

        let lone_root = s("a") * s("b");
        let map = cse.run(vec![lone_root.clone()], printer());
        assert!(map.temporaries().is_empty());
        assert_eq!(map.targets()[0], lone_root);

        let mut relaxed = Cse::new("__t_", 100);
        assert!(relaxed.run(vec![target], printer()).temporaries().is_empty());
    }

    #[test]
    fn definitions_only_use_earlier_symbols() {
        let mut cse = Cse::new("__t_", 3);
        let big = (s("a") + s("b")) * (s("c") + s("d")) + Expr::func(Function::Cos, s("a") * s("c"));
        let map = cse.run(vec![big.clone(), big * s("e")], printer());
        let mut defined = BTreeSet::new();
        for (name, definition) in map.temporaries() {
            for used in definition.free_symbols() {
                if used.starts_with("__t_") {
                    assert!(defined.contains(&used), "{used} used before definition");
                }
            }
            defined.insert(name.clone());
        }
    }

    #[test]
    fn back_substitution_round_trips() {
        let mut cse = Cse::new("__t_", 2);
        let originals = targets();
        let map = cse.run(originals.clone(), printer());
        for (i, original) in originals.iter().enumerate() {
            assert_eq!(&map.back_substitute(i).expect("target exists"), original);
        }
        // a second run over the same targets round-trips as well
        let again = cse.run(originals.clone(), printer());
        for (i, original) in originals.iter().enumerate() {
            assert_eq!(&again.back_substitute(i).expect("target exists"), original);
        }
        assert!(again.temporaries()[0].0 != map.temporaries()[0].0);
    }

    #[test]
    fn rendered_text_is_memoised() {
        let mut cse = Cse::new("__t_", 100);
        let map = cse.run(targets(), printer());
        let first = map.get(0).expect("target 0") as *const str;
        let second = map.get(0).expect("target 0") as *const str;
        assert_eq!(first, second);
        assert_eq!(map.get(0), Some("z + __t_0"));
        assert_eq!(map.temporary(0), Some(("__t_0", "sin(x*y)")));
        assert_eq!(map.get(7), None);
    }

    #[test]
    fn non_canonical_target_is_left_unfactored() {
        let mut cse = Cse::new("__t_", 100);
        let raw = Expr::Add(vec![s("y") * s("x"), s("y") * s("x")]);
        let clean = s("y") * s("x") + s("q");
        let map = cse.run(vec![raw.clone(), clean.clone()], printer());
        assert_eq!(map.degeneracies().len(), 1);
        assert_eq!(map.degeneracies()[0].target, 0);
        assert_eq!(map.targets()[0], raw);
        assert!(map.temporaries().is_empty());
        assert_eq!(map.targets()[1], clean);
    }

    #[test]
    fn disabled_engine_leaves_targets_alone() {
        let settings = TranslatorSettings {
            cse: false,
            ..TranslatorSettings::default()
        };
        let mut cse = Cse::from_settings(&settings);
        let map = cse.run(targets(), printer());
        assert!(map.temporaries().is_empty());
        assert_eq!(map.targets(), targets().as_slice());
    }
}
