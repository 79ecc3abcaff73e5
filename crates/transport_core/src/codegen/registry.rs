//! Replacement rules, the packages that bundle them, and the per-backend
//! registry the engine resolves directives against.

use super::context::{IndexCall, RuleContext, RuleError};
use crate::error::ConfigurationError;
use crate::index::Classification;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// Applied to a line before index expansion.
    Pre,
    /// Applied once per index tuple (or once, rolled).
    Index,
    /// Applied to each emitted line after index expansion.
    Post,
}

/// Number of `{...}` arguments a directive takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    pub fn accepts(&self, count: usize) -> bool {
        match self {
            Arity::Exact(n) => count == *n,
            Arity::AtLeast(n) => count >= *n,
        }
    }

    pub fn minimum(&self) -> usize {
        match self {
            Arity::Exact(n) | Arity::AtLeast(n) => *n,
        }
    }
}

/// Index labels an index rule requires.
#[derive(Debug, Clone, PartialEq)]
pub enum LabelSpec {
    /// One label per classification, in order.
    Exact(Vec<Classification>),
    /// Exactly this many labels, of any classification.
    Count(usize),
    /// At least this many labels, of any classification.
    AtLeast(usize),
}

impl LabelSpec {
    pub fn accepts(&self, classes: &[Classification]) -> bool {
        match self {
            LabelSpec::Exact(expected) => expected.as_slice() == classes,
            LabelSpec::Count(n) => classes.len() == *n,
            LabelSpec::AtLeast(n) => classes.len() >= *n,
        }
    }
}

impl fmt::Display for LabelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelSpec::Exact(classes) if classes.is_empty() => f.write_str("no labels"),
            LabelSpec::Exact(classes) => {
                let tags: Vec<&str> = classes.iter().map(|c| c.tag()).collect();
                f.write_str(&tags.join(" "))
            }
            LabelSpec::Count(n) => write!(f, "{}", n),
            LabelSpec::AtLeast(n) => write!(f, "at least {}", n),
        }
    }
}

pub type PlainHandler =
    Arc<dyn Fn(&mut RuleContext<'_>, &[String]) -> Result<String, RuleError> + Send + Sync>;

pub type IndexHandler =
    Arc<dyn Fn(&mut RuleContext<'_>, &IndexCall<'_>) -> Result<String, RuleError> + Send + Sync>;

/// Rule applied outside index loops (pre- or post-rule).
#[derive(Clone)]
pub struct PlainRule {
    pub token: String,
    pub arity: Arity,
    pub handler: PlainHandler,
}

impl PlainRule {
    pub fn new<F>(token: impl Into<String>, arity: Arity, handler: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>, &[String]) -> Result<String, RuleError> + Send + Sync + 'static,
    {
        Self {
            token: token.into(),
            arity,
            handler: Arc::new(handler),
        }
    }

    /// Rule that always emits the same text and takes no arguments.
    pub fn constant(token: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self::new(token, Arity::Exact(0), move |_, _| Ok(text.clone()))
    }
}

/// Rule evaluated per index tuple.
#[derive(Clone)]
pub struct IndexRule {
    pub token: String,
    pub arity: Arity,
    pub labels: LabelSpec,
    pub handler: IndexHandler,
}

impl IndexRule {
    pub fn new<F>(token: impl Into<String>, arity: Arity, labels: LabelSpec, handler: F) -> Self
    where
        F: Fn(&mut RuleContext<'_>, &IndexCall<'_>) -> Result<String, RuleError> + Send + Sync + 'static,
    {
        Self {
            token: token.into(),
            arity,
            labels,
            handler: Arc::new(handler),
        }
    }
}

/// A pluggable bundle of replacement rules.
pub trait ReplacementRulePackage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the package contributes rules to `backend`.
    fn supports(&self, _backend: &str) -> bool {
        true
    }

    fn pre_rules(&self) -> Vec<PlainRule> {
        Vec::new()
    }

    fn index_rules(&self) -> Vec<IndexRule> {
        Vec::new()
    }

    fn post_rules(&self) -> Vec<PlainRule> {
        Vec::new()
    }
}

#[derive(Clone)]
pub(crate) enum RuleEntry {
    Pre(PlainRule),
    Index(IndexRule),
    Post(PlainRule),
}

impl RuleEntry {
    pub(crate) fn kind(&self) -> RuleKind {
        match self {
            RuleEntry::Pre(_) => RuleKind::Pre,
            RuleEntry::Index(_) => RuleKind::Index,
            RuleEntry::Post(_) => RuleKind::Post,
        }
    }

    pub(crate) fn arity(&self) -> Arity {
        match self {
            RuleEntry::Pre(rule) | RuleEntry::Post(rule) => rule.arity,
            RuleEntry::Index(rule) => rule.arity,
        }
    }
}

/// Rules of one backend, keyed by token. Built once per translation and
/// passed by reference; no rule table outlives its pass.
#[derive(Clone)]
pub struct RuleRegistry {
    backend: String,
    rules: HashMap<String, (String, RuleEntry)>,
    packages: Vec<String>,
}

impl fmt::Debug for RuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tokens: Vec<&String> = self.rules.keys().collect();
        tokens.sort();
        f.debug_struct("RuleRegistry")
            .field("backend", &self.backend)
            .field("packages", &self.packages)
            .field("tokens", &tokens)
            .finish()
    }
}

impl RuleRegistry {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            rules: HashMap::new(),
            packages: Vec::new(),
        }
    }

    /// Builds a registry from every package that supports `backend`.
    pub fn with_packages(
        backend: impl Into<String>,
        packages: &[Arc<dyn ReplacementRulePackage>],
    ) -> Result<Self, ConfigurationError> {
        let mut registry = Self::new(backend);
        for package in packages {
            registry.register(package.as_ref())?;
        }
        Ok(registry)
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Names of the packages registered so far.
    pub fn packages(&self) -> &[String] {
        &self.packages
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Adds every rule of `package`. Any token already claimed by another
    /// package for this backend is a fatal conflict; nothing from the
    /// conflicting package is kept.
    pub fn register(&mut self, package: &dyn ReplacementRulePackage) -> Result<(), ConfigurationError> {
        if !package.supports(&self.backend) {
            return Ok(());
        }
        let entries: Vec<(String, RuleEntry)> = package
            .pre_rules()
            .into_iter()
            .map(|r| (r.token.clone(), RuleEntry::Pre(r)))
            .chain(
                package
                    .index_rules()
                    .into_iter()
                    .map(|r| (r.token.clone(), RuleEntry::Index(r))),
            )
            .chain(
                package
                    .post_rules()
                    .into_iter()
                    .map(|r| (r.token.clone(), RuleEntry::Post(r))),
            )
            .collect();

        let mut seen: HashSet<&str> = HashSet::new();
        for (token, _) in &entries {
            let duplicate_inside = !seen.insert(token.as_str());
            if let Some((first, _)) = self.rules.get(token) {
                return Err(self.conflict(token, first, package.name()));
            }
            if duplicate_inside {
                return Err(self.conflict(token, package.name(), package.name()));
            }
        }

        for (token, entry) in entries {
            self.rules.insert(token, (package.name().to_string(), entry));
        }
        self.packages.push(package.name().to_string());
        Ok(())
    }

    fn conflict(&self, token: &str, first: &str, second: &str) -> ConfigurationError {
        ConfigurationError::DuplicateToken {
            token: token.to_string(),
            backend: self.backend.clone(),
            first: first.to_string(),
            second: second.to_string(),
        }
    }

    pub(crate) fn get(&self, token: &str) -> Option<&RuleEntry> {
        self.rules.get(token).map(|(_, entry)| entry)
    }

    pub fn kind(&self, token: &str) -> Option<RuleKind> {
        self.get(token).map(RuleEntry::kind)
    }

    /// Package that registered `token`.
    pub fn owner(&self, token: &str) -> Option<&str> {
        self.rules.get(token).map(|(package, _)| package.as_str())
    }
}
