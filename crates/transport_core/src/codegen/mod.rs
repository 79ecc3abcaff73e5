//! Backend code generation.
//!
//! Templates carry `$TOKEN[labels]{args}` directives. A [`RuleRegistry`] built
//! for one backend from [`ReplacementRulePackage`]s maps every token to a
//! pre-, index- or post-rule, and the [`MacroEngine`] resolves a template
//! against it in one forward pass, drawing tensor text from a
//! [`RuleContext`].

mod context;
mod directive;
mod engine;
mod registry;

pub use context::{IndexCall, RuleContext, RuleError};
pub use directive::{scan_line, split_arguments, Directive, ScannedLine, Segment};
pub use engine::{MacroEngine, PassOutput, PassStats};
pub use registry::{
    Arity, IndexHandler, IndexRule, LabelSpec, PlainHandler, PlainRule, ReplacementRulePackage,
    RuleKind, RuleRegistry,
};
