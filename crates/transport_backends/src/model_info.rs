//! Model metadata and index helper directives, shared by every backend.

use transport_core::codegen::{
    Arity, IndexCall, IndexRule, LabelSpec, PlainRule, ReplacementRulePackage, RuleError,
};
use transport_core::index::{Classification, IndexValue};
use transport_core::storage::{offset_text, OffsetTerm};

const TOOL: &str = "transport";

/// Model name as a C identifier: anything outside `[A-Za-z0-9_]` becomes `_`.
pub fn identifier(text: &str) -> String {
    let mut out: String = text
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.chars().next().map_or(true, |c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn quoted_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| format!("\"{}\"", n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn concrete(call: &IndexCall<'_>) -> Result<usize, RuleError> {
    match call.values() {
        Some(values) => values.first().copied().ok_or_else(|| RuleError::Failed("no index given".to_string())),
        None => Err(RuleError::NotRollable),
    }
}

/// Pre-rules describing the model, the temporary pool, and the index rules
/// `COORDINATE`, `PARAMETER`, `IDX` and `FLATTEN`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelInfo;

impl ReplacementRulePackage for ModelInfo {
    fn name(&self) -> &str {
        "model_info"
    }

    fn pre_rules(&self) -> Vec<PlainRule> {
        vec![
            PlainRule::constant("TOOL", TOOL),
            PlainRule::constant("VERSION", env!("CARGO_PKG_VERSION")),
            PlainRule::new("MODEL", Arity::Exact(0), |ctx, _| Ok(ctx.model().name().to_string())),
            PlainRule::new("NAME", Arity::Exact(0), |ctx, _| Ok(identifier(ctx.model().name()))),
            PlainRule::new("AUTHOR", Arity::Exact(0), |ctx, _| {
                Ok(ctx.model().description().author.clone().unwrap_or_default())
            }),
            PlainRule::new("TAG", Arity::Exact(0), |ctx, _| {
                Ok(ctx.model().description().tag.clone().unwrap_or_default())
            }),
            PlainRule::new("DESCRIPTION", Arity::Exact(0), |ctx, _| {
                Ok(ctx.model().description().description.clone().unwrap_or_default())
            }),
            PlainRule::new("NUMBER_FIELDS", Arity::Exact(0), |ctx, _| {
                Ok(ctx.model().number_fields().to_string())
            }),
            PlainRule::new("NUMBER_PARAMS", Arity::Exact(0), |ctx, _| {
                Ok(ctx.model().number_params().to_string())
            }),
            PlainRule::new("GUARD", Arity::Exact(1), |ctx, args| {
                Ok(format!(
                    "__{}_{}_{}_H",
                    TOOL.to_uppercase(),
                    identifier(ctx.model().name()).to_uppercase(),
                    identifier(&args[0]).to_uppercase()
                ))
            }),
            PlainRule::new("FIELD_NAME_LIST", Arity::Exact(0), |ctx, _| {
                Ok(quoted_list(ctx.model().field_names()))
            }),
            PlainRule::new("PARAM_NAME_LIST", Arity::Exact(0), |ctx, _| {
                Ok(quoted_list(ctx.model().parameter_names()))
            }),
            PlainRule::new("POTENTIAL", Arity::Exact(0), |ctx, _| {
                Ok(ctx.render(ctx.model().potential()))
            }),
            PlainRule::new("HUBBLE_SQ", Arity::Exact(0), |ctx, _| Ok(ctx.render(&ctx.model().hubble_sq()))),
            PlainRule::new("EPSILON", Arity::Exact(0), |ctx, _| Ok(ctx.render(&ctx.model().epsilon()))),
            PlainRule::new("PLANCK_MASS", Arity::Exact(0), |ctx, _| {
                Ok(ctx.render(&ctx.model().planck_mass()))
            }),
            PlainRule::new("TEMP_POOL", Arity::Exact(1), |ctx, args| {
                ctx.open_pool(&args[0]);
                Ok(String::new())
            }),
        ]
    }

    fn index_rules(&self) -> Vec<IndexRule> {
        vec![
            IndexRule::new(
                "COORDINATE",
                Arity::Exact(0),
                LabelSpec::Exact(vec![Classification::Full]),
                |ctx, call| {
                    let value = concrete(call)?;
                    Ok(ctx.render(&ctx.model().coordinate(value)))
                },
            ),
            IndexRule::new(
                "PARAMETER",
                Arity::Exact(0),
                LabelSpec::Exact(vec![Classification::Parameter]),
                |ctx, call| {
                    let value = concrete(call)?;
                    Ok(ctx.render(&ctx.model().parameter(value)))
                },
            ),
            IndexRule::new("IDX", Arity::Exact(0), LabelSpec::Count(1), |_, call| {
                Ok(match call.values() {
                    Some(values) => values[0].to_string(),
                    None => call.indices[0].decorated(),
                })
            }),
            IndexRule::new("FLATTEN", Arity::Exact(0), LabelSpec::AtLeast(1), |_, call| {
                let ranges: Vec<usize> = call.indices.iter().map(|i| i.numeric_range()).collect();
                let terms: Vec<OffsetTerm> = call
                    .indices
                    .iter()
                    .map(|index| match call.assignment.get(index.label) {
                        Some((_, IndexValue::Concrete(v))) => OffsetTerm::Value(v),
                        _ => OffsetTerm::Runtime(index.decorated()),
                    })
                    .collect();
                Ok(offset_text(&ranges, &terms))
            }),
        ]
    }
}
