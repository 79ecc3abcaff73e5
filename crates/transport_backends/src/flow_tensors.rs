//! Tensor directives.
//!
//! Each built-in tensor has one index rule whose arguments rename the
//! tensor's placeholder symbols, in [`TensorId::placeholders`] order, to the
//! runtime variables of the template: `$U2[AB]{k, a, Hsq, eps}`.
//! `$DERIVED[..]{name, placeholder=variable, ..}` emits a model-declared
//! tensor.

use transport_core::codegen::{Arity, IndexRule, LabelSpec, ReplacementRulePackage, RuleError};
use transport_core::model::placeholders;
use transport_core::tensors::TensorId;

/// Directive token of every built-in tensor.
pub const TOKENS: [(&str, TensorId); 14] = [
    ("U1", TensorId::U1),
    ("U2", TensorId::U2),
    ("U3", TensorId::U3),
    ("A_TENSOR", TensorId::A),
    ("B_TENSOR", TensorId::B),
    ("C_TENSOR", TensorId::C),
    ("M_TENSOR", TensorId::Mass),
    ("SR_VELOCITY", TensorId::SrVelocity),
    ("DV", TensorId::Dv),
    ("DDV", TensorId::Ddv),
    ("DDDV", TensorId::Dddv),
    ("CONNEXION", TensorId::Connexion),
    ("ZETA_XFM_1", TensorId::Zeta1),
    ("ZETA_XFM_2", TensorId::Zeta2),
];

const ALL_PLACEHOLDERS: [&str; 7] = [
    placeholders::HUBBLE_SQ,
    placeholders::EPSILON,
    placeholders::K,
    placeholders::K1,
    placeholders::K2,
    placeholders::K3,
    placeholders::SCALE_FACTOR,
];

fn positional_renames(id: TensorId, args: &[String]) -> Vec<(String, String)> {
    id.placeholders()
        .iter()
        .zip(args)
        .map(|(from, to)| (from.to_string(), to.clone()))
        .collect()
}

/// Parses `placeholder=variable` pairs.
fn named_renames(args: &[String]) -> Result<Vec<(String, String)>, RuleError> {
    args.iter()
        .map(|arg| {
            let (from, to) = arg
                .split_once('=')
                .ok_or_else(|| RuleError::Failed(format!("expected 'placeholder=variable', got '{}'", arg)))?;
            let (from, to) = (from.trim(), to.trim());
            if !ALL_PLACEHOLDERS.contains(&from) {
                return Err(RuleError::Failed(format!("'{}' is not a placeholder", from)));
            }
            if to.is_empty() {
                return Err(RuleError::Failed(format!("no variable given for '{}'", from)));
            }
            Ok((from.to_string(), to.to_string()))
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FlowTensors;

impl ReplacementRulePackage for FlowTensors {
    fn name(&self) -> &str {
        "flow_tensors"
    }

    fn index_rules(&self) -> Vec<IndexRule> {
        let mut rules: Vec<IndexRule> = TOKENS
            .iter()
            .map(|&(token, id)| {
                IndexRule::new(
                    token,
                    Arity::Exact(id.placeholders().len()),
                    LabelSpec::Exact(id.builtin_signature().to_vec()),
                    move |ctx, call| ctx.tensor_text(id, call, &positional_renames(id, call.args)),
                )
            })
            .collect();
        rules.push(IndexRule::new(
            "DERIVED",
            Arity::AtLeast(1),
            LabelSpec::AtLeast(0),
            |ctx, call| {
                let id = ctx.tensors().lookup(&call.args[0])?;
                let renames = named_renames(&call.args[1..])?;
                ctx.tensor_text(id, call, &renames)
            },
        ));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::translate;
    use transport_core::error::{ConfigurationError, ParseError, PassError, TranslationError};
    use transport_core::symbolic::{parse, Ast, Expr, Resolver};
    use transport_core::{Model, ModelDescription, TranslatorSettings, UnrollPolicy};
    use std::collections::HashMap;
    use test_log::test;

    fn model() -> Model {
        let description = ModelDescription::from_json(
            r#"{
                "name": "quartic",
                "fields": ["phi", "chi"],
                "parameters": ["lambda", "g"],
                "potential": "lambda*phi^4/4 + g*phi^2*chi^2/2",
                "derived": [
                    { "name": "kinetic", "indices": "", "formula": "eps*H2" },
                    { "name": "grad", "indices": "a", "formula": "dV(a)/V" }
                ]
            }"#,
        )
        .expect("description should parse");
        Model::from_description(description).expect("valid model")
    }

    fn rendered_component(line: &str) -> &str {
        line.split_once(" = ").map(|(_, rhs)| rhs.trim_end_matches(';')).expect("assignment")
    }

    #[test]
    fn every_builtin_token_resolves() {
        let template = "$TEMP_POOL{\"const double $1 = $2;\"}
u1 = $U1[A]{Hsq, eps};
u2 = $U2[AB]{k, a, Hsq, eps};
u3 = $U3[ABC]{k1, k2, k3, a, Hsq, eps};
A = $A_TENSOR[abc]{k1, k2, k3, a, Hsq, eps};
B = $B_TENSOR[abc]{k1, k2, k3, a, Hsq, eps};
C = $C_TENSOR[abc]{k1, k2, k3, a, Hsq, eps};
M = $M_TENSOR[ab]{Hsq, eps};
sr = $SR_VELOCITY[a];
dV = $DV[a];
ddV = $DDV[ab];
dddV = $DDDV[abc];
G = $CONNEXION[abc];
z1 = $ZETA_XFM_1[A]{Hsq, eps};
z2 = $ZETA_XFM_2[AB]{Hsq, eps};
";
        let output = translate(&model(), "cpp", template, &TranslatorSettings::default()).expect("translates");
        let count = |prefix: &str| output.text.lines().filter(|l| l.starts_with(prefix)).count();
        assert_eq!(count("u1 = "), 4);
        assert_eq!(count("u2 = "), 16);
        assert_eq!(count("u3 = "), 64);
        assert_eq!(count("A = "), 8);
        assert_eq!(count("M = "), 4);
        assert_eq!(count("dV = "), 2);
        assert_eq!(count("G = "), 8);
        assert_eq!(count("z2 = "), 16);
        assert!(!output.text.contains("__Hsq"));
        assert!(!output.text.contains('$'));
    }

    #[test]
    fn canonical_connexion_vanishes() {
        let output = translate(&model(), "cpp", "G = $CONNEXION[abc];\n", &TranslatorSettings::default())
            .expect("translates");
        assert!(output.text.lines().all(|l| l == "G = 0.0;"));
    }

    /// Reads emitted text back; `pow` is the only call the printers emit
    /// besides the elementary functions.
    struct Emitted;

    impl Resolver for Emitted {
        type Error = ParseError;

        fn identifier(&mut self, name: &str) -> Result<Expr, ParseError> {
            Ok(Expr::symbol(name))
        }

        fn call(&mut self, name: &str, args: &[Ast]) -> Result<Expr, ParseError> {
            match (name, args) {
                ("pow", [base, exp]) => Ok(Expr::pow(base.lower(self)?, exp.lower(self)?)),
                _ => Err(ParseError::new(format!("unexpected call '{}'", name), 0)),
            }
        }
    }

    #[test]
    fn gradient_matches_the_potential() {
        let output = translate(&model(), "vexcl", "dV = $DV[a];\n", &TranslatorSettings::default())
            .expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        let env: HashMap<String, f64> = [("phi", 0.5), ("chi", 2.0), ("lambda", 0.1), ("g", 3.0)]
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        let eval = |text: &str| {
            parse(text)
                .expect("emitted text parses")
                .lower(&mut Emitted)
                .expect("lowers")
                .evaluate(&env)
                .expect("evaluates")
        };
        // dV/dphi = lambda*phi^3 + g*phi*chi^2, dV/dchi = g*phi^2*chi
        assert!((eval(rendered_component(lines[0])) - (0.1 * 0.125 + 3.0 * 0.5 * 4.0)).abs() < 1e-12);
        assert!((eval(rendered_component(lines[1])) - (3.0 * 0.25 * 2.0)).abs() < 1e-12);
    }

    #[test]
    fn derived_tensors_take_named_renames() {
        let output = translate(
            &model(),
            "cpp",
            "k = $DERIVED{kinetic, __Hsq=H2, __eps=e};\n",
            &TranslatorSettings::default(),
        )
        .expect("translates");
        assert!(output.text.starts_with("k = "));
        assert!(output.text.contains("H2"));
        assert!(!output.text.contains("__eps"));
        assert!(!output.text.contains("__Hsq"));

        let template = "$TEMP_POOL{\"const double $1 = $2;\"}\ng[$IDX[a]] = $DERIVED[a]{grad};\n";
        let output = translate(&model(), "cpp", template, &TranslatorSettings::default()).expect("translates");
        assert_eq!(output.text.lines().filter(|l| l.starts_with("g[")).count(), 2);
    }

    #[test]
    fn bad_derived_arguments_are_diagnostics() {
        let err = translate(&model(), "cpp", "k = $DERIVED{kinetic, Hsq};\n", &TranslatorSettings::default())
            .expect_err("not a pair");
        assert!(matches!(err.diagnostics(), [TranslationError::RuleFailed { .. }]));

        let err = translate(&model(), "cpp", "k = $DERIVED{missing};\n", &TranslatorSettings::default())
            .expect_err("unknown tensor");
        assert!(matches!(
            err,
            PassError::Configuration {
                source: ConfigurationError::UnknownTensor { .. },
                ..
            }
        ));
    }

    #[test]
    fn wrong_labels_name_the_signature() {
        let err = translate(&model(), "cpp", "x = $U2[ab]{k, a, Hsq, eps};\n", &TranslatorSettings::default())
            .expect_err("field-only labels");
        assert!(matches!(
            err.diagnostics(),
            [TranslationError::LabelMismatch { expected, .. }] if expected == "full full"
        ));
    }

    #[test]
    fn rolled_flow_uses_loops() {
        let rolled = TranslatorSettings {
            unroll: UnrollPolicy::Never,
            ..TranslatorSettings::default()
        };
        let output = translate(&model(), "cpp", "du[$IDX[A]] = $U1[A]{Hsq, eps};\n", &rolled).expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("for(unsigned int __A = 0; __A < 4; ++__A)"));
        assert!(lines[1].contains("du[__A] = (__A < 2 ? "));
    }
}
