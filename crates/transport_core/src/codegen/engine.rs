//! The macro engine: a single forward pass over a template.
//!
//! Each line is scanned into text and directives, validated, and then
//! resolved in three stages: pre-rules, index expansion (index rules once
//! per tuple of the labels bound on the line, or once rolled inside backend
//! loops), and post-rules on every emitted line. Diagnostics from every line
//! are collected; a pass with any diagnostic produces no text.

use super::context::{IndexCall, RuleContext, RuleError};
use super::directive::{scan_line, Directive, ScannedLine, Segment};
use super::registry::{RuleEntry, RuleKind, RuleRegistry};
use crate::error::{ConfigurationError, PassError, TranslationError};
use crate::index::{AbstractIndex, Classification, IndexAssignment};
use log::{debug, info, warn};
use serde::Serialize;

/// Counters reported at the end of a pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub lines_read: usize,
    pub lines_emitted: usize,
    pub replacements: usize,
    pub temporaries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PassOutput {
    pub backend: String,
    pub text: String,
    pub stats: PassStats,
}

enum Stop {
    Diagnostics(Vec<TranslationError>),
    /// Fatal error, with the diagnostics the line produced before it.
    Fatal(ConfigurationError, Vec<TranslationError>),
}

/// Errors met while resolving one line. Only the first diagnostic per
/// directive is kept, so an index rule failing on every tuple reports once.
#[derive(Default)]
struct LineErrors {
    errors: Vec<TranslationError>,
    not_rollable: bool,
}

impl LineErrors {
    fn record(&mut self, directive: &Directive, err: RuleError) -> Result<(), ConfigurationError> {
        self.not_rollable |= err == RuleError::NotRollable;
        let diagnostic = match err {
            RuleError::Configuration(fatal) => return Err(fatal),
            RuleError::MissingTemporaryPool => TranslationError::MissingTemporaryPool {
                token: directive.token.clone(),
                location: directive.location,
            },
            other => TranslationError::RuleFailed {
                token: directive.token.clone(),
                message: other.to_string(),
                location: directive.location,
            },
        };
        if !self.errors.iter().any(|e| e.location() == directive.location) {
            self.errors.push(diagnostic);
        }
        Ok(())
    }
}

fn leading_whitespace(text: &str) -> &str {
    &text[..text.len() - text.trim_start().len()]
}

fn directives(segments: &[Segment]) -> impl Iterator<Item = &Directive> {
    segments.iter().filter_map(|s| match s {
        Segment::Directive(d) => Some(d),
        Segment::Text(_) => None,
    })
}

fn join(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|s| match s {
            Segment::Text(t) => t.as_str(),
            Segment::Directive(_) => "",
        })
        .collect()
}

const LOOP_INDENT: &str = "    ";

pub struct MacroEngine<'r> {
    registry: &'r RuleRegistry,
}

impl<'r> MacroEngine<'r> {
    pub fn new(registry: &'r RuleRegistry) -> Self {
        Self { registry }
    }

    pub fn backend(&self) -> &str {
        self.registry.backend()
    }

    /// Translates `template`. On failure nothing is emitted; the error lists
    /// every bad directive found. A fatal configuration error aborts the pass
    /// and carries the diagnostics found up to that point.
    pub fn run(&self, template: &str, ctx: &mut RuleContext<'_>) -> Result<PassOutput, PassError> {
        let backend = self.backend().to_string();
        info!("{}: translating {} template lines", backend, template.lines().count());

        let mut stats = PassStats::default();
        let mut out: Vec<String> = Vec::new();
        let mut errors: Vec<TranslationError> = Vec::new();
        // Insertion point and indentation of the active temporary pool.
        let mut pool_anchor: Option<(usize, String)> = None;

        for (number, raw) in template.lines().enumerate() {
            stats.lines_read += 1;
            let line = number + 1;
            let ScannedLine { segments, malformed } = scan_line(raw, line);
            let mut problems = malformed;
            problems.extend(self.validate(&segments));
            if !problems.is_empty() {
                errors.extend(problems);
                continue;
            }
            if directives(&segments).next().is_none() {
                out.push(raw.to_string());
                continue;
            }
            let blank_template = join(&segments).trim().is_empty();

            let emitted = match self.resolve_line(raw, segments, ctx, &mut stats) {
                Ok(lines) => lines,
                Err(Stop::Diagnostics(found)) => {
                    errors.extend(found);
                    continue;
                }
                Err(Stop::Fatal(source, found)) => {
                    errors.extend(found);
                    errors.sort_by_key(|e| e.location());
                    warn!(
                        "{}: aborted at line {} after {} directive error(s): {}",
                        backend,
                        line,
                        errors.len(),
                        source
                    );
                    return Err(PassError::Configuration {
                        backend,
                        source,
                        diagnostics: errors,
                    });
                }
            };

            if ctx.take_opened_pool() {
                pool_anchor = Some((out.len(), leading_whitespace(raw).to_string()));
            }
            let pending = ctx.take_pending();
            if !pending.is_empty() {
                let (position, indent) = pool_anchor.get_or_insert_with(|| (out.len(), String::new()));
                for (k, temporary) in pending.iter().enumerate() {
                    out.insert(*position + k, format!("{}{}", indent, temporary));
                }
                *position += pending.len();
                stats.temporaries += pending.len();
            }

            for text in emitted {
                if blank_template && text.trim().is_empty() {
                    continue;
                }
                out.push(text);
            }
        }

        if !errors.is_empty() {
            errors.sort_by_key(|e| e.location());
            warn!("{}: {} directive error(s); no output produced", backend, errors.len());
            return Err(PassError::Translation { backend, errors });
        }

        stats.lines_emitted = out.len();
        let mut text = out.join("\n");
        if template.ends_with('\n') {
            text.push('\n');
        }
        info!(
            "{}: emitted {} lines, {} replacements, {} temporaries",
            backend, stats.lines_emitted, stats.replacements, stats.temporaries
        );
        Ok(PassOutput {
            backend,
            text,
            stats,
        })
    }

    /// One diagnostic per bad directive: unknown token, wrong argument count,
    /// or index labels the rule does not take.
    fn validate(&self, segments: &[Segment]) -> Vec<TranslationError> {
        let mut problems = Vec::new();
        for directive in directives(segments) {
            let token = directive.token.clone();
            let location = directive.location;
            let Some(entry) = self.registry.get(&directive.token) else {
                problems.push(TranslationError::UnresolvedDirective { token, location });
                continue;
            };
            let arity = entry.arity();
            if !arity.accepts(directive.args.len()) {
                problems.push(TranslationError::ArityMismatch {
                    token,
                    expected: arity.minimum(),
                    found: directive.args.len(),
                    location,
                });
                continue;
            }
            match entry {
                RuleEntry::Index(rule) => {
                    let classes: Result<Vec<Classification>, _> =
                        directive.labels.iter().map(|l| Classification::from_label(*l)).collect();
                    match classes {
                        Err(err) => problems.push(TranslationError::Malformed {
                            token,
                            reason: err.to_string(),
                            location,
                        }),
                        Ok(classes) if !rule.labels.accepts(&classes) => {
                            problems.push(TranslationError::LabelMismatch {
                                token,
                                expected: rule.labels.to_string(),
                                found: classes.len(),
                                location,
                            })
                        }
                        Ok(_) => {}
                    }
                }
                RuleEntry::Pre(_) | RuleEntry::Post(_) if directive.has_labels => {
                    problems.push(TranslationError::LabelMismatch {
                        token,
                        expected: "no labels".to_string(),
                        found: directive.labels.len(),
                        location,
                    })
                }
                RuleEntry::Pre(_) | RuleEntry::Post(_) => {}
            }
        }
        problems
    }

    fn resolve_line(
        &self,
        raw: &str,
        segments: Vec<Segment>,
        ctx: &mut RuleContext<'_>,
        stats: &mut PassStats,
    ) -> Result<Vec<String>, Stop> {
        let mut errors = LineErrors::default();
        match self.run_stages(raw, segments, ctx, stats, &mut errors) {
            Ok(lines) if errors.errors.is_empty() => Ok(lines),
            Ok(_) => Err(Stop::Diagnostics(errors.errors)),
            Err(fatal) => Err(Stop::Fatal(fatal, errors.errors)),
        }
    }

    fn run_stages(
        &self,
        raw: &str,
        segments: Vec<Segment>,
        ctx: &mut RuleContext<'_>,
        stats: &mut PassStats,
        errors: &mut LineErrors,
    ) -> Result<Vec<String>, ConfigurationError> {
        let segments = self.apply_plain(RuleKind::Pre, segments, ctx, stats, errors)?;
        let expanded = self.expand(raw, segments, ctx, stats, errors)?;
        let mut lines = Vec::with_capacity(expanded.len());
        for line in expanded {
            let resolved = self.apply_plain(RuleKind::Post, line, ctx, stats, errors)?;
            lines.push(join(&resolved));
        }
        Ok(lines)
    }

    /// Replaces every directive of `kind` (a pre- or post-rule) with its text.
    fn apply_plain(
        &self,
        kind: RuleKind,
        segments: Vec<Segment>,
        ctx: &mut RuleContext<'_>,
        stats: &mut PassStats,
        errors: &mut LineErrors,
    ) -> Result<Vec<Segment>, ConfigurationError> {
        let mut out = Vec::with_capacity(segments.len());
        for segment in segments {
            let directive = match segment {
                Segment::Directive(d) if self.registry.kind(&d.token) == Some(kind) => d,
                other => {
                    out.push(other);
                    continue;
                }
            };
            let rule = match self.registry.get(&directive.token) {
                Some(RuleEntry::Pre(rule)) | Some(RuleEntry::Post(rule)) => rule,
                _ => continue,
            };
            match (rule.handler)(ctx, &directive.args) {
                Ok(text) => {
                    debug!("line {}: ${} resolved", directive.location.line, directive.token);
                    stats.replacements += 1;
                    out.push(Segment::Text(text));
                }
                Err(err) => errors.record(&directive, err)?,
            }
        }
        Ok(out)
    }

    /// Expands the index rules of a line. Returns one segment list per
    /// emitted line; loop scaffolding lines are plain text.
    fn expand(
        &self,
        raw: &str,
        segments: Vec<Segment>,
        ctx: &mut RuleContext<'_>,
        stats: &mut PassStats,
        errors: &mut LineErrors,
    ) -> Result<Vec<Vec<Segment>>, ConfigurationError> {
        let index_directives: Vec<&Directive> = directives(&segments)
            .filter(|d| self.registry.kind(&d.token) == Some(RuleKind::Index))
            .collect();
        if index_directives.is_empty() {
            return Ok(vec![segments]);
        }

        let (fields, params) = (ctx.model().number_fields(), ctx.model().number_params());
        let (prefix, suffix) = (ctx.settings().index_prefix.clone(), ctx.settings().index_suffix.clone());
        let make = |label: char| {
            AbstractIndex::from_label(label, fields, params)
                .map(|i| i.with_decoration(prefix.clone(), suffix.clone()))
        };
        let mut labels: Vec<char> = Vec::new();
        for directive in &index_directives {
            for label in &directive.labels {
                if !labels.contains(label) {
                    labels.push(*label);
                }
            }
        }
        let indices = labels.iter().map(|l| make(*l)).collect::<Result<Vec<_>, _>>()?;
        let own: Vec<Vec<AbstractIndex>> = segments
            .iter()
            .map(|s| match s {
                Segment::Directive(d) => d.labels.iter().map(|l| make(*l)).collect::<Result<Vec<_>, _>>(),
                Segment::Text(_) => Ok(Vec::new()),
            })
            .collect::<Result<_, _>>()?;

        let tuples: usize = indices.iter().map(|i| i.numeric_range()).product();
        if !ctx.settings().unroll.unrolls(tuples) {
            let assignment = IndexAssignment::abstract_over(&indices);
            // Counted only if the rolled form is kept.
            let mut rolled_stats = PassStats::default();
            let mut rolled_errors = LineErrors::default();
            let body = self.substitute(&segments, &own, &assignment, ctx, &mut rolled_stats, &mut rolled_errors)?;
            if !rolled_errors.not_rollable {
                stats.replacements += rolled_stats.replacements;
                errors.errors.extend(rolled_errors.errors);
                return Ok(self.wrap_loops(raw, body, &indices, ctx));
            }
            warn!(
                "{}: line {} has a directive with no rolled form; unrolling {} tuples",
                self.backend(),
                index_directives[0].location.line,
                tuples
            );
        }

        let mut lines = Vec::with_capacity(tuples);
        for assignment in IndexAssignment::enumerate(&indices) {
            lines.push(self.substitute(&segments, &own, &assignment, ctx, stats, errors)?);
        }
        Ok(lines)
    }

    fn substitute(
        &self,
        segments: &[Segment],
        own: &[Vec<AbstractIndex>],
        assignment: &IndexAssignment,
        ctx: &mut RuleContext<'_>,
        stats: &mut PassStats,
        errors: &mut LineErrors,
    ) -> Result<Vec<Segment>, ConfigurationError> {
        let mut out = Vec::with_capacity(segments.len());
        for (segment, indices) in segments.iter().zip(own) {
            let directive = match segment {
                Segment::Directive(d) if self.registry.kind(&d.token) == Some(RuleKind::Index) => d,
                other => {
                    out.push(other.clone());
                    continue;
                }
            };
            let Some(RuleEntry::Index(rule)) = self.registry.get(&directive.token) else {
                continue;
            };
            let call = IndexCall {
                token: &directive.token,
                args: &directive.args,
                indices,
                assignment,
            };
            match (rule.handler)(ctx, &call) {
                Ok(text) => {
                    stats.replacements += 1;
                    out.push(Segment::Text(text));
                }
                Err(err) => errors.record(directive, err)?,
            }
        }
        Ok(out)
    }

    fn wrap_loops(
        &self,
        raw: &str,
        body: Vec<Segment>,
        indices: &[AbstractIndex],
        ctx: &RuleContext<'_>,
    ) -> Vec<Vec<Segment>> {
        let indent = leading_whitespace(raw);
        let printer = ctx.printer();
        let mut lines = Vec::with_capacity(2 * indices.len() + 1);
        for (depth, index) in indices.iter().enumerate() {
            let text = format!("{}{}{}", indent, LOOP_INDENT.repeat(depth), printer.loop_open(index));
            lines.push(vec![Segment::Text(text)]);
        }
        let mut body = body;
        let body_indent = format!("{}{}", indent, LOOP_INDENT.repeat(indices.len()));
        match body.first_mut() {
            Some(Segment::Text(first)) => *first = format!("{}{}", body_indent, first.trim_start()),
            _ => body.insert(0, Segment::Text(body_indent)),
        }
        lines.push(body);
        for depth in (0..indices.len()).rev() {
            let text = format!("{}{}{}", indent, LOOP_INDENT.repeat(depth), printer.loop_close());
            lines.push(vec![Segment::Text(text)]);
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codegen::{Arity, IndexRule, LabelSpec, PlainRule, ReplacementRulePackage};
    use crate::error::Location;
    use crate::model::{DerivedTensorSpec, Model, ModelDescription};
    use crate::printer::{CStylePrinter, Printer};
    use crate::settings::{TranslatorSettings, UnrollPolicy};
    use crate::tensors::{TensorId, TensorSet};
    use std::sync::Arc;
    use test_log::test;

    struct Fixture;

    fn renames(id: TensorId, args: &[String]) -> Vec<(String, String)> {
        id.placeholders()
            .iter()
            .zip(args)
            .map(|(from, to)| (from.to_string(), to.clone()))
            .collect()
    }

    impl ReplacementRulePackage for Fixture {
        fn name(&self) -> &str {
            "fixture"
        }

        fn pre_rules(&self) -> Vec<PlainRule> {
            vec![
                PlainRule::new("TEMP_POOL", Arity::Exact(1), |ctx, args| {
                    ctx.open_pool(&args[0]);
                    Ok(String::new())
                }),
                PlainRule::new("MODEL", Arity::Exact(0), |ctx, _| Ok(ctx.model().name().to_string())),
            ]
        }

        fn index_rules(&self) -> Vec<IndexRule> {
            vec![
                IndexRule::new("IDX", Arity::Exact(0), LabelSpec::AtLeast(1), |_, call| {
                    Ok(match call.values() {
                        Some(values) => values[0].to_string(),
                        None => call.indices[0].decorated(),
                    })
                }),
                IndexRule::new(
                    "U1",
                    Arity::Exact(2),
                    LabelSpec::Exact(TensorId::U1.builtin_signature().to_vec()),
                    |ctx, call| ctx.tensor_text(TensorId::U1, call, &renames(TensorId::U1, call.args)),
                ),
                IndexRule::new(
                    "U2",
                    Arity::Exact(4),
                    LabelSpec::Exact(TensorId::U2.builtin_signature().to_vec()),
                    |ctx, call| ctx.tensor_text(TensorId::U2, call, &renames(TensorId::U2, call.args)),
                ),
                IndexRule::new(
                    "DV",
                    Arity::Exact(0),
                    LabelSpec::Exact(TensorId::Dv.builtin_signature().to_vec()),
                    |ctx, call| ctx.tensor_text(TensorId::Dv, call, &[]),
                ),
                IndexRule::new(
                    "COORDINATE",
                    Arity::Exact(0),
                    LabelSpec::Exact(vec![Classification::Full]),
                    |_, call| match call.values() {
                        Some(values) => Ok(format!("x{}", values[0])),
                        None => Err(RuleError::NotRollable),
                    },
                ),
                IndexRule::new("DERIVED", Arity::Exact(1), LabelSpec::AtLeast(0), |ctx, call| {
                    let id = ctx.tensors().lookup(&call.args[0])?;
                    ctx.tensor_text(id, call, &[])
                }),
            ]
        }

        fn post_rules(&self) -> Vec<PlainRule> {
            vec![PlainRule::constant("REAL_TYPE", "double")]
        }
    }

    fn description() -> ModelDescription {
        ModelDescription::from_json(
            r#"{
                "name": "double quadratic",
                "fields": ["phi", "chi"],
                "parameters": ["m_phi", "m_chi"],
                "potential": "m_phi^2*phi^2/2 + m_chi^2*chi^2/2"
            }"#,
        )
        .expect("description should parse")
    }

    fn translate_with(
        description: ModelDescription,
        template: &str,
        settings: &TranslatorSettings,
    ) -> Result<PassOutput, PassError> {
        let packages: Vec<Arc<dyn ReplacementRulePackage>> = vec![Arc::new(Fixture)];
        let registry = RuleRegistry::with_packages("cpp", &packages).expect("registry builds");
        let model = Model::from_description(description).expect("valid model");
        let mut tensors = TensorSet::new(model, settings).expect("tensor set builds");
        let printer: Arc<dyn Printer> = Arc::new(CStylePrinter::default());
        let mut ctx = RuleContext::new(&mut tensors, settings, printer);
        MacroEngine::new(&registry).run(template, &mut ctx)
    }

    fn translate(template: &str) -> Result<PassOutput, PassError> {
        translate_with(description(), template, &TranslatorSettings::default())
    }

    const U2_TEMPLATE: &str = "// $MODEL
$TEMP_POOL{\"const double $1 = $2;\"}
$REAL_TYPE __u2[$IDX[A]*4 + $IDX[B]] = $U2[AB]{k, a, Hsq, eps};
";

    #[test]
    fn well_formed_template_translates() {
        let output = translate(U2_TEMPLATE).expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        assert_eq!(lines[0], "// double quadratic");

        let components: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("double __u2["))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(components.len(), 16);
        assert!(lines[components[0]].starts_with("double __u2[0*4 + 0] = "));
        assert!(lines[components[15]].starts_with("double __u2[3*4 + 3] = "));

        let temporaries: Vec<usize> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.starts_with("const double __t_"))
            .map(|(i, _)| i)
            .collect();
        assert!(!temporaries.is_empty());
        assert!(temporaries.iter().all(|t| *t < components[0]));
        assert_eq!(output.stats.temporaries, temporaries.len());
        assert_eq!(output.stats.lines_read, 3);
        assert_eq!(output.stats.lines_emitted, lines.len());
        assert!(output.text.ends_with('\n'));

        assert!(!output.text.contains('$'));
        assert!(!output.text.contains("__Hsq"));
        assert!(output.text.contains("Hsq"));
    }

    #[test]
    fn one_bad_directive_gives_one_diagnostic() {
        let template = format!("{}x = $U2[AB]{{k}};\n", U2_TEMPLATE);
        let err = translate(&template).expect_err("arity mismatch");
        let diagnostics = err.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(
            diagnostics[0],
            TranslationError::ArityMismatch {
                token: "U2".to_string(),
                expected: 4,
                found: 1,
                location: Location::new(4, 5),
            }
        );
        assert_eq!(err.backend(), "cpp");
    }

    #[test]
    fn every_bad_directive_is_reported_in_order() {
        let template = "a = $IDX[#];\n$NOPE\n$MODEL[A]\n$U1[a]{x, y}\n";
        let err = translate(template).expect_err("four bad directives");
        let diagnostics = err.diagnostics();
        assert_eq!(diagnostics.len(), 4);
        assert!(matches!(diagnostics[0], TranslationError::Malformed { .. }));
        assert_eq!(
            diagnostics[1],
            TranslationError::UnresolvedDirective {
                token: "NOPE".to_string(),
                location: Location::new(2, 1),
            }
        );
        assert!(matches!(diagnostics[2], TranslationError::LabelMismatch { ref expected, .. } if expected == "no labels"));
        assert!(matches!(diagnostics[3], TranslationError::LabelMismatch { ref expected, .. } if expected == "full"));
    }

    #[test]
    fn tensor_temporaries_need_a_pool() {
        let err = translate("v = $U2[AB]{k, a, Hsq, eps};\n").expect_err("no pool");
        assert_eq!(
            err.diagnostics(),
            [TranslationError::MissingTemporaryPool {
                token: "U2".to_string(),
                location: Location::new(1, 5),
            }]
        );

        // Small components extract nothing and need no pool.
        let output = translate("dV[$IDX[a]] = $DV[a];\n").expect("no temporaries");
        assert_eq!(output.text.lines().count(), 2);
        assert!(output.text.lines().all(|l| l.contains("m_")));
    }

    #[test]
    fn rolled_emission_wraps_backend_loops() {
        let settings = TranslatorSettings {
            unroll: UnrollPolicy::Never,
            ..TranslatorSettings::default()
        };
        let output = translate_with(description(), "  __u1[$IDX[A]] = $U1[A]{__Hsq, __eps};\n", &settings)
            .expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], "  for(unsigned int __A = 0; __A < 4; ++__A) {");
        assert!(
            lines[1].starts_with("      __u1[__A] = (__A < 2 ? __x[(__A+2)] : "),
            "unexpected body {}",
            lines[1]
        );
        assert_eq!(lines[2], "  }");
    }

    #[test]
    fn tables_fall_back_to_unrolled_lines() {
        let settings = TranslatorSettings {
            unroll: UnrollPolicy::Never,
            ..TranslatorSettings::default()
        };
        let output = translate_with(description(), "dV[$IDX[a]] = $DV[a];\n", &settings).expect("translates");
        let lines: Vec<&str> = output.text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("dV[0] = "));
        assert!(lines[1].starts_with("dV[1] = "));
    }

    #[test]
    fn unrolled_fallback_counts_only_kept_replacements() {
        let settings = TranslatorSettings {
            unroll: UnrollPolicy::Never,
            ..TranslatorSettings::default()
        };
        let output = translate_with(description(), "x[$IDX[A]] = $COORDINATE[A];\n", &settings)
            .expect("falls back to unrolled lines");
        assert_eq!(output.text, "x[0] = x0;\nx[1] = x1;\nx[2] = x2;\nx[3] = x3;\n");
        assert_eq!(output.stats.replacements, 8);

        let output = translate_with(description(), "x[$IDX[A]] = 0;\n", &settings).expect("rolls");
        assert_eq!(output.stats.replacements, 1);
    }

    #[test]
    fn directives_before_a_malformed_one_are_checked() {
        let err = translate("$NOPE $U1[A{x\n").expect_err("two bad directives");
        let diagnostics = err.diagnostics();
        assert_eq!(diagnostics.len(), 2);
        assert_eq!(
            diagnostics[0],
            TranslationError::UnresolvedDirective {
                token: "NOPE".to_string(),
                location: Location::new(1, 1),
            }
        );
        assert!(matches!(
            diagnostics[1],
            TranslationError::Malformed { ref token, location, .. } if token == "U1" && location == Location::new(1, 7)
        ));
    }

    fn cyclic_description() -> ModelDescription {
        let mut desc = description();
        desc.derived.push(DerivedTensorSpec {
            name: "w".to_string(),
            indices: "a".to_string(),
            formula: "q(a)".to_string(),
        });
        desc.derived.push(DerivedTensorSpec {
            name: "q".to_string(),
            indices: "a".to_string(),
            formula: "w(a)".to_string(),
        });
        desc
    }

    #[test]
    fn fatal_error_keeps_earlier_diagnostics() {
        let err = translate_with(
            cyclic_description(),
            "$NOPE\nx = $DERIVED[a]{w};\n$ALSO_NOPE\n",
            &TranslatorSettings::default(),
        )
        .expect_err("cycle");
        assert!(matches!(
            err,
            PassError::Configuration {
                source: ConfigurationError::CyclicDependency { .. },
                ..
            }
        ));
        // Lines after the abort are never read.
        assert_eq!(
            err.diagnostics(),
            [TranslationError::UnresolvedDirective {
                token: "NOPE".to_string(),
                location: Location::new(1, 1),
            }]
        );
    }

    #[test]
    fn cyclic_derived_tensor_aborts_the_pass() {
        let err = translate_with(cyclic_description(), "x = $DERIVED[a]{w};\n", &TranslatorSettings::default())
            .expect_err("cycle");
        assert!(matches!(
            err,
            PassError::Configuration {
                source: ConfigurationError::CyclicDependency { .. },
                ..
            }
        ));
    }
}
