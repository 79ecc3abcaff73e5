//! Model description and the symbolic resources derived from it.

use crate::error::ConfigurationError;
use crate::index::Classification;
use crate::symbolic::{parse, Ast, Expr, Resolver};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Placeholder symbols the tensor formulas are written against. Tensor
/// directives rename them to runtime variables chosen by the template.
pub mod placeholders {
    pub const HUBBLE_SQ: &str = "__Hsq";
    pub const EPSILON: &str = "__eps";
    pub const K: &str = "__k";
    pub const K1: &str = "__k1";
    pub const K2: &str = "__k2";
    pub const K3: &str = "__k3";
    pub const SCALE_FACTOR: &str = "__a";
}

/// Names a derived formula may use besides model symbols and tensor calls.
pub const RESERVED_NAMES: &[&str] = &[
    "V", "H2", "eps", "delta", "field", "momentum", "dV", "ddV", "dddV", "Gamma", "sr", "M",
    "u1", "u2", "u3", "A", "B", "C", "zeta1", "zeta2", "param",
];

/// Names a model may not declare: the formula vocabulary, and anything with
/// the `__` prefix of placeholders, momenta and temporaries.
fn is_reserved(name: &str) -> bool {
    name.starts_with("__") || RESERVED_NAMES.contains(&name)
}

fn default_planck_mass() -> String {
    "M_P".to_string()
}

/// Declaration of a model-specific tensor built from other tensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedTensorSpec {
    pub name: String,
    /// Index labels, classified by the label convention (e.g. `"aB"`).
    #[serde(default)]
    pub indices: String,
    pub formula: String,
}

/// Parsed model description, as supplied by the upstream model parser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub fields: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
    pub potential: String,
    #[serde(default)]
    pub metric: Option<Vec<Vec<String>>>,
    #[serde(default)]
    pub inverse_metric: Option<Vec<Vec<String>>>,
    #[serde(default = "default_planck_mass")]
    pub planck_mass: String,
    #[serde(default)]
    pub derived: Vec<DerivedTensorSpec>,
}

impl ModelDescription {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse model description JSON.")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model description {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("In model description {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Metric {
    g: Vec<Vec<Expr>>,
    g_inv: Vec<Vec<Expr>>,
}

/// A derived tensor after its labels and formula have been parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedDefinition {
    pub name: String,
    pub labels: Vec<char>,
    pub classes: Vec<Classification>,
    pub formula: Ast,
    /// Tensor names the formula calls, in order of appearance.
    pub calls: Vec<String>,
}

/// Symbolic resources of a model: coordinates, parameters, potential,
/// field-space metric and the background quantities built from them.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
    description: ModelDescription,
    momenta: Vec<String>,
    potential: Expr,
    metric: Option<Metric>,
    derived: Vec<DerivedDefinition>,
}

struct ModelSymbols<'a> {
    allowed: &'a HashSet<String>,
    context: String,
}

impl Resolver for ModelSymbols<'_> {
    type Error = ConfigurationError;

    fn identifier(&mut self, name: &str) -> Result<Expr, ConfigurationError> {
        if self.allowed.contains(name) {
            Ok(Expr::symbol(name))
        } else {
            Err(ConfigurationError::UnknownSymbol {
                name: name.to_string(),
                context: self.context.clone(),
            })
        }
    }

    fn call(&mut self, name: &str, _args: &[Ast]) -> Result<Expr, ConfigurationError> {
        Err(ConfigurationError::UnknownSymbol {
            name: name.to_string(),
            context: self.context.clone(),
        })
    }
}

fn parse_in(text: &str, context: &str, allowed: &HashSet<String>) -> Result<Expr, ConfigurationError> {
    let ast = parse(text).map_err(|e| ConfigurationError::Parse {
        context: context.to_string(),
        message: e.to_string(),
    })?;
    ast.lower(&mut ModelSymbols {
        allowed,
        context: context.to_string(),
    })
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => chars.all(|c| c.is_alphanumeric() || c == '_'),
        _ => false,
    }
}

impl Model {
    pub fn from_description(description: ModelDescription) -> Result<Self, ConfigurationError> {
        if description.fields.is_empty() {
            return Err(ConfigurationError::InvalidModel(
                "a model needs at least one field".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        let names = description
            .fields
            .iter()
            .chain(&description.parameters)
            .chain(std::iter::once(&description.planck_mass));
        for name in names {
            if !is_identifier(name) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "'{}' is not a valid identifier",
                    name
                )));
            }
            if is_reserved(name) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "'{}' is a reserved name",
                    name
                )));
            }
            if !seen.insert(name.clone()) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "'{}' is declared twice",
                    name
                )));
            }
        }

        let potential = parse_in(&description.potential, "potential", &seen)?;
        let momenta = description
            .fields
            .iter()
            .map(|f| format!("__d{}", f))
            .collect();
        let metric = Self::build_metric(&description, &seen)?;
        let derived = Self::build_derived(&description, &seen)?;

        Ok(Self {
            description,
            momenta,
            potential,
            metric,
            derived,
        })
    }

    fn build_metric(
        description: &ModelDescription,
        allowed: &HashSet<String>,
    ) -> Result<Option<Metric>, ConfigurationError> {
        let n = description.fields.len();
        let parse_matrix = |rows: &Vec<Vec<String>>, what: &str| -> Result<Vec<Vec<Expr>>, ConfigurationError> {
            if rows.len() != n || rows.iter().any(|r| r.len() != n) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "{} must be a {}x{} matrix",
                    what, n, n
                )));
            }
            rows.iter()
                .enumerate()
                .map(|(i, row)| {
                    row.iter()
                        .enumerate()
                        .map(|(j, text)| parse_in(text, &format!("{}[{}][{}]", what, i, j), allowed))
                        .collect()
                })
                .collect()
        };

        let Some(rows) = &description.metric else {
            if description.inverse_metric.is_some() {
                return Err(ConfigurationError::InvalidModel(
                    "inverse_metric given without metric".to_string(),
                ));
            }
            return Ok(None);
        };
        let g = parse_matrix(rows, "metric")?;
        for i in 0..n {
            for j in 0..i {
                if g[i][j] != g[j][i] {
                    return Err(ConfigurationError::InvalidModel(format!(
                        "metric is not symmetric at ({}, {})",
                        i, j
                    )));
                }
            }
        }

        let g_inv = match &description.inverse_metric {
            Some(rows) => parse_matrix(rows, "inverse_metric")?,
            None => {
                let diagonal = (0..n).all(|i| (0..n).all(|j| i == j || g[i][j].is_number(0.0)));
                if !diagonal {
                    return Err(ConfigurationError::InvalidModel(
                        "a non-diagonal metric needs an explicit inverse_metric".to_string(),
                    ));
                }
                (0..n)
                    .map(|i| {
                        (0..n)
                            .map(|j| {
                                if i == j {
                                    g[i][i].clone().recip()
                                } else {
                                    Expr::num(0.0)
                                }
                            })
                            .collect()
                    })
                    .collect()
            }
        };
        Ok(Some(Metric { g, g_inv }))
    }

    fn build_derived(
        description: &ModelDescription,
        model_names: &HashSet<String>,
    ) -> Result<Vec<DerivedDefinition>, ConfigurationError> {
        let mut out: Vec<DerivedDefinition> = Vec::new();
        for spec in &description.derived {
            if is_reserved(&spec.name) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "derived tensor name '{}' is a reserved name",
                    spec.name
                )));
            }
            if !is_identifier(&spec.name)
                || model_names.contains(&spec.name)
                || out.iter().any(|d| d.name == spec.name)
            {
                return Err(ConfigurationError::InvalidModel(format!(
                    "derived tensor name '{}' is invalid or already taken",
                    spec.name
                )));
            }
            let labels: Vec<char> = spec.indices.chars().filter(|c| !c.is_whitespace()).collect();
            let classes = labels
                .iter()
                .map(|l| Classification::from_label(*l))
                .collect::<Result<Vec<_>, _>>()?;
            let mut unique = HashSet::new();
            if !labels.iter().all(|l| unique.insert(*l)) {
                return Err(ConfigurationError::InvalidModel(format!(
                    "derived tensor '{}' repeats an index label",
                    spec.name
                )));
            }
            let formula = parse(&spec.formula).map_err(|e| ConfigurationError::Parse {
                context: format!("derived tensor '{}'", spec.name),
                message: e.to_string(),
            })?;
            let calls = formula.call_names();
            out.push(DerivedDefinition {
                name: spec.name.clone(),
                labels,
                classes,
                formula,
                calls,
            });
        }
        Ok(out)
    }

    pub fn description(&self) -> &ModelDescription {
        &self.description
    }

    pub fn name(&self) -> &str {
        &self.description.name
    }

    pub fn number_fields(&self) -> usize {
        self.description.fields.len()
    }

    pub fn number_params(&self) -> usize {
        self.description.parameters.len()
    }

    pub fn field_names(&self) -> &[String] {
        &self.description.fields
    }

    pub fn momentum_names(&self) -> &[String] {
        &self.momenta
    }

    pub fn parameter_names(&self) -> &[String] {
        &self.description.parameters
    }

    pub fn derived(&self) -> &[DerivedDefinition] {
        &self.derived
    }

    pub fn field(&self, i: usize) -> Expr {
        Expr::symbol(self.description.fields[i].clone())
    }

    pub fn momentum(&self, i: usize) -> Expr {
        Expr::symbol(self.momenta[i].clone())
    }

    /// Symbol for a value of a full index: fields first, then momenta.
    pub fn coordinate(&self, i: usize) -> Expr {
        let n = self.number_fields();
        if i < n {
            self.field(i)
        } else {
            self.momentum(i - n)
        }
    }

    pub fn parameter(&self, i: usize) -> Expr {
        Expr::symbol(self.description.parameters[i].clone())
    }

    /// True for field, parameter and Planck-mass names.
    pub fn declares(&self, name: &str) -> bool {
        self.description.fields.iter().any(|f| f == name)
            || self.description.parameters.iter().any(|p| p == name)
            || self.description.planck_mass == name
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.description.fields.iter().position(|f| f == name)
    }

    /// Swaps the potential for a new formula over the same symbols.
    pub fn replace_potential(&mut self, text: &str) -> Result<(), ConfigurationError> {
        let allowed: HashSet<String> = self
            .description
            .fields
            .iter()
            .chain(&self.description.parameters)
            .chain(std::iter::once(&self.description.planck_mass))
            .cloned()
            .collect();
        self.potential = parse_in(text, "potential", &allowed)?;
        self.description.potential = text.to_string();
        Ok(())
    }

    pub fn planck_mass(&self) -> Expr {
        Expr::symbol(self.description.planck_mass.clone())
    }

    pub fn potential(&self) -> &Expr {
        &self.potential
    }

    pub fn is_canonical(&self) -> bool {
        self.metric.is_none()
    }

    pub fn metric(&self, i: usize, j: usize) -> Expr {
        match &self.metric {
            Some(m) => m.g[i][j].clone(),
            None => Expr::num(if i == j { 1.0 } else { 0.0 }),
        }
    }

    pub fn inverse_metric(&self, i: usize, j: usize) -> Expr {
        match &self.metric {
            Some(m) => m.g_inv[i][j].clone(),
            None => Expr::num(if i == j { 1.0 } else { 0.0 }),
        }
    }

    /// ε = G_ij π^i π^j / (2 M_P²)
    pub fn epsilon(&self) -> Expr {
        let n = self.number_fields();
        let mut terms = Vec::with_capacity(n * n);
        for i in 0..n {
            for j in 0..n {
                terms.push(self.metric(i, j) * self.momentum(i) * self.momentum(j));
            }
        }
        Expr::add(terms) / (Expr::num(2.0) * self.planck_mass().square())
    }

    /// H² = V / ((3 − ε) M_P²)
    pub fn hubble_sq(&self) -> Expr {
        self.potential.clone()
            / ((Expr::num(3.0) - self.epsilon()) * self.planck_mass().square())
    }

    /// Lowers a momentum index: p_a = G_ab π^b.
    pub fn lowered_momentum(&self, a: usize) -> Expr {
        let n = self.number_fields();
        Expr::add((0..n).map(|b| self.metric(a, b) * self.momentum(b)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_log::test;

    pub(crate) fn two_field_description() -> ModelDescription {
        ModelDescription::from_json(
            r#"{
                "name": "double quadratic",
                "author": "test",
                "fields": ["phi", "chi"],
                "parameters": ["m_phi", "m_chi"],
                "potential": "m_phi^2*phi^2/2 + m_chi^2*chi^2/2"
            }"#,
        )
        .expect("description should parse")
    }

    #[test]
    fn builds_symbols_and_background() {
        let model = Model::from_description(two_field_description()).expect("valid model");
        assert_eq!(model.number_fields(), 2);
        assert_eq!(model.momentum_names(), &["__dphi".to_string(), "__dchi".to_string()]);
        assert_eq!(model.coordinate(3), Expr::symbol("__dchi"));
        assert!(model.is_canonical());

        let env: HashMap<String, f64> = [
            ("phi", 1.0),
            ("chi", 2.0),
            ("__dphi", 0.1),
            ("__dchi", 0.2),
            ("m_phi", 1.0),
            ("m_chi", 0.5),
            ("M_P", 1.0),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), *v))
        .collect();
        let eps = model.epsilon().evaluate(&env).expect("evaluates");
        assert!((eps - 0.025).abs() < 1e-12);
        let v = 0.5 + 0.5;
        let hsq = model.hubble_sq().evaluate(&env).expect("evaluates");
        assert!((hsq - v / (3.0 - 0.025)).abs() < 1e-12);
    }

    #[test]
    fn unknown_potential_symbol_is_fatal() {
        let mut desc = two_field_description();
        desc.potential = "lambda*phi^4".to_string();
        let err = Model::from_description(desc).expect_err("lambda is undeclared");
        assert!(matches!(err, ConfigurationError::UnknownSymbol { ref name, .. } if name == "lambda"));
    }

    #[test]
    fn duplicate_and_reserved_names_rejected() {
        let mut desc = two_field_description();
        desc.parameters.push("phi".to_string());
        assert!(Model::from_description(desc).is_err());

        let mut desc = two_field_description();
        desc.fields.push("__hidden".to_string());
        assert!(Model::from_description(desc).is_err());
    }

    #[test]
    fn diagonal_metric_inverts_itself() {
        let mut desc = two_field_description();
        desc.metric = Some(vec![
            vec!["1".to_string(), "0".to_string()],
            vec!["0".to_string(), "exp(2*phi)".to_string()],
        ]);
        let model = Model::from_description(desc).expect("valid model");
        assert!(!model.is_canonical());
        let product = model.metric(1, 1) * model.inverse_metric(1, 1);
        assert!(product.is_number(1.0));
    }

    #[test]
    fn non_diagonal_metric_needs_inverse() {
        let mut desc = two_field_description();
        desc.metric = Some(vec![
            vec!["1".to_string(), "phi".to_string()],
            vec!["phi".to_string(), "1".to_string()],
        ]);
        let err = Model::from_description(desc).expect_err("missing inverse");
        assert!(matches!(err, ConfigurationError::InvalidModel(_)));
    }

    #[test]
    fn derived_names_avoid_generated_symbols() {
        for name in ["__t_0", "__Hsq"] {
            let mut desc = two_field_description();
            desc.derived.push(DerivedTensorSpec {
                name: name.to_string(),
                indices: "a".to_string(),
                formula: "dV(a)".to_string(),
            });
            let err = Model::from_description(desc).expect_err("reserved prefix");
            assert!(matches!(err, ConfigurationError::InvalidModel(ref m) if m.contains("reserved")));
        }
    }

    #[test]
    fn derived_labels_follow_convention() {
        let mut desc = two_field_description();
        desc.derived.push(DerivedTensorSpec {
            name: "w".to_string(),
            indices: "a#".to_string(),
            formula: "dV(a)".to_string(),
        });
        let err = Model::from_description(desc).expect_err("bad label");
        assert_eq!(err, ConfigurationError::UnrecognizedIndexLabel { label: '#' });
    }
}
