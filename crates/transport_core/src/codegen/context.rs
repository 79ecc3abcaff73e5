//! State a rule handler sees while a pass runs.

use crate::cse::{Cse, CseMap};
use crate::error::ConfigurationError;
use crate::index::{AbstractIndex, IndexAssignment, IndexValue};
use crate::model::Model;
use crate::printer::Printer;
use crate::settings::TranslatorSettings;
use crate::storage::offset_of;
use crate::symbolic::Expr;
use crate::tensors::{TensorId, TensorLambda, TensorSet};
use log::debug;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Why a rule handler produced no text.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("{0}")]
    Failed(String),
    #[error("no temporary pool is active")]
    MissingTemporaryPool,
    /// The rule has no rolled form; the engine unrolls the line instead.
    #[error("cannot be emitted inside a runtime loop")]
    NotRollable,
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
}

/// One index-rule invocation.
#[derive(Debug, Clone, Copy)]
pub struct IndexCall<'a> {
    pub token: &'a str,
    pub args: &'a [String],
    /// The directive's own indices, in label order, decorated.
    pub indices: &'a [AbstractIndex],
    pub assignment: &'a IndexAssignment,
}

impl IndexCall<'_> {
    pub fn is_rolled(&self) -> bool {
        self.assignment.is_abstract()
    }

    /// Concrete values of the directive's indices; `None` when rolled.
    pub fn values(&self) -> Option<Vec<usize>> {
        self.indices
            .iter()
            .map(|index| match self.assignment.get(index.label) {
                Some((_, IndexValue::Concrete(v))) => Some(v),
                _ => None,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct TemporaryPool {
    format: String,
}

type MapKey = (TensorId, Vec<(String, String)>);

/// Everything a pass owns: the tensor set and its caches, the CSE engine and
/// the maps it produced, and the active temporary pool.
pub struct RuleContext<'a> {
    tensors: &'a mut TensorSet,
    settings: &'a TranslatorSettings,
    printer: Arc<dyn Printer>,
    cse: Cse,
    pool: Option<TemporaryPool>,
    pool_opened: bool,
    maps: HashMap<MapKey, CseMap>,
    pending: Vec<String>,
    temporaries_emitted: usize,
}

impl<'a> RuleContext<'a> {
    pub fn new(
        tensors: &'a mut TensorSet,
        settings: &'a TranslatorSettings,
        printer: Arc<dyn Printer>,
    ) -> Self {
        Self {
            tensors,
            settings,
            printer,
            cse: Cse::from_settings(settings),
            pool: None,
            pool_opened: false,
            maps: HashMap::new(),
            pending: Vec::new(),
            temporaries_emitted: 0,
        }
    }

    pub fn model(&self) -> &Model {
        self.tensors.model()
    }

    pub fn tensors(&mut self) -> &mut TensorSet {
        self.tensors
    }

    pub fn settings(&self) -> &TranslatorSettings {
        self.settings
    }

    pub fn printer(&self) -> &dyn Printer {
        self.printer.as_ref()
    }

    pub fn render(&self, expr: &Expr) -> String {
        self.printer.render(expr)
    }

    /// Opens a pool for the temporaries of the lines that follow. `format`
    /// uses `$1` for the temporary's name and `$2` for its definition.
    /// Closing the previous pool drops every cached tensor map.
    pub fn open_pool(&mut self, format: &str) {
        self.pool = Some(TemporaryPool {
            format: format.to_string(),
        });
        self.pool_opened = true;
        self.maps.clear();
    }

    pub fn has_pool(&self) -> bool {
        self.pool.is_some()
    }

    pub(crate) fn take_opened_pool(&mut self) -> bool {
        std::mem::take(&mut self.pool_opened)
    }

    pub(crate) fn take_pending(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }

    pub fn temporaries_emitted(&self) -> usize {
        self.temporaries_emitted
    }

    /// Text of one tensor directive. `renames` maps placeholder symbols to
    /// the runtime names given in the directive.
    pub fn tensor_text(
        &mut self,
        id: TensorId,
        call: &IndexCall<'_>,
        renames: &[(String, String)],
    ) -> Result<String, RuleError> {
        let signature = self.tensors.signature(id);
        let classes: Vec<_> = call.indices.iter().map(|i| i.classification).collect();
        if signature != classes {
            return Err(RuleError::Failed(format!(
                "tensor '{}' takes indices ({}), got ({})",
                self.tensors.name(id),
                signature.iter().map(|c| c.tag()).collect::<Vec<_>>().join(", "),
                classes.iter().map(|c| c.tag()).collect::<Vec<_>>().join(", ")
            )));
        }
        let bindings: HashMap<String, Expr> = renames
            .iter()
            .filter(|(from, to)| from != to)
            .map(|(from, to)| (from.clone(), Expr::symbol(to.clone())))
            .collect();

        match call.values() {
            None => {
                let lambda = self.tensors.lambda(id)?.relabel(call.indices)?;
                self.rolled_text(&lambda, &bindings)
            }
            Some(values) => {
                let key: MapKey = (id, renames.to_vec());
                if !self.maps.contains_key(&key) {
                    let map = self.build_map(id, &bindings)?;
                    self.maps.insert(key.clone(), map);
                }
                let ranges: Vec<usize> = self.tensors.indices(id).iter().map(|i| i.numeric_range()).collect();
                let offset = offset_of(&ranges, &values)?;
                self.maps
                    .get(&key)
                    .and_then(|map| map.get(offset))
                    .map(str::to_string)
                    .ok_or_else(|| RuleError::Failed(format!("no component at offset {}", offset)))
            }
        }
    }

    fn build_map(&mut self, id: TensorId, bindings: &HashMap<String, Expr>) -> Result<CseMap, RuleError> {
        let components = self.tensors.compute(id)?;
        let targets: Vec<Expr> = components.values().iter().map(|e| e.subs(bindings)).collect();
        let map = self.cse.run(targets, Arc::clone(&self.printer));

        if !map.temporaries().is_empty() {
            let pool = self.pool.as_ref().ok_or(RuleError::MissingTemporaryPool)?;
            let format = pool.format.clone();
            for i in 0..map.temporaries().len() {
                if let Some((name, definition)) = map.temporary(i) {
                    self.pending.push(format.replace("$1", name).replace("$2", definition));
                }
            }
            self.temporaries_emitted += map.temporaries().len();
        }
        debug!(
            "{}: {} components, {} temporaries",
            self.tensors.name(id),
            map.len(),
            map.temporaries().len()
        );
        Ok(map)
    }

    /// Rolled form: a conditional over the lambda's field/momentum blocks.
    fn rolled_text(&self, lambda: &TensorLambda, bindings: &HashMap<String, Expr>) -> Result<String, RuleError> {
        if !lambda.is_rolled() {
            return Err(RuleError::NotRollable);
        }
        let branches = lambda.branches();
        let Some(((_, last), rest)) = branches.split_last() else {
            return Err(RuleError::Failed(format!("tensor '{}' has no blocks", lambda.name())));
        };
        let mut text = self.render(&last.subs(bindings));
        for (tests, expr) in rest.iter().rev() {
            let conditions: Vec<String> = tests
                .iter()
                .map(|(variable, fields, field_half)| {
                    if *field_half {
                        self.printer.less_than(variable, *fields)
                    } else {
                        self.printer.at_least(variable, *fields)
                    }
                })
                .collect();
            let then = self.render(&expr.subs(bindings));
            text = self.printer.ternary(&self.printer.conjunction(&conditions), &then, &text);
        }
        Ok(text)
    }
}
