//! The two ways a formula can see its lower-level objects.

use super::{TensorId, TensorSet};
use crate::error::ConfigurationError;
use crate::model::Model;
use crate::symbolic::{Expr, IndexSlot};
use std::collections::HashMap;

/// Lower-level objects a tensor formula is written against.
pub(crate) trait Resources {
    fn model(&self) -> &Model;

    fn field(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError>;

    fn momentum(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError>;

    fn parameter(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError>;

    /// Metric component of a non-canonical model.
    fn metric_component(&mut self, a: &IndexSlot, b: &IndexSlot) -> Result<Expr, ConfigurationError>;

    fn inverse_metric_component(
        &mut self,
        a: &IndexSlot,
        b: &IndexSlot,
    ) -> Result<Expr, ConfigurationError>;

    fn potential(&mut self) -> Result<Expr, ConfigurationError>;

    /// A declared model symbol (field, parameter or Planck mass).
    fn symbol(&mut self, name: &str) -> Result<Expr, ConfigurationError>;

    fn tensor(&mut self, id: TensorId, slots: &[IndexSlot]) -> Result<Expr, ConfigurationError>;
}

fn fixed(slot: &IndexSlot) -> Result<usize, ConfigurationError> {
    match slot {
        IndexSlot::Fixed(v) => Ok(*v),
        IndexSlot::Bound { label, .. } => Err(ConfigurationError::InvalidModel(format!(
            "index '{}' is unresolved in a concrete component",
            label
        ))),
    }
}

fn check_range(value: usize, range: usize, position: usize) -> Result<usize, ConfigurationError> {
    if value < range {
        Ok(value)
    } else {
        Err(ConfigurationError::IndexOutOfRange {
            position,
            value,
            range,
        })
    }
}

/// Fully expanded components; lower-level tensors come from the set's caches.
pub(crate) struct ConcreteResources<'a> {
    pub set: &'a mut TensorSet,
}

impl Resources for ConcreteResources<'_> {
    fn model(&self) -> &Model {
        self.set.model()
    }

    fn field(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let a = check_range(fixed(a)?, self.model().number_fields(), 0)?;
        Ok(self.model().field(a))
    }

    fn momentum(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let a = check_range(fixed(a)?, self.model().number_fields(), 0)?;
        Ok(self.model().momentum(a))
    }

    fn parameter(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let a = check_range(fixed(a)?, self.model().number_params(), 0)?;
        Ok(self.model().parameter(a))
    }

    fn metric_component(&mut self, a: &IndexSlot, b: &IndexSlot) -> Result<Expr, ConfigurationError> {
        Ok(self.model().metric(fixed(a)?, fixed(b)?))
    }

    fn inverse_metric_component(
        &mut self,
        a: &IndexSlot,
        b: &IndexSlot,
    ) -> Result<Expr, ConfigurationError> {
        Ok(self.model().inverse_metric(fixed(a)?, fixed(b)?))
    }

    fn potential(&mut self) -> Result<Expr, ConfigurationError> {
        Ok(self.model().potential().clone())
    }

    fn symbol(&mut self, name: &str) -> Result<Expr, ConfigurationError> {
        Ok(Expr::symbol(name))
    }

    fn tensor(&mut self, id: TensorId, slots: &[IndexSlot]) -> Result<Expr, ConfigurationError> {
        let tuple = slots.iter().map(fixed).collect::<Result<Vec<_>, _>>()?;
        self.set.component(id, &tuple)
    }
}

/// Lambda templates: lower-level objects are runtime array references.
pub(crate) struct LambdaResources<'a> {
    pub set: &'a TensorSet,
}

impl LambdaResources<'_> {
    fn state(&self, slot: IndexSlot) -> Expr {
        let n = self.set.model().number_fields();
        Expr::indexed(self.set.naming().state_array.clone(), vec![slot], vec![2 * n])
    }

    fn array(&self, stem: &str, slots: Vec<IndexSlot>, ranges: Vec<usize>) -> Expr {
        Expr::indexed(format!("{}{}", self.set.naming().array_prefix, stem), slots, ranges)
    }
}

impl Resources for LambdaResources<'_> {
    fn model(&self) -> &Model {
        self.set.model()
    }

    fn field(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        Ok(self.state(a.clone()))
    }

    fn momentum(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let n = self.model().number_fields() as isize;
        Ok(self.state(a.shifted(n)))
    }

    fn parameter(&mut self, a: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let p = self.model().number_params();
        Ok(self.array("params", vec![a.clone()], vec![p]))
    }

    fn metric_component(&mut self, a: &IndexSlot, b: &IndexSlot) -> Result<Expr, ConfigurationError> {
        let n = self.model().number_fields();
        Ok(self.array("metric", vec![a.clone(), b.clone()], vec![n, n]))
    }

    fn inverse_metric_component(
        &mut self,
        a: &IndexSlot,
        b: &IndexSlot,
    ) -> Result<Expr, ConfigurationError> {
        let n = self.model().number_fields();
        Ok(self.array("metric_inv", vec![a.clone(), b.clone()], vec![n, n]))
    }

    fn potential(&mut self) -> Result<Expr, ConfigurationError> {
        let bindings: HashMap<String, Expr> = self
            .model()
            .field_names()
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), self.state(IndexSlot::Fixed(i))))
            .collect();
        Ok(self.model().potential().subs(&bindings))
    }

    fn symbol(&mut self, name: &str) -> Result<Expr, ConfigurationError> {
        Ok(match self.model().field_position(name) {
            Some(i) => self.state(IndexSlot::Fixed(i)),
            None => Expr::symbol(name),
        })
    }

    fn tensor(&mut self, id: TensorId, slots: &[IndexSlot]) -> Result<Expr, ConfigurationError> {
        let ranges: Vec<usize> = self.set.indices(id).iter().map(|i| i.numeric_range()).collect();
        if ranges.len() != slots.len() {
            return Err(ConfigurationError::RankMismatch {
                tensor: self.set.name(id),
                expected: ranges.len(),
                found: slots.len(),
            });
        }
        Ok(Expr::indexed(self.set.array_name(id), slots.to_vec(), ranges))
    }
}
