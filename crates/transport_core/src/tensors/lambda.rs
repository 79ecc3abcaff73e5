use crate::error::ConfigurationError;
use crate::index::{AbstractIndex, Half};
use crate::storage::FlattenedTensor;
use crate::symbolic::{Expr, IndexSlot};
use std::collections::HashMap;

/// One template of a lambda, valid when every index falls in the listed half.
/// `Half::Whole` matches any value.
#[derive(Debug, Clone, PartialEq)]
pub struct LambdaBlock {
    pub pattern: Vec<Half>,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LambdaBody {
    /// Templates over bound index slots, one per half pattern.
    Blocks(Vec<LambdaBlock>),
    /// Tensors without an index-generic formula list their components.
    Table(FlattenedTensor<Expr>),
}

/// Reusable evaluator of a tensor over unresolved indices.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorLambda {
    name: String,
    indices: Vec<AbstractIndex>,
    body: LambdaBody,
}

impl TensorLambda {
    pub fn new(name: impl Into<String>, indices: Vec<AbstractIndex>, body: LambdaBody) -> Self {
        Self {
            name: name.into(),
            indices,
            body,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> &[AbstractIndex] {
        &self.indices
    }

    pub fn body(&self) -> &LambdaBody {
        &self.body
    }

    /// True when the lambda can be emitted inside a runtime loop.
    pub fn is_rolled(&self) -> bool {
        matches!(self.body, LambdaBody::Blocks(_))
    }

    pub fn blocks(&self) -> &[LambdaBlock] {
        match &self.body {
            LambdaBody::Blocks(blocks) => blocks,
            LambdaBody::Table(_) => &[],
        }
    }

    fn matches(&self, pattern: &[Half], values: &[usize]) -> bool {
        pattern
            .iter()
            .zip(&self.indices)
            .zip(values)
            .all(|((half, index), value)| *half == Half::Whole || index.half_of(*value) == *half)
    }

    /// Applies the lambda to one resolved tuple.
    pub fn instantiate(&self, values: &[usize]) -> Result<Expr, ConfigurationError> {
        if values.len() != self.indices.len() {
            return Err(ConfigurationError::RankMismatch {
                tensor: self.name.clone(),
                expected: self.indices.len(),
                found: values.len(),
            });
        }
        let ranges: Vec<usize> = self.indices.iter().map(|i| i.numeric_range()).collect();
        crate::storage::offset_of(&ranges, values)?;

        match &self.body {
            LambdaBody::Table(table) => table.at(values).cloned(),
            LambdaBody::Blocks(blocks) => {
                let block = blocks
                    .iter()
                    .find(|b| self.matches(&b.pattern, values))
                    .ok_or_else(|| ConfigurationError::UnknownTensor {
                        name: format!("{} block for {:?}", self.name, values),
                    })?;
                let bindings: HashMap<char, usize> = self
                    .indices
                    .iter()
                    .map(|i| i.label)
                    .zip(values.iter().copied())
                    .collect();
                block.expr.instantiate(&bindings)
            }
        }
    }

    /// Renames the lambda's indices to `targets`, position by position. Slot
    /// offsets are kept, so the species arithmetic is unchanged.
    pub fn relabel(&self, targets: &[AbstractIndex]) -> Result<TensorLambda, ConfigurationError> {
        if targets.len() != self.indices.len() {
            return Err(ConfigurationError::RankMismatch {
                tensor: self.name.clone(),
                expected: self.indices.len(),
                found: targets.len(),
            });
        }
        let renames: HashMap<char, (char, String)> = self
            .indices
            .iter()
            .zip(targets)
            .map(|(from, to)| (from.label, (to.label, to.decorated())))
            .collect();
        let rename = |slot: &IndexSlot| match slot {
            IndexSlot::Bound { label, offset, .. } => match renames.get(label) {
                Some((new_label, name)) => IndexSlot::Bound {
                    label: *new_label,
                    name: name.clone(),
                    offset: *offset,
                },
                None => slot.clone(),
            },
            IndexSlot::Fixed(_) => slot.clone(),
        };
        let body = match &self.body {
            LambdaBody::Table(table) => LambdaBody::Table(table.clone()),
            LambdaBody::Blocks(blocks) => LambdaBody::Blocks(
                blocks
                    .iter()
                    .map(|b| LambdaBlock {
                        pattern: b.pattern.clone(),
                        expr: b.expr.map_slots(&rename),
                    })
                    .collect(),
            ),
        };
        Ok(TensorLambda {
            name: self.name.clone(),
            indices: targets.to_vec(),
            body,
        })
    }

    /// Branch conditions for rolled emission: each block paired with the
    /// `(loop variable, fields)` tests that select it. A `true` test means
    /// `variable < fields`.
    pub fn branches(&self) -> Vec<(Vec<(String, usize, bool)>, &Expr)> {
        self.blocks()
            .iter()
            .map(|block| {
                let tests = block
                    .pattern
                    .iter()
                    .zip(&self.indices)
                    .filter_map(|(half, index)| match half {
                        Half::Field => Some((index.decorated(), index.fields, true)),
                        Half::Momentum => Some((index.decorated(), index.fields, false)),
                        Half::Whole => None,
                    })
                    .collect();
                (tests, &block.expr)
            })
            .collect()
    }
}

/// Every half pattern over the given indices, in canonical order.
pub(crate) fn half_patterns(indices: &[AbstractIndex]) -> Vec<Vec<Half>> {
    let mut patterns: Vec<Vec<Half>> = vec![Vec::new()];
    for index in indices {
        let mut next = Vec::with_capacity(patterns.len() * 2);
        for pattern in &patterns {
            for half in index.halves() {
                let mut extended = pattern.clone();
                extended.push(*half);
                next.push(extended);
            }
        }
        patterns = next;
    }
    patterns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Classification;
    use test_log::test;

    fn full(label: char) -> AbstractIndex {
        AbstractIndex::new(label, Classification::Full, 2, 0)
    }

    fn sample() -> TensorLambda {
        let a = IndexSlot::bound('A', "__A");
        let field_block = Expr::indexed("__x", vec![a.shifted(2)], vec![4]);
        let momentum_block = -Expr::indexed("__dV", vec![a.shifted(-2)], vec![2]);
        TensorLambda::new(
            "u1",
            vec![full('A')],
            LambdaBody::Blocks(vec![
                LambdaBlock {
                    pattern: vec![Half::Field],
                    expr: field_block,
                },
                LambdaBlock {
                    pattern: vec![Half::Momentum],
                    expr: momentum_block,
                },
            ]),
        )
    }

    #[test]
    fn instantiate_selects_block_by_half() {
        let lambda = sample();
        assert_eq!(
            lambda.instantiate(&[1]).expect("field half"),
            Expr::indexed("__x", vec![IndexSlot::Fixed(3)], vec![4])
        );
        assert_eq!(
            lambda.instantiate(&[3]).expect("momentum half"),
            -Expr::indexed("__dV", vec![IndexSlot::Fixed(1)], vec![2])
        );
        assert!(lambda.instantiate(&[4]).is_err());
        assert!(lambda.instantiate(&[0, 0]).is_err());
    }

    #[test]
    fn relabel_keeps_offsets() {
        let lambda = sample().relabel(&[full('C')]).expect("same rank");
        let (tests, expr) = &lambda.branches()[1];
        assert_eq!(tests, &vec![("__C".to_string(), 2, false)]);
        assert_eq!(expr.to_string(), "-1*__dV[(__C-2)]");
        assert_eq!(
            lambda.instantiate(&[2]).expect("momentum half"),
            -Expr::indexed("__dV", vec![IndexSlot::Fixed(0)], vec![2])
        );
    }

    #[test]
    fn patterns_cover_every_half_combination() {
        let f = AbstractIndex::new('a', Classification::FieldOnly, 2, 0);
        assert_eq!(half_patterns(&[full('A'), full('B')]).len(), 4);
        assert_eq!(half_patterns(&[f.clone()]), vec![vec![Half::Whole]]);
        assert_eq!(half_patterns(&[]), vec![Vec::<Half>::new()]);
    }
}
