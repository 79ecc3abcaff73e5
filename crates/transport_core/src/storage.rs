//! Flattened tensor storage.
//!
//! Components live in one linear buffer. The offset of a resolved tuple is
//! `Σ value_i * stride_i`, where `stride_i` is the product of the ranges of
//! every less-significant index. Generated code addresses runtime arrays with
//! the same arithmetic (see [`offset_text`]), so storage and emission agree on
//! layout by construction.

use crate::error::ConfigurationError;
use crate::index::AbstractIndex;

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedTensor<T> {
    indices: Vec<AbstractIndex>,
    ranges: Vec<usize>,
    strides: Vec<usize>,
    values: Vec<T>,
}

/// Row-major strides for the given ranges.
pub fn strides(ranges: &[usize]) -> Vec<usize> {
    let mut out = vec![1usize; ranges.len()];
    for pos in (0..ranges.len().saturating_sub(1)).rev() {
        out[pos] = out[pos + 1] * ranges[pos + 1];
    }
    out
}

/// Linear offset of `tuple` within a tensor of the given ranges.
pub fn offset_of(ranges: &[usize], tuple: &[usize]) -> Result<usize, ConfigurationError> {
    if ranges.len() != tuple.len() {
        return Err(ConfigurationError::RankMismatch {
            tensor: "flattened tensor".to_string(),
            expected: ranges.len(),
            found: tuple.len(),
        });
    }
    let strides = strides(ranges);
    let mut offset = 0;
    for (position, ((value, range), stride)) in tuple.iter().zip(ranges).zip(&strides).enumerate() {
        if value >= range {
            return Err(ConfigurationError::IndexOutOfRange {
                position,
                value: *value,
                range: *range,
            });
        }
        offset += value * stride;
    }
    Ok(offset)
}

/// One position of an offset computation in generated code: either a
/// resolved value or a runtime expression (already decorated).
#[derive(Debug, Clone, PartialEq)]
pub enum OffsetTerm {
    Value(usize),
    Runtime(String),
}

/// Renders the offset arithmetic for generated code. Resolved positions are
/// folded into a single constant; runtime positions keep their stride.
pub fn offset_text(ranges: &[usize], terms: &[OffsetTerm]) -> String {
    let strides = strides(ranges);
    let mut constant = 0usize;
    let mut parts: Vec<String> = Vec::new();
    for (term, stride) in terms.iter().zip(&strides) {
        match term {
            OffsetTerm::Value(v) => constant += v * stride,
            OffsetTerm::Runtime(text) if *stride == 1 => parts.push(text.clone()),
            OffsetTerm::Runtime(text) => parts.push(format!("{}*{}", stride, text)),
        }
    }
    if parts.is_empty() {
        return constant.to_string();
    }
    if constant > 0 {
        parts.push(constant.to_string());
    }
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        format!("({})", parts.join("+"))
    }
}

impl<T> FlattenedTensor<T> {
    /// Builds the tensor by calling `value_fn` once per tuple in canonical
    /// order. The first error aborts the build.
    pub fn build<E, F>(indices: &[AbstractIndex], mut value_fn: F) -> Result<Self, E>
    where
        F: FnMut(&[usize]) -> Result<T, E>,
    {
        let ranges: Vec<usize> = indices.iter().map(|i| i.numeric_range()).collect();
        let tuples = crate::index::tuples(&ranges);
        let mut values = Vec::with_capacity(tuples.len());
        for tuple in &tuples {
            values.push(value_fn(tuple)?);
        }
        Ok(Self {
            indices: indices.to_vec(),
            strides: strides(&ranges),
            ranges,
            values,
        })
    }

    pub fn indices(&self) -> &[AbstractIndex] {
        &self.indices
    }

    pub fn ranges(&self) -> &[usize] {
        &self.ranges
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.indices.len()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn offset(&self, tuple: &[usize]) -> Result<usize, ConfigurationError> {
        offset_of(&self.ranges, tuple)
    }

    pub fn at(&self, tuple: &[usize]) -> Result<&T, ConfigurationError> {
        let offset = self.offset(tuple)?;
        // build() filled every offset below the product of ranges.
        Ok(&self.values[offset])
    }

    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn into_values(self) -> Vec<T> {
        self.values
    }

    pub fn map<U, F: FnMut(&T) -> U>(&self, f: F) -> FlattenedTensor<U> {
        FlattenedTensor {
            indices: self.indices.clone(),
            ranges: self.ranges.clone(),
            strides: self.strides.clone(),
            values: self.values.iter().map(f).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{parse_labels, AbstractIndex, Classification};
    use std::convert::Infallible;
    use test_log::test;

    fn build_labels(labels: &str, fields: usize, params: usize) -> FlattenedTensor<Vec<usize>> {
        let indices = parse_labels(labels, fields, params).expect("labels");
        FlattenedTensor::build(&indices, |t| Ok::<_, Infallible>(t.to_vec())).expect("infallible")
    }

    #[test]
    fn build_size_is_product_of_ranges() {
        assert_eq!(build_labels("", 3, 0).len(), 1);
        assert_eq!(build_labels("a", 3, 0).len(), 3);
        assert_eq!(build_labels("aB", 3, 0).len(), 18);
        assert_eq!(build_labels("ABα", 2, 5).len(), 80);
    }

    #[test]
    fn at_round_trips_every_tuple() {
        for labels in ["", "A", "ab", "Abc", "αB"] {
            let tensor = build_labels(labels, 2, 3);
            for tuple in crate::index::tuples(tensor.ranges()) {
                assert_eq!(tensor.at(&tuple).expect("in range"), &tuple);
            }
        }
    }

    #[test]
    fn full_rank_two_offsets() {
        let a = AbstractIndex::new('A', Classification::Full, 2, 0);
        let b = AbstractIndex::new('B', Classification::Full, 2, 0);
        assert_eq!(a.numeric_range(), 4);
        let tensor = FlattenedTensor::build(&[a, b], |t| Ok::<_, Infallible>(t[0] * 10 + t[1]))
            .expect("infallible");
        assert_eq!(tensor.len(), 16);
        for i in 0..4 {
            for j in 0..4 {
                assert_eq!(tensor.offset(&[i, j]).expect("offset"), i * 4 + j);
            }
        }
    }

    #[test]
    fn zero_range_gives_empty_tensor() {
        let tensor = build_labels("aα", 2, 0);
        assert!(tensor.is_empty());
        assert!(tensor.at(&[0, 0]).is_err());
    }

    #[test]
    fn out_of_range_and_rank_mismatch_fail() {
        let tensor = build_labels("ab", 2, 0);
        assert!(matches!(
            tensor.at(&[0, 2]),
            Err(ConfigurationError::IndexOutOfRange { position: 1, .. })
        ));
        assert!(matches!(
            tensor.at(&[0]),
            Err(ConfigurationError::RankMismatch { .. })
        ));
    }

    #[test]
    fn offset_text_matches_stride_arithmetic() {
        let ranges = [4, 4];
        assert_eq!(
            offset_text(&ranges, &[OffsetTerm::Value(2), OffsetTerm::Value(3)]),
            "11"
        );
        assert_eq!(
            offset_text(
                &ranges,
                &[OffsetTerm::Runtime("__A".into()), OffsetTerm::Runtime("__B".into())]
            ),
            "(4*__A+__B)"
        );
        assert_eq!(
            offset_text(&ranges, &[OffsetTerm::Value(1), OffsetTerm::Runtime("__B".into())]),
            "(__B+4)"
        );
        assert_eq!(offset_text(&[], &[]), "0");
    }
}
