//! Abstract index algebra.
//!
//! An abstract index is a single-letter placeholder for a tensor slot. Its
//! classification fixes the numeric range it runs over once a model supplies
//! field and parameter counts:
//!
//! | classification | range        | label convention |
//! |----------------|--------------|------------------|
//! | field-only     | `fields`     | `a`–`z`          |
//! | full           | `2 * fields` | `A`–`Z`          |
//! | parameter      | `params`     | `α`–`ω`          |
//!
//! Full indices run over fields first, then momenta, so value `v` of a full
//! index is a field when `v < fields` and the momentum of species
//! `v - fields` otherwise.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PREFIX: &str = "__";
pub const DEFAULT_SUFFIX: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    #[serde(rename = "field")]
    FieldOnly,
    Full,
    Parameter,
}

impl Classification {
    /// Infers the classification from the label convention.
    pub fn from_label(label: char) -> Result<Self, ConfigurationError> {
        match label {
            'a'..='z' => Ok(Classification::FieldOnly),
            'A'..='Z' => Ok(Classification::Full),
            'α'..='ω' => Ok(Classification::Parameter),
            _ => Err(ConfigurationError::UnrecognizedIndexLabel { label }),
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Classification::FieldOnly => "field",
            Classification::Full => "full",
            Classification::Parameter => "parameter",
        }
    }
}

impl FromStr for Classification {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "field" => Ok(Classification::FieldOnly),
            "full" => Ok(Classification::Full),
            "parameter" => Ok(Classification::Parameter),
            other => Err(ConfigurationError::UnrecognizedClassification {
                tag: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Which half of a full index a concrete value falls in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Half {
    Field,
    Momentum,
    /// Field-only and parameter indices have no halves.
    Whole,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AbstractIndex {
    pub label: char,
    pub classification: Classification,
    pub fields: usize,
    pub params: usize,
    pub prefix: String,
    pub suffix: String,
}

impl AbstractIndex {
    pub fn new(label: char, classification: Classification, fields: usize, params: usize) -> Self {
        Self {
            label,
            classification,
            fields,
            params,
            prefix: DEFAULT_PREFIX.to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
        }
    }

    /// Builds an index whose classification follows from its label.
    pub fn from_label(label: char, fields: usize, params: usize) -> Result<Self, ConfigurationError> {
        Ok(Self::new(label, Classification::from_label(label)?, fields, params))
    }

    pub fn with_decoration(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self.suffix = suffix.into();
        self
    }

    /// Number of concrete values this index runs over.
    ///
    /// The match is exhaustive: a new classification fails to build until it
    /// is given a range here.
    pub fn numeric_range(&self) -> usize {
        match self.classification {
            Classification::FieldOnly => self.fields,
            Classification::Full => 2 * self.fields,
            Classification::Parameter => self.params,
        }
    }

    /// Loop-variable name used when this index is emitted rolled.
    pub fn decorated(&self) -> String {
        format!("{}{}{}", self.prefix, self.label, self.suffix)
    }

    pub fn half_of(&self, value: usize) -> Half {
        match self.classification {
            Classification::Full if value < self.fields => Half::Field,
            Classification::Full => Half::Momentum,
            Classification::FieldOnly | Classification::Parameter => Half::Whole,
        }
    }

    /// Species (field number) addressed by a concrete value.
    pub fn species(&self, value: usize) -> usize {
        match self.half_of(value) {
            Half::Momentum => value - self.fields,
            Half::Field | Half::Whole => value,
        }
    }

    /// Halves this index can take, in canonical order.
    pub fn halves(&self) -> &'static [Half] {
        match self.classification {
            Classification::Full => &[Half::Field, Half::Momentum],
            Classification::FieldOnly | Classification::Parameter => &[Half::Whole],
        }
    }
}

impl fmt::Display for AbstractIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

/// Value bound to an index inside one expansion of an index loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexValue {
    Concrete(usize),
    /// Rolled emission: the index stays a runtime loop variable.
    Abstract,
}

/// One binding of every index in a loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexAssignment {
    entries: Vec<(AbstractIndex, IndexValue)>,
}

impl IndexAssignment {
    pub fn abstract_over(indices: &[AbstractIndex]) -> Self {
        Self {
            entries: indices
                .iter()
                .map(|idx| (idx.clone(), IndexValue::Abstract))
                .collect(),
        }
    }

    pub fn concrete(indices: &[AbstractIndex], values: &[usize]) -> Self {
        Self {
            entries: indices
                .iter()
                .zip(values)
                .map(|(idx, v)| (idx.clone(), IndexValue::Concrete(*v)))
                .collect(),
        }
    }

    pub fn is_abstract(&self) -> bool {
        self.entries
            .iter()
            .any(|(_, v)| matches!(v, IndexValue::Abstract))
    }

    pub fn get(&self, label: char) -> Option<(&AbstractIndex, IndexValue)> {
        self.entries
            .iter()
            .find(|(idx, _)| idx.label == label)
            .map(|(idx, v)| (idx, *v))
    }

    pub fn entries(&self) -> &[(AbstractIndex, IndexValue)] {
        &self.entries
    }

    /// Enumerates every concrete tuple in canonical order (first index most
    /// significant). An index with zero range yields no tuples at all.
    pub fn enumerate(indices: &[AbstractIndex]) -> Vec<IndexAssignment> {
        tuples(&indices.iter().map(|i| i.numeric_range()).collect::<Vec<_>>())
            .into_iter()
            .map(|values| IndexAssignment::concrete(indices, &values))
            .collect()
    }
}

/// All tuples over the given ranges, last position varying fastest.
pub fn tuples(ranges: &[usize]) -> Vec<Vec<usize>> {
    let total: usize = ranges.iter().product();
    let mut out = Vec::with_capacity(total);
    if total == 0 {
        return out;
    }
    let mut current = vec![0usize; ranges.len()];
    for _ in 0..total {
        out.push(current.clone());
        for pos in (0..ranges.len()).rev() {
            current[pos] += 1;
            if current[pos] < ranges[pos] {
                break;
            }
            current[pos] = 0;
        }
    }
    out
}

/// Parses a label string such as `"AB"` into indices, rejecting repeats.
pub fn parse_labels(
    labels: &str,
    fields: usize,
    params: usize,
) -> Result<Vec<AbstractIndex>, ConfigurationError> {
    let mut out: Vec<AbstractIndex> = Vec::new();
    for label in labels.chars().filter(|c| !c.is_whitespace()) {
        let idx = AbstractIndex::from_label(label, fields, params)?;
        if !out.iter().any(|existing| existing.label == label) {
            out.push(idx);
        }
    }
    Ok(out)
}
