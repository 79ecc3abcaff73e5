use serde::{Deserialize, Serialize};

/// When index loops are expanded into one line per tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum UnrollPolicy {
    Always,
    Never,
    /// Unroll when the loop has at most this many tuples.
    Auto { max_components: usize },
}

impl UnrollPolicy {
    pub fn unrolls(&self, tuple_count: usize) -> bool {
        match self {
            UnrollPolicy::Always => true,
            UnrollPolicy::Never => false,
            UnrollPolicy::Auto { max_components } => tuple_count <= *max_components,
        }
    }
}

/// Settings for one translation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslatorSettings {
    pub cse: bool,
    /// Node count above which a single-occurrence subexpression is still
    /// pulled out into a temporary.
    pub complexity_threshold: usize,
    pub temporary_prefix: String,
    pub unroll: UnrollPolicy,
    pub index_prefix: String,
    pub index_suffix: String,
    /// Runtime array holding fields then momenta.
    pub state_array: String,
    /// Prefix of runtime arrays holding precomputed tensors.
    pub array_prefix: String,
}

impl Default for TranslatorSettings {
    fn default() -> Self {
        Self {
            cse: true,
            complexity_threshold: 12,
            temporary_prefix: "__t_".to_string(),
            unroll: UnrollPolicy::Auto {
                max_components: 1000,
            },
            index_prefix: crate::index::DEFAULT_PREFIX.to_string(),
            index_suffix: crate::index::DEFAULT_SUFFIX.to_string(),
            state_array: "__x".to_string(),
            array_prefix: "__".to_string(),
        }
    }
}

impl TranslatorSettings {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
