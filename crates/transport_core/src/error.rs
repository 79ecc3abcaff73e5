//! Error types shared by every layer of the translator.
//!
//! Configuration errors are always fatal. Translation errors are fatal for the
//! backend pass that produced them only; the driver keeps sibling passes alive.

use std::fmt;
use thiserror::Error;

/// Position of a directive inside a template (1-based).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub line: usize,
    pub column: usize,
}

impl Location {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// Fatal misconfiguration of the model, the index set or the rule registry.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Unrecognized index classification '{tag}'")]
    UnrecognizedClassification { tag: String },
    #[error("Index label '{label}' does not match any classification")]
    UnrecognizedIndexLabel { label: char },
    #[error(
        "Token '{token}' registered twice for backend '{backend}' (packages '{first}' and '{second}')"
    )]
    DuplicateToken {
        token: String,
        backend: String,
        first: String,
        second: String,
    },
    #[error("Tensor '{tensor}' depends on itself: {}", .cycle.join(" -> "))]
    CyclicDependency { tensor: String, cycle: Vec<String> },
    #[error("Unknown tensor '{name}'")]
    UnknownTensor { name: String },
    #[error("Unknown symbol '{name}' in {context}")]
    UnknownSymbol { name: String, context: String },
    #[error("Failed to parse {context}: {message}")]
    Parse { context: String, message: String },
    #[error("Tensor '{tensor}' expects {expected} indices, got {found}")]
    RankMismatch {
        tensor: String,
        expected: usize,
        found: usize,
    },
    #[error("Index value {value} out of range {range} at position {position}")]
    IndexOutOfRange {
        position: usize,
        value: usize,
        range: usize,
    },
    #[error("Invalid model: {0}")]
    InvalidModel(String),
    #[error("Unknown backend '{backend}'")]
    UnknownBackend { backend: String },
}

/// A directive-level failure inside one backend pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TranslationError {
    #[error("{location}: unresolved directive '${token}'")]
    UnresolvedDirective { token: String, location: Location },
    #[error("{location}: directive '${token}' expects {expected} argument(s), got {found}")]
    ArityMismatch {
        token: String,
        expected: usize,
        found: usize,
        location: Location,
    },
    #[error("{location}: directive '${token}' expects {expected} index label(s), got {found}")]
    LabelMismatch {
        token: String,
        expected: String,
        found: usize,
        location: Location,
    },
    #[error("{location}: malformed directive '${token}': {reason}")]
    Malformed {
        token: String,
        reason: String,
        location: Location,
    },
    #[error("{location}: directive '${token}' needs temporaries but no $TEMP_POOL is active")]
    MissingTemporaryPool { token: String, location: Location },
    #[error("{location}: directive '${token}' failed: {message}")]
    RuleFailed {
        token: String,
        message: String,
        location: Location,
    },
}

impl TranslationError {
    pub fn token(&self) -> &str {
        match self {
            TranslationError::UnresolvedDirective { token, .. }
            | TranslationError::ArityMismatch { token, .. }
            | TranslationError::LabelMismatch { token, .. }
            | TranslationError::Malformed { token, .. }
            | TranslationError::MissingTemporaryPool { token, .. }
            | TranslationError::RuleFailed { token, .. } => token,
        }
    }

    pub fn location(&self) -> Location {
        match self {
            TranslationError::UnresolvedDirective { location, .. }
            | TranslationError::ArityMismatch { location, .. }
            | TranslationError::LabelMismatch { location, .. }
            | TranslationError::Malformed { location, .. }
            | TranslationError::MissingTemporaryPool { location, .. }
            | TranslationError::RuleFailed { location, .. } => *location,
        }
    }
}

/// Outcome of a failed backend pass.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PassError {
    /// Aborted pass. `diagnostics` holds the directive errors found before
    /// the abort.
    #[error("backend '{backend}': {source}")]
    Configuration {
        backend: String,
        #[source]
        source: ConfigurationError,
        diagnostics: Vec<TranslationError>,
    },
    #[error("backend '{backend}': translation failed with {} error(s): {}", .errors.len(), join_errors(.errors))]
    Translation {
        backend: String,
        errors: Vec<TranslationError>,
    },
}

impl PassError {
    pub fn backend(&self) -> &str {
        match self {
            PassError::Configuration { backend, .. } | PassError::Translation { backend, .. } => {
                backend
            }
        }
    }

    /// Directive diagnostics carried by the failure, ordered by location.
    pub fn diagnostics(&self) -> &[TranslationError] {
        match self {
            PassError::Configuration { diagnostics, .. } => diagnostics,
            PassError::Translation { errors, .. } => errors,
        }
    }
}

fn join_errors(errors: &[TranslationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Syntax error reported by the expression parser.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message} at offset {offset}")]
pub struct ParseError {
    pub message: String,
    pub offset: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

impl From<ParseError> for ConfigurationError {
    fn from(err: ParseError) -> Self {
        ConfigurationError::Parse {
            context: "formula".to_string(),
            message: err.to_string(),
        }
    }
}

/// Failure while evaluating an expression numerically.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("No value bound for symbol '{0}'")]
    UnboundSymbol(String),
    #[error("Cannot evaluate unresolved reference '{0}'")]
    Unresolved(String),
}
