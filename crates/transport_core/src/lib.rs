/// The `transport_core` crate turns a declarative inflationary model into the
/// symbolic objects a transport integrator needs, and emits them as source
/// text for any number of backends.
///
/// Key components:
/// - **Index algebra** (`index`): abstract indices, classifications and ranges.
/// - **Storage** (`storage`): flattened tensors and the offset convention shared
///   with generated code.
/// - **Symbolic layer** (`symbolic`): canonical expression trees, calculus, a
///   formula parser and a bytecode evaluator.
/// - **Tensors** (`tensors`): the closed set of physics tensors, cached per pass
///   and invalidated through their dependency graph.
/// - **CSE** (`cse`): shared-subexpression extraction with memoised rendering.
/// - **Codegen** (`codegen`): rule registry and the macro engine.
pub mod codegen;
pub mod cse;
pub mod error;
pub mod index;
pub mod model;
pub mod printer;
pub mod settings;
pub mod storage;
pub mod symbolic;
pub mod tensors;
pub mod traits;

pub use error::{ConfigurationError, PassError, TranslationError};
pub use model::{Model, ModelDescription};
pub use settings::{TranslatorSettings, UnrollPolicy};
pub use tensors::{TensorId, TensorSet};
