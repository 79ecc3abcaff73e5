//! Concrete replacement-rule packages and the translation driver.
//!
//! Every backend registers three packages: [`ModelInfo`] for model metadata
//! and index helpers, [`FlowTensors`] for the tensor directives, and the
//! [`LanguagePackage`] of its language. [`translate`] runs one pass;
//! [`translate_all`] runs independent passes in parallel.

pub mod driver;
pub mod flow_tensors;
pub mod languages;
pub mod model_info;

pub use driver::{load_model, packages, translate, translate_all, translate_with, TranslationJob};
pub use flow_tensors::FlowTensors;
pub use languages::{Language, LanguagePackage};
pub use model_info::ModelInfo;
