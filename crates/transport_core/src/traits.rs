use crate::error::ConfigurationError;
use crate::storage::FlattenedTensor;
use crate::symbolic::Expr;
use crate::tensors::TensorLambda;
use num_traits::{Float, FromPrimitive};
use std::fmt::Debug;

/// A trait for types that can be used as scalars by the evaluator.
pub trait Scalar: Float + FromPrimitive + Debug + 'static {}

impl<T: Float + FromPrimitive + Debug + 'static> Scalar for T {}

/// Capability shared by every physics tensor object.
pub trait TensorConcept {
    /// Every component, in flattened storage order.
    fn compute(&mut self) -> Result<FlattenedTensor<Expr>, ConfigurationError>;

    /// One fully resolved component. Cached until invalidated.
    fn compute_component(&mut self, indices: &[usize]) -> Result<Expr, ConfigurationError>;

    /// A reusable evaluator over unresolved indices.
    fn compute_lambda(&mut self) -> Result<TensorLambda, ConfigurationError>;

    /// Drops cached components of this tensor and everything built on it.
    fn reset_cache(&mut self);
}
