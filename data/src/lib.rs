//! Datum types and tensors used as values by the graft graph engine.
//!
//! Tensors keep their elements as `f32` in an `ndarray` array, tagged with a
//! [`DatumType`]. Every element is kept representable in its datum type
//! (float16 values are rounded, integers truncated), so reading a tensor
//! back from its byte form is lossless.

#[macro_use]
mod macros;

/// A Smallvec instantiation with 4 embeddable values.
///
/// Used about everywhere in graft, for operator inputs and outputs, or
/// tensor dimensions.
pub type TVec<T> = smallvec::SmallVec<[T; 4]>;

pub type GraftError = anyhow::Error;
pub type GraftResult<T> = anyhow::Result<T>;

pub mod prelude {
    pub use crate::datum::DatumType;
    pub use crate::tensor::{IntoArcTensor, Tensor, tensor0, tensor1, tensor4};
    pub use crate::tvec;
    pub use crate::TVec;
    pub use crate::{GraftError, GraftResult};
    pub use half::f16;
}

pub mod internal {
    pub use crate::prelude::*;
    pub use crate::tensor::{broadcast_shapes, natural_strides};
    pub use anyhow::{Context, anyhow, bail, ensure, format_err};
    pub use ndarray as graft_ndarray;
    pub use smallvec as graft_smallvec;
}

pub use anyhow;

mod datum;
mod tensor;
