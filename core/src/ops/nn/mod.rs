mod batch_norm;
mod reduce;

pub use self::batch_norm::{BatchNorm, BnParamDim};
pub use self::reduce::{Reduce, ReduceMode};
