/// # Operators on arrays and shapes
mod concat;
mod cond_take;
mod reshape;
mod subtensor;

pub use self::concat::Concat;
pub use self::cond_take::{CondTake, CondTakeMode};
pub use self::reshape::{AxisAddRemove, AxisDesc, Dimshuffle, GetVarShape, Reshape};
pub use self::subtensor::Subtensor;
