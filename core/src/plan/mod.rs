//! # Compilation and execution
//!
//! [`ComputingGraph::compile`] turns an output spec into an [`Executable`]:
//! the operators needed to compute the requested vars, in dependency order,
//! with every intermediate var assigned to static or dynamic memory.
use parking_lot::Mutex;

use crate::internal::*;

mod compile;
mod exec;
mod json;

pub use self::exec::Executable;
pub use crate::ops::callback::Callback;

/// A var to compute, and the function receiving its value, if any.
pub type OutputSpecItem = (VarId, Option<Callback>);

/// Output spec entry copying the value of `var` into the returned slot at
/// each execution.
pub fn callback_copy(var: VarId) -> (OutputSpecItem, Arc<Mutex<Option<Tensor>>>) {
    let slot = Arc::new(Mutex::new(None));
    let sink = slot.clone();
    let callback: Callback = Arc::new(Mutex::new(move |t: &Tensor| *sink.lock() = Some(t.clone())));
    ((var, Some(callback)), slot)
}
