use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::infer::InferInput;
use crate::internal::*;

/// A host-side tensor fed to the graph at each execution. Its value and
/// shape may change between executions.
#[derive(Debug, Clone)]
pub struct HostTensor(Arc<RwLock<Tensor>>);

impl HostTensor {
    pub fn new(t: Tensor) -> HostTensor {
        HostTensor(Arc::new(RwLock::new(t)))
    }

    pub fn set(&self, t: Tensor) {
        *self.0.write() = t
    }

    pub fn get(&self) -> Tensor {
        self.0.read().clone()
    }

    pub fn fact(&self) -> VarFact {
        VarFact::of_tensor(&self.0.read())
    }
}

impl PartialEq for HostTensor {
    fn eq(&self, other: &HostTensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for HostTensor {}

impl Hash for HostTensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct HostInput(pub HostTensor);

impl Op for HostInput {
    fn name(&self) -> Cow<'_, str> {
        "HostInput".into()
    }

    impl_op_same_as!();

    fn is_pure(&self) -> bool {
        false
    }

    fn infer(&self, _inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        Ok(tvec!(self.0.fact()))
    }

    fn eval(&self, _inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        Ok(tvec!(self.0.get()))
    }
}
