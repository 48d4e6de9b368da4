use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

use crate::infer::InferInput;
use crate::internal::*;

/// User function receiving the value of an output at each execution.
pub type Callback = Arc<Mutex<dyn FnMut(&Tensor) + Send>>;

/// Sink operator calling a callback with its input. Has no output.
#[derive(Clone)]
pub struct CallbackCaller {
    pub callback: Callback,
}

impl CallbackCaller {
    pub fn new(callback: Callback) -> CallbackCaller {
        CallbackCaller { callback }
    }
}

impl fmt::Debug for CallbackCaller {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "CallbackCaller({:?})", Arc::as_ptr(&self.callback) as *const ())
    }
}

impl PartialEq for CallbackCaller {
    fn eq(&self, other: &CallbackCaller) -> bool {
        Arc::ptr_eq(&self.callback, &other.callback)
    }
}

impl Eq for CallbackCaller {}

impl Hash for CallbackCaller {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.callback) as *const ()).hash(state)
    }
}

impl Op for CallbackCaller {
    fn name(&self) -> Cow<'_, str> {
        "CallbackCaller".into()
    }

    impl_op_same_as!();

    fn nr_outputs(&self) -> usize {
        0
    }

    fn is_pure(&self) -> bool {
        false
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "CallbackCaller expects one input");
        Ok(tvec!())
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let mut callback = self.callback.lock();
        (*callback)(&x);
        Ok(tvec!())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_caller_per_callback() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor0(1.0))?;
        let seen = Arc::new(Mutex::new(0));
        let counter = seen.clone();
        let cb: Callback = Arc::new(Mutex::new(move |_: &Tensor| *counter.lock() += 1));
        let c1 = graph.insert_opr("", CallbackCaller::new(cb.clone()), &[a])?;
        let c2 = graph.insert_opr("", CallbackCaller::new(cb.clone()), &[a])?;
        assert_eq!(c1, c2);
        assert!(graph.opr(c1).outputs.is_empty());
        graph.opr(c1).op().eval(tvec!(tensor0(2.0).into()))?;
        assert_eq!(*seen.lock(), 1);
        Ok(())
    }
}
