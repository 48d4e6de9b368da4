use std::hash::{Hash, Hasher};

use crate::infer::InferInput;
use crate::internal::*;

/// A parameter living in device memory. Two `SharedTensor` are the same
/// operator only if they hold the very same tensor.
#[derive(Debug, Clone, new)]
pub struct SharedTensor(pub Arc<Tensor>);

impl PartialEq for SharedTensor {
    fn eq(&self, other: &SharedTensor) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for SharedTensor {}

impl Hash for SharedTensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.0).hash(state)
    }
}

impl Op for SharedTensor {
    fn name(&self) -> Cow<'_, str> {
        "SharedTensor".into()
    }

    impl_op_same_as!();

    fn is_const_leaf(&self) -> bool {
        true
    }

    fn leaf_value(&self, _slot: usize) -> Option<Arc<Tensor>> {
        Some(self.0.clone())
    }

    fn infer(&self, _inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        Ok(tvec!(VarFact::of_tensor(&self.0)))
    }

    // Device parameters may be updated in place by their owner.
    fn infer_value(&self, _inputs: &[InferInput]) -> GraftResult<Option<TVec<Arc<Tensor>>>> {
        Ok(None)
    }

    fn eval(&self, _inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        Ok(tvec!((*self.0).clone()))
    }
}

/// A constant whose value is known to static inference.
#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct ImmutableTensor(pub Arc<Tensor>);

impl Op for ImmutableTensor {
    fn name(&self) -> Cow<'_, str> {
        "ImmutableTensor".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?}", self.0)])
    }

    fn is_const_leaf(&self) -> bool {
        true
    }

    fn leaf_value(&self, _slot: usize) -> Option<Arc<Tensor>> {
        Some(self.0.clone())
    }

    fn infer(&self, _inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        Ok(tvec!(VarFact::of_tensor(&self.0)))
    }

    fn infer_value(&self, _inputs: &[InferInput]) -> GraftResult<Option<TVec<Arc<Tensor>>>> {
        Ok(Some(tvec!(self.0.clone())))
    }

    fn eval(&self, _inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        Ok(tvec!((*self.0).clone()))
    }
}

/// Several device parameters behind a single operator.
#[derive(Debug, Clone, new)]
pub struct MultiTensorHolder(pub TVec<Arc<Tensor>>);

impl PartialEq for MultiTensorHolder {
    fn eq(&self, other: &MultiTensorHolder) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| Arc::ptr_eq(a, b))
    }
}

impl Eq for MultiTensorHolder {}

impl Hash for MultiTensorHolder {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for t in &self.0 {
            Arc::as_ptr(t).hash(state)
        }
    }
}

impl Op for MultiTensorHolder {
    fn name(&self) -> Cow<'_, str> {
        "MultiTensorHolder".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{} tensors", self.0.len())])
    }

    fn nr_outputs(&self) -> usize {
        self.0.len()
    }

    fn is_const_leaf(&self) -> bool {
        true
    }

    fn leaf_value(&self, slot: usize) -> Option<Arc<Tensor>> {
        self.0.get(slot).cloned()
    }

    fn infer(&self, _inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        Ok(self.0.iter().map(|t| VarFact::of_tensor(t)).collect())
    }

    fn infer_value(&self, _inputs: &[InferInput]) -> GraftResult<Option<TVec<Arc<Tensor>>>> {
        Ok(None)
    }

    fn eval(&self, _inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        Ok(self.0.iter().map(|t| (**t).clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_tensors_compare_by_identity() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let t = Arc::new(tensor1(&[1.0]));
        let a = graph.wire_node("", SharedTensor(t.clone()), &[])?[0];
        let b = graph.wire_node("", SharedTensor(t), &[])?[0];
        let c = graph.shared("", tensor1(&[1.0]))?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        let i1 = graph.immutable("", tensor1(&[1.0]))?;
        let i2 = graph.immutable("", tensor1(&[1.0]))?;
        assert_eq!(i1, i2);
        Ok(())
    }

    #[test]
    fn holder_outputs() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let holder =
            MultiTensorHolder(tvec!(Arc::new(tensor1(&[1.0, 2.0])), Arc::new(tensor0(3.0))));
        let outputs = graph.wire_node("params", holder, &[])?;
        assert_eq!(outputs.len(), 2);
        assert_eq!(graph.var(outputs[1]).name, "params:1");
        assert_eq!(graph.fact(outputs[0]).shape.as_deref(), Some(&[2][..]));
        Ok(())
    }
}
