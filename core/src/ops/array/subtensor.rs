use graft_data::internal::graft_ndarray::{Axis, Slice};

use crate::infer::InferInput;
use crate::internal::*;

/// `x[.., start..end, ..]` along one axis of a default-layout tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Subtensor {
    pub axis: usize,
    pub start: usize,
    pub end: usize,
}

impl Op for Subtensor {
    fn name(&self) -> Cow<'_, str> {
        "Subtensor".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("axis: {} range: {}..{}", self.axis, self.start, self.end)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "Subtensor expects one input");
        let x = inputs[0].fact;
        ensure!(x.format.is_default(), "Subtensor works on default layout, got {}", x);
        let shape = match &x.shape {
            Some(s) => {
                ensure!(
                    self.axis < s.len() && self.start <= self.end && self.end <= s[self.axis],
                    "Subtensor {:?} out of bounds for {:?}",
                    self,
                    s
                );
                let mut shape = s.clone();
                shape[self.axis] = self.end - self.start;
                Some(shape)
            }
            None => None,
        };
        Ok(tvec!(VarFact { shape, ..x.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        ensure!(
            x.shape().get(self.axis).is_some_and(|d| self.start <= self.end && self.end <= *d),
            "Subtensor {:?} out of bounds for {:?}",
            self,
            x.shape()
        );
        let view = x.to_array_view();
        let sliced = view.slice_axis(Axis(self.axis), Slice::from(self.start..self.end));
        Ok(tvec!(Tensor::from_array_dt(x.datum_type(), sliced.to_owned())))
    }
}
