use graft_data::internal::graft_ndarray::{ArrayD, ArrayViewD, Axis, IxDyn};

use crate::infer::InferInput;
use crate::internal::*;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum ReduceMode {
    Sum,
    Mean,
    Max,
    Min,
    SumSqr,
}

impl ReduceMode {
    fn reduce(&self, view: ArrayViewD<f32>) -> f32 {
        match self {
            ReduceMode::Sum => view.sum(),
            ReduceMode::Mean => view.sum() / view.len() as f32,
            ReduceMode::Max => view.fold(f32::NEG_INFINITY, |a, b| a.max(*b)),
            ReduceMode::Min => view.fold(f32::INFINITY, |a, b| a.min(*b)),
            ReduceMode::SumSqr => view.fold(0.0, |a, b| a + b * b),
        }
    }
}

/// Reduction along one axis, kept with size 1, or over the whole tensor to
/// a `[1]` shaped result.
#[derive(Clone, Debug, Hash, PartialEq, Eq, new)]
pub struct Reduce {
    pub mode: ReduceMode,
    pub axis: Option<usize>,
}

impl Reduce {
    fn output_shape(&self, input: &[usize]) -> GraftResult<TVec<usize>> {
        match self.axis {
            Some(axis) => {
                ensure!(axis < input.len(), "Reduce axis {} out of rank {}", axis, input.len());
                let mut shape: TVec<usize> = input.into();
                shape[axis] = 1;
                Ok(shape)
            }
            None => Ok(tvec!(1)),
        }
    }
}

impl Op for Reduce {
    fn name(&self) -> Cow<'_, str> {
        "Reduce".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?} axis: {:?}", self.mode, self.axis)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "Reduce expects one input");
        let x = inputs[0].fact;
        ensure!(x.format.is_default(), "Reduce works on default layout, got {}", x);
        let shape = x.shape.as_ref().map(|s| self.output_shape(s)).transpose()?;
        Ok(tvec!(VarFact { shape, ..x.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let dt = x.datum_type();
        let view = x.to_array_view();
        let output = match self.axis {
            Some(axis) => {
                let shape = self.output_shape(x.shape())?;
                let reduced = view.map_axis(Axis(axis), |lane| self.mode.reduce(lane.into_dyn()));
                reduced.into_shape_with_order(IxDyn(&shape))?
            }
            None => ArrayD::from_elem(IxDyn(&[1]), self.mode.reduce(view)),
        };
        Ok(tvec!(Tensor::from_array_dt(dt, output)))
    }
}
