use graft_data::internal::graft_ndarray::{self, Axis};

use crate::infer::InferInput;
use crate::internal::*;

/// Concatenation along a logical axis.
///
/// In a packed format the inputs are joined along the physical axis holding
/// the logical one. Joining along channels is only exact if every input's
/// channel count is a multiple of the block size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Concat {
    pub axis: usize,
    pub format: TensorFormat,
}

impl Concat {
    pub fn axis(axis: usize) -> Concat {
        Concat { axis, format: TensorFormat::Default }
    }

    pub fn with_format(&self, format: TensorFormat) -> Concat {
        Concat { format, ..*self }
    }

    fn physical_axis(&self) -> usize {
        self.format.physical_axis(self.axis)
    }
}

impl Op for Concat {
    fn name(&self) -> Cow<'_, str> {
        "Concat".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("axis: {} format: {:?}", self.axis, self.format)])
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(!inputs.is_empty(), "Concat needs at least one input");
        let first = inputs[0].fact;
        for input in inputs {
            ensure!(
                input.fact.datum_type == first.datum_type && input.fact.format == self.format,
                "Concat in {:?} of {} got {}",
                self.format,
                first.datum_type,
                input.fact
            );
        }
        let axis = self.physical_axis();
        let shapes: Option<Vec<&[usize]>> = inputs.iter().map(|i| i.fact.shape.as_deref()).collect();
        let shape = match shapes {
            Some(shapes) => {
                let mut shape: TVec<usize> = shapes[0].into();
                ensure!(axis < shape.len(), "Concat axis {} out of rank {}", axis, shape.len());
                for s in &shapes[1..] {
                    ensure!(
                        s.len() == shape.len()
                            && s.iter().zip(shape.iter()).enumerate().all(|(ix, (a, b))| ix == axis || a == b),
                        "Concat shape mismatch: {:?}",
                        shapes
                    );
                    shape[axis] += s[axis];
                }
                Some(shape)
            }
            None => None,
        };
        Ok(tvec!(VarFact { datum_type: first.datum_type, shape, format: self.format }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let inputs = crate::ops::values(inputs)?;
        let dt = inputs[0].datum_type();
        let views = inputs.iter().map(|t| t.to_array_view()).collect_vec();
        let joined = graft_ndarray::concatenate(Axis(self.physical_axis()), &views)?;
        Ok(tvec!(Tensor::from_array_dt(dt, joined)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cnn::format::{pack, unpack};

    #[test]
    fn concat_with_empty() -> GraftResult<()> {
        let a = Tensor::from_shape(DatumType::F32, &[2, 1], &[1.0, 2.0])?;
        let e = Tensor::zero(DatumType::F32, &[2, 0]);
        let b = Tensor::from_shape(DatumType::F32, &[2, 2], &[3.0, 4.0, 5.0, 6.0])?;
        let y = Concat::axis(1).eval(tvec!(a.into(), e.into(), b.into()))?;
        assert_eq!(y[0].shape(), &[2, 3]);
        assert_eq!(y[0].as_slice(), &[1.0, 3.0, 4.0, 2.0, 5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn packed_concat_on_height_and_channels() -> GraftResult<()> {
        let a = Tensor::from_fn(DatumType::F32, &[1, 4, 2, 3], |i| i as f32);
        let b = Tensor::from_fn(DatumType::F32, &[1, 4, 1, 3], |i| 100.0 + i as f32);
        for format in [TensorFormat::Nchw4, TensorFormat::Nhwcd4] {
            for axis in [1, 2] {
                let b = if axis == 1 { a.clone() } else { b.clone() };
                let reference = Concat::axis(axis).eval(tvec!(a.clone().into(), b.clone().into()))?;
                let packed = Concat::axis(axis).with_format(format).eval(tvec!(
                    pack(&a, format)?.into(),
                    pack(&b, format)?.into()
                ))?;
                assert_eq!(unpack(&packed[0], format, None)?, reference[0]);
            }
        }
        Ok(())
    }
}
