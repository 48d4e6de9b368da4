use graft_data::internal::graft_ndarray::{Array4, Ix4};

use super::format::{pack, unpack};
use crate::infer::InferInput;
use crate::internal::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolMode {
    Max,
    /// Sum over the window divided by the window size, padding included.
    Average,
}

/// 2D pooling, per channel, so padded channels stay zero in packed formats.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Pooling {
    pub mode: PoolMode,
    pub window: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub format: TensorFormat,
}

impl Pooling {
    fn output_len(&self, axis: usize, input: usize) -> GraftResult<usize> {
        ensure!(
            self.stride[axis] > 0 && self.window[axis] > 0,
            "Pooling needs positive stride and window, got {:?}",
            self
        );
        let padded = input + 2 * self.padding[axis];
        ensure!(padded >= self.window[axis], "Pooling window does not fit in {}", padded);
        Ok((padded - self.window[axis]) / self.stride[axis] + 1)
    }

    pub fn with_format(&self, format: TensorFormat) -> Pooling {
        Pooling { format, ..self.clone() }
    }
}

impl Op for Pooling {
    fn name(&self) -> Cow<'_, str> {
        "Pooling".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?} window: {:?} stride: {:?}", self.mode, self.window, self.stride)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "Pooling expects one input");
        let x = inputs[0].fact;
        ensure!(x.format == self.format, "Pooling in {:?} got an input in {:?}", self.format, x.format);
        let shape = match &x.shape {
            Some(shape) => {
                let logical = self.format.padded_logical_shape(shape)?;
                ensure!(logical.len() == 4, "Pooling input must be 4D, got {:?}", logical);
                let out = [
                    logical[0],
                    logical[1],
                    self.output_len(0, logical[2])?,
                    self.output_len(1, logical[3])?,
                ];
                Some(self.format.physical_shape(&out)?)
            }
            None => None,
        };
        Ok(tvec!(VarFact { datum_type: x.datum_type, shape, format: self.format }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let x = unpack(&x, self.format, None)?;
        let dt = x.datum_type();
        let view = x.to_array_view().into_dimensionality::<Ix4>()?;
        let (n, c, h, w) = view.dim();
        let (oh, ow) = (self.output_len(0, h)?, self.output_len(1, w)?);
        let window = (self.window[0] * self.window[1]) as f32;
        let y = Array4::from_shape_fn((n, c, oh, ow), |(b, ch, oy, ox)| {
            let mut acc = match self.mode {
                PoolMode::Max => f32::NEG_INFINITY,
                PoolMode::Average => 0.0,
            };
            for ky in 0..self.window[0] {
                let iy = (oy * self.stride[0] + ky) as isize - self.padding[0] as isize;
                for kx in 0..self.window[1] {
                    let ix = (ox * self.stride[1] + kx) as isize - self.padding[1] as isize;
                    if iy < 0 || ix < 0 || iy as usize >= h || ix as usize >= w {
                        continue;
                    }
                    let v = view[(b, ch, iy as usize, ix as usize)];
                    acc = match self.mode {
                        PoolMode::Max => acc.max(v),
                        PoolMode::Average => acc + v,
                    };
                }
            }
            match self.mode {
                PoolMode::Max => acc,
                PoolMode::Average => acc / window,
            }
        });
        let y = Tensor::from_array_dt(dt, y.into_dyn());
        Ok(tvec!(pack(&y, self.format)?))
    }
}
