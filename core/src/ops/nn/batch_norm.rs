use std::hash::{Hash, Hasher};

use crate::infer::InferInput;
use crate::internal::*;

/// Shape of the per-channel parameters.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum BnParamDim {
    /// `[1, C, 1, 1]`, channels second.
    Dim1C11,
    /// `[1, 1, 1, C]`, channels last.
    Dim111C,
}

/// Inference-mode batch normalization. Inputs: data, scale, bias, mean,
/// variance.
///
/// `y = (x - mean) / sqrt(variance + epsilon) * scale + bias`
#[derive(Clone, Debug, PartialEq, new)]
pub struct BatchNorm {
    pub param_dim: BnParamDim,
    pub epsilon: f32,
}

impl Eq for BatchNorm {}

impl Hash for BatchNorm {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.param_dim.hash(state);
        self.epsilon.to_bits().hash(state);
    }
}

impl BatchNorm {
    pub fn param_shape(&self, channels: usize) -> [usize; 4] {
        match self.param_dim {
            BnParamDim::Dim1C11 => [1, channels, 1, 1],
            BnParamDim::Dim111C => [1, 1, 1, channels],
        }
    }

    fn channel_axis(&self) -> usize {
        match self.param_dim {
            BnParamDim::Dim1C11 => 1,
            BnParamDim::Dim111C => 3,
        }
    }
}

impl Op for BatchNorm {
    fn name(&self) -> Cow<'_, str> {
        "BatchNorm".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?} epsilon: {}", self.param_dim, self.epsilon)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 5, "BatchNorm expects data, scale, bias, mean and variance");
        let x = inputs[0].fact;
        ensure!(x.format.is_default(), "BatchNorm works on default layout, got {}", x);
        if let Some(shape) = &x.shape {
            ensure!(shape.len() == 4, "BatchNorm input must be 4D, got {:?}", shape);
            let expected = self.param_shape(shape[self.channel_axis()]);
            for param in &inputs[1..] {
                ensure!(
                    param.fact.datum_type == x.datum_type
                        && param.fact.shape.as_deref().is_none_or(|s| s == expected),
                    "BatchNorm parameter {} does not match {:?}",
                    param.fact,
                    expected
                );
            }
        }
        Ok(tvec!(x.clone()))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let inputs = crate::ops::values(inputs)?;
        let dt = inputs[0].datum_type();
        let x = inputs[0].to_array_view();
        let [scale, bias, mean, var] =
            [1, 2, 3, 4].map(|ix| inputs[ix].to_array_view().broadcast(x.raw_dim()).map(|v| v.to_owned()));
        let (Some(scale), Some(bias), Some(mean), Some(var)) = (scale, bias, mean, var) else {
            bail!("BatchNorm parameters do not broadcast to {:?}", x.shape())
        };
        let eps = self.epsilon;
        let mut y = (&x - &mean) / var.mapv(|v| (v + eps).sqrt());
        y = y * scale + bias;
        Ok(tvec!(Tensor::from_array_dt(dt, y)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn normalizes_per_channel() -> GraftResult<()> {
        let bn = BatchNorm::new(BnParamDim::Dim1C11, 1e-5);
        let x = Tensor::from_shape(DatumType::F32, &[1, 2, 1, 2], &[1.0, 3.0, 10.0, 20.0])?;
        let scale = tensor4([1, 2, 1, 1], &[2.0, 1.0])?;
        let bias = tensor4([1, 2, 1, 1], &[0.0, 1.0])?;
        let mean = tensor4([1, 2, 1, 1], &[2.0, 15.0])?;
        let var = tensor4([1, 2, 1, 1], &[1.0, 25.0])?;
        let y = bn.eval(tvec!(x.into(), scale.into(), bias.into(), mean.into(), var.into()))?;
        let expected = [-2.0, 2.0, 0.0, 2.0];
        for (a, b) in y[0].as_slice().iter().zip(expected) {
            assert_abs_diff_eq!(*a, b, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn channel_last_params() {
        let bn = BatchNorm::new(BnParamDim::Dim111C, 1e-5);
        assert_eq!(bn.param_shape(3), [1, 1, 1, 3]);
        assert_eq!(bn.channel_axis(), 3);
    }
}
