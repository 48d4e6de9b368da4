use super::ConvParams;
use super::conv::infer_conv_output;
use super::format::{pack, unpack};
use crate::infer::InferInput;
use crate::internal::*;
use crate::ops::element_wise::UnaryMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NonlineMode {
    #[default]
    Identity,
    Relu,
    Sigmoid,
    HSwish,
}

impl NonlineMode {
    pub fn from_unary(mode: UnaryMode) -> Option<NonlineMode> {
        match mode {
            UnaryMode::Relu => Some(NonlineMode::Relu),
            UnaryMode::Sigmoid => Some(NonlineMode::Sigmoid),
            UnaryMode::HSwish => Some(NonlineMode::HSwish),
            _ => None,
        }
    }

    pub fn eval(&self, x: f32) -> f32 {
        match self {
            NonlineMode::Identity => x,
            NonlineMode::Relu => UnaryMode::Relu.eval(x),
            NonlineMode::Sigmoid => UnaryMode::Sigmoid.eval(x),
            NonlineMode::HSwish => UnaryMode::HSwish.eval(x),
        }
    }
}

/// `nonlin(conv(x, w) + bias [+ z])`.
///
/// The bias is in logical layout, either per output channel (`[1, OC, 1,
/// 1]`) or of the full logical output shape. The optional z operand has the
/// output's fact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new, Default)]
pub struct ConvBias {
    pub params: ConvParams,
    pub nonline: NonlineMode,
}

impl ConvBias {
    pub fn check_bias(output_logical: &[usize], bias: &[usize]) -> GraftResult<()> {
        let channel = [1, output_logical[1], 1, 1];
        ensure!(
            bias == channel || bias == output_logical,
            "Bias of shape {:?} does not fit output {:?}",
            bias,
            output_logical
        );
        Ok(())
    }
}

impl Op for ConvBias {
    fn name(&self) -> Cow<'_, str> {
        "ConvBias".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?}", self.params), format!("nonline: {:?}", self.nonline)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(
            inputs.len() == 3 || inputs.len() == 4,
            "ConvBias expects data, weights, bias and optional z, got {} inputs",
            inputs.len()
        );
        let output = infer_conv_output(&self.params, inputs[0].fact, inputs[1].fact)?;
        let bias = inputs[2].fact;
        ensure!(bias.format.is_default(), "Bias must be in default layout");
        ensure!(bias.datum_type == output.datum_type, "Bias datum type mismatch");
        if let (Some(out), Some(b)) = (&output.shape, &bias.shape) {
            let mut logical = self.params.format.padded_logical_shape(out)?;
            if let Some(w) = &inputs[1].fact.shape {
                let [g, ocg, ..] = super::group_weight_shape(w)?;
                logical[1] = g * ocg;
            }
            ConvBias::check_bias(&logical, b)?;
        }
        if let Some(z) = inputs.get(3) {
            ensure!(
                z.fact.datum_type == output.datum_type && z.fact.format == output.format,
                "Z operand {} does not match output {}",
                z.fact,
                output
            );
            if let (Some(zs), Some(os)) = (&z.fact.shape, &output.shape) {
                ensure!(zs == os, "Z operand shape {:?} differs from output {:?}", zs, os);
            }
        }
        Ok(tvec!(output))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let inputs = crate::ops::values(inputs)?;
        let format = self.params.format;
        let x = unpack(&inputs[0], format, None)?;
        let y = self.params.convolve(&x, &inputs[1])?;
        let dt = y.datum_type();
        let mut y = y.into_array();
        y += &inputs[2].to_array_view();
        if let Some(z) = inputs.get(3) {
            let z = unpack(z, format, Some(y.shape()[1]))?;
            y += &z.to_array_view();
        }
        y.mapv_inplace(|v| self.nonline.eval(v));
        let y = Tensor::from_array_dt(dt, y);
        Ok(tvec!(pack(&y, format)?))
    }

    fn recompute_cost(&self, inputs: &[&VarFact]) -> f64 {
        let x = inputs.first().and_then(|f| f.byte_size()).unwrap_or(1);
        let w = inputs.get(1).and_then(|f| f.shape.as_ref()).map(|s| s.iter().product::<usize>()).unwrap_or(1);
        (x * w) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cnn::Convolution;

    #[test]
    fn matches_unfused_computation() -> GraftResult<()> {
        let x = Tensor::from_fn(DatumType::F32, &[1, 3, 4, 4], |i| (i % 5) as f32 - 2.0);
        let w = Tensor::from_fn(DatumType::F32, &[2, 3, 3, 3], |i| (i % 3) as f32 - 1.0);
        let b = Tensor::from_shape(DatumType::F32, &[1, 2, 1, 1], &[0.5, -30.0])?;
        let conv = Convolution::default().eval(tvec!(x.clone().into(), w.clone().into()))?.remove(0);
        let expected = conv.to_array_view().to_owned() + &b.to_array_view();
        let expected = expected.mapv(|v| v.max(0.0));
        let fused = ConvBias::new(ConvParams::default(), NonlineMode::Relu)
            .eval(tvec!(x.into(), w.into(), b.into()))?
            .remove(0);
        assert_eq!(fused, Tensor::from(expected));
        Ok(())
    }

    #[test]
    fn bias_shapes() {
        assert!(ConvBias::check_bias(&[2, 4, 3, 3], &[1, 4, 1, 1]).is_ok());
        assert!(ConvBias::check_bias(&[2, 4, 3, 3], &[2, 4, 3, 3]).is_ok());
        assert!(ConvBias::check_bias(&[2, 4, 3, 3], &[1, 1, 1, 1]).is_err());
        assert!(ConvBias::check_bias(&[2, 4, 3, 3], &[4]).is_err());
    }
}
