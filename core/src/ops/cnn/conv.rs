use super::format::{pack, unpack};
use super::{ConvParams, group_weight_shape};
use crate::infer::InferInput;
use crate::internal::*;

/// 2D convolution. Inputs: data, weights.
///
/// In a packed format, data and output are in that format; weights stay
/// in logical layout and must cover the padded input channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new, Default)]
pub struct Convolution {
    pub params: ConvParams,
}

impl Convolution {
    pub fn is_group(&self, weights: &VarFact) -> bool {
        weights.rank() == Some(5)
    }
}

pub(crate) fn infer_conv_output(
    params: &ConvParams,
    x: &VarFact,
    w: &VarFact,
) -> GraftResult<VarFact> {
    ensure!(
        x.format == params.format,
        "Convolution in {:?} got an input in {:?}",
        params.format,
        x.format
    );
    ensure!(w.format.is_default(), "Convolution weights must be in default layout");
    ensure!(
        x.datum_type == w.datum_type,
        "Convolution data is {}, weights are {}",
        x.datum_type,
        w.datum_type
    );
    let shape = match (&x.shape, &w.shape) {
        (Some(x), Some(w)) => {
            let logical = params.format.padded_logical_shape(x)?;
            let [g, ocg, ..] = group_weight_shape(w)?;
            if g > 1 && !params.format.is_default() {
                ensure!(
                    ocg % params.format.pack() == 0,
                    "Group convolution in {:?} needs aligned output channels",
                    params.format
                );
            }
            Some(params.format.physical_shape(&params.output_shape(&logical, w)?)?)
        }
        _ => None,
    };
    Ok(VarFact { datum_type: x.datum_type, shape, format: params.format })
}

impl Op for Convolution {
    fn name(&self) -> Cow<'_, str> {
        "Convolution".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?}", self.params)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 2, "Convolution expects data and weights");
        Ok(tvec!(infer_conv_output(&self.params, inputs[0].fact, inputs[1].fact)?))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let (x, w) = args_2!(crate::ops::values(inputs)?);
        let x = unpack(&x, self.params.format, None)?;
        let y = self.params.convolve(&x, &w)?;
        Ok(tvec!(pack(&y, self.params.format)?))
    }

    fn recompute_cost(&self, inputs: &[&VarFact]) -> f64 {
        let x = inputs.first().and_then(|f| f.byte_size()).unwrap_or(1);
        let w = inputs.get(1).and_then(|f| f.shape.as_ref()).map(|s| s.iter().product::<usize>()).unwrap_or(1);
        (x * w) as f64
    }
}
