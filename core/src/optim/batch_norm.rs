use crate::internal::*;
use crate::ops::element_wise::BinaryMode;
use crate::ops::nn::BatchNorm;

/// Rewrites inference batch normalization as element-wise arithmetic, so
/// that later passes can fold it into neighbouring convolutions.
///
/// `y = x * k + (bias - mean * k)` with `k = scale / (variance + eps) ^ 0.5`
#[derive(Debug, Default, Clone, Copy)]
pub struct ConvertBatchNormPass;

impl Pass for ConvertBatchNormPass {
    fn name(&self) -> &'static str {
        "convert_batch_norm"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        Rewriter::default()
            .with_rule_for::<BatchNorm>("batch_norm_as_arith", |state, _node, bn, inputs| {
                let &[x, scale, bias, mean, var] = inputs else { return Ok(None) };
                let graph = state.graph_mut();
                let dt = graph.fact(x).datum_type;
                let eps = graph.scalar(dt, bn.epsilon)?;
                let half = graph.scalar(dt, 0.5)?;
                let var = graph.add(var, eps)?;
                let std = graph.binary(BinaryMode::Pow, var, half)?;
                let k = graph.div(scale, std)?;
                let shift = graph.mul(mean, k)?;
                let offset = graph.sub(bias, shift)?;
                let scaled = graph.mul(x, k)?;
                Ok(Some(tvec!(graph.add(scaled, offset)?)))
            })
            .rewrite(state)
    }
}
