use crate::internal::*;
use crate::ops::cast::TypeCvt;
use crate::ops::cnn::{ComputeMode, ConvBias, ConvParams, Convolution};
use crate::ops::konst::{ImmutableTensor, MultiTensorHolder, SharedTensor};
use crate::ops::source::HostInput;

/// Runs float32 computations in float16.
///
/// Float32 inputs are converted on entry, float32 constants are converted
/// once, and endpoints are converted back to float32. With `io_f32_comp`,
/// convolutions keep accumulating in float32.
#[derive(Debug, Clone, Copy, new)]
pub struct ConvertF32ToF16Pass {
    io_f32_comp: bool,
}

fn half(t: &Arc<Tensor>) -> Arc<Tensor> {
    if t.datum_type() == DatumType::F32 { t.cast_to(DatumType::F16).into_arc_tensor() } else { t.clone() }
}

impl ConvertF32ToF16Pass {
    fn compute_params(&self, params: &ConvParams) -> ConvParams {
        if self.io_f32_comp { ConvParams { compute_mode: ComputeMode::Float32, ..params.clone() } } else { params.clone() }
    }

    fn leaf(state: &mut OptState, node: &OperatorNode, op: impl Into<Box<dyn Op>>) -> GraftResult<TVec<VarId>> {
        let opr = state.graph_mut().insert_opr_on(Some(node.comp_node), node.name.clone(), op, &[])?;
        Ok(state.graph().opr(opr).outputs.clone())
    }
}

impl Pass for ConvertF32ToF16Pass {
    fn name(&self) -> &'static str {
        "convert_f32_to_f16"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        state.set_relaxed_checks(true);
        let this = *self;
        Rewriter::default()
            .with_rule_for::<HostInput>("f16_input", |state, node, _op, _inputs| {
                let x = node.outputs[0];
                if state.graph().fact(x).datum_type != DatumType::F32 {
                    return Ok(None);
                }
                Ok(Some(tvec!(state.graph_mut().type_cvt(x, DatumType::F16)?)))
            })
            .with_rule_for::<SharedTensor>("f16_param", |state, node, op, _inputs| {
                if op.0.datum_type() != DatumType::F32 {
                    return Ok(None);
                }
                Ok(Some(Self::leaf(state, node, SharedTensor(half(&op.0)))?))
            })
            .with_rule_for::<ImmutableTensor>("f16_const", |state, node, op, _inputs| {
                if op.0.datum_type() != DatumType::F32 {
                    return Ok(None);
                }
                Ok(Some(Self::leaf(state, node, ImmutableTensor(half(&op.0)))?))
            })
            .with_rule_for::<MultiTensorHolder>("f16_params", |state, node, op, _inputs| {
                if op.0.iter().all(|t| t.datum_type() != DatumType::F32) {
                    return Ok(None);
                }
                Ok(Some(Self::leaf(state, node, MultiTensorHolder(op.0.iter().map(half).collect()))?))
            })
            .with_rule_for::<TypeCvt>("f16_type_cvt", |state, _node, op, inputs| {
                if op.to != DatumType::F32 {
                    return Ok(None);
                }
                Ok(Some(tvec!(state.graph_mut().type_cvt(inputs[0], DatumType::F16)?)))
            })
            .with_rule_for::<Convolution>("f32_compute_conv", move |state, _node, op, inputs| {
                let params = this.compute_params(&op.params);
                Ok(Some(tvec!(state.graph_mut().conv(inputs[0], inputs[1], params)?)))
            })
            .with_rule_for::<ConvBias>("f32_compute_conv_bias", move |state, _node, op, inputs| {
                let op = ConvBias::new(this.compute_params(&op.params), op.nonline);
                Ok(Some(state.graph_mut().wire_node("", op, inputs)?))
            })
            .rewrite(state)?;
        for ep in state.endpoints().to_vec() {
            let new = state.get_var_replace(ep);
            let (before, after) = (state.graph().fact(ep).datum_type, state.graph().fact(new).datum_type);
            if before != after {
                let back = state.graph_mut().type_cvt(new, before)?;
                state.replace_var(ep, back, "float32 endpoint")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cnn::NonlineMode;
    use crate::optim::test_utils::{random, run};

    fn conv_net(graph: &mut ComputingGraph) -> GraftResult<VarId> {
        let x = graph.host_input("x", &HostTensor::new(random(&[2, 3, 8, 8], 1)))?;
        let w = graph.shared("w", random(&[4, 3, 3, 3], 2))?;
        let b = graph.shared("b", random(&[1, 4, 1, 1], 3))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y = graph.conv_bias(x, w, b, params, NonlineMode::Relu)?;
        let y = graph.mul_scalar(y, 0.5)?;
        graph.reshape_to(y, &[2, 4 * 8 * 8])
    }

    #[test]
    fn f16_io_f32_comp() -> GraftResult<()> {
        crate::setup_test_logger();
        let mut graph = ComputingGraph::make();
        let y = conv_net(&mut graph)?;
        let result = GraphOptimizer::default().add_pass(ConvertF32ToF16Pass::new(true)).apply(&mut graph, &[y])?;
        let y_opt = result.endpoint_vars[0];
        assert_eq!(graph.fact(y_opt).datum_type, DatumType::F32);
        assert!(graph.owner(y_opt).op_is::<TypeCvt>());
        let cb = find_opr::<ConvBias>(&graph, y_opt).context("No ConvBias")?;
        assert_eq!(cb.op_as::<ConvBias>().map(|op| op.params.compute_mode), Some(ComputeMode::Float32));
        assert_eq!(graph.fact(cb.outputs[0]).datum_type, DatumType::F16);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-2)
    }

    #[test]
    fn f16_io_comp() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let y = conv_net(&mut graph)?;
        let result = GraphOptimizer::default().add_pass(ConvertF32ToF16Pass::new(false)).apply(&mut graph, &[y])?;
        let y_opt = result.endpoint_vars[0];
        assert_eq!(graph.fact(y_opt).datum_type, DatumType::F32);
        let cb = find_opr::<ConvBias>(&graph, y_opt).context("No ConvBias")?;
        assert_eq!(cb.op_as::<ConvBias>().map(|op| op.params.compute_mode), Some(ComputeMode::Default));
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-2)
    }

    #[test]
    fn conversions_to_f32_follow() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let ints = Tensor::from_fn(DatumType::I32, &[6], |i| i as f32 - 2.0);
        let x = graph.host_input("x", &HostTensor::new(ints))?;
        let p = graph.shared("p", random(&[6], 1))?;
        let xf = graph.type_cvt(x, DatumType::F32)?;
        let y = graph.mul(xf, p)?;
        let result = GraphOptimizer::default().add_pass(ConvertF32ToF16Pass::new(false)).apply(&mut graph, &[y])?;
        let y_opt = result.endpoint_vars[0];
        let product = graph.owner(y_opt).inputs[0];
        assert_eq!(graph.fact(product).datum_type, DatumType::F16);
        let cvt = find_opr::<TypeCvt>(&graph, product).context("No TypeCvt")?;
        assert_eq!(cvt.op_as::<TypeCvt>().map(|op| op.to), Some(DatumType::F16));
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-2)
    }
}
