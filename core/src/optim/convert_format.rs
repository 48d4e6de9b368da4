use crate::internal::*;
use crate::ops::array::Concat;
use crate::ops::cast::TypeCvt;
use crate::ops::cnn::{ConvBias, Convolution, Pooling, group_weight_shape};
use crate::ops::copy;
use crate::ops::element_wise::Elemwise;
use crate::ops::relayout::RelayoutFormat;

/// Moves convolution-heavy regions of the graph to a packed tensor format.
///
/// Convolutions, pooling and concatenations run natively in the target
/// format. Element-wise operators, type conversions and copies follow their
/// operands. Any other operator gets its inputs back in default layout, and
/// so do the endpoints. Weights and biases stay in logical layout, the
/// input channels of weights being zero-padded to the block size.
#[derive(Debug, Clone, Copy, new)]
pub struct ConvertFormatPass {
    target: TensorFormat,
}

/// Logical channel count of a 4D var, whatever its layout.
fn logical_channels(graph: &ComputingGraph, var: VarId) -> Option<usize> {
    let fact = graph.fact(var);
    let shape = fact.shape.as_ref()?;
    if fact.format.is_default() {
        return (shape.len() == 4).then(|| shape[1]);
    }
    let owner = graph.owner(var);
    if let Some(relayout) = owner.op_as::<RelayoutFormat>() {
        return Some(relayout.channels);
    }
    if owner.op_is::<Convolution>() || owner.op_is::<ConvBias>() {
        let [g, ocg, ..] = group_weight_shape(graph.fact(owner.inputs[1]).shape.as_ref()?).ok()?;
        return Some(g * ocg);
    }
    if let Some(concat) = owner.op_as::<Concat>() {
        if concat.axis == 1 {
            return owner.inputs.iter().map(|i| logical_channels(graph, *i)).sum();
        }
    }
    owner
        .inputs
        .iter()
        .filter(|i| {
            let f = graph.fact(**i);
            f.format == fact.format && !f.is_scalar_like()
        })
        .find_map(|i| logical_channels(graph, *i))
        .or_else(|| fact.format.padded_logical_shape(shape).ok().map(|s| s[1]))
}

/// `var` in `format`, reusing the source of a relayout when converting back.
fn to_format(graph: &mut ComputingGraph, var: VarId, format: TensorFormat) -> GraftResult<VarId> {
    let fact = graph.fact(var);
    if fact.format == format {
        return Ok(var);
    }
    let src = fact.format;
    let owner = graph.owner(var);
    if let Some(relayout) = owner.op_as::<RelayoutFormat>() {
        if relayout.src == format && relayout.dst == src {
            return Ok(owner.inputs[0]);
        }
    }
    let channels = logical_channels(graph, var)
        .with_context(|| format!("Unknown channel count of {}", graph.var(var)))?;
    graph.relayout(var, src, format, channels)
}

fn is_4d(graph: &ComputingGraph, var: VarId) -> bool {
    graph.fact(var).rank() == Some(4) || !graph.fact(var).format.is_default()
}

fn reinsert(
    state: &mut OptState,
    node: &OperatorNode,
    op: impl Into<Box<dyn Op>>,
    inputs: &[VarId],
) -> GraftResult<TVec<VarId>> {
    let opr = state.graph_mut().insert_opr_on(Some(node.comp_node), "", op, inputs)?;
    Ok(state.graph().opr(opr).outputs.clone())
}

impl ConvertFormatPass {
    /// Weights accepting the padded channels of an input in the target format.
    fn pad_weights(&self, graph: &mut ComputingGraph, w: VarId, ic: usize) -> GraftResult<Option<VarId>> {
        let shape: TVec<usize> = graph.fact(w).shape()?.into();
        let p = self.target.pack();
        if shape.len() == 5 {
            let [_, ocg, icg, ..] = group_weight_shape(&shape)?;
            return Ok((icg % p == 0 && ocg % p == 0).then_some(w));
        }
        let padded = self.target.padded_channels(ic);
        if padded == ic {
            return Ok(Some(w));
        }
        let dt = graph.fact(w).datum_type;
        let zeros = graph.immutable("", Tensor::zero(dt, &[shape[0], padded - ic, shape[2], shape[3]]))?;
        Ok(Some(graph.concat(&[w, zeros], 1)?))
    }

    /// Data and weights of a convolution running in the target format.
    fn conv_inputs(&self, state: &mut OptState, x: VarId, w: VarId) -> GraftResult<Option<(VarId, VarId)>> {
        let graph = state.graph_mut();
        if !is_4d(graph, x) || graph.fact(w).shape.is_none() {
            return Ok(None);
        }
        let Some(ic) = logical_channels(graph, x) else { return Ok(None) };
        let Some(w) = self.pad_weights(graph, w, ic)? else { return Ok(None) };
        Ok(Some((to_format(graph, x, self.target)?, w)))
    }
}

impl Pass for ConvertFormatPass {
    fn name(&self) -> &'static str {
        "convert_format"
    }

    fn layout_target(&self) -> Option<TensorFormat> {
        Some(self.target)
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        if self.target.is_default() {
            return Ok(());
        }
        state.set_relaxed_checks(true);
        let this = *self;
        let fmt = self.target;
        Rewriter::default()
            .with_rule_for::<Convolution>("format_conv", move |state, node, conv, inputs| {
                if !conv.params.format.is_default() {
                    return Ok(None);
                }
                let Some((x, w)) = this.conv_inputs(state, inputs[0], inputs[1])? else { return Ok(None) };
                Ok(Some(reinsert(state, node, Convolution::new(conv.params.with_format(fmt)), &[x, w])?))
            })
            .with_rule_for::<ConvBias>("format_conv_bias", move |state, node, cb, inputs| {
                if !cb.params.format.is_default() {
                    return Ok(None);
                }
                let Some((x, w)) = this.conv_inputs(state, inputs[0], inputs[1])? else { return Ok(None) };
                let mut packed: TVec<VarId> = tvec!(x, w, inputs[2]);
                if let Some(z) = inputs.get(3) {
                    packed.push(to_format(state.graph_mut(), *z, fmt)?);
                }
                let op = ConvBias::new(cb.params.with_format(fmt), cb.nonline);
                Ok(Some(reinsert(state, node, op, &packed)?))
            })
            .with_rule_for::<Pooling>("format_pooling", move |state, node, pool, inputs| {
                if !pool.format.is_default() || !is_4d(state.graph(), inputs[0]) {
                    return Ok(None);
                }
                let x = to_format(state.graph_mut(), inputs[0], fmt)?;
                Ok(Some(reinsert(state, node, pool.with_format(fmt), &[x])?))
            })
            .with_rule_for::<Concat>("format_concat", move |state, node, concat, inputs| {
                let graph = state.graph();
                if !concat.format.is_default() || !inputs.iter().any(|i| graph.fact(*i).format == fmt) {
                    return Ok(None);
                }
                if !inputs.iter().all(|i| is_4d(graph, *i)) {
                    return Ok(None);
                }
                let aligned = inputs
                    .iter()
                    .all(|i| logical_channels(graph, *i).is_some_and(|c| c % fmt.pack() == 0));
                if concat.axis == 1 && !aligned {
                    return Ok(None);
                }
                let packed =
                    inputs.iter().map(|i| to_format(state.graph_mut(), *i, fmt)).collect::<GraftResult<TVec<_>>>()?;
                Ok(Some(reinsert(state, node, concat.with_format(fmt), &packed)?))
            })
            .with_rule_for::<Elemwise>("format_elemwise", move |state, node, op, inputs| {
                let graph = state.graph();
                let Some(first) = inputs.iter().find(|i| graph.fact(**i).format == fmt) else { return Ok(None) };
                let channels = logical_channels(graph, *first);
                let compatible = inputs.iter().all(|i| {
                    let f = graph.fact(*i);
                    f.format == fmt
                        || f.is_scalar_like()
                        || (f.rank() == Some(4) && f.format.is_default() && logical_channels(graph, *i) == channels)
                });
                if !compatible {
                    return Ok(None);
                }
                let packed = inputs
                    .iter()
                    .map(|i| {
                        if state.graph().fact(*i).is_scalar_like() {
                            Ok(*i)
                        } else {
                            to_format(state.graph_mut(), *i, fmt)
                        }
                    })
                    .collect::<GraftResult<TVec<_>>>()?;
                Ok(Some(reinsert(state, node, op.clone(), &packed)?))
            })
            .with_fallback("default_layout_inputs", |state, node, inputs| {
                if node.op_is::<TypeCvt>() || node.op_is::<copy::Copy>() {
                    return Ok(None);
                }
                let graph = state.graph();
                let changed = node
                    .inputs
                    .iter()
                    .zip(inputs)
                    .any(|(old, new)| graph.fact(*old).format != graph.fact(*new).format);
                if !changed {
                    return Ok(None);
                }
                let mut restored = tvec!();
                for (old, new) in node.inputs.iter().zip(inputs) {
                    let format = state.graph().fact(*old).format;
                    restored.push(to_format(state.graph_mut(), *new, format)?);
                }
                Ok(Some(reinsert(state, node, node.op.clone(), &restored)?))
            })
            .rewrite(state)?;
        for ep in state.endpoints().to_vec() {
            let new = state.get_var_replace(ep);
            let format = state.graph().fact(ep).format;
            if state.graph().fact(new).format != format {
                let back = to_format(state.graph_mut(), new, format)?;
                state.replace_var(ep, back, "endpoint layout")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::array::{AxisDesc, Reshape};
    use crate::ops::cnn::{ConvParams, PoolMode};
    use crate::optim::param_fuse::ParamFusePass;
    use crate::optim::test_utils::{random, run};

    fn optimize(graph: &mut ComputingGraph, target: TensorFormat, endpoints: &[VarId]) -> GraftResult<Vec<VarId>> {
        let result = GraphOptimizer::default()
            .add_pass(ConvertFormatPass::new(target))
            .add_pass(ParamFusePass)
            .apply(graph, endpoints)?;
        Ok(result.endpoint_vars)
    }

    fn conv_format(graph: &ComputingGraph, var: VarId) -> Option<TensorFormat> {
        find_opr::<Convolution>(graph, var).and_then(|o| o.op_as::<Convolution>()).map(|c| c.params.format)
    }

    #[test]
    fn nhwcd4_convolutions() -> GraftResult<()> {
        crate::setup_test_logger();
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = graph.host_input("x", &HostTensor::new(random(&[8, 8, 8, 8], 1)))?;
        let w1 = graph.shared("w1", random(&[4, 8, 3, 3], 2))?;
        let conv = graph.conv(x, w1, ConvParams::default())?;
        let b = graph.host_input("b", &HostTensor::new(random(&[1, 4, 1, 1], 3)))?;
        let biased = graph.add(conv, b)?;
        let elem = graph.relu(biased)?;
        let pool = Pooling {
            mode: PoolMode::Max,
            window: [2, 2],
            stride: [1, 1],
            padding: [0, 0],
            format: TensorFormat::Default,
        };
        let pooled = graph.pooling(elem, pool)?;
        let w2 = graph.shared("w2", random(&[4, 4, 3, 3], 4))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y = graph.conv(pooled, w2, params)?;
        let z = graph.axis_add_remove(y, &[AxisDesc::Add(0)])?;
        let [y_opt, z_opt] = optimize(&mut graph, TensorFormat::Nhwcd4, &[y, z])?[..] else {
            bail!("two endpoints expected")
        };
        assert_eq!(conv_format(&graph, y_opt), Some(TensorFormat::Nhwcd4));
        assert_eq!(graph.fact(y_opt).format, TensorFormat::Default);
        let axis_add = graph.owner(z_opt);
        let input = graph.fact(axis_add.inputs[0]);
        assert!(input.format.is_default());
        assert_eq!(input.rank(), Some(4));
        let values = run(&mut graph, &[y, y_opt, z, z_opt])?;
        values[0].close_enough(&values[1], 1e-3)?;
        values[2].close_enough(&values[3], 1e-3)
    }

    #[test]
    fn nchw4_pads_input_channels() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = graph.host_input("x", &HostTensor::new(random(&[2, 3, 8, 8], 1)))?;
        let w = graph.shared("w", random(&[8, 3, 3, 3], 2))?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y = graph.conv(x, w, params)?;
        let y = graph.add(y, b)?;
        let y = graph.mul_scalar(y, 2.0)?;
        let y_opt = optimize(&mut graph, TensorFormat::Nchw4, &[y])?[0];
        let conv = find_opr::<Convolution>(&graph, y_opt).context("No convolution")?;
        assert_eq!(conv.op_as::<Convolution>().map(|c| c.params.format), Some(TensorFormat::Nchw4));
        assert_eq!(graph.fact(conv.inputs[1]).shape()?, &[8, 4, 3, 3]);
        assert_eq!(graph.fact(y_opt).shape()?, &[2, 8, 8, 8]);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn mismatched_operands_fall_back() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = graph.host_input("x", &HostTensor::new(random(&[1, 4, 6, 6], 1)))?;
        let w = graph.shared("w", random(&[4, 4, 1, 1], 2))?;
        let mask = graph.host_input("mask", &HostTensor::new(random(&[1, 1, 6, 6], 3)))?;
        let conv = graph.conv(x, w, ConvParams::default())?;
        let y = graph.mul(conv, mask)?;
        let y_opt = optimize(&mut graph, TensorFormat::Nchw4, &[y])?[0];
        let product = graph.owner(y_opt);
        assert!(product.inputs.iter().all(|i| graph.fact(*i).format.is_default()));
        assert_eq!(conv_format(&graph, y_opt), Some(TensorFormat::Nchw4));
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn concat_bypass() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let inp1 = graph.host_input("inp1", &HostTensor::new(random(&[1, 6, 16, 16], 1)))?;
        let inp2 = graph.host_input("inp2", &HostTensor::new(random(&[1, 6, 16, 16], 2)))?;
        let w1 = graph.shared("w1", random(&[12, 12, 3, 3], 3))?;
        let w2 = graph.shared("w2", random(&[12, 24, 3, 3], 4))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        // misaligned channels: stays in default layout
        let concat = graph.concat(&[inp2, inp1], 1)?;
        let y = graph.conv(concat, w1, params.clone())?;
        let y = graph.concat(&[y, y], 0)?;
        let y = graph.conv(y, w1, params.clone())?;
        let y = graph.concat(&[y, y], 1)?;
        let y = graph.conv(y, w2, params.clone())?;
        let y = graph.concat(&[y, y], 2)?;
        let y = graph.conv(y, w1, params)?;
        let y_opt = optimize(&mut graph, TensorFormat::Nhwcd4, &[y])?[0];
        assert_eq!(conv_format(&graph, y_opt), Some(TensorFormat::Nhwcd4));

        let (spec, _) = callback_copy(y_opt);
        let exe = graph.compile(vec![spec])?;
        let relayouts = exe
            .iter_oprs_seq()
            .filter(|opr| opr.op_is::<Convolution>())
            .flat_map(|opr| opr.inputs.iter())
            .filter(|input| graph.owner(**input).op_is::<RelayoutFormat>())
            .count();
        assert_eq!(relayouts, 1);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-3)
    }

    #[test]
    fn shape_readers_see_default_layout() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = graph.host_input("x", &HostTensor::new(random(&[2, 4, 5, 5], 1)))?;
        let w = graph.shared("w", random(&[4, 4, 3, 3], 2))?;
        let conv = graph.conv(x, w, ConvParams::default())?;
        let y = graph.reshape_to(conv, &[2, 36])?;
        let y_opt = optimize(&mut graph, TensorFormat::Nchw88, &[y])?[0];
        let reshape = find_opr::<Reshape>(&graph, y_opt).context("No reshape")?;
        assert!(graph.fact(reshape.inputs[0]).format.is_default());
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }
}
