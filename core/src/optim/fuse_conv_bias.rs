use crate::internal::*;
use crate::ops::cnn::{ConvBias, ConvParams, Convolution, NonlineMode, group_weight_shape};
use crate::ops::element_wise::{BinaryMode, Elemwise};
use crate::ops::relayout::RelayoutFormat;

/// Fuses a convolution with the bias added to it and the nonlinearity
/// applied after it into a single [`ConvBias`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseConvBiasNonlinPass;

/// Fuses the element-wise addition of a same-shaped tensor to a
/// [`ConvBias`] as its fourth (z) operand.
#[derive(Debug, Default, Clone, Copy)]
pub struct FuseConvBiasZPass;

/// Logical output channels of a convolution with these weights.
fn output_channels(graph: &ComputingGraph, w: VarId) -> GraftResult<usize> {
    let [g, ocg, ..] = group_weight_shape(graph.fact(w).shape()?)?;
    Ok(g * ocg)
}

fn conv_operands(state: &OptState, var: VarId) -> Option<(ConvParams, VarId, VarId)> {
    if state.nr_readers(var) != 1 || state.endpoints().contains(&var) {
        return None;
    }
    let owner = state.graph().owner(var);
    let conv = owner.op_as::<Convolution>()?;
    Some((conv.params.clone(), owner.inputs[0], owner.inputs[1]))
}

/// The bias of a convolution output, in logical layout.
fn as_bias(graph: &ComputingGraph, conv_out: VarId, oc: usize, b: VarId) -> GraftResult<Option<VarId>> {
    let out = graph.fact(conv_out);
    let owner = graph.owner(b);
    let b = match owner.op_as::<RelayoutFormat>() {
        Some(r) if r.src.is_default() && r.dst == out.format => owner.inputs[0],
        _ if graph.fact(b).format.is_default() && out.format.is_default() => b,
        _ => return Ok(None),
    };
    let fact = graph.fact(b);
    let (Some(shape), Some(out_shape)) = (&fact.shape, &out.shape) else { return Ok(None) };
    if fact.datum_type != out.datum_type {
        return Ok(None);
    }
    let mut logical = out.format.padded_logical_shape(out_shape)?;
    logical[1] = oc;
    Ok(ConvBias::check_bias(&logical, shape).is_ok().then_some(b))
}

/// Folds a unary nonlinearity into the [`ConvBias`] producing its input.
fn fuse_nonlinearity(
    state: &mut OptState,
    op: &Elemwise,
    inputs: &[VarId],
    with_z: bool,
) -> GraftResult<Option<TVec<VarId>>> {
    let Some(nonline) = op.unary_mode().and_then(NonlineMode::from_unary) else { return Ok(None) };
    let x = inputs[0];
    if state.nr_readers(x) != 1 || state.endpoints().contains(&x) {
        return Ok(None);
    }
    let owner = state.graph().owner(x).clone();
    if let Some(cb) = owner.op_as::<ConvBias>() {
        if cb.nonline != NonlineMode::Identity || (owner.inputs.len() == 4) != with_z {
            return Ok(None);
        }
        let op = ConvBias::new(cb.params.clone(), nonline);
        let fused = state.graph_mut().wire_node("", op, &owner.inputs)?;
        return Ok(Some(fused));
    }
    if with_z {
        return Ok(None);
    }
    let Some((params, x, w)) = conv_operands(state, x) else { return Ok(None) };
    let graph = state.graph_mut();
    let oc = output_channels(graph, w)?;
    let dt = graph.fact(x).datum_type;
    let zero = graph.immutable("", Tensor::zero(dt, &[1, oc, 1, 1]))?;
    Ok(Some(tvec!(graph.conv_bias(x, w, zero, params, nonline)?)))
}

impl Pass for FuseConvBiasNonlinPass {
    fn name(&self) -> &'static str {
        "fuse_conv_bias_nonlinearity"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        Rewriter::default()
            .with_rule_for::<Elemwise>("fuse_conv_bias", |state, _node, op, inputs| {
                if !op.is_binary(BinaryMode::Add) {
                    return Ok(None);
                }
                for (c, b) in [(inputs[0], inputs[1]), (inputs[1], inputs[0])] {
                    let Some((params, x, w)) = conv_operands(state, c) else { continue };
                    let oc = output_channels(state.graph(), w)?;
                    if let Some(b) = as_bias(state.graph(), c, oc, b)? {
                        let fused = state.graph_mut().conv_bias(x, w, b, params, NonlineMode::Identity)?;
                        return Ok(Some(tvec!(fused)));
                    }
                }
                Ok(None)
            })
            .with_rule_for::<Elemwise>("fuse_nonlinearity", |state, _node, op, inputs| {
                fuse_nonlinearity(state, op, inputs, false)
            })
            .rewrite(state)
    }
}

impl Pass for FuseConvBiasZPass {
    fn name(&self) -> &'static str {
        "fuse_conv_bias_with_z"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        Rewriter::default()
            .with_rule_for::<Elemwise>("fuse_z", |state, _node, op, inputs| {
                if !op.is_binary(BinaryMode::Add) {
                    return Ok(None);
                }
                for (y, z) in [(inputs[0], inputs[1]), (inputs[1], inputs[0])] {
                    if state.nr_readers(y) != 1 || state.endpoints().contains(&y) {
                        continue;
                    }
                    let graph = state.graph();
                    let owner = graph.owner(y);
                    let Some(cb) = owner.op_as::<ConvBias>() else { continue };
                    if owner.inputs.len() != 3 || cb.nonline != NonlineMode::Identity || graph.fact(z) != graph.fact(y) {
                        continue;
                    }
                    let [x, w, b] = [owner.inputs[0], owner.inputs[1], owner.inputs[2]];
                    let params = cb.params.clone();
                    let fused = state.graph_mut().conv_bias_z([x, w, b, z], params, NonlineMode::Identity)?;
                    return Ok(Some(tvec!(fused)));
                }
                Ok(None)
            })
            .with_rule_for::<Elemwise>("fuse_nonlinearity", |state, _node, op, inputs| {
                fuse_nonlinearity(state, op, inputs, true)
            })
            .rewrite(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::element_wise::UnaryMode;
    use crate::optim::test_utils::{random, run};

    fn conv_graph() -> GraftResult<(ComputingGraph, VarId, VarId)> {
        let mut graph = ComputingGraph::make();
        let x = graph.host_input("x", &HostTensor::new(random(&[2, 4, 6, 6], 1)))?;
        let w = graph.shared("w", random(&[8, 4, 3, 3], 2))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y = graph.conv(x, w, params)?;
        Ok((graph, x, y))
    }

    fn optimize(graph: &mut ComputingGraph, passes: Vec<Box<dyn Pass>>, y: VarId) -> GraftResult<VarId> {
        Ok(GraphOptimizer::from_passes(passes).apply(graph, &[y])?.endpoint_vars[0])
    }

    #[test]
    fn conv_bias_relu() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let y = graph.add(conv, b)?;
        let y0 = graph.relu(y)?;
        let y1 = optimize(&mut graph, vec![Box::new(FuseConvBiasNonlinPass)], y0)?;
        let fused = graph.owner(y1);
        let cb = fused.op_as::<ConvBias>().context("Expected a ConvBias")?;
        assert_eq!(cb.nonline, NonlineMode::Relu);
        assert_eq!(fused.inputs[2], b);
        assert_eq!(find_opr_num::<Elemwise>(&graph, y1), 0);
        let values = run(&mut graph, &[y0, y1])?;
        values[0].close_enough(&values[1], 1e-5)
    }

    #[test]
    fn lone_nonlinearity_gets_a_zero_bias() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let y0 = graph.unary(UnaryMode::HSwish, conv)?;
        let y1 = optimize(&mut graph, vec![Box::new(FuseConvBiasNonlinPass)], y0)?;
        let fused = graph.owner(y1);
        assert_eq!(fused.op_as::<ConvBias>().map(|cb| cb.nonline), Some(NonlineMode::HSwish));
        assert_eq!(graph.fact(fused.inputs[2]).shape()?, &[1, 8, 1, 1]);
        let values = run(&mut graph, &[y0, y1])?;
        values[0].close_enough(&values[1], 1e-5)
    }

    #[test]
    fn shared_conv_output_is_not_fused() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let biased = graph.add(conv, b)?;
        let y0 = graph.mul(biased, conv)?;
        let y1 = optimize(&mut graph, vec![Box::new(FuseConvBiasNonlinPass)], y0)?;
        assert_eq!(y0, y1);
        Ok(())
    }

    #[test]
    fn mismatched_bias_is_not_fused() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let b = graph.shared("b", random(&[1, 1, 6, 1], 3))?;
        let y0 = graph.add(conv, b)?;
        let y1 = optimize(&mut graph, vec![Box::new(FuseConvBiasNonlinPass)], y0)?;
        assert_eq!(y0, y1);
        Ok(())
    }

    #[test]
    fn conv_bias_with_z() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let z = graph.host_input("z", &HostTensor::new(random(&[2, 8, 6, 6], 4)))?;
        let biased = graph.add(conv, b)?;
        let y = graph.add(biased, z)?;
        let y0 = graph.relu(y)?;
        let y1 = optimize(
            &mut graph,
            vec![Box::new(FuseConvBiasNonlinPass), Box::new(FuseConvBiasZPass)],
            y0,
        )?;
        let fused = graph.owner(y1);
        assert_eq!(fused.inputs.len(), 4);
        assert_eq!(fused.inputs[3], z);
        assert_eq!(fused.op_as::<ConvBias>().map(|cb| cb.nonline), Some(NonlineMode::Relu));
        let values = run(&mut graph, &[y0, y1])?;
        values[0].close_enough(&values[1], 1e-5)
    }

    #[test]
    fn product_is_not_fused_as_z() -> GraftResult<()> {
        let (mut graph, _, conv) = conv_graph()?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let z = graph.host_input("z", &HostTensor::new(random(&[2, 8, 6, 6], 4)))?;
        let biased = graph.add(conv, b)?;
        let y0 = graph.mul(biased, z)?;
        let y1 = optimize(
            &mut graph,
            vec![Box::new(FuseConvBiasNonlinPass), Box::new(FuseConvBiasZPass)],
            y0,
        )?;
        let product = graph.owner(y1);
        assert!(product.op_is::<Elemwise>());
        let cb = graph.owner(product.inputs[0]);
        assert_eq!(cb.inputs.len(), 3);
        Ok(())
    }
}
