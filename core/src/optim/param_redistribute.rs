//! Moves constant factors and offsets into convolution weights, so that
//! they can be folded with the weights.
use crate::internal::*;
use crate::ops::cnn::{ConvParams, Convolution};
use crate::ops::element_wise::{BinaryMode, Elemwise};
use crate::ops::nn::ReduceMode;

/// Redistributes constants around convolutions and arithmetic:
///
/// * `conv(x * k, w)` becomes `conv(x, w * k)` for `k` per input channel,
/// * `conv(x + b, w)` becomes `conv(x, w) + sum(w * b)` without padding,
/// * `conv(x, w) * k` becomes `conv(x, w * k)` for `k` per output channel,
/// * `(a + b) * k` is distributed when `k` can be absorbed by a term,
/// * `(a * c1) * c2` and `(a + c1) + c2` are reassociated.
///
/// Intermediate results with more than one reader are left alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamRedistributePass;

fn binary_operands(graph: &ComputingGraph, var: VarId, mode: BinaryMode) -> Option<(VarId, VarId)> {
    let owner = graph.owner(var);
    owner.op_as::<Elemwise>().filter(|e| e.is_binary(mode)).map(|_| (owner.inputs[0], owner.inputs[1]))
}

/// Splits binary operands into (runtime, constant).
fn split_const(state: &mut OptState, a: VarId, b: VarId) -> Option<(VarId, VarId)> {
    match (state.is_const(a), state.is_const(b)) {
        (false, true) => Some((a, b)),
        (true, false) => Some((b, a)),
        _ => None,
    }
}

fn same_shape(graph: &ComputingGraph, a: VarId, b: VarId) -> bool {
    let (a, b) = (graph.fact(a), graph.fact(b));
    a.shape.is_some() && a.shape == b.shape && a.format == b.format
}

/// Constant broadcasting to every element, or per channel of a 4D tensor.
fn per_channel(graph: &ComputingGraph, k: VarId, channels: usize) -> bool {
    match &graph.fact(k).shape {
        Some(shape) => shape.iter().product::<usize>() == 1 || **shape == [1, channels, 1, 1],
        None => false,
    }
}

fn dense_conv(graph: &ComputingGraph, var: VarId) -> Option<(ConvParams, VarId, VarId, usize, usize)> {
    let owner = graph.owner(var);
    let conv = owner.op_as::<Convolution>()?;
    let w = graph.fact(owner.inputs[1]).shape.as_ref()?;
    if !conv.params.format.is_default() || w.len() != 4 {
        return None;
    }
    Some((conv.params.clone(), owner.inputs[0], owner.inputs[1], w[0], w[1]))
}

impl ParamRedistributePass {
    /// Convolution of `x` by `w`, with constants around `x` moved to the
    /// weights when possible.
    fn conv(state: &mut OptState, params: &ConvParams, x: VarId, w: VarId) -> GraftResult<VarId> {
        match Self::absorb_input(state, params, x, w)? {
            Some(y) => Ok(y),
            None => state.graph_mut().conv(x, w, params.clone()),
        }
    }

    fn absorb_input(state: &mut OptState, params: &ConvParams, x: VarId, w: VarId) -> GraftResult<Option<VarId>> {
        if state.nr_readers(x) != 1 {
            return Ok(None);
        }
        let Some(ic) = state.graph().fact(w).shape.as_ref().map(|s| s[1]) else { return Ok(None) };
        if let Some((a, b)) = binary_operands(state.graph(), x, BinaryMode::Mul) {
            if let Some((a, k)) = split_const(state, a, b) {
                if per_channel(state.graph(), k, ic) && same_shape(state.graph(), a, x) {
                    let w = state.graph_mut().mul(w, k)?;
                    return Ok(Some(Self::conv(state, params, a, w)?));
                }
            }
        }
        if let Some((a, b)) = binary_operands(state.graph(), x, BinaryMode::Add) {
            if let Some((a, b)) = split_const(state, a, b) {
                if params.padding == [0, 0] && per_channel(state.graph(), b, ic) && same_shape(state.graph(), a, x) {
                    let y = Self::conv(state, params, a, w)?;
                    let graph = state.graph_mut();
                    let oc = graph.fact(w).shape()?[0];
                    let mut offset = graph.mul(w, b)?;
                    for axis in [3, 2, 1] {
                        offset = graph.reduce(offset, ReduceMode::Sum, Some(axis))?;
                    }
                    let offset = graph.reshape_to(offset, &[1, oc, 1, 1])?;
                    return Ok(Some(graph.add(y, offset)?));
                }
            }
        }
        Ok(None)
    }

    /// `a * k` with `k` constant, when the product can be absorbed by
    /// constants or weights inside `a`.
    fn absorb_factor(state: &mut OptState, a: VarId, k: VarId) -> GraftResult<Option<VarId>> {
        if state.is_const(a) {
            return Ok(Some(state.graph_mut().mul(a, k)?));
        }
        if state.nr_readers(a) != 1 || state.graph().fact(a).shape.is_none() {
            return Ok(None);
        }
        if let Some((params, x, w, oc, _)) = dense_conv(state.graph(), a) {
            if per_channel(state.graph(), k, oc) {
                let graph = state.graph_mut();
                let k = if graph.fact(k).shape()?.iter().product::<usize>() == 1 {
                    k
                } else {
                    graph.reshape_to(k, &[oc, 1, 1, 1])?
                };
                let w = graph.mul(w, k)?;
                return Ok(Some(Self::conv(state, &params, x, w)?));
            }
        }
        if let Some((b, c)) = binary_operands(state.graph(), a, BinaryMode::Mul) {
            if let Some((b, c)) = split_const(state, b, c) {
                let k = state.graph_mut().mul(c, k)?;
                return Ok(Some(Self::mul(state, b, k)?));
            }
        }
        if let Some((b, c)) = binary_operands(state.graph(), a, BinaryMode::Add) {
            let left = Self::absorb_factor(state, b, k)?;
            let right = Self::absorb_factor(state, c, k)?;
            if left.is_none() && right.is_none() {
                return Ok(None);
            }
            let left = match left {
                Some(l) => l,
                None => state.graph_mut().mul(b, k)?,
            };
            let right = match right {
                Some(r) => r,
                None => state.graph_mut().mul(c, k)?,
            };
            return Ok(Some(state.graph_mut().add(left, right)?));
        }
        Ok(None)
    }

    fn mul(state: &mut OptState, a: VarId, k: VarId) -> GraftResult<VarId> {
        match Self::absorb_factor(state, a, k)? {
            Some(y) => Ok(y),
            None => state.graph_mut().mul(a, k),
        }
    }
}

impl Pass for ParamRedistributePass {
    fn name(&self) -> &'static str {
        "param_redistribute"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        Rewriter::default()
            .with_rule_for::<Convolution>("redistribute_conv_input", |state, _node, conv, inputs| {
                let w = state.graph().fact(inputs[1]);
                if !conv.params.format.is_default() || w.rank() != Some(4) {
                    return Ok(None);
                }
                let y = ParamRedistributePass::absorb_input(state, &conv.params, inputs[0], inputs[1])?;
                Ok(y.map(|y| tvec!(y)))
            })
            .with_rule_for::<Elemwise>("redistribute_mul", |state, node, op, inputs| {
                if !op.is_binary(BinaryMode::Mul) {
                    return Ok(None);
                }
                let Some((a, k)) = split_const(state, inputs[0], inputs[1]) else { return Ok(None) };
                if !same_shape(state.graph(), a, node.outputs[0]) {
                    return Ok(None);
                }
                Ok(ParamRedistributePass::absorb_factor(state, a, k)?.map(|y| tvec!(y)))
            })
            .with_rule_for::<Elemwise>("reassociate_add", |state, node, op, inputs| {
                if !op.is_binary(BinaryMode::Add) {
                    return Ok(None);
                }
                let Some((a, c2)) = split_const(state, inputs[0], inputs[1]) else { return Ok(None) };
                if state.nr_readers(a) != 1 || !same_shape(state.graph(), a, node.outputs[0]) {
                    return Ok(None);
                }
                let Some((b, c1)) = binary_operands(state.graph(), a, BinaryMode::Add) else { return Ok(None) };
                let Some((b, c1)) = split_const(state, b, c1) else { return Ok(None) };
                let graph = state.graph_mut();
                let c = graph.add(c1, c2)?;
                Ok(Some(tvec!(graph.add(b, c)?)))
            })
            .rewrite(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::konst::SharedTensor;
    use crate::ops::source::HostInput;
    use crate::optim::param_fuse::ParamFusePass;
    use crate::optim::reorder_arith::{ConstVarType, ReorderArithChainPass};
    use crate::optim::test_utils::{random, run};

    const N: usize = 4;
    const IC: usize = 3;
    const OC: usize = 4;

    fn input(graph: &mut ComputingGraph, name: &str, shape: &[usize], seed: usize) -> GraftResult<VarId> {
        graph.host_input(name, &HostTensor::new(random(shape, seed)))
    }

    fn per_input_channel(graph: &mut ComputingGraph, seed: usize) -> GraftResult<VarId> {
        let k = graph.shared("k", random(&[IC], seed))?;
        graph.dimshuffle(k, &[None, Some(0), None, None])
    }

    fn weights(graph: &mut ComputingGraph, ic: usize, seed: usize) -> GraftResult<VarId> {
        graph.shared("w", random(&[OC, ic, 3, 2], seed))
    }

    fn check_same(graph: &mut ComputingGraph, a: VarId, b: VarId) -> GraftResult<()> {
        let values = run(graph, &[a, b])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn conv_mul() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let k = per_input_channel(&mut graph, 2)?;
        let w = weights(&mut graph, IC, 3)?;
        let xk = graph.mul(x, k)?;
        let y0 = graph.conv(xk, w, ConvParams::default())?;
        let result = GraphOptimizer::default().add_pass(ParamRedistributePass).apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        assert_ne!(y0, y1);
        assert_eq!(graph.owner(y1).inputs[0], x);
        check_same(&mut graph, y0, y1)
    }

    #[test]
    fn conv_mul_unique_reader() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let k = graph.shared("k", random(&[IC], 2))?;
        let k = graph.add_scalar(k, 2.0)?;
        let k = graph.dimshuffle(k, &[None, Some(0), None, None])?;
        let w = graph.shared("w", random(&[IC, IC, 1, 1], 3))?;
        let xk = graph.mul(x, k)?;
        let conv = graph.conv(xk, w, ConvParams::default())?;
        let shifted = graph.add_scalar(conv, 2.0)?;
        let two = graph.scalar(DatumType::F32, 2.0)?;
        let y0 = graph.binary(BinaryMode::Pow, shifted, two)?;
        // y0k has two readers and must stay
        let y0k = graph.mul(y0, k)?;
        let y1 = graph.conv(y0k, w, ConvParams::default())?;
        let z0 = graph.div(y1, y0k)?;
        let result = GraphOptimizer::default().add_pass(ParamRedistributePass).apply(&mut graph, &[z0])?;
        let z1 = result.endpoint_vars[0];
        assert_ne!(z0, z1);
        let div = graph.owner(z1).clone();
        let conv = graph.owner(div.inputs[0]);
        assert!(conv.op_is::<Convolution>());
        assert_eq!(conv.inputs[0], div.inputs[1]);
        check_same(&mut graph, z0, z1)
    }

    #[test]
    fn mul_conv_mul() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let k1 = per_input_channel(&mut graph, 2)?;
        let k2 = graph.shared("k2", random(&[1, OC, 1, 1], 3))?;
        let w = weights(&mut graph, IC, 4)?;
        let xk = graph.mul(x, k1)?;
        let conv = graph.conv(xk, w, ConvParams::default())?;
        let y0 = graph.mul(conv, k2)?;
        let result = GraphOptimizer::default()
            .add_pass(ParamRedistributePass)
            .add_pass(ParamFusePass)
            .apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        let owner = graph.owner(y1);
        assert!(owner.op_is::<Convolution>());
        assert_eq!(owner.inputs[0], x);
        assert!(graph.owner(owner.inputs[1]).op_is::<SharedTensor>());
        check_same(&mut graph, y0, y1)
    }

    #[test]
    fn conv_add() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let b = per_input_channel(&mut graph, 2)?;
        let w = weights(&mut graph, IC, 3)?;
        let xb = graph.add(x, b)?;
        let y0 = graph.conv(xb, w, ConvParams::default())?;
        let result = GraphOptimizer::default()
            .add_pass(ParamRedistributePass)
            .add_pass(ParamFusePass)
            .apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        assert_ne!(y0, y1);
        check_same(&mut graph, y0, y1)
    }

    #[test]
    fn padded_conv_keeps_its_offset() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let b = per_input_channel(&mut graph, 2)?;
        let w = weights(&mut graph, IC, 3)?;
        let xb = graph.add(x, b)?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y0 = graph.conv(xb, w, params)?;
        let result = GraphOptimizer::default().add_pass(ParamRedistributePass).apply(&mut graph, &[y0])?;
        assert_eq!(result.endpoint_vars[0], y0);
        Ok(())
    }

    #[test]
    fn distribute_then_reassociate() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let x0 = input(&mut graph, "x0", &[N, IC, 5, 4], 1)?;
        let x1 = input(&mut graph, "x1", &[N, 6, 5, 4], 2)?;
        let k0 = per_input_channel(&mut graph, 3)?;
        let w0 = weights(&mut graph, IC, 4)?;
        let k1 = graph.shared("k1", random(&[1, 6, 1, 1], 5))?;
        let w1 = weights(&mut graph, 6, 6)?;
        let b0 = input(&mut graph, "b0", &[1, OC, 1, 1], 7)?;
        let b1 = graph.shared("b1", tensor1(&[0.5]))?;
        let k2 = graph.shared("k2", tensor1(&[1.5]))?;
        let x0k = graph.mul(x0, k0)?;
        let c0 = graph.conv(x0k, w0, ConvParams::default())?;
        let x1k = graph.add(x1, k1)?;
        let c1 = graph.conv(x1k, w1, ConvParams::default())?;
        let sum = graph.add(c0, c1)?;
        let sum = graph.add(sum, b0)?;
        let sum = graph.add(sum, b1)?;
        let y0 = graph.mul(sum, k2)?;
        let result = GraphOptimizer::default()
            .add_pass(ParamRedistributePass)
            .add_pass(ReorderArithChainPass::new(ConstVarType::ImmutableAndParam))
            .add_pass(ParamFusePass)
            .apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        assert_ne!(y0, y1);
        let chain = extract_opr_leaves(&graph, y1, |opr| {
            opr.op_as::<Elemwise>().is_some_and(|e| e.is_binary(BinaryMode::Add))
        });
        assert_eq!(chain.len(), 4);
        let convs = chain.iter().map(|v| graph.owner(*v)).filter(|o| o.op_is::<Convolution>()).collect_vec();
        assert_eq!(convs.len(), 2);
        for conv in convs {
            assert!(graph.owner(conv.inputs[0]).op_is::<HostInput>());
            assert!(graph.owner(conv.inputs[1]).op_is::<SharedTensor>());
        }
        check_same(&mut graph, y0, y1)
    }

    #[test]
    fn multi_change() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let k0 = graph.shared("k0", random(&[1, IC, 1, 1], 2))?;
        let b0 = graph.shared("b0", random(&[1, IC, 1, 1], 3))?;
        let k1 = graph.shared("k1", tensor1(&[0.75]))?;
        let b1 = graph.shared("b1", tensor1(&[0.25]))?;
        let w = weights(&mut graph, IC, 4)?;
        let xk = graph.mul(x, k0)?;
        let xkb = graph.add(xk, b0)?;
        let conv = graph.conv(xkb, w, ConvParams::default())?;
        let shifted = graph.add(conv, b1)?;
        let y0 = graph.mul(shifted, k1)?;
        let result = GraphOptimizer::default()
            .add_pass(ParamRedistributePass)
            .add_pass(ParamFusePass)
            .apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        assert_ne!(y0, y1);
        let add = graph.owner(y1);
        assert!(add.op_as::<Elemwise>().is_some_and(|e| e.is_binary(BinaryMode::Add)));
        let conv = add.inputs.iter().map(|v| graph.owner(*v)).find(|o| o.op_is::<Convolution>());
        assert_eq!(conv.context("No convolution below the sum")?.inputs[0], x);
        check_same(&mut graph, y0, y1)
    }

    #[test]
    fn multi_reader() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = input(&mut graph, "x", &[N, IC, 5, 4], 1)?;
        let k = graph.shared("k", random(&[1, OC, 1, 1], 2))?;
        let w = weights(&mut graph, IC, 3)?;
        let conv = graph.conv(x, w, ConvParams::default())?;
        let t = graph.mul(conv, k)?;
        let a = graph.mul_scalar(t, 4.2)?;
        let b = graph.mul_scalar(t, 2.4)?;
        let y0 = graph.add(a, b)?;
        let result = GraphOptimizer::default()
            .add_pass(ParamRedistributePass)
            .add_pass(ParamFusePass)
            .apply(&mut graph, &[y0])?;
        let y1 = result.endpoint_vars[0];
        assert_ne!(y0, y1);
        let add = graph.owner(y1).clone();
        assert!(add.op_as::<Elemwise>().is_some_and(|e| e.is_binary(BinaryMode::Add)));
        let is_mul = |v: VarId| graph.owner(v).op_as::<Elemwise>().is_some_and(|e| e.is_binary(BinaryMode::Mul));
        assert!(is_mul(add.inputs[0]) && is_mul(add.inputs[1]));
        let conv0 = graph.owner(add.inputs[0]).inputs[0];
        let conv1 = graph.owner(add.inputs[1]).inputs[0];
        assert_eq!(conv0, conv1);
        assert!(graph.owner(conv0).op_is::<Convolution>());
        assert_eq!(graph.owner(conv0).inputs[0], x);
        check_same(&mut graph, y0, y1)
    }
}
