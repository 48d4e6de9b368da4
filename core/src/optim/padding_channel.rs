use crate::internal::*;
use crate::ops::array::Concat;
use crate::ops::cast::TypeCvt;
use crate::ops::cnn::{ConvBias, ConvParams, Convolution, NonlineMode, Pooling};
use crate::ops::copy;
use crate::ops::element_wise::Elemwise;

/// Pads the channels of dense convolutions to a multiple of `width`, in
/// default layout.
///
/// Output channels are padded through zero weights and biases, and input
/// channels of the convolutions reading them through zero weights, so that
/// padded channels never contribute to real ones. Pooling, element-wise
/// operators, type conversions and copies carry padded channels along;
/// any other reader, and every endpoint, gets a `Subtensor` of the real
/// channels.
#[derive(Debug, Clone, Copy, new)]
pub struct PaddingChannelPass {
    width: usize,
}

/// Channels of a 4D default layout var.
fn channels(graph: &ComputingGraph, var: VarId) -> Option<usize> {
    let fact = graph.fact(var);
    match &fact.shape {
        Some(s) if s.len() == 4 && fact.format.is_default() => Some(s[1]),
        _ => None,
    }
}

/// True if the replacement `new` of `old` carries padded channels.
fn is_padded(graph: &ComputingGraph, old: VarId, new: VarId) -> bool {
    matches!((channels(graph, old), channels(graph, new)), (Some(o), Some(n)) if n > o)
}

/// `var` with `extra` zero channels appended.
fn pad_axis(graph: &mut ComputingGraph, var: VarId, axis: usize, extra: usize) -> GraftResult<VarId> {
    if extra == 0 {
        return Ok(var);
    }
    let fact = graph.fact(var);
    let mut shape: TVec<usize> = fact.shape()?.into();
    shape[axis] = extra;
    let zeros = graph.immutable("", Tensor::zero(fact.datum_type, &shape))?;
    graph.concat(&[var, zeros], axis)
}

impl PaddingChannelPass {
    fn padded(&self, c: usize) -> usize {
        c.div_ceil(self.width) * self.width
    }

    /// Rebuilds a dense convolution with padded channels, or `None` if
    /// nothing needs padding.
    fn pad_conv(
        &self,
        state: &mut OptState,
        node: &OperatorNode,
        params: &ConvParams,
        nonline: Option<NonlineMode>,
        inputs: &[VarId],
    ) -> GraftResult<Option<TVec<VarId>>> {
        let graph = state.graph_mut();
        let w_shape: TVec<usize> = match &graph.fact(inputs[1]).shape {
            Some(s) if s.len() == 4 => s.clone(),
            _ => return Ok(None),
        };
        let Some(ic) = channels(graph, node.inputs[0]) else { return Ok(None) };
        let Some(ic_now) = channels(graph, inputs[0]) else { return Ok(None) };
        if inputs[2..].iter().any(|v| graph.fact(*v).rank() != Some(4)) {
            return Ok(None);
        }
        let oc = w_shape[0];
        let (ic_padded, oc_padded) = (self.padded(ic_now), self.padded(oc));
        if ic_now == ic && ic_padded == ic && oc_padded == oc {
            return Ok(None);
        }
        let x = pad_axis(graph, inputs[0], 1, ic_padded - ic_now)?;
        let w = pad_axis(graph, inputs[1], 1, ic_padded - w_shape[1])?;
        let w = pad_axis(graph, w, 0, oc_padded - oc)?;
        let Some(nonline) = nonline else {
            return Ok(Some(graph.wire_node(node.name.clone(), Convolution::new(params.clone()), &[x, w])?));
        };
        let mut padded = tvec!(x, w, pad_axis(graph, inputs[2], 1, oc_padded - oc)?);
        if let Some(z) = inputs.get(3) {
            padded.push(pad_axis(graph, *z, 1, oc_padded - oc)?);
        }
        let op = ConvBias::new(params.clone(), nonline);
        Ok(Some(graph.wire_node(node.name.clone(), op, &padded)?))
    }

    /// True if `node` computes each channel from the same channel of its
    /// inputs, so that it can run on the replaced `inputs`.
    fn carries_padding(graph: &ComputingGraph, node: &OperatorNode, inputs: &[VarId]) -> bool {
        if let Some(pool) = node.op_as::<Pooling>() {
            return pool.format.is_default();
        }
        if node.op_is::<TypeCvt>() || node.op_is::<copy::Copy>() {
            return true;
        }
        let channel_wise = node.op_is::<Elemwise>() || node.op_as::<Concat>().is_some_and(|c| c.axis != 1);
        if !channel_wise {
            return false;
        }
        // every operand is padded the same way, or broadcasts over channels
        let operands = node.inputs.iter().zip(inputs).filter(|(old, _)| !graph.fact(**old).is_scalar_like());
        let mut padded = None;
        for (old, new) in operands {
            if !is_padded(graph, *old, *new) || padded.is_some_and(|c| Some(c) != channels(graph, *new)) {
                return false;
            }
            padded = channels(graph, *new);
        }
        true
    }
}

impl Pass for PaddingChannelPass {
    fn name(&self) -> &'static str {
        "padding_channel"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        ensure!(self.width > 0, "Channel padding width must be positive");
        state.set_relaxed_checks(true);
        let this = *self;
        Rewriter::default()
            .with_rule_for::<Convolution>("pad_conv", move |state, node, conv, inputs| {
                if !conv.params.format.is_default() {
                    return Ok(None);
                }
                this.pad_conv(state, node, &conv.params, None, inputs)
            })
            .with_rule_for::<ConvBias>("pad_conv_bias", move |state, node, cb, inputs| {
                if !cb.params.format.is_default() {
                    return Ok(None);
                }
                this.pad_conv(state, node, &cb.params, Some(cb.nonline), inputs)
            })
            .with_fallback("truncate_padded_inputs", |state, node, inputs| {
                let graph = state.graph();
                let padded = node.inputs.iter().zip(inputs).any(|(old, new)| is_padded(graph, *old, *new));
                if !padded || Self::carries_padding(graph, node, inputs) {
                    return Ok(None);
                }
                let mut truncated = tvec!();
                for (old, new) in node.inputs.iter().zip(inputs) {
                    let graph = state.graph_mut();
                    truncated.push(match channels(graph, *old) {
                        Some(c) if is_padded(graph, *old, *new) => graph.subtensor(*new, 1, 0, c)?,
                        _ => *new,
                    });
                }
                let opr = state.graph_mut().insert_opr_on(Some(node.comp_node), "", node.op.clone(), &truncated)?;
                Ok(Some(state.graph().opr(opr).outputs.clone()))
            })
            .rewrite(state)?;
        for ep in state.endpoints().to_vec() {
            let new = state.get_var_replace(ep);
            let graph = state.graph_mut();
            if let Some(c) = channels(graph, ep).filter(|_| is_padded(graph, ep, new)) {
                let truncated = graph.subtensor(new, 1, 0, c)?;
                state.replace_var(ep, truncated, "truncated channels")?;
            }
        }
        Ok(())
    }
}
