use crate::internal::*;
use crate::ops::element_wise::{BinaryMode, Elemwise};

/// Which leaves of an arithmetic chain count as constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstVarType {
    /// Values known to static inference only.
    Immutable,
    /// Also values computed from parameters.
    ImmutableAndParam,
}

/// Regroups the constant leaves of `Add` and `Mul` chains, so that they can
/// be folded to a single leaf.
///
/// A chain is a maximal tree of operators of the same mode whose inner
/// results have no other reader. Its leaves are rebuilt as the runtime
/// leaves, in their original order, combined with the constant leaves last.
#[derive(Debug, Clone, new)]
pub struct ReorderArithChainPass {
    const_type: ConstVarType,
}

impl ReorderArithChainPass {
    fn is_const(&self, state: &mut OptState, var: VarId) -> bool {
        match self.const_type {
            ConstVarType::Immutable => state.graph().var(var).static_value.is_some(),
            ConstVarType::ImmutableAndParam => state.is_const(var),
        }
    }

    fn chain_mode(opr: &OperatorNode) -> Option<BinaryMode> {
        opr.op_as::<Elemwise>()
            .and_then(|e| e.binary_mode())
            .filter(|m| matches!(m, BinaryMode::Add | BinaryMode::Mul))
    }

    /// Operators whose output only feeds a chain operator of the same mode.
    fn inner_oprs(state: &OptState) -> HashSet<OprId> {
        let graph = state.graph();
        let mut inner = HashSet::new();
        for id in eval_order(graph, state.endpoints()) {
            let reader = graph.opr(id);
            let Some(mode) = Self::chain_mode(reader) else { continue };
            for input in &reader.inputs {
                let owner = graph.owner(*input);
                if Self::chain_mode(owner) == Some(mode)
                    && state.nr_readers(*input) == 1
                    && !state.endpoints().contains(input)
                {
                    inner.insert(owner.id);
                }
            }
        }
        inner
    }

    fn rebuild(
        &self,
        state: &mut OptState,
        node: &OperatorNode,
        mode: BinaryMode,
    ) -> GraftResult<Option<TVec<VarId>>> {
        let root = node.id;
        let leaves = {
            let state_ref: &OptState = state;
            extract_opr_leaves(state_ref.graph(), node.outputs[0], |opr| {
                Self::chain_mode(opr) == Some(mode)
                    && (opr.id == root || state_ref.nr_readers(opr.outputs[0]) == 1)
            })
        };
        let leaves = leaves.into_iter().map(|v| state.get_var_replace(v)).collect_vec();
        let (mut konst, mut runtime) = (vec![], vec![]);
        for leaf in leaves {
            if self.is_const(state, leaf) {
                konst.push(leaf)
            } else {
                runtime.push(leaf)
            }
        }
        if konst.len() < 2 {
            return Ok(None);
        }
        let graph = state.graph_mut();
        let combine = |graph: &mut ComputingGraph, vars: &[VarId]| -> GraftResult<Option<VarId>> {
            let Some((first, rest)) = vars.split_first() else { return Ok(None) };
            let mut acc = *first;
            for v in rest {
                acc = graph.binary(mode, acc, *v)?;
            }
            Ok(Some(acc))
        };
        let konst = combine(graph, &konst)?.context("No constant leaf")?;
        let result = match combine(graph, &runtime)? {
            Some(runtime) => graph.binary(mode, runtime, konst)?,
            None => konst,
        };
        Ok(Some(tvec!(result)))
    }
}

impl Pass for ReorderArithChainPass {
    fn name(&self) -> &'static str {
        "reorder_arith_chain"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        let this = self.clone();
        let inner = Self::inner_oprs(state);
        Rewriter::default()
            .with_rule_for::<Elemwise>("reorder_arith_chain", move |state, node, _op, _inputs| {
                let Some(mode) = Self::chain_mode(node) else { return Ok(None) };
                if inner.contains(&node.id) {
                    return Ok(None);
                }
                this.rebuild(state, node, mode)
            })
            .rewrite(state)
    }
}
