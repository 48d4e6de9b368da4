use crate::internal::*;
use crate::ops::konst::{MultiTensorHolder, SharedTensor};

/// Gathers the [`SharedTensor`] parameters of each comp node in a single
/// [`MultiTensorHolder`], one output per parameter.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamMergePass;

impl Pass for ParamMergePass {
    fn name(&self) -> &'static str {
        "param_merge"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        let mut groups: Vec<(CompNode, Vec<(VarId, Arc<Tensor>)>)> = vec![];
        for id in eval_order(state.graph(), state.endpoints()) {
            let opr = state.graph().opr(id);
            let Some(shared) = opr.op_as::<SharedTensor>() else { continue };
            let param = (opr.outputs[0], shared.0.clone());
            match groups.iter_mut().find(|(cn, _)| *cn == opr.comp_node) {
                Some((_, params)) => params.push(param),
                None => groups.push((opr.comp_node, vec![param])),
            }
        }
        for (cn, params) in groups {
            let holder = MultiTensorHolder(params.iter().map(|(_, t)| t.clone()).collect());
            let name = format!("merged_params_{cn}");
            let opr = state.graph_mut().insert_opr_on(Some(cn), name, holder, &[])?;
            debug!("Merged {} parameters on {}", params.len(), cn);
            let outputs = state.graph().opr(opr).outputs.clone();
            for ((var, _), merged) in params.iter().zip(outputs) {
                state.replace_var(*var, merged, "merged parameter")?;
            }
        }
        Rewriter::default().rewrite(state)
    }
}
