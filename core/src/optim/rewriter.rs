use std::any::TypeId;

use crate::internal::*;

type RewriteRule = Box<
    dyn Fn(&mut OptState, &OperatorNode, &[VarId]) -> GraftResult<Option<TVec<VarId>>> + Send + Sync,
>;

/// Walks the operators reachable from the endpoints of an [`OptState`] in
/// dependency order, and rebuilds them on top of replaced inputs.
///
/// Rules are looked up by operator type. A rule gets the original operator
/// and its inputs after replacement, and may return new outputs. When no
/// rule applies, an operator whose inputs changed is inserted again with the
/// same parameters.
#[derive(Default)]
pub struct Rewriter {
    rules: HashMap<TypeId, Vec<(Cow<'static, str>, RewriteRule)>>,
    fallback: Option<(Cow<'static, str>, RewriteRule)>,
}

impl fmt::Debug for Rewriter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let names = self.rules.values().flatten().chain(self.fallback.iter()).map(|(name, _)| name).collect_vec();
        f.debug_struct("Rewriter").field("rules", &names).finish()
    }
}

impl Rewriter {
    pub fn with_rule_for<O: Op>(
        mut self,
        name: impl Into<Cow<'static, str>>,
        rule: impl Fn(&mut OptState, &OperatorNode, &O, &[VarId]) -> GraftResult<Option<TVec<VarId>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.rules.entry(TypeId::of::<O>()).or_default().push((
            name.into(),
            Box::new(move |state: &mut OptState, node: &OperatorNode, inputs: &[VarId]| {
                let Some(op) = node.op_as::<O>() else { return Ok(None) };
                rule(state, node, op, inputs)
            }),
        ));
        self
    }

    /// Rule tried on every operator after its typed rules declined.
    pub fn with_fallback(
        mut self,
        name: impl Into<Cow<'static, str>>,
        rule: impl Fn(&mut OptState, &OperatorNode, &[VarId]) -> GraftResult<Option<TVec<VarId>>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.fallback = Some((name.into(), Box::new(rule)));
        self
    }

    pub fn rewrite(&self, state: &mut OptState) -> GraftResult<()> {
        let order = eval_order(state.graph(), state.endpoints());
        for id in order {
            let node = state.graph().opr(id).clone();
            if node.outputs.iter().all(|o| state.is_replaced(*o)) && !node.outputs.is_empty() {
                continue;
            }
            let inputs: TVec<VarId> = node.inputs.iter().map(|i| state.get_var_replace(*i)).collect();
            let mut outputs = None;
            let typed = self.rules.get(&node.op().as_any().type_id()).into_iter().flatten();
            for (name, rule) in typed.chain(self.fallback.iter()) {
                if let Some(new) = rule(state, &node, &inputs)
                    .with_context(|| format!("Evaluating rewriting rule \"{name}\" on {node}"))?
                {
                    ensure!(
                        new.len() == node.outputs.len(),
                        "Rule \"{}\" produced {} outputs for {}",
                        name,
                        new.len(),
                        node
                    );
                    outputs = Some((name.clone(), new));
                    break;
                }
            }
            let (reason, new) = match outputs {
                Some(found) => found,
                None if inputs != node.inputs => {
                    let opr = state.graph_mut().insert_opr_on(
                        Some(node.comp_node),
                        node.name.clone(),
                        node.op.clone(),
                        &inputs,
                    )?;
                    ("inputs replaced".into(), state.graph().opr(opr).outputs.clone())
                }
                None => continue,
            };
            for (old, new) in node.outputs.iter().zip(new) {
                state
                    .replace_var(*old, new, &reason)
                    .with_context(|| format!("Applying rule \"{reason}\" on {node}"))?;
            }
        }
        Ok(())
    }
}
