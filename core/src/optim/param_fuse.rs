use super::is_const_opr;
use crate::internal::*;
use crate::ops::konst::{ImmutableTensor, SharedTensor};

/// Evaluates constant sub-expressions once, and replaces each of them by a
/// single constant operator.
///
/// Only vars where constness ends are materialized: the ones read by value
/// by a runtime operator, and constant endpoints. The new operator is an
/// [`ImmutableTensor`] if static inference knew the value, a
/// [`SharedTensor`] otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct ParamFusePass;

impl ParamFusePass {
    fn const_vars(graph: &ComputingGraph, order: &[OprId]) -> HashSet<VarId> {
        let mut konst = HashSet::new();
        for &id in order {
            let opr = graph.opr(id);
            if is_const_opr(graph, opr, |v| konst.contains(&v)) {
                konst.extend(opr.outputs.iter().copied());
            }
        }
        konst
    }

    fn boundary(
        graph: &ComputingGraph,
        order: &[OprId],
        endpoints: &[VarId],
        konst: &HashSet<VarId>,
    ) -> Vec<VarId> {
        let mut seen = HashSet::new();
        let mut boundary = vec![];
        for &id in order {
            let opr = graph.opr(id);
            if !opr.outputs.is_empty() && opr.outputs.iter().all(|o| konst.contains(o)) {
                continue;
            }
            for (ix, input) in opr.inputs.iter().enumerate() {
                if opr.op().input_dep(ix).needs_value() && konst.contains(input) && seen.insert(*input) {
                    boundary.push(*input);
                }
            }
        }
        for ep in endpoints {
            if konst.contains(ep) && seen.insert(*ep) {
                boundary.push(*ep);
            }
        }
        boundary.retain(|v| !graph.owner(*v).op().is_const_leaf());
        boundary
    }

    fn evaluate(
        graph: &ComputingGraph,
        targets: &[VarId],
        konst: &HashSet<VarId>,
    ) -> GraftResult<HashMap<VarId, Arc<Tensor>>> {
        let mut values: HashMap<VarId, Arc<Tensor>> = HashMap::new();
        for id in eval_order(graph, targets) {
            let opr = graph.opr(id);
            // runtime sources only contributing their shape
            if !opr.outputs.iter().all(|o| konst.contains(o)) {
                continue;
            }
            let statics = opr.outputs.iter().map(|o| graph.var(*o).static_value.clone()).collect::<Option<TVec<_>>>();
            let outputs: TVec<Arc<Tensor>> = if let Some(statics) = statics {
                statics
            } else if opr.op().is_const_leaf() {
                (0..opr.outputs.len())
                    .map(|slot| opr.op().leaf_value(slot).with_context(|| format!("{opr} holds no value")))
                    .collect::<GraftResult<_>>()?
            } else {
                let inputs = opr
                    .inputs
                    .iter()
                    .enumerate()
                    .map(|(ix, input)| {
                        if opr.op().input_dep(ix).needs_value() {
                            let value = values
                                .get(input)
                                .or(graph.var(*input).static_value.as_ref())
                                .with_context(|| format!("No value for input #{ix} of {opr}"))?;
                            Ok(EvalInput::Value(value.clone()))
                        } else {
                            let fact = graph.fact(*input);
                            Ok(EvalInput::Shape(fact.datum_type, fact.shape()?.into()))
                        }
                    })
                    .collect::<GraftResult<TVec<_>>>()?;
                let outputs = opr.op().eval(inputs).with_context(|| format!("Evaluating {opr}"))?;
                outputs.into_iter().map(|t| t.into_arc_tensor()).collect()
            };
            for (var, value) in opr.outputs.iter().zip(outputs) {
                values.insert(*var, value);
            }
        }
        Ok(values)
    }
}

impl Pass for ParamFusePass {
    fn name(&self) -> &'static str {
        "param_fuse"
    }

    fn apply(&self, state: &mut OptState) -> GraftResult<()> {
        let (boundary, values) = {
            let graph = state.graph();
            let order = eval_order(graph, state.endpoints());
            let konst = Self::const_vars(graph, &order);
            let boundary = Self::boundary(graph, &order, state.endpoints(), &konst);
            if boundary.is_empty() {
                return Ok(());
            }
            let values = Self::evaluate(graph, &boundary, &konst)?;
            (boundary, values)
        };
        for var in boundary {
            let value = values.get(&var).with_context(|| format!("{var:?} was not evaluated"))?.clone();
            let node = state.graph().var(var);
            let (name, comp_node, inferable) = (node.name.clone(), node.comp_node, node.static_value.is_some());
            let op: Box<dyn Op> =
                if inferable { Box::new(ImmutableTensor(value)) } else { Box::new(SharedTensor(value)) };
            let opr = state.graph_mut().insert_opr_on(Some(comp_node), name, op, &[])?;
            let folded = state.graph().opr(opr).outputs[0];
            state.replace_var(var, folded, "constant folded")?;
        }
        Rewriter::default().rewrite(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::element_wise::Elemwise;
    use crate::optim::test_utils::{random, run};

    #[test]
    fn const_endpoint() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let host_x = random(&[23], 1);
        let x = graph.shared("x", host_x.clone())?;
        let y = graph.shared("y", tensor1(&[0.5]))?;
        let p = graph.host_input("p", &HostTensor::new(tensor1(&[2.0])))?;
        let q = graph.add(p, x)?;
        let a = graph.add_scalar(y, 3.0)?;
        let z0 = graph.add(a, q)?;
        let z1 = graph.add_scalar(a, 4.0)?;
        let result = GraphOptimizer::default().add_pass(ParamFusePass).apply(&mut graph, &[z1, z0])?;
        let [z1_opt, z0_opt] = result.endpoint_vars[..] else { bail!("two endpoints expected") };
        let (spec0, out0) = callback_copy(z0_opt);
        let (spec1, out1) = callback_copy(z1_opt);
        let mut exe = graph.compile(vec![spec0, spec1])?;
        exe.execute()?;
        exe.wait()?;
        // x, p, q, folded a, z0, folded z1 and two callbacks
        assert_eq!(exe.iter_oprs_seq().count(), 8);
        let z0 = out0.lock().take().context("z0")?;
        for (x, z) in host_x.as_slice().iter().zip(z0.as_slice()) {
            approx::assert_abs_diff_eq!(*z, x + 0.5 + 3.0 + 2.0, epsilon = 1e-5);
        }
        assert_eq!(out1.lock().take().context("z1")?.as_slice(), &[7.5]);
        Ok(())
    }

    #[test]
    fn runtime_reader_keeps_its_type() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = graph.shared("x", random(&[23], 2))?;
        let y = graph.shared("y", tensor1(&[1.5]))?;
        let p = graph.host_input("p", &HostTensor::new(tensor1(&[0.25])))?;
        let z = graph.add(x, y)?;
        let xy = graph.mul(x, y)?;
        let q = graph.add(xy, p)?;
        let result = GraphOptimizer::default().add_pass(ParamFusePass).apply(&mut graph, &[z, q])?;
        let [z1, q1] = result.endpoint_vars[..] else { bail!("two endpoints expected") };
        assert!(graph.owner(z1).op_is::<SharedTensor>());
        assert_ne!(graph.var(q1).owner, graph.var(q).owner);
        assert!(graph.owner(q1).op_is::<Elemwise>());
        let (spec_z, _) = callback_copy(z1);
        let (spec_q, _) = callback_copy(q1);
        let exe = graph.compile(vec![spec_z, spec_q])?;
        // z, x * y folded, p, q and two callbacks
        assert_eq!(exe.iter_oprs_seq().count(), 6);
        let values = run(&mut graph, &[z, q, z1, q1])?;
        assert_eq!(values[0], values[2]);
        assert_eq!(values[1], values[3]);
        Ok(())
    }

    #[test]
    fn multi_read_const_is_folded_once() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        let x = graph.host_input("x", &HostTensor::new(random(&[23], 3)))?;
        let p0 = graph.shared("p0", tensor1(&[0.75]))?;
        let p1 = graph.shared("p1", tensor1(&[1.25]))?;
        let sum = graph.add(p0, p1)?;
        let a = graph.mul(x, sum)?;
        let b = graph.div(x, sum)?;
        let z0 = graph.add(a, b)?;
        let result = GraphOptimizer::default().add_pass(ParamFusePass).apply(&mut graph, &[z0])?;
        let z1 = result.endpoint_vars[0];
        assert_ne!(z0, z1);
        let owner = graph.owner(z1);
        let left = graph.owner(owner.inputs[0]).inputs[1];
        let right = graph.owner(owner.inputs[1]).inputs[1];
        assert!(graph.owner(left).op_is::<SharedTensor>());
        assert_eq!(left, right);
        let values = run(&mut graph, &[z0, z1])?;
        assert_eq!(values[0], values[1]);
        Ok(())
    }

    #[test]
    fn static_shape_becomes_immutable() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.host_input("a", &HostTensor::new(random(&[4], 4)))?;
        let shape_source = graph.shared("tshp", random(&[2, 2], 5))?;
        let shape = graph.get_var_shape(shape_source)?;
        let b = graph.reshape(a, shape)?;
        let result = GraphOptimizer::default().add_pass(ParamFusePass).apply(&mut graph, &[b])?;
        let expected = graph.reshape_to(a, &[2, 2])?;
        assert_eq!(result.endpoint_vars[0], expected);
        Ok(())
    }

    #[test]
    fn leaves_are_untouched() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let p = graph.shared("p", tensor1(&[1.0]))?;
        let result = GraphOptimizer::default().add_pass(ParamFusePass).apply(&mut graph, &[p])?;
        assert_eq!(result.endpoint_vars, vec![p]);
        assert!(result.replaced.is_empty());
        Ok(())
    }
}
