use std::cell::RefCell;

use parking_lot::Mutex;

use super::exec::{Executable, ValueStore};
use super::OutputSpecItem;
use crate::internal::*;
use crate::memory::{MemClass, Recompute};
use crate::ops::callback::CallbackCaller;
use crate::optim::param_fuse::ParamFusePass;
use crate::optim::reorder_arith::{ConstVarType, ReorderArithChainPass};

/// How a step reads one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum InputKind {
    /// Shape only.
    Shape,
    /// Value known to static inference.
    StaticValue,
    /// Value computed by a previous step or part.
    Value,
}

#[derive(Debug, Clone)]
pub(super) struct StepPlan {
    pub opr: OperatorNode,
    pub inputs: TVec<(VarId, InputKind)>,
    /// Dynamic vars this step is a reader of, one entry per var.
    pub releases: TVec<VarId>,
    /// Steps of other comp nodes to wait for.
    pub waits: TVec<usize>,
}

#[derive(Debug, Clone)]
pub(super) struct VarPlan {
    pub name: String,
    pub comp_node: CompNode,
    pub fact: VarFact,
    pub static_value: Option<Arc<Tensor>>,
    pub receiver: VarReceiverInfo,
    /// Step of the producer, if it belongs to the part.
    pub produced_at: Option<usize>,
    pub last_reader: Option<usize>,
    /// Steps of the part reading the value.
    pub readers: usize,
    pub class: Option<MemClass>,
    /// Read by a later part.
    pub exported: bool,
    pub recompute: Option<Recompute>,
}

struct Endpoints {
    direct: Vec<VarId>,
    callers: Vec<OprId>,
}

fn input_kinds(graph: &ComputingGraph, opr: &OperatorNode) -> TVec<(VarId, InputKind)> {
    opr.inputs
        .iter()
        .enumerate()
        .map(|(ix, &var)| {
            let dep = opr.op().input_dep(ix);
            let kind = if dep == DepType::Shape {
                InputKind::Shape
            } else if StaticInfer::satisfies(graph, var, dep) {
                InputKind::StaticValue
            } else {
                InputKind::Value
            };
            (var, kind)
        })
        .collect()
}

impl ComputingGraph {
    /// Compiles the operators needed by `spec` into an executable.
    ///
    /// Endpoints may be replaced by the graph optimizer first, according to
    /// `graph_opt_level` and `graph_opt`.
    pub fn compile(&mut self, spec: Vec<OutputSpecItem>) -> GraftResult<Executable> {
        let mut parts = self.compile_multi_part(vec![spec])?;
        parts.pop().context("Compilation produced no executable")
    }

    /// Compiles several output specs into executables meant to run one after
    /// the other. A part never computes again what a previous part did: it
    /// reads the value produced there.
    pub fn compile_multi_part(&mut self, specs: Vec<Vec<OutputSpecItem>>) -> GraftResult<Vec<Executable>> {
        ensure!(!specs.is_empty(), "Nothing to compile");
        for (var, _) in specs.iter().flatten() {
            self.try_var(*var)?;
        }
        let requested = specs.iter().flatten().map(|(v, _)| *v).unique().collect_vec();
        let replaced = self.optimize_for_compile(&requested)?;

        let mut endpoints = vec![];
        for part in specs {
            let mut eps = Endpoints { direct: vec![], callers: vec![] };
            for (var, callback) in part {
                let var = replaced.get(&var).copied().unwrap_or(var);
                match callback {
                    Some(cb) => {
                        let name = format!("{}:callback", self.var(var).name);
                        eps.callers.push(self.insert_opr(name, CallbackCaller::new(cb), &[var])?);
                    }
                    None => eps.direct.push(var),
                }
            }
            endpoints.push(eps);
        }

        let seqs = self.build_sequences(&endpoints);
        let infer_seq = {
            let mut needed = vec![];
            for eps in &endpoints {
                needed.extend(eps.direct.iter().copied());
                needed.extend(eps.callers.iter().flat_map(|c| self.opr(*c).inputs.iter().copied()));
            }
            eval_order(self, &needed).into_iter().map(|o| self.opr(o).clone()).collect_vec()
        };
        self.count_receivers(&seqs, &endpoints);

        let store: ValueStore = Arc::new(Mutex::new(HashMap::new()));
        let mut executables = vec![];
        for (ix, seq) in seqs.iter().enumerate() {
            let later = &seqs[ix + 1..];
            let exe = self.plan_part(ix, seq, later, &infer_seq, store.clone())?;
            if self.options().log_level >= 1 {
                info!(
                    "Compiled part {} of graph {}: {} steps, {} bytes of static memory",
                    ix,
                    self.id(),
                    seq.len(),
                    exe.static_memory_size()
                );
            }
            executables.push(exe);
        }
        Ok(executables)
    }

    fn optimize_for_compile(&mut self, endpoints: &[VarId]) -> GraftResult<HashMap<VarId, VarId>> {
        let mut optimizer = GraphOptimizer::default();
        if self.options().graph_opt != GraphCommonOptimizeOptions::default() {
            optimizer = optimizer.with_inference_passes(&self.options().graph_opt);
        }
        match self.options().graph_opt_level {
            0 => (),
            1 => optimizer = optimizer.add_pass(ParamFusePass),
            _ => {
                optimizer = optimizer
                    .add_pass(ReorderArithChainPass::new(ConstVarType::ImmutableAndParam))
                    .add_pass(ParamFusePass)
            }
        }
        if optimizer.is_empty() {
            return Ok(HashMap::new());
        }
        let result = optimizer.apply(self, endpoints)?;
        Ok(endpoints
            .iter()
            .zip(result.endpoint_vars.iter())
            .filter(|(a, b)| a != b)
            .map(|(a, b)| (*a, *b))
            .collect())
    }

    /// One sequence per part. Producers of inputs satisfied by static
    /// inference are left out, and an operator belongs to the first part
    /// needing it.
    fn build_sequences(&self, endpoints: &[Endpoints]) -> Vec<Vec<OprId>> {
        let order = RefCell::new(vec![]);
        let mut bounds = vec![0];
        {
            let mut iter = DepOprIter::new(self, |opr| order.borrow_mut().push(opr.id))
                .with_input_filter(|opr, ix| !StaticInfer::satisfies(self, opr.inputs[ix], opr.op().input_dep(ix)));
            for eps in endpoints {
                iter.extend(eps.direct.iter().copied());
                for caller in &eps.callers {
                    iter.add_opr(*caller);
                }
                bounds.push(order.borrow().len());
            }
        }
        let order = order.into_inner();
        bounds.iter().tuple_windows().map(|(a, b)| order[*a..*b].to_vec()).collect()
    }

    fn count_receivers(&mut self, seqs: &[Vec<OprId>], endpoints: &[Endpoints]) {
        self.reset_receivers();
        for opr in seqs.iter().flatten() {
            let node = self.opr(*opr);
            let kinds = input_kinds(self, node);
            let mut updates = vec![];
            for var in node.inputs.iter().copied().unique() {
                let reads = kinds.iter().enumerate().filter(|(_, (v, _))| *v == var).map(|(ix, (_, k))| (ix, *k));
                let reads = reads.collect_vec();
                let values = reads.iter().filter(|(_, k)| *k == InputKind::Value).map(|(ix, _)| *ix).collect_vec();
                let shape_only = values.is_empty()
                    && reads.iter().any(|(_, k)| *k == InputKind::Shape)
                    && StaticInfer::shape(self, var).is_none();
                let dep = values.first().map(|ix| node.op().input_dep(*ix));
                let allow_empty = !values.is_empty() && values.iter().all(|ix| node.op().allows_empty_input(*ix));
                updates.push((var, dep, shape_only, allow_empty));
            }
            let id = node.id;
            for (var, dep, shape_only, allow_empty) in updates {
                let receiver = self.receiver_mut(var);
                match dep {
                    Some(DepType::HostValue) => receiver.host_value += 1,
                    Some(_) => {
                        receiver.dev_value += 1;
                        receiver.last_dev_value_reader = Some(id);
                    }
                    None if shape_only => receiver.shape += 1,
                    None => (),
                }
                if allow_empty {
                    receiver.allow_empty_value += 1;
                }
            }
        }
        for var in endpoints.iter().flat_map(|e| e.direct.iter()) {
            self.receiver_mut(*var).nr_direct_comp_req += 1;
        }
    }

    fn plan_part(
        &self,
        part: usize,
        seq: &[OprId],
        later: &[Vec<OprId>],
        infer_seq: &[OperatorNode],
        store: ValueStore,
    ) -> GraftResult<Executable> {
        let options = self.options();
        let mut vars: HashMap<VarId, VarPlan> = HashMap::new();
        for node in infer_seq {
            for out in &node.outputs {
                let var = self.var(*out);
                vars.insert(
                    *out,
                    VarPlan {
                        name: var.name.clone(),
                        comp_node: var.comp_node,
                        fact: var.fact.clone(),
                        static_value: var.static_value.clone(),
                        receiver: var.receiver.clone(),
                        produced_at: None,
                        last_reader: None,
                        readers: 0,
                        class: None,
                        exported: false,
                        recompute: None,
                    },
                );
            }
        }

        let mut steps = seq
            .iter()
            .map(|o| {
                let opr = self.opr(*o);
                StepPlan { opr: opr.clone(), inputs: input_kinds(self, opr), releases: tvec!(), waits: tvec!() }
            })
            .collect_vec();
        for (step, plan) in steps.iter().enumerate() {
            for out in &plan.opr.outputs {
                vars.get_mut(out).context("Output missing from the inference sequence")?.produced_at = Some(step);
            }
        }

        let mut read_by_callback = HashSet::new();
        let mut read_elsewhere = HashSet::new();
        for (step, plan) in steps.iter().enumerate() {
            for var in plan.inputs.iter().filter(|(_, k)| *k == InputKind::Value).map(|(v, _)| *v).unique() {
                let Some(var_plan) = vars.get_mut(&var) else { bail!("{:?} is read but never produced", var) };
                if var_plan.produced_at.is_none() {
                    continue;
                }
                var_plan.readers += 1;
                var_plan.last_reader = Some(step);
                if plan.opr.op_is::<CallbackCaller>() {
                    read_by_callback.insert(var);
                }
                if var_plan.comp_node != plan.opr.comp_node {
                    read_elsewhere.insert(var);
                }
            }
        }
        for opr in later.iter().flatten() {
            for (var, kind) in input_kinds(self, self.opr(*opr)) {
                if kind != InputKind::StaticValue {
                    if let Some(plan) = vars.get_mut(&var).filter(|p| p.produced_at.is_some()) {
                        plan.exported = true;
                    }
                }
            }
        }

        for (id, plan) in vars.iter_mut() {
            if plan.produced_at.is_none() {
                continue;
            }
            let dynamic = options.force_dynamic_alloc
                || plan.fact.shape.is_none()
                || (options.force_output_dynamic_alloc && read_by_callback.contains(id))
                || (options.async_exec_level > 0 && read_elsewhere.contains(id));
            plan.class = Some(if dynamic { MemClass::Dynamic } else { MemClass::Static });
        }

        for step in &mut steps {
            let mut releases = tvec!();
            let mut waits = tvec!();
            for (var, kind) in &step.inputs {
                let plan = &vars[var];
                let Some(producer) = plan.produced_at else { continue };
                if *kind == InputKind::Value && plan.class == Some(MemClass::Dynamic) && !releases.contains(var) {
                    releases.push(*var);
                }
                if plan.comp_node != step.opr.comp_node && !waits.contains(&producer) {
                    waits.push(producer);
                }
            }
            step.releases = releases;
            step.waits = waits;
        }

        if options.enable_dtr_memory_opt {
            for (step, plan) in steps.iter().enumerate() {
                if let Some((var, recipe)) = recompute_recipe(step, plan, &vars) {
                    if let Some(v) = vars.get_mut(&var) {
                        v.recompute = Some(recipe);
                    }
                }
            }
        }

        let mut exe = Executable::new(
            self.id(),
            part,
            self.runtime().clone(),
            self.static_memory().clone(),
            options.clone(),
            steps,
            infer_seq.to_vec(),
            vars,
            store,
        );
        exe.plan_static_memory()?;
        if options.allocate_static_mem_after_graph_compile {
            exe.bind_static_memory()?;
        }
        Ok(exe)
    }
}

/// Recipe to compute the output of a step again, if it is cheap and safe to
/// do so: a pure single-output operator reading only dynamic values of its
/// own comp node.
fn recompute_recipe(step: usize, plan: &StepPlan, vars: &HashMap<VarId, VarPlan>) -> Option<(VarId, Recompute)> {
    let op = plan.opr.op();
    if !op.is_pure() || op.is_const_leaf() || plan.opr.outputs.len() != 1 {
        return None;
    }
    let output = plan.opr.outputs[0];
    if vars.get(&output)?.class != Some(MemClass::Dynamic) {
        return None;
    }
    let mut facts = vec![];
    for (var, kind) in &plan.inputs {
        let input = vars.get(var)?;
        if *kind != InputKind::Value
            || input.produced_at.is_none()
            || input.class != Some(MemClass::Dynamic)
            || input.comp_node != plan.opr.comp_node
        {
            return None;
        }
        facts.push(&input.fact);
    }
    let inputs = plan.inputs.iter().map(|(v, _)| *v).unique().collect();
    Some((output, Recompute { step, cost: op.recompute_cost(&facts), inputs }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::VarMemState;

    fn quiet_graph() -> ComputingGraph {
        let mut graph = ComputingGraph::make();
        graph.options_mut().graph_opt_level = 0;
        graph
    }

    #[test]
    fn static_shape_deps_do_not_pull_producers() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let x = HostTensor::new(Tensor::zero(DatumType::F32, &[2, 3]));
        let x = graph.host_input("x", &x)?;
        let a = graph.shared("a", Tensor::from_fn(DatumType::F32, &[6], |i| i as f32))?;
        let shape = graph.get_var_shape(x)?;
        let r = graph.reshape(a, shape)?;
        let (spec, result) = callback_copy(r);
        let mut exe = graph.compile(vec![spec])?;
        // a, reshape, callback: neither x nor its shape are computed
        assert_eq!(exe.get_oprs_seq().len(), 3);
        assert!(!exe.get_oprs_seq().contains(&graph.var(x).owner));
        exe.execute()?;
        exe.wait()?;
        assert_eq!(result.lock().as_ref().map(|t| t.shape().to_vec()), Some(vec!(2, 3)));
        Ok(())
    }

    #[test]
    fn receivers_are_counted_per_operator() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let x = HostTensor::new(tensor1(&[1.0, 2.0]));
        let x = graph.host_input("x", &x)?;
        let sq = graph.mul(x, x)?;
        let y = graph.add(sq, x)?;
        let (spec, _result) = callback_copy(y);
        let _exe = graph.compile(vec![spec, (sq, None)])?;
        assert_eq!(graph.var(x).receiver.dev_value, 2);
        assert_eq!(graph.var(x).receiver.last_dev_value_reader, Some(graph.var(y).owner));
        assert_eq!(graph.var(sq).receiver.nr_direct_comp_req, 1);
        assert_eq!(graph.var(sq).receiver.dev_value, 1);
        assert_eq!(graph.var(y).receiver.dev_value, 1);
        Ok(())
    }

    #[test]
    fn one_caller_per_callback() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let a = graph.shared("a", tensor1(&[1.0]))?;
        let b = graph.relu(a)?;
        let (spec, _) = callback_copy(b);
        let exe = graph.compile(vec![spec.clone(), spec])?;
        assert_eq!(exe.get_oprs_seq().len(), 3);
        assert_eq!(graph.oprs().filter(|o| o.op_is::<CallbackCaller>()).count(), 1);
        Ok(())
    }

    #[test]
    fn forced_dynamic_allocation() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let x = HostTensor::new(tensor1(&[1.0, 2.0]));
        let x = graph.host_input("x", &x)?;
        let y = graph.relu(x)?;
        let z = graph.neg(y)?;
        let (spec, _) = callback_copy(z);
        let exe = graph.compile(vec![spec.clone()])?;
        assert_eq!(exe.mem_class(y), Some(MemClass::Static));
        assert_eq!(exe.mem_class(z), Some(MemClass::Static));
        assert_eq!(exe.mem_state(y), VarMemState::StaticPlanned);

        graph.options_mut().force_output_dynamic_alloc = true;
        let exe = graph.compile(vec![spec.clone()])?;
        assert_eq!(exe.mem_class(y), Some(MemClass::Static));
        assert_eq!(exe.mem_class(z), Some(MemClass::Dynamic));

        graph.options_mut().force_dynamic_alloc = true;
        let exe = graph.compile(vec![spec])?;
        assert_eq!(exe.mem_class(x), Some(MemClass::Dynamic));
        assert_eq!(exe.mem_class(y), Some(MemClass::Dynamic));
        assert_eq!(exe.static_memory_size(), 0);
        Ok(())
    }

    #[test]
    fn runtime_shapes_are_dynamic() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let data = graph.host_input("data", &HostTensor::new(tensor1(&[1.0, -2.0, 3.0])))?;
        let zero = graph.scalar(DatumType::F32, 0.0)?;
        let mask = graph.binary(crate::ops::element_wise::BinaryMode::Max, data, zero)?;
        let (taken, _) = graph.cond_take(data, mask, crate::ops::array::CondTakeMode::Neq, 0.0)?;
        let (spec, _) = callback_copy(taken);
        let exe = graph.compile(vec![spec])?;
        assert_eq!(exe.mem_class(taken), Some(MemClass::Dynamic));
        assert_eq!(exe.mem_class(mask), Some(MemClass::Static));
        Ok(())
    }

    #[test]
    fn parts_share_values() -> GraftResult<()> {
        let mut graph = quiet_graph();
        let x = HostTensor::new(tensor1(&[1.0, 2.0]));
        let x = graph.host_input("x", &x)?;
        let y = graph.relu(x)?;
        let z = graph.neg(y)?;
        let (spec_y, ry) = callback_copy(y);
        let (spec_z, rz) = callback_copy(z);
        let mut parts = graph.compile_multi_part(vec![vec![spec_y], vec![spec_z]])?;
        assert_eq!(parts[0].get_oprs_seq().len(), 3);
        // neg and its callback only
        assert_eq!(parts[1].get_oprs_seq().len(), 2);
        for part in &mut parts {
            part.execute()?;
            part.wait()?;
        }
        assert_eq!(ry.lock().as_ref().map(|t| t.as_slice().to_vec()), Some(vec!(1.0, 2.0)));
        assert_eq!(rz.lock().as_ref().map(|t| t.as_slice().to_vec()), Some(vec!(-1.0, -2.0)));
        Ok(())
    }
}
