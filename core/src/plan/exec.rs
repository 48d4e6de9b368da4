use parking_lot::{Condvar, Mutex};

use super::compile::{InputKind, StepPlan, VarPlan};
use crate::internal::*;
use crate::memory::{
    DynamicMemory, DynamicStats, Lifetime, Loaded, MemClass, MemSchema, Recompute, StaticMemory,
    VarMemReq, VarMemState,
};
use crate::model::GraphRuntime;

/// Values produced by a part and read by later parts.
pub(super) type ValueStore = Arc<Mutex<HashMap<VarId, Arc<Tensor>>>>;

/// A compiled sequence of operators, with its memory plan.
#[derive(Debug)]
pub struct Executable {
    graph: u32,
    part: usize,
    runtime: Arc<GraphRuntime>,
    static_memory: Arc<Mutex<StaticMemory>>,
    options: Options,
    pub(super) steps: Vec<StepPlan>,
    infer_seq: Vec<OperatorNode>,
    pub(super) vars: HashMap<VarId, VarPlan>,
    pub(super) schemas: HashMap<CompNode, MemSchema>,
    arenas: Option<HashMap<CompNode, DeviceStorage>>,
    plan_version: usize,
    store: ValueStore,
    dynamic: Option<DynamicMemory>,
    executions: usize,
}

impl Executable {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        graph: u32,
        part: usize,
        runtime: Arc<GraphRuntime>,
        static_memory: Arc<Mutex<StaticMemory>>,
        options: Options,
        steps: Vec<StepPlan>,
        infer_seq: Vec<OperatorNode>,
        vars: HashMap<VarId, VarPlan>,
        store: ValueStore,
    ) -> Executable {
        Executable {
            graph,
            part,
            runtime,
            static_memory,
            options,
            steps,
            infer_seq,
            vars,
            schemas: HashMap::new(),
            arenas: None,
            plan_version: 0,
            store,
            dynamic: None,
            executions: 0,
        }
    }

    pub fn part(&self) -> usize {
        self.part
    }

    /// Operators of the sequence, in execution order.
    pub fn get_oprs_seq(&self) -> Vec<OprId> {
        self.steps.iter().map(|s| s.opr.id).collect()
    }

    pub fn iter_oprs_seq(&self) -> impl Iterator<Item = &OperatorNode> {
        self.steps.iter().map(|s| &s.opr)
    }

    pub fn mem_class(&self, var: VarId) -> Option<MemClass> {
        self.vars.get(&var).and_then(|v| v.class)
    }

    pub fn mem_state(&self, var: VarId) -> VarMemState {
        let Some(plan) = self.vars.get(&var) else { return VarMemState::Unallocated };
        match plan.class {
            None => VarMemState::Unallocated,
            Some(MemClass::Static) if self.arenas.is_some() => VarMemState::StaticBound,
            Some(MemClass::Static) => VarMemState::StaticPlanned,
            Some(MemClass::Dynamic) => self
                .dynamic
                .as_ref()
                .map(|d| d.state(var, plan.comp_node))
                .unwrap_or(VarMemState::DynamicPending),
        }
    }

    /// Offset of a static var in the arena of its comp node.
    pub fn static_offset(&self, var: VarId) -> Option<usize> {
        let plan = self.vars.get(&var)?;
        self.schemas.get(&plan.comp_node)?.offset(var.index())
    }

    pub fn schema(&self, comp_node: CompNode) -> Option<&MemSchema> {
        self.schemas.get(&comp_node)
    }

    /// Bytes of static memory this sequence needs, over all comp nodes.
    pub fn static_memory_size(&self) -> usize {
        self.schemas.values().map(|s| s.memory_size()).sum()
    }

    /// Number of times the static layout was computed again because
    /// static shapes changed.
    pub fn plan_version(&self) -> usize {
        self.plan_version
    }

    /// Counters of the dynamic memory of the last execution.
    pub fn stats(&self) -> DynamicStats {
        self.dynamic.as_ref().map(|d| d.stats()).unwrap_or_default()
    }

    fn var(&self, var: VarId) -> GraftResult<&VarPlan> {
        self.vars.get(&var).with_context(|| format!("{var:?} is unknown to this executable"))
    }

    pub(super) fn plan_static_memory(&mut self) -> GraftResult<()> {
        let nr_steps = self.steps.len();
        let mut reqs: HashMap<CompNode, Vec<VarMemReq>> = HashMap::new();
        for (id, plan) in self.vars.iter().sorted_by_key(|(id, _)| **id) {
            if plan.class != Some(MemClass::Static) {
                continue;
            }
            let Some(start) = plan.produced_at else { continue };
            let end = plan.last_reader.unwrap_or(start).max(start) + 1;
            let size = plan.fact.byte_size().with_context(|| format!("Static var {} has no shape", plan.name))?;
            reqs.entry(plan.comp_node).or_default().push(VarMemReq {
                var: id.index(),
                lifetime: Lifetime { start, end },
                size,
            });
        }
        self.schemas = reqs
            .into_iter()
            .map(|(cn, reqs)| {
                let schema = MemSchema::build(
                    reqs,
                    nr_steps,
                    self.options.seq_opt.enable_mem_plan_opt,
                    self.options.seq_opt.enable_mem_reuse_alloc,
                )?;
                if self.options.log_level >= 2 {
                    debug!("Static layout on {}:\n{}", cn, schema);
                }
                Ok((cn, schema))
            })
            .collect::<GraftResult<_>>()?;
        self.arenas = None;
        Ok(())
    }

    pub(super) fn bind_static_memory(&mut self) -> GraftResult<()> {
        let allocator = self.runtime.allocator();
        let requirements = self.schemas.iter().map(|(cn, s)| (*cn, s.memory_size())).collect();
        let (arenas, moved) = self.static_memory.lock().ensure(&allocator, self.graph, &requirements)?;
        if moved {
            debug!("Static arenas of graph {} moved", self.graph);
        }
        self.arenas = Some(arenas);
        Ok(())
    }

    /// Runs static inference again, as host inputs may have changed shape.
    /// Returns true when the size of a static var changed.
    fn refresh_facts(&mut self) -> GraftResult<bool> {
        let mut changed = false;
        for node in &self.infer_seq {
            let (facts, values) = {
                let inputs = node
                    .inputs
                    .iter()
                    .map(|i| {
                        let v = self.vars.get(i).with_context(|| format!("{i:?} is not inferred"))?;
                        Ok(InferInput { fact: &v.fact, value: v.static_value.as_ref() })
                    })
                    .collect::<GraftResult<TVec<_>>>()?;
                StaticInfer::infer_opr(node.op(), &inputs).with_context(|| format!("Inferring facts for {node}"))?
            };
            for ((out, fact), value) in node.outputs.iter().zip(facts).zip(values) {
                let Some(plan) = self.vars.get_mut(out) else { continue };
                if plan.class == Some(MemClass::Static) {
                    ensure!(fact.shape.is_some(), "Static var {} lost its static shape", plan.name);
                    changed |= fact.byte_size() != plan.fact.byte_size();
                }
                plan.fact = fact;
                plan.static_value = value;
            }
        }
        Ok(changed)
    }

    /// Runs the sequence once.
    ///
    /// Failures of operators do not make this call fail: they are recorded
    /// in the graph, and returned by [`Executable::wait`].
    pub fn execute(&mut self) -> GraftResult<()> {
        if self.refresh_facts()? {
            self.plan_version += 1;
            debug!("Static shapes changed, static layout version {}", self.plan_version);
            self.plan_static_memory()?;
        }
        self.bind_static_memory()?;
        // values of the previous run are released before new ones are allocated
        self.dynamic = None;
        let allocator = self.runtime.allocator();
        let comp_nodes = self.vars.values().filter(|v| v.produced_at.is_some()).map(|v| v.comp_node).unique();
        let dynamic = DynamicMemory::new(self.graph, allocator.clone(), &self.options, comp_nodes);
        let arenas = self.arenas.clone().unwrap_or_default();
        {
            let run = Run {
                exe: self,
                allocator,
                arenas: &arenas,
                dynamic: &dynamic,
                shapes: Mutex::new(HashMap::new()),
                sanity_check: self.executions == 0 && self.options.var_sanity_check_first_run,
            };
            let workers = self.steps.iter().map(|s| s.opr.comp_node).unique().count();
            if self.options.async_exec_level > 0 && workers > 1 {
                run.run_async();
            } else {
                run.run_sequential();
            }
        }
        self.dynamic = Some(dynamic);
        self.executions += 1;
        Ok(())
    }

    /// Waits for the last execution, and returns the first error it
    /// recorded, if any.
    pub fn wait(&self) -> GraftResult<()> {
        let mut errors = self.runtime.take_async_errors().into_iter();
        match errors.next() {
            Some(first) => {
                for other in errors {
                    warn!("Discarding later error: {:?}", other);
                }
                Err(first)
            }
            None => Ok(()),
        }
    }

    pub(super) fn vars_sorted(&self) -> impl Iterator<Item = (&VarId, &VarPlan)> {
        self.vars.iter().sorted_by_key(|(id, _)| **id)
    }
}

/// Completion flags of the steps of an asynchronous run.
struct Events {
    state: Mutex<(Vec<bool>, bool)>,
    cond: Condvar,
}

impl Events {
    fn new(steps: usize) -> Events {
        Events { state: Mutex::new((vec![false; steps], false)), cond: Condvar::new() }
    }

    /// False if the run was aborted.
    fn wait(&self, step: usize) -> bool {
        let mut state = self.state.lock();
        while !state.0[step] && !state.1 {
            self.cond.wait(&mut state);
        }
        state.0[step]
    }

    fn set(&self, step: usize) {
        self.state.lock().0[step] = true;
        self.cond.notify_all();
    }

    fn abort(&self) {
        self.state.lock().1 = true;
        self.cond.notify_all();
    }
}

struct Run<'a> {
    exe: &'a Executable,
    allocator: Arc<dyn DeviceMemoryAllocator>,
    arenas: &'a HashMap<CompNode, DeviceStorage>,
    dynamic: &'a DynamicMemory,
    shapes: Mutex<HashMap<VarId, TVec<usize>>>,
    sanity_check: bool,
}

impl Run<'_> {
    fn run_sequential(&self) {
        for step in 0..self.exe.steps.len() {
            if let Err(e) = self.run_step(step) {
                self.exe.runtime.record_async_error(e);
                return;
            }
        }
    }

    /// One worker per comp node, each running its steps in sequence order.
    fn run_async(&self) {
        let events = Events::new(self.exe.steps.len());
        let comp_nodes = self.exe.steps.iter().map(|s| s.opr.comp_node).unique().collect_vec();
        std::thread::scope(|s| {
            for cn in comp_nodes {
                let events = &events;
                s.spawn(move || {
                    for (step, plan) in self.exe.steps.iter().enumerate() {
                        if plan.opr.comp_node != cn {
                            continue;
                        }
                        if !plan.waits.iter().all(|w| events.wait(*w)) {
                            return;
                        }
                        if let Err(e) = self.run_step(step) {
                            self.exe.runtime.record_async_error(e);
                            events.abort();
                            return;
                        }
                        events.set(step);
                    }
                });
            }
        });
    }

    fn run_step(&self, step: usize) -> GraftResult<()> {
        let plan = &self.exe.steps[step];
        trace!("Running step {}, opr {}", step, plan.opr);
        let mut inputs = tvec!();
        for (var, kind) in &plan.inputs {
            let input = match kind {
                InputKind::Shape => {
                    EvalInput::Shape(self.exe.var(*var)?.fact.datum_type, self.shape_of(*var)?)
                }
                InputKind::StaticValue => EvalInput::Value(
                    self.exe.var(*var)?.static_value.clone().with_context(|| format!("No static value for {var:?}"))?,
                ),
                InputKind::Value => EvalInput::Value(self.read(*var)?),
            };
            inputs.push(input);
        }
        let outputs = plan.opr.op().eval(inputs).with_context(|| format!("Step {step}, evaluating {}", plan.opr))?;
        ensure!(
            outputs.len() == plan.opr.outputs.len(),
            "{} produced {} values for {} outputs",
            plan.opr,
            outputs.len(),
            plan.opr.outputs.len()
        );
        for (var, value) in plan.opr.outputs.iter().zip(outputs) {
            self.write(*var, value).with_context(|| format!("Step {step}, storing outputs of {}", plan.opr))?;
        }
        for var in &plan.releases {
            self.dynamic.release(*var, self.exe.var(*var)?.comp_node)?;
        }
        Ok(())
    }

    fn shape_of(&self, var: VarId) -> GraftResult<TVec<usize>> {
        if let Some(shape) = self.shapes.lock().get(&var) {
            return Ok(shape.clone());
        }
        if let Some(value) = self.exe.store.lock().get(&var) {
            return Ok(value.shape().into());
        }
        Ok(self.exe.var(var)?.fact.shape()?.into())
    }

    fn arena_slice(&self, var: VarId, plan: &VarPlan, size: usize) -> GraftResult<DeviceStorage> {
        let offset = self
            .exe
            .schemas
            .get(&plan.comp_node)
            .and_then(|s| s.offset(var.index()))
            .with_context(|| format!("{} has no static offset", plan.name))?;
        let arena = self.arenas.get(&plan.comp_node).with_context(|| format!("No arena on {}", plan.comp_node))?;
        arena.slice(offset, size)
    }

    fn read(&self, var: VarId) -> GraftResult<Arc<Tensor>> {
        let plan = self.exe.var(var)?;
        let Some(class) = plan.class else {
            if let Some(value) = self.exe.store.lock().get(&var) {
                return Ok(value.clone());
            }
            return plan
                .static_value
                .clone()
                .with_context(|| format!("{} is neither computed by a previous part nor static", plan.name));
        };
        match class {
            MemClass::Static => {
                let shape = plan.fact.shape()?;
                let size = plan.fact.byte_size().unwrap_or(0);
                let bytes =
                    if size == 0 { vec![] } else { self.allocator.read(&self.arena_slice(var, plan, size)?, 0, size)? };
                Ok(Tensor::from_bytes(plan.fact.datum_type, shape, &bytes)?.into_arc_tensor())
            }
            MemClass::Dynamic => match self.dynamic.load(var, plan.comp_node)? {
                Loaded::Value(t) => Ok(t.into_arc_tensor()),
                Loaded::Evicted(recipe) => self.recompute(var, plan, &recipe),
            },
        }
    }

    fn recompute(&self, var: VarId, plan: &VarPlan, recipe: &Recompute) -> GraftResult<Arc<Tensor>> {
        let step = &self.exe.steps[recipe.step];
        let inputs = step.inputs.iter().map(|(v, _)| self.read(*v).map(EvalInput::Value)).collect::<GraftResult<_>>()?;
        let mut outputs = step.opr.op().eval(inputs).with_context(|| format!("Recomputing {}", plan.name))?;
        let value = outputs.pop().with_context(|| format!("Recomputing {} produced nothing", plan.name))?;
        self.dynamic.restore(var, plan.comp_node, &value)?;
        Ok(value.into_arc_tensor())
    }

    fn write(&self, var: VarId, value: Tensor) -> GraftResult<()> {
        let plan = self.exe.var(var)?;
        if self.sanity_check {
            ensure!(
                value.datum_type() == plan.fact.datum_type,
                "{} produced a {:?} value, {:?} was inferred",
                plan.name,
                value.datum_type(),
                plan.fact.datum_type
            );
            if let Some(shape) = &plan.fact.shape {
                ensure!(
                    &**shape == value.shape(),
                    "{} produced a value of shape {:?}, {:?} was inferred",
                    plan.name,
                    value.shape(),
                    shape
                );
            }
        }
        if value.is_empty() && plan.receiver.value_readers() > 0 && !plan.receiver.is_empty_allowed() {
            bail!("{} is empty, which some of its readers do not accept", plan.name);
        }
        self.shapes.lock().insert(var, value.shape().into());
        if plan.exported {
            self.exe.store.lock().insert(var, Arc::new(value.clone()));
        }
        match plan.class {
            Some(MemClass::Static) => {
                let shape = plan.fact.shape()?;
                ensure!(
                    shape == value.shape(),
                    "{} does not fit its static storage: shape {:?}, planned {:?}",
                    plan.name,
                    value.shape(),
                    shape
                );
                let bytes = value.to_bytes();
                if !bytes.is_empty() {
                    self.allocator.write(&self.arena_slice(var, plan, bytes.len())?, 0, &bytes)?;
                }
                Ok(())
            }
            Some(MemClass::Dynamic) => self.dynamic.store(
                var,
                plan.comp_node,
                &value,
                plan.fact.shape.as_deref(),
                plan.readers,
                plan.recompute.clone(),
            ),
            None => bail!("{} is produced outside of its plan", plan.name),
        }
    }
}
