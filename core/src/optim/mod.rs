//! # Graph rewriting
//!
//! A [`Pass`] rewrites the graph reachable from a set of endpoints by
//! inserting new operators and recording which old variables they replace.
//! The graph itself is append-only during optimization: old operators stay
//! in place, so that callers still holding old ids keep a valid graph.
//! [`GraphOptimizer`] chains passes and composes their replacements.
use std::fmt::Debug;

use crate::ops::DepType;

pub mod batch_norm;
pub mod convert_format;
pub mod float16;
pub mod fuse_conv_bias;
mod inference;
pub mod padding_channel;
pub mod param_fuse;
pub mod param_merge;
pub mod param_redistribute;
pub mod reorder_arith;
mod rewriter;

pub use self::inference::optimize_for_inference;
pub use self::rewriter::Rewriter;

use crate::internal::*;

pub trait Pass: Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(&self, state: &mut OptState) -> GraftResult<()>;

    /// Layout the pass converts the graph to. Two passes of an optimizer
    /// can not target different layouts.
    fn layout_target(&self) -> Option<TensorFormat> {
        None
    }
}

/// True if the operator outputs can be computed without any runtime input.
///
/// `input_const` tells if an input var is constant. Shape-only dependencies
/// only need a static shape, host value dependencies a static value.
pub(crate) fn is_const_opr(
    graph: &ComputingGraph,
    opr: &OperatorNode,
    mut input_const: impl FnMut(VarId) -> bool,
) -> bool {
    if opr.op().is_const_leaf() {
        return true;
    }
    if !opr.op().is_pure() || opr.inputs.is_empty() {
        return false;
    }
    opr.inputs.iter().enumerate().all(|(ix, input)| match opr.op().input_dep(ix) {
        DepType::Shape => graph.fact(*input).shape.is_some(),
        DepType::HostValue => graph.var(*input).static_value.is_some() || input_const(*input),
        DepType::DevValue => input_const(*input),
    })
}

/// Mutable state of one pass run: the graph, the endpoints the pass started
/// from, and the replacements it made so far.
pub struct OptState<'g> {
    graph: &'g mut ComputingGraph,
    endpoints: Vec<VarId>,
    pass: &'static str,
    replace: HashMap<VarId, VarId>,
    readers: HashMap<VarId, usize>,
    consts: HashMap<VarId, bool>,
    relaxed: bool,
    log_level: u8,
}

impl<'g> OptState<'g> {
    pub fn new(graph: &'g mut ComputingGraph, endpoints: &[VarId], pass: &'static str) -> OptState<'g> {
        let mut readers: HashMap<VarId, usize> = HashMap::new();
        for opr in eval_order(graph, endpoints) {
            for input in graph.opr(opr).inputs.iter().unique() {
                *readers.entry(*input).or_default() += 1;
            }
        }
        for ep in endpoints {
            *readers.entry(*ep).or_default() += 1;
        }
        let log_level = graph.options().log_level;
        OptState {
            graph,
            endpoints: endpoints.to_vec(),
            pass,
            replace: HashMap::new(),
            readers,
            consts: HashMap::new(),
            relaxed: false,
            log_level,
        }
    }

    pub fn graph(&self) -> &ComputingGraph {
        self.graph
    }

    pub fn graph_mut(&mut self) -> &mut ComputingGraph {
        self.graph
    }

    pub fn endpoints(&self) -> &[VarId] {
        &self.endpoints
    }

    pub fn pass_name(&self) -> &'static str {
        self.pass
    }

    /// Allows replacements changing the datum type, shape or format.
    pub fn set_relaxed_checks(&mut self, relaxed: bool) {
        self.relaxed = relaxed;
    }

    /// Number of distinct operators reading `var`, an endpoint counting as
    /// one reader. Vars created by the running pass count as read once,
    /// unless they replaced an existing var.
    pub fn nr_readers(&self, var: VarId) -> usize {
        self.readers.get(&var).copied().unwrap_or(1)
    }

    /// Records that readers of `old` must read `new` instead.
    pub fn replace_var(&mut self, old: VarId, new: VarId, reason: &str) -> GraftResult<()> {
        if old == new {
            return Ok(());
        }
        let (old_fact, new_fact) = (self.graph.fact(old), self.graph.fact(new));
        if !self.relaxed {
            ensure!(
                old_fact.datum_type == new_fact.datum_type,
                "{}: can not replace {} by {}, datum types differ",
                self.pass,
                self.graph.var(old),
                self.graph.var(new)
            );
            let logical = |fact: &VarFact| -> GraftResult<Option<TVec<usize>>> {
                fact.shape.as_ref().map(|s| fact.format.padded_logical_shape(s)).transpose()
            };
            if let (Some(a), Some(b)) = (logical(old_fact)?, logical(new_fact)?) {
                ensure!(
                    a == b,
                    "{}: can not replace {} by {}, shapes differ",
                    self.pass,
                    self.graph.var(old),
                    self.graph.var(new)
                );
            }
        }
        if self.log_level >= 2 {
            debug!("{}: {} replaced by {} ({})", self.pass, self.graph.var(old), self.graph.var(new), reason);
        }
        let moved = self.readers.get(&old).copied().unwrap_or(0);
        if moved > 0 {
            *self.readers.entry(new).or_default() += moved;
        }
        self.replace.insert(old, new);
        Ok(())
    }

    /// Latest replacement of `var`, following chains of replacements.
    pub fn get_var_replace(&self, mut var: VarId) -> VarId {
        let mut hops = 0;
        while let Some(next) = self.replace.get(&var) {
            var = *next;
            hops += 1;
            if hops > self.replace.len() {
                break;
            }
        }
        var
    }

    pub fn is_replaced(&self, var: VarId) -> bool {
        self.replace.contains_key(&var)
    }

    /// True if `var` can be computed from parameters only.
    pub fn is_const(&mut self, var: VarId) -> bool {
        if let Some(known) = self.consts.get(&var) {
            return *known;
        }
        let owner = self.graph.owner(var).clone();
        let mut inputs = HashMap::new();
        if owner.op().is_pure() && !owner.op().is_const_leaf() {
            for (ix, input) in owner.inputs.iter().enumerate() {
                if owner.op().input_dep(ix) != DepType::Shape {
                    let konst = self.is_const(*input);
                    inputs.insert(*input, konst);
                }
            }
        }
        let konst = is_const_opr(self.graph, &owner, |input| inputs.get(&input).copied().unwrap_or(false));
        for output in &owner.outputs {
            self.consts.insert(*output, konst);
        }
        konst
    }

    /// Static value, or held value for parameter leaves.
    pub fn const_value(&self, var: VarId) -> Option<Arc<Tensor>> {
        let node = self.graph.var(var);
        node.static_value.clone().or_else(|| self.graph.opr(node.owner).op().leaf_value(node.slot))
    }

    fn into_replacements(self) -> HashMap<VarId, VarId> {
        let keys = self.replace.keys().copied().collect_vec();
        keys.into_iter().map(|k| (k, self.get_var_replace(k))).collect()
    }
}

/// Endpoints after optimization, and every replacement made on the way.
#[derive(Debug, Clone, Default)]
pub struct OptimizeResult {
    pub endpoint_vars: Vec<VarId>,
    pub replaced: HashMap<VarId, VarId>,
}

impl OptimizeResult {
    pub fn var_replace(&self, var: VarId) -> VarId {
        self.replaced.get(&var).copied().unwrap_or(var)
    }
}

/// An ordered list of passes.
#[derive(Debug, Default)]
pub struct GraphOptimizer {
    passes: Vec<Box<dyn Pass>>,
    max_rounds: Option<usize>,
}

impl GraphOptimizer {
    pub fn from_passes(passes: Vec<Box<dyn Pass>>) -> GraphOptimizer {
        GraphOptimizer { passes, max_rounds: None }
    }

    pub fn add_pass(mut self, pass: impl Pass + 'static) -> GraphOptimizer {
        self.passes.push(Box::new(pass));
        self
    }

    pub fn add_boxed_pass(mut self, pass: Box<dyn Pass>) -> GraphOptimizer {
        self.passes.push(pass);
        self
    }

    /// Runs the whole list again until endpoints stop changing, at most
    /// `max_rounds` times.
    pub fn until_fixpoint(self, max_rounds: usize) -> GraphOptimizer {
        GraphOptimizer { max_rounds: Some(max_rounds.max(1)), ..self }
    }

    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    pub fn passes(&self) -> impl Iterator<Item = &dyn Pass> {
        self.passes.iter().map(|p| &**p)
    }

    pub fn apply(&self, graph: &mut ComputingGraph, endpoints: &[VarId]) -> GraftResult<OptimizeResult> {
        let targets = self.passes.iter().filter_map(|p| p.layout_target()).unique().collect_vec();
        if targets.len() > 1 {
            bail!("Conflicting layout conversions in one optimizer: {:?}", targets);
        }
        for ep in endpoints {
            graph.try_var(*ep)?;
        }
        let log_level = graph.options().log_level;
        let mut current = endpoints.to_vec();
        let mut replaced: HashMap<VarId, VarId> = HashMap::new();
        for round in 0..self.max_rounds.unwrap_or(1) {
            let before = current.clone();
            for pass in &self.passes {
                let mut state = OptState::new(graph, &current, pass.name());
                pass.apply(&mut state).with_context(|| format!("Running pass {}", pass.name()))?;
                let map = state.into_replacements();
                if log_level >= 1 && !map.is_empty() {
                    info!("{}: {} vars replaced", pass.name(), map.len());
                }
                for v in replaced.values_mut() {
                    if let Some(new) = map.get(v) {
                        *v = *new;
                    }
                }
                for (old, new) in map.iter() {
                    replaced.entry(*old).or_insert(*new);
                }
                for v in current.iter_mut() {
                    if let Some(new) = map.get(v) {
                        *v = *new;
                    }
                }
            }
            if current == before {
                break;
            }
            debug!("Optimizer round {} changed endpoints", round);
        }
        replaced.retain(|k, v| k != v);
        Ok(OptimizeResult { endpoint_vars: current, replaced })
    }
}
