use bit_set::BitSet;

use super::{ComputingGraph, OperatorNode, OprId, VarId};
use crate::internal::*;

type Filter<'g> = Box<dyn FnMut(&'g OperatorNode) -> bool + 'g>;
type InputFilter<'g> = Box<dyn FnMut(&'g OperatorNode, usize) -> bool + 'g>;

/// Visits the operators contributing to a set of variables, each one
/// exactly once, inputs first.
///
/// Operators added after a first traversal are only visited if they were not
/// reached before, so the iterator can be fed incrementally.
pub struct DepOprIter<'g, F: FnMut(&'g OperatorNode)> {
    graph: &'g ComputingGraph,
    visited: BitSet,
    visitor: F,
    filter: Option<Filter<'g>>,
    input_filter: Option<InputFilter<'g>>,
}

impl<'g, F: FnMut(&'g OperatorNode)> DepOprIter<'g, F> {
    pub fn new(graph: &'g ComputingGraph, visitor: F) -> DepOprIter<'g, F> {
        DepOprIter {
            graph,
            visited: BitSet::with_capacity(graph.opr_capacity()),
            visitor,
            filter: None,
            input_filter: None,
        }
    }

    /// Installs a predicate called when an operator is first reached.
    /// Returning false keeps the operator but does not walk its inputs.
    pub fn with_filter(mut self, filter: impl FnMut(&'g OperatorNode) -> bool + 'g) -> Self {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Installs a predicate deciding, for each input of an operator, whether
    /// its producer must be visited.
    pub fn with_input_filter(mut self, filter: impl FnMut(&'g OperatorNode, usize) -> bool + 'g) -> Self {
        self.input_filter = Some(Box::new(filter));
        self
    }

    pub fn add(&mut self, var: VarId) -> &mut Self {
        let owner = self.graph.var(var).owner;
        self.add_opr(owner)
    }

    pub fn extend(&mut self, vars: impl IntoIterator<Item = VarId>) -> &mut Self {
        for v in vars {
            self.add(v);
        }
        self
    }

    pub fn add_opr(&mut self, opr: OprId) -> &mut Self {
        if self.visited.contains(opr.index()) {
            return self;
        }
        // (operator, expanded)
        let mut stack: Vec<(OprId, bool)> = vec![(opr, false)];
        let mut reached = BitSet::new();
        while let Some((current, expanded)) = stack.pop() {
            if self.visited.contains(current.index()) {
                continue;
            }
            let node = self.graph.opr(current);
            if expanded {
                self.visited.insert(current.index());
                (self.visitor)(node);
                continue;
            }
            if !reached.insert(current.index()) {
                continue;
            }
            stack.push((current, true));
            let walk_inputs = self.filter.as_mut().map(|f| f(node)).unwrap_or(true);
            if walk_inputs {
                for (ix, input) in node.inputs.iter().enumerate().rev() {
                    if let Some(f) = self.input_filter.as_mut() {
                        if !f(node, ix) {
                            continue;
                        }
                    }
                    let producer = self.graph.var(*input).owner;
                    if !self.visited.contains(producer.index()) {
                        stack.push((producer, false));
                    }
                }
            }
        }
        self
    }

    /// Marks an operator as visited without calling the visitor, hiding it
    /// and its exclusive dependencies from later traversals.
    pub fn set_visited(&mut self, opr: OprId) -> &mut Self {
        self.visited.insert(opr.index());
        self
    }

    pub fn visited(&self, opr: OprId) -> bool {
        self.visited.contains(opr.index())
    }
}

/// Operators contributing to `endpoints`, in dependency order.
pub fn eval_order(graph: &ComputingGraph, endpoints: &[VarId]) -> Vec<OprId> {
    let mut order = vec![];
    DepOprIter::new(graph, |opr| order.push(opr.id)).extend(endpoints.iter().copied());
    order
}

/// First operator of type `O` reached from `var`, in dependency order.
pub fn find_opr<'g, O: Op>(graph: &'g ComputingGraph, var: VarId) -> Option<&'g OperatorNode> {
    let mut found = None;
    DepOprIter::new(graph, |opr| {
        if found.is_none() && opr.op_is::<O>() {
            found = Some(opr);
        }
    })
    .add(var);
    found
}

pub fn find_opr_num<O: Op>(graph: &ComputingGraph, var: VarId) -> usize {
    let mut count = 0;
    DepOprIter::new(graph, |opr| {
        if opr.op_is::<O>() {
            count += 1
        }
    })
    .add(var);
    count
}

/// Leaves of the expression tree rooted at `var`: walks through producers
/// accepted by `pred` and collects the vars where the walk stops, left to
/// right. A var reached twice appears twice.
pub fn extract_opr_leaves(
    graph: &ComputingGraph,
    var: VarId,
    pred: impl Fn(&OperatorNode) -> bool,
) -> Vec<VarId> {
    let mut leaves = vec![];
    let mut stack = vec![var];
    while let Some(v) = stack.pop() {
        let owner = graph.owner(v);
        if pred(owner) {
            stack.extend(owner.inputs.iter().rev().copied());
        } else {
            leaves.push(v);
        }
    }
    leaves
}
