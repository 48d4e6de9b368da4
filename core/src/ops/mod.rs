//! Operators
//!
//! Every operator is a parameter value implementing [`Op`]. Operators are
//! compared structurally (`same_as` and `Hash`) for deduplication, and
//! recognized by downcast in rewrite rules.
use downcast_rs::{Downcast, impl_downcast};

use crate::infer::InferInput;
use crate::internal::*;

#[macro_use]
pub mod macros;

pub mod array;
pub mod callback;
pub mod cast;
pub mod cnn;
pub mod copy;
pub mod element_wise;
pub mod konst;
pub mod nn;
pub mod relayout;
pub mod source;

/// How an operator consumes one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepType {
    /// The value, in device memory.
    DevValue,
    /// Only the shape.
    Shape,
    /// The value, read on host before the operator runs.
    HostValue,
}

impl DepType {
    pub fn needs_value(&self) -> bool {
        !matches!(self, DepType::Shape)
    }
}

/// Operator input at evaluation time.
#[derive(Debug, Clone)]
pub enum EvalInput {
    Value(Arc<Tensor>),
    /// Shape-only dependency.
    Shape(DatumType, TVec<usize>),
}

impl EvalInput {
    pub fn value(&self) -> GraftResult<&Arc<Tensor>> {
        match self {
            EvalInput::Value(v) => Ok(v),
            EvalInput::Shape(..) => bail!("Expected a value, got a shape-only input"),
        }
    }

    pub fn into_value(self) -> GraftResult<Arc<Tensor>> {
        match self {
            EvalInput::Value(v) => Ok(v),
            EvalInput::Shape(..) => bail!("Expected a value, got a shape-only input"),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            EvalInput::Value(v) => v.shape(),
            EvalInput::Shape(_, s) => s,
        }
    }
}

impl From<Arc<Tensor>> for EvalInput {
    fn from(t: Arc<Tensor>) -> EvalInput {
        EvalInput::Value(t)
    }
}

impl From<Tensor> for EvalInput {
    fn from(t: Tensor) -> EvalInput {
        EvalInput::Value(t.into_arc_tensor())
    }
}

pub trait Op: fmt::Debug + dyn_clone::DynClone + dyn_hash::DynHash + Send + Sync + 'static + Downcast {
    fn name(&self) -> Cow<'_, str>;

    /// Structural equality, used by deduplication.
    fn same_as(&self, _other: &dyn Op) -> bool {
        false
    }

    /// Short human-readable parameter descriptions.
    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![])
    }

    fn nr_outputs(&self) -> usize {
        1
    }

    fn input_dep(&self, _ix: usize) -> DepType {
        DepType::DevValue
    }

    /// Pure operators always produce the same outputs from the same inputs
    /// and have no side effect.
    fn is_pure(&self) -> bool {
        true
    }

    /// Parameter leaves: values known at graph construction, that never
    /// depend on runtime inputs.
    fn is_const_leaf(&self) -> bool {
        false
    }

    /// Value held by a parameter leaf.
    fn leaf_value(&self, _slot: usize) -> Option<Arc<Tensor>> {
        None
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        false
    }

    fn preferred_comp_node(&self) -> Option<CompNode> {
        None
    }

    /// Output facts from input facts (and static values, when known).
    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>>;

    /// Output values, when they can be known before execution. By default,
    /// pure operators are evaluated once all their needed inputs are known.
    fn infer_value(&self, inputs: &[InferInput]) -> GraftResult<Option<TVec<Arc<Tensor>>>> {
        if !self.is_pure() {
            return Ok(None);
        }
        let mut eval_inputs = tvec!();
        for (ix, input) in inputs.iter().enumerate() {
            match self.input_dep(ix) {
                DepType::Shape => match &input.fact.shape {
                    Some(shape) => {
                        eval_inputs.push(EvalInput::Shape(input.fact.datum_type, shape.clone()))
                    }
                    None => return Ok(None),
                },
                _ => match input.value {
                    Some(v) => eval_inputs.push(EvalInput::Value(v.clone())),
                    None => return Ok(None),
                },
            }
        }
        let outputs = self.eval(eval_inputs)?;
        Ok(Some(outputs.into_iter().map(|t| t.into_arc_tensor()).collect()))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>>;

    /// Estimated cost of computing the outputs again, used to rank eviction
    /// candidates.
    fn recompute_cost(&self, inputs: &[&VarFact]) -> f64 {
        inputs.iter().filter_map(|f| f.byte_size()).sum::<usize>().max(1) as f64
    }
}

impl_downcast!(Op);
dyn_clone::clone_trait_object!(Op);
dyn_hash::hash_trait_object!(Op);

impl<O: Op> From<O> for Box<dyn Op> {
    fn from(it: O) -> Box<dyn Op> {
        Box::new(it)
    }
}

/// Collects values of `Value` inputs, failing on shape-only ones.
pub(crate) fn values(inputs: TVec<EvalInput>) -> GraftResult<TVec<Arc<Tensor>>> {
    inputs.into_iter().map(|i| i.into_value()).collect()
}
