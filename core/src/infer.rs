//! Static inference: what is known about variables before execution.
//!
//! Facts (datum type, shape, format) and, when possible, values are
//! computed once when an operator is inserted and stored on its output
//! vars. Executables refresh them before each run, as host inputs may change
//! shape between executions.
use crate::internal::*;
use crate::ops::DepType;

/// What an operator sees of one of its inputs during static inference.
#[derive(Debug, Clone, Copy)]
pub struct InferInput<'a> {
    pub fact: &'a VarFact,
    pub value: Option<&'a Arc<Tensor>>,
}

impl<'a> InferInput<'a> {
    pub fn shape(&self) -> GraftResult<&'a [usize]> {
        self.fact.shape()
    }

    pub fn value(&self) -> GraftResult<&'a Arc<Tensor>> {
        self.value.context("Value is only known at runtime")
    }
}

pub struct StaticInfer;

impl StaticInfer {
    /// Facts and known values of an operator's outputs.
    pub fn infer_opr(
        op: &dyn Op,
        inputs: &[InferInput],
    ) -> GraftResult<(TVec<VarFact>, TVec<Option<Arc<Tensor>>>)> {
        for (ix, input) in inputs.iter().enumerate() {
            if op.input_dep(ix).needs_value()
                && input.fact.shape.as_ref().is_some_and(|s| s.iter().product::<usize>() == 0)
                && !op.allows_empty_input(ix)
            {
                bail!("{} does not accept an empty tensor as input #{}", op.name(), ix);
            }
        }
        let facts = op.infer(inputs)?;
        ensure!(
            facts.len() == op.nr_outputs(),
            "{} inferred {} outputs, declares {}",
            op.name(),
            facts.len(),
            op.nr_outputs()
        );
        let values = match op.infer_value(inputs)? {
            Some(values) => {
                ensure!(values.len() == facts.len(), "{} inferred a wrong number of values", op.name());
                for (fact, value) in facts.iter().zip(values.iter()) {
                    if let Some(shape) = &fact.shape {
                        ensure!(
                            &**shape == value.shape(),
                            "{} inferred shape {:?} but value of shape {:?}",
                            op.name(),
                            shape,
                            value.shape()
                        );
                    }
                }
                values.into_iter().map(Some).collect()
            }
            None => facts.iter().map(|_| None).collect(),
        };
        Ok((facts, values))
    }

    pub fn shape(graph: &ComputingGraph, var: VarId) -> Option<&[usize]> {
        graph.var(var).fact.shape.as_deref()
    }

    pub fn value(graph: &ComputingGraph, var: VarId) -> Option<&Arc<Tensor>> {
        graph.var(var).static_value.as_ref()
    }

    /// True when a dependency of this kind on `var` needs no execution of its
    /// producer.
    pub fn satisfies(graph: &ComputingGraph, var: VarId, dep: DepType) -> bool {
        match dep {
            DepType::DevValue => false,
            DepType::Shape => StaticInfer::shape(graph, var).is_some(),
            DepType::HostValue => StaticInfer::value(graph, var).is_some(),
        }
    }
}
