use crate::infer::InferInput;
use crate::internal::*;

/// Copies a value to another comp node.
#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct Copy {
    pub dest: CompNode,
}

impl Op for Copy {
    fn name(&self) -> Cow<'_, str> {
        "Copy".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("to {}", self.dest)])
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn preferred_comp_node(&self) -> Option<CompNode> {
        Some(self.dest)
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "Copy expects one input");
        Ok(tvec!(inputs[0].fact.clone()))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        Ok(tvec!((*x).clone()))
    }
}
