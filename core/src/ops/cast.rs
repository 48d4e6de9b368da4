use crate::infer::InferInput;
use crate::internal::*;

/// Datum type conversion. Layout agnostic.
#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct TypeCvt {
    pub to: DatumType,
}

impl Op for TypeCvt {
    fn name(&self) -> Cow<'_, str> {
        "TypeCvt".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("to {}", self.to)])
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "TypeCvt expects one input");
        Ok(tvec!(VarFact { datum_type: self.to, ..inputs[0].fact.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        Ok(tvec!(x.cast_to(self.to)))
    }
}
