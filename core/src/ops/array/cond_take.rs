use std::hash::{Hash, Hasher};

use crate::infer::InferInput;
use crate::internal::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CondTakeMode {
    Eq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
}

/// Takes the elements of `data` where `mask` compares to `value`.
///
/// Outputs the taken values and their flat indices, both 1D. Their length
/// is only known once the mask is, so they are always dynamically allocated.
#[derive(Debug, Clone, PartialEq, new)]
pub struct CondTake {
    pub mode: CondTakeMode,
    pub value: f32,
}

impl Eq for CondTake {}

impl Hash for CondTake {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mode.hash(state);
        self.value.to_bits().hash(state);
    }
}

impl CondTake {
    fn keep(&self, m: f32) -> bool {
        match self.mode {
            CondTakeMode::Eq => m == self.value,
            CondTakeMode::Neq => m != self.value,
            CondTakeMode::Lt => m < self.value,
            CondTakeMode::Leq => m <= self.value,
            CondTakeMode::Gt => m > self.value,
            CondTakeMode::Geq => m >= self.value,
        }
    }
}

impl Op for CondTake {
    fn name(&self) -> Cow<'_, str> {
        "CondTake".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?} {}", self.mode, self.value)])
    }

    fn nr_outputs(&self) -> usize {
        2
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 2, "CondTake expects data and mask");
        let (data, mask) = (inputs[0].fact, inputs[1].fact);
        ensure!(data.format.is_default() && mask.format.is_default(), "CondTake works on default layout");
        if let (Some(d), Some(m)) = (&data.shape, &mask.shape) {
            ensure!(d == m, "CondTake data {:?} and mask {:?} differ", d, m);
        }
        Ok(tvec!(VarFact::dynamic(data.datum_type), VarFact::dynamic(DatumType::I32)))
    }

    // The output shape depends on the mask value, even if it is known.
    fn infer_value(&self, _inputs: &[InferInput]) -> GraftResult<Option<TVec<Arc<Tensor>>>> {
        Ok(None)
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let (data, mask) = args_2!(crate::ops::values(inputs)?);
        ensure!(data.shape() == mask.shape(), "CondTake data {:?} and mask {:?} differ", data, mask);
        let (values, indices): (Vec<f32>, Vec<f32>) = data
            .as_slice()
            .iter()
            .zip(mask.as_slice())
            .enumerate()
            .filter(|(_, (_, m))| self.keep(**m))
            .map(|(ix, (d, _))| (*d, ix as f32))
            .unzip();
        Ok(tvec!(
            Tensor::from_shape(data.datum_type(), &[values.len()], &values)?,
            Tensor::from_shape(DatumType::I32, &[indices.len()], &indices)?
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn takes_matching_elements() -> GraftResult<()> {
        let data = tensor1(&[1.0, 2.0, 3.0, 4.0]);
        let mask = tensor1(&[0.0, 1.0, 0.0, 1.0]);
        let y = CondTake::new(CondTakeMode::Gt, 0.5).eval(tvec!(data.into(), mask.into()))?;
        assert_eq!(y[0].as_slice(), &[2.0, 4.0]);
        assert_eq!(y[1].as_slice(), &[1.0, 3.0]);
        Ok(())
    }

    #[test]
    fn nothing_taken() -> GraftResult<()> {
        let data = tensor1(&[1.0, 2.0]);
        let y = CondTake::new(CondTakeMode::Lt, 0.0).eval(tvec!(data.clone().into(), data.into()))?;
        assert_eq!(y[0].shape(), &[0]);
        Ok(())
    }
}
