use crate::infer::InferInput;
use crate::internal::*;
use crate::ops::cnn::format::{pack, unpack};

/// Converts a 4D tensor between two layouts.
///
/// `channels` is the logical channel count: packing zero-pads up to the
/// block size, unpacking truncates back to it.
#[derive(Debug, Clone, new, PartialEq, Eq, Hash)]
pub struct RelayoutFormat {
    pub src: TensorFormat,
    pub dst: TensorFormat,
    pub channels: usize,
}

impl Op for RelayoutFormat {
    fn name(&self) -> Cow<'_, str> {
        "RelayoutFormat".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?} -> {:?} ({} channels)", self.src, self.dst, self.channels)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "RelayoutFormat expects one input");
        let x = inputs[0].fact;
        ensure!(x.format == self.src, "RelayoutFormat from {:?} got {}", self.src, x);
        let shape = match &x.shape {
            Some(s) => {
                let mut logical = self.src.padded_logical_shape(s)?;
                ensure!(logical.len() == 4, "RelayoutFormat needs 4D tensors, got {:?}", logical);
                ensure!(
                    self.channels <= logical[1],
                    "RelayoutFormat of {} channels, input holds {}",
                    self.channels,
                    logical[1]
                );
                ensure!(
                    !self.src.is_default() || self.channels == logical[1],
                    "RelayoutFormat from default layout must keep its {} channels",
                    logical[1]
                );
                logical[1] = self.channels;
                Some(self.dst.physical_shape(&logical)?)
            }
            None => None,
        };
        Ok(tvec!(VarFact { datum_type: x.datum_type, shape, format: self.dst }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let logical = unpack(&x, self.src, Some(self.channels))?;
        Ok(tvec!(pack(&logical, self.dst)?))
    }
}
