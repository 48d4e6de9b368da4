use crate::internal::*;
use serde::Serialize;

/// A simulated device: each comp node has its own memory and, when async
/// execution is on, its own worker.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CompNode(pub usize);

impl fmt::Display for CompNode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "cpu{}", self.0)
    }
}

/// Physical arrangement of a 4D (N, C, H, W) tensor.
///
/// Packed formats split the channel axis in blocks of `pack()` channels;
/// the channel count is rounded up to a multiple of the block size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TensorFormat {
    #[default]
    Default,
    Nchw4,
    Nchw44,
    Nchw44Dot,
    Nchw88,
    Nchw32,
    Nchw64,
    Nhwcd4,
    Chwn4,
}

impl TensorFormat {
    pub fn is_default(&self) -> bool {
        *self == TensorFormat::Default
    }

    pub fn pack(&self) -> usize {
        use TensorFormat::*;
        match self {
            Default => 1,
            Nchw4 | Nchw44 | Nchw44Dot | Nhwcd4 | Chwn4 => 4,
            Nchw88 => 8,
            Nchw32 => 32,
            Nchw64 => 64,
        }
    }

    pub fn padded_channels(&self, c: usize) -> usize {
        c.div_ceil(self.pack()) * self.pack()
    }

    /// Permutation from `[N, C/p, p, H, W]` to the physical 5D shape.
    pub(crate) fn block_permutation(&self) -> [usize; 5] {
        match self {
            TensorFormat::Nhwcd4 => [0, 3, 1, 4, 2],
            TensorFormat::Chwn4 => [1, 3, 4, 0, 2],
            _ => [0, 1, 3, 4, 2],
        }
    }

    /// Physical axis of a logical NCHW axis. For the channel axis, this is
    /// the axis holding the channel blocks.
    pub fn physical_axis(&self, logical: usize) -> usize {
        if self.is_default() {
            return logical;
        }
        let perm = self.block_permutation();
        // logical N, C, H, W live at block positions 0, 1, 3, 4
        let block_pos = [0, 1, 3, 4][logical];
        perm.iter().position(|&p| p == block_pos).unwrap_or(logical)
    }

    pub fn physical_shape(&self, logical: &[usize]) -> GraftResult<TVec<usize>> {
        if self.is_default() {
            return Ok(logical.into());
        }
        ensure!(logical.len() == 4, "{:?} needs a 4D logical shape, got {:?}", self, logical);
        let p = self.pack();
        let blocked = [logical[0], logical[1].div_ceil(p), p, logical[2], logical[3]];
        Ok(self.block_permutation().iter().map(|&ax| blocked[ax]).collect())
    }

    /// Logical shape with the (padded) channel count the physical layout holds.
    pub fn padded_logical_shape(&self, physical: &[usize]) -> GraftResult<TVec<usize>> {
        if self.is_default() {
            return Ok(physical.into());
        }
        ensure!(physical.len() == 5, "{:?} needs a 5D physical shape, got {:?}", self, physical);
        let perm = self.block_permutation();
        let mut blocked = [0; 5];
        for (phys, &ax) in perm.iter().enumerate() {
            blocked[ax] = physical[phys];
        }
        ensure!(blocked[2] == self.pack(), "Wrong block size in {:?} for {:?}", physical, self);
        Ok(tvec!(blocked[0], blocked[1] * blocked[2], blocked[3], blocked[4]))
    }
}

impl fmt::Display for TensorFormat {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{self:?}")
    }
}

/// What is known about a variable before execution.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VarFact {
    pub datum_type: DatumType,
    /// Physical shape. `None` when it depends on runtime values.
    pub shape: Option<TVec<usize>>,
    pub format: TensorFormat,
}

impl VarFact {
    pub fn new(datum_type: DatumType, shape: impl Into<TVec<usize>>) -> VarFact {
        VarFact { datum_type, shape: Some(shape.into()), format: TensorFormat::Default }
    }

    pub fn dynamic(datum_type: DatumType) -> VarFact {
        VarFact { datum_type, shape: None, format: TensorFormat::Default }
    }

    pub fn with_format(self, format: TensorFormat) -> VarFact {
        VarFact { format, ..self }
    }

    pub fn of_tensor(t: &Tensor) -> VarFact {
        VarFact::new(t.datum_type(), t.shape())
    }

    pub fn shape(&self) -> GraftResult<&[usize]> {
        self.shape.as_deref().ok_or_else(|| format_err!("Shape is only known at runtime"))
    }

    pub fn rank(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.len())
    }

    pub fn byte_size(&self) -> Option<usize> {
        self.shape.as_ref().map(|s| s.iter().product::<usize>() * self.datum_type.size_of())
    }

    /// True for shapes made of 1s only (broadcastable in any layout).
    pub fn is_scalar_like(&self) -> bool {
        self.shape.as_ref().is_some_and(|s| s.iter().all(|d| *d == 1))
    }
}

impl fmt::Display for VarFact {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match &self.shape {
            Some(s) => write!(fmt, "{},{}", s.iter().join(","), self.datum_type)?,
            None => write!(fmt, "?,{}", self.datum_type)?,
        }
        if !self.format.is_default() {
            write!(fmt, " ({})", self.format)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn physical_shapes() -> GraftResult<()> {
        let logical = [2, 6, 5, 7];
        assert_eq!(TensorFormat::Nchw4.physical_shape(&logical)?, tvec!(2, 2, 5, 7, 4));
        assert_eq!(TensorFormat::Nhwcd4.physical_shape(&logical)?, tvec!(2, 5, 2, 7, 4));
        assert_eq!(TensorFormat::Chwn4.physical_shape(&logical)?, tvec!(2, 5, 7, 2, 4));
        assert_eq!(TensorFormat::Nchw88.physical_shape(&logical)?, tvec!(2, 1, 5, 7, 8));
        Ok(())
    }

    #[test]
    fn padded_logical_roundtrip() -> GraftResult<()> {
        for f in [TensorFormat::Nchw4, TensorFormat::Nhwcd4, TensorFormat::Chwn4, TensorFormat::Nchw32] {
            let phys = f.physical_shape(&[3, 5, 2, 4])?;
            assert_eq!(f.padded_logical_shape(&phys)?, tvec!(3, f.padded_channels(5), 2, 4));
        }
        Ok(())
    }

    #[test]
    fn physical_axes() {
        assert_eq!(TensorFormat::Nchw4.physical_axis(1), 1);
        assert_eq!(TensorFormat::Nhwcd4.physical_axis(1), 2);
        assert_eq!(TensorFormat::Nhwcd4.physical_axis(2), 1);
        assert_eq!(TensorFormat::Chwn4.physical_axis(0), 3);
        assert_eq!(TensorFormat::Chwn4.physical_axis(1), 0);
    }
}
