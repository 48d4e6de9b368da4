//! `Tensor` is the main data container for graft.
use crate::datum::DatumType;
use crate::{GraftResult, TVec};
use anyhow::{bail, ensure};
use itertools::Itertools;
use ndarray::prelude::*;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A dense n-dimensional value with a datum type.
#[derive(Clone)]
pub struct Tensor {
    dt: DatumType,
    data: ArrayD<f32>,
}

impl Tensor {
    /// Builds a tensor from an array, rounding every element to `dt`.
    pub fn from_array_dt(dt: DatumType, mut data: ArrayD<f32>) -> Tensor {
        if dt != DatumType::F32 {
            data.mapv_inplace(|v| dt.round(v));
        }
        if !data.is_standard_layout() {
            data = data.as_standard_layout().into_owned();
        }
        Tensor { dt, data }
    }

    pub fn from_shape(dt: DatumType, shape: &[usize], values: &[f32]) -> GraftResult<Tensor> {
        let len = shape.iter().product::<usize>();
        ensure!(
            values.len() == len,
            "Shape {:?} needs {} values, got {}",
            shape,
            len,
            values.len()
        );
        Ok(Tensor::from_array_dt(dt, ArrayD::from_shape_vec(IxDyn(shape), values.to_vec())?))
    }

    pub fn zero(dt: DatumType, shape: &[usize]) -> Tensor {
        Tensor { dt, data: ArrayD::zeros(IxDyn(shape)) }
    }

    pub fn from_fn(dt: DatumType, shape: &[usize], f: impl FnMut(usize) -> f32) -> Tensor {
        let mut f = f;
        let mut ix = 0;
        let data = ArrayD::from_shape_simple_fn(IxDyn(shape), || {
            ix += 1;
            f(ix - 1)
        });
        Tensor::from_array_dt(dt, data)
    }

    pub fn datum_type(&self) -> DatumType {
        self.dt
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn rank(&self) -> usize {
        self.data.ndim()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.len() == 0
    }

    /// Storage footprint in bytes, as the device would see it.
    pub fn byte_size(&self) -> usize {
        self.len() * self.dt.size_of()
    }

    pub fn to_array_view(&self) -> ArrayViewD<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> ArrayD<f32> {
        self.data
    }

    pub fn as_slice(&self) -> &[f32] {
        // from_array_dt and every other constructor keep a standard layout
        self.data.as_slice().unwrap_or(&[])
    }

    /// Only valid for single element tensors.
    pub fn to_scalar(&self) -> GraftResult<f32> {
        ensure!(self.len() == 1, "Expected a single element tensor, got {:?}", self.shape());
        Ok(self.as_slice()[0])
    }

    pub fn cast_to(&self, dt: DatumType) -> Tensor {
        if dt == self.dt {
            return self.clone();
        }
        Tensor::from_array_dt(dt, self.data.clone())
    }

    pub fn into_shape(self, shape: &[usize]) -> GraftResult<Tensor> {
        ensure!(
            shape.iter().product::<usize>() == self.len(),
            "Can not reshape {:?} to {:?}",
            self.shape(),
            shape
        );
        Ok(Tensor { dt: self.dt, data: self.data.into_shape_with_order(IxDyn(shape))? })
    }

    pub fn broadcast_to(&self, shape: &[usize]) -> GraftResult<Tensor> {
        let Some(view) = self.data.broadcast(IxDyn(shape)) else {
            bail!("Can not broadcast {:?} to {:?}", self.shape(), shape)
        };
        Ok(Tensor { dt: self.dt, data: view.as_standard_layout().into_owned() })
    }

    /// Little endian serialization in the datum type's own width.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.byte_size());
        for v in self.data.iter() {
            self.dt.write_bytes(*v, &mut out);
        }
        out
    }

    pub fn from_bytes(dt: DatumType, shape: &[usize], bytes: &[u8]) -> GraftResult<Tensor> {
        let len = shape.iter().product::<usize>();
        ensure!(
            bytes.len() == len * dt.size_of(),
            "{} bytes can not hold a {} tensor of shape {:?}",
            bytes.len(),
            dt,
            shape
        );
        let values = bytes.chunks_exact(dt.size_of()).map(|c| dt.read_bytes(c)).collect_vec();
        Ok(Tensor { dt, data: ArrayD::from_shape_vec(IxDyn(shape), values)? })
    }

    /// Checks that both tensors have the same type and shape and that
    /// values differ by less than `tolerance` (absolute or relative).
    pub fn close_enough(&self, other: &Tensor, tolerance: f32) -> GraftResult<()> {
        ensure!(
            self.dt == other.dt && self.shape() == other.shape(),
            "Mismatch: {:?} vs {:?}",
            self,
            other
        );
        for (ix, (a, b)) in self.data.iter().zip(other.data.iter()).enumerate() {
            let diff = (a - b).abs();
            if diff > tolerance && diff > tolerance * a.abs().max(b.abs()) {
                bail!("Mismatch at index {}: {} vs {} ({:?} vs {:?})", ix, a, b, self, other)
            }
        }
        Ok(())
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Tensor) -> bool {
        self.dt == other.dt
            && self.shape() == other.shape()
            && self.data.iter().zip(other.data.iter()).all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for Tensor {}

impl Hash for Tensor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.dt.hash(state);
        self.shape().hash(state);
        for v in self.data.iter() {
            v.to_bits().hash(state);
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let content = if self.len() > 12 {
            format!("{}, ...", self.data.iter().take(12).join(", "))
        } else {
            self.data.iter().join(", ")
        };
        write!(fmt, "{},{} {}", self.shape().iter().join(","), self.dt, content)
    }
}

impl<D: Dimension> From<Array<f32, D>> for Tensor {
    fn from(array: Array<f32, D>) -> Tensor {
        Tensor::from_array_dt(DatumType::F32, array.into_dyn())
    }
}

pub trait IntoArcTensor {
    fn into_arc_tensor(self) -> Arc<Tensor>;
}

impl IntoArcTensor for Tensor {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        Arc::new(self)
    }
}

impl IntoArcTensor for Arc<Tensor> {
    fn into_arc_tensor(self) -> Arc<Tensor> {
        self
    }
}

pub fn tensor0(v: f32) -> Tensor {
    Tensor::from(arr0(v))
}

pub fn tensor1(values: &[f32]) -> Tensor {
    Tensor::from(arr1(values))
}

pub fn tensor4(shape: [usize; 4], values: &[f32]) -> GraftResult<Tensor> {
    Tensor::from_shape(DatumType::F32, &shape, values)
}

pub fn natural_strides(shape: &[usize]) -> TVec<usize> {
    let mut strides: TVec<usize> = shape.iter().map(|_| 1).collect();
    for ix in (0..shape.len().saturating_sub(1)).rev() {
        strides[ix] = strides[ix + 1] * shape[ix + 1];
    }
    strides
}

/// Numpy-style broadcasting of a set of shapes.
pub fn broadcast_shapes<'a>(
    shapes: impl IntoIterator<Item = &'a [usize]>,
) -> GraftResult<TVec<usize>> {
    let shapes = shapes.into_iter().collect_vec();
    let rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut result: TVec<usize> = tvec![1; rank];
    for shape in &shapes {
        let offset = rank - shape.len();
        for (ix, &d) in shape.iter().enumerate() {
            let r = &mut result[offset + ix];
            if *r == 1 {
                *r = d;
            } else if d != 1 && d != *r {
                bail!("Can not broadcast shapes {:?}", shapes)
            }
        }
    }
    Ok(result)
}
