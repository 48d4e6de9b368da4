use graft_data::internal::graft_ndarray::{Array5, ArrayD, ArrayView4, ArrayView5, Ix4, Ix5, IxDyn};

use crate::internal::*;

mod conv;
mod conv_bias;
pub mod format;
mod pool;

pub use self::conv::Convolution;
pub use self::conv_bias::{ConvBias, NonlineMode};
pub use self::pool::{PoolMode, Pooling};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ComputeMode {
    /// Accumulate in the datum type of the operands.
    #[default]
    Default,
    /// Accumulate in float32, whatever the operands datum type.
    Float32,
}

/// Geometry of a 2D convolution. Dense weights are `[OC, IC, KH, KW]`,
/// group weights `[G, OC/G, IC/G, KH, KW]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct ConvParams {
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub format: TensorFormat,
    pub compute_mode: ComputeMode,
}

impl Default for ConvParams {
    fn default() -> ConvParams {
        ConvParams {
            stride: [1, 1],
            padding: [0, 0],
            dilation: [1, 1],
            format: TensorFormat::Default,
            compute_mode: ComputeMode::Default,
        }
    }
}

/// Weight shape seen as `(group, oc per group, ic per group, kh, kw)`.
pub(crate) fn group_weight_shape(w: &[usize]) -> GraftResult<[usize; 5]> {
    match w.len() {
        4 => Ok([1, w[0], w[1], w[2], w[3]]),
        5 => Ok([w[0], w[1], w[2], w[3], w[4]]),
        _ => bail!("Convolution weights must be 4D or 5D, got {:?}", w),
    }
}

impl ConvParams {
    pub fn with_format(&self, format: TensorFormat) -> ConvParams {
        ConvParams { format, ..self.clone() }
    }

    fn output_len(&self, axis: usize, input: usize, kernel: usize) -> GraftResult<usize> {
        ensure!(
            self.stride[axis] > 0 && self.dilation[axis] > 0 && kernel > 0,
            "Convolution needs positive stride, dilation and kernel size, got {:?} and kernel {}",
            self,
            kernel
        );
        let span = self.dilation[axis] * (kernel - 1) + 1;
        let padded = input + 2 * self.padding[axis];
        ensure!(padded >= span, "Kernel of span {} does not fit in {}", span, padded);
        Ok((padded - span) / self.stride[axis] + 1)
    }

    /// Logical output shape from the logical input and weight shapes.
    pub fn output_shape(&self, input: &[usize], weights: &[usize]) -> GraftResult<TVec<usize>> {
        ensure!(input.len() == 4, "Convolution input must be 4D, got {:?}", input);
        let [g, ocg, icg, kh, kw] = group_weight_shape(weights)?;
        ensure!(
            input[1] == g * icg,
            "Input has {} channels, weights {:?} expect {}",
            input[1],
            weights,
            g * icg
        );
        Ok(tvec!(
            input[0],
            g * ocg,
            self.output_len(0, input[2], kh)?,
            self.output_len(1, input[3], kw)?
        ))
    }

    /// Reference convolution over logical NCHW data.
    pub(crate) fn convolve(&self, x: &Tensor, w: &Tensor) -> GraftResult<Tensor> {
        let dt = x.datum_type();
        let shape = self.output_shape(x.shape(), w.shape())?;
        let [g, ocg, icg, kh, kw] = group_weight_shape(w.shape())?;
        let x: ArrayView4<f32> = x.to_array_view().into_dimensionality::<Ix4>()?;
        let w: ArrayView5<f32> = w
            .to_array_view()
            .into_shape_with_order(IxDyn(&[g, ocg, icg, kh, kw]))?
            .into_dimensionality::<Ix5>()?;
        let round = dt == DatumType::F16 && self.compute_mode == ComputeMode::Default;
        let (h, wi) = (x.shape()[2] as isize, x.shape()[3] as isize);
        let mut out = Array5::<f32>::zeros((shape[0], g, ocg, shape[2], shape[3]));
        for ((n, gi, oc, oh, ow), o) in out.indexed_iter_mut() {
            let mut acc = 0f32;
            for ic in 0..icg {
                for ky in 0..kh {
                    let iy = (oh * self.stride[0] + ky * self.dilation[0]) as isize
                        - self.padding[0] as isize;
                    if iy < 0 || iy >= h {
                        continue;
                    }
                    for kx in 0..kw {
                        let ix = (ow * self.stride[1] + kx * self.dilation[1]) as isize
                            - self.padding[1] as isize;
                        if ix < 0 || ix >= wi {
                            continue;
                        }
                        acc += x[(n, gi * icg + ic, iy as usize, ix as usize)] * w[(gi, oc, ic, ky, kx)];
                        if round {
                            acc = dt.round(acc);
                        }
                    }
                }
            }
            *o = acc;
        }
        let out: ArrayD<f32> = out.into_dyn().into_shape_with_order(IxDyn(&shape))?;
        Ok(Tensor::from_array_dt(dt, out))
    }
}
