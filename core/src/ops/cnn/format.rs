//! Conversions between the logical NCHW layout and packed formats.
use graft_data::internal::graft_ndarray::{ArrayD, Axis, IxDyn, Slice};

use crate::internal::*;

/// Packs a logical NCHW tensor, zero-padding channels to the block size.
pub fn pack(t: &Tensor, format: TensorFormat) -> GraftResult<Tensor> {
    if format.is_default() {
        return Ok(t.clone());
    }
    ensure!(t.rank() == 4, "Packing to {:?} needs a 4D tensor, got {:?}", format, t.shape());
    let (n, c, h, w) = (t.shape()[0], t.shape()[1], t.shape()[2], t.shape()[3]);
    let p = format.pack();
    let cp = format.padded_channels(c);
    let mut padded = ArrayD::<f32>::zeros(IxDyn(&[n, cp, h, w]));
    padded.slice_axis_mut(Axis(1), Slice::from(0..c)).assign(&t.to_array_view());
    let blocked = padded.into_shape_with_order(IxDyn(&[n, cp / p, p, h, w]))?;
    let physical = blocked.permuted_axes(IxDyn(&format.block_permutation()));
    Ok(Tensor::from_array_dt(t.datum_type(), physical))
}

/// Unpacks to logical NCHW. Channels are truncated to `channels` if given,
/// and kept padded otherwise.
pub fn unpack(t: &Tensor, format: TensorFormat, channels: Option<usize>) -> GraftResult<Tensor> {
    if format.is_default() {
        return Ok(t.clone());
    }
    let logical = format.padded_logical_shape(t.shape())?;
    let perm = format.block_permutation();
    let mut inverse = [0; 5];
    for (phys, &blocked) in perm.iter().enumerate() {
        inverse[blocked] = phys;
    }
    let blocked = t.to_array_view().permuted_axes(IxDyn(&inverse)).as_standard_layout().into_owned();
    let mut nchw = blocked.into_shape_with_order(IxDyn(&logical))?;
    if let Some(c) = channels {
        ensure!(c <= logical[1], "Can not unpack {} channels out of {}", c, logical[1]);
        nchw.slice_axis_inplace(Axis(1), Slice::from(0..c));
    }
    Ok(Tensor::from_array_dt(t.datum_type(), nchw))
}
