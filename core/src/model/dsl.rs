//! Shortcuts to wire common operators.
use super::{CompNode, ComputingGraph, VarId};
use crate::internal::*;
use crate::ops::array::{
    AxisAddRemove, AxisDesc, Concat, CondTake, CondTakeMode, Dimshuffle, GetVarShape, Reshape,
    Subtensor,
};
use crate::ops::cast::TypeCvt;
use crate::ops::cnn::{ConvBias, ConvParams, Convolution, NonlineMode, Pooling};
use crate::ops::element_wise::{BinaryMode, Elemwise, UnaryMode};
use crate::ops::konst::{ImmutableTensor, SharedTensor};
use crate::ops::nn::{BatchNorm, BnParamDim, Reduce, ReduceMode};
use crate::ops::relayout::RelayoutFormat;
use crate::ops::source::HostInput;

impl ComputingGraph {
    fn wire_single(
        &mut self,
        name: impl Into<String>,
        op: impl Into<Box<dyn Op>>,
        inputs: &[VarId],
    ) -> GraftResult<VarId> {
        let outputs = self.wire_node(name, op, inputs)?;
        ensure!(outputs.len() == 1, "Expected a single output operator");
        Ok(outputs[0])
    }

    pub fn host_input(&mut self, name: impl Into<String>, tensor: &HostTensor) -> GraftResult<VarId> {
        self.wire_single(name, HostInput(tensor.clone()), &[])
    }

    pub fn shared(&mut self, name: impl Into<String>, t: Tensor) -> GraftResult<VarId> {
        self.wire_single(name, SharedTensor(t.into_arc_tensor()), &[])
    }

    pub fn shared_on(&mut self, cn: CompNode, name: impl Into<String>, t: Tensor) -> GraftResult<VarId> {
        let opr = self.insert_opr_on(Some(cn), name, SharedTensor(t.into_arc_tensor()), &[])?;
        Ok(self.opr(opr).outputs[0])
    }

    pub fn immutable(&mut self, name: impl Into<String>, t: Tensor) -> GraftResult<VarId> {
        self.wire_single(name, ImmutableTensor(t.into_arc_tensor()), &[])
    }

    /// A `[1]` shaped constant.
    pub fn scalar(&mut self, dt: DatumType, v: f32) -> GraftResult<VarId> {
        self.immutable("", Tensor::from_shape(dt, &[1], &[v])?)
    }

    pub fn elemwise(&mut self, op: Elemwise, inputs: &[VarId]) -> GraftResult<VarId> {
        self.wire_single("", op, inputs)
    }

    pub fn binary(&mut self, mode: BinaryMode, a: VarId, b: VarId) -> GraftResult<VarId> {
        self.elemwise(Elemwise::binary(mode), &[a, b])
    }

    pub fn unary(&mut self, mode: UnaryMode, x: VarId) -> GraftResult<VarId> {
        self.elemwise(Elemwise::unary(mode), &[x])
    }

    pub fn add(&mut self, a: VarId, b: VarId) -> GraftResult<VarId> {
        self.binary(BinaryMode::Add, a, b)
    }

    pub fn sub(&mut self, a: VarId, b: VarId) -> GraftResult<VarId> {
        self.binary(BinaryMode::Sub, a, b)
    }

    pub fn mul(&mut self, a: VarId, b: VarId) -> GraftResult<VarId> {
        self.binary(BinaryMode::Mul, a, b)
    }

    pub fn div(&mut self, a: VarId, b: VarId) -> GraftResult<VarId> {
        self.binary(BinaryMode::Div, a, b)
    }

    pub fn relu(&mut self, x: VarId) -> GraftResult<VarId> {
        self.unary(UnaryMode::Relu, x)
    }

    pub fn neg(&mut self, x: VarId) -> GraftResult<VarId> {
        self.unary(UnaryMode::Neg, x)
    }

    pub fn add_scalar(&mut self, x: VarId, v: f32) -> GraftResult<VarId> {
        let dt = self.fact(x).datum_type;
        let s = self.scalar(dt, v)?;
        self.add(x, s)
    }

    pub fn mul_scalar(&mut self, x: VarId, v: f32) -> GraftResult<VarId> {
        let dt = self.fact(x).datum_type;
        let s = self.scalar(dt, v)?;
        self.mul(x, s)
    }

    pub fn conv(&mut self, x: VarId, w: VarId, params: ConvParams) -> GraftResult<VarId> {
        self.wire_single("", Convolution::new(params), &[x, w])
    }

    pub fn conv_bias(
        &mut self,
        x: VarId,
        w: VarId,
        b: VarId,
        params: ConvParams,
        nonline: NonlineMode,
    ) -> GraftResult<VarId> {
        self.wire_single("", ConvBias::new(params, nonline), &[x, w, b])
    }

    pub fn conv_bias_z(
        &mut self,
        inputs: [VarId; 4],
        params: ConvParams,
        nonline: NonlineMode,
    ) -> GraftResult<VarId> {
        self.wire_single("", ConvBias::new(params, nonline), &inputs)
    }

    pub fn pooling(&mut self, x: VarId, op: Pooling) -> GraftResult<VarId> {
        self.wire_single("", op, &[x])
    }

    pub fn reshape(&mut self, x: VarId, shape: VarId) -> GraftResult<VarId> {
        self.wire_single("", Reshape, &[x, shape])
    }

    /// Reshape to a shape known at graph construction.
    pub fn reshape_to(&mut self, x: VarId, shape: &[usize]) -> GraftResult<VarId> {
        let values = shape.iter().map(|d| *d as f32).collect_vec();
        let target = self.immutable("", Tensor::from_shape(DatumType::I32, &[shape.len()], &values)?)?;
        self.reshape(x, target)
    }

    pub fn get_var_shape(&mut self, x: VarId) -> GraftResult<VarId> {
        self.wire_single("", GetVarShape, &[x])
    }

    pub fn concat(&mut self, inputs: &[VarId], axis: usize) -> GraftResult<VarId> {
        self.wire_single("", Concat::axis(axis), inputs)
    }

    pub fn dimshuffle(&mut self, x: VarId, pattern: &[Option<usize>]) -> GraftResult<VarId> {
        self.wire_single("", Dimshuffle::new(pattern.into()), &[x])
    }

    pub fn axis_add_remove(&mut self, x: VarId, descs: &[AxisDesc]) -> GraftResult<VarId> {
        self.wire_single("", AxisAddRemove::new(descs.into()), &[x])
    }

    pub fn subtensor(&mut self, x: VarId, axis: usize, start: usize, end: usize) -> GraftResult<VarId> {
        self.wire_single("", Subtensor::new(axis, start, end), &[x])
    }

    /// Taken values and their indices.
    pub fn cond_take(
        &mut self,
        data: VarId,
        mask: VarId,
        mode: CondTakeMode,
        value: f32,
    ) -> GraftResult<(VarId, VarId)> {
        let outputs = self.wire_node("", CondTake::new(mode, value), &[data, mask])?;
        Ok((outputs[0], outputs[1]))
    }

    pub fn reduce(&mut self, x: VarId, mode: ReduceMode, axis: Option<usize>) -> GraftResult<VarId> {
        self.wire_single("", Reduce::new(mode, axis), &[x])
    }

    pub fn type_cvt(&mut self, x: VarId, dt: DatumType) -> GraftResult<VarId> {
        self.wire_single("", TypeCvt::new(dt), &[x])
    }

    pub fn copy(&mut self, x: VarId, dest: CompNode) -> GraftResult<VarId> {
        self.wire_single("", crate::ops::copy::Copy::new(dest), &[x])
    }

    pub fn relayout(
        &mut self,
        x: VarId,
        src: TensorFormat,
        dst: TensorFormat,
        channels: usize,
    ) -> GraftResult<VarId> {
        self.wire_single("", RelayoutFormat::new(src, dst, channels), &[x])
    }

    pub fn batch_norm(
        &mut self,
        x: VarId,
        [scale, bias, mean, var]: [VarId; 4],
        param_dim: BnParamDim,
        epsilon: f32,
    ) -> GraftResult<VarId> {
        self.wire_single("", BatchNorm::new(param_dim, epsilon), &[x, scale, bias, mean, var])
    }
}
