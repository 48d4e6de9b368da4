use graft_data::internal::graft_ndarray::{ArrayViewD, IxDyn, Zip};

use crate::infer::InferInput;
use crate::internal::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryMode {
    Neg,
    Relu,
    Sigmoid,
    Tanh,
    HSwish,
    Exp,
    Abs,
}

impl UnaryMode {
    pub fn eval(&self, x: f32) -> f32 {
        match self {
            UnaryMode::Neg => -x,
            UnaryMode::Relu => x.max(0.0),
            UnaryMode::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryMode::Tanh => x.tanh(),
            UnaryMode::HSwish => x * (x + 3.0).clamp(0.0, 6.0) / 6.0,
            UnaryMode::Exp => x.exp(),
            UnaryMode::Abs => x.abs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryMode {
    Add,
    Sub,
    Mul,
    Div,
    Max,
    Min,
    Pow,
}

impl BinaryMode {
    pub fn eval(&self, a: f32, b: f32) -> f32 {
        match self {
            BinaryMode::Add => a + b,
            BinaryMode::Sub => a - b,
            BinaryMode::Mul => a * b,
            BinaryMode::Div => a / b,
            BinaryMode::Max => a.max(b),
            BinaryMode::Min => a.min(b),
            BinaryMode::Pow => a.powf(b),
        }
    }

    pub fn is_commutative(&self) -> bool {
        matches!(self, BinaryMode::Add | BinaryMode::Mul | BinaryMode::Max | BinaryMode::Min)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElemwiseMode {
    Unary(UnaryMode),
    Binary(BinaryMode),
}

/// Element-wise arithmetic, with numpy broadcasting for binary modes.
///
/// Operands in a packed format are processed in their physical layout.
/// Default-layout operands can only be mixed with packed ones if they are
/// scalar-like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Elemwise {
    pub mode: ElemwiseMode,
}

impl Elemwise {
    pub fn unary(mode: UnaryMode) -> Elemwise {
        Elemwise { mode: ElemwiseMode::Unary(mode) }
    }

    pub fn binary(mode: BinaryMode) -> Elemwise {
        Elemwise { mode: ElemwiseMode::Binary(mode) }
    }

    pub fn is_binary(&self, mode: BinaryMode) -> bool {
        self.mode == ElemwiseMode::Binary(mode)
    }

    pub fn is_unary(&self, mode: UnaryMode) -> bool {
        self.mode == ElemwiseMode::Unary(mode)
    }

    pub fn binary_mode(&self) -> Option<BinaryMode> {
        match self.mode {
            ElemwiseMode::Binary(m) => Some(m),
            _ => None,
        }
    }

    pub fn unary_mode(&self) -> Option<UnaryMode> {
        match self.mode {
            ElemwiseMode::Unary(m) => Some(m),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self.mode {
            ElemwiseMode::Unary(_) => 1,
            ElemwiseMode::Binary(_) => 2,
        }
    }
}

/// Common format of element-wise operands.
pub(crate) fn operands_format(facts: &[&VarFact]) -> GraftResult<TensorFormat> {
    let packed = facts.iter().map(|f| f.format).filter(|f| !f.is_default()).unique().collect_vec();
    ensure!(packed.len() <= 1, "Operands mix formats {:?}", packed);
    let Some(format) = packed.first().copied() else { return Ok(TensorFormat::Default) };
    for f in facts {
        ensure!(
            !f.format.is_default() || f.shape.is_none() || f.is_scalar_like(),
            "Default layout operand {} can not be mixed with {:?} operands",
            f,
            format
        );
    }
    Ok(format)
}

impl Op for Elemwise {
    fn name(&self) -> Cow<'_, str> {
        "Elemwise".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?}", self.mode)])
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == self.arity(), "{:?} expects {} inputs", self.mode, self.arity());
        let facts = inputs.iter().map(|i| i.fact).collect_vec();
        let dt = facts[0].datum_type;
        ensure!(
            facts.iter().all(|f| f.datum_type == dt),
            "Operands of {:?} have different datum types",
            self.mode
        );
        let format = operands_format(&facts)?;
        let shape = if facts.iter().all(|f| f.shape.is_some()) {
            Some(broadcast_shapes(facts.iter().filter_map(|f| f.shape.as_deref()))?)
        } else {
            None
        };
        Ok(tvec!(VarFact { datum_type: dt, shape, format }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let inputs = crate::ops::values(inputs)?;
        let dt = inputs[0].datum_type();
        let output = match self.mode {
            ElemwiseMode::Unary(mode) => inputs[0].to_array_view().mapv(|x| mode.eval(x)),
            ElemwiseMode::Binary(mode) => {
                let shape = broadcast_shapes([inputs[0].shape(), inputs[1].shape()])?;
                let (va, vb) = (inputs[0].to_array_view(), inputs[1].to_array_view());
                let a = broadcast_view(&va, &shape)?;
                let b = broadcast_view(&vb, &shape)?;
                Zip::from(&a).and(&b).map_collect(|x, y| mode.eval(*x, *y))
            }
        };
        Ok(tvec!(Tensor::from_array_dt(dt, output)))
    }

    fn recompute_cost(&self, inputs: &[&VarFact]) -> f64 {
        inputs.iter().filter_map(|f| f.shape.as_ref()).map(|s| s.iter().product::<usize>()).max().unwrap_or(1)
            as f64
    }
}

fn broadcast_view<'a>(t: &'a ArrayViewD<'_, f32>, shape: &[usize]) -> GraftResult<ArrayViewD<'a, f32>> {
    t.broadcast(IxDyn(shape))
        .with_context(|| format!("Can not broadcast {:?} to {:?}", t.shape(), shape))
}
