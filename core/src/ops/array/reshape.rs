use crate::infer::InferInput;
use crate::internal::*;
use crate::ops::DepType;

fn ensure_default(op: &str, fact: &VarFact) -> GraftResult<()> {
    ensure!(fact.format.is_default(), "{} works on default layout, got {}", op, fact);
    Ok(())
}

/// Reshape to the value of a second input (1D integer tensor). One target
/// dimension may be -1, and is then deduced from the element count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Reshape;

impl Reshape {
    fn resolve(input: &[usize], target: &Tensor) -> GraftResult<TVec<usize>> {
        ensure!(target.rank() == 1, "Reshape target must be 1D, got {:?}", target.shape());
        let len = input.iter().product::<usize>();
        let wildcards = target.as_slice().iter().filter(|d| **d < 0.0).count();
        ensure!(wildcards <= 1, "Reshape target {:?} has more than one wildcard", target);
        let known = target.as_slice().iter().filter(|d| **d >= 0.0).map(|d| *d as usize).product::<usize>();
        let shape: TVec<usize> = target
            .as_slice()
            .iter()
            .map(|&d| if d < 0.0 { if known == 0 { 0 } else { len / known } } else { d as usize })
            .collect();
        ensure!(
            shape.iter().product::<usize>() == len,
            "Can not reshape {:?} to {:?}",
            input,
            target
        );
        Ok(shape)
    }
}

impl Op for Reshape {
    fn name(&self) -> Cow<'_, str> {
        "Reshape".into()
    }

    impl_op_same_as!();

    fn input_dep(&self, ix: usize) -> DepType {
        if ix == 1 { DepType::HostValue } else { DepType::DevValue }
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 2, "Reshape expects data and target shape");
        ensure_default("Reshape", inputs[0].fact)?;
        let shape = match (&inputs[0].fact.shape, inputs[1].value) {
            (Some(input), Some(target)) => Some(Reshape::resolve(input, target)?),
            _ => None,
        };
        Ok(tvec!(VarFact { shape, ..inputs[0].fact.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let (x, target) = args_2!(crate::ops::values(inputs)?);
        let shape = Reshape::resolve(x.shape(), &target)?;
        Ok(tvec!((*x).clone().into_shape(&shape)?))
    }
}

/// Shape of the input as a 1D i32 tensor. Reads only the shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GetVarShape;

impl Op for GetVarShape {
    fn name(&self) -> Cow<'_, str> {
        "GetVarShape".into()
    }

    impl_op_same_as!();

    fn input_dep(&self, _ix: usize) -> DepType {
        DepType::Shape
    }

    fn allows_empty_input(&self, _ix: usize) -> bool {
        true
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "GetVarShape expects one input");
        let shape = inputs[0].fact.rank().map(|r| tvec!(r));
        Ok(tvec!(VarFact { datum_type: DatumType::I32, shape, format: TensorFormat::Default }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let shape = inputs.first().context("GetVarShape expects one input")?.shape();
        let values = shape.iter().map(|d| *d as f32).collect_vec();
        Ok(tvec!(Tensor::from_shape(DatumType::I32, &[values.len()], &values)?))
    }

    fn recompute_cost(&self, _inputs: &[&VarFact]) -> f64 {
        1.0
    }
}

/// Axis permutation. `pattern[i]` is the input axis moved to output axis
/// `i`, or `None` for a new axis of size 1. Every input axis appears once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct Dimshuffle {
    pub pattern: TVec<Option<usize>>,
}

impl Dimshuffle {
    fn output_shape(&self, input: &[usize]) -> GraftResult<TVec<usize>> {
        let mut used = self.pattern.iter().flatten().copied().collect_vec();
        used.sort();
        ensure!(
            used == (0..input.len()).collect_vec(),
            "Dimshuffle pattern {:?} does not cover rank {}",
            self.pattern,
            input.len()
        );
        Ok(self.pattern.iter().map(|p| p.map(|ax| input[ax]).unwrap_or(1)).collect())
    }
}

impl Op for Dimshuffle {
    fn name(&self) -> Cow<'_, str> {
        "Dimshuffle".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!(
            "pattern: {}",
            self.pattern.iter().map(|p| p.map(|ax| ax.to_string()).unwrap_or("x".into())).join(",")
        )])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "Dimshuffle expects one input");
        ensure_default("Dimshuffle", inputs[0].fact)?;
        let shape = inputs[0].fact.shape.as_ref().map(|s| self.output_shape(s)).transpose()?;
        Ok(tvec!(VarFact { shape, ..inputs[0].fact.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let shape = self.output_shape(x.shape())?;
        let perm = self.pattern.iter().flatten().copied().collect_vec();
        let permuted = x.to_array_view().permuted_axes(perm).as_standard_layout().into_owned();
        let t = Tensor::from_array_dt(x.datum_type(), permuted);
        Ok(tvec!(t.into_shape(&shape)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AxisDesc {
    Add(usize),
    Remove(usize),
}

/// Adds or removes axes of size 1, applying `descs` in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, new)]
pub struct AxisAddRemove {
    pub descs: TVec<AxisDesc>,
}

impl AxisAddRemove {
    fn output_shape(&self, input: &[usize]) -> GraftResult<TVec<usize>> {
        let mut shape: TVec<usize> = input.into();
        for desc in &self.descs {
            match *desc {
                AxisDesc::Add(ax) => {
                    ensure!(ax <= shape.len(), "Can not add axis {} to {:?}", ax, shape);
                    shape.insert(ax, 1);
                }
                AxisDesc::Remove(ax) => {
                    ensure!(shape.get(ax) == Some(&1), "Can not remove axis {} of {:?}", ax, shape);
                    shape.remove(ax);
                }
            }
        }
        Ok(shape)
    }
}

impl Op for AxisAddRemove {
    fn name(&self) -> Cow<'_, str> {
        "AxisAddRemove".into()
    }

    impl_op_same_as!();

    fn info(&self) -> GraftResult<Vec<String>> {
        Ok(vec![format!("{:?}", self.descs)])
    }

    fn infer(&self, inputs: &[InferInput]) -> GraftResult<TVec<VarFact>> {
        ensure!(inputs.len() == 1, "AxisAddRemove expects one input");
        ensure_default("AxisAddRemove", inputs[0].fact)?;
        let shape = inputs[0].fact.shape.as_ref().map(|s| self.output_shape(s)).transpose()?;
        Ok(tvec!(VarFact { shape, ..inputs[0].fact.clone() }))
    }

    fn eval(&self, inputs: TVec<EvalInput>) -> GraftResult<TVec<Tensor>> {
        let x = args_1!(crate::ops::values(inputs)?);
        let shape = self.output_shape(x.shape())?;
        Ok(tvec!((*x).clone().into_shape(&shape)?))
    }

    fn recompute_cost(&self, _inputs: &[&VarFact]) -> f64 {
        1.0
    }
}
