use super::batch_norm::ConvertBatchNormPass;
use super::convert_format::ConvertFormatPass;
use super::float16::ConvertF32ToF16Pass;
use super::fuse_conv_bias::{FuseConvBiasNonlinPass, FuseConvBiasZPass};
use super::param_fuse::ParamFusePass;
use super::param_redistribute::ParamRedistributePass;
use super::reorder_arith::{ConstVarType, ReorderArithChainPass};
use crate::internal::*;
use crate::model::OptimizeForInferenceOptions;

impl GraphOptimizer {
    /// Appends the standard inference pipeline for `options`.
    pub fn with_inference_passes(self, options: &GraphCommonOptimizeOptions) -> GraphOptimizer {
        let mut opt = self
            .add_pass(ConvertBatchNormPass)
            .add_pass(ParamRedistributePass)
            .add_pass(ReorderArithChainPass::new(ConstVarType::ImmutableAndParam))
            .add_pass(ParamFusePass);
        if let Some(io_f32_comp) = options.float16_mode() {
            opt = opt.add_pass(ConvertF32ToF16Pass::new(io_f32_comp));
        }
        if options.layout_transform != LayoutTransform::Default {
            let target = options.layout_transform.target_format();
            opt = opt.add_pass(ConvertFormatPass::new(target)).add_pass(ParamFusePass);
        }
        if options.fuse_nonlinearity() {
            opt = opt.add_pass(FuseConvBiasNonlinPass);
        }
        if options.fuse_conv_bias_with_z {
            opt = opt.add_pass(FuseConvBiasZPass);
        }
        opt.add_pass(ParamFusePass)
    }
}

/// Runs the inference pipeline on `endpoints`, returning their replacements
/// in order.
pub fn optimize_for_inference(
    graph: &mut ComputingGraph,
    endpoints: &[VarId],
    options: &OptimizeForInferenceOptions,
) -> GraftResult<Vec<VarId>> {
    let result = GraphOptimizer::default().with_inference_passes(options).apply(graph, endpoints)?;
    Ok(result.endpoint_vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::cnn::{ConvBias, ConvParams, Convolution, NonlineMode};
    use crate::ops::element_wise::{BinaryMode, Elemwise};
    use crate::ops::nn::{BatchNorm, BnParamDim};
    use crate::optim::test_utils::{random, run};

    fn conv_input(graph: &mut ComputingGraph) -> GraftResult<(VarId, VarId)> {
        let x = graph.host_input("x", &HostTensor::new(random(&[2, 4, 6, 6], 1)))?;
        let w = graph.shared("w", random(&[8, 4, 3, 3], 2))?;
        Ok((x, w))
    }

    #[test]
    fn conv_bias_relu_is_fused() -> GraftResult<()> {
        crate::setup_test_logger();
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let params = ConvParams { padding: [1, 1], ..ConvParams::default() };
        let y = graph.conv(x, w, params)?;
        let y = graph.add(y, b)?;
        let y = graph.relu(y)?;
        let mut options = OptimizeForInferenceOptions::default();
        options.enable_fuse_conv_bias_nonlinearity();
        let [y_opt] = optimize_for_inference(&mut graph, &[y], &options)?[..] else { bail!("one endpoint expected") };
        let cb = graph.owner(y_opt).op_as::<ConvBias>().context("ConvBias expected")?;
        assert_eq!(cb.nonline, NonlineMode::Relu);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn biases_are_merged() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w1) = conv_input(&mut graph)?;
        let w2 = graph.shared("w2", random(&[8, 4, 3, 3], 7))?;
        let b1 = graph.shared("b1", random(&[1, 8, 1, 1], 8))?;
        let b2 = graph.shared("b2", random(&[1, 8, 1, 1], 9))?;
        let y1 = graph.conv(x, w1, ConvParams::default())?;
        let y1 = graph.add(y1, b1)?;
        let y2 = graph.conv(x, w2, ConvParams::default())?;
        let y2 = graph.add(y2, b2)?;
        let y = graph.add(y1, y2)?;
        let y_opt = optimize_for_inference(&mut graph, &[y], &OptimizeForInferenceOptions::default())?[0];
        let chain = extract_opr_leaves(&graph, y_opt, |opr| {
            opr.op_as::<Elemwise>().is_some_and(|e| e.is_binary(BinaryMode::Add))
        });
        assert_eq!(chain.len(), 3);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn batch_norm_is_folded() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let y = graph.conv(x, w, ConvParams::default())?;
        let shape = [1, 8, 1, 1];
        let scale = graph.shared("scale", random(&shape, 4))?;
        let bias = graph.shared("bias", random(&shape, 5))?;
        let mean = graph.shared("mean", random(&shape, 6))?;
        let variance = graph.shared("variance", Tensor::from_fn(DatumType::F32, &shape, |i| 0.5 + i as f32))?;
        let y = graph.batch_norm(y, [scale, bias, mean, variance], BnParamDim::Dim1C11, 1e-5)?;
        let mut options = OptimizeForInferenceOptions::default();
        options.enable_fuse_conv_bias_nonlinearity();
        let y_opt = optimize_for_inference(&mut graph, &[y], &options)?[0];
        assert_eq!(find_opr_num::<BatchNorm>(&graph, y_opt), 0);
        assert_eq!(find_opr_num::<Convolution>(&graph, y_opt), 0);
        assert!(graph.owner(y_opt).op_is::<ConvBias>());
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn pipeline_is_idempotent() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let y = graph.conv(x, w, ConvParams { padding: [1, 1], ..ConvParams::default() })?;
        let y = graph.add(y, b)?;
        let shape = [1, 8, 1, 1];
        let scale = graph.shared("scale", random(&shape, 4))?;
        let bias = graph.shared("bias", random(&shape, 5))?;
        let mean = graph.shared("mean", random(&shape, 6))?;
        let variance = graph.shared("variance", Tensor::from_fn(DatumType::F32, &shape, |i| 1.0 + i as f32))?;
        let y = graph.batch_norm(y, [scale, bias, mean, variance], BnParamDim::Dim1C11, 1e-5)?;
        let y = graph.relu(y)?;
        let mut options = OptimizeForInferenceOptions::default();
        options.enable_fuse_conv_bias_nonlinearity();
        let once = GraphOptimizer::default().with_inference_passes(&options).apply(&mut graph, &[y])?;
        let y_once = once.endpoint_vars[0];
        assert_ne!(y_once, y);
        let twice = GraphOptimizer::default().with_inference_passes(&options).apply(&mut graph, &[y_once])?;
        assert_eq!(twice.endpoint_vars, vec![y_once]);
        let values = run(&mut graph, &[y, y_once])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn nhwcd4_pipeline() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let b = graph.shared("b", random(&[1, 8, 1, 1], 3))?;
        let y = graph.conv_bias(x, w, b, ConvParams::default(), NonlineMode::Identity)?;
        let y = graph.relu(y)?;
        let mut options = OptimizeForInferenceOptions::default();
        options.enable_nhwcd4().enable_fuse_conv_bias_nonlinearity();
        let y_opt = optimize_for_inference(&mut graph, &[y], &options)?[0];
        assert_eq!(graph.fact(y_opt).format, TensorFormat::Default);
        let cb = find_opr::<ConvBias>(&graph, y_opt).context("No ConvBias")?;
        assert_eq!(graph.fact(cb.outputs[0]).format, TensorFormat::Nhwcd4);
        assert_eq!(cb.op_as::<ConvBias>().map(|op| op.nonline), Some(NonlineMode::Relu));
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-4)
    }

    #[test]
    fn float16_pipeline_keeps_f32_endpoints() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let y = graph.conv(x, w, ConvParams::default())?;
        let mut options = OptimizeForInferenceOptions::default();
        options.enable_f16_io_comp();
        let y_opt = optimize_for_inference(&mut graph, &[y], &options)?[0];
        assert_eq!(graph.fact(y_opt).datum_type, DatumType::F32);
        let conv = find_opr::<Convolution>(&graph, y_opt).context("No convolution")?;
        assert_eq!(graph.fact(conv.outputs[0]).datum_type, DatumType::F16);
        let values = run(&mut graph, &[y, y_opt])?;
        values[0].close_enough(&values[1], 1e-2)
    }

    #[test]
    fn conflicting_layouts_are_rejected() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let (x, w) = conv_input(&mut graph)?;
        let y = graph.conv(x, w, ConvParams::default())?;
        let opt = GraphOptimizer::default()
            .add_pass(ConvertFormatPass::new(TensorFormat::Nchw4))
            .add_pass(ConvertFormatPass::new(TensorFormat::Nhwcd4));
        assert!(opt.apply(&mut graph, &[y]).is_err());
        Ok(())
    }
}
