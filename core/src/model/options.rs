use super::TensorFormat;
use serde::Serialize;

/// Target layout of the format conversion pass. At most one is active.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum LayoutTransform {
    #[default]
    Default,
    Nchw4,
    Nhwcd4,
    Nchw88,
    Nchw44,
    Nchw44Dot,
    Nchw32,
    Chwn4,
    Nchw64,
}

impl LayoutTransform {
    pub fn target_format(&self) -> TensorFormat {
        match self {
            LayoutTransform::Default => TensorFormat::Default,
            LayoutTransform::Nchw4 => TensorFormat::Nchw4,
            LayoutTransform::Nhwcd4 => TensorFormat::Nhwcd4,
            LayoutTransform::Nchw88 => TensorFormat::Nchw88,
            LayoutTransform::Nchw44 => TensorFormat::Nchw44,
            LayoutTransform::Nchw44Dot => TensorFormat::Nchw44Dot,
            LayoutTransform::Nchw32 => TensorFormat::Nchw32,
            LayoutTransform::Chwn4 => TensorFormat::Chwn4,
            LayoutTransform::Nchw64 => TensorFormat::Nchw64,
        }
    }
}

macro_rules! bool_flag {
    ($flag: ident, $enable: ident, $disable: ident, $has_set: ident) => {
        pub fn $enable(&mut self) -> &mut Self {
            self.$flag = true;
            self
        }

        pub fn $disable(&mut self) -> &mut Self {
            self.$flag = false;
            self
        }

        pub fn $has_set(&self) -> bool {
            self.$flag
        }
    };
}

macro_rules! layout_flag {
    ($variant: ident, $enable: ident, $disable: ident, $has_set: ident) => {
        /// Selects this layout, replacing any previous selection.
        pub fn $enable(&mut self) -> &mut Self {
            self.layout_transform = LayoutTransform::$variant;
            self
        }

        pub fn $disable(&mut self) -> &mut Self {
            if self.layout_transform == LayoutTransform::$variant {
                self.layout_transform = LayoutTransform::Default;
            }
            self
        }

        pub fn $has_set(&self) -> bool {
            self.layout_transform == LayoutTransform::$variant
        }
    };
}

/// Flags selecting the inference rewrite pipeline.
///
/// Conflicting flags never raise: `f16_io_comp` wins over `f16_io_f32_comp`,
/// and `fuse_conv_bias_with_z` implies `fuse_conv_bias_nonlinearity`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphCommonOptimizeOptions {
    pub f16_io_f32_comp: bool,
    pub f16_io_comp: bool,
    pub fuse_conv_bias_nonlinearity: bool,
    pub fuse_conv_bias_with_z: bool,
    pub layout_transform: LayoutTransform,
}

pub type OptimizeForInferenceOptions = GraphCommonOptimizeOptions;

impl GraphCommonOptimizeOptions {
    bool_flag!(f16_io_f32_comp, enable_f16_io_f32_comp, disable_f16_io_f32_comp, has_set_f16_io_f32_comp);
    bool_flag!(f16_io_comp, enable_f16_io_comp, disable_f16_io_comp, has_set_f16_io_comp);
    bool_flag!(
        fuse_conv_bias_nonlinearity,
        enable_fuse_conv_bias_nonlinearity,
        disable_fuse_conv_bias_nonlinearity,
        has_set_fuse_conv_bias_nonlinearity
    );
    bool_flag!(
        fuse_conv_bias_with_z,
        enable_fuse_conv_bias_with_z,
        disable_fuse_conv_bias_with_z,
        has_set_fuse_conv_bias_with_z
    );
    layout_flag!(Nchw4, enable_nchw4, disable_nchw4, has_set_nchw4);
    layout_flag!(Nhwcd4, enable_nhwcd4, disable_nhwcd4, has_set_nhwcd4);
    layout_flag!(Nchw88, enable_nchw88, disable_nchw88, has_set_nchw88);
    layout_flag!(Nchw44, enable_nchw44, disable_nchw44, has_set_nchw44);
    layout_flag!(Nchw44Dot, enable_nchw44_dot, disable_nchw44_dot, has_set_nchw44_dot);
    layout_flag!(Nchw32, enable_nchw32, disable_nchw32, has_set_nchw32);
    layout_flag!(Chwn4, enable_chwn4, disable_chwn4, has_set_chwn4);
    layout_flag!(Nchw64, enable_nchw64, disable_nchw64, has_set_nchw64);

    pub fn fuse_nonlinearity(&self) -> bool {
        self.fuse_conv_bias_nonlinearity || self.fuse_conv_bias_with_z
    }

    /// Float16 mode after precedence: `Some(true)` computes convolutions in
    /// float32, `Some(false)` computes everything in float16.
    pub fn float16_mode(&self) -> Option<bool> {
        if self.f16_io_comp {
            Some(false)
        } else if self.f16_io_f32_comp {
            Some(true)
        } else {
            None
        }
    }
}

/// Dynamic tensor rematerialization settings.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DtrConfig {
    /// Evict when dynamic usage on a comp node would exceed this many bytes.
    /// Zero only evicts on allocation failure.
    pub eviction_threshold: usize,
    pub evictee_minimum_size: usize,
    pub recomp_memory_factor: f64,
    pub recomp_time_factor: f64,
}

impl Default for DtrConfig {
    fn default() -> DtrConfig {
        DtrConfig {
            eviction_threshold: 0,
            evictee_minimum_size: 1 << 20,
            recomp_memory_factor: 1.0,
            recomp_time_factor: 1.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SeqOpt {
    /// Place big static variables first when packing the arena.
    pub enable_mem_plan_opt: bool,
    /// Let static variables with disjoint lifetimes share memory.
    pub enable_mem_reuse_alloc: bool,
}

impl Default for SeqOpt {
    fn default() -> SeqOpt {
        SeqOpt { enable_mem_plan_opt: true, enable_mem_reuse_alloc: true }
    }
}

/// Graph-wide settings, read by compilation, the optimizer and the planner.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Options {
    /// 0: compile as is, 1: fold constants on compile, 2: also regroup
    /// constant leaves of arithmetic chains.
    pub graph_opt_level: u8,
    /// 0: quiet, 1: pipeline summaries, 2: every variable replacement.
    pub log_level: u8,
    /// 0: run the sequence on the calling thread, otherwise one worker per
    /// comp node.
    pub async_exec_level: u8,
    pub force_dynamic_alloc: bool,
    pub force_output_dynamic_alloc: bool,
    pub seq_opt: SeqOpt,
    pub enable_var_mem_defragment: bool,
    pub enable_dtr_memory_opt: bool,
    pub dtr_config: DtrConfig,
    pub allocate_static_mem_after_graph_compile: bool,
    /// Check every produced value against its inferred shape on the first run.
    pub var_sanity_check_first_run: bool,
    pub default_comp_node: super::CompNode,
    pub graph_opt: GraphCommonOptimizeOptions,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            graph_opt_level: 2,
            log_level: 1,
            async_exec_level: 0,
            force_dynamic_alloc: false,
            force_output_dynamic_alloc: false,
            seq_opt: SeqOpt::default(),
            enable_var_mem_defragment: true,
            enable_dtr_memory_opt: false,
            dtr_config: DtrConfig::default(),
            allocate_static_mem_after_graph_compile: false,
            var_sanity_check_first_run: true,
            default_comp_node: super::CompNode(0),
            graph_opt: GraphCommonOptimizeOptions::default(),
        }
    }
}
