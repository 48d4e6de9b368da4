//! # graft
//!
//! Computing-graph rewriting and device memory planning.
//!
//! A [`ComputingGraph`](model::ComputingGraph) holds operators and the
//! variables they produce. Rewrite passes from [`optim`] turn endpoint
//! variables into equivalent, cheaper ones; [`plan`] compiles an output spec
//! into an execution sequence whose intermediate results are placed in
//! device memory by [`memory`].
//!
//! ```
//! use graft_core::internal::*;
//!
//! # fn main() -> GraftResult<()> {
//! let mut graph = ComputingGraph::make();
//! let x = HostTensor::new(tensor1(&[1.0, 2.5, 5.0]));
//! let input = graph.host_input("input", &x)?;
//! let y = graph.add_scalar(input, 3.0)?;
//!
//! let (spec, result) = callback_copy(y);
//! let mut exe = graph.compile(vec![spec])?;
//! exe.execute()?;
//! exe.wait()?;
//! assert_eq!(result.lock().as_ref().unwrap().as_slice(), &[4.0, 5.5, 8.0]);
//! # Ok(())
//! # }
//! ```

#[macro_use]
extern crate derive_new;
#[macro_use]
pub extern crate log;

pub extern crate downcast_rs;
pub extern crate graft_data;

#[macro_use]
pub mod ops;

pub mod infer;
pub mod memory;
pub mod model;
pub mod optim;
pub mod plan;

pub use graft_data::prelude;

pub mod internal {
    pub use crate::infer::{InferInput, StaticInfer};
    pub use crate::memory::{
        DefaultAllocator, DeviceMemoryAllocator, DeviceStorage, MemAllocError, StaticStoragePool,
    };
    pub use crate::model::{
        CompNode, ComputingGraph, DtrConfig, GraphCommonOptimizeOptions, LayoutTransform,
        OperatorNode, OprId, Options, TensorFormat, VarFact, VarId, VarNode, VarReceiverInfo,
    };
    pub use crate::model::order::{
        DepOprIter, eval_order, extract_opr_leaves, find_opr, find_opr_num,
    };
    pub use crate::ops::source::HostTensor;
    pub use crate::ops::{DepType, EvalInput, Op};
    pub use crate::optim::{GraphOptimizer, OptState, OptimizeResult, Pass, Rewriter};
    pub use crate::plan::{Callback, Executable, OutputSpecItem, callback_copy};
    pub use graft_data::internal::*;
    pub use itertools::Itertools;
    pub use std::borrow::Cow;
    pub use std::collections::{HashMap, HashSet};
    pub use std::fmt;
    pub use std::sync::Arc;
}

#[cfg(test)]
#[allow(dead_code)]
fn setup_test_logger() {
    let _ = env_logger::Builder::from_env("GRAFT_LOG").try_init();
}
