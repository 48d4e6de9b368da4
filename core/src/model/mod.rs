//! # Operator and variable graph
//!
//! A [`ComputingGraph`] owns two arenas: one of [`OperatorNode`]s and one of
//! [`VarNode`]s. Operators reference their inputs by [`VarId`] and own their
//! outputs. Handles carry the id of the graph that issued them, and a
//! generation, so that handles from another graph or to a pruned node are
//! caught instead of silently aliasing.
//!
//! Inserting an operator that is structurally identical to an existing one
//! (same parameters, same inputs, same comp node) returns the existing one:
//! callers must always use the ids returned by the graph.
pub mod arena;
pub mod dsl;
mod fact;
mod graph;
mod node;
pub mod options;
pub mod order;
mod receiver;

pub use self::fact::{CompNode, TensorFormat, VarFact};
pub use self::graph::{ComputingGraph, GraphRuntime};
pub use self::node::{OperatorNode, OprId, VarId, VarNode};
pub use self::options::{
    DtrConfig, GraphCommonOptimizeOptions, LayoutTransform, OptimizeForInferenceOptions, Options,
    SeqOpt,
};
pub use self::receiver::VarReceiverInfo;
