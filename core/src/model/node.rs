use super::arena::Handle;
use super::{CompNode, VarFact, VarReceiverInfo};
use crate::internal::*;

/// Handle to an operator of a graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OprId {
    pub(crate) graph: u32,
    pub(crate) handle: Handle,
}

/// Handle to a variable of a graph.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId {
    pub(crate) graph: u32,
    pub(crate) handle: Handle,
}

impl OprId {
    pub fn index(&self) -> usize {
        self.handle.index()
    }
}

impl VarId {
    pub fn index(&self) -> usize {
        self.handle.index()
    }
}

impl fmt::Debug for OprId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "opr{}.{:?}", self.graph, self.handle)
    }
}

impl fmt::Debug for VarId {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "var{}.{:?}", self.graph, self.handle)
    }
}

#[derive(Debug, Clone)]
pub struct OperatorNode {
    pub id: OprId,
    /// Graph-unique sequence number, in insertion order.
    pub uid: usize,
    pub name: String,
    pub op: Box<dyn Op>,
    pub inputs: TVec<VarId>,
    pub outputs: TVec<VarId>,
    pub comp_node: CompNode,
}

impl OperatorNode {
    pub fn op(&self) -> &dyn Op {
        &*self.op
    }

    pub fn op_as<O: Op>(&self) -> Option<&O> {
        self.op().downcast_ref::<O>()
    }

    pub fn op_is<O: Op>(&self) -> bool {
        self.op_as::<O>().is_some()
    }

    pub fn input(&self, ix: usize) -> VarId {
        self.inputs[ix]
    }

    pub fn output(&self, ix: usize) -> VarId {
        self.outputs[ix]
    }
}

impl fmt::Display for OperatorNode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "#{} \"{}\" {}", self.uid, self.name, self.op.name())
    }
}

#[derive(Debug, Clone)]
pub struct VarNode {
    pub id: VarId,
    pub uid: usize,
    pub name: String,
    pub owner: OprId,
    pub slot: usize,
    pub fact: VarFact,
    /// Value known before execution, from static inference.
    pub static_value: Option<Arc<Tensor>>,
    pub comp_node: CompNode,
    pub receiver: VarReceiverInfo,
}

impl fmt::Display for VarNode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "#{} \"{}\" {}", self.uid, self.name, self.fact)
    }
}
