use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::{Mutex, RwLock};

use super::arena::Arena;
use super::{
    CompNode, OperatorNode, OprId, Options, VarFact, VarId, VarNode, VarReceiverInfo,
};
use crate::infer::{InferInput, StaticInfer};
use crate::internal::*;
use crate::memory::StaticMemory;

static GRAPH_IDS: AtomicU32 = AtomicU32::new(1);

/// State shared between a graph and the executables compiled from it.
#[derive(Debug)]
pub struct GraphRuntime {
    allocator: RwLock<Arc<dyn DeviceMemoryAllocator>>,
    async_errors: Mutex<Vec<GraftError>>,
}

impl GraphRuntime {
    pub fn allocator(&self) -> Arc<dyn DeviceMemoryAllocator> {
        self.allocator.read().clone()
    }

    pub fn record_async_error(&self, error: GraftError) {
        warn!("{:?}", error);
        self.async_errors.lock().push(error);
    }

    pub fn take_async_errors(&self) -> Vec<GraftError> {
        std::mem::take(&mut *self.async_errors.lock())
    }
}

#[derive(Debug)]
pub struct ComputingGraph {
    id: u32,
    oprs: Arena<OperatorNode>,
    vars: Arena<VarNode>,
    dedup: HashMap<u64, TVec<OprId>>,
    next_uid: usize,
    options: Options,
    runtime: Arc<GraphRuntime>,
    static_memory: Arc<Mutex<StaticMemory>>,
}

impl ComputingGraph {
    pub fn make() -> ComputingGraph {
        ComputingGraph::with_allocator(Arc::new(DefaultAllocator::default()))
    }

    pub fn with_allocator(allocator: Arc<dyn DeviceMemoryAllocator>) -> ComputingGraph {
        let id = GRAPH_IDS.fetch_add(1, Ordering::Relaxed);
        ComputingGraph {
            id,
            oprs: Arena::default(),
            vars: Arena::default(),
            dedup: HashMap::default(),
            next_uid: 0,
            options: Options::default(),
            runtime: Arc::new(GraphRuntime {
                allocator: RwLock::new(allocator),
                async_errors: Mutex::new(vec![]),
            }),
            static_memory: Arc::new(Mutex::new(StaticMemory::default())),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }

    pub fn runtime(&self) -> &Arc<GraphRuntime> {
        &self.runtime
    }

    pub(crate) fn static_memory(&self) -> &Arc<Mutex<StaticMemory>> {
        &self.static_memory
    }

    /// Inserts an operator on the comp node chosen from the operator, its
    /// first input, or the graph default, in that order.
    pub fn insert_opr(
        &mut self,
        name: impl Into<String>,
        op: impl Into<Box<dyn Op>>,
        inputs: &[VarId],
    ) -> GraftResult<OprId> {
        self.insert_opr_on(None, name, op, inputs)
    }

    /// Inserts an operator, or returns the existing structurally identical
    /// one. An empty name is replaced by an automatic one.
    pub fn insert_opr_on(
        &mut self,
        comp_node: Option<CompNode>,
        name: impl Into<String>,
        op: impl Into<Box<dyn Op>>,
        inputs: &[VarId],
    ) -> GraftResult<OprId> {
        let op = op.into();
        for (ix, input) in inputs.iter().enumerate() {
            ensure!(
                input.graph == self.id,
                "Input #{} of {} belongs to graph {}, not to graph {}",
                ix,
                op.name(),
                input.graph,
                self.id
            );
            ensure!(self.vars.contains(input.handle), "Input #{} of {} is not a live var", ix, op.name());
        }
        let comp_node = comp_node
            .or_else(|| op.preferred_comp_node())
            .or_else(|| inputs.first().map(|i| self.vars[i.handle].comp_node))
            .unwrap_or(self.options.default_comp_node);

        let key = {
            let mut hasher = DefaultHasher::new();
            op.as_any().type_id().hash(&mut hasher);
            op.hash(&mut hasher);
            inputs.hash(&mut hasher);
            comp_node.hash(&mut hasher);
            hasher.finish()
        };
        if let Some(candidates) = self.dedup.get(&key) {
            for &existing in candidates {
                let node = &self.oprs[existing.handle];
                if node.comp_node == comp_node && &*node.inputs == inputs && node.op.same_as(&*op) {
                    trace!("Dedup {} as {}", op.name(), node);
                    return Ok(existing);
                }
            }
        }

        let (facts, values) = {
            let infer_inputs = inputs
                .iter()
                .map(|i| {
                    let var = &self.vars[i.handle];
                    InferInput { fact: &var.fact, value: var.static_value.as_ref() }
                })
                .collect::<TVec<_>>();
            StaticInfer::infer_opr(&*op, &infer_inputs)
                .with_context(|| format!("Inferring facts for {}", op.name()))?
        };

        let uid = self.next_uid;
        self.next_uid += 1;
        let name = name.into();
        let name = if name.is_empty() { format!("{}{}", op.name().to_lowercase(), uid) } else { name };
        let id = OprId { graph: self.id, handle: self.oprs.next_handle() };
        let mut outputs = tvec!();
        let nr_outputs = facts.len();
        for (slot, (fact, static_value)) in facts.into_iter().zip(values).enumerate() {
            let var_uid = self.next_uid;
            self.next_uid += 1;
            let var_name = if nr_outputs == 1 { name.clone() } else { format!("{name}:{slot}") };
            let handle = self.vars.insert(VarNode {
                id: VarId { graph: self.id, handle: self.vars.next_handle() },
                uid: var_uid,
                name: var_name,
                owner: id,
                slot,
                fact,
                static_value,
                comp_node,
                receiver: VarReceiverInfo::default(),
            });
            outputs.push(VarId { graph: self.id, handle });
        }
        let handle = self.oprs.insert(OperatorNode {
            id,
            uid,
            name,
            op,
            inputs: inputs.into(),
            outputs,
            comp_node,
        });
        debug_assert_eq!(handle, id.handle);
        self.dedup.entry(key).or_default().push(id);
        Ok(id)
    }

    /// Inserts an operator and returns its outputs.
    pub fn wire_node(
        &mut self,
        name: impl Into<String>,
        op: impl Into<Box<dyn Op>>,
        inputs: &[VarId],
    ) -> GraftResult<TVec<VarId>> {
        let id = self.insert_opr(name, op, inputs)?;
        Ok(self.opr(id).outputs.clone())
    }

    pub fn opr(&self, id: OprId) -> &OperatorNode {
        assert_eq!(id.graph, self.id, "{id:?} is foreign to graph {}", self.id);
        &self.oprs[id.handle]
    }

    pub fn var(&self, id: VarId) -> &VarNode {
        assert_eq!(id.graph, self.id, "{id:?} is foreign to graph {}", self.id);
        &self.vars[id.handle]
    }

    pub fn try_var(&self, id: VarId) -> GraftResult<&VarNode> {
        ensure!(id.graph == self.id, "{:?} is foreign to graph {}", id, self.id);
        self.vars.get(id.handle).with_context(|| format!("{id:?} is not a live var"))
    }

    pub fn owner(&self, var: VarId) -> &OperatorNode {
        self.opr(self.var(var).owner)
    }

    pub fn fact(&self, var: VarId) -> &VarFact {
        &self.var(var).fact
    }

    pub(crate) fn receiver_mut(&mut self, var: VarId) -> &mut VarReceiverInfo {
        &mut self.vars[var.handle].receiver
    }

    pub(crate) fn reset_receivers(&mut self) {
        let handles = self.vars.iter().map(|(h, _)| h).collect_vec();
        for h in handles {
            self.vars[h].receiver = VarReceiverInfo::default();
        }
    }

    pub fn oprs(&self) -> impl Iterator<Item = &OperatorNode> {
        self.oprs.iter().map(|(_, o)| o)
    }

    pub fn vars(&self) -> impl Iterator<Item = &VarNode> {
        self.vars.iter().map(|(_, v)| v)
    }

    pub fn nr_oprs_in_graph(&self) -> usize {
        self.oprs.len()
    }

    pub(crate) fn opr_capacity(&self) -> usize {
        self.oprs.capacity()
    }

    pub fn find_var_by_name(&self, name: &str) -> Option<VarId> {
        self.vars().find(|v| v.name == name).map(|v| v.id)
    }

    /// Frees every operator that does not contribute to `keep`. Handles to
    /// freed nodes become stale.
    pub fn prune(&mut self, keep: &[VarId]) -> GraftResult<usize> {
        for v in keep {
            self.try_var(*v)?;
        }
        let mut alive = HashSet::new();
        super::order::DepOprIter::new(self, |opr| {
            alive.insert(opr.id);
        })
        .extend(keep.iter().copied());
        let dead = self.oprs().filter(|o| !alive.contains(&o.id)).map(|o| o.id).collect_vec();
        for opr in &dead {
            if let Some(node) = self.oprs.remove(opr.handle) {
                for output in node.outputs {
                    self.vars.remove(output.handle);
                }
            }
        }
        for bucket in self.dedup.values_mut() {
            bucket.retain(|o| alive.contains(o));
        }
        self.dedup.retain(|_, bucket| !bucket.is_empty());
        debug!("Pruned {} operators, {} left", dead.len(), self.oprs.len());
        Ok(dead.len())
    }

    /// Makes this graph place its static arenas in `other`'s static memory.
    /// Executables of both graphs must never run concurrently.
    pub fn share_device_memory_with(&mut self, other: &ComputingGraph) {
        self.static_memory = other.static_memory.clone();
    }

    pub fn use_static_storage_pool(&mut self, pool: &StaticStoragePool) {
        self.static_memory.lock().set_pool(pool.clone());
    }

    pub fn set_device_memory_allocator(&mut self, allocator: Arc<dyn DeviceMemoryAllocator>) {
        self.static_memory.lock().clear();
        *self.runtime.allocator.write() = allocator;
    }

    pub fn device_memory_allocator(&self) -> Arc<dyn DeviceMemoryAllocator> {
        self.runtime.allocator()
    }

    /// Bytes of static memory held for this graph on `comp_node`.
    pub fn get_device_memory_size(&self, comp_node: CompNode) -> usize {
        self.static_memory.lock().size(comp_node)
    }

    /// Releases the static arenas. They are allocated again on next execution.
    pub fn clear_device_memory(&mut self) {
        self.static_memory.lock().clear()
    }

    pub fn record_async_error(&self, error: GraftError) {
        self.runtime.record_async_error(error)
    }

    pub fn take_async_errors(&self) -> Vec<GraftError> {
        self.runtime.take_async_errors()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::element_wise::{BinaryMode, Elemwise};

    #[test]
    fn dedup_returns_existing_operator() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor1(&[1.0, 2.0]))?;
        let b = graph.shared("b", tensor1(&[3.0, 4.0]))?;
        let x = graph.insert_opr("", Elemwise::binary(BinaryMode::Add), &[a, b])?;
        let y = graph.insert_opr("other", Elemwise::binary(BinaryMode::Add), &[a, b])?;
        assert_eq!(x, y);
        let z = graph.insert_opr("", Elemwise::binary(BinaryMode::Add), &[b, a])?;
        assert_ne!(x, z);
        assert_eq!(graph.nr_oprs_in_graph(), 4);
        Ok(())
    }

    #[test]
    fn foreign_inputs_are_rejected() -> GraftResult<()> {
        let mut g1 = ComputingGraph::make();
        let mut g2 = ComputingGraph::make();
        let a = g1.shared("a", tensor0(1.0))?;
        let b = g2.shared("b", tensor0(1.0))?;
        assert!(g2.insert_opr("", Elemwise::binary(BinaryMode::Add), &[a, b]).is_err());
        assert!(g2.try_var(a).is_err());
        Ok(())
    }

    #[test]
    fn auto_names() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor0(1.0))?;
        let b = graph.relu(a)?;
        assert_eq!(graph.var(a).name, "a");
        assert!(graph.var(b).name.starts_with("elemwise"));
        assert_eq!(graph.find_var_by_name("a"), Some(a));
        Ok(())
    }

    #[test]
    fn prune_makes_handles_stale() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor0(1.0))?;
        let b = graph.relu(a)?;
        let c = graph.neg(a)?;
        assert_eq!(graph.prune(&[b])?, 1);
        assert!(graph.try_var(c).is_err());
        assert_eq!(graph.nr_oprs_in_graph(), 2);
        let d = graph.neg(a)?;
        assert_ne!(c, d);
        assert!(graph.try_var(d).is_ok());
        Ok(())
    }

    #[test]
    fn comp_node_follows_first_input() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared_on(CompNode(1), "a", tensor0(1.0))?;
        let b = graph.relu(a)?;
        assert_eq!(graph.var(b).comp_node, CompNode(1));
        let c = graph.copy(b, CompNode(0))?;
        assert_eq!(graph.var(c).comp_node, CompNode(0));
        Ok(())
    }
}
