use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use super::allocator::aligned;
use super::{DeviceMemoryAllocator, DeviceStorage, MemAllocError, VarMemState};
use crate::internal::*;

/// How to compute an evicted value again: the step of its producer and the
/// inputs that must stay resident meanwhile.
#[derive(Debug, Clone, PartialEq)]
pub struct Recompute {
    pub step: usize,
    pub cost: f64,
    pub inputs: TVec<VarId>,
}

#[derive(Debug)]
pub(super) struct LiveVar {
    pub storage: Option<DeviceStorage>,
    pub datum_type: DatumType,
    pub shape: TVec<usize>,
    /// Readers still to come, plus pins held by evicted consumers.
    pub refcnt: usize,
    pub pins: usize,
    pub last_use: u64,
    pub recompute: Option<Recompute>,
}

impl LiveVar {
    pub fn size(&self) -> usize {
        self.shape.iter().product::<usize>() * self.datum_type.size_of()
    }
}

#[derive(Debug, Default)]
pub(super) struct DeviceState {
    pub live: HashMap<VarId, LiveVar>,
    pub states: HashMap<VarId, VarMemState>,
    /// Bytes held by resident dynamic values.
    pub usage: usize,
    pub tick: u64,
}

/// Result of reading a dynamic value.
#[derive(Debug)]
pub enum Loaded {
    Value(Tensor),
    Evicted(Recompute),
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct DynamicStats {
    pub allocations: usize,
    pub defragmentations: usize,
    pub evictions: usize,
    pub recomputations: usize,
}

/// Reference counted storage of the dynamic variables of one executable.
///
/// All bookkeeping of a comp node, and every byte access to its dynamic
/// values, happens under one lock per comp node.
#[derive(Debug)]
pub struct DynamicMemory {
    pub(super) graph: u32,
    pub(super) allocator: Arc<dyn DeviceMemoryAllocator>,
    pub(super) defragment: bool,
    pub(super) dtr: Option<DtrConfig>,
    devices: HashMap<CompNode, Mutex<DeviceState>>,
    allocations: AtomicUsize,
    pub(super) defragmentations: AtomicUsize,
    pub(super) evictions: AtomicUsize,
    recomputations: AtomicUsize,
}

impl DynamicMemory {
    pub fn new(
        graph: u32,
        allocator: Arc<dyn DeviceMemoryAllocator>,
        options: &Options,
        comp_nodes: impl IntoIterator<Item = CompNode>,
    ) -> DynamicMemory {
        DynamicMemory {
            graph,
            allocator,
            defragment: options.enable_var_mem_defragment,
            dtr: options.enable_dtr_memory_opt.then(|| options.dtr_config.clone()),
            devices: comp_nodes.into_iter().map(|cn| (cn, Mutex::default())).collect(),
            allocations: AtomicUsize::new(0),
            defragmentations: AtomicUsize::new(0),
            evictions: AtomicUsize::new(0),
            recomputations: AtomicUsize::new(0),
        }
    }

    fn device(&self, comp_node: CompNode) -> GraftResult<&Mutex<DeviceState>> {
        self.devices.get(&comp_node).with_context(|| format!("{comp_node} is not used by this sequence"))
    }

    pub fn stats(&self) -> DynamicStats {
        DynamicStats {
            allocations: self.allocations.load(Ordering::Relaxed),
            defragmentations: self.defragmentations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            recomputations: self.recomputations.load(Ordering::Relaxed),
        }
    }

    pub fn state(&self, var: VarId, comp_node: CompNode) -> VarMemState {
        self.device(comp_node)
            .ok()
            .and_then(|dev| dev.lock().states.get(&var).copied())
            .unwrap_or(VarMemState::DynamicPending)
    }

    /// Bytes held by resident dynamic values on a comp node.
    pub fn usage(&self, comp_node: CompNode) -> usize {
        self.device(comp_node).map(|dev| dev.lock().usage).unwrap_or(0)
    }

    /// Forgets about values of a previous execution.
    pub fn reset(&self) -> GraftResult<()> {
        for dev in self.devices.values() {
            let mut dev = dev.lock();
            for (_, live) in dev.live.drain() {
                if let Some(storage) = live.storage {
                    self.allocator.free(&storage)?;
                }
            }
            dev.states.clear();
            dev.usage = 0;
        }
        Ok(())
    }

    /// Allocates the storage of `var` and writes `value` in it.
    ///
    /// `expected` is the shape known before execution, if any: the requested
    /// size must match it. The value is released after `readers` calls to
    /// [`DynamicMemory::release`].
    pub fn store(
        &self,
        var: VarId,
        comp_node: CompNode,
        value: &Tensor,
        expected: Option<&[usize]>,
        readers: usize,
        recompute: Option<Recompute>,
    ) -> GraftResult<()> {
        if let Some(expected) = expected {
            ensure!(
                expected == value.shape(),
                "Dynamic allocation of {:?}: value has shape {:?}, inferred shape is {:?}",
                var,
                value.shape(),
                expected
            );
        }
        if readers == 0 {
            let mut dev = self.device(comp_node)?.lock();
            dev.states.insert(var, VarMemState::Released);
            return Ok(());
        }
        let size = value.shape().iter().product::<usize>() * value.datum_type().size_of();
        let mut dev = self.device(comp_node)?.lock();
        let storage = self.alloc(&mut dev, var, comp_node, size)?;
        self.allocator.write(&storage, 0, &value.to_bytes())?;
        let last_use = dev.tick;
        dev.live.insert(
            var,
            LiveVar {
                storage: Some(storage),
                datum_type: value.datum_type(),
                shape: value.shape().into(),
                refcnt: readers,
                pins: 0,
                last_use,
                recompute,
            },
        );
        dev.usage += aligned(size);
        dev.states.insert(var, VarMemState::DynamicBound);
        Ok(())
    }

    /// Allocation with a single recovery attempt.
    fn alloc(
        &self,
        dev: &mut DeviceState,
        var: VarId,
        comp_node: CompNode,
        size: usize,
    ) -> GraftResult<DeviceStorage> {
        if let Some(dtr) = &self.dtr {
            if dtr.eviction_threshold > 0 {
                while dev.usage + aligned(size) > dtr.eviction_threshold {
                    if self.evict_one(dev, comp_node, var)?.is_none() {
                        break;
                    }
                }
            }
        }
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let error = match self.allocator.alloc_dynamic(var, comp_node, size) {
            Ok(storage) => return Ok(storage),
            Err(e) => e,
        };
        let Some(oom) = error.downcast_ref::<MemAllocError>().cloned() else {
            return Err(error);
        };
        let recovered = if self.dtr.is_some() && self.evict_for(dev, comp_node, var, size)? > 0 {
            true
        } else if self.defragment {
            self.defragment(dev, comp_node)?;
            true
        } else {
            false
        };
        if !recovered {
            return Err(error).with_context(|| format!("Allocating {size} bytes for {var:?}"));
        }
        debug!("Retrying allocation of {} bytes for {:?} after {}", size, var, oom);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.allocator
            .alloc_dynamic(var, comp_node, size)
            .with_context(|| format!("Allocating {size} bytes for {var:?} after recovery from: {oom}"))
    }

    /// Reads the value of `var`, or how to compute it again if evicted.
    pub fn load(&self, var: VarId, comp_node: CompNode) -> GraftResult<Loaded> {
        let mut dev = self.device(comp_node)?.lock();
        dev.tick += 1;
        let tick = dev.tick;
        let live = dev
            .live
            .get_mut(&var)
            .with_context(|| format!("{var:?} has no live dynamic storage on {comp_node}"))?;
        live.last_use = tick;
        match live.storage {
            Some(storage) => {
                let bytes = self.allocator.read(&storage, 0, storage.size)?;
                Ok(Loaded::Value(Tensor::from_bytes(live.datum_type, &live.shape, &bytes)?))
            }
            None => Ok(Loaded::Evicted(
                live.recompute.clone().with_context(|| format!("{var:?} was evicted without recipe"))?,
            )),
        }
    }

    /// Puts back an evicted value once computed again, and unpins the inputs
    /// it needed.
    pub fn restore(&self, var: VarId, comp_node: CompNode, value: &Tensor) -> GraftResult<()> {
        let mut dev = self.device(comp_node)?.lock();
        let (size, inputs) = match dev.live.get(&var) {
            Some(live) if live.storage.is_none() => {
                ensure!(
                    &*live.shape == value.shape(),
                    "Recomputed {:?} with shape {:?}, expected {:?}",
                    var,
                    value.shape(),
                    live.shape
                );
                (live.size(), live.recompute.as_ref().map(|r| r.inputs.clone()).unwrap_or_default())
            }
            // restored meanwhile by another reader
            Some(_) => return Ok(()),
            None => bail!("Restoring {:?}, which is not live", var),
        };
        let storage = self.alloc(&mut dev, var, comp_node, size)?;
        self.allocator.write(&storage, 0, &value.to_bytes())?;
        if let Some(live) = dev.live.get_mut(&var) {
            live.storage = Some(storage);
        }
        dev.usage += aligned(size);
        dev.states.insert(var, VarMemState::DynamicBound);
        self.recomputations.fetch_add(1, Ordering::Relaxed);
        trace!("Recomputed {:?}", var);
        for input in inputs {
            self.unpin(&mut dev, input)?;
        }
        Ok(())
    }

    /// One reader of `var` is done.
    pub fn release(&self, var: VarId, comp_node: CompNode) -> GraftResult<()> {
        let mut dev = self.device(comp_node)?.lock();
        self.release_locked(&mut dev, var)
    }

    pub(super) fn unpin(&self, dev: &mut DeviceState, var: VarId) -> GraftResult<()> {
        if let Some(live) = dev.live.get_mut(&var) {
            live.pins = live.pins.saturating_sub(1);
        }
        self.release_locked(dev, var)
    }

    fn release_locked(&self, dev: &mut DeviceState, var: VarId) -> GraftResult<()> {
        let mut todo = vec![var];
        while let Some(var) = todo.pop() {
            let Some(live) = dev.live.get_mut(&var) else {
                bail!("Releasing {:?}, which is not live", var)
            };
            live.refcnt -= 1;
            if live.refcnt > 0 {
                continue;
            }
            let Some(live) = dev.live.remove(&var) else { continue };
            match live.storage {
                Some(storage) => {
                    self.allocator.free(&storage)?;
                    dev.usage -= aligned(storage.size);
                }
                // evicted values pin their inputs
                None => {
                    for input in live.recompute.iter().flat_map(|r| r.inputs.iter()) {
                        if let Some(l) = dev.live.get_mut(input) {
                            l.pins = l.pins.saturating_sub(1);
                        }
                        todo.push(*input);
                    }
                }
            }
            dev.states.insert(var, VarMemState::Released);
        }
        Ok(())
    }
}

impl Drop for DynamicMemory {
    fn drop(&mut self) {
        if let Err(e) = self.reset() {
            warn!("Releasing dynamic memory: {:?}", e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::DefaultAllocator;

    /// Fails the first `failures` dynamic allocations, counting calls.
    #[derive(Debug)]
    pub struct FailingAllocator {
        pub inner: DefaultAllocator,
        pub failures: Mutex<usize>,
        pub dynamic_calls: AtomicUsize,
        pub defrag_calls: AtomicUsize,
    }

    impl FailingAllocator {
        pub fn new(failures: usize) -> FailingAllocator {
            FailingAllocator {
                inner: DefaultAllocator::with_capacity(1 << 20),
                failures: Mutex::new(failures),
                dynamic_calls: AtomicUsize::new(0),
                defrag_calls: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceMemoryAllocator for FailingAllocator {
        fn alloc_static(&self, graph: u32, cn: CompNode, size: usize) -> GraftResult<DeviceStorage> {
            self.inner.alloc_static(graph, cn, size)
        }

        fn alloc_dynamic(&self, var: VarId, cn: CompNode, size: usize) -> GraftResult<DeviceStorage> {
            self.dynamic_calls.fetch_add(1, Ordering::SeqCst);
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(MemAllocError { comp_node: cn, requested: size, free: 0, largest_free: 0 }.into());
            }
            self.inner.alloc_dynamic(var, cn, size)
        }

        fn free(&self, storage: &DeviceStorage) -> GraftResult<()> {
            self.inner.free(storage)
        }

        fn defrag_prealloc_contig(&self, graph: u32, cn: CompNode, size: usize) -> GraftResult<()> {
            self.defrag_calls.fetch_add(1, Ordering::SeqCst);
            self.inner.defrag_prealloc_contig(graph, cn, size)
        }

        fn read(&self, s: &DeviceStorage, offset: usize, len: usize) -> GraftResult<Vec<u8>> {
            self.inner.read(s, offset, len)
        }

        fn write(&self, s: &DeviceStorage, offset: usize, bytes: &[u8]) -> GraftResult<()> {
            self.inner.write(s, offset, bytes)
        }

        fn usage(&self, cn: CompNode) -> usize {
            self.inner.usage(cn)
        }
    }

    fn some_vars(n: usize) -> GraftResult<(ComputingGraph, Vec<VarId>)> {
        let mut graph = ComputingGraph::make();
        let vars = (0..n).map(|i| graph.shared("", tensor0(i as f32))).collect::<GraftResult<_>>()?;
        Ok((graph, vars))
    }

    #[test]
    fn refcount_frees_at_zero() -> GraftResult<()> {
        let (_graph, vars) = some_vars(1)?;
        let allocator: Arc<dyn DeviceMemoryAllocator> = Arc::new(DefaultAllocator::with_capacity(4096));
        let mem = DynamicMemory::new(1, allocator.clone(), &Options::default(), [CompNode(0)]);
        let cn = CompNode(0);
        let v = tensor1(&[1.0, 2.0, 3.0]);
        mem.store(vars[0], cn, &v, Some(&[3]), 2, None)?;
        assert_eq!(mem.state(vars[0], cn), VarMemState::DynamicBound);
        let Loaded::Value(read) = mem.load(vars[0], cn)? else { panic!() };
        assert_eq!(read, v);
        mem.release(vars[0], cn)?;
        assert_eq!(allocator.usage(cn), 64);
        mem.release(vars[0], cn)?;
        assert_eq!(allocator.usage(cn), 0);
        assert_eq!(mem.state(vars[0], cn), VarMemState::Released);
        assert!(mem.release(vars[0], cn).is_err());
        Ok(())
    }

    #[test]
    fn size_must_match_inferred_shape() -> GraftResult<()> {
        let (_graph, vars) = some_vars(1)?;
        let mem = DynamicMemory::new(1, Arc::new(DefaultAllocator::default()), &Options::default(), [CompNode(0)]);
        assert!(mem.store(vars[0], CompNode(0), &tensor1(&[1.0]), Some(&[2]), 1, None).is_err());
        Ok(())
    }

    #[test]
    fn one_failure_is_recovered() -> GraftResult<()> {
        let (_graph, vars) = some_vars(1)?;
        let allocator = Arc::new(FailingAllocator::new(1));
        let mem = DynamicMemory::new(1, allocator.clone(), &Options::default(), [CompNode(0)]);
        mem.store(vars[0], CompNode(0), &tensor1(&[1.0]), None, 1, None)?;
        assert_eq!(allocator.dynamic_calls.load(Ordering::SeqCst), 2);
        assert_eq!(allocator.defrag_calls.load(Ordering::SeqCst), 1);
        assert_eq!(mem.stats().defragmentations, 1);
        Ok(())
    }

    #[test]
    fn two_failures_are_fatal() -> GraftResult<()> {
        let (_graph, vars) = some_vars(1)?;
        let allocator = Arc::new(FailingAllocator::new(2));
        let mem = DynamicMemory::new(1, allocator.clone(), &Options::default(), [CompNode(0)]);
        let err = mem.store(vars[0], CompNode(0), &tensor1(&[1.0]), None, 1, None).unwrap_err();
        assert!(err.downcast_ref::<MemAllocError>().is_some());
        assert_eq!(allocator.dynamic_calls.load(Ordering::SeqCst), 2);
        Ok(())
    }

    #[test]
    fn no_defragmentation_no_retry() -> GraftResult<()> {
        let (_graph, vars) = some_vars(1)?;
        let allocator = Arc::new(FailingAllocator::new(1));
        let mut options = Options::default();
        options.enable_var_mem_defragment = false;
        let mem = DynamicMemory::new(1, allocator.clone(), &options, [CompNode(0)]);
        assert!(mem.store(vars[0], CompNode(0), &tensor1(&[1.0]), None, 1, None).is_err());
        assert_eq!(allocator.dynamic_calls.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
