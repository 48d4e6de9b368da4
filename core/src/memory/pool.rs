use parking_lot::Mutex;

use super::{DeviceMemoryAllocator, DeviceStorage};
use crate::internal::*;

#[derive(Debug)]
struct PoolState {
    budget: usize,
    buffers: HashMap<CompNode, (Arc<dyn DeviceMemoryAllocator>, DeviceStorage)>,
}

/// One static buffer per comp node, shared by the static arenas of every
/// graph using the pool.
///
/// The buffer is allocated on first use with the budget, or with the
/// biggest arena requested so far if larger. It is only released by
/// [`StaticStoragePool::reset`]. Graphs using the same pool must never run
/// concurrently.
#[derive(Debug, Clone)]
pub struct StaticStoragePool(Arc<Mutex<PoolState>>);

impl StaticStoragePool {
    pub fn init(budget_per_device: usize) -> StaticStoragePool {
        info!("Static storage pool of {} bytes per device", budget_per_device);
        StaticStoragePool(Arc::new(Mutex::new(PoolState {
            budget: budget_per_device,
            buffers: HashMap::new(),
        })))
    }

    pub(crate) fn acquire(
        &self,
        allocator: &Arc<dyn DeviceMemoryAllocator>,
        comp_node: CompNode,
        size: usize,
    ) -> GraftResult<DeviceStorage> {
        let mut state = self.0.lock();
        if let Some((owner, buffer)) = state.buffers.get(&comp_node) {
            if Arc::ptr_eq(owner, allocator) && buffer.size >= size {
                return buffer.slice(0, size);
            }
        }
        if let Some((owner, buffer)) = state.buffers.remove(&comp_node) {
            debug!("Growing static pool buffer on {} from {} to {} bytes", comp_node, buffer.size, size);
            owner.free(&buffer)?;
        }
        let wanted = size.max(state.budget);
        let buffer = allocator
            .alloc_static(0, comp_node, wanted)
            .with_context(|| format!("Allocating static pool buffer of {wanted} bytes on {comp_node}"))?;
        state.buffers.insert(comp_node, (allocator.clone(), buffer));
        buffer.slice(0, size)
    }

    pub fn buffer_size(&self, comp_node: CompNode) -> usize {
        self.0.lock().buffers.get(&comp_node).map(|(_, b)| b.size).unwrap_or(0)
    }

    /// Releases the buffers. Graphs using the pool allocate a new one on their
    /// next execution.
    pub fn reset(&self) -> GraftResult<()> {
        let mut state = self.0.lock();
        for (_, (allocator, buffer)) in state.buffers.drain() {
            allocator.free(&buffer)?;
        }
        Ok(())
    }
}
