use super::{DeviceMemoryAllocator, DeviceStorage, StaticStoragePool};
use crate::internal::*;

#[derive(Debug, Clone, Copy)]
struct Arena {
    storage: DeviceStorage,
    pooled: bool,
}

/// Static arenas of one graph (or of several graphs sharing device memory),
/// one per comp node. Arenas only grow, so that an executable compiled for
/// smaller shapes can reuse them.
#[derive(Debug, Default)]
pub(crate) struct StaticMemory {
    arenas: HashMap<CompNode, Arena>,
    version: Option<u64>,
    allocator: Option<Arc<dyn DeviceMemoryAllocator>>,
    pool: Option<StaticStoragePool>,
}

impl StaticMemory {
    pub fn set_pool(&mut self, pool: StaticStoragePool) {
        self.clear();
        self.pool = Some(pool);
    }

    pub fn size(&self, comp_node: CompNode) -> usize {
        self.arenas.get(&comp_node).map(|a| a.storage.size).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        if let Some(allocator) = &self.allocator {
            for (cn, arena) in self.arenas.drain() {
                if !arena.pooled {
                    if let Err(e) = allocator.free(&arena.storage) {
                        warn!("Failed to release static arena on {}: {:?}", cn, e);
                    }
                }
            }
        }
        self.arenas.clear();
        self.version = None;
    }

    /// Arenas of at least the required size on each comp node. Returns true
    /// when some arena moved, invalidating values stored there.
    pub fn ensure(
        &mut self,
        allocator: &Arc<dyn DeviceMemoryAllocator>,
        graph: u32,
        requirements: &HashMap<CompNode, usize>,
    ) -> GraftResult<(HashMap<CompNode, DeviceStorage>, bool)> {
        let version = allocator.static_alloc_version(graph);
        let same_allocator = self.allocator.as_ref().is_some_and(|a| Arc::ptr_eq(a, allocator));
        let mut moved = false;
        if !same_allocator || self.version != Some(version) {
            if self.version.is_some() {
                debug!("Static allocation version of graph {} is now {}, reallocating", graph, version);
            }
            moved = !self.arenas.is_empty();
            self.clear();
            self.allocator = Some(allocator.clone());
            self.version = Some(version);
        }
        for (&cn, &size) in requirements.iter().sorted_by_key(|(cn, _)| **cn) {
            if self.size(cn) >= size && self.arenas.contains_key(&cn) {
                continue;
            }
            if let Some(old) = self.arenas.remove(&cn) {
                moved = true;
                if !old.pooled {
                    allocator.free(&old.storage)?;
                }
            }
            let arena = match &self.pool {
                Some(pool) => Arena { storage: pool.acquire(allocator, cn, size)?, pooled: true },
                None => Arena {
                    storage: allocator
                        .alloc_static(graph, cn, size)
                        .with_context(|| format!("Allocating static arena of {size} bytes on {cn}"))?,
                    pooled: false,
                },
            };
            debug!("Static arena on {}: {} bytes", cn, size);
            self.arenas.insert(cn, arena);
        }
        let storages = requirements
            .keys()
            .filter_map(|cn| self.arenas.get(cn).map(|a| (*cn, a.storage)))
            .collect();
        Ok((storages, moved))
    }
}

impl Drop for StaticMemory {
    fn drop(&mut self) {
        self.clear()
    }
}
