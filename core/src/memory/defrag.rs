use std::sync::atomic::Ordering;

use super::allocator::aligned;
use super::dynamic::{DeviceState, DynamicMemory};
use super::VarMemState;
use crate::internal::*;

impl DynamicMemory {
    /// Compacts the resident dynamic values of a comp node: they are copied
    /// to host, freed, then allocated again in offset order, which closes
    /// the holes between them.
    pub(super) fn defragment(&self, dev: &mut DeviceState, comp_node: CompNode) -> GraftResult<()> {
        let resident = dev
            .live
            .iter()
            .filter_map(|(var, live)| live.storage.map(|s| (*var, s)))
            .sorted_by_key(|(_, s)| s.offset)
            .collect_vec();
        let mut saved = Vec::with_capacity(resident.len());
        for (var, storage) in &resident {
            saved.push((*var, self.allocator.read(storage, 0, storage.size)?));
        }
        for (var, storage) in &resident {
            self.allocator.free(storage)?;
            if let Some(live) = dev.live.get_mut(var) {
                live.storage = None;
            }
        }
        let total = saved.iter().map(|(_, bytes)| aligned(bytes.len())).sum::<usize>();
        if let Err(e) = self.allocator.defrag_prealloc_contig(self.graph, comp_node, total) {
            warn!("No contiguous block of {} bytes on {} after releasing dynamic storage: {}", total, comp_node, e);
        }
        for (ix, (var, bytes)) in saved.iter().enumerate() {
            if let Err(e) = self.move_back(dev, *var, comp_node, bytes) {
                // values not moved back are lost
                for (lost, bytes) in &saved[ix..] {
                    dev.live.remove(lost);
                    dev.usage -= aligned(bytes.len());
                    dev.states.insert(*lost, VarMemState::Released);
                }
                warn!("Defragmentation of {} lost {} dynamic values", comp_node, saved.len() - ix);
                return Err(e);
            }
        }
        self.defragmentations.fetch_add(1, Ordering::Relaxed);
        info!("Defragmented {} dynamic values ({} bytes) on {}", saved.len(), total, comp_node);
        Ok(())
    }

    fn move_back(&self, dev: &mut DeviceState, var: VarId, comp_node: CompNode, bytes: &[u8]) -> GraftResult<()> {
        let storage = self
            .allocator
            .alloc_dynamic(var, comp_node, bytes.len())
            .with_context(|| format!("Moving {var:?} back to {comp_node} while defragmenting"))?;
        if let Err(e) = self.allocator.write(&storage, 0, bytes) {
            self.allocator.free(&storage)?;
            return Err(e);
        }
        if let Some(live) = dev.live.get_mut(&var) {
            live.storage = Some(storage);
        }
        Ok(())
    }
}
