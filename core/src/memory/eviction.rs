use std::sync::atomic::Ordering;

use super::allocator::aligned;
use super::dynamic::{DeviceState, DynamicMemory};
use crate::internal::*;

impl DynamicMemory {
    /// Lower is a better eviction candidate: cheap to recompute, big, and
    /// not used for long.
    fn eviction_score(config: &DtrConfig, cost: f64, size: usize, staleness: u64) -> f64 {
        cost.powf(config.recomp_time_factor)
            / ((size as f64).powf(config.recomp_memory_factor) * staleness.max(1) as f64)
    }

    fn pick_evictee(&self, dev: &DeviceState, current: VarId) -> Option<VarId> {
        let config = self.dtr.as_ref()?;
        dev.live
            .iter()
            .filter(|(var, live)| {
                **var != current
                    && live.storage.is_some()
                    && live.pins == 0
                    && live.size() >= config.evictee_minimum_size
                    && live.recompute.as_ref().is_some_and(|r| {
                        r.inputs.iter().all(|i| dev.live.get(i).is_some_and(|l| l.storage.is_some()))
                    })
            })
            .filter_map(|(var, live)| {
                let cost = live.recompute.as_ref()?.cost;
                let score = Self::eviction_score(config, cost, live.size(), dev.tick - live.last_use + 1);
                Some((score, *var))
            })
            .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)))
            .map(|(_, var)| var)
    }

    /// Evicts the best candidate. Returns the number of bytes freed.
    pub(super) fn evict_one(
        &self,
        dev: &mut DeviceState,
        comp_node: CompNode,
        current: VarId,
    ) -> GraftResult<Option<usize>> {
        let Some(var) = self.pick_evictee(dev, current) else { return Ok(None) };
        let Some(live) = dev.live.get_mut(&var) else { return Ok(None) };
        let Some(storage) = live.storage.take() else { return Ok(None) };
        let inputs = live.recompute.as_ref().map(|r| r.inputs.clone()).unwrap_or_default();
        self.allocator.free(&storage)?;
        dev.usage -= aligned(storage.size);
        dev.states.insert(var, super::VarMemState::Evicted);
        for input in inputs {
            if let Some(input) = dev.live.get_mut(&input) {
                input.refcnt += 1;
                input.pins += 1;
            }
        }
        self.evictions.fetch_add(1, Ordering::Relaxed);
        debug!("Evicted {:?} ({} bytes) on {}", var, storage.size, comp_node);
        Ok(Some(aligned(storage.size)))
    }

    /// Evicts until `size` bytes are freed or no candidate is left. Returns
    /// the number of bytes freed.
    pub(super) fn evict_for(
        &self,
        dev: &mut DeviceState,
        comp_node: CompNode,
        current: VarId,
        size: usize,
    ) -> GraftResult<usize> {
        let mut freed = 0;
        while freed < aligned(size) {
            match self.evict_one(dev, comp_node, current)? {
                Some(n) => freed += n,
                None => break,
            }
        }
        if freed > 0 {
            info!("Evicted {} bytes on {} to allocate {:?}", freed, comp_node, current);
        }
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{DefaultAllocator, DeviceMemoryAllocator, Loaded, Recompute, VarMemState};

    fn dtr_options(threshold: usize) -> Options {
        let mut options = Options::default();
        options.enable_dtr_memory_opt = true;
        options.dtr_config.eviction_threshold = threshold;
        options.dtr_config.evictee_minimum_size = 0;
        options
    }

    #[test]
    fn scores() {
        let config = DtrConfig::default();
        let cheap = DynamicMemory::eviction_score(&config, 10.0, 1000, 1);
        let costly = DynamicMemory::eviction_score(&config, 100.0, 1000, 1);
        let stale = DynamicMemory::eviction_score(&config, 10.0, 1000, 10);
        assert!(cheap < costly);
        assert!(stale < cheap);
    }

    #[test]
    fn evicted_value_pins_its_inputs() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor0(0.0))?;
        let b = graph.relu(a)?;
        let c = graph.neg(a)?;
        let cn = CompNode(0);
        let mem =
            DynamicMemory::new(graph.id(), Arc::new(DefaultAllocator::with_capacity(4096)), &dtr_options(160), [cn]);
        let t = Tensor::from_fn(DatumType::F32, &[16], |i| i as f32);
        mem.store(a, cn, &t, None, 1, None)?;
        let recipe = Recompute { step: 1, cost: 1.0, inputs: tvec!(a) };
        mem.store(b, cn, &t, None, 1, Some(recipe.clone()))?;
        // 128 bytes used, threshold 160: storing c evicts b, not its input a
        mem.store(c, cn, &t, None, 1, None)?;
        assert_eq!(mem.state(b, cn), VarMemState::Evicted);
        assert_eq!(mem.stats().evictions, 1);
        // a is read by its last planned reader but stays pinned for b
        mem.release(a, cn)?;
        assert_eq!(mem.state(a, cn), VarMemState::DynamicBound);
        let Loaded::Evicted(found) = mem.load(b, cn)? else { panic!() };
        assert_eq!(found, recipe);
        mem.restore(b, cn, &t)?;
        assert_eq!(mem.state(a, cn), VarMemState::Released);
        let Loaded::Value(back) = mem.load(b, cn)? else { panic!() };
        assert_eq!(back, t);
        assert_eq!(mem.stats().recomputations, 1);
        Ok(())
    }

    #[test]
    fn releasing_evicted_value_unpins() -> GraftResult<()> {
        let mut graph = ComputingGraph::make();
        let a = graph.shared("a", tensor0(0.0))?;
        let b = graph.relu(a)?;
        let c = graph.neg(a)?;
        let cn = CompNode(0);
        let allocator = Arc::new(DefaultAllocator::with_capacity(4096));
        let mem = DynamicMemory::new(graph.id(), allocator.clone(), &dtr_options(160), [cn]);
        let t = Tensor::from_fn(DatumType::F32, &[16], |i| i as f32);
        mem.store(a, cn, &t, None, 1, None)?;
        mem.store(b, cn, &t, None, 1, Some(Recompute { step: 1, cost: 1.0, inputs: tvec!(a) }))?;
        mem.store(c, cn, &t, None, 1, None)?;
        mem.release(a, cn)?;
        mem.release(b, cn)?;
        mem.release(c, cn)?;
        assert_eq!(mem.usage(cn), 0);
        assert_eq!(allocator.usage(cn), 0);
        Ok(())
    }
}
