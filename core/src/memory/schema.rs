//! Static arena layout.
//!
//! Variables whose size is known before execution are packed in one arena
//! per comp node. Variables are grouped in partitions of pairwise disjoint
//! lifetimes; a partition is as big as its biggest variable, and partitions
//! are laid out one after the other.
use std::fmt;

use serde::Serialize;

use super::allocator::aligned;
use crate::internal::*;

/// Steps of the sequence during which a variable holds its value:
/// `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Lifetime {
    pub start: usize,
    pub end: usize,
}

impl Lifetime {
    pub fn is_disjoint(&self, other: &Lifetime) -> bool {
        self.start >= other.end || other.start >= self.end
    }

    pub fn is_alive_at_step(&self, step: usize) -> bool {
        self.start <= step && step < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }
}

/// Storage needed by one variable. `var` is the variable's index in the
/// graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct VarMemReq {
    pub var: usize,
    pub lifetime: Lifetime,
    pub size: usize,
}

/// Variables sharing a range of the arena.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Partition {
    pub vars: Vec<VarMemReq>,
}

impl Partition {
    pub fn size(&self) -> usize {
        self.vars.iter().map(|it| aligned(it.size)).max().unwrap_or(0)
    }

    pub fn has_no_conflict_with_lifetime(&self, lifetime: &Lifetime) -> bool {
        self.vars.iter().all(|n| n.lifetime.is_disjoint(lifetime))
    }

    pub fn find_var_alive_at_step(&self, step: usize) -> Option<&VarMemReq> {
        self.vars.iter().find(|it| it.lifetime.is_alive_at_step(step))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemSchema {
    pub by_partition: Vec<Partition>,
    /// `by_steps[step][partition]`: the variable alive in each partition.
    #[serde(skip)]
    pub by_steps: Vec<Vec<Option<VarMemReq>>>,
    offsets: HashMap<usize, usize>,
}

impl MemSchema {
    /// Lays out `reqs` for a sequence of `nr_steps` steps.
    ///
    /// With `plan_opt`, the biggest variables are placed first. Without
    /// `reuse`, each variable gets a partition of its own.
    pub fn build(
        mut reqs: Vec<VarMemReq>,
        nr_steps: usize,
        plan_opt: bool,
        reuse: bool,
    ) -> GraftResult<MemSchema> {
        for req in &reqs {
            ensure!(
                req.lifetime.start <= req.lifetime.end && req.lifetime.end <= nr_steps,
                "Lifetime {:?} of var {} outside of a {} steps sequence",
                req.lifetime,
                req.var,
                nr_steps
            );
        }
        if plan_opt {
            reqs.sort_by(|lhs, rhs| lhs.size.cmp(&rhs.size).reverse());
        }

        let mut partitions: Vec<Partition> = vec![];
        for req in reqs {
            if !reuse || req.lifetime.is_empty() {
                partitions.push(Partition { vars: vec![req] });
                continue;
            }
            let mut available = partitions
                .iter_mut()
                .filter(|it| !it.vars[0].lifetime.is_empty())
                .filter(|it| it.has_no_conflict_with_lifetime(&req.lifetime))
                .collect::<Vec<_>>();
            available.sort_by_cached_key(|p| -(p.vars.iter().map(|it| it.size).sum::<usize>() as i64));
            match available.first_mut() {
                Some(available) => available.vars.push(req),
                None => partitions.push(Partition { vars: vec![req] }),
            }
        }

        let by_steps = (0..nr_steps)
            .map(|step| partitions.iter().map(|p| p.find_var_alive_at_step(step).cloned()).collect())
            .collect();

        let mut offsets = HashMap::new();
        let mut cursor = 0;
        for partition in &partitions {
            for req in &partition.vars {
                offsets.insert(req.var, cursor);
            }
            cursor += partition.size();
        }

        Ok(MemSchema { by_partition: partitions, by_steps, offsets })
    }

    pub fn offset(&self, var: usize) -> Option<usize> {
        self.offsets.get(&var).copied()
    }

    pub fn size_by_partition(&self) -> Vec<usize> {
        self.by_partition.iter().map(|it| it.size()).collect()
    }

    /// Size of the arena.
    pub fn memory_size(&self) -> usize {
        self.by_partition.iter().map(|it| it.size()).sum()
    }

    /// Biggest amount of memory actually alive at a step. The difference
    /// with `memory_size` is the fragmentation introduced by the layout.
    pub fn peak_memory_size(&self) -> usize {
        self.by_steps
            .iter()
            .map(|alive| alive.iter().flatten().map(|it| aligned(it.size)).sum::<usize>())
            .max()
            .unwrap_or(0)
    }

    /// Ratio between peak memory and arena size. 1.0 means no fragmentation.
    pub fn usage(&self) -> f32 {
        let size = self.memory_size();
        if size == 0 {
            return 1.0;
        }
        self.peak_memory_size() as f32 / size as f32
    }

    pub fn iter_vars(&self) -> impl Iterator<Item = &VarMemReq> {
        self.by_partition.iter().flat_map(|p| p.vars.iter())
    }
}

impl fmt::Display for MemSchema {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        for (step, alive) in self.by_steps.iter().enumerate() {
            writeln!(
                fmt,
                "step: {:5} => |{}|",
                step,
                alive
                    .iter()
                    .map(|n| match n {
                        Some(it) => format!("{:^7}", it.var),
                        None => format!("{:^7}", "*"),
                    })
                    .join("|")
            )?;
        }
        writeln!(fmt, "memory_size: {}", self.memory_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn req(var: usize, start: usize, end: usize, size: usize) -> VarMemReq {
        VarMemReq { var, lifetime: Lifetime { start, end }, size }
    }

    #[test]
    fn lifetime_is_disjoint() {
        let l1 = Lifetime { start: 0, end: 5 };
        let l2 = Lifetime { start: 5, end: 10 };
        let l3 = Lifetime { start: 3, end: 7 };
        assert!(l1.is_disjoint(&l2));
        assert!(l2.is_disjoint(&l1));
        assert!(!l1.is_disjoint(&l3));
        assert!(!l3.is_disjoint(&l2));
    }

    #[test]
    fn lifetime_is_alive_at_step() {
        let lifetime = Lifetime { start: 5, end: 10 };
        assert!(!lifetime.is_alive_at_step(4));
        assert!(lifetime.is_alive_at_step(5));
        assert!(lifetime.is_alive_at_step(9));
        assert!(!lifetime.is_alive_at_step(10));
    }

    #[test]
    fn partition_find_var() {
        let a = req(1, 0, 5, 1000);
        let b = req(2, 5, 10, 2000);
        let partition = Partition { vars: vec![a.clone(), b.clone()] };
        assert!(!partition.has_no_conflict_with_lifetime(&Lifetime { start: 3, end: 7 }));
        assert_eq!(partition.find_var_alive_at_step(3), Some(&a));
        assert_eq!(partition.find_var_alive_at_step(7), Some(&b));
        assert_eq!(partition.find_var_alive_at_step(10), None);
        assert_eq!(partition.size(), 2048);
    }

    #[test]
    fn chain_reuses_two_partitions() -> GraftResult<()> {
        // a -> b -> c -> d, each read by the next step only
        let reqs = vec![req(0, 0, 2, 256), req(1, 1, 3, 256), req(2, 2, 4, 256), req(3, 3, 4, 256)];
        let schema = MemSchema::build(reqs, 4, true, true)?;
        assert_eq!(schema.by_partition.len(), 2);
        assert_eq!(schema.memory_size(), 512);
        assert_eq!(schema.offset(0), schema.offset(2));
        assert_ne!(schema.offset(0), schema.offset(1));
        assert_eq!(schema.usage(), 1.0);
        Ok(())
    }

    #[test]
    fn no_reuse_gives_one_partition_each() -> GraftResult<()> {
        let reqs = vec![req(0, 0, 1, 100), req(1, 1, 2, 100), req(2, 2, 3, 100)];
        let schema = MemSchema::build(reqs, 3, true, false)?;
        assert_eq!(schema.by_partition.len(), 3);
        assert_eq!(schema.memory_size(), 3 * 128);
        assert_eq!(schema.peak_memory_size(), 128);
        Ok(())
    }

    #[test]
    fn big_first_packs_tighter() -> GraftResult<()> {
        let reqs = vec![req(0, 0, 1, 64), req(1, 1, 2, 1024), req(2, 0, 2, 64)];
        let opt = MemSchema::build(reqs.clone(), 2, true, true)?;
        assert_eq!(opt.memory_size(), 1024 + 64);
        Ok(())
    }

    #[test]
    fn lifetime_out_of_sequence() {
        assert!(MemSchema::build(vec![req(0, 2, 5, 8)], 3, true, true).is_err());
    }

    fn reqs_strategy() -> impl Strategy<Value = (Vec<VarMemReq>, usize)> {
        (1usize..12).prop_flat_map(|nr_steps| {
            let one = (0..nr_steps, 1..=nr_steps, 1usize..4096)
                .prop_map(|(start, end, size)| (start.min(end), start.max(end), size));
            (proptest::collection::vec(one, 0..24), Just(nr_steps)).prop_map(|(reqs, nr_steps)| {
                let reqs = reqs
                    .into_iter()
                    .enumerate()
                    .map(|(var, (start, end, size))| req(var, start, end, size))
                    .collect();
                (reqs, nr_steps)
            })
        })
    }

    proptest! {
        #[test]
        fn overlapping_ranges_have_disjoint_lifetimes(
            (reqs, nr_steps) in reqs_strategy(),
            plan_opt in any::<bool>(),
            reuse in any::<bool>(),
        ) {
            let schema = MemSchema::build(reqs.clone(), nr_steps, plan_opt, reuse).unwrap();
            for a in &reqs {
                for b in &reqs {
                    if a.var >= b.var {
                        continue;
                    }
                    let (oa, ob) = (schema.offset(a.var).unwrap(), schema.offset(b.var).unwrap());
                    let overlap = oa < ob + b.size && ob < oa + a.size;
                    if overlap {
                        prop_assert!(a.lifetime.is_disjoint(&b.lifetime), "{:?} {:?}", a, b);
                    }
                }
                prop_assert!(schema.offset(a.var).unwrap() + a.size <= schema.memory_size());
            }
            prop_assert!(schema.peak_memory_size() <= schema.memory_size());
        }
    }
}
