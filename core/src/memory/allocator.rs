use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use super::ALIGNMENT;
use crate::internal::*;

/// A range of bytes in the memory of a comp node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceStorage {
    pub comp_node: CompNode,
    pub offset: usize,
    pub size: usize,
}

impl DeviceStorage {
    pub fn empty(comp_node: CompNode) -> DeviceStorage {
        DeviceStorage { comp_node, offset: 0, size: 0 }
    }

    /// Sub-range of this storage.
    pub fn slice(&self, offset: usize, size: usize) -> GraftResult<DeviceStorage> {
        ensure!(
            offset + size <= self.size,
            "Slice {}..{} out of a storage of {} bytes",
            offset,
            offset + size,
            self.size
        );
        Ok(DeviceStorage { comp_node: self.comp_node, offset: self.offset + offset, size })
    }

    pub fn end(&self) -> usize {
        self.offset + self.size
    }
}

/// Recoverable allocation failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemAllocError {
    pub comp_node: CompNode,
    pub requested: usize,
    pub free: usize,
    pub largest_free: usize,
}

impl fmt::Display for MemAllocError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "Out of memory on {}: requested {} bytes, {} free, largest free block {}",
            self.comp_node, self.requested, self.free, self.largest_free
        )
    }
}

impl std::error::Error for MemAllocError {}

/// Device memory as seen by the planner.
///
/// `alloc_dynamic` must fail with a [`MemAllocError`] (inside the returned
/// error) when memory is exhausted, so that callers can defragment and retry.
pub trait DeviceMemoryAllocator: Send + Sync + fmt::Debug {
    fn alloc_static(&self, graph: u32, comp_node: CompNode, size: usize) -> GraftResult<DeviceStorage>;

    fn alloc_dynamic(&self, var: VarId, comp_node: CompNode, size: usize) -> GraftResult<DeviceStorage>;

    fn free(&self, storage: &DeviceStorage) -> GraftResult<()>;

    /// Called by the defragmenter once the live dynamic storages of a comp
    /// node have been released, before allocating them again.
    fn defrag_prealloc_contig(&self, _graph: u32, _comp_node: CompNode, _size: usize) -> GraftResult<()> {
        Ok(())
    }

    /// Static arenas are allocated again when this changes.
    fn static_alloc_version(&self, _graph: u32) -> u64 {
        0
    }

    fn read(&self, storage: &DeviceStorage, offset: usize, len: usize) -> GraftResult<Vec<u8>>;

    fn write(&self, storage: &DeviceStorage, offset: usize, bytes: &[u8]) -> GraftResult<()>;

    /// Bytes currently allocated on a comp node.
    fn usage(&self, comp_node: CompNode) -> usize;
}

pub(crate) fn aligned(size: usize) -> usize {
    size.div_ceil(ALIGNMENT) * ALIGNMENT
}

#[derive(Debug)]
struct Device {
    capacity: usize,
    /// offset -> len, coalesced
    free: BTreeMap<usize, usize>,
    used: usize,
    bytes: Vec<u8>,
}

impl Device {
    fn new(capacity: usize) -> Device {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Device { capacity, free, used: 0, bytes: vec![] }
    }

    fn largest_free(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    fn alloc(&mut self, comp_node: CompNode, size: usize) -> Result<usize, MemAllocError> {
        let wanted = aligned(size);
        let Some((&offset, &len)) = self.free.iter().find(|(_, len)| **len >= wanted) else {
            return Err(MemAllocError {
                comp_node,
                requested: size,
                free: self.capacity - self.used,
                largest_free: self.largest_free(),
            });
        };
        self.free.remove(&offset);
        if len > wanted {
            self.free.insert(offset + wanted, len - wanted);
        }
        self.used += wanted;
        if self.bytes.len() < offset + wanted {
            self.bytes.resize(offset + wanted, 0);
        }
        Ok(offset)
    }

    fn free(&mut self, offset: usize, size: usize) -> GraftResult<()> {
        let mut offset = offset;
        let mut len = aligned(size);
        ensure!(offset + len <= self.capacity, "Freeing {}..{} out of device memory", offset, offset + len);
        if let Some((&prev, &prev_len)) = self.free.range(..=offset).next_back() {
            ensure!(prev + prev_len <= offset, "Double free at offset {}", offset);
            if prev + prev_len == offset {
                self.free.remove(&prev);
                offset = prev;
                len += prev_len;
            }
        }
        if let Some((&next, &next_len)) = self.free.range(offset + 1..).next() {
            ensure!(offset + len <= next, "Double free at offset {}", next);
            if offset + len == next {
                self.free.remove(&next);
                len += next_len;
            }
        }
        self.free.insert(offset, len);
        self.used -= aligned(size);
        Ok(())
    }
}

/// Simulated devices: each comp node owns `capacity` bytes, handed out
/// first-fit from a coalescing free list. Tensor bytes really live there.
#[derive(Debug)]
pub struct DefaultAllocator {
    capacity: usize,
    devices: RwLock<HashMap<CompNode, Arc<Mutex<Device>>>>,
}

impl Default for DefaultAllocator {
    fn default() -> DefaultAllocator {
        DefaultAllocator::with_capacity(64 << 20)
    }
}

impl DefaultAllocator {
    pub fn with_capacity(capacity: usize) -> DefaultAllocator {
        DefaultAllocator { capacity, devices: RwLock::new(HashMap::new()) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn device(&self, comp_node: CompNode) -> Arc<Mutex<Device>> {
        if let Some(dev) = self.devices.read().get(&comp_node) {
            return dev.clone();
        }
        self.devices
            .write()
            .entry(comp_node)
            .or_insert_with(|| Arc::new(Mutex::new(Device::new(self.capacity))))
            .clone()
    }

    pub fn largest_free(&self, comp_node: CompNode) -> usize {
        self.device(comp_node).lock().largest_free()
    }

    fn alloc(&self, comp_node: CompNode, size: usize) -> GraftResult<DeviceStorage> {
        if size == 0 {
            return Ok(DeviceStorage::empty(comp_node));
        }
        let offset = self.device(comp_node).lock().alloc(comp_node, size)?;
        Ok(DeviceStorage { comp_node, offset, size })
    }
}

impl DeviceMemoryAllocator for DefaultAllocator {
    fn alloc_static(&self, graph: u32, comp_node: CompNode, size: usize) -> GraftResult<DeviceStorage> {
        let storage = self.alloc(comp_node, size)?;
        debug!("Static arena of graph {} on {}: {} bytes at {}", graph, comp_node, size, storage.offset);
        Ok(storage)
    }

    fn alloc_dynamic(&self, _var: VarId, comp_node: CompNode, size: usize) -> GraftResult<DeviceStorage> {
        self.alloc(comp_node, size)
    }

    fn free(&self, storage: &DeviceStorage) -> GraftResult<()> {
        if storage.size == 0 {
            return Ok(());
        }
        self.device(storage.comp_node).lock().free(storage.offset, storage.size)
    }

    /// Checks that a contiguous block of `size` bytes is available.
    fn defrag_prealloc_contig(&self, _graph: u32, comp_node: CompNode, size: usize) -> GraftResult<()> {
        if size == 0 {
            return Ok(());
        }
        let dev = self.device(comp_node);
        let mut dev = dev.lock();
        let offset = dev.alloc(comp_node, size)?;
        dev.free(offset, size)
    }

    fn read(&self, storage: &DeviceStorage, offset: usize, len: usize) -> GraftResult<Vec<u8>> {
        ensure!(offset + len <= storage.size, "Reading past the end of {:?}", storage);
        if len == 0 {
            return Ok(vec![]);
        }
        let dev = self.device(storage.comp_node);
        let dev = dev.lock();
        let start = storage.offset + offset;
        Ok(dev.bytes[start..start + len].to_vec())
    }

    fn write(&self, storage: &DeviceStorage, offset: usize, bytes: &[u8]) -> GraftResult<()> {
        ensure!(offset + bytes.len() <= storage.size, "Writing past the end of {:?}", storage);
        if bytes.is_empty() {
            return Ok(());
        }
        let dev = self.device(storage.comp_node);
        let mut dev = dev.lock();
        let start = storage.offset + offset;
        dev.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn usage(&self, comp_node: CompNode) -> usize {
        self.device(comp_node).lock().used
    }
}
