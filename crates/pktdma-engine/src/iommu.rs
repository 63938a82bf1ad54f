//! Software IOMMU.
//!
//! A [`DmaPlatform`] that hands out bus addresses from a private I/O virtual
//! address space and remembers which CPU memory each address covers. The
//! device side of a transfer is emulated with [`SoftIommu::device_write`] and
//! [`SoftIommu::device_read`], which resolve a bus address back to memory the
//! same way a real IOMMU would, and refuse access through mappings that are
//! gone or point the wrong way.
//!
//! Every primitive is counted so callers can verify exactly which DMA
//! operations a code path performed.

use crate::dma::{DmaAddr, DmaAttrs, DmaDirection, DmaPlatform, DmaRegion};
use crate::numa;
use pktdma_core::{MemoryError, align_up};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tracing::{trace, warn};

const IOVA_BASE: u64 = 0x1000_0000;
const IOVA_GRANULE: usize = 4096;

/// Device-side access errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IommuError {
    /// No live mapping covers the address range
    #[error("no mapping covers {addr:#x}+{len}")]
    Unmapped {
        /// Bus address
        addr: u64,
        /// Access length
        len: usize,
    },

    /// Mapping direction forbids the access
    #[error("mapping at {addr:#x} does not permit device {access}")]
    Direction {
        /// Bus address
        addr: u64,
        /// "read" or "write"
        access: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapKind {
    Single,
    Page,
    Coherent,
}

#[derive(Debug, Clone, Copy)]
struct Mapping {
    cpu: usize,
    len: usize,
    dir: DmaDirection,
    kind: MapKind,
}

/// Counters for every DMA primitive
#[derive(Debug, Default)]
struct IommuStats {
    map_single: AtomicU64,
    unmap_single: AtomicU64,
    map_page: AtomicU64,
    unmap_page: AtomicU64,
    sync_for_device: AtomicU64,
    sync_for_cpu: AtomicU64,
    alloc_coherent: AtomicU64,
    free_coherent: AtomicU64,
    map_failures: AtomicU64,
}

/// Snapshot of [`SoftIommu`] call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IommuCounts {
    /// `map_single` calls
    pub map_single: u64,
    /// `unmap_single` calls
    pub unmap_single: u64,
    /// `map_page` calls
    pub map_page: u64,
    /// `unmap_page` calls
    pub unmap_page: u64,
    /// `sync_for_device` calls
    pub sync_for_device: u64,
    /// `sync_for_cpu` calls
    pub sync_for_cpu: u64,
    /// `alloc_coherent` calls
    pub alloc_coherent: u64,
    /// `free_coherent` calls
    pub free_coherent: u64,
    /// Injected mapping failures
    pub map_failures: u64,
}

impl IommuCounts {
    /// Total map calls of either kind
    pub fn maps(&self) -> u64 {
        self.map_single + self.map_page
    }

    /// Total unmap calls of either kind
    pub fn unmaps(&self) -> u64 {
        self.unmap_single + self.unmap_page
    }
}

/// Software IOMMU platform
#[derive(Debug)]
pub struct SoftIommu {
    next_iova: AtomicU64,
    mappings: Mutex<BTreeMap<u64, Mapping>>,
    stats: IommuStats,
    fail_maps: AtomicU32,
    node: AtomicUsize,
}

impl Default for SoftIommu {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftIommu {
    /// Create an IOMMU reporting the caller's NUMA node
    pub fn new() -> Self {
        Self::with_node(numa::current_numa_node())
    }

    /// Create an IOMMU reporting a fixed NUMA node
    pub fn with_node(node: usize) -> Self {
        Self {
            next_iova: AtomicU64::new(IOVA_BASE),
            mappings: Mutex::new(BTreeMap::new()),
            stats: IommuStats::default(),
            fail_maps: AtomicU32::new(0),
            node: AtomicUsize::new(node),
        }
    }

    /// Change the node reported by [`DmaPlatform::numa_node`]
    pub fn set_numa_node(&self, node: usize) {
        self.node.store(node, Ordering::Relaxed);
    }

    /// Make the next `count` map calls fail
    pub fn fail_next_maps(&self, count: u32) {
        self.fail_maps.store(count, Ordering::Release);
    }

    /// Snapshot of the call counters
    pub fn counts(&self) -> IommuCounts {
        let s = &self.stats;
        IommuCounts {
            map_single: s.map_single.load(Ordering::Relaxed),
            unmap_single: s.unmap_single.load(Ordering::Relaxed),
            map_page: s.map_page.load(Ordering::Relaxed),
            unmap_page: s.unmap_page.load(Ordering::Relaxed),
            sync_for_device: s.sync_for_device.load(Ordering::Relaxed),
            sync_for_cpu: s.sync_for_cpu.load(Ordering::Relaxed),
            alloc_coherent: s.alloc_coherent.load(Ordering::Relaxed),
            free_coherent: s.free_coherent.load(Ordering::Relaxed),
            map_failures: s.map_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of live streaming mappings
    pub fn live_mappings(&self) -> usize {
        self.lock()
            .values()
            .filter(|m| m.kind != MapKind::Coherent)
            .count()
    }

    /// Whether `addr` falls inside a live mapping
    pub fn is_mapped(&self, addr: DmaAddr) -> bool {
        self.lookup(addr.as_u64(), 1).is_some()
    }

    /// Emulate the device writing `data` at `addr`
    pub fn device_write(&self, addr: DmaAddr, data: &[u8]) -> Result<(), IommuError> {
        let (cpu, mapping) =
            self.lookup(addr.as_u64(), data.len())
                .ok_or(IommuError::Unmapped {
                    addr: addr.as_u64(),
                    len: data.len(),
                })?;
        if !mapping.dir.device_writes() {
            return Err(IommuError::Direction {
                addr: addr.as_u64(),
                access: "write",
            });
        }

        // SAFETY: the mapping covers `data.len()` bytes at `cpu`, and a live
        // mapping means the memory belongs to the device until it is synced
        // back or unmapped.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), cpu as *mut u8, data.len());
        }
        Ok(())
    }

    /// Emulate the device reading `len` bytes at `addr`
    pub fn device_read(&self, addr: DmaAddr, len: usize) -> Result<Vec<u8>, IommuError> {
        let (cpu, mapping) = self.lookup(addr.as_u64(), len).ok_or(IommuError::Unmapped {
            addr: addr.as_u64(),
            len,
        })?;
        if !mapping.dir.device_reads() {
            return Err(IommuError::Direction {
                addr: addr.as_u64(),
                access: "read",
            });
        }

        // SAFETY: the mapping covers `len` bytes at `cpu` (checked by lookup).
        let bytes = unsafe { std::slice::from_raw_parts(cpu as *const u8, len) };
        Ok(bytes.to_vec())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Mapping>> {
        self.mappings
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(&self, addr: u64, len: usize) -> Option<(usize, Mapping)> {
        let table = self.lock();
        let (&start, mapping) = table.range(..=addr).next_back()?;
        let off = (addr - start) as usize;
        if off + len > mapping.len {
            return None;
        }
        Some((mapping.cpu + off, *mapping))
    }

    fn insert(&self, cpu: NonNull<u8>, len: usize, dir: DmaDirection, kind: MapKind) -> DmaAddr {
        let span = align_up(len.max(1), IOVA_GRANULE) as u64;
        let iova = self.next_iova.fetch_add(span, Ordering::Relaxed);
        self.lock().insert(
            iova,
            Mapping {
                cpu: cpu.as_ptr() as usize,
                len,
                dir,
                kind,
            },
        );
        trace!("iommu map {:#x}+{} -> {:p} ({:?})", iova, len, cpu, kind);
        DmaAddr::new(iova)
    }

    fn remove(&self, addr: DmaAddr, kind: MapKind) {
        match self.lock().remove(&addr.as_u64()) {
            Some(m) if m.kind == kind => {}
            Some(m) => warn!(
                "iommu: {} unmapped as {:?} but mapped as {:?}",
                addr, kind, m.kind
            ),
            None => warn!("iommu: unmap of unknown address {}", addr),
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.fail_maps
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DmaPlatform for SoftIommu {
    fn alloc_coherent(&self, size: usize) -> Result<DmaRegion, MemoryError> {
        self.stats.alloc_coherent.fetch_add(1, Ordering::Relaxed);
        let layout = Layout::from_size_align(size.max(1), IOVA_GRANULE)
            .map_err(|_| MemoryError::Alloc { size })?;
        // SAFETY: layout has non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(MemoryError::Alloc { size })?;
        let bus = self.insert(ptr, size, DmaDirection::Bidirectional, MapKind::Coherent);
        // SAFETY: `ptr` owns `size` bytes and `bus` maps exactly that memory.
        Ok(unsafe { DmaRegion::new(ptr, bus, size) })
    }

    fn free_coherent(&self, region: DmaRegion) {
        self.stats.free_coherent.fetch_add(1, Ordering::Relaxed);
        self.remove(region.bus_base(), MapKind::Coherent);
        // SAFETY: the region came from alloc_coherent with this layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(region.size().max(1), IOVA_GRANULE);
            dealloc(region.cpu_base().as_ptr(), layout);
        }
    }

    fn map_single(
        &self,
        cpu: NonNull<u8>,
        len: usize,
        dir: DmaDirection,
    ) -> Result<DmaAddr, MemoryError> {
        self.stats.map_single.fetch_add(1, Ordering::Relaxed);
        if self.take_injected_failure() {
            self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
            return Err(MemoryError::Mapping { len });
        }
        Ok(self.insert(cpu, len, dir, MapKind::Single))
    }

    fn unmap_single(&self, addr: DmaAddr, _len: usize, _dir: DmaDirection) {
        self.stats.unmap_single.fetch_add(1, Ordering::Relaxed);
        self.remove(addr, MapKind::Single);
    }

    fn map_page(
        &self,
        cpu: NonNull<u8>,
        len: usize,
        dir: DmaDirection,
        _attrs: DmaAttrs,
    ) -> Result<DmaAddr, MemoryError> {
        self.stats.map_page.fetch_add(1, Ordering::Relaxed);
        if self.take_injected_failure() {
            self.stats.map_failures.fetch_add(1, Ordering::Relaxed);
            return Err(MemoryError::Mapping { len });
        }
        Ok(self.insert(cpu, len, dir, MapKind::Page))
    }

    fn unmap_page(&self, addr: DmaAddr, _len: usize, _dir: DmaDirection, _attrs: DmaAttrs) {
        self.stats.unmap_page.fetch_add(1, Ordering::Relaxed);
        self.remove(addr, MapKind::Page);
    }

    fn sync_for_device(&self, addr: DmaAddr, offset: usize, len: usize, _dir: DmaDirection) {
        self.stats.sync_for_device.fetch_add(1, Ordering::Relaxed);
        trace!("iommu sync for device {}+{}+{}", addr, offset, len);
    }

    fn sync_for_cpu(&self, addr: DmaAddr, offset: usize, len: usize, _dir: DmaDirection) {
        self.stats.sync_for_cpu.fetch_add(1, Ordering::Relaxed);
        trace!("iommu sync for cpu {}+{}+{}", addr, offset, len);
    }

    fn numa_node(&self) -> usize {
        self.node.load(Ordering::Relaxed)
    }
}
