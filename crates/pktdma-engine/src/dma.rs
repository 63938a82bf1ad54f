//! DMA platform seam.
//!
//! The engine never touches an IOMMU or cache maintenance instruction
//! directly. Every mapping, unmapping and sync goes through a [`DmaPlatform`]
//! so that buffer ownership transfers between CPU and device are explicit.

use pktdma_core::MemoryError;
use std::fmt;
use std::ptr::NonNull;

/// Device-visible bus address
///
/// Zero is reserved for "no live mapping".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DmaAddr(u64);

impl DmaAddr {
    /// No mapping
    pub const NONE: Self = Self(0);

    /// Wrap a raw bus address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Raw bus address
    #[inline]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether this is the "no mapping" address
    #[inline]
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Address `off` bytes past this one
    #[inline]
    pub const fn offset(&self, off: usize) -> Self {
        Self(self.0 + off as u64)
    }
}

impl fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Transfer direction of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
    /// Device reads
    ToDevice,
    /// Device writes
    FromDevice,
    /// Device reads and writes
    Bidirectional,
}

impl DmaDirection {
    /// Whether the device may write through a mapping in this direction
    pub const fn device_writes(&self) -> bool {
        matches!(self, Self::FromDevice | Self::Bidirectional)
    }

    /// Whether the device may read through a mapping in this direction
    pub const fn device_reads(&self) -> bool {
        matches!(self, Self::ToDevice | Self::Bidirectional)
    }
}

/// Mapping attribute hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaAttrs(u32);

impl DmaAttrs {
    /// Do not sync caches as part of map/unmap
    pub const SKIP_CPU_SYNC: u32 = 1 << 0;
    /// Relaxed ordering is acceptable
    pub const WEAK_ORDERING: u32 = 1 << 1;

    /// Attributes used for receive page mappings
    pub const RX_PAGE: Self = Self(Self::SKIP_CPU_SYNC | Self::WEAK_ORDERING);

    /// No hints
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Whether all of the given bits are set
    pub const fn contains(&self, bits: u32) -> bool {
        self.0 & bits == bits
    }
}

/// Cache-coherent DMA memory
///
/// Holds both the CPU pointer and the bus address the device uses.
pub struct DmaRegion {
    cpu_ptr: NonNull<u8>,
    bus_addr: DmaAddr,
    size: usize,
}

impl DmaRegion {
    /// Create a region from a platform allocation.
    ///
    /// # Safety
    /// - `cpu_ptr` must point to `size` bytes of coherent memory
    /// - `bus_addr` must be the device-visible address of that memory
    pub const unsafe fn new(cpu_ptr: NonNull<u8>, bus_addr: DmaAddr, size: usize) -> Self {
        Self {
            cpu_ptr,
            bus_addr,
            size,
        }
    }

    /// CPU base pointer
    #[inline]
    pub const fn cpu_base(&self) -> NonNull<u8> {
        self.cpu_ptr
    }

    /// Bus base address
    #[inline]
    pub const fn bus_base(&self) -> DmaAddr {
        self.bus_addr
    }

    /// Size in bytes
    #[inline]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Bus address at offset
    #[inline]
    pub const fn bus_at(&self, offset: usize) -> DmaAddr {
        self.bus_addr.offset(offset)
    }

    /// CPU view of the region
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the region owns `size` bytes at `cpu_ptr` for its lifetime
        // and the exclusive borrow prevents aliasing through this handle.
        unsafe { std::slice::from_raw_parts_mut(self.cpu_ptr.as_ptr(), self.size) }
    }
}

// SAFETY: the region is a plain pointer/length pair to memory that outlives it.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaRegion")
            .field("cpu_ptr", &self.cpu_ptr)
            .field("bus_addr", &self.bus_addr)
            .field("size", &format_args!("{:#x}", self.size))
            .finish()
    }
}

/// Platform DMA primitives
///
/// Implementations must be usable from the poll path and the transmit drain
/// worker at the same time.
pub trait DmaPlatform: Send + Sync {
    /// Allocate cache-coherent memory
    fn alloc_coherent(&self, size: usize) -> Result<DmaRegion, MemoryError>;

    /// Release memory from [`alloc_coherent`](Self::alloc_coherent)
    fn free_coherent(&self, region: DmaRegion);

    /// Map `len` bytes at `cpu` for streaming DMA
    fn map_single(
        &self,
        cpu: NonNull<u8>,
        len: usize,
        dir: DmaDirection,
    ) -> Result<DmaAddr, MemoryError>;

    /// Tear down a mapping from [`map_single`](Self::map_single)
    fn unmap_single(&self, addr: DmaAddr, len: usize, dir: DmaDirection);

    /// Map a whole page allocation
    fn map_page(
        &self,
        cpu: NonNull<u8>,
        len: usize,
        dir: DmaDirection,
        attrs: DmaAttrs,
    ) -> Result<DmaAddr, MemoryError>;

    /// Tear down a mapping from [`map_page`](Self::map_page)
    fn unmap_page(&self, addr: DmaAddr, len: usize, dir: DmaDirection, attrs: DmaAttrs);

    /// Hand `len` bytes at `addr + offset` to the device
    fn sync_for_device(&self, addr: DmaAddr, offset: usize, len: usize, dir: DmaDirection);

    /// Hand `len` bytes at `addr + offset` back to the CPU
    fn sync_for_cpu(&self, addr: DmaAddr, offset: usize, len: usize, dir: DmaDirection);

    /// NUMA node of the executing CPU
    fn numa_node(&self) -> usize;
}
