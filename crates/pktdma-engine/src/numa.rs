//! NUMA locality for receive pages.
//!
//! Pages are allocated on the node of the CPU running the poll path, and a
//! page is only recycled in place while it is still local to that node.
//!
//! Note: This module is Linux-specific and reports node 0 elsewhere.

#[cfg(target_os = "linux")]
use std::fs;
#[cfg(target_os = "linux")]
use std::ptr;
use std::ptr::NonNull;
#[cfg(target_os = "linux")]
use tracing::{debug, warn};

/// Alignment used for page allocations on platforms without `mmap`
#[cfg(not(target_os = "linux"))]
const PAGE_ALIGN: usize = 4096;

/// Get the NUMA node for a given CPU core (Linux only)
///
/// # Examples
/// ```no_run
/// use pktdma_engine::numa::get_numa_node_for_cpu;
///
/// if let Some(node) = get_numa_node_for_cpu(0) {
///     println!("CPU 0 is on NUMA node {}", node);
/// }
/// ```
#[cfg(target_os = "linux")]
pub fn get_numa_node_for_cpu(cpu: usize) -> Option<usize> {
    for node in 0..8 {
        let path = format!("/sys/devices/system/node/node{}/cpu{}", node, cpu);
        if fs::metadata(&path).is_ok() {
            return Some(node);
        }
    }

    if fs::metadata("/sys/devices/system/node/node0").is_ok() {
        // NUMA exists but CPU not in any node - likely node 0
        Some(0)
    } else {
        None
    }
}

/// Get the NUMA node for a given CPU core (non-Linux platforms)
#[cfg(not(target_os = "linux"))]
pub fn get_numa_node_for_cpu(_cpu: usize) -> Option<usize> {
    None
}

/// CPU the calling thread is running on
#[cfg(target_os = "linux")]
pub fn current_cpu() -> Option<usize> {
    // SAFETY: sched_getcpu takes no arguments and only reads scheduler state.
    let cpu = unsafe { libc::sched_getcpu() };
    usize::try_from(cpu).ok()
}

/// CPU the calling thread is running on (non-Linux)
#[cfg(not(target_os = "linux"))]
pub fn current_cpu() -> Option<usize> {
    None
}

/// NUMA node of the calling thread, defaulting to node 0
pub fn current_numa_node() -> usize {
    current_cpu().and_then(get_numa_node_for_cpu).unwrap_or(0)
}

/// Allocate `size` zeroed, page-aligned bytes intended for `node` (Linux only)
///
/// # Safety
/// The caller must release the memory with [`deallocate_on_node`] using the
/// same `size`, and must not use the pointer afterwards.
#[cfg(target_os = "linux")]
pub unsafe fn allocate_on_node(size: usize, node: usize) -> Option<NonNull<u8>> {
    use libc::{MAP_ANONYMOUS, MAP_PRIVATE, PROT_READ, PROT_WRITE, mmap};

    // SAFETY: anonymous private mapping with valid size and protection flags;
    // the result is checked against MAP_FAILED.
    let addr = unsafe {
        mmap(
            ptr::null_mut(),
            size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_ANONYMOUS,
            -1,
            0,
        )
    };

    if addr == libc::MAP_FAILED {
        warn!("Failed to allocate {} bytes on NUMA node {}", size, node);
        return None;
    }

    debug!("Allocated {} bytes at {:p} for NUMA node {}", size, addr, node);
    NonNull::new(addr as *mut u8)
}

/// Allocate `size` zeroed, page-aligned bytes (non-Linux)
///
/// # Safety
/// The caller must release the memory with [`deallocate_on_node`].
#[cfg(not(target_os = "linux"))]
pub unsafe fn allocate_on_node(size: usize, _node: usize) -> Option<NonNull<u8>> {
    use std::alloc::{Layout, alloc_zeroed};

    let layout = Layout::from_size_align(size, PAGE_ALIGN).ok()?;
    // SAFETY: layout has non-zero size (callers never request empty pages).
    NonNull::new(unsafe { alloc_zeroed(layout) })
}

/// Release memory from [`allocate_on_node`] (Linux only)
///
/// # Safety
/// `ptr` and `size` must come from one [`allocate_on_node`] call that has not
/// been released yet.
#[cfg(target_os = "linux")]
pub unsafe fn deallocate_on_node(ptr: NonNull<u8>, size: usize) {
    // SAFETY: pointer and size match the original mmap (caller contract).
    unsafe {
        libc::munmap(ptr.as_ptr() as *mut libc::c_void, size);
    }
}

/// Release memory from [`allocate_on_node`] (non-Linux)
///
/// # Safety
/// `ptr` and `size` must come from one [`allocate_on_node`] call that has not
/// been released yet.
#[cfg(not(target_os = "linux"))]
pub unsafe fn deallocate_on_node(ptr: NonNull<u8>, size: usize) {
    use std::alloc::{Layout, dealloc};

    // SAFETY: layout matches the allocation (caller contract).
    unsafe {
        let layout = Layout::from_size_align_unchecked(size, PAGE_ALIGN);
        dealloc(ptr.as_ptr(), layout);
    }
}
