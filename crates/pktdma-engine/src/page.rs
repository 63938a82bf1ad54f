//! Receive page arena.
//!
//! Pages are addressed by [`PageId`] and carry an explicit reference count.
//! A receive descriptor holds one reference while the page is posted to the
//! device; every stack buffer or frame built on one half of the page holds
//! another through a [`PageFrag`]. The memory is released when the last
//! reference goes away.

use crate::numa;
use crate::shared::DeviceShared;
use pktdma_core::{Error, MemoryError};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{trace, warn};

/// Index of a page slot in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId(u32);

impl PageId {
    /// Slot index
    pub const fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page#{}", self.0)
    }
}

/// Snapshot of one live page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    /// Allocation size
    pub size: usize,
    /// Outstanding references
    pub refcount: u32,
    /// Allocated from the emergency reserve; must not be recycled
    pub pfmemalloc: bool,
    /// NUMA node the page was allocated for
    pub node: usize,
}

struct PageSlot {
    mem: NonNull<u8>,
    info: PageInfo,
}

/// Fixed-capacity page arena
///
/// Lives inside the device lock; see [`DeviceShared`].
pub(crate) struct PageArena {
    slots: Vec<Option<PageSlot>>,
    free_ids: Vec<u32>,
    live: usize,
    max_pages: usize,
    reserve_pages: usize,
}

// SAFETY: the arena exclusively owns every page allocation it points to, and
// all access goes through the device lock.
unsafe impl Send for PageArena {}

impl PageArena {
    pub(crate) fn new(max_pages: usize, reserve_pages: usize) -> Self {
        Self {
            slots: Vec::new(),
            free_ids: Vec::new(),
            live: 0,
            max_pages,
            reserve_pages,
        }
    }

    /// Allocate a zeroed page holding one reference
    ///
    /// Pages handed out once the arena is into its reserve are marked
    /// `pfmemalloc` so they are never recycled in place.
    pub(crate) fn alloc(&mut self, size: usize, node: usize) -> Result<PageId, MemoryError> {
        if self.live >= self.max_pages {
            return Err(MemoryError::Alloc { size });
        }
        let pfmemalloc = self.live >= self.max_pages.saturating_sub(self.reserve_pages);

        // SAFETY: released in `put` or `Drop` with the same size.
        let mem = unsafe { numa::allocate_on_node(size, node) }.ok_or(MemoryError::Alloc { size })?;
        let slot = PageSlot {
            mem,
            info: PageInfo {
                size,
                refcount: 1,
                pfmemalloc,
                node,
            },
        };

        let idx = match self.free_ids.pop() {
            Some(idx) => {
                self.slots[idx as usize] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                (self.slots.len() - 1) as u32
            }
        };
        self.live += 1;
        trace!("arena: alloc page#{} ({} bytes, node {})", idx, size, node);
        Ok(PageId(idx))
    }

    fn slot_mut(&mut self, id: PageId) -> Result<&mut PageSlot, Error> {
        self.slots
            .get_mut(id.0 as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::DoubleFree(id.to_string()))
    }

    /// Take an additional reference
    pub(crate) fn get(&mut self, id: PageId) -> Result<u32, Error> {
        let slot = self.slot_mut(id)?;
        slot.info.refcount += 1;
        Ok(slot.info.refcount)
    }

    /// Drop one reference, freeing the page at zero
    pub(crate) fn put(&mut self, id: PageId) -> Result<u32, Error> {
        let slot = self.slot_mut(id)?;
        slot.info.refcount -= 1;
        let remaining = slot.info.refcount;
        if remaining == 0 {
            if let Some(slot) = self.slots[id.0 as usize].take() {
                // SAFETY: the memory came from allocate_on_node with this size
                // and no reference to it remains.
                unsafe { numa::deallocate_on_node(slot.mem, slot.info.size) };
            }
            self.free_ids.push(id.0);
            self.live -= 1;
            trace!("arena: freed {}", id);
        }
        Ok(remaining)
    }

    pub(crate) fn info(&self, id: PageId) -> Option<PageInfo> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|slot| slot.info)
    }

    pub(crate) fn base(&self, id: PageId) -> Option<NonNull<u8>> {
        self.slots
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|slot| slot.mem)
    }

    pub(crate) fn live_pages(&self) -> usize {
        self.live
    }
}

impl Drop for PageArena {
    fn drop(&mut self) {
        if self.live > 0 {
            warn!("arena: releasing {} pages still referenced", self.live);
        }
        for slot in self.slots.drain(..).flatten() {
            // SAFETY: each slot owns its allocation and the arena is going away.
            unsafe { numa::deallocate_on_node(slot.mem, slot.info.size) };
        }
    }
}

/// One reference to a region of an arena page
///
/// Covers only the half the holder was built on, so two fragments of the
/// same page never alias.
pub struct PageFrag {
    shared: Arc<DeviceShared>,
    page: PageId,
    ptr: NonNull<u8>,
    len: usize,
}

impl PageFrag {
    /// Wrap a reference the caller already holds
    ///
    /// # Safety
    /// The caller must own one reference on `page`, which the fragment takes
    /// over, and `ptr..ptr+len` must lie inside that page and not be accessed
    /// through any other handle while the fragment lives.
    pub(crate) unsafe fn adopt(
        shared: Arc<DeviceShared>,
        page: PageId,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Self {
        Self {
            shared,
            page,
            ptr,
            len,
        }
    }

    /// Page this fragment references
    pub fn page(&self) -> PageId {
        self.page
    }

    /// Fragment size
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the fragment is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Give up the fragment without dropping its reference
    ///
    /// The caller becomes the owner of the reference again.
    pub(crate) fn into_ref(self) -> PageId {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: `this` is never dropped, so the Arc is moved out exactly once.
        drop(unsafe { std::ptr::read(&this.shared) });
        this.page
    }

    /// Fragment bytes
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the held reference keeps the page alive and the region is
        // exclusive to this fragment (adopt contract).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Mutable fragment bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as in `as_slice`; `&mut self` rules out other borrows.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PageFrag {
    fn drop(&mut self) {
        if let Err(e) = self.shared.lock().pages.put(self.page) {
            warn!("page fragment release failed: {}", e);
        }
    }
}

// SAFETY: the fragment owns one page reference and its region exclusively;
// reference counting happens under the device lock.
unsafe impl Send for PageFrag {}
unsafe impl Sync for PageFrag {}

impl fmt::Debug for PageFrag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageFrag")
            .field("page", &self.page)
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
