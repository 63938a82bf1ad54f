//! Filter frames.
//!
//! An [`XdpFrame`] is a packet that left the receive path through a filter
//! action or arrived from another interface through a redirect. It is backed
//! by either heap memory or one half of an arena page, in which case dropping
//! it releases the page reference.

use crate::netbuf::{BufMem, NetBuf};
use crate::page::PageFrag;
use crate::xsk::{XDP_PACKET_HEADROOM, ZeroCopyPool};
use pktdma_core::{MemoryError, RXB_TAILROOM};
use std::fmt;
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::trace;

/// Packet frame produced or consumed by the filter path
pub struct XdpFrame {
    buf: NetBuf,
    pool: Option<Arc<ZeroCopyPool>>,
}

impl XdpFrame {
    /// Frame holding a copy of `bytes`, with room to grow at both ends
    ///
    /// # Errors
    ///
    /// Returns [`MemoryError::Alloc`] if the allocation fails.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MemoryError> {
        Ok(Self::from_netbuf(NetBuf::from_bytes(
            bytes,
            XDP_PACKET_HEADROOM,
            RXB_TAILROOM,
        )?))
    }

    pub(crate) fn from_netbuf(buf: NetBuf) -> Self {
        Self { buf, pool: None }
    }

    /// Frame over `start..end` of a page fragment
    pub(crate) fn from_page(frag: PageFrag, start: usize, end: usize) -> Self {
        let end = end.min(frag.len());
        let start = start.min(end);
        Self::from_netbuf(NetBuf::from_parts(BufMem::Page(frag), start, end - start))
    }

    /// Tie the frame to the pool it was copied out of
    pub(crate) fn with_pool(mut self, pool: Arc<ZeroCopyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub(crate) fn zc_pool(&self) -> Option<&Arc<ZeroCopyPool>> {
        self.pool.as_ref()
    }

    /// Frame bytes
    pub fn data(&self) -> &[u8] {
        self.buf.data()
    }

    /// Mutable frame bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.buf.data_mut()
    }

    /// Frame length
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether the frame is empty
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Bytes in front of the frame
    pub fn headroom(&self) -> usize {
        self.buf.headroom()
    }

    /// Bytes behind the frame
    pub fn tailroom(&self) -> usize {
        self.buf.tailroom()
    }

    /// Whether the frame aliases an arena page
    pub fn is_page_backed(&self) -> bool {
        self.buf.is_page_backed()
    }

    pub(crate) fn data_and_tail_mut(&mut self) -> &mut [u8] {
        self.buf.data_and_tail_mut()
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        self.buf.set_len(len);
    }

    pub(crate) fn ptr_at(&mut self, off: usize) -> NonNull<u8> {
        self.buf.ptr_at(off)
    }

    /// Release the frame to its backing memory
    pub fn release(self) {
        trace!(
            "frame release: {} bytes ({})",
            self.len(),
            if self.is_page_backed() { "page" } else { "heap" }
        );
    }
}

impl fmt::Debug for XdpFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("XdpFrame")
            .field("len", &self.len())
            .field("headroom", &self.headroom())
            .field("page", &self.is_page_backed())
            .field("zero_copy", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::DeviceShared;

    #[test]
    fn test_frame_from_bytes() {
        let frame = XdpFrame::from_bytes(&[7; 60]).unwrap();
        assert_eq!(frame.len(), 60);
        assert_eq!(frame.headroom(), XDP_PACKET_HEADROOM);
        assert_eq!(frame.tailroom(), RXB_TAILROOM);
        assert!(!frame.is_page_backed());
        assert!(frame.zc_pool().is_none());
    }

    #[test]
    fn test_page_frame_releases_reference() {
        let shared = DeviceShared::new(4, 0);
        let (id, base) = {
            let mut state = shared.lock();
            let id = state.pages.alloc(4096, 0).unwrap();
            state.pages.get(id).unwrap();
            (id, state.pages.base(id).unwrap())
        };
        // SAFETY: the second reference taken above moves into the fragment.
        let frag = unsafe { PageFrag::adopt(Arc::clone(&shared), id, base, 2048) };

        let mut frame = XdpFrame::from_page(frag, 64, 128);
        assert!(frame.is_page_backed());
        assert_eq!(frame.len(), 64);
        frame.data_mut()[0] = 0x5A;
        frame.release();

        assert_eq!(shared.lock().pages.info(id).unwrap().refcount, 1);
    }
}
