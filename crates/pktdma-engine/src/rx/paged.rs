//! Half-page flip buffers.
//!
//! Each descriptor maps one arena page and posts one half of it at a time:
//!
//! ```text
//!  page  │ half 0                         │ half 1                         │
//!  half  │ pad │ header │ adj │ packet ... │ pad │ header │ adj │ packet ... │
//!        ^ offset         ^ RXB_RESV
//! ```
//!
//! A delivered packet keeps its half through a page reference. If the other
//! half is free by the time the packet leaves, the descriptor flips to it
//! and the page stays mapped; otherwise the page is given up and the next
//! `alloc` maps a new one.

use super::{BufferStrategy, RxBuf, RxContext, RxDescriptor};
use crate::dma::{DmaAddr, DmaAttrs, DmaDirection};
use crate::filter::rx::RxVerdict;
use crate::frame::XdpFrame;
use crate::mode::BufferMode;
use crate::netbuf::{BufMem, NetBuf};
use crate::page::{PageFrag, PageId};
use pktdma_core::{Error, MemoryError, PKT_HDR_SIZE, RXB_ALIGN, RXB_RESV};
use std::ptr::NonNull;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
pub(super) struct PagedRx {
    ctx: RxContext,
    page_size: usize,
    half: usize,
}

impl PagedRx {
    pub(super) fn new(ctx: RxContext, page_size: usize) -> Self {
        Self {
            ctx,
            page_size,
            half: page_size / 2,
        }
    }

    fn sync_half(&self, dma: DmaAddr, offset: usize) {
        self.ctx
            .platform
            .sync_for_device(dma, offset, self.half, DmaDirection::FromDevice);
    }

    fn base(&self, page: PageId) -> Option<NonNull<u8>> {
        self.ctx.shared.lock().pages.base(page)
    }

    /// Drop the page from the descriptor, keeping any delivered packet
    fn release_page(&self, desc: &mut RxDescriptor) {
        if !desc.dma.is_none() {
            self.ctx.platform.unmap_page(
                desc.dma,
                self.page_size,
                DmaDirection::FromDevice,
                DmaAttrs::RX_PAGE,
            );
            desc.dma = DmaAddr::NONE;
        }
        if let RxBuf::Page {
            page, owned: true, ..
        } = desc.buf
        {
            if let Err(e) = self.ctx.shared.lock().pages.put(page) {
                debug!("rx queue {}: {}", self.ctx.queue, e);
            }
        }
        desc.buf = RxBuf::Empty;
    }

    /// Reference to the posted half, taken over from the descriptor
    fn take_half(&self, desc: &mut RxDescriptor) -> Result<PageFrag, Error> {
        let RxBuf::Page {
            page,
            offset,
            ref mut owned,
        } = desc.buf
        else {
            return Err(Error::Param("rx descriptor holds no page".into()));
        };
        let base = {
            let mut state = self.ctx.shared.lock();
            if !*owned {
                state.pages.get(page)?;
            }
            state
                .pages
                .base(page)
                .ok_or_else(|| Error::DoubleFree(page.to_string()))?
        };
        *owned = false;
        // SAFETY: the reference was the descriptor's (or was just taken), the
        // half lies inside the page, and the descriptor flips away from it or
        // gives the page up before posting again, so nothing else touches it.
        Ok(unsafe { PageFrag::adopt(Arc::clone(&self.ctx.shared), page, base.add(offset), self.half) })
    }
}

impl BufferStrategy for PagedRx {
    fn mode(&self) -> BufferMode {
        BufferMode::Paged
    }

    fn alloc(&mut self, desc: &mut RxDescriptor) -> Result<(), MemoryError> {
        let node = self.ctx.platform.numa_node();
        let (page, base) = {
            let mut state = self.ctx.shared.lock();
            let page = state.pages.alloc(self.page_size, node)?;
            match state.pages.base(page) {
                Some(base) => (page, base),
                None => {
                    let _ = state.pages.put(page);
                    return Err(MemoryError::Alloc {
                        size: self.page_size,
                    });
                }
            }
        };

        let dma = match self.ctx.platform.map_page(
            base,
            self.page_size,
            DmaDirection::FromDevice,
            DmaAttrs::RX_PAGE,
        ) {
            Ok(dma) => dma,
            Err(e) => {
                let _ = self.ctx.shared.lock().pages.put(page);
                return Err(e);
            }
        };

        desc.dma = dma;
        desc.adj = self.ctx.adj;
        desc.buf = RxBuf::Page {
            page,
            offset: 0,
            owned: true,
        };
        self.sync_half(dma, 0);
        trace!("rx queue {}: posted {} at {}", self.ctx.queue, page, dma);
        Ok(())
    }

    fn dma_address(&self, desc: &RxDescriptor) -> DmaAddr {
        match desc.buf {
            RxBuf::Page { offset, .. } => desc.dma.offset(offset + RXB_RESV + desc.adj),
            _ => DmaAddr::NONE,
        }
    }

    fn avail(&mut self, desc: &mut RxDescriptor) -> bool {
        desc.skb = None;
        !desc.dma.is_none()
    }

    fn get(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error> {
        if desc.dma.is_none() {
            return Err(Error::Param("rx descriptor has no mapping".into()));
        }
        let RxBuf::Page { page, offset, .. } = desc.buf else {
            return Err(Error::Param("rx descriptor holds no page".into()));
        };
        if len > self.ctx.buf_size {
            self.sync_half(desc.dma, offset);
            return Err(Error::Param(format!(
                "rx length {} exceeds buffer size {}",
                len, self.ctx.buf_size
            )));
        }

        let total = desc.adj + len;
        self.ctx.platform.sync_for_cpu(
            desc.dma,
            offset + RXB_RESV + desc.adj,
            len,
            DmaDirection::FromDevice,
        );

        let base = self
            .base(page)
            .ok_or_else(|| Error::DoubleFree(page.to_string()))?;
        let filter = Arc::clone(&self.ctx.filter);
        let (verdict, guard) = {
            // SAFETY: the descriptor holds the page and the device has handed
            // this half back; the other half is never viewed through this
            // descriptor, and the slice ends with this block.
            let half = unsafe { std::slice::from_raw_parts_mut(base.as_ptr().add(offset), self.half) };
            if filter.has_programs() {
                let run = filter.run_rx(half, RXB_RESV, total, self.ctx.queue);
                (run.verdict, run.guard)
            } else {
                filter.rx_header(half, RXB_RESV, total, self.ctx.queue)?;
                (RxVerdict::Pass, None)
            }
        };

        match verdict {
            RxVerdict::Pass => {
                let frag = self.take_half(desc)?;
                let mut skb = NetBuf::from_parts(BufMem::Page(frag), RXB_ALIGN, PKT_HDR_SIZE + total);
                skb.set_inflight(guard);
                desc.skb = Some(skb);
                self.recycle_page(desc);
                trace!("rx queue {}: paged packet of {} bytes", self.ctx.queue, len);
                Ok(())
            }
            RxVerdict::Drop => {
                self.sync_half(desc.dma, offset);
                Err(Error::Unavailable)
            }
            RxVerdict::Tx { netif, start, end } => {
                let frame = XdpFrame::from_page(self.take_half(desc)?, start, end);
                self.recycle_page(desc);
                let _ = filter.rx_tx(&netif, frame);
                Err(Error::Unavailable)
            }
            RxVerdict::Redirect { target, start, end } => {
                let frame = XdpFrame::from_page(self.take_half(desc)?, start, end);
                self.recycle_page(desc);
                let _ = filter.rx_redirect(target, frame);
                Err(Error::Unavailable)
            }
        }
    }

    fn put(&mut self, desc: &mut RxDescriptor, _len: usize) -> Result<(), Error> {
        desc.skb = None;
        Ok(())
    }

    fn free(&mut self, desc: &mut RxDescriptor) {
        self.release_page(desc);
        desc.clear();
    }

    fn recycle_page(&mut self, desc: &mut RxDescriptor) {
        let RxBuf::Page {
            page,
            offset,
            owned,
        } = desc.buf
        else {
            return;
        };
        if desc.dma.is_none() {
            return;
        }

        let node = self.ctx.platform.numa_node();
        let reused = {
            let mut state = self.ctx.shared.lock();
            match state.pages.info(page) {
                Some(info) if info.refcount == 1 && !info.pfmemalloc && info.node == node => {
                    owned || state.pages.get(page).is_ok()
                }
                _ => false,
            }
        };

        if reused {
            let flipped = offset ^ self.half;
            desc.buf = RxBuf::Page {
                page,
                offset: flipped,
                owned: true,
            };
            self.sync_half(desc.dma, flipped);
            trace!("rx queue {}: {} flipped to {}", self.ctx.queue, page, flipped);
        } else {
            trace!("rx queue {}: {} not reusable", self.ctx.queue, page);
            self.release_page(desc);
        }
    }
}
