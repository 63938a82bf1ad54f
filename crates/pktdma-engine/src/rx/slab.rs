//! One stack buffer per descriptor.
//!
//! ```text
//!  pad │ header (32) │ adj │ device writes buf_size bytes ... │ tailroom
//!      ^ RXB_ALIGN aligned     ^ mapped FromDevice
//! ```

use super::{BufferStrategy, RxBuf, RxContext, RxDescriptor};
use crate::dma::{DmaAddr, DmaDirection};
use crate::filter::rx::RxVerdict;
use crate::frame::XdpFrame;
use crate::mode::BufferMode;
use crate::netbuf::NetBuf;
use pktdma_core::{Error, MemoryError, PKT_HDR_SIZE, RXB_ALIGN, RXB_RESV, RXB_TAILROOM};
use tracing::{trace, warn};

#[derive(Debug)]
pub(super) struct SlabRx {
    ctx: RxContext,
}

impl SlabRx {
    pub(super) fn new(ctx: RxContext) -> Self {
        Self { ctx }
    }

    fn map(&self, skb: &mut NetBuf, adj: usize) -> Result<DmaAddr, MemoryError> {
        self.ctx.platform.map_single(
            skb.ptr_at(PKT_HDR_SIZE + adj),
            self.ctx.buf_size,
            DmaDirection::FromDevice,
        )
    }

    fn unmap(&self, desc: &mut RxDescriptor) {
        if !desc.dma.is_none() {
            self.ctx
                .platform
                .unmap_single(desc.dma, self.ctx.buf_size, DmaDirection::FromDevice);
            desc.dma = DmaAddr::NONE;
        }
    }
}

impl BufferStrategy for SlabRx {
    fn mode(&self) -> BufferMode {
        BufferMode::Slab
    }

    fn alloc(&mut self, desc: &mut RxDescriptor) -> Result<(), MemoryError> {
        let adj = self.ctx.adj;
        let mut skb = NetBuf::alloc(RXB_RESV + adj + self.ctx.buf_size + RXB_TAILROOM)?;
        let misalign = skb.data_addr() & (RXB_ALIGN - 1);
        skb.reserve(RXB_ALIGN - misalign);

        let dma = self.map(&mut skb, adj)?;
        desc.dma = dma;
        desc.adj = adj;
        desc.buf = RxBuf::Slab {
            pkb_addr: skb.data_addr(),
            posted: Some(skb),
        };
        Ok(())
    }

    fn dma_address(&self, desc: &RxDescriptor) -> DmaAddr {
        desc.dma
    }

    fn get(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error> {
        if desc.dma.is_none() {
            return Err(Error::Param("rx descriptor has no mapping".into()));
        }
        let RxBuf::Slab { posted, .. } = &mut desc.buf else {
            return Err(Error::Param("rx descriptor holds no slab buffer".into()));
        };
        let Some(mut skb) = posted.take() else {
            return Err(Error::Param("rx descriptor has no buffer".into()));
        };
        self.unmap(desc);
        if len > self.ctx.buf_size {
            desc.clear();
            return Err(Error::Param(format!(
                "rx length {} exceeds buffer size {}",
                len, self.ctx.buf_size
            )));
        }

        let filter = &self.ctx.filter;
        let total = desc.adj + len;
        let (verdict, guard) = if filter.has_programs() {
            let run = filter.run_rx(skb.data_and_tail_mut(), PKT_HDR_SIZE, total, self.ctx.queue);
            (run.verdict, run.guard)
        } else {
            if let Err(e) = filter.rx_header(skb.data_and_tail_mut(), PKT_HDR_SIZE, total, self.ctx.queue) {
                desc.clear();
                return Err(e);
            }
            (RxVerdict::Pass, None)
        };

        match verdict {
            RxVerdict::Pass => {
                skb.put(PKT_HDR_SIZE + total)?;
                skb.set_inflight(guard);
                desc.skb = Some(skb);
                trace!("rx queue {}: slab packet of {} bytes", self.ctx.queue, len);
                Ok(())
            }
            RxVerdict::Drop => {
                desc.clear();
                Err(Error::Unavailable)
            }
            RxVerdict::Tx { netif, start, end } => {
                desc.clear();
                skb.reserve(start);
                skb.put(end - start)?;
                let _ = filter.rx_tx(&netif, XdpFrame::from_netbuf(skb));
                Err(Error::Unavailable)
            }
            RxVerdict::Redirect { target, start, end } => {
                desc.clear();
                skb.reserve(start);
                skb.put(end - start)?;
                let _ = filter.rx_redirect(target, XdpFrame::from_netbuf(skb));
                Err(Error::Unavailable)
            }
        }
    }

    fn put(&mut self, desc: &mut RxDescriptor, _len: usize) -> Result<(), Error> {
        let Some(mut skb) = desc.skb.take() else {
            return Err(Error::Param("no packet to put back".into()));
        };
        let RxBuf::Slab { pkb_addr, posted: None } = desc.buf else {
            desc.clear();
            return Err(Error::Param("descriptor holds no delivered slab buffer".into()));
        };
        if skb.data_addr() != pkb_addr {
            warn!(
                "rx queue {}: put of foreign buffer {:#x}, expected {:#x}",
                self.ctx.queue,
                skb.data_addr(),
                pkb_addr
            );
            self.unmap(desc);
            desc.clear();
            return Err(Error::Param("buffer does not belong to the descriptor".into()));
        }

        skb.set_inflight(None);
        skb.trim(0);
        if desc.dma.is_none() {
            match self.map(&mut skb, desc.adj) {
                Ok(dma) => desc.dma = dma,
                Err(e) => {
                    desc.clear();
                    return Err(e.into());
                }
            }
        }
        desc.buf = RxBuf::Slab {
            pkb_addr,
            posted: Some(skb),
        };
        Ok(())
    }

    fn free(&mut self, desc: &mut RxDescriptor) {
        self.unmap(desc);
        desc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{RedirectTarget, XdpAction, XdpContext};
    use crate::rx::ReceiveBufferPool;
    use crate::rx::test_support::{Fixture, ethernet};
    use crate::mode::ModeSelection;
    use pktdma_core::PacketHeader;
    use std::sync::Arc;

    fn pool(fx: &Fixture) -> ReceiveBufferPool {
        ReceiveBufferPool::new(
            fx.ctx(),
            ModeSelection {
                mode: BufferMode::Slab,
                page_order: 0,
                page_size: 0,
            },
            None,
        )
    }

    fn redirect(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Redirect(RedirectTarget::Netif(9))
    }

    #[test]
    fn test_alloc_free_zeroes() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();

        pool.alloc(&mut desc).unwrap();
        assert!(!desc.dma().is_none());
        assert_eq!(desc.kind(), Some(BufferMode::Slab));
        assert!(pool.avail(&mut desc));
        assert_eq!(fx.iommu.live_mappings(), 1);

        pool.free(&mut desc);
        assert!(desc.is_empty());
        assert_eq!(fx.iommu.live_mappings(), 0);
    }

    #[test]
    fn test_receive_pass() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();

        let frame = ethernet(64);
        fx.iommu.device_write(pool.dma_address(&desc), &frame).unwrap();
        pool.get(&mut desc, frame.len()).unwrap();
        assert!(!pool.avail(&mut desc));
        assert!(desc.has_packet());

        let skb = desc.take_packet().unwrap();
        assert_eq!(skb.len(), PKT_HDR_SIZE + 64);
        assert_eq!(&skb.data()[PKT_HDR_SIZE..], &frame[..]);
        let hdr = PacketHeader::read(skb.data()).unwrap();
        assert_eq!(hdr.data_len, 64);
        assert_eq!(skb.data_addr() % RXB_ALIGN, 0);
        assert_eq!(fx.iommu.live_mappings(), 0);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();
        assert!(matches!(pool.get(&mut desc, 4000), Err(Error::Param(_))));
        assert!(desc.is_empty());
        assert!(matches!(pool.get(&mut desc, 64), Err(Error::Param(_))));
    }

    #[test]
    fn test_put_remaps_own_buffer() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();
        fx.iommu.device_write(pool.dma_address(&desc), &ethernet(60)).unwrap();
        pool.get(&mut desc, 60).unwrap();

        pool.put(&mut desc, 60).unwrap();
        assert!(pool.avail(&mut desc));
        assert_eq!(fx.iommu.counts().map_single, 2);
        assert_eq!(fx.iommu.live_mappings(), 1);
        pool.free(&mut desc);
    }

    #[test]
    fn test_put_resets_length_whatever_len() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();
        fx.iommu.device_write(pool.dma_address(&desc), &ethernet(64)).unwrap();
        pool.get(&mut desc, 64).unwrap();

        pool.put(&mut desc, 0).unwrap();
        let frame = ethernet(64);
        fx.iommu.device_write(pool.dma_address(&desc), &frame).unwrap();
        pool.get(&mut desc, 64).unwrap();

        let skb = desc.take_packet().unwrap();
        assert_eq!(skb.len(), PKT_HDR_SIZE + 64);
        assert_eq!(&skb.data()[PKT_HDR_SIZE..], &frame[..]);
    }

    #[test]
    fn test_put_rejects_foreign_buffer() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();
        pool.get(&mut desc, 60).unwrap();
        let _ours = desc.take_packet().unwrap();

        desc.replace_packet(NetBuf::alloc(256).unwrap());
        assert!(matches!(pool.put(&mut desc, 60), Err(Error::Param(_))));
        assert!(desc.is_empty());
    }

    #[test]
    fn test_map_failure_leaves_descriptor_empty() {
        let fx = Fixture::new(false);
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        fx.iommu.fail_next_maps(1);
        assert!(matches!(pool.alloc(&mut desc), Err(MemoryError::Mapping { .. })));
        assert!(desc.is_empty());
    }

    #[test]
    fn test_redirect_consumes_buffer() {
        let fx = Fixture::new(true);
        fx.filter.attach(1, Arc::new(redirect)).unwrap();
        let mut pool = pool(&fx);
        let mut desc = RxDescriptor::new();
        pool.alloc(&mut desc).unwrap();
        fx.iommu.device_write(pool.dma_address(&desc), &ethernet(64)).unwrap();

        assert!(matches!(pool.get(&mut desc, 64), Err(Error::Unavailable)));
        assert!(!pool.avail(&mut desc));
        assert!(desc.take_packet().is_none());
        assert_eq!(fx.shared.in_flight(1), 0);
    }
}
