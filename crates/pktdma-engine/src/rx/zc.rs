//! Frames borrowed from a bound zero-copy pool.
//!
//! The device writes straight into the consumer's chunk. The filter runs in
//! place; a frame redirected back to the same pool is published without a
//! copy, everything else is copied out and the chunk returns to the pool.

use super::{BufferStrategy, RxBuf, RxContext, RxDescriptor};
use crate::dma::DmaAddr;
use crate::filter::RedirectTarget;
use crate::filter::rx::RxVerdict;
use crate::frame::XdpFrame;
use crate::mode::BufferMode;
use crate::netbuf::NetBuf;
use crate::shared::InFlight;
use crate::xsk::{RxRefusal, XskBuff, ZeroCopyPool};
use pktdma_core::{Error, MemoryError, PKT_HDR_SIZE, RXB_ALIGN, RXB_RESV, RXB_TAILROOM};
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug)]
pub(super) struct ZeroCopyRx {
    ctx: RxContext,
    pool: Arc<ZeroCopyPool>,
}

impl ZeroCopyRx {
    pub(super) fn new(ctx: RxContext, pool: Arc<ZeroCopyPool>) -> Self {
        Self { ctx, pool }
    }

    fn chunk<'a>(&'a self, buff: &'a mut XskBuff) -> Result<&'a mut [u8], Error> {
        let addr = buff.addr();
        self.pool
            .buff_chunk_mut(buff)
            .ok_or_else(|| Error::Param(format!("chunk {:#x} outside pool", addr)))
    }

    fn copy_frame(&self, buff: &mut XskBuff, start: usize, end: usize) -> Result<XdpFrame, Error> {
        let chunk = self.chunk(buff)?;
        Ok(XdpFrame::from_bytes(&chunk[start..end])?)
    }

    /// Stack buffer holding the header and packet at `hdr..end`
    fn copy_packet(&self, buff: &mut XskBuff, hdr: usize, end: usize, guard: Option<InFlight>) -> Result<NetBuf, Error> {
        let mut skb = NetBuf::alloc(RXB_RESV + self.ctx.adj + self.ctx.buf_size + RXB_TAILROOM)?;
        let misalign = skb.data_addr() & (RXB_ALIGN - 1);
        skb.reserve(RXB_ALIGN - misalign);
        skb.put_slice(&self.chunk(buff)?[hdr..end])?;
        skb.set_inflight(guard);
        Ok(skb)
    }

    fn same_pool(&self) -> bool {
        self.ctx
            .filter
            .binding()
            .is_some_and(|b| Arc::ptr_eq(&b.pool, &self.pool))
    }

    /// Put the buffer back on the descriptor for a retry after wakeup
    fn keep(&self, desc: &mut RxDescriptor, mut buff: XskBuff, offset: usize) -> Error {
        buff.set_data_offset(offset);
        desc.buf = RxBuf::Frame(buff);
        trace!("rx queue {}: zero-copy frame held for wakeup", self.ctx.queue);
        Error::Busy
    }

    fn consume(&self, desc: &mut RxDescriptor, buff: XskBuff) {
        self.pool.free(buff);
        desc.clear();
    }
}

impl BufferStrategy for ZeroCopyRx {
    fn mode(&self) -> BufferMode {
        BufferMode::ExternallyOwned
    }

    fn alloc(&mut self, desc: &mut RxDescriptor) -> Result<(), MemoryError> {
        let Some(buff) = self.pool.alloc() else {
            self.pool.set_rx_need_wakeup();
            return Err(MemoryError::PoolEmpty);
        };
        let Some(dma) = self.pool.buff_dma(&buff) else {
            self.pool.free(buff);
            return Err(MemoryError::Mapping {
                len: self.pool.umem().frame_size(),
            });
        };
        desc.dma = dma;
        desc.adj = self.ctx.adj;
        desc.buf = RxBuf::Frame(buff);
        Ok(())
    }

    fn dma_address(&self, desc: &RxDescriptor) -> DmaAddr {
        desc.dma.offset(RXB_RESV + desc.adj)
    }

    fn get(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error> {
        if desc.dma.is_none() {
            return Err(Error::Param("rx descriptor has no mapping".into()));
        }
        let RxBuf::Frame(mut buff) = std::mem::take(&mut desc.buf) else {
            desc.clear();
            return Err(Error::Param("rx descriptor holds no frame".into()));
        };
        if len > self.ctx.buf_size {
            self.consume(desc, buff);
            return Err(Error::Param(format!(
                "rx length {} exceeds buffer size {}",
                len, self.ctx.buf_size
            )));
        }

        let origin = buff.data_offset();
        let pkt = origin + RXB_RESV;
        let total = desc.adj + len;
        self.pool
            .raw_sync_for_cpu(buff.addr() + (pkt + desc.adj) as u64, len);

        let filter = Arc::clone(&self.ctx.filter);
        let run = self.chunk(&mut buff).and_then(|chunk| {
            if filter.has_programs() {
                let run = filter.run_rx(chunk, pkt, total, self.ctx.queue);
                Ok((run.verdict, run.guard))
            } else {
                filter.rx_header(chunk, pkt, total, self.ctx.queue)?;
                Ok((RxVerdict::Pass, None))
            }
        });
        let (verdict, guard) = match run {
            Ok(run) => run,
            Err(e) => {
                self.consume(desc, buff);
                return Err(e);
            }
        };

        match verdict {
            RxVerdict::Pass => {
                let skb = self.copy_packet(&mut buff, pkt - PKT_HDR_SIZE, pkt + total, guard);
                self.consume(desc, buff);
                desc.skb = Some(skb?);
                trace!("rx queue {}: zero-copy packet of {} bytes", self.ctx.queue, len);
                Ok(())
            }
            RxVerdict::Drop => {
                self.consume(desc, buff);
                Err(Error::Unavailable)
            }
            RxVerdict::Tx { netif, start, end } => {
                let frame = self.copy_frame(&mut buff, start, end);
                self.consume(desc, buff);
                let res = match (frame, filter.binding()) {
                    (Ok(frame), Some(binding)) => filter.xsk_frame_xmit(&netif, &binding, frame),
                    (Ok(frame), None) => filter.rx_tx(&netif, frame),
                    (Err(e), _) => Err(e),
                };
                if let Err(e) = res {
                    debug!("rx queue {}: zero-copy transmit action failed: {}", self.ctx.queue, e);
                }
                Err(Error::Unavailable)
            }
            RxVerdict::Redirect {
                target: RedirectTarget::ZeroCopy,
                start,
                end,
            } if self.same_pool() => {
                buff.set_data_offset(start);
                match self.pool.receive_zc(buff, end - start) {
                    Ok(()) => {
                        filter.mark_flush();
                        desc.clear();
                    }
                    Err((RxRefusal::NoSpace, buff)) if self.pool.uses_need_wakeup() => {
                        return Err(self.keep(desc, buff, origin));
                    }
                    Err((refusal, buff)) => {
                        debug!("rx queue {}: zero-copy redirect refused: {:?}", self.ctx.queue, refusal);
                        self.consume(desc, buff);
                    }
                }
                Err(Error::Unavailable)
            }
            RxVerdict::Redirect { target, start, end } => {
                let frame = match self.copy_frame(&mut buff, start, end) {
                    Ok(frame) => frame,
                    Err(e) => {
                        self.consume(desc, buff);
                        return Err(e);
                    }
                };
                match filter.rx_redirect(target, frame) {
                    Err(e) if e.is_exhaustion() && self.pool.uses_need_wakeup() => {
                        return Err(self.keep(desc, buff, origin));
                    }
                    _ => self.consume(desc, buff),
                }
                Err(Error::Unavailable)
            }
        }
    }

    fn put(&mut self, desc: &mut RxDescriptor, _len: usize) -> Result<(), Error> {
        desc.skb = None;
        Ok(())
    }

    fn free(&mut self, desc: &mut RxDescriptor) {
        if let RxBuf::Frame(buff) = std::mem::take(&mut desc.buf) {
            self.pool.free(buff);
        }
        desc.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaPlatform;
    use crate::filter::{XdpAction, XdpContext, XskBinding};
    use crate::mode::ModeSelection;
    use crate::rx::ReceiveBufferPool;
    use crate::rx::test_support::{Fixture, ethernet};
    use crate::xsk::{PoolConfig, UmemConfig, XDP_PACKET_HEADROOM};

    const CHUNK: usize = 2048;

    fn zc_pool(fx: &Fixture, ring_size: u32) -> Arc<ZeroCopyPool> {
        let pool = ZeroCopyPool::new(PoolConfig {
            umem: UmemConfig {
                size: 8 * CHUNK,
                frame_size: CHUNK,
                headroom: 0,
            },
            ring_size,
            need_wakeup: true,
        })
        .unwrap();
        let platform: Arc<dyn DmaPlatform> = fx.iommu.clone();
        pool.dma_map(&platform).unwrap();
        fx.filter.set_binding(Some(XskBinding {
            netif: fx.filter.netif(1).unwrap(),
            queue: 0,
            pool: Arc::clone(&pool),
        }));
        pool
    }

    fn rx_pool(fx: &Fixture, pool: &Arc<ZeroCopyPool>) -> ReceiveBufferPool {
        ReceiveBufferPool::new(
            fx.ctx(),
            ModeSelection {
                mode: BufferMode::ExternallyOwned,
                page_order: 0,
                page_size: 0,
            },
            Some(Arc::clone(pool)),
        )
    }

    fn to_socket(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Redirect(RedirectTarget::ZeroCopy)
    }

    #[test]
    fn test_empty_pool_asks_for_wakeup() {
        let fx = Fixture::new(false);
        let pool = zc_pool(&fx, 4);
        let mut rx = rx_pool(&fx, &pool);
        let mut desc = RxDescriptor::new();

        assert_eq!(rx.alloc(&mut desc), Err(MemoryError::PoolEmpty));
        assert!(desc.is_empty());
        assert!(pool.rx_needs_wakeup());
    }

    #[test]
    fn test_pass_copies_and_returns_chunk() {
        let fx = Fixture::new(false);
        let pool = zc_pool(&fx, 4);
        let mut rx = rx_pool(&fx, &pool);
        let mut desc = RxDescriptor::new();
        pool.fill(0);

        rx.alloc(&mut desc).unwrap();
        assert_eq!(desc.kind(), Some(BufferMode::ExternallyOwned));
        let dma = rx.dma_address(&desc);
        assert_eq!(dma, pool.raw_dma((XDP_PACKET_HEADROOM + RXB_RESV) as u64).unwrap());

        let frame = ethernet(64);
        fx.iommu.device_write(dma, &frame).unwrap();
        rx.get(&mut desc, 64).unwrap();
        assert!(!rx.avail(&mut desc));

        let skb = desc.take_packet().unwrap();
        assert!(!skb.is_page_backed());
        assert_eq!(&skb.data()[PKT_HDR_SIZE..], &frame[..]);

        // chunk is free again
        assert!(rx.alloc(&mut desc).is_ok());
        rx.free(&mut desc);
    }

    #[test]
    fn test_redirect_to_bound_pool_is_zero_copy() {
        let fx = Fixture::new(false);
        let pool = zc_pool(&fx, 4);
        fx.filter.netif(1).unwrap().set_xsk_zc(true);
        fx.filter.attach(1, Arc::new(to_socket)).unwrap();
        let mut rx = rx_pool(&fx, &pool);
        let mut desc = RxDescriptor::new();
        pool.fill(CHUNK as u64);
        rx.alloc(&mut desc).unwrap();

        let frame = ethernet(64);
        fx.iommu.device_write(rx.dma_address(&desc), &frame).unwrap();
        assert!(matches!(rx.get(&mut desc, 64), Err(Error::Unavailable)));
        assert!(desc.is_empty());

        fx.filter.flush();
        let got = pool.recv().unwrap();
        assert_eq!(got.addr, (CHUNK + XDP_PACKET_HEADROOM + RXB_RESV) as u64);
        assert_eq!(got.len, 60);
        assert_eq!(pool.umem().read(got.addr, 60).unwrap(), frame[..60].to_vec());
    }

    #[test]
    fn test_full_ring_holds_frame_until_wakeup() {
        let fx = Fixture::new(false);
        let pool = zc_pool(&fx, 2);
        fx.filter.netif(1).unwrap().set_xsk_zc(true);
        fx.filter.attach(1, Arc::new(to_socket)).unwrap();
        let mut rx = rx_pool(&fx, &pool);
        let mut desc = RxDescriptor::new();

        pool.fill(0);
        rx.alloc(&mut desc).unwrap();
        pool.fill(CHUNK as u64);
        pool.fill(2 * CHUNK as u64);
        pool.receive_copy(&[1; 60]).unwrap();
        pool.receive_copy(&[2; 60]).unwrap();

        fx.iommu.device_write(rx.dma_address(&desc), &ethernet(64)).unwrap();
        assert!(matches!(rx.get(&mut desc, 64), Err(Error::Busy)));
        assert!(rx.avail(&mut desc));
        assert_eq!(desc.kind(), Some(BufferMode::ExternallyOwned));

        assert_eq!(pool.flush_rx(), 2);
        assert!(pool.recv().is_some());
        assert!(pool.recv().is_some());
        assert!(matches!(rx.get(&mut desc, 64), Err(Error::Unavailable)));
        assert_eq!(pool.flush_rx(), 1);
        assert_eq!(pool.recv().unwrap().addr, (XDP_PACKET_HEADROOM + RXB_RESV) as u64);
    }

    #[test]
    fn test_free_returns_chunk() {
        let fx = Fixture::new(false);
        let pool = zc_pool(&fx, 4);
        let mut rx = rx_pool(&fx, &pool);
        let mut desc = RxDescriptor::new();
        pool.fill(0);

        rx.alloc(&mut desc).unwrap();
        rx.free(&mut desc);
        assert!(desc.is_empty());
        assert!(rx.alloc(&mut desc).is_ok());
    }
}
