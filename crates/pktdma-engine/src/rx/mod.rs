//! Receive buffer pools.
//!
//! Each receive queue owns one [`ReceiveBufferPool`], built for the mode the
//! [`BufferModeSelector`](crate::mode::BufferModeSelector) picked when the
//! queue was configured. The poller drives every descriptor through the same
//! cycle whatever the mode:
//!
//! ```text
//!   alloc ──▶ dma_address ──▶ (device writes) ──▶ get ──┬─ Ok: take_packet
//!     ▲                                                 └─ Err: outcome
//!     └──────────── avail == false ◀───────────────────────────┘
//! ```
//!
//! A descriptor whose [`avail`](ReceiveBufferPool::avail) is still true after
//! `get` (a recycled page half) is posted again without a new `alloc`.

mod paged;
mod slab;
mod zc;

use crate::dma::{DmaAddr, DmaPlatform};
use crate::filter::FilterEngine;
use crate::mode::{BufferMode, ModeSelection};
use crate::netbuf::NetBuf;
use crate::page::PageId;
use crate::shared::DeviceShared;
use crate::xsk::{XskBuff, ZeroCopyPool};
use pktdma_core::{Error, MemoryError};
use std::sync::Arc;

/// Buffer attached to a receive descriptor
#[derive(Debug, Default)]
pub(crate) enum RxBuf {
    #[default]
    Empty,
    /// Stack buffer, identified by the address of its header; the buffer
    /// itself sits here while posted
    Slab {
        pkb_addr: usize,
        posted: Option<NetBuf>,
    },
    /// One half of an arena page
    Page {
        page: PageId,
        offset: usize,
        owned: bool,
    },
    /// Chunk of the bound zero-copy pool
    Frame(XskBuff),
}

/// One receive ring slot as seen by the buffer pool
#[derive(Debug, Default)]
pub struct RxDescriptor {
    pub(crate) dma: DmaAddr,
    pub(crate) adj: usize,
    pub(crate) buf: RxBuf,
    pub(crate) skb: Option<NetBuf>,
}

impl RxDescriptor {
    /// Empty descriptor
    pub fn new() -> Self {
        Self::default()
    }

    /// Live mapping, or [`DmaAddr::NONE`]
    pub fn dma(&self) -> DmaAddr {
        self.dma
    }

    /// Metadata bytes the driver places in front of the frame
    pub fn adj(&self) -> usize {
        self.adj
    }

    /// Whether no buffer, mapping or packet is attached
    pub fn is_empty(&self) -> bool {
        self.dma.is_none() && matches!(self.buf, RxBuf::Empty) && self.skb.is_none() && self.adj == 0
    }

    /// Kind of buffer attached
    pub fn kind(&self) -> Option<BufferMode> {
        match self.buf {
            RxBuf::Empty => None,
            RxBuf::Slab { .. } => Some(BufferMode::Slab),
            RxBuf::Page { .. } => Some(BufferMode::Paged),
            RxBuf::Frame(_) => Some(BufferMode::ExternallyOwned),
        }
    }

    /// Page and half offset, in paged mode
    pub fn page(&self) -> Option<(PageId, usize)> {
        match self.buf {
            RxBuf::Page { page, offset, .. } => Some((page, offset)),
            _ => None,
        }
    }

    /// Whether a finished packet waits to be taken
    pub fn has_packet(&self) -> bool {
        self.skb.is_some()
    }

    /// Take the packet a successful `get` produced
    ///
    /// Must happen before the next `avail`, which drops a packet left behind.
    pub fn take_packet(&mut self) -> Option<NetBuf> {
        self.skb.take()
    }

    /// Hand a packet back for [`put`](ReceiveBufferPool::put)
    pub fn replace_packet(&mut self, buf: NetBuf) -> Option<NetBuf> {
        self.skb.replace(buf)
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Buffer strategy of one receive queue
pub(crate) trait BufferStrategy: Send + std::fmt::Debug {
    fn mode(&self) -> BufferMode;

    /// Attach a fresh buffer and map it
    fn alloc(&mut self, desc: &mut RxDescriptor) -> Result<(), MemoryError>;

    /// Address the device writes the packet to
    fn dma_address(&self, desc: &RxDescriptor) -> DmaAddr;

    /// Whether the descriptor can be posted as is
    fn avail(&mut self, desc: &mut RxDescriptor) -> bool {
        !desc.dma.is_none()
    }

    /// Finish a received packet of `len` bytes
    fn get(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error>;

    /// Take back a produced packet without delivering it
    fn put(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error>;

    /// Release everything attached to the descriptor
    fn free(&mut self, desc: &mut RxDescriptor);

    fn recycle_page(&mut self, _desc: &mut RxDescriptor) {}
}

/// What a strategy needs from its device
#[derive(Clone)]
pub(crate) struct RxContext {
    pub(crate) platform: Arc<dyn DmaPlatform>,
    pub(crate) shared: Arc<DeviceShared>,
    pub(crate) filter: Arc<FilterEngine>,
    pub(crate) queue: u32,
    pub(crate) buf_size: usize,
    pub(crate) adj: usize,
}

impl std::fmt::Debug for RxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxContext")
            .field("queue", &self.queue)
            .field("buf_size", &self.buf_size)
            .field("adj", &self.adj)
            .finish_non_exhaustive()
    }
}

/// Receive buffer pool of one queue
#[derive(Debug)]
pub struct ReceiveBufferPool {
    queue: u32,
    strategy: Box<dyn BufferStrategy>,
}

impl ReceiveBufferPool {
    pub(crate) fn new(ctx: RxContext, selection: ModeSelection, pool: Option<Arc<ZeroCopyPool>>) -> Self {
        let queue = ctx.queue;
        let strategy: Box<dyn BufferStrategy> = match (selection.mode, pool) {
            (BufferMode::ExternallyOwned, Some(pool)) => Box::new(zc::ZeroCopyRx::new(ctx, pool)),
            (BufferMode::Paged, _) => Box::new(paged::PagedRx::new(ctx, selection.page_size)),
            _ => Box::new(slab::SlabRx::new(ctx)),
        };
        tracing::debug!("rx queue {}: {} buffers", queue, strategy.mode());
        Self { queue, strategy }
    }

    /// Queue index
    pub fn queue(&self) -> u32 {
        self.queue
    }

    /// Buffer mode
    pub fn mode(&self) -> BufferMode {
        self.strategy.mode()
    }

    /// Attach and map a fresh buffer
    ///
    /// A descriptor that still holds a live mapping is left alone.
    ///
    /// # Errors
    ///
    /// [`MemoryError`] on allocation or mapping failure, after which the
    /// descriptor is empty. In zero-copy mode an empty pool also asks the
    /// consumer for a wakeup.
    pub fn alloc(&mut self, desc: &mut RxDescriptor) -> Result<(), MemoryError> {
        if !desc.dma.is_none() {
            return Ok(());
        }
        if !desc.is_empty() {
            self.strategy.free(desc);
            desc.clear();
        }
        self.strategy.alloc(desc)
    }

    /// Bus address to post, or [`DmaAddr::NONE`] without a live mapping
    pub fn dma_address(&self, desc: &RxDescriptor) -> DmaAddr {
        if desc.dma.is_none() {
            return DmaAddr::NONE;
        }
        self.strategy.dma_address(desc)
    }

    /// Whether the descriptor can be posted without a new `alloc`
    pub fn avail(&mut self, desc: &mut RxDescriptor) -> bool {
        self.strategy.avail(desc)
    }

    /// Finish a packet of `len` bytes the device wrote
    ///
    /// On success the packet is ready for [`RxDescriptor::take_packet`].
    ///
    /// # Errors
    ///
    /// [`Error::Unavailable`] when a program consumed the packet,
    /// [`Error::Busy`] when a zero-copy frame must wait for a wakeup,
    /// [`Error::Param`] for a descriptor without a mapping or an oversized
    /// length, and [`Error::Memory`] if the delivered buffer cannot be
    /// allocated.
    pub fn get(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error> {
        self.strategy.get(desc, len)
    }

    /// Take back the packet `get` produced so the slot can be posted again
    ///
    /// # Errors
    ///
    /// [`Error::Param`] if the packet is not the buffer the descriptor was
    /// allocated with; the descriptor is emptied.
    pub fn put(&mut self, desc: &mut RxDescriptor, len: usize) -> Result<(), Error> {
        self.strategy.put(desc, len)
    }

    /// Release the descriptor's buffer and zero it
    pub fn free(&mut self, desc: &mut RxDescriptor) {
        self.strategy.free(desc);
        desc.clear();
    }

    /// Reuse the other half of the descriptor's page, or give the page up
    pub fn recycle_page(&mut self, desc: &mut RxDescriptor) {
        self.strategy.recycle_page(desc);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::hooks::{NoRedirect, NoTxQueues, Redirector, TxQueues};
    use crate::iommu::SoftIommu;
    use crate::tx::TransmitBufferResolver;
    use pktdma_core::{EngineConfig, NetifConfig};

    pub(crate) struct Fixture {
        pub(crate) iommu: Arc<SoftIommu>,
        pub(crate) shared: Arc<DeviceShared>,
        pub(crate) filter: Arc<FilterEngine>,
    }

    impl Fixture {
        pub(crate) fn new(paged: bool) -> Self {
            Self::with(paged, Arc::new(NoTxQueues), Arc::new(NoRedirect))
        }

        pub(crate) fn with(paged: bool, txq: Arc<dyn TxQueues>, redirector: Arc<dyn Redirector>) -> Self {
            let mut config = EngineConfig::default();
            config.device.page_buffer_mode = paged;
            let mut netif = NetifConfig::new(1);
            netif.bind_chan = Some(0);
            config.netifs.push(netif);

            let iommu = Arc::new(SoftIommu::with_node(0));
            let shared = DeviceShared::new(64, 0);
            let platform: Arc<dyn DmaPlatform> = iommu.clone();
            let filter = Arc::new(FilterEngine::new(
                &config,
                Arc::clone(&shared),
                Arc::new(TransmitBufferResolver::new(platform, false)),
                txq,
                redirector,
            ));
            Self {
                iommu,
                shared,
                filter,
            }
        }

        pub(crate) fn ctx(&self) -> RxContext {
            RxContext {
                platform: self.iommu.clone(),
                shared: Arc::clone(&self.shared),
                filter: Arc::clone(&self.filter),
                queue: 0,
                buf_size: 1536,
                adj: 0,
            }
        }
    }

    pub(crate) fn ethernet(len: usize) -> Vec<u8> {
        let mut frame: Vec<u8> = (0..len).map(|i| i as u8).collect();
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame
    }
}
