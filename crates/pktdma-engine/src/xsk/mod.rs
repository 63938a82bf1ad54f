//! Zero-copy socket buffer pool.
//!
//! The pool is shared with an external consumer through four rings:
//!
//! ```text
//!   consumer ──fill──▶ engine      chunks the device may receive into
//!   engine   ──rx────▶ consumer    received packets
//!   consumer ──tx────▶ engine      packets to transmit
//!   engine   ──comp──▶ consumer    chunks whose transmit finished
//! ```
//!
//! Chunks the engine took from the fill ring and has not yet handed back sit
//! on an internal free list. Every method is safe to call from the poll path
//! and the transmit drain worker at the same time.

pub mod ring;
pub mod umem;

pub use ring::DescRing;
pub use umem::{UMEM_MIN_CHUNK_SIZE, Umem, UmemConfig, XDP_PACKET_HEADROOM};

use crate::dma::{DmaAddr, DmaDirection, DmaPlatform};
use crossbeam_queue::ArrayQueue;
use pktdma_core::MemoryError;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Zero-copy pool errors
#[derive(Debug, Error)]
pub enum XskError {
    /// Invalid configuration
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// Backing memory could not be allocated
    #[error("failed to allocate {size} bytes of pool memory")]
    Alloc {
        /// Requested size
        size: usize,
    },
}

impl From<XskError> for pktdma_core::Error {
    fn from(err: XskError) -> Self {
        match err {
            XskError::InvalidConfig(msg) => Self::Param(msg),
            XskError::Alloc { size } => Self::Memory(MemoryError::Alloc { size }),
        }
    }
}

/// Ring descriptor: a umem address and a length
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    /// Umem address of the first byte
    pub addr: u64,
    /// Length in bytes
    pub len: u32,
    /// Option bits (unused by the engine)
    pub options: u32,
}

impl XdpDesc {
    /// Descriptor for `len` bytes at `addr`
    pub const fn new(addr: u64, len: u32) -> Self {
        Self {
            addr,
            len,
            options: 0,
        }
    }
}

/// Why the pool refused a received packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxRefusal {
    /// No free chunk to copy into
    NoBufs,
    /// Receive ring full or packet larger than a chunk
    NoSpace,
}

/// One chunk checked out of the pool by the receive path
///
/// Not `Clone`: the handle is the ownership.
#[derive(Debug, PartialEq, Eq)]
pub struct XskBuff {
    addr: u64,
    data: usize,
}

impl XskBuff {
    /// Chunk base address
    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// Offset of the data start within the chunk
    pub fn data_offset(&self) -> usize {
        self.data
    }

    /// Move the data start by `delta` bytes
    pub(crate) fn advance(&mut self, delta: usize) {
        self.data += delta;
    }

    pub(crate) fn set_data_offset(&mut self, offset: usize) {
        self.data = offset;
    }
}

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Backing memory
    pub umem: UmemConfig,
    /// Entries in each of the four rings
    pub ring_size: u32,
    /// Consumer participates in the need-wakeup protocol
    pub need_wakeup: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            umem: UmemConfig::default(),
            ring_size: 512,
            need_wakeup: true,
        }
    }
}

/// Pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Socket-owned transmits completed
    pub tx_completed: u64,
    /// Action-copy transmits completed
    pub action_completed: u64,
    /// Packets placed on the receive ring
    pub rx_delivered: u64,
}

struct PoolDma {
    base: DmaAddr,
    platform: Arc<dyn DmaPlatform>,
}

/// Externally-owned zero-copy buffer pool
pub struct ZeroCopyPool {
    umem: Umem,
    free: ArrayQueue<u64>,
    fill: DescRing<u64>,
    rx: DescRing<XdpDesc>,
    tx: DescRing<XdpDesc>,
    comp: DescRing<u64>,
    uses_need_wakeup: bool,
    rx_need_wakeup: AtomicBool,
    tx_need_wakeup: AtomicBool,
    dma: RwLock<Option<PoolDma>>,
    tx_completed: AtomicU64,
    action_completed: AtomicU64,
    rx_delivered: AtomicU64,
}

impl ZeroCopyPool {
    /// Create a pool; every chunk starts out owned by the consumer
    ///
    /// # Errors
    ///
    /// Returns an error if the memory configuration is invalid or the region
    /// cannot be allocated.
    pub fn new(config: PoolConfig) -> Result<Arc<Self>, XskError> {
        let umem = Umem::new(config.umem)?;
        let frames = umem.num_frames();
        Ok(Arc::new(Self {
            free: ArrayQueue::new(frames),
            fill: DescRing::new(config.ring_size),
            rx: DescRing::new(config.ring_size),
            tx: DescRing::new(config.ring_size),
            comp: DescRing::new(config.ring_size),
            uses_need_wakeup: config.need_wakeup,
            rx_need_wakeup: AtomicBool::new(false),
            tx_need_wakeup: AtomicBool::new(false),
            dma: RwLock::new(None),
            tx_completed: AtomicU64::new(0),
            action_completed: AtomicU64::new(0),
            rx_delivered: AtomicU64::new(0),
            umem,
        }))
    }

    /// Backing memory
    pub fn umem(&self) -> &Umem {
        &self.umem
    }

    /// Counter snapshot
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            tx_completed: self.tx_completed.load(Ordering::Relaxed),
            action_completed: self.action_completed.load(Ordering::Relaxed),
            rx_delivered: self.rx_delivered.load(Ordering::Relaxed),
        }
    }

    // Consumer side

    /// Offer a chunk for receive
    pub fn fill(&self, addr: u64) -> bool {
        self.fill.produce(self.umem.chunk_base(addr))
    }

    /// Next received packet
    pub fn recv(&self) -> Option<XdpDesc> {
        self.rx.consume()
    }

    /// Queue a packet for transmit
    pub fn send(&self, desc: XdpDesc) -> bool {
        self.tx.produce(desc)
    }

    /// Drain the completion ring
    pub fn completions(&self) -> Vec<u64> {
        std::iter::from_fn(|| self.comp.consume()).collect()
    }

    /// Whether the engine asked for a receive wakeup
    pub fn rx_needs_wakeup(&self) -> bool {
        self.rx_need_wakeup.load(Ordering::Acquire)
    }

    /// Whether the engine asked for a transmit wakeup
    pub fn tx_needs_wakeup(&self) -> bool {
        self.tx_need_wakeup.load(Ordering::Acquire)
    }

    // Engine side

    /// Whether the consumer participates in the need-wakeup protocol
    pub fn uses_need_wakeup(&self) -> bool {
        self.uses_need_wakeup
    }

    pub(crate) fn set_rx_need_wakeup(&self) {
        if self.uses_need_wakeup {
            self.rx_need_wakeup.store(true, Ordering::Release);
        }
    }

    pub(crate) fn set_tx_need_wakeup(&self) {
        if self.uses_need_wakeup {
            self.tx_need_wakeup.store(true, Ordering::Release);
        }
    }

    pub(crate) fn clear_need_wakeup(&self) {
        self.rx_need_wakeup.store(false, Ordering::Release);
        self.tx_need_wakeup.store(false, Ordering::Release);
    }

    /// Map the whole region for device access
    pub(crate) fn dma_map(&self, platform: &Arc<dyn DmaPlatform>) -> Result<(), MemoryError> {
        let base = platform.map_single(
            self.umem.as_ptr(),
            self.umem.size(),
            DmaDirection::Bidirectional,
        )?;
        debug!("xsk pool mapped at {} ({} bytes)", base, self.umem.size());
        *self.dma.write().unwrap_or_else(|p| p.into_inner()) = Some(PoolDma {
            base,
            platform: Arc::clone(platform),
        });
        Ok(())
    }

    pub(crate) fn dma_unmap(&self) {
        let mapping = self.dma.write().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(m) = mapping {
            m.platform
                .unmap_single(m.base, self.umem.size(), DmaDirection::Bidirectional);
        }
    }

    /// Whether the region is currently mapped
    pub fn is_mapped(&self) -> bool {
        self.dma.read().map(|d| d.is_some()).unwrap_or(false)
    }

    /// Bus address of a umem address
    pub fn raw_dma(&self, addr: u64) -> Option<DmaAddr> {
        let dma = self.dma.read().ok()?;
        dma.as_ref().map(|m| m.base.offset(addr as usize))
    }

    pub(crate) fn raw_sync_for_device(&self, addr: u64, len: usize) {
        if let Ok(dma) = self.dma.read() {
            if let Some(m) = dma.as_ref() {
                m.platform
                    .sync_for_device(m.base, addr as usize, len, DmaDirection::Bidirectional);
            }
        }
    }

    pub(crate) fn raw_sync_for_cpu(&self, addr: u64, len: usize) {
        if let Ok(dma) = self.dma.read() {
            if let Some(m) = dma.as_ref() {
                m.platform
                    .sync_for_cpu(m.base, addr as usize, len, DmaDirection::Bidirectional);
            }
        }
    }

    /// Check out a chunk for receive, refilling from the fill ring
    pub(crate) fn alloc(&self) -> Option<XskBuff> {
        let addr = self.free.pop().or_else(|| self.fill.consume())?;
        Some(XskBuff {
            addr,
            data: self.umem.data_offset(),
        })
    }

    /// Return a checked-out chunk to the free list
    pub(crate) fn free(&self, buff: XskBuff) {
        if self.free.push(buff.addr).is_err() {
            warn!("xsk free list overflow at {:#x}", buff.addr);
        }
    }

    /// Bus address of a buffer's data start
    pub(crate) fn buff_dma(&self, buff: &XskBuff) -> Option<DmaAddr> {
        self.raw_dma(buff.addr + buff.data as u64)
    }

    /// Bytes of a checked-out buffer from its chunk start
    pub(crate) fn buff_chunk_mut(&self, buff: &mut XskBuff) -> Option<&mut [u8]> {
        // SAFETY: the buffer handle is the exclusive owner of its chunk and the
        // returned slice borrows the handle mutably.
        unsafe { self.umem.chunk_tail_mut(buff.addr) }
    }

    /// Publish a buffer on the receive ring without copying
    ///
    /// The descriptor becomes visible at the next [`flush_rx`](Self::flush_rx).
    pub(crate) fn receive_zc(&self, buff: XskBuff, len: usize) -> Result<(), (RxRefusal, XskBuff)> {
        let desc = XdpDesc::new(buff.addr + buff.data as u64, len as u32);
        if !self.rx.produce_pending(desc) {
            return Err((RxRefusal::NoSpace, buff));
        }
        self.rx_delivered.fetch_add(1, Ordering::Relaxed);
        trace!("xsk rx zc {:#x}+{}", desc.addr, desc.len);
        Ok(())
    }

    /// Copy a packet into a fresh chunk and queue it on the receive ring
    pub(crate) fn receive_copy(&self, data: &[u8]) -> Result<(), RxRefusal> {
        let mut buff = self.alloc().ok_or(RxRefusal::NoBufs)?;
        let offset = buff.data;
        if offset + data.len() > self.umem.frame_size() {
            self.free(buff);
            return Err(RxRefusal::NoSpace);
        }
        if let Some(chunk) = self.buff_chunk_mut(&mut buff) {
            chunk[offset..offset + data.len()].copy_from_slice(data);
        }
        self.receive_zc(buff, data.len()).map_err(|(refusal, buff)| {
            self.free(buff);
            refusal
        })
    }

    /// Publish pending receive descriptors
    pub fn flush_rx(&self) -> u32 {
        self.rx.flush()
    }

    /// Look at the next transmit descriptor, reserving its completion slot
    pub(crate) fn peek_tx(&self) -> Option<XdpDesc> {
        if self.comp.available() == 0 {
            return None;
        }
        let desc = self.tx.peek()?;
        self.comp.produce_pending(desc.addr);
        Some(desc)
    }

    /// Hand every peeked transmit slot back to the consumer
    pub(crate) fn release_tx(&self) {
        self.tx.release();
    }

    /// Publish `n` transmit completions
    pub fn tx_completed(&self, n: u32) {
        let done = self.comp.submit(n);
        self.tx_completed.fetch_add(u64::from(done), Ordering::Relaxed);
    }

    /// Account `n` finished transmits of action copies
    pub fn action_completed(&self, n: u32) {
        self.action_completed.fetch_add(u64::from(n), Ordering::Relaxed);
    }

    /// Transmit bytes of a socket-owned descriptor, up to its chunk end
    ///
    /// # Safety
    /// The descriptor must have been peeked from the transmit ring and not yet
    /// completed, so the engine owns its chunk, and no other view of the
    /// chunk may exist while the slice lives.
    pub(crate) unsafe fn tx_chunk_mut(&self, desc: &XdpDesc) -> Option<&mut [u8]> {
        // SAFETY: forwarded caller contract.
        unsafe { self.umem.chunk_tail_mut(desc.addr) }
    }
}

impl std::fmt::Debug for ZeroCopyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZeroCopyPool")
            .field("umem", &self.umem)
            .field("free", &self.free.len())
            .field("uses_need_wakeup", &self.uses_need_wakeup)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}
