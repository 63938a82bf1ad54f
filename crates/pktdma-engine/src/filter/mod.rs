//! Per-packet filter engine.
//!
//! Owns the netifs of a device, the programs attached to them, the receive
//! steering table and the zero-copy pool binding, and routes packets between
//! them:
//!
//! ```text
//!  rx get ──▶ steer ──▶ netif program ──┬─ Pass ─────▶ host stack
//!                                       ├─ Tx ───────▶ frame_xmit ─▶ TxQueues
//!                                       ├─ Redirect ─▶ Redirector / pool rx ring
//!                                       └─ Drop
//!
//!  xdp_xmit / pool tx ring ──▶ TxPreprocessor ──▶ TxQueues
//! ```
//!
//! The receive half lives in [`rx`](self::rx); transmit-time header
//! population in [`tx`](self::tx).

mod program;
pub(crate) mod rx;
pub mod steer;
pub mod tx;

pub use program::{FilterProgram, RedirectTarget, XdpAction, XdpContext};
pub use steer::{MAX_STEER_RULES, SteerDest, SteerRule, SteerTable};
pub use tx::{TxPath, TxPrep, TxPreprocessor};

use crate::frame::XdpFrame;
use crate::hooks::{Redirector, TxQueues};
use crate::netif::Netif;
use crate::shared::{DeviceShared, InFlight};
use crate::tx::{TransmitBufferResolver, TxBuf, TxError};
use crate::xsk::{XdpDesc, ZeroCopyPool};
use pktdma_core::dump::hexdump;
use pktdma_core::{EncapConfig, EngineConfig, Error, NetifConfig, PacketHeader};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, trace};

/// A zero-copy pool bound to one queue through one netif
#[derive(Debug, Clone)]
pub(crate) struct XskBinding {
    pub(crate) netif: Arc<Netif>,
    pub(crate) queue: u32,
    pub(crate) pool: Arc<ZeroCopyPool>,
}

/// Filter engine of one device
pub struct FilterEngine {
    shared: Arc<DeviceShared>,
    resolver: Arc<TransmitBufferResolver>,
    txq: Arc<dyn TxQueues>,
    redirector: Arc<dyn Redirector>,
    netifs: RwLock<HashMap<u32, Arc<Netif>>>,
    steer: RwLock<SteerTable>,
    binding: RwLock<Option<XskBinding>>,
    programs: AtomicUsize,
    pending_flush: AtomicBool,
    encap: EncapConfig,
    fcs_len: usize,
    rx_meta: usize,
    tx_queues: u32,
    page_buffer_mode: bool,
    pkt_dump: bool,
}

impl FilterEngine {
    pub(crate) fn new(
        config: &EngineConfig,
        shared: Arc<DeviceShared>,
        resolver: Arc<TransmitBufferResolver>,
        txq: Arc<dyn TxQueues>,
        redirector: Arc<dyn Redirector>,
    ) -> Self {
        let netifs = config
            .netifs
            .iter()
            .map(|n| (n.id, Arc::new(Netif::new(n.clone()))))
            .collect();
        Self {
            shared,
            resolver,
            txq,
            redirector,
            netifs: RwLock::new(netifs),
            steer: RwLock::new(SteerTable::new()),
            binding: RwLock::new(None),
            programs: AtomicUsize::new(0),
            pending_flush: AtomicBool::new(false),
            encap: config.encap.clone(),
            fcs_len: config.device.fcs_len(),
            rx_meta: config.device.rx_adj + config.device.rx_meta_inline,
            tx_queues: config.device.tx_queues,
            page_buffer_mode: config.device.page_buffer_mode,
            pkt_dump: config.debug.pkt_dump,
        }
    }

    // Netifs

    /// Register a netif
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] if the id is taken, [`Error::Param`] if the
    /// metadata bytes do not match the metadata length.
    pub fn add_netif(&self, config: NetifConfig) -> Result<Arc<Netif>, Error> {
        if config.meta_data.len() != config.meta_len || config.meta_len > u8::MAX as usize {
            return Err(Error::Param(format!(
                "netif {}: {} metadata bytes for meta_len {}",
                config.id,
                config.meta_data.len(),
                config.meta_len
            )));
        }
        let mut netifs = self.netifs.write().unwrap_or_else(|p| p.into_inner());
        if netifs.contains_key(&config.id) {
            return Err(Error::Exists(format!("netif {}", config.id)));
        }
        let netif = Arc::new(Netif::new(config));
        netifs.insert(netif.id(), Arc::clone(&netif));
        debug!("netif {} added", netif.id());
        Ok(netif)
    }

    /// Unregister a netif, detaching its program
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown id, [`Error::Param`] while a
    /// zero-copy pool is bound through the netif.
    pub fn remove_netif(&self, id: u32) -> Result<(), Error> {
        if self.binding().is_some_and(|b| b.netif.id() == id) {
            return Err(Error::Param(format!("netif {} has a bound zero-copy pool", id)));
        }
        let netif = self
            .netifs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id)
            .ok_or_else(|| Error::NotFound(format!("netif {}", id)))?;
        if netif.replace_program(None).is_some() {
            self.programs.fetch_sub(1, Ordering::AcqRel);
        }
        debug!("netif {} removed", id);
        Ok(())
    }

    /// Netif `id`
    pub fn netif(&self, id: u32) -> Option<Arc<Netif>> {
        self.netifs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&id)
            .cloned()
    }

    fn netif_for_chan(&self, chan: u32) -> Option<Arc<Netif>> {
        self.netifs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .find(|n| n.config().bind_chan == Some(chan))
            .cloned()
    }

    // Programs

    /// Attach `program` to netif `id`, replacing any previous one
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown netif; [`Error::ModeNotEnabled`]
    /// unless paged buffering is on or the netif has a bound zero-copy pool.
    pub fn attach(&self, id: u32, program: Arc<dyn FilterProgram>) -> Result<(), Error> {
        let netif = self
            .netif(id)
            .ok_or_else(|| Error::NotFound(format!("netif {}", id)))?;
        if !self.page_buffer_mode && !netif.is_xsk_zc() {
            return Err(Error::ModeNotEnabled(
                "programs need paged buffers or a zero-copy pool".into(),
            ));
        }
        let name = program.name().to_owned();
        if netif.replace_program(Some(program)).is_none() {
            self.programs.fetch_add(1, Ordering::AcqRel);
        }
        info!("netif {}: program '{}' attached", id, name);
        Ok(())
    }

    /// Detach the program from netif `id`
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown netif.
    pub fn detach(&self, id: u32) -> Result<(), Error> {
        let netif = self
            .netif(id)
            .ok_or_else(|| Error::NotFound(format!("netif {}", id)))?;
        if netif.replace_program(None).is_some() {
            self.programs.fetch_sub(1, Ordering::AcqRel);
            info!("netif {}: program detached", id);
        }
        Ok(())
    }

    /// Programs attached across all netifs
    pub fn programs_attached(&self) -> usize {
        self.programs.load(Ordering::Acquire)
    }

    pub(crate) fn has_programs(&self) -> bool {
        self.programs_attached() > 0
    }

    // Steering

    /// Add a steering rule, returning its id
    ///
    /// # Errors
    ///
    /// See [`SteerTable::create`].
    pub fn create_steer_rule(&self, rule: SteerRule) -> Result<u32, Error> {
        self.steer
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .create(rule)
    }

    /// Remove steering rule `id`
    ///
    /// # Errors
    ///
    /// See [`SteerTable::destroy`].
    pub fn destroy_steer_rule(&self, id: u32) -> Result<(), Error> {
        self.steer
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .destroy(id)
    }

    /// Steering rule `id`
    pub fn steer_rule(&self, id: u32) -> Option<SteerRule> {
        self.steer
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Steering rules in match order
    pub fn steer_rules(&self) -> Vec<SteerRule> {
        self.steer
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .rules()
            .to_vec()
    }

    /// Pick the netif for a packet on receive queue `queue`
    ///
    /// `buf` starts at the packet's internal header. A netif bound to the
    /// queue's channel takes everything; otherwise the rule table decides.
    pub(crate) fn steer(&self, queue: u32, buf: &[u8]) -> Result<(Arc<Netif>, InFlight), Error> {
        let chan = queue;
        if let Some(netif) = self.netif_for_chan(chan) {
            let guard = self.shared.enter(netif.id());
            return Ok((netif, guard));
        }

        let dest = self
            .steer
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .lookup(chan, buf)?;
        match dest {
            SteerDest::Netif(id) => {
                let netif = self.netif(id).ok_or(Error::NoHandler)?;
                let guard = self.shared.enter(id);
                Ok((netif, guard))
            }
            SteerDest::Stack => Err(Error::NoHandler),
        }
    }

    // Zero-copy binding

    pub(crate) fn binding(&self) -> Option<XskBinding> {
        self.binding
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub(crate) fn set_binding(&self, binding: Option<XskBinding>) -> Option<XskBinding> {
        let mut slot = self.binding.write().unwrap_or_else(|p| p.into_inner());
        std::mem::replace(&mut *slot, binding)
    }

    /// Queue the zero-copy pool is bound to
    pub fn bound_queue(&self) -> Option<u32> {
        self.binding().map(|b| b.queue)
    }

    /// Deliver every redirect made since the last flush
    ///
    /// Called once per poll batch, after the last redirect of the batch.
    pub fn flush(&self) {
        if !self.pending_flush.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(binding) = self.binding() {
            let published = binding.pool.flush_rx();
            trace!("flush: {} zero-copy rx descriptors", published);
        }
        self.redirector.flush();
    }

    pub(crate) fn mark_flush(&self) {
        self.pending_flush.store(true, Ordering::Release);
    }

    // Transmit

    fn preprocessor<'a>(&self, netif: &'a Netif, path: TxPath, act: bool) -> TxPreprocessor<'a> {
        TxPreprocessor {
            netif: netif.config(),
            sig: self.encap.pkt_sig,
            fcs_len: self.fcs_len,
            path,
            act,
        }
    }

    fn dump(&self, netif: &Netif, data: &[u8]) {
        if self.pkt_dump {
            debug!(
                "netif {} tx frame ({} bytes):\n{}",
                netif.id(),
                data.len(),
                hexdump(data)
            );
        }
    }

    fn submit(&self, queue: u32, buf: TxBuf) -> Result<(), Error> {
        self.txq
            .xmit(&self.resolver, queue, buf)
            .map_err(TxError::into_error)
    }

    /// Send a filter frame out of netif `netif`
    ///
    /// A queue-bound frame goes to its header queue; any other frame is
    /// offered to each transmit queue in turn until one accepts it.
    pub(crate) fn frame_xmit(&self, netif: &Netif, mut frame: XdpFrame, act: bool) -> Result<(), Error> {
        let mut len = frame.len();
        self.preprocessor(netif, TxPath::Frame, act)
            .run(frame.data_and_tail_mut(), &mut len)?;
        frame.set_len(len);
        self.dump(netif, frame.data());

        let hdr = PacketHeader::read(frame.data())?;
        let mut buf = TxBuf::Frame(frame);
        if hdr.attrs.is_queue_bound() {
            return self.submit(u32::from(hdr.queue_id), buf);
        }

        let mut last = Error::Busy;
        for queue in 0..self.tx_queues {
            match self.txq.xmit(&self.resolver, queue, buf) {
                Ok(()) => return Ok(()),
                Err(TxError {
                    error,
                    buf: Some(back),
                }) => {
                    last = error;
                    buf = back;
                }
                Err(TxError { error, buf: None }) => return Err(error),
            }
        }
        Err(last)
    }

    /// Send frames redirected into this device out of netif `netif`
    ///
    /// Stops at the first frame that cannot be sent; frames not sent are
    /// released. Returns how many were submitted.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown netif.
    pub fn xdp_xmit(&self, netif: u32, frames: Vec<XdpFrame>) -> Result<usize, Error> {
        let netif = self
            .netif(netif)
            .ok_or_else(|| Error::NotFound(format!("netif {}", netif)))?;
        let mut sent = 0;
        for frame in frames {
            if let Err(e) = self.frame_xmit(&netif, frame, false) {
                debug!("netif {}: xdp_xmit stopped after {}: {}", netif.id(), sent, e);
                break;
            }
            sent += 1;
        }
        Ok(sent)
    }

    /// Send a transmit action's copy of a zero-copy frame
    pub(crate) fn xsk_frame_xmit(
        &self,
        netif: &Netif,
        binding: &XskBinding,
        frame: XdpFrame,
    ) -> Result<(), Error> {
        let mut frame = frame.with_pool(Arc::clone(&binding.pool));
        let mut len = frame.len();
        self.preprocessor(netif, TxPath::ZeroCopy, true)
            .run(frame.data_and_tail_mut(), &mut len)?;
        frame.set_len(len);
        self.dump(netif, frame.data());

        let hdr = PacketHeader::read(frame.data())?;
        let queue = if hdr.attrs.is_queue_bound() {
            u32::from(hdr.queue_id)
        } else {
            binding.queue
        };
        self.submit(queue, TxBuf::Frame(frame))
    }

    /// Send one descriptor from the pool's transmit ring
    ///
    /// The descriptor length is updated to the cooked length, so a retry
    /// after [`Error::Busy`] finds the header already populated.
    pub(crate) fn xsk_desc_xmit(&self, binding: &XskBinding, desc: &mut XdpDesc) -> Result<(), Error> {
        let pool = &binding.pool;
        let mut len = desc.len as usize;
        let hdr = {
            // SAFETY: the descriptor was peeked from the transmit ring and is
            // not completed, so the engine owns its chunk; the slice is the
            // only view and ends with this block.
            let chunk = unsafe { pool.tx_chunk_mut(desc) }
                .ok_or_else(|| Error::Param(format!("descriptor {:#x} outside pool", desc.addr)))?;
            if len > chunk.len() {
                return Err(Error::Param(format!(
                    "descriptor {:#x}+{} crosses its chunk",
                    desc.addr, len
                )));
            }
            self.preprocessor(&binding.netif, TxPath::ZeroCopy, false)
                .run(chunk, &mut len)?;
            self.dump(&binding.netif, &chunk[..len]);
            PacketHeader::read(chunk)?
        };
        desc.len = len as u32;

        let queue = if hdr.attrs.is_queue_bound() {
            u32::from(hdr.queue_id)
        } else {
            binding.queue
        };
        self.submit(
            queue,
            TxBuf::Socket {
                desc: *desc,
                pool: Arc::clone(pool),
            },
        )
    }
}

impl std::fmt::Debug for FilterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterEngine")
            .field("programs", &self.programs_attached())
            .field("bound_queue", &self.bound_queue())
            .field("tx_queues", &self.tx_queues)
            .finish_non_exhaustive()
    }
}
