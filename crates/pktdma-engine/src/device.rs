//! Per-device context.
//!
//! [`Device`] owns everything one NIC shares across its queues: the DMA
//! platform, the page arena and in-flight counts, the transmit resolver, the
//! filter engine and the zero-copy binding with its transmit drain. The
//! poller builds one [`ReceiveBufferPool`] per receive queue from it and the
//! control plane attaches programs and binds pools through it.

use crate::dma::{DmaPlatform, DmaRegion};
use crate::filter::{FilterEngine, FilterProgram, SteerRule, XskBinding};
use crate::frame::XdpFrame;
use crate::hooks::{NoRedirect, NoTxQueues, NoopPoll, PollControl, Redirector, TxQueues};
use crate::iommu::SoftIommu;
use crate::mode::{BufferModeSelector, ModeSelection};
use crate::rx::{ReceiveBufferPool, RxContext};
use crate::shared::DeviceShared;
use crate::tx::TransmitBufferResolver;
use crate::worker::{TxDrain, TxDrainWorker, TxLookahead};
use crate::xsk::ZeroCopyPool;
use pktdma_core::{EngineConfig, Error, MemoryError, NetifConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builder for [`Device`]
///
/// Collaborators left unset fall back to a [`SoftIommu`] platform and the
/// no-op hooks.
pub struct DeviceBuilder {
    config: EngineConfig,
    platform: Option<Arc<dyn DmaPlatform>>,
    txq: Option<Arc<dyn TxQueues>>,
    poll: Option<Arc<dyn PollControl>>,
    redirector: Option<Arc<dyn Redirector>>,
}

impl DeviceBuilder {
    /// Start from a configuration
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            platform: None,
            txq: None,
            poll: None,
            redirector: None,
        }
    }

    /// DMA platform
    pub fn platform(mut self, platform: Arc<dyn DmaPlatform>) -> Self {
        self.platform = Some(platform);
        self
    }

    /// Transmit rings
    pub fn tx_queues(mut self, txq: Arc<dyn TxQueues>) -> Self {
        self.txq = Some(txq);
        self
    }

    /// Poll scheduling handshake
    pub fn poll_control(mut self, poll: Arc<dyn PollControl>) -> Self {
        self.poll = Some(poll);
        self
    }

    /// Redirect delivery to other interfaces
    pub fn redirector(mut self, redirector: Arc<dyn Redirector>) -> Self {
        self.redirector = Some(redirector);
        self
    }

    /// Validate the configuration and build the device
    ///
    /// # Errors
    ///
    /// Returns [`Error::Param`] if the configuration does not validate.
    pub fn build(self) -> Result<Device, Error> {
        self.config
            .validate()
            .map_err(|e| Error::Param(e.to_string()))?;

        let dev = &self.config.device;
        let platform = self
            .platform
            .unwrap_or_else(|| Arc::new(SoftIommu::new()));
        let shared = DeviceShared::new(dev.max_pages, dev.reserve_pages);
        let resolver = Arc::new(TransmitBufferResolver::new(
            Arc::clone(&platform),
            dev.tx_meta_out_of_band,
        ));
        let filter = Arc::new(FilterEngine::new(
            &self.config,
            Arc::clone(&shared),
            Arc::clone(&resolver),
            self.txq.unwrap_or_else(|| Arc::new(NoTxQueues)),
            self.redirector.unwrap_or_else(|| Arc::new(NoRedirect)),
        ));
        let selector = BufferModeSelector {
            page_buffer_mode: dev.page_buffer_mode,
            rx_meta_inline: dev.rx_meta_inline,
            base_page_size: dev.page_size,
        };

        debug!(
            "device: {} rx / {} tx queues, {} byte buffers, paged={}",
            dev.rx_queues, dev.tx_queues, dev.rx_buf_size, dev.page_buffer_mode
        );
        Ok(Device {
            platform,
            shared,
            resolver,
            filter,
            poll: self.poll.unwrap_or_else(|| Arc::new(NoopPoll)),
            selector,
            xsk: Mutex::new(XskState::default()),
            config: self.config,
        })
    }
}

#[derive(Debug, Default)]
struct XskState {
    worker: Option<TxDrainWorker>,
    lookahead: TxLookahead,
}

/// One DMA-capable network device
pub struct Device {
    config: EngineConfig,
    platform: Arc<dyn DmaPlatform>,
    shared: Arc<DeviceShared>,
    resolver: Arc<TransmitBufferResolver>,
    filter: Arc<FilterEngine>,
    poll: Arc<dyn PollControl>,
    selector: BufferModeSelector,
    xsk: Mutex<XskState>,
}

impl Device {
    /// Device with default collaborators
    ///
    /// # Errors
    ///
    /// Returns [`Error::Param`] if the configuration does not validate.
    pub fn new(config: EngineConfig) -> Result<Self, Error> {
        DeviceBuilder::new(config).build()
    }

    /// Start a [`DeviceBuilder`]
    pub fn builder(config: EngineConfig) -> DeviceBuilder {
        DeviceBuilder::new(config)
    }

    /// Configuration the device was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// DMA platform
    pub fn platform(&self) -> &Arc<dyn DmaPlatform> {
        &self.platform
    }

    /// Transmit buffer resolver, for the transmit rings
    pub fn resolver(&self) -> &Arc<TransmitBufferResolver> {
        &self.resolver
    }

    /// Filter engine
    pub fn filter(&self) -> &Arc<FilterEngine> {
        &self.filter
    }

    fn xsk(&self) -> MutexGuard<'_, XskState> {
        self.xsk.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn check_queue(&self, queue: u32, limit: u32) -> Result<(), Error> {
        if queue >= limit {
            return Err(Error::QueueOutOfRange { queue, limit });
        }
        Ok(())
    }

    // Receive buffers

    /// Buffer mode receive queue `queue` runs in right now
    pub fn select_mode(&self, queue: u32) -> ModeSelection {
        let bound = self.filter.bound_queue() == Some(queue);
        self.selector.select(self.config.device.rx_buf_size, bound)
    }

    /// Receive buffer pool for `queue`
    ///
    /// Called at queue (re)configuration; after a bind or unbind the poller
    /// rebuilds the pool of the affected queue between suspend and resume.
    ///
    /// # Errors
    ///
    /// [`Error::QueueOutOfRange`] for a queue the device does not have.
    pub fn rx_pool(&self, queue: u32) -> Result<ReceiveBufferPool, Error> {
        self.check_queue(queue, self.config.device.rx_queues)?;
        let selection = self.select_mode(queue);
        let pool = self
            .filter
            .binding()
            .filter(|b| b.queue == queue)
            .map(|b| b.pool);
        let ctx = RxContext {
            platform: Arc::clone(&self.platform),
            shared: Arc::clone(&self.shared),
            filter: Arc::clone(&self.filter),
            queue,
            buf_size: self.config.device.rx_buf_size,
            adj: self.config.device.rx_adj,
        };
        Ok(ReceiveBufferPool::new(ctx, selection, pool))
    }

    /// Coherent memory for a descriptor ring
    ///
    /// # Errors
    ///
    /// [`MemoryError`] if the platform cannot allocate it.
    pub fn ring_buf_alloc(&self, size: usize) -> Result<DmaRegion, MemoryError> {
        self.platform.alloc_coherent(size)
    }

    /// Release ring memory from [`ring_buf_alloc`](Self::ring_buf_alloc)
    pub fn ring_buf_free(&self, region: DmaRegion) {
        self.platform.free_coherent(region);
    }

    /// Receive pages currently allocated
    pub fn live_pages(&self) -> usize {
        self.shared.lock().pages.live_pages()
    }

    // Netifs and programs

    /// Register a netif
    ///
    /// # Errors
    ///
    /// See [`FilterEngine::add_netif`].
    pub fn add_netif(&self, config: NetifConfig) -> Result<(), Error> {
        self.filter.add_netif(config).map(|_| ())
    }

    /// Remove a netif
    ///
    /// # Errors
    ///
    /// See [`FilterEngine::remove_netif`].
    pub fn remove_netif(&self, id: u32) -> Result<(), Error> {
        self.filter.remove_netif(id)
    }

    /// Attach a program to netif `id`
    ///
    /// # Errors
    ///
    /// [`Error::ModeNotEnabled`] unless paged buffers are configured or the
    /// netif is bound to a zero-copy pool, [`Error::NotFound`] for an unknown
    /// netif.
    pub fn attach(&self, id: u32, program: Arc<dyn FilterProgram>) -> Result<(), Error> {
        self.filter.attach(id, program)
    }

    /// Detach the program of netif `id`
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown netif.
    pub fn detach(&self, id: u32) -> Result<(), Error> {
        self.filter.detach(id)
    }

    /// Add a steering rule, returning its id
    ///
    /// # Errors
    ///
    /// See [`FilterEngine::create_steer_rule`].
    pub fn create_steer_rule(&self, rule: SteerRule) -> Result<u32, Error> {
        self.filter.create_steer_rule(rule)
    }

    /// Remove a steering rule
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] for an unknown rule.
    pub fn destroy_steer_rule(&self, id: u32) -> Result<(), Error> {
        self.filter.destroy_steer_rule(id)
    }

    /// Steering rules in match order
    pub fn steer_rules(&self) -> Vec<SteerRule> {
        self.filter.steer_rules()
    }

    /// Packets in flight towards netif `id`
    pub fn in_flight(&self, id: u32) -> usize {
        self.shared.in_flight(id)
    }

    /// Wait until no packet is in flight towards netif `id`
    ///
    /// Returns `false` on timeout.
    pub fn wait_idle(&self, id: u32, timeout: Duration) -> bool {
        self.shared.wait_idle(id, timeout)
    }

    /// Deliver the redirects of the current poll batch
    pub fn flush_redirects(&self) {
        self.filter.flush();
    }

    /// Transmit frames redirected to netif `id` from elsewhere
    ///
    /// # Errors
    ///
    /// See [`FilterEngine::xdp_xmit`].
    pub fn xdp_xmit(&self, id: u32, frames: Vec<XdpFrame>) -> Result<usize, Error> {
        self.filter.xdp_xmit(id, frames)
    }

    // Zero-copy pools

    /// Queue holding the zero-copy binding, if any
    pub fn bound_queue(&self) -> Option<u32> {
        self.filter.bound_queue()
    }

    /// Bind `pool` to `queue` through netif `netif`
    ///
    /// Maps the pool, switches the queue to zero-copy buffers between a
    /// suspend and resume of the poller, and starts the transmit drain
    /// worker unless transmit is drained from the poll path.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyBound`] if any queue already has a pool,
    /// [`Error::QueueOutOfRange`], [`Error::NotFound`] for an unknown netif,
    /// and mapping or handshake failures. Nothing changes on failure.
    pub fn bind(&self, netif: u32, queue: u32, pool: Arc<ZeroCopyPool>) -> Result<(), Error> {
        let mut xsk = self.xsk();
        if let Some(bound) = self.filter.bound_queue() {
            return Err(Error::AlreadyBound { queue: bound });
        }
        let dev = &self.config.device;
        self.check_queue(queue, dev.rx_queues.min(dev.tx_queues))?;
        let netif = self
            .filter
            .netif(netif)
            .ok_or_else(|| Error::NotFound(format!("netif {}", netif)))?;

        pool.dma_map(&self.platform)?;
        if let Err(e) = self.poll.suspend() {
            pool.dma_unmap();
            return Err(e);
        }

        let worker = if dev.napi_tx {
            None
        } else {
            match TxDrainWorker::spawn(Arc::clone(&self.filter), dev.pin_tx_worker) {
                Ok(worker) => Some(worker),
                Err(e) => {
                    pool.dma_unmap();
                    if let Err(re) = self.poll.resume() {
                        warn!("bind rollback: resume failed: {}", re);
                    }
                    return Err(e);
                }
            }
        };

        netif.set_xsk_zc(true);
        self.filter.set_binding(Some(XskBinding {
            netif: Arc::clone(&netif),
            queue,
            pool,
        }));
        xsk.worker = worker;
        xsk.lookahead = TxLookahead::default();
        drop(xsk);

        self.poll.resume()?;
        info!("zero-copy pool bound to queue {} via netif {}", queue, netif.id());
        Ok(())
    }

    /// Undo [`bind`](Self::bind)
    ///
    /// The pool must have no descriptors in flight.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `queue` holds no binding, or a handshake
    /// failure.
    pub fn unbind(&self, queue: u32) -> Result<(), Error> {
        let mut xsk = self.xsk();
        if self.filter.bound_queue() != Some(queue) {
            return Err(Error::NotFound(format!("zero-copy binding on queue {}", queue)));
        }
        self.poll.suspend()?;

        if let Some(worker) = xsk.worker.take() {
            worker.stop();
        }
        xsk.lookahead = TxLookahead::default();
        if let Some(binding) = self.filter.set_binding(None) {
            binding.netif.set_xsk_zc(false);
            binding.pool.clear_need_wakeup();
            binding.pool.dma_unmap();
        }
        drop(xsk);

        self.poll.resume()?;
        info!("zero-copy pool unbound from queue {}", queue);
        Ok(())
    }

    /// Consumer wakeup for `queue`
    ///
    /// Clears the pool's need-wakeup flags, schedules a poll of the queue and
    /// kicks the transmit drain worker.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `queue` holds no binding.
    pub fn wakeup(&self, queue: u32) -> Result<(), Error> {
        let binding = self
            .filter
            .binding()
            .filter(|b| b.queue == queue)
            .ok_or_else(|| Error::NotFound(format!("zero-copy binding on queue {}", queue)))?;
        binding.pool.clear_need_wakeup();
        self.poll.schedule(queue);
        if let Some(worker) = self.xsk().worker.as_ref() {
            worker.signal();
        }
        Ok(())
    }

    /// Drain up to `budget` zero-copy transmit descriptors from the poll path
    ///
    /// With grouped interrupts the drain runs from queue 0's poll whatever
    /// queue the pool is bound to. Entering with no held descriptor arms the
    /// transmit need-wakeup flag.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] if `queue` does not drain the binding.
    pub fn xsk_napi_tx(&self, queue: u32, budget: usize) -> Result<TxDrain, Error> {
        let group_intr = self.config.device.group_intr;
        let binding = self
            .filter
            .binding()
            .filter(|b| queue == if group_intr { 0 } else { b.queue })
            .ok_or_else(|| Error::NotFound(format!("zero-copy binding drained on queue {}", queue)))?;
        let mut xsk = self.xsk();
        if !xsk.lookahead.is_holding() {
            binding.pool.set_tx_need_wakeup();
        }
        Ok(xsk.lookahead.drain(&self.filter, &binding, budget))
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Some(worker) = self.xsk().worker.take() {
            worker.stop();
        }
        if let Some(binding) = self.filter.set_binding(None) {
            binding.netif.set_xsk_zc(false);
            binding.pool.dma_unmap();
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("filter", &self.filter)
            .field("selector", &self.selector)
            .field("bound_queue", &self.filter.bound_queue())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{XdpAction, XdpContext};
    use crate::mode::BufferMode;
    use crate::xsk::{PoolConfig, UmemConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Poll {
        suspends: AtomicUsize,
        resumes: AtomicUsize,
        schedules: Mutex<Vec<u32>>,
    }

    impl PollControl for Poll {
        fn suspend(&self) -> Result<(), Error> {
            self.suspends.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&self) -> Result<(), Error> {
            self.resumes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn schedule(&self, queue: u32) {
            self.schedules.lock().unwrap().push(queue);
        }
    }

    fn config(napi_tx: bool) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.device.rx_queues = 4;
        config.device.tx_queues = 4;
        config.device.napi_tx = napi_tx;
        config.device.pin_tx_worker = false;
        config.netifs.push(NetifConfig::new(1));
        config
    }

    fn device(napi_tx: bool) -> (Device, Arc<SoftIommu>, Arc<Poll>) {
        let iommu = Arc::new(SoftIommu::with_node(0));
        let poll = Arc::new(Poll::default());
        let dev = Device::builder(config(napi_tx))
            .platform(iommu.clone())
            .poll_control(poll.clone())
            .build()
            .unwrap();
        (dev, iommu, poll)
    }

    fn pool() -> Arc<ZeroCopyPool> {
        ZeroCopyPool::new(PoolConfig {
            umem: UmemConfig {
                size: 16 * 2048,
                frame_size: 2048,
                headroom: 0,
            },
            ring_size: 8,
            need_wakeup: true,
        })
        .unwrap()
    }

    fn pass(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Pass
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config(false);
        config.device.rx_queues = 0;
        assert!(matches!(Device::new(config), Err(Error::Param(_))));
    }

    #[test]
    fn test_bind_switches_queue_mode() {
        let (dev, iommu, poll) = device(true);
        assert_eq!(dev.select_mode(1).mode, BufferMode::Slab);

        dev.bind(1, 1, pool()).unwrap();
        assert_eq!(dev.bound_queue(), Some(1));
        assert_eq!(dev.select_mode(1).mode, BufferMode::ExternallyOwned);
        assert_eq!(dev.select_mode(0).mode, BufferMode::Slab);
        assert_eq!(dev.rx_pool(1).unwrap().mode(), BufferMode::ExternallyOwned);
        assert_eq!(poll.suspends.load(Ordering::SeqCst), 1);
        assert_eq!(poll.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(iommu.live_mappings(), 1);

        dev.unbind(1).unwrap();
        assert_eq!(dev.bound_queue(), None);
        assert_eq!(dev.select_mode(1).mode, BufferMode::Slab);
        assert_eq!(iommu.live_mappings(), 0);
        assert_eq!(poll.resumes.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_second_bind_conflicts() {
        let (dev, iommu, _) = device(true);
        dev.bind(1, 1, pool()).unwrap();

        let err = dev.bind(1, 2, pool()).unwrap_err();
        assert!(matches!(err, Error::AlreadyBound { queue: 1 }));
        assert!(err.is_fatal());
        assert_eq!(dev.bound_queue(), Some(1));
        assert_eq!(dev.select_mode(1).mode, BufferMode::ExternallyOwned);
        assert_eq!(iommu.live_mappings(), 1);
    }

    #[test]
    fn test_bind_argument_errors() {
        let (dev, iommu, _) = device(true);
        assert!(matches!(
            dev.bind(1, 4, pool()),
            Err(Error::QueueOutOfRange { queue: 4, limit: 4 })
        ));
        assert!(matches!(dev.bind(9, 0, pool()), Err(Error::NotFound(_))));
        assert!(matches!(dev.unbind(0), Err(Error::NotFound(_))));
        assert!(matches!(dev.rx_pool(7), Err(Error::QueueOutOfRange { .. })));
        assert_eq!(iommu.live_mappings(), 0);
    }

    #[test]
    fn test_bind_enables_attach() {
        let (dev, _, _) = device(true);
        assert!(matches!(dev.attach(1, Arc::new(pass)), Err(Error::ModeNotEnabled(_))));
        dev.bind(1, 0, pool()).unwrap();
        dev.attach(1, Arc::new(pass)).unwrap();
        assert_eq!(dev.filter().programs_attached(), 1);
        dev.detach(1).unwrap();
    }

    #[test]
    fn test_wakeup_clears_flags_and_schedules() {
        let (dev, _, poll) = device(true);
        let pool = pool();
        dev.bind(1, 2, Arc::clone(&pool)).unwrap();

        assert_eq!(dev.xsk_napi_tx(2, 16).unwrap().sent, 0);
        assert!(pool.tx_needs_wakeup());

        dev.wakeup(2).unwrap();
        assert!(!pool.tx_needs_wakeup());
        assert_eq!(*poll.schedules.lock().unwrap(), vec![2]);
        assert!(matches!(dev.wakeup(0), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_napi_tx_arms_wakeup_on_entry() {
        let (dev, _, _) = device(true);
        let pool = pool();
        dev.bind(1, 1, Arc::clone(&pool)).unwrap();
        dev.wakeup(1).unwrap();
        assert!(!pool.tx_needs_wakeup());

        let drain = dev.xsk_napi_tx(1, 0).unwrap();
        assert_eq!(drain, TxDrain::default());
        assert!(pool.tx_needs_wakeup());
    }

    #[test]
    fn test_group_intr_drains_from_queue_zero() {
        let mut config = config(true);
        config.device.group_intr = true;
        let dev = Device::builder(config)
            .platform(Arc::new(SoftIommu::with_node(0)))
            .build()
            .unwrap();
        dev.bind(1, 2, pool()).unwrap();

        assert!(matches!(dev.xsk_napi_tx(2, 16), Err(Error::NotFound(_))));
        assert_eq!(dev.xsk_napi_tx(0, 16).unwrap().sent, 0);

        let (plain, _, _) = device(true);
        plain.bind(1, 2, pool()).unwrap();
        assert!(matches!(plain.xsk_napi_tx(0, 16), Err(Error::NotFound(_))));
        assert_eq!(plain.xsk_napi_tx(2, 16).unwrap().sent, 0);
    }

    #[test]
    fn test_worker_lifecycle() {
        let (dev, _, _) = device(false);
        dev.bind(1, 0, pool()).unwrap();
        assert!(dev.xsk().worker.is_some());
        dev.wakeup(0).unwrap();
        dev.unbind(0).unwrap();
        assert!(dev.xsk().worker.is_none());
    }

    #[test]
    fn test_ring_buf_alloc_free() {
        let (dev, iommu, _) = device(true);
        let mut ring = dev.ring_buf_alloc(4096).unwrap();
        ring.as_mut_slice()[0] = 0x5a;
        assert_eq!(iommu.device_read(ring.bus_base(), 1).unwrap(), vec![0x5a]);
        dev.ring_buf_free(ring);
        assert_eq!(iommu.counts().free_coherent, 1);
    }
}
