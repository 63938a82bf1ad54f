//! Zero-copy transmit drain.
//!
//! Descriptors the consumer queues on a bound pool's transmit ring are moved
//! to the device either by a dedicated [`TxDrainWorker`] thread or, with
//! `napi_tx` configured, from the poll path through
//! [`Device::xsk_napi_tx`](crate::Device::xsk_napi_tx). Both go through
//! [`TxLookahead::drain`].
//!
//! The need-wakeup flag is armed only once a peek finds the ring empty, and
//! the ring is checked once more after arming so a descriptor queued in
//! between is not left waiting for a wakeup that never comes.

use crate::filter::{FilterEngine, XskBinding};
use crate::xsk::XdpDesc;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use pktdma_core::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

/// Result of one drain pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxDrain {
    /// Descriptors handed to a transmit queue
    pub sent: usize,
    /// Descriptors dropped after a non-transient failure
    pub failed: usize,
    /// Stopped on a busy transmit queue; a descriptor is held for later
    pub busy: bool,
}

/// Descriptor carried over between drain passes
///
/// A descriptor refused with [`Error::Busy`] stays here, with its
/// completion slot reserved, until the next pass retries it.
#[derive(Debug, Default)]
pub(crate) struct TxLookahead {
    held: Option<XdpDesc>,
}

impl TxLookahead {
    pub(crate) fn is_holding(&self) -> bool {
        self.held.is_some()
    }

    fn next(&mut self, binding: &XskBinding) -> Option<XdpDesc> {
        let pool = &binding.pool;
        if let Some(desc) = self.held.take().or_else(|| pool.peek_tx()) {
            return Some(desc);
        }
        pool.set_tx_need_wakeup();
        pool.peek_tx()
    }

    /// Move up to `budget` descriptors from the transmit ring to the device
    pub(crate) fn drain(&mut self, filter: &FilterEngine, binding: &XskBinding, budget: usize) -> TxDrain {
        let pool = &binding.pool;
        let mut out = TxDrain::default();

        while out.sent + out.failed < budget {
            let Some(mut desc) = self.next(binding) else {
                break;
            };
            match filter.xsk_desc_xmit(binding, &mut desc) {
                Ok(()) => {
                    pool.release_tx();
                    out.sent += 1;
                }
                Err(Error::Busy) => {
                    trace!("xsk tx: queue busy, holding {:#x}", desc.addr);
                    self.held = Some(desc);
                    out.busy = true;
                    break;
                }
                Err(e) => {
                    warn!("xsk tx: dropping descriptor {:#x}+{}: {}", desc.addr, desc.len, e);
                    pool.tx_completed(1);
                    pool.release_tx();
                    out.failed += 1;
                }
            }
        }
        out
    }
}

/// Background thread draining the bound pool's transmit ring
///
/// Sleeps until [`signal`](Self::signal)ed, then drains until the ring is
/// empty or a transmit queue reports busy.
pub struct TxDrainWorker {
    signal: Sender<()>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TxDrainWorker {
    /// Start the worker, pinned to the last CPU when `pin` is set
    ///
    /// # Errors
    ///
    /// Returns [`Error::Worker`] if the thread cannot be spawned.
    pub(crate) fn spawn(filter: Arc<FilterEngine>, pin: bool) -> Result<Self, Error> {
        let (signal, kicks) = bounded(1);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name("pktdma-xsk-tx".into())
            .spawn(move || {
                #[cfg(target_os = "linux")]
                if pin {
                    let cpu = num_cpus::get().saturating_sub(1);
                    match pin_to_cpu(cpu) {
                        Ok(()) => debug!("xsk tx worker pinned to CPU {}", cpu),
                        Err(e) => warn!("xsk tx worker: failed to pin to CPU {}: {}", cpu, e),
                    }
                }
                #[cfg(not(target_os = "linux"))]
                let _ = pin;

                run(&filter, &kicks, &flag);
            })
            .map_err(|e| Error::Worker(format!("failed to spawn xsk tx worker: {}", e)))?;

        info!("xsk tx worker started");
        Ok(Self {
            signal,
            stop,
            handle: Some(handle),
        })
    }

    /// Wake the worker; a wakeup already pending absorbs this one
    pub fn signal(&self) {
        if let Err(TrySendError::Disconnected(())) = self.signal.try_send(()) {
            warn!("xsk tx worker is gone");
        }
    }

    /// Stop the worker and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.stop.store(true, Ordering::Release);
        let _ = self.signal.try_send(());
        if handle.join().is_err() {
            warn!("xsk tx worker panicked");
        }
        debug!("xsk tx worker stopped");
    }
}

impl Drop for TxDrainWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TxDrainWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxDrainWorker")
            .field("running", &self.handle.is_some())
            .finish_non_exhaustive()
    }
}

fn run(filter: &FilterEngine, kicks: &Receiver<()>, stop: &AtomicBool) {
    let mut lookahead = TxLookahead::default();
    while kicks.recv().is_ok() {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let Some(binding) = filter.binding() else {
            continue;
        };
        let res = lookahead.drain(filter, &binding, usize::MAX);
        trace!("xsk tx worker: {:?}", res);
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(cpu: usize) -> Result<(), String> {
    use std::mem;

    // SAFETY: cpu_set_t is plain data, zeroed before use; pid 0 is the
    // calling thread and the size matches the set passed in.
    unsafe {
        let mut set: libc::cpu_set_t = mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let ret = libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set);
        if ret != 0 {
            return Err(format!("sched_setaffinity returned {}", ret));
        }
    }
    Ok(())
}
