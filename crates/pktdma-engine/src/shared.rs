//! Device-wide shared state.
//!
//! Page reference counts and the per-netif in-flight user counts are the
//! only values touched from more than one queue at a time, so both live
//! behind a single device lock. Everything else is owned by its queue.

use crate::page::PageArena;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

#[derive(Debug, Default, Clone, Copy)]
struct Users {
    count: usize,
    waiting: bool,
}

/// State protected by the device lock
pub(crate) struct SharedState {
    pub(crate) pages: PageArena,
    users: HashMap<u32, Users>,
}

/// Lock plus the condition the quiesce path waits on
pub(crate) struct DeviceShared {
    state: Mutex<SharedState>,
    idle: Condvar,
}

impl DeviceShared {
    pub(crate) fn new(max_pages: usize, reserve_pages: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SharedState {
                pages: PageArena::new(max_pages, reserve_pages),
                users: HashMap::new(),
            }),
            idle: Condvar::new(),
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SharedState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count one more packet in flight towards `netif`
    pub(crate) fn enter(self: &Arc<Self>, netif: u32) -> InFlight {
        let mut state = self.lock();
        state.users.entry(netif).or_default().count += 1;
        InFlight {
            shared: Arc::clone(self),
            netif,
        }
    }

    /// Packets currently in flight towards `netif`
    pub(crate) fn in_flight(&self, netif: u32) -> usize {
        self.lock().users.get(&netif).map_or(0, |u| u.count)
    }

    /// Block until no packet is in flight towards `netif`
    ///
    /// Returns `false` if `timeout` expires first.
    pub(crate) fn wait_idle(&self, netif: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let users = state.users.entry(netif).or_default();
            if users.count == 0 {
                users.waiting = false;
                return true;
            }
            users.waiting = true;

            let now = Instant::now();
            if now >= deadline {
                users.waiting = false;
                return false;
            }
            state = match self.idle.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    fn leave(&self, netif: u32) {
        let mut state = self.lock();
        let Some(users) = state.users.get_mut(&netif) else {
            return;
        };
        users.count = users.count.saturating_sub(1);
        if users.count == 0 && users.waiting {
            users.waiting = false;
            trace!("netif {} idle, waking waiter", netif);
            self.idle.notify_all();
        }
    }
}

/// One packet in flight towards a netif
///
/// Dropping the guard is the disposal: the count is decremented under the
/// device lock and a registered waiter is woken when it reaches zero.
pub struct InFlight {
    shared: Arc<DeviceShared>,
    netif: u32,
}

impl InFlight {
    /// Netif the packet is destined for
    pub fn netif(&self) -> u32 {
        self.netif
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.shared.leave(self.netif);
    }
}

impl std::fmt::Debug for InFlight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlight").field("netif", &self.netif).finish()
    }
}
