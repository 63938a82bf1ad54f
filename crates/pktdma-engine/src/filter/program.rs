//! Filter programs and their verdicts.

use std::fmt;

/// Where a redirect verdict sends the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectTarget {
    /// Another interface on the host
    Netif(u32),
    /// The receive ring of the bound zero-copy pool
    ZeroCopy,
}

/// Verdict of a filter program
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpAction {
    /// Program failure
    Aborted,
    /// Discard the packet
    Drop,
    /// Deliver to the host stack
    Pass,
    /// Send back out of this device
    Tx,
    /// Hand to another consumer
    Redirect(RedirectTarget),
    /// Verdict code the engine does not know
    Unknown(u32),
}

/// Packet view handed to a program
#[derive(Debug)]
pub struct XdpContext<'a> {
    data: &'a mut [u8],
    ingress: u32,
    queue: u32,
}

impl<'a> XdpContext<'a> {
    pub(crate) fn new(data: &'a mut [u8], ingress: u32, queue: u32) -> Self {
        Self {
            data,
            ingress,
            queue,
        }
    }

    /// Packet bytes, starting at the encapsulation header when the netif
    /// uses one and at the Ethernet header otherwise
    pub fn data(&self) -> &[u8] {
        self.data
    }

    /// Mutable packet bytes
    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    /// Netif the packet was steered to
    pub fn ingress_netif(&self) -> u32 {
        self.ingress
    }

    /// Receive queue
    pub fn rx_queue(&self) -> u32 {
        self.queue
    }
}

/// Program attached to a netif
pub trait FilterProgram: Send + Sync {
    /// Decide what happens to one packet
    fn run(&self, ctx: &mut XdpContext<'_>) -> XdpAction;

    /// Name for logs
    fn name(&self) -> &str {
        "anonymous"
    }
}

impl<F> FilterProgram for F
where
    F: Fn(&mut XdpContext<'_>) -> XdpAction + Send + Sync,
{
    fn run(&self, ctx: &mut XdpContext<'_>) -> XdpAction {
        self(ctx)
    }
}

impl fmt::Debug for dyn FilterProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterProgram")
            .field("name", &self.name())
            .finish()
    }
}
