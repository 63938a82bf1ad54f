//! Collaborator seams.
//!
//! The engine does not own transmit rings, the poll scheduler or other
//! interfaces on the host. It reaches them through the traits in this module,
//! which the driver around the engine implements.

use crate::filter::RedirectTarget;
use crate::frame::XdpFrame;
use crate::tx::{TransmitBufferResolver, TxBuf, TxError};
use pktdma_core::Error;
use thiserror::Error as ThisError;

/// Transmit rings of the device
pub trait TxQueues: Send + Sync {
    /// Submit `buf` on transmit queue `queue`
    ///
    /// Implementations resolve the buffer with `resolver` before posting it
    /// and hand it back inside the error when the ring cannot take it.
    fn xmit(&self, resolver: &TransmitBufferResolver, queue: u32, buf: TxBuf) -> Result<(), TxError>;
}

/// Poll scheduling handshake
pub trait PollControl: Send + Sync {
    /// Stop every queue and release posted receive descriptors
    fn suspend(&self) -> Result<(), Error>;

    /// Restart the queues, reselecting their buffer mode
    fn resume(&self) -> Result<(), Error>;

    /// Schedule a poll of `queue`
    fn schedule(&self, queue: u32);
}

/// Redirect failures reported by [`Redirector`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum RedirectError {
    /// Target has no buffer to take the frame
    #[error("no buffers")]
    NoBufs,

    /// Target ring is full
    #[error("no space")]
    NoSpace,

    /// No such target
    #[error("no redirect target {0:?}")]
    NoTarget(RedirectTarget),
}

impl RedirectError {
    /// Whether the target was merely out of room
    pub fn is_exhaustion(&self) -> bool {
        matches!(self, Self::NoBufs | Self::NoSpace)
    }
}

/// Delivery of redirected frames to other interfaces on the host
pub trait Redirector: Send + Sync {
    /// Queue `frame` for delivery to `netif`
    fn redirect(&self, netif: u32, frame: XdpFrame) -> Result<(), RedirectError>;

    /// Deliver everything queued since the last flush
    fn flush(&self);
}

/// [`PollControl`] for a device without a poller attached
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPoll;

impl PollControl for NoopPoll {
    fn suspend(&self) -> Result<(), Error> {
        Ok(())
    }

    fn resume(&self) -> Result<(), Error> {
        Ok(())
    }

    fn schedule(&self, _queue: u32) {}
}

/// [`Redirector`] that knows no targets
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRedirect;

impl Redirector for NoRedirect {
    fn redirect(&self, netif: u32, _frame: XdpFrame) -> Result<(), RedirectError> {
        Err(RedirectError::NoTarget(RedirectTarget::Netif(netif)))
    }

    fn flush(&self) {}
}

/// [`TxQueues`] for a device whose transmit rings are not up
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTxQueues;

impl TxQueues for NoTxQueues {
    fn xmit(&self, _resolver: &TransmitBufferResolver, _queue: u32, buf: TxBuf) -> Result<(), TxError> {
        Err(TxError::new(Error::Busy, Some(buf)))
    }
}
