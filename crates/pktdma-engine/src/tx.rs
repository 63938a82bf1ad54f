//! Transmit buffer resolution.
//!
//! Every buffer handed to a transmit ring comes from one of three owners: the
//! host stack, the filter path, or the zero-copy socket. The origin recorded
//! in the packet header decides how the buffer is mapped for the device and
//! what completing it means. Socket-owned buffers are never mapped or freed
//! here; the pool's region mapping already covers them and the socket gets
//! them back through the completion ring.

use crate::dma::{DmaAddr, DmaDirection, DmaPlatform};
use crate::frame::XdpFrame;
use crate::netbuf::NetBuf;
use crate::xsk::{XdpDesc, ZeroCopyPool};
use pktdma_core::{Error, FrameKind, HeaderError, Origin, PKT_HDR_SIZE, PacketHeader};
use std::sync::Arc;
use thiserror::Error as ThisError;
use tracing::{debug, trace};

/// Buffer submitted for transmit
#[derive(Debug)]
pub enum TxBuf {
    /// Host stack buffer
    Stack(NetBuf),
    /// Frame from the filter path
    Frame(XdpFrame),
    /// Descriptor from a zero-copy pool's transmit ring
    Socket {
        /// Ring descriptor
        desc: XdpDesc,
        /// Pool owning the chunk
        pool: Arc<ZeroCopyPool>,
    },
}

impl TxBuf {
    /// Internal header at the front of the buffer
    pub fn header(&self) -> Result<PacketHeader, HeaderError> {
        match self {
            Self::Stack(buf) => PacketHeader::read(buf.data()),
            Self::Frame(frame) => PacketHeader::read(frame.data()),
            Self::Socket { desc, pool } => {
                let bytes = pool.umem().read(desc.addr, PKT_HDR_SIZE).ok_or(
                    HeaderError::TooShort {
                        expected: PKT_HDR_SIZE,
                        actual: 0,
                    },
                )?;
                PacketHeader::read(&bytes)
            }
        }
    }

    /// Buffer length
    pub fn len(&self) -> usize {
        match self {
            Self::Stack(buf) => buf.len(),
            Self::Frame(frame) => frame.len(),
            Self::Socket { desc, .. } => desc.len as usize,
        }
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn accepts(&self, origin: Origin) -> bool {
        matches!(
            (self, origin),
            (Self::Stack(_), Origin::Plain)
                | (Self::Frame(_), Origin::FilterRedirectFrame(_) | Origin::ZeroCopyAction)
                | (Self::Socket { .. }, Origin::ZeroCopySocketOwned)
        )
    }
}

/// Transmit failure, carrying the buffer back when the caller still owns it
#[derive(Debug, ThisError)]
#[error("{error}")]
pub struct TxError {
    /// What went wrong
    pub error: Error,
    /// Buffer returned to the caller; `None` when it was freed
    pub buf: Option<TxBuf>,
}

impl TxError {
    /// Build an error returning `buf`
    pub fn new(error: Error, buf: Option<TxBuf>) -> Self {
        Self { error, buf }
    }

    /// Drop the buffer and keep the error
    pub fn into_error(self) -> Error {
        self.error
    }
}

/// Resolved transmit descriptor
#[derive(Debug)]
pub struct TxDescriptor {
    dma: DmaAddr,
    len: usize,
    origin: Origin,
    buf: Option<TxBuf>,
}

impl TxDescriptor {
    /// Descriptor holding nothing
    pub fn empty() -> Self {
        Self {
            dma: DmaAddr::NONE,
            len: 0,
            origin: Origin::Plain,
            buf: None,
        }
    }

    /// Bus address the device reads from
    pub fn dma(&self) -> DmaAddr {
        self.dma
    }

    /// Bytes the device reads
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the descriptor holds no buffer
    pub fn is_empty(&self) -> bool {
        self.buf.is_none()
    }

    /// Origin decoded from the header
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Buffer behind the descriptor
    pub fn buf(&self) -> Option<&TxBuf> {
        self.buf.as_ref()
    }
}

impl Default for TxDescriptor {
    fn default() -> Self {
        Self::empty()
    }
}

/// Maps transmit buffers for the device and completes them
pub struct TransmitBufferResolver {
    platform: Arc<dyn DmaPlatform>,
    meta_oob: bool,
}

impl TransmitBufferResolver {
    /// Create a resolver
    ///
    /// With `meta_oob` set the device takes metadata out of band, so the
    /// mapped range starts behind the metadata block instead of covering it.
    pub fn new(platform: Arc<dyn DmaPlatform>, meta_oob: bool) -> Self {
        Self { platform, meta_oob }
    }

    /// Classify `buf` and make it readable by the device
    ///
    /// # Errors
    ///
    /// Mapping failures are [`Error::Memory`]. Header problems and a buffer
    /// whose origin does not fit its kind are [`Error::Param`] or
    /// [`Error::Header`]. Stack buffers are freed on failure; every other
    /// buffer comes back inside the error.
    pub fn resolve(&self, queue: u32, buf: TxBuf) -> Result<TxDescriptor, TxError> {
        let hdr = match buf.header() {
            Ok(hdr) => hdr,
            Err(e) => return Err(fail(e.into(), buf)),
        };
        let origin = hdr.attrs.origin();
        if !buf.accepts(origin) {
            return Err(fail(
                Error::Param(format!("{:?} header on a mismatched buffer", origin)),
                buf,
            ));
        }

        let meta = hdr.meta_len as usize;
        let len = hdr.data_len as usize + if self.meta_oob { 0 } else { meta };
        let start = PKT_HDR_SIZE + if self.meta_oob { meta } else { 0 };
        if start + len > buf.len() {
            return Err(fail(
                HeaderError::LengthMismatch {
                    expected: start + len,
                    actual: buf.len(),
                }
                .into(),
                buf,
            ));
        }

        let mut buf = buf;
        let mapped = match &mut buf {
            TxBuf::Socket { desc, pool } => {
                // same frame start as the mapped origins, past out-of-band metadata
                let addr = desc.addr + start as u64;
                match pool.raw_dma(addr) {
                    Some(dma) => {
                        pool.raw_sync_for_device(addr, len);
                        Ok(dma)
                    }
                    None => Err(pktdma_core::MemoryError::Mapping { len }),
                }
            }
            TxBuf::Frame(frame) => {
                self.platform
                    .map_single(frame.ptr_at(start), len, DmaDirection::ToDevice)
            }
            TxBuf::Stack(nb) => self
                .platform
                .map_single(nb.ptr_at(start), len, DmaDirection::ToDevice),
        };

        match mapped {
            Ok(dma) => {
                trace!("tx{}: resolved {:?} {}+{}", queue, origin, dma, len);
                Ok(TxDescriptor {
                    dma,
                    len,
                    origin,
                    buf: Some(buf),
                })
            }
            Err(e) => {
                debug!("tx{}: {:?} mapping failed: {}", queue, origin, e);
                Err(fail(e.into(), buf))
            }
        }
    }

    /// Release a transmitted buffer and clear the descriptor
    ///
    /// Completing an empty descriptor does nothing.
    pub fn complete(&self, queue: u32, desc: &mut TxDescriptor) {
        let Some(buf) = desc.buf.take() else {
            *desc = TxDescriptor::empty();
            return;
        };

        match buf {
            TxBuf::Socket { pool, .. } => pool.tx_completed(1),
            TxBuf::Frame(frame) => {
                self.platform
                    .unmap_single(desc.dma, desc.len, DmaDirection::ToDevice);
                if let Some(pool) = frame.zc_pool() {
                    pool.action_completed(1);
                }
                if matches!(desc.origin, Origin::FilterRedirectFrame(FrameKind::Action)) {
                    trace!("tx{}: action frame done", queue);
                }
                frame.release();
            }
            TxBuf::Stack(nb) => {
                self.platform
                    .unmap_single(desc.dma, desc.len, DmaDirection::ToDevice);
                drop(nb);
            }
        }
        *desc = TxDescriptor::empty();
    }
}

impl std::fmt::Debug for TransmitBufferResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransmitBufferResolver")
            .field("meta_oob", &self.meta_oob)
            .finish_non_exhaustive()
    }
}

fn fail(error: Error, buf: TxBuf) -> TxError {
    match buf {
        TxBuf::Stack(_) => TxError::new(error, None),
        other => TxError::new(error, Some(other)),
    }
}
