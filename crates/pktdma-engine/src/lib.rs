//! # pktdma Engine
//!
//! Packet-buffer lifecycle and zero-copy I/O for DMA-capable network devices.
//!
//! This crate provides:
//! - Receive buffer strategies: slab buffers, half-page flip recycling and
//!   buffers borrowed from a zero-copy pool
//! - Transmit buffer resolution by origin, with DMA mapping and completion
//! - A per-packet filter engine with steering, programs and redirects
//! - Zero-copy pool binding, need-wakeup signalling and the transmit drain
//!   worker
//! - A software IOMMU for hosts without a real DMA platform
//!
//! ## Receive path
//!
//! ```text
//!  Device::rx_pool(q) ──▶ ReceiveBufferPool ──alloc──▶ RxDescriptor ──▶ device
//!                               │
//!                        get(desc, len)
//!                               │
//!            ┌──────────────────┼────────────────────┐
//!            ▼                  ▼                    ▼
//!      Pass: NetBuf       Tx / Redirect         Drop: repost
//! ```
//!
//! The driver around the engine owns the descriptor rings and the poll loop.
//! It reaches the engine through [`Device`] and supplies transmit rings, poll
//! scheduling and redirect delivery through the traits in [`hooks`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod device;
pub mod dma;
pub mod filter;
pub mod frame;
pub mod hooks;
pub mod iommu;
pub mod mode;
pub mod netbuf;
pub mod netif;
pub mod numa;
pub mod page;
pub mod rx;
mod shared;
pub mod tx;
pub mod worker;
pub mod xsk;

pub use device::{Device, DeviceBuilder};
pub use dma::{DmaAddr, DmaAttrs, DmaDirection, DmaPlatform, DmaRegion};
pub use filter::{
    FilterEngine, FilterProgram, RedirectTarget, SteerDest, SteerRule, TxPath, TxPrep,
    TxPreprocessor, XdpAction, XdpContext,
};
pub use frame::XdpFrame;
pub use hooks::{NoRedirect, NoTxQueues, NoopPoll, PollControl, RedirectError, Redirector, TxQueues};
pub use iommu::{IommuCounts, IommuError, SoftIommu};
pub use mode::{BufferMode, BufferModeSelector, ModeSelection};
pub use netbuf::NetBuf;
pub use netif::Netif;
pub use page::{PageFrag, PageId, PageInfo};
pub use rx::{ReceiveBufferPool, RxDescriptor};
pub use shared::InFlight;
pub use tx::{TransmitBufferResolver, TxBuf, TxDescriptor, TxError};
pub use worker::{TxDrain, TxDrainWorker};
pub use xsk::{PoolConfig, PoolStats, RxRefusal, UmemConfig, XdpDesc, XskError, ZeroCopyPool};
