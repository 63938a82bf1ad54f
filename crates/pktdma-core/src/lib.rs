//! # pktdma Core
//!
//! Data model shared by every layer of the pktdma packet-buffer engine.
//!
//! This crate provides:
//! - The internal packet header carried in front of every DMA buffer
//! - Decoding of header attributes into an explicit buffer origin
//! - The control-plane encapsulation wire header (bit-exact)
//! - VLAN tag insertion for egress frames
//! - Error taxonomy shared by receive, transmit and filter paths
//! - Engine configuration (TOML, serde defaults)
//!
//! ## Buffer layout
//!
//! ```text
//! ┌──────────────┬───────────────────┬──────────────────────────────┐
//! │ PacketHeader │ metadata          │ Ethernet frame               │
//! │ 32 bytes     │ meta_len bytes    │ data_len bytes (incl. FCS)   │
//! └──────────────┴───────────────────┴──────────────────────────────┘
//! ```
//!
//! The same 32 bytes are reinterpreted as an [`EncapHeader`] when an interface
//! exchanges packets with the control plane in encapsulated form.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod dump;
pub mod error;
pub mod header;
pub mod vlan;

pub use config::{DebugConfig, DeviceConfig, EncapConfig, EngineConfig, NetifConfig, NetifKind};
pub use error::{ConfigError, Error, HeaderError, MemoryError};
pub use header::{EncapFlags, EncapHeader, FrameKind, Origin, PacketAttrs, PacketHeader};

/// Size of the internal packet header prefixed to every buffer
pub const PKT_HDR_SIZE: usize = 32;

/// DMA alignment of receive buffer data
pub const RXB_ALIGN: usize = 32;

/// Headroom reserved in front of received packet data
pub const RXB_RESV: usize = RXB_ALIGN + PKT_HDR_SIZE;

/// Metadata reservation when the device does not carry metadata inline
pub const RXB_META: usize = 64;

/// Tailroom kept behind a receive buffer for stack bookkeeping
pub const RXB_TAILROOM: usize = 320;

/// Cache line used for receive buffer sizing
pub const CACHE_LINE: usize = 64;

/// Ethernet address length
pub const ETH_ALEN: usize = 6;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

/// Ethernet frame check sequence length
pub const ETH_FCS_LEN: usize = 4;

/// 802.1Q tag length
pub const VLAN_HLEN: usize = 4;

/// 802.1Q tag protocol identifier
pub const ETH_P_8021Q: u16 = 0x8100;

/// 802.1ad tag protocol identifier
pub const ETH_P_8021AD: u16 = 0x88A8;

/// Round `len` up to the next multiple of `align` (power of two)
#[inline]
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Bytes one receive buffer of `len` payload bytes occupies inside a page
///
/// Covers the reserved headroom, the payload rounded to a cache line and the
/// tailroom the host stack expects behind the data.
#[inline]
pub const fn rx_buf_footprint(len: usize) -> usize {
    align_up(RXB_RESV + len, CACHE_LINE) + RXB_TAILROOM
}
