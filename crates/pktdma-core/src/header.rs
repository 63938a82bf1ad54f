//! Internal packet header and control-plane encapsulation header.
//!
//! Both headers occupy the same 32 bytes at the front of a packet buffer. The
//! internal header keeps its multi-byte fields in little-endian order; the
//! encapsulation header is big-endian on the wire. Fields sharing an offset
//! (`pkt_sig`, `data_len`, `meta_len`) are the same storage, so converting
//! between the two forms is a matter of rewriting those fields in the other
//! byte order.
//!
//! ```text
//!  0       6       12   14   16   18   20 21 22   24   26   28 29 30   32
//!  ├─dst───┼─src───┼tpid┼tci─┼type┼sig─┼op┼fl┼tid─┼len─┼rsvd┼ml┼qi┼attr┤
//! ```

use crate::PKT_HDR_SIZE;
use crate::error::HeaderError;

const OFF_DST: usize = 0;
const OFF_SRC: usize = 6;
const OFF_TPID: usize = 12;
const OFF_TCI: usize = 14;
const OFF_ETH_TYPE: usize = 16;
const OFF_SIG: usize = 18;
const OFF_OPCODE: usize = 20;
const OFF_FLAGS: usize = 21;
const OFF_TRANS_ID: usize = 22;
const OFF_DATA_LEN: usize = 24;
const OFF_META_LEN: usize = 28;
const OFF_QUEUE_ID: usize = 29;
const OFF_ATTRS: usize = 30;

/// Packet attribute bits carried in the internal header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketAttrs(u16);

impl PacketAttrs {
    /// Metadata carries a module header
    pub const HIGIG: u16 = 1 << 0;
    /// Pause frame
    pub const PAUSE: u16 = 1 << 1;
    /// Purge frame
    pub const PURGE: u16 = 1 << 2;
    /// Transmit on the queue named by `queue_id`
    pub const BIND_QUE: u16 = 1 << 3;
    /// Do not pad short frames
    pub const NO_PAD: u16 = 1 << 4;
    /// Header already populated
    pub const COOKED: u16 = 1 << 5;
    /// Buffer is a filter frame
    pub const XDP_FRM: u16 = 1 << 6;
    /// Buffer is a zero-copy pool frame
    pub const XSK_ZC: u16 = 1 << 7;
    /// Frame produced by a filter action
    pub const XDP_ACT: u16 = 1 << 8;

    /// Create attributes from raw bits
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Raw bit value
    pub const fn bits(&self) -> u16 {
        self.0
    }

    /// Set the given bits
    pub fn insert(&mut self, bits: u16) {
        self.0 |= bits;
    }

    /// Clear the given bits
    pub fn remove(&mut self, bits: u16) {
        self.0 &= !bits;
    }

    /// Whether all of the given bits are set
    pub const fn contains(&self, bits: u16) -> bool {
        self.0 & bits == bits
    }

    /// Whether the header has been populated by an earlier pass
    pub const fn is_cooked(&self) -> bool {
        self.contains(Self::COOKED)
    }

    /// Whether the frame is pinned to the header's queue
    pub const fn is_queue_bound(&self) -> bool {
        self.contains(Self::BIND_QUE)
    }

    /// Decode the buffer origin
    pub const fn origin(&self) -> Origin {
        let act = self.contains(Self::XDP_ACT);
        if self.contains(Self::XSK_ZC) {
            if act {
                Origin::ZeroCopyAction
            } else {
                Origin::ZeroCopySocketOwned
            }
        } else if self.contains(Self::XDP_FRM) {
            if act {
                Origin::FilterRedirectFrame(FrameKind::Action)
            } else {
                Origin::FilterRedirectFrame(FrameKind::Redirected)
            }
        } else {
            Origin::Plain
        }
    }
}

/// How a filter frame came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Redirected into this device from another interface
    Redirected,
    /// Built by a transmit action of this device's filter
    Action,
}

/// Who owns the memory behind a transmit buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Host stack buffer owned by the engine
    Plain,
    /// Frame handed over by the filter path
    FilterRedirectFrame(FrameKind),
    /// Copy of a zero-copy frame made by a filter action
    ZeroCopyAction,
    /// Frame in the zero-copy pool, owned by the socket
    ZeroCopySocketOwned,
}

impl Origin {
    /// Attribute bits that encode this origin
    pub const fn attr_bits(&self) -> u16 {
        match self {
            Self::Plain => 0,
            Self::FilterRedirectFrame(FrameKind::Redirected) => PacketAttrs::XDP_FRM,
            Self::FilterRedirectFrame(FrameKind::Action) => {
                PacketAttrs::XDP_FRM | PacketAttrs::XDP_ACT
            }
            Self::ZeroCopyAction => PacketAttrs::XSK_ZC | PacketAttrs::XDP_ACT,
            Self::ZeroCopySocketOwned => PacketAttrs::XSK_ZC,
        }
    }

    /// Whether completing this buffer requires a DMA unmap
    pub const fn needs_unmap(&self) -> bool {
        !matches!(self, Self::ZeroCopySocketOwned)
    }
}

/// Internal packet header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Frame bytes behind the header and metadata
    pub data_len: u16,
    /// Metadata bytes between header and frame
    pub meta_len: u8,
    /// Queue the packet arrived on or is bound to
    pub queue_id: u8,
    /// Attribute bits
    pub attrs: PacketAttrs,
    /// Signature marking a processed packet
    pub pkt_sig: u16,
}

impl PacketHeader {
    /// Read the internal header from the front of `buf`
    pub fn read(buf: &[u8]) -> Result<Self, HeaderError> {
        check_len(buf)?;
        Ok(Self {
            data_len: u16::from_le_bytes([buf[OFF_DATA_LEN], buf[OFF_DATA_LEN + 1]]),
            meta_len: buf[OFF_META_LEN],
            queue_id: buf[OFF_QUEUE_ID],
            attrs: PacketAttrs(u16::from_le_bytes([buf[OFF_ATTRS], buf[OFF_ATTRS + 1]])),
            pkt_sig: u16::from_le_bytes([buf[OFF_SIG], buf[OFF_SIG + 1]]),
        })
    }

    /// Write the header fields into the front of `buf`
    ///
    /// Bytes outside the header's own fields are left untouched.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), HeaderError> {
        check_len(buf)?;
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&self.data_len.to_le_bytes());
        buf[OFF_META_LEN] = self.meta_len;
        buf[OFF_QUEUE_ID] = self.queue_id;
        buf[OFF_ATTRS..OFF_ATTRS + 2].copy_from_slice(&self.attrs.bits().to_le_bytes());
        buf[OFF_SIG..OFF_SIG + 2].copy_from_slice(&self.pkt_sig.to_le_bytes());
        Ok(())
    }

    /// Total buffer length implied by the header
    pub fn packet_len(&self) -> usize {
        PKT_HDR_SIZE + self.meta_len as usize + self.data_len as usize
    }

    /// Offset of the Ethernet frame within the buffer
    pub fn frame_offset(&self) -> usize {
        PKT_HDR_SIZE + self.meta_len as usize
    }
}

/// Encapsulation header flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncapFlags(u8);

impl EncapFlags {
    /// Metadata carries a module header
    pub const MODHDR: u8 = 1 << 2;
    /// Pause frame
    pub const PAUSE: u8 = 1 << 4;
    /// Purge frame
    pub const PURGE: u8 = 1 << 5;
    /// Queue-bound frame
    pub const BIND_QUE: u8 = 1 << 6;
    /// Do not pad
    pub const NO_PAD: u8 = 1 << 7;

    /// Create flags from a raw byte
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Add the header-modified flag
    pub fn with_modhdr(mut self) -> Self {
        self.0 |= Self::MODHDR;
        self
    }

    /// Raw byte value
    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    /// Translate to internal attribute bits
    pub fn to_attrs(&self) -> PacketAttrs {
        let mut attrs = PacketAttrs::default();
        for (flag, attr) in [
            (Self::MODHDR, PacketAttrs::HIGIG),
            (Self::PAUSE, PacketAttrs::PAUSE),
            (Self::PURGE, PacketAttrs::PURGE),
            (Self::BIND_QUE, PacketAttrs::BIND_QUE),
            (Self::NO_PAD, PacketAttrs::NO_PAD),
        ] {
            if self.0 & flag != 0 {
                attrs.insert(attr);
            }
        }
        attrs
    }
}

/// Control-plane encapsulation header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncapHeader {
    /// Destination MAC
    pub dst_mac: [u8; 6],
    /// Source MAC
    pub src_mac: [u8; 6],
    /// VLAN tag protocol id
    pub vlan_tpid: u16,
    /// VLAN tag control
    pub vlan_tci: u16,
    /// Ethertype
    pub eth_type: u16,
    /// Signature
    pub pkt_sig: u16,
    /// Operation code
    pub op_code: u8,
    /// Flags
    pub flags: EncapFlags,
    /// Transaction id
    pub trans_id: u16,
    /// Encapsulated payload length
    pub data_len: u16,
    /// Metadata bytes following the header
    pub meta_len: u8,
}

impl EncapHeader {
    /// Opcode for packets delivered to the control plane
    pub const OPCODE_RX: u8 = 0x10;
    /// Opcode for packets sent by the control plane
    pub const OPCODE_TX: u8 = 0x20;

    /// Parse the encapsulation header from the front of `buf`
    pub fn parse(buf: &[u8]) -> Result<Self, HeaderError> {
        check_len(buf)?;
        let be16 = |off: usize| u16::from_be_bytes([buf[off], buf[off + 1]]);

        let mut dst_mac = [0u8; 6];
        let mut src_mac = [0u8; 6];
        dst_mac.copy_from_slice(&buf[OFF_DST..OFF_DST + 6]);
        src_mac.copy_from_slice(&buf[OFF_SRC..OFF_SRC + 6]);

        Ok(Self {
            dst_mac,
            src_mac,
            vlan_tpid: be16(OFF_TPID),
            vlan_tci: be16(OFF_TCI),
            eth_type: be16(OFF_ETH_TYPE),
            pkt_sig: be16(OFF_SIG),
            op_code: buf[OFF_OPCODE],
            flags: EncapFlags(buf[OFF_FLAGS]),
            trans_id: be16(OFF_TRANS_ID),
            data_len: be16(OFF_DATA_LEN),
            meta_len: buf[OFF_META_LEN],
        })
    }

    /// Write the header into the front of `buf`
    ///
    /// The queue id and attribute bytes of the internal header are preserved.
    pub fn write(&self, buf: &mut [u8]) -> Result<(), HeaderError> {
        check_len(buf)?;
        buf[OFF_DST..OFF_DST + 6].copy_from_slice(&self.dst_mac);
        buf[OFF_SRC..OFF_SRC + 6].copy_from_slice(&self.src_mac);
        buf[OFF_TPID..OFF_TPID + 2].copy_from_slice(&self.vlan_tpid.to_be_bytes());
        buf[OFF_TCI..OFF_TCI + 2].copy_from_slice(&self.vlan_tci.to_be_bytes());
        buf[OFF_ETH_TYPE..OFF_ETH_TYPE + 2].copy_from_slice(&self.eth_type.to_be_bytes());
        buf[OFF_SIG..OFF_SIG + 2].copy_from_slice(&self.pkt_sig.to_be_bytes());
        buf[OFF_OPCODE] = self.op_code;
        buf[OFF_FLAGS] = self.flags.as_u8();
        buf[OFF_TRANS_ID..OFF_TRANS_ID + 2].copy_from_slice(&self.trans_id.to_be_bytes());
        buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&self.data_len.to_be_bytes());
        buf[OFF_META_LEN] = self.meta_len;
        Ok(())
    }

    /// Total buffer length implied by the header
    pub fn packet_len(&self) -> usize {
        PKT_HDR_SIZE + self.meta_len as usize + self.data_len as usize
    }
}

fn check_len(buf: &[u8]) -> Result<(), HeaderError> {
    if buf.len() < PKT_HDR_SIZE {
        return Err(HeaderError::TooShort {
            expected: PKT_HDR_SIZE,
            actual: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrs_origin_decode() {
        assert_eq!(PacketAttrs::default().origin(), Origin::Plain);
        assert_eq!(
            PacketAttrs::from_bits(PacketAttrs::XDP_FRM | PacketAttrs::COOKED).origin(),
            Origin::FilterRedirectFrame(FrameKind::Redirected)
        );
        assert_eq!(
            PacketAttrs::from_bits(PacketAttrs::XDP_FRM | PacketAttrs::XDP_ACT).origin(),
            Origin::FilterRedirectFrame(FrameKind::Action)
        );
        assert_eq!(
            PacketAttrs::from_bits(PacketAttrs::XSK_ZC).origin(),
            Origin::ZeroCopySocketOwned
        );
        assert_eq!(
            PacketAttrs::from_bits(PacketAttrs::XSK_ZC | PacketAttrs::XDP_ACT).origin(),
            Origin::ZeroCopyAction
        );
    }

    #[test]
    fn test_origin_attr_bits_decode_back() {
        for origin in [
            Origin::Plain,
            Origin::FilterRedirectFrame(FrameKind::Redirected),
            Origin::FilterRedirectFrame(FrameKind::Action),
            Origin::ZeroCopyAction,
            Origin::ZeroCopySocketOwned,
        ] {
            assert_eq!(PacketAttrs::from_bits(origin.attr_bits()).origin(), origin);
        }
        assert!(!Origin::ZeroCopySocketOwned.needs_unmap());
        assert!(Origin::ZeroCopyAction.needs_unmap());
    }

    #[test]
    fn test_packet_header_preserves_other_bytes() {
        let mut buf = [0xEEu8; PKT_HDR_SIZE];
        let hdr = PacketHeader {
            data_len: 64,
            meta_len: 16,
            queue_id: 3,
            attrs: PacketAttrs::from_bits(PacketAttrs::COOKED),
            pkt_sig: 0x8001,
        };
        hdr.write(&mut buf).unwrap();

        assert_eq!(PacketHeader::read(&buf).unwrap(), hdr);
        assert_eq!(&buf[0..18], &[0xEE; 18]);
        assert_eq!(hdr.packet_len(), 32 + 16 + 64);
        assert_eq!(hdr.frame_offset(), 48);
    }

    #[test]
    fn test_encap_header_wire_layout() {
        let hdr = EncapHeader {
            dst_mac: [1, 2, 3, 4, 5, 6],
            src_mac: [7, 8, 9, 10, 11, 12],
            vlan_tpid: 0x8100,
            vlan_tci: 0x0001,
            eth_type: 0xDE08,
            pkt_sig: 0x0C00,
            op_code: EncapHeader::OPCODE_RX,
            flags: EncapFlags::default().with_modhdr(),
            trans_id: 0x1234,
            data_len: 60,
            meta_len: 0,
        };
        let mut buf = [0u8; PKT_HDR_SIZE];
        hdr.write(&mut buf).unwrap();

        assert_eq!(&buf[12..14], &[0x81, 0x00]);
        assert_eq!(&buf[16..18], &[0xDE, 0x08]);
        assert_eq!(&buf[18..20], &[0x0C, 0x00]);
        assert_eq!(buf[20], 0x10);
        assert_eq!(buf[21], EncapFlags::MODHDR);
        assert_eq!(&buf[22..24], &[0x12, 0x34]);
        assert_eq!(&buf[24..26], &[0x00, 60]);
        assert_eq!(EncapHeader::parse(&buf).unwrap(), hdr);
    }

    #[test]
    fn test_encap_flags_to_attrs() {
        let flags = EncapFlags::from_bits(EncapFlags::MODHDR | EncapFlags::BIND_QUE);
        let attrs = flags.to_attrs();
        assert!(attrs.contains(PacketAttrs::HIGIG));
        assert!(attrs.is_queue_bound());
        assert!(!attrs.contains(PacketAttrs::PAUSE));
    }

    #[test]
    fn test_header_too_short() {
        let buf = [0u8; 16];
        assert_eq!(
            PacketHeader::read(&buf),
            Err(HeaderError::TooShort {
                expected: PKT_HDR_SIZE,
                actual: 16
            })
        );
        assert!(EncapHeader::parse(&buf).is_err());
    }
}
