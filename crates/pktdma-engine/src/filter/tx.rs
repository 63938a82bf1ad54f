//! Transmit-time header population.
//!
//! Before a frame from the filter path or a zero-copy socket reaches a
//! transmit ring, its internal header must be filled in. A netif using
//! control-plane encapsulation supplies the header itself (in wire byte
//! order), so it is validated and translated in place. Every other netif
//! sends a bare Ethernet frame, which is moved back to make room for the
//! header and any metadata the netif kind requires. Either way the VLAN tag
//! is inserted once, and the header is marked cooked so a retried frame
//! passes through untouched.

use pktdma_core::vlan;
use pktdma_core::{
    EncapFlags, EncapHeader, Error, ETH_HLEN, HeaderError, NetifConfig, NetifKind, PKT_HDR_SIZE,
    PacketAttrs, PacketHeader, VLAN_HLEN,
};
use tracing::warn;

/// Which transmit path the frame takes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPath {
    /// Filter frame: redirects into the device and transmit actions
    Frame,
    /// Zero-copy pool frame
    ZeroCopy,
}

impl TxPath {
    fn attr_bit(&self) -> u16 {
        match self {
            Self::Frame => PacketAttrs::XDP_FRM,
            Self::ZeroCopy => PacketAttrs::XSK_ZC,
        }
    }
}

/// Result of [`TxPreprocessor::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxPrep {
    /// Header was already populated; nothing changed
    Resumed,
    /// Header populated by this pass
    Cooked,
}

/// Populates the internal header of one outgoing frame
#[derive(Debug, Clone, Copy)]
pub struct TxPreprocessor<'a> {
    /// Egress netif
    pub netif: &'a NetifConfig,
    /// Configured signature (0 disables signature checks)
    pub sig: u16,
    /// FCS bytes appended by the device
    pub fcs_len: usize,
    /// Transmit path
    pub path: TxPath,
    /// Frame built by a transmit action of this device's filter
    pub act: bool,
}

impl TxPreprocessor<'_> {
    /// Populate the header of the `*len` byte frame at the front of `buf`
    ///
    /// `buf` extends past the frame into its tailroom; `*len` is updated to
    /// the length of the finished buffer.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] for frames that are too short, do not fit
    /// the tailroom, or (on the frame path) carry an encapsulation header
    /// whose length or signature is wrong, and for metadata netifs without
    /// metadata.
    pub fn run(&self, buf: &mut [u8], len: &mut usize) -> Result<TxPrep, Error> {
        let mut pkh = PacketHeader::read(buf)?;

        if self.netif.encap && !self.act {
            if *len < PKT_HDR_SIZE {
                return Err(HeaderError::TooShort {
                    expected: PKT_HDR_SIZE,
                    actual: *len,
                }
                .into());
            }
            let mut rch = EncapHeader::parse(buf)?;
            let cooked = pkh.attrs.is_cooked();
            let mut data_len = if cooked { pkh.data_len } else { rch.data_len } as usize;
            let pkt_len = PKT_HDR_SIZE + rch.meta_len as usize + data_len;

            if *len != pkt_len || *len < PKT_HDR_SIZE + ETH_HLEN {
                if self.path == TxPath::Frame {
                    return Err(HeaderError::LengthMismatch {
                        expected: pkt_len,
                        actual: *len,
                    }
                    .into());
                }
                warn!(
                    "netif {}: encap length {} != header length {}, submitting for hardware drop",
                    self.netif.id, *len, pkt_len
                );
                data_len = *len - PKT_HDR_SIZE;
                rch.meta_len = 0;
                rch.flags = EncapFlags::from_bits(EncapFlags::MODHDR);
            } else if self.sig != 0 && rch.pkt_sig != self.sig {
                if self.path == TxPath::Frame {
                    return Err(HeaderError::Signature {
                        expected: self.sig,
                        actual: rch.pkt_sig,
                    }
                    .into());
                }
                warn!(
                    "netif {}: encap signature {:#06x} != {:#06x}",
                    self.netif.id, rch.pkt_sig, self.sig
                );
            }

            if cooked {
                return Ok(TxPrep::Resumed);
            }

            let total = *len + self.fcs_len;
            check_room(buf, total)?;
            *len = total;
            pkh.data_len = frame_len16(data_len + self.fcs_len)?;
            pkh.meta_len = rch.meta_len;
            pkh.attrs = rch.flags.to_attrs();
        } else {
            if *len == pkh.packet_len() && pkh.attrs.is_cooked() && pkh.pkt_sig == self.sig {
                return Ok(TxPrep::Resumed);
            }

            let meta = match self.netif.kind {
                NetifKind::Vlan => 0,
                NetifKind::Port | NetifKind::Meta => {
                    if self.netif.meta_len == 0 {
                        return Err(HeaderError::NoMetadata.into());
                    }
                    self.netif.meta_len
                }
            };
            let frame = *len;
            if frame < ETH_HLEN {
                return Err(HeaderError::TooShort {
                    expected: ETH_HLEN,
                    actual: frame,
                }
                .into());
            }

            let head = PKT_HDR_SIZE + meta;
            let total = frame + head + self.fcs_len;
            check_room(buf, total)?;
            buf.copy_within(0..frame, head);
            buf[..head].fill(0);
            *len = total;

            pkh = PacketHeader {
                data_len: frame_len16(frame + self.fcs_len)?,
                meta_len: meta as u8,
                queue_id: 0,
                attrs: PacketAttrs::default(),
                pkt_sig: self.sig,
            };

            if meta > 0 {
                let off = self.netif.meta_off.min(frame);
                if off > 0 {
                    buf.copy_within(head..head + off, PKT_HDR_SIZE);
                }
                let meta_data = self.netif.meta_data.get(..meta).ok_or(HeaderError::NoMetadata)?;
                buf[PKT_HDR_SIZE + off..PKT_HDR_SIZE + off + meta].copy_from_slice(meta_data);
                pkh.attrs.insert(PacketAttrs::HIGIG);
            }
        }

        let frame_off = pkh.frame_offset();
        let data_len = pkh.data_len as usize;
        let tag = self.netif.vlan;
        if tag & 0xfff != 0
            && (!pkh.attrs.contains(PacketAttrs::HIGIG) || self.netif.add_tag)
            && !vlan::is_tagged(buf.get(frame_off..*len).unwrap_or_default())
        {
            check_room(buf, *len + VLAN_HLEN)?;
            vlan::insert_tag(&mut buf[frame_off..], data_len, tag)?;
            pkh.data_len = frame_len16(data_len + VLAN_HLEN)?;
            *len += VLAN_HLEN;
        }

        pkh.attrs.insert(self.path.attr_bit() | PacketAttrs::COOKED);
        if self.act {
            pkh.attrs.insert(PacketAttrs::XDP_ACT);
        }
        pkh.write(buf)?;
        Ok(TxPrep::Cooked)
    }
}

fn check_room(buf: &[u8], needed: usize) -> Result<(), HeaderError> {
    if buf.len() < needed {
        return Err(HeaderError::NoTailroom {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

fn frame_len16(len: usize) -> Result<u16, HeaderError> {
    u16::try_from(len).map_err(|_| HeaderError::LengthMismatch {
        expected: u16::MAX as usize,
        actual: len,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIG: u16 = 0x0C00;

    fn untagged(len: usize) -> Vec<u8> {
        let mut frame: Vec<u8> = (0..len).map(|i| i as u8).collect();
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame
    }

    fn with_tail(bytes: &[u8], tail: usize) -> Vec<u8> {
        let mut buf = bytes.to_vec();
        buf.resize(bytes.len() + tail, 0);
        buf
    }

    fn prep(netif: &NetifConfig, fcs_len: usize, path: TxPath) -> TxPreprocessor<'_> {
        TxPreprocessor {
            netif,
            sig: SIG,
            fcs_len,
            path,
            act: false,
        }
    }

    #[test]
    fn test_plain_frame_gets_header() {
        let netif = NetifConfig::new(1);
        let frame = untagged(60);
        let mut buf = with_tail(&frame, 128);
        let mut len = 60;

        assert_eq!(prep(&netif, 4, TxPath::Frame).run(&mut buf, &mut len).unwrap(), TxPrep::Cooked);
        assert_eq!(len, 32 + 60 + 4);
        let pkh = PacketHeader::read(&buf).unwrap();
        assert_eq!(pkh.data_len, 64);
        assert_eq!(pkh.meta_len, 0);
        assert_eq!(pkh.pkt_sig, SIG);
        assert!(pkh.attrs.is_cooked());
        assert!(pkh.attrs.contains(PacketAttrs::XDP_FRM));
        assert_eq!(&buf[32..92], &frame[..]);
    }

    #[test]
    fn test_second_pass_is_resumed() {
        let mut netif = NetifConfig::new(1);
        netif.vlan = 10;
        let mut buf = with_tail(&untagged(64), 128);
        let mut len = 64;
        let p = prep(&netif, 4, TxPath::ZeroCopy);

        p.run(&mut buf, &mut len).unwrap();
        let first = buf.clone();
        let first_len = len;

        assert_eq!(p.run(&mut buf, &mut len).unwrap(), TxPrep::Resumed);
        assert_eq!(len, first_len);
        assert_eq!(buf, first);
    }

    #[test]
    fn test_vlan_inserted_once() {
        let mut netif = NetifConfig::new(1);
        netif.vlan = 0x123;
        let frame = untagged(64);
        let mut buf = with_tail(&frame, 128);
        let mut len = 64;

        prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len).unwrap();
        assert_eq!(len, 32 + 68);
        assert_eq!(&buf[32 + 12..32 + 16], &[0x81, 0x00, 0x01, 0x23]);
        assert_eq!(&buf[32 + 16..32 + 68], &frame[12..64]);
        assert_eq!(PacketHeader::read(&buf).unwrap().data_len, 68);
    }

    #[test]
    fn test_tagged_frame_not_retagged() {
        let mut netif = NetifConfig::new(1);
        netif.vlan = 5;
        let mut frame = untagged(64);
        frame[12] = 0x81;
        frame[13] = 0x00;
        let mut buf = with_tail(&frame, 128);
        let mut len = 64;

        prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len).unwrap();
        assert_eq!(len, 32 + 64);
    }

    #[test]
    fn test_port_metadata_insertion() {
        let mut netif = NetifConfig::new(2);
        netif.kind = NetifKind::Port;
        netif.meta_len = 4;
        netif.meta_data = vec![0xA0, 0xA1, 0xA2, 0xA3];
        netif.meta_off = 2;
        netif.vlan = 7;
        let frame = untagged(60);
        let mut buf = with_tail(&frame, 128);
        let mut len = 60;

        prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len).unwrap();
        let pkh = PacketHeader::read(&buf).unwrap();
        assert_eq!(pkh.meta_len, 4);
        assert_eq!(pkh.data_len, 60);
        assert!(pkh.attrs.contains(PacketAttrs::HIGIG));
        assert_eq!(&buf[32..38], &[0, 1, 0xA0, 0xA1, 0xA2, 0xA3]);
        // module header present, no tag without add_tag
        assert_eq!(len, 32 + 4 + 60);

        netif.add_tag = true;
        let mut buf = with_tail(&frame, 128);
        let mut len = 60;
        prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len).unwrap();
        assert_eq!(len, 32 + 4 + 64);
    }

    #[test]
    fn test_metadata_netif_without_metadata() {
        let mut netif = NetifConfig::new(2);
        netif.kind = NetifKind::Meta;
        let mut buf = with_tail(&untagged(60), 128);
        let mut len = 60;
        assert!(matches!(
            prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len),
            Err(Error::Header(HeaderError::NoMetadata))
        ));
    }

    #[test]
    fn test_no_tailroom() {
        let netif = NetifConfig::new(1);
        let mut buf = untagged(60);
        let mut len = 60;
        assert!(matches!(
            prep(&netif, 4, TxPath::Frame).run(&mut buf, &mut len),
            Err(Error::Header(HeaderError::NoTailroom { .. }))
        ));
    }

    fn encap_packet(data_len: u16, actual_len: usize, sig: u16) -> Vec<u8> {
        let mut buf = vec![0u8; PKT_HDR_SIZE];
        EncapHeader {
            pkt_sig: sig,
            op_code: EncapHeader::OPCODE_TX,
            flags: EncapFlags::from_bits(EncapFlags::BIND_QUE),
            data_len,
            ..Default::default()
        }
        .write(&mut buf)
        .unwrap();
        buf[29] = 3;
        buf.extend(untagged(actual_len));
        buf
    }

    #[test]
    fn test_encap_translated() {
        let mut netif = NetifConfig::new(4);
        netif.encap = true;
        let mut buf = with_tail(&encap_packet(60, 60, SIG), 64);
        let mut len = 92;

        prep(&netif, 4, TxPath::Frame).run(&mut buf, &mut len).unwrap();
        assert_eq!(len, 96);
        let pkh = PacketHeader::read(&buf).unwrap();
        assert_eq!(pkh.data_len, 64);
        assert!(pkh.attrs.is_queue_bound());
        assert_eq!(pkh.queue_id, 3);
        assert_eq!(&buf[18..20], &SIG.to_be_bytes());

        assert_eq!(
            prep(&netif, 4, TxPath::Frame).run(&mut buf, &mut len).unwrap(),
            TxPrep::Resumed
        );
    }

    #[test]
    fn test_encap_mismatch_by_path() {
        let mut netif = NetifConfig::new(4);
        netif.encap = true;

        let mut buf = with_tail(&encap_packet(80, 60, SIG), 64);
        let mut len = 92;
        assert!(matches!(
            prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len),
            Err(Error::Header(HeaderError::LengthMismatch { .. }))
        ));

        let mut buf = with_tail(&encap_packet(80, 60, SIG), 64);
        let mut len = 92;
        prep(&netif, 0, TxPath::ZeroCopy).run(&mut buf, &mut len).unwrap();
        let pkh = PacketHeader::read(&buf).unwrap();
        assert_eq!(pkh.data_len, 60);
        assert_eq!(pkh.meta_len, 0);
        assert!(pkh.attrs.contains(PacketAttrs::HIGIG));
        assert!(pkh.attrs.contains(PacketAttrs::XSK_ZC));

        let mut buf = with_tail(&encap_packet(60, 60, 0x1111), 64);
        let mut len = 92;
        assert!(matches!(
            prep(&netif, 0, TxPath::Frame).run(&mut buf, &mut len),
            Err(Error::Header(HeaderError::Signature { .. }))
        ));
    }

    #[test]
    fn test_action_frames_skip_encap_parsing() {
        let mut netif = NetifConfig::new(4);
        netif.encap = true;
        let mut buf = with_tail(&untagged(60), 128);
        let mut len = 60;
        let mut p = prep(&netif, 0, TxPath::Frame);
        p.act = true;

        p.run(&mut buf, &mut len).unwrap();
        let pkh = PacketHeader::read(&buf).unwrap();
        assert!(pkh.attrs.contains(PacketAttrs::XDP_ACT));
        assert_eq!(len, 92);
    }
}
