//! Receive-side classification.
//!
//! A received packet sits in its buffer as
//!
//! ```text
//!  pkt-32      pkt        pkt+meta                  pkt+len-fcs
//!    │ header  │ metadata │ Ethernet frame ...        │ FCS │
//! ```
//!
//! [`FilterEngine::run_rx`] fills in the internal header, steers the packet
//! to a netif and runs that netif's program over it. The buffer strategies
//! turn the verdict into a delivered buffer, a frame or a drop.

use super::{FilterEngine, RedirectTarget, XdpAction, XdpContext};
use crate::frame::XdpFrame;
use crate::hooks::RedirectError;
use crate::netif::Netif;
use crate::shared::InFlight;
use crate::xsk::RxRefusal;
use pktdma_core::{EncapFlags, EncapHeader, Error, ETH_ALEN, PKT_HDR_SIZE, PacketHeader};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// What the receive path does with a packet
///
/// Windows are byte offsets into the buffer handed to
/// [`FilterEngine::run_rx`].
#[derive(Debug)]
pub(crate) enum RxVerdict {
    /// Deliver to the host stack
    Pass,
    /// Discard
    Drop,
    /// Send `start..end` back out of `netif`
    Tx {
        netif: Arc<Netif>,
        start: usize,
        end: usize,
    },
    /// Hand `start..end` to `target`
    Redirect {
        target: RedirectTarget,
        start: usize,
        end: usize,
    },
}

/// Verdict plus the in-flight guard of the netif the packet was steered to
#[derive(Debug)]
pub(crate) struct RxRun {
    pub(crate) verdict: RxVerdict,
    pub(crate) guard: Option<InFlight>,
}

impl RxRun {
    fn pass(guard: Option<InFlight>) -> Self {
        Self {
            verdict: RxVerdict::Pass,
            guard,
        }
    }

    fn drop() -> Self {
        Self {
            verdict: RxVerdict::Drop,
            guard: None,
        }
    }
}

impl FilterEngine {
    /// Classify the `len` byte packet at offset `pkt` of `buf`
    ///
    /// `len` counts the metadata and the FCS; metadata is whatever the
    /// driver placed in front of the frame plus what the device wrote
    /// inline. The 32 bytes in front of `pkt` receive the internal header,
    /// or the encapsulation header when the netif uses one.
    pub(crate) fn run_rx(&self, buf: &mut [u8], pkt: usize, len: usize, queue: u32) -> RxRun {
        let pkh = match self.rx_header(buf, pkt, len, queue) {
            Ok(pkh) => pkh,
            Err(e) => {
                debug!("rx queue {}: {}", queue, e);
                return RxRun::drop();
            }
        };
        let meta = pkh.meta_len as usize;
        let hdr = pkt - PKT_HDR_SIZE;

        let (netif, guard) = match self.steer(queue, &buf[hdr..pkt + len]) {
            Ok(found) => found,
            Err(Error::NoHandler) => return RxRun::pass(None),
            Err(e) => {
                debug!("rx queue {}: steering failed: {}", queue, e);
                return RxRun::drop();
            }
        };
        let Some(program) = netif.program() else {
            return RxRun::pass(Some(guard));
        };

        let frame = pkt + meta;
        let data_end = pkt + len - self.fcs_len;
        let data = if netif.config().encap {
            if let Err(e) = self.synth_encap(&mut buf[hdr..data_end], &pkh) {
                debug!("netif {}: encap synthesis failed: {}", netif.id(), e);
                return RxRun::drop();
            }
            hdr
        } else {
            frame
        };

        let action = {
            let mut ctx = XdpContext::new(&mut buf[data..data_end], netif.id(), queue);
            program.run(&mut ctx)
        };
        trace!("netif {}: program '{}' -> {:?}", netif.id(), program.name(), action);

        let verdict = match action {
            XdpAction::Pass => RxVerdict::Pass,
            XdpAction::Drop => RxVerdict::Drop,
            XdpAction::Tx => RxVerdict::Tx {
                netif: Arc::clone(&netif),
                start: frame,
                end: data_end,
            },
            XdpAction::Redirect(target) => RxVerdict::Redirect {
                target,
                start: data,
                end: data_end,
            },
            XdpAction::Aborted | XdpAction::Unknown(_) => {
                warn!(
                    "netif {}: program '{}' returned {:?}, dropping",
                    netif.id(),
                    program.name(),
                    action
                );
                RxVerdict::Drop
            }
        };
        RxRun {
            verdict,
            guard: Some(guard),
        }
    }

    /// Write the internal header of the `len` byte packet at `pkt`
    pub(crate) fn rx_header(
        &self,
        buf: &mut [u8],
        pkt: usize,
        len: usize,
        queue: u32,
    ) -> Result<PacketHeader, Error> {
        let meta = self.rx_meta;
        if pkt < PKT_HDR_SIZE || pkt + len > buf.len() || len < meta + self.fcs_len {
            return Err(Error::Param(format!(
                "{} byte packet at {} does not fit a {} byte buffer",
                len,
                pkt,
                buf.len()
            )));
        }
        let pkh = PacketHeader {
            data_len: u16::try_from(len - meta)
                .map_err(|_| Error::Param(format!("{} byte packet", len)))?,
            meta_len: meta as u8,
            queue_id: queue as u8,
            pkt_sig: self.encap.pkt_sig,
            ..Default::default()
        };
        pkh.write(&mut buf[pkt - PKT_HDR_SIZE..])?;
        Ok(pkh)
    }

    /// Rewrite the internal header at the front of `buf` as an
    /// encapsulation header describing the frame behind the metadata
    fn synth_encap(&self, buf: &mut [u8], pkh: &PacketHeader) -> Result<(), Error> {
        let frame = pkh.frame_offset();
        let addrs = buf
            .get(frame..frame + 2 * ETH_ALEN)
            .ok_or(pktdma_core::HeaderError::TooShort {
                expected: frame + 2 * ETH_ALEN,
                actual: buf.len(),
            })?;

        let enc = &self.encap;
        let mut rch = EncapHeader {
            vlan_tpid: enc.vlan_tpid,
            vlan_tci: enc.vlan_tci,
            eth_type: enc.eth_type,
            pkt_sig: enc.pkt_sig,
            op_code: EncapHeader::OPCODE_RX,
            flags: EncapFlags::default().with_modhdr(),
            trans_id: enc.trans_id,
            data_len: pkh.data_len,
            meta_len: pkh.meta_len,
            ..Default::default()
        };
        rch.dst_mac.copy_from_slice(&addrs[..ETH_ALEN]);
        rch.src_mac.copy_from_slice(&addrs[ETH_ALEN..]);
        if enc.dst_mac != [0; ETH_ALEN] {
            rch.dst_mac = enc.dst_mac;
        }
        if enc.src_mac != [0; ETH_ALEN] {
            rch.src_mac = enc.src_mac;
        }
        rch.write(buf)?;
        Ok(())
    }

    /// Send a frame built for a transmit verdict
    pub(crate) fn rx_tx(&self, netif: &Netif, frame: XdpFrame) -> Result<(), Error> {
        self.frame_xmit(netif, frame, true).inspect_err(|e| {
            debug!("netif {}: transmit action failed: {}", netif.id(), e);
        })
    }

    /// Hand a frame built for a redirect verdict to its target
    ///
    /// Success leaves a flush pending.
    pub(crate) fn rx_redirect(&self, target: RedirectTarget, frame: XdpFrame) -> Result<(), RedirectError> {
        let res = match target {
            RedirectTarget::Netif(id) => self.redirector.redirect(id, frame),
            RedirectTarget::ZeroCopy => match self.binding() {
                Some(binding) => binding.pool.receive_copy(frame.data()).map_err(|r| match r {
                    RxRefusal::NoBufs => RedirectError::NoBufs,
                    RxRefusal::NoSpace => RedirectError::NoSpace,
                }),
                None => Err(RedirectError::NoTarget(RedirectTarget::ZeroCopy)),
            },
        };
        match res {
            Ok(()) => self.mark_flush(),
            Err(e) => debug!("redirect to {:?} failed: {}", target, e),
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{NoRedirect, NoTxQueues};
    use crate::iommu::SoftIommu;
    use crate::shared::DeviceShared;
    use crate::tx::TransmitBufferResolver;
    use pktdma_core::{EngineConfig, NetifConfig, RXB_RESV, RXB_TAILROOM};

    const PKT: usize = RXB_RESV;

    fn engine(encap: bool) -> (FilterEngine, Arc<DeviceShared>) {
        let mut config = EngineConfig::default();
        config.device.page_buffer_mode = true;
        config.encap.pkt_sig = 0x4b4e;
        config.encap.eth_type = 0xde08;
        let mut netif = NetifConfig::new(1);
        netif.bind_chan = Some(0);
        netif.encap = encap;
        config.netifs.push(netif);

        let shared = DeviceShared::new(16, 0);
        let platform = Arc::new(SoftIommu::with_node(0));
        let fe = FilterEngine::new(
            &config,
            Arc::clone(&shared),
            Arc::new(TransmitBufferResolver::new(platform, false)),
            Arc::new(NoTxQueues),
            Arc::new(NoRedirect),
        );
        (fe, shared)
    }

    fn packet(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; PKT + len + RXB_TAILROOM];
        for (i, b) in buf[PKT..PKT + len].iter_mut().enumerate() {
            *b = i as u8;
        }
        buf
    }

    fn drop_all(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Drop
    }

    fn abort(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Aborted
    }

    fn to_netif(_: &mut XdpContext<'_>) -> XdpAction {
        XdpAction::Redirect(RedirectTarget::Netif(7))
    }

    fn bounce(ctx: &mut XdpContext<'_>) -> XdpAction {
        ctx.data_mut()[0] = 0xee;
        XdpAction::Tx
    }

    #[test]
    fn test_pass_without_program_keeps_guard() {
        let (fe, shared) = engine(false);
        let mut buf = packet(64);

        let run = fe.run_rx(&mut buf, PKT, 64, 0);
        assert!(matches!(run.verdict, RxVerdict::Pass));
        assert_eq!(shared.in_flight(1), 1);
        drop(run);
        assert_eq!(shared.in_flight(1), 0);

        let hdr = PacketHeader::read(&buf[PKT - PKT_HDR_SIZE..]).unwrap();
        assert_eq!(hdr.data_len, 64);
        assert_eq!(hdr.pkt_sig, 0x4b4e);
    }

    #[test]
    fn test_unsteered_is_pass_without_guard() {
        let (fe, _) = engine(false);
        let mut buf = packet(64);
        let run = fe.run_rx(&mut buf, PKT, 64, 5);
        assert!(matches!(run.verdict, RxVerdict::Pass));
        assert!(run.guard.is_none());
    }

    #[test]
    fn test_drop_and_aborted() {
        let (fe, _) = engine(false);
        let mut buf = packet(64);

        fe.attach(1, Arc::new(drop_all)).unwrap();
        assert!(matches!(fe.run_rx(&mut buf, PKT, 64, 0).verdict, RxVerdict::Drop));

        fe.attach(1, Arc::new(abort)).unwrap();
        assert!(matches!(fe.run_rx(&mut buf, PKT, 64, 0).verdict, RxVerdict::Drop));
    }

    #[test]
    fn test_tx_window_excludes_fcs() {
        let (fe, _) = engine(false);
        let mut buf = packet(64);
        fe.attach(1, Arc::new(bounce)).unwrap();

        let run = fe.run_rx(&mut buf, PKT, 64, 0);
        match run.verdict {
            RxVerdict::Tx { netif, start, end } => {
                assert_eq!(netif.id(), 1);
                assert_eq!(start, PKT);
                assert_eq!(end, PKT + 60);
            }
            other => panic!("unexpected verdict {:?}", other),
        }
        assert_eq!(buf[PKT], 0xee);
    }

    #[test]
    fn test_encap_synthesized_for_program() {
        let (fe, _) = engine(true);
        let mut buf = packet(64);
        fe.attach(1, Arc::new(to_netif)).unwrap();

        let run = fe.run_rx(&mut buf, PKT, 64, 0);
        let RxVerdict::Redirect { target, start, end } = run.verdict else {
            panic!("expected redirect");
        };
        assert_eq!(target, RedirectTarget::Netif(7));
        assert_eq!(start, PKT - PKT_HDR_SIZE);
        assert_eq!(end, PKT + 60);

        let rch = EncapHeader::parse(&buf[start..]).unwrap();
        assert_eq!(rch.dst_mac, [0, 1, 2, 3, 4, 5]);
        assert_eq!(rch.src_mac, [6, 7, 8, 9, 10, 11]);
        assert_eq!(rch.eth_type, 0xde08);
        assert_eq!(rch.op_code, EncapHeader::OPCODE_RX);
        assert_eq!(rch.flags.as_u8() & EncapFlags::MODHDR, EncapFlags::MODHDR);
        assert_eq!(rch.data_len, 64);
    }

    #[test]
    fn test_redirect_without_target_fails() {
        let (fe, _) = engine(false);
        let frame = XdpFrame::from_bytes(&[0u8; 60]).unwrap();
        assert_eq!(
            fe.rx_redirect(RedirectTarget::ZeroCopy, frame),
            Err(RedirectError::NoTarget(RedirectTarget::ZeroCopy))
        );
        let frame = XdpFrame::from_bytes(&[0u8; 60]).unwrap();
        assert!(fe.rx_redirect(RedirectTarget::Netif(4), frame).is_err());
        assert!(!fe.pending_flush.load(std::sync::atomic::Ordering::Acquire));
    }

    #[test]
    fn test_short_packet_dropped() {
        let (fe, _) = engine(false);
        let mut buf = packet(64);
        assert!(matches!(fe.run_rx(&mut buf, 8, 64, 0).verdict, RxVerdict::Drop));
        assert!(matches!(fe.run_rx(&mut buf, PKT, 2, 0).verdict, RxVerdict::Drop));
    }
}
