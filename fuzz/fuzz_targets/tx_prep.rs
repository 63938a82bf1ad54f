//! Fuzz target for transmit header population
//!
//! Drives the pre-processor with arbitrary frames and netif settings. A bare
//! frame it accepts for a plain netif must pass a second run unchanged.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use pktdma_core::{NetifConfig, NetifKind};
use pktdma_engine::{TxPath, TxPrep, TxPreprocessor};

#[derive(Debug, Arbitrary)]
struct Input {
    kind: u8,
    vlan: u16,
    meta_len: u8,
    meta_off: u8,
    encap: bool,
    add_tag: bool,
    sig: u16,
    fcs: bool,
    zero_copy: bool,
    act: bool,
    tailroom: u8,
    frame: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let mut netif = NetifConfig::new(1);
    netif.kind = match input.kind % 3 {
        0 => NetifKind::Vlan,
        1 => NetifKind::Port,
        _ => NetifKind::Meta,
    };
    netif.vlan = input.vlan & 0x0fff;
    netif.meta_len = usize::from(input.meta_len % 32);
    netif.meta_off = usize::from(input.meta_off % 16);
    netif.meta_data = vec![0xa5; netif.meta_len];
    netif.encap = input.encap;
    netif.add_tag = input.add_tag;

    let prep = TxPreprocessor {
        netif: &netif,
        sig: input.sig,
        fcs_len: if input.fcs { 4 } else { 0 },
        path: if input.zero_copy { TxPath::ZeroCopy } else { TxPath::Frame },
        act: input.act,
    };

    let mut buf = input.frame;
    let mut len = buf.len();
    buf.resize(len + usize::from(input.tailroom), 0);

    let plain = !netif.encap && netif.kind == NetifKind::Vlan;
    if let Ok(TxPrep::Cooked) = prep.run(&mut buf, &mut len) {
        if !plain {
            let _ = prep.run(&mut buf, &mut len);
            return;
        }
        let snapshot = buf.clone();
        let cooked = len;
        assert_eq!(prep.run(&mut buf, &mut len).ok(), Some(TxPrep::Resumed));
        assert_eq!(len, cooked);
        assert_eq!(buf, snapshot);
    }
});
