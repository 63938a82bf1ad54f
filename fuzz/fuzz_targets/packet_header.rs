//! Fuzz target for internal and encapsulation header parsing
//!
//! Parsing must return `Ok` or `Err` for any byte string, never panic.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pktdma_core::vlan;
use pktdma_core::{EncapHeader, PacketHeader};

fuzz_target!(|data: &[u8]| {
    let _ = EncapHeader::parse(data);

    if let Ok(hdr) = PacketHeader::read(data) {
        let _ = hdr.attrs.origin();
        let _ = hdr.packet_len();
    }

    let _ = vlan::is_tagged(data);
    if data.len() >= 2 {
        let vid = u16::from_le_bytes([data[0], data[1]]) & 0x0fff;
        let mut buf = data[2..].to_vec();
        let len = buf.len();
        buf.resize(len + 4, 0);
        let _ = vlan::insert_tag(&mut buf, len, vid);
    }
});
