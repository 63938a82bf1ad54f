//! 802.1Q tag handling for egress frames.

use crate::error::HeaderError;
use crate::{ETH_ALEN, ETH_P_8021AD, ETH_P_8021Q, VLAN_HLEN};

const TPID_OFFSET: usize = ETH_ALEN * 2;

/// Whether the Ethernet frame already carries a VLAN tag
pub fn is_tagged(frame: &[u8]) -> bool {
    if frame.len() < TPID_OFFSET + 2 {
        return false;
    }
    let tpid = u16::from_be_bytes([frame[TPID_OFFSET], frame[TPID_OFFSET + 1]]);
    tpid == ETH_P_8021Q || tpid == ETH_P_8021AD
}

/// Insert an 802.1Q tag carrying `vlan` behind the MAC addresses
///
/// `buf` starts at the Ethernet header and must have room for `frame_len`
/// plus the tag. Bytes `[12..frame_len)` move to `[16..frame_len + 4)`.
/// Returns the new frame length.
pub fn insert_tag(buf: &mut [u8], frame_len: usize, vlan: u16) -> Result<usize, HeaderError> {
    if frame_len < TPID_OFFSET {
        return Err(HeaderError::TooShort {
            expected: TPID_OFFSET,
            actual: frame_len,
        });
    }
    let needed = frame_len + VLAN_HLEN;
    if buf.len() < needed {
        return Err(HeaderError::NoTailroom {
            needed,
            available: buf.len(),
        });
    }

    buf.copy_within(TPID_OFFSET..frame_len, TPID_OFFSET + VLAN_HLEN);
    buf[12] = 0x81;
    buf[13] = 0x00;
    buf[14] = (vlan >> 8 & 0xf) as u8;
    buf[15] = (vlan & 0xff) as u8;

    Ok(needed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn untagged_frame(len: usize) -> Vec<u8> {
        let mut frame: Vec<u8> = (0..len).map(|i| i as u8).collect();
        frame[12] = 0x08;
        frame[13] = 0x00;
        frame
    }

    #[test]
    fn test_insert_tag_shifts_payload() {
        let original = untagged_frame(64);
        let mut buf = original.clone();
        buf.resize(128, 0);

        let len = insert_tag(&mut buf, 64, 0x123).unwrap();
        assert_eq!(len, 68);
        assert_eq!(&buf[..12], &original[..12]);
        assert_eq!(&buf[12..16], &[0x81, 0x00, 0x01, 0x23]);
        assert_eq!(&buf[16..68], &original[12..64]);
        assert!(is_tagged(&buf));
    }

    #[test]
    fn test_insert_tag_masks_priority_bits() {
        let mut buf = untagged_frame(64);
        buf.resize(68, 0);
        insert_tag(&mut buf, 64, 0xF00A).unwrap();
        assert_eq!(&buf[14..16], &[0x00, 0x0A]);
    }

    #[test]
    fn test_insert_tag_no_room() {
        let mut buf = untagged_frame(64);
        assert_eq!(
            insert_tag(&mut buf, 64, 10),
            Err(HeaderError::NoTailroom {
                needed: 68,
                available: 64
            })
        );
    }

    proptest::proptest! {
        #[test]
        fn test_insert_tag_any_frame(len in 14usize..1518, vlan in 1u16..4095, slack in 4usize..64) {
            let original = untagged_frame(len);
            let mut buf = original.clone();
            buf.resize(len + slack, 0);

            let new_len = insert_tag(&mut buf, len, vlan).unwrap();
            proptest::prop_assert_eq!(new_len, len + VLAN_HLEN);
            proptest::prop_assert_eq!(&buf[..12], &original[..12]);
            proptest::prop_assert_eq!(&buf[16..new_len], &original[12..len]);
            proptest::prop_assert_eq!(u16::from_be_bytes([buf[14], buf[15]]), vlan & 0xfff);
        }
    }

    #[test]
    fn test_is_tagged() {
        let mut frame = untagged_frame(20);
        assert!(!is_tagged(&frame));
        frame[12] = 0x88;
        frame[13] = 0xA8;
        assert!(is_tagged(&frame));
        assert!(!is_tagged(&frame[..10]));
    }
}
