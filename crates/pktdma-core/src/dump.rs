//! Hex dump of packet bytes for debug logging.

use std::fmt::Write;

const BYTES_PER_LINE: usize = 32;
const GROUP: usize = 4;

/// Render `data` as offset-prefixed hex lines
///
/// Each line holds 32 bytes in groups of four.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3 + data.len() / BYTES_PER_LINE * 8);

    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let _ = write!(out, "{:04x}:", line * BYTES_PER_LINE);
        for (i, byte) in chunk.iter().enumerate() {
            if i % GROUP == 0 {
                out.push(' ');
            }
            let _ = write!(out, "{:02x}", byte);
        }
        out.push('\n');
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hexdump_layout() {
        let data: Vec<u8> = (0..40).collect();
        let dump = hexdump(&data);
        let lines: Vec<&str> = dump.lines().collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000: 00010203 04050607"));
        assert_eq!(lines[1], "0020: 20212223 24252627");
    }

    #[test]
    fn test_hexdump_empty() {
        assert!(hexdump(&[]).is_empty());
    }
}
