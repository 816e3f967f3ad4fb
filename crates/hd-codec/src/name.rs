//! Domain name encoding and decoding with RFC 1035 compression pointers.

use crate::WireError;

/// Maximum number of compression pointer indirections we follow.
const MAX_JUMPS: usize = 20;

/// Encoded names must fit in 255 wire bytes.
const MAX_ENCODED_LEN: usize = 255;

/// Encode a domain name into length-prefixed wire labels.
///
/// Trailing dots are stripped; the root domain (`.`) encodes as a single
/// zero byte. Labels must be 1–63 ASCII bytes; the full encoding must fit
/// in 255 bytes.
pub fn encode_name(name: &str) -> Result<Vec<u8>, WireError> {
    if name.is_empty() {
        return Err(WireError::EmptyName);
    }
    let trimmed = name.trim_end_matches('.');
    if trimmed.is_empty() {
        return Ok(vec![0]);
    }
    if !trimmed.is_ascii() {
        return Err(WireError::NonAsciiName);
    }

    let mut buf = Vec::with_capacity(trimmed.len() + 2);
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(WireError::EmptyLabel);
        }
        if label.len() > 63 {
            return Err(WireError::LabelTooLong(label.len()));
        }
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);

    if buf.len() > MAX_ENCODED_LEN {
        return Err(WireError::NameTooLong);
    }
    Ok(buf)
}

/// Decode a domain name starting at `*offset`, following compression
/// pointers. On return `*offset` sits one past the name (for a pointer,
/// past the two pointer bytes).
///
/// Reserved length-byte patterns (`0b10xxxxxx` / `0b01xxxxxx`) are
/// rejected; pointer chains are bounded by a jump cap and a visited-offset
/// set so crafted loops cannot spin.
pub fn decode_name(msg: &[u8], offset: &mut usize) -> Result<String, WireError> {
    let mut name = String::with_capacity(64);
    let mut pos = *offset;
    let mut jumped = false;
    let mut jumps = 0;
    let mut wire_len = 1usize; // terminating zero byte
    let mut visited: Vec<usize> = Vec::new();

    loop {
        let len_byte = *msg.get(pos).ok_or(WireError::Truncated(pos))?;

        match len_byte & 0xC0 {
            0xC0 => {
                let low = *msg.get(pos + 1).ok_or(WireError::Truncated(pos + 1))?;
                let target = (((len_byte & 0x3F) as usize) << 8) | low as usize;
                if !jumped {
                    *offset = pos + 2;
                    jumped = true;
                }
                jumps += 1;
                if jumps > MAX_JUMPS || visited.contains(&target) {
                    return Err(WireError::CompressionLoop);
                }
                visited.push(target);
                pos = target;
            }
            0x00 => {
                let len = len_byte as usize;
                if len == 0 {
                    if !jumped {
                        *offset = pos + 1;
                    }
                    return Ok(name);
                }
                if pos + 1 + len > msg.len() {
                    return Err(WireError::Truncated(pos + 1));
                }
                let label = &msg[pos + 1..pos + 1 + len];
                if !label.is_ascii() {
                    return Err(WireError::NonAsciiName);
                }
                wire_len += len + 1;
                if wire_len > MAX_ENCODED_LEN {
                    return Err(WireError::NameTooLong);
                }
                if !name.is_empty() {
                    name.push('.');
                }
                // ASCII verified above, so this cannot fail.
                name.push_str(std::str::from_utf8(label).unwrap_or_default());
                pos += 1 + len;
            }
            _ => return Err(WireError::ReservedLabelBits(pos)),
        }
    }
}

/// Advance `*offset` past an encoded name without materializing it.
/// A compression pointer terminates the name after its two bytes.
pub fn skip_name(msg: &[u8], offset: &mut usize) -> Result<(), WireError> {
    let mut pos = *offset;
    loop {
        let len_byte = *msg.get(pos).ok_or(WireError::Truncated(pos))?;
        match len_byte & 0xC0 {
            0xC0 => {
                if pos + 2 > msg.len() {
                    return Err(WireError::Truncated(pos + 1));
                }
                *offset = pos + 2;
                return Ok(());
            }
            0x00 => {
                let len = len_byte as usize;
                if len == 0 {
                    *offset = pos + 1;
                    return Ok(());
                }
                if pos + 1 + len > msg.len() {
                    return Err(WireError::Truncated(pos + 1));
                }
                pos += 1 + len;
            }
            _ => return Err(WireError::ReservedLabelBits(pos)),
        }
    }
}

/// Lowercase a name and strip its trailing dot, the canonical form used
/// for cache keys and comparisons.
pub fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_roundtrip() {
        let buf = encode_name("www.example.com").unwrap();
        assert_eq!(buf, b"\x03www\x07example\x03com\x00");

        let mut offset = 0;
        let name = decode_name(&buf, &mut offset).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(offset, buf.len());
    }

    #[test]
    fn encode_strips_trailing_dot() {
        assert_eq!(
            encode_name("example.com.").unwrap(),
            encode_name("example.com").unwrap()
        );
    }

    #[test]
    fn encode_root() {
        assert_eq!(encode_name(".").unwrap(), vec![0]);
    }

    #[test]
    fn encode_rejects_bad_input() {
        assert!(matches!(encode_name(""), Err(WireError::EmptyName)));
        assert!(matches!(encode_name("a..b"), Err(WireError::EmptyLabel)));
        assert!(matches!(
            encode_name("exämple.com"),
            Err(WireError::NonAsciiName)
        ));
        let long_label = "a".repeat(64);
        assert!(matches!(
            encode_name(&long_label),
            Err(WireError::LabelTooLong(64))
        ));
        // 4 * 63-byte labels + separators exceed the 255-byte wire limit.
        let long_name = ["a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63)].join(".");
        assert!(matches!(encode_name(&long_name), Err(WireError::NameTooLong)));
    }

    #[test]
    fn decode_compression_pointer() {
        // "www.example.com" at offset 0, pointer at 17 targeting "example.com" at 4.
        let mut buf = encode_name("www.example.com").unwrap();
        assert_eq!(buf.len(), 17);
        buf.push(0xC0);
        buf.push(0x04);

        let mut offset = 17;
        let name = decode_name(&buf, &mut offset).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(offset, 19);
    }

    #[test]
    fn decode_pointer_after_header() {
        // "example.com" encoded right after a 12-byte header, referenced
        // by a C0 0C pointer later in the message.
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(b"\x07example\x03com\x00");
        let ptr_at = msg.len();
        msg.push(0xC0);
        msg.push(0x0C);

        let mut offset = ptr_at;
        let name = decode_name(&msg, &mut offset).unwrap();
        assert_eq!(name, "example.com");
        assert_eq!(offset, ptr_at + 2);
    }

    #[test]
    fn decode_rejects_pointer_loop() {
        // Pointer at 0 targets itself.
        let buf = [0xC0u8, 0x00];
        let mut offset = 0;
        assert!(matches!(
            decode_name(&buf, &mut offset),
            Err(WireError::CompressionLoop)
        ));
    }

    #[test]
    fn decode_rejects_reserved_bits() {
        for first in [0x40u8, 0x80] {
            let buf = [first, 0x01, 0x00];
            let mut offset = 0;
            assert!(matches!(
                decode_name(&buf, &mut offset),
                Err(WireError::ReservedLabelBits(0))
            ));
        }
    }

    #[test]
    fn decode_rejects_truncation() {
        let buf = [0x03u8, b'w', b'w'];
        let mut offset = 0;
        assert!(matches!(
            decode_name(&buf, &mut offset),
            Err(WireError::Truncated(_))
        ));
    }

    #[test]
    fn skip_name_plain_and_pointer() {
        let mut buf = encode_name("a.example.org").unwrap();
        let plain_len = buf.len();
        buf.push(0xC0);
        buf.push(0x00);

        let mut offset = 0;
        skip_name(&buf, &mut offset).unwrap();
        assert_eq!(offset, plain_len);

        skip_name(&buf, &mut offset).unwrap();
        assert_eq!(offset, plain_len + 2);
    }

    #[test]
    fn normalize_lowercases_and_trims() {
        assert_eq!(normalize("WWW.Example.COM."), "www.example.com");
        assert_eq!(normalize("example.com"), "example.com");
    }
}
