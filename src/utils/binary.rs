//! Binary data helpers for PostgreSQL protocol handling
//!
//! Type aliases matching PostgreSQL's internal types plus the hex digit
//! table used when replication data arrives as `bytea` text.

// Type aliases matching PostgreSQL internal types
pub type XLogRecPtr = u64; // WAL location pointer
pub type Oid = u32; // Object ID
pub type TimestampTz = i64; // Microseconds since 2000-01-01 UTC

pub const INVALID_XLOG_REC_PTR: XLogRecPtr = 0;

/// Value returned for characters outside `0-9A-Fa-f`
pub const INVALID_HEX_DIGIT: u8 = 0xFF;

/// Map one ASCII hex character to its value.
///
/// Invalid characters yield [`INVALID_HEX_DIGIT`] instead of an error.
pub fn hex_digit(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'A'..=b'F' => c - b'A' + 10,
        b'a'..=b'f' => c - b'a' + 10,
        _ => INVALID_HEX_DIGIT,
    }
}

/// Combine two hex characters into one byte, high nibble first.
///
/// Sentinel digits are folded in with wrapping arithmetic, so malformed
/// input produces a garbage byte rather than a panic.
pub fn hex_pair(high: u8, low: u8) -> u8 {
    hex_digit(high).wrapping_mul(16).wrapping_add(hex_digit(low))
}

/// Render bytes as lowercase base16
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(DIGITS[(b >> 4) as usize] as char);
        out.push(DIGITS[(b & 0x0F) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_digit_table() {
        assert_eq!(hex_digit(b'0'), 0);
        assert_eq!(hex_digit(b'9'), 9);
        assert_eq!(hex_digit(b'A'), 10);
        assert_eq!(hex_digit(b'f'), 15);
        assert_eq!(hex_digit(b'g'), INVALID_HEX_DIGIT);
        assert_eq!(hex_digit(b' '), INVALID_HEX_DIGIT);
    }

    #[test]
    fn test_hex_pair() {
        assert_eq!(hex_pair(b'4', b'9'), 0x49);
        assert_eq!(hex_pair(b'f', b'F'), 0xFF);
        // 0xFF * 16 + 0 wraps to 0xF0
        assert_eq!(hex_pair(b'z', b'0'), 0xF0);
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xAB, 0x10]), "00ab10");
        assert_eq!(to_hex(&[]), "");
    }
}
