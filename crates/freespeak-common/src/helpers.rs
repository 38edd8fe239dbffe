//! Common helper functions for Freespeak.

/// Performs a constant-time comparison of two byte strings.
/// Used wherever a received digest is checked against a locally computed one.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (lhs, rhs) in a.iter().zip(b.iter()) {
        diff |= lhs ^ rhs;
    }
    diff == 0
}

/// Returns true if `value` looks like a truncated hash: exactly `len` lowercase hex digits.
pub fn is_truncated_hex(value: &str, len: usize) -> bool {
    value.len() == len
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
