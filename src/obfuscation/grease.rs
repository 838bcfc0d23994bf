//! TLS GREASE (RFC 8701) value selection
//!
//! Chrome and Safari sprinkle reserved GREASE codepoints into the cipher
//! suite list, supported groups, key shares, supported versions and the
//! extension list. A ClientHello that claims to be Chrome without them is an
//! instant giveaway, so every composed hello draws fresh values.

use rand::Rng;

/// The sixteen GREASE codepoints: both bytes are identical and of the form `0x?a`
pub const GREASE_VALUES: [u16; 16] = [
    0x0a0a, 0x1a1a, 0x2a2a, 0x3a3a, 0x4a4a, 0x5a5a, 0x6a6a, 0x7a7a, 0x8a8a, 0x9a9a, 0xaaaa,
    0xbaba, 0xcaca, 0xdada, 0xeaea, 0xfafa,
];

/// Pick a GREASE value uniformly at random
pub fn grease() -> u16 {
    GREASE_VALUES[rand::thread_rng().gen_range(0..GREASE_VALUES.len())]
}

/// Pick a GREASE value different from `other`
///
/// BoringSSL never repeats the same GREASE extension type twice in one hello.
pub fn grease_except(other: u16) -> u16 {
    loop {
        let value = grease();
        if value != other {
            return value;
        }
    }
}

/// Whether `value` is a GREASE codepoint
pub fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && (value >> 8) == (value & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grease_values() {
        for &value in &GREASE_VALUES {
            assert!(is_grease(value));
            assert_eq!(value >> 8, value & 0xff);
        }
        assert!(!is_grease(0x0a1a));
        assert!(!is_grease(0x1301));
    }

    #[test]
    fn test_grease_selection() {
        for _ in 0..64 {
            let first = grease();
            let second = grease_except(first);
            assert!(GREASE_VALUES.contains(&first));
            assert!(GREASE_VALUES.contains(&second));
            assert_ne!(first, second);
        }
    }
}
