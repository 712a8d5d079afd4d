//! Compact ("nBits") target encoding
//!
//! A compact target is a base-256 float: the top byte is the size in
//! bytes, the low 23 bits the mantissa, bit 23 a sign.

use primitive_types::U256;

/// A decoded compact target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub value: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// Decode a compact target, reporting sign and overflow
pub fn decode_compact(compact: u32) -> CompactTarget {
    let size = compact >> 24;
    let mut word = compact & 0x007f_ffff;

    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    let negative = word != 0 && (compact & 0x0080_0000) != 0;

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else if overflow {
        U256::zero()
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };

    CompactTarget {
        value,
        negative,
        overflow,
    }
}

/// Decode a compact target, mapping negative and overflowing encodings
/// to zero
pub fn target_from_compact(compact: u32) -> U256 {
    let target = decode_compact(compact);
    if target.negative || target.overflow {
        U256::zero()
    } else {
        target.value
    }
}

/// Encode a target in compact form (never sets the sign bit)
pub fn encode_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mut compact = if size <= 3 {
        (target.low_u64() << (8 * (3 - size))) as u32
    } else {
        (target >> (8 * (size - 3))).low_u64() as u32
    };

    // The sign bit is set: shift the mantissa down and grow the exponent
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_known_values() {
        let target = decode_compact(0x1d00ffff);
        assert!(!target.negative && !target.overflow);
        assert_eq!(target.value, U256::from(0xffffu64) << 208);

        assert_eq!(decode_compact(0x03123456).value, U256::from(0x123456u64));
        assert_eq!(decode_compact(0x02123456).value, U256::from(0x1234u64));
        assert_eq!(decode_compact(0x01003456).value, U256::zero());
    }

    #[test]
    fn test_negative_and_overflow_flags() {
        assert!(decode_compact(0x04923456).negative);
        assert!(!decode_compact(0x04800000).negative);
        assert!(decode_compact(0xff123456).overflow);
        assert!(!decode_compact(0x20123456).overflow);
        assert_eq!(target_from_compact(0x04923456), U256::zero());
    }

    #[test]
    fn test_encode_normalises_sign_bit() {
        assert_eq!(encode_compact(U256::from(0x80u64)), 0x02008000);
        assert_eq!(encode_compact(U256::from(0x123456u64)), 0x03123456);
        assert_eq!(encode_compact(U256::zero()), 0);
    }

    #[test]
    fn test_encode_decode_stable() {
        for compact in [0x1d00ffffu32, 0x1b0404cb, 0x207fffff, 0x1e03ffff] {
            assert_eq!(encode_compact(decode_compact(compact).value), compact);
        }
    }
}
