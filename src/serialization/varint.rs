//! CompactSize encoding/decoding
//!
//! - value < 0xfd: single byte
//! - value <= 0xffff: 0xfd prefix + 2 bytes (little-endian)
//! - value <= 0xffffffff: 0xfe prefix + 4 bytes (little-endian)
//! - otherwise: 0xff prefix + 8 bytes (little-endian)
//!
//! Decoding rejects values that a shorter form could have carried.

use crate::error::SerializationError;

/// Encode a u64 value as a CompactSize
///
/// # Examples
///
/// ```
/// use abc_consensus::serialization::varint::encode_varint;
///
/// assert_eq!(encode_varint(0), vec![0]);
/// assert_eq!(encode_varint(252), vec![252]);
/// assert_eq!(encode_varint(253), vec![0xfd, 253, 0]);
/// assert_eq!(encode_varint(65536), vec![0xfe, 0, 0, 1, 0]);
/// ```
pub fn encode_varint(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut result = vec![0xfd];
        result.extend_from_slice(&(value as u16).to_le_bytes());
        result
    } else if value <= 0xffff_ffff {
        let mut result = vec![0xfe];
        result.extend_from_slice(&(value as u32).to_le_bytes());
        result
    } else {
        let mut result = vec![0xff];
        result.extend_from_slice(&value.to_le_bytes());
        result
    }
}

/// Decode a CompactSize, returning the value and the bytes consumed
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), SerializationError> {
    let first = *data.first().ok_or(SerializationError::UnexpectedEof {
        needed: 1,
        available: 0,
    })?;

    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        v => return Ok((v as u64, 1)),
    };

    if data.len() < 1 + width {
        return Err(SerializationError::UnexpectedEof {
            needed: 1 + width,
            available: data.len(),
        });
    }

    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&data[1..1 + width]);
    let value = u64::from_le_bytes(buf);

    let minimum = match width {
        2 => 0xfd,
        4 => 0x1_0000,
        _ => 0x1_0000_0000,
    };
    if value < minimum {
        return Err(SerializationError::NonCanonicalVarInt);
    }

    Ok((value, 1 + width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_decode_boundaries() {
        assert_eq!(decode_varint(&[0xfc]).unwrap(), (0xfc, 1));
        assert_eq!(decode_varint(&[0xfd, 0xfd, 0x00]).unwrap(), (0xfd, 3));
        assert_eq!(
            decode_varint(&[0xfe, 0x00, 0x00, 0x01, 0x00]).unwrap(),
            (0x10000, 5)
        );
    }

    #[test]
    fn test_decode_non_canonical() {
        assert_eq!(
            decode_varint(&[0xfd, 0x10, 0x00]),
            Err(SerializationError::NonCanonicalVarInt)
        );
        assert_eq!(
            decode_varint(&[0xfe, 0xff, 0xff, 0x00, 0x00]),
            Err(SerializationError::NonCanonicalVarInt)
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode_varint(&[0xfe, 0x01]),
            Err(SerializationError::UnexpectedEof { .. })
        ));
        assert!(decode_varint(&[]).is_err());
    }

    proptest! {
        #[test]
        fn prop_varint_decodes_what_it_encodes(value in any::<u64>()) {
            let encoded = encode_varint(value);
            let (decoded, used) = decode_varint(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(used, encoded.len());
        }
    }
}
