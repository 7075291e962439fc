//! The type-length-value layer every message is built from.
//!
//! Types and lengths are variable-width integers: one byte for values up
//! to 252, then a marker byte (253, 254, 255) followed by a big-endian
//! u16, u32 or u64. Non-minimal encodings are rejected so every value has
//! exactly one wire form.

pub enum VarintError {
    BufferTooShort,
    NonMinimalIntegerEncoding,
    InvalidValue,
}

pub enum DecodingError {
    CannotDecodeType { err: VarintError },
    CannotDecodeLength { typ: u64, err: VarintError },
    CannotDecodeValue { typ: u64, len: usize },
}

#[derive(Copy, Clone)]
pub struct Tlv<'a> {
    pub typ: u64,
    pub val: &'a [u8],
}

impl<'a> Tlv<'a> {
    /// Decodes one element from the front of `bytes`, returning it together
    /// with the number of bytes it occupied.
    pub fn try_decode(bytes: &'a [u8]) -> Result<(Tlv<'a>, usize), DecodingError> {
        let mut cursor = 0;
        let typ = parse_varint(bytes, &mut cursor)
            .map_err(|err| DecodingError::CannotDecodeType { err })?;
        if typ == 0 {
            return Err(DecodingError::CannotDecodeType {
                err: VarintError::InvalidValue,
            });
        }

        let len: usize = parse_varint(bytes, &mut cursor)
            .map_err(|err| DecodingError::CannotDecodeLength { typ, err })?
            .try_into()
            .map_err(|_| DecodingError::CannotDecodeLength {
                typ,
                err: VarintError::InvalidValue,
            })?;

        if cursor + len > bytes.len() {
            return Err(DecodingError::CannotDecodeValue { typ, len });
        }

        let val = &bytes[cursor..(cursor + len)];
        Ok((Tlv { typ, val }, cursor + len))
    }

    pub fn val_as_u64(&self) -> Option<u64> {
        match self.val.len() {
            1 => Some(self.val[0] as u64),
            2 => Some(u16::from_be_bytes(self.val.try_into().ok()?) as u64),
            4 => Some(u32::from_be_bytes(self.val.try_into().ok()?) as u64),
            8 => Some(u64::from_be_bytes(self.val.try_into().ok()?)),
            _ => None,
        }
    }
}

/// What the framer learned about the element at the front of a buffer.
pub enum Measured {
    /// Not enough bytes yet to delimit the element.
    Incomplete,
    /// A complete header: the element's type, header size and value size.
    Complete {
        typ: u64,
        header_len: usize,
        value_len: usize,
    },
    /// The bytes cannot be the start of a valid element.
    Invalid,
}

/// Delimits the element at the front of `bytes` without touching its value.
pub fn measure(bytes: &[u8]) -> Measured {
    let mut cursor = 0;
    let typ = match parse_varint(bytes, &mut cursor) {
        Ok(t) if t > 0 => t,
        Ok(_) => return Measured::Invalid,
        Err(VarintError::BufferTooShort) => return Measured::Incomplete,
        Err(_) => return Measured::Invalid,
    };
    let value_len = match parse_varint(bytes, &mut cursor) {
        Ok(l) => match usize::try_from(l) {
            Ok(l) => l,
            Err(_) => return Measured::Invalid,
        },
        Err(VarintError::BufferTooShort) => return Measured::Incomplete,
        Err(_) => return Measured::Invalid,
    };
    Measured::Complete {
        typ,
        header_len: cursor,
        value_len,
    }
}

fn parse_varint(bytes: &[u8], cursor: &mut usize) -> Result<u64, VarintError> {
    if *cursor >= bytes.len() {
        return Err(VarintError::BufferTooShort);
    }
    let first = bytes[*cursor];
    *cursor += 1;
    match first {
        0..=252 => Ok(first as u64),
        253 => {
            if *cursor + 2 > bytes.len() {
                return Err(VarintError::BufferTooShort);
            }
            let next: [u8; 2] = bytes[*cursor..(*cursor + 2)].try_into().unwrap();
            *cursor += 2;
            let val = u16::from_be_bytes(next);
            if val > 252 {
                Ok(val as u64)
            } else {
                Err(VarintError::NonMinimalIntegerEncoding)
            }
        }
        254 => {
            if *cursor + 4 > bytes.len() {
                return Err(VarintError::BufferTooShort);
            }
            let next: [u8; 4] = bytes[*cursor..(*cursor + 4)].try_into().unwrap();
            *cursor += 4;
            let val = u32::from_be_bytes(next);
            if val > 65535 {
                Ok(val as u64)
            } else {
                Err(VarintError::NonMinimalIntegerEncoding)
            }
        }
        255 => {
            if *cursor + 8 > bytes.len() {
                return Err(VarintError::BufferTooShort);
            }
            let next: [u8; 8] = bytes[*cursor..(*cursor + 8)].try_into().unwrap();
            *cursor += 8;
            let val = u64::from_be_bytes(next);
            if val > 4294967295 {
                Ok(val)
            } else {
                Err(VarintError::NonMinimalIntegerEncoding)
            }
        }
    }
}

pub fn varint_len(v: u64) -> usize {
    if v <= 252 {
        1
    } else if v <= 65535 {
        3
    } else if v <= 4294967295 {
        5
    } else {
        9
    }
}

pub fn write_varint(out: &mut Vec<u8>, v: u64) {
    if v <= 252 {
        out.push(v as u8);
    } else if v <= 65535 {
        out.push(253);
        out.extend_from_slice(&(v as u16).to_be_bytes());
    } else if v <= 4294967295 {
        out.push(254);
        out.extend_from_slice(&(v as u32).to_be_bytes());
    } else {
        out.push(255);
        out.extend_from_slice(&v.to_be_bytes());
    }
}

pub fn write_header(out: &mut Vec<u8>, typ: u64, value_len: usize) {
    write_varint(out, typ);
    write_varint(out, value_len as u64);
}

pub fn write_tlv(out: &mut Vec<u8>, typ: u64, val: &[u8]) {
    write_header(out, typ, val.len());
    out.extend_from_slice(val);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths() {
        for v in 0u64..252 {
            assert_eq!(varint_len(v), 1);
        }
        assert_eq!(varint_len(253), 3);
        assert_eq!(varint_len(65535), 3);
        assert_eq!(varint_len(65536), 5);
        assert_eq!(varint_len(4294967295), 5);
        assert_eq!(varint_len(4294967296), 9);
    }

    #[test]
    fn test_roundtrip() {
        for v in [0u64, 1, 252, 253, 300, 65535, 65536, 1 << 40] {
            let mut out = Vec::new();
            write_varint(&mut out, v);
            assert_eq!(out.len(), varint_len(v));
            let mut cursor = 0;
            assert!(matches!(parse_varint(&out, &mut cursor), Ok(got) if got == v));
            assert_eq!(cursor, out.len());
        }
    }

    #[test]
    fn test_non_minimal_rejected() {
        // 5 must be a single byte, not 253 00 05
        let bytes = [253u8, 0, 5];
        let mut cursor = 0;
        assert!(matches!(
            parse_varint(&bytes, &mut cursor),
            Err(VarintError::NonMinimalIntegerEncoding)
        ));
    }

    #[test]
    fn test_tlv_decode() {
        let mut out = Vec::new();
        write_tlv(&mut out, 7, &[1, 2, 3]);
        let decoded = Tlv::try_decode(&out);
        let (tlv, used) = match decoded {
            Ok(ok) => ok,
            Err(_) => panic!("decode failed"),
        };
        assert_eq!(tlv.typ, 7);
        assert_eq!(tlv.val, &[1, 2, 3]);
        assert_eq!(used, out.len());
    }

    #[test]
    fn test_measure_incomplete() {
        let mut out = Vec::new();
        write_tlv(&mut out, 6, &[9; 300]);
        match measure(&out) {
            Measured::Complete {
                typ,
                header_len,
                value_len,
            } => {
                assert_eq!(typ, 6);
                assert_eq!(header_len + value_len, out.len());
            }
            _ => panic!("expected complete"),
        }
        // The header alone is enough to measure, one byte is not
        assert!(matches!(measure(&out[..1]), Measured::Incomplete));
        assert!(matches!(
            measure(&out[..4]),
            Measured::Complete { value_len: 300, .. }
        ));
    }

    #[test]
    fn test_zero_type_invalid() {
        assert!(matches!(measure(&[0, 1, 2]), Measured::Invalid));
        assert!(Tlv::try_decode(&[0, 0]).is_err());
    }
}
