//! XDR (RFC 4506) encoding over `bytes` buffers
//!
//! Every item is a multiple of four bytes on the wire, big-endian.
//! Variable-length opaques and strings carry a u32 length and are padded
//! with zeroes up to the next four-byte boundary.
//!
//! ```rust
//! use bytes::BytesMut;
//! use xdr::Xdr;
//!
//! let mut buf = BytesMut::new();
//! "abc".to_string().encode(&mut buf).unwrap();
//! assert_eq!(&buf[..], &[0, 0, 0, 3, b'a', b'b', b'c', 0]);
//!
//! let decoded = String::decode(&mut buf.freeze()).unwrap();
//! assert_eq!(decoded, "abc");
//! ```

use crate::error::{Result, XdrError};
use bytes::{Buf, BufMut, Bytes};

/// XDR unit size; everything is aligned to it.
pub const XDR_UNIT: usize = 4;

/// Number of zero bytes needed after `len` bytes of opaque data.
pub const fn pad_len(len: usize) -> usize {
    (XDR_UNIT - len % XDR_UNIT) % XDR_UNIT
}

/// Encoded size of a variable-length opaque of `len` bytes (length word included).
pub const fn opaque_size(len: usize) -> usize {
    XDR_UNIT + len + pad_len(len)
}

/// Encode/decode a value in XDR representation
pub trait Xdr: Sized {
    /// Append the encoded value to `buf`
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()>;

    /// Decode a value, consuming exactly its encoded bytes
    fn decode<B: Buf>(buf: &mut B) -> Result<Self>;

    /// Number of bytes `encode` will write
    fn encoded_size(&self) -> usize;
}

/// Marker for types whose encoding has a compile-time size
pub trait FixedSize: Xdr {
    const SIZE: usize;
}

pub(crate) fn ensure_space<B: BufMut>(buf: &B, need: usize, what: &'static str) -> Result<()> {
    if buf.remaining_mut() < need {
        return Err(XdrError::BufferFull {
            what,
            need,
            have: buf.remaining_mut(),
        });
    }
    Ok(())
}

pub(crate) fn ensure_bytes<B: Buf>(buf: &B, need: usize, what: &'static str) -> Result<()> {
    if buf.remaining() < need {
        return Err(XdrError::Truncated {
            what,
            need,
            have: buf.remaining(),
        });
    }
    Ok(())
}

macro_rules! impl_xdr_int {
    ($type:ty, $put_method:ident, $get_method:ident, $size:expr) => {
        impl Xdr for $type {
            fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
                ensure_space(buf, $size, stringify!($type))?;
                buf.$put_method(*self);
                Ok(())
            }

            fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
                ensure_bytes(buf, $size, stringify!($type))?;
                Ok(buf.$get_method())
            }

            fn encoded_size(&self) -> usize {
                $size
            }
        }

        impl FixedSize for $type {
            const SIZE: usize = $size;
        }
    };
}

impl_xdr_int!(u32, put_u32, get_u32, 4);
impl_xdr_int!(i32, put_i32, get_i32, 4);
impl_xdr_int!(u64, put_u64, get_u64, 8);
impl_xdr_int!(i64, put_i64, get_i64, 8);

// XDR booleans are enums: a full word holding 0 or 1.
impl Xdr for bool {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        u32::from(*self).encode(buf)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        match u32::decode(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(XdrError::invalid_data(format!(
                "bool discriminant {} is neither 0 nor 1",
                other
            ))),
        }
    }

    fn encoded_size(&self) -> usize {
        4
    }
}

impl FixedSize for bool {
    const SIZE: usize = 4;
}

impl Xdr for () {
    fn encode<B: BufMut>(&self, _buf: &mut B) -> Result<()> {
        Ok(())
    }

    fn decode<B: Buf>(_buf: &mut B) -> Result<Self> {
        Ok(())
    }

    fn encoded_size(&self) -> usize {
        0
    }
}

/// Fixed-length opaque (`opaque name[N]`)
impl<const N: usize> Xdr for [u8; N] {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let total = N + pad_len(N);
        ensure_space(buf, total, "fixed opaque")?;
        buf.put_slice(self);
        buf.put_bytes(0, pad_len(N));
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let total = N + pad_len(N);
        ensure_bytes(buf, total, "fixed opaque")?;
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        buf.advance(pad_len(N));
        Ok(out)
    }

    fn encoded_size(&self) -> usize {
        N + pad_len(N)
    }
}

impl<const N: usize> FixedSize for [u8; N] {
    const SIZE: usize = N + pad_len(N);
}

/// Write a variable-length opaque from a slice
pub fn encode_opaque<B: BufMut>(buf: &mut B, data: &[u8]) -> Result<()> {
    ensure_space(buf, opaque_size(data.len()), "opaque")?;
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    buf.put_bytes(0, pad_len(data.len()));
    Ok(())
}

/// Read a variable-length opaque whose declared length must not exceed `max`
pub fn decode_opaque_bounded<B: Buf>(buf: &mut B, max: usize) -> Result<Bytes> {
    let len = u32::decode(buf)? as usize;
    if len > max {
        return Err(XdrError::TooLong {
            what: "opaque",
            len,
            max,
        });
    }
    ensure_bytes(buf, len + pad_len(len), "opaque body")?;
    let data = buf.copy_to_bytes(len);
    buf.advance(pad_len(len));
    Ok(data)
}

/// Variable-length opaque (`opaque name<>`)
impl Xdr for Bytes {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_opaque(buf, self)
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        decode_opaque_bounded(buf, u32::MAX as usize)
    }

    fn encoded_size(&self) -> usize {
        opaque_size(self.len())
    }
}

impl Xdr for String {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        encode_opaque(buf, self.as_bytes())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let raw = decode_opaque_bounded(buf, u32::MAX as usize)?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| XdrError::invalid_data(format!("string is not UTF-8: {}", e)))
    }

    fn encoded_size(&self) -> usize {
        opaque_size(self.len())
    }
}

/// Counted array (`T name<>`)
impl<T: Xdr> Xdr for Vec<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        (self.len() as u32).encode(buf)?;
        for item in self {
            item.encode(buf)?;
        }
        Ok(())
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        let count = u32::decode(buf)? as usize;
        // Every element occupies at least one word, so a count larger than
        // the remaining words cannot be valid; reject it before allocating.
        if count > buf.remaining() / XDR_UNIT {
            return Err(XdrError::Truncated {
                what: "array",
                need: count * XDR_UNIT,
                have: buf.remaining(),
            });
        }
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(buf)?);
        }
        Ok(items)
    }

    fn encoded_size(&self) -> usize {
        XDR_UNIT + self.iter().map(Xdr::encoded_size).sum::<usize>()
    }
}

/// Optional data (`T *name`)
impl<T: Xdr> Xdr for Option<T> {
    fn encode<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            Some(value) => {
                true.encode(buf)?;
                value.encode(buf)
            }
            None => false.encode(buf),
        }
    }

    fn decode<B: Buf>(buf: &mut B) -> Result<Self> {
        if bool::decode(buf)? {
            Ok(Some(T::decode(buf)?))
        } else {
            Ok(None)
        }
    }

    fn encoded_size(&self) -> usize {
        XDR_UNIT + self.as_ref().map_or(0, Xdr::encoded_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_integers_are_big_endian() {
        let mut buf = BytesMut::new();
        0x0102_0304u32.encode(&mut buf).unwrap();
        (-2i32).encode(&mut buf).unwrap();
        0x0102_0304_0506_0708u64.encode(&mut buf).unwrap();
        assert_eq!(
            &buf[..],
            &[1, 2, 3, 4, 0xff, 0xff, 0xff, 0xfe, 1, 2, 3, 4, 5, 6, 7, 8]
        );

        let mut rd = buf.freeze();
        assert_eq!(u32::decode(&mut rd).unwrap(), 0x0102_0304);
        assert_eq!(i32::decode(&mut rd).unwrap(), -2);
        assert_eq!(u64::decode(&mut rd).unwrap(), 0x0102_0304_0506_0708);
        assert!(!rd.has_remaining());
    }

    #[test]
    fn test_bool_rejects_bad_discriminant() {
        let mut rd = Bytes::from_static(&[0, 0, 0, 2]);
        assert!(matches!(
            bool::decode(&mut rd),
            Err(XdrError::InvalidData(_))
        ));
    }

    #[test]
    fn test_opaque_padding() {
        for len in 0..9usize {
            let data = Bytes::from(vec![0xabu8; len]);
            let mut buf = BytesMut::new();
            data.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), data.encoded_size());
            assert_eq!(buf.len() % XDR_UNIT, 0);
            assert!(buf[4 + len..].iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_fixed_opaque() {
        let verifier = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut buf = BytesMut::new();
        verifier.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 8);

        let odd = [9u8; 5];
        odd.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);

        let mut rd = buf.freeze();
        assert_eq!(<[u8; 8]>::decode(&mut rd).unwrap(), verifier);
        assert_eq!(<[u8; 5]>::decode(&mut rd).unwrap(), odd);
    }

    #[test]
    fn test_truncated_opaque() {
        // Declares 8 bytes but carries 3.
        let mut rd = Bytes::from_static(&[0, 0, 0, 8, 1, 2, 3]);
        assert!(matches!(
            Bytes::decode(&mut rd),
            Err(XdrError::Truncated { .. })
        ));
    }

    #[test]
    fn test_bounded_opaque() {
        let mut buf = BytesMut::new();
        encode_opaque(&mut buf, b"hello").unwrap();
        let err = decode_opaque_bounded(&mut buf.freeze(), 4).unwrap_err();
        assert_eq!(
            err,
            XdrError::TooLong {
                what: "opaque",
                len: 5,
                max: 4
            }
        );
    }

    #[test]
    fn test_array_count_sanity() {
        // A huge count with no body must not allocate.
        let mut rd = Bytes::from_static(&[0xff, 0xff, 0xff, 0xff]);
        assert!(Vec::<u32>::decode(&mut rd).is_err());
    }

    #[test]
    fn test_option_and_vec() {
        let value: Vec<Option<u32>> = vec![Some(7), None, Some(9)];
        let mut buf = BytesMut::new();
        value.encode(&mut buf).unwrap();
        assert_eq!(buf.len(), value.encoded_size());
        let decoded = Vec::<Option<u32>>::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_random_strings() {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let len = rng.gen_range(0..64);
            let s: String = (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect();
            let mut buf = BytesMut::new();
            s.encode(&mut buf).unwrap();
            assert_eq!(buf.len(), opaque_size(len));
            assert_eq!(String::decode(&mut buf.freeze()).unwrap(), s);
        }
    }

    #[test]
    fn test_fixed_sizes() {
        assert_eq!(<u32 as FixedSize>::SIZE, 4);
        assert_eq!(<u64 as FixedSize>::SIZE, 8);
        assert_eq!(<[u8; 16] as FixedSize>::SIZE, 16);
        assert_eq!(<[u8; 5] as FixedSize>::SIZE, 8);
    }
}
