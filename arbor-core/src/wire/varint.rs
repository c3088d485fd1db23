//! Variable-length integers and the byte cursor used by all decoders.
//!
//! Integers are big-endian base-128: each byte carries 7 bits, and every byte
//! except the last has its high bit set. Signed values are zigzag mapped
//! first (negative `i` becomes `(-i << 1) | 1`).
//!
//! Coordinates are a varint byte length followed by that many bytes of
//! varint-encoded ports.

use super::error::WireError;

/// Longest valid encoding of a u64.
pub const MAX_VARINT_LEN: usize = 10;

pub fn put_uint64(out: &mut Vec<u8>, mut v: u64) {
    let mut tmp = [0u8; MAX_VARINT_LEN];
    let mut idx = MAX_VARINT_LEN - 1;
    tmp[idx] = (v & 0x7f) as u8;
    v >>= 7;
    while v != 0 {
        idx -= 1;
        tmp[idx] = 0x80 | (v & 0x7f) as u8;
        v >>= 7;
    }
    out.extend_from_slice(&tmp[idx..]);
}

pub fn encode_uint64(v: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(uint64_len(v));
    put_uint64(&mut out, v);
    out
}

pub fn uint64_len(mut v: u64) -> usize {
    let mut len = 1;
    v >>= 7;
    while v != 0 {
        len += 1;
        v >>= 7;
    }
    len
}

/// Decode one varint from the front of `bs`, returning the value and the
/// number of bytes consumed.
pub fn decode_uint64(bs: &[u8]) -> Result<(u64, usize), WireError> {
    let mut elem: u64 = 0;
    for (i, b) in bs.iter().enumerate() {
        if i >= MAX_VARINT_LEN || elem >> 57 != 0 {
            return Err(WireError::BadVarint);
        }
        elem = (elem << 7) | (b & 0x7f) as u64;
        if b & 0x80 == 0 {
            return Ok((elem, i + 1));
        }
    }
    if bs.is_empty() {
        Err(WireError::Truncated { needed: 1 })
    } else {
        Err(WireError::BadVarint)
    }
}

pub fn zigzag_encode(i: i64) -> u64 {
    if i >= 0 {
        (i as u64) << 1
    } else {
        (i.unsigned_abs() << 1) | 1
    }
}

pub fn zigzag_decode(u: u64) -> i64 {
    let magnitude = (u >> 1) as i64;
    if u & 1 == 1 {
        -magnitude
    } else {
        magnitude
    }
}

pub fn put_int64(out: &mut Vec<u8>, i: i64) {
    put_uint64(out, zigzag_encode(i));
}

/// Append `ports` as a length-prefixed coordinate block.
pub fn put_coords(out: &mut Vec<u8>, ports: &[u64]) {
    let body_len: usize = ports.iter().map(|p| uint64_len(*p)).sum();
    put_uint64(out, body_len as u64);
    for port in ports {
        put_uint64(out, *port);
    }
}

pub fn encode_coords(ports: &[u64]) -> Vec<u8> {
    let mut out = Vec::new();
    put_coords(&mut out, ports);
    out
}

/// Cursor over a message being decoded.
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    pub fn uint64(&mut self) -> Result<u64, WireError> {
        let (v, n) = decode_uint64(self.buf)?;
        self.buf = &self.buf[n..];
        Ok(v)
    }

    pub fn int64(&mut self) -> Result<i64, WireError> {
        self.uint64().map(zigzag_decode)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let bytes = self.slice(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn slice(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        if self.buf.len() < len {
            return Err(WireError::Truncated {
                needed: len - self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    pub fn coords(&mut self) -> Result<Vec<u64>, WireError> {
        let len = self.uint64()?;
        let len = usize::try_from(len).map_err(|_| WireError::BadCoords)?;
        let mut body = WireReader::new(self.slice(len)?);
        let mut ports = Vec::new();
        while !body.is_empty() {
            ports.push(body.uint64().map_err(|_| WireError::BadCoords)?);
        }
        Ok(ports)
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let rest = self.buf;
        self.buf = &[];
        rest
    }

    pub fn finish(&self) -> Result<(), WireError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(WireError::TrailingBytes(self.buf.len()))
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // Property: decoding an encoding gives back the value and consumes it all
    proptest! {
        #[test]
        fn prop_varint_roundtrip(v in any::<u64>(), tail in prop::collection::vec(any::<u8>(), 0..4)) {
            let mut buf = encode_uint64(v);
            let len = buf.len();
            prop_assert_eq!(len, uint64_len(v));
            buf.extend_from_slice(&tail);
            prop_assert_eq!(decode_uint64(&buf), Ok((v, len)));
        }
    }

    // Property: zigzag keeps small magnitudes small, whatever the sign
    proptest! {
        #[test]
        fn prop_zigzag_roundtrip(v in (i64::MIN + 1)..=i64::MAX) {
            let u = zigzag_encode(v);
            prop_assert_eq!(zigzag_decode(u), v);
            prop_assert_eq!(u >> 1, v.unsigned_abs());
        }
    }

    // Property: any coordinate list survives the length-prefixed block
    proptest! {
        #[test]
        fn prop_coords_roundtrip(ports in prop::collection::vec(any::<u64>(), 0..16)) {
            let encoded = encode_coords(&ports);
            let mut r = WireReader::new(&encoded);
            prop_assert_eq!(r.coords().unwrap(), ports);
            prop_assert!(r.finish().is_ok());
        }
    }
}
