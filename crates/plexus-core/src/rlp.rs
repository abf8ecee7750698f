//! RLP (Recursive Length Prefix) stream helpers.
//!
//! Thin composition layer over `alloy-rlp` headers. Consensus records are
//! hand-encoded field by field (the layouts carry optional trailing items
//! and nested bundles that derive macros do not express), so encoding is a
//! `Vec<u8>` sink plus `append_*` helpers and decoding is a cursor over a
//! list payload.

use crate::{Address, CoreError, Hash, Result, Signature};
use alloy_rlp::Header;

/// Append a byte string item.
pub fn append_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    if bytes.len() == 1 && bytes[0] < 0x80 {
        out.push(bytes[0]);
        return;
    }
    Header { list: false, payload_length: bytes.len() }.encode(out);
    out.extend_from_slice(bytes);
}

/// Append an unsigned integer as a minimal big-endian byte string.
/// Zero encodes as the empty string (0x80).
pub fn append_u64(out: &mut Vec<u8>, value: u64) {
    if value == 0 {
        out.push(0x80);
        return;
    }
    let full = value.to_be_bytes();
    let start = full.iter().position(|&b| b != 0).unwrap_or(7);
    append_bytes(out, &full[start..]);
}

/// Append a pre-encoded payload wrapped in a list header.
pub fn append_list(out: &mut Vec<u8>, payload: &[u8]) {
    Header { list: true, payload_length: payload.len() }.encode(out);
    out.extend_from_slice(payload);
}

/// Wrap a pre-encoded payload in a list header.
pub fn wrap_list(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 9);
    append_list(&mut out, payload);
    out
}

/// Append a list of hashes as an RLP list of 32-byte strings.
pub fn append_hash_list(out: &mut Vec<u8>, hashes: &[Hash]) {
    let mut payload = Vec::with_capacity(hashes.len() * 33);
    for hash in hashes {
        append_bytes(&mut payload, hash);
    }
    append_list(out, &payload);
}

/// Decoding cursor over the payload of an RLP list.
pub struct RlpCursor<'a> {
    rest: &'a [u8],
}

impl<'a> RlpCursor<'a> {
    /// Decode a list header from `buf` and return a cursor over its
    /// payload. `buf` is advanced past the whole list.
    pub fn list(buf: &mut &'a [u8]) -> Result<Self> {
        let header = Header::decode(buf)?;
        if !header.list {
            return Err(CoreError::Rlp("expected list".into()));
        }
        if buf.len() < header.payload_length {
            return Err(CoreError::Rlp("list payload truncated".into()));
        }
        let (payload, rest) = buf.split_at(header.payload_length);
        *buf = rest;
        Ok(Self { rest: payload })
    }

    /// Cursor over a fully owned encoded list.
    pub fn from_encoded(mut buf: &'a [u8]) -> Result<Self> {
        let cursor = Self::list(&mut buf)?;
        if !buf.is_empty() {
            return Err(CoreError::Rlp("trailing bytes after list".into()));
        }
        Ok(cursor)
    }

    /// True when every item has been consumed.
    pub fn is_empty(&self) -> bool {
        self.rest.is_empty()
    }

    /// Number of remaining top-level items.
    pub fn remaining_items(&self) -> Result<usize> {
        let mut probe = self.rest;
        let mut count = 0;
        while !probe.is_empty() {
            // For a single byte below 0x80 the header leaves the byte in
            // place with payload_length 1, so skipping the payload is
            // uniform across all item kinds.
            let header = Header::decode(&mut probe)?;
            if probe.len() < header.payload_length {
                return Err(CoreError::Rlp("item payload truncated".into()));
            }
            probe = &probe[header.payload_length..];
            count += 1;
        }
        Ok(count)
    }

    /// Next item as a byte string of any length.
    pub fn next_bytes(&mut self) -> Result<Vec<u8>> {
        let header = Header::decode(&mut self.rest)?;
        if header.list {
            return Err(CoreError::Rlp("expected byte string, found list".into()));
        }
        if self.rest.len() < header.payload_length {
            return Err(CoreError::Rlp("string payload truncated".into()));
        }
        let (data, rest) = self.rest.split_at(header.payload_length);
        self.rest = rest;
        Ok(data.to_vec())
    }

    /// Next item as an exactly `N`-byte array.
    pub fn next_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.next_bytes()?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| CoreError::Rlp(format!("expected {N} bytes, got {}", bytes.len())))
    }

    /// Next item as a 32-byte hash.
    pub fn next_hash(&mut self) -> Result<Hash> {
        self.next_array::<32>()
    }

    /// Next item as a 20-byte address.
    pub fn next_address(&mut self) -> Result<Address> {
        self.next_array::<20>()
    }

    /// Next item as a 65-byte signature.
    pub fn next_signature(&mut self) -> Result<Signature> {
        self.next_array::<65>()
    }

    /// Next item as a u64 (minimal big-endian, empty string = 0).
    pub fn next_u64(&mut self) -> Result<u64> {
        let bytes = self.next_bytes()?;
        if bytes.len() > 8 {
            return Err(CoreError::Rlp("integer wider than u64".into()));
        }
        if bytes.first() == Some(&0) {
            return Err(CoreError::Rlp("integer has leading zero".into()));
        }
        Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64))
    }

    /// Next item as a nested list cursor.
    pub fn next_list(&mut self) -> Result<RlpCursor<'a>> {
        RlpCursor::list(&mut self.rest)
    }

    /// Next item in full encoded form (header plus payload), without
    /// interpreting it.
    pub fn next_raw(&mut self) -> Result<&'a [u8]> {
        let start = self.rest;
        let mut probe = self.rest;
        let header = Header::decode(&mut probe)?;
        if probe.len() < header.payload_length {
            return Err(CoreError::Rlp("item payload truncated".into()));
        }
        let header_len = start.len() - probe.len();
        let total = header_len + header.payload_length;
        // A single byte below 0x80 is its own encoding; the header does
        // not consume it.
        let total = total.max(1);
        let (raw, rest) = start.split_at(total);
        self.rest = rest;
        Ok(raw)
    }

    /// Collect the remaining items as hashes.
    pub fn remaining_hashes(&mut self) -> Result<Vec<Hash>> {
        let mut hashes = Vec::new();
        while !self.is_empty() {
            hashes.push(self.next_hash()?);
        }
        Ok(hashes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_u64_zero() {
        let mut out = Vec::new();
        append_u64(&mut out, 0);
        assert_eq!(out, vec![0x80]);
    }

    #[test]
    fn test_append_u64_small() {
        let mut out = Vec::new();
        append_u64(&mut out, 0x7f);
        assert_eq!(out, vec![0x7f]);

        out.clear();
        append_u64(&mut out, 0x80);
        assert_eq!(out, vec![0x81, 0x80]);
    }

    #[test]
    fn test_append_bytes_empty() {
        let mut out = Vec::new();
        append_bytes(&mut out, &[]);
        assert_eq!(out, vec![0x80]);
    }

    #[test]
    fn test_list_round_trip() {
        let mut payload = Vec::new();
        append_u64(&mut payload, 42);
        append_bytes(&mut payload, b"cat");
        append_u64(&mut payload, 0);
        let encoded = wrap_list(&payload);

        let mut cursor = RlpCursor::from_encoded(&encoded).unwrap();
        assert_eq!(cursor.next_u64().unwrap(), 42);
        assert_eq!(cursor.next_bytes().unwrap(), b"cat");
        assert_eq!(cursor.next_u64().unwrap(), 0);
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_nested_list_round_trip() {
        let hashes = [[1u8; 32], [2u8; 32]];
        let mut payload = Vec::new();
        append_hash_list(&mut payload, &hashes);
        append_u64(&mut payload, 7);
        let encoded = wrap_list(&payload);

        let mut cursor = RlpCursor::from_encoded(&encoded).unwrap();
        let mut inner = cursor.next_list().unwrap();
        assert_eq!(inner.remaining_hashes().unwrap(), hashes.to_vec());
        assert_eq!(cursor.next_u64().unwrap(), 7);
    }

    #[test]
    fn test_empty_list() {
        let encoded = wrap_list(&[]);
        assert_eq!(encoded, vec![0xc0]);
        let cursor = RlpCursor::from_encoded(&encoded).unwrap();
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_next_raw_reencodes() {
        let mut payload = Vec::new();
        append_bytes(&mut payload, b"hello world");
        append_u64(&mut payload, 5);
        let encoded = wrap_list(&payload);

        let mut cursor = RlpCursor::from_encoded(&encoded).unwrap();
        let raw = cursor.next_raw().unwrap().to_vec();

        let mut expect = Vec::new();
        append_bytes(&mut expect, b"hello world");
        assert_eq!(raw, expect);

        // Single small byte item
        let raw2 = cursor.next_raw().unwrap();
        assert_eq!(raw2, &[0x05]);
    }

    #[test]
    fn test_wrong_width_rejected() {
        let mut payload = Vec::new();
        append_bytes(&mut payload, &[1u8; 31]);
        let encoded = wrap_list(&payload);

        let mut cursor = RlpCursor::from_encoded(&encoded).unwrap();
        assert!(cursor.next_hash().is_err());
    }

    #[test]
    fn test_truncated_rejected() {
        let mut payload = Vec::new();
        append_bytes(&mut payload, &[9u8; 40]);
        let encoded = wrap_list(&payload);
        assert!(RlpCursor::from_encoded(&encoded[..encoded.len() - 1]).is_err());
    }
}
