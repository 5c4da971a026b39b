//! Minimal RLP encoding used for hashing. Decoding is never needed: data
//! crosses the peer boundary as typed values, not as wire bytes.

use alloy_primitives::{Address, B256, U256};

/// RLP-encode a single byte string (already raw bytes).
pub fn encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        return data.to_vec();
    }
    let mut out = length_prefix(data.len(), 0x80);
    out.extend_from_slice(data);
    out
}

pub fn encode_b256(h: &B256) -> Vec<u8> {
    encode_bytes(h.as_slice())
}

pub fn encode_address(a: &Address) -> Vec<u8> {
    encode_bytes(a.as_slice())
}

/// Optional address: contract creations encode an empty string.
pub fn encode_opt_address(a: &Option<Address>) -> Vec<u8> {
    match a {
        Some(a) => encode_address(a),
        None => encode_bytes(&[]),
    }
}

/// RLP-encode a U256 as big-endian bytes with no leading zeros.
pub fn encode_u256(v: &U256) -> Vec<u8> {
    let buf = v.to_be_bytes::<32>();
    let start = buf.iter().position(|&b| b != 0).unwrap_or(32);
    encode_bytes(&buf[start..])
}

/// RLP-encode a u64 as big-endian bytes with no leading zeros.
pub fn encode_u64(v: u64) -> Vec<u8> {
    let bytes = v.to_be_bytes();
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(8);
    encode_bytes(&bytes[start..])
}

/// Build an RLP list from already-encoded items.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let total_len: usize = items.iter().map(Vec::len).sum();
    let mut out = length_prefix(total_len, 0xc0);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}

fn length_prefix(len: usize, offset: u8) -> Vec<u8> {
    if len < 56 {
        vec![offset + len as u8]
    } else {
        let be = (len as u64).to_be_bytes();
        let start = be.iter().position(|&b| b != 0).unwrap_or(7);
        let mut out = vec![offset + 55 + (8 - start) as u8];
        out.extend_from_slice(&be[start..]);
        out
    }
}
