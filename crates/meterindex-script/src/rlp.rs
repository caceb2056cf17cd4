//! Thin RLP reading/writing helpers over `alloy_rlp`.
//!
//! Script payloads are positional RLP lists; these helpers split a list into
//! raw items and read each item as the scalar type its position requires.

use alloy_rlp::{Encodable, Header};

use meterindex_core::amount::{amount_from_be_bytes, amount_to_be_bytes, U256};
use meterindex_core::error::DecodeError;

fn rlp_err(e: alloy_rlp::Error) -> DecodeError {
    DecodeError::Rlp {
        reason: e.to_string(),
    }
}

/// Read one item off the front of `buf`, returning its header and payload.
fn take_item<'a>(buf: &mut &'a [u8]) -> Result<(Header, &'a [u8]), DecodeError> {
    let header = Header::decode(buf).map_err(rlp_err)?;
    if buf.len() < header.payload_length {
        return Err(DecodeError::Rlp {
            reason: format!(
                "item needs {} bytes, {} remain",
                header.payload_length,
                buf.len()
            ),
        });
    }
    let (payload, rest) = buf.split_at(header.payload_length);
    *buf = rest;
    Ok((header, payload))
}

/// Split an encoded list into its encoded items.
pub fn list_items(data: &[u8]) -> Result<Vec<&[u8]>, DecodeError> {
    let mut buf = data;
    let (header, mut payload) = take_item(&mut buf)?;
    if !header.list {
        return Err(DecodeError::Rlp {
            reason: "expected a list".into(),
        });
    }
    if !buf.is_empty() {
        return Err(DecodeError::Rlp {
            reason: format!("{} trailing bytes after list", buf.len()),
        });
    }

    let mut items = Vec::new();
    while !payload.is_empty() {
        let before = payload;
        take_item(&mut payload)?;
        items.push(&before[..before.len() - payload.len()]);
    }
    Ok(items)
}

/// Payload of a string item.
pub fn item_bytes(item: &[u8]) -> Result<&[u8], DecodeError> {
    let mut buf = item;
    let (header, payload) = take_item(&mut buf)?;
    if header.list {
        return Err(DecodeError::Rlp {
            reason: "expected a string, found a list".into(),
        });
    }
    Ok(payload)
}

pub fn item_u64(item: &[u8], field: &'static str) -> Result<u64, DecodeError> {
    let bytes = item_bytes(item)?;
    if bytes.len() > 8 {
        return Err(DecodeError::Overflow { field });
    }
    Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

pub fn item_u32(item: &[u8], field: &'static str) -> Result<u32, DecodeError> {
    u32::try_from(item_u64(item, field)?).map_err(|_| DecodeError::Overflow { field })
}

pub fn item_u16(item: &[u8], field: &'static str) -> Result<u16, DecodeError> {
    u16::try_from(item_u64(item, field)?).map_err(|_| DecodeError::Overflow { field })
}

pub fn item_u8(item: &[u8], field: &'static str) -> Result<u8, DecodeError> {
    u8::try_from(item_u64(item, field)?).map_err(|_| DecodeError::Overflow { field })
}

pub fn item_amount(item: &[u8], field: &'static str) -> Result<U256, DecodeError> {
    amount_from_be_bytes(item_bytes(item)?, field)
}

pub fn item_string(item: &[u8], field: &'static str) -> Result<String, DecodeError> {
    String::from_utf8(item_bytes(item)?.to_vec()).map_err(|e| DecodeError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// A fixed-width byte field as lowercase `0x` hex. An empty item reads as
/// all zeroes.
pub fn item_fixed_hex(item: &[u8], width: usize, field: &'static str) -> Result<String, DecodeError> {
    let bytes = item_bytes(item)?;
    if bytes.is_empty() {
        return Ok(format!("0x{}", "00".repeat(width)));
    }
    if bytes.len() != width {
        return Err(DecodeError::InvalidField {
            field,
            reason: format!("expected {width} bytes, got {}", bytes.len()),
        });
    }
    Ok(format!("0x{}", hex::encode(bytes)))
}

// ─── Encoding ────────────────────────────────────────────────────────────────

pub fn encode_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    bytes.encode(&mut out);
    out
}

pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    value.encode(&mut out);
    out
}

pub fn encode_amount(amount: U256) -> Vec<u8> {
    encode_bytes(&amount_to_be_bytes(amount))
}

/// `0x` hex text as raw bytes. Invalid hex encodes as empty.
pub fn encode_hex(text: &str) -> Vec<u8> {
    encode_bytes(&hex::decode(text.trim_start_matches("0x")).unwrap_or_default())
}

/// Wrap already-encoded items in a list header.
pub fn encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload_length = items.iter().map(Vec::len).sum();
    let mut out = Vec::with_capacity(payload_length + 9);
    Header {
        list: true,
        payload_length,
    }
    .encode(&mut out);
    for item in items {
        out.extend_from_slice(item);
    }
    out
}
