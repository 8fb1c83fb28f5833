//! Stored value envelope: 8-byte big-endian expiry (epoch millis, 0 = never)
//! followed by the payload.

use std::time::Duration;

use crate::error::{StateError, StateResult};

const HEADER_LEN: usize = 8;

/// Encode a payload with an optional TTL relative to `now_ms`.
pub fn encode(payload: &[u8], ttl: Option<Duration>, now_ms: u64) -> Vec<u8> {
    let expires_at = match ttl {
        Some(ttl) => now_ms.saturating_add(ttl.as_millis() as u64).max(1),
        None => 0,
    };
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&expires_at.to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Decode an envelope, returning `None` if it has expired at `now_ms`.
pub fn decode<'a>(key: &str, raw: &'a [u8], now_ms: u64) -> StateResult<Option<&'a [u8]>> {
    if raw.len() < HEADER_LEN {
        return Err(StateError::Corrupt(key.to_string()));
    }
    let (header, payload) = raw.split_at(HEADER_LEN);
    let mut expiry = [0u8; HEADER_LEN];
    expiry.copy_from_slice(header);
    let expires_at = u64::from_be_bytes(expiry);
    if expires_at != 0 && expires_at <= now_ms {
        return Ok(None);
    }
    Ok(Some(payload))
}
