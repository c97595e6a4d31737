//! Binary codec for shard keys and values.
//!
//! A shard key is a logical composite of the metric short code and the
//! timestamp the measurement belongs to. The composite must order the same
//! way the timestamps do: for a fixed metric, byte-wise comparison of two
//! keys must equal numeric comparison of their timestamps, which is why the
//! timestamp suffix is big-endian. The construction must also be reversible,
//! since the timestamp is only stored as part of the key.

use crate::error::{StorageError, StorageResult};

/// Reserved key under which every shard records its serialization scheme.
pub const SCHEME_MAGIC_ID: &str = "__l3xedfRCTNUI7EFuFIw2CyffG7ggL7h8RE1VtBOrCvVvpdCORvCIRfSc49Zr";
/// Marker for the value encoding below: a single little-endian float64.
pub const SERIALIZATION_TECHNIQUE: &str = "struct pack <d";

pub const SHORT_CODE_LEN: usize = 16;
pub const KEY_LEN: usize = 24;

/// Encode a measurement for the KV store.
pub fn encode_value(x: f64) -> [u8; 8] {
    x.to_le_bytes()
}

/// Decode a measurement read back from the KV store.
pub fn decode_value(b: &[u8]) -> StorageResult<f64> {
    let raw: [u8; 8] = b.try_into().map_err(|_| StorageError::BadValueLength(b.len()))?;
    Ok(f64::from_le_bytes(raw))
}

/// Compose the 24-byte shard key: `short_code(16) || timestamp_be(8)`.
pub fn encode_key(short_code: &[u8], ts: u64) -> StorageResult<[u8; KEY_LEN]> {
    if short_code.len() != SHORT_CODE_LEN {
        return Err(StorageError::BadShortCodeLength(short_code.len()));
    }
    let mut key = [0u8; KEY_LEN];
    key[..SHORT_CODE_LEN].copy_from_slice(short_code);
    key[SHORT_CODE_LEN..].copy_from_slice(&ts.to_be_bytes());
    Ok(key)
}

/// Read the timestamp back out of a full shard key.
pub fn extract_ts(key: &[u8]) -> StorageResult<u64> {
    if key.len() != KEY_LEN {
        return Err(StorageError::BadKeyLength(key.len()));
    }
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&key[SHORT_CODE_LEN..]);
    Ok(u64::from_be_bytes(raw))
}

/// Round a timestamp down to the nearest multiple of `step`.
pub fn round(ts: u64, step: u32) -> u64 {
    ts / step as u64 * step as u64
}

/// Fixed-length stand-in for a metric name.
///
/// Metric names are not stored verbatim in shard keys; the MD5 digest of the
/// UTF-8 bytes gives a 16-byte representation that keeps keys short and
/// uniform.
pub fn short_code(name: &[u8]) -> [u8; SHORT_CODE_LEN] {
    md5::compute(name).0
}
