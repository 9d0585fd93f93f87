//! Cache entries and their compact wire encoding.
//!
//! An entry is stored as a single blob: a one-byte marker followed by a JSON
//! envelope. Envelopes larger than the compression threshold are
//! zlib-compressed; reads detect the marker and decompress transparently.

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{MuninnError, Result};

const MARKER_PLAIN: u8 = b'j';
const MARKER_ZLIB: u8 = b'z';

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "v")]
    pub value: Value,
    #[serde(rename = "at")]
    pub stored_at: DateTime<Utc>,
    #[serde(rename = "ttl", with = "duration_millis")]
    pub ttl: Duration,
    #[serde(rename = "tags", default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl CacheEntry {
    /// Create an entry stamped with the current time.
    pub fn new(value: Value, ttl: Duration, tags: BTreeSet<String>) -> Self {
        Self {
            value,
            stored_at: Utc::now(),
            ttl,
            tags,
        }
    }

    /// Time elapsed since the entry was stored.
    pub fn age(&self) -> Duration {
        self.age_at(Utc::now())
    }

    /// Age relative to `now`. Clock skew that puts `stored_at` in the
    /// future yields zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.stored_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the entry has outlived its TTL.
    pub fn is_stale(&self) -> bool {
        self.is_stale_at(Utc::now())
    }

    pub fn is_stale_at(&self, now: DateTime<Utc>) -> bool {
        self.age_at(now) > self.ttl
    }

    /// Fraction of the TTL already consumed (may exceed 1.0 once stale).
    pub fn ttl_fraction_elapsed(&self) -> f64 {
        if self.ttl.is_zero() {
            return f64::INFINITY;
        }
        self.age().as_secs_f64() / self.ttl.as_secs_f64()
    }

    /// Encode for storage, compressing above `compression_threshold` bytes.
    pub fn encode(&self, compression_threshold: usize) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        if json.len() <= compression_threshold {
            let mut out = Vec::with_capacity(json.len() + 1);
            out.push(MARKER_PLAIN);
            out.extend_from_slice(&json);
            return Ok(out);
        }

        let mut encoder = ZlibEncoder::new(vec![MARKER_ZLIB], Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| MuninnError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| MuninnError::Compression(e.to_string()))
    }

    /// Decode a blob produced by [`encode`](Self::encode).
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.split_first() {
            Some((&MARKER_PLAIN, json)) => Ok(serde_json::from_slice(json)?),
            Some((&MARKER_ZLIB, compressed)) => {
                let mut json = Vec::new();
                ZlibDecoder::new(compressed)
                    .read_to_end(&mut json)
                    .map_err(|e| MuninnError::Compression(e.to_string()))?;
                Ok(serde_json::from_slice(&json)?)
            }
            Some((marker, _)) => Err(MuninnError::Compression(format!(
                "unknown entry marker 0x{marker:02x}"
            ))),
            None => Err(MuninnError::Compression("empty entry".to_string())),
        }
    }

    /// Whether an encoded blob is compressed.
    pub fn is_compressed(bytes: &[u8]) -> bool {
        bytes.first() == Some(&MARKER_ZLIB)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(value: Value) -> CacheEntry {
        CacheEntry::new(value, Duration::from_secs(60), BTreeSet::new())
    }

    #[test]
    fn small_entries_stay_plain() {
        let e = entry(json!({"price": 0.0104}));
        let bytes = e.encode(1024).unwrap();
        assert!(!CacheEntry::is_compressed(&bytes));
        assert_eq!(CacheEntry::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn large_entries_are_compressed_and_restored() {
        let items: Vec<Value> = (0..200)
            .map(|i| json!({"name": format!("m5.{i}xlarge"), "price": 0.192}))
            .collect();
        let mut tags = BTreeSet::new();
        tags.insert("provider:aws".to_string());
        let e = CacheEntry::new(json!({ "services": items }), Duration::from_secs(1800), tags);

        let bytes = e.encode(1024).unwrap();
        assert!(CacheEntry::is_compressed(&bytes));
        let plain_len = serde_json::to_vec(&e).unwrap().len();
        assert!(bytes.len() < plain_len);
        assert_eq!(CacheEntry::decode(&bytes).unwrap(), e);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(CacheEntry::decode(b"").is_err());
        assert!(CacheEntry::decode(b"xnot-an-entry").is_err());
        assert!(CacheEntry::decode(b"j{broken").is_err());
    }

    #[test]
    fn staleness_follows_ttl() {
        let mut e = entry(json!(1));
        let now = Utc::now();
        e.stored_at = now - chrono::Duration::seconds(30);
        assert!(!e.is_stale_at(now));
        e.stored_at = now - chrono::Duration::seconds(61);
        assert!(e.is_stale_at(now));
    }

    #[test]
    fn ttl_fraction_tracks_age() {
        let mut e = entry(json!(1));
        e.stored_at = Utc::now() - chrono::Duration::seconds(45);
        let fraction = e.ttl_fraction_elapsed();
        assert!((0.74..0.8).contains(&fraction), "{fraction}");

        e.ttl = Duration::ZERO;
        assert!(e.ttl_fraction_elapsed().is_infinite());
    }

    #[test]
    fn future_timestamp_means_zero_age() {
        let mut e = entry(json!(1));
        e.stored_at = Utc::now() + chrono::Duration::seconds(10);
        assert_eq!(e.age(), Duration::ZERO);
    }
}
