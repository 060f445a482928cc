//! Crate configuration and normative safety limits.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub limits: Limits,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            limits: Limits::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Block cache bounds. Permanent entries charge the byte budget but are
/// never evicted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub bytes_capacity: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            bytes_capacity: 512 * 1024 * 1024,
        }
    }
}

/// Normative defaults; values are explicit about their units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    pub max_message_bytes: usize,
    pub max_ops_per_revision: usize,
    pub max_name_len: usize,

    pub max_cbor_depth: usize,
    pub max_cbor_map_entries: usize,
    pub max_cbor_array_entries: usize,
    pub max_cbor_bytes_len: usize,
    pub max_cbor_text_len: usize,

    pub max_parallel_block_puts: usize,
    pub max_resolution_attempts: usize,

    pub max_fetch_retries: usize,
    pub fetch_retry_base_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_message_bytes: 16 * 1024 * 1024,
            max_ops_per_revision: 10_000,
            max_name_len: 255,

            max_cbor_depth: 32,
            max_cbor_map_entries: 10_000,
            max_cbor_array_entries: 10_000,
            max_cbor_bytes_len: 16 * 1024 * 1024,
            max_cbor_text_len: 64 * 1024,

            max_parallel_block_puts: 10,
            max_resolution_attempts: 10,

            max_fetch_retries: 3,
            fetch_retry_base_ms: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_defaults() {
        let limits = Limits::default();
        assert_eq!(limits.max_message_bytes, 16 * 1024 * 1024);
        assert_eq!(limits.max_ops_per_revision, 10_000);
        assert_eq!(limits.max_name_len, 255);
        assert_eq!(limits.max_cbor_depth, 32);
        assert_eq!(limits.max_cbor_map_entries, 10_000);
        assert_eq!(limits.max_cbor_array_entries, 10_000);
        assert_eq!(limits.max_cbor_bytes_len, 16 * 1024 * 1024);
        assert_eq!(limits.max_cbor_text_len, 64 * 1024);
        assert_eq!(limits.max_parallel_block_puts, 10);
        assert_eq!(limits.max_resolution_attempts, 10);
        assert_eq!(limits.max_fetch_retries, 3);
        assert_eq!(limits.fetch_retry_base_ms, 50);
    }

    #[test]
    fn cache_defaults() {
        let cache = CacheConfig::default();
        assert_eq!(cache.capacity, 10_000);
        assert_eq!(cache.bytes_capacity, 512 * 1024 * 1024);
    }
}
