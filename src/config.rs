use std::str::FromStr;

use tracing::warn;

pub const ENV_CHUNK_SIZE: &str = "BUPVIEW_CHUNK_SIZE";
pub const ENV_OBJECT_CACHE: &str = "BUPVIEW_OBJECT_CACHE";
pub const ENV_SYMLINK_DEPTH: &str = "BUPVIEW_SYMLINK_DEPTH";

/// Detail level used when a request carries no `details` value.
pub const DEFAULT_DETAILS: i32 = 2;

/// Tunables for the protocol worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveConfig {
    /// Upper bound for a single data chunk sent to the client.
    pub read_chunk_size: usize,
    /// Number of decoded objects kept in the LRU cache.
    pub object_cache_capacity: usize,
    /// Longest symlink chain followed before giving up.
    pub max_symlink_depth: usize,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        SlaveConfig {
            read_chunk_size: 64 * 1024,
            object_cache_capacity: 256,
            max_symlink_depth: 16,
        }
    }
}

impl SlaveConfig {
    /// Defaults overridden by `BUPVIEW_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SlaveConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = SlaveConfig::default();
        SlaveConfig {
            read_chunk_size: positive(&lookup, ENV_CHUNK_SIZE, defaults.read_chunk_size),
            object_cache_capacity: positive(&lookup, ENV_OBJECT_CACHE, defaults.object_cache_capacity),
            max_symlink_depth: positive(&lookup, ENV_SYMLINK_DEPTH, defaults.max_symlink_depth),
        }
    }
}

fn positive<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warn!("ignoring invalid {}={:?}, using {}", key, raw, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SlaveConfig::from_lookup(lookup(&[]));
        assert_eq!(config, SlaveConfig::default());
        assert_eq!(config.read_chunk_size, 65536);
    }

    #[test]
    fn test_overrides() {
        let config = SlaveConfig::from_lookup(lookup(&[
            (ENV_CHUNK_SIZE, "4096"),
            (ENV_OBJECT_CACHE, " 32 "),
            (ENV_SYMLINK_DEPTH, "4"),
        ]));
        assert_eq!(config.read_chunk_size, 4096);
        assert_eq!(config.object_cache_capacity, 32);
        assert_eq!(config.max_symlink_depth, 4);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = SlaveConfig::from_lookup(lookup(&[
            (ENV_CHUNK_SIZE, "0"),
            (ENV_OBJECT_CACHE, "lots"),
            (ENV_SYMLINK_DEPTH, "-1"),
        ]));
        assert_eq!(config, SlaveConfig::default());
    }
}
