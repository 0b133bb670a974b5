//! Heap configuration parameters.

use std::{env, str::FromStr};

use crate::{
    block::{BLOCK_HEADER_SIZE, MIN_RESIDUAL},
    error::{HeapError, Result},
    free_index::DEFAULT_INDEX_CAPACITY,
    utils::ALIGNMENT,
};

/// Environment variable overriding [`HeapConfig::region_size`].
pub const REGION_SIZE_ENV: &str = "BLOCKHEAP_REGION_SIZE";
/// Environment variable overriding [`HeapConfig::index_capacity`].
pub const INDEX_CAPACITY_ENV: &str = "BLOCKHEAP_INDEX_CAPACITY";
/// Environment variable overriding [`HeapConfig::bootstrap`].
pub const BOOTSTRAP_ENV: &str = "BLOCKHEAP_BOOTSTRAP";

/// What to do after the memory provider refused to reserve the region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootstrapPolicy {
    /// Ask the provider again on every later request.
    #[default]
    Retry,
    /// Fail every later request without asking the provider again.
    FailFast,
}

impl FromStr for BootstrapPolicy {
    type Err = HeapError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "fail-fast" | "failfast" => Ok(Self::FailFast),
            other => Err(HeapError::InvalidConfig {
                reason: format!("unknown bootstrap policy `{other}`"),
            }),
        }
    }
}

/// Configuration for a [`crate::Heap`].
///
/// Validated when the heap is built; immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Bytes reserved from the provider on the first allocation.
    ///
    /// Default: 1 MiB. Must be a multiple of 8 and hold at least one block
    /// header plus the minimum payload.
    pub region_size: usize,

    /// Maximum number of entries in the free index.
    ///
    /// Default: 1024. Free blocks beyond this are kept aside until the index
    /// has room again.
    pub index_capacity: usize,

    pub bootstrap: BootstrapPolicy,
}

impl HeapConfig {
    /// Default region size: 1 MiB.
    pub const DEFAULT_REGION_SIZE: usize = 1024 * 1024;

    /// Default free index capacity.
    pub const DEFAULT_INDEX_CAPACITY: usize = DEFAULT_INDEX_CAPACITY;

    pub fn new() -> Self {
        Self {
            region_size: Self::DEFAULT_REGION_SIZE,
            index_capacity: Self::DEFAULT_INDEX_CAPACITY,
            bootstrap: BootstrapPolicy::default(),
        }
    }

    pub fn with_region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }

    pub fn with_index_capacity(mut self, index_capacity: usize) -> Self {
        self.index_capacity = index_capacity;
        self
    }

    pub fn with_bootstrap(mut self, bootstrap: BootstrapPolicy) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    /// Defaults overlaid with whatever is set in the environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Defaults overlaid with the values `lookup` finds for the
    /// `BLOCKHEAP_*` keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::new();

        if let Some(value) = lookup(REGION_SIZE_ENV) {
            config.region_size = parse_size(REGION_SIZE_ENV, &value)?;
        }
        if let Some(value) = lookup(INDEX_CAPACITY_ENV) {
            config.index_capacity = parse_size(INDEX_CAPACITY_ENV, &value)?;
        }
        if let Some(value) = lookup(BOOTSTRAP_ENV) {
            config.bootstrap = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.region_size % ALIGNMENT != 0 {
            return Err(HeapError::InvalidConfig {
                reason: format!("region size {} is not a multiple of {ALIGNMENT}", self.region_size),
            });
        }
        if self.region_size < BLOCK_HEADER_SIZE + MIN_RESIDUAL {
            return Err(HeapError::InvalidConfig {
                reason: format!(
                    "region size {} can't hold a single block (minimum {})",
                    self.region_size,
                    BLOCK_HEADER_SIZE + MIN_RESIDUAL
                ),
            });
        }
        if self.index_capacity == 0 {
            return Err(HeapError::InvalidConfig {
                reason: "free index capacity must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_size(key: &str, value: &str) -> Result<usize> {
    value.trim().replace('_', "").parse().map_err(|_| HeapError::InvalidConfig {
        reason: format!("{key}=`{value}` is not a byte count"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn default_region_is_one_mib() {
        let config = HeapConfig::default();

        assert_eq!(config.region_size, 1024 * 1024);
        assert_eq!(config.index_capacity, 1024);
        assert_eq!(config.bootstrap, BootstrapPolicy::Retry);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = HeapConfig::from_lookup(lookup(&[
            (REGION_SIZE_ENV, "65_536"),
            (INDEX_CAPACITY_ENV, "16"),
            (BOOTSTRAP_ENV, "fail-fast"),
        ]))
        .unwrap();

        assert_eq!(config.region_size, 65536);
        assert_eq!(config.index_capacity, 16);
        assert_eq!(config.bootstrap, BootstrapPolicy::FailFast);
    }

    #[test]
    fn empty_lookup_is_default() {
        let config = HeapConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config, HeapConfig::default());
    }

    #[test]
    fn rejects_garbage() {
        let result = HeapConfig::from_lookup(lookup(&[(REGION_SIZE_ENV, "lots")]));
        assert!(matches!(result, Err(HeapError::InvalidConfig { .. })));

        let result = HeapConfig::from_lookup(lookup(&[(BOOTSTRAP_ENV, "sometimes")]));
        assert!(matches!(result, Err(HeapError::InvalidConfig { .. })));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let unaligned = HeapConfig::new().with_region_size(4097);
        let tiny = HeapConfig::new().with_region_size(BLOCK_HEADER_SIZE);
        let no_index = HeapConfig::new().with_index_capacity(0);

        for config in [unaligned, tiny, no_index] {
            assert!(matches!(config.validate(), Err(HeapError::InvalidConfig { .. })));
        }

        let smallest = HeapConfig::new().with_region_size(BLOCK_HEADER_SIZE + MIN_RESIDUAL);
        assert!(smallest.validate().is_ok());
    }
}
