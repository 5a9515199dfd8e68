use crate::ConfigError;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

#[derive(Clone, Debug, derive_builder::Builder)]
pub struct FetchCacheConfig {
    /// Maximum number of decoded entries kept in memory.
    #[builder(default = "DEFAULT_CAPACITY")]
    pub capacity: usize,
    /// Maximum number of fetch+decode tasks running at the same time.
    #[builder(default = "DEFAULT_MAX_CONCURRENT_FETCHES")]
    pub max_concurrent_fetches: usize,
    /// If set, a miss for a key which is already being fetched joins that fetch instead of starting another one.
    #[builder(default = "false")]
    pub dedupe_in_flight: bool,
    /// Prefix for the names of the worker threads.
    #[builder(default = "\"fetch-cache\".to_string()", setter(into))]
    pub pool_name: String,
}

impl FetchCacheConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }
        Ok(())
    }
}

impl Default for FetchCacheConfig {
    fn default() -> FetchCacheConfig {
        FetchCacheConfig {
            capacity: DEFAULT_CAPACITY,
            max_concurrent_fetches: DEFAULT_MAX_CONCURRENT_FETCHES,
            dedupe_in_flight: false,
            pool_name: "fetch-cache".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let cfg = FetchCacheConfigBuilder::default()
            .build()
            .expect("Should build");
        assert_eq!(cfg.capacity, 100);
        assert_eq!(cfg.max_concurrent_fetches, 10);
        assert!(!cfg.dedupe_in_flight);
        assert_eq!(cfg.pool_name, "fetch-cache");
        cfg.validate().expect("Defaults are valid");
    }

    #[test]
    fn test_validate() {
        let cfg = FetchCacheConfigBuilder::default()
            .capacity(0)
            .build()
            .expect("Should build");
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidCapacity)));

        let cfg = FetchCacheConfig {
            max_concurrent_fetches: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidConcurrency)
        ));
    }
}
