//! Error types.
//!
//! Construction problems are reported as [ConfigError].  Everything that can go wrong while populating an entry is a
//! [CacheError], which is either a [FetchError] from the [crate::Fetcher] or the decode error of the
//! [crate::Asset] being built.
use std::io::Error as IoError;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cache capacity must be at least 1")]
    InvalidCapacity,
    #[error("max_concurrent_fetches must be at least 1")]
    InvalidConcurrency,
    #[error("invalid cache configuration: {0}")]
    Builder(String),
    #[error("could not start the worker pool")]
    Runtime(#[source] IoError),
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("resource unreachable")]
    Io(#[from] IoError),
    /// The resource exists but has no bytes in it, which no decoder can do anything with.
    #[error("resource is empty")]
    Empty,
    #[error("invalid resource key: {0}")]
    InvalidKey(String),
    /// Escape hatch for fetchers with their own error types, e.g. network clients.
    #[error("transport error")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError<DecodeError> {
    #[error("fetch failed")]
    Fetch(#[source] FetchError),
    #[error("decode failed")]
    Decode(#[source] DecodeError),
}

impl From<crate::FetchCacheConfigBuilderError> for ConfigError {
    fn from(e: crate::FetchCacheConfigBuilderError) -> ConfigError {
        ConfigError::Builder(e.to_string())
    }
}
