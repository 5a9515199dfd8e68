//! The [Fetcher] trait is responsible for turning keys into raw bytes, and the [Asset] trait for turning those bytes
//! into something worth caching.
//!
//! The cache stores decoded assets only; bytes are read, decoded and dropped.
use std::fmt::Debug;
use std::hash::Hash;
use std::string::FromUtf8Error;

use crate::FetchError;

/// Load the bytes behind a resource identifier.
///
/// Fetchers are called from worker threads and may block for as long as they need to.
pub trait Fetcher: Send + Sync + 'static {
    type Key: Hash + Eq + Clone + Debug + Send + Sync + 'static;

    /// Read the whole resource.
    fn fetch(&self, key: &Self::Key) -> Result<Vec<u8>, FetchError>;
}

/// Something which can be decoded from, and encoded back to, a byte buffer.
///
/// The output type must be sync in order to enable the cache to store elements behind `Arc`.
pub trait Asset: Sized + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decode a complete buffer.  Must fail rather than return a partially valid value.
    fn decode(bytes: &[u8]) -> Result<Self, Self::Error>;

    /// The inverse of [Asset::decode].  The cache itself never calls this.
    fn encode(&self) -> Vec<u8>;
}

impl Asset for Vec<u8> {
    type Error = std::convert::Infallible;

    fn decode(bytes: &[u8]) -> Result<Vec<u8>, Self::Error> {
        Ok(bytes.to_vec())
    }

    fn encode(&self) -> Vec<u8> {
        self.clone()
    }
}

impl Asset for String {
    type Error = FromUtf8Error;

    fn decode(bytes: &[u8]) -> Result<String, FromUtf8Error> {
        String::from_utf8(bytes.to_vec())
    }

    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_asset() {
        let s = String::decode(b"hello").unwrap();
        assert_eq!(s, "hello");
        assert_eq!(s.encode(), b"hello".to_vec());

        // Invalid utf-8 must be an error, not a lossy conversion.
        assert!(String::decode(&[0xff, 0xfe, 0x00]).is_err());
    }

    #[test]
    fn test_bytes_asset() {
        let bytes = vec![0u8, 1, 2, 255];
        let decoded = Vec::<u8>::decode(&bytes).unwrap();
        assert_eq!(decoded.encode(), bytes);
    }
}
