use std::path::{Path, PathBuf};

use crate::*;

/// A [Fetcher] which reads files under a given root directory.
///
/// This handles the rather tricky path cases around Windows and Linux differences, and makes it so that you can and
/// should use keys like `/b/c` (behavior with `\` is undefined).  Additionally, it makes a best effort to disallow a
/// user to use relative paths to escape the root directory, primarily as a measure to detect bugs.
#[derive(Debug)]
pub struct FileFetcher {
    root_path: PathBuf,
}

fn conv_path(path: &str) -> Result<relative_path::RelativePathBuf, FetchError> {
    relative_path::RelativePathBuf::from_path(path)
        .map_err(|_| FetchError::InvalidKey(path.to_string()))
}

impl FileFetcher {
    pub fn new(root_path: &Path) -> FileFetcher {
        FileFetcher {
            root_path: root_path.to_path_buf(),
        }
    }

    /// Where a key lives on disk, or an error if it points outside the root.
    pub fn resolve(&self, key: &str) -> Result<PathBuf, FetchError> {
        // `file://` URLs work too.  Everything is relative to the root, leading slash or not.
        let key = key.strip_prefix("file://").unwrap_or(key);
        let key = key.trim_start_matches('/');
        // On Windows, canonicalize is currently very broken when relative path segments appear in the middle of a
        // path, and stdlib doesn't help us out. Go via `RelativePathBuf` to clean it up.
        let absolute = conv_path(key)?.to_logical_path(&self.root_path);
        if !absolute.starts_with(&self.root_path) {
            return Err(FetchError::InvalidKey(format!(
                "{} is outside the fetcher root directory",
                key
            )));
        }
        Ok(absolute)
    }
}

impl Fetcher for FileFetcher {
    type Key = String;

    fn fetch(&self, key: &String) -> Result<Vec<u8>, FetchError> {
        let path = self.resolve(key)?;
        Ok(std::fs::read(path)?)
    }
}
