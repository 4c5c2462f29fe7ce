//! Encoded page sources
//!
//! An [`ImageSource`] is the immutable handle to an encoded page. It is cheap
//! to clone so every decode job can carry its own copy.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Encoded image bytes held in memory or referenced on disk
#[derive(Clone)]
pub enum ImageSource {
    /// Encoded bytes already resident in memory
    Memory(Arc<[u8]>),

    /// Path to an encoded file
    File(PathBuf),
}

impl ImageSource {
    /// Wrap an in-memory buffer
    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        ImageSource::Memory(bytes.into())
    }

    /// Reference a file on disk
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        ImageSource::File(path.as_ref().to_path_buf())
    }

    /// Human readable description used in log lines
    pub fn describe(&self) -> String {
        match self {
            ImageSource::Memory(bytes) => format!("<{} bytes in memory>", bytes.len()),
            ImageSource::File(path) => path.display().to_string(),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            ImageSource::File(path) => f.debug_tuple("File").field(path).finish(),
        }
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Memory(bytes.into())
    }
}

impl From<PathBuf> for ImageSource {
    fn from(path: PathBuf) -> Self {
        ImageSource::File(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_bytes() {
        let source = ImageSource::from_bytes(vec![1u8, 2, 3]);
        let clone = source.clone();
        match (&source, &clone) {
            (ImageSource::Memory(a), ImageSource::Memory(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected memory sources"),
        }
    }

    #[test]
    fn test_describe() {
        assert_eq!(ImageSource::from(vec![0u8; 16]).describe(), "<16 bytes in memory>");
        assert_eq!(ImageSource::from_path("/tmp/page.png").describe(), "/tmp/page.png");
    }
}
