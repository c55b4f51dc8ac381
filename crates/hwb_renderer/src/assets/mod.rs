//! Asset access
//!
//! The renderer never opens files directly; shader blobs and other read-only
//! data come through an [`AssetSource`]. On device this wraps the APK asset
//! manager, on the host a plain directory works.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Asset loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// The asset does not exist in this source
    #[error("Asset not found: {0}")]
    NotFound(String),

    /// The asset exists but could not be read
    #[error("Failed to read asset {path}: {source}")]
    Io {
        /// Asset path as requested
        path: String,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The asset content is unusable
    #[error("Invalid asset {path}: {reason}")]
    Invalid {
        /// Asset path as requested
        path: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Read-only provider of named assets
pub trait AssetSource: Send + Sync {
    /// Read the full contents of an asset
    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError>;
}

/// Assets rooted at a directory on disk
#[derive(Debug, Clone)]
pub struct DirectoryAssetSource {
    root: PathBuf,
}

impl DirectoryAssetSource {
    /// Create a source rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl AssetSource for DirectoryAssetSource {
    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        let full_path = self.root.join(path);
        std::fs::read(&full_path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AssetError::NotFound(path.to_string())
            } else {
                AssetError::Io { path: path.to_string(), source }
            }
        })
    }
}

/// Assets held in memory, keyed by path
#[derive(Debug, Clone, Default)]
pub struct MemoryAssetSource {
    assets: HashMap<String, Vec<u8>>,
}

impl MemoryAssetSource {
    /// Create an empty source
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an asset
    pub fn with_asset(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.assets.insert(path.into(), bytes.into());
        self
    }
}

impl AssetSource for MemoryAssetSource {
    fn read(&self, path: &str) -> Result<Vec<u8>, AssetError> {
        self.assets
            .get(path)
            .cloned()
            .ok_or_else(|| AssetError::NotFound(path.to_string()))
    }
}

/// SPIR-V magic number, little-endian
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Decode a SPIR-V blob into 32-bit words
///
/// Rejects blobs whose length is not a multiple of four or whose first word is
/// not the SPIR-V magic number.
pub fn spirv_words(path: &str, bytes: &[u8]) -> Result<Vec<u32>, AssetError> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(AssetError::Invalid {
            path: path.to_string(),
            reason: format!("length {} is not a multiple of 4", bytes.len()),
        });
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(AssetError::Invalid {
            path: path.to_string(),
            reason: format!("bad magic {:#010x}", words[0]),
        });
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_source_lookup() {
        let source = MemoryAssetSource::new().with_asset("shaders/a.spv", vec![1, 2, 3]);
        assert_eq!(source.read("shaders/a.spv").unwrap(), vec![1, 2, 3]);
        assert!(matches!(source.read("shaders/b.spv"), Err(AssetError::NotFound(_))));
    }

    #[test]
    fn test_directory_source_missing_file() {
        let source = DirectoryAssetSource::new(std::env::temp_dir().join("hwb-renderer-no-such-dir"));
        assert!(matches!(source.read("shader.spv"), Err(AssetError::NotFound(_))));
    }

    #[test]
    fn test_spirv_words() {
        let mut blob = SPIRV_MAGIC.to_le_bytes().to_vec();
        blob.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        assert_eq!(spirv_words("ok.spv", &blob).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000]);

        assert!(spirv_words("short.spv", &blob[..6]).is_err());
        assert!(spirv_words("empty.spv", &[]).is_err());
        assert!(spirv_words("magic.spv", &[0, 0, 0, 0]).is_err());
    }
}
