//! Paths inside the storage root.
//!
//! ```text
//! {root}/
//! ├── content/
//! │   ├── ab/cd/abcd…ef/data     deduplicated bytes, sharded by hash
//! │   └── temp/{tempId}/data     staging while an upload is hashed
//! ├── proxies/{mediaId}/
//! │   ├── proxy.mp4
//! │   └── meta.json
//! └── exports/{mediaId}/{fileName}
//! ```
//!
//! Everything except [`StorageLayout::absolute`] returns paths relative to the
//! root, which is the form the file worker accepts.

use std::path::{Path, PathBuf};

use crate::hasher::ContentHash;
use crate::storage::models::MediaId;

pub const CONTENT_DIR: &str = "content";
pub const TEMP_DIR: &str = "temp";
pub const PROXY_DIR: &str = "proxies";
pub const EXPORT_DIR: &str = "exports";
pub const DATA_FILE: &str = "data";
pub const PROXY_FILE_STEM: &str = "proxy";
pub const PROXY_META_FILE: &str = "meta.json";

#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
    proxy_extension: String,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>, proxy_extension: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            proxy_extension: proxy_extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    pub fn content_root() -> PathBuf {
        PathBuf::from(CONTENT_DIR)
    }

    /// `content/{h[0:2]}/{h[2:4]}/{h}`
    pub fn content_dir(hash: &ContentHash) -> PathBuf {
        let (first, second) = hash.shard();
        PathBuf::from(CONTENT_DIR)
            .join(first)
            .join(second)
            .join(hash.as_str())
    }

    pub fn content_path(hash: &ContentHash) -> PathBuf {
        Self::content_dir(hash).join(DATA_FILE)
    }

    pub fn temp_root() -> PathBuf {
        PathBuf::from(CONTENT_DIR).join(TEMP_DIR)
    }

    pub fn temp_dir(temp_id: &str) -> PathBuf {
        Self::temp_root().join(temp_id)
    }

    pub fn temp_path(temp_id: &str) -> PathBuf {
        Self::temp_dir(temp_id).join(DATA_FILE)
    }

    pub fn proxy_root() -> PathBuf {
        PathBuf::from(PROXY_DIR)
    }

    pub fn proxy_dir(media_id: &MediaId) -> PathBuf {
        PathBuf::from(PROXY_DIR).join(media_id.as_str())
    }

    pub fn proxy_file_name(&self) -> String {
        format!("{}.{}", PROXY_FILE_STEM, self.proxy_extension)
    }

    pub fn proxy_path(&self, media_id: &MediaId) -> PathBuf {
        Self::proxy_dir(media_id).join(self.proxy_file_name())
    }

    pub fn proxy_meta_path(media_id: &MediaId) -> PathBuf {
        Self::proxy_dir(media_id).join(PROXY_META_FILE)
    }

    pub fn export_path(media_id: &MediaId, file_name: &str) -> PathBuf {
        PathBuf::from(EXPORT_DIR)
            .join(media_id.as_str())
            .join(file_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_path_is_sharded_two_plus_two() {
        let hash = crate::hasher::hash_bytes(b"frame data");
        let path = StorageLayout::content_path(&hash);
        let hex = hash.as_str();
        let expected = PathBuf::from("content")
            .join(&hex[0..2])
            .join(&hex[2..4])
            .join(hex)
            .join("data");
        assert_eq!(path, expected);
    }

    #[test]
    fn test_proxy_paths_use_configured_extension() {
        let layout = StorageLayout::new("/vault", "webm");
        let id = MediaId::from("m-1");
        assert_eq!(
            layout.proxy_path(&id),
            PathBuf::from("proxies/m-1/proxy.webm")
        );
        assert_eq!(
            StorageLayout::proxy_meta_path(&id),
            PathBuf::from("proxies/m-1/meta.json")
        );
        assert_eq!(
            layout.absolute(&layout.proxy_path(&id)),
            PathBuf::from("/vault/proxies/m-1/proxy.webm")
        );
    }

    #[test]
    fn test_temp_path_lives_under_content() {
        assert_eq!(
            StorageLayout::temp_path("abc"),
            PathBuf::from("content/temp/abc/data")
        );
    }
}
