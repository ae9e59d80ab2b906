//! Content acquisition: identifiers, cache keys, and the external downloader.
//!
//! Defines the `AcquisitionTool` trait that abstracts over the process that
//! actually fetches workshop content (SteamCMD in production, fakes in tests).

pub mod pipeline;
pub mod steamcmd;

use crate::error::MirrorResult;
use crate::sanitize::sanitize_file_name;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

/// A fetchable piece of workshop content: the game it belongs to and the item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentIdentifier {
    pub app_id: u64,
    pub item_id: u64,
}

impl ContentIdentifier {
    pub fn new(app_id: u64, item_id: u64) -> Self {
        Self { app_id, item_id }
    }
}

impl fmt::Display for ContentIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.app_id, self.item_id)
    }
}

/// File name of a built archive. The file existing on disk is the cache hit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `{id}_{title}.zip`
    pub fn item(item_id: u64, title: &str) -> Self {
        Self(format!("{item_id}_{}.zip", sanitize_file_name(title)))
    }

    /// `{id}_{title}_collection.zip`
    pub fn collection(collection_id: u64, title: &str) -> Self {
        Self(format!(
            "{collection_id}_{}_collection.zip",
            sanitize_file_name(title)
        ))
    }

    pub fn file_name(&self) -> &str {
        &self.0
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(&self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Folder name a workshop item gets inside an archive.
pub fn item_alias(item_id: u64, title: &str) -> String {
    format!("{item_id}_{}", sanitize_file_name(title))
}

/// An external process that downloads workshop content to local disk.
#[async_trait]
pub trait AcquisitionTool: Send + Sync {
    /// Fetch one item. `validate` asks the tool to verify existing files,
    /// which is slower.
    async fn fetch(&self, id: ContentIdentifier, validate: bool) -> MirrorResult<()>;

    /// Directory the tool leaves the item's files in after a successful fetch.
    fn content_dir(&self, id: ContentIdentifier) -> PathBuf;
}
