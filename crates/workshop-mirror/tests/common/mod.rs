//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use workshop_mirror::acquisition::{AcquisitionTool, ContentIdentifier};
use workshop_mirror::error::{MirrorError, MirrorResult};
use workshop_mirror::metadata::{CollectionChild, CollectionManifest, MetadataResolver};

/// Acquisition tool that writes a small file tree per item.
pub struct FakeTool {
    root: PathBuf,
    failing: HashSet<u64>,
    delay: Duration,
    calls: AtomicUsize,
    running: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<(ContentIdentifier, bool)>>,
}

impl FakeTool {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn failing(mut self, ids: &[u64]) -> Self {
        self.failing.extend(ids);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most fetches observed running at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Every fetch with its validate flag, in call order.
    pub fn log(&self) -> Vec<(ContentIdentifier, bool)> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl AcquisitionTool for FakeTool {
    async fn fetch(&self, id: ContentIdentifier, validate: bool) -> MirrorResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().unwrap().push((id, validate));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.failing.contains(&id.item_id) {
            return Err(MirrorError::acquisition(
                format!("workshop item {}", id.item_id),
                "exit status 8 after retry",
            ));
        }
        let dir = self.content_dir(id);
        std::fs::create_dir_all(dir.join("nested"))?;
        std::fs::create_dir_all(dir.join("empty"))?;
        std::fs::write(dir.join(format!("{}.txt", id.item_id)), id.to_string())?;
        std::fs::write(dir.join("nested").join("readme.txt"), "hello")?;
        Ok(())
    }

    fn content_dir(&self, id: ContentIdentifier) -> PathBuf {
        self.root
            .join(id.app_id.to_string())
            .join(id.item_id.to_string())
    }
}

/// Metadata resolver backed by fixed tables.
#[derive(Default)]
pub struct FakeResolver {
    titles: HashMap<u64, String>,
    collections: HashMap<u64, (String, Vec<(u64, String)>)>,
}

impl FakeResolver {
    pub fn with_item(mut self, id: u64, title: &str) -> Self {
        self.titles.insert(id, title.to_string());
        self
    }

    pub fn with_collection(mut self, id: u64, title: &str, children: &[(u64, &str)]) -> Self {
        let children = children.iter().map(|(c, t)| (*c, t.to_string())).collect();
        self.collections.insert(id, (title.to_string(), children));
        self
    }
}

#[async_trait]
impl MetadataResolver for FakeResolver {
    async fn item_title(&self, item_id: u64) -> MirrorResult<String> {
        self.titles.get(&item_id).cloned().ok_or_else(|| {
            MirrorError::resolution(format!("workshop item {item_id}"), "page has no item title")
        })
    }

    async fn collection(
        &self,
        app_id: u64,
        collection_id: u64,
    ) -> MirrorResult<CollectionManifest> {
        let (title, children) = self.collections.get(&collection_id).ok_or_else(|| {
            MirrorError::resolution(format!("collection {collection_id}"), "not found")
        })?;
        Ok(CollectionManifest {
            title: title.clone(),
            children: children
                .iter()
                .map(|(id, title)| CollectionChild {
                    id: ContentIdentifier::new(app_id, *id),
                    title: title.clone(),
                })
                .collect(),
        })
    }
}

/// Entry names of a zip archive, in archive order.
pub fn zip_names(path: &Path) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| archive.by_index(i).unwrap().name().to_string())
        .collect()
}

/// File names directly inside `dir`.
pub fn dir_listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
