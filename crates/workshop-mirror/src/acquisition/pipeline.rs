//! Cache-checked acquisition pipeline producing downloadable archives.
//!
//! ## Flow
//!
//! 1. Resolve the title (or collection manifest) upstream.
//! 2. Derive the [`CacheKey`]; an archive already on disk is returned as is.
//! 3. Otherwise fetch through the [`AcquisitionTool`] and package the result.
//!
//! ## Single flight
//!
//! Builds run as detached tasks registered per key. A request arriving while
//! the same key is being built waits for that task to end and then finds the
//! finished archive on disk instead of starting a second build. A dropped
//! request never cancels a build; the task runs to completion and frees its
//! registry slot itself. Archives are written to `<key>.partial` and renamed
//! into place, so the key path only ever holds a complete archive.

use super::{item_alias, AcquisitionTool, CacheKey, ContentIdentifier};
use crate::archive::{build_archive, ArchiveEntry, ArchiveSummary};
use crate::config::DEFAULT_WORKERS;
use crate::error::{MirrorError, MirrorResult};
use crate::metadata::{CollectionChild, CollectionManifest, MetadataResolver};
use crate::progress::CollectionProgress;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// A built archive ready to be served.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Archive {
    pub path: PathBuf,
    /// Name offered to the client; same as the cache key.
    pub file_name: String,
    /// False when the archive was built by this call.
    pub cached: bool,
}

/// Outcome of fetching every child of a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    pub fetched: HashSet<ContentIdentifier>,
    pub failed: Vec<ContentIdentifier>,
}

/// Builds in progress. A receiver closes when its build task ends.
type Registry = DashMap<CacheKey, watch::Receiver<()>>;

pub struct AcquisitionPipeline {
    tool: Arc<dyn AcquisitionTool>,
    resolver: Arc<dyn MetadataResolver>,
    archive_dir: PathBuf,
    workers: usize,
    max_failed_children: Option<usize>,
    show_progress: bool,
    in_flight: Arc<Registry>,
}

impl AcquisitionPipeline {
    pub fn new(
        tool: Arc<dyn AcquisitionTool>,
        resolver: Arc<dyn MetadataResolver>,
        archive_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            tool,
            resolver,
            archive_dir: archive_dir.into(),
            workers: DEFAULT_WORKERS,
            max_failed_children: None,
            show_progress: false,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_max_failed_children(mut self, max: Option<usize>) -> Self {
        self.max_failed_children = max;
        self
    }

    /// Draw a progress bar on stderr while collections download.
    pub fn with_progress_bar(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Archive for a single workshop item.
    pub async fn item(&self, id: ContentIdentifier) -> MirrorResult<Archive> {
        let title = self.resolver.item_title(id.item_id).await?;
        let key = CacheKey::item(id.item_id, &title);
        let alias = item_alias(id.item_id, &title);
        let tool = Arc::clone(&self.tool);

        self.build_once(&key, move |staging| async move {
            info!(%id, "starting download");
            tool.fetch(id, true).await?;
            info!(%id, "downloaded, now zipping");
            let entries = vec![ArchiveEntry::new(tool.content_dir(id), alias)];
            package(entries, staging).await
        })
        .await
    }

    /// Archive for a whole collection, one folder per fetched child.
    pub async fn collection(&self, app_id: u64, collection_id: u64) -> MirrorResult<Archive> {
        let manifest = self.resolver.collection(app_id, collection_id).await?;
        if manifest.children.is_empty() {
            return Err(MirrorError::resolution(
                format!("collection {collection_id}"),
                "collection is empty",
            ));
        }
        let key = CacheKey::collection(collection_id, &manifest.title);
        let pool = FetchPool {
            tool: Arc::clone(&self.tool),
            workers: self.workers,
            show_progress: self.show_progress,
        };
        let max_failed_children = self.max_failed_children;

        self.build_once(&key, move |staging| async move {
            info!(
                collection_id,
                title = %manifest.title,
                items = manifest.children.len(),
                "starting collection download"
            );
            let report = pool.fetch_children(&manifest).await;

            if let Some(max) = max_failed_children {
                if report.failed.len() > max {
                    return Err(MirrorError::acquisition(
                        format!("collection {collection_id}"),
                        format!(
                            "{} of {} items failed (limit {max})",
                            report.failed.len(),
                            manifest.children.len()
                        ),
                    ));
                }
            }
            info!(
                collection_id,
                fetched = report.fetched.len(),
                failed = report.failed.len(),
                "collection items downloaded, now zipping"
            );

            let entries: Vec<ArchiveEntry> = manifest
                .children
                .iter()
                .filter(|child| report.fetched.contains(&child.id))
                .map(|child| {
                    ArchiveEntry::new(
                        pool.tool.content_dir(child.id),
                        item_alias(child.id.item_id, &child.title),
                    )
                })
                .collect();
            package(entries, staging).await
        })
        .await
    }

    /// Return the archive for `key`, running `build` at most once at a time per key.
    ///
    /// The build itself runs on a spawned task, so it finishes even if the
    /// caller is dropped midway.
    async fn build_once<F, Fut>(&self, key: &CacheKey, build: F) -> MirrorResult<Archive>
    where
        F: FnOnce(PathBuf) -> Fut,
        Fut: Future<Output = MirrorResult<ArchiveSummary>> + Send + 'static,
    {
        let path = key.path_in(&self.archive_dir);
        let slot = loop {
            if is_built(&path).await {
                return Ok(self.archive(key, path, true));
            }
            let mut running = match self.in_flight.entry(key.clone()) {
                Entry::Occupied(entry) => entry.get().clone(),
                Entry::Vacant(entry) => {
                    let (done, running) = watch::channel(());
                    entry.insert(running);
                    break Slot {
                        registry: Arc::clone(&self.in_flight),
                        key: key.clone(),
                        _done: done,
                    };
                }
            };
            debug!(archive = %key, "waiting for build in progress");
            // Resolves once the build task drops its slot.
            let _ = running.changed().await;
        };

        let staging = self.archive_dir.join(format!("{key}.partial"));
        let work = build(staging.clone());
        let target = path.clone();
        let name = key.clone();
        let task = tokio::spawn(async move {
            let _slot = slot;
            // Finished between our disk check and taking the slot.
            if is_built(&target).await {
                return Ok(None);
            }
            let built = match work.await {
                Ok(summary) => tokio::fs::rename(&staging, &target)
                    .await
                    .map(|()| summary)
                    .map_err(MirrorError::from),
                Err(e) => Err(e),
            };
            match built {
                Ok(summary) => {
                    info!(archive = %name, files = summary.files, "zipped successfully");
                    Ok(Some(summary))
                }
                Err(e) => {
                    let _ = tokio::fs::remove_file(&staging).await;
                    Err(e)
                }
            }
        });

        match task.await {
            Ok(Ok(built)) => Ok(self.archive(key, path, built.is_none())),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(MirrorError::from(std::io::Error::other(e))),
        }
    }

    fn archive(&self, key: &CacheKey, path: PathBuf, cached: bool) -> Archive {
        Archive {
            path,
            file_name: key.file_name().to_string(),
            cached,
        }
    }
}

/// Registry entry held by a running build; frees its key when dropped.
struct Slot {
    registry: Arc<Registry>,
    key: CacheKey,
    _done: watch::Sender<()>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Removed before the sender closes, so woken waiters never see a stale entry.
        self.registry.remove(&self.key);
    }
}

/// What a collection build needs to fetch children without borrowing the pipeline.
struct FetchPool {
    tool: Arc<dyn AcquisitionTool>,
    workers: usize,
    show_progress: bool,
}

impl FetchPool {
    /// Fetch every child through a fixed pool of workers sharing one queue.
    ///
    /// A failed child is logged and skipped; it never stops the others.
    async fn fetch_children(&self, manifest: &CollectionManifest) -> FetchReport {
        let total = manifest.children.len();
        let progress = if self.show_progress {
            CollectionProgress::new("Downloading collection items", total as u64)
        } else {
            CollectionProgress::hidden(total as u64)
        };

        let (tx, rx) = mpsc::channel::<CollectionChild>(total.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = JoinSet::new();

        for _ in 0..self.workers.min(total.max(1)) {
            let rx = Arc::clone(&rx);
            let tool = Arc::clone(&self.tool);
            let progress = progress.clone();
            workers.spawn(async move {
                let mut report = FetchReport::default();
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(child) = next else { break };
                    match tool.fetch(child.id, false).await {
                        Ok(()) => {
                            report.fetched.insert(child.id);
                        }
                        Err(e) => {
                            warn!(
                                id = %child.id,
                                title = %child.title,
                                error = %e,
                                "failed to download item, skipping"
                            );
                            report.failed.push(child.id);
                        }
                    }
                    progress.advance();
                }
                report
            });
        }

        for child in &manifest.children {
            if tx.send(child.clone()).await.is_err() {
                break;
            }
        }
        drop(tx);

        let mut report = FetchReport::default();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(part) => {
                    report.fetched.extend(part.fetched);
                    report.failed.extend(part.failed);
                }
                Err(e) => warn!(error = %e, "collection worker panicked"),
            }
        }
        progress.finish();
        report
    }
}

async fn is_built(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Run the blocking archive build off the async workers.
async fn package(entries: Vec<ArchiveEntry>, target: PathBuf) -> MirrorResult<ArchiveSummary> {
    tokio::task::spawn_blocking(move || build_archive(&entries, &target))
        .await
        .map_err(std::io::Error::other)?
        .map_err(MirrorError::from)
}
