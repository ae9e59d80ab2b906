//! Package fetched content directories into a single zip archive.
//!
//! Every entry's directory tree is re-rooted under the entry's alias, so a
//! collection archive holds one top-level folder per workshop item. Empty
//! directories are kept as explicit `name/` entries.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// One directory to include in an archive, and the folder name it gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub source: PathBuf,
    pub alias: String,
}

impl ArchiveEntry {
    pub fn new(source: impl Into<PathBuf>, alias: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            alias: alias.into(),
        }
    }
}

/// What ended up in a built archive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    /// Entries whose source directory existed and were packaged.
    pub entries_written: usize,
    /// Entries skipped because their source directory was missing.
    pub entries_skipped: usize,
    pub files: usize,
    pub directories: usize,
}

/// Build a deflate-compressed archive at `target` from `entries`, in order.
///
/// Missing source directories are skipped with a warning. Any I/O error
/// during the walk aborts the build; a partially written `target` is left
/// in place for the caller to deal with.
pub fn build_archive(entries: &[ArchiveEntry], target: &Path) -> io::Result<ArchiveSummary> {
    info!(target = %target.display(), entries = entries.len(), "creating zip archive");

    let file = File::create(target)?;
    let mut zip = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();

    for entry in entries {
        if !entry.source.exists() {
            warn!(source = %entry.source.display(), alias = %entry.alias, "source path not found, skipping");
            summary.entries_skipped += 1;
            continue;
        }

        for walked in WalkDir::new(&entry.source) {
            let walked = walked?;
            let relative = walked
                .path()
                .strip_prefix(&entry.source)
                .map_err(io::Error::other)?;
            let name = entry_name(&entry.alias, relative);

            if walked.file_type().is_dir() {
                zip.add_directory(format!("{name}/"), options)
                    .map_err(io::Error::other)?;
                summary.directories += 1;
            } else {
                zip.start_file(name, options).map_err(io::Error::other)?;
                let mut source = File::open(walked.path())?;
                io::copy(&mut source, &mut zip)?;
                summary.files += 1;
            }
        }
        summary.entries_written += 1;
        debug!(alias = %entry.alias, "packaged entry");
    }

    zip.finish().map_err(io::Error::other)?;
    info!(
        target = %target.display(),
        files = summary.files,
        skipped = summary.entries_skipped,
        "zip archive created"
    );
    Ok(summary)
}

/// Archive path for `relative` under `alias`, always with `/` separators.
fn entry_name(alias: &str, relative: &Path) -> String {
    let mut name = alias.trim_end_matches('/').to_string();
    for component in relative.components() {
        name.push('/');
        name.push_str(&component.as_os_str().to_string_lossy());
    }
    name
}
