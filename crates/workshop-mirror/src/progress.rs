//! Shared progress counter for collection downloads.
//!
//! Every worker holds a clone; the counter advances once per child whether
//! it was fetched or skipped. Progress is drawn as an `indicatif` bar on
//! stderr, which hides itself when stderr is not a terminal.

use indicatif::{ProgressBar, ProgressStyle};

#[derive(Clone)]
pub struct CollectionProgress {
    bar: ProgressBar,
}

impl CollectionProgress {
    pub fn new(label: &str, total: u64) -> Self {
        let bar = ProgressBar::new(total);
        if let Ok(style) =
            ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len} ({elapsed})")
        {
            bar.set_style(style.progress_chars("=> "));
        }
        bar.set_message(label.to_string());
        Self { bar }
    }

    /// A counter that never draws.
    pub fn hidden(total: u64) -> Self {
        let bar = ProgressBar::hidden();
        bar.set_length(total);
        Self { bar }
    }

    /// One child done, fetched or skipped.
    pub fn advance(&self) {
        self.bar.inc(1);
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
