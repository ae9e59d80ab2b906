//! Workshop mirror library: a rewriting proxy for the Steam Workshop that
//! serves workshop items and collections as downloadable zip archives.
//!
//! This library crate exposes the core modules for integration testing.

pub mod acquisition;
pub mod archive;
pub mod config;
pub mod error;
pub mod metadata;
pub mod progress;
pub mod proxy;
pub mod rest;
pub mod sanitize;

pub use error::MirrorError;
