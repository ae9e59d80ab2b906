//! Startup configuration, consumed once at launch.

use std::fmt;
use std::path::PathBuf;
use url::Url;

/// Default upstream origin that is mirrored.
pub const DEFAULT_UPSTREAM: &str = "https://steamcommunity.com";

/// Default size of the collection worker pool.
pub const DEFAULT_WORKERS: usize = 5;

/// Steam account used instead of anonymous login.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    /// Credentials are only used when a username is given.
    pub fn from_parts(username: Option<String>, password: Option<String>) -> Option<Self> {
        let username = username.filter(|u| !u.trim().is_empty())?;
        Some(Self {
            username,
            password: password.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SteamCMD install directory; also its working directory.
    pub steamcmd_dir: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub credentials: Option<Credentials>,
    pub debug: bool,
    /// Concurrent SteamCMD invocations per collection request.
    pub workers: usize,
    /// Fail a collection when more than this many children fail. `None` never fails.
    pub max_failed_children: Option<usize>,
    pub upstream: Url,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            steamcmd_dir: PathBuf::from("steamcmd"),
            listen_host: "0.0.0.0".to_string(),
            listen_port: 8080,
            credentials: None,
            debug: false,
            workers: DEFAULT_WORKERS,
            max_failed_children: None,
            upstream: Url::parse(DEFAULT_UPSTREAM).expect("default upstream is a valid URL"),
        }
    }
}

impl Config {
    /// `host:port`, bracketing IPv6 hosts.
    pub fn listen_addr(&self) -> String {
        if self.listen_host.contains(':') && !self.listen_host.starts_with('[') {
            format!("[{}]:{}", self.listen_host, self.listen_port)
        } else {
            format!("{}:{}", self.listen_host, self.listen_port)
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            anyhow::bail!("--workers must be at least 1");
        }
        if self.listen_host.trim().is_empty() {
            anyhow::bail!("--listen-host must not be empty");
        }
        if !matches!(self.upstream.scheme(), "http" | "https") || self.upstream.host().is_none() {
            anyhow::bail!("--upstream must be an http(s) origin, got {}", self.upstream);
        }
        Ok(())
    }
}
