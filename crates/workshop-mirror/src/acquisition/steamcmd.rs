//! SteamCMD-backed acquisition tool.

use super::{AcquisitionTool, ContentIdentifier};
use crate::config::{Config, Credentials};
use crate::error::{MirrorError, MirrorResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Pause before the single retry of a failed invocation.
const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Platform-specific SteamCMD launcher name inside its install directory.
pub fn executable_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "steamcmd.exe"
    } else if cfg!(target_os = "linux") {
        "steamcmd.sh"
    } else {
        "steamcmd"
    }
}

/// Find the SteamCMD executable.
///
/// Looks in the install directory first, then falls back to `steamcmd` on PATH.
pub fn find_steamcmd(install_dir: &Path) -> Option<PathBuf> {
    let local = install_dir.join(executable_name());
    if local.exists() {
        return Some(local);
    }
    which::which("steamcmd").ok()
}

/// Runs `steamcmd +workshop_download_item` for each fetch.
pub struct SteamCmd {
    install_dir: PathBuf,
    executable: PathBuf,
    credentials: Option<Credentials>,
    retry_delay: Duration,
}

impl SteamCmd {
    pub fn new(install_dir: impl Into<PathBuf>, executable: impl Into<PathBuf>) -> Self {
        Self {
            install_dir: install_dir.into(),
            executable: executable.into(),
            credentials: None,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Build from startup configuration, resolving the executable location.
    pub fn from_config(config: &Config) -> Option<Self> {
        let executable = find_steamcmd(&config.steamcmd_dir)?;
        let install_dir = std::path::absolute(&config.steamcmd_dir)
            .unwrap_or_else(|_| config.steamcmd_dir.clone());
        Some(Self::new(install_dir, executable).with_credentials(config.credentials.clone()))
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// Command-line arguments for one download.
    ///
    /// The install directory is forced so content lands under
    /// [`content_dir`](AcquisitionTool::content_dir) even when the executable
    /// came from PATH and has its own install root.
    pub fn args(&self, id: ContentIdentifier, validate: bool) -> Vec<String> {
        let mut args = vec![
            "+force_install_dir".to_string(),
            self.install_dir.display().to_string(),
            "+login".to_string(),
        ];
        match &self.credentials {
            Some(creds) => {
                args.push(creds.username.clone());
                args.push(creds.password.clone());
            }
            None => args.push("anonymous".to_string()),
        }
        args.push("+workshop_download_item".to_string());
        args.push(id.app_id.to_string());
        args.push(id.item_id.to_string());
        if validate {
            args.push("validate".to_string());
        }
        args.push("+quit".to_string());
        args
    }

    async fn run_once(&self, args: &[String]) -> std::io::Result<ExitStatus> {
        Command::new(&self.executable)
            .args(args)
            .current_dir(&self.install_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .status()
            .await
    }
}

/// Describe a failed invocation for logs.
fn describe(outcome: &std::io::Result<ExitStatus>) -> Option<String> {
    match outcome {
        Ok(status) if status.success() => None,
        Ok(status) => Some(format!("steamcmd exited with {status}")),
        Err(e) => Some(format!("failed to launch steamcmd: {e}")),
    }
}

#[async_trait]
impl AcquisitionTool for SteamCmd {
    async fn fetch(&self, id: ContentIdentifier, validate: bool) -> MirrorResult<()> {
        let args = self.args(id, validate);
        debug!(%id, validate, "invoking steamcmd");

        let Some(reason) = describe(&self.run_once(&args).await) else {
            return Ok(());
        };
        warn!(%id, %reason, "steamcmd failed, retrying once");
        tokio::time::sleep(self.retry_delay).await;

        match describe(&self.run_once(&args).await) {
            None => Ok(()),
            Some(reason) => Err(MirrorError::acquisition(
                format!("workshop item {}", id.item_id),
                format!("{reason} after retry"),
            )),
        }
    }

    fn content_dir(&self, id: ContentIdentifier) -> PathBuf {
        self.install_dir
            .join("steamapps")
            .join("workshop")
            .join("content")
            .join(id.app_id.to_string())
            .join(id.item_id.to_string())
    }
}
