use anyhow::{Context, Result};
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use url::Url;
use workshop_mirror::acquisition::pipeline::AcquisitionPipeline;
use workshop_mirror::acquisition::steamcmd::{executable_name, SteamCmd};
use workshop_mirror::config::{Config, Credentials, DEFAULT_UPSTREAM, DEFAULT_WORKERS};
use workshop_mirror::metadata::WorkshopScraper;
use workshop_mirror::proxy::Upstream;
use workshop_mirror::rest::{self, AppState};

#[derive(Parser)]
#[command(
    name = "workshop-mirror",
    about = "Workshop Mirror: browse the Steam Workshop and download items as zip archives",
    version
)]
struct Cli {
    /// SteamCMD install directory
    #[arg(long, default_value = "steamcmd")]
    steamcmd_path: PathBuf,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    listen_host: String,

    #[arg(long, default_value_t = 8080)]
    listen_port: u16,

    /// Steam account for SteamCMD (anonymous login when unset)
    #[arg(long, env = "STEAM_USER")]
    steam_user: Option<String>,

    #[arg(long, env = "STEAM_PASSWORD", hide_env_values = true)]
    steam_password: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Concurrent SteamCMD downloads per collection
    #[arg(long, default_value_t = DEFAULT_WORKERS)]
    workers: usize,

    /// Fail a collection download when more than this many items fail
    #[arg(long)]
    max_failed_children: Option<usize>,

    /// Site to mirror
    #[arg(long, default_value = DEFAULT_UPSTREAM)]
    upstream: Url,

    /// Print shell completions and exit
    #[arg(long, value_name = "SHELL")]
    completions: Option<Shell>,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            steamcmd_dir: self.steamcmd_path,
            listen_host: self.listen_host,
            listen_port: self.listen_port,
            credentials: Credentials::from_parts(self.steam_user, self.steam_password),
            debug: self.debug,
            workers: self.workers,
            max_failed_children: self.max_failed_children,
            upstream: self.upstream,
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug {
        "workshop_mirror=debug,tower_http=debug"
    } else {
        "workshop_mirror=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(shell) = cli.completions {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "workshop-mirror", &mut std::io::stdout());
        return Ok(());
    }

    let config = cli.into_config();
    config.validate()?;
    init_tracing(config.debug);

    let steamcmd = SteamCmd::from_config(&config).with_context(|| {
        format!(
            "SteamCMD not found: expected {} or `steamcmd` on PATH",
            config.steamcmd_dir.join(executable_name()).display()
        )
    })?;
    info!(
        executable = %steamcmd.executable().display(),
        anonymous = config.credentials.is_none(),
        "using SteamCMD"
    );

    let archive_dir = tempfile::Builder::new()
        .prefix("workshop-mirror-")
        .tempdir()
        .context("failed to create archive directory")?;
    info!(dir = %archive_dir.path().display(), "archives are kept for this run only");

    let resolver =
        WorkshopScraper::new(config.upstream.clone()).context("failed to build upstream client")?;
    let pipeline = AcquisitionPipeline::new(
        Arc::new(steamcmd),
        Arc::new(resolver),
        archive_dir.path(),
    )
    .with_workers(config.workers)
    .with_max_failed_children(config.max_failed_children)
    .with_progress_bar(true);
    let upstream =
        Upstream::new(config.upstream.clone()).context("failed to build upstream client")?;

    let state = Arc::new(AppState { pipeline, upstream });
    rest::serve(&config.listen_addr(), state).await?;

    archive_dir
        .close()
        .context("failed to remove archive directory")?;
    info!("stopped");
    Ok(())
}
