// SPDX-License-Identifier: AGPL-3.0-or-later

//! lurebot - LURE recipe reviewer
//!
//! Reviews `lure.sh` recipes in pull requests, or checks them locally.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use lurebot::config::Config;
use lurebot::fetch::{local_recipes, GitFetcher};
use lurebot::forge::github::GitHubForgeClient;
use lurebot::licenses::{
    spawn_refresher, FileSource, LicenseRegistry, LicenseSource, SpdxSource, DEFAULT_LICENSE_URL,
};
use lurebot::queue::JobQueue;
use lurebot::report::{FileReport, OutputFormat, Reporter};
use lurebot::rules;
use lurebot::sandbox::{self, Limits};
use lurebot::webhook::{router, WebhookState};
use lurebot::worker::{spawn_workers, Pipeline};

/// Pull request reviewer for LURE build recipes
#[derive(Parser, Debug)]
#[command(name = "lurebot")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the webhook server (configured from LURE_BOT_* variables)
    Serve {
        /// Listen address, overrides LURE_BOT_ADDR
        #[arg(long)]
        addr: Option<String>,

        /// Number of workers, overrides LURE_BOT_WORKERS
        #[arg(long)]
        workers: Option<usize>,

        /// GitHub API base URL, overrides LURE_BOT_API_URL
        #[arg(long)]
        api_url: Option<String>,

        /// SPDX license list URL, overrides LURE_BOT_LICENSE_URL
        #[arg(long)]
        license_url: Option<String>,

        /// Seconds between license list refreshes
        #[arg(long)]
        refresh_secs: Option<u64>,

        /// Seconds a single pull request may take
        #[arg(long)]
        job_timeout_secs: Option<u64>,
    },

    /// Check recipe files or directories locally
    Check {
        /// Files, or directories to search for lure.sh recipes
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,

        /// Local copy of the SPDX licenses.json
        #[arg(long)]
        licenses: Option<PathBuf>,

        /// SPDX license list URL, used when --licenses is not given
        #[arg(long, env = "LURE_BOT_LICENSE_URL", default_value = DEFAULT_LICENSE_URL)]
        license_url: String,

        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("lurebot={}", log_level).into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("lurebot v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Serve {
            addr,
            workers,
            api_url,
            license_url,
            refresh_secs,
            job_timeout_secs,
        } => {
            let mut config = Config::from_env()?;
            if let Some(addr) = addr {
                config.addr = lurebot::config::parse_listen_addr(&addr)?;
            }
            if let Some(workers) = workers {
                config.workers = workers.max(1);
            }
            if let Some(api_url) = api_url {
                config.api_url = api_url;
            }
            if let Some(license_url) = license_url {
                config.license_url = license_url;
            }
            if let Some(secs) = refresh_secs {
                config.refresh_every = Duration::from_secs(secs.max(1));
            }
            if let Some(secs) = job_timeout_secs {
                config.job_timeout = Duration::from_secs(secs.max(1));
            }
            serve(config).await?;
        }

        Commands::Check {
            paths,
            format,
            licenses,
            license_url,
            output,
        } => {
            let source: Box<dyn LicenseSource> = match licenses {
                Some(path) => Box::new(FileSource::new(path)),
                None => Box::new(SpdxSource::new(license_url)?),
            };
            let reports = check(&paths, source.as_ref()).await?;
            Reporter::new(format).output(&reports, output.as_deref())?;

            if reports.iter().any(|report| !report.is_clean()) {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let token = config
        .github_token
        .clone()
        .context("LURE_BOT_GITHUB_TOKEN not set")?;
    if config.secret.is_none() {
        warn!("LURE_BOT_SECRET not set; every webhook delivery will be rejected");
    }

    let licenses = Arc::new(LicenseRegistry::new());
    let source: Arc<dyn LicenseSource> = Arc::new(SpdxSource::new(config.license_url.clone())?);
    licenses
        .refresh(source.as_ref())
        .await
        .context("Failed to load SPDX license list")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let (queue, jobs) = JobQueue::start(shutdown.clone());
    let refresher = spawn_refresher(
        Arc::clone(&licenses),
        source,
        config.refresh_every,
        shutdown.clone(),
    );

    let pipeline = Arc::new(Pipeline {
        forge: Arc::new(GitHubForgeClient::with_base_url(token, config.api_url.clone())?),
        fetcher: Arc::new(GitFetcher::default()),
        licenses: Arc::clone(&licenses),
        limits: Limits::default(),
        job_timeout: config.job_timeout,
    });
    let workers = spawn_workers(config.workers, jobs, pipeline);

    let state = WebhookState {
        queue,
        secret: config.secret.as_deref().map(Arc::from),
        licenses,
    };
    let listener = tokio::net::TcpListener::bind(&config.addr)
        .await
        .with_context(|| format!("Failed to listen on {}", config.addr))?;
    info!(
        "Listening on {} with {} workers",
        listener.local_addr()?,
        config.workers
    );

    let server_shutdown = shutdown.clone();
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    // workers finish their current job, then see the queue close
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!("Worker panicked: {}", e);
        }
    }
    let _ = refresher.await;
    info!("Shut down");
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }
    shutdown.cancel();
}

/// Evaluate and validate local recipes
async fn check(paths: &[PathBuf], source: &dyn LicenseSource) -> Result<Vec<FileReport>> {
    let registry = LicenseRegistry::new();
    registry
        .refresh(source)
        .await
        .context("Failed to load SPDX license list")?;

    let cwd = std::env::current_dir().ok();
    let mut reports = Vec::new();
    for path in local_recipes(paths)? {
        // shown relative to the working directory when under it
        let shown = cwd
            .as_deref()
            .and_then(|cwd| path.strip_prefix(cwd).ok())
            .unwrap_or(path.as_path())
            .display()
            .to_string();
        let script = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let report = match sandbox::evaluate(&script) {
            Ok(bindings) => FileReport {
                path: shown,
                findings: rules::validate(&bindings, &registry),
                error: None,
            },
            Err(e) => FileReport {
                path: shown,
                findings: Vec::new(),
                error: Some(e.to_string()),
            },
        };
        reports.push(report);
    }
    Ok(reports)
}
