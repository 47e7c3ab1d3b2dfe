//! CLI entry point for netupdate.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use netupdate_core::{
    EngineConfig, HttpTransport, NetworkConfig, RequestOutcome, RequestSpec, RetryController,
    RetryPolicy, SegmentedDownloader, TokioExecutor, Transport, UpdateOrchestrator, UpdateOutcome,
    VerifyResult, digest, verify,
};
use tracing::{debug, info};

mod cli;
mod console;

use cli::{Args, Command, FetchArgs, HashArgs, UpdateArgs};
use console::ConsoleHost;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    match args.command {
        None => {
            info!("No command given. Run `netupdate --help` for usage.");
            Ok(())
        }
        Some(Command::Fetch(fetch)) => run_fetch(fetch, !args.quiet).await,
        Some(Command::Hash(hash)) => run_hash(hash).await,
        Some(Command::Update(update)) => run_update(update).await,
    }
}

async fn run_fetch(args: FetchArgs, show_progress: bool) -> Result<()> {
    let network = NetworkConfig {
        proxy: args.proxy.clone(),
        ca_bundle: args.ca_bundle.clone(),
        ..NetworkConfig::default()
    };
    network.validate()?;

    let executor = Arc::new(TokioExecutor::current(usize::from(args.concurrency))?);
    let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(&network, executor)?);

    let bar = console::byte_progress(show_progress, &args.url);
    let mut spec = RequestSpec::download(args.url.as_str(), &args.output)
        .resumable(args.resume)
        .progress_sink(console::progress_sink(&bar));
    for line in &args.headers {
        spec = spec.header_line(line);
    }

    let succeeded = if args.segmented {
        SegmentedDownloader::new(transport)
            .multi_threaded_download(&spec, args.split.into(), args.split_param)
            .await
    } else {
        let policy = RetryPolicy::default()
            .with_max_attempts(u32::from(args.max_attempts))
            .with_delay(Duration::from_millis(args.retry_delay))
            .accepting([200, 206]);
        let outcome: RequestOutcome<()> = RetryController::new(transport)
            .execute_with_retry(&spec, &policy)
            .await;
        if !outcome.succeeded {
            bar.abandon();
            bail!("download of {} failed: {}", args.url, outcome.error_summary);
        }
        true
    };
    bar.finish_and_clear();

    if !succeeded {
        bail!("segmented download of {} failed", args.url);
    }
    info!(path = %args.output.display(), "Download complete");
    Ok(())
}

async fn run_hash(args: HashArgs) -> Result<()> {
    match args.expect {
        None => {
            let hex = digest(&args.file, &args.algorithm)
                .await
                .with_context(|| format!("cannot hash {}", args.file.display()))?;
            println!("{hex}  {}", args.file.display());
            Ok(())
        }
        Some(expected) => match verify(&args.file, &expected, &args.algorithm).await {
            VerifyResult::Verified => {
                println!("{}: OK", args.file.display());
                Ok(())
            }
            VerifyResult::Mismatch { expected, actual } => {
                bail!("{}: checksum mismatch (expected {expected}, got {actual})", args.file.display())
            }
            VerifyResult::Unverifiable { reason } => {
                bail!("{}: cannot verify: {reason}", args.file.display())
            }
        },
    }
}

async fn run_update(args: UpdateArgs) -> Result<()> {
    let mut config = EngineConfig::load(&args.config)?;
    if let Some(work_dir) = args.work_dir {
        config.updater.work_dir = work_dir;
    }

    let executor = Arc::new(TokioExecutor::current(config.updater.concurrency)?);
    let transport = Arc::new(HttpTransport::new(&config.network, executor)?);
    let host = Arc::new(ConsoleHost::default());
    let orchestrator =
        UpdateOrchestrator::new(&config.network, config.updater.clone(), transport, host.clone())?;

    if args.check_only {
        if let Some(notice) = orchestrator.check_maintenance().await? {
            println!("maintenance: {} ({:?})", notice.title, notice.status);
            return Ok(());
        }
        match orchestrator.check_update().await? {
            Some(manifest) => println!(
                "update available: {} ({} files)",
                manifest.resource_version,
                manifest.files.len()
            ),
            None => println!("no update available"),
        }
        return Ok(());
    }

    match orchestrator.run().await {
        UpdateOutcome::Completed => info!("Update complete"),
        UpdateOutcome::NoUpdateAvailable => println!("no update available"),
        UpdateOutcome::MaintenanceActive(notice) => {
            if host.quit_requested() {
                info!("maintenance in progress, exiting");
            }
            debug!(?notice, "maintenance notice");
        }
        UpdateOutcome::AwaitingExternalUpdater(launch) => {
            info!(updater = %launch.program.display(), "handed off to external updater");
        }
        UpdateOutcome::RetryRequired(reason) => bail!("update check failed, try again later: {reason}"),
        UpdateOutcome::Failed(reason) => bail!("update failed: {reason}"),
    }
    Ok(())
}
