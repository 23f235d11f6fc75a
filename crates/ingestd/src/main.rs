//! The archive ingestion daemon: watch a logging directory, decode what
//! appears there, and project it into the clustered series store.

mod config;
mod decoder;
mod logging;

use clap::Parser;
use config::{Config, Settings};
use decoder::JsonDecoder;
use discover::{DiscoverOptions, Discovery, ExcludeFilter, SeriesSink};
use logging::{init_logging, LogArgs};
use series_schema::{bootstrap, BootstrapFlags, Loader, Maps, ScriptRegistry};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use store_client::{reconnect_worker, StoreClient, RECONNECT_INTERVAL};

const DEFAULT_ARCHIVE_DIR: &str = "/var/log/pcp/pmlogger";

/// ingestd tails performance archives and loads them into the series store.
#[derive(Debug, Parser)]
#[clap(name = "ingestd", version)]
struct Ingestd {
    /// Path to the INI configuration file.
    #[clap(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory of archives to watch.
    #[clap(
        long = "archives",
        value_name = "DIR",
        env = "PCP_ARCHIVE_DIR",
        default_value = DEFAULT_ARCHIVE_DIR
    )]
    archives: PathBuf,

    #[clap(flatten)]
    log: LogArgs,
}

fn main() -> ExitCode {
    let args = Ingestd::parse();
    init_logging(&args.log);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = format!("{:#}", err), "startup failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Ingestd) -> anyhow::Result<()> {
    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let settings = Settings::from_config(&config);

    if !settings.redis_enabled {
        tracing::info!("store module disabled by configuration");
        return Ok(());
    }

    // One cooperative loop drives everything: store I/O, batons, and the
    // archive watcher. Shared state is only touched between suspension
    // points, so the whole daemon runs single-threaded.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();
    local.block_on(&runtime, serve(args.archives, settings))
}

async fn serve(archives: PathBuf, settings: Settings) -> anyhow::Result<()> {
    let client = StoreClient::new(settings.servers.clone());
    let registry = Arc::new(ScriptRegistry::new());
    let flags = BootstrapFlags {
        keymap: settings.proxy_protocol,
        version: settings.series_enabled,
        scripts: settings.search_enabled,
        strict: false,
    };

    let outcome = bootstrap(&client, &registry, flags).await?;
    tracing::info!(
        servers = settings.servers.len(),
        server_version = outcome.server_version,
        schema_version = outcome.schema_version,
        "connected to the series store",
    );

    // The reconnect worker re-runs the bootstrap sequence whenever the
    // client reports a disconnect.
    let worker = {
        let watched = client.clone();
        let restore_client = client.clone();
        let registry = registry.clone();
        tokio::task::spawn_local(async move {
            reconnect_worker(watched, RECONNECT_INTERVAL, move || {
                let client = restore_client.clone();
                let registry = registry.clone();
                async move { bootstrap(&client, &registry, flags).await.map(|_| ()) }
            })
            .await
        })
    };

    if outcome.read_only {
        // A mismatched schema is left alone: keep the connection alive for
        // whoever operates on it, write nothing.
        tracing::error!("schema mismatch: series loading disabled");
        let _ = worker.await;
        return Ok(());
    }
    if !settings.series_enabled || !settings.discover_enabled {
        tracing::info!("archive discovery disabled by configuration");
        let _ = worker.await;
        return Ok(());
    }

    let loader = Loader::new(client, Arc::new(Maps::new()), settings.load_options());
    let mut options = DiscoverOptions::new(&archives);
    options.filter = ExcludeFilter::parse(
        settings.exclude_metrics.as_deref(),
        settings.exclude_indoms.as_deref(),
    );
    let discovery = Discovery::new(options, JsonDecoder::new(), SeriesSink::new(loader))?;

    tracing::info!(dir = %archives.display(), "watching archives");
    discovery.run().await;
    Ok(())
}
