use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use market_recorder::config::{Config, LoggingConfig, OutputKind, ResolvedConfig};
use market_recorder::metrics::PipelineMetrics;
use market_recorder::sink::{JsonLinesSink, LogSink, PersistenceSink};
use market_recorder::snapshot::RestSnapshotFetcher;
use market_recorder::status;
use market_recorder::stream::BinanceStreamConnector;
use market_recorder::supervisor::{Dependencies, Supervisor};
use market_recorder::SERVICE_VERSION;

/// Exit code for configuration and startup failures.
const EXIT_STARTUP: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "market-recorder", version, about = "Record market data and reconstruct order books")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Mode to run, overriding `mode` in the file
    #[arg(short, long)]
    mode: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start recording (default)
    Run,
    /// Query a running instance, or print the resolved configuration
    Status {
        /// Base URL of a running status endpoint, e.g. http://127.0.0.1:9100
        #[arg(long)]
        addr: Option<String>,
    },
    /// List the symbols of the selected mode
    ListSymbols,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(EXIT_STARTUP)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<ExitCode> {
    let loaded = Config::load(&cli.config).map(|mut config| {
        if let Some(mode) = &cli.mode {
            config.mode = mode.clone();
        }
        config
    });
    let logging = loaded
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging, cli.verbose);

    let config = loaded
        .and_then(|c| c.resolve())
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Status { addr } => {
            match addr {
                Some(addr) => query_status(&addr).await?,
                None => print_config_summary(&config)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::ListSymbols => {
            list_symbols(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn init_tracing(logging: &LoggingConfig, verbose: u8) {
    let fallback = logging.level.clone().unwrap_or_else(|| {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
        .to_string()
    });
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    if logging.json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }
}

async fn run(config: ResolvedConfig) -> anyhow::Result<ExitCode> {
    info!(
        version = SERVICE_VERSION,
        mode = %config.mode,
        symbols = config.workers.len(),
        run_duration_secs = config.run_duration.map(|d| d.as_secs()),
        "Starting market recorder"
    );

    let sink: Arc<dyn PersistenceSink> = match config.storage.output {
        OutputKind::Jsonl => Arc::new(
            JsonLinesSink::open(&config.storage.output_directory)
                .context("failed to open output directory")?,
        ),
        OutputKind::Log => Arc::new(LogSink),
    };
    let snapshots = RestSnapshotFetcher::new(
        config.network.rest_base_url.clone(),
        config.network.request_timeout(),
    )
    .context("failed to build snapshot client")?;
    let connector = BinanceStreamConnector::new(
        config.network.stream_base_url.clone(),
        config.network.ping_interval(),
        config.network.request_timeout(),
    );

    let supervisor = Supervisor::new(
        config.supervisor.clone(),
        config.workers.clone(),
        Dependencies {
            connector: Arc::new(connector),
            snapshots: Arc::new(snapshots),
            sink,
        },
        Arc::new(PipelineMetrics::new()),
    )?;

    let (stop_status, status_stopped) = watch::channel(false);
    if let Some(addr) = config.status_addr {
        let registry = supervisor.registry();
        let mut stopped = status_stopped.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = stopped.wait_for(|stop| *stop).await;
            };
            if let Err(e) = status::serve(addr, registry, shutdown).await {
                error!(addr = %addr, error = %e, "Status endpoint failed");
            }
        });
    }

    let report = supervisor.run(shutdown_signal(config.run_duration)).await;
    let _ = stop_status.send(true);

    if !report.failed_symbols.is_empty() {
        warn!(symbols = ?report.failed_symbols, "Symbols failed permanently during the run");
    }
    if report.writer_failed {
        error!("Writer exhausted its restarts; the run was stopped early");
    }
    info!(
        clean = report.clean,
        records_unpersisted = report.records_unpersisted,
        "Market recorder stopped"
    );
    Ok(ExitCode::from(report.exit_code() as u8))
}

/// Resolves on SIGINT/SIGTERM or once `run_duration` has elapsed.
async fn shutdown_signal(run_duration: Option<Duration>) {
    let deadline = async {
        match run_duration {
            Some(duration) => {
                tokio::time::sleep(duration).await;
                info!(secs = duration.as_secs(), "Run duration elapsed");
            }
            None => std::future::pending().await,
        }
    };
    let signalled = async {
        match wait_for_signal().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => {
                warn!(error = %e, "Cannot listen for signals; only the run duration stops the recorder");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = signalled => {}
        _ = deadline => {}
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

async fn query_status(addr: &str) -> anyhow::Result<()> {
    let base = if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.trim_end_matches('/').to_string()
    } else {
        format!("http://{}", addr.trim_end_matches('/'))
    };
    let url = format!("{base}/status");
    let body: serde_json::Value = reqwest::get(&url)
        .await
        .with_context(|| format!("failed to reach {url}"))?
        .error_for_status()?
        .json()
        .await
        .context("status endpoint returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

fn print_config_summary(config: &ResolvedConfig) -> anyhow::Result<()> {
    let workers: Vec<serde_json::Value> = config
        .workers
        .iter()
        .map(|w| {
            serde_json::json!({
                "symbol": w.symbol,
                "streams": w.streams,
                "publish_snapshots": w.publish_snapshots,
                "sequence_policy": w.engine.sequence_policy,
            })
        })
        .collect();
    let summary = serde_json::json!({
        "mode": config.mode,
        "run_duration_secs": config.run_duration.map(|d| d.as_secs()),
        "workers": workers,
        "channel_capacity": config.supervisor.channel_capacity,
        "storage": config.storage,
        "status_addr": config.status_addr.map(|a| a.to_string()),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn list_symbols(config: &ResolvedConfig) {
    println!("mode: {}", config.mode);
    for entry in &config.symbols {
        let state = if entry.enabled { "enabled" } else { "disabled" };
        println!("{:<16} {:<9} {}", entry.symbol.to_ascii_uppercase(), state, entry.streams.join(","));
    }
}
