use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

use maildir_exporter::config::Config;
use maildir_exporter::engine::Engine;
use maildir_exporter::engine::shutdown::{block_on_bounded, wait_for_signal};
use maildir_exporter::sink::PrometheusSink;
use maildir_exporter::{registry, server};

/// Exit code when loops had to be abandoned at shutdown.
const EXIT_SHUTDOWN_TIMEOUT: u8 = 2;

/// How long blocking walks may linger after the loops have been joined.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "maildir-exporter")]
#[command(about = "Watch per-user maildirs and export their structure as Prometheus metrics")]
#[command(version)]
struct Cli {
    /// Directory containing one maildir per user
    #[arg(long, env = "MAILDIR_ROOT")]
    root: Option<PathBuf>,

    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address of the metrics endpoint (default: 0.0.0.0:9275)
    #[arg(long)]
    listen: Option<String>,

    /// HTTP path of the metrics endpoint (default: /metrics)
    #[arg(long)]
    metrics_path: Option<String>,

    /// Additional folder name to watch, may be repeated (default: cur)
    #[arg(long = "watch-folder", value_name = "NAME")]
    watch_folders: Vec<String>,

    /// Watch every directory of every maildir
    #[arg(long)]
    watch_all_folders: bool,

    /// Seconds to wait for loops to stop on shutdown (default: 10)
    #[arg(long, value_name = "SECS")]
    shutdown_timeout: Option<u64>,

    /// Log level used when RUST_LOG is not set: debug, info, warn, error
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    /// Load the config file, if any, and apply the flags on top of it.
    fn into_config(self) -> maildir_exporter::Result<(Config, LogFormat)> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(root) = self.root {
            config.root = Some(root);
        }
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(path) = self.metrics_path {
            config.metrics_path = path;
        }
        config.watch_folders.extend(self.watch_folders);
        if self.watch_all_folders {
            config.watch_all_folders = true;
        }
        if let Some(secs) = self.shutdown_timeout {
            config.shutdown_timeout_secs = secs;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        Ok((config, self.log_format))
    }
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => {
            let use_ansi = std::io::IsTerminal::is_terminal(&std::io::stdout());
            registry
                .with(fmt::layer().with_target(false).with_ansi(use_ansi))
                .init()
        }
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let (config, log_format) = match cli.into_config() {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(&config.log_level, log_format);

    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };
    // Walks stuck in the filesystem must not keep the process alive.
    block_on_bounded(runtime, run(config), RUNTIME_SHUTDOWN_GRACE)
}

async fn run(config: Config) -> ExitCode {
    let Some(root) = config.root.as_deref() else {
        tracing::error!("no maildir root configured");
        return ExitCode::FAILURE;
    };

    let entities = match registry::discover(root) {
        Ok(entities) => entities,
        Err(e) => {
            tracing::error!(error = %e, "failed to discover user maildirs");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(root = %root.display(), users = entities.len(), "discovered user maildirs");

    let sink = match PrometheusSink::new() {
        Ok(sink) => sink,
        Err(e) => {
            tracing::error!(error = %e, "failed to set up metrics");
            return ExitCode::FAILURE;
        }
    };

    // Bind before spawning loops so a busy port fails fast.
    let listener = match config.listen_addr() {
        Ok(addr) => match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(address = %addr, error = %e, "failed to bind metrics endpoint");
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "invalid listen address");
            return ExitCode::FAILURE;
        }
    };

    let engine = Engine::start(
        entities,
        config.watch_policy(),
        Arc::new(sink.clone()),
        config.shutdown_timeout(),
    );

    let shutdown = engine.shutdown_token();
    let metrics_path = config.metrics_path.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, &metrics_path, sink, shutdown.clone()).await {
            tracing::error!(error = %e, "metrics server stopped");
            shutdown.cancel();
        }
    });

    let token = engine.shutdown_token();
    tokio::select! {
        signal = wait_for_signal() => match signal {
            Ok(name) => tracing::info!(signal = name, "received signal, shutting down"),
            Err(e) => tracing::error!(error = %e, "failed to listen for signals, shutting down"),
        },
        _ = token.cancelled() => tracing::warn!("shutdown requested internally"),
    }

    let report = engine.shutdown().await;
    match tokio::time::timeout(config.shutdown_timeout(), server).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "metrics server task failed"),
        Err(_) => tracing::warn!("metrics server did not stop in time"),
    }

    if report.is_complete() {
        tracing::info!("shutdown complete");
        ExitCode::SUCCESS
    } else {
        for id in report.abandoned() {
            tracing::warn!(loop_id = %id, "loop abandoned at shutdown");
        }
        ExitCode::from(EXIT_SHUTDOWN_TIMEOUT)
    }
}
