use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use prometheus::Registry;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use udprobe::{
    config::{CollectorConfig, ConfigError, DEFAULT_REFLECTOR_PORT},
    init_tracing,
    metrics::{write_textfile, LogMetricSetter, MetricSetter, PrometheusMetricSetter},
    Collector,
};

/// Sends UDP probes to a fleet of reflectors and reports latency and loss per path.
#[derive(Debug, Parser)]
#[command(name = "udprobe-collector", version)]
struct Args {
    /// Path to the collector configuration. The built-in localhost config is used if absent.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Reflector port for targets of a legacy configuration.
    #[arg(long, default_value_t = DEFAULT_REFLECTOR_PORT)]
    dst_port: u16,

    /// Write path metrics in the Prometheus text format to this file, once per summarization
    /// interval, instead of logging them.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

impl Args {
    fn load_config(&self) -> Result<CollectorConfig, ConfigError> {
        match &self.config {
            Some(path) => CollectorConfig::load(path, self.dst_port),
            None => Ok(CollectorConfig::default()),
        }
    }
}

async fn write_once(registry: &Registry, path: &Path) {
    match write_textfile(registry, path).await {
        Ok(()) => debug!(path = %path.display(), "Wrote metrics"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to write metrics"),
    }
}

/// Rewrites the metrics file every `interval` until cancelled, then once more.
async fn write_metrics(
    registry: Registry,
    path: PathBuf,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => write_once(&registry, &path).await,
        }
    }

    write_once(&registry, &path).await;
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let config = match args.load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let registry = Registry::new();
    let setter: Arc<dyn MetricSetter> = if args.metrics_file.is_some() {
        match PrometheusMetricSetter::new(&registry) {
            Ok(setter) => Arc::new(setter),
            Err(e) => {
                error!(error = %e, "Failed to register metrics");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Arc::new(LogMetricSetter)
    };
    let interval = config.summarization.interval();

    let collector = match Collector::from_config(config, setter).await {
        Ok(collector) => collector,
        Err(e) => {
            error!(error = %e, "Failed to set up collector");
            return ExitCode::FAILURE;
        }
    };

    let (mut hangup, mut terminate, mut interrupt) = match (
        signal(SignalKind::hangup()),
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(hup), Ok(term), Ok(int)) => (hup, term, int),
        _ => {
            error!("Failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    };

    collector.run().await;
    info!(hostname = collector.config().hostname(), "Collector running");

    let cancel = CancellationToken::new();
    let writer = args
        .metrics_file
        .clone()
        .map(|path| tokio::spawn(write_metrics(registry, path, interval, cancel.clone())));

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("Received SIGHUP, reloading config");
                match args.load_config() {
                    Ok(config) => {
                        if let Err(e) = collector.reload(config).await {
                            warn!(error = %e, "Reload failed, keeping previous config");
                        }
                    }
                    Err(e) => warn!(error = %e, "Failed to load config, keeping previous config"),
                }
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                break;
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT");
                break;
            }
        }
    }

    collector.stop().await;
    cancel.cancel();
    if let Some(writer) = writer {
        let _ = writer.await;
    }
    info!("Collector stopped");

    ExitCode::SUCCESS
}
