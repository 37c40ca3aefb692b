use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use clap::Parser;
use prometheus::Registry;
use tokio::{
    signal::unix::{signal, SignalKind},
    time::Interval,
};
use tracing::{error, info, warn};

use udprobe::{
    config::DEFAULT_REFLECTOR_PORT,
    init_tracing,
    metrics::{write_textfile, ReflectorMetrics},
    Reflector, ReflectorOptions, ReflectorStats,
};

/// Echoes udprobe probes back to their sender, preserving the ToS marking.
#[derive(Debug, Parser)]
#[command(name = "udprobe-reflector", version)]
struct Args {
    /// UDP port to listen on.
    #[arg(short, long, default_value_t = DEFAULT_REFLECTOR_PORT)]
    port: u16,

    /// Maximum packets reflected per second. Non-positive disables throttling.
    #[arg(long, default_value_t = 5000.0)]
    max_pps: f64,

    /// Socket receive buffer size in bytes.
    #[arg(long, default_value_t = 540_672)]
    rcvbuf: usize,

    /// Send replies with the socket ToS instead of the one carried by each probe.
    #[arg(long)]
    no_mirror_tos: bool,

    /// Seconds between counter reports. Zero disables them.
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,

    /// Also write the counters in the Prometheus text format to this file on every report.
    #[arg(long)]
    metrics_file: Option<PathBuf>,
}

/// Counters exported to a Prometheus textfile.
#[derive(Debug)]
struct Exporter {
    registry: Registry,
    metrics: ReflectorMetrics,
    path: PathBuf,
}

impl Exporter {
    fn new(path: PathBuf) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let metrics = ReflectorMetrics::new(&registry)?;
        Ok(Self { registry, metrics, path })
    }

    async fn export(&self, stats: &ReflectorStats) {
        self.metrics.update(stats);
        if let Err(e) = write_textfile(&self.registry, &self.path).await {
            warn!(path = %self.path.display(), error = %e, "Failed to write metrics");
        }
    }
}

async fn report(stats: &ReflectorStats, exporter: Option<&Exporter>) {
    log_stats(stats);
    if let Some(exporter) = exporter {
        exporter.export(stats).await;
    }
}

fn log_stats(stats: &ReflectorStats) {
    info!(
        up = stats.is_up(),
        received = stats.received(),
        reflected = stats.reflected(),
        bad_data = stats.bad_data(),
        throttled = stats.throttled(),
        tos_changes = stats.tos_changes(),
        send_errors = stats.send_errors(),
        "Reflector stats"
    );
}

/// Ticks `interval`, or never completes if there is none.
async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    let args = Args::parse();

    let options = ReflectorOptions::default()
        .max_pps(args.max_pps)
        .recv_buffer_size(args.rcvbuf)
        .mirror_tos(!args.no_mirror_tos);

    let exporter = match args.metrics_file.clone().map(Exporter::new).transpose() {
        Ok(exporter) => exporter,
        Err(e) => {
            error!(error = %e, "Failed to register metrics");
            return ExitCode::FAILURE;
        }
    };

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let reflector = match Reflector::bind(addr, options).await {
        Ok(reflector) => reflector,
        Err(e) => {
            error!(error = %e, "Failed to bind reflector");
            return ExitCode::FAILURE;
        }
    };

    let (mut terminate, mut interrupt) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(term), Ok(int)) => (term, int),
            _ => {
                error!("Failed to install signal handlers");
                return ExitCode::FAILURE;
            }
        };

    info!(addr = %reflector.local_addr(), max_pps = args.max_pps, "Reflector running");
    let mut task = tokio::spawn(reflector.clone().run());

    let mut stats_interval = (args.stats_interval > 0)
        .then(|| tokio::time::interval(Duration::from_secs(args.stats_interval)));

    let code = loop {
        tokio::select! {
            _ = tick(&mut stats_interval) => {
                report(reflector.stats(), exporter.as_ref()).await;
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM");
                break ExitCode::SUCCESS;
            }
            _ = interrupt.recv() => {
                info!("Received SIGINT");
                break ExitCode::SUCCESS;
            }
            res = &mut task => {
                match res {
                    Ok(Ok(())) => break ExitCode::SUCCESS,
                    Ok(Err(e)) => error!(error = %e, "Reflector failed"),
                    Err(e) => error!(error = ?e, "Reflector task panicked"),
                }
                break ExitCode::FAILURE;
            }
        }
    };

    reflector.stop();
    if !task.is_finished() {
        let _ = task.await;
    }
    report(reflector.stats(), exporter.as_ref()).await;

    code
}
