//! Emission of summaries to a metrics backend.
//!
//! The backend is injected as a [`MetricSetter`]. Every summary is turned into four gauges
//! labelled with the path and the hostnames found in the target tags.
//!
//! [`PrometheusMetricSetter`] and [`ReflectorMetrics`] keep their values in a
//! [`prometheus::Registry`], which [`write_textfile`] renders in the text exposition format.

use std::{fmt, io, path::Path};

use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};

use udprobe_config::{TagSet, DST_HOSTNAME, SRC_HOSTNAME};

use crate::{ReflectorStats, Summary};

/// Label names of every path metric, in the order of [`Labels::pairs`].
pub const LABEL_NAMES: [&str; 4] = ["src_ip", "dst_ip", "src_hostname", "dst_hostname"];

/// The labels attached to every metric of a summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Labels {
    pub src_ip: String,
    pub dst_ip: String,
    pub src_hostname: String,
    pub dst_hostname: String,
}

impl Labels {
    /// Builds the labels of `summary`, looking up hostnames by destination IP.
    pub fn new(summary: &Summary, tags: &TagSet) -> Self {
        let dst_ip = summary.path.dst.to_string();
        Self {
            src_ip: summary.path.src.to_string(),
            src_hostname: tags.tag(&dst_ip, SRC_HOSTNAME).to_string(),
            dst_hostname: tags.tag(&dst_ip, DST_HOSTNAME).to_string(),
            dst_ip,
        }
    }

    /// The labels as `(name, value)` pairs, in a fixed order.
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        let [src_ip, dst_ip, src_hostname, dst_hostname] = self.values();
        [
            (LABEL_NAMES[0], src_ip),
            (LABEL_NAMES[1], dst_ip),
            (LABEL_NAMES[2], src_hostname),
            (LABEL_NAMES[3], dst_hostname),
        ]
    }

    /// The label values, ordered as [`LABEL_NAMES`].
    pub fn values(&self) -> [&str; 4] {
        [&self.src_ip, &self.dst_ip, &self.src_hostname, &self.dst_hostname]
    }
}

/// A sink for path metrics.
pub trait MetricSetter: Send + Sync + fmt::Debug {
    /// Packet loss in percent.
    fn set_packet_loss(&self, labels: &Labels, value: f64);
    fn set_packets_sent(&self, labels: &Labels, value: f64);
    fn set_packets_lost(&self, labels: &Labels, value: f64);
    /// Average round-trip time in milliseconds.
    fn set_rtt(&self, labels: &Labels, value: f64);
}

/// Sets the metrics of every summary: packet loss, packets sent, packets lost and RTT, in
/// that order.
pub fn emit_summaries(summaries: &[Summary], tags: &TagSet, setter: &dyn MetricSetter) {
    for summary in summaries {
        let labels = Labels::new(summary, tags);
        setter.set_packet_loss(&labels, summary.loss);
        setter.set_packets_sent(&labels, summary.sent as f64);
        setter.set_packets_lost(&labels, summary.lost as f64);
        setter.set_rtt(&labels, summary.rtt_avg_ms());
    }
}

/// Logs every metric as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMetricSetter;

impl LogMetricSetter {
    fn log(name: &str, labels: &Labels, value: f64) {
        tracing::info!(
            target: "udprobe::metrics",
            metric = name,
            value,
            src_ip = %labels.src_ip,
            dst_ip = %labels.dst_ip,
            src_hostname = %labels.src_hostname,
            dst_hostname = %labels.dst_hostname,
        );
    }
}

impl MetricSetter for LogMetricSetter {
    fn set_packet_loss(&self, labels: &Labels, value: f64) {
        Self::log("packet_loss", labels, value);
    }

    fn set_packets_sent(&self, labels: &Labels, value: f64) {
        Self::log("packets_sent", labels, value);
    }

    fn set_packets_lost(&self, labels: &Labels, value: f64) {
        Self::log("packets_lost", labels, value);
    }

    fn set_rtt(&self, labels: &Labels, value: f64) {
        Self::log("rtt", labels, value);
    }
}

/// Discards every metric.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetricSetter;

impl MetricSetter for NoopMetricSetter {
    fn set_packet_loss(&self, _: &Labels, _: f64) {}
    fn set_packets_sent(&self, _: &Labels, _: f64) {}
    fn set_packets_lost(&self, _: &Labels, _: f64) {}
    fn set_rtt(&self, _: &Labels, _: f64) {}
}

/// Path gauges registered in a Prometheus registry.
#[derive(Debug, Clone)]
pub struct PrometheusMetricSetter {
    packet_loss: GaugeVec,
    packets_sent: GaugeVec,
    packets_lost: GaugeVec,
    rtt: GaugeVec,
}

impl PrometheusMetricSetter {
    /// Creates the path gauges and registers them in `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauge = |name: &str, help: &str| -> Result<GaugeVec, prometheus::Error> {
            let gauge = GaugeVec::new(Opts::new(name, help), &LABEL_NAMES)?;
            registry.register(Box::new(gauge.clone()))?;
            Ok(gauge)
        };

        Ok(Self {
            packet_loss: gauge(
                "llama_packet_loss_percentage",
                "Packet loss percentage for a given measurement period.",
            )?,
            packets_sent: gauge(
                "llama_packets_sent",
                "Number of packets sent for a given measurement period.",
            )?,
            packets_lost: gauge(
                "llama_packets_lost",
                "Number of packets lost for a given measurement period.",
            )?,
            rtt: gauge("llama_rtt", "RTT for packets sent during a given measurement period.")?,
        })
    }
}

impl MetricSetter for PrometheusMetricSetter {
    fn set_packet_loss(&self, labels: &Labels, value: f64) {
        self.packet_loss.with_label_values(&labels.values()).set(value);
    }

    fn set_packets_sent(&self, labels: &Labels, value: f64) {
        self.packets_sent.with_label_values(&labels.values()).set(value);
    }

    fn set_packets_lost(&self, labels: &Labels, value: f64) {
        self.packets_lost.with_label_values(&labels.values()).set(value);
    }

    fn set_rtt(&self, labels: &Labels, value: f64) {
        self.rtt.with_label_values(&labels.values()).set(value);
    }
}

/// Reflector counters mirrored into a Prometheus registry by [`ReflectorMetrics::update`].
#[derive(Debug, Clone)]
pub struct ReflectorMetrics {
    received: IntCounter,
    reflected: IntCounter,
    bad_data: IntCounter,
    throttled: IntCounter,
    tos_changes: IntCounter,
    send_errors: IntCounter,
    up: IntGauge,
}

impl ReflectorMetrics {
    /// Creates the reflector metrics and registers them in `registry`.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let counter = |name: &str, help: &str| -> Result<IntCounter, prometheus::Error> {
            let counter = IntCounter::new(name, help)?;
            registry.register(Box::new(counter.clone()))?;
            Ok(counter)
        };

        let up = IntGauge::new("llama_reflector_up", "Health status: 1 if running, 0 if stopped.")?;
        registry.register(Box::new(up.clone()))?;

        Ok(Self {
            received: counter(
                "llama_reflector_packets_received_total",
                "Total UDP packets received by the reflector.",
            )?,
            reflected: counter(
                "llama_reflector_packets_reflected_total",
                "Packets successfully reflected back to sender.",
            )?,
            bad_data: counter(
                "llama_reflector_packets_bad_data_total",
                "Malformed/unparseable packets received.",
            )?,
            throttled: counter(
                "llama_reflector_packets_throttled_total",
                "Packets delayed by rate limiting.",
            )?,
            tos_changes: counter(
                "llama_reflector_tos_changes_total",
                "Reply ToS changes between consecutive packets.",
            )?,
            send_errors: counter(
                "llama_reflector_send_errors_total",
                "Replies that could not be sent.",
            )?,
            up,
        })
    }

    /// Brings every metric up to date with `stats`.
    pub fn update(&self, stats: &ReflectorStats) {
        let advance = |counter: &IntCounter, value: u64| {
            counter.inc_by(value.saturating_sub(counter.get()));
        };

        advance(&self.received, stats.received());
        advance(&self.reflected, stats.reflected());
        advance(&self.bad_data, stats.bad_data());
        advance(&self.throttled, stats.throttled());
        advance(&self.tos_changes, stats.tos_changes());
        advance(&self.send_errors, stats.send_errors());
        self.up.set(i64::from(stats.is_up()));
    }
}

/// Renders every metric of `registry` in the Prometheus text format.
pub fn encode(registry: &Registry) -> Result<String, prometheus::Error> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Writes the metrics of `registry` to `path` for a node exporter textfile collector. The file
/// is written next to `path` first and renamed over it, so readers never see a partial file.
pub async fn write_textfile(registry: &Registry, path: &Path) -> io::Result<()> {
    let text = encode(registry).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");

    tokio::fs::write(&tmp, text).await?;
    tokio::fs::rename(&tmp, path).await
}
