use std::{net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;

use udprobe_config::{
    CollectorConfig, TargetConfig, TargetSet, DEFAULT_NAME, DST_HOSTNAME, SRC_HOSTNAME,
};
use udprobe_socket::{
    metrics::{Labels, MetricSetter},
    Collector, Reflector, ReflectorOptions,
};

use crate::localhost;

/// Keeps the last value set for every metric.
#[derive(Debug, Default)]
struct LastValues {
    values: Mutex<Vec<(&'static str, Labels, f64)>>,
}

impl LastValues {
    fn record(&self, name: &'static str, labels: &Labels, value: f64) {
        self.values.lock().push((name, labels.clone(), value));
    }

    fn get(&self, name: &str) -> Option<(Labels, f64)> {
        self.values
            .lock()
            .iter()
            .rev()
            .find(|(n, _, _)| *n == name)
            .map(|(_, labels, value)| (labels.clone(), *value))
    }
}

impl MetricSetter for LastValues {
    fn set_packet_loss(&self, labels: &Labels, value: f64) {
        self.record("packet_loss", labels, value);
    }

    fn set_packets_sent(&self, labels: &Labels, value: f64) {
        self.record("packets_sent", labels, value);
    }

    fn set_packets_lost(&self, labels: &Labels, value: f64) {
        self.record("packets_lost", labels, value);
    }

    fn set_rtt(&self, labels: &Labels, value: f64) {
        self.record("rtt", labels, value);
    }
}

fn config_for(reflector: SocketAddr) -> CollectorConfig {
    let mut config = CollectorConfig::default();
    config.hostname = Some("collector-1".to_string());
    config.summarization.interval = 1;
    for port in config.ports.values_mut() {
        port.ip = [127, 0, 0, 1].into();
    }
    for rate_limit in config.rate_limits.values_mut() {
        rate_limit.cps = 40.0;
    }
    config.targets.insert(
        DEFAULT_NAME,
        TargetSet(vec![TargetConfig::new(reflector.ip(), reflector.port())
            .with_tag(DST_HOSTNAME, "reflector-1")]),
    );
    config
}

#[tokio::test]
async fn collector_summarizes_live_reflector() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = Reflector::bind(localhost(), ReflectorOptions::default()).await.unwrap();
    tokio::spawn(reflector.clone().run());

    let setter = Arc::new(LastValues::default());
    let collector = Collector::from_config(config_for(reflector.local_addr()), setter.clone())
        .await
        .unwrap();

    let mut summaries = collector.summaries();
    collector.run().await;

    let batch = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            summaries.changed().await.unwrap();
            let batch = Arc::clone(&summaries.borrow_and_update());
            if !batch.is_empty() {
                return batch;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(batch.len(), 1);
    let summary = &batch[0];
    assert_eq!(summary.path.dst, reflector.local_addr().ip());
    assert!(summary.sent > 0);
    assert_eq!(summary.lost, 0);
    assert_eq!(summary.loss, 0.0);
    assert!(summary.rtt_avg > Duration::ZERO);

    collector.stop().await;
    reflector.stop();

    let (labels, sent) = setter.get("packets_sent").unwrap();
    assert!(sent > 0.0);
    assert_eq!(labels.dst_ip, "127.0.0.1");
    assert_eq!(labels.dst_hostname, "reflector-1");
    assert_eq!(labels.src_hostname, "collector-1");
    assert!(setter.get("rtt").is_some());

    let tags = collector.tag_set();
    assert_eq!(tags.tag("127.0.0.1", SRC_HOSTNAME), "collector-1");
}
