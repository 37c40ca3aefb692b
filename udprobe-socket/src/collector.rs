use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use udprobe_common::RateLimiter;
use udprobe_config::{binds_overlap, CollectorConfig, ConfigError, TagSet, TestConfig};

use crate::{
    metrics::{emit_summaries, MetricSetter},
    PortError, PortOptions, Probe, ResultHandler, Summarizer, Summary, TestRunner,
    DEFAULT_CHANNEL_SIZE,
};

#[derive(Debug, Error)]
pub enum CollectorError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Port error: {0}")]
    Port(#[from] PortError),
}

/// The probing side: every configured test, the result handlers and the summarizer, wired
/// together.
///
/// ```text
/// TestRunner -> Port -> (reflector) -> Port -> ResultHandler -> Summarizer -> MetricSetter
/// ```
///
/// Test runners can be replaced at runtime with [`Collector::reload`]; the rest of the
/// pipeline lives as long as the collector.
#[derive(Debug)]
pub struct Collector {
    config: Mutex<CollectorConfig>,
    /// Completion queue shared by the ports of every runner, including reloaded ones.
    completed: mpsc::Sender<Probe>,
    runners: tokio::sync::Mutex<Vec<TestRunner>>,
    handlers: Vec<ResultHandler>,
    summarizer: Summarizer,
    /// Every batch the summarizer publishes, taken by the metrics task on run.
    batches: Mutex<Option<mpsc::Receiver<Arc<Vec<Summary>>>>>,
    tags: watch::Sender<TagSet>,
    setter: Arc<dyn MetricSetter>,
    cancel: CancellationToken,
    metrics_task: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Collector {
    /// Validates `config` and sets up the whole pipeline, binding every port. Nothing is sent
    /// until [`Collector::run`].
    pub async fn from_config(
        config: CollectorConfig,
        setter: Arc<dyn MetricSetter>,
    ) -> Result<Self, CollectorError> {
        info!("Setting up collector");
        config.validate()?;

        let (completed, from_ports) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        let (to_summarizer, from_handlers) = mpsc::channel(DEFAULT_CHANNEL_SIZE);

        let runners = build_runners(&config, &completed).await?;

        debug!(count = config.summarization.handlers, "Setting up result handlers");
        let handlers =
            ResultHandler::pool(config.summarization.handlers, from_ports, to_summarizer);
        let summarizer = Summarizer::new(from_handlers, config.summarization.interval());
        let batches = summarizer.batches();

        let (tags, _) = watch::channel(config.tag_set());

        info!(tests = runners.len(), "Collector setup complete");

        Ok(Self {
            config: Mutex::new(config),
            completed,
            runners: tokio::sync::Mutex::new(runners),
            handlers,
            summarizer,
            batches: Mutex::new(Some(batches)),
            tags,
            setter,
            cancel: CancellationToken::new(),
            metrics_task: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Starts every test runner, the summarizer and metric emission. Calling it again has no
    /// effect.
    pub async fn run(&self) {
        if self.running.swap(true, Ordering::SeqCst) || self.cancel.is_cancelled() {
            return;
        }

        info!("Starting collector");
        if let Some(batches) = self.batches.lock().take() {
            *self.metrics_task.lock() = Some(tokio::spawn(emit_loop(
                batches,
                self.tags.subscribe(),
                Arc::clone(&self.setter),
            )));
        }
        self.summarizer.run();

        for runner in self.runners.lock().await.iter() {
            runner.run();
        }
    }

    /// Replaces every test runner with the ones described by `config`.
    ///
    /// The new runners are built before the old ones stop; if building fails, the old runners
    /// keep running and the error is returned. When `config` binds a fixed port the current
    /// runners hold, those runners are stopped first to release it, and rebuilt from the
    /// previous configuration if the new one fails to bind. Tags of the new config are merged
    /// into the existing tag set: keys are added or updated, never removed.
    pub async fn reload(&self, config: CollectorConfig) -> Result<(), CollectorError> {
        info!("Reloading collector");
        config.validate()?;

        let mut runners = self.runners.lock().await;

        let in_use: Vec<SocketAddr> = runners
            .iter()
            .flat_map(|runner| runner.ports().iter().map(|port| port.local_addr()))
            .collect();
        let rebinds = config
            .fixed_bind_addrs()
            .iter()
            .any(|addr| in_use.iter().any(|current| binds_overlap(addr, current)));

        let new_runners = if rebinds {
            debug!("Releasing fixed ports before binding the new config");
            futures::future::join_all(runners.iter().map(TestRunner::stop)).await;

            match build_runners(&config, &self.completed).await {
                Ok(new_runners) => new_runners,
                Err(e) => {
                    let previous = self.config.lock().clone();
                    match build_runners(&previous, &self.completed).await {
                        Ok(restored) => {
                            if self.is_running() {
                                restored.iter().for_each(TestRunner::run);
                            }
                            *runners = restored;
                        }
                        Err(restore) => {
                            error!(error = %restore, "Failed to restore previous test runners");
                            runners.clear();
                        }
                    }
                    return Err(e);
                }
            }
        } else {
            let new_runners = build_runners(&config, &self.completed).await?;
            futures::future::join_all(runners.iter().map(TestRunner::stop)).await;
            new_runners
        };

        if self.is_running() {
            new_runners.iter().for_each(TestRunner::run);
        }
        *runners = new_runners;
        drop(runners);

        let tag_set = config.tag_set();
        self.tags.send_modify(|tags| tags.merge(tag_set));
        *self.config.lock() = config;

        info!("Reload complete");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// Stops the pipeline front to back, so that every probe completed before stop is
    /// summarized and emitted. Idempotent.
    pub async fn stop(&self) {
        info!("Stopping collector");

        {
            let runners = self.runners.lock().await;
            futures::future::join_all(runners.iter().map(TestRunner::stop)).await;
        }

        futures::future::join_all(self.handlers.iter().map(ResultHandler::stop)).await;
        self.summarizer.stop().await;

        self.cancel.cancel();
        let task = self.metrics_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Metrics task failed: {:?}", e);
            }
        }
    }

    /// Subscribes to summary batches, one per summarization interval.
    pub fn summaries(&self) -> watch::Receiver<Arc<Vec<Summary>>> {
        self.summarizer.subscribe()
    }

    /// A snapshot of the current tag set.
    pub fn tag_set(&self) -> TagSet {
        self.tags.borrow().clone()
    }

    /// The configuration currently in effect.
    pub fn config(&self) -> CollectorConfig {
        self.config.lock().clone()
    }

    /// The local addresses of every port of every runner.
    pub async fn local_addrs(&self) -> Vec<SocketAddr> {
        self.runners
            .lock()
            .await
            .iter()
            .flat_map(|runner| runner.ports().iter().map(|port| port.local_addr()))
            .collect()
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Builds one runner per test, with its ports bound and its targets set. On failure, every
/// port bound so far is closed before returning.
async fn build_runners(
    config: &CollectorConfig,
    completed: &mpsc::Sender<Probe>,
) -> Result<Vec<TestRunner>, CollectorError> {
    let mut runners = Vec::with_capacity(config.tests.len());

    for test in &config.tests {
        match build_runner(config, test, completed).await {
            Ok(runner) => runners.push(runner),
            Err(e) => {
                futures::future::join_all(runners.iter().map(TestRunner::stop)).await;
                return Err(e);
            }
        }
    }

    Ok(runners)
}

async fn build_runner(
    config: &CollectorConfig,
    test: &TestConfig,
    completed: &mpsc::Sender<Probe>,
) -> Result<TestRunner, CollectorError> {
    let (targets, ports, rate_limit) = config.test_parts(test)?;
    debug!(
        targets = %test.targets,
        port_group = %test.port_group,
        rate_limit = %test.rate_limit,
        "Setting up test runner"
    );

    let mut runner = TestRunner::new(RateLimiter::per_second(rate_limit.cps), completed.clone());
    for port in ports {
        let added = runner.add_port(port.bind_addr(), PortOptions::from(port)).await.map(|_| ());
        if let Err(e) = added {
            runner.stop().await;
            return Err(e.into());
        }
    }

    runner.set(targets.resolved_targets());
    Ok(runner)
}

/// Emits every batch of summaries through `setter`, labelled with the current tags. Returns once
/// the summarizer has stopped and its last batch is emitted.
async fn emit_loop(
    mut batches: mpsc::Receiver<Arc<Vec<Summary>>>,
    tags: watch::Receiver<TagSet>,
    setter: Arc<dyn MetricSetter>,
) {
    while let Some(batch) = batches.recv().await {
        emit_summaries(&batch, &tags.borrow(), setter.as_ref());
        debug!(paths = batch.len(), "Emitted summaries");
    }
}

#[cfg(test)]
mod tests {
    use udprobe_config::{
        PortGroupConfig, TargetConfig, TargetSet, DEFAULT_NAME, DST_HOSTNAME, SRC_HOSTNAME,
    };

    use super::*;
    use crate::metrics::NoopMetricSetter;

    fn localhost_config() -> CollectorConfig {
        let mut config = CollectorConfig::default();
        for port in config.ports.values_mut() {
            port.ip = [127, 0, 0, 1].into();
        }
        config
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut config = localhost_config();
        config.tests[0].targets = "missing".to_string();

        let err = Collector::from_config(config, Arc::new(NoopMetricSetter)).await.unwrap_err();
        assert!(matches!(err, CollectorError::Config(ConfigError::UnknownTargetSet(_))));
    }

    #[tokio::test]
    async fn binds_every_port_of_a_group() {
        let _ = tracing_subscriber::fmt::try_init();

        let collector =
            Collector::from_config(localhost_config(), Arc::new(NoopMetricSetter)).await.unwrap();
        assert_eq!(collector.local_addrs().await.len(), 4);
        assert_eq!(collector.tag_set().tag("127.0.0.1", DST_HOSTNAME), "localhost");

        collector.stop().await;
        collector.stop().await;
    }

    #[tokio::test]
    async fn failed_reload_keeps_previous_state() {
        let _ = tracing_subscriber::fmt::try_init();

        let collector =
            Collector::from_config(localhost_config(), Arc::new(NoopMetricSetter)).await.unwrap();
        collector.run().await;
        let before = collector.local_addrs().await;

        let mut bad = localhost_config();
        bad.tests[0].rate_limit = "missing".to_string();
        assert!(collector.reload(bad).await.is_err());

        assert_eq!(collector.local_addrs().await, before);
        assert_eq!(collector.config(), localhost_config());

        collector.stop().await;
    }

    fn fixed_port_config(port: u16) -> CollectorConfig {
        let mut config = localhost_config();
        config.ports.get_mut(DEFAULT_NAME).unwrap().port = port;
        config.port_groups.get_mut(DEFAULT_NAME).unwrap()[0].count = 1;
        config
    }

    fn free_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn reload_rebinds_fixed_ports() {
        let _ = tracing_subscriber::fmt::try_init();

        let port = free_port();
        let collector =
            Collector::from_config(fixed_port_config(port), Arc::new(NoopMetricSetter))
                .await
                .unwrap();
        collector.run().await;

        let fixed: SocketAddr = ([127, 0, 0, 1], port).into();
        collector.reload(fixed_port_config(port)).await.unwrap();
        assert_eq!(collector.local_addrs().await, vec![fixed]);

        // A port taken by someone else fails the reload, the previous port is bound again.
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut next = fixed_port_config(port);
        let mut other = next.ports[DEFAULT_NAME].clone();
        other.port = taken.local_addr().unwrap().port();
        next.ports.insert("other".to_string(), other);
        next.port_groups
            .get_mut(DEFAULT_NAME)
            .unwrap()
            .push(PortGroupConfig { port: "other".to_string(), count: 1 });

        let err = collector.reload(next).await.unwrap_err();
        assert!(matches!(err, CollectorError::Port(PortError::Bind { .. })));
        assert_eq!(collector.local_addrs().await, vec![fixed]);
        assert_eq!(collector.config(), fixed_port_config(port));

        collector.stop().await;
    }

    #[tokio::test]
    async fn reload_replaces_runners_and_merges_tags() {
        let _ = tracing_subscriber::fmt::try_init();

        let collector =
            Collector::from_config(localhost_config(), Arc::new(NoopMetricSetter)).await.unwrap();
        collector.run().await;

        let mut next = localhost_config();
        next.hostname = Some("collector-2".to_string());
        next.port_groups.get_mut(DEFAULT_NAME).unwrap()[0].count = 2;
        next.targets.insert(
            DEFAULT_NAME,
            TargetSet(vec![TargetConfig::new([127, 0, 0, 2].into(), 8100)
                .with_tag(DST_HOSTNAME, "other")]),
        );

        collector.reload(next).await.unwrap();
        assert_eq!(collector.local_addrs().await.len(), 2);

        // The old target keeps its tags, the new one is added.
        let tags = collector.tag_set();
        assert_eq!(tags.tag("127.0.0.1", DST_HOSTNAME), "localhost");
        assert_eq!(tags.tag("127.0.0.2", DST_HOSTNAME), "other");
        assert_eq!(tags.tag("127.0.0.2", SRC_HOSTNAME), "collector-2");

        collector.stop().await;
    }
}
