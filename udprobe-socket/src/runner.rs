use std::{net::SocketAddr, sync::Arc};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use udprobe_common::RateLimiter;

use crate::{Port, PortError, PortOptions, Probe};

/// Drives one test: a list of targets, probed from a set of ports at a shared rate.
///
/// Every pacing cycle sends one probe per target per port, in target order, waiting on the rate
/// limiter before each. Changing the targets with [`TestRunner::set`] takes effect at the next
/// probe; the interrupted cycle is abandoned.
#[derive(Debug)]
pub struct TestRunner {
    ports: Vec<Port>,
    /// Completion queue handed to every port.
    completed: mpsc::Sender<Probe>,
    limiter: Arc<RateLimiter>,
    targets: watch::Sender<Arc<Vec<SocketAddr>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TestRunner {
    pub fn new(limiter: RateLimiter, completed: mpsc::Sender<Probe>) -> Self {
        let (targets, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            ports: Vec::new(),
            completed,
            limiter: Arc::new(limiter),
            targets,
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Binds a new port and attaches it to this runner. Ports must be added before
    /// [`TestRunner::run`].
    pub async fn add_port(
        &mut self,
        addr: SocketAddr,
        options: PortOptions,
    ) -> Result<&Port, PortError> {
        let port = Port::bind(addr, options, self.completed.clone()).await?;
        self.ports.push(port);
        Ok(&self.ports[self.ports.len() - 1])
    }

    /// Replaces the list of targets.
    pub fn set(&self, targets: Vec<SocketAddr>) {
        debug!(count = targets.len(), "Setting targets");
        self.targets.send_replace(Arc::new(targets));
    }

    pub fn targets(&self) -> Arc<Vec<SocketAddr>> {
        Arc::clone(&self.targets.borrow())
    }

    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Starts the pacing loop. Calling it again while running has no effect.
    pub fn run(&self) {
        let mut task = self.task.lock();
        if task.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let senders = self.ports.iter().map(Port::sender).collect();
        *task = Some(tokio::spawn(pace(
            senders,
            Arc::clone(&self.limiter),
            self.targets.subscribe(),
            self.cancel.clone(),
        )));
    }

    /// Stops the pacing loop and all ports. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Pacing task failed: {:?}", e);
            }
        }

        futures::future::join_all(self.ports.iter().map(Port::stop)).await;
    }
}

impl Drop for TestRunner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn pace(
    senders: Vec<mpsc::Sender<SocketAddr>>,
    limiter: Arc<RateLimiter>,
    mut targets: watch::Receiver<Arc<Vec<SocketAddr>>>,
    cancel: CancellationToken,
) {
    loop {
        let current = Arc::clone(&targets.borrow_and_update());

        if current.is_empty() || senders.is_empty() {
            debug!("Nothing to probe, waiting for targets");
            tokio::select! {
                _ = cancel.cancelled() => return,
                res = targets.changed() => {
                    if res.is_err() {
                        return;
                    }
                    continue;
                }
            }
        }

        'cycle: for dst in current.iter() {
            for to_port in &senders {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = limiter.wait() => {}
                }

                tokio::select! {
                    _ = cancel.cancelled() => return,
                    res = to_port.send(*dst) => {
                        if res.is_err() {
                            debug!("Port closed, stopping pacing loop");
                            return;
                        }
                    }
                }

                if targets.has_changed().unwrap_or(true) {
                    break 'cycle;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::UdpSocket;

    use super::*;
    use crate::test_utils::localhost;

    async fn runner(pps: f64, ports: usize) -> (TestRunner, mpsc::Receiver<Probe>) {
        let (tx, rx) = mpsc::channel(1024);
        let mut runner = TestRunner::new(RateLimiter::per_second(pps), tx);
        for _ in 0..ports {
            runner.add_port(localhost(), PortOptions::default()).await.unwrap();
        }
        (runner, rx)
    }

    #[tokio::test]
    async fn probes_every_target_from_every_port() {
        let _ = tracing_subscriber::fmt::try_init();

        let sink_a = UdpSocket::bind(localhost()).await.unwrap();
        let sink_b = UdpSocket::bind(localhost()).await.unwrap();

        let (runner, _rx) = runner(200.0, 2).await;
        runner.set(vec![sink_a.local_addr().unwrap(), sink_b.local_addr().unwrap()]);
        runner.run();

        tokio::time::sleep(Duration::from_millis(300)).await;
        runner.stop().await;

        for port in runner.ports() {
            let sent = port.stats().sent();
            assert!(sent >= 2, "port sent {sent} probes");
            assert_eq!(port.stats().send_errors(), 0);
        }

        let mut buf = [0u8; 128];
        assert!(sink_a.try_recv_from(&mut buf).is_ok());
        assert!(sink_b.try_recv_from(&mut buf).is_ok());
    }

    #[tokio::test]
    async fn idles_without_targets() {
        let _ = tracing_subscriber::fmt::try_init();

        let sink = UdpSocket::bind(localhost()).await.unwrap();
        let (runner, _rx) = runner(1000.0, 1).await;
        runner.run();
        runner.run();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runner.ports()[0].stats().sent(), 0);

        runner.set(vec![sink.local_addr().unwrap()]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runner.ports()[0].stats().sent() > 0);

        runner.stop().await;
        runner.stop().await;
    }

    #[tokio::test]
    async fn rate_limits_probes() {
        let _ = tracing_subscriber::fmt::try_init();

        let sink = UdpSocket::bind(localhost()).await.unwrap();
        let (runner, _rx) = runner(10.0, 1).await;
        runner.set(vec![sink.local_addr().unwrap()]);
        runner.run();

        // Burst of 10, then 10 per second.
        tokio::time::sleep(Duration::from_millis(500)).await;
        runner.stop().await;

        let sent = runner.ports()[0].stats().sent();
        assert!((10..=17).contains(&sent), "sent {sent} probes");
    }
}
