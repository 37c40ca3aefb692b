use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Probe, ProbePath};

/// The outcome of a single probe, as consumed by the summarizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub path: ProbePath,
    pub received: bool,
    /// The round-trip time. `None` if the probe was lost.
    pub rtt: Option<Duration>,
    pub tos: u8,
}

impl From<Probe> for ProbeResult {
    fn from(probe: Probe) -> Self {
        Self { path: probe.path, received: probe.is_received(), rtt: probe.rtt(), tos: probe.tos }
    }
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Probe>>>;

/// A worker turning completed probes into [`ProbeResult`]s.
///
/// Workers of a pool share one receiver; each probe is handled by exactly one of them.
#[derive(Debug)]
pub struct ResultHandler {
    id: usize,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ResultHandler {
    /// Spawns a single worker on a shared receiver.
    pub fn spawn(
        id: usize,
        from_ports: SharedReceiver,
        to_summarizer: mpsc::Sender<ProbeResult>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(work(id, from_ports, to_summarizer, cancel.clone()));

        Self { id, cancel, task: Mutex::new(Some(task)) }
    }

    /// Spawns `n` workers sharing `from_ports`.
    pub fn pool(
        n: usize,
        from_ports: mpsc::Receiver<Probe>,
        to_summarizer: mpsc::Sender<ProbeResult>,
    ) -> Vec<Self> {
        let from_ports = Arc::new(tokio::sync::Mutex::new(from_ports));
        (0..n.max(1))
            .map(|id| Self::spawn(id, Arc::clone(&from_ports), to_summarizer.clone()))
            .collect()
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Stops the worker. It forwards the probe it holds, then whatever is already queued,
    /// before exiting. Returns promptly while other workers of the pool keep running.
    /// Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(id = self.id, "Result handler failed: {:?}", e);
            }
        }
    }
}

impl Drop for ResultHandler {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn work(
    id: usize,
    from_ports: SharedReceiver,
    to_summarizer: mpsc::Sender<ProbeResult>,
    cancel: CancellationToken,
) {
    loop {
        let probe = tokio::select! {
            _ = cancel.cancelled() => break,
            probe = async { from_ports.lock().await.recv().await } => match probe {
                Some(probe) => probe,
                None => {
                    debug!(id, "Completion queue closed");
                    return;
                }
            },
        };

        if to_summarizer.send(ProbeResult::from(probe)).await.is_err() {
            debug!(id, "Result queue closed");
            return;
        }
    }

    // Drain what the ports flushed before stopping. A sibling holding the receiver is still
    // running and forwards the rest.
    let mut drained = 0usize;
    loop {
        let Ok(mut rx) = from_ports.try_lock() else { break };
        let Ok(probe) = rx.try_recv() else { break };
        drop(rx);

        if to_summarizer.send(ProbeResult::from(probe)).await.is_err() {
            break;
        }
        drained += 1;
    }

    debug!(id, drained, "Result handler stopped");
}
