use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ProbePath, ProbeResult};

/// Loss and latency of one path over one summarization window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub path: ProbePath,
    pub sent: u64,
    pub lost: u64,
    /// Packet loss in percent.
    pub loss: f64,
    /// Average RTT over the received probes, zero if none were received.
    pub rtt_avg: Duration,
}

impl Summary {
    #[inline]
    pub fn rtt_avg_ms(&self) -> f64 {
        self.rtt_avg.as_nanos() as f64 / 1_000_000.0
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PathStats {
    sent: u64,
    lost: u64,
    received: u64,
    rtt_total: Duration,
}

impl PathStats {
    fn add(&mut self, result: &ProbeResult) {
        self.sent += 1;
        match (result.received, result.rtt) {
            (true, Some(rtt)) => {
                self.received += 1;
                self.rtt_total += rtt;
            }
            (true, None) => self.received += 1,
            (false, _) => self.lost += 1,
        }
    }

    fn summary(&self, path: ProbePath) -> Summary {
        let loss = if self.sent == 0 { 0.0 } else { self.lost as f64 / self.sent as f64 * 100.0 };
        let rtt_avg = if self.received == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos((self.rtt_total.as_nanos() / u128::from(self.received)) as u64)
        };

        Summary { path, sent: self.sent, lost: self.lost, loss, rtt_avg }
    }
}

#[derive(Debug, Default)]
struct Accumulator {
    paths: FxHashMap<ProbePath, PathStats>,
}

impl Accumulator {
    fn add(&mut self, result: &ProbeResult) {
        self.paths.entry(result.path).or_default().add(result);
    }

    /// Returns one summary per path seen since the last flush, ordered by path, and resets.
    fn flush(&mut self) -> Vec<Summary> {
        let mut summaries: Vec<_> =
            self.paths.drain().map(|(path, stats)| stats.summary(path)).collect();
        summaries.sort_unstable_by_key(|s| s.path);
        summaries
    }
}

/// Summarizes a batch of results: one [`Summary`] per path present, ordered by path.
pub fn summarize(results: impl IntoIterator<Item = ProbeResult>) -> Vec<Summary> {
    let mut acc = Accumulator::default();
    for result in results {
        acc.add(&result);
    }
    acc.flush()
}

/// The capacity of the queue returned by [`Summarizer::batches`].
pub const BATCH_QUEUE_SIZE: usize = 4;

type Batch = Arc<Vec<Summary>>;

/// Aggregates results into a batch of [`Summary`]s every interval.
///
/// Results are accumulated as they arrive. At every tick, whatever is already queued is drained
/// without waiting, the batch is published to watchers and the accumulator is reset. Paths
/// without traffic in a window produce no summary.
///
/// Watchers only see the latest batch. A consumer that must see every window takes the
/// [`Summarizer::batches`] queue instead; the summarizer waits for room in it.
#[derive(Debug)]
pub struct Summarizer {
    interval: Duration,
    from_handlers: Mutex<Option<mpsc::Receiver<ProbeResult>>>,
    summaries: watch::Sender<Batch>,
    batches: Mutex<Option<mpsc::Sender<Batch>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Summarizer {
    pub fn new(from_handlers: mpsc::Receiver<ProbeResult>, interval: Duration) -> Self {
        let (summaries, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            interval: interval.max(Duration::from_millis(1)),
            from_handlers: Mutex::new(Some(from_handlers)),
            summaries,
            batches: Mutex::new(None),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Subscribes to published batches.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Vec<Summary>>> {
        self.summaries.subscribe()
    }

    /// Returns a queue receiving every batch, in order. Only batches published after the
    /// call are queued; a second call replaces the first queue. Must be called before
    /// [`Summarizer::run`] to take effect.
    pub fn batches(&self) -> mpsc::Receiver<Batch> {
        let (tx, rx) = mpsc::channel(BATCH_QUEUE_SIZE);
        *self.batches.lock() = Some(tx);
        rx
    }

    /// The most recently published batch.
    pub fn latest(&self) -> Arc<Vec<Summary>> {
        Arc::clone(&self.summaries.borrow())
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Starts summarizing. Calling it again has no effect.
    pub fn run(&self) {
        let Some(from_handlers) = self.from_handlers.lock().take() else {
            return;
        };

        let task = tokio::spawn(summarize_loop(
            from_handlers,
            self.interval,
            Publisher { summaries: self.summaries.clone(), batches: self.batches.lock().take() },
            self.cancel.clone(),
        ));
        *self.task.lock() = Some(task);
    }

    /// Publishes the current window one last time and stops. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Summarizer failed: {:?}", e);
            }
        }
    }
}

impl Drop for Summarizer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Upper bound on queueing the last batches when the summarizer stops.
const FINAL_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

/// Where batches go: the watch channel, and the batch queue if one was taken.
struct Publisher {
    summaries: watch::Sender<Batch>,
    batches: Option<mpsc::Sender<Batch>>,
}

impl Publisher {
    /// Closes the current window and publishes it to watchers.
    fn flush(
        &self,
        from_handlers: &mut mpsc::Receiver<ProbeResult>,
        acc: &mut Accumulator,
    ) -> Batch {
        while let Ok(result) = from_handlers.try_recv() {
            acc.add(&result);
        }

        let batch = Arc::new(acc.flush());
        debug!(paths = batch.len(), "Publishing summaries");
        self.summaries.send_replace(Arc::clone(&batch));
        batch
    }

    /// Queues `batch`, waiting for room unless cancelled first. Hands the batch back if it
    /// was not queued.
    async fn enqueue(&mut self, batch: Batch, cancel: &CancellationToken) -> Result<(), Batch> {
        let Some(batches) = &self.batches else { return Ok(()) };

        let closed = tokio::select! {
            _ = cancel.cancelled() => return Err(batch),
            permit = batches.reserve() => {
                match permit {
                    Ok(permit) => {
                        permit.send(batch);
                        false
                    }
                    Err(_) => {
                        debug!("Batch queue closed");
                        true
                    }
                }
            }
        };
        if closed {
            self.batches = None;
        }
        Ok(())
    }
}

async fn summarize_loop(
    mut from_handlers: mpsc::Receiver<ProbeResult>,
    interval: Duration,
    mut publisher: Publisher,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut acc = Accumulator::default();
    // Batches published but not queued when the summarizer was stopped.
    let mut unsent = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let batch = publisher.flush(&mut from_handlers, &mut acc);
                if let Err(batch) = publisher.enqueue(batch, &cancel).await {
                    unsent.push(batch);
                    break;
                }
            }
            result = from_handlers.recv() => match result {
                Some(result) => acc.add(&result),
                None => break,
            },
        }
    }

    unsent.push(publisher.flush(&mut from_handlers, &mut acc));

    if let Some(batches) = publisher.batches.take() {
        let count = unsent.len();
        let queue = async {
            for batch in unsent {
                if batches.send(batch).await.is_err() {
                    break;
                }
            }
        };
        if tokio::time::timeout(FINAL_BATCH_TIMEOUT, queue).await.is_err() {
            warn!(count, "Timed out queueing the last summaries");
        }
    }

    debug!("Summarizer stopped");
}
