use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use udprobe_config::PortConfig;

use crate::{sys, Probe, ProbeCache, DEFAULT_CHANNEL_SIZE};

mod driver;
mod stats;
use driver::Shared;
pub use stats::PortStats;

/// The default receive buffer size of a probing socket.
const DEFAULT_RECV_BUFFER_SIZE: usize = 2_097_600;

/// The shortest timer period a port accepts. Zero periods would spin.
const MIN_PERIOD: Duration = Duration::from_millis(1);

#[derive(Debug, Error)]
pub enum PortError {
    #[error("IO error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct PortOptions {
    /// The ToS value every probe sent from this port carries.
    pub tos: u8,
    /// How long a probe waits for its reply before it is counted as lost.
    pub ttl: Duration,
    /// How often the cache is swept for expired probes.
    pub clean_interval: Duration,
    /// Upper bound on a single socket read, after which the receive loop iterates.
    pub read_timeout: Duration,
    pub recv_buffer_size: usize,
    /// Capacity of the destination queue feeding the send loop.
    pub queue_size: usize,
}

impl PortOptions {
    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = tos;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn clean_interval(mut self, interval: Duration) -> Self {
        self.clean_interval = interval.max(MIN_PERIOD);
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.max(MIN_PERIOD);
        self
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn queue_size(mut self, size: usize) -> Self {
        self.queue_size = size.max(1);
        self
    }
}

impl Default for PortOptions {
    fn default() -> Self {
        Self {
            tos: 0,
            ttl: Duration::from_secs(2),
            clean_interval: Duration::from_secs(5),
            read_timeout: Duration::from_millis(200),
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
            queue_size: DEFAULT_CHANNEL_SIZE,
        }
    }
}

impl From<&PortConfig> for PortOptions {
    /// The configured timeout drives the probe TTL, the sweep interval and the read timeout.
    fn from(cfg: &PortConfig) -> Self {
        let timeout = cfg.timeout();
        Self::default().tos(cfg.tos).ttl(timeout).clean_interval(timeout).read_timeout(timeout)
    }
}

/// A UDP socket that sends probes with one ToS value and matches their replies.
///
/// Binding a port spawns three tasks: a send loop fed by [`Port::sender`], a receive loop
/// resolving replies against the port's [`ProbeCache`], and an expiry loop sweeping probes that
/// outlived their TTL. Every probe sent ends up on the `completed` queue exactly once, received
/// or not, unless the port is stopped first.
#[derive(Debug)]
pub struct Port {
    local_addr: SocketAddr,
    tos: u8,
    /// Destination queue of the send loop.
    to_driver: mpsc::Sender<SocketAddr>,
    cache: Arc<ProbeCache>,
    stats: Arc<PortStats>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Port {
    /// Binds a new port on `addr` and starts its tasks. Completed probes are sent on
    /// `completed`.
    pub async fn bind(
        addr: SocketAddr,
        options: PortOptions,
        completed: mpsc::Sender<Probe>,
    ) -> Result<Self, PortError> {
        let socket = sys::bind_udp(addr, options.recv_buffer_size)
            .map_err(|source| PortError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        let cache = Arc::new(ProbeCache::new(options.ttl));
        let stats = Arc::new(PortStats::default());
        let cancel = CancellationToken::new();
        let (to_driver, from_port) = mpsc::channel(options.queue_size);

        let shared = Arc::new(Shared {
            socket: Arc::new(socket),
            local_addr,
            options: options.clone(),
            cache: Arc::clone(&cache),
            stats: Arc::clone(&stats),
            cancel: cancel.clone(),
        });

        let tasks = vec![
            tokio::spawn(driver::send_loop(Arc::clone(&shared), from_port)),
            tokio::spawn(driver::recv_loop(Arc::clone(&shared), completed.clone())),
            tokio::spawn(driver::expiry_loop(shared, completed)),
        ];

        debug!(%local_addr, tos = options.tos, ttl = ?options.ttl, "Port bound");

        Ok(Self {
            local_addr,
            tos: options.tos,
            to_driver,
            cache,
            stats,
            cancel,
            tasks: Mutex::new(tasks),
        })
    }

    /// Returns a handle to enqueue probe destinations on. Enqueueing waits for capacity.
    pub fn sender(&self) -> mpsc::Sender<SocketAddr> {
        self.to_driver.clone()
    }

    /// Enqueues one probe to `dst`, waiting for queue capacity.
    pub async fn probe(&self, dst: SocketAddr) -> bool {
        self.to_driver.send(dst).await.is_ok()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tos(&self) -> u8 {
        self.tos
    }

    pub fn stats(&self) -> &PortStats {
        &self.stats
    }

    /// The probes currently in flight on this port.
    pub fn cache(&self) -> &ProbeCache {
        &self.cache
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stops all loops and waits for them to exit. The expiry loop emits one last sweep of
    /// expired probes first; probes younger than their TTL are dropped. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(local_addr = %self.local_addr, "Port task failed: {:?}", e);
            }
        }
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
