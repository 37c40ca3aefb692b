use std::{io, net::SocketAddr, sync::Arc, time::Duration};

use bytes::BytesMut;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use udprobe_common::{constants::MiB, unix_nanos, RateLimiter};
use udprobe_wire::Message;

use crate::sys;

mod stats;
pub use stats::ReflectorStats;

/// Datagrams larger than this can't be valid probes and are read truncated.
const MAX_DATAGRAM_SIZE: usize = 2 * 1024;

#[derive(Debug, Error)]
pub enum ReflectorError {
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
pub struct ReflectorOptions {
    /// Maximum number of probes reflected per second. Non-positive means unlimited.
    pub max_pps: f64,
    pub recv_buffer_size: usize,
    /// Upper bound on a single socket read, after which the loop checks for stop.
    pub read_timeout: Duration,
    /// Whether replies carry the ToS found in the probe payload. When disabled, replies go out
    /// with the socket's own ToS. The payload is echoed unchanged either way.
    pub mirror_tos: bool,
}

impl ReflectorOptions {
    pub fn max_pps(mut self, pps: f64) -> Self {
        self.max_pps = pps;
        self
    }

    pub fn recv_buffer_size(mut self, size: usize) -> Self {
        self.recv_buffer_size = size;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn mirror_tos(mut self, mirror: bool) -> Self {
        self.mirror_tos = mirror;
        self
    }
}

impl Default for ReflectorOptions {
    fn default() -> Self {
        Self {
            max_pps: 5000.0,
            recv_buffer_size: 4 * MiB as usize,
            read_timeout: Duration::from_millis(200),
            mirror_tos: true,
        }
    }
}

/// Echoes probes back to their sender, stamped with the local receive time.
///
/// The reflector is rate limited: before every read it reserves a token and, if the bucket is
/// empty, waits out the delay. Excess probes are delayed, queueing in the socket buffer, and only
/// dropped by the kernel when that buffer overflows.
///
/// The handle is cheap to clone; every clone controls the same reflector.
#[derive(Debug, Clone)]
pub struct Reflector {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    options: Arc<ReflectorOptions>,
    limiter: Arc<RateLimiter>,
    stats: Arc<ReflectorStats>,
    cancel: CancellationToken,
}

impl Reflector {
    pub async fn bind(addr: SocketAddr, options: ReflectorOptions) -> Result<Self, ReflectorError> {
        let socket = sys::bind_udp(addr, options.recv_buffer_size)
            .map_err(|source| ReflectorError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            limiter: Arc::new(RateLimiter::per_second(options.max_pps)),
            options: Arc::new(options),
            stats: Arc::new(ReflectorStats::default()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &ReflectorStats {
        &self.stats
    }

    /// Signals the reflector loop to stop. Idempotent.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Runs the reflector loop until [`Reflector::stop`] is called, or the socket fails with a
    /// non-transient error.
    pub async fn run(self) -> Result<(), ReflectorError> {
        let _up = self.stats.up_guard();
        info!(
            local_addr = %self.local_addr,
            max_pps = self.options.max_pps,
            mirror_tos = self.options.mirror_tos,
            "Reflector running"
        );

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut out = BytesMut::with_capacity(Message::max_size());
        let mut last_tos = None;

        loop {
            let reservation = self.limiter.reserve();
            if !reservation.is_immediate() {
                self.stats.increment_throttled();
                trace!(delay = ?reservation.delay(), "Throttled");

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(reservation.delay()) => {}
                }
            }

            // The token is spent on the next datagram, however long it takes to arrive.
            let (n, from) = loop {
                let res = tokio::select! {
                    _ = self.cancel.cancelled() => return Ok(()),
                    res = tokio::time::timeout(
                        self.options.read_timeout,
                        self.socket.recv_from(&mut buf),
                    ) => res,
                };

                match res {
                    Err(_) => continue,
                    Ok(Ok(read)) => break read,
                    Ok(Err(e)) if is_transient(&e) => {
                        debug!(error = ?e, "Transient socket error");
                    }
                    Ok(Err(e)) => return Err(e.into()),
                }
            };

            self.stats.increment_received();

            let mut msg = match Message::decode(&buf[..n]) {
                Ok(msg) => msg,
                Err(e) => {
                    self.stats.increment_bad_data();
                    debug!(%from, len = n, "Dropping bad data: {e}");
                    continue;
                }
            };

            msg.set_rcvd(unix_nanos());
            out.clear();
            msg.encode(&mut out);

            let sent = if self.options.mirror_tos {
                let tos = msg.tos();
                if last_tos.is_some_and(|last| last != tos) {
                    self.stats.increment_tos_changes();
                }
                last_tos = Some(tos);

                sys::send_to_with_tos(&self.socket, &out, from, tos).await
            } else {
                self.socket.send_to(&out, from).await
            };

            match sent {
                Ok(_) => {
                    self.stats.increment_reflected();
                    trace!(%from, tos = msg.tos(), "Reflected probe");
                }
                Err(e) => {
                    self.stats.increment_send_errors();
                    debug!(%from, error = ?e, "Failed to reflect probe");
                }
            }
        }

        Ok(())
    }
}

/// Errors that concern a single datagram or peer, after which the socket is still usable.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused |
            io::ErrorKind::ConnectionReset |
            io::ErrorKind::Interrupted |
            io::ErrorKind::WouldBlock
    )
}
