use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tokio::{net::UdpSocket, sync::mpsc, time::MissedTickBehavior};
use tokio_util::{sync::CancellationToken, udp::UdpFramed};
use tracing::{debug, error, trace, warn};

use udprobe_common::unix_nanos;
use udprobe_wire::{probe::Header, Codec, CodecError, Message};

use super::{PortOptions, PortStats};
use crate::{sys, Probe, ProbeCache, ProbeId, ProbePath, Resolution};

/// Upper bound on emitting the final sweep when a port stops.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// State shared between the tasks of a [`Port`](super::Port).
#[derive(Debug)]
pub(crate) struct Shared {
    pub(crate) socket: Arc<UdpSocket>,
    pub(crate) local_addr: SocketAddr,
    pub(crate) options: PortOptions,
    pub(crate) cache: Arc<ProbeCache>,
    pub(crate) stats: Arc<PortStats>,
    pub(crate) cancel: CancellationToken,
}

/// Returns `true` if probes can be sent to `dst`.
fn is_valid_destination(dst: &SocketAddr) -> bool {
    if dst.port() == 0 {
        return false;
    }

    match dst.ip() {
        IpAddr::V4(ip) => !(ip.is_unspecified() || ip.is_multicast() || ip.is_broadcast()),
        IpAddr::V6(ip) => !(ip.is_unspecified() || ip.is_multicast()),
    }
}

/// Sends `probe` on `completed`, waiting for capacity unless cancelled first.
/// Hands the probe back if it was not delivered.
async fn emit(
    completed: &mpsc::Sender<Probe>,
    cancel: &CancellationToken,
    probe: Probe,
) -> Result<(), Probe> {
    tokio::select! {
        _ = cancel.cancelled() => Err(probe),
        permit = completed.reserve() => match permit {
            Ok(permit) => {
                permit.send(probe);
                Ok(())
            }
            Err(_) => Err(probe),
        },
    }
}

/// Writes one probe per destination received from the port handle.
///
/// The probe is inserted in the cache before it is written, so a reply can never race its
/// cache entry. A probe whose write fails stays in the cache and expires as lost.
pub(crate) async fn send_loop(shared: Arc<Shared>, mut from_port: mpsc::Receiver<SocketAddr>) {
    let Shared { socket, local_addr, options, cache, stats, cancel } = &*shared;
    let tos = options.tos;

    let mut buf = BytesMut::with_capacity(Header::len() + crate::ID_LEN);
    let mut seq = 0u64;

    loop {
        let dst = tokio::select! {
            _ = cancel.cancelled() => break,
            dst = from_port.recv() => match dst {
                Some(dst) => dst,
                None => break,
            },
        };

        if !is_valid_destination(&dst) {
            stats.increment_invalid_destinations();
            debug!(%local_addr, %dst, "Dropping probe to invalid destination");
            continue;
        }

        let id = ProbeId::random();
        let sent_at = unix_nanos();
        let msg = match Message::new(Bytes::copy_from_slice(id.as_bytes()), tos, sent_at) {
            Ok(msg) => msg,
            Err(e) => {
                error!(?e, "Failed to build probe message");
                continue;
            }
        };

        seq += 1;
        let probe = Probe {
            id,
            path: ProbePath { src: local_addr.ip(), dst: dst.ip() },
            dst,
            tos,
            sent_at,
            rcvd_at: 0,
            reflected_at: 0,
            sent_seq: seq,
            rcvd_seq: 0,
        };

        if let Err(e) = cache.insert(probe) {
            error!(%local_addr, %dst, "Discarding probe: {e}");
            continue;
        }

        buf.clear();
        msg.encode(&mut buf);

        match sys::send_to_with_tos(socket, &buf, dst, tos).await {
            Ok(_) => {
                stats.increment_sent();
                trace!(%local_addr, %dst, ?id, seq, "Sent probe");
            }
            Err(e) => {
                stats.increment_send_errors();
                debug!(%local_addr, %dst, error = ?e, "Failed to send probe");
            }
        }
    }

    debug!(%local_addr, "Send loop stopped");
}

/// Reads replies and resolves them against the cache. Matched probes are stamped with the
/// local receive time and the reflector's timestamp, and emitted on `completed`.
pub(crate) async fn recv_loop(shared: Arc<Shared>, completed: mpsc::Sender<Probe>) {
    let Shared { socket, local_addr, options, cache, stats, cancel } = &*shared;

    let mut framed = UdpFramed::new(Arc::clone(socket), Codec::new());

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(options.read_timeout, framed.next()) => next,
        };

        // Read timeout, check for cancellation and read again.
        let Ok(next) = next else { continue };

        let (msg, from) = match next {
            Some(Ok(frame)) => frame,
            Some(Err(CodecError::Decode(e))) => {
                stats.increment_bad_data();
                debug!(%local_addr, "Dropping malformed reply: {e}");
                continue;
            }
            Some(Err(CodecError::Io(e))) => {
                warn!(%local_addr, error = ?e, "Socket read failed");
                continue;
            }
            None => break,
        };

        let Ok(id) = ProbeId::try_from(msg.signature().as_ref()) else {
            stats.increment_bad_data();
            debug!(%local_addr, %from, len = msg.signature().len(), "Reply with foreign signature");
            continue;
        };

        let now = unix_nanos();
        let probe = match cache.resolve(&id, now) {
            Resolution::Matched(mut probe) => {
                probe.rcvd_at = now;
                probe.reflected_at = msg.rcvd();
                probe.rcvd_seq = stats.increment_received();
                trace!(%local_addr, %from, ?id, rtt = ?probe.rtt(), "Matched reply");
                probe
            }
            Resolution::Late(probe) => {
                stats.increment_late();
                debug!(%local_addr, %from, ?id, "Reply arrived after TTL, counting as lost");
                probe
            }
            Resolution::Unknown => {
                stats.increment_unknown_replies();
                debug!(%local_addr, %from, ?id, "Reply for unknown probe");
                continue;
            }
        };

        if emit(&completed, cancel, probe).await.is_err() {
            break;
        }
    }

    debug!(%local_addr, "Receive loop stopped");
}

/// Sweeps the cache every clean interval and emits expired probes as lost. On stop, runs one
/// final sweep and flushes it within [`FINAL_FLUSH_TIMEOUT`].
pub(crate) async fn expiry_loop(shared: Arc<Shared>, completed: mpsc::Sender<Probe>) {
    let Shared { local_addr, options, cache, stats, cancel, .. } = &*shared;

    let mut interval = tokio::time::interval(options.clean_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    // Probes swept but not delivered when the port was stopped.
    let mut pending = Vec::new();

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        let expired = cache.sweep(unix_nanos());
        if expired.is_empty() {
            continue;
        }

        stats.increment_expired(expired.len());
        trace!(%local_addr, count = expired.len(), "Expired probes");

        let mut expired = expired.into_iter();
        while let Some(probe) = expired.next() {
            if let Err(probe) = emit(&completed, cancel, probe).await {
                if completed.is_closed() {
                    return;
                }

                pending.push(probe);
                pending.extend(expired);
                break 'outer;
            }
        }
    }

    let swept = cache.sweep(unix_nanos());
    stats.increment_expired(swept.len());
    pending.extend(swept);

    if pending.is_empty() {
        return;
    }

    let count = pending.len();
    let flush = async {
        for probe in pending {
            if completed.send(probe).await.is_err() {
                break;
            }
        }
    };

    if tokio::time::timeout(FINAL_FLUSH_TIMEOUT, flush).await.is_err() {
        warn!(%local_addr, count, "Timed out flushing expired probes");
    } else {
        debug!(%local_addr, count, "Flushed expired probes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_destinations() {
        assert!(is_valid_destination(&"10.0.0.1:8100".parse().unwrap()));
        assert!(is_valid_destination(&"[::1]:8100".parse().unwrap()));

        assert!(!is_valid_destination(&"10.0.0.1:0".parse().unwrap()));
        assert!(!is_valid_destination(&"0.0.0.0:8100".parse().unwrap()));
        assert!(!is_valid_destination(&"224.0.0.1:8100".parse().unwrap()));
        assert!(!is_valid_destination(&"255.255.255.255:8100".parse().unwrap()));
        assert!(!is_valid_destination(&"[::]:8100".parse().unwrap()));
        assert!(!is_valid_destination(&"[ff02::1]:8100".parse().unwrap()));
    }
}
