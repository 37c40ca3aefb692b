use std::sync::atomic::{AtomicU64, Ordering};

/// Statistics for a probing port. These are shared between the port's tasks and the
/// [`Port`](super::Port) handle.
#[derive(Debug, Default)]
pub struct PortStats {
    /// Probes written to the socket.
    sent: AtomicU64,
    /// Replies matched to an in-flight probe within its TTL.
    received: AtomicU64,
    /// Probes that expired without a reply.
    expired: AtomicU64,
    /// Replies that arrived after their probe's TTL.
    late: AtomicU64,
    invalid_destinations: AtomicU64,
    /// Datagrams that failed to decode.
    bad_data: AtomicU64,
    /// Replies without an in-flight probe: duplicates, swept probes or foreign traffic.
    unknown_replies: AtomicU64,
    send_errors: AtomicU64,
}

impl PortStats {
    /// Increments the sent counter, returning the sequence number of this probe.
    #[inline]
    pub(crate) fn increment_sent(&self) -> u64 {
        self.sent.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Increments the received counter, returning the sequence number of this reply.
    #[inline]
    pub(crate) fn increment_received(&self) -> u64 {
        self.received.fetch_add(1, Ordering::Relaxed) + 1
    }

    #[inline]
    pub(crate) fn increment_expired(&self, n: usize) {
        self.expired.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_late(&self) {
        self.late.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_invalid_destinations(&self) {
        self.invalid_destinations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_bad_data(&self) {
        self.bad_data.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_unknown_replies(&self) {
        self.unknown_replies.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn expired(&self) -> u64 {
        self.expired.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn late(&self) -> u64 {
        self.late.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn invalid_destinations(&self) -> u64 {
        self.invalid_destinations.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bad_data(&self) -> u64 {
        self.bad_data.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn unknown_replies(&self) -> u64 {
        self.unknown_replies.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }
}
