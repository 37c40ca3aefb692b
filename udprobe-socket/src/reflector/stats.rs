use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Statistics for a reflector. These are shared between the reflector loop and every clone of
/// the [`Reflector`](super::Reflector) handle.
#[derive(Debug, Default)]
pub struct ReflectorStats {
    /// Datagrams read from the socket.
    received: AtomicU64,
    /// Probes echoed back to their sender.
    reflected: AtomicU64,
    /// Datagrams that failed to decode.
    bad_data: AtomicU64,
    /// Reads that had to wait on the rate limiter first.
    throttled: AtomicU64,
    /// Replies whose ToS differed from the previous reply's.
    tos_changes: AtomicU64,
    send_errors: AtomicU64,
    /// Whether the reflector loop is running.
    up: AtomicBool,
}

/// Marks the reflector as up for as long as it lives.
#[derive(Debug)]
pub(crate) struct UpGuard<'a>(&'a ReflectorStats);

impl Drop for UpGuard<'_> {
    fn drop(&mut self) {
        self.0.up.store(false, Ordering::Relaxed);
    }
}

impl ReflectorStats {
    pub(crate) fn up_guard(&self) -> UpGuard<'_> {
        self.up.store(true, Ordering::Relaxed);
        UpGuard(self)
    }

    #[inline]
    pub(crate) fn increment_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_reflected(&self) {
        self.reflected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_bad_data(&self) {
        self.bad_data.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_tos_changes(&self) {
        self.tos_changes.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_send_errors(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn reflected(&self) -> u64 {
        self.reflected.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bad_data(&self) -> u64 {
        self.bad_data.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn tos_changes(&self) -> u64 {
        self.tos_changes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn send_errors(&self) -> u64 {
        self.send_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }
}
