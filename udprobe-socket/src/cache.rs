use std::time::Duration;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{Probe, ProbeId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Duplicate probe ID: {0:?}")]
    DuplicateId(ProbeId),
}

/// The outcome of looking up a reply in the [`ProbeCache`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The reply matched an in-flight probe within its TTL.
    Matched(Probe),
    /// The reply matched a probe whose TTL had already passed, but that wasn't swept yet. The
    /// probe is removed and must be reported as lost.
    Late(Probe),
    /// No probe with this ID is in flight: a duplicate, a reply to an already swept probe, or
    /// foreign traffic.
    Unknown,
}

/// The in-flight probes of a single port, keyed by ID, each with a time-to-live.
///
/// Every probe inserted leaves the cache exactly once, either through [`ProbeCache::resolve`] or
/// [`ProbeCache::sweep`]. Both take the same lock, so a probe removed by one is never seen by the
/// other.
#[derive(Debug)]
pub struct ProbeCache {
    ttl: Duration,
    entries: Mutex<FxHashMap<ProbeId, Probe>>,
}

impl ProbeCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(FxHashMap::default()) }
    }

    #[inline]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    #[inline]
    fn is_expired(&self, probe: &Probe, now: u64) -> bool {
        let ttl = u64::try_from(self.ttl.as_nanos()).unwrap_or(u64::MAX);
        probe.sent_at.saturating_add(ttl) <= now
    }

    /// Adds an in-flight probe. Fails if a probe with the same ID is already in flight, in which
    /// case the existing entry is left untouched.
    pub fn insert(&self, probe: Probe) -> Result<(), CacheError> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&probe.id) {
            return Err(CacheError::DuplicateId(probe.id));
        }

        entries.insert(probe.id, probe);
        Ok(())
    }

    /// Removes the probe with the given ID, classifying it against its TTL at `now`
    /// (nanoseconds since the UNIX epoch).
    pub fn resolve(&self, id: &ProbeId, now: u64) -> Resolution {
        let Some(probe) = self.entries.lock().remove(id) else {
            return Resolution::Unknown;
        };

        if self.is_expired(&probe, now) {
            Resolution::Late(probe)
        } else {
            Resolution::Matched(probe)
        }
    }

    /// Removes and returns every probe whose TTL has passed at `now`.
    pub fn sweep(&self, now: u64) -> Vec<Probe> {
        let mut expired = Vec::new();
        self.entries.lock().retain(|_, probe| {
            if self.is_expired(probe, now) {
                expired.push(*probe);
                false
            } else {
                true
            }
        });

        expired
    }

    /// Returns the number of probes in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
