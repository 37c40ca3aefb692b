#![doc(issue_tracker_base_url = "https://github.com/chainbound/udprobe/issues/")]

use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

mod cache;
pub use cache::{CacheError, ProbeCache, Resolution};

mod collector;
pub use collector::{Collector, CollectorError};

mod handler;
pub use handler::{ProbeResult, ResultHandler};

pub mod metrics;

mod port;
pub use port::{Port, PortError, PortOptions, PortStats};

mod reflector;
pub use reflector::{Reflector, ReflectorError, ReflectorOptions, ReflectorStats};

mod runner;
pub use runner::TestRunner;

mod summarizer;
pub use summarizer::{summarize, Summarizer, Summary};

mod sys;

/// The default capacity of the queues between pipeline stages.
pub const DEFAULT_CHANNEL_SIZE: usize = 100;

/// The size of a probe correlation ID in bytes.
pub const ID_LEN: usize = 10;

/// The correlation tag of a probe, unique among the probes in flight on a [`Port`].
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeId([u8; ID_LEN]);

impl ProbeId {
    /// Generates a new random ID.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl TryFrom<&[u8]> for ProbeId {
    type Error = std::array::TryFromSliceError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        value.try_into().map(Self)
    }
}

impl fmt::Debug for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProbeId(")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// The path a probe measures: the local address it was sent from, and the reflector it was
/// sent to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbePath {
    pub src: IpAddr,
    pub dst: IpAddr,
}

/// One measurement attempt, from send until it is matched with a reply or expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub id: ProbeId,
    pub path: ProbePath,
    /// The destination the probe was sent to.
    pub dst: SocketAddr,
    pub tos: u8,
    /// Local send time, nanoseconds since the UNIX epoch.
    pub sent_at: u64,
    /// Local receive time of the reply, nanoseconds since the UNIX epoch. Zero if not received.
    pub rcvd_at: u64,
    /// Receive time stamped by the reflector, zero if the reply didn't carry one.
    pub reflected_at: u64,
    pub sent_seq: u64,
    pub rcvd_seq: u64,
}

impl Probe {
    #[inline]
    pub const fn is_received(&self) -> bool {
        self.rcvd_at != 0
    }

    /// The round-trip time, if a reply was received. Clamped at zero if the clock stepped back.
    #[inline]
    pub const fn rtt(&self) -> Option<Duration> {
        if self.is_received() {
            Some(udprobe_common::nanos_between(self.sent_at, self.rcvd_at))
        } else {
            None
        }
    }
}
