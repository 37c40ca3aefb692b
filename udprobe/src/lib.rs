#![doc(issue_tracker_base_url = "https://github.com/chainbound/udprobe/issues/")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

pub use udprobe_common::{RateLimiter, Reservation};
pub use udprobe_config as config;
pub use udprobe_socket::*;
pub use udprobe_wire::{Codec, CodecError, Message};

use tracing_subscriber::EnvFilter;

/// Installs the global `fmt` subscriber, filtered by `RUST_LOG` and defaulting to `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
