#![doc(issue_tracker_base_url = "https://github.com/chainbound/udprobe/issues/")]

pub mod probe;
pub use probe::{Codec, CodecError, Message};
