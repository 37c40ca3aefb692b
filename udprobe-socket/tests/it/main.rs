use std::net::{Ipv4Addr, SocketAddr};

mod collector;
mod pipeline;
mod reflector;

fn localhost() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
}
