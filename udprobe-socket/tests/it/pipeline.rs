use std::time::Duration;

use tokio::{net::UdpSocket, sync::mpsc};

use udprobe_common::unix_nanos;
use udprobe_socket::{Port, PortOptions, Reflector, ReflectorOptions};

use crate::localhost;

#[tokio::test]
async fn probe_through_live_reflector() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = Reflector::bind(localhost(), ReflectorOptions::default()).await.unwrap();
    tokio::spawn(reflector.clone().run());

    let (tx, mut rx) = mpsc::channel(16);
    let port = Port::bind(localhost(), PortOptions::default().tos(0x20), tx).await.unwrap();

    assert!(port.probe(reflector.local_addr()).await);

    let probe = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert!(probe.is_received());
    assert!(probe.rtt().is_some());
    assert_ne!(probe.reflected_at, 0);
    assert!(probe.reflected_at >= probe.sent_at);
    assert_eq!(probe.tos, 0x20);
    assert_eq!(probe.dst, reflector.local_addr());
    assert_eq!(probe.path.dst, reflector.local_addr().ip());
    assert_eq!((probe.sent_seq, probe.rcvd_seq), (1, 1));

    // Counters are updated after the reply is handed over.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(port.cache().is_empty());
    assert_eq!(port.stats().sent(), 1);
    assert_eq!(port.stats().received(), 1);
    assert_eq!(reflector.stats().reflected(), 1);

    port.stop().await;
    reflector.stop();
}

#[tokio::test]
async fn malformed_replies_are_counted_and_skipped() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = Reflector::bind(localhost(), ReflectorOptions::default()).await.unwrap();
    tokio::spawn(reflector.clone().run());

    let (tx, mut rx) = mpsc::channel(16);
    let port = Port::bind(localhost(), PortOptions::default(), tx).await.unwrap();

    let noise = UdpSocket::bind(localhost()).await.unwrap();
    noise.send_to(b"", port.local_addr()).await.unwrap();
    noise.send_to(b"not a reply", port.local_addr()).await.unwrap();
    noise.send_to(b"", port.local_addr()).await.unwrap();

    assert!(port.probe(reflector.local_addr()).await);
    let probe = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert!(probe.is_received());

    assert_eq!(port.stats().bad_data(), 3);
    assert_eq!(port.stats().unknown_replies(), 0);

    port.stop().await;
    reflector.stop();
}

#[tokio::test]
async fn unanswered_probe_expires_after_ttl() {
    let _ = tracing_subscriber::fmt::try_init();

    let silent = UdpSocket::bind(localhost()).await.unwrap();
    let ttl = Duration::from_millis(300);

    let (tx, mut rx) = mpsc::channel(16);
    let options = PortOptions::default().ttl(ttl).clean_interval(Duration::from_millis(50));
    let port = Port::bind(localhost(), options, tx).await.unwrap();

    port.probe(silent.local_addr().unwrap()).await;

    let probe = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
    assert!(!probe.is_received());
    assert_eq!(probe.rtt(), None);
    assert!(unix_nanos() >= probe.sent_at + ttl.as_nanos() as u64);

    assert!(port.cache().is_empty());
    assert_eq!(port.stats().expired(), 1);

    port.stop().await;
}

#[tokio::test]
async fn invalid_destinations_create_no_cache_entry() {
    let _ = tracing_subscriber::fmt::try_init();

    let (tx, _rx) = mpsc::channel(16);
    let port = Port::bind(localhost(), PortOptions::default(), tx).await.unwrap();

    port.probe("0.0.0.0:8100".parse().unwrap()).await;
    port.probe("127.0.0.1:0".parse().unwrap()).await;
    port.probe("224.0.0.1:8100".parse().unwrap()).await;

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(port.cache().is_empty());
    assert_eq!(port.stats().invalid_destinations(), 3);
    assert_eq!(port.stats().sent(), 0);

    port.stop().await;
}

#[tokio::test]
async fn stop_flushes_expired_probes() {
    let _ = tracing_subscriber::fmt::try_init();

    let silent = UdpSocket::bind(localhost()).await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    // The periodic sweep never fires during the test.
    let options = PortOptions::default()
        .ttl(Duration::from_millis(50))
        .clean_interval(Duration::from_secs(3600));
    let port = Port::bind(localhost(), options, tx).await.unwrap();

    port.probe(silent.local_addr().unwrap()).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(port.cache().len(), 1);

    port.stop().await;

    let probe = rx.try_recv().unwrap();
    assert!(!probe.is_received());
    assert!(port.cache().is_empty());
}
