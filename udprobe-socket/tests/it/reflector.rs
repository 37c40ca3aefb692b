use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;

use udprobe_socket::{Reflector, ReflectorOptions};
use udprobe_wire::Message;

use crate::localhost;

async fn start(options: ReflectorOptions) -> Reflector {
    let reflector = Reflector::bind(localhost(), options).await.unwrap();
    tokio::spawn(reflector.clone().run());
    reflector
}

fn probe(signature: &'static [u8], tos: u8) -> Message {
    Message::new(Bytes::from_static(signature), tos, udprobe_common::unix_nanos()).unwrap()
}

async fn recv_reply(client: &UdpSocket) -> Message {
    let mut buf = [0u8; 256];
    let (n, _) = tokio::time::timeout(Duration::from_secs(3), client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    Message::decode(&buf[..n]).unwrap()
}

/// Lets the reflector finish counting the last reply.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn reflects_and_stamps_probe() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = start(ReflectorOptions::default()).await;
    let client = UdpSocket::bind(localhost()).await.unwrap();

    let sent = probe(b"0123456789", 0xb8);
    client.send_to(&sent.to_bytes(), reflector.local_addr()).await.unwrap();

    let reply = recv_reply(&client).await;
    assert_eq!(reply.signature(), sent.signature());
    assert_eq!(reply.sent(), sent.sent());
    assert_eq!(reply.tos(), 0xb8);
    assert_ne!(reply.rcvd(), 0);

    settle().await;
    assert_eq!(reflector.stats().received(), 1);
    assert_eq!(reflector.stats().reflected(), 1);
    assert_eq!(reflector.stats().bad_data(), 0);

    reflector.stop();
}

#[tokio::test]
async fn bad_data_does_not_stop_reflection() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = start(ReflectorOptions::default()).await;
    let client = UdpSocket::bind(localhost()).await.unwrap();

    client.send_to(b"hello world", reflector.local_addr()).await.unwrap();
    let sent = probe(b"abcdefghij", 0);
    client.send_to(&sent.to_bytes(), reflector.local_addr()).await.unwrap();

    let reply = recv_reply(&client).await;
    assert_eq!(reply.signature(), sent.signature());

    settle().await;
    assert_eq!(reflector.stats().received(), 2);
    assert_eq!(reflector.stats().bad_data(), 1);
    assert_eq!(reflector.stats().reflected(), 1);

    reflector.stop();
}

#[tokio::test]
async fn throttling_delays_instead_of_dropping() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = start(ReflectorOptions::default().max_pps(1.0)).await;
    let client = UdpSocket::bind(localhost()).await.unwrap();

    client.send_to(&probe(b"first", 0).to_bytes(), reflector.local_addr()).await.unwrap();
    client.send_to(&probe(b"second", 0).to_bytes(), reflector.local_addr()).await.unwrap();

    let first = recv_reply(&client).await;
    let start = Instant::now();
    assert_eq!(first.signature().as_ref(), b"first");

    let second = recv_reply(&client).await;
    assert_eq!(second.signature().as_ref(), b"second");
    assert!(start.elapsed() >= Duration::from_millis(500), "elapsed {:?}", start.elapsed());

    settle().await;
    assert!(reflector.stats().throttled() >= 1);
    assert_eq!(reflector.stats().reflected(), 2);

    reflector.stop();
}

#[tokio::test]
async fn counts_tos_changes_when_mirroring() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = start(ReflectorOptions::default()).await;
    let client = UdpSocket::bind(localhost()).await.unwrap();

    for tos in [0, 0xb8, 0xb8, 0x20] {
        let sent = probe(b"tos-probe", tos).to_bytes();
        client.send_to(&sent, reflector.local_addr()).await.unwrap();
        assert_eq!(recv_reply(&client).await.tos(), tos);
    }

    settle().await;
    assert_eq!(reflector.stats().tos_changes(), 2);
    reflector.stop();
}

#[tokio::test]
async fn preserves_payload_tos_without_mirroring() {
    let _ = tracing_subscriber::fmt::try_init();

    let reflector = start(ReflectorOptions::default().mirror_tos(false)).await;
    let client = UdpSocket::bind(localhost()).await.unwrap();

    for tos in [0, 0xb8] {
        let sent = probe(b"tos-probe", tos).to_bytes();
        client.send_to(&sent, reflector.local_addr()).await.unwrap();
        assert_eq!(recv_reply(&client).await.tos(), tos);
    }

    settle().await;
    assert_eq!(reflector.stats().tos_changes(), 0);
    assert_eq!(reflector.stats().reflected(), 2);
    reflector.stop();
}
