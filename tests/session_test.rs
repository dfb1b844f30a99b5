/// Session state machine tests over the in-memory transport

use ecla::{
    transport::MemoryFrame, BeaconPacket, ConnectionState, Ecla, EclaError, EventSink,
    ForwardDataPacket, MemoryConnector, MemoryPeer, Packet, RegisteredPacket,
};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

const DAEMON: &str = "127.0.0.1:3000";

fn registered() -> RegisteredPacket {
    RegisteredPacket {
        eid: json!([1, "//node1/"]),
        node_id: "dtn://node1/".to_string(),
    }
}

fn spawn_dial(ecla: &Ecla) -> JoinHandle<Result<(), EclaError>> {
    let driver = ecla.clone();
    tokio::spawn(async move { driver.dial(DAEMON).await })
}

async fn wait_for_state(ecla: &Ecla, state: ConnectionState) {
    let mut status = ecla.watch_status();
    tokio::time::timeout(Duration::from_secs(30), status.wait_for(|s| s.state == state))
        .await
        .expect("timed out waiting for state")
        .expect("status channel closed");
}

async fn next_peer(peers: &mut mpsc::UnboundedReceiver<MemoryPeer>) -> MemoryPeer {
    tokio::time::timeout(Duration::from_secs(30), peers.recv())
        .await
        .expect("timed out waiting for a connection")
        .expect("connector dropped")
}

/// Dial and complete the registration handshake
async fn connected(
    ecla: &Ecla,
    peers: &mut mpsc::UnboundedReceiver<MemoryPeer>,
) -> (JoinHandle<Result<(), EclaError>>, MemoryPeer) {
    let drive = spawn_dial(ecla);
    let mut peer = next_peer(peers).await;
    peer.accept_registration(registered()).await.expect("register packet");
    wait_for_state(ecla, ConnectionState::Connected).await;
    (drive, peer)
}

#[tokio::test]
async fn test_registration_handshake() {
    let (connector, mut peers) = MemoryConnector::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let (registered_tx, mut registered_rx) = mpsc::unbounded_channel();

    let counter = calls.clone();
    let ecla = Ecla::builder("NATS", true)
        .connector(connector.clone())
        .on_registered(move |packet| {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = registered_tx.send(packet);
        })
        .build()
        .unwrap();

    assert_eq!(ecla.state(), ConnectionState::BeforeOpen);

    let drive = spawn_dial(&ecla);
    let mut peer = next_peer(&mut peers).await;
    let register = peer.accept_registration(registered()).await.unwrap();
    assert_eq!(register.name, "NATS");
    assert!(register.enable_beacon);

    wait_for_state(&ecla, ConnectionState::Connected).await;
    assert_eq!(registered_rx.recv().await.unwrap(), registered());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(connector.dialed_addresses(), vec![DAEMON]);

    ecla.close().await.unwrap();
    assert_eq!(drive.await.unwrap(), Ok(()));
    assert!(ecla.status().terminated);
}

#[tokio::test(start_paused = true)]
async fn test_initial_reconnect_retries_with_backoff() {
    let (connector, mut peers) = MemoryConnector::new();
    connector.fail_next(3);

    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .initial_reconnect(true)
        .build()
        .unwrap();

    let start = Instant::now();
    let drive = spawn_dial(&ecla);
    let mut peer = next_peer(&mut peers).await;

    assert!(start.elapsed() >= Duration::from_secs(3));
    assert_eq!(connector.attempts(), 4);
    assert!(matches!(peer.recv_packet().await, Some(Packet::Register(_))));
    wait_for_state(&ecla, ConnectionState::AwaitingRegistration).await;
    assert!(!drive.is_finished());

    ecla.close().await.unwrap();
    assert_eq!(drive.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_initial_open_failure_without_retry() {
    let (connector, _peers) = MemoryConnector::new();
    connector.fail_next(1);

    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .build()
        .unwrap();

    let err = ecla.dial(DAEMON).await.unwrap_err();
    assert_eq!(err, EclaError::transport_open(DAEMON, "connection refused"));
    assert_eq!(ecla.state(), ConnectionState::BeforeOpen);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(ecla.last_error(), Some(err));
}

#[tokio::test]
async fn test_dial_again_after_failed_first_open() {
    let (connector, mut peers) = MemoryConnector::new();
    connector.fail_next(1);

    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .build()
        .unwrap();

    let err = ecla.dial(DAEMON).await.unwrap_err();
    assert_eq!(err.error_code(), "TRANSPORT_OPEN_ERROR");
    assert!(!ecla.status().terminated);

    let (drive, _peer) = connected(&ecla, &mut peers).await;
    assert_eq!(connector.attempts(), 2);
    assert_eq!(ecla.dial(DAEMON).await, Err(EclaError::AlreadyDialing));

    ecla.close().await.unwrap();
    assert_eq!(drive.await.unwrap(), Ok(()));
    assert_eq!(ecla.dial(DAEMON).await, Err(EclaError::AlreadyDialing));
}

#[tokio::test]
async fn test_error_packet_during_registration_is_fatal() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("dup", false)
        .connector(connector)
        .reconnect(true)
        .build()
        .unwrap();

    let drive = spawn_dial(&ecla);
    let mut peer = next_peer(&mut peers).await;
    assert!(matches!(peer.recv_packet().await, Some(Packet::Register(_))));
    peer.send(&Packet::Error(ecla::ErrorPacket {
        reason: "module name already taken".to_string(),
    }))
    .unwrap();

    let err = drive.await.unwrap().unwrap_err();
    assert_eq!(err.to_string(), "module name already taken");
    assert_eq!(ecla.state(), ConnectionState::Failed("module name already taken".to_string()));

    let status = ecla.status();
    assert_eq!(status.last_error, Some(EclaError::protocol("module name already taken")));
    assert!(!status.transport_open);
    assert!(status.terminated);
}

#[tokio::test]
async fn test_error_packet_while_connected_is_fatal() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .reconnect(true)
        .build()
        .unwrap();

    let (drive, peer) = connected(&ecla, &mut peers).await;
    peer.send(&Packet::Error(ecla::ErrorPacket {
        reason: "daemon shutting down".to_string(),
    }))
    .unwrap();

    let err = drive.await.unwrap().unwrap_err();
    assert_eq!(err, EclaError::protocol("daemon shutting down"));
    assert!(ecla.state().is_terminal());
}

#[tokio::test]
async fn test_inbound_packets_are_stamped_with_local_id() {
    let (connector, mut peers) = MemoryConnector::new();
    let (beacon_tx, mut beacons) = mpsc::unbounded_channel();
    let (forward_tx, mut forwards) = mpsc::unbounded_channel();

    let ecla = Ecla::builder("mod", true)
        .connector(connector)
        .id_provider(|| "local".to_string())
        .on_beacon(move |packet| {
            let _ = beacon_tx.send(packet);
        })
        .on_forward_data(move |packet| {
            let _ = forward_tx.send(packet);
        })
        .build()
        .unwrap();

    let (_drive, peer) = connected(&ecla, &mut peers).await;

    peer.send(&BeaconPacket::new("X", json!("dtn://remote/"), "svc").into())
        .unwrap();
    peer.send(&ForwardDataPacket::new("remote", "local", "payload").into())
        .unwrap();

    let beacon = beacons.recv().await.unwrap();
    assert_eq!(beacon.addr, "local");
    assert_eq!(beacon.eid, json!("dtn://remote/"));
    assert_eq!(beacon.service_block, "svc");

    let forward = forwards.recv().await.unwrap();
    assert_eq!(forward.src, "local");
    assert_eq!(forward.dst, "local");
    assert_eq!(forward.payload, "payload");
}

#[tokio::test]
async fn test_default_identity_is_fixed_per_session() {
    let (connector, mut peers) = MemoryConnector::new();
    let (beacon_tx, mut beacons) = mpsc::unbounded_channel();

    let ecla = Ecla::builder("mod", true)
        .connector(connector)
        .on_beacon(move |packet| {
            let _ = beacon_tx.send(packet);
        })
        .build()
        .unwrap();

    let local_id = ecla.local_id().to_string();
    assert!(local_id.parse::<u64>().is_ok());

    let (_drive, peer) = connected(&ecla, &mut peers).await;
    for addr in ["a", "b"] {
        peer.send(&BeaconPacket::new(addr, json!(null), "").into()).unwrap();
    }

    assert_eq!(beacons.recv().await.unwrap().addr, local_id);
    assert_eq!(beacons.recv().await.unwrap().addr, local_id);
}

#[tokio::test]
async fn test_undecodable_and_unexpected_frames_are_ignored() {
    let (connector, mut peers) = MemoryConnector::new();
    let (beacon_tx, mut beacons) = mpsc::unbounded_channel();

    let ecla = Ecla::builder("mod", true)
        .connector(connector)
        .on_beacon(move |packet| {
            let _ = beacon_tx.send(packet);
        })
        .build()
        .unwrap();

    let drive = spawn_dial(&ecla);
    let mut peer = next_peer(&mut peers).await;
    assert!(matches!(peer.recv_packet().await, Some(Packet::Register(_))));

    // before registration
    peer.send_raw("garbage").unwrap();
    peer.send(&BeaconPacket::new("early", json!(null), "").into()).unwrap();
    peer.send(&Packet::Registered(registered())).unwrap();
    wait_for_state(&ecla, ConnectionState::Connected).await;

    // while connected
    peer.send_raw(r#"{"no_type":true}"#).unwrap();
    peer.send_raw(r#"{"type":"IdentPacket","name":"x"}"#).unwrap();
    peer.send_raw(r#"{"type":"Beacon","addr":"missing fields"}"#).unwrap();
    peer.send(&Packet::Registered(registered())).unwrap();
    peer.send(&BeaconPacket::new("late", json!(null), "").into()).unwrap();

    let beacon = beacons.recv().await.unwrap();
    assert_eq!(beacon.addr, ecla.local_id());
    assert!(beacons.try_recv().is_err());
    assert_eq!(ecla.state(), ConnectionState::Connected);
    assert!(!drive.is_finished());
}

#[tokio::test]
async fn test_insert_before_dial_is_noop() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .build()
        .unwrap();

    ecla.insert_forward_data(ForwardDataPacket::new("a", "b", "early"));
    ecla.insert_beacon(BeaconPacket::new("a", json!(null), ""));
    assert_eq!(ecla.state(), ConnectionState::BeforeOpen);
    assert!(ecla.last_error().is_none());

    let (_drive, mut peer) = connected(&ecla, &mut peers).await;
    ecla.insert_forward_data(ForwardDataPacket::new("a", "b", "late"));

    match peer.recv_packet().await {
        Some(Packet::ForwardData(packet)) => assert_eq!(packet.payload, "late"),
        other => panic!("unexpected packet: {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_inserts_are_not_interleaved() {
    const SENDERS: usize = 64;

    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", true)
        .connector(connector)
        .build()
        .unwrap();

    let (_drive, mut peer) = connected(&ecla, &mut peers).await;

    let mut senders = Vec::new();
    for i in 0..SENDERS {
        let ecla = ecla.clone();
        senders.push(tokio::spawn(async move {
            ecla.insert_beacon(BeaconPacket::new(format!("node-{}", i), json!(i), "x".repeat(256)));
        }));
    }
    for sender in senders {
        sender.await.unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..SENDERS {
        match peer.recv().await {
            Some(MemoryFrame::Text(text)) => match ecla::packet::decode(&text).unwrap() {
                ecla::Decoded::Packet(Packet::Beacon(beacon)) => {
                    assert_eq!(beacon.service_block.len(), 256);
                    seen.insert(beacon.addr);
                }
                other => panic!("unexpected packet: {:?}", other),
            },
            other => panic!("unexpected frame: {:?}", other),
        }
    }
    assert_eq!(seen.len(), SENDERS);
}

#[tokio::test]
async fn test_second_dial_is_rejected() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .build()
        .unwrap();

    let (drive, _peer) = connected(&ecla, &mut peers).await;
    assert_eq!(ecla.dial("10.0.0.1:4000").await, Err(EclaError::AlreadyDialing));

    ecla.close().await.unwrap();
    drive.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_after_drop_keeps_address() {
    let (connector, mut peers) = MemoryConnector::new();
    let registrations = Arc::new(AtomicUsize::new(0));

    let counter = registrations.clone();
    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .reconnect(true)
        .on_registered(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build()
        .unwrap();

    let (drive, peer) = connected(&ecla, &mut peers).await;
    connector.fail_next(2);
    drop(peer);

    let mut peer = next_peer(&mut peers).await;
    peer.accept_registration(registered()).await.unwrap();
    wait_for_state(&ecla, ConnectionState::Connected).await;

    assert_eq!(registrations.load(Ordering::SeqCst), 2);
    assert_eq!(connector.attempts(), 4);
    assert!(connector.dialed_addresses().iter().all(|addr| addr == DAEMON));

    ecla.close().await.unwrap();
    assert_eq!(drive.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn test_drop_without_reconnect_returns_read_error() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .build()
        .unwrap();

    let (drive, peer) = connected(&ecla, &mut peers).await;
    peer.close();

    let err = drive.await.unwrap().unwrap_err();
    assert_eq!(err, EclaError::frame_read("closed by peer"));
    assert_eq!(ecla.state(), ConnectionState::Connected);
    assert!(!ecla.status().transport_open);
}

#[tokio::test]
async fn test_drop_before_registration_reconnects_by_default() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .build()
        .unwrap();
    assert!(!ecla.config().reconnect);

    let drive = spawn_dial(&ecla);
    let mut peer = next_peer(&mut peers).await;
    assert!(matches!(peer.recv_packet().await, Some(Packet::Register(_))));
    drop(peer);

    let mut peer = next_peer(&mut peers).await;
    peer.accept_registration(registered()).await.unwrap();
    wait_for_state(&ecla, ConnectionState::Connected).await;
    assert_eq!(connector.attempts(), 2);

    ecla.close().await.unwrap();
    drive.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_drop_before_registration_without_retry_policy() {
    let (connector, mut peers) = MemoryConnector::new();
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .retry_registration(false)
        .build()
        .unwrap();

    let drive = spawn_dial(&ecla);
    let peer = next_peer(&mut peers).await;
    drop(peer);

    let err = drive.await.unwrap().unwrap_err();
    assert_eq!(err.error_code(), "FRAME_READ_ERROR");
    assert_eq!(ecla.state(), ConnectionState::AwaitingRegistration);
}

#[tokio::test(start_paused = true)]
async fn test_close_times_out_when_loop_is_stuck() {
    let (connector, mut peers) = MemoryConnector::new();
    let connector = connector.with_close_echo(false);
    let ecla = Ecla::builder("mod", false)
        .connector(connector)
        .build()
        .unwrap();

    let (drive, mut peer) = connected(&ecla, &mut peers).await;

    let start = Instant::now();
    let err = ecla.close().await.unwrap_err();
    let elapsed = start.elapsed();

    assert_eq!(err, EclaError::CloseTimeout { duration: Duration::from_secs(1) });
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_millis(1100));
    assert_eq!(peer.recv().await, Some(MemoryFrame::Close));
    assert!(!drive.is_finished());

    // nothing is accepted for writing once the close frame is out
    let status = ecla.status();
    assert!(!status.transport_open);
    assert_eq!(status.state, ConnectionState::Connected);
    ecla.insert_beacon(BeaconPacket::new("late", json!(null), ""));
    assert!(peer.try_recv().is_none());

    // the peer finishing the handshake releases the loop
    peer.close();
    assert_eq!(drive.await.unwrap(), Ok(()));
    assert_eq!(peer.recv().await, None);
}

#[tokio::test]
async fn test_close_never_dialed_session() {
    let ecla = Ecla::new("mod", false).unwrap();
    ecla.close().await.unwrap();
    assert!(!ecla.status().terminated);
}

#[tokio::test(start_paused = true)]
async fn test_close_while_backing_off() {
    let (connector, _peers) = MemoryConnector::new();
    connector.fail_next(usize::MAX);

    let ecla = Ecla::builder("mod", false)
        .connector(connector.clone())
        .initial_reconnect(true)
        .backoff(Duration::from_secs(60))
        .build()
        .unwrap();

    let drive = spawn_dial(&ecla);
    let mut status = ecla.watch_status();
    status.wait_for(|s| s.last_error.is_some()).await.unwrap();

    ecla.close().await.unwrap();
    assert_eq!(drive.await.unwrap(), Ok(()));
    assert_eq!(connector.attempts(), 1);
}

struct Recorder {
    beacons: mpsc::UnboundedSender<BeaconPacket>,
}

impl EventSink for Recorder {
    fn on_beacon(&self, packet: BeaconPacket) {
        let _ = self.beacons.send(packet);
    }

    fn local_id(&self) -> Option<String> {
        Some("recorder".to_string())
    }
}

#[tokio::test]
async fn test_event_sink_implementation() {
    let (connector, mut peers) = MemoryConnector::new();
    let (beacon_tx, mut beacons) = mpsc::unbounded_channel();

    let ecla = Ecla::builder("mod", true)
        .connector(connector)
        .event_sink(Recorder { beacons: beacon_tx })
        .build()
        .unwrap();

    let (_drive, peer) = connected(&ecla, &mut peers).await;
    peer.send(&BeaconPacket::new("remote", json!(null), "").into()).unwrap();
    assert_eq!(beacons.recv().await.unwrap().addr, "recorder");
}

#[test]
fn test_event_sink_and_closures_are_exclusive() {
    let (beacon_tx, _beacons) = mpsc::unbounded_channel();
    let err = Ecla::builder("mod", true)
        .on_registered(|_| {})
        .event_sink(Recorder { beacons: beacon_tx })
        .build()
        .unwrap_err();
    assert_eq!(err.error_code(), "CONFIG_ERROR");

    assert!(Ecla::builder("", true).build().is_err());
}
