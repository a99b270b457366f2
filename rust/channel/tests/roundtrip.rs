//! End-to-end exchange between a service and clients through a live
//! nameserver, all inside one process. Signal delivery is off and the
//! buses are driven through the synchronous drain, so the test does not
//! depend on process-directed signal routing.

use shmbus_channel::{Bus, BusEvent, Nameserver};
use shmbus_core::{BusConfig, BusError, CancelToken};
use std::thread;
use std::time::Duration;

fn test_config(tag: &str) -> BusConfig {
    let dir = tempfile::tempdir().unwrap();
    BusConfig {
        shm_prefix: format!("shmbus-it-{}-{}", std::process::id(), tag),
        runtime_dir: dir.keep(),
        deliver_signals: false,
        reply_timeout: Duration::from_secs(2),
        ..BusConfig::default()
    }
}

struct NsHandle {
    cancel: CancelToken,
    thread: Option<thread::JoinHandle<()>>,
}

fn spawn_nameserver(config: &BusConfig) -> NsHandle {
    let mut ns = Nameserver::start(config.clone()).unwrap();
    let cancel = CancelToken::new();
    let stop = cancel.clone();
    let thread = thread::spawn(move || ns.run(&stop).unwrap());
    NsHandle {
        cancel,
        thread: Some(thread),
    }
}

impl Drop for NsHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

#[test]
fn test_service_client_roundtrip() {
    let config = test_config("roundtrip");
    let _ns = spawn_nameserver(&config);

    let service = Bus::new(config.clone()).unwrap();
    let slots = service.init_service("echo", 2).unwrap();
    assert_eq!(slots.len(), 2);

    let client = Bus::new(config.clone()).unwrap();
    let c_slot = client.connect_client("cli", "echo").unwrap();
    client.write_bytes(c_slot, b"ping").unwrap();

    // One drain observes the handshake strictly before the data
    assert_eq!(service.drain_now(), 2);
    let events = service.events();
    match events.try_recv().unwrap() {
        BusEvent::NewConnection { slot, peer } => {
            assert_eq!(slot, slots[0]);
            assert_eq!(peer.name, "cli");
            assert_eq!(peer.pid, std::process::id() as i32);
        }
        other => panic!("expected a connection first, got {other:?}"),
    }
    match events.try_recv().unwrap() {
        BusEvent::NewData { slot, items } => {
            assert_eq!(slot, slots[0]);
            assert_eq!(items, 1);
        }
        other => panic!("expected data second, got {other:?}"),
    }

    let s_slot = slots[0];
    assert_eq!(service.read_bytes(s_slot, 64).unwrap().as_ref(), b"ping");
    // The handshake never counts as payload
    assert_eq!(service.bytes_read(s_slot).unwrap(), 4);

    // Reply routed by the name learned from the handshake
    service.send("cli", b"pong").unwrap();
    assert_eq!(client.drain_now(), 1);
    assert_eq!(client.read_bytes(c_slot, 64).unwrap().as_ref(), b"pong");

    let stats = service.channel_stats(s_slot).unwrap();
    assert!(stats.connected);
    assert_eq!(stats.owner.as_deref(), Some("echo"));
    assert_eq!(stats.bytes_written, 4);
}

#[test]
fn test_lookup_rejections() {
    let config = test_config("reject");
    let _ns = spawn_nameserver(&config);

    let service = Bus::new(config.clone()).unwrap();
    service.init_service("solo", 1).unwrap();

    let client = Bus::new(config.clone()).unwrap();
    assert!(matches!(
        client.connect_client("c0", "ghost").unwrap_err(),
        BusError::UnknownService(name) if name == "ghost"
    ));

    // The single reserved channel goes to the first client
    client.connect_client("c1", "solo").unwrap();
    assert!(matches!(
        client.connect_client("c2", "solo").unwrap_err(),
        BusError::ServiceBusy(_)
    ));
}

#[test]
fn test_two_clients_two_channels() {
    let config = test_config("pair");
    let _ns = spawn_nameserver(&config);

    let service = Bus::new(config.clone()).unwrap();
    let slots = service.init_service("fanin", 2).unwrap();

    let client = Bus::new(config.clone()).unwrap();
    let a = client.connect_client("alice", "fanin").unwrap();
    let b = client.connect_client("bob", "fanin").unwrap();
    client.write_bytes(a, b"from-alice").unwrap();
    client.write_bytes(b, b"from-bob").unwrap();

    service.drain_now();
    assert_eq!(
        service.read_bytes(slots[0], 64).unwrap().as_ref(),
        b"from-alice"
    );
    assert_eq!(
        service.read_bytes(slots[1], 64).unwrap().as_ref(),
        b"from-bob"
    );

    // Replies go out on distinct channels by peer name
    service.send("alice", b"hi-alice").unwrap();
    service.send("bob", b"hi-bob").unwrap();
    client.drain_now();
    assert_eq!(client.read_bytes(a, 64).unwrap().as_ref(), b"hi-alice");
    assert_eq!(client.read_bytes(b, 64).unwrap().as_ref(), b"hi-bob");
}
