//! End-to-end delivery tests over real sockets.

use super::*;
use crate::listener::{BroadcastReport, DeliveryReport, ListenerError};
use crate::message::AckPolicy;
use crate::record::DeliveryState;
use pushgate_net::{FrameConfig, FrameDecoder, TransportBackend, encode_frame};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::time::Instant;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Delivery(ConnectionId, MessageId, DeliveryOutcome),
    Broadcast(BroadcastId, BTreeMap<ConnectionId, DeliveryOutcome>),
}

struct EventSink {
    tx: mpsc::Sender<Event>,
}

impl EventSink {
    fn send(&self, report: &DeliveryReport) -> Result<(), ListenerError> {
        let _ = self.tx.send(Event::Delivery(
            report.connection,
            report.message.id,
            report.outcome,
        ));
        Ok(())
    }
}

impl PushListener for EventSink {
    fn on_success(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
    fn on_ack_success(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
    fn on_broadcast_complete(&self, r: &BroadcastReport) -> Result<(), ListenerError> {
        let _ = self.tx.send(Event::Broadcast(r.broadcast, r.outcomes.clone()));
        Ok(())
    }
    fn on_failure(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
    fn on_offline(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
    fn on_redirect(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
    fn on_timeout(&self, r: &DeliveryReport) -> Result<(), ListenerError> {
        self.send(r)
    }
}

struct Harness {
    gateway: PushGateway,
    events: mpsc::Receiver<Event>,
    addr: SocketAddr,
}

impl Harness {
    fn start(ack_timeout: Duration) -> Self {
        let config = GatewayConfig {
            server: ServerConfig {
                bind_addr: "127.0.0.1:0".parse().unwrap(),
                transport: TransportBackend::Portable,
                worker_threads: 2,
                shutdown_grace: Duration::from_secs(1),
                ..ServerConfig::default()
            },
            ack_timeout,
        };
        let gateway = PushGateway::new(config);
        let (tx, events) = mpsc::channel();
        gateway.register_listener(Arc::new(EventSink { tx }), 0);
        gateway.init().unwrap();

        let (bound_tx, bound_rx) = mpsc::channel();
        gateway
            .start(move |result| {
                let _ = bound_tx.send(result);
            })
            .unwrap();
        let addr = bound_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap()
            .unwrap();
        Self {
            gateway,
            events,
            addr,
        }
    }

    /// Connect a client and wait for the server to register it.
    fn connect(&self) -> (Client, ConnectionId) {
        let before: BTreeSet<ConnectionId> = self.gateway.registry().ids().into_iter().collect();
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let fresh = self
                .gateway
                .registry()
                .ids()
                .into_iter()
                .find(|id| !before.contains(id));
            if let Some(id) = fresh {
                return (Client::new(stream), id);
            }
            assert!(Instant::now() < deadline, "connection never registered");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn next_event(&self) -> Event {
        self.events
            .recv_timeout(Duration::from_secs(5))
            .expect("no delivery event")
    }

    fn assert_quiet(&self, wait: Duration) {
        if let Ok(event) = self.events.recv_timeout(wait) {
            panic!("unexpected event {event:?}");
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        if self.gateway.is_running() {
            let _ = self.gateway.stop(|_| {});
        }
    }
}

struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    config: FrameConfig,
}

impl Client {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            decoder: FrameDecoder::new(FrameConfig::default()),
            config: FrameConfig::default(),
        }
    }

    fn read_frame(&mut self) -> Frame {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return frame;
            }
            let n = self.stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "server closed the connection");
            self.decoder.feed(&buf[..n]);
        }
    }

    fn ack(&mut self, id: MessageId) {
        let bytes = encode_frame(&Frame::ack(id), &self.config).unwrap();
        self.stream.write_all(&bytes).unwrap();
    }

    fn assert_closed(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    panic!("connection still open")
                }
                Err(_) => return,
            }
        }
    }
}

#[test]
fn test_ack_within_window_reports_ack_success() {
    let h = Harness::start(Duration::from_millis(500));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(1, b"hello".to_vec()), conn)
        .unwrap();
    assert_eq!(
        client.read_frame(),
        Frame::data(MessageId(1), b"hello".to_vec())
    );
    client.ack(MessageId(1));

    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(1), DeliveryOutcome::AckSuccess)
    );
    // The cancelled timer never reports a timeout.
    h.assert_quiet(Duration::from_millis(800));
    assert_eq!(h.gateway.tracker().outstanding(), 0);
}

#[test]
fn test_missing_ack_times_out_once() {
    let h = Harness::start(Duration::from_millis(300));
    let (mut client, conn) = h.connect();

    let dispatched = Instant::now();
    h.gateway
        .dispatch(PushMessage::new(2, b"ping".to_vec()), conn)
        .unwrap();
    client.read_frame();

    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(2), DeliveryOutcome::Timeout)
    );
    assert!(dispatched.elapsed() >= Duration::from_millis(300));
    assert_eq!(h.gateway.tracker().outstanding(), 0);

    // A late ack is ignored.
    client.ack(MessageId(2));
    h.assert_quiet(Duration::from_millis(300));
}

#[test]
fn test_dispatch_to_absent_target_is_offline() {
    let h = Harness::start(Duration::from_millis(300));
    h.gateway
        .dispatch(PushMessage::new(3, b"void".to_vec()), ConnectionId(9999))
        .unwrap();
    assert_eq!(
        h.next_event(),
        Event::Delivery(ConnectionId(9999), MessageId(3), DeliveryOutcome::Offline)
    );
    assert_eq!(h.gateway.tracker().outstanding(), 0);
}

#[test]
fn test_disconnect_mid_flight_resolves_offline() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(4, b"bye".to_vec()), conn)
        .unwrap();
    client.read_frame();
    drop(client);

    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(4), DeliveryOutcome::Offline)
    );
    h.assert_quiet(Duration::from_millis(200));
}

#[test]
fn test_broadcast_ack_timeout_and_absent_targets() {
    let h = Harness::start(Duration::from_millis(400));
    let (mut first, c1) = h.connect();
    let (mut second, c2) = h.connect();
    let absent = ConnectionId(9999);

    let broadcast = h
        .gateway
        .dispatch_broadcast(PushMessage::new(50, b"all".to_vec()), [c1, c2, absent])
        .unwrap();
    assert_eq!(broadcast, BroadcastId(50));

    first.read_frame();
    first.ack(MessageId(50));
    second.read_frame();

    let events: Vec<Event> = (0..4).map(|_| h.next_event()).collect();
    for expected in [
        Event::Delivery(c1, MessageId(50), DeliveryOutcome::AckSuccess),
        Event::Delivery(c2, MessageId(50), DeliveryOutcome::Timeout),
        Event::Delivery(absent, MessageId(50), DeliveryOutcome::Offline),
    ] {
        assert!(events[..3].contains(&expected), "missing {expected:?}");
    }
    assert_eq!(
        events[3],
        Event::Broadcast(
            BroadcastId(50),
            BTreeMap::from([
                (c1, DeliveryOutcome::AckSuccess),
                (c2, DeliveryOutcome::Timeout),
                (absent, DeliveryOutcome::Offline),
            ])
        )
    );
    h.assert_quiet(Duration::from_millis(300));
    assert_eq!(h.gateway.tracker().broadcasts().pending(), 0);
}

#[test]
fn test_empty_broadcast_completes_immediately() {
    let h = Harness::start(Duration::from_millis(300));
    h.gateway
        .dispatch_broadcast(PushMessage::new(51, Vec::new()), Vec::new())
        .unwrap();
    assert_eq!(
        h.next_event(),
        Event::Broadcast(BroadcastId(51), BTreeMap::new())
    );
}

#[test]
fn test_duplicate_dispatch_rejected() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(7, b"once".to_vec()), conn)
        .unwrap();
    let again = h.gateway.dispatch(PushMessage::new(7, b"twice".to_vec()), conn);
    assert!(matches!(again, Err(DispatchError::Duplicate(_))));

    client.read_frame();
    client.ack(MessageId(7));
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(7), DeliveryOutcome::AckSuccess)
    );
}

#[test]
fn test_no_ack_message_succeeds_on_write() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    let message = PushMessage::new(8, b"fire-and-forget".to_vec()).with_ack(AckPolicy::None);
    h.gateway.dispatch(message, conn).unwrap();
    client.read_frame();
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(8), DeliveryOutcome::Success)
    );
}

#[test]
fn test_redirect_resolves_and_closes() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(9, b"move".to_vec()), conn)
        .unwrap();
    client.read_frame();

    assert_eq!(h.gateway.redirect(conn).unwrap(), 1);
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(9), DeliveryOutcome::Redirect)
    );
    client.assert_closed();
    h.assert_quiet(Duration::from_millis(200));
    assert!(matches!(
        h.gateway.redirect(conn),
        Err(DispatchError::NotConnected(_))
    ));
}

#[test]
fn test_close_connection_resolves_offline() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(10, b"closing".to_vec()), conn)
        .unwrap();
    client.read_frame();
    h.gateway.close_connection(conn).unwrap();

    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(10), DeliveryOutcome::Offline)
    );
    client.assert_closed();
}

#[test]
fn test_large_payload_arrives_intact() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    let payload = b"compressible ".repeat(1000);
    h.gateway
        .dispatch(PushMessage::new(11, payload.clone()), conn)
        .unwrap();
    let frame = client.read_frame();
    assert_eq!(frame.payload, payload);
    client.ack(MessageId(11));
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(11), DeliveryOutcome::AckSuccess)
    );
}

#[test]
fn test_oversized_payload_fails_without_closing() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    let oversized: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    h.gateway
        .dispatch(PushMessage::new(12, oversized), conn)
        .unwrap();
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(12), DeliveryOutcome::Failure)
    );

    // The connection stays usable.
    h.gateway
        .dispatch(PushMessage::new(13, b"small".to_vec()), conn)
        .unwrap();
    assert_eq!(client.read_frame().message_id, MessageId(13));
}

#[test]
fn test_panicking_listener_does_not_block_delivery_events() {
    struct Broken;
    impl PushListener for Broken {
        fn on_offline(&self, _report: &DeliveryReport) -> Result<(), ListenerError> {
            panic!("broken listener");
        }
    }

    let h = Harness::start(Duration::from_millis(300));
    h.gateway.register_listener(Arc::new(Broken), -10);
    h.gateway
        .dispatch(PushMessage::new(14, Vec::new()), ConnectionId(4242))
        .unwrap();
    assert_eq!(
        h.next_event(),
        Event::Delivery(ConnectionId(4242), MessageId(14), DeliveryOutcome::Offline)
    );
}

#[test]
fn test_stop_resolves_outstanding_and_fails_later_dispatches() {
    let h = Harness::start(Duration::from_secs(5));
    let (mut client, conn) = h.connect();

    h.gateway
        .dispatch(PushMessage::new(15, b"pending".to_vec()), conn)
        .unwrap();
    client.read_frame();

    let mut released = None;
    h.gateway.stop(|r| released = Some(r.is_ok())).unwrap();
    assert_eq!(released, Some(true));
    assert!(!h.gateway.is_running());
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(15), DeliveryOutcome::Offline)
    );
    assert_eq!(h.gateway.tracker().outstanding(), 0);

    h.gateway
        .dispatch(PushMessage::new(16, b"late".to_vec()), conn)
        .unwrap();
    assert_eq!(
        h.next_event(),
        Event::Delivery(conn, MessageId(16), DeliveryOutcome::Failure)
    );

    assert_eq!(
        h.gateway.stop(|_| {}),
        Err(LifecycleError::AlreadyShutdown)
    );
    h.assert_quiet(Duration::from_millis(200));
}

#[tokio::test]
async fn test_transport_error_disconnect_resolves_failure() {
    let tracker = DeliveryTracker::new(Duration::from_secs(5));
    let (tx, events) = mpsc::channel();
    tracker.listeners().register(Arc::new(EventSink { tx }), 0);
    let handler = DeliveryHandler {
        tracker: tracker.clone(),
    };

    for id in [1, 2] {
        let message = Arc::new(PushMessage::new(id, b"in flight".to_vec()));
        tracker.track(message, ConnectionId(id), None).unwrap();
        handler.on_write(ConnectionId(id), MessageId(id), Ok(()));
    }
    assert_eq!(
        tracker.state(DeliveryKey::new(ConnectionId(1), MessageId(1))),
        Some(DeliveryState::AwaitingAck)
    );

    let reset = DisconnectReason::Transport("Connection reset by peer".to_string());
    handler.on_disconnect(ConnectionId(1), &reset);
    handler.on_disconnect(ConnectionId(2), &DisconnectReason::PeerClosed);

    assert_eq!(
        events.try_recv().unwrap(),
        Event::Delivery(ConnectionId(1), MessageId(1), DeliveryOutcome::Failure)
    );
    assert_eq!(
        events.try_recv().unwrap(),
        Event::Delivery(ConnectionId(2), MessageId(2), DeliveryOutcome::Offline)
    );
    assert_eq!(tracker.outstanding(), 0);
}

#[test]
fn test_full_outbound_queue_resolves_failure() {
    let config = GatewayConfig {
        server: ServerConfig {
            outbound_queue: 1,
            ..ServerConfig::default()
        },
        ack_timeout: Duration::from_secs(5),
    };
    let gateway = PushGateway::new(config);
    let (tx, events) = mpsc::channel();
    gateway.register_listener(Arc::new(EventSink { tx }), 0);

    // Registered, but nothing drains its queue.
    let conn = ConnectionId(7);
    let peer = "127.0.0.1:5000".parse().unwrap();
    let _mailbox = gateway
        .registry()
        .register(Arc::new(Connection::new(conn, peer)))
        .unwrap();

    gateway
        .dispatch(PushMessage::new(1, b"first".to_vec()), conn)
        .unwrap();
    gateway
        .dispatch(PushMessage::new(2, b"second".to_vec()), conn)
        .unwrap();

    assert_eq!(
        events.try_recv().unwrap(),
        Event::Delivery(conn, MessageId(2), DeliveryOutcome::Failure)
    );
    assert!(events.try_recv().is_err());
    assert_eq!(
        gateway.tracker().state(DeliveryKey::new(conn, MessageId(1))),
        Some(DeliveryState::Dispatched)
    );
}
