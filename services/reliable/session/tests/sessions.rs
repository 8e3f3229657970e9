//! End-to-end sessions over the in-memory transport.

use bytes::Bytes;
use rm_session::{
    ChannelFactory, ListenerConfig, MemoryConnector, ReliableListener, ReliableSession, ReliableSessionConfig, RmError,
    SessionEvent, SessionState, TransportChannel,
};
use rm_wire::{
    CreateSequence, EndpointAddress, FaultBody, FaultCode, Message, MessageBody, ProtocolVersion, SequenceId,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const TIMEOUT: Duration = Duration::from_secs(5);

struct Harness {
    connector: Arc<MemoryConnector>,
    listener: Arc<ReliableListener>,
    pump: JoinHandle<()>,
}

impl Harness {
    fn new(config: ReliableSessionConfig) -> Self {
        let (connector, mut acceptor) = MemoryConnector::new();
        let listener = ReliableListener::new(ListenerConfig {
            session: config,
            local_address: EndpointAddress::new("urn:test:server"),
            ..Default::default()
        });

        let accepting = listener.clone();
        let pump = tokio::spawn(async move {
            while let Some(channel) = acceptor.accept().await {
                let listener = accepting.clone();
                tokio::spawn(async move {
                    let _ = listener.accept_channel(channel).await;
                });
            }
        });

        Self {
            connector,
            listener,
            pump,
        }
    }

    async fn connect(&self, config: ReliableSessionConfig) -> (ReliableSession, ReliableSession) {
        let client = ReliableSession::connect(
            self.connector.clone(),
            EndpointAddress::new("urn:test:server"),
            config,
            TIMEOUT,
        )
        .await
        .unwrap();
        let server = tokio::time::timeout(TIMEOUT, self.listener.accept())
            .await
            .unwrap()
            .unwrap();
        (client, server)
    }

    /// Open a sequence by hand, without a client session driving it
    async fn connect_raw(&self, version: ProtocolVersion) -> (Arc<dyn TransportChannel>, SequenceId, ReliableSession) {
        let channel = self.connector.create_channel().await.unwrap();
        let create = Message::create_sequence(
            version,
            CreateSequence {
                acks_to: EndpointAddress::new("urn:test:raw-client"),
                expires_ms: None,
                offer: None,
            },
        );
        channel.send(create, TIMEOUT).await.unwrap();

        let reply = channel.try_receive(TIMEOUT).await.unwrap().unwrap();
        let MessageBody::CreateSequenceResponse(response) = reply.body else {
            panic!("expected CreateSequenceResponse, got {:?}", reply.action);
        };
        let server = tokio::time::timeout(TIMEOUT, self.listener.accept())
            .await
            .unwrap()
            .unwrap();
        (channel, response.id, server)
    }
}

/// Read from a raw channel until the peer reports a fault
async fn next_fault(channel: &Arc<dyn TransportChannel>) -> FaultBody {
    loop {
        let message = channel.try_receive(TIMEOUT).await.unwrap().unwrap();
        if let MessageBody::Fault(body) = message.body {
            return body;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.listener.close();
        self.pump.abort();
    }
}

fn fast_config(version: ProtocolVersion) -> ReliableSessionConfig {
    ReliableSessionConfig {
        version,
        acknowledgement_interval: Duration::from_millis(10),
        initial_retry_interval: Duration::from_millis(50),
        max_retry_interval: Duration::from_millis(200),
        request_retry_interval: Duration::from_millis(500),
        reconnect_backoff_max: Duration::from_millis(50),
        ..Default::default()
    }
}

fn payload(i: u64) -> Bytes {
    Bytes::from(format!("message-{}", i))
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

/// Drops the first transmission of message `number` on the outbound sequence
fn drop_first(number: u64) -> Arc<dyn Fn(&Message) -> bool + Send + Sync> {
    let dropped = Arc::new(AtomicBool::new(false));
    Arc::new(move |message: &Message| {
        let hit = message
            .headers
            .sequence
            .as_ref()
            .map_or(false, |header| header.number == number);
        hit && !dropped.swap(true, Ordering::SeqCst)
    })
}

#[tokio::test]
async fn test_lossless_exchange_is_fully_acknowledged() {
    let config = fast_config(ProtocolVersion::WsReliableMessaging11);
    let harness = Harness::new(config.clone());
    let (client, server) = harness.connect(config).await;

    for i in 1..=3 {
        assert_eq!(client.send(payload(i), TIMEOUT).await.unwrap(), i);
    }
    for i in 1..=3 {
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }

    wait_until(|| client.pending_count() == 0).await;
    assert_eq!(server.received_ranges().as_deref(), Some("{[1-3]}"));
    assert_eq!(client.stats().messages_sent, 3);
    assert_eq!(client.stats().retries, 0);
    assert!(client.stats().acks_received >= 1);
}

#[tokio::test]
async fn test_lost_message_is_retransmitted_in_order() {
    let config = ReliableSessionConfig {
        initial_retry_interval: Duration::from_millis(400),
        max_retry_interval: Duration::from_millis(800),
        ..fast_config(ProtocolVersion::WsReliableMessaging11)
    };
    let harness = Harness::new(config.clone());
    harness.connector.set_client_drop_filter(drop_first(2));
    let (client, server) = harness.connect(config).await;

    for i in 1..=3 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }

    wait_until(|| server.received_ranges().as_deref() == Some("{[1],[3]}")).await;
    for i in 1..=3 {
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }

    wait_until(|| client.pending_count() == 0).await;
    assert_eq!(server.received_ranges().as_deref(), Some("{[1-3]}"));
    assert!(client.stats().retries >= 1);
}

#[tokio::test]
async fn test_close_handshake_completes_both_sequences() {
    let config = fast_config(ProtocolVersion::WsReliableMessaging11);
    let harness = Harness::new(config.clone());
    let (client, server) = harness.connect(config).await;
    let mut client_events = client.subscribe();

    for i in 1..=5 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }
    server.send(Bytes::from_static(b"reply"), TIMEOUT).await.unwrap();

    let (client_closed, server_closed) = tokio::join!(client.close(TIMEOUT), server.close(TIMEOUT));
    client_closed.unwrap();
    server_closed.unwrap();

    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(server.state(), SessionState::Closed);
    for i in 1..=5 {
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), None);
    assert_eq!(client.receive(TIMEOUT).await.unwrap(), Some(Bytes::from_static(b"reply")));
    assert_eq!(client.receive(TIMEOUT).await.unwrap(), None);

    loop {
        match client_events.recv().await.unwrap() {
            SessionEvent::Closed => break,
            SessionEvent::Faulted(err) => panic!("client faulted during close: {}", err),
            _ => {}
        }
    }
    assert_eq!(
        client.send(payload(6), TIMEOUT).await.unwrap_err(),
        RmError::Disposed
    );
}

#[tokio::test]
async fn test_february_2005_last_message_close() {
    let config = fast_config(ProtocolVersion::WsrmFebruary2005);
    let harness = Harness::new(config.clone());
    let (client, server) = harness.connect(config).await;
    assert_eq!(server.version(), ProtocolVersion::WsrmFebruary2005);

    for i in 1..=3 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }

    let (client_closed, server_closed) = tokio::join!(client.close(TIMEOUT), server.close(TIMEOUT));
    client_closed.unwrap();
    server_closed.unwrap();

    for i in 1..=3 {
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), None);
    assert_eq!(server.received_ranges().as_deref(), Some("{[1-4]}"));
}

#[tokio::test]
async fn test_retry_exhaustion_faults_session() {
    let config = ReliableSessionConfig {
        max_retry_count: 2,
        initial_retry_interval: Duration::from_millis(20),
        max_retry_interval: Duration::from_millis(40),
        ..fast_config(ProtocolVersion::WsReliableMessaging11)
    };
    let harness = Harness::new(config.clone());
    harness
        .connector
        .set_client_drop_filter(Arc::new(|message: &Message| message.headers.sequence.is_some()));
    let (client, server) = harness.connect(config).await;
    let mut events = client.subscribe();

    let waiting = {
        let client = client.clone();
        tokio::spawn(async move { client.receive(TIMEOUT).await })
    };

    assert_eq!(client.send(payload(1), TIMEOUT).await.unwrap(), 1);

    let fault = loop {
        match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
            SessionEvent::Faulted(err) => break err,
            _ => {}
        }
    };
    assert!(matches!(fault, RmError::Communication(_)));
    assert_eq!(client.state(), SessionState::Faulted);

    let pending = waiting.await.unwrap().unwrap_err();
    assert!(matches!(pending, RmError::Faulted(ref inner) if matches!(**inner, RmError::Communication(_))));

    let late = client.send(payload(2), TIMEOUT).await.unwrap_err();
    assert!(matches!(late, RmError::Faulted(_)));

    wait_until(|| server.state() == SessionState::Faulted).await;
}

#[tokio::test]
async fn test_session_survives_reconnection() {
    let config = fast_config(ProtocolVersion::WsReliableMessaging11);
    let harness = Harness::new(config.clone());
    let (client, server) = harness.connect(config).await;
    let mut events = client.subscribe();

    for i in 1..=2 {
        client.send(payload(i), TIMEOUT).await.unwrap();
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }

    harness.connector.latest_client().unwrap().inject_fault();

    loop {
        match tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap() {
            SessionEvent::Reconnected => break,
            SessionEvent::Faulted(err) => panic!("session faulted instead of reconnecting: {}", err),
            _ => {}
        }
    }
    assert_eq!(harness.connector.connection_count(), 2);

    for i in 3..=5 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }
    for i in 3..=5 {
        assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(i)));
    }
    wait_until(|| client.pending_count() == 0).await;

    server.send(Bytes::from_static(b"after reconnect"), TIMEOUT).await.unwrap();
    assert_eq!(
        client.receive(TIMEOUT).await.unwrap(),
        Some(Bytes::from_static(b"after reconnect"))
    );
    assert_eq!(client.state(), SessionState::Opened);
    assert_eq!(server.state(), SessionState::Opened);
}

#[tokio::test]
async fn test_unordered_delivery_releases_each_message_once() {
    let config = ReliableSessionConfig {
        ordered: false,
        initial_retry_interval: Duration::from_millis(300),
        max_retry_interval: Duration::from_millis(600),
        ..fast_config(ProtocolVersion::WsReliableMessaging11)
    };
    let harness = Harness::new(config.clone());
    harness.connector.set_client_drop_filter(drop_first(1));
    let (client, server) = harness.connect(config).await;

    for i in 1..=4 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }

    let mut received = Vec::new();
    for _ in 1..=4 {
        received.push(server.receive(TIMEOUT).await.unwrap().unwrap());
    }
    assert_eq!(received[0], payload(2));
    received.sort();
    assert_eq!(received, (1..=4).map(payload).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_drained_buffer_is_re_advertised() {
    let config = ReliableSessionConfig {
        max_transfer_window_size: 2,
        ..fast_config(ProtocolVersion::WsReliableMessaging11)
    };
    let harness = Harness::new(config.clone());
    let (client, server) = harness.connect(config).await;

    for i in 1..=2 {
        client.send(payload(i), TIMEOUT).await.unwrap();
    }
    wait_until(|| client.pending_count() == 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let acks_before = server.stats().acks_sent;

    // The last acknowledgement advertised a full buffer; taking a message frees a slot
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(1)));
    wait_until(|| server.stats().acks_sent > acks_before).await;

    client.send(payload(3), TIMEOUT).await.unwrap();
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(2)));
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(3)));
}

#[tokio::test]
async fn test_duplicate_is_acknowledged_not_redelivered() {
    let config = fast_config(ProtocolVersion::WsReliableMessaging11);
    let harness = Harness::new(config.clone());
    let dropped = Arc::new(AtomicBool::new(false));
    harness.connector.set_server_drop_filter(Arc::new(move |message: &Message| {
        message.headers.acknowledgement.is_some() && !dropped.swap(true, Ordering::SeqCst)
    }));
    let (client, server) = harness.connect(config).await;

    client.send(payload(1), TIMEOUT).await.unwrap();
    wait_until(|| client.pending_count() == 0).await;
    assert!(client.stats().retries >= 1);
    assert!(server.stats().duplicates >= 1);
    assert_eq!(server.stats().messages_received, 1);

    client.send(payload(2), TIMEOUT).await.unwrap();
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(1)));
    assert_eq!(server.receive(TIMEOUT).await.unwrap(), Some(payload(2)));
    assert_eq!(server.received_ranges().as_deref(), Some("{[1-2]}"));
}

#[tokio::test]
async fn test_close_below_highest_received_faults() {
    let version = ProtocolVersion::WsReliableMessaging11;
    let harness = Harness::new(fast_config(version));
    let (channel, id, server) = harness.connect_raw(version).await;

    for i in 1..=3 {
        channel.send(Message::sequenced(version, id, i, payload(i)), TIMEOUT).await.unwrap();
    }
    wait_until(|| server.received_ranges().as_deref() == Some("{[1-3]}")).await;

    channel.send(Message::close_sequence(version, id, 2), TIMEOUT).await.unwrap();
    let fault = next_fault(&channel).await;
    assert_eq!(fault.code, FaultCode::SequenceTerminated);
    assert_eq!(fault.id, Some(id));
    wait_until(|| server.state() == SessionState::Faulted).await;
}

#[tokio::test]
async fn test_conflicting_close_faults() {
    let version = ProtocolVersion::WsReliableMessaging11;
    let harness = Harness::new(fast_config(version));
    let (channel, id, server) = harness.connect_raw(version).await;

    channel.send(Message::sequenced(version, id, 1, payload(1)), TIMEOUT).await.unwrap();
    let close = Message::close_sequence(version, id, 1);
    let close_id = close.id();
    channel.send(close, TIMEOUT).await.unwrap();
    loop {
        let message = channel.try_receive(TIMEOUT).await.unwrap().unwrap();
        if let MessageBody::CloseSequenceResponse(closed) = message.body {
            assert_eq!(closed, id);
            assert_eq!(message.headers.relates_to, Some(close_id));
            break;
        }
    }

    channel.send(Message::close_sequence(version, id, 4), TIMEOUT).await.unwrap();
    let fault = next_fault(&channel).await;
    assert_eq!(fault.code, FaultCode::SequenceTerminated);
    wait_until(|| server.state() == SessionState::Faulted).await;
}

#[tokio::test]
async fn test_message_past_last_message_is_rejected() {
    let version = ProtocolVersion::WsrmFebruary2005;
    let harness = Harness::new(fast_config(version));
    let (channel, id, server) = harness.connect_raw(version).await;
    assert_eq!(server.version(), version);

    channel.send(Message::sequenced(version, id, 1, payload(1)), TIMEOUT).await.unwrap();
    channel.send(Message::last_message(version, id, 2), TIMEOUT).await.unwrap();
    wait_until(|| server.received_ranges().as_deref() == Some("{[1-2]}")).await;

    channel.send(Message::sequenced(version, id, 3, payload(3)), TIMEOUT).await.unwrap();
    let fault = next_fault(&channel).await;
    assert_eq!(fault.code, FaultCode::LastMessageNumberExceeded);
    assert_eq!(fault.id, Some(id));
    wait_until(|| server.state() == SessionState::Faulted).await;
}
