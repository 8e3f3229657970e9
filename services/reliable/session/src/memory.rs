//! In-process duplex channels with scripted loss and fault injection.
//!
//! Messages still pass through a [`MessageEncoder`], so every exchange is
//! validated exactly as on a real wire. A [`MemoryConnector`] hands out the
//! client ends of fresh pairs and delivers the server ends to a
//! [`MemoryAcceptor`], which is how reconnection is exercised without
//! sockets.

use crate::error::TransportError;
use crate::transport::{ChannelFactory, ChannelShape, TransportChannel};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rm_wire::{CborEncoder, EndpointAddress, Message, MessageEncoder, DEFAULT_MAX_MESSAGE_SIZE};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

/// Predicate selecting outgoing messages to drop silently
pub type DropFilter = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndState {
    Opened,
    Closed,
    Faulted,
}

/// One end of an in-memory duplex channel
pub struct MemoryChannel {
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    state: watch::Sender<EndState>,
    encoder: Arc<dyn MessageEncoder>,
    drop_filter: Mutex<Option<DropFilter>>,
    sent: AtomicU64,
    dropped: AtomicU64,
    local: EndpointAddress,
    remote: EndpointAddress,
}

impl MemoryChannel {
    /// Create a connected pair of ends named `a` and `b`
    pub fn pair(a: &str, b: &str) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let encoder: Arc<dyn MessageEncoder> = Arc::new(CborEncoder::new());
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let a_addr = EndpointAddress::new(format!("mem://{}", a));
        let b_addr = EndpointAddress::new(format!("mem://{}", b));

        let end = |tx, rx, local: &EndpointAddress, remote: &EndpointAddress| {
            Arc::new(MemoryChannel {
                outbound: Mutex::new(Some(tx)),
                inbound: tokio::sync::Mutex::new(rx),
                state: watch::channel(EndState::Opened).0,
                encoder: encoder.clone(),
                drop_filter: Mutex::new(None),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                local: local.clone(),
                remote: remote.clone(),
            })
        };

        (end(a_tx, a_rx, &a_addr, &b_addr), end(b_tx, b_rx, &b_addr, &a_addr))
    }

    /// Drop outgoing messages matching `filter`
    pub fn set_drop_filter(&self, filter: DropFilter) {
        *self.drop_filter.lock() = Some(filter);
    }

    /// Stop dropping messages
    pub fn clear_drop_filter(&self) {
        self.drop_filter.lock().take();
    }

    /// Fault this end; the peer observes end-of-stream
    pub fn inject_fault(&self) {
        debug!("Injecting fault on {}", self.local);
        self.outbound.lock().take();
        self.state.send_replace(EndState::Faulted);
    }

    /// Messages handed to the peer
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Messages dropped by the filter
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn current(&self) -> EndState {
        *self.state.borrow()
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Duplex
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        match self.current() {
            EndState::Opened => Ok(()),
            _ => Err(TransportError::Closed),
        }
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        self.outbound.lock().take();
        self.state.send_if_modified(|s| {
            if *s == EndState::Opened {
                *s = EndState::Closed;
                true
            } else {
                false
            }
        });
        Ok(())
    }

    fn abort(&self) {
        self.outbound.lock().take();
        self.state.send_if_modified(|s| {
            if *s == EndState::Opened {
                *s = EndState::Faulted;
                true
            } else {
                false
            }
        });
    }

    async fn send(&self, message: Message, _timeout: Duration) -> Result<(), TransportError> {
        if self.current() != EndState::Opened {
            return Err(TransportError::Closed);
        }

        let bytes = self.encoder.encode(&message, DEFAULT_MAX_MESSAGE_SIZE)?;

        let filter = self.drop_filter.lock().clone();
        if filter.map_or(false, |f| f(&message)) {
            trace!("Dropping {:?} on {}", message.action, self.local);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let outbound = self.outbound.lock();
        match outbound.as_ref() {
            Some(tx) if tx.send(bytes).is_ok() => {
                self.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            _ => Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "peer end is gone",
            ))),
        }
    }

    async fn try_receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        match self.current() {
            EndState::Opened => {}
            EndState::Closed => return Ok(None),
            EndState::Faulted => return Err(TransportError::Closed),
        }

        let mut state = self.state.subscribe();
        let received = tokio::select! {
            r = tokio::time::timeout(timeout, async { self.inbound.lock().await.recv().await }) => r,
            _ = state.wait_for(|s| *s != EndState::Opened) => {
                return match self.current() {
                    EndState::Closed => Ok(None),
                    _ => Err(TransportError::Closed),
                };
            }
        };

        match received {
            Ok(Some(bytes)) => Ok(Some(self.encoder.decode(&bytes, self.encoder.content_type())?)),
            Ok(None) => {
                debug!("Peer of {} went away", self.local);
                self.state.send_replace(EndState::Faulted);
                Ok(None)
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn faulted(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s != EndState::Opened).await;
    }

    fn remote_address(&self) -> EndpointAddress {
        self.remote.clone()
    }

    fn local_address(&self) -> EndpointAddress {
        self.local.clone()
    }
}

/// Receives the server ends created by a [`MemoryConnector`]
pub struct MemoryAcceptor {
    rx: mpsc::UnboundedReceiver<Arc<MemoryChannel>>,
}

impl MemoryAcceptor {
    /// Wait for the next server end
    pub async fn accept(&mut self) -> Option<Arc<MemoryChannel>> {
        self.rx.recv().await
    }
}

/// Channel factory producing fresh in-memory pairs
pub struct MemoryConnector {
    tx: mpsc::UnboundedSender<Arc<MemoryChannel>>,
    connections: AtomicUsize,
    refuse_next: AtomicUsize,
    clients: Mutex<Vec<Arc<MemoryChannel>>>,
    client_filter: Mutex<Option<DropFilter>>,
    server_filter: Mutex<Option<DropFilter>>,
}

impl MemoryConnector {
    /// Create a connector and the acceptor that receives its server ends
    pub fn new() -> (Arc<MemoryConnector>, MemoryAcceptor) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(MemoryConnector {
                tx,
                connections: AtomicUsize::new(0),
                refuse_next: AtomicUsize::new(0),
                clients: Mutex::new(Vec::new()),
                client_filter: Mutex::new(None),
                server_filter: Mutex::new(None),
            }),
            MemoryAcceptor { rx },
        )
    }

    /// Fail the next `count` connection attempts
    pub fn refuse_next(&self, count: usize) {
        self.refuse_next.store(count, Ordering::SeqCst);
    }

    /// Apply `filter` to every client end created from now on
    pub fn set_client_drop_filter(&self, filter: DropFilter) {
        *self.client_filter.lock() = Some(filter);
    }

    /// Apply `filter` to every server end created from now on
    pub fn set_server_drop_filter(&self, filter: DropFilter) {
        *self.server_filter.lock() = Some(filter);
    }

    /// Connections established so far
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Most recently created client end
    pub fn latest_client(&self) -> Option<Arc<MemoryChannel>> {
        self.clients.lock().last().cloned()
    }
}

#[async_trait]
impl ChannelFactory for MemoryConnector {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            )));
        }

        let n = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        let (client, server) = MemoryChannel::pair(&format!("client-{}", n), &format!("server-{}", n));
        if let Some(filter) = self.client_filter.lock().clone() {
            client.set_drop_filter(filter);
        }
        if let Some(filter) = self.server_filter.lock().clone() {
            server.set_drop_filter(filter);
        }
        self.tx.send(server).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "no acceptor",
            ))
        })?;
        self.clients.lock().push(client.clone());
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rm_wire::{ProtocolVersion, SequenceId};

    fn message(n: u64) -> Message {
        Message::sequenced(
            ProtocolVersion::WsReliableMessaging11,
            SequenceId::generate(),
            n,
            Bytes::from(format!("m{}", n)),
        )
    }

    #[tokio::test]
    async fn test_pair_exchange_and_loss() {
        let (a, b) = MemoryChannel::pair("a", "b");
        a.set_drop_filter(Arc::new(|m: &Message| m.headers.sequence.as_ref().map(|s| s.number) == Some(2)));

        for n in 1..=3 {
            a.send(message(n), Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(a.dropped_count(), 1);
        assert_eq!(a.sent_count(), 2);

        let first = b.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        let second = b.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(first.headers.sequence.unwrap().number, 1);
        assert_eq!(second.headers.sequence.unwrap().number, 3);
        assert!(matches!(
            b.try_receive(Duration::from_millis(10)).await,
            Err(TransportError::Timeout)
        ));
    }

    #[tokio::test]
    async fn test_fault_gives_peer_eof() {
        let (a, b) = MemoryChannel::pair("a", "b");
        a.inject_fault();

        assert!(a.send(message(1), Duration::from_secs(1)).await.is_err());
        assert!(b.try_receive(Duration::from_secs(1)).await.unwrap().is_none());
        tokio::time::timeout(Duration::from_secs(1), b.faulted()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), a.faulted()).await.unwrap();
    }

    #[tokio::test]
    async fn test_connector_delivers_server_ends() {
        let (connector, mut acceptor) = MemoryConnector::new();
        connector.refuse_next(1);
        assert!(connector.create_channel().await.is_err());

        let client = connector.create_channel().await.unwrap();
        let server = acceptor.accept().await.unwrap();
        assert_eq!(client.remote_address(), server.local_address());
        assert_eq!(connector.connection_count(), 1);
    }
}
