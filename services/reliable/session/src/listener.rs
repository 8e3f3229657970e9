//! Server-side listener.
//!
//! Reads the first message of every accepted channel. A CreateSequence
//! starts a new session; anything else names a sequence and reattaches the
//! channel to the session that owns it (a client reconnecting after its
//! previous channel was lost).

use crate::config::ReliableSessionConfig;
use crate::error::{RmError, SequenceFault};
use crate::session::{ReliableSession, SessionEvent, SessionState};
use crate::transport::{accept_tcp, TransportChannel};
use dashmap::DashMap;
use rm_wire::{EndpointAddress, FaultCode, Message, MessageBody, MessageEncoder, SequenceId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Listener configuration
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Settings applied to every accepted session
    pub session: ReliableSessionConfig,
    /// Address used when a CreateSequence carries no `To`
    pub local_address: EndpointAddress,
    /// Concurrent sessions before CreateSequence is refused
    pub max_sessions: usize,
    /// How long a new channel may stay silent before it is dropped
    pub first_message_timeout: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            session: ReliableSessionConfig::default(),
            local_address: EndpointAddress::new("urn:rm:listener"),
            max_sessions: 1024,
            first_message_timeout: Duration::from_secs(30),
        }
    }
}

/// Accepts channels and hands out server sessions
pub struct ReliableListener {
    config: ListenerConfig,
    /// Keyed by both the inbound and the outbound sequence id
    sessions: DashMap<SequenceId, ReliableSession>,
    accepted_tx: mpsc::UnboundedSender<ReliableSession>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReliableSession>>,
    closed: AtomicBool,
}

const ACCEPT_RETRY_BASE: Duration = Duration::from_millis(50);
const ACCEPT_RETRY_MAX: Duration = Duration::from_secs(1);

/// Pause after `failures` consecutive accept errors
fn accept_retry_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(5);
    ACCEPT_RETRY_BASE.saturating_mul(1 << exponent).min(ACCEPT_RETRY_MAX)
}

/// The sequence a non-CreateSequence message refers to
fn referenced_sequence(message: &Message) -> Option<SequenceId> {
    if let Some(header) = &message.headers.sequence {
        return Some(header.id);
    }
    if let Some(requested) = &message.headers.ack_requested {
        return Some(requested.id);
    }
    if let Some(ack) = &message.headers.acknowledgement {
        return Some(ack.id);
    }
    match &message.body {
        MessageBody::CloseSequence(control) | MessageBody::TerminateSequence(control) => Some(control.id),
        MessageBody::CloseSequenceResponse(id) | MessageBody::TerminateSequenceResponse(id) => Some(*id),
        MessageBody::Fault(body) => body.id,
        _ => None,
    }
}

impl ReliableListener {
    /// Create a listener
    pub fn new(config: ListenerConfig) -> Arc<Self> {
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            accepted_tx,
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            closed: AtomicBool::new(false),
        })
    }

    /// Wait for the next new session; `None` once the listener is closed
    pub async fn accept(&self) -> Option<ReliableSession> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.accepted_rx.lock().await.recv().await
    }

    /// Sessions currently registered
    pub fn session_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().inbound_id() == Some(*entry.key()))
            .count()
    }

    /// Registered session owning `id`, if any
    pub fn session(&self, id: &SequenceId) -> Option<ReliableSession> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Classify the first message of `channel` and create or resume a session
    pub async fn accept_channel(self: &Arc<Self>, channel: Arc<dyn TransportChannel>) -> Result<(), RmError> {
        if self.closed.load(Ordering::SeqCst) {
            channel.abort();
            return Err(RmError::Disposed);
        }

        let first = match channel.try_receive(self.config.first_message_timeout).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!("Channel from {} closed before sending anything", channel.remote_address());
                return Ok(());
            }
            Err(e) => {
                channel.abort();
                return Err(e.into());
            }
        };

        if let MessageBody::CreateSequence(create) = &first.body {
            if let Some(existing) = create.offer.and_then(|offer| self.session(&offer)) {
                debug!("Repeated CreateSequence for offer {:?}", create.offer);
                return existing.reattach(channel, first).await;
            }
            return self.create_session(channel, first).await;
        }

        let routed = referenced_sequence(&first);
        match routed.and_then(|id| self.session(&id)) {
            Some(session) => {
                info!("Channel from {} resumes session {:?}", channel.remote_address(), session.inbound_id());
                session.reattach(channel, first).await
            }
            None => {
                let fault = match routed {
                    Some(id) => SequenceFault::unknown_sequence(id),
                    None => SequenceFault::new(FaultCode::WsrmRequired, "first message names no sequence", None),
                };
                warn!("Rejecting channel from {}: {}", channel.remote_address(), fault);
                self.reject(channel, &first, fault.clone()).await;
                Err(RmError::Protocol(fault))
            }
        }
    }

    async fn create_session(self: &Arc<Self>, channel: Arc<dyn TransportChannel>, request: Message) -> Result<(), RmError> {
        if self.session_count() >= self.config.max_sessions {
            let fault = SequenceFault::new(
                FaultCode::CreateSequenceRefused,
                format!("session limit of {} reached", self.config.max_sessions),
                None,
            );
            warn!("Refusing CreateSequence from {}: {}", channel.remote_address(), fault);
            self.reject(channel, &request, fault).await;
            return Err(RmError::QuotaExceeded(format!(
                "session limit of {} reached",
                self.config.max_sessions
            )));
        }

        let session = match ReliableSession::accept(
            &request,
            channel.clone(),
            self.config.session.clone(),
            self.config.local_address.clone(),
        )
        .await
        {
            Ok(session) => session,
            Err(err) => {
                if let Some(fault) = err.fault() {
                    self.reject(channel, &request, fault.clone()).await;
                } else {
                    channel.abort();
                }
                return Err(err);
            }
        };

        self.register(&session);
        if self.accepted_tx.send(session).is_err() {
            debug!("Listener dropped before the session was accepted");
        }
        Ok(())
    }

    fn register(self: &Arc<Self>, session: &ReliableSession) {
        let ids: Vec<SequenceId> = session.inbound_id().into_iter().chain(session.outbound_id()).collect();
        for id in &ids {
            self.sessions.insert(*id, session.clone());
        }

        let mut events = session.subscribe();
        let watched = session.clone();
        let listener = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                if matches!(watched.state(), SessionState::Closed | SessionState::Faulted) {
                    break;
                }
                match events.recv().await {
                    Ok(SessionEvent::Closed) | Ok(SessionEvent::Faulted(_)) | Err(RecvError::Closed) => break,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
            if let Some(listener) = listener.upgrade() {
                for id in &ids {
                    listener.sessions.remove(id);
                }
                debug!("Session {:?} unregistered ({} remaining)", watched.inbound_id(), listener.session_count());
            }
        });
    }

    /// Answer `first` with `fault` and drop the channel
    async fn reject(&self, channel: Arc<dyn TransportChannel>, first: &Message, fault: SequenceFault) {
        let timeout = self.config.session.fault_send_timeout;
        let reply = fault.to_message(first.version).relating_to(first.id());
        if let Err(e) = channel.send(reply, timeout).await {
            debug!("Fault to {} not sent: {}", channel.remote_address(), e);
        }
        if channel.close(timeout).await.is_err() {
            channel.abort();
        }
    }

    /// Accept TCP connections until the listener is closed
    pub async fn serve_tcp(
        self: Arc<Self>,
        tcp: TcpListener,
        encoder: Arc<dyn MessageEncoder>,
    ) -> Result<(), RmError> {
        let max_message_size = self.config.session.max_message_size;
        info!("Listening for reliable sessions on {:?}", tcp.local_addr().ok());

        let mut failures = 0u32;
        while !self.closed.load(Ordering::SeqCst) {
            let channel = match accept_tcp(&tcp, encoder.clone(), max_message_size).await {
                Ok(channel) => {
                    failures = 0;
                    channel
                }
                Err(e) => {
                    failures += 1;
                    let delay = accept_retry_delay(failures);
                    error!("Accept failed ({} in a row), retrying in {:?}: {}", failures, delay, e);
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            let listener = self.clone();
            tokio::spawn(async move {
                if let Err(e) = listener.accept_channel(channel).await {
                    debug!("Channel rejected: {}", e);
                }
            });
        }
        Ok(())
    }

    /// Stop accepting and abort every registered session
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for entry in self.sessions.iter() {
            entry.value().abort();
        }
        self.sessions.clear();
        info!("Listener closed");
    }
}

impl std::fmt::Debug for ReliableListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableListener")
            .field("sessions", &self.session_count())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryChannel;
    use rm_wire::{CreateSequence, ProtocolVersion};

    fn create(offer: Option<SequenceId>) -> Message {
        Message::create_sequence(
            ProtocolVersion::WsReliableMessaging11,
            CreateSequence {
                acks_to: EndpointAddress::new("urn:test:client"),
                expires_ms: None,
                offer,
            },
        )
    }

    #[test]
    fn test_accept_retry_delay_grows_and_caps() {
        assert_eq!(accept_retry_delay(1), Duration::from_millis(50));
        assert_eq!(accept_retry_delay(2), Duration::from_millis(100));
        assert_eq!(accept_retry_delay(4), Duration::from_millis(400));
        assert_eq!(accept_retry_delay(6), Duration::from_secs(1));
        assert_eq!(accept_retry_delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_create_sequence_registers_session() {
        let listener = ReliableListener::new(ListenerConfig::default());
        let (server_end, client_end) = MemoryChannel::pair("server", "client");

        let offer = SequenceId::generate();
        client_end.send(create(Some(offer)), Duration::from_secs(1)).await.unwrap();
        listener.accept_channel(server_end).await.unwrap();

        let session = listener.accept().await.unwrap();
        assert_eq!(session.outbound_id(), Some(offer));
        assert_eq!(listener.session_count(), 1);
        assert!(listener.session(&offer).is_some());

        let reply = client_end.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        match reply.body {
            MessageBody::CreateSequenceResponse(response) => {
                assert_eq!(Some(response.id), session.inbound_id());
                assert!(response.accept.is_some());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        session.abort();
        tokio::time::timeout(Duration::from_secs(1), async {
            while listener.session_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_unknown_sequence_rejected() {
        let listener = ReliableListener::new(ListenerConfig::default());
        let (server_end, client_end) = MemoryChannel::pair("server", "client");

        let stray = SequenceId::generate();
        let message = Message::ack_requested(ProtocolVersion::WsReliableMessaging11, stray);
        client_end.send(message, Duration::from_secs(1)).await.unwrap();

        let err = listener.accept_channel(server_end).await.unwrap_err();
        assert_eq!(err.fault().map(|f| f.code), Some(FaultCode::UnknownSequence));

        let reply = client_end.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(matches!(reply.body, MessageBody::Fault(ref body) if body.code == FaultCode::UnknownSequence));
    }

    #[tokio::test]
    async fn test_session_limit_refuses() {
        let listener = ReliableListener::new(ListenerConfig {
            max_sessions: 1,
            ..Default::default()
        });

        let (first_server, first_client) = MemoryChannel::pair("server", "client-1");
        first_client.send(create(None), Duration::from_secs(1)).await.unwrap();
        listener.accept_channel(first_server).await.unwrap();

        let (second_server, second_client) = MemoryChannel::pair("server", "client-2");
        second_client.send(create(None), Duration::from_secs(1)).await.unwrap();
        let err = listener.accept_channel(second_server).await.unwrap_err();
        assert!(matches!(err, RmError::QuotaExceeded(_)));

        let reply = second_client.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(matches!(reply.body, MessageBody::Fault(ref body) if body.code == FaultCode::CreateSequenceRefused));
        listener.close();
        assert!(listener.accept().await.is_none());
    }
}
