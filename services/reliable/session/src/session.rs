//! Reliable session: handshakes, inbound dispatch, acknowledgements and faults.
//!
//! A session owns up to two sequences: the outbound one it sends on and,
//! when duplex, the inbound one the peer sends on. The client creates the
//! session with a CreateSequence handshake (offering its inbound sequence);
//! the server side is created by the listener from that request.
//!
//! Every inbound message is classified and applied by the dispatcher while
//! holding the session's dispatch lock, so protocol state changes are
//! serialized while application sends run concurrently:
//!
//! ```text
//! receive loop / listener
//!        |
//!   process_message --(dispatch lock)--> acknowledgement header -> output connection
//!                                        sequence header       -> input connection -> delivery
//!                                        AckRequested          -> immediate ack
//!                                        Close / Terminate     -> boundary checks, reply
//!                                        responses             -> reply handle
//!                                        fault                 -> session faulted
//! ```
//!
//! Every local fault goes through `SessionCore::on_local_fault`, which
//! moves the session to Faulted, wakes every waiter and sends the peer a
//! best-effort fault.

use crate::binder::{BinderEvent, BinderSettings, MaskingMode, ReceiveResult, ReliableChannelBinder};
use crate::config::ReliableSessionConfig;
use crate::coordination::{Guard, InterruptibleTimer, InterruptibleWaitObject, TimerCallback};
use crate::delivery::DeliveryStrategy;
use crate::error::{RmError, SequenceFault};
use crate::fault::FaultHelper;
use crate::input::{BoundaryError, ReliableInputConnection};
use crate::output::{ReliableOutputConnection, SendHandler, Transmission};
use crate::requestor::{ReliableRequestor, RequestorKind};
use crate::synchronizer::ChannelEvent;
use crate::transport::{ChannelFactory, ChannelShape, TransportChannel};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use rm_wire::{
    CreateSequence, CreateSequenceResponse, EndpointAddress, FaultBody, FaultCode, Message, MessageBody, MessageId,
    ProtocolVersion, SequenceAcknowledgement, SequenceControl, SequenceHeader, SequenceId,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// Which side of the CreateSequence handshake a session is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    /// Sent CreateSequence
    Client,
    /// Answered CreateSequence
    Server,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Handshake complete; sends and receives allowed
    Opened,
    /// Close in progress
    Closing,
    /// Closed gracefully or aborted
    Closed,
    /// Faulted
    Faulted,
}

/// Events emitted by sessions
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The CreateSequence handshake completed
    Opened {
        /// Sequence this side sends on
        outbound: Option<SequenceId>,
        /// Sequence this side receives on
        inbound: Option<SequenceId>,
    },
    /// The transport channel was lost; the session survives
    ConnectionLost,
    /// A replacement transport channel is in use
    Reconnected,
    /// The session faulted
    Faulted(RmError),
    /// The session closed or was aborted
    Closed,
}

/// Statistics for a session
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Application messages sent (first transmissions)
    pub messages_sent: u64,
    /// Application messages accepted from the peer
    pub messages_received: u64,
    /// Retransmissions
    pub retries: u64,
    /// Acknowledgements sent, standalone or piggybacked
    pub acks_sent: u64,
    /// Acknowledgements received
    pub acks_received: u64,
    /// Duplicate messages dropped
    pub duplicates: u64,
}

#[derive(Default)]
struct StatsCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    retries: AtomicU64,
    acks_sent: AtomicU64,
    acks_received: AtomicU64,
    duplicates: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

/// What the dispatcher owes the peer after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum AckAction {
    None,
    Schedule,
    Immediate,
}

struct InboundState {
    connection: ReliableInputConnection,
    /// Messages accepted since the last acknowledgement
    pending_acks: usize,
    /// Bumped whenever the peer is owed an acknowledgement
    ack_version: u64,
    /// `ack_version` captured by the last acknowledgement sent
    acked_version: u64,
    /// The last acknowledgement advertised no free buffer
    advertised_zero: bool,
}

struct InboundSide {
    id: SequenceId,
    state: Mutex<InboundState>,
    delivery: DeliveryStrategy,
    terminated: InterruptibleWaitObject,
    ack_timer: InterruptibleTimer,
}

struct Lifecycle {
    state: SessionState,
    terminal: Option<RmError>,
}

/// Shared state of one session
pub(crate) struct SessionCore {
    this: Weak<SessionCore>,
    role: SessionRole,
    version: ProtocolVersion,
    config: ReliableSessionConfig,
    binder: Arc<ReliableChannelBinder>,
    requestor: ReliableRequestor,
    fault_helper: FaultHelper,
    guard: Guard,
    dispatch: tokio::sync::Mutex<()>,
    inbound: Option<InboundSide>,
    output: Option<Arc<ReliableOutputConnection>>,
    outbound_terminated: AtomicBool,
    final_ack: InterruptibleWaitObject,
    create_response: Option<CreateSequenceResponse>,
    lifecycle: Mutex<Lifecycle>,
    events: broadcast::Sender<SessionEvent>,
    stats: StatsCounters,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Sends the transmissions of the outbound sequence through the session
struct SequenceSender {
    core: Weak<SessionCore>,
    id: SequenceId,
}

#[async_trait]
impl SendHandler for SequenceSender {
    async fn send(&self, transmission: Transmission, timeout: Duration) -> Result<(), RmError> {
        match self.core.upgrade() {
            Some(core) => core.send_sequenced(self.id, transmission, timeout).await,
            None => Err(RmError::Aborted),
        }
    }

    fn on_fault(&self, err: RmError) {
        if let Some(core) = self.core.upgrade() {
            core.on_local_fault(err);
        }
    }
}

fn boundary_fault(id: SequenceId, err: BoundaryError) -> RmError {
    RmError::Protocol(SequenceFault::new(
        FaultCode::SequenceTerminated,
        err.to_string(),
        Some(id),
    ))
}

fn missing_header(id: Option<SequenceId>, what: &str) -> RmError {
    RmError::Protocol(SequenceFault::new(FaultCode::WsrmRequired, what, id))
}

impl SessionCore {
    fn new(
        role: SessionRole,
        config: ReliableSessionConfig,
        binder: Arc<ReliableChannelBinder>,
        outbound: Option<SequenceId>,
        inbound: Option<SequenceId>,
        create_response: Option<CreateSequenceResponse>,
    ) -> Arc<Self> {
        let version = config.version;
        let requestor = ReliableRequestor::new(
            RequestorKind::ReplyHandle,
            binder.clone(),
            config.request_retry_interval,
        );

        Arc::new_cyclic(|this: &Weak<SessionCore>| {
            let output = outbound.map(|id| {
                let handler = Arc::new(SequenceSender {
                    core: this.clone(),
                    id,
                });
                ReliableOutputConnection::new(id, config.output_settings(), handler)
            });

            let inbound = inbound.map(|id| {
                let timer_core = this.clone();
                let on_ack_timer: TimerCallback = Arc::new(move || {
                    let core = timer_core.clone();
                    async move {
                        if let Some(core) = core.upgrade() {
                            core.on_ack_timer().await;
                        }
                    }
                    .boxed()
                });

                let delivery = DeliveryStrategy::new(config.delivery_mode(), config.max_transfer_window_size);
                let dequeue_core = this.clone();
                delivery.set_dequeue_callback(Arc::new(move || {
                    if let Some(core) = dequeue_core.upgrade() {
                        core.on_dequeued();
                    }
                }));

                InboundSide {
                    id,
                    state: Mutex::new(InboundState {
                        connection: ReliableInputConnection::new(version, config.max_sequence_ranges),
                        pending_acks: 0,
                        ack_version: 0,
                        acked_version: 0,
                        advertised_zero: false,
                    }),
                    delivery,
                    terminated: InterruptibleWaitObject::new(false),
                    ack_timer: InterruptibleTimer::new(on_ack_timer),
                }
            });

            SessionCore {
                this: this.clone(),
                role,
                version,
                fault_helper: FaultHelper::new(config.fault_send_timeout),
                config,
                binder,
                requestor,
                guard: Guard::new(),
                dispatch: tokio::sync::Mutex::new(()),
                inbound,
                output,
                outbound_terminated: AtomicBool::new(false),
                final_ack: InterruptibleWaitObject::new(false),
                create_response,
                lifecycle: Mutex::new(Lifecycle {
                    state: SessionState::Opened,
                    terminal: None,
                }),
                events: broadcast::channel(64).0,
                stats: StatsCounters::default(),
                tasks: Mutex::new(Vec::new()),
            }
        })
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn state(&self) -> SessionState {
        self.lifecycle.lock().state
    }

    fn is_terminal(&self) -> bool {
        matches!(self.state(), SessionState::Closed | SessionState::Faulted)
    }

    /// Error reported by operations on a session that can no longer run them
    fn state_error(&self) -> RmError {
        let lifecycle = self.lifecycle.lock();
        match (&lifecycle.state, &lifecycle.terminal) {
            (SessionState::Faulted, Some(err)) => err.clone().into_faulted(),
            (SessionState::Closed, Some(RmError::Aborted)) => RmError::Aborted,
            (SessionState::Closed, _) => RmError::Disposed,
            _ => RmError::InvalidOperation("the session is closing".to_string()),
        }
    }

    /// Replace an operation error with the session's terminal error, if any
    fn surface(&self, err: RmError) -> RmError {
        if self.is_terminal() {
            self.state_error()
        } else {
            err
        }
    }

    fn spawn_tracked<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Start the receive loop and the binder event pump
    fn start(self: &Arc<Self>, mut binder_events: mpsc::UnboundedReceiver<BinderEvent>) {
        let weak = Arc::downgrade(self);
        self.spawn_tracked(async move {
            while let Some(event) = binder_events.recv().await {
                let Some(core) = weak.upgrade() else { break };
                core.on_binder_event(event);
            }
        });

        let core = self.clone();
        self.spawn_tracked(async move { core.receive_loop().await });
    }

    fn on_binder_event(&self, event: BinderEvent) {
        match event {
            BinderEvent::Channel(ChannelEvent::Opened { generation }) if generation > 1 => {
                info!("Session {:?} reconnected (channel generation {})", self.role, generation);
                self.emit(SessionEvent::Reconnected);
                if self.role == SessionRole::Client {
                    if let Some(core) = self.this.upgrade() {
                        tokio::spawn(async move { core.send_probe().await });
                    }
                }
            }
            BinderEvent::Channel(ChannelEvent::Opened { .. }) => {}
            BinderEvent::Channel(ChannelEvent::ConnectionLost { generation }) => {
                warn!("Session {:?} lost channel generation {}", self.role, generation);
                self.emit(SessionEvent::ConnectionLost);
            }
            BinderEvent::Channel(ChannelEvent::Faulted(err)) | BinderEvent::Exception(err) => {
                self.on_local_fault(err);
            }
        }
    }

    /// First message on a reconnected client channel, so the server can route it
    async fn send_probe(&self) {
        let inbound_done = self.inbound.as_ref().map_or(true, |i| i.terminated.is_set());
        if self.outbound_terminated.load(Ordering::SeqCst) && inbound_done {
            return;
        }
        let message = match (&self.output, &self.inbound) {
            (Some(output), _) if !self.outbound_terminated.load(Ordering::SeqCst) => {
                Message::ack_requested(self.version, output.id())
            }
            (_, Some(_)) => {
                self.send_ack(false).await;
                return;
            }
            _ => return,
        };
        if let Err(e) = self
            .binder
            .send(message, self.config.request_retry_interval, MaskingMode::HANDLED)
            .await
        {
            self.on_local_fault(e);
        }
    }

    async fn receive_loop(self: Arc<Self>) {
        loop {
            if self.is_terminal() {
                break;
            }

            let received = self
                .binder
                .try_receive(self.config.inactivity_timeout, MaskingMode::HANDLED)
                .await;

            match received {
                Ok(ReceiveResult::Message(message)) => self.process_message(message).await,
                Ok(ReceiveResult::TimedOut) => {
                    if !self.is_terminal() {
                        self.on_local_fault(RmError::timeout(format!(
                            "nothing was received from the peer within {:?}",
                            self.config.inactivity_timeout
                        )));
                    }
                    break;
                }
                Ok(ReceiveResult::Closed) => break,
                Err(e) => {
                    self.on_local_fault(e);
                    break;
                }
            }
        }
        debug!("Receive loop of {:?} session ended", self.role);
    }

    /// Apply one inbound message
    pub(crate) async fn process_message(&self, message: Message) {
        let _dispatch = self.dispatch.lock().await;
        if self.is_terminal() {
            trace!("Dropping {:?} on a finished session", message.action);
            return;
        }
        if let Err(err) = self.dispatch_message(message).await {
            self.on_local_fault(err);
        }
    }

    async fn dispatch_message(&self, message: Message) -> Result<(), RmError> {
        if message.version != self.version {
            return Err(missing_header(None, "message uses a different protocol version"));
        }
        trace!("Dispatching {:?} ({})", message.action, message.id());

        if let Some(ack) = &message.headers.acknowledgement {
            self.on_acknowledgement(ack)?;
        }

        let mut ack_action = AckAction::None;
        if let Some(header) = &message.headers.sequence {
            ack_action = self.on_sequenced(header, message.payload().cloned())?;
        }
        if let Some(requested) = &message.headers.ack_requested {
            self.inbound_for(requested.id)?;
            ack_action = AckAction::Immediate;
        }

        match &message.body {
            MessageBody::Application(_) if message.headers.sequence.is_none() => {
                return Err(missing_header(None, "application message without a Sequence header"));
            }
            MessageBody::Empty | MessageBody::Application(_) => {}
            MessageBody::CreateSequence(create) => self.on_create_sequence(&message, create).await,
            MessageBody::CreateSequenceResponse(_) => {
                debug!("Ignoring late CreateSequenceResponse {}", message.id());
            }
            MessageBody::CloseSequence(control) => self.on_close_sequence(&message, control).await?,
            MessageBody::TerminateSequence(control) => self.on_terminate_sequence(&message, control).await?,
            MessageBody::CloseSequenceResponse(_) | MessageBody::TerminateSequenceResponse(_) => {
                if !self.requestor.set_reply(message.clone()) {
                    debug!("Dropping uncorrelated {:?}", message.action);
                }
            }
            MessageBody::Fault(body) => self.on_fault_message(&message, body)?,
        }

        match ack_action {
            AckAction::Immediate => self.send_ack(false).await,
            AckAction::Schedule => {
                if let Some(inbound) = &self.inbound {
                    inbound.ack_timer.set_if_not_set(self.config.acknowledgement_interval);
                }
            }
            AckAction::None => {}
        }
        Ok(())
    }

    fn inbound_for(&self, id: SequenceId) -> Result<&InboundSide, RmError> {
        match &self.inbound {
            Some(inbound) if inbound.id == id => Ok(inbound),
            _ => Err(RmError::Protocol(SequenceFault::unknown_sequence(id))),
        }
    }

    fn on_acknowledgement(&self, ack: &SequenceAcknowledgement) -> Result<(), RmError> {
        let output = match &self.output {
            Some(output) if output.id() == ack.id => output,
            _ => return Err(RmError::Protocol(SequenceFault::unknown_sequence(ack.id))),
        };

        output.process_transferred(&ack.ranges, ack.buffer_remaining)?;
        StatsCounters::bump(&self.stats.acks_received);

        if ack.final_ack {
            if !output.is_final_ack_valid(&ack.ranges) {
                return Err(RmError::Protocol(SequenceFault::invalid_acknowledgement(
                    ack.id,
                    "the final acknowledgement does not cover the whole sequence",
                )));
            }
            self.final_ack.set();
        }
        Ok(())
    }

    fn on_sequenced(&self, header: &SequenceHeader, payload: Option<Bytes>) -> Result<AckAction, RmError> {
        let inbound = self.inbound_for(header.id)?;
        let number = header.number;
        let is_last = header.last_message && self.version.uses_last_message_marker();

        if number == 0 {
            return Err(missing_header(Some(header.id), "message number 0 is not valid"));
        }

        let mut state = inbound.state.lock();
        if state.connection.is_terminated() {
            return Err(RmError::Protocol(SequenceFault::sequence_terminated(
                Some(header.id),
                format!("message {} arrived after the sequence was terminated", number),
            )));
        }

        if state.connection.contains(number) {
            trace!("Duplicate message {} on {}", number, header.id);
            StatsCounters::bump(&self.stats.duplicates);
            state.ack_version += 1;
            return Ok(AckAction::Schedule);
        }
        if state.connection.is_sequence_closed() {
            return Err(RmError::Protocol(SequenceFault::sequence_closed(header.id, number)));
        }
        if !state.connection.is_valid(number, is_last) {
            return Err(RmError::Protocol(SequenceFault::last_message_number_exceeded(
                header.id, number,
            )));
        }
        if !state.connection.can_merge(number) {
            debug!("Dropping message {} on {}: too many acknowledgement ranges", number, header.id);
            return Ok(AckAction::None);
        }
        if !inbound.delivery.can_enqueue(number) {
            debug!("Dropping message {} on {}: transfer window full", number, header.id);
            state.ack_version += 1;
            return Ok(AckAction::Schedule);
        }

        let all_added = state.connection.merge(number, is_last);
        inbound.delivery.enqueue(number, if is_last { None } else { payload });
        state.pending_acks += 1;
        state.ack_version += 1;
        StatsCounters::bump(&self.stats.messages_received);
        trace!("Accepted message {} on {}, ranges {}", number, header.id, state.connection.ranges());

        if all_added {
            info!("All messages of {} received", header.id);
            inbound.delivery.complete();
        }

        if all_added || state.pending_acks >= self.config.max_transfer_window_size {
            Ok(AckAction::Immediate)
        } else {
            Ok(AckAction::Schedule)
        }
    }

    fn check_reply_to(&self, message: &Message, id: SequenceId) -> Result<(), RmError> {
        match &message.headers.reply_to {
            Some(address) if address != self.binder.remote_address() => {
                Err(RmError::Protocol(SequenceFault::new(
                    FaultCode::SequenceTerminated,
                    format!(
                        "reply address {} does not match the session peer {}",
                        address,
                        self.binder.remote_address()
                    ),
                    Some(id),
                )))
            }
            _ => Ok(()),
        }
    }

    async fn on_create_sequence(&self, message: &Message, create: &CreateSequence) {
        let offer_matches = create.offer == self.output.as_ref().map(|o| o.id());
        match &self.create_response {
            Some(response) if self.role == SessionRole::Server && offer_matches => {
                debug!("Answering repeated CreateSequence {} for {}", message.id(), response.id);
                let reply = Message::create_sequence_response(self.version, message.id(), response.clone());
                if let Err(e) = self
                    .binder
                    .send(reply, self.config.request_retry_interval, MaskingMode::HANDLED)
                    .await
                {
                    debug!("Repeated CreateSequenceResponse not sent: {}", e);
                }
            }
            _ => {
                warn!("Refusing CreateSequence {} on an established session", message.id());
                let refusal = Message::fault(
                    self.version,
                    FaultCode::CreateSequenceRefused,
                    "the channel already carries a session",
                    None,
                )
                .relating_to(message.id());
                self.fault_helper.send_fault(self.binder.clone(), refusal);
            }
        }
    }

    async fn on_close_sequence(&self, message: &Message, control: &SequenceControl) -> Result<(), RmError> {
        if !self.version.supports_close_sequence() {
            return Err(missing_header(Some(control.id), "CloseSequence is not defined in this protocol version"));
        }
        self.check_reply_to(message, control.id)?;
        let inbound = self.inbound_for(control.id)?;
        let last = control
            .last_msg_number
            .ok_or_else(|| missing_header(Some(control.id), "CloseSequence without LastMsgNumber"))?;

        let ack = {
            let mut state = inbound.state.lock();
            state
                .connection
                .set_close_sequence_last(last)
                .map_err(|e| boundary_fault(control.id, e))?;
            if state.connection.all_added() {
                inbound.delivery.complete();
            }
            self.build_ack(inbound, &mut state, true)
        };

        info!("Sequence {} closed by the peer at message {}", control.id, last);
        let reply = Message::close_sequence_response(self.version, message.id(), control.id).with_acknowledgement(ack);
        StatsCounters::bump(&self.stats.acks_sent);
        self.binder
            .send(reply, self.config.request_retry_interval, MaskingMode::HANDLED)
            .await
    }

    async fn on_terminate_sequence(&self, message: &Message, control: &SequenceControl) -> Result<(), RmError> {
        self.check_reply_to(message, control.id)?;
        let inbound = self.inbound_for(control.id)?;

        let ack = {
            let mut state = inbound.state.lock();
            if self.version.has_terminate_response() {
                let last = control
                    .last_msg_number
                    .ok_or_else(|| missing_header(Some(control.id), "TerminateSequence without LastMsgNumber"))?;
                state
                    .connection
                    .set_terminate_sequence_last(last)
                    .map_err(|e| boundary_fault(control.id, e))?;
            }
            if !state.connection.terminate() {
                return Err(RmError::Protocol(SequenceFault::sequence_terminated(
                    Some(control.id),
                    "TerminateSequence arrived before the last message number was known",
                )));
            }
            self.build_ack(inbound, &mut state, true)
        };

        inbound.ack_timer.cancel();
        inbound.delivery.complete();
        inbound.terminated.set();
        info!("Sequence {} terminated by the peer", control.id);

        if self.version.has_terminate_response() {
            let reply = Message::terminate_sequence_response(self.version, message.id(), control.id)
                .with_acknowledgement(ack);
            StatsCounters::bump(&self.stats.acks_sent);
            self.binder
                .send(reply, self.config.request_retry_interval, MaskingMode::HANDLED)
                .await?;
        }

        self.maybe_finish();
        Ok(())
    }

    fn on_fault_message(&self, message: &Message, body: &FaultBody) -> Result<(), RmError> {
        if message.headers.relates_to.is_some() && self.requestor.set_reply(message.clone()) {
            return Ok(());
        }
        warn!("Peer reported {}: {}", body.qualified_code, body.reason);
        Err(RmError::RemoteFault(SequenceFault::from_body(body)))
    }

    /// Snapshot the inbound state into an acknowledgement; caller holds the inbound lock
    fn build_ack(&self, inbound: &InboundSide, state: &mut InboundState, final_ack: bool) -> SequenceAcknowledgement {
        let buffer_remaining = if self.config.flow_control_enabled {
            Some(inbound.delivery.buffer_remaining())
        } else {
            None
        };

        state.pending_acks = 0;
        state.acked_version = state.ack_version;
        state.advertised_zero = buffer_remaining == Some(0);

        SequenceAcknowledgement {
            id: inbound.id,
            ranges: state.connection.ranges().iter().copied().collect(),
            final_ack: final_ack && self.version.supports_final_ack(),
            buffer_remaining,
        }
    }

    /// Send a standalone acknowledgement for the inbound sequence
    async fn send_ack(&self, final_ack: bool) {
        let Some(inbound) = &self.inbound else { return };
        let ack = {
            let mut state = inbound.state.lock();
            self.build_ack(inbound, &mut state, final_ack)
        };
        trace!("Acknowledging {} on {}", ack.ranges.len(), inbound.id);

        let message = Message::acknowledgement(self.version, ack);
        match self
            .binder
            .send(message, self.config.request_retry_interval, MaskingMode::HANDLED)
            .await
        {
            Ok(()) => StatsCounters::bump(&self.stats.acks_sent),
            Err(e) => self.on_local_fault(e),
        }
    }

    async fn on_ack_timer(&self) {
        let Some(inbound) = &self.inbound else { return };
        let stale = {
            let state = inbound.state.lock();
            state.acked_version == state.ack_version
        };
        if stale || self.is_terminal() {
            trace!("Skipping scheduled acknowledgement on {}", inbound.id);
            return;
        }
        self.send_ack(false).await;
    }

    /// The application took a message; re-advertise a freed buffer
    fn on_dequeued(&self) {
        let Some(inbound) = &self.inbound else { return };
        let reawaken = {
            let state = inbound.state.lock();
            state.advertised_zero && inbound.delivery.buffer_remaining() > 0
        };
        if reawaken && !self.is_terminal() {
            debug!("Buffer freed on {}, re-acknowledging", inbound.id);
            if let Some(core) = self.this.upgrade() {
                tokio::spawn(async move { core.send_ack(false).await });
            }
        }
    }

    /// Acknowledgement to piggyback on an outgoing sequenced message
    fn piggyback_ack(&self) -> Option<SequenceAcknowledgement> {
        let inbound = self.inbound.as_ref()?;
        let mut state = inbound.state.lock();
        if state.acked_version == state.ack_version || state.connection.is_terminated() {
            return None;
        }
        Some(self.build_ack(inbound, &mut state, false))
    }

    async fn send_sequenced(&self, id: SequenceId, transmission: Transmission, timeout: Duration) -> Result<(), RmError> {
        let mut message = match transmission.payload {
            Some(payload) => Message::sequenced(self.version, id, transmission.number, payload),
            None => Message::last_message(self.version, id, transmission.number),
        };
        if transmission.ack_requested {
            message = message.with_ack_requested(id);
        }
        if let Some(ack) = self.piggyback_ack() {
            message = message.with_acknowledgement(ack);
            StatsCounters::bump(&self.stats.acks_sent);
        }

        if transmission.retry {
            StatsCounters::bump(&self.stats.retries);
        } else {
            StatsCounters::bump(&self.stats.messages_sent);
        }
        self.binder.send(message, timeout, MaskingMode::NONE).await
    }

    /// Single entry point for local faults
    pub(crate) fn on_local_fault(&self, err: RmError) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(lifecycle.state, SessionState::Closed | SessionState::Faulted) {
                return;
            }
            lifecycle.state = SessionState::Faulted;
            lifecycle.terminal = Some(err.clone());
        }
        error!("Session {:?} faulted: {}", self.role, err);

        if !matches!(err, RmError::RemoteFault(_) | RmError::Aborted | RmError::Disposed) {
            let fault = err.fault().cloned().unwrap_or_else(|| {
                SequenceFault::sequence_terminated(
                    self.output.as_ref().map(|o| o.id()).or(self.inbound.as_ref().map(|i| i.id)),
                    err.to_string(),
                )
            });
            self.fault_helper
                .send_fault(self.binder.clone(), fault.to_message(self.version));
        }

        if let Some(output) = &self.output {
            output.fault(err.clone());
        }
        if let Some(inbound) = &self.inbound {
            inbound.ack_timer.abort();
            inbound.delivery.fault(err.clone());
            inbound.terminated.fault(err.clone());
        }
        self.requestor.fault(err.clone());
        self.final_ack.fault(err.clone());
        self.guard.abort();
        self.emit(SessionEvent::Faulted(err));

        if let Some(core) = self.this.upgrade() {
            tokio::spawn(async move {
                core.fault_helper.close(core.config.fault_send_timeout).await;
                core.binder.abort();
            });
        }
    }

    /// Server sessions finish on their own once both directions are done
    fn maybe_finish(&self) {
        let outbound_done = self.output.is_none() || self.outbound_terminated.load(Ordering::SeqCst);
        if self.role != SessionRole::Server || !outbound_done || self.state() != SessionState::Opened {
            return;
        }
        if let Some(core) = self.this.upgrade() {
            tokio::spawn(async move {
                let timeout = core.config.request_retry_interval;
                core.finish(timeout).await;
            });
        }
    }

    async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        let deadline = Instant::now() + timeout;
        let previous = {
            let mut lifecycle = self.lifecycle.lock();
            let previous = lifecycle.state;
            if previous == SessionState::Opened {
                lifecycle.state = SessionState::Closing;
            }
            previous
        };
        match previous {
            SessionState::Opened => {}
            SessionState::Closing => {
                return Err(RmError::InvalidOperation("close is already in progress".to_string()))
            }
            SessionState::Closed => return Ok(()),
            SessionState::Faulted => return Err(self.state_error()),
        }
        info!("Closing {:?} session", self.role);

        match self.close_sequences(deadline).await {
            Ok(()) => {
                self.finish(deadline.saturating_duration_since(Instant::now())).await;
                Ok(())
            }
            Err(err) => {
                let err = self.surface(err);
                warn!("Close failed, aborting: {}", err);
                self.abort();
                Err(err)
            }
        }
    }

    async fn close_sequences(&self, deadline: Instant) -> Result<(), RmError> {
        let remaining = || deadline.saturating_duration_since(Instant::now());

        if let Some(output) = &self.output {
            if !self.outbound_terminated.load(Ordering::SeqCst) {
                let id = output.id();
                let version = self.version;

                if version.supports_close_sequence() {
                    output.close(remaining()).await?;
                    let last = output.last_assigned();

                    // A valid final acknowledgement completes the close as well as the response does
                    let closing = self
                        .requestor
                        .request(Box::new(move || Message::close_sequence(version, id, last)), remaining());
                    tokio::select! {
                        biased;
                        reply = closing => {
                            let reply = reply?;
                            if !matches!(reply.body, MessageBody::CloseSequenceResponse(r) if r == id) {
                                return Err(missing_header(Some(id), "unexpected reply to CloseSequence"));
                            }
                            debug!("Sequence {} closed at {}", id, last);
                        }
                        acked = self.final_ack.wait(remaining()) => {
                            acked?;
                            debug!("Sequence {} closed at {} by a final acknowledgement", id, last);
                        }
                    }

                    let reply = self
                        .requestor
                        .request(Box::new(move || Message::terminate_sequence(version, id, last)), remaining())
                        .await?;
                    if !matches!(reply.body, MessageBody::TerminateSequenceResponse(r) if r == id) {
                        return Err(missing_header(Some(id), "unexpected reply to TerminateSequence"));
                    }
                } else {
                    output.add_last_message(remaining()).await?;
                    output.close(remaining()).await?;
                    let last = output.last_assigned();
                    self.binder
                        .send(Message::terminate_sequence(version, id, last), remaining(), MaskingMode::NONE)
                        .await?;
                }

                self.outbound_terminated.store(true, Ordering::SeqCst);
                info!("Sequence {} terminated after {} messages", id, output.last_assigned());
            }
        }

        if let Some(inbound) = &self.inbound {
            inbound.terminated.wait(remaining()).await?;
        }
        self.guard.close(remaining()).await
    }

    /// Release the channel and mark the session closed
    async fn finish(&self, timeout: Duration) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(lifecycle.state, SessionState::Closed | SessionState::Faulted) {
                return;
            }
            lifecycle.state = SessionState::Closed;
            lifecycle.terminal = Some(RmError::Disposed);
        }

        if let Some(inbound) = &self.inbound {
            inbound.ack_timer.abort();
            inbound.delivery.complete();
        }
        self.requestor.abort();
        self.fault_helper.close(timeout).await;
        if let Err(e) = self.binder.close(timeout).await {
            debug!("Binder close failed: {}", e);
            self.binder.abort();
        }
        info!("{:?} session closed: {:?}", self.role, self.stats.snapshot());
        self.emit(SessionEvent::Closed);
    }

    fn abort(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if matches!(lifecycle.state, SessionState::Closed | SessionState::Faulted) {
                return;
            }
            lifecycle.state = SessionState::Closed;
            lifecycle.terminal = Some(RmError::Aborted);
        }
        warn!("Aborting {:?} session", self.role);

        if let Some(output) = &self.output {
            output.abort();
        }
        if let Some(inbound) = &self.inbound {
            inbound.ack_timer.abort();
            inbound.delivery.dispose();
            inbound.terminated.abort();
        }
        self.requestor.abort();
        self.final_ack.abort();
        self.guard.abort();
        self.fault_helper.abort();
        self.binder.abort();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.emit(SessionEvent::Closed);
    }
}

/// A reliable session endpoint
#[derive(Clone)]
pub struct ReliableSession {
    core: Arc<SessionCore>,
}

impl ReliableSession {
    /// Open a client session: establish a channel and run the CreateSequence handshake
    pub async fn connect(
        factory: Arc<dyn ChannelFactory>,
        remote_address: EndpointAddress,
        config: ReliableSessionConfig,
        timeout: Duration,
    ) -> Result<ReliableSession, RmError> {
        config.validate()?;
        let deadline = Instant::now() + timeout;
        let local_address = EndpointAddress::new(MessageId::generate().to_string());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let binder = Arc::new(ReliableChannelBinder::client(
            factory,
            BinderSettings {
                shape: ChannelShape::Duplex,
                local_address: local_address.clone(),
                remote_address: remote_address.clone(),
                reconnect_backoff_max: config.reconnect_backoff_max,
            },
            Some(events_tx),
        ));

        let setup = async {
            binder.open(timeout).await?;
            Self::create_sequence(&binder, &config, local_address, deadline).await
        };
        let (outbound, inbound) = match setup.await {
            Ok(ids) => ids,
            Err(err) => {
                binder.abort();
                return Err(err);
            }
        };

        info!("Session to {} opened: outbound {}, inbound {:?}", remote_address, outbound, inbound);
        let core = SessionCore::new(SessionRole::Client, config, binder, Some(outbound), inbound, None);
        core.start(events_rx);
        core.emit(SessionEvent::Opened {
            outbound: Some(outbound),
            inbound,
        });
        Ok(ReliableSession { core })
    }

    async fn create_sequence(
        binder: &Arc<ReliableChannelBinder>,
        config: &ReliableSessionConfig,
        local_address: EndpointAddress,
        deadline: Instant,
    ) -> Result<(SequenceId, Option<SequenceId>), RmError> {
        let version = config.version;
        let offer = config.duplex.then(SequenceId::generate);
        let requestor = ReliableRequestor::new(RequestorKind::SendReceive, binder.clone(), config.request_retry_interval);

        let reply = requestor
            .request(
                Box::new(move || {
                    Message::create_sequence(
                        version,
                        CreateSequence {
                            acks_to: local_address.clone(),
                            expires_ms: None,
                            offer,
                        },
                    )
                }),
                deadline.saturating_duration_since(Instant::now()),
            )
            .await?;

        let MessageBody::CreateSequenceResponse(response) = reply.body else {
            return Err(missing_header(None, "unexpected reply to CreateSequence"));
        };
        let inbound = match (offer, response.accept) {
            (Some(offer), Some(_)) => Some(offer),
            (Some(offer), None) => {
                debug!("Offered sequence {} was not accepted", offer);
                None
            }
            (None, Some(_)) => {
                return Err(missing_header(Some(response.id), "Accept without an offered sequence"));
            }
            (None, None) => None,
        };
        Ok((response.id, inbound))
    }

    /// Create the server side from a CreateSequence request received on `channel`
    pub async fn accept(
        request: &Message,
        channel: Arc<dyn TransportChannel>,
        mut config: ReliableSessionConfig,
        default_local_address: EndpointAddress,
    ) -> Result<ReliableSession, RmError> {
        config.validate()?;
        config.version = request.version;
        let MessageBody::CreateSequence(create) = &request.body else {
            return Err(RmError::InvalidOperation("not a CreateSequence request".to_string()));
        };
        if create.acks_to.as_str().is_empty() {
            return Err(RmError::Protocol(SequenceFault::new(
                FaultCode::CreateSequenceRefused,
                "CreateSequence without an AcksTo address",
                None,
            )));
        }

        let local_address = request.headers.to.clone().unwrap_or(default_local_address);
        let inbound = SequenceId::generate();
        let outbound = if config.duplex { create.offer } else { None };
        let response = CreateSequenceResponse {
            id: inbound,
            expires_ms: None,
            accept: outbound.map(|_| local_address.clone()),
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let binder = Arc::new(ReliableChannelBinder::server(
            BinderSettings {
                shape: channel.shape(),
                local_address,
                remote_address: create.acks_to.clone(),
                reconnect_backoff_max: config.reconnect_backoff_max,
            },
            Some(events_tx),
        ));
        binder.open(config.request_retry_interval).await?;
        binder.set_channel(channel)?;

        let reply = Message::create_sequence_response(config.version, request.id(), response.clone());
        if let Err(err) = binder.send(reply, config.request_retry_interval, MaskingMode::NONE).await {
            binder.abort();
            return Err(err);
        }

        info!(
            "Accepted session from {}: inbound {}, outbound {:?}",
            create.acks_to, inbound, outbound
        );
        let core = SessionCore::new(SessionRole::Server, config, binder, outbound, Some(inbound), Some(response));
        core.start(events_rx);
        core.emit(SessionEvent::Opened {
            outbound,
            inbound: Some(inbound),
        });
        Ok(ReliableSession { core })
    }

    /// Route a reconnected channel and its first message to this session
    pub async fn reattach(&self, channel: Arc<dyn TransportChannel>, first: Message) -> Result<(), RmError> {
        if self.core.is_terminal() {
            return Err(self.core.state_error());
        }
        self.core.binder.set_channel(channel)?;
        self.core.process_message(first).await;
        Ok(())
    }

    /// Send `payload` on the outbound sequence; returns its message number
    pub async fn send(&self, payload: Bytes, timeout: Duration) -> Result<u64, RmError> {
        let Some(_ticket) = self.core.guard.enter() else {
            return Err(self.core.state_error());
        };
        if self.core.state() != SessionState::Opened {
            return Err(self.core.state_error());
        }
        let Some(output) = &self.core.output else {
            return Err(RmError::InvalidOperation("the session has no outbound sequence".to_string()));
        };
        output
            .add_message(payload, timeout)
            .await
            .map_err(|e| self.core.surface(e))
    }

    /// Receive the next message; `Ok(None)` once the peer terminated the sequence
    pub async fn receive(&self, timeout: Duration) -> Result<Option<Bytes>, RmError> {
        let Some(inbound) = &self.core.inbound else {
            return Err(RmError::InvalidOperation("the session has no inbound sequence".to_string()));
        };
        inbound
            .delivery
            .dequeue(timeout)
            .await
            .map_err(|e| if e.is_timeout() { e } else { self.core.surface(e) })
    }

    /// Close both sequences gracefully, then release the channel
    pub async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        self.core.close(timeout).await
    }

    /// Tear down immediately; pending operations fail with [`RmError::Aborted`]
    pub fn abort(&self) {
        self.core.abort();
    }

    /// Lifecycle state
    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    /// Side of the handshake
    pub fn role(&self) -> SessionRole {
        self.core.role
    }

    /// Protocol revision
    pub fn version(&self) -> ProtocolVersion {
        self.core.version
    }

    /// Sequence this side sends on
    pub fn outbound_id(&self) -> Option<SequenceId> {
        self.core.output.as_ref().map(|o| o.id())
    }

    /// Sequence this side receives on
    pub fn inbound_id(&self) -> Option<SequenceId> {
        self.core.inbound.as_ref().map(|i| i.id)
    }

    /// Unacknowledged outbound messages
    pub fn pending_count(&self) -> usize {
        self.core.output.as_ref().map_or(0, |o| o.pending_count())
    }

    /// Inbound acknowledgement ranges, formatted
    pub fn received_ranges(&self) -> Option<String> {
        self.core
            .inbound
            .as_ref()
            .map(|i| i.state.lock().connection.ranges().to_string())
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SessionStats {
        self.core.stats.snapshot()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.core.events.subscribe()
    }

    /// Local address stamped as ReplyTo
    pub fn local_address(&self) -> EndpointAddress {
        self.core.binder.local_address().clone()
    }

    /// Peer address
    pub fn remote_address(&self) -> EndpointAddress {
        self.core.binder.remote_address().clone()
    }
}

impl std::fmt::Debug for ReliableSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableSession")
            .field("role", &self.core.role)
            .field("state", &self.core.state())
            .field("outbound", &self.outbound_id())
            .field("inbound", &self.inbound_id())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryAcceptor, MemoryConnector};
    use rm_wire::SequenceRange;

    fn config() -> ReliableSessionConfig {
        ReliableSessionConfig {
            acknowledgement_interval: Duration::from_millis(10),
            initial_retry_interval: Duration::from_millis(50),
            max_retry_interval: Duration::from_millis(200),
            request_retry_interval: Duration::from_millis(200),
            ..Default::default()
        }
    }

    /// Accept one CreateSequence from `acceptor` and build the server session
    async fn serve(acceptor: &mut MemoryAcceptor, config: ReliableSessionConfig) -> ReliableSession {
        let channel = acceptor.accept().await.unwrap();
        let request = channel.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        ReliableSession::accept(&request, channel, config, EndpointAddress::new("urn:test:server"))
            .await
            .unwrap()
    }

    async fn pair(config: ReliableSessionConfig) -> (ReliableSession, ReliableSession, Arc<MemoryConnector>) {
        let (connector, mut acceptor) = MemoryConnector::new();
        let server_config = config.clone();
        let server = tokio::spawn(async move { serve(&mut acceptor, server_config).await });
        let client = ReliableSession::connect(
            connector.clone(),
            EndpointAddress::new("urn:test:server"),
            config,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        (client, server.await.unwrap(), connector)
    }

    #[tokio::test]
    async fn test_handshake_offers_inbound_sequence() {
        let (client, server, _) = pair(config()).await;
        assert_eq!(client.outbound_id(), server.inbound_id());
        assert_eq!(client.inbound_id(), server.outbound_id());
        assert!(client.inbound_id().is_some());
        assert_eq!(server.remote_address(), client.local_address());
        assert_eq!(client.state(), SessionState::Opened);
        client.abort();
        server.abort();
    }

    #[tokio::test]
    async fn test_simplex_when_not_duplex() {
        let (client, server, _) = pair(ReliableSessionConfig {
            duplex: false,
            ..config()
        })
        .await;
        assert!(client.inbound_id().is_none());
        assert!(server.outbound_id().is_none());
        assert!(matches!(
            server.send(Bytes::from_static(b"x"), Duration::from_secs(1)).await,
            Err(RmError::InvalidOperation(_))
        ));
        client.abort();
        server.abort();
    }

    #[tokio::test]
    async fn test_exchange_and_acknowledge() {
        let (client, server, _) = pair(config()).await;

        for i in 1..=3u64 {
            let n = client.send(Bytes::from(format!("m{}", i)), Duration::from_secs(1)).await.unwrap();
            assert_eq!(n, i);
        }
        for i in 1..=3 {
            let payload = server.receive(Duration::from_secs(1)).await.unwrap().unwrap();
            assert_eq!(payload, Bytes::from(format!("m{}", i)));
        }

        tokio::time::timeout(Duration::from_secs(2), async {
            while client.pending_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(server.received_ranges().unwrap(), "{[1-3]}");
        assert!(server.stats().acks_sent >= 1);
        client.abort();
        server.abort();
    }

    #[tokio::test]
    async fn test_ack_for_unknown_sequence_faults() {
        let (client, server, _) = pair(config()).await;
        let mut events = client.subscribe();

        let bogus = SequenceAcknowledgement {
            id: SequenceId::generate(),
            ranges: std::iter::once(SequenceRange::single(1).unwrap()).collect(),
            final_ack: false,
            buffer_remaining: None,
        };
        client
            .core
            .process_message(Message::acknowledgement(client.version(), bogus))
            .await;

        assert_eq!(client.state(), SessionState::Faulted);
        assert!(matches!(events.recv().await.unwrap(), SessionEvent::Faulted(RmError::Protocol(_))));
        let err = client.send(Bytes::from_static(b"late"), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, RmError::Faulted(_)));
        server.abort();
    }

    #[tokio::test]
    async fn test_reply_to_mismatch_faults() {
        let (client, server, _) = pair(config()).await;
        let id = server.inbound_id().unwrap();

        let mut terminate = Message::terminate_sequence(server.version(), id, 0);
        terminate.headers.reply_to = Some(EndpointAddress::new("urn:test:intruder"));
        server.core.process_message(terminate).await;

        assert_eq!(server.state(), SessionState::Faulted);
        client.abort();
    }

    #[tokio::test]
    async fn test_final_ack_completes_close_without_response() {
        let (connector, mut acceptor) = MemoryConnector::new();
        let config = ReliableSessionConfig {
            duplex: false,
            ..config()
        };
        let peer = tokio::spawn(async move {
            let channel = acceptor.accept().await.unwrap();
            let timeout = Duration::from_secs(2);
            let create = channel.try_receive(timeout).await.unwrap().unwrap();
            let id = SequenceId::generate();
            let response = CreateSequenceResponse {
                id,
                expires_ms: None,
                accept: None,
            };
            channel
                .send(Message::create_sequence_response(create.version, create.id(), response), timeout)
                .await
                .unwrap();

            let close = channel.try_receive(timeout).await.unwrap().unwrap();
            assert!(matches!(close.body, MessageBody::CloseSequence(ref c) if c.id == id));
            let final_ack = SequenceAcknowledgement {
                id,
                ranges: Default::default(),
                final_ack: true,
                buffer_remaining: None,
            };
            channel
                .send(Message::acknowledgement(close.version, final_ack), timeout)
                .await
                .unwrap();

            loop {
                let message = channel.try_receive(timeout).await.unwrap().unwrap();
                if let MessageBody::TerminateSequence(control) = &message.body {
                    assert_eq!(control.id, id);
                    let reply = Message::terminate_sequence_response(message.version, message.id(), id);
                    channel.send(reply, timeout).await.unwrap();
                    return;
                }
            }
        });

        let client = ReliableSession::connect(
            connector,
            EndpointAddress::new("urn:test:server"),
            config,
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        client.close(Duration::from_secs(2)).await.unwrap();
        assert_eq!(client.state(), SessionState::Closed);
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn test_abort_fails_pending_receive() {
        let (client, server, _) = pair(config()).await;
        let receiver = {
            let server = server.clone();
            tokio::spawn(async move { server.receive(Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        server.abort();

        assert!(receiver.await.unwrap().is_err());
        assert_eq!(server.state(), SessionState::Closed);
        assert_eq!(
            server.send(Bytes::from_static(b"x"), Duration::from_secs(1)).await.unwrap_err(),
            RmError::Aborted
        );
        client.abort();
    }
}
