//! Correlated request/reply exchanges with deadline-bounded retry.
//!
//! Handshakes (CreateSequence, CloseSequence, TerminateSequence) are driven
//! by a [`ReliableRequestor`]. Each attempt builds a fresh request, so every
//! retry carries a new message id, and waits at most one retry interval for
//! the reply before trying again. Abort and fault interrupt a pending
//! request immediately.
//!
//! How the reply is obtained depends on the [`RequestorKind`]:
//!
//! - `RequestReply`: the reply is the direct response of a request-reply channel
//! - `SendReceive`: the requestor sends, then receives on the binder itself
//! - `ReplyHandle`: the requestor sends, then waits until the session's
//!   receive loop hands it the reply through [`ReliableRequestor::set_reply`]

use crate::binder::{MaskingMode, ReceiveResult, ReliableChannelBinder};
use crate::error::{RmError, SequenceFault};
use parking_lot::Mutex;
use rm_wire::{Message, MessageBody, MessageId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace};

/// How a requestor obtains its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestorKind {
    /// Reply returned by the channel's request operation
    RequestReply,
    /// Send, then receive on the binder until a correlated reply arrives
    SendReceive,
    /// Send, then wait for the dispatcher to deliver the reply
    ReplyHandle,
}

#[derive(Default)]
struct SlotState {
    expected: Vec<MessageId>,
    reply: Option<Message>,
}

/// Reply handle fed by the session dispatcher
#[derive(Default)]
pub struct ReplySlot {
    state: Mutex<SlotState>,
    ready: Notify,
}

impl ReplySlot {
    fn reset(&self) {
        let mut state = self.state.lock();
        state.expected.clear();
        state.reply = None;
    }

    fn expect(&self, id: MessageId) {
        self.state.lock().expected.push(id);
    }

    /// Offer a reply; accepted when it relates to any attempt of the current request
    pub fn offer(&self, reply: Message) -> bool {
        let mut state = self.state.lock();
        if state.expected.is_empty() || state.reply.is_some() {
            return false;
        }
        let correlated = reply
            .headers
            .relates_to
            .map_or(false, |id| state.expected.contains(&id));
        if correlated {
            state.reply = Some(reply);
            drop(state);
            self.ready.notify_waiters();
        }
        correlated
    }

    async fn wait(&self, deadline: Instant) -> Option<Message> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(reply) = self.state.lock().reply.take() {
                return Some(reply);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.state.lock().reply.take();
            }
        }
    }
}

/// Builds the request for one attempt
pub type RequestFactory = Box<dyn Fn() -> Message + Send + Sync>;

/// Correlated request/reply driver
pub struct ReliableRequestor {
    kind: RequestorKind,
    binder: Arc<ReliableChannelBinder>,
    retry_interval: Duration,
    slot: ReplySlot,
    interrupt: watch::Sender<Option<RmError>>,
}

impl ReliableRequestor {
    /// Create a requestor of `kind`; each attempt waits at most `retry_interval`
    pub fn new(kind: RequestorKind, binder: Arc<ReliableChannelBinder>, retry_interval: Duration) -> Self {
        Self {
            kind,
            binder,
            retry_interval,
            slot: ReplySlot::default(),
            interrupt: watch::channel(None).0,
        }
    }

    /// Kind of the requestor
    pub fn kind(&self) -> RequestorKind {
        self.kind
    }

    /// Deliver a reply received by the dispatcher (`ReplyHandle` kind)
    pub fn set_reply(&self, reply: Message) -> bool {
        self.slot.offer(reply)
    }

    /// Interrupt pending and future requests with [`RmError::Aborted`]
    pub fn abort(&self) {
        self.fault(RmError::Aborted);
    }

    /// Interrupt pending and future requests with `err`
    pub fn fault(&self, err: RmError) {
        self.interrupt.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(err);
                true
            } else {
                false
            }
        });
    }

    fn interrupted(&self) -> Option<RmError> {
        self.interrupt.borrow().clone()
    }

    /// Run the exchange until a reply arrives or `timeout` elapses.
    ///
    /// A fault reply is returned as [`RmError::RemoteFault`].
    pub async fn request(&self, make_request: RequestFactory, timeout: Duration) -> Result<Message, RmError> {
        let deadline = Instant::now() + timeout;
        let mut interrupt = self.interrupt.subscribe();
        let mut attempts = 0u32;
        self.slot.reset();

        loop {
            if let Some(err) = self.interrupted() {
                return Err(err);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RmError::timeout(format!(
                    "no reply after {} attempts within {:?}",
                    attempts, timeout
                )));
            }

            attempts += 1;
            let iteration_deadline = (now + self.retry_interval).min(deadline);
            let request = make_request();
            let action = request.action;
            trace!("Request attempt {} for {:?} ({:?})", attempts, action, self.kind);

            let outcome = tokio::select! {
                r = self.attempt(request, iteration_deadline) => r,
                _ = interrupt.wait_for(|e| e.is_some()) => {
                    return Err(self.interrupted().unwrap_or(RmError::Aborted));
                }
            };

            match outcome {
                Ok(Some(reply)) => {
                    if let MessageBody::Fault(body) = &reply.body {
                        return Err(RmError::RemoteFault(SequenceFault::from_body(body)));
                    }
                    debug!("{:?} answered by {:?} after {} attempts", action, reply.action, attempts);
                    return Ok(reply);
                }
                Ok(None) => debug!("No reply to {:?} within the retry interval", action),
                Err(err) if err.is_handleable() => {
                    debug!("{:?} attempt {} failed: {}", action, attempts, err);
                    tokio::select! {
                        _ = tokio::time::sleep_until(iteration_deadline) => {}
                        _ = interrupt.wait_for(|e| e.is_some()) => {
                            return Err(self.interrupted().unwrap_or(RmError::Aborted));
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt(&self, request: Message, deadline: Instant) -> Result<Option<Message>, RmError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let id = request.id();

        match self.kind {
            RequestorKind::RequestReply => self.binder.request(request, remaining, MaskingMode::NONE).await,
            RequestorKind::SendReceive => {
                self.binder.send(request, remaining, MaskingMode::NONE).await?;
                loop {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    match self.binder.try_receive(remaining, MaskingMode::NONE).await? {
                        ReceiveResult::Message(reply) => {
                            let correlated = reply.headers.relates_to == Some(id)
                                || matches!(reply.body, MessageBody::Fault(_));
                            if correlated {
                                return Ok(Some(reply));
                            }
                            trace!("Ignoring uncorrelated {:?} while awaiting reply", reply.action);
                        }
                        ReceiveResult::TimedOut => return Ok(None),
                        ReceiveResult::Closed => return Err(RmError::Disposed),
                    }
                }
            }
            RequestorKind::ReplyHandle => {
                self.slot.expect(id);
                self.binder.send(request, remaining, MaskingMode::NONE).await?;
                Ok(self.slot.wait(deadline).await)
            }
        }
    }
}

impl std::fmt::Debug for ReliableRequestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableRequestor")
            .field("kind", &self.kind)
            .field("retry_interval", &self.retry_interval)
            .finish()
    }
}
