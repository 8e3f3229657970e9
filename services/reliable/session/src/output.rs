//! Send-side sequence tracking.
//!
//! [`ReliableOutputConnection`] assigns message numbers, keeps every
//! unacknowledged message for retransmission, evicts messages as
//! acknowledgements arrive and bounds the number of messages in flight by the
//! transfer window. Transmission itself is delegated to a [`SendHandler`] so
//! the connection stays independent of the channel layer.

use crate::coordination::{InterruptibleTimer, TimerCallback};
use crate::error::{RmError, SequenceFault};
use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use rm_wire::{SequenceId, SequenceRange};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// One (re)transmission of a pending message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmission {
    /// Message number
    pub number: u64,
    /// Payload; `None` for an empty LastMessage
    pub payload: Option<Bytes>,
    /// LastMessage marker
    pub last_message: bool,
    /// Whether the peer should acknowledge immediately
    pub ack_requested: bool,
    /// Whether this is a retransmission
    pub retry: bool,
}

/// Transmits messages on behalf of a [`ReliableOutputConnection`]
#[async_trait]
pub trait SendHandler: Send + Sync {
    /// Send one transmission within `timeout`
    async fn send(&self, transmission: Transmission, timeout: Duration) -> Result<(), RmError>;

    /// The connection faulted on its own (retry budget exhausted, number rollover)
    fn on_fault(&self, err: RmError);
}

/// Retry and window settings
#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Maximum unacknowledged messages
    pub window: usize,
    /// Retransmissions allowed per message
    pub max_retry_count: u32,
    /// First retry delay
    pub initial_retry_interval: Duration,
    /// Cap for the doubling retry delay
    pub max_retry_interval: Duration,
    /// Honour `BufferRemaining = 0` from the peer
    pub flow_control: bool,
}

#[derive(Debug)]
struct PendingMessage {
    payload: Option<Bytes>,
    last_message: bool,
    retries: u32,
}

#[derive(Debug)]
struct OutputState {
    pending: BTreeMap<u64, PendingMessage>,
    last_assigned: u64,
    closed: bool,
    fault: Option<RmError>,
    advertised_zero: bool,
    remote_buffer: Option<u64>,
    retry_interval: Duration,
}

impl OutputState {
    fn stopped(&self) -> Option<RmError> {
        self.fault.clone()
    }
}

/// Send-side state of one sequence
pub struct ReliableOutputConnection {
    id: SequenceId,
    settings: OutputSettings,
    handler: Arc<dyn SendHandler>,
    state: Mutex<OutputState>,
    changed: Notify,
    retry_timer: InterruptibleTimer,
}

impl ReliableOutputConnection {
    /// Create an output connection for sequence `id`
    pub fn new(id: SequenceId, settings: OutputSettings, handler: Arc<dyn SendHandler>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let callback: TimerCallback = Arc::new(move || {
                let weak = weak.clone();
                async move {
                    if let Some(connection) = weak.upgrade() {
                        connection.on_retry_elapsed().await;
                    }
                }
                .boxed()
            });

            Self {
                id,
                state: Mutex::new(OutputState {
                    pending: BTreeMap::new(),
                    last_assigned: 0,
                    closed: false,
                    fault: None,
                    advertised_zero: false,
                    remote_buffer: None,
                    retry_interval: settings.initial_retry_interval,
                }),
                settings,
                handler,
                changed: Notify::new(),
                retry_timer: InterruptibleTimer::new(callback),
            }
        })
    }

    /// Sequence identifier
    pub fn id(&self) -> SequenceId {
        self.id
    }

    /// Highest number assigned so far
    pub fn last_assigned(&self) -> u64 {
        self.state.lock().last_assigned
    }

    /// Unacknowledged messages
    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Whether the peer's last acknowledgement advertised no free buffer
    pub fn advertised_zero(&self) -> bool {
        self.state.lock().advertised_zero
    }

    /// Assign the next number to `payload` and transmit it.
    ///
    /// Waits while the window is full. Transient send failures leave the
    /// message pending for the retry timer.
    pub async fn add_message(&self, payload: Bytes, timeout: Duration) -> Result<u64, RmError> {
        self.add(Some(payload), false, timeout).await
    }

    /// Append the empty LastMessage (February 2005) and close to new sends
    pub async fn add_last_message(&self, timeout: Duration) -> Result<u64, RmError> {
        self.add(None, true, timeout).await
    }

    async fn add(&self, payload: Option<Bytes>, last_message: bool, timeout: Duration) -> Result<u64, RmError> {
        let deadline = Instant::now() + timeout;

        let transmission = loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if let Some(err) = state.stopped() {
                    return Err(err);
                }
                if state.closed {
                    return Err(RmError::InvalidOperation(
                        "the sequence no longer accepts messages".to_string(),
                    ));
                }

                let blocked = state.pending.len() >= self.settings.window
                    || (self.settings.flow_control && state.advertised_zero && !state.pending.is_empty());

                if !blocked {
                    if state.last_assigned == u64::MAX {
                        drop(state);
                        let err = RmError::Protocol(SequenceFault::message_number_rollover(self.id));
                        self.fault(err.clone());
                        self.handler.on_fault(err.clone());
                        return Err(err);
                    }

                    state.last_assigned += 1;
                    let number = state.last_assigned;
                    if last_message {
                        state.closed = true;
                    }
                    state.pending.insert(
                        number,
                        PendingMessage {
                            payload: payload.clone(),
                            last_message,
                            retries: 0,
                        },
                    );
                    trace!("Assigned message number {} on {}", number, self.id);

                    break Transmission {
                        number,
                        payload,
                        last_message,
                        ack_requested: last_message || state.pending.len() >= self.settings.window,
                        retry: false,
                    };
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RmError::timeout(format!(
                    "the transfer window did not open within {:?}",
                    timeout
                )));
            }
        };

        let number = transmission.number;
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.retry_timer.set_if_not_set(self.current_retry_interval());

        match self.handler.send(transmission, remaining).await {
            Ok(()) => Ok(number),
            Err(err) if err.is_handleable() => {
                debug!("Send of message {} on {} failed, leaving it to retry: {}", number, self.id, err);
                Ok(number)
            }
            Err(err) => {
                self.fault(err.clone());
                self.handler.on_fault(err.clone());
                Err(err)
            }
        }
    }

    fn current_retry_interval(&self) -> Duration {
        self.state.lock().retry_interval
    }

    async fn on_retry_elapsed(&self) {
        let (transmissions, interval) = {
            let mut state = self.state.lock();
            if state.fault.is_some() || state.pending.is_empty() {
                return;
            }

            let mut exhausted = None;
            for (number, message) in state.pending.iter_mut() {
                message.retries += 1;
                if message.retries > self.settings.max_retry_count && exhausted.is_none() {
                    exhausted = Some(*number);
                }
            }

            if let Some(number) = exhausted {
                drop(state);
                warn!(
                    "Message {} on {} exceeded {} retries",
                    number, self.id, self.settings.max_retry_count
                );
                let err = RmError::communication(format!(
                    "message {} was not acknowledged after {} retries",
                    number, self.settings.max_retry_count
                ));
                self.fault(err.clone());
                self.handler.on_fault(err);
                return;
            }

            let count = state.pending.len();
            let transmissions: Vec<Transmission> = state
                .pending
                .iter()
                .enumerate()
                .map(|(i, (number, message))| Transmission {
                    number: *number,
                    payload: message.payload.clone(),
                    last_message: message.last_message,
                    ack_requested: i + 1 == count,
                    retry: true,
                })
                .collect();

            let interval = state.retry_interval;
            state.retry_interval = (interval * 2).min(self.settings.max_retry_interval);
            (transmissions, state.retry_interval)
        };

        debug!("Retrying {} messages on {}", transmissions.len(), self.id);
        for transmission in transmissions {
            let number = transmission.number;
            if let Err(err) = self.handler.send(transmission, interval).await {
                if !err.is_handleable() {
                    self.fault(err.clone());
                    self.handler.on_fault(err);
                    return;
                }
                debug!("Retry of message {} on {} failed: {}", number, self.id, err);
                break;
            }
        }

        if self.pending_count() > 0 {
            self.retry_timer.set_if_not_set(interval);
        }
    }

    /// Apply an acknowledgement from the peer
    pub fn process_transferred(
        &self,
        ranges: &[SequenceRange],
        buffer_remaining: Option<u64>,
    ) -> Result<(), RmError> {
        let drained = {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                return Ok(());
            }

            if let Some(bad) = ranges.iter().find(|r| r.upper() > state.last_assigned) {
                return Err(RmError::Protocol(SequenceFault::invalid_acknowledgement(
                    self.id,
                    format!(
                        "acknowledgement range {} covers numbers never sent (last {})",
                        bad, state.last_assigned
                    ),
                )));
            }

            let before = state.pending.len();
            state
                .pending
                .retain(|number, _| !ranges.iter().any(|r| r.contains(*number)));
            let evicted = before - state.pending.len();

            if self.settings.flow_control {
                state.remote_buffer = buffer_remaining;
                state.advertised_zero = buffer_remaining == Some(0);
            }
            if evicted > 0 {
                state.retry_interval = self.settings.initial_retry_interval;
                trace!("Acknowledged {} messages on {}, {} pending", evicted, self.id, state.pending.len());
            }
            state.pending.is_empty()
        };

        if drained {
            self.retry_timer.cancel();
        }
        self.changed.notify_waiters();
        Ok(())
    }

    /// Whether `ranges` is exactly `[1, last]` for the last assigned number
    pub fn is_final_ack_valid(&self, ranges: &[SequenceRange]) -> bool {
        let last = self.state.lock().last_assigned;
        match ranges {
            [] => last == 0,
            [only] => only.lower() == 1 && only.upper() == last,
            _ => false,
        }
    }

    /// Whether every message is acknowledged and no more will be added
    pub fn check_for_termination(&self) -> bool {
        let state = self.state.lock();
        state.closed && state.pending.is_empty()
    }

    /// Stop accepting messages and wait until every pending one is acknowledged
    pub async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        let deadline = Instant::now() + timeout;
        self.state.lock().closed = true;
        self.changed.notify_waiters();

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if let Some(err) = state.stopped() {
                    return Err(err);
                }
                if state.pending.is_empty() {
                    info!("All {} messages on {} acknowledged", state.last_assigned, self.id);
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RmError::timeout(format!(
                    "{} messages on {} were not acknowledged within {:?}",
                    self.pending_count(),
                    self.id,
                    timeout
                )));
            }
        }
    }

    /// Fail every waiter with `err` and release pending messages
    pub fn fault(&self, err: RmError) {
        {
            let mut state = self.state.lock();
            if state.fault.is_some() {
                return;
            }
            debug!("Output connection {} faulted with {} pending: {}", self.id, state.pending.len(), err);
            state.fault = Some(err);
            state.closed = true;
            state.pending.clear();
        }
        self.retry_timer.abort();
        self.changed.notify_waiters();
    }

    /// Stop immediately
    pub fn abort(&self) {
        self.fault(RmError::Aborted);
    }
}

impl std::fmt::Debug for ReliableOutputConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableOutputConnection")
            .field("id", &self.id)
            .field("state", &*self.state.lock())
            .finish()
    }
}
