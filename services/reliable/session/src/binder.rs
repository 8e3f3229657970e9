//! Send/receive facade over the channel synchronizer.
//!
//! [`ReliableChannelBinder`] borrows the channel for every operation, stamps
//! addressing headers, and applies a per-call [`MaskingMode`] to the errors it
//! catches. The receive path reconnects on its own: end-of-stream and
//! transient channel faults drop the channel and the loop borrows again,
//! backing off between attempts, until a message arrives, the binder closes,
//! or the deadline passes.

use crate::error::{RmError, TransportError};
use crate::synchronizer::{ChannelEvent, ChannelSynchronizer, SynchronizerState};
use crate::transport::{ChannelFactory, ChannelShape, TransportChannel};
use bitflags::bitflags;
use rm_wire::{EndpointAddress, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

bitflags! {
    /// Which caught errors a call swallows instead of returning
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MaskingMode: u8 {
        /// Swallow communication and timeout errors
        const HANDLED = 0b01;
        /// Swallow every other error, reporting it as [`BinderEvent::Exception`]
        const UNHANDLED = 0b10;
        /// Swallow everything
        const ALL = Self::HANDLED.bits() | Self::UNHANDLED.bits();
    }
}

impl MaskingMode {
    /// Surface every error
    pub const NONE: MaskingMode = MaskingMode::empty();
}

/// Notifications raised by the binder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinderEvent {
    /// Channel lifecycle change
    Channel(ChannelEvent),
    /// A masked error that was not handleable; the owner should fault
    Exception(RmError),
}

/// Outcome of [`ReliableChannelBinder::try_receive`]
#[derive(Debug)]
pub enum ReceiveResult {
    /// A message arrived
    Message(Message),
    /// The binder is closed; no more messages will arrive
    Closed,
    /// Nothing arrived before the deadline
    TimedOut,
}

/// Binder settings
#[derive(Debug, Clone)]
pub struct BinderSettings {
    /// Channel shape expected from the transport
    pub shape: ChannelShape,
    /// Address stamped as ReplyTo
    pub local_address: EndpointAddress,
    /// Address stamped as To; also the address replies must name
    pub remote_address: EndpointAddress,
    /// Upper bound of the reconnect backoff
    pub reconnect_backoff_max: Duration,
}

/// Delay before the next reconnect attempt
pub fn reconnect_backoff(remaining: Duration, max: Duration) -> Duration {
    (remaining / 2).min(max).max(Duration::from_millis(1))
}

/// Channel binder with fault masking and automatic reconnection
pub struct ReliableChannelBinder {
    synchronizer: ChannelSynchronizer,
    settings: BinderSettings,
    can_open: bool,
    closing: watch::Sender<bool>,
    events: Option<mpsc::UnboundedSender<BinderEvent>>,
}

impl ReliableChannelBinder {
    /// Client binder that (re)creates channels through `factory`
    pub fn client(
        factory: Arc<dyn ChannelFactory>,
        settings: BinderSettings,
        events: Option<mpsc::UnboundedSender<BinderEvent>>,
    ) -> Self {
        Self::build(Some(factory), settings, events)
    }

    /// Server binder fed by [`Self::set_channel`]
    pub fn server(settings: BinderSettings, events: Option<mpsc::UnboundedSender<BinderEvent>>) -> Self {
        Self::build(None, settings, events)
    }

    fn build(
        factory: Option<Arc<dyn ChannelFactory>>,
        settings: BinderSettings,
        events: Option<mpsc::UnboundedSender<BinderEvent>>,
    ) -> Self {
        let can_open = factory.is_some();
        let channel_events = events.as_ref().map(|binder_events| {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let binder_events = binder_events.clone();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    if binder_events.send(BinderEvent::Channel(event)).is_err() {
                        break;
                    }
                }
            });
            tx
        });

        Self {
            synchronizer: ChannelSynchronizer::new(factory, true, channel_events),
            settings,
            can_open,
            closing: watch::channel(false).0,
            events,
        }
    }

    /// Local endpoint address
    pub fn local_address(&self) -> &EndpointAddress {
        &self.settings.local_address
    }

    /// Remote endpoint address
    pub fn remote_address(&self) -> &EndpointAddress {
        &self.settings.remote_address
    }

    /// Channel shape
    pub fn shape(&self) -> ChannelShape {
        self.settings.shape
    }

    /// Synchronizer phase
    pub fn state(&self) -> SynchronizerState {
        self.synchronizer.state()
    }

    /// The underlying synchronizer
    pub fn synchronizer(&self) -> &ChannelSynchronizer {
        &self.synchronizer
    }

    /// Open the binder; a client binder establishes its first channel
    pub async fn open(&self, timeout: Duration) -> Result<(), RmError> {
        self.synchronizer.open();
        if self.can_open {
            let lease = self.synchronizer.try_get_channel(true, timeout).await?;
            debug!("Binder opened on {}", lease.channel().remote_address());
        }
        Ok(())
    }

    /// Install a reconnected channel (server side)
    pub fn set_channel(&self, channel: Arc<dyn TransportChannel>) -> Result<(), RmError> {
        self.synchronizer.set_channel(channel)
    }

    fn stamp(&self, mut message: Message) -> Message {
        message.headers.to = Some(self.settings.remote_address.clone());
        if message.headers.reply_to.is_none() {
            message.headers.reply_to = Some(self.settings.local_address.clone());
        }
        message
    }

    fn is_closing(&self) -> bool {
        *self.closing.borrow()
    }

    /// Apply `mask` to `err`; `Ok(())` means it was swallowed
    fn mask(&self, err: RmError, mask: MaskingMode) -> Result<(), RmError> {
        if err.is_handleable() {
            if mask.contains(MaskingMode::HANDLED) {
                debug!("Masked handleable error: {}", err);
                return Ok(());
            }
            return Err(err);
        }

        if mask.contains(MaskingMode::UNHANDLED) {
            warn!("Masked unhandled error: {}", err);
            if let Some(events) = &self.events {
                let _ = events.send(BinderEvent::Exception(err));
            }
            return Ok(());
        }
        Err(err)
    }

    /// Send `message`; the borrowed channel is returned on every path
    pub async fn send(&self, message: Message, timeout: Duration, mask: MaskingMode) -> Result<(), RmError> {
        let deadline = Instant::now() + timeout;
        let lease = match self.synchronizer.try_get_channel(self.can_open, timeout).await {
            Ok(lease) => lease,
            Err(err) => return self.mask(err, mask),
        };

        let message = self.stamp(message);
        let action = message.action;
        let remaining = deadline.saturating_duration_since(Instant::now());

        match lease.channel().send(message, remaining).await {
            Ok(()) => {
                trace!("Sent {:?} on channel generation {}", action, lease.generation());
                Ok(())
            }
            Err(TransportError::Timeout) => self.mask(RmError::timeout("send timed out"), mask),
            Err(e) => {
                let err = RmError::from(e);
                if err.is_handleable() {
                    lease.fault();
                }
                self.mask(err, mask)
            }
        }
    }

    /// Send a request and wait for its correlated reply (request-reply shape)
    pub async fn request(
        &self,
        message: Message,
        timeout: Duration,
        mask: MaskingMode,
    ) -> Result<Option<Message>, RmError> {
        let deadline = Instant::now() + timeout;
        let lease = match self.synchronizer.try_get_channel(self.can_open, timeout).await {
            Ok(lease) => lease,
            Err(err) => return self.mask(err, mask).map(|_| None),
        };

        let message = self.stamp(message);
        let remaining = deadline.saturating_duration_since(Instant::now());
        match lease.channel().request(message, remaining).await {
            Ok(reply) => Ok(reply),
            Err(TransportError::Timeout) => self.mask(RmError::timeout("request timed out"), mask).map(|_| None),
            Err(e) => {
                let err = RmError::from(e);
                if err.is_handleable() {
                    lease.fault();
                }
                self.mask(err, mask).map(|_| None)
            }
        }
    }

    /// Receive the next message, reconnecting as needed until `timeout`
    pub async fn try_receive(&self, timeout: Duration, mask: MaskingMode) -> Result<ReceiveResult, RmError> {
        let deadline = Instant::now() + timeout;
        let mut closing = self.closing.subscribe();

        loop {
            if self.is_closing() {
                return Ok(ReceiveResult::Closed);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(ReceiveResult::TimedOut);
            }

            let acquired = tokio::select! {
                r = self.synchronizer.try_get_channel(self.can_open, remaining) => r,
                _ = closing.wait_for(|c| *c) => return Ok(ReceiveResult::Closed),
            };

            let lease = match acquired {
                Ok(lease) => lease,
                Err(err) if err.is_timeout() => return Ok(ReceiveResult::TimedOut),
                Err(RmError::Disposed) => return Ok(ReceiveResult::Closed),
                Err(err) => {
                    if err.is_handleable() {
                        debug!("Channel unavailable ({}), retrying", err);
                    } else {
                        self.mask(err, mask)?;
                    }
                    if !self.back_off(deadline, &mut closing).await {
                        return Ok(ReceiveResult::Closed);
                    }
                    continue;
                }
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            let received = tokio::select! {
                r = lease.channel().try_receive(remaining) => r,
                _ = closing.wait_for(|c| *c) => return Ok(ReceiveResult::Closed),
            };

            match received {
                Ok(Some(message)) => return Ok(ReceiveResult::Message(message)),
                Ok(None) => {
                    debug!("Channel generation {} reached end of stream", lease.generation());
                    lease.fault();
                }
                Err(TransportError::Timeout) => return Ok(ReceiveResult::TimedOut),
                Err(e) => {
                    let err = RmError::from(e);
                    if err.is_handleable() {
                        debug!("Receive on generation {} failed: {}", lease.generation(), err);
                        lease.fault();
                    } else {
                        drop(lease);
                        self.mask(err, mask)?;
                        if !self.back_off(deadline, &mut closing).await {
                            return Ok(ReceiveResult::Closed);
                        }
                    }
                }
            }
        }
    }

    /// Sleep before the next receive attempt; false when the binder closed meanwhile
    async fn back_off(&self, deadline: Instant, closing: &mut watch::Receiver<bool>) -> bool {
        let backoff = reconnect_backoff(
            deadline.saturating_duration_since(Instant::now()),
            self.settings.reconnect_backoff_max,
        );
        trace!("Next receive attempt in {:?}", backoff);
        tokio::select! {
            _ = tokio::time::sleep_until((Instant::now() + backoff).min(deadline)) => true,
            _ = closing.wait_for(|c| *c) => false,
        }
    }

    /// Stop receiving, drain borrowers and close the channel
    pub async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        self.closing.send_replace(true);
        self.synchronizer.close(timeout).await
    }

    /// Tear down immediately
    pub fn abort(&self) {
        self.closing.send_replace(true);
        self.synchronizer.abort();
    }

    /// Fault the binder; later operations fail with `err`
    pub fn fault(&self, err: RmError) {
        self.closing.send_replace(true);
        self.synchronizer.fault(err);
    }
}

impl std::fmt::Debug for ReliableChannelBinder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReliableChannelBinder")
            .field("settings", &self.settings)
            .field("can_open", &self.can_open)
            .field("synchronizer", &self.synchronizer)
            .finish()
    }
}
