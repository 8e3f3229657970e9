//! Single-channel lifecycle shared by concurrent borrowers.
//!
//! Every sender and the receive loop borrow the one transport channel through
//! [`ChannelSynchronizer::try_get_channel`]. While no channel exists, the first
//! borrower allowed to open one creates it through the [`ChannelFactory`] and
//! everyone queued behind it is released with the same handle. Each borrow is
//! a [`ChannelLease`] that is returned on drop, so the borrow count is exact
//! even on error paths.
//!
//! ```text
//! Created -> NoChannel -> ChannelOpening -> ChannelOpened -> ChannelClosing -> NoChannel
//!                ^              |                 |
//!                +---- failure -+                 +-- idle fault (tolerated) --> NoChannel
//! any -> Faulted | Closed (terminal)
//! ```

use crate::error::RmError;
use crate::transport::{ChannelFactory, TransportChannel};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lifecycle phase of the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynchronizerState {
    /// Not yet opened
    Created,
    /// Open, no channel installed
    NoChannel,
    /// A borrower is creating the channel
    ChannelOpening,
    /// Channel installed and usable
    ChannelOpened,
    /// Channel lost; waiting for borrowers to return it
    ChannelClosing,
    /// Terminally faulted
    Faulted,
    /// Terminally closed or aborted
    Closed,
}

/// Channel lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// A channel was installed
    Opened {
        /// Channel generation, starting at 1
        generation: u64,
    },
    /// The channel faulted and was dropped; a new one may follow
    ConnectionLost {
        /// Generation of the lost channel
        generation: u64,
    },
    /// The synchronizer faulted terminally
    Faulted(RmError),
}

enum Grant {
    Channel(ChannelLease),
    Open(OpenRight),
    Error(RmError),
}

/// The right to create the channel; passed on if dropped unused
struct OpenRight {
    inner: Weak<SyncInner>,
    armed: bool,
}

impl OpenRight {
    fn consume(mut self) {
        self.armed = false;
    }
}

impl Drop for OpenRight {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            let mut state = inner.state.lock();
            if state.phase == SynchronizerState::ChannelOpening && !inner.pass_open_grant(&mut state) {
                state.phase = SynchronizerState::NoChannel;
            }
        }
    }
}

struct Waiter {
    id: u64,
    can_open: bool,
    tx: oneshot::Sender<Grant>,
}

struct SyncState {
    phase: SynchronizerState,
    channel: Option<Arc<dyn TransportChannel>>,
    generation: u64,
    borrows: usize,
    waiters: VecDeque<Waiter>,
    next_waiter_id: u64,
    terminal: Option<RmError>,
}

struct SyncInner {
    this: Weak<SyncInner>,
    factory: Option<Arc<dyn ChannelFactory>>,
    tolerate_faults: bool,
    state: Mutex<SyncState>,
    drained: Notify,
    events: Option<mpsc::UnboundedSender<ChannelEvent>>,
}

/// Exclusive-use accounting for the single transport channel
#[derive(Clone)]
pub struct ChannelSynchronizer {
    inner: Arc<SyncInner>,
}

/// A borrowed channel; dropping it returns the borrow
pub struct ChannelLease {
    inner: Arc<SyncInner>,
    channel: Arc<dyn TransportChannel>,
    generation: u64,
    armed: bool,
}

impl ChannelLease {
    /// The borrowed channel
    pub fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    /// Generation of the borrowed channel
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the borrowed channel as broken
    pub fn fault(&self) {
        self.channel.abort();
        self.inner.channel_faulted(self.generation);
    }
}

impl Drop for ChannelLease {
    fn drop(&mut self) {
        if self.armed {
            self.inner.return_channel(self.generation);
        }
    }
}

impl std::fmt::Debug for ChannelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelLease")
            .field("generation", &self.generation)
            .field("remote", &self.channel.remote_address())
            .finish()
    }
}

impl SyncInner {
    fn emit(&self, event: ChannelEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    /// Hand the right to open to the first waiter that may open.
    /// Caller holds the lock; returns whether a waiter took it.
    fn pass_open_grant(&self, state: &mut SyncState) -> bool {
        if self.factory.is_none() {
            return false;
        }
        while let Some(pos) = state.waiters.iter().position(|w| w.can_open) {
            if let Some(waiter) = state.waiters.remove(pos) {
                let right = OpenRight {
                    inner: self.this.clone(),
                    armed: true,
                };
                match waiter.tx.send(Grant::Open(right)) {
                    Ok(()) => {
                        trace!("Passed open grant to waiter {}", waiter.id);
                        state.phase = SynchronizerState::ChannelOpening;
                        return true;
                    }
                    Err(Grant::Open(right)) => right.consume(),
                    Err(_) => {}
                }
            }
        }
        false
    }

    /// Drop the current channel and move to NoChannel or ChannelOpening.
    /// Caller holds the lock; returns the channel to abort after unlocking.
    fn reset_channel(&self, state: &mut SyncState) -> Option<Arc<dyn TransportChannel>> {
        let channel = state.channel.take();
        state.borrows = 0;
        state.phase = SynchronizerState::NoChannel;
        self.pass_open_grant(state);
        channel
    }

    fn fail_waiters(state: &mut SyncState, err: &RmError) {
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Grant::Error(err.clone()));
        }
    }

    fn return_channel(&self, generation: u64) {
        let to_abort = {
            let mut state = self.state.lock();
            if generation != state.generation || state.borrows == 0 {
                return;
            }
            state.borrows -= 1;
            if state.borrows > 0 {
                return;
            }

            self.drained.notify_waiters();
            if state.phase == SynchronizerState::ChannelClosing {
                debug!("Last borrower returned channel generation {}, resetting", generation);
                self.reset_channel(&mut state)
            } else {
                None
            }
        };

        if let Some(channel) = to_abort {
            channel.abort();
        }
    }

    fn channel_faulted(&self, generation: u64) {
        let (to_abort, event) = {
            let mut state = self.state.lock();
            if generation != state.generation || state.phase != SynchronizerState::ChannelOpened {
                return;
            }

            if self.tolerate_faults {
                info!("Channel generation {} lost ({} borrowers)", generation, state.borrows);
                let to_abort = if state.borrows == 0 {
                    self.reset_channel(&mut state)
                } else {
                    state.phase = SynchronizerState::ChannelClosing;
                    state.channel.clone()
                };
                (to_abort, ChannelEvent::ConnectionLost { generation })
            } else {
                warn!("Channel generation {} faulted", generation);
                let err = RmError::communication("the underlying channel faulted");
                state.phase = SynchronizerState::Faulted;
                state.terminal = Some(err.clone());
                Self::fail_waiters(&mut state, &err);
                (state.channel.take(), ChannelEvent::Faulted(err))
            }
        };

        if let Some(channel) = to_abort {
            channel.abort();
        }
        self.emit(event);
    }
}

impl ChannelSynchronizer {
    /// Create a synchronizer.
    ///
    /// Without a factory, channels only arrive through [`Self::set_channel`].
    /// With `tolerate_faults`, a faulted channel is dropped and replaced
    /// instead of faulting the synchronizer.
    pub fn new(
        factory: Option<Arc<dyn ChannelFactory>>,
        tolerate_faults: bool,
        events: Option<mpsc::UnboundedSender<ChannelEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| SyncInner {
                this: this.clone(),
                factory,
                tolerate_faults,
                state: Mutex::new(SyncState {
                    phase: SynchronizerState::Created,
                    channel: None,
                    generation: 0,
                    borrows: 0,
                    waiters: VecDeque::new(),
                    next_waiter_id: 0,
                    terminal: None,
                }),
                drained: Notify::new(),
                events,
            }),
        }
    }

    /// Current phase
    pub fn state(&self) -> SynchronizerState {
        self.inner.state.lock().phase
    }

    /// Outstanding borrows of the current channel
    pub fn borrow_count(&self) -> usize {
        self.inner.state.lock().borrows
    }

    /// Borrowers waiting for a channel
    pub fn waiter_count(&self) -> usize {
        self.inner.state.lock().waiters.len()
    }

    /// Current channel generation
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Allow borrowing
    pub fn open(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == SynchronizerState::Created {
            state.phase = SynchronizerState::NoChannel;
        }
    }

    /// Install a channel created elsewhere (server side re-arm).
    ///
    /// Any existing channel is replaced and aborted; queued waiters are
    /// released with the new channel.
    pub fn set_channel(&self, channel: Arc<dyn TransportChannel>) -> Result<(), RmError> {
        let (previous, generation) = {
            let mut state = self.inner.state.lock();
            let phase = state.phase;
            match phase {
                SynchronizerState::Faulted | SynchronizerState::Closed => {
                    let err = state.terminal.clone().unwrap_or(RmError::Disposed);
                    drop(state);
                    channel.abort();
                    return Err(err);
                }
                SynchronizerState::Created => {
                    drop(state);
                    channel.abort();
                    return Err(RmError::InvalidOperation(
                        "the synchronizer is not open".to_string(),
                    ));
                }
                _ => {}
            }

            let previous = state.channel.take();
            let generation = self.install(&mut state, channel.clone(), 0);
            (previous, generation)
        };

        if let Some(previous) = previous {
            debug!("Replacing channel with generation {}", generation);
            previous.abort();
        }
        self.spawn_fault_monitor(channel, generation);
        self.inner.emit(ChannelEvent::Opened { generation });
        Ok(())
    }

    /// Install `channel` under the lock and release every waiter with it
    fn install(&self, state: &mut SyncState, channel: Arc<dyn TransportChannel>, initial_borrows: usize) -> u64 {
        state.generation += 1;
        let generation = state.generation;
        state.channel = Some(channel.clone());
        state.phase = SynchronizerState::ChannelOpened;
        state.borrows = initial_borrows;

        // Undelivered grants were never counted
        for waiter in state.waiters.drain(..) {
            match waiter.tx.send(Grant::Channel(self.lease(channel.clone(), generation))) {
                Ok(()) => state.borrows += 1,
                Err(Grant::Channel(mut lease)) => lease.armed = false,
                Err(_) => {}
            }
        }
        debug!("Channel generation {} opened with {} borrowers", generation, state.borrows);
        generation
    }

    fn spawn_fault_monitor(&self, channel: Arc<dyn TransportChannel>, generation: u64) {
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            channel.faulted().await;
            if let Some(inner) = weak.upgrade() {
                inner.channel_faulted(generation);
            }
        });
    }

    fn lease(&self, channel: Arc<dyn TransportChannel>, generation: u64) -> ChannelLease {
        ChannelLease {
            inner: self.inner.clone(),
            channel,
            generation,
            armed: true,
        }
    }

    /// Borrow the channel.
    ///
    /// When no channel exists and `can_open` is set, this caller creates it
    /// (client side). Otherwise the call queues until a channel is installed,
    /// the synchronizer stops, or `timeout` elapses.
    pub async fn try_get_channel(&self, can_open: bool, timeout: Duration) -> Result<ChannelLease, RmError> {
        let deadline = Instant::now() + timeout;

        let rx = {
            let mut state = self.inner.state.lock();
            let phase = state.phase;
            match phase {
                SynchronizerState::Created => {
                    return Err(RmError::InvalidOperation(
                        "the synchronizer is not open".to_string(),
                    ))
                }
                SynchronizerState::Faulted | SynchronizerState::Closed => {
                    return Err(state.terminal.clone().unwrap_or(RmError::Disposed));
                }
                SynchronizerState::ChannelOpened => {
                    let Some(channel) = state.channel.clone() else {
                        return Err(RmError::InvalidOperation(
                            "the synchronizer has no channel".to_string(),
                        ));
                    };
                    state.borrows += 1;
                    let generation = state.generation;
                    drop(state);
                    return Ok(self.lease(channel, generation));
                }
                SynchronizerState::NoChannel if can_open && self.inner.factory.is_some() => {
                    state.phase = SynchronizerState::ChannelOpening;
                    None
                }
                _ => {
                    let (tx, rx) = oneshot::channel();
                    state.next_waiter_id += 1;
                    let id = state.next_waiter_id;
                    state.waiters.push_back(Waiter { id, can_open, tx });
                    trace!("Queued channel waiter {} (can_open={})", id, can_open);
                    Some((id, rx))
                }
            }
        };

        match rx {
            None => self.open_channel(deadline).await,
            Some((id, rx)) => self.wait_for_grant(id, rx, deadline, timeout).await,
        }
    }

    async fn wait_for_grant(
        &self,
        id: u64,
        mut rx: oneshot::Receiver<Grant>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ChannelLease, RmError> {
        let grant = match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(grant)) => grant,
            Ok(Err(_)) => return Err(RmError::Aborted),
            Err(_) => {
                let still_queued = {
                    let mut state = self.inner.state.lock();
                    match state.waiters.iter().position(|w| w.id == id) {
                        Some(pos) => {
                            state.waiters.remove(pos);
                            true
                        }
                        None => false,
                    }
                };

                if !still_queued {
                    // A grant raced with the timeout: give it back
                    match rx.try_recv() {
                        Ok(Grant::Channel(lease)) => drop(lease),
                        Ok(Grant::Open(right)) => drop(right),
                        _ => {}
                    }
                }

                return Err(RmError::timeout(format!(
                    "no channel became available within {:?}",
                    timeout
                )));
            }
        };

        match grant {
            Grant::Channel(lease) => Ok(lease),
            Grant::Open(right) => {
                right.consume();
                self.open_channel(deadline).await
            }
            Grant::Error(err) => Err(err),
        }
    }

    /// Create and open a channel; the caller has moved the phase to ChannelOpening
    async fn open_channel(&self, deadline: Instant) -> Result<ChannelLease, RmError> {
        let Some(factory) = self.inner.factory.clone() else {
            return Err(RmError::InvalidOperation("no channel factory".to_string()));
        };

        let opened = tokio::time::timeout_at(deadline, async {
            let channel = factory.create_channel().await?;
            let remaining = deadline.saturating_duration_since(Instant::now());
            channel.open(remaining).await?;
            Ok::<_, crate::error::TransportError>(channel)
        })
        .await;

        let result = match opened {
            Ok(Ok(channel)) => Ok(channel),
            Ok(Err(e)) => Err(RmError::from(e)),
            Err(_) => Err(RmError::timeout("opening the channel timed out")),
        };

        match result {
            Ok(channel) => {
                let generation = {
                    let mut state = self.inner.state.lock();
                    if state.phase != SynchronizerState::ChannelOpening {
                        let err = state.terminal.clone().unwrap_or(RmError::Aborted);
                        drop(state);
                        channel.abort();
                        return Err(err);
                    }
                    self.install(&mut state, channel.clone(), 1)
                };

                self.spawn_fault_monitor(channel.clone(), generation);
                self.inner.emit(ChannelEvent::Opened { generation });
                Ok(self.lease(channel, generation))
            }
            Err(err) => {
                debug!("Opening channel failed: {}", err);
                let mut state = self.inner.state.lock();
                if state.phase == SynchronizerState::ChannelOpening {
                    state.phase = SynchronizerState::NoChannel;
                    self.inner.pass_open_grant(&mut state);
                }
                Err(err)
            }
        }
    }

    /// Stop lending, wait for borrowers to return the channel, then close it
    pub async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        let deadline = Instant::now() + timeout;
        {
            let mut state = self.inner.state.lock();
            if matches!(state.phase, SynchronizerState::Faulted | SynchronizerState::Closed) {
                return Ok(());
            }
            state.phase = SynchronizerState::Closed;
            state.terminal = Some(RmError::Disposed);
            SyncInner::fail_waiters(&mut state, &RmError::Disposed);
        }

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.borrow_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("{} channel borrowers did not return within {:?}", self.borrow_count(), timeout);
                self.abort();
                return Err(RmError::timeout("channel borrowers did not drain in time"));
            }
        }

        let channel = self.inner.state.lock().channel.take();
        if let Some(channel) = channel {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let Err(e) = channel.close(remaining).await {
                debug!("Closing channel failed, aborting: {}", e);
                channel.abort();
            }
        }
        Ok(())
    }

    /// Stop immediately; waiters fail with [`RmError::Aborted`]
    pub fn abort(&self) {
        self.stop(SynchronizerState::Closed, RmError::Aborted);
    }

    /// Stop with `err`; waiters and later borrowers observe it
    pub fn fault(&self, err: RmError) {
        self.stop(SynchronizerState::Faulted, err);
    }

    fn stop(&self, phase: SynchronizerState, err: RmError) {
        let channel = {
            let mut state = self.inner.state.lock();
            if state.terminal.is_none() {
                state.terminal = Some(err.clone());
            }
            if !matches!(state.phase, SynchronizerState::Faulted | SynchronizerState::Closed) {
                state.phase = phase;
            }
            SyncInner::fail_waiters(&mut state, &err);
            state.channel.take()
        };
        if let Some(channel) = channel {
            channel.abort();
        }
        self.inner.drained.notify_waiters();
    }
}

impl std::fmt::Debug for ChannelSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ChannelSynchronizer")
            .field("phase", &state.phase)
            .field("generation", &state.generation)
            .field("borrows", &state.borrows)
            .field("waiters", &state.waiters.len())
            .finish()
    }
}
