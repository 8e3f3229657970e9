//! Small coordination primitives shared by the session components.
//!
//! - [`Guard`]: admission gate; `close` stops new entries and waits for the
//!   ones in flight to leave.
//! - [`InterruptibleWaitObject`]: a settable signal that can also be faulted
//!   or aborted, waking every waiter with the corresponding error.
//! - [`InterruptibleTimer`]: cancelable delayed callback.

use crate::error::RmError;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Default)]
struct GuardState {
    active: usize,
    closed: bool,
    aborted: bool,
}

#[derive(Debug, Default)]
struct GuardInner {
    state: Mutex<GuardState>,
    drained: Notify,
}

/// Admission gate with drain-on-close
#[derive(Debug, Clone, Default)]
pub struct Guard {
    inner: Arc<GuardInner>,
}

/// Proof of admission; leaving the guarded region happens on drop
#[derive(Debug)]
pub struct GuardTicket {
    inner: Arc<GuardInner>,
}

impl Drop for GuardTicket {
    fn drop(&mut self) {
        let drained = {
            let mut state = self.inner.state.lock();
            state.active -= 1;
            state.active == 0
        };
        if drained {
            self.inner.drained.notify_waiters();
        }
    }
}

impl Guard {
    /// Create an open guard
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the guarded region; `None` once the guard is closing
    pub fn enter(&self) -> Option<GuardTicket> {
        let mut state = self.inner.state.lock();
        if state.closed {
            return None;
        }
        state.active += 1;
        Some(GuardTicket {
            inner: self.inner.clone(),
        })
    }

    /// Number of callers currently inside
    pub fn active(&self) -> usize {
        self.inner.state.lock().active
    }

    /// Stop admitting and wait until everyone inside has left
    pub async fn close(&self, timeout: Duration) -> Result<(), RmError> {
        let deadline = Instant::now() + timeout;
        self.inner.state.lock().closed = true;

        loop {
            let notified = self.inner.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.inner.state.lock();
                if state.aborted {
                    return Err(RmError::Aborted);
                }
                if state.active == 0 {
                    return Ok(());
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let active = self.active();
                return Err(RmError::timeout(format!(
                    "{} operations still in progress after {:?}",
                    active, timeout
                )));
            }
        }
    }

    /// Stop admitting without waiting; pending `close` calls fail with `Aborted`
    pub fn abort(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closed = true;
            state.aborted = true;
        }
        self.inner.drained.notify_waiters();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitState {
    Unset,
    Set,
    Faulted(RmError),
    Aborted,
}

/// Signal that waiters can block on and that faults or aborts interrupt
#[derive(Debug, Clone)]
pub struct InterruptibleWaitObject {
    state: Arc<watch::Sender<WaitState>>,
}

impl Default for InterruptibleWaitObject {
    fn default() -> Self {
        Self::new(false)
    }
}

impl InterruptibleWaitObject {
    /// Create a signal, optionally already set
    pub fn new(signaled: bool) -> Self {
        let initial = if signaled {
            WaitState::Set
        } else {
            WaitState::Unset
        };
        let (tx, _) = watch::channel(initial);
        Self { state: Arc::new(tx) }
    }

    /// Signal every current and future waiter
    pub fn set(&self) {
        self.state.send_if_modified(|state| {
            if *state == WaitState::Unset {
                *state = WaitState::Set;
                true
            } else {
                false
            }
        });
    }

    /// Return to the unsignaled state, unless faulted or aborted
    pub fn reset(&self) {
        self.state.send_if_modified(|state| {
            if *state == WaitState::Set {
                *state = WaitState::Unset;
                true
            } else {
                false
            }
        });
    }

    /// Wake every waiter with `err`
    pub fn fault(&self, err: RmError) {
        self.state.send_if_modified(|state| match state {
            WaitState::Unset | WaitState::Set => {
                *state = WaitState::Faulted(err);
                true
            }
            _ => false,
        });
    }

    /// Wake every waiter with [`RmError::Aborted`]
    pub fn abort(&self) {
        self.state.send_if_modified(|state| match state {
            WaitState::Unset | WaitState::Set => {
                *state = WaitState::Aborted;
                true
            }
            _ => false,
        });
    }

    /// Whether the signal is currently set
    pub fn is_set(&self) -> bool {
        *self.state.borrow() == WaitState::Set
    }

    /// Wait for the signal; a timeout is an error
    pub async fn wait(&self, timeout: Duration) -> Result<(), RmError> {
        match self.wait_inner(timeout).await {
            Some(result) => result,
            None => Err(RmError::timeout(format!(
                "the operation did not complete within {:?}",
                timeout
            ))),
        }
    }

    /// Wait for the signal; returns false on timeout, errors only on fault or abort
    pub async fn try_wait(&self, timeout: Duration) -> Result<bool, RmError> {
        match self.wait_inner(timeout).await {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    async fn wait_inner(&self, timeout: Duration) -> Option<Result<(), RmError>> {
        let mut rx = self.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            match rx.wait_for(|s| *s != WaitState::Unset).await {
                Ok(state) => match &*state {
                    WaitState::Faulted(err) => Err(err.clone()),
                    WaitState::Aborted => Err(RmError::Aborted),
                    _ => Ok(()),
                },
                Err(_) => Err(RmError::Aborted),
            }
        })
        .await;
        waited.ok()
    }
}

/// Callback run when an [`InterruptibleTimer`] elapses
pub type TimerCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct TimerState {
    generation: u64,
    handle: Option<JoinHandle<()>>,
    aborted: bool,
}

struct TimerInner {
    callback: TimerCallback,
    state: Mutex<TimerState>,
}

/// Cancelable delayed callback, re-armable from inside its own callback
#[derive(Clone)]
pub struct InterruptibleTimer {
    inner: Arc<TimerInner>,
}

impl InterruptibleTimer {
    /// Create an unarmed timer
    pub fn new(callback: TimerCallback) -> Self {
        Self {
            inner: Arc::new(TimerInner {
                callback,
                state: Mutex::new(TimerState::default()),
            }),
        }
    }

    /// Arm the timer, replacing any pending expiry
    pub fn set(&self, delay: Duration) {
        let mut state = self.inner.state.lock();
        if state.aborted {
            return;
        }
        Self::arm(&self.inner, &mut state, delay);
    }

    /// Arm the timer only if it is not already pending; returns whether it armed
    pub fn set_if_not_set(&self, delay: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.aborted || state.handle.is_some() {
            return false;
        }
        Self::arm(&self.inner, &mut state, delay);
        true
    }

    /// Move a pending expiry to `delay` from now; no-op when unarmed
    pub fn change(&self, delay: Duration) -> bool {
        let mut state = self.inner.state.lock();
        if state.aborted || state.handle.is_none() {
            return false;
        }
        Self::arm(&self.inner, &mut state, delay);
        true
    }

    /// Disarm; returns whether an expiry was pending
    pub fn cancel(&self) -> bool {
        let mut state = self.inner.state.lock();
        state.generation += 1;
        match state.handle.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Disarm permanently
    pub fn abort(&self) {
        self.cancel();
        self.inner.state.lock().aborted = true;
    }

    /// Whether an expiry is pending
    pub fn is_set(&self) -> bool {
        self.inner.state.lock().handle.is_some()
    }

    fn arm(inner: &Arc<TimerInner>, state: &mut TimerState, delay: Duration) {
        if let Some(previous) = state.handle.take() {
            previous.abort();
        }
        state.generation += 1;
        let generation = state.generation;
        let weak: Weak<TimerInner> = Arc::downgrade(inner);

        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(inner) = weak.upgrade() else {
                return;
            };
            let callback = {
                let mut state = inner.state.lock();
                if state.generation != generation {
                    return;
                }
                // Detach so the callback can re-arm without aborting itself
                state.handle = None;
                inner.callback.clone()
            };
            trace!("Timer generation {} elapsed", generation);
            callback().await;
        }));
    }
}

impl Drop for TimerInner {
    fn drop(&mut self) {
        if let Some(handle) = self.state.get_mut().handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_timer() -> (InterruptibleTimer, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let timer = InterruptibleTimer::new(Arc::new(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        }));
        (timer, fired)
    }

    #[tokio::test]
    async fn test_guard_close_waits_for_drain() {
        let guard = Guard::new();
        let ticket = guard.enter().unwrap();

        let closer = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.close(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(guard.enter().is_none());

        drop(ticket);
        closer.await.unwrap().unwrap();
        assert_eq!(guard.active(), 0);
    }

    #[tokio::test]
    async fn test_guard_close_times_out() {
        let guard = Guard::new();
        let _ticket = guard.enter().unwrap();
        let err = guard.close(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_guard_abort_interrupts_close() {
        let guard = Guard::new();
        let _ticket = guard.enter().unwrap();
        let closer = {
            let guard = guard.clone();
            tokio::spawn(async move { guard.close(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        guard.abort();
        assert_eq!(closer.await.unwrap(), Err(RmError::Aborted));
    }

    #[tokio::test]
    async fn test_wait_object_signals() {
        let signal = InterruptibleWaitObject::new(false);
        assert!(!signal.try_wait(Duration::from_millis(5)).await.unwrap());
        assert!(signal.wait(Duration::from_millis(5)).await.unwrap_err().is_timeout());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        signal.set();
        waiter.await.unwrap().unwrap();

        signal.reset();
        assert!(!signal.is_set());
    }

    #[tokio::test]
    async fn test_wait_object_fault_wakes_waiters() {
        let signal = InterruptibleWaitObject::default();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.try_wait(Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        signal.fault(RmError::communication("lost"));

        assert_eq!(waiter.await.unwrap(), Err(RmError::communication("lost")));
        signal.set();
        assert!(!signal.is_set());

        let aborted = InterruptibleWaitObject::default();
        aborted.abort();
        assert_eq!(aborted.wait(Duration::from_secs(1)).await, Err(RmError::Aborted));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once() {
        let (timer, fired) = counting_timer();
        assert!(timer.set_if_not_set(Duration::from_millis(100)));
        assert!(!timer.set_if_not_set(Duration::from_millis(10)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cancel_and_abort() {
        let (timer, fired) = counting_timer();
        timer.set(Duration::from_millis(50));
        assert!(timer.cancel());
        assert!(!timer.cancel());

        timer.abort();
        timer.set(Duration::from_millis(10));
        assert!(!timer.is_set());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_change_moves_expiry() {
        let (timer, fired) = counting_timer();
        assert!(!timer.change(Duration::from_millis(10)));

        timer.set(Duration::from_millis(100));
        assert!(timer.change(Duration::from_millis(300)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
