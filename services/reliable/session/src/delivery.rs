//! Bounded release queue between the protocol layer and the application.
//!
//! The receive path enqueues payloads by message number; the application
//! dequeues them. [`DeliveryMode::Ordered`] releases strictly increasing,
//! contiguous numbers and buffers gaps, [`DeliveryMode::Unordered`] releases
//! every message as soon as it arrives. Either way the number of undelivered
//! messages is capped by the transfer window, which is what the session
//! advertises to the peer as `BufferRemaining`.

use crate::error::RmError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Callback invoked after the application took a message
pub type DequeueCallback = Arc<dyn Fn() + Send + Sync>;

/// Release policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Release in message-number order
    Ordered,
    /// Release on arrival
    Unordered,
}

#[derive(Debug)]
struct DeliveryState {
    ready: VecDeque<Bytes>,
    /// Out-of-order messages; `None` marks an empty LastMessage
    buffered: BTreeMap<u64, Option<Bytes>>,
    next_expected: u64,
    completed: bool,
    disposed: bool,
    fault: Option<RmError>,
}

impl DeliveryState {
    fn enqueued_count(&self) -> usize {
        self.ready.len() + self.buffered.len()
    }

    fn release_contiguous(&mut self) {
        while let Some(entry) = self.buffered.remove(&self.next_expected) {
            if let Some(payload) = entry {
                self.ready.push_back(payload);
            }
            self.next_expected += 1;
        }
    }
}

/// Ordered or unordered delivery queue
pub struct DeliveryStrategy {
    mode: DeliveryMode,
    quota: usize,
    state: Mutex<DeliveryState>,
    available: Notify,
    on_dequeue: Mutex<Option<DequeueCallback>>,
}

impl DeliveryStrategy {
    /// Create a queue holding at most `quota` undelivered messages
    pub fn new(mode: DeliveryMode, quota: usize) -> Self {
        Self {
            mode,
            quota,
            state: Mutex::new(DeliveryState {
                ready: VecDeque::new(),
                buffered: BTreeMap::new(),
                next_expected: 1,
                completed: false,
                disposed: false,
                fault: None,
            }),
            available: Notify::new(),
            on_dequeue: Mutex::new(None),
        }
    }

    /// Release policy
    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Install the callback run after each successful dequeue
    pub fn set_dequeue_callback(&self, callback: DequeueCallback) {
        *self.on_dequeue.lock() = Some(callback);
    }

    /// Undelivered messages, including buffered gaps
    pub fn enqueued_count(&self) -> usize {
        self.state.lock().enqueued_count()
    }

    /// Free slots to advertise to the peer
    pub fn buffer_remaining(&self) -> u64 {
        self.quota.saturating_sub(self.enqueued_count()) as u64
    }

    /// Whether message `number` can be accepted now.
    ///
    /// The next expected number of an ordered queue is always accepted so a
    /// window full of out-of-order messages cannot stall delivery.
    pub fn can_enqueue(&self, number: u64) -> bool {
        let state = self.state.lock();
        if state.disposed || state.fault.is_some() {
            return false;
        }
        if state.enqueued_count() < self.quota {
            return true;
        }
        self.mode == DeliveryMode::Ordered && number == state.next_expected
    }

    /// Enqueue the payload of message `number`.
    ///
    /// `payload` is `None` for an empty LastMessage, which occupies a number
    /// but is never handed to the application.
    pub fn enqueue(&self, number: u64, payload: Option<Bytes>) -> bool {
        {
            let mut state = self.state.lock();
            if state.disposed || state.fault.is_some() || state.completed {
                return false;
            }

            match self.mode {
                DeliveryMode::Unordered => {
                    if let Some(payload) = payload {
                        state.ready.push_back(payload);
                    }
                }
                DeliveryMode::Ordered => {
                    if number < state.next_expected || state.buffered.contains_key(&number) {
                        trace!("Ignoring already delivered message {}", number);
                        return false;
                    }
                    state.buffered.insert(number, payload);
                    state.release_contiguous();
                }
            }
            trace!(
                "Enqueued message {} ({} ready, {} buffered)",
                number,
                state.ready.len(),
                state.buffered.len()
            );
        }

        self.available.notify_waiters();
        true
    }

    /// Signal that no further messages will arrive
    pub fn complete(&self) {
        self.state.lock().completed = true;
        self.available.notify_waiters();
    }

    /// Fail pending and future dequeues with `err`
    pub fn fault(&self, err: RmError) {
        {
            let mut state = self.state.lock();
            if state.fault.is_none() {
                state.fault = Some(err);
            }
        }
        self.available.notify_waiters();
    }

    /// Take the next message.
    ///
    /// Returns `Ok(None)` once the input is complete and drained.
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Bytes>, RmError> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_dequeue() {
                return result;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(RmError::timeout(format!(
                    "no message was received within {:?}",
                    timeout
                )));
            }
        }
    }

    fn try_dequeue(&self) -> Option<Result<Option<Bytes>, RmError>> {
        let taken = {
            let mut state = self.state.lock();
            if let Some(err) = &state.fault {
                return Some(Err(err.clone()));
            }
            if state.disposed {
                return Some(Err(RmError::Disposed));
            }
            match state.ready.pop_front() {
                Some(payload) => payload,
                None if state.completed && state.buffered.is_empty() => return Some(Ok(None)),
                None => return None,
            }
        };

        let callback = self.on_dequeue.lock().clone();
        if let Some(callback) = callback {
            callback();
        }
        Some(Ok(Some(taken)))
    }

    /// Release every undelivered message; returns how many were released
    pub fn dispose(&self) -> usize {
        let released = {
            let mut state = self.state.lock();
            if state.disposed {
                return 0;
            }
            state.disposed = true;
            let released = state.ready.len() + state.buffered.values().filter(|p| p.is_some()).count();
            state.ready.clear();
            state.buffered.clear();
            released
        };

        if released > 0 {
            debug!("Released {} undelivered messages", released);
        }
        self.on_dequeue.lock().take();
        self.available.notify_waiters();
        released
    }
}

impl std::fmt::Debug for DeliveryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryStrategy")
            .field("mode", &self.mode)
            .field("quota", &self.quota)
            .field("state", &*self.state.lock())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const SHORT: Duration = Duration::from_millis(10);

    fn payload(n: u64) -> Option<Bytes> {
        Some(Bytes::from(n.to_string()))
    }

    #[tokio::test]
    async fn test_ordered_releases_increasing_numbers() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Ordered, 16);
        for n in [3u64, 1, 5, 2, 4] {
            assert!(delivery.enqueue(n, payload(n)));
        }

        for expected in 1..=5u64 {
            let got = delivery.dequeue(SHORT).await.unwrap().unwrap();
            assert_eq!(got, Bytes::from(expected.to_string()));
        }
        assert!(delivery.dequeue(SHORT).await.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_ordered_holds_gap() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Ordered, 16);
        delivery.enqueue(2, payload(2));
        assert!(delivery.dequeue(SHORT).await.unwrap_err().is_timeout());
        assert_eq!(delivery.enqueued_count(), 1);

        delivery.enqueue(1, payload(1));
        assert_eq!(delivery.dequeue(SHORT).await.unwrap(), payload(1));
        assert_eq!(delivery.dequeue(SHORT).await.unwrap(), payload(2));
    }

    #[tokio::test]
    async fn test_unordered_releases_each_once() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Unordered, 16);
        for n in [4u64, 2, 9] {
            delivery.enqueue(n, payload(n));
        }

        let mut got = Vec::new();
        for _ in 0..3 {
            got.push(delivery.dequeue(SHORT).await.unwrap().unwrap());
        }
        assert_eq!(got, vec![payload(4).unwrap(), payload(2).unwrap(), payload(9).unwrap()]);
        assert!(delivery.dequeue(SHORT).await.is_err());
    }

    #[test]
    fn test_quota_backpressure() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Ordered, 2);
        delivery.enqueue(2, payload(2));
        delivery.enqueue(3, payload(3));

        assert_eq!(delivery.buffer_remaining(), 0);
        assert!(!delivery.can_enqueue(4));
        assert!(delivery.can_enqueue(1));

        let unordered = DeliveryStrategy::new(DeliveryMode::Unordered, 1);
        unordered.enqueue(1, payload(1));
        assert!(!unordered.can_enqueue(2));
    }

    #[tokio::test]
    async fn test_empty_last_message_skipped() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Ordered, 4);
        delivery.enqueue(2, None);
        delivery.enqueue(1, payload(1));
        delivery.complete();

        assert_eq!(delivery.dequeue(SHORT).await.unwrap(), payload(1));
        assert_eq!(delivery.dequeue(SHORT).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let delivery = Arc::new(DeliveryStrategy::new(DeliveryMode::Unordered, 4));
        let consumer = {
            let delivery = delivery.clone();
            tokio::spawn(async move { delivery.dequeue(Duration::from_secs(5)).await })
        };

        tokio::task::yield_now().await;
        delivery.enqueue(1, payload(1));
        assert_eq!(consumer.await.unwrap().unwrap(), payload(1));
    }

    #[tokio::test]
    async fn test_dequeue_callback_runs() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Unordered, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        delivery.set_dequeue_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        delivery.enqueue(1, payload(1));
        delivery.dequeue(SHORT).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fault_and_dispose() {
        let delivery = DeliveryStrategy::new(DeliveryMode::Ordered, 4);
        delivery.enqueue(1, payload(1));
        delivery.enqueue(3, payload(3));
        assert_eq!(delivery.dispose(), 2);
        assert_eq!(delivery.dequeue(SHORT).await, Err(RmError::Disposed));
        assert!(!delivery.enqueue(2, payload(2)));

        let faulted = DeliveryStrategy::new(DeliveryMode::Unordered, 4);
        faulted.fault(RmError::communication("reset"));
        assert_eq!(
            faulted.dequeue(SHORT).await,
            Err(RmError::communication("reset"))
        );
    }
}
