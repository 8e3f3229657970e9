//! Best-effort delivery of protocol faults to the peer.

use crate::binder::{MaskingMode, ReliableChannelBinder};
use futures::future::join_all;
use parking_lot::Mutex;
use rm_wire::Message;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tracks fault sends so shutdown can wait for or cancel them
pub struct FaultHelper {
    send_timeout: Duration,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl FaultHelper {
    /// Fault sends are bounded by `send_timeout`
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            send_timeout,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Send `fault` in the background; failures are swallowed
    pub fn send_fault(&self, binder: Arc<ReliableChannelBinder>, fault: Message) {
        let timeout = self.send_timeout;
        let handle = tokio::spawn(async move {
            debug!("Sending fault {:?} to {}", fault.action, binder.remote_address());
            if let Err(e) = binder.send(fault, timeout, MaskingMode::ALL).await {
                debug!("Fault send failed: {}", e);
            }
        });

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Fault sends still running
    pub fn pending_count(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.len()
    }

    /// Wait up to `timeout` for outstanding sends, cancelling the rest
    pub async fn close(&self, timeout: Duration) {
        let handles: Vec<_> = std::mem::take(&mut *self.pending.lock());
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(timeout, join_all(handles)).await.is_err() {
            warn!("{} fault sends still running at close, cancelling", aborts.len());
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Cancel outstanding sends
    pub fn abort(&self) {
        for handle in self.pending.lock().drain(..) {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for FaultHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultHelper")
            .field("send_timeout", &self.send_timeout)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binder::BinderSettings;
    use crate::error::SequenceFault;
    use crate::memory::MemoryChannel;
    use crate::transport::{ChannelShape, TransportChannel};
    use rm_wire::{Action, EndpointAddress, ProtocolVersion, SequenceId};

    fn binder() -> Arc<ReliableChannelBinder> {
        Arc::new(ReliableChannelBinder::server(
            BinderSettings {
                shape: ChannelShape::Duplex,
                local_address: EndpointAddress::new("urn:test:server"),
                remote_address: EndpointAddress::new("urn:test:client"),
                reconnect_backoff_max: Duration::from_millis(20),
            },
            None,
        ))
    }

    #[tokio::test]
    async fn test_fault_is_delivered() {
        let (local, remote) = MemoryChannel::pair("server", "client");
        let binder = binder();
        binder.open(Duration::from_secs(1)).await.unwrap();
        binder.set_channel(local).unwrap();

        let helper = FaultHelper::new(Duration::from_secs(1));
        let fault = SequenceFault::unknown_sequence(SequenceId::generate());
        helper.send_fault(binder, fault.to_message(ProtocolVersion::WsReliableMessaging11));
        helper.close(Duration::from_secs(1)).await;

        let received = remote.try_receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(received.action, Action::Fault);
        assert_eq!(helper.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_is_cancelled() {
        // No channel is ever installed, so the send waits for its full timeout
        let binder = binder();
        binder.open(Duration::from_secs(1)).await.unwrap();

        let helper = FaultHelper::new(Duration::from_secs(30));
        let fault = SequenceFault::sequence_terminated(None, "stop");
        helper.send_fault(binder.clone(), fault.to_message(ProtocolVersion::WsrmFebruary2005));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(binder.synchronizer().waiter_count(), 1);

        helper.close(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(helper.pending_count(), 0);
        helper.abort();
    }
}
