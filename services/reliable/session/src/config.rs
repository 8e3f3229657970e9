//! Reliable session configuration.

use crate::delivery::DeliveryMode;
use crate::error::RmError;
use crate::output::OutputSettings;
use rm_wire::{ProtocolVersion, DEFAULT_MAX_MESSAGE_SIZE};
use std::time::Duration;

/// Configuration for a reliable session
#[derive(Debug, Clone)]
pub struct ReliableSessionConfig {
    /// Protocol revision spoken on the session
    pub version: ProtocolVersion,
    /// Deliver in sequence-number order
    pub ordered: bool,
    /// Unacknowledged (output) and undelivered (input) message bound
    pub max_transfer_window_size: usize,
    /// Retransmissions allowed per message before the session faults
    pub max_retry_count: u32,
    /// First retransmission delay
    pub initial_retry_interval: Duration,
    /// Cap for the doubling retransmission delay
    pub max_retry_interval: Duration,
    /// Delay before a batched acknowledgement is sent
    pub acknowledgement_interval: Duration,
    /// Fault the session when nothing arrives for this long
    pub inactivity_timeout: Duration,
    /// Advertise and honour BufferRemaining
    pub flow_control_enabled: bool,
    /// Offer an inbound sequence at CreateSequence
    pub duplex: bool,
    /// Acknowledgement ranges kept per inbound sequence
    pub max_sequence_ranges: usize,
    /// Per-attempt wait of a handshake request
    pub request_retry_interval: Duration,
    /// Upper bound of the reconnect backoff
    pub reconnect_backoff_max: Duration,
    /// Time allowed for a best-effort fault send
    pub fault_send_timeout: Duration,
    /// Largest encoded message accepted or sent
    pub max_message_size: usize,
}

impl Default for ReliableSessionConfig {
    fn default() -> Self {
        Self {
            version: ProtocolVersion::WsReliableMessaging11,
            ordered: true,
            max_transfer_window_size: 32,
            max_retry_count: 8,
            initial_retry_interval: Duration::from_millis(200),
            max_retry_interval: Duration::from_secs(5),
            acknowledgement_interval: Duration::from_millis(200),
            inactivity_timeout: Duration::from_secs(600),
            flow_control_enabled: true,
            duplex: true,
            max_sequence_ranges: 128,
            request_retry_interval: Duration::from_secs(1),
            reconnect_backoff_max: Duration::from_secs(2),
            fault_send_timeout: Duration::from_secs(1),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ReliableSessionConfig {
    /// Reject settings the session cannot run with
    pub fn validate(&self) -> Result<(), RmError> {
        let invalid = |what: &str| Err(RmError::InvalidOperation(format!("invalid configuration: {}", what)));

        if self.max_transfer_window_size == 0 {
            return invalid("max_transfer_window_size must be positive");
        }
        if self.max_retry_count == 0 {
            return invalid("max_retry_count must be positive");
        }
        if self.max_sequence_ranges == 0 {
            return invalid("max_sequence_ranges must be positive");
        }
        if self.initial_retry_interval.is_zero() || self.initial_retry_interval > self.max_retry_interval {
            return invalid("initial_retry_interval must be positive and at most max_retry_interval");
        }
        if self.request_retry_interval.is_zero() {
            return invalid("request_retry_interval must be positive");
        }
        if self.inactivity_timeout.is_zero() {
            return invalid("inactivity_timeout must be positive");
        }
        Ok(())
    }

    /// Delivery mode implied by `ordered`
    pub fn delivery_mode(&self) -> DeliveryMode {
        if self.ordered {
            DeliveryMode::Ordered
        } else {
            DeliveryMode::Unordered
        }
    }

    /// Settings of the outbound connection
    pub fn output_settings(&self) -> OutputSettings {
        OutputSettings {
            window: self.max_transfer_window_size,
            max_retry_count: self.max_retry_count,
            initial_retry_interval: self.initial_retry_interval,
            max_retry_interval: self.max_retry_interval,
            flow_control: self.flow_control_enabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ReliableSessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.delivery_mode(), DeliveryMode::Ordered);
        assert_eq!(config.output_settings().window, 32);
    }

    #[test]
    fn test_zero_window_rejected() {
        let config = ReliableSessionConfig {
            max_transfer_window_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(RmError::InvalidOperation(_))));

        let config = ReliableSessionConfig {
            max_retry_count: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
