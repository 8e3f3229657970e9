//! Error taxonomy for reliable sessions.
//!
//! Errors fall into four families: transient communication/timeout errors
//! (retry and fault-masking candidates), protocol violations (always fatal
//! and mapped to a protocol fault), quota errors, and object-state errors
//! raised once a session is faulted, aborted, or closed.

use rm_wire::{FaultBody, FaultCode, Message, ProtocolVersion, SequenceId, WireError};
use std::fmt;
use thiserror::Error;

/// A protocol fault raised locally or reported by the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceFault {
    /// Fault code
    pub code: FaultCode,
    /// Human-readable reason
    pub reason: String,
    /// Sequence the fault refers to
    pub id: Option<SequenceId>,
}

impl SequenceFault {
    /// Create a fault
    pub fn new(code: FaultCode, reason: impl Into<String>, id: Option<SequenceId>) -> Self {
        Self {
            code,
            reason: reason.into(),
            id,
        }
    }

    /// Fault for a sequence identifier this endpoint does not own
    pub fn unknown_sequence(id: SequenceId) -> Self {
        Self::new(
            FaultCode::UnknownSequence,
            format!("the sequence {} is not known", id),
            Some(id),
        )
    }

    /// Fault for an acknowledgement covering numbers never sent
    pub fn invalid_acknowledgement(id: SequenceId, reason: impl Into<String>) -> Self {
        Self::new(FaultCode::InvalidAcknowledgement, reason, Some(id))
    }

    /// Fault for a message number beyond the established last number
    pub fn last_message_number_exceeded(id: SequenceId, number: u64) -> Self {
        Self::new(
            FaultCode::LastMessageNumberExceeded,
            format!("message number {} exceeds the last message number", number),
            Some(id),
        )
    }

    /// Fault for a message sent on a closed sequence
    pub fn sequence_closed(id: SequenceId, number: u64) -> Self {
        Self::new(
            FaultCode::SequenceClosed,
            format!("message number {} arrived after the sequence was closed", number),
            Some(id),
        )
    }

    /// Fault terminating the sequence
    pub fn sequence_terminated(id: Option<SequenceId>, reason: impl Into<String>) -> Self {
        Self::new(FaultCode::SequenceTerminated, reason, id)
    }

    /// Fault for an exhausted message number space
    pub fn message_number_rollover(id: SequenceId) -> Self {
        Self::new(
            FaultCode::MessageNumberRollover,
            "the maximum message number was exceeded",
            Some(id),
        )
    }

    /// Fault carried by a received fault message
    pub fn from_body(body: &FaultBody) -> Self {
        Self::new(body.code, body.reason.clone(), body.id)
    }

    /// Build the wire fault message for `version`
    pub fn to_message(&self, version: ProtocolVersion) -> Message {
        Message::fault(version, self.code, self.reason.clone(), self.id)
    }
}

impl fmt::Display for SequenceFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{} ({}): {}", self.code, id, self.reason),
            None => write!(f, "{}: {}", self.code, self.reason),
        }
    }
}

/// Errors raised by the transport contract
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error on the underlying stream
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    /// The operation did not finish in time
    #[error("transport operation timed out")]
    Timeout,
    /// The channel is closed or faulted
    #[error("transport channel closed")]
    Closed,
    /// The channel shape does not support the operation
    #[error("operation not supported by this channel shape: {0}")]
    Unsupported(&'static str),
}

/// User-facing reliable session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RmError {
    /// Transient communication failure
    #[error("communication error: {0}")]
    Communication(String),
    /// Deadline exceeded
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// Protocol violation detected locally
    #[error("protocol violation: {0}")]
    Protocol(SequenceFault),
    /// Protocol fault reported by the peer
    #[error("peer reported fault: {0}")]
    RemoteFault(SequenceFault),
    /// A resource quota was exceeded
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The object is faulted
    #[error("the session is faulted: {0}")]
    Faulted(Box<RmError>),
    /// The object was aborted
    #[error("the session was aborted")]
    Aborted,
    /// The object was closed
    #[error("the session is closed")]
    Disposed,
    /// The call is not valid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl RmError {
    /// Create a communication error
    pub fn communication(msg: impl Into<String>) -> Self {
        RmError::Communication(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        RmError::Timeout(msg.into())
    }

    /// Whether the error is a retry / fault-masking candidate
    pub fn is_handleable(&self) -> bool {
        matches!(self, RmError::Communication(_) | RmError::Timeout(_))
    }

    /// Whether the error is a timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, RmError::Timeout(_))
    }

    /// The protocol fault carried by the error, if any
    pub fn fault(&self) -> Option<&SequenceFault> {
        match self {
            RmError::Protocol(fault) | RmError::RemoteFault(fault) => Some(fault),
            RmError::Faulted(inner) => inner.fault(),
            _ => None,
        }
    }

    /// The error surfaced to callers of a session that faulted with `self`
    pub fn into_faulted(self) -> Self {
        match self {
            RmError::Faulted(_) => self,
            other => RmError::Faulted(Box::new(other)),
        }
    }
}

impl From<SequenceFault> for RmError {
    fn from(fault: SequenceFault) -> Self {
        RmError::Protocol(fault)
    }
}

impl From<TransportError> for RmError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Io(e) => RmError::Communication(e.to_string()),
            TransportError::Closed => RmError::Communication("transport channel closed".to_string()),
            TransportError::Timeout => RmError::Timeout("transport operation timed out".to_string()),
            TransportError::Wire(e) => RmError::Protocol(SequenceFault::new(
                FaultCode::WsrmRequired,
                format!("malformed message: {}", e),
                None,
            )),
            TransportError::Unsupported(op) => {
                RmError::InvalidOperation(format!("transport does not support {}", op))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handleable_classification() {
        assert!(RmError::communication("reset").is_handleable());
        assert!(RmError::timeout("late").is_handleable());
        assert!(!RmError::Protocol(SequenceFault::sequence_terminated(None, "x")).is_handleable());
        assert!(!RmError::Aborted.is_handleable());
    }

    #[test]
    fn test_transport_error_mapping() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(RmError::from(TransportError::Io(io)).is_handleable());
        assert!(RmError::from(TransportError::Timeout).is_timeout());

        let wire = RmError::from(TransportError::Wire(WireError::Checksum));
        assert!(!wire.is_handleable());
        assert!(wire.fault().is_some());
    }

    #[test]
    fn test_faulted_wrapping_is_idempotent() {
        let err = RmError::communication("gone").into_faulted();
        let again = err.clone().into_faulted();
        assert_eq!(err, again);
    }
}
