//! Logical protocol messages.
//!
//! A [`Message`] is what the session layer reasons about: addressing headers,
//! the reliable messaging headers that may piggyback on any message
//! (Sequence, AckRequested, SequenceAcknowledgement) and a typed body. Turning
//! it into bytes is the job of a [`crate::MessageEncoder`].

use crate::range::SequenceRange;
use crate::version::{Action, FaultCode, ProtocolVersion};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use uuid::Uuid;

/// Identifier of one direction of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SequenceId(pub Uuid);

impl SequenceId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

/// Message identifier used to correlate replies with requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Generate a fresh random identifier
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "urn:uuid:{}", self.0)
    }
}

/// Endpoint address (opaque URI)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointAddress(pub String);

impl EndpointAddress {
    /// Create an address from anything string-like
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    /// The anonymous address, meaning "reply on the back-channel"
    pub fn anonymous() -> Self {
        Self("urn:anonymous".to_string())
    }

    /// Borrow the URI
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `Sequence` header on a sequenced message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceHeader {
    /// Sequence the message belongs to
    pub id: SequenceId,
    /// 1-based message number
    pub number: u64,
    /// LastMessage marker (February 2005 only)
    pub last_message: bool,
}

/// `AckRequested` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequested {
    /// Sequence whose acknowledgement is requested
    pub id: SequenceId,
}

/// `SequenceAcknowledgement` header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceAcknowledgement {
    /// Sequence being acknowledged
    pub id: SequenceId,
    /// Ranges received so far
    pub ranges: SmallVec<[SequenceRange; 4]>,
    /// Final acknowledgement: no further ranges will be added (1.1 only)
    pub final_ack: bool,
    /// Free slots in the receiver's delivery buffer, when flow control is on
    pub buffer_remaining: Option<u64>,
}

/// CreateSequence body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequence {
    /// Where acknowledgements for the new sequence should go
    pub acks_to: EndpointAddress,
    /// Requested lifetime in milliseconds, if bounded
    pub expires_ms: Option<u64>,
    /// Offered identifier for the reverse sequence
    pub offer: Option<SequenceId>,
}

/// CreateSequenceResponse body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSequenceResponse {
    /// Identifier assigned to the new sequence
    pub id: SequenceId,
    /// Granted lifetime in milliseconds, if bounded
    pub expires_ms: Option<u64>,
    /// Acceptance of the offered reverse sequence
    pub accept: Option<EndpointAddress>,
}

/// CloseSequence / TerminateSequence body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceControl {
    /// Sequence being closed or terminated
    pub id: SequenceId,
    /// Last message number the sender assigned (1.1 only)
    pub last_msg_number: Option<u64>,
}

/// Protocol fault body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultBody {
    /// Fault code
    pub code: FaultCode,
    /// Version-qualified fault code URI
    pub qualified_code: String,
    /// Human-readable reason
    pub reason: String,
    /// Sequence the fault refers to, when known
    pub id: Option<SequenceId>,
}

/// Typed message body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// No body (standalone headers)
    Empty,
    /// Opaque application payload
    Application(Bytes),
    /// CreateSequence request
    CreateSequence(CreateSequence),
    /// CreateSequence reply
    CreateSequenceResponse(CreateSequenceResponse),
    /// CloseSequence request
    CloseSequence(SequenceControl),
    /// CloseSequence reply
    CloseSequenceResponse(SequenceId),
    /// TerminateSequence request
    TerminateSequence(SequenceControl),
    /// TerminateSequence reply
    TerminateSequenceResponse(SequenceId),
    /// Protocol fault
    Fault(FaultBody),
}

/// Addressing and reliable messaging headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Unique id of this message
    pub message_id: MessageId,
    /// Request this message replies to
    pub relates_to: Option<MessageId>,
    /// Destination address
    pub to: Option<EndpointAddress>,
    /// Address replies should be sent to
    pub reply_to: Option<EndpointAddress>,
    /// Sequence header
    pub sequence: Option<SequenceHeader>,
    /// AckRequested header
    pub ack_requested: Option<AckRequested>,
    /// SequenceAcknowledgement header
    pub acknowledgement: Option<SequenceAcknowledgement>,
}

impl MessageHeaders {
    fn fresh() -> Self {
        Self {
            message_id: MessageId::generate(),
            relates_to: None,
            to: None,
            reply_to: None,
            sequence: None,
            ack_requested: None,
            acknowledgement: None,
        }
    }
}

/// Logical protocol message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Protocol revision the message was built for
    pub version: ProtocolVersion,
    /// Action identifying the body
    pub action: Action,
    /// Headers
    pub headers: MessageHeaders,
    /// Body
    pub body: MessageBody,
}

impl Message {
    fn with_body(version: ProtocolVersion, action: Action, body: MessageBody) -> Self {
        Self {
            version,
            action,
            headers: MessageHeaders::fresh(),
            body,
        }
    }

    /// Sequenced application message
    pub fn sequenced(version: ProtocolVersion, id: SequenceId, number: u64, payload: Bytes) -> Self {
        let mut msg = Self::with_body(version, Action::Application, MessageBody::Application(payload));
        msg.headers.sequence = Some(SequenceHeader {
            id,
            number,
            last_message: false,
        });
        msg
    }

    /// Empty sequenced message carrying the LastMessage marker
    pub fn last_message(version: ProtocolVersion, id: SequenceId, number: u64) -> Self {
        let mut msg = Self::with_body(version, Action::LastMessage, MessageBody::Empty);
        msg.headers.sequence = Some(SequenceHeader {
            id,
            number,
            last_message: true,
        });
        msg
    }

    /// Standalone acknowledgement
    pub fn acknowledgement(version: ProtocolVersion, ack: SequenceAcknowledgement) -> Self {
        let mut msg = Self::with_body(version, Action::SequenceAcknowledgement, MessageBody::Empty);
        msg.headers.acknowledgement = Some(ack);
        msg
    }

    /// Standalone acknowledgement request
    pub fn ack_requested(version: ProtocolVersion, id: SequenceId) -> Self {
        let mut msg = Self::with_body(version, Action::AckRequested, MessageBody::Empty);
        msg.headers.ack_requested = Some(AckRequested { id });
        msg
    }

    /// CreateSequence request
    pub fn create_sequence(version: ProtocolVersion, body: CreateSequence) -> Self {
        let reply_to = body.acks_to.clone();
        let mut msg = Self::with_body(version, Action::CreateSequence, MessageBody::CreateSequence(body));
        msg.headers.reply_to = Some(reply_to);
        msg
    }

    /// CreateSequence reply to `request`
    pub fn create_sequence_response(
        version: ProtocolVersion,
        request: MessageId,
        body: CreateSequenceResponse,
    ) -> Self {
        Self::with_body(
            version,
            Action::CreateSequenceResponse,
            MessageBody::CreateSequenceResponse(body),
        )
        .relating_to(request)
    }

    /// CloseSequence request
    pub fn close_sequence(version: ProtocolVersion, id: SequenceId, last: u64) -> Self {
        Self::with_body(
            version,
            Action::CloseSequence,
            MessageBody::CloseSequence(SequenceControl {
                id,
                last_msg_number: Some(last),
            }),
        )
    }

    /// CloseSequence reply to `request`
    pub fn close_sequence_response(version: ProtocolVersion, request: MessageId, id: SequenceId) -> Self {
        Self::with_body(
            version,
            Action::CloseSequenceResponse,
            MessageBody::CloseSequenceResponse(id),
        )
        .relating_to(request)
    }

    /// TerminateSequence request; the last number is only sent on 1.1
    pub fn terminate_sequence(version: ProtocolVersion, id: SequenceId, last: u64) -> Self {
        let last_msg_number = if version.has_terminate_response() {
            Some(last)
        } else {
            None
        };
        Self::with_body(
            version,
            Action::TerminateSequence,
            MessageBody::TerminateSequence(SequenceControl { id, last_msg_number }),
        )
    }

    /// TerminateSequence reply to `request`
    pub fn terminate_sequence_response(
        version: ProtocolVersion,
        request: MessageId,
        id: SequenceId,
    ) -> Self {
        Self::with_body(
            version,
            Action::TerminateSequenceResponse,
            MessageBody::TerminateSequenceResponse(id),
        )
        .relating_to(request)
    }

    /// Protocol fault
    pub fn fault(version: ProtocolVersion, code: FaultCode, reason: impl Into<String>, id: Option<SequenceId>) -> Self {
        Self::with_body(
            version,
            Action::Fault,
            MessageBody::Fault(FaultBody {
                code,
                qualified_code: version.fault_code_uri(code),
                reason: reason.into(),
                id,
            }),
        )
    }

    /// Set the RelatesTo header
    pub fn relating_to(mut self, request: MessageId) -> Self {
        self.headers.relates_to = Some(request);
        self
    }

    /// Piggyback an acknowledgement
    pub fn with_acknowledgement(mut self, ack: SequenceAcknowledgement) -> Self {
        self.headers.acknowledgement = Some(ack);
        self
    }

    /// Piggyback an acknowledgement request
    pub fn with_ack_requested(mut self, id: SequenceId) -> Self {
        self.headers.ack_requested = Some(AckRequested { id });
        self
    }

    /// Message id
    pub fn id(&self) -> MessageId {
        self.headers.message_id
    }

    /// Application payload, if any
    pub fn payload(&self) -> Option<&Bytes> {
        match &self.body {
            MessageBody::Application(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Check that headers, body, action, and version agree
    pub fn validate(&self) -> Result<(), crate::WireError> {
        if !self.action.is_defined_in(self.version) {
            return Err(crate::WireError::Malformed("action not defined in protocol version"));
        }

        let body_matches = match (&self.body, self.action) {
            (MessageBody::Application(_), Action::Application) => true,
            (MessageBody::Empty, Action::SequenceAcknowledgement)
            | (MessageBody::Empty, Action::AckRequested)
            | (MessageBody::Empty, Action::LastMessage) => true,
            (MessageBody::CreateSequence(_), Action::CreateSequence) => true,
            (MessageBody::CreateSequenceResponse(_), Action::CreateSequenceResponse) => true,
            (MessageBody::CloseSequence(_), Action::CloseSequence) => true,
            (MessageBody::CloseSequenceResponse(_), Action::CloseSequenceResponse) => true,
            (MessageBody::TerminateSequence(_), Action::TerminateSequence) => true,
            (MessageBody::TerminateSequenceResponse(_), Action::TerminateSequenceResponse) => true,
            (MessageBody::Fault(_), Action::Fault) => true,
            _ => false,
        };
        if !body_matches {
            return Err(crate::WireError::Malformed("body does not match action"));
        }

        match self.action {
            Action::Application | Action::LastMessage if self.headers.sequence.is_none() => {
                return Err(crate::WireError::Malformed("sequenced message without Sequence header"));
            }
            Action::SequenceAcknowledgement if self.headers.acknowledgement.is_none() => {
                return Err(crate::WireError::Malformed("acknowledgement without SequenceAcknowledgement header"));
            }
            Action::AckRequested if self.headers.ack_requested.is_none() => {
                return Err(crate::WireError::Malformed("ack request without AckRequested header"));
            }
            _ => {}
        }

        if let Some(seq) = &self.headers.sequence {
            if seq.last_message && !self.version.uses_last_message_marker() {
                return Err(crate::WireError::Malformed("LastMessage marker not defined in protocol version"));
            }
        }

        if let Some(ack) = &self.headers.acknowledgement {
            for range in &ack.ranges {
                SequenceRange::new(range.lower(), range.upper())?;
            }
            if ack.final_ack && !self.version.supports_final_ack() {
                return Err(crate::WireError::Malformed("Final acknowledgement not defined in protocol version"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_constructors_are_valid() {
        let version = ProtocolVersion::WsReliableMessaging11;
        let id = SequenceId::generate();

        let messages = vec![
            Message::sequenced(version, id, 1, Bytes::from_static(b"hello")),
            Message::ack_requested(version, id),
            Message::close_sequence(version, id, 3),
            Message::terminate_sequence(version, id, 3),
            Message::fault(version, FaultCode::UnknownSequence, "no such sequence", Some(id)),
        ];

        for msg in messages {
            msg.validate().unwrap();
        }
    }

    #[test]
    fn test_last_message_rejected_on_v11() {
        let id = SequenceId::generate();
        let msg = Message::last_message(ProtocolVersion::WsReliableMessaging11, id, 4);
        assert!(msg.validate().is_err());

        let msg = Message::last_message(ProtocolVersion::WsrmFebruary2005, id, 4);
        msg.validate().unwrap();
    }

    #[test]
    fn test_terminate_carries_last_only_on_v11() {
        let id = SequenceId::generate();
        let feb = Message::terminate_sequence(ProtocolVersion::WsrmFebruary2005, id, 9);
        let v11 = Message::terminate_sequence(ProtocolVersion::WsReliableMessaging11, id, 9);

        match (feb.body, v11.body) {
            (MessageBody::TerminateSequence(a), MessageBody::TerminateSequence(b)) => {
                assert_eq!(a.last_msg_number, None);
                assert_eq!(b.last_msg_number, Some(9));
            }
            _ => panic!("expected TerminateSequence bodies"),
        }
    }

    #[test]
    fn test_final_ack_requires_v11() {
        let id = SequenceId::generate();
        let ack = SequenceAcknowledgement {
            id,
            ranges: smallvec![SequenceRange::new(1, 2).unwrap()],
            final_ack: true,
            buffer_remaining: None,
        };

        assert!(Message::acknowledgement(ProtocolVersion::WsrmFebruary2005, ack.clone())
            .validate()
            .is_err());
        Message::acknowledgement(ProtocolVersion::WsReliableMessaging11, ack)
            .validate()
            .unwrap();
    }
}
