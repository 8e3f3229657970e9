//! Protocol versions, action identifiers, and fault codes.
//!
//! The two supported revisions of the reliable messaging protocol differ at a
//! handful of well-defined points (close handshake, terminate response, last
//! message marker, fault namespace). Those points are all answered by
//! [`ProtocolVersion`] so callers never branch on loose booleans.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol revision spoken on a session.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// The February 2005 submission: LastMessage marker, one-way terminate
    WsrmFebruary2005 = 0x01,
    /// WS-ReliableMessaging 1.1: close handshake, terminate response
    WsReliableMessaging11 = 0x02,
}

impl ProtocolVersion {
    /// Namespace used to qualify actions and fault codes
    pub fn namespace(self) -> &'static str {
        match self {
            ProtocolVersion::WsrmFebruary2005 => "http://schemas.xmlsoap.org/ws/2005/02/rm",
            ProtocolVersion::WsReliableMessaging11 => "http://docs.oasis-open.org/ws-rx/wsrm/200702",
        }
    }

    /// Whether CloseSequence / CloseSequenceResponse exist
    pub fn supports_close_sequence(self) -> bool {
        matches!(self, ProtocolVersion::WsReliableMessaging11)
    }

    /// Whether TerminateSequence is answered by TerminateSequenceResponse
    pub fn has_terminate_response(self) -> bool {
        matches!(self, ProtocolVersion::WsReliableMessaging11)
    }

    /// Whether the sender marks the final message of a sequence with LastMessage
    pub fn uses_last_message_marker(self) -> bool {
        matches!(self, ProtocolVersion::WsrmFebruary2005)
    }

    /// Whether acknowledgements may carry the Final flag
    pub fn supports_final_ack(self) -> bool {
        matches!(self, ProtocolVersion::WsReliableMessaging11)
    }

    /// Fully-qualified URI for an action
    pub fn action_uri(self, action: Action) -> String {
        format!("{}/{}", self.namespace(), action.local_name())
    }

    /// Fully-qualified fault code
    pub fn fault_code_uri(self, code: FaultCode) -> String {
        format!("{}#{}", self.namespace(), code.local_name())
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::WsReliableMessaging11
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(ProtocolVersion::WsrmFebruary2005),
            0x02 => Ok(ProtocolVersion::WsReliableMessaging11),
            _ => Err(crate::WireError::Version(value)),
        }
    }
}

impl std::str::FromStr for ProtocolVersion {
    type Err = crate::WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "2005" | "feb2005" | "wsrm-2005" | "february2005" => Ok(ProtocolVersion::WsrmFebruary2005),
            "1.1" | "11" | "wsrm-1.1" | "wsrm11" => Ok(ProtocolVersion::WsReliableMessaging11),
            _ => Err(crate::WireError::Version(0)),
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::WsrmFebruary2005 => write!(f, "WS-RM February 2005"),
            ProtocolVersion::WsReliableMessaging11 => write!(f, "WS-RM 1.1"),
        }
    }
}

/// Message actions as defined by the protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Application payload
    Application = 0x00,
    /// Request to establish a sequence
    CreateSequence = 0x01,
    /// Reply establishing a sequence
    CreateSequenceResponse = 0x02,
    /// Standalone acknowledgement
    SequenceAcknowledgement = 0x03,
    /// Standalone acknowledgement request
    AckRequested = 0x04,
    /// Request to close a sequence (1.1 only)
    CloseSequence = 0x05,
    /// Reply to CloseSequence (1.1 only)
    CloseSequenceResponse = 0x06,
    /// Request to terminate a sequence
    TerminateSequence = 0x07,
    /// Reply to TerminateSequence (1.1 only)
    TerminateSequenceResponse = 0x08,
    /// Empty message carrying the LastMessage marker (February 2005 only)
    LastMessage = 0x09,
    /// Protocol fault
    Fault = 0x0A,
}

impl Action {
    /// Unqualified action name
    pub fn local_name(self) -> &'static str {
        match self {
            Action::Application => "Application",
            Action::CreateSequence => "CreateSequence",
            Action::CreateSequenceResponse => "CreateSequenceResponse",
            Action::SequenceAcknowledgement => "SequenceAcknowledgement",
            Action::AckRequested => "AckRequested",
            Action::CloseSequence => "CloseSequence",
            Action::CloseSequenceResponse => "CloseSequenceResponse",
            Action::TerminateSequence => "TerminateSequence",
            Action::TerminateSequenceResponse => "TerminateSequenceResponse",
            Action::LastMessage => "LastMessage",
            Action::Fault => "fault",
        }
    }

    /// Whether this action exists in the given protocol version
    pub fn is_defined_in(self, version: ProtocolVersion) -> bool {
        match self {
            Action::CloseSequence | Action::CloseSequenceResponse => {
                version.supports_close_sequence()
            }
            Action::TerminateSequenceResponse => version.has_terminate_response(),
            Action::LastMessage => version.uses_last_message_marker(),
            _ => true,
        }
    }
}

impl TryFrom<u8> for Action {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Action::Application),
            0x01 => Ok(Action::CreateSequence),
            0x02 => Ok(Action::CreateSequenceResponse),
            0x03 => Ok(Action::SequenceAcknowledgement),
            0x04 => Ok(Action::AckRequested),
            0x05 => Ok(Action::CloseSequence),
            0x06 => Ok(Action::CloseSequenceResponse),
            0x07 => Ok(Action::TerminateSequence),
            0x08 => Ok(Action::TerminateSequenceResponse),
            0x09 => Ok(Action::LastMessage),
            0x0A => Ok(Action::Fault),
            _ => Err(crate::WireError::Action(value)),
        }
    }
}

/// Protocol fault codes, qualified per version by [`ProtocolVersion::fault_code_uri`]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultCode {
    /// The sequence identifier is not known to the receiver
    UnknownSequence = 1,
    /// The sequence was terminated by the endpoint that raised the fault
    SequenceTerminated = 2,
    /// An acknowledgement covered numbers that were never sent
    InvalidAcknowledgement = 3,
    /// A message number beyond the established last number arrived
    LastMessageNumberExceeded = 4,
    /// The message number space was exhausted
    MessageNumberRollover = 5,
    /// The sequence was closed and accepts no further messages (1.1)
    SequenceClosed = 6,
    /// CreateSequence was refused
    CreateSequenceRefused = 7,
    /// A required protocol header was missing
    WsrmRequired = 8,
    /// The receiver cannot hold more state for the sequence
    QuotaExceeded = 9,
}

impl FaultCode {
    /// Unqualified fault code name
    pub fn local_name(self) -> &'static str {
        match self {
            FaultCode::UnknownSequence => "UnknownSequence",
            FaultCode::SequenceTerminated => "SequenceTerminated",
            FaultCode::InvalidAcknowledgement => "InvalidAcknowledgement",
            FaultCode::LastMessageNumberExceeded => "LastMessageNumberExceeded",
            FaultCode::MessageNumberRollover => "MessageNumberRollover",
            FaultCode::SequenceClosed => "SequenceClosed",
            FaultCode::CreateSequenceRefused => "CreateSequenceRefused",
            FaultCode::WsrmRequired => "WSRMRequired",
            FaultCode::QuotaExceeded => "QuotaExceeded",
        }
    }

    /// Whether the code is a receiver-side (as opposed to sender-side) fault
    pub fn is_receiver_fault(self) -> bool {
        matches!(self, FaultCode::QuotaExceeded | FaultCode::SequenceTerminated)
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.local_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_branch_points() {
        let feb = ProtocolVersion::WsrmFebruary2005;
        let v11 = ProtocolVersion::WsReliableMessaging11;

        assert!(!feb.supports_close_sequence());
        assert!(v11.supports_close_sequence());
        assert!(feb.uses_last_message_marker());
        assert!(!v11.uses_last_message_marker());
        assert!(v11.has_terminate_response());
        assert!(!Action::CloseSequence.is_defined_in(feb));
        assert!(Action::LastMessage.is_defined_in(feb));
    }

    #[test]
    fn test_fault_code_namespaces_differ() {
        let code = FaultCode::SequenceTerminated;
        let feb = ProtocolVersion::WsrmFebruary2005.fault_code_uri(code);
        let v11 = ProtocolVersion::WsReliableMessaging11.fault_code_uri(code);

        assert_ne!(feb, v11);
        assert!(feb.ends_with("#SequenceTerminated"));
        assert!(v11.starts_with("http://docs.oasis-open.org/ws-rx/wsrm/200702"));
    }

    #[test]
    fn test_action_conversion() {
        assert_eq!(Action::try_from(0x07).unwrap(), Action::TerminateSequence);
        assert!(Action::try_from(0x42).is_err());
        assert_eq!("1.1".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::WsReliableMessaging11);
        assert_eq!("2005".parse::<ProtocolVersion>().unwrap(), ProtocolVersion::WsrmFebruary2005);
    }
}
