//! Protocol message model, version namespaces, and reference framing for reliable messaging.
//!
//! This crate defines the logical messages exchanged by reliable sessions
//! (CreateSequence, sequenced messages, acknowledgements, close/terminate
//! handshakes and faults), the protocol-version variant that decides which of
//! them exist, and the [`MessageEncoder`] contract the session layer uses to
//! turn messages into bytes.
//!
//! ## Features
//!
//! - **Typed Messages**: headers that piggyback on any message plus a typed body
//! - **Version Branch Points**: one [`ProtocolVersion`] answers every
//!   February 2005 vs. 1.1 difference
//! - **Fault Namespaces**: fault codes qualified per protocol version
//! - **Reference Codec**: CBOR bodies in CRC-protected, length-prefixed frames

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod message;
pub mod range;
pub mod version;

// Re-export main types
pub use codec::{
    encode_frame, CborEncoder, FrameDecoder, MessageEncoder, CBOR_CONTENT_TYPE,
    DEFAULT_MAX_MESSAGE_SIZE, FRAME_PREFIX_SIZE, HARD_MAX_FRAME_SIZE,
};
pub use error::WireError;
pub use message::{
    AckRequested, CreateSequence, CreateSequenceResponse, EndpointAddress, FaultBody, Message,
    MessageBody, MessageHeaders, MessageId, SequenceAcknowledgement, SequenceControl,
    SequenceHeader, SequenceId,
};
pub use range::SequenceRange;
pub use version::{Action, FaultCode, ProtocolVersion};
