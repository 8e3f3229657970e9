//! Reliable sessions over unreliable, reconnecting transports.
//!
//! This crate turns an at-most-once message transport into exactly-once
//! (optionally in-order) delivery between two endpoints. Each direction is a
//! sequence of numbered messages that the receiver acknowledges with ranges;
//! the sender retransmits what is not acknowledged and the receiver drops
//! duplicates. The underlying channel may fail and be replaced without
//! losing the session.
//!
//! ## Features
//!
//! - **Sequences**: acknowledgement ranges, last-message boundaries, duplicate detection
//! - **Flow Control**: transfer windows on both sides plus advertised `BufferRemaining`
//! - **Retransmission**: doubling retry interval bounded by a retry count
//! - **Reconnection**: channel synchronizer that lends, faults and replaces channels
//! - **Handshakes**: CreateSequence with an offered inbound sequence, Close and Terminate
//! - **Transports**: TCP with CBOR frames, and in-memory pairs with loss injection
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use rm_session::{ReliableSession, ReliableSessionConfig, TcpChannelFactory};
//! use rm_wire::{CborEncoder, EndpointAddress, DEFAULT_MAX_MESSAGE_SIZE};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), rm_session::RmError> {
//! let addr = "127.0.0.1:9400".parse().unwrap();
//! let factory = Arc::new(TcpChannelFactory::new(addr, Arc::new(CborEncoder::new()), DEFAULT_MAX_MESSAGE_SIZE));
//!
//! let session = ReliableSession::connect(
//!     factory,
//!     EndpointAddress::new("rm://127.0.0.1:9400"),
//!     ReliableSessionConfig::default(),
//!     Duration::from_secs(10),
//! )
//! .await?;
//!
//! session.send(Bytes::from_static(b"hello"), Duration::from_secs(5)).await?;
//! session.close(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod binder;
pub mod config;
pub mod coordination;
pub mod delivery;
pub mod error;
pub mod fault;
pub mod input;
pub mod listener;
pub mod memory;
pub mod output;
pub mod ranges;
pub mod requestor;
pub mod session;
pub mod synchronizer;
pub mod transport;

// Re-export main types
pub use binder::{BinderEvent, BinderSettings, MaskingMode, ReceiveResult, ReliableChannelBinder};
pub use config::ReliableSessionConfig;
pub use coordination::{Guard, GuardTicket, InterruptibleTimer, InterruptibleWaitObject};
pub use delivery::{DeliveryMode, DeliveryStrategy};
pub use error::{RmError, SequenceFault, TransportError};
pub use fault::FaultHelper;
pub use input::{BoundaryError, ReliableInputConnection};
pub use listener::{ListenerConfig, ReliableListener};
pub use memory::{MemoryAcceptor, MemoryChannel, MemoryConnector};
pub use output::{OutputSettings, ReliableOutputConnection, SendHandler, Transmission};
pub use ranges::SequenceRangeCollection;
pub use requestor::{ReliableRequestor, RequestorKind};
pub use session::{ReliableSession, SessionEvent, SessionRole, SessionState, SessionStats};
pub use synchronizer::{ChannelEvent, ChannelLease, ChannelSynchronizer, SynchronizerState};
pub use transport::{
    accept_tcp, listen_tcp, ChannelFactory, ChannelShape, TcpChannelFactory, TcpDuplexChannel, TransportChannel,
};
