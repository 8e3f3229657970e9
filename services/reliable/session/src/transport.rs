//! Transport channel contract and the TCP transport.
//!
//! The session layer only talks to a [`TransportChannel`]: open/close/abort,
//! send, receive and a fault notification, over either a duplex or a
//! request-reply channel shape. Reconnect-capable clients also hold a
//! [`ChannelFactory`] that produces fresh channels after a fault.
//!
//! [`TcpDuplexChannel`] carries [`MessageEncoder`] output in CRC-protected,
//! length-prefixed frames over a tokio `TcpStream`.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::BytesMut;
use rm_wire::{encode_frame, EndpointAddress, FrameDecoder, Message, MessageEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tracing::{debug, trace};

/// How a channel exchanges messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelShape {
    /// Independent send and receive directions
    Duplex,
    /// Every send is a request answered by at most one reply
    RequestReply,
}

/// Minimal transport contract the channel binder requires
#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// Channel shape
    fn shape(&self) -> ChannelShape;

    /// Open the channel
    async fn open(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Close gracefully
    async fn close(&self, timeout: Duration) -> Result<(), TransportError>;

    /// Tear down immediately
    fn abort(&self);

    /// Send one message
    async fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError>;

    /// Receive one message; `Ok(None)` means the peer closed the channel
    async fn try_receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError>;

    /// Send a request and wait for its reply (request-reply shape)
    async fn request(&self, _message: Message, _timeout: Duration) -> Result<Option<Message>, TransportError> {
        Err(TransportError::Unsupported("request"))
    }

    /// Resolves once the channel has faulted or been torn down
    async fn faulted(&self);

    /// Address of the peer
    fn remote_address(&self) -> EndpointAddress;

    /// Address of this end
    fn local_address(&self) -> EndpointAddress;
}

/// Creates channels for reconnect-capable binders
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Create a new, unopened channel
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError>;
}

struct TcpReader {
    half: OwnedReadHalf,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

/// Duplex channel over a TCP stream
pub struct TcpDuplexChannel {
    reader: Mutex<TcpReader>,
    writer: Mutex<OwnedWriteHalf>,
    encoder: Arc<dyn MessageEncoder>,
    max_message_size: usize,
    faulted: watch::Sender<bool>,
    local: EndpointAddress,
    remote: EndpointAddress,
}

fn tcp_address(addr: std::io::Result<SocketAddr>) -> EndpointAddress {
    match addr {
        Ok(addr) => EndpointAddress::new(format!("tcp://{}", addr)),
        Err(_) => EndpointAddress::anonymous(),
    }
}

impl TcpDuplexChannel {
    /// Wrap a connected stream
    pub fn from_stream(stream: TcpStream, encoder: Arc<dyn MessageEncoder>, max_message_size: usize) -> Self {
        let local = tcp_address(stream.local_addr());
        let remote = tcp_address(stream.peer_addr());
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on {}: {}", remote, e);
        }
        let (read_half, write_half) = stream.into_split();
        let (faulted, _) = watch::channel(false);

        Self {
            reader: Mutex::new(TcpReader {
                half: read_half,
                buffer: BytesMut::with_capacity(8 * 1024),
                decoder: FrameDecoder::with_max_frame_size(max_message_size + 4),
            }),
            writer: Mutex::new(write_half),
            encoder,
            max_message_size,
            faulted,
            local,
            remote,
        }
    }

    fn mark_faulted(&self, reason: &dyn std::fmt::Display) {
        if !*self.faulted.borrow() {
            debug!("TCP channel to {} faulted: {}", self.remote, reason);
        }
        self.faulted.send_replace(true);
    }

    fn is_faulted(&self) -> bool {
        *self.faulted.borrow()
    }

    async fn read_message(&self) -> Result<Option<Message>, TransportError> {
        let mut reader = self.reader.lock().await;
        let TcpReader { half, buffer, decoder } = &mut *reader;
        loop {
            if let Some(frame) = decoder.decode(buffer)? {
                let message = self.encoder.decode(&frame, self.encoder.content_type())?;
                return Ok(Some(message));
            }

            // read_buf is cancel safe: partial frames stay in `buffer`
            let n = half.read_buf(buffer).await?;
            if n == 0 {
                if buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "EOF in the middle of a frame",
                )));
            }
        }
    }
}

#[async_trait]
impl TransportChannel for TcpDuplexChannel {
    fn shape(&self) -> ChannelShape {
        ChannelShape::Duplex
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        if self.is_faulted() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }

    async fn close(&self, timeout: Duration) -> Result<(), TransportError> {
        let mut writer = tokio::time::timeout(timeout, self.writer.lock())
            .await
            .map_err(|_| TransportError::Timeout)?;
        let result = tokio::time::timeout(timeout, writer.shutdown()).await;
        self.faulted.send_replace(true);
        match result {
            Ok(r) => r.map_err(TransportError::from),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    fn abort(&self) {
        self.mark_faulted(&"aborted");
    }

    async fn send(&self, message: Message, timeout: Duration) -> Result<(), TransportError> {
        if self.is_faulted() {
            return Err(TransportError::Closed);
        }

        let body = self.encoder.encode(&message, self.max_message_size)?;
        let frame = encode_frame(&body);

        let result = tokio::time::timeout(timeout, async {
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => {
                trace!("Sent {:?} ({} bytes) to {}", message.action, frame.len(), self.remote);
                Ok(())
            }
            Ok(Err(e)) => {
                self.mark_faulted(&e);
                Err(TransportError::Io(e))
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn try_receive(&self, timeout: Duration) -> Result<Option<Message>, TransportError> {
        if self.is_faulted() {
            return Err(TransportError::Closed);
        }

        let mut faulted = self.faulted.subscribe();
        let result = tokio::select! {
            r = tokio::time::timeout(timeout, self.read_message()) => r,
            _ = faulted.wait_for(|f| *f) => return Err(TransportError::Closed),
        };

        match result {
            Ok(Ok(Some(message))) => Ok(Some(message)),
            Ok(Ok(None)) => {
                debug!("TCP channel to {} reached EOF", self.remote);
                self.mark_faulted(&"EOF");
                Ok(None)
            }
            Ok(Err(e)) => {
                self.mark_faulted(&e);
                Err(e)
            }
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn faulted(&self) {
        let mut rx = self.faulted.subscribe();
        let _ = rx.wait_for(|f| *f).await;
    }

    fn remote_address(&self) -> EndpointAddress {
        self.remote.clone()
    }

    fn local_address(&self) -> EndpointAddress {
        self.local.clone()
    }
}

/// Dials a fixed TCP address for every new channel
pub struct TcpChannelFactory {
    addr: SocketAddr,
    encoder: Arc<dyn MessageEncoder>,
    max_message_size: usize,
    connect_timeout: Duration,
}

impl TcpChannelFactory {
    /// Create a dialer for `addr`
    pub fn new(addr: SocketAddr, encoder: Arc<dyn MessageEncoder>, max_message_size: usize) -> Self {
        Self {
            addr,
            encoder,
            max_message_size,
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Override the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl ChannelFactory for TcpChannelFactory {
    async fn create_channel(&self) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(self.addr))
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!("Connected to {}", self.addr);
        Ok(Arc::new(TcpDuplexChannel::from_stream(
            stream,
            self.encoder.clone(),
            self.max_message_size,
        )))
    }
}

/// Create a TCP listener bound to the given address
pub async fn listen_tcp(addr: SocketAddr) -> tokio::io::Result<TcpListener> {
    TcpListener::bind(addr).await
}

/// Accept the next connection as a channel
pub async fn accept_tcp(
    listener: &TcpListener,
    encoder: Arc<dyn MessageEncoder>,
    max_message_size: usize,
) -> Result<Arc<dyn TransportChannel>, TransportError> {
    let (stream, peer) = listener.accept().await?;
    debug!("Accepted connection from {}", peer);
    Ok(Arc::new(TcpDuplexChannel::from_stream(stream, encoder, max_message_size)))
}
