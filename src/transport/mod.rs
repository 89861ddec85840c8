//! Secure transport layer.
//!
//! Two variants selectable at init: TCP with the custom RSA handshake and an
//! AES-CBC chunked stream, or UDP where an externally negotiated DTLS layer
//! provides confidentiality. Both yield the same [`Link`] contract upward:
//! a stream of inbound plaintext CoAP frames and an ordered frame sink.

pub mod chunker;
pub mod cipher;
pub mod handshake;
pub mod keys;
pub mod tcp;
pub mod udp;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::core::TransportError;

pub use handshake::SessionSecrets;
pub use keys::{DeviceKey, ServerKey};
pub use udp::{DtlsConnector, DtlsKeys, PlainText, RecordCipher};

/// Byte streams the TCP variant can run over (real sockets, test duplexes).
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed byte stream, so links are not generic over their socket type.
pub type BoxedStream = Box<dyn ByteStream>;

/// What the transport reader yields to the session engine.
#[derive(Debug)]
pub enum LinkEvent {
    /// One inbound plaintext CoAP frame.
    Frame(Vec<u8>),
    /// The channel died; the engine must reconnect.
    Closed(TransportError),
}

/// An established secure channel.
pub struct Link {
    /// Inbound frames; ends with a single `Closed` event.
    pub frames: mpsc::Receiver<LinkEvent>,
    /// Outbound frame sink, serialized in submission order.
    pub sink: FrameSink,
    /// Initial message-id counter value (TCP: derived during handshake).
    pub initial_message_id: Option<u16>,
}

/// Outbound half of a link.
pub enum FrameSink {
    /// AES-CBC + length-prefix pipeline over a TCP-like stream.
    Tcp(tcp::TcpSink),
    /// Sealed datagrams over UDP.
    Udp(udp::UdpSink),
    /// In-memory sink for engine unit tests.
    #[cfg(test)]
    Loopback(mpsc::UnboundedSender<Vec<u8>>),
}

impl FrameSink {
    /// Write one plaintext CoAP frame through the secure pipeline.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        match self {
            FrameSink::Tcp(sink) => sink.send(frame).await,
            FrameSink::Udp(sink) => sink.send(frame).await,
            #[cfg(test)]
            FrameSink::Loopback(tx) => tx
                .send(frame.to_vec())
                .map_err(|_| TransportError::SocketClosed),
        }
    }
}
