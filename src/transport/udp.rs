//! UDP variant: the outer DTLS layer is an external collaborator, modeled as
//! a connector that negotiates on the socket and hands back a per-datagram
//! record cipher. Datagrams map 1:1 to CoAP frames; no extra framing.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::{FrameSink, Link, LinkEvent};
use crate::core::{DeviceError, TransportError, DTLS_HANDSHAKE_TIMEOUT};

/// Inbound frame channel depth.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Largest datagram the reader accepts.
const MAX_DATAGRAM: usize = 65_536;

/// Per-datagram seal/open codec produced by the DTLS layer.
pub trait RecordCipher: Send {
    /// Protect one outbound plaintext datagram.
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError>;

    /// Recover the plaintext of one inbound record.
    fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Key material handed to the DTLS layer.
#[derive(Debug, Clone)]
pub struct DtlsKeys {
    /// Device ECC private key, DER.
    pub device_private_key_der: Vec<u8>,
    /// Server ECC public key, DER.
    pub server_public_key_der: Vec<u8>,
}

/// The externally provided DTLS implementation.
///
/// The connector drives its handshake over the connected socket; the engine
/// bounds the negotiation with the 5-second handshake timer.
pub trait DtlsConnector: Send + Sync {
    /// Negotiate a session and return the record cipher.
    fn connect(
        &self,
        socket: Arc<UdpSocket>,
        keys: DtlsKeys,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn RecordCipher>, TransportError>> + Send>>;
}

/// Identity records: for deployments where the path is secured externally,
/// and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainText;

impl RecordCipher for PlainText {
    fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(plaintext.to_vec())
    }

    fn open(&mut self, record: &[u8]) -> Result<Vec<u8>, TransportError> {
        Ok(record.to_vec())
    }
}

impl DtlsConnector for PlainText {
    fn connect(
        &self,
        _socket: Arc<UdpSocket>,
        _keys: DtlsKeys,
    ) -> Pin<Box<dyn Future<Output = Result<Box<dyn RecordCipher>, TransportError>> + Send>>
    {
        Box::pin(async { Ok(Box::new(PlainText) as Box<dyn RecordCipher>) })
    }
}

type SharedCipher = Arc<Mutex<Box<dyn RecordCipher>>>;

/// Open the socket, run the DTLS negotiation, and wrap it into a link.
pub async fn connect(
    addr: SocketAddr,
    keys: DtlsKeys,
    connector: &dyn DtlsConnector,
) -> Result<Link, DeviceError> {
    let bind_addr: SocketAddr = if addr.is_ipv4() {
        (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
    } else {
        (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(TransportError::from)?;
    socket.connect(addr).await.map_err(TransportError::from)?;
    let socket = Arc::new(socket);
    debug!(%addr, "udp socket connected, negotiating dtls");

    let cipher = timeout(DTLS_HANDSHAKE_TIMEOUT, connector.connect(socket.clone(), keys))
        .await
        .map_err(|_| TransportError::DtlsHandshakeTimeout)??;
    let cipher: SharedCipher = Arc::new(Mutex::new(cipher));

    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(run_reader(socket.clone(), cipher.clone(), tx));

    Ok(Link {
        frames: rx,
        sink: FrameSink::Udp(UdpSink { socket, cipher }),
        initial_message_id: None,
    })
}

/// Outbound half: seal, send.
pub struct UdpSink {
    socket: Arc<UdpSocket>,
    cipher: SharedCipher,
}

impl UdpSink {
    /// Send one plaintext CoAP frame as a sealed datagram.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let record = {
            let mut cipher = self
                .cipher
                .lock()
                .map_err(|_| TransportError::Io("record cipher poisoned".into()))?;
            cipher.seal(frame)?
        };
        self.socket.send(&record).await?;
        Ok(())
    }
}

async fn run_reader(socket: Arc<UdpSocket>, cipher: SharedCipher, tx: mpsc::Sender<LinkEvent>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let n = match socket.recv(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(LinkEvent::Closed(e.into())).await;
                return;
            }
        };

        let opened = {
            let Ok(mut cipher) = cipher.lock() else {
                let _ = tx
                    .send(LinkEvent::Closed(TransportError::Io(
                        "record cipher poisoned".into(),
                    )))
                    .await;
                return;
            };
            cipher.open(&buf[..n])
        };

        match opened {
            Ok(frame) => {
                if tx.send(LinkEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                let _ = tx.send(LinkEvent::Closed(e)).await;
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plaintext_link_round_trips_datagrams() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let keys = DtlsKeys {
            device_private_key_der: vec![],
            server_public_key_der: vec![],
        };
        let mut link = connect(peer_addr, keys, &PlainText).await.unwrap();
        assert_eq!(link.initial_message_id, None);

        // Device -> peer.
        link.sink.send(b"ping").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        // Peer -> device.
        peer.send_to(b"pong", from).await.unwrap();
        match link.frames.recv().await.unwrap() {
            LinkEvent::Frame(f) => assert_eq!(f, b"pong"),
            LinkEvent::Closed(e) => panic!("closed: {e}"),
        }
    }
}
