//! TCP variant: plain socket, custom RSA handshake, then an AES-CBC stream
//! with length-prefixed chunk framing in both directions.

use std::net::SocketAddr;

use rsa::{RsaPrivateKey, RsaPublicKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::debug;

use super::chunker::{self, Reassembler};
use super::cipher::{DecryptStream, EncryptStream};
use super::{handshake, BoxedStream, ByteStream, FrameSink, Link, LinkEvent};
use crate::core::{DeviceError, DeviceIdentity, TransportError, TCP_INACTIVITY_TIMEOUT};

/// Inbound frame channel depth.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Connect to the cloud endpoint and establish a TCP session.
pub async fn connect(
    addr: SocketAddr,
    identity: &DeviceIdentity,
    device_key: &RsaPrivateKey,
    server_key: &RsaPublicKey,
) -> Result<Link, DeviceError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(TransportError::from)?;
    stream.set_nodelay(true).map_err(TransportError::from)?;
    debug!(%addr, "tcp socket connected, starting handshake");
    link_from_stream(stream, identity, device_key, server_key).await
}

/// Run the handshake over an arbitrary byte stream and wrap it into a link.
///
/// Split out from [`connect`] so the whole secure pipeline runs over an
/// in-memory duplex in tests.
pub async fn link_from_stream<S>(
    stream: S,
    identity: &DeviceIdentity,
    device_key: &RsaPrivateKey,
    server_key: &RsaPublicKey,
) -> Result<Link, DeviceError>
where
    S: ByteStream + 'static,
{
    let mut stream: BoxedStream = Box::new(stream);
    let secrets = handshake::perform(&mut stream, identity, device_key, server_key).await?;
    debug!(
        initial_message_id = secrets.initial_message_id,
        "tcp handshake complete"
    );

    let encrypt = EncryptStream::new(secrets.aes_key, secrets.iv);
    let decrypt = DecryptStream::new(secrets.aes_key, secrets.iv);

    let (read_half, write_half) = tokio::io::split(stream);
    let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
    tokio::spawn(run_reader(read_half, decrypt, tx));

    Ok(Link {
        frames: rx,
        sink: FrameSink::Tcp(TcpSink {
            write: write_half,
            encrypt,
        }),
        initial_message_id: Some(secrets.initial_message_id),
    })
}

/// Outbound half: encrypt, frame, write.
pub struct TcpSink {
    write: WriteHalf<BoxedStream>,
    encrypt: EncryptStream,
}

impl TcpSink {
    /// Send one plaintext CoAP frame.
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let ciphertext = self.encrypt.encrypt(frame);
        let framed = chunker::frame(&ciphertext)?;
        self.write.write_all(&framed).await?;
        self.write.flush().await?;
        Ok(())
    }
}

/// Inbound half: read with inactivity timeout, reassemble, decrypt.
async fn run_reader(
    mut read: ReadHalf<BoxedStream>,
    mut decrypt: DecryptStream,
    tx: mpsc::Sender<LinkEvent>,
) {
    let mut reassembler = Reassembler::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match timeout(TCP_INACTIVITY_TIMEOUT, read.read(&mut buf)).await {
            Err(_) => {
                let _ = tx.send(LinkEvent::Closed(TransportError::SocketTimeout)).await;
                return;
            }
            Ok(Err(e)) => {
                let _ = tx.send(LinkEvent::Closed(e.into())).await;
                return;
            }
            Ok(Ok(0)) => {
                let _ = tx.send(LinkEvent::Closed(TransportError::SocketClosed)).await;
                return;
            }
            Ok(Ok(n)) => n,
        };

        reassembler.push(&buf[..n]);
        while let Some(chunk) = reassembler.next_chunk() {
            match decrypt.decrypt(&chunk) {
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
}
