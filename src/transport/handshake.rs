//! TCP session establishment: nonce exchange, RSA-wrapped identity, and
//! session-key derivation from the server-delivered material.

use hmac::{Hmac, Mac};
use rsa::pkcs8::EncodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroize;

use crate::core::{
    DeviceIdentity, HandshakeError, TransportError, AES_IV_SIZE, AES_KEY_SIZE,
    HANDSHAKE_NONCE_SIZE, SESSION_CIPHERTEXT_SIZE, SESSION_MATERIAL_SIZE,
};

type HmacSha1 = Hmac<Sha1>;

/// PKCS#1 v1.5 padding overhead per RSA block.
const RSA_PADDING_OVERHEAD: usize = 11;

/// Key material derived from the 40-byte session material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSecrets {
    /// AES-128 key shared by both directions.
    pub aes_key: [u8; AES_KEY_SIZE],
    /// Starting IV shared by both directions.
    pub iv: [u8; AES_IV_SIZE],
    /// First value of the outbound CoAP message-id counter.
    pub initial_message_id: u16,
}

/// Run the device side of the two-step TCP handshake.
///
/// 1. Read the server nonce, answer with
///    `RSA(nonce || device_id || device_public_key_der)` under the server key.
/// 2. Read the RSA-wrapped session material and the server-signed HMAC,
///    verify `HMAC-SHA1(ciphertext, session_material)` against the signature,
///    and derive the AES key, IV, and initial message id.
pub async fn perform<S>(
    stream: &mut S,
    identity: &DeviceIdentity,
    device_key: &RsaPrivateKey,
    server_key: &RsaPublicKey,
) -> Result<SessionSecrets, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut nonce = [0u8; HANDSHAKE_NONCE_SIZE];
    read_exact(stream, &mut nonce).await?;

    let response = encrypt_identity(&nonce, identity, device_key, server_key)?;
    stream
        .write_all(&response)
        .await
        .map_err(|e| HandshakeError::Transport(e.into()))?;
    stream
        .flush()
        .await
        .map_err(|e| HandshakeError::Transport(e.into()))?;

    let mut ciphertext = [0u8; SESSION_CIPHERTEXT_SIZE];
    read_exact(stream, &mut ciphertext).await?;

    let mut signature = vec![0u8; server_key.size()];
    read_exact(stream, &mut signature).await?;

    let mut material = device_key
        .decrypt(Pkcs1v15Encrypt, &ciphertext)
        .map_err(|e| HandshakeError::Rsa(e.to_string()))?;
    if material.len() != SESSION_MATERIAL_SIZE {
        let got = material.len();
        material.zeroize();
        return Err(HandshakeError::MalformedSessionMaterial(format!(
            "expected {SESSION_MATERIAL_SIZE} bytes, got {got}"
        )));
    }

    verify_hmac(&ciphertext, &material, &signature, server_key)?;

    let secrets = derive_secrets(&material);
    material.zeroize();
    Ok(secrets)
}

/// Form and encrypt the identity payload for step 1.
///
/// The payload exceeds a single PKCS#1 v1.5 block, so it is encrypted in
/// successive blocks of at most `modulus - 11` bytes.
pub fn encrypt_identity(
    nonce: &[u8],
    identity: &DeviceIdentity,
    device_key: &RsaPrivateKey,
    server_key: &RsaPublicKey,
) -> Result<Vec<u8>, HandshakeError> {
    let public_der = device_key
        .to_public_key()
        .to_public_key_der()
        .map_err(|e| HandshakeError::Rsa(e.to_string()))?;

    let mut payload = Vec::with_capacity(nonce.len() + identity.device_id.len() + 300);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&identity.device_id);
    payload.extend_from_slice(public_der.as_bytes());

    let mut rng = rand::thread_rng();
    let block = server_key.size() - RSA_PADDING_OVERHEAD;
    let mut out = Vec::new();
    for chunk in payload.chunks(block) {
        let encrypted = server_key
            .encrypt(&mut rng, Pkcs1v15Encrypt, chunk)
            .map_err(|e| HandshakeError::Rsa(e.to_string()))?;
        out.extend_from_slice(&encrypted);
    }
    Ok(out)
}

fn verify_hmac(
    ciphertext: &[u8],
    material: &[u8],
    signature: &[u8],
    server_key: &RsaPublicKey,
) -> Result<(), HandshakeError> {
    let mut mac = HmacSha1::new_from_slice(material)
        .map_err(|e| HandshakeError::MalformedSessionMaterial(e.to_string()))?;
    mac.update(ciphertext);
    let expected = mac.finalize().into_bytes();

    server_key
        .verify(Pkcs1v15Sign::new_unprefixed(), &expected, signature)
        .map_err(|_| HandshakeError::HmacMismatch)
}

/// Split the session material per protocol layout.
fn derive_secrets(material: &[u8]) -> SessionSecrets {
    let mut aes_key = [0u8; AES_KEY_SIZE];
    let mut iv = [0u8; AES_IV_SIZE];
    aes_key.copy_from_slice(&material[..AES_KEY_SIZE]);
    iv.copy_from_slice(&material[AES_KEY_SIZE..AES_KEY_SIZE + AES_IV_SIZE]);
    let initial_message_id = u16::from_be_bytes([material[32], material[33]]);
    SessionSecrets {
        aes_key,
        iv,
        initial_message_id,
    }
}

async fn read_exact<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<(), HandshakeError> {
    stream
        .read_exact(buf)
        .await
        .map(|_| ())
        .map_err(|e| HandshakeError::Transport(TransportError::from(e)))
}
