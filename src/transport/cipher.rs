//! AES-128-CBC stream transformers wrapping the TCP channel.
//!
//! Each direction is an independent pipeline stage: chunks are encrypted with
//! PKCS#7 padding and the IV chains through the last ciphertext block, so the
//! pair behaves like one continuous CBC stream across chunk boundaries.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::core::{TransportError, AES_IV_SIZE, AES_KEY_SIZE};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Outbound encrypting stage.
pub struct EncryptStream {
    key: [u8; AES_KEY_SIZE],
    iv: [u8; AES_IV_SIZE],
}

impl EncryptStream {
    /// Create the stage from session-derived key material.
    pub fn new(key: [u8; AES_KEY_SIZE], iv: [u8; AES_IV_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Encrypt one plaintext chunk, chaining the IV forward.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let cipher = Aes128CbcEnc::new(&self.key.into(), &self.iv.into());
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);
        self.iv
            .copy_from_slice(&ciphertext[ciphertext.len() - AES_IV_SIZE..]);
        ciphertext
    }
}

/// Inbound decrypting stage.
pub struct DecryptStream {
    key: [u8; AES_KEY_SIZE],
    iv: [u8; AES_IV_SIZE],
}

impl DecryptStream {
    /// Create the stage from session-derived key material.
    pub fn new(key: [u8; AES_KEY_SIZE], iv: [u8; AES_IV_SIZE]) -> Self {
        Self { key, iv }
    }

    /// Decrypt one ciphertext chunk, chaining the IV forward.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, TransportError> {
        if ciphertext.is_empty() || ciphertext.len() % AES_IV_SIZE != 0 {
            return Err(TransportError::Io(format!(
                "ciphertext length {} is not a positive block multiple",
                ciphertext.len()
            )));
        }
        let cipher = Aes128CbcDec::new(&self.key.into(), &self.iv.into());
        let plaintext = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| TransportError::Io("cbc padding invalid".into()))?;
        self.iv
            .copy_from_slice(&ciphertext[ciphertext.len() - AES_IV_SIZE..]);
        Ok(plaintext)
    }
}
