//! Key material handed to the secure transports.
//!
//! The heavy lifting (PEM/DER parsing, RSA math) lives in the `rsa` crate;
//! this module only fixes the accepted encodings and the key-kind split
//! between the two transport variants.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};

use crate::core::ConfigError;

/// Device private key; RSA for the TCP variant, opaque ECC DER for UDP/DTLS.
#[derive(Clone)]
pub enum DeviceKey {
    /// RSA private key for the TCP session handshake.
    Rsa(RsaPrivateKey),
    /// ECC private key DER, passed through to the external DTLS layer.
    EccDer(Vec<u8>),
}

impl DeviceKey {
    /// Load an RSA private key from PEM text or DER bytes (PKCS#8 or PKCS#1).
    pub fn rsa_from_bytes(input: &[u8]) -> Result<Self, ConfigError> {
        if input.is_empty() {
            return Err(ConfigError::MissingPrivateKey);
        }
        if let Ok(pem) = std::str::from_utf8(input) {
            if pem.contains("-----BEGIN") {
                return RsaPrivateKey::from_pkcs8_pem(pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                    .map(Self::Rsa)
                    .map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()));
            }
        }
        RsaPrivateKey::from_pkcs8_der(input)
            .or_else(|_| RsaPrivateKey::from_pkcs1_der(input))
            .map(Self::Rsa)
            .map_err(|e| ConfigError::InvalidPrivateKey(e.to_string()))
    }

    /// Wrap an ECC private key DER blob for the DTLS layer.
    pub fn ecc_from_bytes(input: &[u8]) -> Result<Self, ConfigError> {
        if input.is_empty() {
            return Err(ConfigError::MissingPrivateKey);
        }
        Ok(Self::EccDer(input.to_vec()))
    }

    /// Human-readable key kind, for mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::EccDer(_) => "ECC",
        }
    }
}

impl std::fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceKey")
            .field("kind", &self.kind())
            .finish()
    }
}

/// Server public key; RSA for TCP, opaque ECC DER for UDP/DTLS.
#[derive(Clone)]
pub enum ServerKey {
    /// RSA public key used in the TCP session handshake.
    Rsa(RsaPublicKey),
    /// ECC public key DER, passed through to the external DTLS layer.
    EccDer(Vec<u8>),
}

impl ServerKey {
    /// Load an RSA public key from PEM text or DER bytes (SPKI or PKCS#1).
    pub fn rsa_from_bytes(input: &[u8]) -> Result<Self, ConfigError> {
        if let Ok(pem) = std::str::from_utf8(input) {
            if pem.contains("-----BEGIN") {
                return RsaPublicKey::from_public_key_pem(pem)
                    .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                    .map(Self::Rsa)
                    .map_err(|e| ConfigError::InvalidServerKey(e.to_string()));
            }
        }
        RsaPublicKey::from_public_key_der(input)
            .or_else(|_| RsaPublicKey::from_pkcs1_der(input))
            .map(Self::Rsa)
            .map_err(|e| ConfigError::InvalidServerKey(e.to_string()))
    }

    /// Wrap an ECC public key DER blob for the DTLS layer.
    pub fn ecc_from_bytes(input: &[u8]) -> Self {
        Self::EccDer(input.to_vec())
    }

    /// Human-readable key kind, for mismatch errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Rsa(_) => "RSA",
            Self::EccDer(_) => "ECC",
        }
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("kind", &self.kind())
            .finish()
    }
}
