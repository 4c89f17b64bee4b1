#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chainlog-crypto** – Digest and signature service for the audit chain.
//!
//! The service is constructed once from the configuration's key material
//! and held for the lifetime of the client; keys are read-only after
//! startup and safe to share across workers. Signature verification never
//! errors: a malformed or mismatching signature yields `false` and the
//! integrity verifier classifies it. Key material is never logged; the
//! `Debug` impl prints algorithm names only.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use ed25519_dalek::{
    Signature as EdSignature, SigningKey as EdSigningKey, VerifyingKey as EdVerifyingKey,
};
use rsa::pkcs1v15::{Signature as RsaSignature, SigningKey, VerifyingKey};
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256, Sha512};

use chainlog_core::{AuditError, CryptoConfig, HashAlgorithm, SignatureAlgorithm};

/// RSA key size used by [`generate_keypair`].
const RSA_KEY_BITS: usize = 2048;

enum KeyMaterial {
    RsaSha256 {
        signing: SigningKey<Sha256>,
        verifying: VerifyingKey<Sha256>,
    },
    Ed25519 {
        signing: EdSigningKey,
        verifying: EdVerifyingKey,
    },
}

/// Digest computation plus private-key signing and public-key verification
/// over canonical event bytes.
pub struct CryptoService {
    hash: HashAlgorithm,
    keys: KeyMaterial,
}

impl fmt::Debug for CryptoService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoService")
            .field("hash", &self.hash)
            .field("algorithm", &self.algorithm())
            .finish()
    }
}

impl CryptoService {
    /// Load key material for the configured algorithms.
    ///
    /// Fails with `invalid_configuration` when either PEM does not parse
    /// as a key of the selected algorithm.
    pub fn from_config(config: &CryptoConfig) -> Result<Self, AuditError> {
        let keys = match config.algorithm {
            SignatureAlgorithm::RsaSha256 => {
                let private = RsaPrivateKey::from_pkcs8_pem(&config.private_key_pem)
                    .map_err(|e| bad_key("private", "RSA", e))?;
                let public = RsaPublicKey::from_public_key_pem(&config.public_key_pem)
                    .map_err(|e| bad_key("public", "RSA", e))?;
                KeyMaterial::RsaSha256 {
                    signing: SigningKey::<Sha256>::new(private),
                    verifying: VerifyingKey::<Sha256>::new(public),
                }
            }
            SignatureAlgorithm::Ed25519 => {
                let signing = EdSigningKey::from_pkcs8_pem(&config.private_key_pem)
                    .map_err(|e| bad_key("private", "Ed25519", e))?;
                let verifying = EdVerifyingKey::from_public_key_pem(&config.public_key_pem)
                    .map_err(|e| bad_key("public", "Ed25519", e))?;
                KeyMaterial::Ed25519 { signing, verifying }
            }
        };
        Ok(Self {
            hash: config.hash_algorithm,
            keys,
        })
    }

    /// The configured signature algorithm.
    pub fn algorithm(&self) -> SignatureAlgorithm {
        match self.keys {
            KeyMaterial::RsaSha256 { .. } => SignatureAlgorithm::RsaSha256,
            KeyMaterial::Ed25519 { .. } => SignatureAlgorithm::Ed25519,
        }
    }

    /// Digest `bytes` with the configured hash, as lowercase hex.
    pub fn digest_hex(&self, bytes: &[u8]) -> String {
        match self.hash {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
        }
    }

    /// Sign `bytes` with the private key; base64 output.
    pub fn sign(&self, bytes: &[u8]) -> Result<String, AuditError> {
        let signature = match &self.keys {
            KeyMaterial::RsaSha256 { signing, .. } => signing
                .try_sign(bytes)
                .map_err(|e| AuditError::IntegrityFailure(format!("signing failed: {e}")))?
                .to_vec(),
            KeyMaterial::Ed25519 { signing, .. } => signing
                .try_sign(bytes)
                .map_err(|e| AuditError::IntegrityFailure(format!("signing failed: {e}")))?
                .to_vec(),
        };
        Ok(BASE64.encode(signature))
    }

    /// Verify a base64 signature over `bytes` with the public key.
    ///
    /// Malformed encodings and mismatching signatures both return `false`;
    /// the caller decides what a failure means.
    pub fn verify(&self, bytes: &[u8], signature_b64: &str) -> bool {
        let Ok(raw) = BASE64.decode(signature_b64) else {
            return false;
        };
        match &self.keys {
            KeyMaterial::RsaSha256 { verifying, .. } => RsaSignature::try_from(raw.as_slice())
                .map(|sig| verifying.verify(bytes, &sig).is_ok())
                .unwrap_or(false),
            KeyMaterial::Ed25519 { verifying, .. } => EdSignature::from_slice(&raw)
                .map(|sig| verifying.verify(bytes, &sig).is_ok())
                .unwrap_or(false),
        }
    }
}

/// Generate a fresh PEM keypair `(private, public)` for `algorithm`.
///
/// Intended for tests and provisioning tooling; production deployments
/// bring their own keys.
pub fn generate_keypair(algorithm: SignatureAlgorithm) -> Result<(String, String), AuditError> {
    match algorithm {
        SignatureAlgorithm::RsaSha256 => {
            let private = RsaPrivateKey::new(&mut rand::thread_rng(), RSA_KEY_BITS)
                .map_err(|e| AuditError::IntegrityFailure(format!("RSA keygen failed: {e}")))?;
            let public = RsaPublicKey::from(&private);
            let private_pem = private
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| AuditError::IntegrityFailure(format!("key encoding failed: {e}")))?
                .to_string();
            let public_pem = public
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| AuditError::IntegrityFailure(format!("key encoding failed: {e}")))?;
            Ok((private_pem, public_pem))
        }
        SignatureAlgorithm::Ed25519 => {
            let signing = EdSigningKey::generate(&mut rand::rngs::OsRng);
            let private_pem = signing
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| AuditError::IntegrityFailure(format!("key encoding failed: {e}")))?
                .to_string();
            let public_pem = signing
                .verifying_key()
                .to_public_key_pem(LineEnding::LF)
                .map_err(|e| AuditError::IntegrityFailure(format!("key encoding failed: {e}")))?;
            Ok((private_pem, public_pem))
        }
    }
}

fn bad_key(which: &str, algorithm: &str, err: impl fmt::Display) -> AuditError {
    AuditError::InvalidConfiguration(format!("{which} key is not a valid {algorithm} key: {err}"))
}
