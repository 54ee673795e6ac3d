//! [`SecurityPolicyInstance`]: the `Basic256Sha256` context bound to the
//! server's certificate and private key.

use std::io::BufReader;

use common::protocol::BASIC256SHA256_URI;
use rand::{rngs::OsRng, RngCore};
use rsa::{
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
    traits::PublicKeyParts,
    Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
};
use rustls_pemfile::Item;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use x509_parser::{extensions::GeneralName, parse_x509_certificate};

use super::{PolicyError, SessionKeys, NONCE_LEN};
use crate::credentials::CertificateKeyPair;

/// Smallest RSA modulus the suite accepts, in bits.
pub const MIN_KEY_BITS: usize = 2048;

/// Largest RSA modulus the suite accepts, in bits.
pub const MAX_KEY_BITS: usize = 4096;

/// Largest plaintext [`SecurityPolicyInstance::encrypt`] accepts.
pub const MAX_ASYMMETRIC_PLAINTEXT: usize = 8192;

/// Bytes of each RSA block consumed by OAEP padding with SHA-1 (2 * 20 + 2).
const OAEP_SHA1_OVERHEAD: usize = 42;

/// A parsed X.509 certificate carrying an RSA public key.
///
/// Used both for the server's own certificate and for a peer's sender
/// certificate received in `OpenSecureChannel`.
#[derive(Clone)]
pub struct Certificate {
    der: Vec<u8>,
    public_key: RsaPublicKey,
    thumbprint: [u8; 20],
    application_uri: Option<String>,
    currently_valid: bool,
}

impl Certificate {
    /// Parse the first certificate in `der`. Anything after it (the rest of a
    /// chain) is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidCertificate`] if the bytes are not DER
    /// X.509 or the subject key is not RSA, and [`PolicyError::KeyLength`] if
    /// the modulus is outside the suite's range.
    pub fn parse(der: &[u8]) -> Result<Self, PolicyError> {
        let (rest, cert) = parse_x509_certificate(der)
            .map_err(|e| PolicyError::InvalidCertificate(e.to_string()))?;

        let public_key = RsaPublicKey::from_public_key_der(cert.public_key().raw).map_err(|_| {
            PolicyError::InvalidCertificate("subject public key is not RSA".into())
        })?;
        check_key_length(public_key.size() * 8)?;

        let application_uri = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .and_then(|san| {
                san.value.general_names.iter().find_map(|name| match name {
                    GeneralName::URI(uri) => Some((*uri).to_owned()),
                    _ => None,
                })
            });
        let currently_valid = cert.validity().is_valid();

        let der = der[..der.len() - rest.len()].to_vec();
        let thumbprint = Sha1::digest(&der).into();

        Ok(Self {
            der,
            public_key,
            thumbprint,
            application_uri,
            currently_valid,
        })
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn public_key(&self) -> &RsaPublicKey {
        &self.public_key
    }

    /// SHA-1 of the certificate DER.
    pub fn thumbprint(&self) -> &[u8; 20] {
        &self.thumbprint
    }

    /// The URI entry of the SubjectAltName extension, if present.
    pub fn application_uri(&self) -> Option<&str> {
        self.application_uri.as_deref()
    }

    pub fn is_currently_valid(&self) -> bool {
        self.currently_valid
    }

    /// Modulus length in bytes; also the length of a signature made with the
    /// matching private key.
    pub fn key_len(&self) -> usize {
        self.public_key.size()
    }

    /// Largest plaintext block one RSA-OAEP operation with this key carries.
    pub fn plaintext_block_size(&self) -> usize {
        self.key_len() - OAEP_SHA1_OVERHEAD
    }

    /// Verify an RSA PKCS#1 v1.5 SHA-256 signature made with the matching
    /// private key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(message);
        self.public_key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }

    /// RSA-OAEP encrypt `plaintext` for the holder of the matching private
    /// key, one block per [`Certificate::plaintext_block_size`] bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PolicyError> {
        let block = self.plaintext_block_size();
        let blocks = plaintext.len().div_ceil(block).max(1);
        let mut out = Vec::with_capacity(blocks * self.key_len());
        if plaintext.is_empty() {
            out.extend(self.public_key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), &[])?);
        }
        for chunk in plaintext.chunks(block) {
            out.extend(self.public_key.encrypt(&mut OsRng, Oaep::new::<Sha1>(), chunk)?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Certificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Certificate")
            .field("thumbprint", &hex::encode(self.thumbprint))
            .field("key_bits", &(self.key_len() * 8))
            .field("application_uri", &self.application_uri)
            .finish()
    }
}

/// Immutable `Basic256Sha256` context bound to one certificate/key pair.
///
/// Carries no per-connection state and is shared across connections by `Arc`.
pub struct SecurityPolicyInstance {
    uri: &'static str,
    certificate: Certificate,
    private_key: RsaPrivateKey,
}

impl SecurityPolicyInstance {
    /// Build the policy from a loaded certificate/key pair. The pair is only
    /// borrowed for the duration of the call.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::UnsupportedPolicy`] for any URI other than
    ///   `Basic256Sha256`.
    /// - [`PolicyError::InvalidCertificate`], [`PolicyError::InvalidPrivateKey`]
    ///   or [`PolicyError::KeyLength`] if either credential cannot be used.
    /// - [`PolicyError::KeyMismatch`] if the certificate does not belong to
    ///   the private key.
    pub fn create(policy_uri: &str, pair: &CertificateKeyPair) -> Result<Self, PolicyError> {
        if policy_uri != BASIC256SHA256_URI {
            return Err(PolicyError::UnsupportedPolicy(policy_uri.to_owned()));
        }

        let certificate = Certificate::parse(pair.certificate().as_slice())?;
        let private_key = parse_private_key(pair.private_key().as_slice())?;
        check_key_length(private_key.size() * 8)?;

        if RsaPublicKey::from(&private_key) != certificate.public_key {
            return Err(PolicyError::KeyMismatch);
        }

        if !certificate.is_currently_valid() {
            warn!(
                thumbprint = %hex::encode(certificate.thumbprint()),
                "server certificate is outside its validity period"
            );
        }
        info!(
            policy = BASIC256SHA256_URI,
            key_bits = certificate.key_len() * 8,
            thumbprint = %hex::encode(certificate.thumbprint()),
            "security policy created"
        );

        Ok(Self {
            uri: BASIC256SHA256_URI,
            certificate,
            private_key,
        })
    }

    pub fn uri(&self) -> &'static str {
        self.uri
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn certificate_der(&self) -> &[u8] {
        self.certificate.der()
    }

    pub fn thumbprint(&self) -> &[u8; 20] {
        self.certificate.thumbprint()
    }

    /// Length in bytes of the signatures this instance produces.
    pub fn key_len(&self) -> usize {
        self.certificate.key_len()
    }

    /// Largest plaintext block encrypted to this instance's key.
    pub fn plaintext_block_size(&self) -> usize {
        self.certificate.plaintext_block_size()
    }

    /// Sign `message` with the long-term private key.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, PolicyError> {
        let digest = Sha256::digest(message);
        Ok(self
            .private_key
            .sign_with_rng(&mut OsRng, Pkcs1v15Sign::new::<Sha256>(), &digest)?)
    }

    /// Verify `signature` over `message` with the own certificate's key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.certificate.verify(message, signature)
    }

    /// Verify a peer's signature with the key from its certificate.
    pub fn verify_with(&self, remote: &Certificate, message: &[u8], signature: &[u8]) -> bool {
        remote.verify(message, signature)
    }

    /// Encrypt to the own certificate's public key.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::PlaintextTooLarge`] above
    /// [`MAX_ASYMMETRIC_PLAINTEXT`] bytes.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, PolicyError> {
        if plaintext.len() > MAX_ASYMMETRIC_PLAINTEXT {
            return Err(PolicyError::PlaintextTooLarge {
                len: plaintext.len(),
                max: MAX_ASYMMETRIC_PLAINTEXT,
            });
        }
        self.certificate.encrypt(plaintext)
    }

    /// Encrypt to a peer's certificate.
    pub fn encrypt_for(&self, remote: &Certificate, plaintext: &[u8]) -> Result<Vec<u8>, PolicyError> {
        remote.encrypt(plaintext)
    }

    /// Decrypt RSA-OAEP blocks produced for this instance's key.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::CiphertextLength`] unless the input is a
    /// non-empty multiple of the key length, and [`PolicyError::Rsa`] if any
    /// block fails to decrypt.
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, PolicyError> {
        let block = self.key_len();
        if ciphertext.is_empty() || ciphertext.len() % block != 0 {
            return Err(PolicyError::CiphertextLength {
                len: ciphertext.len(),
                block,
            });
        }
        let mut out = Vec::with_capacity(ciphertext.len() / block * self.plaintext_block_size());
        for chunk in ciphertext.chunks(block) {
            out.extend(
                self.private_key
                    .decrypt_blinded(&mut OsRng, Oaep::new::<Sha1>(), chunk)?,
            );
        }
        Ok(out)
    }

    /// Derive the symmetric keys for one secure channel.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NonceLength`] unless both nonces are
    /// [`NONCE_LEN`] bytes.
    pub fn derive_session_keys(
        &self,
        remote_nonce: &[u8],
        local_nonce: &[u8],
    ) -> Result<SessionKeys, PolicyError> {
        SessionKeys::derive(remote_nonce, local_nonce)
    }

    /// A fresh nonce from the OS CSPRNG.
    pub fn generate_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        nonce
    }
}

impl std::fmt::Debug for SecurityPolicyInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityPolicyInstance")
            .field("uri", &self.uri)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

fn check_key_length(bits: usize) -> Result<(), PolicyError> {
    if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&bits) {
        return Err(PolicyError::KeyLength { bits });
    }
    Ok(())
}

/// Take the first PKCS#1 or PKCS#8 RSA key from PEM data.
fn parse_private_key(pem: &[u8]) -> Result<RsaPrivateKey, PolicyError> {
    let mut reader = BufReader::new(pem);
    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| PolicyError::InvalidPrivateKey(e.to_string()))?;
        let key = match item {
            Item::Pkcs1Key(key) => RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der())
                .map_err(|e| PolicyError::InvalidPrivateKey(e.to_string()))?,
            Item::Pkcs8Key(key) => RsaPrivateKey::from_pkcs8_der(key.secret_pkcs8_der())
                .map_err(|e| PolicyError::InvalidPrivateKey(e.to_string()))?,
            _ => continue,
        };
        return Ok(key);
    }
    Err(PolicyError::InvalidPrivateKey(
        "no PKCS#1 or PKCS#8 RSA key found in PEM data".into(),
    ))
}
