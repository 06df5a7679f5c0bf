//! Certificate authority key custody
//!
//! The CA private key is loaded once, checked against the CA certificate and
//! then held as DER bytes inside a `secrecy` container so that it is zeroized
//! on drop and never shows up in debug output. Signing reconstructs the
//! openssl key only for the duration of the operation.

use crate::error::{CertProcessorError, Result};
use chrono::{DateTime, TimeZone, Utc};
use openssl::asn1::Asn1Time;
use openssl::hash::MessageDigest;
use openssl::pkey::{Id, PKey, Private};
use openssl::sign::Signer;
use openssl::x509::{X509Builder, X509};
use secrecy::{ExposeSecret, Secret, SecretString, Zeroize};
use std::fmt;
use std::path::Path;
use tracing::info;

/// A securely stored private key that implements Zeroize
#[derive(Clone)]
struct SecureCaKey {
    der_bytes: Vec<u8>,
}

impl Zeroize for SecureCaKey {
    fn zeroize(&mut self) {
        self.der_bytes.zeroize();
    }
}

impl fmt::Debug for SecureCaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCaKey")
            .field("der_bytes", &"<redacted>")
            .finish()
    }
}

/// Signature scheme used for everything the CA signs, derived from its key type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaSignatureScheme {
    RsaSha256,
    EcdsaSha256,
    Ed25519,
}

impl CaSignatureScheme {
    fn for_key(key: &PKey<Private>) -> Result<Self> {
        match key.id() {
            Id::RSA => Ok(CaSignatureScheme::RsaSha256),
            Id::EC => Ok(CaSignatureScheme::EcdsaSha256),
            Id::ED25519 => Ok(CaSignatureScheme::Ed25519),
            other => Err(CertProcessorError::CaUnavailable(format!(
                "unsupported CA key type {:?}",
                other
            ))),
        }
    }

    /// Digest handed to openssl; Ed25519 signs the message directly.
    pub fn digest(&self) -> MessageDigest {
        match self {
            CaSignatureScheme::RsaSha256 | CaSignatureScheme::EcdsaSha256 => {
                MessageDigest::sha256()
            }
            CaSignatureScheme::Ed25519 => MessageDigest::null(),
        }
    }

    /// Dotted OID of the signature algorithm identifier.
    pub fn oid(&self) -> &'static str {
        match self {
            CaSignatureScheme::RsaSha256 => "1.2.840.113549.1.1.11",
            CaSignatureScheme::EcdsaSha256 => "1.2.840.10045.4.3.2",
            CaSignatureScheme::Ed25519 => "1.3.101.112",
        }
    }

    /// RSA algorithm identifiers carry an explicit NULL parameter.
    pub fn has_null_parameters(&self) -> bool {
        matches!(self, CaSignatureScheme::RsaSha256)
    }
}

/// The CA key/certificate pair owned by a processor.
pub struct CertificateAuthority {
    certificate: X509,
    private_key: Secret<SecureCaKey>,
    scheme: CaSignatureScheme,
}

impl CertificateAuthority {
    /// Pair an already parsed key and certificate.
    ///
    /// # Errors
    /// `CaUnavailable` if the key does not belong to the certificate or has an
    /// unsupported type.
    pub fn new(key: PKey<Private>, certificate: X509) -> Result<Self> {
        let cert_public_key = certificate
            .public_key()
            .map_err(|e| CertProcessorError::CaUnavailable(format!("CA certificate key: {}", e)))?;
        if !cert_public_key.public_eq(&key) {
            return Err(CertProcessorError::CaUnavailable(
                "CA private key does not match CA certificate".to_string(),
            ));
        }
        let scheme = CaSignatureScheme::for_key(&key)?;
        let der_bytes = key
            .private_key_to_der()
            .map_err(|e| CertProcessorError::CaUnavailable(format!("CA key to DER: {}", e)))?;

        Ok(Self {
            certificate,
            private_key: Secret::new(SecureCaKey { der_bytes }),
            scheme,
        })
    }

    /// Load the CA from PEM files.
    ///
    /// # Arguments
    /// * `key_path` - PEM private key (PKCS#1, PKCS#8 or SEC1)
    /// * `cert_path` - PEM certificate
    /// * `passphrase` - passphrase if the key is encrypted
    pub fn load(
        key_path: &Path,
        cert_path: &Path,
        passphrase: Option<&SecretString>,
    ) -> Result<Self> {
        let certificate = load_certificate(cert_path)?;

        let key_pem = std::fs::read(key_path).map_err(|e| {
            CertProcessorError::CaUnavailable(format!(
                "failed to read CA key {}: {}",
                key_path.display(),
                e
            ))
        })?;
        let key = match passphrase {
            Some(pwd) => {
                PKey::private_key_from_pem_passphrase(&key_pem, pwd.expose_secret().as_bytes())
            }
            None => PKey::private_key_from_pem(&key_pem),
        }
        .map_err(|e| {
            CertProcessorError::CaUnavailable(format!(
                "failed to parse CA key {}: {}",
                key_path.display(),
                e
            ))
        })?;

        let ca = Self::new(key, certificate)?;
        info!(
            cert = %cert_path.display(),
            scheme = ?ca.scheme,
            "certificate authority loaded"
        );
        Ok(ca)
    }

    pub fn certificate(&self) -> &X509 {
        &self.certificate
    }

    pub fn scheme(&self) -> CaSignatureScheme {
        self.scheme
    }

    /// End of the CA certificate's validity period.
    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let epoch = Asn1Time::from_unix(0)?;
        let diff = epoch.diff(self.certificate.not_after())?;
        let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
        Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
            CertProcessorError::Encoding(format!("CA expiry out of range: {} seconds", secs))
        })
    }

    /// Reconstruct the private key. Only for trusted in-process callers.
    pub fn private_key(&self) -> Result<PKey<Private>> {
        PKey::private_key_from_der(&self.private_key.expose_secret().der_bytes).map_err(|e| {
            CertProcessorError::CaUnavailable(format!(
                "failed to reconstruct CA key from secure storage: {}",
                e
            ))
        })
    }

    /// Sign a certificate under construction.
    pub fn sign_certificate(&self, builder: &mut X509Builder) -> Result<()> {
        let key = self.private_key()?;
        builder.sign(&key, self.scheme.digest())?;
        Ok(())
    }

    /// Sign arbitrary DER (a to-be-signed structure) and return the raw signature.
    pub fn sign_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.private_key()?;
        let mut signer = match self.scheme {
            CaSignatureScheme::Ed25519 => Signer::new_without_digest(&key)?,
            _ => Signer::new(self.scheme.digest(), &key)?,
        };
        Ok(signer.sign_oneshot_to_vec(data)?)
    }
}

fn load_certificate(cert_path: &Path) -> Result<X509> {
    let pem = std::fs::read(cert_path).map_err(|e| {
        CertProcessorError::CaUnavailable(format!(
            "failed to read CA certificate {}: {}",
            cert_path.display(),
            e
        ))
    })?;
    X509::from_pem(&pem).map_err(|e| {
        CertProcessorError::CaUnavailable(format!(
            "failed to parse CA certificate {}: {}",
            cert_path.display(),
            e
        ))
    })
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("scheme", &self.scheme)
            .field("private_key", &"<securely stored>")
            .finish()
    }
}
