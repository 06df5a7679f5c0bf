//! Error types
//!
//! Each layer has its own enum so callers can map every failure to a
//! response without inspecting messages: the verifier distinguishes an
//! unknown signer from a bad signature, storage distinguishes a duplicate
//! serial from an unknown one, and the processor folds both into
//! [`CertProcessorError`].

use crate::serial::SerialNumber;
use thiserror::Error;

/// Failures of a Storage Engine backend.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The serial is already taken; the insert was not applied.
    #[error("certificate with serial {0} already exists")]
    DuplicateSerial(SerialNumber),

    #[error("no certificate with serial {0}")]
    CertNotFound(SerialNumber),

    #[error("storage operation timed out: {0}")]
    Timeout(String),

    #[error("storage backend failure: {0}")]
    Backend(String),

    #[error("storage configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        StorageError::Backend(e.to_string())
    }
}

impl From<r2d2::Error> for StorageError {
    fn from(e: r2d2::Error) -> Self {
        // r2d2 only reports pool errors once its connection timeout elapsed
        StorageError::Timeout(e.to_string())
    }
}

impl From<sqlx::Error> for StorageError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => StorageError::Timeout(e.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

/// Failures of the Trust Verifier.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The signer is not resolvable in the selected keyring.
    #[error("signing key not found in keyring: {0}")]
    KeyNotFound(String),

    /// The signature is malformed, cryptographically bad, or covers other content.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// The keyring service itself failed.
    #[error("keyring failure: {0}")]
    Keyring(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures surfaced by the Cert Processor.
#[derive(Debug, Error)]
pub enum CertProcessorError {
    #[error("signing key not found in keyring: {0}")]
    KeyNotFound(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// CA key or certificate missing, unreadable, or not a matching pair.
    #[error("certificate authority unavailable: {0}")]
    CaUnavailable(String),

    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),

    #[error("could not allocate a unique serial number after {attempts} attempts")]
    SerialCollisionExhausted { attempts: usize },

    #[error("no certificate with serial {0}")]
    CertNotFound(SerialNumber),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("keyring failure: {0}")]
    Keyring(String),

    #[error("cryptographic operation failed: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// A DER structure could not be built or encoded.
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<VerifyError> for CertProcessorError {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::KeyNotFound(m) => CertProcessorError::KeyNotFound(m),
            VerifyError::InvalidSignature(m) => CertProcessorError::InvalidSignature(m),
            VerifyError::Keyring(m) => CertProcessorError::Keyring(m),
            VerifyError::Io(e) => CertProcessorError::Io(e),
        }
    }
}

impl From<StorageError> for CertProcessorError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::CertNotFound(serial) => CertProcessorError::CertNotFound(serial),
            other => CertProcessorError::Storage(other),
        }
    }
}

impl From<x509_cert::der::Error> for CertProcessorError {
    fn from(e: x509_cert::der::Error) -> Self {
        CertProcessorError::Encoding(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CertProcessorError>;
