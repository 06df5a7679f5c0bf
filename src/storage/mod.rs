//! Storage Engine
//!
//! One contract, [`CertStore`], with two interchangeable backends selected
//! from configuration: an embedded single-file SQLite database and a
//! PostgreSQL server. Both enforce serial uniqueness with the primary key
//! and make revocation a single conditional update, so concurrent callers
//! never observe a revoked record without its revocation timestamp.

pub mod postgres;
pub mod sqlite;

use crate::configs::{StorageConfig, StorageEngine};
use crate::error::StorageError;
use crate::keyring::Fingerprint;
use crate::serial::SerialNumber;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use postgres::PostgresCertStore;
pub use sqlite::SqliteCertStore;

/// The durable record of one issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub serial: SerialNumber,
    /// Fingerprint of the OpenPGP key that authorized issuance
    pub fingerprint: Fingerprint,
    /// Subject CN derived from the signer's identity
    pub common_name: String,
    pub certificate_pem: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// Backend-agnostic certificate persistence.
///
/// Implementations are shared between threads behind an `Arc` and must make
/// `save_cert` and `revoke_cert` atomic with respect to each other.
pub trait CertStore: Send + Sync {
    /// Create the certificate table if absent. Idempotent.
    fn init_schema(&self) -> Result<(), StorageError>;

    /// Insert a new record.
    ///
    /// # Errors
    /// [`StorageError::DuplicateSerial`] when the serial already exists; the
    /// stored record is left untouched.
    fn save_cert(&self, record: &IssuedCertificate) -> Result<(), StorageError>;

    fn get_cert(&self, serial: SerialNumber) -> Result<Option<IssuedCertificate>, StorageError>;

    /// Mark a certificate revoked and return the resulting record.
    ///
    /// Revoking an already revoked certificate succeeds and keeps the first
    /// revocation timestamp.
    ///
    /// # Errors
    /// [`StorageError::CertNotFound`] when the serial is unknown.
    fn revoke_cert(
        &self,
        serial: SerialNumber,
        revoked_at: DateTime<Utc>,
    ) -> Result<IssuedCertificate, StorageError>;

    /// Every revoked record, ordered by serial number.
    fn get_revoked_certs(&self) -> Result<Vec<IssuedCertificate>, StorageError>;

    /// Every record issued to `fingerprint`, oldest first.
    fn get_certs_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<IssuedCertificate>, StorageError>;
}

/// Open the configured backend and make sure its schema exists.
pub fn open(config: &StorageConfig) -> Result<Arc<dyn CertStore>, StorageError> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let store: Arc<dyn CertStore> = match config.engine {
        StorageEngine::Sqlite => {
            let sqlite = config.sqlite.as_ref().ok_or_else(|| {
                StorageError::Config("engine is sqlite but [storage.sqlite] is missing".to_string())
            })?;
            Arc::new(SqliteCertStore::open(&sqlite.db_path, timeout)?)
        }
        StorageEngine::Postgres => {
            let postgres = config.postgres.as_ref().ok_or_else(|| {
                StorageError::Config(
                    "engine is postgres but [storage.postgres] is missing".to_string(),
                )
            })?;
            Arc::new(PostgresCertStore::connect(postgres, timeout)?)
        }
    };
    store.init_schema()?;
    info!(engine = ?config.engine, "certificate store ready");
    Ok(store)
}
