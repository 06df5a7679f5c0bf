//! Embedded single-file backend.
//!
//! Connections come from an `r2d2` pool. Every connection runs in WAL mode
//! with a busy timeout equal to the configured storage timeout, and writes
//! take the database lock up front (`BEGIN IMMEDIATE`) so that concurrent
//! writers queue instead of failing mid-transaction.

use super::{CertStore, IssuedCertificate};
use crate::error::StorageError;
use crate::keyring::Fingerprint;
use crate::serial::SerialNumber;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::time::Duration;
use tracing::{debug, info, instrument};

const MEMORY_PATH: &str = ":memory:";
const FILE_POOL_SIZE: u32 = 8;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS certs (
    serial_number TEXT PRIMARY KEY NOT NULL,
    fingerprint   TEXT NOT NULL,
    common_name   TEXT NOT NULL,
    certificate   TEXT NOT NULL,
    issued_at     TEXT NOT NULL,
    expires_at    TEXT NOT NULL,
    revoked       INTEGER NOT NULL DEFAULT 0,
    revoked_at    TEXT,
    CHECK ((revoked = 0 AND revoked_at IS NULL) OR (revoked = 1 AND revoked_at IS NOT NULL))
);
CREATE INDEX IF NOT EXISTS certs_fingerprint_idx ON certs (fingerprint);
";

const SELECT_COLUMNS: &str = "SELECT serial_number, fingerprint, common_name, certificate, \
     issued_at, expires_at, revoked, revoked_at FROM certs";

#[derive(Debug, Clone)]
pub struct SqliteCertStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteCertStore {
    /// Open (or create) the database at `db_path`; `:memory:` gives a private
    /// in-memory database on a single connection.
    pub fn open(db_path: &str, timeout: Duration) -> Result<Self, StorageError> {
        let (manager, max_size) = if db_path == MEMORY_PATH {
            debug!("Opening in-memory certificate database");
            (SqliteConnectionManager::memory(), 1)
        } else {
            (SqliteConnectionManager::file(db_path), FILE_POOL_SIZE)
        };
        let manager = manager.with_init(move |conn| {
            conn.busy_timeout(timeout)?;
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            })?;
            Ok(())
        });

        // an in-memory database lives exactly as long as its connection
        let pool = Pool::builder()
            .max_size(max_size)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_timeout(timeout)
            .build(manager)?;
        info!(db_path, "sqlite certificate store opened");
        Ok(Self { pool })
    }

    pub fn in_memory() -> Result<Self, StorageError> {
        Self::open(MEMORY_PATH, Duration::from_secs(10))
    }
}

impl CertStore for SqliteCertStore {
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    #[instrument(skip_all, fields(serial = %record.serial))]
    fn save_cert(&self, record: &IssuedCertificate) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_write_error(e, record.serial))?;
        tx.execute(
            "INSERT INTO certs (serial_number, fingerprint, common_name, certificate, \
             issued_at, expires_at, revoked, revoked_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.serial.to_hex(),
                record.fingerprint.as_str(),
                record.common_name,
                record.certificate_pem,
                record.issued_at,
                record.expires_at,
                record.revoked,
                record.revoked_at,
            ],
        )
        .map_err(|e| map_write_error(e, record.serial))?;
        tx.commit().map_err(|e| map_write_error(e, record.serial))?;
        debug!("certificate record stored");
        Ok(())
    }

    fn get_cert(&self, serial: SerialNumber) -> Result<Option<IssuedCertificate>, StorageError> {
        let conn = self.pool.get()?;
        Ok(select_by_serial(&conn, serial)?)
    }

    #[instrument(skip_all, fields(serial = %serial))]
    fn revoke_cert(
        &self,
        serial: SerialNumber,
        revoked_at: DateTime<Utc>,
    ) -> Result<IssuedCertificate, StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| map_write_error(e, serial))?;
        let changed = tx
            .execute(
                "UPDATE certs SET revoked = 1, revoked_at = ?1 \
                 WHERE serial_number = ?2 AND revoked = 0",
                params![revoked_at, serial.to_hex()],
            )
            .map_err(|e| map_write_error(e, serial))?;
        let record =
            select_by_serial(&tx, serial)?.ok_or(StorageError::CertNotFound(serial))?;
        tx.commit().map_err(|e| map_write_error(e, serial))?;

        if changed == 0 {
            debug!("certificate already revoked");
        } else {
            info!("certificate revoked");
        }
        Ok(record)
    }

    fn get_revoked_certs(&self) -> Result<Vec<IssuedCertificate>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE revoked = 1 ORDER BY serial_number",
            SELECT_COLUMNS
        ))?;
        let records = stmt
            .query_map([], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    fn get_certs_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<IssuedCertificate>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "{} WHERE fingerprint = ?1 ORDER BY issued_at, serial_number",
            SELECT_COLUMNS
        ))?;
        let records = stmt
            .query_map([fingerprint.as_str()], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

fn select_by_serial(
    conn: &Connection,
    serial: SerialNumber,
) -> Result<Option<IssuedCertificate>, rusqlite::Error> {
    conn.query_row(
        &format!("{} WHERE serial_number = ?1", SELECT_COLUMNS),
        [serial.to_hex()],
        row_to_record,
    )
    .optional()
}

fn row_to_record(row: &Row<'_>) -> Result<IssuedCertificate, rusqlite::Error> {
    let serial: String = row.get(0)?;
    let serial = serial
        .parse::<SerialNumber>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let fingerprint: String = row.get(1)?;
    Ok(IssuedCertificate {
        serial,
        fingerprint: Fingerprint::new(&fingerprint),
        common_name: row.get(2)?,
        certificate_pem: row.get(3)?,
        issued_at: row.get(4)?,
        expires_at: row.get(5)?,
        revoked: row.get(6)?,
        revoked_at: row.get(7)?,
    })
}

fn map_write_error(e: rusqlite::Error, serial: SerialNumber) -> StorageError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY =>
        {
            StorageError::DuplicateSerial(serial)
        }
        rusqlite::Error::SqliteFailure(ref err, _)
            if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StorageError::Timeout(e.to_string())
        }
        other => StorageError::Backend(other.to_string()),
    }
}
