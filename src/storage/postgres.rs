//! Client/server backend on PostgreSQL.
//!
//! The `sqlx` pool is async; the store owns a small private tokio runtime and
//! blocks on it so the [`CertStore`] contract stays synchronous. Every call is
//! bounded by the configured storage timeout.

use super::{CertStore, IssuedCertificate};
use crate::configs::PostgresConfig;
use crate::error::StorageError;
use crate::keyring::Fingerprint;
use crate::serial::SerialNumber;
use chrono::{DateTime, Utc};
use secrecy::ExposeSecret;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{debug, info, instrument};

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS certs (
    serial_number TEXT PRIMARY KEY,
    fingerprint   TEXT NOT NULL,
    common_name   TEXT NOT NULL,
    certificate   TEXT NOT NULL,
    issued_at     TIMESTAMPTZ NOT NULL,
    expires_at    TIMESTAMPTZ NOT NULL,
    revoked       BOOLEAN NOT NULL DEFAULT FALSE,
    revoked_at    TIMESTAMPTZ,
    CONSTRAINT certs_revocation_consistent CHECK (revoked = (revoked_at IS NOT NULL))
)
"#;

const CREATE_FINGERPRINT_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS certs_fingerprint_idx ON certs (fingerprint)";

const SELECT_COLUMNS: &str = "SELECT serial_number, fingerprint, common_name, certificate, \
     issued_at, expires_at, revoked, revoked_at FROM certs";

pub struct PostgresCertStore {
    // dropped before the runtime that drives it
    pool: PgPool,
    runtime: Runtime,
    timeout: Duration,
}

impl PostgresCertStore {
    /// Connect using the `[storage.postgres]` settings.
    pub fn connect(config: &PostgresConfig, timeout: Duration) -> Result<Self, StorageError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(config.password.expose_secret());
        let store = Self::connect_with(options, config.max_connections, timeout)?;
        info!(
            host = %config.host,
            port = config.port,
            database = %config.database,
            "postgres certificate store connected"
        );
        Ok(store)
    }

    fn connect_with(
        options: PgConnectOptions,
        max_connections: u32,
        timeout: Duration,
    ) -> Result<Self, StorageError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("cert-store-postgres")
            .enable_all()
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to start storage runtime: {}", e)))?;

        let pool = block_on_bounded(&runtime, timeout, async {
            PgPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(timeout)
                .connect_with(options)
                .await
                .map_err(StorageError::from)
        })?;

        Ok(Self {
            pool,
            runtime,
            timeout,
        })
    }

    fn run<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        block_on_bounded(&self.runtime, self.timeout, fut)
    }
}

fn block_on_bounded<T, F>(runtime: &Runtime, timeout: Duration, fut: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    runtime.block_on(async {
        match tokio::time::timeout(timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout(format!(
                "no response from postgres within {:?}",
                timeout
            ))),
        }
    })
}

impl CertStore for PostgresCertStore {
    fn init_schema(&self) -> Result<(), StorageError> {
        self.run(async {
            sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
            sqlx::query(CREATE_FINGERPRINT_INDEX)
                .execute(&self.pool)
                .await?;
            Ok::<_, StorageError>(())
        })
    }

    #[instrument(skip_all, fields(serial = %record.serial))]
    fn save_cert(&self, record: &IssuedCertificate) -> Result<(), StorageError> {
        self.run(async {
            sqlx::query(
                "INSERT INTO certs (serial_number, fingerprint, common_name, certificate, \
                 issued_at, expires_at, revoked, revoked_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(record.serial.to_hex())
            .bind(record.fingerprint.as_str())
            .bind(&record.common_name)
            .bind(&record.certificate_pem)
            .bind(record.issued_at)
            .bind(record.expires_at)
            .bind(record.revoked)
            .bind(record.revoked_at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(e, record.serial))?;
            Ok::<_, StorageError>(())
        })?;
        debug!("certificate record stored");
        Ok(())
    }

    fn get_cert(&self, serial: SerialNumber) -> Result<Option<IssuedCertificate>, StorageError> {
        self.run(async {
            let row = sqlx::query(&format!("{} WHERE serial_number = $1", SELECT_COLUMNS))
                .bind(serial.to_hex())
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(row_to_record).transpose()
        })
    }

    #[instrument(skip_all, fields(serial = %serial))]
    fn revoke_cert(
        &self,
        serial: SerialNumber,
        revoked_at: DateTime<Utc>,
    ) -> Result<IssuedCertificate, StorageError> {
        let (changed, record) = self.run(async {
            let mut tx = self.pool.begin().await?;
            // concurrent revokers serialize on the row lock and re-check `NOT revoked`
            let changed = sqlx::query(
                "UPDATE certs SET revoked = TRUE, revoked_at = $1 \
                 WHERE serial_number = $2 AND NOT revoked",
            )
            .bind(revoked_at)
            .bind(serial.to_hex())
            .execute(&mut *tx)
            .await?
            .rows_affected();
            let row = sqlx::query(&format!("{} WHERE serial_number = $1", SELECT_COLUMNS))
                .bind(serial.to_hex())
                .fetch_optional(&mut *tx)
                .await?;
            let record = row
                .as_ref()
                .map(row_to_record)
                .transpose()?
                .ok_or(StorageError::CertNotFound(serial))?;
            tx.commit().await?;
            Ok::<_, StorageError>((changed, record))
        })?;

        if changed == 0 {
            debug!("certificate already revoked");
        } else {
            info!("certificate revoked");
        }
        Ok(record)
    }

    fn get_revoked_certs(&self) -> Result<Vec<IssuedCertificate>, StorageError> {
        self.run(async {
            let rows = sqlx::query(&format!(
                "{} WHERE revoked ORDER BY serial_number COLLATE \"C\"",
                SELECT_COLUMNS
            ))
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(row_to_record)
                .collect::<Result<Vec<_>, StorageError>>()
        })
    }

    fn get_certs_by_fingerprint(
        &self,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<IssuedCertificate>, StorageError> {
        self.run(async {
            let rows = sqlx::query(&format!(
                "{} WHERE fingerprint = $1 ORDER BY issued_at, serial_number COLLATE \"C\"",
                SELECT_COLUMNS
            ))
            .bind(fingerprint.as_str())
            .fetch_all(&self.pool)
            .await?;
            rows.iter()
                .map(row_to_record)
                .collect::<Result<Vec<_>, StorageError>>()
        })
    }
}

fn row_to_record(row: &PgRow) -> Result<IssuedCertificate, StorageError> {
    let serial: String = row.try_get("serial_number")?;
    let serial = serial
        .parse::<SerialNumber>()
        .map_err(|e| StorageError::Backend(e.to_string()))?;
    let fingerprint: String = row.try_get("fingerprint")?;
    Ok(IssuedCertificate {
        serial,
        fingerprint: Fingerprint::new(&fingerprint),
        common_name: row.try_get("common_name")?,
        certificate_pem: row.try_get("certificate")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked: row.try_get("revoked")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

fn map_write_error(e: sqlx::Error, serial: SerialNumber) -> StorageError {
    match e {
        sqlx::Error::Database(ref db) if db.is_unique_violation() => {
            StorageError::DuplicateSerial(serial)
        }
        other => other.into(),
    }
}

impl std::fmt::Debug for PostgresCertStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCertStore")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
