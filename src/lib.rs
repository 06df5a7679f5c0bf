//! PGP mTLS CA - Certificate Authority Core Authorized by OpenPGP Signatures
//!
//! The issuance core of a mutual-TLS certificate authority. A caller proves
//! who it is by signing its certificate request with an OpenPGP key the
//! authority already knows; the authority then issues, records, revokes and
//! publishes revocation state for the resulting X.509 client certificates.
//!
//! # Overview
//!
//! ```text
//! CSR + OpenPGP signature
//!   └── Trust Verifier (user or admin keyring) → signer fingerprint
//!       └── Cert Processor (CA key) → leaf certificate (PEM)
//!           └── Storage Engine (SQLite or PostgreSQL) → issued / revoked records
//!               └── CRL (PEM, signed by the CA)
//! ```
//!
//! - **Two trust domains**: the user and admin keyrings never share trust; an
//!   admin check never falls back to the user keyring
//! - **Signer-derived subjects**: the certificate subject comes from the
//!   signer's keyring identity, never from the CSR
//! - **Recorded before returned**: a certificate is handed out only after its
//!   record is stored, so every issued certificate can be revoked
//! - **Storage-arbitrated serials**: random 128-bit serials, uniqueness
//!   enforced by the store, bounded retry on collision
//!
//! # Quick Start
//!
//! ```no_run
//! use pgp_mtls_ca::cert_processor::CertProcessor;
//! use pgp_mtls_ca::configs::AppConfig;
//! use openssl::x509::X509Req;
//! use std::path::Path;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let processor = CertProcessor::from_config(&config)?;
//!
//!     let csr_pem = std::fs::read("request.csr")?;
//!     let fingerprint = processor.verify(&csr_pem, Path::new("request.csr.asc"))?;
//!     let csr = X509Req::from_pem(&csr_pem)?;
//!     let certificate = processor.generate_cert(&csr, 60, &fingerprint)?;
//!     std::fs::write("client.pem", certificate)?;
//!
//!     std::fs::write("crl.pem", processor.get_crl()?)?;
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! ## [`cert_processor`]
//!
//! The issuance lifecycle: `verify`, `admin_verify`, `generate_cert`,
//! `revoke_cert`, `get_crl`. Owns the CA, the verifier and the store handle.
//!
//! ## [`verifier`] and [`keyring`]
//!
//! Signature checking against one trust domain. [`keyring::Keyring`] is the
//! contract with the external keyring service; [`keyring::GpgKeyring`] drives
//! a `gpg` binary against a GnuPG home directory.
//!
//! ## [`storage`]
//!
//! The [`storage::CertStore`] contract and its two backends,
//! [`storage::SqliteCertStore`] (embedded, single file) and
//! [`storage::PostgresCertStore`] (client/server).
//!
//! ```no_run
//! use pgp_mtls_ca::storage::{CertStore, SqliteCertStore};
//! use std::time::Duration;
//!
//! let store = SqliteCertStore::open("mtls.db", Duration::from_secs(10))?;
//! store.init_schema()?;
//! let revoked = store.get_revoked_certs()?;
//! # Ok::<(), pgp_mtls_ca::error::StorageError>(())
//! ```
//!
//! ## [`ca_key_store`], [`certificate_builder`], [`crl`]
//!
//! CA key custody and signing, leaf certificate construction, CRL
//! construction.
//!
//! ## [`configs`]
//!
//! TOML configuration (`[ca]`, `[gnupg]`, `[storage]`).
//!
//! # Logging
//!
//! All modules log through `tracing`; install a subscriber in the host
//! application to see the output. Key material and passwords are never
//! logged.

pub mod ca_key_store;
pub mod cert_processor;
pub mod certificate_builder;
pub mod configs;
pub mod crl;
pub mod error;
pub mod keyring;
pub mod serial;
pub mod storage;
pub mod verifier;

#[cfg(test)]
mod test_support;

pub use cert_processor::CertProcessor;
pub use error::{CertProcessorError, StorageError, VerifyError};
pub use keyring::{Fingerprint, KeyringSelector};
pub use serial::SerialNumber;
