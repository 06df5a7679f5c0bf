//! Cert Processor
//!
//! Owns the certificate authority, the trust verifier and a storage handle,
//! and exposes the issuance lifecycle: verify a signed request, issue a
//! certificate bound to the verified signer, revoke it, and publish the CRL.
//!
//! Issuance only returns a certificate once its record is stored. Serial
//! uniqueness is decided by the store's atomic insert; a collision re-draws
//! the serial up to [`MAX_SERIAL_ATTEMPTS`] times.

use crate::ca_key_store::CertificateAuthority;
use crate::certificate_builder::LeafCertificateBuilder;
use crate::configs::{AppConfig, CaConfig, ExtendedUsage};
use crate::crl::{CrlBuilder, CrlEntry};
use crate::error::{CertProcessorError, Result, StorageError};
use crate::keyring::{Fingerprint, GpgKeyring, KeyringSelector, Keyrings};
use crate::serial::SerialNumber;
use crate::storage::{self, CertStore, IssuedCertificate};
use crate::verifier::TrustVerifier;
use chrono::{Duration, SubsecRound, Utc};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Req, X509};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Serial draws per issuance before giving up.
pub const MAX_SERIAL_ATTEMPTS: usize = 5;

pub struct CertProcessor {
    authority: CertificateAuthority,
    verifier: TrustVerifier,
    store: Arc<dyn CertStore>,
    organization: String,
    alternate_names: Vec<String>,
    extended_key_usage: Vec<ExtendedUsage>,
    crl_next_update: Duration,
    last_crl_number: AtomicU64,
}

impl CertProcessor {
    /// Load the CA named by `ca` and bind it to the given keyrings and store.
    ///
    /// # Errors
    /// `CaUnavailable` when the CA key or certificate cannot be loaded or do
    /// not form a pair.
    pub fn new(ca: &CaConfig, keyrings: Keyrings, store: Arc<dyn CertStore>) -> Result<Self> {
        let authority = CertificateAuthority::load(&ca.key, &ca.cert, ca.key_passphrase.as_ref())?;
        Ok(Self {
            authority,
            verifier: TrustVerifier::new(keyrings),
            store,
            organization: ca.issuer.clone(),
            alternate_names: ca.alternate_names(),
            extended_key_usage: ca.extended_key_usage.clone(),
            crl_next_update: Duration::days(i64::from(ca.crl_next_update_days)),
            last_crl_number: AtomicU64::new(0),
        })
    }

    /// Build a processor from a full configuration: GnuPG keyrings for both
    /// trust domains and the configured storage backend.
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let keyrings = Keyrings::new(
            Arc::new(GpgKeyring::new(&config.gnupg.binary, &config.gnupg.user)),
            Arc::new(GpgKeyring::new(&config.gnupg.binary, &config.gnupg.admin)),
        );
        let store = storage::open(&config.storage)?;
        Self::new(&config.ca, keyrings, store)
    }

    /// The CA certificate.
    pub fn get_ca_cert(&self) -> &X509 {
        self.authority.certificate()
    }

    /// The CA private key. Never hand this to untrusted callers.
    pub fn get_ca_key(&self) -> Result<PKey<Private>> {
        self.authority.private_key()
    }

    pub fn store(&self) -> &Arc<dyn CertStore> {
        &self.store
    }

    /// Verify a request signed by a member of the user keyring.
    pub fn verify(&self, csr_bytes: &[u8], signature_path: &Path) -> Result<Fingerprint> {
        Ok(self
            .verifier
            .verify_file(csr_bytes, signature_path, KeyringSelector::User)?)
    }

    /// Verify a request signed by a member of the admin keyring. User keys are
    /// never consulted.
    pub fn admin_verify(&self, csr_bytes: &[u8], signature_path: &Path) -> Result<Fingerprint> {
        Ok(self
            .verifier
            .verify_file(csr_bytes, signature_path, KeyringSelector::Admin)?)
    }

    /// Issue a certificate for the CSR's public key, bound to `fingerprint`.
    ///
    /// The subject comes from the signer's keyring identity; the subject
    /// requested in the CSR is ignored. Returns the PEM certificate only after
    /// its record has been stored.
    ///
    /// # Errors
    /// - `InvalidRequest` for a zero validity, a validity that would outlive
    ///   the CA certificate, or a CSR whose self-signature does not verify
    /// - `KeyNotFound` when `fingerprint` belongs to neither keyring
    /// - `SerialCollisionExhausted` when every serial draw collided
    /// - `Storage` when the record could not be stored; nothing is issued
    #[instrument(skip_all, fields(fingerprint = %fingerprint))]
    pub fn generate_cert(
        &self,
        csr: &X509Req,
        validity_days: u32,
        fingerprint: &Fingerprint,
    ) -> Result<Vec<u8>> {
        if validity_days == 0 {
            return Err(CertProcessorError::InvalidRequest(
                "validity must be at least one day".to_string(),
            ));
        }
        let not_before = Utc::now().trunc_subsecs(0);
        let not_after = not_before
            .checked_add_signed(Duration::days(i64::from(validity_days)))
            .ok_or_else(|| {
                CertProcessorError::InvalidRequest(format!(
                    "validity of {} days is out of range",
                    validity_days
                ))
            })?;
        let ca_not_after = self.authority.not_after()?;
        if not_after > ca_not_after {
            return Err(CertProcessorError::InvalidRequest(format!(
                "validity of {} days ends after the CA certificate expires at {}",
                validity_days, ca_not_after
            )));
        }

        let public_key = csr.public_key().map_err(|e| {
            CertProcessorError::InvalidRequest(format!("unreadable CSR public key: {}", e))
        })?;
        if !csr.verify(&public_key).unwrap_or(false) {
            return Err(CertProcessorError::InvalidRequest(
                "CSR self-signature does not verify".to_string(),
            ));
        }

        let common_name = self.signer_common_name(fingerprint)?;
        if let Some(requested) = requested_common_name(csr) {
            if requested != common_name {
                debug!(%requested, %common_name, "ignoring CSR subject in favour of signer identity");
            }
        }

        for attempt in 1..=MAX_SERIAL_ATTEMPTS {
            let serial = SerialNumber::random()?;
            let certificate = LeafCertificateBuilder::new(&self.authority)
                .subject_common_name(common_name.clone())
                .organization(self.organization.clone())
                .public_key(public_key.clone())
                .serial(serial)
                .validity(not_before, not_after)
                .alternate_names(self.alternate_names.clone())
                .extended_key_usage(self.extended_key_usage.clone())
                .build()?;
            let pem = certificate.to_pem()?;

            let record = IssuedCertificate {
                serial,
                fingerprint: fingerprint.clone(),
                common_name: common_name.clone(),
                certificate_pem: String::from_utf8_lossy(&pem).into_owned(),
                issued_at: not_before,
                expires_at: not_after,
                revoked: false,
                revoked_at: None,
            };
            match self.store.save_cert(&record) {
                Ok(()) => {
                    info!(%serial, %common_name, validity_days, "certificate issued");
                    return Ok(pem);
                }
                Err(StorageError::DuplicateSerial(_)) => {
                    warn!(%serial, attempt, "serial collision, drawing a new serial");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(CertProcessorError::SerialCollisionExhausted {
            attempts: MAX_SERIAL_ATTEMPTS,
        })
    }

    /// Stored record of an issued certificate.
    pub fn get_cert(&self, serial: SerialNumber) -> Result<IssuedCertificate> {
        self.store
            .get_cert(serial)?
            .ok_or(CertProcessorError::CertNotFound(serial))
    }

    /// Revoke a certificate. Revoking twice is not an error and keeps the
    /// first revocation time.
    #[instrument(skip_all, fields(serial = %serial))]
    pub fn revoke_cert(&self, serial: SerialNumber) -> Result<IssuedCertificate> {
        let record = self
            .store
            .revoke_cert(serial, Utc::now().trunc_subsecs(0))?;
        Ok(record)
    }

    /// Signed CRL listing every revoked certificate, in PEM form. Empty when
    /// nothing is revoked.
    #[instrument(skip_all)]
    pub fn get_crl(&self) -> Result<Vec<u8>> {
        let entries: Vec<CrlEntry> = self
            .store
            .get_revoked_certs()?
            .iter()
            .filter_map(CrlEntry::from_record)
            .collect();
        let now = Utc::now().trunc_subsecs(0);
        let count = entries.len();
        let crl_number = self.next_crl_number(now);
        let pem = CrlBuilder::new(&self.authority)
            .this_update(now)
            .next_update(now + self.crl_next_update)
            .entries(entries)
            .crl_number(crl_number)
            .build()?;
        debug!(entries = count, crl_number, "CRL generated");
        Ok(pem)
    }

    /// Generation time in Unix seconds, bumped past the previous number when
    /// several CRLs are generated within one second.
    fn next_crl_number(&self, now: chrono::DateTime<Utc>) -> u64 {
        let floor = u64::try_from(now.timestamp()).unwrap_or(0);
        let previous = match self.last_crl_number.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |last| Some(floor.max(last + 1)),
        ) {
            Ok(last) | Err(last) => last,
        };
        floor.max(previous + 1)
    }

    /// Every certificate issued to a signer, oldest first.
    pub fn certs_for_signer(&self, fingerprint: &Fingerprint) -> Result<Vec<IssuedCertificate>> {
        Ok(self.store.get_certs_by_fingerprint(fingerprint)?)
    }

    /// Subject CN for a signer known to either keyring.
    fn signer_common_name(&self, fingerprint: &Fingerprint) -> Result<String> {
        let keyrings = self.verifier.keyrings();
        for selector in [KeyringSelector::User, KeyringSelector::Admin] {
            let keyring = keyrings.select(selector);
            if keyring.contains(fingerprint)? {
                let name = keyring
                    .identity(fingerprint)?
                    .map(|uid| common_name_from_user_id(&uid))
                    .filter(|cn| !cn.is_empty())
                    .unwrap_or_else(|| fingerprint.to_string());
                return Ok(name);
            }
        }
        Err(CertProcessorError::KeyNotFound(fingerprint.to_string()))
    }
}

impl std::fmt::Debug for CertProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertProcessor")
            .field("authority", &self.authority)
            .field("organization", &self.organization)
            .field("alternate_names", &self.alternate_names)
            .finish_non_exhaustive()
    }
}

/// `Name <mail>` gives `mail`; anything else is used as is.
fn common_name_from_user_id(user_id: &str) -> String {
    match (user_id.rfind('<'), user_id.rfind('>')) {
        (Some(start), Some(end)) if start < end => {
            let mail = user_id[start + 1..end].trim();
            if mail.is_empty() {
                user_id.trim().to_string()
            } else {
                mail.to_string()
            }
        }
        _ => user_id.trim().to_string(),
    }
}

fn requested_common_name(csr: &X509Req) -> Option<String> {
    csr.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
}
