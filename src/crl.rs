//! Certificate Revocation List generation
//!
//! openssl can parse CRLs but not build them, so the `TBSCertList` is
//! assembled with `x509-cert`, signed with the CA key through openssl, and
//! re-parsed by openssl for PEM output. The result is a version 2 CRL with
//! a CRL number and, when the CA certificate carries a subject key
//! identifier, an authority key identifier.
//!
//! # Example
//! ```rust,no_run
//! # use pgp_mtls_ca::crl::CrlBuilder;
//! # use pgp_mtls_ca::ca_key_store::CertificateAuthority;
//! # fn example(ca: &CertificateAuthority) -> pgp_mtls_ca::error::Result<()> {
//! let now = chrono::Utc::now();
//! let pem = CrlBuilder::new(ca)
//!     .this_update(now)
//!     .next_update(now + chrono::Duration::days(7))
//!     .build()?;
//! assert!(pem.starts_with(b"-----BEGIN X509 CRL-----"));
//! # Ok(())
//! # }
//! ```

use crate::ca_key_store::CertificateAuthority;
use crate::error::{CertProcessorError, Result};
use crate::serial::SerialNumber;
use crate::storage::IssuedCertificate;
use chrono::{DateTime, Utc};
use openssl::x509::X509Crl;
use std::time::Duration;
use x509_cert::crl::{CertificateList, RevokedCert, TbsCertList};
use x509_cert::der::asn1::{BitString, ObjectIdentifier, OctetString, Uint, UtcTime};
use x509_cert::der::{Any, AnyRef, Decode, Encode};
use x509_cert::ext::pkix::AuthorityKeyIdentifier;
use x509_cert::ext::Extension;
use x509_cert::name::Name;
use x509_cert::serial_number::SerialNumber as DerSerialNumber;
use x509_cert::spki::AlgorithmIdentifierOwned;
use x509_cert::time::Time;
use x509_cert::Version;

const OID_CRL_NUMBER: &str = "2.5.29.20";
const OID_AUTHORITY_KEY_IDENTIFIER: &str = "2.5.29.35";

/// One revoked certificate as it appears in the CRL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrlEntry {
    pub serial: SerialNumber,
    pub revoked_at: DateTime<Utc>,
}

impl CrlEntry {
    /// `None` for records that are not revoked.
    pub fn from_record(record: &IssuedCertificate) -> Option<Self> {
        match (record.revoked, record.revoked_at) {
            (true, Some(revoked_at)) => Some(CrlEntry {
                serial: record.serial,
                revoked_at,
            }),
            _ => None,
        }
    }
}

// ================= CRL Builder =================

/// Builder for a signed CRL in PEM form
pub struct CrlBuilder<'a> {
    authority: &'a CertificateAuthority,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    entries: Vec<CrlEntry>,
    crl_number: Option<u64>,
}

impl<'a> CrlBuilder<'a> {
    pub fn new(authority: &'a CertificateAuthority) -> Self {
        Self {
            authority,
            this_update: Utc::now(),
            next_update: None,
            entries: Vec::new(),
            crl_number: None,
        }
    }

    pub fn this_update(mut self, at: DateTime<Utc>) -> Self {
        self.this_update = at;
        self
    }

    pub fn next_update(mut self, at: DateTime<Utc>) -> Self {
        self.next_update = Some(at);
        self
    }

    /// Entries are listed in the order given.
    pub fn entries(mut self, entries: Vec<CrlEntry>) -> Self {
        self.entries = entries;
        self
    }

    /// Defaults to `this_update` in seconds since the epoch.
    pub fn crl_number(mut self, number: u64) -> Self {
        self.crl_number = Some(number);
        self
    }

    /// Sign the CRL and return its PEM encoding.
    pub fn build(self) -> Result<Vec<u8>> {
        let der = self.build_der()?;
        let crl = X509Crl::from_der(&der)?;
        Ok(crl.to_pem()?)
    }

    fn build_der(&self) -> Result<Vec<u8>> {
        let ca_cert = self.authority.certificate();
        let scheme = self.authority.scheme();

        let algorithm = AlgorithmIdentifierOwned {
            oid: oid(scheme.oid())?,
            parameters: scheme
                .has_null_parameters()
                .then(|| Any::from(AnyRef::NULL)),
        };
        let issuer = Name::from_der(&ca_cert.subject_name().to_der()?)?;

        let revoked_certificates = if self.entries.is_empty() {
            // an empty SEQUENCE OF is not allowed; the field is omitted
            None
        } else {
            let revoked = self
                .entries
                .iter()
                .map(|entry| -> Result<RevokedCert> {
                    Ok(RevokedCert {
                        serial_number: DerSerialNumber::new(&entry.serial.to_be_bytes())?,
                        revocation_date: to_time(entry.revoked_at)?,
                        crl_entry_extensions: None,
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            Some(revoked)
        };

        let crl_number = self
            .crl_number
            .unwrap_or_else(|| self.this_update.timestamp().max(0) as u64);
        let crl_number_bytes = crl_number.to_be_bytes();
        let mut crl_extensions = vec![Extension {
            extn_id: oid(OID_CRL_NUMBER)?,
            critical: false,
            extn_value: OctetString::new(
                Uint::new(strip_leading_zeros(&crl_number_bytes))?.to_der()?,
            )?,
        }];
        if let Some(key_id) = ca_cert.subject_key_id() {
            let aki = AuthorityKeyIdentifier {
                key_identifier: Some(OctetString::new(key_id.as_slice())?),
                authority_cert_issuer: None,
                authority_cert_serial_number: None,
            };
            crl_extensions.push(Extension {
                extn_id: oid(OID_AUTHORITY_KEY_IDENTIFIER)?,
                critical: false,
                extn_value: OctetString::new(aki.to_der()?)?,
            });
        }

        let tbs_cert_list = TbsCertList {
            version: Version::V2,
            signature: algorithm.clone(),
            issuer,
            this_update: to_time(self.this_update)?,
            next_update: self.next_update.map(to_time).transpose()?,
            revoked_certificates,
            crl_extensions: Some(crl_extensions),
        };

        let signature = self.authority.sign_bytes(&tbs_cert_list.to_der()?)?;
        let crl = CertificateList {
            tbs_cert_list,
            signature_algorithm: algorithm,
            signature: BitString::from_bytes(&signature)?,
        };
        Ok(crl.to_der()?)
    }
}

fn oid(dotted: &str) -> Result<ObjectIdentifier> {
    ObjectIdentifier::new(dotted)
        .map_err(|e| CertProcessorError::Encoding(format!("bad OID {}: {}", dotted, e)))
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes
        .iter()
        .position(|b| *b != 0)
        .unwrap_or(bytes.len().saturating_sub(1));
    &bytes[first..]
}

fn to_time(at: DateTime<Utc>) -> Result<Time> {
    let secs = u64::try_from(at.timestamp()).map_err(|_| {
        CertProcessorError::Encoding(format!("timestamp before the epoch: {}", at))
    })?;
    Ok(Time::UtcTime(UtcTime::from_unix_duration(
        Duration::from_secs(secs),
    )?))
}
