//! Leaf Certificate Generation Module
//!
//! Builds the end-entity certificates handed to mTLS clients. The subject
//! comes from the verified signer's identity, the public key from the CSR,
//! and the extension set is fixed:
//!
//! - **Basic Constraints**: CA=false, critical
//! - **Key Usage**: digitalSignature, keyEncipherment, critical
//! - **Extended Key Usage**: clientAuth and/or serverAuth as configured
//! - **Subject Alternative Name**: the configured DNS patterns
//! - **Subject/Authority Key Identifier**
//!
//! ```text
//! CA certificate (loaded from disk)
//!   └── Leaf certificate (signed by the CA) ← This module
//! ```

use crate::ca_key_store::CertificateAuthority;
use crate::configs::ExtendedUsage;
use crate::error::{CertProcessorError, Result};
use crate::serial::SerialNumber;
use chrono::{DateTime, Utc};
use openssl::asn1::Asn1Time;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Public};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
    SubjectKeyIdentifier,
};
use openssl::x509::{X509Name, X509};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Builder for end-entity certificates signed by the CA
///
/// # Required Fields
/// - `subject_common_name` - signer identity (usually an e-mail address)
/// - `public_key` - the CSR's public key
/// - `serial` - allocated serial number
/// - `validity` - not-before / not-after window
///
/// # Examples
/// ```rust,no_run
/// # use pgp_mtls_ca::certificate_builder::LeafCertificateBuilder;
/// # use pgp_mtls_ca::ca_key_store::CertificateAuthority;
/// # use pgp_mtls_ca::serial::SerialNumber;
/// # use pgp_mtls_ca::configs::ExtendedUsage;
/// # fn example(ca: &CertificateAuthority, key: openssl::pkey::PKey<openssl::pkey::Public>) -> pgp_mtls_ca::error::Result<()> {
/// let now = chrono::Utc::now();
/// let cert = LeafCertificateBuilder::new(ca)
///     .subject_common_name("alice@example.com".to_string())
///     .organization("Example Corp".to_string())
///     .public_key(key)
///     .serial(SerialNumber::random()?)
///     .validity(now, now + chrono::Duration::days(60))
///     .alternate_names(vec!["*.example.com".to_string()])
///     .extended_key_usage(vec![ExtendedUsage::ClientAuth])
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct LeafCertificateBuilder<'a> {
    authority: &'a CertificateAuthority,
    subject_common_name: String,
    organization: String,
    public_key: Option<PKey<Public>>,
    serial: Option<SerialNumber>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    alternate_names: Vec<String>,
    extended_key_usage: Vec<ExtendedUsage>,
}

impl<'a> LeafCertificateBuilder<'a> {
    pub fn new(authority: &'a CertificateAuthority) -> Self {
        let now = Utc::now();
        Self {
            authority,
            subject_common_name: String::new(),
            organization: String::new(),
            public_key: None,
            serial: None,
            not_before: now,
            not_after: now,
            alternate_names: Vec::new(),
            extended_key_usage: vec![ExtendedUsage::ClientAuth],
        }
    }

    pub fn subject_common_name(mut self, cn: String) -> Self {
        self.subject_common_name = cn;
        self
    }

    /// Organization (O); left out of the subject when empty
    pub fn organization(mut self, org: String) -> Self {
        self.organization = org;
        self
    }

    pub fn public_key(mut self, key: PKey<Public>) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn serial(mut self, serial: SerialNumber) -> Self {
        self.serial = Some(serial);
        self
    }

    pub fn validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn alternate_names(mut self, names: Vec<String>) -> Self {
        self.alternate_names = names;
        self
    }

    pub fn extended_key_usage(mut self, usages: Vec<ExtendedUsage>) -> Self {
        self.extended_key_usage = usages;
        self
    }

    /// Build and sign the certificate
    ///
    /// # Errors
    /// `InvalidRequest` when a required field is missing or the validity
    /// window is empty; `Crypto` when openssl rejects a field.
    pub fn build(self) -> Result<X509> {
        if self.subject_common_name.is_empty() {
            return Err(CertProcessorError::InvalidRequest(
                "subject common name is empty".to_string(),
            ));
        }
        let public_key = self.public_key.ok_or_else(|| {
            CertProcessorError::InvalidRequest("certificate public key not set".to_string())
        })?;
        let serial = self
            .serial
            .ok_or_else(|| CertProcessorError::InvalidRequest("serial not set".to_string()))?;
        if self.not_after <= self.not_before {
            return Err(CertProcessorError::InvalidRequest(
                "validity window is empty".to_string(),
            ));
        }
        let ca_cert = self.authority.certificate();

        let mut builder = X509::builder()?;
        builder.set_version(X509_VERSION_3)?;
        let serial_number = serial.to_asn1_integer()?;
        builder.set_serial_number(&serial_number)?;

        let mut name_builder = X509Name::builder()?;
        name_builder.append_entry_by_nid(Nid::COMMONNAME, &self.subject_common_name)?;
        if !self.organization.is_empty() {
            name_builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)?;
        }
        let subject_name = name_builder.build();
        builder.set_subject_name(&subject_name)?;

        // Issuer is the CA's own subject so chains build
        builder.set_issuer_name(ca_cert.subject_name())?;

        let not_before = Asn1Time::from_unix(self.not_before.timestamp())?;
        let not_after = Asn1Time::from_unix(self.not_after.timestamp())?;
        builder.set_not_before(&not_before)?;
        builder.set_not_after(&not_after)?;
        builder.set_pubkey(&public_key)?;

        // No .ca() call - this is an end-entity certificate
        builder.append_extension(BasicConstraints::new().critical().build()?)?;
        builder.append_extension(
            KeyUsage::new()
                .critical()
                .digital_signature()
                .key_encipherment()
                .build()?,
        )?;

        if !self.extended_key_usage.is_empty() {
            let mut eku = ExtendedKeyUsage::new();
            for usage in &self.extended_key_usage {
                match usage {
                    ExtendedUsage::ClientAuth => eku.client_auth(),
                    ExtendedUsage::ServerAuth => eku.server_auth(),
                };
            }
            builder.append_extension(eku.build()?)?;
        }

        let subject_key_id = {
            let ctx = builder.x509v3_context(Some(ca_cert), None);
            SubjectKeyIdentifier::new().build(&ctx)?
        };
        builder.append_extension(subject_key_id)?;

        let authority_key_id = {
            let ctx = builder.x509v3_context(Some(ca_cert), None);
            AuthorityKeyIdentifier::new().keyid(false).build(&ctx)?
        };
        builder.append_extension(authority_key_id)?;

        if !self.alternate_names.is_empty() {
            let san = {
                let ctx = builder.x509v3_context(Some(ca_cert), None);
                let mut san = SubjectAlternativeName::new();
                for name in &self.alternate_names {
                    san.dns(name);
                }
                san.build(&ctx)?
            };
            builder.append_extension(san)?;
        }

        self.authority.sign_certificate(&mut builder)?;
        Ok(builder.build())
    }
}
