//! Shared fixtures for unit tests: a throwaway CA on disk, CSR generation,
//! and an in-memory keyring with deterministic fake signatures.

use crate::ca_key_store::CertificateAuthority;
use crate::configs::{CaConfig, ExtendedUsage};
use crate::error::VerifyError;
use crate::keyring::{
    canonical_text, Fingerprint, Keyring, Keyrings, SignatureArtifact, SignatureCheck,
};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{Id, PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};
use openssl::x509::{X509Name, X509Req, X509};
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const X509_VERSION_3: i32 = 2;
const FAKE_SIGNATURE_TAG: &str = "FAKESIG";

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// ================= Throwaway certificate authority =================

/// RSA CA written to a temporary directory as PEM files.
pub struct TestCa {
    pub dir: TempDir,
    pub key_path: PathBuf,
    pub cert_path: PathBuf,
    pub key: PKey<Private>,
    pub cert: X509,
}

impl TestCa {
    pub fn new() -> Self {
        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();
        let cert = Self::self_signed(&key, "Test Root CA");

        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("RootCA.key");
        let cert_path = dir.path().join("RootCA.pem");
        std::fs::write(&key_path, key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        std::fs::write(&cert_path, cert.to_pem().unwrap()).unwrap();

        Self {
            dir,
            key_path,
            cert_path,
            key,
            cert,
        }
    }

    /// Self-signed CA certificate for `key`.
    pub fn self_signed(key: &PKey<Private>, cn: &str) -> X509 {
        let mut builder = X509::builder().unwrap();
        builder.set_version(X509_VERSION_3).unwrap();

        let serial_number = {
            let mut serial = BigNum::new().unwrap();
            serial.rand(127, MsbOption::MAYBE_ZERO, false).unwrap();
            serial.to_asn1_integer().unwrap()
        };
        builder.set_serial_number(&serial_number).unwrap();

        let mut name_builder = X509Name::builder().unwrap();
        name_builder
            .append_entry_by_nid(Nid::COMMONNAME, cn)
            .unwrap();
        name_builder
            .append_entry_by_nid(Nid::ORGANIZATIONNAME, "My Company Name")
            .unwrap();
        let name = name_builder.build();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();

        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(365).unwrap())
            .unwrap();
        builder.set_pubkey(key).unwrap();

        builder
            .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
            .unwrap();
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .digital_signature()
                    .build()
                    .unwrap(),
            )
            .unwrap();
        let subject_key_id = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(subject_key_id).unwrap();

        let digest = match key.id() {
            Id::ED25519 => MessageDigest::null(),
            _ => MessageDigest::sha256(),
        };
        builder.sign(key, digest).unwrap();
        builder.build()
    }

    pub fn authority(&self) -> CertificateAuthority {
        CertificateAuthority::new(self.key.clone(), self.cert.clone()).unwrap()
    }

    pub fn ca_config(&self) -> CaConfig {
        CaConfig {
            key: self.key_path.clone(),
            cert: self.cert_path.clone(),
            key_passphrase: None,
            issuer: "My Company Name".to_string(),
            alternate_name: "*.myname.com".to_string(),
            extended_key_usage: vec![ExtendedUsage::ClientAuth],
            crl_next_update_days: 7,
        }
    }
}

/// EC P-256 CSR with the given CN, plus its private key.
pub fn generate_csr(cn: &str) -> (X509Req, PKey<Private>) {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, cn)
        .unwrap();
    let name = name_builder.build();

    let mut builder = X509Req::builder().unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

// ================= In-memory keyring =================

/// A fake OpenPGP identity. Its "signatures" are armored digests tagged with
/// the fingerprint.
#[derive(Debug, Clone)]
pub struct TestSigner {
    pub name: String,
    pub email: String,
    pub fingerprint: Fingerprint,
}

impl TestSigner {
    pub fn new(email: &str) -> Self {
        let name = email.split('@').next().unwrap_or(email).to_string();
        Self {
            name,
            email: email.to_string(),
            fingerprint: Fingerprint::new(&hex(&openssl::sha::sha1(email.as_bytes()))),
        }
    }

    pub fn user_id(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }

    fn signature_block(&self, covered: &[u8]) -> String {
        format!(
            "-----BEGIN PGP SIGNATURE-----\n\n{} {} {}\n-----END PGP SIGNATURE-----\n",
            FAKE_SIGNATURE_TAG,
            self.fingerprint,
            hex(&openssl::sha::sha256(covered))
        )
    }

    pub fn sign_detached(&self, content: &[u8]) -> SignatureArtifact {
        SignatureArtifact::from_bytes(self.signature_block(content).into_bytes())
    }

    pub fn sign_clear(&self, content: &[u8]) -> SignatureArtifact {
        let text = String::from_utf8_lossy(content);
        let canonical = canonical_text(&text);
        let mut message = String::from("-----BEGIN PGP SIGNED MESSAGE-----\nHash: SHA256\n\n");
        for line in canonical.lines() {
            if line.starts_with('-') {
                message.push_str("- ");
            }
            message.push_str(line);
            message.push('\n');
        }
        message.push_str(&self.signature_block(canonical.as_bytes()));
        SignatureArtifact::from_bytes(message.into_bytes())
    }
}

/// Keyring over a fixed member list.
///
/// A strict keyring only recognizes signatures of its members; a lenient one
/// verifies any fake signature but still reports membership truthfully.
pub struct FakeKeyring {
    members: Vec<TestSigner>,
    lenient: bool,
}

impl FakeKeyring {
    pub fn new(members: Vec<TestSigner>) -> Self {
        Self {
            members,
            lenient: false,
        }
    }

    pub fn lenient(members: Vec<TestSigner>) -> Self {
        Self {
            members,
            lenient: true,
        }
    }

    fn member(&self, fingerprint: &Fingerprint) -> Option<&TestSigner> {
        self.members.iter().find(|m| m.fingerprint == *fingerprint)
    }
}

impl Keyring for FakeKeyring {
    fn verify(
        &self,
        content: &[u8],
        artifact: &SignatureArtifact,
    ) -> Result<SignatureCheck, VerifyError> {
        let text = String::from_utf8_lossy(artifact.as_bytes());
        let Some(fields) = text
            .lines()
            .find_map(|line| line.strip_prefix(FAKE_SIGNATURE_TAG))
            .map(|rest| rest.split_whitespace().collect::<Vec<_>>())
        else {
            return Ok(SignatureCheck::Malformed {
                reason: "no signature packet".to_string(),
            });
        };
        let [fpr, digest] = fields.as_slice() else {
            return Ok(SignatureCheck::Malformed {
                reason: "truncated signature packet".to_string(),
            });
        };

        let fingerprint = Fingerprint::new(fpr);
        let key_id = fingerprint.as_str()[fingerprint.as_str().len() - 16..].to_string();
        if !self.lenient && self.member(&fingerprint).is_none() {
            return Ok(SignatureCheck::UnknownSigner { key_id });
        }

        let covered = match artifact {
            SignatureArtifact::Detached(_) => content.to_vec(),
            SignatureArtifact::Clearsigned(_) => {
                canonical_text(&artifact.cleartext().unwrap_or_default()).into_bytes()
            }
        };
        if hex(&openssl::sha::sha256(&covered)) != *digest {
            return Ok(SignatureCheck::Bad { key_id });
        }
        Ok(SignatureCheck::Good { fingerprint })
    }

    fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, VerifyError> {
        Ok(self.member(fingerprint).is_some())
    }

    fn identity(&self, fingerprint: &Fingerprint) -> Result<Option<String>, VerifyError> {
        Ok(self.member(fingerprint).map(TestSigner::user_id))
    }
}

/// Three users, one admin and one signer known to neither keyring.
pub struct TestKeys {
    pub users: Vec<TestSigner>,
    pub admins: Vec<TestSigner>,
    pub outsider: TestSigner,
}

impl TestKeys {
    pub fn new() -> Self {
        Self {
            users: ["user@host", "user2@host", "user3@host"]
                .into_iter()
                .map(TestSigner::new)
                .collect(),
            admins: vec![TestSigner::new("admin@host")],
            outsider: TestSigner::new("user4@host"),
        }
    }

    pub fn keyrings(&self) -> Keyrings {
        Keyrings::new(
            Arc::new(FakeKeyring::new(self.users.clone())),
            Arc::new(FakeKeyring::new(self.admins.clone())),
        )
    }
}
