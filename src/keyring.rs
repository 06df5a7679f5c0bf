//! External keyring contract
//!
//! The authority never performs OpenPGP cryptography itself. Each trust
//! domain (user, admin) is backed by a keyring that answers three questions:
//! is this signature good over these bytes and who made it, is this
//! fingerprint a member, and which user ID does it carry. For a clearsigned
//! artifact "these bytes" is the embedded cleartext, which must equal the
//! supplied content up to line endings and trailing whitespace.
//!
//! [`GpgKeyring`] answers them by driving a `gpg` binary against one GnuPG
//! home directory per domain.

use crate::error::VerifyError;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::Arc;
use tracing::{debug, warn};

const CLEARSIGN_HEADER: &str = "-----BEGIN PGP SIGNED MESSAGE-----";
const SIGNATURE_HEADER: &str = "-----BEGIN PGP SIGNATURE-----";

/// Hex fingerprint of an OpenPGP key, normalized to uppercase without spaces.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(raw: &str) -> Self {
        Fingerprint(
            raw.chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_ascii_uppercase(),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(raw: &str) -> Self {
        Fingerprint::new(raw)
    }
}

/// Trust domain a signature is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyringSelector {
    User,
    Admin,
}

impl fmt::Display for KeyringSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyringSelector::User => f.write_str("user"),
            KeyringSelector::Admin => f.write_str("admin"),
        }
    }
}

/// An OpenPGP signature over a certificate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureArtifact {
    /// Signature only; the covered bytes are supplied separately.
    Detached(Vec<u8>),
    /// Cleartext plus signature in one armored message.
    Clearsigned(Vec<u8>),
}

impl SignatureArtifact {
    /// Classify raw artifact bytes by their armor header.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let is_clearsigned = std::str::from_utf8(&bytes)
            .map(|text| text.trim_start().starts_with(CLEARSIGN_HEADER))
            .unwrap_or(false);
        if is_clearsigned {
            SignatureArtifact::Clearsigned(bytes)
        } else {
            SignatureArtifact::Detached(bytes)
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            SignatureArtifact::Detached(bytes) | SignatureArtifact::Clearsigned(bytes) => bytes,
        }
    }

    /// The text a clearsigned message covers, with dash-escaping removed.
    ///
    /// `None` for detached artifacts and for clearsigned messages without a
    /// signature block.
    pub fn cleartext(&self) -> Option<String> {
        let SignatureArtifact::Clearsigned(bytes) = self else {
            return None;
        };
        let text = std::str::from_utf8(bytes).ok()?;
        let mut lines = text.lines().map(|l| l.trim_end_matches('\r'));
        lines.find(|l| l.trim_end() == CLEARSIGN_HEADER)?;
        // armor headers ("Hash: SHA256") end at the first empty line
        for line in lines.by_ref() {
            if line.trim().is_empty() {
                break;
            }
        }
        let mut body = Vec::new();
        for line in lines {
            if line.trim_end() == SIGNATURE_HEADER {
                return Some(body.join("\n"));
            }
            body.push(line.strip_prefix("- ").unwrap_or(line));
        }
        None
    }
}

/// Normalize text the way OpenPGP canonical text signatures see it:
/// line endings unified, trailing whitespace per line and trailing empty
/// lines dropped.
pub fn canonical_text(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .map(|l| l.trim_end_matches(['\r', ' ', '\t']))
        .collect();
    lines.join("\n").trim_end_matches('\n').to_string()
}

/// What a keyring concluded about a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureCheck {
    /// Cryptographically valid over the given content.
    Good { fingerprint: Fingerprint },
    /// Made by a known key but does not verify over the given content.
    Bad { key_id: String },
    /// The signing key is not present in this keyring.
    UnknownSigner { key_id: String },
    /// Not a parsable signature.
    Malformed { reason: String },
}

/// One trust domain's public keys plus raw verify primitive.
pub trait Keyring: Send + Sync {
    fn verify(
        &self,
        content: &[u8],
        artifact: &SignatureArtifact,
    ) -> Result<SignatureCheck, VerifyError>;

    fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, VerifyError>;

    /// Primary user ID of a member key, if it has one.
    fn identity(&self, fingerprint: &Fingerprint) -> Result<Option<String>, VerifyError>;
}

/// The two trust domains. They never share trust.
#[derive(Clone)]
pub struct Keyrings {
    pub user: Arc<dyn Keyring>,
    pub admin: Arc<dyn Keyring>,
}

impl Keyrings {
    pub fn new(user: Arc<dyn Keyring>, admin: Arc<dyn Keyring>) -> Self {
        Self { user, admin }
    }

    pub fn select(&self, selector: KeyringSelector) -> &dyn Keyring {
        match selector {
            KeyringSelector::User => self.user.as_ref(),
            KeyringSelector::Admin => self.admin.as_ref(),
        }
    }
}

impl fmt::Debug for Keyrings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keyrings").finish_non_exhaustive()
    }
}

// ================= GnuPG-backed keyring =================

/// Keyring stored in a GnuPG home directory.
#[derive(Debug, Clone)]
pub struct GpgKeyring {
    binary: PathBuf,
    home: PathBuf,
}

impl GpgKeyring {
    pub fn new(binary: impl Into<PathBuf>, home: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            home: home.into(),
        }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--homedir")
            .arg(&self.home)
            .args(["--batch", "--no-tty", "--status-fd", "1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn run(&self, mut cmd: Command) -> Result<Output, VerifyError> {
        cmd.output()
            .map_err(|e| VerifyError::Keyring(format!("failed to run {:?}: {}", self.binary, e)))
    }

    fn list_key(&self, fingerprint: &Fingerprint) -> Result<Option<String>, VerifyError> {
        let mut cmd = self.command();
        cmd.args(["--with-colons", "--fixed-list-mode", "--list-keys", "--"])
            .arg(fingerprint.as_str());
        let output = self.run(cmd)?;
        if !output.status.success() {
            // gpg exits non-zero when the key is unknown
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&output.stdout).into_owned()))
    }
}

impl Keyring for GpgKeyring {
    fn verify(
        &self,
        content: &[u8],
        artifact: &SignatureArtifact,
    ) -> Result<SignatureCheck, VerifyError> {
        // Temporary files are removed when they drop at the end of this call
        let mut signature_file = tempfile::NamedTempFile::new()?;
        signature_file.write_all(artifact.as_bytes())?;
        signature_file.flush()?;

        let mut cmd = self.command();
        cmd.arg("--verify").arg(signature_file.path());

        let content_file = match artifact {
            SignatureArtifact::Detached(_) => {
                let mut file = tempfile::NamedTempFile::new()?;
                file.write_all(content)?;
                file.flush()?;
                cmd.arg(file.path());
                Some(file)
            }
            SignatureArtifact::Clearsigned(_) => None,
        };

        let output = self.run(cmd)?;
        drop(content_file);

        let status = String::from_utf8_lossy(&output.stdout);
        let check = match parse_verify_status(&status) {
            SignatureCheck::Good { fingerprint } if !covers_content(artifact, content) => {
                SignatureCheck::Bad {
                    key_id: fingerprint.to_string(),
                }
            }
            check => check,
        };
        debug!(home = %self.home.display(), ?check, "gpg verify finished");
        Ok(check)
    }

    fn contains(&self, fingerprint: &Fingerprint) -> Result<bool, VerifyError> {
        Ok(self
            .list_key(fingerprint)?
            .map(|listing| listing_has_fingerprint(&listing, fingerprint))
            .unwrap_or(false))
    }

    fn identity(&self, fingerprint: &Fingerprint) -> Result<Option<String>, VerifyError> {
        match self.list_key(fingerprint)? {
            Some(listing) if listing_has_fingerprint(&listing, fingerprint) => {
                Ok(first_user_id(&listing))
            }
            Some(_) => Ok(None),
            None => {
                warn!(%fingerprint, "identity requested for a key gpg does not know");
                Ok(None)
            }
        }
    }
}

/// Map `gpg --status-fd` output of a `--verify` run to a [`SignatureCheck`].
pub fn parse_verify_status(status: &str) -> SignatureCheck {
    let mut bad_key = None;
    let mut missing_key = None;
    let mut err_key = None;

    for line in status.lines() {
        let Some(rest) = line.strip_prefix("[GNUPG:] ") else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        match fields.as_slice() {
            ["VALIDSIG", signing_fpr, tail @ ..] => {
                // the primary key fingerprint is the 10th VALIDSIG argument
                let primary = tail.get(8).copied().unwrap_or(*signing_fpr);
                return SignatureCheck::Good {
                    fingerprint: Fingerprint::new(primary),
                };
            }
            ["BADSIG", key_id, ..] => bad_key = Some(key_id.to_string()),
            ["NO_PUBKEY", key_id, ..] => missing_key = Some(key_id.to_string()),
            ["ERRSIG", key_id, _, _, _, _, rc, ..] => {
                if *rc == "9" {
                    missing_key = Some(key_id.to_string());
                } else {
                    err_key = Some(key_id.to_string());
                }
            }
            _ => {}
        }
    }

    if let Some(key_id) = bad_key {
        SignatureCheck::Bad { key_id }
    } else if let Some(key_id) = missing_key {
        SignatureCheck::UnknownSigner { key_id }
    } else if let Some(key_id) = err_key {
        SignatureCheck::Malformed {
            reason: format!("signature by {} could not be checked", key_id),
        }
    } else {
        SignatureCheck::Malformed {
            reason: "no signature found".to_string(),
        }
    }
}

/// Detached signatures are checked by gpg over `content` directly; a
/// clearsigned message must carry `content` as its cleartext.
fn covers_content(artifact: &SignatureArtifact, content: &[u8]) -> bool {
    match artifact {
        SignatureArtifact::Detached(_) => true,
        SignatureArtifact::Clearsigned(_) => match artifact.cleartext() {
            Some(cleartext) => {
                canonical_text(&cleartext) == canonical_text(&String::from_utf8_lossy(content))
            }
            None => false,
        },
    }
}

fn listing_has_fingerprint(listing: &str, fingerprint: &Fingerprint) -> bool {
    listing
        .lines()
        .filter(|line| line.starts_with("fpr:"))
        .filter_map(|line| line.split(':').nth(9))
        .any(|fpr| Fingerprint::new(fpr) == *fingerprint)
}

fn first_user_id(listing: &str) -> Option<String> {
    listing
        .lines()
        .filter(|line| line.starts_with("uid:"))
        .filter(|line| {
            // validity 'r' (revoked) and 'e' (expired) user IDs are skipped
            !matches!(line.split(':').nth(1), Some("r") | Some("e"))
        })
        .filter_map(|line| line.split(':').nth(9))
        .map(unescape_colon_field)
        .find(|uid| !uid.is_empty())
}

/// Undo gpg's `\xHH` escaping in colon listings.
fn unescape_colon_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && bytes.get(i + 1) == Some(&b'x') && i + 4 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 2..i + 4])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FPR: &str = "0123456789ABCDEF0123456789ABCDEF01234567";

    #[test]
    fn test_fingerprint_normalized() {
        let fp = Fingerprint::new("0123 4567 89ab cdef");
        assert_eq!(fp.as_str(), "0123456789ABCDEF");
    }

    #[test]
    fn test_validsig_prefers_primary_fingerprint() {
        let status = format!(
            "[GNUPG:] NEWSIG\n\
             [GNUPG:] GOODSIG 89ABCDEF01234567 user <user@host>\n\
             [GNUPG:] VALIDSIG AAAABBBBCCCCDDDDEEEEFFFF0000111122223333 2024-01-01 1704067200 0 4 0 1 8 00 {}\n",
            FPR
        );
        assert_eq!(
            parse_verify_status(&status),
            SignatureCheck::Good {
                fingerprint: Fingerprint::new(FPR)
            }
        );
    }

    #[test]
    fn test_badsig_and_missing_key() {
        let bad = "[GNUPG:] BADSIG 89ABCDEF01234567 user <user@host>\n";
        assert_eq!(
            parse_verify_status(bad),
            SignatureCheck::Bad {
                key_id: "89ABCDEF01234567".to_string()
            }
        );

        let missing = "[GNUPG:] ERRSIG 89ABCDEF01234567 1 8 00 1704067200 9 -\n\
                       [GNUPG:] NO_PUBKEY 89ABCDEF01234567\n";
        assert_eq!(
            parse_verify_status(missing),
            SignatureCheck::UnknownSigner {
                key_id: "89ABCDEF01234567".to_string()
            }
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            parse_verify_status("[GNUPG:] NODATA 1\n"),
            SignatureCheck::Malformed { .. }
        ));
        assert!(matches!(
            parse_verify_status("[GNUPG:] ERRSIG 89ABCDEF01234567 1 8 00 1704067200 4 -\n"),
            SignatureCheck::Malformed { .. }
        ));
    }

    #[test]
    fn test_colon_listing_parsing() {
        let listing = format!(
            "tru::1:1704067200:0:3:1:5\n\
             pub:u:3072:1:89ABCDEF01234567:1704067200:::u:::scESC::::::23::0:\n\
             fpr:::::::::{}:\n\
             uid:r::::1704067200::HASH1::Old Name <old@host>::::::::::0:\n\
             uid:u::::1704067200::HASH2::User\\x3a Name <user@host>::::::::::0:\n",
            FPR
        );
        assert!(listing_has_fingerprint(&listing, &Fingerprint::new(FPR)));
        assert!(!listing_has_fingerprint(
            &listing,
            &Fingerprint::new("FFFF")
        ));
        assert_eq!(
            first_user_id(&listing).as_deref(),
            Some("User: Name <user@host>")
        );
    }

    #[test]
    fn test_artifact_classification_and_cleartext() {
        let detached = SignatureArtifact::from_bytes(
            b"-----BEGIN PGP SIGNATURE-----\n\nabc\n-----END PGP SIGNATURE-----\n".to_vec(),
        );
        assert!(matches!(detached, SignatureArtifact::Detached(_)));
        assert_eq!(detached.cleartext(), None);

        let clearsigned = SignatureArtifact::from_bytes(
            b"-----BEGIN PGP SIGNED MESSAGE-----\r\n\
              Hash: SHA256\r\n\
              \r\n\
              -----BEGIN CERTIFICATE REQUEST-----\r\n\
              - -----END CERTIFICATE REQUEST-----\r\n\
              -----BEGIN PGP SIGNATURE-----\r\n\
              \r\n\
              abc\r\n\
              -----END PGP SIGNATURE-----\r\n"
                .to_vec(),
        );
        assert!(matches!(clearsigned, SignatureArtifact::Clearsigned(_)));
        assert_eq!(
            clearsigned.cleartext().as_deref(),
            Some("-----BEGIN CERTIFICATE REQUEST-----\n-----END CERTIFICATE REQUEST-----")
        );
    }

    #[test]
    fn test_clearsigned_must_carry_content() {
        let clearsigned = SignatureArtifact::from_bytes(
            b"-----BEGIN PGP SIGNED MESSAGE-----\n\
              Hash: SHA256\n\
              \n\
              request body\n\
              -----BEGIN PGP SIGNATURE-----\n\
              \n\
              abc\n\
              -----END PGP SIGNATURE-----\n"
                .to_vec(),
        );
        assert!(covers_content(&clearsigned, b"request body\r\n"));
        assert!(!covers_content(&clearsigned, b"other body\n"));
        assert!(covers_content(
            &SignatureArtifact::Detached(b"sig".to_vec()),
            b"anything"
        ));
    }

    #[test]
    fn test_canonical_text() {
        assert_eq!(canonical_text("a  \r\nb\t\n\n"), "a\nb");
        assert_eq!(canonical_text("a\nb"), canonical_text("a\r\nb\r\n"));
    }

    // ================= gpg end to end =================

    use crate::test_support::generate_csr;
    use crate::verifier::TrustVerifier;
    use tempfile::TempDir;

    fn gpg_available() -> bool {
        Command::new("gpg")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn gpg(home: &Path, args: &[&str]) -> Output {
        let output = Command::new("gpg")
            .arg("--homedir")
            .arg(home)
            .args(["--batch", "--no-tty", "--pinentry-mode", "loopback", "--passphrase", ""])
            .args(args)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "gpg {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        output
    }

    /// Signer, user and admin GnuPG homes plus a scratch directory.
    struct GpgHomes {
        signer: TempDir,
        user: TempDir,
        admin: TempDir,
        scratch: TempDir,
    }

    impl GpgHomes {
        fn new() -> Self {
            Self {
                signer: tempfile::tempdir().unwrap(),
                user: tempfile::tempdir().unwrap(),
                admin: tempfile::tempdir().unwrap(),
                scratch: tempfile::tempdir().unwrap(),
            }
        }
    }

    impl Drop for GpgHomes {
        fn drop(&mut self) {
            for home in [&self.signer, &self.user, &self.admin] {
                let _ = Command::new("gpgconf")
                    .arg("--homedir")
                    .arg(home.path())
                    .args(["--kill", "gpg-agent"])
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status();
            }
        }
    }

    #[test]
    fn test_gpg_keyring_end_to_end() {
        if !gpg_available() {
            eprintln!("gpg not on PATH, skipping");
            return;
        }
        let homes = GpgHomes::new();
        let signer = homes.signer.path();
        gpg(
            signer,
            &["--quick-gen-key", "Alice <alice@host>", "ed25519", "sign", "never"],
        );

        let exported = homes.scratch.path().join("alice.asc");
        let public = gpg(signer, &["--armor", "--export", "alice@host"]).stdout;
        std::fs::write(&exported, public).unwrap();
        gpg(homes.user.path(), &["--import", exported.to_str().unwrap()]);

        let listing = gpg(signer, &["--with-colons", "--list-keys", "alice@host"]).stdout;
        let listing = String::from_utf8(listing).unwrap();
        let primary = Fingerprint::new(
            listing
                .lines()
                .find(|line| line.starts_with("fpr:"))
                .and_then(|line| line.split(':').nth(9))
                .unwrap(),
        );

        let (csr, _) = generate_csr("alice@host");
        let pem = csr.to_pem().unwrap();
        let request = homes.scratch.path().join("request.csr");
        let detached_path = homes.scratch.path().join("request.csr.sig");
        let clear_path = homes.scratch.path().join("request.csr.asc");
        std::fs::write(&request, &pem).unwrap();
        let request = request.to_str().unwrap();
        gpg(
            signer,
            &["--armor", "--detach-sign", "--output", detached_path.to_str().unwrap(), request],
        );
        gpg(
            signer,
            &["--clearsign", "--output", clear_path.to_str().unwrap(), request],
        );
        let detached = SignatureArtifact::from_bytes(std::fs::read(&detached_path).unwrap());
        let clearsigned = SignatureArtifact::from_bytes(std::fs::read(&clear_path).unwrap());
        assert!(matches!(detached, SignatureArtifact::Detached(_)));
        assert!(matches!(clearsigned, SignatureArtifact::Clearsigned(_)));

        let user = GpgKeyring::new("gpg", homes.user.path());
        let admin = GpgKeyring::new("gpg", homes.admin.path());
        let good = SignatureCheck::Good {
            fingerprint: primary.clone(),
        };
        assert_eq!(user.verify(&pem, &detached).unwrap(), good);
        assert_eq!(user.verify(&pem, &clearsigned).unwrap(), good);

        let mut tampered = pem.clone();
        tampered.extend_from_slice(b"extra\n");
        for artifact in [&detached, &clearsigned] {
            let check = user.verify(&tampered, artifact).unwrap();
            assert!(matches!(check, SignatureCheck::Bad { .. }), "{check:?}");
        }

        let check = admin.verify(&pem, &detached).unwrap();
        assert!(matches!(check, SignatureCheck::UnknownSigner { .. }), "{check:?}");

        assert!(user.contains(&primary).unwrap());
        assert_eq!(
            user.identity(&primary).unwrap().as_deref(),
            Some("Alice <alice@host>")
        );
        assert!(!admin.contains(&primary).unwrap());
        assert_eq!(admin.identity(&primary).unwrap(), None);

        let verifier = TrustVerifier::new(Keyrings::new(Arc::new(user), Arc::new(admin)));
        assert_eq!(
            verifier
                .verify(&pem, &detached, KeyringSelector::User)
                .unwrap(),
            primary
        );
        assert!(matches!(
            verifier.verify(&pem, &detached, KeyringSelector::Admin),
            Err(VerifyError::KeyNotFound(_))
        ));
    }
}
