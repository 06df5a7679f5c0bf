//! Trust Verifier
//!
//! Turns a (request bytes, signature artifact, trust domain) triple into the
//! signer's fingerprint, or a typed refusal. The verifier is stateless apart
//! from the keyrings it holds and never falls back from one domain to the
//! other.

use crate::error::VerifyError;
use crate::keyring::{
    canonical_text, Fingerprint, KeyringSelector, Keyrings, SignatureArtifact, SignatureCheck,
};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct TrustVerifier {
    keyrings: Keyrings,
}

impl TrustVerifier {
    pub fn new(keyrings: Keyrings) -> Self {
        Self { keyrings }
    }

    pub fn keyrings(&self) -> &Keyrings {
        &self.keyrings
    }

    /// Verify `artifact` over exactly `request_bytes` against one keyring.
    ///
    /// # Errors
    /// - [`VerifyError::KeyNotFound`] when the signer is not a member of the
    ///   selected keyring, even if the signature is otherwise well formed
    /// - [`VerifyError::InvalidSignature`] when the signature is malformed,
    ///   does not verify, or a clearsigned message covers different content
    /// - [`VerifyError::Keyring`] when the keyring service itself fails
    pub fn verify(
        &self,
        request_bytes: &[u8],
        artifact: &SignatureArtifact,
        selector: KeyringSelector,
    ) -> Result<Fingerprint, VerifyError> {
        if let SignatureArtifact::Clearsigned(_) = artifact {
            check_cleartext_matches(request_bytes, artifact)?;
        }

        let keyring = self.keyrings.select(selector);
        let fingerprint = match keyring.verify(request_bytes, artifact)? {
            SignatureCheck::Good { fingerprint } => fingerprint,
            SignatureCheck::UnknownSigner { key_id } => {
                debug!(%selector, %key_id, "signer unknown to keyring");
                return Err(VerifyError::KeyNotFound(key_id));
            }
            SignatureCheck::Bad { key_id } => {
                warn!(%selector, %key_id, "signature does not verify over request");
                return Err(VerifyError::InvalidSignature(format!(
                    "signature by {} does not match the request",
                    key_id
                )));
            }
            SignatureCheck::Malformed { reason } => {
                return Err(VerifyError::InvalidSignature(reason));
            }
        };

        if !keyring.contains(&fingerprint)? {
            debug!(%selector, %fingerprint, "good signature from a non-member key");
            return Err(VerifyError::KeyNotFound(fingerprint.to_string()));
        }

        debug!(%selector, %fingerprint, "signature verified");
        Ok(fingerprint)
    }

    /// Read the artifact from `signature_path` and verify it.
    pub fn verify_file(
        &self,
        request_bytes: &[u8],
        signature_path: &Path,
        selector: KeyringSelector,
    ) -> Result<Fingerprint, VerifyError> {
        let artifact = SignatureArtifact::from_bytes(std::fs::read(signature_path)?);
        self.verify(request_bytes, &artifact, selector)
    }
}

fn check_cleartext_matches(
    request_bytes: &[u8],
    artifact: &SignatureArtifact,
) -> Result<(), VerifyError> {
    let cleartext = artifact.cleartext().ok_or_else(|| {
        VerifyError::InvalidSignature("clearsigned message has no signature block".to_string())
    })?;
    let request = std::str::from_utf8(request_bytes)
        .map_err(|_| VerifyError::InvalidSignature("request is not text".to_string()))?;
    if canonical_text(&cleartext) != canonical_text(request) {
        return Err(VerifyError::InvalidSignature(
            "clearsigned content differs from the request".to_string(),
        ));
    }
    Ok(())
}
