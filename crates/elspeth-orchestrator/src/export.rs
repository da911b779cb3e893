// crates/elspeth-orchestrator/src/export.rs
// ============================================================================
// Module: ELSPETH Signed Export Manifest
// Description: HMAC-SHA256 signed export records and the final manifest
//              tying their signatures together (§6.4, §8.1 "Canonical
//              exporter manifest").
// ============================================================================

use hmac::Hmac;
use hmac::Mac;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;

use elspeth_core::hashing::canonical_json_bytes;

/// Errors raised building or signing an export.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// Signing was requested with no key configured. Always fatal
    /// (§6.4: "Signing without key is always a fatal configuration
    /// error").
    #[error("export signing is enabled but no signing key was configured")]
    MissingSigningKey,
    /// The HMAC implementation rejected the configured key (e.g. wrong
    /// length for the chosen algorithm).
    #[error("invalid export signing key: {0}")]
    InvalidKey(String),
    /// A row could not be canonicalized for signing.
    #[error("row could not be canonicalized for export: {0}")]
    Canonicalization(String),
}

/// One signed row record in a signed export (§6.4: "the exporter
/// yields, in order, a record per row").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedRecord {
    /// Canonical JSON bytes of the row this record carries.
    pub canonical_bytes: Vec<u8>,
    /// Lowercase-hex HMAC-SHA256 signature over `canonical_bytes`.
    pub signature: String,
}

/// The final record closing a signed export, binding every prior
/// record's signature together (§6.4, §8.1).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportManifest {
    /// Number of row records signed before this manifest.
    pub record_count: usize,
    /// SHA-256 of the concatenation of every record's signature, in
    /// emission order.
    pub final_hash: String,
}

/// Incrementally signs export rows and produces the closing manifest.
/// Construction fails immediately if signing is requested without a
/// key, so a misconfigured pipeline never starts a run it cannot
/// finish exporting (§6.4, §7 "Configuration errors: ... no partial
/// run begins").
pub struct SignedExporter {
    key: Vec<u8>,
    signatures: Vec<String>,
}

type HmacSha256 = Hmac<Sha256>;

impl SignedExporter {
    /// Builds an exporter bound to `key`.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::MissingSigningKey`] if `key` is empty,
    /// and [`ExportError::InvalidKey`] if the HMAC implementation
    /// rejects it.
    pub fn new(key: &[u8]) -> Result<Self, ExportError> {
        if key.is_empty() {
            return Err(ExportError::MissingSigningKey);
        }
        HmacSha256::new_from_slice(key).map_err(|err| ExportError::InvalidKey(err.to_string()))?;
        Ok(Self { key: key.to_vec(), signatures: Vec::new() })
    }

    /// Signs `row` and records its signature for the eventual
    /// manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ExportError::Canonicalization`] if `row` cannot be
    /// canonicalized.
    pub fn sign_row<T: Serialize>(&mut self, row: &T) -> Result<SignedRecord, ExportError> {
        let canonical_bytes =
            canonical_json_bytes(row).map_err(|err| ExportError::Canonicalization(err.to_string()))?;
        // The key was already validated in `new`; re-construction here
        // cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|err| unreachable!("key validated at construction: {err}"));
        mac.update(&canonical_bytes);
        let signature = hex::encode(mac.finalize().into_bytes());
        self.signatures.push(signature.clone());
        Ok(SignedRecord { canonical_bytes, signature })
    }

    /// Closes the export, producing the manifest record (§6.4,
    /// §8.1: `final_hash == SHA256(concat(signatures))`,
    /// `record_count == len(records)`).
    #[must_use]
    pub fn finish(self) -> ExportManifest {
        let mut hasher = Sha256::new();
        for signature in &self.signatures {
            hasher.update(signature.as_bytes());
        }
        ExportManifest {
            record_count: self.signatures.len(),
            final_hash: hex::encode(hasher.finalize()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "Test-only panic-based assertions are permitted.")]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_key_is_a_fatal_configuration_error() {
        assert_eq!(SignedExporter::new(&[]).unwrap_err(), ExportError::MissingSigningKey);
    }

    #[test]
    fn manifest_binds_record_count_and_final_hash_to_signatures() {
        let mut exporter = SignedExporter::new(b"test-signing-key").unwrap();
        let first = exporter.sign_row(&json!({"row": 1})).unwrap();
        let second = exporter.sign_row(&json!({"row": 2})).unwrap();
        let manifest = exporter.finish();

        assert_eq!(manifest.record_count, 2);
        let mut hasher = Sha256::new();
        hasher.update(first.signature.as_bytes());
        hasher.update(second.signature.as_bytes());
        assert_eq!(manifest.final_hash, hex::encode(hasher.finalize()));
    }

    #[test]
    fn signing_is_deterministic_for_identical_rows_and_keys() {
        let mut left = SignedExporter::new(b"same-key").unwrap();
        let mut right = SignedExporter::new(b"same-key").unwrap();
        let row = json!({"value": "stable"});
        assert_eq!(left.sign_row(&row).unwrap().signature, right.sign_row(&row).unwrap().signature);
    }

    #[test]
    fn different_keys_produce_different_signatures() {
        let mut left = SignedExporter::new(b"key-one").unwrap();
        let mut right = SignedExporter::new(b"key-two").unwrap();
        let row = json!({"value": "stable"});
        assert_ne!(left.sign_row(&row).unwrap().signature, right.sign_row(&row).unwrap().signature);
    }
}
