use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::pkcs8::DecodePublicKey;
use ed25519_dalek::{Signature, VerifyingKey};
use serde_json::Value;
use tracing::warn;

use crate::licensing::types::LicenseError;

/// Serialize a token the way the authority does before signing:
/// compact JSON, object keys sorted at every level.
pub fn canonical_bytes(token: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_canonical(token, &mut out);
    out.into_bytes()
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Parse a trusted key: PEM SPKI, or base64 of the raw 32 bytes
pub fn parse_public_key(contents: &str) -> Result<VerifyingKey, LicenseError> {
    let contents = contents.trim();
    if contents.starts_with("-----BEGIN") {
        return VerifyingKey::from_public_key_pem(contents)
            .map_err(|e| LicenseError::Config(format!("invalid PEM public key: {}", e)));
    }

    let bytes = BASE64
        .decode(contents)
        .map_err(|e| LicenseError::Config(format!("public key must be PEM or base64: {}", e)))?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| LicenseError::Config("public key must be 32 bytes".to_string()))?;
    VerifyingKey::from_bytes(&bytes)
        .map_err(|e| LicenseError::Config(format!("invalid public key material: {}", e)))
}

/// Strict check of `signature` over the canonical token
pub fn verify_with_key(token: &Value, signature: &str, key: &VerifyingKey) -> Result<(), LicenseError> {
    let bytes = BASE64
        .decode(signature.trim())
        .map_err(|_| LicenseError::SignatureInvalid)?;
    let signature = Signature::from_slice(&bytes).map_err(|_| LicenseError::SignatureInvalid)?;
    key.verify_strict(&canonical_bytes(token), &signature)
        .map_err(|_| LicenseError::SignatureInvalid)
}

/// Verifies license tokens against the trusted public key file.
///
/// The key file is read on every call so a key provisioned after boot is
/// picked up; a missing or unreadable key fails verification.
pub struct SignatureVerifier {
    key_path: PathBuf,
}

impl SignatureVerifier {
    pub fn new(key_path: impl Into<PathBuf>) -> Self {
        Self {
            key_path: key_path.into(),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    fn trusted_key(&self) -> Result<VerifyingKey, LicenseError> {
        let contents = std::fs::read_to_string(&self.key_path).map_err(|e| {
            LicenseError::Config(format!(
                "trusted key {} unreadable: {}",
                self.key_path.display(),
                e
            ))
        })?;
        parse_public_key(&contents)
    }

    /// True only when the signature checks out against the trusted key
    pub fn verify(&self, token: &Value, signature: &str) -> bool {
        let key = match self.trusted_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "signature check failed closed");
                return false;
            }
        };

        match verify_with_key(token, signature, &key) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "license token signature rejected");
                false
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use ed25519_dalek::pkcs8::spki::der::pem::LineEnding;
    use ed25519_dalek::pkcs8::EncodePublicKey;
    use serde_json::json;

    fn token() -> Value {
        json!({
            "ownerId": "op-1",
            "boundIdentity": "SN-123",
            "licenseType": "FULL",
            "features": { "insert_coin": true }
        })
    }

    #[test]
    fn test_canonical_form_sorts_keys() {
        let a = json!({ "b": 1, "a": { "d": [1, "x"], "c": null } });
        assert_eq!(
            String::from_utf8(canonical_bytes(&a)).unwrap(),
            r#"{"a":{"c":null,"d":[1,"x"]},"b":1}"#
        );
    }

    #[test]
    fn test_authority_signature_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = write_trusted_key(dir.path());
        let token = token();
        let signature = sign(&authority_key(), &token);
        assert!(verifier.verify(&token, &signature));
    }

    #[test]
    fn test_any_flipped_signature_bit_fails() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = write_trusted_key(dir.path());
        let token = token();
        let raw = BASE64.decode(sign(&authority_key(), &token)).unwrap();

        for bit in [0usize, 7, 100, 255, 256, 511] {
            let mut flipped = raw.clone();
            flipped[bit / 8] ^= 1 << (bit % 8);
            assert!(!verifier.verify(&token, &BASE64.encode(&flipped)), "bit {bit}");
        }
    }

    #[test]
    fn test_any_flipped_token_bit_fails() {
        let key = authority_key().verifying_key();
        let token = token();
        let signature = sign(&authority_key(), &token);
        let canonical = canonical_bytes(&token);

        for index in 0..canonical.len() {
            let mut flipped = canonical.clone();
            flipped[index] ^= 0x01;
            let Ok(tampered) = serde_json::from_slice::<Value>(&flipped) else {
                continue;
            };
            if tampered == token {
                continue;
            }
            assert!(verify_with_key(&tampered, &signature, &key).is_err(), "byte {index}");
        }
    }

    #[test]
    fn test_missing_key_file_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = SignatureVerifier::new(dir.path().join("absent.pem"));
        let token = token();
        assert!(!verifier.verify(&token, &sign(&authority_key(), &token)));
    }

    #[test]
    fn test_garbage_signature_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let verifier = write_trusted_key(dir.path());
        assert!(!verifier.verify(&token(), "not base64!"));
        assert!(!verifier.verify(&token(), ""));
    }

    #[test]
    fn test_pem_key_accepted() {
        let pem = authority_key()
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let key = parse_public_key(&pem).unwrap();
        assert_eq!(key, authority_key().verifying_key());
    }
}
