use crate::{hex_decode, hex_encode, FederationError};
use chrono::Utc;
use ed25519_dalek::pkcs8::{DecodePublicKey, EncodePublicKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use sha2::{Digest, Sha256};

/// The signed request envelope wrapping every inbound federation mutation.
///
/// `payload` stays raw: verification happens over exactly the bytes as
/// transmitted, never over a re-serialization.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub payload: Box<RawValue>,
    pub signature: String,
    pub sender_id: String,
    pub timestamp: chrono::DateTime<Utc>,
}

impl SignedEnvelope {
    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.get().as_bytes()
    }

    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, FederationError> {
        serde_json::from_str(self.payload.get())
            .map_err(|e| FederationError::Malformed(format!("invalid payload: {e}")))
    }

    pub fn to_json(&self) -> Result<String, FederationError> {
        serde_json::to_string(self)
            .map_err(|e| FederationError::Internal(format!("envelope serialization: {e}")))
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, FederationError> {
        serde_json::from_slice(raw)
            .map_err(|e| FederationError::Malformed(format!("invalid envelope: {e}")))
    }
}

/// Serialize `value` to JSON and sign those exact bytes.
pub fn sign_value<T: Serialize>(
    signing_key: &SigningKey,
    sender_id: &str,
    value: &T,
) -> Result<SignedEnvelope, FederationError> {
    let raw = serde_json::to_string(value)
        .map_err(|e| FederationError::Internal(format!("payload serialization: {e}")))?;
    let signature = signing_key.sign(raw.as_bytes());
    let payload = RawValue::from_string(raw)
        .map_err(|e| FederationError::Internal(format!("raw payload: {e}")))?;
    Ok(SignedEnvelope {
        payload,
        signature: hex_encode(&signature.to_bytes()),
        sender_id: sender_id.to_string(),
        timestamp: Utc::now(),
    })
}

/// Verify an Ed25519 signature over `payload` against a PKIX PEM public key.
/// Non-Ed25519 keys and malformed inputs verify as false.
pub fn verify_signature(public_key_pem: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_public_key_pem(public_key_pem) else {
        return false;
    };
    let Some(signature_bytes) = hex_decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    verifying_key.verify(payload, &signature).is_ok()
}

/// Hex SHA-256 of the key's DER (SubjectPublicKeyInfo) body.
pub fn key_fingerprint(public_key_pem: &str) -> Result<String, FederationError> {
    let verifying_key = VerifyingKey::from_public_key_pem(public_key_pem)
        .map_err(|e| FederationError::Malformed(format!("invalid public key pem: {e}")))?;
    let der = verifying_key
        .to_public_key_der()
        .map_err(|e| FederationError::Internal(format!("public key der: {e}")))?;
    let mut hasher = Sha256::new();
    hasher.update(der.as_bytes());
    Ok(hex_encode(&hasher.finalize()))
}

/// Generate a fresh instance keypair; the public half is PKIX PEM.
pub fn generate_keypair() -> Result<(SigningKey, String), FederationError> {
    let signing_key = SigningKey::generate(&mut rand::rngs::OsRng);
    let pem = public_key_pem(&signing_key)?;
    Ok((signing_key, pem))
}

pub fn public_key_pem(signing_key: &SigningKey) -> Result<String, FederationError> {
    signing_key
        .verifying_key()
        .to_public_key_pem(ed25519_dalek::pkcs8::spki::der::pem::LineEnding::LF)
        .map_err(|e| FederationError::Internal(format!("public key pem: {e}")))
}

/// Load a signing key from its 64-char hex secret form.
pub fn signing_key_from_hex(raw: &str) -> Option<SigningKey> {
    let bytes = hex_decode(raw.trim())?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;
    Some(SigningKey::from_bytes(&bytes))
}

pub fn signing_key_to_hex(key: &SigningKey) -> String {
    hex_encode(&key.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> (SigningKey, String) {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let pem = public_key_pem(&key).expect("pem");
        (key, pem)
    }

    #[test]
    fn sign_then_verify_round_trips() {
        let (key, pem) = test_key();
        let envelope =
            sign_value(&key, "01AAA", &serde_json::json!({"type": "MESSAGE_CREATE"})).expect("sign");
        assert!(verify_signature(
            &pem,
            envelope.payload_bytes(),
            &envelope.signature
        ));
    }

    #[test]
    fn flipping_any_byte_breaks_verification() {
        let (key, pem) = test_key();
        let envelope = sign_value(&key, "01AAA", &serde_json::json!({"n": 42})).expect("sign");

        let mut tampered = envelope.payload_bytes().to_vec();
        tampered[2] ^= 0x01;
        assert!(!verify_signature(&pem, &tampered, &envelope.signature));

        let mut bad_sig = envelope.signature.clone();
        let flipped = if bad_sig.ends_with('0') { "1" } else { "0" };
        bad_sig.replace_range(bad_sig.len() - 1.., flipped);
        assert!(!verify_signature(&pem, envelope.payload_bytes(), &bad_sig));
    }

    #[test]
    fn envelope_survives_wire_round_trip_byte_exact() {
        let (key, pem) = test_key();
        // Key order below is deliberately not alphabetical; the raw payload
        // must come back byte-identical regardless.
        let envelope = sign_value(
            &key,
            "01AAA",
            &serde_json::json!({"zeta": 1, "alpha": {"nested": [1, 2, 3]}}),
        )
        .expect("sign");
        let wire = envelope.to_json().expect("encode");
        let parsed = SignedEnvelope::from_json(wire.as_bytes()).expect("decode");
        assert_eq!(parsed.payload.get(), envelope.payload.get());
        assert!(verify_signature(
            &pem,
            parsed.payload_bytes(),
            &parsed.signature
        ));
    }

    #[test]
    fn fingerprint_is_stable_and_key_dependent() {
        let (_, pem_a) = test_key();
        let key_b = SigningKey::from_bytes(&[9u8; 32]);
        let pem_b = public_key_pem(&key_b).expect("pem");

        let fp_a1 = key_fingerprint(&pem_a).expect("fp");
        let fp_a2 = key_fingerprint(&pem_a).expect("fp");
        let fp_b = key_fingerprint(&pem_b).expect("fp");
        assert_eq!(fp_a1, fp_a2);
        assert_ne!(fp_a1, fp_b);
        assert_eq!(fp_a1.len(), 64);
    }

    #[test]
    fn rejects_non_ed25519_pem() {
        // A P-256 SubjectPublicKeyInfo; parsing must fail, verification must
        // come back false rather than panic.
        let p256_pem = "-----BEGIN PUBLIC KEY-----\n\
MFkwEwYHKoZIzj0CAQYIKoZIzj0DAQcDQgAE6K5c+qLJYCh0ShHs1766GcHDHaWZ\n\
n+3PHpHhUC+cbA69urwvCSWkdSMYXvCTJHCIN1f2RIDugkpGbTAYEiFbIQ==\n\
-----END PUBLIC KEY-----\n";
        assert!(!verify_signature(p256_pem, b"payload", "00"));
        assert!(key_fingerprint(p256_pem).is_err());
    }

    #[test]
    fn signing_key_hex_round_trip() {
        let (key, _) = test_key();
        let hex = signing_key_to_hex(&key);
        let restored = signing_key_from_hex(&hex).expect("restore");
        assert_eq!(restored.to_bytes(), key.to_bytes());
        assert!(signing_key_from_hex("abc").is_none());
    }
}
