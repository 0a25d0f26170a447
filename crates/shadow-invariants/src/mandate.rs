//! Signed mandates binding a proposal to its declared diff

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use shadow_core::{ContentHash, MandateEnvelope, ProposalId, Scope};

use crate::error::InvariantConfigError;

/// Sign a mandate for `proposal_id` declaring `diff_hash`
#[must_use]
pub fn sign_mandate(
    proposal_id: ProposalId,
    diff_hash: ContentHash,
    scope: Scope,
    signing_key: &SigningKey,
) -> MandateEnvelope {
    let message = MandateEnvelope::signing_message(proposal_id, diff_hash, scope);
    let sig: Signature = signing_key.sign(&message);
    MandateEnvelope {
        proposal_id,
        diff_hash,
        scope,
        signature: hex::encode(sig.to_bytes()),
    }
}

/// Check the envelope signature
#[must_use]
pub fn verify_mandate(mandate: &MandateEnvelope, verifying_key: &VerifyingKey) -> bool {
    let Ok(bytes) = hex::decode(&mandate.signature) else {
        return false;
    };
    let Ok(sig) = Signature::from_slice(&bytes) else {
        return false;
    };
    verifying_key.verify(&mandate.message(), &sig).is_ok()
}

/// Parse a hex-encoded ed25519 public key
///
/// # Errors
/// Returns error if the string is not 32 hex-encoded bytes of a valid point
pub fn parse_verifying_key(hex_key: &str) -> Result<VerifyingKey, InvariantConfigError> {
    let bytes = hex::decode(hex_key.trim())
        .map_err(|e| InvariantConfigError::InvalidKey(e.to_string()))?;
    let arr: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| InvariantConfigError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
    VerifyingKey::from_bytes(&arr).map_err(|e| InvariantConfigError::InvalidKey(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_mandate_verifies() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let m = sign_mandate(ProposalId::new(), ContentHash::compute(b"diff"), Scope::Config, &key);
        assert!(verify_mandate(&m, &key.verifying_key()));

        let other = SigningKey::from_bytes(&[8u8; 32]);
        assert!(!verify_mandate(&m, &other.verifying_key()));
    }

    #[test]
    fn altered_scope_breaks_signature() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut m = sign_mandate(ProposalId::new(), ContentHash::compute(b"diff"), Scope::Config, &key);
        m.scope = Scope::Fundamental;
        assert!(!verify_mandate(&m, &key.verifying_key()));
    }

    #[test]
    fn verifying_key_round_trips_through_hex() {
        let key = SigningKey::from_bytes(&[3u8; 32]).verifying_key();
        let parsed = parse_verifying_key(&hex::encode(key.to_bytes())).unwrap();
        assert_eq!(parsed, key);
        assert!(parse_verifying_key("abcd").is_err());
        assert!(parse_verifying_key("not hex").is_err());
    }
}
