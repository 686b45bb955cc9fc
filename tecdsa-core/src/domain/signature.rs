use crate::foundation::{Digest32, MemberId, OperatorError, Result};
use k256::ecdsa::{RecoveryId, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// A calculated threshold ECDSA signature.
///
/// `recovery_id` is the raw value in `{0, 1, 2, 3}`; chain-specific `v`
/// conventions (such as adding 27) are the submission layer's business.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Signature {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_id: u8,
}

impl Signature {
    /// Builds the signature from the underlying protocol output. Only the
    /// low 8 bits of the recovery byte are meaningful.
    pub fn from_protocol_output(r: [u8; 32], s: [u8; 32], recovery_byte: u8) -> Self {
        Self { r, s, recovery_id: recovery_byte & 0xff }
    }
}

/// Encodes an ECDSA public key as the chain expects it: 64 bytes, X‖Y,
/// each coordinate zero-padded to 32 bytes.
pub fn encode_public_key(key: &VerifyingKey) -> [u8; 64] {
    let point = key.to_encoded_point(false);
    let mut out = [0u8; 64];
    // Uncompressed SEC1 is 0x04 ‖ X ‖ Y.
    out.copy_from_slice(&point.as_bytes()[1..65]);
    out
}

/// Derives the 20-byte chain address bound to a public key:
/// the trailing 20 bytes of Keccak-256 over the raw X‖Y coordinates.
pub fn keccak_address(key: &VerifyingKey) -> [u8; 20] {
    let encoded = encode_public_key(key);
    let digest = Keccak256::digest(encoded);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[12..]);
    address
}

/// Member ids are the chain addresses of the operators' network keys.
pub fn member_id_for_public_key(sec1_bytes: &[u8]) -> Result<MemberId> {
    let key = VerifyingKey::from_sec1_bytes(sec1_bytes)
        .map_err(|err| OperatorError::Message(format!("invalid network public key: {}", err)))?;
    Ok(MemberId::new(keccak_address(&key).to_vec()))
}

/// Recovers the signer's chain address from a digest and signature.
pub fn recover_address(digest: &Digest32, signature: &Signature) -> Result<[u8; 20]> {
    let recovery_id = RecoveryId::from_byte(signature.recovery_id)
        .ok_or_else(|| OperatorError::Message(format!("invalid recovery id [{}]", signature.recovery_id)))?;
    let sig = k256::ecdsa::Signature::from_scalars(signature.r, signature.s)?;
    let key = VerifyingKey::recover_from_prehash(digest, &sig, recovery_id)?;
    Ok(keccak_address(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k256::ecdsa::SigningKey;
    use rand_core::OsRng;

    #[test]
    fn public_key_encoding_is_64_byte_xy() {
        let key = SigningKey::random(&mut OsRng);
        let encoded = encode_public_key(key.verifying_key());
        let point = key.verifying_key().to_encoded_point(false);
        assert_eq!(&encoded[..], &point.as_bytes()[1..]);
    }

    #[test]
    fn recover_address_matches_signer() {
        let key = SigningKey::random(&mut OsRng);
        let digest = [0x42u8; 32];
        let (sig, recovery_id) = key.sign_prehash_recoverable(&digest).expect("sign");
        let bytes = sig.to_bytes();
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[..32]);
        s.copy_from_slice(&bytes[32..]);

        let signature = Signature::from_protocol_output(r, s, recovery_id.to_byte());
        assert!(signature.recovery_id <= 3);
        let address = recover_address(&digest, &signature).expect("recover");
        assert_eq!(address, keccak_address(key.verifying_key()));
    }

    #[test]
    fn member_id_rejects_garbage_key() {
        assert!(member_id_for_public_key(&[1, 2, 3]).is_err());
    }
}
