use crate::domain::group::GroupInfo;
use crate::domain::signature::encode_public_key;
use crate::foundation::{MemberId, OperatorError, Result};
use k256::ecdsa::VerifyingKey;
use serde::{Deserialize, Serialize};

/// One single-use presignature, precomputed during key generation.
///
/// Signing with it is a linear combination of shares, so a signature
/// session never multiplies secrets and never reconstructs the key or the
/// nonce. A presignature must never be used for two different digests:
/// nonce reuse reveals the private key to anyone holding both signatures.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Presignature {
    /// The nonce point `R`, SEC1-compressed; its x-coordinate is the
    /// signature's `r`.
    pub big_r: Vec<u8>,
    /// This member's share of the inverted nonce.
    pub k: [u8; 32],
    /// This member's share of the inverted nonce times the private key.
    pub sigma: [u8; 32],
}

/// Output of a completed distributed key generation, from this member's
/// perspective. The private share and presignature shares are the only
/// long-lived secrets the operator holds.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct KeygenOutput {
    /// This member's private share of the group key, as a scalar.
    pub share: [u8; 32],
    /// The group's public ECDSA point, SEC1-compressed.
    pub group_public_key: Vec<u8>,
    /// Dishonest threshold the key was generated under.
    pub dishonest_threshold: usize,
    /// Single-use presignatures; consumed in order by signing sessions.
    pub presignatures: Vec<Presignature>,
}

/// A signer that completed key generation for one keep. Persisted to stable
/// storage before the public key is ever published on-chain, and
/// re-persisted whenever presignatures are spent.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSigner {
    group: GroupInfo,
    keygen: KeygenOutput,
    presignatures_used: u64,
}

impl ThresholdSigner {
    pub fn new(group: GroupInfo, keygen: KeygenOutput) -> Self {
        Self { group, keygen, presignatures_used: 0 }
    }

    pub fn group(&self) -> &GroupInfo {
        &self.group
    }

    pub fn keygen_output(&self) -> &KeygenOutput {
        &self.keygen
    }

    pub fn member_id(&self) -> &MemberId {
        self.group.this_member()
    }

    pub fn group_id(&self) -> &str {
        self.group.group_id()
    }

    /// Index of this member's next unused presignature.
    pub fn presignatures_used(&self) -> u64 {
        self.presignatures_used
    }

    pub fn with_presignatures_used(mut self, next_unused: u64) -> Self {
        self.presignatures_used = self.presignatures_used.max(next_unused);
        self
    }

    /// The group's public key, which is also this signer's public key.
    pub fn public_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_sec1_bytes(&self.keygen.group_public_key)
            .map_err(|err| OperatorError::Message(format!("corrupt group public key: {}", err)))
    }

    /// The group public key in the chain's 64-byte X‖Y form.
    pub fn public_key_bytes(&self) -> Result<[u8; 64]> {
        Ok(encode_public_key(&self.public_key()?))
    }
}
