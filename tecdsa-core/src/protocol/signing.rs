use crate::domain::ThresholdSigner;
use crate::foundation::{Digest32, MemberId, OperatorError, Result};
use crate::protocol::keygen::{decode_point, decode_scalar};
use crate::protocol::{generate_party_indices, interpolate_at_zero, Outgoing, ProtocolMachine, Step};
use k256::ecdsa::{RecoveryId, VerifyingKey};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::Field;
use k256::{FieldBytes, Scalar, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
enum SigningMessage {
    /// The sender's partial signature for the named presignature:
    /// `m*k_i + r*sigma_i`, a threshold share of the final `s`.
    Partial { presignature: u64, value: [u8; 32] },
}

/// The calculated signature in raw protocol form. The recovery byte carries
/// the recovery id in its low 8 bits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SigningOutput {
    pub r: [u8; 32],
    pub s: [u8; 32],
    pub recovery_byte: u8,
}

/// One participant of a signature calculation.
///
/// Signing spends one precomputed presignature and is purely linear: every
/// participant broadcasts `m*k_i + r*sigma_i` over its inverted-nonce and
/// key-times-inverted-nonce shares, and any `t+1` partials interpolate to
/// the final `s`. No share, key, or nonce is ever exchanged or
/// reconstructed. A corrupt partial surfaces when the combined signature
/// fails to verify against the group key.
#[derive(Debug)]
pub struct SigningMachine {
    me: MemberId,
    digest: Digest32,
    indices: Vec<(MemberId, Scalar)>,
    group_public_key: VerifyingKey,
    required: usize,
    presignature_index: u64,
    r: Scalar,
    partials: BTreeMap<MemberId, Scalar>,
}

impl SigningMachine {
    /// Builds a signing participant from a completed signer and the index
    /// of the presignature this session agreed to spend.
    pub fn new(signer: &ThresholdSigner, presignature_index: usize, digest: Digest32) -> Result<Self> {
        let keygen = signer.keygen_output();
        let presignature = keygen.presignatures.get(presignature_index).ok_or_else(|| {
            OperatorError::protocol(
                "signing",
                format!(
                    "presignature [{}] out of range ([{}] available)",
                    presignature_index,
                    keygen.presignatures.len()
                ),
            )
        })?;

        let indices = generate_party_indices(signer.group())?;
        let group_public_key = signer.public_key()?;

        let big_r = decode_point(&presignature.big_r)?;
        let r_bytes: [u8; 32] = big_r.to_affine().to_encoded_point(false).as_bytes()[1..33]
            .try_into()
            .map_err(|_| OperatorError::protocol("signing", "malformed nonce point"))?;
        let r = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(r_bytes));
        if bool::from(r.is_zero()) {
            return Err(OperatorError::protocol("signing", "degenerate nonce point"));
        }

        let message = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest));
        let k_share = decode_scalar(&presignature.k)?;
        let sigma_share = decode_scalar(&presignature.sigma)?;
        let own_partial = message * k_share + r * sigma_share;

        let mut partials = BTreeMap::new();
        partials.insert(signer.group().this_member().clone(), own_partial);

        Ok(Self {
            me: signer.group().this_member().clone(),
            digest,
            indices,
            group_public_key,
            required: keygen.dishonest_threshold + 1,
            presignature_index: presignature_index as u64,
            r,
            partials,
        })
    }

    fn index_of(&self, member: &MemberId) -> Option<Scalar> {
        self.indices.iter().find(|(id, _)| id == member).map(|(_, scalar)| *scalar)
    }

    fn step(&mut self, outgoing: Vec<Outgoing>) -> Result<Step<SigningOutput>> {
        if self.partials.len() < self.required {
            return Ok(Step::Continue(outgoing));
        }
        self.finish().map(Step::Finished)
    }

    fn finish(&self) -> Result<SigningOutput> {
        let points: Vec<(Scalar, Scalar)> = self
            .partials
            .iter()
            .map(|(member, value)| {
                let index = self.index_of(member).ok_or_else(|| {
                    OperatorError::protocol("signing", format!("no party index for [{}]", member))
                })?;
                Ok((index, *value))
            })
            .collect::<Result<_>>()?;
        let s = interpolate_at_zero(&points)?;
        if bool::from(s.is_zero()) {
            return Err(OperatorError::protocol("signing", "degenerate signature"));
        }

        let r_bytes: [u8; 32] = self.r.to_bytes().into();
        let s_bytes: [u8; 32] = s.to_bytes().into();
        let mut signature = k256::ecdsa::Signature::from_scalars(r_bytes, s_bytes)
            .map_err(|err| OperatorError::protocol("signing", format!("malformed signature: {}", err)))?;
        if let Some(normalized) = signature.normalize_s() {
            signature = normalized;
        }

        for byte in 0u8..=3 {
            let Some(recovery_id) = RecoveryId::from_byte(byte) else { continue };
            let Ok(recovered) = VerifyingKey::recover_from_prehash(&self.digest, &signature, recovery_id)
            else {
                continue;
            };
            if recovered == self.group_public_key {
                let bytes = signature.to_bytes();
                let mut r = [0u8; 32];
                let mut s = [0u8; 32];
                r.copy_from_slice(&bytes[..32]);
                s.copy_from_slice(&bytes[32..]);
                return Ok(SigningOutput { r, s, recovery_byte: byte });
            }
        }
        Err(OperatorError::protocol(
            "signing",
            "calculated signature failed to verify against the group key",
        ))
    }
}

impl ProtocolMachine for SigningMachine {
    type Output = SigningOutput;

    fn start(&mut self) -> Result<Step<SigningOutput>> {
        let own = *self
            .partials
            .get(&self.me)
            .ok_or_else(|| OperatorError::protocol("signing", "own partial signature missing"))?;
        let payload = bincode::serialize(&SigningMessage::Partial {
            presignature: self.presignature_index,
            value: own.to_bytes().into(),
        })?;
        self.step(vec![Outgoing::broadcast(payload)])
    }

    fn advance(&mut self, from: &MemberId, payload: &[u8], is_broadcast: bool) -> Result<Step<SigningOutput>> {
        if from == &self.me {
            return self.step(Vec::new());
        }
        if self.index_of(from).is_none() {
            return Err(OperatorError::protocol("signing", format!("message from non-member [{}]", from)));
        }
        if !is_broadcast {
            return Err(OperatorError::protocol("signing", "partial signatures must be broadcast"));
        }

        let SigningMessage::Partial { presignature, value } = bincode::deserialize(payload)
            .map_err(|err| OperatorError::protocol("signing", format!("malformed round message: {}", err)))?;
        if presignature != self.presignature_index {
            return Err(OperatorError::protocol(
                "signing",
                format!(
                    "presignature mismatch: session agreed on [{}], [{}] sent [{}]",
                    self.presignature_index, from, presignature
                ),
            ));
        }

        let partial = decode_scalar(&value)?;
        if let Some(existing) = self.partials.get(from) {
            if *existing != partial {
                return Err(OperatorError::protocol(
                    "signing",
                    format!("conflicting partial signatures from [{}]", from),
                ));
            }
            return self.step(Vec::new());
        }
        self.partials.insert(from.clone(), partial);
        self.step(Vec::new())
    }
}
