use crate::domain::{GroupInfo, KeygenOutput, Presignature};
use crate::foundation::{MemberId, OperatorError, Result};
use crate::protocol::{
    generate_party_indices, interpolate_at_zero, lagrange_coefficients_at_zero, Outgoing, PreParams,
    ProtocolMachine, Step,
};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::elliptic_curve::{Group, PrimeField};
use k256::{AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint, Scalar, U256};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const COEFFICIENT_DOMAIN: &[u8] = b"tecdsa/keygen/coefficients/v2";

/// Presignatures generated alongside every key. Each signing session spends
/// one; an exhausted pool fails further signing requests for the keep.
const PRESIGNATURE_POOL: usize = 16;

#[derive(Debug, Eq, PartialEq, Serialize, Deserialize)]
struct PresignatureShares {
    /// Evaluation of the sender's nonce polynomial at the receiver's index.
    nonce: [u8; 32],
    /// Evaluation of the sender's masking polynomial.
    mask: [u8; 32],
    /// Evaluation of the sender's zero polynomial (degree `2t`, zero
    /// constant term) that blinds the opened nonce product.
    zero: [u8; 32],
}

#[derive(Debug, Serialize, Deserialize)]
enum KeygenMessage {
    /// Round 1, broadcast: Feldman commitments to the sender's key
    /// polynomial and to its per-presignature nonce polynomials.
    Commitments { key_points: Vec<Vec<u8>>, nonce_points: Vec<Vec<Vec<u8>>> },
    /// Round 2, point-to-point: the sender's key polynomial evaluated at
    /// the receiver's index, plus per-presignature nonce material.
    Shares { key: [u8; 32], presignatures: Vec<PresignatureShares> },
    /// Round 3, broadcast: the sender's blinded nonce-product points, one
    /// per presignature. Interpolating all of them opens `k*a` publicly.
    ProductOpenings { values: Vec<[u8; 32]> },
    /// Round 4, point-to-point: degree-reduction sub-shares that turn the
    /// pointwise `x*k^-1` products back into a threshold sharing.
    ReduceShares { values: Vec<[u8; 32]> },
}

#[derive(Debug)]
struct PresigShare {
    nonce: Scalar,
    mask: Scalar,
    zero: Scalar,
}

/// One participant of the distributed key generation.
///
/// Dealer-free Shamir sharing with committed coefficients: every member
/// broadcasts commitments to a random degree-`t` polynomial, then sends each
/// peer its evaluation point privately; the group key is the sum of all
/// constant-term commitments, and no participant ever learns it.
///
/// The same run precomputes a pool of single-use presignatures. For each
/// one the group shares a nonce `k` and a blinding value `a` (degree `t`),
/// publicly opens the blinded product `v = k*a` from its degree-`2t`
/// pointwise shares, derives shares of `k^-1 = a*v^-1`, and degree-reduces the
/// pointwise `x*k^-1` products through fresh sub-sharings. Signing is then a
/// linear combination, so any `t+1` members can sign while neither the key
/// nor any nonce is ever reconstructed. Opening degree-`2t` products
/// requires an honest majority: the group must satisfy `n >= 2t+1`.
#[derive(Debug)]
pub struct KeygenMachine {
    group: GroupInfo,
    indices: Vec<(MemberId, Scalar)>,
    threshold: usize,

    key_poly: Vec<Scalar>,
    nonce_polys: Vec<Vec<Scalar>>,
    mask_polys: Vec<Vec<Scalar>>,
    zero_polys: Vec<Vec<Scalar>>,
    reduce_tails: Vec<Vec<Scalar>>,

    key_commitments: BTreeMap<MemberId, Vec<ProjectivePoint>>,
    nonce_commitments: BTreeMap<MemberId, Vec<Vec<ProjectivePoint>>>,
    key_shares: BTreeMap<MemberId, Scalar>,
    presig_shares: BTreeMap<MemberId, Vec<PresigShare>>,
    pending_shares: BTreeMap<MemberId, (Scalar, Vec<PresigShare>)>,
    openings: BTreeMap<MemberId, Vec<Scalar>>,
    reduce_shares: BTreeMap<MemberId, Vec<Scalar>>,

    my_nonce_shares: Vec<Scalar>,
    my_mask_shares: Vec<Scalar>,
    nonce_inverse_shares: Vec<Scalar>,

    shares_sent: bool,
    openings_sent: bool,
    reduces_sent: bool,
}

impl KeygenMachine {
    pub fn new(group: &GroupInfo, pre_params: &PreParams) -> Result<Self> {
        let indices = generate_party_indices(group)?;
        let threshold = group.dishonest_threshold();
        if indices.len() < 2 * threshold + 1 {
            return Err(OperatorError::InvalidGroup(format!(
                "group size [{}], should be at least [{}] for dishonest threshold [{}]",
                indices.len(),
                2 * threshold + 1,
                threshold
            )));
        }

        let mut source = CoefficientSource::new(pre_params, group);
        let key_poly = source.polynomial(threshold + 1);
        let mut nonce_polys = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut mask_polys = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut zero_polys = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut reduce_tails = Vec::with_capacity(PRESIGNATURE_POOL);
        for _ in 0..PRESIGNATURE_POOL {
            nonce_polys.push(source.polynomial(threshold + 1));
            mask_polys.push(source.polynomial(threshold + 1));
            let mut zero = vec![Scalar::ZERO];
            zero.extend(source.polynomial(2 * threshold));
            zero_polys.push(zero);
            reduce_tails.push(source.polynomial(threshold));
        }

        Ok(Self {
            group: group.clone(),
            indices,
            threshold,
            key_poly,
            nonce_polys,
            mask_polys,
            zero_polys,
            reduce_tails,
            key_commitments: BTreeMap::new(),
            nonce_commitments: BTreeMap::new(),
            key_shares: BTreeMap::new(),
            presig_shares: BTreeMap::new(),
            pending_shares: BTreeMap::new(),
            openings: BTreeMap::new(),
            reduce_shares: BTreeMap::new(),
            my_nonce_shares: Vec::new(),
            my_mask_shares: Vec::new(),
            nonce_inverse_shares: Vec::new(),
            shares_sent: false,
            openings_sent: false,
            reduces_sent: false,
        })
    }

    fn me(&self) -> &MemberId {
        self.group.this_member()
    }

    fn group_size(&self) -> usize {
        self.indices.len()
    }

    fn index_of(&self, member: &MemberId) -> Option<Scalar> {
        self.indices.iter().find(|(id, _)| id == member).map(|(_, scalar)| *scalar)
    }

    fn my_index(&self) -> Result<Scalar> {
        self.index_of(&self.me().clone())
            .ok_or_else(|| OperatorError::protocol("keygen", "own party index missing"))
    }

    fn commit(poly: &[Scalar]) -> Vec<ProjectivePoint> {
        poly.iter().map(|c| ProjectivePoint::GENERATOR * c).collect()
    }

    /// Runs every round whose inputs are complete. Rounds cascade: in a
    /// single-member group the whole pipeline completes inside `start`.
    fn pump(&mut self) -> Result<Vec<Outgoing>> {
        let mut outgoing = Vec::new();
        loop {
            let before = (self.shares_sent, self.openings_sent, self.reduces_sent);

            if !self.shares_sent && self.key_commitments.len() == self.group_size() {
                outgoing.extend(self.release_shares()?);
            }
            if !self.openings_sent
                && self.shares_sent
                && self.key_shares.len() == self.group_size()
                && self.presig_shares.len() == self.group_size()
            {
                outgoing.extend(self.release_openings()?);
            }
            if !self.reduces_sent && self.openings_sent && self.openings.len() == self.group_size() {
                outgoing.extend(self.release_reduce_shares()?);
            }

            if before == (self.shares_sent, self.openings_sent, self.reduces_sent) {
                return Ok(outgoing);
            }
        }
    }

    /// Round 2: evaluation points of the key, nonce, mask, and zero
    /// polynomials, one bundle per peer.
    fn release_shares(&mut self) -> Result<Vec<Outgoing>> {
        let mut outgoing = Vec::new();
        let me = self.me().clone();
        for (member, index) in self.indices.clone() {
            let key = horner_scalar(&self.key_poly, &index);
            let presignatures: Vec<PresigShare> = (0..PRESIGNATURE_POOL)
                .map(|l| PresigShare {
                    nonce: horner_scalar(&self.nonce_polys[l], &index),
                    mask: horner_scalar(&self.mask_polys[l], &index),
                    zero: horner_scalar(&self.zero_polys[l], &index),
                })
                .collect();

            if member == me {
                self.accept_shares(&me, key, presignatures)?;
            } else {
                let wire: Vec<PresignatureShares> = presignatures
                    .iter()
                    .map(|share| PresignatureShares {
                        nonce: share.nonce.to_bytes().into(),
                        mask: share.mask.to_bytes().into(),
                        zero: share.zero.to_bytes().into(),
                    })
                    .collect();
                let payload = encode_message(&KeygenMessage::Shares {
                    key: key.to_bytes().into(),
                    presignatures: wire,
                })?;
                outgoing.push(Outgoing::unicast(member, payload));
            }
        }
        self.shares_sent = true;
        Ok(outgoing)
    }

    /// Round 3: aggregate the received nonce material and broadcast this
    /// member's blinded nonce-product points.
    fn release_openings(&mut self) -> Result<Vec<Outgoing>> {
        let mut nonce_shares = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut mask_shares = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut values = Vec::with_capacity(PRESIGNATURE_POOL);
        for l in 0..PRESIGNATURE_POOL {
            let mut nonce = Scalar::ZERO;
            let mut mask = Scalar::ZERO;
            let mut zero = Scalar::ZERO;
            for shares in self.presig_shares.values() {
                nonce += shares[l].nonce;
                mask += shares[l].mask;
                zero += shares[l].zero;
            }
            values.push(nonce * mask + zero);
            nonce_shares.push(nonce);
            mask_shares.push(mask);
        }

        self.my_nonce_shares = nonce_shares;
        self.my_mask_shares = mask_shares;
        self.openings.insert(self.me().clone(), values.clone());
        self.openings_sent = true;

        let wire: Vec<[u8; 32]> = values.iter().map(|v| v.to_bytes().into()).collect();
        Ok(vec![Outgoing::broadcast(encode_message(&KeygenMessage::ProductOpenings { values: wire })?)])
    }

    /// Round 4: open each `v = k*a`, derive this member's inverted-nonce
    /// share `a*v^-1`, and sub-share the pointwise `x*k^-1` product for
    /// degree reduction.
    fn release_reduce_shares(&mut self) -> Result<Vec<Outgoing>> {
        let x_share = self.key_shares.values().fold(Scalar::ZERO, |acc, s| acc + s);

        let mut inverse_shares = Vec::with_capacity(PRESIGNATURE_POOL);
        let mut reduce_polys = Vec::with_capacity(PRESIGNATURE_POOL);
        for l in 0..PRESIGNATURE_POOL {
            let points: Vec<(Scalar, Scalar)> = self
                .indices
                .iter()
                .map(|(member, index)| {
                    let opening = self.openings.get(member).map(|values| values[l]).ok_or_else(|| {
                        OperatorError::protocol("keygen", format!("missing product opening from [{}]", member))
                    })?;
                    Ok((*index, opening))
                })
                .collect::<Result<_>>()?;
            let product = interpolate_at_zero(&points)?;
            let inverted = Option::<Scalar>::from(product.invert())
                .ok_or_else(|| OperatorError::protocol("keygen", "degenerate nonce product"))?;
            let inverse_share = self.my_mask_shares[l] * inverted;
            inverse_shares.push(inverse_share);

            let mut poly = vec![x_share * inverse_share];
            poly.extend(self.reduce_tails[l].iter().copied());
            reduce_polys.push(poly);
        }
        self.nonce_inverse_shares = inverse_shares;

        let mut outgoing = Vec::new();
        let me = self.me().clone();
        for (member, index) in self.indices.clone() {
            let values: Vec<Scalar> = reduce_polys.iter().map(|poly| horner_scalar(poly, &index)).collect();
            if member == me {
                self.reduce_shares.insert(me.clone(), values);
            } else {
                let wire: Vec<[u8; 32]> = values.iter().map(|v| v.to_bytes().into()).collect();
                outgoing
                    .push(Outgoing::unicast(member, encode_message(&KeygenMessage::ReduceShares { values: wire })?));
            }
        }
        self.reduces_sent = true;
        Ok(outgoing)
    }

    fn accept_shares(&mut self, from: &MemberId, key: Scalar, presignatures: Vec<PresigShare>) -> Result<()> {
        let my_index = self.my_index()?;

        let key_commitments = self
            .key_commitments
            .get(from)
            .ok_or_else(|| OperatorError::protocol("keygen", format!("no commitments from [{}]", from)))?;
        if ProjectivePoint::GENERATOR * key != horner_point(key_commitments, &my_index) {
            return Err(OperatorError::protocol(
                "keygen",
                format!("key share from [{}] does not match its commitments", from),
            ));
        }

        let nonce_commitments = self
            .nonce_commitments
            .get(from)
            .ok_or_else(|| OperatorError::protocol("keygen", format!("no nonce commitments from [{}]", from)))?;
        for (l, share) in presignatures.iter().enumerate() {
            if ProjectivePoint::GENERATOR * share.nonce != horner_point(&nonce_commitments[l], &my_index) {
                return Err(OperatorError::protocol(
                    "keygen",
                    format!("nonce share [{}] from [{}] does not match its commitments", l, from),
                ));
            }
        }

        self.key_shares.insert(from.clone(), key);
        self.presig_shares.insert(from.clone(), presignatures);
        Ok(())
    }

    fn drain_pending(&mut self) -> Result<()> {
        let verifiable: Vec<MemberId> =
            self.pending_shares.keys().filter(|id| self.key_commitments.contains_key(*id)).cloned().collect();
        for member in verifiable {
            if let Some((key, presignatures)) = self.pending_shares.remove(&member) {
                self.accept_shares(&member, key, presignatures)?;
            }
        }
        Ok(())
    }

    fn step(&mut self, outgoing: Vec<Outgoing>) -> Result<Step<KeygenOutput>> {
        let n = self.group_size();
        let complete = self.key_commitments.len() == n
            && self.key_shares.len() == n
            && self.openings.len() == n
            && self.reduce_shares.len() == n;
        if !complete {
            return Ok(Step::Continue(outgoing));
        }

        let share = self.key_shares.values().fold(Scalar::ZERO, |acc, s| acc + s);
        let group_point = self
            .key_commitments
            .values()
            .fold(ProjectivePoint::IDENTITY, |acc, commitments| acc + commitments[0]);
        if bool::from(group_point.is_identity()) {
            return Err(OperatorError::protocol("keygen", "group public key degenerated to identity"));
        }

        let index_scalars: Vec<Scalar> = self.indices.iter().map(|(_, index)| *index).collect();
        let lambdas = lagrange_coefficients_at_zero(&index_scalars)?;

        let mut presignatures = Vec::with_capacity(PRESIGNATURE_POOL);
        for l in 0..PRESIGNATURE_POOL {
            let big_r = self
                .nonce_commitments
                .values()
                .fold(ProjectivePoint::IDENTITY, |acc, commitments| acc + commitments[l][0]);
            if bool::from(big_r.is_identity()) {
                return Err(OperatorError::protocol("keygen", "nonce point degenerated to identity"));
            }

            let mut sigma = Scalar::ZERO;
            for ((member, _), lambda) in self.indices.iter().zip(&lambdas) {
                let value = self.reduce_shares.get(member).map(|values| values[l]).ok_or_else(|| {
                    OperatorError::protocol("keygen", format!("missing reduction share from [{}]", member))
                })?;
                sigma += *lambda * value;
            }

            presignatures.push(Presignature {
                big_r: encode_point(&big_r),
                k: self.nonce_inverse_shares[l].to_bytes().into(),
                sigma: sigma.to_bytes().into(),
            });
        }

        Ok(Step::Finished(KeygenOutput {
            share: share.to_bytes().into(),
            group_public_key: encode_point(&group_point),
            dishonest_threshold: self.threshold,
            presignatures,
        }))
    }
}

impl ProtocolMachine for KeygenMachine {
    type Output = KeygenOutput;

    fn start(&mut self) -> Result<Step<KeygenOutput>> {
        self.key_commitments.insert(self.me().clone(), Self::commit(&self.key_poly));
        let nonce_commitments: Vec<Vec<ProjectivePoint>> =
            self.nonce_polys.iter().map(|poly| Self::commit(poly)).collect();
        self.nonce_commitments.insert(self.me().clone(), nonce_commitments.clone());

        let key_points = Self::commit(&self.key_poly).iter().map(encode_point).collect();
        let nonce_points = nonce_commitments
            .iter()
            .map(|commitments| commitments.iter().map(encode_point).collect())
            .collect();
        let mut outgoing =
            vec![Outgoing::broadcast(encode_message(&KeygenMessage::Commitments { key_points, nonce_points })?)];
        outgoing.extend(self.pump()?);
        self.step(outgoing)
    }

    fn advance(&mut self, from: &MemberId, payload: &[u8], is_broadcast: bool) -> Result<Step<KeygenOutput>> {
        if from == self.me() {
            return self.step(Vec::new());
        }
        if self.index_of(from).is_none() {
            return Err(OperatorError::protocol("keygen", format!("message from non-member [{}]", from)));
        }

        match decode_message(payload)? {
            KeygenMessage::Commitments { key_points, nonce_points } => {
                if !is_broadcast {
                    return Err(OperatorError::protocol("keygen", "commitments must be broadcast"));
                }
                if key_points.len() != self.threshold + 1 || nonce_points.len() != PRESIGNATURE_POOL {
                    return Err(OperatorError::protocol(
                        "keygen",
                        format!("malformed commitments from [{}]", from),
                    ));
                }
                let key: Vec<ProjectivePoint> =
                    key_points.iter().map(|bytes| decode_point(bytes)).collect::<Result<_>>()?;
                let mut nonces = Vec::with_capacity(PRESIGNATURE_POOL);
                for points in &nonce_points {
                    if points.len() != self.threshold + 1 {
                        return Err(OperatorError::protocol(
                            "keygen",
                            format!("malformed nonce commitments from [{}]", from),
                        ));
                    }
                    nonces.push(points.iter().map(|bytes| decode_point(bytes)).collect::<Result<_>>()?);
                }

                if let Some(existing) = self.key_commitments.get(from) {
                    let same_nonces = self.nonce_commitments.get(from) == Some(&nonces);
                    if *existing != key || !same_nonces {
                        return Err(OperatorError::protocol(
                            "keygen",
                            format!("conflicting commitments from [{}]", from),
                        ));
                    }
                    return self.step(Vec::new());
                }
                self.key_commitments.insert(from.clone(), key);
                self.nonce_commitments.insert(from.clone(), nonces);

                self.drain_pending()?;
                let outgoing = self.pump()?;
                self.step(outgoing)
            }
            KeygenMessage::Shares { key, presignatures } => {
                if is_broadcast {
                    return Err(OperatorError::protocol("keygen", "shares must not be broadcast"));
                }
                if presignatures.len() != PRESIGNATURE_POOL {
                    return Err(OperatorError::protocol(
                        "keygen",
                        format!("malformed shares from [{}]", from),
                    ));
                }
                if self.key_shares.contains_key(from) || self.pending_shares.contains_key(from) {
                    return self.step(Vec::new());
                }

                let key = decode_scalar(&key)?;
                let decoded: Vec<PresigShare> = presignatures
                    .iter()
                    .map(|share| {
                        Ok(PresigShare {
                            nonce: decode_scalar(&share.nonce)?,
                            mask: decode_scalar(&share.mask)?,
                            zero: decode_scalar(&share.zero)?,
                        })
                    })
                    .collect::<Result<_>>()?;

                if self.key_commitments.contains_key(from) {
                    self.accept_shares(from, key, decoded)?;
                } else {
                    self.pending_shares.insert(from.clone(), (key, decoded));
                }
                let outgoing = self.pump()?;
                self.step(outgoing)
            }
            KeygenMessage::ProductOpenings { values } => {
                if !is_broadcast {
                    return Err(OperatorError::protocol("keygen", "product openings must be broadcast"));
                }
                if values.len() != PRESIGNATURE_POOL {
                    return Err(OperatorError::protocol(
                        "keygen",
                        format!("malformed product openings from [{}]", from),
                    ));
                }
                let decoded: Vec<Scalar> = values.iter().map(decode_scalar).collect::<Result<_>>()?;
                if let Some(existing) = self.openings.get(from) {
                    if *existing != decoded {
                        return Err(OperatorError::protocol(
                            "keygen",
                            format!("conflicting product openings from [{}]", from),
                        ));
                    }
                    return self.step(Vec::new());
                }
                self.openings.insert(from.clone(), decoded);
                let outgoing = self.pump()?;
                self.step(outgoing)
            }
            KeygenMessage::ReduceShares { values } => {
                if is_broadcast {
                    return Err(OperatorError::protocol("keygen", "reduction shares must not be broadcast"));
                }
                if values.len() != PRESIGNATURE_POOL {
                    return Err(OperatorError::protocol(
                        "keygen",
                        format!("malformed reduction shares from [{}]", from),
                    ));
                }
                let decoded: Vec<Scalar> = values.iter().map(decode_scalar).collect::<Result<_>>()?;
                if self.reduce_shares.contains_key(from) {
                    return self.step(Vec::new());
                }
                self.reduce_shares.insert(from.clone(), decoded);
                let outgoing = self.pump()?;
                self.step(outgoing)
            }
        }
    }
}

/// Deterministic per-member coefficient stream, seeded by the pre-parameter
/// entropy, the group id, and the member id.
struct CoefficientSource {
    reader: blake3::OutputReader,
}

impl CoefficientSource {
    fn new(pre_params: &PreParams, group: &GroupInfo) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(COEFFICIENT_DOMAIN);
        hasher.update(pre_params.entropy());
        hasher.update(group.group_id().as_bytes());
        hasher.update(group.this_member().as_bytes());
        Self { reader: hasher.finalize_xof() }
    }

    fn next(&mut self) -> Scalar {
        let mut bytes = [0u8; 32];
        self.reader.fill(&mut bytes);
        <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(bytes))
    }

    fn polynomial(&mut self, len: usize) -> Vec<Scalar> {
        (0..len).map(|_| self.next()).collect()
    }
}

fn horner_scalar(coefficients: &[Scalar], x: &Scalar) -> Scalar {
    coefficients.iter().rev().fold(Scalar::ZERO, |acc, c| acc * x + c)
}

fn horner_point(coefficients: &[ProjectivePoint], x: &Scalar) -> ProjectivePoint {
    coefficients.iter().rev().fold(ProjectivePoint::IDENTITY, |acc, c| acc * x + c)
}

fn encode_message(message: &KeygenMessage) -> Result<Vec<u8>> {
    Ok(bincode::serialize(message)?)
}

fn decode_message(payload: &[u8]) -> Result<KeygenMessage> {
    bincode::deserialize(payload)
        .map_err(|err| OperatorError::protocol("keygen", format!("malformed round message: {}", err)))
}

pub(crate) fn encode_point(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

pub(crate) fn decode_point(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded = EncodedPoint::from_bytes(bytes)
        .map_err(|err| OperatorError::protocol("decode", format!("malformed curve point: {}", err)))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| OperatorError::protocol("decode", "curve point not on curve"))?;
    Ok(ProjectivePoint::from(affine))
}

pub(crate) fn decode_scalar(bytes: &[u8; 32]) -> Result<Scalar> {
    Option::<Scalar>::from(Scalar::from_repr(FieldBytes::from(*bytes)))
        .ok_or_else(|| OperatorError::protocol("decode", "scalar out of field range"))
}
