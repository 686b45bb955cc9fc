//! Threshold-protocol party machines.
//!
//! The session engine drives a [`ProtocolMachine`]: a single participant's
//! state machine that reacts to inbound round messages with outbound ones
//! and eventually returns a value. Messages are opaque byte payloads
//! addressed by member id; routing, validation, and deduplication live in
//! the network bridge.

mod keygen;
mod preparams;
mod signing;

pub use keygen::KeygenMachine;
pub use preparams::{generate_pre_params, PreParams, DEFAULT_PRE_PARAMS_GENERATION_TIMEOUT};
pub use signing::{SigningMachine, SigningOutput};

use crate::domain::GroupInfo;
use crate::foundation::{MemberId, OperatorError, Result};
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::Field;
use k256::{FieldBytes, Scalar, U256};

/// A message produced by a party machine. Broadcast when `receiver` is
/// absent, point-to-point otherwise.
#[derive(Clone, Debug)]
pub struct Outgoing {
    pub receiver: Option<MemberId>,
    pub payload: Vec<u8>,
}

impl Outgoing {
    pub fn broadcast(payload: Vec<u8>) -> Self {
        Self { receiver: None, payload }
    }

    pub fn unicast(receiver: MemberId, payload: Vec<u8>) -> Self {
        Self { receiver: Some(receiver), payload }
    }
}

/// Result of advancing a party machine by one inbound message.
#[derive(Debug)]
pub enum Step<O> {
    /// The protocol continues; the messages must be delivered.
    Continue(Vec<Outgoing>),
    /// The protocol reached its terminal output for this participant.
    Finished(O),
}

/// One participant's view of a round-based threshold protocol.
///
/// `start` must be called exactly once, after every participant is known to
/// be listening; `advance` feeds one validated inbound message. Any error is
/// fatal for the session; machines are never reused after a failure.
pub trait ProtocolMachine: Send {
    type Output: Send;

    fn start(&mut self) -> Result<Step<Self::Output>>;

    fn advance(&mut self, from: &MemberId, payload: &[u8], is_broadcast: bool) -> Result<Step<Self::Output>>;
}

/// Converts a member id into its cryptographic party index: the id's
/// big-endian integer value reduced into the curve's scalar field. Rejects
/// ids whose integer form is not strictly positive.
pub fn party_scalar(member: &MemberId) -> Result<Scalar> {
    if !member.is_positive() {
        return Err(OperatorError::InvalidMember(member.to_string()));
    }
    let bytes = member.as_bytes();
    if bytes.len() > 32 {
        return Err(OperatorError::InvalidMember(member.to_string()));
    }
    let mut padded = [0u8; 32];
    padded[32 - bytes.len()..].copy_from_slice(bytes);
    let scalar = <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(padded));
    if bool::from(scalar.is_zero()) {
        return Err(OperatorError::InvalidMember(member.to_string()));
    }
    Ok(scalar)
}

/// Party indices for a whole group, in canonical member order.
pub fn generate_party_indices(group: &GroupInfo) -> Result<Vec<(MemberId, Scalar)>> {
    group.sorted_members().into_iter().map(|member| Ok((member.clone(), party_scalar(&member)?))).collect()
}

/// Lagrange coefficients for evaluating a polynomial at zero, given the
/// evaluation points.
pub(crate) fn lagrange_coefficients_at_zero(points: &[Scalar]) -> Result<Vec<Scalar>> {
    let mut coefficients = Vec::with_capacity(points.len());
    for (i, x_i) in points.iter().enumerate() {
        let mut coefficient = Scalar::ONE;
        for (j, x_j) in points.iter().enumerate() {
            if i == j {
                continue;
            }
            let denominator = *x_j - x_i;
            let inverted = Option::<Scalar>::from(denominator.invert()).ok_or_else(|| {
                OperatorError::protocol("interpolation", "duplicate party indices")
            })?;
            coefficient *= *x_j * inverted;
        }
        coefficients.push(coefficient);
    }
    Ok(coefficients)
}

/// Interpolates a shared polynomial at zero from `(index, value)` points.
pub(crate) fn interpolate_at_zero(points: &[(Scalar, Scalar)]) -> Result<Scalar> {
    let indices: Vec<Scalar> = points.iter().map(|(x, _)| *x).collect();
    let lambdas = lagrange_coefficients_at_zero(&indices)?;
    Ok(points.iter().zip(lambdas).fold(Scalar::ZERO, |acc, ((_, value), lambda)| acc + lambda * value))
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::{BTreeMap, VecDeque};

    /// Drives a set of machines to completion by synchronously shuttling
    /// every produced message to its addressees.
    pub fn run_machines<M: ProtocolMachine>(
        machines: &mut BTreeMap<MemberId, M>,
    ) -> Result<BTreeMap<MemberId, M::Output>> {
        let ids: Vec<MemberId> = machines.keys().cloned().collect();
        let mut queue: VecDeque<(MemberId, Outgoing)> = VecDeque::new();
        let mut outputs = BTreeMap::new();

        for id in &ids {
            let machine = machines.get_mut(id).expect("machine");
            match machine.start()? {
                Step::Continue(outgoing) => {
                    queue.extend(outgoing.into_iter().map(|o| (id.clone(), o)));
                }
                Step::Finished(output) => {
                    outputs.insert(id.clone(), output);
                }
            }
        }

        while let Some((from, outgoing)) = queue.pop_front() {
            let is_broadcast = outgoing.receiver.is_none();
            let targets: Vec<MemberId> = match &outgoing.receiver {
                Some(receiver) => vec![receiver.clone()],
                None => ids.iter().filter(|id| **id != from).cloned().collect(),
            };
            for target in targets {
                if outputs.contains_key(&target) {
                    continue;
                }
                let Some(machine) = machines.get_mut(&target) else { continue };
                match machine.advance(&from, &outgoing.payload, is_broadcast)? {
                    Step::Continue(next) => {
                        queue.extend(next.into_iter().map(|o| (target.clone(), o)));
                    }
                    Step::Finished(output) => {
                        outputs.insert(target.clone(), output);
                    }
                }
            }
        }

        Ok(outputs)
    }
}
