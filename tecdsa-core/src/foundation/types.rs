use crate::foundation::OperatorError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A 32-byte digest to be signed. The engine signs it as-is, it never hashes.
pub type Digest32 = [u8; 32];

/// A 20-byte chain-level address. Used both for keeps and for operators.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Address([u8; 20]);

impl Address {
    pub const fn new(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl FromStr for Address {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(stripped)?;
        let bytes: [u8; 20] = bytes
            .try_into()
            .map_err(|_| OperatorError::Config(format!("address [{}] is not a valid 20-byte hex address", s)))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 20]> for Address {
    fn from(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_string())
        } else {
            self.0.serialize(serializer)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            s.parse().map_err(serde::de::Error::custom)
        } else {
            let bytes = <[u8; 20]>::deserialize(deserializer)?;
            Ok(Self(bytes))
        }
    }
}

/// Unique identifier of one signing group member.
///
/// A member id is a non-empty byte string that is also interpretable as a
/// strictly positive big-endian integer; the integer form doubles as the
/// member's cryptographic party index. Operators derive it from their
/// long-term network public key, so two operators never share an id.
#[derive(Clone, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemberId(Vec<u8>);

impl MemberId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True when the big-endian integer form is strictly greater than zero.
    pub fn is_positive(&self) -> bool {
        !self.0.is_empty() && self.0.iter().any(|b| *b != 0)
    }

    /// Transport-level identifier of the peer owning this member id.
    pub fn transport_id(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn from_transport_id(id: &str) -> Result<Self, OperatorError> {
        Ok(Self(hex::decode(id)?))
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl From<Address> for MemberId {
    fn from(address: Address) -> Self {
        Self(address.as_bytes().to_vec())
    }
}

impl PartialOrd for MemberId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MemberId {
    /// Orders member ids by their big-endian integer value, so canonical
    /// member ordering matches the integer party-index ordering regardless
    /// of leading zero bytes.
    fn cmp(&self, other: &Self) -> Ordering {
        let a = strip_leading_zeros(&self.0);
        let b = strip_leading_zeros(&other.0);
        a.len().cmp(&b.len()).then_with(|| a.cmp(b)).then_with(|| self.0.cmp(&other.0))
    }
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}

/// Identifier of one protocol session (one DKG or one signing run).
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn keygen(group_id: &str) -> Self {
        Self(format!("{}/keygen", group_id))
    }

    pub fn signing(group_id: &str, digest: &Digest32) -> Self {
        Self(format!("{}/sign/{}", group_id, hex::encode(&digest[..8])))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
