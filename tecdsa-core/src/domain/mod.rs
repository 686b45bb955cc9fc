mod group;
mod message;
mod signature;
mod signer;

pub use group::GroupInfo;
pub use message::{NetMessage, ProtocolMessage, ReadyMessage, PROTOCOL_MESSAGE_TYPE, READY_MESSAGE_TYPE};
pub use signature::{
    encode_public_key, keccak_address, member_id_for_public_key, recover_address, Signature,
};
pub use signer::{KeygenOutput, Presignature, ThresholdSigner};
