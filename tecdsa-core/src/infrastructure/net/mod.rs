//! Network provider contract.
//!
//! Two channel flavors: a named broadcast channel shared by every peer that
//! joined it, and a unicast channel to one specific peer. Channels carry
//! typed application messages; payloads whose type has no registered
//! unmarshaler are dropped with a warning. Handler dispatch never lets one
//! slow handler block delivery to the others.

mod local;

pub use local::{LocalNetworkHub, LocalProvider};

use crate::domain::NetMessage;
use crate::foundation::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Decodes a payload of one registered message type.
pub type Unmarshaler = Arc<dyn Fn(&[u8]) -> Result<Box<dyn NetMessage>> + Send + Sync>;

/// A message delivered to a channel handler, together with the
/// transport-level identity of its sender.
#[derive(Debug)]
pub struct InboundMessage {
    pub transport_sender_id: String,
    pub sender_public_key: Vec<u8>,
    pub message_type: String,
    pub message: Box<dyn NetMessage>,
}

/// A typed message handler. All handlers registered for a type fire on
/// every delivery of that type.
#[derive(Clone)]
pub struct HandleMessageFunc {
    pub message_type: String,
    pub handler: Arc<dyn Fn(Arc<InboundMessage>) + Send + Sync>,
}

#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, message: &dyn NetMessage) -> Result<()>;

    /// Registers the decoder for one message type. Re-registering a type
    /// replaces the previous unmarshaler.
    fn register_unmarshaler(&self, message_type: &str, unmarshaler: Unmarshaler);

    fn recv(&self, handler: HandleMessageFunc);

    /// Removes every handler registered for the type.
    fn unregister_recv(&self, message_type: &str);
}

#[async_trait]
pub trait UnicastChannel: Send + Sync {
    /// Transport id of the remote peer. The channel both sends to and
    /// receives from this peer only.
    fn remote_peer_id(&self) -> &str;

    async fn send(&self, message: &dyn NetMessage) -> Result<()>;

    fn register_unmarshaler(&self, message_type: &str, unmarshaler: Unmarshaler);

    fn recv(&self, handler: HandleMessageFunc);

    fn unregister_recv(&self, message_type: &str);
}

/// A peer's access to the network: broadcast channels by name, unicast
/// channels by peer id.
#[async_trait]
pub trait Provider: Send + Sync {
    /// This peer's transport identifier, derived from its network key.
    fn transport_id(&self) -> &str;

    /// This peer's network public key, attached to every sent message.
    fn public_key(&self) -> &[u8];

    async fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>>;

    /// Fails when the peer is unknown to the network.
    async fn unicast_channel_with(&self, peer_id: &str) -> Result<Arc<dyn UnicastChannel>>;
}
