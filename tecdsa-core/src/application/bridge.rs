use crate::domain::{member_id_for_public_key, GroupInfo, NetMessage, ProtocolMessage, PROTOCOL_MESSAGE_TYPE};
use crate::foundation::{MemberId, OperatorError, Result, SessionId};
use crate::infrastructure::net::{BroadcastChannel, HandleMessageFunc, InboundMessage, Provider, UnicastChannel};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// The bridge's two outward-facing streams: validated inbound protocol
/// messages for the party machine, and non-fatal transport errors.
pub struct BridgeStreams {
    pub inbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    pub errors: mpsc::UnboundedReceiver<OperatorError>,
}

/// Glue between a party machine and the network provider.
///
/// For one session the bridge owns the keep's broadcast channel and one
/// unicast channel per other group member. It routes outgoing protocol
/// messages, and validates, deduplicates, and forwards inbound ones.
/// Transport trouble is reported on the error stream but never terminates
/// the session; the party machine's own round handling decides what a
/// missing message means.
pub struct NetworkBridge {
    group: GroupInfo,
    session_id: SessionId,
    broadcast: Arc<dyn BroadcastChannel>,
    unicast: HashMap<MemberId, Arc<dyn UnicastChannel>>,
    errors_tx: mpsc::UnboundedSender<OperatorError>,
    closed: Arc<AtomicBool>,
}

impl NetworkBridge {
    /// Opens all channels for the session and wires inbound delivery.
    pub async fn connect(
        provider: &Arc<dyn Provider>,
        group: &GroupInfo,
        session_id: &SessionId,
    ) -> Result<(Self, BridgeStreams)> {
        let broadcast = provider.broadcast_channel_for(group.group_id()).await?;

        let mut unicast = HashMap::new();
        for member in group.other_members() {
            let channel = provider.unicast_channel_with(&member.transport_id()).await?;
            unicast.insert(member, channel);
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let seen = Arc::new(Mutex::new(HashSet::new()));

        let handler = inbound_handler(group, session_id, inbound_tx, closed.clone(), seen);
        let unmarshaler: crate::infrastructure::net::Unmarshaler =
            Arc::new(|bytes| Ok(Box::new(ProtocolMessage::unmarshal(bytes)?) as Box<dyn NetMessage>));

        broadcast.register_unmarshaler(PROTOCOL_MESSAGE_TYPE, unmarshaler.clone());
        broadcast.recv(handler.clone());
        for channel in unicast.values() {
            channel.register_unmarshaler(PROTOCOL_MESSAGE_TYPE, unmarshaler.clone());
            channel.recv(handler.clone());
        }

        let bridge = Self {
            group: group.clone(),
            session_id: session_id.clone(),
            broadcast,
            unicast,
            errors_tx,
            closed,
        };
        Ok((bridge, BridgeStreams { inbound: inbound_rx, errors: errors_rx }))
    }

    pub fn broadcast_channel(&self) -> &Arc<dyn BroadcastChannel> {
        &self.broadcast
    }

    /// Sends one outgoing protocol message. Failures are reported on the
    /// error stream; the session keeps running.
    pub async fn deliver(&self, message: &ProtocolMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let result = if message.is_broadcast {
            self.broadcast.send(message).await
        } else {
            match message.receiver_id.as_ref().and_then(|receiver| self.unicast.get(receiver)) {
                Some(channel) => channel.send(message).await,
                None => Err(OperatorError::transport(
                    "route protocol message",
                    format!(
                        "no unicast channel for receiver [{}]",
                        message.receiver_id.as_ref().map(|m| m.to_string()).unwrap_or_default()
                    ),
                )),
            }
        };

        if let Err(err) = result {
            warn!(session = %self.session_id, %err, "protocol message send failed");
            let _ = self.errors_tx.send(err);
        }
    }

    /// Unregisters all handlers and releases channel references. No message
    /// is accepted after close.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.broadcast.unregister_recv(PROTOCOL_MESSAGE_TYPE);
        for channel in self.unicast.values() {
            channel.unregister_recv(PROTOCOL_MESSAGE_TYPE);
        }
        debug!(session = %self.session_id, group = %self.group.group_id(), "network bridge closed");
    }
}

/// Builds the shared inbound handler: sender validation, duplicate
/// suppression, and forwarding into the party machine's mailbox.
fn inbound_handler(
    group: &GroupInfo,
    session_id: &SessionId,
    inbound_tx: mpsc::UnboundedSender<ProtocolMessage>,
    closed: Arc<AtomicBool>,
    seen: Arc<Mutex<HashSet<[u8; 32]>>>,
) -> HandleMessageFunc {
    let group = group.clone();
    let session_id = session_id.clone();
    let this_member = group.this_member().clone();

    HandleMessageFunc {
        message_type: PROTOCOL_MESSAGE_TYPE.to_string(),
        handler: Arc::new(move |inbound: Arc<InboundMessage>| {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let Some(message) = inbound.message.as_any().downcast_ref::<ProtocolMessage>() else {
                return;
            };
            if message.session_id != session_id {
                return;
            }
            if message.sender_id == this_member {
                return;
            }
            if let Some(receiver) = &message.receiver_id {
                if receiver != &this_member {
                    return;
                }
            }
            if !group.contains(&message.sender_id) {
                warn!(
                    session = %session_id,
                    sender = %message.sender_id,
                    "dropping protocol message from party outside the group"
                );
                return;
            }
            match member_id_for_public_key(&inbound.sender_public_key) {
                Ok(derived) if derived == message.sender_id => {}
                Ok(derived) => {
                    warn!(
                        session = %session_id,
                        claimed = %message.sender_id,
                        derived = %derived,
                        "dropping protocol message with mismatched sender identity"
                    );
                    return;
                }
                Err(err) => {
                    warn!(session = %session_id, %err, "dropping protocol message with invalid sender key");
                    return;
                }
            }

            let key = dedup_key(message);
            {
                let mut seen = seen.lock().expect("dedup lock");
                if !seen.insert(key) {
                    debug!(session = %session_id, sender = %message.sender_id, "duplicate protocol message suppressed");
                    return;
                }
            }

            let _ = inbound_tx.send(message.clone());
        }),
    }
}

fn dedup_key(message: &ProtocolMessage) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(message.sender_id.as_bytes());
    hasher.update(&[message.is_broadcast as u8]);
    hasher.update(&message.payload);
    *hasher.finalize().as_bytes()
}
