use crate::domain::{member_id_for_public_key, NetMessage};
use crate::foundation::{OperatorError, Result};
use crate::infrastructure::net::{
    BroadcastChannel, HandleMessageFunc, InboundMessage, Provider, UnicastChannel, Unmarshaler,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

const BROADCAST_TOPIC_CAPACITY: usize = 1024;

/// An envelope as it travels through the in-process network.
#[derive(Clone, Debug)]
struct WireEnvelope {
    channel_name: String,
    sender_transport_id: String,
    sender_public_key: Vec<u8>,
    message_type: String,
    payload: Vec<u8>,
}

/// In-process network fabric shared by every [`LocalProvider`] of one run.
/// Broadcast topics are keyed by channel name, unicast delivery goes through
/// one FIFO queue per registered peer.
pub struct LocalNetworkHub {
    topics: Mutex<HashMap<String, broadcast::Sender<WireEnvelope>>>,
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<WireEnvelope>>>,
}

impl LocalNetworkHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { topics: Mutex::new(HashMap::new()), peers: Mutex::new(HashMap::new()) })
    }

    fn topic(&self, name: &str) -> broadcast::Sender<WireEnvelope> {
        let mut topics = self.topics.lock().expect("topics lock");
        topics.entry(name.to_string()).or_insert_with(|| broadcast::channel(BROADCAST_TOPIC_CAPACITY).0).clone()
    }

    fn register_peer(&self, transport_id: &str, sender: mpsc::UnboundedSender<WireEnvelope>) {
        self.peers.lock().expect("peers lock").insert(transport_id.to_string(), sender);
    }

    fn peer_sender(&self, transport_id: &str) -> Option<mpsc::UnboundedSender<WireEnvelope>> {
        self.peers.lock().expect("peers lock").get(transport_id).cloned()
    }
}

struct HandlerEntry {
    message_type: String,
    queue: mpsc::UnboundedSender<Arc<InboundMessage>>,
}

/// Per-channel unmarshaler and handler registry. Each handler drains its own
/// queue on its own task, so a slow handler only ever delays itself.
struct Registry {
    unmarshalers: Mutex<HashMap<String, Unmarshaler>>,
    handlers: Mutex<Vec<HandlerEntry>>,
}

impl Registry {
    fn new() -> Arc<Self> {
        Arc::new(Self { unmarshalers: Mutex::new(HashMap::new()), handlers: Mutex::new(Vec::new()) })
    }

    fn register_unmarshaler(&self, message_type: &str, unmarshaler: Unmarshaler) {
        self.unmarshalers.lock().expect("unmarshalers lock").insert(message_type.to_string(), unmarshaler);
    }

    fn recv(&self, handler: HandleMessageFunc) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<InboundMessage>>();
        let callback = handler.handler.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                callback(message);
            }
        });
        self.handlers
            .lock()
            .expect("handlers lock")
            .push(HandlerEntry { message_type: handler.message_type, queue: tx });
    }

    fn unregister_recv(&self, message_type: &str) {
        self.handlers.lock().expect("handlers lock").retain(|entry| entry.message_type != message_type);
    }

    fn dispatch(&self, envelope: WireEnvelope) {
        let unmarshaler = {
            let unmarshalers = self.unmarshalers.lock().expect("unmarshalers lock");
            unmarshalers.get(&envelope.message_type).cloned()
        };
        let Some(unmarshaler) = unmarshaler else {
            warn!(
                message_type = %envelope.message_type,
                sender = %envelope.sender_transport_id,
                "dropping message with no registered unmarshaler"
            );
            return;
        };

        let message = match unmarshaler(&envelope.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(
                    message_type = %envelope.message_type,
                    sender = %envelope.sender_transport_id,
                    %err,
                    "dropping undecodable message"
                );
                return;
            }
        };

        let inbound = Arc::new(InboundMessage {
            transport_sender_id: envelope.sender_transport_id,
            sender_public_key: envelope.sender_public_key,
            message_type: envelope.message_type,
            message,
        });
        let handlers = self.handlers.lock().expect("handlers lock");
        for entry in handlers.iter().filter(|entry| entry.message_type == inbound.message_type) {
            let _ = entry.queue.send(inbound.clone());
        }
    }
}

/// In-process implementation of the network [`Provider`], used by local runs
/// and the test suite. The peer's transport id is the chain address derived
/// from its network public key.
///
/// Every `unicast_channel_with` call yields a fresh channel with its own
/// handler registry; inbound traffic from a peer fans out to every live
/// channel opened towards that peer. Sessions running concurrently on
/// different keeps never disturb each other's registrations.
pub struct LocalProvider {
    hub: Arc<LocalNetworkHub>,
    transport_id: String,
    public_key: Vec<u8>,
    broadcast_channels: Mutex<HashMap<String, Arc<LocalBroadcastChannel>>>,
    unicast_channels: Arc<Mutex<HashMap<String, Vec<Weak<LocalUnicastChannel>>>>>,
}

impl LocalProvider {
    pub fn connect(hub: Arc<LocalNetworkHub>, network_public_key: &[u8]) -> Result<Arc<Self>> {
        let member = member_id_for_public_key(network_public_key)?;
        let transport_id = member.transport_id();

        let (tx, mut rx) = mpsc::unbounded_channel::<WireEnvelope>();
        hub.register_peer(&transport_id, tx);

        let unicast_channels: Arc<Mutex<HashMap<String, Vec<Weak<LocalUnicastChannel>>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let dispatcher_channels = unicast_channels.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                let live: Vec<Arc<LocalUnicastChannel>> = {
                    let mut channels = dispatcher_channels.lock().expect("unicast channels lock");
                    match channels.get_mut(&envelope.sender_transport_id) {
                        Some(entries) => {
                            entries.retain(|weak| weak.strong_count() > 0);
                            entries.iter().filter_map(Weak::upgrade).collect()
                        }
                        None => Vec::new(),
                    }
                };
                if live.is_empty() {
                    debug!(
                        sender = %envelope.sender_transport_id,
                        "dropping unicast message from peer with no open channel"
                    );
                    continue;
                }
                for channel in live {
                    channel.registry.dispatch(envelope.clone());
                }
            }
        });

        Ok(Arc::new(Self {
            hub,
            transport_id,
            public_key: network_public_key.to_vec(),
            broadcast_channels: Mutex::new(HashMap::new()),
            unicast_channels,
        }))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    fn transport_id(&self) -> &str {
        &self.transport_id
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    async fn broadcast_channel_for(&self, name: &str) -> Result<Arc<dyn BroadcastChannel>> {
        {
            let channels = self.broadcast_channels.lock().expect("broadcast channels lock");
            if let Some(channel) = channels.get(name) {
                return Ok(channel.clone());
            }
        }

        let topic = self.hub.topic(name);
        let registry = Registry::new();
        let mut receiver = topic.subscribe();
        let reader_registry = registry.clone();
        let channel_name = name.to_string();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(envelope) => {
                        if envelope.channel_name == channel_name {
                            reader_registry.dispatch(envelope);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %channel_name, skipped, "broadcast channel receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        let channel = Arc::new(LocalBroadcastChannel {
            name: name.to_string(),
            topic,
            registry,
            sender_transport_id: self.transport_id.clone(),
            sender_public_key: self.public_key.clone(),
        });
        let mut channels = self.broadcast_channels.lock().expect("broadcast channels lock");
        Ok(channels.entry(name.to_string()).or_insert(channel).clone())
    }

    async fn unicast_channel_with(&self, peer_id: &str) -> Result<Arc<dyn UnicastChannel>> {
        let remote = self
            .hub
            .peer_sender(peer_id)
            .ok_or_else(|| OperatorError::UnknownPeer(peer_id.to_string()))?;
        let channel = Arc::new(LocalUnicastChannel {
            remote_peer_id: peer_id.to_string(),
            remote,
            registry: Registry::new(),
            sender_transport_id: self.transport_id.clone(),
            sender_public_key: self.public_key.clone(),
        });
        let mut channels = self.unicast_channels.lock().expect("unicast channels lock");
        channels.entry(peer_id.to_string()).or_default().push(Arc::downgrade(&channel));
        Ok(channel)
    }
}

struct LocalBroadcastChannel {
    name: String,
    topic: broadcast::Sender<WireEnvelope>,
    registry: Arc<Registry>,
    sender_transport_id: String,
    sender_public_key: Vec<u8>,
}

#[async_trait]
impl BroadcastChannel for LocalBroadcastChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, message: &dyn NetMessage) -> Result<()> {
        let envelope = WireEnvelope {
            channel_name: self.name.clone(),
            sender_transport_id: self.sender_transport_id.clone(),
            sender_public_key: self.sender_public_key.clone(),
            message_type: message.type_tag().to_string(),
            payload: message.marshal()?,
        };
        // A topic with no subscribed peers is not an error.
        let _ = self.topic.send(envelope);
        Ok(())
    }

    fn register_unmarshaler(&self, message_type: &str, unmarshaler: Unmarshaler) {
        self.registry.register_unmarshaler(message_type, unmarshaler);
    }

    fn recv(&self, handler: HandleMessageFunc) {
        self.registry.recv(handler);
    }

    fn unregister_recv(&self, message_type: &str) {
        self.registry.unregister_recv(message_type);
    }
}

struct LocalUnicastChannel {
    remote_peer_id: String,
    remote: mpsc::UnboundedSender<WireEnvelope>,
    registry: Arc<Registry>,
    sender_transport_id: String,
    sender_public_key: Vec<u8>,
}

#[async_trait]
impl UnicastChannel for LocalUnicastChannel {
    fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    async fn send(&self, message: &dyn NetMessage) -> Result<()> {
        let envelope = WireEnvelope {
            channel_name: String::new(),
            sender_transport_id: self.sender_transport_id.clone(),
            sender_public_key: self.sender_public_key.clone(),
            message_type: message.type_tag().to_string(),
            payload: message.marshal()?,
        };
        self.remote
            .send(envelope)
            .map_err(|_| OperatorError::transport("unicast send", format!("peer [{}] is gone", self.remote_peer_id)))
    }

    fn register_unmarshaler(&self, message_type: &str, unmarshaler: Unmarshaler) {
        self.registry.register_unmarshaler(message_type, unmarshaler);
    }

    fn recv(&self, handler: HandleMessageFunc) {
        self.registry.recv(handler);
    }

    fn unregister_recv(&self, message_type: &str) {
        self.registry.unregister_recv(message_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ReadyMessage, READY_MESSAGE_TYPE};
    use crate::foundation::SessionId;
    use k256::ecdsa::SigningKey;
    use k256::elliptic_curve::sec1::ToEncodedPoint;
    use rand_core::OsRng;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    fn network_key() -> Vec<u8> {
        SigningKey::random(&mut OsRng).verifying_key().to_encoded_point(false).as_bytes().to_vec()
    }

    fn ready_unmarshaler() -> Unmarshaler {
        Arc::new(|bytes| Ok(Box::new(ReadyMessage::unmarshal(bytes)?) as Box<dyn NetMessage>))
    }

    fn collecting_handler() -> (HandleMessageFunc, mpsc::UnboundedReceiver<Arc<InboundMessage>>) {
        let (tx, rx) = unbounded_channel();
        let handler = HandleMessageFunc {
            message_type: READY_MESSAGE_TYPE.to_string(),
            handler: Arc::new(move |message| {
                let _ = tx.send(message);
            }),
        };
        (handler, rx)
    }

    fn ready(sender: &Arc<LocalProvider>) -> ReadyMessage {
        ReadyMessage {
            session_id: SessionId::keygen("test"),
            sender_id: crate::foundation::MemberId::from_transport_id(sender.transport_id()).expect("id"),
            presignature_cursor: 0,
        }
    }

    #[tokio::test]
    async fn broadcast_delivers_to_joined_peers() {
        let hub = LocalNetworkHub::new();
        let alice = LocalProvider::connect(hub.clone(), &network_key()).expect("alice");
        let bob = LocalProvider::connect(hub.clone(), &network_key()).expect("bob");

        let alice_channel = alice.broadcast_channel_for("keep").await.expect("channel");
        let bob_channel = bob.broadcast_channel_for("keep").await.expect("channel");
        bob_channel.register_unmarshaler(READY_MESSAGE_TYPE, ready_unmarshaler());
        let (handler, mut rx) = collecting_handler();
        bob_channel.recv(handler);

        alice_channel.send(&ready(&alice)).await.expect("send");

        let delivered = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("message");
        assert_eq!(delivered.transport_sender_id, alice.transport_id());
        assert_eq!(delivered.sender_public_key, alice.public_key());
        let decoded = delivered.message.as_any().downcast_ref::<ReadyMessage>().expect("typed");
        assert_eq!(decoded.sender_id.transport_id(), alice.transport_id());
    }

    #[tokio::test]
    async fn unregistered_type_is_dropped() {
        let hub = LocalNetworkHub::new();
        let alice = LocalProvider::connect(hub.clone(), &network_key()).expect("alice");
        let bob = LocalProvider::connect(hub.clone(), &network_key()).expect("bob");

        let alice_channel = alice.broadcast_channel_for("keep").await.expect("channel");
        let bob_channel = bob.broadcast_channel_for("keep").await.expect("channel");
        // No unmarshaler registered on bob's side.
        let (handler, mut rx) = collecting_handler();
        bob_channel.recv(handler);

        alice_channel.send(&ready(&alice)).await.expect("send");
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn all_handlers_of_a_type_fire() {
        let hub = LocalNetworkHub::new();
        let alice = LocalProvider::connect(hub.clone(), &network_key()).expect("alice");
        let bob = LocalProvider::connect(hub.clone(), &network_key()).expect("bob");

        let alice_channel = alice.broadcast_channel_for("keep").await.expect("channel");
        let bob_channel = bob.broadcast_channel_for("keep").await.expect("channel");
        bob_channel.register_unmarshaler(READY_MESSAGE_TYPE, ready_unmarshaler());
        let (first, mut first_rx) = collecting_handler();
        let (second, mut second_rx) = collecting_handler();
        bob_channel.recv(first);
        bob_channel.recv(second);

        alice_channel.send(&ready(&alice)).await.expect("send");

        tokio::time::timeout(Duration::from_secs(1), first_rx.recv()).await.expect("timely").expect("first");
        tokio::time::timeout(Duration::from_secs(1), second_rx.recv()).await.expect("timely").expect("second");
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let hub = LocalNetworkHub::new();
        let alice = LocalProvider::connect(hub.clone(), &network_key()).expect("alice");
        let bob = LocalProvider::connect(hub.clone(), &network_key()).expect("bob");

        let alice_channel = alice.broadcast_channel_for("keep").await.expect("channel");
        let bob_channel = bob.broadcast_channel_for("keep").await.expect("channel");
        bob_channel.register_unmarshaler(READY_MESSAGE_TYPE, ready_unmarshaler());
        let (handler, mut rx) = collecting_handler();
        bob_channel.recv(handler);
        bob_channel.unregister_recv(READY_MESSAGE_TYPE);

        alice_channel.send(&ready(&alice)).await.expect("send");
        assert!(tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn unicast_delivers_in_order_and_rejects_unknown_peer() {
        let hub = LocalNetworkHub::new();
        let alice = LocalProvider::connect(hub.clone(), &network_key()).expect("alice");
        let bob = LocalProvider::connect(hub.clone(), &network_key()).expect("bob");

        assert!(matches!(
            alice.unicast_channel_with("00ff").await.map(|_| ()),
            Err(OperatorError::UnknownPeer(_))
        ));

        let to_bob = alice.unicast_channel_with(bob.transport_id()).await.expect("channel");
        let from_alice = bob.unicast_channel_with(alice.transport_id()).await.expect("channel");
        from_alice.register_unmarshaler(READY_MESSAGE_TYPE, ready_unmarshaler());
        let (handler, mut rx) = collecting_handler();
        from_alice.recv(handler);

        for n in 0..5u8 {
            let message = ReadyMessage {
                session_id: SessionId::keygen(&format!("session-{}", n)),
                sender_id: crate::foundation::MemberId::new(vec![n + 1]),
                presignature_cursor: 0,
            };
            to_bob.send(&message).await.expect("send");
        }

        for n in 0..5u8 {
            let delivered =
                tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.expect("timely").expect("message");
            let decoded = delivered.message.as_any().downcast_ref::<ReadyMessage>().expect("typed");
            assert_eq!(decoded.sender_id, crate::foundation::MemberId::new(vec![n + 1]));
        }
    }
}
