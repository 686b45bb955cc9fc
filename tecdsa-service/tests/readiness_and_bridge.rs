use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tecdsa_core::application::{honest_majority_threshold, run_keygen, NetworkBridge, SessionOptions};
use tecdsa_core::domain::{GroupInfo, ProtocolMessage};
use tecdsa_core::foundation::{CancelToken, MemberId, OperatorError, SessionId};
use tecdsa_core::infrastructure::net::{LocalNetworkHub, LocalProvider, Provider};
use tecdsa_core::protocol::generate_pre_params;

struct Peer {
    provider: Arc<dyn Provider>,
    member_id: MemberId,
}

fn peer(hub: &Arc<LocalNetworkHub>) -> Peer {
    let key = SigningKey::random(&mut OsRng);
    let public_key = key.verifying_key().to_encoded_point(false).as_bytes().to_vec();
    let provider: Arc<dyn Provider> = LocalProvider::connect(hub.clone(), &public_key).expect("provider");
    let member_id = MemberId::from_transport_id(provider.transport_id()).expect("member id");
    Peer { provider, member_id }
}

fn group_for(peer_ids: &[MemberId], this: &MemberId, keep_id: &str) -> GroupInfo {
    let threshold = honest_majority_threshold(peer_ids.len());
    GroupInfo::new(keep_id, this.clone(), peer_ids.to_vec(), threshold).expect("group")
}

#[tokio::test(flavor = "multi_thread")]
async fn readiness_barrier_expires_when_a_member_never_joins() {
    let hub = LocalNetworkHub::new();
    let peers: Vec<Peer> = (0..3).map(|_| peer(&hub)).collect();
    let member_ids: Vec<MemberId> = peers.iter().map(|p| p.member_id.clone()).collect();

    let options = SessionOptions {
        ready_timeout: Duration::from_secs(2),
        protocol_timeout: Some(Duration::from_secs(10)),
    };
    let cancel = CancelToken::never();

    // The third member never announces readiness.
    let group_0 = group_for(&member_ids, &peers[0].member_id, "0xbarrier");
    let first = run_keygen(
        &peers[0].provider,
        &group_0,
        generate_pre_params(Duration::from_secs(5)).await.expect("pre-params"),
        &options,
        &cancel,
    );
    let group_1 = group_for(&member_ids, &peers[1].member_id, "0xbarrier");
    let second = run_keygen(
        &peers[1].provider,
        &group_1,
        generate_pre_params(Duration::from_secs(5)).await.expect("pre-params"),
        &options,
        &cancel,
    );

    let (first, second) = tokio::join!(first, second);
    for result in [first, second] {
        match result {
            Err(OperatorError::ReadinessTimeout { missing, .. }) => {
                assert!(missing.contains(&peers[2].member_id.to_string()));
            }
            other => panic!("expected readiness timeout, got {:?}", other.map(|_| ())),
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_broadcast_message_reaches_the_party_once() {
    let hub = LocalNetworkHub::new();
    let alice = peer(&hub);
    let bob = peer(&hub);
    let member_ids = vec![alice.member_id.clone(), bob.member_id.clone()];
    let session_id = SessionId::keygen("0xdedup");

    let (alice_bridge, _alice_streams) = NetworkBridge::connect(
        &alice.provider,
        &group_for(&member_ids, &alice.member_id, "0xdedup"),
        &session_id,
    )
    .await
    .expect("alice bridge");
    let (_bob_bridge, mut bob_streams) = NetworkBridge::connect(
        &bob.provider,
        &group_for(&member_ids, &bob.member_id, "0xdedup"),
        &session_id,
    )
    .await
    .expect("bob bridge");

    let message =
        ProtocolMessage::broadcast(session_id.clone(), alice.member_id.clone(), vec![1, 2, 3]);
    alice_bridge.deliver(&message).await;
    alice_bridge.deliver(&message).await;

    let delivered = tokio::time::timeout(Duration::from_secs(1), bob_streams.inbound.recv())
        .await
        .expect("timely")
        .expect("message");
    assert_eq!(delivered, message);

    assert!(
        tokio::time::timeout(Duration::from_millis(300), bob_streams.inbound.recv()).await.is_err(),
        "the duplicate must be suppressed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn messages_from_outside_the_group_are_never_forwarded() {
    let hub = LocalNetworkHub::new();
    let alice = peer(&hub);
    let bob = peer(&hub);
    let outsider = peer(&hub);
    let member_ids = vec![alice.member_id.clone(), bob.member_id.clone()];
    let session_id = SessionId::keygen("0xmembers");

    let (_bob_bridge, mut bob_streams) = NetworkBridge::connect(
        &bob.provider,
        &group_for(&member_ids, &bob.member_id, "0xmembers"),
        &session_id,
    )
    .await
    .expect("bob bridge");

    let channel = outsider.provider.broadcast_channel_for("0xmembers").await.expect("channel");

    // Honest outsider id: not a group member.
    let from_outsider =
        ProtocolMessage::broadcast(session_id.clone(), outsider.member_id.clone(), vec![1]);
    channel.send(&from_outsider).await.expect("send");

    // Spoofed sender: claims a member's id under the outsider's network key.
    let spoofed = ProtocolMessage::broadcast(session_id.clone(), alice.member_id.clone(), vec![2]);
    channel.send(&spoofed).await.expect("send");

    assert!(
        tokio::time::timeout(Duration::from_millis(300), bob_streams.inbound.recv()).await.is_err(),
        "neither outsider nor spoofed traffic may reach the party machine"
    );
}
