use crate::application::bridge::{BridgeStreams, NetworkBridge};
use crate::domain::{
    member_id_for_public_key, GroupInfo, NetMessage, ProtocolMessage, ReadyMessage, Signature,
    ThresholdSigner, READY_MESSAGE_TYPE,
};
use crate::foundation::{CancelToken, Digest32, MemberId, OperatorError, Result, SessionId};
use crate::infrastructure::net::{HandleMessageFunc, InboundMessage, Provider, Unmarshaler};
use crate::protocol::{KeygenMachine, Outgoing, PreParams, ProtocolMachine, SigningMachine, Step};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default bound on the pre-protocol readiness barrier.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

/// How often a member re-announces its readiness while the barrier is open.
/// Re-announcing closes the race where a peer joins the channel after our
/// first announcement.
const READY_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub ready_timeout: Duration,
    /// Overall protocol deadline surfaced as a round failure. The party
    /// machine's own semantics decide everything finer-grained.
    pub protocol_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { ready_timeout: DEFAULT_READY_TIMEOUT, protocol_timeout: None }
    }
}

/// Durable record of presignature consumption for one keep.
///
/// A presignature reused across two digests reveals the private key, so a
/// signing session reserves its presignature here, durably, before any
/// material derived from it leaves the process.
pub trait NonceLedger: Send + Sync {
    /// This member's next unused presignature index.
    fn cursor(&self) -> u64;

    /// Records that every presignature below `next_unused` is spent.
    fn reserve(&self, next_unused: u64) -> Result<()>;
}

/// Executes a distributed key generation session for the group. Key
/// generation needs every member: the barrier is strict.
pub async fn run_keygen(
    provider: &Arc<dyn Provider>,
    group: &GroupInfo,
    pre_params: PreParams,
    options: &SessionOptions,
    cancel: &CancelToken,
) -> Result<ThresholdSigner> {
    let session_id = SessionId::keygen(group.group_id());
    let mut machine = KeygenMachine::new(group, &pre_params)?;
    debug!(session = %session_id, group = %group.group_id(), "session initialized");
    let (bridge, mut streams) = NetworkBridge::connect(provider, group, &session_id).await?;

    let result = async {
        ready_barrier(&bridge, group, &session_id, options.ready_timeout, BarrierMode::Full, 0, cancel)
            .await?;
        info!(session = %session_id, "all members ready, starting party");
        drive(&bridge, group, &session_id, &mut machine, &mut streams, options, cancel).await
    }
    .await;

    bridge.close();
    log_outcome(&session_id, result.as_ref().err());
    result.map(|output| ThresholdSigner::new(group.clone(), output))
}

/// Executes a signature calculation session.
///
/// The barrier admits any quorum above the dishonest threshold, so signing
/// tolerates unresponsive members. Ready announcements negotiate the
/// presignature to spend (the highest index any ready member has reached),
/// and the index is durably reserved through the ledger before this
/// member's partial signature is released.
pub async fn run_signing(
    provider: &Arc<dyn Provider>,
    signer: &ThresholdSigner,
    digest: Digest32,
    options: &SessionOptions,
    ledger: &dyn NonceLedger,
    cancel: &CancelToken,
) -> Result<Signature> {
    let group = signer.group();
    let session_id = SessionId::signing(group.group_id(), &digest);
    let required = signer.keygen_output().dishonest_threshold + 1;
    debug!(session = %session_id, group = %group.group_id(), "session initialized");
    let (bridge, mut streams) = NetworkBridge::connect(provider, group, &session_id).await?;

    let result = async {
        let outcome = ready_barrier(
            &bridge,
            group,
            &session_id,
            options.ready_timeout,
            BarrierMode::Quorum { required },
            ledger.cursor(),
            cancel,
        )
        .await?;

        let available = signer.keygen_output().presignatures.len() as u64;
        if outcome.presignature_cursor >= available {
            return Err(OperatorError::protocol(
                "signing",
                format!(
                    "presignature pool exhausted ([{}] of [{}] spent); keep needs fresh key material",
                    outcome.presignature_cursor, available
                ),
            ));
        }
        ledger.reserve(outcome.presignature_cursor + 1)?;

        let mut machine = SigningMachine::new(signer, outcome.presignature_cursor as usize, digest)?;
        info!(
            session = %session_id,
            ready = outcome.ready_members,
            presignature = outcome.presignature_cursor,
            "quorum ready, starting party"
        );
        drive(&bridge, group, &session_id, &mut machine, &mut streams, options, cancel).await
    }
    .await;

    bridge.close();
    log_outcome(&session_id, result.as_ref().err());
    result.map(|output| Signature::from_protocol_output(output.r, output.s, output.recovery_byte))
}

fn log_outcome(session_id: &SessionId, error: Option<&OperatorError>) {
    match error {
        None => info!(session = %session_id, "session done"),
        Some(err) if err.is_cancelled() => debug!(session = %session_id, "session cancelled"),
        Some(err) => warn!(session = %session_id, %err, "session failed"),
    }
}

/// Session state machine: INIT (machine construction, already done by the
/// caller) → STARTED (readiness barrier passed, party machine running) →
/// DONE | FAILED. The first of result, protocol error, and cancellation is
/// terminal; the bridge is closed on every exit path.
async fn drive<M: ProtocolMachine>(
    bridge: &NetworkBridge,
    group: &GroupInfo,
    session_id: &SessionId,
    machine: &mut M,
    streams: &mut BridgeStreams,
    options: &SessionOptions,
    cancel: &CancelToken,
) -> Result<M::Output> {
    let deadline = options.protocol_timeout.map(|timeout| tokio::time::Instant::now() + timeout);
    let mut step = machine.start()?;

    loop {
        let outgoing = match step {
            Step::Finished(output) => return Ok(output),
            Step::Continue(outgoing) => outgoing,
        };
        for out in outgoing {
            bridge.deliver(&outgoing_to_message(session_id, group.this_member(), out)).await;
        }

        step = loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(OperatorError::Cancelled),
                _ = expired(deadline) => {
                    return Err(OperatorError::protocol(
                        "round",
                        format!("protocol timed out after {:?}", options.protocol_timeout.unwrap_or_default()),
                    ));
                }
                Some(err) = streams.errors.recv() => {
                    // Transport jitter alone never fails the session.
                    warn!(session = %session_id, %err, "transport error reported to session");
                }
                inbound = streams.inbound.recv() => {
                    let Some(message) = inbound else {
                        return Err(OperatorError::Message("bridge inbound stream closed".to_string()));
                    };
                    break machine.advance(&message.sender_id, &message.payload, message.is_broadcast)?;
                }
            }
        };
    }
}

fn outgoing_to_message(session_id: &SessionId, sender: &MemberId, outgoing: Outgoing) -> ProtocolMessage {
    match outgoing.receiver {
        None => ProtocolMessage::broadcast(session_id.clone(), sender.clone(), outgoing.payload),
        Some(receiver) => {
            ProtocolMessage::unicast(session_id.clone(), sender.clone(), receiver, outgoing.payload)
        }
    }
}

async fn expired(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[derive(Clone, Copy)]
enum BarrierMode {
    /// Every member must announce readiness; expiry fails the session.
    Full,
    /// All members are waited for, but at expiry the session proceeds if
    /// at least `required` members (including this one) are ready.
    Quorum { required: usize },
}

struct BarrierOutcome {
    ready_members: usize,
    presignature_cursor: u64,
}

/// Pre-protocol readiness barrier.
///
/// The underlying protocol rejects round-1 messages from parties that have
/// not started yet, so every member announces readiness on the session's
/// broadcast channel and waits for the barrier to complete before starting
/// its party machine. Expiry without the mode's quorum fails the session
/// before the party ever starts.
async fn ready_barrier(
    bridge: &NetworkBridge,
    group: &GroupInfo,
    session_id: &SessionId,
    timeout: Duration,
    mode: BarrierMode,
    own_cursor: u64,
    cancel: &CancelToken,
) -> Result<BarrierOutcome> {
    let total = group.members().len();
    let mut missing: HashSet<MemberId> = group.other_members().into_iter().collect();
    let mut cursor = own_cursor;
    if missing.is_empty() {
        return Ok(BarrierOutcome { ready_members: total, presignature_cursor: cursor });
    }

    let broadcast = bridge.broadcast_channel();
    let (ready_tx, mut ready_rx) = mpsc::unbounded_channel::<(MemberId, u64)>();

    let unmarshaler: Unmarshaler =
        Arc::new(|bytes| Ok(Box::new(ReadyMessage::unmarshal(bytes)?) as Box<dyn NetMessage>));
    broadcast.register_unmarshaler(READY_MESSAGE_TYPE, unmarshaler);
    broadcast.recv(ready_handler(group, session_id, ready_tx));

    let announcement = ReadyMessage {
        session_id: session_id.clone(),
        sender_id: group.this_member().clone(),
        presignature_cursor: own_cursor,
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let mut announce = tokio::time::interval(READY_ANNOUNCE_INTERVAL);

    let result = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Err(OperatorError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                let ready = total - missing.len();
                match mode {
                    BarrierMode::Quorum { required } if ready >= required => {
                        debug!(session = %session_id, ready, total, "proceeding with ready quorum");
                        break Ok(BarrierOutcome { ready_members: ready, presignature_cursor: cursor });
                    }
                    _ => {
                        let missing_ids =
                            missing.iter().map(|m| m.to_string()).collect::<Vec<_>>().join(", ");
                        break Err(OperatorError::ReadinessTimeout {
                            waited_secs: timeout.as_secs(),
                            missing: missing_ids,
                        });
                    }
                }
            }
            _ = announce.tick() => {
                if let Err(err) = broadcast.send(&announcement).await {
                    warn!(session = %session_id, %err, "failed to announce readiness");
                }
            }
            Some((member, member_cursor)) = ready_rx.recv() => {
                debug!(session = %session_id, member = %member, cursor = member_cursor, "member ready");
                cursor = cursor.max(member_cursor);
                missing.remove(&member);
                if missing.is_empty() {
                    break Ok(BarrierOutcome { ready_members: total, presignature_cursor: cursor });
                }
            }
        }
    };

    broadcast.unregister_recv(READY_MESSAGE_TYPE);
    result
}

fn ready_handler(
    group: &GroupInfo,
    session_id: &SessionId,
    ready_tx: mpsc::UnboundedSender<(MemberId, u64)>,
) -> HandleMessageFunc {
    let group = group.clone();
    let session_id = session_id.clone();
    let this_member = group.this_member().clone();

    HandleMessageFunc {
        message_type: READY_MESSAGE_TYPE.to_string(),
        handler: Arc::new(move |inbound: Arc<InboundMessage>| {
            let Some(ready) = inbound.message.as_any().downcast_ref::<ReadyMessage>() else {
                return;
            };
            if ready.session_id != session_id || ready.sender_id == this_member {
                return;
            }
            if !group.contains(&ready.sender_id) {
                warn!(session = %session_id, sender = %ready.sender_id, "ready from party outside the group");
                return;
            }
            match member_id_for_public_key(&inbound.sender_public_key) {
                Ok(derived) if derived == ready.sender_id => {
                    let _ = ready_tx.send((ready.sender_id.clone(), ready.presignature_cursor));
                }
                _ => {
                    warn!(session = %session_id, sender = %ready.sender_id, "ready with mismatched sender identity");
                }
            }
        }),
    }
}
